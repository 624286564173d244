//! Abstract syntax trees consumed by the compiler.
//!
//! Trees are produced by an external front end. In-process callers build
//! them with the constructor helpers on [`Node`]; other processes hand them
//! over as JSON, where every node carries a `kind` tag:
//!
//! ```json
//! {"kind": "binary", "op": "+", "left": {"kind": "constant", "value": 1},
//!  "right": {"kind": "variable", "name": "x"}}
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::vm::Value;

/// Errors raised while loading a tree.
#[derive(Debug, Error)]
pub enum AstError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid syntax tree: {0}")]
    Json(#[from] serde_json::Error),
}

/// Binary operator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Sub,
    #[serde(rename = "*")]
    Mul,
    #[serde(rename = "/")]
    Div,
    #[serde(rename = "%")]
    Mod,
    #[serde(rename = "**")]
    Pow,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "&")]
    And,
    #[serde(rename = "|")]
    Or,
    #[serde(rename = "^")]
    Xor,
}

/// Unary operator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    #[serde(rename = "!")]
    Not,
}

/// A syntax tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    /// Root of a compilation unit.
    Program { body: Box<Node> },
    Binary {
        op: BinaryOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Unary { op: UnaryOp, operand: Box<Node> },
    /// Statements executed in order.
    Block { nodes: Vec<Node> },
    Variable { name: String },
    Constant { value: Value },
    Assign { name: String, value: Box<Node> },
    For {
        init: Box<Node>,
        condition: Box<Node>,
        step: Box<Node>,
        body: Box<Node>,
    },
    While { condition: Box<Node>, body: Box<Node> },
    DoWhile { body: Box<Node>, condition: Box<Node> },
    /// One-armed conditional.
    If {
        condition: Box<Node>,
        then_branch: Box<Node>,
    },
    /// Two-armed conditional.
    IfElse {
        condition: Box<Node>,
        then_branch: Box<Node>,
        else_branch: Box<Node>,
    },
    /// A block body must return on every path; any other body is an
    /// expression whose value is returned.
    FunctionDef {
        name: String,
        params: Vec<String>,
        body: Box<Node>,
    },
    Return {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Box<Node>>,
    },
    Call {
        name: String,
        #[serde(default)]
        args: Vec<Node>,
        /// `false` when the call is a statement and its result is dropped.
        #[serde(default = "default_use_result")]
        use_result: bool,
    },
}

fn default_use_result() -> bool {
    true
}

impl Node {
    pub fn program(body: Node) -> Self {
        Node::Program {
            body: Box::new(body),
        }
    }

    pub fn block(nodes: Vec<Node>) -> Self {
        Node::Block { nodes }
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        Node::Constant {
            value: value.into(),
        }
    }

    pub fn int(n: i64) -> Self {
        Self::constant(n)
    }

    pub fn float(f: f64) -> Self {
        Self::constant(f)
    }

    pub fn string(s: &str) -> Self {
        Self::constant(s)
    }

    pub fn var(name: &str) -> Self {
        Node::Variable {
            name: name.to_string(),
        }
    }

    pub fn binary(op: BinaryOp, left: Node, right: Node) -> Self {
        Node::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn not(operand: Node) -> Self {
        Node::Unary {
            op: UnaryOp::Not,
            operand: Box::new(operand),
        }
    }

    pub fn assign(name: &str, value: Node) -> Self {
        Node::Assign {
            name: name.to_string(),
            value: Box::new(value),
        }
    }

    pub fn for_loop(init: Node, condition: Node, step: Node, body: Node) -> Self {
        Node::For {
            init: Box::new(init),
            condition: Box::new(condition),
            step: Box::new(step),
            body: Box::new(body),
        }
    }

    pub fn while_loop(condition: Node, body: Node) -> Self {
        Node::While {
            condition: Box::new(condition),
            body: Box::new(body),
        }
    }

    pub fn do_while(body: Node, condition: Node) -> Self {
        Node::DoWhile {
            body: Box::new(body),
            condition: Box::new(condition),
        }
    }

    pub fn if_then(condition: Node, then_branch: Node) -> Self {
        Node::If {
            condition: Box::new(condition),
            then_branch: Box::new(then_branch),
        }
    }

    pub fn if_else(condition: Node, then_branch: Node, else_branch: Node) -> Self {
        Node::IfElse {
            condition: Box::new(condition),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        }
    }

    pub fn function(name: &str, params: &[&str], body: Node) -> Self {
        Node::FunctionDef {
            name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            body: Box::new(body),
        }
    }

    pub fn ret(value: Node) -> Self {
        Node::Return {
            value: Some(Box::new(value)),
        }
    }

    pub fn ret_void() -> Self {
        Node::Return { value: None }
    }

    /// A call whose result is used.
    pub fn call(name: &str, args: Vec<Node>) -> Self {
        Node::Call {
            name: name.to_string(),
            args,
            use_result: true,
        }
    }

    /// A call statement; the result is discarded.
    pub fn call_stmt(name: &str, args: Vec<Node>) -> Self {
        Node::Call {
            name: name.to_string(),
            args,
            use_result: false,
        }
    }

    /// The `kind` tag of this node.
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Program { .. } => "program",
            Node::Binary { .. } => "binary",
            Node::Unary { .. } => "unary",
            Node::Block { .. } => "block",
            Node::Variable { .. } => "variable",
            Node::Constant { .. } => "constant",
            Node::Assign { .. } => "assign",
            Node::For { .. } => "for",
            Node::While { .. } => "while",
            Node::DoWhile { .. } => "do_while",
            Node::If { .. } => "if",
            Node::IfElse { .. } => "if_else",
            Node::FunctionDef { .. } => "function_def",
            Node::Return { .. } => "return",
            Node::Call { .. } => "call",
        }
    }
}

/// Parse a tree from JSON text.
pub fn from_json(source: &str) -> Result<Node, AstError> {
    Ok(serde_json::from_str(source)?)
}

/// Load a tree from a JSON file.
pub fn load_file(path: &Path) -> Result<Node, AstError> {
    let source = fs::read_to_string(path).map_err(|source| AstError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    from_json(&source)
}
