use std::collections::HashMap;

use thiserror::Error;

use crate::compiler::ast::{BinaryOp, Node, UnaryOp};
use crate::vm::{ArithOp, Op, Program, Value};

/// Errors raised while compiling a tree.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("function '{function}' can reach the end of its body without a return")]
    MissingReturn { function: String },
}

/// Name tables built during compilation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolTables {
    /// Variable name → slot, shared by the whole unit.
    pub variables: HashMap<String, usize>,
    /// Function name → entry address.
    pub functions: HashMap<String, usize>,
    /// Native name → native index, in first-call order.
    pub natives: HashMap<String, usize>,
}

impl SymbolTables {
    pub fn variable_name(&self, slot: usize) -> Option<&str> {
        find_name(&self.variables, slot)
    }

    pub fn function_at(&self, address: usize) -> Option<&str> {
        find_name(&self.functions, address)
    }

    pub fn native_name(&self, index: usize) -> Option<&str> {
        find_name(&self.natives, index)
    }
}

fn find_name(table: &HashMap<String, usize>, value: usize) -> Option<&str> {
    table
        .iter()
        .find(|(_, v)| **v == value)
        .map(|(name, _)| name.as_str())
}

/// A finished program together with the tables that produced it.
#[derive(Debug, Clone)]
pub struct Compilation {
    pub program: Program,
    pub symbols: SymbolTables,
}

/// Compile a tree into a flat program terminated by a top-level return.
pub fn compile_program(root: &Node) -> Result<Compilation, CompileError> {
    Compiler::new().compile_program(root)
}

/// Single-pass code generator.
///
/// Holds the instruction buffer and the symbol tables for one compilation
/// unit; consumed by [`Compiler::compile_program`].
#[derive(Debug, Default)]
pub struct Compiler {
    ops: Vec<Op>,
    symbols: SymbolTables,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile_program(mut self, root: &Node) -> Result<Compilation, CompileError> {
        self.compile(root)?;
        self.ops.push(Op::Ret);

        let slot_count = self.symbols.variables.len();
        tracing::debug!(
            instructions = self.ops.len(),
            slots = slot_count,
            functions = self.symbols.functions.len(),
            natives = self.symbols.natives.len(),
            "compiled program"
        );

        Ok(Compilation {
            program: Program::new(self.ops, slot_count),
            symbols: self.symbols,
        })
    }

    /// Address of the next emitted instruction.
    fn here(&self) -> usize {
        self.ops.len()
    }

    /// Emit a jump with a placeholder target; returns its address for patching.
    fn emit_placeholder(&mut self, op: Op) -> usize {
        let at = self.here();
        self.ops.push(op);
        at
    }

    fn patch(&mut self, at: usize, target: usize) {
        self.ops[at].patch_target(target);
    }

    fn slot(&mut self, name: &str) -> usize {
        if let Some(&slot) = self.symbols.variables.get(name) {
            return slot;
        }
        let slot = self.symbols.variables.len();
        self.symbols.variables.insert(name.to_string(), slot);
        slot
    }

    fn native_index(&mut self, name: &str) -> usize {
        if let Some(&index) = self.symbols.natives.get(name) {
            return index;
        }
        let index = self.symbols.natives.len();
        tracing::debug!(name, index, "allocated native index");
        self.symbols.natives.insert(name.to_string(), index);
        index
    }

    fn compile(&mut self, node: &Node) -> Result<(), CompileError> {
        match node {
            Node::Program { body } => {
                self.compile(body)?;
            }
            Node::Binary { op, left, right } => {
                self.compile(left)?;
                self.compile(right)?;
                match op {
                    BinaryOp::Ne => {
                        self.ops.push(Op::Arith(ArithOp::Eq));
                        self.ops.push(Op::Not);
                    }
                    _ => self.ops.push(Op::Arith(arith_op(*op))),
                }
            }
            Node::Unary { op, operand } => {
                self.compile(operand)?;
                match op {
                    UnaryOp::Not => self.ops.push(Op::Not),
                }
            }
            Node::Block { nodes } => {
                for node in nodes {
                    self.compile(node)?;
                }
            }
            Node::Variable { name } => {
                let slot = self.slot(name);
                self.ops.push(Op::Fetch(slot));
            }
            Node::Constant { value } => {
                self.ops.push(Op::Push(value.clone()));
            }
            Node::Assign { name, value } => {
                self.compile(value)?;
                let slot = self.slot(name);
                self.ops.push(Op::Store(slot));
            }
            Node::For {
                init,
                condition,
                step,
                body,
            } => {
                self.compile(init)?;

                let loop_start = self.here();
                self.compile(condition)?;
                let jump_to_end = self.emit_placeholder(Op::Jz(0));

                self.compile(body)?;
                self.compile(step)?;
                self.ops.push(Op::Jmp(loop_start));

                let loop_end = self.here();
                self.patch(jump_to_end, loop_end);
            }
            Node::While { condition, body } => {
                let loop_start = self.here();
                self.compile(condition)?;
                let jump_to_end = self.emit_placeholder(Op::Jz(0));

                self.compile(body)?;
                self.ops.push(Op::Jmp(loop_start));

                let loop_end = self.here();
                self.patch(jump_to_end, loop_end);
            }
            Node::DoWhile { body, condition } => {
                let loop_start = self.here();
                self.compile(body)?;
                self.compile(condition)?;
                self.ops.push(Op::Jnz(loop_start));
            }
            Node::If {
                condition,
                then_branch,
            } => {
                self.compile(condition)?;
                let jump_over_then = self.emit_placeholder(Op::Jz(0));

                self.compile(then_branch)?;

                let after_then = self.here();
                self.patch(jump_over_then, after_then);
            }
            Node::IfElse {
                condition,
                then_branch,
                else_branch,
            } => {
                self.compile(condition)?;
                let jump_to_else = self.emit_placeholder(Op::Jz(0));

                self.compile(then_branch)?;
                let jump_over_else = self.emit_placeholder(Op::Jmp(0));

                let else_start = self.here();
                self.patch(jump_to_else, else_start);

                self.compile(else_branch)?;

                let after_else = self.here();
                self.patch(jump_over_else, after_else);
            }
            Node::FunctionDef { name, params, body } => {
                self.compile_function(name, params, body)?;
            }
            Node::Return { value } => {
                match value {
                    Some(value) => self.compile(value)?,
                    None => self.ops.push(Op::Push(Value::Int(0))),
                }
                self.ops.push(Op::Ret);
            }
            Node::Call {
                name,
                args,
                use_result,
            } => {
                // Right-to-left, so the first argument ends up on top.
                for arg in args.iter().rev() {
                    self.compile(arg)?;
                }

                match self.symbols.functions.get(name) {
                    Some(&entry) => self.ops.push(Op::Invoke(entry)),
                    None => {
                        let index = self.native_index(name);
                        self.ops.push(Op::Native(index));
                    }
                }

                if !use_result {
                    self.ops.push(Op::Pop);
                }
            }
        }

        Ok(())
    }

    fn compile_function(
        &mut self,
        name: &str,
        params: &[String],
        body: &Node,
    ) -> Result<(), CompileError> {
        let is_block = matches!(body, Node::Block { .. });
        if is_block && !always_returns(body) {
            return Err(CompileError::MissingReturn {
                function: name.to_string(),
            });
        }

        // Skip over the body when flowing through the definition.
        let jump_over_body = self.emit_placeholder(Op::Jmp(0));

        let entry = self.here();
        self.symbols.functions.insert(name.to_string(), entry);
        tracing::debug!(name, entry, params = params.len(), "function definition");

        // Prologue: the first argument is on top, so pop in declaration order.
        for param in params {
            let slot = self.slot(param);
            self.ops.push(Op::Store(slot));
        }

        self.compile(body)?;
        if !is_block {
            self.ops.push(Op::Ret);
        }

        let after_body = self.here();
        self.patch(jump_over_body, after_body);
        Ok(())
    }
}

fn arith_op(op: BinaryOp) -> ArithOp {
    match op {
        BinaryOp::Add => ArithOp::Add,
        BinaryOp::Sub => ArithOp::Sub,
        BinaryOp::Mul => ArithOp::Mul,
        BinaryOp::Div => ArithOp::Div,
        BinaryOp::Mod => ArithOp::Mod,
        BinaryOp::Pow => ArithOp::Pow,
        BinaryOp::Eq | BinaryOp::Ne => ArithOp::Eq,
        BinaryOp::Lt => ArithOp::Lt,
        BinaryOp::Gt => ArithOp::Gt,
        BinaryOp::Le => ArithOp::Le,
        BinaryOp::Ge => ArithOp::Ge,
        BinaryOp::And => ArithOp::And,
        BinaryOp::Or => ArithOp::Or,
        BinaryOp::Xor => ArithOp::Xor,
    }
}

/// Whether every path through `node` ends in a `return`.
fn always_returns(node: &Node) -> bool {
    match node {
        Node::Return { .. } => true,
        Node::Program { body } => always_returns(body),
        Node::Block { nodes } => nodes.iter().any(always_returns),
        Node::IfElse {
            then_branch,
            else_branch,
            ..
        } => always_returns(then_branch) && always_returns(else_branch),
        Node::DoWhile { body, .. } => always_returns(body),
        _ => false,
    }
}
