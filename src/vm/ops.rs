use std::fmt;

use super::Value;

/// Bytecode operations for the rill VM.
///
/// Immediates are carried inline, so every instruction occupies exactly one
/// address. Jump and invoke targets are absolute indices into the program.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    // ========================================
    // Stack
    // ========================================
    Push(Value),
    Pop,

    // ========================================
    // Frame slots
    // ========================================
    Store(usize),
    Fetch(usize),

    // ========================================
    // Control Flow
    // ========================================
    Jmp(usize),
    /// [v] → [] (branch if v == 0)
    Jz(usize),
    /// [v] → [] (branch if v != 0)
    Jnz(usize),
    Invoke(usize),
    Ret,
    /// Host function by native-table index.
    Native(usize),

    // ========================================
    // Operators
    // ========================================
    /// [int] → [int] (x == 0 ? 1 : 0)
    Not,
    /// [left, right] → [left OP right]
    Arith(ArithOp),
}

/// Binary operators understood by the arithmetic engine.
///
/// There is no not-equal: the compiler emits `Eq` followed by `Not`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
    Xor,
}

impl ArithOp {
    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
            ArithOp::Pow => "**",
            ArithOp::Eq => "==",
            ArithOp::Lt => "<",
            ArithOp::Gt => ">",
            ArithOp::Le => "<=",
            ArithOp::Ge => ">=",
            ArithOp::And => "&",
            ArithOp::Or => "|",
            ArithOp::Xor => "^",
        }
    }
}

impl Op {
    /// Returns the name of the opcode for profiling and listings.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Push(_) => "PUSH",
            Op::Pop => "POP",
            Op::Store(_) => "STORE",
            Op::Fetch(_) => "FETCH",
            Op::Jmp(_) => "JMP",
            Op::Jz(_) => "JZ",
            Op::Jnz(_) => "JNZ",
            Op::Invoke(_) => "INVOKE",
            Op::Ret => "RET",
            Op::Native(_) => "NATIVE",
            Op::Not => "NOT",
            Op::Arith(op) => match op {
                ArithOp::Add => "ADD",
                ArithOp::Sub => "SUB",
                ArithOp::Mul => "MUL",
                ArithOp::Div => "DIV",
                ArithOp::Mod => "MOD",
                ArithOp::Pow => "POW",
                ArithOp::Eq => "EQL",
                ArithOp::Lt => "LT",
                ArithOp::Gt => "GT",
                ArithOp::Le => "LE",
                ArithOp::Ge => "GE",
                ArithOp::And => "AND",
                ArithOp::Or => "OR",
                ArithOp::Xor => "XOR",
            },
        }
    }

    /// Jump or invoke target, if this instruction has one.
    pub fn target(&self) -> Option<usize> {
        match self {
            Op::Jmp(t) | Op::Jz(t) | Op::Jnz(t) | Op::Invoke(t) => Some(*t),
            _ => None,
        }
    }

    /// Rewrite the target of a jump placeholder. No-op for other instructions.
    pub fn patch_target(&mut self, address: usize) {
        match self {
            Op::Jmp(t) | Op::Jz(t) | Op::Jnz(t) | Op::Invoke(t) => *t = address,
            _ => {}
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Push(v) => write!(f, "{} {:?}", self.name(), v),
            Op::Store(slot) | Op::Fetch(slot) => write!(f, "{} ${}", self.name(), slot),
            Op::Jmp(t) | Op::Jz(t) | Op::Jnz(t) | Op::Invoke(t) => {
                write!(f, "{} @{}", self.name(), t)
            }
            Op::Native(index) => write!(f, "{} #{}", self.name(), index),
            _ => write!(f, "{}", self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_target() {
        let mut op = Op::Jz(0);
        op.patch_target(12);
        assert_eq!(op, Op::Jz(12));

        let mut op = Op::Pop;
        op.patch_target(3);
        assert_eq!(op, Op::Pop);
    }

    #[test]
    fn test_display() {
        assert_eq!(Op::Push(Value::Int(3)).to_string(), "PUSH Int(3)");
        assert_eq!(Op::Store(2).to_string(), "STORE $2");
        assert_eq!(Op::Jnz(9).to_string(), "JNZ @9");
        assert_eq!(Op::Native(0).to_string(), "NATIVE #0");
        assert_eq!(Op::Arith(ArithOp::Eq).to_string(), "EQL");
    }
}
