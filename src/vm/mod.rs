mod arith;
mod error;
pub mod natives;
mod ops;
mod value;
mod vm;

pub use error::{NativeError, VmError};
pub use natives::{NativeDispatcher, Natives, NoNatives, OutputBuffer};
pub use ops::{ArithOp, Op};
pub use value::Value;
pub use vm::{ExecutionState, Status, VirtualMachine};

/// A compiled, flat instruction stream.
///
/// Addresses are indices into `code`. `slot_count` sizes the slot storage
/// every frame gets.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub code: Vec<Op>,
    pub slot_count: usize,
}

impl Program {
    pub fn new(code: Vec<Op>, slot_count: usize) -> Self {
        Self { code, slot_count }
    }

    /// Build a program from hand-written instructions, sizing frames from the
    /// highest slot referenced.
    pub fn from_ops(code: Vec<Op>) -> Self {
        let slot_count = code
            .iter()
            .filter_map(|op| match op {
                Op::Store(slot) | Op::Fetch(slot) => Some(slot + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        Self { code, slot_count }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn get(&self, address: usize) -> Option<&Op> {
        self.code.get(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_ops_counts_slots() {
        let program = Program::from_ops(vec![
            Op::Push(Value::Int(1)),
            Op::Store(3),
            Op::Fetch(1),
        ]);
        assert_eq!(program.slot_count, 4);
        assert_eq!(Program::from_ops(vec![Op::Ret]).slot_count, 0);
    }
}
