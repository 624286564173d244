//! Runtime errors

use thiserror::Error;

use super::ArithOp;

/// VM result type
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors raised while executing a program.
///
/// Every variant aborts the run; the machine keeps its stacks as they were
/// and refuses further steps.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VmError {
    #[error("can't find or access native function #{index}")]
    NativeUnresolved { index: usize },

    #[error("native function #{index} failed: {message}")]
    NativeFailed { index: usize, message: String },

    #[error("unsupported operand types for {}: {left} and {right}", .op.symbol())]
    UnsupportedOperandTypes {
        op: ArithOp,
        left: &'static str,
        right: &'static str,
    },

    #[error("unsupported operand type for {op}: {operand}")]
    UnsupportedOperandType {
        op: &'static str,
        operand: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("string of {len} bytes exceeds the {limit}-byte limit")]
    StringTooLong { len: usize, limit: usize },

    #[error("slot ${slot} read before assignment at @{address}")]
    UninitializedSlot { slot: usize, address: usize },

    #[error("structural fault at @{address}: {message}")]
    StructuralFault { address: usize, message: String },
}

/// Errors reported by a native dispatcher.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NativeError {
    /// The index does not resolve to a callable host function.
    #[error("native function not found")]
    NotFound,

    #[error("{0}")]
    Failed(String),
}

impl NativeError {
    pub fn failed(message: impl Into<String>) -> Self {
        NativeError::Failed(message.into())
    }
}
