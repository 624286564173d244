//! Rill - a tree-to-bytecode compiler and a stack virtual machine
//!
//! The compiler turns a syntax tree ([`compiler::ast::Node`]) into a flat
//! [`vm::Program`]; the [`vm::VirtualMachine`] runs it one instruction at a
//! time, calling out to host functions through a [`vm::NativeDispatcher`].

pub mod compiler;
pub mod config;
pub mod debugger;
pub mod vm;

// Re-export commonly used types
pub use compiler::{Compilation, CompileError, RunError, compile_program};
pub use config::RuntimeConfig;
pub use vm::{Natives, Program, Value, VirtualMachine, VmError};
