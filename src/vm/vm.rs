use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use super::error::{NativeError, Result, VmError};
use super::natives::NativeDispatcher;
use super::{Op, Program, Value, arith};
use crate::config::RuntimeConfig;

/// A call frame for the VM.
#[derive(Debug)]
struct Frame {
    /// Where `Ret` resumes; `None` marks the outermost frame.
    return_address: Option<usize>,
    /// Private slot storage, indexed by the program-wide slot numbering.
    slots: Vec<Option<Value>>,
}

impl Frame {
    fn new(return_address: Option<usize>, slot_count: usize) -> Self {
        Self {
            return_address,
            slots: vec![None; slot_count],
        }
    }
}

/// Lifecycle of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Running,
    /// The sentinel frame was popped or execution ran past the last instruction.
    Completed,
    /// An instruction failed; the machine must not be reused.
    Faulted,
}

/// Side-effect-free snapshot of a machine.
#[derive(Debug, Clone, Serialize)]
pub struct Status<'a> {
    pub state: ExecutionState,
    pub ip: usize,
    /// Frame stack depth, including the outermost frame.
    pub frames: usize,
    pub stack: &'a [Value],
}

impl Status<'_> {
    pub fn is_completed(&self) -> bool {
        self.state == ExecutionState::Completed
    }
}

impl fmt::Display for Status<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "STATUS:")?;
        let execution = match self.state {
            ExecutionState::Running => "INCOMPLETE",
            ExecutionState::Completed => "COMPLETED",
            ExecutionState::Faulted => "FAULTED",
        };
        writeln!(f, "\tEXECUTION: {}", execution)?;
        match self.frames {
            0 => writeln!(f, "\tFRAMES: ALL FRAMES DROPPED")?,
            1 => writeln!(f, "\tFRAMES: 1 FRAME IS ALIVE")?,
            n => writeln!(f, "\tFRAMES: {} FRAMES ARE ALIVE", n)?,
        }
        let items: Vec<String> = self
            .stack
            .iter()
            .map(|v| match v {
                Value::Str(s) => format!("{:?}", s),
                other => other.to_string(),
            })
            .collect();
        write!(f, "\tSTACK: [{}]", items.join(", "))
    }
}

enum ControlFlow {
    Continue,
    Complete,
}

/// The rill virtual machine.
pub struct VirtualMachine<D> {
    program: Program,
    natives: D,
    ip: usize,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    state: ExecutionState,
    /// Log every executed instruction at trace level
    trace_exec: bool,
    /// Per-opcode execution counts, when profiling is enabled
    opcode_counts: Option<BTreeMap<&'static str, u64>>,
    steps: u64,
}

impl<D: NativeDispatcher> VirtualMachine<D> {
    pub fn new(natives: D, program: Program) -> Self {
        let frames = vec![Frame::new(None, program.slot_count)];
        Self {
            program,
            natives,
            ip: 0,
            stack: Vec::with_capacity(256),
            frames,
            state: ExecutionState::Running,
            trace_exec: false,
            opcode_counts: None,
            steps: 0,
        }
    }

    /// Create a VM honouring the tracing and profiling switches of `config`.
    pub fn with_config(natives: D, program: Program, config: &RuntimeConfig) -> Self {
        let mut vm = Self::new(natives, program);
        vm.trace_exec = config.trace_exec;
        if config.profile_opcodes {
            vm.opcode_counts = Some(BTreeMap::new());
        }
        vm
    }

    /// Execute one instruction. Returns `false` once execution has completed.
    pub fn execute(&mut self) -> Result<bool> {
        match self.state {
            ExecutionState::Completed => return Ok(false),
            ExecutionState::Faulted => {
                return Err(self.fault("machine has already faulted"));
            }
            ExecutionState::Running => {}
        }

        if self.frames.is_empty() || self.ip >= self.program.len() {
            self.state = ExecutionState::Completed;
            return Ok(false);
        }

        let address = self.ip;
        let op = self.program.code[address].clone();

        if self.trace_exec {
            tracing::trace!(address, op = %op, stack = self.stack.len(), frames = self.frames.len(), "exec");
        }
        if let Some(counts) = self.opcode_counts.as_mut() {
            *counts.entry(op.name()).or_insert(0) += 1;
        }
        self.steps += 1;

        match self.execute_op(address, op) {
            Ok(ControlFlow::Continue) => Ok(true),
            Ok(ControlFlow::Complete) => {
                tracing::debug!(steps = self.steps, "execution completed");
                self.state = ExecutionState::Completed;
                Ok(false)
            }
            Err(e) => {
                tracing::warn!(address, error = %e, "execution faulted");
                self.state = ExecutionState::Faulted;
                Err(e)
            }
        }
    }

    /// Drive execution to completion.
    pub fn execute_all(&mut self) -> Result<()> {
        while self.execute()? {}
        Ok(())
    }

    fn execute_op(&mut self, address: usize, op: Op) -> Result<ControlFlow> {
        self.ip = address + 1;

        match op {
            Op::Push(value) => {
                self.stack.push(value);
            }
            Op::Pop => {
                self.pop(address)?;
            }
            Op::Store(slot) => {
                let value = self.pop(address)?;
                let frame = self.current_frame_mut(address)?;
                if slot >= frame.slots.len() {
                    frame.slots.resize(slot + 1, None);
                }
                frame.slots[slot] = Some(value);
            }
            Op::Fetch(slot) => {
                let frame = self.current_frame_mut(address)?;
                let value = frame
                    .slots
                    .get(slot)
                    .cloned()
                    .flatten()
                    .ok_or(VmError::UninitializedSlot { slot, address })?;
                self.stack.push(value);
            }
            Op::Jmp(target) => {
                self.jump(address, target)?;
            }
            Op::Jz(target) => {
                if self.pop_condition(address, "JZ")? {
                    self.jump(address, target)?;
                }
            }
            Op::Jnz(target) => {
                if !self.pop_condition(address, "JNZ")? {
                    self.jump(address, target)?;
                }
            }
            Op::Invoke(target) => {
                self.frames
                    .push(Frame::new(Some(address + 1), self.program.slot_count));
                tracing::debug!(target, depth = self.frames.len(), "invoke");
                self.jump(address, target)?;
            }
            Op::Ret => {
                let frame = self
                    .frames
                    .pop()
                    .ok_or_else(|| self.structural(address, "return with no frame"))?;
                match frame.return_address {
                    None => return Ok(ControlFlow::Complete),
                    Some(return_address) => {
                        tracing::debug!(return_address, depth = self.frames.len(), "return");
                        self.ip = return_address;
                    }
                }
            }
            Op::Native(index) => {
                self.natives
                    .invoke(index, &mut self.stack)
                    .map_err(|e| match e {
                        NativeError::NotFound => VmError::NativeUnresolved { index },
                        NativeError::Failed(message) => VmError::NativeFailed { index, message },
                    })?;
            }
            Op::Not => {
                let value = self.pop(address)?;
                match value {
                    Value::Int(n) => self.stack.push(Value::bool(n == 0)),
                    other => {
                        return Err(VmError::UnsupportedOperandType {
                            op: "NOT",
                            operand: other.type_name(),
                        });
                    }
                }
            }
            Op::Arith(op) => {
                let right = self.pop(address)?;
                let left = self.pop(address)?;
                let result = arith::apply(op, left, right)?;
                self.stack.push(result);
            }
        }

        Ok(ControlFlow::Continue)
    }

    fn pop(&mut self, address: usize) -> Result<Value> {
        match self.stack.pop() {
            Some(value) => Ok(value),
            None => Err(self.structural(address, "operand stack underflow")),
        }
    }

    /// Pop a jump condition; `true` when it is zero.
    fn pop_condition(&mut self, address: usize, op: &'static str) -> Result<bool> {
        let value = self.pop(address)?;
        value.is_zero().ok_or(VmError::UnsupportedOperandType {
            op,
            operand: value.type_name(),
        })
    }

    fn jump(&mut self, address: usize, target: usize) -> Result<()> {
        // Jumping to `len` is allowed: it runs off the end and completes.
        if target > self.program.len() {
            return Err(self.structural(
                address,
                &format!("jump target @{} outside program", target),
            ));
        }
        self.ip = target;
        Ok(())
    }

    fn current_frame_mut(&mut self, address: usize) -> Result<&mut Frame> {
        if self.frames.is_empty() {
            return Err(self.structural(address, "no active frame"));
        }
        let last = self.frames.len() - 1;
        Ok(&mut self.frames[last])
    }

    fn structural(&self, address: usize, message: &str) -> VmError {
        VmError::StructuralFault {
            address,
            message: message.to_string(),
        }
    }

    fn fault(&self, message: &str) -> VmError {
        self.structural(self.ip, message)
    }

    /// Snapshot of execution state, frame depth and operand stack.
    pub fn status(&self) -> Status<'_> {
        Status {
            state: self.state,
            ip: self.ip,
            frames: self.frames.len(),
            stack: &self.stack,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn is_completed(&self) -> bool {
        self.state == ExecutionState::Completed
    }

    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    /// Number of live frames, including the outermost one.
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Number of active user-function invocations.
    pub fn call_depth(&self) -> usize {
        self.frames.len().saturating_sub(1)
    }

    /// Slot storage of the active frame.
    pub fn current_slots(&self) -> &[Option<Value>] {
        self.frames
            .last()
            .map(|frame| frame.slots.as_slice())
            .unwrap_or(&[])
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Instructions executed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Opcode counts, if profiling was enabled.
    pub fn opcode_counts(&self) -> Option<&BTreeMap<&'static str, u64>> {
        self.opcode_counts.as_ref()
    }

    /// Render the opcode profile, most frequent first.
    pub fn format_profile(&self) -> Option<String> {
        let counts = self.opcode_counts.as_ref()?;
        let mut rows: Vec<(&&str, &u64)> = counts.iter().collect();
        rows.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        let mut out = format!("[PROFILE] {} instructions\n", self.steps);
        for (name, count) in rows {
            out.push_str(&format!("  {:<8} {}\n", name, count));
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{ArithOp, NoNatives};

    fn run_code(ops: Vec<Op>) -> Result<Vec<Value>> {
        let mut vm = VirtualMachine::new(NoNatives, Program::from_ops(ops));
        vm.execute_all()?;
        Ok(vm.stack)
    }

    #[test]
    fn test_push_int() {
        let stack = run_code(vec![Op::Push(Value::Int(42)), Op::Ret]).unwrap();
        assert_eq!(stack, vec![Value::Int(42)]);
    }

    #[test]
    fn test_add() {
        let stack = run_code(vec![
            Op::Push(Value::Int(1)),
            Op::Push(Value::Int(2)),
            Op::Arith(ArithOp::Add),
            Op::Ret,
        ])
        .unwrap();
        assert_eq!(stack, vec![Value::Int(3)]);
    }

    #[test]
    fn test_operand_order() {
        let stack = run_code(vec![
            Op::Push(Value::Int(10)),
            Op::Push(Value::Int(4)),
            Op::Arith(ArithOp::Sub),
            Op::Ret,
        ])
        .unwrap();
        assert_eq!(stack, vec![Value::Int(6)]);
    }

    #[test]
    fn test_locals() {
        let stack = run_code(vec![
            Op::Push(Value::Int(42)),
            Op::Store(0),
            Op::Fetch(0),
            Op::Fetch(0),
            Op::Ret,
        ])
        .unwrap();
        assert_eq!(stack, vec![Value::Int(42), Value::Int(42)]);
    }

    #[test]
    fn test_conditional_jump() {
        // if 0, skip push 1, else push 2
        let stack = run_code(vec![
            Op::Push(Value::Int(0)),
            Op::Jz(4),
            Op::Push(Value::Int(1)),
            Op::Jmp(5),
            Op::Push(Value::Int(2)),
            Op::Ret,
        ])
        .unwrap();
        assert_eq!(stack, vec![Value::Int(2)]);
    }

    #[test]
    fn test_jnz_loops_until_zero() {
        // n = 3; do { n = n - 1 } while n
        let stack = run_code(vec![
            Op::Push(Value::Int(3)),
            Op::Store(0),
            Op::Fetch(0),
            Op::Push(Value::Int(1)),
            Op::Arith(ArithOp::Sub),
            Op::Store(0),
            Op::Fetch(0),
            Op::Jnz(2),
            Op::Fetch(0),
            Op::Ret,
        ])
        .unwrap();
        assert_eq!(stack, vec![Value::Int(0)]);
    }

    #[test]
    fn test_not() {
        let stack = run_code(vec![
            Op::Push(Value::Int(0)),
            Op::Not,
            Op::Push(Value::Int(5)),
            Op::Not,
            Op::Ret,
        ])
        .unwrap();
        assert_eq!(stack, vec![Value::Int(1), Value::Int(0)]);
    }

    #[test]
    fn test_invoke_gets_fresh_slots() {
        // slot 0 = 7 at top level; the callee reads slot 0 before writing it.
        let err = run_code(vec![
            Op::Push(Value::Int(7)),
            Op::Store(0),
            Op::Invoke(4),
            Op::Ret,
            Op::Fetch(0),
            Op::Ret,
        ])
        .unwrap_err();
        assert_eq!(err, VmError::UninitializedSlot { slot: 0, address: 4 });
    }

    #[test]
    fn test_return_restores_caller_slots() {
        let stack = run_code(vec![
            Op::Push(Value::Int(7)),
            Op::Store(0),
            Op::Invoke(5),
            Op::Fetch(0),
            Op::Ret,
            Op::Push(Value::Int(99)),
            Op::Store(0),
            Op::Push(Value::Int(1)),
            Op::Ret,
        ])
        .unwrap();
        assert_eq!(stack, vec![Value::Int(1), Value::Int(7)]);
    }

    #[test]
    fn test_execute_reports_completion() {
        let mut vm = VirtualMachine::new(
            NoNatives,
            Program::from_ops(vec![Op::Push(Value::Int(1)), Op::Ret]),
        );
        assert!(!vm.status().is_completed());
        assert_eq!(vm.execute(), Ok(true));
        assert_eq!(vm.execute(), Ok(false));
        assert!(vm.is_completed());
        assert_eq!(vm.frame_depth(), 0);
        assert_eq!(vm.execute(), Ok(false));
    }

    #[test]
    fn test_running_off_the_end_completes() {
        let stack = run_code(vec![Op::Push(Value::Int(1))]).unwrap();
        assert_eq!(stack, vec![Value::Int(1)]);
    }

    #[test]
    fn test_stack_underflow_is_structural() {
        let err = run_code(vec![Op::Pop]).unwrap_err();
        assert!(matches!(err, VmError::StructuralFault { address: 0, .. }));
    }

    #[test]
    fn test_jump_outside_program_is_structural() {
        let err = run_code(vec![Op::Jmp(9)]).unwrap_err();
        assert!(matches!(err, VmError::StructuralFault { .. }));
    }

    #[test]
    fn test_unresolved_native() {
        let err = run_code(vec![Op::Native(3)]).unwrap_err();
        assert_eq!(err, VmError::NativeUnresolved { index: 3 });
    }

    #[test]
    fn test_native_pushes_result() {
        let double = |_index: usize, stack: &mut Vec<Value>| -> std::result::Result<(), NativeError> {
            let n = stack.pop().and_then(|v| v.as_int()).unwrap_or_default();
            stack.push(Value::Int(n * 2));
            Ok(())
        };
        let mut vm = VirtualMachine::new(
            double,
            Program::from_ops(vec![Op::Push(Value::Int(21)), Op::Native(0), Op::Ret]),
        );
        vm.execute_all().unwrap();
        assert_eq!(vm.stack(), &[Value::Int(42)]);
    }

    #[test]
    fn test_faulted_machine_refuses_steps() {
        let mut vm = VirtualMachine::new(
            NoNatives,
            Program::from_ops(vec![
                Op::Push(Value::str("a")),
                Op::Push(Value::str("b")),
                Op::Arith(ArithOp::Sub),
                Op::Ret,
            ]),
        );
        assert!(matches!(
            vm.execute_all(),
            Err(VmError::UnsupportedOperandTypes { .. })
        ));
        assert_eq!(vm.state(), ExecutionState::Faulted);
        assert!(vm.execute().is_err());
        // Stacks are left as they were at the fault.
        assert!(vm.stack().is_empty());
        assert_eq!(vm.frame_depth(), 1);
    }

    #[test]
    fn test_jz_on_string_is_unsupported() {
        let err = run_code(vec![Op::Push(Value::str("x")), Op::Jz(0)]).unwrap_err();
        assert_eq!(
            err,
            VmError::UnsupportedOperandType {
                op: "JZ",
                operand: "string"
            }
        );
    }

    #[test]
    fn test_status_display() {
        let mut vm = VirtualMachine::new(
            NoNatives,
            Program::from_ops(vec![
                Op::Push(Value::Int(6)),
                Op::Push(Value::str("x")),
                Op::Ret,
            ]),
        );
        vm.execute().unwrap();
        let running = vm.status().to_string();
        assert!(running.contains("EXECUTION: INCOMPLETE"));
        assert!(running.contains("FRAMES: 1 FRAME IS ALIVE"));
        assert!(running.contains("STACK: [6]"));

        vm.execute_all().unwrap();
        let done = vm.status().to_string();
        assert!(done.contains("EXECUTION: COMPLETED"));
        assert!(done.contains("ALL FRAMES DROPPED"));
        assert!(done.contains(r#"STACK: [6, "x"]"#));
    }

    #[test]
    fn test_opcode_profile() {
        let config = RuntimeConfig {
            profile_opcodes: true,
            ..Default::default()
        };
        let mut vm = VirtualMachine::with_config(
            NoNatives,
            Program::from_ops(vec![
                Op::Push(Value::Int(1)),
                Op::Push(Value::Int(2)),
                Op::Pop,
                Op::Ret,
            ]),
            &config,
        );
        vm.execute_all().unwrap();
        let counts = vm.opcode_counts().unwrap();
        assert_eq!(counts.get("PUSH"), Some(&2));
        assert_eq!(counts.get("RET"), Some(&1));
        assert_eq!(vm.steps(), 4);
        assert!(vm.format_profile().unwrap().starts_with("[PROFILE] 4 instructions"));
    }
}
