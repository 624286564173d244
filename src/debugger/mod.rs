use std::collections::BTreeSet;
use std::io;
use std::path::Path;

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, List, ListItem, Paragraph};

use crate::compiler::{self, Compilation, RunError, SymbolTables, dump};
use crate::config::RuntimeConfig;
use crate::vm::{ExecutionState, Natives, OutputBuffer, Value, VirtualMachine};

/// Debugger state.
pub struct Debugger {
    vm: VirtualMachine<Natives>,
    symbols: SymbolTables,
    /// Disassembled instructions, one per address
    listing: Vec<String>,
    /// Breakpoints on instruction addresses
    breakpoints: BTreeSet<usize>,
    /// Captured program output
    output: OutputBuffer,
    /// Whether the debugger is running
    running: bool,
    /// Command input buffer
    input: String,
    /// Status message
    status: String,
}

impl Debugger {
    /// Create a debugger for a JSON syntax tree.
    pub fn new(path: &Path, config: &RuntimeConfig) -> Result<Self, RunError> {
        let compilation = compiler::compile_file(path)?;
        Ok(Self::from_compilation(compilation, config))
    }

    pub fn from_compilation(compilation: Compilation, config: &RuntimeConfig) -> Self {
        let listing = compilation
            .program
            .code
            .iter()
            .map(|op| dump::format_op(op, &compilation.symbols))
            .collect();
        let symbols = compilation.symbols.clone();
        let output = OutputBuffer::new();
        let vm = compiler::build_vm(compilation, config, Box::new(output.clone()));

        Self {
            vm,
            symbols,
            listing,
            breakpoints: BTreeSet::new(),
            output,
            running: true,
            input: String::new(),
            status: "Ready. Type 'h' for help.".to_string(),
        }
    }

    fn finished(&self) -> bool {
        self.vm.state() != ExecutionState::Running
    }

    /// Execute one instruction. Returns `false` once nothing more can run.
    fn step(&mut self) -> bool {
        if self.finished() {
            self.status = "Program has ended.".to_string();
            return false;
        }

        match self.vm.execute() {
            Ok(true) => {
                self.status = format!(
                    "ip: @{}, stack size: {}, frames: {}",
                    self.vm.ip(),
                    self.vm.stack().len(),
                    self.vm.frame_depth()
                );
                true
            }
            Ok(false) => {
                self.status = "Program completed.".to_string();
                false
            }
            Err(e) => {
                self.status = format!("Fault: {}", e);
                false
            }
        }
    }

    /// Continue execution until a breakpoint or the end.
    fn continue_exec(&mut self) {
        while self.step() {
            let ip = self.vm.ip();
            if self.breakpoints.contains(&ip) {
                self.status = format!("Breakpoint hit at @{}", ip);
                break;
            }
        }
    }

    fn parse_address(&mut self, arg: Option<&str>, usage: &str) -> Option<usize> {
        let parsed = arg.and_then(|a| a.trim_start_matches('@').parse::<usize>().ok());
        if parsed.is_none() {
            self.status = format!("Usage: {} <address>", usage);
        }
        parsed
    }

    /// Look up a slot by number (`3` or `$3`) or by variable name.
    fn slot_of(&self, arg: &str) -> Option<usize> {
        match arg.trim_start_matches('$').parse::<usize>() {
            Ok(slot) => Some(slot),
            Err(_) => self.symbols.variables.get(arg).copied(),
        }
    }

    fn slot_label(&self, slot: usize) -> String {
        match self.symbols.variable_name(slot) {
            Some(name) => format!("${} {}", slot, name),
            None => format!("${}", slot),
        }
    }

    /// Process a command.
    fn process_command(&mut self, cmd: &str) {
        let parts: Vec<&str> = cmd.split_whitespace().collect();
        if parts.is_empty() {
            return;
        }

        match parts[0] {
            "s" | "step" => {
                let count = parts.get(1).and_then(|n| n.parse::<usize>().ok()).unwrap_or(1);
                for _ in 0..count {
                    if !self.step() {
                        break;
                    }
                }
            }
            "c" | "continue" => self.continue_exec(),
            "b" => {
                if let Some(address) = self.parse_address(parts.get(1).copied(), "b") {
                    if address >= self.listing.len() {
                        self.status = format!("No instruction at @{}", address);
                    } else {
                        self.breakpoints.insert(address);
                        self.status = format!("Breakpoint set at @{}", address);
                    }
                }
            }
            "d" => {
                if let Some(address) = self.parse_address(parts.get(1).copied(), "d") {
                    self.breakpoints.remove(&address);
                    self.status = format!("Breakpoint deleted at @{}", address);
                }
            }
            "bl" => {
                let bps: Vec<String> = self.breakpoints.iter().map(|a| format!("@{}", a)).collect();
                self.status = format!("Breakpoints: {}", bps.join(", "));
            }
            "p" => match parts.get(1) {
                Some(arg) => match self.slot_of(arg) {
                    Some(slot) => {
                        let value = match self.vm.current_slots().get(slot) {
                            Some(Some(v)) => format_value(v),
                            _ => "<unset>".to_string(),
                        };
                        self.status = format!("{} = {}", self.slot_label(slot), value);
                    }
                    None => self.status = format!("Unknown: {}", arg),
                },
                None => self.status = "Usage: p <slot|name>".to_string(),
            },
            "slots" => {
                let set: Vec<String> = self
                    .vm
                    .current_slots()
                    .iter()
                    .enumerate()
                    .filter_map(|(i, v)| {
                        v.as_ref()
                            .map(|v| format!("{}={}", self.slot_label(i), format_value(v)))
                    })
                    .collect();
                self.status = format!("Slots: {}", set.join(" "));
            }
            "stack" => {
                let items: Vec<String> = self.vm.stack().iter().map(format_value).collect();
                self.status = format!("Stack: [{}]", items.join(", "));
            }
            "status" => {
                self.status = self.vm.status().to_string().replace(['\n', '\t'], " ");
            }
            "q" | "quit" => {
                self.running = false;
            }
            "h" | "help" => {
                self.status =
                    "Commands: s(tep) [n] c(ontinue) b <addr> d <addr> bl p <slot|name> slots stack status q(uit)"
                        .to_string();
            }
            _ => {
                self.status = format!("Unknown command: {}", parts[0]);
            }
        }
    }

    /// Run the debugger TUI.
    pub fn run(&mut self) -> io::Result<()> {
        let _guard = TerminalGuard::enter()?;
        let mut terminal = Terminal::new(CrosstermBackend::new(io::stdout()))?;
        self.run_loop(&mut terminal, event::read)
    }

    /// Draw and handle input until quit.
    fn run_loop<B: Backend>(
        &mut self,
        terminal: &mut Terminal<B>,
        mut next_event: impl FnMut() -> io::Result<Event>,
    ) -> io::Result<()> {
        while self.running {
            terminal.draw(|frame| self.ui(frame))?;

            if let Event::Key(key) = next_event()?
                && key.kind == KeyEventKind::Press
            {
                match key.code {
                    KeyCode::Enter => {
                        let cmd = std::mem::take(&mut self.input);
                        self.process_command(&cmd);
                    }
                    KeyCode::Char(c) => {
                        self.input.push(c);
                    }
                    KeyCode::Backspace => {
                        self.input.pop();
                    }
                    KeyCode::Esc => {
                        self.running = false;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn ui(&self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Min(10),   // Listing
                Constraint::Length(6), // Slots + Stack
                Constraint::Length(5), // Output
                Constraint::Length(3), // Status
                Constraint::Length(3), // Input
            ])
            .split(frame.area());

        let ip = self.vm.ip();
        let items: Vec<ListItem> = self
            .listing
            .iter()
            .enumerate()
            .map(|(address, line)| {
                let bp = if self.breakpoints.contains(&address) { "●" } else { " " };
                let marker = if address == ip && !self.finished() { "▶" } else { " " };
                let label = self
                    .symbols
                    .function_at(address)
                    .map(|name| format!("  <{}>", name))
                    .unwrap_or_default();
                let content = format!("{}{}{:04} │ {}{}", bp, marker, address, line, label);
                let style = if address == ip {
                    Style::default().bg(Color::DarkGray)
                } else {
                    Style::default()
                };
                ListItem::new(content).style(style)
            })
            .collect();

        let listing =
            List::new(items).block(Block::default().title("Bytecode").borders(Borders::ALL));
        frame.render_widget(listing, chunks[0]);

        let info_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(chunks[1]);

        let slots_text: Vec<String> = self
            .vm
            .current_slots()
            .iter()
            .enumerate()
            .filter_map(|(i, v)| {
                v.as_ref()
                    .map(|v| format!("{} = {}", self.slot_label(i), format_value(v)))
            })
            .collect();
        let slots = Paragraph::new(slots_text.join("\n")).block(
            Block::default()
                .title(format!("Slots (depth {})", self.vm.call_depth()))
                .borders(Borders::ALL),
        );
        frame.render_widget(slots, info_chunks[0]);

        let stack_text: Vec<String> = self
            .vm
            .stack()
            .iter()
            .rev()
            .take(5)
            .map(format_value)
            .collect();
        let stack = Paragraph::new(stack_text.join("\n"))
            .block(Block::default().title("Stack").borders(Borders::ALL));
        frame.render_widget(stack, info_chunks[1]);

        let contents = self.output.contents();
        let lines: Vec<&str> = contents.lines().collect();
        let start = lines.len().saturating_sub(3);
        let output = Paragraph::new(lines[start..].join("\n"))
            .block(Block::default().title("Output").borders(Borders::ALL));
        frame.render_widget(output, chunks[2]);

        let status = Paragraph::new(self.status.clone())
            .block(Block::default().title("Status").borders(Borders::ALL));
        frame.render_widget(status, chunks[3]);

        let input = Paragraph::new(format!("(debug) {}", self.input))
            .block(Block::default().title("Command").borders(Borders::ALL));
        frame.render_widget(input, chunks[4]);
    }
}

/// Raw mode and the alternate screen, restored on drop so that errors
/// from drawing or reading input leave a usable terminal.
struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        if let Err(e) = io::stdout().execute(EnterAlternateScreen) {
            let _ = disable_raw_mode();
            return Err(e);
        }
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = io::stdout().execute(LeaveAlternateScreen);
        let _ = disable_raw_mode();
    }
}

fn format_value(val: &Value) -> String {
    match val {
        Value::Str(s) => format!("{:?}", s),
        other => other.to_string(),
    }
}

/// Run the debugger on a JSON syntax tree.
pub fn run_debugger(path: &Path, config: &RuntimeConfig) -> Result<(), RunError> {
    let mut debugger = Debugger::new(path, config)?;
    debugger
        .run()
        .map_err(|source| RunError::Terminal { source })?;
    if let Some(profile) = debugger.vm.format_profile() {
        eprint!("{}", profile);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::{BinaryOp, Node};

    use crossterm::event::{KeyEvent, KeyModifiers};
    use ratatui::backend::TestBackend;

    fn debugger(node: Node) -> Debugger {
        let compilation = compiler::compile_program(&Node::program(node)).unwrap();
        Debugger::from_compilation(compilation, &RuntimeConfig::default())
    }

    fn key(code: KeyCode) -> io::Result<Event> {
        Ok(Event::Key(KeyEvent::new(code, KeyModifiers::NONE)))
    }

    fn test_terminal() -> Terminal<TestBackend> {
        Terminal::new(TestBackend::new(100, 40)).unwrap()
    }

    fn counting_loop() -> Node {
        Node::block(vec![
            Node::assign("n", Node::int(0)),
            Node::while_loop(
                Node::binary(BinaryOp::Lt, Node::var("n"), Node::int(3)),
                Node::block(vec![
                    Node::call_stmt("println", vec![Node::var("n")]),
                    Node::assign("n", Node::binary(BinaryOp::Add, Node::var("n"), Node::int(1))),
                ]),
            ),
        ])
    }

    #[test]
    fn test_step_and_print_slot() {
        let mut dbg = debugger(counting_loop());
        dbg.process_command("p n");
        assert_eq!(dbg.status, "$0 n = <unset>");

        dbg.process_command("s 2");
        assert_eq!(dbg.vm.ip(), 2);
        dbg.process_command("p n");
        assert_eq!(dbg.status, "$0 n = 0");
        dbg.process_command("p $0");
        assert_eq!(dbg.status, "$0 n = 0");
    }

    #[test]
    fn test_breakpoint_and_continue() {
        let mut dbg = debugger(counting_loop());
        // @2 is the loop condition
        dbg.process_command("b 2");
        dbg.process_command("c");
        assert_eq!(dbg.status, "Breakpoint hit at @2");
        dbg.process_command("c");
        assert_eq!(dbg.status, "Breakpoint hit at @2");
        assert_eq!(dbg.output.contents(), "0\n");

        dbg.process_command("d 2");
        dbg.process_command("c");
        assert_eq!(dbg.status, "Program completed.");
        assert_eq!(dbg.output.contents(), "0\n1\n2\n");

        dbg.process_command("s");
        assert_eq!(dbg.status, "Program has ended.");
    }

    #[test]
    fn test_breakpoint_list_and_bounds() {
        let mut dbg = debugger(counting_loop());
        dbg.process_command("b 4");
        dbg.process_command("b @1");
        dbg.process_command("bl");
        assert_eq!(dbg.status, "Breakpoints: @1, @4");

        dbg.process_command("b 999");
        assert_eq!(dbg.status, "No instruction at @999");
        dbg.process_command("b");
        assert_eq!(dbg.status, "Usage: b <address>");
    }

    #[test]
    fn test_fault_is_reported() {
        let mut dbg = debugger(Node::binary(BinaryOp::Sub, Node::string("a"), Node::int(1)));
        dbg.process_command("c");
        assert!(dbg.status.starts_with("Fault: unsupported operand types for -"));
        dbg.process_command("status");
        assert!(dbg.status.contains("EXECUTION: FAULTED"));
    }

    #[test]
    fn test_config_reaches_the_vm() {
        let config = RuntimeConfig {
            profile_opcodes: true,
            ..RuntimeConfig::default()
        };
        let compilation = compiler::compile_program(&Node::program(counting_loop())).unwrap();
        let mut dbg = Debugger::from_compilation(compilation, &config);
        dbg.process_command("s 2");
        let counts = dbg.vm.opcode_counts().unwrap();
        assert_eq!(counts.get("PUSH"), Some(&1));
        assert_eq!(counts.get("STORE"), Some(&1));

        assert!(debugger(counting_loop()).vm.opcode_counts().is_none());
    }

    #[test]
    fn test_event_loop_runs_commands() {
        let mut dbg = debugger(counting_loop());
        let mut terminal = test_terminal();
        let mut events = vec![
            key(KeyCode::Char('s')),
            key(KeyCode::Char(' ')),
            key(KeyCode::Char('x')),
            key(KeyCode::Backspace),
            key(KeyCode::Char('2')),
            key(KeyCode::Enter),
            key(KeyCode::Esc),
        ]
        .into_iter();
        dbg.run_loop(&mut terminal, || events.next().unwrap()).unwrap();
        assert_eq!(dbg.vm.ip(), 2);
        assert!(!dbg.running);
    }

    #[test]
    fn test_event_loop_propagates_input_errors() {
        let mut dbg = debugger(counting_loop());
        let mut terminal = test_terminal();
        let err = dbg
            .run_loop(&mut terminal, || Err(io::Error::other("input closed")))
            .unwrap_err();
        assert_eq!(err.to_string(), "input closed");
        assert!(dbg.running);
    }

    #[test]
    fn test_stack_and_quit() {
        let mut dbg = debugger(Node::block(vec![Node::int(1), Node::string("x")]));
        dbg.process_command("s 2");
        dbg.process_command("stack");
        assert_eq!(dbg.status, r#"Stack: [1, "x"]"#);

        dbg.process_command("bogus");
        assert_eq!(dbg.status, "Unknown command: bogus");
        dbg.process_command("q");
        assert!(!dbg.running);
    }
}
