//! Human-readable listings of compiled programs.

use std::collections::HashMap;

use crate::compiler::SymbolTables;
use crate::vm::{Op, Program};

/// Disassembler for a compiled program.
///
/// Annotates jumps, invocations and slot accesses with the names recorded
/// in the symbol tables, and marks function entry points with a label line.
pub struct Disassembler<'a> {
    program: &'a Program,
    symbols: &'a SymbolTables,
    output: String,
}

impl<'a> Disassembler<'a> {
    pub fn new(program: &'a Program, symbols: &'a SymbolTables) -> Self {
        Self {
            program,
            symbols,
            output: String::new(),
        }
    }

    pub fn disassemble(&mut self) -> &str {
        self.output.push_str(&format!(
            "== Program ({} instructions, {} slots) ==\n",
            self.program.len(),
            self.program.slot_count
        ));
        for (address, op) in self.program.code.iter().enumerate() {
            if let Some(name) = self.symbols.function_at(address) {
                self.output.push_str(&format!("{}:\n", name));
            }
            self.output.push_str(&format!("{:04}: ", address));
            self.output.push_str(&format_op(op, self.symbols));
            self.output.push('\n');
        }
        &self.output
    }

    /// Append the symbol tables, sorted by number.
    pub fn symbols(&mut self) -> &str {
        let symbols = self.symbols;
        self.output.push('\n');
        self.write_table("Slots", &symbols.variables, '$');
        self.write_table("Functions", &symbols.functions, '@');
        self.write_table("Natives", &symbols.natives, '#');
        &self.output
    }

    fn write_table(
        &mut self,
        title: &str,
        table: &HashMap<String, usize>,
        sigil: char,
    ) {
        if table.is_empty() {
            return;
        }
        self.output.push_str(&format!("== {} ==\n", title));
        let mut entries: Vec<(&String, &usize)> = table.iter().collect();
        entries.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
        for (name, n) in entries {
            self.output.push_str(&format!("  {}{:<4} {}\n", sigil, n, name));
        }
    }
}

/// Format one instruction, with a trailing `; name` comment where known.
pub fn format_op(op: &Op, symbols: &SymbolTables) -> String {
    let note = match op {
        Op::Store(slot) | Op::Fetch(slot) => symbols.variable_name(*slot),
        Op::Invoke(target) => symbols.function_at(*target),
        Op::Native(index) => symbols.native_name(*index),
        _ => None,
    };
    match note {
        Some(name) => format!("{} ; {}", op, name),
        None => op.to_string(),
    }
}

/// Listing of the program alone.
pub fn format_bytecode(program: &Program, symbols: &SymbolTables) -> String {
    let mut disassembler = Disassembler::new(program, symbols);
    disassembler.disassemble().to_string()
}

/// Listing followed by the symbol tables.
pub fn format_with_symbols(program: &Program, symbols: &SymbolTables) -> String {
    let mut disassembler = Disassembler::new(program, symbols);
    disassembler.disassemble();
    disassembler.symbols().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::{BinaryOp, Node};
    use crate::compiler::compile_program;

    fn compile(node: Node) -> (Program, SymbolTables) {
        let c = compile_program(&Node::program(node)).unwrap();
        (c.program, c.symbols)
    }

    #[test]
    fn test_bytecode_simple() {
        let (program, symbols) = compile(Node::assign("x", Node::int(42)));
        let output = format_bytecode(&program, &symbols);
        assert!(output.contains("== Program (3 instructions, 1 slots) =="));
        assert!(output.contains("0000: PUSH Int(42)"));
        assert!(output.contains("0001: STORE $0 ; x"));
        assert!(output.contains("0002: RET"));
    }

    #[test]
    fn test_bytecode_function() {
        let (program, symbols) = compile(Node::block(vec![
            Node::function(
                "add",
                &["a", "b"],
                Node::binary(BinaryOp::Add, Node::var("a"), Node::var("b")),
            ),
            Node::call_stmt("println", vec![Node::call("add", vec![Node::int(1), Node::int(2)])]),
        ]));
        let output = format_bytecode(&program, &symbols);
        assert!(output.contains("add:\n0001: STORE $0 ; a"));
        assert!(output.contains("INVOKE @1 ; add"));
        assert!(output.contains("NATIVE #0 ; println"));
    }

    #[test]
    fn test_symbol_tables() {
        let (program, symbols) = compile(Node::block(vec![
            Node::assign("b", Node::int(1)),
            Node::assign("a", Node::int(2)),
            Node::call_stmt("print", vec![Node::var("a")]),
        ]));
        let output = format_with_symbols(&program, &symbols);
        assert!(output.contains("== Slots ==\n  $0    b\n  $1    a\n"));
        assert!(output.contains("== Natives ==\n  #0    print\n"));
        assert!(!output.contains("== Functions =="));
    }

    #[test]
    fn test_control_flow_targets() {
        let (program, symbols) = compile(Node::if_else(
            Node::int(1),
            Node::int(2),
            Node::int(3),
        ));
        let output = format_bytecode(&program, &symbols);
        assert!(output.contains("JZ @4"));
        assert!(output.contains("JMP @5"));
    }
}
