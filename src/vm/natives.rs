//! Host function dispatch.
//!
//! The VM only knows native functions by index. A [`NativeDispatcher`] turns
//! an index plus the live operand stack into exactly one pushed result.
//! [`Natives`] is the stock dispatcher: a name-keyed registry bound to the
//! compiler's native table.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::Rc;

use super::{NativeError, Value};

/// Calling contract for host functions.
///
/// `invoke` must pop exactly the arguments the function takes (the first
/// argument is on top) and push exactly one result.
pub trait NativeDispatcher {
    fn invoke(&mut self, index: usize, stack: &mut Vec<Value>) -> Result<(), NativeError>;

    /// Display name of a native index, for listings.
    fn name(&self, _index: usize) -> Option<&str> {
        None
    }
}

impl<F> NativeDispatcher for F
where
    F: FnMut(usize, &mut Vec<Value>) -> Result<(), NativeError>,
{
    fn invoke(&mut self, index: usize, stack: &mut Vec<Value>) -> Result<(), NativeError> {
        self(index, stack)
    }
}

/// Dispatcher that resolves nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNatives;

impl NativeDispatcher for NoNatives {
    fn invoke(&mut self, _index: usize, _stack: &mut Vec<Value>) -> Result<(), NativeError> {
        Err(NativeError::NotFound)
    }
}

/// Signature of a registered host function.
pub type NativeFn = fn(&mut dyn Write, &mut Vec<Value>) -> Result<(), NativeError>;

/// Name-keyed registry of host functions.
pub struct Natives {
    registry: HashMap<String, NativeFn>,
    /// Indexed by native-table index; `None` for names the registry lacks.
    bound: Vec<Option<(String, NativeFn)>>,
    output: Box<dyn Write>,
}

impl Natives {
    /// Empty registry writing to stdout.
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Empty registry with a custom output stream.
    pub fn with_output(output: Box<dyn Write>) -> Self {
        Self {
            registry: HashMap::new(),
            bound: Vec::new(),
            output,
        }
    }

    /// The standard library writing to stdout.
    pub fn standard() -> Self {
        Self::standard_with_output(Box::new(io::stdout()))
    }

    pub fn standard_with_output(output: Box<dyn Write>) -> Self {
        let mut natives = Self::with_output(output);
        natives.register("print", native_print);
        natives.register("println", native_println);
        natives.register("str", native_str);
        natives.register("int", native_int);
        natives.register("float", native_float);
        natives.register("len", native_len);
        natives.register("abs", native_abs);
        natives.register("sqrt", native_sqrt);
        natives.register("min", native_min);
        natives.register("max", native_max);
        natives
    }

    pub fn register(&mut self, name: &str, f: NativeFn) {
        self.registry.insert(name.to_string(), f);
    }

    /// Bind the compiler's name → index table. Unknown names stay unbound
    /// and fail only when called.
    pub fn bind(mut self, table: &HashMap<String, usize>) -> Self {
        let len = table.values().map(|i| i + 1).max().unwrap_or(0);
        self.bound = vec![None; len];
        for (name, &index) in table {
            match self.registry.get(name) {
                Some(f) => self.bound[index] = Some((name.clone(), *f)),
                None => tracing::warn!(name = %name, index, "native function has no host binding"),
            }
        }
        self
    }

    /// Names the compiler allocated that have no host binding.
    pub fn unresolved<'a>(&self, table: &'a HashMap<String, usize>) -> Vec<&'a str> {
        let mut names: Vec<&str> = table
            .keys()
            .filter(|name| !self.registry.contains_key(name.as_str()))
            .map(|name| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}

impl Default for Natives {
    fn default() -> Self {
        Self::standard()
    }
}

impl NativeDispatcher for Natives {
    fn invoke(&mut self, index: usize, stack: &mut Vec<Value>) -> Result<(), NativeError> {
        let (name, f) = self
            .bound
            .get(index)
            .and_then(|entry| entry.as_ref())
            .ok_or(NativeError::NotFound)?;
        tracing::debug!(name = %name, index, "native call");
        f(self.output.as_mut(), stack)
    }

    fn name(&self, index: usize) -> Option<&str> {
        self.bound
            .get(index)
            .and_then(|entry| entry.as_ref())
            .map(|(name, _)| name.as_str())
    }
}

/// A cloneable in-memory writer; every clone appends to the same buffer.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer(Rc<RefCell<Vec<u8>>>);

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn pop_arg(stack: &mut Vec<Value>) -> Result<Value, NativeError> {
    stack
        .pop()
        .ok_or_else(|| NativeError::failed("missing argument"))
}

fn pop_number(stack: &mut Vec<Value>, name: &str) -> Result<Value, NativeError> {
    match pop_arg(stack)? {
        Value::Str(_) => Err(NativeError::failed(format!("{} expects a number", name))),
        v => Ok(v),
    }
}

fn io_error(e: io::Error) -> NativeError {
    NativeError::failed(format!("io error: {}", e))
}

fn native_print(out: &mut dyn Write, stack: &mut Vec<Value>) -> Result<(), NativeError> {
    let value = pop_arg(stack)?;
    write!(out, "{}", value).map_err(io_error)?;
    out.flush().map_err(io_error)?;
    stack.push(Value::Int(0));
    Ok(())
}

fn native_println(out: &mut dyn Write, stack: &mut Vec<Value>) -> Result<(), NativeError> {
    let value = pop_arg(stack)?;
    writeln!(out, "{}", value).map_err(io_error)?;
    stack.push(Value::Int(0));
    Ok(())
}

fn native_str(_out: &mut dyn Write, stack: &mut Vec<Value>) -> Result<(), NativeError> {
    let value = pop_arg(stack)?;
    stack.push(Value::Str(value.to_string()));
    Ok(())
}

fn native_int(_out: &mut dyn Write, stack: &mut Vec<Value>) -> Result<(), NativeError> {
    let result = match pop_arg(stack)? {
        Value::Int(n) => n,
        Value::Float(f) => f as i64,
        Value::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| NativeError::failed(format!("cannot parse '{}' as int", s)))?,
    };
    stack.push(Value::Int(result));
    Ok(())
}

fn native_float(_out: &mut dyn Write, stack: &mut Vec<Value>) -> Result<(), NativeError> {
    let result = match pop_arg(stack)? {
        Value::Int(n) => n as f64,
        Value::Float(f) => f,
        Value::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| NativeError::failed(format!("cannot parse '{}' as float", s)))?,
    };
    stack.push(Value::Float(result));
    Ok(())
}

fn native_len(_out: &mut dyn Write, stack: &mut Vec<Value>) -> Result<(), NativeError> {
    match pop_arg(stack)? {
        Value::Str(s) => {
            stack.push(Value::Int(s.chars().count() as i64));
            Ok(())
        }
        other => Err(NativeError::failed(format!(
            "len expects a string, got {}",
            other.type_name()
        ))),
    }
}

fn native_abs(_out: &mut dyn Write, stack: &mut Vec<Value>) -> Result<(), NativeError> {
    let result = match pop_arg(stack)? {
        Value::Int(n) => Value::Int(n.wrapping_abs()),
        Value::Float(f) => Value::Float(f.abs()),
        Value::Str(_) => return Err(NativeError::failed("abs expects a number")),
    };
    stack.push(result);
    Ok(())
}

fn native_sqrt(_out: &mut dyn Write, stack: &mut Vec<Value>) -> Result<(), NativeError> {
    let value = pop_number(stack, "sqrt")?;
    let f = value.as_float().unwrap_or_default();
    stack.push(Value::Float(f.sqrt()));
    Ok(())
}

/// `keep_first` sees how the first argument orders against the second.
fn min_max(
    stack: &mut Vec<Value>,
    name: &str,
    keep_first: fn(Ordering) -> bool,
) -> Result<(), NativeError> {
    let first = pop_number(stack, name)?;
    let second = pop_number(stack, name)?;
    let result = match (&first, &second) {
        (Value::Int(a), Value::Int(b)) => {
            if keep_first(a.cmp(b)) { first } else { second }
        }
        _ => {
            let a = first.as_float().unwrap_or_default();
            let b = second.as_float().unwrap_or_default();
            let keep = a.partial_cmp(&b).is_some_and(keep_first);
            Value::Float(if keep { a } else { b })
        }
    };
    stack.push(result);
    Ok(())
}

fn native_min(_out: &mut dyn Write, stack: &mut Vec<Value>) -> Result<(), NativeError> {
    min_max(stack, "min", |o| o != Ordering::Greater)
}

fn native_max(_out: &mut dyn Write, stack: &mut Vec<Value>) -> Result<(), NativeError> {
    min_max(stack, "max", |o| o != Ordering::Less)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(names: &[&str]) -> HashMap<String, usize> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.to_string(), i))
            .collect()
    }

    #[test]
    fn test_println_writes_and_pushes_zero() {
        let out = OutputBuffer::new();
        let mut natives =
            Natives::standard_with_output(Box::new(out.clone())).bind(&table(&["println"]));
        let mut stack = vec![Value::str("hello")];
        natives.invoke(0, &mut stack).unwrap();
        assert_eq!(out.contents(), "hello\n");
        assert_eq!(stack, vec![Value::Int(0)]);
    }

    #[test]
    fn test_unbound_name_is_not_found() {
        let mut natives = Natives::standard().bind(&table(&["str", "frobnicate"]));
        let mut stack = vec![Value::Int(1)];
        assert_eq!(natives.invoke(1, &mut stack), Err(NativeError::NotFound));
        assert_eq!(natives.invoke(7, &mut stack), Err(NativeError::NotFound));
        assert_eq!(natives.name(0), Some("str"));
        assert_eq!(natives.name(1), None);
    }

    #[test]
    fn test_unresolved_names() {
        let natives = Natives::standard();
        let t = table(&["sqrt", "zeta", "alpha"]);
        assert_eq!(natives.unresolved(&t), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_min_pops_first_argument_from_top() {
        let mut natives = Natives::standard().bind(&table(&["min"]));
        // min(3, 8): arguments pushed right-to-left, so 3 is on top
        let mut stack = vec![Value::Int(8), Value::Int(3)];
        natives.invoke(0, &mut stack).unwrap();
        assert_eq!(stack, vec![Value::Int(3)]);
    }

    #[test]
    fn test_min_max_large_ints_are_exact() {
        let mut natives = Natives::standard().bind(&table(&["min", "max"]));
        let mut stack = vec![Value::Int(i64::MAX - 1), Value::Int(i64::MAX)];
        natives.invoke(0, &mut stack).unwrap();
        assert_eq!(stack, vec![Value::Int(i64::MAX - 1)]);

        let mut stack = vec![Value::Int(i64::MAX), Value::Int(i64::MAX - 1)];
        natives.invoke(1, &mut stack).unwrap();
        assert_eq!(stack, vec![Value::Int(i64::MAX)]);
    }

    #[test]
    fn test_min_max_mixed_widens() {
        let mut natives = Natives::standard().bind(&table(&["min", "max"]));
        let mut stack = vec![Value::Float(2.5), Value::Int(3)];
        natives.invoke(0, &mut stack).unwrap();
        assert_eq!(stack, vec![Value::Float(2.5)]);

        let mut stack = vec![Value::Float(2.5), Value::Int(3)];
        natives.invoke(1, &mut stack).unwrap();
        assert_eq!(stack, vec![Value::Float(3.0)]);
    }

    #[test]
    fn test_int_parse_failure() {
        let mut natives = Natives::standard().bind(&table(&["int"]));
        let mut stack = vec![Value::str("abc")];
        let err = natives.invoke(0, &mut stack).unwrap_err();
        assert!(err.to_string().contains("cannot parse"));
    }

    #[test]
    fn test_closure_dispatcher() {
        let mut calls = 0;
        let mut dispatcher = |index: usize, stack: &mut Vec<Value>| -> Result<(), NativeError> {
            calls += 1;
            stack.push(Value::Int(index as i64));
            Ok(())
        };
        let mut stack = Vec::new();
        dispatcher.invoke(4, &mut stack).unwrap();
        assert_eq!(stack, vec![Value::Int(4)]);
        assert_eq!(calls, 1);
    }
}
