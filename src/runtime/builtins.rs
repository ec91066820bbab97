use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;
use std::time::Duration;

use crate::runtime::runtime_error::{RuntimeError, RuntimeErrorKind};
use crate::runtime::value::Value;

/// Host functions reachable from every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Print,
    Len,
    Typeof,
    Sleep,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Builtin> {
        match name {
            "print" => Some(Builtin::Print),
            "len" => Some(Builtin::Len),
            "typeof" => Some(Builtin::Typeof),
            "sleep" => Some(Builtin::Sleep),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Print => "print",
            Builtin::Len => "len",
            Builtin::Typeof => "typeof",
            Builtin::Sleep => "sleep",
        }
    }
}

fn arity(b: Builtin, args: &[Value], expected: usize) -> Result<(), RuntimeError> {
    if args.len() == expected {
        return Ok(());
    }
    Err(RuntimeErrorKind::ArityMismatch {
        name: b.name().to_string(),
        expected: expected.to_string(),
        found: args.len(),
    }
    .into())
}

fn io_error(e: io::Error) -> RuntimeError {
    RuntimeError::other(format!("output error: {}", e))
}

pub fn call(b: Builtin, args: &[Value], out: &mut dyn Write) -> Result<Value, RuntimeError> {
    match b {
        Builtin::Print => {
            let line: Vec<String> = args.iter().map(Value::to_string).collect();
            writeln!(out, "{}", line.join("\t")).map_err(io_error)?;
            out.flush().map_err(io_error)?;
            Ok(Value::Nil)
        }
        Builtin::Len => {
            arity(b, args, 1)?;
            let len = match &args[0] {
                Value::Str(s) => s.chars().count(),
                Value::Array(a) => a.borrow().items.len(),
                Value::Tuple(t) => t.items.len(),
                Value::Map(m) => m.borrow().entries.len(),
                other => {
                    return Err(RuntimeErrorKind::UnsupportedOperand(format!(
                        "len of {}",
                        other.describe()
                    ))
                    .into());
                }
            };
            Ok(Value::Int(len as i64))
        }
        Builtin::Typeof => {
            arity(b, args, 1)?;
            Ok(Value::Str(args[0].kind_name().to_string()))
        }
        Builtin::Sleep => {
            arity(b, args, 1)?;
            match &args[0] {
                Value::Int(ms) if *ms >= 0 => {
                    std::thread::sleep(Duration::from_millis(*ms as u64));
                    Ok(Value::Nil)
                }
                other => Err(RuntimeErrorKind::TypeMismatch {
                    expected: "non-negative <int>".to_string(),
                    found: other.describe(),
                }
                .into()),
            }
        }
    }
}

/// In-memory output sink; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_joins_with_tabs() {
        let mut buf = SharedBuffer::new();
        call(
            Builtin::Print,
            &[Value::Int(1), Value::Str("a".to_string()), Value::Float(2.0)],
            &mut buf,
        )
        .unwrap();
        assert_eq!(buf.contents(), "1\ta\t2.0\n");
    }

    #[test]
    fn test_len() {
        let mut buf = SharedBuffer::new();
        let v = call(Builtin::Len, &[Value::Str("héllo".to_string())], &mut buf).unwrap();
        assert!(matches!(v, Value::Int(5)));
        let v = call(
            Builtin::Len,
            &[Value::array(vec![Value::Int(1), Value::Int(2)])],
            &mut buf,
        )
        .unwrap();
        assert!(matches!(v, Value::Int(2)));
        assert!(call(Builtin::Len, &[Value::Int(1)], &mut buf).is_err());
    }

    #[test]
    fn test_typeof_and_arity() {
        let mut buf = SharedBuffer::new();
        let v = call(Builtin::Typeof, &[Value::Float(1.0)], &mut buf).unwrap();
        assert!(matches!(v, Value::Str(s) if s == "float"));
        let err = call(Builtin::Typeof, &[], &mut buf).unwrap_err();
        assert!(matches!(err.kind, RuntimeErrorKind::ArityMismatch { .. }));
    }

    #[test]
    fn test_names_round_trip() {
        for b in [Builtin::Print, Builtin::Len, Builtin::Typeof, Builtin::Sleep] {
            assert_eq!(Builtin::from_name(b.name()), Some(b));
        }
        assert_eq!(Builtin::from_name("printf"), None);
    }
}
