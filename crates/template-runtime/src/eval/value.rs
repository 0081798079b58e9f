// Runtime value type exchanged with the expression evaluator

use std::fmt;

use crate::error::{ErrorKind, EvalError};
use crate::reader::Endianness;
use crate::types::BasicKind;

use super::variable::VarId;

/// A decoded or computed value
#[derive(Debug, Clone)]
pub enum Value {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Bool(bool),
    Char(char),
    String(String),
    Null,
    /// In-memory array (local arrays, initializer lists)
    Array(Vec<Value>),
    /// A compound or array variable in the tree
    Ref(VarId),
}

impl Value {
    fn conversion(&self, to: &'static str) -> EvalError {
        ErrorKind::Conversion {
            from: format!("{:?}", self),
            to,
        }
        .into()
    }

    #[inline]
    pub fn to_unsigned(&self) -> Result<u64, EvalError> {
        match self {
            Value::Unsigned(v) => Ok(*v),
            Value::Signed(v) => Ok(*v as u64),
            Value::Float(v) => Ok(*v as u64),
            Value::Bool(v) => Ok(*v as u64),
            Value::Char(v) => Ok(*v as u64),
            Value::Null => Ok(0),
            _ => Err(self.conversion("unsigned")),
        }
    }

    #[inline]
    pub fn to_signed(&self) -> Result<i64, EvalError> {
        match self {
            Value::Unsigned(v) => Ok(*v as i64),
            Value::Signed(v) => Ok(*v),
            Value::Float(v) => Ok(*v as i64),
            Value::Bool(v) => Ok(*v as i64),
            Value::Char(v) => Ok(*v as i64),
            Value::Null => Ok(0),
            _ => Err(self.conversion("signed")),
        }
    }

    pub fn to_float(&self) -> Result<f64, EvalError> {
        match self {
            Value::Unsigned(v) => Ok(*v as f64),
            Value::Signed(v) => Ok(*v as f64),
            Value::Float(v) => Ok(*v),
            Value::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Value::Char(v) => Ok(*v as u32 as f64),
            _ => Err(self.conversion("float")),
        }
    }

    #[inline]
    pub fn to_bool(&self) -> Result<bool, EvalError> {
        match self {
            Value::Unsigned(v) => Ok(*v != 0),
            Value::Signed(v) => Ok(*v != 0),
            Value::Float(v) => Ok(*v != 0.0),
            Value::Bool(v) => Ok(*v),
            Value::Char(v) => Ok(*v != '\0'),
            Value::String(s) => Ok(!s.is_empty()),
            Value::Null => Ok(false),
            Value::Array(items) => Ok(!items.is_empty()),
            Value::Ref(_) => Ok(true),
        }
    }

    /// Interpret as an array length or bit width. Negative values are rejected.
    pub fn to_count(&self, what: &'static str) -> Result<u64, EvalError> {
        match self {
            Value::Signed(v) if *v < 0 => Err(ErrorKind::Negative {
                what,
                value: *v as i128,
            }
            .into()),
            Value::Float(v) if *v < 0.0 => Err(ErrorKind::Negative {
                what,
                value: *v as i128,
            }
            .into()),
            _ => self.to_unsigned(),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Unsigned(_) | Value::Signed(_) | Value::Float(_)
        )
    }

    /// Zero value of a basic kind, used for locals without initializer
    pub fn zero(kind: BasicKind) -> Value {
        match kind {
            BasicKind::Float | BasicKind::Double => Value::Float(0.0),
            BasicKind::Bool => Value::Bool(false),
            BasicKind::Char | BasicKind::Char16 => Value::Char('\0'),
            k if k.is_signed() => Value::Signed(0),
            _ => Value::Unsigned(0),
        }
    }

    /// Convert to the representation a `kind` variable holds, truncating
    /// integers to the kind's width.
    pub fn coerce(&self, kind: BasicKind) -> Result<Value, EvalError> {
        Ok(match kind {
            BasicKind::Float => Value::Float(self.to_float()? as f32 as f64),
            BasicKind::Double => Value::Float(self.to_float()?),
            BasicKind::Bool => Value::Bool(self.to_bool()?),
            BasicKind::Char => Value::Char(self.to_unsigned()? as u8 as char),
            BasicKind::Char16 => Value::Char(
                char::from_u32(self.to_unsigned()? as u16 as u32).unwrap_or('\u{FFFD}'),
            ),
            BasicKind::U8 => Value::Unsigned(self.to_unsigned()? as u8 as u64),
            BasicKind::U16 => Value::Unsigned(self.to_unsigned()? as u16 as u64),
            BasicKind::U32 => Value::Unsigned(self.to_unsigned()? as u32 as u64),
            BasicKind::U64 => Value::Unsigned(self.to_unsigned()?),
            BasicKind::S8 => Value::Signed(self.to_signed()? as i8 as i64),
            BasicKind::S16 => Value::Signed(self.to_signed()? as i16 as i64),
            BasicKind::S32 => Value::Signed(self.to_signed()? as i32 as i64),
            BasicKind::S64 => Value::Signed(self.to_signed()?),
        })
    }

    /// Decode one element of `kind` from `bytes` (exactly `kind.size()` long)
    pub fn decode(kind: BasicKind, bytes: &[u8], endian: Endianness) -> Value {
        let raw = match endian {
            Endianness::Little => bytes.iter().rev().fold(0u64, |acc, &b| (acc << 8) | b as u64),
            Endianness::Big => bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64),
        };
        match kind {
            BasicKind::U8 | BasicKind::U16 | BasicKind::U32 | BasicKind::U64 => {
                Value::Unsigned(raw)
            }
            BasicKind::S8 => Value::Signed(raw as u8 as i8 as i64),
            BasicKind::S16 => Value::Signed(raw as u16 as i16 as i64),
            BasicKind::S32 => Value::Signed(raw as u32 as i32 as i64),
            BasicKind::S64 => Value::Signed(raw as i64),
            BasicKind::Float => Value::Float(f32::from_bits(raw as u32) as f64),
            BasicKind::Double => Value::Float(f64::from_bits(raw)),
            BasicKind::Bool => Value::Bool(raw != 0),
            BasicKind::Char => Value::Char(raw as u8 as char),
            BasicKind::Char16 => Value::Char(char::from_u32(raw as u32).unwrap_or('\u{FFFD}')),
        }
    }

    /// Encode as `kind` into `out` (exactly `kind.size()` long)
    pub fn encode(&self, kind: BasicKind, out: &mut [u8], endian: Endianness) -> Result<(), EvalError> {
        let raw = match kind {
            BasicKind::Float => (self.to_float()? as f32).to_bits() as u64,
            BasicKind::Double => self.to_float()?.to_bits(),
            BasicKind::Bool => self.to_bool()? as u64,
            k if k.is_signed() => self.to_signed()? as u64,
            _ => self.to_unsigned()?,
        };
        let n = out.len();
        for (i, byte) in out.iter_mut().enumerate() {
            let shift = match endian {
                Endianness::Little => i,
                Endianness::Big => n - 1 - i,
            };
            *byte = (raw >> (shift * 8)) as u8;
        }
        Ok(())
    }

    pub fn to_display_string(&self) -> String {
        match self {
            Value::Unsigned(v) => v.to_string(),
            Value::Signed(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Bool(v) => v.to_string(),
            Value::Char(v) => v.to_string(),
            Value::String(v) => v.clone(),
            Value::Null => "null".to_string(),
            Value::Array(items) => {
                let inner: Vec<String> = items.iter().map(|v| v.to_display_string()).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Ref(id) => format!("<var #{}>", id.index()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unsigned(a), Value::Unsigned(b)) => a == b,
            (Value::Signed(a), Value::Signed(b)) => a == b,
            (Value::Unsigned(a), Value::Signed(b)) | (Value::Signed(b), Value::Unsigned(a)) => {
                *b >= 0 && *a == *b as u64
            }
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a == b,
            _ => false,
        }
    }
}
