//! Value codec between host numerics and raw 64-bit value slots.
//!
//! Every WebAssembly value crosses the call boundary as a `u64` slot:
//! - `i32`: zero-extended into the low 32 bits
//! - `i64`: direct reinterpretation
//! - `f32`: IEEE-754 bit pattern in the low 32 bits
//! - `f64`: full IEEE-754 bit pattern
//! - `externref`: pointer-sized integer

#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap, clippy::cast_possible_truncation)]

use std::fmt;

use wasmtime::{HeapType, Val, ValType};

/// WebAssembly value types understood by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
    ExternRef,
}

impl ValueType {
    /// Returns `true` for `f32`/`f64`.
    pub fn is_float(self) -> bool {
        matches!(self, ValueType::F32 | ValueType::F64)
    }

    /// Returns `true` for `i32`/`i64`.
    pub fn is_integer(self) -> bool {
        matches!(self, ValueType::I32 | ValueType::I64)
    }

    /// Map to the engine's value type.
    pub fn to_val_type(self) -> ValType {
        match self {
            ValueType::I32 => ValType::I32,
            ValueType::I64 => ValType::I64,
            ValueType::F32 => ValType::F32,
            ValueType::F64 => ValType::F64,
            ValueType::ExternRef => ValType::EXTERNREF,
        }
    }

    /// Map from the engine's value type. `None` for types the runtime does not carry.
    pub fn from_val_type(ty: &ValType) -> Option<Self> {
        match ty {
            ValType::I32 => Some(ValueType::I32),
            ValType::I64 => Some(ValueType::I64),
            ValType::F32 => Some(ValueType::F32),
            ValType::F64 => Some(ValueType::F64),
            ValType::Ref(r) if matches!(r.heap_type(), HeapType::Extern) => {
                Some(ValueType::ExternRef)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::I32 => write!(f, "i32"),
            ValueType::I64 => write!(f, "i64"),
            ValueType::F32 => write!(f, "f32"),
            ValueType::F64 => write!(f, "f64"),
            ValueType::ExternRef => write!(f, "externref"),
        }
    }
}

/// A typed WebAssembly value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    ExternRef(usize),
}

impl Value {
    /// The value's type.
    pub fn ty(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::ExternRef(_) => ValueType::ExternRef,
        }
    }

    /// Encode into a raw slot.
    pub fn to_raw(self) -> u64 {
        match self {
            Value::I32(v) => encode_i32(v),
            Value::I64(v) => encode_i64(v),
            Value::F32(v) => encode_f32(v),
            Value::F64(v) => encode_f64(v),
            Value::ExternRef(v) => encode_externref(v),
        }
    }

    /// Decode a raw slot of type `ty`.
    pub fn from_raw(ty: ValueType, raw: u64) -> Self {
        match ty {
            ValueType::I32 => Value::I32(decode_i32(raw)),
            ValueType::I64 => Value::I64(decode_i64(raw)),
            ValueType::F32 => Value::F32(decode_f32(raw)),
            ValueType::F64 => Value::F64(decode_f64(raw)),
            ValueType::ExternRef => Value::ExternRef(decode_externref(raw)),
        }
    }

    /// Convert to an engine value.
    ///
    /// Only the null reference crosses the boundary as an `externref`.
    pub fn to_val(self) -> Result<Val, String> {
        match self {
            Value::I32(v) => Ok(Val::I32(v)),
            Value::I64(v) => Ok(Val::I64(v)),
            Value::F32(v) => Ok(Val::F32(v.to_bits())),
            Value::F64(v) => Ok(Val::F64(v.to_bits())),
            Value::ExternRef(0) => Ok(Val::ExternRef(None)),
            Value::ExternRef(v) => Err(format!("non-null externref {v:#x}")),
        }
    }

    /// Convert from an engine value.
    pub fn from_val(val: &Val) -> Result<Self, String> {
        match val {
            Val::I32(v) => Ok(Value::I32(*v)),
            Val::I64(v) => Ok(Value::I64(*v)),
            Val::F32(bits) => Ok(Value::F32(f32::from_bits(*bits))),
            Val::F64(bits) => Ok(Value::F64(f64::from_bits(*bits))),
            Val::ExternRef(None) => Ok(Value::ExternRef(0)),
            Val::ExternRef(Some(_)) => Err("non-null externref".to_string()),
            other => Err(format!("unsupported value {other:?}")),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_i32().map(|v| v as u32)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i64().map(|v| v as u64)
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::I32(v as i32)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::I64(v as i64)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

pub fn encode_i32(v: i32) -> u64 {
    u64::from(v as u32)
}

pub fn decode_i32(raw: u64) -> i32 {
    raw as u32 as i32
}

pub fn encode_u32(v: u32) -> u64 {
    u64::from(v)
}

pub fn decode_u32(raw: u64) -> u32 {
    raw as u32
}

pub fn encode_i64(v: i64) -> u64 {
    v as u64
}

pub fn decode_i64(raw: u64) -> i64 {
    raw as i64
}

pub fn encode_f32(v: f32) -> u64 {
    u64::from(v.to_bits())
}

pub fn decode_f32(raw: u64) -> f32 {
    f32::from_bits(raw as u32)
}

pub fn encode_f64(v: f64) -> u64 {
    v.to_bits()
}

pub fn decode_f64(raw: u64) -> f64 {
    f64::from_bits(raw)
}

pub fn encode_externref(v: usize) -> u64 {
    v as u64
}

pub fn decode_externref(raw: u64) -> usize {
    raw as usize
}
