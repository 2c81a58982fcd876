//! Typed values that cross the bridge: the [`Tag`] alphabet from a parameter
//! signature, and the [`Value`] union used to pass/return them generically.

use crate::error::{Error, Result};
use crate::pointer::Address;
use std::ffi::CString;

/// One type tag, drawn from a closed set of primitive and pointer kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    /// ABI-sized "long": i64 on LP64 Unix, i32 on LLP64 Windows.
    Long,
    /// ABI-sized unsigned "long".
    ULong,
    I64,
    U64,
    F32,
    F64,
    Pointer,
    /// NUL-terminated C string, pointer-to-char.
    CStr,
    /// Valid only in return position.
    Void,
}

impl Tag {
    pub fn from_char(c: char) -> Result<Self> {
        Ok(match c {
            'b' => Tag::Bool,
            'c' => Tag::I8,
            'C' => Tag::U8,
            's' => Tag::I16,
            'S' => Tag::U16,
            'i' => Tag::I32,
            'I' => Tag::U32,
            'l' => Tag::Long,
            'L' => Tag::ULong,
            'j' => Tag::I64,
            'J' => Tag::U64,
            'f' => Tag::F32,
            'd' => Tag::F64,
            'p' => Tag::Pointer,
            't' => Tag::CStr,
            'v' => Tag::Void,
            other => {
                return Err(Error::ParameterSignatureMalformed(format!(
                    "unknown type tag '{other}'"
                )))
            }
        })
    }

    pub fn to_char(self) -> char {
        match self {
            Tag::Bool => 'b',
            Tag::I8 => 'c',
            Tag::U8 => 'C',
            Tag::I16 => 's',
            Tag::U16 => 'S',
            Tag::I32 => 'i',
            Tag::U32 => 'I',
            Tag::Long => 'l',
            Tag::ULong => 'L',
            Tag::I64 => 'j',
            Tag::U64 => 'J',
            Tag::F32 => 'f',
            Tag::F64 => 'd',
            Tag::Pointer => 'p',
            Tag::CStr => 't',
            Tag::Void => 'v',
        }
    }

    /// Size in bytes of the ABI-sized "long" tags on the current target.
    #[cfg(all(unix, target_pointer_width = "64"))]
    pub const LONG_BITS: u32 = 64;
    #[cfg(not(all(unix, target_pointer_width = "64")))]
    pub const LONG_BITS: u32 = 32;
}

/// A runtime value flowing across the bridge: either bound for the native
/// ABI as an argument, or decoded from a return slot.
#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    /// Raw address; used for both the `p` tag and as the ABI-sized `l`/`L`
    /// representation (both are machine words on every target we support).
    Pointer(Address),
    /// Owns the C string's storage so it stays alive for the call.
    CStr(CString),
    Void,
}

impl Value {
    pub fn tag(&self) -> Tag {
        match self {
            Value::Bool(_) => Tag::Bool,
            Value::I8(_) => Tag::I8,
            Value::U8(_) => Tag::U8,
            Value::I16(_) => Tag::I16,
            Value::U16(_) => Tag::U16,
            Value::I32(_) => Tag::I32,
            Value::U32(_) => Tag::U32,
            Value::I64(_) => Tag::I64,
            Value::U64(_) => Tag::U64,
            Value::F32(_) => Tag::F32,
            Value::F64(_) => Tag::F64,
            Value::Pointer(_) => Tag::Pointer,
            Value::CStr(_) => Tag::CStr,
            Value::Void => Tag::Void,
        }
    }

    /// Reinterprets this value as a plain machine word, for tags that are
    /// integer-like on the wire (`l`/`L`/`p`, and the narrower integer tags
    /// widened for register passing).
    pub fn as_word(&self) -> Result<u64> {
        Ok(match *self {
            Value::Bool(b) => b as u64,
            Value::I8(v) => v as i64 as u64,
            Value::U8(v) => v as u64,
            Value::I16(v) => v as i64 as u64,
            Value::U16(v) => v as u64,
            Value::I32(v) => v as i64 as u64,
            Value::U32(v) => v as u64,
            Value::I64(v) => v as u64,
            Value::U64(v) => v,
            Value::Pointer(addr) => addr.as_usize() as u64,
            Value::CStr(ref s) => s.as_ptr() as u64,
            Value::F32(_) | Value::F64(_) | Value::Void => {
                return Err(Error::ArgumentOutOfRange {
                    position: 0,
                    tag: self.tag().to_char(),
                })
            }
        })
    }

    /// Narrows an integer-valued argument into the slot demanded by `tag`,
    /// failing with `ArgumentOutOfRange` if bits would be lost.
    pub fn coerce(self, tag: Tag, position: usize) -> Result<Value> {
        let out_of_range = || Error::ArgumentOutOfRange {
            position,
            tag: tag.to_char(),
        };

        // Pointer values are accepted anywhere an integer or pointer tag is
        // expected, and vice versa.
        let word = match (&self, tag) {
            (Value::Pointer(_), Tag::Pointer) => return Ok(self),
            (Value::CStr(_), Tag::CStr) => return Ok(self),
            (Value::F32(_), Tag::F32) | (Value::F64(_), Tag::F64) => return Ok(self),
            (Value::F64(f), Tag::F32) => {
                let narrowed = *f as f32;
                if narrowed as f64 != *f {
                    return Err(out_of_range());
                }
                return Ok(Value::F32(narrowed));
            }
            (Value::F32(f), Tag::F64) => return Ok(Value::F64(*f as f64)),
            (Value::Bool(b), Tag::Bool) => return Ok(Value::Bool(*b)),
            _ => self.as_word().map_err(|_| out_of_range())?,
        };

        Ok(match tag {
            Tag::Bool => {
                if word > 1 {
                    return Err(out_of_range());
                }
                Value::Bool(word != 0)
            }
            Tag::I8 => {
                let v = word as i64;
                if v < i8::MIN as i64 || v > i8::MAX as i64 {
                    return Err(out_of_range());
                }
                Value::I8(v as i8)
            }
            Tag::U8 => {
                if word > u8::MAX as u64 {
                    return Err(out_of_range());
                }
                Value::U8(word as u8)
            }
            Tag::I16 => {
                let v = word as i64;
                if v < i16::MIN as i64 || v > i16::MAX as i64 {
                    return Err(out_of_range());
                }
                Value::I16(v as i16)
            }
            Tag::U16 => {
                if word > u16::MAX as u64 {
                    return Err(out_of_range());
                }
                Value::U16(word as u16)
            }
            Tag::I32 => {
                let v = word as i64;
                if v < i32::MIN as i64 || v > i32::MAX as i64 {
                    return Err(out_of_range());
                }
                Value::I32(v as i32)
            }
            Tag::U32 => {
                if word > u32::MAX as u64 {
                    return Err(out_of_range());
                }
                Value::U32(word as u32)
            }
            Tag::Long | Tag::I64 => Value::I64(word as i64),
            Tag::ULong | Tag::U64 => Value::U64(word),
            Tag::Pointer => Value::Pointer(Address::new(word as usize)),
            Tag::CStr => return Err(out_of_range()),
            Tag::F32 | Tag::F64 => return Err(out_of_range()),
            Tag::Void => return Err(out_of_range()),
        })
    }
}
