//! The declarative record shapes the (external) INI-like loader must
//! deliver — function, virtual-function, and attribute records — plus the
//! `_nt`/`_posix` key-override rule and the identifier-format classifier.
//! Reading and parsing the actual config file is an external collaborator's
//! job; this module only defines what a parsed record must look like and
//! validates it.

use crate::error::{Error, Result};
use crate::pointer::Pointer;
use crate::signature::Convention;
use crate::value::{Tag, Value};
use std::collections::HashMap;

/// Resolves a bare key `K` against the OS-override rule: `K_nt` wins on
/// Windows, `K_posix` wins elsewhere, else the bare key.
pub fn resolve_key<'a>(fields: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    #[cfg(windows)]
    let os_key = format!("{key}_nt");
    #[cfg(not(windows))]
    let os_key = format!("{key}_posix");

    fields
        .get(&os_key)
        .or_else(|| fields.get(key))
        .map(String::as_str)
}

fn missing(key: &str) -> Error {
    Error::ParameterSignatureMalformed(format!("missing required key '{key}'"))
}

/// Parses an integer key that may be written in decimal or, as is common for
/// byte offsets, `0x`-prefixed hex.
fn parse_isize(raw: &str) -> Option<isize> {
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        isize::from_str_radix(hex, 16).ok()
    } else {
        raw.parse().ok()
    }
}

/// An identifier is either a symbol name or a space-separated hex byte
/// pattern, e.g. `"55 8B EC * * 56"` vs. `"add"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    Symbol(String),
    Pattern(String),
}

impl Identifier {
    /// Classifies a raw identifier string: whitespace-separated tokens that
    /// are each exactly two hex digits or `*` make a byte pattern;
    /// otherwise it's a symbol name.
    pub fn classify(raw: &str) -> Identifier {
        let looks_like_pattern = raw.contains(' ')
            && raw.split_whitespace().all(|tok| {
                tok == "*" || (tok.len() == 2 && tok.bytes().all(|b| b.is_ascii_hexdigit()))
            });
        if looks_like_pattern {
            Identifier::Pattern(raw.to_string())
        } else {
            Identifier::Symbol(raw.to_string())
        }
    }
}

/// Function record: `binary`, `identifier`, `parameters`, `convention`
/// (default `CDECL`), `srv_check` (default `true`), `documentation`
/// (default empty). `converter` is left to the external host type manager.
#[derive(Debug, Clone)]
pub struct FunctionRecord {
    pub binary: String,
    pub identifier: Identifier,
    pub parameters: String,
    pub convention: Convention,
    pub srv_check: bool,
    pub documentation: String,
}

impl FunctionRecord {
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let binary = resolve_key(fields, "binary").ok_or_else(|| missing("binary"))?;
        let raw_identifier =
            resolve_key(fields, "identifier").ok_or_else(|| missing("identifier"))?;
        let parameters = resolve_key(fields, "parameters").unwrap_or(")v");
        let convention = match resolve_key(fields, "convention") {
            Some(name) => Convention::from_name(name)?,
            None => Convention::Cdecl,
        };
        let srv_check = resolve_key(fields, "srv_check")
            .map(|v| !matches!(v, "false" | "0"))
            .unwrap_or(true);
        let documentation = resolve_key(fields, "documentation").unwrap_or("");

        Ok(FunctionRecord {
            binary: binary.to_string(),
            identifier: Identifier::classify(raw_identifier),
            parameters: parameters.to_string(),
            convention,
            srv_check,
            documentation: documentation.to_string(),
        })
    }
}

/// Virtual-function record: `identifier` (an integer vtable slot),
/// `parameters`, `convention` (default `THISCALL`), `documentation`.
#[derive(Debug, Clone)]
pub struct VirtualFunctionRecord {
    pub slot: usize,
    pub parameters: String,
    pub convention: Convention,
    pub documentation: String,
}

impl VirtualFunctionRecord {
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let slot_raw = resolve_key(fields, "identifier").ok_or_else(|| missing("identifier"))?;
        let slot: usize = slot_raw.parse().map_err(|_| {
            Error::ParameterSignatureMalformed(format!(
                "vtable slot {slot_raw:?} is not an integer"
            ))
        })?;
        let parameters = resolve_key(fields, "parameters").unwrap_or(")v");
        let convention = match resolve_key(fields, "convention") {
            Some(name) => Convention::from_name(name)?,
            None => Convention::Thiscall,
        };
        let documentation = resolve_key(fields, "documentation").unwrap_or("");

        Ok(VirtualFunctionRecord {
            slot,
            parameters: parameters.to_string(),
            convention,
            documentation: documentation.to_string(),
        })
    }
}

/// `READ | WRITE | READ_WRITE`, default `READ_WRITE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeFlags {
    Read,
    Write,
    ReadWrite,
}

impl AttributeFlags {
    fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "READ" => AttributeFlags::Read,
            "WRITE" => AttributeFlags::Write,
            "READ_WRITE" => AttributeFlags::ReadWrite,
            other => {
                return Err(Error::ParameterSignatureMalformed(format!(
                    "unknown flags value {other:?}"
                )))
            }
        })
    }
}

/// An attribute's declared type: a primitive tag, the special
/// `string_array` converter, or a nested type name the host type manager
/// resolves.
#[derive(Debug, Clone)]
pub enum AttributeType {
    Primitive(Tag),
    StringArray,
    Nested(String),
}

/// `{ offset, type_tag or nested-type name, length, is_array, aligned,
/// flags }`.
#[derive(Debug, Clone)]
pub struct AttributeDescriptor {
    pub offset: isize,
    pub kind: AttributeType,
    pub length: isize,
    pub is_array: bool,
    pub aligned: bool,
    pub flags: AttributeFlags,
    pub documentation: String,
}

impl AttributeDescriptor {
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let converter = resolve_key(fields, "converter").ok_or_else(|| missing("converter"))?;
        let kind = match converter {
            "string_array" => AttributeType::StringArray,
            single if single.chars().count() == 1 => {
                AttributeType::Primitive(Tag::from_char(single.chars().next().unwrap())?)
            }
            nested => AttributeType::Nested(nested.to_string()),
        };

        let offset_raw = resolve_key(fields, "identifier").ok_or_else(|| missing("identifier"))?;
        let offset = parse_isize(offset_raw).ok_or_else(|| {
            Error::ParameterSignatureMalformed(format!(
                "attribute identifier {offset_raw:?} is not an integer byte offset"
            ))
        })?;

        let length = parse_isize(resolve_key(fields, "length").unwrap_or("-1"))
            .ok_or_else(|| Error::ParameterSignatureMalformed("length must be an integer".into()))?;
        let is_array = resolve_key(fields, "is_array")
            .map(|v| v == "true")
            .unwrap_or(false);
        let aligned = resolve_key(fields, "aligned")
            .map(|v| v == "true")
            .unwrap_or(false);
        let flags = match resolve_key(fields, "flags") {
            Some(name) => AttributeFlags::from_name(name)?,
            None => AttributeFlags::ReadWrite,
        };
        let documentation = resolve_key(fields, "documentation").unwrap_or("").to_string();

        let descriptor = AttributeDescriptor {
            offset,
            kind,
            length,
            is_array,
            aligned,
            flags,
            documentation,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Enforces the three shape invariants: `length >= -1`; `length != -1 ⇒
    /// is_array ∨ type_tag = string_array`; `aligned ⇒ nested type (not
    /// primitive, unless array)`.
    fn validate(&self) -> Result<()> {
        if self.length < -1 {
            return Err(Error::ParameterSignatureMalformed(format!(
                "length {} must be >= -1",
                self.length
            )));
        }
        if self.length != -1 && !(self.is_array || matches!(self.kind, AttributeType::StringArray))
        {
            return Err(Error::ParameterSignatureMalformed(
                "length != -1 requires is_array or converter = string_array".into(),
            ));
        }
        if self.aligned && matches!(self.kind, AttributeType::Primitive(_)) && !self.is_array {
            return Err(Error::ParameterSignatureMalformed(
                "aligned requires a nested type, not a bare primitive (unless it's an array)"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Reads this attribute's value off `base` as a primitive. Nested-type
    /// resolution is the external host type manager's job.
    pub fn read_primitive(&self, base: &Pointer) -> Result<Value> {
        let tag = match self.kind {
            AttributeType::Primitive(tag) => tag,
            _ => {
                return Err(Error::ParameterSignatureMalformed(
                    "read_primitive called on a non-primitive attribute".into(),
                ))
            }
        };
        Ok(match tag {
            Tag::Bool => Value::Bool(base.get_bool(self.offset)?),
            Tag::I8 => Value::I8(base.get_i8(self.offset)?),
            Tag::U8 => Value::U8(base.get_u8(self.offset)?),
            Tag::I16 => Value::I16(base.get_i16(self.offset)?),
            Tag::U16 => Value::U16(base.get_u16(self.offset)?),
            Tag::I32 => Value::I32(base.get_i32(self.offset)?),
            Tag::U32 => Value::U32(base.get_u32(self.offset)?),
            Tag::I64 | Tag::Long => Value::I64(base.get_i64(self.offset)?),
            Tag::U64 | Tag::ULong => Value::U64(base.get_u64(self.offset)?),
            Tag::F32 => Value::F32(base.get_f32(self.offset)?),
            Tag::F64 => Value::F64(base.get_f64(self.offset)?),
            Tag::Pointer => Value::Pointer(base.get_ptr(self.offset)?),
            Tag::CStr => Value::CStr(
                std::ffi::CString::new(base.get_string(self.offset)?).unwrap_or_default(),
            ),
            Tag::Void => {
                return Err(Error::ParameterSignatureMalformed(
                    "void is not a readable attribute type".into(),
                ))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn classifies_symbol_name() {
        matches::assert_matches!(Identifier::classify("add"), Identifier::Symbol(_));
        matches::assert_matches!(
            Identifier::classify("_ZN11CBasePlayer4KillEv"),
            Identifier::Symbol(_)
        );
    }

    #[test]
    fn classifies_byte_pattern_with_wildcards() {
        matches::assert_matches!(
            Identifier::classify("55 8B EC * * 56"),
            Identifier::Pattern(_)
        );
    }

    #[test]
    fn function_record_applies_defaults() {
        let record = FunctionRecord::from_fields(&fields(&[
            ("binary", "server"),
            ("identifier", "_ZN11CBasePlayer4KillEv"),
            ("parameters", ")v"),
            ("convention", "THISCALL"),
        ]))
        .unwrap();
        assert_eq!(record.binary, "server");
        assert_eq!(record.convention, Convention::Thiscall);
        assert!(record.srv_check);
    }

    #[test]
    fn virtual_function_record_defaults_to_thiscall() {
        let record = VirtualFunctionRecord::from_fields(&fields(&[
            ("identifier", "17"),
            ("parameters", ")v"),
        ]))
        .unwrap();
        assert_eq!(record.slot, 17);
        assert_eq!(record.convention, Convention::Thiscall);
    }

    #[test]
    fn attribute_record_rejects_length_without_array() {
        let err = AttributeDescriptor::from_fields(&fields(&[
            ("converter", "i"),
            ("identifier", "0x48"),
            ("length", "4"),
        ]))
        .unwrap_err();
        matches::assert_matches!(err, Error::ParameterSignatureMalformed(_));
    }

    #[test]
    fn attribute_record_rejects_aligned_primitive() {
        let err = AttributeDescriptor::from_fields(&fields(&[
            ("converter", "i"),
            ("identifier", "0x10"),
            ("aligned", "true"),
        ]))
        .unwrap_err();
        matches::assert_matches!(err, Error::ParameterSignatureMalformed(_));
    }

    #[test]
    fn attribute_record_accepts_health_example_from_spec() {
        let record = AttributeDescriptor::from_fields(&fields(&[
            ("converter", "i"),
            ("identifier", "0x48"),
        ]))
        .unwrap();
        assert_eq!(record.offset, 0x48);
        matches::assert_matches!(record.kind, AttributeType::Primitive(Tag::I32));
    }
}
