//! Parsing for the `"P…P)R"` parameter signature string and the calling
//! convention enumeration.

use crate::error::{Error, Result};
use crate::value::Tag;

/// `{ CDECL, STDCALL, THISCALL, FASTCALL }`, with a stable wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Convention {
    Cdecl = 0,
    Stdcall = 1,
    Thiscall = 2,
    Fastcall = 3,
}

impl Convention {
    pub fn from_wire(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Convention::Cdecl,
            1 => Convention::Stdcall,
            2 => Convention::Thiscall,
            3 => Convention::Fastcall,
            _ => return Err(Error::UnsupportedConvention),
        })
    }

    /// Parses the record-level convention name (`"CDECL"`, `"THISCALL"`, ...),
    /// case-insensitively, as the external loader would deliver it.
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name.to_ascii_uppercase().as_str() {
            "CDECL" => Convention::Cdecl,
            "STDCALL" => Convention::Stdcall,
            "THISCALL" => Convention::Thiscall,
            "FASTCALL" => Convention::Fastcall,
            _ => return Err(Error::UnsupportedConvention),
        })
    }
}

/// A parsed `"P…P)R"` signature: an ordered argument-tag list and a return tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSignature {
    pub args: Vec<Tag>,
    pub ret: Tag,
}

impl ParamSignature {
    /// Parses e.g. `"ii)i"` (two `i32` args, `i32` return) or `")v"` (the
    /// valid zero-arg, void-return signature).
    pub fn parse(raw: &str) -> Result<Self> {
        let Some(paren) = raw.find(')') else {
            return Err(Error::ParameterSignatureMalformed(format!(
                "missing ')' in {raw:?}"
            )));
        };

        let (arg_part, ret_part) = raw.split_at(paren);
        let ret_part = &ret_part[1..]; // drop the ')'

        if ret_part.len() != 1 {
            return Err(Error::ParameterSignatureMalformed(format!(
                "return type must be exactly one tag in {raw:?}"
            )));
        }
        let ret = Tag::from_char(ret_part.chars().next().unwrap())?;

        let mut args = Vec::with_capacity(arg_part.len());
        for c in arg_part.chars() {
            let tag = Tag::from_char(c)?;
            if matches!(tag, Tag::Void) {
                return Err(Error::ParameterSignatureMalformed(format!(
                    "'v' is only valid in return position ({raw:?})"
                )));
            }
            args.push(tag);
        }

        Ok(ParamSignature { args, ret })
    }

    pub fn to_string(&self) -> String {
        let mut s: String = self.args.iter().map(|t| t.to_char()).collect();
        s.push(')');
        s.push(self.ret.to_char());
        s
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_zero_arg_void() {
        let sig = ParamSignature::parse(")v").unwrap();
        assert!(sig.args.is_empty());
        assert_eq!(sig.ret, Tag::Void);
    }

    #[test]
    fn parses_binary_int_function() {
        let sig = ParamSignature::parse("ii)i").unwrap();
        assert_eq!(sig.args, vec![Tag::I32, Tag::I32]);
        assert_eq!(sig.ret, Tag::I32);
    }

    #[test]
    fn rejects_missing_paren() {
        let err = ParamSignature::parse("ii").unwrap_err();
        matches::assert_matches!(err, Error::ParameterSignatureMalformed(_));
    }

    #[test]
    fn rejects_void_in_argument_position() {
        let err = ParamSignature::parse("v)v").unwrap_err();
        matches::assert_matches!(err, Error::ParameterSignatureMalformed(_));
    }

    #[test]
    fn rejects_unknown_tag() {
        let err = ParamSignature::parse("x)v").unwrap_err();
        matches::assert_matches!(err, Error::ParameterSignatureMalformed(_));
    }

    #[test]
    fn convention_from_name_is_case_insensitive() {
        assert_eq!(Convention::from_name("thiscall").unwrap(), Convention::Thiscall);
        assert_eq!(Convention::from_name("CDECL").unwrap(), Convention::Cdecl);
    }
}
