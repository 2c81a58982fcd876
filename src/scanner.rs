//! Signature scanning.
//!
//! A naive left-to-right scan of a module's image for a byte pattern with
//! wildcard bytes — modules are a few megabytes and patterns a few dozen
//! bytes, so there is no reason to reach for Boyer-Moore.

use crate::error::{Error, Result};
use crate::module::Module;
use crate::pointer::Address;

/// The wildcard sentinel: `0x2A` (`'*'`) always means "match any byte" and
/// can never be matched literally.
pub const WILDCARD: u8 = 0x2A;

/// One byte of a parsed [`Pattern`]: a literal value, or the wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternByte {
    Literal(u8),
    Wildcard,
}

/// An ordered sequence of pattern bytes.
#[derive(Debug, Clone)]
pub struct Pattern(Vec<PatternByte>);

impl Pattern {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parses the space-separated hex token format, e.g. `"55 8B EC * * 56"`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut bytes = Vec::new();
        for token in raw.split_whitespace() {
            if token == "*" {
                bytes.push(PatternByte::Wildcard);
                continue;
            }
            if token.len() != 2 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(Error::SignatureMalformed(format!(
                    "invalid token {token:?} in pattern {raw:?}"
                )));
            }
            let value = u8::from_str_radix(token, 16)
                .map_err(|_| Error::SignatureMalformed(format!("bad hex token {token:?}")))?;
            if value == WILDCARD {
                // 0x2A always means wildcard; it cannot be matched literally
                // even when it was spelled out as a literal hex byte.
                bytes.push(PatternByte::Wildcard);
            } else {
                bytes.push(PatternByte::Literal(value));
            }
        }

        if bytes.is_empty() {
            return Err(Error::SignatureMalformed(format!(
                "empty pattern {raw:?}"
            )));
        }

        Ok(Pattern(bytes))
    }

    fn matches_at(&self, haystack: &[u8], offset: usize) -> bool {
        self.0.iter().enumerate().all(|(i, b)| match b {
            PatternByte::Wildcard => true,
            PatternByte::Literal(expected) => haystack[offset + i] == *expected,
        })
    }
}

/// Scans `[base, base+image_size - len(pattern)]` for the left-most match.
/// `O(image_size * len(pattern))`.
pub fn find_signature(module: &Module, pattern: &Pattern) -> Option<Address> {
    let image = module.image();
    if pattern.is_empty() || pattern.len() > image.len() {
        return None;
    }

    let last_start = image.len() - pattern.len();
    for offset in 0..=last_start {
        if pattern.matches_at(image, offset) {
            return Some(module.base_address() + offset);
        }
    }
    None
}

/// Finds `pattern`, then reads a machine word at `match + offset`.
pub fn get_pointer(module: &Module, pattern: &Pattern, offset: isize) -> Option<Address> {
    let matched = find_signature(module, pattern)?;
    let ptr = crate::pointer::Pointer::new(matched);
    ptr.get_ptr(offset).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wildcard_tokens() {
        let pattern = Pattern::parse("55 8B EC * * 56").unwrap();
        assert_eq!(pattern.len(), 6);
        assert_eq!(pattern.0[3], PatternByte::Wildcard);
    }

    #[test]
    fn rejects_empty_pattern() {
        let err = Pattern::parse("").unwrap_err();
        matches::assert_matches!(err, Error::SignatureMalformed(_));
    }

    #[test]
    fn rejects_odd_hex_token() {
        let err = Pattern::parse("5").unwrap_err();
        matches::assert_matches!(err, Error::SignatureMalformed(_));
    }

    #[test]
    fn literal_0x2a_byte_is_treated_as_wildcard() {
        // 0x2A always means wildcard, even when spelled out as a literal
        // two-hex-digit token.
        let pattern = Pattern::parse("2A").unwrap();
        assert_eq!(pattern.0[0], PatternByte::Wildcard);
    }

    #[test]
    fn finds_leftmost_match_with_wildcards() {
        let image: Vec<u8> = vec![0x90, 0x55, 0x8B, 0xEC, 0x10, 0x55, 0x8B, 0xEC, 0x20];
        let module = Module::from_raw_image_for_test(image);
        let pattern = Pattern::parse("55 8B EC *").unwrap();
        let found = find_signature(&module, &pattern).unwrap();
        assert_eq!(found, module.base_address() + 1);
    }

    #[test]
    fn pattern_longer_than_image_has_no_match() {
        let module = Module::from_raw_image_for_test(vec![0x90, 0x90]);
        let pattern = Pattern::parse("00 00 00 00 00 00").unwrap();
        assert!(find_signature(&module, &pattern).is_none());
    }
}
