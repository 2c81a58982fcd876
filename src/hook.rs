//! Hook actions, phases, and the typed view a callback receives over one
//! invocation's arguments and return value, plus the
//! `CONTINUE`/`MODIFIED`/`OVERRIDE` wire constants.

use crate::error::{Error, Result};
use crate::signature::ParamSignature;
use crate::value::Value;
use slotmap::new_key_type;
use std::cmp::Ordering;

new_key_type! {
    /// Identifies one registered hook callback, independent of its target
    /// address or phase — returned by [`crate::detour::hook`] and consumed
    /// by [`crate::detour::unhook`].
    pub struct CallbackId;
}

/// `PRE=0`, `POST=1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Pre = 0,
    Post = 1,
}

/// `CONTINUE=0 < MODIFIED=1 < OVERRIDE=2`. The ordering is load-bearing:
/// dispatch resolves a chain of pre-callbacks by taking the maximum action
/// across all of them.
#[derive(Debug, Clone)]
pub enum HookAction {
    Continue,
    Modified,
    Override(Value),
}

impl HookAction {
    fn rank(&self) -> u8 {
        match self {
            HookAction::Continue => 0,
            HookAction::Modified => 1,
            HookAction::Override(_) => 2,
        }
    }
}

impl PartialEq for HookAction {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}
impl Eq for HookAction {}
impl PartialOrd for HookAction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HookAction {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// The mutable, per-invocation view a hook callback operates on.
///
/// In [`Phase::Pre`], only the argument vector is meaningful; in
/// [`Phase::Post`], [`HookContext::return_value`] reports what the
/// trampoline (or an overriding pre-callback) produced, and
/// [`HookContext::set_return`] lets a post-callback replace it.
pub struct HookContext<'a> {
    phase: Phase,
    sig: &'a ParamSignature,
    args: Vec<Value>,
    ret: Option<Value>,
}

impl<'a> HookContext<'a> {
    pub fn new(phase: Phase, sig: &'a ParamSignature, args: Vec<Value>) -> Self {
        HookContext {
            phase,
            sig,
            args,
            ret: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn get_arg(&self, index: usize) -> Result<&Value> {
        self.args.get(index).ok_or(Error::ArgumentOutOfRange {
            position: index,
            tag: 'p',
        })
    }

    /// Overwrites argument `index`, coercing it into the signature's
    /// declared tag for that position.
    pub fn set_arg(&mut self, index: usize, value: Value) -> Result<()> {
        let tag = *self
            .sig
            .args
            .get(index)
            .ok_or(Error::ArgumentOutOfRange {
                position: index,
                tag: 'p',
            })?;
        self.args[index] = value.coerce(tag, index)?;
        Ok(())
    }

    /// The trampoline's (or overriding pre-callback's) return value; only
    /// meaningful once the post phase begins.
    pub fn return_value(&self) -> Option<&Value> {
        self.ret.as_ref()
    }

    /// Replaces the return value downstream post-callbacks will observe.
    /// Coerced into the signature's return tag, same narrowing rules as an
    /// argument.
    pub fn set_return(&mut self, value: Value) -> Result<()> {
        self.ret = Some(value.coerce(self.sig.ret, 0)?);
        Ok(())
    }

    pub(crate) fn set_return_raw(&mut self, value: Value) {
        self.ret = Some(value);
    }

    pub(crate) fn into_parts(self) -> (Vec<Value>, Option<Value>) {
        (self.args, self.ret)
    }
}

/// A registered hook callback: reads and optionally mutates a
/// [`HookContext`], and decides what should happen next via [`HookAction`].
pub type HookCallback = Box<dyn Fn(&mut HookContext) -> HookAction + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_outranks_modified_outranks_continue() {
        assert!(HookAction::Override(Value::I32(1)) > HookAction::Modified);
        assert!(HookAction::Modified > HookAction::Continue);
    }

    #[test]
    fn max_action_resolution_picks_override() {
        let actions = vec![
            HookAction::Continue,
            HookAction::Override(Value::I32(99)),
            HookAction::Modified,
        ];
        let winner = actions.into_iter().max_by(Ord::cmp).unwrap();
        matches::assert_matches!(winner, HookAction::Override(_));
    }

    #[test]
    fn set_arg_rejects_out_of_range_value() {
        let sig = ParamSignature::parse("C)v").unwrap();
        let mut ctx = HookContext::new(Phase::Pre, &sig, vec![Value::U8(0)]);
        let err = ctx.set_arg(0, Value::I32(-1)).unwrap_err();
        matches::assert_matches!(err, Error::ArgumentOutOfRange { .. });
    }

    #[test]
    fn set_return_coerces_to_signature_tag() {
        let sig = ParamSignature::parse(")i").unwrap();
        let mut ctx = HookContext::new(Phase::Post, &sig, vec![]);
        ctx.set_return(Value::I32(100)).unwrap();
        matches::assert_matches!(ctx.return_value(), Some(Value::I32(100)));
    }
}
