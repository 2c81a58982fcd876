//! Function Handle & Typed Wrapper.
//!
//! Binds `{address, convention, param_sig, return_converter}` together and
//! offers the four operations a host script actually calls through:
//! `call`, `call_trampoline`, `hook`/`unhook`, and `make_virtual`.

use crate::abi::CallFrame;
use crate::detour;
use crate::error::{Error, Result};
use crate::hook::{CallbackId, HookCallback, Phase};
use crate::pointer::{Address, Pointer};
use crate::signature::{Convention, ParamSignature};
use crate::value::Value;
use std::sync::Arc;

/// A pluggable unary projection applied to a call's return value. The
/// default converter is the identity; pointer-returning functions typically
/// supply the constructor of a nested typed view.
pub type ReturnConverter = Arc<dyn Fn(Value) -> Value + Send + Sync>;

fn identity_converter() -> ReturnConverter {
    Arc::new(|v| v)
}

/// Wraps a raw pointer return in a [`Pointer`] view, then hands it to a
/// caller-supplied projection — the common "nested typed view" converter
/// shape.
pub fn pointer_converter(
    project: impl Fn(Pointer) -> Value + Send + Sync + 'static,
) -> ReturnConverter {
    Arc::new(move |value| match value {
        Value::Pointer(addr) => project(Pointer::new(addr)),
        other => other,
    })
}

/// `{ address, convention, param_sig, return_converter, trampoline? }`.
pub struct FunctionHandle {
    address: Address,
    convention: Convention,
    sig: ParamSignature,
    converter: ReturnConverter,
    call_frame: CallFrame,
}

impl FunctionHandle {
    pub fn new(address: Address, convention: Convention, sig: ParamSignature) -> Result<Self> {
        Self::with_converter(address, convention, sig, identity_converter())
    }

    pub fn with_converter(
        address: Address,
        convention: Convention,
        sig: ParamSignature,
        converter: ReturnConverter,
    ) -> Result<Self> {
        let call_frame = CallFrame::new(sig.clone(), convention)?;
        Ok(FunctionHandle {
            address,
            convention,
            sig,
            converter,
            call_frame,
        })
    }

    pub const fn address(&self) -> Address {
        self.address
    }

    pub fn signature(&self) -> &ParamSignature {
        &self.sig
    }

    /// Calls the function directly at its bound address.
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        let raw = unsafe { self.call_frame.call(self.address, args)? };
        Ok((self.converter)(raw))
    }

    /// Calls through the detour trampoline instead of the live address, so
    /// a hook's own callback can still reach the original implementation.
    /// Fails with [`Error::NotHooked`] if `address` has no active detour.
    pub fn call_trampoline(&self, args: &[Value]) -> Result<Value> {
        let trampoline = detour::get_trampoline(self.address).ok_or(Error::NotHooked)?;
        let raw = unsafe { self.call_frame.call(trampoline, args)? };
        Ok((self.converter)(raw))
    }

    /// Installs (or appends to) a detour on this handle's address.
    pub fn hook(&self, phase: Phase, callback: HookCallback) -> Result<CallbackId> {
        detour::hook(self.address, phase, self.convention, self.sig.clone(), callback)
    }

    pub fn unhook(&self, phase: Phase, id: CallbackId) -> Result<()> {
        detour::unhook(self.address, phase, id)
    }

    /// Produces a bound-at-call-time virtual-dispatch handle: the address
    /// is re-resolved from `this`'s vtable on every call rather than fixed
    /// at construction (lazy virtual-function address resolution).
    pub fn make_virtual(
        index: usize,
        convention: Convention,
        sig: ParamSignature,
        converter: ReturnConverter,
    ) -> Result<VirtualFunctionHandle> {
        // The cif must account for the implicit `this` the vtable call
        // always prepends; `sig` itself stays the method's declared
        // (explicit) parameter list for `signature()`.
        let mut call_args = Vec::with_capacity(sig.args.len() + 1);
        call_args.push(crate::value::Tag::Pointer);
        call_args.extend_from_slice(&sig.args);
        let call_sig = ParamSignature {
            args: call_args,
            ret: sig.ret,
        };
        let call_frame = CallFrame::new(call_sig, convention)?;
        Ok(VirtualFunctionHandle {
            index,
            convention,
            sig,
            converter,
            call_frame,
        })
    }
}

/// `{ vtable_index, convention, param_sig, return_converter }`: resolved
/// against a live `this` by reading the vtable pointer at `*this` and
/// indexing by slot — exactly two dereferences, with no bounds check. An
/// out-of-range slot is the caller's responsibility, not this engine's.
pub struct VirtualFunctionHandle {
    index: usize,
    #[allow(dead_code)]
    convention: Convention,
    sig: ParamSignature,
    converter: ReturnConverter,
    call_frame: CallFrame,
}

impl VirtualFunctionHandle {
    /// Resolves this method's address against `this_ptr`'s vtable and calls
    /// it, prepending `this_ptr` as the first argument — the bound-method
    /// emulation for `this`-call methods: `{handle, this_ptr}` with `this`
    /// prepended on call.
    pub fn call(&self, this_ptr: Address, args: &[Value]) -> Result<Value> {
        let this = Pointer::new(this_ptr);
        let vtable = this.get_ptr(0)?;
        let vtable_ptr = Pointer::new(vtable);
        let slot = vtable_ptr.get_ptr((self.index * std::mem::size_of::<usize>()) as isize)?;

        let mut full_args = Vec::with_capacity(args.len() + 1);
        full_args.push(Value::Pointer(this_ptr));
        full_args.extend_from_slice(args);

        let raw = unsafe { self.call_frame.call(slot, &full_args)? };
        Ok((self.converter)(raw))
    }

    pub fn signature(&self) -> &ParamSignature {
        &self.sig
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn add(a: i32, b: i32) -> i32 {
        a + b
    }

    #[test]
    fn call_invokes_bound_address_with_identity_converter() {
        let handle = FunctionHandle::new(
            Address::from(add as *const ()),
            Convention::Cdecl,
            ParamSignature::parse("ii)i").unwrap(),
        )
        .unwrap();
        let result = handle.call(&[Value::I32(3), Value::I32(4)]).unwrap();
        matches::assert_matches!(result, Value::I32(7));
    }

    #[test]
    fn call_trampoline_without_a_detour_fails_not_hooked() {
        let handle = FunctionHandle::new(
            Address::from(add as *const ()),
            Convention::Cdecl,
            ParamSignature::parse("ii)i").unwrap(),
        )
        .unwrap();
        let err = handle
            .call_trampoline(&[Value::I32(1), Value::I32(2)])
            .unwrap_err();
        matches::assert_matches!(err, Error::NotHooked);
    }
}
