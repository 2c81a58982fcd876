//! A reflective foreign-function bridge: dynamic invocation, vtable
//! dispatch, and detour hooking over loaded native modules, driven by
//! declarative descriptions rather than compile-time bindings.
//!
//! # Layout
//!
//! The crate is organized leaf-first, matching the dependency order a host
//! binding layer actually uses it in:
//!
//! - [`pointer`] — a typed, offset-addressed view over a raw address.
//! - [`module`] — opens shared modules, resolves exported symbols.
//! - [`scanner`] — wildcard byte-pattern scanning over a module's image.
//! - [`value`] and [`signature`] — the `b c C s S i I l L j J f d p t v` tag
//!   alphabet, the `Value` union, and the `"P…P)R"` parameter signature.
//! - [`abi`] — ABI-aware call-frame construction and invocation (`libffi`).
//! - [`callback`] — the reverse path: native-callable thunks over a Rust
//!   closure, also the building block for a detour's dispatch stub.
//! - [`arch`] and [`alloc`] — prologue decoding/relocation and executable
//!   memory, used by the detour engine to build trampolines.
//! - [`hook`] and [`detour`] — hook actions/phases and the detour engine
//!   itself: one record per target address, composing any number of
//!   pre/post callbacks.
//! - [`function`] — `FunctionHandle`/`VirtualFunctionHandle`, the typed
//!   wrapper a host binding actually holds onto.
//! - [`records`] — the declarative record shapes an external loader
//!   delivers (function/virtual-function/attribute), OS key overrides, and
//!   the identifier-format classifier.
//!
//! No error and no host-side panic ever crosses back into native code: see
//! [`error::Error`] and the dispatch-stub panic guard in [`detour`].

pub mod abi;
pub mod alloc;
pub mod arch;
pub mod callback;
pub mod detour;
pub mod error;
pub mod function;
pub mod hook;
pub mod module;
pub mod pointer;
pub mod records;
pub mod scanner;
pub mod signature;
pub mod value;

pub use error::{Error, Result};
pub use function::{FunctionHandle, ReturnConverter, VirtualFunctionHandle};
pub use hook::{CallbackId, HookAction, HookCallback, HookContext, Phase};
pub use module::Module;
pub use pointer::{Address, Pointer};
pub use signature::{Convention, ParamSignature};
pub use value::{Tag, Value};

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn identity(x: i32) -> i32 {
        x
    }

    extern "C" fn other(x: i32) -> i32 {
        x + 1
    }

    #[test]
    fn function_handles_over_the_same_target_share_it() {
        let a = FunctionHandle::new(
            Address::from(identity as *const ()),
            Convention::Cdecl,
            ParamSignature::parse("i)i").unwrap(),
        )
        .unwrap();
        let b = FunctionHandle::new(
            Address::from(identity as *const ()),
            Convention::Cdecl,
            ParamSignature::parse("i)i").unwrap(),
        )
        .unwrap();
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn function_handles_over_different_targets_differ() {
        let a = FunctionHandle::new(
            Address::from(identity as *const ()),
            Convention::Cdecl,
            ParamSignature::parse("i)i").unwrap(),
        )
        .unwrap();
        let b = FunctionHandle::new(
            Address::from(other as *const ()),
            Convention::Cdecl,
            ParamSignature::parse("i)i").unwrap(),
        )
        .unwrap();
        assert_ne!(a.address(), b.address());
    }
}
