//! The reverse path: turning a Rust closure into a real, callable native
//! function pointer. This is also the building block the detour engine uses
//! for its own dispatch stub — a hook's replacement entry point is,
//! mechanically, just another native-callable thunk.
//!
//! Built on libffi's closure API (`ffi_closure_alloc` / `ffi_prep_closure_loc`
//! / `ffi_closure_free`): libffi allocates an executable trampoline that,
//! when called with the target ABI's calling convention, marshals arguments
//! into an `ffi_cif`-described array and calls back into a plain C function
//! pointer with an opaque `user_data` pointer. We stash a boxed Rust closure
//! in `user_data`.

use crate::abi::ffi_type_for;
use crate::error::{Error, Result};
use crate::pointer::Address;
use crate::signature::{Convention, ParamSignature};
use crate::value::{Tag, Value};
use libffi::raw as ffi;
use std::ffi::c_void;
use std::os::raw::c_uint;

/// The Rust-side behavior a [`Thunk`] dispatches into: decoded arguments in,
/// one return [`Value`] out.
pub type ThunkBody = Box<dyn Fn(&[Value]) -> Value + Send + Sync>;

struct ThunkState {
    body: ThunkBody,
    sig: ParamSignature,
}

/// An executable native function pointer backed by a Rust closure.
///
/// Must be explicitly [`Thunk::free`]'d before being dropped is not
/// required — [`Drop`] releases the closure — but callers that need the
/// code pointer to stop being valid at a precise moment (e.g. before
/// reusing its address) should call `free` themselves.
pub struct Thunk {
    closure: *mut ffi::ffi_closure,
    code: Address,
    cif: Box<ffi::ffi_cif>,
    arg_types: Vec<*mut ffi::ffi_type>,
    // Kept alive for the closure's lifetime; `user_data` points into it.
    state: Box<ThunkState>,
}

// SAFETY: the closure's code pointer and cif are immutable after
// construction; `state` is only read from the dispatcher, which itself
// requires `ThunkBody: Send + Sync`.
unsafe impl Send for Thunk {}
unsafe impl Sync for Thunk {}

impl Thunk {
    /// Builds a new native thunk for `sig`/`convention` that, when called,
    /// decodes its native arguments per `sig.args` and invokes `body`,
    /// encoding whatever it returns into the native return slot.
    pub fn new(sig: ParamSignature, convention: Convention, body: ThunkBody) -> Result<Self> {
        let mut arg_types: Vec<*mut ffi::ffi_type> =
            sig.args.iter().map(|t| ffi_type_for(*t)).collect();
        let ret_type = ffi_type_for(sig.ret);

        let mut cif: Box<ffi::ffi_cif> = Box::new(unsafe { std::mem::zeroed() });
        let status = unsafe {
            ffi::ffi_prep_cif(
                cif.as_mut(),
                crate::abi::native_abi(convention),
                arg_types.len() as c_uint,
                ret_type,
                arg_types.as_mut_ptr(),
            )
        };
        if status != ffi::ffi_status_FFI_OK {
            return Err(Error::UnsupportedConvention);
        }

        let mut state = Box::new(ThunkState { body, sig });

        let mut code_loc: *mut c_void = std::ptr::null_mut();
        let closure = unsafe {
            ffi::ffi_closure_alloc(std::mem::size_of::<ffi::ffi_closure>(), &mut code_loc)
                as *mut ffi::ffi_closure
        };
        if closure.is_null() || code_loc.is_null() {
            return Err(Error::ExecutableAllocationFailed);
        }

        let prep_status = unsafe {
            ffi::ffi_prep_closure_loc(
                closure,
                cif.as_mut(),
                Some(dispatch),
                state.as_mut() as *mut ThunkState as *mut c_void,
                code_loc,
            )
        };
        if prep_status != ffi::ffi_status_FFI_OK {
            unsafe { ffi::ffi_closure_free(closure as *mut c_void) };
            return Err(Error::ExecutableAllocationFailed);
        }

        Ok(Thunk {
            closure,
            code: Address::new(code_loc as usize),
            cif,
            arg_types,
            state,
        })
    }

    /// The callable native entry point; hand this address to whatever
    /// expects a plain function pointer (a callback slot, a trampoline
    /// target, ...).
    pub fn code(&self) -> Address {
        self.code
    }

    /// Releases the executable closure. Using [`Thunk::code`] after this
    /// call is undefined behavior, identical to calling through a freed
    /// function pointer.
    pub fn free(mut self) -> Result<()> {
        self.release();
        Ok(())
    }

    fn release(&mut self) {
        if !self.closure.is_null() {
            unsafe { ffi::ffi_closure_free(self.closure as *mut c_void) };
            self.closure = std::ptr::null_mut();
        }
    }
}

impl Drop for Thunk {
    fn drop(&mut self) {
        self.release();
    }
}

/// The single C entry point every [`Thunk`] shares; libffi calls this with
/// already-decoded argument pointers for *any* signature, dispatching by
/// reading back the per-thunk [`ThunkState`] from `user_data`.
unsafe extern "C" fn dispatch(
    _cif: *mut ffi::ffi_cif,
    ret: *mut c_void,
    args: *mut *mut c_void,
    user_data: *mut c_void,
) {
    let state = &*(user_data as *const ThunkState);
    let arg_count = state.sig.args.len();

    let decoded: Vec<Value> = (0..arg_count)
        .map(|i| {
            let slot = unsafe { *args.add(i) };
            decode_arg(state.sig.args[i], slot)
        })
        .collect();

    let result = (state.body)(&decoded);
    encode_return(state.sig.ret, result, ret);
}

fn decode_arg(tag: Tag, slot: *mut c_void) -> Value {
    unsafe {
        match tag {
            Tag::Bool => Value::Bool(*(slot as *const u8) != 0),
            Tag::I8 => Value::I8(*(slot as *const i8)),
            Tag::U8 => Value::U8(*(slot as *const u8)),
            Tag::I16 => Value::I16(*(slot as *const i16)),
            Tag::U16 => Value::U16(*(slot as *const u16)),
            Tag::I32 => Value::I32(*(slot as *const i32)),
            Tag::U32 => Value::U32(*(slot as *const u32)),
            Tag::I64 | Tag::Long => Value::I64(*(slot as *const i64)),
            Tag::U64 | Tag::ULong => Value::U64(*(slot as *const u64)),
            Tag::F32 => Value::F32(*(slot as *const f32)),
            Tag::F64 => Value::F64(*(slot as *const f64)),
            Tag::Pointer | Tag::CStr => {
                Value::Pointer(Address::new(*(slot as *const usize)))
            }
            Tag::Void => Value::Void,
        }
    }
}

fn encode_return(tag: Tag, value: Value, ret: *mut c_void) {
    let coerced = value.coerce(tag, 0).unwrap_or(Value::Void);
    unsafe {
        match coerced {
            Value::Bool(b) => *(ret as *mut u64) = b as u64,
            Value::I8(v) => *(ret as *mut u64) = v as i64 as u64,
            Value::U8(v) => *(ret as *mut u64) = v as u64,
            Value::I16(v) => *(ret as *mut u64) = v as i64 as u64,
            Value::U16(v) => *(ret as *mut u64) = v as u64,
            Value::I32(v) => *(ret as *mut u64) = v as i64 as u64,
            Value::U32(v) => *(ret as *mut u64) = v as u64,
            Value::I64(v) => *(ret as *mut u64) = v as u64,
            Value::U64(v) => *(ret as *mut u64) = v,
            Value::F32(v) => *(ret as *mut f32) = v,
            Value::F64(v) => *(ret as *mut f64) = v,
            Value::Pointer(addr) => *(ret as *mut u64) = addr.as_usize() as u64,
            Value::CStr(s) => *(ret as *mut u64) = s.as_ptr() as u64,
            Value::Void => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn thunk_dispatches_into_closure_and_returns_value() {
        let sig = ParamSignature::parse("ii)i").unwrap();
        let seen: Arc<Mutex<Option<(i32, i32)>>> = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();

        let body: ThunkBody = Box::new(move |args| {
            let a = match args[0] {
                Value::I32(v) => v,
                _ => panic!("unexpected tag"),
            };
            let b = match args[1] {
                Value::I32(v) => v,
                _ => panic!("unexpected tag"),
            };
            *seen_clone.lock() = Some((a, b));
            Value::I32(a + b)
        });

        let thunk = Thunk::new(sig.clone(), Convention::Cdecl, body).unwrap();
        let code: extern "C" fn(i32, i32) -> i32 =
            unsafe { std::mem::transmute(thunk.code().as_usize()) };

        let result = code(2, 5);
        assert_eq!(result, 7);
        assert_eq!(*seen.lock(), Some((2, 5)));
    }
}
