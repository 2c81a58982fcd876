//! The call-frame builder: constructs and invokes an ABI-correct call for a
//! `{address, convention, param_sig}` triple.
//!
//! Builds an ABI-correct call frame for a `{address, convention, param_sig}`
//! triple and invokes it. The actual register/stack placement is delegated
//! to `libffi` (the same C library every serious dynamic-FFI tool in the
//! ecosystem wraps); this module's job is translating our [`Tag`]/[`Value`]
//! vocabulary into `libffi`'s `ffi_type`/`ffi_cif`, and selecting the right
//! `ffi_abi` for the requested [`Convention`].
//!
//! There is deliberately no per-thread frame-builder state here: a
//! [`CallFrame`] is immutable after construction (`ffi_prep_cif` runs once),
//! and every call's argument/return marshaling buffer is a stack-local
//! `Vec`, so nested or concurrent calls through the same handle cannot
//! corrupt one another — see DESIGN.md for why this is equivalent to giving
//! each thread its own frame-builder state, without an actual
//! `thread_local!`.

use crate::error::{Error, Result};
use crate::pointer::Address;
use crate::signature::{Convention, ParamSignature};
use crate::value::{Tag, Value};
use libffi::raw as ffi;
use std::ffi::c_void;
use std::os::raw::c_uint;

/// Returns a `*mut ffi_type` for a given tag's C representation.
///
/// SAFETY: the returned pointers alias libffi's process-wide static
/// `ffi_type_*` descriptors; libffi treats them as read-only.
pub(crate) fn ffi_type_for(tag: Tag) -> *mut ffi::ffi_type {
    use std::ptr::addr_of_mut;
    unsafe {
        let ptr: *mut ffi::ffi_type = match tag {
            Tag::Bool | Tag::U8 => addr_of_mut!(ffi::ffi_type_uint8),
            Tag::I8 => addr_of_mut!(ffi::ffi_type_sint8),
            Tag::U16 => addr_of_mut!(ffi::ffi_type_uint16),
            Tag::I16 => addr_of_mut!(ffi::ffi_type_sint16),
            Tag::U32 => addr_of_mut!(ffi::ffi_type_uint32),
            Tag::I32 => addr_of_mut!(ffi::ffi_type_sint32),
            Tag::U64 | Tag::ULong if Tag::LONG_BITS == 64 => addr_of_mut!(ffi::ffi_type_uint64),
            Tag::U64 => addr_of_mut!(ffi::ffi_type_uint64),
            Tag::ULong => addr_of_mut!(ffi::ffi_type_uint32),
            Tag::I64 | Tag::Long if Tag::LONG_BITS == 64 => addr_of_mut!(ffi::ffi_type_sint64),
            Tag::I64 => addr_of_mut!(ffi::ffi_type_sint64),
            Tag::Long => addr_of_mut!(ffi::ffi_type_sint32),
            Tag::F32 => addr_of_mut!(ffi::ffi_type_float),
            Tag::F64 => addr_of_mut!(ffi::ffi_type_double),
            Tag::Pointer | Tag::CStr => addr_of_mut!(ffi::ffi_type_pointer),
            Tag::Void => addr_of_mut!(ffi::ffi_type_void),
        };
        ptr
    }
}

/// Maps a [`Convention`] to the `ffi_abi` libffi should build the frame for.
/// On architectures where stdcall/thiscall/fastcall don't exist as distinct
/// ABIs (anything but 32-bit x86), all four collapse onto the platform's one
/// true ABI.
pub(crate) fn native_abi(convention: Convention) -> ffi::ffi_abi {
    #[cfg(target_arch = "x86")]
    {
        match convention {
            Convention::Cdecl => ffi::ffi_abi_FFI_SYSV,
            Convention::Stdcall => ffi::ffi_abi_FFI_STDCALL,
            Convention::Thiscall => ffi::ffi_abi_FFI_THISCALL,
            Convention::Fastcall => ffi::ffi_abi_FFI_FASTCALL,
        }
    }
    #[cfg(not(target_arch = "x86"))]
    {
        let _ = convention;
        ffi::ffi_abi_FFI_DEFAULT_ABI
    }
}

/// A prepared call frame: a compiled `ffi_cif` bound to a fixed signature and
/// convention, ready to be invoked against any matching address.
pub struct CallFrame {
    cif: Box<ffi::ffi_cif>,
    // Kept alive: `ffi_cif` only stores raw pointers into this array.
    arg_types: Vec<*mut ffi::ffi_type>,
    ret_type: *mut ffi::ffi_type,
    sig: ParamSignature,
    convention: Convention,
}

// SAFETY: `ffi_cif` and the backing `arg_types`/`ret_type` pointers are
// never mutated after `ffi_prep_cif`; `ffi_call` only reads through them.
unsafe impl Send for CallFrame {}
unsafe impl Sync for CallFrame {}

impl CallFrame {
    pub fn new(sig: ParamSignature, convention: Convention) -> Result<Self> {
        let mut arg_types: Vec<*mut ffi::ffi_type> =
            sig.args.iter().map(|t| ffi_type_for(*t)).collect();
        let ret_type = ffi_type_for(sig.ret);

        let mut cif: Box<ffi::ffi_cif> = Box::new(unsafe { std::mem::zeroed() });
        let status = unsafe {
            ffi::ffi_prep_cif(
                cif.as_mut(),
                native_abi(convention),
                arg_types.len() as c_uint,
                ret_type,
                arg_types.as_mut_ptr(),
            )
        };
        if status != ffi::ffi_status_FFI_OK {
            return Err(Error::UnsupportedConvention);
        }

        Ok(CallFrame {
            cif,
            arg_types,
            ret_type,
            sig,
            convention,
        })
    }

    pub fn signature(&self) -> &ParamSignature {
        &self.sig
    }

    pub fn convention(&self) -> Convention {
        self.convention
    }

    /// Invokes the native function at `address` with `args`, coercing each
    /// argument into the tag the signature demands and decoding the return
    /// value exactly once.
    ///
    /// # Safety
    /// `address` must be a valid, callable entry point whose real prototype
    /// matches this frame's convention and signature; mismatches are
    /// undefined behavior on the native side, same as any raw FFI call.
    pub unsafe fn call(&self, address: Address, args: &[Value]) -> Result<Value> {
        if args.len() != self.sig.args.len() {
            return Err(Error::ArgumentCountMismatch {
                expected: self.sig.args.len(),
                actual: args.len(),
            });
        }

        // Coerce + own every argument's storage for the duration of the
        // call (this is also where CStr arguments get their CString kept
        // alive).
        let mut coerced = Vec::with_capacity(args.len());
        for (i, (arg, tag)) in args.iter().zip(self.sig.args.iter()).enumerate() {
            coerced.push(arg.clone().coerce(*tag, i)?);
        }

        // Build the raw `void*[]` libffi expects: one pointer per argument,
        // pointing at that argument's own storage.
        let mut storage: Vec<ArgStorage> = coerced.iter().map(ArgStorage::new).collect();
        let mut arg_ptrs: Vec<*mut c_void> =
            storage.iter_mut().map(ArgStorage::as_mut_ptr).collect();

        let mut ret_storage = vec![0u8; return_slot_size(self.ret_type)];

        let code_ptr: extern "C" fn() = unsafe { std::mem::transmute(address.as_usize()) };

        unsafe {
            ffi::ffi_call(
                self.cif.as_ref() as *const _ as *mut _,
                Some(code_ptr),
                ret_storage.as_mut_ptr() as *mut c_void,
                arg_ptrs.as_mut_ptr(),
            );
        }

        decode_return(self.sig.ret, &ret_storage)
    }
}

/// Owns one argument's native-sized storage, so we can hand libffi a stable
/// `*mut c_void` into it.
enum ArgStorage {
    Bytes(Vec<u8>),
}

impl ArgStorage {
    fn new(value: &Value) -> Self {
        let bytes = match value {
            Value::Bool(b) => vec![*b as u8],
            Value::I8(v) => v.to_ne_bytes().to_vec(),
            Value::U8(v) => v.to_ne_bytes().to_vec(),
            Value::I16(v) => v.to_ne_bytes().to_vec(),
            Value::U16(v) => v.to_ne_bytes().to_vec(),
            Value::I32(v) => v.to_ne_bytes().to_vec(),
            Value::U32(v) => v.to_ne_bytes().to_vec(),
            Value::I64(v) => v.to_ne_bytes().to_vec(),
            Value::U64(v) => v.to_ne_bytes().to_vec(),
            Value::F32(v) => v.to_ne_bytes().to_vec(),
            Value::F64(v) => v.to_ne_bytes().to_vec(),
            Value::Pointer(addr) => (addr.as_usize() as u64).to_ne_bytes().to_vec(),
            Value::CStr(s) => (s.as_ptr() as u64).to_ne_bytes().to_vec(),
            Value::Void => Vec::new(),
        };
        ArgStorage::Bytes(bytes)
    }

    fn as_mut_ptr(&mut self) -> *mut c_void {
        match self {
            ArgStorage::Bytes(b) => b.as_mut_ptr() as *mut c_void,
        }
    }
}

fn return_slot_size(ret_type: *mut ffi::ffi_type) -> usize {
    // `ffi_arg` is always at least machine-word sized; libffi requires the
    // return buffer to be at least that, even for narrower int/void
    // returns, to accommodate its own internal widening.
    let natural = unsafe { (*ret_type).size };
    natural.max(std::mem::size_of::<u64>())
}

fn decode_return(tag: Tag, bytes: &[u8]) -> Result<Value> {
    Ok(match tag {
        Tag::Void => Value::Void,
        Tag::Bool => Value::Bool(bytes[0] != 0),
        Tag::I8 => Value::I8(bytes[0] as i8),
        Tag::U8 => Value::U8(bytes[0]),
        Tag::I16 => Value::I16(i16::from_ne_bytes(bytes[0..2].try_into().unwrap())),
        Tag::U16 => Value::U16(u16::from_ne_bytes(bytes[0..2].try_into().unwrap())),
        Tag::I32 => Value::I32(i32::from_ne_bytes(bytes[0..4].try_into().unwrap())),
        Tag::U32 => Value::U32(u32::from_ne_bytes(bytes[0..4].try_into().unwrap())),
        Tag::I64 | Tag::Long => Value::I64(i64::from_ne_bytes(bytes[0..8].try_into().unwrap())),
        Tag::U64 | Tag::ULong => Value::U64(u64::from_ne_bytes(bytes[0..8].try_into().unwrap())),
        Tag::F32 => Value::F32(f32::from_ne_bytes(bytes[0..4].try_into().unwrap())),
        Tag::F64 => Value::F64(f64::from_ne_bytes(bytes[0..8].try_into().unwrap())),
        Tag::Pointer | Tag::CStr => Value::Pointer(Address::new(
            u64::from_ne_bytes(bytes[0..8].try_into().unwrap()) as usize,
        )),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_frame_builds_for_cdecl_int_signature() {
        let sig = ParamSignature::parse("ii)i").unwrap();
        let frame = CallFrame::new(sig, Convention::Cdecl).unwrap();
        assert_eq!(frame.signature().arity(), 2);
    }

    #[test]
    fn rejects_argument_count_mismatch() {
        extern "C" fn add(a: i32, b: i32) -> i32 {
            a + b
        }
        let sig = ParamSignature::parse("ii)i").unwrap();
        let frame = CallFrame::new(sig, Convention::Cdecl).unwrap();
        let err = unsafe {
            frame
                .call(Address::from(add as *const ()), &[Value::I32(1)])
                .unwrap_err()
        };
        matches::assert_matches!(err, Error::ArgumentCountMismatch { .. });
    }

    #[test]
    fn calls_native_cdecl_function() {
        extern "C" fn add(a: i32, b: i32) -> i32 {
            a + b
        }
        let sig = ParamSignature::parse("ii)i").unwrap();
        let frame = CallFrame::new(sig, Convention::Cdecl).unwrap();
        let result = unsafe {
            frame
                .call(
                    Address::from(add as *const ()),
                    &[Value::I32(3), Value::I32(4)],
                )
                .unwrap()
        };
        matches::assert_matches!(result, Value::I32(7));
    }
}
