//! The detour engine.
//!
//! Replaces a target's prologue with a jump to a dispatch stub, keeps a
//! relocated copy of the original prologue runnable as a trampoline, and
//! fans a single physical patch out to however many pre/post callbacks are
//! registered against it — one record per target address, with hooks
//! composing onto that record rather than each getting their own patch.
//!
//! The mutual-exclusion window around the prologue overwrite is implemented
//! as the engine's own global write lock: installing or removing a detour
//! holds [`DETOURS`] exclusively for the whole patch (allocate trampoline,
//! relocate, write the jump, flip protection back). This is a "world-stop"
//! scoped to this engine's own bookkeeping rather than actual OS-level
//! thread suspension — see DESIGN.md for the tradeoff.

use crate::abi::CallFrame;
use crate::alloc::{with_writable_code, ExecutableBuffer};
use crate::arch;
use crate::callback::{Thunk, ThunkBody};
use crate::error::{Error, Result};
use crate::hook::{CallbackId, HookAction, HookCallback, HookContext, Phase};
use crate::pointer::Address;
use crate::signature::{Convention, ParamSignature};
use crate::value::Value;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use slotmap::SlotMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// How many bytes of a target's prologue to decode before giving up looking
/// for `JUMP_INSTRUCTION_LEN` worth of whole instructions. Generous relative
/// to any real function prologue.
const PROLOGUE_SCAN_WINDOW: usize = 32;

/// Upper bound on the jump-back code a trampoline needs, so the allocation
/// is sized before the relocated prologue's exact length is known.
const JUMP_BACK_MAX_LEN: usize = 14;

struct DetourRecord {
    original_prologue_bytes: Vec<u8>,
    prologue_length: usize,
    #[allow(dead_code)]
    trampoline: ExecutableBuffer,
    trampoline_address: Address,
    #[allow(dead_code)]
    dispatch_stub: Thunk,
    call_frame: Arc<CallFrame>,
    sig: ParamSignature,
    pre_callbacks: Arc<RwLock<Vec<(CallbackId, HookCallback)>>>,
    post_callbacks: Arc<RwLock<Vec<(CallbackId, HookCallback)>>>,
}

static DETOURS: Lazy<RwLock<HashMap<Address, DetourRecord>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static CALLBACK_IDS: Lazy<parking_lot::Mutex<SlotMap<CallbackId, ()>>> =
    Lazy::new(|| parking_lot::Mutex::new(SlotMap::with_key()));

fn next_callback_id() -> CallbackId {
    CALLBACK_IDS.lock().insert(())
}

/// Installs (if needed) a detour at `target` and registers `callback` on
/// `phase`. If a detour is already installed at `target`, the existing
/// trampoline and dispatch stub are reused and the callback is simply
/// appended to the appropriate phase list without re-patching.
pub fn hook(
    target: Address,
    phase: Phase,
    convention: Convention,
    sig: ParamSignature,
    callback: HookCallback,
) -> Result<CallbackId> {
    let mut registry = DETOURS.write();

    if !registry.contains_key(&target) {
        debug!(target = %target, "installing new detour");
        let record = install(target, convention, sig.clone())?;
        registry.insert(target, record);
    }

    let record = registry
        .get(&target)
        .expect("just inserted or already present");
    let id = next_callback_id();
    let list = match phase {
        Phase::Pre => &record.pre_callbacks,
        Phase::Post => &record.post_callbacks,
    };
    list.write().push((id, callback));
    debug!(target = %target, phase = ?phase, "registered hook callback");
    Ok(id)
}

/// Removes `id` from `phase`'s callback list on `target`. A no-op if
/// `target` isn't hooked or `id` isn't registered there. When both phase
/// lists become empty, the original prologue is restored and the
/// trampoline/dispatch stub are freed.
pub fn unhook(target: Address, phase: Phase, id: CallbackId) -> Result<()> {
    let mut registry = DETOURS.write();
    let Some(record) = registry.get(&target) else {
        return Ok(());
    };

    let list = match phase {
        Phase::Pre => &record.pre_callbacks,
        Phase::Post => &record.post_callbacks,
    };
    list.write().retain(|(cb_id, _)| *cb_id != id);

    let empty = record.pre_callbacks.read().is_empty() && record.post_callbacks.read().is_empty();
    if empty {
        debug!(target = %target, "last hook removed, restoring original prologue");
        let record = registry.remove(&target).expect("checked above");
        restore(target, &record)?;
    }
    Ok(())
}

/// Returns the trampoline address for `target`, if hooked; used by
/// `call_trampoline` on a [`crate::function::FunctionHandle`].
pub fn get_trampoline(target: Address) -> Option<Address> {
    DETOURS.read().get(&target).map(|r| r.trampoline_address)
}

fn install(target: Address, convention: Convention, sig: ParamSignature) -> Result<DetourRecord> {
    let window = unsafe { std::slice::from_raw_parts(target.as_ptr(), PROLOGUE_SCAN_WINDOW) };
    let prologue = arch::decode_prologue(window, target.as_usize() as u64, arch::JUMP_INSTRUCTION_LEN)?;

    let mut trampoline =
        ExecutableBuffer::allocate(prologue.length * 2 + JUMP_BACK_MAX_LEN)?;
    let trampoline_address = trampoline.address();

    let relocated = arch::relocate(&prologue, trampoline_address.as_usize() as u64)?;
    let jump_back = arch::emit_absolute_jump(target.as_usize() as u64 + prologue.length as u64);

    let mut trampoline_code = relocated;
    trampoline_code.extend_from_slice(&jump_back);
    trampoline.write(&trampoline_code)?;
    trampoline.make_executable()?;
    trace!(
        target = %target,
        trampoline = %trampoline_address,
        prologue_length = prologue.length,
        "built trampoline"
    );

    let call_frame = Arc::new(CallFrame::new(sig.clone(), convention)?);

    let dispatch_target = target;
    let dispatch_body: ThunkBody = Box::new(move |args: &[Value]| dispatch(dispatch_target, args));
    let dispatch_stub = Thunk::new(sig.clone(), convention, dispatch_body)?;

    if dispatch_stub.code() == target {
        return Err(Error::SameAddress);
    }

    let original_bytes = window[..prologue.length].to_vec();
    let patch = arch::emit_rel32_jump(
        target.as_usize() as u64 + arch::JUMP_INSTRUCTION_LEN as u64,
        dispatch_stub.code().as_usize() as u64,
    );

    with_writable_code(target, prologue.length, || unsafe {
        std::ptr::copy_nonoverlapping(patch.as_ptr(), target.as_mut_ptr(), patch.len());
        if prologue.length > patch.len() {
            std::ptr::write_bytes(
                target.as_mut_ptr().add(patch.len()),
                0x90, // NOP
                prologue.length - patch.len(),
            );
        }
    })?;
    debug!(target = %target, dispatch_stub = %dispatch_stub.code(), "prologue patched");

    Ok(DetourRecord {
        original_prologue_bytes: original_bytes,
        prologue_length: prologue.length,
        trampoline,
        trampoline_address,
        dispatch_stub,
        call_frame,
        sig,
        pre_callbacks: Arc::new(RwLock::new(Vec::new())),
        post_callbacks: Arc::new(RwLock::new(Vec::new())),
    })
}

fn restore(target: Address, record: &DetourRecord) -> Result<()> {
    with_writable_code(target, record.prologue_length, || unsafe {
        std::ptr::copy_nonoverlapping(
            record.original_prologue_bytes.as_ptr(),
            target.as_mut_ptr(),
            record.prologue_length,
        );
    })?;
    debug!(target = %target, "original prologue restored");
    Ok(())
}

/// The dispatch stub's Rust-side body: arguments arrive already decoded (by
/// `Thunk`), runs pre-callbacks, conditionally calls the trampoline, runs
/// post-callbacks, and returns the final value.
fn dispatch(target: Address, args: &[Value]) -> Value {
    let (sig, call_frame, trampoline_address, pre_callbacks, post_callbacks) = {
        let registry = DETOURS.read();
        match registry.get(&target) {
            Some(record) => (
                record.sig.clone(),
                record.call_frame.clone(),
                record.trampoline_address,
                record.pre_callbacks.clone(),
                record.post_callbacks.clone(),
            ),
            None => return Value::Void,
        }
    };

    let mut pre_ctx = HookContext::new(Phase::Pre, &sig, args.to_vec());
    let mut max_action = HookAction::Continue;
    for (_, callback) in pre_callbacks.read().iter() {
        let action = run_guarded(callback, &mut pre_ctx);
        if action > max_action {
            max_action = action;
        }
    }

    let args_after_pre = pre_ctx.args().to_vec();

    let return_value = match max_action {
        HookAction::Override(value) => value,
        _ => unsafe {
            call_frame
                .call(trampoline_address, &args_after_pre)
                .unwrap_or(Value::Void)
        },
    };

    let mut post_ctx = HookContext::new(Phase::Post, &sig, args_after_pre);
    post_ctx.set_return_raw(return_value);
    for (_, callback) in post_callbacks.read().iter() {
        run_guarded(callback, &mut post_ctx);
    }

    let (_, ret) = post_ctx.into_parts();
    ret.unwrap_or(Value::Void)
}

/// Runs a host callback, catching panics so none ever propagates across the
/// FFI boundary: a panicking callback is logged and treated as `CONTINUE`,
/// exactly like `HostCallbackFailed`.
fn run_guarded(callback: &HookCallback, ctx: &mut HookContext) -> HookAction {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(ctx))) {
        Ok(action) => action,
        Err(_) => {
            warn!("hook callback panicked; proceeding as CONTINUE");
            HookAction::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer::Address as Addr;
    use serial_test::serial;

    // Detours mutate process-wide global state (`DETOURS`); `serial_test`
    // keeps these from racing other tests in the same binary.

    extern "C" fn add(a: i32, b: i32) -> i32 {
        a + b
    }

    static ADD_SPY_CALLS: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

    extern "C" fn add_spied(a: i32, b: i32) -> i32 {
        ADD_SPY_CALLS.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        a + b
    }

    #[test]
    #[serial]
    fn hook_with_pre_callback_modifies_argument() {
        let target = Addr::from(add as *const ());
        let sig = ParamSignature::parse("ii)i").unwrap();

        let callback: HookCallback = Box::new(|ctx: &mut HookContext| {
            ctx.set_arg(0, Value::I32(10)).unwrap();
            HookAction::Modified
        });

        let id = hook(target, Phase::Pre, Convention::Cdecl, sig, callback).unwrap();

        let call_frame = CallFrame::new(ParamSignature::parse("ii)i").unwrap(), Convention::Cdecl)
            .unwrap();
        let result = unsafe {
            call_frame
                .call(target, &[Value::I32(3), Value::I32(4)])
                .unwrap()
        };
        matches::assert_matches!(result, Value::I32(14));

        unhook(target, Phase::Pre, id).unwrap();

        let restored = unsafe {
            call_frame
                .call(target, &[Value::I32(3), Value::I32(4)])
                .unwrap()
        };
        matches::assert_matches!(restored, Value::I32(7));
    }

    #[test]
    #[serial]
    fn override_suppresses_trampoline_and_post_modifies_return() {
        let target = Addr::from(add_spied as *const ());
        let sig = ParamSignature::parse("ii)i").unwrap();
        let before = ADD_SPY_CALLS.load(std::sync::atomic::Ordering::SeqCst);

        let pre: HookCallback =
            Box::new(move |_ctx: &mut HookContext| HookAction::Override(Value::I32(99)));
        let post: HookCallback = Box::new(move |ctx: &mut HookContext| {
            ctx.set_return(Value::I32(100)).unwrap();
            HookAction::Continue
        });

        let pre_id = hook(target, Phase::Pre, Convention::Cdecl, sig.clone(), pre).unwrap();
        let post_id = hook(target, Phase::Post, Convention::Cdecl, sig, post).unwrap();

        let call_frame =
            CallFrame::new(ParamSignature::parse("ii)i").unwrap(), Convention::Cdecl).unwrap();
        let result = unsafe {
            call_frame
                .call(target, &[Value::I32(3), Value::I32(4)])
                .unwrap()
        };
        matches::assert_matches!(result, Value::I32(100));
        assert_eq!(
            ADD_SPY_CALLS.load(std::sync::atomic::Ordering::SeqCst),
            before,
            "the trampoline (original function) must not run when a pre-callback overrides"
        );

        unhook(target, Phase::Pre, pre_id).unwrap();
        unhook(target, Phase::Post, post_id).unwrap();
    }
}
