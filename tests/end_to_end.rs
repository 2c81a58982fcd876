//! Whole-of-bridge scenarios, covering the bridge's core end-to-end paths.
//! Each builds a small native function in-process (standing in for "a
//! module exporting ...") and drives it through the public API the way a
//! host binding would.

use reflect_ffi::{
    abi::CallFrame, callback::Thunk, detour, function::FunctionHandle, hook::HookCallback,
    module::Module, scanner, Address, Convention, HookAction, HookContext, ParamSignature, Phase,
    Pointer, Value,
};
use serial_test::serial;

/// Installs a `tracing` subscriber once per test binary, so the `debug!`/
/// `trace!`/`warn!` spans in `module`/`detour` land somewhere visible under
/// `REFLECT_FFI_LOG=trace cargo test -- --nocapture` instead of being
/// silently dropped.
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_env("REFLECT_FFI_LOG"))
            .with_test_writer()
            .try_init();
    });
}

extern "C" fn add(a: i32, b: i32) -> i32 {
    a + b
}

extern "C" fn touch_nothing() {}

#[repr(C)]
struct Player {
    vtable: *const usize,
}

extern "C" fn get_health(_this: *const Player) -> i32 {
    100
}

// Scenario 1: free-function call via symbol.
#[test]
fn free_function_call_via_symbol() {
    let handle = FunctionHandle::new(
        Address::from(add as *const ()),
        Convention::Cdecl,
        ParamSignature::parse("ii)i").unwrap(),
    )
    .unwrap();

    let result = handle.call(&[Value::I32(3), Value::I32(4)]).unwrap();
    matches::assert_matches!(result, Value::I32(7));
}

// Scenario 2: signature scan and indirect call.
#[test]
fn signature_scan_and_indirect_call() {
    // Build a synthetic module image whose bytes at offset 0x10 are the
    // classic x86 prologue pattern, "55 8B EC 83 EC 10".
    let mut image = vec![0x90u8; 0x10];
    image.extend_from_slice(&[0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x10]);
    let module = Module::from_raw_image_for_test(image);

    let pattern = scanner::Pattern::parse("55 8B EC * * *").unwrap();
    let found = scanner::find_signature(&module, &pattern).unwrap();
    assert_eq!(found, module.base_address() + 0x10);

    // "With parameters=')v' the call returns without error" — exercised
    // against a real void/void function rather than the synthetic bytes
    // above, which aren't executable.
    let handle = FunctionHandle::new(
        Address::from(touch_nothing as *const ()),
        Convention::Cdecl,
        ParamSignature::parse(")v").unwrap(),
    )
    .unwrap();
    handle.call(&[]).unwrap();
}

// Scenario 3: virtual dispatch.
#[test]
fn virtual_dispatch_through_vtable_slot() {
    let vtable: [usize; 4] = [0, 0, 0, get_health as usize];
    let player = Player {
        vtable: vtable.as_ptr(),
    };

    let virtual_handle = FunctionHandle::make_virtual(
        3,
        Convention::Thiscall,
        ParamSignature::parse(")i").unwrap(),
        std::sync::Arc::new(|v: Value| v),
    )
    .unwrap();

    let result = virtual_handle
        .call(Address::from(&player as *const Player), &[])
        .unwrap();
    matches::assert_matches!(result, Value::I32(100));
}

// Scenario 4: detour with modification, then clean unhook.
#[test]
#[serial]
fn detour_with_pre_callback_modification_then_unhook() {
    init_tracing();
    let handle = FunctionHandle::new(
        Address::from(add as *const ()),
        Convention::Cdecl,
        ParamSignature::parse("ii)i").unwrap(),
    )
    .unwrap();

    let callback: HookCallback = Box::new(|ctx: &mut HookContext| {
        ctx.set_arg(0, Value::I32(10)).unwrap();
        HookAction::Modified
    });
    let id = handle.hook(Phase::Pre, callback).unwrap();

    let hooked = handle.call(&[Value::I32(3), Value::I32(4)]).unwrap();
    matches::assert_matches!(hooked, Value::I32(14));

    handle.unhook(Phase::Pre, id).unwrap();

    let unhooked = handle.call(&[Value::I32(3), Value::I32(4)]).unwrap();
    matches::assert_matches!(unhooked, Value::I32(7));
}

// Scenario 5: override suppresses the trampoline; post-callback modifies
// the final return.
#[test]
#[serial]
fn override_and_post_modify_skips_trampoline() {
    static SPY_CALLS: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
    extern "C" fn spied_add(a: i32, b: i32) -> i32 {
        SPY_CALLS.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        a + b
    }

    let handle = FunctionHandle::new(
        Address::from(spied_add as *const ()),
        Convention::Cdecl,
        ParamSignature::parse("ii)i").unwrap(),
    )
    .unwrap();

    let before = SPY_CALLS.load(std::sync::atomic::Ordering::SeqCst);

    let pre: HookCallback =
        Box::new(move |_ctx: &mut HookContext| HookAction::Override(Value::I32(99)));
    let post: HookCallback = Box::new(move |ctx: &mut HookContext| {
        ctx.set_return(Value::I32(100)).unwrap();
        HookAction::Continue
    });

    let pre_id = handle.hook(Phase::Pre, pre).unwrap();
    let post_id = handle.hook(Phase::Post, post).unwrap();

    let result = handle.call(&[Value::I32(3), Value::I32(4)]).unwrap();
    matches::assert_matches!(result, Value::I32(100));
    assert_eq!(
        SPY_CALLS.load(std::sync::atomic::Ordering::SeqCst),
        before,
        "trampoline must not run once a pre-callback overrides"
    );

    handle.unhook(Phase::Pre, pre_id).unwrap();
    handle.unhook(Phase::Post, post_id).unwrap();
}

// Scenario 6: callback thunk round-trip, then use-after-free is the
// caller's problem (not exercised here — only the live round-trip and the
// address going through `free()` are).
#[test]
fn callback_thunk_round_trip() {
    let sig = ParamSignature::parse("ii)i").unwrap();
    let body = Box::new(|args: &[Value]| -> Value {
        let x = match args[0] {
            Value::I32(v) => v,
            _ => unreachable!(),
        };
        let y = match args[1] {
            Value::I32(v) => v,
            _ => unreachable!(),
        };
        Value::I32(x * y)
    });
    let thunk = Thunk::new(sig, Convention::Cdecl, body).unwrap();

    extern "C" fn apply(f: extern "C" fn(i32, i32) -> i32, x: i32, y: i32) -> i32 {
        f(x, y)
    }
    let native_fn: extern "C" fn(i32, i32) -> i32 =
        unsafe { std::mem::transmute(thunk.code().as_usize()) };

    let result = apply(native_fn, 2, 3);
    assert_eq!(result, 6);

    thunk.free().unwrap();
}

// Sanity check that the call-frame builder used directly (not through a
// FunctionHandle) round-trips a signature's declared tag for a few
// primitive types.
#[test]
fn call_frame_round_trips_identity_functions() {
    extern "C" fn identity_i32(x: i32) -> i32 {
        x
    }
    let frame = CallFrame::new(ParamSignature::parse("i)i").unwrap(), Convention::Cdecl).unwrap();
    let result = unsafe {
        frame
            .call(Address::from(identity_i32 as *const ()), &[Value::I32(42)])
            .unwrap()
    };
    matches::assert_matches!(result, Value::I32(42));
}

#[test]
fn pointer_round_trips_through_alloc_and_dealloc() {
    let mut ptr = Pointer::alloc(8).unwrap();
    ptr.set_i32(0xBEEF, 0).unwrap();
    assert_eq!(ptr.get_i32(0).unwrap(), 0xBEEF);
    ptr.dealloc().unwrap();
    matches::assert_matches!(
        ptr.dealloc().unwrap_err(),
        reflect_ffi::Error::InvalidOwnership
    );
}

#[test]
#[serial]
fn get_trampoline_is_none_without_a_detour() {
    assert!(detour::get_trampoline(Address::from(add as *const ())).is_none());
}
