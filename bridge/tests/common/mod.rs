//! Shared test helpers for integration tests.
//!
//! Guests are written in WAT. [`guest`] wraps a module body with the `wbg`
//! intrinsic imports and the support exports every test guest needs.
//!
//! Guest memory map:
//!
//! | addr | use |
//! |---|---|
//! | 0 | last handle passed to `__wbindgen_exn_store` |
//! | 4 | number of exceptions stored |
//! | 8 | set by `__wbindgen_start` |
//! | 12 | destructor call count |
//! | 16..32 | return-pointer scratch |
//! | 32..4096 | test data |
//! | 4096.. | bump allocator |

#![allow(dead_code)]

use polyglot_bridge::{Bridge, BridgeConfig, GuestInstance, Imports};
use polyglot_hostapi::HostValue;

/// Every `wbg` intrinsic, imported under a `$name` without the prefix.
pub const WBG: &str = r#"
    (import "wbg" "__wbindgen_object_drop_ref" (func $drop (param i32)))
    (import "wbg" "__wbindgen_object_clone_ref" (func $clone (param i32) (result i32)))
    (import "wbg" "__wbindgen_string_new" (func $string_new (param i32 i32) (result i32)))
    (import "wbg" "__wbindgen_number_new" (func $number_new (param f64) (result i32)))
    (import "wbg" "__wbindgen_bytes_new" (func $bytes_new (param i32 i32) (result i32)))
    (import "wbg" "__wbindgen_error_new" (func $error_new (param i32 i32) (result i32)))
    (import "wbg" "__wbindgen_string_get" (func $string_get (param i32 i32)))
    (import "wbg" "__wbindgen_number_get" (func $number_get (param i32 i32)))
    (import "wbg" "__wbindgen_debug_string" (func $debug_string (param i32 i32)))
    (import "wbg" "__wbindgen_is_undefined" (func $is_undefined (param i32) (result i32)))
    (import "wbg" "__wbindgen_is_null" (func $is_null (param i32) (result i32)))
    (import "wbg" "__wbindgen_is_object" (func $is_object (param i32) (result i32)))
    (import "wbg" "__wbindgen_is_function" (func $is_function (param i32) (result i32)))
    (import "wbg" "__wbindgen_is_string" (func $is_string (param i32) (result i32)))
    (import "wbg" "__wbindgen_throw" (func $throw (param i32 i32)))
    (import "wbg" "__wbindgen_rethrow" (func $rethrow (param i32)))
    (import "wbg" "__wbindgen_closure_new" (func $closure_new (param i32 i32 i32 i32) (result i32)))
    (import "wbg" "__wbindgen_cb_unref" (func $cb_unref (param i32)))
    (import "wbg" "__wbindgen_call0" (func $call0 (param i32 i32) (result i32)))
    (import "wbg" "__wbindgen_call1" (func $call1 (param i32 i32 i32) (result i32)))
    (import "wbg" "__wbindgen_object_new" (func $object_new (result i32)))
    (import "wbg" "__wbindgen_array_new" (func $array_new (result i32)))
    (import "wbg" "__wbindgen_array_push" (func $array_push (param i32 i32) (result i32)))
    (import "wbg" "__wbindgen_reflect_get" (func $reflect_get (param i32 i32) (result i32)))
    (import "wbg" "__wbindgen_reflect_set" (func $reflect_set (param i32 i32 i32) (result i32)))
    (import "wbg" "__wbindgen_promise_new" (func $promise_new (param i32 i32 i32) (result i32)))
    (import "wbg" "__wbindgen_promise_resolve" (func $promise_resolve (param i32) (result i32)))
    (import "wbg" "__wbindgen_promise_then" (func $promise_then (param i32 i32) (result i32)))
    (import "wbg" "__wbindgen_promise_then2" (func $promise_then2 (param i32 i32 i32) (result i32)))
    (import "wbg" "__wbindgen_queue_microtask" (func $queue_microtask (param i32)))
    (import "wbg" "__wbindgen_instanceof_error" (func $instanceof_error (param i32) (result i32)))
    (import "wbg" "__wbindgen_instanceof_promise" (func $instanceof_promise (param i32) (result i32)))
"#;

/// Growing bump allocator, error sink, and a counting destructor.
pub const SUPPORT: &str = r#"
    (global $bump (mut i32) (i32.const 4096))

    (func $alloc (param $size i32) (result i32)
        (local $p i32)
        (local $have i32)
        (local.set $p (global.get $bump))
        (global.set $bump (i32.add (global.get $bump) (local.get $size)))
        (local.set $have (i32.mul (memory.size) (i32.const 65536)))
        (if (i32.gt_u (global.get $bump) (local.get $have))
            (then
                (drop (memory.grow
                    (i32.add
                        (i32.div_u (i32.sub (global.get $bump) (local.get $have)) (i32.const 65536))
                        (i32.const 1))))))
        (local.get $p))

    (func (export "__wbindgen_malloc") (param $size i32) (param $align i32) (result i32)
        (call $alloc (local.get $size)))

    (func (export "__wbindgen_realloc") (param $ptr i32) (param $old i32) (param $new i32) (param $align i32) (result i32)
        (local $p i32)
        (local.set $p (call $alloc (local.get $new)))
        (memory.copy (local.get $p) (local.get $ptr) (local.get $old))
        (local.get $p))

    (func (export "__wbindgen_free") (param i32 i32 i32))

    (func (export "__wbindgen_exn_store") (param $handle i32)
        (i32.store (i32.const 0) (local.get $handle))
        (i32.store (i32.const 4) (i32.add (i32.load (i32.const 4)) (i32.const 1))))

    (func $dtor (param $a i32) (param $b i32)
        (i32.store (i32.const 12) (i32.add (i32.load (i32.const 12)) (i32.const 1)))
        (i32.store (i32.const 200) (local.get $a))
        (i32.store (i32.const 204) (local.get $b)))
"#;

/// Wrap a module body with intrinsic imports, memory, and support exports.
/// `imports` holds any extra import declarations (they must precede
/// definitions).
pub fn guest(imports: &str, body: &str) -> String {
    format!(
        "(module {} {} (memory (export \"memory\") 1) {} {})",
        WBG, imports, SUPPORT, body
    )
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn load_bridge(imports: &str, body: &str) -> Bridge {
    load_bridge_with_config(imports, body, BridgeConfig::default())
}

pub fn load_bridge_with_config(imports: &str, body: &str, config: BridgeConfig) -> Bridge {
    init_tracing();
    Bridge::new(guest(imports, body), config).unwrap()
}

/// Compile `body` and instantiate it with `host`.
pub fn instance(body: &str, host: &Imports) -> GuestInstance {
    load_bridge("", body).instantiate(host).unwrap()
}

pub fn read_u32(instance: &GuestInstance, addr: usize) -> u32 {
    let bytes: [u8; 4] = instance.memory()[addr..addr + 4].try_into().unwrap();
    u32::from_le_bytes(bytes)
}

/// Number of exceptions delivered to the error sink.
pub fn exception_count(instance: &GuestInstance) -> u32 {
    read_u32(instance, 4)
}

/// The value behind the last handle delivered to the error sink.
pub fn last_exception(instance: &GuestInstance) -> HostValue {
    instance.get_ref(read_u32(instance, 0))
}

/// Number of destructor calls, and the `(a, b)` of the last one.
pub fn destructor_calls(instance: &GuestInstance) -> (u32, u32, u32) {
    (read_u32(instance, 12), read_u32(instance, 200), read_u32(instance, 204))
}

/// Wrapping sum of `0..n`, the reference for the numeric kernels.
pub fn expected_sum(n: u32) -> u32 {
    (0..n).fold(0u32, |acc, i| acc.wrapping_add(i))
}

/// WAT for a kernel `$name(n) -> sum of 0..n` (wrapping i32).
pub fn sum_kernel(name: &str) -> String {
    format!(
        r#"
        (func ${name} (export "{name}") (param $n i32) (result i32)
            (local $i i32)
            (local $s i32)
            (block $done
                (loop $next
                    (br_if $done (i32.ge_s (local.get $i) (local.get $n)))
                    (local.set $s (i32.add (local.get $s) (local.get $i)))
                    (local.set $i (i32.add (local.get $i) (i32.const 1)))
                    (br $next)))
            (local.get $s))
        "#
    )
}
