//! String builtins: length, slicing, case mapping, trimming, search,
//! joining and splitting.
//!
//! Strings are byte buffers; positions and lengths count bytes, with the
//! usual negative-offset conventions on `substr`.

use crate::{
    object::Object,
    value::Value,
    vm::{CallContext, FnResult, Vm},
};

pub(super) fn install(vm: &mut Vm) {
    vm.register_function("strlen", strlen);
    vm.register_function("substr", substr);
    vm.register_function("trim", |ctx| trimmed(ctx, true, true));
    vm.register_function("ltrim", |ctx| trimmed(ctx, true, false));
    vm.register_function("rtrim", |ctx| trimmed(ctx, false, true));
    vm.register_function("strtoupper", strtoupper);
    vm.register_function("strtolower", strtolower);
    vm.register_function("str_repeat", str_repeat);
    vm.register_function("strpos", strpos);
    vm.register_function("implode", implode);
    vm.register_function("explode", explode);
}

fn strlen(ctx: &mut CallContext<'_>) -> FnResult {
    let len = i64::try_from(ctx.arg_str(0).len()).unwrap_or(i64::MAX);
    ctx.result_int(len);
    FnResult::Ok
}

/// `substr(str, start [, length])`: negative start counts from the end,
/// negative length drops that many trailing bytes. Returns false when the
/// start lies past the end.
fn substr(ctx: &mut CallContext<'_>) -> FnResult {
    let s = ctx.arg_str(0);
    let len = i64::try_from(s.len()).unwrap_or(i64::MAX);
    // Offsets and lengths are arbitrary script integers: every step clamps
    // so that extreme arguments cannot overflow the arithmetic.
    let mut start = ctx.arg_int(1);
    if start < 0 {
        start = len.saturating_add(start).max(0);
    }
    if start >= len {
        ctx.result_bool(false);
        return FnResult::Ok;
    }
    let mut take = if ctx.arg_count() > 2 { ctx.arg_int(2) } else { len - start };
    if take < 0 {
        take = (len - start).saturating_add(take).max(0);
    }
    let end = start.saturating_add(take).min(len);
    let start = usize::try_from(start).expect("bounded by the string length");
    let end = usize::try_from(end).expect("bounded by the string length");
    match s.get(start..end) {
        Some(slice) => ctx.result_string(slice),
        // Byte positions splitting a multibyte character: degrade gracefully.
        None => ctx.result_bool(false),
    }
    FnResult::Ok
}

fn trimmed(ctx: &mut CallContext<'_>, left: bool, right: bool) -> FnResult {
    let s = ctx.arg_str(0);
    let out = match (left, right) {
        (true, true) => s.trim(),
        (true, false) => s.trim_start(),
        _ => s.trim_end(),
    };
    ctx.result_string(out);
    FnResult::Ok
}

fn strtoupper(ctx: &mut CallContext<'_>) -> FnResult {
    let s = ctx.arg_str(0).to_ascii_uppercase();
    ctx.result_string(&s);
    FnResult::Ok
}

fn strtolower(ctx: &mut CallContext<'_>) -> FnResult {
    let s = ctx.arg_str(0).to_ascii_lowercase();
    ctx.result_string(&s);
    FnResult::Ok
}

fn str_repeat(ctx: &mut CallContext<'_>) -> FnResult {
    let s = ctx.arg_str(0);
    let times = usize::try_from(ctx.arg_int(1).max(0)).unwrap_or(0);
    // Bounded to keep a hostile count from exhausting memory.
    let times = times.min(1_000_000 / s.len().max(1));
    ctx.result_string(&s.repeat(times));
    FnResult::Ok
}

/// Byte offset of the first occurrence, or false when absent.
fn strpos(ctx: &mut CallContext<'_>) -> FnResult {
    let haystack = ctx.arg_str(0);
    let needle = ctx.arg_str(1);
    if needle.is_empty() {
        ctx.result_bool(false);
        return FnResult::Ok;
    }
    match haystack.find(&needle) {
        Some(at) => ctx.result_int(i64::try_from(at).unwrap_or(0)),
        None => ctx.result_bool(false),
    }
    FnResult::Ok
}

/// `implode(glue, array)`: joins the string images of the entries.
fn implode(ctx: &mut CallContext<'_>) -> FnResult {
    let glue = ctx.arg_str(0);
    let Some(Value::Map(id)) = ctx.arg(1) else {
        ctx.result_string(&ctx.arg_str(1));
        return FnResult::Ok;
    };
    let id = *id;
    let mut out = String::new();
    let mut first = true;
    let images: Vec<String> = ctx
        .vm
        .heap
        .get(id)
        .values()
        .map(|v| v.to_display(&ctx.vm.heap))
        .collect();
    for image in images {
        if !first {
            out.push_str(&glue);
        }
        first = false;
        out.push_str(&image);
    }
    ctx.result_string(&out);
    FnResult::Ok
}

/// `explode(separator, str)`: splits into an array of pieces. An empty
/// separator yields false.
fn explode(ctx: &mut CallContext<'_>) -> FnResult {
    let sep = ctx.arg_str(0);
    let s = ctx.arg_str(1);
    if sep.is_empty() {
        ctx.result_bool(false);
        return FnResult::Ok;
    }
    let pieces: Vec<Object> = s.split(&sep).map(Object::from).collect();
    ctx.result_object(&Object::Array(pieces));
    FnResult::Ok
}
