//! Native hashmap builtins: `array_push`, `array_pop`, `array_shift`.
//!
//! These mutate the argument map in place through its shared reference; the
//! higher-level array helpers (`array_keys`, `array_merge`, `in_array`, …)
//! live in the compiled-in script prelude.

use crate::{
    error::Severity,
    value::Value,
    vm::{CallContext, FnResult, Vm},
};

pub(super) fn install(vm: &mut Vm) {
    vm.register_function("array_push", array_push);
    vm.register_function("array_pop", array_pop);
    vm.register_function("array_shift", array_shift);
}

/// Appends every further argument under automatic indices; returns the new
/// entry count.
fn array_push(ctx: &mut CallContext<'_>) -> FnResult {
    let Some(Value::Map(id)) = ctx.arg(0) else {
        ctx.throw(Severity::Warning, "expecting a JSON array");
        ctx.result_bool(false);
        return FnResult::Ok;
    };
    let id = *id;
    for idx in 1..ctx.arg_count() {
        let value = match ctx.arg(idx) {
            Some(Value::Map(child)) => {
                let child = *child;
                ctx.vm.heap.inc_ref(child);
                Value::Map(child)
            }
            Some(other) => other.clone_immediate(),
            None => Value::Null,
        };
        ctx.vm.heap.get_mut(id).push(value);
    }
    let count = i64::try_from(ctx.vm.heap.get(id).len()).unwrap_or(i64::MAX);
    ctx.result_int(count);
    FnResult::Ok
}

/// Removes and returns the last entry (null when empty).
fn array_pop(ctx: &mut CallContext<'_>) -> FnResult {
    let Some(Value::Map(id)) = ctx.arg(0) else {
        ctx.throw(Severity::Warning, "expecting a JSON array");
        ctx.result_null();
        return FnResult::Ok;
    };
    let id = *id;
    match ctx.vm.heap.get_mut(id).pop_last() {
        Some((_, value)) => ctx.set_result(value),
        None => ctx.result_null(),
    }
    FnResult::Ok
}

/// Removes and returns the first entry (null when empty).
fn array_shift(ctx: &mut CallContext<'_>) -> FnResult {
    let Some(Value::Map(id)) = ctx.arg(0) else {
        ctx.throw(Severity::Warning, "expecting a JSON array");
        ctx.result_null();
        return FnResult::Ok;
    };
    let id = *id;
    match ctx.vm.heap.get_mut(id).shift_first() {
        Some((_, value)) => ctx.set_result(value),
        None => ctx.result_null(),
    }
    FnResult::Ok
}
