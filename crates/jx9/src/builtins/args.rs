//! Call-frame introspection: `func_num_args`, `func_get_arg`,
//! `func_get_args`, `function_exists`, `is_callable`, `defined`.

use crate::{
    error::Severity,
    value::Value,
    vm::{CallContext, FnResult, Vm},
};

pub(super) fn install(vm: &mut Vm) {
    vm.register_function("func_num_args", func_num_args);
    vm.register_function("func_get_arg", func_get_arg);
    vm.register_function("func_get_args", func_get_args);
    vm.register_function("function_exists", function_exists);
    vm.register_function("is_callable", is_callable);
    vm.register_function("defined", defined);
}

fn func_num_args(ctx: &mut CallContext<'_>) -> FnResult {
    if !ctx.vm.in_function_frame() {
        ctx.throw(Severity::Warning, "called from the global scope");
        ctx.result_int(-1);
        return FnResult::Ok;
    }
    let count = i64::try_from(ctx.vm.current_arg_count()).unwrap_or(0);
    ctx.result_int(count);
    FnResult::Ok
}

fn func_get_arg(ctx: &mut CallContext<'_>) -> FnResult {
    if !ctx.vm.in_function_frame() {
        ctx.throw(Severity::Warning, "called from the global scope");
        ctx.result_bool(false);
        return FnResult::Ok;
    }
    let idx = usize::try_from(ctx.arg_int(0)).unwrap_or(usize::MAX);
    match ctx.vm.current_arg_value(idx) {
        Some(value) => ctx.set_result(value),
        None => {
            ctx.throw(Severity::Warning, "argument index is out of range");
            ctx.result_bool(false);
        }
    }
    FnResult::Ok
}

fn func_get_args(ctx: &mut CallContext<'_>) -> FnResult {
    if !ctx.vm.in_function_frame() {
        ctx.throw(Severity::Warning, "called from the global scope");
        ctx.result_bool(false);
        return FnResult::Ok;
    }
    let count = ctx.vm.current_arg_count();
    let id = ctx.vm.heap.alloc(crate::map::Map::new(false));
    for idx in 0..count {
        let value = ctx.vm.current_arg_value(idx).unwrap_or(Value::Null);
        ctx.vm.heap.get_mut(id).push(value);
    }
    ctx.set_result(Value::Map(id));
    FnResult::Ok
}

fn function_exists(ctx: &mut CallContext<'_>) -> FnResult {
    let name = ctx.arg_str(0);
    let exists = ctx.vm.function_exists(&name);
    ctx.result_bool(exists);
    FnResult::Ok
}

fn is_callable(ctx: &mut CallContext<'_>) -> FnResult {
    let callable = match ctx.arg(0) {
        Some(Value::Str(name)) => ctx.vm.function_exists(&name.clone()),
        _ => false,
    };
    ctx.result_bool(callable);
    FnResult::Ok
}

fn defined(ctx: &mut CallContext<'_>) -> FnResult {
    let name = ctx.arg_str(0);
    let known = ctx.vm.constants.contains_key(&name);
    ctx.result_bool(known);
    FnResult::Ok
}
