//! Type reflection and conversion builtins: `gettype`, `sizeof`/`count`,
//! the `is_*` predicates, and the `intval`/`floatval`/`strval`/`boolval`
//! conversion functions.

use crate::{
    value::Value,
    vm::{CallContext, FnResult, Vm},
};

pub(super) fn install(vm: &mut Vm) {
    vm.register_function("gettype", gettype);
    vm.register_function("sizeof", sizeof);
    vm.register_function("count", sizeof);
    vm.register_function("is_null", |ctx| predicate(ctx, |v, _| matches!(v, Value::Null)));
    vm.register_function("is_bool", |ctx| predicate(ctx, |v, _| matches!(v, Value::Bool(_))));
    vm.register_function("is_int", |ctx| predicate(ctx, |v, _| matches!(v, Value::Int(_))));
    vm.register_function("is_float", |ctx| predicate(ctx, |v, _| matches!(v, Value::Real(_))));
    vm.register_function("is_string", |ctx| predicate(ctx, |v, _| matches!(v, Value::Str(_))));
    vm.register_function("is_array", |ctx| predicate(ctx, |v, _| matches!(v, Value::Map(_))));
    vm.register_function("is_object", |ctx| {
        predicate(ctx, |v, vm| match v {
            Value::Map(id) => vm.heap.get(*id).is_json_object(),
            _ => false,
        })
    });
    vm.register_function("is_resource", |ctx| {
        predicate(ctx, |v, _| matches!(v, Value::Resource(_)))
    });
    vm.register_function("is_numeric", |ctx| {
        predicate(ctx, |v, _| match v {
            Value::Int(_) | Value::Real(_) => true,
            Value::Str(s) => is_numeric_image(s),
            _ => false,
        })
    });
    vm.register_function("intval", intval);
    vm.register_function("floatval", floatval);
    vm.register_function("strval", strval);
    vm.register_function("boolval", boolval);
}

fn gettype(ctx: &mut CallContext<'_>) -> FnResult {
    let name = ctx.arg_type_name(0);
    ctx.result_string(name);
    FnResult::Ok
}

/// Entry count of a map; 0 for null, 1 for any scalar.
fn sizeof(ctx: &mut CallContext<'_>) -> FnResult {
    let size = match ctx.arg(0) {
        None | Some(Value::Null) => 0,
        Some(Value::Map(id)) => i64::try_from(ctx.vm.heap.get(*id).len()).unwrap_or(i64::MAX),
        Some(_) => 1,
    };
    ctx.result_int(size);
    FnResult::Ok
}

fn predicate(ctx: &mut CallContext<'_>, test: impl Fn(&Value, &Vm) -> bool) -> FnResult {
    let hit = match ctx.arg(0) {
        Some(v) => test(v, &*ctx.vm),
        None => false,
    };
    ctx.result_bool(hit);
    FnResult::Ok
}

/// True when the string parses as a complete number (leading/trailing
/// whitespace tolerated).
fn is_numeric_image(s: &str) -> bool {
    let trimmed = s.trim();
    !trimmed.is_empty() && trimmed.parse::<f64>().is_ok()
}

fn intval(ctx: &mut CallContext<'_>) -> FnResult {
    let n = ctx.arg_int(0);
    ctx.result_int(n);
    FnResult::Ok
}

fn floatval(ctx: &mut CallContext<'_>) -> FnResult {
    let r = ctx.arg_real(0);
    ctx.result_real(r);
    FnResult::Ok
}

fn strval(ctx: &mut CallContext<'_>) -> FnResult {
    let s = ctx.arg_str(0);
    ctx.result_string(&s);
    FnResult::Ok
}

fn boolval(ctx: &mut CallContext<'_>) -> FnResult {
    let b = ctx.arg_bool(0);
    ctx.result_bool(b);
    FnResult::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_image() {
        assert!(is_numeric_image("42"));
        assert!(is_numeric_image(" 1.5e3 "));
        assert!(!is_numeric_image("3 apples"));
        assert!(!is_numeric_image(""));
    }
}
