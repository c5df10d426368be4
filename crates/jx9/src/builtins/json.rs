//! `json_encode` / `json_decode`.

use crate::{
    json,
    value::Value,
    vm::{CallContext, FnResult, Vm},
};

pub(super) fn install(vm: &mut Vm) {
    vm.register_function("json_encode", json_encode);
    vm.register_function("json_decode", json_decode);
}

fn json_encode(ctx: &mut CallContext<'_>) -> FnResult {
    let image = match ctx.arg(0) {
        Some(value) => json::encode(value, &ctx.vm.heap),
        None => "null".to_string(),
    };
    ctx.result_string(&image);
    FnResult::Ok
}

fn json_decode(ctx: &mut CallContext<'_>) -> FnResult {
    let input = ctx.arg_str(0);
    match json::decode(&input, &mut ctx.vm.heap) {
        Some(value) => ctx.set_result(value),
        None => ctx.set_result(Value::Null),
    }
    FnResult::Ok
}
