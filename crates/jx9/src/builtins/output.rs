//! Output builtins: `print` (function form) and `dump`.
//!
//! Both route through the single registered output consumer, like the
//! `print` language construct.

use crate::vm::{CallContext, FnResult, Vm};

pub(super) fn install(vm: &mut Vm) {
    vm.register_function("print", print);
    vm.register_function("dump", dump);
}

fn print(ctx: &mut CallContext<'_>) -> FnResult {
    for idx in 0..ctx.arg_count() {
        let text = ctx.arg_str(idx);
        if ctx.output(text.as_bytes()).is_err() {
            return FnResult::Abort;
        }
    }
    ctx.result_int(1);
    FnResult::Ok
}

/// Prints a `type(contents)` line per argument, e.g. `int(5)` or
/// `string(3 'abc')`.
fn dump(ctx: &mut CallContext<'_>) -> FnResult {
    for idx in 0..ctx.arg_count() {
        let image = match ctx.arg(idx) {
            Some(value) => value.dump(&ctx.vm.heap),
            None => continue,
        };
        if ctx.output(image.as_bytes()).is_err() {
            return FnResult::Abort;
        }
    }
    FnResult::Ok
}
