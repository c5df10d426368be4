//! Source inclusion: `include` (every time) and `import` (once per path).
//!
//! Paths resolve through the stream-device registry by `scheme://` prefix
//! (`file` implied), searching the configured import path for relative
//! names. The included source compiles into the running VM — its literal
//! pool and function table simply grow — and executes in the calling scope,
//! so variables it creates land in the caller's frame.

use std::rc::Rc;

use crate::{
    compile,
    error::Severity,
    stream::{read_all, split_scheme},
    value::Value,
    vm::{CallContext, FnResult, Vm},
};

pub(super) fn install(vm: &mut Vm) {
    vm.register_function("include", |ctx| run_include(ctx, false));
    vm.register_function("import", |ctx| run_include(ctx, true));
}

fn run_include(ctx: &mut CallContext<'_>, once: bool) -> FnResult {
    let path = ctx.arg_str(0);
    if path.is_empty() {
        ctx.throw(Severity::Warning, "missing script path");
        ctx.result_bool(false);
        return FnResult::Ok;
    }
    if once && ctx.vm.included.contains(&path) {
        ctx.result_bool(true);
        return FnResult::Ok;
    }
    let Some(source) = read_source(ctx, &path) else {
        ctx.result_bool(false);
        return FnResult::Ok;
    };
    // Compile against a copy of the literal pool so a failed compile leaves
    // the running program untouched.
    let literals: Vec<Value> = ctx.vm.literals.iter().map(Value::clone_immediate).collect();
    let output = match compile::compile_source(&source, literals, ctx.vm.lambda_next) {
        Ok(output) => output,
        Err(errors) => {
            let first = errors.first().map_or_else(String::new, ToString::to_string);
            ctx.throw(Severity::Error, &format!("compile error in '{path}': {first}"));
            ctx.result_bool(false);
            return FnResult::Ok;
        }
    };
    ctx.vm.literals = output.literals;
    ctx.vm.lambda_next = output.lambda_next;
    for func in output.funcs {
        ctx.vm.install_func(func);
    }
    for (name, chunk) in output.consts {
        ctx.vm
            .constants
            .insert(name.to_string(), crate::vm::ConstantEntry::Expr(Rc::new(chunk)));
    }
    ctx.vm.included.insert(path);
    match ctx.vm.exec_sub(&output.main) {
        Ok(ret) => {
            if ret.is_null() {
                ctx.result_bool(true);
            } else {
                ctx.set_result(ret);
            }
            FnResult::Ok
        }
        Err(crate::vm::Flow::Halt) => {
            ctx.vm.pending_halt = true;
            FnResult::Ok
        }
        Err(_) => FnResult::Abort,
    }
}

/// Opens the path through the matching stream device, trying the import
/// search path for relative names, and reads the whole script.
fn read_source(ctx: &mut CallContext<'_>, path: &str) -> Option<String> {
    let (scheme, rest) = split_scheme(path);
    let Some(device) = ctx.vm.find_stream(scheme) else {
        ctx.throw(
            Severity::Warning,
            &format!("no stream device registered for scheme '{scheme}'"),
        );
        return None;
    };
    let mut candidates = vec![rest.to_string()];
    if !rest.starts_with('/') {
        for dir in &ctx.vm.import_paths {
            let joined = if dir.ends_with('/') {
                format!("{dir}{rest}")
            } else {
                format!("{dir}/{rest}")
            };
            candidates.push(joined);
        }
    }
    for candidate in candidates {
        if let Ok(mut handle) = device.open(&candidate) {
            match read_all(handle.as_mut()) {
                Ok(bytes) => return Some(String::from_utf8_lossy(&bytes).into_owned()),
                Err(_) => break,
            }
        }
    }
    ctx.throw(Severity::Warning, &format!("unable to open script '{path}'"));
    None
}
