//! Environment bridge builtins: `extract`, `getopt`.

use crate::{
    error::Severity,
    object::Object,
    value::Value,
    vm::{CallContext, FnResult, Vm},
};

pub(super) fn install(vm: &mut Vm) {
    vm.register_function("extract", extract);
    vm.register_function("getopt", getopt);
}

/// Imports the entries of a map into the current scope as variables.
/// Returns the number of variables created.
fn extract(ctx: &mut CallContext<'_>) -> FnResult {
    let Some(Value::Map(id)) = ctx.arg(0) else {
        ctx.throw(Severity::Warning, "expecting a JSON array or object");
        ctx.result_bool(false);
        return FnResult::Ok;
    };
    let id = *id;
    let keys = ctx.vm.heap.get(id).key_snapshot();
    let mut created = 0i64;
    for key in keys {
        let name = key.image();
        if !is_variable_name(&name) {
            continue;
        }
        let value = match ctx.vm.heap.get(id).get(&key) {
            Some(Value::Map(child)) => {
                let child = *child;
                ctx.vm.heap.inc_ref(child);
                Value::Map(child)
            }
            Some(other) => other.clone_immediate(),
            None => continue,
        };
        ctx.vm.set_local_var(&name, value);
        created += 1;
    }
    ctx.result_int(created);
    FnResult::Ok
}

/// A key image usable as a variable name: starts with a letter or
/// underscore, continues alphanumeric.
fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else { return false };
    (first.is_ascii_alphabetic() || first == '_') && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parses `$argv` against a short-option string (`"ab:c::"`) and an
/// optional array of long options (`["verbose", "out:"]`). Returns an
/// object mapping found options to their values (`false` for flags).
fn getopt(ctx: &mut CallContext<'_>) -> FnResult {
    let shorts = parse_short_options(&ctx.arg_str(0));
    let longs = parse_long_options(ctx);
    let argv = collect_argv(ctx);
    let mut found: Vec<(String, Object)> = Vec::new();
    let mut it = argv.iter().peekable();
    while let Some(arg) = it.next() {
        if let Some(name) = arg.strip_prefix("--") {
            let (name, inline) = match name.split_once('=') {
                Some((n, v)) => (n, Some(v.to_string())),
                None => (name, None),
            };
            let Some(mode) = longs.iter().find(|(n, _)| n == name).map(|(_, m)| *m) else {
                continue;
            };
            let value = option_value(mode, inline, &mut it);
            push_option(&mut found, name, value);
            continue;
        }
        if let Some(cluster) = arg.strip_prefix('-') {
            let mut chars = cluster.char_indices();
            while let Some((at, ch)) = chars.next() {
                let Some(mode) = shorts.iter().find(|(c, _)| *c == ch).map(|(_, m)| *m) else {
                    continue;
                };
                if mode == ArgMode::None {
                    push_option(&mut found, &ch.to_string(), None);
                    continue;
                }
                // The remainder of the token is the inline value.
                let rest = &cluster[at + ch.len_utf8()..];
                let inline = if rest.is_empty() { None } else { Some(rest.to_string()) };
                let value = option_value(mode, inline, &mut it);
                push_option(&mut found, &ch.to_string(), value);
                break;
            }
        }
    }
    ctx.result_object(&Object::Map(found));
    FnResult::Ok
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgMode {
    None,
    Required,
    Optional,
}

fn parse_short_options(spec: &str) -> Vec<(char, ArgMode)> {
    let mut out = Vec::new();
    let chars: Vec<char> = spec.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        if !c.is_ascii_alphanumeric() {
            continue;
        }
        let mut mode = ArgMode::None;
        if chars.get(i) == Some(&':') {
            mode = ArgMode::Required;
            i += 1;
            if chars.get(i) == Some(&':') {
                mode = ArgMode::Optional;
                i += 1;
            }
        }
        out.push((c, mode));
    }
    out
}

fn parse_long_options(ctx: &CallContext<'_>) -> Vec<(String, ArgMode)> {
    let Some(Object::Array(items)) = ctx.arg_object(1) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| item.as_str())
        .map(|spec| {
            if let Some(name) = spec.strip_suffix("::") {
                (name.to_string(), ArgMode::Optional)
            } else if let Some(name) = spec.strip_suffix(':') {
                (name.to_string(), ArgMode::Required)
            } else {
                (spec.to_string(), ArgMode::None)
            }
        })
        .collect()
}

fn collect_argv(ctx: &CallContext<'_>) -> Vec<String> {
    let Some(id) = ctx.vm.superglobal_map("argv") else {
        return Vec::new();
    };
    ctx.vm
        .heap
        .get(id)
        .values()
        .map(|v| match v {
            Value::Str(s) => s.clone(),
            other => other.to_display(&ctx.vm.heap),
        })
        .collect()
}

fn option_value(
    mode: ArgMode,
    inline: Option<String>,
    it: &mut std::iter::Peekable<std::slice::Iter<'_, String>>,
) -> Option<String> {
    if let Some(v) = inline {
        return Some(v);
    }
    match mode {
        ArgMode::None | ArgMode::Optional => None,
        ArgMode::Required => {
            // Consume the next token unless it looks like another option.
            if it.peek().is_some_and(|next| !next.starts_with('-')) {
                return it.next().cloned();
            }
            None
        }
    }
}

fn push_option(found: &mut Vec<(String, Object)>, name: &str, value: Option<String>) {
    let object = value.map_or(Object::Bool(false), Object::Str);
    found.push((name.to_string(), object));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_option_spec() {
        let spec = parse_short_options("ab:c::");
        assert_eq!(spec[0], ('a', ArgMode::None));
        assert_eq!(spec[1], ('b', ArgMode::Required));
        assert_eq!(spec[2], ('c', ArgMode::Optional));
    }

    #[test]
    fn variable_name_filter() {
        assert!(is_variable_name("user"));
        assert!(is_variable_name("_x1"));
        assert!(!is_variable_name("1abc"));
        assert!(!is_variable_name(""));
        assert!(!is_variable_name("a b"));
    }
}
