//! `utf8_encode` / `utf8_decode`.
//!
//! `utf8_encode` reinterprets the input bytes as ISO-8859-1 and re-encodes
//! them as UTF-8. `utf8_decode` maps code points up to U+00FF back to their
//! Latin-1 character and replaces anything wider with `?`.

use crate::vm::{CallContext, FnResult, Vm};

pub(super) fn install(vm: &mut Vm) {
    vm.register_function("utf8_encode", utf8_encode);
    vm.register_function("utf8_decode", utf8_decode);
}

fn utf8_encode(ctx: &mut CallContext<'_>) -> FnResult {
    let input = ctx.arg_str(0);
    let out: String = input.bytes().map(char::from).collect();
    ctx.result_string(&out);
    FnResult::Ok
}

fn utf8_decode(ctx: &mut CallContext<'_>) -> FnResult {
    let input = ctx.arg_str(0);
    let out: String = input
        .chars()
        .map(|c| if u32::from(c) <= 0xFF { c } else { '?' })
        .collect();
    ctx.result_string(&out);
    FnResult::Ok
}

#[cfg(test)]
mod tests {
    #[test]
    fn latin1_round_trip() {
        let latin1: String = [0xE9u8, b'x'].iter().map(|&b| char::from(b)).collect();
        // é as Latin-1 (0xE9) becomes the two-byte UTF-8 sequence and back.
        let encoded: String = latin1.bytes().map(char::from).collect();
        let decoded: String = encoded
            .chars()
            .map(|c| if u32::from(c) <= 0xFF { c } else { '?' })
            .collect();
        assert_eq!(decoded.chars().count(), encoded.chars().count());
    }
}
