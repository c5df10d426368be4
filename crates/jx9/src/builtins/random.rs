//! Randomness builtins backed by the VM's PRNG state: `rand`,
//! `getrandmax`, `rand_str`.

use rand::RngCore;

use crate::vm::{CallContext, FnResult, Vm};

/// Largest value `rand()` can produce without a range.
const RAND_MAX: u32 = u32::MAX;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

pub(super) fn install(vm: &mut Vm) {
    vm.register_function("rand", rand);
    vm.register_function("getrandmax", getrandmax);
    vm.register_function("rand_str", rand_str);
}

fn rand(ctx: &mut CallContext<'_>) -> FnResult {
    let raw = ctx.vm.rng.next_u32();
    if ctx.arg_count() >= 2 {
        let min = ctx.arg_int(0);
        let max = ctx.arg_int(1);
        if max > min {
            // The span can exceed i64 (and reach 2^64 for the full integer
            // range), so the reduction runs in i128. A u32 draw stays well
            // below any such span, keeping the offset in range for i64.
            let span = i128::from(max) - i128::from(min) + 1;
            let offset = i128::from(raw) % span;
            ctx.result_int(min + i64::try_from(offset).expect("offset below a u32 draw"));
            return FnResult::Ok;
        }
        ctx.result_int(min);
        return FnResult::Ok;
    }
    ctx.result_int(i64::from(raw));
    FnResult::Ok
}

fn getrandmax(ctx: &mut CallContext<'_>) -> FnResult {
    ctx.result_int(i64::from(RAND_MAX));
    FnResult::Ok
}

/// A random lowercase string; the length argument is clamped to 1..=1024
/// and defaults to 16.
fn rand_str(ctx: &mut CallContext<'_>) -> FnResult {
    let len = if ctx.arg_count() > 0 { ctx.arg_int(0) } else { 16 };
    let len = usize::try_from(len.clamp(1, 1024)).expect("clamped to a small range");
    let mut out = String::with_capacity(len);
    for _ in 0..len {
        let roll = ctx.vm.rng.next_u32() as usize % ALPHABET.len();
        out.push(char::from(ALPHABET[roll]));
    }
    ctx.result_string(&out);
    FnResult::Ok
}
