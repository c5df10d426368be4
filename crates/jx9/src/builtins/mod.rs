//! The intrinsic function library.
//!
//! Every builtin goes through the same foreign-function registry hosts use,
//! so scripts cannot tell them apart from host extensions (and a host can
//! shadow one by re-registering the name). One submodule per group.

mod args;
mod array;
mod env;
mod include;
mod json;
mod output;
mod prelude;
mod random;
mod string;
mod types;
mod url;
mod utf8;

use crate::vm::Vm;

/// Installs the whole library into a freshly assembled VM.
///
/// The script prelude goes last: its entries yield to any same-named
/// function the program itself defines.
pub(crate) fn install(vm: &mut Vm) {
    args::install(vm);
    array::install(vm);
    env::install(vm);
    include::install(vm);
    json::install(vm);
    output::install(vm);
    random::install(vm);
    string::install(vm);
    types::install(vm);
    url::install(vm);
    utf8::install(vm);
    prelude::install(vm);
}
