//! An embeddable JSON document scripting engine.
//!
//! The crate compiles a JSON-centric, dynamically typed scripting language
//! into stack bytecode and executes it on a virtual machine that lives
//! entirely inside the host application — there is no standalone binary.
//! First-class JSON arrays and objects are the native data model; the host
//! exchanges values with scripts through the [`Object`] type, foreign
//! functions, named constants and superglobals.
//!
//! ```
//! use jx9::Engine;
//!
//! let engine = Engine::new();
//! let mut vm = engine.compile("hello.jx9", r#"print 2 + "3 apples";"#).unwrap();
//! vm.collect_output();
//! vm.exec();
//! assert_eq!(vm.take_output().unwrap(), b"5");
//! ```

mod builtins;
mod bytecode;
mod compile;
mod engine;
mod error;
mod heap;
mod io;
mod json;
mod lexer;
mod map;
mod object;
mod parse;
mod stream;
pub mod tracer;
mod value;
mod vm;

pub use crate::{
    engine::{Config, DEFAULT_MAX_RECURSION, Engine},
    error::{CompileError, Severity},
    io::{Abort, CollectOutput, NoOutput, OutputConsumer, StdErrOutput, StdOutput},
    object::Object,
    stream::{FileStream, StreamDevice, StreamHandle},
    tracer::{ExecTracer, NoopTracer, RecordingTracer, StderrTracer, TraceEvent},
    value::ResourceId,
    vm::{CallContext, ExecStatus, FnResult, Vm},
};
