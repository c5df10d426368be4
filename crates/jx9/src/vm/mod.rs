//! The stack-based virtual machine.
//!
//! One `Vm` owns everything a running script touches: the compiled program,
//! the literal pool, the hashmap arena, the global object pool backing named
//! variables, call frames, the output consumer and the PRNG. Execution is
//! reentrant per compilation unit: every function call, default-argument
//! expression, static initializer and case guard runs on a fresh operand
//! stack sized to its bytecode length plus a guard, which is sound because
//! no opcode pushes more than one slot.
//!
//! A VM must not be entered by more than one executor at a time; concurrent
//! scripts require independent VM instances.

mod context;

use std::rc::Rc;

use ahash::{AHashMap, AHashSet};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use smallvec::SmallVec;

pub use context::{CallContext, FnResult};

use crate::{
    bytecode::{Chunk, ForeachBind, Opcode, P3, STATIC_SLOT_UNSET, VmFunc},
    builtins, compile,
    engine::Config,
    error::{Severity, format_report},
    heap::{Heap, HeapId},
    io::{CollectOutput, NoOutput, OutputConsumer, StdErrOutput, StdOutput},
    map::{Map, MapKey},
    object::Object,
    stream::{FileStream, StreamDevice},
    tracer::ExecTracer,
    value::{self, Value},
};

/// Extra operand slots reserved past the per-chunk maximum.
const STACK_GUARD: usize = 8;

/// Names of the well-known superglobals installed at VM creation.
const SUPERGLOBALS: [&str; 9] = [
    "_GET", "_POST", "_COOKIE", "_SERVER", "_ENV", "_HEADER", "_REQUEST", "argv", "GLOBALS",
];

/// How one execution of a compilation unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// `DONE` reached; the result slot holds the return value.
    Done,
    /// `die`/`exit`; the exit status is recorded on the VM.
    Halt,
    /// Fatal error or abort sentinel; everything unwinds.
    Abort,
}

/// Host-visible outcome of [`Vm::exec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// The program ran to completion.
    Done,
    /// The program terminated through `die`/`exit` with this status.
    Halt(i32),
    /// Execution was aborted (fatal error, or an abort sentinel from a
    /// foreign function or output consumer).
    Aborted,
}

/// One slot of the global object pool.
#[derive(Debug, Default)]
struct PoolSlot {
    value: Value,
}

/// The global object pool: heap-allocated values backing named variables,
/// addressed by `u32` slot numbers, with a free list for reuse.
#[derive(Debug, Default)]
pub(crate) struct Pool {
    slots: Vec<PoolSlot>,
    free: Vec<u32>,
}

impl Pool {
    fn alloc(&mut self, value: Value) -> u32 {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize].value = value;
            return idx;
        }
        let idx = u32::try_from(self.slots.len()).expect("object pool exceeds u32 slots");
        self.slots.push(PoolSlot { value });
        idx
    }

    pub(crate) fn get(&self, slot: u32) -> &Value {
        &self.slots[slot as usize].value
    }

    fn take(&mut self, slot: u32) -> Value {
        std::mem::take(&mut self.slots[slot as usize].value)
    }
}

/// In-flight cursor of one `foreach` loop.
///
/// The key snapshot is taken at `FOREACH_INIT`: entries inserted during the
/// loop are not visited, deleted entries are skipped when their turn comes.
#[derive(Debug)]
struct ForeachStep {
    map: HeapId,
    keys: Vec<MapKey>,
    pos: usize,
}

/// One in-flight function invocation (or the global scope).
#[derive(Debug, Default)]
pub(crate) struct Frame {
    /// The executing function; `None` for the global frame.
    func: Option<Rc<VmFunc>>,
    /// Variable name → pool slot.
    locals: AHashMap<Rc<str>, u32>,
    /// Pool slots of every passed argument, in call order.
    args: Vec<u32>,
    /// Slots allocated by this frame, recycled on unwind. Uplinked aliases
    /// and statics are deliberately absent.
    owned: Vec<u32>,
    /// Active foreach cursors, keyed by loop-site identity (the address of
    /// the loop's shared binding record).
    steps: AHashMap<usize, ForeachStep>,
}

/// Stable key of one foreach loop site.
fn foreach_key(bind: &Rc<ForeachBind>) -> usize {
    Rc::as_ptr(bind) as usize
}

/// Registered constant: a host expander or a deferred `const` expression.
pub(crate) enum ConstantEntry {
    Host(Rc<dyn Fn() -> Object>),
    Expr(Rc<Chunk>),
}

impl std::fmt::Debug for ConstantEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host(_) => f.write_str("ConstantEntry::Host"),
            Self::Expr(_) => f.write_str("ConstantEntry::Expr"),
        }
    }
}

/// Registered foreign function.
pub(crate) struct ForeignEntry {
    pub(crate) handler: Rc<dyn Fn(&mut CallContext<'_>) -> FnResult>,
}

/// Where script output goes.
enum OutputSink {
    Std(StdOutput),
    StdErr(StdErrOutput),
    Collect(CollectOutput),
    Null(NoOutput),
    Custom(Box<dyn OutputConsumer>),
}

impl OutputSink {
    fn write(&mut self, chunk: &[u8]) -> Result<(), crate::io::Abort> {
        match self {
            Self::Std(sink) => sink.consume(chunk),
            Self::StdErr(sink) => sink.consume(chunk),
            Self::Collect(sink) => sink.consume(chunk),
            Self::Null(sink) => sink.consume(chunk),
            Self::Custom(sink) => sink.consume(chunk),
        }
    }
}

/// A compiled program plus the state needed to run it.
pub struct Vm {
    file_name: String,
    main: Rc<Chunk>,
    pub(crate) literals: Vec<Value>,
    pub(crate) funcs: AHashMap<Rc<str>, Vec<Rc<VmFunc>>>,
    pub(crate) constants: AHashMap<String, ConstantEntry>,
    pub(crate) foreign: AHashMap<String, Rc<ForeignEntry>>,
    pub(crate) heap: Heap,
    pub(crate) pool: Pool,
    pub(crate) frames: Vec<Frame>,
    superglobals: AHashMap<String, u32>,
    output: OutputSink,
    err_sink: OutputSink,
    err_report: bool,
    output_len: u64,
    exit_status: i32,
    return_value: Value,
    depth: usize,
    max_depth: usize,
    pub(crate) rng: ChaCha8Rng,
    pub(crate) import_paths: Vec<String>,
    streams: Vec<Rc<dyn StreamDevice>>,
    pub(crate) included: AHashSet<String>,
    pub(crate) lambda_next: u32,
    /// Set when a foreign function triggered `die`/`exit` (e.g. inside an
    /// included file); the dispatcher converts it into a `Halt` unwind.
    pub(crate) pending_halt: bool,
    /// Set when the error consumer aborted; checked between instructions.
    aborted: bool,
    /// Optional per-instruction hook; absent by default so the dispatch loop
    /// pays a single branch.
    tracer: Option<Box<dyn ExecTracer>>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("file_name", &self.file_name)
            .field("functions", &self.funcs.len())
            .field("literals", &self.literals.len())
            .field("frames", &self.frames.len())
            .finish_non_exhaustive()
    }
}

impl Vm {
    /// Assembles a VM from compiler output and an engine configuration
    /// snapshot. Builtin functions and constants are installed here.
    pub(crate) fn assemble(file_name: String, out: compile::CompileOutput, config: &Config) -> Self {
        let mut vm = Self {
            file_name,
            main: Rc::new(out.main),
            literals: out.literals,
            funcs: AHashMap::new(),
            constants: AHashMap::new(),
            foreign: AHashMap::new(),
            heap: Heap::new(),
            pool: Pool::default(),
            frames: vec![Frame::default()],
            superglobals: AHashMap::new(),
            output: OutputSink::Std(StdOutput),
            err_sink: OutputSink::StdErr(StdErrOutput),
            err_report: config.error_reporting,
            output_len: 0,
            exit_status: 0,
            return_value: Value::Null,
            depth: 0,
            max_depth: config.max_recursion,
            rng: ChaCha8Rng::from_rng(rand::rngs::OsRng).expect("OS entropy available"),
            import_paths: config.import_paths.clone(),
            streams: vec![Rc::new(FileStream)],
            included: AHashSet::new(),
            lambda_next: out.lambda_next,
            pending_halt: false,
            aborted: false,
            tracer: None,
        };
        for func in out.funcs {
            vm.install_func(func);
        }
        for (name, chunk) in out.consts {
            vm.constants.insert(name.to_string(), ConstantEntry::Expr(Rc::new(chunk)));
        }
        vm.install_superglobals();
        builtins::install(&mut vm);
        vm.install_builtin_constants();
        vm
    }

    pub(crate) fn install_func(&mut self, func: VmFunc) {
        let name = Rc::clone(&func.name);
        self.funcs.entry(name).or_default().push(Rc::new(func));
    }

    fn install_superglobals(&mut self) {
        for name in SUPERGLOBALS {
            let id = self.heap.alloc(Map::new(true));
            let slot = self.pool.alloc(Value::Map(id));
            self.superglobals.insert(name.to_string(), slot);
        }
    }

    fn install_builtin_constants(&mut self) {
        self.register_constant("JX9_VERSION", || Object::Str(env!("CARGO_PKG_VERSION").to_string()));
        self.register_constant("JX9_OS", || Object::Str(std::env::consts::OS.to_string()));
        self.register_constant("INT_MAX", || Object::Int(i64::MAX));
        self.register_constant("INT_MIN", || Object::Int(i64::MIN));
        self.register_constant("PHP_EOL", || Object::Str("\n".to_string()));
    }

    // ----------------------------------------------------------------
    // Host configuration verbs
    // ----------------------------------------------------------------

    /// Routes script output into an internal buffer; retrieve it with
    /// [`Vm::take_output`].
    pub fn collect_output(&mut self) {
        self.output = OutputSink::Collect(CollectOutput::new());
    }

    /// Drains the internal output buffer, if collection is enabled.
    pub fn take_output(&mut self) -> Option<Vec<u8>> {
        match &mut self.output {
            OutputSink::Collect(sink) => Some(std::mem::take(sink).into_bytes()),
            _ => None,
        }
    }

    /// Installs a custom output consumer.
    pub fn set_output_consumer(&mut self, consumer: Box<dyn OutputConsumer>) {
        self.output = OutputSink::Custom(consumer);
    }

    /// Discards all script output.
    pub fn silence_output(&mut self) {
        self.output = OutputSink::Null(NoOutput);
    }

    /// Installs a custom error-report consumer (implies nothing about the
    /// reporting switch; see [`Vm::enable_error_reporting`]).
    pub fn set_error_consumer(&mut self, consumer: Box<dyn OutputConsumer>) {
        self.err_sink = OutputSink::Custom(consumer);
    }

    /// Collects error reports into an internal buffer; retrieve with
    /// [`Vm::take_error_output`].
    pub fn collect_errors(&mut self) {
        self.err_sink = OutputSink::Collect(CollectOutput::new());
    }

    /// Drains collected error reports.
    pub fn take_error_output(&mut self) -> Option<Vec<u8>> {
        match &mut self.err_sink {
            OutputSink::Collect(sink) => Some(std::mem::take(sink).into_bytes()),
            _ => None,
        }
    }

    /// Switches runtime error reporting on or off. Off by default: the VM is
    /// silent about recoverable trouble.
    pub fn enable_error_reporting(&mut self, on: bool) {
        self.err_report = on;
    }

    /// Installs a per-instruction tracer.
    pub fn set_tracer(&mut self, tracer: Box<dyn ExecTracer>) {
        self.tracer = Some(tracer);
    }

    /// Removes the tracer, returning it to the host.
    pub fn take_tracer(&mut self) -> Option<Box<dyn ExecTracer>> {
        self.tracer.take()
    }

    /// Sets the maximum function recursion depth.
    pub fn set_recursion_depth(&mut self, depth: usize) {
        self.max_depth = depth.max(1);
    }

    /// Appends a directory to the include/import search path.
    pub fn add_import_path(&mut self, path: impl Into<String>) {
        self.import_paths.push(path.into());
    }

    /// Registers an I/O stream device; scripts reach it through
    /// `scheme://path` arguments to `include`/`import`. A later registration
    /// shadows an earlier one with the same scheme.
    pub fn register_stream(&mut self, device: Rc<dyn StreamDevice>) {
        self.streams.push(device);
    }

    /// Most recently registered device answering to `scheme`.
    pub(crate) fn find_stream(&self, scheme: &str) -> Option<Rc<dyn StreamDevice>> {
        self.streams.iter().rev().find(|d| d.scheme() == scheme).cloned()
    }

    /// Registers a foreign function callable from scripts.
    pub fn register_function<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&mut CallContext<'_>) -> FnResult + 'static,
    {
        self.foreign.insert(
            name.into(),
            Rc::new(ForeignEntry {
                handler: Rc::new(handler),
            }),
        );
    }

    /// Registers a named constant; the expander runs each time compiled code
    /// references the name.
    pub fn register_constant<F>(&mut self, name: impl Into<String>, expander: F)
    where
        F: Fn() -> Object + 'static,
    {
        self.constants.insert(name.into(), ConstantEntry::Host(Rc::new(expander)));
    }

    /// Inserts one key/value pair into a named superglobal (e.g. `_GET`).
    pub fn superglobal_insert(&mut self, which: &str, key: &str, value: Object) {
        let Some(&slot) = self.superglobals.get(which) else {
            return;
        };
        let Value::Map(id) = *self.pool.get(slot) else {
            return;
        };
        let entry = self.object_to_value(&value);
        if let Some(old) = self.heap.get_mut(id).insert(MapKey::from_str_image(key), entry) {
            old.drop_with_heap(&mut self.heap);
        }
    }

    /// Appends one entry to `$argv`.
    pub fn argv_push(&mut self, arg: &str) {
        let Some(&slot) = self.superglobals.get("argv") else {
            return;
        };
        let Value::Map(id) = *self.pool.get(slot) else {
            return;
        };
        self.heap.get_mut(id).push(Value::Str(arg.to_string()));
    }

    /// Exit status recorded by `die`/`exit`; 0 otherwise.
    #[must_use]
    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }

    /// Total bytes fed to the output consumer so far.
    #[must_use]
    pub fn output_length(&self) -> u64 {
        self.output_len
    }

    /// Deep copy of the top-level return value, if the program produced one.
    #[must_use]
    pub fn return_object(&self) -> Option<Object> {
        if self.return_value.is_null() {
            return None;
        }
        Some(self.value_to_object(&self.return_value))
    }

    /// Renders the compiled program as a human-readable instruction listing:
    /// the top-level unit first, then every function in name order.
    #[must_use]
    pub fn dump_bytecode(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        dump_chunk(&mut out, "main", &self.main);
        let mut names: Vec<&Rc<str>> = self.funcs.keys().collect();
        names.sort();
        for name in names {
            for func in &self.funcs[name.as_ref()] {
                let header = format!("function {}({})", func.name, func.signature);
                dump_chunk(&mut out, &header, &func.body);
                for arg in &func.args {
                    if let Some(default) = &arg.default {
                        let _ = writeln!(out, "-- default ${}", arg.name);
                        dump_chunk(&mut out, &format!("{}:${}", func.name, arg.name), default);
                    }
                }
                for st in &func.statics {
                    dump_chunk(&mut out, &format!("{}::static ${}", func.name, st.name), &st.init);
                }
            }
        }
        out
    }

    /// Runs the compiled program from the top.
    pub fn exec(&mut self) -> ExecStatus {
        let main = Rc::clone(&self.main);
        let mut ret = Value::Null;
        let flow = self.exec_chunk(&main, &mut ret);
        let old = std::mem::replace(&mut self.return_value, ret);
        old.drop_with_heap(&mut self.heap);
        match flow {
            Flow::Done => ExecStatus::Done,
            Flow::Halt => ExecStatus::Halt(self.exit_status),
            Flow::Abort => ExecStatus::Aborted,
        }
    }

    /// Resets runtime state (variables, frames, heap, counters) while
    /// keeping the compiled program and every registration, so the same
    /// program can run again.
    pub fn reset(&mut self) {
        let ret = std::mem::take(&mut self.return_value);
        ret.drop_with_heap(&mut self.heap);
        self.frames = vec![Frame::default()];
        self.pool = Pool::default();
        self.heap.reset();
        self.output_len = 0;
        self.exit_status = 0;
        self.depth = 0;
        self.pending_halt = false;
        self.aborted = false;
        self.included.clear();
        for overloads in self.funcs.values() {
            for func in overloads {
                for st in &func.statics {
                    st.slot.set(STATIC_SLOT_UNSET);
                }
            }
        }
        self.superglobals.clear();
        self.install_superglobals();
    }

    // ----------------------------------------------------------------
    // Reporting and output
    // ----------------------------------------------------------------

    /// Emits one formatted report line when error reporting is enabled.
    pub(crate) fn report(&mut self, severity: Severity, func: Option<&str>, message: &str) {
        if !self.err_report {
            return;
        }
        let line = format_report(&self.file_name, severity, func, message);
        if self.err_sink.write(line.as_bytes()).is_err() {
            self.aborted = true;
        }
    }

    /// Feeds bytes to the output consumer, tracking the running total.
    pub(crate) fn output_write(&mut self, chunk: &[u8]) -> Result<(), crate::io::Abort> {
        self.output_len += chunk.len() as u64;
        self.output.write(chunk)
    }

    // ----------------------------------------------------------------
    // Variable resolution
    // ----------------------------------------------------------------

    /// Looks a name up: superglobal table first, then the current frame.
    /// With `create`, a missing name allocates a null pool slot in the
    /// current frame.
    pub(crate) fn resolve_var(&mut self, name: &str, create: bool) -> Option<u32> {
        if let Some(&slot) = self.superglobals.get(name) {
            return Some(slot);
        }
        let frame_idx = self.frames.len() - 1;
        self.resolve_in_frame(frame_idx, name, create)
    }

    fn resolve_in_frame(&mut self, frame_idx: usize, name: &str, create: bool) -> Option<u32> {
        if let Some(&slot) = self.frames[frame_idx].locals.get(name) {
            return Some(slot);
        }
        if !create {
            return None;
        }
        let slot = self.pool.alloc(Value::Null);
        let key: Rc<str> = name.into();
        self.frames[frame_idx].locals.insert(key, slot);
        self.frames[frame_idx].owned.push(slot);
        Some(slot)
    }

    /// Replaces a pool slot's value, releasing the previous one.
    pub(crate) fn pool_set(&mut self, slot: u32, value: Value) {
        let old = self.pool.take(slot);
        old.drop_with_heap(&mut self.heap);
        self.pool.slots[slot as usize].value = value;
    }

    fn pool_release(&mut self, slot: u32) {
        let old = self.pool.take(slot);
        old.drop_with_heap(&mut self.heap);
        self.pool.free.push(slot);
    }

    // ----------------------------------------------------------------
    // Conversions to and from the host-facing Object
    // ----------------------------------------------------------------

    pub(crate) fn object_to_value(&mut self, object: &Object) -> Value {
        match object {
            Object::Null => Value::Null,
            Object::Bool(b) => Value::Bool(*b),
            Object::Int(n) => Value::Int(*n),
            Object::Real(r) => Value::Real(*r),
            Object::Str(s) => Value::Str(s.clone()),
            Object::Resource(r) => Value::Resource(*r),
            Object::Array(items) => {
                let id = self.heap.alloc(Map::new(false));
                for item in items {
                    let v = self.object_to_value(item);
                    self.heap.get_mut(id).push(v);
                }
                Value::Map(id)
            }
            Object::Map(entries) => {
                let id = self.heap.alloc(Map::new(true));
                for (key, item) in entries {
                    let v = self.object_to_value(item);
                    if let Some(old) = self.heap.get_mut(id).insert(MapKey::from_str_image(key), v) {
                        old.drop_with_heap(&mut self.heap);
                    }
                }
                Value::Map(id)
            }
        }
    }

    pub(crate) fn value_to_object(&self, value: &Value) -> Object {
        self.value_to_object_depth(value, 0)
    }

    fn value_to_object_depth(&self, value: &Value, depth: usize) -> Object {
        if depth >= value::MAX_NESTING {
            return Object::Null;
        }
        match value {
            Value::Null => Object::Null,
            Value::Bool(b) => Object::Bool(*b),
            Value::Int(n) => Object::Int(*n),
            Value::Real(r) => Object::Real(*r),
            Value::Str(s) => Object::Str(s.clone()),
            Value::Resource(r) => Object::Resource(*r),
            Value::Map(id) => {
                let map = self.heap.get(*id);
                if map.is_json_object() {
                    let entries = map
                        .iter()
                        .map(|(k, v)| (k.image(), self.value_to_object_depth(v, depth + 1)))
                        .collect();
                    Object::Map(entries)
                } else {
                    let items = map.values().map(|v| self.value_to_object_depth(v, depth + 1)).collect();
                    Object::Array(items)
                }
            }
        }
    }

    // ----------------------------------------------------------------
    // Sub-execution (case guards, defaults, statics, constants)
    // ----------------------------------------------------------------

    /// Runs a nested bytecode container and returns its value; `Err` carries
    /// a halt/abort that must unwind the enclosing execution too.
    pub(crate) fn exec_sub(&mut self, chunk: &Chunk) -> Result<Value, Flow> {
        let mut ret = Value::Null;
        match self.exec_chunk(chunk, &mut ret) {
            Flow::Done => Ok(ret),
            other => {
                ret.drop_with_heap(&mut self.heap);
                Err(other)
            }
        }
    }

    // ----------------------------------------------------------------
    // The dispatcher
    // ----------------------------------------------------------------

    /// Executes one compilation unit on a fresh operand stack.
    pub(crate) fn exec_chunk(&mut self, chunk: &Chunk, result: &mut Value) -> Flow {
        let mut stack: Vec<Value> = Vec::with_capacity(chunk.len() + STACK_GUARD);
        let mut pc = 0usize;
        let flow = loop {
            if self.aborted {
                break Flow::Abort;
            }
            if pc >= chunk.len() {
                break Flow::Done;
            }
            let instr = chunk.get(pc);
            pc += 1;
            debug_assert!(
                stack.len() <= chunk.len() + STACK_GUARD,
                "operand stack exceeded its declared bound"
            );
            if self.tracer.is_some() {
                let frame_depth = self.frames.len();
                let stack_depth = stack.len();
                if let Some(tracer) = self.tracer.as_deref_mut() {
                    tracer.on_instruction(pc - 1, instr.op.into(), stack_depth, frame_depth);
                }
            }
            match instr.op {
                Opcode::Noop => {}
                Opcode::Done => {
                    if instr.p1 != 0 {
                        if let Some(value) = stack.pop() {
                            let old = std::mem::replace(result, value);
                            old.drop_with_heap(&mut self.heap);
                        }
                    }
                    break Flow::Done;
                }
                Opcode::Halt => {
                    if instr.p1 != 0 {
                        if let Some(value) = stack.pop() {
                            match &value {
                                Value::Str(msg) => {
                                    let bytes = msg.clone().into_bytes();
                                    let _ = self.output_write(&bytes);
                                    self.exit_status = 0;
                                }
                                other => {
                                    self.exit_status = i32::try_from(other.to_int(&self.heap)).unwrap_or(i32::MAX);
                                }
                            }
                            value.drop_with_heap(&mut self.heap);
                        }
                    }
                    break Flow::Halt;
                }
                Opcode::Jmp => pc = instr.p2 as usize,
                Opcode::Jz | Opcode::Jnz => {
                    let keep = instr.p1 != 0;
                    let truthy = stack.last().is_some_and(|v| v.to_bool(&self.heap));
                    let jump = (instr.op == Opcode::Jz) == !truthy;
                    if !keep {
                        if let Some(v) = stack.pop() {
                            v.drop_with_heap(&mut self.heap);
                        }
                    }
                    if jump {
                        pc = instr.p2 as usize;
                    }
                }
                Opcode::Pop => {
                    for _ in 0..instr.p1.max(0) {
                        if let Some(v) = stack.pop() {
                            v.drop_with_heap(&mut self.heap);
                        }
                    }
                }
                Opcode::Loadc => {
                    let value = self.load_literal(instr.p1, instr.p2);
                    match value {
                        Ok(v) => stack.push(v),
                        Err(flow) => break flow,
                    }
                }
                Opcode::Load => {
                    let P3::Name(name) = &instr.p3 else {
                        stack.push(Value::Null);
                        continue;
                    };
                    let name = Rc::clone(name);
                    let lookup_only = instr.p1 == 1;
                    let want_map = instr.p2 == 1;
                    let value = self.load_variable(&name, lookup_only, want_map);
                    stack.push(value);
                }
                Opcode::Store => {
                    let P3::Name(name) = &instr.p3 else { continue };
                    let name = Rc::clone(name);
                    let slot = self.resolve_var(&name, true).expect("create always yields a slot");
                    let value = stack
                        .last()
                        .map_or(Value::Null, |v| v.clone_with_heap(&mut self.heap));
                    self.pool_set(slot, value);
                }
                // Member access is index access with a string key; both
                // autovivify array-flagged maps on the write path (a later
                // string-key insertion promotes the child to object form).
                Opcode::LoadIdx | Opcode::Member => {
                    let create = instr.p2 == 1;
                    let key_v = stack.pop().unwrap_or_default();
                    let map_v = stack.pop().unwrap_or_default();
                    let value = self.load_index(&map_v, &key_v, create);
                    key_v.drop_with_heap(&mut self.heap);
                    map_v.drop_with_heap(&mut self.heap);
                    stack.push(value);
                }
                Opcode::StoreIdx => {
                    let has_key = instr.p1 != 0;
                    let key_v = if has_key { stack.pop().unwrap_or_default() } else { Value::Null };
                    let map_v = stack.pop().unwrap_or_default();
                    let value = stack
                        .last()
                        .map_or(Value::Null, |v| v.clone_with_heap(&mut self.heap));
                    if let Value::Map(id) = map_v {
                        if has_key {
                            let key = key_v.to_map_key(&self.heap);
                            if let Some(old) = self.heap.get_mut(id).insert(key, value) {
                                old.drop_with_heap(&mut self.heap);
                            }
                        } else {
                            self.heap.get_mut(id).push(value);
                        }
                    } else {
                        value.drop_with_heap(&mut self.heap);
                        self.report(Severity::Warning, None, "cannot use a scalar value as an array");
                    }
                    key_v.drop_with_heap(&mut self.heap);
                    map_v.drop_with_heap(&mut self.heap);
                }
                Opcode::LoadMap => {
                    let count = usize::try_from(instr.p1).unwrap_or(0).min(stack.len());
                    let object = instr.p2 == 1;
                    let values: Vec<Value> = stack.split_off(stack.len() - count);
                    let id = self.heap.alloc(Map::new(object));
                    if object {
                        let mut it = values.into_iter();
                        while let (Some(key_v), Some(value)) = (it.next(), it.next()) {
                            let key = key_v.to_map_key(&self.heap);
                            if let Some(old) = self.heap.get_mut(id).insert(key, value) {
                                old.drop_with_heap(&mut self.heap);
                            }
                            key_v.drop_with_heap(&mut self.heap);
                        }
                    } else {
                        for value in values {
                            self.heap.get_mut(id).push(value);
                        }
                    }
                    stack.push(Value::Map(id));
                }
                Opcode::CvtInt => {
                    if let Some(mut v) = stack.pop() {
                        v.cast_int(&mut self.heap);
                        stack.push(v);
                    }
                }
                Opcode::CvtReal => {
                    if let Some(mut v) = stack.pop() {
                        v.cast_real(&mut self.heap);
                        stack.push(v);
                    }
                }
                Opcode::CvtStr => {
                    if let Some(mut v) = stack.pop() {
                        v.cast_str(&mut self.heap);
                        stack.push(v);
                    }
                }
                Opcode::CvtBool => {
                    if let Some(mut v) = stack.pop() {
                        v.cast_bool(&mut self.heap);
                        stack.push(v);
                    }
                }
                Opcode::CvtNull => {
                    if let Some(mut v) = stack.pop() {
                        v.cast_null(&mut self.heap);
                        stack.push(v);
                    }
                }
                Opcode::CvtNumc => {
                    if let Some(mut v) = stack.pop() {
                        v.make_numeric(&mut self.heap);
                        stack.push(v);
                    }
                }
                Opcode::CvtArray => {
                    if let Some(mut v) = stack.pop() {
                        v.cast_map(&mut self.heap);
                        stack.push(v);
                    }
                }
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                    let rhs = stack.pop().unwrap_or_default();
                    let lhs = stack.pop().unwrap_or_default();
                    let value = self.arith(instr.op, lhs, rhs);
                    stack.push(value);
                }
                Opcode::AddStore
                | Opcode::SubStore
                | Opcode::MulStore
                | Opcode::DivStore
                | Opcode::ModStore
                | Opcode::CatStore
                | Opcode::ShlStore
                | Opcode::ShrStore
                | Opcode::BandStore
                | Opcode::BorStore
                | Opcode::BxorStore => {
                    self.compound_store(instr, &mut stack);
                }
                Opcode::Cat => {
                    let count = usize::try_from(instr.p1).unwrap_or(0).min(stack.len());
                    let values: Vec<Value> = stack.split_off(stack.len() - count);
                    let mut out = String::new();
                    for value in values {
                        out.push_str(&value.to_display(&self.heap));
                        value.drop_with_heap(&mut self.heap);
                    }
                    stack.push(Value::Str(out));
                }
                Opcode::Band | Opcode::Bor | Opcode::Bxor | Opcode::Shl | Opcode::Shr => {
                    let rhs = stack.pop().unwrap_or_default();
                    let lhs = stack.pop().unwrap_or_default();
                    let a = lhs.to_int(&self.heap);
                    let b = rhs.to_int(&self.heap);
                    lhs.drop_with_heap(&mut self.heap);
                    rhs.drop_with_heap(&mut self.heap);
                    stack.push(Value::Int(int_bitwise(instr.op, a, b)));
                }
                Opcode::Land | Opcode::Lor | Opcode::Lxor => {
                    let rhs = stack.pop().unwrap_or_default();
                    let lhs = stack.pop().unwrap_or_default();
                    let a = lhs.to_bool(&self.heap);
                    let b = rhs.to_bool(&self.heap);
                    lhs.drop_with_heap(&mut self.heap);
                    rhs.drop_with_heap(&mut self.heap);
                    let out = match instr.op {
                        Opcode::Land => a && b,
                        Opcode::Lor => a || b,
                        _ => a != b,
                    };
                    stack.push(Value::Bool(out));
                }
                Opcode::Lnot => {
                    let v = stack.pop().unwrap_or_default();
                    let out = !v.to_bool(&self.heap);
                    v.drop_with_heap(&mut self.heap);
                    stack.push(Value::Bool(out));
                }
                Opcode::BitNot => {
                    let v = stack.pop().unwrap_or_default();
                    let out = !v.to_int(&self.heap);
                    v.drop_with_heap(&mut self.heap);
                    stack.push(Value::Int(out));
                }
                Opcode::Uminus | Opcode::Uplus => {
                    let mut v = stack.pop().unwrap_or_default();
                    v.make_numeric(&mut self.heap);
                    if instr.op == Opcode::Uminus {
                        v = match v {
                            Value::Int(n) => Value::Int(n.wrapping_neg()),
                            Value::Real(r) => Value::Real(-r),
                            other => other,
                        };
                    }
                    stack.push(v);
                }
                Opcode::Incr | Opcode::Decr => {
                    if let Some(flow) = self.inc_dec(instr, &mut stack) {
                        break flow;
                    }
                }
                Opcode::Eq
                | Opcode::Neq
                | Opcode::Teq
                | Opcode::Tne
                | Opcode::Lt
                | Opcode::Le
                | Opcode::Gt
                | Opcode::Ge => {
                    let rhs = stack.pop().unwrap_or_default();
                    let lhs = stack.pop().unwrap_or_default();
                    let outcome = compare_outcome(instr.op, &lhs, &rhs, &self.heap);
                    lhs.drop_with_heap(&mut self.heap);
                    rhs.drop_with_heap(&mut self.heap);
                    if instr.p2 == 0 {
                        stack.push(Value::Bool(outcome));
                    } else if outcome {
                        pc = instr.p2 as usize;
                    }
                }
                Opcode::ForeachInit => {
                    let P3::Foreach(bind) = &instr.p3 else { continue };
                    let bind = Rc::clone(bind);
                    let subject = stack.pop().unwrap_or_default();
                    if let Value::Map(id) = subject {
                        // The step record owns the popped reference.
                        let keys = self.heap.get(id).key_snapshot();
                        let previous = self
                            .frames
                            .last_mut()
                            .expect("at least the global frame")
                            .steps
                            .insert(foreach_key(&bind), ForeachStep { map: id, keys, pos: 0 });
                        // A cursor abandoned by an earlier break at this
                        // loop site gives up its map reference now.
                        if let Some(previous) = previous {
                            self.heap.dec_ref(previous.map);
                        }
                    } else {
                        subject.drop_with_heap(&mut self.heap);
                        self.report(Severity::Warning, None, "invalid foreach target, expecting a JSON array or object");
                        pc = instr.p2 as usize;
                    }
                }
                Opcode::ForeachStep => {
                    let P3::Foreach(bind) = &instr.p3 else { continue };
                    let bind = Rc::clone(bind);
                    if let Some(exit) = self.foreach_step(&bind) {
                        if exit {
                            pc = instr.p2 as usize;
                        }
                    } else {
                        pc = instr.p2 as usize;
                    }
                }
                Opcode::Switch => {
                    let P3::Switch(table) = &instr.p3 else { continue };
                    let table = Rc::clone(table);
                    let subject = stack.pop().unwrap_or_default();
                    let mut target = table.default_target.unwrap_or(instr.p2);
                    let mut failed = None;
                    for case in &table.cases {
                        match self.exec_sub(&case.guard) {
                            Ok(guard_value) => {
                                let hit = value::loose_eq(&subject, &guard_value, &self.heap);
                                guard_value.drop_with_heap(&mut self.heap);
                                if hit {
                                    target = case.target;
                                    break;
                                }
                            }
                            Err(flow) => {
                                failed = Some(flow);
                                break;
                            }
                        }
                    }
                    subject.drop_with_heap(&mut self.heap);
                    if let Some(flow) = failed {
                        break flow;
                    }
                    pc = target as usize;
                }
                Opcode::Call => {
                    let argc = usize::try_from(instr.p1).unwrap_or(0).min(stack.len().saturating_sub(1));
                    let callee = stack.pop().unwrap_or_default();
                    let args: Vec<Value> = stack.split_off(stack.len() - argc);
                    match self.call(callee, args) {
                        Ok(value) => stack.push(value),
                        Err(flow) => break flow,
                    }
                }
                Opcode::Uplink => {
                    let count = usize::try_from(instr.p1).unwrap_or(0).min(stack.len());
                    let names: Vec<Value> = stack.split_off(stack.len() - count);
                    for name_v in names {
                        let name = name_v.to_display(&self.heap);
                        name_v.drop_with_heap(&mut self.heap);
                        self.uplink(&name);
                    }
                }
                Opcode::Consume => {
                    let count = usize::try_from(instr.p1).unwrap_or(0).min(stack.len());
                    let values: Vec<Value> = stack.split_off(stack.len() - count);
                    let mut abort = false;
                    for value in values {
                        let text = value.to_display(&self.heap);
                        value.drop_with_heap(&mut self.heap);
                        if self.output_write(text.as_bytes()).is_err() {
                            abort = true;
                        }
                    }
                    if abort {
                        break Flow::Abort;
                    }
                }
            }
            if self.pending_halt {
                self.pending_halt = false;
                break Flow::Halt;
            }
        };
        // The unit's operand stack is released whole on every exit path.
        for value in stack.drain(..) {
            value.drop_with_heap(&mut self.heap);
        }
        flow
    }

    // ----------------------------------------------------------------
    // Opcode helpers
    // ----------------------------------------------------------------

    /// `LOADC`: load a literal, expanding registered constants for bare
    /// identifiers (names of at most 64 bytes).
    fn load_literal(&mut self, p1: i32, idx: u32) -> Result<Value, Flow> {
        if p1 == 1 {
            let name = match self.literals.get(idx as usize) {
                Some(Value::Str(s)) if s.len() <= 64 => Some(s.clone()),
                _ => None,
            };
            if let Some(name) = name {
                match self.constants.get(&name) {
                    Some(ConstantEntry::Host(expander)) => {
                        let expander = Rc::clone(expander);
                        let object = expander();
                        return Ok(self.object_to_value(&object));
                    }
                    Some(ConstantEntry::Expr(chunk)) => {
                        let chunk = Rc::clone(chunk);
                        return self.exec_sub(&chunk);
                    }
                    None => {}
                }
            }
        }
        Ok(self
            .literals
            .get(idx as usize)
            .map_or(Value::Null, Value::clone_immediate))
    }

    /// `LOAD`: fetch (or create) a variable and push a shared copy.
    fn load_variable(&mut self, name: &str, lookup_only: bool, want_map: bool) -> Value {
        let Some(slot) = self.resolve_var(name, !lookup_only) else {
            return Value::Null;
        };
        if want_map {
            match *self.pool.get(slot) {
                Value::Map(_) => {}
                Value::Null => {
                    let id = self.heap.alloc(Map::new(false));
                    self.pool_set(slot, Value::Map(id));
                }
                _ => {
                    self.report(Severity::Warning, None, "cannot use a scalar value as an array");
                    let id = self.heap.alloc(Map::new(false));
                    return Value::Map(id);
                }
            }
        }
        self.pool.get(slot).clone_with_heap(&mut self.heap)
    }

    /// Shared logic of `LOAD_IDX` and `MEMBER`.
    ///
    /// On the read path a missing entry loads null (with a notice). On the
    /// create path missing entries autovivify as fresh shared maps so the
    /// rest of the store chain mutates in place.
    fn load_index(&mut self, map_v: &Value, key_v: &Value, create: bool) -> Value {
        let Value::Map(id) = map_v else {
            if create {
                self.report(Severity::Warning, None, "cannot use a scalar value as an array");
                let id = self.heap.alloc(Map::new(false));
                return Value::Map(id);
            }
            return Value::Null;
        };
        let key = key_v.to_map_key(&self.heap);
        let existing = match self.heap.get(*id).get(&key) {
            Some(Value::Map(child)) => Some(Value::Map(*child)),
            Some(other) => Some(other.clone_immediate()),
            None => None,
        };
        match existing {
            Some(Value::Map(child)) => {
                self.heap.inc_ref(child);
                Value::Map(child)
            }
            Some(scalar) => {
                if create {
                    self.report(Severity::Warning, None, "cannot use a scalar value as an array");
                    let fresh = self.heap.alloc(Map::new(false));
                    return Value::Map(fresh);
                }
                scalar
            }
            None => {
                if create {
                    let fresh = self.heap.alloc(Map::new(false));
                    self.heap.inc_ref(fresh);
                    if let Some(old) = self.heap.get_mut(*id).insert(key, Value::Map(fresh)) {
                        old.drop_with_heap(&mut self.heap);
                    }
                    return Value::Map(fresh);
                }
                self.report(
                    Severity::Notice,
                    None,
                    &format!("undefined index '{}'", key.image()),
                );
                Value::Null
            }
        }
    }

    fn arith(&mut self, op: Opcode, lhs: Value, rhs: Value) -> Value {
        match op {
            Opcode::Add => value::add(lhs, rhs, &mut self.heap),
            Opcode::Sub => value::sub(lhs, rhs, &mut self.heap),
            Opcode::Mul => value::mul(lhs, rhs, &mut self.heap),
            Opcode::Div => {
                let b = rhs.to_real(&self.heap);
                let a = lhs.to_real(&self.heap);
                lhs.drop_with_heap(&mut self.heap);
                rhs.drop_with_heap(&mut self.heap);
                if b == 0.0 {
                    self.report(Severity::Warning, None, "Division by zero");
                    Value::Int(0)
                } else {
                    value::demote_real(a / b)
                }
            }
            _ => {
                // Modulo: integer arithmetic only.
                let b = rhs.to_int(&self.heap);
                let a = lhs.to_int(&self.heap);
                lhs.drop_with_heap(&mut self.heap);
                rhs.drop_with_heap(&mut self.heap);
                if b == 0 {
                    self.report(Severity::Warning, None, "Division by zero");
                    Value::Int(0)
                } else {
                    Value::Int(a.wrapping_rem(b))
                }
            }
        }
    }

    /// The `*_STORE` family: rvalue first on the stack, then either a named
    /// target (`p2` = 0, name in `p3`) or a map entry (`p2` = 1, stack holds
    /// rvalue, map, key). Pushes the stored result.
    fn compound_store(&mut self, instr: &crate::bytecode::Instr, stack: &mut Vec<Value>) {
        let indexed = instr.p2 == 1;
        if indexed {
            let key_v = stack.pop().unwrap_or_default();
            let map_v = stack.pop().unwrap_or_default();
            let rvalue = stack.pop().unwrap_or_default();
            let key = key_v.to_map_key(&self.heap);
            key_v.drop_with_heap(&mut self.heap);
            if let Value::Map(id) = map_v {
                let current = match self.heap.get(id).get(&key) {
                    Some(Value::Map(child)) => {
                        let child = *child;
                        self.heap.inc_ref(child);
                        Value::Map(child)
                    }
                    Some(other) => other.clone_immediate(),
                    None => Value::Null,
                };
                let result = self.apply_store_op(instr.op, current, rvalue);
                let stored = result.clone_with_heap(&mut self.heap);
                if let Some(old) = self.heap.get_mut(id).insert(key, stored) {
                    old.drop_with_heap(&mut self.heap);
                }
                map_v.drop_with_heap(&mut self.heap);
                stack.push(result);
            } else {
                rvalue.drop_with_heap(&mut self.heap);
                map_v.drop_with_heap(&mut self.heap);
                self.report(Severity::Warning, None, "cannot use a scalar value as an array");
                stack.push(Value::Null);
            }
            return;
        }
        let P3::Name(name) = &instr.p3 else {
            return;
        };
        let name = Rc::clone(name);
        let rvalue = stack.pop().unwrap_or_default();
        let slot = self.resolve_var(&name, true).expect("create always yields a slot");
        let current = self.pool.get(slot).clone_with_heap(&mut self.heap);
        let result = self.apply_store_op(instr.op, current, rvalue);
        let stored = result.clone_with_heap(&mut self.heap);
        self.pool_set(slot, stored);
        stack.push(result);
    }

    fn apply_store_op(&mut self, op: Opcode, current: Value, rvalue: Value) -> Value {
        match op {
            Opcode::AddStore => value::add(current, rvalue, &mut self.heap),
            Opcode::SubStore => value::sub(current, rvalue, &mut self.heap),
            Opcode::MulStore => value::mul(current, rvalue, &mut self.heap),
            Opcode::DivStore => self.arith(Opcode::Div, current, rvalue),
            Opcode::ModStore => self.arith(Opcode::Mod, current, rvalue),
            Opcode::CatStore => {
                let mut out = current.to_display(&self.heap);
                out.push_str(&rvalue.to_display(&self.heap));
                current.drop_with_heap(&mut self.heap);
                rvalue.drop_with_heap(&mut self.heap);
                Value::Str(out)
            }
            _ => {
                let a = current.to_int(&self.heap);
                let b = rvalue.to_int(&self.heap);
                current.drop_with_heap(&mut self.heap);
                rvalue.drop_with_heap(&mut self.heap);
                let bitwise = match op {
                    Opcode::ShlStore => Opcode::Shl,
                    Opcode::ShrStore => Opcode::Shr,
                    Opcode::BandStore => Opcode::Band,
                    Opcode::BorStore => Opcode::Bor,
                    _ => Opcode::Bxor,
                };
                Value::Int(int_bitwise(bitwise, a, b))
            }
        }
    }

    /// `INCR`/`DECR` on named or indexed targets.
    fn inc_dec(&mut self, instr: &crate::bytecode::Instr, stack: &mut Vec<Value>) -> Option<Flow> {
        let post = instr.p1 != 0;
        let delta = if instr.op == Opcode::Incr { 1 } else { -1 };
        if instr.p2 == 1 {
            let key_v = stack.pop().unwrap_or_default();
            let map_v = stack.pop().unwrap_or_default();
            let key = key_v.to_map_key(&self.heap);
            key_v.drop_with_heap(&mut self.heap);
            if let Value::Map(id) = map_v {
                let mut current = match self.heap.get(id).get(&key) {
                    Some(v) => match v {
                        Value::Map(child) => {
                            let child = *child;
                            self.heap.inc_ref(child);
                            Value::Map(child)
                        }
                        other => other.clone_immediate(),
                    },
                    None => Value::Null,
                };
                current.make_numeric(&mut self.heap);
                let new = value::add(current.clone_with_heap(&mut self.heap), Value::Int(delta), &mut self.heap);
                let stored = new.clone_with_heap(&mut self.heap);
                if let Some(old) = self.heap.get_mut(id).insert(key, stored) {
                    old.drop_with_heap(&mut self.heap);
                }
                map_v.drop_with_heap(&mut self.heap);
                if post {
                    new.drop_with_heap(&mut self.heap);
                    stack.push(current);
                } else {
                    current.drop_with_heap(&mut self.heap);
                    stack.push(new);
                }
            } else {
                map_v.drop_with_heap(&mut self.heap);
                self.report(Severity::Warning, None, "cannot use a scalar value as an array");
                stack.push(Value::Null);
            }
            return None;
        }
        let P3::Name(name) = &instr.p3 else {
            return None;
        };
        let name = Rc::clone(name);
        let slot = self.resolve_var(&name, true).expect("create always yields a slot");
        let mut current = self.pool.get(slot).clone_with_heap(&mut self.heap);
        current.make_numeric(&mut self.heap);
        let new = value::add(current.clone_with_heap(&mut self.heap), Value::Int(delta), &mut self.heap);
        let stored = new.clone_with_heap(&mut self.heap);
        self.pool_set(slot, stored);
        if post {
            new.drop_with_heap(&mut self.heap);
            stack.push(current);
        } else {
            current.drop_with_heap(&mut self.heap);
            stack.push(new);
        }
        None
    }

    /// Advances one foreach cursor. Returns `None` when the cursor is gone
    /// (defensive), `Some(true)` when exhausted (jump to exit), and
    /// `Some(false)` after binding the next entry.
    fn foreach_step(&mut self, bind: &Rc<ForeachBind>) -> Option<bool> {
        let site = foreach_key(bind);
        loop {
            let frame = self.frames.last_mut().expect("at least the global frame");
            let step = frame.steps.get_mut(&site)?;
            if step.pos >= step.keys.len() {
                let step = frame.steps.remove(&site).expect("checked above");
                self.heap.dec_ref(step.map);
                return Some(true);
            }
            let key = step.keys[step.pos].clone();
            step.pos += 1;
            let map_id = step.map;
            // Deleted mid-loop: skip this key.
            let value = match self.heap.get(map_id).get(&key) {
                Some(Value::Map(child)) => {
                    let child = *child;
                    self.heap.inc_ref(child);
                    Value::Map(child)
                }
                Some(other) => other.clone_immediate(),
                None => continue,
            };
            let value_slot = self
                .resolve_var(&bind.value_var, true)
                .expect("create always yields a slot");
            self.pool_set(value_slot, value);
            if let Some(key_var) = &bind.key_var {
                let key_value = match &key {
                    MapKey::Int(n) => Value::Int(*n),
                    MapKey::Str(s) => Value::Str(s.to_string()),
                };
                let key_slot = self.resolve_var(key_var, true).expect("create always yields a slot");
                self.pool_set(key_slot, key_value);
            }
            return Some(false);
        }
    }

    /// `UPLINK`: alias a name in the current frame to the parent frame's
    /// variable, creating it there if absent. A no-op in the global frame.
    fn uplink(&mut self, name: &str) {
        if self.frames.len() < 2 {
            return;
        }
        let parent_idx = self.frames.len() - 2;
        let slot = self
            .resolve_in_frame(parent_idx, name, true)
            .expect("create always yields a slot");
        let key: Rc<str> = name.into();
        self.frames
            .last_mut()
            .expect("at least two frames")
            .locals
            .insert(key, slot);
    }

    // ----------------------------------------------------------------
    // Calls
    // ----------------------------------------------------------------

    /// `CALL`: resolve the callee (user functions first, with overload
    /// selection; then foreign functions), run it, return its result.
    fn call(&mut self, callee: Value, args: Vec<Value>) -> Result<Value, Flow> {
        let name = match &callee {
            Value::Str(s) => s.clone(),
            other => {
                let image = other.to_display(&self.heap);
                callee.drop_with_heap(&mut self.heap);
                self.drop_args(args);
                self.report(
                    Severity::Error,
                    None,
                    &format!("invalid function name '{image}'"),
                );
                return Ok(Value::Null);
            }
        };
        callee.drop_with_heap(&mut self.heap);
        if let Some(overloads) = self.funcs.get(name.as_str()) {
            let func = select_overload(overloads, &args);
            return self.call_user(func, args);
        }
        if let Some(entry) = self.foreign.get(name.as_str()) {
            let entry = Rc::clone(entry);
            return self.call_foreign(&name, &entry, args);
        }
        self.drop_args(args);
        self.report(
            Severity::Warning,
            None,
            &format!("calling an undefined function '{name}'"),
        );
        Ok(Value::Null)
    }

    fn drop_args(&mut self, args: Vec<Value>) {
        for arg in args {
            arg.drop_with_heap(&mut self.heap);
        }
    }

    fn call_user(&mut self, func: Rc<VmFunc>, args: Vec<Value>) -> Result<Value, Flow> {
        if self.depth >= self.max_depth {
            self.drop_args(args);
            let name = func.name.to_string();
            self.report(
                Severity::Error,
                Some(&name),
                "maximum function recursion depth reached",
            );
            return Ok(Value::Null);
        }
        let mut frame = Frame {
            func: Some(Rc::clone(&func)),
            ..Frame::default()
        };
        let mut args_iter = args.into_iter();
        let mut arg_slots: SmallVec<[u32; 8]> = SmallVec::new();
        for formal in &func.args {
            let mut passed = args_iter.next().unwrap_or(Value::Null);
            if passed.is_null() {
                if let Some(default) = &formal.default {
                    passed.drop_with_heap(&mut self.heap);
                    passed = match self.exec_sub(default) {
                        Ok(v) => v,
                        Err(flow) => {
                            for leftover in args_iter {
                                leftover.drop_with_heap(&mut self.heap);
                            }
                            self.release_binding_slots(&arg_slots);
                            return Err(flow);
                        }
                    };
                }
            }
            if let Some(hint) = formal.hint {
                apply_hint(&mut passed, hint, &mut self.heap);
            }
            let slot = self.pool.alloc(passed);
            frame.locals.insert(Rc::clone(&formal.name), slot);
            frame.owned.push(slot);
            frame.args.push(slot);
            arg_slots.push(slot);
        }
        // Extra positional arguments stay reachable under synthetic names.
        for (i, extra) in args_iter.enumerate() {
            let slot = self.pool.alloc(extra);
            let synthetic: Rc<str> = format!("[{}]apArg", func.args.len() + i).into();
            frame.locals.insert(synthetic, slot);
            frame.owned.push(slot);
            frame.args.push(slot);
        }
        self.frames.push(frame);
        // Install statics: allocate and initialize exactly once.
        for st in &func.statics {
            if st.slot.get() == STATIC_SLOT_UNSET {
                let slot = self.pool.alloc(Value::Null);
                st.slot.set(slot);
                match self.exec_sub(&st.init) {
                    Ok(v) => self.pool_set(slot, v),
                    Err(flow) => {
                        self.unwind_frame();
                        return Err(flow);
                    }
                }
            }
            let slot = st.slot.get();
            self.frames
                .last_mut()
                .expect("frame pushed above")
                .locals
                .insert(Rc::clone(&st.name), slot);
        }
        self.depth += 1;
        let mut ret = Value::Null;
        let flow = self.exec_chunk(&func.body, &mut ret);
        self.depth -= 1;
        self.unwind_frame();
        match flow {
            Flow::Done => Ok(ret),
            other => {
                ret.drop_with_heap(&mut self.heap);
                Err(other)
            }
        }
    }

    fn release_binding_slots(&mut self, slots: &[u32]) {
        for &slot in slots {
            self.pool_release(slot);
        }
    }

    /// Pops the current frame, recycling its owned slots and releasing any
    /// foreach cursors that were abandoned by `break`.
    fn unwind_frame(&mut self) {
        let frame = self.frames.pop().expect("unwind without a frame");
        for (_, step) in frame.steps {
            self.heap.dec_ref(step.map);
        }
        for slot in frame.owned {
            self.pool_release(slot);
        }
    }

    fn call_foreign(&mut self, name: &str, entry: &ForeignEntry, args: Vec<Value>) -> Result<Value, Flow> {
        let handler = Rc::clone(&entry.handler);
        let mut ctx = CallContext {
            vm: self,
            args,
            result: Value::Null,
            func_name: name.to_string(),
        };
        let rc = handler(&mut ctx);
        let result = std::mem::take(&mut ctx.result);
        let args = std::mem::take(&mut ctx.args);
        drop(ctx);
        self.drop_args(args);
        match rc {
            FnResult::Ok => Ok(result),
            FnResult::Abort => {
                result.drop_with_heap(&mut self.heap);
                Err(Flow::Abort)
            }
        }
    }

    /// Exit-status setter used by foreign paths (e.g. `die` inside an
    /// included file).
    pub(crate) fn set_exit_status(&mut self, status: i32) {
        self.exit_status = status;
    }

    // ----------------------------------------------------------------
    // Introspection helpers for the builtin library
    // ----------------------------------------------------------------

    /// Whether execution currently sits inside a user function frame.
    pub(crate) fn in_function_frame(&self) -> bool {
        self.frames.last().is_some_and(|f| f.func.is_some())
    }

    /// Number of arguments passed to the current function invocation.
    pub(crate) fn current_arg_count(&self) -> usize {
        self.frames.last().map_or(0, |f| f.args.len())
    }

    /// Copy of one argument of the current invocation.
    pub(crate) fn current_arg_value(&mut self, idx: usize) -> Option<Value> {
        let slot = *self.frames.last()?.args.get(idx)?;
        Some(self.pool.get(slot).clone_with_heap(&mut self.heap))
    }

    /// Creates/overwrites a variable in the current frame (used by
    /// `extract`).
    pub(crate) fn set_local_var(&mut self, name: &str, value: Value) {
        let slot = self.resolve_var(name, true).expect("create always yields a slot");
        self.pool_set(slot, value);
    }

    /// The backing map of a named superglobal.
    pub(crate) fn superglobal_map(&self, name: &str) -> Option<HeapId> {
        let slot = *self.superglobals.get(name)?;
        match self.pool.get(slot) {
            Value::Map(id) => Some(*id),
            _ => None,
        }
    }

    /// Whether `name` resolves to a user or foreign function.
    pub(crate) fn function_exists(&self, name: &str) -> bool {
        self.funcs.contains_key(name) || self.foreign.contains_key(name)
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // The arena is released in one step; nothing here needs the
        // reference counts to reach zero first.
        self.heap.reset();
    }
}

/// Applies a declared type hint when the provided value differs.
fn apply_hint(value: &mut Value, hint: crate::bytecode::TypeHint, heap: &mut Heap) {
    use crate::bytecode::TypeHint;
    match hint {
        TypeHint::Int => {
            if !matches!(value, Value::Int(_)) {
                value.cast_int(heap);
            }
        }
        TypeHint::Real => {
            if !matches!(value, Value::Real(_)) {
                value.cast_real(heap);
            }
        }
        TypeHint::Str => {
            if !matches!(value, Value::Str(_)) {
                value.cast_str(heap);
            }
        }
        TypeHint::Bool => {
            if !matches!(value, Value::Bool(_)) {
                value.cast_bool(heap);
            }
        }
    }
}

/// Picks the best overload: longest matching signature prefix against the
/// caller's argument types, unhinted positions matching anything; ties go to
/// the first declared.
fn select_overload(overloads: &[Rc<VmFunc>], args: &[Value]) -> Rc<VmFunc> {
    if overloads.len() == 1 {
        return Rc::clone(&overloads[0]);
    }
    let caller: Vec<u8> = args.iter().map(Value::sig_char).collect();
    let mut best = 0usize;
    let mut best_len = usize::MAX;
    for (idx, cand) in overloads.iter().enumerate() {
        let len = cand
            .signature
            .bytes()
            .zip(caller.iter())
            .take_while(|(hint, &got)| *hint == b'n' || *hint == got)
            .count();
        if best_len == usize::MAX || len > best_len {
            best = idx;
            best_len = len;
        }
    }
    Rc::clone(&overloads[best])
}

/// Evaluates a comparison opcode to its truth outcome.
fn compare_outcome(op: Opcode, lhs: &Value, rhs: &Value, heap: &Heap) -> bool {
    match op {
        Opcode::Eq => value::compare(lhs, rhs, false, heap) == 0,
        Opcode::Neq => value::compare(lhs, rhs, false, heap) != 0,
        Opcode::Teq => value::compare(lhs, rhs, true, heap) == 0,
        Opcode::Tne => value::compare(lhs, rhs, true, heap) != 0,
        Opcode::Lt => value::compare(lhs, rhs, false, heap) < 0,
        Opcode::Le => value::compare(lhs, rhs, false, heap) <= 0,
        Opcode::Gt => value::compare(lhs, rhs, false, heap) > 0,
        _ => value::compare(lhs, rhs, false, heap) >= 0,
    }
}

/// Writes one compilation unit's instruction listing.
fn dump_chunk(out: &mut String, title: &str, chunk: &Chunk) {
    use std::fmt::Write as _;

    let _ = writeln!(out, "==== {title} ====");
    for idx in 0..chunk.len() {
        let instr = chunk.get(idx);
        let mnemonic: &'static str = instr.op.into();
        let _ = write!(out, "{idx:04} {mnemonic:<12} {:>6} {:>6}", instr.p1, instr.p2);
        match &instr.p3 {
            P3::None => {}
            P3::Name(name) => {
                let _ = write!(out, "  ${name}");
            }
            P3::Foreach(bind) => {
                let _ = match &bind.key_var {
                    Some(key) => write!(out, "  foreach(${key}, ${})", bind.value_var),
                    None => write!(out, "  foreach(${})", bind.value_var),
                };
            }
            P3::Switch(table) => {
                let _ = write!(out, "  switch[{} cases]", table.cases.len());
            }
        }
        out.push('\n');
    }
}

/// Integer semantics of the bitwise/shift opcodes. Shift counts are masked
/// to the word size.
fn int_bitwise(op: Opcode, a: i64, b: i64) -> i64 {
    match op {
        Opcode::Band => a & b,
        Opcode::Bor => a | b,
        Opcode::Bxor => a ^ b,
        Opcode::Shl => a.wrapping_shl(u32::try_from(b & 63).expect("masked shift fits u32")),
        _ => a.wrapping_shr(u32::try_from(b & 63).expect("masked shift fits u32")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func_with_signature(signature: &str) -> Rc<VmFunc> {
        Rc::new(VmFunc {
            name: "probe".into(),
            args: Vec::new(),
            statics: Vec::new(),
            body: Chunk::new(),
            signature: signature.to_string(),
        })
    }

    #[test]
    fn overload_picks_longest_signature_prefix() {
        let candidates = vec![func_with_signature("i"), func_with_signature("s")];
        let picked = select_overload(&candidates, &[Value::Str("hi".to_string())]);
        assert_eq!(picked.signature, "s");
        let picked = select_overload(&candidates, &[Value::Int(5)]);
        assert_eq!(picked.signature, "i");
    }

    #[test]
    fn overload_ties_go_to_the_first_declared() {
        let candidates = vec![func_with_signature("n"), func_with_signature("i")];
        let picked = select_overload(&candidates, &[Value::Int(5)]);
        // Both match one position; declaration order wins.
        assert_eq!(picked.signature, "n");
    }

    #[test]
    fn pool_recycles_released_slots() {
        let mut pool = Pool::default();
        let a = pool.alloc(Value::Int(1));
        let b = pool.alloc(Value::Int(2));
        let _ = pool.take(a);
        pool.free.push(a);
        let c = pool.alloc(Value::Int(3));
        assert_eq!(c, a);
        assert_ne!(b, c);
    }

    #[test]
    fn bitwise_shift_masks_the_count() {
        assert_eq!(int_bitwise(Opcode::Shl, 1, 3), 8);
        assert_eq!(int_bitwise(Opcode::Shl, 1, 64), 1);
        assert_eq!(int_bitwise(Opcode::Shr, -8, 1), -4);
        assert_eq!(int_bitwise(Opcode::Band, 0b1100, 0b1010), 0b1000);
    }
}
