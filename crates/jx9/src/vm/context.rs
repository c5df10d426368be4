//! The foreign-function call context.
//!
//! A [`CallContext`] is borrowed for exactly one call: it exposes the
//! arguments, a result slot, direct output, and severity-tagged error
//! reporting. Values created through the context cannot outlive the call —
//! the borrow checker enforces what the original engine tracked with
//! per-call allocation lists.

use crate::{
    error::Severity,
    object::Object,
    value::{Value, ResourceId},
    vm::Vm,
};

/// Outcome of a foreign function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnResult {
    /// Normal return; the context's result (null unless set) is pushed.
    Ok,
    /// Unwind all frames and hand control back to the host.
    Abort,
}

/// Per-call view handed to foreign functions and builtins.
pub struct CallContext<'vm> {
    pub(crate) vm: &'vm mut Vm,
    pub(crate) args: Vec<Value>,
    pub(crate) result: Value,
    pub(crate) func_name: String,
}

impl CallContext<'_> {
    /// Number of arguments the script passed.
    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Name under which the function was invoked.
    #[must_use]
    pub fn function_name(&self) -> &str {
        &self.func_name
    }

    pub(crate) fn arg(&self, idx: usize) -> Option<&Value> {
        self.args.get(idx)
    }

    /// Argument coerced to an integer (0 when absent).
    #[must_use]
    pub fn arg_int(&self, idx: usize) -> i64 {
        self.args.get(idx).map_or(0, |v| v.to_int(&self.vm.heap))
    }

    /// Argument coerced to a real (0.0 when absent).
    #[must_use]
    pub fn arg_real(&self, idx: usize) -> f64 {
        self.args.get(idx).map_or(0.0, |v| v.to_real(&self.vm.heap))
    }

    /// Argument truth value (false when absent).
    #[must_use]
    pub fn arg_bool(&self, idx: usize) -> bool {
        self.args.get(idx).is_some_and(|v| v.to_bool(&self.vm.heap))
    }

    /// Argument string image (empty when absent). Maps serialize to JSON.
    #[must_use]
    pub fn arg_str(&self, idx: usize) -> String {
        self.args.get(idx).map_or_else(String::new, |v| v.to_display(&self.vm.heap))
    }

    /// Deep copy of an argument as a host-facing [`Object`].
    #[must_use]
    pub fn arg_object(&self, idx: usize) -> Option<Object> {
        self.args.get(idx).map(|v| self.vm.value_to_object(v))
    }

    /// Resource handle of an argument, when it is one.
    #[must_use]
    pub fn arg_resource(&self, idx: usize) -> Option<ResourceId> {
        match self.args.get(idx) {
            Some(Value::Resource(id)) => Some(*id),
            _ => None,
        }
    }

    /// Whether the argument is a hashmap.
    #[must_use]
    pub fn arg_is_map(&self, idx: usize) -> bool {
        self.args.get(idx).is_some_and(Value::is_map)
    }

    /// Type name of the argument (`"null"` when absent).
    #[must_use]
    pub fn arg_type_name(&self, idx: usize) -> &'static str {
        self.args.get(idx).map_or("null", |v| v.type_name(&self.vm.heap))
    }

    // ----------------------------------------------------------------
    // Result setters
    // ----------------------------------------------------------------

    pub(crate) fn set_result(&mut self, value: Value) {
        let old = std::mem::replace(&mut self.result, value);
        old.drop_with_heap(&mut self.vm.heap);
    }

    pub fn result_null(&mut self) {
        self.set_result(Value::Null);
    }

    pub fn result_bool(&mut self, value: bool) {
        self.set_result(Value::Bool(value));
    }

    pub fn result_int(&mut self, value: i64) {
        self.set_result(Value::Int(value));
    }

    pub fn result_real(&mut self, value: f64) {
        self.set_result(Value::Real(value));
    }

    pub fn result_string(&mut self, value: &str) {
        self.set_result(Value::Str(value.to_string()));
    }

    /// Appends to the current string result (installing one if needed).
    pub fn result_string_append(&mut self, chunk: &str) {
        if let Value::Str(s) = &mut self.result {
            s.push_str(chunk);
            return;
        }
        self.set_result(Value::Str(chunk.to_string()));
    }

    pub fn result_resource(&mut self, id: ResourceId) {
        self.set_result(Value::Resource(id));
    }

    /// Sets the result from a host-facing [`Object`] (deep copy).
    pub fn result_object(&mut self, object: &Object) {
        let value = self.vm.object_to_value(object);
        self.set_result(value);
    }

    // ----------------------------------------------------------------
    // Side channels
    // ----------------------------------------------------------------

    /// Writes bytes straight to the output consumer.
    pub fn output(&mut self, chunk: &[u8]) -> Result<(), crate::io::Abort> {
        self.vm.output_write(chunk)
    }

    /// Reports a severity-tagged diagnostic under this function's name.
    pub fn throw(&mut self, severity: Severity, message: &str) {
        let name = self.func_name.clone();
        self.vm.report(severity, Some(&name), message);
    }
}
