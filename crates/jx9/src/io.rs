//! Output consumers.
//!
//! Every byte a script produces (`print`, the `CONSUME` opcode, foreign
//! functions writing through their call context) is routed through a single
//! [`OutputConsumer`]. The same trait serves as the error-report sink when
//! error reporting is enabled.

use std::io::{self, Write as _};

/// Sentinel returned by a consumer to stop the running script.
///
/// When a consumer returns `Err(Abort)` the VM releases its operand stack,
/// unwinds all frames and returns control to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abort;

/// Trait for receiving script output.
///
/// Implement this to capture or redirect everything a script prints. The
/// stock implementations cover the common cases: [`StdOutput`] writes to
/// stdout, [`CollectOutput`] buffers into memory, [`NoOutput`] discards.
pub trait OutputConsumer {
    /// Called once per produced chunk, in bytecode order.
    ///
    /// Chunks are raw bytes: JX9 strings are byte buffers and are forwarded
    /// verbatim, without any encoding pass.
    fn consume(&mut self, chunk: &[u8]) -> Result<(), Abort>;
}

/// Default consumer that writes to the process stdout.
#[derive(Debug, Default)]
pub struct StdOutput;

impl OutputConsumer for StdOutput {
    fn consume(&mut self, chunk: &[u8]) -> Result<(), Abort> {
        let stdout = io::stdout();
        let mut lock = stdout.lock();
        if lock.write_all(chunk).and_then(|()| lock.flush()).is_err() {
            return Err(Abort);
        }
        Ok(())
    }
}

/// Consumer that writes to the process stderr. Used as the default error
/// sink once error reporting is switched on.
#[derive(Debug, Default)]
pub struct StdErrOutput;

impl OutputConsumer for StdErrOutput {
    fn consume(&mut self, chunk: &[u8]) -> Result<(), Abort> {
        if io::stderr().write_all(chunk).is_err() {
            return Err(Abort);
        }
        Ok(())
    }
}

/// Consumer that collects all output into a growable buffer.
#[derive(Debug, Default)]
pub struct CollectOutput(Vec<u8>);

impl CollectOutput {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Returns the collected bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the collector and returns the buffer.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl OutputConsumer for CollectOutput {
    fn consume(&mut self, chunk: &[u8]) -> Result<(), Abort> {
        self.0.extend_from_slice(chunk);
        Ok(())
    }
}

/// Consumer that ignores all output. Useful for benchmarks and tests that
/// only care about the return value.
#[derive(Debug, Default)]
pub struct NoOutput;

impl OutputConsumer for NoOutput {
    fn consume(&mut self, _chunk: &[u8]) -> Result<(), Abort> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_accumulates_in_order() {
        let mut sink = CollectOutput::new();
        sink.consume(b"a=").unwrap();
        sink.consume(b"1|").unwrap();
        assert_eq!(sink.as_bytes(), b"a=1|");
    }

    #[test]
    fn no_output_discards() {
        let mut sink = NoOutput;
        assert_eq!(sink.consume(b"whatever"), Ok(()));
    }
}
