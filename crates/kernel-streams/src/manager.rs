use std::sync::Arc;

use crate::capture::{CaptureCallback, CapturingOutputStream, OutputConfig};
use crate::delegating::{DelegatingReader, DelegatingWriter};
use crate::stream::{
    InputStream, NoInput, OutputStream, ProcessStderr, ProcessStdout, SharedInput, SharedOutput,
};
use crate::substitution::{
    Finalizer, ScopeGuard, SubstitutionEngine, SubstitutionError, SubstitutionMode,
};

/// Owns the kernel's stdout, stderr and stdin roles.
///
/// All redirection of those streams goes through this instance. Execution
/// engines never see the engines directly; they get delegating handles that
/// follow whatever is installed for the calling thread.
#[derive(Debug, Clone)]
pub struct StreamSubstitutionManager {
    stdout: SubstitutionEngine<dyn OutputStream>,
    stderr: SubstitutionEngine<dyn OutputStream>,
    stdin: SubstitutionEngine<dyn InputStream>,
    output_config: OutputConfig,
}

/// Both output roles redirected into capturing streams. Dropping it
/// flushes the captured tails and restores the previous streams.
#[must_use = "capture ends when the scope is dropped"]
#[derive(Debug)]
pub struct CaptureScope {
    stdout: ScopeGuard<dyn OutputStream>,
    stderr: ScopeGuard<dyn OutputStream>,
}

impl CaptureScope {
    pub fn stdout(&self) -> &SharedOutput {
        self.stdout.stream()
    }

    pub fn stderr(&self) -> &SharedOutput {
        self.stderr.stream()
    }
}

fn close_output() -> Finalizer<dyn OutputStream> {
    Arc::new(|stream: &(dyn OutputStream + 'static)| stream.close())
}

fn close_input() -> Finalizer<dyn InputStream> {
    Arc::new(|stream: &(dyn InputStream + 'static)| stream.close())
}

impl StreamSubstitutionManager {
    /// Manager whose defaults are the real process streams and no stdin.
    pub fn new(mode: SubstitutionMode, output_config: OutputConfig) -> Self {
        Self::with_defaults(
            mode,
            output_config,
            Arc::new(ProcessStdout),
            Arc::new(ProcessStderr),
            Arc::new(NoInput),
        )
    }

    pub fn with_defaults(
        mode: SubstitutionMode,
        output_config: OutputConfig,
        stdout: SharedOutput,
        stderr: SharedOutput,
        stdin: SharedInput,
    ) -> Self {
        Self {
            stdout: SubstitutionEngine::new(mode, stdout, close_output()),
            stderr: SubstitutionEngine::new(mode, stderr, close_output()),
            stdin: SubstitutionEngine::new(mode, stdin, close_input()),
            output_config,
        }
    }

    pub fn mode(&self) -> SubstitutionMode {
        self.stdout.mode()
    }

    pub fn output_config(&self) -> &OutputConfig {
        &self.output_config
    }

    pub fn stdout(&self) -> DelegatingWriter {
        let engine = self.stdout.clone();
        DelegatingWriter::new(move || engine.current())
    }

    pub fn stderr(&self) -> DelegatingWriter {
        let engine = self.stderr.clone();
        DelegatingWriter::new(move || engine.current())
    }

    pub fn stdin(&self) -> DelegatingReader {
        let engine = self.stdin.clone();
        DelegatingReader::new(move || engine.current())
    }

    /// Redirect stdout and stderr into capturing streams until the returned
    /// scope is dropped. Each capturing stream tees into its role's default.
    pub fn enter_capture(
        &self,
        config: &OutputConfig,
        on_stdout: CaptureCallback,
        on_stderr: CaptureCallback,
    ) -> Result<CaptureScope, SubstitutionError> {
        let stdout = self.stdout.enter(|_| {
            Arc::new(CapturingOutputStream::new(
                "stdout",
                config.clone(),
                Some(self.stdout.default_stream()),
                on_stdout,
            ))
        })?;
        let stderr = self.stderr.enter(|_| {
            Arc::new(CapturingOutputStream::new(
                "stderr",
                config.clone(),
                Some(self.stderr.default_stream()),
                on_stderr,
            ))
        })?;
        Ok(CaptureScope { stdout, stderr })
    }

    /// Run `body` with both output roles captured.
    pub fn capture_output<R>(
        &self,
        config: &OutputConfig,
        on_stdout: CaptureCallback,
        on_stderr: CaptureCallback,
        body: impl FnOnce() -> R,
    ) -> Result<R, SubstitutionError> {
        let scope = self.enter_capture(config, on_stdout, on_stderr)?;
        let result = body();
        drop(scope);
        Ok(result)
    }

    /// Run `body` with `input` installed as stdin.
    pub fn with_input<R>(
        &self,
        input: SharedInput,
        body: impl FnOnce() -> R,
    ) -> Result<R, SubstitutionError> {
        self.stdin.with_substitution(|_| input, |_| body())
    }
}
