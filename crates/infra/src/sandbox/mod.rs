//! Compiler sandbox: turns LaTeX source into PDF bytes in an isolated,
//! disposable workspace.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub mod tectonic;
pub mod validate;

pub use tectonic::{SandboxConfig, TectonicSandbox};
pub use validate::{ValidationError, sanitize_filename, validate_source};

pub const DEFAULT_COMPILE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    pub timeout: Duration,
    /// Remove the workspace when compilation fails. Successful runs always
    /// clean up.
    pub cleanup_on_error: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_COMPILE_TIMEOUT,
            cleanup_on_error: true,
        }
    }
}

impl CompileOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cleanup_on_error(mut self, cleanup: bool) -> Self {
        self.cleanup_on_error = cleanup;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub source: String,
    pub base_filename: String,
    pub options: CompileOptions,
}

impl CompileRequest {
    pub fn new(source: impl Into<String>, base_filename: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            base_filename: base_filename.into(),
            options: CompileOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutput {
    Success {
        artifact: Vec<u8>,
        warnings: Option<String>,
        duration_ms: u64,
    },
    Failure {
        error: String,
        duration_ms: u64,
    },
}

impl CompileOutput {
    pub fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        CompileOutput::Failure {
            error: error.into(),
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CompileOutput::Success { .. })
    }

    pub fn duration_ms(&self) -> u64 {
        match self {
            CompileOutput::Success { duration_ms, .. } | CompileOutput::Failure { duration_ms, .. } => {
                *duration_ms
            }
        }
    }
}

/// Errors raised inside a compilation run. They never escape
/// [`Sandbox::compile`]; each is rendered into a [`CompileOutput::Failure`].
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("failed to prepare workspace: {0}")]
    Workspace(#[source] std::io::Error),
    #[error("failed to start compiler: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("{}", timeout_message(.timeout_ms, .stderr))]
    Timeout {
        timeout_ms: u64,
        stderr: Option<String>,
    },
    #[error("{}", exit_message(.status, .diagnostics))]
    Exit { status: String, diagnostics: String },
    #[error("compiler produced no output artifact")]
    MissingArtifact,
    #[error("failed to read generated PDF: {0}")]
    ReadArtifact(#[source] std::io::Error),
}

fn timeout_message(timeout_ms: &u64, stderr: &Option<String>) -> String {
    match stderr.as_deref() {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => format!("compilation timed out after {timeout_ms} ms"),
    }
}

fn exit_message(status: &str, diagnostics: &str) -> String {
    if diagnostics.is_empty() {
        format!("compiler exited with {status}")
    } else {
        diagnostics.to_string()
    }
}

pub fn elapsed_ms(started: std::time::Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Compile one document. Never fails: every problem is reported through
    /// [`CompileOutput::Failure`].
    async fn compile(&self, request: CompileRequest) -> CompileOutput;
}

#[async_trait]
impl<T: Sandbox + ?Sized> Sandbox for Arc<T> {
    async fn compile(&self, request: CompileRequest) -> CompileOutput {
        (**self).compile(request).await
    }
}
