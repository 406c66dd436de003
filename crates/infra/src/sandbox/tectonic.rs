//! Tectonic-in-Docker sandbox.
//!
//! Each compilation gets a fresh temporary workspace mounted into a
//! throw-away container with no capabilities, bounded memory/CPU/pids and a
//! unique name so it can be force-removed on timeout. The container runtime
//! is invoked directly with an argument vector, never through a shell.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    CompileOutput, CompileRequest, Sandbox, SandboxError, elapsed_ms, sanitize_filename,
    validate_source,
};

pub const DEFAULT_IMAGE: &str = "dxjoke/tectonic-docker:latest";

const CONTAINER_DIR: &str = "/tex";
const OUTPUT_DIR: &str = "output";
/// Grace period for draining pipes after the client process was killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    pub docker_bin: PathBuf,
    pub image: String,
    /// Parent directory of the per-job workspaces.
    pub work_root: PathBuf,
    pub network: String,
    pub memory: String,
    pub cpus: String,
    pub pids_limit: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            docker_bin: PathBuf::from("docker"),
            image: DEFAULT_IMAGE.to_string(),
            work_root: std::env::temp_dir().join("texforge"),
            network: "bridge".to_string(),
            memory: "1g".to_string(),
            cpus: "1.0".to_string(),
            pids_limit: 256,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TectonicSandbox {
    config: SandboxConfig,
}

/// Output of a finished compiler run.
struct RunOutput {
    artifact: Vec<u8>,
    stderr: String,
}

impl TectonicSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Arguments passed to the container runtime for one compilation.
    pub fn docker_args(&self, container: &str, workspace: &Path, filename: &str) -> Vec<OsString> {
        let mut mount = OsString::from(workspace.as_os_str());
        mount.push(":");
        mount.push(CONTAINER_DIR);

        let config = &self.config;
        let mut args: Vec<OsString> = Vec::with_capacity(28);
        let mut push = |arg: &str| args.push(OsString::from(arg));

        push("run");
        push("--rm");
        push("--name");
        push(container);
        push("--network");
        push(config.network.as_str());
        push("--memory");
        push(config.memory.as_str());
        push("--cpus");
        push(config.cpus.as_str());
        push("--pids-limit");
        push(config.pids_limit.to_string().as_str());
        push("--cap-drop");
        push("ALL");
        push("--security-opt");
        push("no-new-privileges");
        push("-v");
        args.push(mount);

        for arg in [
            "-w",
            CONTAINER_DIR,
            config.image.as_str(),
            "tectonic",
            "--outdir",
            OUTPUT_DIR,
        ] {
            args.push(OsString::from(arg));
        }
        args.push(OsString::from(format!("{filename}.tex")));
        args
    }

    async fn prepare_workspace(&self, filename: &str, source: &str) -> Result<TempDir, SandboxError> {
        tokio::fs::create_dir_all(&self.config.work_root)
            .await
            .map_err(SandboxError::Workspace)?;

        let workspace = tempfile::Builder::new()
            .prefix("latex-")
            .tempdir_in(&self.config.work_root)
            .map_err(SandboxError::Workspace)?;

        tokio::fs::write(workspace.path().join(format!("{filename}.tex")), source)
            .await
            .map_err(SandboxError::Workspace)?;
        tokio::fs::create_dir(workspace.path().join(OUTPUT_DIR))
            .await
            .map_err(SandboxError::Workspace)?;

        Ok(workspace)
    }

    async fn run(
        &self,
        workspace: &Path,
        filename: &str,
        timeout: Duration,
    ) -> Result<RunOutput, SandboxError> {
        let container = format!("texforge-{}", Uuid::now_v7().simple());

        let mut child = Command::new(&self.config.docker_bin)
            .args(self.docker_args(&container, workspace, filename))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SandboxError::Spawn)?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        debug!(container = %container, timeout_ms, "compiler started");

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status.map_err(SandboxError::Spawn)?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(container = %container, error = %e, "failed to kill compiler client");
                }
                self.remove_container(&container).await;
                let stderr = collect(stderr, DRAIN_GRACE).await;
                return Err(SandboxError::Timeout {
                    timeout_ms,
                    stderr: Some(stderr.trim().to_string()),
                });
            }
        };

        let stdout = collect(stdout, DRAIN_GRACE).await;
        let stderr = collect(stderr, DRAIN_GRACE).await;

        if !status.success() {
            let diagnostics = [stderr.trim(), stdout.trim()]
                .into_iter()
                .find(|s| !s.is_empty())
                .unwrap_or_default()
                .to_string();
            return Err(SandboxError::Exit {
                status: status.to_string(),
                diagnostics,
            });
        }

        let pdf = workspace.join(OUTPUT_DIR).join(format!("{filename}.pdf"));
        let artifact = match tokio::fs::read(&pdf).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SandboxError::MissingArtifact);
            }
            Err(e) => return Err(SandboxError::ReadArtifact(e)),
        };

        Ok(RunOutput { artifact, stderr })
    }

    async fn remove_container(&self, container: &str) {
        let result = Command::new(&self.config.docker_bin)
            .args(["rm", "-f", container])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) if status.success() => debug!(container, "timed-out container removed"),
            Ok(status) => warn!(container, %status, "container removal reported failure"),
            Err(e) => warn!(container, error = %e, "failed to remove timed-out container"),
        }
    }

    fn dispose(workspace: TempDir, keep: bool) {
        if keep {
            let path = workspace.keep();
            warn!(path = %path.display(), "keeping failed compilation workspace");
            return;
        }
        let path = workspace.path().to_path_buf();
        if let Err(e) = workspace.close() {
            warn!(path = %path.display(), error = %e, "failed to remove compilation workspace");
        }
    }
}

fn drain<R>(reader: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    reader.map(|mut reader| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf).await;
            buf
        })
    })
}

async fn collect(handle: Option<JoinHandle<Vec<u8>>>, grace: Duration) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}

#[async_trait]
impl Sandbox for TectonicSandbox {
    async fn compile(&self, request: CompileRequest) -> CompileOutput {
        let started = Instant::now();

        if let Err(e) = validate_source(&request.source).map_err(SandboxError::from) {
            debug!(error = %e, "source rejected before compilation");
            return CompileOutput::failure(e.to_string(), elapsed_ms(started));
        }

        let filename = sanitize_filename(&request.base_filename);
        let workspace = match self.prepare_workspace(&filename, &request.source).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "could not prepare compilation workspace");
                return CompileOutput::failure(e.to_string(), elapsed_ms(started));
            }
        };

        let result = self
            .run(workspace.path(), &filename, request.options.timeout)
            .await;
        let duration_ms = elapsed_ms(started);

        match result {
            Ok(run) => {
                Self::dispose(workspace, false);
                let warnings = Some(run.stderr.trim().to_string()).filter(|w| !w.is_empty());
                info!(
                    file = %filename,
                    duration_ms,
                    artifact_bytes = run.artifact.len(),
                    "compilation succeeded"
                );
                CompileOutput::Success {
                    artifact: run.artifact,
                    warnings,
                    duration_ms,
                }
            }
            Err(e) => {
                Self::dispose(workspace, !request.options.cleanup_on_error);
                info!(file = %filename, duration_ms, error = %e, "compilation failed");
                CompileOutput::failure(e.to_string(), duration_ms)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::CompileOptions;

    fn sandbox_in(root: &Path) -> TectonicSandbox {
        TectonicSandbox::new(SandboxConfig {
            docker_bin: PathBuf::from("/nonexistent/texforge-docker"),
            work_root: root.join("work"),
            ..SandboxConfig::default()
        })
    }

    #[test]
    fn docker_args_are_locked_down() {
        let sandbox = TectonicSandbox::default();
        let args: Vec<String> = sandbox
            .docker_args("texforge-1", Path::new("/tmp/ws"), "thesis")
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();

        let joined = args.join(" ");
        assert!(joined.starts_with("run --rm --name texforge-1 --network bridge"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("--security-opt no-new-privileges"));
        assert!(joined.contains("--pids-limit 256"));
        assert!(joined.contains("-v /tmp/ws:/tex -w /tex"));
        assert!(joined.ends_with(&format!("{DEFAULT_IMAGE} tectonic --outdir output thesis.tex")));
    }

    #[tokio::test]
    async fn invalid_source_touches_nothing() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(root.path());

        for source in ["", "no preamble", "\\documentclass{a}\\begin{document}{\\end{document}"] {
            let output = sandbox.compile(CompileRequest::new(source, "doc")).await;
            assert!(!output.is_success());
        }

        assert!(!root.path().join("work").exists());
    }

    #[tokio::test]
    async fn spawn_failure_cleans_workspace() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(root.path());
        let source = "\\documentclass{article}\\begin{document}x\\end{document}";

        let output = sandbox.compile(CompileRequest::new(source, "doc")).await;
        match output {
            CompileOutput::Failure { error, .. } => {
                assert!(error.starts_with("failed to start compiler"), "{error}")
            }
            other => panic!("unexpected output: {other:?}"),
        }

        let leftovers = std::fs::read_dir(root.path().join("work")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn failed_workspace_is_kept_on_request() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(root.path());
        let source = "\\documentclass{article}\\begin{document}x\\end{document}";

        let request = CompileRequest::new(source, "../kept")
            .with_options(CompileOptions::default().with_cleanup_on_error(false));
        assert!(!sandbox.compile(request).await.is_success());

        let kept: Vec<PathBuf> = std::fs::read_dir(root.path().join("work"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(kept.len(), 1);
        assert!(kept[0].join("kept.tex").exists());
    }

    /// Stand-in for the container runtime: answers `rm` by logging the
    /// container name, and otherwise runs `body` with `$ws` set to the
    /// mounted workspace and `$file` to the source file name.
    #[cfg(unix)]
    fn scripted_runtime(root: &Path, body: &str) -> TectonicSandbox {
        use std::os::unix::fs::PermissionsExt;

        let script = root.join("fake-docker");
        let removed_log = root.join("removed.log");
        let text = format!(
            "#!/bin/sh\n\
             if [ \"$1\" = rm ]; then echo \"$3\" >> '{log}'; exit 0; fi\n\
             while [ $# -gt 1 ]; do\n\
             case \"$1\" in -v) ws=\"${{2%:/tex}}\"; shift;; esac\n\
             shift\n\
             done\n\
             file=\"$1\"\n\
             {body}\n",
            log = removed_log.display(),
        );
        std::fs::write(&script, text).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        TectonicSandbox::new(SandboxConfig {
            docker_bin: script,
            work_root: root.join("work"),
            ..SandboxConfig::default()
        })
    }

    #[cfg(unix)]
    async fn compile_with(root: &Path, body: &str, timeout: Duration) -> CompileOutput {
        let source = "\\documentclass{article}\\begin{document}x\\end{document}";
        let request = CompileRequest::new(source, "thesis")
            .with_options(CompileOptions::default().with_timeout(timeout));
        scripted_runtime(root, body).compile(request).await
    }

    #[cfg(unix)]
    fn workspaces_left(root: &Path) -> usize {
        std::fs::read_dir(root.join("work")).unwrap().count()
    }

    #[cfg(unix)]
    fn failure_text(output: CompileOutput) -> String {
        match output {
            CompileOutput::Failure { error, .. } => error,
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn success_returns_pdf_and_warnings() {
        let root = tempfile::tempdir().unwrap();
        let body = "printf '%%PDF-1.5 fake' > \"$ws/output/${file%.tex}.pdf\"\n\
                    echo '  Overfull hbox in paragraph  ' >&2\n\
                    exit 0";

        let output = compile_with(root.path(), body, Duration::from_secs(10)).await;
        match output {
            CompileOutput::Success {
                artifact, warnings, ..
            } => {
                assert_eq!(artifact, b"%PDF-1.5 fake");
                assert_eq!(warnings.as_deref(), Some("Overfull hbox in paragraph"));
            }
            other => panic!("unexpected output: {other:?}"),
        }
        assert_eq!(workspaces_left(root.path()), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_reports_stderr_then_stdout_then_status() {
        let cases = [
            ("echo '! Undefined control sequence.' >&2; echo noise; exit 1", "! Undefined control sequence."),
            ("echo 'only stdout'; exit 2", "only stdout"),
            ("exit 3", "compiler exited with exit status: 3"),
        ];

        for (body, expected) in cases {
            let root = tempfile::tempdir().unwrap();
            let output = compile_with(root.path(), body, Duration::from_secs(10)).await;
            assert_eq!(failure_text(output), expected);
            assert_eq!(workspaces_left(root.path()), 0, "{body}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clean_exit_without_pdf_is_a_failure() {
        let root = tempfile::tempdir().unwrap();
        let output = compile_with(root.path(), "exit 0", Duration::from_secs(10)).await;

        assert_eq!(failure_text(output), "compiler produced no output artifact");
        assert_eq!(workspaces_left(root.path()), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_run_and_removes_container() {
        let root = tempfile::tempdir().unwrap();
        let output = compile_with(root.path(), "exec sleep 5", Duration::from_millis(100)).await;

        assert_eq!(failure_text(output), "compilation timed out after 100 ms");
        assert_eq!(workspaces_left(root.path()), 0);

        let removed = std::fs::read_to_string(root.path().join("removed.log")).unwrap();
        assert!(removed.trim().starts_with("texforge-"), "{removed}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_prefers_captured_stderr() {
        let root = tempfile::tempdir().unwrap();
        let body = "echo 'stuck on page 3' >&2\nexec sleep 5";
        let output = compile_with(root.path(), body, Duration::from_millis(200)).await;

        assert_eq!(failure_text(output), "stuck on page 3");
        assert_eq!(workspaces_left(root.path()), 0);
    }
}
