use crate::InferenceServer;
use async_trait::async_trait;
use llamarelay_common::{Error, ProcessState, Result, ServerStatus};
use llamarelay_config::ModelProfile;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const KILL_TIMEOUT: Duration = Duration::from_secs(2);
const READY_FUNCTION: &str = "server_cli";
const READY_MESSAGE: &str = "HTTP server listening";

/// Owns the inference server subprocess and its lifecycle state.
///
/// State transitions happen only here; everyone else reads them through
/// [`ProcessSupervisor::state`] or waits on them with
/// [`ProcessSupervisor::wait_until_ready`].
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    profile: RwLock<ModelProfile>,
    status: watch::Sender<ServerStatus>,
    child: Mutex<Option<Child>>,
    stop_timeout: Duration,
}

/// One status record from the server's stdout
#[derive(Debug, Deserialize)]
struct StatusRecord {
    #[serde(default)]
    function: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    port: Option<serde_json::Value>,
}

impl StatusRecord {
    fn listening_address(&self) -> Option<String> {
        if self.function.as_deref() != Some(READY_FUNCTION)
            || self.msg.as_deref() != Some(READY_MESSAGE)
        {
            return None;
        }
        let hostname = self.hostname.as_deref()?;
        let port = match self.port.as_ref()? {
            serde_json::Value::Number(port) => port.to_string(),
            serde_json::Value::String(port) => port.clone(),
            _ => return None,
        };
        Some(format!("http://{}:{}", hostname, port))
    }
}

/// Address announced by a ready record, or `None` for any other line
pub fn parse_ready_event(line: &str) -> Option<String> {
    serde_json::from_str::<StatusRecord>(line.trim())
        .ok()?
        .listening_address()
}

/// Program and arguments for a profile. The launcher, when set, runs the
/// executable; neither is ever turned into a flag.
pub fn launch_command(profile: &ModelProfile) -> (PathBuf, Vec<String>) {
    let flags = profile.command_args();
    match &profile.launcher {
        Some(launcher) => {
            let mut args = vec![profile.executable.display().to_string()];
            args.extend(flags);
            (launcher.clone(), args)
        }
        None => (profile.executable.clone(), flags),
    }
}

/// Shell-quoted rendering of a command line, for logs
pub fn render_command(program: &Path, args: &[String]) -> String {
    std::iter::once(program.display().to_string())
        .chain(args.iter().cloned())
        .map(|arg| shell_quote(&arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\"'\"'"))
    }
}

impl ProcessSupervisor {
    pub fn new(profile: ModelProfile, stop_timeout: Duration) -> Self {
        let (status, _) = watch::channel(ServerStatus::stopped());
        Self {
            inner: Arc::new(SupervisorInner {
                profile: RwLock::new(profile),
                status,
                child: Mutex::new(None),
                stop_timeout,
            }),
        }
    }

    /// Current state and bound address. Never blocks.
    pub fn state(&self) -> ServerStatus {
        self.inner.status.borrow().clone()
    }

    /// Profile used for the next start
    pub async fn profile(&self) -> ModelProfile {
        self.inner.profile.read().await.clone()
    }

    /// Replace the launch profile. A running server keeps its current
    /// arguments until it is restarted.
    pub async fn set_profile(&self, profile: ModelProfile) {
        *self.inner.profile.write().await = profile;
    }

    /// Spawn the server unless it is already starting or running
    pub async fn start(&self) -> Result<ServerStatus> {
        if self.state().state == ProcessState::Stopping {
            debug!("Stop in progress, waiting before start");
            self.wait_for_stopped(self.inner.stop_timeout + KILL_TIMEOUT).await;
        }

        let mut run_id = 0;
        let claimed = self.inner.status.send_if_modified(|status| {
            if status.state != ProcessState::Stopped {
                return false;
            }
            run_id = status.run_id + 1;
            *status = ServerStatus {
                state: ProcessState::Starting,
                address: None,
                run_id,
            };
            true
        });

        if !claimed {
            let status = self.state();
            debug!(state = %status.state, "Start requested while not stopped, ignoring");
            return Ok(status);
        }

        let profile = self.profile().await;
        if let Err(e) = self.spawn(&profile, run_id).await {
            error!(run_id, "Failed to start the inference server: {}", e);
            self.inner.status.send_if_modified(|status| {
                if status.run_id == run_id && status.state == ProcessState::Starting {
                    status.state = ProcessState::Stopped;
                    true
                } else {
                    false
                }
            });
            return Err(e);
        }

        Ok(self.state())
    }

    async fn spawn(&self, profile: &ModelProfile, run_id: u64) -> Result<()> {
        profile.validate_executable()?;

        let (program, args) = launch_command(profile);
        info!(run_id, model = %profile.name, "Starting inference server: {}", render_command(&program, &args));

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true); // Ensure process is killed if handle is dropped

        // Held across the spawn so a concurrent stop sees the child
        let mut slot = self.inner.child.lock().await;

        let mut child = command
            .spawn()
            .map_err(|e| Error::SpawnFailure(format!("{}: {}", program.display(), e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::SpawnFailure("server stdout was not captured".into()))?;

        // Drain stderr to prevent blocking
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(run_id, "server stderr: {}", line);
                }
            });
        }

        *slot = Some(child);
        drop(slot);

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.monitor(stdout, run_id).await;
        });

        Ok(())
    }

    /// Read the server's stdout until it closes, promoting the run to
    /// Running on the first ready record.
    async fn monitor(self, stdout: ChildStdout, run_id: u64) {
        let mut lines = BufReader::new(stdout).lines();

        let reason = loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.handle_output_line(&line, run_id),
                Ok(None) => break "output stream closed".to_string(),
                Err(e) => break format!("failed to read server output: {}", e),
            }
        };

        let status = self.state();
        if status.run_id != run_id
            || matches!(status.state, ProcessState::Stopped | ProcessState::Stopping)
        {
            debug!(run_id, "Server output closed after shutdown");
            return;
        }

        let crash = Error::ProcessCrash(reason);
        if status.state == ProcessState::Starting {
            error!(run_id, "Inference server exited before it was ready: {}", crash);
        } else {
            error!(run_id, "Inference server exited while running: {}", crash);
        }

        if let Err(e) = self.stop().await {
            error!(run_id, "Failed to reap crashed server: {}", e);
        }
    }

    fn handle_output_line(&self, line: &str, run_id: u64) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        debug!(run_id, "server stdout: {}", line);

        match serde_json::from_str::<StatusRecord>(line) {
            Ok(record) => {
                if let Some(address) = record.listening_address() {
                    self.mark_ready(address, run_id);
                }
            }
            Err(e) => {
                debug!(run_id, "Ignoring non-status output line: {}", e);
            }
        }
    }

    fn mark_ready(&self, address: String, run_id: u64) {
        let promoted = self.inner.status.send_if_modified(|status| {
            if status.run_id != run_id || status.state != ProcessState::Starting {
                return false;
            }
            status.state = ProcessState::Running;
            status.address = Some(address.clone());
            true
        });

        if promoted {
            info!(run_id, %address, "Inference server is ready");
        } else {
            debug!(run_id, %address, "Ignoring repeated ready event");
        }
    }

    /// Terminate the server. Always ends in Stopped once the bounded wait
    /// completes, whatever the exit code.
    pub async fn stop(&self) -> Result<ServerStatus> {
        let claimed = self.inner.status.send_if_modified(|status| match status.state {
            ProcessState::Starting | ProcessState::Running => {
                status.state = ProcessState::Stopping;
                true
            }
            ProcessState::Stopped | ProcessState::Stopping => false,
        });

        if !claimed {
            if self.state().state == ProcessState::Stopping {
                debug!("Stop already in progress, waiting for it");
                self.wait_for_stopped(self.inner.stop_timeout + KILL_TIMEOUT).await;
            } else {
                debug!("Inference server is not running");
            }
            return Ok(self.state());
        }

        let child = self.inner.child.lock().await.take();
        if let Some(child) = child {
            self.terminate(child).await;
        }

        self.inner.status.send_modify(|status| {
            status.state = ProcessState::Stopped;
            status.address = None;
        });
        info!("Inference server stopped");

        Ok(self.state())
    }

    /// Gracefully terminate the process, killing it if it overstays
    async fn terminate(&self, mut child: Child) {
        // First try SIGTERM for graceful shutdown
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

                match timeout(self.inner.stop_timeout, child.wait()).await {
                    Ok(Ok(status)) => {
                        info!("Inference server exited with status: {:?}", status);
                        return;
                    }
                    Ok(Err(e)) => {
                        warn!("Error waiting for inference server: {}", e);
                    }
                    Err(_) => {
                        warn!("Inference server didn't exit gracefully, forcing kill");
                    }
                }
            }
        }

        // Forceful kill if graceful didn't work
        if let Err(e) = child.kill().await {
            warn!("Failed to kill inference server: {}", e);
        }

        match timeout(KILL_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                info!("Inference server killed with status: {:?}", status);
            }
            Ok(Err(e)) => {
                error!("Error waiting for inference server to exit: {}", e);
            }
            Err(_) => {
                error!("Timeout waiting for inference server to exit after kill");
            }
        }
    }

    async fn wait_for_stopped(&self, limit: Duration) {
        let mut rx = self.inner.status.subscribe();
        let stopped = rx.wait_for(|status| status.state == ProcessState::Stopped);
        if timeout(limit, stopped).await.is_err() {
            warn!("Timed out waiting for the inference server to stop");
        }
    }

    /// Suspend until the server is Running and return its address. Fails
    /// with `NotReady` when the wait elapses or the latest run is Stopped.
    /// Before the first run, a Stopped server is waited on.
    pub async fn wait_until_ready(&self, limit: Duration) -> Result<String> {
        let mut rx = self.inner.status.subscribe();

        let wait = async move {
            let mut saw_start = rx.borrow().run_id > 0;
            loop {
                {
                    let status = rx.borrow_and_update();
                    match status.state {
                        ProcessState::Running => {
                            if let Some(address) = &status.address {
                                return Ok(address.clone());
                            }
                        }
                        ProcessState::Starting => saw_start = true,
                        ProcessState::Stopped if saw_start => return Err(Error::NotReady),
                        ProcessState::Stopped | ProcessState::Stopping => {}
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(Error::NotReady);
                }
            }
        };

        timeout(limit, wait).await.unwrap_or(Err(Error::NotReady))
    }
}

#[async_trait]
impl InferenceServer for ProcessSupervisor {
    fn state(&self) -> ServerStatus {
        ProcessSupervisor::state(self)
    }

    async fn start(&self) -> Result<ServerStatus> {
        ProcessSupervisor::start(self).await
    }

    async fn stop(&self) -> Result<ServerStatus> {
        ProcessSupervisor::stop(self).await
    }

    async fn wait_until_ready(&self, limit: Duration) -> Result<String> {
        ProcessSupervisor::wait_until_ready(self, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const READY_LINE: &str =
        r#"{"function":"server_cli","msg":"HTTP server listening","hostname":"127.0.0.1","port":"8123"}"#;

    fn script_profile(dir: &TempDir, body: &str) -> ModelProfile {
        let path = dir.path().join("server.sh");
        std::fs::write(&path, body).unwrap();
        ModelProfile {
            name: "test".to_string(),
            executable: path,
            launcher: Some(PathBuf::from("/bin/sh")),
            port: 8123,
            ctx_size: 512,
            n_gpu_layers: 0,
            timeout: 5,
            nobrowser: true,
            extra_flags: BTreeMap::new(),
            default: false,
        }
    }

    #[test]
    fn test_parse_ready_event() {
        assert_eq!(
            parse_ready_event(READY_LINE),
            Some("http://127.0.0.1:8123".to_string())
        );
        assert_eq!(
            parse_ready_event(
                r#"{"function":"server_cli","msg":"HTTP server listening","hostname":"0.0.0.0","port":8000}"#
            ),
            Some("http://0.0.0.0:8000".to_string())
        );

        // Other records and plain text are not ready events
        assert_eq!(
            parse_ready_event(r#"{"function":"load_model","msg":"loading","hostname":"h","port":1}"#),
            None
        );
        assert_eq!(
            parse_ready_event(r#"{"function":"server_cli","msg":"HTTP server listening"}"#),
            None
        );
        assert_eq!(parse_ready_event("llama server booting..."), None);
        assert_eq!(parse_ready_event("42"), None);
    }

    #[test]
    fn test_launch_command() {
        let dir = tempfile::tempdir().unwrap();
        let profile = script_profile(&dir, "");

        let (program, args) = launch_command(&profile);
        assert_eq!(program, PathBuf::from("/bin/sh"));
        assert_eq!(args[0], profile.executable.display().to_string());
        assert!(args.contains(&"--nobrowser".to_string()));
        assert!(args.windows(2).any(|pair| pair == ["--port", "8123"]));

        let mut direct = profile.clone();
        direct.launcher = None;
        let (program, args) = launch_command(&direct);
        assert_eq!(program, direct.executable);
        assert_eq!(args[0], "--n-gpu-layers");
    }

    #[test]
    fn test_render_command_quotes_arguments() {
        let rendered = render_command(
            Path::new("/opt/models/my model.llamafile"),
            &["--port".to_string(), "8000".to_string(), "it's".to_string()],
        );
        assert_eq!(
            rendered,
            r#"'/opt/models/my model.llamafile' --port 8000 'it'"'"'s'"#
        );
    }

    #[tokio::test]
    async fn test_process_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let profile = script_profile(
            &dir,
            &format!(
                "echo 'llama server booting'\necho '{}'\necho '{}'\nexec sleep 30\n",
                READY_LINE,
                r#"{"function":"server_cli","msg":"HTTP server listening","hostname":"10.0.0.1","port":"9999"}"#
            ),
        );
        let supervisor = ProcessSupervisor::new(profile, Duration::from_secs(2));
        assert_eq!(supervisor.state().state, ProcessState::Stopped);

        let status = supervisor.start().await.unwrap();
        assert!(status.is_active());

        let address = supervisor
            .wait_until_ready(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(address, "http://127.0.0.1:8123");

        let running = supervisor.state();
        assert_eq!(running.state, ProcessState::Running);
        // The second ready record is ignored
        assert_eq!(running.address.as_deref(), Some("http://127.0.0.1:8123"));

        // Starting again is a no-op
        let again = supervisor.start().await.unwrap();
        assert_eq!(again, running);

        let stopped = supervisor.stop().await.unwrap();
        assert_eq!(stopped.state, ProcessState::Stopped);
        assert_eq!(stopped.address, None);

        // Stopping again is a no-op
        assert_eq!(supervisor.stop().await.unwrap(), stopped);
    }

    #[tokio::test]
    async fn test_start_while_starting_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let profile = script_profile(&dir, &format!("sleep 1\necho '{}'\nexec sleep 30\n", READY_LINE));
        let supervisor = ProcessSupervisor::new(profile, Duration::from_secs(2));

        let first = supervisor.start().await.unwrap();
        let second = supervisor.start().await.unwrap();
        assert_eq!(first.state, ProcessState::Starting);
        assert_eq!(second, first);
        assert_eq!(second.run_id, 1);
        assert_eq!(second.address, None);

        let address = supervisor
            .wait_until_ready(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(address, "http://127.0.0.1:8123");
        assert_eq!(supervisor.state().run_id, 1);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_ignores_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let profile = script_profile(
            &dir,
            &format!(
                "trap 'exit 7' TERM\necho '{}'\nwhile true; do sleep 0.1; done\n",
                READY_LINE
            ),
        );
        let supervisor = ProcessSupervisor::new(profile, Duration::from_secs(3));

        supervisor.start().await.unwrap();
        supervisor
            .wait_until_ready(Duration::from_secs(5))
            .await
            .unwrap();

        let status = supervisor.stop().await.unwrap();
        assert_eq!(status.state, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_spawn_failure_returns_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mut profile = script_profile(&dir, "");
        profile.executable = dir.path().join("missing.llamafile");
        let supervisor = ProcessSupervisor::new(profile, Duration::from_secs(1));

        let result = supervisor.start().await;
        assert!(matches!(result, Err(Error::SpawnFailure(_))));
        assert_eq!(supervisor.state().state, ProcessState::Stopped);

        // A bad launcher is reported the same way
        let mut profile = script_profile(&dir, "");
        profile.launcher = Some(dir.path().join("no-such-shell"));
        supervisor.set_profile(profile).await;
        assert!(matches!(supervisor.start().await, Err(Error::SpawnFailure(_))));
        assert_eq!(supervisor.state().state, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_exit_before_ready_forces_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let profile = script_profile(&dir, "echo 'not json at all'\nexit 3\n");
        let supervisor = ProcessSupervisor::new(profile, Duration::from_secs(1));

        supervisor.start().await.unwrap();
        let ready = supervisor.wait_until_ready(Duration::from_secs(2)).await;
        assert!(matches!(ready, Err(Error::NotReady)));

        let mut rx = supervisor.inner.status.subscribe();
        let stopped = timeout(
            Duration::from_secs(5),
            rx.wait_for(|status| status.state == ProcessState::Stopped),
        )
        .await
        .map(|reached| reached.is_ok());
        assert_eq!(stopped, Ok(true));
        assert_eq!(supervisor.state().address, None);
    }

    #[tokio::test]
    async fn test_wait_after_crashed_run_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let profile = script_profile(&dir, "exit 1\n");
        let supervisor = ProcessSupervisor::new(profile, Duration::from_secs(1));

        supervisor.start().await.unwrap();
        let mut rx = supervisor.inner.status.subscribe();
        timeout(
            Duration::from_secs(5),
            rx.wait_for(|status| status.state == ProcessState::Stopped),
        )
        .await
        .unwrap()
        .unwrap();

        // The run is already gone, so waiting does not sit out the limit
        let started = std::time::Instant::now();
        let result = supervisor.wait_until_ready(Duration::from_secs(10)).await;
        assert!(matches!(result, Err(Error::NotReady)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_until_ready_times_out_when_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(script_profile(&dir, ""), Duration::from_secs(1));

        let result = supervisor.wait_until_ready(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::NotReady)));
    }
}
