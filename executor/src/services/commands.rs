use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command as AsyncCommand};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::{ExternalToolError, VaultError};
use crate::exit_safety::process_registry::signal_process_group;
use crate::exit_safety::{ExitSafety, ProcessHandle};

/// How long to wait for output pipes after the process itself exited
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Time between SIGTERM and SIGKILL when the wrapper kills a timed-out process
const TIMEOUT_KILL_GRACE: Duration = Duration::from_secs(2);

const STDERR_SNIPPET_CHARS: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
    label: Option<String>,
    during_cleanup: bool,
}

impl CommandSpec {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            ..Default::default()
        }
    }

    /// `sh -c <script>`
    pub fn shell(script: &str) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn envs<'a, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = &'a (String, String)>,
    {
        self.env.extend(vars.into_iter().cloned());
        self
    }

    pub fn stdin(mut self, input: Vec<u8>) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    /// Allow this call after the cleanup pass began. Only the restarts the
    /// cleanup itself performs qualify.
    pub fn during_cleanup(mut self) -> Self {
        self.during_cleanup = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn env_vars(&self) -> &[(String, String)] {
        &self.env
    }

    /// Short name for logs and the process registry
    pub fn display_label(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => match self.args.first() {
                Some(first) => format!("{} {}", self.program, first),
                None => self.program.clone(),
            },
        }
    }

    /// Full command line; environment values are never printed
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    fn to_command(&self) -> AsyncCommand {
        let mut command = AsyncCommand::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            // Own process group so the sweep reaches grandchildren too
            .process_group(0)
            .kill_on_drop(true);
        command
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn into_tool_error(self, label: String) -> VaultError {
        let stderr = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        VaultError::ExternalTool(ExternalToolError {
            label,
            exit_code: self.exit_code,
            stderr: stderr.chars().take(STDERR_SNIPPET_CHARS).collect(),
        })
    }
}

/// Deregisters on drop, so every exit path of a run releases its entry
struct Registration<'a> {
    coordinator: &'a ExitSafety,
    handle: ProcessHandle,
}

impl<'a> Registration<'a> {
    fn new(coordinator: &'a ExitSafety, pid: u32, label: &str) -> Self {
        let handle = coordinator.register(pid, label);
        Self {
            coordinator,
            handle,
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.coordinator.unregister(self.handle);
    }
}

/// The only way the crate launches external processes
#[derive(Clone)]
pub struct CommandRunner {
    coordinator: Arc<ExitSafety>,
    default_timeout: Duration,
}

impl CommandRunner {
    pub fn new(coordinator: Arc<ExitSafety>, default_timeout: Duration) -> Self {
        Self {
            coordinator,
            default_timeout,
        }
    }

    pub fn coordinator(&self) -> &Arc<ExitSafety> {
        &self.coordinator
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Nothing new is spawned once cleanup began, except calls marked
    /// `during_cleanup`. Checked before spawn and again after registration:
    /// a process registered before the flag flipped is seen by the sweep,
    /// one registered after it is terminated here.
    fn admit(&self, spec: &CommandSpec) -> Result<(), VaultError> {
        if spec.during_cleanup || !self.coordinator.cleanup_started() {
            return Ok(());
        }
        debug!(command = %spec.display_label(), "Cleanup in progress, not spawning");
        Err(VaultError::Interrupted {
            signal: self.coordinator.cleanup_signal().unwrap_or(libc::SIGTERM),
        })
    }

    /// Run to completion or timeout. A non-zero exit is not an error here.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, VaultError> {
        self.admit(spec)?;
        let limit = timeout.unwrap_or(self.default_timeout);
        let label = spec.display_label();
        debug!(command = %spec.display(), timeout_secs = limit.as_secs(), "Executing command");

        let mut command = spec.to_command();
        command
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| VaultError::Spawn {
            label: label.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| VaultError::Spawn {
            label: label.clone(),
            reason: "process exited before it could be tracked".to_string(),
        })?;
        let _registration = Registration::new(&self.coordinator, pid, &label);
        if let Err(e) = self.admit(spec) {
            terminate(&mut child, pid).await;
            return Err(e);
        }

        if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!("Failed to write stdin: {}", e);
                }
            });
        }
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        match tokio::time::timeout(limit, child.wait()).await {
            Ok(Ok(status)) => Ok(CommandOutput {
                exit_code: status.code().unwrap_or(-1),
                stdout: collect(stdout).await,
                stderr: collect(stderr).await,
            }),
            Ok(Err(e)) => Err(VaultError::Other(format!(
                "Error waiting for '{}': {}",
                label, e
            ))),
            Err(_) => {
                warn!(command = %label, "Command timed out after {}s, terminating", limit.as_secs());
                terminate(&mut child, pid).await;
                Err(VaultError::Timeout { label, after: limit })
            }
        }
    }

    /// Like `run`, but a non-zero exit becomes `VaultError::ExternalTool`
    pub async fn run_checked(
        &self,
        spec: &CommandSpec,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, VaultError> {
        let output = self.run(spec, timeout).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(output.into_tool_error(spec.display_label()))
        }
    }

    /// Retry wrapper for idempotent read-only calls only
    pub async fn run_with_retry(
        &self,
        spec: &CommandSpec,
        timeout: Option<Duration>,
        attempts: u32,
    ) -> Result<CommandOutput, VaultError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.run_checked(spec, timeout).await {
                Ok(output) => return Ok(output),
                Err(e) if attempt < attempts && !self.coordinator.cleanup_started() => {
                    warn!(command = %spec.display_label(), attempt, "Read-only command failed, retrying: {}", e);
                    tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `producer | consumer`, both tracked. Returns the consumer's output;
    /// a failing producer is reported as the error.
    pub async fn run_piped(
        &self,
        producer: &CommandSpec,
        consumer: &CommandSpec,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, VaultError> {
        self.admit(producer)?;
        self.admit(consumer)?;
        let limit = timeout.unwrap_or(self.default_timeout);
        let producer_label = producer.display_label();
        let consumer_label = consumer.display_label();
        debug!(
            producer = %producer.display(),
            consumer = %consumer.display(),
            "Executing pipeline"
        );

        let mut producer_cmd = producer.to_command();
        producer_cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut producer_child = producer_cmd.spawn().map_err(|e| VaultError::Spawn {
            label: producer_label.clone(),
            reason: e.to_string(),
        })?;
        let producer_pid = producer_child.id().ok_or_else(|| VaultError::Spawn {
            label: producer_label.clone(),
            reason: "process exited before it could be tracked".to_string(),
        })?;
        let _producer_registration =
            Registration::new(&self.coordinator, producer_pid, &producer_label);
        if let Err(e) = self.admit(producer) {
            terminate(&mut producer_child, producer_pid).await;
            return Err(e);
        }

        let pipe: Stdio = match producer_child.stdout.take() {
            Some(stdout) => stdout.try_into().map_err(|e: std::io::Error| {
                VaultError::Other(format!("Failed to connect pipe: {}", e))
            })?,
            None => {
                return Err(VaultError::Other(format!(
                    "'{}' has no stdout to pipe",
                    producer_label
                )))
            }
        };

        let mut consumer_cmd = consumer.to_command();
        consumer_cmd
            .stdin(pipe)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut consumer_child = match consumer_cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                terminate(&mut producer_child, producer_pid).await;
                return Err(VaultError::Spawn {
                    label: consumer_label,
                    reason: e.to_string(),
                });
            }
        };
        let Some(consumer_pid) = consumer_child.id() else {
            terminate(&mut producer_child, producer_pid).await;
            if let Err(e) = consumer_child.kill().await {
                debug!("Reaping untracked consumer reported: {}", e);
            }
            return Err(VaultError::Spawn {
                label: consumer_label,
                reason: "process exited before it could be tracked".to_string(),
            });
        };
        let _consumer_registration =
            Registration::new(&self.coordinator, consumer_pid, &consumer_label);
        if let Err(e) = self.admit(consumer) {
            terminate(&mut producer_child, producer_pid).await;
            terminate(&mut consumer_child, consumer_pid).await;
            return Err(e);
        }

        let producer_stderr = drain(producer_child.stderr.take());
        let consumer_stdout = drain(consumer_child.stdout.take());
        let consumer_stderr = drain(consumer_child.stderr.take());

        let waited = tokio::time::timeout(limit, async {
            tokio::join!(producer_child.wait(), consumer_child.wait())
        })
        .await;

        match waited {
            Ok((Ok(producer_status), Ok(consumer_status))) => {
                let consumer_output = CommandOutput {
                    exit_code: consumer_status.code().unwrap_or(-1),
                    stdout: collect(consumer_stdout).await,
                    stderr: collect(consumer_stderr).await,
                };
                if !producer_status.success() {
                    let producer_output = CommandOutput {
                        exit_code: producer_status.code().unwrap_or(-1),
                        stdout: String::new(),
                        stderr: collect(producer_stderr).await,
                    };
                    return Err(producer_output.into_tool_error(producer_label));
                }
                Ok(consumer_output)
            }
            Ok((producer_result, consumer_result)) => {
                let reason = producer_result
                    .err()
                    .or(consumer_result.err())
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                Err(VaultError::Other(format!(
                    "Error waiting for pipeline '{} | {}': {}",
                    producer_label, consumer_label, reason
                )))
            }
            Err(_) => {
                warn!(
                    producer = %producer_label,
                    consumer = %consumer_label,
                    "Pipeline timed out after {}s, terminating",
                    limit.as_secs()
                );
                terminate(&mut producer_child, producer_pid).await;
                terminate(&mut consumer_child, consumer_pid).await;
                Err(VaultError::Timeout {
                    label: format!("{} | {}", producer_label, consumer_label),
                    after: limit,
                })
            }
        }
    }
}

fn drain<R>(stream: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream.map(|mut reader| {
        tokio::spawn(async move {
            let mut buffer = Vec::new();
            if let Err(e) = reader.read_to_end(&mut buffer).await {
                debug!("Output stream closed with error: {}", e);
            }
            buffer
        })
    })
}

async fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).to_string(),
        _ => String::new(),
    }
}

/// SIGTERM the group, then SIGKILL and reap
async fn terminate(child: &mut Child, pid: u32) {
    signal_process_group(pid, libc::SIGTERM);
    if tokio::time::timeout(TIMEOUT_KILL_GRACE, child.wait())
        .await
        .is_ok()
    {
        return;
    }
    signal_process_group(pid, libc::SIGKILL);
    if let Err(e) = child.kill().await {
        debug!(pid, "Kill after timeout reported: {}", e);
    }
}
