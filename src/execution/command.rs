//! External processing commands
//!
//! A stage's argv template is rendered per unit into an [`Invocation`]; a
//! [`UnitLauncher`] runs it to completion. [`ProcessLauncher`] spawns a real
//! child process whose stdout and stderr go to the unit's log file.

use crate::core::{
    config::Configuration,
    error::{PipelineError, Result},
    mode::ProcessingMode,
    stage::Stage,
    template,
    unit::WorkUnit,
};
use crate::execution::enumerator::unit_variables;
use crate::execution::process_group::ProcessGroup;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One rendered external command for one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Unit key
    pub key: String,

    pub program: String,
    pub args: Vec<String>,

    /// Environment bindings added to the inherited environment
    pub env: Vec<(String, String)>,

    /// Per-unit log receiving stdout and stderr
    pub log_path: PathBuf,
}

impl Invocation {
    /// Shell-like rendering for logs
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Renders a stage's command template for each unit of one batch
#[derive(Debug, Clone)]
pub struct InvocationBuilder<'a> {
    stage: &'a Stage,
    mode: ProcessingMode,
    variables: HashMap<String, String>,
    scratch: Option<PathBuf>,
    log_dir: PathBuf,
}

impl<'a> InvocationBuilder<'a> {
    pub fn new(stage: &'a Stage, config: &Configuration, mode: ProcessingMode) -> Self {
        Self {
            stage,
            mode,
            variables: config.template_variables(),
            scratch: None,
            log_dir: config.log_root.join(&stage.id),
        }
    }

    /// Expose the batch's shared scratch directory as `{{ scratch }}`
    pub fn with_scratch(mut self, scratch: Option<&Path>) -> Self {
        self.scratch = scratch.map(Path::to_path_buf);
        self
    }

    /// Render the invocation for a unit
    pub fn build(&self, unit: &WorkUnit) -> Result<Invocation> {
        let mut vars = unit_variables(
            &self.variables,
            &self.stage.id,
            self.mode,
            &unit.key,
            unit.index,
            unit.input.as_deref(),
        );
        let scratch = self
            .scratch
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let outputs: Vec<String> = unit.outputs.iter().map(|p| p.display().to_string()).collect();
        vars.insert("scratch".to_string(), scratch.clone());
        vars.insert("outputs".to_string(), outputs.join(" "));
        vars.insert(
            "output".to_string(),
            outputs.first().cloned().unwrap_or_default(),
        );

        let mut argv = self
            .stage
            .command
            .iter()
            .map(|part| template::render(part, &vars))
            .collect::<Result<Vec<_>>>()?;
        if argv.is_empty() {
            return Err(PipelineError::config(format!(
                "stage '{}' has an empty command",
                self.stage.id
            )));
        }
        let program = argv.remove(0);

        let mut env = vec![
            ("HYPERPIPE_STAGE".to_string(), self.stage.id.clone()),
            ("HYPERPIPE_UNIT_KEY".to_string(), unit.key.clone()),
            ("HYPERPIPE_MODE".to_string(), self.mode.as_str().to_string()),
            ("HYPERPIPE_OUTPUT".to_string(), vars["output"].clone()),
            ("HYPERPIPE_OUTPUTS".to_string(), outputs.join(":")),
        ];
        if let Some(index) = unit.index {
            env.push(("HYPERPIPE_UNIT_INDEX".to_string(), index.to_string()));
        }
        if let Some(input) = &unit.input {
            env.push(("HYPERPIPE_INPUT".to_string(), input.display().to_string()));
        }
        if self.scratch.is_some() {
            env.push(("HYPERPIPE_SCRATCH".to_string(), scratch));
        }
        for (name, value) in &self.stage.env {
            env.push((name.clone(), template::render(value, &vars)?));
        }

        Ok(Invocation {
            key: unit.key.clone(),
            program,
            args: argv,
            env,
            log_path: self.log_dir.join(format!("{}.log", unit.key)),
        })
    }
}

/// How a launched unit ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// Process exited; signal deaths are reported as `128 + signal`
    Exited(i32),
    /// Killed after outliving its timeout
    TimedOut(Duration),
    /// Killed because the batch was interrupted
    Cancelled,
    /// Could not be spawned or waited on
    LaunchFailed(String),
}

/// Runs one invocation to completion
#[async_trait]
pub trait UnitLauncher: Send + Sync {
    /// Run until the process exits, times out or `cancel` fires
    ///
    /// On timeout or cancellation the child and everything it started are
    /// terminated, escalating to SIGKILL after `kill_grace`, and reaped.
    async fn launch(
        &self,
        invocation: &Invocation,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        kill_grace: Duration,
    ) -> ProcessExit;
}

/// Launches units as OS child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl UnitLauncher for ProcessLauncher {
    async fn launch(
        &self,
        invocation: &Invocation,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        kill_grace: Duration,
    ) -> ProcessExit {
        let (stdout, stderr) = match open_unit_log(invocation).await {
            Ok(streams) => streams,
            Err(e) => {
                return ProcessExit::LaunchFailed(format!(
                    "cannot open log {}: {}",
                    invocation.log_path.display(),
                    e
                ))
            }
        };

        debug!("Spawning unit '{}': {}", invocation.key, invocation.command_line());

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        // Own group, so terminating the unit reaches its descendants
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ProcessExit::LaunchFailed(format!(
                    "failed to spawn '{}': {}",
                    invocation.program, e
                ))
            }
        };
        let mut group = ProcessGroup::led_by(child.id());

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            status = child.wait() => {
                group.release();
                match status {
                    Ok(status) => ProcessExit::Exited(exit_code(status)),
                    Err(e) => ProcessExit::LaunchFailed(format!("failed to wait for child: {}", e)),
                }
            }
            _ = deadline => {
                terminate(&mut child, &mut group, &invocation.key, kill_grace).await;
                ProcessExit::TimedOut(timeout.unwrap_or_default())
            }
            _ = cancel.cancelled() => {
                terminate(&mut child, &mut group, &invocation.key, kill_grace).await;
                ProcessExit::Cancelled
            }
        }
    }
}

/// Stop a unit's whole process group and reap its leader
///
/// The group gets SIGTERM, then SIGKILL once `grace` has passed. Members the
/// leader left behind are killed before returning.
async fn terminate(child: &mut Child, group: &mut ProcessGroup, key: &str, grace: Duration) {
    if !group.terminate() {
        if let Err(e) = child.start_kill() {
            debug!("Unit '{}' already gone: {}", key, e);
        }
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(_)) => debug!("Unit '{}' terminated", key),
        Ok(Err(e)) => warn!("Failed to reap unit '{}': {}", key, e),
        Err(_) => {
            warn!("Unit '{}' ignored SIGTERM for {:?}, killing it", key, grace);
            group.kill();
            let _ = child.start_kill();
            // kill_on_drop still covers a leader that cannot be reaped
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                warn!("Unit '{}' did not exit after SIGKILL", key);
            }
        }
    }

    group.kill();
    if group.wait_empty(grace).await {
        group.release();
    } else {
        warn!("Processes started by unit '{}' outlived the kill", key);
    }
}

async fn open_unit_log(invocation: &Invocation) -> std::io::Result<(Stdio, Stdio)> {
    if let Some(parent) = invocation.log_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&invocation.log_path)
        .await?;
    let header = format!(
        "# {} {}\n",
        chrono::Utc::now().to_rfc3339(),
        invocation.command_line()
    );
    file.write_all(header.as_bytes()).await?;
    file.flush().await?;
    let file = file.into_std().await;
    let stderr = file.try_clone()?;
    Ok((Stdio::from(file), Stdio::from(stderr)))
}

/// Process exit code; on unix a signal death maps to `128 + signal`
pub fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or_else(|| {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            128 + status.signal().unwrap_or(0)
        }
        #[cfg(not(unix))]
        {
            -1
        }
    })
}
