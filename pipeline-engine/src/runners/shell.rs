// Shell Step Runner
// Executes script steps through sh, bash, pwsh or powershell

use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::model::{InstanceId, Shell, Step};
use crate::runners::{ArtifactRef, JobDispatch, StepError, StepOutcome, StepRunner};
use crate::secrets::JobEnvironment;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

impl Shell {
    /// Shell executable and the arguments preceding the script
    fn get_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Shell::Default => {
                if cfg!(target_os = "windows") {
                    ("cmd", &["/C"])
                } else {
                    ("sh", &["-c"])
                }
            }
            Shell::Bash => ("bash", &["-c"]),
            Shell::Pwsh => ("pwsh", &["-NoLogo", "-NoProfile", "-Command"]),
            Shell::PowerShell => {
                if cfg!(target_os = "windows") {
                    ("powershell.exe", &["-NoLogo", "-NoProfile", "-Command"])
                } else {
                    // Fall back to pwsh on non-Windows
                    ("pwsh", &["-NoLogo", "-NoProfile", "-Command"])
                }
            }
        }
    }
}

/// Runs steps as local shell processes inside a workspace directory.
///
/// Steps can report structured output and artifacts by printing workflow
/// commands on stdout:
///
/// ```text
/// ##pipeline[set-output name=version]1.2.0
/// ##pipeline[artifact]dist/pkg.whl
/// ```
pub struct ShellStepRunner {
    workspace: PathBuf,
}

/// Collected state of a single step process
struct StepRun {
    exit_code: Option<i32>,
    stdout: String,
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ShellStepRunner {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn step_dir(&self, step: &Step) -> PathBuf {
        match &step.working_dir {
            Some(dir) => self.workspace.join(dir),
            None => self.workspace.clone(),
        }
    }

    async fn run_step(
        &self,
        step: &Step,
        index: usize,
        env: &Arc<JobEnvironment>,
        dispatch: &JobDispatch,
    ) -> Result<StepRun, StepError> {
        let (shell_cmd, shell_args) = step.shell.get_command();

        let mut cmd = Command::new(shell_cmd);
        cmd.args(shell_args);
        cmd.arg(&step.run);
        cmd.current_dir(self.step_dir(step));
        cmd.envs(env.to_env_map());
        cmd.envs(&step.env);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| StepError::Spawn {
            step: step.name.clone(),
            source,
        })?;

        let stdout_handle = child.stdout.take().map(|out| {
            forward_lines(out, false, index, env.clone(), &dispatch.instance, &dispatch.progress)
        });
        let stderr_handle = child.stderr.take().map(|err| {
            forward_lines(err, true, index, env.clone(), &dispatch.instance, &dispatch.progress)
        });

        let timeout = step.timeout_secs.map(Duration::from_secs);
        let waited = {
            let wait = async {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
                    None => Some(child.wait().await),
                }
            };
            tokio::select! {
                status = wait => match status {
                    Some(status) => Waited::Exited(status),
                    None => Waited::TimedOut,
                },
                _ = dispatch.cancel.cancelled() => Waited::Cancelled,
            }
        };

        let status = match waited {
            Waited::Exited(status) => status,
            Waited::TimedOut => {
                let _ = child.kill().await;
                return Err(StepError::Timeout {
                    step: step.name.clone(),
                    timeout: timeout.unwrap_or_default(),
                });
            }
            Waited::Cancelled => {
                let _ = child.kill().await;
                return Err(StepError::Cancelled);
            }
        };

        let stdout = match stdout_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        if let Some(handle) = stderr_handle {
            let _ = handle.await;
        }

        Ok(StepRun {
            exit_code: status.ok().and_then(|s| s.code()),
            stdout,
        })
    }
}

/// Stream lines of a child pipe as masked progress events, returning the raw text
fn forward_lines<R>(
    reader: R,
    is_error: bool,
    step_index: usize,
    env: Arc<JobEnvironment>,
    instance: &InstanceId,
    progress: &Option<ProgressSender>,
) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let instance = instance.clone();
    let progress = progress.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut output = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            progress.send_event(ExecutionEvent::step_output(
                &instance,
                step_index,
                env.mask(&line),
                is_error,
            ));
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&line);
        }
        output
    })
}

/// Workflow commands found in step output
#[derive(Debug, Default, PartialEq)]
struct WorkflowCommands {
    outputs: HashMap<String, String>,
    artifacts: Vec<String>,
}

fn parse_workflow_commands(output: &str) -> WorkflowCommands {
    let mut commands = WorkflowCommands::default();

    for line in output.lines() {
        let Some(rest) = line.trim_start().strip_prefix("##pipeline[") else {
            continue;
        };
        let Some((command, value)) = rest.split_once(']') else {
            continue;
        };

        let mut parts = command.split_whitespace();
        match parts.next() {
            Some("set-output") => {
                let name = parts.find_map(|p| p.strip_prefix("name="));
                if let Some(name) = name {
                    commands.outputs.insert(name.to_string(), value.to_string());
                }
            }
            Some("artifact") => {
                if !value.trim().is_empty() {
                    commands.artifacts.push(value.trim().to_string());
                }
            }
            _ => {}
        }
    }

    commands
}

fn collect_artifact(dir: &Path, relative: &str) -> Option<ArtifactRef> {
    let path = dir.join(relative);
    if !path.exists() {
        return None;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| relative.to_string());
    Some(ArtifactRef { name, path })
}

#[async_trait::async_trait]
impl StepRunner for ShellStepRunner {
    async fn run(&self, dispatch: JobDispatch) -> Result<StepOutcome, StepError> {
        let env = Arc::new(dispatch.env.clone());
        let mut outputs = serde_json::Map::new();
        let mut artifacts = Vec::new();

        for (index, step) in dispatch.steps.iter().enumerate() {
            if dispatch.cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }

            dispatch.progress.send_event(ExecutionEvent::StepStarted {
                instance: dispatch.instance.clone(),
                step_name: step.name.clone(),
                step_index: index,
            });
            debug!(instance = %dispatch.instance, step = %step.name, "running step");

            let start = Instant::now();
            let run = self.run_step(step, index, &env, &dispatch).await?;

            dispatch.progress.send_event(ExecutionEvent::StepCompleted {
                instance: dispatch.instance.clone(),
                step_index: index,
                exit_code: run.exit_code,
                duration: start.elapsed(),
            });

            let exit_status = run.exit_code.unwrap_or(-1);
            if exit_status != 0 {
                if step.continue_on_error {
                    warn!(
                        instance = %dispatch.instance,
                        step = %step.name,
                        exit_status,
                        "step failed, continuing"
                    );
                    continue;
                }
                return Ok(StepOutcome {
                    exit_status,
                    artifacts,
                    output: (!outputs.is_empty()).then(|| serde_json::Value::Object(outputs)),
                });
            }

            let commands = parse_workflow_commands(&run.stdout);
            for (name, value) in commands.outputs {
                outputs.insert(name, serde_json::Value::String(env.mask(&value)));
            }

            let dir = self.step_dir(step);
            for relative in step.artifacts.iter().chain(&commands.artifacts) {
                match collect_artifact(&dir, relative) {
                    Some(artifact) => artifacts.push(artifact),
                    None => warn!(
                        instance = %dispatch.instance,
                        step = %step.name,
                        path = %relative,
                        "declared artifact not found"
                    ),
                }
            }
        }

        Ok(StepOutcome {
            exit_status: 0,
            artifacts,
            output: (!outputs.is_empty()).then(|| serde_json::Value::Object(outputs)),
        })
    }
}
