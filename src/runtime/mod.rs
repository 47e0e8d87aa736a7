//! Execution environment for task workspaces.
//!
//! Each workspace gets its own Python virtual environment at `venv/`:
//! - `prepare` creates it and installs the workspace's dependency manifest
//! - `run` executes the entry script with the venv interpreter
//!
//! All processes run with the workspace as working directory and go through
//! a `CommandRunner`, so tests never touch a real interpreter.

pub mod command;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::ExecutionError;
use crate::task::ExecutionOutput;

pub use command::{CommandError, CommandOutput, CommandRunner, CommandSpec, TokioCommandRunner};

/// Directory name of the per-workspace virtual environment.
pub const VENV_DIR: &str = "venv";

/// Prepares isolated runtimes and runs entry scripts.
pub struct ExecutionEnvironment {
    runner: Arc<dyn CommandRunner>,
    config: RuntimeConfig,
}

impl ExecutionEnvironment {
    pub fn new(runner: Arc<dyn CommandRunner>, config: RuntimeConfig) -> Self {
        Self { runner, config }
    }

    /// Configured entry script name.
    pub fn entry_script(&self) -> &str {
        &self.config.entry_script
    }

    /// Create a fresh venv and install the dependency manifest into it.
    pub async fn prepare(
        &self,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        let workdir = absolute(workspace).map_err(|e| ExecutionError::DependencyInstall {
            step: "resolve workspace".to_string(),
            reason: e.to_string(),
        })?;

        let manifest = workdir.join(&self.config.requirements);
        if !manifest.is_file() {
            return Err(ExecutionError::DependencyInstall {
                step: "locate manifest".to_string(),
                reason: format!("{} not found in workspace", self.config.requirements),
            });
        }

        let pip = venv_bin(&workdir, "pip");
        let steps = [
            CommandSpec::new(&self.config.python, &workdir).args(["-m", "venv", VENV_DIR]),
            CommandSpec::new(pip.to_string_lossy(), &workdir)
                .args(["install", "--upgrade", "pip"]),
            CommandSpec::new(pip.to_string_lossy(), &workdir)
                .args(["install", "-r", self.config.requirements.as_str()]),
        ];

        for step in steps {
            let step = step.with_timeout(self.config.execution_timeout);
            let label = step.display();
            debug!(command = %label, "Preparing runtime");

            let output = self.runner.run(&step, cancel).await.map_err(|e| match e {
                CommandError::Cancelled => ExecutionError::Cancelled {
                    command: label.clone(),
                },
                other => ExecutionError::DependencyInstall {
                    step: label.clone(),
                    reason: other.to_string(),
                },
            })?;

            if !output.success() {
                warn!(command = %label, exit_code = output.exit_code, "Runtime preparation step failed");
                return Err(ExecutionError::DependencyInstall {
                    step: label,
                    reason: format!("exit code {}: {}", output.exit_code, output.stderr.trim()),
                });
            }
        }

        info!(workspace = %workdir.display(), "Runtime prepared");
        Ok(())
    }

    /// Run `entry_point` inside the prepared venv.
    pub async fn run(
        &self,
        workspace: &Path,
        entry_point: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let workdir = absolute(workspace).map_err(|e| ExecutionError::Spawn {
            command: entry_point.to_string(),
            reason: e.to_string(),
        })?;

        let python = venv_bin(&workdir, "python");
        let spec = CommandSpec::new(python.to_string_lossy(), &workdir)
            .arg(entry_point)
            .with_timeout(self.config.execution_timeout);
        let label = spec.display();

        let started_at = Utc::now();
        let output = self.runner.run(&spec, cancel).await.map_err(|e| match e {
            CommandError::TimedOut(timeout) => ExecutionError::TimedOut {
                command: label.clone(),
                timeout,
            },
            CommandError::Cancelled => ExecutionError::Cancelled {
                command: label.clone(),
            },
            CommandError::Spawn(reason) | CommandError::Io(reason) => ExecutionError::Spawn {
                command: label.clone(),
                reason,
            },
        })?;
        let finished_at = Utc::now();

        if !output.success() {
            return Err(ExecutionError::Execution {
                entry: entry_point.to_string(),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        info!(
            entry = entry_point,
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "Entry script finished"
        );

        Ok(ExecutionOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            started_at,
            finished_at,
        })
    }
}

/// Path of an executable inside the workspace venv.
fn venv_bin(workdir: &Path, tool: &str) -> PathBuf {
    if cfg!(target_os = "windows") {
        workdir.join(VENV_DIR).join("Scripts").join(format!("{tool}.exe"))
    } else {
        workdir.join(VENV_DIR).join("bin").join(tool)
    }
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        std::path::absolute(path)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;

    /// Records every spec and replays scripted results in order.
    #[derive(Default)]
    struct ScriptedRunner {
        calls: Mutex<Vec<CommandSpec>>,
        replies: Mutex<VecDeque<Result<CommandOutput, CommandError>>>,
    }

    impl ScriptedRunner {
        fn reply(self, r: Result<CommandOutput, CommandError>) -> Self {
            self.replies.lock().unwrap().push_back(r);
            self
        }

        fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            spec: &CommandSpec,
            _cancel: &CancellationToken,
        ) -> Result<CommandOutput, CommandError> {
            self.calls.lock().unwrap().push(spec.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(CommandOutput::default()))
        }
    }

    fn workspace_with_manifest() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "requests\n").unwrap();
        dir
    }

    fn failed(code: i32, stderr: &str) -> Result<CommandOutput, CommandError> {
        Ok(CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: code,
        })
    }

    #[tokio::test]
    async fn prepare_creates_venv_then_installs() {
        let dir = workspace_with_manifest();
        let runner = Arc::new(ScriptedRunner::default());
        let env = ExecutionEnvironment::new(runner.clone(), RuntimeConfig::default());

        env.prepare(dir.path(), &CancellationToken::new()).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].program, "python3");
        assert_eq!(calls[0].args, ["-m", "venv", "venv"]);
        assert!(calls[1].program.ends_with("pip"));
        assert_eq!(calls[1].args, ["install", "--upgrade", "pip"]);
        assert_eq!(calls[2].args, ["install", "-r", "requirements.txt"]);
        assert!(calls.iter().all(|c| c.working_dir == dir.path()));
    }

    #[tokio::test]
    async fn prepare_without_manifest_fails_before_running() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let env = ExecutionEnvironment::new(runner.clone(), RuntimeConfig::default());

        let err = env.prepare(dir.path(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::DependencyInstall { .. }));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn prepare_stops_at_failing_install() {
        let dir = workspace_with_manifest();
        let runner = Arc::new(
            ScriptedRunner::default()
                .reply(Ok(CommandOutput::default()))
                .reply(Ok(CommandOutput::default()))
                .reply(failed(1, "No matching distribution found for nonsense")),
        );
        let env = ExecutionEnvironment::new(runner.clone(), RuntimeConfig::default());

        let err = env.prepare(dir.path(), &CancellationToken::new()).await.unwrap_err();
        match err {
            ExecutionError::DependencyInstall { step, reason } => {
                assert!(step.contains("-r requirements.txt"));
                assert!(reason.contains("No matching distribution"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn run_nonzero_exit_carries_output() {
        let dir = workspace_with_manifest();
        let runner = Arc::new(ScriptedRunner::default().reply(failed(1, "ZeroDivisionError")));
        let env = ExecutionEnvironment::new(runner.clone(), RuntimeConfig::default());

        let err = env
            .run(dir.path(), "entry_script.py", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ExecutionError::Execution { exit_code, stderr, .. } => {
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "ZeroDivisionError");
            }
            other => panic!("unexpected error: {other}"),
        }

        let calls = runner.calls();
        assert!(calls[0].program.ends_with("python"));
        assert_eq!(calls[0].args, ["entry_script.py"]);
    }

    #[tokio::test]
    async fn run_success_returns_output() {
        let dir = workspace_with_manifest();
        let runner = Arc::new(ScriptedRunner::default().reply(Ok(CommandOutput {
            stdout: "done\n".into(),
            stderr: String::new(),
            exit_code: 0,
        })));
        let env = ExecutionEnvironment::new(runner, RuntimeConfig::default());

        let out = env
            .run(dir.path(), "entry_script.py", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout, "done\n");
        assert!(out.finished_at >= out.started_at);
    }

    #[tokio::test]
    async fn run_timeout_maps_to_timed_out() {
        let dir = workspace_with_manifest();
        let runner = Arc::new(
            ScriptedRunner::default().reply(Err(CommandError::TimedOut(Duration::from_secs(5)))),
        );
        let config = RuntimeConfig {
            execution_timeout: Some(Duration::from_secs(5)),
            ..RuntimeConfig::default()
        };
        let env = ExecutionEnvironment::new(runner.clone(), config);

        let err = env
            .run(dir.path(), "entry_script.py", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::TimedOut { .. }));
        assert_eq!(runner.calls()[0].timeout, Some(Duration::from_secs(5)));
    }
}
