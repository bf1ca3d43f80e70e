//! Default executor: runs the IaC binary as a child process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::component::Outputs;
use crate::config::EngineConfig;
use crate::consts::ENV_PLUGIN_CACHE_DIR;

use super::executor::{ExecutionOutcome, ExecutionRequest, Executor};
use super::types::ExecuteError;

/// Runs `init`, the requested action, and `output -json` for each unit.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
  program: String,
  plugin_cache_dir: Option<PathBuf>,
}

/// Where and how one command runs.
struct Invocation<'a> {
  unit: &'a Path,
  working_dir: &'a Path,
  environment: &'a BTreeMap<String, String>,
  non_interactive: bool,
}

impl<'a> From<&'a ExecutionRequest> for Invocation<'a> {
  fn from(request: &'a ExecutionRequest) -> Self {
    Self {
      unit: &request.unit,
      working_dir: &request.working_dir,
      environment: &request.environment,
      non_interactive: request.non_interactive,
    }
  }
}

struct StepOutput {
  code: i32,
  stdout: String,
}

#[derive(Deserialize)]
struct OutputValue {
  value: serde_json::Value,
}

impl ProcessExecutor {
  pub fn new(program: impl Into<String>) -> Self {
    Self {
      program: program.into(),
      plugin_cache_dir: None,
    }
  }

  pub fn from_config(config: &EngineConfig) -> Self {
    let executor = Self::new(config.tf_path.clone());
    match &config.plugin_cache_dir {
      Some(dir) => executor.with_plugin_cache_dir(dir),
      None => executor,
    }
  }

  /// Share a plugin cache between units. Exported to every child and used to serialize `init`.
  pub fn with_plugin_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.plugin_cache_dir = Some(dir.into());
    self
  }

  pub fn program(&self) -> &str {
    &self.program
  }

  async fn run_step(
    &self,
    call: &Invocation<'_>,
    args: &[String],
    logs: &mut String,
  ) -> Result<StepOutput, ExecuteError> {
    info!(unit = %call.unit.display(), cmd = %format!("{} {}", self.program, args.join(" ")), "executing command");

    let mut command = Command::new(&self.program);
    command.args(args).current_dir(call.working_dir);
    if let Some(dir) = &self.plugin_cache_dir {
      command.env(ENV_PLUGIN_CACHE_DIR, dir);
    }
    command
      .envs(call.environment)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    if call.non_interactive {
      command.env("TF_INPUT", "0");
    }

    let output = command.output().await.map_err(|e| ExecuteError::Spawn {
      program: self.program.clone(),
      source: Arc::new(e),
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    logs.push_str(&format!("$ {} {}\n", self.program, args.join(" ")));
    logs.push_str(&stdout);
    logs.push_str(&stderr);

    // Killed by a signal.
    let code = output.status.code().unwrap_or(-1);
    if code != 0 {
      debug!(unit = %call.unit.display(), code, stderr = %stderr, "command failed");
    }
    Ok(StepOutput { code, stdout })
  }

  /// The request's own cache setting wins over the configured one.
  fn plugin_cache(&self, request: &ExecutionRequest) -> Option<PathBuf> {
    match request.environment.get(ENV_PLUGIN_CACHE_DIR) {
      Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
      _ => self.plugin_cache_dir.clone(),
    }
  }
}

fn action_args(request: &ExecutionRequest) -> Vec<String> {
  let mut args = vec![request.action.clone()];
  let mutating = matches!(request.action.as_str(), "apply" | "destroy");
  if mutating && request.non_interactive && !request.extra_args.iter().any(|a| a == "-auto-approve") {
    args.push("-auto-approve".to_string());
  }
  args.extend(request.extra_args.iter().cloned());
  args
}

fn output_args() -> Vec<String> {
  vec!["output".to_string(), "-json".to_string()]
}

fn decode_outputs(stdout: &str) -> Result<Outputs, ExecuteError> {
  if stdout.trim().is_empty() {
    return Ok(Outputs::new());
  }
  let raw: BTreeMap<String, OutputValue> =
    serde_json::from_str(stdout).map_err(|e| ExecuteError::InvalidOutputs(e.to_string()))?;
  Ok(raw.into_iter().map(|(name, v)| (name, v.value)).collect())
}

#[async_trait]
impl Executor for ProcessExecutor {
  async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, ExecuteError> {
    let call = Invocation::from(&request);
    let mut logs = String::new();

    if request.action != "init" {
      let _guard = match self.plugin_cache(&request) {
        Some(path) => Some(request.locks.lock(&path).await),
        None => None,
      };
      let init = vec!["init".to_string(), "-input=false".to_string()];
      let step = self.run_step(&call, &init, &mut logs).await?;
      if step.code != 0 {
        return Ok(ExecutionOutcome {
          outputs: Outputs::new(),
          exit_code: step.code,
          logs,
        });
      }
    }

    if request.dry_run {
      request.marker.emit();
      return Ok(ExecutionOutcome {
        logs,
        ..Default::default()
      });
    }

    let step = self.run_step(&call, &action_args(&request), &mut logs).await?;
    if step.code != 0 {
      return Ok(ExecutionOutcome {
        outputs: Outputs::new(),
        exit_code: step.code,
        logs,
      });
    }

    let mut outputs = Outputs::new();
    if request.action != "destroy" {
      let step = self.run_step(&call, &output_args(), &mut logs).await?;
      if step.code == 0 {
        outputs = decode_outputs(&step.stdout)?;
      } else {
        debug!(unit = %request.unit.display(), code = step.code, "output collection failed, recording no outputs");
      }
    }

    Ok(ExecutionOutcome {
      outputs,
      exit_code: 0,
      logs,
    })
  }

  async fn read_outputs(&self, unit: &Path, environment: &BTreeMap<String, String>) -> Result<Outputs, ExecuteError> {
    let call = Invocation {
      unit,
      working_dir: unit,
      environment,
      non_interactive: true,
    };
    let mut logs = String::new();
    let step = self.run_step(&call, &output_args(), &mut logs).await?;
    if step.code != 0 {
      return Err(ExecuteError::Failed(format!("output -json exited with status {}", step.code)));
    }
    decode_outputs(&step.stdout)
  }
}
