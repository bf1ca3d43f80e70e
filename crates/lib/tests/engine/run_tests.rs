use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use stackrun_lib::component::UnitStatus;
use stackrun_lib::config::{EngineConfig, RunOptions};
use stackrun_lib::consts::ENV_DRY_RUN;
use stackrun_lib::discovery::{Discoverer, DiscoveryOptions};
use stackrun_lib::graph::GraphBuilder;
use stackrun_lib::runner::{RunEvent, StackRunner, UnitError, find_stack_in_subfolders};
use tempfile::TempDir;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use super::common::{FakeExecutor, canonical, drain, dry_run_markers, unit};

fn runner(root: &Path, executor: Arc<FakeExecutor>, config: EngineConfig) -> StackRunner {
  find_stack_in_subfolders(root, &DiscoveryOptions::default(), executor, config).unwrap()
}

/// Runner over the unit at `dir` alone, dependencies outside it allowed.
fn single_unit_runner(dir: &Path, executor: Arc<FakeExecutor>) -> StackRunner {
  let discoverer = Discoverer::new(DiscoveryOptions {
    max_depth: Some(0),
    ..Default::default()
  });
  StackRunner::discover(
    dir,
    &discoverer,
    GraphBuilder::new().allow_external(true),
    executor,
    EngineConfig::default(),
  )
  .unwrap()
}

fn status(summary: &stackrun_lib::RunSummary, path: &Path) -> UnitStatus {
  summary.unit(path).unwrap().status
}

#[tokio::test]
async fn dry_run_plan_marks_each_unit_once_in_dependency_order() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  let a = unit(&root, "unit-a", "");
  let b = unit(&root, "unit-b", r#"dependencies = ["../unit-a"]"#);

  let executor = Arc::new(FakeExecutor::new());
  let (tx, mut rx) = mpsc::unbounded_channel();
  let mut runner = runner(&root, executor.clone(), EngineConfig::default()).with_events(tx);

  let options = RunOptions {
    dry_run: Some(true),
    ..Default::default()
  };
  let summary = runner
    .run(CancellationToken::new(), "plan", &[], &options)
    .await
    .unwrap();

  assert_eq!(summary.succeeded(), 2);
  assert_eq!(summary.failed(), 0);
  assert_eq!(summary.skipped(), 0);
  assert!(summary.error().is_none());

  let events = drain(&mut rx);
  assert_eq!(dry_run_markers(&events), vec![a.clone(), b.clone()]);
  assert!(executor.request(&a).unwrap().dry_run);
  assert!(matches!(events.last(), Some(RunEvent::RunFinished { canceled: false, .. })));

  let a_finished = events
    .iter()
    .position(|e| matches!(e, RunEvent::UnitFinished { unit, .. } if *unit == a))
    .unwrap();
  let b_started = events
    .iter()
    .position(|e| matches!(e, RunEvent::UnitStarted { unit } if *unit == b))
    .unwrap();
  assert!(a_finished < b_started);
}

#[tokio::test]
async fn environment_override_enables_dry_run() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  let a = unit(&root, "unit-a", "");
  let b = unit(&root, "unit-b", r#"dependencies = ["../unit-a"]"#);

  let config = EngineConfig::from_lookup(|var| (var == ENV_DRY_RUN).then(|| "true".to_string())).unwrap();
  let executor = Arc::new(FakeExecutor::new());
  let (tx, mut rx) = mpsc::unbounded_channel();
  let mut runner = runner(&root, executor.clone(), config).with_events(tx);

  let summary = runner
    .run(CancellationToken::new(), "plan", &[], &RunOptions::default())
    .await
    .unwrap();

  assert_eq!(summary.succeeded(), 2);
  assert_eq!(dry_run_markers(&drain(&mut rx)), vec![a.clone(), b]);
  assert!(executor.request(&a).unwrap().dry_run);
}

#[tokio::test]
async fn explicit_option_overrides_environment_dry_run() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  let a = unit(&root, "unit-a", "");

  let config = EngineConfig::from_lookup(|var| (var == ENV_DRY_RUN).then(|| "1".to_string())).unwrap();
  let executor = Arc::new(FakeExecutor::new());
  let mut runner = runner(&root, executor.clone(), config);

  let options = RunOptions {
    dry_run: Some(false),
    ..Default::default()
  };
  runner.run(CancellationToken::new(), "plan", &[], &options).await.unwrap();

  assert!(!executor.request(&a).unwrap().dry_run);
}

#[tokio::test]
async fn failure_skips_dependents_but_not_independent_units() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  let a = unit(&root, "a", "");
  let b = unit(&root, "b", r#"dependencies = ["../a"]"#);
  let c = unit(&root, "c", "");
  let d = unit(&root, "d", r#"dependencies = ["../b"]"#);

  let executor = Arc::new(FakeExecutor::new().exit(&a, 1));
  let mut runner = runner(&root, executor.clone(), EngineConfig::default());

  let summary = runner
    .run(CancellationToken::new(), "apply", &[], &RunOptions::default())
    .await
    .unwrap();

  assert_eq!(status(&summary, &a), UnitStatus::Failed);
  assert_eq!(status(&summary, &b), UnitStatus::Skipped);
  assert_eq!(status(&summary, &c), UnitStatus::Succeeded);
  assert_eq!(status(&summary, &d), UnitStatus::Skipped);
  assert!(matches!(
    &summary.unit(&b).unwrap().error,
    Some(UnitError::DependencyFailed(dep)) if *dep == a
  ));
  assert!(matches!(
    &summary.unit(&d).unwrap().error,
    Some(UnitError::DependencyFailed(dep)) if *dep == b
  ));

  let started = executor.started();
  assert!(!started.contains(&b));
  assert!(!started.contains(&d));

  let failure = summary.error().unwrap();
  assert_eq!(failure.failures.len(), 1);
  assert_eq!(failure.failures[0].0, a);
  assert!(failure.to_string().contains("apply exited with status 1"));
  assert!(failure.to_string().ends_with("Succeeded: 1, Failed: 1, Skipped: 2, Canceled: 0"));
}

#[tokio::test]
async fn ignore_dependency_errors_still_runs_dependents() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  let a = unit(&root, "a", "");
  let b = unit(&root, "b", r#"dependencies = ["../a"]"#);

  let executor = Arc::new(FakeExecutor::new().error(&a, "backend unreachable"));
  let mut runner = runner(&root, executor.clone(), EngineConfig::default());

  let options = RunOptions {
    ignore_dependency_errors: Some(true),
    ..Default::default()
  };
  let summary = runner.run(CancellationToken::new(), "plan", &[], &options).await.unwrap();

  assert_eq!(status(&summary, &a), UnitStatus::Failed);
  assert_eq!(status(&summary, &b), UnitStatus::Succeeded);
  assert_eq!(executor.started(), vec![a.clone(), b]);
  assert!(summary.error().unwrap().to_string().contains("backend unreachable"));
}

#[tokio::test]
async fn running_units_never_exceed_max_concurrency() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  for i in 0..6 {
    unit(&root, &format!("u{i}"), "");
  }

  let executor = Arc::new(FakeExecutor::new().delay(Duration::from_millis(20)));
  let mut runner = runner(&root, executor.clone(), EngineConfig::default());

  let options = RunOptions {
    max_concurrency: Some(2),
    ..Default::default()
  };
  let summary = runner.run(CancellationToken::new(), "plan", &[], &options).await.unwrap();

  assert_eq!(summary.succeeded(), 6);
  assert!(executor.max_active() <= 2);
  assert_eq!(executor.started().len(), 6);
}

#[tokio::test]
async fn single_worker_runs_in_topological_order() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  let app = unit(&root, "app", r#"dependencies = ["../db"]"#);
  let db = unit(&root, "db", r#"dependencies = ["../vpc"]"#);
  let vpc = unit(&root, "vpc", "");

  let executor = Arc::new(FakeExecutor::new());
  let mut runner = runner(&root, executor.clone(), EngineConfig::default());

  let options = RunOptions {
    max_concurrency: Some(1),
    ..Default::default()
  };
  runner.run(CancellationToken::new(), "apply", &[], &options).await.unwrap();

  assert_eq!(executor.started(), vec![vpc, db, app]);
  assert_eq!(executor.max_active(), 1);
}

#[tokio::test]
async fn cancellation_lets_running_unit_finish_and_cancels_the_rest() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  let a = unit(&root, "unit-a", "");
  let b = unit(&root, "unit-b", r#"dependencies = ["../unit-a"]"#);

  let started = Arc::new(Notify::new());
  let release = Arc::new(Notify::new());
  let executor = Arc::new(FakeExecutor::new().gate(&a, started.clone(), release.clone()));
  let mut runner = runner(&root, executor.clone(), EngineConfig::default());

  let token = CancellationToken::new();
  let control = {
    let token = token.clone();
    async move {
      started.notified().await;
      token.cancel();
      release.notify_one();
    }
  };

  let options = RunOptions::default();
  let (summary, ()) = tokio::time::timeout(
    Duration::from_secs(5),
    async { tokio::join!(runner.run(token.clone(), "apply", &[], &options), control) },
  )
  .await
  .expect("run did not return after cancellation");
  let summary = summary.unwrap();

  assert_eq!(status(&summary, &a), UnitStatus::Succeeded);
  assert_eq!(status(&summary, &b), UnitStatus::Canceled);
  assert!(summary.canceled);
  assert_eq!(executor.started(), vec![a]);

  let failure = summary.error().unwrap();
  assert!(failure.canceled);
  assert!(failure.failures.is_empty());
}

#[tokio::test]
async fn pre_canceled_run_starts_nothing() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  unit(&root, "a", "");
  unit(&root, "b", "");

  let executor = Arc::new(FakeExecutor::new());
  let mut runner = runner(&root, executor.clone(), EngineConfig::default());

  let token = CancellationToken::new();
  token.cancel();
  let summary = runner.run(token, "plan", &[], &RunOptions::default()).await.unwrap();

  assert_eq!(summary.canceled_units(), 2);
  assert!(executor.started().is_empty());
  assert!(!summary.is_success());
}

#[tokio::test]
async fn timeout_fails_only_the_slow_unit() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  let slow = unit(&root, "slow", "");
  let fast = unit(&root, "fast", "");

  let executor = Arc::new(FakeExecutor::new().hang(&slow));
  let mut runner = runner(&root, executor.clone(), EngineConfig::default());

  let options = RunOptions {
    per_unit_timeout: Some(Duration::from_millis(50)),
    ..Default::default()
  };
  let summary = runner.run(CancellationToken::new(), "plan", &[], &options).await.unwrap();

  assert_eq!(status(&summary, &fast), UnitStatus::Succeeded);
  assert_eq!(status(&summary, &slow), UnitStatus::Failed);
  assert!(matches!(summary.unit(&slow).unwrap().error, Some(UnitError::Timeout(_))));
}

#[tokio::test]
async fn outputs_flow_into_dependent_inputs() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  let vpc = unit(&root, "vpc", "");
  let app = unit(
    &root,
    "app",
    r#"
      [inputs]
      region = "eu-west-1"
      zones = ["a", "b"]
      vpc_id = { from = "../vpc", output = "vpc_id" }
    "#,
  );

  let executor = Arc::new(FakeExecutor::new().outputs(&vpc, json!({ "vpc_id": "vpc-123" })));
  let mut runner = runner(&root, executor.clone(), EngineConfig::default());

  let mut options = RunOptions::default();
  options.environment.insert("AWS_PROFILE".to_string(), "prod".to_string());
  let summary = runner.run(CancellationToken::new(), "apply", &[], &options).await.unwrap();
  assert!(summary.is_success());

  let request = executor.request(&app).unwrap();
  assert_eq!(request.environment["TF_VAR_vpc_id"], "vpc-123");
  assert_eq!(request.environment["TF_VAR_region"], "eu-west-1");
  assert_eq!(request.environment["TF_VAR_zones"], r#"["a","b"]"#);
  assert_eq!(request.environment["AWS_PROFILE"], "prod");

  let recorded = runner.components().by_path(&vpc).unwrap().as_unit().unwrap();
  assert_eq!(recorded.execution.outputs["vpc_id"], json!("vpc-123"));
  assert!(executor.reads().is_empty());
}

#[tokio::test]
async fn single_unit_run_reads_outputs_of_dependency_outside_the_run() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  let vpc = unit(&root, "vpc", "");
  let app = unit(
    &root,
    "app",
    r#"
      [inputs]
      vpc_id = { from = "../vpc", output = "vpc_id" }
    "#,
  );

  let executor = Arc::new(FakeExecutor::new().state(&vpc, json!({ "vpc_id": "vpc-123" })));
  let mut runner = single_unit_runner(&app, executor.clone());

  let summary = runner
    .run(CancellationToken::new(), "apply", &[], &RunOptions::default())
    .await
    .unwrap();

  assert!(summary.is_success());
  assert_eq!(summary.total(), 1);
  assert_eq!(executor.started(), vec![app.clone()]);
  assert_eq!(executor.request(&app).unwrap().environment["TF_VAR_vpc_id"], "vpc-123");
  assert_eq!(executor.reads(), vec![vpc]);
}

#[tokio::test]
async fn single_unit_run_fails_when_dependency_has_no_recorded_outputs() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  unit(&root, "vpc", "");
  let app = unit(
    &root,
    "app",
    r#"
      [inputs]
      vpc_id = { from = "../vpc", output = "vpc_id" }
    "#,
  );

  let executor = Arc::new(FakeExecutor::new());
  let mut runner = single_unit_runner(&app, executor.clone());

  let summary = runner
    .run(CancellationToken::new(), "apply", &[], &RunOptions::default())
    .await
    .unwrap();

  assert_eq!(status(&summary, &app), UnitStatus::Failed);
  assert!(matches!(
    &summary.unit(&app).unwrap().error,
    Some(UnitError::MissingOutput { output, .. }) if output == "vpc_id"
  ));
  assert!(executor.request(&app).is_none());
}

#[tokio::test]
async fn missing_output_fails_the_dependent() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  unit(&root, "vpc", "");
  let app = unit(
    &root,
    "app",
    r#"
      [inputs]
      vpc_id = { from = "../vpc", output = "vpc_id" }
    "#,
  );

  let executor = Arc::new(FakeExecutor::new());
  let mut runner = runner(&root, executor.clone(), EngineConfig::default());

  let summary = runner
    .run(CancellationToken::new(), "apply", &[], &RunOptions::default())
    .await
    .unwrap();

  assert_eq!(status(&summary, &app), UnitStatus::Failed);
  assert!(matches!(
    &summary.unit(&app).unwrap().error,
    Some(UnitError::MissingOutput { output, .. }) if output == "vpc_id"
  ));
  assert!(executor.request(&app).is_none());
}

#[tokio::test]
async fn missing_output_is_tolerated_in_dry_run() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  unit(&root, "vpc", "");
  let app = unit(
    &root,
    "app",
    r#"
      [inputs]
      vpc_id = { from = "../vpc", output = "vpc_id" }
    "#,
  );

  let executor = Arc::new(FakeExecutor::new());
  let mut runner = runner(&root, executor.clone(), EngineConfig::default());

  let options = RunOptions {
    dry_run: Some(true),
    ..Default::default()
  };
  let summary = runner.run(CancellationToken::new(), "plan", &[], &options).await.unwrap();

  assert_eq!(summary.succeeded(), 2);
  assert!(!executor.request(&app).unwrap().environment.contains_key("TF_VAR_vpc_id"));
}

#[tokio::test]
async fn include_filter_pulls_in_dependencies() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  let app = unit(&root, "app", r#"dependencies = ["../vpc"]"#);
  let other = unit(&root, "other", "");
  let vpc = unit(&root, "vpc", "");

  let executor = Arc::new(FakeExecutor::new());
  let mut runner = runner(&root, executor.clone(), EngineConfig::default());

  let options = RunOptions {
    include: vec!["app".to_string()],
    ..Default::default()
  };
  let summary = runner.run(CancellationToken::new(), "plan", &[], &options).await.unwrap();

  assert_eq!(summary.total(), 2);
  assert_eq!(executor.started(), vec![vpc, app]);
  assert!(summary.unit(&other).is_none());
}

#[tokio::test]
async fn excluded_dependency_still_runs_for_ordering() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  let app = unit(&root, "app", r#"dependencies = ["../vpc"]"#);
  let vpc = unit(&root, "vpc", "");

  let executor = Arc::new(FakeExecutor::new());
  let mut runner = runner(&root, executor.clone(), EngineConfig::default());

  let options = RunOptions {
    exclude: vec!["vpc".to_string()],
    ..Default::default()
  };
  runner.run(CancellationToken::new(), "plan", &[], &options).await.unwrap();

  assert_eq!(executor.started(), vec![vpc, app]);
}

#[tokio::test]
async fn extra_args_are_forwarded_verbatim() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  let a = unit(&root, "a", "");

  let executor = Arc::new(FakeExecutor::new());
  let mut runner = runner(&root, executor.clone(), EngineConfig::default());

  let extra = vec!["-lock=false".to_string(), "-refresh=false".to_string()];
  runner
    .run(CancellationToken::new(), "plan", &extra, &RunOptions::default())
    .await
    .unwrap();

  let request = executor.request(&a).unwrap();
  assert_eq!(request.action, "plan");
  assert_eq!(request.extra_args, extra);
  assert_eq!(request.working_dir, a);
}

#[tokio::test]
async fn runner_can_be_reused_across_runs() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  let a = unit(&root, "a", "");

  let executor = Arc::new(FakeExecutor::new().exit(&a, 2));
  let mut runner = runner(&root, executor.clone(), EngineConfig::default());

  let first = runner
    .run(CancellationToken::new(), "plan", &[], &RunOptions::default())
    .await
    .unwrap();
  assert_eq!(first.failed(), 1);

  let options = RunOptions {
    dry_run: Some(true),
    ..Default::default()
  };
  let second = runner.run(CancellationToken::new(), "plan", &[], &options).await.unwrap();
  assert_eq!(second.succeeded(), 1);
  assert!(second.unit(&a).unwrap().error.is_none());
}

#[tokio::test]
async fn empty_action_is_rejected() {
  let temp = TempDir::new().unwrap();
  let root = canonical(temp.path());
  unit(&root, "a", "");

  let mut runner = runner(&root, Arc::new(FakeExecutor::new()), EngineConfig::default());
  assert!(runner.run(CancellationToken::new(), " ", &[], &RunOptions::default()).await.is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn process_executor_dry_run_produces_no_state() {
  use stackrun_lib::runner::ProcessExecutor;

  use super::common::{fake_tf, fake_tf_calls};

  let temp = TempDir::new().unwrap();
  let bin = TempDir::new().unwrap();
  let root = canonical(temp.path());
  let a = unit(&root, "unit-a", "");
  let b = unit(&root, "unit-b", r#"dependencies = ["../unit-a"]"#);
  let script = fake_tf(bin.path());

  let mut runner = find_stack_in_subfolders(
    &root,
    &DiscoveryOptions::default(),
    Arc::new(ProcessExecutor::new(script.to_string_lossy())),
    EngineConfig::default(),
  )
  .unwrap();

  let options = RunOptions {
    dry_run: Some(true),
    ..Default::default()
  };
  let summary = runner.run(CancellationToken::new(), "apply", &[], &options).await.unwrap();

  assert_eq!(summary.succeeded(), 2);
  assert!(!a.join("state.json").exists());
  assert!(!b.join("state.json").exists());
  let calls = fake_tf_calls(bin.path());
  assert_eq!(calls.len(), 2);
  assert!(calls.iter().all(|c| c.ends_with(" init -input=false")));
}
