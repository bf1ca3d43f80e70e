use anyhow::{Context, Result};

use stackrun_lib::config::EngineConfig;

use crate::output::{print_info, print_stat};

fn describe<T: ToString>(value: Option<T>) -> String {
  value.map(|v| v.to_string()).unwrap_or_else(|| "unset".to_string())
}

pub fn cmd_info() -> Result<()> {
  let config = EngineConfig::from_env().context("Invalid environment configuration")?;

  print_info(&format!("stackrun v{}", env!("CARGO_PKG_VERSION")));
  print_stat("IaC binary", &config.tf_path);
  print_stat("Dry run", &describe(config.dry_run));
  print_stat("Parallelism", &describe(config.parallelism));
  print_stat("Ignore dependency errors", &describe(config.ignore_dependency_errors));
  print_stat("Plugin cache", &describe(config.plugin_cache_dir.map(|d| d.display().to_string())));
  Ok(())
}
