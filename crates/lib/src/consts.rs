/// Marker file that turns a directory into a unit.
pub const UNIT_MARKER: &str = "unit.toml";

/// Marker file that turns a directory into a stack.
pub const STACK_MARKER: &str = "stack.toml";

/// Per-unit execution cache directory name, never traversed by discovery.
pub const CACHE_DIR_NAME: &str = ".stackrun-cache";

/// Directories pruned from every discovery walk.
pub const DEFAULT_EXCLUDES: &[&str] = &[CACHE_DIR_NAME, ".terraform", ".git"];

pub const DRY_RUN_MESSAGE: &str = "Dry-run mode enabled: validation complete, skipping execution";

pub const ENV_DRY_RUN: &str = "STACKRUN_DRY_RUN";
pub const ENV_PARALLELISM: &str = "STACKRUN_PARALLELISM";
pub const ENV_IGNORE_DEPENDENCY_ERRORS: &str = "STACKRUN_IGNORE_DEPENDENCY_ERRORS";
pub const ENV_TF_PATH: &str = "STACKRUN_TF_PATH";

pub const DEFAULT_TF_PATH: &str = "tofu";

/// Plugin cache shared by every unit's `init`.
pub const ENV_PLUGIN_CACHE_DIR: &str = "TF_PLUGIN_CACHE_DIR";

/// Prefix for environment variables carrying unit inputs to the IaC binary.
pub const INPUT_ENV_PREFIX: &str = "TF_VAR_";
