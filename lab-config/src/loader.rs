//! Loading, environment overrides, validation, and conversion into the
//! component configurations.

use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use lab_kernel::{QueryConfig, SupervisorConfig};
use lab_policy::SecurityPolicy;
use lab_registry::RegistryConfig;
use tracing::debug;

use crate::schema::LabConfig;

/// Environment variable overriding `data_dir`.
pub const ENV_DATA_DIR: &str = "DATALAB_DATA_DIR";
/// Environment variable overriding `logging.level`.
pub const ENV_LOG_LEVEL: &str = "DATALAB_LOG_LEVEL";
/// Environment variable overriding `limits.timeout_secs`.
pub const ENV_TIMEOUT_SECS: &str = "DATALAB_TIMEOUT_SECS";
/// Environment variable overriding `limits.memory_limit_bytes`.
pub const ENV_MEMORY_LIMIT_BYTES: &str = "DATALAB_MEMORY_LIMIT_BYTES";
/// Environment variable overriding `policy.allowed_paths`, using the
/// platform path-list separator.
pub const ENV_ALLOWED_PATHS: &str = "DATALAB_ALLOWED_PATHS";
/// Environment variable overriding `limits.max_concurrency`.
pub const ENV_MAX_CONCURRENCY: &str = "DATALAB_MAX_CONCURRENCY";

impl LabConfig {
    /// Reads a TOML file. Environment overrides are applied separately.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Parses TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed TOML, unknown keys, or mistyped values.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Loads `path` when given (defaults otherwise), applies environment
    /// overrides, and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `DATALAB_*` overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric override does not parse.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| {
            std::env::var_os(key).map(|value| value.to_string_lossy().into_owned())
        })
    }

    /// Applies overrides from an arbitrary lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric override does not parse.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = level.trim().to_ascii_lowercase();
        }
        if let Some(value) = lookup(ENV_TIMEOUT_SECS) {
            self.limits.timeout_secs = parse_number(ENV_TIMEOUT_SECS, &value)?;
        }
        if let Some(value) = lookup(ENV_MEMORY_LIMIT_BYTES) {
            self.limits.memory_limit_bytes = parse_number(ENV_MEMORY_LIMIT_BYTES, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_CONCURRENCY) {
            self.limits.max_concurrency = parse_number(ENV_MAX_CONCURRENCY, &value)?;
        }
        if let Some(value) = lookup(ENV_ALLOWED_PATHS) {
            self.policy.allowed_paths = std::env::split_paths(&value)
                .filter(|path| !path.as_os_str().is_empty())
                .collect();
        }
        debug!(data_dir = %self.data_dir.display(), "configuration overrides applied");
        Ok(())
    }

    /// Rejects inconsistent settings.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        let storage = &self.storage;
        if storage.in_memory_limit_bytes >= storage.columnar_limit_bytes {
            bail!(
                "storage.in_memory_limit_bytes ({}) must be below storage.columnar_limit_bytes ({})",
                storage.in_memory_limit_bytes,
                storage.columnar_limit_bytes
            );
        }

        let limits = &self.limits;
        if limits.timeout_secs == 0 {
            bail!("limits.timeout_secs cannot be 0");
        }
        if limits.query_timeout_secs == 0 {
            bail!("limits.query_timeout_secs cannot be 0");
        }
        if limits.max_concurrency == 0 {
            bail!("limits.max_concurrency cannot be 0");
        }
        if limits.max_rows == 0 {
            bail!("limits.max_rows cannot be 0");
        }
        if limits.max_output_bytes == 0 || limits.max_response_bytes < limits.max_output_bytes {
            bail!(
                "limits.max_response_bytes ({}) must be at least limits.max_output_bytes ({}), which cannot be 0",
                limits.max_response_bytes,
                limits.max_output_bytes
            );
        }

        if !lab_telemetry::is_valid_level(&self.logging.level) {
            bail!(
                "invalid log level '{}'; expected one of {}",
                self.logging.level,
                lab_telemetry::LOG_LEVELS.join(", ")
            );
        }
        if self.data_dir.as_os_str().is_empty() {
            bail!("data_dir cannot be empty");
        }
        Ok(())
    }

    /// Worker memory ceiling, or `None` when disabled.
    #[must_use]
    pub fn memory_limit(&self) -> Option<u64> {
        Some(self.limits.memory_limit_bytes).filter(|bytes| *bytes > 0)
    }

    /// Registry configuration.
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig::new(&self.data_dir).with_thresholds(
            self.storage.in_memory_limit_bytes,
            self.storage.columnar_limit_bytes,
        )
    }

    /// Security policy with allow-listed paths made absolute.
    ///
    /// # Errors
    ///
    /// Returns an error if a path cannot be made absolute or the policy is
    /// rejected.
    pub fn security_policy(&self) -> anyhow::Result<SecurityPolicy> {
        let mut builder = SecurityPolicy::builder()
            .allow_capabilities(&self.policy.capabilities)
            .deny_identifiers(
                lab_policy::DEFAULT_DENIED_IDENTIFIERS
                    .iter()
                    .map(|name| (*name).to_owned())
                    .chain(self.policy.denied_identifiers.iter().cloned()),
            )
            .timeout(Duration::from_secs(self.limits.timeout_secs))
            .memory_limit(self.memory_limit());
        for path in &self.policy.allowed_paths {
            let absolute = std::path::absolute(path)
                .with_context(|| format!("cannot resolve allowed path {}", path.display()))?;
            builder = builder.allow_path(absolute);
        }
        builder.build().map_err(|err| anyhow!(err))
    }

    /// Supervisor configuration. `current_exe` is used when no worker
    /// program is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the concurrency limit is zero.
    pub fn supervisor_config(&self, current_exe: &Path) -> anyhow::Result<SupervisorConfig> {
        let program = self
            .worker
            .program
            .clone()
            .unwrap_or_else(|| current_exe.to_path_buf());
        let max_concurrency = NonZeroUsize::new(self.limits.max_concurrency)
            .ok_or_else(|| anyhow!("limits.max_concurrency cannot be 0"))?;
        let mut config = SupervisorConfig::new(program)
            .with_args(self.worker.args.iter().cloned())
            .with_max_concurrency(max_concurrency)
            .with_default_timeout(Duration::from_secs(self.limits.timeout_secs))
            .with_memory_limit(self.memory_limit())
            .with_max_output_bytes(self.limits.max_output_bytes)
            .with_max_response_bytes(self.limits.max_response_bytes);
        if let Some(root) = &self.worker.workspace_root {
            config = config.with_workspace_root(root);
        }
        Ok(config)
    }

    /// Query engine configuration.
    #[must_use]
    pub fn query_config(&self) -> QueryConfig {
        QueryConfig {
            max_rows: self.limits.max_rows,
            timeout: Duration::from_secs(self.limits.query_timeout_secs),
        }
    }
}

fn parse_number<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a non-negative integer, got '{value}'"))
}
