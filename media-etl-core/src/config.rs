//! Run configuration for ETL jobs.
//!
//! An [`EtlConfig`] is built once per process (normally from the environment,
//! then adjusted by command-line flags) and handed to every job by reference.
//! Nothing in the crate reads process-wide mutable state.

use std::time::Duration;

use crate::error::{EtlError, Result};

/// Which schema namespace a table lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaRole {
    Staging,
    Production,
}

/// Immutable job configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EtlConfig {
    pub database_url: String,
    pub staging_schema: String,
    pub production_schema: String,
    /// Redirects both staging and production writes to `local_schema`.
    pub local_mode: bool,
    pub local_schema: String,
    /// Log the statements a job would run instead of running them.
    pub dry_run: bool,
    pub max_connections: u32,
    pub statement_timeout: Duration,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost:5432/warehouse".to_string(),
            staging_schema: "staging".to_string(),
            production_schema: "public".to_string(),
            local_mode: false,
            local_schema: "sandbox".to_string(),
            dry_run: false,
            max_connections: 5,
            statement_timeout: Duration::from_secs(600),
        }
    }
}

impl EtlConfig {
    /// Build from process environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. `from_env` is this over `std::env::var`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str, default: String| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
        };

        let max_connections = match lookup("DATABASE_POOL_SIZE") {
            Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
                EtlError::Config(format!("DATABASE_POOL_SIZE must be a number, got {raw:?}"))
            })?,
            None => defaults.max_connections,
        };
        if max_connections == 0 {
            return Err(EtlError::Config(
                "DATABASE_POOL_SIZE must be at least 1".to_string(),
            ));
        }

        let statement_timeout = match lookup("ETL_STATEMENT_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(raw.trim().parse::<u64>().map_err(|_| {
                EtlError::Config(format!(
                    "ETL_STATEMENT_TIMEOUT_SECS must be a number of seconds, got {raw:?}"
                ))
            })?),
            None => defaults.statement_timeout,
        };

        Ok(Self {
            database_url: text("DATABASE_URL", defaults.database_url),
            staging_schema: text("ETL_STAGING_SCHEMA", defaults.staging_schema),
            production_schema: text("ETL_PRODUCTION_SCHEMA", defaults.production_schema),
            local_mode: parse_flag("ETL_LOCAL_MODE", lookup("ETL_LOCAL_MODE"))?
                .unwrap_or(defaults.local_mode),
            local_schema: text("ETL_LOCAL_SCHEMA", defaults.local_schema),
            dry_run: parse_flag("ETL_DRY_RUN", lookup("ETL_DRY_RUN"))?
                .unwrap_or(defaults.dry_run),
            max_connections,
            statement_timeout,
        })
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_local_mode(mut self, local_mode: bool) -> Self {
        self.local_mode = local_mode;
        self
    }

    /// Schema a table with the given role resolves to under this configuration.
    pub fn schema_for(&self, role: SchemaRole) -> &str {
        if self.local_mode {
            return &self.local_schema;
        }
        match role {
            SchemaRole::Staging => &self.staging_schema,
            SchemaRole::Production => &self.production_schema,
        }
    }
}

fn parse_flag(key: &str, raw: Option<String>) -> Result<Option<bool>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        other => Err(EtlError::Config(format!(
            "{key} must be a boolean, got {other:?}"
        ))),
    }
}
