//! Settings read from the environment.

use std::error::Error;

use actors::{DispatchMode, RunnerConfig};
use db::DbConfig;

/// Everything the binary needs to start.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db: DbConfig,
    /// `None` when this process only serves `runjob`.
    pub runner: Option<RunnerConfig>,
    pub http_addr: String,
}

impl Settings {
    /// Read the `QUEUE_JOB_*` variables.
    ///
    /// - `QUEUE_JOB_DB`: store endpoint, `memory` by default
    /// - `QUEUE_JOB_DB_NAME`: database name, `main` by default
    /// - `QUEUE_JOB_CHANNELS`: channel configuration, `root:1` by default
    /// - `QUEUE_JOB_WORKERS`: worker count, the root capacity by default
    /// - `QUEUE_JOB_DISPATCH_URL`: dispatch over HTTP to this server instead of workers
    /// - `QUEUE_JOB_RUNNER`: `0` to only execute jobs dispatched by another runner
    /// - `QUEUE_JOB_KEEP_DONE_DAYS`: delete done jobs older than this
    /// - `QUEUE_JOB_HTTP_ADDR`: listen address, `127.0.0.1:8069` by default
    pub fn from_env() -> Result<Self, Box<dyn Error + Send + Sync>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let mut db = DbConfig::from_endpoint(lookup("QUEUE_JOB_DB").as_deref().unwrap_or("memory"));
        if let Some(name) = lookup("QUEUE_JOB_DB_NAME") {
            db = db.with_database(name);
        }

        let runner_enabled = !matches!(lookup("QUEUE_JOB_RUNNER").as_deref(), Some("0" | "false"));
        let runner = if runner_enabled {
            let mut config = RunnerConfig::new(db.database.clone());
            if let Some(channels) = lookup("QUEUE_JOB_CHANNELS") {
                config = config.with_channels(channels);
            }
            if let Some(workers) = lookup("QUEUE_JOB_WORKERS") {
                config = config.with_workers(workers.parse()?);
            }
            if let Some(base_url) = lookup("QUEUE_JOB_DISPATCH_URL") {
                config = config.with_dispatch(DispatchMode::Http { base_url });
            }
            if let Some(days) = lookup("QUEUE_JOB_KEEP_DONE_DAYS") {
                let keep = chrono::TimeDelta::try_days(days.parse()?)
                    .ok_or_else(|| format!("QUEUE_JOB_KEEP_DONE_DAYS out of range: {}", days))?;
                config = config.with_keep_done(keep);
            }
            Some(config)
        } else {
            None
        };

        Ok(Self {
            db,
            runner,
            http_addr: lookup("QUEUE_JOB_HTTP_ADDR").unwrap_or_else(|| "127.0.0.1:8069".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, Box<dyn Error + Send + Sync>> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() -> Result<(), Box<dyn Error + Send + Sync>> {
        let settings = settings(&[])?;
        assert_eq!(settings.db.endpoint, "mem://");
        assert_eq!(settings.http_addr, "127.0.0.1:8069");
        let runner = settings.runner.ok_or("runner expected")?;
        assert_eq!(runner.channels, "root:1");
        assert_eq!(runner.db_name, "main");
        assert_eq!(runner.dispatch, DispatchMode::Workers);
        Ok(())
    }

    #[test]
    fn test_http_dispatch_and_workers() -> Result<(), Box<dyn Error + Send + Sync>> {
        let settings = settings(&[
            ("QUEUE_JOB_CHANNELS", "root:4,root.mail:2"),
            ("QUEUE_JOB_WORKERS", "8"),
            ("QUEUE_JOB_DISPATCH_URL", "http://localhost:8069"),
            ("QUEUE_JOB_DB_NAME", "erp"),
        ])?;
        let runner = settings.runner.ok_or("runner expected")?;
        assert_eq!(runner.channels, "root:4,root.mail:2");
        assert_eq!(runner.workers, Some(8));
        assert_eq!(runner.db_name, "erp");
        assert_eq!(
            runner.dispatch,
            DispatchMode::Http {
                base_url: "http://localhost:8069".to_string()
            }
        );
        Ok(())
    }

    #[test]
    fn test_executor_only_and_bad_numbers() {
        let executor_only = settings(&[("QUEUE_JOB_RUNNER", "0")]);
        assert!(executor_only.is_ok_and(|s| s.runner.is_none()));

        assert!(settings(&[("QUEUE_JOB_WORKERS", "many")]).is_err());
    }

    #[test]
    fn test_keep_done_days() -> Result<(), Box<dyn Error + Send + Sync>> {
        let runner = settings(&[("QUEUE_JOB_KEEP_DONE_DAYS", "7")])?
            .runner
            .ok_or("runner expected")?;
        assert_eq!(runner.keep_done, Some(chrono::TimeDelta::days(7)));

        assert!(settings(&[("QUEUE_JOB_KEEP_DONE_DAYS", "9223372036854775807")]).is_err());
        Ok(())
    }
}
