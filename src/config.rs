use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{AgentError, Result};

pub const DEFAULT_NODE_CONFIG_PATH: &str = "/etc/multinic/nodes.yaml";
pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_OP_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_JOB_EXIT_DELAY_SECONDS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Indefinite polling loop.
    Service,
    /// One reconciliation pass, then exit.
    Job,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentAction {
    Configure,
    Cleanup,
}

/// Agent configuration assembled from environment variables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_name: Option<String>,
    pub run_mode: RunMode,
    pub action: AgentAction,
    pub node_config_path: PathBuf,
    pub poll_interval: Duration,
    pub max_concurrent_tasks: usize,
    pub max_retries: u32,
    pub op_timeout: Duration,
    pub job_exit_delay: Duration,
    pub complete_on_partial_failure: bool,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from a key lookup, so tests do not touch the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let node_name = get("NODE_NAME").or_else(|| get("MY_NODE_NAME"));

        let run_mode = match get("RUN_MODE").as_deref() {
            None => RunMode::Service,
            Some("service") => RunMode::Service,
            Some("job") => RunMode::Job,
            Some(other) => {
                return Err(AgentError::configuration(format!(
                    "invalid RUN_MODE value: {} (expected service or job)",
                    other
                )))
            }
        };

        let action = match get("AGENT_ACTION") {
            None => AgentAction::Configure,
            Some(value) if value.eq_ignore_ascii_case("cleanup") => AgentAction::Cleanup,
            Some(value) if value.eq_ignore_ascii_case("configure") => AgentAction::Configure,
            Some(other) => {
                return Err(AgentError::configuration(format!(
                    "invalid AGENT_ACTION value: {}",
                    other
                )))
            }
        };

        let node_config_path = get("NODE_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_NODE_CONFIG_PATH));

        let poll_interval = Duration::from_secs(parse_u64(
            get("POLL_INTERVAL_SECONDS"),
            "POLL_INTERVAL_SECONDS",
            DEFAULT_POLL_INTERVAL_SECONDS,
        )?);
        let max_concurrent_tasks = parse_u64(
            get("MAX_CONCURRENT_TASKS"),
            "MAX_CONCURRENT_TASKS",
            DEFAULT_MAX_CONCURRENT_TASKS as u64,
        )?
        .max(1) as usize;
        let max_retries = parse_u64(get("MAX_RETRIES"), "MAX_RETRIES", DEFAULT_MAX_RETRIES as u64)? as u32;
        let op_timeout = Duration::from_secs(parse_u64(
            get("OP_TIMEOUT_SECONDS"),
            "OP_TIMEOUT_SECONDS",
            DEFAULT_OP_TIMEOUT_SECONDS,
        )?);

        // Invalid delay values fall back to the default instead of
        // failing the whole run.
        let job_exit_delay = match get("JOB_EXIT_DELAY_SECONDS") {
            Some(value) => match value.parse::<u64>() {
                Ok(seconds) => Duration::from_secs(seconds),
                Err(_) => Duration::from_secs(DEFAULT_JOB_EXIT_DELAY_SECONDS),
            },
            None => Duration::from_secs(DEFAULT_JOB_EXIT_DELAY_SECONDS),
        };

        // Empty or "true" keeps partial failures permissive; any other
        // value switches to strict.
        let complete_on_partial_failure = match lookup("JOB_COMPLETE_ON_PARTIAL_FAILURE") {
            None => true,
            Some(value) => {
                let trimmed = value.trim();
                trimmed.is_empty() || trimmed.eq_ignore_ascii_case("true")
            }
        };

        Ok(Self {
            node_name,
            run_mode,
            action,
            node_config_path,
            poll_interval,
            max_concurrent_tasks,
            max_retries,
            op_timeout,
            job_exit_delay,
            complete_on_partial_failure,
        })
    }
}

fn parse_u64(value: Option<String>, key: &str, default: u64) -> Result<u64> {
    match value {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| {
            AgentError::configuration(format!("invalid {} value: {}", key, value))
        }),
    }
}
