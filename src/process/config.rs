use std::{collections::BTreeMap, collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::{
    spawn::{SpawnSpec, StdioMode},
    ProcessId,
};

const DEFAULT_KILL_SIGNAL: &str = "SIGTERM";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("a process configuration needs a non-empty `command`")]
    MissingCommand,

    #[error("malformed process configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How to launch a process and how to keep it alive.
///
/// Deserializes from camelCase keys, so a JSON document such as
/// `{"command": "node", "args": ["timer.js"], "restartLimit": 3}` works as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Overrides applied on top of the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub stdio: StdioMode,
    /// Whether `start` on a started process cycles it through `restarting`.
    #[serde(default = "default_restart")]
    pub restart: bool,
    /// Crashes tolerated inside the restart window. `None` is unlimited.
    #[serde(default)]
    pub restart_limit: Option<u32>,
    /// Length of the crash-counting window in milliseconds. `0`/`None` disables counting.
    #[serde(default, rename = "restartWindow")]
    pub restart_window_ms: Option<u64>,
    /// Signals sent, in order, to stop the process. Empty means `SIGTERM`.
    #[serde(default, rename = "killSignal", deserialize_with = "one_or_many")]
    pub kill_signals: Vec<String>,
    /// Used by bulk setup: start immediately instead of only registering.
    #[serde(default)]
    pub start: bool,
}

fn default_restart() -> bool {
    true
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(signal) => vec![signal],
        OneOrMany::Many(signals) => signals,
    })
}

impl ProcessConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            stdio: StdioMode::default(),
            restart: default_restart(),
            restart_limit: None,
            restart_window_ms: None,
            kill_signals: Vec::new(),
            start: false,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a whole `{ "<id>": { ...config } }` document for bulk setup.
    pub fn setup_from_json(json: &str) -> Result<BTreeMap<ProcessId, Self>, ConfigError> {
        let configs: BTreeMap<ProcessId, Self> = serde_json::from_str(json)?;
        for config in configs.values() {
            config.validate()?;
        }
        Ok(configs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::MissingCommand);
        }
        Ok(())
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<S: Into<String>, I: IntoIterator<Item = S>>(mut self, args: I) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_stdio(mut self, stdio: StdioMode) -> Self {
        self.stdio = stdio;
        self
    }

    pub fn with_restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_restart_limit(mut self, limit: u32) -> Self {
        self.restart_limit = Some(limit);
        self
    }

    pub fn with_restart_window(mut self, window: Duration) -> Self {
        self.restart_window_ms = Some(window.as_millis() as u64);
        self
    }

    pub fn with_kill_signal(mut self, signal: impl Into<String>) -> Self {
        self.kill_signals.push(signal.into());
        self
    }

    pub fn with_start(mut self, start: bool) -> Self {
        self.start = start;
        self
    }

    /// The crash-counting window, if one is active.
    pub fn restart_window(&self) -> Option<Duration> {
        self.restart_window_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn kill_signals(&self) -> Vec<&str> {
        if self.kill_signals.is_empty() {
            vec![DEFAULT_KILL_SIGNAL]
        } else {
            self.kill_signals.iter().map(String::as_str).collect()
        }
    }

    pub(crate) fn spawn_spec(&self) -> SpawnSpec {
        SpawnSpec {
            command: self.command.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            stdio: self.stdio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config = ProcessConfig::from_json(r#"{"command": "node"}"#).unwrap();
        assert!(config.restart);
        assert!(!config.start);
        assert_eq!(config.stdio, StdioMode::Inherit);
        assert_eq!(config.restart_limit, None);
        assert_eq!(config.restart_window(), None);
        assert_eq!(config.kill_signals(), vec!["SIGTERM"]);
    }

    #[test]
    fn test_camel_case_fields() {
        let config = ProcessConfig::from_json(
            r#"{
                "command": "node",
                "args": ["timer.js"],
                "cwd": "./scripts",
                "stdio": "pipe",
                "restart": false,
                "restartLimit": 10,
                "restartWindow": 1000,
                "killSignal": ["SIGINT", "SIGKILL"],
                "start": true
            }"#,
        )
        .unwrap();
        assert_eq!(config.args, vec!["timer.js"]);
        assert_eq!(config.cwd, Some(PathBuf::from("./scripts")));
        assert_eq!(config.stdio, StdioMode::Pipe);
        assert!(!config.restart);
        assert_eq!(config.restart_limit, Some(10));
        assert_eq!(config.restart_window(), Some(Duration::from_secs(1)));
        assert_eq!(config.kill_signals(), vec!["SIGINT", "SIGKILL"]);
        assert!(config.start);
    }

    #[test]
    fn test_single_kill_signal() {
        let config =
            ProcessConfig::from_json(r#"{"command": "node", "killSignal": "SIGINT"}"#).unwrap();
        assert_eq!(config.kill_signals(), vec!["SIGINT"]);
    }

    #[test]
    fn test_zero_window_disables_counting() {
        let config = ProcessConfig::new("node").with_restart_window(Duration::ZERO);
        assert_eq!(config.restart_window(), None);
    }

    #[test]
    fn test_missing_command_is_rejected() {
        assert!(matches!(
            ProcessConfig::from_json(r#"{"command": ""}"#),
            Err(ConfigError::MissingCommand)
        ));
        assert!(matches!(
            ProcessConfig::from_json(r#"{"args": []}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_setup_document() {
        let configs = ProcessConfig::setup_from_json(
            r#"{
                "b": {"command": "node", "start": true},
                "a": {"command": "node"}
            }"#,
        )
        .unwrap();
        assert_eq!(configs.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(configs["b"].start);
    }
}
