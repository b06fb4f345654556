// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Supervisor configuration.
//!
//! A [`SupervisorConfig`] describes one logical supervisor: what program to
//! run, how many copies, how aggressively to respawn crashed copies and which
//! paths trigger a rolling restart. Unknown keys are kept verbatim in
//! [`SupervisorConfig::extra`] so callers can attach their own fields
//! (a `port`, a feature flag, ...) that end up in every worker's state bag and
//! in the serialized configuration handed to each child.
//!
//! Configuration can come from a YAML or JSON file, from the `HERD_CONFIG`
//! environment variable (this is how a spawned child self-configures) or be
//! built programmatically.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable carrying the JSON-serialized configuration into
/// every spawned child.
pub const CONFIG_ENV_VAR: &str = "HERD_CONFIG";

/// Environment variable overriding the default run directory.
pub const HOME_ENV_VAR: &str = "HERD_HOME";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("could not determine a run directory (set {HOME_ENV_VAR})")]
    NoRunDir,
}

/// How a child's standard streams are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdioMode {
    /// Capture stdout/stderr line by line and re-log them.
    #[default]
    Pipe,
    /// Share the supervisor's own streams.
    Inherit,
    /// Discard all output.
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// Logical supervisor name; the control socket path is derived from it.
    #[serde(default)]
    pub name: String,

    /// Program (or script handed to `interpreter`) to supervise.
    pub entry: PathBuf,

    /// Optional interpreter the entry is passed to (`sh`, `node`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Number of workers started by `exec`.
    #[serde(default = "default_instances")]
    pub instances: usize,

    /// Automatic respawns allowed before a crash-looping worker is put to sleep.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Uptime after which a worker is considered healthy and its crash
    /// counter is reset.
    #[serde(default = "default_min_uptime", with = "humantime_serde")]
    pub min_uptime: Duration,

    /// Grace period between SIGTERM and SIGKILL when stopping a worker.
    #[serde(default = "default_kill_timeout", with = "humantime_serde")]
    pub kill_timeout: Duration,

    #[serde(default)]
    pub stdio: StdioMode,

    /// Paths whose changes trigger a rolling restart.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub watch: Vec<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_dir: Option<PathBuf>,

    /// Lifecycle event name (`start`, `crash`, ...) to shell command.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hooks: BTreeMap<String, String>,

    /// Arbitrary caller-set fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const fn default_instances() -> usize {
    1
}

const fn default_max_restarts() -> u32 {
    10
}

const fn default_min_uptime() -> Duration {
    Duration::from_secs(1)
}

const fn default_kill_timeout() -> Duration {
    Duration::from_secs(5)
}

impl SupervisorConfig {
    pub fn new(entry: impl Into<PathBuf>) -> Self {
        let mut config = Self {
            name: String::new(),
            entry: entry.into(),
            interpreter: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            instances: default_instances(),
            max_restarts: default_max_restarts(),
            min_uptime: default_min_uptime(),
            kill_timeout: default_kill_timeout(),
            stdio: StdioMode::default(),
            watch: Vec::new(),
            run_dir: None,
            hooks: BTreeMap::new(),
            extra: Map::new(),
        };
        config.apply_defaults();
        config
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_min_uptime(mut self, min_uptime: Duration) -> Self {
        self.min_uptime = min_uptime;
        self
    }

    pub fn with_kill_timeout(mut self, kill_timeout: Duration) -> Self {
        self.kill_timeout = kill_timeout;
        self
    }

    pub fn with_stdio(mut self, stdio: StdioMode) -> Self {
        self.stdio = stdio;
        self
    }

    pub fn with_watch(mut self, path: impl Into<PathBuf>) -> Self {
        self.watch.push(path.into());
        self
    }

    pub fn with_run_dir(mut self, run_dir: impl Into<PathBuf>) -> Self {
        self.run_dir = Some(run_dir.into());
        self
    }

    pub fn with_hook(mut self, event: impl Into<String>, command: impl Into<String>) -> Self {
        self.hooks.insert(event.into().to_lowercase(), command.into());
        self
    }

    /// Attach an arbitrary field, e.g. `port`.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Load a configuration file. `.yaml`/`.yml` files are parsed as YAML,
    /// anything else as JSON.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        let mut config: Self = if is_yaml {
            serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?
        };

        // Relative entries are resolved against the config file's directory.
        if config.entry.is_relative() {
            if let Some(parent) = path.parent() {
                config.entry = parent.join(&config.entry);
            }
        }

        config.apply_defaults();
        Ok(config)
    }

    /// Read the configuration a supervisor handed to this process.
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw = std::env::var(CONFIG_ENV_VAR).map_err(|_| ConfigError::MissingEnv(CONFIG_ENV_VAR))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.apply_defaults();
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entry.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("entry must not be empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".to_string()));
        }
        if self.instances == 0 {
            return Err(ConfigError::Invalid("instances must be at least 1".to_string()));
        }
        for event in self.hooks.keys() {
            if !crate::domain::events::HOOK_EVENTS.contains(&event.as_str()) {
                return Err(ConfigError::Invalid(format!("unknown hook event '{}'", event)));
            }
        }
        Ok(())
    }

    /// Program and argument vector used to launch one worker.
    pub fn command_line(&self) -> (String, Vec<String>) {
        let entry = self.entry.to_string_lossy().into_owned();
        match &self.interpreter {
            Some(interpreter) => {
                let mut args = Vec::with_capacity(self.args.len() + 1);
                args.push(entry);
                args.extend(self.args.iter().cloned());
                (interpreter.clone(), args)
            }
            None => (entry, self.args.clone()),
        }
    }

    /// Serialize into the JSON object that seeds every worker's state bag.
    pub fn to_data(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Resolve the run directory: explicit `runDir`, then `HERD_HOME`, then
    /// `~/.herd/run`.
    pub fn resolve_run_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.run_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_run_dir(),
        }
    }

    fn apply_defaults(&mut self) {
        if self.name.trim().is_empty() {
            self.name = self
                .entry
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        self.hooks = std::mem::take(&mut self.hooks)
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
    }
}

/// Run directory used when no `runDir` is configured: `$HERD_HOME/run`,
/// falling back to `~/.herd/run`.
pub fn default_run_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(home) = std::env::var(HOME_ENV_VAR) {
        if !home.is_empty() {
            return Ok(PathBuf::from(home).join("run"));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".herd").join("run"))
        .ok_or(ConfigError::NoRunDir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_name_defaults_to_entry_stem() {
        let config = SupervisorConfig::new("/srv/app/server.js");
        assert_eq!(config.name, "server");
        assert_eq!(config.instances, 1);
        assert_eq!(config.max_restarts, 10);
    }

    #[test]
    fn test_command_line_with_interpreter() {
        let config = SupervisorConfig::new("/srv/app/run.sh")
            .with_interpreter("sh")
            .with_args(["--port", "3010"]);
        let (program, args) = config.command_line();
        assert_eq!(program, "sh");
        assert_eq!(args, vec!["/srv/app/run.sh", "--port", "3010"]);
    }

    #[test]
    fn test_extra_fields_round_trip_through_json() {
        let config = SupervisorConfig::new("/srv/app/server.js")
            .with_name("hello")
            .with_field("port", 3010);
        let raw = serde_json::to_string(&config).unwrap();
        let parsed = SupervisorConfig::from_json(&raw).unwrap();
        assert_eq!(parsed.name, "hello");
        assert_eq!(parsed.extra.get("port"), Some(&Value::from(3010)));
        assert_eq!(parsed.min_uptime, Duration::from_secs(1));
    }

    #[test]
    fn test_load_yaml_resolves_relative_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("herd.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "name: api\nentry: server.sh\ninstances: 3\nminUptime: 500ms\nhooks:\n  CRASH: echo crashed"
        )
        .unwrap();

        let config = SupervisorConfig::load(&path).unwrap();
        assert_eq!(config.name, "api");
        assert_eq!(config.entry, dir.path().join("server.sh"));
        assert_eq!(config.instances, 3);
        assert_eq!(config.min_uptime, Duration::from_millis(500));
        assert_eq!(config.hooks.get("crash").map(String::as_str), Some("echo crashed"));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_instances_and_unknown_hooks() {
        let config = SupervisorConfig::new("/bin/true").with_instances(0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = SupervisorConfig::new("/bin/true").with_hook("reboot", "echo");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_explicit_run_dir_wins() {
        let config = SupervisorConfig::new("/bin/true").with_run_dir("/tmp/herd-test");
        assert_eq!(config.resolve_run_dir().unwrap(), PathBuf::from("/tmp/herd-test"));
    }
}
