//! Runtime configuration.
//!
//! One explicit struct handed to the office builder. Teams are declared
//! here by name; functions and governance refer to them by that name.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::governance::DeactivationStrategy;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Configuration text is not valid JSON for this schema
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// Configuration parsed but is inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Kind of worker pool a team definition creates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamKind {
    /// Runs jobs on the assigning thread
    Passive,
    /// One dedicated thread
    OnePerson,
    /// N threads sharing one queue
    Executor,
    /// N threads with one queue each, routed by affinity key
    Affinity,
}

/// A named team to create at office build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamDefinition {
    /// Team name
    pub name: String,
    /// Pool kind
    pub kind: TeamKind,
    /// Thread count (ignored by passive and one-person teams)
    #[serde(default = "default_threads")]
    pub threads: usize,
}

impl TeamDefinition {
    /// Create a team definition
    #[must_use]
    pub fn new(name: impl Into<String>, kind: TeamKind, threads: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            threads,
        }
    }
}

fn default_threads() -> usize {
    1
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Teams to create
    pub teams: Vec<TeamDefinition>,
    /// Team used by functions that name none
    pub default_team: String,
    /// Upper bound on how long `Team::stop` waits for workers to drain
    pub stop_grace_ms: u64,
    /// Period of the office manager's timeout sweep
    pub monitor_interval_ms: u64,
    /// Timeout for asynchronous objects that declare none (0 disables)
    pub default_source_timeout_ms: u64,
    /// Strategy for governance still active when its process completes
    pub governance_deactivation: DeactivationStrategy,
    /// Log filter directive used by the binary
    pub log_filter: String,
    /// Emit JSON log lines
    pub log_json: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            teams: vec![
                TeamDefinition::new("default", TeamKind::Executor, 4),
                TeamDefinition::new("governance", TeamKind::OnePerson, 1),
            ],
            default_team: "default".to_string(),
            stop_grace_ms: 5_000,
            monitor_interval_ms: 10,
            default_source_timeout_ms: 0,
            governance_deactivation: DeactivationStrategy::Disregard,
            log_filter: "atrium=info".to_string(),
            log_json: false,
        }
    }
}

impl RuntimeConfig {
    /// Configuration with a single passive team, for deterministic tests
    #[must_use]
    pub fn passive() -> Self {
        Self {
            teams: vec![TeamDefinition::new("default", TeamKind::Passive, 1)],
            ..Self::default()
        }
    }

    /// Add a team definition
    #[must_use]
    pub fn with_team(mut self, definition: TeamDefinition) -> Self {
        self.teams.push(definition);
        self
    }

    /// Set the stop grace period
    #[must_use]
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Set the office manager sweep interval
    #[must_use]
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set how governance still active at process completion is deactivated
    #[must_use]
    pub fn with_governance_deactivation(mut self, strategy: DeactivationStrategy) -> Self {
        self.governance_deactivation = strategy;
        self
    }

    /// Grace period for team shutdown
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Office manager sweep interval
    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    /// Default asynchronous sourcing timeout, if any
    #[must_use]
    pub fn default_source_timeout(&self) -> Option<Duration> {
        (self.default_source_timeout_ms > 0)
            .then(|| Duration::from_millis(self.default_source_timeout_ms))
    }

    /// Parse and validate a JSON configuration
    ///
    /// # Errors
    ///
    /// Returns error if the text is not valid JSON or fails validation
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or validated
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Render as pretty JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check internal consistency
    ///
    /// # Errors
    ///
    /// Returns error on empty or duplicate team names, an unknown default
    /// team, a zero-thread pool or a zero grace period
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for team in &self.teams {
            if team.name.is_empty() {
                return Err(ConfigError::Invalid("team name must not be empty".to_string()));
            }
            if !seen.insert(team.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate team {}", team.name)));
            }
            if matches!(team.kind, TeamKind::Executor | TeamKind::Affinity) && team.threads == 0 {
                return Err(ConfigError::Invalid(format!(
                    "team {} needs at least one thread",
                    team.name
                )));
            }
        }
        if !seen.contains(self.default_team.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "default team {} is not defined",
                self.default_team
            )));
        }
        if self.stop_grace_ms == 0 {
            return Err(ConfigError::Invalid("stop_grace_ms must be positive".to_string()));
        }
        Ok(())
    }
}
