//! Teams: the pluggable worker pools that execute jobs.
//!
//! A team owns its threads and nothing else. Functions, governance and the
//! office refer to teams by name through the [`TeamRegistry`].

use indexmap::IndexMap;
use std::sync::Arc;

use crate::config::{RuntimeConfig, TeamDefinition, TeamKind};
use crate::job::Job;
use crate::pool::{AffinityTeam, ExecutorTeam, OnePersonTeam};

/// Team errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TeamError {
    /// Start called after the team was stopped
    #[error("Team {name} has been stopped")]
    Stopped {
        /// Team name
        name: String,
    },

    /// Worker thread could not be created
    #[error("Team {name} failed to spawn worker: {reason}")]
    SpawnFailed {
        /// Team name
        name: String,
        /// OS error text
        reason: String,
    },

    /// Team not registered
    #[error("Team not found: {name}")]
    NotFound {
        /// Team name
        name: String,
    },

    /// Team registered twice
    #[error("Team already registered: {name}")]
    AlreadyRegistered {
        /// Team name
        name: String,
    },
}

/// A worker pool executing opaque jobs.
///
/// `assign` never blocks on job execution (except for [`PassiveTeam`], which
/// runs the job on the caller) and is accepted before `start`; jobs queue
/// until a worker exists. `stop` is idempotent, callable from any thread,
/// and returns once queued work drained or the grace period elapsed.
pub trait Team: Send + Sync {
    /// Team name
    fn name(&self) -> &str;

    /// Start the team's threads
    ///
    /// # Errors
    ///
    /// Returns error if the team was already stopped or a thread could not be spawned
    fn start(&self) -> Result<(), TeamError>;

    /// Hand over a job for execution
    fn assign(&self, job: Box<dyn Job>);

    /// Stop the team, draining queued jobs within the grace period
    fn stop(&self);
}

/// Team that runs every job immediately on the assigning thread.
///
/// Has no threads of its own. Useful for tests and for functions cheap
/// enough that a hand-off costs more than the work.
pub struct PassiveTeam {
    name: String,
}

impl PassiveTeam {
    /// Create a passive team
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Team for PassiveTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> Result<(), TeamError> {
        Ok(())
    }

    fn assign(&self, job: Box<dyn Job>) {
        job.run();
    }

    fn stop(&self) {}
}

/// Named collection of teams
#[derive(Clone, Default)]
pub struct TeamRegistry {
    teams: IndexMap<String, Arc<dyn Team>>,
}

impl TeamRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            teams: IndexMap::new(),
        }
    }

    /// Create the teams declared in a runtime configuration
    ///
    /// # Errors
    ///
    /// Returns error if two definitions share a name
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, TeamError> {
        let mut registry = Self::new();
        for definition in &config.teams {
            registry.register(create_team(definition, config))?;
        }
        Ok(registry)
    }

    /// Register a team under its own name
    ///
    /// # Errors
    ///
    /// Returns error if the name is taken
    pub fn register(&mut self, team: Arc<dyn Team>) -> Result<(), TeamError> {
        let name = team.name().to_string();
        if self.teams.contains_key(&name) {
            return Err(TeamError::AlreadyRegistered { name });
        }
        self.teams.insert(name, team);
        Ok(())
    }

    /// Look up a team
    ///
    /// # Errors
    ///
    /// Returns error if no team has that name
    pub fn get(&self, name: &str) -> Result<Arc<dyn Team>, TeamError> {
        self.teams
            .get(name)
            .cloned()
            .ok_or_else(|| TeamError::NotFound {
                name: name.to_string(),
            })
    }

    /// Whether a team is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.teams.contains_key(name)
    }

    /// Team names in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.teams.keys().map(String::as_str)
    }

    /// Start every team, in registration order
    ///
    /// # Errors
    ///
    /// Returns the first start failure; teams started before it keep running
    pub fn start_all(&self) -> Result<(), TeamError> {
        for team in self.teams.values() {
            team.start()?;
            tracing::info!(team = %team.name(), "team started");
        }
        Ok(())
    }

    /// Stop every team, in reverse registration order
    pub fn stop_all(&self) {
        for team in self.teams.values().rev() {
            team.stop();
            tracing::info!(team = %team.name(), "team stopped");
        }
    }

    /// Number of teams
    #[must_use]
    pub fn len(&self) -> usize {
        self.teams.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }
}

/// Build a team from its configured definition
#[must_use]
pub fn create_team(definition: &TeamDefinition, config: &RuntimeConfig) -> Arc<dyn Team> {
    let grace = config.stop_grace();
    let threads = definition.threads.max(1);
    match definition.kind {
        TeamKind::Passive => Arc::new(PassiveTeam::new(&definition.name)),
        TeamKind::OnePerson => Arc::new(OnePersonTeam::new(&definition.name, grace)),
        TeamKind::Executor => Arc::new(ExecutorTeam::new(&definition.name, threads, grace)),
        TeamKind::Affinity => Arc::new(AffinityTeam::new(&definition.name, threads, grace)),
    }
}
