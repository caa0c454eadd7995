//! # Agent and Project Configuration
//!
//! Agent configs are free-form JSON objects handed to agent constructors. A
//! project file groups them:
//!
//! ```json
//! {
//!   "common": { "language": "rust" },
//!   "agents": { "architect": { "agent_id": "architect-01" } },
//!   "custom_agents": { "security": { "type": "qa", "strict": true } }
//! }
//! ```
//!
//! Every agent config is merged over `common`; keys set on the agent win.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Key naming the agent type in team and custom-agent entries
pub const TYPE_KEY: &str = "type";
/// Key carrying an explicit agent id
pub const AGENT_ID_KEY: &str = "agent_id";
/// File name looked up inside each project directory
pub const PROJECT_CONFIG_FILE: &str = "config.json";

/// Configuration for a single agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentConfig(Map<String, Value>);

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a JSON value, which must be an object
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::Config(format!(
                "agent config must be a JSON object, got {other}"
            ))),
        }
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Explicit agent id, if configured
    pub fn agent_id(&self) -> Option<&str> {
        self.get_str(AGENT_ID_KEY)
    }

    /// Agent type, if configured
    pub fn agent_type(&self) -> Option<&str> {
        self.get_str(TYPE_KEY)
    }

    /// `self` layered over `base`: keys present in `self` win
    pub fn merged_over(&self, base: &AgentConfig) -> AgentConfig {
        let mut merged = base.0.clone();
        for (key, value) in &self.0 {
            merged.insert(key.clone(), value.clone());
        }
        AgentConfig(merged)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One agent to build as part of a team
#[derive(Debug, Clone, PartialEq)]
pub struct TeamMember {
    /// Name the agent is returned under
    pub name: String,
    pub agent_type: String,
    /// Id to request; the factory picks one when absent
    pub agent_id: Option<String>,
    pub config: AgentConfig,
}

/// A project's agent team description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Settings shared by every agent
    pub common: AgentConfig,
    /// Agent type → its config
    pub agents: BTreeMap<String, AgentConfig>,
    /// Agent name → config carrying a `type`
    pub custom_agents: BTreeMap<String, AgentConfig>,
}

impl ProjectConfig {
    /// Location of a project's config file under `base`
    pub fn path(base: impl AsRef<Path>, project: &str) -> PathBuf {
        base.as_ref().join(project).join(PROJECT_CONFIG_FILE)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load `<base>/<project>/config.json`
    pub async fn load(base: impl AsRef<Path>, project: &str) -> Result<Self> {
        let path = Self::path(base, project);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Config(format!(
                    "project config not found: {}",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), "Loaded project config");
        Self::from_json_str(&raw)
    }

    /// Every agent of the project with `common` merged in
    ///
    /// Entries under `agents` are named after their type; entries under
    /// `custom_agents` must carry a `type`.
    pub fn team(&self) -> Result<Vec<TeamMember>> {
        let mut members = Vec::with_capacity(self.agents.len() + self.custom_agents.len());

        for (agent_type, config) in &self.agents {
            let config = config.merged_over(&self.common);
            members.push(TeamMember {
                name: agent_type.clone(),
                agent_type: agent_type.clone(),
                agent_id: config.agent_id().map(str::to_string),
                config,
            });
        }

        for (name, config) in &self.custom_agents {
            let agent_type = config
                .agent_type()
                .ok_or_else(|| Error::Config(format!("custom agent '{name}' missing 'type' field")))?
                .to_string();
            let config = config.merged_over(&self.common);
            members.push(TeamMember {
                name: name.clone(),
                agent_type,
                agent_id: Some(config.agent_id().unwrap_or(name).to_string()),
                config,
            });
        }

        Ok(members)
    }
}
