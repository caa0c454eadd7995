//! # Agent Factory
//!
//! Builds agents from registered types, binds them to the bus and keeps the
//! directory of live agents.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use switchboard_core::bus::{BusConfig, EventBus};
//! use switchboard_core::factory::{AgentConfig, AgentFactory};
//!
//! let bus = EventBus::new(BusConfig::default())?;
//! let factory = AgentFactory::new(bus.clone());
//! factory.register_type("architect", |config| Ok(Box::new(Architect::new(config))));
//!
//! let architect = factory
//!     .create("architect", AgentConfig::new(), Some("architect-01"))
//!     .await?;
//! bus.publish("user.request", json!({"data": "hello"})).await?;
//! factory.terminate(architect.id()).await?;
//! ```

pub mod config;

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};

use crate::agent::{Agent, AgentCell, AgentHandle, AgentState, AgentStatus};
use crate::bus::EventBus;
use crate::error::{Error, Result};

pub use config::{AgentConfig, ProjectConfig, TeamMember};

/// Builds an agent from its configuration
pub type AgentConstructor =
    Arc<dyn Fn(&AgentConfig) -> anyhow::Result<Box<dyn Agent>> + Send + Sync>;

/// Creates, tracks and tears down agents on one bus
pub struct AgentFactory {
    bus: EventBus,
    types: DashMap<String, AgentConstructor>,
    directory: DashMap<String, AgentHandle>,
    /// Every id handed out during this process, including terminated agents
    issued: DashSet<String>,
}

impl AgentFactory {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            types: DashMap::new(),
            directory: DashMap::new(),
            issued: DashSet::new(),
        }
    }

    /// Bus the factory registers agents on
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Register (or replace) a constructor under `name`
    pub fn register_type<F>(&self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&AgentConfig) -> anyhow::Result<Box<dyn Agent>> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(agent_type = %name, "Agent type registered");
        self.types.insert(name, Arc::new(constructor));
    }

    /// Registered type names, sorted
    pub fn available_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Build an agent, subscribe its capabilities and start it
    ///
    /// The id is `desired_id`, else the config's `agent_id`, else
    /// `<type>_agent` (suffixed with a counter if already taken). An explicit
    /// id that was ever issued before fails with `DuplicateId`. If any step
    /// fails, subscriptions made so far are removed and the id is released.
    #[tracing::instrument(skip(self, config))]
    pub async fn create(
        &self,
        agent_type: &str,
        config: AgentConfig,
        desired_id: Option<&str>,
    ) -> Result<AgentHandle> {
        if self.bus.is_closed() {
            return Err(Error::BusClosed);
        }
        let constructor = self
            .types
            .get(agent_type)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::UnknownAgentType {
                requested: agent_type.to_string(),
                available: self.available_types().join(", "),
            })?;

        let id = self.reserve_id(agent_type, &config, desired_id)?;
        match self.build(&id, agent_type, &constructor, &config).await {
            Ok(handle) => {
                self.directory.insert(id.clone(), handle.clone());
                tracing::info!(
                    agent_id = %id,
                    agent_type,
                    capabilities = ?handle.capabilities(),
                    "Agent created"
                );
                Ok(handle)
            }
            Err(e) => {
                self.issued.remove(&id);
                tracing::warn!(agent_id = %id, agent_type, "Agent creation failed: {}", e);
                Err(e)
            }
        }
    }

    fn reserve_id(
        &self,
        agent_type: &str,
        config: &AgentConfig,
        desired_id: Option<&str>,
    ) -> Result<String> {
        if let Some(id) = desired_id.or_else(|| config.agent_id()) {
            if id.is_empty() {
                return Err(Error::Config("agent id must not be empty".into()));
            }
            if !self.issued.insert(id.to_string()) {
                return Err(Error::DuplicateId(id.to_string()));
            }
            return Ok(id.to_string());
        }

        let base = format!("{agent_type}_agent");
        if self.issued.insert(base.clone()) {
            return Ok(base);
        }
        (2u64..)
            .map(|n| format!("{base}_{n}"))
            .find(|candidate| self.issued.insert(candidate.clone()))
            .ok_or_else(|| Error::Config(format!("no free id for agent type '{agent_type}'")))
    }

    async fn build(
        &self,
        id: &str,
        agent_type: &str,
        constructor: &AgentConstructor,
        config: &AgentConfig,
    ) -> Result<AgentHandle> {
        let agent = (**constructor)(config).map_err(|source| Error::AgentBuild {
            agent_type: agent_type.to_string(),
            source,
        })?;
        let cell = AgentCell::new(id.to_string(), agent, &self.bus);

        let started = match cell.register(&self.bus) {
            Ok(()) => cell.start().await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            if let Err(rollback) = cell.shut_down(&self.bus).await {
                tracing::warn!(agent_id = %id, "Rollback failed: {}", rollback);
            }
            return Err(e);
        }
        Ok(AgentHandle::new(cell))
    }

    /// Live agent by id
    pub fn lookup(&self, id: &str) -> Result<AgentHandle> {
        self.directory
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Unsubscribe the agent, mark it `Terminated` and drop it from the
    /// directory
    #[tracing::instrument(skip(self))]
    pub async fn terminate(&self, id: &str) -> Result<()> {
        let (_, handle) = self
            .directory
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        handle.cell().shut_down(&self.bus).await?;
        tracing::info!(agent_id = %id, "Agent terminated");
        Ok(())
    }

    /// Hold deliveries to the agent; they queue under its overflow policy
    pub fn pause(&self, id: &str) -> Result<()> {
        let handle = self.lookup(id)?;
        handle.cell().transition(AgentState::Paused)?;
        self.bus.pause_subscriber(id);
        tracing::info!(agent_id = %id, "Agent paused");
        Ok(())
    }

    /// Deliver held events in their original order
    pub fn resume(&self, id: &str) -> Result<()> {
        let handle = self.lookup(id)?;
        handle.cell().transition(AgentState::Active)?;
        self.bus.resume_subscriber(id);
        tracing::info!(agent_id = %id, "Agent resumed");
        Ok(())
    }

    pub fn status(&self, id: &str) -> Result<AgentStatus> {
        Ok(self.lookup(id)?.status())
    }

    /// Ids of live agents, sorted
    pub fn agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.directory.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.directory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directory.is_empty()
    }

    /// Terminate every live agent, returning how many were stopped
    pub async fn terminate_all(&self) -> usize {
        let mut stopped = 0;
        for id in self.agents() {
            match self.terminate(&id).await {
                Ok(()) => stopped += 1,
                Err(e) => tracing::warn!(agent_id = %id, "Failed to terminate agent: {}", e),
            }
        }
        stopped
    }

    /// Create a team from `name → config`; each config names its `type`
    ///
    /// Agents are identified by their config's `agent_id` or their team name.
    /// If any member fails, members already created are terminated.
    pub async fn create_team(
        &self,
        team: BTreeMap<String, AgentConfig>,
    ) -> Result<BTreeMap<String, AgentHandle>> {
        let mut members = Vec::with_capacity(team.len());
        for (name, config) in team {
            let agent_type = config
                .agent_type()
                .ok_or_else(|| Error::Config(format!("agent '{name}' missing 'type' field")))?
                .to_string();
            let agent_id = Some(config.agent_id().unwrap_or(&name).to_string());
            members.push(TeamMember {
                name,
                agent_type,
                agent_id,
                config,
            });
        }
        self.create_members(members).await
    }

    /// Create every agent described by a project config
    pub async fn create_project(
        &self,
        project: &ProjectConfig,
    ) -> Result<BTreeMap<String, AgentHandle>> {
        self.create_members(project.team()?).await
    }

    /// Load `<base>/<project>/config.json` and create its agents
    pub async fn create_project_agents(
        &self,
        base: impl AsRef<std::path::Path>,
        project: &str,
    ) -> Result<BTreeMap<String, AgentHandle>> {
        let config = ProjectConfig::load(base, project).await?;
        let agents = self.create_project(&config).await?;
        tracing::info!(project, agents = agents.len(), "Project agents created");
        Ok(agents)
    }

    async fn create_members(
        &self,
        members: Vec<TeamMember>,
    ) -> Result<BTreeMap<String, AgentHandle>> {
        let mut created: BTreeMap<String, AgentHandle> = BTreeMap::new();
        for member in members {
            let result = self
                .create(&member.agent_type, member.config, member.agent_id.as_deref())
                .await;
            match result {
                Ok(handle) => {
                    created.insert(member.name, handle);
                }
                Err(e) => {
                    for handle in created.values() {
                        if let Err(cleanup) = self.terminate(handle.id()).await {
                            tracing::warn!(agent_id = %handle.id(), "Team cleanup failed: {}", cleanup);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentContext;
    use crate::bus::{BusConfig, Event, ErrorReport, ERROR_TOPIC};
    use crate::bus::handler_fn;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(2);

    /// Replies to `user.request` and records what it saw
    struct Echo {
        patterns: Vec<String>,
        seen: mpsc::UnboundedSender<String>,
        fail_start: bool,
    }

    #[async_trait]
    impl Agent for Echo {
        fn agent_type(&self) -> &str {
            "echo"
        }

        fn capabilities(&self) -> Vec<String> {
            self.patterns.clone()
        }

        async fn handle_event(
            &mut self,
            event: &Event,
            ctx: &AgentContext,
        ) -> anyhow::Result<Option<Value>> {
            let _ = self.seen.send(format!("{}:{}", ctx.agent_id(), event.topic()));
            if event.payload()["fail"] == true {
                anyhow::bail!("asked to fail");
            }
            ctx.publish("agent.echoed", json!({"from": ctx.agent_id()}))
                .await?;
            Ok(Some(json!({"response": "world"})))
        }

        async fn on_start(&mut self, _ctx: &AgentContext) -> anyhow::Result<()> {
            if self.fail_start {
                anyhow::bail!("not ready");
            }
            Ok(())
        }

        async fn on_stop(&mut self, ctx: &AgentContext) {
            let _ = self.seen.send(format!("{}:stopped", ctx.agent_id()));
        }
    }

    fn factory() -> (AgentFactory, mpsc::UnboundedReceiver<String>) {
        let bus = EventBus::new(BusConfig::default()).unwrap();
        let factory = AgentFactory::new(bus);
        let (tx, rx) = mpsc::unbounded_channel();
        factory.register_type("echo", move |config: &AgentConfig| {
            let patterns = match config.get("patterns") {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => vec!["user.request".to_string()],
            };
            Ok(Box::new(Echo {
                patterns,
                seen: tx.clone(),
                fail_start: config.get("fail_start") == Some(&json!(true)),
            }) as Box<dyn Agent>)
        });
        (factory, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_create_registers_and_activates() {
        let (factory, mut seen) = factory();
        let agent = factory
            .create("echo", AgentConfig::new(), Some("architect-01"))
            .await
            .unwrap();

        assert_eq!(agent.id(), "architect-01");
        assert_eq!(agent.state(), AgentState::Active);
        assert_eq!(factory.len(), 1);
        assert_eq!(factory.bus().subscription_count(), 1);
        assert_eq!(factory.lookup("architect-01").unwrap().id(), "architect-01");

        let result = factory
            .bus()
            .publish_aggregated("user.request", json!({"data": "hello"}), WAIT)
            .await
            .unwrap();
        assert_eq!(result.successes.len(), 1);
        assert_eq!(result.successes[0].value, Some(json!({"response": "world"})));
        assert_eq!(next(&mut seen).await, "architect-01:user.request");

        let status = factory.status("architect-01").unwrap();
        assert!(status.is_running());
        assert_eq!(status.subscriptions, vec!["user.request".to_string()]);
        assert!(status.started_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let (factory, _seen) = factory();
        factory
            .create("echo", AgentConfig::new(), Some("architect-01"))
            .await
            .unwrap();
        let err = factory
            .create("echo", AgentConfig::new(), Some("architect-01"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateId(id) if id == "architect-01"));
        assert_eq!(factory.len(), 1);
        assert_eq!(factory.bus().subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_terminated_ids_are_not_reused() {
        let (factory, _seen) = factory();
        factory
            .create("echo", AgentConfig::new(), Some("qa-1"))
            .await
            .unwrap();
        factory.terminate("qa-1").await.unwrap();
        let err = factory
            .create("echo", AgentConfig::new(), Some("qa-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateId(_)));
    }

    #[tokio::test]
    async fn test_generated_ids() {
        let (factory, _seen) = factory();
        let first = factory.create("echo", AgentConfig::new(), None).await.unwrap();
        let second = factory.create("echo", AgentConfig::new(), None).await.unwrap();
        let configured = factory
            .create("echo", AgentConfig::new().with("agent_id", "from-config"), None)
            .await
            .unwrap();
        assert_eq!(first.id(), "echo_agent");
        assert_eq!(second.id(), "echo_agent_2");
        assert_eq!(configured.id(), "from-config");
        assert_eq!(
            factory.agents(),
            vec!["echo_agent", "echo_agent_2", "from-config"]
        );
    }

    #[tokio::test]
    async fn test_unknown_type_lists_available() {
        let (factory, _seen) = factory();
        let err = factory
            .create("wizard", AgentConfig::new(), None)
            .await
            .unwrap_err();
        match err {
            Error::UnknownAgentType {
                requested,
                available,
            } => {
                assert_eq!(requested, "wizard");
                assert_eq!(available, "echo");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(factory.available_types(), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn test_lookup_and_terminate_unknown() {
        let (factory, _seen) = factory();
        assert!(matches!(factory.lookup("ghost"), Err(Error::NotFound(_))));
        assert!(matches!(
            factory.terminate("ghost").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_terminate_unsubscribes_and_stops() {
        let (factory, mut seen) = factory();
        let agent = factory
            .create(
                "echo",
                AgentConfig::new().with("patterns", json!(["user.request", "code.*"])),
                Some("coder"),
            )
            .await
            .unwrap();
        assert_eq!(factory.bus().subscription_count(), 2);

        factory.terminate("coder").await.unwrap();
        assert_eq!(agent.state(), AgentState::Terminated);
        assert_eq!(next(&mut seen).await, "coder:stopped");
        assert_eq!(factory.bus().subscription_count(), 0);
        assert!(factory.is_empty());
        assert!(matches!(factory.lookup("coder"), Err(Error::NotFound(_))));

        let result = factory.bus().publish("code.generated", json!({})).await.unwrap();
        assert_eq!(result.matched, 0);
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back() {
        let (factory, _seen) = factory();
        let err = factory
            .create("echo", AgentConfig::new().with("fail_start", true), Some("flaky"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentStart { .. }));
        assert!(factory.is_empty());
        assert_eq!(factory.bus().subscription_count(), 0);

        // The id was never handed out.
        let agent = factory
            .create("echo", AgentConfig::new(), Some("flaky"))
            .await
            .unwrap();
        assert_eq!(agent.state(), AgentState::Active);
    }

    #[tokio::test]
    async fn test_invalid_capability_rolls_back() {
        let (factory, _seen) = factory();
        let err = factory
            .create(
                "echo",
                AgentConfig::new().with("patterns", json!(["user.request", "bad..pattern"])),
                Some("broken"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPattern { .. }));
        assert_eq!(factory.bus().subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_agent_skips_its_own_messages() {
        let (factory, mut seen) = factory();
        factory
            .create(
                "echo",
                AgentConfig::new().with("patterns", json!(["user.request", "agent.*"])),
                Some("chatty"),
            )
            .await
            .unwrap();

        let (tx, mut echoed) = mpsc::unbounded_channel();
        factory
            .bus()
            .subscribe(
                "agent.echoed",
                handler_fn(move |event| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(event);
                        Ok(None)
                    }
                }),
                "observer",
            )
            .unwrap();

        factory.bus().publish("user.request", json!({})).await.unwrap();
        assert_eq!(next(&mut seen).await, "chatty:user.request");

        let echo = tokio::time::timeout(WAIT, echoed.recv()).await.unwrap().unwrap();
        assert_eq!(echo.source_agent_id(), Some("chatty"));

        // Its own `agent.echoed` event matched `agent.*` but was not handled.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(seen.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_agent_failure_reaches_error_topic() {
        let (factory, _seen) = factory();
        factory
            .create("echo", AgentConfig::new(), Some("qa"))
            .await
            .unwrap();

        let (tx, mut errors) = mpsc::unbounded_channel();
        factory
            .bus()
            .subscribe(
                ERROR_TOPIC,
                handler_fn(move |event| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(event);
                        Ok(None)
                    }
                }),
                "monitor",
            )
            .unwrap();

        factory
            .bus()
            .publish("user.request", json!({"fail": true}))
            .await
            .unwrap();
        let event = tokio::time::timeout(WAIT, errors.recv()).await.unwrap().unwrap();
        let report = ErrorReport::from_event(&event).unwrap();
        assert_eq!(report.subscriber_id, "qa");
        assert!(report.error_description.contains("asked to fail"));
        assert_eq!(factory.lookup("qa").unwrap().state(), AgentState::Active);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (factory, mut seen) = factory();
        factory
            .create("echo", AgentConfig::new(), Some("analyst"))
            .await
            .unwrap();

        factory.pause("analyst").unwrap();
        assert_eq!(factory.status("analyst").unwrap().state, AgentState::Paused);
        assert!(matches!(
            factory.pause("analyst"),
            Err(Error::InvalidTransition { .. })
        ));

        factory.bus().publish("user.request", json!({"n": 1})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(seen.try_recv().is_err());

        factory.resume("analyst").unwrap();
        assert_eq!(next(&mut seen).await, "analyst:user.request");
    }

    #[tokio::test]
    async fn test_create_team_and_cleanup_on_failure() {
        let (factory, _seen) = factory();
        let mut team = BTreeMap::new();
        team.insert("lead".to_string(), AgentConfig::new().with("type", "echo"));
        team.insert(
            "reviewer".to_string(),
            AgentConfig::new()
                .with("type", "echo")
                .with("agent_id", "reviewer-01"),
        );
        let agents = factory.create_team(team).await.unwrap();
        assert_eq!(agents["lead"].id(), "lead");
        assert_eq!(agents["reviewer"].id(), "reviewer-01");

        let mut broken = BTreeMap::new();
        broken.insert("a-helper".to_string(), AgentConfig::new().with("type", "echo"));
        broken.insert("b-ghost".to_string(), AgentConfig::new().with("type", "wizard"));
        let err = factory.create_team(broken).await.unwrap_err();
        assert!(matches!(err, Error::UnknownAgentType { .. }));
        assert_eq!(factory.agents(), vec!["lead", "reviewer-01"]);

        let mut untyped = BTreeMap::new();
        untyped.insert("nameless".to_string(), AgentConfig::new());
        assert!(matches!(
            factory.create_team(untyped).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_create_project_agents_from_disk() {
        let (factory, _seen) = factory();
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join("webshop");
        tokio::fs::create_dir_all(&project_dir).await.unwrap();
        tokio::fs::write(
            project_dir.join("config.json"),
            r#"{
                "common": {"patterns": ["user.request"]},
                "agents": {"echo": {}},
                "custom_agents": {"auditor": {"type": "echo", "patterns": ["_error"]}}
            }"#,
        )
        .await
        .unwrap();

        let agents = factory
            .create_project_agents(dir.path(), "webshop")
            .await
            .unwrap();
        assert_eq!(agents["echo"].id(), "echo_agent");
        assert_eq!(agents["auditor"].id(), "auditor");
        assert_eq!(agents["auditor"].capabilities(), ["_error".to_string()]);

        assert_eq!(factory.terminate_all().await, 2);
        assert!(factory.is_empty());
    }

    #[tokio::test]
    async fn test_create_after_shutdown_fails() {
        let (factory, _seen) = factory();
        factory.bus().shutdown(Duration::from_millis(10)).await;
        let err = factory
            .create("echo", AgentConfig::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BusClosed));
    }
}
