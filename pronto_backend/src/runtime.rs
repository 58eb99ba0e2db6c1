use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flume::Sender;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::agent::{LlmReasoner, ReasoningCollaborator, ScriptedReasoner};
use crate::character::ProfileStore;
use crate::config::{ChatConfig, ReasonerKind};
use crate::error::ChatError;
use crate::session::{ConversationEngine, SessionEvent, SessionHandle};

pub struct BackendRuntime {
    pub config: ChatConfig,
    pub engine: ConversationEngine,
    pub sessions: Arc<SessionRegistry>,
}

pub struct BackendRuntimeBuilder {
    config: ChatConfig,
    event_tx: Sender<SessionEvent>,
    collaborator: Option<Arc<dyn ReasoningCollaborator>>,
    store: Option<ProfileStore>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: ChatConfig, event_tx: Sender<SessionEvent>) -> Self {
        Self {
            config,
            event_tx,
            collaborator: None,
            store: None,
        }
    }

    /// Use this collaborator instead of the one named in the config.
    pub fn with_collaborator(mut self, collaborator: Arc<dyn ReasoningCollaborator>) -> Self {
        self.collaborator = Some(collaborator);
        self
    }

    pub fn with_store(mut self, store: ProfileStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let store = match self.store {
            Some(store) => store,
            None => build_store(&config)?,
        };
        if store.get(&config.default_character).is_none() {
            tracing::warn!(
                "Default character '{}' is not among the loaded profiles",
                config.default_character
            );
        }

        let collaborator = match self.collaborator {
            Some(collaborator) => collaborator,
            None => build_collaborator(&config)?,
        };
        tracing::info!(
            "Conversation engine ready: {} profile(s), collaborator '{}'",
            store.len(),
            collaborator.name()
        );

        let engine = ConversationEngine::new(
            Arc::new(store),
            collaborator,
            config.engine_policy(),
            self.event_tx,
        );

        Ok(BackendRuntime {
            config,
            engine,
            sessions: Arc::new(SessionRegistry::default()),
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: ChatConfig, event_tx: Sender<SessionEvent>) -> Result<Self> {
        BackendRuntimeBuilder::new(config, event_tx).build()
    }

    pub async fn start_session(&self, character_id: &str) -> Result<SessionHandle, ChatError> {
        let session = self.engine.start(character_id)?;
        self.sessions.insert(session.clone()).await;
        Ok(session)
    }

    pub async fn session(&self, id: &str) -> Result<SessionHandle, ChatError> {
        self.sessions.get(id).await
    }

    /// Forget a session and cancel its timers.
    pub async fn end_session(&self, id: &str) -> Result<(), ChatError> {
        let session = self.sessions.remove(id).await?;
        session.close().await;
        Ok(())
    }

    /// Close every session nobody has touched for `max_idle`.
    pub async fn evict_idle_sessions(&self, max_idle: Duration) -> usize {
        let idle = self.sessions.take_idle(max_idle).await;
        for session in &idle {
            tracing::info!("Session {} idle for over {:?}, closing", session.id(), max_idle);
            session.close().await;
        }
        idle.len()
    }

    /// Periodically evict idle sessions, if the config asks for it.
    pub fn spawn_idle_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let max_idle = self.config.session_idle_timeout()?;
        let period = (max_idle / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
        let runtime = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let evicted = runtime.evict_idle_sessions(max_idle).await;
                if evicted > 0 {
                    tracing::debug!("Evicted {} idle session(s)", evicted);
                }
            }
        }))
    }
}

struct RegisteredSession {
    handle: SessionHandle,
    last_seen: Instant,
}

/// Live sessions by id, with the last time each was looked up.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, RegisteredSession>>,
}

impl SessionRegistry {
    pub async fn insert(&self, session: SessionHandle) {
        self.sessions.write().await.insert(
            session.id().to_string(),
            RegisteredSession {
                handle: session,
                last_seen: Instant::now(),
            },
        );
    }

    /// Look a session up and mark it as active.
    pub async fn get(&self, id: &str) -> Result<SessionHandle, ChatError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| ChatError::SessionNotFound(id.to_string()))?;
        entry.last_seen = Instant::now();
        Ok(entry.handle.clone())
    }

    pub async fn remove(&self, id: &str) -> Result<SessionHandle, ChatError> {
        self.sessions
            .write()
            .await
            .remove(id)
            .map(|entry| entry.handle)
            .ok_or_else(|| ChatError::SessionNotFound(id.to_string()))
    }

    /// Remove and return the sessions last seen more than `max_idle` ago.
    pub async fn take_idle(&self, max_idle: Duration) -> Vec<SessionHandle> {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let idle: Vec<String> = sessions
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) > max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        idle.into_iter()
            .filter_map(|id| sessions.remove(&id))
            .map(|entry| entry.handle)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

fn build_store(config: &ChatConfig) -> Result<ProfileStore> {
    match config.profiles_dir.as_deref().map(str::trim) {
        Some(dir) if !dir.is_empty() => ProfileStore::with_card_dir(dir)
            .with_context(|| format!("Failed to load character profiles from '{}'", dir)),
        _ => ProfileStore::builtin().context("Built-in character profiles are invalid"),
    }
}

fn build_collaborator(config: &ChatConfig) -> Result<Arc<dyn ReasoningCollaborator>> {
    match config.reasoner {
        ReasonerKind::Scripted => {
            tracing::info!(
                "Using scripted reasoner ({} ms latency)",
                config.scripted_latency_ms
            );
            Ok(Arc::new(ScriptedReasoner::new(config.scripted_latency())))
        }
        ReasonerKind::Llm => {
            tracing::info!(
                "Using LLM reasoner {} at {}",
                config.llm_model,
                config.llm_api_url
            );
            let reasoner =
                LlmReasoner::from_config(config).context("Failed to set up LLM reasoner")?;
            Ok(Arc::new(reasoner))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::character::abby::abby;
    use std::fs;

    fn scripted_config() -> ChatConfig {
        ChatConfig {
            scripted_latency_ms: 0,
            ..ChatConfig::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_defaults_to_scripted_abby() {
        let (tx, _rx) = flume::unbounded();
        let runtime = BackendRuntime::bootstrap(scripted_config(), tx).unwrap();
        assert_eq!(runtime.engine.collaborator_name(), "scripted");
        assert!(runtime.engine.store().get("Abby").is_some());
        assert!(runtime.sessions.is_empty().await);
    }

    #[tokio::test]
    async fn llm_kind_uses_configured_model() {
        let (tx, _rx) = flume::unbounded();
        let config = ChatConfig {
            reasoner: ReasonerKind::Llm,
            llm_model: "mistral-small".to_string(),
            ..ChatConfig::default()
        };
        let runtime = BackendRuntime::bootstrap(config, tx).unwrap();
        assert_eq!(runtime.engine.collaborator_name(), "mistral-small");
    }

    #[tokio::test]
    async fn profiles_dir_adds_cards() {
        let dir = tempfile::tempdir().unwrap();
        let mut milo = abby();
        milo.id = "Milo".to_string();
        fs::write(
            dir.path().join("milo.json"),
            serde_json::to_string(&milo).unwrap(),
        )
        .unwrap();

        let (tx, _rx) = flume::unbounded();
        let config = ChatConfig {
            profiles_dir: Some(dir.path().to_string_lossy().to_string()),
            ..scripted_config()
        };
        let runtime = BackendRuntime::bootstrap(config, tx).unwrap();
        assert_eq!(runtime.engine.store().len(), 2);
    }

    #[tokio::test]
    async fn missing_profiles_dir_fails_startup() {
        let (tx, _rx) = flume::unbounded();
        let config = ChatConfig {
            profiles_dir: Some("/definitely/not/here".to_string()),
            ..scripted_config()
        };
        assert!(BackendRuntime::bootstrap(config, tx).is_err());
    }

    #[tokio::test]
    async fn sessions_are_registered_and_removed() {
        let (tx, _rx) = flume::unbounded();
        let runtime = BackendRuntime::bootstrap(scripted_config(), tx).unwrap();

        let session = runtime.start_session("abby").await.unwrap();
        let id = session.id().to_string();
        assert_eq!(runtime.sessions.len().await, 1);
        assert_eq!(runtime.session(&id).await.unwrap().id(), id);

        runtime.end_session(&id).await.unwrap();
        assert_eq!(
            runtime.session(&id).await.err(),
            Some(ChatError::SessionNotFound(id.clone()))
        );
        assert!(runtime.end_session(&id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_evicted_and_active_ones_kept() {
        let (tx, _rx) = flume::unbounded();
        let config = ChatConfig {
            session_idle_timeout_secs: 60,
            ..scripted_config()
        };
        let runtime = Arc::new(BackendRuntime::bootstrap(config, tx).unwrap());
        let sweeper = runtime.spawn_idle_sweeper().unwrap();

        let quiet = runtime.start_session("abby").await.unwrap();
        let busy = runtime.start_session("abby").await.unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            runtime.session(busy.id()).await.unwrap();
        }

        assert_eq!(
            runtime.session(quiet.id()).await.err(),
            Some(ChatError::SessionNotFound(quiet.id().to_string()))
        );
        assert!(runtime.session(busy.id()).await.is_ok());
        assert_eq!(runtime.sessions.len().await, 1);
        sweeper.abort();
    }

    #[tokio::test]
    async fn idle_sweeper_is_off_when_disabled() {
        let (tx, _rx) = flume::unbounded();
        let config = ChatConfig {
            session_idle_timeout_secs: 0,
            ..scripted_config()
        };
        let runtime = Arc::new(BackendRuntime::bootstrap(config, tx).unwrap());
        assert!(runtime.spawn_idle_sweeper().is_none());
    }

    #[tokio::test]
    async fn unknown_character_is_not_registered() {
        let (tx, _rx) = flume::unbounded();
        let runtime = BackendRuntime::bootstrap(scripted_config(), tx).unwrap();
        assert!(matches!(
            runtime.start_session("Nobody").await,
            Err(ChatError::ProfileNotFound(_))
        ));
        assert!(runtime.sessions.is_empty().await);
    }
}
