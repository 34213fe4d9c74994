//! A translated call: two legs bound by one key.
//!
//! ```text
//! New --attach_first_leg--> AwaitingPeer --attach_second_leg--> Active --close--> Closed
//! ```
//!
//! Fragments are only forwarded once the session is `Active` and translation is
//! armed (`start`). Each direction has its own FIFO queue drained by a single
//! worker, so one leg's utterances reach the other leg in the order spoken.

use crate::channel::Channel;
use crate::error::SessionError;
use crate::frame::{Frame, FrameKind};
use crate::lock;
use crate::registry::{SessionKey, SessionRegistry};
use crate::translation::{Direction, LanguagePair, Translator};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    AwaitingPeer,
    Active,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::New => "new",
            SessionState::AwaitingPeer => "awaiting peer",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        }
    }
}

/// Per-session behaviour shared by every session of a relay.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub languages: LanguagePair,
    /// Arm translation as soon as the second leg binds instead of waiting for
    /// an external `start`.
    pub auto_start: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            languages: LanguagePair::default(),
            auto_start: true,
        }
    }
}

pub struct Session {
    key: SessionKey,
    settings: SessionSettings,
    translator: Translator,
    registry: Weak<SessionRegistry>,
    legs: Mutex<Legs>,
}

struct Legs {
    state: SessionState,
    caller: Option<Channel>,
    agent: Option<Channel>,
    queues: Option<Queues>,
    workers: Vec<JoinHandle<()>>,
}

struct Queues {
    to_agent: mpsc::UnboundedSender<String>,
    to_caller: mpsc::UnboundedSender<String>,
}

impl Session {
    pub fn new(
        key: SessionKey,
        settings: SessionSettings,
        translator: Translator,
        registry: &Arc<SessionRegistry>,
    ) -> Arc<Session> {
        Arc::new(Session {
            key,
            settings,
            translator,
            registry: Arc::downgrade(registry),
            legs: Mutex::new(Legs {
                state: SessionState::New,
                caller: None,
                agent: None,
                queues: None,
                workers: Vec::new(),
            }),
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        lock(&self.legs).state
    }

    /// Whether fragment forwarding has been armed.
    pub fn is_started(&self) -> bool {
        lock(&self.legs).queues.is_some()
    }

    /// Bind the initiating (caller) leg: `New -> AwaitingPeer`.
    pub fn attach_first_leg(self: &Arc<Self>, channel: Channel) -> Result<(), SessionError> {
        {
            let mut legs = lock(&self.legs);
            if legs.state != SessionState::New {
                return Err(SessionError::InvalidTransition {
                    action: "attach first leg",
                    state: legs.state.as_str(),
                });
            }
            legs.caller = Some(channel.clone());
            legs.state = SessionState::AwaitingPeer;
        }

        self.route_fragments(&channel, Direction::CallerToAgent);
        info!(session = %self.key, channel = channel.label(), "Caller leg bound, awaiting agent");
        Ok(())
    }

    /// Bind the responding (agent) leg: `AwaitingPeer -> Active`.
    ///
    /// Returns `Ok(false)` without keeping the channel when the session is
    /// already active.
    pub fn attach_second_leg(self: &Arc<Self>, channel: Channel) -> Result<bool, SessionError> {
        {
            let mut legs = lock(&self.legs);
            match legs.state {
                SessionState::AwaitingPeer => {
                    legs.agent = Some(channel.clone());
                    legs.state = SessionState::Active;
                }
                SessionState::Active => {
                    debug!(session = %self.key, "Session already active, ignoring extra leg");
                    return Ok(false);
                }
                state => {
                    return Err(SessionError::InvalidTransition {
                        action: "attach second leg",
                        state: state.as_str(),
                    })
                }
            }
        }

        self.route_fragments(&channel, Direction::AgentToCaller);
        info!(session = %self.key, channel = channel.label(), "Agent leg bound, session active");

        if self.settings.auto_start {
            self.start()?;
        }

        Ok(true)
    }

    /// Arm fragment forwarding in both directions.
    ///
    /// Returns `Ok(false)` when already armed.
    pub fn start(&self) -> Result<bool, SessionError> {
        let mut legs = lock(&self.legs);

        match legs.state {
            SessionState::Active => {}
            SessionState::Closed => {
                return Err(SessionError::InvalidTransition {
                    action: "start translation",
                    state: SessionState::Closed.as_str(),
                })
            }
            _ => return Err(SessionError::NotReady(self.key.to_string())),
        }

        if legs.queues.is_some() {
            return Ok(false);
        }

        let (Some(caller), Some(agent)) = (legs.caller.clone(), legs.agent.clone()) else {
            return Err(SessionError::NotReady(self.key.to_string()));
        };

        let (to_agent, to_agent_rx) = mpsc::unbounded_channel();
        let (to_caller, to_caller_rx) = mpsc::unbounded_channel();

        legs.workers = vec![
            self.spawn_worker(Direction::CallerToAgent, agent, to_agent_rx),
            self.spawn_worker(Direction::AgentToCaller, caller, to_caller_rx),
        ];
        legs.queues = Some(Queues {
            to_agent,
            to_caller,
        });

        info!(session = %self.key, "Translation started");
        Ok(true)
    }

    /// Close both legs and evict the session. Re-entrant calls are no-ops.
    pub fn close(&self) {
        let (caller, agent, workers) = {
            let mut legs = lock(&self.legs);
            if legs.state == SessionState::Closed {
                return;
            }
            legs.state = SessionState::Closed;
            legs.queues = None;
            (
                legs.caller.take(),
                legs.agent.take(),
                std::mem::take(&mut legs.workers),
            )
        };

        // In-flight translations are dropped with their workers.
        for worker in workers {
            worker.abort();
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.evict_if(&self.key, self);
        }

        if let Some(caller) = caller {
            caller.close();
        }
        if let Some(agent) = agent {
            agent.close();
        }

        info!(session = %self.key, "Session closed");
    }

    fn route_fragments(self: &Arc<Self>, channel: &Channel, direction: Direction) {
        let session = Arc::downgrade(self);
        channel.subscribe(FrameKind::Prompt, move |frame| {
            let Frame::Prompt(prompt) = frame else {
                return Ok(());
            };
            if let Some(session) = session.upgrade() {
                session.enqueue(direction, &prompt.voice_prompt)?;
            }
            Ok(())
        });
    }

    fn enqueue(&self, direction: Direction, text: &str) -> anyhow::Result<()> {
        let legs = lock(&self.legs);

        let queue = match (&legs.state, &legs.queues) {
            (SessionState::Active, Some(queues)) => match direction {
                Direction::CallerToAgent => &queues.to_agent,
                Direction::AgentToCaller => &queues.to_caller,
            },
            (SessionState::Closed, _) => {
                debug!(session = %self.key, %direction, "Session closed, dropping fragment");
                return Ok(());
            }
            (state, _) => {
                warn!(
                    session = %self.key,
                    %direction,
                    state = state.as_str(),
                    "No peer to forward to yet, dropping fragment: {}",
                    text
                );
                return Ok(());
            }
        };

        queue
            .send(text.to_string())
            .map_err(|_| anyhow::anyhow!("translation worker for {} has stopped", direction))
    }

    fn spawn_worker(
        &self,
        direction: Direction,
        target: Channel,
        mut queue: mpsc::UnboundedReceiver<String>,
    ) -> JoinHandle<()> {
        let key = self.key.clone();
        let translator = self.translator.clone();
        let languages = self.settings.languages.clone();

        tokio::spawn(async move {
            while let Some(text) = queue.recv().await {
                let payload = match translator.translate(&text, &languages, direction).await {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(session = %key, %direction, error = %e, "Translation failed, fragment dropped");
                        continue;
                    }
                };

                if !target.is_open() {
                    debug!(session = %key, %direction, "Peer leg closed, dropping translation");
                    continue;
                }

                let lang = languages.target(direction).code.clone();
                target.send(&Frame::text(payload.translation_text, Some(lang)));
            }
            debug!(session = %key, %direction, "Translation worker finished");
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel::Outbound;
    use crate::translation::tests::ScriptedEngine;
    use std::time::Duration;

    pub(crate) fn unused_translator() -> Translator {
        Translator::new(Arc::new(ScriptedEngine::new()))
    }

    pub(crate) fn session_for(
        registry: &Arc<SessionRegistry>,
        key: &str,
        translator: Translator,
    ) -> Arc<Session> {
        Session::new(
            SessionKey::parse(key).unwrap(),
            SessionSettings::default(),
            translator,
            registry,
        )
    }

    /// Next queued frame, waiting briefly for a worker to produce it.
    pub(crate) async fn next_outbound(
        rx: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> Option<Outbound> {
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .ok()
            .flatten()
    }

    pub(crate) fn token_of(outbound: Outbound) -> String {
        match outbound {
            Outbound::Frame(payload) => {
                let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
                assert_eq!(value["type"], "text");
                assert_eq!(value["last"], true);
                value["token"].as_str().unwrap().to_string()
            }
            Outbound::Close => panic!("Expected a frame, got close"),
        }
    }

    struct Harness {
        registry: Arc<SessionRegistry>,
        session: Arc<Session>,
        caller: Channel,
        caller_rx: mpsc::UnboundedReceiver<Outbound>,
        agent: Channel,
        agent_rx: mpsc::UnboundedReceiver<Outbound>,
    }

    fn active_session(engine: ScriptedEngine) -> Harness {
        let registry = Arc::new(SessionRegistry::new());
        let session = session_for(
            &registry,
            "+15550001111",
            Translator::new(Arc::new(engine)),
        );
        registry.bind(session.key().clone(), Arc::clone(&session));

        let (caller, caller_rx) = Channel::new("caller");
        let (agent, agent_rx) = Channel::new("agent");
        session.attach_first_leg(caller.clone()).unwrap();
        assert!(session.attach_second_leg(agent.clone()).unwrap());

        Harness {
            registry,
            session,
            caller,
            caller_rx,
            agent,
            agent_rx,
        }
    }

    // ==================== State Machine Tests ====================

    #[tokio::test]
    async fn test_state_transitions() {
        let registry = Arc::new(SessionRegistry::new());
        let session = session_for(&registry, "+15550001111", unused_translator());
        assert_eq!(session.state(), SessionState::New);

        let (caller, _caller_rx) = Channel::new("caller");
        session.attach_first_leg(caller).unwrap();
        assert_eq!(session.state(), SessionState::AwaitingPeer);
        assert!(!session.is_started());

        let (agent, _agent_rx) = Channel::new("agent");
        assert!(session.attach_second_leg(agent).unwrap());
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.is_started());

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_third_leg_is_noop() {
        let harness = active_session(ScriptedEngine::new());
        let (extra, mut extra_rx) = Channel::new("extra");

        assert!(!harness.session.attach_second_leg(extra.clone()).unwrap());
        assert_eq!(harness.session.state(), SessionState::Active);

        // The extra channel is neither kept nor wired.
        extra.dispatch(r#"{"type":"prompt","voicePrompt":"hola"}"#);
        harness.session.close();
        assert!(extra.is_open());
        assert!(next_outbound(&mut extra_rx).await.is_none());
    }

    #[test]
    fn test_invalid_transitions() {
        let registry = Arc::new(SessionRegistry::new());
        let session = session_for(&registry, "+15550001111", unused_translator());
        let (leg, _rx) = Channel::new("leg");

        assert_eq!(
            session.attach_second_leg(leg.clone()).unwrap_err(),
            SessionError::InvalidTransition {
                action: "attach second leg",
                state: "new",
            }
        );

        session.attach_first_leg(leg.clone()).unwrap();
        assert!(matches!(
            session.attach_first_leg(leg).unwrap_err(),
            SessionError::InvalidTransition { .. }
        ));
    }

    #[test]
    fn test_start_requires_both_legs() {
        let registry = Arc::new(SessionRegistry::new());
        let session = session_for(&registry, "+15550001111", unused_translator());
        assert!(matches!(session.start(), Err(SessionError::NotReady(_))));

        let (caller, _rx) = Channel::new("caller");
        session.attach_first_leg(caller).unwrap();
        assert!(matches!(session.start(), Err(SessionError::NotReady(_))));

        session.close();
        assert!(matches!(
            session.start(),
            Err(SessionError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_manual_start_arms_once() {
        let registry = Arc::new(SessionRegistry::new());
        let session = Session::new(
            SessionKey::parse("+15550001111").unwrap(),
            SessionSettings {
                auto_start: false,
                ..SessionSettings::default()
            },
            Translator::new(Arc::new(ScriptedEngine::new().reply("hello"))),
            &registry,
        );
        let (caller, _caller_rx) = Channel::new("caller");
        let (agent, mut agent_rx) = Channel::new("agent");
        session.attach_first_leg(caller.clone()).unwrap();
        session.attach_second_leg(agent).unwrap();
        assert!(!session.is_started());

        // Not armed yet: dropped.
        caller.dispatch(r#"{"type":"prompt","voicePrompt":"uno"}"#);
        assert!(next_outbound(&mut agent_rx).await.is_none());

        assert!(session.start().unwrap());
        assert!(!session.start().unwrap());

        caller.dispatch(r#"{"type":"prompt","voicePrompt":"hola"}"#);
        let sent = next_outbound(&mut agent_rx).await.expect("Should forward");
        assert_eq!(token_of(sent), "hello");
        assert!(next_outbound(&mut agent_rx).await.is_none());
    }

    // ==================== Forwarding Tests ====================

    #[tokio::test]
    async fn test_fragment_is_translated_to_other_leg() {
        let engine = ScriptedEngine::new().reply("hello");
        let mut h = active_session(engine);

        h.caller.dispatch(r#"{"type":"fragment","text":"hola"}"#);

        let sent = next_outbound(&mut h.agent_rx).await.expect("Should forward");
        match &sent {
            Outbound::Frame(payload) => assert!(payload.contains(r#""lang":"en-US""#)),
            Outbound::Close => panic!("Expected frame"),
        }
        assert_eq!(token_of(sent), "hello");
        assert!(next_outbound(&mut h.agent_rx).await.is_none());
        assert!(h.caller_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_agent_fragment_goes_to_caller() {
        let engine = ScriptedEngine::new().reply("buenos dias");
        let mut h = active_session(engine);

        h.agent.dispatch(r#"{"type":"prompt","voicePrompt":"good morning"}"#);

        let sent = next_outbound(&mut h.caller_rx).await.expect("Should forward");
        assert_eq!(token_of(sent), "buenos dias");
        assert!(h.agent_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_engine_failure_sends_nothing() {
        let engine = ScriptedEngine::new()
            .fail("upstream 500")
            .raw("not json at all")
            .reply("still alive");
        let mut h = active_session(engine);

        h.caller.dispatch(r#"{"type":"prompt","voicePrompt":"uno"}"#);
        h.caller.dispatch(r#"{"type":"prompt","voicePrompt":"dos"}"#);
        h.caller.dispatch(r#"{"type":"prompt","voicePrompt":"tres"}"#);

        // Only the third fragment produces output; the session stays active.
        let sent = next_outbound(&mut h.agent_rx).await.expect("Should forward third");
        assert_eq!(token_of(sent), "still alive");
        assert!(next_outbound(&mut h.agent_rx).await.is_none());
        assert_eq!(h.session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_fragments_forwarded_in_order() {
        let engine = ScriptedEngine::new()
            .reply_after(Duration::from_millis(150), "one")
            .reply_after(Duration::from_millis(10), "two")
            .reply("three");
        let mut h = active_session(engine);

        h.caller.dispatch(r#"{"type":"prompt","voicePrompt":"uno"}"#);
        h.caller.dispatch(r#"{"type":"prompt","voicePrompt":"dos"}"#);
        h.caller.dispatch(r#"{"type":"prompt","voicePrompt":"tres"}"#);

        let mut tokens = Vec::new();
        for _ in 0..3 {
            let sent = next_outbound(&mut h.agent_rx).await.expect("Should forward");
            tokens.push(token_of(sent));
        }
        assert_eq!(tokens, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_fragment_while_awaiting_peer_is_dropped() {
        let registry = Arc::new(SessionRegistry::new());
        let engine = Arc::new(ScriptedEngine::new().reply("hello"));
        let session = session_for(&registry, "+15550001111", Translator::new(engine.clone()));
        let (caller, mut caller_rx) = Channel::new("caller");
        session.attach_first_leg(caller.clone()).unwrap();

        caller.dispatch(r#"{"type":"prompt","voicePrompt":"hola"}"#);

        assert!(next_outbound(&mut caller_rx).await.is_none());
        assert!(engine.requests.lock().unwrap().is_empty());
        assert_eq!(session.state(), SessionState::AwaitingPeer);
    }

    // ==================== Close Tests ====================

    #[tokio::test]
    async fn test_close_closes_both_legs_and_evicts() {
        let mut h = active_session(ScriptedEngine::new());
        assert_eq!(h.registry.len(), 1);

        h.session.close();
        h.session.close();

        assert!(!h.caller.is_open());
        assert!(!h.agent.is_open());
        assert!(h.registry.is_empty());
        assert_eq!(h.caller_rx.try_recv().unwrap(), Outbound::Close);
        assert_eq!(h.agent_rx.try_recv().unwrap(), Outbound::Close);
        assert!(h.agent_rx.try_recv().is_err());
    }

    #[test]
    fn test_close_with_single_leg() {
        let registry = Arc::new(SessionRegistry::new());
        let session = session_for(&registry, "+15550001111", unused_translator());
        registry.bind(session.key().clone(), Arc::clone(&session));
        let (caller, _rx) = Channel::new("caller");
        session.attach_first_leg(caller.clone()).unwrap();

        session.close();

        assert!(!caller.is_open());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_fragment_after_close_sends_nothing() {
        let engine = ScriptedEngine::new().reply("hello");
        let mut h = active_session(engine);
        h.session.close();
        assert_eq!(h.agent_rx.try_recv().unwrap(), Outbound::Close);
        assert_eq!(h.caller_rx.try_recv().unwrap(), Outbound::Close);

        h.caller.dispatch(r#"{"type":"prompt","voicePrompt":"hola"}"#);
        h.agent.dispatch(r#"{"type":"prompt","voicePrompt":"hello"}"#);

        assert!(next_outbound(&mut h.agent_rx).await.is_none());
        assert!(next_outbound(&mut h.caller_rx).await.is_none());
    }

    #[tokio::test]
    async fn test_in_flight_translation_dropped_on_close() {
        let engine = ScriptedEngine::new().reply_after(Duration::from_millis(200), "late");
        let mut h = active_session(engine);

        h.caller.dispatch(r#"{"type":"prompt","voicePrompt":"hola"}"#);
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.session.close();

        assert_eq!(h.agent_rx.try_recv().unwrap(), Outbound::Close);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(h.agent_rx.try_recv().is_err());
    }
}
