//! Routing layer between accepted connections and sessions.
//!
//! A [`Relay`] owns the session registry and the collaborators sessions need.
//! Every accepted connection is handed to [`Relay::accept_leg`], which wires
//! its setup and termination frames; everything after that is driven by
//! frames arriving on the channel.

use crate::call_control::{CallControl, OriginateRequest};
use crate::channel::Channel;
use crate::config::Config;
use crate::error::SessionError;
use crate::frame::{EndFrame, Frame, FrameKind, SetupFrame, TranscriptionLanguageFrame};
use crate::registry::{SessionKey, SessionRegistry};
use crate::session::{Session, SessionSettings};
use crate::translation::Translator;
use crate::twiml;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{error, info, warn};

/// Which side of the call a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegDirection {
    /// The customer who dialed in; creates the session
    Inbound,
    /// The agent leg we originated; joins an existing session
    Outbound,
}

impl LegDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegDirection::Inbound => "inbound",
            LegDirection::Outbound => "outbound",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub public_domain: String,
    /// Number agent legs are dialed from
    pub caller_number: String,
    /// Number dialed to reach an agent
    pub agent_number: String,
    pub welcome_greeting: String,
    /// `<Connect action>` for the agent leg's markup
    pub agent_connect_action: Option<String>,
    pub session: SessionSettings,
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            public_domain: config.public_domain.clone(),
            caller_number: config.twilio_caller_number.clone(),
            agent_number: config.twilio_agent_number.clone(),
            welcome_greeting: config.welcome_greeting.clone(),
            agent_connect_action: config.agent_connect_action_url.clone(),
            session: SessionSettings {
                languages: config.languages(),
                auto_start: config.auto_start_translation,
            },
        }
    }
}

/// Result of handling a setup frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    /// A new session was created with this leg as its first leg
    Created,
    /// This leg completed an existing session
    Bound,
    /// The session already had both legs
    AlreadyActive,
}

/// What one connection knows about the session it joined.
#[derive(Default)]
struct LegBinding {
    key: OnceLock<SessionKey>,
    session: OnceLock<Weak<Session>>,
    surplus: AtomicBool,
}

pub struct Relay {
    registry: Arc<SessionRegistry>,
    translator: Translator,
    call_control: Arc<dyn CallControl>,
    settings: RelaySettings,
}

impl Relay {
    pub fn new(
        registry: Arc<SessionRegistry>,
        translator: Translator,
        call_control: Arc<dyn CallControl>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            registry,
            translator,
            call_control,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Wire a newly accepted connection.
    ///
    /// `from_hint` is the party identifier carried in the connection URL; agent
    /// legs use it to find the caller's session.
    pub fn accept_leg(self: &Arc<Self>, channel: &Channel, direction: LegDirection, from_hint: Option<String>) {
        let binding = Arc::new(LegBinding::default());

        {
            let relay = Arc::clone(self);
            let binding = Arc::clone(&binding);
            let leg = channel.clone();
            channel.subscribe(FrameKind::Setup, move |frame| {
                let Frame::Setup(setup) = frame else {
                    return Ok(());
                };
                if binding.key.get().is_some() || binding.surplus.load(Ordering::Acquire) {
                    warn!(channel = leg.label(), "Duplicate setup on one connection, ignoring");
                    return Ok(());
                }

                let (key, session, outcome) =
                    relay.handle_setup(&leg, direction, from_hint.as_deref(), setup)?;
                info!(session = %key, channel = leg.label(), ?outcome, "Setup handled");
                // A surplus leg is never part of the session: neither its
                // termination frames nor its hangup may end it.
                if outcome == SetupOutcome::AlreadyActive {
                    binding.surplus.store(true, Ordering::Release);
                    return Ok(());
                }
                let _ = binding.key.set(key);
                let _ = binding.session.set(Arc::downgrade(&session));
                Ok(())
            });
        }

        {
            let relay = Arc::clone(self);
            let binding = Arc::clone(&binding);
            channel.subscribe(FrameKind::End, move |frame| {
                let Frame::End(end) = frame else {
                    return Ok(());
                };
                relay.handle_end(binding.key.get(), end)?;
                Ok(())
            });
        }

        {
            let label = channel.label().to_string();
            channel.subscribe(FrameKind::Interrupt, move |frame| {
                if let Frame::Interrupt(interrupt) = frame {
                    info!(
                        channel = %label,
                        after_ms = interrupt.duration_until_interrupt_ms,
                        "Playback interrupted after: {}",
                        interrupt.utterance_until_interrupt
                    );
                }
                Ok(())
            });
        }

        // Losing either transport tears the whole session down.
        channel.on_close(move || {
            if let Some(session) = binding.session.get().and_then(Weak::upgrade) {
                session.close();
            }
        });
    }

    /// Create or join a session for a leg's setup frame.
    pub fn handle_setup(
        self: &Arc<Self>,
        channel: &Channel,
        direction: LegDirection,
        from_hint: Option<&str>,
        setup: &SetupFrame,
    ) -> Result<(SessionKey, Arc<Session>, SetupOutcome), SessionError> {
        match direction {
            LegDirection::Inbound => {
                let key = SessionKey::parse(&setup.from)?;
                let (session, created) = self.registry.try_get_or_create(&key, || {
                    let session = Session::new(
                        key.clone(),
                        self.settings.session.clone(),
                        self.translator.clone(),
                        &self.registry,
                    );
                    session.attach_first_leg(channel.clone())?;
                    Ok::<_, SessionError>(session)
                })?;

                if created {
                    info!(
                        session = %key,
                        call_sid = %setup.call_sid,
                        "Caller connected"
                    );
                    let lang = self.settings.session.languages.caller.code.clone();
                    channel.send(&Frame::TranscriptionLanguage(TranscriptionLanguageFrame {
                        lang,
                    }));
                    self.originate_agent_leg(&key, &session);
                    return Ok((key, session, SetupOutcome::Created));
                }

                let outcome = Self::bind_second_leg(&session, channel)?;
                Ok((key, session, outcome))
            }
            LegDirection::Outbound => {
                let key = SessionKey::parse(from_hint.unwrap_or(&setup.from))?;
                let session = self
                    .registry
                    .lookup(&key)
                    .ok_or_else(|| SessionError::NotFound(key.to_string()))?;

                info!(session = %key, call_sid = %setup.call_sid, "Agent connected");
                let outcome = Self::bind_second_leg(&session, channel)?;
                Ok((key, session, outcome))
            }
        }
    }

    fn bind_second_leg(session: &Arc<Session>, channel: &Channel) -> Result<SetupOutcome, SessionError> {
        if session.attach_second_leg(channel.clone())? {
            Ok(SetupOutcome::Bound)
        } else {
            Ok(SetupOutcome::AlreadyActive)
        }
    }

    /// Close the session named by a termination frame.
    ///
    /// The frame's `from` wins; without one the leg's own session key is used.
    pub fn handle_end(&self, leg_key: Option<&SessionKey>, end: &EndFrame) -> Result<(), SessionError> {
        let key = match end.from.as_deref().map(SessionKey::parse) {
            Some(Ok(key)) => key,
            Some(Err(e)) => match leg_key {
                Some(key) => key.clone(),
                None => return Err(e),
            },
            None => match leg_key {
                Some(key) => key.clone(),
                None => return Err(SessionError::NotFound("<unknown party>".to_string())),
            },
        };

        let session = self
            .registry
            .lookup(&key)
            .ok_or_else(|| SessionError::NotFound(key.to_string()))?;

        info!(session = %key, "Termination received, closing session");
        session.close();
        self.registry.evict_if(&key, &session);
        Ok(())
    }

    /// Arm translation for a session from an external trigger.
    pub fn start_session(&self, key: &SessionKey) -> Result<bool, SessionError> {
        let session = self
            .registry
            .lookup(key)
            .ok_or_else(|| SessionError::NotFound(key.to_string()))?;
        session.start()
    }

    fn originate_agent_leg(&self, key: &SessionKey, session: &Arc<Session>) {
        let markup = match twiml::relay_url(&self.settings.public_domain, LegDirection::Outbound, key.as_str()) {
            Ok(url) => twiml::connect_relay(
                &url,
                &self.settings.session.languages.agent,
                &self.settings.welcome_greeting,
                self.settings.agent_connect_action.as_deref(),
            ),
            Err(e) => {
                error!(session = %key, "Cannot build agent relay markup: {:#}", e);
                session.close();
                return;
            }
        };

        let request = OriginateRequest {
            from: self.settings.caller_number.clone(),
            to: self.settings.agent_number.clone(),
            caller_id: key.to_string(),
            markup,
        };

        let call_control = Arc::clone(&self.call_control);
        let session = Arc::downgrade(session);
        let key = key.clone();

        tokio::spawn(async move {
            info!(session = %key, "Connecting to agent");
            match call_control.originate(request).await {
                Ok(call_sid) => info!(session = %key, %call_sid, "Agent call placed"),
                Err(e) => {
                    error!(session = %key, error = %e, "Failed to place agent call, closing session");
                    if let Some(session) = session.upgrade() {
                        session.close();
                    }
                }
            }
        });
    }
}
