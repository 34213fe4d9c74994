//! Typed duplex channel over one relay connection.
//!
//! A [`Channel`] sits between a transport (a WebSocket in production, a plain
//! queue in tests) and the session logic. Inbound raw messages are decoded into
//! [`Frame`]s and handed to the handlers subscribed for that frame's kind, in
//! subscription order. Outbound frames are encoded and queued for the transport
//! writer, which drains the receiver returned by [`Channel::new`].

use crate::frame::{Frame, FrameKind};
use crate::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Handler invoked for every decoded frame of a subscribed kind.
///
/// Returning an error only logs it; the channel and later handlers carry on.
pub type FrameHandler = Arc<dyn Fn(&Frame) -> anyhow::Result<()> + Send + Sync>;

type CloseHandler = Box<dyn FnOnce() + Send>;

/// What the transport writer should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// An encoded frame to write as one text message
    Frame(String),
    /// Close the underlying connection
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closed,
}

/// Cheaply cloneable handle to one connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    label: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    handlers: Mutex<HashMap<FrameKind, Vec<FrameHandler>>>,
    close_handlers: Mutex<Vec<CloseHandler>>,
    state: watch::Sender<ChannelState>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.inner.label)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl Channel {
    /// Create an open channel and the receiver its transport writer drains.
    pub fn new(label: impl Into<String>) -> (Channel, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Open);

        let channel = Channel {
            inner: Arc::new(ChannelInner {
                label: label.into(),
                outbound,
                handlers: Mutex::new(HashMap::new()),
                close_handlers: Mutex::new(Vec::new()),
                state,
            }),
        };

        (channel, outbound_rx)
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Register a handler for one frame kind. Handlers run in registration order.
    pub fn subscribe<F>(&self, kind: FrameKind, handler: F)
    where
        F: Fn(&Frame) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        lock(&self.inner.handlers)
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register a handler to run once when the channel closes.
    ///
    /// If the channel is already closed the handler runs immediately.
    pub fn on_close<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut close_handlers = lock(&self.inner.close_handlers);
            if self.is_open() {
                close_handlers.push(Box::new(handler));
                return;
            }
        }
        handler();
    }

    /// Encode and queue a frame for the transport.
    ///
    /// Never fails loudly: a closed channel or an encoding error is logged and
    /// the frame dropped. Returns whether the frame was queued.
    pub fn send(&self, frame: &Frame) -> bool {
        if !self.is_open() {
            debug!(
                channel = %self.inner.label,
                kind = frame.kind().as_str(),
                "Channel closed, dropping outbound frame"
            );
            return false;
        }

        let payload = match frame.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %self.inner.label, error = %e, "Failed to encode outbound frame");
                return false;
            }
        };

        debug!(channel = %self.inner.label, "Sending frame: {}", payload);

        if self.inner.outbound.send(Outbound::Frame(payload)).is_err() {
            warn!(channel = %self.inner.label, "Transport writer is gone, frame dropped");
            return false;
        }

        true
    }

    /// Close the channel. Idempotent; close handlers run exactly once.
    pub fn close(&self) {
        let was_open = self.inner.state.send_if_modified(|state| {
            if *state == ChannelState::Open {
                *state = ChannelState::Closed;
                true
            } else {
                false
            }
        });

        if !was_open {
            return;
        }

        info!(channel = %self.inner.label, "Channel closed");

        // The writer may already be gone if the peer hung up first.
        let _ = self.inner.outbound.send(Outbound::Close);

        // Handlers often hold clones of this channel.
        lock(&self.inner.handlers).clear();

        let handlers = std::mem::take(&mut *lock(&self.inner.close_handlers));
        for handler in handlers {
            handler();
        }
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ChannelState::Closed)
            .await
            .is_ok();
    }

    /// Decode one raw inbound message and run the matching handlers.
    ///
    /// Undecodable frames and unknown discriminants are logged and dropped;
    /// the channel stays open either way. A closed channel drops everything.
    pub fn dispatch(&self, raw: &str) {
        if !self.is_open() {
            debug!(channel = %self.inner.label, "Channel closed, ignoring inbound frame");
            return;
        }

        let frame = match Frame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(channel = %self.inner.label, error = %e, "Dropping frame: {}", raw);
                return;
            }
        };

        let kind = frame.kind();

        // Snapshot so handlers may subscribe or close without deadlocking.
        let handlers = lock(&self.inner.handlers)
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(channel = %self.inner.label, kind = kind.as_str(), "No handler for frame");
            return;
        }

        for handler in handlers {
            if let Err(e) = handler(&frame) {
                warn!(
                    channel = %self.inner.label,
                    kind = kind.as_str(),
                    "Frame handler failed: {:#}",
                    e
                );
            }
        }
    }
}
