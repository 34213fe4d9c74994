//! Relay two voice-call legs over WebSocket and translate every utterance
//! between them.

pub mod call_control;
pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod openai;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod translation;
pub mod twiml;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
