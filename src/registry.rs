//! Process-wide lookup of live sessions by party identifier.

use crate::error::SessionError;
use crate::lock;
use crate::session::Session;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Normalized party identifier correlating the two legs of a call.
///
/// Whitespace is removed and the number is given exactly one leading `+`, so
/// `"+15550001111"`, `" 15550001111"` (a `+` decoded from a query string as a
/// space) and `"15550001111"` all name the same session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn parse(raw: &str) -> Result<SessionKey, SessionError> {
        let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        let digits = compact.trim_start_matches('+');

        if digits.is_empty() {
            return Err(SessionError::InvalidKey(raw.to_string()));
        }

        Ok(SessionKey(format!("+{}", digits)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keyed table of active sessions. At most one session per key.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &SessionKey) -> Option<Arc<Session>> {
        lock(&self.sessions).get(key).cloned()
    }

    /// Register a session, replacing any previous entry for the key.
    pub fn bind(&self, key: SessionKey, session: Arc<Session>) -> Option<Arc<Session>> {
        debug!(key = %key, "Binding session");
        lock(&self.sessions).insert(key, session)
    }

    pub fn evict(&self, key: &SessionKey) -> Option<Arc<Session>> {
        let removed = lock(&self.sessions).remove(key);
        if removed.is_some() {
            debug!(key = %key, "Evicted session");
        }
        removed
    }

    /// Evict `key` only while it still maps to `session`.
    pub fn evict_if(&self, key: &SessionKey, session: &Session) -> bool {
        let mut sessions = lock(&self.sessions);
        let matches = sessions
            .get(key)
            .is_some_and(|existing| std::ptr::eq(existing.as_ref(), session));
        if matches {
            sessions.remove(key);
            debug!(key = %key, "Evicted session");
        }
        matches
    }

    /// Look up `key`, creating and binding a session with `make` if absent.
    ///
    /// The lookup and the insert happen under one lock, so concurrent setups
    /// for the same key agree on a single session. Returns whether it was
    /// created by this call.
    pub fn try_get_or_create<F, E>(
        &self,
        key: &SessionKey,
        make: F,
    ) -> Result<(Arc<Session>, bool), E>
    where
        F: FnOnce() -> Result<Arc<Session>, E>,
    {
        let mut sessions = lock(&self.sessions);
        if let Some(existing) = sessions.get(key) {
            return Ok((Arc::clone(existing), false));
        }

        let session = make()?;
        sessions.insert(key.clone(), Arc::clone(&session));
        debug!(key = %key, "Created session");
        Ok((session, true))
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{session_for, unused_translator};
    use proptest::prelude::*;

    // ==================== SessionKey Tests ====================

    #[test]
    fn test_key_keeps_canonical_form() {
        let key = SessionKey::parse("+15550001111").unwrap();
        assert_eq!(key.as_str(), "+15550001111");
        assert_eq!(key.to_string(), "+15550001111");
    }

    #[test]
    fn test_key_from_decoded_query_string() {
        // A literal `+` in a query string decodes to a space.
        let from_query = SessionKey::parse(" 15550001111").unwrap();
        let from_setup = SessionKey::parse("+15550001111").unwrap();
        assert_eq!(from_query, from_setup);
    }

    #[test]
    fn test_key_strips_inner_whitespace_and_extra_plus() {
        assert_eq!(
            SessionKey::parse("++1 555 000 1111\n").unwrap().as_str(),
            "+15550001111"
        );
    }

    #[test]
    fn test_key_rejects_empty_identifiers() {
        assert!(SessionKey::parse("").is_err());
        assert!(SessionKey::parse("   ").is_err());
        assert!(matches!(
            SessionKey::parse("+").unwrap_err(),
            SessionError::InvalidKey(_)
        ));
    }

    proptest! {
        #[test]
        fn prop_key_normalization_is_idempotent(raw in "[+ ]{0,3}[0-9]{1,15}[ ]{0,2}") {
            let key = SessionKey::parse(&raw).unwrap();
            let again = SessionKey::parse(key.as_str()).unwrap();
            prop_assert_eq!(&key, &again);
            prop_assert!(key.as_str().starts_with('+'));
            prop_assert!(!key.as_str()[1..].contains('+'));
            prop_assert!(!key.as_str().contains(' '));
        }

        #[test]
        fn prop_leading_plus_and_spaces_do_not_change_key(digits in "[0-9]{1,15}") {
            let plain = SessionKey::parse(&digits).unwrap();
            let plus = SessionKey::parse(&format!("+{}", digits)).unwrap();
            let spaced = SessionKey::parse(&format!("  {}  ", digits)).unwrap();
            prop_assert_eq!(&plain, &plus);
            prop_assert_eq!(&plain, &spaced);
        }
    }

    // ==================== Registry Tests ====================

    fn key(raw: &str) -> SessionKey {
        SessionKey::parse(raw).unwrap()
    }

    #[test]
    fn test_bind_lookup_evict() {
        let registry = Arc::new(SessionRegistry::new());
        let session = session_for(&registry, "+15550001111", unused_translator());

        assert!(registry.is_empty());
        assert!(registry.bind(key("+15550001111"), Arc::clone(&session)).is_none());
        assert_eq!(registry.len(), 1);

        let found = registry.lookup(&key("15550001111")).expect("Should find session");
        assert!(Arc::ptr_eq(&found, &session));

        assert!(registry.evict(&key("+15550001111")).is_some());
        assert!(registry.lookup(&key("+15550001111")).is_none());
        assert!(registry.evict(&key("+15550001111")).is_none());
    }

    #[test]
    fn test_try_get_or_create_creates_once() {
        let registry = Arc::new(SessionRegistry::new());
        let translator = unused_translator();
        let k = key("+15550001111");

        let (first, created) = registry
            .try_get_or_create::<_, SessionError>(&k, || {
                Ok(session_for(&registry, "+15550001111", translator.clone()))
            })
            .unwrap();
        assert!(created);

        let (second, created) = registry
            .try_get_or_create::<_, SessionError>(&k, || panic!("Should not build a second session"))
            .unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_try_get_or_create_races_create_exactly_once() {
        const CONTENDERS: usize = 8;

        for _ in 0..50 {
            let registry = Arc::new(SessionRegistry::new());
            let translator = unused_translator();
            let start = std::sync::Barrier::new(CONTENDERS);

            let results: Vec<(Arc<Session>, bool)> = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..CONTENDERS)
                    .map(|_| {
                        let registry = &registry;
                        let translator = translator.clone();
                        let start = &start;
                        scope.spawn(move || {
                            start.wait();
                            registry
                                .try_get_or_create::<_, SessionError>(&key("+15550001111"), || {
                                    Ok(session_for(registry, "+15550001111", translator))
                                })
                                .unwrap()
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
            let winner = &results[0].0;
            assert!(results.iter().all(|(session, _)| Arc::ptr_eq(session, winner)));
            assert_eq!(registry.len(), 1);
        }
    }

    #[test]
    fn test_try_get_or_create_propagates_factory_error() {
        let registry = SessionRegistry::new();
        let k = key("+15550001111");

        let result = registry.try_get_or_create(&k, || Err(SessionError::NotFound("x".into())));

        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_evict_if_ignores_replaced_session() {
        let registry = Arc::new(SessionRegistry::new());
        let translator = unused_translator();
        let old = session_for(&registry, "+15550001111", translator.clone());
        let new = session_for(&registry, "+15550001111", translator);

        registry.bind(key("+15550001111"), Arc::clone(&new));

        assert!(!registry.evict_if(&key("+15550001111"), &old));
        assert_eq!(registry.len(), 1);
        assert!(registry.evict_if(&key("+15550001111"), &new));
        assert!(registry.is_empty());
    }
}
