//! Token rotation bookkeeping: at most two tokens live at once, the active
//! one and the immediately prior one kept for the inbound overlap window.

use crate::crypto::DerivedKeySet;
use crate::types::SecurityToken;

pub struct InstalledToken {
    pub token: SecurityToken,
    pub keys: DerivedKeySet,
}

/// Holds the active token plus, briefly, the one it replaced. The previous
/// token is retained until explicitly discarded by the dispatcher rather
/// than on a timer, since the dispatcher is what knows whether in-flight
/// inbound frames might still reference it.
#[derive(Default)]
pub struct TokenRing {
    active: Option<InstalledToken>,
    previous: Option<InstalledToken>,
}

impl TokenRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&InstalledToken> {
        self.active.as_ref()
    }

    pub fn previous(&self) -> Option<&InstalledToken> {
        self.previous.as_ref()
    }

    /// Installs a freshly issued or renewed token, demoting the prior
    /// active token to `previous`. Called by the dispatcher only after it
    /// has fenced concurrent sends.
    pub fn install(&mut self, token: SecurityToken, keys: DerivedKeySet) {
        self.previous = self.active.take();
        self.active = Some(InstalledToken { token, keys });
    }

    /// Finds the token matching `token_id`, trying the active token first
    /// then the previous one: either the active or the most recently
    /// superseded token is accepted.
    pub fn find(&self, token_id: u32) -> Option<&InstalledToken> {
        self.active
            .as_ref()
            .filter(|t| t.token.token_id == token_id)
            .or_else(|| self.previous.as_ref().filter(|t| t.token.token_id == token_id))
    }

    /// Drops the previous token once the dispatcher decides the overlap
    /// window has passed (no open timer here; see [`TokenRing`] docs).
    pub fn discard_previous(&mut self) {
        self.previous = None;
    }

    pub fn is_due_for_renewal(&self) -> bool {
        self.active.as_ref().map(|t| t.token.is_due_for_renewal()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn token(channel_id: u32, token_id: u32) -> SecurityToken {
        SecurityToken::new(channel_id, token_id, Duration::from_secs(3600))
    }

    fn keys() -> DerivedKeySet {
        crate::crypto::derive_keys(
            crate::crypto::SecurityPolicy::Basic256Sha256,
            &[1u8; 32],
            &[2u8; 32],
        )
        .unwrap()
    }

    #[test]
    fn install_demotes_active_to_previous() {
        let mut ring = TokenRing::new();
        ring.install(token(1, 100), keys());
        ring.install(token(1, 101), keys());
        assert_eq!(ring.active().unwrap().token.token_id, 101);
        assert_eq!(ring.previous().unwrap().token.token_id, 100);
    }

    #[test]
    fn find_matches_active_or_previous() {
        let mut ring = TokenRing::new();
        ring.install(token(1, 100), keys());
        ring.install(token(1, 101), keys());
        assert!(ring.find(101).is_some());
        assert!(ring.find(100).is_some());
        assert!(ring.find(999).is_none());
    }

    #[test]
    fn discard_previous_drops_old_token_only() {
        let mut ring = TokenRing::new();
        ring.install(token(1, 100), keys());
        ring.install(token(1, 101), keys());
        ring.discard_previous();
        assert!(ring.find(100).is_none());
        assert!(ring.find(101).is_some());
    }
}
