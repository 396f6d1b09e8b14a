//! Client-facing configuration.
//!
//! Separates user-facing knobs from a validated/normalized form, except
//! there is no compilation step here: every field already has a sane
//! default and no combination of values is individually invalid (limits are
//! clamped, not rejected), so `ClientConfig` doubles as both forms.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables exposed by the client secure channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default timeout hint attached to outgoing requests, in milliseconds.
    pub timeout_hint: Duration,
    /// Diagnostics bitmask attached to outgoing requests.
    pub diagnostics_hint: u32,
    pub local_receive_buffer_size: u32,
    pub local_send_buffer_size: u32,
    pub local_max_message_size: u32,
    pub local_max_chunk_count: u32,
    /// How long a session is allowed to go without activity before the
    /// server may discard it.
    pub session_timeout: Duration,
    /// Lifetime requested when issuing or renewing a secure-channel token.
    pub token_requested_lifetime: Duration,
    /// Whether to apply the handle-0 correlation fallback for
    /// non-conformant servers that echo back a request handle of zero.
    pub accept_handle_zero_correlation: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_hint: Duration::from_millis(15_000),
            diagnostics_hint: 0,
            local_receive_buffer_size: 64 * 1024,
            local_send_buffer_size: 64 * 1024,
            local_max_message_size: 16 * 1024 * 1024,
            local_max_chunk_count: 4096,
            session_timeout: Duration::from_millis(120_000),
            token_requested_lifetime: Duration::from_millis(3_600_000),
            accept_handle_zero_correlation: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout_hint, Duration::from_millis(15_000));
        assert_eq!(config.local_receive_buffer_size, 64 * 1024);
        assert_eq!(config.local_max_message_size, 16 * 1024 * 1024);
        assert_eq!(config.local_max_chunk_count, 4096);
        assert_eq!(config.session_timeout, Duration::from_millis(120_000));
        assert_eq!(
            config.token_requested_lifetime,
            Duration::from_millis(3_600_000)
        );
        assert!(config.accept_handle_zero_correlation);
    }
}
