//! Flat status-code taxonomy and the exception type services raise on it:
//! one enum of status codes, one exception type that carries diagnostics
//! alongside the code, rather than a separate error type per layer.

use thiserror::Error;

/// Subset of the OPC UA status-code table actually raised by this core.
///
/// The full table has on the order of 700 entries generated from the OPC UA
/// schema; that generator is out of scope here, so only the codes this core
/// actually produces or needs to recognize are represented. Unknown codes
/// arriving on the wire are preserved as [`StatusCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StatusCode {
    Good,
    // Transport
    BadTcpMessageTypeInvalid,
    BadResponseTooLarge,
    BadProtocolVersionUnsupported,
    BadServerNotConnected,
    BadSecureChannelClosed,
    // Security
    BadSecurityChecksFailed,
    BadCertificateInvalid,
    BadApplicationSignatureInvalid,
    BadSecureChannelTokenUnknown,
    // Request / session
    BadRequestTimeout,
    BadIdentityTokenRejected,
    /// Any other status code, preserved verbatim as the numeric value on the
    /// wire so it can still be surfaced to callers and logs.
    Other(u32),
}

impl StatusCode {
    /// Returns `true` for anything other than `Good` — the OPC UA convention
    /// is that the top two bits of the numeric code classify severity, but
    /// since we don't carry the numeric table here `Good` is the only
    /// non-bad value we represent explicitly.
    pub fn is_bad(&self) -> bool {
        !matches!(self, StatusCode::Good)
    }

    pub fn is_good(&self) -> bool {
        matches!(self, StatusCode::Good)
    }

    /// The numeric encoding used on the wire, per the subset this core knows
    /// about. Values match the OPC UA specification's assigned codes.
    pub fn as_u32(&self) -> u32 {
        match self {
            StatusCode::Good => 0x0000_0000,
            StatusCode::BadTcpMessageTypeInvalid => 0x807A_0000 | 0x10,
            StatusCode::BadResponseTooLarge => 0x801B_0000,
            StatusCode::BadProtocolVersionUnsupported => 0x807E_0000,
            StatusCode::BadServerNotConnected => 0x806C_0000,
            StatusCode::BadSecureChannelClosed => 0x8057_0000,
            StatusCode::BadSecurityChecksFailed => 0x8013_0000,
            StatusCode::BadCertificateInvalid => 0x8010_0000,
            StatusCode::BadApplicationSignatureInvalid => 0x802C_0000,
            StatusCode::BadSecureChannelTokenUnknown => 0x8085_0000,
            StatusCode::BadRequestTimeout => 0x800A_0000,
            StatusCode::BadIdentityTokenRejected => 0x8022_0000,
            StatusCode::Other(code) => *code,
        }
    }

    /// Reconstructs a known variant from its numeric wire value, falling back
    /// to `Other` for anything this core doesn't special-case.
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0000_0000 => StatusCode::Good,
            c if c == StatusCode::BadTcpMessageTypeInvalid.as_u32() => {
                StatusCode::BadTcpMessageTypeInvalid
            }
            c if c == StatusCode::BadResponseTooLarge.as_u32() => StatusCode::BadResponseTooLarge,
            c if c == StatusCode::BadProtocolVersionUnsupported.as_u32() => {
                StatusCode::BadProtocolVersionUnsupported
            }
            c if c == StatusCode::BadServerNotConnected.as_u32() => {
                StatusCode::BadServerNotConnected
            }
            c if c == StatusCode::BadSecureChannelClosed.as_u32() => {
                StatusCode::BadSecureChannelClosed
            }
            c if c == StatusCode::BadSecurityChecksFailed.as_u32() => {
                StatusCode::BadSecurityChecksFailed
            }
            c if c == StatusCode::BadCertificateInvalid.as_u32() => {
                StatusCode::BadCertificateInvalid
            }
            c if c == StatusCode::BadApplicationSignatureInvalid.as_u32() => {
                StatusCode::BadApplicationSignatureInvalid
            }
            c if c == StatusCode::BadSecureChannelTokenUnknown.as_u32() => {
                StatusCode::BadSecureChannelTokenUnknown
            }
            c if c == StatusCode::BadRequestTimeout.as_u32() => StatusCode::BadRequestTimeout,
            c if c == StatusCode::BadIdentityTokenRejected.as_u32() => {
                StatusCode::BadIdentityTokenRejected
            }
            other => StatusCode::Other(other),
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (0x{:08X})", self, self.as_u32())
    }
}

/// The single exception type raised by any service call.
#[derive(Debug, Error, Clone)]
#[error("{code}: {reason}")]
pub struct ServiceResultException {
    pub code: StatusCode,
    pub reason: String,
    pub diagnostics: Option<String>,
    pub string_table: Vec<String>,
}

impl ServiceResultException {
    pub fn new(code: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            diagnostics: None,
            string_table: Vec::new(),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        self.diagnostics = Some(diagnostics.into());
        self
    }
}

pub type Result<T> = std::result::Result<T, ServiceResultException>;
