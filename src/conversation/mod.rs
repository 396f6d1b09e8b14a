//! The secure conversation layer: chunk headers, token
//! rotation, and the `Conversation` that chunks, signs/encrypts, and
//! reassembles messages for one secure channel.

pub mod chunk;
pub mod engine;
pub mod token;

pub use chunk::{AsymmetricSecurityHeader, SecureConversationHeader, SequenceHeader, SymmetricSecurityHeader};
pub use engine::{Conversation, PeerCredentials};
pub use token::{InstalledToken, TokenRing};
