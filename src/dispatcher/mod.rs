//! The client secure channel dispatcher: request handle
//! allocation, response correlation, and the `ClientSecureChannel` that ties
//! them to a [`crate::conversation::engine::Conversation`] and a
//! [`crate::transport::TransportConnection`].

pub mod channel;
pub mod handle;
pub mod pending;

pub use channel::ClientSecureChannel;
pub use handle::HandleAllocator;
pub use pending::PendingCompletions;
