//! Security-policy parameters and the asymmetric/symmetric primitives the
//! conversation layer drives.

pub mod asymmetric;
pub mod keys;
pub mod policy;
pub mod symmetric;

pub use keys::{derive_keys, DerivedKeySet, DirectionalKeys};
pub use policy::{AsymmetricPadding, DigestAlgorithm, SecurityPolicy, SymmetricAlgorithm};
