//! Trust layer: signs outgoing payloads and verifies incoming ones.

pub mod signatures;

pub use signatures::SignatureStore;
