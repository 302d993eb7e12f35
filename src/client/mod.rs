//! Application-facing side of the engine: message creation, sending,
//! response callbacks and cache recovery.

pub mod callbacks;
pub mod dispatch;

pub use callbacks::CallbackTable;
pub use dispatch::DispatchClient;
