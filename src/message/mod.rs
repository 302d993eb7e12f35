//! Message model shared by the registry, the cache and the client.

mod envelope;
mod path;
mod policy;
mod response;

pub use envelope::{Envelope, Message};
pub use path::MessagePath;
pub use policy::MessagePolicy;
pub use response::{ResponseCallback, ResponseData, ResponseInfo, ResponseStatus};
