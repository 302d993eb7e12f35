//! Shared utilities: the crate-wide error type and logging setup.

pub mod error;
pub mod logging;

pub use error::{DealerError, Result};

#[cfg(test)]
mod tests {
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
        logging::init("nonsense");
    }
}
