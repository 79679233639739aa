//! Utility functions and helpers

mod logging;

pub use logging::setup_logging;
