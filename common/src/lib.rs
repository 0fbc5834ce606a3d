//! Common code shared between the `people_counter` publisher and the stats monitor.
pub mod protocol;

/// Error type.
pub type Error = Box<dyn std::error::Error>;
