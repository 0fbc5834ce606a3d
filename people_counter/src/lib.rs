pub mod config;
pub mod counter;
pub mod meter;
pub mod nn;
pub mod overlay;
pub mod pipeline;
pub mod publisher;
pub mod sink;
pub mod sources;
pub mod ssd;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
