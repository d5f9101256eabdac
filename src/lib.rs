pub mod backoff;
pub mod bridge;
pub mod cache;
pub mod cloud;
pub mod collectors;
pub mod config;
pub mod context;
pub mod discovery;
pub mod entity;
pub mod identity;
pub mod managers;
pub mod registry;
pub mod supervisor;
pub mod util;

/// Version reported to the control plane
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
