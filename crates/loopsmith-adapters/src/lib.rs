//! Runtime adapters for loopsmith (sandbox paths, processes, config, logging).

pub mod config;
pub mod logging;
pub mod sandbox;
pub mod util;

pub use config::AgentConfig;
pub use sandbox::{PathError, Sandbox};
