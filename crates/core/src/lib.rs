pub mod config;
pub mod error;
pub mod job;
pub mod node;

pub use config::{Config, NodeConfig, SchedulerConfig};
pub use error::*;
pub use job::*;
pub use node::*;
