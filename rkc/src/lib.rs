pub mod cli;
pub mod cluster;
pub mod config;
pub mod server;
pub mod sessions;
pub mod task;

pub use cluster::LocalCluster;
pub use config::{Config, load_config};
pub use sessions::LocalSessionService;
pub use task::LocalTaskService;
