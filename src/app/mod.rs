pub mod config;

pub use config::{ConfigResolver, DeploymentMode, ResolvedConfig};
