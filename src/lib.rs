mod constants;

pub mod cli;
pub mod logging;
pub mod metrics;
pub mod provider;
pub mod resources;
pub mod server;

pub use cli::Cli;
