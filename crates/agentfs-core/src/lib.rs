pub mod error;
pub mod types;
pub mod record;
pub mod config;
pub mod store;
pub mod sandbox;
pub mod backend;
pub mod tool;
pub mod util;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
