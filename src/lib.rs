pub mod actions;
pub mod catalog_content;
pub mod cli;
pub mod compensation;
pub mod config;
pub mod convergence;
pub mod error;
pub mod k8s;
pub mod resolver;
pub mod transport;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
