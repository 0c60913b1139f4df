pub mod assets;
pub mod collections;
pub mod config;
pub mod error;
pub mod fetch;
pub mod hooks;
pub mod install;
pub mod io;
pub mod lock;
pub mod migrations;
pub mod network;
pub mod orchestrator;
pub mod paths;
pub mod service;
pub mod vcs;

#[cfg(test)]
mod test_support;

pub use error::{Result, UpkeepError};
