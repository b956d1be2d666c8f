#![allow(clippy::cargo_common_metadata)]

pub mod config;
pub mod error;

pub use config::HarnessConfig;
pub use error::{BoxcatError, Result};
