#![allow(clippy::cargo_common_metadata)]

pub mod builder;
pub mod conf;
pub mod listener;
pub mod logs;
pub mod process;

pub use builder::{BuildOnce, SERVER_BUILD};
pub use process::{ServerHarness, harness};
