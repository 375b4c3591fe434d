//! Command-line interface of the `trainrelay` binary

mod commands;

pub use commands::{Cli, Commands};
