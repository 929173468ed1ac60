//! Command-line interface: argument parsing and command runners.

pub mod commands;
pub mod parser;

pub use parser::{Cli, Command};
