//! procstate manager library
//!
//! Command implementations behind the `procstate` binary.

pub mod cli_output;
pub mod commands;
