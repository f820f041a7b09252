//! Command handlers for the `copay` binary

pub mod commands;

pub use commands::*;
