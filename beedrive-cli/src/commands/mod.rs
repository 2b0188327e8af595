//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod completions;
pub(crate) mod control;
pub(crate) mod info;
pub(crate) mod shell;
pub(crate) mod transfer;
