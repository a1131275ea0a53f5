//! CLI subcommands

pub mod preview;
pub mod run;
