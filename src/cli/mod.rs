//! Command-line front end for the wallet kit

pub mod commands;

pub use commands::*;
