//! Command file handling.
//!
//! A command file is line-oriented UTF-8 text describing command lines to
//! hand to a scheduler, with comments, quoting, short and long macros, and
//! includes. [`CommandFileParser`] turns one file into a series of
//! [`CommandSink::add_command`] calls.

pub mod parser;

pub use parser::{CommandFileParser, ConfigError};

/// Sink receiving fully-expanded command lines from the parser.
pub trait CommandSink {
    fn add_command(&mut self, argv: Vec<String>);
}
