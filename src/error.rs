//! Typed errors carrying source locations.
//!
//! The distinction between the variants matters for control flow:
//! resolution errors are caught and swallowed during implicit-rule search
//! so that other candidate rules can be tried, while every other kind
//! surfaces through the callback chain and terminates the invocation with
//! exit code 2.

use thiserror::Error;

use crate::location::Location;

#[derive(Clone, Debug, Error)]
pub enum MakeError {
    /// A malformed makefile construct.
    #[error("{loc}: {msg}")]
    Syntax { msg: String, loc: Location },

    /// Well-formed input whose semantics are invalid.
    #[error("{}{msg}", fmt_loc(.loc))]
    Data { msg: String, loc: Option<Location> },

    /// Recursion in the dependency graph, or no rule to make a target.
    #[error("{}{msg}", fmt_loc(.loc))]
    Resolution { msg: String, loc: Option<Location> },

    /// A recipe exited nonzero and the command was not `-`-prefixed.
    #[error("{loc}: command '{cmd}' failed, return code {code}")]
    Command {
        cmd: String,
        code: i32,
        loc: Location,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

fn fmt_loc(loc: &Option<Location>) -> String {
    match loc {
        Some(loc) => format!("{}: ", loc),
        None => String::new(),
    }
}

impl MakeError {
    pub fn syntax(msg: impl Into<String>, loc: Location) -> Self {
        Self::Syntax {
            msg: msg.into(),
            loc,
        }
    }

    pub fn data(msg: impl Into<String>, loc: Option<Location>) -> Self {
        Self::Data {
            msg: msg.into(),
            loc,
        }
    }

    pub fn resolution(msg: impl Into<String>, loc: Option<Location>) -> Self {
        Self::Resolution {
            msg: msg.into(),
            loc,
        }
    }

    /// Implicit-rule search discards candidates on these instead of failing.
    pub fn is_resolution(&self) -> bool {
        matches!(self, Self::Resolution { .. })
    }
}
