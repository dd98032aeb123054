//! The `clap`-based `Args` struct.
//!
//! Unlike a typical CLI, these arguments are parsed inside the library:
//! sub-make invocations re-enter `command::main` in-process with a fresh
//! argv, and `MAKEFLAGS` words from the environment are prepended to the
//! real arguments so both parse through the same struct.

use clap::Parser;
use const_format::formatcp;

/// Represents the arguments accepted by this binary.
#[derive(Clone, Debug, Parser)]
#[command(
    name = "rmake",
    about = "A GNU-compatible implementation of make, written in Rust.",
    disable_version_flag = true,
    after_help = formatcp!(
        "License:  {}\nSource:   {}", env!("CARGO_PKG_LICENSE"), env!("CARGO_PKG_REPOSITORY")
    ),
)]
pub struct Args {
    /// Goal target(s); arguments of the form `NAME=value` become
    /// command-line variable overrides instead.
    #[arg()]
    pub targets: Vec<String>,

    /// Read FILE as a makefile.
    #[arg(short, long, visible_alias("makefile"), value_name = "FILE")]
    pub file: Vec<String>,

    /// Print debug information to the log.
    #[arg(short = 'd')]
    pub verbose: bool,

    /// Send the debug log to FILE.
    #[arg(long = "debug-log", value_name = "FILE")]
    pub debug_log: Option<String>,

    /// Change to DIR before reading the makefiles.
    #[arg(short = 'C', long = "directory", value_name = "DIR")]
    pub directory: Option<String>,

    /// Print the version and exit.
    #[arg(short = 'v', long = "version")]
    pub print_version: bool,

    /// Allow N jobs at once.
    #[arg(short = 'j', long = "jobs", value_name = "N", default_value_t = 1)]
    pub jobs: usize,

    /// Do not print the entering/leaving directory lines.
    #[arg(long = "no-print-directory", action = clap::ArgAction::SetFalse)]
    pub print_directory: bool,
}

impl Args {
    /// The flag words to hand down through `MAKEFLAGS`: short flags
    /// concatenated into one word, long flags space-separated after it.
    pub fn makeflags_words(&self) -> String {
        let mut short = String::new();
        if self.verbose {
            short.push('d');
        }
        short.push_str(&format!("j{}", self.jobs));

        let mut long = Vec::new();
        if let Some(log) = &self.debug_log {
            long.push(format!("--debug-log={log}"));
        }
        if !self.print_directory {
            long.push("--no-print-directory".to_string());
        }

        format!("{} {}", short, long.join(" ")).trim_end().to_string()
    }
}

pub const VERSION_BANNER: &str = formatcp!(
    "{} {}: GNU-compatible make program\n\
     This is free software; see the source for copying conditions.\n\
     There is NO warranty; not even for MERCHANTABILITY or FITNESS FOR A\n\
     PARTICULAR PURPOSE.",
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_VERSION"),
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_flags() {
        let args =
            Args::try_parse_from(["rmake", "-f", "x.mk", "-j", "4", "all", "V=1"]).unwrap();
        assert_eq!(args.file, vec!["x.mk"]);
        assert_eq!(args.jobs, 4);
        assert_eq!(args.targets, vec!["all", "V=1"]);
        assert!(args.print_directory);
    }

    #[test]
    fn test_no_print_directory() {
        let args = Args::try_parse_from(["rmake", "--no-print-directory"]).unwrap();
        assert!(!args.print_directory);
    }

    #[test]
    fn test_makeflags_words() {
        let args = Args::try_parse_from(["rmake", "-d", "-j", "2"]).unwrap();
        assert_eq!(args.makeflags_words(), "dj2");

        let args =
            Args::try_parse_from(["rmake", "--no-print-directory"]).unwrap();
        assert_eq!(args.makeflags_words(), "j1 --no-print-directory");
    }
}
