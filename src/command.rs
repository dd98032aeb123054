//! Logic to execute a command-line invocation: flag parsing (including
//! `MAKEFLAGS` from the environment), makefile discovery, the restart
//! loop for remaking makefiles, and dispatching the goal targets.
//!
//! `main` is callable both from the binary front-end and in-process from
//! a recipe that invokes this tool recursively.

use std::cell::{Cell, RefCell};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use clap::Parser;

use crate::args::{Args, VERSION_BANNER};
use crate::error::MakeError;
use crate::logger::{log_info, FileLogger, Logger, StderrLogger};
use crate::makefile::Makefile;
use crate::parser;
use crate::process::{Context, Scheduler, StatusCb};
use crate::rule_map::make_target;
use crate::vars::Env;

const DEFAULT_MAKEFILE: &str = "Makefile";

/// Split the `MAKEFLAGS` environment value into words, honoring
/// backslash-escaped whitespace, and synthesize a leading `-` if absent.
pub fn parse_makeflags(env: &Env) -> Result<Vec<String>, MakeError> {
    let makeflags = env
        .get("MAKEFLAGS")
        .map(String::as_str)
        .unwrap_or("")
        .trim();
    if makeflags.is_empty() {
        return Ok(Vec::new());
    }

    let makeflags = if makeflags.starts_with(['-', ' ']) {
        makeflags.to_string()
    } else {
        format!("-{makeflags}")
    };

    let mut opts = Vec::new();
    let mut current = String::new();
    let mut chars = makeflags.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            if !current.is_empty() {
                opts.push(std::mem::take(&mut current));
            }
            while chars.peek().is_some_and(|n| n.is_whitespace()) {
                chars.next();
            }
            continue;
        }

        if c == '\\' {
            match chars.next() {
                Some(n) => current.push(n),
                None => {
                    return Err(MakeError::data("MAKEFLAGS has trailing backslash", None));
                }
            }
            continue;
        }

        current.push(c);
    }
    if !current.is_empty() {
        opts.push(current);
    }

    Ok(opts)
}

/// State shared by the restart loop and the goal callbacks.
struct Invocation {
    scheduler: Rc<Scheduler>,
    context: Rc<Context>,
    subcontext: bool,
    env: Env,
    workdir: PathBuf,
    makelevel: usize,
    makeflags: String,
    makefiles: Vec<String>,
    arguments: Vec<String>,
    print_directory: bool,
    logger: Rc<dyn Logger>,
    restarts: Cell<i32>,
    cb: RefCell<Option<StatusCb>>,
}

impl Invocation {
    fn leave(&self) {
        if self.print_directory {
            println!(
                "make[{}]: Leaving directory '{}'",
                self.makelevel,
                self.workdir.display()
            );
            let _ = std::io::stdout().flush();
        }
    }

    fn done(&self, code: i32) {
        if let Some(cb) = self.cb.borrow_mut().take() {
            cb(code);
        }
    }
}

fn fail(inv: &Rc<Invocation>, e: &MakeError) {
    eprintln!("{e}");
    inv.leave();
    inv.done(2);
}

/// Entry point for an invocation. `context` is the parent's execution
/// context for in-process sub-makes, or `None` at the top level; `cb`
/// receives the exit code.
pub fn main(
    args: &[String],
    env: Env,
    cwd: &Path,
    context: Option<Rc<Context>>,
    scheduler: &Rc<Scheduler>,
    cb: StatusCb,
) {
    let makelevel: usize = env
        .get("MAKELEVEL")
        .and_then(|l| l.parse().ok())
        .unwrap_or(0);

    let flag_words = match parse_makeflags(&env) {
        Ok(words) => words,
        Err(e) => {
            eprintln!("{e}");
            cb(2);
            return;
        }
    };

    let mut argv: Vec<String> = vec!["rmake".to_string()];
    argv.extend(flag_words);
    argv.extend(args.iter().cloned());

    let options = match Args::try_parse_from(argv) {
        Ok(options) => options,
        Err(e) => {
            let _ = e.print();
            cb(2);
            return;
        }
    };

    if options.print_version {
        println!("{}", VERSION_BANNER);
        cb(0);
        return;
    }

    let workdir = match &options.directory {
        Some(dir) => cwd.join(dir),
        None => cwd.to_path_buf(),
    };

    let logger: Rc<dyn Logger> = match &options.debug_log {
        Some(path) => match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            Ok(file) => Rc::new(FileLogger::new(file)),
            Err(e) => {
                eprintln!("make: cannot open debug log '{path}': {e}");
                cb(2);
                return;
            }
        },
        None => Rc::new(StderrLogger {
            verbose: options.verbose,
        }),
    };

    let jobs = options.jobs.max(1);
    let (context, subcontext) = match context {
        Some(parent) if parent.jcount() > 1 && jobs == 1 => {
            // A serial sub-make nested under a parallel parent gets its
            // own context so its subtree stays serialized.
            (scheduler.new_context(1), true)
        }
        Some(parent) => (parent, false),
        None => (scheduler.new_context(jobs), true),
    };

    if options.print_directory {
        println!(
            "make[{makelevel}]: Entering directory '{}'",
            workdir.display()
        );
        let _ = std::io::stdout().flush();
    }

    let mut makefiles = options.file.clone();
    if makefiles.is_empty() {
        if workdir.join(DEFAULT_MAKEFILE).is_file() {
            makefiles.push(DEFAULT_MAKEFILE.to_string());
        } else {
            println!("No makefile found");
            cb(2);
            return;
        }
    }

    let inv = Rc::new(Invocation {
        scheduler: Rc::clone(scheduler),
        context,
        subcontext,
        env,
        workdir,
        makelevel,
        makeflags: options.makeflags_words(),
        makefiles,
        arguments: options.targets.clone(),
        print_directory: options.print_directory,
        logger,
        restarts: Cell::new(-1),
        cb: RefCell::new(Some(cb)),
    });

    restart_parse(inv);
}

/// Re-entry point for in-process sub-make forwarding; recovers the
/// scheduler from the parent context.
pub fn main_in_context(args: &[String], env: Env, cwd: &Path, context: Rc<Context>, cb: StatusCb) {
    let Some(scheduler) = context.scheduler() else {
        eprintln!("internal error: context has no scheduler");
        cb(2);
        return;
    };
    main(args, env, cwd, Some(context), &scheduler, cb);
}

/// Parse all makefiles (again), remake them as targets, and either
/// restart or move on to the goals.
fn restart_parse(inv: Rc<Invocation>) {
    inv.restarts.set(inv.restarts.get() + 1);
    if inv.restarts.get() > 0 {
        log_info(
            inv.logger.as_ref(),
            format!("make[{}]: Restarting makefile parsing", inv.makelevel),
            None,
        );
    }

    let makefile = Makefile::new(
        inv.workdir.clone(),
        inv.env.clone(),
        inv.restarts.get(),
        inv.makeflags.clone(),
        inv.makelevel,
        Rc::clone(&inv.context),
        Rc::clone(&inv.logger),
    );

    let goals = match parser::parse_command_line_args(&makefile, &inv.arguments) {
        Ok(goals) => goals,
        Err(e) => return fail(&inv, &e),
    };

    for f in &inv.makefiles {
        if let Err(e) = makefile.include(f, true, None) {
            return fail(&inv, &e);
        }
    }

    makefile.finish_parsing();

    let mf = Rc::clone(&makefile);
    let inv2 = Rc::clone(&inv);
    makefile.remake_makefiles(Box::new(move |remade| {
        if remade {
            restart_parse(inv2);
        } else {
            run_goals(inv2, mf, goals);
        }
    }));
}

fn run_goals(inv: Rc<Invocation>, makefile: Rc<Makefile>, goals: Vec<String>) {
    let (goals, stack_entry) = if goals.is_empty() {
        match makefile.default_target() {
            Some(t) => (vec![t], "<default-target>"),
            None => {
                println!("No target specified and no default target found.");
                inv.leave();
                inv.done(2);
                return;
            }
        }
    } else {
        (goals, "<command-line>")
    };

    let total = goals.len();
    let remade = Rc::new(Cell::new(0usize));
    let failed = Rc::new(Cell::new(false));

    for goal in goals {
        let target = makefile.get_target(&goal, true);
        let inv = Rc::clone(&inv);
        let makefile2 = Rc::clone(&makefile);
        let remade = Rc::clone(&remade);
        let failed = Rc::clone(&failed);

        make_target(
            &makefile,
            &target,
            vec![stack_entry.to_string()],
            Vec::new(),
            false,
            Box::new(move |error, did_anything| {
                match error {
                    Some(e) => {
                        eprintln!("{e}");
                        failed.set(true);
                    }
                    None if !did_anything => {
                        log_info(
                            makefile2.logger(),
                            format!("Target '{goal}' is up to date."),
                            None,
                        );
                    }
                    None => {}
                }

                remade.set(remade.get() + 1);
                if remade.get() == total {
                    if inv.subcontext {
                        inv.scheduler.finish_context(&inv.context);
                    }
                    inv.leave();
                    inv.done(if failed.get() { 2 } else { 0 });
                }
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with(makeflags: &str) -> Env {
        let mut env = Env::new();
        env.insert("MAKEFLAGS".to_string(), makeflags.to_string());
        env
    }

    #[test]
    fn test_parse_makeflags_empty() {
        assert!(parse_makeflags(&Env::new()).unwrap().is_empty());
        assert!(parse_makeflags(&env_with("   ")).unwrap().is_empty());
    }

    #[test]
    fn test_parse_makeflags_synthesizes_dash() {
        assert_eq!(parse_makeflags(&env_with("j2")).unwrap(), vec!["-j2"]);
        assert_eq!(parse_makeflags(&env_with("-d -j2")).unwrap(), vec!["-d", "-j2"]);
    }

    #[test]
    fn test_parse_makeflags_escaped_whitespace() {
        assert_eq!(
            parse_makeflags(&env_with("-d -- V=a\\ b")).unwrap(),
            vec!["-d", "--", "V=a b"]
        );
    }

    #[test]
    fn test_parse_makeflags_trailing_backslash() {
        assert!(parse_makeflags(&env_with("-d \\")).is_err());
    }
}
