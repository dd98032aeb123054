//! # rmake
//!
//! This is a GNU-compatible implementation of `make`, written in Rust.
//! The binary is a thin front-end: it collects the argv, environment, and
//! working directory, hands them to the library's command driver, and
//! spins the event loop until the invocation reports an exit code.

use std::cell::Cell;
use std::rc::Rc;

use rmake::process::Scheduler;
use rmake::vars::Env;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let env: Env = std::env::vars().collect();
    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(e) => {
            eprintln!("make: failed to get working directory: {e}");
            std::process::exit(2);
        }
    };

    let scheduler = Scheduler::new();
    let exit_code = Rc::new(Cell::new(None));

    let exit = Rc::clone(&exit_code);
    rmake::command::main(
        &args,
        env,
        &cwd,
        None,
        &scheduler,
        Box::new(move |code| exit.set(Some(code))),
    );

    std::process::exit(scheduler.spin(&exit_code));
}
