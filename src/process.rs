//! Parallel execution of recipe processes.
//!
//! Skipping shell invocations is good, when possible: trivial command
//! lines are split into an argv and spawned directly. Sub-make
//! invocations that name this binary are re-entered in-process so the job
//! budget stays global. Everything is driven off a single event loop
//! (`Scheduler::spin`) that waits for any child and fires the matching
//! continuation.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::rc::Rc;

use crate::command;
use crate::util::check_msys_compat;
use crate::vars::Env;

/// Continuation fired with the signed process status: the exit code, or
/// the negated signal number.
pub type StatusCb = Box<dyn FnOnce(i32)>;

/// Characters that force a command line through the shell.
const BLACKLIST: &[char] = &[
    '=', '\\', '$', '>', '<', ';', '*', '?', '[', '{', '~', '`', '|', '&',
];

/// First words that are shell built-ins, which also force the shell.
const SHELL_WORDS: &[&str] = &[
    ":", ".", "break", "cd", "continue", "exec", "exit", "export", "getopts", "hash", "pwd",
    "readonly", "return", "shift", "test", "times", "trap", "umask", "unset", "alias", "set",
    "bind", "builtin", "caller", "command", "declare", "echo", "enable", "help", "let", "local",
    "logout", "printf", "read", "shopt", "source", "type", "typeset", "ulimit", "unalias",
];

/// If this command line can safely skip the shell, return an argv array.
/// Words are split with POSIX shell rules; comment words are dropped.
pub fn cline_to_argv(cline: &str) -> Option<Vec<String>> {
    if cline.contains(BLACKLIST) {
        return None;
    }

    let mut argv = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = cline.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some(q) if q == c => break,
                        Some(q) => word.push(q),
                        // An unbalanced quote; let the shell complain.
                        None => return None,
                    }
                }
            }
            '#' if !in_word => {
                // A comment runs to the end of the line.
                break;
            }
            c if c.is_whitespace() => {
                if in_word {
                    argv.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        argv.push(word);
    }

    Some(argv)
}

/// Convert a wait status into a signed numeric result.
#[cfg(unix)]
fn status_to_result(status: nix::sys::wait::WaitStatus) -> Option<(i32, i32)> {
    use nix::sys::wait::WaitStatus;
    match status {
        WaitStatus::Exited(pid, code) => Some((pid.as_raw(), code)),
        WaitStatus::Signaled(pid, sig, _) => Some((pid.as_raw(), -(sig as i32))),
        _ => None,
    }
}

struct Running {
    child: Child,
    cb: StatusCb,
}

/// A parallelism budget: a job count, a FIFO of deferred continuations,
/// and the children currently running against the budget.
pub struct Context {
    jcount: usize,
    pending: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    running: RefCell<Vec<Running>>,
    scheduler: std::rc::Weak<Scheduler>,
}

impl Context {
    pub fn jcount(&self) -> usize {
        self.jcount
    }

    /// The scheduler this context belongs to.
    pub fn scheduler(&self) -> Option<Rc<Scheduler>> {
        self.scheduler.upgrade()
    }

    /// Queue a continuation to run when a job slot frees up.
    pub fn defer(&self, f: Box<dyn FnOnce()>) {
        self.pending.borrow_mut().push_back(f);
    }

    /// Asynchronously call the process.
    pub fn call(
        self: &Rc<Self>,
        argv: Vec<String>,
        shell: bool,
        env: Env,
        cwd: PathBuf,
        echo: Option<String>,
        cb: StatusCb,
    ) {
        let ctx = Rc::clone(self);
        self.defer(Box::new(move || {
            ctx.do_call(argv, shell, env, cwd, echo, cb)
        }));
    }

    fn do_call(
        &self,
        argv: Vec<String>,
        shell: bool,
        env: Env,
        cwd: PathBuf,
        echo: Option<String>,
        cb: StatusCb,
    ) {
        if let Some(echo) = echo {
            println!("{}", echo);
        }

        let mut cmd = if shell {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg(argv.join(" "));
            cmd
        } else {
            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..]);
            cmd
        };

        cmd.env_clear().envs(&env).current_dir(&cwd);
        match cmd.spawn() {
            Ok(child) => self.running.borrow_mut().push(Running { child, cb }),
            Err(e) => {
                eprintln!("make: {}: {}", argv.first().map(String::as_str).unwrap_or(""), e);
                cb(127);
            }
        }
    }

    /// Drain pending continuations while job slots are free.
    fn run(&self) {
        loop {
            if self.running.borrow().len() >= self.jcount {
                return;
            }
            let Some(f) = self.pending.borrow_mut().pop_front() else {
                return;
            };
            f();
        }
    }

    fn idle(&self) -> bool {
        self.pending.borrow().is_empty() && self.running.borrow().is_empty()
    }
}

/// The process-wide set of execution contexts and the event loop.
pub struct Scheduler {
    contexts: RefCell<Vec<Rc<Context>>>,
}

impl Scheduler {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            contexts: RefCell::new(Vec::new()),
        })
    }

    pub fn new_context(self: &Rc<Self>, jcount: usize) -> Rc<Context> {
        debug_assert!(jcount > 0);
        let context = Rc::new(Context {
            jcount,
            pending: RefCell::new(VecDeque::new()),
            running: RefCell::new(Vec::new()),
            scheduler: Rc::downgrade(self),
        });
        self.contexts.borrow_mut().push(Rc::clone(&context));
        context
    }

    /// Retire a context once its work has drained.
    pub fn finish_context(&self, context: &Rc<Context>) {
        debug_assert!(context.idle());
        self.contexts
            .borrow_mut()
            .retain(|c| !Rc::ptr_eq(c, context));
    }

    /// Spin the event loop until the top-level callback reports an exit
    /// code and all contexts have drained.
    pub fn spin(&self, exit_code: &Cell<Option<i32>>) -> i32 {
        loop {
            let contexts: Vec<Rc<Context>> = self.contexts.borrow().clone();
            for c in &contexts {
                c.run();
            }

            let any_running = contexts.iter().any(|c| !c.running.borrow().is_empty());
            if !any_running {
                if let Some(code) = exit_code.get() {
                    return code;
                }
                let any_pending = contexts.iter().any(|c| !c.pending.borrow().is_empty());
                if !any_pending {
                    // Nothing running, nothing queued, no exit code: a
                    // continuation was lost somewhere.
                    eprintln!("make: internal error: event loop starved");
                    return 2;
                }
                continue;
            }

            if let Some((pid, result)) = self.wait_any() {
                let mut found = None;
                for c in &contexts {
                    let mut running = c.running.borrow_mut();
                    if let Some(i) = running.iter().position(|r| r.child.id() as i32 == pid) {
                        found = Some(running.remove(i));
                        break;
                    }
                }
                if let Some(running) = found {
                    (running.cb)(result);
                }
            }
        }
    }

    /// Wait for any child to exit.
    #[cfg(unix)]
    fn wait_any(&self) -> Option<(i32, i32)> {
        loop {
            match nix::sys::wait::wait() {
                Ok(status) => {
                    if let Some(result) = status_to_result(status) {
                        return Some(result);
                    }
                }
                Err(_) => return None,
            }
        }
    }

    /// Portable fallback: block on the oldest running child.
    #[cfg(not(unix))]
    fn wait_any(&self) -> Option<(i32, i32)> {
        let contexts: Vec<Rc<Context>> = self.contexts.borrow().clone();
        for c in &contexts {
            let mut running = c.running.borrow_mut();
            if let Some(r) = running.first_mut() {
                let pid = r.child.id() as i32;
                let status = r.child.wait().ok()?;
                return Some((pid, status.code().unwrap_or(-1)));
            }
        }
        None
    }
}

/// Run one recipe line: through the shell when metacharacters or shell
/// built-ins demand it, in-process when it names this binary, and as a
/// directly-spawned argv otherwise.
pub fn call(
    cline: &str,
    env: &Env,
    cwd: &Path,
    context: Rc<Context>,
    echo: Option<String>,
    cb: StatusCb,
) {
    let argv = cline_to_argv(cline);

    let (shell, prepend_shell) = match check_msys_compat() {
        Ok((shell, msys)) => (shell, msys),
        Err(_) => ("/bin/sh".to_string(), false),
    };

    let needs_shell = match &argv {
        None => true,
        Some(argv) => argv
            .first()
            .map(|w| SHELL_WORDS.contains(&w.as_str()))
            .unwrap_or(false),
    };

    if needs_shell {
        let argv = if prepend_shell {
            vec![shell, "-c".to_string(), cline.to_string()]
        } else {
            vec![cline.to_string()]
        };
        context.call(argv, !prepend_shell, env.clone(), cwd.to_path_buf(), echo, cb);
        return;
    }

    let argv = argv.expect("needs_shell covered the None case");
    if argv.is_empty() {
        cb(0);
        return;
    }

    // A recipe invoking this binary is forwarded in-process, reusing the
    // current context so the job budget stays global.
    if is_self_invocation(&argv[0]) {
        if let Some(echo) = echo {
            println!("{}", echo);
        }
        command::main_in_context(&argv[1..], env.clone(), cwd, context, cb);
        return;
    }

    context.call(argv, false, env.clone(), cwd.to_path_buf(), echo, cb);
}

lazy_static::lazy_static! {
    /// The canonical path of this binary, resolved once.
    static ref SELF_EXE: Option<PathBuf> =
        std::env::current_exe().ok().and_then(|p| p.canonicalize().ok());
}

fn is_self_invocation(word: &str) -> bool {
    let Some(me) = SELF_EXE.as_ref() else {
        return false;
    };
    std::fs::canonicalize(word).map(|p| &p == me).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_words_split() {
        assert_eq!(
            cline_to_argv("gcc -o foo foo.c").unwrap(),
            vec!["gcc", "-o", "foo", "foo.c"]
        );
    }

    #[test]
    fn test_quotes_group_words() {
        assert_eq!(
            cline_to_argv("touch 'a b' \"c d\"").unwrap(),
            vec!["touch", "a b", "c d"]
        );
    }

    #[test]
    fn test_comments_are_dropped() {
        assert_eq!(cline_to_argv("touch foo # and more").unwrap(), vec!["touch", "foo"]);
    }

    #[test]
    fn test_metacharacters_force_shell() {
        for cline in ["echo $HOME", "cat < in", "a | b", "touch a;b", "ls *.c"] {
            assert!(cline_to_argv(cline).is_none(), "{cline}");
        }
    }

    #[test]
    fn test_empty_line_yields_empty_argv() {
        assert_eq!(cline_to_argv("   ").unwrap(), Vec::<String>::new());
        assert_eq!(cline_to_argv("# just a comment").unwrap(), Vec::<String>::new());
    }
}
