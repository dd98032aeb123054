//! End-to-end engine tests driving full invocations in-process: the
//! command driver, parser, dependency resolution, and the scheduler all
//! run against real scratch directories.

use std::cell::Cell;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use rmake::command;
use rmake::process::Scheduler;
use rmake::vars::Env;

/// Run one full invocation with `dir` as the working directory and
/// return the exit code.
fn run_make(dir: &Path, args: &[&str]) -> i32 {
    let mut env: Env = std::env::vars().collect();
    env.remove("MAKEFLAGS");
    env.remove("MAKELEVEL");

    let mut full_args = vec!["--no-print-directory".to_string()];
    full_args.extend(args.iter().map(|a| a.to_string()));

    let scheduler = Scheduler::new();
    let exit_code = Rc::new(Cell::new(None));
    let exit = Rc::clone(&exit_code);
    command::main(
        &full_args,
        env,
        dir,
        None,
        &scheduler,
        Box::new(move |code| exit.set(Some(code))),
    );
    scheduler.spin(&exit_code)
}

fn write(dir: &Path, name: &str, content: &str) {
    fs::write(dir.join(name), content).unwrap();
}

fn read(dir: &Path, name: &str) -> String {
    fs::read_to_string(dir.join(name)).unwrap_or_default()
}

#[test]
fn test_implicit_rule_chaining() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "Makefile",
        "%.o: %.c\n\t@cp $< $@\n%.c: %.y\n\t@cp $< $@\n",
    );
    write(dir.path(), "foo.y", "grammar\n");

    assert_eq!(run_make(dir.path(), &["foo.o"]), 0);
    assert_eq!(read(dir.path(), "foo.c"), "grammar\n");
    assert_eq!(read(dir.path(), "foo.o"), "grammar\n");
}

#[test]
fn test_diamond_dependencies_run_once() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "Makefile",
        concat!(
            "a: b c\n\t@echo a >> log\n",
            "b: common\n\t@echo b >> log\n",
            "c: common\n\t@echo c >> log\n",
            "common:\n\t@echo common >> log\n",
        ),
    );

    assert_eq!(run_make(dir.path(), &["a"]), 0);

    let log = read(dir.path(), "log");
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.iter().filter(|l| **l == "common").count(), 1);
    assert_eq!(lines.first(), Some(&"common"));
    assert_eq!(lines.last(), Some(&"a"));
    assert_eq!(lines.len(), 4);
}

#[test]
fn test_out_of_date_detection() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "Makefile",
        "out: dep\n\t@cat dep > out\n\t@echo run >> counter\n",
    );
    write(dir.path(), "dep", "v1\n");

    assert_eq!(run_make(dir.path(), &[]), 0);
    assert_eq!(read(dir.path(), "out"), "v1\n");
    assert_eq!(read(dir.path(), "counter").lines().count(), 1);

    // Nothing changed: the target is up to date.
    assert_eq!(run_make(dir.path(), &[]), 0);
    assert_eq!(read(dir.path(), "counter").lines().count(), 1);

    // Touch the prerequisite: the target is remade.
    write(dir.path(), "dep", "v2\n");
    assert_eq!(run_make(dir.path(), &[]), 0);
    assert_eq!(read(dir.path(), "out"), "v2\n");
    assert_eq!(read(dir.path(), "counter").lines().count(), 2);
}

#[test]
fn test_recursive_dependency_fails() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "Makefile", "a: b\n\t@true\nb: a\n\t@true\n");
    assert_eq!(run_make(dir.path(), &["a"]), 2);
}

#[test]
fn test_no_rule_to_make_target() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "Makefile", "all:\n\t@true\n");
    assert_eq!(run_make(dir.path(), &["nosuch"]), 2);
}

#[test]
fn test_failing_recipe_exits_2() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "Makefile", "fail:\n\t@false\n");
    assert_eq!(run_make(dir.path(), &["fail"]), 2);
}

#[test]
fn test_ignored_failure_continues() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "Makefile",
        "all:\n\t-@false\n\t@echo survived > out\n",
    );
    assert_eq!(run_make(dir.path(), &["all"]), 0);
    assert_eq!(read(dir.path(), "out"), "survived\n");
}

#[test]
fn test_included_makefile_restart() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "Makefile",
        concat!(
            "-include gen.mk\n",
            "all:\n\t@echo \"$(VAL)\" > out\n",
            "gen.mk:\n\t@echo 'VAL = from-gen' > gen.mk\n",
        ),
    );

    assert_eq!(run_make(dir.path(), &[]), 0);
    assert_eq!(read(dir.path(), "gen.mk"), "VAL = from-gen\n");
    assert_eq!(read(dir.path(), "out"), "from-gen\n");
}

#[test]
fn test_phony_targets_always_run() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "Makefile",
        ".PHONY: always\nalways:\n\t@echo ran >> phony_log\n",
    );
    // A file with the target's name exists but must be ignored.
    write(dir.path(), "always", "");

    assert_eq!(run_make(dir.path(), &["always"]), 0);
    assert_eq!(run_make(dir.path(), &["always"]), 0);
    assert_eq!(read(dir.path(), "phony_log").lines().count(), 2);
}

#[test]
fn test_double_colon_rules_run_independently() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "Makefile",
        "dc::\n\t@echo one >> dclog\ndc::\n\t@echo two >> dclog\n",
    );
    assert_eq!(run_make(dir.path(), &["dc"]), 0);
    assert_eq!(read(dir.path(), "dclog"), "one\ntwo\n");
}

#[test]
fn test_pattern_specific_variables_merge() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "Makefile",
        "%.pv: PV = patvalue\nthing.pv:\n\t@echo \"$(PV)\" > thing.pv\n",
    );
    assert_eq!(run_make(dir.path(), &["thing.pv"]), 0);
    assert_eq!(read(dir.path(), "thing.pv"), "patvalue\n");
}

#[test]
fn test_vpath_search_resolves_prerequisites() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("srcdir")).unwrap();
    write(dir.path(), "srcdir/in.src", "payload\n");
    write(
        dir.path(),
        "Makefile",
        "vpath %.src srcdir\nout: in.src\n\t@cat $< > out\n",
    );

    assert_eq!(run_make(dir.path(), &["out"]), 0);
    assert_eq!(read(dir.path(), "out"), "payload\n");
}

#[test]
fn test_automatic_variables() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "Makefile",
        concat!(
            "out: one two one\n",
            "\t@echo \"at=$@ first=$< all=$^ plus=$+\" > auto\n",
            "one:\n\t@touch one\n",
            "two:\n\t@touch two\n",
        ),
    );

    assert_eq!(run_make(dir.path(), &["out"]), 0);
    assert_eq!(
        read(dir.path(), "auto"),
        "at=out first=one all=one two plus=one two one\n"
    );
}

#[test]
fn test_static_pattern_rule_builds() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.c", "A\n");
    write(dir.path(), "b.c", "B\n");
    write(
        dir.path(),
        "Makefile",
        "objs = a.o b.o\nall: $(objs)\n$(objs): %.o: %.c\n\t@cat $< > $@\n",
    );

    assert_eq!(run_make(dir.path(), &[]), 0);
    assert_eq!(read(dir.path(), "a.o"), "A\n");
    assert_eq!(read(dir.path(), "b.o"), "B\n");
}

#[test]
fn test_shell_function_and_wildcard() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "x.dat", "");
    write(dir.path(), "y.dat", "");
    write(
        dir.path(),
        "Makefile",
        concat!(
            "FOUND := $(wildcard *.dat)\n",
            "SAID := $(shell echo said)\n",
            "all:\n\t@echo \"$(FOUND)|$(SAID)\" > report\n",
        ),
    );

    assert_eq!(run_make(dir.path(), &[]), 0);
    assert_eq!(read(dir.path(), "report"), "x.dat y.dat|said\n");
}
