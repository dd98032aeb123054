//! Target records, rule lists, VPATH resolution, implicit-rule search,
//! out-of-date detection, and recipe execution.
//!
//! `make_target` is written in continuation-passing style: prerequisite
//! makes are requested in declaration order and joined with a counter,
//! recipe lines run through the process scheduler, and the result is
//! memoized on the target so each target executes at most once per
//! invocation.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::SystemTime;

use crate::error::MakeError;
use crate::expand::Expansion;
use crate::location::Location;
use crate::logger::log_debug;
use crate::makefile::Makefile;
use crate::pattern::Pattern;
use crate::process;
use crate::util::{path_split, split_words, without_dups};
use crate::vars::{self, Flavor, Source, VarScope};

/// Callback fired when a `make_target` request completes: an error (if
/// any) and whether anything was actually remade.
pub type MakeCb = Box<dyn FnOnce(Option<MakeError>, bool)>;

/// An explicit rule: prerequisites and commands for one or more targets.
#[derive(Debug)]
pub struct Rule {
    pub prerequisites: Vec<String>,
    pub double_colon: bool,
    pub loc: Location,
    commands: RefCell<Vec<Expansion>>,
}

impl Rule {
    pub fn new(prerequisites: Vec<String>, double_colon: bool, loc: Location) -> Self {
        Self {
            prerequisites,
            double_colon,
            loc,
            commands: RefCell::new(Vec::new()),
        }
    }

    pub fn add_command(&self, c: Expansion) {
        self.commands.borrow_mut().push(c);
    }

    pub fn commands(&self) -> Vec<Expansion> {
        self.commands.borrow().clone()
    }

    pub fn has_commands(&self) -> bool {
        !self.commands.borrow().is_empty()
    }
}

/// A pattern rule is not a rule; it's a formula for creating one.
#[derive(Debug)]
pub struct PatternRule {
    pub target_patterns: Vec<Pattern>,
    pub prerequisites: Vec<Pattern>,
    pub double_colon: bool,
    pub loc: Location,
    commands: RefCell<Vec<Expansion>>,
}

impl PatternRule {
    pub fn new(
        target_patterns: Vec<Pattern>,
        prerequisites: Vec<Pattern>,
        double_colon: bool,
        loc: Location,
    ) -> Self {
        Self {
            target_patterns,
            prerequisites,
            double_colon,
            loc,
            commands: RefCell::new(Vec::new()),
        }
    }

    pub fn add_command(&self, c: Expansion) {
        self.commands.borrow_mut().push(c);
    }

    pub fn commands(&self) -> Vec<Expansion> {
        self.commands.borrow().clone()
    }

    pub fn has_commands(&self) -> bool {
        !self.commands.borrow().is_empty()
    }
}

/// A pattern rule bound to a concrete `(dir, stem)`, exposing the same
/// interface as an explicit rule.
#[derive(Debug)]
pub struct PatternRuleInstance {
    pub rule: Rc<PatternRule>,
    pub dir: String,
    pub stem: String,
    pub match_any: bool,
}

impl PatternRuleInstance {
    pub fn new(rule: Rc<PatternRule>, dir: String, stem: String, match_any: bool) -> Self {
        Self {
            rule,
            dir,
            stem,
            match_any,
        }
    }

    pub fn prerequisites(&self) -> Vec<String> {
        self.rule
            .prerequisites
            .iter()
            .map(|p| p.resolve(&self.dir, &self.stem))
            .collect()
    }
}

/// A rule attached to a target: either an explicit rule or a pattern-rule
/// instance.
#[derive(Clone, Debug)]
pub enum TargetRule {
    Explicit(Rc<Rule>),
    Pattern(Rc<PatternRuleInstance>),
}

impl TargetRule {
    pub fn prerequisites(&self) -> Vec<String> {
        match self {
            Self::Explicit(r) => r.prerequisites.clone(),
            Self::Pattern(i) => i.prerequisites(),
        }
    }

    pub fn double_colon(&self) -> bool {
        match self {
            Self::Explicit(r) => r.double_colon,
            Self::Pattern(i) => i.rule.double_colon,
        }
    }

    pub fn loc(&self) -> Location {
        match self {
            Self::Explicit(r) => r.loc.clone(),
            Self::Pattern(i) => i.rule.loc.clone(),
        }
    }

    pub fn commands(&self) -> Vec<Expansion> {
        match self {
            Self::Explicit(r) => r.commands(),
            Self::Pattern(i) => i.rule.commands(),
        }
    }

    pub fn has_commands(&self) -> bool {
        match self {
            Self::Explicit(r) => r.has_commands(),
            Self::Pattern(i) => i.rule.has_commands(),
        }
    }

    pub fn stem(&self) -> Option<&str> {
        match self {
            Self::Explicit(_) => None,
            Self::Pattern(i) => Some(&i.stem),
        }
    }

    /// The pattern rule behind this entry, for rule-stack bookkeeping.
    pub fn pattern_rule(&self) -> Option<&Rc<PatternRule>> {
        match self {
            Self::Explicit(_) => None,
            Self::Pattern(i) => Some(&i.rule),
        }
    }
}

/// Whether a `make_target` request has run, and what it produced.
#[derive(Default)]
enum MakeState {
    #[default]
    NotStarted,
    /// In flight; callbacks of re-entrant requests queue up here.
    Working(Vec<MakeCb>),
    Finished {
        error: Option<MakeError>,
        did_anything: bool,
    },
}

/// A node in the target graph, created lazily on first reference.
pub struct Target {
    pub name: String,
    rules: Vec<TargetRule>,
    pub variables: VarScope,
    /// Set when the target is named in a makefile (or already visited as
    /// an explicit prerequisite); targets created solely through implicit
    /// chaining stay false.
    pub explicit: bool,
    /// The filesystem-relative path this target resolved to, or the bare
    /// name for phony and missing targets.
    pub vpathtarget: Option<String>,
    pub mtime: Option<SystemTime>,
    /// Snapshot of `mtime` taken before remaking, used by `$?`.
    pub realmtime: Option<SystemTime>,
    state: MakeState,
    pattern_vars_merged: bool,
}

impl Target {
    pub fn new(name: String, variables: VarScope) -> Self {
        Self {
            name,
            rules: Vec::new(),
            variables,
            explicit: false,
            vpathtarget: None,
            mtime: None,
            realmtime: None,
            state: MakeState::default(),
            pattern_vars_merged: false,
        }
    }

    pub fn rules(&self) -> &[TargetRule] {
        &self.rules
    }

    /// Attach a rule, catching single/double-colon mixing.
    pub fn add_rule(&mut self, rule: TargetRule, loc: &Location) -> Result<(), MakeError> {
        if let Some(first) = self.rules.first() {
            if first.double_colon() != rule.double_colon() {
                return Err(MakeError::data(
                    "Cannot define rules using `:` and `::` on the same target.",
                    Some(loc.clone()),
                ));
            }
        }
        self.rules.push(rule);
        Ok(())
    }

    pub fn has_command_rule(&self) -> bool {
        self.rules.iter().any(|r| r.has_commands())
    }

    /// Re-read the mtime of the resolved path.
    fn refresh_mtime(&mut self, makefile: &Makefile) {
        self.mtime = self
            .vpathtarget
            .as_ref()
            .and_then(|p| makefile.mtime_of(p));
    }

    /// Snapshot state before remaking so `$?` sees what was newer than
    /// the target at the start of this invocation.
    fn remake(&mut self) {
        self.realmtime = self.mtime;
        self.mtime = None;
        self.vpathtarget = None;
    }
}

pub type TargetRef = Rc<RefCell<Target>>;

/// Resolve a target's VPATH: phony targets resolve to their bare name
/// with no mtime, `-l` targets search `.LIBPATTERNS`, absolute paths skip
/// directory search, and everything else tries the workdir and the vpath
/// directories in order.
pub fn resolve_vpath(makefile: &Makefile, target: &TargetRef) -> Result<(), MakeError> {
    if target.borrow().vpathtarget.is_some() {
        return Ok(());
    }

    if makefile
        .global_scope()
        .borrow()
        .get_raw("GPATH")
        .is_some_and(|(_, _, v)| !v.is_empty())
    {
        return Err(MakeError::data(
            "GPATH functionality is not implemented",
            None,
        ));
    }

    let name = target.borrow().name.clone();

    if makefile.is_phony(&name) {
        let mut t = target.borrow_mut();
        t.vpathtarget = Some(name);
        t.mtime = None;
        return Ok(());
    }

    if let Some(stem) = name.strip_prefix("-l") {
        let libpatterns = makefile.lib_patterns()?;
        let mut search = vec![".".to_string()];
        search.extend(makefile.vpath_dirs_for(&name)?);

        for dir in &search {
            for pattern in &libpatterns {
                let libname = pattern.resolve("", stem);
                let candidate = if dir == "." {
                    libname
                } else {
                    format!("{}/{}", dir.trim_end_matches('/'), libname)
                };
                if let Some(mtime) = makefile.mtime_of(&candidate) {
                    let mut t = target.borrow_mut();
                    t.vpathtarget = Some(candidate);
                    t.mtime = Some(mtime);
                    return Ok(());
                }
            }
        }

        let mut t = target.borrow_mut();
        t.vpathtarget = Some(name);
        t.mtime = None;
        return Ok(());
    }

    if std::path::Path::new(&name).is_absolute() {
        let mtime = makefile.mtime_of(&name);
        let mut t = target.borrow_mut();
        t.vpathtarget = Some(name);
        t.mtime = mtime;
        return Ok(());
    }

    // The workdir first, then each matching vpath directory.
    let mut candidates = vec![name.clone()];
    for dir in makefile.vpath_dirs_for(&name)? {
        candidates.push(format!("{}/{}", dir.trim_end_matches('/'), name));
    }

    for candidate in candidates {
        if let Some(mtime) = makefile.mtime_of(&candidate) {
            let mut t = target.borrow_mut();
            t.vpathtarget = Some(candidate);
            t.mtime = Some(mtime);
            return Ok(());
        }
    }

    let mut t = target.borrow_mut();
    t.vpathtarget = Some(name);
    t.mtime = None;
    Ok(())
}

/// Resolve a target's dependency graph: VPATH, implicit-rule search if no
/// rule carries commands, a recursive walk of prerequisites, and the
/// merge of matching pattern-variable scopes.
pub fn resolve_deps(
    makefile: &Rc<Makefile>,
    target: &TargetRef,
    target_stack: &[String],
    rule_stack: &[Rc<PatternRule>],
    required: bool,
) -> Result<(), MakeError> {
    let name = target.borrow().name.clone();
    if target_stack.contains(&name) {
        return Err(MakeError::resolution(
            format!(
                "Recursive dependency: {} -> {}",
                target_stack.join(" -> "),
                name
            ),
            None,
        ));
    }

    let mut stack: Vec<String> = target_stack.to_vec();
    stack.push(name.clone());

    resolve_vpath(makefile, target)?;

    if !target.borrow().has_command_rule() {
        resolve_implicit_rule(makefile, target, &stack, rule_stack)?;
    }

    {
        let t = target.borrow();
        let have_prereqs = t.rules.iter().any(|r| !r.prerequisites().is_empty());
        if !t.has_command_rule() && t.mtime.is_none() && !have_prereqs && required {
            let needed_by = target_stack
                .last()
                .map(|p| format!(", needed by '{p}'"))
                .unwrap_or_default();
            return Err(MakeError::resolution(
                format!("No rule to make target '{name}'{needed_by}"),
                None,
            ));
        }
    }

    let rules = target.borrow().rules().to_vec();
    for rule in &rules {
        let mut new_rule_stack: Vec<Rc<PatternRule>> = rule_stack.to_vec();
        if let Some(pr) = rule.pattern_rule() {
            new_rule_stack.push(Rc::clone(pr));
        }

        for dep in rule.prerequisites() {
            let dt = makefile.get_target(&dep, false);
            // Already-explicit prerequisites were walked before; the flag
            // doubles as the visited marker.
            if dt.borrow().explicit {
                continue;
            }
            dt.borrow_mut().explicit = true;
            resolve_deps(makefile, &dt, &stack, &new_rule_stack, true)?;
        }
    }

    if !target.borrow().pattern_vars_merged {
        target.borrow_mut().pattern_vars_merged = true;
        for scope in makefile.pattern_variables_matching(&name) {
            let other = scope.borrow();
            target.borrow().variables.borrow_mut().merge_from(&other);
        }
    }

    Ok(())
}

/// Search the implicit rules for a way to build `target`, trying direct
/// candidates first and rule chaining second. Resolution errors inside
/// the search discard the candidate instead of failing the build.
fn resolve_implicit_rule(
    makefile: &Rc<Makefile>,
    target: &TargetRef,
    target_stack: &[String],
    rule_stack: &[Rc<PatternRule>],
) -> Result<(), MakeError> {
    let name = target.borrow().name.clone();
    let (dir, file) = path_split(&name, "");

    struct Candidate {
        instance: PatternRuleInstance,
    }

    let mut candidates: Vec<Candidate> = Vec::new();
    let mut have_non_match_any = false;

    for rule in makefile.implicit_rules() {
        if !rule.has_commands() {
            continue;
        }
        if rule_stack.iter().any(|r| Rc::ptr_eq(r, &rule)) {
            // No chain reuses the same pattern rule.
            continue;
        }

        for pattern in &rule.target_patterns {
            let instance = if let Some(stem) = pattern.match_word(file) {
                Some(PatternRuleInstance::new(
                    Rc::clone(&rule),
                    dir.to_string(),
                    stem,
                    pattern.is_match_any(),
                ))
            } else {
                pattern.match_word(&name).map(|stem| {
                    PatternRuleInstance::new(
                        Rc::clone(&rule),
                        String::new(),
                        stem,
                        pattern.is_match_any(),
                    )
                })
            };

            if let Some(instance) = instance {
                if !instance.match_any {
                    have_non_match_any = true;
                }
                candidates.push(Candidate { instance });
            }
        }
    }

    // A match-anything pattern is only usable when a more specific rule
    // also matched, or when the rule is terminal.
    candidates.retain(|c| {
        !c.instance.match_any || c.instance.rule.double_colon || have_non_match_any
    });

    // Pass A: no chaining. A prerequisite is satisfied if it exists on
    // disk (via VPATH) or is mentioned as an explicit target.
    let mut chainable: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        let mut ok = true;
        for prereq in candidate.instance.prerequisites() {
            if makefile.has_explicit_target(&prereq) {
                continue;
            }
            if search_vpath_exists(makefile, &prereq)? {
                continue;
            }
            ok = false;
            break;
        }

        if ok {
            install_instance(makefile, target, candidate.instance)?;
            return Ok(());
        }

        // Terminal candidates that fail here are discarded; the rest get
        // a chaining pass.
        if !candidate.instance.rule.double_colon {
            chainable.push(candidate);
        }
    }

    // Pass B: chaining. Try to resolve each prerequisite as a buildable
    // target, with this pattern rule pushed onto the rule stack.
    for candidate in chainable {
        let mut new_rule_stack: Vec<Rc<PatternRule>> = rule_stack.to_vec();
        new_rule_stack.push(Rc::clone(&candidate.instance.rule));

        let mut ok = true;
        for prereq in candidate.instance.prerequisites() {
            let dt = makefile.get_target(&prereq, false);
            match resolve_deps(makefile, &dt, target_stack, &new_rule_stack, true) {
                Ok(()) => {}
                Err(e) if e.is_resolution() => {
                    ok = false;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if ok {
            install_instance(makefile, target, candidate.instance)?;
            return Ok(());
        }
    }

    Ok(())
}

fn install_instance(
    makefile: &Makefile,
    target: &TargetRef,
    instance: PatternRuleInstance,
) -> Result<(), MakeError> {
    log_debug(
        makefile.logger(),
        format!(
            "target '{}' matched implicit rule with stem '{}'",
            target.borrow().name,
            instance.stem
        ),
        Some(&instance.rule.loc),
    );
    let loc = instance.rule.loc.clone();
    target
        .borrow_mut()
        .add_rule(TargetRule::Pattern(Rc::new(instance)), &loc)
}

/// Whether a name resolves to an existing file through the VPATH search,
/// without creating a target for it.
fn search_vpath_exists(makefile: &Makefile, name: &str) -> Result<bool, MakeError> {
    if std::path::Path::new(name).is_absolute() {
        return Ok(makefile.mtime_of(name).is_some());
    }

    if makefile.mtime_of(name).is_some() {
        return Ok(true);
    }
    for dir in makefile.vpath_dirs_for(name)? {
        if makefile
            .mtime_of(&format!("{}/{}", dir.trim_end_matches('/'), name))
            .is_some()
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// One schedulable slice of a target: its prerequisites and the rule (if
/// any) whose commands run when the slice is out of date. Single-colon
/// targets have one unit; double-colon targets have one per rule.
struct MakeUnit {
    prereqs: Vec<String>,
    command_rule: Option<TargetRule>,
    no_prereq_double_colon: bool,
}

struct MakeJob {
    makefile: Rc<Makefile>,
    target: TargetRef,
    target_stack: Vec<String>,
    rule_stack: Vec<Rc<PatternRule>>,
    avoid_remake_loop: bool,
    units: Vec<MakeUnit>,
    did_anything: bool,
}

/// Bring `target` up to date, invoking `cb` with the result. The result
/// of the first request is memoized; re-entrant requests queue behind it.
pub fn make_target(
    makefile: &Rc<Makefile>,
    target: &TargetRef,
    target_stack: Vec<String>,
    rule_stack: Vec<Rc<PatternRule>>,
    avoid_remake_loop: bool,
    cb: MakeCb,
) {
    let name = target.borrow().name.clone();
    if target_stack.contains(&name) {
        cb(
            Some(MakeError::resolution(
                format!(
                    "Recursive dependency: {} -> {}",
                    target_stack.join(" -> "),
                    name
                ),
                None,
            )),
            false,
        );
        return;
    }

    {
        let mut t = target.borrow_mut();
        match &mut t.state {
            MakeState::Finished {
                error,
                did_anything,
            } => {
                let (error, did_anything) = (error.clone(), *did_anything);
                drop(t);
                cb(error, did_anything);
                return;
            }
            MakeState::Working(waiters) => {
                waiters.push(cb);
                return;
            }
            MakeState::NotStarted => {
                t.state = MakeState::Working(vec![cb]);
            }
        }
    }

    if let Err(e) = resolve_deps(makefile, target, &target_stack, &rule_stack, true) {
        finish(target, Some(e), false);
        return;
    }

    target.borrow_mut().refresh_mtime(makefile);

    let rules = target.borrow().rules().to_vec();
    let units = match build_units(&name, &rules) {
        Ok(units) => units,
        Err(e) => {
            finish(target, Some(e), false);
            return;
        }
    };

    let mut stack = target_stack;
    stack.push(name);

    let job = Rc::new(RefCell::new(MakeJob {
        makefile: Rc::clone(makefile),
        target: Rc::clone(target),
        target_stack: stack,
        rule_stack,
        avoid_remake_loop,
        units,
        did_anything: false,
    }));

    run_unit(job, 0);
}

/// Report the result to every queued waiter. Later calls are ignored so a
/// straggling prerequisite callback cannot change a memoized result.
fn finish(target: &TargetRef, error: Option<MakeError>, did_anything: bool) {
    let waiters = {
        let mut t = target.borrow_mut();
        if matches!(t.state, MakeState::Finished { .. }) {
            return;
        }
        match std::mem::replace(
            &mut t.state,
            MakeState::Finished {
                error: error.clone(),
                did_anything,
            },
        ) {
            MakeState::Working(waiters) => waiters,
            _ => Vec::new(),
        }
    };

    for waiter in waiters {
        waiter(error.clone(), did_anything);
    }
}

fn build_units(name: &str, rules: &[TargetRule]) -> Result<Vec<MakeUnit>, MakeError> {
    if rules.is_empty() {
        return Ok(Vec::new());
    }

    if rules[0].double_colon() {
        // Each double-colon rule is considered independently.
        return Ok(rules
            .iter()
            .map(|r| MakeUnit {
                prereqs: r.prerequisites(),
                command_rule: r.has_commands().then(|| r.clone()),
                no_prereq_double_colon: r.prerequisites().is_empty(),
            })
            .collect());
    }

    let command_rules: Vec<&TargetRule> = rules.iter().filter(|r| r.has_commands()).collect();
    if command_rules.len() > 1 {
        return Err(MakeError::data(
            format!("Target '{name}' has multiple rules with commands"),
            Some(command_rules[1].loc()),
        ));
    }

    let mut prereqs = Vec::new();
    for r in rules {
        prereqs.extend(r.prerequisites());
    }

    Ok(vec![MakeUnit {
        prereqs,
        command_rule: command_rules.first().map(|r| (*r).clone()),
        no_prereq_double_colon: false,
    }])
}

/// Drive one unit: request prerequisite makes (joined with a counter),
/// then decide out-of-dateness and execute the unit's commands.
fn run_unit(job: Rc<RefCell<MakeJob>>, index: usize) {
    let (makefile, target, units_len) = {
        let j = job.borrow();
        (Rc::clone(&j.makefile), Rc::clone(&j.target), j.units.len())
    };

    if index >= units_len {
        let did = job.borrow().did_anything;
        finish(&target, None, did);
        return;
    }

    let prereqs = job.borrow().units[index].prereqs.clone();
    let deps_did = Rc::new(RefCell::new(false));

    let after_deps = {
        let job = Rc::clone(&job);
        let deps_did = Rc::clone(&deps_did);
        move || {
            let deps_did = *deps_did.borrow();
            decide_and_execute(job, index, deps_did);
        }
    };

    if prereqs.is_empty() {
        after_deps();
        return;
    }

    let remaining = Rc::new(RefCell::new(prereqs.len()));
    let failed = Rc::new(RefCell::new(false));
    let after_deps = Rc::new(RefCell::new(Some(after_deps)));

    for prereq in prereqs {
        let dt = makefile.get_target(&prereq, false);
        let (stack, rule_stack) = {
            let j = job.borrow();
            (j.target_stack.clone(), j.rule_stack.clone())
        };

        let target = Rc::clone(&target);
        let remaining = Rc::clone(&remaining);
        let failed = Rc::clone(&failed);
        let deps_did = Rc::clone(&deps_did);
        let after = Rc::clone(&after_deps);

        make_target(
            &makefile,
            &dt,
            stack,
            rule_stack,
            false,
            Box::new(move |error, did| {
                if *failed.borrow() {
                    return;
                }
                if let Some(e) = error {
                    *failed.borrow_mut() = true;
                    finish(&target, Some(e), false);
                    return;
                }

                if did {
                    *deps_did.borrow_mut() = true;
                }

                *remaining.borrow_mut() -= 1;
                if *remaining.borrow() == 0 {
                    if let Some(after) = after.borrow_mut().take() {
                        after();
                    }
                }
            }),
        );
    }
}

fn decide_and_execute(job: Rc<RefCell<MakeJob>>, index: usize, deps_did: bool) {
    let (makefile, target) = {
        let j = job.borrow();
        (Rc::clone(&j.makefile), Rc::clone(&j.target))
    };

    let (command_rule, no_prereq_double_colon, prereqs, avoid) = {
        let j = job.borrow();
        let u = &j.units[index];
        (
            u.command_rule.clone(),
            u.no_prereq_double_colon,
            u.prereqs.clone(),
            j.avoid_remake_loop,
        )
    };

    let out_of_date = {
        let t = target.borrow();
        if no_prereq_double_colon {
            // A double-colon rule with no prerequisites always runs,
            // except while remaking makefiles.
            !avoid
        } else if t.mtime.is_none() || deps_did {
            true
        } else {
            let target_mtime = t.mtime;
            drop(t);
            prereqs.iter().any(|p| {
                let dt = makefile.get_target(p, false);
                let dep_mtime = dt.borrow().mtime;
                match (dep_mtime, target_mtime) {
                    (Some(d), Some(tm)) => d > tm,
                    (Some(_), None) => true,
                    _ => false,
                }
            })
        }
    };

    let Some(rule) = command_rule.filter(|_| out_of_date) else {
        run_unit(job, index + 1);
        return;
    };

    log_debug(
        makefile.logger(),
        format!("remaking target '{}'", target.borrow().name),
        Some(&rule.loc()),
    );

    target.borrow_mut().remake();
    if let Err(e) = resolve_vpath(&makefile, &target) {
        finish(&target, Some(e), false);
        return;
    }

    let scope = match rule_scope(&makefile, &target, &rule, &prereqs) {
        Ok(scope) => scope,
        Err(e) => {
            finish(&target, Some(e), false);
            return;
        }
    };

    let lines = match resolve_command_lines(&makefile, &rule, &scope) {
        Ok(lines) => lines,
        Err(e) => {
            finish(&target, Some(e), false);
            return;
        }
    };

    job.borrow_mut().did_anything = true;
    run_command(job, index, lines, 0);
}

/// Execute command `line_index` of the unit, continuing with the next in
/// the process callback.
fn run_command(
    job: Rc<RefCell<MakeJob>>,
    unit_index: usize,
    lines: Vec<CommandLine>,
    line_index: usize,
) {
    let (makefile, target) = {
        let j = job.borrow();
        (Rc::clone(&j.makefile), Rc::clone(&j.target))
    };

    if line_index >= lines.len() {
        // Commands are done: pick up the fresh mtime and move on.
        {
            let mut t = target.borrow_mut();
            t.vpathtarget = None;
        }
        if let Err(e) = resolve_vpath(&makefile, &target) {
            finish(&target, Some(e), false);
            return;
        }
        run_unit(job, unit_index + 1);
        return;
    }

    let line = lines[line_index].clone();
    let echo = (!line.silent).then(|| format!("{} $ {}", line.loc, line.text));
    let env = makefile.sub_environment();
    let text = line.text.clone();

    let cb: process::StatusCb = {
        let job = Rc::clone(&job);
        let target = Rc::clone(&target);
        Box::new(move |result| {
            if result != 0 && !line.ignore_errors {
                finish(
                    &target,
                    Some(MakeError::Command {
                        cmd: line.text.clone(),
                        code: result,
                        loc: line.loc.clone(),
                    }),
                    true,
                );
                return;
            }
            run_command(job, unit_index, lines.clone(), line_index + 1);
        })
    };

    process::call(
        &text,
        &env,
        makefile.workdir(),
        makefile.context(),
        echo,
        cb,
    );
}

#[derive(Clone)]
struct CommandLine {
    text: String,
    loc: Location,
    silent: bool,
    ignore_errors: bool,
}

/// Resolve a rule's command expansions into executable lines: split on
/// unescaped newlines, strip `@`/`+`/`-` prefixes, drop blank lines.
fn resolve_command_lines(
    makefile: &Makefile,
    rule: &TargetRule,
    scope: &VarScope,
) -> Result<Vec<CommandLine>, MakeError> {
    let mut out = Vec::new();

    for command in rule.commands() {
        let loc = command.loc.clone().unwrap_or_else(|| rule.loc());
        let resolved = command.resolve(makefile, scope, &mut Vec::new())?;

        for piece in split_unescaped_newlines(&resolved) {
            let mut text = piece.trim_start();
            let mut silent = false;
            let mut ignore_errors = false;
            loop {
                if let Some(rest) = text.strip_prefix('@') {
                    silent = true;
                    text = rest.trim_start();
                } else if let Some(rest) = text.strip_prefix('-') {
                    ignore_errors = true;
                    text = rest.trim_start();
                } else if let Some(rest) = text.strip_prefix('+') {
                    // Recursive invocation marker; nothing to do since
                    // dry-run modes are not implemented.
                    text = rest.trim_start();
                } else {
                    break;
                }
            }

            if text.trim().is_empty() {
                continue;
            }

            out.push(CommandLine {
                text: text.to_string(),
                loc: loc.clone(),
                silent,
                ignore_errors,
            });
        }
    }

    Ok(out)
}

fn split_unescaped_newlines(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('\n') => {
                    current.push('\\');
                    current.push('\n');
                    chars.next();
                    continue;
                }
                _ => {
                    current.push(c);
                    continue;
                }
            }
        }
        if c == '\n' {
            out.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    out.push(current);
    out
}

/// A child scope of the target's variables holding the automatic
/// variables for one rule execution.
fn rule_scope(
    makefile: &Makefile,
    target: &TargetRef,
    rule: &TargetRule,
    prereqs: &[String],
) -> Result<VarScope, MakeError> {
    let scope = vars::new_scope(Some(target.borrow().variables.clone()));

    let resolved: Vec<String> = prereqs
        .iter()
        .map(|p| {
            let dt = makefile.get_target(p, false);
            let vpath = dt.borrow().vpathtarget.clone();
            vpath.unwrap_or_else(|| p.clone())
        })
        .collect();

    let vpathtarget = target
        .borrow()
        .vpathtarget
        .clone()
        .unwrap_or_else(|| target.borrow().name.clone());
    let realmtime = target.borrow().realmtime;

    // `$?`: prerequisites newer than the pre-remake mtime, deduped.
    let newer: Vec<String> = prereqs
        .iter()
        .zip(&resolved)
        .filter(|(p, _)| {
            let dt = makefile.get_target(p, false);
            let dep_mtime = dt.borrow().mtime;
            match (dep_mtime, realmtime) {
                (Some(d), Some(r)) => d > r,
                (_, None) => true,
                (None, _) => false,
            }
        })
        .map(|(_, r)| r.clone())
        .collect();

    set_automatic(&scope, makefile, "@", &vpathtarget);
    set_automatic(
        &scope,
        makefile,
        "<",
        resolved.first().map(String::as_str).unwrap_or(""),
    );
    set_automatic(&scope, makefile, "?", &without_dups(&newer).join(" "));
    set_automatic(&scope, makefile, "^", &without_dups(&resolved).join(" "));
    set_automatic(&scope, makefile, "+", &resolved.join(" "));
    set_automatic(&scope, makefile, "*", rule.stem().unwrap_or(""));

    Ok(scope)
}

/// Set an automatic variable plus its `D`/`F` variants, which split each
/// word on the last slash.
fn set_automatic(scope: &VarScope, makefile: &Makefile, name: &str, value: &str) {
    let dirs: Vec<String> = split_words(value)
        .iter()
        .map(|w| {
            let dir = path_split(w, "").0.trim_end_matches('/');
            if dir.is_empty() {
                ".".to_string()
            } else {
                dir.to_string()
            }
        })
        .collect();
    let files: Vec<String> = split_words(value)
        .iter()
        .map(|w| path_split(w, "").1.to_string())
        .collect();

    let mut vars = scope.borrow_mut();
    vars.set(
        name,
        Flavor::Simple,
        Source::Automatic,
        value.to_string(),
        makefile.logger(),
    );
    vars.set(
        &format!("{name}D"),
        Flavor::Simple,
        Source::Automatic,
        dirs.join(" "),
        makefile.logger(),
    );
    vars.set(
        &format!("{name}F"),
        Flavor::Simple,
        Source::Automatic,
        files.join(" "),
        makefile.logger(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_unescaped_newlines() {
        assert_eq!(split_unescaped_newlines("a\nb"), vec!["a", "b"]);
        assert_eq!(split_unescaped_newlines("a\\\nb"), vec!["a\\\nb"]);
        assert_eq!(split_unescaped_newlines("one"), vec!["one"]);
        assert_eq!(split_unescaped_newlines("a\\b\nc"), vec!["a\\b", "c"]);
    }

    #[test]
    fn test_pattern_rule_instance_prerequisites() {
        let rule = Rc::new(PatternRule::new(
            vec![Pattern::new("%.o")],
            vec![Pattern::new("%.c"), Pattern::new("common.h")],
            false,
            Location::new("m", 0, 0),
        ));
        let instance = PatternRuleInstance::new(rule, "src/".into(), "foo".into(), false);
        assert_eq!(instance.prerequisites(), vec!["src/foo.c", "common.h"]);
    }

    #[test]
    fn test_add_rule_rejects_colon_mixing() {
        let loc = Location::new("m", 0, 0);
        let scope = vars::new_scope(None);
        let mut target = Target::new("out".into(), scope);
        target
            .add_rule(
                TargetRule::Explicit(Rc::new(Rule::new(vec![], false, loc.clone()))),
                &loc,
            )
            .unwrap();
        let result = target.add_rule(
            TargetRule::Explicit(Rc::new(Rule::new(vec![], true, loc.clone()))),
            &loc,
        );
        assert!(result.is_err());
    }
}
