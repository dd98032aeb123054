//! The internal representation of a makefile: global variables, the
//! target map, implicit rules, vpath directories, included files, and the
//! restart machinery for remaking makefiles.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::SystemTime;

use indexmap::IndexMap;

use crate::error::MakeError;
use crate::location::Location;
use crate::logger::{log_info, Logger};
use crate::parser;
use crate::pattern::Pattern;
use crate::process::Context;
use crate::rule_map::{self, make_target, PatternRule, Target, TargetRef};
use crate::util::split_words;
use crate::vars::{self, Env, Flavor, Source, VarScope};

const DEFAULT_LIBPATTERNS: &str = "lib%.so lib%.a";

/// A makefile is a series of rules, a set of global variable definitions,
/// and the bookkeeping the engine needs to drive them.
pub struct Makefile {
    variables: VarScope,
    exported: RefCell<HashSet<String>>,
    overrides: RefCell<Vec<String>>,
    targets: RefCell<IndexMap<String, TargetRef>>,
    pattern_variables: RefCell<Vec<(Pattern, VarScope)>>,
    implicit_rules: RefCell<Vec<Rc<PatternRule>>>,
    vpaths: RefCell<Vec<(Pattern, Vec<String>)>>,
    included: RefCell<Vec<String>>,
    default_target: RefCell<Option<String>>,
    parsing_finished: Cell<bool>,
    pub restarts: i32,
    workdir: PathBuf,
    pub makelevel: usize,
    makeflags: String,
    env: Env,
    context: Rc<Context>,
    logger: Rc<dyn Logger>,
}

impl Makefile {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workdir: PathBuf,
        env: Env,
        restarts: i32,
        makeflags: String,
        makelevel: usize,
        context: Rc<Context>,
        logger: Rc<dyn Logger>,
    ) -> Rc<Self> {
        let variables = vars::scope_from_env(&env);
        {
            let mut vars = variables.borrow_mut();
            let make = std::env::current_exe()
                .ok()
                .and_then(|p| p.canonicalize().ok())
                .map(|p| p.display().to_string().replace('\\', "/"))
                .unwrap_or_else(|| "rmake".to_string());

            vars.set(
                "MAKE",
                Flavor::Simple,
                Source::Environment,
                make,
                logger.as_ref(),
            );
            vars.set(
                "MAKEFLAGS",
                Flavor::Recursive,
                Source::Environment,
                makeflags.clone(),
                logger.as_ref(),
            );
            vars.set(
                "MAKELEVEL",
                Flavor::Simple,
                Source::Makefile,
                makelevel.to_string(),
                logger.as_ref(),
            );
            vars.set(
                "CURDIR",
                Flavor::Simple,
                Source::Makefile,
                workdir.display().to_string().replace('\\', "/"),
                logger.as_ref(),
            );
            vars.set(
                "MAKE_RESTARTS",
                Flavor::Simple,
                Source::Makefile,
                if restarts > 0 {
                    restarts.to_string()
                } else {
                    String::new()
                },
                logger.as_ref(),
            );
            vars.set(
                ".LIBPATTERNS",
                Flavor::Recursive,
                Source::Makefile,
                DEFAULT_LIBPATTERNS.to_string(),
                logger.as_ref(),
            );
            vars.set(
                "MAKEFILE_LIST",
                Flavor::Simple,
                Source::Makefile,
                String::new(),
                logger.as_ref(),
            );
        }

        Rc::new(Self {
            variables,
            exported: RefCell::new(HashSet::new()),
            overrides: RefCell::new(Vec::new()),
            targets: RefCell::new(IndexMap::new()),
            pattern_variables: RefCell::new(Vec::new()),
            implicit_rules: RefCell::new(Vec::new()),
            vpaths: RefCell::new(Vec::new()),
            included: RefCell::new(Vec::new()),
            default_target: RefCell::new(None),
            parsing_finished: Cell::new(false),
            restarts,
            workdir,
            makelevel,
            makeflags,
            env,
            context,
            logger,
        })
    }

    pub fn global_scope(&self) -> &VarScope {
        &self.variables
    }

    pub fn logger(&self) -> &dyn Logger {
        self.logger.as_ref()
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn context(&self) -> Rc<Context> {
        Rc::clone(&self.context)
    }

    pub fn parsing_finished(&self) -> bool {
        self.parsing_finished.get()
    }

    pub fn finish_parsing(&self) {
        self.parsing_finished.set(true);
    }

    /// The mtime of a path, resolved against the working directory.
    /// `None` covers both a missing file and one we cannot stat.
    pub fn mtime_of(&self, path: &str) -> Option<SystemTime> {
        let full = self.workdir.join(path);
        fs::metadata(full).and_then(|m| m.modified()).ok()
    }

    /// Look up or lazily create a target record.
    pub fn get_target(&self, name: &str, explicit: bool) -> TargetRef {
        let mut targets = self.targets.borrow_mut();
        let target = targets
            .entry(name.to_string())
            .or_insert_with(|| {
                let scope = vars::new_scope(Some(Rc::clone(&self.variables)));
                Rc::new(RefCell::new(Target::new(name.to_string(), scope)))
            });
        if explicit {
            target.borrow_mut().explicit = true;
        }
        Rc::clone(target)
    }

    /// Whether `name` is already known as an explicitly-mentioned target.
    pub fn has_explicit_target(&self, name: &str) -> bool {
        self.targets
            .borrow()
            .get(name)
            .map(|t| {
                let t = t.borrow();
                t.explicit || !t.rules().is_empty()
            })
            .unwrap_or(false)
    }

    /// Whether `name` is listed as a prerequisite of `.PHONY`.
    pub fn is_phony(&self, name: &str) -> bool {
        if name == ".PHONY" {
            return false;
        }
        let targets = self.targets.borrow();
        let Some(phony) = targets.get(".PHONY") else {
            return false;
        };
        let result = phony
            .borrow()
            .rules()
            .iter()
            .any(|r| r.prerequisites().iter().any(|p| p == name));
        result
    }

    /// Called by the parser when a target is found, for the default-goal
    /// logic. Targets whose names start with `.` never become the default.
    pub fn found_target(&self, name: &str) {
        let mut default = self.default_target.borrow_mut();
        if default.is_none() && !name.starts_with('.') {
            *default = Some(name.to_string());
        }
    }

    pub fn default_target(&self) -> Option<String> {
        self.default_target.borrow().clone()
    }

    pub fn add_export(&self, name: String) {
        self.exported.borrow_mut().insert(name);
    }

    pub fn add_override(&self, assignment: &str) {
        self.overrides.borrow_mut().push(assignment.to_string());
    }

    pub fn append_implicit_rule(&self, rule: Rc<PatternRule>) {
        self.implicit_rules.borrow_mut().push(rule);
    }

    pub fn implicit_rules(&self) -> Vec<Rc<PatternRule>> {
        self.implicit_rules.borrow().clone()
    }

    /// The variable scope for a pattern of target names, created on first
    /// use and merged into matching targets during resolution.
    pub fn get_pattern_variables(&self, pattern: &Pattern) -> VarScope {
        let mut entries = self.pattern_variables.borrow_mut();
        if let Some((_, scope)) = entries.iter().find(|(p, _)| p == pattern) {
            return Rc::clone(scope);
        }
        let scope = vars::new_scope(Some(Rc::clone(&self.variables)));
        entries.push((pattern.clone(), Rc::clone(&scope)));
        scope
    }

    /// All pattern-variable scopes matching a target name, in encounter
    /// order.
    pub fn pattern_variables_matching(&self, name: &str) -> Vec<VarScope> {
        self.pattern_variables
            .borrow()
            .iter()
            .filter(|(p, _)| p.match_word(name).is_some())
            .map(|(_, scope)| Rc::clone(scope))
            .collect()
    }

    pub fn clear_all_vpaths(&self) {
        self.vpaths.borrow_mut().clear();
    }

    pub fn clear_vpath(&self, pattern: &Pattern) {
        self.vpaths.borrow_mut().retain(|(p, _)| p != pattern);
    }

    pub fn add_vpath(&self, pattern: Pattern, dirs: Vec<String>) {
        self.vpaths.borrow_mut().push((pattern, dirs));
    }

    /// The directories to search for `name`: each `vpath` directive whose
    /// pattern matches, then the global `VPATH` variable.
    pub fn vpath_dirs_for(&self, name: &str) -> Result<Vec<String>, MakeError> {
        let mut dirs = Vec::new();
        for (pattern, pattern_dirs) in self.vpaths.borrow().iter() {
            if pattern.match_word(name).is_some() {
                dirs.extend(pattern_dirs.iter().cloned());
            }
        }

        let vpath = self.variables.borrow().get_expansion("VPATH")?;
        if let Some((_, _, value)) = vpath {
            let resolved = value.resolve(self, &self.variables, &mut Vec::new())?;
            for word in split_words(&resolved) {
                dirs.extend(
                    word.split(':')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                );
            }
        }

        Ok(dirs)
    }

    /// The `.LIBPATTERNS` patterns used to resolve `-l<stem>` targets.
    pub fn lib_patterns(&self) -> Result<Vec<Pattern>, MakeError> {
        let libpatterns = self.variables.borrow().get_expansion(".LIBPATTERNS")?;
        let value = match libpatterns {
            Some((_, _, e)) => e.resolve(self, &self.variables, &mut Vec::new())?,
            None => DEFAULT_LIBPATTERNS.to_string(),
        };
        Ok(split_words(&value).iter().map(|p| Pattern::new(p)).collect())
    }

    /// Read and parse another makefile. Missing files are fatal only when
    /// `required` (plain `include` rather than `-include`).
    pub fn include(
        &self,
        path: &str,
        required: bool,
        loc: Option<Location>,
    ) -> Result<(), MakeError> {
        // Recorded even when missing: the remake pass may be able to
        // build the file, which triggers a restart.
        self.included.borrow_mut().push(path.to_string());

        let full = self.workdir.join(path);
        if !full.is_file() {
            if required {
                return Err(MakeError::data(
                    format!("Attempting to include file '{path}' which doesn't exist."),
                    loc,
                ));
            }
            return Ok(());
        }

        {
            let mut vars = self.variables.borrow_mut();
            let list = vars
                .get_raw("MAKEFILE_LIST")
                .map(|(_, _, v)| v)
                .unwrap_or_default();
            let list = if list.is_empty() {
                path.to_string()
            } else {
                format!("{list} {path}")
            };
            vars.set(
                "MAKEFILE_LIST",
                Flavor::Simple,
                Source::Makefile,
                list,
                self.logger.as_ref(),
            );
        }

        let file = File::open(&full).map_err(|e| {
            MakeError::data(format!("Could not read makefile '{path}' ({e})."), None)
        })?;
        parser::parse_stream(BufReader::new(file), path, self)
    }

    pub fn included_makefiles(&self) -> Vec<String> {
        self.included.borrow().clone()
    }

    /// The `MAKEFLAGS` value handed to sub-makes: the flag words, then
    /// ` -- ` and the verbatim command-line overrides, each with its
    /// whitespace and backslashes escaped.
    fn makeflags_for_subenv(&self) -> String {
        let overrides = self.overrides.borrow();
        if overrides.is_empty() {
            return self.makeflags.clone();
        }

        let escaped: Vec<String> = overrides
            .iter()
            .map(|o| {
                o.chars()
                    .flat_map(|c| {
                        if c.is_whitespace() || c == '\\' {
                            vec!['\\', c]
                        } else {
                            vec![c]
                        }
                    })
                    .collect()
            })
            .collect();
        format!("{} -- {}", self.makeflags, escaped.join(" "))
    }

    /// The environment recipes see: the OS environment, every exported
    /// variable's resolved value, `MAKEFLAGS`, and an incremented
    /// `MAKELEVEL`.
    pub fn sub_environment(&self) -> Env {
        let mut env = self.env.clone();

        let exported: Vec<String> = self.exported.borrow().iter().cloned().collect();
        for name in exported {
            let expansion = self.variables.borrow().get_expansion(&name).ok().flatten();
            let value = expansion
                .and_then(|(_, _, e)| e.resolve(self, &self.variables, &mut Vec::new()).ok());
            if let Some(value) = value {
                env.insert(name, value);
            }
        }

        env.insert("MAKEFLAGS".to_string(), self.makeflags_for_subenv());
        env.insert("MAKELEVEL".to_string(), (self.makelevel + 1).to_string());
        env
    }

    /// Remake the included makefiles themselves, in order, then report
    /// through `cb` whether any of them changed (which triggers a restart
    /// of parsing).
    pub fn remake_makefiles(self: &Rc<Self>, cb: Box<dyn FnOnce(bool)>) {
        let files = self.included_makefiles();
        let snapshots: Vec<Option<SystemTime>> =
            files.iter().map(|f| self.mtime_of(f)).collect();

        remake_next(Rc::clone(self), files, snapshots, 0, cb);
    }
}

fn remake_next(
    makefile: Rc<Makefile>,
    files: Vec<String>,
    snapshots: Vec<Option<SystemTime>>,
    index: usize,
    cb: Box<dyn FnOnce(bool)>,
) {
    if index >= files.len() {
        let changed = files
            .iter()
            .zip(&snapshots)
            .any(|(f, old)| makefile.mtime_of(f) != *old);
        cb(changed);
        return;
    }

    let target = makefile.get_target(&files[index], true);
    if let Err(e) = rule_map::resolve_vpath(&makefile, &target) {
        log_info(makefile.logger(), format!("{e}"), None);
        remake_next(makefile, files, snapshots, index + 1, cb);
        return;
    }

    let mf = Rc::clone(&makefile);
    make_target(
        &makefile,
        &target,
        vec!["<remaking makefiles>".to_string()],
        Vec::new(),
        true,
        Box::new(move |error, _did| {
            if let Some(e) = error {
                // A makefile that cannot be remade is only advisory here;
                // parsing already succeeded with the copy on disk.
                crate::logger::log_debug(mf.logger(), format!("{e}"), None);
            }
            remake_next(mf, files, snapshots, index + 1, cb);
        }),
    );
}
