//! The variable store: a flavor/source map with scope chaining.
//!
//! Scopes form a tree rooted at the makefile's globals; pattern and
//! target scopes descend from it and recipe scopes descend from target
//! scopes. Lookup first checks the current scope and falls back to the
//! parent; an `append` entry folds the parent's value in. `set` refuses
//! to override a binding from a higher-priority source.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::MakeError;
use crate::expand::Expansion;
use crate::location::Location;
use crate::logger::{log_warn, Logger};
use crate::makefile::Makefile;
use crate::parser;

/// The "raw" environment coming from the OS.
pub type Env = HashMap<String, String>;

/// A shared, mutable variable scope.
pub type VarScope = Rc<RefCell<Variables>>;

/// How a variable's stored text is treated on lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flavor {
    /// Raw text, re-parsed into an expansion on each access.
    Recursive,
    /// The already-resolved string.
    Simple,
    /// Raw text to be concatenated onto the parent scope's value.
    Append,
}

/// The provenance of a binding. Lower ordinals win on conflicting `set`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Source {
    Override,
    CommandLine,
    Makefile,
    Environment,
    Automatic,
}

impl Source {
    /// The name reported by `$(origin …)`.
    pub fn origin(&self) -> &'static str {
        match self {
            Self::Override => "override",
            Self::CommandLine => "command line",
            Self::Makefile => "file",
            Self::Environment => "environment",
            Self::Automatic => "automatic",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Var {
    pub flavor: Flavor,
    pub source: Source,
    pub value: String,
}

#[derive(Debug, Default)]
pub struct Variables {
    map: HashMap<String, Var>,
    parent: Option<VarScope>,
}

/// Build a fresh scope, optionally chained to a parent.
pub fn new_scope(parent: Option<VarScope>) -> VarScope {
    Rc::new(RefCell::new(Variables {
        map: HashMap::new(),
        parent,
    }))
}

impl Variables {
    /// Raw lookup: `(flavor, source, text)` without expansion. Append
    /// entries fold the parent's raw value in, or degrade to recursive
    /// when the parent has none.
    pub fn get_raw(&self, name: &str) -> Option<(Flavor, Source, String)> {
        if let Some(var) = self.map.get(name) {
            if var.flavor == Flavor::Append {
                let from_parent = self
                    .parent
                    .as_ref()
                    .and_then(|p| p.borrow().get_raw(name));
                return match from_parent {
                    None => Some((Flavor::Recursive, var.source, var.value.clone())),
                    Some((pflavor, psource, pvalue)) => {
                        Some((pflavor, psource, format!("{} {}", pvalue, var.value)))
                    }
                };
            }
            return Some((var.flavor, var.source, var.value.clone()));
        }

        self.parent.as_ref().and_then(|p| p.borrow().get_raw(name))
    }

    /// Expanded lookup: the value as an `Expansion` ready to resolve.
    /// Recursive text is parsed fresh so references evaluate against the
    /// scopes in effect at resolve time.
    pub fn get_expansion(
        &self,
        name: &str,
    ) -> Result<Option<(Flavor, Source, Expansion)>, MakeError> {
        if let Some(var) = self.map.get(name) {
            if var.flavor == Flavor::Append {
                let from_parent = self
                    .parent
                    .as_ref()
                    .map(|p| p.borrow().get_expansion(name))
                    .transpose()?
                    .flatten();
                return match from_parent {
                    None => {
                        // Not set in a parent: degrade to recursive.
                        let e = parse_value(name, &var.value)?;
                        Ok(Some((Flavor::Recursive, var.source, e)))
                    }
                    Some((pflavor, psource, mut pvalue)) => {
                        pvalue.append_str(" ");
                        pvalue.concat(parse_value(name, &var.value)?);
                        Ok(Some((pflavor, psource, pvalue)))
                    }
                };
            }

            let e = match var.flavor {
                Flavor::Simple => Expansion::from_literal(var.value.clone()),
                _ => parse_value(name, &var.value)?,
            };
            return Ok(Some((var.flavor, var.source, e)));
        }

        match self.parent.as_ref() {
            Some(p) => p.borrow().get_expansion(name),
            None => Ok(None),
        }
    }

    /// Set a variable, unless an existing binding (here or in a parent)
    /// comes from a higher-priority source.
    pub fn set(
        &mut self,
        name: &str,
        flavor: Flavor,
        source: Source,
        value: String,
        logger: &dyn Logger,
    ) {
        debug_assert!(flavor != Flavor::Append);

        if let Some((_, prev_source, _)) = self.get_raw(name) {
            if source > prev_source {
                log_warn(
                    logger,
                    format!("not setting variable '{name}', set by higher-priority source"),
                    None,
                );
                return;
            }
        }

        self.map.insert(
            name.to_string(),
            Var {
                flavor,
                source,
                value,
            },
        );
    }

    /// Direct lookup in this scope only, ignoring parents.
    pub fn get_local(&self, name: &str) -> Option<Var> {
        self.map.get(name).cloned()
    }

    fn insert(&mut self, name: &str, var: Var) {
        self.map.insert(name.to_string(), var);
    }

    /// Copy every binding of `other` into this scope. Used to merge
    /// pattern-variable scopes into a target's scope.
    pub fn merge_from(&mut self, other: &Variables) {
        for (name, var) in &other.map {
            self.map.insert(name.clone(), var.clone());
        }
    }
}

/// Append to a variable in `scope`. Appending onto a `simple` binding
/// resolves the fragment immediately; otherwise the raw fragment is
/// stored (as an `append` entry when the variable was not bound locally).
pub fn append(
    scope: &VarScope,
    name: &str,
    source: Source,
    value: String,
    resolving_scope: &VarScope,
    makefile: &Makefile,
) -> Result<(), MakeError> {
    let prev = scope.borrow().get_local(name);
    let Some(prev) = prev else {
        scope.borrow_mut().insert(
            name,
            Var {
                flavor: Flavor::Append,
                source,
                value,
            },
        );
        return Ok(());
    };

    if source > prev.source {
        return Ok(());
    }

    let new_value = match prev.flavor {
        Flavor::Simple => {
            // Resolve the fragment now; a simple variable never holds
            // unexpanded text.
            let e = parse_value(name, &value)?;
            let mut setting = vec![name.to_string()];
            let resolved = e.resolve(makefile, resolving_scope, &mut setting)?;
            format!("{} {}", prev.value, resolved)
        }
        _ => format!("{} {}", prev.value, value),
    };

    scope.borrow_mut().insert(
        name,
        Var {
            flavor: prev.flavor,
            source: prev.source,
            value: new_value,
        },
    );
    Ok(())
}

/// Populate a scope from the OS environment. Entries behave like
/// recursive variables of environment priority.
pub fn scope_from_env(env: &Env) -> VarScope {
    let scope = new_scope(None);
    {
        let mut vars = scope.borrow_mut();
        for (k, v) in env {
            vars.insert(
                k,
                Var {
                    flavor: Flavor::Recursive,
                    source: Source::Environment,
                    value: v.clone(),
                },
            );
        }
    }
    scope
}

fn parse_value(name: &str, text: &str) -> Result<Expansion, MakeError> {
    let loc = Location::new(format!("<value of '{name}'>"), 0, 0);
    parser::parse_expansion_string(text, loc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::StderrLogger;

    fn logger() -> StderrLogger {
        StderrLogger { verbose: false }
    }

    #[test]
    fn test_priority_refuses_downgrade() {
        let scope = new_scope(None);
        let mut vars = scope.borrow_mut();
        vars.set(
            "V",
            Flavor::Simple,
            Source::CommandLine,
            "cli".into(),
            &logger(),
        );
        vars.set(
            "V",
            Flavor::Simple,
            Source::Makefile,
            "file".into(),
            &logger(),
        );
        let (_, source, value) = vars.get_raw("V").unwrap();
        assert_eq!(source, Source::CommandLine);
        assert_eq!(value, "cli");

        // Equal or higher priority may overwrite.
        vars.set(
            "V",
            Flavor::Simple,
            Source::Override,
            "forced".into(),
            &logger(),
        );
        assert_eq!(vars.get_raw("V").unwrap().2, "forced");
    }

    #[test]
    fn test_parent_chain_lookup() {
        let global = new_scope(None);
        global.borrow_mut().set(
            "A",
            Flavor::Simple,
            Source::Makefile,
            "top".into(),
            &logger(),
        );
        let child = new_scope(Some(Rc::clone(&global)));
        assert_eq!(child.borrow().get_raw("A").unwrap().2, "top");
        assert!(child.borrow().get_raw("B").is_none());
    }

    #[test]
    fn test_append_without_parent_degrades_to_recursive() {
        let scope = new_scope(None);
        scope.borrow_mut().insert(
            "A",
            Var {
                flavor: Flavor::Append,
                source: Source::Makefile,
                value: "world".into(),
            },
        );
        let (flavor, _, value) = scope.borrow().get_raw("A").unwrap();
        assert_eq!(flavor, Flavor::Recursive);
        assert_eq!(value, "world");
    }

    #[test]
    fn test_append_folds_parent_value() {
        let global = new_scope(None);
        global.borrow_mut().set(
            "A",
            Flavor::Simple,
            Source::Makefile,
            "hello".into(),
            &logger(),
        );
        let child = new_scope(Some(Rc::clone(&global)));
        child.borrow_mut().insert(
            "A",
            Var {
                flavor: Flavor::Append,
                source: Source::Makefile,
                value: "world".into(),
            },
        );
        let (flavor, _, value) = child.borrow().get_raw("A").unwrap();
        assert_eq!(flavor, Flavor::Simple);
        assert_eq!(value, "hello world");
    }
}
