//! The catalogue of built-in makefile functions, plus variable and
//! substitution references.
//!
//! A function call is a tagged variant carrying its source location and
//! its arguments as child expansions. A single `resolve_node` dispatches
//! on the tag; argument counts are enforced once at parse time.

use std::fs;
use std::process::{Command, Stdio};

use crate::error::MakeError;
use crate::expand::Expansion;
use crate::globrelative;
use crate::location::Location;
use crate::logger::{log_debug, log_info, log_warn};
use crate::makefile::Makefile;
use crate::parser;
use crate::pattern::Pattern;
use crate::util::{check_msys_compat, path_split, split_words, without_dups};
use crate::vars::{self, Flavor, Source, VarScope};

/// A reference node inside an expansion.
#[derive(Clone, Debug)]
pub enum FunctionNode {
    /// `$(NAME)` or `$N`.
    VariableRef { loc: Location, name: Box<Expansion> },
    /// `$(NAME:.c=.o)` or `$(NAME:%.c=%.o)`.
    SubstitutionRef {
        loc: Location,
        name: Box<Expansion>,
        from: Box<Expansion>,
        to: Box<Expansion>,
    },
    /// `$(function arg,…)`.
    Call {
        kind: FunctionKind,
        loc: Location,
        args: Vec<Expansion>,
    },
}

macro_rules! function_kinds {
    ($(($variant:ident, $name:literal, $min:literal, $max:literal)),+ $(,)?) => {
        /// Discriminant for each built-in function.
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub enum FunctionKind {
            $($variant),+
        }

        impl FunctionKind {
            /// All function names, used to build the parser's token list.
            pub const NAMES: &'static [&'static str] = &[$($name),+];

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Self::$variant),)+
                    _ => None,
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name),+
                }
            }

            /// `(minargs, maxargs)`; a max of 0 means unbounded.
            pub fn arity(&self) -> (usize, usize) {
                match self {
                    $(Self::$variant => ($min, $max)),+
                }
            }
        }
    };
}

function_kinds![
    (Subst, "subst", 3, 3),
    (Patsubst, "patsubst", 3, 3),
    (Strip, "strip", 1, 1),
    (Findstring, "findstring", 2, 2),
    (Filter, "filter", 2, 2),
    (FilterOut, "filter-out", 2, 2),
    (Sort, "sort", 1, 1),
    (Word, "word", 2, 2),
    (Wordlist, "wordlist", 3, 3),
    (Words, "words", 1, 1),
    (Firstword, "firstword", 1, 1),
    (Lastword, "lastword", 1, 1),
    (Dir, "dir", 1, 1),
    (Notdir, "notdir", 1, 1),
    (Suffix, "suffix", 1, 1),
    (Basename, "basename", 1, 1),
    (Addsuffix, "addsuffix", 2, 2),
    (Addprefix, "addprefix", 2, 2),
    (Join, "join", 2, 2),
    (Wildcard, "wildcard", 1, 1),
    (Realpath, "realpath", 1, 1),
    (Abspath, "abspath", 1, 1),
    (If, "if", 2, 3),
    (Or, "or", 1, 0),
    (And, "and", 1, 0),
    (Foreach, "foreach", 3, 3),
    (Call, "call", 1, 0),
    (Value, "value", 1, 1),
    (Eval, "eval", 1, 1),
    (Origin, "origin", 1, 1),
    (Flavor, "flavor", 1, 1),
    (Shell, "shell", 1, 1),
    (Error, "error", 1, 1),
    (Warning, "warning", 1, 1),
    (Info, "info", 1, 1),
];

impl FunctionNode {
    pub fn loc(&self) -> &Location {
        match self {
            Self::VariableRef { loc, .. }
            | Self::SubstitutionRef { loc, .. }
            | Self::Call { loc, .. } => loc,
        }
    }

    /// Validate argument counts once parsing of the call is complete.
    /// `$(if)` also trims the outer whitespace of its condition here.
    pub fn setup(&mut self) -> Result<(), MakeError> {
        let Self::Call { kind, loc, args } = self else {
            return Ok(());
        };

        let (min, max) = kind.arity();
        if args.len() < min {
            return Err(MakeError::data(
                format!(
                    "Not enough arguments to function {}, requires {}",
                    kind.name(),
                    min
                ),
                Some(loc.clone()),
            ));
        }
        debug_assert!(max == 0 || args.len() <= max);

        if *kind == FunctionKind::If {
            args[0].lstrip();
            args[0].rstrip();
        }

        Ok(())
    }
}

/// Evaluate a reference node against `(makefile, scope, setting-stack)`.
pub fn resolve_node(
    node: &FunctionNode,
    makefile: &Makefile,
    scope: &VarScope,
    setting: &mut Vec<String>,
) -> Result<String, MakeError> {
    match node {
        FunctionNode::VariableRef { loc, name } => {
            resolve_variable_ref(loc, name, makefile, scope, setting)
        }
        FunctionNode::SubstitutionRef {
            loc,
            name,
            from,
            to,
        } => resolve_substitution_ref(loc, name, from, to, makefile, scope, setting),
        FunctionNode::Call { kind, loc, args } => {
            resolve_call(*kind, loc, args, makefile, scope, setting)
        }
    }
}

fn resolve_variable_ref(
    loc: &Location,
    name: &Expansion,
    makefile: &Makefile,
    scope: &VarScope,
    setting: &mut Vec<String>,
) -> Result<String, MakeError> {
    let vname = name.resolve(makefile, scope, setting)?;
    if setting.contains(&vname) {
        return Err(MakeError::data(
            format!("Setting variable '{vname}' recursively references itself."),
            Some(loc.clone()),
        ));
    }

    let value = scope.borrow().get_expansion(&vname)?;
    let Some((_, _, value)) = value else {
        log_debug(
            makefile.logger(),
            format!("variable '{vname}' was not set"),
            Some(loc),
        );
        return Ok(String::new());
    };

    setting.push(vname);
    let result = value.resolve(makefile, scope, setting);
    setting.pop();
    result
}

#[allow(clippy::too_many_arguments)]
fn resolve_substitution_ref(
    loc: &Location,
    name: &Expansion,
    from: &Expansion,
    to: &Expansion,
    makefile: &Makefile,
    scope: &VarScope,
    setting: &mut Vec<String>,
) -> Result<String, MakeError> {
    let vname = name.resolve(makefile, scope, setting)?;
    if setting.contains(&vname) {
        return Err(MakeError::data(
            format!("Setting variable '{vname}' recursively references itself."),
            Some(loc.clone()),
        ));
    }

    let mut from = from.resolve(makefile, scope, setting)?;
    let mut to = to.resolve(makefile, scope, setting)?;

    let value = scope.borrow().get_expansion(&vname)?;
    let Some((_, _, value)) = value else {
        log_debug(
            makefile.logger(),
            format!("variable '{vname}' was not set"),
            Some(loc),
        );
        return Ok(String::new());
    };

    setting.push(vname);
    let evalue = value.resolve(makefile, scope, setting);
    setting.pop();
    let evalue = evalue?;

    let mut pat = Pattern::new(&from);
    if !pat.is_pattern() {
        from.insert(0, '%');
        to.insert(0, '%');
        pat = Pattern::new(&from);
    }

    let subst = split_words(&evalue)
        .iter()
        .map(|word| pat.subst(&to, word, false))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(subst.join(" "))
}

fn resolve_call(
    kind: FunctionKind,
    loc: &Location,
    args: &[Expansion],
    makefile: &Makefile,
    scope: &VarScope,
    setting: &mut Vec<String>,
) -> Result<String, MakeError> {
    // Most functions want all their arguments as strings up front; the
    // lazy ones (if/or/and/foreach/call/eval/value) resolve their own.
    let mut arg = |i: usize| args[i].resolve(makefile, scope, setting);

    match kind {
        FunctionKind::Subst => {
            let (s, r, d) = (arg(0)?, arg(1)?, arg(2)?);
            Ok(d.replace(&s, &r))
        }
        FunctionKind::Patsubst => {
            let (s, r, d) = (arg(0)?, arg(1)?, arg(2)?);
            let p = Pattern::new(&s);
            let words = split_words(&d)
                .iter()
                .map(|w| p.subst(&r, w, false))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(words.join(" "))
        }
        FunctionKind::Strip => Ok(split_words(&arg(0)?).join(" ")),
        FunctionKind::Findstring => {
            let (s, r) = (arg(0)?, arg(1)?);
            Ok(if r.contains(&s) { s } else { String::new() })
        }
        FunctionKind::Filter | FunctionKind::FilterOut => {
            let patterns: Vec<Pattern> = split_words(&arg(0)?)
                .iter()
                .map(|p| Pattern::new(p))
                .collect();
            let keep_matches = kind == FunctionKind::Filter;
            let words: Vec<String> = split_words(&arg(1)?)
                .into_iter()
                .filter(|w| patterns.iter().any(|p| p.match_word(w).is_some()) == keep_matches)
                .collect();
            Ok(words.join(" "))
        }
        FunctionKind::Sort => {
            let mut words = split_words(&arg(0)?);
            words.sort();
            Ok(without_dups(&words).join(" "))
        }
        FunctionKind::Word => {
            let n = parse_number(&arg(0)?, kind, loc)?;
            let words = split_words(&arg(1)?);
            if n < 1 || n > words.len() as i64 {
                return Ok(String::new());
            }
            Ok(words[(n - 1) as usize].clone())
        }
        FunctionKind::Wordlist => {
            let from = parse_number(&arg(0)?, kind, loc)?.max(1) as usize;
            let to = parse_number(&arg(1)?, kind, loc)?.max(1) as usize;
            let words = split_words(&arg(2)?);
            if from > words.len() || to < from {
                return Ok(String::new());
            }
            Ok(words[from - 1..to.min(words.len())].join(" "))
        }
        FunctionKind::Words => Ok(split_words(&arg(0)?).len().to_string()),
        FunctionKind::Firstword => {
            Ok(split_words(&arg(0)?).first().cloned().unwrap_or_default())
        }
        FunctionKind::Lastword => Ok(split_words(&arg(0)?).last().cloned().unwrap_or_default()),
        FunctionKind::Dir => Ok(map_words(&arg(0)?, |w| path_split(w, "./").0.to_string())),
        FunctionKind::Notdir => Ok(map_words(&arg(0)?, |w| path_split(w, "./").1.to_string())),
        FunctionKind::Suffix => {
            let words = split_words(&arg(0)?);
            let suffixes: Vec<String> = words
                .iter()
                .filter_map(|w| {
                    let (_, file) = path_split(w, "./");
                    match file.rfind('.') {
                        Some(i) if i > 0 => Some(file[i..].to_string()),
                        _ => None,
                    }
                })
                .collect();
            Ok(suffixes.join(" "))
        }
        FunctionKind::Basename => Ok(map_words(&arg(0)?, |w| {
            let (dir, file) = path_split(w, "");
            let base = match file.rfind('.') {
                Some(i) => &file[..i],
                None => file,
            };
            format!("{dir}{base}")
        })),
        FunctionKind::Addsuffix => {
            let suffix = arg(0)?;
            Ok(map_words(&arg(1)?, |w| format!("{w}{suffix}")))
        }
        FunctionKind::Addprefix => {
            let prefix = arg(0)?;
            Ok(map_words(&arg(1)?, |w| format!("{prefix}{w}")))
        }
        FunctionKind::Join => {
            let list1 = split_words(&arg(0)?);
            let list2 = split_words(&arg(1)?);
            let joined: Vec<String> = (0..list1.len().max(list2.len()))
                .map(|i| {
                    format!(
                        "{}{}",
                        list1.get(i).map(String::as_str).unwrap_or(""),
                        list2.get(i).map(String::as_str).unwrap_or(""),
                    )
                })
                .collect();
            Ok(joined.join(" "))
        }
        FunctionKind::Wildcard => {
            let mut found = Vec::new();
            for p in split_words(&arg(0)?) {
                found.extend(globrelative::glob(makefile.workdir(), &p.replace('\\', "/")));
            }
            Ok(found.join(" "))
        }
        FunctionKind::Realpath => {
            let paths: Vec<String> = split_words(&arg(0)?)
                .iter()
                .filter_map(|p| fs::canonicalize(makefile.workdir().join(p)).ok())
                .map(|p| p.display().to_string().replace('\\', "/"))
                .collect();
            Ok(paths.join(" "))
        }
        FunctionKind::Abspath => Ok(map_words(&arg(0)?, |p| {
            makefile
                .workdir()
                .join(p)
                .display()
                .to_string()
                .replace('\\', "/")
        })),
        FunctionKind::If => {
            if !arg(0)?.is_empty() {
                arg(1)
            } else if args.len() > 2 {
                arg(2)
            } else {
                Ok(String::new())
            }
        }
        FunctionKind::Or => {
            for a in args {
                let r = a.resolve(makefile, scope, setting)?;
                if !r.is_empty() {
                    return Ok(r);
                }
            }
            Ok(String::new())
        }
        FunctionKind::And => {
            let mut r = String::new();
            for a in args {
                r = a.resolve(makefile, scope, setting)?;
                if r.is_empty() {
                    return Ok(String::new());
                }
            }
            Ok(r)
        }
        FunctionKind::Foreach => {
            let vname = arg(0)?;
            let words = split_words(&arg(1)?);
            let body = &args[2];

            let child = vars::new_scope(Some(scope.clone()));
            let mut results = Vec::with_capacity(words.len());
            for w in words {
                child.borrow_mut().set(
                    &vname,
                    Flavor::Simple,
                    Source::Automatic,
                    w,
                    makefile.logger(),
                );
                results.push(body.resolve(makefile, &child, setting)?);
            }
            Ok(results.join(" "))
        }
        FunctionKind::Call => {
            let vname = arg(0)?;
            if setting.contains(&vname) {
                return Err(MakeError::data(
                    format!("Recursively setting variable '{vname}'"),
                    Some(loc.clone()),
                ));
            }

            let child = vars::new_scope(Some(scope.clone()));
            child.borrow_mut().set(
                "0",
                Flavor::Simple,
                Source::Automatic,
                vname.clone(),
                makefile.logger(),
            );
            for (i, a) in args.iter().enumerate().skip(1) {
                let param = a.resolve(makefile, scope, setting)?;
                child.borrow_mut().set(
                    &i.to_string(),
                    Flavor::Simple,
                    Source::Automatic,
                    param,
                    makefile.logger(),
                );
            }

            let value = scope.borrow().get_expansion(&vname)?;
            let Some((flavor, _, e)) = value else {
                return Ok(String::new());
            };
            if flavor == Flavor::Simple {
                log_warn(
                    makefile.logger(),
                    format!("calling variable '{vname}' which is simply-expanded"),
                    Some(loc),
                );
            }

            // But we'll do it anyway.
            setting.push(vname);
            let result = e.resolve(makefile, &child, setting);
            setting.pop();
            result
        }
        FunctionKind::Value => {
            let vname = arg(0)?;
            Ok(scope
                .borrow()
                .get_raw(&vname)
                .map(|(_, _, value)| value)
                .unwrap_or_default())
        }
        FunctionKind::Eval => {
            if makefile.parsing_finished() {
                return Err(MakeError::data(
                    "$(eval) not allowed via recursive expansion after parsing is finished",
                    Some(loc.clone()),
                ));
            }
            let text = arg(0)?;
            parser::parse_string(&text, &format!("evaluation from {loc}"), makefile)?;
            Ok(String::new())
        }
        FunctionKind::Origin => {
            let vname = arg(0)?;
            Ok(match scope.borrow().get_raw(&vname) {
                None => "undefined".to_string(),
                Some((_, source, _)) => source.origin().to_string(),
            })
        }
        FunctionKind::Flavor => {
            let vname = arg(0)?;
            Ok(match scope.borrow().get_raw(&vname) {
                None => "undefined".to_string(),
                Some((Flavor::Simple, _, _)) => "simple".to_string(),
                Some(_) => "recursive".to_string(),
            })
        }
        FunctionKind::Shell => {
            let cline = arg(0)?;
            let (shell, msys) = check_msys_compat().unwrap_or(("/bin/sh".to_string(), false));
            log_debug(
                makefile.logger(),
                format!("running shell command '{cline}'"),
                Some(loc),
            );

            let mut cmd = if msys {
                Command::new(shell)
            } else {
                Command::new("/bin/sh")
            };
            let output = cmd
                .arg("-c")
                .arg(&cline)
                .current_dir(makefile.workdir())
                .stderr(Stdio::inherit())
                .output()
                .map_err(|e| {
                    MakeError::data(format!("shell command failed: {e}"), Some(loc.clone()))
                })?;

            let mut stdout = String::from_utf8_lossy(&output.stdout).replace("\r\n", "\n");
            if stdout.ends_with('\n') {
                stdout.pop();
            }
            Ok(stdout.replace('\n', " "))
        }
        FunctionKind::Error => Err(MakeError::data(arg(0)?, Some(loc.clone()))),
        FunctionKind::Warning => {
            log_warn(makefile.logger(), arg(0)?, Some(loc));
            Ok(String::new())
        }
        FunctionKind::Info => {
            log_info(makefile.logger(), arg(0)?, Some(loc));
            Ok(String::new())
        }
    }
}

fn map_words(text: &str, f: impl Fn(&str) -> String) -> String {
    split_words(text)
        .iter()
        .map(|w| f(w))
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_number(s: &str, kind: FunctionKind, loc: &Location) -> Result<i64, MakeError> {
    s.trim().parse().map_err(|_| {
        MakeError::data(
            format!("non-numeric argument to '{}' function: '{s}'", kind.name()),
            Some(loc.clone()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_resolve_back_to_kinds() {
        for name in FunctionKind::NAMES {
            let kind = FunctionKind::from_name(name).unwrap();
            assert_eq!(kind.name(), *name);
        }
        assert!(FunctionKind::from_name("nosuch").is_none());
    }

    #[test]
    fn test_arity_bounds() {
        assert_eq!(FunctionKind::Subst.arity(), (3, 3));
        assert_eq!(FunctionKind::Call.arity(), (1, 0));
        assert_eq!(FunctionKind::If.arity(), (2, 3));
    }
}
