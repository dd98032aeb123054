//! Parsing makefile syntax into the variable store and the target graph.
//!
//! Makefiles use a line-based parsing system. Continuations and
//! substitutions are handled differently based on the type of line being
//! parsed: makefile-syntax lines condense continuations to a single
//! space, while command lines keep the backslash and newline as part of
//! the command. Lines with an initial tab are commands if they can be
//! (there is a rule immediately preceding); otherwise they are parsed as
//! makefile syntax.
//!
//! After splitting data into parseable chunks, a recursive-descent parser
//! with an explicit stack nests parenthesized syntax into `Expansion`s.

pub mod data;
pub mod tokens;

use std::io::{BufRead, Cursor};
use std::rc::Rc;

use crate::error::MakeError;
use crate::expand::Expansion;
use crate::functions::{FunctionKind, FunctionNode};
use crate::globrelative;
use crate::location::Location;
use crate::logger::{log_debug, log_warn, Logger};
use crate::makefile::Makefile;
use crate::pattern::Pattern;
use crate::rule_map::{PatternRule, PatternRuleInstance, Rule, TargetRule};
use crate::util::split_words;
use crate::vars::{Source, VarScope};

use data::{iter_lines, Data};
use tokens::{ScanMode, TokenList};

const CONDITION_KEYWORDS: [&str; 4] = ["ifeq", "ifneq", "ifdef", "ifndef"];

const VARSET_TOKENS: [&str; 4] = [":=", "+=", "?=", "="];

const DIRECTIVE_NAMES: [&str; 14] = [
    "ifeq", "ifneq", "ifdef", "ifndef", "else", "endif", "define", "endef", "override",
    "include", "-include", "vpath", "export", "unexport",
];

fn directives() -> Rc<TokenList> {
    TokenList::get(&DIRECTIVE_NAMES)
}

fn conditions() -> Rc<TokenList> {
    TokenList::get(&CONDITION_KEYWORDS)
}

fn eqarg_tokens() -> Rc<TokenList> {
    TokenList::get(&["(", "'", "\""])
}

/// A makefile conditional frame: is the condition active right now, and
/// was any branch of it ever active?
struct Condition {
    active: bool,
    ever_active: bool,
    loc: Location,
}

impl Condition {
    fn new(active: bool, loc: Location) -> Self {
        Self {
            active,
            ever_active: active,
            loc,
        }
    }

    fn make_active(&mut self, active: bool) {
        if self.ever_active {
            self.active = false;
            return;
        }

        self.active = active;
        if active {
            self.ever_active = true;
        }
    }
}

/// The rule currently collecting recipe lines.
enum CurrentRule {
    Explicit(Rc<Rule>),
    Pattern(Rc<PatternRule>),
}

impl CurrentRule {
    fn add_command(&self, e: Expansion) {
        match self {
            Self::Explicit(r) => r.add_command(e),
            Self::Pattern(r) => r.add_command(e),
        }
    }
}

/// Parse a makefile stream into `makefile`.
pub fn parse_stream<R: BufRead + 'static>(
    stream: R,
    filename: &str,
    makefile: &Makefile,
) -> Result<(), MakeError> {
    let path: Rc<str> = filename.into();
    let mut lines = iter_lines(stream);
    let mut currule: Option<CurrentRule> = None;
    let mut condstack: Vec<Condition> = Vec::new();

    loop {
        let mut d = Data::new(&path, &mut lines);
        if !d.read_line() {
            break;
        }

        if d.data.starts_with('\t') && currule.is_some() {
            // A recipe line.
            if condstack.iter().any(|c| !c.active) {
                log_debug(
                    makefile.logger(),
                    "skipping line because of active conditions",
                    Some(&d.getloc(0)),
                );
                continue;
            }

            let (e, token, _) =
                parse_make_syntax(&mut d, 1, &[], ScanMode::Command, makefile.logger())?;
            debug_assert!(token.is_none());
            currule
                .as_ref()
                .expect("checked above")
                .add_command(e);
            continue;
        }

        // To parse makefile syntax, we first strip leading whitespace and
        // look for initial keywords. If there are no keywords, it's either
        // setting a variable or writing a rule.
        let offset = d.skip_whitespace(0);
        let (kword, offset) = d.find_token(offset, &directives(), true);

        match kword.as_deref() {
            Some("endif") => {
                ensure_end(&mut d, offset, "Unexpected data after 'endif' directive")?;
                if condstack.pop().is_none() {
                    return Err(MakeError::syntax(
                        "unmatched 'endif' directive",
                        d.getloc(offset),
                    ));
                }
                continue;
            }
            Some("else") => {
                if condstack.is_empty() {
                    return Err(MakeError::syntax(
                        "unmatched 'else' directive",
                        d.getloc(offset),
                    ));
                }

                let (kword, offset) = d.find_token(offset, &conditions(), true);
                match kword {
                    None => {
                        ensure_end(&mut d, offset, "Unexpected data after 'else' directive")?;
                        condstack.last_mut().expect("checked above").make_active(true);
                    }
                    Some(kword) => {
                        let blocked = condstack[..condstack.len() - 1]
                            .iter()
                            .any(|c| !c.active);
                        if !blocked {
                            let m = eval_condition(&kword, &mut d, offset, makefile)?;
                            condstack.last_mut().expect("checked above").make_active(m);
                        }
                    }
                }
                continue;
            }
            Some(kword) if CONDITION_KEYWORDS.contains(&kword) => {
                let loc = d.getloc(offset);
                if condstack.iter().any(|c| !c.active) {
                    // Under an inactive ancestor nothing is evaluated:
                    // just stick a dummy condition on the stack.
                    condstack.push(Condition::new(true, loc));
                } else {
                    let m = eval_condition(kword, &mut d, offset, makefile)?;
                    condstack.push(Condition::new(m, loc));
                }
                continue;
            }
            _ => {}
        }

        if condstack.iter().any(|c| !c.active) {
            log_debug(
                makefile.logger(),
                "skipping line because of active conditions",
                Some(&d.getloc(0)),
            );
            tokens::flatten(&mut d, offset, ScanMode::Makefile);
            continue;
        }

        match kword.as_deref() {
            Some("endef") => {
                return Err(MakeError::syntax("Unmatched endef", d.getloc(offset)));
            }
            Some("define") => {
                let (mut e, _, _) =
                    parse_make_syntax(&mut d, offset, &[], ScanMode::Makefile, makefile.logger())?;
                e.rstrip();
                let vname = e.resolve(makefile, makefile.global_scope(), &mut Vec::new())?;
                if vname.is_empty() {
                    return Err(MakeError::syntax("Empty variable name", d.getloc(offset)));
                }
                drop(d);

                let mut body = Data::new(&path, &mut lines);
                body.read_line();
                let text = tokens::read_define_body(&mut body, 0)?;
                makefile.global_scope().borrow_mut().set(
                    &vname,
                    crate::vars::Flavor::Recursive,
                    Source::Makefile,
                    text,
                    makefile.logger(),
                );
                continue;
            }
            Some(kw @ ("include" | "-include")) => {
                let (e, _, _) =
                    parse_make_syntax(&mut d, offset, &[], ScanMode::Makefile, makefile.logger())?;
                let files = e.resolve(makefile, makefile.global_scope(), &mut Vec::new())?;
                let loc = d.getloc(offset);
                for f in split_words(&files) {
                    makefile.include(&f.replace('\\', "/"), kw == "include", Some(loc.clone()))?;
                }
                continue;
            }
            Some("vpath") => {
                let (e, token, offset) = parse_make_syntax(
                    &mut d,
                    offset,
                    &[" ", "\t"],
                    ScanMode::Makefile,
                    makefile.logger(),
                )?;
                let patstr = e.resolve(makefile, makefile.global_scope(), &mut Vec::new())?;
                let pattern = Pattern::new(&patstr);
                if token.is_none() {
                    makefile.clear_all_vpaths();
                } else {
                    let (e, _, _) = parse_make_syntax(
                        &mut d,
                        offset,
                        &[],
                        ScanMode::Makefile,
                        makefile.logger(),
                    )?;
                    let dirs = e.resolve(makefile, makefile.global_scope(), &mut Vec::new())?;
                    let mut dirlist = Vec::new();
                    for direl in split_words(&dirs) {
                        dirlist.extend(
                            direl
                                .split(':')
                                .filter(|s| !s.is_empty())
                                .map(str::to_string),
                        );
                    }

                    if dirlist.is_empty() {
                        makefile.clear_vpath(&pattern);
                    } else {
                        makefile.add_vpath(pattern, dirlist);
                    }
                }
                continue;
            }
            Some("override") => {
                let (mut e, token, offset) = parse_make_syntax(
                    &mut d,
                    offset,
                    &VARSET_TOKENS,
                    ScanMode::Makefile,
                    makefile.logger(),
                )?;
                e.lstrip();
                e.rstrip();

                let Some(token) = token else {
                    return Err(MakeError::syntax(
                        "Malformed override directive, need =",
                        d.getloc(offset),
                    ));
                };

                let vname = e.resolve(makefile, makefile.global_scope(), &mut Vec::new())?;
                set_variable(
                    makefile.global_scope(),
                    makefile.global_scope(),
                    makefile,
                    &vname,
                    &token,
                    &mut d,
                    offset,
                    ScanMode::Makefile,
                    Source::Override,
                    true,
                )?;
                continue;
            }
            Some("export") => {
                let (mut e, token, offset) = parse_make_syntax(
                    &mut d,
                    offset,
                    &VARSET_TOKENS,
                    ScanMode::Makefile,
                    makefile.logger(),
                )?;
                e.lstrip();
                e.rstrip();
                let names = e.resolve(makefile, makefile.global_scope(), &mut Vec::new())?;

                let vlist = match token {
                    None => {
                        let vlist = split_words(&names);
                        if vlist.is_empty() {
                            return Err(MakeError::syntax(
                                "Exporting all variables is not supported",
                                d.getloc(offset),
                            ));
                        }
                        vlist
                    }
                    Some(token) => {
                        set_variable(
                            makefile.global_scope(),
                            makefile.global_scope(),
                            makefile,
                            &names,
                            &token,
                            &mut d,
                            offset,
                            ScanMode::Makefile,
                            Source::Makefile,
                            true,
                        )?;
                        vec![names.clone()]
                    }
                };

                for v in vlist {
                    makefile.add_export(v);
                }
                continue;
            }
            Some("unexport") => {
                return Err(MakeError::syntax(
                    "unexporting variables is not supported",
                    d.getloc(offset),
                ));
            }
            Some(other) => {
                return Err(MakeError::Internal(format!("unexpected keyword: {other}")));
            }
            None => {}
        }

        let mut rule_tokens: Vec<&str> = VARSET_TOKENS.to_vec();
        rule_tokens.extend(["::", ":"]);
        let (e, token, offset) = parse_make_syntax(
            &mut d,
            offset,
            &rule_tokens,
            ScanMode::Makefile,
            makefile.logger(),
        )?;

        let Some(token) = token else {
            let text = e.resolve(makefile, makefile.global_scope(), &mut Vec::new())?;
            if !text.trim().is_empty() {
                return Err(MakeError::syntax(
                    "Bad syntax: non-empty line is not a variable assignment or rule.",
                    d.getloc(0),
                ));
            }
            continue;
        };

        // We encountered real makefile syntax, so the current rule is over.
        currule = None;

        if VARSET_TOKENS.contains(&token.as_str()) {
            let mut e = e;
            e.lstrip();
            e.rstrip();
            let vname = e.resolve(makefile, makefile.global_scope(), &mut Vec::new())?;
            set_variable(
                makefile.global_scope(),
                makefile.global_scope(),
                makefile,
                &vname,
                &token,
                &mut d,
                offset,
                ScanMode::Makefile,
                Source::Makefile,
                true,
            )?;
            continue;
        }

        currule = parse_rule_header(
            &mut d,
            offset,
            e,
            token == "::",
            makefile,
        )?;
    }

    if let Some(cond) = condstack.last() {
        return Err(MakeError::syntax(
            "Condition never terminated with endif",
            cond.loc.clone(),
        ));
    }

    Ok(())
}

/// Everything after the `:` or `::` of a rule header: a plain rule, an
/// implicit rule, a static pattern rule, or a target/pattern-specific
/// variable assignment.
fn parse_rule_header(
    d: &mut Data,
    offset: usize,
    targets_expansion: Expansion,
    double_colon: bool,
    makefile: &Makefile,
) -> Result<Option<CurrentRule>, MakeError> {
    let header_loc = d.getloc(0);
    let target_words = split_words(
        &targets_expansion.resolve(makefile, makefile.global_scope(), &mut Vec::new())?,
    );
    let targets: Vec<Pattern> = expand_wildcards(makefile, target_words)
        .iter()
        .map(|t| Pattern::new(t))
        .collect();

    let is_pattern = match (
        targets.iter().any(|t| t.is_pattern()),
        targets.iter().any(|t| !t.is_pattern()),
    ) {
        (true, true) => {
            return Err(MakeError::syntax(
                "Mixed implicit and normal rule",
                d.getloc(offset),
            ))
        }
        (has_pattern, _) => has_pattern,
    };

    let mut after_tokens: Vec<&str> = VARSET_TOKENS.to_vec();
    after_tokens.extend([":", "|", ";"]);
    let (e, token, offset) = parse_make_syntax(
        d,
        offset,
        &after_tokens,
        ScanMode::Makefile,
        makefile.logger(),
    )?;

    match token.as_deref() {
        None | Some(";") => {
            let prereqs = expand_wildcards(
                makefile,
                split_words(&e.resolve(makefile, makefile.global_scope(), &mut Vec::new())?),
            );

            let currule = if is_pattern {
                let rule = Rc::new(PatternRule::new(
                    targets,
                    prereqs.iter().map(|p| Pattern::new(p)).collect(),
                    double_colon,
                    header_loc,
                ));
                makefile.append_implicit_rule(Rc::clone(&rule));
                CurrentRule::Pattern(rule)
            } else {
                let rule = Rc::new(Rule::new(prereqs, double_colon, header_loc.clone()));
                for t in &targets {
                    let name = t.clone().into_target();
                    makefile
                        .get_target(&name, true)
                        .borrow_mut()
                        .add_rule(TargetRule::Explicit(Rc::clone(&rule)), &header_loc)?;
                }
                if let Some(first) = targets.first() {
                    makefile.found_target(&first.clone().into_target());
                }
                CurrentRule::Explicit(rule)
            };

            if token.as_deref() == Some(";") {
                let offset = d.skip_whitespace(offset);
                let (cmd, _, _) =
                    parse_make_syntax(d, offset, &[], ScanMode::Command, makefile.logger())?;
                currule.add_command(cmd);
            }
            Ok(Some(currule))
        }
        Some(token) if VARSET_TOKENS.contains(&token) => {
            let mut e = e;
            e.lstrip();
            e.rstrip();
            let vname = e.resolve(makefile, makefile.global_scope(), &mut Vec::new())?;

            // Flatten the right-hand side once; scanning it per target
            // would pull each continuation line more than once.
            let value_loc = d.getloc(offset);
            let raw = tokens::flatten(d, offset, ScanMode::Makefile);

            for t in &targets {
                let scope = if is_pattern {
                    makefile.get_pattern_variables(t)
                } else {
                    let target = makefile.get_target(&t.clone().into_target(), true);
                    let scope = target.borrow().variables.clone();
                    scope
                };
                let mut vd = Data::from_string(&raw, value_loc.clone());
                set_variable(
                    makefile.global_scope(),
                    &scope,
                    makefile,
                    &vname,
                    token,
                    &mut vd,
                    0,
                    ScanMode::Plain,
                    Source::Makefile,
                    true,
                )?;
            }
            Ok(None)
        }
        Some("|") => Err(MakeError::syntax(
            "order-only prerequisites are not supported",
            d.getloc(offset),
        )),
        Some(":") => {
            // A static pattern rule.
            if is_pattern {
                return Err(MakeError::syntax(
                    "static pattern rules must have static targets",
                    d.getloc(0),
                ));
            }

            let patstr = e.resolve(makefile, makefile.global_scope(), &mut Vec::new())?;
            let patterns = split_words(&patstr);
            if patterns.len() != 1 {
                return Err(MakeError::syntax(
                    "A static pattern rule may have only one pattern",
                    d.getloc(offset),
                ));
            }
            let pattern = Pattern::new(&patterns[0]);

            let (e, token, offset) =
                parse_make_syntax(d, offset, &[";"], ScanMode::Makefile, makefile.logger())?;
            let prereqs: Vec<Pattern> = expand_wildcards(
                makefile,
                split_words(&e.resolve(makefile, makefile.global_scope(), &mut Vec::new())?),
            )
            .iter()
            .map(|p| Pattern::new(p))
            .collect();

            let rule = Rc::new(PatternRule::new(
                vec![pattern.clone()],
                prereqs,
                double_colon,
                header_loc.clone(),
            ));

            for t in &targets {
                let tname = t.clone().into_target();
                let Some(stem) = pattern.match_word(&tname) else {
                    return Err(MakeError::syntax(
                        format!(
                            "Target '{tname}' of static pattern rule does not match pattern '{pattern}'"
                        ),
                        d.getloc(0),
                    ));
                };
                let instance = PatternRuleInstance::new(
                    Rc::clone(&rule),
                    String::new(),
                    stem,
                    pattern.is_match_any(),
                );
                makefile
                    .get_target(&tname, true)
                    .borrow_mut()
                    .add_rule(TargetRule::Pattern(Rc::new(instance)), &header_loc)?;
            }
            if let Some(first) = targets.first() {
                makefile.found_target(&first.clone().into_target());
            }

            let currule = CurrentRule::Pattern(rule);
            if token.as_deref() == Some(";") {
                let offset = d.skip_whitespace(offset);
                let (cmd, _, _) =
                    parse_make_syntax(d, offset, &[], ScanMode::Command, makefile.logger())?;
                currule.add_command(cmd);
            }
            Ok(Some(currule))
        }
        Some(other) => Err(MakeError::Internal(format!(
            "unexpected rule token: {other}"
        ))),
    }
}

/// Parse makefile text produced at runtime, as `$(eval …)` does.
pub fn parse_string(text: &str, filename: &str, makefile: &Makefile) -> Result<(), MakeError> {
    parse_stream(Cursor::new(text.to_string()), filename, makefile)
}

/// Parse fixed text into an expansion with no escape processing, as
/// re-parsing a recursive variable's value requires.
pub fn parse_expansion_string(text: &str, loc: Location) -> Result<Expansion, MakeError> {
    let logger = crate::logger::StderrLogger { verbose: false };
    let mut d = Data::from_string(text, loc);
    let (e, token, _) = parse_make_syntax(&mut d, 0, &[], ScanMode::Plain, &logger)?;
    debug_assert!(token.is_none());
    Ok(e)
}

/// Ensure that only whitespace remains in this data.
fn ensure_end(d: &mut Data, offset: usize, msg: &str) -> Result<(), MakeError> {
    let rest = tokens::flatten(d, offset, ScanMode::Makefile);
    if !rest.trim().is_empty() {
        return Err(MakeError::syntax(msg, d.getloc(offset)));
    }
    Ok(())
}

fn expand_wildcards(makefile: &Makefile, words: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(words.len());
    for w in words {
        if globrelative::has_glob(&w) {
            out.extend(globrelative::glob(makefile.workdir(), &w));
        } else {
            out.push(w);
        }
    }
    out
}

fn eval_condition(
    kword: &str,
    d: &mut Data,
    offset: usize,
    makefile: &Makefile,
) -> Result<bool, MakeError> {
    match kword {
        "ifeq" => if_eq(d, offset, makefile),
        "ifneq" => if_eq(d, offset, makefile).map(|m| !m),
        "ifdef" => if_def(d, offset, makefile),
        "ifndef" => if_def(d, offset, makefile).map(|m| !m),
        _ => Err(MakeError::Internal(format!(
            "unexpected condition keyword: {kword}"
        ))),
    }
}

/// The variety of accepted formats for this directive is rather maddening:
/// `ifeq (a,b)`, `ifeq "a" "b"`, `ifeq 'a' 'b'`, and mixtures thereof.
fn if_eq(d: &mut Data, offset: usize, makefile: &Makefile) -> Result<bool, MakeError> {
    let (token, offset) = d.find_token(offset, &eqarg_tokens(), false);
    let Some(token) = token else {
        return Err(MakeError::syntax(
            "No arguments after conditional",
            d.getloc(offset),
        ));
    };

    let (arg1, arg2) = if token == "(" {
        let (mut arg1, t, offset) =
            parse_make_syntax(d, offset, &[","], ScanMode::Makefile, makefile.logger())?;
        if t.is_none() {
            return Err(MakeError::syntax(
                "Expected two arguments in conditional",
                d.getloc(offset),
            ));
        }
        arg1.rstrip();

        let offset = d.skip_whitespace(offset);
        let (arg2, t, offset) =
            parse_make_syntax(d, offset, &[")"], ScanMode::Makefile, makefile.logger())?;
        if t.is_none() {
            return Err(MakeError::syntax(
                "Unexpected text in conditional",
                d.getloc(offset),
            ));
        }

        ensure_end(d, offset, "Unexpected text after conditional")?;
        (arg1, arg2)
    } else {
        let (arg1, t, offset) =
            parse_make_syntax(d, offset, &[token.as_str()], ScanMode::Makefile, makefile.logger())?;
        if t.is_none() {
            return Err(MakeError::syntax(
                "Unexpected text in conditional",
                d.getloc(offset),
            ));
        }

        let offset = d.skip_whitespace(offset);
        let quote = match d.char_at(offset) {
            Some(c @ ('\'' | '"')) => c.to_string(),
            Some(_) => {
                return Err(MakeError::syntax(
                    "Unexpected text in conditional",
                    d.getloc(offset),
                ))
            }
            None => {
                return Err(MakeError::syntax(
                    "Expected two arguments in conditional",
                    d.getloc(offset),
                ))
            }
        };

        let (arg2, _, offset) = parse_make_syntax(
            d,
            offset + 1,
            &[quote.as_str()],
            ScanMode::Makefile,
            makefile.logger(),
        )?;
        ensure_end(d, offset, "Unexpected text after conditional")?;
        (arg1, arg2)
    };

    let val1 = arg1.resolve(makefile, makefile.global_scope(), &mut Vec::new())?;
    let val2 = arg2.resolve(makefile, makefile.global_scope(), &mut Vec::new())?;
    Ok(val1 == val2)
}

/// `ifdef` tests whether the named variable has a non-empty raw value;
/// the variable is *not* expanded.
fn if_def(d: &mut Data, offset: usize, makefile: &Makefile) -> Result<bool, MakeError> {
    let (mut e, _, _) = parse_make_syntax(d, offset, &[], ScanMode::Makefile, makefile.logger())?;
    e.rstrip();
    let vname = e.resolve(makefile, makefile.global_scope(), &mut Vec::new())?;

    Ok(makefile
        .global_scope()
        .borrow()
        .get_raw(&vname)
        .is_some_and(|(_, _, value)| !value.is_empty()))
}

/// Parse what's left in `d` into a variable binding. `resolve_scope` is
/// where references in the right-hand side are looked up; `set_scope` is
/// where the binding lands (a target or pattern scope for rule-scoped
/// assignments).
#[allow(clippy::too_many_arguments)]
pub fn set_variable(
    resolve_scope: &VarScope,
    set_scope: &VarScope,
    makefile: &Makefile,
    vname: &str,
    token: &str,
    d: &mut Data,
    offset: usize,
    mode: ScanMode,
    source: Source,
    skip_whitespace: bool,
) -> Result<(), MakeError> {
    if vname.is_empty() {
        return Err(MakeError::syntax("Empty variable name", d.getloc(offset)));
    }

    use crate::vars::Flavor;
    match token {
        "+=" => {
            let mut val = tokens::flatten(d, offset, mode);
            if skip_whitespace {
                val = val.trim_start().to_string();
            }
            crate::vars::append(set_scope, vname, source, val, resolve_scope, makefile)?;
        }
        "?=" => {
            let mut val = tokens::flatten(d, offset, mode);
            if skip_whitespace {
                val = val.trim_start().to_string();
            }
            if set_scope.borrow().get_raw(vname).is_some() {
                return Ok(());
            }
            set_scope.borrow_mut().set(
                vname,
                Flavor::Recursive,
                source,
                val,
                makefile.logger(),
            );
        }
        "=" => {
            let mut val = tokens::flatten(d, offset, mode);
            if skip_whitespace {
                val = val.trim_start().to_string();
            }
            set_scope.borrow_mut().set(
                vname,
                Flavor::Recursive,
                source,
                val,
                makefile.logger(),
            );
        }
        ":=" => {
            let (mut e, _, _) = parse_make_syntax(d, offset, &[], mode, makefile.logger())?;
            if skip_whitespace {
                e.lstrip();
            }
            let val = e.resolve(makefile, resolve_scope, &mut Vec::new())?;
            set_scope
                .borrow_mut()
                .set(vname, Flavor::Simple, source, val, makefile.logger());
        }
        other => {
            return Err(MakeError::Internal(format!(
                "unexpected assignment token: {other}"
            )));
        }
    }

    Ok(())
}

/// Given the positional arguments of a command-line invocation, apply the
/// `V=val` / `V:=val` override assignments and return the rest as goals.
pub fn parse_command_line_args(
    makefile: &Makefile,
    args: &[String],
) -> Result<Vec<String>, MakeError> {
    let mut goals = Vec::new();

    for (i, a) in args.iter().enumerate() {
        let (vname, token, val) = match a.split_once(":=") {
            Some((v, rest)) => (v, ":=", rest),
            None => match a.split_once('=') {
                Some((v, rest)) => (v, "=", rest),
                None => {
                    goals.push(a.clone());
                    continue;
                }
            },
        };

        makefile.add_override(a);

        let vname = vname.trim();
        let loc = Location::new("<command-line>", i, vname.len() + token.len());
        let mut d = Data::from_string(val, loc);
        set_variable(
            makefile.global_scope(),
            makefile.global_scope(),
            makefile,
            vname,
            token,
            &mut d,
            0,
            ScanMode::Plain,
            Source::CommandLine,
            true,
        )?;
    }

    Ok(goals)
}

/// One frame of the expansion sub-parser.
enum FrameState {
    Toplevel,
    Function {
        kind: FunctionKind,
        loc: Location,
        args: Vec<Expansion>,
    },
    Varname {
        loc: Location,
    },
    SubstFrom {
        loc: Location,
        name: Expansion,
    },
    SubstTo {
        loc: Location,
        name: Expansion,
        from: Expansion,
    },
}

struct Frame {
    state: FrameState,
    expansion: Expansion,
    tokens: Rc<TokenList>,
    close: &'static str,
}

/// Parse `d` from `startat` into an `Expansion`, stopping at the first
/// token in `stopon`. Returns `(expansion, token, offset)`; when all data
/// is consumed the token is `None`.
pub fn parse_make_syntax(
    d: &mut Data,
    startat: usize,
    stopon: &[&str],
    mode: ScanMode,
    logger: &dyn Logger,
) -> Result<(Expansion, Option<String>, usize), MakeError> {
    let top_tokens = {
        let mut list: Vec<&str> = stopon.to_vec();
        list.push("$");
        TokenList::get(&list)
    };

    let mut stack = vec![Frame {
        state: FrameState::Toplevel,
        expansion: Expansion::new(Some(d.getloc(startat))),
        tokens: top_tokens,
        close: "",
    }];
    let mut offset = startat;

    loop {
        let tokens = Rc::clone(&stack.last().expect("stack never empties").tokens);
        let mut flat = String::new();
        let chunk = tokens::scan(d, offset, &tokens, mode, &mut flat);
        stack
            .last_mut()
            .expect("stack never empties")
            .expansion
            .append_str(&flat);

        let Some(token) = chunk.token else {
            offset = chunk.after;
            break;
        };
        offset = chunk.after;

        if token == "$" {
            if offset == d.len() {
                // An unterminated `$` expands to nothing.
                break;
            }

            let loc = d.getloc(chunk.token_offset);
            let c = d.char_at(offset).expect("offset checked against len");
            match c {
                '$' => {
                    stack
                        .last_mut()
                        .expect("stack never empties")
                        .expansion
                        .append_str("$");
                    offset += 1;
                }
                '(' | '{' => {
                    let close = if c == '(' { ")" } else { "}" };

                    // Look forward for a function name.
                    let (fname, after) =
                        d.find_token(offset + 1, &tokens::function_tokens(), true);
                    if let Some(fname) = fname {
                        let kind = FunctionKind::from_name(&fname)
                            .expect("token list is built from function names");
                        let (_, maxargs) = kind.arity();
                        let tokens = if maxargs == 1 {
                            TokenList::get(&[close, "$"])
                        } else {
                            TokenList::get(&[",", close, "$"])
                        };
                        stack.push(Frame {
                            state: FrameState::Function {
                                kind,
                                loc,
                                args: Vec::new(),
                            },
                            expansion: Expansion::new(None),
                            tokens,
                            close,
                        });
                        offset = after;
                    } else {
                        stack.push(Frame {
                            state: FrameState::Varname { loc },
                            expansion: Expansion::new(None),
                            tokens: TokenList::get(&[":", close, "$"]),
                            close,
                        });
                        offset += 1;
                    }
                }
                _ => {
                    let name = Expansion::from_literal(c.to_string());
                    stack
                        .last_mut()
                        .expect("stack never empties")
                        .expansion
                        .append_func(FunctionNode::VariableRef {
                            loc,
                            name: Box::new(name),
                        });
                    offset += c.len_utf8();
                }
            }
            continue;
        }

        // A stop token for the current frame.
        if matches!(
            stack.last().expect("stack never empties").state,
            FrameState::Toplevel
        ) {
            debug_assert_eq!(stack.len(), 1);
            let frame = stack.pop().expect("stack never empties");
            return Ok((frame.expansion, Some(token), offset));
        }

        let in_place = match &stack.last().expect("stack never empties").state {
            FrameState::Function { .. } => token == ",",
            FrameState::Varname { .. } => token == ":",
            FrameState::SubstFrom { .. } => token == "=",
            FrameState::SubstTo { .. } => false,
            FrameState::Toplevel => unreachable!("handled above"),
        };

        if in_place {
            let frame = stack.last_mut().expect("stack never empties");
            let expansion = std::mem::take(&mut frame.expansion);
            match &mut frame.state {
                FrameState::Function { kind, args, .. } => {
                    args.push(expansion);
                    // Count the argument being collected next: once the
                    // last one starts, commas are plain text.
                    let (_, maxargs) = kind.arity();
                    if maxargs != 0 && args.len() + 1 == maxargs {
                        frame.tokens = TokenList::get(&[frame.close, "$"]);
                    }
                }
                FrameState::Varname { loc } => {
                    let loc = loc.clone();
                    frame.state = FrameState::SubstFrom {
                        loc,
                        name: expansion,
                    };
                    frame.tokens = TokenList::get(&["=", frame.close, "$"]);
                }
                FrameState::SubstFrom { loc, name } => {
                    let loc = loc.clone();
                    let name = std::mem::take(name);
                    frame.state = FrameState::SubstTo {
                        loc,
                        name,
                        from: expansion,
                    };
                    frame.tokens = TokenList::get(&[frame.close, "$"]);
                }
                _ => unreachable!("in-place transitions handle only these states"),
            }
        } else {
            let frame = stack.pop().expect("stack never empties");
            debug_assert_eq!(token, frame.close);
            let parent = stack.last_mut().expect("parser stack underflow");
            match frame.state {
                FrameState::Function { kind, loc, mut args } => {
                    args.push(frame.expansion);
                    let mut node = FunctionNode::Call { kind, loc, args };
                    node.setup()?;
                    parent.expansion.append_func(node);
                }
                FrameState::Varname { loc } => {
                    parent.expansion.append_func(FunctionNode::VariableRef {
                        loc,
                        name: Box::new(frame.expansion),
                    });
                }
                FrameState::SubstFrom { loc, mut name } => {
                    // A reference like $(VARNAME:.ee) is probably a mistake,
                    // but make parses it as a plain variable whose name
                    // contains the colon. Issue a warning.
                    log_warn(
                        logger,
                        format!("{loc}: Variable reference looks like substitution without ="),
                        None,
                    );
                    name.append_str(":");
                    name.concat(frame.expansion);
                    parent.expansion.append_func(FunctionNode::VariableRef {
                        loc,
                        name: Box::new(name),
                    });
                }
                FrameState::SubstTo { loc, name, from } => {
                    parent.expansion.append_func(FunctionNode::SubstitutionRef {
                        loc,
                        name: Box::new(name),
                        from: Box::new(from),
                        to: Box::new(frame.expansion),
                    });
                }
                FrameState::Toplevel => unreachable!("toplevel returns above"),
            }
        }
    }

    if stack.len() != 1 {
        return Err(MakeError::syntax(
            "Unterminated function call",
            d.getloc(offset.min(d.len().saturating_sub(1))),
        ));
    }

    let frame = stack.pop().expect("stack never empties");
    Ok((frame.expansion, None, d.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    use crate::logger::StderrLogger;
    use crate::process::Scheduler;
    use crate::vars::Env;

    fn test_makefile() -> Rc<Makefile> {
        let scheduler = Scheduler::new();
        let context = scheduler.new_context(1);
        Makefile::new(
            std::env::temp_dir(),
            Env::new(),
            0,
            "j1".to_string(),
            0,
            context,
            Rc::new(StderrLogger { verbose: false }),
        )
    }

    fn parsed(text: &str) -> Rc<Makefile> {
        let makefile = test_makefile();
        parse_string(text, "test.mk", &makefile).unwrap();
        makefile
    }

    fn value_of(makefile: &Makefile, name: &str) -> String {
        let entry = makefile.global_scope().borrow().get_expansion(name).unwrap();
        let (_, _, e) = entry.unwrap_or_else(|| panic!("variable '{name}' is unset"));
        e.resolve(makefile, makefile.global_scope(), &mut Vec::new())
            .unwrap()
    }

    fn is_set(makefile: &Makefile, name: &str) -> bool {
        makefile.global_scope().borrow().get_raw(name).is_some()
    }

    #[test]
    fn test_rules_variables_and_implicit_rules() {
        let makefile = parsed(concat!(
            "VAR = value\n",
            "GREETING = dummy\n",
            "all: GREETING = myrule\n",
            "all:: test test2 $(VAR)\n",
            "\techo \"Hello, $(GREETING)\"\n",
            "%.o: %.c\n",
            "\t$(CC) -o $@ $<\n",
        ));

        assert_eq!(makefile.default_target(), Some("all".to_string()));

        let all = makefile.get_target("all", false);
        let all = all.borrow();
        assert_eq!(all.rules().len(), 1);
        assert!(all.rules()[0].double_colon());
        assert_eq!(all.rules()[0].prerequisites(), vec!["test", "test2", "value"]);

        // The recipe resolves lazily against the target's scope, so the
        // target-specific GREETING wins.
        let commands = all.rules()[0].commands();
        assert_eq!(commands.len(), 1);
        let resolved = commands[0]
            .resolve(&makefile, &all.variables, &mut Vec::new())
            .unwrap();
        assert_eq!(resolved, "echo \"Hello, myrule\"");

        let implicit = makefile.implicit_rules();
        assert_eq!(implicit.len(), 1);
        let stem = implicit[0].target_patterns[0].match_word("foo.o").unwrap();
        assert_eq!(stem, "foo");
        assert_eq!(implicit[0].prerequisites[0].resolve("", &stem), "foo.c");
    }

    #[test]
    fn test_substitution_reference() {
        let makefile = parsed("SRC = a.c b.c c.c\nOBJ = $(SRC:.c=.o)\n");
        assert_eq!(value_of(&makefile, "OBJ"), "a.o b.o c.o");
    }

    #[test]
    fn test_append_across_simple_and_recursive() {
        let makefile = parsed(concat!(
            "A := hello\n",
            "A += world\n",
            "B = base\n",
            "B += $(A)\n",
        ));
        assert_eq!(value_of(&makefile, "A"), "hello world");
        assert_eq!(value_of(&makefile, "B"), "base hello world");
    }

    #[test]
    fn test_conditional_define() {
        let text = concat!(
            "ifeq ($(X),yes)\n",
            "define M\n",
            "line1\n",
            "line2\n",
            "endef\n",
            "endif\n",
        );

        let makefile = parsed(&format!("X = yes\n{text}"));
        assert_eq!(value_of(&makefile, "M"), "line1\nline2");

        let makefile = parsed(&format!("X = no\n{text}"));
        assert!(!is_set(&makefile, "M"));
    }

    #[test]
    fn test_else_activates_once() {
        let text = concat!(
            "ifeq ($(X),a)\n",
            "R = one\n",
            "else ifeq ($(X),b)\n",
            "R = two\n",
            "else\n",
            "R = three\n",
            "endif\n",
        );

        for (x, expected) in [("a", "one"), ("b", "two"), ("c", "three")] {
            let makefile = parsed(&format!("X = {x}\n{text}"));
            assert_eq!(value_of(&makefile, "R"), expected, "X = {x}");
        }
    }

    #[test]
    fn test_ifdef_does_not_expand() {
        // FOO has a non-empty raw value even though it expands to nothing.
        let makefile = parsed(concat!(
            "FOO = $(UNSET)\n",
            "ifdef FOO\n",
            "R = defined\n",
            "else\n",
            "R = undefined\n",
            "endif\n",
        ));
        assert_eq!(value_of(&makefile, "R"), "defined");
    }

    #[test]
    fn test_question_assignment_only_sets_unset() {
        let makefile = parsed("A = first\nA ?= second\nB ?= only\n");
        assert_eq!(value_of(&makefile, "A"), "first");
        assert_eq!(value_of(&makefile, "B"), "only");
    }

    #[test]
    fn test_order_only_prerequisites_are_fatal() {
        let makefile = test_makefile();
        let err = parse_string("a: b | c\n", "test.mk", &makefile).unwrap_err();
        assert!(err.to_string().contains("order-only"));
    }

    #[test]
    fn test_unexport_is_fatal() {
        let makefile = test_makefile();
        assert!(parse_string("unexport FOO\n", "test.mk", &makefile).is_err());
    }

    #[test]
    fn test_unterminated_conditional() {
        let makefile = test_makefile();
        let err = parse_string("ifeq (a,a)\nX = 1\n", "test.mk", &makefile).unwrap_err();
        assert!(err.to_string().contains("endif"));
    }

    #[test]
    fn test_eval_during_parse() {
        let makefile = parsed("E := $(eval X = 5)\nY = $(X)\n");
        assert_eq!(value_of(&makefile, "X"), "5");
        assert_eq!(value_of(&makefile, "Y"), "5");
        assert_eq!(value_of(&makefile, "E"), "");
    }

    #[test]
    fn test_eval_rejected_after_parsing_finished() {
        let makefile = parsed("LATE = $(eval X = 5)\n");
        makefile.finish_parsing();
        let entry = makefile.global_scope().borrow().get_expansion("LATE").unwrap();
        let (_, _, e) = entry.unwrap();
        let err = e
            .resolve(&makefile, makefile.global_scope(), &mut Vec::new())
            .unwrap_err();
        assert!(err.to_string().contains("eval"));
    }

    #[test]
    fn test_self_reference_is_detected() {
        let makefile = parsed("A = $(B)\nB = $(A)\n");
        let entry = makefile.global_scope().borrow().get_expansion("A").unwrap();
        let (_, _, e) = entry.unwrap();
        let err = e
            .resolve(&makefile, makefile.global_scope(), &mut Vec::new())
            .unwrap_err();
        assert!(err.to_string().contains("recursively references itself"));
    }

    #[test]
    fn test_builtin_functions() {
        let makefile = parsed(concat!(
            "LIST = c b a c\n",
            "SORTED := $(sort $(LIST))\n",
            "COUNT := $(words $(LIST))\n",
            "SECOND := $(word 2,$(LIST))\n",
            "GONE := $(word 9,$(LIST))\n",
            "STRIPPED := $(strip   x   y  )\n",
            "FILTERED := $(filter %.c,main.c main.o lib.c)\n",
            "KEPT := $(filter-out %.c,main.c main.o lib.c)\n",
            "JOINED := $(join a b,.c .o)\n",
            "DIRS := $(dir src/foo.c bar.h)\n",
            "IFV := $(if $(LIST),yes,no)\n",
            "IFE := $(if $(EMPTY),yes,no)\n",
            "UP := $(subst .c,.o,main.c)\n",
            "BASE := $(basename src/foo.c)\n",
            "SUF := $(suffix src/foo.c bare)\n",
            "PRE := $(addprefix obj/,a b)\n",
            "POST := $(addsuffix .o,a b)\n",
        ));

        for (name, expected) in [
            ("SORTED", "a b c"),
            ("COUNT", "4"),
            ("SECOND", "b"),
            ("GONE", ""),
            ("STRIPPED", "x y"),
            ("FILTERED", "main.c lib.c"),
            ("KEPT", "main.o"),
            ("JOINED", "a.c b.o"),
            ("DIRS", "src/ ./"),
            ("IFV", "yes"),
            ("IFE", "no"),
            ("UP", "main.o"),
            ("BASE", "src/foo"),
            ("SUF", ".c"),
            ("PRE", "obj/a obj/b"),
            ("POST", "a.o b.o"),
        ] {
            let entry = makefile.global_scope().borrow().get_raw(name).unwrap();
            assert_eq!(entry.2, expected, "${name}");
        }
    }

    #[test]
    fn test_foreach_and_call() {
        let makefile = parsed(concat!(
            "reverse = $(2) $(1)\n",
            "R := $(call reverse,one,two)\n",
            "F := $(foreach v,a b c,[$(v)])\n",
        ));
        assert_eq!(value_of(&makefile, "R"), "two one");
        assert_eq!(value_of(&makefile, "F"), "[a] [b] [c]");
    }

    #[test]
    fn test_origin_flavor_value() {
        let makefile = parsed(concat!(
            "REC = raw $(stuff)\n",
            "SIMPLE := done\n",
            "O1 := $(origin REC)\n",
            "O2 := $(origin NOPE)\n",
            "F1 := $(flavor REC)\n",
            "F2 := $(flavor SIMPLE)\n",
            "V := $(value REC)\n",
        ));
        assert_eq!(value_of(&makefile, "O1"), "file");
        assert_eq!(value_of(&makefile, "O2"), "undefined");
        assert_eq!(value_of(&makefile, "F1"), "recursive");
        assert_eq!(value_of(&makefile, "F2"), "simple");
        assert_eq!(value_of(&makefile, "V"), "raw $(stuff)");
    }

    #[test]
    fn test_substitution_without_equals_is_a_variable() {
        // $(V:x) parses as a variable whose name contains the colon.
        let makefile = parsed("W := $(V:x)ok\n");
        assert_eq!(value_of(&makefile, "W"), "ok");
    }

    #[test]
    fn test_command_line_args() {
        let makefile = test_makefile();
        let args = vec![
            "all".to_string(),
            "V=1".to_string(),
            "W:=two words".to_string(),
            "clean".to_string(),
        ];
        let goals = parse_command_line_args(&makefile, &args).unwrap();
        assert_eq!(goals, vec!["all", "clean"]);
        assert_eq!(value_of(&makefile, "V"), "1");
        assert_eq!(value_of(&makefile, "W"), "two words");

        // Command-line bindings outrank makefile assignments.
        parse_string("V = overwritten\n", "test.mk", &makefile).unwrap();
        assert_eq!(value_of(&makefile, "V"), "1");
    }

    #[test]
    fn test_static_pattern_rule() {
        let makefile = parsed(concat!(
            "a.o b.o: %.o: %.c\n",
            "\tcc -c $<\n",
        ));

        let target = makefile.get_target("a.o", false);
        let target = target.borrow();
        assert_eq!(target.rules().len(), 1);
        assert_eq!(target.rules()[0].prerequisites(), vec!["a.c"]);
        assert_eq!(target.rules()[0].stem(), Some("a"));
    }

    #[test]
    fn test_mixed_pattern_and_normal_targets_rejected() {
        let makefile = test_makefile();
        assert!(parse_string("%.o all: x\n", "test.mk", &makefile).is_err());
    }

    #[test]
    fn test_export_collects_names() {
        let makefile = parsed("A = 1\nexport A\nexport B = 2\n");
        let env = makefile.sub_environment();
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert_eq!(env.get("B").map(String::as_str), Some("2"));
        assert_eq!(env.get("MAKELEVEL").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_define_with_continuation() {
        let makefile = parsed("define M\nline1 \\\n  cont\nline2\nendef\n");
        assert_eq!(value_of(&makefile, "M"), "line1 cont\nline2");
    }

    #[test]
    fn test_comments_and_continuations() {
        let makefile = parsed("A = one \\\n    two # trailing comment\nB = \\# literal\n");
        assert_eq!(value_of(&makefile, "A"), "one two ");
        assert_eq!(value_of(&makefile, "B"), "# literal");
    }

    #[test]
    fn test_vpath_directive() {
        let makefile = parsed("vpath %.c src:lib other\nvpath %.h include\n");
        let dirs = makefile.vpath_dirs_for("foo.c").unwrap();
        assert_eq!(dirs, vec!["src", "lib", "other"]);
        let dirs = makefile.vpath_dirs_for("foo.h").unwrap();
        assert_eq!(dirs, vec!["include"]);

        let makefile = parsed("vpath %.c src\nvpath\n");
        assert!(makefile.vpath_dirs_for("foo.c").unwrap().is_empty());
    }

    #[test]
    fn test_semicolon_recipe() {
        let makefile = parsed("all: ; echo hi\n");
        let target = makefile.get_target("all", false);
        let commands = target.borrow().rules()[0].commands();
        assert_eq!(commands.len(), 1);
        let resolved = commands[0]
            .resolve(&makefile, makefile.global_scope(), &mut Vec::new())
            .unwrap();
        assert_eq!(resolved, "echo hi");
    }

}
