//! `%`-patterns as used by pattern rules, `vpath`, and `patsubst`.
//!
//! From the GNU make manual: `%` characters can be quoted with
//! backslashes, and backslashes that would otherwise quote `%` characters
//! can be quoted with more backslashes. Backslashes that are not in danger
//! of quoting `%` characters go unmolested. For example, the pattern
//! `the\%weird\\%pattern\\` has `the%weird\` preceding the operative `%`
//! and `pattern\\` following it. Parsing patterns is context-sensitive:
//! `\%` and `\\` are unescaped only up to the operative `%`.

use std::fmt;

use crate::error::MakeError;

/// Either a plain string or a `(prefix, suffix)` split around the
/// operative `%`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pattern {
    Literal(String),
    Wild { prefix: String, suffix: String },
}

impl Pattern {
    pub fn new(s: &str) -> Self {
        let mut r = String::new();
        let mut chars = s.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => match chars.peek().map(|&(_, nc)| nc) {
                    Some('%') => {
                        r.push('%');
                        chars.next();
                    }
                    Some('\\') => {
                        r.push('\\');
                        chars.next();
                    }
                    _ => r.push('\\'),
                },
                '%' => {
                    return Self::Wild {
                        prefix: r,
                        suffix: s[i + 1..].to_string(),
                    }
                }
                _ => r.push(c),
            }
        }
        Self::Literal(r)
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, Self::Wild { .. })
    }

    /// A bare `%`, which matches every word.
    pub fn is_match_any(&self) -> bool {
        matches!(self, Self::Wild { prefix, suffix } if prefix.is_empty() && suffix.is_empty())
    }

    /// The target name of a non-pattern. Callers must not use this on a
    /// `%`-pattern.
    pub fn into_target(self) -> String {
        match self {
            Self::Literal(s) => s,
            Self::Wild { .. } => unreachable!("pattern used as a plain target"),
        }
    }

    pub fn has_slash(&self) -> bool {
        match self {
            Self::Literal(s) => s.contains('/'),
            Self::Wild { prefix, suffix } => prefix.contains('/') || suffix.contains('/'),
        }
    }

    /// Match a word against this pattern, returning the stem. A literal
    /// pattern matches only itself, with the whole word as the stem.
    pub fn match_word(&self, word: &str) -> Option<String> {
        match self {
            Self::Literal(s) => (word == s).then(|| word.to_string()),
            Self::Wild { prefix, suffix } => {
                if word.len() >= prefix.len() + suffix.len()
                    && word.starts_with(prefix.as_str())
                    && word.ends_with(suffix.as_str())
                {
                    Some(word[prefix.len()..word.len() - suffix.len()].to_string())
                } else {
                    None
                }
            }
        }
    }

    /// Instantiate this pattern with a directory part and a stem.
    pub fn resolve(&self, dir: &str, stem: &str) -> String {
        match self {
            Self::Literal(s) => s.clone(),
            Self::Wild { prefix, suffix } => format!("{dir}{prefix}{stem}{suffix}"),
        }
    }

    /// Replace this pattern with `replacement` in `word`, a la `patsubst`.
    /// With `must_match`, a non-matching word is a data error; otherwise it
    /// passes through unchanged.
    pub fn subst(
        &self,
        replacement: &str,
        word: &str,
        must_match: bool,
    ) -> Result<String, MakeError> {
        let stem = match self.match_word(word) {
            Some(stem) => stem,
            None => {
                if must_match {
                    return Err(MakeError::data(
                        format!("target '{word}' doesn't match pattern"),
                        None,
                    ));
                }
                return Ok(word.to_string());
            }
        };

        if !self.is_pattern() {
            // If we're not a pattern, the replacement is not parsed as a
            // pattern either.
            return Ok(replacement.to_string());
        }

        Ok(Pattern::new(replacement).resolve("", &stem))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Literal(s) => write!(f, "{}", s),
            Self::Wild { prefix, suffix } => write!(f, "{}%{}", prefix, suffix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::split_words;

    fn patsubst(pat: &str, repl: &str, text: &str) -> String {
        let p = Pattern::new(pat);
        split_words(text)
            .iter()
            .map(|w| p.subst(repl, w, false).unwrap())
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_match_and_stem() {
        let p = Pattern::new("%.o");
        assert_eq!(p.match_word("foo.o"), Some("foo".to_string()));
        assert_eq!(p.match_word("foo.c"), None);
        assert_eq!(p.resolve("sub/", "foo"), "sub/foo.o");
    }

    #[test]
    fn test_match_any() {
        let p = Pattern::new("%");
        assert!(p.is_match_any());
        assert_eq!(p.match_word("anything"), Some("anything".to_string()));
    }

    #[test]
    fn test_literal_match_returns_word_as_stem() {
        let p = Pattern::new("foo");
        assert!(!p.is_pattern());
        assert_eq!(p.match_word("foo"), Some("foo".to_string()));
        assert_eq!(p.match_word("bar"), None);
    }

    #[test]
    fn test_backslash_quoting() {
        // the\%weird\\%pattern\\ splits into "the%weird\" and "pattern\\".
        let p = Pattern::new(r"the\%weird\\%pattern\\");
        assert_eq!(
            p,
            Pattern::Wild {
                prefix: r"the%weird\".to_string(),
                suffix: r"pattern\\".to_string(),
            }
        );
    }

    #[test]
    fn test_patsubst_word_wise() {
        assert_eq!(
            patsubst("%.c", "%.o", " test test.c test.o "),
            "test test.o test.o"
        );
        assert_eq!(patsubst("%", "%.o", " test.c test.o "), "test.c.o test.o.o");
        assert_eq!(patsubst("foo", "bar", "test foo bar"), "test bar bar");
        // A non-pattern match does not parse the replacement as a pattern.
        assert_eq!(patsubst("foo", "%bar", "test foo bar"), "test %bar bar");
    }

    #[test]
    fn test_subst_must_match() {
        let p = Pattern::new("%.c");
        assert!(p.subst("%.o", "nope.txt", true).is_err());
        assert_eq!(p.subst("%.o", "nope.txt", false).unwrap(), "nope.txt");
    }

    proptest::proptest! {
        // A literal pattern substitutes to the replacement verbatim.
        #[test]
        fn prop_literal_subst(p in "[a-z.]{1,10}", r in "[a-z.%]{0,10}") {
            let pat = Pattern::new(&p);
            proptest::prop_assert_eq!(pat.subst(&r, &p, true).unwrap(), r);
        }

        // Substituting equals resolving the replacement with the stem.
        #[test]
        fn prop_subst_matches_resolve(
            prefix in "[a-z]{0,4}",
            suffix in "[a-z.]{0,4}",
            stem in "[a-z]{1,6}",
            rp in "[a-z]{0,3}",
            rs in "[a-z]{0,3}",
        ) {
            let pat = Pattern::new(&format!("{prefix}%{suffix}"));
            let word = format!("{prefix}{stem}{suffix}");
            let found = pat.match_word(&word).unwrap();
            let repl = format!("{rp}%{rs}");
            proptest::prop_assert_eq!(
                Pattern::new(&repl).resolve("", &found),
                pat.subst(&repl, &word, true).unwrap(),
            );
        }
    }
}
