//! Small utilities shared across the crate.

use std::env;

use crate::error::MakeError;

/// Split a string into its whitespace-separated words.
pub fn split_words(s: &str) -> Vec<String> {
    s.split_whitespace().map(|w| w.to_string()).collect()
}

/// Drop duplicate words, keeping the first occurrence of each.
pub fn without_dups<'a, I: IntoIterator<Item = &'a String>>(words: I) -> Vec<String> {
    let mut seen = Vec::new();
    for w in words {
        if !seen.contains(w) {
            seen.push(w.clone());
        }
    }
    seen
}

/// For msys compatibility on windows, honor the `SHELL` environment
/// variable, and if `MSYSTEM == MINGW32`, run commands through `$SHELL -c`
/// instead of the system shell. Returns `(shell, msys)`.
pub fn check_msys_compat() -> Result<(String, bool), MakeError> {
    let mut shell = match env::var("SHELL") {
        Ok(s) => s,
        Err(_) => match env::var("COMSPEC") {
            Ok(s) => s,
            Err(_) => return Err(MakeError::data("Can't find a suitable shell!", None)),
        },
    };

    let mut msys = false;
    if env::var("MSYSTEM").as_deref() == Ok("MINGW32") {
        msys = true;
        if !shell.to_lowercase().ends_with(".exe") {
            shell.push_str(".exe");
        }
    }

    Ok((shell, msys))
}

/// Split a path into `(dirpart, filepart)` on the last slash. With no
/// slash, the dirpart defaults to `default`.
pub fn path_split<'a>(path: &'a str, default: &'a str) -> (&'a str, &'a str) {
    match path.rfind('/') {
        Some(i) => (&path[..i + 1], &path[i + 1..]),
        None => (default, path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_split_words() {
        assert_eq!(
            split_words(" test test.c test.o "),
            vec!["test", "test.c", "test.o"]
        );
        assert_eq!(
            split_words("\ttest\t  test.c \ntest.o"),
            vec!["test", "test.c", "test.o"]
        );
        assert!(split_words("").is_empty());
    }

    #[test]
    fn test_without_dups() {
        let words: Vec<String> = ["a", "b", "a", "c", "b"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(without_dups(&words), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_path_split() {
        assert_eq!(path_split("foo/bar.c", "./"), ("foo/", "bar.c"));
        assert_eq!(path_split("bar.c", "./"), ("./", "bar.c"));
        assert_eq!(path_split("bar.c", ""), ("", "bar.c"));
    }

    proptest! {
        // Words are exactly the maximal non-whitespace runs, in order.
        #[test]
        fn prop_split_words_matches_runs(s in "[ \t\na-z.]{0,40}") {
            let expected: Vec<String> =
                s.split([' ', '\t', '\n']).filter(|w| !w.is_empty()).map(String::from).collect();
            prop_assert_eq!(split_words(&s), expected);
        }
    }
}
