//! Filename globbing relative to a working directory.
//!
//! Results use forward slashes and are relative to the working directory
//! whenever the pattern itself was relative.

use std::path::Path;

/// Whether a word contains glob metacharacters at all.
pub fn has_glob(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Expand `pattern` relative to `workdir`. Unreadable paths and invalid
/// patterns yield no matches.
pub fn glob(workdir: &Path, pattern: &str) -> Vec<String> {
    let relative = !Path::new(pattern).is_absolute();
    let full = if relative {
        format!("{}/{}", workdir.display(), pattern)
    } else {
        pattern.to_string()
    };

    let paths = match glob::glob(&full) {
        Ok(paths) => paths,
        Err(_) => return vec![],
    };

    let prefix = format!("{}/", workdir.display());
    paths
        .filter_map(|entry| entry.ok())
        .map(|path| {
            let s = path.display().to_string().replace('\\', "/");
            if relative {
                s.strip_prefix(&prefix).map(|r| r.to_string()).unwrap_or(s)
            } else {
                s
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn test_has_glob() {
        assert!(has_glob("*.c"));
        assert!(has_glob("foo?.c"));
        assert!(has_glob("[ab].c"));
        assert!(!has_glob("foo.c"));
    }

    #[test]
    fn test_glob_is_relative_to_workdir() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.c", "b.c", "a.o"] {
            File::create(dir.path().join(name)).unwrap();
        }

        let mut found = glob(dir.path(), "*.c");
        found.sort();
        assert_eq!(found, vec!["a.c", "b.c"]);
        assert!(glob(dir.path(), "*.x").is_empty());
    }
}
