//! Character-level scanning over `Data` buffers.
//!
//! Each lexical context (plain data, makefile lines, command lines,
//! `define` bodies) has its own escape, comment, and continuation rules.
//! A scan step appends literal text to the caller's buffer and stops at
//! the next caller-supplied token or at the end of the virtual line,
//! pulling physical continuation lines from the buffer as needed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::MakeError;
use crate::functions::FunctionKind;

use super::data::Data;

/// A list of literal tokens to search for. Longest tokens match first, so
/// `::` wins over `:` and `wordlist` over `word`. Lists are memoized by
/// content.
#[derive(Debug)]
pub struct TokenList {
    tokens: Vec<String>,
}

thread_local! {
    static TOKENLIST_CACHE: RefCell<HashMap<Vec<String>, Rc<TokenList>>> =
        RefCell::new(HashMap::new());
}

impl TokenList {
    fn new(tokens: &[&str]) -> Self {
        let mut tokens: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
        tokens.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        Self { tokens }
    }

    pub fn get(tokens: &[&str]) -> Rc<TokenList> {
        let key: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
        TOKENLIST_CACHE.with(|cache| {
            Rc::clone(
                cache
                    .borrow_mut()
                    .entry(key)
                    .or_insert_with(|| Rc::new(TokenList::new(tokens))),
            )
        })
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// The longest token matching at exactly `offset`.
    pub fn match_at<'t>(&'t self, data: &str, offset: usize) -> Option<&'t str> {
        self.tokens
            .iter()
            .find(|t| data[offset..].starts_with(t.as_str()))
            .map(|t| t.as_str())
    }
}

fn empty_tokens() -> Rc<TokenList> {
    TokenList::get(&[])
}

fn define_tokens() -> Rc<TokenList> {
    TokenList::get(&["define", "endef"])
}

pub fn function_tokens() -> Rc<TokenList> {
    TokenList::get(FunctionKind::NAMES)
}

/// The lexical context of a scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanMode {
    /// Raw data: no escape processing at all.
    Plain,
    /// Makefile lines: `\#` escapes, comments, collapsed continuations.
    Makefile,
    /// Command lines: continuations stay literal, no comment handling.
    Command,
}

/// The result of one scan step.
pub struct Chunk {
    /// A caller token, or `None` when the virtual line ended.
    pub token: Option<String>,
    pub token_offset: usize,
    /// Offset to continue scanning from.
    pub after: usize,
}

enum Hit<'t> {
    Caller(&'t str),
    Newline,
    CommentStart,
    /// `\\#`: a quoted backslash followed by a comment.
    EscapedBackslashComment,
    /// `\#`: a literal `#`.
    EscapedHash,
    /// Backslash-newline.
    Continuation,
    /// Backslash, trailing whitespace, backslash-newline; `end` is past
    /// the final newline.
    SpacedContinuation { end: usize },
    /// Backslash followed by any other character; `end` is past it.
    Escaped { end: usize },
}

fn find_hit<'t>(
    d: &Data,
    offset: usize,
    tokens: &'t TokenList,
    mode: ScanMode,
) -> Option<(usize, Hit<'t>)> {
    let data = &d.data;
    let mut i = offset;
    while i < data.len() {
        if !data.is_char_boundary(i) {
            i += 1;
            continue;
        }

        if let Some(tok) = tokens.match_at(data, i) {
            return Some((i, Hit::Caller(tok)));
        }

        if mode != ScanMode::Plain {
            let rest = &data[i..];
            if rest.starts_with('\n') {
                return Some((i, Hit::Newline));
            }
            if mode == ScanMode::Makefile && rest.starts_with('#') {
                return Some((i, Hit::CommentStart));
            }
            if rest.starts_with('\\') {
                if mode == ScanMode::Makefile {
                    if rest.starts_with("\\\\#") {
                        return Some((i, Hit::EscapedBackslashComment));
                    }
                    if rest.starts_with("\\#") {
                        return Some((i, Hit::EscapedHash));
                    }
                }
                if rest.starts_with("\\\n") {
                    return Some((i, Hit::Continuation));
                }
                if mode == ScanMode::Makefile {
                    // `\`, blanks, then a continuation: the backslash is
                    // kept but the line still continues.
                    let mut j = i + 1;
                    while data[j..].starts_with(' ') || data[j..].starts_with('\t') {
                        j += 1;
                    }
                    if j > i + 1 && data[j..].starts_with("\\\n") {
                        return Some((i, Hit::SpacedContinuation { end: j + 2 }));
                    }
                }
                let end = match rest[1..].chars().next() {
                    Some(c) => i + 1 + c.len_utf8(),
                    None => i + 1,
                };
                return Some((i, Hit::Escaped { end }));
            }
        }

        i += 1;
    }
    None
}

/// One scan step: append literal text to `out` until a caller token or the
/// end of the virtual line. Continuations pull new physical lines into `d`.
pub fn scan(
    d: &mut Data,
    offset: usize,
    tokens: &TokenList,
    mode: ScanMode,
    out: &mut String,
) -> Chunk {
    let mut offset = offset;
    loop {
        let Some((start, hit)) = find_hit(d, offset, tokens, mode) else {
            out.push_str(&d.data[offset..]);
            return Chunk {
                token: None,
                token_offset: d.len(),
                after: d.len(),
            };
        };

        match hit {
            Hit::Caller(tok) => {
                let token = tok.to_string();
                out.push_str(&d.data[offset..start]);
                return Chunk {
                    after: start + token.len(),
                    token_offset: start,
                    token: Some(token),
                };
            }
            Hit::Newline => {
                out.push_str(&d.data[offset..start]);
                return Chunk {
                    token: None,
                    token_offset: start,
                    after: start + 1,
                };
            }
            Hit::CommentStart => {
                out.push_str(&d.data[offset..start]);
                consume_comment(d, start + 1);
                return Chunk {
                    token: None,
                    token_offset: start,
                    after: d.len(),
                };
            }
            Hit::EscapedBackslashComment => {
                // One backslash survives, then the comment runs to the end
                // of the logical line.
                out.push_str(&d.data[offset..start + 1]);
                consume_comment(d, start + 3);
                return Chunk {
                    token: None,
                    token_offset: start,
                    after: d.len(),
                };
            }
            Hit::EscapedHash => {
                out.push_str(&d.data[offset..start]);
                out.push('#');
                offset = start + 2;
            }
            Hit::Continuation => match mode {
                ScanMode::Command => {
                    // The backslash and newline are part of the command.
                    out.push_str(&d.data[offset..start + 2]);
                    d.read_line();
                    offset = start + 2;
                    if d.data[offset..].starts_with('\t') {
                        offset += 1;
                    }
                }
                _ => {
                    out.push_str(d.data[offset..start].trim_end());
                    out.push(' ');
                    d.read_line();
                    offset = d.skip_whitespace(start + 2);
                }
            },
            Hit::SpacedContinuation { end } => {
                out.push_str(&d.data[offset..start]);
                out.push_str("\\ ");
                d.read_line();
                offset = d.skip_whitespace(end);
            }
            Hit::Escaped { end } => {
                out.push_str(&d.data[offset..end]);
                offset = end;
            }
        }
    }
}

/// Consume the rest of the logical line as a comment. Continuations inside
/// comments still pull physical lines.
fn consume_comment(d: &mut Data, offset: usize) {
    let mut sink = String::new();
    scan(d, offset, &empty_tokens(), ScanMode::Makefile, &mut sink);
}

/// Collect everything remaining in the buffer as literal text.
pub fn flatten(d: &mut Data, offset: usize, mode: ScanMode) -> String {
    let mut out = String::new();
    scan(d, offset, &empty_tokens(), mode, &mut out);
    out
}

/// Read a `define` body: lines up to the matching `endef`, honoring nested
/// `define`/`endef` pairs and makefile-style continuations. The buffer is
/// expected to hold the first body line.
pub fn read_define_body(d: &mut Data, offset: usize) -> Result<String, MakeError> {
    fn check_for_token(d: &Data, o: usize) -> i32 {
        if o >= d.len() || d.data[o..].starts_with('\t') {
            return 0;
        }
        let o = d.skip_whitespace(o);
        match d.find_token(o, &define_tokens(), true).0.as_deref() {
            Some("define") => 1,
            Some("endef") => -1,
            _ => 0,
        }
    }

    let start = offset;
    let mut count = 1 + check_for_token(d, offset);
    if count == 0 {
        return Ok(String::new());
    }

    let mut out = String::new();
    let mut offset = offset;
    while offset < d.len() {
        let empty_tokens = empty_tokens();
        let Some((hit_start, hit)) = find_hit(d, offset, &empty_tokens, ScanMode::Command) else {
            out.push_str(&d.data[offset..]);
            break;
        };

        match hit {
            Hit::Continuation => {
                out.push_str(d.data[offset..hit_start].trim_end());
                out.push(' ');
                d.read_line();
                offset = d.skip_whitespace(hit_start + 2);
            }
            Hit::Newline => {
                let end = hit_start + 1;
                d.read_line();
                count += check_for_token(d, end);
                if count == 0 {
                    out.push_str(&d.data[offset..hit_start]);
                    return Ok(out);
                }
                out.push_str(&d.data[offset..end]);
                offset = end;
            }
            Hit::Escaped { end } => {
                out.push_str(&d.data[offset..end]);
                offset = end;
            }
            _ => unreachable!("no caller tokens or comments in define bodies"),
        }
    }

    Err(MakeError::syntax("Unterminated define", d.getloc(start)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Location;
    use crate::parser::data::iter_lines;

    fn data_loc() -> Location {
        Location::new("test.mk", 0, 0)
    }

    fn scan_all(text: &str, mode: ScanMode) -> String {
        let mut d = Data::from_string(text, data_loc());
        flatten_mode(&mut d, mode)
    }

    fn flatten_mode(d: &mut Data, mode: ScanMode) -> String {
        flatten(d, 0, mode)
    }

    #[test]
    fn test_longest_token_wins() {
        let tl = TokenList::new(&[":", "::", ":="]);
        assert_eq!(tl.match_at("::foo", 0), Some("::"));
        assert_eq!(tl.match_at(":=foo", 0), Some(":="));
        assert_eq!(tl.match_at(":foo", 0), Some(":"));
        assert_eq!(tl.match_at("foo", 0), None);
    }

    #[test]
    fn test_makefile_comment_is_dropped() {
        assert_eq!(scan_all("hello # comment\n", ScanMode::Makefile), "hello ");
        assert_eq!(scan_all("\\# literal\n", ScanMode::Makefile), "# literal");
    }

    #[test]
    fn test_makefile_continuation_collapses() {
        let mut lines = iter_lines(std::io::Cursor::new("a \\\n   b\n"));
        let path: std::rc::Rc<str> = "test.mk".into();
        let mut d = Data::new(&path, &mut lines);
        d.read_line();
        assert_eq!(flatten_mode(&mut d, ScanMode::Makefile), "a b");
    }

    #[test]
    fn test_command_continuation_stays_literal() {
        let mut lines = iter_lines(std::io::Cursor::new("a \\\n\tb\n"));
        let path: std::rc::Rc<str> = "test.mk".into();
        let mut d = Data::new(&path, &mut lines);
        d.read_line();
        // The backslash-newline is part of the command; the recipe tab on
        // the continuation line is stripped.
        assert_eq!(flatten_mode(&mut d, ScanMode::Command), "a \\\nb");
    }

    #[test]
    fn test_plain_mode_has_no_escapes() {
        assert_eq!(scan_all("a \\# b\n", ScanMode::Plain), "a \\# b\n");
    }

    #[test]
    fn test_define_body_nested() {
        let text = "line1\ndefine INNER\nx\nendef\nline2\nendef\nrest\n";
        let mut lines = iter_lines(std::io::Cursor::new(text));
        let path: std::rc::Rc<str> = "test.mk".into();
        let mut d = Data::new(&path, &mut lines);
        d.read_line();
        let body = read_define_body(&mut d, 0).unwrap();
        assert_eq!(body, "line1\ndefine INNER\nx\nendef\nline2");
    }

    #[test]
    fn test_define_body_unterminated() {
        let mut lines = iter_lines(std::io::Cursor::new("line1\nline2\n"));
        let path: std::rc::Rc<str> = "test.mk".into();
        let mut d = Data::new(&path, &mut lines);
        d.read_line();
        assert!(read_define_body(&mut d, 0).is_err());
    }
}
