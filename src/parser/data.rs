//! Virtual lines: a growable buffer that joins physical lines and carries
//! per-offset source coordinates for diagnostics.

use std::io::BufRead;
use std::rc::Rc;

use crate::location::Location;

/// Iterator over physical lines, yielding `(line_index, line)` with CRLF
/// normalized and the trailing newline preserved.
pub type LineSource = dyn Iterator<Item = (usize, String)>;

pub fn iter_lines<R: BufRead>(reader: R) -> impl Iterator<Item = (usize, String)> {
    reader
        .split(b'\n')
        .enumerate()
        .map(|(i, chunk)| {
            let mut line = String::from_utf8_lossy(&chunk.unwrap_or_default()).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            line.push('\n');
            (i, line)
        })
}

/// A single virtual "line", which can be multiple physical lines joined by
/// continuations. The buffer *pulls* more physical lines from its line
/// source when a continuation or `define` body demands more input. This
/// object is short-lived and should not escape the parser.
pub struct Data<'i> {
    pub data: String,
    /// `(offset, location)` anchors, one per appended segment.
    locs: Vec<(usize, Location)>,
    path: Rc<str>,
    lines: Option<&'i mut LineSource>,
}

impl<'i> Data<'i> {
    pub fn new(path: &Rc<str>, lines: &'i mut LineSource) -> Self {
        Self {
            data: String::new(),
            locs: Vec::new(),
            path: Rc::clone(path),
            lines: Some(lines),
        }
    }

    /// A buffer over fixed text, for command-line values and re-parsed
    /// variable text. It cannot pull continuation lines.
    pub fn from_string(text: &str, loc: Location) -> Data<'static> {
        let mut d = Data {
            data: String::new(),
            locs: Vec::new(),
            path: Rc::clone(&loc.path),
            lines: None,
        };
        d.append(text, loc);
        d
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn char_at(&self, offset: usize) -> Option<char> {
        self.data[offset..].chars().next()
    }

    /// Pull the next physical line into the buffer. Returns false at EOF.
    pub fn read_line(&mut self) -> bool {
        let Some(lines) = self.lines.as_mut() else {
            return false;
        };
        match lines.next() {
            Some((lineno, line)) => {
                let loc = Location::new(Rc::clone(&self.path), lineno, 0);
                self.append(&line, loc);
                true
            }
            None => false,
        }
    }

    pub fn append(&mut self, text: &str, loc: Location) {
        self.locs.push((self.data.len(), loc));
        self.data.push_str(text);
    }

    /// The location of an offset within the buffer, by walking anchors.
    pub fn getloc(&self, offset: usize) -> Location {
        if self.locs.is_empty() {
            return Location::new(Rc::clone(&self.path), 0, 0);
        }

        let mut offset = offset.min(self.data.len().saturating_sub(1));
        while offset > 0 && !self.data.is_char_boundary(offset) {
            offset -= 1;
        }
        let (begin, loc) = self
            .locs
            .iter()
            .rev()
            .find(|(o, _)| *o <= offset)
            .unwrap_or(&self.locs[0]);
        loc.advanced_by(&self.data[*begin..offset])
    }

    /// The offset after skipping whitespace.
    pub fn skip_whitespace(&self, mut offset: usize) -> usize {
        while let Some(c) = self.char_at(offset) {
            if !c.is_whitespace() {
                break;
            }
            offset += c.len_utf8();
        }
        offset
    }

    /// Check the buffer at `offset` for any token in `tokens`. In keyword
    /// form the token must be followed by whitespace or end-of-data, and
    /// the trailing whitespace is consumed. Returns the token (if any) and
    /// the new offset.
    pub fn find_token(
        &self,
        offset: usize,
        tokens: &super::tokens::TokenList,
        keyword: bool,
    ) -> (Option<String>, usize) {
        match tokens.match_at(&self.data, offset) {
            Some(tok) => {
                let end = offset + tok.len();
                if keyword {
                    match self.char_at(end) {
                        Some(c) if !c.is_whitespace() => (None, offset),
                        _ => (Some(tok.to_string()), self.skip_whitespace(end)),
                    }
                } else {
                    (Some(tok.to_string()), end)
                }
            }
            None => (None, offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(path: &str, line: usize, col: usize) -> Location {
        Location::new(path, line, col)
    }

    #[test]
    fn test_getloc_single_segment() {
        let d = Data::from_string("He\tllo", loc("f", 0, 0));
        for (pos, line, col) in [(0, 0, 0), (2, 0, 2), (3, 0, 4)] {
            let l = d.getloc(pos);
            assert_eq!((l.line, l.column), (line, col), "offset {pos}");
        }
    }

    #[test]
    fn test_getloc_across_segments() {
        let mut d = Data::from_string("line1 ", loc("f", 0, 4));
        d.append("l\tine2", loc("f", 1, 11));
        for (pos, line, col) in [(0, 0, 4), (5, 0, 9), (6, 1, 11), (7, 1, 12), (8, 1, 16)] {
            let l = d.getloc(pos);
            assert_eq!((l.line, l.column), (line, col), "offset {pos}");
        }
    }

    #[test]
    fn test_iter_lines_normalizes_crlf() {
        let lines: Vec<(usize, String)> =
            iter_lines(std::io::Cursor::new("a\r\nb\n")).collect();
        assert_eq!(lines, vec![(0, "a\n".to_string()), (1, "b\n".to_string())]);
    }

    proptest::proptest! {
        // Locations are monotonic in the offset.
        #[test]
        fn prop_getloc_monotonic(text in "[a-z \t]{1,30}", split in 1usize..29) {
            let split = split.min(text.len());
            let mut d = Data::from_string(&text[..split], loc("f", 0, 0));
            d.append(&text[split..], loc("f", 1, 0));

            let mut prev = (0usize, 0usize);
            for pos in 0..d.len() {
                let l = d.getloc(pos);
                let cur = (l.line, l.column);
                proptest::prop_assert!(cur >= prev, "offset {} went backwards", pos);
                prev = cur;
            }
        }
    }
}
