//! The data model for values: a lazy concatenation of literal runs and
//! function/variable-reference nodes, evaluated late against a variable
//! scope.
//!
//! Everything the parser reads — variable values, rule headers, recipe
//! lines — becomes an `Expansion`. Recursive variables store raw text and
//! are re-parsed into an `Expansion` on each access, so evaluation always
//! happens against the scopes in effect at reference time.

use crate::error::MakeError;
use crate::functions::{self, FunctionNode};
use crate::location::Location;
use crate::makefile::Makefile;
use crate::vars::VarScope;

/// One element of an expansion: a literal run or a function node.
#[derive(Clone, Debug)]
pub enum Element {
    Literal(String),
    Func(FunctionNode),
}

/// An ordered sequence of literal runs and function nodes. Adjacent
/// literal runs are folded on append.
#[derive(Clone, Debug, Default)]
pub struct Expansion {
    pub elements: Vec<Element>,
    pub loc: Option<Location>,
}

impl Expansion {
    pub fn new(loc: Option<Location>) -> Self {
        Self {
            elements: Vec::new(),
            loc,
        }
    }

    pub fn from_literal(s: impl Into<String>) -> Self {
        let mut e = Self::new(None);
        e.append_str(&s.into());
        e
    }

    /// Append a literal run, folding it into a trailing literal if any.
    pub fn append_str(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        if let Some(Element::Literal(last)) = self.elements.last_mut() {
            last.push_str(s);
        } else {
            self.elements.push(Element::Literal(s.to_string()));
        }
    }

    pub fn append_func(&mut self, f: FunctionNode) {
        self.elements.push(Element::Func(f));
    }

    /// Append all elements of another expansion.
    pub fn concat(&mut self, other: Expansion) {
        for el in other.elements {
            match el {
                Element::Literal(s) => self.append_str(&s),
                Element::Func(f) => self.append_func(f),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Strip leading whitespace from the first literal run.
    pub fn lstrip(&mut self) {
        if let Some(Element::Literal(first)) = self.elements.first_mut() {
            *first = first.trim_start().to_string();
            if first.is_empty() {
                self.elements.remove(0);
            }
        }
    }

    /// Strip trailing whitespace from the last literal run.
    pub fn rstrip(&mut self) {
        if let Some(Element::Literal(last)) = self.elements.last_mut() {
            *last = last.trim_end().to_string();
            if last.is_empty() {
                self.elements.pop();
            }
        }
    }

    /// Drop a single trailing newline, as `define` bodies require.
    pub fn trim_last_newline(&mut self) {
        if let Some(Element::Literal(last)) = self.elements.last_mut() {
            if last.ends_with('\n') {
                last.pop();
                if last.is_empty() {
                    self.elements.pop();
                }
            }
        }
    }

    /// Evaluate to a single string. `setting` accumulates the names of
    /// variables currently being expanded so recursive self-reference is
    /// detected and reported.
    pub fn resolve(
        &self,
        makefile: &Makefile,
        scope: &VarScope,
        setting: &mut Vec<String>,
    ) -> Result<String, MakeError> {
        let mut out = String::new();
        for el in &self.elements {
            match el {
                Element::Literal(s) => out.push_str(s),
                Element::Func(f) => out.push_str(&functions::resolve_node(
                    f, makefile, scope, setting,
                )?),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_folding() {
        let mut e = Expansion::new(None);
        e.append_str("foo");
        e.append_str("bar");
        assert_eq!(e.elements.len(), 1);
        match &e.elements[0] {
            Element::Literal(s) => assert_eq!(s, "foobar"),
            _ => panic!("expected a literal"),
        }
    }

    #[test]
    fn test_strip_and_trim() {
        let mut e = Expansion::from_literal("  value  ");
        e.lstrip();
        e.rstrip();
        let mut out = Expansion::from_literal("line1\nline2\n");
        out.trim_last_newline();
        match (&e.elements[0], &out.elements[0]) {
            (Element::Literal(a), Element::Literal(b)) => {
                assert_eq!(a, "value");
                assert_eq!(b, "line1\nline2");
            }
            _ => panic!("expected literals"),
        }
    }

    #[test]
    fn test_strip_to_empty_removes_element() {
        let mut e = Expansion::from_literal("   ");
        e.lstrip();
        assert!(e.is_empty());
    }
}
