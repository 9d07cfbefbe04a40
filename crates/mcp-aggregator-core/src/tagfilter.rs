//! Boolean expression language over tag names, used by `tag-filter` query
//! parameters and by scope-to-tag translation.
//!
//! Grammar:
//! ```text
//! expr := or
//! or   := and (("," | "||" | "or") and)*
//! and  := not (("+" | "&&" | "and") not)*
//! not  := ("!" | "not") atom | atom
//! atom := IDENT | "(" expr ")"
//! ```
//! Precedence: `not` binds tighter than `and`, which binds tighter than `or`.

use std::collections::HashSet;
use std::fmt;

use crate::errors::RouterError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagFilter {
    Tag(String),
    Not(Box<TagFilter>),
    And(Box<TagFilter>, Box<TagFilter>),
    Or(Box<TagFilter>, Box<TagFilter>),
    /// The empty filter admits everything; used when no `tag-filter` was given.
    Always,
}

impl TagFilter {
    pub fn evaluate(&self, tags: &HashSet<String>) -> bool {
        match self {
            TagFilter::Always => true,
            TagFilter::Tag(t) => tags.contains(t),
            TagFilter::Not(inner) => !inner.evaluate(tags),
            TagFilter::And(a, b) => a.evaluate(tags) && b.evaluate(tags),
            TagFilter::Or(a, b) => a.evaluate(tags) || b.evaluate(tags),
        }
    }

    pub fn parse(input: &str) -> Result<Self, RouterError> {
        let mut p = Parser::new(input);
        let expr = p.parse_or()?;
        p.skip_ws();
        if !p.at_end() {
            return Err(RouterError::FilterParse(format!(
                "unexpected trailing input at offset {}",
                p.pos
            )));
        }
        Ok(expr)
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagFilter::Always => write!(f, "*"),
            TagFilter::Tag(t) => write!(f, "{t}"),
            TagFilter::Not(inner) => write!(f, "!{inner}"),
            TagFilter::And(a, b) => write!(f, "({a}+{b})"),
            TagFilter::Or(a, b) => write!(f, "({a},{b})"),
        }
    }
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            src: input.as_bytes(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn skip_ws(&mut self) {
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn starts_with(&self, lit: &str) -> bool {
        self.src[self.pos..].starts_with(lit.as_bytes())
    }

    fn parse_or(&mut self) -> Result<TagFilter, RouterError> {
        let mut node = self.parse_and()?;
        loop {
            self.skip_ws();
            if self.peek() == Some(b',') {
                self.pos += 1;
            } else if self.starts_with("||") {
                self.pos += 2;
            } else if self.starts_with_word("or") {
                self.pos += 2;
            } else {
                break;
            }
            let rhs = self.parse_and()?;
            node = TagFilter::Or(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<TagFilter, RouterError> {
        let mut node = self.parse_not()?;
        loop {
            self.skip_ws();
            if self.peek() == Some(b'+') {
                self.pos += 1;
            } else if self.starts_with("&&") {
                self.pos += 2;
            } else if self.starts_with_word("and") {
                self.pos += 3;
            } else {
                break;
            }
            let rhs = self.parse_not()?;
            node = TagFilter::And(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn parse_not(&mut self) -> Result<TagFilter, RouterError> {
        self.skip_ws();
        if self.peek() == Some(b'!') {
            self.pos += 1;
            let inner = self.parse_atom()?;
            return Ok(TagFilter::Not(Box::new(inner)));
        }
        if self.starts_with_word("not") {
            self.pos += 3;
            let inner = self.parse_atom()?;
            return Ok(TagFilter::Not(Box::new(inner)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<TagFilter, RouterError> {
        self.skip_ws();
        if self.peek() == Some(b'(') {
            self.pos += 1;
            let inner = self.parse_or()?;
            self.skip_ws();
            if self.peek() != Some(b')') {
                return Err(RouterError::FilterParse(format!(
                    "expected ')' at offset {}",
                    self.pos
                )));
            }
            self.pos += 1;
            return Ok(inner);
        }
        let start = self.pos;
        while self.pos < self.src.len() && is_ident_byte(self.src[self.pos]) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(RouterError::FilterParse(format!(
                "expected identifier at offset {}",
                self.pos
            )));
        }
        let ident = std::str::from_utf8(&self.src[start..self.pos])
            .unwrap()
            .to_string();
        Ok(TagFilter::Tag(ident))
    }

    /// Matches a keyword operator only when not immediately followed by an
    /// identifier byte, so `order` is not parsed as `or` + `der`.
    fn starts_with_word(&self, word: &str) -> bool {
        if !self.starts_with(word) {
            return false;
        }
        match self.src.get(self.pos + word.len()) {
            Some(&b) => !is_ident_byte(b),
            None => true,
        }
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.' || b == b':'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn and_binds_tighter_than_or() {
        // web,prod+db -> web OR (prod AND db)
        let f = TagFilter::parse("web,prod+db").unwrap();
        assert!(f.evaluate(&tags(&["web"])));
        assert!(!f.evaluate(&tags(&["prod"])));
        assert!(f.evaluate(&tags(&["prod", "db"])));
    }

    #[test]
    fn not_binds_tighter_than_and() {
        let f = TagFilter::parse("!web+prod").unwrap();
        assert!(f.evaluate(&tags(&["prod"])));
        assert!(!f.evaluate(&tags(&["web", "prod"])));
    }

    #[test]
    fn parens_override_precedence() {
        let f = TagFilter::parse("web+(prod,db)").unwrap();
        assert!(f.evaluate(&tags(&["web", "db"])));
        assert!(!f.evaluate(&tags(&["web"])));
    }

    #[test]
    fn word_operators_and_symbols_are_equivalent() {
        let sym = TagFilter::parse("a+b").unwrap();
        let word = TagFilter::parse("a and b").unwrap();
        let s = tags(&["a", "b"]);
        assert_eq!(sym.evaluate(&s), word.evaluate(&s));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        assert!(TagFilter::parse("a)").is_err());
        assert!(TagFilter::parse("a b").is_err());
    }

    #[test]
    fn pure_function_same_input_same_output() {
        let f = TagFilter::parse("web+prod,!db").unwrap();
        let t = tags(&["web", "prod"]);
        assert_eq!(f.evaluate(&t), f.evaluate(&t));
    }
}
