//! Parser for lme4-style model formulas.
//!
//! Formula text is parsed exactly once into typed components; nothing
//! downstream passes raw formula strings around. Supported syntax:
//!
//! - response and fixed terms: `y ~ a + b`, interactions `a:b`, crossing
//!   `a * b` (expands to `a + b + a:b`), intercept control `0 +`, `- 1`,
//!   term removal `- a`
//! - random blocks: `(1 | g)`, `(1 + time | g)`, nesting `(1 | g1/g2)`
//!
//! Parenthesized fixed expressions, function calls and uncorrelated random
//! blocks (`||`) are rejected.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// A fixed-effect term: one variable, or an interaction of several.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Term {
    factors: Vec<String>,
}

impl Term {
    pub fn new(factors: Vec<String>) -> Self {
        let mut out: Vec<String> = Vec::with_capacity(factors.len());
        for factor in factors {
            if !out.contains(&factor) {
                out.push(factor);
            }
        }
        Self { factors: out }
    }

    pub fn single(name: impl Into<String>) -> Self {
        Self {
            factors: vec![name.into()],
        }
    }

    pub fn factors(&self) -> &[String] {
        &self.factors
    }

    pub fn order(&self) -> usize {
        self.factors.len()
    }

    /// Two terms are the same if they interact the same variables, in any order.
    pub fn same_as(&self, other: &Term) -> bool {
        self.factors.len() == other.factors.len()
            && self.factors.iter().all(|f| other.factors.contains(f))
    }

    fn union(&self, other: &Term) -> Term {
        let mut factors = self.factors.clone();
        factors.extend(other.factors.iter().cloned());
        Term::new(factors)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.factors.join(":"))
    }
}

/// Population-level part of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedEffects {
    pub intercept: bool,
    pub terms: Vec<Term>,
}

impl FixedEffects {
    /// Every variable referenced by a fixed term, in first-seen order.
    pub fn variables(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for term in &self.terms {
            for factor in term.factors() {
                if !out.contains(factor) {
                    out.push(factor.clone());
                }
            }
        }
        out
    }

    fn push(&mut self, term: Term) {
        if !self.terms.iter().any(|t| t.same_as(&term)) {
            self.terms.push(term);
        }
    }

    fn remove(&mut self, term: &Term) {
        self.terms.retain(|t| !t.same_as(term));
    }
}

/// Grouping factor(s) of a random block. `g1/g2` nests g2 within g1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Grouping {
    pub factors: Vec<String>,
}

impl fmt::Display for Grouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.factors.join("/"))
    }
}

/// One random-effects block: a random intercept plus optional slopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RandomTerm {
    pub slopes: Vec<String>,
    pub grouping: Grouping,
}

impl RandomTerm {
    pub fn intercept_only(&self) -> RandomTerm {
        RandomTerm {
            slopes: Vec::new(),
            grouping: self.grouping.clone(),
        }
    }
}

impl fmt::Display for RandomTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(1")?;
        for slope in &self.slopes {
            write!(f, " + {slope}")?;
        }
        write!(f, " | {})", self.grouping)
    }
}

/// Result of parsing a formula string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFormula {
    pub response: String,
    pub fixed: FixedEffects,
    pub random: Vec<RandomTerm>,
}

impl ParsedFormula {
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = tokenize(text)?;
        Parser {
            text,
            tokens,
            pos: 0,
        }
        .formula()
    }
}

/// Parses a bare random-effects structure such as `(1 | participant_id)`.
pub fn parse_random_effects(text: &str) -> Result<Vec<RandomTerm>> {
    let parsed = ParsedFormula::parse(&format!("_ ~ 0 + {text}")).map_err(|err| match err {
        ModelError::Formula { message, .. } => ModelError::formula(text, 0, message),
        other => other,
    })?;
    if !parsed.fixed.terms.is_empty() {
        return Err(ModelError::formula(
            text,
            0,
            "expected only random-effect blocks",
        ));
    }
    if parsed.random.is_empty() {
        return Err(ModelError::formula(text, 0, "no random-effect block found"));
    }
    Ok(parsed.random)
}

/// Renders a formula in canonical lme4 syntax.
pub fn render_formula(response: &str, fixed: &FixedEffects, random: &[RandomTerm]) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !fixed.intercept {
        parts.push("0".to_string());
    }
    parts.extend(fixed.terms.iter().map(ToString::to_string));
    parts.extend(random.iter().map(ToString::to_string));
    if parts.is_empty() {
        parts.push("1".to_string());
    }
    format!("{response} ~ {}", parts.join(" + "))
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Number(String),
    Tilde,
    Plus,
    Minus,
    Star,
    Colon,
    Pipe,
    DoublePipe,
    Slash,
    LParen,
    RParen,
}

fn tokenize(text: &str) -> Result<Vec<(usize, Tok)>> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        let start = i;
        let tok = match ch {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '~' => Tok::Tilde,
            '+' => Tok::Plus,
            '-' => Tok::Minus,
            '*' => Tok::Star,
            ':' => Tok::Colon,
            '/' => Tok::Slash,
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    i += 1;
                    Tok::DoublePipe
                } else {
                    Tok::Pipe
                }
            }
            c if c.is_ascii_digit() => {
                while i + 1 < chars.len() && chars[i + 1].is_ascii_digit() {
                    i += 1;
                }
                Tok::Number(chars[start..=i].iter().collect())
            }
            c if c.is_alphabetic() || c == '_' || c == '.' => {
                while i + 1 < chars.len()
                    && (chars[i + 1].is_alphanumeric() || chars[i + 1] == '_' || chars[i + 1] == '.')
                {
                    i += 1;
                }
                let name: String = chars[start..=i].iter().collect();
                let leading_dot_digit =
                    name.starts_with('.') && name[1..].starts_with(|c: char| c.is_ascii_digit());
                if name.chars().all(|c| c == '.') || leading_dot_digit {
                    return Err(ModelError::formula(
                        text,
                        start,
                        format!("'{name}' is not a valid variable name"),
                    ));
                }
                Tok::Ident(name)
            }
            other => {
                return Err(ModelError::formula(
                    text,
                    start,
                    format!("unexpected character '{other}'"),
                ));
            }
        };
        out.push((start, tok));
        i += 1;
    }
    Ok(out)
}

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<(usize, Tok)>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map_or(self.text.len(), |(offset, _)| *offset)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        tok
    }

    fn error(&self, message: impl Into<String>) -> ModelError {
        ModelError::formula(self.text, self.offset(), message)
    }

    fn expect(&mut self, expected: &Tok, what: &str) -> Result<()> {
        match self.peek() {
            Some(tok) if tok == expected => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.error(format!("expected {what}"))),
        }
    }

    fn ident(&mut self, what: &str) -> Result<String> {
        match self.peek() {
            Some(Tok::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error(format!("expected {what}"))),
        }
    }

    fn formula(mut self) -> Result<ParsedFormula> {
        if self.tokens.is_empty() {
            return Err(self.error("empty formula"));
        }
        let response = self.ident("response variable")?;
        self.expect(&Tok::Tilde, "'~'")?;

        let mut fixed = FixedEffects {
            intercept: true,
            terms: Vec::new(),
        };
        let mut random: Vec<RandomTerm> = Vec::new();
        let mut negate = false;

        loop {
            match self.peek() {
                Some(Tok::LParen) => {
                    if negate {
                        return Err(self.error("random blocks cannot be removed"));
                    }
                    let term = self.random_block()?;
                    if !random.contains(&term) {
                        random.push(term);
                    }
                }
                Some(Tok::Number(n)) => {
                    let value = n.clone();
                    self.pos += 1;
                    match (value.as_str(), negate) {
                        ("0", false) | ("1", true) => fixed.intercept = false,
                        ("1", false) => fixed.intercept = true,
                        _ => return Err(self.error(format!("unexpected constant {value}"))),
                    }
                }
                Some(Tok::Ident(_)) => {
                    let terms = self.product()?;
                    for term in terms {
                        if negate {
                            fixed.remove(&term);
                        } else {
                            fixed.push(term);
                        }
                    }
                }
                _ => return Err(self.error("expected a term")),
            }

            match self.next() {
                None => break,
                Some(Tok::Plus) => negate = false,
                Some(Tok::Minus) => negate = true,
                Some(_) => {
                    self.pos -= 1;
                    return Err(self.error("expected '+' or '-' between terms"));
                }
            }
        }

        if fixed.terms.iter().any(|t| t.factors().contains(&response)) {
            return Err(ModelError::formula(
                self.text,
                0,
                "response variable also appears as a predictor",
            ));
        }

        Ok(ParsedFormula {
            response,
            fixed,
            random,
        })
    }

    /// `a:b * c` style products; `:` binds tighter than `*`.
    fn product(&mut self) -> Result<Vec<Term>> {
        let mut crossed = vec![self.interaction()?];
        while self.peek() == Some(&Tok::Star) {
            self.pos += 1;
            crossed.push(self.interaction()?);
        }
        Ok(expand_crossing(&crossed))
    }

    fn interaction(&mut self) -> Result<Term> {
        let mut factors = vec![self.variable()?];
        while self.peek() == Some(&Tok::Colon) {
            self.pos += 1;
            factors.push(self.variable()?);
        }
        Ok(Term::new(factors))
    }

    fn variable(&mut self) -> Result<String> {
        let name = self.ident("variable name")?;
        if self.peek() == Some(&Tok::LParen) {
            return Err(self.error(format!("function calls are not supported ({name})")));
        }
        Ok(name)
    }

    fn random_block(&mut self) -> Result<RandomTerm> {
        self.expect(&Tok::LParen, "'('")?;
        let close = self.tokens[self.pos..]
            .iter()
            .position(|(_, t)| *t == Tok::RParen)
            .map(|offset| self.pos + offset);
        let has_pipe = close.is_some_and(|end| {
            self.tokens[self.pos..end]
                .iter()
                .any(|(_, t)| matches!(t, Tok::Pipe | Tok::DoublePipe))
        });
        if !has_pipe {
            return Err(self.error("parenthesized fixed-effect expressions are not supported"));
        }

        let mut slopes: Vec<String> = Vec::new();
        loop {
            match self.next() {
                Some(Tok::Number(n)) if n == "1" => {}
                Some(Tok::Number(n)) if n == "0" => {
                    self.pos -= 1;
                    return Err(self.error("random slopes without an intercept are not supported"));
                }
                Some(Tok::Ident(name)) => {
                    if !slopes.contains(&name) {
                        slopes.push(name);
                    }
                }
                _ => {
                    self.pos -= 1;
                    return Err(self.error("expected '1' or a slope variable"));
                }
            }
            match self.peek() {
                Some(Tok::Plus) => self.pos += 1,
                Some(Tok::Pipe) => {
                    self.pos += 1;
                    break;
                }
                Some(Tok::DoublePipe) => {
                    return Err(self.error("uncorrelated random effects (||) are not supported"));
                }
                _ => return Err(self.error("expected '+' or '|'")),
            }
        }

        let mut factors = vec![self.ident("grouping factor")?];
        while self.peek() == Some(&Tok::Slash) {
            self.pos += 1;
            factors.push(self.ident("nested grouping factor")?);
        }
        self.expect(&Tok::RParen, "')'")?;

        Ok(RandomTerm {
            slopes,
            grouping: Grouping { factors },
        })
    }
}

/// `a * b * c` expands to every non-empty combination, lower orders first.
fn expand_crossing(crossed: &[Term]) -> Vec<Term> {
    let n = crossed.len();
    let mut masks: Vec<u32> = (1..(1u32 << n)).collect();
    masks.sort_by_key(|m| (m.count_ones(), *m));
    masks
        .into_iter()
        .map(|mask| {
            crossed
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, t)| t.clone())
                .reduce(|acc, t| acc.union(&t))
                .unwrap_or_else(|| Term::new(Vec::new()))
        })
        .collect()
}
