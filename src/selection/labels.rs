//! Label selectors.
//!
//! Grammar (requirements are comma separated and ANDed):
//!
//! - `key=value`, `key==value`, `key!=value`
//! - `key in (a,b)`, `key notin (a,b)`
//! - `key` (exists), `!key` (does not exist)

use super::{SelectorError, SelectorResult};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

pub type Labels = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A single label requirement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

impl Requirement {
    pub fn new(
        key: impl Into<String>,
        operator: Operator,
        values: impl IntoIterator<Item = String>,
    ) -> SelectorResult<Self> {
        let key = key.into();
        validate_key(&key)?;
        let values: BTreeSet<String> = values.into_iter().collect();
        match operator {
            Operator::Equals | Operator::NotEquals if values.len() != 1 => {
                return Err(SelectorError::InvalidRequirement(format!(
                    "{key}: exactly one value required for equality"
                )))
            }
            Operator::In | Operator::NotIn if values.is_empty() => {
                return Err(SelectorError::InvalidRequirement(format!(
                    "{key}: set-based operator needs at least one value"
                )))
            }
            Operator::Exists | Operator::DoesNotExist if !values.is_empty() => {
                return Err(SelectorError::InvalidRequirement(format!(
                    "{key}: existence operator takes no values"
                )))
            }
            _ => {}
        }
        Ok(Self {
            key,
            operator,
            values,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        match self.operator {
            Operator::Equals | Operator::In => labels
                .get(&self.key)
                .map_or(false, |v| self.values.contains(v)),
            Operator::NotEquals | Operator::NotIn => labels
                .get(&self.key)
                .map_or(true, |v| !self.values.contains(v)),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = || self.values.iter().cloned().collect::<Vec<_>>().join(",");
        match self.operator {
            Operator::Equals => write!(f, "{}={}", self.key, joined()),
            Operator::NotEquals => write!(f, "{}!={}", self.key, joined()),
            Operator::In => write!(f, "{} in ({})", self.key, joined()),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, joined()),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// A conjunction of label requirements. The empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    /// Builds an equality-only selector from a label set.
    pub fn from_labels(labels: &Labels) -> Self {
        let requirements = labels
            .iter()
            .map(|(k, v)| Requirement {
                key: k.clone(),
                operator: Operator::Equals,
                values: BTreeSet::from([v.clone()]),
            })
            .collect();
        Self { requirements }
    }

    pub fn parse(input: &str) -> SelectorResult<Self> {
        Parser::new(input).parse()
    }

    pub fn add(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// Returns the value `label` must have, if the selector pins it to exactly one.
    pub fn requires_exact_match(&self, label: &str) -> Option<&str> {
        self.requirements
            .iter()
            .filter(|r| r.key == label)
            .find_map(|r| match r.operator {
                Operator::Equals | Operator::In if r.values.len() == 1 => {
                    r.values.iter().next().map(String::as_str)
                }
                _ => None,
            })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Selector::parse(s)
    }
}

fn validate_key(key: &str) -> SelectorResult<()> {
    if key.is_empty() {
        return Err(SelectorError::InvalidRequirement("empty label key".into()));
    }
    if !key.chars().all(is_identifier_char) {
        return Err(SelectorError::InvalidRequirement(format!(
            "invalid label key {key:?}"
        )));
    }
    Ok(())
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Identifier(String),
    In,
    NotIn,
    Eq,
    DoubleEq,
    NotEq,
    Not,
    Comma,
    LeftParen,
    RightParen,
    Eof,
}

fn tokenize(input: &str) -> SelectorResult<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        match c {
            ' ' | '\t' => pos += 1,
            ',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            '(' => {
                tokens.push(Token::LeftParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RightParen);
                pos += 1;
            }
            '=' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::DoubleEq);
                    pos += 2;
                } else {
                    tokens.push(Token::Eq);
                    pos += 1;
                }
            }
            '!' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    pos += 2;
                } else {
                    tokens.push(Token::Not);
                    pos += 1;
                }
            }
            c if is_identifier_char(c) => {
                let start = pos;
                while pos < chars.len() && is_identifier_char(chars[pos]) {
                    pos += 1;
                }
                let word: String = chars[start..pos].iter().collect();
                tokens.push(match word.as_str() {
                    "in" => Token::In,
                    "notin" => Token::NotIn,
                    _ => Token::Identifier(word),
                });
            }
            other => {
                return Err(SelectorError::Parse {
                    position: pos,
                    message: format!("unexpected character {other:?}"),
                })
            }
        }
    }
    tokens.push(Token::Eof);
    Ok(tokens)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            tokens: Vec::new(),
            pos: 0,
        }
    }

    fn parse(mut self) -> SelectorResult<Selector> {
        if self.input.trim().is_empty() {
            return Ok(Selector::everything());
        }
        self.tokens = tokenize(self.input)?;

        let mut requirements = Vec::new();
        loop {
            requirements.push(self.requirement()?);
            match self.next() {
                Token::Comma => continue,
                Token::Eof => break,
                other => return Err(self.unexpected(&other, "',' or end of selector")),
            }
        }
        Ok(Selector { requirements })
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if token != Token::Eof {
            self.pos += 1;
        }
        token
    }

    fn unexpected(&self, token: &Token, expected: &str) -> SelectorError {
        SelectorError::Parse {
            position: self.pos,
            message: format!("found {token:?}, expected {expected}"),
        }
    }

    fn requirement(&mut self) -> SelectorResult<Requirement> {
        if *self.peek() == Token::Not {
            self.next();
            let key = self.identifier()?;
            return Requirement::new(key, Operator::DoesNotExist, Vec::new());
        }

        let key = self.identifier()?;
        match self.peek().clone() {
            Token::Comma | Token::Eof => Requirement::new(key, Operator::Exists, Vec::new()),
            Token::Eq | Token::DoubleEq => {
                self.next();
                let value = self.optional_value();
                Requirement::new(key, Operator::Equals, vec![value])
            }
            Token::NotEq => {
                self.next();
                let value = self.optional_value();
                Requirement::new(key, Operator::NotEquals, vec![value])
            }
            Token::In => {
                self.next();
                let values = self.value_set()?;
                Requirement::new(key, Operator::In, values)
            }
            Token::NotIn => {
                self.next();
                let values = self.value_set()?;
                Requirement::new(key, Operator::NotIn, values)
            }
            other => Err(self.unexpected(&other, "an operator")),
        }
    }

    fn identifier(&mut self) -> SelectorResult<String> {
        match self.next() {
            Token::Identifier(id) => Ok(id),
            // "in"/"notin" are valid label keys when not in operator position.
            Token::In => Ok("in".to_string()),
            Token::NotIn => Ok("notin".to_string()),
            other => Err(self.unexpected(&other, "a label key")),
        }
    }

    // A value may be empty, e.g. `tier=`.
    fn optional_value(&mut self) -> String {
        match self.peek().clone() {
            Token::Identifier(value) => {
                self.next();
                value
            }
            _ => String::new(),
        }
    }

    fn value_set(&mut self) -> SelectorResult<Vec<String>> {
        match self.next() {
            Token::LeftParen => {}
            other => return Err(self.unexpected(&other, "'('")),
        }
        let mut values = Vec::new();
        loop {
            match self.next() {
                Token::Identifier(value) => values.push(value),
                Token::RightParen if values.is_empty() => {
                    return Err(SelectorError::InvalidRequirement(
                        "empty value set".to_string(),
                    ))
                }
                other => return Err(self.unexpected(&other, "a value")),
            }
            match self.next() {
                Token::Comma => continue,
                Token::RightParen => break,
                other => return Err(self.unexpected(&other, "',' or ')'")),
            }
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_equality() {
        let sel = Selector::parse("app=web, tier==frontend").unwrap();
        assert_eq!(sel.requirements().len(), 2);
        assert!(sel.matches(&labels(&[("app", "web"), ("tier", "frontend")])));
        assert!(!sel.matches(&labels(&[("app", "web")])));
    }

    #[test]
    fn test_not_equals_matches_absent_key() {
        let sel = Selector::parse("app!=web").unwrap();
        assert!(sel.matches(&labels(&[])));
        assert!(sel.matches(&labels(&[("app", "db")])));
        assert!(!sel.matches(&labels(&[("app", "web")])));
    }

    #[test]
    fn test_set_operators() {
        let sel = Selector::parse("env in (prod, staging),team notin (ops)").unwrap();
        assert!(sel.matches(&labels(&[("env", "prod")])));
        assert!(!sel.matches(&labels(&[("env", "dev")])));
        assert!(!sel.matches(&labels(&[("env", "prod"), ("team", "ops")])));
    }

    #[test]
    fn test_existence() {
        let sel = Selector::parse("app,!legacy").unwrap();
        assert!(sel.matches(&labels(&[("app", "x")])));
        assert!(!sel.matches(&labels(&[("app", "x"), ("legacy", "1")])));
        assert!(!sel.matches(&labels(&[])));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let sel = Selector::parse("  ").unwrap();
        assert!(sel.is_empty());
        assert!(sel.matches(&labels(&[("a", "b")])));
    }

    #[test]
    fn test_requires_exact_match() {
        let sel = Selector::parse("app=web,env in (prod),tier in (a,b)").unwrap();
        assert_eq!(sel.requires_exact_match("app"), Some("web"));
        assert_eq!(sel.requires_exact_match("env"), Some("prod"));
        assert_eq!(sel.requires_exact_match("tier"), None);
        assert_eq!(sel.requires_exact_match("missing"), None);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Selector::parse("app=web,").is_err());
        assert!(Selector::parse("env in prod").is_err());
        assert!(Selector::parse("env in ()").is_err());
        assert!(Selector::parse("a=b=c").is_err());
        assert!(Selector::parse("a$b").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let sel = Selector::parse("app=web,env notin (a,b),!x").unwrap();
        assert_eq!(sel.to_string(), "app=web,env notin (a,b),!x");
        assert_eq!(Selector::parse(&sel.to_string()).unwrap(), sel);
    }
}
