//! Field selectors: comma separated `field=value`, `field==value` and `field!=value` terms.

use super::{SelectorError, SelectorResult};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type Fields = BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Term {
    Equals(String, String),
    NotEquals(String, String),
}

impl Term {
    fn field(&self) -> &str {
        match self {
            Term::Equals(f, _) | Term::NotEquals(f, _) => f,
        }
    }

    // Missing fields compare as the empty string.
    fn matches(&self, fields: &Fields) -> bool {
        let actual = |f: &str| fields.get(f).map(String::as_str).unwrap_or("");
        match self {
            Term::Equals(f, v) => actual(f) == v,
            Term::NotEquals(f, v) => actual(f) != v,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    terms: Vec<Term>,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn one_term_equal(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            terms: vec![Term::Equals(field.into(), value.into())],
        }
    }

    pub fn parse(input: &str) -> SelectorResult<Self> {
        let mut terms = Vec::new();
        if input.trim().is_empty() {
            return Ok(Self { terms });
        }
        for (i, raw) in input.split(',').enumerate() {
            let raw = raw.trim();
            let term = if let Some((f, v)) = raw.split_once("!=") {
                Term::NotEquals(field_name(f, i)?, v.trim().to_string())
            } else if let Some((f, v)) = raw.split_once("==") {
                Term::Equals(field_name(f, i)?, v.trim().to_string())
            } else if let Some((f, v)) = raw.split_once('=') {
                Term::Equals(field_name(f, i)?, v.trim().to_string())
            } else {
                return Err(SelectorError::Parse {
                    position: i,
                    message: format!("invalid field selector term {raw:?}"),
                });
            };
            terms.push(term);
        }
        Ok(Self { terms })
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        self.terms.iter().all(|t| t.matches(fields))
    }

    /// Returns the value `field` must equal, if the selector pins it.
    pub fn requires_exact_match(&self, field: &str) -> Option<&str> {
        self.terms.iter().find_map(|t| match t {
            Term::Equals(f, v) if f == field => Some(v.as_str()),
            _ => None,
        })
    }

    /// Fields referenced by any term.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(Term::field)
    }
}

fn field_name(raw: &str, position: usize) -> SelectorResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(SelectorError::Parse {
            position,
            message: "empty field name".to_string(),
        });
    }
    Ok(name.to_string())
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .terms
            .iter()
            .map(|t| match t {
                Term::Equals(k, v) => format!("{k}={v}"),
                Term::NotEquals(k, v) => format!("{k}!={v}"),
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Selector::parse(s)
    }
}
