//! Label selector expressions.
//!
//! Parses the usual Kubernetes selector syntax (`k=v`, `k!=v`,
//! `k in (a, b)`, `k notin (a, b)`, `k`, `!k`, comma-separated) and matches
//! against label maps with apimachinery semantics: negated requirements are
//! satisfied when the key is absent, and the empty selector matches
//! everything.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ParseError(String);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Requirement {
    Equal(String, String),
    NotEqual(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Selector {
    /// Parses a selector expression. The empty (or all-whitespace) expression
    /// yields a selector that matches everything.
    pub fn parse(expression: &str) -> Result<Self, ParseError> {
        if expression.trim().is_empty() {
            return Ok(Self::default());
        }

        let requirements = split_requirements(expression)?
            .into_iter()
            .map(parse_requirement)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { requirements })
    }

    /// True when the selector has no requirements and matches every object.
    pub fn selects_everything(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl FromStr for Selector {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, requirement) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            requirement.fmt(f)?;
        }
        Ok(())
    }
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equal(key, value) => labels.get(key).is_some_and(|v| v == value),
            Requirement::NotEqual(key, value) => labels.get(key).is_none_or(|v| v != value),
            Requirement::In(key, values) => labels.get(key).is_some_and(|v| values.contains(v)),
            Requirement::NotIn(key, values) => labels.get(key).is_none_or(|v| !values.contains(v)),
            Requirement::Exists(key) => labels.contains_key(key),
            Requirement::DoesNotExist(key) => !labels.contains_key(key),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equal(key, value) => write!(f, "{key}={value}"),
            Requirement::NotEqual(key, value) => write!(f, "{key}!={value}"),
            Requirement::In(key, values) => write!(f, "{key} in ({})", values.join(",")),
            Requirement::NotIn(key, values) => write!(f, "{key} notin ({})", values.join(",")),
            Requirement::Exists(key) => f.write_str(key),
            Requirement::DoesNotExist(key) => write!(f, "!{key}"),
        }
    }
}

/// Splits on top-level commas, leaving commas inside value sets alone.
fn split_requirements(expression: &str) -> Result<Vec<&str>, ParseError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (i, c) in expression.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| ParseError("unbalanced ')'".to_string()))?;
            }
            ',' if depth == 0 => {
                parts.push(&expression[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ParseError("unbalanced '('".to_string()));
    }
    parts.push(&expression[start..]);

    for part in &parts {
        if part.trim().is_empty() {
            return Err(ParseError("empty requirement".to_string()));
        }
    }

    Ok(parts)
}

fn parse_requirement(part: &str) -> Result<Requirement, ParseError> {
    let part = part.trim();

    if let Some(key) = part.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(validate_key(key.trim())?));
    }

    if part.contains('(') {
        return parse_set_requirement(part);
    }

    if let Some((key, value)) = part.split_once("!=") {
        return Ok(Requirement::NotEqual(
            validate_key(key.trim())?,
            validate_value(value.trim())?,
        ));
    }
    if let Some((key, value)) = part.split_once("==") {
        return Ok(Requirement::Equal(
            validate_key(key.trim())?,
            validate_value(value.trim())?,
        ));
    }
    if let Some((key, value)) = part.split_once('=') {
        return Ok(Requirement::Equal(
            validate_key(key.trim())?,
            validate_value(value.trim())?,
        ));
    }

    Ok(Requirement::Exists(validate_key(part)?))
}

fn parse_set_requirement(part: &str) -> Result<Requirement, ParseError> {
    let open = part.find('(').ok_or_else(|| ParseError(format!("malformed requirement {part:?}")))?;
    let close = part
        .rfind(')')
        .filter(|close| *close == part.len() - 1)
        .ok_or_else(|| ParseError(format!("malformed value set in {part:?}")))?;

    let mut head = part[..open].split_whitespace();
    let key = head
        .next()
        .ok_or_else(|| ParseError(format!("missing key in {part:?}")))?;
    let operator = head
        .next()
        .ok_or_else(|| ParseError(format!("missing operator in {part:?}")))?;
    if head.next().is_some() {
        return Err(ParseError(format!("malformed requirement {part:?}")));
    }

    let values = part[open + 1..close]
        .split(',')
        .map(|value| validate_value(value.trim()))
        .collect::<Result<Vec<_>, _>>()?;
    if values.is_empty() || values.iter().all(String::is_empty) {
        return Err(ParseError(format!("empty value set in {part:?}")));
    }

    let key = validate_key(key)?;
    match operator {
        "in" => Ok(Requirement::In(key, values)),
        "notin" => Ok(Requirement::NotIn(key, values)),
        other => Err(ParseError(format!("unknown operator {other:?}"))),
    }
}

fn validate_key(key: &str) -> Result<String, ParseError> {
    if key.is_empty() {
        return Err(ParseError("empty label key".to_string()));
    }
    let name = key.rsplit_once('/').map_or(key, |(_, name)| name);
    if name.is_empty()
        || key.len() > 253
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err(ParseError(format!("invalid label key {key:?}")));
    }
    Ok(key.to_string())
}

fn validate_value(value: &str) -> Result<String, ParseError> {
    if value.len() > 63
        || !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ParseError(format!("invalid label value {value:?}")));
    }
    Ok(value.to_string())
}
