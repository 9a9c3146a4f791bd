//! Condition language for cohort selection
//!
//! One condition per line, `<attribute><operator><value>`, for example:
//!
//! ```text
//! age >= 50
//! sex != M
//! smoker = true
//! ```
//!
//! Spaces are ignored. Operators are `==`, `!=`, `>`, `>=`, `<`, `<=`; a
//! bare `=` means `==`. Values are booleans (`true`/`false` in any case),
//! numbers when they contain any non-letter character, strings otherwise.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{Error, Record, Result};

/// Comparison applied between a record attribute and a bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BoundType {
    Equals = 0,
    NotEquals = 1,
    GreaterThan = 2,
    AtLeast = 3,
    LessThan = 4,
    AtMost = 5,
}

const OPERATORS: [(&str, BoundType); 6] = [
    ("==", BoundType::Equals),
    ("!=", BoundType::NotEquals),
    (">", BoundType::GreaterThan),
    (">=", BoundType::AtLeast),
    ("<", BoundType::LessThan),
    ("<=", BoundType::AtMost),
];

impl BoundType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn operator(self) -> &'static str {
        OPERATORS[self as usize].0
    }

    pub fn from_operator(text: &str) -> Option<Self> {
        OPERATORS
            .iter()
            .find(|(op, _)| *op == text)
            .map(|(_, bound_type)| *bound_type)
    }
}

impl TryFrom<u64> for BoundType {
    type Error = Error;

    fn try_from(code: u64) -> Result<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|index| OPERATORS.get(index))
            .map(|(_, bound_type)| *bound_type)
            .ok_or_else(|| Error::validation(format!("Unknown bound type code {}.", code)))
    }
}

impl fmt::Display for BoundType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operator())
    }
}

/// Right-hand side of a condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bound {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Bound {
    /// Order `value` relative to this bound. `None` when the types do not compare.
    fn compare(&self, value: &Value) -> Option<Ordering> {
        match (self, value) {
            (Bound::Bool(bound), Value::Bool(actual)) => Some(actual.cmp(bound)),
            (Bound::Text(bound), Value::String(actual)) => Some(actual.as_str().cmp(bound)),
            (Bound::Int(bound), Value::Number(actual)) => match actual.as_i64() {
                Some(actual) => Some(actual.cmp(bound)),
                None => actual.as_f64()?.partial_cmp(&(*bound as f64)),
            },
            (Bound::Float(bound), Value::Number(actual)) => actual.as_f64()?.partial_cmp(bound),
            _ => None,
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::Bool(v) => write!(f, "{}", v),
            Bound::Int(v) => write!(f, "{}", v),
            Bound::Float(v) => write!(f, "{}", v),
            Bound::Text(v) => f.write_str(v),
        }
    }
}

/// A `(BoundType, value)` pair
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub bound_type: BoundType,
    pub value: Bound,
}

impl Condition {
    pub fn new(bound_type: BoundType, value: Bound) -> Self {
        Self { bound_type, value }
    }

    /// Wire form `[code, value]`
    pub fn to_struct(&self) -> Value {
        json!([self.bound_type.code(), self.value])
    }

    pub fn from_struct(value: &Value) -> Result<Self> {
        let invalid = || Error::validation(format!("Invalid condition struct {}.", value));
        let pair = value.as_array().filter(|a| a.len() == 2).ok_or_else(invalid)?;
        let code = pair[0].as_u64().ok_or_else(invalid)?;
        let bound_type = BoundType::try_from(code)?;
        let bound = serde_json::from_value(pair[1].clone()).map_err(|_| invalid())?;
        Ok(Self::new(bound_type, bound))
    }
}

/// Named conditions, all of which must hold
pub type Conditions = BTreeMap<String, Condition>;

pub fn conditions_to_struct(conditions: &Conditions) -> Value {
    Value::Object(
        conditions
            .iter()
            .map(|(name, condition)| (name.clone(), condition.to_struct()))
            .collect(),
    )
}

pub fn conditions_from_struct(value: &Value) -> Result<Conditions> {
    let object = value
        .as_object()
        .ok_or_else(|| Error::validation("Condition struct must be an object."))?;
    object
        .iter()
        .map(|(name, condition)| Ok((name.clone(), Condition::from_struct(condition)?)))
        .collect()
}

/// Whether `value` satisfies `condition`. Absent values and values of an
/// incomparable type never satisfy an ordering.
pub fn check(condition: &Condition, value: Option<&Value>) -> bool {
    let value = match value {
        None | Some(Value::Null) => return false,
        Some(value) => value,
    };
    let ordering = condition.value.compare(value);
    match condition.bound_type {
        BoundType::Equals => ordering == Some(Ordering::Equal),
        BoundType::NotEquals => ordering != Some(Ordering::Equal),
        BoundType::GreaterThan => ordering == Some(Ordering::Greater),
        BoundType::AtLeast => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        BoundType::LessThan => ordering == Some(Ordering::Less),
        BoundType::AtMost => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
    }
}

/// Whether `record` satisfies every condition
pub fn satisfies(record: &Record, conditions: &Conditions) -> bool {
    conditions
        .iter()
        .all(|(name, condition)| check(condition, record.get(name)))
}

/// Ids whose record satisfies every condition; all ids when `conditions` is `None`
pub fn filter_ids(records: &BTreeMap<String, Record>, conditions: Option<&Conditions>) -> Vec<String> {
    records
        .iter()
        .filter(|(_, record)| conditions.map_or(true, |c| satisfies(record, c)))
        .map(|(id, _)| id.clone())
        .collect()
}

/// Interpret the value part of a condition line
pub fn parse_value(text: &str) -> Result<Bound> {
    if text.eq_ignore_ascii_case("true") {
        return Ok(Bound::Bool(true));
    }
    if text.eq_ignore_ascii_case("false") {
        return Ok(Bound::Bool(false));
    }
    if text.chars().any(|c| !c.is_ascii_alphabetic()) {
        let invalid = || Error::validation(format!("Invalid value {}. (parsed as number)", text));
        return if text.contains('.') {
            text.parse().map(Bound::Float).map_err(|_| invalid())
        } else {
            text.parse().map(Bound::Int).map_err(|_| invalid())
        };
    }
    Ok(Bound::Text(text.to_string()))
}

#[derive(PartialEq)]
enum LineState {
    Attribute,
    Operator,
    Value,
}

fn parse_line(line: &str) -> Result<(String, Condition)> {
    let mut attribute = String::new();
    let mut operator = String::new();
    let mut value = String::new();
    let mut state = LineState::Attribute;

    for c in line.chars().filter(|c| *c != ' ') {
        match state {
            LineState::Attribute if c.is_ascii_alphabetic() => attribute.push(c),
            LineState::Attribute => {
                state = LineState::Operator;
                operator.push(c);
            }
            LineState::Operator if "<>=!".contains(c) => operator.push(c),
            LineState::Operator => {
                state = LineState::Value;
                value.push(c);
            }
            LineState::Value => value.push(c),
        }
    }

    if operator == "=" {
        operator.push('=');
    }
    if operator.is_empty() {
        return Err(Error::validation("No bound operator found."));
    }
    let bound_type = BoundType::from_operator(&operator)
        .ok_or_else(|| Error::validation(format!("Invalid bound type `{}`.", operator)))?;
    if state == LineState::Operator {
        return Err(Error::validation(format!(
            "Expected value after bound operator `{}`.",
            operator
        )));
    }
    if attribute.is_empty() {
        return Err(Error::validation("Missing attribute name."));
    }
    Ok((attribute, Condition::new(bound_type, parse_value(&value)?)))
}

/// Parse user condition text, one condition per non-empty line.
///
/// A later line for the same attribute replaces the earlier one.
pub fn parse_conditions(text: &str) -> Result<Conditions> {
    text.lines()
        .filter(|line| !line.is_empty())
        .map(parse_line)
        .collect()
}
