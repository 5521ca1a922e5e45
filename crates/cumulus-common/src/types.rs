//! Core types shared across Cumulus components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{GridError, Result};

/// Arithmetic operator a node can evaluate.
///
/// Only `+`, `-`, `*` and `/` exist; any other symbol is rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "char", into = "char")]
pub struct Operator(char);

impl Operator {
    pub const ADD: Operator = Operator('+');
    pub const SUB: Operator = Operator('-');
    pub const MUL: Operator = Operator('*');
    pub const DIV: Operator = Operator('/');

    /// Parse a single operator symbol
    pub fn parse(symbol: char) -> Option<Self> {
        match symbol {
            '+' | '-' | '*' | '/' => Some(Self(symbol)),
            _ => None,
        }
    }

    pub fn symbol(&self) -> char {
        self.0
    }

    /// Evaluate `lhs <op> rhs`.
    ///
    /// Division rounds half up, matching what clients have always seen.
    pub fn apply(&self, lhs: i64, rhs: i64) -> Result<i64> {
        let value = match self.0 {
            '+' => lhs.checked_add(rhs),
            '-' => lhs.checked_sub(rhs),
            '*' => lhs.checked_mul(rhs),
            '/' => {
                if rhs == 0 {
                    return Err(GridError::Computation("division by 0".to_string()));
                }
                div_round_half_up(lhs, rhs)
            }
            _ => None,
        };
        value.ok_or_else(|| GridError::Computation("arithmetic overflow".to_string()))
    }
}

/// `floor(lhs / rhs + 1/2)` computed exactly; `None` if it does not fit an `i64`
fn div_round_half_up(lhs: i64, rhs: i64) -> Option<i64> {
    let (mut n, mut d) = (i128::from(lhs), i128::from(rhs));
    if d < 0 {
        n = -n;
        d = -d;
    }
    i64::try_from((2 * n + d).div_euclid(2 * d)).ok()
}

impl TryFrom<char> for Operator {
    type Error = GridError;

    fn try_from(symbol: char) -> Result<Self> {
        Self::parse(symbol).ok_or(GridError::UnsupportedOperator(symbol))
    }
}

impl From<Operator> for char {
    fn from(op: Operator) -> Self {
        op.0
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered set of operators, rendered as a compact token like `+-*`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorSet(BTreeSet<Operator>);

impl OperatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an operator token, silently skipping unknown symbols
    pub fn from_token(token: &str) -> Self {
        Self(token.chars().filter_map(Operator::parse).collect())
    }

    pub fn contains(&self, op: Operator) -> bool {
        self.0.contains(&op)
    }

    pub fn insert(&mut self, op: Operator) {
        self.0.insert(op);
    }

    /// Union in place; the set never shrinks
    pub fn merge(&mut self, other: &OperatorSet) {
        self.0.extend(other.0.iter().copied());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Operator> + '_ {
        self.0.iter().copied()
    }

    pub fn to_token(&self) -> String {
        self.0.iter().map(|op| op.symbol()).collect()
    }
}

impl FromIterator<Operator> for OperatorSet {
    fn from_iter<I: IntoIterator<Item = Operator>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for OperatorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_token())
    }
}

/// Presence of a node or client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Offline,
}

impl Default for Status {
    fn default() -> Self {
        Self::Offline
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// One computation performed by a node, as kept in its log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationRecord {
    /// When the node finished the computation
    pub timestamp: DateTime<Utc>,

    /// Name of the node that computed it
    pub node_name: String,

    /// The term as received, e.g. `3 + 4`
    pub term: String,

    /// Result text or error text
    pub result: String,
}

impl ComputationRecord {
    pub fn new(node_name: &str, term: &str, result: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            node_name: node_name.to_string(),
            term: term.to_string(),
            result: result.to_string(),
        }
    }
}

impl fmt::Display for ComputationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]: {} = {}",
            self.timestamp.format("%Y%m%d_%H%M%S%.3f"),
            self.node_name.to_lowercase(),
            self.term,
            self.result
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_parse() {
        assert_eq!(Operator::parse('+'), Some(Operator::ADD));
        assert_eq!(Operator::parse('%'), None);
        assert!(matches!(
            Operator::try_from('^'),
            Err(GridError::UnsupportedOperator('^'))
        ));
    }

    #[test]
    fn test_operator_apply() {
        assert_eq!(Operator::ADD.apply(3, 4).unwrap(), 7);
        assert_eq!(Operator::SUB.apply(7, 9).unwrap(), -2);
        assert_eq!(Operator::MUL.apply(-3, 4).unwrap(), -12);
        assert_eq!(Operator::DIV.apply(7, 2).unwrap(), 4);
        assert_eq!(Operator::DIV.apply(6, 4).unwrap(), 2);
        assert_eq!(Operator::DIV.apply(-7, 2).unwrap(), -3);
        assert!(matches!(
            Operator::DIV.apply(1, 0),
            Err(GridError::Computation(_))
        ));
        assert!(Operator::ADD.apply(i64::MAX, 1).is_err());
    }

    #[test]
    fn test_division_is_exact_for_large_operands() {
        let past_f64 = (1i64 << 53) + 1;
        assert_eq!(Operator::DIV.apply(past_f64, 1).unwrap(), past_f64);
        assert_eq!(Operator::DIV.apply(i64::MAX, 2).unwrap(), 1i64 << 62);
        assert_eq!(Operator::DIV.apply(i64::MIN, -2).unwrap(), 1i64 << 62);
        assert_eq!(Operator::DIV.apply(7, -2).unwrap(), -3);
        assert_eq!(Operator::DIV.apply(-7, -2).unwrap(), 4);
        assert!(matches!(
            Operator::DIV.apply(i64::MIN, -1),
            Err(GridError::Computation(_))
        ));
    }

    #[test]
    fn test_operator_set_merge_only_grows() {
        let mut set = OperatorSet::from_token("+-");
        set.merge(&OperatorSet::from_token("*"));
        set.merge(&OperatorSet::from_token(""));
        assert_eq!(set.len(), 3);
        assert!(set.contains(Operator::MUL));
        assert!(set.contains(Operator::ADD));
    }

    #[test]
    fn test_operator_set_skips_unknown() {
        let set = OperatorSet::from_token("+x/");
        assert_eq!(set.to_token(), "+/");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Online.to_string(), "online");
        assert_eq!(Status::default(), Status::Offline);
    }
}
