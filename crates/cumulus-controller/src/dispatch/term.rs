//! Client term parsing: `v0 op1 v1 op2 v2 ... opN vN`.

use cumulus_common::{GridError, Operator, Result};

/// A parsed term, evaluated strictly left to right
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    pub first: i64,
    pub steps: Vec<(Operator, i64)>,
}

impl Term {
    /// Operator symbols in the order they appear, including unknown ones
    pub fn symbols(text: &str) -> Vec<char> {
        text.split_whitespace()
            .skip(1)
            .step_by(2)
            .filter_map(|token| token.chars().next())
            .collect()
    }

    pub fn parse(text: &str) -> Result<Self> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.is_empty() || tokens.len() % 2 == 0 {
            return Err(invalid(text));
        }

        let first = number(tokens[0], text)?;
        let mut steps = Vec::with_capacity(tokens.len() / 2);
        for pair in tokens[1..].chunks(2) {
            let mut symbols = pair[0].chars();
            let op = match (symbols.next(), symbols.next()) {
                (Some(symbol), None) => Operator::try_from(symbol)?,
                _ => return Err(invalid(text)),
            };
            steps.push((op, number(pair[1], text)?));
        }

        Ok(Self { first, steps })
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

fn number(token: &str, text: &str) -> Result<i64> {
    token.parse::<i64>().map_err(|_| invalid(text))
}

fn invalid(text: &str) -> GridError {
    GridError::Protocol(format!("invalid term '{}'", text.trim()))
}
