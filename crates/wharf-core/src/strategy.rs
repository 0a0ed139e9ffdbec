//! Strategy parser (spec.md §4.5): parses `sequential` / `parallel` /
//! `N+M+...+R` expressions into a [`DeploymentStrategy`].
//!
//! Grammar: `strategy := "sequential" | "parallel" | token ("+" token)*`,
//! `token := [1-9][0-9]* | "R" | "rest"` (case-insensitive; `R`/`rest`
//! only as the last token).

use thiserror::Error;
use wharf_types::{Batch, BatchCount, DeploymentStrategy};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StrategyParseError {
    #[error("empty strategy expression")]
    Empty,
    #[error("invalid token {token:?} at position {index}: expected a positive integer, \"R\", or \"rest\"")]
    InvalidToken { token: String, index: usize },
    #[error("\"R\"/\"rest\" may only appear as the final token")]
    RestNotLast,
    #[error("batch count must be a positive integer, got 0")]
    ZeroCount,
}

/// Parse a strategy expression (case-insensitive, whitespace-tolerant).
pub fn parse_strategy(expression: &str) -> Result<DeploymentStrategy, StrategyParseError> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err(StrategyParseError::Empty);
    }

    let normalized = trimmed.to_ascii_lowercase();

    if normalized == "sequential" {
        return Ok(DeploymentStrategy {
            batches: vec![Batch { count: BatchCount::Fixed(1) }],
            is_canary: false,
            expression: trimmed.to_string(),
        });
    }

    if normalized == "parallel" {
        return Ok(DeploymentStrategy {
            batches: vec![Batch { count: BatchCount::Rest }],
            is_canary: false,
            expression: trimmed.to_string(),
        });
    }

    let tokens: Vec<&str> = trimmed.split('+').map(str::trim).collect();
    let mut batches = Vec::with_capacity(tokens.len());

    for (index, token) in tokens.iter().enumerate() {
        let lower = token.to_ascii_lowercase();
        let is_rest = lower == "r" || lower == "rest";

        if is_rest {
            if index != tokens.len() - 1 {
                return Err(StrategyParseError::RestNotLast);
            }
            batches.push(Batch { count: BatchCount::Rest });
            continue;
        }

        let count: u32 = token.parse().map_err(|_| StrategyParseError::InvalidToken {
            token: token.to_string(),
            index,
        })?;
        if count == 0 {
            return Err(StrategyParseError::ZeroCount);
        }
        batches.push(Batch { count: BatchCount::Fixed(count) });
    }

    Ok(DeploymentStrategy {
        is_canary: batches.len() > 1,
        batches,
        expression: trimmed.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_parses_to_one_batch_of_one_non_canary() {
        let s = parse_strategy("sequential").unwrap();
        assert_eq!(s.batches, vec![Batch { count: BatchCount::Fixed(1) }]);
        assert!(!s.is_canary);
    }

    #[test]
    fn parallel_parses_to_one_batch_of_rest_non_canary() {
        let s = parse_strategy("Parallel").unwrap();
        assert_eq!(s.batches, vec![Batch { count: BatchCount::Rest }]);
        assert!(!s.is_canary);
    }

    #[test]
    fn one_plus_r_parses_to_canary_with_two_batches() {
        let s = parse_strategy("1+R").unwrap();
        assert_eq!(
            s.batches,
            vec![Batch { count: BatchCount::Fixed(1) }, Batch { count: BatchCount::Rest }]
        );
        assert!(s.is_canary);
    }

    #[test]
    fn two_plus_three_plus_rest_parses_to_three_batches() {
        let s = parse_strategy("2+3+rest").unwrap();
        assert_eq!(
            s.batches,
            vec![
                Batch { count: BatchCount::Fixed(2) },
                Batch { count: BatchCount::Fixed(3) },
                Batch { count: BatchCount::Rest },
            ]
        );
        assert!(s.is_canary);
    }

    #[test]
    fn rest_not_last_is_rejected() {
        assert_eq!(parse_strategy("1+R+2"), Err(StrategyParseError::RestNotLast));
    }

    #[test]
    fn zero_count_is_rejected() {
        assert_eq!(parse_strategy("0+1"), Err(StrategyParseError::ZeroCount));
    }

    #[test]
    fn garbage_token_is_rejected() {
        let err = parse_strategy("1+abc").unwrap_err();
        assert_eq!(
            err,
            StrategyParseError::InvalidToken { token: "abc".into(), index: 1 }
        );
    }

    #[test]
    fn case_and_whitespace_are_normalized() {
        let s = parse_strategy("  2 + R  ").unwrap();
        assert_eq!(s.expression, "2 + R");
        assert!(s.is_canary);
    }

    #[test]
    fn display_name_prefixes_canary_strategies() {
        let canary = parse_strategy("1+R").unwrap();
        assert_eq!(canary.display_name(), "canary (1+R)");
        let plain = parse_strategy("sequential").unwrap();
        assert_eq!(plain.display_name(), "sequential");
    }

    #[test]
    fn empty_expression_is_rejected() {
        assert_eq!(parse_strategy("   "), Err(StrategyParseError::Empty));
    }
}
