//! Offline token estimates. Not suitable for billing.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use switchboard_types::SwitchboardError;

/// How the word-based and character-based GPT estimates are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateMethod {
    #[default]
    Avg,
    Words,
    Chars,
    Max,
    Min,
}

impl FromStr for EstimateMethod {
    type Err = SwitchboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avg" => Ok(EstimateMethod::Avg),
            "words" => Ok(EstimateMethod::Words),
            "chars" => Ok(EstimateMethod::Chars),
            "max" => Ok(EstimateMethod::Max),
            "min" => Ok(EstimateMethod::Min),
            other => Err(SwitchboardError::Validation(format!(
                "unknown estimate method '{other}'"
            ))),
        }
    }
}

fn is_separator(c: char) -> bool {
    matches!(c, ' ' | '.' | ',' | '!' | '?' | ';')
}

/// Roughly four characters or three quarters of a word per token, plus one
/// token per run of text between spaces and punctuation.
pub fn approximate_gpt(text: &str, method: EstimateMethod) -> u64 {
    let words = text.split_whitespace().count() as f64;
    let chars = text.len() as f64;
    let segments = text.split(is_separator).filter(|s| !s.is_empty()).count() as f64;

    let by_words = words / 0.75 + segments;
    let by_chars = chars / 4.0 + segments;

    let estimate = match method {
        EstimateMethod::Avg => (by_words + by_chars) / 2.0,
        EstimateMethod::Words => by_words,
        EstimateMethod::Chars => by_chars,
        EstimateMethod::Max => by_words.max(by_chars),
        EstimateMethod::Min => by_words.min(by_chars),
    };
    estimate as u64
}

/// About 3.5 bytes per token.
pub fn approximate_anthropic(text: &str) -> u64 {
    (text.len() as f64 / 3.5) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero() {
        assert_eq!(approximate_gpt("", EstimateMethod::Avg), 0);
        assert_eq!(approximate_anthropic(""), 0);
    }

    #[test]
    fn gpt_methods() {
        // 4 words, 19 bytes, 4 segments
        let text = "Hello there, my fri";
        assert_eq!(approximate_gpt(text, EstimateMethod::Words), 9); // 5.33 + 4
        assert_eq!(approximate_gpt(text, EstimateMethod::Chars), 8); // 4.75 + 4
        assert_eq!(approximate_gpt(text, EstimateMethod::Avg), 9); // 9.04
        assert_eq!(approximate_gpt(text, EstimateMethod::Max), 9);
        assert_eq!(approximate_gpt(text, EstimateMethod::Min), 8);
    }

    #[test]
    fn anthropic_ratio() {
        assert_eq!(approximate_anthropic(&"a".repeat(35)), 10);
        assert_eq!(approximate_anthropic(&"a".repeat(36)), 10);
    }

    #[test]
    fn method_from_str() {
        assert_eq!("max".parse::<EstimateMethod>().unwrap(), EstimateMethod::Max);
        assert!("median".parse::<EstimateMethod>().is_err());
    }
}
