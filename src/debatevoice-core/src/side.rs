//! Debate sides.
//!
//! Identifies which of the two debaters is speaking.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SpeechError;

/// One of the two debate participants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Arguing in favor of the topic.
    Positive,
    /// Arguing against the topic.
    Negative,
}

impl Side {
    pub fn display_name(&self) -> &str {
        match self {
            Side::Positive => "POSITIVE",
            Side::Negative => "NEGATIVE",
        }
    }

    /// The side that speaks against this one.
    pub fn opponent(&self) -> Side {
        match self {
            Side::Positive => Side::Negative,
            Side::Negative => Side::Positive,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Positive => f.write_str("positive"),
            Side::Negative => f.write_str("negative"),
        }
    }
}

impl FromStr for Side {
    type Err = SpeechError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "positive" | "pos" | "for" => Ok(Side::Positive),
            "negative" | "neg" | "against" => Ok(Side::Negative),
            other => Err(SpeechError::ConfigError(format!("Unknown side: {}", other))),
        }
    }
}
