//! Shared identifiers and value types used by both the Sentry and IC trees.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A vocabulary id. Tokens are non-negative by construction (the wire format
/// is a decimal integer; negative values fail to parse upstream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(pub u32);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A cache-slot id carried alongside a token in a worker's `value` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub i64);

/// Opaque, globally unique worker identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        WorkerId(s)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        WorkerId(s.to_string())
    }
}

/// Opaque identifier grouping a set of workers behind one Sentry host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SentryId(pub String);

impl fmt::Display for SentryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SentryId {
    fn from(s: String) -> Self {
        SentryId(s)
    }
}

impl From<&str> for SentryId {
    fn from(s: &str) -> Self {
        SentryId(s.to_string())
    }
}

/// Kind of inference worker; drives which metrics the router reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodType {
    Prefill,
    Decode,
}

impl fmt::Display for PodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodType::Prefill => write!(f, "prefill"),
            PodType::Decode => write!(f, "decode"),
        }
    }
}
