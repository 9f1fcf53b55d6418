// Quick-window identifier codec.
//
// String form: `qt-<context>-<counter>-<suffix>`, e.g. `qt-5-7-ab`.
// The context fragment is the creator's context id, fixed at creation time.
// Context 0 is reserved for degraded (unattributed) creation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier prefix for quick windows.
pub const WINDOW_ID_PREFIX: &str = "qt";

/// Context fragment used when a window is created without an acquired
/// context id.
pub const UNATTRIBUTED_CONTEXT: u32 = 0;

/// Length of the random suffix in the string form.
pub const SUFFIX_LEN: usize = 2;

/// A parsed quick-window identifier.
///
/// Serializes as its string form so shared-store records and port messages
/// carry plain strings on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId {
    context_id: u32,
    counter: u64,
    suffix: String,
}

impl WindowId {
    pub fn new(context_id: u32, counter: u64, suffix: String) -> Self {
        Self { context_id, counter, suffix }
    }

    /// The creator-context fragment embedded at creation time.
    ///
    /// This reflects only the original creator; adoption can move ownership
    /// elsewhere without rewriting the identifier.
    pub fn creator_context(&self) -> u32 {
        self.context_id
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Whether the identifier was allocated without an acquired context id.
    pub fn is_unattributed(&self) -> bool {
        self.context_id == UNATTRIBUTED_CONTEXT
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{WINDOW_ID_PREFIX}-{}-{}-{}", self.context_id, self.counter, self.suffix)
    }
}

impl FromStr for WindowId {
    type Err = WindowIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut parts = value.splitn(4, '-');
        let prefix = parts.next().unwrap_or_default();
        if prefix != WINDOW_ID_PREFIX {
            return Err(WindowIdError::BadPrefix { found: prefix.to_string() });
        }

        let context_part =
            parts.next().ok_or_else(|| WindowIdError::Malformed(value.to_string()))?;
        let counter_part =
            parts.next().ok_or_else(|| WindowIdError::Malformed(value.to_string()))?;
        let suffix = parts.next().ok_or_else(|| WindowIdError::Malformed(value.to_string()))?;

        let context_id = context_part
            .parse::<u32>()
            .map_err(|_| WindowIdError::BadContextFragment(context_part.to_string()))?;
        let counter = counter_part
            .parse::<u64>()
            .map_err(|_| WindowIdError::BadCounter(counter_part.to_string()))?;

        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(WindowIdError::BadSuffix(suffix.to_string()));
        }

        Ok(Self { context_id, counter, suffix: suffix.to_string() })
    }
}

impl Serialize for WindowId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WindowId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowIdError {
    #[error("window id must start with `{WINDOW_ID_PREFIX}-`, got `{found}`")]
    BadPrefix { found: String },
    #[error("malformed window id `{0}`")]
    Malformed(String),
    #[error("invalid context fragment `{0}`")]
    BadContextFragment(String),
    #[error("invalid counter fragment `{0}`")]
    BadCounter(String),
    #[error("invalid suffix `{0}`: expected lowercase alphanumerics")]
    BadSuffix(String),
}
