use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::InvalidInput;

/// The three stock-photo search services a run can draw images from.
///
/// Variant order is the canonical presentation order; a run's own source
/// order (as selected by the caller) is what drives quota allocation and
/// result merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    Unsplash,
    Pexels,
    Pixabay,
}

impl SourceId {
    pub const ALL: [SourceId; 3] = [SourceId::Unsplash, SourceId::Pexels, SourceId::Pixabay];

    pub fn name(&self) -> &'static str {
        match self {
            SourceId::Unsplash => "unsplash",
            SourceId::Pexels => "pexels",
            SourceId::Pixabay => "pixabay",
        }
    }

    /// Smallest `per_page` the service accepts. Pixabay rejects requests
    /// below 3; the adapter pads the wire request and truncates the result
    /// back to the logical quota.
    pub fn min_request_size(&self) -> usize {
        match self {
            SourceId::Pixabay => 3,
            _ => 1,
        }
    }

    /// Environment variable the composition root reads the API key from.
    pub fn key_env(&self) -> &'static str {
        match self {
            SourceId::Unsplash => "UNSPLASH_ACCESS_KEY",
            SourceId::Pexels => "PEXELS_API_KEY",
            SourceId::Pixabay => "PIXABAY_API_KEY",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SourceId {
    type Err = InvalidInput;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "unsplash" => Ok(SourceId::Unsplash),
            "pexels" => Ok(SourceId::Pexels),
            "pixabay" => Ok(SourceId::Pixabay),
            other => Err(InvalidInput::UnknownSource {
                name: other.to_string(),
            }),
        }
    }
}
