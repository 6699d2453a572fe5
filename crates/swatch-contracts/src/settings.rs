use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::InvalidInput;
use crate::sources::SourceId;

pub const MIN_COLORS: usize = 3;
pub const MAX_COLORS: usize = 8;
pub const DEFAULT_COLORS: usize = 5;

pub const MIN_PALETTES: usize = 1;
pub const MAX_PALETTES: usize = 7;
pub const DEFAULT_PALETTES: usize = 3;

/// One pipeline submission: what to search for, where, and how many
/// colors/palettes to produce. Immutable once handed to the engine.
///
/// `upload` switches the run to upload mode: the search stage is bypassed,
/// the palette count is forced to 1, and `prompt`/`sources` are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    pub prompt: String,
    pub sources: Vec<SourceId>,
    pub num_colors: usize,
    pub num_palettes: usize,
    pub upload: Option<PathBuf>,
}

impl RunSettings {
    pub fn search(prompt: impl Into<String>, sources: Vec<SourceId>) -> Self {
        Self {
            prompt: prompt.into(),
            sources,
            num_colors: DEFAULT_COLORS,
            num_palettes: DEFAULT_PALETTES,
            upload: None,
        }
    }

    pub fn upload(path: impl Into<PathBuf>) -> Self {
        Self {
            prompt: String::new(),
            sources: Vec::new(),
            num_colors: DEFAULT_COLORS,
            num_palettes: 1,
            upload: Some(path.into()),
        }
    }

    pub fn is_upload(&self) -> bool {
        self.upload.is_some()
    }

    /// Total images the run will reduce to palettes. Upload mode always
    /// produces at most one palette regardless of `num_palettes`.
    pub fn requested_count(&self) -> usize {
        if self.is_upload() {
            1
        } else {
            self.num_palettes
        }
    }

    pub fn validate(&self) -> Result<(), InvalidInput> {
        if !(MIN_COLORS..=MAX_COLORS).contains(&self.num_colors) {
            return Err(InvalidInput::ColorCountOutOfRange {
                value: self.num_colors,
                min: MIN_COLORS,
                max: MAX_COLORS,
            });
        }
        if self.is_upload() {
            return Ok(());
        }

        if self.prompt.trim().is_empty() {
            return Err(InvalidInput::EmptyPrompt);
        }
        if self.sources.is_empty() {
            return Err(InvalidInput::NoSources);
        }
        if !(MIN_PALETTES..=MAX_PALETTES).contains(&self.num_palettes) {
            return Err(InvalidInput::PaletteCountOutOfRange {
                value: self.num_palettes,
                min: MIN_PALETTES,
                max: MAX_PALETTES,
            });
        }
        if self.num_palettes < self.sources.len() {
            return Err(InvalidInput::CountBelowSources {
                requested: self.num_palettes,
                sources: self.sources.len(),
            });
        }
        Ok(())
    }
}

/// API keys for the search sources, injected at composition time rather
/// than read inside the adapters. A missing key is not a validation
/// failure; the keyless source fails its fetch and is absorbed like any
/// other source error.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub unsplash_access_key: Option<String>,
    pub pexels_api_key: Option<String>,
    pub pixabay_api_key: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self {
            unsplash_access_key: non_empty_env(SourceId::Unsplash.key_env()),
            pexels_api_key: non_empty_env(SourceId::Pexels.key_env()),
            pixabay_api_key: non_empty_env(SourceId::Pixabay.key_env()),
        }
    }

    pub fn key_for(&self, source: SourceId) -> Option<&str> {
        match source {
            SourceId::Unsplash => self.unsplash_access_key.as_deref(),
            SourceId::Pexels => self.pexels_api_key.as_deref(),
            SourceId::Pixabay => self.pixabay_api_key.as_deref(),
        }
    }

    pub fn is_configured(&self, source: SourceId) -> bool {
        self.key_for(source).is_some()
    }
}

/// Environment lookup that treats unset and blank the same way.
pub fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
