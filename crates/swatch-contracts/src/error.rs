use thiserror::Error;

/// Blocking validation failures. These are the only errors that stop a run
/// before it starts; everything downstream (a source erroring, a single
/// image failing to fetch or decode) is absorbed into the run as a warning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidInput {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("select at least one image source")]
    NoSources,
    #[error("{requested} palettes requested across {sources} sources; request at least one image per selected source")]
    CountBelowSources { requested: usize, sources: usize },
    #[error("requested image count must be at least 1")]
    CountBelowOne,
    #[error("color count {value} is outside the supported range {min}..={max}")]
    ColorCountOutOfRange { value: usize, min: usize, max: usize },
    #[error("palette count {value} is outside the supported range {min}..={max}")]
    PaletteCountOutOfRange { value: usize, min: usize, max: usize },
    #[error("unknown image source '{name}'")]
    UnknownSource { name: String },
}
