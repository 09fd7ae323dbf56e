use thiserror::Error;

#[derive(Debug, Error)]
pub enum PdfError {
    #[error("missing %PDF- header or %%EOF marker")]
    MalformedHeader,

    #[error("parse error at byte {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("no trailer dictionary reachable")]
    TrailerMissing,

    #[error("obj or R keyword at byte {offset} is not preceded by two integers")]
    InvalidIndirect { offset: usize },

    #[error("stream starting at byte {offset} is not terminated by endstream")]
    StreamTruncated { offset: usize },

    #[error("inflate failed: {0}")]
    Inflate(String),

    #[error("deflate failed: {0}")]
    Deflate(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("object {0} emitted twice in one serialization pass")]
    DoubleEmit(u32),

    #[error("minified content stream does not re-parse identically")]
    RoundTrip,
}

pub type Result<T> = std::result::Result<T, PdfError>;

impl PdfError {
    pub(crate) fn parse(offset: usize, message: impl Into<String>) -> Self {
        PdfError::Parse {
            offset,
            message: message.into(),
        }
    }
}
