pub mod document;
pub mod error;
pub mod filters;
pub mod minify;
pub mod model;
pub mod parser;
pub mod tokenizer;
pub mod writer;

pub use document::{Document, ParseOptions, SaveOptions, Validation};
pub use error::{PdfError, Result};
pub use parser::parse;
pub use writer::serialize;
