//! Document extractors for scraped HTML sources
//!
//! Each remote source gets one small adapter implementing
//! [`DocumentExtractor`]. The adapter owns the knowledge of the page markup;
//! when a site changes its layout only the adapter needs touching.
//!
//! Extraction is schema-on-read: a selector that no longer matches yields an
//! empty field rather than an error. Only a document that cannot be a page at
//! all (an empty body) is rejected, which makes the fetcher retry it.

use scraper::{ElementRef, Selector};
use thiserror::Error;

pub mod nvd;
pub mod opencve;

pub use nvd::{NvdDetail, NvdDetailExtractor};
pub use opencve::{CvssMetrics, OpenCveExtractor};

/// Errors raised while turning a response body into a record
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("response body is empty")]
    EmptyDocument,

    #[error("invalid CSS selector {selector:?}: {message}")]
    Selector {
        selector: &'static str,
        message: String,
    },
}

/// Turns one fetched document into a typed record
pub trait DocumentExtractor: Send + Sync {
    type Output: Send;

    fn extract(&self, body: &str) -> Result<Self::Output, ExtractError>;
}

pub(crate) fn compile(selector: &'static str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|err| ExtractError::Selector {
        selector,
        message: format!("{err:?}"),
    })
}

pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

pub(crate) fn ensure_not_empty(body: &str) -> Result<(), ExtractError> {
    if body.trim().is_empty() {
        return Err(ExtractError::EmptyDocument);
    }
    Ok(())
}
