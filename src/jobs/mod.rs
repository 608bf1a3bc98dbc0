//! The harvest jobs
//!
//! `nvd` and `opencve` are [`ScrapeJob`](crate::pipeline::ScrapeJob)s run
//! through the bounded pipeline. `bdu` and `threats` download one file,
//! decode it and import the rows sequentially.

use serde::Serialize;

pub mod bdu;
pub mod nvd;
pub mod opencve;
pub mod threats;

pub use nvd::NvdJob;
pub use opencve::OpenCveJob;

/// Result of a download-and-import job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub job: String,
    /// Records decoded from the file
    pub read: usize,
    pub inserted: usize,
    /// Records already present
    pub skipped: usize,
    pub failed: usize,
}

impl ImportSummary {
    pub(crate) fn new(job: &str, read: usize) -> Self {
        Self {
            job: job.to_string(),
            read,
            ..Self::default()
        }
    }
}

/// First characters of `text`, for log lines
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
