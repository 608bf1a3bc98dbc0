//! Decoders for the downloaded FSTEC feeds
//!
//! Both feeds are decoded fully in memory from the downloaded bytes.

use thiserror::Error;

pub mod bdu_export;
pub mod threat_list;

pub use bdu_export::{BduExport, BduVulnerability, read_export};
pub use threat_list::{Threat, read_threats};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to read ZIP archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("archive does not contain an XML document")]
    MissingXml,

    #[error("failed to parse vulnerability export: {0}")]
    Xml(#[from] quick_xml::de::DeError),

    #[error("failed to read spreadsheet: {0}")]
    Sheet(#[from] calamine::XlsxError),
}
