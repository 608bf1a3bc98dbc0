//! Relational store shared by all jobs
//!
//! [`Store`] is implemented for PostgreSQL ([`PgStore`], the production
//! target) and SQLite ([`SqliteStore`], local runs and tests). Both create
//! their tables idempotently and rely on unique natural keys for upserts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::extractors::CvssMetrics;
use crate::feeds::{BduVulnerability, Threat};

pub mod postgres;
pub mod sqlite;

pub use postgres::PgStore;
pub use sqlite::{SqliteStore, SqliteStoreConfig};

/// Every table this crate writes, parents first
pub const TABLES: [&str; 7] = [
    "vulnerability",
    "software",
    "os",
    "cve_identifier",
    "cve_nvd",
    "cve_opencve",
    "ubi",
];

/// Separator used to store the NVD reference list in one column
pub const HYPERLINK_SEPARATOR: &str = "; ";

/// Table groups created by the individual jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    /// `vulnerability`, `software`, `os`, `cve_identifier`
    Bdu,
    /// `ubi`
    Threats,
    /// `cve_nvd` plus its parents
    Nvd,
    /// `cve_opencve` plus its parents
    OpenCve,
}

/// A stored vulnerability, as needed by the scraping jobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VulnerabilityRef {
    pub id: i32,
    pub identifier: String,
}

/// One `vulnerability` row with every stored column
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VulnerabilityRecord {
    pub id: i32,
    pub identifier: String,
    pub name: String,
    pub description: String,
    pub identify_date: String,
    pub severity: String,
    pub solution: String,
    pub vul_status: String,
    pub exploit_status: String,
    pub fix_status: String,
    pub sources: String,
    pub other: String,
    pub vul_incident: String,
    pub vul_class: String,
    pub cwe: String,
    pub cvss_vector: String,
    pub cvss_score: String,
    pub cvss3_vector: String,
    pub cvss3_score: String,
}

/// Column list matching the field order of [`VulnerabilityRecord`]
pub(crate) const VULNERABILITY_COLUMNS: &str = "id, identifier, name, description, identify_date, \
    severity, solution, vul_status, exploit_status, fix_status, sources, other, vul_incident, \
    vul_class, cwe, cvss_vector, cvss_score, cvss3_vector, cvss3_score";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NvdRecord {
    /// Natural key
    pub cve_link: String,
    pub description: String,
    pub hyperlinks: Vec<String>,
    pub vulnerability_id: i32,
    pub fetched_at: DateTime<Utc>,
}

impl NvdRecord {
    pub fn joined_hyperlinks(&self) -> String {
        self.hyperlinks.join(HYPERLINK_SEPARATOR)
    }
}

pub(crate) fn split_hyperlinks(joined: &str) -> Vec<String> {
    if joined.is_empty() {
        return Vec::new();
    }
    joined
        .split(HYPERLINK_SEPARATOR)
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenCveRecord {
    /// Natural key
    pub vulnerability_id: i32,
    pub metrics: CvssMetrics,
    pub fetched_at: DateTime<Utc>,
}

/// Row count of one table; `rows` is `None` when the table does not exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableCount {
    pub table: &'static str,
    pub rows: Option<i64>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Backend name for log lines
    fn backend(&self) -> &'static str;

    async fn ensure_schema(&self, schema: Schema) -> anyhow::Result<()>;

    /// All vulnerabilities, newest identifier first
    async fn vulnerabilities(&self) -> anyhow::Result<Vec<VulnerabilityRef>>;

    /// CVE identifiers recorded for one vulnerability, in insertion order
    async fn cve_links(&self, vulnerability_id: i32) -> anyhow::Result<Vec<String>>;

    /// Look up one vulnerability by its BDU identifier
    async fn vulnerability(&self, identifier: &str) -> anyhow::Result<Option<VulnerabilityRecord>>;

    /// Insert a vulnerability with its software, OS and CVE rows in one
    /// transaction. Returns `None` when the identifier is already stored.
    async fn insert_vulnerability(&self, vulnerability: &BduVulnerability)
    -> anyhow::Result<Option<i32>>;

    /// Returns false when an identical row already exists
    async fn insert_threat(&self, threat: &Threat) -> anyhow::Result<bool>;

    async fn nvd_exists(&self, cve_link: &str) -> anyhow::Result<bool>;

    async fn upsert_nvd(&self, record: &NvdRecord) -> anyhow::Result<()>;

    async fn nvd_record(&self, cve_link: &str) -> anyhow::Result<Option<NvdRecord>>;

    async fn opencve_exists(&self, vulnerability_id: i32) -> anyhow::Result<bool>;

    async fn upsert_opencve(&self, record: &OpenCveRecord) -> anyhow::Result<()>;

    async fn opencve_record(&self, vulnerability_id: i32) -> anyhow::Result<Option<OpenCveRecord>>;

    async fn count_rows(&self, table: &'static str) -> anyhow::Result<Option<i64>>;
}

/// Row counts for every table in [`TABLES`]
pub async fn table_counts(store: &dyn Store) -> anyhow::Result<Vec<TableCount>> {
    let mut counts = Vec::with_capacity(TABLES.len());
    for table in TABLES {
        counts.push(TableCount {
            table,
            rows: store.count_rows(table).await?,
        });
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hyperlinks_round_trip_through_column() {
        let record = NvdRecord {
            cve_link: "https://nvd.nist.gov/vuln/detail/CVE-2024-0001".into(),
            description: String::new(),
            hyperlinks: vec!["https://a.example".into(), String::new(), "https://b.example".into()],
            vulnerability_id: 1,
            fetched_at: Utc::now(),
        };
        let joined = record.joined_hyperlinks();
        assert_eq!(joined, "https://a.example; ; https://b.example");
        assert_eq!(split_hyperlinks(&joined), record.hyperlinks);
    }

    #[test]
    fn test_empty_hyperlink_column() {
        assert!(split_hyperlinks("").is_empty());
    }
}
