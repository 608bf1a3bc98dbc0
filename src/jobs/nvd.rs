//! NVD description and reference scraper

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::preview;
use crate::extractors::{NvdDetail, NvdDetailExtractor};
use crate::pipeline::{BoundedFetcher, FetchError, ScrapeJob, WorkItem};
use crate::store::{NvdRecord, Schema, Store};

/// Prefix for CVE identifiers that are not already URLs
pub const NVD_DETAIL_BASE: &str = "https://nvd.nist.gov/vuln/detail/";

/// Turn a stored CVE link into an absolute detail page URL
pub fn canonical_cve_link(link: &str, base: &str) -> String {
    let link = link.trim();
    if link.starts_with("http://") || link.starts_with("https://") {
        link.to_string()
    } else {
        format!("{base}{link}")
    }
}

pub struct NvdJob {
    store: Arc<dyn Store>,
    fetcher: BoundedFetcher,
    extractor: NvdDetailExtractor,
    detail_base: String,
}

impl NvdJob {
    pub fn new(store: Arc<dyn Store>, fetcher: BoundedFetcher) -> anyhow::Result<Self> {
        Ok(Self {
            store,
            fetcher,
            extractor: NvdDetailExtractor::new()?,
            detail_base: NVD_DETAIL_BASE.to_string(),
        })
    }

    pub fn with_detail_base(mut self, base: impl Into<String>) -> Self {
        self.detail_base = base.into();
        self
    }
}

#[async_trait]
impl ScrapeJob for NvdJob {
    type Key = String;
    type Output = NvdDetail;

    fn name(&self) -> &'static str {
        "nvd"
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        self.store.ensure_schema(Schema::Nvd).await
    }

    /// One item per distinct CVE. Several BDU entries may share a CVE; the
    /// newest identifier owns the row.
    async fn enumerate(&self) -> anyhow::Result<Vec<WorkItem<String>>> {
        let mut items = Vec::new();
        let mut seen = HashSet::new();
        for vulnerability in self.store.vulnerabilities().await? {
            for link in self.store.cve_links(vulnerability.id).await? {
                let key = canonical_cve_link(&link, &self.detail_base);
                if !seen.insert(key.clone()) {
                    tracing::debug!(
                        key = %key,
                        identifier = %vulnerability.identifier,
                        "CVE already queued for a newer vulnerability"
                    );
                    continue;
                }
                items.push(WorkItem {
                    target: key.clone(),
                    key,
                    vulnerability_id: vulnerability.id,
                });
            }
        }
        Ok(items)
    }

    async fn is_stored(&self, item: &WorkItem<String>) -> anyhow::Result<bool> {
        self.store.nvd_exists(&item.key).await
    }

    async fn fetch(&self, item: &WorkItem<String>) -> Result<NvdDetail, FetchError> {
        let detail = self
            .fetcher
            .fetch_document(&item.target, &self.extractor)
            .await?;

        if detail.description.is_empty() {
            tracing::warn!(url = %item.target, "no description found on page");
        } else {
            tracing::info!(
                url = %item.target,
                description = %preview(&detail.description, 100),
                hyperlinks = detail.hyperlinks.len(),
                "scraped NVD page"
            );
        }
        Ok(detail)
    }

    async fn persist(&self, item: &WorkItem<String>, detail: NvdDetail) -> anyhow::Result<()> {
        self.store
            .upsert_nvd(&NvdRecord {
                cve_link: item.key.clone(),
                description: detail.description,
                hyperlinks: detail.hyperlinks,
                vulnerability_id: item.vulnerability_id,
                fetched_at: Utc::now(),
            })
            .await
    }
}
