//! OpenCVE CVSS v3 metrics scraper

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::extractors::{CvssMetrics, OpenCveExtractor};
use crate::pipeline::{
    BoundedFetcher, FetchError, PipelineOptions, RetryDelay, ScrapeJob, WorkItem,
};
use crate::store::{OpenCveRecord, Schema, Store};

pub const OPENCVE_BASE: &str = "https://www.opencve.io/cve/";

pub struct OpenCveJob {
    store: Arc<dyn Store>,
    fetcher: BoundedFetcher,
    extractor: OpenCveExtractor,
    cve_base: String,
}

impl OpenCveJob {
    pub fn new(store: Arc<dyn Store>, fetcher: BoundedFetcher) -> anyhow::Result<Self> {
        Ok(Self {
            store,
            fetcher,
            extractor: OpenCveExtractor::new()?,
            cve_base: OPENCVE_BASE.to_string(),
        })
    }

    pub fn with_cve_base(mut self, base: impl Into<String>) -> Self {
        self.cve_base = base.into();
        self
    }

    /// Pipeline settings for this job: each stored item is followed by a
    /// random pause so the portal is not hammered.
    pub fn pipeline_options(concurrency: usize) -> PipelineOptions {
        PipelineOptions {
            concurrency,
            politeness_delay: Some(RetryDelay::jitter()),
        }
    }
}

#[async_trait]
impl ScrapeJob for OpenCveJob {
    type Key = i32;
    type Output = CvssMetrics;

    fn name(&self) -> &'static str {
        "opencve"
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        self.store.ensure_schema(Schema::OpenCve).await
    }

    async fn enumerate(&self) -> anyhow::Result<Vec<WorkItem<i32>>> {
        let mut items = Vec::new();
        for vulnerability in self.store.vulnerabilities().await? {
            let links = self.store.cve_links(vulnerability.id).await?;
            let Some(first) = links.first() else {
                tracing::info!(
                    identifier = %vulnerability.identifier,
                    "no CVE identifier recorded, skipping"
                );
                continue;
            };
            items.push(WorkItem {
                key: vulnerability.id,
                target: format!("{}{}", self.cve_base, first.trim()),
                vulnerability_id: vulnerability.id,
            });
        }
        Ok(items)
    }

    async fn is_stored(&self, item: &WorkItem<i32>) -> anyhow::Result<bool> {
        self.store.opencve_exists(item.key).await
    }

    async fn fetch(&self, item: &WorkItem<i32>) -> Result<CvssMetrics, FetchError> {
        let metrics = self
            .fetcher
            .fetch_document(&item.target, &self.extractor)
            .await?;
        if metrics.is_empty() {
            tracing::warn!(url = %item.target, "no CVSS v3 metrics found on page");
        } else {
            tracing::info!(
                url = %item.target,
                attack_vector = %metrics.attack_vector,
                scope = %metrics.scope,
                "scraped OpenCVE page"
            );
        }
        Ok(metrics)
    }

    async fn persist(&self, item: &WorkItem<i32>, metrics: CvssMetrics) -> anyhow::Result<()> {
        self.store
            .upsert_opencve(&OpenCveRecord {
                vulnerability_id: item.key,
                metrics,
                fetched_at: Utc::now(),
            })
            .await
    }
}
