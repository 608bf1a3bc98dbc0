//! Threat list import (`thrlist.xlsx` into `ubi`)

use anyhow::Context;

use super::ImportSummary;
use crate::feeds::read_threats;
use crate::pipeline::BoundedFetcher;
use crate::store::{Schema, Store};

pub const THREAT_LIST_URL: &str = "https://bdu.fstec.ru/files/documents/thrlist.xlsx";

pub async fn run(store: &dyn Store, fetcher: &BoundedFetcher, url: &str) -> anyhow::Result<ImportSummary> {
    store.ensure_schema(Schema::Threats).await?;

    let workbook = fetcher
        .fetch_bytes(url)
        .await
        .context("failed to download threat list")?;
    tracing::info!(url, bytes = workbook.len(), "threat list downloaded");

    let threats = tokio::task::spawn_blocking(move || read_threats(workbook))
        .await
        .context("threat list decoding panicked")?
        .context("failed to decode threat list")?;

    let mut summary = ImportSummary::new("threats", threats.len());
    for threat in &threats {
        match store.insert_threat(threat).await {
            Ok(true) => summary.inserted += 1,
            Ok(false) => summary.skipped += 1,
            Err(err) => {
                tracing::error!(name = %threat.name, error = %format!("{err:#}"), "failed to insert threat");
                summary.failed += 1;
            }
        }
    }

    tracing::info!(
        read = summary.read,
        inserted = summary.inserted,
        skipped = summary.skipped,
        failed = summary.failed,
        "threat list imported"
    );
    Ok(summary)
}
