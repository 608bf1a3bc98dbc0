//! BDU vulnerability export import (`vulxml.zip`)

use anyhow::Context;

use super::ImportSummary;
use crate::feeds::read_export;
use crate::pipeline::BoundedFetcher;
use crate::store::{Schema, Store};

pub const BDU_EXPORT_URL: &str = "https://bdu.fstec.ru/files/documents/vulxml.zip";

pub async fn run(store: &dyn Store, fetcher: &BoundedFetcher, url: &str) -> anyhow::Result<ImportSummary> {
    store.ensure_schema(Schema::Bdu).await?;

    let archive = fetcher
        .fetch_bytes(url)
        .await
        .context("failed to download vulnerability export")?;
    tracing::info!(url, bytes = archive.len(), "vulnerability export downloaded");

    let export = tokio::task::spawn_blocking(move || read_export(archive))
        .await
        .context("vulnerability export decoding panicked")?
        .context("failed to decode vulnerability export")?;

    let mut summary = ImportSummary::new("bdu", export.vul.len());
    for vulnerability in &export.vul {
        if vulnerability.identifier.trim().is_empty() {
            tracing::warn!(name = %vulnerability.name, "vulnerability without identifier, skipping");
            summary.failed += 1;
            continue;
        }
        match store.insert_vulnerability(vulnerability).await {
            Ok(Some(id)) => {
                tracing::debug!(identifier = %vulnerability.identifier, id, "vulnerability inserted");
                summary.inserted += 1;
            }
            Ok(None) => {
                tracing::debug!(identifier = %vulnerability.identifier, "vulnerability already exists");
                summary.skipped += 1;
            }
            Err(err) => {
                tracing::error!(
                    identifier = %vulnerability.identifier,
                    error = %format!("{err:#}"),
                    "failed to insert vulnerability"
                );
                summary.failed += 1;
            }
        }
    }

    tracing::info!(
        read = summary.read,
        inserted = summary.inserted,
        skipped = summary.skipped,
        failed = summary.failed,
        "vulnerability export imported"
    );
    Ok(summary)
}
