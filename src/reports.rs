//! Reports printed by the read-only commands
//!
//! `stats` renders row counts for every table. `show` gathers one stored
//! vulnerability together with its NVD and OpenCVE enrichment. Both come as
//! plain text or JSON.

use serde::Serialize;

use crate::jobs::nvd::canonical_cve_link;
use crate::store::{
    NvdRecord, OpenCveRecord, Schema, Store, TableCount, VulnerabilityRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ReportFormat {
    #[default]
    Summary,
    Json,
}

#[derive(Debug, Serialize)]
struct StatsReport<'a> {
    backend: &'a str,
    generated_at: String,
    tables: &'a [TableCount],
}

pub fn render_stats(
    format: ReportFormat,
    backend: &str,
    counts: &[TableCount],
) -> anyhow::Result<String> {
    match format {
        ReportFormat::Summary => Ok(generate_summary_report(backend, counts)),
        ReportFormat::Json => generate_json_report(backend, counts),
    }
}

pub fn generate_summary_report(backend: &str, counts: &[TableCount]) -> String {
    let width = counts
        .iter()
        .map(|count| count.table.len())
        .max()
        .unwrap_or(0)
        .max("Table".len());

    let mut lines = vec![
        format!("Store: {backend}"),
        format!("Date: {}", chrono::Local::now().format("%Y-%m-%d %H:%M")),
        String::new(),
        format!("{:<width$}  Rows", "Table"),
        format!("{}  {}", "-".repeat(width), "-".repeat(8)),
    ];

    let mut total = 0;
    for count in counts {
        let rows = match count.rows {
            Some(rows) => {
                total += rows;
                rows.to_string()
            }
            None => "missing".to_string(),
        };
        lines.push(format!("{:<width$}  {rows}", count.table));
    }
    lines.push(format!("{}  {}", "-".repeat(width), "-".repeat(8)));
    lines.push(format!("{:<width$}  {total}", "Total"));

    lines.join("\n")
}

pub fn generate_json_report(backend: &str, counts: &[TableCount]) -> anyhow::Result<String> {
    let report = StatsReport {
        backend,
        generated_at: chrono::Utc::now().to_rfc3339(),
        tables: counts,
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

/// A stored vulnerability with everything scraped for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VulnerabilityReport {
    pub vulnerability: VulnerabilityRecord,
    pub cves: Vec<CveReport>,
    pub opencve: Option<OpenCveRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CveReport {
    pub cve: String,
    /// `None` until the `nvd` job has stored the page
    pub nvd: Option<NvdRecord>,
}

/// Collect the report for the vulnerability with BDU `identifier`.
///
/// NVD rows are keyed by detail page URL, so bare CVE identifiers are
/// resolved against `nvd_base` the same way the `nvd` job does.
pub async fn vulnerability_report(
    store: &dyn Store,
    identifier: &str,
    nvd_base: &str,
) -> anyhow::Result<Option<VulnerabilityReport>> {
    // The enrichment tables do not exist before the first scrape
    store.ensure_schema(Schema::Nvd).await?;
    store.ensure_schema(Schema::OpenCve).await?;

    let Some(vulnerability) = store.vulnerability(identifier.trim()).await? else {
        return Ok(None);
    };

    let mut cves = Vec::new();
    for cve in store.cve_links(vulnerability.id).await? {
        let nvd = store.nvd_record(&canonical_cve_link(&cve, nvd_base)).await?;
        cves.push(CveReport { cve, nvd });
    }
    let opencve = store.opencve_record(vulnerability.id).await?;

    Ok(Some(VulnerabilityReport {
        vulnerability,
        cves,
        opencve,
    }))
}

pub fn render_vulnerability(
    format: ReportFormat,
    report: &VulnerabilityReport,
) -> anyhow::Result<String> {
    match format {
        ReportFormat::Summary => Ok(generate_vulnerability_summary(report)),
        ReportFormat::Json => Ok(serde_json::to_string_pretty(report)?),
    }
}

pub fn generate_vulnerability_summary(report: &VulnerabilityReport) -> String {
    let v = &report.vulnerability;
    let mut lines = vec![format!("{}  {}", v.identifier, v.name)];

    let fields = [
        ("Severity", &v.severity),
        ("Identified", &v.identify_date),
        ("Status", &v.vul_status),
        ("Exploit", &v.exploit_status),
        ("Fix", &v.fix_status),
        ("Solution", &v.solution),
        ("Class", &v.vul_class),
        ("CWE", &v.cwe),
        ("Incidents", &v.vul_incident),
        ("Sources", &v.sources),
        ("Other", &v.other),
    ];
    for (label, value) in fields {
        if !value.is_empty() {
            lines.push(format!("{label:<10}  {value}"));
        }
    }
    for (label, score, vector) in [
        ("CVSS 2.0", &v.cvss_score, &v.cvss_vector),
        ("CVSS 3.0", &v.cvss3_score, &v.cvss3_vector),
    ] {
        if !score.is_empty() || !vector.is_empty() {
            lines.push(format!("{label:<10}  {score} {vector}").trim_end().to_string());
        }
    }
    if !v.description.is_empty() {
        lines.push(String::new());
        lines.push(v.description.clone());
    }

    lines.push(String::new());
    if report.cves.is_empty() {
        lines.push("No CVE identifiers recorded".to_string());
    }
    for cve in &report.cves {
        let Some(nvd) = &cve.nvd else {
            lines.push(format!("{} (not scraped from NVD yet)", cve.cve));
            continue;
        };
        lines.push(format!(
            "{} (NVD, fetched {})",
            cve.cve,
            nvd.fetched_at.format("%Y-%m-%d %H:%M")
        ));
        if !nvd.description.is_empty() {
            lines.push(format!("  {}", nvd.description));
        }
        for link in nvd.hyperlinks.iter().filter(|link| !link.is_empty()) {
            lines.push(format!("  - {link}"));
        }
    }

    lines.push(String::new());
    match &report.opencve {
        Some(record) => {
            let m = &record.metrics;
            lines.push(format!(
                "CVSS v3 (OpenCVE, fetched {})",
                record.fetched_at.format("%Y-%m-%d %H:%M")
            ));
            for (label, value) in [
                ("Attack vector", &m.attack_vector),
                ("Attack complexity", &m.attack_complexity),
                ("Privileges required", &m.privileges_required),
                ("User interaction", &m.user_interaction),
                ("Scope", &m.scope),
                ("Confidentiality impact", &m.confidentiality_impact),
                ("Integrity impact", &m.integrity_impact),
                ("Availability impact", &m.availability_impact),
            ] {
                let value = if value.is_empty() { "-" } else { value.as_str() };
                lines.push(format!("  {label:<22}  {value}"));
            }
        }
        None => lines.push("No OpenCVE metrics stored".to_string()),
    }

    lines.join("\n")
}
