//! PostgreSQL store
//!
//! Concurrent pipeline tasks share one pipelined client. Multi-row imports
//! need a transaction, which takes `&mut Client`, so they go through a
//! second connection behind a mutex.

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls, Row};

use super::{
    NvdRecord, OpenCveRecord, Schema, Store, TABLES, VULNERABILITY_COLUMNS, VulnerabilityRecord,
    VulnerabilityRef, split_hyperlinks,
};
use crate::config::DbConfig;
use crate::extractors::CvssMetrics;
use crate::feeds::{BduVulnerability, Threat};

const CORE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS vulnerability (
    id SERIAL PRIMARY KEY,
    identifier TEXT UNIQUE,
    name TEXT,
    description TEXT,
    identify_date TEXT,
    severity TEXT,
    solution TEXT,
    vul_status TEXT,
    exploit_status TEXT,
    fix_status TEXT,
    sources TEXT,
    other TEXT,
    vul_incident TEXT,
    vul_class TEXT,
    cwe TEXT,
    cvss_vector TEXT,
    cvss_score TEXT,
    cvss3_vector TEXT,
    cvss3_score TEXT
);
ALTER TABLE vulnerability
    ADD COLUMN IF NOT EXISTS cwe TEXT,
    ADD COLUMN IF NOT EXISTS cvss_vector TEXT,
    ADD COLUMN IF NOT EXISTS cvss_score TEXT,
    ADD COLUMN IF NOT EXISTS cvss3_vector TEXT,
    ADD COLUMN IF NOT EXISTS cvss3_score TEXT;
CREATE TABLE IF NOT EXISTS software (
    id SERIAL PRIMARY KEY,
    vendor TEXT,
    name TEXT,
    version TEXT,
    platform TEXT,
    type TEXT,
    vulnerability_id INTEGER,
    FOREIGN KEY(vulnerability_id) REFERENCES vulnerability(id)
);
CREATE TABLE IF NOT EXISTS os (
    id SERIAL PRIMARY KEY,
    vendor TEXT,
    name TEXT,
    version TEXT,
    platform TEXT,
    vulnerability_id INTEGER,
    FOREIGN KEY(vulnerability_id) REFERENCES vulnerability(id)
);
CREATE TABLE IF NOT EXISTS cve_identifier (
    id SERIAL PRIMARY KEY,
    type TEXT,
    link TEXT,
    vulnerability_id INTEGER,
    FOREIGN KEY(vulnerability_id) REFERENCES vulnerability(id)
);
CREATE INDEX IF NOT EXISTS idx_cve_identifier_vulnerability ON cve_identifier(vulnerability_id);
";

const NVD_TABLE: &str = "
CREATE TABLE IF NOT EXISTS cve_nvd (
    id SERIAL PRIMARY KEY,
    cve_link TEXT UNIQUE,
    description TEXT,
    last_fetched TIMESTAMP,
    vulnerability_id INTEGER,
    hyperlinks TEXT,
    FOREIGN KEY(vulnerability_id) REFERENCES vulnerability(id)
);
";

// Tables created by older deployments lack the unique key and timestamp.
const OPENCVE_TABLE: &str = "
CREATE TABLE IF NOT EXISTS cve_opencve (
    id SERIAL PRIMARY KEY,
    vulnerability_id INTEGER,
    attack_vector TEXT,
    attack_complexity TEXT,
    privileges_required TEXT,
    user_interaction TEXT,
    confidentiality_impact TEXT,
    integrity_impact TEXT,
    availability_impact TEXT,
    scope TEXT,
    last_fetched TIMESTAMP,
    FOREIGN KEY(vulnerability_id) REFERENCES vulnerability(id)
);
ALTER TABLE cve_opencve ADD COLUMN IF NOT EXISTS last_fetched TIMESTAMP;
CREATE UNIQUE INDEX IF NOT EXISTS cve_opencve_vulnerability_id_key ON cve_opencve(vulnerability_id);
";

const UBI_TABLE: &str = "
CREATE TABLE IF NOT EXISTS ubi (
    id SERIAL PRIMARY KEY,
    name TEXT,
    description TEXT,
    source TEXT,
    object TEXT,
    confidentiality_violation TEXT,
    integrity_violation TEXT,
    availability_violation TEXT,
    UNIQUE(name, description, source, object, confidentiality_violation, integrity_violation, availability_violation)
);
";

pub struct PgStore {
    client: Client,
    writer: Mutex<Client>,
}

impl PgStore {
    pub async fn connect(config: &DbConfig) -> anyhow::Result<Self> {
        let client = open_connection(config).await?;
        let writer = open_connection(config).await?;
        tracing::info!(database = %config, "connected to PostgreSQL");
        Ok(Self {
            client,
            writer: Mutex::new(writer),
        })
    }
}

async fn open_connection(config: &DbConfig) -> anyhow::Result<Client> {
    let (client, connection) = config
        .pg_config()
        .connect(NoTls)
        .await
        .with_context(|| format!("failed to connect to {config}"))?;

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::error!(error = %err, "PostgreSQL connection closed with error");
        }
    });
    Ok(client)
}

fn text(row: &Row, idx: usize) -> Result<String, tokio_postgres::Error> {
    Ok(row.try_get::<_, Option<String>>(idx)?.unwrap_or_default())
}

#[async_trait]
impl Store for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn ensure_schema(&self, schema: Schema) -> anyhow::Result<()> {
        let batches: &[&str] = match schema {
            Schema::Bdu => &[CORE_TABLES],
            Schema::Threats => &[UBI_TABLE],
            Schema::Nvd => &[CORE_TABLES, NVD_TABLE],
            Schema::OpenCve => &[CORE_TABLES, OPENCVE_TABLE],
        };
        for batch in batches {
            self.client
                .batch_execute(batch)
                .await
                .with_context(|| format!("failed to create {schema:?} tables"))?;
        }
        Ok(())
    }

    async fn vulnerabilities(&self) -> anyhow::Result<Vec<VulnerabilityRef>> {
        let rows = self
            .client
            .query(
                "SELECT id, identifier FROM vulnerability ORDER BY identifier DESC",
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok(VulnerabilityRef {
                    id: row.try_get(0)?,
                    identifier: text(row, 1)?,
                })
            })
            .collect()
    }

    async fn cve_links(&self, vulnerability_id: i32) -> anyhow::Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT link FROM cve_identifier WHERE vulnerability_id = $1 ORDER BY id",
                &[&vulnerability_id],
            )
            .await?;
        let mut links = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(link) = row.try_get::<_, Option<String>>(0)? {
                links.push(link);
            }
        }
        Ok(links)
    }

    async fn vulnerability(&self, identifier: &str) -> anyhow::Result<Option<VulnerabilityRecord>> {
        let sql = format!("SELECT {VULNERABILITY_COLUMNS} FROM vulnerability WHERE identifier = $1");
        let row = self.client.query_opt(sql.as_str(), &[&identifier]).await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(VulnerabilityRecord {
            id: row.try_get(0)?,
            identifier: text(&row, 1)?,
            name: text(&row, 2)?,
            description: text(&row, 3)?,
            identify_date: text(&row, 4)?,
            severity: text(&row, 5)?,
            solution: text(&row, 6)?,
            vul_status: text(&row, 7)?,
            exploit_status: text(&row, 8)?,
            fix_status: text(&row, 9)?,
            sources: text(&row, 10)?,
            other: text(&row, 11)?,
            vul_incident: text(&row, 12)?,
            vul_class: text(&row, 13)?,
            cwe: text(&row, 14)?,
            cvss_vector: text(&row, 15)?,
            cvss_score: text(&row, 16)?,
            cvss3_vector: text(&row, 17)?,
            cvss3_score: text(&row, 18)?,
        }))
    }

    async fn insert_vulnerability(
        &self,
        vul: &BduVulnerability,
    ) -> anyhow::Result<Option<i32>> {
        let mut writer = self.writer.lock().await;
        let tx = writer.transaction().await?;

        let existing = tx
            .query_opt(
                "SELECT id FROM vulnerability WHERE identifier = $1",
                &[&vul.identifier],
            )
            .await?;
        if existing.is_some() {
            return Ok(None);
        }

        let row = tx
            .query_one(
                "INSERT INTO vulnerability (identifier, name, description, identify_date, severity,
                    solution, vul_status, exploit_status, fix_status, sources, other, vul_incident,
                    vul_class, cwe, cvss_vector, cvss_score, cvss3_vector, cvss3_score)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                 RETURNING id",
                &[
                    &vul.identifier,
                    &vul.name,
                    &vul.description,
                    &vul.identify_date,
                    &vul.severity,
                    &vul.solution,
                    &vul.vul_status,
                    &vul.exploit_status,
                    &vul.fix_status,
                    &vul.sources,
                    &vul.other,
                    &vul.vul_incident,
                    &vul.vul_class,
                    &vul.cwe.identifier,
                    &vul.cvss.vector.vector,
                    &vul.cvss.vector.score,
                    &vul.cvss3.vector.vector,
                    &vul.cvss3.vector.score,
                ],
            )
            .await
            .with_context(|| format!("failed to insert {}", vul.identifier))?;
        let id: i32 = row.try_get(0)?;

        for soft in &vul.vulnerable_software.soft {
            tx.execute(
                "INSERT INTO software (vendor, name, version, platform, type, vulnerability_id)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    &soft.vendor,
                    &soft.name,
                    &soft.version,
                    &soft.platform,
                    &soft.types.joined(),
                    &id,
                ],
            )
            .await?;
        }
        for os in &vul.environment.os {
            tx.execute(
                "INSERT INTO os (vendor, name, version, platform, vulnerability_id)
                 VALUES ($1, $2, $3, $4, $5)",
                &[&os.vendor, &os.name, &os.version, &os.platform, &id],
            )
            .await?;
        }
        for link in vul.cve_identifiers() {
            tx.execute(
                "INSERT INTO cve_identifier (type, link, vulnerability_id) VALUES ('CVE', $1, $2)",
                &[&link, &id],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(Some(id))
    }

    async fn insert_threat(&self, t: &Threat) -> anyhow::Result<bool> {
        let inserted = self
            .client
            .execute(
                "INSERT INTO ubi (name, description, source, object, confidentiality_violation,
                    integrity_violation, availability_violation)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (name, description, source, object, confidentiality_violation,
                    integrity_violation, availability_violation) DO NOTHING",
                &[
                    &t.name,
                    &t.description,
                    &t.source,
                    &t.object,
                    &t.confidentiality_violation,
                    &t.integrity_violation,
                    &t.availability_violation,
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    async fn nvd_exists(&self, cve_link: &str) -> anyhow::Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM cve_nvd WHERE cve_link = $1)",
                &[&cve_link],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn upsert_nvd(&self, record: &NvdRecord) -> anyhow::Result<()> {
        self.client
            .execute(
                "INSERT INTO cve_nvd (cve_link, description, last_fetched, vulnerability_id, hyperlinks)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (cve_link) DO UPDATE SET
                    description = EXCLUDED.description,
                    last_fetched = EXCLUDED.last_fetched,
                    vulnerability_id = EXCLUDED.vulnerability_id,
                    hyperlinks = EXCLUDED.hyperlinks",
                &[
                    &record.cve_link,
                    &record.description,
                    &record.fetched_at.naive_utc(),
                    &record.vulnerability_id,
                    &record.joined_hyperlinks(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn nvd_record(&self, cve_link: &str) -> anyhow::Result<Option<NvdRecord>> {
        let Some(row) = self
            .client
            .query_opt(
                "SELECT cve_link, description, last_fetched, vulnerability_id, hyperlinks
                 FROM cve_nvd WHERE cve_link = $1",
                &[&cve_link],
            )
            .await?
        else {
            return Ok(None);
        };

        let fetched: NaiveDateTime = row.try_get(2)?;
        Ok(Some(NvdRecord {
            cve_link: text(&row, 0)?,
            description: text(&row, 1)?,
            hyperlinks: split_hyperlinks(&text(&row, 4)?),
            vulnerability_id: row.try_get(3)?,
            fetched_at: fetched.and_utc(),
        }))
    }

    async fn opencve_exists(&self, vulnerability_id: i32) -> anyhow::Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM cve_opencve WHERE vulnerability_id = $1)",
                &[&vulnerability_id],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn upsert_opencve(&self, record: &OpenCveRecord) -> anyhow::Result<()> {
        let m = &record.metrics;
        self.client
            .execute(
                "INSERT INTO cve_opencve (vulnerability_id, attack_vector, attack_complexity,
                    privileges_required, user_interaction, confidentiality_impact,
                    integrity_impact, availability_impact, scope, last_fetched)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 ON CONFLICT (vulnerability_id) DO UPDATE SET
                    attack_vector = EXCLUDED.attack_vector,
                    attack_complexity = EXCLUDED.attack_complexity,
                    privileges_required = EXCLUDED.privileges_required,
                    user_interaction = EXCLUDED.user_interaction,
                    confidentiality_impact = EXCLUDED.confidentiality_impact,
                    integrity_impact = EXCLUDED.integrity_impact,
                    availability_impact = EXCLUDED.availability_impact,
                    scope = EXCLUDED.scope,
                    last_fetched = EXCLUDED.last_fetched",
                &[
                    &record.vulnerability_id,
                    &m.attack_vector,
                    &m.attack_complexity,
                    &m.privileges_required,
                    &m.user_interaction,
                    &m.confidentiality_impact,
                    &m.integrity_impact,
                    &m.availability_impact,
                    &m.scope,
                    &record.fetched_at.naive_utc(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn opencve_record(&self, vulnerability_id: i32) -> anyhow::Result<Option<OpenCveRecord>> {
        let Some(row) = self
            .client
            .query_opt(
                "SELECT attack_vector, attack_complexity, privileges_required, user_interaction,
                    confidentiality_impact, integrity_impact, availability_impact, scope,
                    last_fetched
                 FROM cve_opencve WHERE vulnerability_id = $1",
                &[&vulnerability_id],
            )
            .await?
        else {
            return Ok(None);
        };

        let fetched: Option<NaiveDateTime> = row.try_get(8)?;
        Ok(Some(OpenCveRecord {
            vulnerability_id,
            metrics: CvssMetrics {
                attack_vector: text(&row, 0)?,
                attack_complexity: text(&row, 1)?,
                privileges_required: text(&row, 2)?,
                user_interaction: text(&row, 3)?,
                confidentiality_impact: text(&row, 4)?,
                integrity_impact: text(&row, 5)?,
                availability_impact: text(&row, 6)?,
                scope: text(&row, 7)?,
            },
            fetched_at: fetched.unwrap_or_default().and_utc(),
        }))
    }

    async fn count_rows(&self, table: &'static str) -> anyhow::Result<Option<i64>> {
        anyhow::ensure!(TABLES.contains(&table), "unknown table {table}");
        let exists: bool = self
            .client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables
                 WHERE table_schema = current_schema() AND table_name = $1::text)",
                &[&table],
            )
            .await?
            .try_get(0)?;
        if !exists {
            return Ok(None);
        }
        let sql = format!("SELECT COUNT(*) FROM {table}");
        let row = self.client.query_one(sql.as_str(), &[]).await?;
        Ok(Some(row.try_get(0)?))
    }
}
