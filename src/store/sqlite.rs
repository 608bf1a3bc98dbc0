//! SQLite store with connection pooling

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use r2d2_sqlite::rusqlite::{self, Connection, OptionalExtension, params};

use super::{
    NvdRecord, OpenCveRecord, Schema, Store, TABLES, VULNERABILITY_COLUMNS, VulnerabilityRecord,
    VulnerabilityRef, split_hyperlinks,
};
use crate::extractors::CvssMetrics;
use crate::feeds::{BduVulnerability, Threat};

const CORE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS vulnerability (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
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
CREATE TABLE IF NOT EXISTS software (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vendor TEXT,
    name TEXT,
    version TEXT,
    platform TEXT,
    type TEXT,
    vulnerability_id INTEGER REFERENCES vulnerability(id)
);
CREATE TABLE IF NOT EXISTS os (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vendor TEXT,
    name TEXT,
    version TEXT,
    platform TEXT,
    vulnerability_id INTEGER REFERENCES vulnerability(id)
);
CREATE TABLE IF NOT EXISTS cve_identifier (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT,
    link TEXT,
    vulnerability_id INTEGER REFERENCES vulnerability(id)
);
CREATE INDEX IF NOT EXISTS idx_cve_identifier_vulnerability ON cve_identifier(vulnerability_id);
";

const NVD_TABLE: &str = "
CREATE TABLE IF NOT EXISTS cve_nvd (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cve_link TEXT UNIQUE NOT NULL,
    description TEXT,
    last_fetched TEXT,
    vulnerability_id INTEGER REFERENCES vulnerability(id),
    hyperlinks TEXT
);
";

const OPENCVE_TABLE: &str = "
CREATE TABLE IF NOT EXISTS cve_opencve (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vulnerability_id INTEGER UNIQUE NOT NULL REFERENCES vulnerability(id),
    attack_vector TEXT,
    attack_complexity TEXT,
    privileges_required TEXT,
    user_interaction TEXT,
    confidentiality_impact TEXT,
    integrity_impact TEXT,
    availability_impact TEXT,
    scope TEXT,
    last_fetched TEXT
);
";

const UBI_TABLE: &str = "
CREATE TABLE IF NOT EXISTS ubi (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
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

/// Configuration for the SQLite pool
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    pub max_pool_size: u32,
    pub connection_timeout_secs: u64,
    pub busy_timeout_ms: u64,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 8,
            connection_timeout_secs: 5,
            busy_timeout_ms: 5000,
        }
    }
}

pub struct SqliteStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Self::open_with_config(path, SqliteStoreConfig::default())
    }

    pub fn open_with_config(path: &Path, config: SqliteStoreConfig) -> anyhow::Result<Self> {
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch(
                "PRAGMA foreign_keys=ON;
                 PRAGMA synchronous=NORMAL;",
            )?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(config.max_pool_size)
            .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
            .build(manager)
            .with_context(|| format!("failed to open SQLite database {}", path.display()))?;

        {
            let conn = pool.get()?;
            let mode: String =
                conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
            tracing::debug!(path = %path.display(), journal_mode = %mode, "SQLite store opened");
        }

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("failed to get SQLite connection")?;
            op(&mut conn)
        })
        .await
        .context("SQLite task failed")?
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn vulnerability_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VulnerabilityRecord> {
    let text = |i: usize| -> rusqlite::Result<String> {
        Ok(row.get::<_, Option<String>>(i)?.unwrap_or_default())
    };
    Ok(VulnerabilityRecord {
        id: row.get(0)?,
        identifier: text(1)?,
        name: text(2)?,
        description: text(3)?,
        identify_date: text(4)?,
        severity: text(5)?,
        solution: text(6)?,
        vul_status: text(7)?,
        exploit_status: text(8)?,
        fix_status: text(9)?,
        sources: text(10)?,
        other: text(11)?,
        vul_incident: text(12)?,
        vul_class: text(13)?,
        cwe: text(14)?,
        cvss_vector: text(15)?,
        cvss_score: text(16)?,
        cvss3_vector: text(17)?,
        cvss3_score: text(18)?,
    })
}

fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid stored timestamp {raw:?}"))?
        .with_timezone(&Utc))
}

#[async_trait]
impl Store for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn ensure_schema(&self, schema: Schema) -> anyhow::Result<()> {
        self.with_conn(move |conn| {
            match schema {
                Schema::Bdu => conn.execute_batch(CORE_TABLES)?,
                Schema::Threats => conn.execute_batch(UBI_TABLE)?,
                Schema::Nvd => {
                    conn.execute_batch(CORE_TABLES)?;
                    conn.execute_batch(NVD_TABLE)?;
                }
                Schema::OpenCve => {
                    conn.execute_batch(CORE_TABLES)?;
                    conn.execute_batch(OPENCVE_TABLE)?;
                }
            }
            Ok(())
        })
        .await
        .with_context(|| format!("failed to create {schema:?} tables"))
    }

    async fn vulnerabilities(&self) -> anyhow::Result<Vec<VulnerabilityRef>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, identifier FROM vulnerability ORDER BY identifier DESC")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(VulnerabilityRef {
                        id: row.get(0)?,
                        identifier: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn cve_links(&self, vulnerability_id: i32) -> anyhow::Result<Vec<String>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT link FROM cve_identifier WHERE vulnerability_id = ?1 ORDER BY id",
            )?;
            let links = stmt
                .query_map([vulnerability_id], |row| row.get::<_, Option<String>>(0))?
                .filter_map(|link| link.transpose())
                .collect::<Result<Vec<_>, _>>()?;
            Ok(links)
        })
        .await
    }

    async fn vulnerability(&self, identifier: &str) -> anyhow::Result<Option<VulnerabilityRecord>> {
        let sql = format!("SELECT {VULNERABILITY_COLUMNS} FROM vulnerability WHERE identifier = ?1");
        let identifier = identifier.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(&sql, [&identifier], vulnerability_from_row)
                .optional()?)
        })
        .await
    }

    async fn insert_vulnerability(
        &self,
        vulnerability: &BduVulnerability,
    ) -> anyhow::Result<Option<i32>> {
        let vul = vulnerability.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let existing: Option<i32> = tx
                .query_row(
                    "SELECT id FROM vulnerability WHERE identifier = ?1",
                    [&vul.identifier],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Ok(None);
            }

            tx.execute(
                "INSERT INTO vulnerability (identifier, name, description, identify_date, severity,
                    solution, vul_status, exploit_status, fix_status, sources, other, vul_incident,
                    vul_class, cwe, cvss_vector, cvss_score, cvss3_vector, cvss3_score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                params![
                    vul.identifier,
                    vul.name,
                    vul.description,
                    vul.identify_date,
                    vul.severity,
                    vul.solution,
                    vul.vul_status,
                    vul.exploit_status,
                    vul.fix_status,
                    vul.sources,
                    vul.other,
                    vul.vul_incident,
                    vul.vul_class,
                    vul.cwe.identifier,
                    vul.cvss.vector.vector,
                    vul.cvss.vector.score,
                    vul.cvss3.vector.vector,
                    vul.cvss3.vector.score,
                ],
            )?;
            let id = i32::try_from(tx.last_insert_rowid()).context("vulnerability id overflow")?;

            for soft in &vul.vulnerable_software.soft {
                tx.execute(
                    "INSERT INTO software (vendor, name, version, platform, type, vulnerability_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        soft.vendor,
                        soft.name,
                        soft.version,
                        soft.platform,
                        soft.types.joined(),
                        id
                    ],
                )?;
            }
            for os in &vul.environment.os {
                tx.execute(
                    "INSERT INTO os (vendor, name, version, platform, vulnerability_id)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![os.vendor, os.name, os.version, os.platform, id],
                )?;
            }
            for link in vul.cve_identifiers() {
                tx.execute(
                    "INSERT INTO cve_identifier (type, link, vulnerability_id) VALUES ('CVE', ?1, ?2)",
                    params![link, id],
                )?;
            }

            tx.commit()?;
            Ok(Some(id))
        })
        .await
        .with_context(|| format!("failed to insert {}", vulnerability.identifier))
    }

    async fn insert_threat(&self, threat: &Threat) -> anyhow::Result<bool> {
        let t = threat.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO ubi (name, description, source, object, confidentiality_violation,
                    integrity_violation, availability_violation)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT DO NOTHING",
                params![
                    t.name,
                    t.description,
                    t.source,
                    t.object,
                    t.confidentiality_violation,
                    t.integrity_violation,
                    t.availability_violation
                ],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn nvd_exists(&self, cve_link: &str) -> anyhow::Result<bool> {
        let cve_link = cve_link.to_string();
        self.with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM cve_nvd WHERE cve_link = ?1)",
                [&cve_link],
                |row| row.get(0),
            )?)
        })
        .await
    }

    async fn upsert_nvd(&self, record: &NvdRecord) -> anyhow::Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO cve_nvd (cve_link, description, last_fetched, vulnerability_id, hyperlinks)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (cve_link) DO UPDATE SET
                    description = excluded.description,
                    last_fetched = excluded.last_fetched,
                    vulnerability_id = excluded.vulnerability_id,
                    hyperlinks = excluded.hyperlinks",
                params![
                    record.cve_link,
                    record.description,
                    timestamp(&record.fetched_at),
                    record.vulnerability_id,
                    record.joined_hyperlinks()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn nvd_record(&self, cve_link: &str) -> anyhow::Result<Option<NvdRecord>> {
        let cve_link = cve_link.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT cve_link, description, last_fetched, vulnerability_id, hyperlinks
                     FROM cve_nvd WHERE cve_link = ?1",
                    [&cve_link],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i32>(3)?,
                            row.get::<_, Option<String>>(4)?,
                        ))
                    },
                )
                .optional()?;

            row.map(|(cve_link, description, fetched, vulnerability_id, hyperlinks)| {
                Ok(NvdRecord {
                    cve_link,
                    description: description.unwrap_or_default(),
                    hyperlinks: split_hyperlinks(&hyperlinks.unwrap_or_default()),
                    vulnerability_id,
                    fetched_at: parse_timestamp(&fetched)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn opencve_exists(&self, vulnerability_id: i32) -> anyhow::Result<bool> {
        self.with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM cve_opencve WHERE vulnerability_id = ?1)",
                [vulnerability_id],
                |row| row.get(0),
            )?)
        })
        .await
    }

    async fn upsert_opencve(&self, record: &OpenCveRecord) -> anyhow::Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let m = &record.metrics;
            conn.execute(
                "INSERT INTO cve_opencve (vulnerability_id, attack_vector, attack_complexity,
                    privileges_required, user_interaction, confidentiality_impact,
                    integrity_impact, availability_impact, scope, last_fetched)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (vulnerability_id) DO UPDATE SET
                    attack_vector = excluded.attack_vector,
                    attack_complexity = excluded.attack_complexity,
                    privileges_required = excluded.privileges_required,
                    user_interaction = excluded.user_interaction,
                    confidentiality_impact = excluded.confidentiality_impact,
                    integrity_impact = excluded.integrity_impact,
                    availability_impact = excluded.availability_impact,
                    scope = excluded.scope,
                    last_fetched = excluded.last_fetched",
                params![
                    record.vulnerability_id,
                    m.attack_vector,
                    m.attack_complexity,
                    m.privileges_required,
                    m.user_interaction,
                    m.confidentiality_impact,
                    m.integrity_impact,
                    m.availability_impact,
                    m.scope,
                    timestamp(&record.fetched_at)
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn opencve_record(&self, vulnerability_id: i32) -> anyhow::Result<Option<OpenCveRecord>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT attack_vector, attack_complexity, privileges_required, user_interaction,
                        confidentiality_impact, integrity_impact, availability_impact, scope,
                        last_fetched
                     FROM cve_opencve WHERE vulnerability_id = ?1",
                    [vulnerability_id],
                    |row| {
                        let text = |i: usize| -> rusqlite::Result<String> {
                            Ok(row.get::<_, Option<String>>(i)?.unwrap_or_default())
                        };
                        Ok((
                            CvssMetrics {
                                attack_vector: text(0)?,
                                attack_complexity: text(1)?,
                                privileges_required: text(2)?,
                                user_interaction: text(3)?,
                                confidentiality_impact: text(4)?,
                                integrity_impact: text(5)?,
                                availability_impact: text(6)?,
                                scope: text(7)?,
                            },
                            row.get::<_, String>(8)?,
                        ))
                    },
                )
                .optional()?;

            row.map(|(metrics, fetched)| {
                Ok(OpenCveRecord {
                    vulnerability_id,
                    metrics,
                    fetched_at: parse_timestamp(&fetched)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn count_rows(&self, table: &'static str) -> anyhow::Result<Option<i64>> {
        anyhow::ensure!(TABLES.contains(&table), "unknown table {table}");
        self.with_conn(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                [table],
                |row| row.get(0),
            )?;
            if !exists {
                return Ok(None);
            }
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            Ok(Some(count))
        })
        .await
    }
}
