//! BDU vulnerability export (`vulxml.zip`)
//!
//! The archive holds a single `export/export.xml`:
//!
//! ```xml
//! <vulnerabilities>
//!   <vul>
//!     <identifier>BDU:2015-00001</identifier>
//!     <vulnerable_software><soft>...</soft></vulnerable_software>
//!     <environment><os>...</os></environment>
//!     <cvss><vector score="10">AV:N/AC:L/Au:N/C:C/I:C/A:C</vector></cvss>
//!     <identifiers><identifier type="CVE">CVE-2015-0001</identifier></identifiers>
//!     ...
//!   </vul>
//! </vulnerabilities>
//! ```

use std::io::{BufRead, BufReader, Cursor};

use serde::Deserialize;
use zip::ZipArchive;

use super::FeedError;

const EXPORT_ENTRY: &str = "export/export.xml";

#[derive(Debug, Default, Deserialize)]
#[serde(rename = "vulnerabilities", default)]
pub struct BduExport {
    pub vul: Vec<BduVulnerability>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BduVulnerability {
    pub identifier: String,
    pub name: String,
    pub description: String,
    pub vulnerable_software: VulnerableSoftware,
    pub environment: Environment,
    pub cwe: Cwe,
    pub identify_date: String,
    pub cvss: Cvss,
    pub cvss3: Cvss,
    pub severity: String,
    pub solution: String,
    pub vul_status: String,
    pub exploit_status: String,
    pub fix_status: String,
    pub sources: String,
    pub other: String,
    pub vul_incident: String,
    pub vul_class: String,
    pub identifiers: Identifiers,
}

impl BduVulnerability {
    /// CVE identifiers; other identifier kinds are ignored
    pub fn cve_identifiers(&self) -> impl Iterator<Item = &str> {
        self.identifiers
            .identifier
            .iter()
            .filter(|id| id.kind == "CVE")
            .map(|id| id.value.trim())
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct VulnerableSoftware {
    pub soft: Vec<Software>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Software {
    pub vendor: String,
    pub name: String,
    pub version: String,
    pub platform: String,
    pub types: SoftwareTypes,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SoftwareTypes {
    #[serde(rename = "type")]
    pub kinds: Vec<String>,
}

impl SoftwareTypes {
    pub fn joined(&self) -> String {
        self.kinds.join(", ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Environment {
    pub os: Vec<OperatingSystem>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct OperatingSystem {
    pub vendor: String,
    pub name: String,
    pub version: String,
    pub platform: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Cwe {
    pub identifier: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Cvss {
    pub vector: CvssVector,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CvssVector {
    #[serde(rename = "@score")]
    pub score: String,
    #[serde(rename = "$text")]
    pub vector: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Identifiers {
    pub identifier: Vec<Identifier>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Identifier {
    #[serde(rename = "@type")]
    pub kind: String,
    #[serde(rename = "$text")]
    pub value: String,
}

/// Extract and parse the export from the downloaded archive bytes
pub fn read_export(archive: Vec<u8>) -> Result<BduExport, FeedError> {
    let mut zip = ZipArchive::new(Cursor::new(archive))?;

    let entry = if zip.index_for_name(EXPORT_ENTRY).is_some() {
        EXPORT_ENTRY.to_string()
    } else {
        zip.file_names()
            .find(|name| name.to_ascii_lowercase().ends_with(".xml"))
            .map(str::to_string)
            .ok_or(FeedError::MissingXml)?
    };
    tracing::info!(entry = %entry, "reading vulnerability export");

    let file = zip.by_name(&entry)?;
    parse_export(BufReader::new(file))
}

/// Parse an already extracted `export.xml`
pub fn parse_export<R: BufRead>(reader: R) -> Result<BduExport, FeedError> {
    Ok(quick_xml::de::from_reader(reader)?)
}
