//! OpenCVE CVE page (`/cve/<CVE>`)
//!
//! The CVSS v3 panel renders each metric as an `h4` heading with the label
//! on the left and the value in a `.pull-right` span.

use scraper::{ElementRef, Html, Selector};
use serde::Serialize;

use super::{DocumentExtractor, ExtractError, compile, element_text, ensure_not_empty};

const HEADING: &str = "h4";
const VALUE: &str = ".pull-right";

/// CVSS v3 base metrics as displayed by OpenCVE
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CvssMetrics {
    pub attack_vector: String,
    pub attack_complexity: String,
    pub privileges_required: String,
    pub user_interaction: String,
    pub confidentiality_impact: String,
    pub integrity_impact: String,
    pub availability_impact: String,
    pub scope: String,
}

impl CvssMetrics {
    /// True when the page carried none of the metrics
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct OpenCveExtractor {
    heading: Selector,
    value: Selector,
}

impl OpenCveExtractor {
    pub fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            heading: compile(HEADING)?,
            value: compile(VALUE)?,
        })
    }

    fn metric(&self, headings: &[ElementRef<'_>], label: &str) -> String {
        headings
            .iter()
            .find(|heading| heading.text().collect::<String>().contains(label))
            .and_then(|heading| heading.select(&self.value).next())
            .map(element_text)
            .unwrap_or_default()
    }
}

impl DocumentExtractor for OpenCveExtractor {
    type Output = CvssMetrics;

    fn extract(&self, body: &str) -> Result<CvssMetrics, ExtractError> {
        ensure_not_empty(body)?;
        let document = Html::parse_document(body);
        let headings: Vec<_> = document.select(&self.heading).collect();

        Ok(CvssMetrics {
            attack_vector: self.metric(&headings, "Attack Vector"),
            attack_complexity: self.metric(&headings, "Attack Complexity"),
            privileges_required: self.metric(&headings, "Privileges Required"),
            user_interaction: self.metric(&headings, "User Interaction"),
            confidentiality_impact: self.metric(&headings, "Confidentiality Impact"),
            integrity_impact: self.metric(&headings, "Integrity Impact"),
            availability_impact: self.metric(&headings, "Availability Impact"),
            scope: self.metric(&headings, "Scope"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(rows: &[(&str, &str)]) -> String {
        let mut html = String::from("<html><body><div class=\"box-body\">");
        for (label, value) in rows {
            html.push_str(&format!(
                "<h4>{label} <span class=\"pull-right label label-default\">\n  {value}\n</span></h4>"
            ));
        }
        html.push_str("</div></body></html>");
        html
    }

    #[test]
    fn test_extract_all_metrics() {
        let body = page(&[
            ("Attack Vector", "NETWORK"),
            ("Attack Complexity", "LOW"),
            ("Privileges Required", "NONE"),
            ("User Interaction", "REQUIRED"),
            ("Scope", "UNCHANGED"),
            ("Confidentiality Impact", "HIGH"),
            ("Integrity Impact", "HIGH"),
            ("Availability Impact", "NONE"),
        ]);
        let metrics = OpenCveExtractor::new().unwrap().extract(&body).unwrap();
        assert_eq!(
            metrics,
            CvssMetrics {
                attack_vector: "NETWORK".into(),
                attack_complexity: "LOW".into(),
                privileges_required: "NONE".into(),
                user_interaction: "REQUIRED".into(),
                confidentiality_impact: "HIGH".into(),
                integrity_impact: "HIGH".into(),
                availability_impact: "NONE".into(),
                scope: "UNCHANGED".into(),
            }
        );
    }

    #[test]
    fn test_first_matching_heading_wins() {
        let body = page(&[("Attack Vector", "NETWORK"), ("Attack Vector", "LOCAL")]);
        let metrics = OpenCveExtractor::new().unwrap().extract(&body).unwrap();
        assert_eq!(metrics.attack_vector, "NETWORK");
    }

    #[test]
    fn test_missing_metric_is_empty() {
        let body = page(&[("Attack Vector", "ADJACENT_NETWORK")]);
        let metrics = OpenCveExtractor::new().unwrap().extract(&body).unwrap();
        assert_eq!(metrics.attack_vector, "ADJACENT_NETWORK");
        assert_eq!(metrics.scope, "");
        assert!(!metrics.is_empty());
    }

    #[test]
    fn test_page_without_panel() {
        let metrics = OpenCveExtractor::new()
            .unwrap()
            .extract("<html><body><h1>Not found</h1></body></html>")
            .unwrap();
        assert!(metrics.is_empty());
    }

    #[test]
    fn test_empty_body_is_rejected() {
        let err = OpenCveExtractor::new().unwrap().extract("").unwrap_err();
        assert_eq!(err, ExtractError::EmptyDocument);
    }
}
