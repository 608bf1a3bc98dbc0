//! NVD vulnerability detail page (`/vuln/detail/<CVE>`)

use scraper::{Html, Selector};

use super::{DocumentExtractor, ExtractError, compile, element_text, ensure_not_empty};

const DESCRIPTION: &str = "p[data-testid='vuln-description']";
const HYPERLINK_ROWS: &str = "table[data-testid='vuln-hyperlinks-table'] tbody tr";
const HYPERLINK: &str = "td[data-testid^='vuln-hyperlinks-link-'] a";

/// Fields scraped from one NVD detail page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NvdDetail {
    pub description: String,
    /// One entry per row of the references table, empty when a row has no link
    pub hyperlinks: Vec<String>,
}

pub struct NvdDetailExtractor {
    description: Selector,
    rows: Selector,
    link: Selector,
}

impl NvdDetailExtractor {
    pub fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            description: compile(DESCRIPTION)?,
            rows: compile(HYPERLINK_ROWS)?,
            link: compile(HYPERLINK)?,
        })
    }
}

impl DocumentExtractor for NvdDetailExtractor {
    type Output = NvdDetail;

    fn extract(&self, body: &str) -> Result<NvdDetail, ExtractError> {
        ensure_not_empty(body)?;
        let document = Html::parse_document(body);

        let description = document
            .select(&self.description)
            .map(element_text)
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string();

        let hyperlinks = document
            .select(&self.rows)
            .map(|row| {
                row.select(&self.link)
                    .next()
                    .and_then(|anchor| anchor.value().attr("href"))
                    .unwrap_or_default()
                    .to_string()
            })
            .collect();

        Ok(NvdDetail {
            description,
            hyperlinks,
        })
    }
}
