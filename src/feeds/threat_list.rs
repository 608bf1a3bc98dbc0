//! FSTEC threat list (`thrlist.xlsx`)
//!
//! Sheet `Sheet` starts with a two-row header. Each data row carries the
//! threat code in column 0 followed by seven text columns.

use std::io::Cursor;

use calamine::{Data, Range, Reader, Xlsx};

use super::FeedError;

const SHEET: &str = "Sheet";
const HEADER_ROWS: u32 = 2;

/// One row of the threat list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Threat {
    pub name: String,
    pub description: String,
    pub source: String,
    pub object: String,
    pub confidentiality_violation: String,
    pub integrity_violation: String,
    pub availability_violation: String,
}

/// Decode the downloaded workbook bytes
pub fn read_threats(workbook: Vec<u8>) -> Result<Vec<Threat>, FeedError> {
    let mut xlsx: Xlsx<_> = Xlsx::new(Cursor::new(workbook))?;
    let range = xlsx.worksheet_range(SHEET)?;
    Ok(threats_from_range(&range))
}

/// Map worksheet rows to threats, skipping the header and rows without a name
pub fn threats_from_range(range: &Range<Data>) -> Vec<Threat> {
    let (Some((first_row, _)), Some((last_row, _))) = (range.start(), range.end()) else {
        return Vec::new();
    };

    let cell = |row: u32, col: u32| range.get_value((row, col)).map(cell_text).unwrap_or_default();

    (first_row.max(HEADER_ROWS)..=last_row)
        .filter_map(|row| {
            let threat = Threat {
                name: cell(row, 1),
                description: cell(row, 2),
                source: cell(row, 3),
                object: cell(row, 4),
                confidentiality_violation: cell(row, 5),
                integrity_violation: cell(row, 6),
                availability_violation: cell(row, 7),
            };
            if threat.name.is_empty() {
                tracing::debug!(row, "skipping threat row without a name");
                return None;
            }
            Some(threat)
        })
        .collect()
}

fn cell_text(data: &Data) -> String {
    match data {
        Data::Empty => String::new(),
        Data::String(text) => text.trim().to_string(),
        Data::Int(value) => value.to_string(),
        Data::Float(value) => value.to_string(),
        Data::Bool(value) => value.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::bdu_export::tests::zip_with;

    const WORKBOOK_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">
<sheets><sheet name="SHEET_NAME" sheetId="1" r:id="rId1"/></sheets>
</workbook>"#;

    const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/>
</Relationships>"#;

    const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/>
</Relationships>"#;

    const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">
<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>
<Default Extension="xml" ContentType="application/xml"/>
<Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/>
<Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>
</Types>"#;

    /// Minimal `.xlsx` with one worksheet; numeric values become number cells
    fn workbook(sheet_name: &str, rows: &[[&str; 8]]) -> Vec<u8> {
        let mut sheet = String::from(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
        );
        for (r, row) in rows.iter().enumerate() {
            sheet.push_str(&format!(r#"<row r="{}">"#, r + 1));
            for (c, value) in row.iter().enumerate() {
                if value.is_empty() {
                    continue;
                }
                let cell = format!("{}{}", char::from(b'A' + c as u8), r + 1);
                if value.parse::<f64>().is_ok() {
                    sheet.push_str(&format!(r#"<c r="{cell}"><v>{value}</v></c>"#));
                } else {
                    sheet.push_str(&format!(
                        r#"<c r="{cell}" t="inlineStr"><is><t>{value}</t></is></c>"#
                    ));
                }
            }
            sheet.push_str("</row>");
        }
        sheet.push_str("</sheetData></worksheet>");

        let workbook_xml = WORKBOOK_XML.replace("SHEET_NAME", sheet_name);
        zip_with(&[
            ("[Content_Types].xml", CONTENT_TYPES),
            ("_rels/.rels", ROOT_RELS),
            ("xl/workbook.xml", &workbook_xml),
            ("xl/_rels/workbook.xml.rels", WORKBOOK_RELS),
            ("xl/worksheets/sheet1.xml", &sheet),
        ])
    }

    fn sheet(rows: &[[&str; 8]]) -> Range<Data> {
        let mut range = Range::new((0, 0), (rows.len() as u32 - 1, 7));
        for (r, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                let data = if value.is_empty() {
                    Data::Empty
                } else {
                    Data::String(value.to_string())
                };
                range.set_value((r as u32, c as u32), data);
            }
        }
        range
    }

    const TITLE: [&str; 8] = ["Перечень угроз", "", "", "", "", "", "", ""];
    const HEADER: [&str; 8] = [
        "Идентификатор УБИ",
        "Наименование УБИ",
        "Описание",
        "Источник угрозы",
        "Объект воздействия",
        "Нарушение конфиденциальности",
        "Нарушение целостности",
        "Нарушение доступности",
    ];

    #[test]
    fn test_header_rows_are_skipped() {
        let range = sheet(&[
            TITLE,
            HEADER,
            [
                "1",
                "Угроза автоматического распространения",
                "Угроза заключается в возможности",
                "Внешний нарушитель",
                "Сетевой узел",
                "1",
                "1",
                "1",
            ],
            ["2", "Угроза агрегирования данных", "Описание", "Внутренний нарушитель", "Сетевой трафик", "1", "0", "0"],
        ]);

        let threats = threats_from_range(&range);
        assert_eq!(threats.len(), 2);
        assert_eq!(threats[0].name, "Угроза автоматического распространения");
        assert_eq!(threats[0].object, "Сетевой узел");
        assert_eq!(threats[1].integrity_violation, "0");
        assert_eq!(threats[1].availability_violation, "0");
    }

    #[test]
    fn test_rows_without_name_are_skipped() {
        let range = sheet(&[
            TITLE,
            HEADER,
            ["3", "", "orphan description", "", "", "", "", ""],
            ["4", "Угроза доступа", "", "", "", "", "", ""],
        ]);
        let threats = threats_from_range(&range);
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].name, "Угроза доступа");
        assert_eq!(threats[0].description, "");
    }

    #[test]
    fn test_numeric_cells_become_text() {
        let mut range = sheet(&[TITLE, HEADER, ["5", "Угроза", "d", "s", "o", "", "", ""]]);
        range.set_value((2, 5), Data::Float(1.0));
        range.set_value((2, 6), Data::Int(0));
        range.set_value((2, 7), Data::Bool(true));

        let threats = threats_from_range(&range);
        assert_eq!(threats[0].confidentiality_violation, "1");
        assert_eq!(threats[0].integrity_violation, "0");
        assert_eq!(threats[0].availability_violation, "true");
    }

    #[test]
    fn test_empty_sheet() {
        assert!(threats_from_range(&Range::<Data>::empty()).is_empty());
    }

    #[test]
    fn test_read_threats_from_workbook() {
        let bytes = workbook(
            "Sheet",
            &[
                TITLE,
                HEADER,
                ["1", "Угроза автоматического распространения", "Описание", "Внешний нарушитель", "Сетевой узел", "1", "1", "0"],
                ["2", "", "orphan", "", "", "", "", ""],
                ["3", "Угроза агрегирования данных", "", "Внутренний нарушитель", "", "1", "0", "0"],
            ],
        );

        let threats = read_threats(bytes).unwrap();
        assert_eq!(threats.len(), 2);
        assert_eq!(threats[0].name, "Угроза автоматического распространения");
        assert_eq!(threats[0].source, "Внешний нарушитель");
        assert_eq!(threats[0].confidentiality_violation, "1");
        assert_eq!(threats[0].availability_violation, "0");
        assert_eq!(threats[1].name, "Угроза агрегирования данных");
        assert_eq!(threats[1].object, "");
    }

    #[test]
    fn test_workbook_without_threat_sheet() {
        let bytes = workbook("Лист1", &[TITLE, HEADER]);
        assert!(matches!(read_threats(bytes), Err(FeedError::Sheet(_))));
    }

    #[test]
    fn test_not_a_workbook() {
        let result = read_threats(b"not a workbook".to_vec());
        assert!(matches!(result, Err(FeedError::Sheet(_))));
    }
}
