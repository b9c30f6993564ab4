//! Spreadsheet export of the consumption history.
//!
//! Writes a minimal Office Open XML workbook (one sheet, inline strings, no
//! shared-string table or styles). Every `order_history` column is exported
//! as stored, header row first.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::db::{self, DbState};
use crate::error::AppResult;

const SHEET_NAME: &str = "Historial";

const CONTENT_TYPES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#;

const ROOT_RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const WORKBOOK_RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub path: PathBuf,
    pub rows: usize,
}

fn workbook_xml() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="{SHEET_NAME}" sheetId="1" r:id="rId1"/></sheets></workbook>"#
    )
}

/// Escape text for an XML text node. Control characters that XML 1.0
/// forbids are dropped.
fn xml_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\t' | '\n' | '\r' => out.push(ch),
            c if (c as u32) < 0x20 => {}
            c => out.push(c),
        }
    }
    out
}

/// Spreadsheet column letters: 0 → A, 25 → Z, 26 → AA.
fn column_ref(mut index: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push((b'A' + (index % 26) as u8) as char);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.iter().rev().collect()
}

fn push_cell(xml: &mut String, col: usize, row: usize, value: &Value) {
    let cell_ref = format!("{}{row}", column_ref(col));
    match value {
        Value::Null => {}
        Value::Number(n) => xml.push_str(&format!("<c r=\"{cell_ref}\"><v>{n}</v></c>")),
        Value::String(s) => xml.push_str(&format!(
            "<c r=\"{cell_ref}\" t=\"inlineStr\"><is><t xml:space=\"preserve\">{}</t></is></c>",
            xml_escape(s)
        )),
        other => xml.push_str(&format!(
            "<c r=\"{cell_ref}\" t=\"inlineStr\"><is><t>{}</t></is></c>",
            xml_escape(&other.to_string())
        )),
    }
}

fn sheet_xml(columns: &[String], rows: &[Vec<Value>]) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );

    xml.push_str("<row r=\"1\">");
    for (col, name) in columns.iter().enumerate() {
        push_cell(&mut xml, col, 1, &Value::String(name.clone()));
    }
    xml.push_str("</row>");

    for (i, row) in rows.iter().enumerate() {
        let row_num = i + 2;
        xml.push_str(&format!("<row r=\"{row_num}\">"));
        for (col, value) in row.iter().enumerate() {
            push_cell(&mut xml, col, row_num, value);
        }
        xml.push_str("</row>");
    }

    xml.push_str("</sheetData></worksheet>");
    xml
}

fn write_workbook(path: &Path, sheet: &str) -> AppResult<()> {
    let file = fs::File::create(path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let workbook = workbook_xml();
    let parts: [(&str, &str); 5] = [
        ("[Content_Types].xml", CONTENT_TYPES_XML),
        ("_rels/.rels", ROOT_RELS_XML),
        ("xl/workbook.xml", &workbook),
        ("xl/_rels/workbook.xml.rels", WORKBOOK_RELS_XML),
        ("xl/worksheets/sheet1.xml", sheet),
    ];
    for (name, body) in parts {
        zip.start_file(name, options)?;
        zip.write_all(body.as_bytes())?;
    }
    zip.finish()?;
    Ok(())
}

/// Export the whole consumption history to `historial-<timestamp>.xlsx`.
pub fn export_history_xlsx(db: &DbState, output_dir: &Path) -> AppResult<ExportResult> {
    let (columns, rows) = {
        let conn = db.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM order_history ORDER BY recorded_at, rowid")?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let count = columns.len();
        let rows = stmt.query_map([], |row| {
            Ok((0..count).map(|i| db::row_value_at(row, i)).collect::<Vec<_>>())
        })?;
        let rows = rows.collect::<Result<Vec<_>, _>>()?;
        (columns, rows)
    };

    fs::create_dir_all(output_dir)?;
    let path = output_dir.join(format!(
        "historial-{}.xlsx",
        Utc::now().format("%Y%m%d-%H%M%S")
    ));
    write_workbook(&path, &sheet_xml(&columns, &rows))?;

    info!(path = %path.display(), rows = rows.len(), "History exported");
    Ok(ExportResult {
        path,
        rows: rows.len(),
    })
}
