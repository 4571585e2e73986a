//! Payload layouts and their parsers. Each parser yields a [`RawTable`]: rows of
//! trimmed cell text, with no interpretation of headers or values.

use std::fmt;
use std::io::{Cursor, Read};
use std::sync::OnceLock;

use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;
use serde::Serialize;
use zip::ZipArchive;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE2_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0];
const SNIFF_BYTES: usize = 4096;
const MAX_XML_ENTRY_BYTES: u64 = 64 * 1024 * 1024;
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
/// Column `XFD`, the widest sheet a workbook can declare.
const MAX_COLUMN: usize = 16_383;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadLayout {
    Xlsx,
    HtmlTable,
    Delimited,
}

impl fmt::Display for PayloadLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadLayout::Xlsx => write!(f, "xlsx"),
            PayloadLayout::HtmlTable => write!(f, "html-table"),
            PayloadLayout::Delimited => write!(f, "delimited"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTable {
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn is_blank_row(row: &[String]) -> bool {
        row.iter().all(|cell| cell.trim().is_empty())
    }
}

/// Inspect the leading bytes. `Err` carries a reason the payload is unusable.
pub fn detect(bytes: &[u8]) -> Result<PayloadLayout, String> {
    if bytes.starts_with(ZIP_MAGIC) {
        return Ok(PayloadLayout::Xlsx);
    }
    if bytes.starts_with(OLE2_MAGIC) {
        return Err("binary (OLE2) spreadsheets are not supported".to_string());
    }
    let head = &bytes[..bytes.len().min(SNIFF_BYTES)];
    let head = head.strip_prefix(UTF8_BOM).unwrap_or(head);
    let lowered = String::from_utf8_lossy(head).to_ascii_lowercase();
    if lowered.contains("<table") || lowered.contains("<html") {
        return Ok(PayloadLayout::HtmlTable);
    }
    let text = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    if std::str::from_utf8(text).is_ok() {
        return Ok(PayloadLayout::Delimited);
    }
    Err("payload is neither a spreadsheet, an HTML table nor UTF-8 text".to_string())
}

pub fn parse(layout: PayloadLayout, bytes: &[u8]) -> Result<RawTable, String> {
    match layout {
        PayloadLayout::Xlsx => parse_xlsx(bytes),
        PayloadLayout::HtmlTable => parse_html(bytes),
        PayloadLayout::Delimited => parse_delimited(bytes),
    }
}

fn read_zip_entry(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<Vec<u8>, String> {
    let entry = archive.by_name(name).map_err(|err| format!("{name}: {err}"))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|err| format!("{name}: {err}"))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(format!("{name} exceeds {MAX_XML_ENTRY_BYTES} bytes"));
    }
    Ok(out)
}

/// First worksheet of an xlsx workbook.
fn parse_xlsx(bytes: &[u8]) -> Result<RawTable, String> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|err| err.to_string())?;
    let shared_strings = if archive.index_for_name("xl/sharedStrings.xml").is_some() {
        read_shared_strings(&read_zip_entry(&mut archive, "xl/sharedStrings.xml")?)?
    } else {
        Vec::new()
    };

    let mut sheets: Vec<String> = archive
        .file_names()
        .filter(|name| name.starts_with("xl/worksheets/sheet") && name.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    sheets.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    let first = sheets.first().ok_or("workbook has no worksheets")?;
    let sheet_xml = read_zip_entry(&mut archive, first)?;
    read_sheet(&sheet_xml, &shared_strings)
}

fn read_shared_strings(xml: &[u8]) -> Result<Vec<String>, String> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    let mut in_phonetic = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"rPh" => in_phonetic = true,
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t && !in_phonetic => {
                if let Some(current) = current.as_mut() {
                    current.push_str(&te.unescape().map_err(|err| err.to_string())?);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"rPh" => in_phonetic = false,
                b"si" => strings.push(current.take().unwrap_or_default().trim().to_string()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => return Err(format!("sharedStrings.xml: {err}")),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CellType {
    Number,
    Shared,
    Inline,
    Other,
}

fn read_sheet(xml: &[u8], shared_strings: &[String]) -> Result<RawTable, String> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut table = RawTable::default();
    let mut row: Option<Vec<String>> = None;
    let mut column = 0usize;
    let mut cell_type = CellType::Number;
    let mut value = String::new();
    let mut in_value = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row = Some(Vec::new()),
                b"c" => {
                    value.clear();
                    cell_type = CellType::Number;
                    column = row.as_ref().map_or(0, Vec::len);
                    for attr in e.attributes().flatten() {
                        match attr.key.local_name().as_ref() {
                            b"t" => {
                                cell_type = match attr.value.as_ref() {
                                    b"s" => CellType::Shared,
                                    b"inlineStr" => CellType::Inline,
                                    b"n" => CellType::Number,
                                    _ => CellType::Other,
                                }
                            }
                            b"r" => {
                                if let Some(index) = column_index(&attr.value)? {
                                    column = index;
                                }
                            }
                            _ => {}
                        }
                    }
                }
                b"v" => in_value = true,
                b"t" if cell_type == CellType::Inline => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                value.push_str(&te.unescape().map_err(|err| err.to_string())?);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let text = match cell_type {
                        CellType::Shared => value
                            .trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|index| shared_strings.get(index))
                            .cloned()
                            .ok_or_else(|| format!("dangling shared string index {value:?}"))?,
                        _ => value.trim().to_string(),
                    };
                    if let Some(row) = row.as_mut() {
                        if row.len() <= column {
                            row.resize(column + 1, String::new());
                        }
                        row[column] = text;
                    }
                }
                b"row" => {
                    if let Some(row) = row.take() {
                        table.rows.push(row);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => return Err(format!("worksheet: {err}")),
            _ => {}
        }
        buf.clear();
    }
    Ok(table)
}

/// Zero-based column of an `A1`-style reference, `None` when it has no letters.
fn column_index(reference: &[u8]) -> Result<Option<usize>, String> {
    let letters: Vec<u8> = reference
        .iter()
        .copied()
        .take_while(u8::is_ascii_alphabetic)
        .collect();
    if letters.is_empty() {
        return Ok(None);
    }
    letters
        .iter()
        .try_fold(0usize, |acc, letter| {
            acc.checked_mul(26)?
                .checked_add(usize::from(letter.to_ascii_uppercase() - b'A') + 1)
        })
        .map(|index| index - 1)
        .filter(|index| *index <= MAX_COLUMN)
        .map(Some)
        .ok_or_else(|| {
            format!(
                "cell reference out of range: {}",
                String::from_utf8_lossy(reference)
            )
        })
}

fn html_patterns() -> &'static (Regex, Regex, Regex) {
    static PATTERNS: OnceLock<(Regex, Regex, Regex)> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        (
            Regex::new(r"(?is)<tr\b[^>]*>(.*?)</tr\s*>").expect("static row pattern"),
            Regex::new(r"(?is)<t[dh]\b[^>]*>(.*?)</t[dh]\s*>").expect("static cell pattern"),
            Regex::new(r"(?s)<[^>]*>").expect("static tag pattern"),
        )
    })
}

/// Legacy `.xls` exports, which are HTML documents holding one table.
fn parse_html(bytes: &[u8]) -> Result<RawTable, String> {
    let text = String::from_utf8_lossy(bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes));
    let (row_re, cell_re, tag_re) = html_patterns();
    let rows = row_re
        .captures_iter(&text)
        .map(|row| {
            cell_re
                .captures_iter(&row[1])
                .map(|cell| decode_entities(&tag_re.replace_all(&cell[1], " ")))
                .map(|cell| cell.split_whitespace().collect::<Vec<_>>().join(" "))
                .collect::<Vec<String>>()
        })
        .collect();
    Ok(RawTable { rows })
}

fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find(';').filter(|end| *end <= 10) else {
            out.push('&');
            rest = &tail[1..];
            continue;
        };
        let entity = &tail[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(ch) => {
                out.push(ch);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// CSV-like text. The delimiter is whichever of `,`, `;` or tab is most frequent
/// on the first non-empty line.
fn parse_delimited(bytes: &[u8]) -> Result<RawTable, String> {
    let text = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let first_line = text
        .split(|byte| *byte == b'\n')
        .find(|line| !line.iter().all(u8::is_ascii_whitespace))
        .unwrap_or_default();
    let delimiter = [b'\t', b';', b',']
        .into_iter()
        .max_by_key(|delim| first_line.iter().filter(|byte| *byte == delim).count())
        .unwrap_or(b',');

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(text);
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| err.to_string())?;
        rows.push(record.iter().map(|cell| cell.trim().to_string()).collect());
    }
    Ok(RawTable { rows })
}
