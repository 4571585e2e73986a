#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{Cursor, Write};
use std::sync::Mutex;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use tsetmc_ingest::domain::{EntityId, FetchRequest};
use tsetmc_ingest::pipeline::{ProgressEvent, ProgressSink};
use tsetmc_ingest::retrieval::{
    CancellationToken, RemoteResponse, RemoteSource, RetryPolicy, TransportError,
};

pub const HEADER: [&str; 10] = [
    "نماد",
    "تعداد",
    "حجم",
    "ارزش",
    "دیروز",
    "اولین",
    "بیشترین",
    "کمترین",
    "آخرین معامله - مقدار",
    "قیمت پایانی - مقدار",
];

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

pub fn entity(id: &str) -> EntityId {
    id.parse().unwrap()
}

pub fn request(id: &str, day: NaiveDate) -> FetchRequest {
    FetchRequest::new(entity(id), day)
}

pub fn utf8_dir(dir: &tempfile::TempDir, name: &str) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().join(name)).unwrap()
}

/// Millisecond-scale retry policy for tests.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        rate_limit_pause: Duration::from_millis(20),
        max_total: Duration::from_secs(10),
    }
}

/// One market-watch row.
#[derive(Debug, Clone)]
pub struct Quote {
    pub entity: String,
    pub trades: u64,
    pub volume: u64,
    pub value: f64,
    pub prev_close: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub last: f64,
    pub close: f64,
}

impl Quote {
    pub fn new(entity: &str, open: f64, close: f64) -> Self {
        Self {
            entity: entity.to_string(),
            trades: 1_250,
            volume: 3_400_000,
            value: 4.25e10,
            prev_close: open,
            open,
            high: open.max(close) + 10.0,
            low: open.min(close) - 10.0,
            last: close,
            close,
        }
    }

    pub fn activity(mut self, trades: u64, volume: u64, value: f64) -> Self {
        self.trades = trades;
        self.volume = volume;
        self.value = value;
        self
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.entity.clone(),
            self.trades.to_string(),
            self.volume.to_string(),
            self.value.to_string(),
            self.prev_close.to_string(),
            self.open.to_string(),
            self.high.to_string(),
            self.low.to_string(),
            self.last.to_string(),
            self.close.to_string(),
        ]
    }
}

fn title_row() -> Vec<String> {
    vec!["دیده بان بازار".to_string()]
}

/// Portal CSV export: a title row, then the header, then one row per quote.
pub fn csv_payload(quotes: &[Quote]) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(&title_row().join(","));
    out.push('\n');
    out.push_str(&HEADER.join(","));
    out.push('\n');
    for quote in quotes {
        out.push_str(&quote.cells().join(","));
        out.push('\n');
    }
    out.into_bytes()
}

pub fn html_payload(quotes: &[Quote]) -> Vec<u8> {
    let row = |tag: &str, cells: Vec<String>| {
        let cells: String = cells
            .iter()
            .map(|cell| format!("<{tag}>{cell}</{tag}>"))
            .collect();
        format!("<tr>{cells}</tr>\n")
    };
    let mut out = String::from("<html><body><table>\n");
    out.push_str(&row("td", title_row()));
    out.push_str(&row("th", HEADER.iter().map(|h| h.to_string()).collect()));
    for quote in quotes {
        out.push_str(&row("td", quote.cells()));
    }
    out.push_str("</table></body></html>\n");
    out.into_bytes()
}

/// Minimal xlsx workbook: text cells go through the shared string table,
/// numeric cells are stored inline.
pub fn xlsx_payload(quotes: &[Quote]) -> Vec<u8> {
    let mut shared: Vec<String> = Vec::new();
    let mut shared_index = |text: &str| match shared.iter().position(|s| s == text) {
        Some(index) => index,
        None => {
            shared.push(text.to_string());
            shared.len() - 1
        }
    };

    let mut rows: Vec<Vec<(bool, String)>> = Vec::new();
    rows.push(title_row().into_iter().map(|t| (true, t)).collect());
    rows.push(HEADER.iter().map(|h| (true, h.to_string())).collect());
    for quote in quotes {
        let cells = quote.cells();
        let mut row = vec![(true, cells[0].clone())];
        row.extend(cells[1..].iter().map(|c| (false, c.clone())));
        rows.push(row);
    }

    let mut sheet = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );
    for (r, row) in rows.iter().enumerate() {
        sheet.push_str(&format!(r#"<row r="{}">"#, r + 1));
        for (c, (is_text, value)) in row.iter().enumerate() {
            let reference = format!("{}{}", (b'A' + c as u8) as char, r + 1);
            if *is_text {
                let index = shared_index(value);
                sheet.push_str(&format!(r#"<c r="{reference}" t="s"><v>{index}</v></c>"#));
            } else {
                sheet.push_str(&format!(r#"<c r="{reference}"><v>{value}</v></c>"#));
            }
        }
        sheet.push_str("</row>");
    }
    sheet.push_str("</sheetData></worksheet>");

    let mut strings = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="{0}" uniqueCount="{0}">"#,
        shared.len()
    );
    for text in &shared {
        strings.push_str(&format!("<si><t>{text}</t></si>"));
    }
    strings.push_str("</sst>");

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file("[Content_Types].xml", options).unwrap();
    writer.write_all(br#"<?xml version="1.0"?><Types/>"#).unwrap();
    writer.start_file("xl/sharedStrings.xml", options).unwrap();
    writer.write_all(strings.as_bytes()).unwrap();
    writer.start_file("xl/worksheets/sheet1.xml", options).unwrap();
    writer.write_all(sheet.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

#[derive(Debug, Clone)]
pub enum Reply {
    Body(Vec<u8>),
    Status(u16),
    RateLimited(Option<Duration>),
    Transport(TransportError),
}

/// Remote source answering from per-request scripts. The last reply of a
/// script repeats; unscripted requests answer 404.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<FetchRequest, VecDeque<Reply>>>,
    calls: Mutex<Vec<FetchRequest>>,
    cancel_on_call: Option<CancellationToken>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, request: FetchRequest, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(request, replies.into_iter().collect());
        self
    }

    pub fn cancel_on_call(mut self, token: &CancellationToken) -> Self {
        self.cancel_on_call = Some(token.clone());
        self
    }

    pub fn calls(&self) -> Vec<FetchRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, request: &FetchRequest) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| *call == request)
            .count()
    }
}

impl RemoteSource for ScriptedSource {
    fn get(&self, request: &FetchRequest) -> Result<RemoteResponse, TransportError> {
        self.calls.lock().unwrap().push(request.clone());
        if let Some(token) = &self.cancel_on_call {
            token.cancel();
        }

        let reply = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(request) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        let url = format!("mock://{}/{}", request.entity, request.date);
        let response = |status: u16, retry_after: Option<Duration>, body: Vec<u8>| RemoteResponse {
            status,
            retry_after,
            body,
            url: url.clone(),
        };
        match reply {
            Some(Reply::Body(body)) => Ok(response(200, None, body)),
            Some(Reply::Status(status)) => Ok(response(status, None, Vec::new())),
            Some(Reply::RateLimited(retry_after)) => Ok(response(429, retry_after, Vec::new())),
            Some(Reply::Transport(err)) => Err(err),
            None => Ok(response(404, None, Vec::new())),
        }
    }
}

/// Collects progress messages in memory.
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.message.clone())
            .collect()
    }
}

impl ProgressSink for RecordingProgress {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}
