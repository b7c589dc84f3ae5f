//! WARC capture files
//!
//! Executors write every fetched response as a WARC `response` record behind
//! a leading `warcinfo` record, both built and written with the `warc` crate.
//! Reading goes through the `warc` crate with a
//! position-tracking reader, so each record's byte range is known for the
//! index.

use crate::StrataError;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use warc::{BufferedBody, Record, RecordBuilder, RecordType, WarcHeader, WarcReader, WarcWriter};

/// One HTTP exchange to be written to a capture file
#[derive(Debug, Clone)]
pub struct HttpCapture {
    pub url: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

/// Appends WARC records to a capture file
pub struct CaptureWriter {
    out: WarcWriter<BufWriter<File>>,
    path: PathBuf,
    bytes_written: u64,
    records: u32,
}

impl CaptureWriter {
    /// Creates the capture file and writes its `warcinfo` record
    ///
    /// # Arguments
    ///
    /// * `path` - Destination file; it must not exist yet
    /// * `software` - Value recorded as the producing software
    pub fn create(path: &Path, software: &str) -> Result<Self, StrataError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;

        let mut writer = Self {
            out: WarcWriter::new(BufWriter::new(file)),
            path: path.to_path_buf(),
            bytes_written: 0,
            records: 0,
        };

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let info = format!(
            "software: {}\r\nformat: WARC File Format 1.0\r\n",
            software
        );
        let record = RecordBuilder::default()
            .warc_type(RecordType::WarcInfo)
            .date(Utc::now())
            .header(WarcHeader::Filename, filename)
            .header(WarcHeader::ContentType, "application/warc-fields")
            .body(info.into_bytes())
            .build()?;
        writer.write_record(&record)?;

        Ok(writer)
    }

    /// Writes one HTTP response as a `response` record
    ///
    /// # Returns
    ///
    /// The number of bytes the record occupies in the file
    pub fn write_response(&mut self, capture: &HttpCapture) -> Result<u64, StrataError> {
        let mut block = format!(
            "HTTP/1.1 {} {}\r\n",
            capture.status,
            capture.reason.trim()
        );
        for (name, value) in &capture.headers {
            block.push_str(&format!("{}: {}\r\n", name, value));
        }
        block.push_str("\r\n");

        let mut bytes = block.into_bytes();
        bytes.extend_from_slice(&capture.body);

        let record = RecordBuilder::default()
            .warc_type(RecordType::Response)
            .date(capture.captured_at)
            .header(WarcHeader::TargetURI, capture.url.as_str())
            .header(WarcHeader::ContentType, "application/http; msgtype=response")
            .header(WarcHeader::PayloadDigest, sha256_digest(&capture.body))
            .header(WarcHeader::BlockDigest, sha256_digest(&bytes))
            .body(bytes)
            .build()?;
        self.write_record(&record)
    }

    fn write_record(&mut self, record: &Record<BufferedBody>) -> Result<u64, StrataError> {
        let written = self.out.write(record)? as u64;
        self.bytes_written += written;
        self.records += 1;
        Ok(written)
    }

    /// Number of records written so far, including `warcinfo`
    pub fn record_count(&self) -> u32 {
        self.records
    }

    /// Total bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flushes the file and returns its path
    pub fn finish(self) -> Result<PathBuf, StrataError> {
        let file = self
            .out
            .into_inner()
            .map_err(|e| StrataError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(self.path)
    }
}

fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// A `response` record read back from a capture file
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub url: String,
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Raw `WARC-Date` value
    pub warc_date: Option<String>,
    pub payload_digest: Option<String>,
    /// Byte offset of the record within the file
    pub offset: u64,
    /// Length of the record in bytes, including its trailing separator
    pub length: u64,
}

impl CapturedResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// MIME type without parameters
    pub fn mime_type(&self) -> Option<String> {
        self.header("content-type")
            .and_then(|ct| ct.split(';').next())
            .map(|mt| mt.trim().to_lowercase())
            .filter(|mt| !mt.is_empty())
    }

    pub fn charset(&self) -> Option<String> {
        self.header("content-type")?
            .split(';')
            .skip(1)
            .filter_map(|p| p.split_once('='))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("charset"))
            .map(|(_, v)| v.trim().trim_matches('"').to_lowercase())
    }

    pub fn location(&self) -> Option<String> {
        self.header("location").map(str::to_string)
    }

    pub fn is_html(&self) -> bool {
        self.mime_type()
            .map(|mt| mt == "text/html" || mt == "application/xhtml+xml")
            .unwrap_or(false)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, Some(200..=299))
    }

    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        self.warc_date
            .as_deref()
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
            .map(|d| d.with_timezone(&Utc))
    }
}

/// A BufReader wrapper that counts consumed bytes
struct PositionTrackingReader<R> {
    inner: BufReader<R>,
    position: Arc<AtomicU64>,
}

impl<R: Read> PositionTrackingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            position: Arc::new(AtomicU64::new(0)),
        }
    }

    fn position_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.position)
    }
}

impl<R: Read> Read for PositionTrackingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

impl<R: Read> BufRead for PositionTrackingReader<R> {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.position.fetch_add(amt as u64, Ordering::Relaxed);
        self.inner.consume(amt)
    }
}

/// Reads every `response` record of a capture file
///
/// # Returns
///
/// * `Ok(Vec<CapturedResponse>)` - Responses in file order
/// * `Err(StrataError::Warc)` - The file is not a readable WARC
pub fn read_captures(path: &Path) -> Result<Vec<CapturedResponse>, StrataError> {
    let file = File::open(path)?;
    let reader = PositionTrackingReader::new(file);
    let tracker = reader.position_handle();
    let reader = WarcReader::new(reader);

    let mut captures = Vec::new();
    let mut record_start = 0u64;

    for record_result in reader.iter_records() {
        let record = record_result
            .map_err(|e| StrataError::Warc(format!("{}: {}", path.display(), e)))?;
        let record_end = tracker.load(Ordering::Relaxed);
        let offset = record_start;
        record_start = record_end;

        if record.header(WarcHeader::WarcType).as_deref() != Some("response") {
            continue;
        }
        let Some(url) = record.header(WarcHeader::TargetURI).map(|u| u.to_string()) else {
            continue;
        };

        let (status, headers, body) = split_http_response(record.body());
        captures.push(CapturedResponse {
            url,
            status,
            headers,
            body: body.to_vec(),
            warc_date: record.header(WarcHeader::Date).map(|d| d.to_string()),
            payload_digest: record
                .header(WarcHeader::PayloadDigest)
                .map(|d| d.to_string()),
            offset,
            length: record_end - offset,
        });
    }

    Ok(captures)
}

/// Splits an HTTP response block into status, headers, and payload
fn split_http_response(data: &[u8]) -> (Option<u16>, Vec<(String, String)>, &[u8]) {
    let separator = b"\r\n\r\n";
    let Some(sep_pos) = data.windows(separator.len()).position(|w| w == separator) else {
        return (None, Vec::new(), data);
    };

    let head = String::from_utf8_lossy(&data[..sep_pos]);
    let body = &data[sep_pos + separator.len()..];
    let mut lines = head.lines();

    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok());

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    (status, headers, body)
}
