//! Capture index (CDX) records
//!
//! Each successful capture gets one record keyed by its canonical URL key and
//! capture time, pointing at the byte range of its WARC record.

use crate::archive::warc::{read_captures, CapturedResponse};
use crate::storage::{IndexRecord, Storage};
use crate::url::{cdx_timestamp, url_key};
use crate::StrataError;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Header line of a `.cdx` file
pub const CDX_HEADER: &str = " CDX N b a m s k r S V g";

/// One index record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdxEntry {
    pub url_key: String,
    /// 14-digit capture timestamp
    pub timestamp: String,
    pub original_url: String,
    pub mime_type: Option<String>,
    pub status_code: Option<u16>,
    pub digest: Option<String>,
    pub redirect_url: Option<String>,
    /// Name of the artifact holding the record
    pub filename: String,
    pub offset: u64,
    pub length: u64,
    pub content_length: Option<u64>,
    pub charset: Option<String>,
}

impl CdxEntry {
    /// Builds the entry for one captured response
    ///
    /// `fallback_time` is used when the record carries no readable date.
    pub fn from_capture(
        capture: &CapturedResponse,
        filename: &str,
        fallback_time: &DateTime<Utc>,
    ) -> Self {
        let captured_at = capture.captured_at().unwrap_or(*fallback_time);
        Self {
            url_key: url_key(&capture.url),
            timestamp: cdx_timestamp(&captured_at),
            original_url: capture.url.clone(),
            mime_type: capture.mime_type(),
            status_code: capture.status,
            digest: capture.payload_digest.clone(),
            redirect_url: capture.location(),
            filename: filename.to_string(),
            offset: capture.offset,
            length: capture.length,
            content_length: Some(capture.body.len() as u64),
            charset: capture.charset(),
        }
    }

    /// Renders the entry as one `.cdx` line
    pub fn to_cdx_line(&self) -> String {
        fn or_dash(v: Option<&str>) -> &str {
            v.filter(|s| !s.is_empty()).unwrap_or("-")
        }
        format!(
            "{} {} {} {} {} {} {} {} {} {}",
            self.url_key,
            self.timestamp,
            self.original_url,
            or_dash(self.mime_type.as_deref()),
            self.status_code
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
            or_dash(self.digest.as_deref()),
            or_dash(self.redirect_url.as_deref()),
            self.length,
            self.offset,
            self.filename
        )
    }
}

/// Builds index entries for every capture in an artifact
///
/// Repeated `(url_key, timestamp)` pairs keep their first record.
///
/// # Arguments
///
/// * `captures` - Responses read back from the artifact
/// * `filename` - Artifact filename recorded on every entry
/// * `fallback_time` - Capture time used for records without a date
pub fn build_entries(
    captures: &[CapturedResponse],
    filename: &str,
    fallback_time: &DateTime<Utc>,
) -> Vec<CdxEntry> {
    let mut seen = HashSet::new();
    captures
        .iter()
        .map(|c| CdxEntry::from_capture(c, filename, fallback_time))
        .filter(|e| seen.insert((e.url_key.clone(), e.timestamp.clone())))
        .collect()
}

/// Reads an artifact and builds its index entries
pub fn index_artifact(
    artifact_path: &Path,
    fallback_time: &DateTime<Utc>,
) -> Result<Vec<CdxEntry>, StrataError> {
    let filename = artifact_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| StrataError::Artifact(format!("{} has no filename", artifact_path.display())))?;
    let captures = read_captures(artifact_path)?;
    Ok(build_entries(&captures, &filename, fallback_time))
}

/// Writes a sorted `.cdx` file next to the artifact
///
/// # Returns
///
/// The path of the written index file
pub fn write_cdx_file(artifact_path: &Path, entries: &[CdxEntry]) -> Result<PathBuf, StrataError> {
    let mut cdx_path = artifact_path.as_os_str().to_owned();
    cdx_path.push(".cdx");
    let cdx_path = PathBuf::from(cdx_path);

    let mut lines: Vec<String> = entries.iter().map(CdxEntry::to_cdx_line).collect();
    lines.sort();

    let mut file = std::fs::File::create(&cdx_path)?;
    writeln!(file, "{}", CDX_HEADER)?;
    for line in lines {
        writeln!(file, "{}", line)?;
    }
    file.sync_all()?;

    Ok(cdx_path)
}

/// Finds the capture of `url` that was current at `at`
///
/// The URL is canonicalized first, so `http://www.example.com/` and
/// `https://example.com/` find the same records.
///
/// # Arguments
///
/// * `storage` - Database holding the index
/// * `url` - Any form of the captured URL
/// * `snapshot_id` - Restrict the search to one snapshot
/// * `at` - Latest acceptable capture time; `None` means the newest capture
pub fn lookup(
    storage: &dyn Storage,
    url: &str,
    snapshot_id: Option<i64>,
    at: Option<&DateTime<Utc>>,
) -> Result<Option<IndexRecord>, StrataError> {
    let bound = at.map(cdx_timestamp);
    Ok(storage.lookup_index(&url_key(url), snapshot_id, bound.as_deref())?)
}

/// Lists the distinct URLs captured in a snapshot, sorted
pub fn snapshot_urls(storage: &dyn Storage, snapshot_id: i64) -> Result<Vec<String>, StrataError> {
    let urls: BTreeSet<String> = storage
        .index_records_for_snapshot(snapshot_id)?
        .into_iter()
        .map(|record| record.entry.original_url)
        .collect();
    Ok(urls.into_iter().collect())
}
