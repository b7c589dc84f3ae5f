//! Archive module: captures, artifacts, index, and versioned snapshots
//!
//! This module contains:
//! - WARC capture writing and reading
//! - Content extraction and fingerprints for change detection
//! - Durable artifact storage
//! - The CDX index over stored artifacts
//! - Snapshot building and the per-job pipeline

mod content;
mod index;
mod pipeline;
mod snapshot;
mod store;
mod warc;

pub use content::{sha256_hex, PageContent, SiteContent};
pub use index::{
    build_entries, index_artifact, lookup, snapshot_urls, write_cdx_file, CdxEntry, CDX_HEADER,
};
pub use pipeline::{ArchivePipeline, JobOutcome};
pub(crate) use pipeline::signalled;
pub use snapshot::{BuiltSnapshot, CaptureSummary, SnapshotBuilder, SnapshotChain};
pub use store::{artifact_filename, hash_file, ArtifactStore, LocalArtifactStore, StorageMetadata};
pub use warc::{read_captures, CaptureWriter, CapturedResponse, HttpCapture};
