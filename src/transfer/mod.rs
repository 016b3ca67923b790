//! File transfer engine: framing, chunk encryption, queueing, pacing and
//! reassembly over an open data channel.

pub mod crypto;
mod engine;
pub mod progress;
pub mod wire;

use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

pub use crypto::Role;
pub use engine::{TransferEngine, TransferHandle};
pub use progress::{Direction, ProgressReport};
pub use wire::{FileInfo, QueueInfo, BUFFER_FULL, BUFFER_LOW, CHUNK_SIZE};

/// Byte source for an outbound file.
#[derive(Debug, Clone)]
pub enum FileContent {
    Memory(Bytes),
    Disk(PathBuf),
}

/// A file queued for sending. The engine assigns the wire ID and computes
/// chunk counts when the batch is submitted.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    /// MIME type; possibly empty.
    pub mime: String,
    /// Relative path within a selected folder, when sending a tree.
    pub relative_path: Option<String>,
    pub content: FileContent,
}

impl OutgoingFile {
    pub fn from_bytes(name: impl Into<String>, mime: impl Into<String>, bytes: Bytes) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            relative_path: None,
            content: FileContent::Memory(bytes),
        }
    }

    /// Build from a path on disk, guessing the MIME type from the extension.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let mime = mime_guess::from_path(&path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Self {
            name,
            mime,
            relative_path: None,
            content: FileContent::Disk(path),
        }
    }

    pub fn with_relative_path(mut self, path: impl Into<String>) -> Self {
        self.relative_path = Some(path.into());
        self
    }
}

/// A fully reassembled inbound file.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub id: String,
    pub name: String,
    /// MIME type declared by the sender; possibly empty.
    pub mime: String,
    pub relative_path: Option<String>,
    pub bytes: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl ReceivedFile {
    /// Sender-supplied names are untrusted; strip any directory components
    /// before touching the filesystem with them.
    pub fn sanitized_name(&self) -> String {
        sanitize_file_name(&self.name)
    }
}

pub(crate) fn sanitize_file_name(name: &str) -> String {
    let candidate = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let trimmed = candidate.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Events surfaced by the engine.
#[derive(Debug)]
pub enum TransferEvent {
    /// Key exchange finished; FILE_* traffic may flow.
    Ready,
    /// The peer announced a batch.
    IncomingQueue(QueueInfo),
    /// The peer offers a file. Reply on `decision`; dropping it declines.
    /// While one offer is outstanding, further offers are auto-rejected.
    IncomingFile {
        info: FileInfo,
        decision: oneshot::Sender<bool>,
    },
    Progress(ProgressReport),
    /// All chunks of an outbound file were handed to the transport.
    FileSent { file_id: String },
    /// Every file in the submitted batch completed.
    BatchSent,
    FileReceived(ReceivedFile),
    /// A chunk failed to decrypt or carried an out-of-range index. The
    /// session stays up; the affected file will fail to assemble.
    ChunkError {
        file_id: String,
        chunk_index: u32,
        reason: String,
    },
    TransferError(String),
    /// The data channel closed; all in-flight state was discarded.
    Closed,
}
