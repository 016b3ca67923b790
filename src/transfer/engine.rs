//! The transfer engine proper: one task owning all receive-side state plus a
//! send worker that streams the queued batch without starving inbound
//! processing or the transport's low-watermark events.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::transport::{ChannelError, DataChannel};

use super::crypto::{ChunkOpener, ChunkSealer, CryptoError, Role, SessionKey};
use super::progress::{Direction, ProgressTracker};
use super::wire::{
    total_chunks, FileChunk, FileInfo, QueueInfo, WireMessage, BUFFER_FULL, BUFFER_LOW, CHUNK_SIZE,
};
use super::{FileContent, OutgoingFile, ReceivedFile, TransferEvent};

enum EngineCommand {
    SendBatch(Vec<OutgoingFile>),
    Shutdown,
}

/// Handle for submitting work to a running engine.
#[derive(Clone)]
pub struct TransferHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
}

impl TransferHandle {
    /// Queue an ordered batch of files. Batches run strictly serially; a
    /// rejection by the receiver cancels the remainder of its batch.
    pub fn send_files(&self, files: Vec<OutgoingFile>) {
        let _ = self.commands.send(EngineCommand::SendBatch(files));
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(EngineCommand::Shutdown);
    }
}

pub struct TransferEngine;

impl TransferEngine {
    /// Take ownership of an open data channel and start the engine.
    pub fn spawn(
        channel: Arc<dyn DataChannel>,
        role: Role,
    ) -> (TransferHandle, mpsc::UnboundedReceiver<TransferEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        channel.set_low_watermark(BUFFER_LOW);
        let engine = Engine {
            channel,
            role,
            events: event_tx,
            internal_tx,
            sealer: None,
            opener: None,
            ready: false,
            pending_batches: Vec::new(),
            worker: None,
            active_receive: None,
        };
        tokio::spawn(engine.run(command_rx, internal_rx));

        (
            TransferHandle {
                commands: command_tx,
            },
            event_rx,
        )
    }
}

/// Worker → engine notifications.
enum Internal {
    WorkerDone,
}

struct Worker {
    handle: JoinHandle<()>,
    decisions: mpsc::UnboundedSender<bool>,
}

struct ReceiveState {
    info: FileInfo,
    chunks: Vec<Option<Vec<u8>>>,
    bytes_received: u64,
    tracker: ProgressTracker,
}

struct Engine {
    channel: Arc<dyn DataChannel>,
    role: Role,
    events: mpsc::UnboundedSender<TransferEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    sealer: Option<Arc<Mutex<ChunkSealer>>>,
    opener: Option<ChunkOpener>,
    ready: bool,
    pending_batches: Vec<Vec<OutgoingFile>>,
    worker: Option<Worker>,
    active_receive: Option<ReceiveState>,
}

/// An offer the application has not answered yet. Held by the run loop so
/// further FILE_INFO frames are auto-rejected until it resolves.
struct PendingOffer {
    info: FileInfo,
    rx: oneshot::Receiver<bool>,
}

impl Engine {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<EngineCommand>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        if self.role == Role::Initiator {
            // The initiator mints the session key the moment the channel is
            // up and ships it before anything else.
            let key = SessionKey::generate();
            let frame = WireMessage::EncryptionKey(*key.as_bytes()).encode();
            if let Err(err) = self.channel.send(frame).await {
                warn!("key exchange failed: {err}");
                self.emit(TransferEvent::TransferError(format!(
                    "key exchange failed: {err}"
                )));
                self.emit(TransferEvent::Closed);
                return;
            }
            self.install_key(key);
        }

        let mut pending_offer: Option<PendingOffer> = None;
        let channel = self.channel.clone();
        loop {
            tokio::select! {
                biased;
                Some(command) = commands.recv() => match command {
                    EngineCommand::SendBatch(files) => {
                        self.pending_batches.push(files);
                        self.maybe_start_batch();
                    }
                    EngineCommand::Shutdown => {
                        self.reset(None).await;
                        self.emit(TransferEvent::Closed);
                        break;
                    }
                },
                Some(Internal::WorkerDone) = internal.recv() => {
                    self.worker = None;
                    self.maybe_start_batch();
                }
                accepted = wait_decision(&mut pending_offer), if pending_offer.is_some() => {
                    let offer = pending_offer.take().expect("guarded by is_some");
                    self.resolve_offer(offer.info, accepted).await;
                }
                frame = channel.recv() => match frame {
                    Some(frame) => {
                        if let Some(offer) = self.handle_frame(&frame, pending_offer.is_some()).await {
                            pending_offer = Some(offer);
                        }
                    }
                    None => {
                        let mid_transfer =
                            self.worker.is_some() || self.active_receive.is_some();
                        self.reset(mid_transfer.then(|| {
                            "transport closed mid-transfer, in-flight files dropped".to_string()
                        }))
                        .await;
                        self.emit(TransferEvent::Closed);
                        break;
                    }
                },
            }
        }
    }

    fn install_key(&mut self, key: SessionKey) {
        self.sealer = Some(Arc::new(Mutex::new(ChunkSealer::new(&key, self.role))));
        self.opener = Some(ChunkOpener::new(&key));
        self.ready = true;
        self.emit(TransferEvent::Ready);
        self.maybe_start_batch();
    }

    /// Handle one inbound frame. Returns a new pending offer when the peer
    /// announced a file the application must decide on.
    async fn handle_frame(&mut self, frame: &[u8], offer_pending: bool) -> Option<PendingOffer> {
        let message = match WireMessage::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!("dropping undecodable frame: {err}");
                return None;
            }
        };
        match message {
            WireMessage::EncryptionKey(bytes) => {
                if self.ready {
                    debug!("ignoring repeated encryption key");
                    return None;
                }
                info!("session key imported");
                self.install_key(SessionKey::from_bytes(bytes));
                None
            }
            WireMessage::QueueInfo(queue) => {
                self.emit(TransferEvent::IncomingQueue(queue));
                None
            }
            WireMessage::FileInfo(info) => self.handle_file_info(info, offer_pending).await,
            WireMessage::FileChunk(chunk) => {
                self.handle_chunk(chunk);
                None
            }
            WireMessage::FileComplete => {
                self.handle_complete();
                None
            }
            WireMessage::FileAccept => {
                self.forward_decision(true);
                None
            }
            WireMessage::FileReject => {
                self.forward_decision(false);
                None
            }
        }
    }

    async fn handle_file_info(
        &mut self,
        info: FileInfo,
        offer_pending: bool,
    ) -> Option<PendingOffer> {
        if !self.ready {
            warn!("file offer before key exchange, dropping");
            return None;
        }
        if offer_pending {
            // The accept prompt is serialized; anything offered while one is
            // outstanding bounces.
            info!("auto-rejecting {} while another offer is pending", info.name);
            self.send_frame(WireMessage::FileReject).await;
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.emit(TransferEvent::IncomingFile {
            info: info.clone(),
            decision: tx,
        });
        Some(PendingOffer { info, rx })
    }

    async fn resolve_offer(&mut self, info: FileInfo, accepted: bool) {
        if !accepted {
            info!("declined incoming file {}", info.name);
            self.send_frame(WireMessage::FileReject).await;
            return;
        }
        debug!(
            "accepting {} ({} bytes, {} chunks)",
            info.name, info.size, info.total_chunks
        );
        self.active_receive = Some(ReceiveState {
            chunks: vec![None; info.total_chunks as usize],
            bytes_received: 0,
            tracker: ProgressTracker::new(info.id.clone(), Direction::Receive, info.size),
            info,
        });
        self.send_frame(WireMessage::FileAccept).await;
    }

    fn handle_chunk(&mut self, chunk: FileChunk) {
        let chunk_count = match &self.active_receive {
            Some(state) if state.info.id == chunk.file_id => state.chunks.len(),
            _ => {
                warn!("chunk for unknown file {}, dropping", chunk.file_id);
                return;
            }
        };
        if chunk.chunk_index as usize >= chunk_count {
            self.emit(TransferEvent::ChunkError {
                file_id: chunk.file_id,
                chunk_index: chunk.chunk_index,
                reason: "chunk index out of range".into(),
            });
            return;
        }
        let opener = self.opener.as_ref().expect("ready implies opener");
        let plaintext = match opener.open(&chunk.iv, &chunk.ciphertext) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                self.emit(TransferEvent::ChunkError {
                    file_id: chunk.file_id,
                    chunk_index: chunk.chunk_index,
                    reason: err.to_string(),
                });
                return;
            }
        };
        let report = {
            let state = self
                .active_receive
                .as_mut()
                .expect("active receive checked above");
            state.bytes_received += plaintext.len() as u64;
            let report = state.tracker.record(plaintext.len() as u64);
            state.chunks[chunk.chunk_index as usize] = Some(plaintext);
            report
        };
        if let Some(report) = report {
            self.emit(TransferEvent::Progress(report));
        }
    }

    fn handle_complete(&mut self) {
        let state = match self.active_receive.take() {
            Some(state) => state,
            None => {
                warn!("FILE_COMPLETE without an active receive");
                return;
            }
        };
        let total = state.chunks.len();
        let mut bytes = Vec::with_capacity(state.bytes_received as usize);
        for (index, chunk) in state.chunks.into_iter().enumerate() {
            match chunk {
                Some(chunk) => bytes.extend_from_slice(&chunk),
                None => {
                    self.emit(TransferEvent::TransferError(format!(
                        "file {} incomplete: chunk {index} of {total} missing",
                        state.info.name
                    )));
                    return;
                }
            }
        }
        info!("received {} ({} bytes)", state.info.name, bytes.len());
        self.emit(TransferEvent::FileReceived(ReceivedFile {
            id: state.info.id,
            name: state.info.name,
            mime: state.info.mime,
            relative_path: state.info.path,
            bytes,
            received_at: Utc::now(),
        }));
    }

    fn forward_decision(&mut self, accepted: bool) {
        match &self.worker {
            Some(worker) => {
                let _ = worker.decisions.send(accepted);
            }
            None => warn!("accept/reject without an in-flight send"),
        }
    }

    fn maybe_start_batch(&mut self) {
        if !self.ready || self.worker.is_some() || self.pending_batches.is_empty() {
            return;
        }
        let files = self.pending_batches.remove(0);
        let (decision_tx, decision_rx) = mpsc::unbounded_channel();
        let ctx = WorkerCtx {
            channel: self.channel.clone(),
            sealer: self.sealer.clone().expect("ready implies sealer"),
            events: self.events.clone(),
            internal: self.internal_tx.clone(),
        };
        let handle = tokio::spawn(run_send_worker(ctx, files, decision_rx));
        self.worker = Some(Worker {
            handle,
            decisions: decision_tx,
        });
    }

    async fn send_frame(&self, message: WireMessage) {
        if let Err(err) = self.channel.send(message.encode()).await {
            warn!("frame send failed: {err}");
        }
    }

    /// Drop queues, reassembly and key material. `error` is surfaced first
    /// when the reset interrupts live work.
    async fn reset(&mut self, error: Option<String>) {
        if let Some(worker) = self.worker.take() {
            worker.handle.abort();
        }
        self.pending_batches.clear();
        self.active_receive = None;
        self.sealer = None;
        self.opener = None;
        self.ready = false;
        if let Some(message) = error {
            self.emit(TransferEvent::TransferError(message));
        }
        self.channel.close().await;
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}

/// Await the application's accept/reject answer. A dropped sender counts as
/// a decline.
async fn wait_decision(pending: &mut Option<PendingOffer>) -> bool {
    match pending {
        Some(offer) => (&mut offer.rx).await.unwrap_or(false),
        None => std::future::pending().await,
    }
}

// ── Send worker ──────────────────────────────────────────────────────────

struct WorkerCtx {
    channel: Arc<dyn DataChannel>,
    sealer: Arc<Mutex<ChunkSealer>>,
    events: mpsc::UnboundedSender<TransferEvent>,
    internal: mpsc::UnboundedSender<Internal>,
}

#[derive(Debug, Error)]
enum SendError {
    #[error("receiver rejected {0}, batch cancelled")]
    Rejected(String),
    #[error("transport error: {0}")]
    Channel(#[from] ChannelError),
    #[error("encryption error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("file read error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine stopped")]
    EngineGone,
}

async fn run_send_worker(
    ctx: WorkerCtx,
    files: Vec<OutgoingFile>,
    mut decisions: mpsc::UnboundedReceiver<bool>,
) {
    if let Err(err) = send_batch(&ctx, files, &mut decisions).await {
        let _ = ctx.events.send(TransferEvent::TransferError(err.to_string()));
    }
    let _ = ctx.internal.send(Internal::WorkerDone);
}

async fn send_batch(
    ctx: &WorkerCtx,
    files: Vec<OutgoingFile>,
    decisions: &mut mpsc::UnboundedReceiver<bool>,
) -> Result<(), SendError> {
    ctx.channel
        .send(
            WireMessage::QueueInfo(QueueInfo {
                total_files: files.len() as u32,
                current_index: 0,
            })
            .encode(),
        )
        .await?;

    for file in files {
        let (info, content) = describe(file).await?;
        debug!(
            "offering {} ({} bytes, {} chunks)",
            info.name, info.size, info.total_chunks
        );
        ctx.channel
            .send(WireMessage::FileInfo(info.clone()).encode())
            .await?;

        match decisions.recv().await {
            Some(true) => {}
            Some(false) => return Err(SendError::Rejected(info.name)),
            None => return Err(SendError::EngineGone),
        }

        stream_file(ctx, &info, content).await?;
        ctx.channel
            .send(WireMessage::FileComplete.encode())
            .await?;
        let _ = ctx.events.send(TransferEvent::FileSent {
            file_id: info.id.clone(),
        });
        info!("sent {} ({} bytes)", info.name, info.size);

        // Let buffered chunks drain before announcing the next file.
        tokio::join!(
            sleep(Duration::from_millis(100)),
            ctx.channel.wait_buffered_low()
        );
    }

    let _ = ctx.events.send(TransferEvent::BatchSent);
    Ok(())
}

async fn stream_file(
    ctx: &WorkerCtx,
    info: &FileInfo,
    content: FileContent,
) -> Result<(), SendError> {
    let mut tracker = ProgressTracker::new(info.id.clone(), Direction::Send, info.size);
    let mut source = ChunkSource::open(content, info.size).await?;
    for chunk_index in 0..info.total_chunks {
        if ctx.channel.buffered_amount() > BUFFER_FULL {
            ctx.channel.wait_buffered_low().await;
        }
        let plaintext = source.next_chunk().await?;
        let (iv, ciphertext) = ctx.sealer.lock().await.seal(&plaintext)?;
        let frame = WireMessage::FileChunk(FileChunk {
            chunk_index,
            file_id: info.id.clone(),
            iv,
            ciphertext,
        })
        .encode();
        ctx.channel.send(frame).await?;
        if let Some(report) = tracker.record(plaintext.len() as u64) {
            let _ = ctx.events.send(TransferEvent::Progress(report));
        }
        // Keep the loop cooperative so inbound frames and the low-watermark
        // event are never starved.
        tokio::task::yield_now().await;
    }
    Ok(())
}

async fn describe(file: OutgoingFile) -> Result<(FileInfo, FileContent), SendError> {
    let size = match &file.content {
        FileContent::Memory(bytes) => bytes.len() as u64,
        FileContent::Disk(path) => tokio::fs::metadata(path).await?.len(),
    };
    let info = FileInfo {
        id: Uuid::new_v4().to_string(),
        name: file.name,
        size,
        mime: file.mime,
        total_chunks: total_chunks(size),
        path: file.relative_path,
    };
    Ok((info, file.content))
}

/// Sequential chunk reader over either byte source.
enum ChunkSource {
    Memory { data: Bytes, offset: usize },
    Disk { file: tokio::fs::File, remaining: u64 },
}

impl ChunkSource {
    async fn open(content: FileContent, size: u64) -> Result<Self, SendError> {
        match content {
            FileContent::Memory(data) => Ok(ChunkSource::Memory { data, offset: 0 }),
            FileContent::Disk(path) => Ok(ChunkSource::Disk {
                file: tokio::fs::File::open(path).await?,
                remaining: size,
            }),
        }
    }

    async fn next_chunk(&mut self) -> Result<Vec<u8>, SendError> {
        match self {
            ChunkSource::Memory { data, offset } => {
                let end = (*offset + CHUNK_SIZE).min(data.len());
                let chunk = data[*offset..end].to_vec();
                *offset = end;
                Ok(chunk)
            }
            ChunkSource::Disk { file, remaining } => {
                let len = (*remaining).min(CHUNK_SIZE as u64) as usize;
                let mut chunk = vec![0u8; len];
                file.read_exact(&mut chunk).await?;
                *remaining -= len as u64;
                Ok(chunk)
            }
        }
    }
}
