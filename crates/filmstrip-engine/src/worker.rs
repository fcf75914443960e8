//! Extraction workers.
//!
//! A worker is a long-lived task that owns nothing but its request channel.
//! For each [`ExtractRequest`] it decodes frames in extraction order, encodes
//! them to WebP, writes them to the blob store with bounded concurrency and
//! reports progress back to the orchestrator after every saved frame.

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use filmstrip_av::{FrameDecoder, LazyDecoder, SeekMode};
use filmstrip_core::config::ToolsConfig;
use filmstrip_core::{frame_timestamp, Error, FrameSize, Result, SourceRef, WorkerId};
use filmstrip_store::BlobStore;
use image::{DynamicImage, ImageFormat, RgbaImage};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::protocol::{
    DecodeStrategy, ExtractRequest, SavedFrame, WorkerEvent, WorkerRequest, WorkerResponse,
};

/// The decoder behind each strategy.
#[derive(Clone)]
pub struct Decoders {
    pub fast: Arc<dyn FrameDecoder>,
    pub fallback: Arc<dyn FrameDecoder>,
}

impl Decoders {
    pub fn new(fast: Arc<dyn FrameDecoder>, fallback: Arc<dyn FrameDecoder>) -> Self {
        Self { fast, fallback }
    }

    /// ffmpeg for both strategies, discovered on first decode.
    pub fn ffmpeg(tools: &ToolsConfig) -> Self {
        Self {
            fast: Arc::new(LazyDecoder::ffmpeg(tools.clone(), SeekMode::Fast)),
            fallback: Arc::new(LazyDecoder::ffmpeg(tools.clone(), SeekMode::Accurate)),
        }
    }

    pub fn for_strategy(&self, strategy: DecodeStrategy) -> Arc<dyn FrameDecoder> {
        match strategy {
            DecodeStrategy::Fast => Arc::clone(&self.fast),
            DecodeStrategy::SeekCapture => Arc::clone(&self.fallback),
        }
    }
}

impl std::fmt::Debug for Decoders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoders")
            .field("fast", &self.fast.name())
            .field("fallback", &self.fallback.name())
            .finish()
    }
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn BlobStore>,
    pub decoders: Decoders,
}

/// Orchestrator-side handle of a running worker.
pub struct WorkerHandle {
    id: WorkerId,
    tx: mpsc::UnboundedSender<WorkerRequest>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn spawn(
        id: WorkerId,
        ctx: WorkerContext,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_worker(id, ctx, rx, events, cancel.clone()));
        tracing::debug!(worker = %id, "Spawned extraction worker");
        Self {
            id,
            tx,
            cancel,
            task,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Queue a request. Gives the request back if the worker is gone.
    pub fn send(&self, request: WorkerRequest) -> std::result::Result<(), WorkerRequest> {
        self.tx.send(request).map_err(|e| e.0)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the worker. Decodes and writes in flight are dropped.
    pub fn terminate(self) {
        self.cancel.cancel();
        self.task.abort();
        tracing::debug!(worker = %self.id, "Terminated extraction worker");
    }
}

enum ExtractOutcome {
    Completed(u32),
    Aborted,
    /// The orchestrator dropped this worker's channel.
    Closed,
}

async fn run_worker(
    id: WorkerId,
    ctx: WorkerContext,
    mut rx: mpsc::UnboundedReceiver<WorkerRequest>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    cancel: CancellationToken,
) {
    let emit = |response: WorkerResponse| {
        let _ = events.send(WorkerEvent {
            worker_id: id,
            response,
        });
    };

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let request = match request {
            WorkerRequest::Extract(request) => request,
            // Nothing in flight.
            WorkerRequest::Abort { .. } => continue,
        };

        let request_id = request.request_id;
        tracing::debug!(
            worker = %id,
            request = %request_id,
            asset_id = %request.asset_id,
            start = request.start_index,
            end = request.end_index,
            strategy = ?request.strategy,
            "Starting extraction"
        );

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = extract(&ctx, request, &mut rx, &emit) => outcome,
        };

        match outcome {
            Ok(ExtractOutcome::Completed(frame_count)) => emit(WorkerResponse::Complete {
                request_id,
                frame_count,
            }),
            Ok(ExtractOutcome::Aborted) => {
                tracing::debug!(worker = %id, request = %request_id, "Extraction aborted");
            }
            Ok(ExtractOutcome::Closed) => break,
            Err(e) => {
                tracing::debug!(worker = %id, request = %request_id, "Extraction failed: {e}");
                emit(WorkerResponse::Error {
                    request_id,
                    error: e.to_string(),
                });
            }
        }
    }

    tracing::trace!(worker = %id, "Worker loop exited");
}

async fn extract<F>(
    ctx: &WorkerContext,
    request: ExtractRequest,
    rx: &mut mpsc::UnboundedReceiver<WorkerRequest>,
    emit: &F,
) -> Result<ExtractOutcome>
where
    F: Fn(WorkerResponse),
{
    let frames = request.frames_to_extract();
    let total = frames.len();
    if total == 0 {
        return Ok(ExtractOutcome::Completed(0));
    }

    let max_writes = request.max_parallel_writes.max(1);
    let (frame_tx, mut frame_rx) = mpsc::channel(max_writes);

    // Both sets abort their tasks when dropped on an early return.
    let mut producer = JoinSet::new();
    producer.spawn(produce_frames(
        ctx.decoders.for_strategy(request.strategy),
        request.source.clone(),
        frames,
        request.frame_rate,
        request.frame_size,
        frame_tx,
    ));
    let mut writes: JoinSet<Result<(u32, Bytes)>> = JoinSet::new();

    let mut decoding = true;
    let mut saved: u32 = 0;

    while decoding || !writes.is_empty() {
        tokio::select! {
            biased;

            msg = rx.recv() => match msg {
                Some(WorkerRequest::Abort { request_id }) if request_id == request.request_id => {
                    return Ok(ExtractOutcome::Aborted);
                }
                Some(WorkerRequest::Abort { .. }) => {}
                Some(WorkerRequest::Extract(other)) => emit(WorkerResponse::Error {
                    request_id: other.request_id,
                    error: "worker is busy with another request".into(),
                }),
                None => return Ok(ExtractOutcome::Closed),
            },

            Some(joined) = writes.join_next(), if !writes.is_empty() => {
                let (index, bytes) = joined
                    .map_err(|e| Error::Internal(format!("frame write task failed: {e}")))??;
                saved += 1;
                let saved_frames = if request.inline_frame_bytes {
                    vec![SavedFrame { index, bytes }]
                } else {
                    Vec::new()
                };
                emit(WorkerResponse::Progress {
                    request_id: request.request_id,
                    frame_index: index,
                    frame_count: saved,
                    progress: ((saved as usize * 99) / total) as u8,
                    saved_frames,
                    saved_indices: vec![index],
                });
            }

            next = frame_rx.recv(), if decoding && writes.len() < max_writes => match next {
                Some(Ok((index, bytes))) => {
                    let store = Arc::clone(&ctx.store);
                    let asset = request.asset_id.clone();
                    writes.spawn(async move {
                        store.write_frame(&asset, index, bytes.clone()).await?;
                        Ok((index, bytes))
                    });
                }
                Some(Err(e)) => return Err(e),
                None => decoding = false,
            },
        }
    }

    Ok(ExtractOutcome::Completed(saved))
}

/// Decode and encode frames in order, stopping at the first failure.
async fn produce_frames(
    decoder: Arc<dyn FrameDecoder>,
    source: SourceRef,
    frames: Vec<u32>,
    frame_rate: f64,
    size: FrameSize,
    tx: mpsc::Sender<Result<(u32, Bytes)>>,
) {
    for index in frames {
        let timestamp = frame_timestamp(index, frame_rate);
        let result = match decoder.decode(&source, timestamp, size).await {
            Ok(image) => encode_webp(image).await.map(|bytes| (index, bytes)),
            Err(e) => Err(Error::from(e)),
        };
        let failed = result.is_err();
        if tx.send(result).await.is_err() || failed {
            return;
        }
    }
}

/// Encode an RGBA frame as WebP off the async threads.
pub async fn encode_webp(image: RgbaImage) -> Result<Bytes> {
    tokio::task::spawn_blocking(move || {
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::WebP)
            .map_err(|e| Error::Encode(e.to_string()))?;
        Ok(Bytes::from(buf))
    })
    .await
    .map_err(|e| Error::Internal(format!("encode task failed: {e}")))?
}
