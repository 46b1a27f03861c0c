use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::select;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::detection::DetectionEngine;
use crate::error::{ScanError, StorageError};
use crate::events::{FilterMode, Outcome, Page, PhotoRef, PipelineEvent, ProcessedImage};
use crate::index::PhotoIndex;
use crate::tasks::loader::{RasterSource, load_blocking};
use crate::tasks::pages;

pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Items of one page that may be loading or detecting at the same time.
///
/// Each in-flight item holds a decoded raster, so this also bounds peak memory.
pub const ITEM_CONCURRENCY: usize = 2;

/// Page source → loader → detector, emitting only photos with faces.
#[derive(Clone)]
pub struct Pipeline {
    index: Arc<dyn PhotoIndex>,
    loader: Arc<dyn RasterSource>,
    engine: Arc<DetectionEngine>,
    batch_size: usize,
}

impl Pipeline {
    pub fn new(
        index: Arc<dyn PhotoIndex>,
        loader: impl RasterSource + 'static,
        engine: Arc<DetectionEngine>,
    ) -> Self {
        Self {
            index,
            loader: Arc::new(loader),
            engine,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn engine(&self) -> &Arc<DetectionEngine> {
        &self.engine
    }

    /// Stream of faces-found outcomes starting at row `start`.
    ///
    /// Per-item failures never reach the stream; a storage failure ends it with
    /// a single `Err`. Must be called from within a tokio runtime.
    pub fn run(&self, start: usize, filter: FilterMode, cancel: CancellationToken) -> OutcomeStream {
        OutcomeStream {
            events: self.run_events(start, filter, cancel),
        }
    }

    /// Like [`Pipeline::run`], but also reports each completed page.
    pub fn run_events(
        &self,
        start: usize,
        filter: FilterMode,
        cancel: CancellationToken,
    ) -> EventStream {
        let cancel = cancel.child_token();
        let (tx, rx) = mpsc::channel::<PipelineEvent>(4);
        tokio::spawn(drive(self.clone(), filter, start, tx, cancel.clone()));
        EventStream { rx, cancel }
    }
}

/// Pipeline events; dropping the stream cancels the scan behind it.
pub struct EventStream {
    rx: Receiver<PipelineEvent>,
    cancel: CancellationToken,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for EventStream {
    type Item = PipelineEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Faces-found outcomes only.
pub struct OutcomeStream {
    events: EventStream,
}

impl OutcomeStream {
    pub async fn recv(&mut self) -> Option<Result<Outcome, ScanError>> {
        loop {
            match self.events.recv().await? {
                PipelineEvent::Found(outcome) => return Some(Ok(outcome)),
                PipelineEvent::Failed(err) => return Some(Err(err)),
                PipelineEvent::PageCommitted { .. } => continue,
            }
        }
    }

    pub fn cancel(&self) {
        self.events.cancel();
    }
}

impl Stream for OutcomeStream {
    type Item = Result<Outcome, ScanError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.events).poll_next(cx) {
                Poll::Ready(Some(PipelineEvent::Found(outcome))) => {
                    return Poll::Ready(Some(Ok(outcome)));
                }
                Poll::Ready(Some(PipelineEvent::Failed(err))) => return Poll::Ready(Some(Err(err))),
                Poll::Ready(Some(PipelineEvent::PageCommitted { .. })) => continue,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[instrument(skip(pipeline, tx, cancel), fields(batch_size = pipeline.batch_size))]
async fn drive(
    pipeline: Pipeline,
    filter: FilterMode,
    start: usize,
    tx: Sender<PipelineEvent>,
    cancel: CancellationToken,
) {
    // Capacity 1: the producer reads a page only after the previous one is taken.
    let (page_tx, mut page_rx) = mpsc::channel::<Result<Page, StorageError>>(1);
    let producer = tokio::spawn(pages::run(
        Arc::clone(&pipeline.index),
        filter,
        pipeline.batch_size,
        start,
        page_tx,
        cancel.clone(),
    ));

    let mut found = 0usize;
    loop {
        let next = select! {
            _ = cancel.cancelled() => {
                debug!("cancel received; abandoning scan");
                break;
            }
            next = page_rx.recv() => next,
        };
        match next {
            None => break,
            Some(Err(err)) => {
                warn!("scan failed: {err}");
                let _ = tx.send(PipelineEvent::Failed(err.into())).await;
                break;
            }
            Some(Ok(page)) => {
                let has_more = page.has_more;
                let next_index = page.next_cursor;
                match process_page(&pipeline, page, &tx, &cancel).await {
                    Some(n) => found += n,
                    None => break,
                }
                let committed = PipelineEvent::PageCommitted {
                    has_more,
                    next_index,
                };
                if tx.send(committed).await.is_err() {
                    break;
                }
            }
        }
    }

    drop(page_rx);
    match producer.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("page producer failed: {err:#}"),
        Err(err) if err.is_cancelled() => {}
        Err(err) => {
            let _ = tx
                .send(PipelineEvent::Failed(ScanError::Worker(err.to_string())))
                .await;
        }
    }
    info!(found, "scan stream finished");
}

/// Run every item of `page` with at most [`ITEM_CONCURRENCY`] in flight.
///
/// Returns the number of outcomes emitted, or `None` when the scan was
/// cancelled or the consumer went away.
async fn process_page(
    pipeline: &Pipeline,
    page: Page,
    tx: &Sender<PipelineEvent>,
    cancel: &CancellationToken,
) -> Option<usize> {
    let Page {
        items,
        has_more,
        next_cursor,
    } = page;
    let total = items.len();
    let mut pending = items.into_iter();
    let mut tasks: JoinSet<Option<ProcessedImage>> = JoinSet::new();
    let mut emitted = 0usize;

    loop {
        while tasks.len() < ITEM_CONCURRENCY {
            let Some(photo) = pending.next() else {
                break;
            };
            tasks.spawn(process_item(
                photo,
                Arc::clone(&pipeline.loader),
                Arc::clone(&pipeline.engine),
            ));
        }

        let joined = select! {
            _ = cancel.cancelled() => return None,
            joined = tasks.join_next() => joined,
        };
        let Some(joined) = joined else {
            break;
        };
        match joined {
            Ok(Some(image)) => {
                let outcome = Outcome {
                    image,
                    has_more,
                    next_index: next_cursor,
                };
                let sent = select! {
                    _ = cancel.cancelled() => return None,
                    sent = tx.send(PipelineEvent::Found(outcome)) => sent,
                };
                if sent.is_err() {
                    return None;
                }
                emitted += 1;
            }
            Ok(None) => {}
            Err(err) => warn!("photo worker failed: {err}"),
        }
    }

    debug!(total, emitted, next_cursor, "page processed");
    Some(emitted)
}

async fn process_item(
    photo: PhotoRef,
    loader: Arc<dyn RasterSource>,
    engine: Arc<DetectionEngine>,
) -> Option<ProcessedImage> {
    let raster = match load_blocking(loader, photo.locator.clone()).await {
        Ok(raster) => raster,
        Err(err) => {
            debug!(photo = %photo.display_name, "skipping unreadable photo: {err}");
            return None;
        }
    };

    let (raster, detected) = tokio::task::spawn_blocking(move || {
        let detected = engine.detect(&raster);
        (raster, detected)
    })
    .await
    .ok()?;

    let regions = match detected {
        Ok(Some(regions)) => regions,
        Ok(None) => {
            debug!(photo = %photo.display_name, "detector not available");
            Vec::new()
        }
        Err(err) => {
            warn!(photo = %photo.display_name, "detection failed: {err}");
            Vec::new()
        }
    };
    if regions.is_empty() {
        debug!(photo = %photo.display_name, "no faces");
        return None;
    }

    debug!(photo = %photo.display_name, faces = regions.len(), "faces found");
    Some(ProcessedImage {
        aspect_ratio: raster.aspect_ratio(),
        face_count: regions.len(),
        regions: Some(regions),
        raster: Arc::new(raster),
        photo,
    })
}
