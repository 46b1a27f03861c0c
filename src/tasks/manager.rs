use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::detection::FaceId;
use crate::events::{FilterMode, PipelineEvent, ProcessedImage};
use crate::permission::PermissionGate;
use crate::state::{ScanEvent, UiState, reduce};
use crate::tasks::pipeline::Pipeline;

/// Pagination bookkeeping, as seen from outside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCursor {
    /// First row the next scan starts from.
    pub current_index: usize,
    pub is_processing: bool,
}

/// Owns the scan cursor and the published [`UiState`].
///
/// Cloning yields another handle to the same manager. At most one scan runs
/// at a time across all handles.
#[derive(Clone)]
pub struct ScanManager {
    inner: Arc<Inner>,
}

struct Inner {
    pipeline: Pipeline,
    gate: Option<Arc<dyn PermissionGate>>,
    pages_per_scan: Option<usize>,
    state: watch::Sender<UiState>,
    has_more: watch::Sender<bool>,
    current_index: AtomicUsize,
    active: Mutex<Option<ActiveScan>>,
    next_scan: AtomicU64,
    /// Images of a scan that failed, restored when it is retried.
    retained: Mutex<Vec<ProcessedImage>>,
    last_filter: Mutex<FilterMode>,
    shutdown: CancellationToken,
}

struct ActiveScan {
    id: u64,
    filter: FilterMode,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanEnd {
    Exhausted { has_more: bool },
    Paused,
    Failed,
    Cancelled,
}

impl ScanManager {
    pub fn new(pipeline: Pipeline) -> Self {
        let (state, _) = watch::channel(UiState::Initial);
        let (has_more, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                pipeline,
                gate: None,
                pages_per_scan: None,
                state,
                has_more,
                current_index: AtomicUsize::new(0),
                active: Mutex::new(None),
                next_scan: AtomicU64::new(1),
                retained: Mutex::new(Vec::new()),
                last_filter: Mutex::new(FilterMode::All),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Consult `gate` before every scan. Must be called before the handle is cloned.
    pub fn with_gate(mut self, gate: Arc<dyn PermissionGate>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.gate = Some(gate);
        } else {
            warn!("permission gate ignored: manager already shared");
        }
        self
    }

    /// Stop each scan after this many pages; `retry` or a new scan continues.
    pub fn with_pages_per_scan(mut self, pages: Option<usize>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.pages_per_scan = pages.filter(|p| *p > 0);
        } else {
            warn!("page limit ignored: manager already shared");
        }
        self
    }

    pub fn state(&self) -> watch::Receiver<UiState> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> UiState {
        self.inner.state.borrow().clone()
    }

    pub fn has_more(&self) -> watch::Receiver<bool> {
        self.inner.has_more.subscribe()
    }

    pub fn cursor(&self) -> ScanCursor {
        ScanCursor {
            current_index: self.inner.current_index.load(Ordering::SeqCst),
            is_processing: self.is_processing(),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.inner.lock_active().is_some()
    }

    /// Start a scan from the cursor, or from row 0 when `reset`.
    ///
    /// Returns `None` without touching any state when a scan is already in
    /// flight, photo access is denied, or the manager was shut down.
    #[instrument(skip(self))]
    pub fn scan_images(&self, reset: bool, only_latest_selection: bool) -> Option<JoinHandle<()>> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            debug!("manager shut down; scan ignored");
            return None;
        }

        let requested = FilterMode::from_selection_flag(only_latest_selection);
        let filter = match &inner.gate {
            Some(gate) => {
                let Some(filter) = gate.current_state().filter(requested) else {
                    info!("photo access denied; scan not started");
                    return None;
                };
                filter
            }
            None => requested,
        };

        let (id, cancel) = {
            let mut active = inner.lock_active();
            if active.is_some() {
                debug!("scan already in flight");
                return None;
            }
            let id = inner.next_scan.fetch_add(1, Ordering::SeqCst);
            let cancel = inner.shutdown.child_token();
            *active = Some(ActiveScan {
                id,
                filter,
                cancel: cancel.clone(),
            });
            (id, cancel)
        };

        let retained = std::mem::take(&mut *inner.lock_retained());
        if reset {
            inner.state.send_modify(|state| {
                inner.current_index.store(0, Ordering::SeqCst);
                inner.has_more.send_replace(true);
                *state = reduce(state, ScanEvent::Reset);
                *state = reduce(state, ScanEvent::Started);
            });
        } else {
            let has_more = *inner.has_more.borrow();
            inner.apply(ScanEvent::Resumed {
                images: retained,
                has_more,
            });
        }
        *inner.lock_filter() = filter;
        let start = inner.current_index.load(Ordering::SeqCst);
        info!(scan = id, start, ?filter, "scan started");

        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(async move {
            let end = inner.scan(start, filter, &cancel).await;
            inner.finish(id);
            info!(
                scan = id,
                ?end,
                cursor = inner.current_index.load(Ordering::SeqCst),
                "scan finished"
            );
        }))
    }

    /// Resume from the cursor with the filter of the previous scan.
    pub fn retry(&self) -> Option<JoinHandle<()>> {
        let filter = *self.inner.lock_filter();
        self.scan_images(false, filter == FilterMode::SelectionOnly)
    }

    /// Abandon the scan in flight, if any. The cursor keeps its last committed value.
    #[instrument(skip(self))]
    pub fn cancel_scan(&self) {
        self.inner.cancel_active();
    }

    /// Restart a full-library scan in flight as a reset scan over the selection.
    ///
    /// Returns `None` when no scan, or only a selection scan, was running.
    #[instrument(skip(self))]
    pub fn narrow_to_selection(&self) -> Option<JoinHandle<()>> {
        let running_all = self
            .inner
            .lock_active()
            .as_ref()
            .is_some_and(|scan| scan.filter == FilterMode::All);
        if !running_all {
            return None;
        }
        self.inner.cancel_active();
        self.scan_images(true, true)
    }

    /// Label every detected face with identity `face`.
    #[instrument(skip(self, name))]
    pub fn update_face_name(&self, face: FaceId, name: impl Into<String>) {
        self.inner.apply(ScanEvent::Rename {
            face,
            name: name.into(),
        });
    }

    /// Cancel any running scan and release the detector. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.inner.shut_down();
    }
}

impl Inner {
    fn apply(&self, event: ScanEvent) {
        self.state.send_modify(|state| *state = reduce(state, event));
    }

    /// Apply an event from scan `cancel`, unless that scan was abandoned.
    ///
    /// The check runs under the state lock, so a scan cancelled before a new
    /// one resets the state can never write after that reset. A failure keeps
    /// the images found so far for the next non-reset scan.
    fn commit(&self, cancel: &CancellationToken, progress: Option<(usize, bool)>, event: ScanEvent) {
        self.state.send_if_modified(|state| {
            if cancel.is_cancelled() {
                return false;
            }
            if let Some((next_index, has_more)) = progress {
                self.current_index.store(next_index, Ordering::SeqCst);
                self.has_more.send_replace(has_more);
            }
            if matches!(event, ScanEvent::Failed(_)) {
                *self.lock_retained() = state.images().to_vec();
            }
            *state = reduce(state, event);
            true
        });
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveScan>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_retained(&self) -> MutexGuard<'_, Vec<ProcessedImage>> {
        self.retained
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_filter(&self) -> MutexGuard<'_, FilterMode> {
        self.last_filter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish(&self, id: u64) {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|scan| scan.id == id) {
            *active = None;
        }
    }

    /// Cancel the active scan and settle a `Loading` state it leaves behind.
    fn cancel_active(&self) {
        let mut active = self.lock_active();
        let Some(scan) = active.take() else {
            return;
        };
        scan.cancel.cancel();
        // Held until settled so a new scan cannot reset in between.
        let has_more = *self.has_more.borrow();
        self.apply(ScanEvent::Completed { has_more });
        drop(active);
        debug!(scan = scan.id, "scan cancelled");
    }

    fn shut_down(&self) {
        if !self.shutdown.is_cancelled() {
            info!("scan manager shutting down");
            self.shutdown.cancel();
        }
        self.cancel_active();
        self.pipeline.engine().close();
    }

    async fn scan(&self, start: usize, filter: FilterMode, cancel: &CancellationToken) -> ScanEnd {
        let mut events = self.pipeline.run_events(start, filter, cancel.clone());
        let mut pages = 0usize;
        let mut last_has_more = false;

        let end = loop {
            let event = select! {
                _ = cancel.cancelled() => break ScanEnd::Cancelled,
                event = events.recv() => event,
            };
            match event {
                None => break ScanEnd::Exhausted {
                    has_more: last_has_more,
                },
                Some(PipelineEvent::Found(outcome)) => {
                    let progress = (outcome.next_index, outcome.has_more);
                    self.commit(cancel, Some(progress), ScanEvent::Found(outcome));
                }
                Some(PipelineEvent::PageCommitted {
                    has_more,
                    next_index,
                }) => {
                    self.commit(
                        cancel,
                        Some((next_index, has_more)),
                        ScanEvent::PageCommitted { has_more },
                    );
                    last_has_more = has_more;
                    pages += 1;
                    if has_more && self.pages_per_scan.is_some_and(|limit| pages >= limit) {
                        debug!(pages, next_index, "page limit reached");
                        events.cancel();
                        break ScanEnd::Paused;
                    }
                }
                Some(PipelineEvent::Failed(err)) => {
                    warn!("scan failed: {err}");
                    self.commit(cancel, None, ScanEvent::Failed(err.to_string()));
                    break ScanEnd::Failed;
                }
            }
        };

        match end {
            ScanEnd::Exhausted { has_more } => {
                self.commit(cancel, None, ScanEvent::Completed { has_more })
            }
            ScanEnd::Paused => self.commit(cancel, None, ScanEvent::Completed { has_more: true }),
            ScanEnd::Failed | ScanEnd::Cancelled => {}
        }
        end
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shut_down();
    }
}
