//! Photo access gate: decides whether scans may run and with which filter.

use std::sync::Arc;

use serde::Deserialize;
use tokio::select;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::events::FilterMode;
use crate::tasks::manager::ScanManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionState {
    #[default]
    Denied,
    /// Full library access.
    Granted,
    /// Only a user-curated subset of the library is visible.
    Partial,
}

impl PermissionState {
    pub fn has_access(&self) -> bool {
        !matches!(self, Self::Denied)
    }

    /// The filter a scan must use under this state, `None` when scanning is not allowed.
    pub fn filter(&self, requested: FilterMode) -> Option<FilterMode> {
        match self {
            Self::Denied => None,
            Self::Granted => Some(requested),
            Self::Partial => Some(FilterMode::SelectionOnly),
        }
    }
}

/// Host-side permission subsystem.
pub trait PermissionGate: Send + Sync {
    fn current_state(&self) -> PermissionState;

    /// Ask the platform to show its consent UI. The answer arrives through `observe`.
    fn request_access(&self);

    fn observe(&self) -> watch::Receiver<PermissionState>;
}

/// Gate backed by a watch channel; the host pushes states with [`SharedPermissionGate::set`].
#[derive(Debug, Clone)]
pub struct SharedPermissionGate {
    tx: Arc<watch::Sender<PermissionState>>,
    requests: Arc<Notify>,
}

impl SharedPermissionGate {
    pub fn new(initial: PermissionState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx: Arc::new(tx),
            requests: Arc::new(Notify::new()),
        }
    }

    pub fn set(&self, state: PermissionState) {
        self.tx.send_replace(state);
    }

    /// Resolves on the next [`PermissionGate::request_access`] call.
    pub async fn access_requested(&self) {
        self.requests.notified().await;
    }
}

impl PermissionGate for SharedPermissionGate {
    fn current_state(&self) -> PermissionState {
        *self.tx.borrow()
    }

    fn request_access(&self) {
        debug!("photo access requested");
        self.requests.notify_one();
    }

    fn observe(&self) -> watch::Receiver<PermissionState> {
        self.tx.subscribe()
    }
}

/// Starts a reset scan whenever access goes from denied to granted or partial.
///
/// The first state seen counts as a change from `Denied`, so an app that
/// already holds access scans once at startup. Losing access cancels the scan
/// in flight, so the next grant always gets its own scan with the filter it
/// allows. Narrowing to `Partial` restarts only a full-library scan still in
/// flight; widening to `Granted` never restarts anything.
#[instrument(skip_all)]
pub async fn run(gate: Arc<dyn PermissionGate>, manager: ScanManager, cancel: CancellationToken) {
    let mut states = gate.observe();
    let mut previous = PermissionState::Denied;
    loop {
        let current = *states.borrow_and_update();
        if current != previous {
            info!(?previous, ?current, "photo permission changed");
        }
        if previous.has_access() && !current.has_access() {
            info!("photo access revoked; abandoning scan in flight");
            manager.cancel_scan();
        }
        if previous == PermissionState::Granted
            && current == PermissionState::Partial
            && manager.narrow_to_selection().is_some()
        {
            info!("access narrowed to the selection; scan restarted");
        }
        if !previous.has_access() && current.has_access() {
            let only_selection = current == PermissionState::Partial;
            if manager.scan_images(true, only_selection).is_none() {
                warn!("scan could not start after access was granted");
            }
        }
        previous = current;

        select! {
            _ = cancel.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    debug!("permission gate dropped");
                    break;
                }
            }
        }
    }
}
