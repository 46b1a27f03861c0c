//! Face detection engine: an owned, explicitly closed handle around an opaque
//! detector backend.

#[cfg(feature = "rustface")]
pub mod seetaface;

use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use tracing::{debug, error, info};

use crate::error::{DetectError, EngineError};
use crate::events::Raster;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MODEL_PATH: &str = "seeta_fd_frontal_v1.0.bin";

/// Stable identifier assigned to a face when it is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FaceId(pub u64);

impl fmt::Display for FaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "face-{}", self.0)
    }
}

/// Axis-aligned rectangle in raster pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl BoundingBox {
    pub fn from_xywh(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            left: x,
            top: y,
            right: x + width,
            bottom: y + height,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }
}

/// Raw backend output, before the engine assigns identity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bounding_box: BoundingBox,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceRegion {
    pub id: FaceId,
    pub bounding_box: BoundingBox,
    pub confidence: f32,
    /// User-assigned label; empty until named.
    pub name: String,
}

/// Pluggable face detection backend.
///
/// Implementations need not be reentrant; [`DetectionEngine`] never calls
/// `detect` concurrently on the same backend.
pub trait FaceDetector: Send {
    fn detect(&mut self, raster: &Raster) -> anyhow::Result<Vec<Detection>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Delegate {
    #[default]
    Cpu,
    Gpu,
}

impl Delegate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        }
    }
}

/// Only `Image` supports one-shot [`DetectionEngine::detect`] calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunningMode {
    #[default]
    Image,
    Stream,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct EngineOptions {
    /// Model asset to load.
    pub model_path: PathBuf,
    /// Detections below this confidence are discarded.
    pub confidence_threshold: f32,
    /// Hardware delegate the backend should run on.
    pub delegate: Delegate,
    #[serde(skip)]
    pub running_mode: RunningMode,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            delegate: Delegate::Cpu,
            running_mode: RunningMode::Image,
        }
    }
}

/// Owned detector handle.
///
/// A failed initialization leaves the engine closed; a closed engine answers
/// every `detect` with `Ok(None)` ("not available"). `close` may be called any
/// number of times.
pub struct DetectionEngine {
    detector: Mutex<Option<Box<dyn FaceDetector>>>,
    threshold: f32,
    running_mode: RunningMode,
    next_face: AtomicU64,
}

impl fmt::Debug for DetectionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectionEngine")
            .field("closed", &self.is_closed())
            .field("threshold", &self.threshold)
            .field("running_mode", &self.running_mode)
            .finish()
    }
}

impl DetectionEngine {
    /// Bring up a backend with `load`. Failures are logged, not returned.
    pub fn init<F>(options: &EngineOptions, load: F) -> Self
    where
        F: FnOnce(&EngineOptions) -> Result<Box<dyn FaceDetector>, EngineError>,
    {
        let detector = match load(options) {
            Ok(detector) => {
                info!(
                    model = %options.model_path.display(),
                    delegate = options.delegate.as_str(),
                    threshold = options.confidence_threshold,
                    "face detector ready"
                );
                Some(detector)
            }
            Err(err) => {
                error!("face detector failed to initialize: {err}");
                None
            }
        };
        Self {
            detector: Mutex::new(detector),
            threshold: options.confidence_threshold.clamp(0.0, 1.0),
            running_mode: options.running_mode,
            next_face: AtomicU64::new(1),
        }
    }

    /// Wrap an already constructed backend with default options.
    pub fn from_detector(detector: impl FaceDetector + 'static) -> Self {
        Self::init(&EngineOptions::default(), move |_| Ok(Box::new(detector)))
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    pub fn close(&self) {
        if self.lock().take().is_some() {
            info!("face detector closed");
        }
    }

    /// Run the backend over one raster.
    ///
    /// Returns `Ok(None)` when the engine is closed.
    pub fn detect(&self, raster: &Raster) -> Result<Option<Vec<FaceRegion>>, DetectError> {
        if self.running_mode != RunningMode::Image {
            return Err(DetectError::WrongRunningMode);
        }
        let mut guard = self.lock();
        let Some(detector) = guard.as_mut() else {
            return Ok(None);
        };
        let detections = detector.detect(raster).map_err(DetectError::Backend)?;
        drop(guard);

        let regions: Vec<FaceRegion> = detections
            .into_iter()
            .filter(|d| d.confidence >= self.threshold)
            .map(|d| FaceRegion {
                id: FaceId(self.next_face.fetch_add(1, Ordering::Relaxed)),
                bounding_box: d.bounding_box,
                confidence: d.confidence.clamp(0.0, 1.0),
                name: String::new(),
            })
            .collect();
        debug!(faces = regions.len(), "detection finished");
        Ok(Some(regions))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Box<dyn FaceDetector>>> {
        // A backend that panicked mid-call leaves nothing worth protecting.
        self.detector
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for DetectionEngine {
    fn drop(&mut self) {
        self.close();
    }
}
