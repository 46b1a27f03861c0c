use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::detection::{Delegate, EngineOptions};
use crate::permission::PermissionState;
use crate::tasks::loader::MAX_DIMENSION;
use crate::tasks::pipeline::DEFAULT_BATCH_SIZE;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Configuration {
    /// Root directory scanned recursively for photos.
    pub photo_library_path: PathBuf,
    /// Photos making up the limited-access selection, relative to the library root.
    pub selection: Vec<PathBuf>,
    /// Access level the host grants at startup.
    pub access: PermissionState,
    /// Rows read from the index per page.
    pub batch_size: usize,
    /// Longest side of a decoded raster, in pixels.
    pub max_dimension: u32,
    /// Pause each scan after this many pages.
    pub pages_per_scan: Option<usize>,
    pub detector: EngineOptions,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            photo_library_path: PathBuf::new(),
            selection: Vec::new(),
            access: PermissionState::Granted,
            batch_size: DEFAULT_BATCH_SIZE,
            max_dimension: MAX_DIMENSION,
            pages_per_scan: None,
            detector: EngineOptions::default(),
        }
    }
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&s)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    /// Validate runtime invariants that serde defaults cannot express.
    pub fn validated(self) -> Result<Self> {
        ensure!(
            !self.photo_library_path.as_os_str().is_empty(),
            "photo-library-path must not be empty"
        );
        ensure!(self.batch_size > 0, "batch-size must be greater than zero");
        ensure!(
            self.max_dimension > 0,
            "max-dimension must be greater than zero"
        );
        ensure!(
            self.pages_per_scan != Some(0),
            "pages-per-scan must be greater than zero when set"
        );
        let threshold = self.detector.confidence_threshold;
        ensure!(
            (0.0..=1.0).contains(&threshold),
            "detector.confidence-threshold must be within 0.0..=1.0, got {threshold}"
        );
        ensure!(
            !self.detector.model_path.as_os_str().is_empty(),
            "detector.model-path must not be empty"
        );
        if self.detector.delegate == Delegate::Gpu {
            tracing::warn!("gpu delegate requested; the bundled detector runs on cpu only");
        }
        Ok(self)
    }
}
