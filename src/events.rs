use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use image::RgbaImage;

use crate::detection::FaceRegion;
use crate::error::ScanError;

/// Stable identifier of one photo in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhotoId(pub u64);

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the encoded bytes of a photo live.
#[derive(Clone)]
pub enum Locator {
    Path(PathBuf),
    Memory(Arc<[u8]>),
}

impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Memory(bytes) => write!(f, "Memory({} bytes)", bytes.len()),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Memory(bytes) => write!(f, "<memory:{} bytes>", bytes.len()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhotoRef {
    pub id: PhotoId,
    pub locator: Locator,
    pub display_name: String,
}

/// Which part of the library the index exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    #[default]
    All,
    /// Only the photos from the user's latest limited-access selection.
    SelectionOnly,
}

impl FilterMode {
    pub fn from_selection_flag(only_latest_selection: bool) -> Self {
        if only_latest_selection {
            Self::SelectionOnly
        } else {
            Self::All
        }
    }
}

/// One page of the (filtered, sorted) photo index.
#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<PhotoRef>,
    pub has_more: bool,
    /// Zero-based row offset where the following page starts.
    pub next_cursor: usize,
}

/// Decoded RGBA8 pixels, already bounded to the configured maximum dimension.
#[derive(Debug, Clone)]
pub struct Raster {
    image: RgbaImage,
}

impl Raster {
    pub fn new(image: RgbaImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width() as f32 / self.height().max(1) as f32
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }
}

/// A photo in which at least one face was found.
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub photo: PhotoRef,
    pub raster: Arc<Raster>,
    pub face_count: usize,
    pub regions: Option<Vec<FaceRegion>>,
    pub aspect_ratio: f32,
}

/// One faces-found image plus the pagination metadata of the page it came from.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub image: ProcessedImage,
    pub has_more: bool,
    pub next_index: usize,
}

/// Everything the pipeline reports while a scan runs.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Found(Outcome),
    /// Every item of a page has been processed.
    PageCommitted { has_more: bool, next_index: usize },
    Failed(ScanError),
}
