#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use face_gallery::detection::{BoundingBox, Detection, DetectionEngine, FaceDetector};
use face_gallery::error::StorageError;
use face_gallery::events::{FilterMode, Locator, PhotoId, PhotoRef, Raster};
use face_gallery::index::{IndexCursor, PhotoIndex, SnapshotCursor};
use face_gallery::state::UiState;
use face_gallery::tasks::loader::ImageLoader;
use face_gallery::tasks::manager::ScanManager;
use face_gallery::tasks::pipeline::Pipeline;
use image::{ImageFormat, Rgba, RgbaImage};

/// PNG whose red channel encodes how many faces [`RedChannelFaces`] reports.
pub fn png_with_faces(faces: u8) -> Vec<u8> {
    let img = RgbaImage::from_pixel(8, 6, Rgba([faces, 0, 0, 255]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// One-face PNG whose green channel carries `tag`, so a raster can be traced
/// back to the photo it came from.
pub fn tagged_png(tag: u8) -> Vec<u8> {
    let img = RgbaImage::from_pixel(8, 6, Rgba([1, tag, 0, 255]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn photo(id: u64, bytes: Vec<u8>) -> PhotoRef {
    PhotoRef {
        id: PhotoId(id),
        locator: Locator::Memory(Arc::from(bytes)),
        display_name: format!("IMG_{id:04}.png"),
    }
}

/// `total` photos; those listed in `with_faces` carry one face each.
pub fn library(total: u64, with_faces: &[u64]) -> Vec<PhotoRef> {
    (0..total)
        .map(|id| {
            let faces = u8::from(with_faces.contains(&id));
            photo(id, png_with_faces(faces))
        })
        .collect()
}

pub struct RedChannelFaces;

impl FaceDetector for RedChannelFaces {
    fn detect(&mut self, raster: &Raster) -> anyhow::Result<Vec<Detection>> {
        let faces = raster.image().get_pixel(0, 0)[0];
        Ok((0..faces)
            .map(|i| Detection {
                bounding_box: BoundingBox::from_xywh(f32::from(i), 0.0, 2.0, 2.0),
                confidence: 0.9,
            })
            .collect())
    }
}

/// [`RedChannelFaces`] that takes its time, to keep a scan in flight.
pub struct SlowFaces(pub Duration);

impl FaceDetector for SlowFaces {
    fn detect(&mut self, raster: &Raster) -> anyhow::Result<Vec<Detection>> {
        std::thread::sleep(self.0);
        RedChannelFaces.detect(raster)
    }
}

pub fn engine() -> Arc<DetectionEngine> {
    Arc::new(DetectionEngine::from_detector(RedChannelFaces))
}

pub fn pipeline(index: Arc<dyn PhotoIndex>, batch_size: usize) -> Pipeline {
    Pipeline::new(index, ImageLoader::default(), engine()).with_batch_size(batch_size)
}

/// Index whose rows at or beyond `fail_from` fail to read while `broken` is set.
pub struct FlakyIndex {
    pub rows: Vec<PhotoRef>,
    pub fail_from: usize,
    pub broken: Arc<AtomicBool>,
}

struct FlakyCursor {
    inner: SnapshotCursor,
    position: usize,
    fail_from: usize,
    broken: Arc<AtomicBool>,
}

impl PhotoIndex for FlakyIndex {
    fn open(&self, _filter: FilterMode) -> Result<Box<dyn IndexCursor>, StorageError> {
        Ok(Box::new(FlakyCursor {
            inner: SnapshotCursor::new(self.rows.clone()),
            position: 0,
            fail_from: self.fail_from,
            broken: Arc::clone(&self.broken),
        }))
    }
}

impl IndexCursor for FlakyCursor {
    fn row_count(&self) -> usize {
        self.inner.row_count()
    }

    fn seek(&mut self, row: usize) -> Result<(), StorageError> {
        self.inner.seek(row)?;
        self.position = row;
        Ok(())
    }

    fn next_row(&mut self) -> Result<Option<PhotoRef>, StorageError> {
        if self.broken.load(Ordering::SeqCst) && self.position >= self.fail_from {
            return Err(StorageError::Unavailable("media store revoked".into()));
        }
        self.position += 1;
        self.inner.next_row()
    }
}

pub struct UnavailableIndex;

impl PhotoIndex for UnavailableIndex {
    fn open(&self, _filter: FilterMode) -> Result<Box<dyn IndexCursor>, StorageError> {
        Err(StorageError::Unavailable("permission revoked".into()))
    }
}

pub async fn wait_for_state(manager: &ScanManager, pred: impl FnMut(&UiState) -> bool) -> UiState {
    let mut rx = manager.state();
    let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("timeout waiting for state")
        .expect("state channel closed")
        .clone();
    state
}

pub fn photo_ids(state: &UiState) -> Vec<u64> {
    state.images().iter().map(|i| i.photo.id.0).collect()
}
