use std::fs::File;
use std::io::BufReader;

use image::imageops::grayscale;

use super::{BoundingBox, Delegate, Detection, EngineOptions, FaceDetector};
use crate::error::EngineError;
use crate::events::Raster;

// Raw SeetaFace scores are classifier margins; 2.0 is the customary cut-off.
const RAW_SCORE_CENTER: f64 = 2.0;

/// Face detector backed by the `rustface` crate (SeetaFace engine).
pub struct RustfaceDetector {
    model: rustface::Model,
    raw_threshold: f64,
}

impl RustfaceDetector {
    /// Load the model named by `options.model_path`. CPU only.
    pub fn load(options: &EngineOptions) -> Result<Self, EngineError> {
        if options.delegate != Delegate::Cpu {
            return Err(EngineError::UnsupportedDelegate(options.delegate.as_str()));
        }
        let model_error = |reason: String| EngineError::ModelLoad {
            path: options.model_path.display().to_string(),
            reason,
        };
        let file = File::open(&options.model_path).map_err(|e| model_error(e.to_string()))?;
        let model =
            rustface::read_model(BufReader::new(file)).map_err(|e| model_error(e.to_string()))?;
        Ok(Self {
            model,
            raw_threshold: raw_score_for(options.confidence_threshold),
        })
    }

    /// Loader suitable for [`super::DetectionEngine::init`].
    pub fn boxed(options: &EngineOptions) -> Result<Box<dyn FaceDetector>, EngineError> {
        Ok(Box::new(Self::load(options)?))
    }
}

impl FaceDetector for RustfaceDetector {
    fn detect(&mut self, raster: &Raster) -> anyhow::Result<Vec<Detection>> {
        let gray = grayscale(raster.image());
        let (width, height) = gray.dimensions();

        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(20);
        detector.set_score_thresh(self.raw_threshold);
        detector.set_pyramid_scale_factor(0.8);
        detector.set_slide_window_step(4, 4);

        let faces = detector.detect(&rustface::ImageData::new(gray.as_raw(), width, height));
        Ok(faces
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                Detection {
                    bounding_box: BoundingBox::from_xywh(
                        bbox.x() as f32,
                        bbox.y() as f32,
                        bbox.width() as f32,
                        bbox.height() as f32,
                    ),
                    confidence: confidence_for(face.score()) as f32,
                }
            })
            .collect())
    }
}

fn confidence_for(raw: f64) -> f64 {
    1.0 / (1.0 + (-(raw - RAW_SCORE_CENTER)).exp())
}

fn raw_score_for(confidence: f32) -> f64 {
    let p = f64::from(confidence).clamp(1e-6, 1.0 - 1e-6);
    RAW_SCORE_CENTER + (p / (1.0 - p)).ln()
}
