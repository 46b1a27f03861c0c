use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Seek};
use std::sync::Arc;

use fast_image_resize as fir;
use image::{ImageFormat, ImageReader, RgbaImage};
use jpeg_decoder::{Decoder as JpegDecoder, PixelFormat};
use tracing::debug;

use crate::error::LoadError;
use crate::events::{Locator, Raster};
use crate::processing::layout::{fit_within, needs_downscale};

/// Longest edge, in pixels, of any raster handed to detection.
pub const MAX_DIMENSION: u32 = 1080;

trait Source: BufRead + Seek + Send {}
impl<T: BufRead + Seek + Send> Source for T {}

fn open_source(locator: &Locator) -> std::io::Result<Box<dyn Source>> {
    match locator {
        Locator::Path(path) => Ok(Box::new(BufReader::new(File::open(path)?))),
        Locator::Memory(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
    }
}

/// Turns a locator into a bounded raster.
///
/// Decoding is blocking; async callers go through [`ImageLoader::load_async`],
/// which moves the work onto the blocking pool.
#[derive(Debug, Clone, Copy)]
pub struct ImageLoader {
    max_dimension: u32,
}

impl Default for ImageLoader {
    fn default() -> Self {
        Self::new(MAX_DIMENSION)
    }
}

impl ImageLoader {
    pub fn new(max_dimension: u32) -> Self {
        Self {
            max_dimension: max_dimension.max(1),
        }
    }

    pub fn max_dimension(&self) -> u32 {
        self.max_dimension
    }

    /// Decode, orient and downscale one image.
    ///
    /// # Errors
    /// Any I/O, decode or resize failure is reported as [`LoadError`].
    pub fn load(&self, locator: &Locator) -> Result<Raster, LoadError> {
        let orientation = read_orientation(locator).unwrap_or(1);

        let reader = ImageReader::new(open_source(locator)?).with_guessed_format()?;
        let format = reader.format();
        let (src_w, src_h) = reader.into_dimensions()?;
        if src_w == 0 || src_h == 0 {
            return Err(LoadError::ZeroDimensions);
        }

        let swaps_axes = (5..=8).contains(&orientation);
        let (upright_w, upright_h) = if swaps_axes {
            (src_h, src_w)
        } else {
            (src_w, src_h)
        };
        let (target_w, target_h) = fit_within(upright_w, upright_h, self.max_dimension);
        let shrinking = needs_downscale(upright_w, upright_h, self.max_dimension);

        let decoded = if shrinking && format == Some(ImageFormat::Jpeg) {
            let (request_w, request_h) = if swaps_axes {
                (target_h, target_w)
            } else {
                (target_w, target_h)
            };
            match decode_jpeg_scaled(locator, request_w, request_h) {
                Ok(img) => img,
                Err(err) => {
                    debug!("scaled JPEG decode of {locator} failed: {err:#}; falling back");
                    decode_rgba8(locator)?
                }
            }
        } else {
            decode_rgba8(locator)?
        };

        let upright = apply_orientation(decoded, orientation);
        if upright.dimensions() == (target_w, target_h) {
            return Ok(Raster::new(upright));
        }

        let resized = resize_rgba(&upright, target_w, target_h)?;
        // The full-size buffer goes away before the raster leaves this stage.
        drop(upright);
        debug!(
            from = ?(upright_w, upright_h),
            to = ?(target_w, target_h),
            "downscaled {locator}"
        );
        Ok(Raster::new(resized))
    }

    /// [`ImageLoader::load`] on the blocking pool.
    pub async fn load_async(&self, locator: Locator) -> Result<Raster, LoadError> {
        load_blocking(Arc::new(*self), locator).await
    }
}

/// Blocking locator-to-raster conversion, as the pipeline consumes it.
pub trait RasterSource: Send + Sync {
    fn load(&self, locator: &Locator) -> Result<Raster, LoadError>;
}

impl RasterSource for ImageLoader {
    fn load(&self, locator: &Locator) -> Result<Raster, LoadError> {
        ImageLoader::load(self, locator)
    }
}

/// Run `source` on the blocking pool.
pub async fn load_blocking(
    source: Arc<dyn RasterSource>,
    locator: Locator,
) -> Result<Raster, LoadError> {
    tokio::task::spawn_blocking(move || source.load(&locator))
        .await
        .map_err(|err| LoadError::Aborted(err.to_string()))?
}

fn decode_rgba8(locator: &Locator) -> Result<RgbaImage, LoadError> {
    let img = ImageReader::new(open_source(locator)?)
        .with_guessed_format()?
        .decode()?;
    Ok(img.to_rgba8())
}

// DCT-domain downscale: decodes straight to roughly the requested size so the
// full-resolution buffer never exists. Output is at least `target_w` x `target_h`.
fn decode_jpeg_scaled(locator: &Locator, target_w: u32, target_h: u32) -> anyhow::Result<RgbaImage> {
    use anyhow::anyhow;
    use jpeg_decoder::Error as JpegError;

    let mut decoder = JpegDecoder::new(open_source(locator)?);
    let request_w = target_w.clamp(1, u16::MAX as u32) as u16;
    let request_h = target_h.clamp(1, u16::MAX as u32) as u16;
    decoder.scale(request_w, request_h).map_err(|err| match err {
        JpegError::Unsupported(feature) => anyhow!("unsupported JPEG feature: {feature:?}"),
        other => anyhow!(other),
    })?;
    let pixels = decoder.decode().map_err(|err| match err {
        JpegError::Unsupported(feature) => anyhow!("unsupported JPEG feature: {feature:?}"),
        other => anyhow!(other),
    })?;
    let info = decoder
        .info()
        .ok_or_else(|| anyhow!("missing image info while decoding {locator}"))?;
    let width = info.width as u32;
    let height = info.height as u32;

    let rgba = match info.pixel_format {
        PixelFormat::RGB24 => {
            let mut rgba = Vec::with_capacity(pixels.len() / 3 * 4);
            for chunk in pixels.chunks_exact(3) {
                rgba.extend_from_slice(&[chunk[0], chunk[1], chunk[2], 255]);
            }
            rgba
        }
        PixelFormat::L8 => {
            let mut rgba = Vec::with_capacity(pixels.len() * 4);
            for &v in &pixels {
                rgba.extend_from_slice(&[v, v, v, 255]);
            }
            rgba
        }
        other => anyhow::bail!("scaled decoder does not handle {other:?}"),
    };

    RgbaImage::from_raw(width, height, rgba)
        .ok_or_else(|| anyhow!("failed to construct RGBA image for {locator}"))
}

fn read_orientation(locator: &Locator) -> Option<u16> {
    let mut source = open_source(locator).ok()?;
    let exif = exif::Reader::new().read_from_container(&mut source).ok()?;
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    let value = field.value.get_uint(0)? as u16;
    debug!("exif orientation {value} for {locator}");
    Some(value)
}

// Unsupported orientation values fall through unchanged.
fn apply_orientation(img: RgbaImage, orientation: u16) -> RgbaImage {
    use image::imageops::{flip_horizontal, flip_vertical, rotate90, rotate180, rotate270};
    match orientation {
        2 => flip_horizontal(&img),
        3 => rotate180(&img),
        4 => flip_vertical(&img),
        5 => flip_horizontal(&rotate90(&img)),
        6 => rotate90(&img),
        7 => flip_horizontal(&rotate270(&img)),
        8 => rotate270(&img),
        _ => img,
    }
}

fn resize_rgba(source: &RgbaImage, target_w: u32, target_h: u32) -> Result<RgbaImage, LoadError> {
    if target_w == 0 || target_h == 0 {
        return Err(LoadError::ZeroDimensions);
    }

    let src_view = fir::images::ImageRef::new(
        source.width(),
        source.height(),
        source.as_raw(),
        fir::PixelType::U8x4,
    )
    .map_err(|err| LoadError::Resize(err.to_string()))?;
    let mut dst_image = fir::images::Image::new(target_w, target_h, fir::PixelType::U8x4);
    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::CatmullRom));
    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_view, &mut dst_image, Some(&options))
        .map_err(|err| LoadError::Resize(err.to_string()))?;
    RgbaImage::from_raw(target_w, target_h, dst_image.into_vec())
        .ok_or_else(|| LoadError::Resize("resized buffer has the wrong length".into()))
}
