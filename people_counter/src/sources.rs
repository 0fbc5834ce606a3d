//! Frame sources: single images, V4L2 cameras and video files.
//!
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::RgbImage;
use opencv::{
    core::{Mat, CV_8UC3},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};
use rscam::{Camera, Config};
use simple_error::simple_error;

use crate::Error;

/// What kind of input the `--input` argument refers to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InputKind {
    Image(PathBuf),
    Camera,
    Video(PathBuf),
}

impl InputKind {
    pub fn classify(input: &str) -> Result<Self> {
        if input == "CAM" {
            return Ok(InputKind::Camera);
        }

        let path = PathBuf::from(input);
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                ["jpg", "jpeg", "bmp", "png"]
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
            })
            .unwrap_or(false);

        if is_image {
            return Ok(InputKind::Image(path));
        }

        if !path.is_file() {
            bail!("Specified input file doesn't exist: {input}");
        }
        Ok(InputKind::Video(path))
    }

    pub fn is_single_image(&self) -> bool {
        matches!(self, InputKind::Image(_))
    }
}

/// Blocking source of RGB frames.
pub trait FrameSource {
    /// Width and height of the produced frames.
    fn dimensions(&self) -> (u32, u32);

    /// Read the next frame, `None` at the end of the stream.
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;
}

/// Open the source for an input.
pub fn open_source(kind: &InputKind, camera_device: &str) -> Result<Box<dyn FrameSource>> {
    Ok(match kind {
        InputKind::Image(path) => Box::new(ImageSource::open(path)?),
        InputKind::Camera => Box::new(
            CameraSource::open(camera_device, "MJPG", None, None)
                .map_err(|err| anyhow::anyhow!(err))
                .with_context(|| format!("Unable to open camera {camera_device}"))?,
        ),
        InputKind::Video(path) => Box::new(VideoSource::open(path)?),
    })
}

/// Yields one image, then ends.
pub struct ImageSource {
    image: Option<RgbImage>,
    dimensions: (u32, u32),
}

impl ImageSource {
    pub fn open(path: &Path) -> Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("Unable to open image {}", path.display()))?
            .to_rgb8();
        Ok(Self::from_image(image))
    }

    pub fn from_image(image: RgbImage) -> Self {
        Self {
            dimensions: image.dimensions(),
            image: Some(image),
        }
    }
}

impl FrameSource for ImageSource {
    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        Ok(self.image.take())
    }
}

/// Initialized camera delivering JPEG frames.
pub struct CameraSource {
    cam: Camera,
    resolution: (u32, u32),
}

impl CameraSource {
    /// Start capturing on a video device of a Linux machine.
    pub fn open(
        device_name: &str,
        format: &str,
        resolution: Option<(u32, u32)>,
        frame_rate: Option<(u32, u32)>,
    ) -> Result<Self, Error> {
        let mut cam = Camera::new(device_name)?;
        log_supported_formats(&cam, format);
        let format = format.as_bytes();

        log::info!("Using camera {}", device_name);

        let resolution = resolution
            .map(Ok)
            .unwrap_or_else(|| get_max_resolution(&cam, format))?;

        let frame_rate = frame_rate
            .map(Ok)
            .unwrap_or_else(|| get_max_frame_rate(&cam, format, resolution))?;

        cam.start(&Config {
            interval: frame_rate,
            resolution,
            format,
            ..Default::default()
        })?;

        Ok(Self { cam, resolution })
    }
}

impl FrameSource for CameraSource {
    fn dimensions(&self) -> (u32, u32) {
        self.resolution
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let frame = self.cam.capture().context("Error capturing frame")?;
        let image: RgbImage =
            turbojpeg::decompress_image(&frame[..]).context("failed to decompress frame")?;
        Ok(Some(image))
    }
}

/// Video file decoded with OpenCV.
///
/// The first frame is decoded on open, so the reported dimensions are those of the frames as
/// delivered, after any rotation stored in the container.
pub struct VideoSource {
    capture: VideoCapture,
    first: Option<RgbImage>,
    dimensions: (u32, u32),
}

impl VideoSource {
    pub fn open(path: &Path) -> Result<Self> {
        let name = path
            .to_str()
            .with_context(|| format!("video path is not UTF-8: {}", path.display()))?;
        let mut capture = VideoCapture::from_file(name, videoio::CAP_ANY)
            .with_context(|| format!("Unable to open video {}", path.display()))?;
        if !capture.is_opened()? {
            bail!("Unable to open video {}", path.display());
        }

        let first = read_frame(&mut capture)?
            .with_context(|| format!("video {} has no frames", path.display()))?;
        let dimensions = first.dimensions();
        log::info!(
            "Decoding {} with {}x{} frames",
            path.display(),
            dimensions.0,
            dimensions.1
        );

        Ok(Self {
            capture,
            first: Some(first),
            dimensions,
        })
    }
}

impl FrameSource for VideoSource {
    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if let Some(first) = self.first.take() {
            return Ok(Some(first));
        }

        let frame = read_frame(&mut self.capture)?;
        if let Some(frame) = &frame {
            if frame.dimensions() != self.dimensions {
                bail!(
                    "frame size changed from {:?} to {:?}",
                    self.dimensions,
                    frame.dimensions()
                );
            }
        }
        Ok(frame)
    }
}

/// Read the next frame, `None` at the end of the video.
fn read_frame(capture: &mut VideoCapture) -> Result<Option<RgbImage>> {
    let mut bgr = Mat::default();
    if !capture.read(&mut bgr)? || bgr.rows() == 0 {
        return Ok(None);
    }

    mat_to_rgb(&bgr).map(Some)
}

/// Convert an 8 bit BGR frame into an `RgbImage` of the same size.
fn mat_to_rgb(bgr: &Mat) -> Result<RgbImage> {
    if bgr.typ() != CV_8UC3 {
        bail!("unsupported frame type {}, expected 8 bit BGR", bgr.typ());
    }

    let mut rgb = Mat::default();
    imgproc::cvt_color_def(bgr, &mut rgb, imgproc::COLOR_BGR2RGB)?;

    let width = u32::try_from(rgb.cols())?;
    let height = u32::try_from(rgb.rows())?;
    RgbImage::from_raw(width, height, rgb.data_bytes()?.to_vec())
        .context("frame buffer does not match frame size")
}

/// Get the maximum supported resolution for the given format.
fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32), Error> {
    let resolution_info = cam.resolutions(format)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .iter()
            // Map to iterator over ((width, height) num_pixels)
            .map(|res| (res, res.0 * res.1))
            // Get the highest resolution in terms of number of pixels
            .max_by(|a, b| a.1.cmp(&b.1))
            // Extract width and height values
            .map(|res| *res.0),
        rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
    }
    .ok_or_else(|| simple_error!("No resolution found").into())
}

/// Get the maximum supported frame rate for the given format and resolution.
fn get_max_frame_rate(
    cam: &Camera,
    format: &[u8],
    resolution: (u32, u32),
) -> Result<(u32, u32), Error> {
    let interval_info = cam.intervals(format, resolution)?;
    log::debug!("Found frame rates: {:?}", &interval_info);
    match interval_info {
        rscam::IntervalInfo::Discretes(intervals) => intervals
            .iter()
            // Intervals are (numerator, denominator) in seconds, the shortest gives the most fps
            .map(|&(numerator, denominator)| {
                ((numerator, denominator), denominator as f32 / numerator as f32)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(interval, _)| interval),
        rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
    }
    .ok_or_else(|| simple_error!("No frame rate found").into())
}

fn log_supported_formats(cam: &Camera, format: &str) {
    let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
    log::debug!(
        "Supported formats: {:?}, using format {:?}",
        formats,
        format
    );
}
