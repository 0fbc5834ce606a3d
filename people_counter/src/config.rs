//! Command line configuration.
//!
use std::{ffi::OsString, path::PathBuf, str::FromStr};

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Count people crossing a video frame")]
pub struct Args {
    /// Path to an ONNX file with a trained SSD model
    #[clap(short, long)]
    pub model: PathBuf,

    /// Path to image or video file, or `CAM` for the camera
    #[clap(short, long)]
    pub input: String,

    /// Custom kernel library for the CPU device
    #[clap(short = 'l', long, alias = "cpu_extension")]
    pub cpu_extension: Option<PathBuf>,

    /// Target device to infer on
    #[clap(short, long, default_value = "CPU")]
    pub device: String,

    /// Probability threshold for detections filtering
    #[clap(short = 'p', long, default_value_t = 0.5, aliases = ["pt", "prob_threshold"])]
    pub prob_threshold: f32,

    /// Only count detections with this class label
    #[clap(long)]
    pub class_id: Option<u32>,

    /// Network input size as WIDTHxHEIGHT
    #[clap(long, default_value = "300x300")]
    pub input_size: InputSize,

    /// Memory layout of the network input
    #[clap(long, value_enum, default_value_t = Layout::Nchw)]
    pub input_layout: Layout,

    /// Element type of the network input
    #[clap(long, value_enum, default_value_t = InputType::F32)]
    pub input_type: InputType,

    /// Channel order fed to the network
    #[clap(long, value_enum, default_value_t = ChannelOrder::Bgr)]
    pub channel_order: ChannelOrder,

    /// Subtracted from every f32 input value
    #[clap(long, default_value_t = 0.0)]
    pub mean: f32,

    /// Multiplied with every f32 input value after mean subtraction
    #[clap(long, default_value_t = 1.0)]
    pub scale: f32,

    /// Number of asynchronous inference requests
    #[clap(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub num_requests: u32,

    /// Video device used when the input is `CAM`
    #[clap(long, default_value = "/dev/video0")]
    pub camera_device: String,

    /// Host of the MQTT broker
    #[clap(long, env = "MQTT_HOST", default_value = "localhost")]
    pub mqtt_host: String,

    /// Port of the MQTT broker
    #[clap(long, env = "MQTT_PORT", default_value_t = 3001)]
    pub mqtt_port: u16,

    /// MQTT keep-alive interval in seconds
    #[clap(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(5..))]
    pub mqtt_keepalive: u64,

    /// Pixel format of the raw frames written to stdout
    #[clap(long, value_enum, default_value_t = RawFormat::Bgr24)]
    pub raw_format: RawFormat,

    /// Do not write raw frames to stdout
    #[clap(long)]
    pub no_video_out: bool,

    /// Output file in single image mode
    #[clap(long, default_value = "output_image.jpg")]
    pub output_image: PathBuf,

    /// TrueType font for the text overlay
    #[clap(long, default_value = "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf")]
    pub font: PathBuf,
}

impl Args {
    /// Parse a command line that may use the two letter `-pt` flag.
    pub fn parse_cli<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        Self::parse_from(expand_pt_flag(args))
    }

    pub fn try_parse_cli<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        Self::try_parse_from(expand_pt_flag(args))
    }
}

/// clap reads `-pt` as `-p t`, so rewrite it to its long alias `--pt`.
fn expand_pt_flag<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| match arg.to_str() {
            Some("-pt") => OsString::from("--pt"),
            Some(flag) if flag.starts_with("-pt=") => OsString::from(format!("-{flag}")),
            _ => arg,
        })
        .collect()
}

/// Network input size in pixels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InputSize {
    pub width: u32,
    pub height: u32,
}

impl FromStr for InputSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (width, height) = s
            .split_once(['x', 'X'])
            .with_context(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
        let width: u32 = width.trim().parse().context("invalid width")?;
        let height: u32 = height.trim().parse().context("invalid height")?;
        if width == 0 || height == 0 {
            bail!("input size must not be empty, got {s:?}");
        }

        Ok(Self { width, height })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Layout {
    Nchw,
    Nhwc,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum InputType {
    F32,
    U8,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum RawFormat {
    Rgb24,
    Bgr24,
}
