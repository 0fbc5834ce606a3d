//! Output of annotated frames as raw video.
use anyhow::Result;
use image::RgbImage;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::config::RawFormat;

/// Writes frames as raw, tightly packed pixels, e.g. for `ffmpeg -f rawvideo -i -`.
pub struct FrameWriter<W> {
    writer: W,
    format: RawFormat,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, format: RawFormat) -> Self {
        Self {
            writer,
            format,
            buf: Vec::new(),
        }
    }

    pub async fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        match self.format {
            RawFormat::Rgb24 => self.writer.write_all(frame.as_raw()).await?,
            RawFormat::Bgr24 => {
                self.buf.clear();
                self.buf.reserve(frame.as_raw().len());
                for pixel in frame.pixels() {
                    let [r, g, b] = pixel.0;
                    self.buf.extend_from_slice(&[b, g, r]);
                }
                self.writer.write_all(&self.buf).await?;
            }
        }
        self.writer.flush().await?;

        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
