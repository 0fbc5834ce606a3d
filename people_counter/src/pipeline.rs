//! Frame loop: capture, infer, count, publish and stream.
//!
use std::{
    collections::VecDeque,
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use image::RgbImage;
use ndarray::ArrayViewD;
use tokio::{
    io::AsyncWrite,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Args,
    counter::PeopleCounter,
    meter::METER,
    nn::{Network, NetworkConfig},
    overlay::Overlay,
    publisher::StatsPublisher,
    sink::FrameWriter,
    sources::{open_source, InputKind},
    ssd::parse_detections,
};

pub type FrameReceiver = mpsc::Receiver<Result<RgbImage>>;

/// Turns network results into annotated frames and stats messages.
pub struct FrameHandler<P, W> {
    counter: PeopleCounter,
    overlay: Overlay,
    publisher: P,
    writer: Option<FrameWriter<W>>,
    output_image: Option<PathBuf>,
    prob_threshold: f32,
    class_id: Option<u32>,
}

impl<P: StatsPublisher, W: AsyncWrite + Unpin> FrameHandler<P, W> {
    pub fn new(
        overlay: Overlay,
        publisher: P,
        writer: Option<FrameWriter<W>>,
        prob_threshold: f32,
        class_id: Option<u32>,
    ) -> Self {
        Self {
            counter: PeopleCounter::new(),
            overlay,
            publisher,
            writer,
            output_image: None,
            prob_threshold,
            class_id,
        }
    }

    /// Save every handled frame to `path` as well.
    pub fn with_output_image(mut self, path: PathBuf) -> Self {
        self.output_image = Some(path);
        self
    }

    /// Handle the network output for one frame and return the number of people in it.
    pub async fn handle(
        &mut self,
        mut frame: RgbImage,
        output: ArrayViewD<'_, f32>,
        inference_time: Duration,
        now: Instant,
    ) -> Result<u64> {
        let detections = parse_detections(output, self.prob_threshold, self.class_id)?;
        let current_count = detections.len() as u64;
        log::debug!(
            "{current_count} people detected in {:.3}ms",
            inference_time.as_secs_f64() * 1000.0
        );

        self.overlay.annotate(&mut frame, &detections, inference_time);

        for msg in self.counter.update(current_count, now) {
            if let Err(err) = self.publisher.publish(&msg) {
                log::warn!("Dropping {msg:?}: {err:#}");
            }
        }

        if let Some(writer) = self.writer.as_mut() {
            writer.write_frame(&frame).await?;
        }

        if let Some(path) = &self.output_image {
            frame
                .save(path)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        Ok(current_count)
    }

    pub fn total(&self) -> u64 {
        self.counter.total()
    }

    pub fn into_writer(self) -> Option<W> {
        self.writer.map(FrameWriter::into_inner)
    }
}

/// Frame waiting for its inference request to complete.
struct Pending {
    request_id: usize,
    frame: RgbImage,
}

/// Open the input on a dedicated thread and stream its frames through a bounded channel.
///
/// Returns the frame dimensions once the source is open. The thread stops at the end of the
/// stream, on the first capture error or when the receiver is dropped.
pub async fn spawn_capture(
    kind: InputKind,
    camera_device: String,
    capacity: usize,
) -> Result<((u32, u32), FrameReceiver)> {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (frames_tx, frames_rx) = mpsc::channel(capacity);

    std::thread::Builder::new()
        .name("capture".into())
        .spawn(move || {
            let mut source = match open_source(&kind, &camera_device) {
                Ok(source) => {
                    ready_tx.send(Ok(source.dimensions())).ok();
                    source
                }
                Err(err) => {
                    ready_tx.send(Err(err)).ok();
                    return;
                }
            };

            loop {
                match source.next_frame() {
                    Ok(Some(frame)) => {
                        METER.tick_captured();
                        if frames_tx.blocking_send(Ok(frame)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        frames_tx.blocking_send(Err(err)).ok();
                        break;
                    }
                }
            }
            log::debug!("Capture thread done");
        })
        .context("failed to spawn capture thread")?;

    let dimensions = ready_rx
        .await
        .context("capture thread exited before opening the source")??;

    Ok((dimensions, frames_rx))
}

/// Run frames through the network in capture order, keeping up to `num_requests` in flight.
pub async fn run_frames<P: StatsPublisher, W: AsyncWrite + Unpin>(
    network: &mut Network,
    handler: &mut FrameHandler<P, W>,
    mut frames_rx: FrameReceiver,
    shutdown: CancellationToken,
) -> Result<()> {
    let num_requests = network.num_requests();
    let mut pending: VecDeque<Pending> = VecDeque::with_capacity(num_requests);
    let mut frame_index = 0;

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("Stopping on request");
                break;
            }
            next = frames_rx.recv() => next,
        };

        let frame = match next {
            Some(frame) => frame?,
            None => break,
        };

        if pending.len() == num_requests {
            if let Some(oldest) = pending.pop_front() {
                complete(network, handler, oldest).await?;
            }
        }

        let request_id = frame_index % num_requests;
        let input = network.preprocess(&frame);
        network.exec_net(request_id, input)?;
        pending.push_back(Pending { request_id, frame });
        frame_index += 1;
    }

    while let Some(oldest) = pending.pop_front() {
        complete(network, handler, oldest).await?;
    }

    Ok(())
}

async fn complete<P: StatsPublisher, W: AsyncWrite + Unpin>(
    network: &mut Network,
    handler: &mut FrameHandler<P, W>,
    pending: Pending,
) -> Result<()> {
    let inference_time = network.wait(pending.request_id).await?;
    let output = network.get_output(pending.request_id)?;

    handler
        .handle(pending.frame, output.view(), inference_time, Instant::now())
        .await?;
    METER.record_inference(inference_time);

    Ok(())
}

/// Load the network, stream the input through it and publish the stats.
pub async fn infer_on_stream<P: StatsPublisher>(
    args: &Args,
    publisher: P,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut network = Network::load_model(&NetworkConfig::from_args(args))?;
    log::info!("Network input shape: {:?}", network.get_input_shape());

    let kind = InputKind::classify(&args.input)?;
    let single_image_mode = kind.is_single_image();

    let ((width, height), frames_rx) = spawn_capture(
        kind,
        args.camera_device.clone(),
        network.num_requests() + 1,
    )
    .await
    .context("Unable to open video source")?;
    log::info!("Streaming {width}x{height} frames from {}", args.input);

    let writer = (!args.no_video_out)
        .then(|| FrameWriter::new(tokio::io::stdout(), args.raw_format));
    let mut handler = FrameHandler::new(
        Overlay::new(&args.font),
        publisher,
        writer,
        args.prob_threshold,
        args.class_id,
    );
    if single_image_mode {
        handler = handler.with_output_image(args.output_image.clone());
    }

    run_frames(&mut network, &mut handler, frames_rx, shutdown).await?;
    log::info!("Counted {} people in total", handler.total());

    Ok(())
}
