//! Inference network with asynchronous request slots.
//!
//! A `Network` owns an optimized tract plan and a fixed number of request slots. A slot is
//! started with [`Network::exec_net`], completed with [`Network::wait`] and drained with
//! [`Network::get_output`], after which it can be reused.
use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use image::RgbImage;
use ndarray::ArrayD;
use tokio::task::JoinHandle;
use tract_onnx::prelude::*;

use crate::config::{Args, ChannelOrder, InputSize, InputType, Layout};

pub type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

type InferResult = Result<(Vec<ArrayD<f32>>, Duration)>;

/// Everything needed to load a network and shape its input.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub model: PathBuf,
    pub device: String,
    pub cpu_extension: Option<PathBuf>,
    pub input: InputSpec,
    pub expected_inputs: usize,
    pub expected_outputs: usize,
    pub num_requests: usize,
}

impl NetworkConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            model: args.model.clone(),
            device: args.device.clone(),
            cpu_extension: args.cpu_extension.clone(),
            input: InputSpec {
                size: args.input_size,
                layout: args.input_layout,
                dtype: args.input_type,
                channel_order: args.channel_order,
                mean: args.mean,
                scale: args.scale,
            },
            expected_inputs: 1,
            expected_outputs: 1,
            num_requests: args.num_requests as usize,
        }
    }
}

/// Shape and encoding of the network input tensor.
#[derive(Clone, Copy, Debug)]
pub struct InputSpec {
    pub size: InputSize,
    pub layout: Layout,
    pub dtype: InputType,
    pub channel_order: ChannelOrder,
    pub mean: f32,
    pub scale: f32,
}

impl InputSpec {
    pub fn shape(&self) -> [usize; 4] {
        let (h, w) = (self.size.height as usize, self.size.width as usize);
        match self.layout {
            Layout::Nchw => [1, 3, h, w],
            Layout::Nhwc => [1, h, w, 3],
        }
    }

    fn datum_type(&self) -> DatumType {
        match self.dtype {
            InputType::F32 => f32::datum_type(),
            InputType::U8 => u8::datum_type(),
        }
    }

    /// Resize an image to the network size and lay it out as an input tensor.
    pub fn preprocess(&self, input: &RgbImage) -> Tensor {
        let resized: RgbImage = image::imageops::resize(
            input,
            self.size.width,
            self.size.height,
            image::imageops::FilterType::Triangle,
        );

        let channel = |c: usize| match self.channel_order {
            ChannelOrder::Rgb => c,
            ChannelOrder::Bgr => 2 - c,
        };
        let value = |x: usize, y: usize, c: usize| resized[(x as u32, y as u32)][channel(c)];

        let shape = self.shape();
        match (self.layout, self.dtype) {
            (Layout::Nchw, InputType::F32) => tract_ndarray::Array4::from_shape_fn(
                (shape[0], shape[1], shape[2], shape[3]),
                |(_, c, y, x)| (value(x, y, c) as f32 - self.mean) * self.scale,
            )
            .into(),
            (Layout::Nhwc, InputType::F32) => tract_ndarray::Array4::from_shape_fn(
                (shape[0], shape[1], shape[2], shape[3]),
                |(_, y, x, c)| (value(x, y, c) as f32 - self.mean) * self.scale,
            )
            .into(),
            (Layout::Nchw, InputType::U8) => tract_ndarray::Array4::from_shape_fn(
                (shape[0], shape[1], shape[2], shape[3]),
                |(_, c, y, x)| value(x, y, c),
            )
            .into(),
            (Layout::Nhwc, InputType::U8) => tract_ndarray::Array4::from_shape_fn(
                (shape[0], shape[1], shape[2], shape[3]),
                |(_, y, x, c)| value(x, y, c),
            )
            .into(),
        }
    }
}

enum RequestSlot {
    Idle,
    Running(JoinHandle<InferResult>),
    Done(Vec<ArrayD<f32>>),
}

pub struct Network {
    plan: Arc<NnModel>,
    input: InputSpec,
    requests: Vec<RequestSlot>,
}

impl Network {
    /// Load an ONNX model, check it fits the expected topology and prepare request slots.
    pub fn load_model(config: &NetworkConfig) -> Result<Self> {
        check_device(&config.device, config.cpu_extension.as_deref())?;

        log::info!("Reading model {}", config.model.display());
        let model = tract_onnx::onnx()
            .model_for_path(&config.model)
            .with_context(|| format!("failed to read model {}", config.model.display()))?;

        check_topology(model.inputs.len(), model.outputs.len(), config)?;

        let shape = config.input.shape();
        let input_fact = InferenceFact::dt_shape(
            config.input.datum_type(),
            tvec!(shape[0], shape[1], shape[2], shape[3]),
        );

        log::info!("Loading model to the {} device...", config.device);
        let plan = model
            .with_input_fact(0, input_fact)?
            .into_optimized()
            .map_err(|err| {
                log::error!(
                    "Model contains operators not supported on device {}: {err:#}",
                    config.device
                );
                err
            })
            .with_context(|| format!("unsupported model for device {}", config.device))?
            .into_runnable()?;

        Self::from_plan(plan, config.input, config.num_requests)
    }

    /// Wrap an already runnable plan.
    pub fn from_plan(plan: NnModel, input: InputSpec, num_requests: usize) -> Result<Self> {
        if num_requests == 0 {
            bail!("at least one inference request is needed");
        }

        Ok(Self {
            plan: Arc::new(plan),
            input,
            requests: (0..num_requests).map(|_| RequestSlot::Idle).collect(),
        })
    }

    /// Shape of the input tensor in the network's layout.
    pub fn get_input_shape(&self) -> [usize; 4] {
        self.input.shape()
    }

    pub fn num_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn preprocess(&self, frame: &RgbImage) -> Tensor {
        self.input.preprocess(frame)
    }

    /// Start an asynchronous inference in the given request slot.
    pub fn exec_net(&mut self, request_id: usize, input: Tensor) -> Result<()> {
        let plan = Arc::clone(&self.plan);
        let slot = self.slot(request_id)?;
        if !matches!(slot, RequestSlot::Idle) {
            bail!("inference request {request_id} is busy");
        }

        let handle = tokio::task::spawn_blocking(move || -> InferResult {
            let start = Instant::now();
            let outputs = plan.run(tvec!(input.into()))?;
            let elapsed = start.elapsed();

            let outputs = outputs
                .iter()
                .map(|output| Ok(output.to_array_view::<f32>()?.to_owned()))
                .collect::<Result<Vec<_>>>()
                .context("network outputs must be f32")?;

            Ok((outputs, elapsed))
        });

        *slot = RequestSlot::Running(handle);
        Ok(())
    }

    /// Wait for the request to complete and return the inference time.
    pub async fn wait(&mut self, request_id: usize) -> Result<Duration> {
        let slot = self.slot(request_id)?;
        let handle = match std::mem::replace(slot, RequestSlot::Idle) {
            RequestSlot::Running(handle) => handle,
            RequestSlot::Idle => bail!("inference request {request_id} was never started"),
            done @ RequestSlot::Done(_) => {
                *slot = done;
                bail!("inference request {request_id} already completed");
            }
        };

        let (outputs, elapsed) = handle.await.context("inference task panicked")??;
        *slot = RequestSlot::Done(outputs);

        Ok(elapsed)
    }

    /// Take the first output of a completed request and free its slot.
    pub fn get_output(&mut self, request_id: usize) -> Result<ArrayD<f32>> {
        let slot = self.slot(request_id)?;
        match std::mem::replace(slot, RequestSlot::Idle) {
            RequestSlot::Done(outputs) => outputs
                .into_iter()
                .next()
                .context("network produced no output"),
            other => {
                *slot = other;
                bail!("inference request {request_id} has not completed");
            }
        }
    }

    fn slot(&mut self, request_id: usize) -> Result<&mut RequestSlot> {
        let num_requests = self.requests.len();
        self.requests
            .get_mut(request_id)
            .with_context(|| format!("request id {request_id} out of range 0..{num_requests}"))
    }
}

/// Check the model has the configured number of inputs and outputs.
fn check_topology(inputs: usize, outputs: usize, config: &NetworkConfig) -> Result<()> {
    if inputs != config.expected_inputs {
        bail!(
            "Supports only {} input topologies, model has {inputs}",
            config.expected_inputs
        );
    }
    if outputs != config.expected_outputs {
        bail!(
            "Supports only {} output topologies, model has {outputs}",
            config.expected_outputs
        );
    }

    Ok(())
}

/// tract runs every model on the CPU and has no plugin mechanism for custom kernels.
fn check_device(device: &str, cpu_extension: Option<&Path>) -> Result<()> {
    if !device.eq_ignore_ascii_case("CPU") {
        bail!("device {device} is not supported, only CPU is available");
    }

    if let Some(extension) = cpu_extension {
        log::warn!(
            "Ignoring CPU extension {}, custom kernels are not supported",
            extension.display()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(layout: Layout, dtype: InputType, channel_order: ChannelOrder) -> InputSpec {
        InputSpec {
            size: InputSize { width: 4, height: 2 },
            layout,
            dtype,
            channel_order,
            mean: 0.0,
            scale: 1.0,
        }
    }

    fn identity_plan(shape: [usize; 4]) -> NnModel {
        let mut model = TypedModel::default();
        let source = model
            .add_source("input", TypedFact::dt_shape(f32::datum_type(), shape))
            .unwrap();
        model.set_output_outlets(&[source]).unwrap();
        model.into_runnable().unwrap()
    }

    #[test]
    fn test_input_shape_follows_layout() {
        let nchw = spec(Layout::Nchw, InputType::F32, ChannelOrder::Bgr);
        let nhwc = spec(Layout::Nhwc, InputType::F32, ChannelOrder::Bgr);

        assert_eq!(nchw.shape(), [1, 3, 2, 4]);
        assert_eq!(nhwc.shape(), [1, 2, 4, 3]);
    }

    #[test]
    fn test_preprocess_reorders_channels() {
        let image = RgbImage::from_pixel(8, 4, image::Rgb([10, 20, 30]));

        let bgr = spec(Layout::Nchw, InputType::F32, ChannelOrder::Bgr).preprocess(&image);
        let bgr = bgr.to_array_view::<f32>().unwrap();
        assert_eq!(bgr.shape(), &[1, 3, 2, 4]);
        assert_eq!(bgr[[0, 0, 1, 3]], 30.0);
        assert_eq!(bgr[[0, 2, 0, 0]], 10.0);

        let rgb = spec(Layout::Nhwc, InputType::U8, ChannelOrder::Rgb).preprocess(&image);
        let rgb = rgb.to_array_view::<u8>().unwrap();
        assert_eq!(rgb.shape(), &[1, 2, 4, 3]);
        assert_eq!(rgb[[0, 1, 2, 0]], 10);
        assert_eq!(rgb[[0, 1, 2, 2]], 30);
    }

    #[test]
    fn test_preprocess_normalizes_f32() {
        let image = RgbImage::from_pixel(4, 2, image::Rgb([255, 127, 0]));
        let mut input = spec(Layout::Nchw, InputType::F32, ChannelOrder::Rgb);
        input.mean = 127.0;
        input.scale = 1.0 / 128.0;

        let tensor = input.preprocess(&image);
        let view = tensor.to_array_view::<f32>().unwrap();
        assert_eq!(view[[0, 0, 0, 0]], 1.0);
        assert_eq!(view[[0, 1, 0, 0]], 0.0);
    }

    #[test]
    fn test_unsupported_device() {
        assert!(check_device("MYRIAD", None).is_err());
        assert!(check_device("cpu", Some(Path::new("libcpu_extension.so"))).is_ok());
    }

    fn config(model: &str) -> NetworkConfig {
        NetworkConfig {
            model: PathBuf::from(model),
            device: "CPU".into(),
            cpu_extension: None,
            input: spec(Layout::Nchw, InputType::F32, ChannelOrder::Bgr),
            expected_inputs: 1,
            expected_outputs: 1,
            num_requests: 1,
        }
    }

    #[test]
    fn test_missing_model_file() {
        assert!(Network::load_model(&config("does-not-exist.onnx")).is_err());
    }

    #[test]
    fn test_topology_mismatch() {
        let config = config("ssd.onnx");
        assert!(check_topology(1, 1, &config).is_ok());

        let err = check_topology(2, 1, &config).unwrap_err();
        assert_eq!(err.to_string(), "Supports only 1 input topologies, model has 2");

        let err = check_topology(1, 3, &config).unwrap_err();
        assert_eq!(err.to_string(), "Supports only 1 output topologies, model has 3");
    }

    #[tokio::test]
    async fn test_request_lifecycle() -> Result<()> {
        let input = spec(Layout::Nchw, InputType::F32, ChannelOrder::Bgr);
        let mut network = Network::from_plan(identity_plan([1, 1, 2, 7]), input, 2)?;

        let detections: Tensor = tract_ndarray::Array4::<f32>::from_elem((1, 1, 2, 7), 0.5).into();

        // Slot must be started before it can be awaited or drained
        assert!(network.wait(0).await.is_err());
        assert!(network.get_output(0).is_err());

        network.exec_net(0, detections.clone())?;
        assert!(network.exec_net(0, detections.clone()).is_err());
        network.exec_net(1, detections)?;

        network.wait(1).await?;
        network.wait(0).await?;
        let output = network.get_output(0)?;
        assert_eq!(output.shape(), &[1, 1, 2, 7]);
        assert!(output.iter().all(|v| *v == 0.5));

        // Slot 0 is free again, slot 1 still holds its output
        assert!(network.get_output(0).is_err());
        assert!(network.get_output(1).is_ok());
        assert!(network.exec_net(2, Tensor::from(0.0f32)).is_err());

        Ok(())
    }
}
