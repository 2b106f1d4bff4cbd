// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `ort-diffusers` generates images from text prompts with [Stable Diffusion] exported to [ONNX Runtime].
//!
//! The crate implements the latent diffusion sampling loop: prompt conditioning, seeded latent initialization,
//! classifier-free guidance over a discrete noise schedule, VAE decoding, 8-bit quantization and an optional safety
//! checker pass. The networks themselves are opaque; each one sits behind a narrow trait in [`models`] so they can be
//! backed by ONNX Runtime sessions or by anything else producing tensors of the right shape.
//!
//! ```ignore
//! use ort_diffusers::{
//! 	EulerDiscreteScheduler, OrtEnvironment, SchedulerOptimizedDefaults, StableDiffusionOptions, StableDiffusionPipeline,
//! 	StableDiffusionTxt2ImgOptions, Txt2ImgOutput
//! };
//!
//! let environment = OrtEnvironment::default().into_arc();
//! let mut scheduler = EulerDiscreteScheduler::stable_diffusion_v1_optimized_default()?;
//! let pipeline = StableDiffusionPipeline::new(&environment, "./stable-diffusion-v1-5/", StableDiffusionOptions::default())?;
//!
//! match StableDiffusionTxt2ImgOptions::default()
//! 	.with_prompts("photo of a red fox", None)
//! 	.run(&pipeline, &mut scheduler)?
//! {
//! 	Txt2ImgOutput::Image(image) => image.save("result.png")?,
//! 	Txt2ImgOutput::Rejected => eprintln!("image was flagged by the safety checker")
//! }
//! ```
//!
//! [Stable Diffusion]: https://github.com/CompVis/stable-diffusion
//! [ONNX Runtime]: https://onnxruntime.ai/

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

#[cfg(feature = "tokenizers")]
pub mod clip;
pub mod config;
pub mod error;
pub mod models;
pub mod pipelines;
pub mod schedulers;
pub(crate) mod util;

pub use ort::Environment as OrtEnvironment;
use ort::ExecutionProvider;

pub use self::error::{DiffusionError, ModelKind};
pub use self::pipelines::*;
pub use self::schedulers::*;

/// The strategy to use for extending the device memory arena.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ArenaExtendStrategy {
	/// Subsequent memory allocations extend by larger amounts (multiplied by powers of two)
	#[default]
	PowerOfTwo,
	/// Memory allocations extend only by the requested amount.
	SameAsRequested
}

impl From<ArenaExtendStrategy> for String {
	fn from(val: ArenaExtendStrategy) -> Self {
		match val {
			ArenaExtendStrategy::PowerOfTwo => "kNextPowerOfTwo".to_string(),
			ArenaExtendStrategy::SameAsRequested => "kSameAsRequested".to_string()
		}
	}
}

/// Device options for the CUDA execution provider.
///
/// For low-VRAM devices, a float16 UNet with a memory limit keeps the denoising loop on the GPU:
/// ```ignore
/// CUDADeviceOptions {
/// 	memory_limit: Some(3000000000),
/// 	arena_extend_strategy: Some(ArenaExtendStrategy::SameAsRequested)
/// }
/// ```
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct CUDADeviceOptions {
	/// The strategy to use for extending the device memory arena. See [`ArenaExtendStrategy`] for more info.
	pub arena_extend_strategy: Option<ArenaExtendStrategy>,
	/// Per-session (aka per-model) memory limit in bytes.
	pub memory_limit: Option<usize>
}

impl From<CUDADeviceOptions> for ExecutionProvider {
	fn from(val: CUDADeviceOptions) -> Self {
		let mut ep = ExecutionProvider::cuda();
		if let Some(arena_extend_strategy) = val.arena_extend_strategy {
			ep = ep.with("arena_extend_strategy", arena_extend_strategy);
		}
		if let Some(memory_limit) = val.memory_limit {
			ep = ep.with("gpu_mem_limit", memory_limit.to_string());
		}
		ep
	}
}

/// A device to place one of the diffusion networks on.
///
/// If a configured execution provider is not available, ONNX Runtime falls back to the CPU.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub enum DiffusionDevice {
	/// Use the CPU as a device.
	#[default]
	CPU,
	/// Use NVIDIA CUDA as a device. First value is the device ID, second is additional provider options.
	CUDA(usize, Option<CUDADeviceOptions>),
	/// Use NVIDIA TensorRT as a device.
	TensorRT,
	/// Custom execution provider w/ options, e.g. DirectML builds of ONNX Runtime.
	Custom(ExecutionProvider)
}

impl From<DiffusionDevice> for ExecutionProvider {
	fn from(value: DiffusionDevice) -> Self {
		match value {
			DiffusionDevice::CPU => ExecutionProvider::cpu(),
			DiffusionDevice::CUDA(device, options) => {
				let ep: ExecutionProvider = options.unwrap_or_default().into();
				ep.with("device_id", device.to_string())
			}
			DiffusionDevice::TensorRT => ExecutionProvider::tensorrt(),
			DiffusionDevice::Custom(ep) => ep
		}
	}
}

/// Select which device each network should be placed on.
///
/// The UNet runs once per timestep and dominates generation time; on small GPUs it is usually the only network worth
/// moving off the CPU:
/// ```ignore
/// DiffusionDeviceControl {
/// 	unet: DiffusionDevice::CUDA(0, None),
/// 	..Default::default()
/// }
/// ```
#[derive(Debug, Clone)]
pub struct DiffusionDeviceControl {
	/// The device on which to place the text encoder (CLIP).
	pub text_encoder: DiffusionDevice,
	/// The device on which to place the noise-predicting UNet.
	pub unet: DiffusionDevice,
	/// The device on which to place the VAE decoder.
	pub vae_decoder: DiffusionDevice,
	/// The device on which to place the safety checker.
	pub safety_checker: DiffusionDevice
}

impl DiffusionDeviceControl {
	/// Constructs [`DiffusionDeviceControl`] with all networks on the same device.
	///
	/// Note that a `memory_limit` set in [`CUDADeviceOptions`] applies **per session**, not to the whole pipeline.
	pub fn all(device: DiffusionDevice) -> Self {
		Self {
			text_encoder: device.clone(),
			unet: device.clone(),
			vae_decoder: device.clone(),
			safety_checker: device
		}
	}
}

impl Default for DiffusionDeviceControl {
	fn default() -> Self {
		DiffusionDeviceControl::all(DiffusionDevice::CPU)
	}
}
