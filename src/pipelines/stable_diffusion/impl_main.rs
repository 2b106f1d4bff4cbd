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

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;
use ndarray::{Array3, Array4, ArrayView4};
use ort::Environment;

use super::{
	conditioning::{Conditioner, TokenLayout},
	postprocess::to_rgb8,
	safety_checker, StableDiffusionOptions
};
use crate::{
	clip::CLIPStandardTokenizer,
	config::{StableDiffusionConfig, TokenizerConfig},
	error::expect_shape,
	models::{
		onnx::{load_session, OnnxSafetyChecker, OnnxTextEncoder, OnnxUNet, OnnxVaeDecoder},
		LatentDecoder, NoisePredictor, PromptTokenizer, SafetyClassifier, TextEncoder
	},
	DiffusionDevice, DiffusionError, ModelKind
};

/// The networks making up a Stable Diffusion pipeline.
pub struct StableDiffusionModels {
	/// Prompt tokenizer.
	pub tokenizer: Box<dyn PromptTokenizer>,
	/// CLIP text encoder.
	pub text_encoder: Box<dyn TextEncoder>,
	/// Noise-predicting UNet.
	pub unet: Box<dyn NoisePredictor>,
	/// VAE decoder.
	pub vae_decoder: Box<dyn LatentDecoder>,
	/// Optional NSFW safety checker.
	pub safety_checker: Option<Box<dyn SafetyClassifier>>
}

/// A [Stable Diffusion](https://github.com/CompVis/stable-diffusion) pipeline.
///
/// The pipeline exclusively owns its networks; their backend resources are released when it is dropped.
///
/// ```ignore
/// use ort_diffusers::{
/// 	EulerDiscreteScheduler, OrtEnvironment, SchedulerOptimizedDefaults, StableDiffusionOptions,
/// 	StableDiffusionPipeline, StableDiffusionTxt2ImgOptions
/// };
///
/// let environment = OrtEnvironment::default().into_arc();
/// let mut scheduler = EulerDiscreteScheduler::stable_diffusion_v1_optimized_default()?;
/// let pipeline =
/// 	StableDiffusionPipeline::new(&environment, "./stable-diffusion-v1-5/", StableDiffusionOptions::default())?;
///
/// let output = StableDiffusionTxt2ImgOptions::default()
/// 	.with_prompts("photo of a red fox", None)
/// 	.run(&pipeline, &mut scheduler)?;
/// ```
pub struct StableDiffusionPipeline {
	pub(crate) options: StableDiffusionOptions,
	pub(crate) config: StableDiffusionConfig,
	pub(crate) tokenizer: Box<dyn PromptTokenizer>,
	pub(crate) text_encoder: Box<dyn TextEncoder>,
	pub(crate) unet: Box<dyn NoisePredictor>,
	pub(crate) vae_decoder: Box<dyn LatentDecoder>,
	pub(crate) safety_checker: Option<Box<dyn SafetyClassifier>>
}

fn model_path(root: &Path, path: &str, model: ModelKind) -> Result<PathBuf, DiffusionError> {
	let path = root.join(path);
	if !path.is_file() {
		return Err(DiffusionError::config(format!("{model} not found at {}", path.display())));
	}
	Ok(path)
}

fn onnx_session(environment: &Arc<Environment>, device: &DiffusionDevice, path: &Path, model: ModelKind) -> Result<ort::Session, DiffusionError> {
	load_session(environment, device, path).map_err(|e| DiffusionError::backend(model)(e.into()))
}

impl StableDiffusionPipeline {
	/// Creates a new Stable Diffusion pipeline, loading the manifest and ONNX models from `root`.
	///
	/// The manifest is validated and every model path is checked before any model is loaded.
	pub fn new(environment: &Arc<Environment>, root: impl Into<PathBuf>, options: StableDiffusionOptions) -> Result<Self, DiffusionError> {
		let root: PathBuf = root.into();
		let config = StableDiffusionConfig::from_dir(&root)?;

		let tokenizer_path = match &config.tokenizer {
			TokenizerConfig::CLIPTokenizer { path, .. } => model_path(&root, path, ModelKind::Tokenizer)?
		};
		let text_encoder_path = model_path(&root, &config.text_encoder.path, ModelKind::TextEncoder)?;
		let unet_path = model_path(&root, &config.unet.path, ModelKind::UNet)?;
		let vae_decoder_path = model_path(&root, &config.vae.decoder, ModelKind::VaeDecoder)?;
		let safety_checker_path = config
			.safety_checker
			.as_ref()
			.map(|safety_checker| model_path(&root, &safety_checker.path, ModelKind::SafetyChecker))
			.transpose()?;

		let devices = &options.devices;
		let tokenizer = CLIPStandardTokenizer::new(tokenizer_path).map_err(DiffusionError::backend(ModelKind::Tokenizer))?;
		let text_encoder = onnx_session(environment, &devices.text_encoder, &text_encoder_path, ModelKind::TextEncoder)?;
		let unet = onnx_session(environment, &devices.unet, &unet_path, ModelKind::UNet)?;
		let vae_decoder = onnx_session(environment, &devices.vae_decoder, &vae_decoder_path, ModelKind::VaeDecoder)?;
		let safety_checker = safety_checker_path
			.map(|path| onnx_session(environment, &devices.safety_checker, &path, ModelKind::SafetyChecker))
			.transpose()?;

		tracing::info!(
			root = %root.display(),
			safety_checker = safety_checker.is_some(),
			timestep_type = ?config.unet.timestep_type,
			"loaded stable diffusion pipeline"
		);

		let models = StableDiffusionModels {
			tokenizer: Box::new(tokenizer),
			text_encoder: Box::new(OnnxTextEncoder::new(text_encoder)),
			unet: Box::new(OnnxUNet::new(unet, config.unet.timestep_type)),
			vae_decoder: Box::new(OnnxVaeDecoder::new(vae_decoder)),
			safety_checker: safety_checker.map(|session| Box::new(OnnxSafetyChecker::new(session)) as Box<dyn SafetyClassifier>)
		};
		Self::from_models(config, models, options)
	}

	/// Creates a pipeline from already constructed networks.
	pub fn from_models(config: StableDiffusionConfig, models: StableDiffusionModels, options: StableDiffusionOptions) -> Result<Self, DiffusionError> {
		config.validate()?;
		Ok(Self {
			options,
			config,
			tokenizer: models.tokenizer,
			text_encoder: models.text_encoder,
			unet: models.unet,
			vae_decoder: models.vae_decoder,
			safety_checker: models.safety_checker
		})
	}

	/// The model manifest this pipeline was created with.
	pub fn config(&self) -> &StableDiffusionConfig {
		&self.config
	}

	/// Whether a safety checker is loaded.
	pub fn has_safety_checker(&self) -> bool {
		self.safety_checker.is_some()
	}

	/// Encodes a prompt pair into the `[2, L, D]` conditioning batch used by every denoising step.
	///
	/// Index 0 holds the negative prompt's embedding (or the blank prompt's, if `negative_prompt` is `None` or empty);
	/// index 1 holds the positive prompt's.
	pub fn encode_prompt(&self, prompt: &str, negative_prompt: Option<&str>) -> Result<Array3<f32>, DiffusionError> {
		let tokenizer = &self.config.tokenizer;
		let conditioner = Conditioner {
			tokenizer: &*self.tokenizer,
			text_encoder: &*self.text_encoder,
			layout: TokenLayout {
				max_length: tokenizer.model_max_length(),
				hidden_size: self.config.text_encoder.hidden_size,
				bos_token: tokenizer.bos_token(),
				pad_token: tokenizer.pad_token(),
				overflow: self.options.prompt_overflow
			}
		};
		conditioner.conditioning(prompt, negative_prompt)
	}

	/// Decodes `[1, C, h, w]` latents via the variational autoencoder into `[1, 3, h * f, w * f]` pixels.
	pub fn decode_latents(&self, latents: ArrayView4<'_, f32>) -> Result<Array4<f32>, DiffusionError> {
		let latents = 1.0 / self.config.vae.scaling_factor * &latents;
		let pixels = self.vae_decoder.decode(latents.view()).map_err(DiffusionError::backend(ModelKind::VaeDecoder))?;

		let factor = self.config.vae.scale_factor as usize;
		let shape = latents.shape();
		expect_shape(ModelKind::VaeDecoder, pixels.shape(), &[1, 3, shape[2] * factor, shape[3] * factor])?;
		Ok(pixels)
	}

	/// Decodes latents straight to an 8-bit RGB image.
	pub fn decode_to_image(&self, latents: ArrayView4<'_, f32>) -> Result<RgbImage, DiffusionError> {
		to_rgb8(self.decode_latents(latents)?.view())
	}

	/// Runs the safety checker on decoded `[1, 3, H, W]` pixels. Returns `true` if the image is safe.
	///
	/// # Errors
	/// Returns a configuration error if the pipeline has no safety checker.
	pub fn check_safety(&self, pixels: ArrayView4<'_, f32>) -> Result<bool, DiffusionError> {
		let classifier = self
			.safety_checker
			.as_deref()
			.ok_or_else(|| DiffusionError::config("safety checking was requested, but no safety checker is loaded"))?;
		safety_checker::is_safe(classifier, pixels, &self.config.feature_extractor)
	}
}
