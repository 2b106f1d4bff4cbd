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

use image::RgbImage;
use ndarray::{concatenate, Array4, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{
	guidance::{guide, split_noise_pred},
	latents::initial_latents,
	postprocess::to_rgb8
};
use crate::{error::expect_shape, DiffusionError, DiffusionScheduler, ModelKind, StableDiffusionCallback, StableDiffusionPipeline};

/// The result of a text-to-image run.
#[derive(Debug, Clone)]
pub enum Txt2ImgOutput {
	/// The generated image.
	Image(RgbImage),
	/// The safety checker flagged the generated image; no image is returned.
	Rejected
}

impl Txt2ImgOutput {
	/// Returns the image, or `None` if it was rejected by the safety checker.
	pub fn into_image(self) -> Option<RgbImage> {
		match self {
			Txt2ImgOutput::Image(image) => Some(image),
			Txt2ImgOutput::Rejected => None
		}
	}

	/// Whether the safety checker rejected the image.
	pub fn is_rejected(&self) -> bool {
		matches!(self, Txt2ImgOutput::Rejected)
	}
}

/// Options for a text-to-image run.
#[derive(Debug)]
pub struct StableDiffusionTxt2ImgOptions {
	pub(crate) height: u32,
	pub(crate) width: u32,
	pub(crate) guidance_scale: f32,
	pub(crate) steps: usize,
	pub(crate) seed: Option<u64>,
	pub(crate) positive_prompt: String,
	pub(crate) negative_prompt: Option<String>,
	pub(crate) safety_checker: bool,
	pub(crate) callback: Option<StableDiffusionCallback>
}

impl Default for StableDiffusionTxt2ImgOptions {
	fn default() -> Self {
		Self {
			height: 512,
			width: 512,
			guidance_scale: 7.5,
			steps: 15,
			seed: None,
			positive_prompt: String::new(),
			negative_prompt: None,
			safety_checker: false,
			callback: None
		}
	}
}

// builder for options
impl StableDiffusionTxt2ImgOptions {
	/// Set the size of the image. **Size will be rounded down to a multiple of 8.**
	pub fn with_size(self, width: u32, height: u32) -> Self {
		self.with_width(width).with_height(height)
	}
	/// Set the width of the image. **Width will be rounded down to a multiple of 8.**
	#[inline]
	pub fn with_width(mut self, width: u32) -> Self {
		self.width = (width / 8).max(1) * 8;
		self
	}
	/// Set the height of the image. **Height will be rounded down to a multiple of 8.**
	#[inline]
	pub fn with_height(mut self, height: u32) -> Self {
		self.height = (height / 8).max(1) * 8;
		self
	}
	/// The number of steps to take to generate the image. More steps typically yields higher quality images.
	pub fn with_steps(mut self, steps: usize) -> Self {
		self.steps = steps;
		self
	}
	/// Set the prompts to use when generating the image. An empty or missing negative prompt uses the model's blank
	/// prompt as the unconditional input.
	pub fn with_prompts<P>(mut self, positive_prompt: P, negative_prompt: Option<P>) -> Self
	where
		P: Into<String>
	{
		self.positive_prompt = positive_prompt.into();
		self.negative_prompt = negative_prompt.map(Into::into);
		self
	}
	/// Set the seed to use when first generating noise.
	pub fn with_seed(mut self, seed: u64) -> Self {
		self.seed = Some(seed);
		self
	}
	/// Use a random seed, so that each run generates a different image. The chosen seed is logged.
	pub fn with_random_seed(mut self) -> Self {
		self.seed = None;
		self
	}
	/// The 'guidance scale' for classifier-free guidance. A lower guidance scale gives the model more freedom, but the
	/// output may not match the prompt. A higher guidance scale mean the model will match the prompt(s) more strictly,
	/// but may introduce artifacts; `7.5` is a good balance. `1.0` disables guidance.
	pub fn with_guidance_scale(mut self, guidance_scale: f32) -> Self {
		self.guidance_scale = guidance_scale;
		self
	}
	/// Run the generated image through the pipeline's safety checker. Flagged images are returned as
	/// [`Txt2ImgOutput::Rejected`].
	pub fn with_safety_checker(mut self, enabled: bool) -> Self {
		self.safety_checker = enabled;
		self
	}
}

// builder for callbacks
impl StableDiffusionTxt2ImgOptions {
	/// Calls `callback(step, timestep)` every `frequency` steps. Return `false` to cancel generation.
	pub fn callback_progress<F>(mut self, frequency: usize, callback: F) -> Self
	where
		F: Fn(usize, f32) -> bool + 'static
	{
		self.callback = Some(StableDiffusionCallback::Progress { frequency, cb: Box::new(callback) });
		self
	}
	/// Calls `callback(step, timestep, latents)` every `frequency` steps with the scheduler's output latents. Return
	/// `false` to cancel generation.
	pub fn callback_latents<F>(mut self, frequency: usize, callback: F) -> Self
	where
		F: Fn(usize, f32, Array4<f32>) -> bool + 'static
	{
		self.callback = Some(StableDiffusionCallback::Latents { frequency, cb: Box::new(callback) });
		self
	}
	/// Calls `callback(step, timestep, image)` every `frequency` steps (except step 0) with the current latents decoded
	/// by the VAE. Return `false` to cancel generation.
	pub fn callback_decoded<F>(mut self, frequency: usize, callback: F) -> Self
	where
		F: Fn(usize, f32, RgbImage) -> bool + 'static
	{
		self.callback = Some(StableDiffusionCallback::Decoded { frequency, cb: Box::new(callback) });
		self
	}
}

impl StableDiffusionTxt2ImgOptions {
	fn validate(&self, pipeline: &StableDiffusionPipeline) -> Result<(), DiffusionError> {
		if self.steps == 0 {
			return Err(DiffusionError::config("`steps` must be at least 1"));
		}
		let factor = pipeline.config.vae.scale_factor;
		if self.width == 0 || self.height == 0 || self.width % factor != 0 || self.height % factor != 0 {
			return Err(DiffusionError::config(format!(
				"`width` ({}) and `height` ({}) must be non-zero multiples of {factor}",
				self.width, self.height
			)));
		}
		if !self.guidance_scale.is_finite() {
			return Err(DiffusionError::config(format!("`guidance_scale` ({}) must be finite", self.guidance_scale)));
		}
		if matches!(&self.callback, Some(callback) if callback.frequency() == 0) {
			return Err(DiffusionError::config("callback `frequency` must be at least 1"));
		}
		if self.safety_checker && !pipeline.has_safety_checker() {
			return Err(DiffusionError::config("safety checking was requested, but no safety checker is loaded"));
		}
		Ok(())
	}

	/// Runs the registered callback for step `i`, returning `false` if generation should stop.
	fn callback(&self, pipeline: &StableDiffusionPipeline, i: usize, t: f32, latents: &Array4<f32>) -> Result<bool, DiffusionError> {
		Ok(match &self.callback {
			Some(StableDiffusionCallback::Progress { frequency, cb }) if i % frequency == 0 => cb(i, t),
			Some(StableDiffusionCallback::Latents { frequency, cb }) if i % frequency == 0 => cb(i, t, latents.clone()),
			Some(StableDiffusionCallback::Decoded { frequency, cb }) if i != 0 && i % frequency == 0 => {
				cb(i, t, pipeline.decode_to_image(latents.view())?)
			}
			_ => true
		})
	}

	/// Generates an image from the configured prompts.
	///
	/// `scheduler` must be a Stable Diffusion-compatible scheduler. All options are validated before any network is
	/// run.
	///
	/// # Errors
	/// Fails with [`DiffusionError::Configuration`] for invalid options, [`DiffusionError::Cancelled`] if a callback
	/// stopped generation, and with a shape mismatch or backend error naming the failing network otherwise. A safety
	/// checker rejection is **not** an error; it is reported as [`Txt2ImgOutput::Rejected`].
	///
	/// # Examples
	///
	/// ```ignore
	/// let output = StableDiffusionTxt2ImgOptions::default()
	/// 	.with_prompts("photo of a red fox", None)
	/// 	.with_safety_checker(true)
	/// 	.run(&pipeline, &mut scheduler)?;
	/// if let Some(image) = output.into_image() {
	/// 	image.save("result.png")?;
	/// }
	/// ```
	pub fn run<S: DiffusionScheduler>(&self, pipeline: &StableDiffusionPipeline, scheduler: &mut S) -> Result<Txt2ImgOutput, DiffusionError> {
		self.validate(pipeline)?;

		let seed = self.seed.unwrap_or_else(|| rand::thread_rng().gen::<u64>());
		let mut rng = StdRng::seed_from_u64(seed);
		tracing::info!(
			seed,
			steps = self.steps,
			width = self.width,
			height = self.height,
			guidance_scale = self.guidance_scale,
			"starting text-to-image generation"
		);

		let text_embeddings = pipeline.encode_prompt(&self.positive_prompt, self.negative_prompt.as_deref())?;

		scheduler.set_timesteps(self.steps);
		let timesteps = scheduler.timesteps().to_owned();
		if timesteps.len() != self.steps {
			return Err(DiffusionError::Scheduler(anyhow::anyhow!(
				"scheduler produced {} timesteps for {} steps",
				timesteps.len(),
				self.steps
			)));
		}

		let factor = pipeline.config.vae.scale_factor;
		let latents_shape = (
			1,
			pipeline.config.unet.latent_channels,
			(self.height / factor) as usize,
			(self.width / factor) as usize
		);
		let mut latents = initial_latents(latents_shape, scheduler.init_noise_sigma(), &mut rng);

		for (i, &t) in timesteps.iter().enumerate() {
			let latent_model_input = concatenate![Axis(0), latents, latents];
			let latent_model_input = scheduler.scale_model_input(latent_model_input.view(), t).map_err(DiffusionError::Scheduler)?;

			let noise_pred = pipeline
				.unet
				.predict(latent_model_input.view(), t, text_embeddings.view())
				.map_err(DiffusionError::backend(ModelKind::UNet))?;
			expect_shape(ModelKind::UNet, noise_pred.shape(), latent_model_input.shape())?;

			let (noise_pred_uncond, noise_pred_text) = split_noise_pred(&noise_pred);
			let noise_pred = guide(noise_pred_uncond, noise_pred_text, self.guidance_scale);

			latents = scheduler
				.step(noise_pred.view(), t, latents.view(), &mut rng)
				.map_err(DiffusionError::Scheduler)?
				.into_prev_sample();

			let (min, max) = latents.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
			tracing::debug!(step = i, timestep = t, min, max, "denoising step");

			if !self.callback(pipeline, i, t, &latents)? {
				tracing::info!(step = i, "generation cancelled by callback");
				return Err(DiffusionError::Cancelled { step: i });
			}
		}

		let pixels = pipeline.decode_latents(latents.view())?;
		let image = to_rgb8(pixels.view())?;

		if self.safety_checker {
			let safe = pipeline.check_safety(pixels.view())?;
			tracing::info!(safe, "safety checker verdict");
			if !safe {
				return Ok(Txt2ImgOutput::Rejected);
			}
		}

		tracing::info!(width = image.width(), height = image.height(), "finished text-to-image generation");
		Ok(Txt2ImgOutput::Image(image))
	}
}
