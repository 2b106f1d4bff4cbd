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

use std::fmt::Debug;

use image::RgbImage;
use ndarray::Array4;

mod conditioning;
mod guidance;
mod impl_main;
mod impl_txt2img;
mod latents;
mod postprocess;
mod safety_checker;

pub use self::impl_main::{StableDiffusionModels, StableDiffusionPipeline};
pub use self::impl_txt2img::{StableDiffusionTxt2ImgOptions, Txt2ImgOutput};
pub use self::postprocess::{quantize, to_rgb8};
use crate::{models::PromptOverflow, DiffusionDeviceControl};

/// Options for the Stable Diffusion pipeline. This includes options like device control and prompt overflow handling.
#[derive(Default, Debug, Clone)]
pub struct StableDiffusionOptions {
	/// A [`DiffusionDeviceControl`] object, mapping what device to place each model on.
	pub devices: DiffusionDeviceControl,
	/// What to do with prompts longer than the text encoder's sequence length.
	pub prompt_overflow: PromptOverflow
}

/// Describes a function to be called on each step of the pipeline.
///
/// Callbacks run after the scheduler step. Returning `false` stops generation at that step, and `run()` returns
/// [`DiffusionError::Cancelled`](crate::DiffusionError::Cancelled).
pub enum StableDiffusionCallback {
	/// A simple callback to be used for e.g. reporting progress updates.
	Progress {
		/// Describes how frequently to call this callback (3 = every 3 steps).
		frequency: usize,
		/// Function Parameters:
		/// - **`step`** (usize): The current step number.
		/// - **`timestep`** (f32): This step's timestep.
		cb: Box<dyn Fn(usize, f32) -> bool>
	},
	/// A callback to receive this step's latents.
	Latents {
		/// Describes how frequently to call this callback (3 = every 3 steps).
		frequency: usize,
		/// Function Parameters:
		/// - **`step`** (usize): The current step number.
		/// - **`timestep`** (f32): This step's timestep.
		/// - **`latents`** (`Array4<f32>`): Scheduler latent outputs for this step.
		cb: Box<dyn Fn(usize, f32, Array4<f32>) -> bool>
	},
	/// A callback to receive this step's fully decoded latents, to be used for e.g. showing image progress visually.
	/// This is very expensive, as it will execute the VAE decoder on each call. Never called for step 0.
	Decoded {
		/// Describes how frequently to call this callback (3 = every 3 steps).
		frequency: usize,
		/// Function Parameters:
		/// - **`step`** (usize): The current step number.
		/// - **`timestep`** (f32): This step's timestep.
		/// - **`image`** (`RgbImage`): The decoded image for this step.
		cb: Box<dyn Fn(usize, f32, RgbImage) -> bool>
	}
}

impl StableDiffusionCallback {
	pub(crate) fn frequency(&self) -> usize {
		match self {
			StableDiffusionCallback::Progress { frequency, .. }
			| StableDiffusionCallback::Latents { frequency, .. }
			| StableDiffusionCallback::Decoded { frequency, .. } => *frequency
		}
	}
}

impl Debug for StableDiffusionCallback {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("<StableDiffusionCallback>")
	}
}
