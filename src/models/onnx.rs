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

//! ONNX Runtime implementations of the network traits.
//!
//! Each adapter exclusively owns its [`Session`]; the session (and the device memory behind it) is released when the
//! adapter is dropped.

use std::{path::Path, sync::Arc};

use anyhow::Context;
use ndarray::{Array1, Array2, Array3, Array4, ArrayD, ArrayView3, ArrayView4, Axis, IxDyn};
use ort::{
	tensor::{FromArray, InputTensor, OrtOwnedTensor},
	Environment, OrtResult, Session, SessionBuilder
};

use super::{LatentDecoder, NoisePredictor, SafetyClassifier, TextEncoder, TokenSequence};
use crate::{config::TimestepType, DiffusionDevice};

pub(crate) fn load_session(environment: &Arc<Environment>, device: &DiffusionDevice, path: impl AsRef<Path>) -> OrtResult<Session> {
	SessionBuilder::new(environment)?
		.with_execution_providers([device.clone().into()])?
		.with_model_from_file(path)
}

/// A CLIP text encoder taking `int32 input_ids[1, L]` and returning `last_hidden_state[1, L, D]` as its first output.
pub struct OnnxTextEncoder {
	session: Session
}

impl OnnxTextEncoder {
	/// Wraps an already loaded session.
	pub fn new(session: Session) -> Self {
		Self { session }
	}
}

impl TextEncoder for OnnxTextEncoder {
	fn encode(&self, tokens: &TokenSequence) -> anyhow::Result<Array2<f32>> {
		let input_ids = Array2::from_shape_vec((1, tokens.len()), tokens.iter().map(|&t| t as i32).collect())?;
		let outputs = self.session.run(vec![InputTensor::from_array(input_ids.into_dyn())])?;
		let hidden_states: OrtOwnedTensor<'_, f32, IxDyn> = outputs.first().context("text encoder produced no outputs")?.try_extract()?;
		let hidden_states: Array3<f32> = hidden_states.view().to_owned().into_dimensionality()?;
		Ok(hidden_states.index_axis_move(Axis(0), 0))
	}
}

/// A conditional UNet taking `(sample, timestep, encoder_hidden_states)`.
pub struct OnnxUNet {
	session: Session,
	timestep_type: TimestepType
}

impl OnnxUNet {
	/// Wraps an already loaded session whose `timestep` input has the given element type.
	pub fn new(session: Session, timestep_type: TimestepType) -> Self {
		Self { session, timestep_type }
	}
}

impl NoisePredictor for OnnxUNet {
	fn predict(&self, sample: ArrayView4<'_, f32>, timestep: f32, conditioning: ArrayView3<'_, f32>) -> anyhow::Result<Array4<f32>> {
		let timestep = match self.timestep_type {
			TimestepType::Float32 => InputTensor::from_array(Array1::from_elem(1, timestep).into_dyn()),
			TimestepType::Int64 => InputTensor::from_array(Array1::from_elem(1, timestep as i64).into_dyn())
		};
		let sample: ArrayD<f32> = sample.to_owned().into_dyn();
		let encoder_hidden_states: ArrayD<f32> = conditioning.to_owned().into_dyn();

		let outputs = self
			.session
			.run(vec![InputTensor::from_array(sample), timestep, InputTensor::from_array(encoder_hidden_states)])?;
		let noise_pred: OrtOwnedTensor<'_, f32, IxDyn> = outputs.first().context("unet produced no outputs")?.try_extract()?;
		Ok(noise_pred.view().to_owned().into_dimensionality()?)
	}
}

/// A VAE decoder taking `latent_sample[1, C, h, w]` and returning `sample[1, 3, H, W]`.
pub struct OnnxVaeDecoder {
	session: Session
}

impl OnnxVaeDecoder {
	/// Wraps an already loaded session.
	pub fn new(session: Session) -> Self {
		Self { session }
	}
}

impl LatentDecoder for OnnxVaeDecoder {
	fn decode(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		let outputs = self.session.run(vec![InputTensor::from_array(latents.to_owned().into_dyn())])?;
		let image: OrtOwnedTensor<'_, f32, IxDyn> = outputs.first().context("vae decoder produced no outputs")?.try_extract()?;
		Ok(image.view().to_owned().into_dimensionality()?)
	}
}

/// The Stable Diffusion safety checker taking `(clip_input, images)`; the verdict is the last output (`bool[1]`).
pub struct OnnxSafetyChecker {
	session: Session
}

impl OnnxSafetyChecker {
	/// Wraps an already loaded session.
	pub fn new(session: Session) -> Self {
		Self { session }
	}
}

impl SafetyClassifier for OnnxSafetyChecker {
	fn classify(&self, clip_input: ArrayView4<'_, f32>, images: ArrayView4<'_, f32>) -> anyhow::Result<bool> {
		let outputs = self.session.run(vec![
			InputTensor::from_array(clip_input.to_owned().into_dyn()),
			InputTensor::from_array(images.to_owned().into_dyn()),
		])?;
		let has_nsfw_concepts: OrtOwnedTensor<'_, bool, IxDyn> = outputs.last().context("safety checker produced no outputs")?.try_extract()?;
		let verdict = has_nsfw_concepts.view().iter().next().copied();
		verdict.context("safety checker returned an empty verdict")
	}
}
