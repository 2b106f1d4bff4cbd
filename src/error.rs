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

//! Errors produced while loading or running a diffusion pipeline.

use std::fmt;

use thiserror::Error;

/// Identifies which collaborator of the pipeline failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
	/// The prompt tokenizer.
	Tokenizer,
	/// The CLIP text encoder.
	TextEncoder,
	/// The noise-predicting UNet.
	UNet,
	/// The VAE decoder.
	VaeDecoder,
	/// The NSFW safety checker.
	SafetyChecker
}

impl fmt::Display for ModelKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			ModelKind::Tokenizer => "tokenizer",
			ModelKind::TextEncoder => "text encoder",
			ModelKind::UNet => "unet",
			ModelKind::VaeDecoder => "vae decoder",
			ModelKind::SafetyChecker => "safety checker"
		})
	}
}

/// An error that aborts generation.
///
/// A safety checker rejection is not an error; see [`Txt2ImgOutput::Rejected`](crate::Txt2ImgOutput::Rejected).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DiffusionError {
	/// Missing or invalid model paths, dimensions or generation options. Always raised before inference starts.
	#[error("invalid configuration: {0}")]
	Configuration(String),
	/// A prompt tokenized to more tokens than the text encoder accepts and truncation is disabled.
	#[error("prompt is {tokens} tokens long, but the text encoder accepts at most {max}")]
	PromptTooLong {
		/// Number of tokens the prompt produced.
		tokens: usize,
		/// The text encoder's fixed sequence length.
		max: usize
	},
	/// A network returned a tensor whose shape disagrees with what the pipeline expects.
	#[error("{model} returned a tensor of shape {actual:?}, expected {expected:?}")]
	ShapeMismatch {
		/// The network that produced the tensor.
		model: ModelKind,
		/// The expected shape.
		expected: Vec<usize>,
		/// The shape actually returned.
		actual: Vec<usize>
	},
	/// The compute backend failed while running a network.
	#[error("{model} failed: {source:#}")]
	Backend {
		/// The network that failed.
		model: ModelKind,
		/// The underlying backend error.
		#[source]
		source: anyhow::Error
	},
	/// The scheduler was driven outside of its contract (unknown timestep, step before scaling, ...).
	#[error("scheduler error: {0:#}")]
	Scheduler(#[source] anyhow::Error),
	/// A step callback asked the pipeline to stop.
	#[error("generation cancelled after step {step}")]
	Cancelled {
		/// Index of the last completed step.
		step: usize
	},
	/// Failed to read a model manifest.
	#[error(transparent)]
	Io(#[from] std::io::Error),
	/// Failed to parse a model manifest.
	#[error("failed to parse model manifest: {0}")]
	Manifest(#[from] toml::de::Error)
}

impl DiffusionError {
	pub(crate) fn backend(model: ModelKind) -> impl FnOnce(anyhow::Error) -> Self {
		move |source| DiffusionError::Backend { model, source }
	}

	pub(crate) fn config(message: impl Into<String>) -> Self {
		DiffusionError::Configuration(message.into())
	}
}

/// Checks that a tensor produced by `model` has exactly the `expected` shape.
pub(crate) fn expect_shape(model: ModelKind, actual: &[usize], expected: &[usize]) -> Result<(), DiffusionError> {
	if actual != expected {
		return Err(DiffusionError::ShapeMismatch {
			model,
			expected: expected.to_vec(),
			actual: actual.to_vec()
		});
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::{expect_shape, DiffusionError, ModelKind};

	#[test]
	fn test_messages_name_the_failing_model() {
		let err = expect_shape(ModelKind::UNet, &[1, 4, 8, 8], &[2, 4, 8, 8]).unwrap_err();
		assert_eq!(err.to_string(), "unet returned a tensor of shape [1, 4, 8, 8], expected [2, 4, 8, 8]");

		let err = DiffusionError::backend(ModelKind::VaeDecoder)(anyhow::anyhow!("out of memory"));
		assert_eq!(err.to_string(), "vae decoder failed: out of memory");
	}

	#[test]
	fn test_matching_shape_passes() {
		assert!(expect_shape(ModelKind::TextEncoder, &[77, 768], &[77, 768]).is_ok());
	}
}
