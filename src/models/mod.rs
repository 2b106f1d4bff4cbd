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

//! The networks a diffusion pipeline drives, as fixed-shape tensor functions.
//!
//! Every network is consumed through one of the traits in this module. [`onnx`] implements them on top of ONNX
//! Runtime sessions; tests and alternative backends can provide their own implementations.

use std::ops::Deref;

use ndarray::{Array2, Array4, ArrayView3, ArrayView4};

use crate::DiffusionError;

pub mod onnx;

/// Splits a prompt into token ids.
pub trait PromptTokenizer {
	/// Tokenizes `prompt`. The returned sequence has a variable length and includes whatever start/end tokens the
	/// tokenizer emits; the pipeline pads or truncates it to the text encoder's length.
	fn tokenize(&self, prompt: &str) -> anyhow::Result<Vec<u32>>;
}

/// Encodes a fixed-length token sequence into per-token embeddings.
pub trait TextEncoder {
	/// Returns an embedding of shape `[L, D]` for a sequence of length `L`.
	fn encode(&self, tokens: &TokenSequence) -> anyhow::Result<Array2<f32>>;
}

/// Predicts the noise contained in a batch of latents.
pub trait NoisePredictor {
	/// `sample` is `[2, C, h, w]` (unconditional & conditional copies of the same latent), `conditioning` is
	/// `[2, L, D]`. Returns the predicted noise with the same shape as `sample`.
	fn predict(&self, sample: ArrayView4<'_, f32>, timestep: f32, conditioning: ArrayView3<'_, f32>) -> anyhow::Result<Array4<f32>>;
}

/// Decodes latents into pixel space.
pub trait LatentDecoder {
	/// Maps `[1, C, h, w]` latents to `[1, 3, h * f, w * f]` pixels in roughly `[-1, 1]`.
	fn decode(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>>;
}

/// Flags not-safe-for-work images.
pub trait SafetyClassifier {
	/// `clip_input` is the normalized image in `[1, 3, s, s]` layout, `images` is the same data in `[1, s, s, 3]`
	/// layout. Returns `true` if the image is **unsafe**.
	fn classify(&self, clip_input: ArrayView4<'_, f32>, images: ArrayView4<'_, f32>) -> anyhow::Result<bool>;
}

/// What to do with prompts that tokenize to more tokens than the text encoder accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptOverflow {
	/// Keep the leading tokens and end the sequence with the prompt's final (end-of-text) token.
	#[default]
	Truncate,
	/// Fail with [`DiffusionError::PromptTooLong`].
	Error
}

/// A token sequence of exactly the text encoder's length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSequence(Vec<u32>);

impl TokenSequence {
	/// Right-pads `tokens` to `len` with `pad_token`, applying `overflow` if there are more than `len` tokens.
	pub fn from_tokens(mut tokens: Vec<u32>, len: usize, pad_token: u32, overflow: PromptOverflow) -> Result<Self, DiffusionError> {
		if tokens.len() > len {
			match overflow {
				PromptOverflow::Error => return Err(DiffusionError::PromptTooLong { tokens: tokens.len(), max: len }),
				PromptOverflow::Truncate => {
					tracing::warn!("prompt is {} tokens long, truncating to {len}", tokens.len());
					let last = tokens[tokens.len() - 1];
					tokens.truncate(len);
					if let Some(end) = tokens.last_mut() {
						*end = last;
					}
				}
			}
		}
		tokens.resize(len, pad_token);
		Ok(Self(tokens))
	}

	/// The sequence used for an empty prompt: a start token followed by padding.
	pub fn blank(len: usize, bos_token: u32, pad_token: u32) -> Self {
		let mut tokens = vec![pad_token; len];
		if let Some(first) = tokens.first_mut() {
			*first = bos_token;
		}
		Self(tokens)
	}
}

impl Deref for TokenSequence {
	type Target = [u32];

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

#[cfg(test)]
mod tests {
	use super::{PromptOverflow, TokenSequence};
	use crate::DiffusionError;

	#[test]
	fn test_pads_with_pad_token() {
		let seq = TokenSequence::from_tokens(vec![49406, 320, 736, 49407], 8, 49407, PromptOverflow::Truncate).unwrap();
		assert_eq!(&*seq, &[49406, 320, 736, 49407, 49407, 49407, 49407, 49407]);
	}

	#[test]
	fn test_blank_sequence() {
		let seq = TokenSequence::blank(77, 49406, 49407);
		assert_eq!(seq.len(), 77);
		assert_eq!(seq[0], 49406);
		assert!(seq[1..].iter().all(|&t| t == 49407));
	}

	#[test]
	fn test_overflow_truncates_and_keeps_end_token() {
		let tokens = vec![1, 10, 11, 12, 13, 14, 2];
		let seq = TokenSequence::from_tokens(tokens, 5, 0, PromptOverflow::Truncate).unwrap();
		assert_eq!(&*seq, &[1, 10, 11, 12, 2]);
	}

	#[test]
	fn test_overflow_error() {
		let tokens = vec![1, 10, 11, 12, 13, 14, 2];
		match TokenSequence::from_tokens(tokens, 5, 0, PromptOverflow::Error) {
			Err(DiffusionError::PromptTooLong { tokens, max }) => {
				assert_eq!(tokens, 7);
				assert_eq!(max, 5);
			}
			other => panic!("expected PromptTooLong, got {other:?}")
		}
	}

	#[test]
	fn test_exact_length_is_untouched() {
		let seq = TokenSequence::from_tokens(vec![1, 2, 3], 3, 0, PromptOverflow::Error).unwrap();
		assert_eq!(&*seq, &[1, 2, 3]);
	}
}
