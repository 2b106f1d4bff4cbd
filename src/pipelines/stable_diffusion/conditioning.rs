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

use ndarray::{stack, Array2, Array3, Axis};

use crate::{
	error::expect_shape,
	models::{PromptOverflow, PromptTokenizer, TextEncoder, TokenSequence},
	DiffusionError, ModelKind
};

/// Fixed sequence shape & special tokens of a text encoder.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TokenLayout {
	pub(crate) max_length: usize,
	pub(crate) hidden_size: usize,
	pub(crate) bos_token: u32,
	pub(crate) pad_token: u32,
	pub(crate) overflow: PromptOverflow
}

pub(crate) struct Conditioner<'p> {
	pub(crate) tokenizer: &'p dyn PromptTokenizer,
	pub(crate) text_encoder: &'p dyn TextEncoder,
	pub(crate) layout: TokenLayout
}

impl Conditioner<'_> {
	fn tokens(&self, prompt: Option<&str>) -> Result<TokenSequence, DiffusionError> {
		let TokenLayout { max_length, bos_token, pad_token, overflow, .. } = self.layout;
		match prompt {
			Some(prompt) if !prompt.is_empty() => {
				let ids = self.tokenizer.tokenize(prompt).map_err(DiffusionError::backend(ModelKind::Tokenizer))?;
				TokenSequence::from_tokens(ids, max_length, pad_token, overflow)
			}
			_ => Ok(TokenSequence::blank(max_length, bos_token, pad_token))
		}
	}

	fn embed(&self, prompt: Option<&str>) -> Result<Array2<f32>, DiffusionError> {
		let tokens = self.tokens(prompt)?;
		let embedding = self.text_encoder.encode(&tokens).map_err(DiffusionError::backend(ModelKind::TextEncoder))?;
		expect_shape(ModelKind::TextEncoder, embedding.shape(), &[self.layout.max_length, self.layout.hidden_size])?;
		Ok(embedding)
	}

	/// Builds the `[2, L, D]` conditioning batch: the negative (or blank) prompt's embedding at index 0, the positive
	/// prompt's at index 1.
	pub(crate) fn conditioning(&self, positive_prompt: &str, negative_prompt: Option<&str>) -> Result<Array3<f32>, DiffusionError> {
		let uncond = self.embed(negative_prompt)?;
		let cond = self.embed(Some(positive_prompt))?;
		stack(Axis(0), &[uncond.view(), cond.view()]).map_err(|e| DiffusionError::backend(ModelKind::TextEncoder)(e.into()))
	}
}

#[cfg(test)]
mod tests {
	use std::cell::RefCell;

	use ndarray::Array2;

	use super::{Conditioner, TokenLayout};
	use crate::{
		models::{PromptOverflow, PromptTokenizer, TextEncoder, TokenSequence},
		DiffusionError, ModelKind
	};

	struct WordTokenizer;

	impl PromptTokenizer for WordTokenizer {
		fn tokenize(&self, prompt: &str) -> anyhow::Result<Vec<u32>> {
			let mut ids = vec![1];
			ids.extend(prompt.split_whitespace().map(|w| 100 + w.len() as u32));
			ids.push(2);
			Ok(ids)
		}
	}

	/// Embeds token `i` as a row filled with its id; remembers every sequence it saw.
	#[derive(Default)]
	struct RecordingEncoder {
		seen: RefCell<Vec<Vec<u32>>>,
		hidden_size: usize
	}

	impl TextEncoder for RecordingEncoder {
		fn encode(&self, tokens: &TokenSequence) -> anyhow::Result<Array2<f32>> {
			self.seen.borrow_mut().push(tokens.to_vec());
			Ok(Array2::from_shape_fn((tokens.len(), self.hidden_size), |(i, _)| tokens[i] as f32))
		}
	}

	const LAYOUT: TokenLayout = TokenLayout {
		max_length: 6,
		hidden_size: 3,
		bos_token: 1,
		pad_token: 0,
		overflow: PromptOverflow::Truncate
	};

	#[test]
	fn test_negative_prompt_comes_first() {
		let encoder = RecordingEncoder { hidden_size: 3, ..Default::default() };
		let conditioner = Conditioner { tokenizer: &WordTokenizer, text_encoder: &encoder, layout: LAYOUT };
		let batch = conditioner.conditioning("a red circle", Some("blurry")).unwrap();
		assert_eq!(batch.shape(), &[2, 6, 3]);
		assert_eq!(batch[[0, 1, 0]], 106.0);
		assert_eq!(batch[[1, 1, 0]], 101.0);
		assert_eq!(batch[[1, 3, 2]], 106.0);
	}

	#[test]
	fn test_empty_negative_prompt_is_blank() {
		let encoder = RecordingEncoder { hidden_size: 3, ..Default::default() };
		let conditioner = Conditioner { tokenizer: &WordTokenizer, text_encoder: &encoder, layout: LAYOUT };
		conditioner.conditioning("a red circle", Some("")).unwrap();
		conditioner.conditioning("a red circle", None).unwrap();

		let seen = encoder.seen.borrow();
		assert_eq!(seen[0], vec![1, 0, 0, 0, 0, 0]);
		assert_eq!(seen[1], vec![1, 101, 103, 106, 2, 0]);
		assert_eq!(seen[2], seen[0]);
	}

	#[test]
	fn test_wrong_embedding_width() {
		let encoder = RecordingEncoder { hidden_size: 4, ..Default::default() };
		let conditioner = Conditioner { tokenizer: &WordTokenizer, text_encoder: &encoder, layout: LAYOUT };
		match conditioner.conditioning("a red circle", None) {
			Err(DiffusionError::ShapeMismatch { model, .. }) => assert_eq!(model, ModelKind::TextEncoder),
			other => panic!("expected a shape mismatch, got {other:?}")
		}
	}
}
