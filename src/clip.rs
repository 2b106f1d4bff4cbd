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

//! CLIP tokenizer implementation.

use std::path::Path;

use tokenizers::Tokenizer;

use crate::models::PromptTokenizer;

/// A basic [CLIP](https://arxiv.org/abs/2103.00020) tokenizer, loaded from a HuggingFace `tokenizer.json`.
///
/// The tokenizer's post-processor is expected to wrap prompts in start/end-of-text tokens, as the CLIP tokenizers
/// shipped with Stable Diffusion do.
pub struct CLIPStandardTokenizer {
	inner: Tokenizer
}

impl CLIPStandardTokenizer {
	/// Loads a CLIP tokenizer from a file.
	pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
		let bytes = std::fs::read(path)?;
		Self::from_bytes(bytes)
	}

	/// Loads a CLIP tokenizer from a byte array.
	pub fn from_bytes<B: AsRef<[u8]>>(bytes: B) -> anyhow::Result<Self> {
		let inner: Tokenizer = serde_json::from_slice(bytes.as_ref())?;
		Ok(Self { inner })
	}
}

impl PromptTokenizer for CLIPStandardTokenizer {
	fn tokenize(&self, prompt: &str) -> anyhow::Result<Vec<u32>> {
		let encoding = self.inner.encode(prompt, true).map_err(|e| anyhow::anyhow!("{e:?}"))?;
		Ok(encoding.get_ids().to_vec())
	}
}
