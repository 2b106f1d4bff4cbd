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

//! The model manifest (`diffusers.toml`) describing where each network lives and its fixed dimensions.
//!
//! ```toml
//! pipeline = "stable-diffusion"
//! framework = "onnx"
//!
//! [tokenizer]
//! type = "CLIPTokenizer"
//! path = "tokenizer.json"
//! model-max-length = 77
//! bos-token = 49406
//! eos-token = 49407
//!
//! [text-encoder]
//! path = "text_encoder.onnx"
//!
//! [unet]
//! path = "unet.onnx"
//! timestep-type = "int64"
//!
//! [vae]
//! decoder = "vae_decoder.onnx"
//!
//! [safety-checker]
//! path = "safety_checker.onnx"
//! ```

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::DiffusionError;

/// The file name of the manifest inside a model directory.
pub const MANIFEST_FILE_NAME: &str = "diffusers.toml";

/// The inference framework the networks were exported for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiffusionFramework {
	/// ONNX Runtime.
	Onnx
}

/// Prompt tokenizer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
#[non_exhaustive]
pub enum TokenizerConfig {
	/// A CLIP BPE tokenizer in HuggingFace `tokenizers` JSON format.
	#[serde(rename_all = "kebab-case")]
	CLIPTokenizer {
		/// Path to `tokenizer.json`, relative to the model directory.
		path: String,
		/// Fixed sequence length fed to the text encoder.
		model_max_length: usize,
		/// Start-of-text token id.
		bos_token: u32,
		/// End-of-text token id.
		eos_token: u32,
		/// Padding token id; defaults to `eos-token`.
		#[serde(default)]
		pad_token: Option<u32>
	}
}

impl TokenizerConfig {
	/// Fixed sequence length fed to the text encoder.
	pub fn model_max_length(&self) -> usize {
		match self {
			TokenizerConfig::CLIPTokenizer { model_max_length, .. } => *model_max_length
		}
	}

	/// Start-of-text token id.
	pub fn bos_token(&self) -> u32 {
		match self {
			TokenizerConfig::CLIPTokenizer { bos_token, .. } => *bos_token
		}
	}

	/// Padding token id.
	pub fn pad_token(&self) -> u32 {
		match self {
			TokenizerConfig::CLIPTokenizer { eos_token, pad_token, .. } => pad_token.unwrap_or(*eos_token)
		}
	}
}

/// Text encoder configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CLIPTextModelConfig {
	/// Path to the ONNX model.
	pub path: String,
	/// Width of each token embedding.
	#[serde(default = "default_hidden_size")]
	pub hidden_size: usize
}

/// Element type of the UNet's `timestep` input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestepType {
	/// `float32[1]`
	#[default]
	Float32,
	/// `int64[1]`; fractional timesteps are truncated.
	Int64
}

/// UNet configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct UNetConfig {
	/// Path to the ONNX model.
	pub path: String,
	/// Number of latent channels.
	#[serde(default = "default_latent_channels")]
	pub latent_channels: usize,
	/// Element type of the `timestep` input.
	#[serde(default)]
	pub timestep_type: TimestepType
}

/// VAE configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VAEConfig {
	/// Path to the ONNX decoder model.
	pub decoder: String,
	/// Spatial downscale factor between pixels and latents.
	#[serde(default = "default_scale_factor")]
	pub scale_factor: u32,
	/// Latents are divided by this factor before decoding.
	#[serde(default = "default_scaling_factor")]
	pub scaling_factor: f32
}

/// Safety checker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SafetyCheckerConfig {
	/// Path to the ONNX model.
	pub path: String
}

/// Preprocessing applied to generated images before they are passed to the safety checker.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CLIPFeatureExtractorConfig {
	/// Images are scaled & center-cropped to `size`×`size`.
	#[serde(default = "default_feature_size")]
	pub size: u32,
	/// Per-channel (RGB) mean subtracted after scaling to `[0, 1]`.
	#[serde(default = "default_image_mean")]
	pub image_mean: Vec<f32>,
	/// Per-channel (RGB) standard deviation.
	#[serde(default = "default_image_std")]
	pub image_std: Vec<f32>
}

impl Default for CLIPFeatureExtractorConfig {
	fn default() -> Self {
		Self {
			size: default_feature_size(),
			image_mean: default_image_mean(),
			image_std: default_image_std()
		}
	}
}

/// Configuration of a Stable Diffusion model directory.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StableDiffusionConfig {
	/// Prompt tokenizer.
	pub tokenizer: TokenizerConfig,
	/// Text encoder.
	pub text_encoder: CLIPTextModelConfig,
	/// Noise predictor.
	pub unet: UNetConfig,
	/// Latent decoder.
	pub vae: VAEConfig,
	/// Optional safety checker.
	#[serde(default)]
	pub safety_checker: Option<SafetyCheckerConfig>,
	/// Safety checker preprocessing.
	#[serde(default)]
	pub feature_extractor: CLIPFeatureExtractorConfig
}

/// The top-level manifest.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "pipeline", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum DiffusionPipeline {
	/// A Stable Diffusion model.
	StableDiffusion {
		/// Export framework.
		framework: DiffusionFramework,
		/// Model configuration.
		#[serde(flatten)]
		inner: StableDiffusionConfig
	}
}

impl StableDiffusionConfig {
	/// Reads and validates the manifest in `root`.
	pub fn from_dir(root: impl AsRef<Path>) -> Result<Self, DiffusionError> {
		let manifest = fs::read_to_string(root.as_ref().join(MANIFEST_FILE_NAME))?;
		Self::from_toml(&manifest)
	}

	/// Parses and validates a manifest.
	pub fn from_toml(manifest: &str) -> Result<Self, DiffusionError> {
		let config = match toml::from_str::<DiffusionPipeline>(manifest)? {
			DiffusionPipeline::StableDiffusion {
				framework: DiffusionFramework::Onnx,
				inner
			} => inner
		};
		config.validate()?;
		Ok(config)
	}

	/// Rejects dimensions the pipeline cannot work with.
	pub fn validate(&self) -> Result<(), DiffusionError> {
		if self.tokenizer.model_max_length() < 2 {
			return Err(DiffusionError::config("tokenizer `model-max-length` must be at least 2"));
		}
		if self.text_encoder.hidden_size == 0 {
			return Err(DiffusionError::config("text encoder `hidden-size` must be >0"));
		}
		if self.unet.latent_channels == 0 {
			return Err(DiffusionError::config("unet `latent-channels` must be >0"));
		}
		if self.vae.scale_factor == 0 {
			return Err(DiffusionError::config("vae `scale-factor` must be >0"));
		}
		if !self.vae.scaling_factor.is_normal() {
			return Err(DiffusionError::config(format!("vae `scaling-factor` ({}) must be a normal number", self.vae.scaling_factor)));
		}

		let fe = &self.feature_extractor;
		if fe.size == 0 {
			return Err(DiffusionError::config("feature extractor `size` must be >0"));
		}
		if fe.image_mean.len() != 3 || fe.image_std.len() != 3 {
			return Err(DiffusionError::config("feature extractor `image-mean` and `image-std` must have exactly 3 entries"));
		}
		if fe.image_std.iter().any(|s| *s <= 0.0 || !s.is_finite()) {
			return Err(DiffusionError::config(format!("feature extractor `image-std` ({:?}) must be positive", fe.image_std)));
		}
		Ok(())
	}
}

fn default_hidden_size() -> usize {
	768
}

fn default_latent_channels() -> usize {
	4
}

fn default_scale_factor() -> u32 {
	8
}

fn default_scaling_factor() -> f32 {
	0.18215
}

fn default_feature_size() -> u32 {
	224
}

fn default_image_mean() -> Vec<f32> {
	vec![0.485, 0.456, 0.406]
}

fn default_image_std() -> Vec<f32> {
	vec![0.229, 0.224, 0.225]
}

#[cfg(test)]
mod tests {
	use super::{StableDiffusionConfig, TimestepType};
	use crate::DiffusionError;

	const MANIFEST: &str = r#"
pipeline = "stable-diffusion"
framework = "onnx"

[tokenizer]
type = "CLIPTokenizer"
path = "tokenizer.json"
model-max-length = 77
bos-token = 49406
eos-token = 49407

[text-encoder]
path = "text_encoder.onnx"

[unet]
path = "unet.onnx"
timestep-type = "int64"

[vae]
decoder = "vae_decoder.onnx"
"#;

	#[test]
	fn test_manifest_defaults() {
		let config = StableDiffusionConfig::from_toml(MANIFEST).unwrap();
		assert_eq!(config.tokenizer.model_max_length(), 77);
		assert_eq!(config.tokenizer.bos_token(), 49406);
		assert_eq!(config.tokenizer.pad_token(), 49407);
		assert_eq!(config.text_encoder.hidden_size, 768);
		assert_eq!(config.unet.latent_channels, 4);
		assert_eq!(config.unet.timestep_type, TimestepType::Int64);
		assert_eq!(config.vae.scale_factor, 8);
		assert!((config.vae.scaling_factor - 0.18215).abs() < f32::EPSILON);
		assert!(config.safety_checker.is_none());
		assert_eq!(config.feature_extractor.size, 224);
		assert_eq!(config.feature_extractor.image_mean, vec![0.485, 0.456, 0.406]);
	}

	#[test]
	fn test_manifest_rejects_bad_dimensions() {
		let manifest = MANIFEST.replace("path = \"unet.onnx\"", "path = \"unet.onnx\"\nlatent-channels = 0");
		assert!(matches!(StableDiffusionConfig::from_toml(&manifest), Err(DiffusionError::Configuration(_))));

		let manifest = format!("{MANIFEST}\n[feature-extractor]\nimage-std = [0.5, 0.0, 0.5]\n");
		assert!(matches!(StableDiffusionConfig::from_toml(&manifest), Err(DiffusionError::Configuration(_))));
	}

	#[test]
	fn test_manifest_requires_unet() {
		let manifest = MANIFEST.replace("[unet]\npath = \"unet.onnx\"\ntimestep-type = \"int64\"\n", "");
		assert!(matches!(StableDiffusionConfig::from_toml(&manifest), Err(DiffusionError::Manifest(_))));
	}
}
