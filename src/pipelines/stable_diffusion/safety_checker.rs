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

use image::{imageops::FilterType, DynamicImage, RgbImage};
use ndarray::{Array4, ArrayView4};

use super::postprocess::to_rgb8;
use crate::{config::CLIPFeatureExtractorConfig, models::SafetyClassifier, DiffusionError, ModelKind};

/// Safety checker inputs; both tensors hold the same normalized pixels.
#[derive(Debug)]
pub(crate) struct SafetyCheckerInput {
	/// `[1, 3, s, s]`
	pub(crate) clip_input: Array4<f32>,
	/// `[1, s, s, 3]`
	pub(crate) images: Array4<f32>
}

/// Re-quantizes decoded pixels, resizes & center-crops them to the feature extractor's size and normalizes each
/// channel with its mean and standard deviation.
pub(crate) fn preprocess(pixels: ArrayView4<'_, f32>, feature_extractor: &CLIPFeatureExtractorConfig) -> Result<SafetyCheckerInput, DiffusionError> {
	let size = feature_extractor.size;
	let image = to_rgb8(pixels)?;
	let image: RgbImage = if image.dimensions() == (size, size) {
		image
	} else {
		DynamicImage::ImageRgb8(image).resize_to_fill(size, size, FilterType::CatmullRom).into_rgb8()
	};

	let (mean, std) = (&feature_extractor.image_mean, &feature_extractor.image_std);
	let s = size as usize;
	let images = Array4::from_shape_fn((1, s, s, 3), |(_, y, x, c)| {
		let value = f32::from(image.get_pixel(x as u32, y as u32)[c]) / 255.0;
		(value - mean[c]) / std[c]
	});
	let clip_input = images.view().permuted_axes([0, 3, 1, 2]).as_standard_layout().into_owned();

	Ok(SafetyCheckerInput { clip_input, images })
}

/// Runs the safety checker over decoded pixels. Returns `true` if the image is safe.
pub(crate) fn is_safe(
	classifier: &dyn SafetyClassifier,
	pixels: ArrayView4<'_, f32>,
	feature_extractor: &CLIPFeatureExtractorConfig
) -> Result<bool, DiffusionError> {
	let input = preprocess(pixels, feature_extractor)?;
	let has_nsfw_concept = classifier
		.classify(input.clip_input.view(), input.images.view())
		.map_err(DiffusionError::backend(ModelKind::SafetyChecker))?;
	Ok(!has_nsfw_concept)
}

#[cfg(test)]
mod tests {
	use ndarray::{Array4, ArrayView4};

	use super::{is_safe, preprocess};
	use crate::{config::CLIPFeatureExtractorConfig, models::SafetyClassifier, pipelines::to_rgb8};

	fn gradient(height: usize, width: usize) -> Array4<f32> {
		Array4::from_shape_fn((1, 3, height, width), |(_, c, y, x)| {
			((x * 7 + y * 13 + c * 29) % 41) as f32 / 20.0 - 1.0 + if c == 1 { 0.003 } else { 0.0 }
		})
	}

	#[test]
	fn test_layouts() {
		let pixels = gradient(64, 96);
		let input = preprocess(pixels.view(), &CLIPFeatureExtractorConfig { size: 32, ..Default::default() }).unwrap();
		assert_eq!(input.clip_input.shape(), &[1, 3, 32, 32]);
		assert_eq!(input.images.shape(), &[1, 32, 32, 3]);
		assert!(input.clip_input.is_standard_layout());
		for c in 0..3 {
			for y in 0..32 {
				for x in 0..32 {
					assert_eq!(input.clip_input[[0, c, y, x]], input.images[[0, y, x, c]]);
				}
			}
		}
	}

	#[test]
	fn test_requantization_matches_output_image() {
		let pixels = gradient(16, 16);
		let image = to_rgb8(pixels.view()).unwrap();

		let identity = CLIPFeatureExtractorConfig {
			size: 16,
			image_mean: vec![0.0; 3],
			image_std: vec![1.0; 3]
		};
		let input = preprocess(pixels.view(), &identity).unwrap();
		for (x, y, pixel) in image.enumerate_pixels() {
			for c in 0..3 {
				let requantized = (input.images[[0, y as usize, x as usize, c]] * 255.0).round() as u8;
				assert_eq!(requantized, pixel[c]);
			}
		}
	}

	#[test]
	fn test_normalization() {
		let pixels = Array4::<f32>::ones((1, 3, 8, 8));
		let config = CLIPFeatureExtractorConfig { size: 8, ..Default::default() };
		let input = preprocess(pixels.view(), &config).unwrap();
		for c in 0..3 {
			let expected = (1.0 - config.image_mean[c]) / config.image_std[c];
			assert!((input.images[[0, 4, 4, c]] - expected).abs() < 1e-6);
		}
	}

	struct Fixed(bool);

	impl SafetyClassifier for Fixed {
		fn classify(&self, clip_input: ArrayView4<'_, f32>, images: ArrayView4<'_, f32>) -> anyhow::Result<bool> {
			assert_eq!(clip_input.shape(), &[1, 3, 224, 224]);
			assert_eq!(images.shape(), &[1, 224, 224, 3]);
			Ok(self.0)
		}
	}

	#[test]
	fn test_verdict_is_inverted() {
		let pixels = gradient(64, 64);
		let config = CLIPFeatureExtractorConfig::default();
		assert!(!is_safe(&Fixed(true), pixels.view(), &config).unwrap());
		assert!(is_safe(&Fixed(false), pixels.view(), &config).unwrap());
	}
}
