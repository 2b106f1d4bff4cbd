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

use image::{Rgb, RgbImage};
use ndarray::ArrayView4;

use crate::{error::expect_shape, DiffusionError, ModelKind};

/// Maps a decoder output value in `[-1, 1]` to an 8-bit channel value. Out-of-range values saturate.
#[inline]
pub fn quantize(value: f32) -> u8 {
	((value / 2.0 + 0.5).clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Converts decoded pixels of shape `[1, 3, H, W]` into an 8-bit RGB image.
pub fn to_rgb8(pixels: ArrayView4<'_, f32>) -> Result<RgbImage, DiffusionError> {
	let (height, width) = (pixels.shape()[2], pixels.shape()[3]);
	expect_shape(ModelKind::VaeDecoder, pixels.shape(), &[1, 3, height, width])?;

	Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
		let (x, y) = (x as usize, y as usize);
		Rgb([quantize(pixels[[0, 0, y, x]]), quantize(pixels[[0, 1, y, x]]), quantize(pixels[[0, 2, y, x]])])
	}))
}

#[cfg(test)]
mod tests {
	use ndarray::Array4;

	use super::{quantize, to_rgb8};
	use crate::{DiffusionError, ModelKind};

	#[test]
	fn test_quantize_table() {
		assert_eq!(quantize(0.0), 128);
		assert_eq!(quantize(1.0), 255);
		assert_eq!(quantize(-1.0), 0);
		assert_eq!(quantize(2.0), 255);
		assert_eq!(quantize(-5.0), 0);
		assert_eq!(quantize(0.5), 191);
	}

	#[test]
	fn test_to_rgb8_channel_layout() {
		// 2 rows, 3 columns; R varies with x, G with y, B is constant
		let pixels = Array4::from_shape_fn((1, 3, 2, 3), |(_, c, y, x)| match c {
			0 => x as f32 - 1.0,
			1 => y as f32 * 2.0 - 1.0,
			_ => 0.0
		});
		let image = to_rgb8(pixels.view()).unwrap();
		assert_eq!(image.dimensions(), (3, 2));
		assert_eq!(image.get_pixel(0, 0).0, [0, 0, 128]);
		assert_eq!(image.get_pixel(1, 0).0, [128, 0, 128]);
		assert_eq!(image.get_pixel(2, 1).0, [255, 255, 128]);
	}

	#[test]
	fn test_to_rgb8_rejects_non_rgb() {
		let pixels = Array4::<f32>::zeros((1, 4, 8, 8));
		match to_rgb8(pixels.view()) {
			Err(DiffusionError::ShapeMismatch { model, expected, actual }) => {
				assert_eq!(model, ModelKind::VaeDecoder);
				assert_eq!(expected, vec![1, 3, 8, 8]);
				assert_eq!(actual, vec![1, 4, 8, 8]);
			}
			other => panic!("expected a shape mismatch, got {other:?}")
		}
	}
}
