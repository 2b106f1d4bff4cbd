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

use ndarray::{s, Array4, ArrayView4, Zip};

/// Splits a batched `[2, C, h, w]` noise prediction into its unconditional (index 0) and conditional (index 1) halves.
pub(crate) fn split_noise_pred(noise_pred: &Array4<f32>) -> (ArrayView4<'_, f32>, ArrayView4<'_, f32>) {
	(noise_pred.slice(s![0..1, .., .., ..]), noise_pred.slice(s![1..2, .., .., ..]))
}

/// Classifier-free guidance: `uncond + guidance_scale * (cond - uncond)`.
///
/// Evaluated as `cond * s + uncond * (1 - s)`, which returns `uncond` exactly for `s = 0` and `cond` exactly for
/// `s = 1`.
pub(crate) fn guide(uncond: ArrayView4<'_, f32>, cond: ArrayView4<'_, f32>, guidance_scale: f32) -> Array4<f32> {
	Zip::from(&uncond)
		.and(&cond)
		.map_collect(|&u, &c| c.mul_add(guidance_scale, u * (1.0 - guidance_scale)))
}

#[cfg(test)]
mod tests {
	use ndarray::{concatenate, Array4, Axis};

	use super::{guide, split_noise_pred};

	fn halves() -> (Array4<f32>, Array4<f32>) {
		let uncond = Array4::from_shape_fn((1, 4, 3, 3), |(_, c, y, x)| 0.37 * c as f32 - 0.11 * y as f32 + 0.05 * x as f32);
		let cond = Array4::from_shape_fn((1, 4, 3, 3), |(_, c, y, x)| -0.21 * c as f32 + 0.73 * y as f32 - 0.3 * x as f32);
		(uncond, cond)
	}

	#[test]
	fn test_scale_zero_is_unconditional() {
		let (uncond, cond) = halves();
		assert_eq!(guide(uncond.view(), cond.view(), 0.0), uncond);
	}

	#[test]
	fn test_scale_one_is_conditional() {
		let (uncond, cond) = halves();
		assert_eq!(guide(uncond.view(), cond.view(), 1.0), cond);
	}

	#[test]
	fn test_large_scale_amplifies_conditional_half() {
		let batched = concatenate![Axis(0), Array4::<f32>::zeros((1, 4, 2, 2)), Array4::<f32>::ones((1, 4, 2, 2))];
		let (uncond, cond) = split_noise_pred(&batched);
		assert!(uncond.iter().all(|&v| v == 0.0));
		assert!(cond.iter().all(|&v| v == 1.0));

		let guided = guide(uncond, cond, 7.5);
		assert_eq!(guided.shape(), &[1, 4, 2, 2]);
		assert!(guided.iter().all(|&v| (v - 7.5).abs() < 1e-6));
	}

	#[test]
	fn test_matches_reference_formula() {
		let (uncond, cond) = halves();
		let guided = guide(uncond.view(), cond.view(), 7.5);
		let reference = &uncond + 7.5 * (&cond - &uncond);
		for (a, b) in guided.iter().zip(reference.iter()) {
			assert!((a - b).abs() < 1e-5);
		}
	}
}
