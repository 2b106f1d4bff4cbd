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

use std::f64::consts::PI;

use ndarray::Array4;
use rand::Rng;

/// Draws one standard normal sample from two uniform samples (Box-Muller).
fn box_muller<R: Rng + ?Sized>(rng: &mut R) -> f32 {
	// `gen` samples [0, 1); flip it so `ln` never sees 0
	let u1 = 1.0 - rng.gen::<f64>();
	let u2 = rng.gen::<f64>();
	((-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()) as f32
}

/// Creates the initial latents of shape `[1, C, h, w]`, filled in row-major order with standard normal samples
/// multiplied by `init_noise_sigma`.
pub(crate) fn initial_latents<R: Rng + ?Sized>(
	shape: (usize, usize, usize, usize),
	init_noise_sigma: f32,
	rng: &mut R
) -> Array4<f32> {
	Array4::from_shape_simple_fn(shape, || box_muller(rng) * init_noise_sigma)
}

#[cfg(test)]
mod tests {
	use rand::{rngs::StdRng, SeedableRng};

	use super::initial_latents;

	#[test]
	fn test_same_seed_same_latents() {
		let a = initial_latents((1, 4, 8, 8), 14.6146, &mut StdRng::seed_from_u64(42));
		let b = initial_latents((1, 4, 8, 8), 14.6146, &mut StdRng::seed_from_u64(42));
		assert_eq!(a.shape(), &[1, 4, 8, 8]);
		assert!(a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits()));

		let c = initial_latents((1, 4, 8, 8), 14.6146, &mut StdRng::seed_from_u64(43));
		assert_ne!(a, c);
	}

	#[test]
	fn test_latents_are_standard_normal() {
		let latents = initial_latents((1, 4, 64, 64), 1.0, &mut StdRng::seed_from_u64(0));
		let n = latents.len() as f32;
		let mean = latents.sum() / n;
		let var = latents.mapv(|v| (v - mean).powi(2)).sum() / n;
		assert!(mean.abs() < 0.05, "mean = {mean}");
		assert!((var - 1.0).abs() < 0.05, "variance = {var}");
		assert!(latents.iter().all(|v| v.is_finite()));
	}

	#[test]
	fn test_scaled_by_init_noise_sigma() {
		let unit = initial_latents((1, 4, 4, 4), 1.0, &mut StdRng::seed_from_u64(9));
		let scaled = initial_latents((1, 4, 4, 4), 3.0, &mut StdRng::seed_from_u64(9));
		for (u, s) in unit.iter().zip(scaled.iter()) {
			assert!((u * 3.0 - s).abs() < 1e-5);
		}
	}
}
