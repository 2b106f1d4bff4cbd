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

//! The schedule functions, denoted Schedulers in the library take in the output of a trained model, a sample which the
//! diffusion process is iterating on, and a timestep to return a denoised sample.
//!
//! For inference, the scheduler defines how to update a sample based on an output from a pretrained model. The
//! pipeline only relies on the narrow [`DiffusionScheduler`] contract, so schedulers can be swapped freely.

use anyhow::Context;
use ndarray::{Array1, Array4, ArrayBase, ArrayView1, ArrayView4};
use rand::Rng;

use crate::util::interpolation::interp;

cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-lms")] {
		mod lms_discrete;
		pub use self::lms_discrete::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-euler")] {
		mod euler_discrete;
		pub use self::euler_discrete::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-euler-ancestral")] {
		mod euler_ancestral_discrete;
		pub use self::euler_ancestral_discrete::*;
	}
}

/// A mapping from a beta range to a sequence of betas for stepping the model.
#[derive(Debug, Clone)]
pub enum BetaSchedule {
	/// Linear beta schedule.
	Linear,
	/// Scaled linear beta schedule.
	ScaledLinear,
	/// Pre-trained betas.
	TrainedBetas(Array1<f32>)
}

/// The output returned by a scheduler's `step` function.
pub struct SchedulerStepOutput {
	pub(crate) prev_sample: Array4<f32>,
	pub(crate) pred_original_sample: Option<Array4<f32>>
}

impl SchedulerStepOutput {
	/// Computed sample (`x_{t-1}`) of the previous timestep. `prev_sample` should be used as the next model input in
	/// the denoising loop.
	pub fn prev_sample(&self) -> ArrayView4<'_, f32> {
		self.prev_sample.view()
	}

	/// Consumes the output, returning the next latent.
	pub fn into_prev_sample(self) -> Array4<f32> {
		self.prev_sample
	}

	/// The predicted denoised sample (`x_{0}`) based on the model output from the current timestep.
	pub fn pred_original_sample(&self) -> Option<ArrayView4<'_, f32>> {
		self.pred_original_sample.as_ref().map(ArrayBase::view)
	}
}

/// A scheduler to be used in diffusion pipelines.
pub trait DiffusionScheduler {
	/// Sets the number of inference steps. This must be called before `step` to compute the sigmas and timesteps.
	fn set_timesteps(&mut self, num_inference_steps: usize);

	/// Returns the computed timesteps, strictly decreasing.
	fn timesteps(&self) -> ArrayView1<'_, f32>;

	/// Returns the standard deviation of the initial noise distribution.
	fn init_noise_sigma(&self) -> f32;

	/// Scales the denoising model input for `timestep`. The output has the same shape as `sample`.
	fn scale_model_input(&mut self, sample: ArrayView4<'_, f32>, timestep: f32) -> anyhow::Result<Array4<f32>>;

	/// Predict the sample at the previous timestep by reversing the SDE. Core function to propagate the diffusion
	/// process from the learned model outputs (most often the predicted noise).
	///
	/// `rng` is only used by stochastic (ancestral) schedulers.
	fn step<R: Rng + ?Sized>(
		&mut self,
		model_output: ArrayView4<'_, f32>,
		timestep: f32,
		sample: ArrayView4<'_, f32>,
		rng: &mut R
	) -> anyhow::Result<SchedulerStepOutput>;
}

/// Scheduler defaults tuned for specific models.
pub trait SchedulerOptimizedDefaults {
	/// The scheduler configuration used to train Stable Diffusion v1 (1000 steps, scaled linear betas from `0.00085`
	/// to `0.012`).
	fn stable_diffusion_v1_optimized_default() -> anyhow::Result<Self>
	where
		Self: Sized;
}

/// Computes the cumulative product of alphas for a beta schedule.
///
/// # Errors
/// Can error if:
/// - `num_train_timesteps` is 0
/// - `beta_start` or `beta_end` are not normal numbers (not zero, infinite, `NaN`, or subnormal)
/// - `beta_end` is less than or equal to `beta_start`
/// - trained betas don't have exactly `num_train_timesteps` entries
pub(crate) fn alphas_cumprod(num_train_timesteps: usize, beta_start: f32, beta_end: f32, beta_schedule: &BetaSchedule) -> anyhow::Result<Array1<f32>> {
	if num_train_timesteps == 0 {
		anyhow::bail!("num_train_timesteps ({num_train_timesteps}) must be >0");
	}
	if !beta_start.is_normal() || !beta_end.is_normal() {
		anyhow::bail!("beta_start ({beta_start}) and beta_end ({beta_end}) must be normal (not zero, infinite, NaN, or subnormal)");
	}
	if beta_start >= beta_end {
		anyhow::bail!("beta_start must be < beta_end");
	}

	let betas = match beta_schedule {
		BetaSchedule::TrainedBetas(betas) => {
			if betas.len() != num_train_timesteps {
				anyhow::bail!("expected {num_train_timesteps} trained betas, got {}", betas.len());
			}
			betas.clone()
		}
		BetaSchedule::Linear => Array1::linspace(beta_start, beta_end, num_train_timesteps),
		BetaSchedule::ScaledLinear => {
			let mut betas = Array1::linspace(beta_start.sqrt(), beta_end.sqrt(), num_train_timesteps);
			betas.par_map_inplace(|f| *f = f.powi(2));
			betas
		}
	};

	Ok(betas
		.iter()
		.scan(1.0, |prod, beta| {
			*prod *= 1.0 - *beta;
			Some(*prod)
		})
		.collect())
}

/// Noise level `sqrt((1 - ᾱ) / ᾱ)` for every training timestep.
pub(crate) fn train_sigmas(alphas_cumprod: &Array1<f32>) -> Array1<f32> {
	alphas_cumprod.mapv(|a| ((1.0 - a) / a).sqrt())
}

/// `num_inference_steps` evenly spaced timesteps from the last training timestep down to 0.
pub(crate) fn inference_timesteps(num_train_timesteps: usize, num_inference_steps: usize) -> Array1<f32> {
	Array1::linspace(num_train_timesteps as f32 - 1.0, 0.0, num_inference_steps)
}

/// Sigmas interpolated at each inference timestep, followed by a final `0.0`.
pub(crate) fn inference_sigmas(train_sigmas: &Array1<f32>, timesteps: ArrayView1<'_, f32>) -> Array1<f32> {
	let xp = Array1::range(0.0, train_sigmas.len() as f32, 1.0);
	timesteps
		.iter()
		.map(|&t| interp(t, xp.view(), train_sigmas.view()))
		.chain(std::iter::once(0.0))
		.collect()
}

/// Position of `timestep` in `timesteps`.
pub(crate) fn step_index(timesteps: ArrayView1<'_, f32>, timestep: f32) -> anyhow::Result<usize> {
	timesteps
		.iter()
		.position(|&p| p == timestep)
		.with_context(|| format!("timestep out of this schedulers bounds: {timestep}"))
}

#[cfg(test)]
mod tests {
	use ndarray::array;

	use super::{alphas_cumprod, inference_sigmas, inference_timesteps, step_index, BetaSchedule};

	#[test]
	fn test_alphas_cumprod_is_decreasing() {
		let alphas_cumprod = alphas_cumprod(1000, 0.00085, 0.012, &BetaSchedule::ScaledLinear).unwrap();
		assert_eq!(alphas_cumprod.len(), 1000);
		assert!((alphas_cumprod[0] - (1.0 - 0.00085)).abs() < 1e-6);
		assert!(alphas_cumprod.windows(2).into_iter().all(|w| w[1] < w[0]));
	}

	#[test]
	fn test_invalid_beta_ranges() {
		assert!(alphas_cumprod(0, 0.0001, 0.02, &BetaSchedule::Linear).is_err());
		assert!(alphas_cumprod(1000, 0.02, 0.0001, &BetaSchedule::Linear).is_err());
		assert!(alphas_cumprod(1000, 0.0, 0.02, &BetaSchedule::Linear).is_err());
		assert!(alphas_cumprod(3, 0.0001, 0.02, &BetaSchedule::TrainedBetas(array![0.1, 0.2])).is_err());
	}

	#[test]
	fn test_inference_timesteps() {
		let timesteps = inference_timesteps(1000, 4);
		assert_eq!(timesteps, array![999.0, 666.0, 333.0, 0.0]);
	}

	#[test]
	fn test_inference_sigmas_end_in_zero() {
		let train = array![0.1, 0.2, 0.3, 0.4];
		let sigmas = inference_sigmas(&train, array![3.0, 1.5, 0.0].view());
		assert_eq!(sigmas.len(), 4);
		assert!((sigmas[0] - 0.4).abs() < 1e-6);
		assert!((sigmas[1] - 0.25).abs() < 1e-6);
		assert!((sigmas[2] - 0.1).abs() < 1e-6);
		assert_eq!(sigmas[3], 0.0);
	}

	#[test]
	fn test_unknown_timestep() {
		let timesteps = array![999.0, 0.0];
		assert_eq!(step_index(timesteps.view(), 0.0).unwrap(), 1);
		assert!(step_index(timesteps.view(), 500.0).is_err());
	}
}
