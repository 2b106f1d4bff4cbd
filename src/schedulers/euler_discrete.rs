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

use ndarray::{Array1, Array4, ArrayView1, ArrayView4};
use rand::Rng;

use super::{
	alphas_cumprod, inference_sigmas, inference_timesteps, step_index, train_sigmas, BetaSchedule, DiffusionScheduler, SchedulerOptimizedDefaults,
	SchedulerStepOutput
};

/// Euler scheduler (Algorithm 2) from [Karras et al. (2022)](https://arxiv.org/abs/2206.00364).
///
/// Based on the original [`k-diffusion` implementation by Katherine Crowson][kd]. Deterministic: the `rng` passed to
/// [`DiffusionScheduler::step`] is never used.
///
/// [kd]: https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L51
#[derive(Clone)]
pub struct EulerDiscreteScheduler {
	train_sigmas: Array1<f32>,
	sigmas: Array1<f32>,
	init_noise_sigma: f32,
	timesteps: Array1<f32>,
	num_train_timesteps: usize,
	has_scale_input_been_called: bool
}

impl EulerDiscreteScheduler {
	/// Creates a new instance of the scheduler.
	///
	/// # Parameters
	/// - **`num_train_timesteps`**: number of diffusion steps used to train the model.
	/// - **`beta_start`**: the starting `beta` value of inference.
	/// - **`beta_end`**: the final `beta` value.
	/// - **`beta_schedule`**: the beta schedule, a mapping from a beta range to a sequence of betas for stepping the
	///   model; see [`BetaSchedule`]
	pub fn new(num_train_timesteps: usize, beta_start: f32, beta_end: f32, beta_schedule: &BetaSchedule) -> anyhow::Result<Self> {
		let train_sigmas = train_sigmas(&alphas_cumprod(num_train_timesteps, beta_start, beta_end, beta_schedule)?);
		let init_noise_sigma = train_sigmas.iter().copied().fold(0.0_f32, f32::max);

		let timesteps = inference_timesteps(num_train_timesteps, num_train_timesteps);
		let sigmas = inference_sigmas(&train_sigmas, timesteps.view());

		Ok(Self {
			train_sigmas,
			sigmas,
			init_noise_sigma,
			timesteps,
			num_train_timesteps,
			has_scale_input_been_called: false
		})
	}
}

impl DiffusionScheduler for EulerDiscreteScheduler {
	fn set_timesteps(&mut self, num_inference_steps: usize) {
		self.timesteps = inference_timesteps(self.num_train_timesteps, num_inference_steps);
		self.sigmas = inference_sigmas(&self.train_sigmas, self.timesteps.view());
		self.has_scale_input_been_called = false;
	}

	fn timesteps(&self) -> ArrayView1<'_, f32> {
		self.timesteps.view()
	}

	fn init_noise_sigma(&self) -> f32 {
		self.init_noise_sigma
	}

	/// Scales the denoising model input by `(sigma**2 + 1) ** 0.5` to match the Euler algorithm.
	fn scale_model_input(&mut self, sample: ArrayView4<'_, f32>, timestep: f32) -> anyhow::Result<Array4<f32>> {
		let sigma = self.sigmas[step_index(self.timesteps.view(), timestep)?];
		self.has_scale_input_been_called = true;
		Ok(&sample / (sigma.powi(2) + 1.0).sqrt())
	}

	fn step<R: Rng + ?Sized>(
		&mut self,
		model_output: ArrayView4<'_, f32>,
		timestep: f32,
		sample: ArrayView4<'_, f32>,
		_rng: &mut R
	) -> anyhow::Result<SchedulerStepOutput> {
		if !self.has_scale_input_been_called {
			anyhow::bail!("`scale_model_input` must be called before `step`");
		}

		let step_index = step_index(self.timesteps.view(), timestep)?;
		let sigma = self.sigmas[step_index];

		// 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
		let pred_original_sample = &sample - &(&model_output * sigma);

		// 2. convert to an ODE derivative & take an Euler step
		let derivative = (&sample - &pred_original_sample) / sigma;
		let dt = self.sigmas[step_index + 1] - sigma;
		let prev_sample = &sample + &(derivative * dt);

		Ok(SchedulerStepOutput {
			prev_sample,
			pred_original_sample: Some(pred_original_sample)
		})
	}
}

impl SchedulerOptimizedDefaults for EulerDiscreteScheduler {
	fn stable_diffusion_v1_optimized_default() -> anyhow::Result<Self>
	where
		Self: Sized
	{
		Self::new(1000, 0.00085, 0.012, &BetaSchedule::ScaledLinear)
	}
}

#[cfg(test)]
mod tests {
	use ndarray::Array4;
	use rand::{rngs::StdRng, SeedableRng};

	use super::EulerDiscreteScheduler;
	use crate::schedulers::{DiffusionScheduler, SchedulerOptimizedDefaults};

	#[test]
	fn test_timesteps_are_strictly_decreasing() {
		let mut scheduler = EulerDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		for steps in [2, 15, 25, 50] {
			scheduler.set_timesteps(steps);
			let timesteps = scheduler.timesteps();
			assert_eq!(timesteps.len(), steps);
			assert!(timesteps.windows(2).into_iter().all(|w| w[1] < w[0]));
		}
	}

	#[test]
	fn test_init_noise_sigma() {
		let scheduler = EulerDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		// sqrt((1 - ᾱ_999) / ᾱ_999) for the Stable Diffusion v1 schedule
		assert!((scheduler.init_noise_sigma() - 14.6146).abs() < 0.05);
	}

	#[test]
	fn test_step_requires_scaled_input() {
		let mut scheduler = EulerDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		scheduler.set_timesteps(4);
		let t = scheduler.timesteps()[0];
		let sample = Array4::<f32>::ones((1, 4, 2, 2));
		let mut rng = StdRng::seed_from_u64(0);
		assert!(scheduler.step(sample.view(), t, sample.view(), &mut rng).is_err());

		scheduler.scale_model_input(sample.view(), t).unwrap();
		assert!(scheduler.step(sample.view(), t, sample.view(), &mut rng).is_ok());
	}

	#[test]
	fn test_final_step_returns_denoised_sample() {
		let mut scheduler = EulerDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		scheduler.set_timesteps(2);
		let t = scheduler.timesteps()[1];
		let sample = Array4::<f32>::from_elem((1, 4, 2, 2), 0.5);
		let noise = Array4::<f32>::from_elem((1, 4, 2, 2), 0.25);
		let mut rng = StdRng::seed_from_u64(0);

		scheduler.scale_model_input(sample.view(), t).unwrap();
		let out = scheduler.step(noise.view(), t, sample.view(), &mut rng).unwrap();
		// the last sigma is 0, so the step lands exactly on the predicted original sample
		let pred = out.pred_original_sample().unwrap().to_owned();
		for (a, b) in out.prev_sample().iter().zip(pred.iter()) {
			assert!((a - b).abs() < 1e-5);
		}
	}
}
