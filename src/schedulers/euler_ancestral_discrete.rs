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
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::Rng;

use super::{
	alphas_cumprod, inference_sigmas, inference_timesteps, step_index, train_sigmas, BetaSchedule, DiffusionScheduler, SchedulerOptimizedDefaults,
	SchedulerStepOutput
};

/// Ancestral sampling with Euler method steps.
///
/// Based on the original [`k-diffusion` implementation by Katherine Crowson][kd]. Fresh noise is drawn from the `rng`
/// passed to [`DiffusionScheduler::step`] on every step, so a seeded generator keeps results reproducible.
///
/// [kd]: https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L72
#[derive(Clone)]
pub struct EulerAncestralDiscreteScheduler {
	train_sigmas: Array1<f32>,
	sigmas: Array1<f32>,
	init_noise_sigma: f32,
	timesteps: Array1<f32>,
	num_train_timesteps: usize,
	has_scale_input_been_called: bool
}

impl EulerAncestralDiscreteScheduler {
	/// Creates a new instance of the scheduler.
	///
	/// # Parameters
	/// - **`num_train_timesteps`**: number of diffusion steps used to train the model.
	/// - **`beta_start`**: the starting `beta` value of inference.
	/// - **`beta_end`**: the final `beta` value.
	/// - **`beta_schedule`**: the beta schedule; see [`BetaSchedule`]
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

impl DiffusionScheduler for EulerAncestralDiscreteScheduler {
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
		rng: &mut R
	) -> anyhow::Result<SchedulerStepOutput> {
		if !self.has_scale_input_been_called {
			anyhow::bail!("`scale_model_input` must be called before `step`");
		}

		let step_index = step_index(self.timesteps.view(), timestep)?;
		let sigma_from = self.sigmas[step_index];
		let sigma_to = self.sigmas[step_index + 1];

		// 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
		let pred_original_sample = &sample - &(&model_output * sigma_from);
		let sigma_up = (sigma_to.powi(2) * (sigma_from.powi(2) - sigma_to.powi(2)) / sigma_from.powi(2)).sqrt();
		let sigma_down = (sigma_to.powi(2) - sigma_up.powi(2)).sqrt();

		// 2. convert to an ODE derivative
		let derivative = (&sample - &pred_original_sample) / sigma_from;
		let dt = sigma_down - sigma_from;
		let prev_sample = &sample + &(derivative * dt);

		let noise = Array4::<f32>::random_using(model_output.raw_dim(), StandardNormal, rng);
		let prev_sample = prev_sample + noise * sigma_up;

		Ok(SchedulerStepOutput {
			prev_sample,
			pred_original_sample: Some(pred_original_sample)
		})
	}
}

impl SchedulerOptimizedDefaults for EulerAncestralDiscreteScheduler {
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

	use super::EulerAncestralDiscreteScheduler;
	use crate::schedulers::{DiffusionScheduler, SchedulerOptimizedDefaults};

	#[test]
	fn test_timesteps_are_strictly_decreasing() {
		let mut scheduler = EulerAncestralDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		scheduler.set_timesteps(15);
		let timesteps = scheduler.timesteps();
		assert_eq!(timesteps.len(), 15);
		assert_eq!(timesteps[0], 999.0);
		assert!(timesteps.windows(2).into_iter().all(|w| w[1] < w[0]));
	}

	#[test]
	fn test_same_seed_same_step() {
		let run = |seed: u64| {
			let mut scheduler = EulerAncestralDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
			scheduler.set_timesteps(3);
			let t = scheduler.timesteps()[0];
			let sample = Array4::<f32>::from_elem((1, 4, 3, 3), 2.0);
			let noise = Array4::<f32>::from_elem((1, 4, 3, 3), 0.1);
			let mut rng = StdRng::seed_from_u64(seed);
			scheduler.scale_model_input(sample.view(), t).unwrap();
			scheduler.step(noise.view(), t, sample.view(), &mut rng).unwrap().into_prev_sample()
		};
		assert_eq!(run(7), run(7));
		assert_ne!(run(7), run(8));
	}
}
