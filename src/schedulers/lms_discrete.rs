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

use std::collections::VecDeque;

use anyhow::Context;
use ndarray::{Array1, Array4, ArrayView1, ArrayView4};
use rand::Rng;
use rgsl::IntegrationWorkspace;

use super::{
	alphas_cumprod, inference_sigmas, inference_timesteps, step_index, train_sigmas, BetaSchedule, DiffusionScheduler, SchedulerOptimizedDefaults,
	SchedulerStepOutput
};

/// Maximum number of past derivatives combined by the multistep update.
const LMS_ORDER: usize = 4;

/// [Linear multistep][lm] scheduler for discrete beta schedules. Based on the [original `k-diffusion`
/// implementation][kdif] by Katherine Crowson.
///
/// Multistep coefficients are integrated numerically with GSL's `qags` routine.
///
/// [lm]: https://en.wikipedia.org/wiki/Linear_multistep_method#Adams%E2%80%93Bashforth_methods
/// [kdif]: https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L181
pub struct LMSDiscreteScheduler {
	workspace: IntegrationWorkspace,
	train_sigmas: Array1<f32>,
	sigmas: Array1<f32>,
	init_noise_sigma: f32,
	timesteps: Array1<f32>,
	num_train_timesteps: usize,
	has_scale_input_been_called: bool,
	derivatives: VecDeque<Array4<f32>>
}

impl LMSDiscreteScheduler {
	/// Creates a new instance of the scheduler.
	///
	/// # Parameters
	/// - **`num_train_timesteps`**: number of diffusion steps used to train the model.
	/// - **`beta_start`**: the starting `beta` value of inference.
	/// - **`beta_end`**: the final `beta` value.
	/// - **`beta_schedule`**: the beta schedule; see [`BetaSchedule`]
	///
	/// # Errors
	/// In addition to invalid beta ranges, errors if the GSL integration workspace could not be allocated.
	pub fn new(num_train_timesteps: usize, beta_start: f32, beta_end: f32, beta_schedule: &BetaSchedule) -> anyhow::Result<Self> {
		let train_sigmas = train_sigmas(&alphas_cumprod(num_train_timesteps, beta_start, beta_end, beta_schedule)?);
		let init_noise_sigma = train_sigmas.iter().copied().fold(0.0_f32, f32::max);

		let timesteps = inference_timesteps(num_train_timesteps, num_train_timesteps);
		let sigmas = inference_sigmas(&train_sigmas, timesteps.view());

		Ok(Self {
			workspace: IntegrationWorkspace::new(num_train_timesteps).context("failed to allocate GSL integration workspace")?,
			train_sigmas,
			sigmas,
			init_noise_sigma,
			timesteps,
			num_train_timesteps,
			has_scale_input_been_called: false,
			derivatives: VecDeque::with_capacity(LMS_ORDER)
		})
	}

	/// Integrates the Lagrange basis polynomial for `current_order` over `[sigma_t, sigma_{t+1}]`.
	fn lms_coefficient(&mut self, order: usize, t: usize, current_order: usize) -> anyhow::Result<f32> {
		let sigmas = &self.sigmas;
		let (status, result, _abserr) = self.workspace.qags(
			|tau| {
				let mut prod = 1.0_f64;
				for k in 0..order {
					if k == current_order {
						continue;
					}
					let sigma_k = f64::from(sigmas[t - k]);
					prod *= (tau - sigma_k) / (f64::from(sigmas[t - current_order]) - sigma_k);
				}
				prod
			},
			f64::from(sigmas[t]),
			f64::from(sigmas[t + 1]),
			1.49e-8,
			1e-4,
			50
		);
		if !status.is_success() {
			anyhow::bail!("qags did not succeed; rgsl returned error: {status:?}");
		}
		Ok(result as f32)
	}
}

impl DiffusionScheduler for LMSDiscreteScheduler {
	fn set_timesteps(&mut self, num_inference_steps: usize) {
		self.timesteps = inference_timesteps(self.num_train_timesteps, num_inference_steps);
		self.sigmas = inference_sigmas(&self.train_sigmas, self.timesteps.view());
		self.derivatives.clear();
		self.has_scale_input_been_called = false;
	}

	fn timesteps(&self) -> ArrayView1<'_, f32> {
		self.timesteps.view()
	}

	fn init_noise_sigma(&self) -> f32 {
		self.init_noise_sigma
	}

	/// Scales the denoising model input by `(sigma**2 + 1) ** 0.5` to match the K-LMS algorithm.
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

		// 2. convert to an ODE derivative
		let derivative = (&sample - &pred_original_sample) / sigma;
		self.derivatives.push_back(derivative);
		if self.derivatives.len() > LMS_ORDER {
			self.derivatives.pop_front();
		}

		// 3. compute linear multistep coefficients
		let order = LMS_ORDER.min(step_index + 1).min(self.derivatives.len());
		let lms_coeffs = (0..order)
			.map(|o| self.lms_coefficient(order, step_index, o))
			.collect::<anyhow::Result<Vec<_>>>()?;

		// 4. compute previous sample based on the derivatives path, newest derivative first
		let mut prev_sample = sample.to_owned();
		for (coeff, derivative) in lms_coeffs.iter().zip(self.derivatives.iter().rev()) {
			prev_sample.scaled_add(*coeff, derivative);
		}

		Ok(SchedulerStepOutput {
			prev_sample,
			pred_original_sample: Some(pred_original_sample)
		})
	}
}

impl SchedulerOptimizedDefaults for LMSDiscreteScheduler {
	fn stable_diffusion_v1_optimized_default() -> anyhow::Result<Self>
	where
		Self: Sized
	{
		Self::new(1000, 0.00085, 0.012, &BetaSchedule::ScaledLinear)
	}
}
