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

use std::{cell::RefCell, env};

use kdam::{tqdm, BarExt};
use ort_diffusers::{
	ArenaExtendStrategy, CUDADeviceOptions, DiffusionDevice, DiffusionDeviceControl, EulerAncestralDiscreteScheduler, OrtEnvironment,
	SchedulerOptimizedDefaults, StableDiffusionOptions, StableDiffusionPipeline, StableDiffusionTxt2ImgOptions, Txt2ImgOutput
};
use tracing_subscriber::EnvFilter;

const STEPS: usize = 15;

fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

	let mut args = env::args().skip(1);
	let model = args.next().unwrap_or_else(|| "./stable-diffusion-v1-5/".to_string());
	let prompt = args.next().unwrap_or_else(|| "a red circle".to_string());
	let negative_prompt = args.next();

	let environment = OrtEnvironment::default().into_arc();
	let mut scheduler = EulerAncestralDiscreteScheduler::stable_diffusion_v1_optimized_default()?;
	let pipeline = StableDiffusionPipeline::new(
		&environment,
		env::current_dir()?.join(model),
		StableDiffusionOptions {
			devices: DiffusionDeviceControl {
				unet: DiffusionDevice::CUDA(
					0,
					Some(CUDADeviceOptions {
						memory_limit: Some(3000000000),
						arena_extend_strategy: Some(ArenaExtendStrategy::SameAsRequested)
					})
				),
				..Default::default()
			},
			..Default::default()
		}
	)?;

	let output = {
		let pb = RefCell::new(tqdm!(total = STEPS, desc = "generating"));
		StableDiffusionTxt2ImgOptions::default()
			.with_steps(STEPS)
			.with_prompts(prompt, negative_prompt)
			.with_safety_checker(pipeline.has_safety_checker())
			.callback_progress(1, move |step, _| {
				pb.borrow_mut().update_to(step + 1);
				true
			})
			.run(&pipeline, &mut scheduler)?
	};

	match output {
		Txt2ImgOutput::Image(image) => image.save("result.png")?,
		Txt2ImgOutput::Rejected => eprintln!("\nthe safety checker flagged the generated image; nothing was saved")
	}

	Ok(())
}
