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

use ndarray::ArrayView1;

/// Piecewise-linear interpolation of `(xp, fp)` at `x`, like `numpy.interp`.
///
/// `xp` must be sorted in increasing order. Points outside of `xp` are clamped to the first/last value of `fp`.
pub(crate) fn interp(x: f32, xp: ArrayView1<'_, f32>, fp: ArrayView1<'_, f32>) -> f32 {
	debug_assert_eq!(xp.len(), fp.len());
	let n = xp.len();
	if n == 0 {
		return f32::NAN;
	}
	if x <= xp[0] {
		return fp[0];
	}
	if x >= xp[n - 1] {
		return fp[n - 1];
	}

	// first index with xp[hi] > x; 1 <= hi <= n - 1 thanks to the bounds checks above
	let (mut lo, mut hi) = (0, n - 1);
	while hi > lo + 1 {
		let mid = (lo + hi) / 2;
		if xp[mid] > x {
			hi = mid;
		} else {
			lo = mid;
		}
	}

	let dx = xp[hi] - xp[lo];
	if dx > 0.0 { fp[lo] + (x - xp[lo]) / dx * (fp[hi] - fp[lo]) } else { fp[lo] }
}

#[cfg(test)]
mod tests {
	use ndarray::array;

	use super::interp;

	#[test]
	fn test_interp() {
		let xp = array![0.0, 1.0, 2.0, 3.0];
		let fp = array![0.0, 10.0, 20.0, 40.0];
		assert_eq!(interp(0.5, xp.view(), fp.view()), 5.0);
		assert_eq!(interp(2.5, xp.view(), fp.view()), 30.0);
		assert_eq!(interp(3.0, xp.view(), fp.view()), 40.0);
		assert_eq!(interp(1.0, xp.view(), fp.view()), 10.0);
	}

	#[test]
	fn test_interp_clamps_out_of_range() {
		let xp = array![0.0, 1.0];
		let fp = array![2.0, 4.0];
		assert_eq!(interp(-1.0, xp.view(), fp.view()), 2.0);
		assert_eq!(interp(7.0, xp.view(), fp.view()), 4.0);
	}
}
