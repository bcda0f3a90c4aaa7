/*! Planned FFTs.

Thin wrapper over rustfft that pins the transform size and direction at
construction and owns the scratch buffer. Transforms are unnormalized in
both directions; callers fold any `1/N` factor into their filters.
*/

use std::sync::Arc;

use rustfft::{Fft as RustFft, FftPlanner};

use crate::buffer::C;

pub struct Fft {
    plan: Arc<dyn RustFft<f32>>,
    scratch: Vec<C>,
    n: usize,
}

impl Fft {
    pub fn forward(n: usize) -> Self {
        let plan = FftPlanner::new().plan_fft_forward(n);
        let scratch = vec![C::new(0.0, 0.0); plan.get_inplace_scratch_len()];

        Fft { plan, scratch, n }
    }

    pub fn inverse(n: usize) -> Self {
        let plan = FftPlanner::new().plan_fft_inverse(n);
        let scratch = vec![C::new(0.0, 0.0); plan.get_inplace_scratch_len()];

        Fft { plan, scratch, n }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Transform `buf` in place. `buf.len()` must equal the planned size.
    pub fn execute(&mut self, buf: &mut [C]) {
        debug_assert_eq!(buf.len(), self.n);

        self.plan.process_with_scratch(buf, &mut self.scratch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_of_dc_is_impulse() {
        let n = 64;
        let mut fft = Fft::forward(n);
        let mut buf = vec![C::new(1.0, 0.0); n];

        fft.execute(&mut buf);

        assert!((buf[0].re - n as f32).abs() < 1e-3);
        for x in &buf[1..] {
            assert!(x.norm() < 1e-3);
        }
    }

    #[test]
    fn round_trip_scales_by_n() {
        let n = 32;
        let mut fwd = Fft::forward(n);
        let mut inv = Fft::inverse(n);

        let input: Vec<C> = (0..n).map(|i| C::new(i as f32, -(i as f32))).collect();
        let mut buf = input.clone();

        fwd.execute(&mut buf);
        inv.execute(&mut buf);

        for (x, y) in input.iter().zip(buf.iter()) {
            assert!((x.re * n as f32 - y.re).abs() < 1e-2);
            assert!((x.im * n as f32 - y.im).abs() < 1e-2);
        }
    }
}
