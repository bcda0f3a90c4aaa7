/*! A table-driven numerically controlled oscillator.

Phase is kept in binary radians: a `u32` accumulator whose full range is
one turn, so phase wraps for free. Sine and cosine come from a shared
quarter-wave-free lookup table indexed by the high bits of the accumulator.
*/

use std::f64::consts::PI;
use std::sync::OnceLock;

use crate::buffer::C;

const INTBITS: u32 = 12;
const TABLE_SIZE: usize = 1 << INTBITS;

fn sintab() -> &'static [(f32, f32)] {
    static TABLE: OnceLock<Vec<(f32, f32)>> = OnceLock::new();

    TABLE.get_or_init(|| {
        (0..TABLE_SIZE)
            .map(|i| {
                let theta = 2.0 * PI * i as f64 / TABLE_SIZE as f64;
                (theta.cos() as f32, theta.sin() as f32)
            })
            .collect()
    })
}

/// Convert radians to binary radians.
fn to_brad(theta: f64) -> u32 {
    let turns = theta / (2.0 * PI);
    let frac = turns - turns.floor();

    (frac * (u32::MAX as f64 + 1.0)) as u32
}

#[derive(Debug, Clone, Default)]
pub struct TableNco {
    theta: u32,
    dtheta: u32,
}

impl TableNco {
    /// An NCO advancing `dtheta` radians per sample.
    pub fn new(dtheta: f64) -> Self {
        TableNco {
            theta: 0,
            dtheta: to_brad(dtheta),
        }
    }

    pub fn frequency(&self) -> f64 {
        self.dtheta as f64 / (u32::MAX as f64 + 1.0) * 2.0 * PI
    }

    pub fn set_frequency(&mut self, dtheta: f64) {
        self.dtheta = to_brad(dtheta);
    }

    pub fn set_phase(&mut self, theta: f64) {
        self.theta = to_brad(theta);
    }

    /// Reset phase to zero and set a new frequency.
    pub fn reset(&mut self, dtheta: f64) {
        self.theta = 0;
        self.dtheta = to_brad(dtheta);
    }

    fn osc(&self) -> (f32, f32) {
        sintab()[(self.theta >> (32 - INTBITS)) as usize]
    }

    /// Mix a sample up by the oscillator and advance the phase.
    pub fn mix_up(&mut self, x: C) -> C {
        let (cos, sin) = self.osc();
        let out = x * C::new(cos, sin);

        self.theta = self.theta.wrapping_add(self.dtheta);
        out
    }

    /// Mix a sample down by the oscillator and advance the phase.
    pub fn mix_down(&mut self, x: C) -> C {
        let (cos, sin) = self.osc();
        let out = x * C::new(cos, -sin);

        self.theta = self.theta.wrapping_add(self.dtheta);
        out
    }

    pub fn mix_up_slice(&mut self, input: &[C], out: &mut Vec<C>) {
        out.reserve(input.len());

        for &x in input {
            let y = self.mix_up(x);
            out.push(y);
        }
    }

    pub fn mix_down_slice(&mut self, input: &[C], out: &mut Vec<C>) {
        out.reserve(input.len());

        for &x in input {
            let y = self.mix_down(x);
            out.push(y);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_up_generates_tone() {
        let f = 0.05;
        let mut nco = TableNco::new(2.0 * PI * f);

        for i in 0..100 {
            let y = nco.mix_up(C::new(1.0, 0.0));
            let expect = 2.0 * PI * f * i as f64;

            assert!((y.re as f64 - expect.cos()).abs() < 2e-3);
            assert!((y.im as f64 - expect.sin()).abs() < 2e-3);
        }
    }

    #[test]
    fn mix_down_inverts_mix_up() {
        let mut up = TableNco::new(0.3);
        let mut down = TableNco::new(0.3);

        for i in 0..50 {
            let x = C::new(i as f32, -(i as f32));
            let y = down.mix_down(up.mix_up(x));

            assert!((y.re - x.re).abs() < 1e-2 * (1.0 + x.re.abs()));
            assert!((y.im - x.im).abs() < 1e-2 * (1.0 + x.im.abs()));
        }
    }

    #[test]
    fn phase_wraps() {
        let mut nco = TableNco::new(PI);

        for _ in 0..1000 {
            nco.mix_up(C::new(1.0, 0.0));
        }

        // Still producing unit-magnitude oscillation
        let y = nco.mix_up(C::new(1.0, 0.0));
        assert!((y.norm() - 1.0).abs() < 1e-3);
    }
}
