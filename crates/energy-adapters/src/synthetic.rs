//! Random draws shared by the synthetic generators.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub(crate) struct Noise {
    rng: StdRng,
}

impl Noise {
    /// Seeded generators are reproducible; unseeded ones draw from the OS.
    pub(crate) fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { rng }
    }

    pub(crate) fn uniform(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.rng.random::<f64>()
    }

    /// Box-Muller normal draw.
    pub(crate) fn gaussian(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.rng.random::<f64>().max(f64::MIN_POSITIVE);
        let u2 = self.rng.random::<f64>();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }

    pub(crate) fn exponential(&mut self, mean: f64) -> f64 {
        let u = self.rng.random::<f64>().max(f64::MIN_POSITIVE);
        -mean * u.ln()
    }

    pub(crate) fn chance(&mut self, probability: f64) -> bool {
        self.rng.random::<f64>() < probability
    }
}

/// Cells are written with fixed precision, the way providers print them.
pub(crate) fn cell(value: f64, decimals: usize) -> String {
    format!("{value:.decimals$}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_noise_is_reproducible() {
        let mut a = Noise::new(Some(7));
        let mut b = Noise::new(Some(7));
        for _ in 0..10 {
            assert_eq!(a.gaussian(0.0, 1.0), b.gaussian(0.0, 1.0));
        }
    }

    #[test]
    fn draws_stay_in_their_support() {
        let mut noise = Noise::new(Some(1));
        for _ in 0..1000 {
            let u = noise.uniform(2.0, 3.0);
            assert!((2.0..=3.0).contains(&u));
            assert!(noise.exponential(5.0) >= 0.0);
        }
        assert_eq!(cell(1.23456, 2), "1.23");
    }
}
