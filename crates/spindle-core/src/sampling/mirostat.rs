//! Mirostat adaptive sampling
//!
//! Both variants steer the observed surprise (`-log2 p` of the sampled
//! token) toward a target `tau` by adjusting `mu` after every draw.

use super::CandidateSet;
use crate::TokenId;
use rand::Rng;

/// Number of candidates mirostat v1 uses to estimate the Zipf exponent
pub const MIROSTAT_M: usize = 100;

/// Adaptive state carried across the sampling steps of one run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MirostatState {
    pub mu: f32,
}

impl MirostatState {
    /// Initial `mu` is twice the target surprise
    pub fn new(tau: f32) -> Self {
        Self { mu: 2.0 * tau }
    }

    fn update(&mut self, p: f32, tau: f32, eta: f32) {
        let observed_surprise = -p.log2();
        self.mu -= eta * (observed_surprise - tau);
    }
}

impl CandidateSet {
    /// Mirostat v1: estimate the Zipf exponent from the `m` most probable
    /// candidates, derive `k` from `mu`, and sample from the top `k`.
    pub fn mirostat_v1<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        tau: f32,
        eta: f32,
        m: usize,
        state: &mut MirostatState,
    ) -> TokenId {
        if self.is_empty() {
            return 0;
        }
        let n = self.len() as f32;
        self.softmax();

        let mut sum_ti_bi = 0.0f32;
        let mut sum_ti_sq = 0.0f32;
        let probs = self.as_slice();
        for i in 0..m.saturating_sub(1).min(probs.len() - 1) {
            let (p0, p1) = (probs[i].p, probs[i + 1].p);
            if p0 <= 0.0 || p1 <= 0.0 {
                break;
            }
            let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
            let b_i = (p0 / p1).ln();
            sum_ti_bi += t_i * b_i;
            sum_ti_sq += t_i * t_i;
        }
        let s_hat = sum_ti_bi / sum_ti_sq;

        let epsilon_hat = s_hat - 1.0;
        let k = ((epsilon_hat * 2f32.powf(state.mu)) / (1.0 - n.powf(-epsilon_hat))).powf(1.0 / s_hat);
        let k = if k.is_nan() {
            self.len()
        } else {
            k.clamp(1.0, self.len() as f32) as usize
        };

        self.top_k(k, 1);
        let idx = self.sample_index(rng);
        let chosen = self.as_slice()[idx];
        state.update(chosen.p, tau, eta);
        chosen.id
    }

    /// Mirostat v2: drop candidates whose surprise exceeds `mu`, then sample
    /// from what is left.
    pub fn mirostat_v2<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        tau: f32,
        eta: f32,
        state: &mut MirostatState,
    ) -> TokenId {
        if self.is_empty() {
            return 0;
        }
        self.softmax();

        let mu = state.mu;
        let keep = self
            .iter()
            .position(|c| -c.p.log2() > mu)
            .unwrap_or(self.len())
            .max(1);
        self.top_k(keep, 1);

        let idx = self.sample_index(rng);
        let chosen = self.as_slice()[idx];
        state.update(chosen.p, tau, eta);
        chosen.id
    }
}
