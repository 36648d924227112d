//! The sampling chain: bias, penalties, then one selection strategy

use super::{CandidateSet, MirostatState, MIROSTAT_M};
use crate::{
    generation::{Mirostat, SamplingParams},
    history::HistoryWindow,
    TokenId,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::trace;

/// Turns one logit vector into one token, following [`SamplingParams`].
///
/// A sampler lives for one generation run; its RNG and mirostat state carry
/// over from one step to the next.
#[derive(Debug)]
pub struct Sampler {
    params: SamplingParams,
    n_ctx: usize,
    eos: TokenId,
    nl: TokenId,
    rng: StdRng,
    mirostat: MirostatState,
}

impl Sampler {
    pub fn new(params: SamplingParams, n_ctx: usize, eos: TokenId, nl: TokenId) -> Self {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mirostat = MirostatState::new(params.mirostat_tau);
        Self {
            params,
            n_ctx,
            eos,
            nl,
            rng,
            mirostat,
        }
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    pub fn mirostat(&self) -> &MirostatState {
        &self.mirostat
    }

    /// Number of history entries the penalties look at
    pub fn penalty_window(&self, history: &HistoryWindow) -> usize {
        let repeat_last_n = if self.params.repeat_last_n < 0 {
            self.n_ctx
        } else {
            self.params.repeat_last_n as usize
        };
        history.len().min(repeat_last_n).min(self.n_ctx)
    }

    /// Build the candidate set for `logits` with biases and penalties applied
    pub fn prepare_candidates(&self, logits: &[f32], history: &HistoryWindow) -> CandidateSet {
        let mut logits = logits.to_vec();
        for bias in &self.params.logit_bias {
            if let Some(logit) = logits.get_mut(bias.token as usize) {
                *logit += bias.bias;
            }
        }
        if self.params.ignore_eos {
            if let Some(logit) = logits.get_mut(self.eos as usize) {
                *logit = f32::NEG_INFINITY;
            }
        }

        let mut candidates = CandidateSet::from_logits(&logits);

        let recent: Vec<TokenId> = history.recent(self.penalty_window(history)).collect();
        candidates.penalize_repetition(&recent, self.params.repeat_penalty);
        candidates.penalize_frequency_presence(
            &recent,
            self.params.frequency_penalty,
            self.params.presence_penalty,
        );

        if !self.params.penalize_nl {
            if let Some(&nl_logit) = logits.get(self.nl as usize) {
                candidates.set_logit(self.nl, nl_logit);
            }
        }

        candidates
    }

    /// Select the next token without recording it in `history`
    pub fn select(&mut self, logits: &[f32], history: &HistoryWindow) -> TokenId {
        let mut candidates = self.prepare_candidates(logits, history);
        let params = &self.params;
        let temperature = params.temperature;

        let id = if temperature <= 0.0 {
            candidates.greedy()
        } else {
            match params.mirostat {
                Mirostat::V1 => {
                    candidates.temperature(temperature);
                    candidates.mirostat_v1(
                        &mut self.rng,
                        params.mirostat_tau,
                        params.mirostat_eta,
                        MIROSTAT_M,
                        &mut self.mirostat,
                    )
                }
                Mirostat::V2 => {
                    candidates.temperature(temperature);
                    candidates.mirostat_v2(
                        &mut self.rng,
                        params.mirostat_tau,
                        params.mirostat_eta,
                        &mut self.mirostat,
                    )
                }
                Mirostat::Disabled => {
                    let top_k = if params.top_k <= 0 {
                        logits.len()
                    } else {
                        params.top_k as usize
                    };
                    candidates.top_k(top_k, 1);
                    candidates.tail_free(params.tfs_z, 1);
                    candidates.typical(params.typical_p, 1);
                    candidates.top_p(params.top_p, 1);
                    candidates.temperature(temperature);
                    candidates.sample(&mut self.rng)
                }
            }
        };

        trace!(token = id, candidates = candidates.len(), mu = self.mirostat.mu, "sampled token");
        id
    }

    /// Select the next token and push it into `history`
    pub fn sample(&mut self, logits: &[f32], history: &mut HistoryWindow) -> TokenId {
        let id = self.select(logits, history);
        history.push(id);
        id
    }
}
