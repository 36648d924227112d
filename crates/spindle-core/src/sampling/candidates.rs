//! Candidate set and the narrowing transforms applied to it

use crate::TokenId;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// One vocabulary entry of a sampling step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: TokenId,
    pub logit: f32,
    pub p: f32,
}

/// Descending logit; equal logits keep ascending id order
fn by_logit_desc(a: &TokenData, b: &TokenData) -> Ordering {
    b.logit.total_cmp(&a.logit).then(a.id.cmp(&b.id))
}

/// Candidates for one sampling step.
///
/// Built in id order from the raw logits and narrowed in place. Every filter
/// keeps at least `min_keep` entries, so a set built from a non-empty logit
/// vector is never emptied.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    data: Vec<TokenData>,
    sorted: bool,
}

impl CandidateSet {
    /// One candidate per logit, ids in ascending order
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| TokenData {
                id: id as TokenId,
                logit,
                p: 0.0,
            })
            .collect();
        Self { data, sorted: false }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the candidates are ordered by descending logit
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn as_slice(&self) -> &[TokenData] {
        &self.data
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TokenData> {
        self.data.iter()
    }

    pub fn get(&self, id: TokenId) -> Option<&TokenData> {
        self.data.iter().find(|c| c.id == id)
    }

    /// Overwrite the logit of `id`, if it is still a candidate
    pub fn set_logit(&mut self, id: TokenId, logit: f32) {
        if let Some(candidate) = self.data.iter_mut().find(|c| c.id == id) {
            candidate.logit = logit;
            self.sorted = false;
        }
    }

    fn sort(&mut self) {
        if !self.sorted {
            self.data.sort_unstable_by(by_logit_desc);
            self.sorted = true;
        }
    }

    /// Sort by descending logit and compute normalized probabilities
    pub fn softmax(&mut self) {
        if self.data.is_empty() {
            return;
        }
        self.sort();

        let max_logit = self.data[0].logit;
        let mut cum_sum = 0.0f32;
        for candidate in &mut self.data {
            candidate.p = (candidate.logit - max_logit).exp();
            cum_sum += candidate.p;
        }

        if cum_sum.is_finite() && cum_sum > 0.0 {
            for candidate in &mut self.data {
                candidate.p /= cum_sum;
            }
            return;
        }

        // Infinite or NaN logits: share the mass among the leaders, or
        // spread it uniformly when there is no usable leader.
        let leaders = self.data.iter().filter(|c| c.logit == max_logit).count();
        let (share, only_leaders) = if leaders > 0 {
            (1.0 / leaders as f32, true)
        } else {
            (1.0 / self.data.len() as f32, false)
        };
        for candidate in &mut self.data {
            candidate.p = if !only_leaders || candidate.logit == max_logit { share } else { 0.0 };
        }
    }

    /// Keep the `k` highest logits
    pub fn top_k(&mut self, k: usize, min_keep: usize) {
        let k = k.max(min_keep).min(self.data.len());
        if !self.sorted && k > 0 && k < self.data.len() {
            // Partition around the k-th entry, then order only the head.
            self.data.select_nth_unstable_by(k - 1, by_logit_desc);
            self.data.truncate(k);
            self.data.sort_unstable_by(by_logit_desc);
            self.sorted = true;
            return;
        }
        self.sort();
        self.data.truncate(k);
    }

    /// Nucleus filtering: keep the smallest prefix whose mass reaches `p`
    pub fn top_p(&mut self, p: f32, min_keep: usize) {
        if p >= 1.0 {
            return;
        }
        self.softmax();

        let mut cum_sum = 0.0f32;
        let mut last_idx = self.data.len();
        for (i, candidate) in self.data.iter().enumerate() {
            cum_sum += candidate.p;
            if cum_sum >= p && i + 1 >= min_keep {
                last_idx = i + 1;
                break;
            }
        }
        self.data.truncate(last_idx.max(1));
    }

    /// Tail free sampling: cut where the curvature of the sorted
    /// distribution has accumulated past `z`
    pub fn tail_free(&mut self, z: f32, min_keep: usize) {
        if z >= 1.0 || self.data.len() <= 2 {
            return;
        }
        self.softmax();

        let first_derivatives: Vec<f32> = self.data.windows(2).map(|w| w[0].p - w[1].p).collect();
        let mut second_derivatives: Vec<f32> = first_derivatives
            .windows(2)
            .map(|w| (w[0] - w[1]).abs())
            .collect();

        let sum: f32 = second_derivatives.iter().sum();
        if sum > 1e-6 {
            for value in &mut second_derivatives {
                *value /= sum;
            }
        } else {
            let uniform = 1.0 / second_derivatives.len() as f32;
            for value in &mut second_derivatives {
                *value = uniform;
            }
        }

        let mut cum_sum = 0.0f32;
        let mut last_idx = self.data.len();
        for (i, value) in second_derivatives.iter().enumerate() {
            cum_sum += value;
            if cum_sum > z && i >= min_keep {
                last_idx = i;
                break;
            }
        }
        self.data.truncate(last_idx.max(1));
    }

    /// Locally typical sampling: keep the tokens whose surprise is closest
    /// to the entropy of the distribution until their mass reaches `p`
    pub fn typical(&mut self, p: f32, min_keep: usize) {
        if p >= 1.0 || self.data.is_empty() {
            return;
        }
        self.softmax();

        let entropy: f32 = self
            .data
            .iter()
            .filter(|c| c.p > 0.0)
            .map(|c| -c.p * c.p.ln())
            .sum();

        let shifted_scores: Vec<f32> = self.data.iter().map(|c| (-c.p.ln() - entropy).abs()).collect();
        let mut indices: Vec<usize> = (0..self.data.len()).collect();
        indices.sort_by(|&a, &b| shifted_scores[a].total_cmp(&shifted_scores[b]));

        let mut cum_sum = 0.0f32;
        let mut last_idx = indices.len();
        for (i, &idx) in indices.iter().enumerate() {
            cum_sum += self.data[idx].p;
            if cum_sum > p && i + 1 >= min_keep {
                last_idx = i + 1;
                break;
            }
        }

        self.data = indices[..last_idx.max(1)].iter().map(|&idx| self.data[idx]).collect();
        self.sorted = false;
    }

    /// Divide every logit by `temperature`
    pub fn temperature(&mut self, temperature: f32) {
        for candidate in &mut self.data {
            candidate.logit /= temperature;
        }
    }

    /// Discourage tokens present in `recent`: positive logits are divided by
    /// `penalty`, non-positive ones multiplied
    pub fn penalize_repetition(&mut self, recent: &[TokenId], penalty: f32) {
        if recent.is_empty() || penalty == 1.0 {
            return;
        }

        let seen: HashSet<TokenId> = recent.iter().copied().collect();
        for candidate in &mut self.data {
            if !seen.contains(&candidate.id) {
                continue;
            }
            if candidate.logit <= 0.0 {
                candidate.logit *= penalty;
            } else {
                candidate.logit /= penalty;
            }
        }
        self.sorted = false;
    }

    /// Subtract `count * alpha_frequency + alpha_presence` from every token
    /// occurring in `recent`
    pub fn penalize_frequency_presence(&mut self, recent: &[TokenId], alpha_frequency: f32, alpha_presence: f32) {
        if recent.is_empty() || (alpha_frequency == 0.0 && alpha_presence == 0.0) {
            return;
        }

        let mut counts: HashMap<TokenId, usize> = HashMap::new();
        for &token in recent {
            *counts.entry(token).or_insert(0) += 1;
        }

        for candidate in &mut self.data {
            let count = match counts.get(&candidate.id) {
                Some(&count) => count,
                None => continue,
            };
            candidate.logit -= count as f32 * alpha_frequency + alpha_presence;
        }
        self.sorted = false;
    }

    /// Highest logit, lowest id on ties
    pub fn greedy(&self) -> TokenId {
        let mut best: Option<&TokenData> = None;
        for candidate in &self.data {
            best = match best {
                Some(current)
                    if candidate.logit > current.logit
                        || (candidate.logit == current.logit && candidate.id < current.id) =>
                {
                    Some(candidate)
                }
                None => Some(candidate),
                keep => keep,
            };
        }
        best.map_or(0, |c| c.id)
    }

    /// Draw an index proportionally to the softmax of the current logits.
    ///
    /// Falls back to the most probable candidate when the weights are
    /// degenerate.
    pub fn sample_index<R: Rng + ?Sized>(&mut self, rng: &mut R) -> usize {
        self.softmax();
        match WeightedIndex::new(self.data.iter().map(|c| c.p)) {
            Ok(dist) => dist.sample(rng),
            Err(_) => 0,
        }
    }

    /// Draw a token proportionally to the softmax of the current logits
    pub fn sample<R: Rng + ?Sized>(&mut self, rng: &mut R) -> TokenId {
        if self.data.is_empty() {
            return 0;
        }
        let idx = self.sample_index(rng);
        self.data[idx].id
    }
}
