//! Sliding window of recently consumed and sampled tokens

use crate::TokenId;
use std::collections::VecDeque;

/// Fixed-size window of the most recent tokens, oldest first.
///
/// The window always holds exactly `capacity` entries: it starts filled with
/// token `0` and every push evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    tokens: VecDeque<TokenId>,
}

impl HistoryWindow {
    /// Create a zero-filled window
    pub fn new(capacity: usize) -> Self {
        Self {
            tokens: std::iter::repeat(0).take(capacity).collect(),
        }
    }

    /// Evict the oldest token and append `token`
    pub fn push(&mut self, token: TokenId) {
        if self.tokens.pop_front().is_some() {
            self.tokens.push_back(token);
        }
    }

    /// The last `k` tokens (clamped to the window size), oldest first
    pub fn recent(&self, k: usize) -> impl Iterator<Item = TokenId> + '_ {
        let start = self.tokens.len() - k.min(self.tokens.len());
        self.tokens.range(start..).copied()
    }

    /// Most recently pushed token
    pub fn last(&self) -> Option<TokenId> {
        self.tokens.back().copied()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tokens.len()
    }
}
