//! Contracts of the external collaborators
//!
//! The model loader, tokenizer and tensor compute backend live outside this
//! crate. Generation only talks to them through these traits, so any runtime
//! (native bindings, a pure Rust model, a test double) can be plugged in.

use crate::{config::ModelParams, Result, TokenId};
use std::path::Path;

/// Text to token conversion provided by the loaded model's vocabulary
pub trait Tokenizer {
    /// Encode text into token ids, optionally prepending the BOS marker
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>>;

    /// Text piece of a single token, used for streaming output
    fn token_to_piece(&self, token: TokenId) -> String;

    /// End-of-sequence token id
    fn token_eos(&self) -> TokenId;

    /// Newline token id
    fn token_nl(&self) -> TokenId;
}

/// Loaded weights plus mutable evaluation state (position, key/value cache).
///
/// Exactly one generation may mutate a context at a time; the service keeps
/// it behind [`crate::guard::SingleFlight`].
pub trait ModelContext: Tokenizer + Send + 'static {
    /// Evaluate `tokens` starting at position `n_past`
    fn eval(&mut self, tokens: &[TokenId], n_past: usize, n_threads: usize) -> Result<()>;

    /// Logits of the last evaluated position, one per vocabulary id
    fn logits(&self) -> &[f32];

    /// Vocabulary size
    fn n_vocab(&self) -> usize;

    /// Context length the model was loaded with
    fn n_ctx(&self) -> usize;

    /// Replace the active adapter with the one stored at `path`
    fn apply_adapter(&mut self, path: &Path, n_threads: usize) -> Result<()>;
}

/// Inference runtime entry point creating model contexts
pub trait ModelLoader {
    type Context: ModelContext;

    /// Load weights (and the optional adapter) described by `params`
    fn load(&self, params: &ModelParams) -> Result<Self::Context>;
}
