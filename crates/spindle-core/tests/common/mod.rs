//! Test doubles for the model backend

#![allow(dead_code)]

use parking_lot::Mutex;
use spindle_core::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};

pub const BOS: TokenId = 1;
pub const EOS: TokenId = 2;
pub const NL: TokenId = 13;
pub const VOCAB: usize = 64;

/// Calls observed by a [`MockContext`]
#[derive(Debug, Default)]
pub struct CallLog {
    /// `(n_past, n_tokens)` of every successful eval
    pub evals: Vec<(usize, usize)>,
    /// Adapters applied, in order
    pub adapters: Vec<PathBuf>,
}

/// Deterministic context: after evaluating up to position `n`, the logits
/// strongly favour token `20 + n % 10`, or EOS once `eos_at` is reached.
pub struct MockContext {
    n_ctx: usize,
    logits: Vec<f32>,
    pub eos_at: Option<usize>,
    pub fail_at: Option<usize>,
    gate: Option<mpsc::Receiver<()>>,
    log: Arc<Mutex<CallLog>>,
}

impl MockContext {
    pub fn new(n_ctx: usize) -> Self {
        Self {
            n_ctx,
            logits: vec![0.0; VOCAB],
            eos_at: None,
            fail_at: None,
            gate: None,
            log: Arc::new(Mutex::new(CallLog::default())),
        }
    }

    /// Block the first eval until the returned sender fires or is dropped
    pub fn gated(mut self) -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        self.gate = Some(rx);
        (self, tx)
    }

    pub fn log(&self) -> Arc<Mutex<CallLog>> {
        Arc::clone(&self.log)
    }

    /// Token the context favours after evaluating up to `n_past`
    pub fn favoured(n_past: usize) -> TokenId {
        20 + (n_past % 10) as TokenId
    }
}

impl Tokenizer for MockContext {
    fn tokenize(&self, text: &str, add_bos: bool) -> spindle_core::Result<Vec<TokenId>> {
        if let Some(word) = text.split_whitespace().find(|word| *word == "<unk>") {
            return Err(CoreError::tokenizer(
                "TOKENIZER_UNKNOWN_PIECE",
                format!("no token for `{}`", word),
                "Tokenizing prompt",
            ));
        }

        let mut tokens = Vec::new();
        if add_bos {
            tokens.push(BOS);
        }
        tokens.extend(text.split_whitespace().map(|word| 30 + (word.len() % 20) as TokenId));
        Ok(tokens)
    }

    fn token_to_piece(&self, token: TokenId) -> String {
        match token {
            BOS => String::new(),
            EOS => String::new(),
            NL => "\n".to_string(),
            id => format!(" t{}", id),
        }
    }

    fn token_eos(&self) -> TokenId {
        EOS
    }

    fn token_nl(&self) -> TokenId {
        NL
    }
}

impl ModelContext for MockContext {
    fn eval(&mut self, tokens: &[TokenId], n_past: usize, _n_threads: usize) -> spindle_core::Result<()> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.recv();
        }
        if self.fail_at.map_or(false, |at| n_past >= at) {
            return Err(CoreError::eval("EVAL_BACKEND_FAILED", "mock backend failure", format!("n_past={}", n_past)));
        }

        self.log.lock().evals.push((n_past, tokens.len()));

        let position = n_past + tokens.len();
        let next = match self.eos_at {
            Some(at) if position >= at => EOS,
            _ => Self::favoured(position),
        };
        self.logits.iter_mut().for_each(|logit| *logit = 0.0);
        self.logits[next as usize] = 12.0;
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }

    fn n_vocab(&self) -> usize {
        VOCAB
    }

    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn apply_adapter(&mut self, path: &Path, _n_threads: usize) -> spindle_core::Result<()> {
        if path.extension().map_or(true, |ext| ext != "bin") {
            return Err(CoreError::adapter(
                "ADAPTER_INVALID",
                "adapter must be a .bin file",
                "Pass a converted adapter",
                path,
            ));
        }
        self.log.lock().adapters.push(path.to_path_buf());
        Ok(())
    }
}

/// Loader producing [`MockContext`]s; model paths named `missing.bin` fail
pub struct MockLoader {
    pub n_ctx: usize,
}

impl ModelLoader for MockLoader {
    type Context = MockContext;

    fn load(&self, params: &ModelParams) -> spindle_core::Result<MockContext> {
        if params.model.file_name().map_or(true, |name| name == "missing.bin") {
            return Err(CoreError::load_with_path(
                "LOAD_MODEL_NOT_FOUND",
                "failed to load model",
                "Loading weights",
                "Check the model path",
                &params.model,
            ));
        }
        let mut context = MockContext::new(self.n_ctx);
        if let Some(lora) = &params.lora {
            context.apply_adapter(lora, 1)?;
        }
        Ok(context)
    }
}

/// Greedy parameters without repetition penalty, so output follows the mock
pub fn greedy(max_new_tokens: i32) -> SamplingParams {
    SamplingParams {
        repeat_penalty: 1.0,
        ..SamplingParams::greedy(max_new_tokens)
    }
}

/// Config running greedy decoding with the given echo setting
pub fn config(max_new_tokens: i32, echo_prompt: bool) -> ServiceConfig {
    ServiceConfig {
        n_threads: 1,
        echo_prompt,
        sampling: greedy(max_new_tokens),
        ..ServiceConfig::for_model("model.bin")
    }
}

/// Sink collecting events into a channel
pub fn channel_sink() -> (impl FnMut(StreamEvent) + Send + 'static, mpsc::Receiver<StreamEvent>) {
    let (tx, rx) = mpsc::channel();
    let sink = move |event: StreamEvent| {
        let _ = tx.send(event);
    };
    (sink, rx)
}
