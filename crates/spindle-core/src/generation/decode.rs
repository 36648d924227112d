//! Decode loop: prompt ingestion, batch evaluation and sampling

use crate::{
    backend::ModelContext,
    generation::{FinishReason, GenerationStats, RunSummary, SamplingParams},
    history::HistoryWindow,
    sampling::Sampler,
    stream::StreamEvent,
    RunError, TokenId,
};
use std::time::Instant;
use tracing::{debug, error, trace};

/// Tokens of context reserved beyond the prompt
const CONTEXT_RESERVE: usize = 4;

/// Per-run knobs that are not sampling parameters
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Threads handed to every eval call
    pub n_threads: usize,

    /// Stream ingested prompt tokens back to the sink
    pub echo_prompt: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            n_threads: 1,
            echo_prompt: true,
        }
    }
}

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePhase {
    /// Prompt tokens are still being fed to the model
    PromptIngest,
    /// Every prompt token is consumed; each step samples one token
    Generate,
    /// The run has stopped
    Terminated,
}

/// State of one generation run over an exclusively borrowed context.
///
/// Each [`step`](DecodeRun::step) evaluates the pending tokens, refills them
/// (next prompt batch or one sampled token), emits them, and reports whether
/// the run is finished.
pub struct DecodeRun<'ctx, C: ModelContext + ?Sized> {
    ctx: &'ctx mut C,
    options: RunOptions,
    batch_size: usize,
    interactive: bool,
    n_ctx: usize,
    eos: TokenId,
    prompt_tokens: Vec<TokenId>,
    pending: Vec<TokenId>,
    history: HistoryWindow,
    sampler: Sampler,
    phase: DecodePhase,
    n_past: usize,
    n_consumed: usize,
    n_remaining: i64,
    tokens_emitted: usize,
    tokens_generated: usize,
    eval_calls: usize,
    started_at: Instant,
    first_token_at: Option<Instant>,
}

impl<'ctx, C: ModelContext + ?Sized> DecodeRun<'ctx, C> {
    /// Tokenize the prompt and set up the run.
    ///
    /// Fails with [`RunError::PromptTooLong`] when the prompt leaves fewer
    /// than four positions of context; nothing is evaluated or emitted then.
    pub fn prepare(
        ctx: &'ctx mut C,
        prompt: &str,
        params: SamplingParams,
        options: RunOptions,
    ) -> Result<Self, RunError> {
        let started_at = Instant::now();

        // The tokenizer expects word-initial pieces, so the prompt gets a
        // leading space.
        let text = format!(" {}", prompt);
        let prompt_tokens = ctx.tokenize(&text, true).map_err(|err| RunError::Tokenize {
            message: err.to_string(),
        })?;

        let n_ctx = ctx.n_ctx();
        let max_tokens = n_ctx.saturating_sub(CONTEXT_RESERVE);
        if prompt_tokens.len() > max_tokens {
            error!(n_tokens = prompt_tokens.len(), max_tokens, "prompt is too long");
            return Err(RunError::PromptTooLong {
                n_tokens: prompt_tokens.len(),
                max_tokens,
            });
        }

        let eos = ctx.token_eos();
        let sampler = Sampler::new(params.clone(), n_ctx, eos, ctx.token_nl());

        debug!(
            prompt_tokens = prompt_tokens.len(),
            n_ctx,
            batch_size = params.batch_size,
            max_new_tokens = params.max_new_tokens,
            "prompt tokenized"
        );

        Ok(Self {
            ctx,
            options,
            batch_size: params.batch_size.max(1),
            interactive: params.interactive,
            n_ctx,
            eos,
            prompt_tokens,
            pending: Vec::new(),
            history: HistoryWindow::new(n_ctx),
            sampler,
            phase: DecodePhase::PromptIngest,
            n_past: 0,
            n_consumed: 0,
            n_remaining: i64::from(params.max_new_tokens),
            tokens_emitted: 0,
            tokens_generated: 0,
            eval_calls: 0,
            started_at,
            first_token_at: None,
        })
    }

    pub fn phase(&self) -> DecodePhase {
        self.phase
    }

    pub fn n_past(&self) -> usize {
        self.n_past
    }

    pub fn n_consumed(&self) -> usize {
        self.n_consumed
    }

    pub fn n_remaining(&self) -> i64 {
        self.n_remaining
    }

    pub fn prompt_tokens(&self) -> &[TokenId] {
        &self.prompt_tokens
    }

    pub fn history(&self) -> &HistoryWindow {
        &self.history
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    /// Whether the token budget is spent in a non-interactive run
    fn budget_exhausted(&self) -> bool {
        self.n_remaining == 0 && !self.interactive
    }

    /// Drive the run to completion, emitting every event through `emit`
    pub fn run<E>(mut self, mut emit: E) -> Result<RunSummary, RunError>
    where
        E: FnMut(StreamEvent),
    {
        if self.budget_exhausted() {
            return Ok(self.finish(FinishReason::MaxTokens));
        }

        loop {
            match self.step(&mut emit) {
                Ok(Some(reason)) => return Ok(self.finish(reason)),
                Ok(None) => {}
                Err(err) => {
                    self.phase = DecodePhase::Terminated;
                    return Err(err);
                }
            }
        }
    }

    /// One iteration: eval pending, refill, emit, check termination
    pub fn step<E>(&mut self, emit: &mut E) -> Result<Option<FinishReason>, RunError>
    where
        E: FnMut(StreamEvent),
    {
        self.eval_pending()?;

        let sampled = if self.n_consumed >= self.prompt_tokens.len() {
            if self.phase == DecodePhase::PromptIngest {
                debug!(n_past = self.n_past, "prompt ingested, generating");
                self.phase = DecodePhase::Generate;
            }
            let id = self.sample_next()?;
            self.pending.push(id);
            self.n_remaining -= 1;
            true
        } else {
            while self.n_consumed < self.prompt_tokens.len() {
                let token = self.prompt_tokens[self.n_consumed];
                self.pending.push(token);
                self.history.push(token);
                self.n_consumed += 1;
                if self.pending.len() >= self.batch_size {
                    break;
                }
            }
            false
        };

        if !sampled && !self.options.echo_prompt {
            return Ok(None);
        }

        for &token in &self.pending {
            emit(StreamEvent::Token(self.ctx.token_to_piece(token)));
        }
        self.tokens_emitted += self.pending.len();

        if self.pending.last() == Some(&self.eos) {
            emit(StreamEvent::EndOfText);
            return Ok(Some(FinishReason::EndOfSequence));
        }
        if self.budget_exhausted() {
            return Ok(Some(FinishReason::MaxTokens));
        }
        Ok(None)
    }

    fn eval_pending(&mut self) -> Result<(), RunError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if self.n_past + self.pending.len() > self.n_ctx {
            error!(n_past = self.n_past, n_pending = self.pending.len(), "context is full");
            return Err(RunError::ContextFull {
                n_past: self.n_past,
                n_pending: self.pending.len(),
                n_ctx: self.n_ctx,
            });
        }

        for chunk in self.pending.chunks(self.batch_size) {
            if let Err(err) = self.ctx.eval(chunk, self.n_past, self.options.n_threads) {
                error!(n_past = self.n_past, n_eval = chunk.len(), "failed to eval: {}", err);
                return Err(RunError::EvalFailed {
                    n_past: self.n_past,
                    n_eval: chunk.len(),
                    message: err.to_string(),
                });
            }
            self.n_past += chunk.len();
            self.eval_calls += 1;
            trace!(n_eval = chunk.len(), n_past = self.n_past, "evaluated chunk");
        }
        self.pending.clear();
        Ok(())
    }

    fn sample_next(&mut self) -> Result<TokenId, RunError> {
        let n_vocab = self.ctx.n_vocab();
        let logits = self.ctx.logits();
        if logits.is_empty() || logits.len() != n_vocab {
            return Err(RunError::EvalFailed {
                n_past: self.n_past,
                n_eval: 0,
                message: format!("backend returned {} logits for a vocabulary of {}", logits.len(), n_vocab),
            });
        }

        let id = self.sampler.sample(logits, &mut self.history);
        self.tokens_generated += 1;
        if self.first_token_at.is_none() {
            self.first_token_at = Some(Instant::now());
        }
        Ok(id)
    }

    fn finish(&mut self, finish_reason: FinishReason) -> RunSummary {
        self.phase = DecodePhase::Terminated;

        let total = self.started_at.elapsed();
        let time_to_first_token_ms = self
            .first_token_at
            .map(|at| at.duration_since(self.started_at).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        let tokens_per_second = if total.as_secs_f64() > 0.0 {
            self.tokens_generated as f64 / total.as_secs_f64()
        } else {
            0.0
        };

        debug!(
            ?finish_reason,
            tokens_generated = self.tokens_generated,
            n_past = self.n_past,
            "run finished"
        );

        RunSummary {
            tokens_emitted: self.tokens_emitted,
            tokens_generated: self.tokens_generated,
            prompt_tokens: self.prompt_tokens.len(),
            finish_reason,
            stats: GenerationStats {
                time_to_first_token_ms,
                total_time_ms: total.as_secs_f64() * 1000.0,
                tokens_per_second,
                eval_calls: self.eval_calls,
            },
        }
    }
}
