//! Generation configuration and run results

pub mod decode;

use crate::{CoreError, Result, TokenId};
use serde::{Deserialize, Serialize};

pub use decode::{DecodePhase, DecodeRun, RunOptions};

/// Configuration for token sampling and the generation loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Temperature for sampling (<= 0.0 selects greedily)
    pub temperature: f32,

    /// Top-k sampling parameter (<= 0 keeps the whole vocabulary)
    pub top_k: i32,

    /// Top-p (nucleus) sampling threshold (1.0 = disabled)
    pub top_p: f32,

    /// Tail free sampling parameter (1.0 = disabled)
    pub tfs_z: f32,

    /// Locally typical sampling parameter (1.0 = disabled)
    pub typical_p: f32,

    /// Repetition penalty (1.0 = no penalty)
    pub repeat_penalty: f32,

    /// Number of recent tokens the penalties look at (< 0 = context length)
    pub repeat_last_n: i32,

    /// Frequency penalty (0.0 = disabled)
    pub frequency_penalty: f32,

    /// Presence penalty (0.0 = disabled)
    pub presence_penalty: f32,

    /// Mirostat variant
    pub mirostat: Mirostat,

    /// Mirostat target surprise
    pub mirostat_tau: f32,

    /// Mirostat learning rate
    pub mirostat_eta: f32,

    /// Whether penalties also apply to the newline token
    pub penalize_nl: bool,

    /// Additive biases applied to raw logits before anything else
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logit_bias: Vec<LogitBias>,

    /// Never sample the end-of-sequence token
    pub ignore_eos: bool,

    /// Maximum number of tokens handed to one eval call
    pub batch_size: usize,

    /// Number of tokens to generate (< 0 = until end of sequence)
    pub max_new_tokens: i32,

    /// Interactive runs never stop on the token budget
    pub interactive: bool,

    /// Random seed for reproducible generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            tfs_z: 1.0,
            typical_p: 1.0,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            mirostat: Mirostat::Disabled,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            penalize_nl: true,
            logit_bias: vec![],
            ignore_eos: false,
            batch_size: 512,
            max_new_tokens: 128,
            interactive: false,
            seed: None,
        }
    }
}

impl SamplingParams {
    /// Greedy decoding of at most `max_new_tokens` tokens
    pub fn greedy(max_new_tokens: i32) -> Self {
        Self {
            temperature: 0.0,
            max_new_tokens,
            ..Self::default()
        }
    }

    /// Validate parameter ranges
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, message: String| {
            CoreError::invalid_field(
                "CONFIG_INVALID_SAMPLING",
                field,
                message,
                "See SamplingParams defaults for sensible values",
            )
        };

        if self.batch_size == 0 {
            return Err(invalid("batch_size", "batch_size must be greater than 0".into()));
        }
        if !self.temperature.is_finite() {
            return Err(invalid("temperature", format!("temperature {} is not finite", self.temperature)));
        }
        for (field, value) in [("top_p", self.top_p), ("typical_p", self.typical_p), ("tfs_z", self.tfs_z)] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(invalid(field, format!("{} must be in (0, 1], got {}", field, value)));
            }
        }
        if !(self.repeat_penalty > 0.0) {
            return Err(invalid(
                "repeat_penalty",
                format!("repeat_penalty must be positive, got {}", self.repeat_penalty),
            ));
        }
        if self.mirostat_tau < 0.0 || self.mirostat_eta < 0.0 {
            return Err(invalid(
                "mirostat_tau",
                format!("mirostat tau/eta must not be negative, got {}/{}", self.mirostat_tau, self.mirostat_eta),
            ));
        }
        Ok(())
    }
}

/// Additive bias for a single token
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogitBias {
    pub token: TokenId,
    pub bias: f32,
}

/// Mirostat adaptive sampling variant, configured as 0, 1 or 2
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Mirostat {
    #[default]
    Disabled,
    V1,
    V2,
}

impl TryFrom<u8> for Mirostat {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Mirostat::Disabled),
            1 => Ok(Mirostat::V1),
            2 => Ok(Mirostat::V2),
            other => Err(format!("unknown mirostat mode {}, expected 0, 1 or 2", other)),
        }
    }
}

impl From<Mirostat> for u8 {
    fn from(mode: Mirostat) -> u8 {
        match mode {
            Mirostat::Disabled => 0,
            Mirostat::V1 => 1,
            Mirostat::V2 => 2,
        }
    }
}

/// Reason why a run stopped normally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Token budget exhausted
    MaxTokens,

    /// End of sequence token generated
    EndOfSequence,
}

/// Result of a completed generation run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Fragments pushed to the delivery channel, sentinel excluded
    pub tokens_emitted: usize,

    /// Tokens produced by the sampler
    pub tokens_generated: usize,

    /// Tokens in the tokenized prompt
    pub prompt_tokens: usize,

    /// Reason generation stopped
    pub finish_reason: FinishReason,

    /// Generation statistics
    pub stats: GenerationStats,
}

/// Statistics about the generation process
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationStats {
    /// Time to first sampled token (ms)
    pub time_to_first_token_ms: f64,

    /// Total run time (ms)
    pub total_time_ms: f64,

    /// Sampled tokens per second
    pub tokens_per_second: f64,

    /// Number of eval calls issued
    pub eval_calls: usize,
}
