//! Model arguments for contrastive training.
//!
//! `ModelArgs` carries every knob the forward pipelines read: pooling mode,
//! temperature, memory bank geometry, auxiliary branches, and output format.
//!
//! # Loading Configuration
//!
//! ```rust,ignore
//! use simcse_bank::ModelArgs;
//!
//! // Load from file
//! let args = ModelArgs::from_file("simcse.toml")?;
//!
//! // With environment overrides
//! let args = ModelArgs::default().with_env_overrides()?;
//! args.validate()?;
//! ```
//!
//! # TOML Structure
//!
//! ```toml
//! pooler_type = "cls"
//! temp = 0.05
//! bank_size = 1024
//! hidden_len = 768
//! do_mlm = false
//! do_stronger = true
//! mlm_weight = 0.1
//! cutoff_rate = 0.1
//! ```
//!
//! # Design Principles
//!
//! - **NO FALLBACKS**: An unknown pooler name or unparsable override is an error
//! - **FAIL FAST**: `validate()` returns the first out-of-range value

use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ContrastiveError, ContrastiveResult};

// ============================================================================
// POOLER TYPE
// ============================================================================

/// Parameter-free pooling mode reducing token states to one vector per sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum PoolerType {
    /// First-position state, followed by the projection head.
    #[default]
    Cls,
    /// First-position state without the projection head.
    ClsBeforePooler,
    /// Masked mean of the last layer.
    Avg,
    /// Masked mean of the average of the last two layers.
    AvgTop2,
    /// Masked mean of the average of the first and last layers.
    AvgFirstLast,
}

impl PoolerType {
    /// Returns all supported pooling modes.
    pub fn all() -> &'static [PoolerType] {
        &[
            PoolerType::Cls,
            PoolerType::ClsBeforePooler,
            PoolerType::Avg,
            PoolerType::AvgTop2,
            PoolerType::AvgFirstLast,
        ]
    }

    /// Returns the mode name as snake_case string.
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolerType::Cls => "cls",
            PoolerType::ClsBeforePooler => "cls_before_pooler",
            PoolerType::Avg => "avg",
            PoolerType::AvgTop2 => "avg_top2",
            PoolerType::AvgFirstLast => "avg_first_last",
        }
    }

    /// Whether the encoder must return its full hidden-state stack.
    pub fn needs_hidden_states(&self) -> bool {
        matches!(self, PoolerType::AvgTop2 | PoolerType::AvgFirstLast)
    }

    /// Whether pooled outputs go through the projection head.
    pub fn uses_projection(&self) -> bool {
        matches!(self, PoolerType::Cls)
    }
}

impl fmt::Display for PoolerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolerType {
    type Err = ContrastiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PoolerType::all()
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ContrastiveError::UnsupportedPooler {
                pooler_type: s.to_string(),
            })
    }
}

impl TryFrom<String> for PoolerType {
    type Error = ContrastiveError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PoolerType> for String {
    fn from(value: PoolerType) -> Self {
        value.as_str().to_string()
    }
}

// ============================================================================
// MODEL ARGS
// ============================================================================

/// Configuration for the contrastive and sentence-embedding forward passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArgs {
    /// Pooling mode. Required to be one of the five supported names.
    #[serde(default)]
    pub pooler_type: PoolerType,

    /// Softmax temperature dividing every cosine similarity. Must be > 0.
    #[serde(default = "default_temp")]
    pub temp: f32,

    /// Number of rows in the memory bank.
    /// Every enqueued batch size must divide it.
    #[serde(default = "default_bank_size")]
    pub bank_size: usize,

    /// Width of each memory bank row (the encoder hidden size).
    #[serde(default = "default_hidden_len")]
    pub hidden_len: usize,

    /// Enable the masked-LM reconstruction view and the bank loss.
    #[serde(default)]
    pub do_mlm: bool,

    /// Enable the strongly augmented third view and the bank loss.
    #[serde(default)]
    pub do_stronger: bool,

    /// Weight of the memory bank distillation term.
    #[serde(default = "default_mlm_weight")]
    pub mlm_weight: f32,

    /// Logit offset for hard negatives. Declared for compatibility; the
    /// active loss does not read it.
    #[serde(default)]
    pub hard_negative_weight: f32,

    /// Fraction of hidden columns zeroed for the strongly augmented view.
    #[serde(default = "default_cutoff_rate")]
    pub cutoff_rate: f32,

    /// Only apply the projection head during training.
    #[serde(default)]
    pub mlp_only_train: bool,

    /// Identifier of the masked-token predictor the caller wires in.
    #[serde(default)]
    pub generator_name: Option<String>,

    /// Token id forced into position 0 of reconstructed MLM inputs
    /// (101 for BERT vocabularies, 0 for RoBERTa).
    #[serde(default = "default_cls_token_id")]
    pub cls_token_id: u32,

    /// Default output format when a call does not specify one.
    #[serde(default = "default_use_return_dict")]
    pub use_return_dict: bool,
}

fn default_temp() -> f32 {
    0.05
}

fn default_bank_size() -> usize {
    1024
}

fn default_hidden_len() -> usize {
    768
}

fn default_mlm_weight() -> f32 {
    0.1
}

fn default_cutoff_rate() -> f32 {
    0.1
}

fn default_cls_token_id() -> u32 {
    101
}

fn default_use_return_dict() -> bool {
    true
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self {
            pooler_type: PoolerType::default(),
            temp: default_temp(),
            bank_size: default_bank_size(),
            hidden_len: default_hidden_len(),
            do_mlm: false,
            do_stronger: false,
            mlm_weight: default_mlm_weight(),
            hard_negative_weight: 0.0,
            cutoff_rate: default_cutoff_rate(),
            mlp_only_train: false,
            generator_name: None,
            cls_token_id: default_cls_token_id(),
            use_return_dict: default_use_return_dict(),
        }
    }
}

impl ModelArgs {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// - `ContrastiveError::IoError` if the file cannot be read
    /// - `ContrastiveError::ConfigError` if it cannot be parsed, including an
    ///   unrecognized `pooler_type`
    pub fn from_file(path: impl AsRef<Path>) -> ContrastiveResult<Self> {
        let path = path.as_ref();

        let contents = std::fs::read_to_string(path)?;

        toml::from_str(&contents).map_err(|e| ContrastiveError::ConfigError {
            message: format!("Failed to parse TOML in '{}': {}", path.display(), e),
        })
    }

    /// Create configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> ContrastiveResult<Self> {
        toml::from_str(toml).map_err(|e| ContrastiveError::ConfigError {
            message: format!("Failed to parse TOML: {}", e),
        })
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml_string(&self) -> ContrastiveResult<String> {
        toml::to_string_pretty(self).map_err(|e| ContrastiveError::SerializationError {
            message: format!("Failed to serialize ModelArgs: {}", e),
        })
    }

    /// Validate all configuration values, returning the first error found.
    pub fn validate(&self) -> ContrastiveResult<()> {
        if !(self.temp > 0.0) || !self.temp.is_finite() {
            return Err(ContrastiveError::ConfigError {
                message: format!("temp must be a finite value > 0, got {}", self.temp),
            });
        }
        if self.bank_size == 0 {
            return Err(ContrastiveError::ConfigError {
                message: "bank_size must be > 0".to_string(),
            });
        }
        if self.hidden_len == 0 {
            return Err(ContrastiveError::ConfigError {
                message: "hidden_len must be > 0".to_string(),
            });
        }
        if !self.mlm_weight.is_finite() {
            return Err(ContrastiveError::ConfigError {
                message: format!("mlm_weight must be finite, got {}", self.mlm_weight),
            });
        }
        if !self.hard_negative_weight.is_finite() {
            return Err(ContrastiveError::ConfigError {
                message: format!(
                    "hard_negative_weight must be finite, got {}",
                    self.hard_negative_weight
                ),
            });
        }
        if !(0.0..1.0).contains(&self.cutoff_rate) {
            return Err(ContrastiveError::ConfigError {
                message: format!("cutoff_rate must be in [0.0, 1.0), got {}", self.cutoff_rate),
            });
        }
        Ok(())
    }

    /// Whether the memory bank distillation term is added to the loss.
    pub fn uses_bank_loss(&self) -> bool {
        self.do_stronger || self.do_mlm
    }

    /// Apply environment variable overrides. Prefix: `SIMCSE_`
    ///
    /// | Variable | Field | Type |
    /// |----------|-------|------|
    /// | `SIMCSE_POOLER_TYPE` | `pooler_type` | PoolerType |
    /// | `SIMCSE_TEMP` | `temp` | f32 |
    /// | `SIMCSE_BANK_SIZE` | `bank_size` | usize |
    /// | `SIMCSE_HIDDEN_LEN` | `hidden_len` | usize |
    /// | `SIMCSE_DO_MLM` | `do_mlm` | bool |
    /// | `SIMCSE_DO_STRONGER` | `do_stronger` | bool |
    /// | `SIMCSE_MLM_WEIGHT` | `mlm_weight` | f32 |
    /// | `SIMCSE_CUTOFF_RATE` | `cutoff_rate` | f32 |
    /// | `SIMCSE_MLP_ONLY_TRAIN` | `mlp_only_train` | bool |
    /// | `SIMCSE_GENERATOR_NAME` | `generator_name` | String |
    ///
    /// # Errors
    /// - `ContrastiveError::UnsupportedPooler` for an unknown pooler name
    /// - `ContrastiveError::ConfigError` for any other unparsable value
    pub fn with_env_overrides(mut self) -> ContrastiveResult<Self> {
        if let Ok(val) = env::var("SIMCSE_POOLER_TYPE") {
            self.pooler_type = val.parse()?;
        }
        if let Some(v) = env_parse("SIMCSE_TEMP")? {
            self.temp = v;
        }
        if let Some(v) = env_parse("SIMCSE_BANK_SIZE")? {
            self.bank_size = v;
        }
        if let Some(v) = env_parse("SIMCSE_HIDDEN_LEN")? {
            self.hidden_len = v;
        }
        if let Some(v) = env_parse("SIMCSE_DO_MLM")? {
            self.do_mlm = v;
        }
        if let Some(v) = env_parse("SIMCSE_DO_STRONGER")? {
            self.do_stronger = v;
        }
        if let Some(v) = env_parse("SIMCSE_MLM_WEIGHT")? {
            self.mlm_weight = v;
        }
        if let Some(v) = env_parse("SIMCSE_CUTOFF_RATE")? {
            self.cutoff_rate = v;
        }
        if let Some(v) = env_parse("SIMCSE_MLP_ONLY_TRAIN")? {
            self.mlp_only_train = v;
        }
        if let Ok(val) = env::var("SIMCSE_GENERATOR_NAME") {
            self.generator_name = if val.is_empty() { None } else { Some(val) };
        }
        Ok(self)
    }
}

fn env_parse<T>(key: &str) -> ContrastiveResult<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map(Some)
            .map_err(|e| ContrastiveError::ConfigError {
                message: format!("{} has unparsable value '{}': {}", key, val, e),
            }),
        Err(_) => Ok(None),
    }
}
