//! Model configuration for MobileNetV2.
//!
//! Serialised as JSON next to the weights. Every field has a default so a
//! minimal `{}` JSON produces the reference ImageNet network.

use candle_core::bail;
use serde::{Deserialize, Serialize};

/// Reference stage schedule: `[t, c, n, s]` = expansion ratio, output
/// channels, repeat count, stride of the first repeat.
pub const DEFAULT_INVERTED_RESIDUAL_SETTING: [[usize; 4]; 7] = [
    [1, 16, 1, 1],
    [6, 24, 2, 2],
    [6, 32, 3, 2],
    [6, 64, 4, 2],
    [6, 96, 3, 1],
    [6, 160, 3, 2],
    [6, 320, 1, 1],
];

/// One validated stage of the inverted-residual trunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvertedResidualSetting {
    /// `t`: hidden width = input width × t.
    pub expand_ratio: usize,
    /// `c`: output channels before width scaling.
    pub channels: usize,
    /// `n`: number of blocks in the stage.
    pub repeats: usize,
    /// `s`: stride of the first block; the rest use stride 1.
    pub stride: usize,
}

impl InvertedResidualSetting {
    /// Build from a raw `[t, c, n, s]` row. The row must hold exactly four values.
    pub fn from_row(row: &[usize]) -> candle_core::Result<Self> {
        let &[expand_ratio, channels, repeats, stride] = row else {
            bail!("inverted_residual_setting entry must have 4 elements [t, c, n, s], got {row:?}");
        };
        if expand_ratio == 0 || channels == 0 || repeats == 0 {
            bail!("inverted_residual_setting entry values must be positive, got {row:?}");
        }
        if stride != 1 && stride != 2 {
            bail!("inverted_residual_setting stride must be 1 or 2, got {row:?}");
        }
        Ok(Self {
            expand_ratio,
            channels,
            repeats,
            stride,
        })
    }
}

/// Numeric representation used between the two quantization boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Real-valued execution; the boundaries are identities.
    #[default]
    Float,
    /// Boundaries round tensors onto their calibrated uint8 grid.
    Quantized,
}

/// Hyper-parameters for the MobileNetV2 network.
///
/// Backwards-compatible: missing fields fall back to their
/// `#[serde(default)]` values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MobileNetV2Config {
    // ── Classifier ──────────────────────────────────────────────────────────
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Dropout probability in front of the final linear layer.
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    // ── Width / schedule ────────────────────────────────────────────────────
    /// Multiplier applied to every channel count.
    #[serde(default = "default_width_mult")]
    pub width_mult: f64,
    /// Raw `[t, c, n, s]` rows. `None` selects
    /// [`DEFAULT_INVERTED_RESIDUAL_SETTING`]. Kept as nested vectors so
    /// malformed rows survive deserialisation and are reported by
    /// [`MobileNetV2Config::stages`].
    #[serde(default)]
    pub inverted_residual_setting: Option<Vec<Vec<usize>>>,
    /// Channel counts are rounded to a multiple of this.
    #[serde(default = "default_round_nearest")]
    pub round_nearest: usize,
    /// Stem width before scaling.
    #[serde(default = "default_input_channel")]
    pub input_channel: usize,
    /// Head width before scaling (never scaled below 1.0).
    #[serde(default = "default_last_channel")]
    pub last_channel: usize,

    // ── Normalisation ───────────────────────────────────────────────────────
    #[serde(default = "default_bn_momentum")]
    pub bn_momentum: f64,
    #[serde(default = "default_bn_eps")]
    pub bn_eps: f64,

    // ── Quantization ────────────────────────────────────────────────────────
    #[serde(default)]
    pub execution: ExecutionMode,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_num_classes() -> usize {
    1000
}
fn default_dropout() -> f32 {
    0.2
}
fn default_width_mult() -> f64 {
    1.0
}
fn default_round_nearest() -> usize {
    8
}
fn default_input_channel() -> usize {
    32
}
fn default_last_channel() -> usize {
    1280
}
fn default_bn_momentum() -> f64 {
    0.1
}
fn default_bn_eps() -> f64 {
    1e-5
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for MobileNetV2Config {
    fn default() -> Self {
        Self {
            num_classes: default_num_classes(),
            dropout: default_dropout(),
            width_mult: default_width_mult(),
            inverted_residual_setting: None,
            round_nearest: default_round_nearest(),
            input_channel: default_input_channel(),
            last_channel: default_last_channel(),
            bn_momentum: default_bn_momentum(),
            bn_eps: default_bn_eps(),
            execution: ExecutionMode::Float,
        }
    }
}

impl MobileNetV2Config {
    /// Check the scalar hyper-parameters and the stage schedule.
    pub fn validate(&self) -> candle_core::Result<()> {
        if self.num_classes == 0 {
            bail!("num_classes must be positive");
        }
        if !(self.width_mult > 0.0 && self.width_mult.is_finite()) {
            bail!("width_mult must be a positive finite number, got {}", self.width_mult);
        }
        if self.round_nearest == 0 {
            bail!("round_nearest must be positive");
        }
        if !(0.0..1.0).contains(&self.dropout) {
            bail!("dropout must be in [0, 1), got {}", self.dropout);
        }
        self.stages().map(|_| ())
    }

    /// Validated stage schedule.
    ///
    /// Fails when the schedule is empty or any row does not hold exactly
    /// four positive values; the message carries the offending value.
    pub fn stages(&self) -> candle_core::Result<Vec<InvertedResidualSetting>> {
        let rows: Vec<Vec<usize>> = match &self.inverted_residual_setting {
            Some(rows) => rows.clone(),
            None => DEFAULT_INVERTED_RESIDUAL_SETTING
                .iter()
                .map(|row| row.to_vec())
                .collect(),
        };
        if rows.is_empty() || rows.iter().any(|row| row.len() != 4) {
            bail!(
                "inverted_residual_setting should be non-empty and every entry a 4-element list, got {rows:?}"
            );
        }
        rows.iter()
            .map(|row| InvertedResidualSetting::from_row(row))
            .collect()
    }

    /// Total number of inverted-residual blocks in the trunk.
    pub fn num_blocks(&self) -> candle_core::Result<usize> {
        Ok(self.stages()?.iter().map(|s| s.repeats).sum())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
