//! 置信度分档策略
//!
//! 三档：高 -> 静默接受；中 -> 确认（显式或隐式）；低 -> 丢弃并澄清。
//! 任意阈值下，每个置信度都恰好落入一档（NaN 归入低档）。

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

/// 中档置信度的确认方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationMode {
    #[default]
    Explicit,
    Implicit,
}

/// 置信度档位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceBand {
    High,
    Mid,
    Low,
}

/// grounding 动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroundingAction {
    Accept,
    Confirm(ConfirmationMode),
    Reject,
}

/// 阈值：confidence >= accept 为高档，confidence < reject 为低档
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub accept: f32,
    pub reject: f32,
    pub confirmation: ConfirmationMode,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            accept: 0.75,
            reject: 0.35,
            confirmation: ConfirmationMode::Explicit,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), String> {
        let in_range = |x: f32| (0.0..=1.0).contains(&x);
        if !in_range(self.accept) || !in_range(self.reject) {
            return Err(format!(
                "thresholds must lie in [0,1] (accept={}, reject={})",
                self.accept, self.reject
            ));
        }
        if self.reject > self.accept {
            return Err(format!(
                "reject threshold {} exceeds accept threshold {}",
                self.reject, self.accept
            ));
        }
        Ok(())
    }

    pub fn band(&self, confidence: f32) -> ConfidenceBand {
        if confidence.is_nan() {
            ConfidenceBand::Low
        } else if confidence >= self.accept {
            ConfidenceBand::High
        } else if confidence < self.reject {
            ConfidenceBand::Low
        } else {
            ConfidenceBand::Mid
        }
    }
}

/// 按概念或类型覆盖的阈值（字段缺省时沿用上一层）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GroundingOverride {
    #[serde(default)]
    pub accept_threshold: Option<f32>,
    #[serde(default)]
    pub reject_threshold: Option<f32>,
    #[serde(default)]
    pub confirmation: Option<ConfirmationMode>,
}

impl GroundingOverride {
    pub fn apply(&self, base: Thresholds) -> Thresholds {
        Thresholds {
            accept: self.accept_threshold.unwrap_or(base.accept),
            reject: self.reject_threshold.unwrap_or(base.reject),
            confirmation: self.confirmation.unwrap_or(base.confirmation),
        }
    }

    /// 单独校验覆盖值（与默认阈值合并后的顺序在实例化时再校验）
    pub fn validate(&self) -> Result<(), String> {
        for x in [self.accept_threshold, self.reject_threshold].into_iter().flatten() {
            if !(0.0..=1.0).contains(&x) {
                return Err(format!("threshold {} outside [0,1]", x));
            }
        }
        Ok(())
    }
}

/// 可插拔的分档策略（按概念类型或单个概念注册）
pub trait GroundingPolicy: Send + Sync + Debug {
    fn classify(&self, confidence: f32) -> GroundingAction;
}

/// 默认的三档阈值策略
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    thresholds: Thresholds,
}

impl ThresholdPolicy {
    pub fn new(thresholds: Thresholds) -> Result<Self, String> {
        thresholds.validate()?;
        Ok(Self { thresholds })
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }
}

impl GroundingPolicy for ThresholdPolicy {
    fn classify(&self, confidence: f32) -> GroundingAction {
        match self.thresholds.band(confidence) {
            ConfidenceBand::High => GroundingAction::Accept,
            ConfidenceBand::Mid => GroundingAction::Confirm(self.thresholds.confirmation),
            ConfidenceBand::Low => GroundingAction::Reject,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bands_with_defaults() {
        let t = Thresholds::default();
        assert_eq!(t.band(0.9), ConfidenceBand::High);
        assert_eq!(t.band(0.75), ConfidenceBand::High);
        assert_eq!(t.band(0.5), ConfidenceBand::Mid);
        assert_eq!(t.band(0.35), ConfidenceBand::Mid);
        assert_eq!(t.band(0.1), ConfidenceBand::Low);
        assert_eq!(t.band(f32::NAN), ConfidenceBand::Low);
    }

    #[test]
    fn test_mapping_is_total_for_any_thresholds() {
        let samples = [0.0f32, 0.1, 0.3, 0.35, 0.5, 0.7, 0.75, 0.99, 1.0, f32::NAN];
        for (accept, reject) in [(0.75, 0.35), (0.5, 0.5), (1.0, 0.0), (0.0, 0.0), (1.0, 1.0)] {
            let policy = ThresholdPolicy::new(Thresholds {
                accept,
                reject,
                confirmation: ConfirmationMode::Implicit,
            })
            .unwrap();
            for c in samples {
                // classify 返回恰好一个动作；检查它与分档一致
                let action = policy.classify(c);
                let band = policy.thresholds().band(c);
                let expected = match band {
                    ConfidenceBand::High => GroundingAction::Accept,
                    ConfidenceBand::Mid => GroundingAction::Confirm(ConfirmationMode::Implicit),
                    ConfidenceBand::Low => GroundingAction::Reject,
                };
                assert_eq!(action, expected, "accept={accept} reject={reject} c={c}");
            }
        }
    }

    #[test]
    fn test_invalid_thresholds() {
        assert!(Thresholds {
            accept: 0.3,
            reject: 0.6,
            confirmation: ConfirmationMode::Explicit
        }
        .validate()
        .is_err());
        assert!(Thresholds {
            accept: 1.3,
            reject: 0.2,
            confirmation: ConfirmationMode::Explicit
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_override_apply() {
        let o = GroundingOverride {
            accept_threshold: Some(0.9),
            reject_threshold: None,
            confirmation: Some(ConfirmationMode::Implicit),
        };
        let t = o.apply(Thresholds::default());
        assert_eq!(t.accept, 0.9);
        assert_eq!(t.reject, 0.35);
        assert_eq!(t.confirmation, ConfirmationMode::Implicit);
    }
}
