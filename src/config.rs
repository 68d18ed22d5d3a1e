/// Adapter configuration surface
///
/// One [`AdapterConfig`] describes a single named adapter: which nodes it
/// targets, which algebra it uses, and (for the SVD algebra) the rank
/// budget schedule driving the allocator.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Numeric strategy of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algebra {
    /// Fixed-rank low-rank update: two dense factors A and B.
    LowRank,
    /// SVD-structured low-rank update with a pruneable per-direction
    /// magnitude vector E between the factors.
    Svd,
    /// Per-channel multiplicative scaling (IA3-style).
    Scaling,
}

/// Budget schedule for the rank allocator.
///
/// Steps are absolute global step counts: warmup runs on `[0, tinit)`,
/// tuning on `[tinit, tfinal]`, and the frozen mask is re-applied after
/// `tfinal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankSchedule {
    /// Step at which budget tuning begins.
    pub tinit: usize,
    /// Step at which the budget is finalized and the mask frozen.
    pub tfinal: usize,
    /// Total number of training steps, for bookkeeping and validation.
    pub total_step: usize,
    /// EMA coefficient for the sensitivity estimate.
    pub beta1: f64,
    /// EMA coefficient for the uncertainty estimate.
    pub beta2: f64,
    /// Global budget applied during warmup.
    pub init_budget: usize,
    /// Global budget in force at and after `tfinal`.
    pub final_budget: usize,
}

impl RankSchedule {
    pub fn validate(&self) -> Result<()> {
        if self.tinit >= self.tfinal {
            return Err(Error::Config(format!(
                "rank schedule requires tinit < tfinal, got tinit={} tfinal={}",
                self.tinit, self.tfinal
            )));
        }
        if self.tfinal > self.total_step {
            return Err(Error::Config(format!(
                "rank schedule requires tfinal <= total_step, got tfinal={} total_step={}",
                self.tfinal, self.total_step
            )));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(Error::Config(format!(
                    "rank schedule {name} must lie in [0, 1), got {beta}"
                )));
            }
        }
        if self.final_budget > self.init_budget {
            return Err(Error::Config(format!(
                "final_budget ({}) must not exceed init_budget ({})",
                self.final_budget, self.init_budget
            )));
        }
        Ok(())
    }

    /// Target budget for `step` via cubic interpolation between
    /// `init_budget` and `final_budget`.
    pub fn budget_at(&self, step: usize) -> usize {
        if step < self.tinit {
            self.init_budget
        } else if step >= self.tfinal {
            self.final_budget
        } else {
            let span = (self.tfinal - self.tinit) as f64;
            let progress = (step - self.tinit) as f64 / span;
            let coeff = (1.0 - progress).powi(3);
            let spread = (self.init_budget - self.final_budget) as f64;
            self.final_budget + (spread * coeff) as usize
        }
    }
}

/// Configuration of one named adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Which adapter algebra the units attached under this name use.
    pub algebra: Algebra,
    /// Target node patterns: exact dotted paths or trailing-segment
    /// suffixes (e.g. `"q_proj"` matches `encoder.0.attn.q_proj`).
    pub target_modules: Vec<String>,
    /// Scaling-algebra only: targets whose scale applies on the input
    /// side (feed-forward nodes) rather than the output side.
    pub feedforward_modules: Vec<String>,
    /// Rank of the low-rank factors. For the SVD algebra this is the
    /// initial (maximum) rank; pruning never resizes below it in storage.
    pub rank: usize,
    /// Scaling numerator; effective scale is `alpha / rank`.
    pub alpha: f32,
    /// Dropout probability applied to the adapter branch input while
    /// training.
    pub dropout: f32,
    /// Set when target weights are stored [IN, OUT] (Conv1D-style).
    pub fan_in_fan_out: bool,
    /// Inference-only adapters are frozen and excluded from the
    /// one-trainable-adapter budget bookkeeping.
    pub inference_mode: bool,
    /// Initialize factors so the adapter starts as an exact no-op.
    pub init_weights: bool,
    /// Weight of the orthogonality regularizer (SVD algebra).
    pub orth_reg_weight: f32,
    /// Budget schedule; required for the SVD algebra when trainable.
    pub schedule: Option<RankSchedule>,
}

impl AdapterConfig {
    pub fn low_rank(target_modules: Vec<String>, rank: usize, alpha: f32) -> Self {
        Self {
            algebra: Algebra::LowRank,
            target_modules,
            feedforward_modules: Vec::new(),
            rank,
            alpha,
            dropout: 0.0,
            fan_in_fan_out: false,
            inference_mode: false,
            init_weights: true,
            orth_reg_weight: 0.0,
            schedule: None,
        }
    }

    pub fn svd(target_modules: Vec<String>, init_rank: usize, alpha: f32, schedule: RankSchedule) -> Self {
        Self {
            algebra: Algebra::Svd,
            target_modules,
            feedforward_modules: Vec::new(),
            rank: init_rank,
            alpha,
            dropout: 0.0,
            fan_in_fan_out: false,
            inference_mode: false,
            init_weights: true,
            orth_reg_weight: 0.5,
            schedule: Some(schedule),
        }
    }

    pub fn scaling(target_modules: Vec<String>, feedforward_modules: Vec<String>) -> Self {
        Self {
            algebra: Algebra::Scaling,
            target_modules,
            feedforward_modules,
            rank: 0,
            alpha: 0.0,
            dropout: 0.0,
            fan_in_fan_out: false,
            inference_mode: false,
            init_weights: true,
            orth_reg_weight: 0.0,
            schedule: None,
        }
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_fan_in_fan_out(mut self, fan_in_fan_out: bool) -> Self {
        self.fan_in_fan_out = fan_in_fan_out;
        self
    }

    pub fn inference(mut self) -> Self {
        self.inference_mode = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_modules.is_empty() {
            return Err(Error::Config(
                "target_modules must name at least one pattern".into(),
            ));
        }
        if self.algebra != Algebra::Scaling && self.rank == 0 {
            return Err(Error::Config(format!(
                "{:?} algebra requires rank > 0",
                self.algebra
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config(format!(
                "dropout must lie in [0, 1), got {}",
                self.dropout
            )));
        }
        if let Some(schedule) = &self.schedule {
            if self.algebra != Algebra::Svd {
                return Err(Error::Config(
                    "a rank schedule is only meaningful for the Svd algebra".into(),
                ));
            }
            schedule.validate()?;
        }
        Ok(())
    }

    /// Effective scaling factor of the low-rank contribution.
    pub fn scaling_factor(&self) -> f32 {
        if self.rank == 0 {
            0.0
        } else {
            self.alpha / self.rank as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> RankSchedule {
        RankSchedule {
            tinit: 10,
            tfinal: 100,
            total_step: 200,
            beta1: 0.85,
            beta2: 0.85,
            init_budget: 64,
            final_budget: 16,
        }
    }

    #[test]
    fn test_budget_boundaries() {
        let s = schedule();
        assert_eq!(s.budget_at(0), 64);
        assert_eq!(s.budget_at(9), 64);
        assert_eq!(s.budget_at(100), 16);
        assert_eq!(s.budget_at(150), 16);
    }

    #[test]
    fn test_budget_monotone_during_tuning() {
        let s = schedule();
        let mut prev = s.budget_at(s.tinit);
        for step in s.tinit..=s.tfinal {
            let b = s.budget_at(step);
            assert!(b <= prev, "budget increased at step {step}");
            assert!(b >= s.final_budget && b <= s.init_budget);
            prev = b;
        }
    }

    #[test]
    fn test_schedule_validation() {
        let mut s = schedule();
        s.tinit = 100;
        assert!(s.validate().is_err());

        let mut s = schedule();
        s.beta1 = 1.5;
        assert!(s.validate().is_err());

        let mut s = schedule();
        s.final_budget = 128;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_config_validation() {
        let cfg = AdapterConfig::low_rank(vec![], 8, 8.0);
        assert!(cfg.validate().is_err());

        let cfg = AdapterConfig::low_rank(vec!["q_proj".into()], 0, 8.0);
        assert!(cfg.validate().is_err());

        let cfg = AdapterConfig::low_rank(vec!["q_proj".into()], 8, 8.0);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.scaling_factor(), 1.0);
    }
}
