// ============================================================
// Layer 3 — Parameter Report
// ============================================================
// Total vs trainable element counts for a model and its
// trainability side-table. Counts come from shapes only, so
// no tensor data is ever read back from the device.
//
// Example output:
//   5120 total params,
//   512 trainable params,
//   10.00% of all params are trainable.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::{traits::ParamInventory, trainability::Trainability};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamReport {
    pub total: usize,
    pub trainable: usize,
    /// 100 * trainable / total, or 0.0 for an empty model
    pub percent: f64,
}

impl ParamReport {
    pub fn new<M: ParamInventory + ?Sized>(model: &M, trainability: &Trainability) -> Self {
        let (total, trainable) = model
            .param_shapes()
            .iter()
            .fold((0usize, 0usize), |(total, trainable), p| {
                let n = p.numel();
                let t = if trainability.is_trainable(&p.name) { n } else { 0 };
                (total + n, trainable + t)
            });
        Self::from_counts(total, trainable)
    }

    pub fn from_counts(total: usize, trainable: usize) -> Self {
        let percent = if total == 0 {
            0.0
        } else {
            100.0 * trainable as f64 / total as f64
        };
        Self { total, trainable, percent }
    }
}

impl fmt::Display for ParamReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} total params,", self.total)?;
        writeln!(f, "{} trainable params,", self.trainable)?;
        write!(f, "{:.2}% of all params are trainable.", self.percent)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::domain::{traits::ParamShape, trainability::set_trainable_params};

    #[test]
    fn test_counts_and_percentage() {
        let model = vec![
            ParamShape::new("w", vec![10, 9]),
            ParamShape::new("a", vec![10]),
        ];
        let adapters: BTreeSet<String> = ["a".to_string()].into();
        let t = set_trainable_params(&model, &adapters).unwrap();
        let r = ParamReport::new(&model, &t);

        assert_eq!(r.total, 100);
        assert_eq!(r.trainable, 10);
        assert!((r.percent - 10.0).abs() < 1e-12);
        assert!(r.trainable <= r.total);
    }

    #[test]
    fn test_empty_model_reports_zero_percent() {
        let model: Vec<ParamShape> = Vec::new();
        let r = ParamReport::new(&model, &Trainability::default());
        assert_eq!(r, ParamReport { total: 0, trainable: 0, percent: 0.0 });
    }

    #[test]
    fn test_display_two_decimals() {
        let r = ParamReport::from_counts(3, 1);
        let text = r.to_string();
        assert!(text.contains("3 total params,"));
        assert!(text.contains("1 trainable params,"));
        assert!(text.ends_with("33.33% of all params are trainable."));
    }
}
