//! Weighted random target selection.

use super::keys::Target;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of uniform draws in `[0, 1)`.
pub trait RandomSource: Send + Sync {
    /// Next uniform draw in `[0, 1)`.
    fn next_f64(&self) -> f64;
}

/// Thread-local entropy; the default source.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Deterministic source for reproducible selection.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    /// Source seeded with `seed`.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&self) -> f64 {
        self.rng.lock().random::<f64>()
    }
}

fn effective_weight(target: &Target) -> f64 {
    if target.weight.is_finite() && target.weight > 0.0 {
        target.weight
    } else {
        0.0
    }
}

/// Picks one of `targets` with probability proportional to its weight.
///
/// `targets` should be in a stable order (by node name) for draws to be
/// reproducible. Non-finite and negative weights count as 0; if every weight
/// is 0 the pick is uniform. Returns `None` for an empty slice.
#[must_use]
pub fn pick<'t>(targets: &'t [Target], random: &dyn RandomSource) -> Option<&'t Target> {
    if targets.is_empty() {
        return None;
    }

    let cumulative: Vec<f64> = targets
        .iter()
        .scan(0.0, |sum, target| {
            *sum += effective_weight(target);
            Some(*sum)
        })
        .collect();
    let total = cumulative.last().copied().unwrap_or(0.0);

    let draw = random.next_f64().clamp(0.0, 1.0);
    if total <= 0.0 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let index = ((draw * targets.len() as f64) as usize).min(targets.len() - 1);
        return targets.get(index);
    }

    let point = draw * total;
    let index = cumulative
        .partition_point(|sum| *sum <= point)
        .min(targets.len() - 1);
    targets.get(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str, weight: f64) -> Target {
        Target {
            node_name: name.to_string(),
            host: format!("{name}:1"),
            schema_hash: "h".to_string(),
            weight,
        }
    }

    struct Fixed(f64);

    impl RandomSource for Fixed {
        fn next_f64(&self) -> f64 {
            self.0
        }
    }

    #[test]
    fn test_empty_picks_nothing() {
        assert!(pick(&[], &ThreadRandom).is_none());
    }

    #[test]
    fn test_draw_maps_to_cumulative_weight() {
        let targets = [target("a", 1.0), target("b", 3.0)];
        assert_eq!(pick(&targets, &Fixed(0.0)).map(|t| t.node_name.as_str()), Some("a"));
        assert_eq!(pick(&targets, &Fixed(0.24)).map(|t| t.node_name.as_str()), Some("a"));
        assert_eq!(pick(&targets, &Fixed(0.25)).map(|t| t.node_name.as_str()), Some("b"));
        assert_eq!(pick(&targets, &Fixed(0.99)).map(|t| t.node_name.as_str()), Some("b"));
    }

    #[test]
    fn test_zero_weight_is_never_picked() {
        let targets = [target("a", 0.0), target("b", f64::NAN), target("c", 1.0)];
        for draw in [0.0, 0.5, 0.999] {
            assert_eq!(pick(&targets, &Fixed(draw)).map(|t| t.node_name.as_str()), Some("c"));
        }
    }

    #[test]
    fn test_all_zero_falls_back_to_uniform() {
        let targets = [target("a", 0.0), target("b", -1.0)];
        assert_eq!(pick(&targets, &Fixed(0.1)).map(|t| t.node_name.as_str()), Some("a"));
        assert_eq!(pick(&targets, &Fixed(0.9)).map(|t| t.node_name.as_str()), Some("b"));
    }

    #[test]
    fn test_weights_one_to_three() {
        let targets = [target("a", 1.0), target("b", 3.0)];
        let random = SeededRandom::new(7);
        let draws = 20_000;
        let b = (0..draws)
            .filter(|_| pick(&targets, &random).is_some_and(|t| t.node_name == "b"))
            .count();
        let a = draws - b;
        #[allow(clippy::cast_precision_loss)]
        let ratio = b as f64 / a as f64;
        assert!((2.7..3.3).contains(&ratio), "ratio {ratio}");
    }
}
