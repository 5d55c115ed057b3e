//! Stage-based ramp profile.
//!
//! A run is described by an ordered list of [`Stage`]s. Each stage ramps the
//! number of virtual users linearly from the previous stage's target (zero for
//! the first stage) to its own target over its duration:
//!
//! ```text
//! t = (elapsed - stage_start) / stage_duration
//! vus(t) = previous_target + (stage_target - previous_target) * t
//! ```
//!
//! The curve is a pure function of elapsed time, so evaluating it twice at the
//! same instant always yields the same target.

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::utils::parse_duration_string;

/// A time-bounded segment of the run with a target VU count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub duration: Duration,
    pub target: u32,
}

impl Stage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }

    /// Parses a single `duration:target` pair such as `2m:20`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (duration_str, target_str) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("Stage '{}' is not in the format 'duration:target'", s.trim()))?;

        let duration = parse_duration_string(duration_str)?;
        let target = target_str
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("Invalid stage target '{}': {}", target_str.trim(), e))?;

        Ok(Self { duration, target })
    }

    /// Parses a comma-separated stage list such as `30s:5,2m:20,2m:50,30s:0`.
    pub fn parse_list(s: &str) -> Result<Vec<Self>, String> {
        let stages = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Stage::parse)
            .collect::<Result<Vec<_>, _>>()?;

        if stages.is_empty() {
            return Err("At least one stage is required".to_string());
        }
        Ok(stages)
    }
}

/// The default ramp: warm up, steady, ramp, cool down.
pub fn default_stages() -> Vec<Stage> {
    vec![
        Stage::new(Duration::from_secs(30), 5),
        Stage::new(Duration::from_secs(120), 20),
        Stage::new(Duration::from_secs(120), 50),
        Stage::new(Duration::from_secs(30), 0),
    ]
}

/// Immutable piecewise-linear target-VU curve built from a stage list.
#[derive(Debug, Clone)]
pub struct StageProfile {
    stages: Vec<Stage>,
    total: Duration,
}

impl StageProfile {
    pub fn new(stages: Vec<Stage>) -> Self {
        let total = stages
            .iter()
            .fold(Duration::ZERO, |total, s| total.saturating_add(s.duration));
        Self { stages, total }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Sum of all stage durations; the scheduled part of the run.
    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Index of the stage containing `elapsed`, or None once the profile is over.
    ///
    /// A stage's end boundary belongs to that stage.
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        let mut stage_end = Duration::ZERO;
        for (index, stage) in self.stages.iter().enumerate() {
            stage_end = stage_end.saturating_add(stage.duration);
            if elapsed <= stage_end && !stage.duration.is_zero() {
                return Some(index);
            }
        }
        None
    }

    /// Fractional target VU count at `elapsed`.
    pub fn target_at(&self, elapsed: Duration) -> f64 {
        let mut previous = 0.0;
        let mut stage_start = Duration::ZERO;

        for stage in &self.stages {
            let target = stage.target as f64;

            // Zero-length stages jump instantly to their target
            if stage.duration.is_zero() {
                previous = target;
                continue;
            }

            let stage_end = stage_start.saturating_add(stage.duration);
            if elapsed <= stage_end {
                let into_stage = elapsed.saturating_sub(stage_start).as_secs_f64();
                let t = into_stage / stage.duration.as_secs_f64();
                return Self::linear_interpolate(previous, target, t);
            }

            previous = target;
            stage_start = stage_end;
        }

        0.0
    }

    /// Target VU count at `elapsed`, rounded to the nearest whole VU.
    pub fn target_vus_at(&self, elapsed: Duration) -> usize {
        self.target_at(elapsed).round() as usize
    }

    /// Highest target across all stages.
    pub fn peak_target(&self) -> u32 {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    fn linear_interpolate(from: f64, to: f64, t: f64) -> f64 {
        from + (to - from) * t.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn profile() -> StageProfile {
        StageProfile::new(vec![
            Stage::new(secs(10), 10),
            Stage::new(secs(20), 30),
            Stage::new(secs(10), 0),
        ])
    }

    #[test]
    fn starts_at_zero() {
        assert_eq!(profile().target_at(Duration::ZERO), 0.0);
    }

    #[test]
    fn interpolates_within_first_stage() {
        let p = profile();
        assert!((p.target_at(secs(5)) - 5.0).abs() < 1e-9);
        assert!((p.target_at(Duration::from_millis(2500)) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn equals_stage_target_at_boundaries() {
        let p = profile();
        assert_eq!(p.target_at(secs(10)), 10.0);
        assert_eq!(p.target_at(secs(30)), 30.0);
        assert_eq!(p.target_at(secs(40)), 0.0);
    }

    #[test]
    fn interpolates_from_previous_target() {
        let p = profile();
        // halfway through 10 -> 30
        assert!((p.target_at(secs(20)) - 20.0).abs() < 1e-9);
        // halfway through 30 -> 0
        assert!((p.target_at(secs(35)) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn zero_after_profile_ends() {
        let p = StageProfile::new(vec![Stage::new(secs(10), 10)]);
        assert_eq!(p.target_at(secs(10)), 10.0);
        assert_eq!(p.target_at(secs(11)), 0.0);
        assert_eq!(p.target_vus_at(secs(3600)), 0);
    }

    #[test]
    fn is_deterministic_and_monotonic_within_a_ramp() {
        let p = profile();
        let mut last = -1.0;
        for ms in (0..=10_000).step_by(250) {
            let elapsed = Duration::from_millis(ms);
            let a = p.target_at(elapsed);
            assert_eq!(a, p.target_at(elapsed));
            assert!(a >= last, "target decreased at {}ms", ms);
            last = a;
        }
    }

    #[test]
    fn zero_duration_stage_jumps() {
        let p = StageProfile::new(vec![Stage::new(Duration::ZERO, 8), Stage::new(secs(10), 8)]);
        assert_eq!(p.target_at(Duration::ZERO), 8.0);
        assert_eq!(p.target_at(secs(5)), 8.0);
        assert_eq!(p.stage_index_at(secs(5)), Some(1));
    }

    #[test]
    fn stage_index_and_total() {
        let p = profile();
        assert_eq!(p.total_duration(), secs(40));
        assert_eq!(p.stage_index_at(secs(0)), Some(0));
        assert_eq!(p.stage_index_at(secs(10)), Some(0));
        assert_eq!(p.stage_index_at(secs(11)), Some(1));
        assert_eq!(p.stage_index_at(secs(39)), Some(2));
        assert_eq!(p.stage_index_at(secs(41)), None);
        assert_eq!(p.peak_target(), 30);
    }

    #[test]
    fn rounds_to_whole_vus() {
        let p = StageProfile::new(vec![Stage::new(secs(10), 3)]);
        assert_eq!(p.target_vus_at(secs(1)), 0); // 0.3
        assert_eq!(p.target_vus_at(secs(2)), 1); // 0.6
        assert_eq!(p.target_vus_at(secs(10)), 3);
    }

    #[test]
    fn parses_stage_lists() {
        let stages = Stage::parse_list("30s:5, 2m:20,500ms:0").unwrap();
        assert_eq!(
            stages,
            vec![
                Stage::new(secs(30), 5),
                Stage::new(secs(120), 20),
                Stage::new(Duration::from_millis(500), 0),
            ]
        );
    }

    #[test]
    fn rejects_malformed_stages() {
        assert!(Stage::parse("30s").is_err());
        assert!(Stage::parse("30s:-1").is_err());
        assert!(Stage::parse("abc:3").is_err());
        assert!(Stage::parse_list(" , ").is_err());
    }

    #[test]
    fn enormous_stages_saturate_instead_of_overflowing() {
        let huge = Duration::from_secs(u64::MAX);
        let p = StageProfile::new(vec![Stage::new(huge, 2), Stage::new(huge, 4)]);
        assert_eq!(p.total_duration(), Duration::MAX);
        assert_eq!(p.stage_index_at(secs(5)), Some(0));
        assert_eq!(p.target_vus_at(secs(5)), 0);
    }

    #[test]
    fn default_profile_matches_ramp() {
        let p = StageProfile::new(default_stages());
        assert_eq!(p.total_duration(), secs(300));
        assert_eq!(p.peak_target(), 50);
    }
}
