//! Pacing controller for even-delivery ad units.
//!
//! A unit is paused while it delivers faster than the rate that would exhaust
//! its goal exactly at its end date, and resumed otherwise. Evaluated fresh on
//! every cycle; `resume_ratio` below 1.0 adds a resume band against flapping.

use adserve_core::config::{CountersConfig, ReconcileConfig};
use adserve_core::{AdUnit, Delivery, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PacingPolicy {
    /// Trailing window the current run rate is measured over.
    pub window_hours: u32,
    /// Units ending further out than this are not paced.
    pub horizon_years: u32,
    /// A paused unit resumes once `current <= required * resume_ratio`.
    pub resume_ratio: f64,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            window_hours: 24,
            horizon_years: 5,
            resume_ratio: 1.0,
        }
    }
}

impl PacingPolicy {
    pub fn from_config(counters: &CountersConfig, reconcile: &ReconcileConfig) -> Self {
        Self {
            window_hours: counters.window_hours.max(1),
            horizon_years: reconcile.pacing_horizon_years,
            resume_ratio: reconcile.resume_ratio.clamp(0.0, 1.0),
        }
    }

    fn horizon_hours(&self) -> f64 {
        f64::from(self.horizon_years) * 365.0 * 24.0
    }
}

/// Why a unit's `paused` flag is left as it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldReason {
    NotEvenDelivery,
    GoalReached,
    NotActive,
    NoEndDate,
    /// Past its end date.
    Ended,
    /// End date beyond the pacing horizon.
    BeyondHorizon,
    /// Paused, and not yet slow enough to resume.
    ResumeBand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacingDecision {
    Pause,
    Resume,
    Hold(HoldReason),
}

impl PacingDecision {
    /// The `paused` flag after applying this decision to `current`.
    pub fn apply(&self, current: bool) -> bool {
        match self {
            Self::Pause => true,
            Self::Resume => false,
            Self::Hold(_) => current,
        }
    }
}

/// Per-hour rates behind a decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunRates {
    pub remaining_hours: f64,
    /// `(goal_views - clicks) / remaining_hours`
    pub required: f64,
    /// `trailing_clicks / window_hours`
    pub current: f64,
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Rates for `unit`, or the reason it is outside pacing altogether.
pub fn run_rates(
    unit: &AdUnit,
    trailing_clicks: u64,
    now: DateTime<Utc>,
    policy: &PacingPolicy,
) -> Result<RunRates, HoldReason> {
    if unit.delivery != Delivery::Even {
        return Err(HoldReason::NotEvenDelivery);
    }
    if unit.goal_reached {
        return Err(HoldReason::GoalReached);
    }
    if unit.status != Status::Active {
        return Err(HoldReason::NotActive);
    }
    let end_date = unit.end_date.ok_or(HoldReason::NoEndDate)?;

    let remaining_hours = (end_date - now).num_seconds() as f64 / 3600.0;
    if remaining_hours <= 0.0 {
        return Err(HoldReason::Ended);
    }
    if remaining_hours > policy.horizon_hours() {
        return Err(HoldReason::BeyondHorizon);
    }

    let remaining_views = unit.goal_views as f64 - unit.clicks as f64;
    Ok(RunRates {
        remaining_hours,
        required: remaining_views / remaining_hours,
        current: trailing_clicks as f64 / f64::from(policy.window_hours.max(1)),
    })
}

/// Decide whether `unit` should be paused, resumed or left alone.
pub fn decide(
    unit: &AdUnit,
    trailing_clicks: u64,
    now: DateTime<Utc>,
    policy: &PacingPolicy,
) -> PacingDecision {
    let rates = match run_rates(unit, trailing_clicks, now, policy) {
        Ok(rates) => rates,
        Err(reason) => return PacingDecision::Hold(reason),
    };

    if rates.required >= 1.0 && rates.current > rates.required {
        return PacingDecision::Pause;
    }
    if unit.paused
        && rates.required >= 1.0
        && rates.current > rates.required * policy.resume_ratio
    {
        return PacingDecision::Hold(HoldReason::ResumeBand);
    }
    PacingDecision::Resume
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn even_unit(goal_views: u64, clicks: u64, hours_left: i64) -> AdUnit {
        let mut unit = AdUnit::new("ad-1", "c1");
        unit.status = Status::Active;
        unit.delivery = Delivery::Even;
        unit.goal_views = goal_views;
        unit.clicks = clicks;
        unit.end_date = Some(now() + Duration::hours(hours_left));
        unit
    }

    #[test]
    fn test_equal_rates_do_not_pause() {
        let unit = even_unit(10, 0, 10);
        let rates = run_rates(&unit, 24, now(), &PacingPolicy::default()).unwrap();
        assert!((rates.required - 1.0).abs() < f64::EPSILON);
        assert!((rates.current - 1.0).abs() < f64::EPSILON);
        assert_eq!(decide(&unit, 24, now(), &PacingPolicy::default()), PacingDecision::Resume);
    }

    #[test]
    fn test_pause_only_when_strictly_faster() {
        let unit = even_unit(10, 0, 5);
        let policy = PacingPolicy::default();
        assert_eq!(decide(&unit, 48, now(), &policy), PacingDecision::Resume);
        assert_eq!(decide(&unit, 72, now(), &policy), PacingDecision::Pause);
    }

    #[test]
    fn test_low_required_rate_never_pauses() {
        // 5 views over 10 hours: 0.5/h required.
        let unit = even_unit(5, 0, 10);
        assert_eq!(
            decide(&unit, 240, now(), &PacingPolicy::default()),
            PacingDecision::Resume
        );
    }

    #[test]
    fn test_zero_goal_resumes() {
        let unit = even_unit(0, 0, 10);
        assert_eq!(
            decide(&unit, 500, now(), &PacingPolicy::default()),
            PacingDecision::Resume
        );
    }

    #[test]
    fn test_out_of_scope_units_are_held() {
        let policy = PacingPolicy::default();

        let mut unit = even_unit(10, 0, 5);
        unit.delivery = Delivery::Unconstrained;
        assert_eq!(
            decide(&unit, 72, now(), &policy),
            PacingDecision::Hold(HoldReason::NotEvenDelivery)
        );

        let mut unit = even_unit(10, 0, 5);
        unit.goal_reached = true;
        unit.paused = true;
        let decision = decide(&unit, 0, now(), &policy);
        assert_eq!(decision, PacingDecision::Hold(HoldReason::GoalReached));
        assert!(decision.apply(unit.paused));

        let mut unit = even_unit(10, 0, 5);
        unit.status = Status::Inactive;
        assert_eq!(
            decide(&unit, 72, now(), &policy),
            PacingDecision::Hold(HoldReason::NotActive)
        );

        let mut unit = even_unit(10, 0, 5);
        unit.end_date = None;
        assert_eq!(
            decide(&unit, 72, now(), &policy),
            PacingDecision::Hold(HoldReason::NoEndDate)
        );
    }

    #[test]
    fn test_ended_and_far_future_units_are_held() {
        let policy = PacingPolicy::default();
        assert_eq!(
            decide(&even_unit(10, 0, 0), 72, now(), &policy),
            PacingDecision::Hold(HoldReason::Ended)
        );
        assert_eq!(
            decide(&even_unit(10, 0, -3), 72, now(), &policy),
            PacingDecision::Hold(HoldReason::Ended)
        );
        assert_eq!(
            decide(&even_unit(1_000_000, 0, 24 * 365 * 6), 72, now(), &policy),
            PacingDecision::Hold(HoldReason::BeyondHorizon)
        );
    }

    #[test]
    fn test_resume_band_holds_paused_unit() {
        let policy = PacingPolicy {
            resume_ratio: 0.5,
            ..Default::default()
        };
        // Required 2.0/h; resume only at or below 1.0/h.
        let mut unit = even_unit(10, 0, 5);
        unit.paused = true;

        assert_eq!(
            decide(&unit, 36, now(), &policy),
            PacingDecision::Hold(HoldReason::ResumeBand)
        );
        assert_eq!(decide(&unit, 24, now(), &policy), PacingDecision::Resume);
        assert_eq!(decide(&unit, 72, now(), &policy), PacingDecision::Pause);

        // An unpaused unit in the band stays unpaused.
        unit.paused = false;
        assert_eq!(decide(&unit, 36, now(), &policy), PacingDecision::Resume);
    }

    #[test]
    fn test_policy_from_config() {
        let counters = CountersConfig {
            window_hours: 12,
            ..Default::default()
        };
        let reconcile = ReconcileConfig {
            resume_ratio: 1.7,
            ..Default::default()
        };
        let policy = PacingPolicy::from_config(&counters, &reconcile);
        assert_eq!(policy.window_hours, 12);
        assert_eq!(policy.horizon_years, 5);
        assert!((policy.resume_ratio - 1.0).abs() < f64::EPSILON);
    }
}
