//! Reconciliation loop.
//!
//! Each cycle runs four phases in order: ingest from the campaign API,
//! counter merge, goal sweep and pacing sweep. A refresh between phases makes
//! one phase's writes visible to the next. Unit writes inside a phase run
//! concurrently and fail independently; a failed phase never stops the
//! phases after it.

use crate::upstream::UpstreamSource;
use adserve_analytics::{fetch_snapshot, CounterSource};
use adserve_core::config::AppConfig;
use adserve_core::types::{fields, goal_reached};
use adserve_core::{AdUnit, CounterSnapshot, DeliveryError, DeliveryResult, Status};
use adserve_index::AdIndex;
use adserve_pacing::{decide, PacingDecision, PacingPolicy};
use adserve_targeting::TargetingEngine;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    Written,
    Deleted,
    /// Nothing to change, or the unit vanished meanwhile.
    Skipped,
    Failed,
}

/// Counts for one phase of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub examined: usize,
    pub written: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub errors: usize,
    /// Set when the phase could not run at all.
    pub failure: Option<String>,
}

impl PhaseReport {
    fn failed(err: &DeliveryError) -> Self {
        Self {
            failure: Some(err.to_string()),
            ..Default::default()
        }
    }

    fn tally(&mut self, outcomes: &[WriteOutcome]) {
        self.examined += outcomes.len();
        for outcome in outcomes {
            match outcome {
                WriteOutcome::Written => self.written += 1,
                WriteOutcome::Deleted => self.deleted += 1,
                WriteOutcome::Skipped => self.skipped += 1,
                WriteOutcome::Failed => self.errors += 1,
            }
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub ingest: PhaseReport,
    pub counters: PhaseReport,
    pub goals: PhaseReport,
    pub pacing: PhaseReport,
    pub paused: usize,
    pub resumed: usize,
}

impl CycleReport {
    fn phases(&self) -> [&PhaseReport; 4] {
        [&self.ingest, &self.counters, &self.goals, &self.pacing]
    }

    pub fn failed_phases(&self) -> usize {
        self.phases().iter().filter(|p| p.is_failed()).count()
    }

    pub fn write_errors(&self) -> usize {
        self.phases().iter().map(|p| p.errors).sum()
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub interval: Duration,
    pub write_concurrency: usize,
    pub policy: PacingPolicy,
}

impl ReconcilerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.reconcile.interval_secs.max(1)),
            write_concurrency: config.reconcile.write_concurrency.max(1),
            policy: PacingPolicy::from_config(&config.counters, &config.reconcile),
        }
    }
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

pub struct Reconciler {
    engine: Arc<TargetingEngine>,
    upstream: Arc<dyn UpstreamSource>,
    counters: Arc<dyn CounterSource>,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        engine: Arc<TargetingEngine>,
        upstream: Arc<dyn UpstreamSource>,
        counters: Arc<dyn CounterSource>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            engine,
            upstream,
            counters,
            settings,
        }
    }

    fn index(&self) -> &Arc<dyn AdIndex> {
        self.engine.index()
    }

    /// Run cycles forever, one per interval. The first runs immediately.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = self.settings.interval.as_secs(),
                "Reconciliation loop started"
            );
            loop {
                interval.tick().await;
                self.run_cycle().await;
            }
        })
    }

    pub async fn run_cycle(&self) -> CycleReport {
        let now = Utc::now();
        let mut report = CycleReport::default();

        report.ingest = self.ingest(now).await;
        self.barrier().await;

        let snapshot = match fetch_snapshot(
            self.counters.as_ref(),
            self.settings.policy.window_hours,
        )
        .await
        {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                error!(error = %e, "Counter fetch failed");
                report.counters = PhaseReport::failed(&e);
                None
            }
        };

        if let Some(snapshot) = &snapshot {
            report.counters = self.merge_counters(snapshot).await;
            self.barrier().await;
        }

        report.goals = self.sweep_goals().await;
        self.barrier().await;

        match &snapshot {
            Some(snapshot) => {
                let (phase, paused, resumed) = self.sweep_pacing(snapshot, now).await;
                report.pacing = phase;
                report.paused = paused;
                report.resumed = resumed;
            }
            None => {
                warn!("Pacing sweep skipped: no counter snapshot this cycle");
                report.pacing.failure = Some("no counter snapshot".to_string());
            }
        }

        metrics::counter!("sync.cycles").increment(1);
        metrics::counter!("sync.ingested").increment(report.ingest.written as u64);
        metrics::counter!("sync.deleted").increment(report.ingest.deleted as u64);
        metrics::counter!("sync.write_errors").increment(report.write_errors() as u64);
        metrics::counter!("sync.phase_errors").increment(report.failed_phases() as u64);
        metrics::counter!("pacing.paused").increment(report.paused as u64);
        metrics::counter!("pacing.resumed").increment(report.resumed as u64);

        info!(
            ingested = report.ingest.written,
            deleted = report.ingest.deleted,
            clicks_merged = report.counters.written,
            goals_repaired = report.goals.written,
            paused = report.paused,
            resumed = report.resumed,
            write_errors = report.write_errors(),
            failed_phases = report.failed_phases(),
            "Reconciliation cycle completed"
        );
        report
    }

    async fn barrier(&self) {
        if let Err(e) = self.index().refresh().await {
            warn!(error = %e, "Index refresh failed");
        }
    }

    // ---- Phase 1: ingest ----

    async fn ingest(&self, now: DateTime<Utc>) -> PhaseReport {
        let units = match self.fetch_upstream().await {
            Ok(units) => units,
            Err(e) => {
                error!(error = %e, "Ingest phase failed");
                return PhaseReport::failed(&e);
            }
        };

        let outcomes = self
            .for_each_unit(units, move |unit| self.ingest_one(unit, now))
            .await;
        let mut report = PhaseReport::default();
        report.tally(&outcomes);
        report
    }

    async fn fetch_upstream(&self) -> DeliveryResult<Vec<AdUnit>> {
        let since = self.engine.high_watermark().await?;
        debug!(watermark = ?since, "Ingesting upstream changes");
        self.upstream.fetch_changed(since).await
    }

    async fn ingest_one(&self, unit: AdUnit, now: DateTime<Utc>) -> WriteOutcome {
        if unit.is_deleted() {
            return match self.index().delete(&unit.id).await {
                Ok(true) => WriteOutcome::Deleted,
                Ok(false) => WriteOutcome::Skipped,
                Err(e) => {
                    warn!(id = %unit.id, error = %e, "Delete failed");
                    WriteOutcome::Failed
                }
            };
        }

        let write = match unit.into_ingest(now) {
            Ok(write) => write,
            Err(e) => {
                warn!(error = %e, "Rejected upstream ad unit");
                return WriteOutcome::Failed;
            }
        };

        match self.index().ingest(&write).await {
            Ok(()) => WriteOutcome::Written,
            Err(e) => {
                warn!(id = %write.unit.id, error = %e, "Ingest write failed");
                WriteOutcome::Failed
            }
        }
    }

    // ---- Phase 2: counter merge ----

    async fn merge_counters(&self, snapshot: &CounterSnapshot) -> PhaseReport {
        let campaigns: Vec<(String, u64)> = snapshot
            .totals
            .iter()
            .map(|(campaign, clicks)| (campaign.clone(), *clicks))
            .collect();

        let per_campaign: Vec<Result<Vec<WriteOutcome>, DeliveryError>> =
            stream::iter(campaigns)
                .map(|(campaign, clicks)| self.merge_campaign(campaign, clicks))
                .buffer_unordered(self.settings.write_concurrency)
                .collect()
                .await;

        let mut report = PhaseReport::default();
        for result in per_campaign {
            match result {
                Ok(outcomes) => report.tally(&outcomes),
                Err(_) => report.errors += 1,
            }
        }
        report
    }

    async fn merge_campaign(&self, campaign: String, clicks: u64) -> DeliveryResult<Vec<WriteOutcome>> {
        let units = self
            .engine
            .find_by_campaign(&campaign)
            .await
            .inspect_err(|e| warn!(campaign = %campaign, error = %e, "Campaign fetch failed"))?;

        let active: Vec<AdUnit> = units
            .into_iter()
            .filter(|u| u.status == Status::Active)
            .collect();

        Ok(self
            .for_each_unit(active, move |unit| async move {
                let reached = goal_reached(unit.goal_views, clicks);
                if unit.clicks == clicks && (!reached || unit.goal_reached) {
                    return WriteOutcome::Skipped;
                }
                let mut doc = json!({ fields::CLICKS: clicks });
                if reached {
                    doc[fields::GOAL_REACHED] = Value::Bool(true);
                }
                self.write_owned(&unit.id, doc).await
            })
            .await)
    }

    // ---- Phase 3: goal sweep ----

    async fn sweep_goals(&self) -> PhaseReport {
        let units = match self.engine.fetch_all().await {
            Ok(units) => units,
            Err(e) => {
                error!(error = %e, "Goal sweep failed");
                return PhaseReport::failed(&e);
            }
        };

        let outcomes = self
            .for_each_unit(units, move |unit| async move {
                let derived = unit.derive_goal_reached();
                if derived == unit.goal_reached {
                    return WriteOutcome::Skipped;
                }
                debug!(id = %unit.id, goal_reached = derived, "Repairing goal_reached");
                self.write_owned(&unit.id, json!({ fields::GOAL_REACHED: derived }))
                    .await
            })
            .await;

        let mut report = PhaseReport::default();
        report.tally(&outcomes);
        report
    }

    // ---- Phase 4: pacing sweep ----

    async fn sweep_pacing(
        &self,
        snapshot: &CounterSnapshot,
        now: DateTime<Utc>,
    ) -> (PhaseReport, usize, usize) {
        let policy = self.settings.policy;
        let units = match self
            .engine
            .find_pacing_candidates(now, policy.horizon_years)
            .await
        {
            Ok(units) => units,
            Err(e) => {
                error!(error = %e, "Pacing sweep failed");
                return (PhaseReport::failed(&e), 0, 0);
            }
        };

        let decisions: Vec<(WriteOutcome, PacingDecision)> = stream::iter(units)
            .map(move |unit| async move {
                let decision = decide(&unit, snapshot.trailing(&unit.campaign), now, &policy);
                let paused = decision.apply(unit.paused);
                if paused == unit.paused {
                    return (WriteOutcome::Skipped, decision);
                }
                debug!(id = %unit.id, paused, ?decision, "Pacing change");
                let outcome = self.write_owned(&unit.id, json!({ fields::PAUSED: paused })).await;
                (outcome, decision)
            })
            .buffer_unordered(self.settings.write_concurrency)
            .collect()
            .await;

        let mut report = PhaseReport::default();
        let (mut paused, mut resumed) = (0, 0);
        for (outcome, decision) in &decisions {
            if *outcome == WriteOutcome::Written {
                match decision {
                    PacingDecision::Pause => paused += 1,
                    PacingDecision::Resume => resumed += 1,
                    PacingDecision::Hold(_) => {}
                }
            }
        }
        let outcomes: Vec<WriteOutcome> = decisions.into_iter().map(|(o, _)| o).collect();
        report.tally(&outcomes);
        (report, paused, resumed)
    }

    // ---- Helpers ----

    async fn for_each_unit<F, Fut>(&self, units: Vec<AdUnit>, f: F) -> Vec<WriteOutcome>
    where
        F: Fn(AdUnit) -> Fut,
        Fut: std::future::Future<Output = WriteOutcome>,
    {
        stream::iter(units)
            .map(f)
            .buffer_unordered(self.settings.write_concurrency)
            .collect()
            .await
    }

    /// Partial write of loop-owned fields. Never creates a document.
    async fn write_owned(&self, id: &str, doc: Value) -> WriteOutcome {
        match self.index().update(id, doc, false).await {
            Ok(()) => WriteOutcome::Written,
            Err(DeliveryError::NotFound(_)) => {
                debug!(id = %id, "Unit vanished before write");
                WriteOutcome::Skipped
            }
            Err(e) => {
                warn!(id = %id, error = %e, "Index write failed");
                WriteOutcome::Failed
            }
        }
    }
}
