//! Per-second sampling of a [`Simulation`] into a metrics report.

use crate::simulation::Simulation;
use anyhow::Result;
use mmobatch_net::MessageBatchStats;
use mmobatch_testkit::{
    BatchingMetrics, CompressionMetrics, DispatchMetrics, DriftMetrics, EventRecord, JsonlSink,
    MetricsReport, MetricsReportBuilder, ProfileSample, TestExecutionMetrics, TestResult,
};
use std::time::Instant;
use tracing::{info, warn};

pub struct BatchingProfiler {
    name: String,
    started: Instant,
    last_stats: MessageBatchStats,
    last_processed: u64,
    timeline: Vec<ProfileSample>,
    events: Option<JsonlSink>,
}

impl BatchingProfiler {
    pub fn new(name: impl Into<String>, events: Option<JsonlSink>) -> Self {
        Self {
            name: name.into(),
            started: Instant::now(),
            last_stats: MessageBatchStats::default(),
            last_processed: 0,
            timeline: Vec::new(),
            events,
        }
    }

    pub fn timeline(&self) -> &[ProfileSample] {
        &self.timeline
    }

    /// Log respawns reported by [`Simulation::step`].
    pub fn record_respawns(&mut self, frame: u64, respawned: &[String]) -> Result<()> {
        let Some(events) = self.events.as_mut() else {
            return Ok(());
        };
        for id in respawned {
            events.write(&EventRecord {
                tick: frame,
                kind: "respawn",
                payload: id,
            })?;
        }
        Ok(())
    }

    /// Sample once every simulated second.
    pub fn after_frame(&mut self, sim: &Simulation) -> Result<()> {
        let fps = u64::from(sim.fps().max(1));
        if sim.frame() % fps == 0 {
            self.sample(sim, sim.frame() / fps)?;
        }
        Ok(())
    }

    /// Close the timeline and build the report.
    ///
    /// Call after [`Simulation::finish`] so the final flush is counted.
    pub fn finish(mut self, sim: &Simulation) -> Result<MetricsReport> {
        let fps = u64::from(sim.fps().max(1));
        let stats = sim.layer().messages().stats();
        if stats != self.last_stats || sim.messages_processed() != self.last_processed {
            self.sample(sim, sim.frame().div_ceil(fps))?;
        }
        if let Some(events) = self.events.as_mut() {
            events.flush()?;
        }

        let processing = sim.processing_stats();
        let dispatch = DispatchMetrics::merged(&processing);
        let sent = sim.sent_counts();
        let received = sim.received_counts();

        let checks = [
            ("no malformed batches", dispatch.malformed_batches == 0),
            ("no unknown messages", dispatch.unknown_messages == 0),
            ("no handler failures", dispatch.handler_failures == 0),
            (
                "every message delivered",
                sent.chat == received.chat
                    && sent.abilities == received.abilities
                    && sent.combat == received.combat
                    && sent.despawns == received.despawns,
            ),
        ];
        let mut passed = 0;
        for (name, ok) in checks {
            if ok {
                passed += 1;
            } else {
                warn!("Validation failed: {}", name);
            }
        }
        let result = if passed == checks.len() {
            TestResult::Pass
        } else {
            TestResult::Fail
        };

        let drift = sim.drift();
        let duration = self.started.elapsed();
        info!(
            "Profiled {} frames in {:.2?} ({}/{} validations passed)",
            sim.frame(),
            duration,
            passed,
            checks.len()
        );

        Ok(MetricsReportBuilder::new(self.name)
            .result(result)
            .batching(BatchingMetrics::from(&stats))
            .dispatch(dispatch)
            .compression(CompressionMetrics::from(
                &sim.layer().character_states().stats(),
            ))
            .drift(DriftMetrics {
                entities: drift.entities,
                max_drift: drift.max_drift,
                avg_drift: drift.avg_drift,
            })
            .timeline(self.timeline)
            .execution(TestExecutionMetrics {
                duration_seconds: duration.as_secs_f64(),
                simulated_seconds: sim.frame() as f64 / fps as f64,
                frames: sim.frame(),
                validations_passed: Some(passed),
            })
            .build())
    }

    fn sample(&mut self, sim: &Simulation, second: u64) -> Result<()> {
        let stats = sim.layer().messages().stats();
        let processed = sim.messages_processed();
        let sample = ProfileSample {
            second,
            messages_batched: stats
                .messages_batched
                .saturating_sub(self.last_stats.messages_batched),
            batches_sent: stats
                .batches_sent
                .saturating_sub(self.last_stats.batches_sent),
            bytes_sent: stats.bytes_sent.saturating_sub(self.last_stats.bytes_sent),
            bandwidth_saved: stats
                .bandwidth_saved
                .saturating_sub(self.last_stats.bandwidth_saved),
            messages_processed: processed.saturating_sub(self.last_processed),
        };

        if let Some(events) = self.events.as_mut() {
            let payload = serde_json::to_string(&sample)?;
            events.write(&EventRecord {
                tick: sim.frame(),
                kind: "sample",
                payload: &payload,
            })?;
        }

        self.last_stats = stats;
        self.last_processed = processed;
        self.timeline.push(sample);
        Ok(())
    }
}
