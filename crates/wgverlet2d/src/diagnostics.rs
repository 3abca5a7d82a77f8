//! Per-tick instrumentation.
//!
//! The simulation reports named measurements through a [`DiagnosticsSink`]:
//! phase timings in nanoseconds and object counts as plain numbers. A
//! [`RunStats`] carries one tick's worth and can be folded across the
//! sub-steps of a frame.

use std::time::Duration;

/// Receives named measurements from the simulation thread.
pub trait DiagnosticsSink: Send {
    fn event(&mut self, name: &'static str, value: u64);
}

/// Discards every event.
#[derive(Default)]
pub struct NullSink;

impl DiagnosticsSink for NullSink {
    fn event(&mut self, _name: &'static str, _value: u64) {}
}

/// Forwards every event to the `log` crate at debug level.
#[derive(Default)]
pub struct LogSink;

impl DiagnosticsSink for LogSink {
    fn event(&mut self, name: &'static str, value: u64) {
        log::debug!("{name}: {value}");
    }
}

/// Wall-clock timings and counts collected during one simulation tick.
#[derive(Default, Copy, Clone, Debug)]
pub struct RunStats {
    /// Point integration.
    pub integrate: Duration,
    /// Broad-phase candidate generation, including the key bank build.
    pub aabb_collide: Duration,
    /// Narrow-phase manifolds plus reaction sort and apply.
    pub sat_collide: Duration,
    /// Edge relaxation and the hull/entity position re-derives.
    pub resolve_constraints: Duration,
    /// Departure extraction and readback.
    pub egress: Duration,
    /// Deleted-row compaction.
    pub compact: Duration,
    /// The whole tick, including readbacks.
    pub cycle: Duration,
    /// Broad-phase candidate pairs examined.
    pub candidate_pairs: u32,
    /// Contact reactions applied.
    pub reactions: u32,
}

impl RunStats {
    /// Total tick time in milliseconds.
    pub fn cycle_ms(&self) -> f32 {
        self.cycle.as_secs_f32() * 1000.0
    }

    /// Folds another tick's stats into this one. Timings add, counts keep
    /// the maximum to show the worst sub-step.
    pub fn accumulate(&mut self, other: &RunStats) {
        self.integrate += other.integrate;
        self.aabb_collide += other.aabb_collide;
        self.sat_collide += other.sat_collide;
        self.resolve_constraints += other.resolve_constraints;
        self.egress += other.egress;
        self.compact += other.compact;
        self.cycle += other.cycle;
        self.candidate_pairs = self.candidate_pairs.max(other.candidate_pairs);
        self.reactions = self.reactions.max(other.reactions);
    }

    /// Reports every field to `sink` under the `phys_*` event names.
    pub fn report(&self, sink: &mut dyn DiagnosticsSink) {
        sink.event("phys_integrate", self.integrate.as_nanos() as u64);
        sink.event("phys_aabb_collide", self.aabb_collide.as_nanos() as u64);
        sink.event("phys_sat_collide", self.sat_collide.as_nanos() as u64);
        sink.event(
            "phys_resolve_constraints",
            self.resolve_constraints.as_nanos() as u64,
        );
        sink.event("phys_egress", self.egress.as_nanos() as u64);
        sink.event("phys_compact", self.compact.as_nanos() as u64);
        sink.event("phys_cycle", self.cycle.as_nanos() as u64);
        sink.event("phys_candidates", u64::from(self.candidate_pairs));
        sink.event("phys_reactions", u64::from(self.reactions));
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{DiagnosticsSink, RunStats};

    #[derive(Default)]
    struct Recorder(Vec<(&'static str, u64)>);

    impl DiagnosticsSink for Recorder {
        fn event(&mut self, name: &'static str, value: u64) {
            self.0.push((name, value));
        }
    }

    #[test]
    fn accumulate_adds_timings_and_keeps_peak_counts() {
        let mut total = RunStats {
            integrate: Duration::from_micros(10),
            candidate_pairs: 4,
            ..RunStats::default()
        };
        total.accumulate(&RunStats {
            integrate: Duration::from_micros(5),
            candidate_pairs: 9,
            ..RunStats::default()
        });
        assert_eq!(total.integrate, Duration::from_micros(15));
        assert_eq!(total.candidate_pairs, 9);
    }

    #[test]
    fn report_emits_every_phase() {
        let stats = RunStats {
            cycle: Duration::from_nanos(1234),
            reactions: 7,
            ..RunStats::default()
        };
        let mut sink = Recorder::default();
        stats.report(&mut sink);
        assert!(sink.0.contains(&("phys_cycle", 1234)));
        assert!(sink.0.contains(&("phys_reactions", 7)));
        assert_eq!(sink.0.len(), 9);
    }
}
