//! Validation tools for state comparison and determinism checking.
//!
//! Provides utilities for comparing two simulations to find divergences,
//! and for validating that a scenario produces deterministic results.

use crate::engine::Simulation;
use crate::error::SimulationError;
use crate::id::*;

// ---------------------------------------------------------------------------
// State diff types
// ---------------------------------------------------------------------------

/// Difference between two simulations at the train level.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainDiff {
    /// Train exists only in simulation A.
    OnlyInA(TrainId),
    /// Train exists only in simulation B.
    OnlyInB(TrainId),
    /// Train exists in both but has a different state.
    StateMismatch { train: TrainId, description: String },
}

/// An interlocking entity whose state differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterlockingDiff {
    Switch(SwitchId),
    Route(RouteId),
    TvdSection(TvdSectionId),
    Signal(SignalId),
}

/// Per-subsystem match results.
#[derive(Debug, Clone)]
pub struct SubsystemDiff {
    pub timeline_matches: bool,
    pub interlocking_matches: bool,
    pub trains_match: bool,
}

/// Full state diff between two simulations.
#[derive(Debug, Clone)]
pub struct StateDiff {
    pub is_identical: bool,
    pub subsystem_diffs: SubsystemDiff,
    pub train_diffs: Vec<TrainDiff>,
    pub interlocking_diffs: Vec<InterlockingDiff>,
}

// ---------------------------------------------------------------------------
// Quick compare (subsystem-level only)
// ---------------------------------------------------------------------------

/// Quick subsystem-level comparison using hashes.
pub fn quick_compare(a: &Simulation, b: &Simulation) -> SubsystemDiff {
    let ha = a.subsystem_hashes();
    let hb = b.subsystem_hashes();

    SubsystemDiff {
        timeline_matches: ha.timeline == hb.timeline,
        interlocking_matches: ha.interlocking == hb.interlocking,
        trains_match: ha.trains == hb.trains,
    }
}

// ---------------------------------------------------------------------------
// Full diff
// ---------------------------------------------------------------------------

/// Compute a detailed diff between two simulations. Both are expected to
/// run on the same infrastructure.
pub fn diff_simulations(a: &Simulation, b: &Simulation) -> StateDiff {
    let subsystem_diffs = quick_compare(a, b);

    let mut train_diffs = Vec::new();
    for (id, train) in a.trains() {
        let Some(other) = b.train(id) else {
            train_diffs.push(TrainDiff::OnlyInA(id));
            continue;
        };
        let mut mismatches = Vec::new();
        if train.state.status != other.state.status {
            mismatches.push("status");
        }
        if train.state.location != other.state.location {
            mismatches.push("location");
        }
        if train.state.speed != other.state.speed {
            mismatches.push("speed");
        }
        if train.state.time != other.state.time {
            mismatches.push("time");
        }
        if train.state != other.state && mismatches.is_empty() {
            mismatches.push("state");
        }
        if train.trajectory != other.trajectory {
            mismatches.push("trajectory");
        }
        if !mismatches.is_empty() {
            train_diffs.push(TrainDiff::StateMismatch {
                train: id,
                description: mismatches.join(", "),
            });
        }
    }
    for (id, _) in b.trains() {
        if a.train(id).is_none() {
            train_diffs.push(TrainDiff::OnlyInB(id));
        }
    }

    let (sa, sb) = (a.state(), b.state());
    let mut interlocking_diffs = Vec::new();
    interlocking_diffs.extend(
        differing(&sa.switches, &sb.switches).map(|i| InterlockingDiff::Switch(SwitchId(i))),
    );
    interlocking_diffs.extend(
        differing(&sa.routes, &sb.routes).map(|i| InterlockingDiff::Route(RouteId(i))),
    );
    interlocking_diffs.extend(
        differing(&sa.sections, &sb.sections).map(|i| InterlockingDiff::TvdSection(TvdSectionId(i))),
    );
    interlocking_diffs.extend(
        differing(&sa.signals, &sb.signals).map(|i| InterlockingDiff::Signal(SignalId(i))),
    );

    let is_identical = train_diffs.is_empty()
        && interlocking_diffs.is_empty()
        && subsystem_diffs.timeline_matches
        && subsystem_diffs.interlocking_matches
        && subsystem_diffs.trains_match;

    StateDiff {
        is_identical,
        subsystem_diffs,
        train_diffs,
        interlocking_diffs,
    }
}

/// Indices at which two state arenas differ.
fn differing<'s, T: PartialEq>(a: &'s [T], b: &'s [T]) -> impl Iterator<Item = u32> + 's {
    let longest = a.len().max(b.len());
    (0..longest)
        .filter(move |&i| a.get(i) != b.get(i))
        .map(|i| i as u32)
}

// ---------------------------------------------------------------------------
// Determinism validation
// ---------------------------------------------------------------------------

/// Result of a determinism validation run.
#[derive(Debug)]
pub struct DeterminismResult {
    /// Whether the two runs produced identical results.
    pub is_deterministic: bool,
    /// Step at which divergence was first detected (if any).
    pub divergence_step: Option<u64>,
    /// Hash log: (step, hash_run1, hash_run2) for each step.
    pub hash_log: Vec<(u64, u64, u64)>,
}

/// Validate that two simulations built by `build` evolve identically, for at
/// most `steps` events each.
pub fn validate_determinism(
    build: impl Fn() -> Result<Simulation, SimulationError>,
    steps: u64,
) -> Result<DeterminismResult, SimulationError> {
    let mut sim_a = build()?;
    let mut sim_b = build()?;

    let mut hash_log = Vec::new();
    let mut divergence_step = None;

    for step in 1..=steps {
        let event_a = sim_a.step()?;
        let event_b = sim_b.step()?;
        if event_a.is_none() && event_b.is_none() {
            break;
        }

        let hash_a = sim_a.state_hash();
        let hash_b = sim_b.state_hash();
        hash_log.push((step, hash_a, hash_b));

        if (hash_a != hash_b || event_a != event_b) && divergence_step.is_none() {
            divergence_step = Some(step);
        }
    }

    Ok(DeterminismResult {
        is_deterministic: divergence_step.is_none(),
        divergence_step,
        hash_log,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SimConfig;
    use crate::kernel::EventValue;
    use crate::test_utils::*;
    use crate::topology::SwitchBranch;
    use crate::train::TrainSchedule;

    fn line_scenario() -> Result<Simulation, SimulationError> {
        init_logging();
        let infra = Arc::new(line_infra(3, 1000.0));
        let mut sim = Simulation::new(infra.clone(), SimConfig::default())?;
        let schedule = TrainSchedule::new("t1", fast_rolling_stock(), line_routes(&infra, 3))
            .navigate_to(1500.0)
            .stop_for(20.0)
            .navigate_to(2900.0);
        sim.add_train(schedule)?;
        Ok(sim)
    }

    fn switch_scenario() -> Simulation {
        init_logging();
        Simulation::new(Arc::new(switch_infra(10.0)), SimConfig::default()).unwrap()
    }

    // -----------------------------------------------------------------------
    // Test 1: Identical simulations have identical diff
    // -----------------------------------------------------------------------
    #[test]
    fn diff_identical_simulations() {
        let mut a = line_scenario().unwrap();
        let mut b = line_scenario().unwrap();
        a.run().unwrap();
        b.run().unwrap();

        let diff = diff_simulations(&a, &b);
        assert!(diff.is_identical);
        assert!(diff.train_diffs.is_empty());
        assert!(diff.interlocking_diffs.is_empty());
    }

    // -----------------------------------------------------------------------
    // Test 2: Train progress detected
    // -----------------------------------------------------------------------
    #[test]
    fn diff_detects_train_progress() {
        let mut a = line_scenario().unwrap();
        let b = line_scenario().unwrap();
        a.run_until(40.0).unwrap();

        let diff = diff_simulations(&a, &b);
        assert!(!diff.is_identical);
        assert!(!diff.subsystem_diffs.timeline_matches);
        assert!(!diff.subsystem_diffs.trains_match);
        let Some(TrainDiff::StateMismatch { description, .. }) = diff.train_diffs.first() else {
            panic!("expected a train mismatch");
        };
        assert!(description.contains("location"));
        assert!(description.contains("trajectory"));
    }

    // -----------------------------------------------------------------------
    // Test 3: Trains present on one side only
    // -----------------------------------------------------------------------
    #[test]
    fn diff_detects_train_only_in_a() {
        let a = line_scenario().unwrap();
        let b = Simulation::new(a.infra().clone(), SimConfig::default()).unwrap();

        let diff = diff_simulations(&a, &b);
        assert_eq!(diff.train_diffs.len(), 1);
        assert!(matches!(diff.train_diffs[0], TrainDiff::OnlyInA(_)));
        let reverse = diff_simulations(&b, &a);
        assert!(matches!(reverse.train_diffs[0], TrainDiff::OnlyInB(_)));
    }

    // -----------------------------------------------------------------------
    // Test 4: Interlocking entities pinpointed
    // -----------------------------------------------------------------------
    #[test]
    fn diff_pinpoints_interlocking_entities() {
        let mut a = switch_scenario();
        let b = switch_scenario();
        let right = a.infra().route_id("right").unwrap();
        a.request_route(right).unwrap();

        let diff = diff_simulations(&a, &b);
        assert!(!diff.subsystem_diffs.interlocking_matches);
        assert!(diff.subsystem_diffs.trains_match);
        assert!(diff.interlocking_diffs.contains(&InterlockingDiff::Switch(SwitchId(0))));
        assert!(diff.interlocking_diffs.contains(&InterlockingDiff::Route(right)));
        // The junction signal stays red while the switch moves.
        let junction = a.infra().signal_id("S_junction").unwrap();
        assert!(!diff.interlocking_diffs.contains(&InterlockingDiff::Signal(junction)));
    }

    // -----------------------------------------------------------------------
    // Test 5: Quick compare
    // -----------------------------------------------------------------------
    #[test]
    fn quick_compare_identical() {
        let a = switch_scenario();
        let b = switch_scenario();
        let diff = quick_compare(&a, &b);
        assert!(diff.timeline_matches);
        assert!(diff.interlocking_matches);
        assert!(diff.trains_match);
    }

    #[test]
    fn quick_compare_after_marker() {
        let mut a = switch_scenario();
        let b = switch_scenario();
        a.schedule(EntityId::Switch(SwitchId(0)), 3.0, EventValue::Marker(0))
            .unwrap();
        let diff = quick_compare(&a, &b);
        assert!(!diff.timeline_matches);
        assert!(diff.interlocking_matches);
    }

    // -----------------------------------------------------------------------
    // Test 6: Validate determinism passes
    // -----------------------------------------------------------------------
    #[test]
    fn validate_determinism_passes() {
        let result = validate_determinism(line_scenario, 10_000).unwrap();
        assert!(result.is_deterministic);
        assert!(result.divergence_step.is_none());
        assert!(!result.hash_log.is_empty());
        assert!(result.hash_log.iter().all(|&(_, a, b)| a == b));
    }

    #[test]
    fn validate_determinism_reports_divergence() {
        // Each build asks for a different switch position.
        let builds = std::cell::Cell::new(0);
        let build = || -> Result<Simulation, SimulationError> {
            let mut sim = switch_scenario();
            let branch = if builds.get() == 0 {
                SwitchBranch::Right
            } else {
                SwitchBranch::Left
            };
            builds.set(builds.get() + 1);
            sim.request_switch_position(SwitchId(0), branch)?;
            sim.schedule(EntityId::Switch(SwitchId(0)), 20.0, EventValue::Marker(0))?;
            Ok(sim)
        };
        let result = validate_determinism(build, 100).unwrap();
        assert!(!result.is_deterministic);
        assert_eq!(result.divergence_step, Some(1));
    }
}
