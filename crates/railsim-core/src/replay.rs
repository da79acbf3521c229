//! Replay of recorded changes for debugging and determinism checks.
//!
//! A simulation records every [`Change`] it applies. Applying the same
//! changes to a fresh simulation, built from the same infrastructure and the
//! same train registrations, rebuilds the same state without running any
//! decision logic. Hash checkpoints recorded along the way verify that it
//! does.

use crate::change::{Change, DeserializeError, SerializeError};
use crate::engine::Simulation;
use crate::error::SimulationError;

// ---------------------------------------------------------------------------
// ReplayMismatch
// ---------------------------------------------------------------------------

/// Details about where replay verification failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayMismatch {
    /// Number of changes applied when the mismatch was detected.
    pub change_index: usize,
    /// Expected hash from the recording.
    pub expected_hash: u64,
    /// Actual hash from the replay.
    pub actual_hash: u64,
}

// ---------------------------------------------------------------------------
// ReplayLog
// ---------------------------------------------------------------------------

/// A recorded sequence of changes.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReplayLog {
    /// Recorded changes in order.
    pub changes: Vec<Change>,
    /// Hash checkpoints: (changes applied, state_hash).
    pub hash_checkpoints: Vec<(usize, u64)>,
}

impl ReplayLog {
    /// Capture the changes and checkpoints a simulation recorded so far.
    /// Empty when the simulation does not record changes.
    pub fn from_simulation(sim: &Simulation) -> Self {
        let log = sim.change_log();
        Self {
            changes: log.changes().to_vec(),
            hash_checkpoints: log.checkpoints().to_vec(),
        }
    }

    /// Number of recorded changes.
    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    /// Add a checkpoint for the current end of the log.
    pub fn checkpoint(&mut self, hash: u64) {
        self.hash_checkpoints.push((self.changes.len(), hash));
    }

    /// Serialize the replay log to bytes (using bitcode).
    pub fn serialize(&self) -> Result<Vec<u8>, SerializeError> {
        bitcode::serialize(self).map_err(|e| SerializeError::Encode(e.to_string()))
    }

    /// Deserialize a replay log from bytes.
    pub fn deserialize(data: &[u8]) -> Result<Self, DeserializeError> {
        bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ReplayResult
// ---------------------------------------------------------------------------

/// The result of replaying a log.
#[derive(Debug)]
pub struct ReplayResult {
    /// Number of changes applied.
    pub changes_applied: usize,
    /// Whether all hash checkpoints matched.
    pub is_verified: bool,
    /// First mismatch encountered (if any).
    pub first_mismatch: Option<ReplayMismatch>,
}

// ---------------------------------------------------------------------------
// Replay execution
// ---------------------------------------------------------------------------

/// Apply every change of a log to `target`, checking hash checkpoints on
/// the way.
pub fn replay_and_verify(
    log: &ReplayLog,
    target: &mut Simulation,
) -> Result<ReplayResult, SimulationError> {
    let mut first_mismatch: Option<ReplayMismatch> = None;
    let mut checkpoints = log.hash_checkpoints.iter().peekable();
    let mut verify = |applied: usize, target: &Simulation| {
        while let Some(&&(index, expected_hash)) = checkpoints.peek() {
            if index != applied {
                break;
            }
            let actual_hash = target.state_hash();
            if actual_hash != expected_hash && first_mismatch.is_none() {
                first_mismatch = Some(ReplayMismatch {
                    change_index: index,
                    expected_hash,
                    actual_hash,
                });
            }
            checkpoints.next();
        }
    };

    target.replay_changes(&log.changes, |applied, sim| verify(applied, sim))?;

    Ok(ReplayResult {
        changes_applied: log.changes.len(),
        is_verified: first_mismatch.is_none(),
        first_mismatch,
    })
}

/// Apply every change of a log to `target` without verification.
pub fn replay(log: &ReplayLog, target: &mut Simulation) -> Result<usize, SimulationError> {
    target.replay_changes(&log.changes, |_, _| {})?;
    Ok(log.changes.len())
}

impl Simulation {
    /// Commit recorded changes one by one, calling `after` with the number
    /// of changes applied so far (starting with zero).
    fn replay_changes(
        &mut self,
        changes: &[Change],
        mut after: impl FnMut(usize, &Simulation),
    ) -> Result<(), SimulationError> {
        if self.is_halted() {
            return Err(SimulationError::Halted);
        }
        after(0, self);
        for (index, change) in changes.iter().enumerate() {
            self.commit(change.clone())?;
            after(index + 1, self);
        }
        // Signal re-evaluation was recorded along with everything else.
        self.dirty_routes.clear();
        self.dirty_switches.clear();
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::SimConfig;
    use crate::id::*;
    use crate::infra::Infra;
    use crate::kernel::EventValue;
    use crate::test_utils::*;
    use crate::topology::SwitchBranch;
    use crate::train::TrainSchedule;

    /// A train to the end of the line, and a second one following it.
    fn schedules(infra: &Infra) -> Vec<TrainSchedule> {
        let routes = line_routes(infra, 4);
        vec![
            TrainSchedule::new("first", fast_rolling_stock(), routes.clone()).navigate_to(3900.0),
            TrainSchedule::new("second", fast_rolling_stock(), routes)
                .departing_at(30.0)
                .navigate_to(2900.0),
        ]
    }

    fn two_train_run(config: SimConfig) -> (Arc<Infra>, Simulation) {
        init_logging();
        let infra = Arc::new(line_infra(4, 1000.0));
        let mut sim = Simulation::new(infra.clone(), config).unwrap();
        for schedule in schedules(&infra) {
            sim.add_train(schedule).unwrap();
        }
        sim.run().unwrap();
        (infra, sim)
    }

    /// A fresh simulation with the same trains registered.
    fn replay_target(infra: Arc<Infra>, config: SimConfig) -> Simulation {
        let mut sim = Simulation::new(infra.clone(), config).unwrap();
        for schedule in schedules(&infra) {
            sim.register_train(schedule).unwrap();
        }
        sim
    }

    // -----------------------------------------------------------------------
    // Test 1: Replay rebuilds an equal simulation
    // -----------------------------------------------------------------------
    #[test]
    fn replay_rebuilds_equal_simulation() {
        let (infra, original) = two_train_run(SimConfig::default());
        let log = ReplayLog::from_simulation(&original);
        assert!(log.change_count() > 0);

        let mut target = replay_target(infra, SimConfig::default());
        assert_eq!(replay(&log, &mut target).unwrap(), log.change_count());
        assert_eq!(target, original);
        assert_eq!(target.state_hash(), original.state_hash());
        assert_eq!(target.time(), original.time());
        assert!(target.is_over());
    }

    // -----------------------------------------------------------------------
    // Test 2: Checkpoints verify
    // -----------------------------------------------------------------------
    #[test]
    fn replay_verify_passes() {
        let config = SimConfig {
            hash_checkpoint_interval: Some(3),
            ..SimConfig::default()
        };
        let (infra, original) = two_train_run(config.clone());
        let log = ReplayLog::from_simulation(&original);
        assert!(!log.hash_checkpoints.is_empty());

        let mut target = replay_target(infra, config);
        let result = replay_and_verify(&log, &mut target).unwrap();
        assert!(result.is_verified);
        assert_eq!(result.changes_applied, log.change_count());
        assert!(result.first_mismatch.is_none());
    }

    #[test]
    fn replay_verify_detects_mismatch() {
        let (infra, original) = two_train_run(SimConfig::default());
        let mut log = ReplayLog::from_simulation(&original);
        log.checkpoint(original.state_hash() ^ 1);

        let mut target = replay_target(infra, SimConfig::default());
        let result = replay_and_verify(&log, &mut target).unwrap();
        assert!(!result.is_verified);
        let mismatch = result.first_mismatch.unwrap();
        assert_eq!(mismatch.change_index, log.change_count());
        assert_eq!(mismatch.actual_hash, original.state_hash());
    }

    // -----------------------------------------------------------------------
    // Test 3: Replayed changes continue the run
    // -----------------------------------------------------------------------
    #[test]
    fn replayed_simulation_keeps_running() {
        let infra = Arc::new(switch_infra(10.0));
        let mut original = Simulation::new(infra.clone(), SimConfig::default()).unwrap();
        original.request_switch_position(SwitchId(0), SwitchBranch::Right).unwrap();
        original.schedule(EntityId::Route(RouteId(0)), 5.0, EventValue::Marker(7)).unwrap();
        assert_eq!(original.run_until(5.0).unwrap(), 1);
        let log = ReplayLog::from_simulation(&original);

        let mut target = Simulation::new(infra, SimConfig::default()).unwrap();
        replay(&log, &mut target).unwrap();
        original.run().unwrap();
        target.run().unwrap();
        assert_eq!(target, original);
        assert!(target.state().switch(SwitchId(0)).is_set(SwitchBranch::Right));
    }

    // -----------------------------------------------------------------------
    // Test 4: Serialization
    // -----------------------------------------------------------------------
    #[test]
    fn replay_log_serialization_round_trip() {
        let (_, original) = two_train_run(SimConfig::default());
        let log = ReplayLog::from_simulation(&original);
        let data = log.serialize().unwrap();
        let restored = ReplayLog::deserialize(&data).unwrap();
        assert_eq!(restored, log);
    }

    #[test]
    fn unrecorded_run_yields_empty_log() {
        let config = SimConfig {
            record_changes: false,
            ..SimConfig::default()
        };
        let (_, original) = two_train_run(config);
        assert!(ReplayLog::from_simulation(&original).changes.is_empty());
        assert!(original.change_log().len() > 0);
    }
}
