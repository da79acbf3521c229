//! Train state snapshots.
//!
//! A [`TrainState`] is never mutated once committed: movement code clones
//! it, evolves the clone and commits the result as a new snapshot.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::sim::{SimTime, StateHash};

use super::speed::SpeedController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrainStatus {
    /// Registered, departure not yet happened.
    Scheduled,
    /// Departure happened but the first route is not reserved yet.
    AwaitingRoute,
    Rolling,
    ReachedDestination,
    /// Passed a signal at stop. Brakes at full force until at rest.
    Emergency,
}

/// Progress through the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PhaseState {
    Navigate { end: f64 },
    /// Held in place. `until` is set once the train has come to rest.
    Stop { until: Option<SimTime> },
    /// Last phase ended, waiting to come to rest.
    Arriving,
}

/// Where the train is along its path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionTracker {
    pub head: f64,
    pub length: f64,
}

impl PositionTracker {
    pub fn tail(&self) -> f64 {
        self.head - self.length
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InteractionKind {
    /// The driver sees a signal.
    Seen,
    Head,
    Tail,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum InteractionAction {
    /// Index into the path boundaries.
    Detector { boundary: usize },
    /// Index into the path signals.
    Signal { index: usize },
    PhaseEnd { phase: usize },
}

/// Something that happens when the train reaches a position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub position: f64,
    pub kind: InteractionKind,
    pub action: InteractionAction,
}

impl Interaction {
    /// Handling order of interactions at the same position: sightings, then
    /// signal passing, then section entry, then section exit, then phase
    /// ends.
    pub fn priority(&self) -> u8 {
        match (self.kind, self.action) {
            (_, InteractionAction::PhaseEnd { .. }) => 4,
            (InteractionKind::Seen, _) => 0,
            (InteractionKind::Head, InteractionAction::Signal { .. }) => 1,
            (InteractionKind::Head, _) => 2,
            (InteractionKind::Tail, _) => 3,
        }
    }
}

/// Sort interactions by position, then priority.
pub fn sort_interactions(interactions: &mut [Interaction]) {
    interactions.sort_by(|a, b| {
        a.position
            .total_cmp(&b.position)
            .then(a.priority().cmp(&b.priority()))
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySample {
    pub time: SimTime,
    pub position: f64,
    pub speed: f64,
}

/// A state the train is planned to reach, and the samples on the way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainPlan {
    pub state: TrainState,
    pub samples: Vec<TrajectorySample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainState {
    pub time: SimTime,
    pub speed: f64,
    pub status: TrainStatus,
    pub phase_index: usize,
    pub phase: PhaseState,
    pub location: PositionTracker,
    /// Upcoming interactions, sorted.
    pub interactions: VecDeque<Interaction>,
    /// Index of the route the head is on.
    pub route_index: usize,
    /// Directives from sighted signals, by path signal index.
    pub signal_controllers: BTreeMap<usize, SpeedController>,
    /// Path signal indices sighted and not passed yet.
    pub seen_signals: BTreeSet<usize>,
    pub advisories: Vec<SpeedController>,
}

impl TrainState {
    pub fn is_active(&self) -> bool {
        matches!(self.status, TrainStatus::Rolling | TrainStatus::Emergency)
    }

    pub fn next_interaction(&self) -> Option<&Interaction> {
        self.interactions.front()
    }

    pub fn hash_into(&self, hash: &mut StateHash) {
        hash.write_f64(self.time);
        hash.write_f64(self.speed);
        hash.write_u32(self.status as u32);
        hash.write_u64(self.phase_index as u64);
        match self.phase {
            PhaseState::Navigate { end } => {
                hash.write_u32(0);
                hash.write_f64(end);
            }
            PhaseState::Stop { until } => {
                hash.write_u32(1);
                hash.write_f64(until.unwrap_or(f64::NAN));
            }
            PhaseState::Arriving => hash.write_u32(2),
        }
        hash.write_f64(self.location.head);
        hash.write_u64(self.interactions.len() as u64);
        hash.write_u64(self.route_index as u64);
        hash.write_u64(self.signal_controllers.len() as u64);
        for &index in &self.seen_signals {
            hash.write_u64(index as u64);
        }
        hash.write_u64(self.advisories.len() as u64);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
