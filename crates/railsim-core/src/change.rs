//! State changes and the change log.
//!
//! Every mutation of a simulation is a [`Change`]. A change is created by the
//! code that decides on it, registered in the [`ChangeLog`], applied to the
//! simulation state and then published to observers. Replaying the logged
//! changes against a fresh simulation rebuilds the same state without
//! re-running any decision logic.

use serde::{Deserialize, Serialize};

use crate::expr::AspectSet;
use crate::id::*;
use crate::interlocking::{RouteState, SwitchState, TvdSectionState};
use crate::kernel::EventValue;
use crate::sim::SimTime;
use crate::train::{TrainState, TrajectorySample};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying a serialized change log.
pub const CHANGE_LOG_MAGIC: u32 = 0x5241_1C01;

/// Current change log format version. Increment when breaking the format.
pub const FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("bitcode encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("invalid magic number: expected 0x{:08X}, got 0x{:08X}", CHANGE_LOG_MAGIC, .0)]
    InvalidMagic(u32),
    #[error("unsupported format version: expected {}, got {}", FORMAT_VERSION, .0)]
    UnsupportedVersion(u32),
    #[error("bitcode decoding failed: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Change
// ---------------------------------------------------------------------------

/// A new snapshot of a train, with the trajectory samples leading to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainStateChange {
    pub train: TrainId,
    pub state: TrainState,
    pub samples: Vec<TrajectorySample>,
}

/// An atomic mutation of a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    EventCreated {
        entity: EntityId,
        revision: u64,
        time: SimTime,
        value: EventValue,
    },
    EventOccurred {
        event: EventId,
    },
    EventCancelled {
        event: EventId,
    },
    SwitchState {
        switch: SwitchId,
        state: SwitchState,
    },
    RouteState {
        route: RouteId,
        state: RouteState,
    },
    TvdSection {
        section: TvdSectionId,
        state: TvdSectionState,
    },
    SignalAspects {
        signal: SignalId,
        aspects: AspectSet,
    },
    SignalSubscription {
        signal: SignalId,
        train: TrainId,
        subscribed: bool,
    },
    TrainState(Box<TrainStateChange>),
}

impl Change {
    /// The entity whose state the change affects, if any.
    pub fn entity(&self) -> Option<EntityId> {
        match self {
            Change::EventCreated { entity, .. } => Some(*entity),
            Change::EventOccurred { .. } | Change::EventCancelled { .. } => None,
            Change::SwitchState { switch, .. } => Some(EntityId::Switch(*switch)),
            Change::RouteState { route, .. } => Some(EntityId::Route(*route)),
            Change::TvdSection { section, .. } => Some(EntityId::TvdSection(*section)),
            Change::SignalAspects { signal, .. } | Change::SignalSubscription { signal, .. } => {
                Some(EntityId::Signal(*signal))
            }
            Change::TrainState(change) => Some(EntityId::Train(change.train)),
        }
    }
}

// ---------------------------------------------------------------------------
// Change log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStage {
    Created,
    Registered,
    Published,
}

/// Receives every change once it has been applied.
pub trait ChangeObserver {
    fn on_change(&mut self, index: usize, change: &Change);
}

/// Ordered record of the changes applied to a simulation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeLog {
    record: bool,
    changes: Vec<Change>,
    registered: usize,
    published: usize,
    /// `(changes applied, state hash)` pairs.
    checkpoints: Vec<(usize, u64)>,
}

impl ChangeLog {
    pub fn new(record: bool) -> Self {
        Self {
            record,
            ..Self::default()
        }
    }

    /// Register a change about to be applied. Returns its index.
    pub(crate) fn register(&mut self, change: &Change) -> usize {
        if self.record {
            self.changes.push(change.clone());
        }
        self.registered += 1;
        self.registered - 1
    }

    pub(crate) fn publish(&mut self, index: usize) {
        self.published = self.published.max(index + 1);
    }

    pub(crate) fn checkpoint(&mut self, hash: u64) {
        self.checkpoints.push((self.registered, hash));
    }

    pub fn stage(&self, index: usize) -> ChangeStage {
        if index < self.published {
            ChangeStage::Published
        } else if index < self.registered {
            ChangeStage::Registered
        } else {
            ChangeStage::Created
        }
    }

    /// Number of changes registered so far, recorded or not.
    pub fn len(&self) -> usize {
        self.registered
    }

    pub fn is_empty(&self) -> bool {
        self.registered == 0
    }

    pub fn is_recording(&self) -> bool {
        self.record
    }

    /// Recorded changes. Empty when recording is disabled.
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn checkpoints(&self) -> &[(usize, u64)] {
        &self.checkpoints
    }

    pub fn serialize(&self) -> Result<Vec<u8>, SerializeError> {
        let file = ChangeLogFile {
            magic: CHANGE_LOG_MAGIC,
            version: FORMAT_VERSION,
            changes: self.changes.clone(),
            checkpoints: self.checkpoints.clone(),
        };
        bitcode::serialize(&file).map_err(|e| SerializeError::Encode(e.to_string()))
    }

    /// Decode a log written by [`ChangeLog::serialize`]. Every decoded change
    /// counts as published.
    pub fn deserialize(data: &[u8]) -> Result<Self, DeserializeError> {
        let file: ChangeLogFile =
            bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))?;
        if file.magic != CHANGE_LOG_MAGIC {
            return Err(DeserializeError::InvalidMagic(file.magic));
        }
        if file.version != FORMAT_VERSION {
            return Err(DeserializeError::UnsupportedVersion(file.version));
        }
        let count = file.changes.len();
        Ok(Self {
            record: true,
            changes: file.changes,
            registered: count,
            published: count,
            checkpoints: file.checkpoints,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct ChangeLogFile {
    magic: u32,
    version: u32,
    changes: Vec<Change>,
    checkpoints: Vec<(usize, u64)>,
}

// ===========================================================================
// Tests
// ===========================================================================
