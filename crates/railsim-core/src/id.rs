use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a train registered with a simulation.
    pub struct TrainId;
}

macro_rules! index_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u32);

        impl $name {
            /// Position of the entity in its arena.
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

index_id!(
    /// Identifies a track section of the physical track graph.
    TrackSectionId
);
index_id!(
    /// Identifies a switch. Cheap to copy and compare.
    SwitchId
);
index_id!(
    /// Identifies a detector or buffer stop.
    WaypointId
);
index_id!(
    /// Identifies a path between two waypoints in the overlay graph.
    TvdPathId
);
index_id!(
    /// Identifies a train vacancy detection section.
    TvdSectionId
);
index_id!(
    /// Identifies a route.
    RouteId
);
index_id!(
    /// Identifies a signal.
    SignalId
);
index_id!(
    /// Identifies an aspect a signal can show.
    AspectId
);
index_id!(
    /// Identifies a parameterized signaling function.
    FunctionId
);

/// Identifies a timeline event. Equal to the kernel revision that created it,
/// so ids grow monotonically over a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// Anything that can own timeline events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityId {
    Train(TrainId),
    Switch(SwitchId),
    Route(RouteId),
    TvdSection(TvdSectionId),
    Signal(SignalId),
}
