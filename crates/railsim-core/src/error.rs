//! Error types.
//!
//! [`SimulationError`] is fatal: it halts the simulation. Construction
//! problems are collected as [`ValidationError`]s so that every problem of an
//! infrastructure or a train schedule is reported at once.

use crate::expr::ValueType;
use crate::id::*;
use crate::sim::SimTime;

// ---------------------------------------------------------------------------
// Runtime errors
// ---------------------------------------------------------------------------

/// Fatal errors raised while a simulation runs.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("cannot schedule an event at t={time} before the current time t={now}")]
    ScheduledInPast { time: SimTime, now: SimTime },
    #[error("event {0:?} is not scheduled")]
    NotScheduled(EventId),
    #[error("event {event:?} is not the next event to happen (next is {next:?})")]
    NotNextEvent {
        event: EventId,
        next: Option<EventId>,
    },
    #[error("time cannot go backward from t={from} to t={to}")]
    TimeWentBackward { from: SimTime, to: SimTime },
    #[error("train physics numerical integration doesn't seem to stop ({steps} steps)")]
    IntegrationDiverged { steps: usize },
    #[error("expression type mismatch: expected {expected:?}, found {found:?}")]
    ExprTypeMismatch {
        expected: ValueType,
        found: ValueType,
    },
    #[error("train {train:?} entered TVD section {section:?} already occupied by {occupant:?}")]
    DoubleOccupancy {
        section: TvdSectionId,
        occupant: TrainId,
        train: TrainId,
    },
    #[error("inconsistent change: {0}")]
    InconsistentChange(String),
    #[error("unknown train {0:?}")]
    UnknownTrain(TrainId),
    #[error("invalid train: {0}")]
    InvalidTrain(#[from] ValidationErrors),
    #[error("simulation halted after a fatal error")]
    Halted,
    #[error("event {event:?} of {entity:?} failed at t={time}: {source}")]
    EventFailed {
        event: EventId,
        entity: EntityId,
        time: SimTime,
        #[source]
        source: Box<SimulationError>,
    },
}

// ---------------------------------------------------------------------------
// Construction errors
// ---------------------------------------------------------------------------

/// A problem found while building an infrastructure or registering a train.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown {kind} `{name}`")]
    UnknownName { kind: &'static str, name: String },
    #[error("duplicate {kind} `{name}`")]
    DuplicateName { kind: &'static str, name: String },
    #[error("unknown track section {0:?}")]
    UnknownTrackSection(TrackSectionId),
    #[error("unknown waypoint {0:?}")]
    UnknownWaypoint(WaypointId),
    #[error("{kind} `{name}` at offset {offset} lies outside its track of length {length}")]
    OffsetOutOfRange {
        kind: &'static str,
        name: String,
        offset: f64,
        length: f64,
    },
    #[error("track endpoint {0} is connected twice")]
    EndpointConnectedTwice(String),
    #[error("{what} must be positive, got {value}")]
    NonPositive { what: String, value: f64 },
    #[error("route `{route}` has no TVD path between {from:?} and {to:?}")]
    NoTvdPath {
        route: String,
        from: WaypointId,
        to: WaypointId,
    },
    #[error("route `{0}` needs at least two waypoints")]
    EmptyRoute(String),
    #[error("route `{route}` needs switch {switch:?} in two positions")]
    ConflictingSwitchPositions { route: String, switch: SwitchId },
    #[error("TVD path {0:?} belongs to no TVD section")]
    UnassignedTvdPath(TvdPathId),
    #[error("in {context}: expected {expected:?}, found {found:?}")]
    TypeMismatch {
        context: String,
        expected: ValueType,
        found: ValueType,
    },
    #[error("function `{function}` takes {expected} arguments, got {found}")]
    ArityMismatch {
        function: String,
        expected: usize,
        found: usize,
    },
    #[error("argument `{0}` used outside of a function body")]
    ArgumentOutsideFunction(String),
    #[error("function `{0}` calls itself")]
    FunctionCycle(String),
    #[error("signal `{0}` depends on itself")]
    SignalCycle(String),
    #[error("train schedule has an empty route path")]
    EmptyRoutePath,
    #[error("unknown route {0:?}")]
    UnknownRoute(RouteId),
    #[error("route {from:?} does not end where route {to:?} starts")]
    DisconnectedRoutePath { from: RouteId, to: RouteId },
    #[error("initial position {position} must lie within [{min}, {max}]")]
    InvalidInitialPosition { position: f64, min: f64, max: f64 },
    #[error("invalid rolling stock: {0}")]
    InvalidRollingStock(String),
    #[error("train schedule has no phases")]
    NoPhases,
    #[error("phase {index} is invalid: {reason}")]
    InvalidPhase { index: usize, reason: String },
}

/// Every construction problem found in one pass.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{} validation error(s): {}", .0.len(), join_errors(.0))]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    pub fn contains(&self, predicate: impl Fn(&ValidationError) -> bool) -> bool {
        self.0.iter().any(predicate)
    }
}

impl From<ValidationError> for ValidationErrors {
    fn from(error: ValidationError) -> Self {
        Self(vec![error])
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
