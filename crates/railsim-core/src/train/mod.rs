//! Trains: schedules, paths, state snapshots and movement.
//!
//! A train follows a fixed list of routes through a list of phases. Between
//! kernel events it is integrated forward in time by [`Train::step`]; the
//! points where something must happen (a detector crossing, a signal coming
//! into sight, the end of a phase) are its *interactions*, and each one the
//! train reaches becomes a kernel event.

mod evolve;
mod movement;
mod path;
mod speed;
mod state;

pub use evolve::{EvolveOutcome, PlanOutcome};
pub use path::{PathBoundary, PathRange, PathSegment, PathSignal, TrainPath};
pub use speed::{DecisionContext, DecisionMaker, ObeyDirective, SpeedController, merge_directives};
pub use state::{
    Interaction, InteractionAction, InteractionKind, PhaseState, PositionTracker, TrainPlan,
    TrainState, TrainStatus, TrajectorySample, sort_interactions,
};

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::SimConfig;
use crate::error::{ValidationError, ValidationErrors};
use crate::id::RouteId;
use crate::infra::Infra;
use crate::kinematics::RollingStock;
use crate::sim::{SimTime, StateHash};

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Phase {
    /// Drive until the head reaches `end_position` along the path.
    Navigate { end_position: f64 },
    /// Come to rest and stay for `duration` seconds.
    Stop { duration: f64 },
}

/// Everything needed to register a train.
#[derive(Debug)]
pub struct TrainSchedule {
    pub name: String,
    pub rolling_stock: RollingStock,
    pub departure_time: SimTime,
    pub routes: Vec<RouteId>,
    /// Head position along the path at departure.
    pub initial_position: f64,
    pub initial_speed: f64,
    pub phases: Vec<Phase>,
    /// External speed directives, merged with every other constraint.
    pub advisories: Vec<SpeedController>,
    pub decision_maker: Box<dyn DecisionMaker>,
}

impl TrainSchedule {
    /// A train departing at t=0 from rest, its tail on the entry of the
    /// first route, with no phases yet.
    pub fn new(name: &str, rolling_stock: RollingStock, routes: Vec<RouteId>) -> Self {
        Self {
            name: name.to_string(),
            initial_position: rolling_stock.length,
            rolling_stock,
            departure_time: 0.0,
            routes,
            initial_speed: 0.0,
            phases: Vec::new(),
            advisories: Vec::new(),
            decision_maker: Box::new(ObeyDirective),
        }
    }

    pub fn departing_at(mut self, time: SimTime) -> Self {
        self.departure_time = time;
        self
    }

    pub fn starting_at(mut self, position: f64, speed: f64) -> Self {
        self.initial_position = position;
        self.initial_speed = speed;
        self
    }

    pub fn navigate_to(mut self, end_position: f64) -> Self {
        self.phases.push(Phase::Navigate { end_position });
        self
    }

    pub fn stop_for(mut self, duration: f64) -> Self {
        self.phases.push(Phase::Stop { duration });
        self
    }

    pub fn with_advisories(mut self, advisories: Vec<SpeedController>) -> Self {
        self.advisories = advisories;
        self
    }

    pub fn with_decision_maker(mut self, decision_maker: Box<dyn DecisionMaker>) -> Self {
        self.decision_maker = decision_maker;
        self
    }
}

// ---------------------------------------------------------------------------
// Train
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Train {
    pub name: String,
    pub rolling_stock: RollingStock,
    pub departure_time: SimTime,
    pub phases: Vec<Phase>,
    pub path: TrainPath,
    /// Latest committed snapshot.
    pub state: TrainState,
    pub trajectory: Vec<TrajectorySample>,
    /// Rolling stock and track speed limits.
    pub static_controllers: Vec<SpeedController>,
    pub decision_maker: Box<dyn DecisionMaker>,
}

impl Train {
    /// Validate a schedule against an infrastructure and build the train in
    /// its initial state. Every problem found is reported.
    pub fn new(schedule: TrainSchedule, infra: &Infra, config: &SimConfig) -> Result<Self, ValidationErrors> {
        let mut errors = schedule.rolling_stock.validate();
        let path = match TrainPath::new(infra, &schedule.routes) {
            Ok(path) => Some(path),
            Err(path_errors) => {
                errors.extend(path_errors.0);
                None
            }
        };
        let length = schedule.rolling_stock.length;
        let head = schedule.initial_position;

        if let Some(path) = &path {
            let max = path.route_end(0);
            if !(head >= length && head <= max) {
                errors.push(ValidationError::InvalidInitialPosition {
                    position: head,
                    min: length,
                    max,
                });
            }
        }
        if !(schedule.initial_speed >= 0.0 && schedule.initial_speed.is_finite()) {
            errors.push(ValidationError::NonPositive {
                what: "initial speed".to_string(),
                value: schedule.initial_speed,
            });
        }
        if schedule.phases.is_empty() {
            errors.push(ValidationError::NoPhases);
        }
        let mut previous_end = head;
        for (index, phase) in schedule.phases.iter().enumerate() {
            let reason = match *phase {
                Phase::Navigate { end_position } => {
                    let reason = if end_position <= previous_end {
                        Some(format!("end position {end_position} is not past {previous_end}"))
                    } else if path.as_ref().is_some_and(|p| end_position > p.length) {
                        Some(format!("end position {end_position} lies past the end of the path"))
                    } else {
                        None
                    };
                    previous_end = end_position;
                    reason
                }
                Phase::Stop { duration } if !(duration >= 0.0 && duration.is_finite()) => {
                    Some(format!("stop duration {duration} is not a finite non-negative number"))
                }
                Phase::Stop { .. } => None,
            };
            if let Some(reason) = reason {
                errors.push(ValidationError::InvalidPhase { index, reason });
            }
        }

        let Some(path) = path else {
            return Err(ValidationErrors(errors));
        };
        if !errors.is_empty() {
            return Err(ValidationErrors(errors));
        }

        let rolling_stock = schedule.rolling_stock;
        let mut static_controllers = vec![SpeedController::MaxSpeed {
            speed: rolling_stock.max_speed,
            begin: f64::NEG_INFINITY,
            end: f64::INFINITY,
        }];
        for range in &path.ranges {
            if let Some(limit) = range.speed_limit {
                static_controllers.push(SpeedController::LimitAnnounce {
                    target_speed: limit,
                    target_position: range.begin,
                    gamma: rolling_stock.gamma,
                    end: range.end + rolling_stock.length,
                });
            }
        }

        let mut train = Self {
            name: schedule.name,
            departure_time: schedule.departure_time,
            phases: schedule.phases,
            state: TrainState {
                time: schedule.departure_time,
                speed: schedule.initial_speed,
                status: TrainStatus::Scheduled,
                phase_index: 0,
                phase: PhaseState::Arriving,
                location: PositionTracker {
                    head,
                    length: rolling_stock.length,
                },
                interactions: VecDeque::new(),
                route_index: 0,
                signal_controllers: BTreeMap::new(),
                seen_signals: BTreeSet::new(),
                advisories: schedule.advisories,
            },
            path,
            rolling_stock,
            trajectory: Vec::new(),
            static_controllers,
            decision_maker: schedule.decision_maker,
        };
        train.state.phase = train.phase_state(0);
        train.state.interactions = train.initial_interactions(infra, config.driver_sight_distance);
        Ok(train)
    }

    /// Initial progress state of a phase.
    pub fn phase_state(&self, index: usize) -> PhaseState {
        match self.phases.get(index) {
            Some(Phase::Navigate { end_position }) => PhaseState::Navigate { end: *end_position },
            Some(Phase::Stop { .. }) => PhaseState::Stop { until: None },
            None => PhaseState::Arriving,
        }
    }

    /// Every interaction ahead of the initial head position, sorted.
    pub(crate) fn initial_interactions(&self, infra: &Infra, driver_sight: f64) -> VecDeque<Interaction> {
        let head = self.state.location.head;
        let length = self.rolling_stock.length;
        let mut interactions = Vec::new();

        for (boundary, b) in self.path.boundaries.iter().enumerate() {
            let action = InteractionAction::Detector { boundary };
            if b.position >= head {
                interactions.push(Interaction {
                    position: b.position,
                    kind: InteractionKind::Head,
                    action,
                });
            }
            let tail_crossing = b.position + length;
            if tail_crossing > head && tail_crossing <= self.path.length {
                interactions.push(Interaction {
                    position: tail_crossing,
                    kind: InteractionKind::Tail,
                    action,
                });
            }
        }

        for (index, signal) in self.path.signals.iter().enumerate() {
            if signal.position <= head {
                continue;
            }
            let sight = infra.signal(signal.signal).sight_distance.min(driver_sight);
            let action = InteractionAction::Signal { index };
            interactions.push(Interaction {
                position: (signal.position - sight).max(0.0),
                kind: InteractionKind::Seen,
                action,
            });
            interactions.push(Interaction {
                position: signal.position,
                kind: InteractionKind::Head,
                action,
            });
        }

        for (phase, p) in self.phases.iter().enumerate() {
            if let Phase::Navigate { end_position } = *p {
                interactions.push(Interaction {
                    position: end_position,
                    kind: InteractionKind::Head,
                    action: InteractionAction::PhaseEnd { phase },
                });
            }
        }

        sort_interactions(&mut interactions);
        interactions.into()
    }

    pub fn hash_into(&self, hash: &mut StateHash) {
        self.state.hash_into(hash);
        hash.write_u64(self.trajectory.len() as u64);
        if let Some(last) = self.trajectory.last() {
            hash.write_f64(last.time);
            hash.write_f64(last.position);
            hash.write_f64(last.speed);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    // -----------------------------------------------------------------------
    // Test 1: A valid schedule builds a train
    // -----------------------------------------------------------------------
    #[test]
    fn valid_schedule_builds_train_with_interactions() {
        let infra = line_infra(3, 1000.0);
        let schedule = TrainSchedule::new("t", fast_rolling_stock(), line_routes(&infra, 3))
            .starting_at(500.0, 0.0)
            .navigate_to(2800.0);
        let train = Train::new(schedule, &infra, &SimConfig::default()).unwrap();
        assert_eq!(train.state.status, TrainStatus::Scheduled);
        assert_eq!(train.state.phase, PhaseState::Navigate { end: 2800.0 });

        let interactions: Vec<(f64, InteractionKind)> = train
            .state
            .interactions
            .iter()
            .map(|i| (i.position, i.kind))
            .collect();
        // Head crossings at both detectors, tail crossings 400 m later,
        // two signals seen 400 m ahead, the phase end.
        assert_eq!(
            interactions,
            vec![
                (600.0, InteractionKind::Seen),
                (1000.0, InteractionKind::Head),
                (1000.0, InteractionKind::Head),
                (1400.0, InteractionKind::Tail),
                (1600.0, InteractionKind::Seen),
                (2000.0, InteractionKind::Head),
                (2000.0, InteractionKind::Head),
                (2400.0, InteractionKind::Tail),
                (2800.0, InteractionKind::Head),
            ]
        );
        // Signal passing comes before entering the section behind it.
        assert!(matches!(
            train.state.interactions[1].action,
            InteractionAction::Signal { .. }
        ));
        assert_eq!(train.static_controllers.len(), 1);
    }

    // -----------------------------------------------------------------------
    // Test 2: Schedule errors are collected
    // -----------------------------------------------------------------------
    #[test]
    fn invalid_schedule_reports_every_problem() {
        let infra = line_infra(2, 1000.0);
        let schedule = TrainSchedule::new("t", fast_rolling_stock(), line_routes(&infra, 2))
            .starting_at(1500.0, 0.0)
            .navigate_to(1200.0)
            .stop_for(-1.0)
            .navigate_to(9000.0);
        let errors = Train::new(schedule, &infra, &SimConfig::default()).unwrap_err();
        assert!(errors.contains(|e| matches!(e, ValidationError::InvalidInitialPosition { .. })));
        assert!(errors.contains(|e| matches!(e, ValidationError::InvalidPhase { index: 0, .. })));
        assert!(errors.contains(|e| matches!(e, ValidationError::InvalidPhase { index: 1, .. })));
        assert!(errors.contains(|e| matches!(e, ValidationError::InvalidPhase { index: 2, .. })));
    }

    #[test]
    fn schedule_without_phases_or_routes_is_rejected() {
        let infra = line_infra(2, 1000.0);
        let schedule = TrainSchedule::new("t", fast_rolling_stock(), vec![]);
        let errors = Train::new(schedule, &infra, &SimConfig::default()).unwrap_err();
        assert!(errors.contains(|e| matches!(e, ValidationError::EmptyRoutePath)));
        assert!(errors.contains(|e| matches!(e, ValidationError::NoPhases)));
    }

    #[test]
    fn bad_rolling_stock_is_rejected() {
        let infra = line_infra(2, 1000.0);
        let mut stock = fast_rolling_stock();
        stock.mass = 0.0;
        let schedule = TrainSchedule::new("t", stock, line_routes(&infra, 2)).navigate_to(1500.0);
        let errors = Train::new(schedule, &infra, &SimConfig::default()).unwrap_err();
        assert!(errors.contains(|e| matches!(e, ValidationError::InvalidRollingStock(_))));
    }

    // -----------------------------------------------------------------------
    // Test 3: Track speed limits become braking curves
    // -----------------------------------------------------------------------
    #[test]
    fn track_speed_limit_is_announced() {
        let infra = line_infra_with_limit(2, 1000.0, Some(20.0));
        let routes = line_routes(&infra, 2);
        let schedule = TrainSchedule::new("t", fast_rolling_stock(), routes).navigate_to(1900.0);
        let train = Train::new(schedule, &infra, &SimConfig::default()).unwrap();
        assert!(train.static_controllers.iter().any(|c| matches!(
            c,
            SpeedController::LimitAnnounce { target_speed, .. } if *target_speed == 20.0
        )));
    }
}
