//! Numerical evolution of a train between two kernel events.

use log::trace;

use crate::config::SimConfig;
use crate::error::SimulationError;
use crate::kinematics::{Action, TrainPhysicsIntegrator};
use crate::sim::SimTime;

use super::speed::{DecisionContext, SpeedController, merge_directives};
use super::state::{PhaseState, TrainPlan, TrainState, TrainStatus, TrajectorySample};
use super::{Phase, Train};

/// Positions closer than this are the same position.
pub(crate) const POSITION_EPSILON: f64 = 1e-6;

/// A train at rest this close to its target has arrived.
const ARRIVAL_TOLERANCE: f64 = 1e-3;

const TIME_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvolveOutcome {
    ReachedPosition,
    ReachedTime,
    /// Came to rest before reaching either bound.
    Stopped,
}

/// What a train does next, from its committed state.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    /// Reaches its next interaction.
    Reached(TrainPlan),
    /// Comes to rest on the way.
    Stopped(TrainPlan),
    /// Does not move until something changes.
    Idle,
}

impl Train {
    /// Speed constraint of the current phase.
    fn phase_controller(&self, state: &TrainState) -> Option<SpeedController> {
        match state.phase {
            PhaseState::Navigate { end } => {
                let stops_at_end = !matches!(
                    self.phases.get(state.phase_index + 1),
                    Some(Phase::Navigate { .. })
                );
                stops_at_end.then_some(SpeedController::LimitAnnounce {
                    target_speed: 0.0,
                    target_position: end,
                    gamma: self.rolling_stock.gamma,
                    end: f64::INFINITY,
                })
            }
            PhaseState::Stop { .. } | PhaseState::Arriving => Some(SpeedController::MaxSpeed {
                speed: 0.0,
                begin: f64::NEG_INFINITY,
                end: f64::INFINITY,
            }),
        }
    }

    /// The most restrictive directive over every active constraint.
    pub fn directive(&self, state: &TrainState, dt: f64) -> f64 {
        let phase = self.phase_controller(state);
        let controllers = self
            .static_controllers
            .iter()
            .chain(&state.advisories)
            .chain(state.signal_controllers.values())
            .chain(phase.iter());
        merge_directives(controllers, state.location.head, state.speed, dt)
    }

    /// Integrate one step of at most `dt` seconds and `max_distance` meters.
    pub fn step(
        &self,
        state: &mut TrainState,
        samples: &mut Vec<TrajectorySample>,
        dt: f64,
        max_distance: f64,
    ) {
        let head = state.location.head;
        let grade = self.path.max_grade(state.location.tail(), head);
        let integrator = TrainPhysicsIntegrator::new(dt, &self.rolling_stock, state.speed, grade);
        let directive = self.directive(state, dt);
        let action = if state.status == TrainStatus::Emergency {
            Action::EmergencyBrake
        } else {
            self.decision_maker.choose_action(&DecisionContext {
                integrator: &integrator,
                position: head,
                speed: state.speed,
                directive,
            })
        };
        let update = integrator.compute_update(action, max_distance);
        state.location.head += update.position_delta;
        state.speed = update.speed;
        state.time += update.time_delta;
        trace!(
            "{}: t={:.3} head={:.3} v={:.4} directive={:.4} {:?}",
            self.name, state.time, state.location.head, state.speed, directive, action
        );
        samples.push(TrajectorySample {
            time: state.time,
            position: state.location.head,
            speed: state.speed,
        });
    }

    pub fn evolve_until_position(
        &self,
        state: &mut TrainState,
        samples: &mut Vec<TrajectorySample>,
        position: f64,
        config: &SimConfig,
    ) -> Result<EvolveOutcome, SimulationError> {
        self.evolve_until_either(state, samples, position, f64::INFINITY, config)
    }

    pub fn evolve_until_time(
        &self,
        state: &mut TrainState,
        samples: &mut Vec<TrajectorySample>,
        time: SimTime,
        config: &SimConfig,
    ) -> Result<EvolveOutcome, SimulationError> {
        self.evolve_until_either(state, samples, f64::INFINITY, time, config)
    }

    /// Step until the head reaches `position`, the clock reaches `time` or
    /// the train comes to rest, whichever happens first.
    pub fn evolve_until_either(
        &self,
        state: &mut TrainState,
        samples: &mut Vec<TrajectorySample>,
        position: f64,
        time: SimTime,
        config: &SimConfig,
    ) -> Result<EvolveOutcome, SimulationError> {
        let mut steps = 0;
        loop {
            let remaining = position - state.location.head;
            if remaining <= POSITION_EPSILON {
                state.location.head = state.location.head.max(position);
                return Ok(EvolveOutcome::ReachedPosition);
            }
            if state.time >= time - TIME_EPSILON {
                return Ok(EvolveOutcome::ReachedTime);
            }
            if steps > 0 && state.speed < config.stopped_speed_epsilon {
                if remaining <= ARRIVAL_TOLERANCE {
                    state.location.head = position;
                    return Ok(EvolveOutcome::ReachedPosition);
                }
                return Ok(EvolveOutcome::Stopped);
            }
            if steps >= config.max_integration_steps {
                return Err(SimulationError::IntegrationDiverged { steps });
            }
            let dt = config.time_step.min(time - state.time);
            self.step(state, samples, dt, remaining);
            steps += 1;
        }
    }

    /// Evolve the committed state up to the next interaction.
    pub fn plan(&self, config: &SimConfig) -> Result<PlanOutcome, SimulationError> {
        let mut state = self.state.clone();
        let mut samples = Vec::new();
        let target = state.next_interaction().map(|i| i.position);
        let limit = target.unwrap_or(self.path.length);
        let outcome = self.evolve_until_position(&mut state, &mut samples, limit, config)?;
        let moved = (state.location.head - self.state.location.head).abs() >= POSITION_EPSILON;

        Ok(match outcome {
            EvolveOutcome::ReachedPosition if target.is_some() => {
                PlanOutcome::Reached(TrainPlan { state, samples })
            }
            // End of the path: the train halts there.
            EvolveOutcome::ReachedPosition | EvolveOutcome::ReachedTime => {
                if samples.is_empty() {
                    PlanOutcome::Idle
                } else {
                    state.speed = 0.0;
                    if let Some(last) = samples.last_mut() {
                        last.speed = 0.0;
                    }
                    PlanOutcome::Stopped(TrainPlan { state, samples })
                }
            }
            EvolveOutcome::Stopped if moved => PlanOutcome::Stopped(TrainPlan { state, samples }),
            EvolveOutcome::Stopped => PlanOutcome::Idle,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::TrainSchedule;
    use crate::test_utils::*;

    fn rolling_train(schedule: TrainSchedule) -> (Train, SimConfig) {
        let infra = line_infra(3, 1000.0);
        let config = SimConfig::default();
        let mut train = Train::new(schedule, &infra, &config).unwrap();
        train.state.status = TrainStatus::Rolling;
        (train, config)
    }

    fn line_schedule() -> TrainSchedule {
        let infra = line_infra(3, 1000.0);
        TrainSchedule::new("t", fast_rolling_stock(), line_routes(&infra, 3))
    }

    // -----------------------------------------------------------------------
    // Test 1: Accelerating from rest
    // -----------------------------------------------------------------------
    #[test]
    fn train_accelerates_towards_first_interaction() {
        let (train, config) = rolling_train(line_schedule().starting_at(500.0, 0.0).navigate_to(2800.0));
        let PlanOutcome::Reached(plan) = train.plan(&config).unwrap() else {
            panic!("expected to reach the first interaction");
        };
        // The first interaction is the sighting of the signal at 1000 m.
        assert!((plan.state.location.head - 600.0).abs() < 1e-9);
        assert!(plan.state.speed > 0.0);
        assert!(plan.state.time > 0.0);
        assert!(plan.samples.windows(2).all(|w| w[1].time >= w[0].time));
        assert!(plan.samples.windows(2).all(|w| w[1].position >= w[0].position));
    }

    // -----------------------------------------------------------------------
    // Test 2: Stopping on a target
    // -----------------------------------------------------------------------
    #[test]
    fn stop_converges_without_going_negative() {
        let (mut train, config) = rolling_train(line_schedule().starting_at(500.0, 0.0).navigate_to(900.0));
        train.state.speed = 15.0;
        let mut state = train.state.clone();
        let mut samples = Vec::new();
        let outcome = train
            .evolve_until_position(&mut state, &mut samples, 2000.0, &config)
            .unwrap();
        assert_eq!(outcome, EvolveOutcome::Stopped);
        assert!(state.speed < 1e-6);
        assert!(samples.iter().all(|s| s.speed >= 0.0));
        assert!((state.location.head - 900.0).abs() < 0.5);
    }

    // -----------------------------------------------------------------------
    // Test 3: Time-bounded evolution
    // -----------------------------------------------------------------------
    #[test]
    fn evolve_until_time_stops_on_time() {
        let (train, config) = rolling_train(line_schedule().starting_at(500.0, 0.0).navigate_to(2800.0));
        let mut state = train.state.clone();
        let mut samples = Vec::new();
        let outcome = train
            .evolve_until_time(&mut state, &mut samples, 4.5, &config)
            .unwrap();
        assert_eq!(outcome, EvolveOutcome::ReachedTime);
        assert!((state.time - 4.5).abs() < 1e-9);
        assert_eq!(samples.len(), 5);
    }

    #[test]
    fn train_at_rest_under_stop_directive_is_idle() {
        let (mut train, config) = rolling_train(line_schedule().starting_at(500.0, 0.0).navigate_to(2800.0));
        train.state.phase = PhaseState::Stop { until: None };
        assert_eq!(train.plan(&config).unwrap(), PlanOutcome::Idle);
    }

    // -----------------------------------------------------------------------
    // Test 4: Iteration cap
    // -----------------------------------------------------------------------
    #[test]
    fn runaway_integration_is_fatal() {
        let (train, _) = rolling_train(line_schedule().starting_at(500.0, 0.0).navigate_to(2800.0));
        let config = SimConfig {
            max_integration_steps: 3,
            ..SimConfig::default()
        };
        let mut state = train.state.clone();
        let result = train.evolve_until_position(&mut state, &mut Vec::new(), 2800.0, &config);
        assert!(matches!(result, Err(SimulationError::IntegrationDiverged { steps: 3 })));
    }

    #[test]
    fn emergency_brakes_regardless_of_directive() {
        let (mut train, config) = rolling_train(line_schedule().starting_at(500.0, 0.0).navigate_to(2800.0));
        train.state.speed = 10.0;
        train.state.status = TrainStatus::Emergency;
        let mut state = train.state.clone();
        let mut samples = Vec::new();
        train.step(&mut state, &mut samples, config.time_step, f64::INFINITY);
        assert!(state.speed < 10.0);
    }
}
