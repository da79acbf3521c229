//! Train movement driven by the kernel.
//!
//! A rolling train always has at most one pending event: the plan to reach
//! its next interaction or to come to rest. Whatever changes its constraints
//! (a sighted signal changing aspect, new advisories) cancels that plan,
//! brings the train up to the current time and plans again.

use std::collections::BTreeSet;

use log::{debug, info, warn};

use crate::change::{Change, TrainStateChange};
use crate::config::SimConfig;
use crate::engine::Simulation;
use crate::error::SimulationError;
use crate::expr::AspectSet;
use crate::id::*;
use crate::infra::Infra;
use crate::interlocking::RouteStatus;
use crate::kernel::EventValue;

use super::evolve::{EvolveOutcome, POSITION_EPSILON, PlanOutcome};
use super::speed::SpeedController;
use super::state::{
    Interaction, InteractionAction, InteractionKind, PhaseState, TrainPlan, TrainState,
    TrainStatus, TrajectorySample,
};
use super::{Phase, Train};

/// What interrupts a rolling train.
enum Interruption {
    Signals(BTreeSet<SignalId>),
    Advisories(Vec<SpeedController>),
}

impl Train {
    /// Update the directive of the sighted path signal `index` from the
    /// aspects it shows. The most restrictive aspect speed applies; a stop
    /// aspect asks for a halt `signal_stop_margin` before the signal.
    pub fn set_aspect_constraints(
        &self,
        state: &mut TrainState,
        index: usize,
        aspects: &AspectSet,
        infra: &Infra,
        config: &SimConfig,
    ) {
        let Some(signal) = self.path.signals.get(index) else {
            return;
        };
        let limit = aspects
            .iter()
            .filter_map(|&aspect| infra.aspect(aspect).speed_limit)
            .fold(f64::INFINITY, f64::min);
        if limit.is_infinite() {
            state.signal_controllers.remove(&index);
            return;
        }
        let target_position = if limit <= 0.0 {
            signal.position - config.signal_stop_margin
        } else {
            signal.position
        };
        state.signal_controllers.insert(
            index,
            SpeedController::LimitAnnounce {
                target_speed: limit.max(0.0),
                target_position,
                gamma: self.rolling_stock.gamma,
                end: f64::INFINITY,
            },
        );
    }
}

fn shows_stop(aspects: &AspectSet, infra: &Infra) -> bool {
    aspects
        .iter()
        .any(|&aspect| infra.aspect(aspect).speed_limit.is_some_and(|limit| limit <= 0.0))
}

impl Simulation {
    /// Replace the external speed directives of a train. A rolling train
    /// replans from the current time.
    pub fn set_speed_advisories(
        &mut self,
        train: TrainId,
        advisories: Vec<SpeedController>,
    ) -> Result<(), SimulationError> {
        self.guarded(|sim| {
            if sim.train_ref(train)?.state.is_active() {
                return sim.interrupt(train, Interruption::Advisories(advisories));
            }
            let mut state = sim.train_ref(train)?.state.clone();
            state.advisories = advisories;
            sim.commit_train_state(train, state, Vec::new())
        })
    }

    pub(crate) fn train_ref(&self, train: TrainId) -> Result<&Train, SimulationError> {
        self.trains.get(train).ok_or(SimulationError::UnknownTrain(train))
    }

    fn commit_train_state(
        &mut self,
        train: TrainId,
        state: TrainState,
        samples: Vec<TrajectorySample>,
    ) -> Result<(), SimulationError> {
        self.commit(Change::TrainState(Box::new(TrainStateChange {
            train,
            state,
            samples,
        })))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Event handlers
    // -----------------------------------------------------------------------

    /// Claim the first routes and start rolling once the first one is
    /// reserved for the train.
    pub(crate) fn depart(&mut self, id: TrainId) -> Result<(), SimulationError> {
        let train = self.train_ref(id)?;
        if !matches!(
            train.state.status,
            TrainStatus::Scheduled | TrainStatus::AwaitingRoute
        ) {
            return Ok(());
        }
        let routes: Vec<RouteId> = train.path.routes.iter().take(2).copied().collect();
        for &route in &routes {
            self.request_route_for(route, Some(id))?;
        }

        let route = self.state.route(routes[0]);
        let ready = route.status == RouteStatus::Reserved && route.holder == Some(id);
        let train = self.train_ref(id)?;
        let mut state = train.state.clone();
        state.time = self.time();
        if !ready {
            if state.status != TrainStatus::AwaitingRoute {
                warn!(
                    "train {} waits for route {} at t={}",
                    train.name,
                    self.infra.route(routes[0]).name,
                    self.time()
                );
                state.status = TrainStatus::AwaitingRoute;
                self.commit_train_state(id, state, Vec::new())?;
            }
            return Ok(());
        }

        let sections = train
            .path
            .sections_between(state.location.tail(), state.location.head);
        info!(
            "train {} departs at t={} from {:.1} m",
            train.name,
            self.time(),
            state.location.head
        );
        let sample = TrajectorySample {
            time: state.time,
            position: state.location.head,
            speed: state.speed,
        };
        state.status = TrainStatus::Rolling;
        self.commit_train_state(id, state, vec![sample])?;
        for section in sections {
            self.occupy_section(section, id)?;
        }
        self.process_interactions(id)?;
        self.replan(id)
    }

    pub(crate) fn on_action_point(&mut self, id: TrainId, plan: &TrainPlan) -> Result<(), SimulationError> {
        self.commit_train_state(id, plan.state.clone(), plan.samples.clone())?;
        self.process_interactions(id)?;
        self.replan(id)
    }

    pub(crate) fn on_train_stopped(&mut self, id: TrainId, plan: &TrainPlan) -> Result<(), SimulationError> {
        self.commit_train_state(id, plan.state.clone(), plan.samples.clone())?;
        self.process_interactions(id)?;
        self.replan(id)
    }

    pub(crate) fn on_stop_ends(&mut self, id: TrainId, plan: &TrainPlan) -> Result<(), SimulationError> {
        let train = self.train_ref(id)?;
        let mut state = plan.state.clone();
        if state.phase_index + 1 < train.phases.len() {
            state.phase_index += 1;
            state.phase = train.phase_state(state.phase_index);
            debug!("train {} leaves its stop at t={}", train.name, state.time);
        } else {
            state.status = TrainStatus::ReachedDestination;
            info!("train {} reached its destination at t={}", train.name, state.time);
        }
        self.commit_train_state(id, state, plan.samples.clone())?;
        self.replan(id)
    }

    /// Signals a train has sighted changed aspect.
    pub(crate) fn on_signals_changed(
        &mut self,
        id: TrainId,
        signals: BTreeSet<SignalId>,
    ) -> Result<(), SimulationError> {
        if !self.train_ref(id)?.state.is_active() {
            return Ok(());
        }
        self.interrupt(id, Interruption::Signals(signals))
    }

    // -----------------------------------------------------------------------
    // Interactions
    // -----------------------------------------------------------------------

    /// Handle every interaction the head has reached, in order.
    fn process_interactions(&mut self, id: TrainId) -> Result<(), SimulationError> {
        loop {
            let train = self.train_ref(id)?;
            let head = train.state.location.head;
            let Some(&interaction) = train.state.interactions.front() else {
                return Ok(());
            };
            if interaction.position > head + POSITION_EPSILON {
                return Ok(());
            }
            let mut state = train.state.clone();
            state.interactions.pop_front();
            self.interact(id, state, interaction)?;
        }
    }

    /// Commit `state` updated by `interaction`, then apply the interaction's
    /// effects on the interlocking.
    fn interact(
        &mut self,
        id: TrainId,
        mut state: TrainState,
        interaction: Interaction,
    ) -> Result<(), SimulationError> {
        let infra = self.infra.clone();
        let train = self.train_ref(id)?;
        match interaction.action {
            InteractionAction::Detector { boundary } => {
                let b = train.path.boundaries[boundary];
                let behind = &train.path.segments[b.behind];
                let ahead = &train.path.segments[b.ahead()];
                let (behind_section, ahead_section) = (behind.section, ahead.section);
                if interaction.kind == InteractionKind::Tail {
                    self.commit_train_state(id, state, Vec::new())?;
                    if behind_section != ahead_section {
                        self.free_section(behind_section, id)?;
                    }
                    return Ok(());
                }
                let mut next_route = None;
                if ahead.route_index != state.route_index {
                    state.route_index = ahead.route_index;
                    next_route = train.path.routes.get(ahead.route_index + 1).copied();
                }
                self.commit_train_state(id, state, Vec::new())?;
                if behind_section != ahead_section {
                    self.occupy_section(ahead_section, id)?;
                }
                if let Some(route) = next_route {
                    self.request_route_for(route, Some(id))?;
                }
            }
            InteractionAction::Signal { index } => {
                let signal = train.path.signals[index].signal;
                let aspects = &self.state.signal(signal).aspects;
                if interaction.kind == InteractionKind::Seen {
                    state.seen_signals.insert(index);
                    train.set_aspect_constraints(&mut state, index, aspects, &infra, &self.config);
                    self.commit_train_state(id, state, Vec::new())?;
                    return self.subscribe_signal(signal, id);
                }
                state.seen_signals.remove(&index);
                state.signal_controllers.retain(|&k, _| k > index);
                if state.status == TrainStatus::Rolling && shows_stop(aspects, &infra) {
                    warn!(
                        "train {} passed signal {} at stop at t={}",
                        train.name,
                        infra.signal(signal).name,
                        state.time
                    );
                    state.status = TrainStatus::Emergency;
                }
                self.commit_train_state(id, state, Vec::new())?;
                self.unsubscribe_signal(signal, id)?;
            }
            InteractionAction::PhaseEnd { phase } => {
                if phase == state.phase_index {
                    if phase + 1 < train.phases.len() {
                        state.phase_index += 1;
                        state.phase = train.phase_state(state.phase_index);
                    } else {
                        state.phase = PhaseState::Arriving;
                    }
                }
                self.commit_train_state(id, state, Vec::new())?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Planning
    // -----------------------------------------------------------------------

    /// Schedule the train's next event from its committed state.
    fn replan(&mut self, id: TrainId) -> Result<(), SimulationError> {
        let now = self.time();
        let train = self.train_ref(id)?;
        if !train.state.is_active() {
            return Ok(());
        }
        let entity = EntityId::Train(id);
        match train.plan(&self.config)? {
            PlanOutcome::Reached(plan) => {
                let time = plan.state.time.max(now);
                self.schedule_internal(
                    entity,
                    time,
                    EventValue::TrainReachesActionPoint { plan: Box::new(plan) },
                )?;
            }
            PlanOutcome::Stopped(plan) => {
                let time = plan.state.time.max(now);
                self.schedule_internal(entity, time, EventValue::TrainStopped { plan: Box::new(plan) })?;
            }
            PlanOutcome::Idle => {
                let mut state = train.state.clone();
                match state.phase {
                    PhaseState::Stop { until: None } => {
                        let duration = match train.phases.get(state.phase_index) {
                            Some(Phase::Stop { duration }) => *duration,
                            _ => 0.0,
                        };
                        let until = now + duration;
                        debug!("train {} stops until t={}", train.name, until);
                        state.time = now;
                        state.phase = PhaseState::Stop { until: Some(until) };
                        let mut planned = state.clone();
                        planned.time = until;
                        self.commit_train_state(id, state, Vec::new())?;
                        self.schedule_stop_end(id, planned, until)?;
                    }
                    PhaseState::Stop { until: Some(until) } => {
                        let until = until.max(now);
                        state.time = until;
                        self.schedule_stop_end(id, state, until)?;
                    }
                    PhaseState::Arriving => {
                        info!("train {} reached its destination at t={}", train.name, now);
                        state.time = now;
                        state.status = TrainStatus::ReachedDestination;
                        self.commit_train_state(id, state, Vec::new())?;
                    }
                    PhaseState::Navigate { .. } => {
                        debug!(
                            "train {} holds at {:.1} m from t={}",
                            train.name, state.location.head, now
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn schedule_stop_end(&mut self, id: TrainId, state: TrainState, until: f64) -> Result<(), SimulationError> {
        self.schedule_internal(
            EntityId::Train(id),
            until,
            EventValue::TrainStopEnds {
                plan: Box::new(TrainPlan {
                    state,
                    samples: Vec::new(),
                }),
            },
        )?;
        Ok(())
    }

    /// Cancel the train's pending plan, evolve it up to now under its old
    /// constraints, apply the new ones and plan again.
    fn interrupt(&mut self, id: TrainId, interruption: Interruption) -> Result<(), SimulationError> {
        let pending: Vec<EventId> = self.timeline.pending_for(EntityId::Train(id)).collect();
        for event in pending {
            self.cancel_internal(event)?;
        }

        let now = self.time();
        loop {
            let train = self.train_ref(id)?;
            let mut state = train.state.clone();
            let mut samples = Vec::new();
            let target = state.next_interaction().map(|i| i.position);
            let limit = target.unwrap_or(train.path.length);
            let outcome = train.evolve_until_either(&mut state, &mut samples, limit, now, &self.config)?;
            let reached = outcome == EvolveOutcome::ReachedPosition && target.is_some();
            if !reached {
                if outcome == EvolveOutcome::ReachedPosition {
                    state.speed = 0.0;
                }
                state.time = now;
            }
            self.commit_train_state(id, state, samples)?;
            if !reached {
                break;
            }
            self.process_interactions(id)?;
        }

        let train = self.train_ref(id)?;
        let mut state = train.state.clone();
        match interruption {
            Interruption::Signals(signals) => {
                for (index, path_signal) in train.path.signals.iter().enumerate() {
                    if signals.contains(&path_signal.signal) && state.seen_signals.contains(&index) {
                        let aspects = &self.state.signal(path_signal.signal).aspects;
                        train.set_aspect_constraints(&mut state, index, aspects, &self.infra, &self.config);
                    }
                }
            }
            Interruption::Advisories(advisories) => state.advisories = advisories,
        }
        self.commit_train_state(id, state, Vec::new())?;
        self.replan(id)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
