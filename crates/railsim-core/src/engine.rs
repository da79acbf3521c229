//! The simulation: owns the timeline, the interlocking state and the trains,
//! and runs events one at a time.
//!
//! # Architecture
//!
//! The `Simulation` owns:
//! - The shared, immutable [`Infra`]
//! - A [`Timeline`] of pending events
//! - The [`InfraState`] of switches, routes, TVD sections and signals
//! - The trains, keyed by [`TrainId`]
//! - A [`ChangeLog`] and the registered [`ChangeObserver`]s
//!
//! # Mutation pipeline
//!
//! Nothing is mutated directly. Decision code builds a [`Change`] and hands
//! it to [`Simulation::commit`], which:
//! 1. **Registers** the change in the log
//! 2. **Applies** it to the timeline, the interlocking or a train
//! 3. **Publishes** it to observers
//!
//! After every event, and after every external request, the simulation
//! *settles*: signals reading changed routes or switches are re-evaluated,
//! trains waiting for their first route depart, and trains that sighted a
//! changed signal replan.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use log::{debug, error, info};
use slotmap::{Key, SlotMap};

use crate::change::{Change, ChangeLog, ChangeObserver};
use crate::config::SimConfig;
use crate::error::SimulationError;
use crate::id::*;
use crate::infra::Infra;
use crate::interlocking::{InfraState, RouteStatus};
use crate::kernel::{EventState, EventValue, Timeline, TimelineEvent};
use crate::sim::{SimTime, StateHash};
use crate::train::{Train, TrainSchedule, TrainStatus};

// ---------------------------------------------------------------------------
// Subsystem hashes
// ---------------------------------------------------------------------------

/// Per-subsystem state hashes. Pinpoints which part of two simulations
/// diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsystemHashes {
    pub timeline: u64,
    pub interlocking: u64,
    pub trains: u64,
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

pub struct Simulation {
    pub(crate) infra: Arc<Infra>,
    pub(crate) config: SimConfig,

    pub(crate) timeline: Timeline,
    pub(crate) state: InfraState,
    pub(crate) trains: SlotMap<TrainId, Train>,

    log: ChangeLog,
    observers: Vec<Box<dyn ChangeObserver>>,

    /// Set by the first fatal error. Every later operation fails.
    halted: bool,

    // -- Settling bookkeeping --
    /// Changed signals each subscribed train has not reacted to yet.
    pub(crate) pending_notifications: BTreeMap<TrainId, BTreeSet<SignalId>>,
    /// Routes and switches whose dependent signals need re-evaluation.
    pub(crate) dirty_routes: BTreeSet<RouteId>,
    pub(crate) dirty_switches: BTreeSet<SwitchId>,

    events_executed: u64,
}

impl Simulation {
    /// Build a simulation in its initial state: switches in their initial
    /// position, everything free and every signal evaluated.
    pub fn new(infra: Arc<Infra>, config: SimConfig) -> Result<Self, SimulationError> {
        let state = InfraState::new(&infra, &config)?;
        let mut timeline = Timeline::new();
        for index in 0..infra.switches.len() {
            timeline.register_entity(EntityId::Switch(SwitchId(index as u32)));
        }
        for index in 0..infra.routes.len() {
            timeline.register_entity(EntityId::Route(RouteId(index as u32)));
        }
        for index in 0..infra.tvd_sections.len() {
            timeline.register_entity(EntityId::TvdSection(TvdSectionId(index as u32)));
        }
        for index in 0..infra.signals.len() {
            timeline.register_entity(EntityId::Signal(SignalId(index as u32)));
        }
        Ok(Self {
            log: ChangeLog::new(config.record_changes),
            infra,
            config,
            timeline,
            state,
            trains: SlotMap::with_key(),
            observers: Vec::new(),
            halted: false,
            pending_notifications: BTreeMap::new(),
            dirty_routes: BTreeSet::new(),
            dirty_switches: BTreeSet::new(),
            events_executed: 0,
        })
    }

    // -----------------------------------------------------------------------
    // Trains
    // -----------------------------------------------------------------------

    /// Validate a schedule and register the train without scheduling its
    /// departure. Replay targets register their trains this way.
    pub fn register_train(&mut self, schedule: TrainSchedule) -> Result<TrainId, SimulationError> {
        if self.halted {
            return Err(SimulationError::Halted);
        }
        let train = Train::new(schedule, &self.infra, &self.config)?;
        info!(
            "registered train {} on {} routes, departing at t={}",
            train.name,
            train.path.routes.len(),
            train.departure_time
        );
        let id = self.trains.insert(train);
        self.timeline.register_entity(EntityId::Train(id));
        Ok(id)
    }

    /// Register a train and schedule its departure.
    pub fn add_train(&mut self, schedule: TrainSchedule) -> Result<TrainId, SimulationError> {
        let id = self.register_train(schedule)?;
        let departure = self.trains[id].departure_time;
        self.guarded(|sim| {
            sim.schedule_internal(EntityId::Train(id), departure, EventValue::TrainDeparture)
        })?;
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Change pipeline
    // -----------------------------------------------------------------------

    /// Register, apply and publish a change. Returns the id of the event a
    /// creation change created.
    pub(crate) fn commit(&mut self, change: Change) -> Result<Option<EventId>, SimulationError> {
        let index = self.log.register(&change);
        let created = self.apply(&change)?;
        self.log.publish(index);
        for observer in &mut self.observers {
            observer.on_change(index, &change);
        }
        Ok(created)
    }

    /// Apply a change without running any decision logic.
    pub(crate) fn apply(&mut self, change: &Change) -> Result<Option<EventId>, SimulationError> {
        match change {
            Change::EventCreated {
                entity,
                revision,
                time,
                value,
            } => {
                let id = self
                    .timeline
                    .apply_created(*entity, *revision, *time, value.clone())?;
                return Ok(Some(id));
            }
            Change::EventOccurred { event } => {
                self.timeline.apply_occurred(*event)?;
            }
            Change::EventCancelled { event } => {
                self.timeline.apply_cancelled(*event)?;
            }
            Change::SwitchState { switch, state } => {
                *slot(&mut self.state.switches, switch.index(), "switch")? = state.clone();
                self.dirty_switches.insert(*switch);
            }
            Change::RouteState { route, state } => {
                if route.index() >= self.state.routes.len() {
                    return Err(missing("route", route.index()));
                }
                self.state.set_route(*route, state.clone());
                self.dirty_routes.insert(*route);
            }
            Change::TvdSection { section, state } => {
                *slot(&mut self.state.sections, section.index(), "TVD section")? = state.clone();
            }
            Change::SignalAspects { signal, aspects } => {
                slot(&mut self.state.signals, signal.index(), "signal")?.aspects = aspects.clone();
            }
            Change::SignalSubscription {
                signal,
                train,
                subscribed,
            } => {
                let subscribers = &mut slot(&mut self.state.signals, signal.index(), "signal")?.subscribers;
                if *subscribed {
                    subscribers.insert(*train);
                } else {
                    subscribers.remove(train);
                }
            }
            Change::TrainState(change) => {
                let train = self
                    .trains
                    .get_mut(change.train)
                    .ok_or(SimulationError::UnknownTrain(change.train))?;
                train.state = change.state.clone();
                train.trajectory.extend_from_slice(&change.samples);
            }
        }
        Ok(None)
    }

    pub(crate) fn schedule_internal(
        &mut self,
        entity: EntityId,
        time: SimTime,
        value: EventValue,
    ) -> Result<EventId, SimulationError> {
        let change = self.timeline.plan_schedule(entity, time, value)?;
        self.commit(change)?.ok_or_else(|| {
            SimulationError::InconsistentChange("event creation created no event".to_string())
        })
    }

    pub(crate) fn cancel_internal(&mut self, event: EventId) -> Result<(), SimulationError> {
        let change = self.timeline.plan_cancel(event)?;
        self.commit(change)?;
        Ok(())
    }

    /// Run an external request, then settle. Any error halts the simulation.
    pub(crate) fn guarded<T>(
        &mut self,
        request: impl FnOnce(&mut Self) -> Result<T, SimulationError>,
    ) -> Result<T, SimulationError> {
        if self.halted {
            return Err(SimulationError::Halted);
        }
        let result = request(self).and_then(|value| {
            self.settle()?;
            Ok(value)
        });
        if let Err(e) = &result {
            self.halt(e);
        }
        result
    }

    fn halt(&mut self, e: &SimulationError) {
        self.halted = true;
        error!("simulation halted at t={}: {e}", self.time());
    }

    /// React to everything the last changes triggered, until nothing does.
    fn settle(&mut self) -> Result<(), SimulationError> {
        loop {
            self.update_signals()?;
            if let Some(train) = self.next_ready_departure() {
                self.depart(train)?;
                continue;
            }
            if let Some((train, signals)) = self.pending_notifications.pop_first() {
                self.on_signals_changed(train, signals)?;
                continue;
            }
            return Ok(());
        }
    }

    /// A train waiting for its first route that now holds its reservation.
    fn next_ready_departure(&self) -> Option<TrainId> {
        self.trains
            .iter()
            .find(|(id, train)| {
                train.state.status == TrainStatus::AwaitingRoute
                    && train.path.routes.first().is_some_and(|&route| {
                        let state = self.state.route(route);
                        state.status == RouteStatus::Reserved && state.holder == Some(*id)
                    })
            })
            .map(|(id, _)| id)
    }

    // -----------------------------------------------------------------------
    // Kernel interface
    // -----------------------------------------------------------------------

    /// Schedule an event owned by `entity`.
    pub fn schedule(
        &mut self,
        entity: EntityId,
        time: SimTime,
        value: EventValue,
    ) -> Result<EventId, SimulationError> {
        self.guarded(|sim| {
            if !sim.timeline.entities().contains(&entity) {
                return Err(SimulationError::InconsistentChange(format!(
                    "entity {entity:?} is not registered"
                )));
            }
            sim.schedule_internal(entity, time, value)
        })
    }

    /// Cancel a scheduled event. A switch whose motion is cancelled stays
    /// moving; a train whose plan is cancelled waits where it is.
    pub fn cancel(&mut self, event: EventId) -> Result<(), SimulationError> {
        self.guarded(|sim| {
            let entity = sim
                .timeline
                .event(event)
                .map(|e| e.entity)
                .ok_or(SimulationError::NotScheduled(event))?;
            sim.cancel_internal(event)?;
            match entity {
                EntityId::Switch(switch) => sim.on_switch_move_cancelled(switch, event),
                EntityId::Train(train) => {
                    debug!("event {:?} of train {:?} cancelled, the train waits", event, train);
                    Ok(())
                }
                _ => Ok(()),
            }
        })
    }

    pub fn next_event(&self) -> Option<&TimelineEvent> {
        self.timeline.next_event()
    }

    /// Execute the next event. Returns `None` once the timeline is empty.
    pub fn step(&mut self) -> Result<Option<TimelineEvent>, SimulationError> {
        if self.halted {
            return Err(SimulationError::Halted);
        }
        let Some(next) = self.timeline.next_event().map(|e| e.id) else {
            return Ok(None);
        };
        self.occur(next).map(Some)
    }

    /// Execute a specific event. Fails unless it is the next one.
    pub fn step_event(&mut self, event: EventId) -> Result<TimelineEvent, SimulationError> {
        if self.halted {
            return Err(SimulationError::Halted);
        }
        self.occur(event)
    }

    fn occur(&mut self, id: EventId) -> Result<TimelineEvent, SimulationError> {
        let result = self.execute(id);
        if let Err(e) = &result {
            self.halt(e);
        }
        result
    }

    fn execute(&mut self, id: EventId) -> Result<TimelineEvent, SimulationError> {
        let change = self.timeline.plan_step(id)?;
        let mut event = self
            .timeline
            .event(id)
            .cloned()
            .ok_or(SimulationError::NotScheduled(id))?;
        self.commit(change)?;
        event.state = EventState::Happened;
        debug!(
            "t={} event {} of {:?}: {}",
            event.time,
            id.0,
            event.entity,
            event_kind(&event.value)
        );

        self.dispatch(&event)
            .and_then(|()| self.settle())
            .map_err(|source| SimulationError::EventFailed {
                event: id,
                entity: event.entity,
                time: event.time,
                source: Box::new(source),
            })?;

        self.events_executed += 1;
        if let Some(interval) = self.config.hash_checkpoint_interval {
            if interval > 0 && self.events_executed % interval == 0 {
                let hash = self.state_hash();
                self.log.checkpoint(hash);
            }
        }
        Ok(event)
    }

    fn dispatch(&mut self, event: &TimelineEvent) -> Result<(), SimulationError> {
        match &event.value {
            EventValue::SwitchMoved { switch, target } => self.on_switch_moved(*switch, *target),
            EventValue::TrainDeparture => self.depart(owning_train(event)?),
            EventValue::TrainReachesActionPoint { plan } => {
                self.on_action_point(owning_train(event)?, plan)
            }
            EventValue::TrainStopped { plan } => self.on_train_stopped(owning_train(event)?, plan),
            EventValue::TrainStopEnds { plan } => self.on_stop_ends(owning_train(event)?, plan),
            EventValue::Marker(_) => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// Execute every event up to and including `horizon`. Returns the number
    /// of events executed.
    pub fn run_until(&mut self, horizon: SimTime) -> Result<usize, SimulationError> {
        let mut executed = 0;
        while self.timeline.next_event().is_some_and(|e| e.time <= horizon) {
            self.step()?;
            executed += 1;
        }
        Ok(executed)
    }

    /// Execute events until the timeline is empty.
    pub fn run(&mut self) -> Result<usize, SimulationError> {
        let mut executed = 0;
        while self.step()?.is_some() {
            executed += 1;
        }
        Ok(executed)
    }

    pub fn is_over(&self) -> bool {
        self.timeline.is_empty()
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn time(&self) -> SimTime {
        self.timeline.time()
    }

    pub fn infra(&self) -> &Arc<Infra> {
        &self.infra
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn state(&self) -> &InfraState {
        &self.state
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn train(&self, id: TrainId) -> Option<&Train> {
        self.trains.get(id)
    }

    pub fn trains(&self) -> impl Iterator<Item = (TrainId, &Train)> {
        self.trains.iter()
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.log
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Number of events executed so far.
    pub fn events_executed(&self) -> u64 {
        self.events_executed
    }

    pub fn add_observer(&mut self, observer: Box<dyn ChangeObserver>) {
        self.observers.push(observer);
    }

    // -----------------------------------------------------------------------
    // State hashing
    // -----------------------------------------------------------------------

    /// Hash of the whole simulation state.
    pub fn state_hash(&self) -> u64 {
        let mut hash = StateHash::new();
        self.timeline.hash_into(&mut hash);
        self.state.hash_into(&mut hash);
        self.hash_trains(&mut hash);
        hash.finish()
    }

    pub fn subsystem_hashes(&self) -> SubsystemHashes {
        let mut timeline = StateHash::new();
        self.timeline.hash_into(&mut timeline);
        let mut interlocking = StateHash::new();
        self.state.hash_into(&mut interlocking);
        let mut trains = StateHash::new();
        self.hash_trains(&mut trains);
        SubsystemHashes {
            timeline: timeline.finish(),
            interlocking: interlocking.finish(),
            trains: trains.finish(),
        }
    }

    fn hash_trains(&self, hash: &mut StateHash) {
        hash.write_u64(self.trains.len() as u64);
        for (id, train) in &self.trains {
            hash.write_u64(id.data().as_ffi());
            train.hash_into(hash);
        }
    }
}

/// Two simulations are equal when their timelines, interlocking states and
/// train states are. Infrastructures and configurations are not compared.
impl PartialEq for Simulation {
    fn eq(&self, other: &Self) -> bool {
        self.timeline == other.timeline
            && self.state == other.state
            && self.trains.len() == other.trains.len()
            && self.trains.iter().all(|(id, train)| {
                other.trains.get(id).is_some_and(|o| {
                    o.state == train.state && o.trajectory == train.trajectory
                })
            })
    }
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("time", &self.time())
            .field("pending_events", &self.timeline.len())
            .field("trains", &self.trains.len())
            .field("changes", &self.log.len())
            .field("halted", &self.halted)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn missing(kind: &str, index: usize) -> SimulationError {
    SimulationError::InconsistentChange(format!("no {kind} at index {index}"))
}

fn slot<'a, T>(items: &'a mut [T], index: usize, kind: &str) -> Result<&'a mut T, SimulationError> {
    items.get_mut(index).ok_or_else(|| missing(kind, index))
}

fn owning_train(event: &TimelineEvent) -> Result<TrainId, SimulationError> {
    match event.entity {
        EntityId::Train(train) => Ok(train),
        other => Err(SimulationError::InconsistentChange(format!(
            "train event {:?} owned by {other:?}",
            event.id
        ))),
    }
}

fn event_kind(value: &EventValue) -> &'static str {
    match value {
        EventValue::SwitchMoved { .. } => "switch moved",
        EventValue::TrainDeparture => "train departure",
        EventValue::TrainReachesActionPoint { .. } => "train reaches action point",
        EventValue::TrainStopped { .. } => "train stopped",
        EventValue::TrainStopEnds { .. } => "train stop ends",
        EventValue::Marker(_) => "marker",
    }
}

// ===========================================================================
// Tests
// ===========================================================================
