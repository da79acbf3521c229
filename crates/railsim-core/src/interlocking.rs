//! Interlocking: the safety state of switches, routes, TVD sections and
//! signals, and the transitions between states.
//!
//! Every transition goes through [`Simulation::commit`] as a [`Change`], so
//! the state here is only ever mutated by change application.
//!
//! Route life cycle:
//!
//! ```text
//! FREE --request--> REQUESTED --switches set, sections free--> RESERVED
//!   ^                                                             |
//!   +---- last section freed <-- OCCUPIED <-- a section occupied -+
//! ```

use std::collections::{BTreeSet, VecDeque};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::change::Change;
use crate::engine::Simulation;
use crate::error::SimulationError;
use crate::expr::{AspectSet, SignalingState};
use crate::id::*;
use crate::infra::Infra;
use crate::kernel::EventValue;
use crate::config::SimConfig;
use crate::sim::StateHash;
use crate::topology::SwitchBranch;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteStatus {
    Free,
    Requested,
    Reserved,
    Occupied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwitchPosition {
    Left,
    Right,
    Moving,
}

impl From<SwitchBranch> for SwitchPosition {
    fn from(branch: SwitchBranch) -> Self {
        match branch {
            SwitchBranch::Left => SwitchPosition::Left,
            SwitchBranch::Right => SwitchPosition::Right,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchState {
    pub position: SwitchPosition,
    /// Target branch and the event completing the motion, while moving.
    pub moving_to: Option<(SwitchBranch, EventId)>,
}

impl SwitchState {
    /// Whether the switch is locked in `branch`.
    pub fn is_set(&self, branch: SwitchBranch) -> bool {
        self.moving_to.is_none() && self.position == branch.into()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteState {
    pub status: RouteStatus,
    /// Order of the latest request. Earlier requests win switch claims.
    pub request_seq: u64,
    /// The train the route is set for, if any.
    pub holder: Option<TrainId>,
    /// Requests made while the route was not free, served in order.
    pub waiting: VecDeque<Option<TrainId>>,
}

impl RouteState {
    fn free() -> Self {
        Self {
            status: RouteStatus::Free,
            request_seq: 0,
            holder: None,
            waiting: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TvdSectionState {
    pub occupied_by: Option<TrainId>,
    pub reserved_by: Option<RouteId>,
}

impl TvdSectionState {
    pub fn is_free(&self) -> bool {
        self.occupied_by.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalState {
    pub aspects: AspectSet,
    /// Trains that have sighted the signal and not passed it yet.
    pub subscribers: BTreeSet<TrainId>,
}

/// The interlocking state of a whole infrastructure.
#[derive(Debug, Clone, PartialEq)]
pub struct InfraState {
    pub switches: Vec<SwitchState>,
    pub routes: Vec<RouteState>,
    pub sections: Vec<TvdSectionState>,
    pub signals: Vec<SignalState>,
    next_request_seq: u64,
}

impl InfraState {
    /// Initial state: switches in their initial position, everything free,
    /// signals evaluated in rank order.
    pub fn new(infra: &Infra, config: &SimConfig) -> Result<Self, SimulationError> {
        let mut state = Self {
            switches: infra
                .switches
                .iter()
                .map(|def| SwitchState {
                    position: def
                        .initial_position
                        .unwrap_or(config.default_switch_position)
                        .into(),
                    moving_to: None,
                })
                .collect(),
            routes: vec![RouteState::free(); infra.routes.len()],
            sections: vec![TvdSectionState::default(); infra.tvd_sections.len()],
            signals: vec![SignalState::default(); infra.signals.len()],
            next_request_seq: 1,
        };
        for &signal in &infra.signal_order {
            state.signals[signal.index()].aspects = state.evaluate(infra, signal)?;
        }
        Ok(state)
    }

    pub fn switch(&self, id: SwitchId) -> &SwitchState {
        &self.switches[id.index()]
    }

    pub fn route(&self, id: RouteId) -> &RouteState {
        &self.routes[id.index()]
    }

    pub fn section(&self, id: TvdSectionId) -> &TvdSectionState {
        &self.sections[id.index()]
    }

    pub fn signal(&self, id: SignalId) -> &SignalState {
        &self.signals[id.index()]
    }

    /// Evaluate a signal's expression against the current state.
    pub fn evaluate(&self, infra: &Infra, signal: SignalId) -> Result<AspectSet, SimulationError> {
        infra
            .signal(signal)
            .expr
            .eval(&infra.functions, self, &[])?
            .into_aspect_set()
    }

    pub(crate) fn take_request_seq(&mut self) -> u64 {
        let seq = self.next_request_seq;
        self.next_request_seq += 1;
        seq
    }

    pub(crate) fn set_route(&mut self, route: RouteId, state: RouteState) {
        self.next_request_seq = self.next_request_seq.max(state.request_seq + 1);
        self.routes[route.index()] = state;
    }

    pub fn hash_into(&self, hash: &mut StateHash) {
        for switch in &self.switches {
            hash.write_u32(switch.position as u32);
            if let Some((branch, event)) = switch.moving_to {
                hash.write_u32(branch as u32);
                hash.write_u64(event.0);
            }
        }
        for route in &self.routes {
            hash.write_u32(route.status as u32);
            hash.write_u64(route.request_seq);
            hash.write_bool(route.holder.is_some());
            hash.write_u64(route.waiting.len() as u64);
        }
        for section in &self.sections {
            hash.write_bool(section.occupied_by.is_some());
            hash.write_u32(section.reserved_by.map_or(u32::MAX, |r| r.0));
        }
        for signal in &self.signals {
            hash.write_u64(signal.aspects.len() as u64);
            for aspect in &signal.aspects {
                hash.write_u32(aspect.0);
            }
            hash.write_u64(signal.subscribers.len() as u64);
        }
    }
}

impl SignalingState for InfraState {
    fn route_status(&self, route: RouteId) -> RouteStatus {
        self.routes[route.index()].status
    }

    fn signal_aspects(&self, signal: SignalId) -> &AspectSet {
        &self.signals[signal.index()].aspects
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

impl Simulation {
    /// Request a route without a train attached. The first train that asks
    /// for the route afterwards takes it over.
    pub fn request_route(&mut self, route: RouteId) -> Result<(), SimulationError> {
        self.guarded(|sim| sim.request_route_for(route, None))
    }

    /// Move a switch unless a set or earlier-requested route needs it in
    /// the other position. Returns whether the request was accepted.
    pub fn request_switch_position(
        &mut self,
        switch: SwitchId,
        branch: SwitchBranch,
    ) -> Result<bool, SimulationError> {
        self.guarded(|sim| {
            if !sim.can_claim_switch(switch, branch, None) {
                warn!("switch {:?} is locked by a route, {:?} refused", switch, branch);
                return Ok(false);
            }
            sim.command_switch(switch, branch)?;
            Ok(true)
        })
    }

    /// Put a switch in position immediately, abandoning any motion.
    pub fn set_switch_position(
        &mut self,
        switch: SwitchId,
        branch: SwitchBranch,
    ) -> Result<(), SimulationError> {
        self.guarded(|sim| {
            if let Some((_, event)) = sim.state.switch(switch).moving_to {
                sim.cancel_internal(event)?;
            }
            sim.commit(Change::SwitchState {
                switch,
                state: SwitchState {
                    position: branch.into(),
                    moving_to: None,
                },
            })?;
            sim.retry_pending_routes()
        })
    }

    // -----------------------------------------------------------------------
    // Routes
    // -----------------------------------------------------------------------

    pub(crate) fn request_route_for(
        &mut self,
        route: RouteId,
        holder: Option<TrainId>,
    ) -> Result<(), SimulationError> {
        let mut state = self.state.route(route).clone();
        match state.status {
            RouteStatus::Free => {
                state.status = RouteStatus::Requested;
                state.request_seq = self.state.take_request_seq();
                state.holder = holder;
                debug!("route {} requested", self.infra.route(route).name);
                self.commit(Change::RouteState { route, state })?;
                self.try_reserve(route)?;
            }
            _ if holder.is_some() && (state.holder == holder || state.waiting.contains(&holder)) => {}
            RouteStatus::Requested | RouteStatus::Reserved if state.holder.is_none() && holder.is_some() => {
                state.holder = holder;
                self.commit(Change::RouteState { route, state })?;
            }
            _ => {
                state.waiting.push_back(holder);
                debug!(
                    "route {} busy, request queued behind {} others",
                    self.infra.route(route).name,
                    state.waiting.len() - 1
                );
                self.commit(Change::RouteState { route, state })?;
            }
        }
        Ok(())
    }

    /// Reserve a requested route if its switches are set and its sections
    /// are free. Commands the switches it may claim otherwise.
    fn try_reserve(&mut self, route: RouteId) -> Result<bool, SimulationError> {
        if self.state.route(route).status != RouteStatus::Requested {
            return Ok(false);
        }
        let infra = self.infra.clone();
        let def = infra.route(route);

        let mut switches_set = true;
        for &(switch, branch) in &def.switches {
            let state = self.state.switch(switch);
            if state.is_set(branch) {
                continue;
            }
            switches_set = false;
            let already_moving = matches!(state.moving_to, Some((target, _)) if target == branch);
            if !already_moving && self.can_claim_switch(switch, branch, Some(route)) {
                self.command_switch(switch, branch)?;
            }
        }

        let sections_free = def.sections.iter().all(|&section| {
            let state = self.state.section(section);
            state.is_free() && state.reserved_by.is_none_or(|r| r == route)
        });
        if !(switches_set && sections_free) {
            return Ok(false);
        }

        for &section in &def.sections {
            let mut state = self.state.section(section).clone();
            state.reserved_by = Some(route);
            self.commit(Change::TvdSection { section, state })?;
        }
        let mut state = self.state.route(route).clone();
        state.status = RouteStatus::Reserved;
        debug!("route {} reserved at t={}", def.name, self.time());
        self.commit(Change::RouteState { route, state })?;
        Ok(true)
    }

    /// A switch may be commanded unless another non-free route needs the
    /// other branch and is set, or was requested before `claimant`.
    fn can_claim_switch(&self, switch: SwitchId, branch: SwitchBranch, claimant: Option<RouteId>) -> bool {
        let seq = claimant.map_or(u64::MAX, |r| self.state.route(r).request_seq);
        self.infra.switch_routes(switch).iter().all(|&other| {
            if Some(other) == claimant {
                return true;
            }
            let state = self.state.route(other);
            let needs_other_branch = self
                .infra
                .route(other)
                .switches
                .iter()
                .any(|&(s, b)| s == switch && b != branch);
            !needs_other_branch
                || match state.status {
                    RouteStatus::Free => true,
                    RouteStatus::Requested => state.request_seq > seq,
                    RouteStatus::Reserved | RouteStatus::Occupied => false,
                }
        })
    }

    /// Retry every requested route, oldest request first.
    pub(crate) fn retry_pending_routes(&mut self) -> Result<(), SimulationError> {
        let mut pending: Vec<(u64, RouteId)> = self
            .state
            .routes
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == RouteStatus::Requested)
            .map(|(i, r)| (r.request_seq, RouteId(i as u32)))
            .collect();
        pending.sort();
        for (_, route) in pending {
            self.try_reserve(route)?;
        }
        Ok(())
    }

    fn release_route(&mut self, route: RouteId) -> Result<(), SimulationError> {
        let infra = self.infra.clone();
        for &section in &infra.route(route).sections {
            if self.state.section(section).reserved_by == Some(route) {
                let mut state = self.state.section(section).clone();
                state.reserved_by = None;
                self.commit(Change::TvdSection { section, state })?;
            }
        }
        let mut state = self.state.route(route).clone();
        state.status = RouteStatus::Free;
        state.holder = None;
        debug!("route {} freed at t={}", infra.route(route).name, self.time());
        if let Some(next) = state.waiting.pop_front() {
            state.status = RouteStatus::Requested;
            state.request_seq = self.state.take_request_seq();
            state.holder = next;
        }
        self.commit(Change::RouteState { route, state })?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Switches
    // -----------------------------------------------------------------------

    /// Start moving a switch towards `target`. A switch already moving
    /// elsewhere restarts its motion.
    pub(crate) fn command_switch(&mut self, switch: SwitchId, target: SwitchBranch) -> Result<(), SimulationError> {
        let state = self.state.switch(switch).clone();
        match state.moving_to {
            Some((moving, _)) if moving == target => return Ok(()),
            Some((_, event)) => self.cancel_internal(event)?,
            None if state.position == target.into() => return Ok(()),
            None => {}
        }
        let delay = self.infra.switch(switch).position_change_delay;
        let event = self.schedule_internal(
            EntityId::Switch(switch),
            self.time() + delay,
            EventValue::SwitchMoved { switch, target },
        )?;
        debug!(
            "switch {} moving to {:?} until t={}",
            self.infra.switch(switch).name,
            target,
            self.time() + delay
        );
        self.commit(Change::SwitchState {
            switch,
            state: SwitchState {
                position: SwitchPosition::Moving,
                moving_to: Some((target, event)),
            },
        })?;
        Ok(())
    }

    pub(crate) fn on_switch_moved(&mut self, switch: SwitchId, target: SwitchBranch) -> Result<(), SimulationError> {
        self.commit(Change::SwitchState {
            switch,
            state: SwitchState {
                position: target.into(),
                moving_to: None,
            },
        })?;
        self.retry_pending_routes()
    }

    /// A switch whose motion event was cancelled from outside stays moving
    /// until it is commanded again.
    pub(crate) fn on_switch_move_cancelled(&mut self, switch: SwitchId, event: EventId) -> Result<(), SimulationError> {
        if matches!(self.state.switch(switch).moving_to, Some((_, e)) if e == event) {
            self.commit(Change::SwitchState {
                switch,
                state: SwitchState {
                    position: SwitchPosition::Moving,
                    moving_to: None,
                },
            })?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // TVD sections
    // -----------------------------------------------------------------------

    pub(crate) fn occupy_section(&mut self, section: TvdSectionId, train: TrainId) -> Result<(), SimulationError> {
        let mut state = self.state.section(section).clone();
        match state.occupied_by {
            Some(occupant) if occupant == train => return Ok(()),
            Some(occupant) => {
                return Err(SimulationError::DoubleOccupancy {
                    section,
                    occupant,
                    train,
                });
            }
            None => {}
        }
        state.occupied_by = Some(train);
        let reserved_by = state.reserved_by;
        self.commit(Change::TvdSection { section, state })?;

        if let Some(route) = reserved_by {
            if self.state.route(route).status == RouteStatus::Reserved {
                let mut state = self.state.route(route).clone();
                state.status = RouteStatus::Occupied;
                self.commit(Change::RouteState { route, state })?;
            }
        }
        Ok(())
    }

    pub(crate) fn free_section(&mut self, section: TvdSectionId, train: TrainId) -> Result<(), SimulationError> {
        let mut state = self.state.section(section).clone();
        if state.occupied_by != Some(train) {
            return Ok(());
        }
        state.occupied_by = None;
        let reserved_by = state.reserved_by;
        self.commit(Change::TvdSection { section, state })?;

        if let Some(route) = reserved_by {
            let all_free = self
                .infra
                .route(route)
                .sections
                .iter()
                .all(|&s| self.state.section(s).is_free());
            if self.state.route(route).status == RouteStatus::Occupied && all_free {
                self.release_route(route)?;
            }
        }
        self.retry_pending_routes()
    }

    // -----------------------------------------------------------------------
    // Signals
    // -----------------------------------------------------------------------

    pub(crate) fn subscribe_signal(&mut self, signal: SignalId, train: TrainId) -> Result<(), SimulationError> {
        if self.state.signal(signal).subscribers.contains(&train) {
            return Ok(());
        }
        self.commit(Change::SignalSubscription {
            signal,
            train,
            subscribed: true,
        })?;
        Ok(())
    }

    pub(crate) fn unsubscribe_signal(&mut self, signal: SignalId, train: TrainId) -> Result<(), SimulationError> {
        if !self.state.signal(signal).subscribers.contains(&train) {
            return Ok(());
        }
        self.commit(Change::SignalSubscription {
            signal,
            train,
            subscribed: false,
        })?;
        Ok(())
    }

    /// Re-evaluate the signals reading a changed route or switch, then the
    /// signals reading a changed signal, in rank order. Subscribed trains of
    /// every changed signal get notified.
    pub(crate) fn update_signals(&mut self) -> Result<(), SimulationError> {
        let infra = self.infra.clone();
        let mut worklist: BTreeSet<(u32, SignalId)> = BTreeSet::new();
        for route in std::mem::take(&mut self.dirty_routes) {
            worklist.extend(infra.route_signals(route).iter().map(|&s| (infra.signal(s).rank, s)));
        }
        for switch in std::mem::take(&mut self.dirty_switches) {
            worklist.extend(infra.switch_signals(switch).iter().map(|&s| (infra.signal(s).rank, s)));
        }

        while let Some((_, signal)) = worklist.pop_first() {
            let aspects = self.state.evaluate(&infra, signal)?;
            if aspects == self.state.signal(signal).aspects {
                continue;
            }
            debug!("signal {} now shows {:?}", infra.signal(signal).name, aspects);
            self.commit(Change::SignalAspects { signal, aspects })?;
            worklist.extend(
                infra
                    .signal_dependents(signal)
                    .iter()
                    .map(|&s| (infra.signal(s).rank, s)),
            );
            for &train in &self.state.signal(signal).subscribers {
                self.pending_notifications.entry(train).or_default().insert(signal);
            }
        }
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
    use crate::test_utils::*;

    fn switch_sim(delay: f64) -> Simulation {
        init_logging();
        Simulation::new(Arc::new(switch_infra(delay)), SimConfig::default()).unwrap()
    }

    // -----------------------------------------------------------------------
    // Test 1: Initial state
    // -----------------------------------------------------------------------
    #[test]
    fn initial_state_is_free_and_signals_evaluated() {
        let sim = switch_sim(10.0);
        let infra = sim.infra().clone();
        assert_eq!(sim.state().switch(SwitchId(0)).position, SwitchPosition::Left);
        assert!(sim.state().routes.iter().all(|r| r.status == RouteStatus::Free));
        let red = infra.aspect_id("RED").unwrap();
        let junction = infra.signal_id("S_junction").unwrap();
        assert!(sim.state().signal(junction).aspects.contains(&red));
    }

    // -----------------------------------------------------------------------
    // Test 2: Route over a set switch reserves at once
    // -----------------------------------------------------------------------
    #[test]
    fn route_with_switch_in_place_reserves_immediately() {
        let mut sim = switch_sim(10.0);
        let left = sim.infra().route_id("left").unwrap();
        sim.request_route(left).unwrap();
        assert_eq!(sim.state().route(left).status, RouteStatus::Reserved);
        let section = sim.infra().route(left).sections[0];
        assert_eq!(sim.state().section(section).reserved_by, Some(left));

        let green = sim.infra().aspect_id("GREEN").unwrap();
        let junction = sim.infra().signal_id("S_junction").unwrap();
        assert!(sim.state().signal(junction).aspects.contains(&green));
    }

    // -----------------------------------------------------------------------
    // Test 3: Route waits for the switch to move
    // -----------------------------------------------------------------------
    #[test]
    fn route_waits_for_switch_motion() {
        let mut sim = switch_sim(10.0);
        let right = sim.infra().route_id("right").unwrap();
        sim.request_route(right).unwrap();
        assert_eq!(sim.state().route(right).status, RouteStatus::Requested);
        assert_eq!(sim.state().switch(SwitchId(0)).position, SwitchPosition::Moving);

        sim.run_until(9.5).unwrap();
        assert_eq!(sim.state().route(right).status, RouteStatus::Requested);

        sim.run_until(10.0).unwrap();
        assert_eq!(sim.time(), 10.0);
        assert_eq!(sim.state().switch(SwitchId(0)).position, SwitchPosition::Right);
        assert_eq!(sim.state().route(right).status, RouteStatus::Reserved);
    }

    // -----------------------------------------------------------------------
    // Test 4: Conflicting routes do not steal switches
    // -----------------------------------------------------------------------
    #[test]
    fn reserved_route_locks_its_switch() {
        let mut sim = switch_sim(10.0);
        let left = sim.infra().route_id("left").unwrap();
        let right = sim.infra().route_id("right").unwrap();
        sim.request_route(left).unwrap();
        sim.request_route(right).unwrap();
        // The two routes share the approach section, so `right` cannot be
        // reserved, and the switch is locked by `left`.
        assert_eq!(sim.state().route(right).status, RouteStatus::Requested);
        assert_eq!(sim.state().switch(SwitchId(0)).position, SwitchPosition::Left);
        assert!(!sim.request_switch_position(SwitchId(0), SwitchBranch::Right).unwrap());
        sim.run().unwrap();
        assert_eq!(sim.state().switch(SwitchId(0)).position, SwitchPosition::Left);
    }

    // -----------------------------------------------------------------------
    // Test 5: Re-commanding a moving switch restarts the motion
    // -----------------------------------------------------------------------
    #[test]
    fn switch_recommand_restarts_motion() {
        let mut sim = switch_sim(10.0);
        assert!(sim.request_switch_position(SwitchId(0), SwitchBranch::Right).unwrap());
        let first = sim.state().switch(SwitchId(0)).moving_to.unwrap().1;
        sim.schedule(EntityId::Switch(SwitchId(0)), 5.0, EventValue::Marker(0)).unwrap();
        sim.run_until(5.0).unwrap();

        assert!(sim.request_switch_position(SwitchId(0), SwitchBranch::Left).unwrap());
        assert!(sim.timeline().event(first).is_none());
        sim.run_until(14.0).unwrap();
        assert_eq!(sim.state().switch(SwitchId(0)).position, SwitchPosition::Moving);
        sim.run_until(15.0).unwrap();
        assert_eq!(sim.state().switch(SwitchId(0)).position, SwitchPosition::Left);
    }

    // -----------------------------------------------------------------------
    // Test 6: Direct positioning skips the delay
    // -----------------------------------------------------------------------
    #[test]
    fn set_position_is_immediate() {
        let mut sim = switch_sim(10.0);
        sim.request_switch_position(SwitchId(0), SwitchBranch::Right).unwrap();
        sim.set_switch_position(SwitchId(0), SwitchBranch::Right).unwrap();
        assert!(sim.state().switch(SwitchId(0)).is_set(SwitchBranch::Right));
        assert!(sim.is_over());
    }

    // -----------------------------------------------------------------------
    // Test 7: Occupation drives routes through their life cycle
    // -----------------------------------------------------------------------
    #[test]
    fn occupation_cycle_frees_route_and_serves_waiters() {
        let mut sim = switch_sim(0.0);
        let left = sim.infra().route_id("left").unwrap();
        let section = sim.infra().route(left).sections[0];
        let mut trains = slotmap::SlotMap::<TrainId, ()>::with_key();
        let a = trains.insert(());
        let b = trains.insert(());

        sim.request_route_for(left, Some(a)).unwrap();
        sim.request_route_for(left, Some(b)).unwrap();
        assert_eq!(sim.state().route(left).waiting.len(), 1);

        sim.occupy_section(section, a).unwrap();
        assert_eq!(sim.state().route(left).status, RouteStatus::Occupied);
        assert!(matches!(
            sim.occupy_section(section, b),
            Err(SimulationError::DoubleOccupancy { .. })
        ));

        sim.free_section(section, a).unwrap();
        let state = sim.state().route(left);
        assert_eq!(state.status, RouteStatus::Reserved);
        assert_eq!(state.holder, Some(b));
        assert!(state.waiting.is_empty());
    }

    // -----------------------------------------------------------------------
    // Test 8: A released route drops its section reservations
    // -----------------------------------------------------------------------
    #[test]
    fn released_route_without_waiters_is_free() {
        let mut sim = switch_sim(0.0);
        let right = sim.infra().route_id("right").unwrap();
        let left = sim.infra().route_id("left").unwrap();
        let sections = sim.infra().route(right).sections.clone();
        let mut trains = slotmap::SlotMap::<TrainId, ()>::with_key();
        let a = trains.insert(());

        sim.request_route_for(right, Some(a)).unwrap();
        sim.run().unwrap();
        assert_eq!(sim.state().route(right).status, RouteStatus::Reserved);
        for &section in &sections {
            sim.occupy_section(section, a).unwrap();
        }
        for &section in &sections {
            sim.free_section(section, a).unwrap();
        }

        let state = sim.state().route(right);
        assert_eq!(state.status, RouteStatus::Free);
        assert_eq!(state.holder, None);
        assert!(sections
            .iter()
            .all(|&s| sim.state().section(s).reserved_by.is_none()));
        // The switch is no longer locked.
        sim.request_route(left).unwrap();
        sim.run().unwrap();
        assert_eq!(sim.state().route(left).status, RouteStatus::Reserved);
    }
}
