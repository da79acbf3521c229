//! The discrete-event timeline.
//!
//! Events are ordered by `(time, revision)`: the revision is assigned at
//! creation from a monotonically increasing counter, so events scheduled
//! for the same instant happen in creation order.
//!
//! The timeline never mutates itself from a request. `plan_*` methods check a
//! request and describe it as a [`Change`]; `apply_*` methods perform a change.
//! The simulation records every change between the two, which is what makes a
//! run replayable.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::change::Change;
use crate::error::SimulationError;
use crate::id::*;
use crate::sim::{OrderedTime, SimTime, StateHash};
use crate::topology::SwitchBranch;
use crate::train::TrainPlan;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventState {
    Scheduled,
    Happened,
    Cancelled,
}

/// What happens when an event occurs. Train events carry the state the
/// train will be in at that time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventValue {
    SwitchMoved {
        switch: SwitchId,
        target: SwitchBranch,
    },
    TrainDeparture,
    TrainReachesActionPoint {
        plan: Box<TrainPlan>,
    },
    TrainStopped {
        plan: Box<TrainPlan>,
    },
    TrainStopEnds {
        plan: Box<TrainPlan>,
    },
    /// No behavior. Lets callers place time marks on the timeline.
    Marker(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: EventId,
    pub entity: EntityId,
    pub time: SimTime,
    pub value: EventValue,
    pub state: EventState,
}

impl TimelineEvent {
    /// The revision is the event id.
    pub fn revision(&self) -> u64 {
        self.id.0
    }
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    time: SimTime,
    /// Revision of the next event to be created.
    revision: u64,
    entities: BTreeSet<EntityId>,
    events: BTreeMap<EventId, TimelineEvent>,
    queue: BTreeSet<(OrderedTime, EventId)>,
    by_entity: BTreeMap<EntityId, BTreeSet<EventId>>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn time(&self) -> SimTime {
        self.time
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn register_entity(&mut self, entity: EntityId) {
        self.entities.insert(entity);
    }

    pub fn entities(&self) -> &BTreeSet<EntityId> {
        &self.entities
    }

    /// The scheduled event with the smallest `(time, revision)`.
    pub fn next_event(&self) -> Option<&TimelineEvent> {
        let (_, id) = self.queue.first()?;
        self.events.get(id)
    }

    /// A scheduled event. Events leave the timeline once they happen or are
    /// cancelled.
    pub fn event(&self, id: EventId) -> Option<&TimelineEvent> {
        self.events.get(&id)
    }

    /// Scheduled events owned by `entity`, in creation order.
    pub fn pending_for(&self, entity: EntityId) -> impl Iterator<Item = EventId> + '_ {
        self.by_entity
            .get(&entity)
            .into_iter()
            .flat_map(|events| events.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    // -----------------------------------------------------------------------
    // Planning
    // -----------------------------------------------------------------------

    pub fn plan_schedule(
        &self,
        entity: EntityId,
        time: SimTime,
        value: EventValue,
    ) -> Result<Change, SimulationError> {
        if time < self.time || time.is_nan() {
            return Err(SimulationError::ScheduledInPast {
                time,
                now: self.time,
            });
        }
        Ok(Change::EventCreated {
            entity,
            revision: self.revision,
            time,
            value,
        })
    }

    pub fn plan_step(&self, event: EventId) -> Result<Change, SimulationError> {
        if !self.events.contains_key(&event) {
            return Err(SimulationError::NotScheduled(event));
        }
        let next = self.queue.first().map(|(_, id)| *id);
        if next != Some(event) {
            return Err(SimulationError::NotNextEvent { event, next });
        }
        Ok(Change::EventOccurred { event })
    }

    pub fn plan_cancel(&self, event: EventId) -> Result<Change, SimulationError> {
        if !self.events.contains_key(&event) {
            return Err(SimulationError::NotScheduled(event));
        }
        Ok(Change::EventCancelled { event })
    }

    // -----------------------------------------------------------------------
    // Application
    // -----------------------------------------------------------------------

    pub(crate) fn apply_created(
        &mut self,
        entity: EntityId,
        revision: u64,
        time: SimTime,
        value: EventValue,
    ) -> Result<EventId, SimulationError> {
        if revision != self.revision {
            return Err(SimulationError::InconsistentChange(format!(
                "event revision {revision} created while the timeline is at revision {}",
                self.revision
            )));
        }
        if time < self.time {
            return Err(SimulationError::ScheduledInPast {
                time,
                now: self.time,
            });
        }
        let id = EventId(revision);
        self.revision += 1;
        self.queue.insert((OrderedTime(time), id));
        self.by_entity.entry(entity).or_default().insert(id);
        self.events.insert(
            id,
            TimelineEvent {
                id,
                entity,
                time,
                value,
                state: EventState::Scheduled,
            },
        );
        Ok(id)
    }

    pub(crate) fn apply_occurred(&mut self, event: EventId) -> Result<TimelineEvent, SimulationError> {
        let mut removed = self.remove(event)?;
        if removed.time < self.time {
            return Err(SimulationError::TimeWentBackward {
                from: self.time,
                to: removed.time,
            });
        }
        self.time = removed.time;
        removed.state = EventState::Happened;
        Ok(removed)
    }

    pub(crate) fn apply_cancelled(&mut self, event: EventId) -> Result<TimelineEvent, SimulationError> {
        let mut removed = self.remove(event)?;
        removed.state = EventState::Cancelled;
        Ok(removed)
    }

    fn remove(&mut self, event: EventId) -> Result<TimelineEvent, SimulationError> {
        let removed = self
            .events
            .remove(&event)
            .ok_or(SimulationError::NotScheduled(event))?;
        self.queue.remove(&(OrderedTime(removed.time), event));
        if let Some(owned) = self.by_entity.get_mut(&removed.entity) {
            owned.remove(&event);
            if owned.is_empty() {
                self.by_entity.remove(&removed.entity);
            }
        }
        Ok(removed)
    }

    pub fn hash_into(&self, hash: &mut StateHash) {
        hash.write_f64(self.time);
        hash.write_u64(self.revision);
        hash.write_u64(self.entities.len() as u64);
        for (OrderedTime(time), id) in &self.queue {
            hash.write_f64(*time);
            hash.write_u64(id.0);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn create(timeline: &mut Timeline, time: SimTime, mark: u64) -> EventId {
        let change = timeline
            .plan_schedule(EntityId::Switch(SwitchId(0)), time, EventValue::Marker(mark))
            .unwrap();
        let Change::EventCreated {
            entity,
            revision,
            time,
            value,
        } = change
        else {
            panic!("expected an event creation");
        };
        timeline.apply_created(entity, revision, time, value).unwrap()
    }

    fn step(timeline: &mut Timeline) -> TimelineEvent {
        let next = timeline.next_event().unwrap().id;
        timeline.plan_step(next).unwrap();
        timeline.apply_occurred(next).unwrap()
    }

    // -----------------------------------------------------------------------
    // Test 1: Ordering by time then revision
    // -----------------------------------------------------------------------
    #[test]
    fn events_happen_by_time_then_revision() {
        let mut timeline = Timeline::new();
        let late = create(&mut timeline, 5.0, 0);
        let first_tie = create(&mut timeline, 2.0, 1);
        let second_tie = create(&mut timeline, 2.0, 2);

        assert_eq!(step(&mut timeline).id, first_tie);
        assert_eq!(step(&mut timeline).id, second_tie);
        let last = step(&mut timeline);
        assert_eq!(last.id, late);
        assert_eq!(last.state, EventState::Happened);
        assert_eq!(timeline.time(), 5.0);
        assert!(timeline.is_empty());
    }

    // -----------------------------------------------------------------------
    // Test 2: Scheduling errors
    // -----------------------------------------------------------------------
    #[test]
    fn scheduling_in_the_past_fails() {
        let mut timeline = Timeline::new();
        create(&mut timeline, 3.0, 0);
        step(&mut timeline);
        let result = timeline.plan_schedule(EntityId::Switch(SwitchId(0)), 1.0, EventValue::Marker(0));
        assert!(matches!(result, Err(SimulationError::ScheduledInPast { .. })));
        // The current instant is still allowed.
        assert!(timeline
            .plan_schedule(EntityId::Switch(SwitchId(0)), 3.0, EventValue::Marker(0))
            .is_ok());
    }

    #[test]
    fn only_the_next_event_can_step() {
        let mut timeline = Timeline::new();
        let first = create(&mut timeline, 1.0, 0);
        let second = create(&mut timeline, 2.0, 1);
        assert!(matches!(
            timeline.plan_step(second),
            Err(SimulationError::NotNextEvent { next: Some(n), .. }) if n == first
        ));
        assert!(matches!(
            timeline.plan_step(EventId(99)),
            Err(SimulationError::NotScheduled(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Test 3: Cancellation is terminal
    // -----------------------------------------------------------------------
    #[test]
    fn cancelled_events_leave_the_timeline() {
        let mut timeline = Timeline::new();
        let event = create(&mut timeline, 1.0, 0);
        assert_eq!(timeline.pending_for(EntityId::Switch(SwitchId(0))).count(), 1);
        timeline.plan_cancel(event).unwrap();
        let cancelled = timeline.apply_cancelled(event).unwrap();
        assert_eq!(cancelled.state, EventState::Cancelled);
        assert!(timeline.event(event).is_none());
        assert_eq!(timeline.pending_for(EntityId::Switch(SwitchId(0))).count(), 0);
        assert!(matches!(
            timeline.plan_cancel(event),
            Err(SimulationError::NotScheduled(_))
        ));
        // The revision counter never goes back.
        assert_eq!(timeline.revision(), 1);
    }

    // -----------------------------------------------------------------------
    // Test 4: Out-of-order creation is rejected
    // -----------------------------------------------------------------------
    #[test]
    fn stale_revision_is_inconsistent() {
        let mut timeline = Timeline::new();
        create(&mut timeline, 1.0, 0);
        let result = timeline.apply_created(
            EntityId::Switch(SwitchId(0)),
            0,
            1.0,
            EventValue::Marker(0),
        );
        assert!(matches!(result, Err(SimulationError::InconsistentChange(_))));
    }

    // -----------------------------------------------------------------------
    // Test 5: Equality covers time, revision and pending events
    // -----------------------------------------------------------------------
    #[test]
    fn equal_histories_give_equal_timelines() {
        let mut a = Timeline::new();
        let mut b = Timeline::new();
        for timeline in [&mut a, &mut b] {
            create(timeline, 1.0, 0);
            create(timeline, 4.0, 1);
            step(timeline);
        }
        assert_eq!(a, b);
        create(&mut a, 4.0, 2);
        assert_ne!(a, b);
    }
}
