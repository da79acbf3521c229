//! Property-based tests for the railsim kernel.
//!
//! Uses proptest to generate random event schedules, switch commands and
//! train departures, then verify ordering, safety and determinism hold.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use proptest::prelude::*;
use railsim_core::change::{Change, ChangeObserver};
use railsim_core::config::SimConfig;
use railsim_core::engine::Simulation;
use railsim_core::id::*;
use railsim_core::infra::Infra;
use railsim_core::interlocking::RouteStatus;
use railsim_core::kernel::EventValue;
use railsim_core::replay::{ReplayLog, replay};
use railsim_core::test_utils::*;
use railsim_core::topology::SwitchBranch;
use railsim_core::train::{TrainSchedule, TrainStatus};
use railsim_core::validation::validate_determinism;

// ===========================================================================
// Generators
// ===========================================================================

fn arb_branch() -> impl Strategy<Value = SwitchBranch> {
    prop_oneof![Just(SwitchBranch::Left), Just(SwitchBranch::Right)]
}

/// Switch commands, each followed by a pause before the next one.
fn arb_switch_commands(max_ops: usize) -> impl Strategy<Value = Vec<(SwitchBranch, f64)>> {
    proptest::collection::vec((arb_branch(), 0.0..30.0f64), 1..=max_ops)
}

/// Where a train on the junction goes: stop on the approach, or run onto
/// one of the branches.
#[derive(Debug, Clone, Copy)]
enum Destination {
    Approach,
    Branch(SwitchBranch),
}

fn arb_junction_trains(max_trains: usize) -> impl Strategy<Value = Vec<(Destination, f64)>> {
    let destination = prop_oneof![
        1 => Just(Destination::Approach),
        3 => arb_branch().prop_map(Destination::Branch),
    ];
    proptest::collection::vec((destination, 0.0..120.0f64), 3..=max_trains)
}

fn junction_schedule(
    infra: &Infra,
    index: usize,
    destination: Destination,
    departure: f64,
) -> TrainSchedule {
    let entry = infra.route_id("entry").unwrap();
    let name = format!("train {index}");
    let schedule = match destination {
        Destination::Approach => {
            TrainSchedule::new(&name, fast_rolling_stock(), vec![entry]).navigate_to(700.0)
        }
        Destination::Branch(branch) => {
            let route = match branch {
                SwitchBranch::Left => infra.route_id("left").unwrap(),
                SwitchBranch::Right => infra.route_id("right").unwrap(),
            };
            TrainSchedule::new(&name, fast_rolling_stock(), vec![entry, route]).navigate_to(1250.0)
        }
    };
    schedule.departing_at(departure)
}

/// Mirrors section and route states from the change stream and records
/// every transition breaking block safety.
#[derive(Default)]
struct InterlockingWatch {
    occupants: BTreeMap<TvdSectionId, TrainId>,
    reservations: BTreeMap<TvdSectionId, RouteId>,
    routes: BTreeMap<RouteId, RouteStatus>,
    violations: Vec<String>,
}

impl InterlockingWatch {
    fn check_reservations(&mut self) {
        for (section, route) in &self.reservations {
            let status = self.routes.get(route).copied().unwrap_or(RouteStatus::Free);
            if status == RouteStatus::Free {
                self.violations
                    .push(format!("{section:?} reserved by free route {route:?}"));
            }
        }
    }
}

struct SharedWatch(Rc<RefCell<InterlockingWatch>>);

impl ChangeObserver for SharedWatch {
    fn on_change(&mut self, _index: usize, change: &Change) {
        let mut watch = self.0.borrow_mut();
        match change {
            Change::TvdSection { section, state } => {
                match (watch.occupants.get(section).copied(), state.occupied_by) {
                    (Some(before), Some(after)) if before != after => {
                        watch
                            .violations
                            .push(format!("{section:?} taken by {after:?} from {before:?}"));
                    }
                    (_, Some(after)) => {
                        watch.occupants.insert(*section, after);
                    }
                    (_, None) => {
                        watch.occupants.remove(section);
                    }
                }
                match state.reserved_by {
                    Some(route) => watch.reservations.insert(*section, route),
                    None => watch.reservations.remove(section),
                };
            }
            Change::RouteState { route, state } => {
                watch.routes.insert(*route, state.status);
            }
            _ => return,
        }
        watch.check_reservations();
    }
}

fn two_trains(infra: &Infra, second_departure: f64) -> Vec<TrainSchedule> {
    let routes = line_routes(infra, 4);
    vec![
        TrainSchedule::new("first", fast_rolling_stock(), routes.clone()).navigate_to(3900.0),
        TrainSchedule::new("second", fast_rolling_stock(), routes)
            .departing_at(second_departure)
            .navigate_to(2900.0),
    ]
}

fn two_train_sim(infra: &Arc<Infra>, second_departure: f64) -> Simulation {
    let mut sim = Simulation::new(infra.clone(), SimConfig::default()).unwrap();
    for schedule in two_trains(infra, second_departure) {
        sim.add_train(schedule).unwrap();
    }
    sim
}

// ===========================================================================
// Properties
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Events happen in (time, revision) order, each exactly once.
    #[test]
    fn events_happen_in_order(times in proptest::collection::vec(0.0..1000.0f64, 1..40)) {
        let mut sim = Simulation::new(Arc::new(switch_infra(5.0)), SimConfig::default()).unwrap();
        for (i, &time) in times.iter().enumerate() {
            sim.schedule(EntityId::Switch(SwitchId(0)), time, EventValue::Marker(i as u64)).unwrap();
        }

        let mut happened = Vec::new();
        while let Some(event) = sim.step().unwrap() {
            happened.push((event.time, event.revision()));
        }
        prop_assert_eq!(happened.len(), times.len());
        prop_assert!(happened.windows(2).all(|w| w[0] <= w[1]));
        prop_assert!(sim.is_over());
    }

    /// Whatever the command sequence, the switch ends up locked in the last
    /// requested position.
    #[test]
    fn switch_settles_on_last_request(commands in arb_switch_commands(20)) {
        let mut sim = Simulation::new(Arc::new(switch_infra(10.0)), SimConfig::default()).unwrap();
        let mut horizon = 0.0;
        for &(branch, pause) in &commands {
            prop_assert!(sim.request_switch_position(SwitchId(0), branch).unwrap());
            horizon += pause;
            sim.run_until(horizon).unwrap();
        }
        sim.run().unwrap();

        let last = commands[commands.len() - 1].0;
        let state = sim.state().switch(SwitchId(0));
        prop_assert!(state.is_set(last));
        prop_assert!(state.moving_to.is_none());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10))]

    /// Two trains sharing a line both arrive, whatever the headway.
    #[test]
    fn following_trains_both_arrive(departure in 0u32..120) {
        let infra = Arc::new(line_infra(4, 1000.0));
        let mut sim = two_train_sim(&infra, departure as f64);
        sim.run().unwrap();

        prop_assert!(sim.trains().all(|(_, t)| t.state.status == TrainStatus::ReachedDestination));
        let sections = &sim.state().sections;
        prop_assert_eq!(sections.iter().filter(|s| s.occupied_by.is_some()).count(), 2);
    }

    /// Identical scenarios evolve identically.
    #[test]
    fn scenario_is_deterministic(departure in 0u32..120) {
        let infra = Arc::new(line_infra(4, 1000.0));
        let result = validate_determinism(|| Ok(two_train_sim(&infra, departure as f64)), 100_000).unwrap();
        prop_assert!(result.is_deterministic);
    }

    /// Replaying a recorded run rebuilds the same state.
    #[test]
    fn replay_rebuilds_same_state(departure in 0u32..120) {
        let infra = Arc::new(line_infra(4, 1000.0));
        let mut original = two_train_sim(&infra, departure as f64);
        original.run().unwrap();
        let log = ReplayLog::from_simulation(&original);

        let mut target = Simulation::new(infra.clone(), SimConfig::default()).unwrap();
        for schedule in two_trains(&infra, departure as f64) {
            target.register_train(schedule).unwrap();
        }
        replay(&log, &mut target).unwrap();
        prop_assert_eq!(target.state_hash(), original.state_hash());
        prop_assert!(target == original);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    /// Trains competing for a junction never share a TVD section, and a
    /// section is only ever reserved by a route that is not free.
    #[test]
    fn junction_sections_stay_exclusive(trains in arb_junction_trains(5), delay in 0.0..30.0f64) {
        let infra = Arc::new(switch_infra(delay));
        let mut sim = Simulation::new(infra.clone(), SimConfig::default()).unwrap();
        let watch = Rc::new(RefCell::new(InterlockingWatch::default()));
        sim.add_observer(Box::new(SharedWatch(watch.clone())));
        for (i, &(destination, departure)) in trains.iter().enumerate() {
            sim.add_train(junction_schedule(&infra, i, destination, departure)).unwrap();
        }
        sim.run().unwrap();

        let watch = watch.borrow();
        prop_assert!(watch.violations.is_empty(), "{:?}", watch.violations);
        prop_assert!(sim.trains().any(|(_, t)| t.state.status == TrainStatus::ReachedDestination));

        // Held routes keep every section they reserved.
        let state = sim.state();
        for (i, route) in state.routes.iter().enumerate() {
            let id = RouteId(i as u32);
            if matches!(route.status, RouteStatus::Reserved | RouteStatus::Occupied) {
                for &section in &infra.route(id).sections {
                    prop_assert_eq!(state.section(section).reserved_by, Some(id));
                }
            }
        }
        for section in &state.sections {
            if let Some(route) = section.reserved_by {
                prop_assert!(state.route(route).status != RouteStatus::Free);
            }
        }
    }
}
