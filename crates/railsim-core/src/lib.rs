//! Railsim Core -- a discrete-event railway simulation engine.
//!
//! This crate provides the track topology and its waypoint overlay, the
//! interlocking (switches, routes, TVD sections and expression-driven
//! signals), train kinematics and movement, and the event-sourced kernel
//! that runs them deterministically.
//!
//! # Event Loop
//!
//! Each call to [`engine::Simulation::step`] executes the next event of the
//! [`kernel::Timeline`], ordered by `(time, revision)`:
//!
//! 1. **Occur** -- The event leaves the timeline and the clock advances to it.
//! 2. **Dispatch** -- The owner reacts: a switch completes its motion, a
//!    train departs, reaches an interaction point, stops or ends a stop.
//! 3. **Settle** -- Signals reading changed routes or switches are
//!    re-evaluated, waiting trains depart and trains that sighted a changed
//!    signal replan.
//!
//! # Change Pattern
//!
//! State is never mutated in place. Every transition is a
//! [`change::Change`], registered in the change log, applied and published:
//!
//! ```rust,ignore
//! let mut sim = Simulation::new(Arc::new(infra), SimConfig::default())?;
//! let train = sim.add_train(TrainSchedule::new("IC 1", stock, routes).navigate_to(2900.0))?;
//! sim.run()?;
//! let log = ReplayLog::from_simulation(&sim);
//! ```
//!
//! # Key Types
//!
//! - [`engine::Simulation`] -- Owns the timeline, interlocking and trains.
//! - [`infra::Infra`] -- Immutable infrastructure built by
//!   [`infra::InfraBuilder`].
//! - [`interlocking::InfraState`] -- Switch, route, TVD section and signal
//!   states.
//! - [`train::Train`] -- A train following its routes through its phases.
//! - [`kinematics::TrainPhysicsIntegrator`] -- One integration step of train
//!   dynamics.
//! - [`replay::ReplayLog`] -- Recorded changes, replayable on a fresh
//!   simulation.

pub mod change;
pub mod config;
#[cfg(feature = "data-loader")]
pub mod data_loader;
pub mod engine;
pub mod error;
pub mod expr;
pub mod id;
pub mod infra;
pub mod interlocking;
pub mod kernel;
pub mod kinematics;
pub mod replay;
pub mod sim;
pub mod topology;
pub mod train;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
