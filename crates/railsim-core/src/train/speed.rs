//! Speed constraints and driver decisions.
//!
//! Every constraint on a train's speed is a [`SpeedController`]. The
//! controllers active at a position are merged into a single *directive*,
//! the most restrictive one, which a [`DecisionMaker`] turns into an
//! [`Action`].

use serde::{Deserialize, Serialize};

use crate::kinematics::{Action, TrainPhysicsIntegrator};

// ---------------------------------------------------------------------------
// Speed controllers
// ---------------------------------------------------------------------------

/// A speed constraint over a range of path positions. Positions are those of
/// the train head along its path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SpeedController {
    /// A plain speed limit on `[begin, end)`.
    MaxSpeed { speed: f64, begin: f64, end: f64 },
    /// A braking curve towards `target_speed` at `target_position`. The
    /// target speed holds from there until `end`.
    LimitAnnounce {
        target_speed: f64,
        target_position: f64,
        /// Deceleration used for the braking curve, m/s².
        gamma: f64,
        end: f64,
    },
}

impl SpeedController {
    /// Highest speed allowed at `position` for a train currently at `speed`,
    /// integrating with time step `dt`. Infinite when unconstrained.
    pub fn directive(&self, position: f64, speed: f64, dt: f64) -> f64 {
        match *self {
            SpeedController::MaxSpeed { speed: limit, begin, end } => {
                if position >= begin && position < end {
                    limit
                } else {
                    f64::INFINITY
                }
            }
            SpeedController::LimitAnnounce {
                target_speed,
                target_position,
                gamma,
                end,
            } => {
                if position >= end {
                    return f64::INFINITY;
                }
                if position >= target_position {
                    return target_speed;
                }
                let distance = target_position - position;
                let braking_distance = 2.0 * gamma * distance;
                if speed > target_speed
                    && (speed * speed - target_speed * target_speed >= braking_distance
                        || distance <= speed * dt)
                {
                    // On or past the curve: the deceleration that stops
                    // exactly on target.
                    let deceleration =
                        (speed * speed - target_speed * target_speed) / (2.0 * distance);
                    return target_speed.max(speed - deceleration * dt);
                }
                let margin = (distance - speed * dt).max(0.0);
                (target_speed * target_speed + 2.0 * gamma * margin).sqrt()
            }
        }
    }

    /// Position past which the controller no longer constrains anything.
    pub fn end(&self) -> f64 {
        match *self {
            SpeedController::MaxSpeed { end, .. } | SpeedController::LimitAnnounce { end, .. } => end,
        }
    }
}

/// The most restrictive directive of a set of controllers.
pub fn merge_directives<'c>(
    controllers: impl IntoIterator<Item = &'c SpeedController>,
    position: f64,
    speed: f64,
    dt: f64,
) -> f64 {
    controllers
        .into_iter()
        .map(|c| c.directive(position, speed, dt))
        .fold(f64::INFINITY, f64::min)
}

// ---------------------------------------------------------------------------
// Decision makers
// ---------------------------------------------------------------------------

/// What a driver knows when choosing an action.
pub struct DecisionContext<'a> {
    pub integrator: &'a TrainPhysicsIntegrator<'a>,
    /// Head position along the path.
    pub position: f64,
    pub speed: f64,
    /// Most restrictive speed directive at the current position.
    pub directive: f64,
}

/// Chooses the action a train takes at every integration step.
pub trait DecisionMaker: std::fmt::Debug + Send + Sync {
    fn choose_action(&self, ctx: &DecisionContext<'_>) -> Action;
}

/// Drive as close as possible to the directive.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObeyDirective;

impl DecisionMaker for ObeyDirective {
    fn choose_action(&self, ctx: &DecisionContext<'_>) -> Action {
        ctx.integrator.action_to_target_speed(ctx.directive)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
