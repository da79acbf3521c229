//! Train kinematics.
//!
//! [`TrainPhysicsIntegrator`] advances a train by one time step under a
//! traction or braking [`Action`]. The net force is the action force, minus
//! the rolling resistance, minus the weight component along the slope. The
//! integration uses constant acceleration over the step.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Standard gravity, m/s².
pub const GRAVITY: f64 = 9.81;

// ---------------------------------------------------------------------------
// Rolling stock
// ---------------------------------------------------------------------------

/// Davis formula coefficients: `R(v) = a + b·|v| + c·v²`, in newtons.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RollingResistance {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl RollingResistance {
    pub fn at(&self, speed: f64) -> f64 {
        let v = speed.abs();
        self.a + self.b * v + self.c * v * v
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TractiveEffortPoint {
    /// m/s
    pub speed: f64,
    /// N
    pub max_effort: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingStock {
    pub name: String,
    /// m
    pub length: f64,
    /// kg
    pub mass: f64,
    /// Accounts for rotating masses; multiplies the mass under acceleration.
    pub inertia_coefficient: f64,
    /// m/s
    pub max_speed: f64,
    pub rolling_resistance: RollingResistance,
    /// Sorted by speed.
    pub tractive_effort_curve: Vec<TractiveEffortPoint>,
    /// Service braking deceleration, m/s².
    pub gamma: f64,
}

impl RollingStock {
    pub fn inertia_mass(&self) -> f64 {
        self.mass * self.inertia_coefficient
    }

    pub fn max_brake_force(&self) -> f64 {
        self.inertia_mass() * self.gamma
    }

    /// Maximum tractive effort at a speed, interpolated linearly along the
    /// curve and held constant past its ends.
    pub fn max_effort(&self, speed: f64) -> f64 {
        let v = speed.abs();
        let curve = &self.tractive_effort_curve;
        let Some(first) = curve.first() else {
            return 0.0;
        };
        if v <= first.speed {
            return first.max_effort;
        }
        for pair in curve.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if v <= hi.speed {
                let ratio = (v - lo.speed) / (hi.speed - lo.speed);
                return lo.max_effort + (hi.max_effort - lo.max_effort) * ratio;
            }
        }
        curve[curve.len() - 1].max_effort
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut invalid = |reason: String| {
            errors.push(ValidationError::InvalidRollingStock(format!("{}: {reason}", self.name)))
        };
        for (what, value) in [
            ("length", self.length),
            ("mass", self.mass),
            ("inertia coefficient", self.inertia_coefficient),
            ("max speed", self.max_speed),
            ("gamma", self.gamma),
        ] {
            if !(value > 0.0) {
                invalid(format!("{what} must be positive, got {value}"));
            }
        }
        if self.tractive_effort_curve.is_empty() {
            invalid("empty tractive effort curve".to_string());
        }
        if self
            .tractive_effort_curve
            .windows(2)
            .any(|pair| pair[1].speed <= pair[0].speed)
        {
            invalid("tractive effort curve speeds must increase".to_string());
        }
        errors
    }
}

// ---------------------------------------------------------------------------
// Integrator
// ---------------------------------------------------------------------------

/// What the driver does during one step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// Traction force in newtons.
    Accelerate(f64),
    /// Braking force in newtons.
    Brake(f64),
    Coast,
    /// Full braking force, whatever the driver asks for.
    EmergencyBrake,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionUpdate {
    pub position_delta: f64,
    pub time_delta: f64,
    pub speed: f64,
}

/// Integrates a train's motion from a given speed on a given grade.
#[derive(Debug, Clone)]
pub struct TrainPhysicsIntegrator<'a> {
    time_step: f64,
    rolling_stock: &'a RollingStock,
    speed: f64,
    /// Weight component along the track, signed in the travel direction.
    weight_force: f64,
    inertia_mass: f64,
}

impl<'a> TrainPhysicsIntegrator<'a> {
    /// `grade` is in meters per kilometer, positive uphill.
    pub fn new(time_step: f64, rolling_stock: &'a RollingStock, speed: f64, grade: f64) -> Self {
        let angle = (grade / 1000.0).atan();
        Self {
            time_step,
            rolling_stock,
            speed,
            weight_force: -rolling_stock.mass * GRAVITY * angle.sin(),
            inertia_mass: rolling_stock.inertia_mass(),
        }
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn time_step(&self) -> f64 {
        self.time_step
    }

    /// Advance one step, or less when the train reaches `max_distance`
    /// (travel forward only) or comes to rest.
    pub fn compute_update(&self, action: Action, max_distance: f64) -> PositionUpdate {
        let (traction, brake) = match action {
            Action::Accelerate(force) => (force, 0.0),
            Action::Brake(force) => (0.0, force),
            Action::Coast => (0.0, 0.0),
            Action::EmergencyBrake => (0.0, self.rolling_stock.max_brake_force()),
        };
        let resistance = self.rolling_stock.rolling_resistance.at(self.speed);
        let driving = traction + self.weight_force;

        // Static friction: a train at rest stays there unless the driving
        // force beats everything holding it.
        if self.speed == 0.0 && driving.abs() <= resistance + brake {
            return PositionUpdate {
                position_delta: 0.0,
                time_delta: self.time_step,
                speed: 0.0,
            };
        }

        let direction = if self.speed != 0.0 {
            self.speed.signum()
        } else {
            driving.signum()
        };
        let acceleration = (driving - direction * (resistance + brake)) / self.inertia_mass;
        let v = self.speed;
        let mut dt = self.time_step;
        let mut new_speed = v + acceleration * dt;

        // Braking and resistance stop the train, they never reverse it.
        if v != 0.0 && (new_speed == 0.0 || new_speed.signum() != v.signum()) {
            dt = -v / acceleration;
            new_speed = 0.0;
        }
        let mut delta = v * dt + acceleration * dt * dt / 2.0;

        if delta > max_distance && max_distance >= 0.0 {
            let t = if acceleration.abs() < 1e-12 {
                max_distance / v
            } else {
                let discriminant = v * v + 2.0 * acceleration * max_distance;
                (-v + discriminant.max(0.0).sqrt()) / acceleration
            };
            dt = t;
            new_speed = (v + acceleration * t).max(0.0);
            delta = max_distance;
        }

        PositionUpdate {
            position_delta: delta,
            time_delta: dt,
            speed: new_speed,
        }
    }

    /// The action bringing the train as close as possible to `target` speed
    /// within one step.
    pub fn action_to_target_speed(&self, target: f64) -> Action {
        let max_brake = self.rolling_stock.max_brake_force();
        if self.speed == 0.0 && target <= 0.0 {
            return Action::Brake(max_brake);
        }
        let resistance = if self.speed == 0.0 {
            0.0
        } else {
            self.rolling_stock.rolling_resistance.at(self.speed) * self.speed.signum()
        };
        let required = self.inertia_mass * (target - self.speed) / self.time_step;
        let force = required - self.weight_force + resistance;
        if force > 0.0 {
            Action::Accelerate(force.min(self.rolling_stock.max_effort(self.speed)))
        } else if force < 0.0 {
            Action::Brake((-force).min(max_brake))
        } else {
            Action::Coast
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
