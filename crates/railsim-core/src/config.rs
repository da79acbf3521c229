//! Simulation tuning knobs.
//!
//! Every field has a default, so partial configurations deserialize:
//!
//! ```rust,ignore
//! let config: SimConfig = serde_json::from_str(r#"{ "time_step": 0.5 }"#)?;
//! assert_eq!(config.max_integration_steps, 10_000);
//! ```

use crate::topology::SwitchBranch;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Integration step of the train physics, in seconds.
    pub time_step: f64,
    /// Hard cap on integration steps in a single evolution window.
    pub max_integration_steps: usize,
    /// Below this speed (m/s) a train counts as stopped.
    pub stopped_speed_epsilon: f64,
    /// Position of switches that have no explicit initial position.
    pub default_switch_position: SwitchBranch,
    /// How far ahead a driver sees signals, in meters.
    pub driver_sight_distance: f64,
    /// Distance before a stop signal at which trains aim to halt.
    pub signal_stop_margin: f64,
    /// Group TVD paths that belong to no declared section into sections of
    /// their own instead of rejecting the infrastructure.
    pub auto_tvd_sections: bool,
    /// Keep every applied change in the log. Needed for replay.
    pub record_changes: bool,
    /// Record a state hash every this many executed events.
    pub hash_checkpoint_interval: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            time_step: 1.0,
            max_integration_steps: 10_000,
            stopped_speed_epsilon: 1e-7,
            default_switch_position: SwitchBranch::Left,
            driver_sight_distance: 400.0,
            signal_stop_margin: 5.0,
            auto_tvd_sections: true,
            record_changes: true,
            hash_checkpoint_interval: None,
        }
    }
}
