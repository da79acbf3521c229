//! Data-driven loading of configuration and rolling stock from JSON.
//!
//! Feature-gated behind `data-loader`. Rolling stock catalogs are plain JSON
//! documents:
//!
//! ```json
//! {
//!   "rolling_stock": [
//!     {
//!       "name": "regional",
//!       "length": 120.0,
//!       "mass": 250000.0,
//!       "max_speed": 44.4,
//!       "rolling_resistance": { "a": 2500.0, "b": 30.0, "c": 5.0 },
//!       "tractive_effort_curve": [[0.0, 200000.0], [40.0, 90000.0]],
//!       "gamma": 0.6
//!     }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;

use crate::config::SimConfig;
use crate::error::ValidationErrors;
use crate::kinematics::{RollingResistance, RollingStock, TractiveEffortPoint};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during data loading.
#[derive(Debug, thiserror::Error)]
pub enum DataLoadError {
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("rolling stock `{name}` is invalid: {errors}")]
    InvalidRollingStock {
        name: String,
        errors: ValidationErrors,
    },
    #[error("duplicate rolling stock: {0}")]
    DuplicateRollingStock(String),
}

// ---------------------------------------------------------------------------
// JSON data structures
// ---------------------------------------------------------------------------

/// Top-level rolling stock catalog for JSON deserialization.
#[derive(Debug, serde::Deserialize)]
pub struct RollingStockCatalogData {
    #[serde(default)]
    pub rolling_stock: Vec<RollingStockData>,
}

/// JSON representation of a rolling stock.
#[derive(Debug, serde::Deserialize)]
pub struct RollingStockData {
    pub name: String,
    pub length: f64,
    pub mass: f64,
    #[serde(default = "default_inertia_coefficient")]
    pub inertia_coefficient: f64,
    pub max_speed: f64,
    #[serde(default)]
    pub rolling_resistance: ResistanceData,
    /// `[speed, max_effort]` pairs, by increasing speed.
    pub tractive_effort_curve: Vec<(f64, f64)>,
    pub gamma: f64,
}

/// JSON representation of the Davis resistance coefficients.
#[derive(Debug, Default, serde::Deserialize)]
pub struct ResistanceData {
    #[serde(default)]
    pub a: f64,
    #[serde(default)]
    pub b: f64,
    #[serde(default)]
    pub c: f64,
}

fn default_inertia_coefficient() -> f64 {
    1.0
}

impl From<RollingStockData> for RollingStock {
    fn from(data: RollingStockData) -> Self {
        RollingStock {
            name: data.name,
            length: data.length,
            mass: data.mass,
            inertia_coefficient: data.inertia_coefficient,
            max_speed: data.max_speed,
            rolling_resistance: RollingResistance {
                a: data.rolling_resistance.a,
                b: data.rolling_resistance.b,
                c: data.rolling_resistance.c,
            },
            tractive_effort_curve: data
                .tractive_effort_curve
                .into_iter()
                .map(|(speed, max_effort)| TractiveEffortPoint { speed, max_effort })
                .collect(),
            gamma: data.gamma,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading functions
// ---------------------------------------------------------------------------

/// Load a simulation configuration from a JSON string. Missing fields keep
/// their defaults.
pub fn load_config_json(json: &str) -> Result<SimConfig, DataLoadError> {
    Ok(serde_json::from_str(json)?)
}

/// Load a rolling stock catalog from a JSON string, keyed by name.
pub fn load_rolling_stock_json(json: &str) -> Result<BTreeMap<String, RollingStock>, DataLoadError> {
    let data: RollingStockCatalogData = serde_json::from_str(json)?;
    build_catalog(data)
}

/// Load a rolling stock catalog from JSON bytes.
pub fn load_rolling_stock_json_bytes(
    bytes: &[u8],
) -> Result<BTreeMap<String, RollingStock>, DataLoadError> {
    let data: RollingStockCatalogData = serde_json::from_slice(bytes)?;
    build_catalog(data)
}

fn build_catalog(
    data: RollingStockCatalogData,
) -> Result<BTreeMap<String, RollingStock>, DataLoadError> {
    let mut catalog = BTreeMap::new();
    for stock_data in data.rolling_stock {
        let stock = RollingStock::from(stock_data);
        let errors = stock.validate();
        if !errors.is_empty() {
            return Err(DataLoadError::InvalidRollingStock {
                name: stock.name,
                errors: ValidationErrors(errors),
            });
        }
        if catalog.contains_key(&stock.name) {
            return Err(DataLoadError::DuplicateRollingStock(stock.name));
        }
        catalog.insert(stock.name.clone(), stock);
    }
    Ok(catalog)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::topology::SwitchBranch;

    const REGIONAL: &str = r#"{
        "rolling_stock": [
            {
                "name": "regional",
                "length": 120.0,
                "mass": 250000.0,
                "max_speed": 44.4,
                "rolling_resistance": { "a": 2500.0, "b": 30.0, "c": 5.0 },
                "tractive_effort_curve": [[0.0, 200000.0], [40.0, 90000.0]],
                "gamma": 0.6
            }
        ]
    }"#;

    #[test]
    fn load_empty_json() {
        let catalog = load_rolling_stock_json("{}").unwrap();
        assert!(catalog.is_empty());
    }

    #[test]
    fn load_rolling_stock() {
        let catalog = load_rolling_stock_json(REGIONAL).unwrap();
        let stock = &catalog["regional"];
        assert_eq!(stock.length, 120.0);
        assert_eq!(stock.inertia_coefficient, 1.0);
        assert_eq!(stock.rolling_resistance.b, 30.0);
        assert_eq!(stock.tractive_effort_curve.len(), 2);
        assert_eq!(stock.max_effort(20.0), 145_000.0);
    }

    #[test]
    fn load_rolling_stock_from_bytes() {
        let catalog = load_rolling_stock_json_bytes(REGIONAL.as_bytes()).unwrap();
        assert!(catalog.contains_key("regional"));
    }

    #[test]
    fn load_invalid_json_fails() {
        let result = load_rolling_stock_json("not json");
        assert!(matches!(result, Err(DataLoadError::JsonParse(_))));
    }

    #[test]
    fn invalid_rolling_stock_rejected() {
        let json = r#"{
            "rolling_stock": [
                {
                    "name": "broken",
                    "length": 100.0,
                    "mass": 0.0,
                    "max_speed": 30.0,
                    "tractive_effort_curve": [],
                    "gamma": 0.5
                }
            ]
        }"#;
        let Err(DataLoadError::InvalidRollingStock { name, errors }) = load_rolling_stock_json(json)
        else {
            panic!("expected an invalid rolling stock");
        };
        assert_eq!(name, "broken");
        assert_eq!(errors.0.len(), 2);
        assert!(errors.contains(|e| matches!(e, ValidationError::InvalidRollingStock(msg) if msg.contains("mass"))));
    }

    #[test]
    fn duplicate_rolling_stock_rejected() {
        let stock = r#"{ "name": "twin", "length": 50.0, "mass": 1000.0, "max_speed": 10.0,
                         "tractive_effort_curve": [[0.0, 100.0]], "gamma": 1.0 }"#;
        let json = format!(r#"{{ "rolling_stock": [{stock}, {stock}] }}"#);
        let result = load_rolling_stock_json(&json);
        assert!(matches!(result, Err(DataLoadError::DuplicateRollingStock(name)) if name == "twin"));
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config = load_config_json(r#"{ "time_step": 0.5, "default_switch_position": "Right" }"#)
            .unwrap();
        assert_eq!(config.time_step, 0.5);
        assert_eq!(config.default_switch_position, SwitchBranch::Right);
        assert_eq!(config.max_integration_steps, 10_000);
    }
}
