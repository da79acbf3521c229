//! Shared test helpers for unit tests, integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use crate::config::SimConfig;
use crate::expr::{AspectSetMemberSpec, ExprSpec, ValueType};
use crate::id::*;
use crate::infra::{Infra, InfraBuilder};
use crate::interlocking::RouteStatus;
use crate::kinematics::{RollingResistance, RollingStock, TractiveEffortPoint};
use crate::topology::{EdgeDirection, TrackEndpoint};

// ===========================================================================
// Logging
// ===========================================================================

/// Route `log` output to the test harness. Safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ===========================================================================
// Rolling stock
// ===========================================================================

/// A 400 m passenger train, 900 t, up to 300 km/h.
pub fn fast_rolling_stock() -> RollingStock {
    RollingStock {
        name: "fast".to_string(),
        length: 400.0,
        mass: 900_000.0,
        inertia_coefficient: 1.05,
        max_speed: 83.33,
        rolling_resistance: RollingResistance {
            a: 5600.0,
            b: 100.0,
            c: 10.0,
        },
        tractive_effort_curve: vec![
            TractiveEffortPoint {
                speed: 0.0,
                max_effort: 500_000.0,
            },
            TractiveEffortPoint {
                speed: 25.0,
                max_effort: 500_000.0,
            },
            TractiveEffortPoint {
                speed: 80.0,
                max_effort: 150_000.0,
            },
        ],
        gamma: 0.5,
    }
}

/// Rolling stock without resistance nor traction.
pub fn frictionless_rolling_stock() -> RollingStock {
    RollingStock {
        name: "frictionless".to_string(),
        rolling_resistance: RollingResistance {
            a: 0.0,
            b: 0.0,
            c: 0.0,
        },
        tractive_effort_curve: vec![TractiveEffortPoint {
            speed: 0.0,
            max_effort: 0.0,
        }],
        ..fast_rolling_stock()
    }
}

// ===========================================================================
// Expressions
// ===========================================================================

fn member(aspect: &str, condition: ExprSpec) -> AspectSetMemberSpec {
    AspectSetMemberSpec {
        aspect: aspect.to_string(),
        condition: Some(condition),
    }
}

/// Block signaling: RED unless the route is reserved, YELLOW when the next
/// signal is RED, GREEN otherwise.
fn block_aspects(route: ExprSpec, next: ExprSpec) -> ExprSpec {
    let reserved = ExprSpec::route_is(route, RouteStatus::Reserved);
    let next_red = ExprSpec::contains(ExprSpec::aspects_of(next), &["RED"]);
    ExprSpec::AspectSet(vec![
        member("RED", ExprSpec::not(reserved.clone())),
        member("YELLOW", ExprSpec::And(vec![reserved.clone(), next_red.clone()])),
        member("GREEN", ExprSpec::And(vec![reserved, ExprSpec::not(next_red)])),
    ])
}

/// RED unless one of the routes is reserved.
fn route_aspects(routes: &[&str]) -> ExprSpec {
    let reserved = ExprSpec::Or(
        routes
            .iter()
            .map(|r| ExprSpec::route_is(ExprSpec::route(r), RouteStatus::Reserved))
            .collect(),
    );
    ExprSpec::AspectSet(vec![
        member("RED", ExprSpec::not(reserved.clone())),
        member("GREEN", reserved),
    ])
}

// ===========================================================================
// Infrastructures
// ===========================================================================

/// A straight track cut into `blocks` blocks of `block_length` meters.
///
/// Detectors `d0..=dN` bound the blocks, route `ri` spans block `i` and
/// signal `Si` protects it at its entry, reading the next signal.
pub fn line_infra(blocks: usize, block_length: f64) -> Infra {
    line_infra_with_limit(blocks, block_length, None)
}

pub fn line_infra_with_limit(blocks: usize, block_length: f64, speed_limit: Option<f64>) -> Infra {
    let mut b = InfraBuilder::new();
    let track = b.add_track("t", blocks as f64 * block_length, 0.0);
    if let Some(limit) = speed_limit {
        b.set_speed_limit(track, limit);
    }
    let detectors: Vec<WaypointId> = (0..=blocks)
        .map(|i| b.add_detector(&format!("d{i}"), track, i as f64 * block_length))
        .collect();
    for i in 0..blocks {
        b.add_route(&format!("r{i}"), &[detectors[i], detectors[i + 1]]);
    }

    b.add_aspect("GREEN", "green", None);
    b.add_aspect("YELLOW", "yellow", None);
    b.add_aspect("RED", "red", Some(0.0));
    b.add_function(
        "bal",
        &[("next", ValueType::Signal), ("route", ValueType::Route)],
        ValueType::AspectSet,
        block_aspects(ExprSpec::arg("route"), ExprSpec::arg("next")),
    );

    for i in 0..blocks {
        let route = format!("r{i}");
        let expr = if i + 1 < blocks {
            ExprSpec::call(
                "bal",
                vec![ExprSpec::signal(&format!("S{}", i + 1)), ExprSpec::route(&route)],
            )
        } else {
            route_aspects(&[&route])
        };
        b.add_signal(
            &format!("S{i}"),
            track,
            i as f64 * block_length,
            EdgeDirection::StartToStop,
            None,
            expr,
        );
    }
    b.build(&SimConfig::default()).unwrap()
}

/// Routes `r0..r(blocks-1)` of a [`line_infra`].
pub fn line_routes(infra: &Infra, blocks: usize) -> Vec<RouteId> {
    (0..blocks)
        .map(|i| infra.route_id(&format!("r{i}")).unwrap())
        .collect()
}

/// A 1000 m approach track `t0` ending on a switch towards two 500 m
/// branches, `t1` on the left and `t2` on the right.
///
/// Detectors: `A` at t0:100, `B` at t0:900, `L` at t1:400, `R` at t2:400.
/// Routes: `entry` (A to B), `left` (B to L), `right` (B to R), the last two
/// sharing TVD section `switch_zone`. Signal `S_junction` at B shows GREEN
/// when `left` or `right` is reserved.
pub fn switch_infra(delay: f64) -> Infra {
    let mut b = InfraBuilder::new();
    let t0 = b.add_track("t0", 1000.0, 0.0);
    let t1 = b.add_track("t1", 500.0, 0.0);
    let t2 = b.add_track("t2", 500.0, 0.0);
    b.add_switch(
        "sw",
        TrackEndpoint::end(t0),
        TrackEndpoint::begin(t1),
        TrackEndpoint::begin(t2),
        delay,
    );

    let a = b.add_detector("A", t0, 100.0);
    let bd = b.add_detector("B", t0, 900.0);
    let l = b.add_detector("L", t1, 400.0);
    let r = b.add_detector("R", t2, 400.0);
    b.add_tvd_section("switch_zone", &[bd, l, r]);

    b.add_route("entry", &[a, bd]);
    b.add_route("left", &[bd, l]);
    b.add_route("right", &[bd, r]);

    b.add_aspect("GREEN", "green", None);
    b.add_aspect("RED", "red", Some(0.0));
    b.add_signal(
        "S_junction",
        t0,
        900.0,
        EdgeDirection::StartToStop,
        None,
        route_aspects(&["left", "right"]),
    );
    b.build(&SimConfig::default()).unwrap()
}
