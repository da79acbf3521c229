//! Infrastructure definition.
//!
//! An [`InfraBuilder`] registers track sections, switches, waypoints, TVD
//! sections, routes, aspects, signaling functions and signals. [`InfraBuilder::build`]
//! validates everything in one pass, builds the waypoint overlay, resolves
//! signal expressions and computes the dependency maps the interlocking uses
//! to re-evaluate signals. The resulting [`Infra`] is immutable.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::config::SimConfig;
use crate::error::{ValidationError, ValidationErrors};
use crate::expr::{Expr, ExprSpec, FunctionDef, Resolver, ValueType};
use crate::id::*;
use crate::topology::*;

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SwitchDef {
    pub name: String,
    /// Seconds between a position change request and the switch locking in.
    pub position_change_delay: f64,
    pub initial_position: Option<SwitchBranch>,
}

#[derive(Debug, Clone)]
pub struct TvdSection {
    pub name: String,
    pub waypoints: Vec<WaypointId>,
    pub paths: Vec<TvdPathId>,
}

#[derive(Debug, Clone)]
pub struct Aspect {
    pub name: String,
    pub color: String,
    /// Speed a train must respect when it sees this aspect. `Some(0.0)` means
    /// stop before the signal.
    pub speed_limit: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub name: String,
    pub waypoints: Vec<WaypointId>,
    pub paths: Vec<(TvdPathId, EdgeDirection)>,
    /// Distinct TVD sections in travel order.
    pub sections: Vec<TvdSectionId>,
    pub switches: Vec<(SwitchId, SwitchBranch)>,
}

impl Route {
    pub fn entry(&self) -> WaypointId {
        self.waypoints[0]
    }

    pub fn exit(&self) -> WaypointId {
        self.waypoints[self.waypoints.len() - 1]
    }
}

#[derive(Debug, Clone)]
pub struct Signal {
    pub name: String,
    pub track: TrackSectionId,
    pub offset: f64,
    /// Travel direction the signal faces.
    pub direction: EdgeDirection,
    pub sight_distance: f64,
    pub expr: Expr,
    /// Evaluation rank: a signal is evaluated after every signal it reads.
    pub rank: u32,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

struct SwitchSpec {
    def: SwitchDef,
    base: TrackEndpoint,
    left: TrackEndpoint,
    right: TrackEndpoint,
}

struct FunctionSpec {
    name: String,
    args: Vec<(String, ValueType)>,
    returns: ValueType,
    body: ExprSpec,
}

struct SignalSpec {
    name: String,
    track: TrackSectionId,
    offset: f64,
    direction: EdgeDirection,
    sight_distance: Option<f64>,
    expr: ExprSpec,
}

/// Collects infrastructure objects, then validates and freezes them.
#[derive(Default)]
pub struct InfraBuilder {
    tracks: Vec<TrackSection>,
    links: Vec<(TrackEndpoint, TrackEndpoint)>,
    switches: Vec<SwitchSpec>,
    waypoints: Vec<Waypoint>,
    sections: Vec<(String, Vec<WaypointId>)>,
    aspects: Vec<Aspect>,
    routes: Vec<(String, Vec<WaypointId>)>,
    functions: Vec<FunctionSpec>,
    signals: Vec<SignalSpec>,
}

impl InfraBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a track section. `grade` is in meters per kilometer.
    pub fn add_track(&mut self, name: &str, length: f64, grade: f64) -> TrackSectionId {
        let id = TrackSectionId(self.tracks.len() as u32);
        self.tracks.push(TrackSection {
            name: name.to_string(),
            length,
            grade,
            speed_limit: None,
        });
        id
    }

    pub fn set_speed_limit(&mut self, track: TrackSectionId, speed: f64) {
        if let Some(t) = self.tracks.get_mut(track.index()) {
            t.speed_limit = Some(speed);
        }
    }

    pub fn link(&mut self, a: TrackEndpoint, b: TrackEndpoint) {
        self.links.push((a, b));
    }

    pub fn add_switch(
        &mut self,
        name: &str,
        base: TrackEndpoint,
        left: TrackEndpoint,
        right: TrackEndpoint,
        position_change_delay: f64,
    ) -> SwitchId {
        let id = SwitchId(self.switches.len() as u32);
        self.switches.push(SwitchSpec {
            def: SwitchDef {
                name: name.to_string(),
                position_change_delay,
                initial_position: None,
            },
            base,
            left,
            right,
        });
        id
    }

    pub fn set_initial_position(&mut self, switch: SwitchId, position: SwitchBranch) {
        if let Some(spec) = self.switches.get_mut(switch.index()) {
            spec.def.initial_position = Some(position);
        }
    }

    pub fn add_detector(&mut self, name: &str, track: TrackSectionId, offset: f64) -> WaypointId {
        self.add_waypoint(name, WaypointKind::Detector, track, offset)
    }

    pub fn add_buffer_stop(&mut self, name: &str, track: TrackSectionId, offset: f64) -> WaypointId {
        self.add_waypoint(name, WaypointKind::BufferStop, track, offset)
    }

    fn add_waypoint(
        &mut self,
        name: &str,
        kind: WaypointKind,
        track: TrackSectionId,
        offset: f64,
    ) -> WaypointId {
        let id = WaypointId(self.waypoints.len() as u32);
        self.waypoints.push(Waypoint {
            name: name.to_string(),
            kind,
            track,
            offset,
        });
        id
    }

    /// Declare a TVD section bounded by the given waypoints.
    pub fn add_tvd_section(&mut self, name: &str, waypoints: &[WaypointId]) -> TvdSectionId {
        let id = TvdSectionId(self.sections.len() as u32);
        self.sections.push((name.to_string(), waypoints.to_vec()));
        id
    }

    pub fn add_aspect(&mut self, name: &str, color: &str, speed_limit: Option<f64>) -> AspectId {
        let id = AspectId(self.aspects.len() as u32);
        self.aspects.push(Aspect {
            name: name.to_string(),
            color: color.to_string(),
            speed_limit,
        });
        id
    }

    /// Declare a route through consecutive waypoints. Its TVD paths, sections
    /// and switch positions are derived from the overlay at build time.
    pub fn add_route(&mut self, name: &str, waypoints: &[WaypointId]) -> RouteId {
        let id = RouteId(self.routes.len() as u32);
        self.routes.push((name.to_string(), waypoints.to_vec()));
        id
    }

    pub fn add_function(
        &mut self,
        name: &str,
        args: &[(&str, ValueType)],
        returns: ValueType,
        body: ExprSpec,
    ) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(FunctionSpec {
            name: name.to_string(),
            args: args.iter().map(|(n, t)| (n.to_string(), *t)).collect(),
            returns,
            body,
        });
        id
    }

    pub fn add_signal(
        &mut self,
        name: &str,
        track: TrackSectionId,
        offset: f64,
        direction: EdgeDirection,
        sight_distance: Option<f64>,
        expr: ExprSpec,
    ) -> SignalId {
        let id = SignalId(self.signals.len() as u32);
        self.signals.push(SignalSpec {
            name: name.to_string(),
            track,
            offset,
            direction,
            sight_distance,
            expr,
        });
        id
    }

    /// Validate and freeze the infrastructure.
    pub fn build(self, config: &SimConfig) -> Result<Infra, ValidationErrors> {
        let mut errors = Vec::new();

        for spec in &self.switches {
            if spec.def.position_change_delay < 0.0 {
                errors.push(ValidationError::NonPositive {
                    what: format!("delay of switch `{}`", spec.def.name),
                    value: spec.def.position_change_delay,
                });
            }
        }

        let mut nodes: Vec<TrackNode> = self
            .links
            .iter()
            .map(|(a, b)| TrackNode::Link(*a, *b))
            .collect();
        nodes.extend(self.switches.iter().enumerate().map(|(i, s)| TrackNode::Switch {
            switch: SwitchId(i as u32),
            base: s.base,
            left: s.left,
            right: s.right,
        }));

        let graph = match TrackGraph::new(self.tracks, nodes, self.waypoints) {
            Ok(graph) => graph,
            Err(ValidationErrors(mut graph_errors)) => {
                errors.append(&mut graph_errors);
                return Err(ValidationErrors(errors));
            }
        };
        let overlay = WaypointGraph::build(&graph);

        // -- Names -----------------------------------------------------------
        let aspect_names = name_map(self.aspects.iter().map(|a| a.name.as_str()), "aspect", AspectId, &mut errors);
        let route_names = name_map(self.routes.iter().map(|r| r.0.as_str()), "route", RouteId, &mut errors);
        let signal_names = name_map(self.signals.iter().map(|s| s.name.as_str()), "signal", SignalId, &mut errors);
        let function_names = name_map(self.functions.iter().map(|f| f.name.as_str()), "function", FunctionId, &mut errors);
        let switch_names = name_map(self.switches.iter().map(|s| s.def.name.as_str()), "switch", SwitchId, &mut errors);
        let waypoint_names = name_map(graph.waypoints.iter().map(|w| w.name.as_str()), "waypoint", WaypointId, &mut errors);

        // -- TVD sections ----------------------------------------------------
        let mut tvd_sections: Vec<TvdSection> = self
            .sections
            .into_iter()
            .map(|(name, waypoints)| TvdSection {
                name,
                waypoints,
                paths: Vec::new(),
            })
            .collect();
        let declared = tvd_sections.len();
        let mut path_sections = Vec::with_capacity(overlay.paths.len());
        for path in &overlay.paths {
            let owner = tvd_sections[..declared].iter().position(|section| {
                section.waypoints.contains(&path.start) && section.waypoints.contains(&path.end)
            });
            let section = match owner {
                Some(index) => TvdSectionId(index as u32),
                None if config.auto_tvd_sections => {
                    let id = TvdSectionId(tvd_sections.len() as u32);
                    tvd_sections.push(TvdSection {
                        name: format!(
                            "{}-{}",
                            graph.waypoint(path.start).name,
                            graph.waypoint(path.end).name
                        ),
                        waypoints: vec![path.start, path.end],
                        paths: Vec::new(),
                    });
                    id
                }
                None => {
                    errors.push(ValidationError::UnassignedTvdPath(path.id));
                    TvdSectionId(u32::MAX)
                }
            };
            if let Some(s) = tvd_sections.get_mut(section.index()) {
                s.paths.push(path.id);
            }
            path_sections.push(section);
        }

        // -- Routes ----------------------------------------------------------
        let mut routes = Vec::with_capacity(self.routes.len());
        for (name, waypoints) in self.routes {
            routes.push(build_route(&graph, &overlay, &path_sections, name, waypoints, &mut errors));
        }

        // -- Functions -------------------------------------------------------
        let signatures: Vec<(Vec<ValueType>, ValueType)> = self
            .functions
            .iter()
            .map(|f| (f.args.iter().map(|(_, t)| *t).collect(), f.returns))
            .collect();
        let resolver = Resolver {
            aspects: &aspect_names,
            signals: &signal_names,
            routes: &route_names,
            functions: &function_names,
            signatures: &signatures,
        };
        let mut functions = Vec::with_capacity(self.functions.len());
        for spec in &self.functions {
            let body = match resolver.resolve(&spec.body, Some(&spec.args), &spec.name) {
                Ok((body, found)) if found == spec.returns => body,
                Ok((_, found)) => {
                    errors.push(ValidationError::TypeMismatch {
                        context: spec.name.clone(),
                        expected: spec.returns,
                        found,
                    });
                    Expr::Bool(false)
                }
                Err(e) => {
                    errors.push(e);
                    Expr::Bool(false)
                }
            };
            functions.push(FunctionDef {
                name: spec.name.clone(),
                args: spec.args.clone(),
                returns: spec.returns,
                body,
            });
        }
        check_function_cycles(&functions, &mut errors);

        // -- Signals ---------------------------------------------------------
        let mut signals = Vec::with_capacity(self.signals.len());
        for spec in &self.signals {
            match graph.tracks.get(spec.track.index()) {
                None => errors.push(ValidationError::UnknownTrackSection(spec.track)),
                Some(track) if spec.offset < 0.0 || spec.offset > track.length => {
                    errors.push(ValidationError::OffsetOutOfRange {
                        kind: "signal",
                        name: spec.name.clone(),
                        offset: spec.offset,
                        length: track.length,
                    })
                }
                Some(_) => {}
            }
            let expr = match resolver.resolve(&spec.expr, None, &spec.name) {
                Ok((expr, ValueType::AspectSet)) => expr,
                Ok((_, found)) => {
                    errors.push(ValidationError::TypeMismatch {
                        context: spec.name.clone(),
                        expected: ValueType::AspectSet,
                        found,
                    });
                    Expr::AspectSet(Vec::new())
                }
                Err(e) => {
                    errors.push(e);
                    Expr::AspectSet(Vec::new())
                }
            };
            signals.push(Signal {
                name: spec.name.clone(),
                track: spec.track,
                offset: spec.offset,
                direction: spec.direction,
                sight_distance: spec.sight_distance.unwrap_or(config.driver_sight_distance),
                expr,
                rank: 0,
            });
        }

        if !errors.is_empty() {
            return Err(ValidationErrors(errors));
        }

        // -- Dependency maps -------------------------------------------------
        let mut route_signals = vec![BTreeSet::new(); routes.len()];
        let mut signal_dependents = vec![BTreeSet::new(); signals.len()];
        let mut signal_reads = vec![BTreeSet::new(); signals.len()];
        for (index, signal) in signals.iter().enumerate() {
            let id = SignalId(index as u32);
            let mut read_routes = BTreeSet::new();
            let mut read_signals = BTreeSet::new();
            signal.expr.collect_refs(&functions, &mut read_routes, &mut read_signals);
            for route in read_routes {
                route_signals[route.index()].insert(id);
            }
            for other in &read_signals {
                signal_dependents[other.index()].insert(id);
            }
            signal_reads[index] = read_signals;
        }

        let signal_order = match rank_signals(&signal_reads) {
            Ok(order) => order,
            Err(cyclic) => {
                return Err(ValidationErrors(
                    cyclic
                        .into_iter()
                        .map(|id| ValidationError::SignalCycle(signals[id.index()].name.clone()))
                        .collect(),
                ));
            }
        };
        for (id, rank) in &signal_order {
            signals[id.index()].rank = *rank;
        }

        let mut switch_routes = vec![Vec::new(); self.switches.len()];
        let mut section_routes = vec![Vec::new(); tvd_sections.len()];
        for (index, route) in routes.iter().enumerate() {
            let id = RouteId(index as u32);
            for (switch, _) in &route.switches {
                switch_routes[switch.index()].push(id);
            }
            for section in &route.sections {
                section_routes[section.index()].push(id);
            }
        }
        let switch_signals = switch_routes
            .iter()
            .map(|routes| {
                routes
                    .iter()
                    .flat_map(|r| route_signals[r.index()].iter().copied())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .collect();

        let mut track_signals = vec![Vec::new(); graph.tracks.len()];
        for (index, signal) in signals.iter().enumerate() {
            track_signals[signal.track.index()].push(SignalId(index as u32));
        }

        Ok(Infra {
            graph,
            overlay,
            switches: self.switches.into_iter().map(|s| s.def).collect(),
            tvd_sections,
            path_sections,
            aspects: self.aspects,
            routes,
            functions,
            signals,
            signal_order: signal_order.into_iter().map(|(id, _)| id).collect(),
            route_signals: route_signals.into_iter().map(|s| s.into_iter().collect()).collect(),
            switch_signals,
            signal_dependents: signal_dependents
                .into_iter()
                .map(|s| s.into_iter().collect())
                .collect(),
            switch_routes,
            section_routes,
            track_signals,
            route_names,
            signal_names,
            switch_names,
            waypoint_names,
            aspect_names,
        })
    }
}

fn name_map<'n, Id: Copy>(
    names: impl Iterator<Item = &'n str>,
    kind: &'static str,
    make_id: impl Fn(u32) -> Id,
    errors: &mut Vec<ValidationError>,
) -> HashMap<String, Id> {
    let mut map = HashMap::new();
    for (index, name) in names.enumerate() {
        let name = name.to_string();
        if map.insert(name.clone(), make_id(index as u32)).is_some() {
            errors.push(ValidationError::DuplicateName { kind, name });
        }
    }
    map
}

fn build_route(
    graph: &TrackGraph,
    overlay: &WaypointGraph,
    path_sections: &[TvdSectionId],
    name: String,
    waypoints: Vec<WaypointId>,
    errors: &mut Vec<ValidationError>,
) -> Route {
    let mut route = Route {
        name,
        waypoints,
        paths: Vec::new(),
        sections: Vec::new(),
        switches: Vec::new(),
    };
    if route.waypoints.len() < 2 {
        errors.push(ValidationError::EmptyRoute(route.name.clone()));
        return route;
    }
    if let Some(&unknown) = route
        .waypoints
        .iter()
        .find(|w| w.index() >= graph.waypoints.len())
    {
        errors.push(ValidationError::UnknownWaypoint(unknown));
        return route;
    }

    let mut switches: BTreeMap<SwitchId, SwitchBranch> = BTreeMap::new();
    for pair in route.waypoints.windows(2) {
        let Some((path, direction)) = overlay.path_between(pair[0], pair[1]) else {
            errors.push(ValidationError::NoTvdPath {
                route: route.name.clone(),
                from: pair[0],
                to: pair[1],
            });
            continue;
        };
        route.paths.push((path, direction));
        let section = path_sections[path.index()];
        if route.sections.last() != Some(&section) && !route.sections.contains(&section) {
            route.sections.push(section);
        }
        for &(switch, branch) in &overlay.path(path).switches {
            match switches.insert(switch, branch) {
                Some(previous) if previous != branch => {
                    errors.push(ValidationError::ConflictingSwitchPositions {
                        route: route.name.clone(),
                        switch,
                    });
                }
                _ => {}
            }
        }
    }
    route.switches = switches.into_iter().collect();
    route
}

fn check_function_cycles(functions: &[FunctionDef], errors: &mut Vec<ValidationError>) {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit(
        id: usize,
        functions: &[FunctionDef],
        marks: &mut [Mark],
        errors: &mut Vec<ValidationError>,
    ) {
        marks[id] = Mark::InProgress;
        let mut calls = BTreeSet::new();
        functions[id].body.collect_calls(&mut calls);
        for callee in calls {
            match marks[callee.index()] {
                Mark::InProgress => {
                    errors.push(ValidationError::FunctionCycle(functions[callee.index()].name.clone()))
                }
                Mark::Unvisited => visit(callee.index(), functions, marks, errors),
                Mark::Done => {}
            }
        }
        marks[id] = Mark::Done;
    }

    let mut marks = vec![Mark::Unvisited; functions.len()];
    for id in 0..functions.len() {
        if marks[id] == Mark::Unvisited {
            visit(id, functions, &mut marks, errors);
        }
    }
}

/// Kahn's algorithm over "reads" edges. Returns each signal with its rank in
/// evaluation order, or the signals stuck on a cycle.
fn rank_signals(reads: &[BTreeSet<SignalId>]) -> Result<Vec<(SignalId, u32)>, Vec<SignalId>> {
    let mut remaining: Vec<usize> = reads.iter().map(BTreeSet::len).collect();
    let mut readers = vec![Vec::new(); reads.len()];
    for (reader, read) in reads.iter().enumerate() {
        for signal in read {
            readers[signal.index()].push(reader);
        }
    }
    let mut rank = vec![0u32; reads.len()];
    let mut ready: BTreeSet<(u32, usize)> = remaining
        .iter()
        .enumerate()
        .filter(|(_, n)| **n == 0)
        .map(|(i, _)| (0, i))
        .collect();
    let mut order = Vec::with_capacity(reads.len());
    while let Some((r, index)) = ready.pop_first() {
        order.push((SignalId(index as u32), r));
        for &reader in &readers[index] {
            rank[reader] = rank[reader].max(r + 1);
            remaining[reader] -= 1;
            if remaining[reader] == 0 {
                ready.insert((rank[reader], reader));
            }
        }
    }
    if order.len() == reads.len() {
        Ok(order)
    } else {
        Err(remaining
            .iter()
            .enumerate()
            .filter(|(_, n)| **n > 0)
            .map(|(i, _)| SignalId(i as u32))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Infra
// ---------------------------------------------------------------------------

/// Immutable infrastructure. Shared by every simulation run on it.
#[derive(Debug)]
pub struct Infra {
    pub graph: TrackGraph,
    pub overlay: WaypointGraph,
    pub switches: Vec<SwitchDef>,
    pub tvd_sections: Vec<TvdSection>,
    path_sections: Vec<TvdSectionId>,
    pub aspects: Vec<Aspect>,
    pub routes: Vec<Route>,
    pub functions: Vec<FunctionDef>,
    pub signals: Vec<Signal>,
    /// Signals sorted by evaluation rank.
    pub signal_order: Vec<SignalId>,
    route_signals: Vec<Vec<SignalId>>,
    switch_signals: Vec<Vec<SignalId>>,
    signal_dependents: Vec<Vec<SignalId>>,
    switch_routes: Vec<Vec<RouteId>>,
    section_routes: Vec<Vec<RouteId>>,
    track_signals: Vec<Vec<SignalId>>,
    route_names: HashMap<String, RouteId>,
    signal_names: HashMap<String, SignalId>,
    switch_names: HashMap<String, SwitchId>,
    waypoint_names: HashMap<String, WaypointId>,
    aspect_names: HashMap<String, AspectId>,
}

impl Infra {
    pub fn route(&self, id: RouteId) -> &Route {
        &self.routes[id.index()]
    }

    pub fn signal(&self, id: SignalId) -> &Signal {
        &self.signals[id.index()]
    }

    pub fn switch(&self, id: SwitchId) -> &SwitchDef {
        &self.switches[id.index()]
    }

    pub fn aspect(&self, id: AspectId) -> &Aspect {
        &self.aspects[id.index()]
    }

    /// The TVD section a TVD path belongs to.
    pub fn section_of(&self, path: TvdPathId) -> TvdSectionId {
        self.path_sections[path.index()]
    }

    /// Signals whose expression reads the route.
    pub fn route_signals(&self, route: RouteId) -> &[SignalId] {
        &self.route_signals[route.index()]
    }

    /// Signals that read a route requiring the switch.
    pub fn switch_signals(&self, switch: SwitchId) -> &[SignalId] {
        &self.switch_signals[switch.index()]
    }

    /// Signals whose expression reads the signal.
    pub fn signal_dependents(&self, signal: SignalId) -> &[SignalId] {
        &self.signal_dependents[signal.index()]
    }

    pub fn switch_routes(&self, switch: SwitchId) -> &[RouteId] {
        &self.switch_routes[switch.index()]
    }

    pub fn section_routes(&self, section: TvdSectionId) -> &[RouteId] {
        &self.section_routes[section.index()]
    }

    pub fn track_signals(&self, track: TrackSectionId) -> &[SignalId] {
        &self.track_signals[track.index()]
    }

    pub fn route_id(&self, name: &str) -> Option<RouteId> {
        self.route_names.get(name).copied()
    }

    pub fn signal_id(&self, name: &str) -> Option<SignalId> {
        self.signal_names.get(name).copied()
    }

    pub fn switch_id(&self, name: &str) -> Option<SwitchId> {
        self.switch_names.get(name).copied()
    }

    pub fn waypoint_id(&self, name: &str) -> Option<WaypointId> {
        self.waypoint_names.get(name).copied()
    }

    pub fn aspect_id(&self, name: &str) -> Option<AspectId> {
        self.aspect_names.get(name).copied()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interlocking::RouteStatus;
    use crate::test_utils::*;

    // -----------------------------------------------------------------------
    // Test 1: Routes derive paths, sections and switches
    // -----------------------------------------------------------------------
    #[test]
    fn routes_derive_switch_positions() {
        let infra = switch_infra(42.0);
        let left = infra.route(infra.route_id("left").unwrap());
        let right = infra.route(infra.route_id("right").unwrap());
        assert_eq!(left.switches, vec![(SwitchId(0), SwitchBranch::Left)]);
        assert_eq!(right.switches, vec![(SwitchId(0), SwitchBranch::Right)]);
        assert_eq!(left.paths.len(), 1);
        assert_eq!(left.sections.len(), 1);
    }

    // -----------------------------------------------------------------------
    // Test 2: Undeclared paths get automatic sections
    // -----------------------------------------------------------------------
    #[test]
    fn undeclared_paths_get_auto_sections() {
        let infra = line_infra(3, 1000.0);
        // Four detectors on a line: three paths, three sections.
        assert_eq!(infra.overlay.paths.len(), 3);
        assert_eq!(infra.tvd_sections.len(), 3);
        for path in &infra.overlay.paths {
            let section = infra.section_of(path.id);
            assert_eq!(infra.tvd_sections[section.index()].paths, vec![path.id]);
        }
    }

    #[test]
    fn undeclared_paths_rejected_without_auto_sections() {
        let mut b = InfraBuilder::new();
        let t = b.add_track("t", 100.0, 0.0);
        b.add_detector("a", t, 10.0);
        b.add_detector("b", t, 90.0);
        let config = SimConfig {
            auto_tvd_sections: false,
            ..SimConfig::default()
        };
        let errors = b.build(&config).unwrap_err();
        assert!(errors.contains(|e| matches!(e, ValidationError::UnassignedTvdPath(_))));
    }

    // -----------------------------------------------------------------------
    // Test 3: Declared sections group several paths
    // -----------------------------------------------------------------------
    #[test]
    fn declared_section_groups_paths() {
        let mut b = InfraBuilder::new();
        let t = b.add_track("t", 300.0, 0.0);
        let d0 = b.add_detector("d0", t, 0.0);
        let d1 = b.add_detector("d1", t, 100.0);
        let d2 = b.add_detector("d2", t, 200.0);
        b.add_tvd_section("big", &[d0, d1, d2]);
        let infra = b.build(&SimConfig::default()).unwrap();
        assert_eq!(infra.tvd_sections.len(), 1);
        assert_eq!(infra.tvd_sections[0].paths.len(), 2);
    }

    // -----------------------------------------------------------------------
    // Test 4: Signal dependencies and ranks
    // -----------------------------------------------------------------------
    #[test]
    fn signal_ranks_follow_reads() {
        let infra = line_infra(3, 1000.0);
        // Each signal reads the route it protects and the next signal.
        let last = *infra.signal_order.last().unwrap();
        let first = infra.signal_order[0];
        assert!(infra.signal(last).rank > infra.signal(first).rank);
        for id in &infra.signal_order {
            for dependent in infra.signal_dependents(*id) {
                assert!(infra.signal(*dependent).rank > infra.signal(*id).rank);
            }
        }
        let r1 = infra.route_id("r1").unwrap();
        assert!(!infra.route_signals(r1).is_empty());
    }

    #[test]
    fn switch_signals_come_from_routes() {
        let infra = switch_infra(42.0);
        let signals = infra.switch_signals(SwitchId(0));
        assert_eq!(signals, &[infra.signal_id("S_junction").unwrap()]);
    }

    // -----------------------------------------------------------------------
    // Test 5: Construction errors are collected
    // -----------------------------------------------------------------------
    #[test]
    fn signal_cycles_are_rejected() {
        let mut b = InfraBuilder::new();
        let t = b.add_track("t", 100.0, 0.0);
        b.add_aspect("RED", "red", Some(0.0));
        let follows = |other: &str| ExprSpec::aspects_of(ExprSpec::signal(other));
        b.add_signal("A", t, 10.0, EdgeDirection::StartToStop, None, follows("B"));
        b.add_signal("B", t, 20.0, EdgeDirection::StartToStop, None, follows("A"));
        let errors = b.build(&SimConfig::default()).unwrap_err();
        assert_eq!(errors.0.len(), 2);
        assert!(errors.iter().all(|e| matches!(e, ValidationError::SignalCycle(_))));
    }

    #[test]
    fn function_cycles_are_rejected() {
        let mut b = InfraBuilder::new();
        b.add_function("f", &[], ValueType::Bool, ExprSpec::call("g", vec![]));
        b.add_function("g", &[], ValueType::Bool, ExprSpec::call("f", vec![]));
        let errors = b.build(&SimConfig::default()).unwrap_err();
        assert!(errors.contains(|e| matches!(e, ValidationError::FunctionCycle(_))));
    }

    #[test]
    fn bad_references_are_all_reported() {
        let mut b = InfraBuilder::new();
        let t = b.add_track("t", 100.0, 0.0);
        let d = b.add_detector("d", t, 50.0);
        b.add_route("empty", &[d]);
        b.add_route("ghost", &[d, WaypointId(9)]);
        b.add_signal(
            "S",
            t,
            150.0,
            EdgeDirection::StartToStop,
            None,
            ExprSpec::route_is(ExprSpec::route("nowhere"), RouteStatus::Free),
        );
        let errors = b.build(&SimConfig::default()).unwrap_err();
        assert!(errors.contains(|e| matches!(e, ValidationError::EmptyRoute(_))));
        assert!(errors.contains(|e| matches!(e, ValidationError::UnknownWaypoint(_))));
        assert!(errors.contains(|e| matches!(e, ValidationError::OffsetOutOfRange { .. })));
        assert!(errors.contains(|e| matches!(e, ValidationError::UnknownName { kind: "route", .. })));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut b = InfraBuilder::new();
        b.add_aspect("RED", "red", Some(0.0));
        b.add_aspect("RED", "red", Some(0.0));
        let errors = b.build(&SimConfig::default()).unwrap_err();
        assert!(errors.contains(|e| matches!(e, ValidationError::DuplicateName { kind: "aspect", .. })));
    }
}
