//! Physical track graph and the waypoint overlay built on top of it.
//!
//! The track graph is made of track sections joined at their endpoints by
//! links and switches. Detectors and buffer stops (waypoints) sit on track
//! sections. The overlay collapses the track graph into the paths between
//! consecutive waypoints: each [`TvdSectionPath`] is the stretch of track a
//! train covers between two waypoints, with the switch positions it needs.

use std::collections::HashMap;

use crate::error::{ValidationError, ValidationErrors};
use crate::id::*;

// ---------------------------------------------------------------------------
// Basic types
// ---------------------------------------------------------------------------

/// Which end of a track section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TrackEnd {
    Begin,
    End,
}

/// One end of one track section. Nodes connect endpoints together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TrackEndpoint {
    pub track: TrackSectionId,
    pub end: TrackEnd,
}

impl TrackEndpoint {
    pub fn begin(track: TrackSectionId) -> Self {
        Self {
            track,
            end: TrackEnd::Begin,
        }
    }

    pub fn end(track: TrackSectionId) -> Self {
        Self {
            track,
            end: TrackEnd::End,
        }
    }
}

/// Direction of travel along a track section, relative to its own offsets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum EdgeDirection {
    StartToStop,
    StopToStart,
}

impl EdgeDirection {
    pub fn opposite(self) -> Self {
        match self {
            EdgeDirection::StartToStop => EdgeDirection::StopToStart,
            EdgeDirection::StopToStart => EdgeDirection::StartToStop,
        }
    }

    /// Direction of travel when entering a track through the given end.
    fn entering_from(end: TrackEnd) -> Self {
        match end {
            TrackEnd::Begin => EdgeDirection::StartToStop,
            TrackEnd::End => EdgeDirection::StopToStart,
        }
    }

    /// The end a train leaves through when travelling in this direction.
    fn exit_end(self) -> TrackEnd {
        match self {
            EdgeDirection::StartToStop => TrackEnd::End,
            EdgeDirection::StopToStart => TrackEnd::Begin,
        }
    }
}

/// A switch branch a route can require.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum SwitchBranch {
    Left,
    Right,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TrackSection {
    pub name: String,
    pub length: f64,
    /// Slope in meters per kilometer, positive uphill from begin to end.
    pub grade: f64,
    /// Line speed in m/s, if restricted.
    pub speed_limit: Option<f64>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum TrackNode {
    /// Two track ends joined without a choice of direction.
    Link(TrackEndpoint, TrackEndpoint),
    /// A base end that leads to either a left or a right end.
    Switch {
        switch: SwitchId,
        base: TrackEndpoint,
        left: TrackEndpoint,
        right: TrackEndpoint,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WaypointKind {
    Detector,
    BufferStop,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Waypoint {
    pub name: String,
    pub kind: WaypointKind,
    pub track: TrackSectionId,
    pub offset: f64,
}

/// A directed stretch of one track section. `begin` is where a train enters
/// and `end` where it leaves, both in track offsets.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TrackRange {
    pub track: TrackSectionId,
    pub begin: f64,
    pub end: f64,
    pub direction: EdgeDirection,
}

impl TrackRange {
    pub fn length(&self) -> f64 {
        (self.end - self.begin).abs()
    }

    pub fn reversed(&self) -> Self {
        Self {
            track: self.track,
            begin: self.end,
            end: self.begin,
            direction: self.direction.opposite(),
        }
    }

    /// Distance from the range entry to a track offset, if the offset lies in
    /// `[begin, end)` in travel order.
    pub fn distance_to(&self, offset: f64) -> Option<f64> {
        let distance = match self.direction {
            EdgeDirection::StartToStop => offset - self.begin,
            EdgeDirection::StopToStart => self.begin - offset,
        };
        (distance >= 0.0 && distance < self.length()).then_some(distance)
    }
}

// ---------------------------------------------------------------------------
// Track graph
// ---------------------------------------------------------------------------

/// The physical track graph. Immutable once built.
#[derive(Debug, Clone)]
pub struct TrackGraph {
    pub tracks: Vec<TrackSection>,
    pub nodes: Vec<TrackNode>,
    pub waypoints: Vec<Waypoint>,
    endpoint_nodes: HashMap<TrackEndpoint, usize>,
    /// Waypoints of each track, sorted by offset.
    track_waypoints: Vec<Vec<(f64, WaypointId)>>,
}

impl TrackGraph {
    pub fn new(
        tracks: Vec<TrackSection>,
        nodes: Vec<TrackNode>,
        waypoints: Vec<Waypoint>,
    ) -> Result<Self, ValidationErrors> {
        let mut errors = Vec::new();

        for track in &tracks {
            if track.length <= 0.0 {
                errors.push(ValidationError::NonPositive {
                    what: format!("length of track `{}`", track.name),
                    value: track.length,
                });
            }
        }

        let mut endpoint_nodes = HashMap::new();
        for (index, node) in nodes.iter().enumerate() {
            let endpoints = match node {
                TrackNode::Link(a, b) => vec![*a, *b],
                TrackNode::Switch {
                    base, left, right, ..
                } => vec![*base, *left, *right],
            };
            for endpoint in endpoints {
                if endpoint.track.index() >= tracks.len() {
                    errors.push(ValidationError::UnknownTrackSection(endpoint.track));
                } else if endpoint_nodes.insert(endpoint, index).is_some() {
                    errors.push(ValidationError::EndpointConnectedTwice(format!(
                        "{:?} of `{}`",
                        endpoint.end,
                        tracks[endpoint.track.index()].name
                    )));
                }
            }
        }

        let mut track_waypoints = vec![Vec::new(); tracks.len()];
        for (index, waypoint) in waypoints.iter().enumerate() {
            let Some(track) = tracks.get(waypoint.track.index()) else {
                errors.push(ValidationError::UnknownTrackSection(waypoint.track));
                continue;
            };
            if waypoint.offset < 0.0 || waypoint.offset > track.length {
                errors.push(ValidationError::OffsetOutOfRange {
                    kind: "waypoint",
                    name: waypoint.name.clone(),
                    offset: waypoint.offset,
                    length: track.length,
                });
                continue;
            }
            track_waypoints[waypoint.track.index()]
                .push((waypoint.offset, WaypointId(index as u32)));
        }
        for list in &mut track_waypoints {
            list.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        }

        if !errors.is_empty() {
            return Err(ValidationErrors(errors));
        }
        Ok(Self {
            tracks,
            nodes,
            waypoints,
            endpoint_nodes,
            track_waypoints,
        })
    }

    pub fn track(&self, id: TrackSectionId) -> &TrackSection {
        &self.tracks[id.index()]
    }

    pub fn waypoint(&self, id: WaypointId) -> &Waypoint {
        &self.waypoints[id.index()]
    }

    /// Track ends reachable when leaving a track through `exit`, with the
    /// switch position each one requires.
    pub fn neighbors(
        &self,
        exit: TrackEndpoint,
    ) -> Vec<(TrackEndpoint, Option<(SwitchId, SwitchBranch)>)> {
        let Some(&node) = self.endpoint_nodes.get(&exit) else {
            return Vec::new();
        };
        match &self.nodes[node] {
            TrackNode::Link(a, b) => {
                let other = if *a == exit { *b } else { *a };
                vec![(other, None)]
            }
            TrackNode::Switch {
                switch,
                base,
                left,
                right,
            } => {
                if *base == exit {
                    vec![
                        (*left, Some((*switch, SwitchBranch::Left))),
                        (*right, Some((*switch, SwitchBranch::Right))),
                    ]
                } else if *left == exit {
                    vec![(*base, Some((*switch, SwitchBranch::Left)))]
                } else {
                    vec![(*base, Some((*switch, SwitchBranch::Right)))]
                }
            }
        }
    }

    /// The nearest waypoint on `track` past `from` in `direction`.
    /// `inclusive` also accepts a waypoint exactly at `from`.
    fn next_waypoint(
        &self,
        track: TrackSectionId,
        from: f64,
        direction: EdgeDirection,
        inclusive: bool,
    ) -> Option<(f64, WaypointId)> {
        let list = &self.track_waypoints[track.index()];
        let ahead = |offset: f64| match (direction, inclusive) {
            (EdgeDirection::StartToStop, true) => offset >= from,
            (EdgeDirection::StartToStop, false) => offset > from,
            (EdgeDirection::StopToStart, true) => offset <= from,
            (EdgeDirection::StopToStart, false) => offset < from,
        };
        match direction {
            EdgeDirection::StartToStop => list.iter().copied().find(|(o, _)| ahead(*o)),
            EdgeDirection::StopToStart => list.iter().rev().copied().find(|(o, _)| ahead(*o)),
        }
    }
}

// ---------------------------------------------------------------------------
// Waypoint overlay
// ---------------------------------------------------------------------------

/// The track between two consecutive waypoints, oriented from `start` to
/// `end`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TvdSectionPath {
    pub id: TvdPathId,
    pub start: WaypointId,
    pub end: WaypointId,
    pub length: f64,
    pub ranges: Vec<TrackRange>,
    pub switches: Vec<(SwitchId, SwitchBranch)>,
}

impl TvdSectionPath {
    /// Track ranges in travel order for the given traversal direction.
    pub fn ranges_in(&self, direction: EdgeDirection) -> Vec<TrackRange> {
        match direction {
            EdgeDirection::StartToStop => self.ranges.clone(),
            EdgeDirection::StopToStart => self.ranges.iter().rev().map(TrackRange::reversed).collect(),
        }
    }

    pub fn end_waypoint(&self, direction: EdgeDirection) -> WaypointId {
        match direction {
            EdgeDirection::StartToStop => self.end,
            EdgeDirection::StopToStart => self.start,
        }
    }

    pub fn start_waypoint(&self, direction: EdgeDirection) -> WaypointId {
        match direction {
            EdgeDirection::StartToStop => self.start,
            EdgeDirection::StopToStart => self.end,
        }
    }
}

/// All paths between neighboring waypoints.
#[derive(Debug, Clone, Default)]
pub struct WaypointGraph {
    pub paths: Vec<TvdSectionPath>,
    by_pair: HashMap<(WaypointId, WaypointId), TvdPathId>,
}

struct PartialPath {
    ranges: Vec<TrackRange>,
    switches: Vec<(SwitchId, SwitchBranch)>,
    visited: Vec<(TrackSectionId, EdgeDirection)>,
}

impl WaypointGraph {
    /// Walk the track graph from every waypoint in both directions until the
    /// next waypoint. Each unordered pair of waypoints gets a single path.
    pub fn build(graph: &TrackGraph) -> Self {
        let mut overlay = Self::default();
        for (index, waypoint) in graph.waypoints.iter().enumerate() {
            let origin = WaypointId(index as u32);
            for direction in [EdgeDirection::StartToStop, EdgeDirection::StopToStart] {
                let walk = PartialPath {
                    ranges: Vec::new(),
                    switches: Vec::new(),
                    visited: vec![(waypoint.track, direction)],
                };
                overlay.explore(
                    graph,
                    origin,
                    waypoint.track,
                    waypoint.offset,
                    direction,
                    false,
                    walk,
                );
            }
        }
        overlay
    }

    #[allow(clippy::too_many_arguments)]
    fn explore(
        &mut self,
        graph: &TrackGraph,
        origin: WaypointId,
        track: TrackSectionId,
        from: f64,
        direction: EdgeDirection,
        inclusive: bool,
        mut walk: PartialPath,
    ) {
        if let Some((offset, end)) = graph.next_waypoint(track, from, direction, inclusive) {
            push_range(&mut walk.ranges, track, from, offset, direction);
            self.add_path(origin, end, walk);
            return;
        }

        let exit_offset = match direction {
            EdgeDirection::StartToStop => graph.track(track).length,
            EdgeDirection::StopToStart => 0.0,
        };
        push_range(&mut walk.ranges, track, from, exit_offset, direction);

        let exit = TrackEndpoint {
            track,
            end: direction.exit_end(),
        };
        for (entry, switch) in graph.neighbors(exit) {
            let next_direction = EdgeDirection::entering_from(entry.end);
            if walk.visited.contains(&(entry.track, next_direction)) {
                continue;
            }
            let mut branch = PartialPath {
                ranges: walk.ranges.clone(),
                switches: walk.switches.clone(),
                visited: walk.visited.clone(),
            };
            branch.visited.push((entry.track, next_direction));
            if let Some(position) = switch {
                branch.switches.push(position);
            }
            let entry_offset = match entry.end {
                TrackEnd::Begin => 0.0,
                TrackEnd::End => graph.track(entry.track).length,
            };
            self.explore(
                graph,
                origin,
                entry.track,
                entry_offset,
                next_direction,
                true,
                branch,
            );
        }
    }

    fn add_path(&mut self, start: WaypointId, end: WaypointId, walk: PartialPath) {
        if start == end {
            return;
        }
        let key = (start.min(end), start.max(end));
        if self.by_pair.contains_key(&key) {
            return;
        }
        let id = TvdPathId(self.paths.len() as u32);
        let length = walk.ranges.iter().map(TrackRange::length).sum();
        self.paths.push(TvdSectionPath {
            id,
            start,
            end,
            length,
            ranges: walk.ranges,
            switches: walk.switches,
        });
        self.by_pair.insert(key, id);
    }

    pub fn path(&self, id: TvdPathId) -> &TvdSectionPath {
        &self.paths[id.index()]
    }

    /// The path joining two waypoints and the direction to traverse it in to
    /// go from `from` to `to`.
    pub fn path_between(&self, from: WaypointId, to: WaypointId) -> Option<(TvdPathId, EdgeDirection)> {
        let id = *self.by_pair.get(&(from.min(to), from.max(to)))?;
        let direction = if self.paths[id.index()].start == from {
            EdgeDirection::StartToStop
        } else {
            EdgeDirection::StopToStart
        };
        Some((id, direction))
    }
}

fn push_range(
    ranges: &mut Vec<TrackRange>,
    track: TrackSectionId,
    begin: f64,
    end: f64,
    direction: EdgeDirection,
) {
    if begin != end {
        ranges.push(TrackRange {
            track,
            begin,
            end,
            direction,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
