//! The path of a train: its routes unrolled into TVD paths, track ranges,
//! detector boundaries and facing signals, all located by a single path
//! coordinate starting at the entry of the first route.

use crate::error::{ValidationError, ValidationErrors};
use crate::id::*;
use crate::infra::Infra;
use crate::topology::{EdgeDirection, TrackRange};

/// A TVD path traversed by the train.
#[derive(Debug, Clone, PartialEq)]
pub struct PathSegment {
    pub path: TvdPathId,
    pub direction: EdgeDirection,
    pub section: TvdSectionId,
    /// Index of the route the segment belongs to, in the train's route list.
    pub route_index: usize,
    pub begin: f64,
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathRange {
    pub range: TrackRange,
    pub begin: f64,
    pub end: f64,
    /// Grade in the travel direction, ‰.
    pub grade: f64,
    pub speed_limit: Option<f64>,
}

/// A waypoint between two consecutive segments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathBoundary {
    pub position: f64,
    pub waypoint: WaypointId,
    /// Index of the segment ending here. The next one starts here.
    pub behind: usize,
}

impl PathBoundary {
    pub fn ahead(&self) -> usize {
        self.behind + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathSignal {
    pub signal: SignalId,
    pub position: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainPath {
    pub routes: Vec<RouteId>,
    pub segments: Vec<PathSegment>,
    pub ranges: Vec<PathRange>,
    pub boundaries: Vec<PathBoundary>,
    /// Signals facing the travel direction, by position.
    pub signals: Vec<PathSignal>,
    pub length: f64,
}

impl TrainPath {
    pub fn new(infra: &Infra, routes: &[RouteId]) -> Result<Self, ValidationErrors> {
        if routes.is_empty() {
            return Err(ValidationError::EmptyRoutePath.into());
        }
        let mut errors = Vec::new();
        for &route in routes {
            if route.index() >= infra.routes.len() {
                errors.push(ValidationError::UnknownRoute(route));
            }
        }
        if !errors.is_empty() {
            return Err(ValidationErrors(errors));
        }
        for pair in routes.windows(2) {
            if infra.route(pair[0]).exit() != infra.route(pair[1]).entry() {
                errors.push(ValidationError::DisconnectedRoutePath {
                    from: pair[0],
                    to: pair[1],
                });
            }
        }
        if !errors.is_empty() {
            return Err(ValidationErrors(errors));
        }

        let mut path = TrainPath {
            routes: routes.to_vec(),
            segments: Vec::new(),
            ranges: Vec::new(),
            boundaries: Vec::new(),
            signals: Vec::new(),
            length: 0.0,
        };
        for (route_index, &route) in routes.iter().enumerate() {
            for &(tvd_path, direction) in &infra.route(route).paths {
                let overlay_path = infra.overlay.path(tvd_path);
                let begin = path.length;
                if let Some(last) = path.segments.len().checked_sub(1) {
                    path.boundaries.push(PathBoundary {
                        position: begin,
                        waypoint: overlay_path.start_waypoint(direction),
                        behind: last,
                    });
                }
                let mut position = begin;
                for range in overlay_path.ranges_in(direction) {
                    let track = infra.graph.track(range.track);
                    let grade = match range.direction {
                        EdgeDirection::StartToStop => track.grade,
                        EdgeDirection::StopToStart => -track.grade,
                    };
                    let end = position + range.length();
                    path.ranges.push(PathRange {
                        range,
                        begin: position,
                        end,
                        grade,
                        speed_limit: track.speed_limit,
                    });
                    position = end;
                }
                path.segments.push(PathSegment {
                    path: tvd_path,
                    direction,
                    section: infra.section_of(tvd_path),
                    route_index,
                    begin,
                    end: position,
                });
                path.length = position;
            }
        }

        for range in &path.ranges {
            for &signal in infra.track_signals(range.range.track) {
                let def = infra.signal(signal);
                if def.direction != range.range.direction {
                    continue;
                }
                if let Some(distance) = range.range.distance_to(def.offset) {
                    path.signals.push(PathSignal {
                        signal,
                        position: range.begin + distance,
                    });
                }
            }
        }
        path.signals
            .sort_by(|a, b| a.position.total_cmp(&b.position).then(a.signal.cmp(&b.signal)));
        Ok(path)
    }

    /// Path position where the route at `index` ends.
    pub fn route_end(&self, index: usize) -> f64 {
        self.segments
            .iter()
            .filter(|s| s.route_index == index)
            .map(|s| s.end)
            .fold(0.0, f64::max)
    }

    /// Steepest grade under `[begin, end]`, ‰.
    pub fn max_grade(&self, begin: f64, end: f64) -> f64 {
        let grade = self
            .ranges
            .iter()
            .filter(|r| r.begin <= end && r.end >= begin)
            .map(|r| r.grade)
            .fold(f64::NEG_INFINITY, f64::max);
        if grade.is_finite() { grade } else { 0.0 }
    }

    /// Distinct TVD sections of the segments overlapping `(begin, end)`.
    pub fn sections_between(&self, begin: f64, end: f64) -> Vec<TvdSectionId> {
        let mut sections: Vec<TvdSectionId> = Vec::new();
        for segment in &self.segments {
            if segment.begin < end && segment.end > begin && !sections.contains(&segment.section) {
                sections.push(segment.section);
            }
        }
        sections
    }
}

// ===========================================================================
// Tests
// ===========================================================================
