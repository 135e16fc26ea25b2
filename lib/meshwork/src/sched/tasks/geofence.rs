//! Geofence triggers over position updates.
//!
//! Fences are circles or polygons. Transitions fire entry/exit events; a
//! node staying inside can additionally fire a periodic while-inside
//! event.

use crate::events::MeshEvent;
use crate::sched::{AutomationTask, NodeFilter, TaskContext};
use ferrite::time::timestamp_millis;
use ferrite::NodeNum;
use hashbrown::HashMap;
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

pub const TASK_NAME: &str = "geofence";

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "shape")]
pub enum FenceShape {
    Circle {
        latitude: f64,
        longitude: f64,
        radius_m: f64,
    },
    Polygon {
        /// `(latitude, longitude)` vertices, implicitly closed.
        points: Vec<(f64, f64)>,
    },
}

impl FenceShape {
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        match self {
            FenceShape::Circle {
                latitude: center_lat,
                longitude: center_lon,
                radius_m,
            } => haversine_m(latitude, longitude, *center_lat, *center_lon) <= *radius_m,
            FenceShape::Polygon { points } => point_in_polygon(latitude, longitude, points),
        }
    }
}

/// Great-circle distance in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);

    2.0 * a.sqrt().asin() * EARTH_RADIUS_M
}

/// Ray casting over the vertex list.
fn point_in_polygon(latitude: f64, longitude: f64, points: &[(f64, f64)]) -> bool {
    if points.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = points.len() - 1;

    for i in 0..points.len() {
        let (lat_i, lon_i) = points[i];
        let (lat_j, lon_j) = points[j];

        if ((lon_i > longitude) != (lon_j > longitude))
            && (latitude
                < (lat_j - lat_i) * (longitude - lon_i) / (lon_j - lon_i) + lat_i)
        {
            inside = !inside;
        }

        j = i;
    }

    inside
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeofenceConfig {
    pub name: String,
    #[serde(flatten)]
    pub shape: FenceShape,
    /// Which nodes the fence watches.
    #[serde(default)]
    pub filter: NodeFilter,
    #[serde(default)]
    pub on_entry: bool,
    #[serde(default)]
    pub on_exit: bool,
    /// Fire repeatedly while a node stays inside, at this cadence.
    #[serde(default)]
    pub while_inside_minutes: Option<u64>,
}

struct Presence {
    inside: bool,
    last_while_fired_ms: u64,
}

pub struct GeofenceTriggers {
    presence: HashMap<(usize, NodeNum), Presence>,
}

impl GeofenceTriggers {
    pub fn new() -> GeofenceTriggers {
        GeofenceTriggers {
            presence: HashMap::new(),
        }
    }

    fn evaluate(&mut self, ctx: &TaskContext, num: NodeNum, latitude: f64, longitude: f64) {
        let settings = ctx.state().settings();

        if !settings.get_bool("geofence_enabled", false) {
            return;
        }

        let fences: Vec<GeofenceConfig> = settings.get_json("geofences").unwrap_or_default();

        let node = match ctx.state().node(num) {
            Some(node) => node,
            None => return,
        };

        let now_ms = timestamp_millis();

        for (index, fence) in fences.iter().enumerate() {
            if !fence.filter.matches(&node) {
                continue;
            }

            let inside = fence.shape.contains(latitude, longitude);
            let key = (index, num);

            let entry = self.presence.entry(key).or_insert(Presence {
                inside: false,
                last_while_fired_ms: 0,
            });

            if inside && !entry.inside {
                entry.inside = true;
                entry.last_while_fired_ms = now_ms;

                if fence.on_entry {
                    ctx.audit(TASK_NAME, Some(num), "entered", Some(fence.name.clone()));
                }
            } else if !inside && entry.inside {
                entry.inside = false;

                if fence.on_exit {
                    ctx.audit(TASK_NAME, Some(num), "exited", Some(fence.name.clone()));
                }
            } else if inside {
                if let Some(minutes) = fence.while_inside_minutes {
                    if now_ms.saturating_sub(entry.last_while_fired_ms) >= minutes * 60_000 {
                        entry.last_while_fired_ms = now_ms;
                        ctx.audit(
                            TASK_NAME,
                            Some(num),
                            "inside",
                            Some(fence.name.clone()),
                        );
                    }
                }
            }
        }
    }
}

impl AutomationTask for GeofenceTriggers {
    fn name(&self) -> &'static str {
        TASK_NAME
    }

    fn schedule(&self, ctx: &TaskContext) -> Option<Duration> {
        if ctx.state().settings().get_bool("geofence_enabled", false) {
            // Reactive on position updates; the tick re-evaluates nodes
            // that stay put for the while-inside cadence.
            Some(Duration::from_secs(60))
        } else {
            None
        }
    }

    fn tick(&mut self, ctx: &TaskContext) {
        let positions: Vec<(NodeNum, f64, f64)> = ctx
            .state()
            .nodes()
            .into_iter()
            .filter_map(|node| {
                node.effective_position()
                    .map(|pos| (node.num, pos.latitude, pos.longitude))
            })
            .collect();

        for (num, latitude, longitude) in positions {
            self.evaluate(ctx, num, latitude, longitude);
        }
    }

    fn on_event(&mut self, ctx: &TaskContext, event: &MeshEvent) {
        if let MeshEvent::PositionUpdated {
            num,
            latitude,
            longitude,
        } = event
        {
            self.evaluate(ctx, *num, *latitude, *longitude);
        }
    }
}
