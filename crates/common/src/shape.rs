use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};

use crate::bounds::Box2;

/// A sphere, or a cone-shaped slice of one, around a streaming source.
///
/// `angle` is the full opening angle in degrees; `0` or `>= 360` means a full
/// sphere. Grid queries work on the XY projection; the vertical extent is
/// only used for Z-culling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SphericalSector {
    pub center: DVec3,
    pub radius: f64,
    pub axis: DVec3,
    pub angle: f64,
}

impl SphericalSector {
    pub fn sphere(center: DVec3, radius: f64) -> Self {
        Self {
            center,
            radius,
            axis: DVec3::X,
            angle: 0.0,
        }
    }

    pub fn sector(center: DVec3, radius: f64, axis: DVec3, angle: f64) -> Self {
        Self {
            center,
            radius,
            axis: axis.normalize_or(DVec3::X),
            angle,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.radius > 0.0 && self.radius.is_finite()
    }

    pub fn is_sphere(&self) -> bool {
        self.angle <= 0.0 || self.angle >= 360.0
    }

    pub fn with_radius(self, radius: f64) -> Self {
        Self { radius, ..self }
    }

    /// Flattens the axis onto the XY plane. A vertical axis has no usable
    /// heading, so such a sector degrades to a sphere.
    pub fn project_2d(self) -> Self {
        let flat = DVec3::new(self.axis.x, self.axis.y, 0.0);
        match flat.try_normalize() {
            Some(axis) => Self { axis, ..self },
            None => Self {
                angle: 0.0,
                axis: DVec3::X,
                ..self
            },
        }
    }

    pub fn center_2d(&self) -> DVec2 {
        self.center.truncate()
    }

    /// XY bounds of the enclosing circle.
    pub fn bounds_2d(&self) -> Box2 {
        Box2::from_center_half_extent(self.center_2d(), DVec2::splat(self.radius))
    }

    /// Vertical range covered by the shape.
    pub fn z_range(&self) -> (f64, f64) {
        (self.center.z - self.radius, self.center.z + self.radius)
    }

    fn half_angle_radians(&self) -> f64 {
        (self.angle * 0.5).to_radians()
    }

    fn axis_2d(&self) -> DVec2 {
        self.axis.truncate().normalize_or(DVec2::X)
    }

    /// Closed containment test on the XY projection.
    pub fn contains_point_2d(&self, p: DVec2) -> bool {
        let d = p - self.center_2d();
        let len_sq = d.length_squared();
        if len_sq > self.radius * self.radius {
            return false;
        }
        if self.is_sphere() || len_sq == 0.0 {
            return true;
        }
        d.normalize().dot(self.axis_2d()) >= self.half_angle_radians().cos() - 1e-12
    }

    /// Precise shape-vs-box test on the XY projection (closed intervals).
    ///
    /// Sectors wider than a half disc are not convex; they are tested as
    /// their full circle, which can only add cells, never drop one.
    pub fn intersects_box_2d(&self, b: &Box2) -> bool {
        if !b.is_valid() {
            return false;
        }
        let c = self.center_2d();
        if b.square_distance_to_point(c) > self.radius * self.radius {
            return false;
        }
        if self.is_sphere() || self.angle >= 180.0 || b.contains_point(c) {
            return true;
        }
        let corners = b.corners();
        if corners.iter().any(|p| self.contains_point_2d(*p)) {
            return true;
        }
        let half = self.half_angle_radians();
        let axis = self.axis_2d();
        for edge_dir in [
            DVec2::from_angle(half).rotate(axis),
            DVec2::from_angle(-half).rotate(axis),
        ] {
            if segment_intersects_box(c, c + edge_dir * self.radius, b) {
                return true;
            }
        }
        // Only the arc can still cut the box; the arc chord midpoint is the
        // closest point of some box edge to the apex.
        (0..4).any(|i| {
            let q = closest_point_on_segment(corners[i], corners[(i + 1) % 4], c);
            self.contains_point_2d(q)
        })
    }
}

fn closest_point_on_segment(a: DVec2, b: DVec2, p: DVec2) -> DVec2 {
    let ab = b - a;
    let len_sq = ab.length_squared();
    if len_sq == 0.0 {
        return a;
    }
    let t = ((p - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    a + ab * t
}

/// Slab test of segment `a..b` against a closed box.
fn segment_intersects_box(a: DVec2, b: DVec2, bx: &Box2) -> bool {
    let d = b - a;
    let mut t0 = 0.0f64;
    let mut t1 = 1.0f64;
    for axis in 0..2 {
        let (origin, delta, lo, hi) = (a[axis], d[axis], bx.min[axis], bx.max[axis]);
        if delta.abs() < f64::EPSILON {
            if origin < lo || origin > hi {
                return false;
            }
            continue;
        }
        let mut ta = (lo - origin) / delta;
        let mut tb = (hi - origin) / delta;
        if ta > tb {
            std::mem::swap(&mut ta, &mut tb);
        }
        t0 = t0.max(ta);
        t1 = t1.min(tb);
        if t0 > t1 {
            return false;
        }
    }
    true
}
