//! Axis-aligned boxes in world space.
//!
//! Both box types use closed intervals: touching boxes intersect. An inverted
//! box (`min > max` on any axis) is invalid and intersects nothing.

use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};

/// 2D axis-aligned box on the XY plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Box2 {
    pub min: DVec2,
    pub max: DVec2,
}

impl Box2 {
    pub const EMPTY: Self = Self {
        min: DVec2::splat(f64::INFINITY),
        max: DVec2::splat(f64::NEG_INFINITY),
    };

    pub fn new(min: DVec2, max: DVec2) -> Self {
        Self { min, max }
    }

    pub fn from_center_half_extent(center: DVec2, half_extent: DVec2) -> Self {
        Self {
            min: center - half_extent,
            max: center + half_extent,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y
    }

    pub fn center(&self) -> DVec2 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> DVec2 {
        self.max - self.min
    }

    pub fn contains_point(&self, p: DVec2) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    pub fn intersects(&self, other: &Box2) -> bool {
        self.is_valid()
            && other.is_valid()
            && self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }

    /// Closest point of the box to `p` (p itself when inside).
    pub fn closest_point(&self, p: DVec2) -> DVec2 {
        p.clamp(self.min, self.max)
    }

    /// Squared distance from `p` to the box, zero when inside.
    pub fn square_distance_to_point(&self, p: DVec2) -> f64 {
        self.closest_point(p).distance_squared(p)
    }

    pub fn expand(&mut self, point: DVec2) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// The four corners, counter-clockwise from `min`.
    pub fn corners(&self) -> [DVec2; 4] {
        [
            self.min,
            DVec2::new(self.max.x, self.min.y),
            self.max,
            DVec2::new(self.min.x, self.max.y),
        ]
    }
}

/// 3D axis-aligned box. Z is up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Box3 {
    pub min: DVec3,
    pub max: DVec3,
}

impl Default for Box3 {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Box3 {
    pub const EMPTY: Self = Self {
        min: DVec3::splat(f64::INFINITY),
        max: DVec3::splat(f64::NEG_INFINITY),
    };

    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    pub fn from_center_half_extent(center: DVec3, half_extent: DVec3) -> Self {
        Self {
            min: center - half_extent,
            max: center + half_extent,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    pub fn contains_point(&self, p: DVec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    pub fn intersects(&self, other: &Box3) -> bool {
        self.is_valid()
            && other.is_valid()
            && self.min.cmple(other.max).all()
            && self.max.cmpge(other.min).all()
    }

    /// Vertical overlap with the closed range `[z_min, z_max]`.
    pub fn overlaps_z(&self, z_min: f64, z_max: f64) -> bool {
        self.min.z <= z_max && self.max.z >= z_min
    }

    pub fn expand(&mut self, point: DVec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn merged(&self, other: &Box3) -> Box3 {
        if !self.is_valid() {
            return *other;
        }
        if !other.is_valid() {
            return *self;
        }
        Box3 {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Projection on the XY plane.
    pub fn to_2d(&self) -> Box2 {
        Box2::new(self.min.truncate(), self.max.truncate())
    }
}
