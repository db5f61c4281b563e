//! Geometry primitives for refinement zones and the computational domain
//!
//! All shapes are immutable value objects. Derived quantities (bounding boxes,
//! distances, sample points) are computed on demand, never stored. Every
//! constructor rejects zero-radius, zero-length and non-finite input with
//! [`MeshError::DegenerateGeometry`] instead of producing an unusable shape.
//!
//! Coordinates are metres throughout; unit conversion happens once, in
//! [`crate::config`], before any primitive is built.

use crate::error::{MeshError, MeshResult};
use nalgebra::{Point2, Point3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Tolerance below which lengths are treated as zero
pub const GEOMETRY_EPSILON: f64 = 1e-9;

/// Number of axial stations used when sampling a shape for overlap tests
const AXIAL_SAMPLES: usize = 16;

/// Number of rim points per axial station
const RIM_SAMPLES: usize = 8;

/// Queries shared by every refinement primitive
pub trait Primitive {
    /// Whether the point lies inside or on the shape
    fn contains(&self, point: &Point3<f64>) -> bool;

    /// Euclidean distance from the point to the shape, zero inside
    fn distance_to(&self, point: &Point3<f64>) -> f64;

    /// Axis-aligned bounding box
    fn bounding_box(&self) -> Aabb;

    /// Length scale used to size the blending band around the shape
    fn characteristic_radius(&self) -> f64;

    /// Points on and inside the shape used for overlap detection
    fn sample_points(&self) -> Vec<Point3<f64>>;
}

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    /// Minimum corner
    pub min: Point3<f64>,
    /// Maximum corner
    pub max: Point3<f64>,
}

impl Aabb {
    /// Create a box from two opposite corners in any order
    #[must_use]
    pub fn new(a: Point3<f64>, b: Point3<f64>) -> Self {
        Self {
            min: Point3::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: Point3::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    /// Smallest box containing every point, `None` for an empty slice
    #[must_use]
    pub fn from_points(points: &[Point3<f64>]) -> Option<Self> {
        let first = points.first()?;
        Some(points.iter().skip(1).fold(Self::new(*first, *first), |acc, p| {
            acc.union(&Self::new(*p, *p))
        }))
    }

    /// Smallest box containing both boxes
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: Point3::new(
                self.min.x.min(other.min.x),
                self.min.y.min(other.min.y),
                self.min.z.min(other.min.z),
            ),
            max: Point3::new(
                self.max.x.max(other.max.x),
                self.max.y.max(other.max.y),
                self.max.z.max(other.max.z),
            ),
        }
    }

    /// Overlapping part of both boxes, `None` when they are disjoint
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if !self.intersects(other) {
            return None;
        }
        Some(Self {
            min: Point3::new(
                self.min.x.max(other.min.x),
                self.min.y.max(other.min.y),
                self.min.z.max(other.min.z),
            ),
            max: Point3::new(
                self.max.x.min(other.max.x),
                self.max.y.min(other.max.y),
                self.max.z.min(other.max.z),
            ),
        })
    }

    /// Grow the box by `margin` on every side
    #[must_use]
    pub fn expand(&self, margin: f64) -> Self {
        let m = Vector3::repeat(margin);
        Self {
            min: self.min - m,
            max: self.max + m,
        }
    }

    /// Whether the two boxes touch or overlap
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Whether `other` lies entirely inside this box (with tolerance)
    #[must_use]
    pub fn encloses(&self, other: &Self) -> bool {
        other.min.x >= self.min.x - GEOMETRY_EPSILON
            && other.min.y >= self.min.y - GEOMETRY_EPSILON
            && other.min.z >= self.min.z - GEOMETRY_EPSILON
            && other.max.x <= self.max.x + GEOMETRY_EPSILON
            && other.max.y <= self.max.y + GEOMETRY_EPSILON
            && other.max.z <= self.max.z + GEOMETRY_EPSILON
    }

    /// Whether the point lies inside or on the box
    #[must_use]
    pub fn contains_point(&self, p: &Point3<f64>) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    /// Distance from the point to the box, zero inside
    #[must_use]
    pub fn distance_to_point(&self, p: &Point3<f64>) -> f64 {
        let dx = (self.min.x - p.x).max(0.0).max(p.x - self.max.x);
        let dy = (self.min.y - p.y).max(0.0).max(p.y - self.max.y);
        let dz = (self.min.z - p.z).max(0.0).max(p.z - self.max.z);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Box centre
    #[must_use]
    pub fn center(&self) -> Point3<f64> {
        nalgebra::center(&self.min, &self.max)
    }

    /// Edge lengths along x, y, z
    #[must_use]
    pub fn extents(&self) -> Vector3<f64> {
        self.max - self.min
    }

    /// The eight corners
    #[must_use]
    pub fn corners(&self) -> [Point3<f64>; 8] {
        let (a, b) = (self.min, self.max);
        [
            Point3::new(a.x, a.y, a.z),
            Point3::new(b.x, a.y, a.z),
            Point3::new(a.x, b.y, a.z),
            Point3::new(b.x, b.y, a.z),
            Point3::new(a.x, a.y, b.z),
            Point3::new(b.x, a.y, b.z),
            Point3::new(a.x, b.y, b.z),
            Point3::new(b.x, b.y, b.z),
        ]
    }
}

/// Solid sphere
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sphere {
    center: Point3<f64>,
    radius: f64,
}

impl Sphere {
    /// Create a sphere, failing on a non-positive or non-finite radius
    pub fn new(center: Point3<f64>, radius: f64) -> MeshResult<Self> {
        check_point("sphere", &center)?;
        check_length("sphere", "radius", radius)?;
        Ok(Self { center, radius })
    }

    /// Sphere centre
    #[must_use]
    pub const fn center(&self) -> Point3<f64> {
        self.center
    }

    /// Sphere radius
    #[must_use]
    pub const fn radius(&self) -> f64 {
        self.radius
    }
}

impl Primitive for Sphere {
    fn contains(&self, point: &Point3<f64>) -> bool {
        (point - self.center).norm() <= self.radius + GEOMETRY_EPSILON
    }

    fn distance_to(&self, point: &Point3<f64>) -> f64 {
        ((point - self.center).norm() - self.radius).max(0.0)
    }

    fn bounding_box(&self) -> Aabb {
        let r = Vector3::repeat(self.radius);
        Aabb::new(self.center - r, self.center + r)
    }

    fn characteristic_radius(&self) -> f64 {
        self.radius
    }

    fn sample_points(&self) -> Vec<Point3<f64>> {
        let mut points = vec![self.center];
        for axis in [Vector3::x(), Vector3::y(), Vector3::z()] {
            points.push(self.center + axis * self.radius);
            points.push(self.center - axis * self.radius);
        }
        points
    }
}

/// Truncated cone around a straight axis
///
/// Radius varies linearly from `start_radius` at `start` to `end_radius` at
/// `start + axis * length`. A cylinder is the special case of equal radii;
/// one of the radii may be zero (a cone), but not both.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Frustum {
    start: Point3<f64>,
    axis: Vector3<f64>,
    length: f64,
    start_radius: f64,
    end_radius: f64,
}

impl Frustum {
    /// Create a frustum from its start point, direction, length and end radii
    pub fn new(
        start: Point3<f64>,
        direction: Vector3<f64>,
        length: f64,
        start_radius: f64,
        end_radius: f64,
    ) -> MeshResult<Self> {
        check_point("frustum", &start)?;
        check_length("frustum", "length", length)?;
        let axis = unit_direction("frustum", &direction)?;
        if !start_radius.is_finite() || !end_radius.is_finite() || start_radius < 0.0 || end_radius < 0.0 {
            return Err(MeshError::degenerate_geometry(
                "frustum",
                format!("radii must be finite and non-negative, got {start_radius} and {end_radius}"),
            ));
        }
        if start_radius.max(end_radius) <= GEOMETRY_EPSILON {
            return Err(MeshError::degenerate_geometry("frustum", "both end radii are zero"));
        }
        Ok(Self {
            start,
            axis,
            length,
            start_radius,
            end_radius,
        })
    }

    /// Create a wake frustum from the expansion half-angle (radians)
    pub fn from_expansion(
        start: Point3<f64>,
        direction: Vector3<f64>,
        length: f64,
        start_radius: f64,
        half_angle: f64,
    ) -> MeshResult<Self> {
        if !half_angle.is_finite() || !(0.0..std::f64::consts::FRAC_PI_2).contains(&half_angle) {
            return Err(MeshError::degenerate_geometry(
                "frustum",
                format!("expansion angle must be in [0, 90) degrees, got {:.3}", half_angle.to_degrees()),
            ));
        }
        Self::new(start, direction, length, start_radius, start_radius + length * half_angle.tan())
    }

    /// Point where the axis starts
    #[must_use]
    pub const fn start(&self) -> Point3<f64> {
        self.start
    }

    /// Point where the axis ends
    #[must_use]
    pub fn end(&self) -> Point3<f64> {
        self.start + self.axis * self.length
    }

    /// Unit axis direction
    #[must_use]
    pub const fn axis(&self) -> Vector3<f64> {
        self.axis
    }

    /// Axis length
    #[must_use]
    pub const fn length(&self) -> f64 {
        self.length
    }

    /// Radius at the start cap
    #[must_use]
    pub const fn start_radius(&self) -> f64 {
        self.start_radius
    }

    /// Radius at the end cap
    #[must_use]
    pub const fn end_radius(&self) -> f64 {
        self.end_radius
    }

    /// Radius at axial parameter `t` in `[0, length]`
    #[must_use]
    pub fn radius_at(&self, t: f64) -> f64 {
        let s = (t / self.length).clamp(0.0, 1.0);
        self.start_radius + (self.end_radius - self.start_radius) * s
    }

    /// Copy with the axis shortened to `length`, keeping the taper rate
    pub fn truncated(&self, length: f64) -> MeshResult<Self> {
        let end_radius = self.radius_at(length.min(self.length));
        Self::new(self.start, self.axis, length, self.start_radius, end_radius)
    }

    /// Axial parameter and radial distance of a point
    fn meridian(&self, point: &Point3<f64>) -> (f64, f64) {
        let rel = point - self.start;
        let t = rel.dot(&self.axis);
        let radial = (rel - self.axis * t).norm();
        (t, radial)
    }
}

impl Primitive for Frustum {
    fn contains(&self, point: &Point3<f64>) -> bool {
        let (t, rho) = self.meridian(point);
        t >= -GEOMETRY_EPSILON
            && t <= self.length + GEOMETRY_EPSILON
            && rho <= self.radius_at(t) + GEOMETRY_EPSILON
    }

    fn distance_to(&self, point: &Point3<f64>) -> f64 {
        let (t, rho) = self.meridian(point);
        // Solid of revolution: the 3D distance equals the distance to the
        // meridian quadrilateral in the (t, rho) half-plane.
        let quad = [
            Point2::new(0.0, 0.0),
            Point2::new(self.length, 0.0),
            Point2::new(self.length, self.end_radius),
            Point2::new(0.0, self.start_radius),
        ];
        let q = Point2::new(t, rho);
        if point_in_convex_polygon(&q, &quad) {
            return 0.0;
        }
        (0..quad.len())
            .map(|i| segment_distance_2d(&q, &quad[i], &quad[(i + 1) % quad.len()]))
            .fold(f64::INFINITY, f64::min)
    }

    fn bounding_box(&self) -> Aabb {
        disk_bounds(&self.start, &self.axis, self.start_radius)
            .union(&disk_bounds(&self.end(), &self.axis, self.end_radius))
    }

    fn characteristic_radius(&self) -> f64 {
        self.start_radius.max(self.end_radius)
    }

    fn sample_points(&self) -> Vec<Point3<f64>> {
        let (u, v) = orthonormal_basis(&self.axis);
        let mut points = Vec::with_capacity((AXIAL_SAMPLES + 1) * (RIM_SAMPLES + 1));
        for i in 0..=AXIAL_SAMPLES {
            let t = self.length * i as f64 / AXIAL_SAMPLES as f64;
            let c = self.start + self.axis * t;
            let r = self.radius_at(t);
            points.push(c);
            for k in 0..RIM_SAMPLES {
                let theta = std::f64::consts::TAU * k as f64 / RIM_SAMPLES as f64;
                points.push(c + (u * theta.cos() + v * theta.sin()) * r);
            }
        }
        points
    }
}

/// Finite solid cylinder
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cylinder {
    inner: Frustum,
}

impl Cylinder {
    /// Create a cylinder from its base point, axis direction, length and radius
    pub fn new(base: Point3<f64>, direction: Vector3<f64>, length: f64, radius: f64) -> MeshResult<Self> {
        check_length("cylinder", "radius", radius)?;
        let inner = Frustum::new(base, direction, length, radius, radius).map_err(|e| match e {
            MeshError::DegenerateGeometry { message, .. } => MeshError::degenerate_geometry("cylinder", message),
            other => other,
        })?;
        Ok(Self { inner })
    }

    /// Vertical cylinder standing on `(x, y, z_min)`
    pub fn vertical(center: Point2<f64>, radius: f64, z_min: f64, z_max: f64) -> MeshResult<Self> {
        Self::new(
            Point3::new(center.x, center.y, z_min),
            Vector3::z(),
            z_max - z_min,
            radius,
        )
    }

    /// Base centre
    #[must_use]
    pub const fn base(&self) -> Point3<f64> {
        self.inner.start
    }

    /// Unit axis
    #[must_use]
    pub const fn axis(&self) -> Vector3<f64> {
        self.inner.axis
    }

    /// Axis length
    #[must_use]
    pub const fn length(&self) -> f64 {
        self.inner.length
    }

    /// Radius
    #[must_use]
    pub const fn radius(&self) -> f64 {
        self.inner.start_radius
    }

    /// Axis midpoint
    #[must_use]
    pub fn center(&self) -> Point3<f64> {
        self.inner.start + self.inner.axis * (0.5 * self.inner.length)
    }

    /// The same cylinder moved by `offset`
    #[must_use]
    pub fn translated(&self, offset: &Vector3<f64>) -> Self {
        Self {
            inner: Frustum {
                start: self.inner.start + offset,
                ..self.inner
            },
        }
    }
}

impl Primitive for Cylinder {
    fn contains(&self, point: &Point3<f64>) -> bool {
        self.inner.contains(point)
    }

    fn distance_to(&self, point: &Point3<f64>) -> f64 {
        self.inner.distance_to(point)
    }

    fn bounding_box(&self) -> Aabb {
        self.inner.bounding_box()
    }

    fn characteristic_radius(&self) -> f64 {
        self.inner.start_radius
    }

    fn sample_points(&self) -> Vec<Point3<f64>> {
        self.inner.sample_points()
    }
}

/// Solid axis-aligned box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cuboid {
    bounds: Aabb,
}

impl Cuboid {
    /// Create a box from two opposite corners; every edge must be non-zero
    pub fn new(a: Point3<f64>, b: Point3<f64>) -> MeshResult<Self> {
        check_point("box", &a)?;
        check_point("box", &b)?;
        let bounds = Aabb::new(a, b);
        let ext = bounds.extents();
        if ext.min() <= GEOMETRY_EPSILON {
            return Err(MeshError::degenerate_geometry(
                "box",
                format!("extents must be positive, got ({:.3}, {:.3}, {:.3})", ext.x, ext.y, ext.z),
            ));
        }
        Ok(Self { bounds })
    }

    /// Create a box from a bounding box
    pub fn from_aabb(bounds: &Aabb) -> MeshResult<Self> {
        Self::new(bounds.min, bounds.max)
    }

    /// The box as an [`Aabb`]
    #[must_use]
    pub const fn bounds(&self) -> Aabb {
        self.bounds
    }
}

impl Primitive for Cuboid {
    fn contains(&self, point: &Point3<f64>) -> bool {
        self.bounds.expand(GEOMETRY_EPSILON).contains_point(point)
    }

    fn distance_to(&self, point: &Point3<f64>) -> f64 {
        self.bounds.distance_to_point(point)
    }

    fn bounding_box(&self) -> Aabb {
        self.bounds
    }

    fn characteristic_radius(&self) -> f64 {
        0.5 * self.bounds.extents().min()
    }

    fn sample_points(&self) -> Vec<Point3<f64>> {
        let mut points = vec![self.bounds.center()];
        points.extend_from_slice(&self.bounds.corners());
        let (a, b) = (self.bounds.min, self.bounds.max);
        let c = self.bounds.center();
        points.extend_from_slice(&[
            Point3::new(a.x, c.y, c.z),
            Point3::new(b.x, c.y, c.z),
            Point3::new(c.x, a.y, c.z),
            Point3::new(c.x, b.y, c.z),
            Point3::new(c.x, c.y, a.z),
            Point3::new(c.x, c.y, b.z),
        ]);
        points
    }
}

/// Any refinement primitive
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    /// Sphere around a rotor
    Sphere(Sphere),
    /// Straight cylinder
    Cylinder(Cylinder),
    /// Expanding wake cone
    Frustum(Frustum),
    /// Axis-aligned box
    Cuboid(Cuboid),
}

impl Shape {
    fn as_primitive(&self) -> &dyn Primitive {
        match self {
            Self::Sphere(s) => s,
            Self::Cylinder(c) => c,
            Self::Frustum(f) => f,
            Self::Cuboid(b) => b,
        }
    }

    /// Short name used in log and report messages
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sphere(_) => "sphere",
            Self::Cylinder(_) => "cylinder",
            Self::Frustum(_) => "frustum",
            Self::Cuboid(_) => "box",
        }
    }

    /// The same shape moved by `offset`
    #[must_use]
    pub fn translated(&self, offset: &Vector3<f64>) -> Self {
        match *self {
            Self::Sphere(s) => Self::Sphere(Sphere {
                center: s.center + offset,
                ..s
            }),
            Self::Cylinder(c) => Self::Cylinder(c.translated(offset)),
            Self::Frustum(f) => Self::Frustum(Frustum {
                start: f.start + offset,
                ..f
            }),
            Self::Cuboid(b) => Self::Cuboid(Cuboid {
                bounds: Aabb::new(b.bounds.min + offset, b.bounds.max + offset),
            }),
        }
    }

    /// Whether the two shapes share any volume
    ///
    /// Exact for sphere pairs; otherwise bounding boxes are tested first and
    /// then each shape's sample points are checked against the other.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        if let (Self::Sphere(a), Self::Sphere(b)) = (self, other) {
            return (a.center - b.center).norm() <= a.radius + b.radius + GEOMETRY_EPSILON;
        }
        if !self.bounding_box().intersects(&other.bounding_box()) {
            return false;
        }
        other.sample_points().iter().any(|p| self.contains(p))
            || self.sample_points().iter().any(|p| other.contains(p))
    }
}

impl Primitive for Shape {
    fn contains(&self, point: &Point3<f64>) -> bool {
        self.as_primitive().contains(point)
    }

    fn distance_to(&self, point: &Point3<f64>) -> f64 {
        self.as_primitive().distance_to(point)
    }

    fn bounding_box(&self) -> Aabb {
        self.as_primitive().bounding_box()
    }

    fn characteristic_radius(&self) -> f64 {
        self.as_primitive().characteristic_radius()
    }

    fn sample_points(&self) -> Vec<Point3<f64>> {
        self.as_primitive().sample_points()
    }
}

impl From<Sphere> for Shape {
    fn from(s: Sphere) -> Self {
        Self::Sphere(s)
    }
}

impl From<Cylinder> for Shape {
    fn from(c: Cylinder) -> Self {
        Self::Cylinder(c)
    }
}

impl From<Frustum> for Shape {
    fn from(f: Frustum) -> Self {
        Self::Frustum(f)
    }
}

impl From<Cuboid> for Shape {
    fn from(b: Cuboid) -> Self {
        Self::Cuboid(b)
    }
}

/// Ground elevation sampled on a rectilinear grid
///
/// Heights are absolute (same frame as every other z coordinate) and looked
/// up by bilinear interpolation. Queries outside the grid use the nearest
/// edge value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Terrain {
    xs: Vec<f64>,
    ys: Vec<f64>,
    /// Row-major by y: `heights[j * xs.len() + i]` is the height at `(xs[i], ys[j])`
    heights: Vec<f64>,
}

impl Terrain {
    /// Grid from strictly increasing axes and row-major heights
    pub fn new(xs: Vec<f64>, ys: Vec<f64>, heights: Vec<f64>) -> MeshResult<Self> {
        for (name, axis) in [("x", &xs), ("y", &ys)] {
            if axis.len() < 2 {
                return Err(MeshError::degenerate_geometry(
                    "terrain",
                    format!("{name} axis needs at least 2 grid lines, got {}", axis.len()),
                ));
            }
            if axis.iter().any(|v| !v.is_finite()) || axis.windows(2).any(|w| w[1] - w[0] <= GEOMETRY_EPSILON) {
                return Err(MeshError::degenerate_geometry(
                    "terrain",
                    format!("{name} axis must be finite and strictly increasing"),
                ));
            }
        }
        if heights.len() != xs.len() * ys.len() {
            return Err(MeshError::degenerate_geometry(
                "terrain",
                format!(
                    "expected {} x {} = {} heights, got {}",
                    xs.len(),
                    ys.len(),
                    xs.len() * ys.len(),
                    heights.len()
                ),
            ));
        }
        if let Some(h) = heights.iter().find(|h| !h.is_finite()) {
            return Err(MeshError::degenerate_geometry("terrain", format!("non-finite height {h}")));
        }
        Ok(Self { xs, ys, heights })
    }

    /// Grid from scattered `[x, y, z]` samples that cover a full rectilinear grid
    pub fn from_points(points: &[[f64; 3]]) -> MeshResult<Self> {
        let axis = |pick: usize| {
            let mut values: Vec<f64> = points.iter().map(|p| p[pick]).collect();
            values.sort_by(f64::total_cmp);
            values.dedup_by(|a, b| (*a - *b).abs() <= GEOMETRY_EPSILON);
            values
        };
        let (xs, ys) = (axis(0), axis(1));
        let lookup = |values: &[f64], v: f64| {
            let i = values.partition_point(|x| *x < v - GEOMETRY_EPSILON);
            (i < values.len() && (values[i] - v).abs() <= GEOMETRY_EPSILON).then_some(i)
        };

        let mut heights: Vec<Option<f64>> = vec![None; xs.len() * ys.len()];
        for p in points {
            let (Some(i), Some(j)) = (lookup(&xs, p[0]), lookup(&ys, p[1])) else {
                continue;
            };
            let slot = &mut heights[j * xs.len() + i];
            if slot.is_some() {
                return Err(MeshError::degenerate_geometry(
                    "terrain",
                    format!("duplicate sample at ({}, {})", p[0], p[1]),
                ));
            }
            *slot = Some(p[2]);
        }
        let heights = heights
            .into_iter()
            .enumerate()
            .map(|(n, h)| {
                h.ok_or_else(|| {
                    let (i, j) = (n % xs.len(), n / xs.len());
                    MeshError::degenerate_geometry(
                        "terrain",
                        format!("no sample at grid node ({}, {})", xs[i], ys[j]),
                    )
                })
            })
            .collect::<MeshResult<Vec<_>>>()?;
        Self::new(xs, ys, heights)
    }

    /// Flat ground at a constant height over the given extents
    pub fn flat(x_range: [f64; 2], y_range: [f64; 2], height: f64) -> MeshResult<Self> {
        Self::new(
            vec![x_range[0], x_range[1]],
            vec![y_range[0], y_range[1]],
            vec![height; 4],
        )
    }

    /// Ground height at `(x, y)`
    #[must_use]
    pub fn height_at(&self, x: f64, y: f64) -> f64 {
        let (i, tx) = grid_cell(&self.xs, x);
        let (j, ty) = grid_cell(&self.ys, y);
        let nx = self.xs.len();
        let h = |i: usize, j: usize| self.heights[j * nx + i];
        let bottom = h(i, j) * (1.0 - tx) + h(i + 1, j) * tx;
        let top = h(i, j + 1) * (1.0 - tx) + h(i + 1, j + 1) * tx;
        bottom * (1.0 - ty) + top * ty
    }

    /// Lowest and highest grid heights
    #[must_use]
    pub fn height_range(&self) -> (f64, f64) {
        self.heights
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), h| (lo.min(*h), hi.max(*h)))
    }

    /// Same grid with every height passed through `f`
    fn map_heights(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            heights: self.heights.iter().map(|h| f(*h)).collect(),
            ..self.clone()
        }
    }
}

/// Cell index and fractional offset of `v` along a grid axis, clamped to the grid
fn grid_cell(axis: &[f64], v: f64) -> (usize, f64) {
    let last = axis.len() - 2;
    let i = axis.partition_point(|a| *a <= v).saturating_sub(1).min(last);
    let t = ((v - axis[i]) / (axis[i + 1] - axis[i])).clamp(0.0, 1.0);
    (i, t)
}

/// Vertical stretch between the physical domain and the space the mesher works in
///
/// Heights are measured from `z_min`. Physical heights up to `distance` are
/// multiplied by `ratio`; heights above are shifted up by
/// `distance * (ratio - 1)`, so the map is continuous and monotone.
/// A mesh generated in stretched space and then compressed lands back in the
/// physical domain with its elements flattened by `ratio` near the ground.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerticalStretch {
    z_min: f64,
    ratio: f64,
    distance: f64,
}

impl VerticalStretch {
    /// Stretch by `ratio` over the lowest `distance` metres above `z_min`
    pub fn new(z_min: f64, ratio: f64, distance: f64) -> MeshResult<Self> {
        if !z_min.is_finite() {
            return Err(MeshError::configuration(
                "domain.boundary.z_min",
                format!("expected a finite number, got {z_min}"),
            ));
        }
        if !ratio.is_finite() || ratio <= 0.0 {
            return Err(MeshError::configuration(
                "domain.aspect_ratio",
                format!("must be positive, got {ratio}"),
            ));
        }
        if !distance.is_finite() || distance < 0.0 {
            return Err(MeshError::configuration(
                "domain.aspect_distance",
                format!("must be non-negative, got {distance}"),
            ));
        }
        Ok(Self { z_min, ratio, distance })
    }

    /// The identity map
    #[must_use]
    pub const fn identity(z_min: f64) -> Self {
        Self {
            z_min,
            ratio: 1.0,
            distance: 0.0,
        }
    }

    /// Whether the map leaves every height unchanged
    #[must_use]
    pub fn is_identity(&self) -> bool {
        (self.ratio - 1.0).abs() <= f64::EPSILON || self.distance <= 0.0
    }

    /// Stretch ratio
    #[must_use]
    pub const fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Physical height band the ratio applies to
    #[must_use]
    pub const fn distance(&self) -> f64 {
        self.distance
    }

    /// Physical height to stretched height
    #[must_use]
    pub fn stretch_height(&self, z: f64) -> f64 {
        if self.is_identity() {
            return z;
        }
        let h = z - self.z_min;
        self.z_min
            + if h <= self.distance {
                h * self.ratio
            } else {
                h + self.distance * (self.ratio - 1.0)
            }
    }

    /// Stretched height back to physical height
    #[must_use]
    pub fn compress_height(&self, z: f64) -> f64 {
        if self.is_identity() {
            return z;
        }
        let h = z - self.z_min;
        let band = self.distance * self.ratio;
        self.z_min + if h <= band { h / self.ratio } else { h - band + self.distance }
    }

    /// Physical point to stretched point
    #[must_use]
    pub fn stretch_point(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::new(p.x, p.y, self.stretch_height(p.z))
    }

    /// Stretched point back to physical point
    #[must_use]
    pub fn compress_point(&self, p: &Point3<f64>) -> Point3<f64> {
        Point3::new(p.x, p.y, self.compress_height(p.z))
    }

    /// Carry a shape into stretched space
    ///
    /// Boxes and vertical cylinders map exactly (their top and bottom are
    /// stretched). Other shapes keep their size and move with their centre.
    pub fn stretch_shape(&self, shape: &Shape) -> MeshResult<Shape> {
        if self.is_identity() {
            return Ok(*shape);
        }
        match shape {
            Shape::Cuboid(b) => {
                let (lo, hi) = (b.bounds.min, b.bounds.max);
                Ok(Cuboid::new(self.stretch_point(&lo), self.stretch_point(&hi))?.into())
            }
            Shape::Cylinder(c) if (c.axis().z.abs() - 1.0).abs() <= GEOMETRY_EPSILON => {
                let base = c.base();
                let top = base + c.axis() * c.length();
                let (b, t) = (self.stretch_point(&base), self.stretch_point(&top));
                Ok(Cylinder::new(b, t - b, (t - b).norm(), c.radius())?.into())
            }
            other => {
                let c = other.bounding_box().center();
                Ok(other.translated(&Vector3::new(0.0, 0.0, self.stretch_height(c.z) - c.z)))
            }
        }
    }
}

/// Computational domain: a horizontal footprint polygon extruded between two heights
///
/// With a [`Terrain`] the floor follows the ground instead of `z_min`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainBoundary {
    footprint: Vec<Point2<f64>>,
    z_min: f64,
    z_max: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    terrain: Option<Terrain>,
}

impl DomainBoundary {
    /// Rectangular domain from x/y ranges and a height interval
    pub fn from_box(x_range: [f64; 2], y_range: [f64; 2], z_min: f64, z_max: f64) -> MeshResult<Self> {
        let (x0, x1) = (x_range[0].min(x_range[1]), x_range[0].max(x_range[1]));
        let (y0, y1) = (y_range[0].min(y_range[1]), y_range[0].max(y_range[1]));
        Self::from_polygon(
            vec![
                Point2::new(x0, y0),
                Point2::new(x1, y0),
                Point2::new(x1, y1),
                Point2::new(x0, y1),
            ],
            z_min,
            z_max,
        )
    }

    /// Polygonal domain; the footprint is stored counter-clockwise
    ///
    /// Self-intersection is not rejected here; the domain validator reports it
    /// together with the offending edges.
    pub fn from_polygon(mut footprint: Vec<Point2<f64>>, z_min: f64, z_max: f64) -> MeshResult<Self> {
        if footprint.len() > 3 && footprint.first() == footprint.last() {
            footprint.pop();
        }
        if footprint.len() < 3 {
            return Err(MeshError::degenerate_geometry(
                "domain boundary",
                format!("footprint needs at least 3 vertices, got {}", footprint.len()),
            ));
        }
        if let Some((i, p)) = footprint
            .iter()
            .enumerate()
            .find(|(_, p)| !p.x.is_finite() || !p.y.is_finite())
        {
            return Err(MeshError::degenerate_geometry(
                format!("domain boundary vertex {i}"),
                format!("non-finite coordinate ({}, {})", p.x, p.y),
            ));
        }
        if !z_min.is_finite() || !z_max.is_finite() || z_max - z_min <= GEOMETRY_EPSILON {
            return Err(MeshError::degenerate_geometry(
                "domain boundary",
                format!("height interval [{z_min}, {z_max}] is empty"),
            ));
        }
        let area = signed_area(&footprint);
        if area.abs() <= GEOMETRY_EPSILON {
            return Err(MeshError::degenerate_geometry("domain boundary", "footprint has zero area"));
        }
        if area < 0.0 {
            footprint.reverse();
        }
        Ok(Self {
            footprint,
            z_min,
            z_max,
            terrain: None,
        })
    }

    /// Let the floor follow the given ground elevation
    ///
    /// The ground is clamped to `z_min` from below and must stay under the
    /// domain top everywhere.
    pub fn with_terrain(mut self, terrain: Terrain) -> MeshResult<Self> {
        let (_, highest) = terrain.height_range();
        if highest >= self.z_max - GEOMETRY_EPSILON {
            return Err(MeshError::degenerate_geometry(
                "terrain",
                format!("ground reaches {highest:.3} m, at or above the domain top {:.3} m", self.z_max),
            ));
        }
        self.terrain = Some(terrain);
        Ok(self)
    }

    /// Ground elevation, if any
    #[must_use]
    pub const fn terrain(&self) -> Option<&Terrain> {
        self.terrain.as_ref()
    }

    /// Floor height at `(x, y)`
    #[must_use]
    pub fn ground_height(&self, x: f64, y: f64) -> f64 {
        self.terrain
            .as_ref()
            .map_or(self.z_min, |t| t.height_at(x, y).max(self.z_min))
    }

    /// The domain as seen from stretched space
    pub fn stretched(&self, stretch: &VerticalStretch) -> MeshResult<Self> {
        let mut out = Self::from_polygon(
            self.footprint.clone(),
            stretch.stretch_height(self.z_min),
            stretch.stretch_height(self.z_max),
        )?;
        out.terrain = self
            .terrain
            .as_ref()
            .map(|t| t.map_heights(|h| stretch.stretch_height(h)));
        Ok(out)
    }

    /// Footprint vertices, counter-clockwise
    #[must_use]
    pub fn footprint(&self) -> &[Point2<f64>] {
        &self.footprint
    }

    /// Lowest floor height
    #[must_use]
    pub const fn z_min(&self) -> f64 {
        self.z_min
    }

    /// Domain top
    #[must_use]
    pub const fn z_max(&self) -> f64 {
        self.z_max
    }

    /// Footprint area
    #[must_use]
    pub fn area(&self) -> f64 {
        signed_area(&self.footprint).abs()
    }

    /// Volume of the extruded footprint, ignoring terrain
    #[must_use]
    pub fn volume(&self) -> f64 {
        self.area() * (self.z_max - self.z_min)
    }

    /// Whether the footprint is a rectangle aligned with the axes
    #[must_use]
    pub fn is_axis_aligned_box(&self) -> bool {
        self.footprint.len() == 4
            && (0..4).all(|i| {
                let a = self.footprint[i];
                let b = self.footprint[(i + 1) % 4];
                (a.x - b.x).abs() <= GEOMETRY_EPSILON || (a.y - b.y).abs() <= GEOMETRY_EPSILON
            })
    }

    /// Whether the point lies inside the footprint (boundary inclusive)
    #[must_use]
    pub fn contains_xy(&self, x: f64, y: f64) -> bool {
        let q = Point2::new(x, y);
        let n = self.footprint.len();
        let mut inside = false;
        for i in 0..n {
            let a = self.footprint[i];
            let b = self.footprint[(i + 1) % n];
            if segment_distance_2d(&q, &a, &b) <= GEOMETRY_EPSILON {
                return true;
            }
            if (a.y > y) != (b.y > y) {
                let x_cross = a.x + (y - a.y) * (b.x - a.x) / (b.y - a.y);
                if x < x_cross {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// Whether the point lies inside the domain volume
    #[must_use]
    pub fn contains(&self, point: &Point3<f64>) -> bool {
        point.z >= self.ground_height(point.x, point.y) - GEOMETRY_EPSILON
            && point.z <= self.z_max + GEOMETRY_EPSILON
            && self.contains_xy(point.x, point.y)
    }

    /// Whether the box lies entirely inside the domain
    ///
    /// Exact for convex footprints; for concave ones it checks the corners.
    #[must_use]
    pub fn encloses(&self, bounds: &Aabb) -> bool {
        bounds.corners().iter().all(|c| self.contains(c))
    }

    /// Distance a horizontal ray from `origin` travels before leaving the footprint
    ///
    /// Returns `None` when the origin lies outside the footprint or the
    /// direction has no horizontal component. An origin on the boundary with
    /// the ray pointing outwards exits immediately, at distance zero.
    #[must_use]
    pub fn ray_exit_distance(&self, origin: &Point3<f64>, direction: &Vector3<f64>) -> Option<f64> {
        let d = Vector2::new(direction.x, direction.y);
        let len = d.norm();
        if len <= GEOMETRY_EPSILON || !self.contains_xy(origin.x, origin.y) {
            return None;
        }
        let d = d / len;
        let o = Point2::new(origin.x, origin.y);
        let n = self.footprint.len();

        let on_edge = (0..n).any(|i| {
            segment_distance_2d(&o, &self.footprint[i], &self.footprint[(i + 1) % n]) <= GEOMETRY_EPSILON
        });
        if on_edge {
            let b = self.bounding_box().extents();
            let step = (1e-6 * b.x.max(b.y)).max(1e3 * GEOMETRY_EPSILON);
            let ahead = o + d * step;
            if !self.contains_xy(ahead.x, ahead.y) {
                return Some(0.0);
            }
        }

        let mut best: Option<f64> = None;
        for i in 0..n {
            let a = self.footprint[i];
            let e = self.footprint[(i + 1) % n] - a;
            let denom = cross_2d(&d, &e);
            if denom.abs() <= GEOMETRY_EPSILON {
                continue;
            }
            let w = a - o;
            let t = cross_2d(&w, &e) / denom;
            let s = cross_2d(&w, &d) / denom;
            if t > GEOMETRY_EPSILON && (-GEOMETRY_EPSILON..=1.0 + GEOMETRY_EPSILON).contains(&s) {
                best = Some(best.map_or(t, |b: f64| b.min(t)));
            }
        }
        // Horizontal distance along the unit footprint direction, rescaled to
        // the 3D direction's parameterisation.
        best.map(|t| t * direction.norm() / len)
    }

    /// Bounding box of the domain volume
    #[must_use]
    pub fn bounding_box(&self) -> Aabb {
        let (mut x0, mut y0) = (f64::INFINITY, f64::INFINITY);
        let (mut x1, mut y1) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for p in &self.footprint {
            x0 = x0.min(p.x);
            y0 = y0.min(p.y);
            x1 = x1.max(p.x);
            y1 = y1.max(p.y);
        }
        Aabb::new(Point3::new(x0, y0, self.z_min), Point3::new(x1, y1, self.z_max))
    }

    /// Pairs of non-adjacent footprint edges that intersect
    ///
    /// An empty result means the footprint is a simple polygon.
    #[must_use]
    pub fn self_intersections(&self) -> Vec<(usize, usize)> {
        let n = self.footprint.len();
        let mut hits = Vec::new();
        for i in 0..n {
            for j in (i + 1)..n {
                let adjacent = j == i + 1 || (i == 0 && j == n - 1);
                if adjacent {
                    continue;
                }
                let (a, b) = (self.footprint[i], self.footprint[(i + 1) % n]);
                let (c, d) = (self.footprint[j], self.footprint[(j + 1) % n]);
                if segments_intersect(&a, &b, &c, &d) {
                    hits.push((i, j));
                }
            }
        }
        hits
    }

    /// Whether the footprint is a simple polygon
    #[must_use]
    pub fn is_simple(&self) -> bool {
        self.self_intersections().is_empty()
    }
}

fn check_point(entity: &str, p: &Point3<f64>) -> MeshResult<()> {
    if p.coords.iter().all(|c| c.is_finite()) {
        Ok(())
    } else {
        Err(MeshError::degenerate_geometry(
            entity,
            format!("non-finite coordinate ({}, {}, {})", p.x, p.y, p.z),
        ))
    }
}

fn check_length(entity: &str, what: &str, value: f64) -> MeshResult<()> {
    if value.is_finite() && value > GEOMETRY_EPSILON {
        Ok(())
    } else {
        Err(MeshError::degenerate_geometry(
            entity,
            format!("{what} must be positive and finite, got {value}"),
        ))
    }
}

fn unit_direction(entity: &str, direction: &Vector3<f64>) -> MeshResult<Vector3<f64>> {
    let norm = direction.norm();
    if norm.is_finite() && norm > GEOMETRY_EPSILON {
        Ok(direction / norm)
    } else {
        Err(MeshError::degenerate_geometry(entity, "axis direction has zero length"))
    }
}

/// Two unit vectors orthogonal to `axis` and to each other
fn orthonormal_basis(axis: &Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
    let helper = if axis.x.abs() < 0.9 { Vector3::x() } else { Vector3::y() };
    let u = axis.cross(&helper).normalize();
    let v = axis.cross(&u);
    (u, v)
}

/// Bounding box of a disk with centre `c`, unit normal `n` and radius `r`
fn disk_bounds(c: &Point3<f64>, n: &Vector3<f64>, r: f64) -> Aabb {
    let ext = Vector3::new(
        r * (1.0 - n.x * n.x).max(0.0).sqrt(),
        r * (1.0 - n.y * n.y).max(0.0).sqrt(),
        r * (1.0 - n.z * n.z).max(0.0).sqrt(),
    );
    Aabb::new(c - ext, c + ext)
}

fn cross_2d(a: &Vector2<f64>, b: &Vector2<f64>) -> f64 {
    a.x * b.y - a.y * b.x
}

fn signed_area(points: &[Point2<f64>]) -> f64 {
    let n = points.len();
    0.5 * (0..n)
        .map(|i| {
            let a = points[i];
            let b = points[(i + 1) % n];
            a.x * b.y - b.x * a.y
        })
        .sum::<f64>()
}

fn segment_distance_2d(p: &Point2<f64>, a: &Point2<f64>, b: &Point2<f64>) -> f64 {
    let ab = b - a;
    let len2 = ab.norm_squared();
    if len2 <= GEOMETRY_EPSILON * GEOMETRY_EPSILON {
        return (p - a).norm();
    }
    let t = ((p - a).dot(&ab) / len2).clamp(0.0, 1.0);
    (p - (a + ab * t)).norm()
}

fn point_in_convex_polygon(p: &Point2<f64>, poly: &[Point2<f64>]) -> bool {
    let n = poly.len();
    let mut sign = 0.0_f64;
    for i in 0..n {
        let a = poly[i];
        let b = poly[(i + 1) % n];
        let edge = b - a;
        if edge.norm_squared() <= GEOMETRY_EPSILON * GEOMETRY_EPSILON {
            continue;
        }
        let c = cross_2d(&edge, &(p - a));
        if c.abs() <= GEOMETRY_EPSILON {
            continue;
        }
        if sign == 0.0 {
            sign = c.signum();
        } else if c.signum() != sign {
            return false;
        }
    }
    true
}

fn orientation(a: &Point2<f64>, b: &Point2<f64>, c: &Point2<f64>) -> f64 {
    cross_2d(&(b - a), &(c - a))
}

fn on_segment(a: &Point2<f64>, b: &Point2<f64>, p: &Point2<f64>) -> bool {
    p.x >= a.x.min(b.x) - GEOMETRY_EPSILON
        && p.x <= a.x.max(b.x) + GEOMETRY_EPSILON
        && p.y >= a.y.min(b.y) - GEOMETRY_EPSILON
        && p.y <= a.y.max(b.y) + GEOMETRY_EPSILON
}

fn segments_intersect(a: &Point2<f64>, b: &Point2<f64>, c: &Point2<f64>, d: &Point2<f64>) -> bool {
    let o1 = orientation(a, b, c);
    let o2 = orientation(a, b, d);
    let o3 = orientation(c, d, a);
    let o4 = orientation(c, d, b);
    let straddles = |x: f64, y: f64| (x > GEOMETRY_EPSILON && y < -GEOMETRY_EPSILON) || (x < -GEOMETRY_EPSILON && y > GEOMETRY_EPSILON);
    if straddles(o1, o2) && straddles(o3, o4) {
        return true;
    }
    (o1.abs() <= GEOMETRY_EPSILON && on_segment(a, b, c))
        || (o2.abs() <= GEOMETRY_EPSILON && on_segment(a, b, d))
        || (o3.abs() <= GEOMETRY_EPSILON && on_segment(c, d, a))
        || (o4.abs() <= GEOMETRY_EPSILON && on_segment(c, d, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sphere_rejects_zero_radius() {
        let err = Sphere::new(Point3::origin(), 0.0).unwrap_err();
        assert!(matches!(err, MeshError::DegenerateGeometry { .. }));
        assert!(Sphere::new(Point3::origin(), f64::NAN).is_err());
    }

    #[test]
    fn test_sphere_queries() {
        let s = Sphere::new(Point3::new(1.0, 2.0, 3.0), 2.0).unwrap();
        assert!(s.contains(&Point3::new(2.0, 2.0, 3.0)));
        assert!(!s.contains(&Point3::new(4.0, 2.0, 3.0)));
        assert_relative_eq!(s.distance_to(&Point3::new(6.0, 2.0, 3.0)), 3.0);
        assert_relative_eq!(s.distance_to(&Point3::new(1.0, 2.0, 3.0)), 0.0);
        let bb = s.bounding_box();
        assert_relative_eq!(bb.min.x, -1.0);
        assert_relative_eq!(bb.max.z, 5.0);
    }

    #[test]
    fn test_frustum_rejects_zero_length() {
        let err = Frustum::new(Point3::origin(), Vector3::x(), 0.0, 1.0, 2.0).unwrap_err();
        assert!(matches!(err, MeshError::DegenerateGeometry { .. }));
        assert!(Frustum::new(Point3::origin(), Vector3::zeros(), 1.0, 1.0, 2.0).is_err());
        assert!(Frustum::new(Point3::origin(), Vector3::x(), 1.0, 0.0, 0.0).is_err());
    }

    #[test]
    fn test_frustum_distance() {
        let f = Frustum::new(Point3::origin(), Vector3::x(), 10.0, 1.0, 2.0).unwrap();
        assert!(f.contains(&Point3::new(5.0, 1.4, 0.0)));
        assert!(!f.contains(&Point3::new(5.0, 1.6, 0.0)));
        // Beyond the end cap on the axis
        assert_relative_eq!(f.distance_to(&Point3::new(13.0, 0.0, 0.0)), 3.0, epsilon = 1e-12);
        // Behind the start cap
        assert_relative_eq!(f.distance_to(&Point3::new(-2.0, 0.5, 0.0)), 2.0, epsilon = 1e-12);
        // Inside
        assert_relative_eq!(f.distance_to(&Point3::new(5.0, 0.0, 1.0)), 0.0);
        // Radially outside a cylinder-like section
        let c = Cylinder::new(Point3::origin(), Vector3::z(), 4.0, 1.0).unwrap();
        assert_relative_eq!(c.distance_to(&Point3::new(3.0, 0.0, 2.0)), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_frustum_from_expansion() {
        let f = Frustum::from_expansion(Point3::origin(), Vector3::y(), 100.0, 10.0, 45f64.to_radians())
            .unwrap();
        assert_relative_eq!(f.end_radius(), 110.0, epsilon = 1e-9);
        assert_relative_eq!(f.end().y, 100.0);
        assert!(Frustum::from_expansion(Point3::origin(), Vector3::y(), 1.0, 1.0, 2.0).is_err());
    }

    #[test]
    fn test_frustum_truncated_keeps_taper() {
        let f = Frustum::new(Point3::origin(), Vector3::x(), 10.0, 1.0, 3.0).unwrap();
        let t = f.truncated(5.0).unwrap();
        assert_relative_eq!(t.length(), 5.0);
        assert_relative_eq!(t.end_radius(), 2.0);
    }

    #[test]
    fn test_cuboid_rejects_flat_box() {
        assert!(Cuboid::new(Point3::origin(), Point3::new(1.0, 1.0, 0.0)).is_err());
        let b = Cuboid::new(Point3::origin(), Point3::new(2.0, 4.0, 6.0)).unwrap();
        assert_relative_eq!(b.characteristic_radius(), 1.0);
        assert_relative_eq!(b.distance_to(&Point3::new(5.0, 2.0, 3.0)), 3.0);
    }

    #[test]
    fn test_shape_overlap() {
        let a: Shape = Sphere::new(Point3::origin(), 1.0).unwrap().into();
        let b: Shape = Sphere::new(Point3::new(1.5, 0.0, 0.0), 1.0).unwrap().into();
        let c: Shape = Sphere::new(Point3::new(5.0, 0.0, 0.0), 1.0).unwrap().into();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));

        let wake: Shape = Frustum::new(Point3::new(-1.0, 0.0, 0.0), Vector3::x(), 10.0, 0.5, 2.0)
            .unwrap()
            .into();
        assert!(wake.overlaps(&c));
        let far: Shape = Sphere::new(Point3::new(5.0, 20.0, 0.0), 1.0).unwrap().into();
        assert!(!wake.overlaps(&far));
    }

    #[test]
    fn test_domain_box_queries() {
        let d = DomainBoundary::from_box([-1000.0, 1000.0], [-1000.0, 1000.0], 0.0, 500.0).unwrap();
        assert!(d.is_axis_aligned_box());
        assert!(d.is_simple());
        assert_relative_eq!(d.area(), 4.0e6);
        assert!(d.contains(&Point3::new(0.0, 0.0, 100.0)));
        assert!(!d.contains(&Point3::new(0.0, 0.0, 600.0)));
        let exit = d
            .ray_exit_distance(&Point3::new(500.0, 0.0, 90.0), &Vector3::x())
            .unwrap();
        assert_relative_eq!(exit, 500.0, epsilon = 1e-9);
        assert!(d
            .ray_exit_distance(&Point3::new(5000.0, 0.0, 90.0), &Vector3::x())
            .is_none());
    }

    #[test]
    fn test_domain_polygon_orientation_and_degeneracy() {
        let cw = vec![
            Point2::new(0.0, 0.0),
            Point2::new(0.0, 10.0),
            Point2::new(10.0, 10.0),
            Point2::new(10.0, 0.0),
        ];
        let d = DomainBoundary::from_polygon(cw, 0.0, 1.0).unwrap();
        assert!(signed_area(d.footprint()) > 0.0);

        let collinear = vec![Point2::new(0.0, 0.0), Point2::new(1.0, 1.0), Point2::new(2.0, 2.0)];
        assert!(DomainBoundary::from_polygon(collinear, 0.0, 1.0).is_err());
        assert!(DomainBoundary::from_box([0.0, 1.0], [0.0, 1.0], 1.0, 1.0).is_err());
    }

    #[test]
    fn test_bowtie_is_not_simple() {
        let bowtie = vec![
            Point2::new(0.0, 0.0),
            Point2::new(10.0, 10.0),
            Point2::new(10.0, 0.0),
            Point2::new(0.0, 10.0),
        ];
        // A symmetric bowtie has zero signed area and is rejected outright
        let mut skewed = bowtie;
        skewed[1].x = 12.0;
        skewed[3].y = 12.0;
        let d = DomainBoundary::from_polygon(skewed, 0.0, 1.0).unwrap();
        assert!(!d.is_simple());
        assert_eq!(d.self_intersections().len(), 1);
    }

    #[test]
    fn test_ray_from_edge_exits_immediately() {
        let d = DomainBoundary::from_box([-1000.0, 1000.0], [-1000.0, 1000.0], 0.0, 500.0).unwrap();
        let on_edge = Point3::new(1000.0, 0.0, 90.0);
        assert_eq!(d.ray_exit_distance(&on_edge, &Vector3::x()), Some(0.0));
        let inward = d.ray_exit_distance(&on_edge, &-Vector3::x()).unwrap();
        assert_relative_eq!(inward, 2000.0, epsilon = 1e-9);
        // Sliding along the edge leaves at the corner
        let along = d.ray_exit_distance(&on_edge, &Vector3::y()).unwrap();
        assert_relative_eq!(along, 1000.0, epsilon = 1e-9);
        let corner = Point3::new(1000.0, 1000.0, 90.0);
        assert_eq!(d.ray_exit_distance(&corner, &Vector3::x()), Some(0.0));
    }

    #[test]
    fn test_ray_from_reflex_vertex_into_interior() {
        // L-shaped footprint with its reflex corner at (10, 10)
        let l_shape = vec![
            Point2::new(0.0, 0.0),
            Point2::new(20.0, 0.0),
            Point2::new(20.0, 10.0),
            Point2::new(10.0, 10.0),
            Point2::new(10.0, 20.0),
            Point2::new(0.0, 20.0),
        ];
        let d = DomainBoundary::from_polygon(l_shape, 0.0, 5.0).unwrap();
        let exit = d
            .ray_exit_distance(&Point3::new(10.0, 10.0, 1.0), &Vector3::new(-1.0, -1.0, 0.0))
            .unwrap();
        assert_relative_eq!(exit, 10.0 * 2f64.sqrt(), epsilon = 1e-9);
        assert_eq!(
            d.ray_exit_distance(&Point3::new(10.0, 10.0, 1.0), &Vector3::new(1.0, 1.0, 0.0)),
            Some(0.0)
        );
    }

    #[test]
    fn test_terrain_bilinear_lookup() {
        let t = Terrain::new(vec![0.0, 100.0], vec![0.0, 100.0], vec![0.0, 10.0, 20.0, 30.0]).unwrap();
        assert_relative_eq!(t.height_at(0.0, 0.0), 0.0);
        assert_relative_eq!(t.height_at(100.0, 100.0), 30.0);
        assert_relative_eq!(t.height_at(50.0, 50.0), 15.0, epsilon = 1e-12);
        assert_relative_eq!(t.height_at(25.0, 0.0), 2.5, epsilon = 1e-12);
        // Clamped outside the grid
        assert_relative_eq!(t.height_at(-50.0, 200.0), 20.0);
        assert_eq!(t.height_range(), (0.0, 30.0));

        assert!(Terrain::new(vec![0.0, 0.0], vec![0.0, 1.0], vec![0.0; 4]).is_err());
        assert!(Terrain::new(vec![0.0, 1.0], vec![0.0, 1.0], vec![0.0; 3]).is_err());
    }

    #[test]
    fn test_terrain_from_scattered_points() {
        let points = [
            [100.0, 0.0, 10.0],
            [0.0, 100.0, 20.0],
            [0.0, 0.0, 0.0],
            [100.0, 100.0, 30.0],
            [200.0, 0.0, 5.0],
            [200.0, 100.0, 5.0],
        ];
        let t = Terrain::from_points(&points).unwrap();
        assert_relative_eq!(t.height_at(50.0, 50.0), 15.0, epsilon = 1e-12);
        assert_relative_eq!(t.height_at(150.0, 0.0), 7.5, epsilon = 1e-12);
        assert!(Terrain::from_points(&points[..5]).is_err());
    }

    #[test]
    fn test_terrain_raises_the_floor() {
        let hill = Terrain::new(vec![-100.0, 100.0], vec![-100.0, 100.0], vec![0.0, 80.0, 0.0, 80.0]).unwrap();
        let d = DomainBoundary::from_box([-100.0, 100.0], [-100.0, 100.0], 0.0, 300.0)
            .unwrap()
            .with_terrain(hill.clone())
            .unwrap();
        assert_relative_eq!(d.ground_height(100.0, 0.0), 80.0);
        assert!(!d.contains(&Point3::new(100.0, 0.0, 50.0)));
        assert!(d.contains(&Point3::new(-100.0, 0.0, 50.0)));

        let low = DomainBoundary::from_box([-100.0, 100.0], [-100.0, 100.0], 0.0, 60.0).unwrap();
        assert!(low.with_terrain(hill).is_err());
    }

    #[test]
    fn test_vertical_stretch_round_trip() {
        let s = VerticalStretch::new(10.0, 2.0, 100.0).unwrap();
        assert_relative_eq!(s.stretch_height(60.0), 110.0);
        assert_relative_eq!(s.stretch_height(110.0), 210.0);
        assert_relative_eq!(s.stretch_height(410.0), 510.0);
        for z in [10.0, 35.0, 110.0, 250.0, 410.0] {
            assert_relative_eq!(s.compress_height(s.stretch_height(z)), z, epsilon = 1e-9);
        }
        assert!(VerticalStretch::identity(0.0).is_identity());
        assert!(VerticalStretch::new(0.0, 0.0, 10.0).is_err());
        assert!(VerticalStretch::new(0.0, 2.0, -1.0).is_err());
    }

    #[test]
    fn test_stretched_shapes() {
        let s = VerticalStretch::new(0.0, 2.0, 100.0).unwrap();
        let slab: Shape = Cuboid::new(Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 10.0, 150.0))
            .unwrap()
            .into();
        let b = s.stretch_shape(&slab).unwrap().bounding_box();
        assert_relative_eq!(b.max.z, 250.0);
        assert_relative_eq!(b.max.x, 10.0);

        let mast: Shape = Cylinder::vertical(Point2::new(5.0, 5.0), 2.0, 50.0, 120.0).unwrap().into();
        let m = s.stretch_shape(&mast).unwrap().bounding_box();
        assert_relative_eq!(m.min.z, 100.0, epsilon = 1e-9);
        assert_relative_eq!(m.max.z, 220.0, epsilon = 1e-9);

        let near: Shape = Sphere::new(Point3::new(0.0, 0.0, 80.0), 40.0).unwrap().into();
        let Shape::Sphere(moved) = s.stretch_shape(&near).unwrap() else {
            panic!("sphere should stay a sphere");
        };
        assert_relative_eq!(moved.center().z, 160.0);
        assert_relative_eq!(moved.radius(), 40.0);
    }
}
