//! Target element size over the domain
//!
//! [`SizeField`] is the closed-form field: every zone shape acts as a source
//! whose implied size rises linearly from the zone's target size at the shape
//! boundary to the background size at `blend_radius_factor` times the shape's
//! characteristic radius. The slope is capped at `target * gradation_limit`
//! per metre, so the minimum over all sources (and the background) never
//! grows faster than the gradation limit allows.
//!
//! [`SampledSizeField`] samples any [`SizeFunction`] on a uniform lattice and
//! clamps neighbouring nodes to the gradation limit, for meshers that want a
//! background grid instead of a callback.
//!
//! [`StretchedSizeField`] answers queries made in vertically stretched space
//! by looking the physical field up at the compressed point.

use crate::config::FarmSpec;
use crate::defaults;
use crate::error::{MeshError, MeshResult};
use crate::geometry::{Aabb, Primitive, Shape, VerticalStretch, GEOMETRY_EPSILON};
use crate::zones::RefinementZone;
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Anything that maps a point to a target element size
pub trait SizeFunction: Send + Sync {
    /// Raw size at a point, without validation
    fn size_at(&self, point: &Point3<f64>) -> f64;

    /// Size at a point, failing on non-finite or non-positive values
    fn evaluate(&self, point: &Point3<f64>) -> MeshResult<f64> {
        check_size(point, self.size_at(point))
    }
}

impl<F> SizeFunction for F
where
    F: Fn(&Point3<f64>) -> f64 + Send + Sync,
{
    fn size_at(&self, point: &Point3<f64>) -> f64 {
        self(point)
    }
}

fn check_size(point: &Point3<f64>, value: f64) -> MeshResult<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(MeshError::invalid_size_field([point.x, point.y, point.z], value))
    }
}

/// Check relative growth between two samples `distance` apart
#[must_use]
pub fn gradation_between(a: f64, b: f64, distance: f64) -> f64 {
    if distance <= GEOMETRY_EPSILON {
        return 0.0;
    }
    (a - b).abs() / a.min(b) / distance
}

/// Closed-form size field composed from refinement zones
#[derive(Debug, Clone)]
pub struct SizeField {
    zones: Vec<RefinementZone>,
    default_size: f64,
    blend_radius_factor: f64,
    gradation_limit: f64,
}

impl SizeField {
    /// Compose a field from zones and blending parameters
    pub fn new(
        zones: Vec<RefinementZone>,
        default_size: f64,
        blend_radius_factor: f64,
        gradation_limit: f64,
    ) -> MeshResult<Self> {
        if !default_size.is_finite() || default_size <= 0.0 {
            return Err(MeshError::configuration(
                "domain.default_resolution",
                format!("background size must be positive, got {default_size}"),
            ));
        }
        if !blend_radius_factor.is_finite() || blend_radius_factor <= 1.0 {
            return Err(MeshError::configuration(
                "refinement.blend_radius_factor",
                format!("must be greater than 1, got {blend_radius_factor}"),
            ));
        }
        if !gradation_limit.is_finite() || gradation_limit <= 0.0 {
            return Err(MeshError::configuration(
                "refinement.gradation_limit",
                format!("must be positive, got {gradation_limit}"),
            ));
        }
        Ok(Self {
            zones,
            default_size,
            blend_radius_factor,
            gradation_limit,
        })
    }

    /// Build the field for a farm from its resolved zones
    pub fn from_spec(spec: &FarmSpec, zones: Vec<RefinementZone>) -> MeshResult<Self> {
        let field = Self::new(
            zones,
            spec.background_size(),
            spec.refinement.blend_radius_factor,
            spec.refinement.gradation_limit,
        )?;
        log::info!(
            "Size field: {} zones, background {:.3} m, finest {:.3} m",
            field.zones.len(),
            field.default_size,
            field.min_size()
        );
        Ok(field)
    }

    /// Zones feeding the field
    #[must_use]
    pub fn zones(&self) -> &[RefinementZone] {
        &self.zones
    }

    /// Background size far from every zone
    #[must_use]
    pub const fn default_size(&self) -> f64 {
        self.default_size
    }

    /// Outer blend radius as a multiple of each shape's radius
    #[must_use]
    pub const fn blend_radius_factor(&self) -> f64 {
        self.blend_radius_factor
    }

    /// Maximum relative growth per metre
    #[must_use]
    pub const fn gradation_limit(&self) -> f64 {
        self.gradation_limit
    }

    /// Smallest size anywhere in the field
    #[must_use]
    pub fn min_size(&self) -> f64 {
        self.zones
            .iter()
            .map(RefinementZone::target_size)
            .fold(self.default_size, f64::min)
    }

    /// Size implied by a single zone, before taking the minimum with other zones
    #[must_use]
    pub fn zone_size(&self, zone: &RefinementZone, point: &Point3<f64>) -> f64 {
        zone.shapes()
            .iter()
            .map(|shape| self.shape_size(shape, zone.target_size(), point))
            .fold(self.default_size, f64::min)
    }

    fn shape_size(&self, shape: &Shape, target: f64, point: &Point3<f64>) -> f64 {
        if target >= self.default_size {
            return self.default_size;
        }
        let band = (self.blend_radius_factor - 1.0) * shape.characteristic_radius();
        let blend_slope = if band > GEOMETRY_EPSILON {
            (self.default_size - target) / band
        } else {
            f64::INFINITY
        };
        let slope = blend_slope.min(target * self.gradation_limit);
        let reach = (self.default_size - target) / slope;

        // Bounding-box distance never exceeds the true distance
        if shape.bounding_box().distance_to_point(point) >= reach {
            return self.default_size;
        }
        let d = shape.distance_to(point);
        (target + slope * d).min(self.default_size)
    }

    /// Sample the field at many points in parallel
    ///
    /// The result is in input order and independent of scheduling; the first
    /// invalid value in input order is reported.
    pub fn sample_points(&self, points: &[Point3<f64>]) -> MeshResult<Vec<f64>> {
        let values: Vec<f64> = points.par_iter().map(|p| self.size_at(p)).collect();
        for (p, v) in points.iter().zip(&values) {
            check_size(p, *v)?;
        }
        Ok(values)
    }
}

impl SizeFunction for SizeField {
    fn size_at(&self, point: &Point3<f64>) -> f64 {
        self.zones
            .iter()
            .map(|zone| self.zone_size(zone, point))
            .fold(self.default_size, f64::min)
    }
}

/// A physical size field queried from vertically stretched space
#[derive(Clone)]
pub struct StretchedSizeField {
    inner: Arc<dyn SizeFunction>,
    stretch: VerticalStretch,
}

impl StretchedSizeField {
    /// Wrap a physical field
    #[must_use]
    pub fn new(inner: Arc<dyn SizeFunction>, stretch: VerticalStretch) -> Self {
        Self { inner, stretch }
    }

    /// The stretch applied to queries
    #[must_use]
    pub const fn stretch(&self) -> &VerticalStretch {
        &self.stretch
    }
}

impl SizeFunction for StretchedSizeField {
    fn size_at(&self, point: &Point3<f64>) -> f64 {
        self.inner.size_at(&self.stretch.compress_point(point))
    }
}

/// Size field sampled on a uniform lattice with enforced gradation
#[derive(Debug, Clone)]
pub struct SampledSizeField {
    origin: Point3<f64>,
    spacing: f64,
    dims: [usize; 3],
    values: Vec<f64>,
    gradation_limit: f64,
}

impl SampledSizeField {
    /// Sample `field` over `bounds`
    ///
    /// The spacing is widened when the lattice would exceed
    /// [`defaults::MAX_SIZE_FIELD_SAMPLES`] nodes.
    pub fn from_field<F>(field: &F, bounds: &Aabb, spacing: f64, gradation_limit: f64) -> MeshResult<Self>
    where
        F: SizeFunction + ?Sized,
    {
        if !spacing.is_finite() || spacing <= 0.0 {
            return Err(MeshError::configuration(
                "size_field.spacing",
                format!("must be positive, got {spacing}"),
            ));
        }
        if !gradation_limit.is_finite() || gradation_limit <= 0.0 {
            return Err(MeshError::configuration(
                "refinement.gradation_limit",
                format!("must be positive, got {gradation_limit}"),
            ));
        }

        let extents = bounds.extents();
        let mut spacing = spacing;
        let mut dims = lattice_dims(&extents, spacing);
        let cap = defaults::MAX_SIZE_FIELD_SAMPLES;
        let mut count = lattice_node_count(&dims);
        while count.map_or(true, |n| n > cap) {
            let ratio = dims.iter().map(|&d| d as f64).product::<f64>() / cap as f64;
            spacing *= ratio.cbrt().max(1.01);
            dims = lattice_dims(&extents, spacing);
            count = lattice_node_count(&dims);
        }
        let count = count.unwrap_or(cap);

        let origin = bounds.min;
        let values: Vec<f64> = (0..count)
            .into_par_iter()
            .map(|n| field.size_at(&node_position(&origin, spacing, &dims, n)))
            .collect();
        for (n, v) in values.iter().enumerate() {
            check_size(&node_position(&origin, spacing, &dims, n), *v)?;
        }

        let mut sampled = Self {
            origin,
            spacing,
            dims,
            values,
            gradation_limit,
        };
        let clamped = sampled.enforce_gradation();
        log::debug!(
            "Sampled size field: {}x{}x{} nodes at {:.3} m spacing, {} nodes clamped",
            dims[0],
            dims[1],
            dims[2],
            spacing,
            clamped
        );
        Ok(sampled)
    }

    /// Sample a closed-form field using its own gradation limit
    pub fn from_size_field(field: &SizeField, bounds: &Aabb, spacing: f64) -> MeshResult<Self> {
        Self::from_field(field, bounds, spacing, field.gradation_limit())
    }

    /// Lattice spacing actually used
    #[must_use]
    pub const fn spacing(&self) -> f64 {
        self.spacing
    }

    /// Node counts along x, y, z
    #[must_use]
    pub const fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Node values in x-fastest order
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Region covered by the lattice
    #[must_use]
    pub fn bounds(&self) -> Aabb {
        let far = Vector3::new(
            (self.dims[0] - 1) as f64,
            (self.dims[1] - 1) as f64,
            (self.dims[2] - 1) as f64,
        ) * self.spacing;
        Aabb::new(self.origin, self.origin + far)
    }

    /// Value at lattice node `(i, j, k)`
    #[must_use]
    pub fn node(&self, i: usize, j: usize, k: usize) -> Option<f64> {
        if i < self.dims[0] && j < self.dims[1] && k < self.dims[2] {
            Some(self.values[self.index(i, j, k)])
        } else {
            None
        }
    }

    /// Position of lattice node `(i, j, k)`
    #[must_use]
    pub fn node_position(&self, i: usize, j: usize, k: usize) -> Point3<f64> {
        self.origin + Vector3::new(i as f64, j as f64, k as f64) * self.spacing
    }

    /// Largest relative growth per metre between adjacent nodes
    #[must_use]
    pub fn max_gradation(&self) -> f64 {
        let mut worst: f64 = 0.0;
        for n in 0..self.values.len() {
            for m in self.forward_neighbours(n) {
                worst = worst.max(gradation_between(self.values[n], self.values[m], self.spacing));
            }
        }
        worst
    }

    /// Trilinear interpolation, clamped to the lattice bounds
    #[must_use]
    pub fn interpolate(&self, point: &Point3<f64>) -> f64 {
        let local = (point - self.origin) / self.spacing;
        let mut base = [0usize; 3];
        let mut frac = [0.0f64; 3];
        for axis in 0..3 {
            let last = (self.dims[axis] - 1) as f64;
            let u = local[axis].clamp(0.0, last);
            let cell = u.floor().min((last - 1.0).max(0.0));
            base[axis] = cell as usize;
            frac[axis] = u - cell;
        }

        let mut acc = 0.0;
        for corner in 0..8usize {
            let offset = [corner & 1, (corner >> 1) & 1, (corner >> 2) & 1];
            let mut weight = 1.0;
            let mut idx = [0usize; 3];
            for axis in 0..3 {
                idx[axis] = (base[axis] + offset[axis]).min(self.dims[axis] - 1);
                weight *= if offset[axis] == 1 { frac[axis] } else { 1.0 - frac[axis] };
            }
            if weight > 0.0 {
                acc += weight * self.values[self.index(idx[0], idx[1], idx[2])];
            }
        }
        acc
    }

    /// Clamp nodes so no neighbour exceeds `s * (1 + g * h)`
    ///
    /// Nodes are settled in increasing size order, so each node is final when
    /// popped and the pass reaches the fixed point in one sweep. Returns the
    /// number of nodes that were reduced.
    fn enforce_gradation(&mut self) -> usize {
        let factor = 1.0 + self.gradation_limit * self.spacing;
        let original = self.values.clone();
        let mut settled = vec![false; self.values.len()];
        let mut heap: BinaryHeap<Reverse<Node>> = self
            .values
            .iter()
            .enumerate()
            .map(|(index, &size)| Reverse(Node { size, index }))
            .collect();

        while let Some(Reverse(Node { size, index })) = heap.pop() {
            if settled[index] || size > self.values[index] {
                continue;
            }
            settled[index] = true;
            let limit = size * factor;
            for m in self.neighbours(index) {
                if !settled[m] && self.values[m] > limit {
                    self.values[m] = limit;
                    heap.push(Reverse(Node { size: limit, index: m }));
                }
            }
        }

        self.values
            .iter()
            .zip(&original)
            .filter(|(a, b)| a < b)
            .count()
    }

    fn index(&self, i: usize, j: usize, k: usize) -> usize {
        i + self.dims[0] * (j + self.dims[1] * k)
    }

    fn coords(&self, n: usize) -> [usize; 3] {
        let i = n % self.dims[0];
        let j = (n / self.dims[0]) % self.dims[1];
        let k = n / (self.dims[0] * self.dims[1]);
        [i, j, k]
    }

    fn neighbours(&self, n: usize) -> Vec<usize> {
        let c = self.coords(n);
        let mut out = Vec::with_capacity(6);
        for axis in 0..3 {
            if c[axis] > 0 {
                let mut d = c;
                d[axis] -= 1;
                out.push(self.index(d[0], d[1], d[2]));
            }
            if c[axis] + 1 < self.dims[axis] {
                let mut d = c;
                d[axis] += 1;
                out.push(self.index(d[0], d[1], d[2]));
            }
        }
        out
    }

    fn forward_neighbours(&self, n: usize) -> impl Iterator<Item = usize> + '_ {
        let c = self.coords(n);
        (0..3).filter_map(move |axis| {
            (c[axis] + 1 < self.dims[axis]).then(|| {
                let mut d = c;
                d[axis] += 1;
                self.index(d[0], d[1], d[2])
            })
        })
    }
}

impl SizeFunction for SampledSizeField {
    fn size_at(&self, point: &Point3<f64>) -> f64 {
        self.interpolate(point)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Node {
    size: f64,
    index: usize,
}

impl Eq for Node {}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.size
            .total_cmp(&other.size)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Nodes in a lattice, `None` when the count does not fit in `usize`
#[must_use]
pub fn lattice_node_count(dims: &[usize; 3]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

fn lattice_dims(extents: &Vector3<f64>, spacing: f64) -> [usize; 3] {
    let axis = |len: f64| ((len / spacing).ceil() as usize + 1).max(2);
    [axis(extents.x), axis(extents.y), axis(extents.z)]
}

fn node_position(origin: &Point3<f64>, spacing: f64, dims: &[usize; 3], n: usize) -> Point3<f64> {
    let i = n % dims[0];
    let j = (n / dims[0]) % dims[1];
    let k = n / (dims[0] * dims[1]);
    origin + Vector3::new(i as f64, j as f64, k as f64) * spacing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Sphere;
    use crate::zones::ZoneKind;
    use approx::assert_relative_eq;

    fn near_field(center: Point3<f64>, radius: f64, size: f64) -> RefinementZone {
        let s = Sphere::new(center, radius).unwrap();
        RefinementZone::new(0, ZoneKind::NearField, s.into(), size, 0).unwrap()
    }

    #[test]
    fn test_single_zone_blends_to_default() {
        let hub = Point3::new(0.0, 0.0, 90.0);
        let field = SizeField::new(vec![near_field(hub, 60.0, 12.5)], 50.0, 2.0, 0.2).unwrap();
        assert_relative_eq!(field.size_at(&hub), 12.5);
        assert_relative_eq!(field.size_at(&Point3::new(60.0, 0.0, 90.0)), 12.5);
        assert_relative_eq!(field.size_at(&Point3::new(90.0, 0.0, 90.0)), 31.25, epsilon = 1e-9);
        assert_relative_eq!(field.size_at(&Point3::new(0.0, 120.0, 90.0)), 50.0, epsilon = 1e-9);
        assert_relative_eq!(field.size_at(&Point3::new(0.0, 500.0, 90.0)), 50.0);
    }

    #[test]
    fn test_finest_zone_wins() {
        let a = near_field(Point3::new(0.0, 0.0, 0.0), 20.0, 8.0);
        let b = near_field(Point3::new(10.0, 0.0, 0.0), 20.0, 2.0);
        let field = SizeField::new(vec![a, b], 50.0, 2.0, 0.2).unwrap();
        assert_relative_eq!(field.size_at(&Point3::new(5.0, 0.0, 0.0)), 2.0);
        assert_relative_eq!(field.min_size(), 2.0);
    }

    #[test]
    fn test_steep_blend_is_capped_by_gradation() {
        // Tiny zone, large background: the blend alone would jump too fast
        let zone = near_field(Point3::origin(), 1.0, 1.0);
        let field = SizeField::new(vec![zone], 100.0, 2.0, 0.1).unwrap();
        let line: Vec<Point3<f64>> = (0..400).map(|i| Point3::new(i as f64 * 0.5, 0.0, 0.0)).collect();
        let values = field.sample_points(&line).unwrap();
        for w in values.windows(2) {
            assert!(gradation_between(w[0], w[1], 0.5) <= 0.1 + 1e-9);
        }
        assert_relative_eq!(values[4], 1.1, epsilon = 1e-9);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(matches!(
            SizeField::new(Vec::new(), -5.0, 2.0, 0.2),
            Err(MeshError::Configuration { .. })
        ));
        assert!(SizeField::new(Vec::new(), 5.0, 1.0, 0.2).is_err());
        assert!(SizeField::new(Vec::new(), 5.0, 2.0, 0.0).is_err());
    }

    #[test]
    fn test_non_positive_sample_fails_fast() {
        let broken = |p: &Point3<f64>| if p.x > 5.0 { 0.0 } else { 1.0 };
        let err = broken.evaluate(&Point3::new(6.0, 1.0, 2.0)).unwrap_err();
        match err {
            MeshError::InvalidSizeField { location, value } => {
                assert_eq!(location, [6.0, 1.0, 2.0]);
                assert_relative_eq!(value, 0.0);
            }
            other => panic!("unexpected error {other:?}"),
        }
        let bounds = Aabb::new(Point3::origin(), Point3::new(10.0, 1.0, 1.0));
        assert!(SampledSizeField::from_field(&broken, &bounds, 1.0, 0.2).is_err());
    }

    #[test]
    fn test_lattice_clamps_step_function() {
        let step = |p: &Point3<f64>| if p.x < 5.0 { 1.0 } else { 10.0 };
        let bounds = Aabb::new(Point3::origin(), Point3::new(20.0, 2.0, 2.0));
        let sampled = SampledSizeField::from_field(&step, &bounds, 1.0, 0.2).unwrap();
        assert_eq!(sampled.dims(), [21, 3, 3]);
        assert!(sampled.max_gradation() <= 0.2 + 1e-9);
        assert_relative_eq!(sampled.node(4, 0, 0).unwrap(), 1.0);
        assert_relative_eq!(sampled.node(5, 0, 0).unwrap(), 1.2, epsilon = 1e-12);
        assert_relative_eq!(sampled.node(6, 1, 1).unwrap(), 1.44, epsilon = 1e-12);
        assert_relative_eq!(sampled.node(20, 2, 2).unwrap(), 10.0);
    }

    #[test]
    fn test_lattice_interpolates_linear_field() {
        let ramp = |p: &Point3<f64>| 10.0 + 0.5 * p.x + 0.25 * p.y;
        let bounds = Aabb::new(Point3::origin(), Point3::new(10.0, 10.0, 10.0));
        let sampled = SampledSizeField::from_field(&ramp, &bounds, 2.0, 0.2).unwrap();
        let p = Point3::new(3.3, 7.1, 4.4);
        assert_relative_eq!(sampled.size_at(&p), ramp(&p), epsilon = 1e-9);
        // Outside the lattice the value is clamped to the nearest face
        assert_relative_eq!(
            sampled.size_at(&Point3::new(-5.0, 0.0, 0.0)),
            10.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_lattice_respects_sample_cap() {
        let flat = |_: &Point3<f64>| 1.0;
        let bounds = Aabb::new(Point3::origin(), Point3::new(1000.0, 1000.0, 1000.0));
        let sampled = SampledSizeField::from_field(&flat, &bounds, 1.0, 0.2).unwrap();
        let [nx, ny, nz] = sampled.dims();
        assert!(nx * ny * nz <= defaults::MAX_SIZE_FIELD_SAMPLES);
        assert!(sampled.spacing() > 1.0);
    }

    #[test]
    fn test_tiny_spacing_is_coarsened_without_overflow() {
        let flat = |_: &Point3<f64>| 1.0;
        let bounds = Aabb::new(Point3::origin(), Point3::new(2000.0, 2000.0, 500.0));
        let dims = lattice_dims(&bounds.extents(), 1e-7);
        assert!(lattice_node_count(&dims).is_none());

        let sampled = SampledSizeField::from_field(&flat, &bounds, 1e-7, 0.2).unwrap();
        let count = lattice_node_count(&sampled.dims()).unwrap();
        assert!(count <= defaults::MAX_SIZE_FIELD_SAMPLES);
        assert_eq!(sampled.values().len(), count);
    }

    #[test]
    fn test_stretched_queries_use_physical_heights() {
        let physical = |p: &Point3<f64>| 10.0 + p.z;
        let stretch = VerticalStretch::new(0.0, 2.0, 100.0).unwrap();
        let field = StretchedSizeField::new(Arc::new(physical), stretch);
        assert_relative_eq!(field.size_at(&Point3::new(5.0, 5.0, 100.0)), 60.0);
        assert_relative_eq!(field.size_at(&Point3::new(5.0, 5.0, 300.0)), 210.0);
        assert_relative_eq!(field.stretch().ratio(), 2.0);
    }

    #[test]
    fn test_sampled_closed_form_field_already_graded() {
        let zone = near_field(Point3::new(50.0, 50.0, 50.0), 10.0, 2.0);
        let field = SizeField::new(vec![zone], 20.0, 3.0, 0.2).unwrap();
        let bounds = Aabb::new(Point3::origin(), Point3::new(100.0, 100.0, 100.0));
        let sampled = SampledSizeField::from_size_field(&field, &bounds, 5.0).unwrap();
        assert!(sampled.max_gradation() <= 0.2 + 1e-9);
        let p = sampled.node_position(10, 10, 10);
        assert_relative_eq!(sampled.node(10, 10, 10).unwrap(), field.size_at(&p), epsilon = 1e-12);
    }
}
