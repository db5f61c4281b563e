//! Refinement zone resolution
//!
//! For every turbine the resolver derives a near-field sphere, a wake frustum
//! along the turbine's downstream direction and, when enabled, a far-field
//! transition box. User-authored custom regions become zones of their own.
//! Overlapping zones of the same kind are then merged: the merged zone covers
//! the union of the contributing shapes and takes the finest target size.
//!
//! Merging is a pure function from a zone list to a new zone list; zones are
//! never mutated after creation.

use crate::config::{CustomRegion, FarmSpec, Turbine};
use crate::error::{MeshError, MeshResult};
use crate::geometry::{Aabb, Cuboid, Cylinder, Frustum, Primitive, Shape, Sphere, VerticalStretch, GEOMETRY_EPSILON};
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Role of a refinement zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ZoneKind {
    /// Region immediately around a rotor
    NearField,
    /// Region downstream (and slightly upstream) of a rotor
    Wake,
    /// Transition box around a turbine's other zones
    FarField,
    /// User-authored region
    Custom,
}

impl ZoneKind {
    /// Label used in logs and reports
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::NearField => "near-field",
            Self::Wake => "wake",
            Self::FarField => "far-field",
            Self::Custom => "custom",
        }
    }
}

/// A region tagged with a target element size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementZone {
    id: usize,
    kind: ZoneKind,
    shapes: Vec<Shape>,
    target_size: f64,
    priority: usize,
    owners: Vec<usize>,
    wind_direction: Option<Vector3<f64>>,
    clipped: bool,
}

impl RefinementZone {
    /// Create a single-shape zone
    pub fn new(id: usize, kind: ZoneKind, shape: Shape, target_size: f64, priority: usize) -> MeshResult<Self> {
        if !target_size.is_finite() || target_size <= 0.0 {
            let c = shape.bounding_box().center();
            return Err(MeshError::invalid_size_field([c.x, c.y, c.z], target_size));
        }
        Ok(Self {
            id,
            kind,
            shapes: vec![shape],
            target_size,
            priority,
            owners: Vec::new(),
            wind_direction: None,
            clipped: false,
        })
    }

    /// Attach the owning turbine
    #[must_use]
    pub fn with_owner(mut self, turbine: usize) -> Self {
        self.owners = vec![turbine];
        self
    }

    /// Attach the wind direction a wake zone follows
    #[must_use]
    pub const fn with_wind_direction(mut self, direction: Vector3<f64>) -> Self {
        self.wind_direction = Some(direction);
        self
    }

    /// Mark the zone as shortened at the domain edge
    #[must_use]
    pub const fn with_clipped(mut self, clipped: bool) -> Self {
        self.clipped = clipped;
        self
    }

    /// Zone identifier, unique within one resolution run
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Zone role
    #[must_use]
    pub const fn kind(&self) -> ZoneKind {
        self.kind
    }

    /// Shapes whose union forms the zone
    #[must_use]
    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    /// Target element size inside the zone
    #[must_use]
    pub const fn target_size(&self) -> f64 {
        self.target_size
    }

    /// Tie-break priority; lower wins
    #[must_use]
    pub const fn priority(&self) -> usize {
        self.priority
    }

    /// Owning turbine, if any
    #[must_use]
    pub fn owner(&self) -> Option<usize> {
        self.owners.first().copied()
    }

    /// Every turbine that contributed to the zone, owner first
    #[must_use]
    pub fn owners(&self) -> &[usize] {
        &self.owners
    }

    /// Downstream direction for wake zones
    #[must_use]
    pub const fn wind_direction(&self) -> Option<Vector3<f64>> {
        self.wind_direction
    }

    /// Whether the zone was shortened at the domain edge
    #[must_use]
    pub const fn is_clipped(&self) -> bool {
        self.clipped
    }

    /// Whether any of the zone's shapes contains the point
    #[must_use]
    pub fn contains(&self, point: &Point3<f64>) -> bool {
        self.shapes.iter().any(|s| s.contains(point))
    }

    /// Distance from the point to the zone, zero inside
    #[must_use]
    pub fn distance_to(&self, point: &Point3<f64>) -> f64 {
        self.shapes
            .iter()
            .map(|s| s.distance_to(point))
            .fold(f64::INFINITY, f64::min)
    }

    /// Bounding box of the union
    #[must_use]
    pub fn bounding_box(&self) -> Aabb {
        let mut boxes = self.shapes.iter().map(Primitive::bounding_box);
        let first = boxes.next().unwrap_or_else(|| Aabb::new(Point3::origin(), Point3::origin()));
        boxes.fold(first, |acc, b| acc.union(&b))
    }

    /// Whether any shape of this zone overlaps any shape of the other
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.bounding_box().intersects(&other.bounding_box())
            && self
                .shapes
                .iter()
                .any(|a| other.shapes.iter().any(|b| a.overlaps(b)))
    }

    /// The same zone carried into vertically stretched space
    pub fn stretched(&self, stretch: &VerticalStretch) -> MeshResult<Self> {
        let shapes = self
            .shapes
            .iter()
            .map(|s| stretch.stretch_shape(s))
            .collect::<MeshResult<Vec<_>>>()?;
        Ok(Self { shapes, ..self.clone() })
    }

    /// Human-readable name used in reports
    #[must_use]
    pub fn describe(&self) -> String {
        match self.owner() {
            Some(t) => format!("{} zone {} (turbine {t})", self.kind.label(), self.id),
            None => format!("{} zone {}", self.kind.label(), self.id),
        }
    }

    /// Ordering used to pick the representative of a merged group
    fn finer_than(&self, other: &Self) -> Ordering {
        self.target_size
            .total_cmp(&other.target_size)
            .then(self.priority.cmp(&other.priority))
            .then(self.id.cmp(&other.id))
    }
}

/// A pair of turbines that violates the minimum clearance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClearanceViolation {
    /// Lower turbine index
    pub first: usize,
    /// Higher turbine index
    pub second: usize,
    /// Distance between the hub centres
    pub distance: f64,
    /// Minimum clearance required
    pub required: f64,
}

impl From<ClearanceViolation> for MeshError {
    fn from(v: ClearanceViolation) -> Self {
        Self::clearance_violation(v.first, v.second, v.distance, v.required)
    }
}

/// Every turbine pair closer than the configured clearance, in input order
#[must_use]
pub fn clearance_violations(spec: &FarmSpec) -> Vec<ClearanceViolation> {
    let turbines = &spec.turbines;
    let mut violations = Vec::new();
    for (i, a) in turbines.iter().enumerate() {
        for b in &turbines[i + 1..] {
            let distance = a.distance_to(b);
            let required = spec.refinement.clearance_threshold(a, b);
            if distance < required {
                violations.push(ClearanceViolation {
                    first: a.index,
                    second: b.index,
                    distance,
                    required,
                });
            }
        }
    }
    violations
}

/// Fail with the first clearance violation, if any
pub fn check_clearance(spec: &FarmSpec) -> MeshResult<()> {
    match clearance_violations(spec).into_iter().next() {
        Some(v) => Err(v.into()),
        None => Ok(()),
    }
}

/// Merge overlapping zones of the same kind
///
/// Overlap is transitive: zones connected through a chain of overlaps end up
/// in one merged zone. The merged zone keeps the id, owner and priority of
/// the contributor with the smallest `(target_size, priority)`. Output is
/// ordered by kind, then priority, then id, so it depends only on the input
/// order.
#[must_use]
pub fn merge_zones(zones: &[RefinementZone]) -> Vec<RefinementZone> {
    let n = zones.len();
    let mut parent: Vec<usize> = (0..n).collect();

    for i in 0..n {
        for j in (i + 1)..n {
            if zones[i].kind == zones[j].kind && zones[i].overlaps(&zones[j]) {
                union(&mut parent, i, j);
            }
        }
    }

    let mut group_of_root: Vec<Option<usize>> = vec![None; n];
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for i in 0..n {
        let root = find(&mut parent, i);
        match group_of_root[root] {
            Some(g) => groups[g].push(i),
            None => {
                group_of_root[root] = Some(groups.len());
                groups.push(vec![i]);
            }
        }
    }

    let mut merged: Vec<RefinementZone> = groups.iter().map(|g| merge_group(zones, g)).collect();
    merged.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then(a.priority.cmp(&b.priority))
            .then(a.id.cmp(&b.id))
    });
    merged
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra != rb {
        // Keep the lower index as root so groups follow input order
        let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
        parent[hi] = lo;
    }
}

fn merge_group(zones: &[RefinementZone], members: &[usize]) -> RefinementZone {
    let mut contributors: Vec<&RefinementZone> = members.iter().map(|&i| &zones[i]).collect();
    contributors.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));

    let representative = contributors
        .iter()
        .copied()
        .min_by(|a, b| a.finer_than(b))
        .unwrap_or(contributors[0]);

    if contributors.len() == 1 {
        return representative.clone();
    }

    let mut owners: Vec<usize> = representative.owners.clone();
    for z in &contributors {
        for o in &z.owners {
            if !owners.contains(o) {
                owners.push(*o);
            }
        }
    }

    log::debug!(
        "Merging {} {} zones into zone {} (target size {:.3})",
        contributors.len(),
        representative.kind.label(),
        representative.id,
        representative.target_size
    );

    RefinementZone {
        id: representative.id,
        kind: representative.kind,
        shapes: contributors.iter().flat_map(|z| z.shapes.iter().copied()).collect(),
        target_size: representative.target_size,
        priority: representative.priority,
        owners,
        wind_direction: representative.wind_direction,
        clipped: contributors.iter().any(|z| z.clipped),
    }
}

/// Derives and merges refinement zones for a farm
pub struct ZoneResolver<'a> {
    spec: &'a FarmSpec,
}

impl<'a> ZoneResolver<'a> {
    /// Create a resolver for a farm specification
    #[must_use]
    pub const fn new(spec: &'a FarmSpec) -> Self {
        Self { spec }
    }

    /// Check clearance, derive every zone and merge overlaps
    pub fn resolve(&self) -> MeshResult<Vec<RefinementZone>> {
        check_clearance(self.spec)?;
        let zones = self.derive_zones()?;
        let merged = merge_zones(&zones);
        log::info!(
            "Resolved {} refinement zones ({} before merging)",
            merged.len(),
            zones.len()
        );
        Ok(merged)
    }

    /// Derive every zone without merging
    pub fn derive_zones(&self) -> MeshResult<Vec<RefinementZone>> {
        let mut zones = Vec::new();
        for turbine in &self.spec.turbines {
            self.turbine_zones(turbine, &mut zones)?;
        }
        let base_priority = self.spec.turbines.len();
        for (i, region) in self.spec.custom_regions.iter().enumerate() {
            let id = zones.len();
            zones.push(self.custom_zone(id, base_priority + i, region)?);
        }
        Ok(zones)
    }

    /// Near-field sphere for a turbine
    pub fn near_field_zone(&self, id: usize, turbine: &Turbine) -> MeshResult<RefinementZone> {
        let radius = self.spec.refinement.near_field_factor * turbine.diameter;
        let sphere = Sphere::new(turbine.position, radius).map_err(|e| at_turbine(e, turbine))?;
        Ok(RefinementZone::new(
            id,
            ZoneKind::NearField,
            sphere.into(),
            self.spec.near_field_size(turbine),
            turbine.index,
        )?
        .with_owner(turbine.index))
    }

    /// Wake frustum for a turbine, shortened where it would leave the domain
    ///
    /// Returns `None` when the configured wake has zero length.
    pub fn wake_zone(&self, id: usize, turbine: &Turbine) -> MeshResult<Option<RefinementZone>> {
        let r = &self.spec.refinement;
        let direction = turbine.wake_direction(r.wind_direction);
        let boundary = &self.spec.domain.boundary;

        let mut upstream = r.upstream_length_factor * turbine.diameter;
        let mut downstream = r.wake_length_factor * turbine.diameter;
        if upstream + downstream <= GEOMETRY_EPSILON {
            return Ok(None);
        }

        let mut clipped = false;
        if let Some(exit) = boundary.ray_exit_distance(&turbine.position, &direction) {
            if exit < downstream {
                downstream = exit;
                clipped = true;
            }
        }
        if let Some(exit) = boundary.ray_exit_distance(&turbine.position, &-direction) {
            if exit < upstream {
                upstream = exit;
                clipped = true;
            }
        }
        if clipped {
            log::warn!(
                "Wake of turbine {} clipped at the domain edge (upstream {:.1} m, downstream {:.1} m)",
                turbine.index,
                upstream,
                downstream
            );
        }
        if upstream + downstream <= GEOMETRY_EPSILON {
            return Ok(None);
        }

        // The wake expands from the rotor plane; upstream of it the radius
        // tapers back at the same rate.
        let rotor = turbine.rotor_radius();
        let tan = r.wake_expansion_angle.tan();
        let start = turbine.position - direction * upstream;
        let start_radius = (rotor - upstream * tan).max(rotor * 0.5);
        let end_radius = rotor + downstream * tan;
        let frustum = Frustum::new(start, direction, upstream + downstream, start_radius, end_radius)
            .map_err(|e| at_turbine(e, turbine))?;

        Ok(Some(
            RefinementZone::new(id, ZoneKind::Wake, frustum.into(), self.spec.wake_size(turbine), turbine.index)?
                .with_owner(turbine.index)
                .with_wind_direction(direction)
                .with_clipped(clipped),
        ))
    }

    /// Far-field box around a turbine's near-field and wake zones
    pub fn far_field_zone(
        &self,
        id: usize,
        turbine: &Turbine,
        inner: &[RefinementZone],
        size: f64,
    ) -> MeshResult<Option<RefinementZone>> {
        let Some(bounds) = inner
            .iter()
            .map(RefinementZone::bounding_box)
            .reduce(|a, b| a.union(&b))
        else {
            return Ok(None);
        };
        let grown = bounds.expand(self.spec.refinement.far_field_margin);
        let domain_box = self.spec.domain.boundary.bounding_box();
        let Some(clipped) = grown.intersection(&domain_box) else {
            return Ok(None);
        };
        let cuboid = Cuboid::from_aabb(&clipped).map_err(|e| at_turbine(e, turbine))?;
        Ok(Some(
            RefinementZone::new(id, ZoneKind::FarField, cuboid.into(), size, turbine.index)?
                .with_owner(turbine.index)
                .with_clipped(!domain_box.encloses(&grown)),
        ))
    }

    fn turbine_zones(&self, turbine: &Turbine, zones: &mut Vec<RefinementZone>) -> MeshResult<()> {
        if !self.spec.domain.boundary.contains(&turbine.position) {
            let p = turbine.position;
            return Err(MeshError::degenerate_geometry(
                format!("turbine {}", turbine.index),
                format!("hub ({:.1}, {:.1}, {:.1}) lies outside the domain", p.x, p.y, p.z),
            ));
        }

        let first = zones.len();
        let near = self.near_field_zone(zones.len(), turbine)?;
        log::debug!(
            "Turbine {}: near-field radius {:.2} m, size {:.3} m",
            turbine.index,
            near.shapes[0].characteristic_radius(),
            near.target_size
        );
        zones.push(near);

        if let Some(wake) = self.wake_zone(zones.len(), turbine)? {
            zones.push(wake);
        }

        if let Some(size) = self.spec.far_field_size() {
            if let Some(far) = self.far_field_zone(zones.len(), turbine, &zones[first..], size)? {
                zones.push(far);
            }
        }
        Ok(())
    }

    fn custom_zone(&self, id: usize, priority: usize, region: &CustomRegion) -> MeshResult<RefinementZone> {
        let entity = format!("custom region {}", priority - self.spec.turbines.len());
        let shape: Shape = match region {
            CustomRegion::Box { bounds, .. } => Cuboid::from_aabb(bounds)
                .map_err(|e| rename_entity(e, &entity))?
                .into(),
            CustomRegion::Cylinder {
                center,
                radius,
                z_range,
                ..
            } => Cylinder::vertical(*center, *radius, z_range[0], z_range[1])
                .map_err(|e| rename_entity(e, &entity))?
                .into(),
        };
        RefinementZone::new(id, ZoneKind::Custom, shape, self.spec.custom_size(region), priority)
    }
}

fn rename_entity(err: MeshError, entity: &str) -> MeshError {
    match err {
        MeshError::DegenerateGeometry { message, entity: shape } => {
            MeshError::degenerate_geometry(format!("{entity} ({shape})"), message)
        }
        other => other,
    }
}

fn at_turbine(err: MeshError, turbine: &Turbine) -> MeshError {
    rename_entity(err, &format!("turbine {}", turbine.index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FarmSpecImporter;
    use approx::assert_relative_eq;
    use serde_json::{json, Value};

    fn farm(turbines: Value, refinement: Value) -> FarmSpec {
        FarmSpecImporter::from_value(&json!({
            "turbines": turbines,
            "domain": {
                "boundary": { "x_range": [-1000.0, 1000.0], "y_range": [-1000.0, 1000.0], "height": 600.0 },
                "default_resolution": 50.0
            },
            "refinement": refinement
        }))
        .unwrap()
    }

    fn turbine(x: f64, y: f64, d: f64) -> Value {
        json!({ "position": [x, y], "diameter": d, "hub_height": 90.0 })
    }

    fn sphere_zone(id: usize, x: f64, r: f64, size: f64, priority: usize) -> RefinementZone {
        let s = Sphere::new(Point3::new(x, 0.0, 0.0), r).unwrap();
        RefinementZone::new(id, ZoneKind::NearField, s.into(), size, priority)
            .unwrap()
            .with_owner(priority)
    }

    #[test]
    fn test_near_field_radius_scales_with_diameter() {
        let spec = farm(json!([turbine(0.0, 0.0, 120.0), turbine(500.0, 0.0, 60.0)]), json!({}));
        let resolver = ZoneResolver::new(&spec);
        let big = resolver.near_field_zone(0, &spec.turbines[0]).unwrap();
        let small = resolver.near_field_zone(1, &spec.turbines[1]).unwrap();
        let rb = big.shapes()[0].characteristic_radius();
        let rs = small.shapes()[0].characteristic_radius();
        assert_relative_eq!(rb, 60.0);
        assert_relative_eq!(rs, rb / 2.0);
    }

    #[test]
    fn test_merge_takes_finest_size() {
        let a = sphere_zone(0, 0.0, 10.0, 8.0, 0);
        let b = sphere_zone(1, 15.0, 10.0, 3.0, 1);
        let merged = merge_zones(&[a, b]);
        assert_eq!(merged.len(), 1);
        assert_relative_eq!(merged[0].target_size(), 3.0);
        assert_eq!(merged[0].shapes().len(), 2);
        assert_eq!(merged[0].owner(), Some(1));
        assert_eq!(merged[0].owners(), &[1, 0]);
    }

    #[test]
    fn test_merge_tie_prefers_lower_priority() {
        let a = sphere_zone(7, 0.0, 10.0, 5.0, 2);
        let b = sphere_zone(3, 15.0, 10.0, 5.0, 0);
        let merged = merge_zones(&[a, b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id(), 3);
        assert_eq!(merged[0].priority(), 0);
        assert_eq!(merged[0].owner(), Some(0));
    }

    #[test]
    fn test_disjoint_and_cross_kind_zones_stay_independent() {
        let a = sphere_zone(0, 0.0, 10.0, 5.0, 0);
        let b = sphere_zone(1, 100.0, 10.0, 5.0, 1);
        let s = Sphere::new(Point3::new(5.0, 0.0, 0.0), 10.0).unwrap();
        let custom = RefinementZone::new(2, ZoneKind::Custom, s.into(), 1.0, 2).unwrap();
        let merged = merge_zones(&[a, b, custom]);
        assert_eq!(merged.len(), 3);
        assert!(merged.iter().all(|z| z.shapes().len() == 1));
    }

    #[test]
    fn test_merge_is_transitive_and_order_stable() {
        let zones = vec![
            sphere_zone(0, 0.0, 10.0, 5.0, 0),
            sphere_zone(1, 36.0, 10.0, 5.0, 1),
            sphere_zone(2, 18.0, 10.0, 5.0, 2),
            sphere_zone(3, 200.0, 10.0, 5.0, 3),
        ];
        let merged = merge_zones(&zones);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].owners(), &[0, 1, 2]);
        assert_eq!(merged[1].id(), 3);
        assert_eq!(merge_zones(&zones), merged);
    }

    #[test]
    fn test_clearance_violation_names_both_turbines() {
        let spec = farm(
            json!([turbine(0.0, 0.0, 120.0), turbine(500.0, 0.0, 120.0), turbine(550.0, 0.0, 120.0)]),
            json!({ "clearance_factor": 1.0 }),
        );
        let err = ZoneResolver::new(&spec).resolve().unwrap_err();
        match err {
            MeshError::ClearanceViolation {
                first,
                second,
                distance,
                required,
            } => {
                assert_eq!((first, second), (1, 2));
                assert_relative_eq!(distance, 50.0);
                assert_relative_eq!(required, 120.0);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_wake_follows_wind_and_is_clipped() {
        let spec = farm(
            json!([turbine(800.0, 0.0, 100.0)]),
            json!({ "wake_length_factor": 10.0, "upstream_length_factor": 1.0, "wake_expansion_angle": 0.0 }),
        );
        let resolver = ZoneResolver::new(&spec);
        let wake = resolver.wake_zone(1, &spec.turbines[0]).unwrap().unwrap();
        assert!(wake.is_clipped());
        let Shape::Frustum(f) = wake.shapes()[0] else {
            panic!("wake should be a frustum");
        };
        assert_relative_eq!(f.start().x, 700.0, epsilon = 1e-9);
        assert_relative_eq!(f.end().x, 1000.0, epsilon = 1e-9);
        assert_relative_eq!(wake.wind_direction().unwrap().x, 1.0);
    }

    #[test]
    fn test_wake_from_hub_on_domain_edge_is_clipped() {
        let refinement = json!({ "wake_length_factor": 10.0, "upstream_length_factor": 1.0, "wake_expansion_angle": 0.0 });

        let spec = farm(json!([turbine(1000.0, 0.0, 100.0)]), refinement.clone());
        let wake = ZoneResolver::new(&spec).wake_zone(1, &spec.turbines[0]).unwrap().unwrap();
        assert!(wake.is_clipped());
        let Shape::Frustum(f) = wake.shapes()[0] else {
            panic!("wake should be a frustum");
        };
        assert_relative_eq!(f.start().x, 900.0, epsilon = 1e-9);
        assert_relative_eq!(f.end().x, 1000.0, epsilon = 1e-9);

        let spec = farm(json!([turbine(-1000.0, 0.0, 100.0)]), refinement);
        let wake = ZoneResolver::new(&spec).wake_zone(1, &spec.turbines[0]).unwrap().unwrap();
        assert!(wake.is_clipped());
        let Shape::Frustum(f) = wake.shapes()[0] else {
            panic!("wake should be a frustum");
        };
        assert_relative_eq!(f.start().x, -1000.0, epsilon = 1e-9);
        assert_relative_eq!(f.end().x, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_zones_carried_into_stretched_space() {
        let spec = farm(
            json!([turbine(0.0, 0.0, 100.0)]),
            json!({ "custom": [{ "type": "box", "x_range": [0.0, 50.0], "y_range": [0.0, 50.0], "z_range": [0.0, 150.0], "resolution": 5.0 }] }),
        );
        let stretch = VerticalStretch::new(0.0, 2.0, 50.0).unwrap();
        let zones = ZoneResolver::new(&spec).derive_zones().unwrap();
        let near = zones.iter().find(|z| z.kind() == ZoneKind::NearField).unwrap().stretched(&stretch).unwrap();
        assert_relative_eq!(near.shapes()[0].bounding_box().center().z, 140.0, epsilon = 1e-9);
        let custom = zones.iter().find(|z| z.kind() == ZoneKind::Custom).unwrap().stretched(&stretch).unwrap();
        let b = custom.bounding_box();
        assert_relative_eq!(b.min.z, 0.0);
        assert_relative_eq!(b.max.z, 200.0);
        assert_relative_eq!(custom.target_size(), 5.0);
    }

    #[test]
    fn test_zero_length_wake_is_skipped() {
        let spec = farm(
            json!([turbine(0.0, 0.0, 100.0)]),
            json!({ "wake_length_factor": 0.0, "upstream_length_factor": 0.0 }),
        );
        let zones = ZoneResolver::new(&spec).derive_zones().unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].kind(), ZoneKind::NearField);
    }

    #[test]
    fn test_far_field_boxes_merge_across_turbines() {
        let spec = farm(
            json!([turbine(-300.0, 0.0, 100.0), turbine(300.0, 0.0, 100.0)]),
            json!({ "far_field_resolution": 30.0, "far_field_margin": 100.0, "wake_length_factor": 3.0 }),
        );
        let zones = ZoneResolver::new(&spec).resolve().unwrap();
        let far: Vec<_> = zones.iter().filter(|z| z.kind() == ZoneKind::FarField).collect();
        assert_eq!(far.len(), 1);
        assert_eq!(far[0].owners(), &[0, 1]);
        assert_relative_eq!(far[0].target_size(), 30.0);
    }

    #[test]
    fn test_turbine_outside_domain_fails() {
        let spec = farm(json!([turbine(5000.0, 0.0, 100.0)]), json!({}));
        let err = ZoneResolver::new(&spec).resolve().unwrap_err();
        match err {
            MeshError::DegenerateGeometry { entity, .. } => assert_eq!(entity, "turbine 0"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_custom_regions_become_zones() {
        let spec = farm(
            json!([turbine(0.0, 0.0, 100.0)]),
            json!({ "custom": [
                { "type": "cylinder", "center": [400.0, 400.0], "radius": 50.0, "z_range": [0.0, 100.0], "resolution": 7.0 }
            ] }),
        );
        let zones = ZoneResolver::new(&spec).resolve().unwrap();
        let custom = zones.iter().find(|z| z.kind() == ZoneKind::Custom).unwrap();
        assert_eq!(custom.owner(), None);
        assert_eq!(custom.priority(), 1);
        assert!(custom.contains(&Point3::new(420.0, 400.0, 50.0)));
    }
}
