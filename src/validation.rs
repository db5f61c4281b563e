//! Pre-mesh validation of the farm layout, its zones and the size field
//!
//! The validator never fails by itself: it collects [`Finding`]s into an
//! immutable [`ValidationReport`]. Warnings are logged and the pipeline
//! continues; [`ValidationReport::into_result`] turns the first error into the
//! matching [`MeshError`] so the run halts before the mesher is invoked.

use crate::config::FarmSpec;
use crate::defaults;
use crate::error::{MeshError, MeshResult};
use crate::geometry::{Primitive, GEOMETRY_EPSILON};
use crate::size_field::{gradation_between, SizeFunction};
use crate::zones::{clearance_violations, RefinementZone};
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity levels for findings
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Informational only
    Info,
    /// Logged; the run continues
    Warning,
    /// Halts the run before meshing
    Error,
}

/// What a finding is about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FindingKind {
    /// Footprint edges cross each other
    SelfIntersectingBoundary,
    /// Turbine hub outside the domain volume
    TurbineOutsideDomain,
    /// Lower blade tip below the ground under the hub
    RotorBelowGround,
    /// Upper blade tip above the domain ceiling
    RotorAboveDomain,
    /// Turbines closer than the clearance threshold
    ClearanceViolation { distance: f64, required: f64 },
    /// Zone has no volume inside the domain
    ZoneOutsideDomain,
    /// Zone extends past (or was shortened at) the domain edge
    ZoneClipped,
    /// Non-finite or non-positive size sample
    InvalidSizeField { value: f64 },
    /// Adjacent samples grow faster than the gradation limit
    GradationExceeded { value: f64, ratio: f64 },
}

/// Where a finding applies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Location {
    /// Pair of intersecting footprint edges
    BoundaryEdges(usize, usize),
    /// Turbine index
    Turbine(usize),
    /// Turbine indices, lower first
    TurbinePair(usize, usize),
    /// Zone id plus its description
    Zone(usize, String),
    /// Size-field sample position (m)
    Point([f64; 3]),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BoundaryEdges(a, b) => write!(f, "domain boundary edges {a} and {b}"),
            Self::Turbine(i) => write!(f, "turbine {i}"),
            Self::TurbinePair(a, b) => write!(f, "turbines {a} and {b}"),
            Self::Zone(_, name) => write!(f, "{name}"),
            Self::Point(p) => write!(f, "({:.3}, {:.3}, {:.3})", p[0], p[1], p[2]),
        }
    }
}

/// One validation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Which check produced it
    pub kind: FindingKind,
    /// Whether it halts the run
    pub severity: Severity,
    /// Turbine, zone, edge pair or point it refers to
    pub location: Location,
    /// Human-readable detail
    pub message: String,
}

impl Finding {
    fn error(kind: FindingKind, location: Location, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: Severity::Error,
            location,
            message: message.into(),
        }
    }

    fn warning(kind: FindingKind, location: Location, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: Severity::Warning,
            location,
            message: message.into(),
        }
    }

    /// Typed error for this finding
    #[must_use]
    pub fn to_error(&self) -> MeshError {
        match (&self.kind, &self.location) {
            (FindingKind::ClearanceViolation { distance, required }, Location::TurbinePair(a, b)) => {
                MeshError::clearance_violation(*a, *b, *distance, *required)
            }
            (FindingKind::InvalidSizeField { value }, Location::Point(p))
            | (FindingKind::GradationExceeded { value, .. }, Location::Point(p)) => {
                MeshError::invalid_size_field(*p, *value)
            }
            (_, location) => MeshError::degenerate_geometry(location.to_string(), self.message.clone()),
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.severity, self.location, self.message)
    }
}

/// Immutable set of findings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    findings: Vec<Finding>,
}

impl ValidationReport {
    /// Wrap a list of findings
    #[must_use]
    pub const fn new(findings: Vec<Finding>) -> Self {
        Self { findings }
    }

    /// Every finding in check order
    #[must_use]
    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    /// Error-severity findings
    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Error)
    }

    /// Warning-severity findings
    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Warning)
    }

    /// Whether any finding halts the pipeline
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    /// Whether there are no findings at all
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Number of findings of a given kind, ignoring payloads
    #[must_use]
    pub fn count_of(&self, kind: &FindingKind) -> usize {
        self.findings
            .iter()
            .filter(|f| std::mem::discriminant(&f.kind) == std::mem::discriminant(kind))
            .count()
    }

    /// Emit warnings through the `log` facade
    pub fn log_findings(&self) {
        for finding in &self.findings {
            match finding.severity {
                Severity::Error => log::error!("{finding}"),
                Severity::Warning => log::warn!("{finding}"),
                Severity::Info => log::info!("{finding}"),
            }
        }
    }

    /// Fail with the first error, otherwise hand back the report
    pub fn into_result(self) -> MeshResult<Self> {
        if let Some(first) = self.errors().next() {
            return Err(first.to_error());
        }
        Ok(self)
    }
}

/// Validator settings
#[derive(Debug, Clone)]
pub struct ValidationRequirements {
    /// Lattice points per axis used to sample the size field over the domain
    pub samples_per_axis: usize,
    /// Also check each zone's own sample points
    pub sample_zones: bool,
    /// Check relative growth between adjacent lattice points
    pub check_gradation: bool,
    /// Relative slack on the gradation limit for rounding
    pub gradation_tolerance: f64,
}

impl Default for ValidationRequirements {
    fn default() -> Self {
        Self {
            samples_per_axis: defaults::DEFAULT_VALIDATION_SAMPLES_PER_AXIS,
            sample_zones: true,
            check_gradation: true,
            gradation_tolerance: 1e-6,
        }
    }
}

/// Domain validator
pub struct DomainValidator {
    requirements: ValidationRequirements,
}

impl DomainValidator {
    /// Create a validator with default requirements
    #[must_use]
    pub fn new() -> Self {
        Self {
            requirements: ValidationRequirements::default(),
        }
    }

    /// Set validation requirements
    #[must_use]
    pub fn with_requirements(mut self, requirements: ValidationRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Run every check and collect the findings
    pub fn validate<F>(&self, spec: &FarmSpec, zones: &[RefinementZone], field: &F) -> ValidationReport
    where
        F: SizeFunction + ?Sized,
    {
        let mut findings = Vec::new();
        self.check_boundary(spec, &mut findings);
        self.check_turbines(spec, &mut findings);
        self.check_clearance(spec, &mut findings);
        self.check_zones(spec, zones, &mut findings);
        self.check_size_field(spec, zones, field, &mut findings);

        let report = ValidationReport::new(findings);
        log::info!(
            "Validation finished: {} errors, {} warnings",
            report.errors().count(),
            report.warnings().count()
        );
        report
    }

    fn check_boundary(&self, spec: &FarmSpec, findings: &mut Vec<Finding>) {
        for (a, b) in spec.domain.boundary.self_intersections() {
            findings.push(Finding::error(
                FindingKind::SelfIntersectingBoundary,
                Location::BoundaryEdges(a, b),
                "footprint polygon is not simple",
            ));
        }
    }

    fn check_turbines(&self, spec: &FarmSpec, findings: &mut Vec<Finding>) {
        let boundary = &spec.domain.boundary;
        for t in &spec.turbines {
            let location = Location::Turbine(t.index);
            if !boundary.contains(&t.position) {
                findings.push(Finding::error(
                    FindingKind::TurbineOutsideDomain,
                    location,
                    "hub lies outside the domain",
                ));
                continue;
            }
            let ground = boundary.ground_height(t.position.x, t.position.y);
            let lower_tip = t.position.z - t.rotor_radius();
            if lower_tip < ground - GEOMETRY_EPSILON {
                findings.push(Finding::warning(
                    FindingKind::RotorBelowGround,
                    location.clone(),
                    format!("lower blade tip at {lower_tip:.1} m is below the ground at {ground:.1} m"),
                ));
            }
            if t.position.z + t.rotor_radius() > boundary.z_max() + GEOMETRY_EPSILON {
                findings.push(Finding::warning(
                    FindingKind::RotorAboveDomain,
                    location,
                    "upper blade tip reaches above the domain ceiling",
                ));
            }
        }
    }

    fn check_clearance(&self, spec: &FarmSpec, findings: &mut Vec<Finding>) {
        for v in clearance_violations(spec) {
            findings.push(Finding::error(
                FindingKind::ClearanceViolation {
                    distance: v.distance,
                    required: v.required,
                },
                Location::TurbinePair(v.first, v.second),
                format!("{:.3} m apart, {:.3} m required", v.distance, v.required),
            ));
        }
    }

    fn check_zones(&self, spec: &FarmSpec, zones: &[RefinementZone], findings: &mut Vec<Finding>) {
        let boundary = &spec.domain.boundary;
        let domain_box = boundary.bounding_box();
        for zone in zones {
            let bounds = zone.bounding_box();
            let location = Location::Zone(zone.id(), zone.describe());
            let touches_domain = bounds.intersects(&domain_box)
                && zone
                    .shapes()
                    .iter()
                    .flat_map(Primitive::sample_points)
                    .any(|p| boundary.contains(&p));
            if !touches_domain {
                findings.push(Finding::error(
                    FindingKind::ZoneOutsideDomain,
                    location,
                    "zone lies entirely outside the domain",
                ));
            } else if zone.is_clipped() {
                findings.push(Finding::warning(
                    FindingKind::ZoneClipped,
                    location,
                    "zone was shortened at the domain edge",
                ));
            } else if !boundary.encloses(&bounds) {
                findings.push(Finding::warning(
                    FindingKind::ZoneClipped,
                    location,
                    "zone extends past the domain boundary and is clipped by the mesher",
                ));
            }
        }
    }

    fn check_size_field<F>(
        &self,
        spec: &FarmSpec,
        zones: &[RefinementZone],
        field: &F,
        findings: &mut Vec<Finding>,
    ) where
        F: SizeFunction + ?Sized,
    {
        let boundary = &spec.domain.boundary;
        let max_per_axis = ((defaults::MAX_SIZE_FIELD_SAMPLES as f64).cbrt() as usize).max(2);
        let n = self.requirements.samples_per_axis.clamp(2, max_per_axis);
        if n < self.requirements.samples_per_axis {
            log::warn!(
                "Validation lattice reduced from {} to {n} points per axis",
                self.requirements.samples_per_axis
            );
        }
        let bounds = boundary.bounding_box();
        let step = bounds.extents() / (n - 1) as f64;
        let lattice: Vec<Point3<f64>> = (0..n * n * n)
            .map(|idx| {
                let (i, j, k) = (idx % n, (idx / n) % n, idx / (n * n));
                bounds.min + step.component_mul(&Vector3::new(i as f64, j as f64, k as f64))
            })
            .collect();

        let mut samples = lattice.clone();
        if self.requirements.sample_zones {
            for zone in zones {
                for shape in zone.shapes() {
                    samples.extend(shape.sample_points());
                }
            }
        }

        let values: Vec<f64> = samples.par_iter().map(|p| field.size_at(p)).collect();
        let inside: Vec<bool> = samples.par_iter().map(|p| boundary.contains(p)).collect();

        for ((p, v), ok) in samples.iter().zip(&values).zip(&inside) {
            if *ok && !(v.is_finite() && *v > 0.0) {
                findings.push(Finding::error(
                    FindingKind::InvalidSizeField { value: *v },
                    Location::Point([p.x, p.y, p.z]),
                    format!("size {v} is not a positive finite value"),
                ));
            }
        }

        if !self.requirements.check_gradation {
            return;
        }
        let limit = spec.refinement.gradation_limit * (1.0 + self.requirements.gradation_tolerance);
        let index = |i: usize, j: usize, k: usize| i + n * (j + n * k);
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    let a = index(i, j, k);
                    let forward = [
                        (i + 1 < n).then(|| (index(i + 1, j, k), step.x)),
                        (j + 1 < n).then(|| (index(i, j + 1, k), step.y)),
                        (k + 1 < n).then(|| (index(i, j, k + 1), step.z)),
                    ];
                    for (b, h) in forward.into_iter().flatten() {
                        if !(inside[a] && inside[b]) {
                            continue;
                        }
                        let (va, vb) = (values[a], values[b]);
                        if !(va > 0.0 && vb > 0.0 && va.is_finite() && vb.is_finite()) {
                            continue;
                        }
                        let ratio = gradation_between(va, vb, h);
                        if ratio > limit {
                            let (p, v) = if va > vb { (lattice[a], va) } else { (lattice[b], vb) };
                            findings.push(Finding::error(
                                FindingKind::GradationExceeded { value: v, ratio },
                                Location::Point([p.x, p.y, p.z]),
                                format!(
                                    "relative growth {ratio:.4} per m exceeds the limit {:.4}",
                                    spec.refinement.gradation_limit
                                ),
                            ));
                        }
                    }
                }
            }
        }
    }
}

impl Default for DomainValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FarmSpecImporter;
    use crate::geometry::Terrain;
    use crate::size_field::SizeField;
    use crate::zones::ZoneResolver;
    use serde_json::{json, Value};

    fn spec_from(turbines: Value, boundary: Value) -> FarmSpec {
        FarmSpecImporter::from_value(&json!({
            "turbines": turbines,
            "domain": { "boundary": boundary, "default_resolution": 50.0 },
            "refinement": { "wake_length_factor": 3.0, "upstream_length_factor": 1.0 }
        }))
        .unwrap()
    }

    fn square() -> Value {
        json!({ "x_range": [-1000.0, 1000.0], "y_range": [-1000.0, 1000.0], "height": 600.0 })
    }

    fn run(spec: &FarmSpec) -> ValidationReport {
        let zones = ZoneResolver::new(spec).derive_zones().unwrap();
        let field = SizeField::from_spec(spec, zones.clone()).unwrap();
        DomainValidator::new().validate(spec, &zones, &field)
    }

    #[test]
    fn test_clean_layout_has_no_errors() {
        let spec = spec_from(
            json!([{ "position": [0.0, 0.0], "diameter": 100.0, "hub_height": 120.0 }]),
            square(),
        );
        let report = run(&spec);
        assert!(!report.has_errors(), "{:?}", report.findings());
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_wake_clipped_is_a_warning() {
        let spec = spec_from(
            json!([{ "position": [900.0, 0.0], "diameter": 100.0, "hub_height": 120.0 }]),
            square(),
        );
        let report = run(&spec);
        assert!(!report.has_errors());
        assert!(report.count_of(&FindingKind::ZoneClipped) >= 1);
    }

    #[test]
    fn test_low_hub_warns() {
        let spec = spec_from(
            json!([{ "position": [0.0, 0.0], "diameter": 100.0, "hub_height": 40.0 }]),
            square(),
        );
        let report = run(&spec);
        assert_eq!(report.count_of(&FindingKind::RotorBelowGround), 1);
        assert!(!report.has_errors());
    }

    #[test]
    fn test_clearance_cross_check() {
        let spec = spec_from(
            json!([
                { "position": [0.0, 0.0], "diameter": 120.0, "hub_height": 90.0 },
                { "position": [0.0, 50.0], "diameter": 120.0, "hub_height": 90.0 }
            ]),
            square(),
        );
        let zones = Vec::new();
        let field = SizeField::from_spec(&spec, Vec::new()).unwrap();
        let report = DomainValidator::new().validate(&spec, &zones, &field);
        let err = report.into_result().unwrap_err();
        assert!(matches!(err, MeshError::ClearanceViolation { first: 0, second: 1, .. }));
    }

    #[test]
    fn test_self_intersecting_boundary_is_an_error() {
        let bowtie = json!({
            "polygon": [[-1000.0, -1000.0], [1200.0, 1000.0], [1000.0, -1000.0], [-1000.0, 1200.0]],
            "height": 600.0
        });
        let spec = spec_from(
            json!([{ "position": [0.0, -500.0], "diameter": 100.0, "hub_height": 120.0 }]),
            bowtie,
        );
        let report = DomainValidator::new().validate(&spec, &[], &|_: &Point3<f64>| 50.0);
        assert_eq!(report.count_of(&FindingKind::SelfIntersectingBoundary), 1);
        match report.into_result().unwrap_err() {
            MeshError::DegenerateGeometry { entity, .. } => assert!(entity.contains("boundary")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_bad_size_field_is_reported_with_location() {
        let spec = spec_from(
            json!([{ "position": [0.0, 0.0], "diameter": 100.0, "hub_height": 120.0 }]),
            square(),
        );
        let negative = |p: &Point3<f64>| if p.x > 500.0 { -1.0 } else { 50.0 };
        let report = DomainValidator::new().validate(&spec, &[], &negative);
        match report.into_result().unwrap_err() {
            MeshError::InvalidSizeField { location, value } => {
                assert!(location[0] > 500.0);
                assert!(value < 0.0);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_abrupt_size_jump_fails_gradation() {
        let spec = spec_from(
            json!([{ "position": [0.0, 0.0], "diameter": 100.0, "hub_height": 120.0 }]),
            square(),
        );
        let step = |p: &Point3<f64>| if p.x > 0.0 { 500.0 } else { 1.0 };
        let report = DomainValidator::new().validate(&spec, &[], &step);
        assert!(report.count_of(&FindingKind::GradationExceeded { value: 0.0, ratio: 0.0 }) > 0);

        let relaxed = DomainValidator::new().with_requirements(ValidationRequirements {
            check_gradation: false,
            ..ValidationRequirements::default()
        });
        assert!(!relaxed.validate(&spec, &[], &step).has_errors());
    }

    #[test]
    fn test_zone_outside_domain_is_an_error() {
        let spec = FarmSpecImporter::from_value(&json!({
            "turbines": [{ "position": [0.0, 0.0], "diameter": 100.0, "hub_height": 120.0 }],
            "domain": { "boundary": square(), "default_resolution": 50.0 },
            "refinement": {
                "custom": [{
                    "type": "box",
                    "x_range": [5000.0, 5100.0],
                    "y_range": [0.0, 100.0],
                    "z_range": [0.0, 100.0],
                    "resolution": 10.0
                }]
            }
        }))
        .unwrap();
        let report = run(&spec);
        assert!(report.has_errors());
        assert_eq!(report.count_of(&FindingKind::ZoneOutsideDomain), 1);
        match report.into_result().unwrap_err() {
            MeshError::DegenerateGeometry { entity, .. } => assert!(entity.starts_with("custom zone"), "{entity}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_rotor_below_sloping_ground_warns() {
        let mut spec = spec_from(
            json!([
                { "position": [-500.0, 0.0], "diameter": 100.0, "hub_height": 120.0 },
                { "position": [500.0, 0.0], "diameter": 100.0, "hub_height": 120.0 }
            ]),
            square(),
        );
        // Ground rises from 0 m at x = 0 to 200 m at x = 1000 after the hubs were placed
        let hill = Terrain::new(
            vec![-1000.0, 0.0, 1000.0],
            vec![-1000.0, 1000.0],
            vec![0.0, 0.0, 200.0, 0.0, 0.0, 200.0],
        )
        .unwrap();
        spec.domain.boundary = spec.domain.boundary.clone().with_terrain(hill).unwrap();
        let report = DomainValidator::new().validate(&spec, &[], &|_: &Point3<f64>| 50.0);
        let below: Vec<_> = report
            .findings()
            .iter()
            .filter(|f| f.kind == FindingKind::RotorBelowGround)
            .collect();
        assert_eq!(below.len(), 1);
        assert_eq!(below[0].location, Location::Turbine(1));
    }

    #[test]
    fn test_oversized_lattice_is_capped() {
        let spec = spec_from(
            json!([{ "position": [0.0, 0.0], "diameter": 100.0, "hub_height": 120.0 }]),
            square(),
        );
        let validator = DomainValidator::new().with_requirements(ValidationRequirements {
            samples_per_axis: usize::MAX / 2,
            sample_zones: false,
            ..ValidationRequirements::default()
        });
        let report = validator.validate(&spec, &[], &|_: &Point3<f64>| 50.0);
        assert!(!report.has_errors());
    }
}
