//! Farm specification import and resolution
//!
//! The importer accepts a structured configuration tree (a `serde_json::Value`,
//! a JSON string or a JSON file) and resolves it into an immutable
//! [`FarmSpec`]. Every field is deserialised as optional first; resolution
//! then fails with [`MeshError::Configuration`] naming the dotted path of the
//! first missing or invalid key. Unknown fields are ignored.
//!
//! Lengths are converted to metres here, once. Angles are given in degrees
//! and stored in radians.
//!
//! Ground elevation comes either inline (`domain.terrain` with `x`, `y` and
//! one `heights` row per `y`) or from `domain.terrain_path`, a text file of
//! `x y z` samples on a full grid. Relative paths resolve against the
//! directory of the JSON file when importing from one.

use crate::defaults;
use crate::error::{MeshError, MeshResult};
use crate::geometry::{Aabb, DomainBoundary, Terrain, VerticalStretch};
use nalgebra::{Point2, Point3, Vector3};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Length unit of the input coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LengthUnit {
    /// Metres (SI base unit)
    #[default]
    Meters,
    /// Kilometres
    Kilometers,
    /// International feet
    Feet,
}

impl LengthUnit {
    /// Parse a unit label such as `"m"`, `"km"` or `"ft"`
    pub fn parse(label: &str) -> MeshResult<Self> {
        match label.trim().to_lowercase().as_str() {
            "m" | "meter" | "meters" | "metre" | "metres" => Ok(Self::Meters),
            "km" | "kilometer" | "kilometers" | "kilometre" | "kilometres" => Ok(Self::Kilometers),
            "ft" | "foot" | "feet" => Ok(Self::Feet),
            other => Err(MeshError::configuration(
                "units",
                format!("unknown length unit '{other}'"),
            )),
        }
    }

    /// Multiplier converting a value in this unit to metres
    #[must_use]
    pub const fn to_meters(self) -> f64 {
        match self {
            Self::Meters => 1.0,
            Self::Kilometers => 1000.0,
            Self::Feet => 0.3048,
        }
    }
}

/// A single turbine, immutable after load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turbine {
    /// Position in the input list; used as the merge priority
    pub index: usize,
    /// Rotor hub centre (m)
    pub position: Point3<f64>,
    /// Rotor diameter (m)
    pub diameter: f64,
    /// Hub height above the ground under the hub (m)
    pub hub_height: f64,
    /// Yaw offset of the rotor from the wind direction (rad)
    pub yaw: f64,
    /// Near-field target size override for this turbine (m)
    pub resolution: Option<f64>,
}

impl Turbine {
    /// Rotor radius
    #[must_use]
    pub fn rotor_radius(&self) -> f64 {
        0.5 * self.diameter
    }

    /// Height of the lowest blade tip above ground
    #[must_use]
    pub fn tip_clearance(&self) -> f64 {
        self.hub_height - self.rotor_radius()
    }

    /// Horizontal unit vector pointing downstream for the given wind direction
    #[must_use]
    pub fn wake_direction(&self, wind_direction: f64) -> Vector3<f64> {
        let angle = wind_direction + self.yaw;
        Vector3::new(angle.cos(), angle.sin(), 0.0)
    }

    /// Distance between two hub centres
    #[must_use]
    pub fn distance_to(&self, other: &Self) -> f64 {
        (self.position - other.position).norm()
    }
}

/// Domain extents and resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSpec {
    /// Domain boundary (footprint polygon extruded between two heights)
    pub boundary: DomainBoundary,
    /// Background element size (m), before `global_scale`
    pub default_resolution: f64,
    /// Vertical compression ratio applied to the generated mesh
    pub aspect_ratio: f64,
    /// Height band (m) over which the vertical compression applies
    pub aspect_distance: f64,
}

impl DomainSpec {
    /// Map between physical heights and the stretched space handed to the mesher
    pub fn vertical_stretch(&self) -> MeshResult<VerticalStretch> {
        VerticalStretch::new(self.boundary.z_min(), self.aspect_ratio, self.aspect_distance)
    }
}

/// Refinement parameters shared by all turbines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementConfig {
    /// Near-field radius as a multiple of rotor diameter
    pub near_field_factor: f64,
    /// Downstream wake length as a multiple of rotor diameter
    pub wake_length_factor: f64,
    /// Upstream extension of the wake zone as a multiple of rotor diameter
    pub upstream_length_factor: f64,
    /// Wake half-angle of expansion (rad)
    pub wake_expansion_angle: f64,
    /// Direction the wind blows towards, counter-clockwise from +x (rad)
    pub wind_direction: f64,
    /// Outer blend radius as a multiple of a zone's own radius
    pub blend_radius_factor: f64,
    /// Maximum relative size growth per unit distance
    pub gradation_limit: f64,
    /// Minimum turbine spacing as a multiple of rotor diameter
    pub clearance_factor: f64,
    /// Multiplier applied to every resolution
    pub global_scale: f64,
    /// Near-field target size (m), before `global_scale`
    pub near_field_resolution: Option<f64>,
    /// Wake target size (m), before `global_scale`
    pub wake_resolution: Option<f64>,
    /// Far-field transition target size (m); the zone is omitted when unset
    pub far_field_resolution: Option<f64>,
    /// Margin added around each turbine's zones to form its far-field box (m)
    pub far_field_margin: f64,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            near_field_factor: defaults::DEFAULT_NEAR_FIELD_FACTOR,
            wake_length_factor: defaults::DEFAULT_WAKE_LENGTH_FACTOR,
            upstream_length_factor: defaults::DEFAULT_UPSTREAM_LENGTH_FACTOR,
            wake_expansion_angle: defaults::DEFAULT_WAKE_EXPANSION_DEG.to_radians(),
            wind_direction: 0.0,
            blend_radius_factor: defaults::DEFAULT_BLEND_RADIUS_FACTOR,
            gradation_limit: defaults::DEFAULT_GRADATION_LIMIT,
            clearance_factor: defaults::DEFAULT_CLEARANCE_FACTOR,
            global_scale: 1.0,
            near_field_resolution: None,
            wake_resolution: None,
            far_field_resolution: None,
            far_field_margin: 0.0,
        }
    }
}

impl RefinementConfig {
    /// Minimum clearance between two turbines
    #[must_use]
    pub fn clearance_threshold(&self, a: &Turbine, b: &Turbine) -> f64 {
        self.clearance_factor * a.diameter.max(b.diameter)
    }
}

/// User-authored refinement region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CustomRegion {
    /// Axis-aligned box
    Box {
        /// Box extents (m)
        bounds: Aabb,
        /// Target size (m), before `global_scale`
        resolution: f64,
    },
    /// Vertical cylinder
    Cylinder {
        /// Axis position (m)
        center: Point2<f64>,
        /// Radius (m)
        radius: f64,
        /// Bottom and top heights (m)
        z_range: [f64; 2],
        /// Target size (m), before `global_scale`
        resolution: f64,
    },
}

impl CustomRegion {
    /// Target size before `global_scale`
    #[must_use]
    pub const fn resolution(&self) -> f64 {
        match self {
            Self::Box { resolution, .. } | Self::Cylinder { resolution, .. } => *resolution,
        }
    }
}

/// Resolved farm specification, read-only after construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FarmSpec {
    /// Unit the input was given in (all stored values are metres)
    pub units: LengthUnit,
    /// Turbines in input order
    pub turbines: Vec<Turbine>,
    /// Domain boundary and background resolution
    pub domain: DomainSpec,
    /// Refinement parameters
    pub refinement: RefinementConfig,
    /// Additional user-authored refinement regions
    pub custom_regions: Vec<CustomRegion>,
}

impl FarmSpec {
    /// Background element size after `global_scale`
    #[must_use]
    pub fn background_size(&self) -> f64 {
        self.domain.default_resolution * self.refinement.global_scale
    }

    /// Near-field target size for a turbine after `global_scale`
    #[must_use]
    pub fn near_field_size(&self, turbine: &Turbine) -> f64 {
        let base = turbine.resolution.or(self.refinement.near_field_resolution).unwrap_or(
            self.domain.default_resolution * defaults::DEFAULT_NEAR_FIELD_RESOLUTION_RATIO,
        );
        base * self.refinement.global_scale
    }

    /// Wake target size for a turbine after `global_scale`
    #[must_use]
    pub fn wake_size(&self, turbine: &Turbine) -> f64 {
        match turbine.resolution.or(self.refinement.wake_resolution) {
            Some(size) => size * self.refinement.global_scale,
            None => self.near_field_size(turbine),
        }
    }

    /// Far-field target size after `global_scale`, if the zone is enabled
    #[must_use]
    pub fn far_field_size(&self) -> Option<f64> {
        self.refinement
            .far_field_resolution
            .map(|r| r * self.refinement.global_scale)
    }

    /// Target size of a custom region after `global_scale`
    #[must_use]
    pub fn custom_size(&self, region: &CustomRegion) -> f64 {
        region.resolution() * self.refinement.global_scale
    }

    /// Smallest target size requested anywhere
    #[must_use]
    pub fn finest_size(&self) -> f64 {
        let turbine_sizes = self
            .turbines
            .iter()
            .flat_map(|t| [self.near_field_size(t), self.wake_size(t)]);
        let custom_sizes = self.custom_regions.iter().map(|r| self.custom_size(r));
        turbine_sizes
            .chain(custom_sizes)
            .chain(self.far_field_size())
            .fold(self.background_size(), f64::min)
    }
}

/// Farm specification importer
pub struct FarmSpecImporter {
    /// Derive a missing `hub_height` from a 3D position
    infer_hub_height: bool,
    /// Directory that relative `terrain_path` values resolve against
    base_dir: Option<PathBuf>,
}

impl FarmSpecImporter {
    /// Create new importer with default settings
    #[must_use]
    pub const fn new() -> Self {
        Self {
            infer_hub_height: false,
            base_dir: None,
        }
    }

    /// Derive a missing `hub_height` from a 3D position (`z` minus the ground)
    #[must_use]
    pub const fn with_inferred_hub_height(mut self, infer: bool) -> Self {
        self.infer_hub_height = infer;
        self
    }

    /// Resolve relative terrain files against `dir`
    #[must_use]
    pub fn with_base_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    /// Import a farm specification from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> MeshResult<FarmSpec> {
        Self::new().import_from_file(path)
    }

    /// Import a farm specification from a JSON string
    pub fn from_json_str(json: &str) -> MeshResult<FarmSpec> {
        Self::new().import_from_str(json)
    }

    /// Import a farm specification from an already-parsed configuration tree
    pub fn from_value(value: &Value) -> MeshResult<FarmSpec> {
        Self::new().import_value(value)
    }

    /// Import from file with custom importer settings
    pub fn import_from_file<P: AsRef<Path>>(&self, path: P) -> MeshResult<FarmSpec> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&json)?;
        match (&self.base_dir, path.parent()) {
            (None, Some(dir)) => Self {
                infer_hub_height: self.infer_hub_height,
                base_dir: Some(dir.to_path_buf()),
            }
            .import_value(&value),
            _ => self.import_value(&value),
        }
    }

    /// Import from JSON string with custom importer settings
    pub fn import_from_str(&self, json: &str) -> MeshResult<FarmSpec> {
        let value: Value = serde_json::from_str(json)?;
        self.import_value(&value)
    }

    /// Resolve a configuration tree into a farm specification
    pub fn import_value(&self, value: &Value) -> MeshResult<FarmSpec> {
        if !value.is_object() {
            return Err(MeshError::configuration("<root>", "specification must be an object"));
        }

        let units = match value.get("units") {
            None | Some(Value::Null) => LengthUnit::Meters,
            Some(Value::String(label)) => LengthUnit::parse(label)?,
            Some(_) => return Err(MeshError::configuration("units", "expected a string")),
        };
        let scale = units.to_meters();

        let raw_domain: RawDomain = section(value, "domain")?
            .ok_or_else(|| MeshError::missing_key("domain"))?;
        let domain = resolve_domain(raw_domain, scale, self.base_dir.as_deref())?;

        let raw_refinement: RawRefinement = section(value, "refinement")?.unwrap_or_default();
        let (refinement, custom_regions) = resolve_refinement(raw_refinement, scale)?;

        let raw_turbines = match value.get("turbines") {
            None | Some(Value::Null) => return Err(MeshError::missing_key("turbines")),
            Some(Value::Array(items)) => items,
            Some(_) => return Err(MeshError::configuration("turbines", "expected a list")),
        };
        let mut turbines = Vec::with_capacity(raw_turbines.len());
        for (index, item) in raw_turbines.iter().enumerate() {
            let key = format!("turbines[{index}]");
            let raw: RawTurbine = serde_json::from_value(item.clone())
                .map_err(|e| MeshError::configuration(&key, e.to_string()))?;
            turbines.push(self.resolve_turbine(index, raw, &key, scale, &domain)?);
        }

        log::info!(
            "Loaded farm specification: {} turbines, {} custom regions, background size {:.3} m",
            turbines.len(),
            custom_regions.len(),
            domain.default_resolution * refinement.global_scale
        );

        Ok(FarmSpec {
            units,
            turbines,
            domain,
            refinement,
            custom_regions,
        })
    }

    fn resolve_turbine(
        &self,
        index: usize,
        raw: RawTurbine,
        key: &str,
        scale: f64,
        domain: &DomainSpec,
    ) -> MeshResult<Turbine> {
        let position = raw.position.ok_or_else(|| MeshError::missing_key(format!("{key}.position")))?;
        let diameter = positive(raw.diameter, &format!("{key}.diameter"))? * scale;

        let position_key = format!("{key}.position");
        let (x, y, z) = match position.as_slice() {
            [x, y] => (*x, *y, None),
            [x, y, z] => (*x, *y, Some(finite(*z, &position_key)? * scale)),
            other => {
                return Err(MeshError::configuration(
                    position_key,
                    format!("expected 2 or 3 coordinates, got {}", other.len()),
                ))
            }
        };
        let x = finite(x, &position_key)? * scale;
        let y = finite(y, &position_key)? * scale;
        let ground = domain.boundary.ground_height(x, y);

        let hub_height = match (raw.hub_height, z) {
            (Some(h), _) => finite(h, &format!("{key}.hub_height"))? * scale,
            (None, Some(z)) if self.infer_hub_height => z - ground,
            (None, _) => return Err(MeshError::missing_key(format!("{key}.hub_height"))),
        };
        let hub = Point3::new(x, y, z.unwrap_or(ground + hub_height));

        let yaw = finite(raw.yaw.unwrap_or(0.0), &format!("{key}.yaw"))?.to_radians();
        let resolution = raw
            .resolution
            .map(|r| positive(Some(r), &format!("{key}.resolution")).map(|r| r * scale))
            .transpose()?;

        Ok(Turbine {
            index,
            position: hub,
            diameter,
            hub_height,
            yaw,
            resolution,
        })
    }
}

impl Default for FarmSpecImporter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTurbine {
    position: Option<Vec<f64>>,
    diameter: Option<f64>,
    hub_height: Option<f64>,
    yaw: Option<f64>,
    resolution: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawBoundary {
    x_range: Option<[f64; 2]>,
    y_range: Option<[f64; 2]>,
    polygon: Option<Vec<[f64; 2]>>,
    height: Option<f64>,
    z_min: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDomain {
    boundary: Option<RawBoundary>,
    default_resolution: Option<f64>,
    aspect_ratio: Option<f64>,
    aspect_distance: Option<f64>,
    terrain: Option<RawTerrain>,
    terrain_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTerrain {
    x: Option<Vec<f64>>,
    y: Option<Vec<f64>>,
    heights: Option<Vec<Vec<f64>>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRefinement {
    near_field_factor: Option<f64>,
    wake_length_factor: Option<f64>,
    upstream_length_factor: Option<f64>,
    wake_expansion_angle: Option<f64>,
    wind_direction: Option<f64>,
    blend_radius_factor: Option<f64>,
    gradation_limit: Option<f64>,
    clearance_factor: Option<f64>,
    global_scale: Option<f64>,
    near_field_resolution: Option<f64>,
    wake_resolution: Option<f64>,
    far_field_resolution: Option<f64>,
    far_field_margin: Option<f64>,
    custom: Option<Vec<RawCustomRegion>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawCustomRegion {
    #[serde(rename = "type")]
    kind: Option<String>,
    x_range: Option<[f64; 2]>,
    y_range: Option<[f64; 2]>,
    z_range: Option<[f64; 2]>,
    center: Option<[f64; 2]>,
    radius: Option<f64>,
    resolution: Option<f64>,
}

/// Deserialise an optional top-level section, naming it on type errors
fn section<T: DeserializeOwned>(value: &Value, key: &str) -> MeshResult<Option<T>> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| MeshError::configuration(key, e.to_string())),
    }
}

fn finite(value: f64, key: &str) -> MeshResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(MeshError::configuration(key, format!("expected a finite number, got {value}")))
    }
}

fn positive(value: Option<f64>, key: &str) -> MeshResult<f64> {
    let v = value.ok_or_else(|| MeshError::missing_key(key))?;
    if v.is_finite() && v > 0.0 {
        Ok(v)
    } else {
        Err(MeshError::configuration(key, format!("must be positive, got {v}")))
    }
}

fn non_negative(value: Option<f64>, default: f64, key: &str) -> MeshResult<f64> {
    let v = value.unwrap_or(default);
    if v.is_finite() && v >= 0.0 {
        Ok(v)
    } else {
        Err(MeshError::configuration(key, format!("must be non-negative, got {v}")))
    }
}

fn resolve_domain(raw: RawDomain, scale: f64, base_dir: Option<&Path>) -> MeshResult<DomainSpec> {
    let b = raw.boundary.ok_or_else(|| MeshError::missing_key("domain.boundary"))?;
    let height = positive(b.height, "domain.boundary.height")? * scale;
    let z_min = finite(b.z_min.unwrap_or(0.0), "domain.boundary.z_min")? * scale;

    let boundary = if let Some(polygon) = b.polygon {
        let footprint = polygon
            .iter()
            .map(|[x, y]| Point2::new(x * scale, y * scale))
            .collect();
        DomainBoundary::from_polygon(footprint, z_min, z_min + height)?
    } else {
        let x = b.x_range.ok_or_else(|| MeshError::missing_key("domain.boundary.x_range"))?;
        let y = b.y_range.ok_or_else(|| MeshError::missing_key("domain.boundary.y_range"))?;
        DomainBoundary::from_box(
            [x[0] * scale, x[1] * scale],
            [y[0] * scale, y[1] * scale],
            z_min,
            z_min + height,
        )?
    };

    let terrain = match (raw.terrain, raw.terrain_path) {
        (Some(_), Some(_)) => {
            return Err(MeshError::configuration(
                "domain.terrain",
                "give either terrain or terrain_path, not both",
            ))
        }
        (Some(grid), None) => Some(("domain.terrain", resolve_terrain(grid, scale)?)),
        (None, Some(path)) => {
            let path = match base_dir {
                Some(dir) if path.is_relative() => dir.join(path),
                _ => path,
            };
            Some(("domain.terrain_path", load_terrain(&path, scale)?))
        }
        (None, None) => None,
    };
    let boundary = match terrain {
        Some((key, terrain)) => boundary
            .with_terrain(terrain)
            .map_err(|e| MeshError::configuration(key, e.to_string()))?,
        None => boundary,
    };

    let default_resolution = positive(raw.default_resolution, "domain.default_resolution")? * scale;
    let aspect_ratio = positive(Some(raw.aspect_ratio.unwrap_or(1.0)), "domain.aspect_ratio")?;
    let aspect_distance = non_negative(raw.aspect_distance, 0.0, "domain.aspect_distance")? * scale;

    Ok(DomainSpec {
        boundary,
        default_resolution,
        aspect_ratio,
        aspect_distance,
    })
}

fn resolve_terrain(raw: RawTerrain, scale: f64) -> MeshResult<Terrain> {
    let key = "domain.terrain";
    let xs = raw.x.ok_or_else(|| MeshError::missing_key("domain.terrain.x"))?;
    let ys = raw.y.ok_or_else(|| MeshError::missing_key("domain.terrain.y"))?;
    let rows = raw.heights.ok_or_else(|| MeshError::missing_key("domain.terrain.heights"))?;
    if let Some((j, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != xs.len()) {
        return Err(MeshError::configuration(
            format!("{key}.heights[{j}]"),
            format!("expected {} values, got {}", xs.len(), row.len()),
        ));
    }
    let to_meters = |v: Vec<f64>| v.into_iter().map(|x| x * scale).collect::<Vec<_>>();
    Terrain::new(to_meters(xs), to_meters(ys), to_meters(rows.concat()))
        .map_err(|e| MeshError::configuration(key, e.to_string()))
}

/// Read `x y z` samples, one per line; commas also separate, `#` starts a comment
fn load_terrain(path: &Path, scale: f64) -> MeshResult<Terrain> {
    let key = "domain.terrain_path";
    let text = fs::read_to_string(path)
        .map_err(|e| MeshError::configuration(key, format!("cannot read {}: {e}", path.display())))?;
    let mut points = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let data = line.split('#').next().unwrap_or_default();
        let fields: Vec<&str> = data
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|f| !f.is_empty())
            .collect();
        if fields.is_empty() {
            continue;
        }
        let values = fields
            .iter()
            .map(|f| f.parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MeshError::configuration(key, format!("{} line {}: {e}", path.display(), n + 1)))?;
        let [x, y, z] = values.as_slice() else {
            return Err(MeshError::configuration(
                key,
                format!("{} line {}: expected 3 values, got {}", path.display(), n + 1, values.len()),
            ));
        };
        points.push([x * scale, y * scale, z * scale]);
    }
    Terrain::from_points(&points).map_err(|e| MeshError::configuration(key, e.to_string()))
}

fn resolve_refinement(raw: RawRefinement, scale: f64) -> MeshResult<(RefinementConfig, Vec<CustomRegion>)> {
    let d = RefinementConfig::default();
    let or_default = |v: Option<f64>, fallback: f64, key: &str| positive(Some(v.unwrap_or(fallback)), key);

    let blend_radius_factor = or_default(
        raw.blend_radius_factor,
        d.blend_radius_factor,
        "refinement.blend_radius_factor",
    )?;
    if blend_radius_factor <= 1.0 {
        return Err(MeshError::configuration(
            "refinement.blend_radius_factor",
            format!("must be greater than 1, got {blend_radius_factor}"),
        ));
    }

    let wake_expansion_angle = match raw.wake_expansion_angle {
        None => d.wake_expansion_angle,
        Some(deg) => {
            let deg = non_negative(Some(deg), 0.0, "refinement.wake_expansion_angle")?;
            if deg >= 90.0 {
                return Err(MeshError::configuration(
                    "refinement.wake_expansion_angle",
                    format!("must be below 90 degrees, got {deg}"),
                ));
            }
            deg.to_radians()
        }
    };

    let optional_size = |v: Option<f64>, key: &str| v.map(|r| positive(Some(r), key).map(|r| r * scale)).transpose();

    let config = RefinementConfig {
        near_field_factor: or_default(raw.near_field_factor, d.near_field_factor, "refinement.near_field_factor")?,
        wake_length_factor: non_negative(raw.wake_length_factor, d.wake_length_factor, "refinement.wake_length_factor")?,
        upstream_length_factor: non_negative(
            raw.upstream_length_factor,
            d.upstream_length_factor,
            "refinement.upstream_length_factor",
        )?,
        wake_expansion_angle,
        wind_direction: finite(raw.wind_direction.unwrap_or(0.0), "refinement.wind_direction")?.to_radians(),
        blend_radius_factor,
        gradation_limit: or_default(raw.gradation_limit, d.gradation_limit, "refinement.gradation_limit")?,
        clearance_factor: non_negative(raw.clearance_factor, d.clearance_factor, "refinement.clearance_factor")?,
        global_scale: or_default(raw.global_scale, d.global_scale, "refinement.global_scale")?,
        near_field_resolution: optional_size(raw.near_field_resolution, "refinement.near_field_resolution")?,
        wake_resolution: optional_size(raw.wake_resolution, "refinement.wake_resolution")?,
        far_field_resolution: optional_size(raw.far_field_resolution, "refinement.far_field_resolution")?,
        far_field_margin: non_negative(raw.far_field_margin, 0.0, "refinement.far_field_margin")? * scale,
    };

    let custom = raw
        .custom
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, r)| resolve_custom(i, r, scale))
        .collect::<MeshResult<Vec<_>>>()?;

    Ok((config, custom))
}

fn resolve_custom(index: usize, raw: RawCustomRegion, scale: f64) -> MeshResult<CustomRegion> {
    let key = format!("refinement.custom[{index}]");
    let resolution = positive(raw.resolution, &format!("{key}.resolution"))? * scale;
    let z = raw
        .z_range
        .ok_or_else(|| MeshError::missing_key(format!("{key}.z_range")))?;
    let kind = raw.kind.ok_or_else(|| MeshError::missing_key(format!("{key}.type")))?;

    match kind.to_lowercase().as_str() {
        "box" => {
            let x = raw.x_range.ok_or_else(|| MeshError::missing_key(format!("{key}.x_range")))?;
            let y = raw.y_range.ok_or_else(|| MeshError::missing_key(format!("{key}.y_range")))?;
            Ok(CustomRegion::Box {
                bounds: Aabb::new(
                    Point3::new(x[0] * scale, y[0] * scale, z[0] * scale),
                    Point3::new(x[1] * scale, y[1] * scale, z[1] * scale),
                ),
                resolution,
            })
        }
        "cylinder" => {
            let c = raw.center.ok_or_else(|| MeshError::missing_key(format!("{key}.center")))?;
            let radius = positive(raw.radius, &format!("{key}.radius"))? * scale;
            Ok(CustomRegion::Cylinder {
                center: Point2::new(c[0] * scale, c[1] * scale),
                radius,
                z_range: [z[0] * scale, z[1] * scale],
                resolution,
            })
        }
        other => Err(MeshError::configuration(
            format!("{key}.type"),
            format!("unknown region type '{other}', expected 'box' or 'cylinder'"),
        )),
    }
}
