//! Mesh driver adapter
//!
//! Translates the validated farm (boundary, rotor footprints, size field) into
//! a [`MeshRequest`] for an external [`Mesher`] and relays the outcome. The
//! driver does no meshing of its own. A failed generation is reported to the
//! caller as-is and never retried.
//!
//! With vertical anisotropy the request is built in stretched space (boundary,
//! footprints, zones and size-field queries alike) and the returned mesh is
//! compressed back, so it fills the physical domain with flattened elements
//! near the ground.
//!
//! When a timeout is configured the mesher runs on a worker thread and the
//! driver stops waiting once the timeout expires. The worker cannot be
//! interrupted; meshers that want to stop early should poll
//! [`MeshRequest::is_expired`].

use crate::config::{FarmSpec, Turbine};
use crate::defaults;
use crate::error::{MeshError, MeshResult};
use crate::geometry::{Aabb, Cylinder, DomainBoundary, Primitive, VerticalStretch};
use crate::mesh::Mesh3D;
use crate::size_field::{lattice_node_count, SizeFunction, StretchedSizeField};
use crate::zones::RefinementZone;
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

/// How rotor footprints enter the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FootprintMode {
    /// Rotor disks become tagged internal regions (actuator-disk style)
    #[default]
    Embed,
    /// Rotor disks are cut out of the fluid volume
    Exclude,
}

/// Rotor disk handed to the mesher
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TurbineFootprint {
    /// Turbine index in input order
    pub index: usize,
    /// Rotor disk, a thin cylinder along the wake direction
    pub disk: Cylinder,
}

impl TurbineFootprint {
    /// Rotor disk for a turbine facing the given wake direction
    pub fn from_turbine(turbine: &Turbine, wake_direction: Vector3<f64>) -> MeshResult<Self> {
        let thickness = defaults::ROTOR_DISK_THICKNESS_FACTOR * turbine.diameter;
        let base = turbine.position - wake_direction * (0.5 * thickness);
        let disk = Cylinder::new(base, wake_direction, thickness, turbine.rotor_radius()).map_err(|e| match e {
            MeshError::DegenerateGeometry { message, .. } => {
                MeshError::degenerate_geometry(format!("turbine {} rotor disk", turbine.index), message)
            }
            other => other,
        })?;
        Ok(Self {
            index: turbine.index,
            disk,
        })
    }
}

/// Everything the external mesher receives
#[derive(Clone)]
pub struct MeshRequest {
    /// Domain boundary geometry
    pub boundary: DomainBoundary,
    /// Rotor footprints to embed or exclude
    pub footprints: Vec<TurbineFootprint>,
    /// Whether footprints are embedded or excluded
    pub footprint_mode: FootprintMode,
    /// Evaluable target size
    pub size_field: Arc<dyn SizeFunction>,
    /// Refinement zones, for meshers that accept explicit regions
    pub zones: Vec<RefinementZone>,
    /// Background element size (m)
    pub background_size: f64,
    /// Finest requested element size (m)
    pub finest_size: f64,
    /// Point in time after which the caller has stopped waiting
    pub deadline: Option<Instant>,
}

impl MeshRequest {
    /// Whether the caller's deadline has passed
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// The request as seen from vertically stretched space
    pub fn stretched(self, stretch: &VerticalStretch) -> MeshResult<Self> {
        if stretch.is_identity() {
            return Ok(self);
        }
        let boundary = self.boundary.stretched(stretch)?;
        let footprints = self
            .footprints
            .iter()
            .map(|fp| {
                let z = fp.disk.center().z;
                TurbineFootprint {
                    index: fp.index,
                    disk: fp.disk.translated(&Vector3::new(0.0, 0.0, stretch.stretch_height(z) - z)),
                }
            })
            .collect();
        let zones = self
            .zones
            .iter()
            .map(|z| z.stretched(stretch))
            .collect::<MeshResult<Vec<_>>>()?;
        let size_field: Arc<dyn SizeFunction> = Arc::new(StretchedSizeField::new(self.size_field, *stretch));
        Ok(Self {
            boundary,
            footprints,
            size_field,
            zones,
            ..self
        })
    }
}

impl std::fmt::Debug for MeshRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshRequest")
            .field("footprints", &self.footprints.len())
            .field("footprint_mode", &self.footprint_mode)
            .field("zones", &self.zones.len())
            .field("background_size", &self.background_size)
            .field("finest_size", &self.finest_size)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// External mesh generator
pub trait Mesher: Send + Sync {
    /// Name recorded in the mesh metadata
    fn name(&self) -> &str;

    /// Generate a mesh or report why it could not
    fn generate(&self, request: &MeshRequest) -> MeshResult<Mesh3D>;
}

/// Drives a [`Mesher`] with a validated farm
pub struct MeshDriver {
    mesher: Arc<dyn Mesher>,
    timeout: Option<Duration>,
    footprint_mode: FootprintMode,
    name: String,
}

impl MeshDriver {
    /// Create a driver around a mesher
    pub fn new<M: Mesher + 'static>(mesher: M) -> Self {
        Self::from_arc(Arc::new(mesher))
    }

    /// Create a driver around a shared mesher
    #[must_use]
    pub fn from_arc(mesher: Arc<dyn Mesher>) -> Self {
        Self {
            mesher,
            timeout: None,
            footprint_mode: FootprintMode::default(),
            name: "wind_farm".to_string(),
        }
    }

    /// Abort waiting for the mesher after `timeout`
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Embed or exclude rotor footprints
    #[must_use]
    pub const fn with_footprint_mode(mut self, mode: FootprintMode) -> Self {
        self.footprint_mode = mode;
        self
    }

    /// Name recorded in the mesh metadata
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Configured timeout
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Assemble the request for a farm
    pub fn build_request(
        &self,
        spec: &FarmSpec,
        zones: &[RefinementZone],
        size_field: Arc<dyn SizeFunction>,
    ) -> MeshResult<MeshRequest> {
        let wind = spec.refinement.wind_direction;
        let footprints = spec
            .turbines
            .iter()
            .map(|t| TurbineFootprint::from_turbine(t, t.wake_direction(wind)))
            .collect::<MeshResult<Vec<_>>>()?;
        Ok(MeshRequest {
            boundary: spec.domain.boundary.clone(),
            footprints,
            footprint_mode: self.footprint_mode,
            size_field,
            zones: zones.to_vec(),
            background_size: spec.background_size(),
            finest_size: spec.finest_size(),
            deadline: self.timeout.map(|t| Instant::now() + t),
        })
    }

    /// Build the request, run the mesher and post-process the result
    pub fn generate(
        &self,
        spec: &FarmSpec,
        zones: &[RefinementZone],
        size_field: Arc<dyn SizeFunction>,
    ) -> MeshResult<Mesh3D> {
        let stretch = spec.domain.vertical_stretch()?;
        let request = self.build_request(spec, zones, size_field)?.stretched(&stretch)?;
        let mut mesh = self.run(request)?;
        mesh.apply_vertical_anisotropy(&stretch);
        mesh.metadata
            .generation_params
            .insert("turbines".to_string(), spec.turbines.len().to_string());
        mesh.metadata
            .generation_params
            .insert("global_scale".to_string(), spec.refinement.global_scale.to_string());
        Ok(mesh)
    }

    /// Hand a request to the mesher and relay the outcome
    pub fn run(&self, request: MeshRequest) -> MeshResult<Mesh3D> {
        let started = Instant::now();
        log::info!(
            "Invoking mesher '{}' ({} footprints, finest size {:.3} m)",
            self.mesher.name(),
            request.footprints.len(),
            request.finest_size
        );

        let background_size = request.background_size;
        let finest_size = request.finest_size;
        let mut mesh = match self.timeout {
            None => self.mesher.generate(&request),
            Some(timeout) => self.run_with_timeout(request, timeout),
        }
        .map_err(|e| {
            log::error!("Mesher '{}' failed: {e}", self.mesher.name());
            e
        })?;
        mesh.check_indices()?;

        mesh.metadata.name = self.name.clone();
        mesh.metadata.created_at = chrono::Utc::now().to_rfc3339();
        mesh.metadata.mesher = self.mesher.name().to_string();
        mesh.metadata.background_size = background_size;
        mesh.metadata.finest_size = finest_size;
        mesh.metadata.aspect_ratio = 1.0;
        mesh.metadata
            .generation_params
            .insert("footprint_mode".to_string(), format!("{:?}", self.footprint_mode));

        log::info!(
            "Mesher '{}' produced {} nodes and {} cells in {:.2?}",
            self.mesher.name(),
            mesh.node_count(),
            mesh.element_count(),
            started.elapsed()
        );
        Ok(mesh)
    }

    fn run_with_timeout(&self, request: MeshRequest, timeout: Duration) -> MeshResult<Mesh3D> {
        let (tx, rx) = mpsc::channel();
        let mesher = Arc::clone(&self.mesher);
        thread::Builder::new()
            .name(format!("mesher-{}", mesher.name()))
            .spawn(move || {
                // The receiver is gone once the driver has timed out
                let _ = tx.send(mesher.generate(&request));
            })?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(MeshError::mesh_generation_timeout(timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(MeshError::mesh_generation_failure(
                "mesher thread terminated without a result",
            )),
        }
    }
}

/// Deterministic stand-in for the external mesher
///
/// Fills the domain's bounding box with a uniform lattice at the background
/// size (coarsened to stay under a node cap), splits each lattice cube into
/// six tetrahedra and keeps the cells whose centroid lies inside the domain.
/// Cells near each rotor footprint are grouped as `turbine_<index>`.
#[derive(Debug, Clone, Default)]
pub struct StubMesher {
    delay: Option<Duration>,
    failure: Option<String>,
    max_nodes: Option<usize>,
}

impl StubMesher {
    /// Create a stub mesher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before meshing, to exercise timeouts
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Reject every request with the given message
    #[must_use]
    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Cap on the number of lattice nodes
    #[must_use]
    pub const fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = Some(max_nodes);
        self
    }
}

/// Cube corners by bit (x = 1, y = 2, z = 4) for the six tetrahedra sharing
/// the 0-7 diagonal
const KUHN_TETS: [[usize; 4]; 6] = [
    [0, 1, 3, 7],
    [0, 1, 5, 7],
    [0, 2, 3, 7],
    [0, 2, 6, 7],
    [0, 4, 5, 7],
    [0, 4, 6, 7],
];

impl Mesher for StubMesher {
    fn name(&self) -> &str {
        "stub"
    }

    fn generate(&self, request: &MeshRequest) -> MeshResult<Mesh3D> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if let Some(message) = &self.failure {
            return Err(MeshError::mesh_generation_failure(message.clone()));
        }

        let bounds = request.boundary.bounding_box();
        let max_nodes = self.max_nodes.unwrap_or(defaults::STUB_MESHER_MAX_NODES).max(8);
        let (spacing, dims) = stub_lattice(&bounds, request.background_size, max_nodes)?;
        let node_index = |i: usize, j: usize, k: usize| i + dims[0] * (j + dims[1] * k);

        let mut vertices = Vec::with_capacity(dims.iter().product());
        for k in 0..dims[2] {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    vertices.push(bounds.min + spacing.component_mul(&Vector3::new(i as f64, j as f64, k as f64)));
                }
            }
        }

        let mut cells = Vec::new();
        for k in 0..dims[2] - 1 {
            for j in 0..dims[1] - 1 {
                for i in 0..dims[0] - 1 {
                    let corner = |bits: usize| node_index(i + (bits & 1), j + ((bits >> 1) & 1), k + ((bits >> 2) & 1));
                    for tet in KUHN_TETS {
                        let cell = tet.map(corner);
                        if request.boundary.contains(&centroid(&vertices, &cell)) {
                            cells.push(cell);
                        }
                    }
                }
            }
        }

        let mut regions: HashMap<String, Vec<usize>> = HashMap::new();
        for fp in &request.footprints {
            let reach = fp.disk.radius() + spacing.max();
            let members: Vec<usize> = cells
                .iter()
                .enumerate()
                .filter(|(_, c)| fp.disk.distance_to(&centroid(&vertices, c)) <= reach * 0.5)
                .map(|(n, _)| n)
                .collect();
            regions.insert(format!("turbine_{}", fp.index), members);
        }
        if request.footprint_mode == FootprintMode::Exclude {
            let excluded: HashSet<usize> = regions.values().flatten().copied().collect();
            cells = cells
                .into_iter()
                .enumerate()
                .filter(|(n, _)| !excluded.contains(n))
                .map(|(_, c)| c)
                .collect();
            regions.clear();
        }

        let faces = boundary_faces(&cells);
        Ok(Mesh3D {
            vertices,
            faces,
            cells,
            regions,
            ..Mesh3D::default()
        })
    }
}

fn stub_lattice(bounds: &Aabb, target: f64, max_nodes: usize) -> MeshResult<(Vector3<f64>, [usize; 3])> {
    if !target.is_finite() || target <= 0.0 {
        return Err(MeshError::mesh_generation_failure(format!(
            "background size {target} is not usable"
        )));
    }
    let extents = bounds.extents();
    let mut size = target;
    loop {
        let dims = [
            ((extents.x / size).ceil() as usize).max(1) + 1,
            ((extents.y / size).ceil() as usize).max(1) + 1,
            ((extents.z / size).ceil() as usize).max(1) + 1,
        ];
        if lattice_node_count(&dims).is_some_and(|n| n <= max_nodes) {
            let spacing = Vector3::new(
                extents.x / (dims[0] - 1) as f64,
                extents.y / (dims[1] - 1) as f64,
                extents.z / (dims[2] - 1) as f64,
            );
            return Ok((spacing, dims));
        }
        size *= 1.25;
    }
}

fn centroid(vertices: &[Point3<f64>], cell: &[usize; 4]) -> Point3<f64> {
    let sum = cell.iter().fold(Vector3::zeros(), |acc, &i| acc + vertices[i].coords);
    Point3::from(sum / 4.0)
}

/// Triangles that belong to exactly one cell
fn boundary_faces(cells: &[[usize; 4]]) -> Vec<[usize; 3]> {
    let mut counts: BTreeMap<[usize; 3], ([usize; 3], usize)> = BTreeMap::new();
    for c in cells {
        for face in [[c[0], c[1], c[2]], [c[0], c[1], c[3]], [c[0], c[2], c[3]], [c[1], c[2], c[3]]] {
            let mut key = face;
            key.sort_unstable();
            counts.entry(key).or_insert((face, 0)).1 += 1;
        }
    }
    counts
        .into_values()
        .filter(|(_, n)| *n == 1)
        .map(|(face, _)| face)
        .collect()
}
