//! `Wind2Mesh` - Refinement zones and size fields for wind-farm CFD meshes
//!
//! Turns a declarative wind-farm layout (turbine positions, rotor diameters,
//! domain extents, target resolutions) into the inputs a general-purpose
//! volumetric mesher needs: a domain boundary, rotor footprints, and a
//! spatially varying target element size. Tessellation itself is delegated to
//! an external mesher behind the [`driver::Mesher`] trait.
//!
//! # Architecture
//!
//! The pipeline is a single forward pass:
//!
//! - **config**: farm specification import and unit handling
//! - **geometry**: spheres, cylinders, frustums, boxes and the domain boundary
//! - **zones**: per-turbine near-field, wake and far-field zones, merged across turbines
//! - **size_field**: zone blending with a hard gradation limit
//! - **validation**: pre-mesh checks collected into a report
//! - **driver**: translation to and error relay from the external mesher
//! - **mesh**: the mesh container handed back by the mesher
//!
//! # Examples
//!
//! ## Zones and size field only
//!
//! ```rust,no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use wind2mesh::prelude::*;
//!
//! let spec = FarmSpecImporter::from_json_file("farm.json")?;
//! let zones = ZoneResolver::new(&spec).resolve()?;
//! let field = SizeField::from_spec(&spec, zones)?;
//!
//! let hub = spec.turbines[0].position;
//! println!("target size at the first hub: {:.2} m", field.evaluate(&hub)?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Full pipeline
//!
//! ```rust,no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::time::Duration;
//! use wind2mesh::prelude::*;
//!
//! let config = Wind2MeshConfig {
//!     timeout: Some(Duration::from_secs(600)),
//!     ..Default::default()
//! };
//! let output = Wind2MeshPipeline::new(config, StubMesher::new())
//!     .run_json_file("farm.json")?;
//!
//! for warning in output.report.warnings() {
//!     println!("{warning}");
//! }
//! println!("{} cells", output.mesh.element_count());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod geometry;
pub mod mesh;
pub mod size_field;
pub mod validation;
pub mod zones;

// Re-export commonly used types
pub use config::{FarmSpec, FarmSpecImporter, LengthUnit, RefinementConfig, Turbine};
pub use driver::{FootprintMode, MeshDriver, MeshRequest, Mesher, StubMesher};
pub use error::{MeshError, MeshResult};
pub use geometry::{Aabb, DomainBoundary, Primitive, Shape, Terrain, VerticalStretch};
pub use mesh::{Mesh3D, MeshMetadata};
pub use size_field::{SampledSizeField, SizeField, SizeFunction, StretchedSizeField};
pub use validation::{DomainValidator, ValidationReport, ValidationRequirements};
pub use zones::{RefinementZone, ZoneKind, ZoneResolver};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default pipeline parameters
pub mod defaults {
    /// Near-field radius as a multiple of rotor diameter
    pub const DEFAULT_NEAR_FIELD_FACTOR: f64 = 0.5;

    /// Downstream wake length as a multiple of rotor diameter
    pub const DEFAULT_WAKE_LENGTH_FACTOR: f64 = 10.0;

    /// Upstream extension of the wake zone as a multiple of rotor diameter
    pub const DEFAULT_UPSTREAM_LENGTH_FACTOR: f64 = 2.0;

    /// Wake half-angle of expansion (degrees)
    pub const DEFAULT_WAKE_EXPANSION_DEG: f64 = 5.0;

    /// Outer blend radius as a multiple of a zone's own radius
    pub const DEFAULT_BLEND_RADIUS_FACTOR: f64 = 2.0;

    /// Maximum relative size growth per metre
    pub const DEFAULT_GRADATION_LIMIT: f64 = 0.2;

    /// Minimum turbine spacing as a multiple of rotor diameter
    pub const DEFAULT_CLEARANCE_FACTOR: f64 = 1.0;

    /// Near-field size as a fraction of the background size when none is given
    pub const DEFAULT_NEAR_FIELD_RESOLUTION_RATIO: f64 = 0.25;

    /// Upper bound on lattice nodes in a sampled size field
    pub const MAX_SIZE_FIELD_SAMPLES: usize = 1_000_000;

    /// Lattice points per axis the validator uses to sample the size field
    pub const DEFAULT_VALIDATION_SAMPLES_PER_AXIS: usize = 16;

    /// Rotor disk thickness as a multiple of rotor diameter
    pub const ROTOR_DISK_THICKNESS_FACTOR: f64 = 0.05;

    /// Node cap for the stub mesher
    pub const STUB_MESHER_MAX_NODES: usize = 50_000;
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Aabb, DomainBoundary, DomainValidator, FarmSpec, FarmSpecImporter, FootprintMode, LengthUnit, Mesh3D,
        MeshDriver, MeshError, MeshMetadata, MeshRequest, MeshResult, Mesher, PipelineOutput, Primitive,
        RefinementConfig, RefinementZone, SampledSizeField, Shape, SizeField, SizeFunction, StretchedSizeField,
        StubMesher, Terrain, Turbine, ValidationReport, ValidationRequirements, VerticalStretch, Wind2MeshConfig,
        Wind2MeshPipeline, ZoneKind, ZoneResolver,
    };

    pub use crate::defaults::*;
}

/// Configuration for the whole pipeline
#[derive(Debug, Clone)]
pub struct Wind2MeshConfig {
    /// Name recorded in the mesh metadata
    pub name: String,
    /// Stop waiting for the mesher after this long
    pub timeout: Option<Duration>,
    /// Embed or exclude rotor footprints
    pub footprint_mode: FootprintMode,
    /// Hand the mesher a lattice-sampled field instead of the closed form
    pub sampled_field: bool,
    /// Lattice spacing for the sampled field; defaults to the finest size
    pub sample_spacing: Option<f64>,
    /// Validator settings
    pub validation: ValidationRequirements,
}

impl Default for Wind2MeshConfig {
    fn default() -> Self {
        Self {
            name: "wind_farm".to_string(),
            timeout: None,
            footprint_mode: FootprintMode::Embed,
            sampled_field: false,
            sample_spacing: None,
            validation: ValidationRequirements::default(),
        }
    }
}

/// Zones, size field and validation report, ready for a mesher
pub struct PreparedFarm {
    /// Merged refinement zones
    pub zones: Vec<RefinementZone>,
    /// Field handed to the mesher
    pub size_field: Arc<dyn SizeFunction>,
    /// Validator findings (warnings only; errors abort preparation)
    pub report: ValidationReport,
}

/// Result of a successful run
pub struct PipelineOutput {
    /// Generated mesh
    pub mesh: Mesh3D,
    /// Merged refinement zones
    pub zones: Vec<RefinementZone>,
    /// Validator warnings reported alongside the mesh
    pub report: ValidationReport,
}

/// Main `Wind2Mesh` pipeline for the complete workflow
pub struct Wind2MeshPipeline {
    config: Wind2MeshConfig,
    driver: MeshDriver,
}

impl Wind2MeshPipeline {
    /// Create new pipeline around a mesher
    pub fn new<M: Mesher + 'static>(config: Wind2MeshConfig, mesher: M) -> Self {
        let mut driver = MeshDriver::new(mesher)
            .with_footprint_mode(config.footprint_mode)
            .with_name(config.name.clone());
        if let Some(timeout) = config.timeout {
            driver = driver.with_timeout(timeout);
        }
        Self { config, driver }
    }

    /// Pipeline configuration
    #[must_use]
    pub const fn config(&self) -> &Wind2MeshConfig {
        &self.config
    }

    /// Resolve zones, build the size field and validate, without meshing
    pub fn prepare(&self, spec: &FarmSpec) -> MeshResult<PreparedFarm> {
        let zones = ZoneResolver::new(spec).resolve()?;
        let closed_form = SizeField::from_spec(spec, zones.clone())?;

        let size_field: Arc<dyn SizeFunction> = if self.config.sampled_field {
            let spacing = self.config.sample_spacing.unwrap_or_else(|| closed_form.min_size());
            let bounds = spec.domain.boundary.bounding_box();
            Arc::new(SampledSizeField::from_size_field(&closed_form, &bounds, spacing)?)
        } else {
            Arc::new(closed_form)
        };

        let report = DomainValidator::new()
            .with_requirements(self.config.validation.clone())
            .validate(spec, &zones, size_field.as_ref());
        report.log_findings();
        let report = report.into_result()?;

        Ok(PreparedFarm {
            zones,
            size_field,
            report,
        })
    }

    /// Run every stage and mesh the farm
    pub fn run(&self, spec: &FarmSpec) -> MeshResult<PipelineOutput> {
        let PreparedFarm {
            zones,
            size_field,
            report,
        } = self.prepare(spec)?;
        let mesh = self.driver.generate(spec, &zones, size_field)?;
        Ok(PipelineOutput { mesh, zones, report })
    }

    /// Load a JSON farm specification and run the pipeline
    pub fn run_json_file<P: AsRef<Path>>(&self, path: P) -> MeshResult<PipelineOutput> {
        let spec = FarmSpecImporter::from_json_file(path)?;
        self.run(&spec)
    }

    /// Run the pipeline on an already-parsed configuration tree
    pub fn run_value(&self, value: &serde_json::Value) -> MeshResult<PipelineOutput> {
        let spec = FarmSpecImporter::from_value(value)?;
        self.run(&spec)
    }
}

/// Quick-start functions for common use cases
pub mod quickstart {
    use super::{PipelineOutput, PreparedFarm, Wind2MeshConfig, Wind2MeshPipeline};
    use crate::config::FarmSpecImporter;
    use crate::driver::{Mesher, StubMesher};
    use crate::error::MeshResult;
    use std::path::Path;

    /// Zones, size field and warnings for a JSON farm specification
    pub fn prepare_farm<P: AsRef<Path>>(farm_json: P) -> MeshResult<PreparedFarm> {
        let spec = FarmSpecImporter::from_json_file(farm_json)?;
        Wind2MeshPipeline::new(Wind2MeshConfig::default(), StubMesher::new()).prepare(&spec)
    }

    /// Mesh a JSON farm specification with the given mesher and default settings
    pub fn mesh_farm<P: AsRef<Path>, M: Mesher + 'static>(farm_json: P, mesher: M) -> MeshResult<PipelineOutput> {
        Wind2MeshPipeline::new(Wind2MeshConfig::default(), mesher).run_json_file(farm_json)
    }
}
