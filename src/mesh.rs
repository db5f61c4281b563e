//! Volumetric mesh returned by the external mesher
//!
//! The core never tessellates; this is the container a [`crate::driver::Mesher`]
//! fills in, plus the few post-processing steps the pipeline applies to it.

use crate::error::{MeshError, MeshResult};
use crate::geometry::{Aabb, VerticalStretch};
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tetrahedral mesh of the farm domain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mesh3D {
    /// Mesh nodes
    pub vertices: Vec<Point3<f64>>,
    /// Boundary triangles (indices into vertices)
    pub faces: Vec<[usize; 3]>,
    /// Volume elements (indices into vertices)
    pub cells: Vec<[usize; 4]>,
    /// Named cell groups, e.g. `turbine_0` for cells inside a rotor footprint
    pub regions: HashMap<String, Vec<usize>>,
    /// Mesh metadata
    pub metadata: MeshMetadata,
}

/// Metadata for a generated mesh
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshMetadata {
    /// Mesh name
    pub name: String,
    /// Generation timestamp (RFC 3339)
    pub created_at: String,
    /// Name of the mesher that produced the mesh
    pub mesher: String,
    /// Background element size (m)
    pub background_size: f64,
    /// Finest requested element size (m)
    pub finest_size: f64,
    /// Vertical compression ratio applied after generation (1 when none)
    pub aspect_ratio: f64,
    /// Generation parameters
    pub generation_params: HashMap<String, String>,
}

impl Mesh3D {
    /// Create new empty mesh
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of volume elements
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.cells.len()
    }

    /// Check every face and cell refers to an existing node
    pub fn check_indices(&self) -> MeshResult<()> {
        let n = self.vertices.len();
        if let Some((i, face)) = self.faces.iter().enumerate().find(|(_, f)| f.iter().any(|&v| v >= n)) {
            return Err(MeshError::mesh_generation_failure(format!(
                "face {i} references node {face:?} but the mesh has {n} nodes"
            )));
        }
        if let Some((i, cell)) = self.cells.iter().enumerate().find(|(_, c)| c.iter().any(|&v| v >= n)) {
            return Err(MeshError::mesh_generation_failure(format!(
                "cell {i} references node {cell:?} but the mesh has {n} nodes"
            )));
        }
        Ok(())
    }

    /// Total volume of all cells (m³)
    #[must_use]
    pub fn calculate_volume(&self) -> f64 {
        self.cells
            .iter()
            .map(|c| {
                let [a, b, c, d] = c.map(|i| self.vertices[i]);
                ((b - a).dot(&(c - a).cross(&(d - a))) / 6.0).abs()
            })
            .sum()
    }

    /// Total boundary area (m²)
    #[must_use]
    pub fn calculate_surface_area(&self) -> f64 {
        self.faces
            .iter()
            .map(|f| {
                let [a, b, c] = f.map(|i| self.vertices[i]);
                (b - a).cross(&(c - a)).norm() / 2.0
            })
            .sum()
    }

    /// Mesh bounds, `None` for an empty mesh
    #[must_use]
    pub fn bounds(&self) -> Option<Aabb> {
        Aabb::from_points(&self.vertices)
    }

    /// Bring a mesh generated in stretched space back to physical heights
    ///
    /// Elements in the lowest band end up flattened by the stretch ratio.
    /// An identity stretch leaves the mesh untouched.
    pub fn apply_vertical_anisotropy(&mut self, stretch: &VerticalStretch) {
        if stretch.is_identity() {
            return;
        }
        for v in &mut self.vertices {
            v.z = stretch.compress_height(v.z);
        }
        self.metadata.aspect_ratio = stretch.ratio();
        log::info!(
            "Applied vertical anisotropy: ratio {:.3} over the lowest {:.1} m ({} nodes)",
            stretch.ratio(),
            stretch.distance(),
            self.vertices.len()
        );
    }
}
