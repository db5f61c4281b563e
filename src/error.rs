//! Error handling for the Wind2Mesh pipeline
//!
//! Every stage fails eagerly with the offending entity identified: a turbine
//! index, a zone id or a point coordinate. Validator warnings are not errors
//! and never reach this module.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for Wind2Mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Error taxonomy for the farm-to-mesh pipeline
#[derive(Error, Debug)]
pub enum MeshError {
    /// Malformed shape input (zero radius, zero length, self-intersecting boundary, ...)
    #[error("Degenerate geometry in {entity}: {message}")]
    DegenerateGeometry { entity: String, message: String },

    /// Two turbines closer than the configured minimum clearance
    #[error(
        "Clearance violation: turbines {first} and {second} are {distance:.3} apart, \
         minimum clearance is {required:.3}"
    )]
    ClearanceViolation {
        first: usize,
        second: usize,
        distance: f64,
        required: f64,
    },

    /// Non-positive or non-finite size field value
    #[error("Invalid size field value {value} at {location:?}")]
    InvalidSizeField { location: [f64; 3], value: f64 },

    /// Missing or invalid specification field
    #[error("Configuration error at `{key}`: {message}")]
    Configuration { key: String, message: String },

    /// External mesher exceeded the caller-supplied timeout
    #[error("Mesh generation timed out after {timeout:?}")]
    MeshGenerationTimeout { timeout: Duration },

    /// External mesher rejected the input or failed
    #[error("Mesh generation failed: {message}")]
    MeshGenerationFailure { message: String },

    /// File I/O errors
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// JSON parsing errors
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

impl MeshError {
    /// Create a degenerate geometry error
    pub fn degenerate_geometry(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DegenerateGeometry {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Create a clearance violation between two turbines
    #[must_use]
    pub const fn clearance_violation(first: usize, second: usize, distance: f64, required: f64) -> Self {
        Self::ClearanceViolation {
            first,
            second,
            distance,
            required,
        }
    }

    /// Create an invalid size field error
    #[must_use]
    pub const fn invalid_size_field(location: [f64; 3], value: f64) -> Self {
        Self::InvalidSizeField { location, value }
    }

    /// Create a configuration error naming the offending key
    pub fn configuration(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a missing-key configuration error
    pub fn missing_key(key: impl Into<String>) -> Self {
        Self::configuration(key, "required field is missing")
    }

    /// Create a mesh generation timeout error
    #[must_use]
    pub const fn mesh_generation_timeout(timeout: Duration) -> Self {
        Self::MeshGenerationTimeout { timeout }
    }

    /// Create a mesh generation failure
    pub fn mesh_generation_failure(message: impl Into<String>) -> Self {
        Self::MeshGenerationFailure {
            message: message.into(),
        }
    }

    /// Whether the error came from the external mesher rather than the input
    #[must_use]
    pub const fn is_mesher_error(&self) -> bool {
        matches!(
            self,
            Self::MeshGenerationTimeout { .. } | Self::MeshGenerationFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clearance_message_names_both_turbines() {
        let err = MeshError::clearance_violation(0, 3, 50.0, 120.0);
        let msg = format!("{err}");
        assert!(msg.contains("turbines 0 and 3"));
        assert!(msg.contains("120.000"));
    }

    #[test]
    fn test_configuration_message_names_key() {
        let err = MeshError::missing_key("turbines[1].diameter");
        assert!(format!("{err}").contains("`turbines[1].diameter`"));
    }

    #[test]
    fn test_size_field_message_has_location() {
        let err = MeshError::invalid_size_field([1.0, 2.0, 3.0], -4.0);
        let msg = format!("{err}");
        assert!(msg.contains("-4"));
        assert!(msg.contains("[1.0, 2.0, 3.0]"));
    }

    #[test]
    fn test_mesher_error_classification() {
        assert!(MeshError::mesh_generation_timeout(Duration::from_secs(1)).is_mesher_error());
        assert!(MeshError::mesh_generation_failure("rejected").is_mesher_error());
        assert!(!MeshError::missing_key("domain").is_mesher_error());
    }
}
