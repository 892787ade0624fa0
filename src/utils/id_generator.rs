//! Run identifier generation.

use uuid::Uuid;

/// Generates unique run identifiers.
///
/// Kept as a struct so hosts can swap deterministic generators into tests
/// via newtype wrappers; the default draws from UUID v4.
#[derive(Clone, Debug, Default)]
pub struct IdGenerator;

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// A fresh run id, e.g. `run-3f2a9c64d3e14b0f8a3d5d3c9d0f1e2a`.
    #[must_use]
    pub fn generate_run_id(&self) -> String {
        format!("run-{}", Uuid::new_v4().simple())
    }
}
