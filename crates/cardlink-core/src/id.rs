//! Injectable identifier generation.

use uuid::Uuid;

/// Source of node and session identifiers.
///
/// Injected at node construction so tests can supply deterministic ids.
pub trait IdGenerator: Send + Sync {
    /// Produce a new unique identifier.
    fn generate(&self) -> String;
}

/// Default generator backed by UUID v4.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let generator = UuidIdGenerator;
        assert_ne!(generator.generate(), generator.generate());
    }
}
