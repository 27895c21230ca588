//! In-process intake registry.

use std::collections::HashMap;

use crate::error::{IntakeError, Result};
use crate::model::IntakeDefinition;

/// Lookup table of intake definitions, loaded once at startup from
/// configuration.
#[derive(Debug, Default)]
pub struct IntakeRegistry {
    intakes: HashMap<String, IntakeDefinition>,
}

impl IntakeRegistry {
    pub fn new(definitions: Vec<IntakeDefinition>) -> Self {
        let intakes = definitions
            .into_iter()
            .map(|def| (def.id.clone(), def))
            .collect();
        Self { intakes }
    }

    pub fn get(&self, intake_id: &str) -> Result<&IntakeDefinition> {
        self.intakes
            .get(intake_id)
            .ok_or_else(|| IntakeError::not_found("intake", intake_id))
    }

    pub fn len(&self) -> usize {
        self.intakes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intakes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let registry = IntakeRegistry::new(vec![IntakeDefinition::new("vendor-onboarding")]);
        assert!(registry.get("vendor-onboarding").is_ok());
        assert!(registry.get("unknown").is_err());
    }
}
