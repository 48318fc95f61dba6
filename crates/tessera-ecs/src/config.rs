//! World configuration.

use serde::{Deserialize, Serialize};

use crate::EcsError;

/// Tunables of a [`World`](crate::world::World).
///
/// Loadable from JSON; missing fields take their defaults.
///
/// ```
/// use tessera_ecs::config::WorldConfig;
///
/// let config = WorldConfig::from_json(r#"{ "entity_capacity": 4096 }"#).unwrap();
/// assert_eq!(config.entity_capacity, 4096);
/// assert!(config.check_constraints);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Log relationship constraint violations instead of failing.
    pub soft_asserts: bool,
    /// Validate relationship constraints when pair records are created.
    pub check_constraints: bool,
    /// Entities to reserve room for up front.
    pub entity_capacity: usize,
    /// Tables to reserve room for up front.
    pub table_capacity: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            soft_asserts: cfg!(feature = "soft-assert"),
            check_constraints: true,
            entity_capacity: 1024,
            table_capacity: 64,
        }
    }
}

impl WorldConfig {
    pub fn from_json(json: &str) -> Result<Self, EcsError> {
        serde_json::from_str(json).map_err(|e| EcsError::InvalidParameter {
            reason: format!("invalid world config: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = WorldConfig::from_json("{}").unwrap();
        assert_eq!(config, WorldConfig::default());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(WorldConfig::from_json("{ nope").is_err());
    }

    #[test]
    fn roundtrips_through_json() {
        let config = WorldConfig {
            soft_asserts: true,
            check_constraints: false,
            entity_capacity: 8,
            table_capacity: 2,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(WorldConfig::from_json(&json).unwrap(), config);
    }
}
