//! Station Identity
//!
//! Id and role are assigned once during setup and never change afterwards.

use crate::LayerError;
use common::types::{StationId, StationRole};
use tracing::debug;

/// Write-once station id and role
#[derive(Debug, Default, Clone)]
pub struct StationIdentity {
    id: Option<StationId>,
    role: Option<StationRole>,
}

impl StationIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_id(&mut self, id: StationId) -> Result<(), LayerError> {
        if let Some(current) = self.id {
            return Err(LayerError::ConfigurationError(format!(
                "station id already set to {}, refusing {}", current, id
            )));
        }
        debug!("Station id set to {}", id);
        self.id = Some(id);
        Ok(())
    }

    pub fn set_role(&mut self, role: StationRole) -> Result<(), LayerError> {
        if let Some(current) = self.role {
            return Err(LayerError::ConfigurationError(format!(
                "station role already set to {:?}, refusing {:?}", current, role
            )));
        }
        debug!("Station role set to {:?}", role);
        self.role = Some(role);
        Ok(())
    }

    pub fn id(&self) -> Result<StationId, LayerError> {
        self.id.ok_or_else(|| LayerError::ConfigurationError("station id not set".into()))
    }

    pub fn role(&self) -> Result<StationRole, LayerError> {
        self.role.ok_or_else(|| LayerError::ConfigurationError("station role not set".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_are_write_once() {
        let mut identity = StationIdentity::new();
        assert!(identity.id().is_err());

        identity.set_id(StationId(1)).unwrap();
        identity.set_role(StationRole::BaseStation).unwrap();
        assert!(matches!(identity.set_id(StationId(2)), Err(LayerError::ConfigurationError(_))));
        assert!(identity.set_role(StationRole::SubscriberStation).is_err());

        assert_eq!(identity.id().unwrap(), StationId(1));
        assert_eq!(identity.role().unwrap(), StationRole::BaseStation);
    }
}
