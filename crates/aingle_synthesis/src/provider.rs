//! System Model providers
//!
//! The engine only ever reads the canonical System Model. New entities it
//! discovers leave as [`EntityProposal`]s handed to a provider, which applies
//! them (or not) through its own explicit call.

use std::sync::RwLock;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::model::{EntityCategory, SystemEntity, SystemModel};
use crate::resolver::EntityProposal;

/// Supplies the canonical System Model and receives proposed additions.
pub trait SystemModelProvider: Send + Sync {
    /// A snapshot of the current canonical model.
    fn system_model(&self) -> Result<SystemModel>;

    /// Receives proposals derived from unresolved entities. Must not apply them.
    fn submit_proposals(&self, proposals: &[EntityProposal]) -> Result<()>;
}

/// In-memory provider that queues proposals until explicitly accepted.
pub struct InMemoryModelProvider {
    model: RwLock<SystemModel>,
    pending: RwLock<Vec<EntityProposal>>,
}

impl InMemoryModelProvider {
    pub fn new(model: SystemModel) -> Self {
        Self {
            model: RwLock::new(model),
            pending: RwLock::new(Vec::new()),
        }
    }

    /// Proposals submitted and not yet accepted or rejected.
    pub fn pending_proposals(&self) -> Result<Vec<EntityProposal>> {
        let pending = self
            .pending
            .read()
            .map_err(|_| Error::Provider("lock poisoned".into()))?;
        Ok(pending.clone())
    }

    /// Applies the pending proposal with the given normalized name as a new entity.
    ///
    /// Proposals without a category become [`EntityCategory::Software`] entities.
    /// Returns `false` if no such proposal is pending.
    ///
    /// # Errors
    ///
    /// [`Error::Provider`] if `entity_id` is already taken.
    pub fn accept_proposal(&self, normalized_name: &str, entity_id: &str) -> Result<bool> {
        let mut pending = self
            .pending
            .write()
            .map_err(|_| Error::Provider("lock poisoned".into()))?;
        let Some(pos) = pending.iter().position(|p| p.normalized_name == normalized_name) else {
            return Ok(false);
        };
        let mut model = self
            .model
            .write()
            .map_err(|_| Error::Provider("lock poisoned".into()))?;
        if model.get(entity_id).is_some() {
            return Err(Error::Provider(format!("entity id '{}' already exists", entity_id)));
        }

        let proposal = pending.remove(pos);
        let category = proposal.category.unwrap_or(EntityCategory::Software);
        info!("Accepted proposal '{}' as entity {}", proposal.name, entity_id);
        model
            .entities
            .push(SystemEntity::new(entity_id, proposal.name, category));
        Ok(true)
    }

    /// Drops a pending proposal.
    pub fn reject_proposal(&self, normalized_name: &str) -> Result<bool> {
        let mut pending = self
            .pending
            .write()
            .map_err(|_| Error::Provider("lock poisoned".into()))?;
        let before = pending.len();
        pending.retain(|p| p.normalized_name != normalized_name);
        Ok(pending.len() != before)
    }
}

impl SystemModelProvider for InMemoryModelProvider {
    fn system_model(&self) -> Result<SystemModel> {
        let model = self
            .model
            .read()
            .map_err(|_| Error::Provider("lock poisoned".into()))?;
        Ok(model.clone())
    }

    fn submit_proposals(&self, proposals: &[EntityProposal]) -> Result<()> {
        let mut pending = self
            .pending
            .write()
            .map_err(|_| Error::Provider("lock poisoned".into()))?;
        for proposal in proposals {
            // resubmission replaces the queued copy
            match pending
                .iter_mut()
                .find(|p| p.normalized_name == proposal.normalized_name)
            {
                Some(existing) => *existing = proposal.clone(),
                None => pending.push(proposal.clone()),
            }
        }
        debug!("{} proposals pending", pending.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(name: &str) -> EntityProposal {
        EntityProposal {
            name: name.to_string(),
            normalized_name: name.to_lowercase(),
            category: None,
            mappings: vec![format!("src/{}", name)],
            best_candidate: None,
        }
    }

    #[test]
    fn test_proposals_are_queued_not_applied() {
        let provider = InMemoryModelProvider::new(SystemModel::default());
        provider.submit_proposals(&[proposal("Billing"), proposal("Billing")]).unwrap();

        assert_eq!(provider.pending_proposals().unwrap().len(), 1);
        assert!(provider.system_model().unwrap().is_empty());
    }

    #[test]
    fn test_accept_proposal() {
        let provider = InMemoryModelProvider::new(SystemModel::default());
        provider.submit_proposals(&[proposal("Billing")]).unwrap();

        assert!(provider.accept_proposal("billing", "ent-billing").unwrap());
        let model = provider.system_model().unwrap();
        assert_eq!(model.get("ent-billing").unwrap().name, "Billing");
        assert_eq!(model.get("ent-billing").unwrap().category, EntityCategory::Software);
        assert!(provider.pending_proposals().unwrap().is_empty());

        assert!(!provider.accept_proposal("billing", "ent-other").unwrap());
    }

    #[test]
    fn test_accept_rejects_taken_id() {
        let model = SystemModel::new(vec![SystemEntity::new(
            "ent-1",
            "Ledger",
            EntityCategory::Software,
        )]);
        let provider = InMemoryModelProvider::new(model);
        provider.submit_proposals(&[proposal("Billing")]).unwrap();
        assert!(provider.accept_proposal("billing", "ent-1").is_err());
        assert_eq!(provider.pending_proposals().unwrap().len(), 1);
    }

    #[test]
    fn test_reject_proposal() {
        let provider = InMemoryModelProvider::new(SystemModel::default());
        provider.submit_proposals(&[proposal("Billing")]).unwrap();
        assert!(provider.reject_proposal("billing").unwrap());
        assert!(!provider.reject_proposal("billing").unwrap());
    }
}
