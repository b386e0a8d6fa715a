use super::types::{Plan, PlanId};
use crate::error::{EngineError, Result};

/// Append-only store of plan versions. A redirected plan is stored as a
/// child of the version it continues; parents always carry smaller ids.
#[derive(Debug, Clone, Default)]
pub struct PlanArena {
    versions: Vec<Plan>,
}

impl PlanArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_root(&mut self, mut plan: Plan) -> PlanId {
        let id = PlanId(self.versions.len());
        plan.id = id;
        plan.parent = None;
        self.versions.push(plan);
        id
    }

    pub fn insert_child(&mut self, parent: PlanId, mut plan: Plan) -> Result<PlanId> {
        if self.get(parent).is_none() {
            return Err(EngineError::PlanInvalid(format!(
                "parent plan {parent} does not exist"
            )));
        }
        let id = PlanId(self.versions.len());
        plan.id = id;
        plan.parent = Some(parent);
        self.versions.push(plan);
        Ok(id)
    }

    pub fn get(&self, id: PlanId) -> Option<&Plan> {
        self.versions.get(id.0)
    }

    /// `id` followed by each ancestor up to the root.
    pub fn lineage(&self, id: PlanId) -> Vec<PlanId> {
        let mut chain = Vec::new();
        let mut cursor = self.get(id).map(|plan| plan.id);
        while let Some(current) = cursor {
            chain.push(current);
            cursor = self
                .get(current)
                .and_then(|plan| plan.parent)
                .filter(|parent| *parent < current);
        }
        chain
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn clear(&mut self) {
        self.versions.clear();
    }
}
