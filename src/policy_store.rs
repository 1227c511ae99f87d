use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::domain::{DomainError, NetworkIdentity, NetworkPolicy, NetworkTemplate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnoozeKind {
    Warning,
    Limit,
}

/// Templates touched by a whole-set replacement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyDiff {
    pub added: Vec<NetworkTemplate>,
    pub removed: Vec<NetworkTemplate>,
    pub changed: Vec<NetworkTemplate>,
}

impl PolicyDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Active network policies, keyed by template.
#[derive(Debug, Clone, Default)]
pub struct PolicyStore {
    policies: BTreeMap<NetworkTemplate, NetworkPolicy>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_policies(policies: Vec<NetworkPolicy>) -> Result<Self, DomainError> {
        let mut store = Self::new();
        store.set_policies(policies)?;
        Ok(store)
    }

    /// Replaces the whole set. Nothing is applied unless every policy is valid
    /// and templates are unique.
    pub fn set_policies(&mut self, policies: Vec<NetworkPolicy>) -> Result<PolicyDiff, DomainError> {
        let mut next = BTreeMap::new();
        for policy in policies {
            policy.validate()?;
            if next.contains_key(&policy.template) {
                return Err(DomainError::DuplicateTemplate {
                    template: policy.template,
                });
            }
            next.insert(policy.template.clone(), policy);
        }

        let before: BTreeSet<&NetworkTemplate> = self.policies.keys().collect();
        let after: BTreeSet<&NetworkTemplate> = next.keys().collect();

        let diff = PolicyDiff {
            added: after.difference(&before).map(|t| (*t).clone()).collect(),
            removed: before.difference(&after).map(|t| (*t).clone()).collect(),
            changed: after
                .intersection(&before)
                .filter(|t| self.policies.get(**t) != next.get(**t))
                .map(|t| (*t).clone())
                .collect(),
        };

        self.policies = next;
        Ok(diff)
    }

    pub fn get(&self, template: &NetworkTemplate) -> Option<&NetworkPolicy> {
        self.policies.get(template)
    }

    pub fn policies(&self) -> impl Iterator<Item = &NetworkPolicy> {
        self.policies.values()
    }

    pub fn to_vec(&self) -> Vec<NetworkPolicy> {
        self.policies.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn find_matching(&self, identity: &NetworkIdentity) -> Option<&NetworkPolicy> {
        self.policies.values().find(|p| p.template.matches(identity))
    }

    pub fn snooze(
        &mut self,
        template: &NetworkTemplate,
        kind: SnoozeKind,
        now: DateTime<Utc>,
    ) -> Result<NetworkPolicy, DomainError> {
        let policy = self
            .policies
            .get_mut(template)
            .ok_or_else(|| DomainError::MissingPolicy {
                template: template.clone(),
            })?;
        match kind {
            SnoozeKind::Warning => policy.last_warning_snooze = Some(now),
            SnoozeKind::Limit => policy.last_limit_snooze = Some(now),
        }
        Ok(policy.clone())
    }

    /// Inserts or replaces a single policy; returns the previous one.
    pub fn upsert(&mut self, policy: NetworkPolicy) -> Result<Option<NetworkPolicy>, DomainError> {
        policy.validate()?;
        Ok(self.policies.insert(policy.template.clone(), policy))
    }
}
