use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{
    domain::{NetworkPolicy, NetworkState, NetworkTemplate},
    notify::NotificationKind,
    policy_store::PolicyStore,
    service::NetworkPolicyService,
};

/// Quota large enough that the lower layer never trips it, while still
/// counting as "a quota is set".
pub const UNLIMITED_QUOTA_BYTES: u64 = i64::MAX as u64;

/// Usage of one policy since the start of its current cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyUsage {
    pub policy: NetworkPolicy,
    pub cycle_start: DateTime<Utc>,
    pub used_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEvaluation {
    pub template: NetworkTemplate,
    pub used_bytes: u64,
    /// `None` when the policy does not constrain interfaces at all.
    pub quota_bytes: Option<u64>,
    pub data_enabled: bool,
    pub notification: Option<NotificationKind>,
}

pub fn quota_bytes(policy: &NetworkPolicy, used_bytes: u64, cycle_start: DateTime<Utc>) -> Option<u64> {
    let limit = match policy.limit.bytes() {
        Some(limit) => limit,
        None if policy.metered => return Some(UNLIMITED_QUOTA_BYTES),
        None => return None,
    };
    if policy.limit_snoozed(cycle_start) {
        return Some(UNLIMITED_QUOTA_BYTES);
    }
    Some(limit.saturating_sub(used_bytes).max(1))
}

pub fn desired_notification(
    policy: &NetworkPolicy,
    used_bytes: u64,
    cycle_start: DateTime<Utc>,
) -> Option<NotificationKind> {
    if policy.is_over_limit(used_bytes) {
        return Some(if policy.limit_snoozed(cycle_start) {
            NotificationKind::LimitSnoozed
        } else {
            NotificationKind::Limit
        });
    }
    if policy.is_over_warning(used_bytes) && !policy.warning_snoozed(cycle_start) {
        return Some(NotificationKind::Warning);
    }
    None
}

pub fn data_enabled(policy: &NetworkPolicy, used_bytes: u64, cycle_start: DateTime<Utc>) -> bool {
    !(policy.is_over_limit(used_bytes) && !policy.limit_snoozed(cycle_start))
}

pub fn evaluate(usage: &PolicyUsage) -> PolicyEvaluation {
    let PolicyUsage {
        policy,
        cycle_start,
        used_bytes,
        ..
    } = usage;
    PolicyEvaluation {
        template: policy.template.clone(),
        used_bytes: *used_bytes,
        quota_bytes: quota_bytes(policy, *used_bytes, *cycle_start),
        data_enabled: data_enabled(policy, *used_bytes, *cycle_start),
        notification: desired_notification(policy, *used_bytes, *cycle_start),
    }
}

/// Interface -> quota for every connected network under an enforcing policy.
pub fn plan_interface_quotas(
    networks: &[NetworkState],
    store: &PolicyStore,
    evaluations: &BTreeMap<NetworkTemplate, PolicyEvaluation>,
) -> BTreeMap<String, u64> {
    let mut quotas = BTreeMap::new();
    for network in networks {
        let Some(policy) = store.find_matching(&network.identity) else {
            continue;
        };
        let Some(quota) = evaluations
            .get(&policy.template)
            .and_then(|evaluation| evaluation.quota_bytes)
        else {
            continue;
        };
        quotas
            .entry(network.iface.clone())
            .and_modify(|existing: &mut u64| *existing = (*existing).min(quota))
            .or_insert(quota);
    }
    quotas
}

#[derive(Debug, Clone)]
pub struct QuotaHandle {
    shutdown: Arc<tokio::sync::Mutex<Option<tokio::sync::oneshot::Sender<()>>>>,
}

impl QuotaHandle {
    pub async fn shutdown(&self) {
        let tx = self.shutdown.lock().await.take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }
}

/// Re-reads usage on a fixed interval so thresholds are noticed without an
/// explicit stats callback.
pub fn spawn_quota_worker(service: NetworkPolicyService, poll_interval: Duration) -> QuotaHandle {
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = QuotaHandle {
        shutdown: Arc::new(tokio::sync::Mutex::new(Some(shutdown_tx))),
    };

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    debug!("quota tick");
                    service.on_stats_updated().await;
                }
                _ = &mut shutdown_rx => break,
            }
        }
    });

    handle
}
