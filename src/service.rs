use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write as _,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{
    carrier::{PlatformDefaults, build_default_mobile_policy, reconcile_policy},
    cycle::last_cycle_boundary,
    domain::{DomainError, NetworkPolicy, NetworkState, NetworkTemplate},
    net::Collaborators,
    notify::{
        ListenerFanout, ListenerId, NotificationAction, NotificationDispatcher,
        NotificationRequest, PolicyEvent, PolicyListener,
    },
    policy_store::{PolicyDiff, PolicyStore, SnoozeKind},
    proc_state::{
        DEFAULT_PROC_STATE_HISTORY_SIZE, ForegroundTracker, ProcStateSeqHistory, ProcessState,
    },
    quota::{PolicyEvaluation, PolicyUsage, evaluate, plan_interface_quotas},
    restrict_background::{LowPowerState, RestrictBackgroundState},
    state::PersistedPolicies,
    uid_policy::{UidPolicy, UidPolicyRegistry, app_id},
};

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub defaults: PlatformDefaults,
    pub proc_state_history_size: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            defaults: PlatformDefaults::default(),
            proc_state_history_size: DEFAULT_PROC_STATE_HISTORY_SIZE,
        }
    }
}

struct Inner {
    store: PolicyStore,
    uid_policies: UidPolicyRegistry,
    restrict_background: RestrictBackgroundState,
    foreground: ForegroundTracker,
    history: ProcStateSeqHistory,
    networks: Vec<NetworkState>,
    metered_ifaces: BTreeSet<String>,
    data_enabled: BTreeMap<NetworkTemplate, bool>,
    notifications: NotificationDispatcher,
    defaults: PlatformDefaults,
}

impl Inner {
    fn snapshot(&self) -> PersistedPolicies {
        PersistedPolicies {
            restrict_background: self.restrict_background.enabled(),
            network_policies: self.store.to_vec(),
            uid_policies: self.uid_policies.to_raw_entries(),
            ..PersistedPolicies::empty()
        }
    }
}

struct Shared {
    state: Mutex<Inner>,
    /// Held for a whole rules update so usage reads land in the order they were taken.
    rules: Mutex<()>,
    listeners: std::sync::Mutex<ListenerFanout>,
}

impl Shared {
    fn listeners(&self) -> std::sync::MutexGuard<'_, ListenerFanout> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, event: PolicyEvent) {
        let delivered = self.listeners().dispatch(&event);
        debug!(?event, delivered, "policy event");
    }
}

/// Work that touches collaborators or listeners. Planned under the state lock,
/// applied by the effect worker with the lock released.
#[derive(Debug)]
enum Effect {
    SetQuota { iface: String, quota_bytes: u64 },
    RemoveQuota { iface: String },
    TemplateDataEnabled { template: NetworkTemplate, enabled: bool },
    Notification(NotificationAction),
    RestrictBackground { enabled: bool },
    /// Startup push: broadcast only when on, no listener event.
    SyncDataSaver { enabled: bool },
    AppRestrictBackgroundChanged { uid: u32 },
    Event(PolicyEvent),
    Persist(PersistedPolicies),
}

#[derive(Debug)]
struct EffectBatch {
    effects: Vec<Effect>,
    applied: oneshot::Sender<()>,
}

/// Completion of a submitted batch.
#[must_use]
struct Applied(Option<oneshot::Receiver<()>>);

impl Applied {
    async fn wait(self) {
        if let Some(rx) = self.0 {
            let _ = rx.await;
        }
    }
}

#[derive(Debug)]
enum UidEvent {
    StateChanged {
        uid: u32,
        state: ProcessState,
        seq: u64,
    },
    Gone {
        uid: u32,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct NetworkPolicyService {
    shared: Arc<Shared>,
    deps: Collaborators,
    uid_events: mpsc::UnboundedSender<UidEvent>,
    effects: mpsc::UnboundedSender<EffectBatch>,
}

impl NetworkPolicyService {
    /// Builds the engine from persisted state and spawns the process-state and
    /// effect workers. Must be called inside a tokio runtime.
    pub fn start(
        deps: Collaborators,
        persisted: PersistedPolicies,
        options: ServiceOptions,
    ) -> Result<Self, DomainError> {
        let inner = Inner {
            store: PolicyStore::from_policies(persisted.network_policies)?,
            uid_policies: UidPolicyRegistry::from_raw_entries(&persisted.uid_policies),
            restrict_background: RestrictBackgroundState::new(persisted.restrict_background),
            foreground: ForegroundTracker::new(),
            history: ProcStateSeqHistory::new(options.proc_state_history_size),
            networks: Vec::new(),
            metered_ifaces: BTreeSet::new(),
            data_enabled: BTreeMap::new(),
            notifications: NotificationDispatcher::new(),
            defaults: options.defaults,
        };
        let shared = Arc::new(Shared {
            state: Mutex::new(inner),
            rules: Mutex::new(()),
            listeners: std::sync::Mutex::new(ListenerFanout::new()),
        });

        let (uid_events, uid_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_uid_worker(shared.clone(), deps.clone(), uid_rx));
        let (effects, effect_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_effect_worker(shared.clone(), deps.clone(), effect_rx));

        Ok(Self {
            shared,
            deps,
            uid_events,
            effects,
        })
    }

    pub fn register_listener(&self) -> PolicyListener {
        self.shared.listeners().register()
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners().unregister(id)
    }

    pub fn uid_observer(&self) -> UidObserver {
        UidObserver {
            tx: self.uid_events.clone(),
        }
    }

    /// Pushes the loaded data-saver state and applies network rules once.
    pub async fn system_ready(&self) {
        let applied = {
            let inner = self.shared.state.lock().await;
            let enabled = inner.restrict_background.enabled();
            info!(restrict_background = enabled, "system ready");
            self.submit(vec![Effect::SyncDataSaver { enabled }])
        };
        applied.wait().await;
        self.update_network_rules().await;
    }

    pub async fn set_uid_policy(&self, uid: u32, policy: UidPolicy) -> Result<(), DomainError> {
        let applied = {
            let mut inner = self.shared.state.lock().await;
            let restrict = inner.restrict_background.enabled();
            let Some(change) = inner.uid_policies.set(uid, policy, restrict)? else {
                return Ok(());
            };
            info!(
                uid,
                old = %change.old.describe(),
                new = %change.new.describe(),
                "uid policy changed"
            );

            let mut effects = vec![Effect::Event(PolicyEvent::UidPoliciesChanged {
                app_id: app_id(uid),
                policy,
            })];
            if change.notify_app {
                effects.push(Effect::AppRestrictBackgroundChanged { uid });
            }
            effects.push(Effect::Persist(inner.snapshot()));
            self.submit(effects)
        };
        applied.wait().await;
        Ok(())
    }

    pub async fn get_uid_policy(&self, uid: u32) -> UidPolicy {
        self.shared.state.lock().await.uid_policies.get(uid)
    }

    pub async fn get_uids_with_policy(&self, flag: UidPolicy) -> Vec<u32> {
        self.shared
            .state
            .lock()
            .await
            .uid_policies
            .uids_with_policy(flag)
    }

    /// Whether `uid` is denied metered data while in the background.
    /// Foreground UIDs are never blocked.
    pub async fn is_uid_blocked(&self, uid: u32) -> bool {
        let inner = self.shared.state.lock().await;
        inner.uid_policies.is_blocked(
            uid,
            inner.restrict_background.enabled(),
            inner.foreground.is_foreground(uid),
        )
    }

    pub async fn is_uid_foreground(&self, uid: u32) -> bool {
        self.shared.state.lock().await.foreground.is_foreground(uid)
    }

    pub async fn get_restrict_background(&self) -> bool {
        self.shared.state.lock().await.restrict_background.enabled()
    }

    pub async fn set_restrict_background(&self, enabled: bool) {
        let applied = {
            let mut inner = self.shared.state.lock().await;
            match inner.restrict_background.set_manual(enabled) {
                Some(enabled) => {
                    info!(enabled, "restrict background set");
                    self.submit(vec![
                        Effect::RestrictBackground { enabled },
                        Effect::Persist(inner.snapshot()),
                    ])
                }
                None => {
                    debug!(enabled, "restrict background unchanged");
                    return;
                }
            }
        };
        applied.wait().await;
    }

    pub async fn update_restrict_background_by_low_power_mode(&self, low_power: LowPowerState) {
        let applied = {
            let mut inner = self.shared.state.lock().await;
            match inner.restrict_background.on_low_power_changed(low_power) {
                Some(enabled) => {
                    info!(
                        enabled,
                        low_power = low_power.global_battery_saver_enabled,
                        "restrict background changed by low power mode"
                    );
                    self.submit(vec![
                        Effect::RestrictBackground { enabled },
                        Effect::Persist(inner.snapshot()),
                    ])
                }
                None => return,
            }
        };
        applied.wait().await;
    }

    pub async fn get_network_policies(&self) -> Vec<NetworkPolicy> {
        self.shared.state.lock().await.store.to_vec()
    }

    pub async fn set_network_policies(
        &self,
        policies: Vec<NetworkPolicy>,
    ) -> Result<PolicyDiff, DomainError> {
        let (diff, applied) = {
            let mut inner = self.shared.state.lock().await;
            let diff = inner.store.set_policies(policies)?;
            info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                changed = diff.changed.len(),
                "network policies replaced"
            );
            for template in &diff.removed {
                inner.data_enabled.remove(template);
            }
            (diff, self.submit(vec![Effect::Persist(inner.snapshot())]))
        };
        applied.wait().await;
        self.update_network_rules().await;
        Ok(diff)
    }

    pub async fn snooze_policy(
        &self,
        template: &NetworkTemplate,
        kind: SnoozeKind,
    ) -> Result<(), DomainError> {
        let now = self.deps.clock.now();
        let applied = {
            let mut inner = self.shared.state.lock().await;
            inner.store.snooze(template, kind, now)?;
            info!(%template, ?kind, "policy snoozed");
            self.submit(vec![Effect::Persist(inner.snapshot())])
        };
        applied.wait().await;
        self.update_network_rules().await;
        Ok(())
    }

    pub async fn snooze_limit(&self, template: &NetworkTemplate) -> Result<(), DomainError> {
        self.snooze_policy(template, SnoozeKind::Limit).await
    }

    pub async fn snooze_warning(&self, template: &NetworkTemplate) -> Result<(), DomainError> {
        self.snooze_policy(template, SnoozeKind::Warning).await
    }

    pub async fn on_connectivity_changed(&self, networks: Vec<NetworkState>) {
        {
            let mut inner = self.shared.state.lock().await;
            debug!(count = networks.len(), "connectivity changed");
            inner.networks = networks;
        }
        self.update_network_rules().await;
    }

    pub async fn on_limit_reached(&self, iface: &str) {
        info!(iface, "limit reached");
        self.update_network_rules().await;
    }

    pub async fn on_stats_updated(&self) {
        self.update_network_rules().await;
    }

    /// Applies the carrier config of `sub_id` to its inferred mobile policy,
    /// creating the default policy first if none exists.
    pub async fn on_carrier_config_changed(&self, sub_id: i32) {
        let Some(subscriber_id) = self.deps.carrier.subscriber_id(sub_id) else {
            warn!(sub_id, "carrier config changed for unknown subscription");
            return;
        };
        let config = self.deps.carrier.config_for_subscription(sub_id);
        let now = self.deps.clock.now();

        let applied = {
            let mut inner = self.shared.state.lock().await;
            let template = NetworkTemplate::mobile(subscriber_id.as_str());
            let (current, created) = match inner.store.get(&template) {
                Some(policy) => (policy.clone(), false),
                None => (
                    build_default_mobile_policy(&subscriber_id, now, &inner.defaults),
                    true,
                ),
            };

            let next = match reconcile_policy(&current, config.as_ref(), &inner.defaults) {
                Some(updated) => Some(updated),
                None if created => Some(current),
                None => None,
            };
            let Some(next) = next else {
                debug!(sub_id, %template, "carrier config left policy unchanged");
                return;
            };

            info!(sub_id, created, policy = %next, "carrier config applied");
            if let Err(err) = inner.store.upsert(next) {
                warn!(sub_id, %err, "carrier config produced invalid policy");
                return;
            }
            self.submit(vec![Effect::Persist(inner.snapshot())])
        };
        applied.wait().await;
        self.update_network_rules().await;
    }

    pub async fn snapshot(&self) -> PersistedPolicies {
        self.shared.state.lock().await.snapshot()
    }

    pub async fn dump(&self) -> String {
        let inner = self.shared.state.lock().await;
        let mut out = String::new();

        let _ = writeln!(
            out,
            "Restrict background: {}",
            inner.restrict_background.enabled()
        );
        let _ = writeln!(
            out,
            "Restrict background (low power mode): {}",
            inner.restrict_background.low_power_active()
        );
        let _ = writeln!(
            out,
            "Restrict background changed in low power mode: {}",
            inner.restrict_background.changed_during_low_power()
        );

        let _ = writeln!(out, "Network policies:");
        for policy in inner.store.policies() {
            let _ = writeln!(out, "  {policy}");
        }

        let ifaces: Vec<&str> = inner.metered_ifaces.iter().map(String::as_str).collect();
        let _ = writeln!(out, "Metered ifaces: {ifaces:?}");

        let _ = writeln!(out, "Policy for UIDs:");
        for (uid, policy) in inner.uid_policies.entries() {
            let _ = writeln!(out, "  UID={uid} policy={}", policy.describe());
        }
        let _ = writeln!(
            out,
            "Restrict background whitelist: {:?}",
            inner.uid_policies.whitelist()
        );
        let _ = writeln!(
            out,
            "Restrict background blacklist: {:?}",
            inner.uid_policies.blacklist()
        );
        let _ = writeln!(out, "Foreground UIDs: {:?}", inner.foreground.foreground_uids());

        let _ = writeln!(
            out,
            "Proc state seq history (capacity {}):",
            inner.history.capacity()
        );
        for line in inner.history.dump().lines() {
            let _ = writeln!(out, "  {line}");
        }
        out
    }

    /// Re-evaluates quotas, data enablement and notifications for every policy.
    ///
    /// Usage is read with the state lock released; the result is applied to
    /// whatever policies exist once the lock is retaken. Updates never overlap.
    async fn update_network_rules(&self) {
        let _rules = self.shared.rules.lock().await;
        let now = self.deps.clock.now();

        let windows: Vec<(NetworkPolicy, DateTime<Utc>)> = {
            let inner = self.shared.state.lock().await;
            inner
                .store
                .policies()
                .filter_map(|policy| match last_cycle_boundary(policy, now) {
                    Ok(cycle_start) => Some((policy.clone(), cycle_start)),
                    Err(err) => {
                        warn!(template = %policy.template, %err, "skip policy: cycle start");
                        None
                    }
                })
                .collect()
        };

        let mut usages = Vec::with_capacity(windows.len());
        for (policy, cycle_start) in windows {
            let used_bytes = match self
                .deps
                .usage
                .bytes_in_cycle(&policy.template, cycle_start, now)
            {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(template = %policy.template, %err, "usage stats unavailable, assuming zero");
                    0
                }
            };
            usages.push(PolicyUsage {
                policy,
                cycle_start,
                used_bytes,
            });
        }

        let applied = {
            let mut inner = self.shared.state.lock().await;
            let effects = plan_network_rules(&mut inner, usages);
            self.submit(effects)
        };
        applied.wait().await;
    }

    /// Queues `effects` behind every batch submitted earlier. Callers hold the
    /// state guard, so batches apply in the order their state changes were made.
    fn submit(&self, effects: Vec<Effect>) -> Applied {
        if effects.is_empty() {
            return Applied(None);
        }
        let (applied, rx) = oneshot::channel();
        if self.effects.send(EffectBatch { effects, applied }).is_err() {
            warn!("effect worker stopped; dropping effects");
            return Applied(None);
        }
        Applied(Some(rx))
    }
}

fn plan_network_rules(inner: &mut Inner, usages: Vec<PolicyUsage>) -> Vec<Effect> {
    let mut effects = Vec::new();

    let mut evaluations: BTreeMap<NetworkTemplate, (NetworkPolicy, PolicyEvaluation)> =
        BTreeMap::new();
    for mut usage in usages {
        let Some(current) = inner.store.get(&usage.policy.template) else {
            continue;
        };
        usage.policy = current.clone();
        let evaluation = evaluate(&usage);
        evaluations.insert(usage.policy.template.clone(), (usage.policy, evaluation));
    }

    let quota_inputs: BTreeMap<NetworkTemplate, PolicyEvaluation> = evaluations
        .iter()
        .map(|(template, (_, evaluation))| (template.clone(), evaluation.clone()))
        .collect();
    let quotas = plan_interface_quotas(&inner.networks, &inner.store, &quota_inputs);

    for iface in inner.metered_ifaces.iter() {
        if !quotas.contains_key(iface) {
            effects.push(Effect::RemoveQuota {
                iface: iface.clone(),
            });
        }
    }
    for (iface, quota_bytes) in &quotas {
        effects.push(Effect::SetQuota {
            iface: iface.clone(),
            quota_bytes: *quota_bytes,
        });
    }
    inner.metered_ifaces = quotas.keys().cloned().collect();
    effects.push(Effect::Event(PolicyEvent::MeteredIfacesChanged {
        ifaces: inner.metered_ifaces.iter().cloned().collect(),
    }));

    let mut desired = BTreeMap::new();
    for (template, (policy, evaluation)) in &evaluations {
        if inner.data_enabled.get(template) != Some(&evaluation.data_enabled) {
            inner
                .data_enabled
                .insert(template.clone(), evaluation.data_enabled);
            effects.push(Effect::TemplateDataEnabled {
                template: template.clone(),
                enabled: evaluation.data_enabled,
            });
        }
        if let Some(kind) = evaluation.notification {
            desired.insert(
                template.clone(),
                NotificationRequest::build(kind, policy, evaluation.used_bytes),
            );
        }
    }
    effects.extend(
        inner
            .notifications
            .reconcile(desired)
            .into_iter()
            .map(Effect::Notification),
    );

    effects
}

fn apply_effects(shared: &Shared, deps: &Collaborators, effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::SetQuota { iface, quota_bytes } => {
                if let Err(err) = deps.traffic.remove_interface_quota(&iface) {
                    warn!(iface, %err, "remove interface quota failed");
                }
                if let Err(err) = deps.traffic.set_interface_quota(&iface, quota_bytes) {
                    warn!(iface, quota_bytes, %err, "set interface quota failed");
                }
            }
            Effect::RemoveQuota { iface } => {
                if let Err(err) = deps.traffic.remove_interface_quota(&iface) {
                    warn!(iface, %err, "remove interface quota failed");
                }
            }
            Effect::TemplateDataEnabled { template, enabled } => {
                if let Err(err) = deps.traffic.set_template_data_enabled(&template, enabled) {
                    warn!(%template, enabled, %err, "set template data enabled failed");
                }
            }
            Effect::Notification(NotificationAction::Enqueue(request)) => {
                if let Err(err) = deps.notifications.enqueue(&request) {
                    warn!(tag = %request.tag, %err, "enqueue notification failed");
                }
            }
            Effect::Notification(NotificationAction::Cancel { tag }) => {
                deps.notifications.cancel(&tag);
            }
            Effect::RestrictBackground { enabled } => {
                match deps.traffic.set_data_saver_mode_enabled(enabled) {
                    Ok(()) => {
                        deps.broadcasts.restrict_background_changed(None);
                        shared.dispatch(PolicyEvent::RestrictBackgroundChanged { enabled });
                    }
                    Err(err) => warn!(enabled, %err, "set data saver mode failed"),
                }
            }
            Effect::SyncDataSaver { enabled } => {
                match deps.traffic.set_data_saver_mode_enabled(enabled) {
                    Ok(()) if enabled => deps.broadcasts.restrict_background_changed(None),
                    Ok(()) => {}
                    Err(err) => warn!(enabled, %err, "system ready: set data saver mode failed"),
                }
            }
            Effect::AppRestrictBackgroundChanged { uid } => {
                for package in deps.packages.packages_for_uid(uid) {
                    deps.broadcasts.restrict_background_changed(Some(&package));
                }
            }
            Effect::Event(event) => shared.dispatch(event),
            Effect::Persist(state) => {
                if let Err(err) = deps.persistence.save(&state) {
                    warn!(%err, "persist policies failed");
                }
            }
        }
    }
}

/// Single consumer of effect batches; applies them in submission order.
async fn run_effect_worker(
    shared: Arc<Shared>,
    deps: Collaborators,
    mut rx: mpsc::UnboundedReceiver<EffectBatch>,
) {
    while let Some(batch) = rx.recv().await {
        apply_effects(&shared, &deps, batch.effects);
        let _ = batch.applied.send(());
    }
    debug!("effect worker stopped");
}

/// Producer side of the single-consumer process-state queue.
#[derive(Debug, Clone)]
pub struct UidObserver {
    tx: mpsc::UnboundedSender<UidEvent>,
}

impl UidObserver {
    pub fn on_uid_state_changed(&self, uid: u32, state: ProcessState, seq: u64) {
        if self.tx.send(UidEvent::StateChanged { uid, state, seq }).is_err() {
            warn!(uid, seq, "uid worker stopped; dropping state change");
        }
    }

    pub fn on_uid_gone(&self, uid: u32) {
        if self.tx.send(UidEvent::Gone { uid }).is_err() {
            warn!(uid, "uid worker stopped; dropping uid gone");
        }
    }

    /// Waits until every event sent before this call has been processed.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(UidEvent::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_uid_worker(
    shared: Arc<Shared>,
    deps: Collaborators,
    mut rx: mpsc::UnboundedReceiver<UidEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            UidEvent::StateChanged { uid, state, seq } => {
                {
                    let mut inner = shared.state.lock().await;
                    if inner.foreground.update(uid, state) {
                        debug!(uid, ?state, "uid foreground changed");
                    }
                    inner.history.push(uid, seq);
                }
                deps.proc_state_ack.rules_updated(uid, seq);
            }
            UidEvent::Gone { uid } => {
                shared.state.lock().await.foreground.remove(uid);
            }
            UidEvent::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("uid worker stopped");
}
