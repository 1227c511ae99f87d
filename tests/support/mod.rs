#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use netpolicy::{
    carrier::CarrierConfig,
    clock::ManualClock,
    domain::{NetworkIdentity, NetworkPolicy, NetworkState, NetworkTemplate, Threshold},
    net::{
        BroadcastSink, CarrierConfigSource, Collaborators, ControlError, NotificationSink,
        PackageResolver, PolicyPersistence, ProcStateAck, TrafficControl, UsageError, UsageStats,
    },
    notify::{NotificationRequest, PolicyEvent, PolicyListener},
    service::{NetworkPolicyService, ServiceOptions},
    state::{PersistedPolicies, StoreError},
};

pub const MB: u64 = 1024 * 1024;
pub const SUBSCRIBER: &str = "310410";
pub const IFACE: &str = "rmnet0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SetQuota { iface: String, bytes: u64 },
    RemoveQuota { iface: String },
    DataSaver(bool),
    TemplateData { template: NetworkTemplate, enabled: bool },
    Enqueue { tag: String },
    Cancel { tag: String },
    Broadcast { package: Option<String> },
    Ack { uid: u32, seq: u64 },
}

#[derive(Debug, Default)]
pub struct Recorder {
    calls: Mutex<Vec<Call>>,
    usage: Mutex<BTreeMap<NetworkTemplate, u64>>,
    usage_queries: Mutex<Vec<(NetworkTemplate, DateTime<Utc>, DateTime<Utc>)>>,
    carrier: Mutex<BTreeMap<i32, (String, Option<CarrierConfig>)>>,
    packages: Mutex<BTreeMap<u32, Vec<String>>>,
    saved: Mutex<Vec<PersistedPolicies>>,
    notifications: Mutex<Vec<NotificationRequest>>,
    fail_data_saver: AtomicBool,
    slow_data_saver: Mutex<Option<(bool, Duration)>>,
}

impl Recorder {
    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    pub fn set_usage(&self, template: &NetworkTemplate, bytes: u64) {
        self.usage.lock().unwrap().insert(template.clone(), bytes);
    }

    pub fn usage_queries(&self) -> Vec<(NetworkTemplate, DateTime<Utc>, DateTime<Utc>)> {
        self.usage_queries.lock().unwrap().clone()
    }

    pub fn set_carrier(&self, sub_id: i32, subscriber_id: &str, config: Option<CarrierConfig>) {
        self.carrier
            .lock()
            .unwrap()
            .insert(sub_id, (subscriber_id.to_string(), config));
    }

    pub fn set_packages(&self, uid: u32, packages: &[&str]) {
        self.packages
            .lock()
            .unwrap()
            .insert(uid, packages.iter().map(|p| p.to_string()).collect());
    }

    pub fn last_saved(&self) -> Option<PersistedPolicies> {
        self.saved.lock().unwrap().last().cloned()
    }

    pub fn last_notification(&self) -> Option<NotificationRequest> {
        self.notifications.lock().unwrap().last().cloned()
    }

    pub fn fail_data_saver(&self, fail: bool) {
        self.fail_data_saver.store(fail, Ordering::SeqCst);
    }

    /// Blocks the calling thread for `delay` when data saver is pushed to `enabled`.
    pub fn slow_data_saver(&self, enabled: bool, delay: Duration) {
        *self.slow_data_saver.lock().unwrap() = Some((enabled, delay));
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl TrafficControl for Recorder {
    fn set_interface_quota(&self, iface: &str, quota_bytes: u64) -> Result<(), ControlError> {
        self.record(Call::SetQuota {
            iface: iface.to_string(),
            bytes: quota_bytes,
        });
        Ok(())
    }

    fn remove_interface_quota(&self, iface: &str) -> Result<(), ControlError> {
        self.record(Call::RemoveQuota {
            iface: iface.to_string(),
        });
        Ok(())
    }

    fn set_data_saver_mode_enabled(&self, enabled: bool) -> Result<(), ControlError> {
        let slow = *self.slow_data_saver.lock().unwrap();
        if let Some((slow_for, delay)) = slow
            && slow_for == enabled
        {
            std::thread::sleep(delay);
        }
        self.record(Call::DataSaver(enabled));
        if self.fail_data_saver.load(Ordering::SeqCst) {
            return Err(ControlError::Rejected("data saver busy".to_string()));
        }
        Ok(())
    }

    fn set_template_data_enabled(
        &self,
        template: &NetworkTemplate,
        enabled: bool,
    ) -> Result<(), ControlError> {
        self.record(Call::TemplateData {
            template: template.clone(),
            enabled,
        });
        Ok(())
    }
}

impl UsageStats for Recorder {
    fn bytes_in_cycle(
        &self,
        template: &NetworkTemplate,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, UsageError> {
        self.usage_queries
            .lock()
            .unwrap()
            .push((template.clone(), start, end));
        self.usage
            .lock()
            .unwrap()
            .get(template)
            .copied()
            .ok_or_else(|| UsageError::Unavailable(format!("no stats for {template}")))
    }
}

impl CarrierConfigSource for Recorder {
    fn subscriber_id(&self, sub_id: i32) -> Option<String> {
        self.carrier
            .lock()
            .unwrap()
            .get(&sub_id)
            .map(|(id, _)| id.clone())
    }

    fn config_for_subscription(&self, sub_id: i32) -> Option<CarrierConfig> {
        self.carrier
            .lock()
            .unwrap()
            .get(&sub_id)
            .and_then(|(_, config)| config.clone())
    }
}

impl ProcStateAck for Recorder {
    fn rules_updated(&self, uid: u32, seq: u64) {
        self.record(Call::Ack { uid, seq });
    }
}

impl NotificationSink for Recorder {
    fn enqueue(&self, request: &NotificationRequest) -> Result<(), ControlError> {
        self.notifications.lock().unwrap().push(request.clone());
        self.record(Call::Enqueue {
            tag: request.tag.clone(),
        });
        Ok(())
    }

    fn cancel(&self, tag: &str) {
        self.record(Call::Cancel {
            tag: tag.to_string(),
        });
    }
}

impl BroadcastSink for Recorder {
    fn restrict_background_changed(&self, package: Option<&str>) {
        self.record(Call::Broadcast {
            package: package.map(str::to_string),
        });
    }
}

impl PackageResolver for Recorder {
    fn packages_for_uid(&self, uid: u32) -> Vec<String> {
        self.packages
            .lock()
            .unwrap()
            .get(&uid)
            .cloned()
            .unwrap_or_default()
    }
}

impl PolicyPersistence for Recorder {
    fn save(&self, state: &PersistedPolicies) -> Result<(), StoreError> {
        self.saved.lock().unwrap().push(state.clone());
        Ok(())
    }
}

pub struct Harness {
    pub service: NetworkPolicyService,
    pub recorder: Arc<Recorder>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn start(persisted: PersistedPolicies) -> Self {
        Self::start_with(persisted, ServiceOptions::default(), |_| {})
    }

    pub fn start_with(
        persisted: PersistedPolicies,
        options: ServiceOptions,
        customize: impl FnOnce(&mut Collaborators),
    ) -> Self {
        let recorder = Arc::new(Recorder::default());
        let clock = Arc::new(ManualClock::new(time_mar_10()));
        let mut deps = Collaborators {
            traffic: recorder.clone(),
            usage: recorder.clone(),
            carrier: recorder.clone(),
            proc_state_ack: recorder.clone(),
            notifications: recorder.clone(),
            broadcasts: recorder.clone(),
            packages: recorder.clone(),
            persistence: recorder.clone(),
            clock: clock.clone(),
        };
        customize(&mut deps);
        let service = NetworkPolicyService::start(deps, persisted, options).unwrap();
        Self {
            service,
            recorder,
            clock,
        }
    }
}

/// 2007-03-10T00:00:00Z
pub fn time_mar_10() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2007, 3, 10, 0, 0, 0).unwrap()
}

/// 2007-02-15T00:00:00Z, start of the cycle containing `time_mar_10` for cycle day 15.
pub fn cycle_start_feb_15() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2007, 2, 15, 0, 0, 0).unwrap()
}

pub fn mobile_template() -> NetworkTemplate {
    NetworkTemplate::mobile(SUBSCRIBER)
}

pub fn mobile_network() -> NetworkState {
    NetworkState::new(
        IFACE,
        NetworkIdentity::Mobile {
            subscriber_id: SUBSCRIBER.to_string(),
        },
    )
}

pub fn mobile_policy(warning: Threshold, limit: Threshold, metered: bool) -> NetworkPolicy {
    NetworkPolicy {
        template: mobile_template(),
        cycle_day: 15,
        timezone: Tz::UTC,
        warning,
        limit,
        last_warning_snooze: None,
        last_limit_snooze: None,
        metered,
        inferred: false,
    }
}

pub async fn next_event(listener: &mut PolicyListener) -> PolicyEvent {
    tokio::time::timeout(Duration::from_secs(5), listener.recv())
        .await
        .expect("timed out waiting for policy event")
        .expect("listener channel closed")
}

/// Skips events until one matches.
pub async fn next_matching(
    listener: &mut PolicyListener,
    matches: impl Fn(&PolicyEvent) -> bool,
) -> PolicyEvent {
    loop {
        let event = next_event(listener).await;
        if matches(&event) {
            return event;
        }
    }
}
