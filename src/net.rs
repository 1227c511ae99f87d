use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::{
    carrier::CarrierConfig,
    clock::{Clock, SystemClock},
    domain::NetworkTemplate,
    notify::NotificationRequest,
    state::{PersistedPolicies, StoreError},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    #[error("usage stats unavailable: {0}")]
    Unavailable(String),
}

/// Kernel-facing quota and data-saver controls.
pub trait TrafficControl: Send + Sync {
    fn set_interface_quota(&self, iface: &str, quota_bytes: u64) -> Result<(), ControlError>;
    fn remove_interface_quota(&self, iface: &str) -> Result<(), ControlError>;
    fn set_data_saver_mode_enabled(&self, enabled: bool) -> Result<(), ControlError>;
    fn set_template_data_enabled(
        &self,
        template: &NetworkTemplate,
        enabled: bool,
    ) -> Result<(), ControlError>;
}

pub trait UsageStats: Send + Sync {
    fn bytes_in_cycle(
        &self,
        template: &NetworkTemplate,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, UsageError>;
}

pub trait CarrierConfigSource: Send + Sync {
    fn subscriber_id(&self, sub_id: i32) -> Option<String>;
    fn config_for_subscription(&self, sub_id: i32) -> Option<CarrierConfig>;
}

/// Tells the process-state producer that rules for `(uid, seq)` are in place.
pub trait ProcStateAck: Send + Sync {
    fn rules_updated(&self, uid: u32, seq: u64);
}

pub trait NotificationSink: Send + Sync {
    fn enqueue(&self, request: &NotificationRequest) -> Result<(), ControlError>;
    fn cancel(&self, tag: &str);
}

pub trait BroadcastSink: Send + Sync {
    /// `None` targets every app.
    fn restrict_background_changed(&self, package: Option<&str>);
}

pub trait PackageResolver: Send + Sync {
    fn packages_for_uid(&self, uid: u32) -> Vec<String>;
}

pub trait PolicyPersistence: Send + Sync {
    fn save(&self, state: &PersistedPolicies) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub traffic: Arc<dyn TrafficControl>,
    pub usage: Arc<dyn UsageStats>,
    pub carrier: Arc<dyn CarrierConfigSource>,
    pub proc_state_ack: Arc<dyn ProcStateAck>,
    pub notifications: Arc<dyn NotificationSink>,
    pub broadcasts: Arc<dyn BroadcastSink>,
    pub packages: Arc<dyn PackageResolver>,
    pub persistence: Arc<dyn PolicyPersistence>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Standalone wiring: every outward call is logged, usage reads as zero.
    pub fn logging(persistence: Arc<dyn PolicyPersistence>) -> Self {
        let log = Arc::new(LoggingCollaborator);
        Self {
            traffic: log.clone(),
            usage: log.clone(),
            carrier: log.clone(),
            proc_state_ack: log.clone(),
            notifications: log.clone(),
            broadcasts: log.clone(),
            packages: log,
            persistence,
            clock: Arc::new(SystemClock),
        }
    }
}

#[derive(Debug, Default)]
pub struct LoggingCollaborator;

impl TrafficControl for LoggingCollaborator {
    fn set_interface_quota(&self, iface: &str, quota_bytes: u64) -> Result<(), ControlError> {
        info!(iface, quota_bytes, "set interface quota");
        Ok(())
    }

    fn remove_interface_quota(&self, iface: &str) -> Result<(), ControlError> {
        info!(iface, "remove interface quota");
        Ok(())
    }

    fn set_data_saver_mode_enabled(&self, enabled: bool) -> Result<(), ControlError> {
        info!(enabled, "set data saver mode");
        Ok(())
    }

    fn set_template_data_enabled(
        &self,
        template: &NetworkTemplate,
        enabled: bool,
    ) -> Result<(), ControlError> {
        info!(%template, enabled, "set template data enabled");
        Ok(())
    }
}

impl UsageStats for LoggingCollaborator {
    fn bytes_in_cycle(
        &self,
        template: &NetworkTemplate,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, UsageError> {
        debug!(%template, %start, %end, "usage query");
        Ok(0)
    }
}

impl CarrierConfigSource for LoggingCollaborator {
    fn subscriber_id(&self, _sub_id: i32) -> Option<String> {
        None
    }

    fn config_for_subscription(&self, _sub_id: i32) -> Option<CarrierConfig> {
        None
    }
}

impl ProcStateAck for LoggingCollaborator {
    fn rules_updated(&self, uid: u32, seq: u64) {
        debug!(uid, seq, "rules updated");
    }
}

impl NotificationSink for LoggingCollaborator {
    fn enqueue(&self, request: &NotificationRequest) -> Result<(), ControlError> {
        info!(tag = %request.tag, title = %request.title, body = %request.body, "notification");
        Ok(())
    }

    fn cancel(&self, tag: &str) {
        info!(tag, "cancel notification");
    }
}

impl BroadcastSink for LoggingCollaborator {
    fn restrict_background_changed(&self, package: Option<&str>) {
        info!(package, "restrict background changed");
    }
}

impl PackageResolver for LoggingCollaborator {
    fn packages_for_uid(&self, _uid: u32) -> Vec<String> {
        Vec::new()
    }
}
