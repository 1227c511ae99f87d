use std::collections::BTreeMap;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::{
    domain::{NetworkPolicy, NetworkTemplate},
    uid_policy::UidPolicy,
};

const TAG_PREFIX: &str = "NetworkPolicy";

/// Events a listener may fall behind by before new ones are dropped for it.
pub const DEFAULT_LISTENER_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NotificationKind {
    Warning,
    Limit,
    LimitSnoozed,
}

impl NotificationKind {
    pub fn type_id(self) -> u8 {
        match self {
            Self::Warning => 1,
            Self::Limit => 2,
            Self::LimitSnoozed => 3,
        }
    }
}

pub fn notification_tag(template: &NetworkTemplate, kind: NotificationKind) -> String {
    format!("{TAG_PREFIX}:{template}:{}", kind.type_id())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    pub tag: String,
    pub kind: NotificationKind,
    pub template: NetworkTemplate,
    pub title: String,
    pub body: String,
}

impl NotificationRequest {
    pub fn build(kind: NotificationKind, policy: &NetworkPolicy, used_bytes: u64) -> Self {
        let network = match policy.template {
            NetworkTemplate::Mobile { .. } => "Mobile data",
            NetworkTemplate::Wifi { .. } => "Wi-Fi data",
        };
        let (title, body) = match kind {
            NotificationKind::Warning => (
                "Data warning".to_string(),
                format!("{} used", format_bytes(used_bytes)),
            ),
            NotificationKind::Limit => (
                format!("{network} paused"),
                "You've reached the data limit you set".to_string(),
            ),
            NotificationKind::LimitSnoozed => {
                let over = policy
                    .limit
                    .bytes()
                    .map(|limit| used_bytes.saturating_sub(limit))
                    .unwrap_or(0);
                (
                    format!("{network} limit exceeded"),
                    format!("{} over specified limit", format_bytes(over)),
                )
            }
        };
        Self {
            tag: notification_tag(&policy.template, kind),
            kind,
            template: policy.template.clone(),
            title,
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationAction {
    Enqueue(NotificationRequest),
    Cancel { tag: String },
}

/// Keeps at most one active notification per template and only reports a
/// transition when the kind changes.
#[derive(Debug, Clone, Default)]
pub struct NotificationDispatcher {
    active: BTreeMap<NetworkTemplate, NotificationKind>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_kind(&self, template: &NetworkTemplate) -> Option<NotificationKind> {
        self.active.get(template).copied()
    }

    /// `desired` is the full set of notifications that should be showing now.
    pub fn reconcile(
        &mut self,
        desired: BTreeMap<NetworkTemplate, NotificationRequest>,
    ) -> Vec<NotificationAction> {
        let mut actions = Vec::new();

        let stale: Vec<NetworkTemplate> = self
            .active
            .keys()
            .filter(|t| !desired.contains_key(*t))
            .cloned()
            .collect();
        for template in stale {
            if let Some(kind) = self.active.remove(&template) {
                actions.push(NotificationAction::Cancel {
                    tag: notification_tag(&template, kind),
                });
            }
        }

        for (template, request) in desired {
            match self.active.get(&template) {
                Some(kind) if *kind == request.kind => continue,
                Some(kind) => actions.push(NotificationAction::Cancel {
                    tag: notification_tag(&template, *kind),
                }),
                None => {}
            }
            self.active.insert(template, request.kind);
            actions.push(NotificationAction::Enqueue(request));
        }

        actions
    }
}

/// Event delivered to every registered listener, in dispatch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvent {
    /// `app_id` is the UID with the user folded out.
    UidPoliciesChanged { app_id: u32, policy: UidPolicy },
    MeteredIfacesChanged { ifaces: Vec<String> },
    RestrictBackgroundChanged { enabled: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

#[derive(Debug)]
pub struct PolicyListener {
    id: ListenerId,
    rx: mpsc::Receiver<PolicyEvent>,
}

impl PolicyListener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<PolicyEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PolicyEvent> {
        self.rx.try_recv().ok()
    }
}

/// Bounded channel per listener; sends never block the caller. A listener
/// that stops draining loses events once its queue is full.
#[derive(Debug)]
pub struct ListenerFanout {
    next_id: u64,
    queue_capacity: usize,
    senders: BTreeMap<ListenerId, mpsc::Sender<PolicyEvent>>,
}

impl Default for ListenerFanout {
    fn default() -> Self {
        Self::with_queue_capacity(DEFAULT_LISTENER_QUEUE_CAPACITY)
    }
}

impl ListenerFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            next_id: 0,
            queue_capacity: queue_capacity.max(1),
            senders: BTreeMap::new(),
        }
    }

    pub fn register(&mut self) -> PolicyListener {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.senders.insert(id, tx);
        PolicyListener { id, rx }
    }

    pub fn unregister(&mut self, id: ListenerId) -> bool {
        self.senders.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Returns how many listeners received the event. Dropped listeners are
    /// pruned; full ones keep their registration but miss this event.
    pub fn dispatch(&mut self, event: &PolicyEvent) -> usize {
        let mut delivered = 0;
        self.senders
            .retain(|id, tx| match tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(listener = ?id, ?event, "listener queue full; dropping event");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
        delivered
    }
}

/// Compact human-readable size, e.g. "245M" or "1.2G".
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_000_000_000 {
        format!("{:.1}G", bytes as f64 / 1_000_000_000.0)
    } else if bytes >= 1_000_000 {
        format!("{}M", bytes / 1_000_000)
    } else if bytes >= 1_000 {
        format!("{}K", bytes / 1_000)
    } else {
        format!("{bytes}B")
    }
}
