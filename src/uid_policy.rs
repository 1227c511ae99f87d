use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::domain::DomainError;

pub const PER_USER_RANGE: u32 = 100_000;
pub const FIRST_APPLICATION_UID: u32 = 10_000;
pub const LAST_APPLICATION_UID: u32 = 19_999;

bitflags! {
    /// Metered-network background policy for one UID.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct UidPolicy: u32 {
        const REJECT_METERED_BACKGROUND = 0x1;
        /// Legacy bit, kept so stored values survive a round trip.
        const ALLOW_BACKGROUND_BATTERY_SAVE = 0x2;
        const ALLOW_METERED_BACKGROUND = 0x4;
    }
}

impl UidPolicy {
    pub const NONE: Self = Self::empty();

    /// Boundary conversion; unknown bits are retained.
    pub fn from_raw(raw: u32) -> Self {
        Self::from_bits_retain(raw)
    }

    pub fn raw(self) -> u32 {
        self.bits()
    }

    pub fn rejects_metered(self) -> bool {
        self.contains(Self::REJECT_METERED_BACKGROUND)
    }

    pub fn allows_metered(self) -> bool {
        self.contains(Self::ALLOW_METERED_BACKGROUND)
    }

    pub fn describe(self) -> String {
        if self.is_empty() {
            return "POLICY_NONE".to_string();
        }
        let mut parts: Vec<String> = self
            .iter_names()
            .map(|(name, _)| format!("POLICY_{name}"))
            .collect();
        let unknown = self.bits() & !Self::all().bits();
        if unknown != 0 {
            parts.push(format!("0x{unknown:x}"));
        }
        parts.join("|")
    }
}

pub fn is_app_uid(uid: u32) -> bool {
    (FIRST_APPLICATION_UID..=LAST_APPLICATION_UID).contains(&app_id(uid))
}

/// The per-user-independent part of a UID.
pub fn app_id(uid: u32) -> u32 {
    uid % PER_USER_RANGE
}

/// Result of an effective policy update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidPolicyChange {
    pub uid: u32,
    pub old: UidPolicy,
    pub new: UidPolicy,
    /// The app must be told its metered background access may have changed.
    pub notify_app: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UidPolicyRegistry {
    policies: BTreeMap<u32, UidPolicy>,
}

impl UidPolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads persisted raw values, dropping non-app UIDs and empty entries.
    pub fn from_raw_entries(entries: &BTreeMap<u32, u32>) -> Self {
        let policies = entries
            .iter()
            .filter(|(uid, raw)| is_app_uid(**uid) && **raw != 0)
            .map(|(uid, raw)| (*uid, UidPolicy::from_raw(*raw)))
            .collect();
        Self { policies }
    }

    pub fn to_raw_entries(&self) -> BTreeMap<u32, u32> {
        self.policies
            .iter()
            .map(|(uid, policy)| (*uid, policy.raw()))
            .collect()
    }

    /// Replaces the flags for `uid`. Returns `None` when nothing changed.
    pub fn set(
        &mut self,
        uid: u32,
        policy: UidPolicy,
        restrict_background: bool,
    ) -> Result<Option<UidPolicyChange>, DomainError> {
        if !is_app_uid(uid) {
            return Err(DomainError::InvalidUid { uid });
        }

        let old = self.get(uid);
        if old == policy {
            return Ok(None);
        }

        if policy.is_empty() {
            self.policies.remove(&uid);
        } else {
            self.policies.insert(uid, policy);
        }

        Ok(Some(UidPolicyChange {
            uid,
            old,
            new: policy,
            notify_app: membership_changed(old, policy, restrict_background),
        }))
    }

    pub fn get(&self, uid: u32) -> UidPolicy {
        self.policies.get(&uid).copied().unwrap_or(UidPolicy::NONE)
    }

    /// UIDs sharing any bit with `flag`; `NONE` matches nothing stored.
    pub fn uids_with_policy(&self, flag: UidPolicy) -> Vec<u32> {
        self.policies
            .iter()
            .filter(|(_, policy)| {
                if flag.is_empty() {
                    policy.is_empty()
                } else {
                    policy.intersects(flag)
                }
            })
            .map(|(uid, _)| *uid)
            .collect()
    }

    pub fn whitelist(&self) -> Vec<u32> {
        self.uids_with_policy(UidPolicy::ALLOW_METERED_BACKGROUND)
    }

    pub fn blacklist(&self) -> Vec<u32> {
        self.uids_with_policy(UidPolicy::REJECT_METERED_BACKGROUND)
    }

    /// Background metered access only; a foreground UID is never blocked.
    /// Reject wins over allow.
    pub fn is_blocked(&self, uid: u32, restrict_background: bool, foreground: bool) -> bool {
        if foreground {
            return false;
        }
        let policy = self.get(uid);
        policy.rejects_metered() || (restrict_background && !policy.allows_metered())
    }

    pub fn entries(&self) -> impl Iterator<Item = (u32, UidPolicy)> + '_ {
        self.policies.iter().map(|(uid, policy)| (*uid, *policy))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

fn membership_changed(old: UidPolicy, new: UidPolicy, restrict_background: bool) -> bool {
    let blacklist_changed = old.rejects_metered() != new.rejects_metered();
    let whitelist_changed = old.allows_metered() != new.allows_metered();
    blacklist_changed || (restrict_background && whitelist_changed)
}
