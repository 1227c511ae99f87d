/// Battery-saver snapshot delivered by the power subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LowPowerState {
    /// Global battery saver is on.
    pub global_battery_saver_enabled: bool,
    /// Battery saver asks for data saver to be on.
    pub battery_saver_enabled: bool,
}

/// Restrict-background ("data saver") flag plus the bookkeeping needed to
/// restore the user's choice when battery saver turns off.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestrictBackgroundState {
    enabled: bool,
    enabled_before_low_power: bool,
    changed_during_low_power: bool,
    low_power_active: bool,
}

impl RestrictBackgroundState {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn low_power_active(&self) -> bool {
        self.low_power_active
    }

    pub fn changed_during_low_power(&self) -> bool {
        self.changed_during_low_power
    }

    /// User request. Returns the new value when the state actually changed.
    pub fn set_manual(&mut self, enabled: bool) -> Option<bool> {
        let changed = self.apply(enabled)?;
        if self.low_power_active {
            self.changed_during_low_power = true;
        }
        Some(changed)
    }

    /// Returns the new value when the state actually changed.
    pub fn on_low_power_changed(&mut self, low_power: LowPowerState) -> Option<bool> {
        self.low_power_active = low_power.global_battery_saver_enabled;

        let (invoke, target, changed_during_low_power) = if self.low_power_active {
            self.enabled_before_low_power = self.enabled;
            (
                !self.enabled && low_power.battery_saver_enabled,
                low_power.battery_saver_enabled,
                false,
            )
        } else {
            (
                !self.changed_during_low_power,
                self.enabled_before_low_power,
                self.changed_during_low_power,
            )
        };

        let result = if invoke { self.apply(target) } else { None };
        self.changed_during_low_power = changed_during_low_power;
        result
    }

    fn apply(&mut self, enabled: bool) -> Option<bool> {
        if self.enabled == enabled {
            return None;
        }
        self.enabled = enabled;
        Some(enabled)
    }
}
