// Variable Naming Scheme
// POLL_PERIOD_* are requested sleeps between charge state machine cycles
// BATTERY_LEVEL_* are state of charge thresholds in percent
// *_TIMEOUT and *_TIME are policy timers, all measured from the cycle that
// first observed the condition

use embassy_time::Duration;

use crate::{
    battery::{BatteryInfo, BatteryMode},
    charger::{
        init::{ChargerProfile, TerminationSetting},
        ChargerInfo, FastChargeTimeout, TermCurrent, TermVoltage, TerminationRange,
    },
};

// on battery, wake as little as possible
pub const POLL_PERIOD_VERY_LONG: Duration = Duration::from_secs(60);
pub const POLL_PERIOD_LONG: Duration = Duration::from_millis(500);
pub const POLL_PERIOD_CHARGE: Duration = Duration::from_millis(250);
// near a threshold or while a fault is debouncing
pub const POLL_PERIOD_SHORT: Duration = Duration::from_millis(100);

// jitter floor and ceiling for the returned interval. The ceiling is the very
// long period so discharge polling is never cut short. Older EC firmware capped
// this at 1 s, which would turn every very long poll into a 1 s poll.
pub const MIN_SLEEP: Duration = Duration::from_millis(50);
pub const MAX_SLEEP: Duration = POLL_PERIOD_VERY_LONG;

// charger watchdog expires if the limit registers are not refreshed
pub const CHARGER_UPDATE_PERIOD: Duration = Duration::from_secs(10);

// a fault bit must hold (and later clear) for this many consecutive cycles,
// five short periods worth at the fastest polling rate
pub const FAULT_DEBOUNCE_HOLD_CYCLES: u8 = 5;

// charging voltage request must be stable this long before it is written
pub const VOLTAGE_DEBOUNCE_TIME: Duration = Duration::from_secs(2);

// time in pre-charge before moving to the full rate current
pub const PRECHARGE_RAMP_TIME: Duration = Duration::from_secs(2);
// deeply discharged packs that make no progress for this long are flagged stalled
pub const TRICKLE_CHARGE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub const BATTERY_LEVEL_FULL: u8 = 100;
// once full, only restart charging below this
pub const BATTERY_LEVEL_RECHARGE: u8 = 95;
pub const BATTERY_LEVEL_NEAR_FULL: u8 = 97;
pub const BATTERY_LEVEL_CRITICAL: u8 = 5;
pub const BATTERY_LEVEL_SHUTDOWN: u8 = 3;
pub const LOW_BATTERY_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

// current held on the charger while full, 0 disables maintenance charging
pub const FULL_MAINTENANCE_CURRENT_MA: u32 = 0;

// 2S li-ion pack
pub const BATTERY_INFO_2S: BatteryInfo = BatteryInfo {
    voltage_max_mv: 8400,
    voltage_normal_mv: 7400,
    voltage_min_mv: 6000,
    precharge_current_ma: 256,
    charge_current_max_ma: 2048,
    charging_min_c: 0,
    charging_max_c: 50,
    high_temp_threshold_c: 45,
    // a reading outside these is a gauge fault, not a battery condition
    plausible_voltage_mv: 3000..=9200,
    plausible_capacity_mah: 0..=6000,
    plausible_state_of_charge: 0..=100,
    forbidden_mode: BatteryMode::CAPACITY_MODE,
};

pub const CHARGER_INFO: ChargerInfo = ChargerInfo {
    voltage_min_mv: 5000,
    voltage_max_mv: 12600,
    voltage_step_mv: 16,
    current_min_ma: 128,
    current_max_ma: 4096,
    current_step_ma: 64,
    termination_base_ma: 100,
};

// High and standard temperature ranges both terminate at 2.1V/100%.
// T40 is programmed the same and ignored, the pack NTC misreads there.
pub const CHARGER_PROFILE: ChargerProfile = ChargerProfile {
    fast_charge_timeout: FastChargeTimeout::Hours6,
    terminations: [
        TerminationSetting { range: TerminationRange::T34, voltage: TermVoltage::V2100, current: TermCurrent::I1000 },
        TerminationSetting { range: TerminationRange::T23, voltage: TermVoltage::V2100, current: TermCurrent::I1000 },
        TerminationSetting { range: TerminationRange::T40, voltage: TermVoltage::V2100, current: TermCurrent::I1000 },
    ],
    // workaround values for silicon before ES3
    legacy_revision_below: 3,
    legacy_term_current: TermCurrent::I0750,
};

/// Runtime tunables of the charge state machine. Defaults are the board
/// constants above; calibration may override any of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargeConfig {
    pub poll_period_very_long: Duration,
    pub poll_period_long: Duration,
    pub poll_period_charge: Duration,
    pub poll_period_short: Duration,
    pub min_sleep: Duration,
    pub max_sleep: Duration,
    pub charger_update_period: Duration,
    pub fault_hold_cycles: u8,
    pub voltage_debounce_time: Duration,
    pub precharge_ramp_time: Duration,
    pub trickle_charge_timeout: Duration,
    pub level_full: u8,
    pub level_recharge: u8,
    pub level_near_full: u8,
    pub level_critical: u8,
    pub level_shutdown: u8,
    pub shutdown_warning_time: Duration,
    pub full_maintenance_current_ma: u32,
}

impl ChargeConfig {
    pub const fn new() -> Self {
        Self {
            poll_period_very_long: POLL_PERIOD_VERY_LONG,
            poll_period_long: POLL_PERIOD_LONG,
            poll_period_charge: POLL_PERIOD_CHARGE,
            poll_period_short: POLL_PERIOD_SHORT,
            min_sleep: MIN_SLEEP,
            max_sleep: MAX_SLEEP,
            charger_update_period: CHARGER_UPDATE_PERIOD,
            fault_hold_cycles: FAULT_DEBOUNCE_HOLD_CYCLES,
            voltage_debounce_time: VOLTAGE_DEBOUNCE_TIME,
            precharge_ramp_time: PRECHARGE_RAMP_TIME,
            trickle_charge_timeout: TRICKLE_CHARGE_TIMEOUT,
            level_full: BATTERY_LEVEL_FULL,
            level_recharge: BATTERY_LEVEL_RECHARGE,
            level_near_full: BATTERY_LEVEL_NEAR_FULL,
            level_critical: BATTERY_LEVEL_CRITICAL,
            level_shutdown: BATTERY_LEVEL_SHUTDOWN,
            shutdown_warning_time: LOW_BATTERY_SHUTDOWN_TIMEOUT,
            full_maintenance_current_ma: FULL_MAINTENANCE_CURRENT_MA,
        }
    }

    /// Clamp a requested poll period into the sleep bounds.
    pub fn clamp_sleep(&self, period: Duration) -> Duration {
        if period < self.min_sleep {
            self.min_sleep
        } else if period > self.max_sleep {
            self.max_sleep
        } else {
            period
        }
    }
}

impl Default for ChargeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discharge_polling_is_not_clamped() {
        let config = ChargeConfig::new();
        assert_eq!(config.max_sleep, config.poll_period_very_long);
        assert_eq!(config.clamp_sleep(POLL_PERIOD_VERY_LONG), POLL_PERIOD_VERY_LONG);
        assert_eq!(config.clamp_sleep(Duration::from_secs(120)), MAX_SLEEP);
        assert_eq!(config.clamp_sleep(Duration::from_millis(1)), MIN_SLEEP);
    }
}
