use core::ops::RangeInclusive;

use bitflags::bitflags;

/// Offset between kelvin and celsius in the 0.1 K units the gauge reports.
pub const DECI_KELVIN_AT_0C: u16 = 2731;

pub const fn celsius_to_deci_kelvin(celsius: i16) -> u16 {
    (DECI_KELVIN_AT_0C as i16 + celsius * 10) as u16
}

bitflags! {
    /// Smart battery BatteryMode() register bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct BatteryMode: u16 {
        const INTERNAL_CHARGE_CONTROLLER = 1 << 0;
        const PRIMARY_BATTERY_SUPPORT = 1 << 1;
        const CONDITION_FLAG = 1 << 7;
        const CHARGE_CONTROLLER_ENABLED = 1 << 8;
        const PRIMARY_BATTERY = 1 << 9;
        const ALARM_MODE = 1 << 13;
        const CHARGER_MODE = 1 << 14;
        /// capacity is reported in 10mW units instead of mAh
        const CAPACITY_MODE = 1 << 15;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for BatteryMode {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "BatteryMode({=u16:#x})", self.bits())
    }
}

/// Snapshot of the fuel gauge, replaced wholesale every poll cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BatteryParams {
    pub voltage_mv: u32,
    /// negative while discharging
    pub current_ma: i32,
    pub state_of_charge: u8,
    pub remaining_capacity_mah: u32,
    pub full_capacity_mah: u32,
    /// 0.1 K
    pub temperature: u16,
    pub desired_voltage_mv: u32,
    pub desired_current_ma: u32,
    pub mode: BatteryMode,
    pub present: bool,
    pub responsive: bool,
}

impl BatteryParams {
    /// Placeholder used before the first successful read.
    pub const fn unknown() -> Self {
        Self {
            voltage_mv: 0,
            current_ma: 0,
            state_of_charge: 0,
            remaining_capacity_mah: 0,
            full_capacity_mah: 0,
            temperature: celsius_to_deci_kelvin(25),
            desired_voltage_mv: 0,
            desired_current_ma: 0,
            mode: BatteryMode::empty(),
            present: false,
            responsive: false,
        }
    }

    /// The snapshot to carry forward when the gauge stops answering. Values
    /// are held, only responsiveness changes.
    pub fn stale(last_known: &BatteryParams) -> Self {
        Self {
            responsive: false,
            ..*last_known
        }
    }

    /// Whole degrees, rounded toward colder.
    pub fn temperature_celsius(&self) -> i16 {
        (self.temperature as i32 - DECI_KELVIN_AT_0C as i32).div_euclid(10) as i16
    }
}

impl Default for BatteryParams {
    fn default() -> Self {
        Self::unknown()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TelemetryError {
    /// bus transaction timed out or was nacked
    Unresponsive,
    /// the gauge answered but the frame failed its checks
    Corrupt,
}

/// Fuel gauge and external power sense, provided by the board.
#[allow(async_fn_in_trait)]
pub trait TelemetrySource {
    async fn read_battery_params(&mut self) -> Result<BatteryParams, TelemetryError>;

    fn read_ac_present(&mut self) -> bool;
}

/// Temperature band the pack currently sits in, used both for the charge
/// permission check and to pick the charger termination range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TemperatureClass {
    TooCold,
    Standard,
    High,
    TooHot,
}

/// Static description of the pack fitted to the board.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatteryInfo {
    pub voltage_max_mv: u32,
    pub voltage_normal_mv: u32,
    /// below this the pack is deeply discharged and only trickle charged
    pub voltage_min_mv: u32,
    pub precharge_current_ma: u32,
    pub charge_current_max_ma: u32,

    // charging is only permitted between these, in celsius
    pub charging_min_c: i16,
    pub charging_max_c: i16,
    // above this the charger uses its high temperature termination range
    pub high_temp_threshold_c: i16,

    // plausibility limits checked every cycle
    pub plausible_voltage_mv: RangeInclusive<u32>,
    pub plausible_capacity_mah: RangeInclusive<u32>,
    pub plausible_state_of_charge: RangeInclusive<u8>,
    pub forbidden_mode: BatteryMode,
}

impl BatteryInfo {
    pub fn temperature_class(&self, params: &BatteryParams) -> TemperatureClass {
        let celsius = params.temperature_celsius();
        if celsius < self.charging_min_c {
            TemperatureClass::TooCold
        } else if celsius > self.charging_max_c {
            TemperatureClass::TooHot
        } else if celsius >= self.high_temp_threshold_c {
            TemperatureClass::High
        } else {
            TemperatureClass::Standard
        }
    }

    pub fn voltage_plausible(&self, params: &BatteryParams) -> bool {
        self.plausible_voltage_mv.contains(&params.voltage_mv)
    }

    pub fn capacity_plausible(&self, params: &BatteryParams) -> bool {
        self.plausible_capacity_mah.contains(&params.remaining_capacity_mah)
    }

    pub fn state_of_charge_plausible(&self, params: &BatteryParams) -> bool {
        self.plausible_state_of_charge.contains(&params.state_of_charge)
    }

    pub fn mode_plausible(&self, params: &BatteryParams) -> bool {
        !params.mode.intersects(self.forbidden_mode)
    }

    /// Charging voltage request: what the pack asks for, capped at the pack
    /// maximum. Packs that ask for nothing get their normal voltage.
    pub fn charging_voltage(&self, params: &BatteryParams) -> u32 {
        if params.desired_voltage_mv == 0 {
            self.voltage_normal_mv
        } else {
            params.desired_voltage_mv.min(self.voltage_max_mv)
        }
    }

    pub fn charging_current(&self, params: &BatteryParams) -> u32 {
        if params.desired_current_ma == 0 {
            self.charge_current_max_ma
        } else {
            params.desired_current_ma.min(self.charge_current_max_ma)
        }
    }
}
