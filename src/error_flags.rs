//! Per cycle fault bitmask.
//!
//! The mask is rebuilt from scratch every cycle out of the latest telemetry
//! read and charger driver results. Nothing ever sets or clears a single
//! bit in place, so a condition that goes away disappears from the mask on
//! the very next cycle. Holding a fault long enough to act on it is the job
//! of [`crate::debounce`].

use bitflags::bitflags;

use crate::{
    battery::{BatteryInfo, BatteryParams, TelemetryError},
    charger::{ChargerError, ChargerStatus},
};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct ErrorFlags: u16 {
        /// charger initialization
        const CHARGER_INIT = 1 << 0;
        /// charger maximum output voltage
        const CHARGER_VOLTAGE = 1 << 1;
        /// charger maximum output current
        const CHARGER_CURRENT = 1 << 2;
        /// battery voltage
        const BATTERY_VOLTAGE = 1 << 3;
        /// battery mode
        const BATTERY_MODE = 1 << 8;
        /// battery capacity
        const BATTERY_CAPACITY = 1 << 9;
        /// state of charge, percentage
        const BATTERY_SOC = 1 << 10;
        /// battery not responding
        const BATTERY_UNRESPONSIVE = 1 << 11;
        /// battery not connected
        const BATTERY_NOT_CONNECTED = 1 << 12;
        /// any battery parameter bad
        const BATTERY_GET_PARAMS = 1 << 13;

        const BATTERY_MASK = Self::BATTERY_VOLTAGE.bits()
            | Self::BATTERY_MODE.bits()
            | Self::BATTERY_CAPACITY.bits()
            | Self::BATTERY_SOC.bits()
            | Self::BATTERY_UNRESPONSIVE.bits()
            | Self::BATTERY_NOT_CONNECTED.bits()
            | Self::BATTERY_GET_PARAMS.bits();
        const CHARGER_MASK = Self::CHARGER_INIT.bits()
            | Self::CHARGER_VOLTAGE.bits()
            | Self::CHARGER_CURRENT.bits();
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ErrorFlags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "ErrorFlags({=u16:#06x})", self.bits())
    }
}

impl ErrorFlags {
    pub fn battery_fault(&self) -> bool {
        self.intersects(Self::BATTERY_MASK)
    }

    pub fn charger_fault(&self) -> bool {
        self.intersects(Self::CHARGER_MASK)
    }

    /// Build this cycle's mask.
    ///
    /// `reading` is the raw result of the telemetry query. `charger` holds
    /// the outcome of the most recent init sequence and limit write.
    pub fn aggregate(reading: &Result<BatteryParams, TelemetryError>, charger: &ChargerStatus, battery_info: &BatteryInfo) -> ErrorFlags {
        Self::battery_flags(reading, battery_info) | Self::charger_flags(charger)
    }

    fn battery_flags(reading: &Result<BatteryParams, TelemetryError>, battery_info: &BatteryInfo) -> ErrorFlags {
        let params = match reading {
            Ok(params) => params,
            // no fresh values to judge, only the communication failure counts
            Err(_) => return ErrorFlags::BATTERY_UNRESPONSIVE,
        };

        if !params.present {
            return ErrorFlags::BATTERY_NOT_CONNECTED;
        }

        let mut flags = ErrorFlags::empty();
        flags.set(ErrorFlags::BATTERY_VOLTAGE, !battery_info.voltage_plausible(params));
        flags.set(ErrorFlags::BATTERY_MODE, !battery_info.mode_plausible(params));
        flags.set(ErrorFlags::BATTERY_CAPACITY, !battery_info.capacity_plausible(params));
        flags.set(ErrorFlags::BATTERY_SOC, !battery_info.state_of_charge_plausible(params));

        if !flags.is_empty() {
            flags |= ErrorFlags::BATTERY_GET_PARAMS;
        }

        flags
    }

    fn charger_flags(charger: &ChargerStatus) -> ErrorFlags {
        let mut flags = ErrorFlags::empty();
        flags.set(ErrorFlags::CHARGER_INIT, charger.init.is_err());

        match charger.limits {
            Ok(()) => {}
            Err(ChargerError::VoltageOutOfRange) => flags |= ErrorFlags::CHARGER_VOLTAGE,
            Err(ChargerError::CurrentOutOfRange) => flags |= ErrorFlags::CHARGER_CURRENT,
            // nothing made it into the registers
            Err(_) => flags |= ErrorFlags::CHARGER_VOLTAGE | ErrorFlags::CHARGER_CURRENT,
        }

        flags
    }
}
