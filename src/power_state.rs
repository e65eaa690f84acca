//! Host visible battery status block.
//!
//! The charge task is the only writer. Readers (the host through the memory
//! map, or other tasks on this controller) may run at any time, so every
//! write is bracketed by a sequence counter: odd while a write is in
//! progress, even once the tuple is complete. A reader that sees an odd
//! counter, or a counter that moved while it was copying the fields,
//! retries. Field stores are individually atomic, which is enough on
//! targets without a 64 bit atomic (thumbv6m has no fetch_add either, so
//! the counter is advanced with plain load/store).

use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Public status bits exported to the host.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct BatteryStatusFlags: u8 {
        const AC_PRESENT = 1 << 0;
        const BATT_PRESENT = 1 << 1;
        const DISCHARGING = 1 << 2;
        const CHARGING = 1 << 3;
        const LEVEL_CRITICAL = 1 << 4;
        /// low battery shutdown countdown expired, host should power down
        const SHUTDOWN_WARNING = 1 << 5;
        const CHARGER_FAULT = 1 << 6;
        const BATTERY_FAULT = 1 << 7;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for BatteryStatusFlags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "BatteryStatusFlags({=u8:#04x})", self.bits())
    }
}

/// One coherent set of published values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BatteryStatus {
    pub voltage_mv: u32,
    /// signed, negative while discharging
    pub rate_ma: i32,
    pub remaining_capacity_mah: u32,
    pub flags: BatteryStatusFlags,
}

// fixed offsets of the host contract
pub const BATTERY_VOLTAGE_OFFSET: usize = 0;
pub const BATTERY_RATE_OFFSET: usize = 4;
pub const BATTERY_CAPACITY_OFFSET: usize = 8;
pub const BATTERY_FLAGS_OFFSET: usize = 12;
pub const BATTERY_SEQUENCE_OFFSET: usize = 16;

#[repr(C)]
pub struct SharedBatteryState {
    voltage_mv: AtomicU32,
    rate_ma: AtomicI32,
    remaining_capacity_mah: AtomicU32,
    flags: AtomicU8,
    sequence: AtomicU32,
}

impl SharedBatteryState {
    pub const fn new() -> SharedBatteryState {
        SharedBatteryState {
            voltage_mv: AtomicU32::new(0),
            rate_ma: AtomicI32::new(0),
            remaining_capacity_mah: AtomicU32::new(0),
            flags: AtomicU8::new(0),
            sequence: AtomicU32::new(0),
        }
    }

    /// Replace the published tuple. Must only be called from the charge task.
    pub fn publish(&self, status: &BatteryStatus) {
        let sequence = self.sequence.load(Ordering::Relaxed);

        self.sequence.store(sequence.wrapping_add(1), Ordering::SeqCst);
        self.voltage_mv.store(status.voltage_mv, Ordering::SeqCst);
        self.rate_ma.store(status.rate_ma, Ordering::SeqCst);
        self.remaining_capacity_mah.store(status.remaining_capacity_mah, Ordering::SeqCst);
        self.flags.store(status.flags.bits(), Ordering::SeqCst);
        self.sequence.store(sequence.wrapping_add(2), Ordering::SeqCst);
    }

    /// Single read attempt, `None` if a write overlapped it.
    pub fn try_read(&self) -> Option<BatteryStatus> {
        let before = self.sequence.load(Ordering::SeqCst);
        if before & 1 != 0 {
            return None;
        }

        let status = BatteryStatus {
            voltage_mv: self.voltage_mv.load(Ordering::SeqCst),
            rate_ma: self.rate_ma.load(Ordering::SeqCst),
            remaining_capacity_mah: self.remaining_capacity_mah.load(Ordering::SeqCst),
            flags: BatteryStatusFlags::from_bits_retain(self.flags.load(Ordering::SeqCst)),
        };

        if self.sequence.load(Ordering::SeqCst) == before {
            Some(status)
        } else {
            None
        }
    }

    pub fn read(&self) -> BatteryStatus {
        loop {
            if let Some(status) = self.try_read() {
                return status;
            }
            core::hint::spin_loop();
        }
    }

    /// Number of completed publishes, wraps.
    pub fn generation(&self) -> u32 {
        self.sequence.load(Ordering::SeqCst) / 2
    }

    pub fn flags(&self) -> BatteryStatusFlags {
        self.read().flags
    }
}

impl Default for SharedBatteryState {
    fn default() -> Self {
        Self::new()
    }
}
