pub mod init;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargerError {
    Timeout,
    Nack,
    /// the requested voltage could not be applied within tolerance
    VoltageOutOfRange,
    /// the requested current could not be applied within tolerance
    CurrentOutOfRange,
    Unsupported,
}

/// Charger temperature ranges with their own termination settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TerminationRange {
    /// standard temperature
    T23,
    /// high temperature
    T34,
    /// above T34. The NTC reads wrong here on some packs, so this range is
    /// programmed like the others and then ignored.
    T40,
}

impl TerminationRange {
    pub const ALL: [TerminationRange; 3] = [TerminationRange::T23, TerminationRange::T34, TerminationRange::T40];

    pub const fn index(self) -> usize {
        match self {
            TerminationRange::T23 => 0,
            TerminationRange::T34 => 1,
            TerminationRange::T40 => 2,
        }
    }
}

/// Per cell termination voltage codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TermVoltage {
    V2000,
    V2050,
    V2100,
    V2150,
}

/// Termination current as a fraction of the charger's taper base current.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TermCurrent {
    I0250,
    I0500,
    I0750,
    I1000,
}

impl TermCurrent {
    pub const fn percent(self) -> u32 {
        match self {
            TermCurrent::I0250 => 25,
            TermCurrent::I0500 => 50,
            TermCurrent::I0750 => 75,
            TermCurrent::I1000 => 100,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FastChargeTimeout {
    Hours4,
    Hours5,
    Hours6,
    Hours7,
}

/// Static description of the charger IC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargerInfo {
    pub voltage_min_mv: u32,
    pub voltage_max_mv: u32,
    pub voltage_step_mv: u32,
    pub current_min_ma: u32,
    pub current_max_ma: u32,
    pub current_step_ma: u32,
    /// 100% termination current
    pub termination_base_ma: u32,
}

impl ChargerInfo {
    /// Nearest voltage the charger can actually regulate to, rounding down.
    pub fn closest_voltage(&self, voltage_mv: u32) -> u32 {
        if voltage_mv == 0 {
            return 0;
        }

        let clamped = voltage_mv.clamp(self.voltage_min_mv, self.voltage_max_mv);
        clamped - (clamped - self.voltage_min_mv) % self.voltage_step_mv.max(1)
    }

    /// Nearest current the charger can regulate to, rounding down. Zero stays
    /// zero so "not charging" is never turned into a minimum trickle.
    pub fn closest_current(&self, current_ma: u32) -> u32 {
        if current_ma == 0 {
            return 0;
        }

        let clamped = current_ma.clamp(self.current_min_ma, self.current_max_ma);
        clamped - (clamped - self.current_min_ma) % self.current_step_ma.max(1)
    }

    pub fn termination_current_ma(&self, term_current: TermCurrent) -> u32 {
        self.termination_base_ma * term_current.percent() / 100
    }
}

/// Voltage/current pair written to the charger limit registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargerSetpoint {
    pub voltage_mv: u32,
    pub current_ma: u32,
}

impl ChargerSetpoint {
    pub const OFF: ChargerSetpoint = ChargerSetpoint { voltage_mv: 0, current_ma: 0 };

    pub const fn new(voltage_mv: u32, current_ma: u32) -> Self {
        Self { voltage_mv, current_ma }
    }

    pub const fn is_charging(&self) -> bool {
        self.current_ma > 0
    }
}

/// Outcome of the most recent charger driver calls, fed back into the error
/// aggregation on the following cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargerStatus {
    pub init: Result<(), ChargerError>,
    pub limits: Result<(), ChargerError>,
}

impl ChargerStatus {
    pub const fn new() -> Self {
        Self { init: Ok(()), limits: Ok(()) }
    }
}

impl Default for ChargerStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Register level access to the charger IC, provided by the board.
#[allow(async_fn_in_trait)]
pub trait ChargerDriver {
    /// Probe/reset the IC.
    async fn init(&mut self) -> Result<(), ChargerError>;

    async fn set_limits(&mut self, voltage_mv: u32, current_ma: u32) -> Result<(), ChargerError>;

    async fn set_termination(&mut self, range: TerminationRange, voltage: TermVoltage, current: TermCurrent) -> Result<(), ChargerError>;

    async fn set_fast_charge_timeout(&mut self, timeout: FastChargeTimeout) -> Result<(), ChargerError>;

    /// Hand charge enable over to the external CHARGER_EN line.
    async fn enable_external_control(&mut self, enable: bool) -> Result<(), ChargerError>;

    /// Force charging on regardless of the enable line.
    async fn enable_charger(&mut self, enable: bool) -> Result<(), ChargerError>;

    async fn set_low_current_charging(&mut self, enable: bool) -> Result<(), ChargerError>;

    /// Silicon revision.
    async fn version(&mut self) -> Result<u8, ChargerError>;
}
