/*
 * Charger bring-up. Runs once at boot and again whenever the charger may
 * have lost its configuration (brownout on adapter removal, a failed write).
 *
 * The register writes are applied in a fixed order and the first failure
 * ends the run. Nothing is rolled back: a partially configured charger sits
 * in its power-on defaults for the remaining registers, which are safe.
 */

use super::{ChargerDriver, ChargerError, FastChargeTimeout, TermCurrent, TermVoltage, TerminationRange};

/// Termination voltage/current for one temperature range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TerminationSetting {
    pub range: TerminationRange,
    pub voltage: TermVoltage,
    pub current: TermCurrent,
}

/// Board specific charger bring-up values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChargerProfile {
    pub fast_charge_timeout: FastChargeTimeout,
    /// programmed in this order
    pub terminations: [TerminationSetting; 3],
    /// silicon revisions below this get `legacy_term_current` on every range
    pub legacy_revision_below: u8,
    pub legacy_term_current: TermCurrent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitStep {
    FastChargeTimeout(FastChargeTimeout),
    ExternalControl(bool),
    ForceCharging(bool),
    LowCurrentCharging(bool),
    TermVoltage(TerminationRange, TermVoltage),
    TermCurrent(TerminationRange, TermCurrent),
}

/// Termination values as last written to the charger, indexed by range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TerminationSettings {
    settings: [TerminationSetting; 3],
}

impl TerminationSettings {
    pub fn from_profile(profile: &ChargerProfile) -> Self {
        let mut settings = profile.terminations;
        // keep storage ordered by range regardless of programming order
        settings.sort_unstable_by_key(|s| s.range.index());
        Self { settings }
    }

    pub fn get(&self, range: TerminationRange) -> TerminationSetting {
        self.settings[range.index()]
    }

    fn record(&mut self, step: InitStep) {
        match step {
            InitStep::TermVoltage(range, voltage) => self.settings[range.index()].voltage = voltage,
            InitStep::TermCurrent(range, current) => self.settings[range.index()].current = current,
            _ => {}
        }
    }
}

/// Base bring-up steps, in the order they hit the hardware.
pub fn base_sequence(profile: &ChargerProfile) -> impl Iterator<Item = InitStep> + '_ {
    [
        InitStep::FastChargeTimeout(profile.fast_charge_timeout),
        InitStep::ExternalControl(true),
        InitStep::ForceCharging(false),
        InitStep::LowCurrentCharging(true),
    ]
    .into_iter()
    .chain(profile.terminations.iter().flat_map(|t| {
        [
            InitStep::TermVoltage(t.range, t.voltage),
            InitStep::TermCurrent(t.range, t.current),
        ]
    }))
}

/// Extra steps for early silicon, appended after the base sequence.
pub fn legacy_sequence(profile: &ChargerProfile) -> impl Iterator<Item = InitStep> + '_ {
    profile
        .terminations
        .iter()
        .map(move |t| InitStep::TermCurrent(t.range, profile.legacy_term_current))
}

async fn apply_step<C: ChargerDriver>(charger: &mut C, settings: &mut TerminationSettings, step: InitStep) -> Result<(), ChargerError> {
    trace!("charger init step {}", step);
    match step {
        InitStep::FastChargeTimeout(timeout) => charger.set_fast_charge_timeout(timeout).await,
        InitStep::ExternalControl(enable) => charger.enable_external_control(enable).await,
        InitStep::ForceCharging(enable) => charger.enable_charger(enable).await,
        InitStep::LowCurrentCharging(enable) => charger.set_low_current_charging(enable).await,
        InitStep::TermVoltage(range, _) | InitStep::TermCurrent(range, _) => {
            // the driver takes voltage and current together, the half not
            // named by this step keeps its most recent value
            settings.record(step);
            let setting = settings.get(range);
            charger.set_termination(range, setting.voltage, setting.current).await
        }
    }
}

/// Run the full bring-up sequence. Returns the termination values now held
/// by the charger, or the first error hit.
pub async fn initialize_charger<C: ChargerDriver>(charger: &mut C, profile: &ChargerProfile) -> Result<TerminationSettings, ChargerError> {
    charger.init().await?;

    let mut settings = TerminationSettings::from_profile(profile);
    for step in base_sequence(profile) {
        apply_step(charger, &mut settings, step).await?;
    }

    // an unreadable revision is treated as early silicon
    let legacy = match charger.version().await {
        Ok(version) => version < profile.legacy_revision_below,
        Err(_) => true,
    };

    if legacy {
        debug!("charger silicon predates rev {}, lowering termination current", profile.legacy_revision_below);
        for step in legacy_sequence(profile) {
            apply_step(charger, &mut settings, step).await?;
        }
    }

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CHARGER_PROFILE;
    use embassy_futures::block_on;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Call {
        Init,
        Limits(u32, u32),
        Termination(TerminationRange, TermVoltage, TermCurrent),
        FastCharge(FastChargeTimeout),
        ExternalControl(bool),
        ForceCharging(bool),
        LowCurrent(bool),
        Version,
    }

    struct RecordingCharger {
        calls: Vec<Call>,
        fail_at: Option<usize>,
        version: Result<u8, ChargerError>,
    }

    impl RecordingCharger {
        fn new(version: Result<u8, ChargerError>) -> Self {
            Self { calls: Vec::new(), fail_at: None, version }
        }

        fn record(&mut self, call: Call) -> Result<(), ChargerError> {
            let index = self.calls.len();
            self.calls.push(call);
            if self.fail_at == Some(index) {
                Err(ChargerError::Nack)
            } else {
                Ok(())
            }
        }

        fn termination_writes(&self) -> Vec<Call> {
            self.calls.iter().copied().filter(|c| matches!(c, Call::Termination(..))).collect()
        }
    }

    impl ChargerDriver for RecordingCharger {
        async fn init(&mut self) -> Result<(), ChargerError> {
            self.record(Call::Init)
        }

        async fn set_limits(&mut self, voltage_mv: u32, current_ma: u32) -> Result<(), ChargerError> {
            self.record(Call::Limits(voltage_mv, current_ma))
        }

        async fn set_termination(&mut self, range: TerminationRange, voltage: TermVoltage, current: TermCurrent) -> Result<(), ChargerError> {
            self.record(Call::Termination(range, voltage, current))
        }

        async fn set_fast_charge_timeout(&mut self, timeout: FastChargeTimeout) -> Result<(), ChargerError> {
            self.record(Call::FastCharge(timeout))
        }

        async fn enable_external_control(&mut self, enable: bool) -> Result<(), ChargerError> {
            self.record(Call::ExternalControl(enable))
        }

        async fn enable_charger(&mut self, enable: bool) -> Result<(), ChargerError> {
            self.record(Call::ForceCharging(enable))
        }

        async fn set_low_current_charging(&mut self, enable: bool) -> Result<(), ChargerError> {
            self.record(Call::LowCurrent(enable))
        }

        async fn version(&mut self) -> Result<u8, ChargerError> {
            self.record(Call::Version)?;
            self.version
        }
    }

    #[test]
    fn sequence_runs_in_order() {
        let mut charger = RecordingCharger::new(Ok(3));
        let settings = block_on(initialize_charger(&mut charger, &CHARGER_PROFILE)).unwrap();

        assert_eq!(&charger.calls[..5], &[
            Call::Init,
            Call::FastCharge(FastChargeTimeout::Hours6),
            Call::ExternalControl(true),
            Call::ForceCharging(false),
            Call::LowCurrent(true),
        ]);

        // voltage then current for each range, in profile order
        let expected_ranges = [TerminationRange::T34, TerminationRange::T34,
            TerminationRange::T23, TerminationRange::T23,
            TerminationRange::T40, TerminationRange::T40];
        let writes = charger.termination_writes();
        assert_eq!(writes.len(), expected_ranges.len());
        for (write, range) in writes.iter().zip(expected_ranges) {
            assert!(matches!(write, Call::Termination(r, _, _) if *r == range));
        }

        assert_eq!(charger.calls.last(), Some(&Call::Version));
        for t in CHARGER_PROFILE.terminations {
            assert_eq!(settings.get(t.range), t);
        }
    }

    #[test]
    fn legacy_silicon_lowers_termination_current() {
        let mut charger = RecordingCharger::new(Ok(2));
        let settings = block_on(initialize_charger(&mut charger, &CHARGER_PROFILE)).unwrap();

        let writes = charger.termination_writes();
        assert_eq!(writes.len(), 9);
        for range in TerminationRange::ALL {
            assert_eq!(settings.get(range).current, CHARGER_PROFILE.legacy_term_current);
        }
        assert_eq!(charger.calls.last(), Some(&Call::Termination(TerminationRange::T40, TermVoltage::V2100, TermCurrent::I0750)));
    }

    #[test]
    fn unreadable_version_counts_as_legacy() {
        let mut charger = RecordingCharger::new(Err(ChargerError::Timeout));
        let settings = block_on(initialize_charger(&mut charger, &CHARGER_PROFILE)).unwrap();
        assert_eq!(settings.get(TerminationRange::T23).current, CHARGER_PROFILE.legacy_term_current);
    }

    #[test]
    fn first_failure_stops_the_sequence() {
        let mut charger = RecordingCharger::new(Ok(3));
        // fail the external control write
        charger.fail_at = Some(2);

        let result = block_on(initialize_charger(&mut charger, &CHARGER_PROFILE));
        assert_eq!(result, Err(ChargerError::Nack));
        assert_eq!(charger.calls.len(), 3);
        assert!(charger.termination_writes().is_empty());
    }

    #[test]
    fn repeated_runs_program_the_same_values() {
        let mut charger = RecordingCharger::new(Ok(2));
        let first = block_on(initialize_charger(&mut charger, &CHARGER_PROFILE)).unwrap();
        let first_writes = charger.termination_writes();

        charger.calls.clear();
        let second = block_on(initialize_charger(&mut charger, &CHARGER_PROFILE)).unwrap();

        assert_eq!(first, second);
        assert_eq!(first_writes, charger.termination_writes());
    }

    #[test]
    fn settings_are_indexed_by_range() {
        let settings = TerminationSettings::from_profile(&CHARGER_PROFILE);
        for range in TerminationRange::ALL {
            assert_eq!(settings.get(range).range, range);
        }
    }
}
