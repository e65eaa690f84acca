/*
 * Charge state machine.
 *
 * One call to `advance` is one poll cycle: read telemetry, rebuild the error
 * mask, resolve the charging state, command the charger, publish the
 * battery status, and hand back how long the caller should sleep before the
 * next cycle.
 *
 * ASSUMPTIONS:
 * 1. Exactly one task owns the machine and never calls `advance` reentrantly.
 * 2. The charger comes out of reset in a non-charging default, so a failed
 *   init or limit write never leaves it charging on its own.
 * 3. Telemetry and charger calls complete (or fail) within the shortest poll
 *   period. Timeouts live in the drivers.
 *
 * GUARANTEES:
 * 1. No nonzero charge current is requested without external power, or in
 *   the Idle and Error states.
 * 2. A fault must persist for the configured number of cycles before it
 *   forces Error, and must stay clear for as many cycles before Error is left.
 * 3. Nothing in a cycle is fatal, every call produces a state and a sleep.
 */

use bitflags::bitflags;
use embassy_time::{Duration, Instant};

use crate::{
    battery::{BatteryInfo, BatteryParams, TelemetrySource, TemperatureClass},
    charger::{
        init::{initialize_charger, ChargerProfile, TerminationSettings},
        ChargerDriver, ChargerInfo, ChargerSetpoint, ChargerStatus, TerminationRange,
    },
    config::ChargeConfig,
    debounce::Debouncer,
    error_flags::ErrorFlags,
    power_state::{BatteryStatus, BatteryStatusFlags, SharedBatteryState},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargeState {
    /// before the first cycle
    Init,
    /// external power present, not charging
    Idle,
    /// running from the battery
    Discharge,
    /// low current ramp (or trickle for a deeply discharged pack)
    PreCharge,
    Charge,
    /// terminated, charger holds maintenance current
    Full,
    Error,
}

impl ChargeState {
    pub const fn is_charging(self) -> bool {
        matches!(self, ChargeState::PreCharge | ChargeState::Charge | ChargeState::Full)
    }
}

bitflags! {
    /// Faults decided by charging policy rather than reported by hardware.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct PolicyFaults: u16 {
        /// pack outside its charging temperature band
        const OVER_TEMPERATURE = 1 << 0;
        /// pre-charge made no progress within the trickle timeout
        const TRICKLE_STALLED = 1 << 1;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for PolicyFaults {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "PolicyFaults({=u16:#x})", self.bits())
    }
}

/// Everything one cycle observed and decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargeStateData {
    pub ac: bool,
    pub charging_voltage_mv: u32,
    pub charging_current_ma: u32,
    pub battery: BatteryParams,
    pub state: ChargeState,
    pub error: ErrorFlags,
    pub timestamp: Instant,
}

impl ChargeStateData {
    pub const fn initial(timestamp: Instant) -> Self {
        Self {
            ac: false,
            charging_voltage_mv: 0,
            charging_current_ma: 0,
            battery: BatteryParams::unknown(),
            state: ChargeState::Init,
            error: ErrorFlags::empty(),
            timestamp,
        }
    }
}

fn elapsed(now: Instant, since: Instant) -> Duration {
    now.checked_duration_since(since).unwrap_or(Duration::from_ticks(0))
}

/// State carried between cycles.
pub struct ChargeStateContext<'a> {
    pub curr: ChargeStateData,
    pub prev: ChargeStateData,
    pub charge_state_updated_time: Instant,

    shared_battery_state: &'a SharedBatteryState,

    // charger and battery pack info
    pub charger_info: ChargerInfo,
    pub battery_info: BatteryInfo,
    pub charger_profile: ChargerProfile,

    // charging timestamps
    pub charger_update_time: Option<Instant>,
    pub trickle_charging_time: Option<Instant>,
    pub voltage_debounce_time: Option<Instant>,
    pub shutdown_warning_time: Option<Instant>,
    pub battery_responsive: bool,

    trickle_start_soc: u8,
    trickle_stalled: bool,
    pending_voltage_mv: u32,
    shutdown_warning: bool,
    init_requested: bool,

    // last write attempted on the limit registers, None forces the next write
    last_setpoint: Option<ChargerSetpoint>,
    charger_status: ChargerStatus,
    termination: TerminationSettings,

    fault_debouncer: Debouncer<ErrorFlags>,
    policy_debouncer: Debouncer<PolicyFaults>,
}

impl<'a> ChargeStateContext<'a> {
    pub fn new(
        shared_battery_state: &'a SharedBatteryState,
        battery_info: BatteryInfo,
        charger_info: ChargerInfo,
        charger_profile: ChargerProfile,
        config: &ChargeConfig,
        now: Instant,
    ) -> Self {
        Self {
            curr: ChargeStateData::initial(now),
            prev: ChargeStateData::initial(now),
            charge_state_updated_time: now,
            shared_battery_state,
            charger_info,
            battery_info,
            charger_profile,
            charger_update_time: None,
            trickle_charging_time: None,
            voltage_debounce_time: None,
            shutdown_warning_time: None,
            battery_responsive: false,
            trickle_start_soc: 0,
            trickle_stalled: false,
            pending_voltage_mv: 0,
            shutdown_warning: false,
            init_requested: false,
            last_setpoint: None,
            charger_status: ChargerStatus::new(),
            termination: TerminationSettings::from_profile(&charger_profile),
            fault_debouncer: Debouncer::symmetric(config.fault_hold_cycles),
            // policy faults stop charging at once but release slowly
            policy_debouncer: Debouncer::new(1, config.fault_hold_cycles),
        }
    }

    pub fn latched_faults(&self) -> ErrorFlags {
        self.fault_debouncer.latched()
    }

    pub fn policy_faults(&self) -> PolicyFaults {
        self.policy_debouncer.latched()
    }

    pub fn charger_status(&self) -> ChargerStatus {
        self.charger_status
    }

    pub fn termination(&self) -> TerminationSettings {
        self.termination
    }

    pub fn shutdown_warning(&self) -> bool {
        self.shutdown_warning
    }

    /// Values the host sees for the current cycle.
    pub fn battery_status(&self, config: &ChargeConfig) -> BatteryStatus {
        let curr = &self.curr;
        let battery = &curr.battery;

        let mut flags = BatteryStatusFlags::empty();
        flags.set(BatteryStatusFlags::AC_PRESENT, curr.ac);
        flags.set(BatteryStatusFlags::BATT_PRESENT, battery.present);
        flags.set(BatteryStatusFlags::DISCHARGING, curr.state == ChargeState::Discharge);
        flags.set(BatteryStatusFlags::CHARGING, matches!(curr.state, ChargeState::PreCharge | ChargeState::Charge));
        flags.set(BatteryStatusFlags::LEVEL_CRITICAL, battery.present && battery.state_of_charge <= config.level_critical);
        flags.set(BatteryStatusFlags::SHUTDOWN_WARNING, self.shutdown_warning);
        flags.set(BatteryStatusFlags::CHARGER_FAULT, curr.error.charger_fault());
        flags.set(BatteryStatusFlags::BATTERY_FAULT, curr.error.battery_fault());

        BatteryStatus {
            voltage_mv: battery.voltage_mv,
            rate_ma: battery.current_ma,
            remaining_capacity_mah: battery.remaining_capacity_mah,
            flags,
        }
    }

    fn termination_current_ma(&self, temperature: TemperatureClass) -> u32 {
        let range = match temperature {
            TemperatureClass::High => TerminationRange::T34,
            _ => TerminationRange::T23,
        };

        self.charger_info.termination_current_ma(self.termination.get(range).current)
    }

    fn battery_full(&self, prev_state: ChargeState, battery: &BatteryParams, config: &ChargeConfig) -> bool {
        if prev_state == ChargeState::Full {
            return battery.state_of_charge >= config.level_recharge;
        }

        let temperature = self.battery_info.temperature_class(battery);
        battery.state_of_charge >= config.level_full
            && battery.current_ma.unsigned_abs() < self.termination_current_ma(temperature)
    }

    fn precharge_complete(&self, battery: &BatteryParams, now: Instant, config: &ChargeConfig) -> bool {
        elapsed(now, self.charge_state_updated_time) >= config.precharge_ramp_time
            && battery.voltage_mv >= self.battery_info.voltage_min_mv
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_state(
        &self,
        ac: bool,
        battery: &BatteryParams,
        error: ErrorFlags,
        latched: ErrorFlags,
        policy: PolicyFaults,
        now: Instant,
        config: &ChargeConfig,
    ) -> ChargeState {
        let prev_state = self.curr.state;

        if !ac {
            return ChargeState::Discharge;
        }

        if !latched.is_empty() {
            return ChargeState::Error;
        }

        // leaving Error always passes through Idle
        if prev_state == ChargeState::Error {
            return if policy.is_empty() { ChargeState::Idle } else { ChargeState::Error };
        }

        // battery fault still debouncing, ride it out without starting anything
        if error.battery_fault() {
            return if prev_state.is_charging() { prev_state } else { ChargeState::Idle };
        }

        if self.battery_full(prev_state, battery, config) {
            return ChargeState::Full;
        }

        if !policy.is_empty() {
            return ChargeState::Error;
        }

        match prev_state {
            ChargeState::Init | ChargeState::Idle | ChargeState::Discharge => ChargeState::PreCharge,
            ChargeState::PreCharge => {
                if self.precharge_complete(battery, now, config) {
                    ChargeState::Charge
                } else {
                    ChargeState::PreCharge
                }
            }
            ChargeState::Charge | ChargeState::Full => ChargeState::Charge,
            ChargeState::Error => ChargeState::Idle,
        }
    }

    fn requested_setpoint(&self, state: ChargeState, battery: &BatteryParams, config: &ChargeConfig) -> ChargerSetpoint {
        let (voltage_mv, current_ma) = match state {
            ChargeState::PreCharge => (self.battery_info.charging_voltage(battery), self.battery_info.precharge_current_ma),
            ChargeState::Charge => (self.battery_info.charging_voltage(battery), self.battery_info.charging_current(battery)),
            ChargeState::Full => (self.battery_info.charging_voltage(battery), config.full_maintenance_current_ma),
            ChargeState::Init | ChargeState::Idle | ChargeState::Discharge | ChargeState::Error => return ChargerSetpoint::OFF,
        };

        ChargerSetpoint::new(
            self.charger_info.closest_voltage(voltage_mv),
            self.charger_info.closest_current(current_ma),
        )
    }

    /// Hold back charging voltage changes until they have been stable for the
    /// debounce time. Current is never held back.
    fn debounce_voltage(&mut self, requested: ChargerSetpoint, now: Instant, config: &ChargeConfig) -> ChargerSetpoint {
        let committed = match self.last_setpoint {
            Some(setpoint) if setpoint.is_charging() && requested.is_charging() => setpoint,
            // first setpoint of a charging session, or not charging at all
            _ => {
                self.voltage_debounce_time = None;
                return requested;
            }
        };

        if committed.voltage_mv == requested.voltage_mv {
            self.voltage_debounce_time = None;
            return requested;
        }

        let since = match self.voltage_debounce_time {
            Some(since) if self.pending_voltage_mv == requested.voltage_mv => since,
            _ => {
                self.pending_voltage_mv = requested.voltage_mv;
                self.voltage_debounce_time = Some(now);
                now
            }
        };

        if elapsed(now, since) >= config.voltage_debounce_time {
            self.voltage_debounce_time = None;
            requested
        } else {
            ChargerSetpoint::new(committed.voltage_mv, requested.current_ma)
        }
    }

    fn update_trickle_timer(&mut self, state: ChargeState, battery: &BatteryParams, now: Instant, config: &ChargeConfig) {
        if state != ChargeState::PreCharge {
            self.trickle_charging_time = None;
            return;
        }

        match self.trickle_charging_time {
            Some(start) if battery.state_of_charge <= self.trickle_start_soc => {
                if !self.trickle_stalled && elapsed(now, start) > config.trickle_charge_timeout {
                    warn!("pre-charge stalled at {}%", battery.state_of_charge);
                    self.trickle_stalled = true;
                }
            }
            // first pre-charge cycle, or the pack is making progress
            _ => {
                self.trickle_charging_time = Some(now);
                self.trickle_start_soc = battery.state_of_charge;
            }
        }
    }

    fn update_shutdown_warning(&mut self, ac: bool, battery: &BatteryParams, now: Instant, config: &ChargeConfig) {
        if ac || !battery.present || battery.state_of_charge > config.level_shutdown {
            self.shutdown_warning_time = None;
            self.shutdown_warning = false;
            return;
        }

        let start = *self.shutdown_warning_time.get_or_insert(now);
        if !self.shutdown_warning && elapsed(now, start) >= config.shutdown_warning_time {
            warn!("battery at {}%, requesting host shutdown", battery.state_of_charge);
            self.shutdown_warning = true;
        }
    }

    fn poll_interval(&self, state: ChargeState, ac: bool, battery: &BatteryParams, config: &ChargeConfig) -> Duration {
        let base = match state {
            ChargeState::Init | ChargeState::Idle | ChargeState::Discharge => config.poll_period_very_long,
            ChargeState::PreCharge | ChargeState::Error => config.poll_period_long,
            ChargeState::Charge | ChargeState::Full => config.poll_period_charge,
        };

        let near_full = state == ChargeState::Charge && battery.state_of_charge >= config.level_near_full;
        let near_critical = !ac && battery.present && battery.state_of_charge <= config.level_critical;
        let debouncing = !self.fault_debouncer.pending().is_empty() || !self.policy_debouncer.pending().is_empty();
        // idle on external power only lasts until charging resumes
        let resuming = ac && state == ChargeState::Idle;

        let period = if near_full || near_critical || debouncing || resuming {
            base.min(config.poll_period_short)
        } else {
            base
        };

        config.clamp_sleep(period)
    }
}

/// Owns the charge context and the hardware it acts through.
pub struct ChargeStateMachine<'a, T: TelemetrySource, C: ChargerDriver> {
    context: ChargeStateContext<'a>,
    telemetry: T,
    charger: C,
    config: ChargeConfig,
}

impl<'a, T: TelemetrySource, C: ChargerDriver> ChargeStateMachine<'a, T, C> {
    pub fn new(context: ChargeStateContext<'a>, telemetry: T, charger: C, config: ChargeConfig) -> Self {
        Self { context, telemetry, charger, config }
    }

    pub fn context(&self) -> &ChargeStateContext<'a> {
        &self.context
    }

    pub fn config(&self) -> &ChargeConfig {
        &self.config
    }

    pub fn state(&self) -> ChargeState {
        self.context.curr.state
    }

    pub fn telemetry_mut(&mut self) -> &mut T {
        &mut self.telemetry
    }

    pub fn charger_mut(&mut self) -> &mut C {
        &mut self.charger
    }

    /// Force the charger bring-up sequence on the next cycle with the adapter
    /// present, e.g. after a brownout was detected elsewhere.
    pub fn request_charger_init(&mut self) {
        self.context.init_requested = true;
    }

    async fn init_charger(&mut self) {
        match initialize_charger(&mut self.charger, &self.context.charger_profile).await {
            Ok(termination) => {
                if self.context.charger_status.init.is_err() {
                    info!("charger initialized");
                }
                self.context.termination = termination;
                self.context.charger_status.init = Ok(());
                // nothing has been written to the fresh registers yet
                self.context.charger_status.limits = Ok(());
            }
            Err(err) => {
                warn!("charger init failed: {}", err);
                self.context.charger_status.init = Err(err);
            }
        }

        // registers may have reset, rewrite the limits
        self.context.init_requested = false;
        self.context.last_setpoint = None;
    }

    async fn commit_setpoint(&mut self, setpoint: ChargerSetpoint, ac: bool, now: Instant) {
        let ctx = &mut self.context;

        let refresh_due = setpoint.is_charging()
            && ctx.charger_update_time.map_or(true, |t| elapsed(now, t) >= self.config.charger_update_period);
        let retry = ac && ctx.charger_status.limits.is_err();

        if ctx.last_setpoint == Some(setpoint) && !refresh_due && !retry {
            return;
        }

        let result = self.charger.set_limits(setpoint.voltage_mv, setpoint.current_ma).await;
        match result {
            Ok(()) => ctx.charger_update_time = Some(now),
            Err(err) if ac => warn!("charger rejected {} mV / {} mA: {}", setpoint.voltage_mv, setpoint.current_ma, err),
            Err(err) => debug!("charger unpowered, limit write failed: {}", err),
        }

        ctx.last_setpoint = Some(setpoint);
        // an unpowered charger is not a faulty one
        ctx.charger_status.limits = if ac { result } else { Ok(()) };
    }

    /// Run one poll cycle at `now`. Returns the time to sleep before the next.
    pub async fn advance(&mut self, now: Instant) -> Duration {
        let prev = self.context.curr;
        let ac = self.telemetry.read_ac_present();

        if !ac {
            // the charger browns out without the adapter, results from the
            // last powered session no longer describe it
            self.context.charger_status = ChargerStatus::new();
        }

        let reading = self.telemetry.read_battery_params().await;
        let battery = match &reading {
            Ok(params) => *params,
            Err(err) => {
                warn!("battery telemetry failed: {}", err);
                BatteryParams::stale(&prev.battery)
            }
        };
        self.context.battery_responsive = reading.is_ok();

        // charger results reach the mask one cycle after the call that produced them
        let error = ErrorFlags::aggregate(&reading, &self.context.charger_status, &self.context.battery_info);
        let latched = self.context.fault_debouncer.update(error);

        // bring-up on adapter insertion (including power up on the adapter),
        // on request, and while any charger call is failing
        let ac_inserted = ac && !prev.ac;
        if ac && (ac_inserted || self.context.init_requested || error.charger_fault()) {
            self.init_charger().await;
        }

        let ctx = &mut self.context;
        let config = &self.config;

        if !ac {
            // adapter removal is the only way out of a stalled pre-charge
            ctx.trickle_stalled = false;
            ctx.policy_debouncer.reset();
        }

        let mut policy = PolicyFaults::empty();
        let temperature = ctx.battery_info.temperature_class(&battery);
        policy.set(
            PolicyFaults::OVER_TEMPERATURE,
            ac && battery.present && matches!(temperature, TemperatureClass::TooCold | TemperatureClass::TooHot),
        );
        policy.set(PolicyFaults::TRICKLE_STALLED, ctx.trickle_stalled);
        let policy = if ac { ctx.policy_debouncer.update(policy) } else { PolicyFaults::empty() };

        let state = ctx.resolve_state(ac, &battery, error, latched, policy, now, config);
        if state != prev.state {
            info!("charge state {} -> {} (errors {}, policy {})", prev.state, state, error, policy);
            ctx.charge_state_updated_time = now;
        }

        ctx.update_trickle_timer(state, &battery, now, config);
        ctx.update_shutdown_warning(ac, &battery, now, config);

        let requested = ctx.requested_setpoint(state, &battery, config);
        let setpoint = ctx.debounce_voltage(requested, now, config);

        ctx.prev = prev;
        ctx.curr = ChargeStateData {
            ac,
            charging_voltage_mv: setpoint.voltage_mv,
            charging_current_ma: setpoint.current_ma,
            battery,
            state,
            error,
            timestamp: now,
        };

        self.commit_setpoint(setpoint, ac, now).await;

        let ctx = &self.context;
        let status = ctx.battery_status(&self.config);
        ctx.shared_battery_state.publish(&status);

        let interval = ctx.poll_interval(state, ac, &battery, &self.config);
        debug!(
            "charge cycle: state {} ac {} soc {}% {} mV {} mA, next in {} ms",
            state,
            ac,
            battery.state_of_charge,
            battery.voltage_mv,
            battery.current_ma,
            interval.as_millis()
        );

        interval
    }
}
