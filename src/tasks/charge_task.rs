use embassy_futures::select::{select, Either};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, signal::Signal};
use embassy_time::{Instant, Timer};

use crate::{battery::TelemetrySource, charge_state::ChargeStateMachine, charger::ChargerDriver};

/// Events that cut a charge task sleep short.
///
/// The signal holds only the latest event. Either one overwriting the other
/// is harmless: the adapter level is read fresh every cycle, and adapter
/// insertion runs the charger bring-up anyway.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargeWake {
    /// adapter detect edge
    AcChanged,
    /// run the charger bring-up sequence on the next cycle
    ChargerInit,
}

/// Raised by the adapter detect interrupt and by anything that wants the
/// charger brought up again, e.g. `static CHARGE_WAKE: ChargeWakeSignal = Signal::new();`
pub type ChargeWakeSignal = Signal<CriticalSectionRawMutex, ChargeWake>;

/// Apply a wake event to the machine before its next cycle.
pub fn handle_wake<T: TelemetrySource, C: ChargerDriver>(machine: &mut ChargeStateMachine<'_, T, C>, wake: ChargeWake) {
    match wake {
        ChargeWake::AcChanged => debug!("ac detect changed, polling early"),
        ChargeWake::ChargerInit => {
            debug!("charger init requested");
            machine.request_charger_init();
        }
    }
}

/// Charge state machine loop.
///
/// Each cycle is scheduled from the start of the previous one, so the time
/// spent talking to the gauge and charger is not added to the poll period.
/// Embassy tasks cannot be generic, the board binary wraps this in its own
/// `#[embassy_executor::task]`.
pub async fn run_charge_task<T: TelemetrySource, C: ChargerDriver>(
    mut machine: ChargeStateMachine<'_, T, C>,
    wake: &ChargeWakeSignal,
) -> ! {
    info!("charge task started, config {}", machine.config());

    loop {
        let cycle_start = Instant::now();
        let interval = machine.advance(cycle_start).await;

        if let Either::Second(event) = select(Timer::at(cycle_start + interval), wake.wait()).await {
            handle_wake(&mut machine, event);
        }
    }
}
