#![no_main]
#![no_std]

//! Firmware entry point: board bring-up, then the RTIC app. Two hardware
//! interrupts drive this firmware: the wire engine's pacing timer (one
//! tick per protocol bit-phase) and a free-running 1kHz tick that gives the
//! foreground super-loop a notion of elapsed time. Everything else —
//! session orchestration, application policy — runs from `#[idle]`.

use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m::asm;
use defmt::println;
use defmt_rtt as _;
use panic_probe as _;

use hal::{clocks::Clocks, pac};

use pyrosense::application::{AppState, ApplicationFsm, WakeupSource};
use pyrosense::drivers::pyd1588::{Arbiter, Config};
use pyrosense::protocols::pyro_wire::WireEngine;

mod setup;

use setup::{HwInitError, PyroWireHal};

/// Free-running millisecond count, advanced by the `millis_tick` task.
/// Wraps silently; every consumer compares elapsed time with wrapping
/// subtraction, so the wrap itself is never a special case.
static MILLIS: AtomicU32 = AtomicU32::new(0);

fn now_ms() -> u32 {
    MILLIS.load(Ordering::Relaxed)
}

/// The node's requested configuration. Chosen to match the original
/// firmware's example deployment rather than the sensor's own power-on
/// default: forced readout, with a 200-count threshold.
fn desired_config() -> Config {
    use pyrosense::drivers::pyd1588::OperatingMode;
    use pyrosense::drivers::pyd1588::SignalSource;

    Config {
        count_mode_unfiltered: false,
        hpf_cutoff_0_2hz: false,
        signal_source: SignalSource::Bpf,
        operating_mode: OperatingMode::ForcedReadout,
        window_time: 1,
        pulse_counter: 2,
        blind_time: 3,
        threshold: 200,
    }
}

/// No wake-up line is wired up at this layer; enabling/disabling it and
/// servicing the interrupt are board-specific and belong to a platform
/// integration, not this core.
struct NoWakeup;

impl WakeupSource for NoWakeup {
    fn enable(&mut self) {}
    fn disable(&mut self) {}
    fn fired(&mut self) -> bool {
        false
    }
}

#[rtic::app(device = pac, peripherals = false, dispatchers = [EXTI9_5])]
mod app {
    use super::*;

    #[shared]
    struct Shared {
        wire_engine: WireEngine<PyroWireHal>,
    }

    #[local]
    struct Local {
        arbiter: Arbiter,
        app_fsm: ApplicationFsm<NoWakeup>,
        millis_timer: setup::MillisTimer,
        loop_i: u32,
    }

    #[init]
    fn init(_cx: init::Context) -> (Shared, Local, init::Monotonics) {
        let dp = pac::Peripherals::take().unwrap();

        let clocks = Clocks::default();
        if clocks.setup().is_err() {
            super::fail_to_halt(HwInitError::ClockConfig);
        }

        let board = match setup::init_board(dp, &clocks) {
            Ok(board) => board,
            Err(e) => super::fail_to_halt(e),
        };

        println!("pyrosense: board init complete");

        (
            Shared {
                wire_engine: WireEngine::new(board.hal),
            },
            Local {
                arbiter: Arbiter::new(),
                app_fsm: ApplicationFsm::new(super::desired_config(), super::NoWakeup),
                millis_timer: board.millis_timer,
                loop_i: 0,
            },
            init::Monotonics(),
        )
    }

    /// The cooperative super-loop: drives the arbiter (which in turn
    /// drives whichever sub-FSM it selects) and the application FSM, once
    /// per iteration, against the free-running millisecond tick. No
    /// blocking calls; every tick returns promptly.
    #[idle(shared = [wire_engine], local = [arbiter, app_fsm, loop_i])]
    fn idle(mut cx: idle::Context) -> ! {
        loop {
            let now = super::now_ms();

            cx.shared.wire_engine.lock(|engine| {
                cx.local.arbiter.tick(engine, now);
            });
            cx.local.app_fsm.tick(cx.local.arbiter, now);

            *cx.local.loop_i = cx.local.loop_i.wrapping_add(1);
            if cfg!(feature = "print-status") && *cx.local.loop_i % 10_000 == 0 {
                println!(
                    "state={} mirrored={} mean={}",
                    match cx.local.app_fsm.state() {
                        AppState::Init => "init",
                        AppState::UpdateConf => "update_conf",
                        AppState::ForceRead => "force_read",
                        AppState::Sleep => "sleep",
                        AppState::HandleInterrupt => "handle_interrupt",
                        AppState::BlindDelay => "blind_delay",
                    },
                    cx.local.arbiter.config.is_mirrored(),
                    cx.local.app_fsm.windowed_mean(),
                );
            }

            asm::nop();
        }
    }

    /// The wire engine's pacing timer interrupt. This is the only place
    /// the Transaction Control Block, SI level, DL direction, and DL level
    /// are mutated while a transaction is in flight.
    #[task(binds = TIM6_DAC_LPTIM1, shared = [wire_engine], priority = 8)]
    fn wire_tick(mut cx: wire_tick::Context) {
        cx.shared.wire_engine.lock(|engine| {
            engine.tick();
        });
    }

    /// Advances the free-running millisecond count the super-loop reads as
    /// `now`. Priority sits above `idle` but below the wire engine's pacing
    /// timer, since a dropped protocol tick breaks a transaction while a
    /// late millisecond tick is merely jitter.
    #[task(binds = TIM7_LPTIM2, local = [millis_timer], priority = 4)]
    fn millis_tick(cx: millis_tick::Context) {
        cx.local.millis_timer.clear_interrupt(hal::timer::TimerInterrupt::Update);
        super::MILLIS.fetch_add(1, Ordering::Relaxed);
    }
}

fn fail_to_halt(err: HwInitError) -> ! {
    setup::fail_to_halt(err)
}

// Same panicking *behavior* as `panic-probe` but doesn't print a panic
// message twice when `defmt::panic` is invoked.
#[defmt::panic_handler]
fn panic() -> ! {
    cortex_m::asm::udf()
}
