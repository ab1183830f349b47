//! Board bring-up: pin assignments, the pacing timer, and the real
//! `WireHal` implementation that wires the wire engine to actual
//! peripherals. Everything here is a build-time constant or a one-shot
//! init function — no runtime configurability, per the sensor's fixed pin
//! layout.

use cortex_m::interrupt;
use defmt::error;

use hal::{
    clocks::Clocks,
    gpio::{OutputType, Pin, PinMode, Port, Pull},
    pac,
    timer::{Timer, TimerConfig, TimerInterrupt},
};

use crate::protocols::pyro_wire::{Level, Ticks, WireHal};

/// SerialIn: MCU-to-sensor upload line.
pub const SI_PORT: Port = Port::C;
pub const SI_PIN: u8 = 2;
/// DirectLink: bidirectional readout / wake line.
pub const DL_PORT: Port = Port::C;
pub const DL_PIN: u8 = 0;

/// Fatal board/peripheral bring-up error. Boot code has no recovery path
/// for this; see `crate::setup::fail_to_halt`.
#[derive(Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum HwInitError {
    ClockConfig,
    TimerConfig,
}

/// Hands peripherals to the wire engine's HAL and the millisecond tick.
pub struct Board {
    pub hal: PyroWireHal,
    pub millis_timer: MillisTimer,
}

/// The pacing timer's hardware binding. TIM6 is a simple basic timer with
/// no output channels, ARR-only — exactly what cycle pacing needs and
/// nothing the wire protocol will ever touch directly.
pub type PacingTimer = Timer<pac::TIM6>;

/// Free-running 1kHz tick driving the foreground super-loop's notion of
/// time. A second basic timer, independent of the wire engine's pacing
/// timer, since the two run at unrelated rates (microseconds vs.
/// milliseconds).
pub type MillisTimer = Timer<pac::TIM7>;

/// Real `WireHal` over two GPIO pins and the pacing timer.
pub struct PyroWireHal {
    si: Pin,
    dl: Pin,
    timer: PacingTimer,
}

impl PyroWireHal {
    fn new(mut si: Pin, mut dl: Pin, mut timer: PacingTimer) -> Self {
        si.output_type(OutputType::PushPull);
        si.set_low();

        dl.output_type(OutputType::OpenDrain);
        dl.pull(Pull::Up);
        dl.set_low();

        timer.enable_interrupt(TimerInterrupt::Update);
        timer.disable();

        Self { si, dl, timer }
    }
}

impl WireHal for PyroWireHal {
    fn set_si(&mut self, level: Level) {
        match level {
            Level::Low => self.si.set_low(),
            Level::High => self.si.set_high(),
        }
    }

    fn set_dl(&mut self, level: Level) {
        match level {
            Level::Low => self.dl.set_low(),
            Level::High => self.dl.set_high(),
        }
    }

    fn set_dl_output(&mut self) {
        self.dl.mode(PinMode::Output);
    }

    fn set_dl_input(&mut self) {
        self.dl.mode(PinMode::Input);
    }

    fn read_dl(&self) -> Level {
        Level::from_bool(self.dl.is_high())
    }

    fn set_reload(&mut self, ticks: Ticks) {
        self.timer.set_auto_reload(ticks as u32);
    }

    fn start_timer(&mut self) -> Result<(), ()> {
        self.timer.reset_count();
        self.timer.enable();
        Ok(())
    }

    fn stop_timer(&mut self) {
        self.timer.disable();
    }

    fn clear_pending_interrupt(&mut self) {
        self.timer.clear_interrupt(TimerInterrupt::Update);
    }
}

/// Bring up the two sensor pins and the pacing timer. The timer's
/// prescaler is chosen so one tick matches the selected timing profile
/// (`profile-a` ~10us, `profile-b` ~100us); the auto-reload value itself is
/// reprogrammed per transaction phase by the wire engine.
pub fn init_board(dp: pac::Peripherals, clocks: &Clocks) -> Result<Board, HwInitError> {
    let si = Pin::new(SI_PORT, SI_PIN, PinMode::Output);
    let dl = Pin::new(DL_PORT, DL_PIN, PinMode::Output);

    cfg_if::cfg_if! {
        if #[cfg(feature = "profile-b")] {
            let tick_freq = 10_000.; // ~100us resolution
        } else {
            let tick_freq = 100_000.; // ~10us resolution
        }
    }

    let pacing_timer = Timer::new_tim6(dp.TIM6, tick_freq, TimerConfig::default(), clocks);

    let mut millis_timer = Timer::new_tim7(dp.TIM7, 1_000., TimerConfig::default(), clocks);
    millis_timer.enable_interrupt(TimerInterrupt::Update);
    millis_timer.enable();

    Ok(Board {
        hal: PyroWireHal::new(si, dl, pacing_timer),
        millis_timer,
    })
}

/// Boot-time hardware init failed. There is no recovery path: log and spin
/// with interrupts disabled, matching the original `error_handler()`.
pub fn fail_to_halt(err: HwInitError) -> ! {
    error!("hardware init failed: {}", err);
    interrupt::disable();
    loop {
        cortex_m::asm::nop();
    }
}
