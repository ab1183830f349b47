//! The outer application state machine: the thing that actually decides
//! when to reconfigure the sensor, when to poll the ADC, when to let the
//! MCU sleep, and how long to stay blind after a motion event.
//!
//! This sits one layer above the session orchestrator
//! ([`crate::drivers::pyd1588`]) and only ever talks to it through the
//! handful of commands named below — it never touches the wire engine or a
//! `WireHal` directly. Sleep-entry thresholds and blind-time duration are
//! policy, not protocol, so they're exposed as `pub` constants a platform
//! integration is expected to retune rather than buried as magic numbers.

use defmt::Format;

use crate::drivers::pyd1588::{Arbiter, Config};

/// Depth of the sliding window used to average incoming ADC samples.
pub const WINDOW_LEN: usize = 16;

/// Minimum magnitude of the windowed mean that counts as "activity" —
/// below this the node is eligible to sleep. Policy constant, tune per
/// installation.
pub const SLEEP_THRESHOLD: i32 = 50;

/// How long (ms) to ignore further motion after handling one, indexed by
/// the configured `blind_time` code. Policy constant.
pub const BLIND_DELAY_MS: [u32; 16] = [
    500, 1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 60_000, 90_000, 120_000, 180_000, 240_000,
    300_000, 420_000, 600_000, 900_000,
];

/// External hook for the sensor's wake-up line. Not implemented here:
/// enabling/disabling the wake interrupt and servicing it are board- and
/// power-mode-specific and live in the platform integration layer.
pub trait WakeupSource {
    fn enable(&mut self);
    fn disable(&mut self);
    /// True once, the tick after the wake-up line has fired.
    fn fired(&mut self) -> bool;
}

#[derive(Clone, Copy, PartialEq, Eq, Format)]
pub enum AppState {
    Init,
    UpdateConf,
    ForceRead,
    Sleep,
    HandleInterrupt,
    BlindDelay,
}

/// Fixed-depth ring sum, avoiding floating point: keeps a running total and
/// divides on read.
struct SlidingWindow {
    samples: [i32; WINDOW_LEN],
    next: usize,
    filled: usize,
    sum: i32,
}

impl SlidingWindow {
    const fn new() -> Self {
        Self {
            samples: [0; WINDOW_LEN],
            next: 0,
            filled: 0,
            sum: 0,
        }
    }

    fn push(&mut self, value: i32) {
        if self.filled == WINDOW_LEN {
            self.sum -= self.samples[self.next];
        } else {
            self.filled += 1;
        }
        self.samples[self.next] = value;
        self.sum += value;
        self.next = (self.next + 1) % WINDOW_LEN;
    }

    fn mean(&self) -> i32 {
        if self.filled == 0 {
            0
        } else {
            self.sum / self.filled as i32
        }
    }
}

/// Drives the Arbiter according to the application-level state graph named
/// in `spec.md` §4.5: `Init -> UpdateConf -> ForceRead -> Sleep ->
/// HandleInterrupt -> BlindDelay -> Init`.
pub struct ApplicationFsm<W: WakeupSource> {
    state: AppState,
    window: SlidingWindow,
    blind_until: u32,
    desired_config: Config,
    wakeup: W,
}

impl<W: WakeupSource> ApplicationFsm<W> {
    pub fn new(desired_config: Config, wakeup: W) -> Self {
        Self {
            state: AppState::Init,
            window: SlidingWindow::new(),
            blind_until: 0,
            desired_config,
            wakeup,
        }
    }

    pub fn state(&self) -> AppState {
        self.state
    }

    pub fn windowed_mean(&self) -> i32 {
        self.window.mean()
    }

    /// Advance the application FSM by one super-loop iteration. `now` is
    /// the free-running millisecond tick; `arbiter` is polled for liveness
    /// (mirrored config, fresh ADC samples) and driven via its commands.
    pub fn tick(&mut self, arbiter: &mut Arbiter, now: u32) {
        match self.state {
            AppState::Init => {
                arbiter.request_config_update(self.desired_config.to_word(), now);
                self.state = AppState::UpdateConf;
            }

            AppState::UpdateConf => {
                if arbiter.config.is_mirrored() {
                    arbiter.start_adc();
                    self.state = AppState::ForceRead;
                }
            }

            AppState::ForceRead => {
                while let Some(sample) = arbiter.adc.try_pop_sample() {
                    self.window.push(sample.adc_value as i32);
                }
                if self.window.mean().unsigned_abs() < SLEEP_THRESHOLD as u32 {
                    arbiter.stop_adc();
                    self.wakeup.enable();
                    self.state = AppState::Sleep;
                }
            }

            AppState::Sleep => {
                if self.wakeup.fired() {
                    self.wakeup.disable();
                    self.state = AppState::HandleInterrupt;
                }
            }

            AppState::HandleInterrupt => {
                let code = (self.desired_config.blind_time & 0xF) as usize;
                self.blind_until = now.wrapping_add(BLIND_DELAY_MS[code]);
                self.state = AppState::BlindDelay;
            }

            AppState::BlindDelay => {
                if now.wrapping_sub(self.blind_until) < u32::MAX / 2 {
                    self.state = AppState::Init;
                }
            }
        }
    }

    /// Queue a new configuration for the session orchestrator to mirror.
    /// Takes effect the next time the FSM re-enters `Init`, or immediately
    /// if it's already there.
    pub fn request_config_update(&mut self, config: Config, arbiter: &mut Arbiter, now: u32) {
        self.desired_config = config;
        arbiter.request_config_update(config.to_word(), now);
        self.state = AppState::UpdateConf;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverWakes;

    impl WakeupSource for NeverWakes {
        fn enable(&mut self) {}
        fn disable(&mut self) {}
        fn fired(&mut self) -> bool {
            false
        }
    }

    #[test]
    fn sliding_window_mean_of_constant_signal() {
        let mut window = SlidingWindow::new();
        for _ in 0..WINDOW_LEN {
            window.push(42);
        }
        assert_eq!(window.mean(), 42);
    }

    #[test]
    fn sliding_window_drops_oldest_once_full() {
        let mut window = SlidingWindow::new();
        for i in 0..WINDOW_LEN {
            window.push(i as i32);
        }
        // window now holds 0..16, mean = 7 (integer division of 120/16)
        assert_eq!(window.mean(), 7);
        window.push(1_000);
        // oldest sample (0) drops out, 1000 enters
        assert!(window.mean() > 7);
    }

    #[test]
    fn init_state_requests_config_update() {
        let mut fsm = ApplicationFsm::new(Config::default(), NeverWakes);
        let mut arbiter = Arbiter::new();
        fsm.tick(&mut arbiter, 0);
        assert_eq!(fsm.state(), AppState::UpdateConf);
        assert_eq!(arbiter.config.requested_word(), Config::default().to_word());
    }
}
