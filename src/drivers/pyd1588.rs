//! Layer L1: the session orchestrator for a PYD1588-class PIR sensor.
//!
//! Drives the wire-level [`WireEngine`](crate::protocols::pyro_wire::WireEngine)
//! through three cooperating pieces: the configuration sub-FSM (write, wait,
//! read back, compare, retry), the ADC sub-FSM (periodic short reads into a
//! ring buffer), and the arbiter that serializes the two over the single
//! engine. All three are ticked once per super-loop iteration from foreground
//! code; none of them touch the engine's `WireHal` directly.

use defmt::Format;
use num_enum::TryFromPrimitive;

use crate::protocols::pyro_wire::{FrameType, WireEngine, WireHal, CONFIG_BITS, FULL_FRAME_BITS};

pub const CONF_APPLY_DELAY: u32 = 3;
pub const READY_TIMEOUT: u32 = 6;
pub const READ_RETRIES: u32 = 2;
pub const CONF_CHECK_RETRIES: u32 = 2;
pub const ADC_READ_DELAY: u32 = 75;

/// Matches the four-slot ADC ring the original driver uses.
pub const ADC_RING_CAPACITY: usize = 4;

/// Signal conditioning path feeding the level detector (`spec.md` §3).
#[derive(Clone, Copy, PartialEq, Eq, Format, TryFromPrimitive)]
#[repr(u8)]
pub enum SignalSource {
    Bpf = 0,
    Lpf = 1,
    Reserved = 2,
    Temperature = 3,
}

/// Readout mode the sensor is configured for.
#[derive(Clone, Copy, PartialEq, Eq, Format, TryFromPrimitive)]
#[repr(u8)]
pub enum OperatingMode {
    ForcedReadout = 0,
    InterruptReadout = 1,
    Wakeup = 2,
    Reserved = 3,
}

/// The sensor's 25-bit configuration word, unpacked into named fields.
/// `reserved_A` and `reserved_B` aren't represented: they're fixed, and
/// `to_word` always emits their required values.
#[derive(Clone, Copy, PartialEq, Eq, Format)]
pub struct Config {
    pub count_mode_unfiltered: bool,
    pub hpf_cutoff_0_2hz: bool,
    pub signal_source: SignalSource,
    pub operating_mode: OperatingMode,
    pub window_time: u8,
    pub pulse_counter: u8,
    pub blind_time: u8,
    pub threshold: u8,
}

const RESERVED_B: u32 = 0b10;

impl Config {
    /// Unpack a 25-bit wire word into a `Config`. Bits above 24 are ignored.
    pub fn from_word(word: u32) -> Self {
        Self {
            count_mode_unfiltered: word & 0x1 != 0,
            hpf_cutoff_0_2hz: (word >> 2) & 0x1 != 0,
            signal_source: SignalSource::try_from_primitive(((word >> 5) & 0x3) as u8)
                .unwrap_or(SignalSource::Bpf),
            operating_mode: OperatingMode::try_from_primitive(((word >> 7) & 0x3) as u8)
                .unwrap_or(OperatingMode::ForcedReadout),
            window_time: ((word >> 9) & 0x3) as u8,
            pulse_counter: ((word >> 11) & 0x3) as u8,
            blind_time: ((word >> 13) & 0xF) as u8,
            threshold: ((word >> 17) & 0xFF) as u8,
        }
    }

    /// Pack this configuration into its 25-bit wire representation.
    pub fn to_word(&self) -> u32 {
        let mut word = 0u32;
        word |= self.count_mode_unfiltered as u32;
        word |= (self.hpf_cutoff_0_2hz as u32) << 2;
        word |= RESERVED_B << 3;
        word |= (self.signal_source as u32) << 5;
        word |= (self.operating_mode as u32) << 7;
        word |= (self.window_time as u32 & 0x3) << 9;
        word |= (self.pulse_counter as u32 & 0x3) << 11;
        word |= (self.blind_time as u32 & 0xF) << 13;
        word |= (self.threshold as u32) << 17;
        word & 0x01FF_FFFF
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            count_mode_unfiltered: false,
            hpf_cutoff_0_2hz: false,
            signal_source: SignalSource::Bpf,
            operating_mode: OperatingMode::ForcedReadout,
            window_time: 0,
            pulse_counter: 0,
            blind_time: 0,
            threshold: 20,
        }
    }
}

/// A single ADC reading plus the millisecond tick it was taken at.
#[derive(Clone, Copy, PartialEq, Eq, Format, Default)]
pub struct AdcSample {
    pub timestamp: u32,
    pub adc_value: i16,
}

/// Fixed-capacity circular buffer of ADC samples. Overwrites the oldest
/// entry once full rather than rejecting new ones. Tracks a count
/// alongside head/tail so the full capacity is usable (a bare head==tail
/// sentinel can only ever distinguish C-1 live elements).
pub struct AdcRing {
    buf: [AdcSample; ADC_RING_CAPACITY],
    head: usize,
    tail: usize,
    count: usize,
}

impl AdcRing {
    pub const fn new() -> Self {
        Self {
            buf: [AdcSample { timestamp: 0, adc_value: 0 }; ADC_RING_CAPACITY],
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.count = 0;
    }

    fn push(&mut self, sample: AdcSample) {
        self.buf[self.tail] = sample;
        self.tail = (self.tail + 1) % ADC_RING_CAPACITY;
        if self.count == ADC_RING_CAPACITY {
            self.head = (self.head + 1) % ADC_RING_CAPACITY;
        } else {
            self.count += 1;
        }
    }

    /// Pop the oldest unread sample, if any.
    pub fn try_pop_sample(&mut self) -> Option<AdcSample> {
        if self.count == 0 {
            return None;
        }
        let sample = self.buf[self.head];
        self.head = (self.head + 1) % ADC_RING_CAPACITY;
        self.count -= 1;
        Some(sample)
    }
}

impl Default for AdcRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic millisecond clock source the sub-FSMs poll for timeouts.
/// Implemented against RTIC's monotonic in firmware, against a fake counter
/// in tests.
pub trait MillisClock {
    fn now_ms(&self) -> u32;
}

fn elapsed(now: u32, since: u32) -> u32 {
    now.wrapping_sub(since)
}

#[derive(Clone, Copy, PartialEq, Eq, Format)]
enum ConfState {
    WaitForWrite,
    Write,
    WaitForApply,
    WaitForRead,
    Read,
    WaitForCheck,
    Check,
    Ready,
}

/// The configuration sub-FSM (L1a): write, wait, read back, compare, retry.
pub struct ConfigFsm {
    state: ConfState,
    requested: u32,
    mirrored: bool,
    since: u32,
    read_retries: u32,
    check_retries: u32,
}

impl ConfigFsm {
    pub const fn new() -> Self {
        Self {
            state: ConfState::WaitForWrite,
            requested: 0,
            mirrored: false,
            since: 0,
            read_retries: 0,
            check_retries: 0,
        }
    }

    /// True once the most recently requested word has been read back
    /// bit-exact.
    pub fn is_mirrored(&self) -> bool {
        self.mirrored
    }

    pub fn requested_word(&self) -> u32 {
        self.requested
    }

    /// Restart the sub-FSM with a new requested word. Preempts whatever the
    /// sub-FSM was doing.
    pub fn request_update(&mut self, word: u32, now: u32) {
        self.requested = word & 0x01FF_FFFF;
        self.mirrored = false;
        self.state = ConfState::WaitForWrite;
        self.since = now;
    }

    pub fn is_ready_state(&self) -> bool {
        self.state == ConfState::Ready
    }

    /// Advance the sub-FSM by one foreground tick.
    pub fn tick<H: WireHal>(&mut self, engine: &mut WireEngine<H>, now: u32) {
        match self.state {
            ConfState::WaitForWrite => {
                if engine.is_ready() || elapsed(now, self.since) > READY_TIMEOUT {
                    self.state = ConfState::Write;
                }
            }

            ConfState::Write => {
                let _ = engine.begin_write(self.requested);
                self.check_retries = 0;
                self.since = now;
                self.state = ConfState::WaitForApply;
            }

            ConfState::WaitForApply => {
                if elapsed(now, self.since) > CONF_APPLY_DELAY {
                    self.since = now;
                    self.read_retries = 0;
                    self.state = ConfState::WaitForRead;
                }
            }

            ConfState::WaitForRead => {
                if engine.is_ready() || elapsed(now, self.since) > READY_TIMEOUT {
                    self.state = ConfState::Read;
                }
            }

            ConfState::Read => {
                let _ = engine.begin_read(FrameType::Full);
                self.since = now;
                self.state = ConfState::WaitForCheck;
            }

            ConfState::WaitForCheck => {
                if engine.is_ready() {
                    self.state = ConfState::Check;
                } else if elapsed(now, self.since) > READY_TIMEOUT {
                    if self.read_retries < READ_RETRIES {
                        self.state = ConfState::Read;
                    } else {
                        self.state = ConfState::Write;
                    }
                    self.read_retries += 1;
                }
            }

            ConfState::Check => {
                match engine.snapshot() {
                    Ok(snap) if snap.conf_word == self.requested => {
                        self.mirrored = true;
                        self.state = ConfState::Ready;
                    }
                    _ => {
                        if self.check_retries < CONF_CHECK_RETRIES {
                            self.state = ConfState::Read;
                        } else {
                            self.state = ConfState::Write;
                        }
                        self.check_retries += 1;
                    }
                }
            }

            ConfState::Ready => {}
        }
    }
}

impl Default for ConfigFsm {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Format)]
enum AdcState {
    WaitReady,
    Request,
    WaitData,
    Delay,
}

/// Gates whether a completed ADC read gets enqueued. The original firmware
/// only enqueues when `out_of_range` is set; preserved as-specified (see
/// `spec.md` §9 Open Questions) but made configurable so a platform
/// integration can correct it once validated against real hardware.
pub trait EnqueueGate {
    fn should_enqueue(&self, out_of_range: bool) -> bool;
}

/// The as-shipped gate: only out-of-range reads are kept.
pub struct OutOfRangeOnly;

impl EnqueueGate for OutOfRangeOnly {
    fn should_enqueue(&self, out_of_range: bool) -> bool {
        out_of_range
    }
}

/// The ADC sub-FSM (L1b): periodic short reads into the ring buffer.
pub struct AdcFsm<G: EnqueueGate = OutOfRangeOnly> {
    state: AdcState,
    since: u32,
    gate: G,
    pub ring: AdcRing,
}

impl AdcFsm<OutOfRangeOnly> {
    pub const fn new() -> Self {
        Self {
            state: AdcState::WaitReady,
            since: 0,
            gate: OutOfRangeOnly,
            ring: AdcRing::new(),
        }
    }
}

impl Default for AdcFsm<OutOfRangeOnly> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: EnqueueGate> AdcFsm<G> {
    pub fn with_gate(gate: G) -> Self {
        Self {
            state: AdcState::WaitReady,
            since: 0,
            gate,
            ring: AdcRing::new(),
        }
    }

    /// Restart polling fresh: clears the ring so the first post-restart
    /// sample finds it empty.
    pub fn restart(&mut self, now: u32) {
        self.ring.reset();
        self.state = AdcState::WaitReady;
        self.since = now;
    }

    pub fn try_pop_sample(&mut self) -> Option<AdcSample> {
        self.ring.try_pop_sample()
    }

    /// Advance the sub-FSM by one foreground tick.
    pub fn tick<H: WireHal>(&mut self, engine: &mut WireEngine<H>, now: u32) {
        match self.state {
            AdcState::WaitReady => {
                if engine.is_ready() || elapsed(now, self.since) > READY_TIMEOUT {
                    self.state = AdcState::Request;
                }
            }

            AdcState::Request => {
                let _ = engine.begin_read(FrameType::AdcShort);
                self.since = now;
                self.state = AdcState::WaitData;
            }

            AdcState::WaitData => {
                if engine.is_ready() {
                    if let Ok(snap) = engine.snapshot() {
                        if self.gate.should_enqueue(snap.out_of_range) {
                            self.ring.push(AdcSample {
                                timestamp: now,
                                adc_value: snap.adc,
                            });
                        }
                    }
                    self.since = now;
                    self.state = AdcState::Delay;
                } else if elapsed(now, self.since) > READY_TIMEOUT {
                    self.since = now;
                    self.state = AdcState::Delay;
                }
            }

            AdcState::Delay => {
                if elapsed(now, self.since) > ADC_READ_DELAY {
                    self.state = AdcState::WaitReady;
                }
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Format)]
enum Selector {
    Idle,
    UpdateConf,
    ReadAdc,
}

/// Serializes the config and ADC sub-FSMs over the single Wire Engine
/// (L1c). Purely combinational: holds no history beyond the current
/// selection.
pub struct Arbiter {
    pub config: ConfigFsm,
    pub adc: AdcFsm,
    adc_polling_enabled: bool,
    config_update_requested: bool,
}

impl Arbiter {
    pub const fn new() -> Self {
        Self {
            config: ConfigFsm::new(),
            adc: AdcFsm::new(),
            adc_polling_enabled: false,
            config_update_requested: false,
        }
    }

    /// Enqueue a configuration update. Preempts any in-progress ADC polling
    /// restart once the new configuration is mirrored.
    pub fn request_config_update(&mut self, word: u32, now: u32) {
        self.config_update_requested = true;
        self.config.request_update(word, now);
    }

    pub fn start_adc(&mut self) {
        self.adc_polling_enabled = true;
    }

    pub fn stop_adc(&mut self) {
        self.adc_polling_enabled = false;
    }

    /// Advance whichever sub-FSM the arbiter currently selects.
    pub fn tick<H: WireHal>(&mut self, engine: &mut WireEngine<H>, now: u32) {
        let selector = if self.config_update_requested {
            self.config_update_requested = false;
            if self.adc_polling_enabled {
                self.adc.restart(now);
            }
            Selector::UpdateConf
        } else if !self.config.is_ready_state() {
            Selector::UpdateConf
        } else if self.adc_polling_enabled {
            Selector::ReadAdc
        } else {
            Selector::Idle
        };

        match selector {
            Selector::Idle => {}
            Selector::UpdateConf => self.config.tick(engine, now),
            Selector::ReadAdc => self.adc.tick(engine, now),
        }
    }
}

impl Default for Arbiter {
    fn default() -> Self {
        Self::new()
    }
}
