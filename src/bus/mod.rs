//! sdmmc-spi-transport - Shared SPI bus
//!
//! One SPI peripheral, shared between one or more cards (and possibly other
//! devices on the same clock and data lines). Whoever holds the bus lock may
//! drive the peripheral. Everyone else waits.
//!
//! The clock rate lives here too, because it belongs to the peripheral and
//! not to any one card: switching it affects every endpoint on the bus.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use spin::{Mutex, MutexGuard};

#[cfg(feature = "log")]
use log::{debug, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};

/// The fastest clock we may use before the card has been identified.
pub const IDENTIFICATION_RATE_HZ: u32 = 400_000;

/// The operating clock used if you don't configure one.
pub const DEFAULT_OPERATING_RATE_HZ: u32 = 12_500_000;

const PHASE_UNSET: u8 = 0;
const PHASE_IDENTIFICATION: u8 = 1;
const PHASE_OPERATING: u8 = 2;

/// An SPI peripheral whose baud rate can be changed at run time.
///
/// Hardware usually only supports a fixed set of divisors, so the peripheral
/// reports the rate it actually ended up with.
pub trait ClockRate {
    /// Set the clock as close to `hz` as possible, and return the rate
    /// achieved.
    fn set_rate(&mut self, hz: u32) -> u32;
}

impl<T> ClockRate for &mut T
where
    T: ClockRate,
{
    fn set_rate(&mut self, hz: u32) -> u32 {
        (*self).set_rate(hz)
    }
}

/// The pair of clock rates a bus switches between.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Rate used while identifying cards. Should not exceed 400 kHz.
    pub identification_hz: u32,
    /// Rate used once the card has been identified.
    pub operating_hz: u32,
}

impl BusConfig {
    /// Identify at 400 kHz, then run at `operating_hz`.
    pub const fn new(operating_hz: u32) -> BusConfig {
        BusConfig {
            identification_hz: IDENTIFICATION_RATE_HZ,
            operating_hz,
        }
    }

    /// Change the operating rate.
    pub const fn with_operating_hz(self, operating_hz: u32) -> BusConfig {
        BusConfig {
            operating_hz,
            ..self
        }
    }

    /// Change the identification rate ceiling.
    pub const fn with_identification_hz(self, identification_hz: u32) -> BusConfig {
        BusConfig {
            identification_hz,
            ..self
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig::new(DEFAULT_OPERATING_RATE_HZ)
    }
}

/// Which of the two configured rates the bus was last set to.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClockPhase {
    /// The slow, card identification rate.
    Identification,
    /// The fast, data transfer rate.
    Operating,
}

/// A shared SPI peripheral.
///
/// Create one of these per physical peripheral, then hand a reference to
/// every [`CardEndpoint`](crate::CardEndpoint) wired to it.
pub struct SpiBus<SPI> {
    peripheral: Mutex<SPI>,
    config: BusConfig,
    phase: AtomicU8,
    achieved_hz: AtomicU32,
    in_session: AtomicBool,
}

impl<SPI> SpiBus<SPI> {
    /// Wrap an SPI peripheral. The clock rate is left alone until one of the
    /// rate switching functions is called.
    pub const fn new(spi: SPI, config: BusConfig) -> SpiBus<SPI> {
        SpiBus {
            peripheral: Mutex::new(spi),
            config,
            phase: AtomicU8::new(PHASE_UNSET),
            achieved_hz: AtomicU32::new(0),
            in_session: AtomicBool::new(false),
        }
    }

    /// The configured pair of clock rates.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// The rate the bus was last switched to, if any.
    pub fn clock_phase(&self) -> Option<ClockPhase> {
        match self.phase.load(Ordering::Acquire) {
            PHASE_IDENTIFICATION => Some(ClockPhase::Identification),
            PHASE_OPERATING => Some(ClockPhase::Operating),
            _ => None,
        }
    }

    /// The rate the peripheral reported on the last switch, if any.
    pub fn achieved_rate(&self) -> Option<u32> {
        match self.achieved_hz.load(Ordering::Acquire) {
            0 => None,
            hz => Some(hz),
        }
    }

    /// Is a session (or an initializing sequence, or a rate switch) using
    /// the bus right now?
    pub fn is_locked(&self) -> bool {
        self.peripheral.is_locked()
    }

    /// Is a card selected on this bus right now?
    pub fn in_session(&self) -> bool {
        self.in_session.load(Ordering::Acquire)
    }

    /// Give back the SPI peripheral.
    pub fn free(self) -> SPI {
        self.peripheral.into_inner()
    }

    /// Block until nobody else holds the bus.
    pub(crate) fn lock(&self) -> MutexGuard<'_, SPI> {
        self.peripheral.lock()
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, SPI>> {
        self.peripheral.try_lock()
    }

    /// Only called with the lock held.
    pub(crate) fn set_in_session(&self, active: bool) {
        self.in_session.store(active, Ordering::Release);
    }
}

impl<SPI> SpiBus<SPI>
where
    SPI: ClockRate,
{
    /// Drop to the identification rate, for talking to a card we know
    /// nothing about yet. Returns the rate achieved.
    ///
    /// Waits for a concurrent rate switch or initializing sequence to finish.
    /// Panics if a session currently holds the bus; use
    /// [`Session::go_low_frequency`](crate::Session::go_low_frequency) from
    /// inside a session instead.
    pub fn go_low_frequency(&self) -> u32 {
        let mut spi = self.idle_peripheral();
        self.switch_rate(&mut *spi, ClockPhase::Identification)
    }

    /// Go up to the configured operating rate, once the card has been
    /// identified. Returns the rate achieved.
    ///
    /// Waits for a concurrent rate switch or initializing sequence to finish.
    /// Panics if a session currently holds the bus.
    pub fn go_high_frequency(&self) -> u32 {
        let mut spi = self.idle_peripheral();
        self.switch_rate(&mut *spi, ClockPhase::Operating)
    }

    fn idle_peripheral(&self) -> MutexGuard<'_, SPI> {
        assert!(
            !self.in_session(),
            "SPI clock rate changed while a session holds the bus"
        );
        self.lock()
    }

    /// Reprogram the peripheral. The caller must hold the bus lock.
    pub(crate) fn switch_rate(&self, spi: &mut SPI, phase: ClockPhase) -> u32 {
        let (requested, marker) = match phase {
            ClockPhase::Identification => (self.config.identification_hz, PHASE_IDENTIFICATION),
            ClockPhase::Operating => (self.config.operating_hz, PHASE_OPERATING),
        };
        let achieved = spi.set_rate(requested);
        self.achieved_hz.store(achieved, Ordering::Release);
        self.phase.store(marker, Ordering::Release);
        debug!(
            "{:?} clock: asked for {} Hz, got {} Hz",
            phase, requested, achieved
        );
        if phase == ClockPhase::Identification && achieved > requested {
            warn!(
                "Identification clock {} Hz is above the {} Hz ceiling",
                achieved, requested
            );
        }
        achieved
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
