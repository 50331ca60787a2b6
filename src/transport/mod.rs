//! sdmmc-spi-transport - Card endpoints
//!
//! Selects one card on a shared SPI bus, clocks bytes to and from it, and
//! deselects it again.
//!
//! SD cards enable and disable their data out line in step with the clock,
//! not with chip select, so every change of chip select is followed by one
//! clocked filler byte. Without it a card which has just been deselected may
//! still be driving the bus when the next device is selected.

pub mod session;
pub use session::Session;

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::{OutputPin, StatefulOutputPin};

use crate::bus::SpiBus;
use crate::clock::Clock;

#[cfg(feature = "log")]
use log::debug;

#[cfg(feature = "defmt-log")]
use defmt::debug;

/// The byte we clock out when we have nothing to say.
pub const FILL_BYTE: u8 = 0xFF;

/// A freshly powered card needs at least this many clocks with chip select
/// and data in both high before it will accept a command.
pub const INIT_MIN_CLOCKS: u32 = 74;

/// ... and the clocks must keep going for at least this long.
pub const INIT_MIN_DURATION_US: u32 = 1_000;

/// Minimum time chip select must stay high between two transactions.
pub const CS_HIGH_PULSE_NS: u32 = 200;

/// 80 clocks per chunk, so a single chunk already covers the 74 clock minimum.
const INIT_CHUNK_LEN: usize = 10;

/// The possible errors the transport can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// We got an error from the SPI peripheral
    Transport,
    /// Couldn't set or read the chip select pin
    GpioError,
    /// Someone else held the bus for longer than we were prepared to wait
    LockTimeout,
}

/// Something which shows the world that a card is being talked to. An LED,
/// usually.
pub trait ActivityIndicator {
    /// A card has been selected.
    fn on(&mut self);
    /// The card has been deselected.
    fn off(&mut self);
}

/// For when there is no activity LED.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone)]
pub struct NoIndicator;

impl ActivityIndicator for NoIndicator {
    fn on(&mut self) {}

    fn off(&mut self) {}
}

/// Drives an output pin high while a card is selected.
///
/// Failures to set the pin are ignored. It's only an LED.
#[derive(Debug)]
pub struct PinIndicator<P>(pub P);

impl<P> ActivityIndicator for PinIndicator<P>
where
    P: OutputPin,
{
    fn on(&mut self) {
        self.0.set_high().ok();
    }

    fn off(&mut self) {
        self.0.set_low().ok();
    }
}

/// One card slot on a shared SPI bus.
///
/// Built from a reference to the bus and the card's own chip select pin. The
/// chip select pin is the only record of whether the card is selected; we
/// read it back rather than keeping a copy that could go stale.
pub struct CardEndpoint<'bus, SPI, CS, IND = NoIndicator>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    IND: ActivityIndicator,
{
    bus: &'bus SpiBus<SPI>,
    cs: CS,
    indicator: IND,
    initialized: bool,
}

impl<'bus, SPI, CS> CardEndpoint<'bus, SPI, CS, NoIndicator>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Create an endpoint with no activity indicator.
    pub fn new(bus: &'bus SpiBus<SPI>, cs: CS) -> Self {
        CardEndpoint::with_indicator(bus, cs, NoIndicator)
    }
}

impl<'bus, SPI, CS, IND> CardEndpoint<'bus, SPI, CS, IND>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    IND: ActivityIndicator,
{
    /// Create an endpoint which switches `indicator` on whenever the card is
    /// selected.
    pub fn with_indicator(bus: &'bus SpiBus<SPI>, cs: CS, indicator: IND) -> Self {
        CardEndpoint {
            bus,
            cs,
            indicator,
            initialized: false,
        }
    }

    /// The bus this card hangs off.
    pub fn bus(&self) -> &'bus SpiBus<SPI> {
        self.bus
    }

    /// Lock the bus and select the card.
    ///
    /// Blocks for as long as any other endpoint on the same bus holds a
    /// session. The card is deselected and the bus unlocked when the returned
    /// session is dropped or released.
    pub fn acquire(&mut self) -> Result<Session<'_, 'bus, SPI, CS, IND>, Error> {
        let bus = self.bus;
        let spi = bus.lock();
        Session::new(spi, self)
    }

    /// Like [`acquire`](Self::acquire), but give up with
    /// [`Error::LockTimeout`] if the bus doesn't come free within
    /// `timeout_us` microseconds.
    pub fn acquire_within<C>(
        &mut self,
        clock: &C,
        timeout_us: u32,
    ) -> Result<Session<'_, 'bus, SPI, CS, IND>, Error>
    where
        C: Clock,
    {
        let bus = self.bus;
        let deadline = clock.deadline_after(timeout_us);
        let spi = loop {
            if let Some(spi) = bus.try_lock() {
                break spi;
            }
            if clock.has_elapsed(deadline) {
                debug!("Bus still busy after {} us, giving up", timeout_us);
                return Err(Error::LockTimeout);
            }
            core::hint::spin_loop();
        };
        Session::new(spi, self)
    }

    /// Has the initializing sequence been sent since the last power cycle?
    pub fn has_sent_initializing_sequence(&self) -> bool {
        self.initialized
    }

    /// The card has lost power (or been swapped), so it needs the
    /// initializing sequence again.
    pub fn power_cycled(&mut self) {
        self.initialized = false;
    }

    /// Give back the chip select pin and the indicator.
    pub fn free(self) -> (CS, IND) {
        (self.cs, self.indicator)
    }
}

impl<'bus, SPI, CS, IND> CardEndpoint<'bus, SPI, CS, IND>
where
    SPI: Transfer<u8>,
    CS: StatefulOutputPin,
    IND: ActivityIndicator,
{
    /// Is chip select currently asserted (low)?
    pub fn is_selected(&self) -> Result<bool, Error> {
        self.cs.is_set_low().map_err(|_| Error::GpioError)
    }

    /// Send the power-up clocks a card needs before its first command.
    ///
    /// Takes the bus lock only for the duration of the sequence. Does nothing
    /// if the sequence was already sent since the last
    /// [`power_cycled`](Self::power_cycled).
    pub fn send_initializing_sequence<C>(&mut self, clock: &C) -> Result<(), Error>
    where
        C: Clock,
    {
        if self.initialized {
            debug!("Initializing sequence already sent");
            return Ok(());
        }
        let bus = self.bus;
        let mut spi = bus.lock();
        self.clock_initializing_sequence(&mut *spi, clock)
    }

    /// Hold chip select and data in high and clock ones until both the
    /// minimum clock count and the minimum duration have passed, then put
    /// chip select back the way we found it. The caller must hold the bus.
    ///
    /// Clocks go out a whole chunk at a time, so we may overshoot the minimum
    /// by up to one chunk. We never undershoot.
    pub(crate) fn clock_initializing_sequence<C>(
        &mut self,
        spi: &mut SPI,
        clock: &C,
    ) -> Result<(), Error>
    where
        C: Clock,
    {
        let was_high = self.cs.is_set_high().map_err(|_| Error::GpioError)?;
        self.cs.set_high().map_err(|_| Error::GpioError)?;

        let deadline = clock.deadline_after(INIT_MIN_DURATION_US);
        let mut clocked: usize = 0;
        let result = loop {
            // transfer() overwrites the buffer, so refill it every time
            let mut ones = [FILL_BYTE; INIT_CHUNK_LEN];
            if spi.transfer(&mut ones).is_err() {
                break Err(Error::Transport);
            }
            clocked += INIT_CHUNK_LEN;
            if clocked * 8 >= INIT_MIN_CLOCKS as usize && clock.has_elapsed(deadline) {
                break Ok(());
            }
        };

        let restored = if was_high {
            self.cs.set_high()
        } else {
            self.cs.set_low()
        };
        debug!("Initializing sequence: {} bytes clocked", clocked);

        result?;
        restored.map_err(|_| Error::GpioError)?;
        self.initialized = true;
        Ok(())
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
