//! sdmmc-spi-transport - Transport sessions
//!
//! The acquire, transfer, release cycle wrapped around every command.

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::{OutputPin, StatefulOutputPin};
use spin::MutexGuard;

use crate::bus::{ClockPhase, ClockRate, SpiBus};
use crate::clock::Clock;

use super::{ActivityIndicator, CardEndpoint, Error, CS_HIGH_PULSE_NS, FILL_BYTE};

#[cfg(feature = "log")]
use log::{trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{trace, warn};

/// Bytes are clocked through a stack buffer of this size, so that absent
/// transmit or receive buffers cost no memory.
const CHUNK_LEN: usize = 32;

/// Holds the bus lock with one card selected.
///
/// This is the only way to clock bytes to a card, so nothing can be sent to
/// a card which isn't selected, or while another card on the same bus is.
/// Dropping it deselects the card and unlocks the bus, even on an error
/// path. Use [`release`](Self::release) if you want to know whether the
/// deselect worked.
pub struct Session<'e, 'bus, SPI, CS, IND>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    IND: ActivityIndicator,
{
    spi: MutexGuard<'bus, SPI>,
    endpoint: &'e mut CardEndpoint<'bus, SPI, CS, IND>,
    selected: bool,
    released: bool,
}

impl<'e, 'bus, SPI, CS, IND> Drop for Session<'e, 'bus, SPI, CS, IND>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    IND: ActivityIndicator,
{
    fn drop(&mut self) {
        if !self.released && self.deselect().is_err() {
            warn!("Failed to deselect card on release");
        }
        self.endpoint.bus.set_in_session(false);
        // the lock guard is dropped after this, so the bus is only unlocked
        // once the card is off it
    }
}

impl<'e, 'bus, SPI, CS, IND> Session<'e, 'bus, SPI, CS, IND>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    IND: ActivityIndicator,
{
    pub(crate) fn new(
        spi: MutexGuard<'bus, SPI>,
        endpoint: &'e mut CardEndpoint<'bus, SPI, CS, IND>,
    ) -> Result<Self, Error> {
        let mut me = Session {
            spi,
            endpoint,
            selected: false,
            released: false,
        };
        me.endpoint.bus.set_in_session(true);
        me.select()?;
        Ok(me)
    }

    /// Deselect the card and unlock the bus.
    ///
    /// The bus is unlocked even if this returns an error.
    pub fn release(mut self) -> Result<(), Error> {
        let result = self.deselect();
        self.released = true;
        result
    }

    /// Exchange `length` bytes with the card.
    ///
    /// With no `tx`, filler bytes are sent. With no `rx`, whatever the card
    /// sends back is thrown away. Both buffers, when given, must be at least
    /// `length` bytes long.
    ///
    /// A failure is passed straight back. We don't retry, because only the
    /// command layer knows whether that is safe.
    ///
    /// If the last select failed (say, during a pulse) nothing is clocked and
    /// this returns [`Error::GpioError`] until a pulse succeeds.
    pub fn transfer(
        &mut self,
        tx: Option<&[u8]>,
        mut rx: Option<&mut [u8]>,
        length: usize,
    ) -> Result<(), Error> {
        if let Some(tx) = tx {
            assert!(tx.len() >= length, "transmit buffer shorter than transfer");
        }
        if let Some(rx) = rx.as_deref() {
            assert!(rx.len() >= length, "receive buffer shorter than transfer");
        }
        if !self.selected {
            return Err(Error::GpioError);
        }

        let mut offset = 0;
        while offset < length {
            let n = core::cmp::min(CHUNK_LEN, length - offset);
            let mut chunk = [FILL_BYTE; CHUNK_LEN];
            if let Some(tx) = tx {
                chunk[..n].copy_from_slice(&tx[offset..offset + n]);
            }
            let received = self
                .spi
                .transfer(&mut chunk[..n])
                .map_err(|_e| Error::Transport)?;
            if let Some(rx) = rx.as_deref_mut() {
                rx[offset..offset + n].copy_from_slice(received);
            }
            offset += n;
        }
        Ok(())
    }

    /// Send one byte, ignoring whatever comes back.
    pub fn write(&mut self, value: u8) -> Result<(), Error> {
        self.transfer(Some(&[value][..]), None, 1)
    }

    /// Receive one byte by clocking out a filler byte.
    pub fn receive(&mut self) -> Result<u8, Error> {
        let mut byte = [FILL_BYTE];
        self.transfer(None, Some(&mut byte[..]), 1)?;
        Ok(byte[0])
    }

    /// Deselect and immediately reselect the card, for cards which want to
    /// see chip select go high between transactions.
    ///
    /// The filler byte clocked on deselect is all that keeps chip select
    /// high. Above 40 MHz that is shorter than the card's minimum, in which
    /// case use [`pulse_deselect_reselect_with_delay`](Self::pulse_deselect_reselect_with_delay).
    pub fn pulse_deselect_reselect(&mut self) -> Result<(), Error> {
        trace!("Pulse chip select");
        self.deselect()?;
        self.select()
    }

    /// Like [`pulse_deselect_reselect`](Self::pulse_deselect_reselect), but
    /// waits a microsecond with chip select high if one filler byte at the
    /// current clock rate (or an unknown one) is too short.
    pub fn pulse_deselect_reselect_with_delay<D>(&mut self, delay: &mut D) -> Result<(), Error>
    where
        D: DelayUs<u8>,
    {
        trace!("Pulse chip select (delayed)");
        self.deselect()?;
        if !self.fill_byte_covers_cs_pulse() {
            delay.delay_us(1);
        }
        self.select()
    }

    /// The bus this session holds.
    pub fn bus(&self) -> &'bus SpiBus<SPI> {
        self.endpoint.bus
    }

    fn fill_byte_covers_cs_pulse(&self) -> bool {
        match self.endpoint.bus.achieved_rate() {
            // 8 clocks take 8e9 / hz nanoseconds
            Some(hz) => u64::from(hz) * u64::from(CS_HIGH_PULSE_NS) <= 8_000_000_000,
            None => false,
        }
    }

    fn select(&mut self) -> Result<(), Error> {
        trace!("Select");
        self.endpoint.cs.set_low().map_err(|_| Error::GpioError)?;
        self.fill()?;
        self.endpoint.indicator.on();
        self.selected = true;
        Ok(())
    }

    /// Always tries every step, so a bad pin doesn't leave the card driving
    /// the data line.
    fn deselect(&mut self) -> Result<(), Error> {
        trace!("Deselect");
        self.selected = false;
        let cs = self.endpoint.cs.set_high().map_err(|_| Error::GpioError);
        self.endpoint.indicator.off();
        let fill = self.fill();
        cs.and(fill)
    }

    fn fill(&mut self) -> Result<(), Error> {
        self.spi
            .transfer(&mut [FILL_BYTE])
            .map(|_| ())
            .map_err(|_e| Error::Transport)
    }
}

impl<'e, 'bus, SPI, CS, IND> Session<'e, 'bus, SPI, CS, IND>
where
    SPI: Transfer<u8> + ClockRate,
    CS: OutputPin,
    IND: ActivityIndicator,
{
    /// Drop the whole bus to the identification rate without giving up the
    /// lock. Returns the rate achieved.
    pub fn go_low_frequency(&mut self) -> u32 {
        let bus = self.endpoint.bus;
        bus.switch_rate(&mut *self.spi, ClockPhase::Identification)
    }

    /// Raise the whole bus to the operating rate without giving up the lock.
    /// Returns the rate achieved.
    pub fn go_high_frequency(&mut self) -> u32 {
        let bus = self.endpoint.bus;
        bus.switch_rate(&mut *self.spi, ClockPhase::Operating)
    }
}

impl<'e, 'bus, SPI, CS, IND> Session<'e, 'bus, SPI, CS, IND>
where
    SPI: Transfer<u8>,
    CS: StatefulOutputPin,
    IND: ActivityIndicator,
{
    /// Send the power-up clocks without giving up the lock. Chip select is
    /// forced high (and the indicator off) for the duration, then both are
    /// put back.
    ///
    /// Does nothing if the sequence was already sent since the endpoint was
    /// last power cycled.
    pub fn send_initializing_sequence<C>(&mut self, clock: &C) -> Result<(), Error>
    where
        C: Clock,
    {
        if self.endpoint.initialized {
            return Ok(());
        }
        self.endpoint.indicator.off();
        let result = self
            .endpoint
            .clock_initializing_sequence(&mut *self.spi, clock);
        // chip select is only known to be back if we can read it
        self.selected = self.selected && self.endpoint.is_selected().unwrap_or(false);
        if self.selected {
            self.endpoint.indicator.on();
        }
        result
    }

    /// Is chip select currently asserted? Normally yes, unless a pulse or a
    /// deselect failed part way.
    pub fn is_selected(&self) -> Result<bool, Error> {
        self.endpoint.is_selected()
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
