//! # sdmmc-spi-transport
//!
//! > Bus-sharing SPI transport for SD/MMC cards, written in Embedded Rust
//!
//! This crate sits between an SD card command layer and your HAL's SPI
//! peripheral. It knows nothing about SD commands. It only gets the bus
//! timing right:
//!
//! * one card at a time on a shared bus, with the lock held by a guard so it
//!   can't be leaked on an error path;
//! * an extra filler byte after every chip select edge, so the card releases
//!   its data out line;
//! * slow clock during identification, fast clock afterwards;
//! * the power-up clocks a card needs before its first command.
//!
//! It is `#![no_std]` and does not use `alloc`.
//!
//! ## Using the crate
//!
//! You need an SPI peripheral which implements
//! `embedded_hal::blocking::spi::Transfer<u8>` and [`ClockRate`], a chip
//! select pin per card, and something which implements [`Clock`].
//!
//! ```rust,ignore
//! let bus = sdmmc_spi_transport::SpiBus::new(spi, BusConfig::new(25_000_000));
//! let mut card = sdmmc_spi_transport::CardEndpoint::new(&bus, cs);
//!
//! bus.go_low_frequency();
//! card.send_initializing_sequence(&timer)?;
//! {
//!     let mut session = card.acquire()?;
//!     session.transfer(Some(&CMD0), None, CMD0.len())?;
//!     let r1 = session.receive()?;
//!     // session dropped here: card deselected, bus unlocked
//! }
//! bus.go_high_frequency();
//! ```
//!
//! ## Features
//!
//! * `defmt-log`: By turning off the default features and enabling the `defmt-log` feature you can
//! configure this crate to log messages over defmt instead.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is enabled.

#![cfg_attr(not(test), no_std)]
// #![deny(missing_docs)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************


pub mod bus;
pub mod clock;
pub mod transport;

pub use crate::bus::{BusConfig, ClockPhase, ClockRate, SpiBus, IDENTIFICATION_RATE_HZ};
pub use crate::clock::Clock;
pub use crate::transport::Error as TransportError;
pub use crate::transport::{
    ActivityIndicator, CardEndpoint, NoIndicator, PinIndicator, Session, FILL_BYTE,
};

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
