//! sdmmc-spi-transport - Time source
//!
//! The transport never sleeps. It only needs to know whether a deadline has
//! passed, so it can keep the bus clocking (or keep polling the bus lock)
//! until then.

/// Something which can tell us how much time has passed.
///
/// Implement this over your HAL's monotonic timer. The instant type only
/// needs to be comparable by the implementation itself, so a raw tick count
/// is fine. Deadlines are the only thing ever asked for, so there is no
/// "current time" method.
pub trait Clock {
    /// A point in time, as understood by this clock.
    type Instant: Copy;

    /// The time `micros` microseconds from now.
    fn deadline_after(&self, micros: u32) -> Self::Instant;

    /// Has `deadline` been reached?
    fn has_elapsed(&self, deadline: Self::Instant) -> bool;
}

impl<T> Clock for &T
where
    T: Clock,
{
    type Instant = T::Instant;

    fn deadline_after(&self, micros: u32) -> Self::Instant {
        (*self).deadline_after(micros)
    }

    fn has_elapsed(&self, deadline: Self::Instant) -> bool {
        (*self).has_elapsed(deadline)
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
