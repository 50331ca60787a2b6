use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::{Duration, Instant};

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::{OutputPin, StatefulOutputPin};
use hex_literal::hex;

use sdmmc_spi_transport::{
    BusConfig, CardEndpoint, Clock, ClockPhase, ClockRate, SpiBus, TransportError,
    IDENTIFICATION_RATE_HZ,
};

const CMD0: [u8; 6] = hex!("40 00 00 00 00 95");

/// A chip select edge, as seen on the wire.
#[derive(Debug, Copy, Clone)]
struct Edge {
    at: Instant,
    card: usize,
    asserted: bool,
}

/// Everything the chip select pins saw, in order.
#[derive(Default)]
struct Probe {
    edges: Mutex<Vec<Edge>>,
    selected: AtomicUsize,
    most_selected: AtomicUsize,
}

impl Probe {
    fn record(&self, card: usize, asserted: bool) {
        // hold the log lock so the counter and the log agree on ordering
        let mut edges = self.edges.lock().unwrap();
        let now = if asserted {
            self.selected.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.selected.fetch_sub(1, Ordering::SeqCst) - 1
        };
        self.most_selected.fetch_max(now, Ordering::SeqCst);
        edges.push(Edge {
            at: Instant::now(),
            card,
            asserted,
        });
    }

    /// Replay the log and check no two cards were ever selected together.
    fn check_exclusive(&self) {
        let edges = self.edges.lock().unwrap();
        let mut holder: Option<usize> = None;
        let mut last = None;
        for edge in edges.iter() {
            if let Some(last) = last {
                assert!(edge.at >= last, "edge log out of order");
            }
            last = Some(edge.at);
            match (holder, edge.asserted) {
                (None, true) => holder = Some(edge.card),
                (Some(card), false) if card == edge.card => holder = None,
                (other, _) => panic!("card {} changed while {:?} selected", edge.card, other),
            }
        }
        assert_eq!(holder, None);
        assert_eq!(self.most_selected.load(Ordering::SeqCst), 1);
    }
}

struct ProbedCs {
    card: usize,
    high: bool,
    probe: Arc<Probe>,
}

impl ProbedCs {
    fn new(card: usize, probe: &Arc<Probe>) -> ProbedCs {
        ProbedCs {
            card,
            high: true,
            probe: probe.clone(),
        }
    }
}

impl OutputPin for ProbedCs {
    type Error = ();

    fn set_low(&mut self) -> Result<(), ()> {
        if self.high {
            self.high = false;
            self.probe.record(self.card, true);
        }
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), ()> {
        if !self.high {
            self.high = true;
            self.probe.record(self.card, false);
        }
        Ok(())
    }
}

impl StatefulOutputPin for ProbedCs {
    fn is_set_high(&self) -> Result<bool, ()> {
        Ok(self.high)
    }

    fn is_set_low(&self) -> Result<bool, ()> {
        Ok(!self.high)
    }
}

/// Loopback SPI that counts every byte clocked.
#[derive(Default)]
struct LoopbackSpi {
    clocked: usize,
    rate: u32,
}

impl Transfer<u8> for LoopbackSpi {
    type Error = ();

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], ()> {
        self.clocked += words.len();
        Ok(words)
    }
}

impl ClockRate for LoopbackSpi {
    fn set_rate(&mut self, hz: u32) -> u32 {
        // 48 MHz divided by an even number
        let divider = ((48_000_000 + 2 * hz - 1) / (2 * hz)) * 2;
        self.rate = 48_000_000 / divider;
        self.rate
    }
}

/// A peripheral which takes its time reprogramming the clock.
struct SlowRateSpi;

impl Transfer<u8> for SlowRateSpi {
    type Error = ();

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], ()> {
        Ok(words)
    }
}

impl ClockRate for SlowRateSpi {
    fn set_rate(&mut self, hz: u32) -> u32 {
        std::thread::sleep(Duration::from_millis(100));
        hz
    }
}

struct WallClock;

impl Clock for WallClock {
    type Instant = Instant;

    fn deadline_after(&self, micros: u32) -> Instant {
        Instant::now() + Duration::from_micros(u64::from(micros))
    }

    fn has_elapsed(&self, deadline: Instant) -> bool {
        Instant::now() >= deadline
    }
}

/// Every deadline is 100 ms away, whatever was asked for.
struct StretchedClock;

impl Clock for StretchedClock {
    type Instant = Instant;

    fn deadline_after(&self, _micros: u32) -> Instant {
        Instant::now() + Duration::from_millis(100)
    }

    fn has_elapsed(&self, deadline: Instant) -> bool {
        Instant::now() >= deadline
    }
}

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn sessions_never_overlap() {
    init_log();
    let probe = Arc::new(Probe::default());
    let bus = SpiBus::new(LoopbackSpi::default(), BusConfig::default());

    std::thread::scope(|s| {
        for card in 0..4 {
            let bus = &bus;
            let probe = &probe;
            s.spawn(move || {
                let mut endpoint = CardEndpoint::new(bus, ProbedCs::new(card, probe));
                for round in 0..200u8 {
                    let mut session = endpoint.acquire().unwrap();
                    assert_eq!(probe.selected.load(Ordering::SeqCst), 1);
                    let tx = [card as u8, round, 0xA5, 0x5A, 0x00, 0xFF, 0x12, 0x34];
                    let mut rx = [0u8; 8];
                    session.transfer(Some(&tx[..]), Some(&mut rx[..]), 8).unwrap();
                    assert_eq!(rx, tx);
                    session.release().unwrap();
                }
            });
        }
    });

    probe.check_exclusive();
    assert!(!bus.is_locked());
    // 200 rounds x 4 cards x (8 payload + 2 filler)
    assert_eq!(bus.free().clocked, 200 * 4 * 10);
}

#[test]
fn concurrent_identification_flows() {
    init_log();
    let probe = Arc::new(Probe::default());
    let bus = SpiBus::new(LoopbackSpi::default(), BusConfig::new(24_000_000));
    let clock = WallClock;

    std::thread::scope(|s| {
        for card in 0..2 {
            let bus = &bus;
            let probe = &probe;
            let clock = &clock;
            s.spawn(move || {
                let mut endpoint = CardEndpoint::new(bus, ProbedCs::new(card, probe));
                endpoint.send_initializing_sequence(clock).unwrap();
                assert!(!endpoint.is_selected().unwrap());

                {
                    let mut session = endpoint.acquire().unwrap();
                    assert!(session.go_low_frequency() <= IDENTIFICATION_RATE_HZ);
                }
                for _ in 0..50 {
                    let mut session = endpoint.acquire().unwrap();
                    session.transfer(Some(&CMD0[..]), None, CMD0.len()).unwrap();
                    session.receive().unwrap();
                    session.pulse_deselect_reselect().unwrap();
                    session.write(0xFF).unwrap();
                }
                let mut session = endpoint.acquire().unwrap();
                assert_eq!(session.go_high_frequency(), 24_000_000);
            });
        }
    });

    probe.check_exclusive();
    assert_eq!(bus.achieved_rate(), Some(24_000_000));
}

#[test]
fn bounded_acquire_gives_up_while_bus_is_held() {
    init_log();
    let probe = Arc::new(Probe::default());
    let bus = SpiBus::new(LoopbackSpi::default(), BusConfig::default());
    let holding = Barrier::new(2);
    let clock = WallClock;

    std::thread::scope(|s| {
        s.spawn(|| {
            let mut endpoint = CardEndpoint::new(&bus, ProbedCs::new(0, &probe));
            let session = endpoint.acquire().unwrap();
            holding.wait();
            std::thread::sleep(Duration::from_millis(50));
            drop(session);
        });

        let mut endpoint = CardEndpoint::new(&bus, ProbedCs::new(1, &probe));
        holding.wait();
        assert_eq!(
            endpoint.acquire_within(&clock, 1_000).err(),
            Some(TransportError::LockTimeout)
        );
        let session = endpoint.acquire_within(&clock, 5_000_000).unwrap();
        assert!(session.is_selected().unwrap());
    });

    probe.check_exclusive();
}

#[test]
fn overlapping_rate_switches_wait_for_each_other() {
    init_log();
    let bus = SpiBus::new(SlowRateSpi, BusConfig::new(20_000_000));

    std::thread::scope(|s| {
        let low = s.spawn(|| bus.go_low_frequency());
        std::thread::sleep(Duration::from_millis(20));
        let high = s.spawn(|| bus.go_high_frequency());
        assert_eq!(low.join().unwrap(), IDENTIFICATION_RATE_HZ);
        assert_eq!(high.join().unwrap(), 20_000_000);
    });

    assert_eq!(bus.clock_phase(), Some(ClockPhase::Operating));
    assert_eq!(bus.achieved_rate(), Some(20_000_000));
}

#[test]
fn rate_switch_waits_for_initializing_sequence() {
    init_log();
    let probe = Arc::new(Probe::default());
    let bus = SpiBus::new(SlowRateSpi, BusConfig::default());

    std::thread::scope(|s| {
        let init = s.spawn(|| {
            let mut endpoint = CardEndpoint::new(&bus, ProbedCs::new(0, &probe));
            endpoint.send_initializing_sequence(&StretchedClock)
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(!bus.in_session());
        assert_eq!(bus.go_low_frequency(), IDENTIFICATION_RATE_HZ);
        assert_eq!(init.join().unwrap(), Ok(()));
    });

    assert!(!bus.is_locked());
    assert_eq!(bus.clock_phase(), Some(ClockPhase::Identification));
}
