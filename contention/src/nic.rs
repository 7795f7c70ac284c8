use crate::error::ContentionError;
use crate::generator::{ContentionUnit, UnitStats};
use cache_utils::clock::{busy_wait_until, Clock};
use nix::errno::Errno;
use rand::Rng;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

/// Time between two packets of `packet_size` bytes to sustain `bitrate`
/// bits per second.
pub fn pacing_interval(packet_size: usize, bitrate: u64) -> Duration {
    let bits = packet_size as u128 * 8;
    let nanos = bits * 1_000_000_000 / bitrate.max(1) as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

/// Send errors that only mean the datagram was lost.
pub fn is_tolerated(error: &io::Error) -> bool {
    if matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionRefused
    ) {
        return true;
    }
    match error.raw_os_error().map(Errno::from_raw) {
        Some(Errno::ENOBUFS | Errno::EHOSTUNREACH | Errno::ENETUNREACH | Errno::ECONNREFUSED) => {
            true
        }
        _ => false,
    }
}

/// Paced UDP sender. Each step busy-waits until the next slot, then sends one
/// datagram.
pub struct NicUnit {
    socket: UdpSocket,
    destination: SocketAddr,
    payload: Vec<u8>,
    interval: Duration,
    next_send: Option<Duration>,
    steps: u64,
    sent: u64,
    dropped: u64,
}

impl NicUnit {
    pub fn new(
        destination: SocketAddr,
        packet_size: usize,
        bitrate: u64,
    ) -> Result<Self, ContentionError> {
        let local: SocketAddr = match destination {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).map_err(ContentionError::SocketUnavailable)?;
        let mut payload = vec![0u8; packet_size];
        rand::rng().fill(payload.as_mut_slice());
        Ok(Self {
            socket,
            destination,
            payload,
            interval: pacing_interval(packet_size, bitrate),
            next_send: None,
            steps: 0,
            sent: 0,
            dropped: 0,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl ContentionUnit for NicUnit {
    fn step(&mut self, clock: &dyn Clock, deadline: Duration) -> Result<(), ContentionError> {
        let slot = match self.next_send {
            None => clock.now(),
            Some(slot) if slot < deadline => {
                busy_wait_until(clock, slot);
                slot
            }
            Some(_) => {
                // The next slot falls after the end of the run.
                busy_wait_until(clock, deadline);
                return Ok(());
            }
        };
        match self.socket.send_to(&self.payload, self.destination) {
            Ok(_) => self.sent += 1,
            Err(e) if is_tolerated(&e) => self.dropped += 1,
            Err(source) => {
                return Err(ContentionError::SendFailed {
                    destination: self.destination,
                    source,
                })
            }
        }
        // Slots are spaced from the schedule, not from the send, so that a
        // slow send does not lower the rate.
        self.next_send = Some(slot + self.interval);
        self.steps += 1;
        Ok(())
    }

    fn stats(&self) -> UnitStats {
        UnitStats {
            steps: self.steps,
            operations: self.sent,
            dropped: self.dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_utils::clock::ManualClock;

    #[test]
    fn interval_from_bitrate() {
        assert_eq!(
            pacing_interval(512, 1_000_000_000),
            Duration::from_nanos(4096)
        );
        assert_eq!(pacing_interval(1250, 10_000), Duration::from_secs(1));
    }

    #[test]
    fn tolerated_errors() {
        assert!(is_tolerated(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_tolerated(&io::Error::from_raw_os_error(Errno::ENOBUFS as i32)));
        assert!(is_tolerated(&io::Error::from_raw_os_error(
            Errno::EHOSTUNREACH as i32
        )));
        assert!(!is_tolerated(&io::Error::from_raw_os_error(Errno::EACCES as i32)));
        assert!(!is_tolerated(&io::Error::from(io::ErrorKind::InvalidInput)));
    }

    #[test]
    fn paced_datagrams_reach_receiver() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let destination = receiver.local_addr().unwrap();
        // 64 bytes at 512 kbps, one packet per millisecond.
        let mut unit = NicUnit::new(destination, 64, 512_000).unwrap();
        assert_eq!(unit.interval(), Duration::from_millis(1));

        let clock = ManualClock::new(Duration::from_micros(100));
        for _ in 0..3 {
            unit.step(&clock, Duration::MAX).unwrap();
        }
        let stats = unit.stats();
        assert_eq!(stats.steps, 3);
        assert_eq!(stats.operations + stats.dropped, 3);
        // Two waits of a full interval.
        assert!(clock.peek() >= Duration::from_millis(2));

        let mut buffer = [0u8; 128];
        let (len, _) = receiver.recv_from(&mut buffer).unwrap();
        assert_eq!(len, 64);
    }

    #[test]
    fn slot_past_deadline_is_not_waited_for() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let destination = receiver.local_addr().unwrap();
        // One packet per second, far longer than the run.
        let mut unit = NicUnit::new(destination, 1250, 10_000).unwrap();
        let clock = ManualClock::new(Duration::from_micros(100));
        let deadline = Duration::from_millis(20);

        unit.step(&clock, deadline).unwrap();
        unit.step(&clock, deadline).unwrap();

        let stats = unit.stats();
        assert_eq!(stats.steps, 1);
        assert_eq!(stats.operations + stats.dropped, 1);
        assert!(clock.peek() >= deadline);
        assert!(clock.peek() < Duration::from_millis(50));
    }
}
