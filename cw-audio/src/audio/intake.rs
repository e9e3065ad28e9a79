//! Encoded-packet intake queue (network thread -> feeder thread)
//!
//! Fixed-size slots avoid per-packet heap allocation. 4 KiB far exceeds
//! the largest legal Opus packet (<= 1275 B per RFC 6716).

use crate::log_info;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Maximum accepted encoded-packet size in bytes.
pub const MAX_PACKET_BYTES: usize = 4096;

#[derive(Debug)]
struct PacketSlot {
    data: Box<[u8; MAX_PACKET_BYTES]>,
    len: usize,
}

impl PacketSlot {
    fn empty() -> Self {
        Self {
            data: Box::new([0u8; MAX_PACKET_BYTES]),
            len: 0,
        }
    }
}

#[derive(Debug)]
struct IntakeState {
    slots: Vec<PacketSlot>,
    head: usize,
    tail: usize,
    count: usize,
    shutdown: bool,
    stats: IntakeStats,
}

/// Lifetime counters, reported by the feeder's periodic diagnostics.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntakeStats {
    pub submitted: u64,
    pub rejected_oversize: u64,
    pub evicted: u64,
}

/// Bounded circular queue of encoded Opus packets.
///
/// Single producer (the network callback), single consumer (the
/// feeder). When full, the oldest packet is evicted so fresh audio is
/// never the one thrown away.
#[derive(Debug)]
pub struct PacketIntake {
    state: Mutex<IntakeState>,
    available: Condvar,
    cap: usize,
}

impl PacketIntake {
    pub fn new(cap: usize) -> Self {
        let mut slots = Vec::with_capacity(cap);
        slots.resize_with(cap, PacketSlot::empty);
        Self {
            state: Mutex::new(IntakeState {
                slots,
                head: 0,
                tail: 0,
                count: 0,
                shutdown: false,
                stats: IntakeStats::default(),
            }),
            available: Condvar::new(),
            cap,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Copy one packet into the queue. Packets with an out-of-range
    /// length are rejected; a full queue evicts its oldest entry.
    pub fn submit(&self, bytes: &[u8]) {
        if bytes.is_empty() || bytes.len() > MAX_PACKET_BYTES {
            let mut state = self.lock();
            state.stats.rejected_oversize += 1;
            log_info!("AUD", "packet length {} out of range, dropping", bytes.len());
            return;
        }

        {
            let mut state = self.lock();
            if state.count == self.cap {
                state.head = (state.head + 1) % self.cap;
                state.count -= 1;
                state.stats.evicted += 1;
                log_info!("AUD", "packet queue overflow, dropping oldest");
            }
            let tail = state.tail;
            state.slots[tail].data[..bytes.len()].copy_from_slice(bytes);
            state.slots[tail].len = bytes.len();
            state.tail = (state.tail + 1) % self.cap;
            state.count += 1;
            state.stats.submitted += 1;
        }
        self.available.notify_one();
    }

    /// Pop the oldest packet into `out`, returning its length.
    /// The lock is released before the caller decodes.
    pub fn try_pop(&self, out: &mut [u8; MAX_PACKET_BYTES]) -> Option<usize> {
        let mut state = self.lock();
        if state.count == 0 {
            return None;
        }
        let head = state.head;
        let len = state.slots[head].len;
        out[..len].copy_from_slice(&state.slots[head].data[..len]);
        state.head = (state.head + 1) % self.cap;
        state.count -= 1;
        Some(len)
    }

    /// Block until a packet arrives, shutdown is signalled, or the
    /// timeout elapses. The timeout keeps the feeder's worst-case wake
    /// latency bounded so it can still poll the sink and publish
    /// diagnostics.
    pub fn wait_for_work(&self, timeout: Duration) {
        let state = self.lock();
        if state.count > 0 || state.shutdown {
            return;
        }
        let _unused = self
            .available
            .wait_timeout_while(state, timeout, |s| s.count == 0 && !s.shutdown);
    }

    /// Drop every queued packet (push-profile flush). Returns how many
    /// were discarded.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.count;
        state.head = 0;
        state.tail = 0;
        state.count = 0;
        dropped
    }

    pub fn depth(&self) -> usize {
        self.lock().count
    }

    pub fn stats(&self) -> IntakeStats {
        self.lock().stats
    }

    /// Wake every waiter; subsequent waits return immediately.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.available.notify_all();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IntakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn packet(tag: u8, len: usize) -> Vec<u8> {
        let mut p = vec![tag; len];
        p[0] = tag;
        p
    }

    #[test]
    fn count_stays_within_bounds() {
        let intake = PacketIntake::new(8);
        for i in 0..50u8 {
            intake.submit(&packet(i, 10));
            assert!(intake.depth() <= 8);
        }
        assert_eq!(intake.depth(), 8);
    }

    #[test]
    fn overflow_evicts_oldest_and_keeps_newest() {
        // 100 packets into a 64-slot queue with no consumer: depth
        // stays 64, the oldest 36 are gone, order is preserved.
        let intake = PacketIntake::new(64);
        for i in 0..100u8 {
            intake.submit(&packet(i, 4));
        }
        assert_eq!(intake.depth(), 64);
        assert_eq!(intake.stats().evicted, 36);

        let mut out = [0u8; MAX_PACKET_BYTES];
        for expect in 36..100u8 {
            let len = intake.try_pop(&mut out).expect("queue drained early");
            assert_eq!(len, 4);
            assert_eq!(out[0], expect);
        }
        assert!(intake.try_pop(&mut out).is_none());
    }

    #[test]
    fn out_of_range_lengths_are_rejected() {
        let intake = PacketIntake::new(4);
        intake.submit(&[]);
        intake.submit(&vec![0u8; MAX_PACKET_BYTES + 1]);
        assert_eq!(intake.depth(), 0);
        assert_eq!(intake.stats().rejected_oversize, 2);

        // Exactly 4096 bytes is still legal
        intake.submit(&vec![7u8; MAX_PACKET_BYTES]);
        assert_eq!(intake.depth(), 1);
    }

    #[test]
    fn fifo_order() {
        let intake = PacketIntake::new(16);
        for i in 0..10u8 {
            intake.submit(&packet(i, 3));
        }
        let mut out = [0u8; MAX_PACKET_BYTES];
        for i in 0..10u8 {
            intake.try_pop(&mut out).unwrap();
            assert_eq!(out[0], i);
        }
    }

    #[test]
    fn clear_empties_the_queue() {
        let intake = PacketIntake::new(16);
        for i in 0..5u8 {
            intake.submit(&packet(i, 3));
        }
        assert_eq!(intake.clear(), 5);
        assert_eq!(intake.depth(), 0);
        let mut out = [0u8; MAX_PACKET_BYTES];
        assert!(intake.try_pop(&mut out).is_none());
    }

    #[test]
    fn wait_for_work_times_out_quickly_when_idle() {
        let intake = PacketIntake::new(4);
        let start = Instant::now();
        intake.wait_for_work(Duration::from_millis(1));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn wait_for_work_returns_immediately_after_shutdown() {
        let intake = PacketIntake::new(4);
        intake.shutdown();
        let start = Instant::now();
        intake.wait_for_work(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
