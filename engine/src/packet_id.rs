//! Monotonic packet-id generation and sliding-window replay detection.
//!
//! Every data-channel key slot owns one [Sender] for outbound ids and one
//! [ReplayWindow] for inbound ids. The control channel reuses the same
//! machinery in its time-stamped form when tls-auth or tls-crypt is active.

use crate::error::ErrorCode;
use thiserror::Error;

/// Default replay window width (in packet ids).
pub const DEFAULT_WINDOW: usize = 64;

/// Reasons an inbound packet-id is refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayError {
    #[error("packet-id zero is invalid")]
    Invalid,
    #[error("packet-id {0} already seen")]
    Replayed(u64),
    #[error("packet-id {0} below window")]
    Expired(u64),
    #[error("timestamp {got} backtracks past {floor}")]
    TimeBacktrack { got: u32, floor: u32 },
}

impl ReplayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Invalid => ErrorCode::PktidInvalid,
            Self::Replayed(_) => ErrorCode::PktidReplay,
            Self::Expired(_) => ErrorCode::PktidExpire,
            Self::TimeBacktrack { .. } => ErrorCode::PktidTimeBacktrack,
        }
    }
}

/// Outbound packet-id source for one key slot.
///
/// Ids start at 1 and never wrap: exhausting the 32-bit space is reported so
/// the caller can force renegotiation instead of silently reusing an id.
#[derive(Clone, Debug, Default)]
pub struct Sender {
    issued: u64,
}

impl Sender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw the next id. Fails once the space is exhausted.
    pub fn next(&mut self) -> Result<u32, ReplayError> {
        if self.issued >= u32::MAX as u64 {
            return Err(ReplayError::Expired(self.issued + 1));
        }
        self.issued += 1;
        Ok(self.issued as u32)
    }

    /// Ids issued so far.
    pub fn issued(&self) -> u64 {
        self.issued
    }

    /// Whether the next draw will fail.
    pub fn exhausted(&self) -> bool {
        self.issued >= u32::MAX as u64
    }

    /// Position the counter so the next draw returns `next`.
    ///
    /// Used when resuming and by exhaustion tests.
    pub fn prime(&mut self, next: u32) {
        self.issued = (next as u64).saturating_sub(1);
    }
}

/// Outbound id source for long-lived keys: a 32-bit epoch-seconds stamp with
/// a 32-bit sub-counter that restarts whenever the stamp advances.
#[derive(Clone, Debug, Default)]
pub struct TimeSender {
    time: u32,
    inner: Sender,
}

impl TimeSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw the next (time, id) pair for `now` (epoch seconds).
    pub fn next(&mut self, now: u32) -> Result<(u32, u32), ReplayError> {
        if self.time == 0 {
            self.time = now.max(1);
        }
        if self.inner.exhausted() {
            // Move to a fresh second so the sub-counter can restart. If the
            // clock has not advanced past the current stamp there is nothing
            // monotonic left to hand out.
            if now <= self.time {
                return Err(ReplayError::Expired(u32::MAX as u64));
            }
            self.time = now;
            self.inner = Sender::new();
        }
        let id = self.inner.next()?;
        Ok((self.time, id))
    }
}

/// Sliding-bitmap replay window over inbound packet ids.
///
/// The window tracks the highest id accepted so far (`head`) and a bitmap of
/// the `width` ids at or below it. Advancing the head shifts the bitmap;
/// a jump of `width` or more clears it entirely.
#[derive(Clone, Debug)]
pub struct ReplayWindow {
    head: u64,
    width: usize,
    bits: Vec<u64>,
    last_time: u32,
    time_slack: u32,
}

impl ReplayWindow {
    /// A window tracking `width` ids. Width is rounded up to a whole number
    /// of 64-bit words.
    pub fn new(width: usize) -> Self {
        let width = width.max(1);
        Self {
            head: 0,
            width,
            bits: vec![0; width.div_ceil(64)],
            last_time: 0,
            time_slack: 0,
        }
    }

    /// A window that also enforces forward progress of embedded timestamps,
    /// allowing `slack` seconds of backtrack.
    pub fn with_time(width: usize, slack: u32) -> Self {
        let mut window = Self::new(width);
        window.time_slack = slack;
        window
    }

    /// Highest id accepted so far.
    pub fn head(&self) -> u64 {
        self.head
    }

    fn bit(&self, offset: usize) -> bool {
        self.bits[offset / 64] & (1 << (offset % 64)) != 0
    }

    fn set_bit(&mut self, offset: usize) {
        self.bits[offset / 64] |= 1 << (offset % 64);
    }

    fn clear_all(&mut self) {
        self.bits.iter_mut().for_each(|word| *word = 0);
    }

    /// Shift the bitmap towards older ids by `by` positions (head advanced).
    fn shift(&mut self, by: usize) {
        if by >= self.width {
            self.clear_all();
            return;
        }
        let words = by / 64;
        let bits = by % 64;
        let len = self.bits.len();
        if words > 0 {
            for i in (0..len).rev() {
                self.bits[i] = if i >= words { self.bits[i - words] } else { 0 };
            }
        }
        if bits > 0 {
            let mut carry = 0u64;
            for word in self.bits.iter_mut() {
                let next_carry = *word >> (64 - bits);
                *word = (*word << bits) | carry;
                carry = next_carry;
            }
        }
    }

    /// Admit `id` into the window, updating it on success.
    pub fn accept(&mut self, id: u64) -> Result<(), ReplayError> {
        if id == 0 {
            return Err(ReplayError::Invalid);
        }
        if id > self.head {
            let advance = (id - self.head).min(self.width as u64 + 1) as usize;
            self.shift(advance);
            self.head = id;
            self.set_bit(0);
            return Ok(());
        }
        let offset = (self.head - id) as usize;
        if offset >= self.width {
            return Err(ReplayError::Expired(id));
        }
        if self.bit(offset) {
            return Err(ReplayError::Replayed(id));
        }
        self.set_bit(offset);
        Ok(())
    }

    /// Admit a (time, id) pair, combining both into one monotonic sequence.
    ///
    /// A timestamp older than the newest accepted one by more than the
    /// configured slack is refused outright.
    pub fn accept_with_time(&mut self, time: u32, id: u32) -> Result<(), ReplayError> {
        if time < self.last_time && self.last_time - time > self.time_slack {
            return Err(ReplayError::TimeBacktrack {
                got: time,
                floor: self.last_time - self.time_slack,
            });
        }
        self.accept(((time as u64) << 32) | id as u64)?;
        self.last_time = self.last_time.max(time);
        Ok(())
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_monotonic() {
        let mut sender = Sender::new();
        let mut last = 0;
        for _ in 0..100 {
            let id = sender.next().unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_sender_exhaustion() {
        let mut sender = Sender::new();
        sender.prime(u32::MAX);
        // The final id is usable; the one after it must refuse, not wrap.
        assert_eq!(sender.next().unwrap(), u32::MAX);
        assert!(matches!(sender.next(), Err(ReplayError::Expired(_))));
        assert!(sender.exhausted());
    }

    #[test]
    fn test_time_sender_restarts_counter() {
        let mut sender = TimeSender::new();
        let (t1, id1) = sender.next(1_000).unwrap();
        assert_eq!((t1, id1), (1_000, 1));

        sender.inner.prime(u32::MAX);
        sender.inner.next().unwrap();

        // Clock stuck: nothing monotonic left.
        assert!(sender.next(1_000).is_err());

        // Clock advanced: fresh epoch, counter restarts.
        let (t2, id2) = sender.next(1_001).unwrap();
        assert_eq!((t2, id2), (1_001, 1));
    }

    #[test]
    fn test_window_accept_reject_sequence() {
        let mut window = ReplayWindow::new(8);
        for id in [1u64, 2, 3, 5, 4, 6, 8, 7] {
            window.accept(id).unwrap();
        }
        assert!(matches!(window.accept(2), Err(ReplayError::Replayed(2))));
    }

    #[test]
    fn test_window_zero_invalid() {
        let mut window = ReplayWindow::new(8);
        assert!(matches!(window.accept(0), Err(ReplayError::Invalid)));
    }

    #[test]
    fn test_window_edge() {
        let mut window = ReplayWindow::new(8);
        window.accept(100).unwrap();

        // head - width is out; head - width + 1 is in (bit unset).
        assert!(matches!(window.accept(92), Err(ReplayError::Expired(92))));
        window.accept(93).unwrap();
        assert!(matches!(window.accept(93), Err(ReplayError::Replayed(93))));
    }

    #[test]
    fn test_window_capacity_evicts_eldest() {
        let mut window = ReplayWindow::new(4);
        for id in 1..=4u64 {
            window.accept(id).unwrap();
        }
        // Admitting a new maximum slides id 1 out of the window.
        window.accept(5).unwrap();
        assert!(matches!(window.accept(1), Err(ReplayError::Expired(1))));
        window.accept(2).err().unwrap();
    }

    #[test]
    fn test_window_large_jump_clears() {
        let mut window = ReplayWindow::new(64);
        window.accept(1).unwrap();
        window.accept(1_000_000).unwrap();
        // Everything below the new head's window is gone.
        assert!(window.accept(1_000_000 - 63).is_ok());
        assert!(matches!(
            window.accept(1_000_000 - 64),
            Err(ReplayError::Expired(_))
        ));
    }

    #[test]
    fn test_window_wide_bitmap() {
        let mut window = ReplayWindow::new(256);
        window.accept(300).unwrap();
        window.accept(300 - 255).unwrap();
        assert!(matches!(
            window.accept(300 - 256),
            Err(ReplayError::Expired(_))
        ));
        // Re-offering the in-window id is a replay.
        assert!(matches!(
            window.accept(300 - 255),
            Err(ReplayError::Replayed(_))
        ));
    }

    #[test]
    fn test_time_backtrack() {
        let mut window = ReplayWindow::with_time(64, 10);
        window.accept_with_time(1_000, 1).unwrap();
        window.accept_with_time(1_000, 2).unwrap();

        // Within slack: not a time backtrack, but the stale era falls below
        // the combined window and is expired.
        assert!(matches!(
            window.accept_with_time(995, u32::MAX),
            Err(ReplayError::Expired(_))
        ));

        // Beyond slack: refused as a time backtrack.
        assert!(matches!(
            window.accept_with_time(989, 1),
            Err(ReplayError::TimeBacktrack { .. })
        ));
    }

    #[test]
    fn test_time_forward_progress() {
        let mut window = ReplayWindow::with_time(64, 0);
        window.accept_with_time(1_000, 5).unwrap();
        window.accept_with_time(1_001, 1).unwrap();
        assert!(matches!(
            window.accept_with_time(1_000, 6),
            Err(ReplayError::TimeBacktrack { .. })
        ));
    }
}
