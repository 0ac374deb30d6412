//! Logical clocks (change numbers) that order every replicated change.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of the textual clock form: 16 hex digits of time, 4 of sequence,
/// 8 of replica id.
pub const CLOCK_STRING_LEN: usize = 28;

/// A change number: `(time_ms, seq, replica_id)`.
///
/// Ordered by time, then sequence, then replica id, so two replicas that
/// stamp a change in the same millisecond with the same sequence still
/// produce distinct, totally ordered clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalClock {
    time_ms: u64,
    seq: u16,
    replica_id: u32,
}

impl LogicalClock {
    /// Create a clock from its parts.
    pub const fn new(time_ms: u64, seq: u16, replica_id: u32) -> Self {
        Self {
            time_ms,
            seq,
            replica_id,
        }
    }

    /// The smallest clock a replica can carry; used as "nothing seen yet".
    pub const fn zero(replica_id: u32) -> Self {
        Self::new(0, 0, replica_id)
    }

    /// Milliseconds since the Unix epoch.
    pub fn time_ms(&self) -> u64 {
        self.time_ms
    }

    /// Sequence number.
    pub fn seq(&self) -> u16 {
        self.seq
    }

    /// Replica that originated the change.
    pub fn replica_id(&self) -> u32 {
        self.replica_id
    }

    /// Number of changes between `older` and `self` from the same origin,
    /// counted on the sequence, which wraps at `u16::MAX`.
    ///
    /// Returns 0 when `older` is not actually older.
    pub fn seq_distance(&self, older: Option<&LogicalClock>) -> u32 {
        let Some(older) = older else {
            return u32::from(self.seq);
        };
        if older >= self || older.time_ms > self.time_ms {
            return 0;
        }
        if older.seq <= self.seq {
            u32::from(self.seq - older.seq)
        } else {
            u32::from(u16::MAX - older.seq) + u32::from(self.seq) + 1
        }
    }
}

impl Ord for LogicalClock {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.time_ms, self.seq, self.replica_id).cmp(&(
            other.time_ms,
            other.seq,
            other.replica_id,
        ))
    }
}

impl PartialOrd for LogicalClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for LogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:04x}{:08x}", self.time_ms, self.seq, self.replica_id)
    }
}

/// Error parsing the textual clock form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid logical clock: {input:?}")]
pub struct ClockParseError {
    /// The rejected input.
    pub input: String,
}

impl FromStr for LogicalClock {
    type Err = ClockParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ClockParseError {
            input: s.to_string(),
        };
        if s.len() != CLOCK_STRING_LEN || !s.is_ascii() {
            return Err(err());
        }
        let time_ms = u64::from_str_radix(&s[0..16], 16).map_err(|_| err())?;
        let seq = u16::from_str_radix(&s[16..20], 16).map_err(|_| err())?;
        let replica_id = u32::from_str_radix(&s[20..28], 16).map_err(|_| err())?;
        Ok(Self::new(time_ms, seq, replica_id))
    }
}

/// Source of wall-clock milliseconds.
pub type TimeSource = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Milliseconds since the Unix epoch from the system clock.
pub fn system_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Default)]
struct GeneratorState {
    last_time: u64,
    seq: u16,
}

/// Issues strictly increasing clocks for one replica.
pub struct ClockGenerator {
    replica_id: u32,
    state: Mutex<GeneratorState>,
    time_source: TimeSource,
}

impl fmt::Debug for ClockGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClockGenerator")
            .field("replica_id", &self.replica_id)
            .finish()
    }
}

impl ClockGenerator {
    /// Generator driven by the system clock.
    pub fn new(replica_id: u32) -> Self {
        Self::with_time_source(replica_id, Arc::new(system_time_ms))
    }

    /// Generator driven by `time_source`.
    pub fn with_time_source(replica_id: u32, time_source: TimeSource) -> Self {
        Self {
            replica_id,
            state: Mutex::new(GeneratorState::default()),
            time_source,
        }
    }

    /// Replica id stamped on every clock.
    pub fn replica_id(&self) -> u32 {
        self.replica_id
    }

    /// Next clock. Never equal to or older than a clock issued before.
    pub fn next_clock(&self) -> LogicalClock {
        let now = (self.time_source)();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if now > state.last_time {
            state.last_time = now;
        }
        state.seq = state.seq.wrapping_add(1);
        if state.seq == 0 {
            // Sequence wrapped inside one millisecond: move time forward.
            state.last_time = state.last_time.saturating_add(1);
        }
        LogicalClock::new(state.last_time, state.seq, self.replica_id)
    }

    /// Merge a clock seen from elsewhere so later local clocks sort after it.
    pub fn adjust(&self, seen: &LogicalClock) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.last_time <= seen.time_ms {
            state.last_time = seen.time_ms.saturating_add(1);
        }
        if seen.replica_id == self.replica_id && state.seq < seen.seq {
            state.seq = seen.seq;
        }
    }

    /// Adjust to every clock in `state`.
    pub fn adjust_state(&self, state: &crate::state::ServerState) {
        for clock in state.clocks() {
            self.adjust(clock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

    fn fixed_time(ms: u64) -> (TimeSource, Arc<AtomicU64>) {
        let now = Arc::new(AtomicU64::new(ms));
        let source = {
            let now = Arc::clone(&now);
            Arc::new(move || now.load(AtomicOrdering::SeqCst)) as TimeSource
        };
        (source, now)
    }

    #[test]
    fn test_ordering_time_then_seq_then_replica() {
        let a = LogicalClock::new(10, 5, 9);
        let b = LogicalClock::new(11, 0, 1);
        let c = LogicalClock::new(11, 1, 1);
        let d = LogicalClock::new(11, 1, 2);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn test_string_form() {
        let clock = LogicalClock::new(10, 0, 0);
        assert_eq!(clock.to_string(), "000000000000000a000000000000");
        let clock = LogicalClock::new(0x1234, 0x0002, 0x0000_0abc);
        let text = clock.to_string();
        assert_eq!(text.len(), CLOCK_STRING_LEN);
        assert_eq!(text.parse::<LogicalClock>().unwrap(), clock);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("xyz".parse::<LogicalClock>().is_err());
        assert!("zz0000000000000a000000000000".parse::<LogicalClock>().is_err());
    }

    #[test]
    fn test_generator_monotonic_same_millisecond() {
        let (source, _now) = fixed_time(1000);
        let gen = ClockGenerator::with_time_source(3, source);
        let mut last = gen.next_clock();
        for _ in 0..1000 {
            let next = gen.next_clock();
            assert!(next > last);
            assert_eq!(next.replica_id(), 3);
            last = next;
        }
    }

    #[test]
    fn test_generator_survives_backwards_wall_clock() {
        let (source, now) = fixed_time(5000);
        let gen = ClockGenerator::with_time_source(1, source);
        let first = gen.next_clock();
        now.store(4000, AtomicOrdering::SeqCst);
        let second = gen.next_clock();
        assert!(second > first);
        assert_eq!(second.time_ms(), 5000);
    }

    #[test]
    fn test_sequence_wrap_moves_time() {
        let (source, _now) = fixed_time(7);
        let gen = ClockGenerator::with_time_source(1, source);
        let mut last = gen.next_clock();
        for _ in 0..(u16::MAX as u32 + 5) {
            let next = gen.next_clock();
            assert!(next > last);
            last = next;
        }
        assert!(last.time_ms() > 7);
    }

    #[test]
    fn test_adjust_moves_past_remote_clock() {
        let (source, _now) = fixed_time(100);
        let gen = ClockGenerator::with_time_source(1, source);
        let remote = LogicalClock::new(5000, 42, 2);
        gen.adjust(&remote);
        let next = gen.next_clock();
        assert!(next > remote);
        assert_eq!(next.time_ms(), 5001);
    }

    #[test]
    fn test_adjust_own_sequence() {
        let (source, _now) = fixed_time(100);
        let gen = ClockGenerator::with_time_source(1, source);
        gen.adjust(&LogicalClock::new(50, 300, 1));
        let next = gen.next_clock();
        assert_eq!(next.seq(), 301);
    }

    #[test]
    fn test_seq_distance() {
        let newer = LogicalClock::new(10, 8, 1);
        assert_eq!(newer.seq_distance(Some(&LogicalClock::new(9, 3, 1))), 5);
        assert_eq!(newer.seq_distance(None), 8);
        assert_eq!(newer.seq_distance(Some(&newer)), 0);
        let wrapped = LogicalClock::new(12, 2, 1);
        assert_eq!(wrapped.seq_distance(Some(&LogicalClock::new(11, u16::MAX - 1, 1))), 4);
    }
}
