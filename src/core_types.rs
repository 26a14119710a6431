//! Core identifier types used throughout the coordinator
//!
//! A [`Gtrid`] names one global transaction; an [`Xid`] names one branch of it
//! (one resource's participation).

use std::fmt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Server ID embedded in every gtrid created by a coordinator instance.
pub type ServerId = u8;

/// Journal sequence number
pub type SeqNum = u64;

const SEQUENCE_BITS: u32 = 15;
const SERVER_ID_BITS: u32 = 8;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + SERVER_ID_BITS;

/// Global transaction identifier.
///
/// Snowflake layout:
///
/// ```text
/// | timestamp_ms (41 bits) | server_id (8 bits) | sequence (15 bits) |
/// ```
///
/// The embedded server id lets recovery tell branches created by this
/// coordinator apart from foreign ones, and the timestamp gives the age of a
/// branch without any journal lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gtrid(u64);

impl Gtrid {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Server id of the coordinator that created this gtrid
    #[inline]
    pub fn server_id(&self) -> ServerId {
        ((self.0 >> SEQUENCE_BITS) & 0xFF) as ServerId
    }

    /// Creation time in milliseconds since the unix epoch
    #[inline]
    pub fn timestamp_ms(&self) -> u64 {
        self.0 >> TIMESTAMP_SHIFT
    }

    /// Age relative to `now_ms` (saturating)
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp_ms())
    }
}

impl fmt::Display for Gtrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Branch identifier: one resource's participation in a global transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid {
    pub gtrid: Gtrid,
    /// Branch qualifier, allocated in enlistment order starting at 1
    pub bqual: u32,
}

impl Xid {
    pub fn new(gtrid: Gtrid, bqual: u32) -> Self {
        Self { gtrid, bqual }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.gtrid, self.bqual)
    }
}

/// Current wall clock in milliseconds since the unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct SnowflakeState {
    sequence: u64,
    last_timestamp: u64,
}

/// Gtrid generator
///
/// Monotonic even if the wall clock steps backwards or more than 2^15 ids are
/// requested within one millisecond: the generator then borrows from the next
/// millisecond.
pub struct UidGenerator {
    server_id: ServerId,
    state: Mutex<SnowflakeState>,
}

impl UidGenerator {
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            state: Mutex::new(SnowflakeState {
                sequence: 0,
                last_timestamp: 0,
            }),
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn generate(&self) -> Gtrid {
        let now = now_ms();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if now > state.last_timestamp {
            state.last_timestamp = now;
            state.sequence = 0;
        } else {
            state.sequence += 1;
            if state.sequence > SEQUENCE_MASK {
                state.last_timestamp += 1;
                state.sequence = 0;
            }
        }

        Gtrid(
            (state.last_timestamp << TIMESTAMP_SHIFT)
                | ((self.server_id as u64) << SEQUENCE_BITS)
                | state.sequence,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_is_monotonic() {
        let generator = UidGenerator::new(7);
        let mut previous = generator.generate();
        for _ in 0..50_000 {
            let next = generator.generate();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn test_gtrid_fields() {
        let before = now_ms();
        let gtrid = UidGenerator::new(42).generate();

        assert_eq!(gtrid.server_id(), 42);
        assert!(gtrid.timestamp_ms() >= before);
        assert!(gtrid.age_ms(gtrid.timestamp_ms() + 1500) == 1500);
        assert_eq!(gtrid.age_ms(0), 0);
    }

    #[test]
    fn test_display() {
        let gtrid = Gtrid::from_raw(0xabc);
        assert_eq!(gtrid.to_string(), "0000000000000abc");
        assert_eq!(Xid::new(gtrid, 2).to_string(), "0000000000000abc:2");
    }
}
