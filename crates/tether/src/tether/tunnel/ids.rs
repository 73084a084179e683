use std::{
    fmt,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

/// Largest id handed out; the sign bit is never set.
pub const MAX_SESSION_ID: u32 = i32::MAX as u32;

/// Session id source for user connections awaiting a data connection.
///
/// Ids increase by one and wrap from [`MAX_SESSION_ID`] back to 1, so they
/// stay positive when read as an `i32` on the wire and 0 is never issued.
#[derive(Debug)]
pub struct SessionIds {
    next: AtomicU32,
}

impl SessionIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u32) -> Self {
        let first = if first == 0 || first > MAX_SESSION_ID {
            1
        } else {
            first
        };
        Self {
            next: AtomicU32::new(first),
        }
    }

    pub fn next_id(&self) -> u32 {
        let mut cur = self.next.load(Ordering::Relaxed);
        loop {
            let following = if cur >= MAX_SESSION_ID { 1 } else { cur + 1 };
            match self
                .next
                .compare_exchange_weak(cur, following, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return cur,
                Err(actual) => cur = actual,
            }
        }
    }
}

impl Default for SessionIds {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c-{}", self.0)
    }
}

#[derive(Debug)]
pub struct ConnIds {
    seq: AtomicU64,
}

impl ConnIds {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnId {
        ConnId(self.seq.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnIds {
    fn default() -> Self {
        Self::new()
    }
}
