//! Pure countdown arithmetic, free of clocks and I/O.

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing happened: already expired, not loaded, or not active.
    Idle,
    /// Decremented to the contained value.
    Counted(u32),
    /// Decremented to the contained value, which should be persisted.
    Persist(u32),
    /// Reached zero on this tick. Returned at most once.
    Expired,
}

/// A seconds countdown that reports persistence points and expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Countdown {
    remaining: u32,
    persist_every: u32,
    expired: bool,
}

impl Countdown {
    /// Start at `remaining` seconds, flagging a persist whenever the value
    /// is a multiple of `persist_every`. Zero disables periodic persistence.
    pub fn new(remaining: u32, persist_every: u32) -> Self {
        Self {
            remaining,
            persist_every,
            expired: false,
        }
    }

    /// Seconds left.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Whether expiry has been reported.
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Advance one second.
    pub fn tick(&mut self) -> TickOutcome {
        if self.expired || self.remaining == 0 {
            return TickOutcome::Idle;
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.expired = true;
            return TickOutcome::Expired;
        }
        if self.remaining.checked_rem(self.persist_every) == Some(0) {
            TickOutcome::Persist(self.remaining)
        } else {
            TickOutcome::Counted(self.remaining)
        }
    }

    /// Mark a countdown that was loaded at zero as expired. Returns `true`
    /// only the first time, so the caller submits once.
    pub fn expire(&mut self) -> bool {
        if self.expired {
            return false;
        }
        self.remaining = 0;
        self.expired = true;
        true
    }
}
