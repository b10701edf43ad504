//! Cancellable one-shot timer guarding the Claiming -> Claimed transition.
//!
//! The timer itself never runs anything. Its owner polls it with the current
//! time; an expired timer hands out a [`FireToken`] and the owner completes the
//! firing once it holds the interface write lock. Arming, cancelling and firing
//! all go through one atomic word so a cancel that races a fire wins without
//! either side waiting on the other.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::Timestamp;

const IDLE: u64 = 0;
const ARMED: u64 = 1;
const FIRING: u64 = 2;
const CANCELLED: u64 = 3;

const STATE_BITS: u32 = 2;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

fn state_of(word: u64) -> u64 {
    word & STATE_MASK
}

fn generation_of(word: u64) -> u64 {
    word >> STATE_BITS
}

fn pack(generation: u64, state: u64) -> u64 {
    (generation << STATE_BITS) | state
}

/// Proof that a particular arming of the timer expired and was picked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FireToken(u64);

#[derive(Debug, Default)]
pub struct ClaimTimer {
    word: AtomicU64,
    deadline: AtomicU64,
}

impl ClaimTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms (or re-arms) the timer. Any outstanding [`FireToken`] is invalidated.
    pub fn arm(&self, deadline: Timestamp) {
        self.deadline.store(deadline, Ordering::Release);
        let _ = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some(pack(generation_of(word) + 1, ARMED))
            });
    }

    /// Idempotent, never waits. Returns true if an arming or an in-flight
    /// firing was cancelled.
    pub fn cancel(&self) -> bool {
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                match state_of(word) {
                    ARMED | FIRING => Some(pack(generation_of(word), CANCELLED)),
                    _ => None,
                }
            })
            .is_ok()
    }

    pub fn is_armed(&self) -> bool {
        state_of(self.word.load(Ordering::Acquire)) == ARMED
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        if self.is_armed() {
            Some(self.deadline.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Claims an expired arming for firing. Only one caller gets the token.
    pub fn try_fire(&self, now: Timestamp) -> Option<FireToken> {
        let word = self.word.load(Ordering::Acquire);
        if state_of(word) != ARMED || now < self.deadline.load(Ordering::Acquire) {
            return None;
        }
        let firing = pack(generation_of(word), FIRING);
        self.word
            .compare_exchange(word, firing, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FireToken(firing))
    }

    /// Finishes a firing. False if the timer was cancelled or re-armed since
    /// the token was handed out; the caller must then not act on it.
    pub fn complete(&self, token: FireToken) -> bool {
        let done = pack(generation_of(token.0), IDLE);
        self.word
            .compare_exchange(token.0, done, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
