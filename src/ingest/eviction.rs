//! Per-location capacity policy.
//!
//! A location pool holds at most `cap` active (non-failed) candidates. Once it
//! is full, a newcomer only gets in by beating the current worst member, which
//! keeps each pool at the `cap` lowest delays observed so far.

use chrono::{DateTime, Utc};

/// The member a full pool would give up. Ordered worst-first by the store:
/// highest delay, then oldest `last_tested`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSlot {
    pub link: String,
    pub delay: Option<u32>,
    pub last_tested: Option<DateTime<Utc>>,
}

/// What to do with a passed latency result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Room left: insert or refresh unconditionally.
    Insert,
    /// Pool full and the newcomer is strictly faster: delete this slot first.
    Replace(PoolSlot),
    /// Pool full and the newcomer is no better than the worst member.
    Discard,
}

/// Decide admission for a result with `delay` into a pool that currently has
/// `active` other members and `worst` as its weakest one.
///
/// A worst member without a recorded delay always loses.
pub fn decide(active: u64, cap: u32, worst: Option<&PoolSlot>, delay: u32) -> Admission {
    if active < u64::from(cap) {
        return Admission::Insert;
    }
    match worst {
        Some(slot) if slot.delay.map_or(true, |worst_delay| delay < worst_delay) => {
            Admission::Replace(slot.clone())
        }
        _ => Admission::Discard,
    }
}
