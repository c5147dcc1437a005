//! The Fischer chess clock bookkeeping. The clock is a sequence of immutable
//! snapshots, one per mutating game operation. A snapshot stores both reserves in
//! milliseconds and which side is currently ticking. The reserve of the ticking
//! side at wall time `t` is `stored - (t - updated_at)`, everything else is frozen.

use chrono::{DateTime, Duration, Utc};
use engine::Color;
use protocol::TimeRemainders;
use serde::{Deserialize, Serialize};

/// Which game operation produced a snapshot.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClockReason {
    Init,
    Ply,
    Rollback,
    TimeAdded,
    GameEnded,
}

/// One clock snapshot. `ticking = None` means the clock is paused, which holds
/// before the second ply and after the game ended.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
pub struct TimeUpdate {
    pub updated_at: DateTime<Utc>,
    pub white_ms: i64,
    pub black_ms: i64,
    pub ticking: Option<Color>,
    pub reason: ClockReason,
}

/// Raised when a reserve ran out while deriving the next snapshot. The game has
/// to end by TIMEOUT instead of accepting the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutReached {
    pub winner: Color,
    /// The wall time at which the reserve crossed the allowed deficit.
    pub reached_at: DateTime<Utc>,
}

/// The ticking side after a ply: the clock only runs once both players made
/// their opening ply.
fn ticking_after(new_ply_index: u32, mover: Color) -> Option<Color> {
    (new_ply_index >= 1).then(|| mover.opposite())
}

impl TimeUpdate {
    /// The INIT snapshot of a fresh Fischer game, both reserves full, paused.
    pub fn init(start_ms: i64, at: DateTime<Utc>) -> TimeUpdate {
        TimeUpdate {
            updated_at: at,
            white_ms: start_ms,
            black_ms: start_ms,
            ticking: None,
            reason: ClockReason::Init,
        }
    }

    /// The stored reserve of one side.
    pub fn reserve(&self, color: Color) -> i64 {
        match color {
            Color::White => self.white_ms,
            Color::Black => self.black_ms,
        }
    }

    fn reserve_mut(&mut self, color: Color) -> &mut i64 {
        match color {
            Color::White => &mut self.white_ms,
            Color::Black => &mut self.black_ms,
        }
    }

    /// Derives the PLY snapshot following this one. Charges the elapsed wall time
    /// to the side that was ticking, credits the increment to the mover when the
    /// mover was the one ticking, then hands the clock to the side to move.
    ///
    /// Fails with [`TimeoutReached`] when the charged reserve falls to or below
    /// the negative grace, in which case no ply must be appended.
    pub fn after_ply(
        &self,
        new_ply_index: u32,
        mover: Color,
        increment_ms: i64,
        grace_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<TimeUpdate, TimeoutReached> {
        let mut next = *self;
        next.updated_at = now;
        next.reason = ClockReason::Ply;
        if let Some(side) = self.ticking {
            let elapsed = (now - self.updated_at).num_milliseconds().max(0);
            let charged = self.reserve(side) - elapsed;
            if charged <= -grace_ms {
                return Err(TimeoutReached {
                    winner: side.opposite(),
                    reached_at: self.updated_at
                        + Duration::milliseconds(self.reserve(side) + grace_ms),
                });
            }
            *next.reserve_mut(side) = charged;
            if side == mover {
                *next.reserve_mut(mover) += increment_ms;
            }
        }
        next.ticking = ticking_after(new_ply_index, mover);
        Ok(next)
    }

    /// The PLY snapshot built from reserves an external uploader reported
    /// explicitly. Only the ticking side rule is applied on top.
    pub fn from_remainders(
        remainders: &TimeRemainders,
        new_ply_index: u32,
        mover: Color,
        now: DateTime<Utc>,
    ) -> TimeUpdate {
        TimeUpdate {
            updated_at: now,
            white_ms: remainders.white_ms,
            black_ms: remainders.black_ms,
            ticking: ticking_after(new_ply_index, mover),
            reason: ClockReason::Ply,
        }
    }

    /// The TIME_ADDED snapshot: one reserve grows, the ticking side is untouched.
    pub fn with_time_added(
        &self,
        receiver: Color,
        amount_ms: i64,
        now: DateTime<Utc>,
    ) -> TimeUpdate {
        let mut next = *self;
        next.updated_at = now;
        next.reason = ClockReason::TimeAdded;
        *next.reserve_mut(receiver) += amount_ms;
        next
    }

    /// The ROLLBACK snapshot: the reserves of the snapshot the game rolled back
    /// onto, with a fresh timestamp and the ticking side the caller derived from
    /// the shortened ply list.
    pub fn rolled_back(&self, ticking: Option<Color>, now: DateTime<Utc>) -> TimeUpdate {
        TimeUpdate {
            updated_at: now,
            white_ms: self.white_ms,
            black_ms: self.black_ms,
            ticking,
            reason: ClockReason::Rollback,
        }
    }

    /// The final GAME_ENDED snapshot. The ticking side is charged a last time,
    /// then the clock stops for good.
    pub fn ended(&self, now: DateTime<Utc>) -> TimeUpdate {
        let mut next = *self;
        next.updated_at = now;
        next.reason = ClockReason::GameEnded;
        if let Some(side) = self.ticking {
            let elapsed = (now - self.updated_at).num_milliseconds().max(0);
            *next.reserve_mut(side) -= elapsed;
        }
        next.ticking = None;
        next
    }

    /// The polled timeout check against this snapshot. Returns the timeout result
    /// when the ticking side's residual reserve dropped to or below the negative
    /// grace at wall time `now`.
    pub fn poll_timeout(&self, grace_ms: i64, now: DateTime<Utc>) -> Option<TimeoutReached> {
        let side = self.ticking?;
        let elapsed = (now - self.updated_at).num_milliseconds().max(0);
        let residual = self.reserve(side) - elapsed;
        (residual <= -grace_ms).then(|| TimeoutReached {
            winner: side.opposite(),
            reached_at: self.updated_at + Duration::milliseconds(self.reserve(side) + grace_ms),
        })
    }
}
