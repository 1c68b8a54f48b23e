//! Buffer I/O state machine
//!
//! ```text
//!            get(read)              completion
//!  Idle{clean} ───────► Reading ───────────────► Idle{clean}
//!       │  ▲
//! mark  │  │ completion(ok)
//! dirty ▼  │
//!  Idle{dirty} ──flush──► Writing{dirty_again: false}
//!       ▲                    │ mark_dirty
//!       │                    ▼
//!       └──completion──── Writing{dirty_again: true}
//! ```
//!
//! A failed write also returns to `Idle{dirty}`: the data is still newer
//! than the device copy.

use std::fmt;

/// Which eviction list a buffer belongs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Clean,
    Dirty,
}

/// I/O state of one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// No I/O pending; `dirty` if memory is newer than the device
    Idle { dirty: bool },
    /// A device read is filling the data region
    Reading,
    /// A device write is in flight; `dirty_again` if mutated since it started
    Writing { dirty_again: bool },
}

impl BufferState {
    /// Fresh buffer with no I/O behind it
    pub const CLEAN: Self = Self::Idle { dirty: false };

    /// Whether a device operation is in flight
    #[must_use]
    pub const fn io_pending(self) -> bool {
        matches!(self, Self::Reading | Self::Writing { .. })
    }

    /// Whether the buffer holds data the device does not have yet
    #[must_use]
    pub const fn is_dirty(self) -> bool {
        matches!(self, Self::Idle { dirty: true } | Self::Writing { .. })
    }

    /// Idle and clean: the only state eviction may free directly
    #[must_use]
    pub const fn is_clean_idle(self) -> bool {
        matches!(self, Self::Idle { dirty: false })
    }

    /// List membership implied by this state
    #[must_use]
    pub const fn list(self) -> ListKind {
        if self.is_dirty() {
            ListKind::Dirty
        } else {
            ListKind::Clean
        }
    }

    /// `Idle{clean}` → `Reading`
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not idle and clean.
    #[must_use]
    pub fn begin_read(self) -> Self {
        assert!(
            self.is_clean_idle(),
            "read issued on buffer in state {self}"
        );
        Self::Reading
    }

    /// `Reading` → `Idle{clean}`, whatever the outcome
    ///
    /// # Panics
    ///
    /// Panics if no read is pending.
    #[must_use]
    pub fn finish_read(self) -> Self {
        assert!(self == Self::Reading, "read completion in state {self}");
        Self::CLEAN
    }

    /// Record a mutation; idempotent
    ///
    /// # Panics
    ///
    /// Panics while `Reading`: mutating data that a read is filling is a
    /// caller bug.
    #[must_use]
    pub fn mark_dirty(self) -> Self {
        match self {
            Self::Idle { .. } => Self::Idle { dirty: true },
            Self::Writing { .. } => Self::Writing { dirty_again: true },
            Self::Reading => panic!("mark_dirty called on a buffer that is being read"),
        }
    }

    /// `Idle{dirty}` → `Writing`, or `None` if there is nothing to write
    #[must_use]
    pub const fn begin_write(self) -> Option<Self> {
        match self {
            Self::Idle { dirty: true } => Some(Self::Writing { dirty_again: false }),
            _ => None,
        }
    }

    /// `Writing` → `Idle`, dirty if mutated meanwhile or if the write failed
    ///
    /// # Panics
    ///
    /// Panics if no write is pending.
    #[must_use]
    pub fn finish_write(self, succeeded: bool) -> Self {
        match self {
            Self::Writing { dirty_again } => Self::Idle {
                dirty: dirty_again || !succeeded,
            },
            other => panic!("write completion in state {other}"),
        }
    }
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle { dirty: false } => f.write_str("idle(clean)"),
            Self::Idle { dirty: true } => f.write_str("idle(dirty)"),
            Self::Reading => f.write_str("reading"),
            Self::Writing { dirty_again: false } => f.write_str("writing"),
            Self::Writing { dirty_again: true } => f.write_str("writing(dirty again)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_cycle() {
        let state = BufferState::CLEAN.begin_read();
        assert!(state.io_pending());
        assert_eq!(state.list(), ListKind::Clean);
        assert_eq!(state.finish_read(), BufferState::CLEAN);
    }

    #[test]
    fn test_write_cycle() {
        let dirty = BufferState::CLEAN.mark_dirty();
        assert_eq!(dirty, BufferState::Idle { dirty: true });
        assert_eq!(dirty.mark_dirty(), dirty);
        assert_eq!(dirty.list(), ListKind::Dirty);

        let writing = dirty.begin_write().unwrap();
        assert_eq!(writing.list(), ListKind::Dirty);
        assert_eq!(writing.finish_write(true), BufferState::CLEAN);
    }

    #[test]
    fn test_dirty_during_write_stays_dirty() {
        let writing = BufferState::CLEAN.mark_dirty().begin_write().unwrap();
        let again = writing.mark_dirty();
        assert_eq!(again, BufferState::Writing { dirty_again: true });
        assert_eq!(again.finish_write(true), BufferState::Idle { dirty: true });
    }

    #[test]
    fn test_failed_write_stays_dirty() {
        let writing = BufferState::CLEAN.mark_dirty().begin_write().unwrap();
        assert_eq!(writing.finish_write(false), BufferState::Idle { dirty: true });
    }

    #[test]
    fn test_nothing_to_write() {
        assert!(BufferState::CLEAN.begin_write().is_none());
        assert!(BufferState::Reading.begin_write().is_none());
        assert!(
            BufferState::Writing { dirty_again: true }
                .begin_write()
                .is_none()
        );
    }

    #[test]
    #[should_panic(expected = "being read")]
    fn test_mark_dirty_during_read_panics() {
        let _ = BufferState::Reading.mark_dirty();
    }

    #[test]
    #[should_panic(expected = "write completion")]
    fn test_unexpected_write_completion_panics() {
        let _ = BufferState::CLEAN.finish_write(true);
    }
}
