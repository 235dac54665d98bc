//! Record lifecycle status.
//!
//! A [`Status`] is one [`CoreStatus`] plus a set of [`StatusFlags`]. The core
//! states are mutually exclusive; the flags annotate them. Every constructor
//! and transition validates the combination, so composite states such as
//! NEW + DESTROYED cannot be built.
//!
//! | Core          | Allowed flags                                   |
//! |---------------|-------------------------------------------------|
//! | EMPTY         | LOADING                                         |
//! | READY         | LOADING, COMMITTING, NEW, DIRTY, OBSOLETE (*)   |
//! | DESTROYED     | DIRTY, COMMITTING                               |
//! | NON_EXISTENT  | LOADING                                         |
//!
//! (*) NEW excludes LOADING and OBSOLETE: the source has never seen the record.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoreStatus {
    Empty,
    Ready,
    Destroyed,
    NonExistent,
}

impl CoreStatus {
    pub const fn bits(self) -> u16 {
        match self {
            CoreStatus::Empty => 1,
            CoreStatus::Ready => 2,
            CoreStatus::Destroyed => 4,
            CoreStatus::NonExistent => 8,
        }
    }

    fn allowed_flags(self) -> StatusFlags {
        match self {
            CoreStatus::Empty | CoreStatus::NonExistent => StatusFlags::LOADING,
            CoreStatus::Ready => StatusFlags::ALL,
            CoreStatus::Destroyed => StatusFlags::DIRTY | StatusFlags::COMMITTING,
        }
    }
}

/// Property flags that annotate a [`CoreStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StatusFlags(u16);

impl StatusFlags {
    pub const NONE: StatusFlags = StatusFlags(0);
    pub const LOADING: StatusFlags = StatusFlags(16);
    pub const COMMITTING: StatusFlags = StatusFlags(32);
    pub const NEW: StatusFlags = StatusFlags(64);
    pub const DIRTY: StatusFlags = StatusFlags(128);
    pub const OBSOLETE: StatusFlags = StatusFlags(256);
    pub const ALL: StatusFlags = StatusFlags(16 | 32 | 64 | 128 | 256);

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: StatusFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: StatusFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn union(self, other: StatusFlags) -> StatusFlags {
        StatusFlags(self.0 | other.0)
    }

    pub const fn difference(self, other: StatusFlags) -> StatusFlags {
        StatusFlags(self.0 & !other.0)
    }
}

impl BitOr for StatusFlags {
    type Output = StatusFlags;

    fn bitor(self, rhs: StatusFlags) -> StatusFlags {
        self.union(rhs)
    }
}

/// Rejected core/flag combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusError {
    pub core: CoreStatus,
    pub flags: StatusFlags,
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} cannot carry flags {:#x}",
            self.core,
            self.flags.bits()
        )
    }
}

impl std::error::Error for StatusError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Status {
    core: CoreStatus,
    flags: StatusFlags,
}

impl Default for Status {
    fn default() -> Self {
        Status::EMPTY
    }
}

impl Status {
    pub const EMPTY: Status = Status::bare(CoreStatus::Empty);
    pub const READY: Status = Status::bare(CoreStatus::Ready);
    pub const DESTROYED: Status = Status::bare(CoreStatus::Destroyed);
    pub const NON_EXISTENT: Status = Status::bare(CoreStatus::NonExistent);
    /// Created locally and not yet committed: `READY|NEW|DIRTY`.
    pub const CREATED: Status = Status {
        core: CoreStatus::Ready,
        flags: StatusFlags::NEW.union(StatusFlags::DIRTY),
    };

    const fn bare(core: CoreStatus) -> Status {
        Status {
            core,
            flags: StatusFlags::NONE,
        }
    }

    pub fn new(core: CoreStatus, flags: StatusFlags) -> Result<Status, StatusError> {
        let invalid = !core.allowed_flags().contains(flags)
            || (flags.contains(StatusFlags::NEW)
                && flags.intersects(StatusFlags::LOADING | StatusFlags::OBSOLETE));
        if invalid {
            return Err(StatusError { core, flags });
        }
        Ok(Status { core, flags })
    }

    /// Decode the numeric representation (`EMPTY = 1` .. `OBSOLETE = 256`).
    pub fn from_bits(bits: u16) -> Result<Status, StatusError> {
        let flags = StatusFlags(bits & StatusFlags::ALL.bits());
        let core = match bits & 0b1111 {
            1 => CoreStatus::Empty,
            2 => CoreStatus::Ready,
            4 => CoreStatus::Destroyed,
            8 => CoreStatus::NonExistent,
            _ => {
                return Err(StatusError {
                    core: CoreStatus::Empty,
                    flags: StatusFlags(bits),
                })
            }
        };
        Status::new(core, flags)
    }

    pub fn bits(self) -> u16 {
        self.core.bits() | self.flags.bits()
    }

    pub fn core(self) -> CoreStatus {
        self.core
    }

    pub fn flags(self) -> StatusFlags {
        self.flags
    }

    pub fn is(self, flags: StatusFlags) -> bool {
        self.flags.contains(flags)
    }

    pub fn is_core(self, core: CoreStatus) -> bool {
        self.core == core
    }

    pub fn with(self, flags: StatusFlags) -> Result<Status, StatusError> {
        Status::new(self.core, self.flags.union(flags))
    }

    pub fn without(self, flags: StatusFlags) -> Result<Status, StatusError> {
        Status::new(self.core, self.flags.difference(flags))
    }

    /// Move to another core state, keeping only the flags in `keep`.
    pub fn to_core(self, core: CoreStatus, keep: StatusFlags) -> Result<Status, StatusError> {
        Status::new(core, StatusFlags(self.flags.bits() & keep.bits()))
    }

    /// Local changes exist that the source has not confirmed.
    pub fn has_unsynced_changes(self) -> bool {
        self.flags
            .intersects(StatusFlags::NEW | StatusFlags::DIRTY | StatusFlags::COMMITTING)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = match self.core {
            CoreStatus::Empty => "EMPTY",
            CoreStatus::Ready => "READY",
            CoreStatus::Destroyed => "DESTROYED",
            CoreStatus::NonExistent => "NON_EXISTENT",
        };
        f.write_str(core)?;
        let names = [
            (StatusFlags::LOADING, "LOADING"),
            (StatusFlags::COMMITTING, "COMMITTING"),
            (StatusFlags::NEW, "NEW"),
            (StatusFlags::DIRTY, "DIRTY"),
            (StatusFlags::OBSOLETE, "OBSOLETE"),
        ];
        for (flag, name) in names {
            if self.flags.contains(flag) {
                write!(f, "|{}", name)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_roundtrip_for_common_states() {
        let new_record = Status::new(CoreStatus::Ready, StatusFlags::NEW | StatusFlags::DIRTY)
            .unwrap();
        assert_eq!(new_record.bits(), 2 | 64 | 128);
        assert_eq!(Status::from_bits(2 | 64 | 128).unwrap(), new_record);
        assert_eq!(Status::from_bits(1 | 16).unwrap().flags(), StatusFlags::LOADING);
    }

    #[test]
    fn rejects_two_core_states() {
        assert!(Status::from_bits(2 | 4).is_err());
        assert!(Status::from_bits(0).is_err());
    }

    #[test]
    fn rejects_new_and_destroyed() {
        assert!(Status::DESTROYED.with(StatusFlags::NEW).is_err());
        let err = Status::new(CoreStatus::Destroyed, StatusFlags::NEW).unwrap_err();
        assert_eq!(err.core, CoreStatus::Destroyed);
    }

    #[test]
    fn rejects_new_with_obsolete_or_loading() {
        let new_record = Status::READY.with(StatusFlags::NEW).unwrap();
        assert!(new_record.with(StatusFlags::OBSOLETE).is_err());
        assert!(new_record.with(StatusFlags::LOADING).is_err());
    }

    #[test]
    fn empty_only_loads() {
        assert!(Status::EMPTY.with(StatusFlags::LOADING).is_ok());
        assert!(Status::EMPTY.with(StatusFlags::DIRTY).is_err());
        assert!(Status::NON_EXISTENT.with(StatusFlags::COMMITTING).is_err());
    }

    #[test]
    fn to_core_keeps_requested_flags() {
        let committing = Status::READY
            .with(StatusFlags::DIRTY | StatusFlags::COMMITTING)
            .unwrap();
        let destroyed = committing
            .to_core(CoreStatus::Destroyed, StatusFlags::COMMITTING)
            .unwrap();
        assert_eq!(destroyed.core(), CoreStatus::Destroyed);
        assert_eq!(destroyed.flags(), StatusFlags::COMMITTING);
    }

    #[test]
    fn unsynced_changes() {
        assert!(!Status::READY.has_unsynced_changes());
        assert!(Status::READY.with(StatusFlags::DIRTY).unwrap().has_unsynced_changes());
        assert!(!Status::READY.with(StatusFlags::OBSOLETE).unwrap().has_unsynced_changes());
    }

    #[test]
    fn display_lists_flags() {
        let status = Status::READY
            .with(StatusFlags::NEW | StatusFlags::COMMITTING)
            .unwrap();
        assert_eq!(status.to_string(), "READY|COMMITTING|NEW");
    }
}
