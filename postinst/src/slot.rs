//! Partition slot identity.
//!
//! A slot is named by the GPT partition label of its root/usr pair. The
//! label is the only thing that decides where boot artifacts go; anything
//! unrecognized is a fatal mis-targeting error, never a guess.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
#[error("unrecognized partition label: {0}")]
pub struct SlotResolutionError(pub String);

/// One of the two A/B partition slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    /// Derive the slot from a GPT partition label.
    pub fn from_partition_label(label: &str) -> Result<Self, SlotResolutionError> {
        match label.trim() {
            "ROOT-A" | "USR-A" => Ok(SlotId::A),
            "ROOT-B" | "USR-B" => Ok(SlotId::B),
            other => Err(SlotResolutionError(other.to_string())),
        }
    }

    /// Get the opposite slot.
    pub fn other(&self) -> SlotId {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }

    /// Lowercase slot letter used in ESP file names.
    pub fn letter(&self) -> &'static str {
        match self {
            SlotId::A => "a",
            SlotId::B => "b",
        }
    }

    /// Uppercase slot letter used by the legacy loader configs.
    pub fn upper(&self) -> &'static str {
        match self {
            SlotId::A => "A",
            SlotId::B => "B",
        }
    }

    /// ESP-relative path of this slot's kernel image.
    pub fn kernel_path(&self) -> &'static str {
        match self {
            SlotId::A => "coreos/vmlinuz-a",
            SlotId::B => "coreos/vmlinuz-b",
        }
    }

    /// GPT label of this slot's usr partition.
    pub fn usr_label(&self) -> &'static str {
        match self {
            SlotId::A => "USR-A",
            SlotId::B => "USR-B",
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.upper())
    }
}
