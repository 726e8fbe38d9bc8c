//! USB Floppy Interface

use crate::subclass::scsi::REQUEST_SENSE;

/// UFI device subclass code
pub const SUBCLASS_UFI: u8 = 0x04; // UFI command set

/// Interrupt data block a UFI device returns on a CBI status endpoint
///
/// Unlike the common CBI `{type, value}` block, UFI reports the additional sense
/// code and qualifier of the completed command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UfiInterruptData {
    pub asc: u8,
    pub ascq: u8,
}

impl UfiInterruptData {
    pub fn from_bytes(raw: [u8; 2]) -> Self {
        Self {
            asc: raw[0],
            ascq: raw[1],
        }
    }

    /// Whether the block reports a failure of the command with `opcode`
    ///
    /// REQUEST SENSE always completes with whatever sense was pending, so a
    /// nonzero code there describes the previous command, not this one.
    pub fn is_failure(&self, opcode: u8) -> bool {
        self.asc != 0 && opcode != REQUEST_SENSE
    }
}
