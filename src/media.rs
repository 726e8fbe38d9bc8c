//! Per logical unit device and media state

use crate::subclass::scsi::{InquiryData, PeripheralDeviceType};

/// Largest block size a transfer is accepted for
pub const MAX_BLOCK_SIZE: u32 = 0x10000;

/// What the host knows about the medium in a logical unit
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MediaDescriptor {
    /// 0 until capacity is known
    pub block_size: u32,
    pub last_block: u64,
    pub media_present: bool,
    /// Bumped on every observed media change
    pub media_id: u32,
    pub read_only: bool,
    pub removable_media: bool,
    pub lowest_aligned_lba: u64,
    pub logical_blocks_per_physical_block: u32,
}

impl MediaDescriptor {
    /// Block size within `(0, 65536]`
    pub fn block_size_valid(&self) -> bool {
        self.block_size > 0 && self.block_size <= MAX_BLOCK_SIZE
    }

    /// Number of blocks on the medium
    pub fn block_count(&self) -> u64 {
        if self.media_present && self.block_size_valid() {
            self.last_block.saturating_add(1)
        } else {
            0
        }
    }

    pub(crate) fn bump_media_id(&mut self) {
        self.media_id = self.media_id.wrapping_add(1);
    }
}

/// Media lifecycle of a logical unit
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MediaState {
    /// Media detection never ran
    #[default]
    Unknown,
    NoMedia,
    Present,
    /// The last detection saw a different medium than the one before
    Changed,
}

/// One LUN of a mass storage device
#[derive(Debug, Clone)]
pub struct LogicalUnit {
    pub(crate) lun: u8,
    pub(crate) subclass: u8,
    pub(crate) pdt: Option<PeripheralDeviceType>,
    pub(crate) use_16_byte_cdb: bool,
    pub(crate) inquiry: InquiryData,
    pub(crate) media: MediaDescriptor,
    pub(crate) state: MediaState,
    pub(crate) republish: bool,
}

impl LogicalUnit {
    pub fn new(lun: u8, subclass: u8) -> Self {
        LogicalUnit {
            lun,
            subclass,
            pdt: None,
            use_16_byte_cdb: false,
            inquiry: InquiryData::default(),
            media: MediaDescriptor::default(),
            state: MediaState::Unknown,
            republish: false,
        }
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }

    /// Interface subclass the unit speaks
    pub fn subclass(&self) -> u8 {
        self.subclass
    }

    /// `None` until INQUIRY succeeded
    pub fn peripheral_device_type(&self) -> Option<PeripheralDeviceType> {
        self.pdt
    }

    pub fn is_optical(&self) -> bool {
        self.pdt.is_some_and(PeripheralDeviceType::is_optical)
    }

    /// Sticky once the device reported more than 2^32 blocks
    pub fn uses_16_byte_cdb(&self) -> bool {
        self.use_16_byte_cdb
    }

    pub fn inquiry(&self) -> &InquiryData {
        &self.inquiry
    }

    pub fn media(&self) -> &MediaDescriptor {
        &self.media
    }

    pub fn media_state(&self) -> MediaState {
        self.state
    }

    pub(crate) fn update_state(&mut self, changed: bool) {
        self.state = match (self.media.media_present, changed) {
            (false, _) => MediaState::NoMedia,
            (true, true) if self.state != MediaState::Unknown => MediaState::Changed,
            (true, _) => MediaState::Present,
        };
    }
}
