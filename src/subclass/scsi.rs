//! SCSI boot command set
//!
//! Command descriptor blocks and response layouts for the subset of SPC/SBC a
//! boot-time block driver needs.

use num_enum::TryFromPrimitive;

/// SCSI device subclass code
pub const SUBCLASS_SCSI: u8 = 0x06; // SCSI Transparent command set

/* SCSI codes */

/* SPC */
pub(crate) const TEST_UNIT_READY: u8 = 0x00;
pub(crate) const REQUEST_SENSE: u8 = 0x03;
pub(crate) const INQUIRY: u8 = 0x12;
pub(crate) const MODE_SENSE_6: u8 = 0x1A;

/* SBC */
pub(crate) const READ_CAPACITY_10: u8 = 0x25;
pub(crate) const READ_10: u8 = 0x28;
pub(crate) const WRITE_10: u8 = 0x2A;
pub(crate) const READ_16: u8 = 0x88;
pub(crate) const WRITE_16: u8 = 0x8A;
pub(crate) const SERVICE_ACTION_IN_16: u8 = 0x9E;
pub(crate) const SAI_READ_CAPACITY_16: u8 = 0x10;

/// 6 and 10 byte commands are padded to the UFI command length
pub const BOOT_CDB_LEN: usize = 12;
pub const MAX_CDB_LEN: usize = 16;

pub const SENSE_DATA_LEN: usize = 18;
pub const INQUIRY_DATA_LEN: usize = 36;
pub const CAPACITY_10_DATA_LEN: usize = 8;
pub const CAPACITY_16_DATA_LEN: usize = 32;
pub const MODE_PARAMETER_HEADER_6_LEN: usize = 4;

/// Mode page code selecting every page
const ALL_PAGES: u8 = 0x3F;

/* Additional sense codes */
pub const ASC_NO_ADDITIONAL_SENSE_INFORMATION: u8 = 0x00;
pub const ASC_NOT_READY: u8 = 0x04;
pub const ASC_MEDIA_CHANGE: u8 = 0x28;
pub const ASC_NO_MEDIA: u8 = 0x3A;

/// Last LBA reported by READ CAPACITY (10) when the medium is too large for it
pub const LBA_32_SENTINEL: u32 = 0xFFFF_FFFF;

/// SCSI command issued by the host
///
/// Refer to specifications (SPC,SBC)
#[derive(Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum ScsiCommand {
    /* SPC */
    Inquiry {
        alloc_len: u8,
    },
    TestUnitReady,
    RequestSense {
        alloc_len: u8,
    },
    ModeSense6 {
        page_control: PageControl,
        page_code: u8,
        alloc_len: u8,
    },

    /* SBC */
    ReadCapacity10,
    ReadCapacity16 {
        alloc_len: u32,
    },
    Read10 {
        lba: u32,
        len: u16,
    },
    Write10 {
        lba: u32,
        len: u16,
    },
    Read16 {
        lba: u64,
        len: u32,
    },
    Write16 {
        lba: u64,
        len: u32,
    },
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PageControl {
    CurrentValues = 0b00,
    ChangeableValues = 0b01,
    DefaultValues = 0b10,
    SavedValues = 0b11,
}

impl ScsiCommand {
    /// MODE SENSE (6) asking for the mode parameter header only
    pub const fn mode_sense_header() -> Self {
        ScsiCommand::ModeSense6 {
            page_control: PageControl::CurrentValues,
            page_code: ALL_PAGES,
            alloc_len: MODE_PARAMETER_HEADER_6_LEN as u8,
        }
    }

    /// Encodes the command for logical unit `lun`
    ///
    /// The LUN is also placed in bits 7..5 of byte 1 of the short commands, which
    /// SCSI-2 era devices still look at.
    pub fn to_cdb(self, lun: u8) -> Cdb {
        let mut cdb = Cdb::boot();
        let b = &mut cdb.bytes;
        let lun_bits = (lun & 0b111) << 5;
        match self {
            ScsiCommand::TestUnitReady => {
                b[0] = TEST_UNIT_READY;
                b[1] = lun_bits;
            }
            ScsiCommand::RequestSense { alloc_len } => {
                b[0] = REQUEST_SENSE;
                b[1] = lun_bits;
                b[4] = alloc_len;
            }
            ScsiCommand::Inquiry { alloc_len } => {
                b[0] = INQUIRY;
                b[1] = lun_bits;
                b[4] = alloc_len;
            }
            ScsiCommand::ModeSense6 {
                page_control,
                page_code,
                alloc_len,
            } => {
                b[0] = MODE_SENSE_6;
                b[1] = lun_bits;
                b[2] = ((page_control as u8) << 6) | (page_code & 0b00111111);
                b[4] = alloc_len;
            }
            ScsiCommand::ReadCapacity10 => {
                b[0] = READ_CAPACITY_10;
                b[1] = lun_bits;
            }
            ScsiCommand::Read10 { lba, len } | ScsiCommand::Write10 { lba, len } => {
                b[0] = if matches!(self, ScsiCommand::Read10 { .. }) {
                    READ_10
                } else {
                    WRITE_10
                };
                b[1] = lun_bits;
                b[2..6].copy_from_slice(lba.to_be_bytes().as_slice());
                b[7..9].copy_from_slice(len.to_be_bytes().as_slice());
            }
            ScsiCommand::ReadCapacity16 { alloc_len } => {
                cdb.len = MAX_CDB_LEN;
                b[0] = SERVICE_ACTION_IN_16;
                b[1] = SAI_READ_CAPACITY_16;
                b[10..14].copy_from_slice(alloc_len.to_be_bytes().as_slice());
            }
            ScsiCommand::Read16 { lba, len } | ScsiCommand::Write16 { lba, len } => {
                cdb.len = MAX_CDB_LEN;
                b[0] = if matches!(self, ScsiCommand::Read16 { .. }) {
                    READ_16
                } else {
                    WRITE_16
                };
                b[2..10].copy_from_slice(lba.to_be_bytes().as_slice());
                b[10..14].copy_from_slice(len.to_be_bytes().as_slice());
            }
        }
        cdb
    }
}

/// Encoded command descriptor block
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Cdb {
    bytes: [u8; MAX_CDB_LEN],
    len: usize,
}

impl Cdb {
    fn boot() -> Self {
        Self {
            bytes: [0u8; MAX_CDB_LEN],
            len: BOOT_CDB_LEN,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }
}

/// Peripheral device types a boot driver is expected to handle
///
/// Anything else reported by INQUIRY is rejected at discovery.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PeripheralDeviceType {
    DirectAccess = 0x00,
    CdRom = 0x05,
    Optical = 0x07,
    SimpleDirectAccess = 0x0E,
}

impl PeripheralDeviceType {
    /// CD-ROM and other optical memory devices
    pub fn is_optical(self) -> bool {
        matches!(
            self,
            PeripheralDeviceType::CdRom | PeripheralDeviceType::Optical
        )
    }

    /// Block size assumed until READ CAPACITY reports the real one
    pub fn default_block_size(self) -> u32 {
        if self.is_optical() {
            2048
        } else {
            512
        }
    }
}

/// SCSI sense keys
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SenseKey {
    NoSense = 0x00,
    RecoveredError = 0x01,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
    BlankCheck = 0x08,
    VendorSpecific = 0x09,
    CopyAborted = 0x0A,
    AbortedCommand = 0x0B,
    VolumeOverflow = 0x0D,
    Miscompare = 0x0E,
}

/// Fixed format sense data, reduced to the three levels the driver interprets
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SenseData {
    /// `None` for reserved key values
    pub key: Option<SenseKey>,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseData {
    /// Parses fixed format sense data. Missing trailing bytes read as zero.
    pub fn from_bytes(raw: &[u8]) -> Self {
        let byte = |i: usize| raw.get(i).copied().unwrap_or(0);
        Self {
            key: SenseKey::try_from_primitive(byte(2) & 0x0F).ok(),
            asc: byte(12),
            ascq: byte(13),
        }
    }
}

/// Standard INQUIRY data
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InquiryData {
    raw: [u8; INQUIRY_DATA_LEN],
}

impl Default for InquiryData {
    fn default() -> Self {
        Self {
            raw: [0u8; INQUIRY_DATA_LEN],
        }
    }
}

impl InquiryData {
    /// Short responses are zero filled
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut raw = [0u8; INQUIRY_DATA_LEN];
        let len = bytes.len().min(INQUIRY_DATA_LEN);
        raw[..len].copy_from_slice(&bytes[..len]);
        Self { raw }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Raw peripheral device type, low 5 bits of byte 0
    pub fn peripheral_device_type(&self) -> u8 {
        self.raw[0] & 0b0001_1111
    }

    /// RMB bit
    pub fn removable(&self) -> bool {
        self.raw[1] & 0b1000_0000 != 0
    }

    pub fn vendor_id(&self) -> &str {
        ascii_field(&self.raw[8..16])
    }

    pub fn product_id(&self) -> &str {
        ascii_field(&self.raw[16..32])
    }

    pub fn product_revision(&self) -> &str {
        ascii_field(&self.raw[32..36])
    }
}

/// Trims the space padding SPC mandates for identification fields
fn ascii_field(field: &[u8]) -> &str {
    core::str::from_utf8(field)
        .unwrap_or("")
        .trim_end_matches(|c: char| c == ' ' || c == '\0')
}

/// Result of READ CAPACITY, normalized across the 10 and 16 byte forms
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Capacity {
    pub last_lba: u64,
    pub block_len: u32,
    pub lowest_aligned_lba: u64,
    pub logical_blocks_per_physical_block: u32,
}

impl Capacity {
    pub fn from_capacity_10(raw: &[u8; CAPACITY_10_DATA_LEN]) -> Self {
        Self {
            last_lba: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64,
            block_len: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
            lowest_aligned_lba: 0,
            logical_blocks_per_physical_block: 1,
        }
    }

    pub fn from_capacity_16(raw: &[u8; CAPACITY_16_DATA_LEN]) -> Self {
        let mut last_lba = [0u8; 8];
        last_lba.copy_from_slice(&raw[0..8]);
        Self {
            last_lba: u64::from_be_bytes(last_lba),
            block_len: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
            lowest_aligned_lba: u16::from_be_bytes([raw[14] & 0b0011_1111, raw[15]]) as u64,
            logical_blocks_per_physical_block: 1 << (raw[13] & 0x0F),
        }
    }
}

/// WP bit of the device-specific parameter in a MODE SENSE (6) header
pub fn mode_header_write_protected(header: &[u8; MODE_PARAMETER_HEADER_6_LEN]) -> bool {
    header[2] & 0b1000_0000 != 0
}
