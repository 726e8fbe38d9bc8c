//! SCSI/UFI boot command set
//!
//! Runs the commands a block driver needs on top of whichever transport was
//! selected. Failed commands are explained through REQUEST SENSE, and the
//! resulting sense is folded into the unit's [MediaDescriptor].
//!
//! [MediaDescriptor]: crate::media::MediaDescriptor

use core::cmp::min;
use core::time::Duration;
use usb_device::UsbDirection;

use crate::error::{Error, Result};
use crate::fmt::{debug, info, trace, warn};
use crate::host::{Data, UsbHost};
use crate::media::{LogicalUnit, MAX_BLOCK_SIZE};
use crate::subclass::scsi::{
    mode_header_write_protected, Capacity, Cdb, InquiryData, PeripheralDeviceType, ScsiCommand,
    SenseData, SenseKey, ASC_MEDIA_CHANGE, ASC_NOT_READY, ASC_NO_ADDITIONAL_SENSE_INFORMATION,
    ASC_NO_MEDIA, CAPACITY_10_DATA_LEN, CAPACITY_16_DATA_LEN, INQUIRY, INQUIRY_DATA_LEN,
    LBA_32_SENTINEL, MODE_PARAMETER_HEADER_6_LEN, SENSE_DATA_LEN, SUBCLASS_SCSI,
};
use crate::transport::{CommandOutcome, TransportHandle};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const INQUIRY_TIMEOUT: Duration = Duration::from_secs(3);
/// Upper bound on the time spent retrying a single command
const RETRY_DEADLINE: Duration = Duration::from_secs(60);
/// Failures other than NotReady tolerated before giving up
const MAX_RETRY: usize = 5;
/// Pause between attempts while the device is becoming ready
const NOT_READY_DELAY: Duration = Duration::from_millis(100);
/// Most bytes moved by one READ/WRITE command
const MAX_CARRY_SIZE: u32 = MAX_BLOCK_SIZE;

/// Boot command set bound to one logical unit
pub struct BootCommandSet<'a, H: UsbHost> {
    transport: &'a mut TransportHandle<H>,
    unit: &'a mut LogicalUnit,
}

impl<'a, H: UsbHost> BootCommandSet<'a, H> {
    pub fn new(transport: &'a mut TransportHandle<H>, unit: &'a mut LogicalUnit) -> Self {
        BootCommandSet { transport, unit }
    }

    pub fn unit(&self) -> &LogicalUnit {
        self.unit
    }

    /// Fetches sense data and maps it to a driver outcome
    ///
    /// `Ok` means the device reported nothing wrong.
    pub fn request_sense(&mut self) -> Result<()> {
        let lun = self.unit.lun;
        let cdb = ScsiCommand::RequestSense {
            alloc_len: SENSE_DATA_LEN as u8,
        }
        .to_cdb(lun);
        let mut raw = [0u8; SENSE_DATA_LEN];

        match self
            .transport
            .exec_command(cdb.as_bytes(), Data::In(&mut raw), lun, COMMAND_TIMEOUT)
        {
            Ok(CommandOutcome::Passed) => {}
            Ok(outcome) => {
                warn!("usb: boot: Request sense failed: {:?}", outcome);
                return Err(Error::DeviceError);
            }
            Err(err) => {
                warn!("usb: boot: Request sense failed: {:?}", err);
                return Err(err);
            }
        }

        let sense = SenseData::from_bytes(&raw);
        debug!(
            "usb: boot: Sense, key: {:?}, asc: {}, ascq: {}",
            sense.key,
            sense.asc,
            sense.ascq
        );
        self.apply_sense(sense)
    }

    fn apply_sense(&mut self, sense: SenseData) -> Result<()> {
        let media = &mut self.unit.media;
        let Some(key) = sense.key else {
            return Err(Error::DeviceError);
        };

        match (key, sense.asc) {
            (SenseKey::NoSense, ASC_NO_ADDITIONAL_SENSE_INFORMATION) => Ok(()),
            (SenseKey::NoSense, _) => Err(Error::NoResponse),
            (SenseKey::RecoveredError, _) => Err(Error::NotReady),
            (SenseKey::NotReady, ASC_NO_MEDIA) => {
                media.media_present = false;
                Err(Error::NoMedia)
            }
            (SenseKey::NotReady, ASC_NOT_READY) => Err(Error::NotReady),
            (SenseKey::NotReady, _) => Err(Error::DeviceError),
            (SenseKey::IllegalRequest, _) => Err(Error::InvalidParameter),
            (SenseKey::UnitAttention, ASC_MEDIA_CHANGE) => {
                media.read_only = false;
                media.bump_media_id();
                Err(Error::MediaChanged)
            }
            (SenseKey::UnitAttention, ASC_NOT_READY | ASC_NO_MEDIA) => Err(Error::NotReady),
            (SenseKey::UnitAttention, _) => Err(Error::DeviceError),
            (SenseKey::DataProtect, _) => {
                media.read_only = true;
                Err(Error::WriteProtected)
            }
            _ => Err(Error::DeviceError),
        }
    }

    /// Runs `cdb` once, asking for sense data when it does not pass
    fn exec_command(&mut self, cdb: &Cdb, data: Data<'_>, timeout: Duration) -> Result<()> {
        let lun = self.unit.lun;
        let outcome = self
            .transport
            .exec_command(cdb.as_bytes(), data, lun, timeout);

        match outcome {
            Ok(CommandOutcome::Passed) => return Ok(()),
            // nobody home, sense would time out as well
            Err(Error::Timeout) => {
                warn!("usb: boot: Command timed out, opcode: {}", cdb.opcode());
                return Err(Error::Timeout);
            }
            _ => {}
        }

        // A device still powering up may fail INQUIRY in ways REQUEST SENSE
        // can't explain. Start over from a clean device.
        if cdb.opcode() == INQUIRY
            && matches!(
                outcome,
                Ok(CommandOutcome::Persistent) | Err(Error::DeviceError)
            )
        {
            warn!("usb: boot: Inquiry failed, resetting device");
            if let Err(err) = self.transport.reset(true) {
                warn!("usb: boot: Reset failed: {:?}", err);
            }
            return Err(Error::DeviceError);
        }

        debug!(
            "usb: boot: Command failed, opcode: {}, outcome: {:?}",
            cdb.opcode(),
            outcome
        );
        self.request_sense()
    }

    /// Runs `command` until it succeeds, the medium is gone, the retry budget
    /// is spent or [RETRY_DEADLINE] passes. NotReady is free.
    fn exec_with_retry(
        &mut self,
        command: ScsiCommand,
        mut data: Data<'_>,
        timeout: Duration,
    ) -> Result<()> {
        let cdb = command.to_cdb(self.unit.lun);
        let deadline = self.transport.host().now() + RETRY_DEADLINE;
        let mut retry = 0;
        let mut last_err = Error::Timeout;

        while self.transport.host().now() < deadline {
            match self.exec_command(&cdb, data.reborrow(), timeout) {
                Ok(()) => return Ok(()),
                Err(Error::NoMedia) => return Err(Error::NoMedia),
                Err(Error::NotReady) => {
                    trace!("usb: boot: Not ready, opcode: {}", cdb.opcode());
                    last_err = Error::NotReady;
                    self.transport.host().delay(NOT_READY_DELAY);
                }
                Err(err) => {
                    debug!(
                        "usb: boot: Command error: {:?}, opcode: {}, retry: {}",
                        err,
                        cdb.opcode(),
                        retry
                    );
                    last_err = err;
                    if retry >= MAX_RETRY {
                        break;
                    }
                    retry += 1;
                }
            }
        }

        warn!(
            "usb: boot: Giving up, opcode: {}, error: {:?}",
            cdb.opcode(),
            last_err
        );
        Err(last_err)
    }

    /// INQUIRY: peripheral type, removability and a placeholder block size
    pub fn inquiry(&mut self) -> Result<()> {
        let mut raw = [0u8; INQUIRY_DATA_LEN];
        self.exec_with_retry(
            ScsiCommand::Inquiry {
                alloc_len: INQUIRY_DATA_LEN as u8,
            },
            Data::In(&mut raw),
            INQUIRY_TIMEOUT,
        )?;

        let inquiry = InquiryData::from_bytes(&raw);
        let pdt = PeripheralDeviceType::try_from(inquiry.peripheral_device_type()).ok();

        info!(
            "usb: boot: LUN {}: {} {} {}, type: {}, removable: {}",
            self.unit.lun,
            inquiry.vendor_id(),
            inquiry.product_id(),
            inquiry.product_revision(),
            inquiry.peripheral_device_type(),
            inquiry.removable()
        );

        self.unit.inquiry = inquiry;
        self.unit.pdt = pdt;
        self.unit.media.removable_media = inquiry.removable();
        self.unit.media.block_size = pdt.map_or(512, PeripheralDeviceType::default_block_size);
        Ok(())
    }

    pub fn test_unit_ready(&mut self) -> Result<()> {
        self.exec_with_retry(ScsiCommand::TestUnitReady, Data::None, COMMAND_TIMEOUT)
    }

    /// READ CAPACITY (10), escalating to the 16 byte form for large media
    pub fn read_capacity(&mut self) -> Result<()> {
        let mut raw = [0u8; CAPACITY_10_DATA_LEN];
        self.exec_with_retry(
            ScsiCommand::ReadCapacity10,
            Data::In(&mut raw),
            COMMAND_TIMEOUT,
        )?;

        let capacity = Capacity::from_capacity_10(&raw);
        if capacity.last_lba == LBA_32_SENTINEL as u64 {
            info!("usb: boot: LUN {}: switching to 16 byte commands", self.unit.lun);
            self.unit.use_16_byte_cdb = true;
            return self.read_capacity_16();
        }
        self.apply_capacity(capacity)
    }

    pub fn read_capacity_16(&mut self) -> Result<()> {
        let mut raw = [0u8; CAPACITY_16_DATA_LEN];
        self.exec_with_retry(
            ScsiCommand::ReadCapacity16 {
                alloc_len: CAPACITY_16_DATA_LEN as u32,
            },
            Data::In(&mut raw),
            COMMAND_TIMEOUT,
        )?;
        self.apply_capacity(Capacity::from_capacity_16(&raw))
    }

    fn apply_capacity(&mut self, capacity: Capacity) -> Result<()> {
        if capacity.block_len == 0 {
            warn!("usb: boot: LUN {}: zero block length", self.unit.lun);
            self.request_sense()?;
            return Err(Error::DeviceError);
        }

        let media = &mut self.unit.media;
        media.media_present = true;
        media.block_size = capacity.block_len;
        media.last_block = capacity.last_lba;
        media.lowest_aligned_lba = capacity.lowest_aligned_lba;
        media.logical_blocks_per_physical_block = capacity.logical_blocks_per_physical_block;

        debug!(
            "usb: boot: LUN {}: last block: {}, block size: {}",
            self.unit.lun,
            media.last_block,
            media.block_size
        );
        Ok(())
    }

    /// MODE SENSE (6) header, for the write protect bit
    ///
    /// Single attempt: plenty of devices reject the command outright.
    pub fn mode_sense(&mut self) -> Result<()> {
        let mut header = [0u8; MODE_PARAMETER_HEADER_6_LEN];
        let cdb = ScsiCommand::mode_sense_header().to_cdb(self.unit.lun);
        self.exec_command(&cdb, Data::In(&mut header), COMMAND_TIMEOUT)?;
        self.unit.media.read_only = mode_header_write_protected(&header);
        Ok(())
    }

    /// Identifies the unit and probes its medium
    pub fn get_params(&mut self) -> Result<()> {
        self.inquiry()?;

        if self.unit.pdt.is_none() {
            warn!(
                "usb: boot: LUN {}: unsupported device type: {}",
                self.unit.lun,
                self.unit.inquiry.peripheral_device_type()
            );
            return Err(Error::Unsupported);
        }

        self.detect_media()
    }

    /// Refreshes the media descriptor
    ///
    /// Returns [Error::MediaChanged] or [Error::NoMedia] when the descriptor
    /// differs from the one before the call. The media id is bumped and the
    /// unit is flagged for republishing in that case.
    pub fn detect_media(&mut self) -> Result<()> {
        let old = self.unit.media;

        let mut status = self.test_unit_ready();
        if let Err(err) = status {
            debug!("usb: boot: LUN {}: unit not ready: {:?}", self.unit.lun, err);
        }

        if status.is_ok() && !self.unit.is_optical() && self.unit.subclass == SUBCLASS_SCSI {
            if let Err(err) = self.mode_sense() {
                debug!("usb: boot: LUN {}: mode sense ignored: {:?}", self.unit.lun, err);
            }
        }

        if status != Err(Error::NoMedia) {
            status = self.read_capacity();
        }

        match status {
            Ok(()) | Err(Error::NoMedia) => {}
            Err(err) => return Err(err),
        }

        // a bad size is still a change
        let bad_size = status.is_ok() && !self.unit.media.block_size_valid();
        let changed = self.unit.media != old;
        if changed {
            let media = &mut self.unit.media;
            if media.media_id == old.media_id {
                media.bump_media_id();
            }
            info!(
                "usb: boot: LUN {}: media changed, id: {}, present: {}",
                self.unit.lun,
                media.media_id,
                media.media_present
            );
            self.unit.republish = true;
            status = if media.media_present {
                Err(Error::MediaChanged)
            } else {
                Err(Error::NoMedia)
            };
        }

        self.unit.update_state(changed);

        if bad_size {
            warn!(
                "usb: boot: LUN {}: invalid block size: {}",
                self.unit.lun,
                self.unit.media.block_size
            );
            return Err(Error::DeviceError);
        }
        status
    }

    pub fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        self.transfer_blocks(lba, Data::In(buf))
    }

    pub fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> Result<()> {
        self.transfer_blocks(lba, Data::Out(buf))
    }

    /// Splits the request into READ/WRITE commands of at most
    /// [blocks_per_transfer] blocks
    fn transfer_blocks(&mut self, lba: u64, mut data: Data<'_>) -> Result<()> {
        let media = &self.unit.media;
        if !media.block_size_valid() {
            return Err(Error::DeviceError);
        }

        let block_size = media.block_size as usize;
        let cdb16 = self.unit.use_16_byte_cdb;
        let write = data.direction() == Some(UsbDirection::Out);
        let total = data.len() / block_size;
        let max_blocks = blocks_per_transfer(media.block_size, cdb16);

        let mut done = 0;
        while done < total {
            let count = min(total - done, max_blocks);
            let start = lba
                .checked_add(done as u64)
                .ok_or(Error::InvalidParameter)?;
            let command = block_command(start, count, cdb16, write)?;

            trace!(
                "usb: boot: LUN {}: {} blocks at {}, write: {}",
                self.unit.lun,
                count,
                start,
                write
            );
            self.exec_with_retry(
                command,
                data.slice(done * block_size, count * block_size),
                COMMAND_TIMEOUT,
            )?;
            done += count;
        }
        Ok(())
    }
}

/// Blocks moved by one READ/WRITE command
pub(crate) fn blocks_per_transfer(block_size: u32, cdb16: bool) -> usize {
    let max = (MAX_CARRY_SIZE / block_size.max(1)) as usize;
    if cdb16 {
        max
    } else {
        min(max, u16::MAX as usize)
    }
}

fn block_command(lba: u64, count: usize, cdb16: bool, write: bool) -> Result<ScsiCommand> {
    if cdb16 {
        let len = u32::try_from(count).map_err(|_| Error::InvalidParameter)?;
        return Ok(if write {
            ScsiCommand::Write16 { lba, len }
        } else {
            ScsiCommand::Read16 { lba, len }
        });
    }

    let lba = u32::try_from(lba).map_err(|_| Error::InvalidParameter)?;
    let len = u16::try_from(count).map_err(|_| Error::InvalidParameter)?;
    Ok(if write {
        ScsiCommand::Write10 { lba, len }
    } else {
        ScsiCommand::Read10 { lba, len }
    })
}
