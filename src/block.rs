//! Block device surface of a logical unit

use crate::boot::BootCommandSet;
use crate::error::{Error, Result};
use crate::fmt::{debug, warn};
use crate::host::UsbHost;
use crate::media::{LogicalUnit, MediaDescriptor};
use crate::transport::TransportHandle;

/// Block level access to a medium
pub trait BlockIo {
    /// Current view of the medium
    fn media(&self) -> &MediaDescriptor;

    /// Resets the device. `extended` also resets the port it hangs off.
    fn reset(&mut self, extended: bool) -> Result<()>;

    /// Reads `buf.len()` bytes starting at block `lba`
    ///
    /// `media_id` must match [MediaDescriptor::media_id].
    fn read_blocks(&mut self, media_id: u32, lba: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` starting at block `lba`
    fn write_blocks(&mut self, media_id: u32, lba: u64, buf: &[u8]) -> Result<()>;

    fn flush_blocks(&mut self) -> Result<()>;
}

/// One logical unit borrowed from its [MassStorage] together with the
/// transport it shares with its siblings
///
/// [MassStorage]: crate::device::MassStorage
pub struct BlockDevice<'a, H: UsbHost> {
    transport: &'a mut TransportHandle<H>,
    unit: &'a mut LogicalUnit,
}

impl<'a, H: UsbHost> BlockDevice<'a, H> {
    pub(crate) fn new(transport: &'a mut TransportHandle<H>, unit: &'a mut LogicalUnit) -> Self {
        BlockDevice { transport, unit }
    }

    pub fn unit(&self) -> &LogicalUnit {
        self.unit
    }

    /// Whether the medium changed in a way consumers of this device must
    /// re-read it. Clears the flag.
    pub fn take_republish(&mut self) -> bool {
        core::mem::take(&mut self.unit.republish)
    }

    /// Command set view of the unit
    pub fn commands(&mut self) -> BootCommandSet<'_, H> {
        BootCommandSet::new(self.transport, self.unit)
    }

    /// Checks a transfer against the current medium. `Ok(false)` for an
    /// empty transfer.
    fn check_transfer(
        &mut self,
        media_id: u32,
        lba: u64,
        len: usize,
        write: bool,
    ) -> Result<bool> {
        if self.unit.media.removable_media {
            self.commands().detect_media()?;
        }

        let media = &self.unit.media;
        if !media.media_present {
            return Err(Error::NoMedia);
        }
        if media_id != media.media_id {
            return Err(Error::MediaChanged);
        }
        if write && media.read_only {
            return Err(Error::WriteProtected);
        }
        if len == 0 {
            return Ok(false);
        }
        if !media.block_size_valid() {
            return Err(Error::DeviceError);
        }

        let block_size = media.block_size as usize;
        if len % block_size != 0 {
            return Err(Error::BadBufferSize);
        }

        let blocks = (len / block_size) as u64;
        match lba.checked_add(blocks - 1) {
            Some(last) if last <= media.last_block => Ok(true),
            _ => Err(Error::InvalidParameter),
        }
    }

    /// Resets the device after a failed transfer, unless the failure is one
    /// of the expected removable media conditions
    fn recover(&mut self, err: Error) -> Error {
        if !matches!(err, Error::NoMedia | Error::MediaChanged) {
            warn!(
                "usb: msd: LUN {}: transfer failed: {:?}, resetting",
                self.unit.lun,
                err
            );
            if let Err(err) = self.transport.reset(true) {
                warn!("usb: msd: Reset failed: {:?}", err);
            }
        }
        err
    }
}

impl<H: UsbHost> BlockIo for BlockDevice<'_, H> {
    fn media(&self) -> &MediaDescriptor {
        &self.unit.media
    }

    fn reset(&mut self, extended: bool) -> Result<()> {
        debug!("usb: msd: LUN {}: reset, extended: {}", self.unit.lun, extended);
        self.transport.reset(extended)
    }

    fn read_blocks(&mut self, media_id: u32, lba: u64, buf: &mut [u8]) -> Result<()> {
        if !self.check_transfer(media_id, lba, buf.len(), false)? {
            return Ok(());
        }
        let result = self.commands().read_blocks(lba, buf);
        result.map_err(|err| self.recover(err))
    }

    fn write_blocks(&mut self, media_id: u32, lba: u64, buf: &[u8]) -> Result<()> {
        if !self.check_transfer(media_id, lba, buf.len(), true)? {
            return Ok(());
        }
        let result = self.commands().write_blocks(lba, buf);
        result.map_err(|err| self.recover(err))
    }

    /// No write cache to flush
    fn flush_blocks(&mut self) -> Result<()> {
        Ok(())
    }
}
