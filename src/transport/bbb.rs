//! Bulk Only Transport (BBB/BOT)

use core::time::Duration;
use num_enum::TryFromPrimitive;
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

use crate::error::{Error, Result};
use crate::fmt::{debug, info, trace, warn};
use crate::host::{class_request, Data, UsbHost};
use crate::transport::{check_cdb_len, CommandOutcome, Transport};

/// Bulk Only Transport interface protocol
pub(crate) const TRANSPORT_BBB: u8 = 0x50;

const CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET: u8 = 0xFF;
const CLASS_SPECIFIC_GET_MAX_LUN: u8 = 0xFE;

const CBW_SIGNATURE_LE: [u8; 4] = 0x43425355u32.to_le_bytes();
const CSW_SIGNATURE_LE: [u8; 4] = 0x53425355u32.to_le_bytes();

const CBW_LEN: usize = 31;
const CSW_LEN: usize = 13;

const MIN_CB_LEN: usize = 1;
const MAX_CB_LEN: usize = 16;
const MAX_LUN: u8 = 0x0F;

const CBW_TIMEOUT: Duration = Duration::from_secs(3);
const CSW_TIMEOUT: Duration = Duration::from_secs(1);
const RESET_TIMEOUT: Duration = Duration::from_secs(3);
const RESET_STALL: Duration = Duration::from_millis(100);
const CSW_RETRY: usize = 3;

struct InvalidCswError; // Inner transport-specific error

/// The status byte of a Command Status Wrapper
///
/// Refer to the USB-MS BBB doc.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandStatus {
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

#[repr(u8)]
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum DataDirection {
    Out,
    In,
    #[default]
    NotExpected,
}

/// Bulk Only Transport
///
/// Every command runs a full Command/Data/Status cycle over the bulk endpoint
/// pair. A device that loses sync with the host is brought back with
/// [reset](Transport::reset).
pub struct BulkOnly<H: UsbHost> {
    host: H,
    interface: u8,
    bulk_in: EndpointAddress,
    bulk_out: EndpointAddress,
    tag: u32,
}

impl<H: UsbHost> BulkOnly<H> {
    fn send_cbw(&mut self, cbw: &CommandBlockWrapper) -> Result<()> {
        let raw = cbw.to_le_bytes();
        match self
            .host
            .bulk_transfer(self.bulk_out, Data::Out(&raw), CBW_TIMEOUT)
        {
            Ok(count) if count == CBW_LEN => Ok(()),
            Ok(count) => {
                warn!("usb: bbb: Short CBW write: {}", count);
                Err(Error::DeviceError)
            }
            Err(err) => {
                warn!("usb: bbb: CBW write failed: {:?}", err.kind);
                // USB-MS BBB 5.3.1
                if err.is_stall() && cbw.direction == DataDirection::Out {
                    if let Err(err) = self.reset(false) {
                        warn!("usb: bbb: Reset after CBW stall failed: {:?}", err);
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Failures are logged, not returned: the status phase runs regardless.
    fn transfer_data(&mut self, data: Data<'_>, timeout: Duration) {
        let ep = match data.direction() {
            Some(UsbDirection::In) => self.bulk_in,
            Some(UsbDirection::Out) => self.bulk_out,
            None => return,
        };

        match self.host.bulk_transfer(ep, data, timeout) {
            Ok(count) => trace!("usb: bbb: Data transferred: {}", count),
            Err(err) => {
                warn!(
                    "usb: bbb: Data transfer failed: {:?}, transferred: {}",
                    err.kind,
                    err.transferred
                );
                if err.is_stall() {
                    if let Err(err) = self.host.clear_endpoint_halt(ep) {
                        warn!("usb: bbb: Clear halt failed: {:?}", err.kind);
                    }
                } else if err.is_timeout() {
                    if let Err(err) = self.reset(false) {
                        warn!("usb: bbb: Reset after data timeout failed: {:?}", err);
                    }
                }
            }
        }
    }

    fn receive_csw(&mut self, tag: u32) -> Result<CommandOutcome> {
        let mut raw = [0u8; CSW_LEN];
        let mut last_err = Error::DeviceError;

        for attempt in 0..CSW_RETRY {
            match self
                .host
                .bulk_transfer(self.bulk_in, Data::In(&mut raw), CSW_TIMEOUT)
            {
                Ok(count) => return self.check_csw(&raw[..count], tag),
                Err(err) => {
                    warn!(
                        "usb: bbb: CSW read failed: {:?}, attempt: {}",
                        err.kind,
                        attempt
                    );
                    if err.is_stall() {
                        if let Err(err) = self.host.clear_endpoint_halt(self.bulk_in) {
                            warn!("usb: bbb: Clear halt failed: {:?}", err.kind);
                        }
                    }
                    last_err = err.into();
                }
            }
        }

        Err(last_err)
    }

    fn check_csw(&mut self, raw: &[u8], tag: u32) -> Result<CommandOutcome> {
        // USB-MS BBB 6.3
        let csw = match CommandStatusWrapper::from_le_bytes(raw) {
            Ok(csw) if csw.tag == tag => csw,
            _ => {
                warn!("usb: bbb: Invalid CSW, expected tag: {}", tag);
                self.reset(false)?;
                return Err(Error::DeviceError);
            }
        };

        trace!(
            "usb: bbb: Recv CSW, tag: {}, residue: {}, status: {}",
            csw.tag,
            csw.data_residue,
            csw.status
        );

        match CommandStatus::try_from(csw.status) {
            Ok(CommandStatus::Passed) => Ok(CommandOutcome::Passed),
            Ok(CommandStatus::PhaseError) => {
                warn!("usb: bbb: Phase error, tag: {}", tag);
                self.reset(false)?;
                Err(Error::DeviceError)
            }
            Ok(CommandStatus::Failed) | Err(_) => Ok(CommandOutcome::Failed),
        }
    }
}

impl<H: UsbHost> Transport for BulkOnly<H> {
    const PROTO: u8 = TRANSPORT_BBB;
    type Host = H;

    fn init(host: H) -> Result<Self> {
        let interface = host.interface();
        if interface.protocol != Self::PROTO {
            return Err(Error::Unsupported);
        }

        let mut bulk_in = None;
        let mut bulk_out = None;
        for index in 0..interface.num_endpoints {
            let Some(ep) = host.endpoint(index) else {
                continue;
            };
            if !ep.is_bulk() {
                continue;
            }
            if ep.address.is_in() {
                bulk_in.get_or_insert(ep.address);
            } else {
                bulk_out.get_or_insert(ep.address);
            }
        }

        match (bulk_in, bulk_out) {
            (Some(bulk_in), Some(bulk_out)) => {
                info!(
                    "usb: bbb: Init, interface: {}, in: {}, out: {}",
                    interface.number,
                    u8::from(bulk_in),
                    u8::from(bulk_out)
                );
                Ok(BulkOnly {
                    host,
                    interface: interface.number,
                    bulk_in,
                    bulk_out,
                    tag: 0,
                })
            }
            _ => {
                warn!("usb: bbb: Bulk endpoint pair missing");
                Err(Error::Unsupported)
            }
        }
    }

    fn exec_command(
        &mut self,
        cdb: &[u8],
        data: Data<'_>,
        lun: u8,
        timeout: Duration,
    ) -> Result<CommandOutcome> {
        check_cdb_len(cdb, MAX_CB_LEN)?;

        // one tag per attempt, whatever the outcome
        let tag = self.tag;
        self.tag = self.tag.wrapping_add(1);

        let cbw = CommandBlockWrapper::new(tag, cdb, &data, lun);
        debug!(
            "usb: bbb: Send CBW, tag: {}, opcode: {}, len: {}",
            tag,
            cdb[0],
            cbw.data_transfer_len
        );

        self.send_cbw(&cbw)?;
        if !data.is_empty() {
            self.transfer_data(data, timeout);
        }
        self.receive_csw(tag)
    }

    fn reset(&mut self, extended: bool) -> Result<()> {
        info!("usb: bbb: Reset recovery, extended: {}", extended);

        if extended {
            self.host.port_reset()?;
        }

        // USB-MS BBB section 3.1
        let request = class_request(
            UsbDirection::Out,
            CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET,
            self.interface,
            0,
        );
        self.host
            .control_transfer(request, Data::None, RESET_TIMEOUT)?;

        self.host.delay(RESET_STALL);

        // USB-MS BBB section 5.3.4
        self.host.clear_endpoint_halt(self.bulk_in)?;
        self.host.clear_endpoint_halt(self.bulk_out)?;
        Ok(())
    }

    fn get_max_lun(&mut self) -> u8 {
        // USB-MS BBB section 3.2
        let mut max_lun = [0u8; 1];
        let request = class_request(
            UsbDirection::In,
            CLASS_SPECIFIC_GET_MAX_LUN,
            self.interface,
            max_lun.len(),
        );

        // Single LUN devices are allowed to stall this request
        match self
            .host
            .control_transfer(request, Data::In(&mut max_lun), RESET_TIMEOUT)
        {
            Ok(1) if max_lun[0] <= MAX_LUN => max_lun[0],
            Ok(_) => {
                warn!("usb: bbb: Invalid max LUN: {}", max_lun[0]);
                0
            }
            Err(err) => {
                debug!("usb: bbb: Get max LUN failed: {:?}", err.kind);
                0
            }
        }
    }

    fn host(&mut self) -> &mut H {
        &mut self.host
    }

    fn clean_up(self) -> H {
        info!("usb: bbb: Clean up");
        self.host
    }
}

#[derive(Default, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct CommandBlockWrapper {
    tag: u32,
    data_transfer_len: u32,
    direction: DataDirection,
    lun: u8,
    block_len: usize,
    block: [u8; 16],
}

impl CommandBlockWrapper {
    /// `cdb` length is checked by the caller
    fn new(tag: u32, cdb: &[u8], data: &Data<'_>, lun: u8) -> Self {
        debug_assert!((MIN_CB_LEN..=MAX_CB_LEN).contains(&cdb.len()));

        let mut block = [0u8; 16];
        block[..cdb.len()].copy_from_slice(cdb);

        CommandBlockWrapper {
            tag,
            data_transfer_len: data.len() as u32,
            direction: match data.direction() {
                Some(UsbDirection::In) => DataDirection::In,
                Some(UsbDirection::Out) => DataDirection::Out,
                None => DataDirection::NotExpected,
            },
            lun: lun & MAX_LUN,
            block_len: cdb.len(),
            block,
        }
    }

    fn to_le_bytes(&self) -> [u8; CBW_LEN] {
        // USB-MS BBB 5.1
        let mut cbw = [0u8; CBW_LEN];
        cbw[..4].copy_from_slice(CBW_SIGNATURE_LE.as_slice());
        cbw[4..8].copy_from_slice(self.tag.to_le_bytes().as_slice());
        cbw[8..12].copy_from_slice(self.data_transfer_len.to_le_bytes().as_slice());
        cbw[12] = match self.direction {
            DataDirection::In => 1 << 7,
            DataDirection::Out | DataDirection::NotExpected => 0,
        };
        cbw[13] = self.lun & 0b00001111;
        cbw[14] = (self.block_len as u8) & 0b00011111;
        cbw[15..].copy_from_slice(self.block.as_slice());
        cbw
    }
}

#[derive(Debug, Copy, Clone)]
struct CommandStatusWrapper {
    tag: u32,
    data_residue: u32,
    status: u8,
}

impl CommandStatusWrapper {
    fn from_le_bytes(value: &[u8]) -> core::result::Result<Self, InvalidCswError> {
        // USB-MS BBB 6.3.1
        if value.len() < CSW_LEN || !value.starts_with(&CSW_SIGNATURE_LE) {
            return Err(InvalidCswError);
        }

        let word = |offset: usize| {
            u32::from_le_bytes([
                value[offset],
                value[offset + 1],
                value[offset + 2],
                value[offset + 3],
            ])
        };

        Ok(CommandStatusWrapper {
            tag: word(4),
            data_residue: word(8),
            status: value[12],
        })
    }
}
