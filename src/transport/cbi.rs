//! Control/Bulk/Interrupt Transport (CBI)
//!
//! Commands go out on the default pipe as an Accept Device-Specific Command
//! request, data moves over the bulk pair. CBI0 reports completion on an
//! interrupt endpoint, CBI1 has none and infers the result from the data stage.

use core::cmp::min;
use core::time::Duration;
use num_enum::TryFromPrimitive;
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

use crate::error::{Error, Result};
use crate::fmt::{debug, info, trace, warn};
use crate::host::{class_request, Data, EndpointInfo, TransferError, UsbHost};
use crate::subclass::scsi::{BOOT_CDB_LEN, MAX_CDB_LEN};
use crate::subclass::ufi::{UfiInterruptData, SUBCLASS_UFI};
use crate::transport::{check_cdb_len, CommandOutcome, Transport};

/// CBI with command completion interrupt interface protocol
pub(crate) const TRANSPORT_CBI0: u8 = 0x00;
/// CBI without command completion interrupt interface protocol
pub(crate) const TRANSPORT_CBI1: u8 = 0x01;

const CLASS_SPECIFIC_ACCEPT_DEVICE_SPECIFIC_COMMAND: u8 = 0x00;

/// Packets per bulk sub-transfer
const MAX_PACKET_NUM: usize = 16;
const MAX_RETRY: usize = 3;

const RESET_TIMEOUT: Duration = Duration::from_secs(1);
const RESET_STALL: Duration = Duration::from_millis(50);

/// CBI with a status interrupt endpoint
pub type Cbi0<H> = Cbi<H, true>;
/// CBI without a status interrupt endpoint
pub type Cbi1<H> = Cbi<H, false>;

/// Completion status carried in the low bits of the interrupt data `value`
///
/// Refer to the USB-MS CBI doc, section 3.4.3.1.1.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum CompletionStatus {
    Pass = 0x00,
    Fail = 0x01,
    PhaseError = 0x02,
    PersistentFailure = 0x03,
}

/// Control/Bulk/Interrupt Transport
///
/// `INTR` selects the flavor: `true` for CBI0, `false` for CBI1.
pub struct Cbi<H: UsbHost, const INTR: bool> {
    host: H,
    interface: u8,
    subclass: u8,
    bulk_in: EndpointInfo,
    bulk_out: EndpointInfo,
    interrupt: Option<EndpointAddress>,
}

impl<H: UsbHost, const INTR: bool> Cbi<H, INTR> {
    /// Runs a command. `allow_reset` is off for the reset command itself.
    fn exec(
        &mut self,
        cdb: &[u8],
        data: Data<'_>,
        timeout: Duration,
        allow_reset: bool,
    ) -> Result<CommandOutcome> {
        check_cdb_len(cdb, MAX_CDB_LEN)?;
        trace!("usb: cbi: Send command, opcode: {}, len: {}", cdb[0], data.len());

        self.send_command(cdb, timeout)?;

        let transferred = if data.is_empty() {
            Ok(0)
        } else {
            self.transfer_data(data, timeout)
        };

        let Some(interrupt) = self.interrupt else {
            // No status stage, the data stage decides
            return match transferred {
                Ok(_) => Ok(CommandOutcome::Passed),
                Err(err) => Err(err.into()),
            };
        };

        if let Err(err) = transferred {
            warn!(
                "usb: cbi: Data transfer failed: {:?}, transferred: {}",
                err.kind,
                err.transferred
            );
        }

        let status = self.read_status(interrupt, timeout)?;
        self.interpret_status(cdb[0], status, allow_reset)
    }

    fn send_command(&mut self, cdb: &[u8], timeout: Duration) -> Result<()> {
        let mut retry = 0;
        loop {
            let request = class_request(
                UsbDirection::Out,
                CLASS_SPECIFIC_ACCEPT_DEVICE_SPECIFIC_COMMAND,
                self.interface,
                cdb.len(),
            );
            match self.host.control_transfer(request, Data::Out(cdb), timeout) {
                Ok(_) => return Ok(()),
                Err(err) if err.is_nak() && retry < MAX_RETRY => {
                    retry += 1;
                    debug!("usb: cbi: Command NAK, retry: {}", retry);
                }
                Err(err) => {
                    warn!("usb: cbi: Command transfer failed: {:?}", err.kind);
                    return Err(err.into());
                }
            }
        }
    }

    /// Moves the data stage in sub-transfers of at most [MAX_PACKET_NUM]
    /// packets. The byte count reached so far is reported on failure too.
    fn transfer_data(
        &mut self,
        mut data: Data<'_>,
        timeout: Duration,
    ) -> core::result::Result<usize, TransferError> {
        let ep = match data.direction() {
            Some(UsbDirection::In) => self.bulk_in,
            Some(UsbDirection::Out) => self.bulk_out,
            None => return Ok(0),
        };

        let chunk = MAX_PACKET_NUM * usize::from(ep.max_packet_size.max(1));
        let total = data.len();
        let mut offset = 0;
        let mut retry = 0;

        while offset < total {
            let len = min(total - offset, chunk);
            match self
                .host
                .bulk_transfer(ep.address, data.slice(offset, len), timeout)
            {
                Ok(count) => {
                    offset += count;
                    if count < len {
                        // short packet ends the data stage
                        break;
                    }
                }
                Err(err) if err.is_nak() => {
                    if err.transferred == 0 {
                        retry += 1;
                        if retry > MAX_RETRY {
                            return Err(TransferError::new(err.kind, offset));
                        }
                    } else {
                        offset += err.transferred;
                        retry = 0;
                    }
                    trace!("usb: cbi: Data NAK, offset: {}, retry: {}", offset, retry);
                }
                Err(err) => {
                    if err.is_stall() {
                        if let Err(err) = self.host.clear_endpoint_halt(ep.address) {
                            warn!("usb: cbi: Clear halt failed: {:?}", err.kind);
                        }
                    }
                    return Err(TransferError::new(err.kind, offset + err.transferred));
                }
            }
        }

        trace!("usb: cbi: Data transferred: {}", offset);
        Ok(offset)
    }

    fn read_status(&mut self, ep: EndpointAddress, timeout: Duration) -> Result<[u8; 2]> {
        let mut raw = [0u8; 2];
        let mut retry = 0;
        loop {
            match self.host.interrupt_transfer(ep, &mut raw, timeout) {
                Ok(_) => return Ok(raw),
                Err(err) if err.is_nak() && retry < MAX_RETRY => retry += 1,
                Err(err) => {
                    warn!("usb: cbi: Status read failed: {:?}", err.kind);
                    return Err(err.into());
                }
            }
        }
    }

    fn interpret_status(
        &mut self,
        opcode: u8,
        raw: [u8; 2],
        allow_reset: bool,
    ) -> Result<CommandOutcome> {
        if self.subclass == SUBCLASS_UFI {
            let data = UfiInterruptData::from_bytes(raw);
            trace!("usb: cbi: UFI status, asc: {}, ascq: {}", data.asc, data.ascq);
            return Ok(if data.is_failure(opcode) {
                CommandOutcome::Failed
            } else {
                CommandOutcome::Passed
            });
        }

        // raw[0] is the bType field, raw[1] the bValue
        match CompletionStatus::try_from(raw[1] & 0x03) {
            Ok(CompletionStatus::Pass) => Ok(CommandOutcome::Passed),
            Ok(CompletionStatus::PhaseError) => {
                warn!("usb: cbi: Phase error, opcode: {}", opcode);
                if allow_reset {
                    if let Err(err) = self.reset(false) {
                        warn!("usb: cbi: Reset after phase error failed: {:?}", err);
                    }
                }
                Ok(CommandOutcome::Failed)
            }
            Ok(CompletionStatus::PersistentFailure) => Ok(CommandOutcome::Persistent),
            Ok(CompletionStatus::Fail) | Err(_) => Ok(CommandOutcome::Failed),
        }
    }
}

impl<H: UsbHost, const INTR: bool> Transport for Cbi<H, INTR> {
    const PROTO: u8 = if INTR { TRANSPORT_CBI0 } else { TRANSPORT_CBI1 };
    type Host = H;

    fn init(host: H) -> Result<Self> {
        let interface = host.interface();
        if interface.protocol != Self::PROTO {
            return Err(Error::Unsupported);
        }

        let mut bulk_in = None;
        let mut bulk_out = None;
        let mut interrupt = None;
        for index in 0..interface.num_endpoints {
            let Some(ep) = host.endpoint(index) else {
                continue;
            };
            if ep.is_bulk() {
                if ep.address.is_in() {
                    bulk_in.get_or_insert(ep);
                } else {
                    bulk_out.get_or_insert(ep);
                }
            } else if INTR && ep.is_interrupt() && ep.address.is_in() {
                interrupt.get_or_insert(ep.address);
            }
        }

        let (Some(bulk_in), Some(bulk_out)) = (bulk_in, bulk_out) else {
            warn!("usb: cbi: Bulk endpoint pair missing");
            return Err(Error::Unsupported);
        };
        if INTR && interrupt.is_none() {
            warn!("usb: cbi: Interrupt endpoint missing");
            return Err(Error::Unsupported);
        }

        info!(
            "usb: cbi: Init, interface: {}, subclass: {}, protocol: {}",
            interface.number,
            interface.subclass,
            interface.protocol
        );
        Ok(Cbi {
            host,
            interface: interface.number,
            subclass: interface.subclass,
            bulk_in,
            bulk_out,
            interrupt,
        })
    }

    fn exec_command(
        &mut self,
        cdb: &[u8],
        data: Data<'_>,
        _lun: u8,
        timeout: Duration,
    ) -> Result<CommandOutcome> {
        // the LUN travels inside the command block
        self.exec(cdb, data, timeout, true)
    }

    fn reset(&mut self, extended: bool) -> Result<()> {
        info!("usb: cbi: Reset, extended: {}", extended);

        if extended {
            self.host.port_reset()?;
        }

        // Command block reset goes through the regular path. Its outcome
        // doesn't matter, the device is expected to drop whatever it was doing.
        let cdb = reset_cdb();
        if let Err(err) = self.exec(&cdb, Data::None, RESET_TIMEOUT, false) {
            debug!("usb: cbi: Reset command failed: {:?}", err);
        }

        self.host.delay(RESET_STALL);

        self.host.clear_endpoint_halt(self.bulk_in.address)?;
        self.host.clear_endpoint_halt(self.bulk_out.address)?;
        Ok(())
    }

    fn host(&mut self) -> &mut H {
        &mut self.host
    }

    fn clean_up(self) -> H {
        info!("usb: cbi: Clean up");
        self.host
    }
}

/// SEND DIAGNOSTIC with the self-test bit and all-ones padding
fn reset_cdb() -> [u8; BOOT_CDB_LEN] {
    let mut cdb = [0xFF; BOOT_CDB_LEN];
    cdb[0] = 0x1D;
    cdb[1] = 0x04;
    cdb
}
