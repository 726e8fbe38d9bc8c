#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usbh_storage::host::{
    Data, EndpointInfo, InterfaceInfo, TransferError, TransferErrorKind, TransferResult, UsbHost,
};
use usbh_storage::subclass::{SUBCLASS_SCSI, SUBCLASS_UFI};
use usbh_storage::{MassStorage, DEFAULT_TRANSPORTS};

pub mod cbi;
pub mod scsi;

use scsi::ScsiDisk;

pub const BULK_IN: u8 = 0x81;
pub const BULK_OUT: u8 = 0x02;
pub const INTERRUPT_IN: u8 = 0x83;
pub const PACKET_SIZE: u16 = 64;

/// Simulated time every transfer takes
pub const TRANSFER_TIME: Duration = Duration::from_millis(10);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Protocol {
    Bot,
    Cbi0,
    Cbi1,
}

impl Protocol {
    fn code(self) -> u8 {
        match self {
            Protocol::Bot => 0x50,
            Protocol::Cbi0 => 0x00,
            Protocol::Cbi1 => 0x01,
        }
    }
}

/// What the device answers to GET MAX LUN
#[derive(Debug, Copy, Clone)]
pub enum MaxLun {
    Value(u8),
    Stall,
}

/// One-shot misbehaviours, each counter is consumed as it fires
#[derive(Default)]
pub struct Faults {
    pub stall_cbw: usize,
    pub stall_data: usize,
    pub stall_csw: usize,
    pub bad_csw_signature: usize,
    pub wrong_csw_tag: usize,
    pub short_csw: usize,
    pub phase_error: usize,
    pub adsc_naks: usize,
    /// Bytes moved before each scripted NAK of a CBI data transfer
    pub bulk_naks: VecDeque<usize>,
    /// Interrupt data returned instead of the real completion status
    pub cbi_status: VecDeque<[u8; 2]>,
    /// Every transfer times out
    pub unresponsive: bool,
}

/// Everything the device saw
#[derive(Default)]
pub struct Log {
    pub tags: Vec<u32>,
    /// (lun, opcode)
    pub commands: Vec<(u8, u8)>,
    pub bot_resets: usize,
    pub cbi_resets: usize,
    pub port_resets: usize,
    pub cleared_halts: Vec<u8>,
    pub adsc_attempts: usize,
    pub bulk_in_transfers: usize,
}

impl Log {
    pub fn opcodes(&self) -> Vec<u8> {
        self.commands.iter().map(|(_, opcode)| *opcode).collect()
    }

    pub fn count(&self, opcode: u8) -> usize {
        self.commands.iter().filter(|(_, op)| *op == opcode).count()
    }
}

pub struct Inner {
    pub protocol: Protocol,
    pub interface: InterfaceInfo,
    pub endpoints: Vec<EndpointInfo>,
    pub disks: Vec<ScsiDisk>,
    pub max_lun: MaxLun,
    pub clock: Duration,
    pub faults: Faults,
    pub log: Log,
    pub bot: bbb::BotDevice,
    pub cbi: cbi::CbiDevice,
}

impl Inner {
    pub fn disk(&mut self, lun: u8) -> &mut ScsiDisk {
        &mut self.disks[lun as usize]
    }
}

#[derive(Clone)]
pub struct DummyHost {
    inner: Arc<Mutex<Inner>>,
}

impl DummyHost {
    pub fn new(protocol: Protocol, subclass: u8, disks: Vec<ScsiDisk>) -> Self {
        let mut endpoints = vec![
            EndpointInfo {
                address: EndpointAddress::from(BULK_IN),
                ep_type: EndpointType::Bulk,
                max_packet_size: PACKET_SIZE,
            },
            EndpointInfo {
                address: EndpointAddress::from(BULK_OUT),
                ep_type: EndpointType::Bulk,
                max_packet_size: PACKET_SIZE,
            },
        ];
        if protocol == Protocol::Cbi0 {
            endpoints.push(EndpointInfo {
                address: EndpointAddress::from(INTERRUPT_IN),
                ep_type: EndpointType::Interrupt,
                max_packet_size: 2,
            });
        }

        let max_lun = MaxLun::Value((disks.len() - 1) as u8);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                protocol,
                interface: InterfaceInfo {
                    number: 0,
                    class: 0x08,
                    subclass,
                    protocol: protocol.code(),
                    num_endpoints: endpoints.len() as u8,
                },
                endpoints,
                disks,
                max_lun,
                clock: Duration::ZERO,
                faults: Faults::default(),
                log: Log::default(),
                bot: bbb::BotDevice::default(),
                cbi: cbi::CbiDevice::default(),
            })),
        }
    }

    pub fn bot(disk: ScsiDisk) -> Self {
        Self::new(Protocol::Bot, SUBCLASS_SCSI, vec![disk])
    }

    pub fn cbi0(subclass: u8, disk: ScsiDisk) -> Self {
        Self::new(Protocol::Cbi0, subclass, vec![disk])
    }

    pub fn cbi1(disk: ScsiDisk) -> Self {
        Self::new(Protocol::Cbi1, SUBCLASS_UFI, vec![disk])
    }

    pub fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Forgets everything logged so far
    pub fn clear_log(&self) {
        self.lock().log = Log::default();
    }
}

impl UsbHost for DummyHost {
    fn interface(&self) -> InterfaceInfo {
        self.lock().interface
    }

    fn endpoint(&self, index: u8) -> Option<EndpointInfo> {
        self.lock().endpoints.get(index as usize).copied()
    }

    fn control_transfer(
        &mut self,
        request: Request,
        data: Data<'_>,
        _timeout: Duration,
    ) -> TransferResult {
        let mut inner = self.lock();
        inner.clock += TRANSFER_TIME;
        if inner.faults.unresponsive {
            return Err(timeout());
        }

        match (request.request_type, request.recipient) {
            (RequestType::Standard, Recipient::Endpoint)
                if request.request == Request::CLEAR_FEATURE =>
            {
                inner.log.cleared_halts.push(request.index as u8);
                Ok(0)
            }
            (RequestType::Class, Recipient::Interface) => match inner.protocol {
                Protocol::Bot => bbb::control(&mut inner, request, data),
                Protocol::Cbi0 | Protocol::Cbi1 => cbi::control(&mut inner, request, data),
            },
            _ => Err(stall()),
        }
    }

    fn bulk_transfer(
        &mut self,
        endpoint: EndpointAddress,
        data: Data<'_>,
        _timeout: Duration,
    ) -> TransferResult {
        let mut inner = self.lock();
        inner.clock += TRANSFER_TIME;
        if inner.faults.unresponsive {
            return Err(timeout());
        }
        if matches!(data, Data::In(_)) {
            inner.log.bulk_in_transfers += 1;
        }

        match inner.protocol {
            Protocol::Bot => bbb::bulk(&mut inner, u8::from(endpoint), data),
            Protocol::Cbi0 | Protocol::Cbi1 => cbi::bulk(&mut inner, u8::from(endpoint), data),
        }
    }

    fn interrupt_transfer(
        &mut self,
        endpoint: EndpointAddress,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> TransferResult {
        let mut inner = self.lock();
        inner.clock += TRANSFER_TIME;
        if inner.faults.unresponsive {
            return Err(timeout());
        }
        assert_eq!(INTERRUPT_IN, u8::from(endpoint));
        cbi::interrupt(&mut inner, buf)
    }

    fn port_reset(&mut self) -> Result<(), TransferError> {
        let mut inner = self.lock();
        inner.log.port_resets += 1;
        inner.clock += TRANSFER_TIME;
        inner.bot = bbb::BotDevice::default();
        inner.cbi = cbi::CbiDevice::default();
        Ok(())
    }

    fn now(&self) -> Duration {
        self.lock().clock
    }

    fn delay(&mut self, duration: Duration) {
        self.lock().clock += duration;
    }
}

pub fn stall() -> TransferError {
    TransferError::new(TransferErrorKind::Stall, 0)
}

pub fn nak(transferred: usize) -> TransferError {
    TransferError::new(TransferErrorKind::Nak, transferred)
}

pub fn timeout() -> TransferError {
    TransferError::new(TransferErrorKind::Timeout, 0)
}

/// Probes `host` with every compiled-in transport, keeping a handle for
/// inspection
pub fn probe(host: &DummyHost) -> MassStorage<DummyHost> {
    MassStorage::probe(host.clone(), DEFAULT_TRANSPORTS).unwrap()
}
