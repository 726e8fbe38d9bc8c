//! USB host capabilities consumed by the driver
//!
//! The driver never touches a host controller directly. Whoever enumerates the
//! device implements [UsbHost] for the claimed mass storage interface and hands
//! it to [MassStorage::probe].
//!
//! [MassStorage::probe]: crate::device::MassStorage::probe

use core::time::Duration;
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::UsbDirection;

/// Why a transfer did not complete
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferErrorKind {
    /// Endpoint halted
    Stall,
    /// Device kept answering NAK until the transfer gave up
    Nak,
    /// Transfer did not finish within its timeout
    Timeout,
    /// CRC or bit stuffing error on the wire
    Crc,
    /// Device sent more data than requested
    Babble,
    /// Host controller or system failure
    System,
}

/// A failed transfer together with the bytes that did make it across
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub transferred: usize,
}

impl TransferError {
    pub const fn new(kind: TransferErrorKind, transferred: usize) -> Self {
        Self { kind, transferred }
    }

    #[inline]
    pub fn is_stall(&self) -> bool {
        self.kind == TransferErrorKind::Stall
    }

    #[inline]
    pub fn is_nak(&self) -> bool {
        self.kind == TransferErrorKind::Nak
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        self.kind == TransferErrorKind::Timeout
    }
}

/// Number of bytes moved, or the reason the transfer stopped
pub type TransferResult = Result<usize, TransferError>;

/// Data stage of a transfer: direction, buffer and length in one value
#[derive(Debug)]
pub enum Data<'a> {
    /// No data stage
    None,
    /// Device to host
    In(&'a mut [u8]),
    /// Host to device
    Out(&'a [u8]),
}

impl<'a> Data<'a> {
    pub fn len(&self) -> usize {
        match self {
            Data::None => 0,
            Data::In(buf) => buf.len(),
            Data::Out(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `None` when there is no data stage
    pub fn direction(&self) -> Option<UsbDirection> {
        match self {
            Data::None => None,
            Data::In(_) => Some(UsbDirection::In),
            Data::Out(_) => Some(UsbDirection::Out),
        }
    }

    /// Borrows the same buffer again for another attempt
    pub fn reborrow(&mut self) -> Data<'_> {
        match self {
            Data::None => Data::None,
            Data::In(buf) => Data::In(&mut buf[..]),
            Data::Out(buf) => Data::Out(&buf[..]),
        }
    }

    /// Borrows `len` bytes starting at `offset`
    ///
    /// # Panics
    /// Panics if the range is out of bounds. Callers size sub-transfers from
    /// the buffer length.
    pub fn slice(&mut self, offset: usize, len: usize) -> Data<'_> {
        match self {
            Data::None => Data::None,
            Data::In(buf) => Data::In(&mut buf[offset..offset + len]),
            Data::Out(buf) => Data::Out(&buf[offset..offset + len]),
        }
    }
}

/// The parts of the interface descriptor the driver cares about
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterfaceInfo {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub num_endpoints: u8,
}

/// The parts of an endpoint descriptor the driver cares about
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointInfo {
    pub address: EndpointAddress,
    pub ep_type: EndpointType,
    pub max_packet_size: u16,
}

impl EndpointInfo {
    pub fn is_bulk(&self) -> bool {
        matches!(self.ep_type, EndpointType::Bulk)
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self.ep_type, EndpointType::Interrupt)
    }
}

/// Synchronous USB host access to one claimed interface
///
/// Every call blocks until the transfer completes, fails or times out. The
/// driver serializes all calls on one interface.
pub trait UsbHost {
    /// Descriptor of the claimed interface
    fn interface(&self) -> InterfaceInfo;

    /// Descriptor of the `index`th endpoint of the interface
    fn endpoint(&self, index: u8) -> Option<EndpointInfo>;

    /// Runs a control transfer on the default pipe
    fn control_transfer(
        &mut self,
        request: Request,
        data: Data<'_>,
        timeout: Duration,
    ) -> TransferResult;

    /// Runs a bulk transfer; direction follows `data`
    fn bulk_transfer(
        &mut self,
        endpoint: EndpointAddress,
        data: Data<'_>,
        timeout: Duration,
    ) -> TransferResult;

    /// Runs a synchronous interrupt IN transfer
    fn interrupt_transfer(
        &mut self,
        endpoint: EndpointAddress,
        buf: &mut [u8],
        timeout: Duration,
    ) -> TransferResult;

    /// Resets the upstream hub port the device is attached to
    fn port_reset(&mut self) -> Result<(), TransferError>;

    /// Clears a halted endpoint and resets its data toggle
    fn clear_endpoint_halt(&mut self, endpoint: EndpointAddress) -> Result<(), TransferError> {
        let request = Request {
            direction: UsbDirection::Out,
            request_type: RequestType::Standard,
            recipient: Recipient::Endpoint,
            request: Request::CLEAR_FEATURE,
            value: Request::FEATURE_ENDPOINT_HALT,
            index: u8::from(endpoint) as u16,
            length: 0,
        };
        self.control_transfer(request, Data::None, CLEAR_HALT_TIMEOUT)
            .map(|_| ())
    }

    /// Monotonic time since an arbitrary origin
    fn now(&self) -> Duration;

    /// Blocks for `duration`
    fn delay(&mut self, duration: Duration);
}

const CLEAR_HALT_TIMEOUT: Duration = Duration::from_secs(1);

/// Builds a class-specific request addressed to `interface`
pub(crate) fn class_request(
    direction: UsbDirection,
    request: u8,
    interface: u8,
    length: usize,
) -> Request {
    Request {
        direction,
        request_type: RequestType::Class,
        recipient: Recipient::Interface,
        request,
        value: 0,
        index: interface as u16,
        length: length as u16,
    }
}
