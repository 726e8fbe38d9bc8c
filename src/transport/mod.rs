//! USB Mass Storage transports

use core::time::Duration;

use crate::error::{Error, Result};
use crate::host::{Data, UsbHost};
#[cfg(feature = "bbb")]
use crate::transport::bbb::BulkOnly;
#[cfg(feature = "cbi")]
use crate::transport::cbi::{Cbi0, Cbi1};

#[cfg(feature = "bbb")]
pub mod bbb;
#[cfg(feature = "cbi")]
pub mod cbi;

/// USB Mass Storage transport.
///
/// Carries an opaque command block, an optional data stage and a completion
/// status between the host and one mass storage interface. The command set on
/// top of it lives in [boot].
///
/// [boot]: crate::boot
pub trait Transport: Sized {
    /// Interface protocol code
    const PROTO: u8;
    type Host: UsbHost;

    /// Takes over `host` if its interface speaks this transport
    ///
    /// # Errors
    /// [Error::Unsupported] if the protocol or the endpoint set does not match.
    fn init(host: Self::Host) -> Result<Self>;

    /// Runs one command through all of its phases
    ///
    /// `Ok` means the command went through the transport, the returned outcome
    /// tells whether the device executed it.
    fn exec_command(
        &mut self,
        cdb: &[u8],
        data: Data<'_>,
        lun: u8,
        timeout: Duration,
    ) -> Result<CommandOutcome>;

    /// Brings the device back into a state where it accepts commands
    fn reset(&mut self, extended: bool) -> Result<()>;

    /// Highest LUN of the device
    fn get_max_lun(&mut self) -> u8 {
        0
    }

    fn host(&mut self) -> &mut Self::Host;

    /// Tears the transport down, handing the host back
    fn clean_up(self) -> Self::Host;
}

/// The outcome of a Mass Storage command, as far as the transport can tell.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandOutcome {
    Passed,
    Failed,
    /// The device keeps failing until the host fetches sense data
    Persistent,
}

/// Transport factory, matched against the interface protocol at discovery
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportKind {
    #[cfg(feature = "bbb")]
    Bot,
    #[cfg(feature = "cbi")]
    Cbi0,
    #[cfg(feature = "cbi")]
    Cbi1,
}

/// Every compiled-in transport, in discovery order
pub const DEFAULT_TRANSPORTS: &[TransportKind] = &[
    #[cfg(feature = "cbi")]
    TransportKind::Cbi0,
    #[cfg(feature = "cbi")]
    TransportKind::Cbi1,
    #[cfg(feature = "bbb")]
    TransportKind::Bot,
];

impl TransportKind {
    /// Interface protocol code served by this kind
    pub fn protocol(self) -> u8 {
        match self {
            #[cfg(feature = "bbb")]
            TransportKind::Bot => bbb::TRANSPORT_BBB,
            #[cfg(feature = "cbi")]
            TransportKind::Cbi0 => cbi::TRANSPORT_CBI0,
            #[cfg(feature = "cbi")]
            TransportKind::Cbi1 => cbi::TRANSPORT_CBI1,
        }
    }

    pub fn init<H: UsbHost>(self, host: H) -> Result<TransportHandle<H>> {
        match self {
            #[cfg(feature = "bbb")]
            TransportKind::Bot => BulkOnly::init(host).map(TransportHandle::Bot),
            #[cfg(feature = "cbi")]
            TransportKind::Cbi0 => Cbi0::init(host).map(TransportHandle::Cbi0),
            #[cfg(feature = "cbi")]
            TransportKind::Cbi1 => Cbi1::init(host).map(TransportHandle::Cbi1),
        }
    }
}

/// The transport selected for a device
///
/// Shared by every logical unit of the device: endpoints belong to the
/// interface, not to a LUN.
pub enum TransportHandle<H: UsbHost> {
    #[cfg(feature = "bbb")]
    Bot(BulkOnly<H>),
    #[cfg(feature = "cbi")]
    Cbi0(Cbi0<H>),
    #[cfg(feature = "cbi")]
    Cbi1(Cbi1<H>),
}

impl<H: UsbHost> TransportHandle<H> {
    pub fn kind(&self) -> TransportKind {
        match self {
            #[cfg(feature = "bbb")]
            TransportHandle::Bot(_) => TransportKind::Bot,
            #[cfg(feature = "cbi")]
            TransportHandle::Cbi0(_) => TransportKind::Cbi0,
            #[cfg(feature = "cbi")]
            TransportHandle::Cbi1(_) => TransportKind::Cbi1,
        }
    }

    /// [Transport::exec_command]
    pub fn exec_command(
        &mut self,
        cdb: &[u8],
        data: Data<'_>,
        lun: u8,
        timeout: Duration,
    ) -> Result<CommandOutcome> {
        match self {
            #[cfg(feature = "bbb")]
            TransportHandle::Bot(t) => t.exec_command(cdb, data, lun, timeout),
            #[cfg(feature = "cbi")]
            TransportHandle::Cbi0(t) => t.exec_command(cdb, data, lun, timeout),
            #[cfg(feature = "cbi")]
            TransportHandle::Cbi1(t) => t.exec_command(cdb, data, lun, timeout),
        }
    }

    /// [Transport::reset]
    pub fn reset(&mut self, extended: bool) -> Result<()> {
        match self {
            #[cfg(feature = "bbb")]
            TransportHandle::Bot(t) => t.reset(extended),
            #[cfg(feature = "cbi")]
            TransportHandle::Cbi0(t) => t.reset(extended),
            #[cfg(feature = "cbi")]
            TransportHandle::Cbi1(t) => t.reset(extended),
        }
    }

    /// [Transport::get_max_lun]
    pub fn get_max_lun(&mut self) -> u8 {
        match self {
            #[cfg(feature = "bbb")]
            TransportHandle::Bot(t) => t.get_max_lun(),
            #[cfg(feature = "cbi")]
            TransportHandle::Cbi0(t) => t.get_max_lun(),
            #[cfg(feature = "cbi")]
            TransportHandle::Cbi1(t) => t.get_max_lun(),
        }
    }

    /// [Transport::host]
    pub fn host(&mut self) -> &mut H {
        match self {
            #[cfg(feature = "bbb")]
            TransportHandle::Bot(t) => t.host(),
            #[cfg(feature = "cbi")]
            TransportHandle::Cbi0(t) => t.host(),
            #[cfg(feature = "cbi")]
            TransportHandle::Cbi1(t) => t.host(),
        }
    }

    /// [Transport::clean_up]
    pub fn clean_up(self) -> H {
        match self {
            #[cfg(feature = "bbb")]
            TransportHandle::Bot(t) => t.clean_up(),
            #[cfg(feature = "cbi")]
            TransportHandle::Cbi0(t) => t.clean_up(),
            #[cfg(feature = "cbi")]
            TransportHandle::Cbi1(t) => t.clean_up(),
        }
    }
}

/// Rejects command blocks a transport cannot carry
pub(crate) fn check_cdb_len(cdb: &[u8], max: usize) -> Result<()> {
    if cdb.is_empty() || cdb.len() > max {
        return Err(Error::InvalidParameter);
    }
    Ok(())
}
