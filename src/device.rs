//! Mass storage device discovery

use heapless::Vec;

use crate::block::BlockDevice;
use crate::boot::BootCommandSet;
use crate::error::{Error, Result};
use crate::fmt::{info, warn};
use crate::host::UsbHost;
use crate::media::LogicalUnit;
use crate::transport::{TransportHandle, TransportKind};
use crate::CLASS_MASS_STORAGE;

/// Logical units a device may expose
pub const MAX_LUNS: usize = 16;

/// A probed USB mass storage device
///
/// Owns the transport and every logical unit found behind it. Units are
/// accessed one at a time through [block_device](MassStorage::block_device).
pub struct MassStorage<H: UsbHost> {
    transport: TransportHandle<H>,
    max_lun: u8,
    units: Vec<LogicalUnit, MAX_LUNS>,
}

impl<H: UsbHost> MassStorage<H> {
    /// Binds a transport to the interface behind `host` and identifies its
    /// logical units
    ///
    /// `transports` is tried in order, the first kind whose protocol code
    /// matches the interface is used.
    ///
    /// # Errors
    /// * [Error::Unsupported] - not a mass storage interface, or no transport
    ///   in `transports` speaks its protocol
    /// * the error of the last unit probed if none of them is usable
    pub fn probe(host: H, transports: &[TransportKind]) -> Result<Self> {
        let interface = host.interface();
        if interface.class != CLASS_MASS_STORAGE {
            warn!("usb: msd: Not a mass storage interface: {}", interface.class);
            return Err(Error::Unsupported);
        }

        let Some(kind) = transports
            .iter()
            .copied()
            .find(|kind| kind.protocol() == interface.protocol)
        else {
            warn!("usb: msd: No transport for protocol: {}", interface.protocol);
            return Err(Error::Unsupported);
        };

        let mut transport = kind.init(host)?;
        let max_lun = transport.get_max_lun();
        info!(
            "usb: msd: Transport: {:?}, subclass: {}, max LUN: {}",
            kind,
            interface.subclass,
            max_lun
        );

        let mut units = Vec::new();
        let mut last_err = Error::DeviceError;
        for lun in 0..=max_lun {
            let mut unit = LogicalUnit::new(lun, interface.subclass);
            match BootCommandSet::new(&mut transport, &mut unit).get_params() {
                // a changed medium here is an artifact of the device just
                // showing up
                Ok(()) | Err(Error::MediaChanged) | Err(Error::NoMedia) => {
                    unit.republish = false;
                    units.push(unit).map_err(|_| Error::OutOfResources)?;
                }
                Err(err) => {
                    warn!("usb: msd: LUN {} skipped: {:?}", lun, err);
                    last_err = err;
                }
            }
        }

        if units.is_empty() {
            return Err(last_err);
        }

        Ok(MassStorage {
            transport,
            max_lun,
            units,
        })
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Highest LUN the device reported
    pub fn max_lun(&self) -> u8 {
        self.max_lun
    }

    /// Usable units, in LUN order
    pub fn units(&self) -> &[LogicalUnit] {
        &self.units
    }

    pub fn unit(&self, lun: u8) -> Option<&LogicalUnit> {
        self.units.iter().find(|unit| unit.lun == lun)
    }

    /// Block device view of unit `lun`
    pub fn block_device(&mut self, lun: u8) -> Option<BlockDevice<'_, H>> {
        let unit = self.units.iter_mut().find(|unit| unit.lun == lun)?;
        Some(BlockDevice::new(&mut self.transport, unit))
    }

    /// Tears the transport down and returns the host
    pub fn release(self) -> H {
        info!("usb: msd: Release");
        self.transport.clean_up()
    }
}
