//! USB Mass Storage host class driver
//!
//! Drives removable and fixed mass storage devices as block devices through the
//! boot command set, over whichever transport the interface declares.
//!
//! # Subclasses:
//! * [SCSI] - SCSI transparent command set
//! * [UFI] - USB Floppy Interface
//!
//! # Transports:
//! * [Bulk Only]
//! * [CBI] - Control/Bulk/Interrupt, with (CBI0) and without (CBI1) a status
//!   interrupt endpoint
//!
//! # Usage
//! Implement [UsbHost] for the claimed mass storage interface, then
//! [probe](MassStorage::probe) it and read or write through a [BlockDevice].
//!
//! # Features
//! | Feature | Description                           |
//! | ------- |---------------------------------------|
//! | `bbb` | Include Bulk Only Transport           |
//! | `cbi` | Include Control/Bulk/Interrupt Transport |
//! | `defmt` | Enable logging via [defmt](https://crates.io/crates/defmt) crate |
//! | `log` | Enable logging via [log](https://crates.io/crates/log) crate |
//!
//! [SCSI]: crate::subclass::scsi
//! [UFI]: crate::subclass::ufi
//! [Bulk Only]: crate::transport::bbb
//! [CBI]: crate::transport::cbi

#![no_std]

#[cfg(not(any(feature = "bbb", feature = "cbi")))]
compile_error!("at least one of the `bbb` and `cbi` features is required");

pub(crate) mod fmt;

pub mod block;
pub mod boot;
pub mod device;
pub mod error;
pub mod host;
pub mod media;
pub mod subclass;
pub mod transport;

pub use block::{BlockDevice, BlockIo};
pub use device::MassStorage;
pub use error::{Error, Result};
pub use host::UsbHost;
pub use media::{LogicalUnit, MediaDescriptor, MediaState};
pub use transport::{TransportKind, DEFAULT_TRANSPORTS};

/// USB Mass Storage Class code
pub const CLASS_MASS_STORAGE: u8 = 0x08;
