//! USB Mass Storage subclasses
//!
//! The interface subclass names the command set spoken through the transport.
//! Both supported subclasses share the SCSI boot command layouts in [scsi]; UFI
//! differs in how a CBI transport reports command completion, see [ufi].

pub mod scsi;
pub mod ufi;

pub use scsi::SUBCLASS_SCSI;
pub use ufi::SUBCLASS_UFI;
