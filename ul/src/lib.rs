//! This crate implements the DICOM upper layer protocol,
//! the network stack with which DICOM nodes exchange messages over TCP.
//!
//! From the bottom up:
//!
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_,
//!   along with their binary encoding and decoding.
//! - The [`dul`] module
//!   runs the upper layer state machine of an association
//!   over a TCP connection.
//! - The [`acse`] module
//!   negotiates, releases and aborts associations.
//! - The [`dimse`] module
//!   splits DIMSE messages into presentation data values and back.
//! - The [`association`] module
//!   comprises the association requester ([`ClientAssociationOptions`])
//!   and the association acceptor ([`AssociationServer`]),
//!   which dispatches incoming requests to service handlers.
//!
//! Errors of all layers are gathered in [`Error`].

pub mod acse;
pub mod association;
pub mod dimse;
pub mod dul;
pub mod error;
pub mod pdu;
pub mod timer;

/// The implementation class UID of this crate.
///
/// Automatically generated as per the standard, part 5, section B.2.
///
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.156227610253341005307660858504280353500";

/// The implementation version name of this crate.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-UL 0.1.0";

// re-exports

pub use association::client::{ClientAssociation, ClientAssociationOptions};
pub use association::config::UpperLayerConfig;
pub use association::server::AssociationServer;
pub use error::{Error, Result};
pub use pdu::read_pdu_from_buffer;
pub use pdu::write_pdu;
pub use pdu::Pdu;
