//! # VXI-11 Protocol Library
//!
//! This crate provides the vocabulary of the [VXI-11](https://www.vxibus.org/specifications.html)
//! network instrument protocol, shared by servers, clients and RPC transports.
//!
//! ## Overview
//!
//! VXI-11 controls test-and-measurement instruments over ONC RPC. A client creates a *link*
//! to a named device on the core channel and then reads, writes, locks, triggers or clears
//! the device through that link. Two side channels complement the core channel:
//!
//! - the **async channel**, served by the instrument, which accepts `device_abort` to cancel
//!   an in-progress call, and
//! - the **interrupt channel**, hosted by the client, on which the instrument delivers
//!   service requests (SRQ).
//!
//! This library contains:
//!
//! - [`ErrorCode`]: the closed set of error codes with their wire values
//! - [`OperationFlags`] and [`ReadReason`]: the flag and reason bitmasks
//! - Parameter and response types for every procedure, grouped in [`CoreRequest`] and
//!   [`CoreResponse`]
//! - Program and procedure numbers of the core, async and interrupt programs
//! - [`device_name::DeviceName`]: the device name grammar used by `create_link`
//!
//! XDR marshaling is left to the RPC transport.
//!
//! ## Device Names
//!
//! ```
//! use vxi11_protocol::device_name::{DeviceAddress, DeviceName};
//!
//! let name: DeviceName = "gpib0,5,10".parse().expect("Name should parse");
//! assert_eq!(
//!     name.address(),
//!     &DeviceAddress::Bus { primary: 5, secondary: Some(10) }
//! );
//! assert_eq!(name.to_string(), "gpib0,5,10");
//! ```
//!
//! ## Read Termination
//!
//! A read may terminate for several reasons at once; the reasons are or-ed together:
//!
//! ```
//! use vxi11_protocol::ReadReason;
//!
//! let reason = ReadReason::END | ReadReason::CHR;
//! assert!(reason.contains(ReadReason::END));
//! assert_eq!(reason.bits(), 0x06);
//! ```
//!
//! ## Error Handling
//!
//! Protocol failures are values of [`ErrorCode`] carried inside every response.
//! Malformed device names are reported through [`error::ParseError`].

pub mod protocol;
pub use protocol::*;
pub mod device_name;
pub mod error;
