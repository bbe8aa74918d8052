/// Parsing and formatting of the device names passed to `create_link`
use std::{fmt::Display, str::FromStr};

use crate::error::ParseError;

/// Highest primary or secondary bus address.
pub const MAX_BUS_ADDRESS: u8 = 30;

/// The interface family a device name refers to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum InterfaceFamily {
    /// A generic instrument, e.g. `inst0`
    Inst,
    /// A GPIB bus, e.g. `gpib0,5`
    Gpib,
    /// A USB bus, e.g. `usb0[0x1234::0x5678::SERIAL::0]`
    Usb,
    /// A serial port, e.g. `asrl1`
    Asrl,
}

impl InterfaceFamily {
    const ALL: [InterfaceFamily; 4] = [
        InterfaceFamily::Inst,
        InterfaceFamily::Gpib,
        InterfaceFamily::Usb,
        InterfaceFamily::Asrl,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            InterfaceFamily::Inst => "inst",
            InterfaceFamily::Gpib => "gpib",
            InterfaceFamily::Usb => "usb",
            InterfaceFamily::Asrl => "asrl",
        }
    }
}

/// Identifies a USB device behind a `usbN[...]` device name.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct UsbAddress {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: String,
    pub interface: u8,
}

/// The part of a device name following the interface family and board number.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum DeviceAddress {
    /// The board itself, e.g. `inst0`
    Board,
    /// A bus address with an optional secondary address, e.g. `gpib0,5,10`
    Bus { primary: u8, secondary: Option<u8> },
    Usb(UsbAddress),
}

/// A parsed VXI-11 device name.
///
/// Parsing a canonical name and writing it back with [Display] yields the identical string.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DeviceName {
    family: InterfaceFamily,
    board: u32,
    address: DeviceAddress,
}

impl DeviceName {
    pub fn new(family: InterfaceFamily, board: u32, address: DeviceAddress) -> DeviceName {
        DeviceName {
            family,
            board,
            address,
        }
    }

    pub fn family(&self) -> InterfaceFamily {
        self.family
    }

    pub fn board(&self) -> u32 {
        self.board
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }
}

fn parse_bus_address(text: &str, kind: &'static str) -> Result<u8, ParseError> {
    let value = text.parse::<u32>()?;
    if value > MAX_BUS_ADDRESS as u32 {
        return Err(ParseError::AddressOutOfRange { kind, value });
    }
    Ok(value as u8)
}

fn parse_usb_id(text: &str) -> Option<u16> {
    let digits = text.strip_prefix("0x")?;
    if digits.len() != 4 {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}

fn parse_usb_address(text: &str) -> Result<UsbAddress, ParseError> {
    let invalid = || ParseError::InvalidUsbAddress(text.to_string());
    let parts: Vec<&str> = text.split("::").collect();
    let [vendor, product, serial, interface] = parts[..] else {
        return Err(invalid());
    };
    if serial.is_empty() || serial.contains([':', '[', ']', ',']) {
        return Err(invalid());
    }
    Ok(UsbAddress {
        vendor_id: parse_usb_id(vendor).ok_or_else(invalid)?,
        product_id: parse_usb_id(product).ok_or_else(invalid)?,
        serial: serial.to_string(),
        interface: interface.parse::<u8>().map_err(|_| invalid())?,
    })
}

impl FromStr for DeviceName {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        let name_len = s
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(s.len());
        let (name, rest) = s.split_at(name_len);
        let family = InterfaceFamily::ALL
            .into_iter()
            .find(|family| family.prefix() == name)
            .ok_or_else(|| ParseError::UnknownInterface(name.to_string()))?;

        let board_len = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if board_len == 0 {
            return Err(ParseError::MissingBoard(name.to_string()));
        }
        let (board, rest) = rest.split_at(board_len);
        let board = board.parse::<u32>()?;

        let address = if rest.is_empty() {
            DeviceAddress::Board
        } else if let Some(bus) = rest.strip_prefix(',') {
            let mut parts = bus.splitn(2, ',');
            let primary = parse_bus_address(parts.next().unwrap_or_default(), "Primary")?;
            let secondary = parts
                .next()
                .map(|secondary| parse_bus_address(secondary, "Secondary"))
                .transpose()?;
            DeviceAddress::Bus { primary, secondary }
        } else if family == InterfaceFamily::Usb && rest.starts_with('[') {
            let inner = rest[1..]
                .strip_suffix(']')
                .ok_or_else(|| ParseError::InvalidUsbAddress(rest.to_string()))?;
            DeviceAddress::Usb(parse_usb_address(inner)?)
        } else {
            return Err(ParseError::TrailingCharacters(rest.to_string()));
        };

        Ok(DeviceName {
            family,
            board,
            address,
        })
    }
}

impl Display for DeviceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.family.prefix(), self.board)?;
        match &self.address {
            DeviceAddress::Board => Ok(()),
            DeviceAddress::Bus { primary, secondary } => {
                write!(f, ",{}", primary)?;
                if let Some(secondary) = secondary {
                    write!(f, ",{}", secondary)?;
                }
                Ok(())
            }
            DeviceAddress::Usb(usb) => write!(
                f,
                "[0x{:04x}::0x{:04x}::{}::{}]",
                usb.vendor_id, usb.product_id, usb.serial, usb.interface
            ),
        }
    }
}
