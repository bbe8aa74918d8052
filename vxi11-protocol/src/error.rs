use std::{error::Error, fmt::Display, num::ParseIntError};

/// Errors that may occur when parsing a device name.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ParseError {
    Empty,
    UnknownInterface(String),
    MissingBoard(String),
    InvalidNumber(String),
    AddressOutOfRange { kind: &'static str, value: u32 },
    InvalidUsbAddress(String),
    TrailingCharacters(String),
}

impl From<ParseIntError> for ParseError {
    fn from(value: ParseIntError) -> Self {
        ParseError::InvalidNumber(value.to_string())
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Empty => write!(f, "Device name is empty"),
            ParseError::UnknownInterface(name) => write!(f, "Unknown interface family {}", name),
            ParseError::MissingBoard(name) => {
                write!(f, "Interface {} is missing a board number", name)
            }
            ParseError::InvalidNumber(number) => write!(f, "Invalid number: {}", number),
            ParseError::AddressOutOfRange { kind, value } => {
                write!(f, "{} address {} is out of range", kind, value)
            }
            ParseError::InvalidUsbAddress(address) => {
                write!(f, "Invalid USB address [{}]", address)
            }
            ParseError::TrailingCharacters(rest) => {
                write!(f, "Unexpected characters after device name: {}", rest)
            }
        }
    }
}

impl Error for ParseError {}
