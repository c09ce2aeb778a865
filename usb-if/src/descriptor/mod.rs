use core::fmt::Display;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{err::UsbdError, transfer::Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum EndpointType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Number of packet buffers the controller alternates between for one endpoint.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferMode {
    #[default]
    Single,
    Double,
}

impl BufferMode {
    pub const fn buffers(self) -> usize {
        match self {
            BufferMode::Single => 1,
            BufferMode::Double => 2,
        }
    }
}

/// Logical endpoint address: number plus direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointAddress {
    pub number: u8,
    pub direction: Direction,
}

impl EndpointAddress {
    pub const fn new(number: u8, direction: Direction) -> Self {
        Self { number, direction }
    }

    pub const fn out(number: u8) -> Self {
        Self::new(number, Direction::Out)
    }

    pub const fn in_(number: u8) -> Self {
        Self::new(number, Direction::In)
    }

    /// `bEndpointAddress` encoding.
    pub fn raw(&self) -> u8 {
        match self.direction {
            Direction::In => self.number | 0x80,
            Direction::Out => self.number,
        }
    }
}

impl From<u8> for EndpointAddress {
    fn from(raw: u8) -> Self {
        let direction = if raw & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        };
        Self::new(raw & 0x0f, direction)
    }
}

impl Display for EndpointAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let dir = match self.direction {
            Direction::In => "IN",
            Direction::Out => "OUT",
        };
        write!(f, "EP{} {dir}", self.number)
    }
}

/// One unidirectional endpoint as the application wants it registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub number: u8,
    pub direction: Direction,
    pub transfer_type: EndpointType,
    pub max_packet_size: u16,
    pub buffer_mode: BufferMode,
}

impl EndpointDescriptor {
    pub const LEN: usize = 7;
    pub const DESCRIPTOR_TYPE: u8 = 0x05;

    /// Builds a descriptor from raw enumerated values, as they come from a
    /// class driver table.
    pub fn from_raw(
        number: u8,
        direction: u8,
        transfer_type: u8,
        max_packet_size: u16,
        buffer_mode: BufferMode,
    ) -> Result<Self, UsbdError> {
        Ok(Self {
            number,
            direction: Direction::try_from(direction)?,
            transfer_type: EndpointType::try_from(transfer_type)?,
            max_packet_size,
            buffer_mode,
        })
    }

    /// Decodes a standard endpoint descriptor (`bDescriptorType == 5`).
    ///
    /// Isochronous endpoints come out double-buffered, everything else single.
    pub fn parse(data: &[u8]) -> Result<Self, UsbdError> {
        if data.len() < Self::LEN || data[1] != Self::DESCRIPTOR_TYPE {
            return Err(UsbdError::NullParameter);
        }
        let address = EndpointAddress::from(data[2]);
        let transfer_type = EndpointType::try_from(data[3] & 0x3)?;
        // bits 12:11 carry the high-bandwidth transaction count
        let max_packet_size = u16::from_le_bytes([data[4], data[5]]) & 0x7ff;
        let buffer_mode = match transfer_type {
            EndpointType::Isochronous => BufferMode::Double,
            _ => BufferMode::Single,
        };

        Ok(Self {
            number: address.number,
            direction: address.direction,
            transfer_type,
            max_packet_size,
            buffer_mode,
        })
    }

    pub fn address(&self) -> EndpointAddress {
        EndpointAddress::new(self.number, self.direction)
    }
}

impl From<EndpointDescriptor> for EndpointAddress {
    fn from(desc: EndpointDescriptor) -> Self {
        desc.address()
    }
}

impl From<&EndpointDescriptor> for EndpointAddress {
    fn from(desc: &EndpointDescriptor) -> Self {
        desc.address()
    }
}
