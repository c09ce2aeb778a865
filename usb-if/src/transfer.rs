use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::err::UsbdError;

/// Data direction, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Direction {
    Out = 0,
    In = 1,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Out => Direction::In,
            Direction::In => Direction::Out,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RequestType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// Chapter 9 standard request codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Request {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

/// How the setup handler classified a control request.
///
/// `Read` and `Write` are named from the host side: a `Read` request has a
/// DATA_IN stage, a `Write` request a DATA_OUT stage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RequestOperation {
    #[default]
    NotSupported,
    Read,
    Write,
    WriteNoData,
}

/// The 8-byte SETUP packet opening every control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub direction: Direction,
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const LEN: usize = 8;

    pub fn parse(data: &[u8]) -> Result<Self, UsbdError> {
        if data.len() < Self::LEN {
            return Err(UsbdError::NullParameter);
        }
        let bm = data[0];
        let direction = if bm & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        };
        let request_type = RequestType::try_from((bm >> 5) & 0x3).unwrap_or(RequestType::Reserved);
        let recipient = Recipient::try_from(bm & 0x1f).unwrap_or(Recipient::Other);

        let packet = Self {
            direction,
            request_type,
            recipient,
            request: data[1],
            value: u16::from_le_bytes([data[2], data[3]]),
            index: u16::from_le_bytes([data[4], data[5]]),
            length: u16::from_le_bytes([data[6], data[7]]),
        };
        log::trace!("setup: {packet:?}");
        Ok(packet)
    }

    /// The standard request code, if this is a chapter 9 standard request.
    pub fn standard_request(&self) -> Option<Request> {
        if self.request_type != RequestType::Standard {
            return None;
        }
        Request::try_from(self.request).ok()
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut bm = u8::from(self.recipient) & 0x1f;
        bm |= (u8::from(self.request_type) & 0x3) << 5;
        if self.direction == Direction::In {
            bm |= 0x80;
        }
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            bm, self.request, value[0], value[1], index[0], index[1], length[0], length[1],
        ]
    }
}
