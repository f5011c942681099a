use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Classification of protocol-level outcomes. Non-success values are
///  negative so that a raw code can double as an errno-style result.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(i8)]
pub enum Reason {
    Success = 0,
    TimerExpired = -1,
    NoSuchPort = -2,
    GeneralNetwork = -3,
    CorruptedPacket = -4,
    NonExistentEntry = -5,
    WindowOverflow = -6,
    Inactivity = -7,
    ResourceUnavailable = -8,
    ClientDisconnected = -9,
    TransmitQueueFull = -10,
    ChannelLost = -11,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::Success => "success",
            Reason::TimerExpired => "timer expired",
            Reason::NoSuchPort => "no such port",
            Reason::GeneralNetwork => "general network error",
            Reason::CorruptedPacket => "corrupted packet",
            Reason::NonExistentEntry => "no such entry",
            Reason::WindowOverflow => "send window overflow",
            Reason::Inactivity => "inactivity",
            Reason::ResourceUnavailable => "resource unavailable",
            Reason::ClientDisconnected => "client disconnected",
            Reason::TransmitQueueFull => "transmit queue full",
            Reason::ChannelLost => "channel lost",
        }
    }
}

impl Display for Reason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol failure, optionally tied to the peer address it concerns.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct NetworkError {
    pub reason: Reason,
    pub address: Option<SocketAddr>,
}

impl NetworkError {
    pub fn new(reason: Reason) -> NetworkError {
        NetworkError {
            reason,
            address: None,
        }
    }

    pub fn at(reason: Reason, address: SocketAddr) -> NetworkError {
        NetworkError {
            reason,
            address: Some(address),
        }
    }
}

impl Display for NetworkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.address {
            Some(addr) => write!(f, "{} (peer {})", self.reason, addr),
            None => write!(f, "{}", self.reason),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<Reason> for NetworkError {
    fn from(reason: Reason) -> Self {
        NetworkError::new(reason)
    }
}
