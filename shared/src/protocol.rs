//! Binary wire protocol for wormhole client/server communication.
//!
//! Every message starts with a fixed 12-byte header followed by a typed
//! payload. All integers are big-endian. Validation runs on both the
//! serialize and deserialize side so a malformed value is rejected before
//! the peer can observe it.

use crate::error::WireError;

/// Protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 0x10;

/// Maximum payload size (1 MiB).
pub const MAX_PAYLOAD_SIZE: u64 = 1_048_576;

/// Maximum byte length of a name or domain string.
pub const MAX_NAME_SIZE: usize = 4096;

/// Header flag: the client requests metrics streaming.
pub const FLAG_METRICS: u8 = 0x01;

/// Size of the fixed header on the wire.
pub const HEADER_SIZE: usize = 12;

/// Size of the fixed part of a Request payload (proto + nameLength).
pub const REQUEST_SIZE: usize = 5;

/// Size of the fixed part of a Response payload (status + ttl + domainLength).
pub const RESPONSE_SIZE: usize = 13;

/// Size of a Metrics payload.
pub const METRICS_SIZE: usize = 36;

/// Message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Registration request (client -> server, control stream)
    Request = 0x01,
    /// Registration response (server -> client, control stream)
    Response = 0x02,
    /// A new public-side connection to forward
    Access = 0x03,
    /// Client acknowledges an Access stream
    Ack = 0x04,
    /// One metrics sample
    Metrics = 0x05,
    /// Tunnel expired; session is over
    End = 0x06,
    /// Server-side failure, payload is a UTF-8 message
    Error = 0xFF,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0x01 => Ok(MessageType::Request),
            0x02 => Ok(MessageType::Response),
            0x03 => Ok(MessageType::Access),
            0x04 => Ok(MessageType::Ack),
            0x05 => Ok(MessageType::Metrics),
            0x06 => Ok(MessageType::End),
            0xFF => Ok(MessageType::Error),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

/// Application protocol a tunnel is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Proto {
    Http = 0x01,
    Tcp = 0x02,
}

impl Proto {
    /// Scheme prefix for the public endpoint notice.
    pub fn scheme(&self) -> &'static str {
        match self {
            Proto::Http => "https://",
            Proto::Tcp => "tcp:",
        }
    }
}

impl TryFrom<u8> for Proto {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0x01 => Ok(Proto::Http),
            0x02 => Ok(Proto::Tcp),
            other => Err(WireError::UnknownProto(other)),
        }
    }
}

impl std::fmt::Display for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Proto::Http => write!(f, "http"),
            Proto::Tcp => write!(f, "tcp"),
        }
    }
}

/// Registration outcome reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0x01,
    NameTaken = 0x03,
    UnsupportedProto = 0x04,
}

impl TryFrom<u8> for Status {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0x01 => Ok(Status::Ok),
            0x03 => Ok(Status::NameTaken),
            0x04 => Ok(Status::UnsupportedProto),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

/// Fixed 12-byte message header.
///
/// `length` is redundant with the typed payload but authoritative: readers
/// size the payload read from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub kind: MessageType,
    pub flags: u8,
    pub length: u64,
    pub reserved: u8,
}

impl Header {
    /// A header for `kind` with `length` payload bytes and no flags set.
    pub fn new(kind: MessageType, length: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            flags: 0,
            length,
            reserved: 0,
        }
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u8) {
        self.flags &= !flag;
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn validate(&self) -> Result<(), WireError> {
        if self.version != PROTOCOL_VERSION {
            return Err(WireError::InvalidVersion(self.version));
        }
        if self.length > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge(self.length));
        }
        if self.reserved != 0 {
            return Err(WireError::ReservedNonZero(self.reserved));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<[u8; HEADER_SIZE], WireError> {
        self.validate()?;
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.kind as u8;
        buf[2] = self.flags;
        buf[3..11].copy_from_slice(&self.length.to_be_bytes());
        buf[11] = self.reserved;
        Ok(buf)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::Truncated {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }
        if buf[0] != PROTOCOL_VERSION {
            return Err(WireError::InvalidVersion(buf[0]));
        }
        let kind = MessageType::try_from(buf[1])?;
        let mut length = [0u8; 8];
        length.copy_from_slice(&buf[3..11]);
        let header = Self {
            version: buf[0],
            kind,
            flags: buf[2],
            length: u64::from_be_bytes(length),
            reserved: buf[11],
        };
        header.validate()?;
        Ok(header)
    }
}

/// Registration request: claim `name` under `proto`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub proto: Proto,
    pub name_length: u32,
    pub name: String,
}

impl Request {
    pub fn new(proto: Proto, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            proto,
            name_length: name.len() as u32,
            name,
        }
    }

    /// Payload size on the wire.
    pub fn wire_size(&self) -> usize {
        REQUEST_SIZE + self.name.len()
    }

    pub fn validate(&self) -> Result<(), WireError> {
        if self.name.is_empty() {
            return Err(WireError::EmptyName);
        }
        if self.name.len() > MAX_NAME_SIZE {
            return Err(WireError::StringTooLong(self.name.len()));
        }
        if self.name_length as usize != self.name.len() {
            return Err(WireError::LengthMismatch {
                declared: u64::from(self.name_length),
                actual: self.name.len() as u64,
            });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        self.validate()?;
        let mut buf = Vec::with_capacity(self.wire_size());
        buf.push(self.proto as u8);
        buf.extend_from_slice(&self.name_length.to_be_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        Ok(buf)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < REQUEST_SIZE {
            return Err(WireError::Truncated {
                expected: REQUEST_SIZE,
                actual: buf.len(),
            });
        }
        let proto = Proto::try_from(buf[0])?;
        let mut len = [0u8; 4];
        len.copy_from_slice(&buf[1..5]);
        let name_length = u32::from_be_bytes(len);
        let end = REQUEST_SIZE + name_length as usize;
        if buf.len() < end {
            return Err(WireError::Truncated {
                expected: end,
                actual: buf.len(),
            });
        }
        let name = std::str::from_utf8(&buf[REQUEST_SIZE..end])
            .map_err(|_| WireError::InvalidUtf8)?
            .to_string();
        let request = Self {
            proto,
            name_length,
            name,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Registration response. `domain` is present and non-empty iff `status`
/// is [`Status::Ok`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub ttl_hours: u64,
    pub domain_length: u32,
    pub domain: String,
}

impl Response {
    pub fn new(status: Status, ttl_hours: u64, domain: impl Into<String>) -> Self {
        let domain = domain.into();
        Self {
            status,
            ttl_hours,
            domain_length: domain.len() as u32,
            domain,
        }
    }

    pub fn wire_size(&self) -> usize {
        RESPONSE_SIZE + self.domain.len()
    }

    pub fn validate(&self) -> Result<(), WireError> {
        if self.domain.len() > MAX_NAME_SIZE {
            return Err(WireError::StringTooLong(self.domain.len()));
        }
        if self.domain_length as usize != self.domain.len() {
            return Err(WireError::LengthMismatch {
                declared: u64::from(self.domain_length),
                actual: self.domain.len() as u64,
            });
        }
        // Domain fields only carry meaning on an accepted registration.
        if self.status == Status::Ok && self.domain.is_empty() {
            return Err(WireError::EmptyDomain);
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        self.validate()?;
        let mut buf = Vec::with_capacity(self.wire_size());
        buf.push(self.status as u8);
        buf.extend_from_slice(&self.ttl_hours.to_be_bytes());
        buf.extend_from_slice(&self.domain_length.to_be_bytes());
        buf.extend_from_slice(self.domain.as_bytes());
        Ok(buf)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < RESPONSE_SIZE {
            return Err(WireError::Truncated {
                expected: RESPONSE_SIZE,
                actual: buf.len(),
            });
        }
        let status = Status::try_from(buf[0])?;
        let mut ttl = [0u8; 8];
        ttl.copy_from_slice(&buf[1..9]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&buf[9..13]);
        let domain_length = u32::from_be_bytes(len);
        let end = RESPONSE_SIZE + domain_length as usize;
        if buf.len() < end {
            return Err(WireError::Truncated {
                expected: end,
                actual: buf.len(),
            });
        }
        let domain = std::str::from_utf8(&buf[RESPONSE_SIZE..end])
            .map_err(|_| WireError::InvalidUtf8)?
            .to_string();
        let response = Self {
            status,
            ttl_hours: u64::from_be_bytes(ttl),
            domain_length,
            domain,
        };
        response.validate()?;
        Ok(response)
    }
}

/// One tunnel-wide metrics sample, as streamed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Metrics {
    /// Bytes received from the public side.
    pub ingress: u64,
    /// Bytes sent to the public side.
    pub egress: u64,
    /// Nanoseconds since the tunnel started.
    pub uptime: u64,
    /// Lifetime count of forwarded connections.
    pub connection_count: u64,
    /// Currently open forwarded connections.
    pub active_connections: u32,
}

impl Metrics {
    pub fn to_bytes(&self) -> [u8; METRICS_SIZE] {
        let mut buf = [0u8; METRICS_SIZE];
        buf[0..8].copy_from_slice(&self.ingress.to_be_bytes());
        buf[8..16].copy_from_slice(&self.egress.to_be_bytes());
        buf[16..24].copy_from_slice(&self.uptime.to_be_bytes());
        buf[24..32].copy_from_slice(&self.connection_count.to_be_bytes());
        buf[32..36].copy_from_slice(&self.active_connections.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < METRICS_SIZE {
            return Err(WireError::Truncated {
                expected: METRICS_SIZE,
                actual: buf.len(),
            });
        }
        if buf.len() > METRICS_SIZE {
            return Err(WireError::LengthMismatch {
                declared: buf.len() as u64,
                actual: METRICS_SIZE as u64,
            });
        }
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_be_bytes(b)
        };
        let ingress = u64_at(0);
        let egress = u64_at(8);
        let uptime = u64_at(16);
        let connection_count = u64_at(24);
        let mut b = [0u8; 4];
        b.copy_from_slice(&buf[32..36]);
        Ok(Self {
            ingress,
            egress,
            uptime,
            connection_count,
            active_connections: u32::from_be_bytes(b),
        })
    }
}
