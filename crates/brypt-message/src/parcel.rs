//! Parcel model and binary wire encoding.
//!
//! Decode is a single pass with a bounds check at every length field; any
//! mismatch fails without touching memory past the buffer. The receive
//! pipeline treats a decode failure as a dropped frame and increments the
//! peer's invalid-frame counter.

use brypt_types::{NodeIdentifier, RequestKey, StatusCode};

use crate::{MessageError, Result};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

const FLAG_REQUEST: u8 = 0b0001;
const FLAG_REPLY: u8 = 0b0010;
const FLAG_BROADCAST: u8 = 0b0100;
const FLAG_ENCRYPTED: u8 = 0b1000;

/// What kind of traffic a parcel carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParcelType {
    /// Session establishment and rekey exchanges; never encrypted.
    Handshake,
    /// Routed application traffic; encrypted once a session is active.
    Application,
    /// Runtime control notices (cancellation, goodbye).
    Control,
}

impl ParcelType {
    fn to_byte(self) -> u8 {
        match self {
            ParcelType::Handshake => 0,
            ParcelType::Application => 1,
            ParcelType::Control => 2,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(ParcelType::Handshake),
            1 => Ok(ParcelType::Application),
            2 => Ok(ParcelType::Control),
            _ => Err(MessageError::Malformed("unknown parcel type")),
        }
    }
}

/// The parcel flag byte.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ParcelFlags {
    pub request: bool,
    pub reply: bool,
    pub broadcast: bool,
    pub encrypted: bool,
}

impl ParcelFlags {
    fn to_byte(self) -> u8 {
        let mut byte = 0;
        if self.request {
            byte |= FLAG_REQUEST;
        }
        if self.reply {
            byte |= FLAG_REPLY;
        }
        if self.broadcast {
            byte |= FLAG_BROADCAST;
        }
        if self.encrypted {
            byte |= FLAG_ENCRYPTED;
        }
        byte
    }

    fn from_byte(byte: u8) -> Result<Self> {
        if byte & !(FLAG_REQUEST | FLAG_REPLY | FLAG_BROADCAST | FLAG_ENCRYPTED) != 0 {
            return Err(MessageError::Malformed("unknown flag bits"));
        }
        let flags = Self {
            request: byte & FLAG_REQUEST != 0,
            reply: byte & FLAG_REPLY != 0,
            broadcast: byte & FLAG_BROADCAST != 0,
            encrypted: byte & FLAG_ENCRYPTED != 0,
        };
        if flags.request && flags.reply {
            return Err(MessageError::Malformed("parcel is both request and reply"));
        }
        Ok(flags)
    }
}

/// One message unit: headers, optional correlation fields, and payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Parcel {
    pub parcel_type: ParcelType,
    pub flags: ParcelFlags,
    pub source: NodeIdentifier,
    pub route: String,
    pub request_key: Option<RequestKey>,
    pub status: Option<StatusCode>,
    pub payload: Vec<u8>,
}

impl Parcel {
    /// A request parcel expecting a correlated reply.
    pub fn request(
        source: NodeIdentifier,
        route: impl Into<String>,
        key: RequestKey,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            parcel_type: ParcelType::Application,
            flags: ParcelFlags { request: true, ..Default::default() },
            source,
            route: route.into(),
            request_key: Some(key),
            status: None,
            payload,
        }
    }

    /// A reply parcel echoing a request key.
    pub fn reply(
        source: NodeIdentifier,
        route: impl Into<String>,
        key: RequestKey,
        status: StatusCode,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            parcel_type: ParcelType::Application,
            flags: ParcelFlags { reply: true, ..Default::default() },
            source,
            route: route.into(),
            request_key: Some(key),
            status: Some(status),
            payload,
        }
    }

    /// A fire-and-forget notice.
    pub fn notice(source: NodeIdentifier, route: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            parcel_type: ParcelType::Application,
            flags: ParcelFlags::default(),
            source,
            route: route.into(),
            request_key: None,
            status: None,
            payload,
        }
    }

    /// An unencrypted handshake-plane parcel.
    pub fn handshake(source: NodeIdentifier, route: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            parcel_type: ParcelType::Handshake,
            flags: ParcelFlags::default(),
            source,
            route: route.into(),
            request_key: None,
            status: None,
            payload,
        }
    }

    /// A runtime control notice.
    pub fn control(source: NodeIdentifier, route: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            parcel_type: ParcelType::Control,
            flags: ParcelFlags::default(),
            source,
            route: route.into(),
            request_key: None,
            status: None,
            payload,
        }
    }

    /// Encode to the wire layout (without the session trailer MAC).
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::PayloadTooLarge`] past the 16 MiB limit,
    /// [`MessageError::MissingField`] when a flag requires an absent field,
    /// and [`MessageError::Malformed`] for an invalid route.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(MessageError::PayloadTooLarge(self.payload.len()));
        }
        if !self.route.starts_with('/') {
            return Err(MessageError::Malformed("route must begin with '/'"));
        }
        if self.route.len() > usize::from(u16::MAX) {
            return Err(MessageError::Malformed("route too long"));
        }
        let correlated = self.flags.request || self.flags.reply;
        if correlated && self.request_key.is_none() {
            return Err(MessageError::MissingField("request_key"));
        }
        if self.flags.reply && self.status.is_none() {
            return Err(MessageError::MissingField("status"));
        }

        let source = self.source.as_bytes();
        let mut out = Vec::with_capacity(32 + self.route.len() + self.payload.len());
        out.push(PROTOCOL_VERSION);
        out.push(self.parcel_type.to_byte());
        out.push(self.flags.to_byte());
        out.push(0);
        out.push(source.len() as u8);
        out.extend_from_slice(source);
        out.extend_from_slice(&(self.route.len() as u16).to_be_bytes());
        out.extend_from_slice(self.route.as_bytes());
        if let Some(key) = self.request_key.filter(|_| correlated) {
            out.extend_from_slice(&key.to_bytes());
        }
        if self.flags.reply {
            if let Some(status) = self.status {
                out.extend_from_slice(&status.value().to_be_bytes());
            }
        }
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode the wire layout (trailer MAC already stripped).
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::UnsupportedVersion`] for a foreign version
    /// byte and [`MessageError::Malformed`] for any structural violation.
    pub fn decode(buffer: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buffer);

        let version = cursor.take_byte()?;
        if version != PROTOCOL_VERSION {
            return Err(MessageError::UnsupportedVersion(version));
        }
        let parcel_type = ParcelType::from_byte(cursor.take_byte()?)?;
        let flags = ParcelFlags::from_byte(cursor.take_byte()?)?;
        let _reserved = cursor.take_byte()?;

        let source_len = usize::from(cursor.take_byte()?);
        let source = NodeIdentifier::from_slice(cursor.take(source_len)?)
            .map_err(|_| MessageError::Malformed("bad source identifier"))?;

        let route_len = usize::from(cursor.take_u16()?);
        let route = std::str::from_utf8(cursor.take(route_len)?)
            .map_err(|_| MessageError::Malformed("route is not UTF-8"))?
            .to_string();
        if !route.starts_with('/') {
            return Err(MessageError::Malformed("route must begin with '/'"));
        }

        let request_key = if flags.request || flags.reply {
            let bytes: [u8; 16] = cursor
                .take(16)?
                .try_into()
                .map_err(|_| MessageError::Malformed("short request key"))?;
            Some(RequestKey::from_bytes(bytes))
        } else {
            None
        };

        let status = if flags.reply {
            Some(StatusCode::from_value(cursor.take_u16()?))
        } else {
            None
        };

        let payload_len = cursor.take_u32()? as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(MessageError::Malformed("payload length over limit"));
        }
        let payload = cursor.take(payload_len)?.to_vec();

        if !cursor.is_empty() {
            return Err(MessageError::Malformed("trailing bytes after payload"));
        }

        Ok(Self { parcel_type, flags, source, route, request_key, status, payload })
    }
}

/// Bounds-checked forward reader over the decode buffer.
struct Cursor<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(count)
            .filter(|end| *end <= self.buffer.len())
            .ok_or(MessageError::Malformed("truncated parcel"))?;
        let slice = &self.buffer[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn take_byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16> {
        let bytes: [u8; 2] = self
            .take(2)?
            .try_into()
            .map_err(|_| MessageError::Malformed("truncated parcel"))?;
        Ok(u16::from_be_bytes(bytes))
    }

    fn take_u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| MessageError::Malformed("truncated parcel"))?;
        Ok(u32::from_be_bytes(bytes))
    }

    fn is_empty(&self) -> bool {
        self.offset == self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> NodeIdentifier {
        NodeIdentifier::from_bytes([7u8; 16])
    }

    #[test]
    fn test_request_round_trip() {
        let parcel = Parcel::request(source(), "/ping", RequestKey::new(1, 2), b"ping!".to_vec());
        let encoded = parcel.encode().expect("encode");
        let decoded = Parcel::decode(&encoded).expect("decode");
        assert_eq!(decoded, parcel);
    }

    #[test]
    fn test_reply_round_trip() {
        let parcel = Parcel::reply(
            source(),
            "/ping",
            RequestKey::new(3, 4),
            StatusCode::Ok,
            b"pong!".to_vec(),
        );
        let decoded = Parcel::decode(&parcel.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, parcel);
        assert_eq!(decoded.status, Some(StatusCode::Ok));
    }

    #[test]
    fn test_notice_round_trip_has_no_key() {
        let parcel = Parcel::notice(source(), "/events/update", b"data".to_vec());
        let encoded = parcel.encode().expect("encode");
        let decoded = Parcel::decode(&encoded).expect("decode");
        assert_eq!(decoded.request_key, None);
        assert_eq!(decoded.status, None);
        assert_eq!(decoded, parcel);
    }

    #[test]
    fn test_handshake_and_control_round_trip() {
        for parcel in [
            Parcel::handshake(source(), "/brypt/handshake", b"init".to_vec()),
            Parcel::control(source(), "/brypt/bye", Vec::new()),
        ] {
            let decoded = Parcel::decode(&parcel.encode().expect("encode")).expect("decode");
            assert_eq!(decoded, parcel);
        }
    }

    #[test]
    fn test_payload_limit_enforced_on_encode() {
        let mut parcel = Parcel::notice(source(), "/big", Vec::new());
        parcel.payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(parcel.encode(), Err(MessageError::PayloadTooLarge(_))));
    }

    #[test]
    fn test_request_without_key_rejected() {
        let mut parcel = Parcel::notice(source(), "/ping", Vec::new());
        parcel.flags.request = true;
        assert!(matches!(parcel.encode(), Err(MessageError::MissingField("request_key"))));
    }

    #[test]
    fn test_route_must_begin_with_slash() {
        let parcel = Parcel::notice(source(), "ping", Vec::new());
        assert!(parcel.encode().is_err());
    }

    #[test]
    fn test_truncation_rejected_at_every_boundary() {
        let parcel = Parcel::request(source(), "/ping", RequestKey::new(1, 2), b"ping!".to_vec());
        let encoded = parcel.encode().expect("encode");
        for len in 0..encoded.len() {
            assert!(Parcel::decode(&encoded[..len]).is_err(), "accepted truncation at {len}");
        }
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let parcel = Parcel::notice(source(), "/ping", b"data".to_vec());
        let mut encoded = parcel.encode().expect("encode");
        encoded.push(0xff);
        assert!(Parcel::decode(&encoded).is_err());
    }

    #[test]
    fn test_foreign_version_rejected() {
        let parcel = Parcel::notice(source(), "/ping", Vec::new());
        let mut encoded = parcel.encode().expect("encode");
        encoded[0] = 9;
        assert!(matches!(
            Parcel::decode(&encoded),
            Err(MessageError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_conflicting_flags_rejected() {
        let parcel = Parcel::notice(source(), "/ping", Vec::new());
        let mut encoded = parcel.encode().expect("encode");
        encoded[2] = 0b0011; // request and reply at once
        assert!(Parcel::decode(&encoded).is_err());
    }

    #[test]
    fn test_declared_payload_over_limit_rejected() {
        let parcel = Parcel::notice(source(), "/p", Vec::new());
        let mut encoded = parcel.encode().expect("encode");
        let payload_len_at = encoded.len() - 4;
        encoded[payload_len_at..].copy_from_slice(&(MAX_PAYLOAD_SIZE as u32 + 1).to_be_bytes());
        assert!(Parcel::decode(&encoded).is_err());
    }
}
