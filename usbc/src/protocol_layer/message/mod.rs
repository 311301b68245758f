//! The PD message model: header, data objects and (de)serialization.

pub mod header;
pub mod pdo;
pub mod rdo;

use byteorder::{ByteOrder, LittleEndian};
use header::{DataMessageType, Header, MessageType};
use heapless::Vec;
use usbc_traits::SopTarget;

/// The largest message this stack handles: a header and seven data objects.
pub const MAX_MESSAGE_SIZE: usize = 2 + 4 * pdo::MAX_OBJECTS;

/// Errors that can occur during message or header parsing.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// The input buffer has an invalid length.
    #[error("invalid input buffer length (expected {expected:?}, found {found:?})")]
    InvalidLength {
        /// The expected length.
        expected: usize,
        /// The actual length found.
        found: usize,
    },
    /// The specification revision field is reserved.
    #[error("unsupported specification revision `{0}`")]
    UnsupportedSpecificationRevision(u8),
}

/// Payload of a PD message, if any.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Payload {
    /// Source capabilities.
    SourceCapabilities(pdo::SourceCapabilities),
    /// Sink capabilities.
    SinkCapabilities(pdo::SinkCapabilities),
    /// A request for a power level from the source.
    Request(rdo::PowerSourceRequest),
    /// Data objects of a type this stack does not interpret, preserved raw.
    Raw(Vec<u32, { pdo::MAX_OBJECTS }>),
}

impl Payload {
    /// Serialize the payload, returning the number of written bytes.
    pub fn to_bytes(&self, buf: &mut [u8]) -> usize {
        match self {
            Self::SourceCapabilities(capabilities) => capabilities.to_bytes(buf),
            Self::SinkCapabilities(capabilities) => capabilities.to_bytes(buf),
            Self::Request(request) => request.to_bytes(buf),
            Self::Raw(objects) => {
                for (raw, chunk) in objects.iter().zip(buf.chunks_exact_mut(4)) {
                    LittleEndian::write_u32(chunk, *raw);
                }

                4 * objects.len()
            }
        }
    }

    /// The number of data objects the payload occupies.
    pub fn num_objects(&self) -> u8 {
        match self {
            Self::SourceCapabilities(capabilities) => capabilities.pdos().len() as u8,
            Self::SinkCapabilities(capabilities) => capabilities.len() as u8,
            Self::Request(_) => 1,
            Self::Raw(objects) => objects.len() as u8,
        }
    }
}

/// A PD message, together with the SOP type it was (or will be) sent on.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Message {
    /// The addressed target on the wire.
    pub sop: SopTarget,
    /// The message header.
    pub header: Header,
    /// Optional payload, for data messages.
    pub payload: Option<Payload>,
}

impl Message {
    /// Create a message without payload.
    pub fn new(sop: SopTarget, header: Header) -> Self {
        Self {
            sop,
            header,
            payload: None,
        }
    }

    /// Create a message with a payload.
    pub fn new_with_payload(sop: SopTarget, header: Header, payload: Payload) -> Self {
        Self {
            sop,
            header,
            payload: Some(payload),
        }
    }

    /// Serialize the message, returning the number of written bytes.
    pub fn to_bytes(&self, buf: &mut [u8]) -> usize {
        self.header.to_bytes(buf)
            + match self.payload.as_ref() {
                Some(payload) => payload.to_bytes(&mut buf[2..]),
                None => 0,
            }
    }

    /// Parse a message received on the given SOP type.
    ///
    /// Request payloads stay raw until the receiver resolves them against its
    /// own capabilities, see [`rdo::PowerSourceRequest::classify`].
    pub fn from_bytes(sop: SopTarget, data: &[u8]) -> Result<Self, ParseError> {
        let header = Header::from_bytes(data)?;
        let num_objects = header.num_objects();
        let payload = &data[2..];

        if payload.len() < 4 * num_objects {
            return Err(ParseError::InvalidLength {
                expected: 2 + 4 * num_objects,
                found: data.len(),
            });
        }

        // Extended messages are not interpreted; their payload stays raw so
        // that the policy engine can answer them with Not_Supported.
        let payload = if header.extended() {
            Some(Payload::Raw(collect_raw(payload, num_objects)))
        } else {
            match header.message_type() {
                MessageType::Control(_) => None,
                MessageType::Data(DataMessageType::SourceCapabilities) => Some(Payload::SourceCapabilities(
                    pdo::SourceCapabilities::from_payload(payload, num_objects),
                )),
                MessageType::Data(DataMessageType::SinkCapabilities) => Some(Payload::SinkCapabilities(
                    pdo::SinkCapabilities::from_payload(payload, num_objects),
                )),
                MessageType::Data(DataMessageType::Request) => Some(Payload::Request(
                    rdo::PowerSourceRequest::Unknown(rdo::RawRequest(LittleEndian::read_u32(payload))),
                )),
                MessageType::Data(_) => Some(Payload::Raw(collect_raw(payload, num_objects))),
            }
        };

        Ok(Self { sop, header, payload })
    }
}

fn collect_raw(payload: &[u8], num_objects: usize) -> Vec<u32, { pdo::MAX_OBJECTS }> {
    payload
        .chunks_exact(4)
        .take(num_objects.min(pdo::MAX_OBJECTS))
        .map(LittleEndian::read_u32)
        .collect()
}
