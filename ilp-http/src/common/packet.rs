// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Just enough of the ILP packet encoding to route packets and answer
//! dynamic-configuration (ILDCP) queries.
//!
//! Packets otherwise travel through this crate as opaque byte buffers. The
//! only fields ever decoded are a Prepare's destination address, the body of
//! an ILDCP response, and the code/message of a Reject.

use std::time::SystemTime;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use super::ildcp::IldcpRecord;

/// Largest body accepted for a single ILP packet.
pub const MAX_ILP_PACKET_LENGTH: usize = 32767;

/// Destination used by ILDCP queries.
pub const ILDCP_DESTINATION: &str = "peer.config";

/// SHA-256 of 32 zero bytes; condition shared by peer-protocol requests.
pub const PEER_PROTOCOL_CONDITION: [u8; 32] = [
  0x66, 0x68, 0x7a, 0xad, 0xf8, 0x62, 0xbd, 0x77, 0x6c, 0x8f, 0xc1, 0x8b, 0x8e, 0x9f, 0x8e, 0x20,
  0x08, 0x97, 0x14, 0x85, 0x6e, 0xe2, 0x33, 0xb3, 0x90, 0x2a, 0x59, 0x1d, 0x0d, 0x5f, 0x29, 0x25,
];

/// Preimage of [`PEER_PROTOCOL_CONDITION`].
pub const PEER_PROTOCOL_FULFILLMENT: [u8; 32] = [0u8; 32];

const EXPIRY_LENGTH: usize = 17;
const AMOUNT_LENGTH: usize = 8;
const CONDITION_LENGTH: usize = 32;
const REJECT_CODE_LENGTH: usize = 3;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
  Prepare = 12,
  Fulfill = 13,
  Reject = 14,
}

impl PacketType {
  fn from_byte(byte: u8) -> Result<Self, PacketError> {
    match byte {
      12 => Ok(Self::Prepare),
      13 => Ok(Self::Fulfill),
      14 => Ok(Self::Reject),
      other => Err(PacketError::UnknownType(other)),
    }
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
  #[error("Packet ended before field `{0}` could be read")]
  Truncated(&'static str),
  #[error("Unknown packet type {0}")]
  UnknownType(u8),
  #[error("Expected a {expected:?} packet, found {found:?}")]
  UnexpectedType {
    expected: PacketType,
    found: PacketType,
  },
  #[error("Field `{0}` is not valid UTF-8")]
  InvalidString(&'static str),
  #[error("Invalid length prefix")]
  InvalidLength,
  #[error("Packet rejected with code {code}: {message}")]
  Rejected { code: String, message: String },
}

/// Reads the destination address of a serialized Prepare without decoding
/// the rest of its payload.
pub fn read_destination(packet: &[u8]) -> Result<&str, PacketError> {
  let mut contents = open_envelope(packet, PacketType::Prepare)?;
  skip(&mut contents, AMOUNT_LENGTH + EXPIRY_LENGTH + CONDITION_LENGTH, "prepare header")?;
  let destination = read_var_octets(&mut contents, "destination")?;
  std::str::from_utf8(destination).map_err(|_| PacketError::InvalidString("destination"))
}

/// Builds the Prepare that asks the parent for this node's ILDCP record.
pub fn ildcp_request(expires_at: SystemTime) -> Bytes {
  let mut contents = BytesMut::new();
  contents.put_u64(0);
  contents.put_slice(format_expiry(expires_at).as_bytes());
  contents.put_slice(&PEER_PROTOCOL_CONDITION);
  write_var_octets(&mut contents, ILDCP_DESTINATION.as_bytes());
  write_var_octets(&mut contents, &[]);
  seal_envelope(PacketType::Prepare, &contents)
}

/// Serializes an ILDCP response as a Fulfill packet.
pub fn ildcp_response(record: &IldcpRecord) -> Bytes {
  let mut data = BytesMut::new();
  write_var_octets(&mut data, record.client_address.as_bytes());
  data.put_u8(record.asset_scale);
  write_var_octets(&mut data, record.asset_code.as_bytes());

  let mut contents = BytesMut::new();
  contents.put_slice(&PEER_PROTOCOL_FULFILLMENT);
  write_var_octets(&mut contents, &data);
  seal_envelope(PacketType::Fulfill, &contents)
}

/// Decodes the reply to [`ildcp_request`]; a Reject surfaces as
/// [`PacketError::Rejected`].
pub fn parse_ildcp_response(packet: &[u8]) -> Result<IldcpRecord, PacketError> {
  let packet_type = packet
    .first()
    .copied()
    .ok_or(PacketError::Truncated("type"))
    .and_then(PacketType::from_byte)?;
  if packet_type == PacketType::Reject {
    return Err(parse_reject(packet)?);
  }
  let mut contents = open_envelope(packet, PacketType::Fulfill)?;
  skip(&mut contents, PEER_PROTOCOL_FULFILLMENT.len(), "fulfillment")?;
  let mut data = read_var_octets(&mut contents, "data")?;
  let client_address = read_var_string(&mut data, "clientAddress")?;
  if !data.has_remaining() {
    return Err(PacketError::Truncated("assetScale"));
  }
  let asset_scale = data.get_u8();
  let asset_code = read_var_string(&mut data, "assetCode")?;
  Ok(IldcpRecord {
    client_address,
    asset_scale,
    asset_code,
  })
}

fn parse_reject(packet: &[u8]) -> Result<PacketError, PacketError> {
  let mut contents = open_envelope(packet, PacketType::Reject)?;
  if contents.remaining() < REJECT_CODE_LENGTH {
    return Err(PacketError::Truncated("code"));
  }
  let code = String::from_utf8_lossy(&contents[..REJECT_CODE_LENGTH]).into_owned();
  contents.advance(REJECT_CODE_LENGTH);
  let _triggered_by = read_var_octets(&mut contents, "triggeredBy")?;
  let message = read_var_string(&mut contents, "message")?;
  Ok(PacketError::Rejected { code, message })
}

fn format_expiry(expires_at: SystemTime) -> String {
  DateTime::<Utc>::from(expires_at)
    .format("%Y%m%d%H%M%S%3f")
    .to_string()
}

fn open_envelope(packet: &[u8], expected: PacketType) -> Result<&[u8], PacketError> {
  let mut cursor = packet;
  if !cursor.has_remaining() {
    return Err(PacketError::Truncated("type"));
  }
  let found = PacketType::from_byte(cursor.get_u8())?;
  if found != expected {
    return Err(PacketError::UnexpectedType { expected, found });
  }
  read_var_octets(&mut cursor, "envelope")
}

fn seal_envelope(packet_type: PacketType, contents: &[u8]) -> Bytes {
  let mut packet = BytesMut::with_capacity(contents.len() + 4);
  packet.put_u8(packet_type as u8);
  write_var_octets(&mut packet, contents);
  packet.freeze()
}

fn skip(cursor: &mut &[u8], count: usize, field: &'static str) -> Result<(), PacketError> {
  if cursor.remaining() < count {
    return Err(PacketError::Truncated(field));
  }
  cursor.advance(count);
  Ok(())
}

fn read_length(cursor: &mut &[u8], field: &'static str) -> Result<usize, PacketError> {
  if !cursor.has_remaining() {
    return Err(PacketError::Truncated(field));
  }
  let first = cursor.get_u8();
  if first & 0x80 == 0 {
    return Ok(usize::from(first));
  }
  let width = usize::from(first & 0x7f);
  if width == 0 || width > std::mem::size_of::<usize>() {
    return Err(PacketError::InvalidLength);
  }
  if cursor.remaining() < width {
    return Err(PacketError::Truncated(field));
  }
  Ok(cursor.get_uint(width) as usize)
}

fn read_var_octets<'a>(cursor: &mut &'a [u8], field: &'static str) -> Result<&'a [u8], PacketError> {
  let length = read_length(cursor, field)?;
  if cursor.remaining() < length {
    return Err(PacketError::Truncated(field));
  }
  let (value, rest) = cursor.split_at(length);
  *cursor = rest;
  Ok(value)
}

fn read_var_string(cursor: &mut &[u8], field: &'static str) -> Result<String, PacketError> {
  let raw = read_var_octets(cursor, field)?;
  String::from_utf8(raw.to_vec()).map_err(|_| PacketError::InvalidString(field))
}

fn write_var_octets(buffer: &mut BytesMut, value: &[u8]) {
  let length = value.len();
  if length < 0x80 {
    buffer.put_u8(length as u8);
  } else {
    let width = (usize::BITS - length.leading_zeros()).div_ceil(8) as usize;
    buffer.put_u8(0x80 | width as u8);
    buffer.put_uint(length as u64, width);
  }
  buffer.put_slice(value);
}

/// Serializes a Prepare; used by tests across the crate to fabricate traffic.
#[cfg(test)]
pub(crate) fn prepare(destination: &str, data: &[u8]) -> Bytes {
  let mut contents = BytesMut::new();
  contents.put_u64(1000);
  contents.put_slice(format_expiry(SystemTime::now()).as_bytes());
  contents.put_slice(&[7u8; CONDITION_LENGTH]);
  write_var_octets(&mut contents, destination.as_bytes());
  write_var_octets(&mut contents, data);
  seal_envelope(PacketType::Prepare, &contents)
}

#[cfg(test)]
pub(crate) fn reject(code: &str, message: &str) -> Bytes {
  let mut contents = BytesMut::new();
  contents.put_slice(code.as_bytes());
  write_var_octets(&mut contents, b"g.parent");
  write_var_octets(&mut contents, message.as_bytes());
  write_var_octets(&mut contents, &[]);
  seal_envelope(PacketType::Reject, &contents)
}
