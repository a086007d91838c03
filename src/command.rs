//! Client control protocol wire schema (spec §6 "Client control
//! protocol"): a fixed header plus a typed body, each command carrying
//! `(correlation_id, client_id)`. Bodies are crc32-checked the way the
//! teacher crate's `core::header::MessageHeader` checks payload frames.

use crc32fast::Hasher;

use crate::error::{Error, ErrorCode};

pub const HEADER_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CommandType {
    AddPublication = 1,
    AddExclusivePublication = 2,
    RemovePublication = 3,
    AddSubscription = 4,
    RemoveSubscription = 5,
    AddDestination = 6,
    RemoveDestination = 7,
    AddRcvDestination = 8,
    RemoveRcvDestination = 9,
    ClientKeepalive = 10,
    ClientClose = 11,
    AddCounter = 12,
    RemoveCounter = 13,
    TerminateDriver = 14,
}

impl CommandType {
    fn from_u16(value: u16) -> Result<Self, Error> {
        Ok(match value {
            1 => CommandType::AddPublication,
            2 => CommandType::AddExclusivePublication,
            3 => CommandType::RemovePublication,
            4 => CommandType::AddSubscription,
            5 => CommandType::RemoveSubscription,
            6 => CommandType::AddDestination,
            7 => CommandType::RemoveDestination,
            8 => CommandType::AddRcvDestination,
            9 => CommandType::RemoveRcvDestination,
            10 => CommandType::ClientKeepalive,
            11 => CommandType::ClientClose,
            12 => CommandType::AddCounter,
            13 => CommandType::RemoveCounter,
            14 => CommandType::TerminateDriver,
            other => {
                return Err(Error::GenericControlProtocol(format!(
                    "unknown command type {other}"
                )))
            }
        })
    }
}

/// `correlation_id(8) + client_id(8) + command_type(2) + length(4)`,
/// padded to 24 bytes.
#[derive(Debug, Clone, Copy)]
pub struct CommandHeader {
    pub correlation_id: i64,
    pub client_id: i64,
    pub command_type: u16,
    pub length: u32,
}

impl CommandHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..8].copy_from_slice(&self.correlation_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.client_id.to_le_bytes());
        buf[16..18].copy_from_slice(&self.command_type.to_le_bytes());
        buf[18..22].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_LEN {
            return Err(Error::GenericControlProtocol("command frame too short".into()));
        }
        Ok(Self {
            correlation_id: i64::from_le_bytes(buf[0..8].try_into().expect("len")),
            client_id: i64::from_le_bytes(buf[8..16].try_into().expect("len")),
            command_type: u16::from_le_bytes(buf[16..18].try_into().expect("len")),
            length: u32::from_le_bytes(buf[18..22].try_into().expect("len")),
        })
    }
}

/// A decoded client command (spec §4.2 "Recognized commands").
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    AddPublication { correlation_id: i64, client_id: i64, channel: String, stream_id: i32, exclusive: bool },
    RemovePublication { correlation_id: i64, client_id: i64, registration_id: i64 },
    AddSubscription { correlation_id: i64, client_id: i64, channel: String, stream_id: i32 },
    RemoveSubscription { correlation_id: i64, client_id: i64, registration_id: i64 },
    AddDestination { correlation_id: i64, client_id: i64, registration_id: i64, channel: String },
    RemoveDestination { correlation_id: i64, client_id: i64, registration_id: i64, channel: String },
    AddRcvDestination { correlation_id: i64, client_id: i64, registration_id: i64, channel: String },
    RemoveRcvDestination { correlation_id: i64, client_id: i64, registration_id: i64, channel: String },
    ClientKeepalive { client_id: i64 },
    ClientClose { client_id: i64 },
    AddCounter { correlation_id: i64, client_id: i64, type_id: i32, key_bytes: Vec<u8>, label: String },
    RemoveCounter { correlation_id: i64, client_id: i64, registration_id: i64 },
    TerminateDriver { client_id: i64, token: Vec<u8> },
}

fn put_string(buf: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn take_string(buf: &[u8], offset: &mut usize) -> Result<String, Error> {
    let len = take_u16(buf, offset)? as usize;
    let end = *offset + len;
    let slice = buf
        .get(*offset..end)
        .ok_or_else(|| Error::GenericControlProtocol("truncated string field".into()))?;
    *offset = end;
    String::from_utf8(slice.to_vec()).map_err(|_| Error::GenericControlProtocol("invalid utf8 in string field".into()))
}

fn take_u16(buf: &[u8], offset: &mut usize) -> Result<u16, Error> {
    let bytes = buf
        .get(*offset..*offset + 2)
        .ok_or_else(|| Error::GenericControlProtocol("truncated u16 field".into()))?;
    *offset += 2;
    Ok(u16::from_le_bytes(bytes.try_into().expect("len")))
}

fn take_i32(buf: &[u8], offset: &mut usize) -> Result<i32, Error> {
    let bytes = buf
        .get(*offset..*offset + 4)
        .ok_or_else(|| Error::GenericControlProtocol("truncated i32 field".into()))?;
    *offset += 4;
    Ok(i32::from_le_bytes(bytes.try_into().expect("len")))
}

fn take_i64(buf: &[u8], offset: &mut usize) -> Result<i64, Error> {
    let bytes = buf
        .get(*offset..*offset + 8)
        .ok_or_else(|| Error::GenericControlProtocol("truncated i64 field".into()))?;
    *offset += 8;
    Ok(i64::from_le_bytes(bytes.try_into().expect("len")))
}

fn take_bytes(buf: &[u8], offset: &mut usize) -> Result<Vec<u8>, Error> {
    let len = take_u16(buf, offset)? as usize;
    let end = *offset + len;
    let slice = buf
        .get(*offset..end)
        .ok_or_else(|| Error::GenericControlProtocol("truncated byte field".into()))?;
    *offset = end;
    Ok(slice.to_vec())
}

/// Encodes `command` into a full wire frame: header, body, trailing
/// crc32 of the body.
pub fn encode(correlation_id: i64, client_id: i64, command: &ClientCommand) -> Vec<u8> {
    let (command_type, mut body) = encode_body(command);
    let mut hasher = Hasher::new();
    hasher.update(&body);
    let checksum = hasher.finalize();
    body.extend_from_slice(&checksum.to_le_bytes());

    let header = CommandHeader {
        correlation_id,
        client_id,
        command_type: command_type as u16,
        length: body.len() as u32,
    };
    let mut frame = header.encode().to_vec();
    frame.extend_from_slice(&body);
    frame
}

fn encode_body(command: &ClientCommand) -> (CommandType, Vec<u8>) {
    let mut buf = Vec::new();
    let command_type = match command {
        ClientCommand::AddPublication { channel, stream_id, exclusive, .. } => {
            put_string(&mut buf, channel);
            buf.extend_from_slice(&stream_id.to_le_bytes());
            buf.push(*exclusive as u8);
            if *exclusive {
                CommandType::AddExclusivePublication
            } else {
                CommandType::AddPublication
            }
        }
        ClientCommand::RemovePublication { registration_id, .. } => {
            buf.extend_from_slice(&registration_id.to_le_bytes());
            CommandType::RemovePublication
        }
        ClientCommand::AddSubscription { channel, stream_id, .. } => {
            put_string(&mut buf, channel);
            buf.extend_from_slice(&stream_id.to_le_bytes());
            CommandType::AddSubscription
        }
        ClientCommand::RemoveSubscription { registration_id, .. } => {
            buf.extend_from_slice(&registration_id.to_le_bytes());
            CommandType::RemoveSubscription
        }
        ClientCommand::AddDestination { registration_id, channel, .. } => {
            buf.extend_from_slice(&registration_id.to_le_bytes());
            put_string(&mut buf, channel);
            CommandType::AddDestination
        }
        ClientCommand::RemoveDestination { registration_id, channel, .. } => {
            buf.extend_from_slice(&registration_id.to_le_bytes());
            put_string(&mut buf, channel);
            CommandType::RemoveDestination
        }
        ClientCommand::AddRcvDestination { registration_id, channel, .. } => {
            buf.extend_from_slice(&registration_id.to_le_bytes());
            put_string(&mut buf, channel);
            CommandType::AddRcvDestination
        }
        ClientCommand::RemoveRcvDestination { registration_id, channel, .. } => {
            buf.extend_from_slice(&registration_id.to_le_bytes());
            put_string(&mut buf, channel);
            CommandType::RemoveRcvDestination
        }
        ClientCommand::ClientKeepalive { .. } => CommandType::ClientKeepalive,
        ClientCommand::ClientClose { .. } => CommandType::ClientClose,
        ClientCommand::AddCounter { type_id, key_bytes, label, .. } => {
            buf.extend_from_slice(&type_id.to_le_bytes());
            buf.extend_from_slice(&(key_bytes.len() as u16).to_le_bytes());
            buf.extend_from_slice(key_bytes);
            put_string(&mut buf, label);
            CommandType::AddCounter
        }
        ClientCommand::RemoveCounter { registration_id, .. } => {
            buf.extend_from_slice(&registration_id.to_le_bytes());
            CommandType::RemoveCounter
        }
        ClientCommand::TerminateDriver { token, .. } => {
            buf.extend_from_slice(&(token.len() as u16).to_le_bytes());
            buf.extend_from_slice(token);
            CommandType::TerminateDriver
        }
    };
    (command_type, buf)
}

/// Decodes a full wire frame, validating the header and the trailing
/// crc32 checksum before interpreting the body.
pub fn decode(frame: &[u8]) -> Result<ClientCommand, Error> {
    let header = CommandHeader::decode(frame)?;
    let body_with_checksum = frame
        .get(HEADER_LEN..HEADER_LEN + header.length as usize)
        .ok_or_else(|| Error::GenericControlProtocol("command frame shorter than declared length".into()))?;
    if body_with_checksum.len() < 4 {
        return Err(Error::GenericControlProtocol("command body missing checksum".into()));
    }
    let (body, checksum_bytes) = body_with_checksum.split_at(body_with_checksum.len() - 4);
    let expected = u32::from_le_bytes(checksum_bytes.try_into().expect("len"));
    let mut hasher = Hasher::new();
    hasher.update(body);
    if hasher.finalize() != expected {
        return Err(Error::GenericControlProtocol("command checksum mismatch".into()));
    }

    let command_type = CommandType::from_u16(header.command_type)?;
    let correlation_id = header.correlation_id;
    let client_id = header.client_id;
    let mut offset = 0usize;

    Ok(match command_type {
        CommandType::AddPublication | CommandType::AddExclusivePublication => ClientCommand::AddPublication {
            correlation_id,
            client_id,
            channel: take_string(body, &mut offset)?,
            stream_id: take_i32(body, &mut offset)?,
            exclusive: matches!(command_type, CommandType::AddExclusivePublication),
        },
        CommandType::RemovePublication => ClientCommand::RemovePublication {
            correlation_id,
            client_id,
            registration_id: take_i64(body, &mut offset)?,
        },
        CommandType::AddSubscription => ClientCommand::AddSubscription {
            correlation_id,
            client_id,
            channel: take_string(body, &mut offset)?,
            stream_id: take_i32(body, &mut offset)?,
        },
        CommandType::RemoveSubscription => ClientCommand::RemoveSubscription {
            correlation_id,
            client_id,
            registration_id: take_i64(body, &mut offset)?,
        },
        CommandType::AddDestination => ClientCommand::AddDestination {
            correlation_id,
            client_id,
            registration_id: take_i64(body, &mut offset)?,
            channel: take_string(body, &mut offset)?,
        },
        CommandType::RemoveDestination => ClientCommand::RemoveDestination {
            correlation_id,
            client_id,
            registration_id: take_i64(body, &mut offset)?,
            channel: take_string(body, &mut offset)?,
        },
        CommandType::AddRcvDestination => ClientCommand::AddRcvDestination {
            correlation_id,
            client_id,
            registration_id: take_i64(body, &mut offset)?,
            channel: take_string(body, &mut offset)?,
        },
        CommandType::RemoveRcvDestination => ClientCommand::RemoveRcvDestination {
            correlation_id,
            client_id,
            registration_id: take_i64(body, &mut offset)?,
            channel: take_string(body, &mut offset)?,
        },
        CommandType::ClientKeepalive => ClientCommand::ClientKeepalive { client_id },
        CommandType::ClientClose => ClientCommand::ClientClose { client_id },
        CommandType::AddCounter => ClientCommand::AddCounter {
            correlation_id,
            client_id,
            type_id: take_i32(body, &mut offset)?,
            key_bytes: take_bytes(body, &mut offset)?,
            label: take_string(body, &mut offset)?,
        },
        CommandType::RemoveCounter => ClientCommand::RemoveCounter {
            correlation_id,
            client_id,
            registration_id: take_i64(body, &mut offset)?,
        },
        CommandType::TerminateDriver => ClientCommand::TerminateDriver {
            client_id,
            token: take_bytes(body, &mut offset)?,
        },
    })
}

/// Responses and asynchronous notifications sent back to clients
/// (spec §6 "Response/notification ids").
#[derive(Debug, Clone, PartialEq)]
pub enum DriverResponse {
    OperationSucceeded { correlation_id: i64 },
    Error { correlation_id: i64, code: ErrorCode, message: String },
    PublicationReady { correlation_id: i64, registration_id: i64, session_id: i32, log_file: String },
    SubscriptionReady { correlation_id: i64, registration_id: i64 },
    AvailableImage { correlation_id: i64, subscription_registration_id: i64, session_id: i32, log_file: String },
    UnavailableImage { correlation_id: i64, subscription_registration_id: i64 },
    CounterReady { correlation_id: i64, registration_id: i64 },
    UnavailableCounter { correlation_id: i64, registration_id: i64 },
    ClientTimeout { client_id: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_publication_round_trips_through_encode_decode() {
        let command = ClientCommand::AddPublication {
            correlation_id: 7,
            client_id: 1,
            channel: "aeron:udp?endpoint=127.0.0.1:40123".into(),
            stream_id: 1001,
            exclusive: false,
        };
        let frame = encode(7, 1, &command);
        assert_eq!(decode(&frame).unwrap(), command);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let command = ClientCommand::ClientKeepalive { client_id: 1 };
        let mut frame = encode(42, 1, &command);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn unknown_command_type_is_a_protocol_error() {
        let mut frame = encode(1, 1, &ClientCommand::ClientClose { client_id: 1 });
        frame[16..18].copy_from_slice(&999u16.to_le_bytes());
        assert!(decode(&frame).is_err());
    }
}
