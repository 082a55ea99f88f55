use bytes::{Buf, BufMut, BytesMut};

use crate::MAX_DATAGRAM_SIZE;
use crate::block::BlockNumber;
use crate::error::{Result, TftpError};

/// TFTP opcodes (RFC 1350)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,   // Read request
    Wrq = 2,   // Write request
    Data = 3,  // Data
    Ack = 4,   // Acknowledgment
    Error = 5, // Error
}

impl TryFrom<u16> for Opcode {
    type Error = TftpError;

    fn try_from(value: u16) -> std::result::Result<Self, TftpError> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            _ => Err(TftpError::Malformed(format!("invalid opcode: {value}"))),
        }
    }
}

/// Transfer modes (RFC 1350)
///
/// `mail` is obsolete and deliberately has no variant: a request carrying it
/// fails mode resolution and the session answers with an ERROR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// 8-bit ASCII with CR LF line endings on the wire
    Netascii,
    /// Binary transfer without conversion
    Octet,
}

impl Mode {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "netascii" => Ok(Mode::Netascii),
            "octet" => Ok(Mode::Octet),
            other => Err(TftpError::UnsupportedMode(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Netascii => "netascii",
            Mode::Octet => "octet",
        }
    }
}

/// One RFC 1350 datagram, one variant per opcode.
///
/// The request mode travels as the raw (lowercased) wire string; it resolves
/// to a [`Mode`] at session setup so that an unsupported mode is answered
/// with an ERROR rather than dropped at decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// opcode | filename | 0 | mode | 0
    Rrq { filename: String, mode: String },
    /// opcode | filename | 0 | mode | 0
    Wrq { filename: String, mode: String },
    /// opcode | block | 0..512 payload bytes
    Data {
        block: BlockNumber,
        payload: Vec<u8>,
    },
    /// opcode | block
    Ack { block: BlockNumber },
    /// opcode | errcode | message | 0
    Error { code: u16, message: String },
}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq { .. } => Opcode::Rrq,
            Packet::Wrq { .. } => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
        }
    }

    /// Serialize into wire bytes.
    ///
    /// RFC 1350 limits are enforced here rather than trusted at call sites:
    /// a DATA payload beyond 512 bytes, a datagram beyond
    /// [`MAX_DATAGRAM_SIZE`], or a non-ASCII string all fail the build.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(self.opcode() as u16);

        match self {
            Packet::Rrq { filename, mode } | Packet::Wrq { filename, mode } => {
                put_ascii(&mut buf, filename, "filename")?;
                buf.put_u8(0);
                put_ascii(&mut buf, mode, "mode")?;
                buf.put_u8(0);
            }
            Packet::Data { block, payload } => {
                if payload.len() > crate::BLOCK_SIZE {
                    return Err(TftpError::IllegalBuild(format!(
                        "DATA payload of {} bytes exceeds {}",
                        payload.len(),
                        crate::BLOCK_SIZE
                    )));
                }
                buf.put_u16(block.value());
                buf.put_slice(payload);
            }
            Packet::Ack { block } => {
                buf.put_u16(block.value());
            }
            Packet::Error { code, message } => {
                buf.put_u16(*code);
                put_ascii(&mut buf, message, "error message")?;
                buf.put_u8(0);
            }
        }

        if buf.len() > MAX_DATAGRAM_SIZE {
            return Err(TftpError::IllegalBuild(format!(
                "datagram of {} bytes exceeds {}",
                buf.len(),
                MAX_DATAGRAM_SIZE
            )));
        }
        Ok(buf.to_vec())
    }

    /// Parse a received datagram.
    ///
    /// Pure: the slice is exactly what the socket reported, nothing more.
    /// RRQ/WRQ modes come back lowercased; trailing bytes after an ACK block
    /// number are ignored; an ERROR message runs to the first NUL and the
    /// rest of the datagram is discarded.
    pub fn decode(data: &[u8]) -> Result<Packet> {
        if data.len() < 4 {
            return Err(TftpError::Malformed(format!(
                "datagram too small: {} bytes",
                data.len()
            )));
        }

        let mut bytes = BytesMut::from(data);
        let opcode = Opcode::try_from(bytes.get_u16())?;

        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let filename = take_cstring(&mut bytes)?;
                let mode = take_cstring(&mut bytes)?.to_lowercase();
                let packet = if opcode == Opcode::Rrq {
                    Packet::Rrq { filename, mode }
                } else {
                    Packet::Wrq { filename, mode }
                };
                Ok(packet)
            }
            Opcode::Data => {
                let block = BlockNumber::new(bytes.get_u16());
                Ok(Packet::Data {
                    block,
                    payload: bytes.to_vec(),
                })
            }
            Opcode::Ack => {
                let block = BlockNumber::new(bytes.get_u16());
                Ok(Packet::Ack { block })
            }
            Opcode::Error => {
                let code = bytes.get_u16();
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                let message = String::from_utf8_lossy(&bytes[..end]).into_owned();
                Ok(Packet::Error { code, message })
            }
        }
    }
}

fn put_ascii(buf: &mut BytesMut, s: &str, what: &str) -> Result<()> {
    if !s.is_ascii() {
        return Err(TftpError::IllegalBuild(format!("{what} is not US-ASCII")));
    }
    if s.as_bytes().contains(&0) {
        return Err(TftpError::IllegalBuild(format!("{what} contains NUL")));
    }
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Split off a NUL-terminated string. A missing terminator is a malformed
/// request, not an empty string.
fn take_cstring(bytes: &mut BytesMut) -> Result<String> {
    let null_pos = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TftpError::Malformed("no null terminator found".to_string()))?;

    let string_bytes = bytes.split_to(null_pos);
    bytes.advance(1); // skip the terminator

    String::from_utf8(string_bytes.to_vec())
        .map_err(|e| TftpError::Malformed(format!("invalid UTF-8 in string: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn rrq_round_trip() {
        let pkt = Packet::Rrq {
            filename: "boot/pxelinux.0".to_string(),
            mode: "octet".to_string(),
        };
        let wire = pkt.encode().unwrap();
        assert_eq!(&wire[..2], &[0, 1]);
        assert_eq!(Packet::decode(&wire).unwrap(), pkt);
    }

    #[test]
    fn wrq_mode_is_lowercased_on_decode() {
        let mut wire = vec![0u8, 2];
        wire.extend_from_slice(b"upload.bin\0NetASCII\0");
        match Packet::decode(&wire).unwrap() {
            Packet::Wrq { filename, mode } => {
                assert_eq!(filename, "upload.bin");
                assert_eq!(mode, "netascii");
            }
            other => panic!("expected WRQ, got {other:?}"),
        }
    }

    #[test]
    fn request_without_mode_terminator_is_malformed() {
        let mut wire = vec![0u8, 1];
        wire.extend_from_slice(b"file\0octet"); // no trailing NUL
        assert!(matches!(
            Packet::decode(&wire),
            Err(TftpError::Malformed(_))
        ));
    }

    #[test]
    fn data_payload_length_is_the_received_length() {
        let wire = [0u8, 3, 0, 7, b'a', b'b', b'c'];
        match Packet::decode(&wire).unwrap() {
            Packet::Data { block, payload } => {
                assert_eq!(block.value(), 7);
                assert_eq!(payload, b"abc");
            }
            other => panic!("expected DATA, got {other:?}"),
        }
    }

    #[test]
    fn empty_data_block_is_valid() {
        let wire = [0u8, 3, 0, 1];
        match Packet::decode(&wire).unwrap() {
            Packet::Data { payload, .. } => assert!(payload.is_empty()),
            other => panic!("expected DATA, got {other:?}"),
        }
    }

    #[test]
    fn data_encoder_rejects_oversized_payload() {
        let pkt = Packet::Data {
            block: BlockNumber::new(1),
            payload: vec![0u8; crate::BLOCK_SIZE + 1],
        };
        assert!(matches!(pkt.encode(), Err(TftpError::IllegalBuild(_))));
    }

    #[test]
    fn full_block_encodes_exactly() {
        let pkt = Packet::Data {
            block: BlockNumber::new(2),
            payload: vec![b'A'; crate::BLOCK_SIZE],
        };
        let wire = pkt.encode().unwrap();
        assert_eq!(wire.len(), 4 + crate::BLOCK_SIZE);
        assert_eq!(&wire[..4], &[0, 3, 0, 2]);
    }

    #[test]
    fn ack_ignores_trailing_bytes() {
        let wire = [0u8, 4, 0, 9, 0xde, 0xad];
        match Packet::decode(&wire).unwrap() {
            Packet::Ack { block } => assert_eq!(block.value(), 9),
            other => panic!("expected ACK, got {other:?}"),
        }
    }

    #[test]
    fn error_message_stops_at_the_first_nul() {
        let mut wire = vec![0u8, 5, 0, 2];
        wire.extend_from_slice(b"denied\0junk after terminator");
        match Packet::decode(&wire).unwrap() {
            Packet::Error { code, message } => {
                assert_eq!(code, ErrorCode::AccessViolation as u16);
                assert_eq!(message, "denied");
            }
            other => panic!("expected ERROR, got {other:?}"),
        }
    }

    #[test]
    fn error_without_terminator_takes_the_remainder() {
        let mut wire = vec![0u8, 5, 0, 0];
        wire.extend_from_slice(b"oops");
        match Packet::decode(&wire).unwrap() {
            Packet::Error { message, .. } => assert_eq!(message, "oops"),
            other => panic!("expected ERROR, got {other:?}"),
        }
    }

    #[test]
    fn unknown_opcode_is_malformed() {
        let wire = [0u8, 6, 0, 0];
        assert!(matches!(
            Packet::decode(&wire),
            Err(TftpError::Malformed(_))
        ));
    }

    #[test]
    fn short_datagrams_are_malformed() {
        assert!(Packet::decode(&[0, 4, 0]).is_err());
        assert!(Packet::decode(&[]).is_err());
    }

    #[test]
    fn non_ascii_filename_fails_the_build() {
        let pkt = Packet::Rrq {
            filename: "datei-\u{00fc}".to_string(),
            mode: "octet".to_string(),
        };
        assert!(matches!(pkt.encode(), Err(TftpError::IllegalBuild(_))));
    }

    #[test]
    fn mode_resolution_rejects_mail() {
        assert_eq!(Mode::from_str("OCTET").unwrap(), Mode::Octet);
        assert_eq!(Mode::from_str("netascii").unwrap(), Mode::Netascii);
        assert!(matches!(
            Mode::from_str("mail"),
            Err(TftpError::UnsupportedMode(_))
        ));
        assert!(Mode::from_str("binary").is_err());
    }
}
