/*! Bus frame codec.

Every unit on the wire is a fixed 21-byte frame:

```text
08 70 | source u16 LE | dest u16 LE | 13-byte payload | CRC-16/Modbus LE
```

The payload is zero-padded on the right; its first byte is the opcode. The
CRC covers everything before it, header included. The port reader consumes
the two header bytes while scanning, so [`Frame::deserialize`] takes the 19
bytes that follow.
*/
use crc16::{MODBUS, State};

use crate::{Error, Result};

/// Frame header literal, scanned for by the port reader.
pub const PACKET_HEADER: [u8; 2] = [0x08, 0x70];

/// Bus id of the hub itself.
pub const HUB_ID: u16 = 1;

/// Destination id addressing every node at once.
pub const BROADCAST_ID: u16 = 255;

/// Maximum logical payload, opcode byte included.
pub const MAX_PAYLOAD_SIZE: usize = 13;

/// Full frame size on the wire.
pub const MAX_PACKET_SIZE: usize = 8 + MAX_PAYLOAD_SIZE;

/// Frame size once the header has been consumed upstream.
pub const FRAME_BODY_SIZE: usize = MAX_PACKET_SIZE - PACKET_HEADER.len();

/// One bus frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sender bus id.
    pub source: u16,
    /// Receiver bus id.
    pub dest: u16,
    /// Logical payload; first byte is the opcode.
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a frame from the hub to `dest`.
    pub fn new(dest: u16, data: Vec<u8>) -> Self {
        Self {
            source: HUB_ID,
            dest,
            data,
        }
    }

    /// The opcode byte, if the payload is non-empty.
    pub fn opcode(&self) -> Option<u8> {
        self.data.first().copied()
    }

    /// Serialize to the 21-byte wire form, zero-padding the payload.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if self.data.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge(self.data.len()));
        }
        let mut out = Vec::with_capacity(MAX_PACKET_SIZE);
        out.extend_from_slice(&PACKET_HEADER);
        out.extend_from_slice(&self.source.to_le_bytes());
        out.extend_from_slice(&self.dest.to_le_bytes());
        out.extend_from_slice(&self.data);
        out.resize(MAX_PACKET_SIZE - 2, 0);
        out.extend_from_slice(&crc(&out).to_le_bytes());
        Ok(out)
    }

    /// Decode a frame body: source, destination, 13 payload bytes and CRC.
    ///
    /// The CRC is recomputed over the implied header plus the body, and the
    /// destination must be the hub. The payload keeps its padding; callers
    /// slice by opcode.
    pub fn deserialize(body: &[u8]) -> Result<Self> {
        if body.len() != FRAME_BODY_SIZE {
            return Err(Error::BadLength(body.len()));
        }
        let mut covered = Vec::with_capacity(MAX_PACKET_SIZE - 2);
        covered.extend_from_slice(&PACKET_HEADER);
        covered.extend_from_slice(&body[..FRAME_BODY_SIZE - 2]);
        let want = crc(&covered);
        let got = u16::from_le_bytes([body[FRAME_BODY_SIZE - 2], body[FRAME_BODY_SIZE - 1]]);
        if want != got {
            return Err(Error::BadCrc { want, got });
        }
        let dest = u16::from_le_bytes([body[2], body[3]]);
        if dest != HUB_ID {
            return Err(Error::WrongDestination(dest));
        }
        Ok(Self {
            source: u16::from_le_bytes([body[0], body[1]]),
            dest,
            data: body[4..FRAME_BODY_SIZE - 2].to_vec(),
        })
    }
}

fn crc(data: &[u8]) -> u16 {
    State::<MODBUS>::calculate(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded(data: &[u8]) -> Vec<u8> {
        let mut v = data.to_vec();
        v.resize(MAX_PAYLOAD_SIZE, 0);
        v
    }

    #[test]
    fn crc_known_answer() {
        // The standard CRC-16/Modbus check value.
        assert_eq!(crc(b"123456789"), 0x4b37);
    }

    #[test]
    fn roundtrip() -> Result<()> {
        let f = Frame {
            source: 36097,
            dest: HUB_ID,
            data: padded(&[0x90, 0x10, 0x27]),
        };
        let wire = f.serialize()?;
        assert_eq!(wire.len(), MAX_PACKET_SIZE);
        assert_eq!(&wire[..2], &PACKET_HEADER);
        let got = Frame::deserialize(&wire[2..])?;
        assert_eq!(got, f);
        Ok(())
    }

    #[test]
    fn payload_is_padded() -> Result<()> {
        let wire = Frame::new(10, vec![0x81]).serialize()?;
        assert_eq!(&wire[6..19], &padded(&[0x81])[..]);
        Ok(())
    }

    #[test]
    fn bad_crc() -> Result<()> {
        let mut wire = Frame {
            source: 10,
            dest: HUB_ID,
            data: padded(&[0x90]),
        }
        .serialize()?;
        wire[7] ^= 0xff;
        assert!(matches!(
            Frame::deserialize(&wire[2..]),
            Err(Error::BadCrc { .. })
        ));
        Ok(())
    }

    #[test]
    fn bad_length() {
        assert!(matches!(
            Frame::deserialize(&[0u8; 5]),
            Err(Error::BadLength(5))
        ));
        assert!(matches!(
            Frame::deserialize(&[0u8; 20]),
            Err(Error::BadLength(20))
        ));
    }

    #[test]
    fn wrong_destination() -> Result<()> {
        let wire = Frame {
            source: 10,
            dest: 42,
            data: padded(&[0x90]),
        }
        .serialize()?;
        assert!(matches!(
            Frame::deserialize(&wire[2..]),
            Err(Error::WrongDestination(42))
        ));
        Ok(())
    }

    #[test]
    fn oversize_payload_rejected() {
        let f = Frame::new(10, vec![0; MAX_PAYLOAD_SIZE + 1]);
        assert!(matches!(f.serialize(), Err(Error::PayloadTooLarge(14))));
    }
}
