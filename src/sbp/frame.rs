use thiserror::Error;

/// Frame start marker.
pub const PREAMBLE: u8 = 0x55;

/// Preamble + type (u16) + sender (u16) + payload length (u8).
const HEADER_LEN: usize = 6;

/// CRC trailer length.
const CRC_LEN: usize = 2;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("frame CRC mismatch on message {msg_type:#06x} (got {got:#06x}, want {want:#06x})")]
    Crc { msg_type: u16, got: u16, want: u16 },

    #[error("unintelligible payload on message {msg_type:#06x}")]
    Payload { msg_type: u16 },
}

/// One complete frame lifted off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u16,
    pub sender: u16,
    pub payload: Vec<u8>,
}

/// Encodes a complete frame ready to be written to the transport.
pub fn encode(msg_type: u16, sender: u16, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= u8::MAX as usize);

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
    out.push(PREAMBLE);
    out.extend_from_slice(&msg_type.to_le_bytes());
    out.extend_from_slice(&sender.to_le_bytes());
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);

    let crc = crc16(&out[1..]);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// CRC-16/XMODEM over type, sender, length and payload.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Incremental frame decoder.
///
/// Feed raw transport bytes with [Framer::consume], then drain complete
/// frames with [Framer::poll]. A frame failing its CRC is reported once and
/// the decoder resynchronizes on the next preamble candidate, so one bad
/// frame never stalls the stream.
#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consume(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn poll(&mut self) -> Option<Result<Frame, FramingError>> {
        loop {
            // drop inter-frame garbage up to the next preamble
            match self.buf.iter().position(|&b| b == PREAMBLE) {
                Some(0) => {},
                Some(n) => {
                    self.buf.drain(..n);
                },
                None => {
                    self.buf.clear();
                    return None;
                },
            }

            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let len = self.buf[5] as usize;
            let total = HEADER_LEN + len + CRC_LEN;

            if self.buf.len() < total {
                return None;
            }

            let msg_type = u16::from_le_bytes([self.buf[1], self.buf[2]]);
            let sender = u16::from_le_bytes([self.buf[3], self.buf[4]]);

            let want = crc16(&self.buf[1..HEADER_LEN + len]);
            let got = u16::from_le_bytes([self.buf[total - 2], self.buf[total - 1]]);

            if got != want {
                // resync: the real frame may start inside this one
                self.buf.drain(..1);
                return Some(Err(FramingError::Crc { msg_type, got, want }));
            }

            let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
            self.buf.drain(..total);

            return Some(Ok(Frame {
                msg_type,
                sender,
                payload,
            }));
        }
    }
}
