use serde::Serialize;

use crate::sbp::{
    frame::{self, Frame, FramingError},
    HOST_SENDER_ID,
};

pub const MSG_BASE_POS_ECEF: u16 = 0x0048;
pub const MSG_OBS: u16 = 0x004A;
pub const MSG_GLO_BIASES: u16 = 0x0075;
pub const MSG_EPHEMERIS_GPS: u16 = 0x0086;
pub const MSG_EPHEMERIS_GLO: u16 = 0x0088;
pub const MSG_IONO: u16 = 0x0090;
pub const MSG_LOG: u16 = 0x0401;

pub const MSG_SETTINGS_WRITE: u16 = 0x00A0;
pub const MSG_SETTINGS_SAVE: u16 = 0x00A1;
pub const MSG_SETTINGS_READ_BY_INDEX_REQ: u16 = 0x00A2;
pub const MSG_SETTINGS_SAVE_RESP: u16 = 0x00A3;
pub const MSG_SETTINGS_READ_REQ: u16 = 0x00A4;
pub const MSG_SETTINGS_READ_RESP: u16 = 0x00A5;
pub const MSG_SETTINGS_READ_BY_INDEX_DONE: u16 = 0x00A6;
pub const MSG_SETTINGS_READ_BY_INDEX_RESP: u16 = 0x00A7;
pub const MSG_SETTINGS_WRITE_RESP: u16 = 0x00AF;

/// One decoded inbound message. Immutable once built.
///
/// Correction-data payloads (observations, ephemerides, ...) are carried
/// opaque: the capture log preserves them for the post-processing service
/// and nothing in this program interprets them. Settings responses and log
/// notifications are decoded because the settings client and the operator
/// need their fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "msg")]
pub enum Message {
    Obs {
        payload: Vec<u8>,
    },
    BasePosEcef {
        x: f64,
        y: f64,
        z: f64,
    },
    GloBiases {
        payload: Vec<u8>,
    },
    EphemerisGps {
        payload: Vec<u8>,
    },
    EphemerisGlo {
        payload: Vec<u8>,
    },
    Iono {
        payload: Vec<u8>,
    },
    Log {
        level: u8,
        text: String,
    },
    SettingsReadResp {
        section: String,
        key: String,
        value: String,
    },
    SettingsWriteResp {
        status: u8,
        section: String,
        key: String,
        value: String,
    },
    SettingsReadByIndexResp {
        index: u16,
        section: String,
        key: String,
        value: String,
    },
    SettingsReadByIndexDone,
    SettingsSaveResp {
        status: u8,
    },
    /// Catch-all: recognized framing, unrecognized type. Never dropped.
    Unknown {
        msg_type: u16,
        payload: Vec<u8>,
    },
}

impl Message {
    /// Decodes a well-framed message. A recognized type whose payload does
    /// not match its layout is a [FramingError], not a panic and not a
    /// silent drop.
    pub fn decode(frame: &Frame) -> Result<Self, FramingError> {
        let payload = &frame.payload;
        let bad = || FramingError::Payload {
            msg_type: frame.msg_type,
        };

        match frame.msg_type {
            MSG_OBS => Ok(Self::Obs {
                payload: payload.clone(),
            }),

            MSG_BASE_POS_ECEF => {
                if payload.len() < 24 {
                    return Err(bad());
                }
                let f = |i: usize| {
                    let mut le = [0u8; 8];
                    le.copy_from_slice(&payload[i..i + 8]);
                    f64::from_le_bytes(le)
                };
                Ok(Self::BasePosEcef {
                    x: f(0),
                    y: f(8),
                    z: f(16),
                })
            },

            MSG_GLO_BIASES => Ok(Self::GloBiases {
                payload: payload.clone(),
            }),

            MSG_EPHEMERIS_GPS => Ok(Self::EphemerisGps {
                payload: payload.clone(),
            }),

            MSG_EPHEMERIS_GLO => Ok(Self::EphemerisGlo {
                payload: payload.clone(),
            }),

            MSG_IONO => Ok(Self::Iono {
                payload: payload.clone(),
            }),

            MSG_LOG => {
                let (&level, text) = payload.split_first().ok_or_else(bad)?;
                Ok(Self::Log {
                    level,
                    text: String::from_utf8_lossy(text).into_owned(),
                })
            },

            MSG_SETTINGS_READ_RESP => {
                let [section, key, value] = setting_fields(payload).ok_or_else(bad)?;
                Ok(Self::SettingsReadResp {
                    section,
                    key,
                    value,
                })
            },

            MSG_SETTINGS_WRITE_RESP => {
                let (&status, rest) = payload.split_first().ok_or_else(bad)?;
                let [section, key, value] = setting_fields(rest).ok_or_else(bad)?;
                Ok(Self::SettingsWriteResp {
                    status,
                    section,
                    key,
                    value,
                })
            },

            MSG_SETTINGS_READ_BY_INDEX_RESP => {
                if payload.len() < 2 {
                    return Err(bad());
                }
                let index = u16::from_le_bytes([payload[0], payload[1]]);
                let [section, key, value] = setting_fields(&payload[2..]).ok_or_else(bad)?;
                Ok(Self::SettingsReadByIndexResp {
                    index,
                    section,
                    key,
                    value,
                })
            },

            MSG_SETTINGS_READ_BY_INDEX_DONE => Ok(Self::SettingsReadByIndexDone),

            MSG_SETTINGS_SAVE_RESP => {
                let (&status, _) = payload.split_first().ok_or_else(bad)?;
                Ok(Self::SettingsSaveResp { status })
            },

            msg_type => Ok(Self::Unknown {
                msg_type,
                payload: payload.clone(),
            }),
        }
    }

    pub fn msg_type(&self) -> u16 {
        match self {
            Self::Obs { .. } => MSG_OBS,
            Self::BasePosEcef { .. } => MSG_BASE_POS_ECEF,
            Self::GloBiases { .. } => MSG_GLO_BIASES,
            Self::EphemerisGps { .. } => MSG_EPHEMERIS_GPS,
            Self::EphemerisGlo { .. } => MSG_EPHEMERIS_GLO,
            Self::Iono { .. } => MSG_IONO,
            Self::Log { .. } => MSG_LOG,
            Self::SettingsReadResp { .. } => MSG_SETTINGS_READ_RESP,
            Self::SettingsWriteResp { .. } => MSG_SETTINGS_WRITE_RESP,
            Self::SettingsReadByIndexResp { .. } => MSG_SETTINGS_READ_BY_INDEX_RESP,
            Self::SettingsReadByIndexDone => MSG_SETTINGS_READ_BY_INDEX_DONE,
            Self::SettingsSaveResp { .. } => MSG_SETTINGS_SAVE_RESP,
            Self::Unknown { msg_type, .. } => *msg_type,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unknown { .. })
    }
}

/// Splits a `section\0key\0value\0` setting payload. Trailing fields past
/// the first three (format hints on some firmwares) are tolerated.
fn setting_fields(payload: &[u8]) -> Option<[String; 3]> {
    let text = std::str::from_utf8(payload).ok()?;
    let mut parts = text.split('\0');

    let section = parts.next()?.to_string();
    let key = parts.next()?.to_string();
    let value = parts.next()?.to_string();

    Some([section, key, value])
}

fn setting_payload(fields: &[&str]) -> Vec<u8> {
    let mut payload = Vec::new();
    for field in fields {
        payload.extend_from_slice(field.as_bytes());
        payload.push(0);
    }
    payload
}

/// Encoded read-by-name request frame.
pub fn settings_read_req(section: &str, key: &str) -> Vec<u8> {
    frame::encode(
        MSG_SETTINGS_READ_REQ,
        HOST_SENDER_ID,
        &setting_payload(&[section, key]),
    )
}

/// Encoded write request frame.
pub fn settings_write(section: &str, key: &str, value: &str) -> Vec<u8> {
    frame::encode(
        MSG_SETTINGS_WRITE,
        HOST_SENDER_ID,
        &setting_payload(&[section, key, value]),
    )
}

/// Encoded read-by-index request frame.
pub fn settings_read_by_index_req(index: u16) -> Vec<u8> {
    frame::encode(
        MSG_SETTINGS_READ_BY_INDEX_REQ,
        HOST_SENDER_ID,
        &index.to_le_bytes(),
    )
}

/// Encoded save-to-persistent-storage request frame.
pub fn settings_save() -> Vec<u8> {
    frame::encode(MSG_SETTINGS_SAVE, HOST_SENDER_ID, &[])
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sbp::Framer;

    fn decode_wire(wire: &[u8]) -> Result<Message, FramingError> {
        let mut framer = Framer::new();
        framer.consume(wire);
        let frame = framer.poll().unwrap().unwrap();
        Message::decode(&frame)
    }

    #[test]
    fn write_request_layout() {
        let wire = settings_write("surveyed_position", "broadcast", "True");

        // header: preamble, type, sender, length
        assert_eq!(wire[0], 0x55);
        assert_eq!(u16::from_le_bytes([wire[1], wire[2]]), MSG_SETTINGS_WRITE);
        assert_eq!(u16::from_le_bytes([wire[3], wire[4]]), HOST_SENDER_ID);

        let payload = &wire[6..wire.len() - 2];
        assert_eq!(payload, b"surveyed_position\0broadcast\0True\0");
    }

    #[test]
    fn read_by_index_request_layout() {
        let wire = settings_read_by_index_req(0x0102);
        assert_eq!(&wire[6..wire.len() - 2], &[0x02, 0x01]);
    }

    #[test]
    fn decodes_read_response() {
        let wire = frame::encode(
            MSG_SETTINGS_READ_RESP,
            0x88,
            b"surveyed_position\0surveyed_lat\061.27\0",
        );

        assert_eq!(
            decode_wire(&wire).unwrap(),
            Message::SettingsReadResp {
                section: "surveyed_position".into(),
                key: "surveyed_lat".into(),
                value: "61.27".into(),
            }
        );
    }

    #[test]
    fn decodes_write_response_status() {
        let mut payload = vec![1u8];
        payload.extend_from_slice(b"surveyed_position\0broadcast\0True\0");
        let wire = frame::encode(MSG_SETTINGS_WRITE_RESP, 0x88, &payload);

        match decode_wire(&wire).unwrap() {
            Message::SettingsWriteResp { status, key, .. } => {
                assert_eq!(status, 1);
                assert_eq!(key, "broadcast");
            },
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn decodes_log_notification() {
        let wire = frame::encode(MSG_LOG, 0x88, b"\x06acquiring satellites");

        assert_eq!(
            decode_wire(&wire).unwrap(),
            Message::Log {
                level: 6,
                text: "acquiring satellites".into(),
            }
        );
    }

    #[test]
    fn truncated_base_pos_is_framing_error() {
        let wire = frame::encode(MSG_BASE_POS_ECEF, 0x88, &[0u8; 12]);

        match decode_wire(&wire) {
            Err(FramingError::Payload { msg_type }) => assert_eq!(msg_type, MSG_BASE_POS_ECEF),
            other => panic!("expected payload error, got {:?}", other),
        }
    }

    #[test]
    fn unrecognized_type_hits_catch_all() {
        let wire = frame::encode(0x7777, 0x88, &[1, 2, 3]);

        let decoded = decode_wire(&wire).unwrap();
        assert!(!decoded.is_recognized());
        assert_eq!(decoded.msg_type(), 0x7777);
    }
}
