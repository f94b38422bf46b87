//! In-process receiver double: a TCP endpoint speaking just enough SBP to
//! stand in for the base station during tests.

use std::{collections::HashMap, net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::sbp::{
    frame::{self, Frame},
    message::{
        MSG_LOG, MSG_SETTINGS_READ_BY_INDEX_DONE, MSG_SETTINGS_READ_BY_INDEX_REQ,
        MSG_SETTINGS_READ_BY_INDEX_RESP, MSG_SETTINGS_READ_REQ, MSG_SETTINGS_READ_RESP,
        MSG_SETTINGS_SAVE, MSG_SETTINGS_SAVE_RESP, MSG_SETTINGS_WRITE, MSG_SETTINGS_WRITE_RESP,
    },
    Framer,
};

const DOUBLE_SENDER_ID: u16 = 0x88;

#[derive(Debug, Clone)]
pub struct ReceiverDouble {
    /// Answer read-by-name requests.
    pub respond_reads: bool,
    /// Answer write requests.
    pub respond_writes: bool,
    /// Answer save requests.
    pub respond_save: bool,
    /// Status byte on write responses; non-zero also skips the store.
    pub write_status: u8,
    /// Acknowledge writes cleanly but store a mangled value, so every
    /// read-back mismatches.
    pub corrupt_store: bool,
    /// Periodically stream a log notification, like live hardware.
    pub stream_period: Option<Duration>,
    /// Also stream a message of a type nothing recognizes.
    pub stream_unknown: bool,
    /// Prepend a CRC-corrupted copy of each streamed frame.
    pub corrupt_frames: bool,
}

impl Default for ReceiverDouble {
    fn default() -> Self {
        Self {
            respond_reads: true,
            respond_writes: true,
            respond_save: true,
            write_status: 0,
            corrupt_store: false,
            stream_period: None,
            stream_unknown: false,
            corrupt_frames: false,
        }
    }
}

impl ReceiverDouble {
    /// Binds an ephemeral port and serves connections until dropped with
    /// the test.
    pub async fn spawn(self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(serve(self.clone(), sock));
            }
        });

        addr
    }
}

enum Action {
    Stream,
    Frames(Vec<Frame>),
    Closed,
}

async fn serve(double: ReceiverDouble, mut sock: TcpStream) {
    let mut store: HashMap<(String, String), String> = HashMap::new();
    let mut framer = Framer::new();
    let mut buf = [0u8; 2048];

    let streaming = double.stream_period.is_some();
    let mut tick =
        tokio::time::interval(double.stream_period.unwrap_or(Duration::from_secs(3600)));

    loop {
        let action = tokio::select! {
            _ = tick.tick(), if streaming => Action::Stream,

            read = sock.read(&mut buf) => match read {
                Ok(0) | Err(_) => Action::Closed,
                Ok(n) => {
                    framer.consume(&buf[..n]);
                    let mut frames = Vec::new();
                    while let Some(Ok(frame)) = framer.poll() {
                        frames.push(frame);
                    }
                    Action::Frames(frames)
                },
            },
        };

        match action {
            Action::Closed => break,
            Action::Stream => {
                if stream(&double, &mut sock).await.is_err() {
                    break;
                }
            },
            Action::Frames(frames) => {
                for frame in frames {
                    if respond(&double, &frame, &mut store, &mut sock)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            },
        }
    }
}

async fn stream(double: &ReceiverDouble, sock: &mut TcpStream) -> std::io::Result<()> {
    let log = frame::encode(MSG_LOG, DOUBLE_SENDER_ID, b"\x06tracking satellites");

    if double.corrupt_frames {
        let mut corrupted = log.clone();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;
        sock.write_all(&corrupted).await?;
    }

    sock.write_all(&log).await?;

    if double.stream_unknown {
        let unknown = frame::encode(0x7777, DOUBLE_SENDER_ID, &[0xDE, 0xAD]);
        sock.write_all(&unknown).await?;
    }

    Ok(())
}

async fn respond(
    double: &ReceiverDouble,
    frame: &Frame,
    store: &mut HashMap<(String, String), String>,
    sock: &mut TcpStream,
) -> std::io::Result<()> {
    match frame.msg_type {
        MSG_SETTINGS_WRITE => {
            let Some([section, key, value]) = fields(&frame.payload) else {
                return Ok(());
            };
            if !double.respond_writes {
                return Ok(());
            }

            if double.write_status == 0 {
                let stored = if double.corrupt_store {
                    format!("{}*", value)
                } else {
                    value.clone()
                };
                store.insert((section.clone(), key.clone()), stored);
            }

            let mut payload = vec![double.write_status];
            payload.extend(setting_payload(&[&section, &key, &value]));
            sock.write_all(&frame::encode(
                MSG_SETTINGS_WRITE_RESP,
                DOUBLE_SENDER_ID,
                &payload,
            ))
            .await
        },

        MSG_SETTINGS_READ_REQ => {
            let Some([section, key, _]) = fields_padded(&frame.payload) else {
                return Ok(());
            };
            if !double.respond_reads {
                return Ok(());
            }

            let value = store
                .get(&(section.clone(), key.clone()))
                .cloned()
                .unwrap_or_default();

            sock.write_all(&frame::encode(
                MSG_SETTINGS_READ_RESP,
                DOUBLE_SENDER_ID,
                &setting_payload(&[&section, &key, &value]),
            ))
            .await
        },

        MSG_SETTINGS_SAVE => {
            if !double.respond_save {
                return Ok(());
            }
            sock.write_all(&frame::encode(
                MSG_SETTINGS_SAVE_RESP,
                DOUBLE_SENDER_ID,
                &[0],
            ))
            .await
        },

        MSG_SETTINGS_READ_BY_INDEX_REQ => {
            if frame.payload.len() < 2 {
                return Ok(());
            }
            let index = u16::from_le_bytes([frame.payload[0], frame.payload[1]]);

            let mut entries: Vec<_> = store.iter().collect();
            entries.sort();

            match entries.get(index as usize) {
                Some(((section, key), value)) => {
                    let mut payload = index.to_le_bytes().to_vec();
                    payload.extend(setting_payload(&[section, key, value]));
                    sock.write_all(&frame::encode(
                        MSG_SETTINGS_READ_BY_INDEX_RESP,
                        DOUBLE_SENDER_ID,
                        &payload,
                    ))
                    .await
                },
                None => {
                    sock.write_all(&frame::encode(
                        MSG_SETTINGS_READ_BY_INDEX_DONE,
                        DOUBLE_SENDER_ID,
                        &[],
                    ))
                    .await
                },
            }
        },

        _ => Ok(()),
    }
}

fn fields(payload: &[u8]) -> Option<[String; 3]> {
    let text = std::str::from_utf8(payload).ok()?;
    let mut parts = text.split('\0');
    Some([
        parts.next()?.to_string(),
        parts.next()?.to_string(),
        parts.next()?.to_string(),
    ])
}

/// Like [fields], but tolerates two-field payloads (read requests).
fn fields_padded(payload: &[u8]) -> Option<[String; 3]> {
    let text = std::str::from_utf8(payload).ok()?;
    let mut parts = text.split('\0');
    Some([
        parts.next()?.to_string(),
        parts.next()?.to_string(),
        parts.next().unwrap_or_default().to_string(),
    ])
}

fn setting_payload(fields: &[&str]) -> Vec<u8> {
    let mut payload = Vec::new();
    for field in fields {
        payload.extend_from_slice(field.as_bytes());
        payload.push(0);
    }
    payload
}
