use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use hifitime::Epoch;
use log::{debug, error, info, warn};
use thiserror::Error;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::sbp::{Frame, Framer, FramingError, Message};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: io::Error,
    },

    #[error("transport write failed: {0}")]
    Io(#[from] io::Error),

    #[error("session already closed")]
    Closed,
}

/// What a subscriber wants delivered.
pub enum Filter<'a> {
    /// Only these message types.
    Types(&'a [u16]),
    /// Every inbound message.
    All,
    /// Only messages whose type nothing in this program recognizes.
    Unrecognized,
}

/// One delivered message with its receive timestamp.
#[derive(Debug, Clone)]
pub struct Record {
    pub t: Epoch,
    pub message: Message,
}

struct Subscriber {
    tx: mpsc::Sender<Record>,
    dropped: Arc<AtomicU64>,
}

#[derive(Default)]
struct Registry {
    by_type: HashMap<u16, Vec<Subscriber>>,
    all: Vec<Subscriber>,
    unrecognized: Vec<Subscriber>,
    errors: Vec<mpsc::Sender<Arc<FramingError>>>,
}

impl Registry {
    fn dispatch(&mut self, record: Record) {
        let msg_type = record.message.msg_type();
        let recognized = record.message.is_recognized();

        offer(&mut self.all, &record);

        if let Some(subscribers) = self.by_type.get_mut(&msg_type) {
            offer(subscribers, &record);
        }

        if !recognized {
            offer(&mut self.unrecognized, &record);
        }
    }

    fn dispatch_error(&mut self, e: FramingError) {
        let e = Arc::new(e);
        self.errors.retain(|tx| match tx.try_send(e.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn clear(&mut self) {
        self.by_type.clear();
        self.all.clear();
        self.unrecognized.clear();
        self.errors.clear();
    }
}

/// Lagging subscribers lose records rather than stalling dispatch for
/// everyone; every loss is counted on the subscription so the consumer
/// can tell a complete stream from a thinned one. Disconnected
/// subscribers are dropped from the registry.
fn offer(subscribers: &mut Vec<Subscriber>, record: &Record) {
    subscribers.retain(|sub| match sub.tx.try_send(record.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            sub.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                "subscriber backlog full, dropped message {:#06x}",
                record.message.msg_type()
            );
            true
        },
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

/// Receiving end of a [Session::subscribe] registration.
pub struct Subscription {
    rx: mpsc::Receiver<Record>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Record> {
        self.rx.recv().await
    }

    /// Records lost to a full backlog since the subscription was made.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Connection to the receiver: owns the transport, decodes the inbound
/// stream and fans messages out to subscribers from a background task.
///
/// [Session::close] is idempotent and also runs on drop, so the transport
/// is released on every exit path.
pub struct Session {
    registry: Arc<Mutex<Registry>>,
    writer: OwnedWriteHalf,
    reader: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    endpoint: String,
    closed: bool,
}

impl Session {
    pub async fn open(host: &str, port: u16) -> Result<Self, TransportError> {
        let endpoint = format!("{}:{}", host, port);

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| TransportError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;

        let _ = stream.set_nodelay(true);
        let (read_half, writer) = stream.into_split();

        let registry = Arc::new(Mutex::new(Registry::default()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let reader = tokio::spawn(read_loop(read_half, registry.clone(), shutdown_rx));

        info!("session open to {}", endpoint);

        Ok(Self {
            registry,
            writer,
            reader: Some(reader),
            shutdown,
            endpoint,
            closed: false,
        })
    }

    /// Registers a subscriber; delivery starts with the next inbound
    /// message. The channel is bounded; overflow is counted on the
    /// returned [Subscription] (see [offer]).
    pub fn subscribe(&self, filter: Filter<'_>) -> Subscription {
        let (tx, rx) = mpsc::channel(128);
        let dropped = Arc::new(AtomicU64::new(0));

        let subscriber = |tx| Subscriber {
            tx,
            dropped: dropped.clone(),
        };

        let mut registry = self.registry.lock().expect("session registry poisoned");
        match filter {
            Filter::Types(types) => {
                for msg_type in types {
                    registry
                        .by_type
                        .entry(*msg_type)
                        .or_default()
                        .push(subscriber(tx.clone()));
                }
            },
            Filter::All => registry.all.push(subscriber(tx)),
            Filter::Unrecognized => registry.unrecognized.push(subscriber(tx)),
        }

        Subscription { rx, dropped }
    }

    /// Framing errors are always logged; this channel additionally hands
    /// them to a caller that wants to count or inspect them.
    pub fn subscribe_errors(&self) -> mpsc::Receiver<Arc<FramingError>> {
        let (tx, rx) = mpsc::channel(128);
        self.registry
            .lock()
            .expect("session registry poisoned")
            .errors
            .push(tx);
        rx
    }

    /// Writes one encoded frame to the receiver.
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.writer.write_all(frame).await?;
        Ok(())
    }

    /// Stops the reader task and releases the transport. Safe to call more
    /// than once; subscribers observe end-of-stream.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let _ = self.shutdown.send(true);
        if let Some(handle) = self.reader.take() {
            handle.abort();
        }
        self.registry
            .lock()
            .expect("session registry poisoned")
            .clear();

        info!("session to {} closed", self.endpoint);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(
    mut half: OwnedReadHalf,
    registry: Arc<Mutex<Registry>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut framer = Framer::new();
    let mut buf = [0u8; 8192];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            read = half.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("receiver closed the stream");
                    break;
                },
                Ok(n) => {
                    framer.consume(&buf[..n]);
                    drain_frames(&mut framer, &registry);
                },
                Err(e) => {
                    error!("session read failed: {}", e);
                    break;
                },
            },
        }
    }

    // subscribers see their channels close
    registry.lock().expect("session registry poisoned").clear();
}

fn drain_frames(framer: &mut Framer, registry: &Arc<Mutex<Registry>>) {
    while let Some(item) = framer.poll() {
        let decoded = item.and_then(|frame: Frame| Message::decode(&frame));

        match decoded {
            Ok(message) => {
                let record = Record {
                    t: Epoch::now().unwrap_or_default(),
                    message,
                };
                registry
                    .lock()
                    .expect("session registry poisoned")
                    .dispatch(record);
            },
            Err(e) => {
                warn!("framing error, frame skipped: {}", e);
                registry
                    .lock()
                    .expect("session registry poisoned")
                    .dispatch_error(e);
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Filter, Session, TransportError};
    use crate::sbp::message::{MSG_LOG, MSG_OBS};
    use crate::sbp::Message;
    use crate::testutil::ReceiverDouble;
    use std::time::Duration;

    #[tokio::test]
    async fn typed_subscription_sees_only_its_type() {
        let addr = ReceiverDouble {
            stream_period: Some(Duration::from_millis(10)),
            stream_unknown: true,
            ..ReceiverDouble::default()
        }
        .spawn()
        .await;

        let session = Session::open(&addr.ip().to_string(), addr.port())
            .await
            .unwrap();

        let mut logs = session.subscribe(Filter::Types(&[MSG_LOG]));
        let mut obs = session.subscribe(Filter::Types(&[MSG_OBS]));
        let mut unknown = session.subscribe(Filter::Unrecognized);

        let record = tokio::time::timeout(Duration::from_secs(2), logs.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(record.message, Message::Log { .. }));

        let record = tokio::time::timeout(Duration::from_secs(2), unknown.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!record.message.is_recognized());

        // the OBS subscription stays silent, the double streams no OBS
        assert!(
            tokio::time::timeout(Duration::from_millis(100), obs.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn framing_errors_reach_the_error_channel() {
        let addr = ReceiverDouble {
            stream_period: Some(Duration::from_millis(10)),
            corrupt_frames: true,
            ..ReceiverDouble::default()
        }
        .spawn()
        .await;

        let session = Session::open(&addr.ip().to_string(), addr.port())
            .await
            .unwrap();

        let mut errors = session.subscribe_errors();
        let mut logs = session.subscribe(Filter::Types(&[MSG_LOG]));

        let e = tokio::time::timeout(Duration::from_secs(2), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(e.to_string().contains("CRC"));

        // dispatch survived the bad frame
        assert!(
            tokio::time::timeout(Duration::from_secs(2), logs.recv())
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn backlog_overflow_is_counted_not_silent() {
        use super::{offer, Record, Subscriber};
        use hifitime::Epoch;
        use std::sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        };
        use tokio::sync::mpsc;

        // capacity-1 channel stands in for a stalled consumer
        let (tx, mut rx) = mpsc::channel(1);
        let dropped = Arc::new(AtomicU64::new(0));
        let mut subscribers = vec![Subscriber {
            tx,
            dropped: dropped.clone(),
        }];

        let record = Record {
            t: Epoch::from_tai_seconds(0.0),
            message: Message::SettingsReadByIndexDone,
        };

        offer(&mut subscribers, &record);
        offer(&mut subscribers, &record);
        offer(&mut subscribers, &record);

        assert_eq!(dropped.load(Ordering::Relaxed), 2);
        // the lagging subscriber stays registered
        assert_eq!(subscribers.len(), 1);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_send_fails_after() {
        let addr = ReceiverDouble::default().spawn().await;

        let mut session = Session::open(&addr.ip().to_string(), addr.port())
            .await
            .unwrap();
        let mut all = session.subscribe(Filter::All);

        session.close();
        session.close();

        assert!(matches!(
            session.send(&[0x55]).await,
            Err(TransportError::Closed)
        ));

        // subscriber channel ends
        assert!(all.recv().await.is_none());
    }
}
