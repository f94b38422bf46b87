use std::{
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    str::FromStr,
    time::{Duration, Instant},
};

use hifitime::{
    efmt::Format,
    prelude::{Epoch, Formatter},
};

use log::{info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::{
    sbp::Message,
    session::{Filter, Record, Session},
};

mod fd;

use fd::FileDescriptor;

/// Wall-clock check granularity of the capture window. Bounds overshoot:
/// the window closes within one tick of the configured duration.
pub const POLL_GRANULARITY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum CaptureError {
    /// Already-written records stay on disk, but the capture is not a
    /// success.
    #[error("capture sink failure: {0}")]
    SinkFailure(#[from] io::Error),

    #[error("capture cancelled after {elapsed:?} ({records} records kept)")]
    Cancelled { elapsed: Duration, records: u64 },

    /// Inbound records were lost to a full subscription backlog, so the
    /// log is thinner than the stream. The window ran to completion but
    /// the capture is not a success.
    #[error("capture overran: {dropped} inbound records lost to backlog")]
    Overrun { dropped: u64 },

    #[error("session terminated mid-capture")]
    Disconnected,
}

/// The durable result of a capture window: what gets handed to the
/// external processing service.
#[derive(Debug, Clone)]
pub struct CaptureLog {
    pub path: PathBuf,
    pub records: u64,
}

#[derive(Serialize)]
struct LogRecord<'a> {
    t: String,
    #[serde(flatten)]
    msg: &'a Message,
}

/// Append-only JSON-lines capture sink.
pub struct Sink {
    writer: Option<BufWriter<FileDescriptor>>,
    path: PathBuf,
}

impl Sink {
    /// Creates `gnss-%Y%m%d-%H%M%S.sbp.json[.gz]` under `prefix`.
    pub fn create(prefix: Option<&Path>, gzip: bool) -> io::Result<Self> {
        let now = Epoch::now().map_err(io::Error::other)?;
        let path = match prefix {
            Some(dir) => dir.join(filename(now, gzip)),
            None => PathBuf::from(filename(now, gzip)),
        };

        let fd = FileDescriptor::create(&path, gzip)?;

        Ok(Self {
            writer: Some(BufWriter::new(fd)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one complete record line. A partial line is never left
    /// behind: the record is serialized in full before any byte is
    /// committed past the buffered writer.
    fn append(&mut self, record: &Record) -> io::Result<()> {
        let writer = self.writer.as_mut().ok_or_else(already_finished)?;

        let line = serde_json::to_vec(&LogRecord {
            t: record.t.to_string(),
            msg: &record.message,
        })
        .map_err(io::Error::other)?;

        writer.write_all(&line)?;
        writer.write_all(b"\n")
    }

    fn finish(&mut self) -> io::Result<()> {
        let writer = self.writer.take().ok_or_else(already_finished)?;
        writer
            .into_inner()
            .map_err(|e| e.into_error())?
            .finish()
    }
}

fn already_finished() -> io::Error {
    io::Error::other("capture sink already finished")
}

fn filename(t: Epoch, gzip: bool) -> String {
    let date = Formatter::new(t, Format::from_str("%Y%m%d").unwrap());
    let time = Formatter::new(t, Format::from_str("%H%M%S").unwrap());

    let mut name = format!("gnss-{}-{}.sbp.json", date, time);
    if gzip {
        name.push_str(".gz");
    }
    name
}

/// Records every inbound message to `sink` for `duration`, measured on the
/// monotonic clock (a wall-clock jump mid-window changes nothing).
///
/// On the shutdown signal the capture stops early: the log keeps every
/// record written so far, all of them complete lines, and the result is
/// [CaptureError::Cancelled].
pub async fn record(
    session: &Session,
    mut sink: Sink,
    duration: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<CaptureLog, CaptureError> {
    let mut rx = session.subscribe(Filter::All);

    let started = Instant::now();
    let mut records: u64 = 0;

    info!(
        "capture window open for {:?}, streaming to {}",
        duration,
        sink.path().display()
    );

    let mut tick = tokio::time::interval(POLL_GRANULARITY);

    while started.elapsed() < duration {
        tokio::select! {
            _ = tick.tick() => {},

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    warn!("capture aborted by shutdown signal");
                    drop(rx);
                    sink.finish()?;
                    return Err(CaptureError::Cancelled {
                        elapsed: started.elapsed(),
                        records,
                    });
                }
            },

            received = rx.recv() => match received {
                Some(record) => {
                    sink.append(&record)?;
                    records += 1;
                },
                None => {
                    let _ = sink.finish();
                    return Err(CaptureError::Disconnected);
                },
            },
        }
    }

    let dropped = rx.dropped();
    drop(rx);
    sink.finish()?;

    if dropped > 0 {
        return Err(CaptureError::Overrun { dropped });
    }

    info!(
        "capture window closed after {:?}, {} records in {}",
        started.elapsed(),
        records,
        sink.path().display()
    );

    Ok(CaptureLog {
        path: sink.path,
        records,
    })
}
