use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    sbp::message::{
        self, MSG_SETTINGS_READ_BY_INDEX_DONE, MSG_SETTINGS_READ_BY_INDEX_RESP,
        MSG_SETTINGS_READ_RESP, MSG_SETTINGS_SAVE_RESP, MSG_SETTINGS_WRITE_RESP,
    },
    sbp::Message,
    session::{Filter, Session, Subscription, TransportError},
};

#[derive(Debug, Error)]
pub enum SettingsError {
    /// The retry budget ran out without a matching response.
    #[error("no response for {section}.{key} after {attempts} attempts")]
    Timeout {
        section: String,
        key: String,
        attempts: usize,
    },

    /// Explicit negative response from the receiver. Never retried.
    #[error("receiver rejected {section}.{key} (status {status})")]
    Rejected {
        section: String,
        key: String,
        status: u8,
    },

    /// A write acknowledged fine but read back a different value.
    #[error("read-back of {section}.{key} returned {got:?}, expected {want:?}")]
    VerificationMismatch {
        section: String,
        key: String,
        want: String,
        got: String,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Written,
    Verified,
    Saved,
    Failed,
}

/// One setting on its way to the receiver.
#[derive(Debug, Clone)]
pub struct SettingsEntry {
    pub section: String,
    pub key: String,
    pub value: String,
    pub status: EntryStatus,
}

impl SettingsEntry {
    pub fn new(section: &str, key: &str, value: &str) -> Self {
        Self {
            section: section.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            status: EntryStatus::Pending,
        }
    }
}

/// Request/response client for the receiver's settings store.
///
/// Operations are strictly sequential: one outstanding request at a time,
/// so a read that follows a write is a meaningful verification. Unrelated
/// inbound traffic arriving while a response is pending is skipped, not
/// treated as a protocol violation.
pub struct SettingsClient<'s> {
    session: &'s mut Session,
    rx: Subscription,
    timeout: Duration,
    retries: usize,
}

impl<'s> SettingsClient<'s> {
    pub fn new(session: &'s mut Session, timeout: Duration, retries: usize) -> Self {
        let rx = session.subscribe(Filter::Types(&[
            MSG_SETTINGS_READ_RESP,
            MSG_SETTINGS_WRITE_RESP,
            MSG_SETTINGS_READ_BY_INDEX_RESP,
            MSG_SETTINGS_READ_BY_INDEX_DONE,
            MSG_SETTINGS_SAVE_RESP,
        ]));

        Self {
            session,
            rx,
            timeout,
            retries,
        }
    }

    /// Reads one value by name.
    pub async fn read(&mut self, section: &str, key: &str) -> Result<String, SettingsError> {
        let request = message::settings_read_req(section, key);

        for attempt in 1..=self.retries {
            self.session.send(&request).await?;

            let response = self
                .await_response(|msg| match msg {
                    Message::SettingsReadResp {
                        section: s,
                        key: k,
                        value,
                    } if s == section && k == key => Some(value.clone()),
                    _ => None,
                })
                .await?;

            match response {
                Some(value) => return Ok(value),
                None => warn!(
                    "read {}.{}: no response (attempt {}/{})",
                    section, key, attempt, self.retries
                ),
            }
        }

        Err(SettingsError::Timeout {
            section: section.to_string(),
            key: key.to_string(),
            attempts: self.retries,
        })
    }

    /// Writes one value. A send that goes unanswered is retried; an
    /// explicit rejection is final. Success here only means the receiver
    /// acknowledged the write into volatile memory; callers wanting proof
    /// use [SettingsClient::write_verified].
    pub async fn write(
        &mut self,
        section: &str,
        key: &str,
        value: &str,
    ) -> Result<(), SettingsError> {
        let request = message::settings_write(section, key, value);

        for attempt in 1..=self.retries {
            self.session.send(&request).await?;

            let response = self
                .await_response(|msg| match msg {
                    Message::SettingsWriteResp {
                        status,
                        section: s,
                        key: k,
                        ..
                    } if s == section && k == key => Some(*status),
                    _ => None,
                })
                .await?;

            match response {
                Some(0) => {
                    debug!("write {}.{} = {:?} acknowledged", section, key, value);
                    return Ok(());
                },
                Some(status) => {
                    return Err(SettingsError::Rejected {
                        section: section.to_string(),
                        key: key.to_string(),
                        status,
                    });
                },
                None => warn!(
                    "write {}.{}: no response (attempt {}/{})",
                    section, key, attempt, self.retries
                ),
            }
        }

        Err(SettingsError::Timeout {
            section: section.to_string(),
            key: key.to_string(),
            attempts: self.retries,
        })
    }

    /// Write followed by a read-back comparison. A mismatch burns one
    /// attempt of the same bounded budget; a clean match marks the entry
    /// verified.
    pub async fn write_verified(&mut self, entry: &mut SettingsEntry) -> Result<(), SettingsError> {
        let mut last_got = String::new();

        for attempt in 1..=self.retries {
            if let Err(e) = self.write(&entry.section, &entry.key, &entry.value).await {
                entry.status = EntryStatus::Failed;
                return Err(e);
            }
            entry.status = EntryStatus::Written;

            let got = match self.read(&entry.section, &entry.key).await {
                Ok(got) => got,
                Err(e) => {
                    entry.status = EntryStatus::Failed;
                    return Err(e);
                },
            };

            if got == entry.value {
                entry.status = EntryStatus::Verified;
                info!("{}.{} = {:?} verified", entry.section, entry.key, got);
                return Ok(());
            }

            warn!(
                "{}.{} read back {:?}, expected {:?} (attempt {}/{})",
                entry.section, entry.key, got, entry.value, attempt, self.retries
            );
            last_got = got;
        }

        entry.status = EntryStatus::Failed;
        Err(SettingsError::VerificationMismatch {
            section: entry.section.clone(),
            key: entry.key.clone(),
            want: entry.value.clone(),
            got: last_got,
        })
    }

    /// Commits every written value to persistent storage. Until this
    /// succeeds the receiver would revert on reset.
    pub async fn save(&mut self) -> Result<(), SettingsError> {
        let request = message::settings_save();

        for attempt in 1..=self.retries {
            self.session.send(&request).await?;

            let response = self
                .await_response(|msg| match msg {
                    Message::SettingsSaveResp { status } => Some(*status),
                    _ => None,
                })
                .await?;

            match response {
                Some(0) => {
                    info!("settings committed to persistent storage");
                    return Ok(());
                },
                Some(status) => {
                    return Err(SettingsError::Rejected {
                        section: "settings".to_string(),
                        key: "save".to_string(),
                        status,
                    });
                },
                None => warn!("save: no response (attempt {}/{})", attempt, self.retries),
            }
        }

        Err(SettingsError::Timeout {
            section: "settings".to_string(),
            key: "save".to_string(),
            attempts: self.retries,
        })
    }

    /// Walks the settings store by index. Diagnostic surface; the survey
    /// workflow itself only reads back the keys it wrote.
    pub async fn enumerate(&mut self) -> Result<Vec<SettingsEntry>, SettingsError> {
        let mut entries = Vec::new();
        let mut index: u16 = 0;

        loop {
            let request = message::settings_read_by_index_req(index);
            let mut response = None;

            for attempt in 1..=self.retries {
                self.session.send(&request).await?;

                response = self
                    .await_response(|msg| match msg {
                        Message::SettingsReadByIndexResp {
                            index: i,
                            section,
                            key,
                            value,
                        } if *i == index => {
                            Some(Some(SettingsEntry::new(section, key, value)))
                        },
                        Message::SettingsReadByIndexDone => Some(None),
                        _ => None,
                    })
                    .await?;

                if response.is_some() {
                    break;
                }
                warn!(
                    "enumerate index {}: no response (attempt {}/{})",
                    index, attempt, self.retries
                );
            }

            match response {
                Some(Some(entry)) => {
                    entries.push(entry);
                    index += 1;
                },
                Some(None) => return Ok(entries),
                None => {
                    return Err(SettingsError::Timeout {
                        section: "settings".to_string(),
                        key: format!("index {}", index),
                        attempts: self.retries,
                    });
                },
            }
        }
    }

    /// Waits one timeout window for a response `matcher` accepts,
    /// discarding unrelated inbound messages. `Ok(None)` is a timeout for
    /// this attempt.
    async fn await_response<T>(
        &mut self,
        mut matcher: impl FnMut(&Message) -> Option<T>,
    ) -> Result<Option<T>, SettingsError> {
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(SettingsError::Transport(TransportError::Closed)),
                Ok(Some(record)) => {
                    if let Some(found) = matcher(&record.message) {
                        return Ok(Some(found));
                    }
                },
            }
        }
    }
}
