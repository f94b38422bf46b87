use std::fmt;
use std::io;
use std::path::PathBuf;

use log::{debug, error, info};
use thiserror::Error;
use tokio::sync::watch;

use crate::{
    config::Config,
    recorder::{self, CaptureError, CaptureLog, Sink},
    report::{self, GeodeticPosition, ParseError},
    service::{ProcessingService, ServiceError},
    session::{Session, TransportError},
    settings::{EntryStatus, SettingsClient, SettingsEntry, SettingsError},
};

/// Workflow stages, in order. A failed run reports the stage it was
/// establishing when it died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    SessionOpen,
    Capturing,
    AwaitingExternalReport,
    Parsed,
    WritingSettings,
    Verified,
    Saved,
    Closed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::SessionOpen => "session-open",
            Self::Capturing => "capturing",
            Self::AwaitingExternalReport => "awaiting-external-report",
            Self::Parsed => "parsed",
            Self::WritingSettings => "writing-settings",
            Self::Verified => "verified",
            Self::Saved => "saved",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("failed to read existing solution report {path}: {source}")]
    ReportFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
#[error("run failed during {stage} stage: {source}")]
pub struct RunError {
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

/// Sequences one survey-in run:
/// open session, capture, hand off to the external service, parse the
/// report, write-verify the surveyed position, save, close. Any stage
/// failure aborts the rest; the session is released on every path.
pub struct Runtime<S> {
    config: Config,
    service: S,
    shutdown: watch::Receiver<bool>,
    stage: Stage,
    session: Option<Session>,
}

impl<S: ProcessingService> Runtime<S> {
    pub fn new(config: Config, service: S, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            config,
            service,
            shutdown,
            stage: Stage::Idle,
            session: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub async fn run(&mut self) -> Result<(), RunError> {
        let result = self.run_to_saved().await;

        // release on every path, close is idempotent
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.stage = Stage::Closed;

        match &result {
            Ok(()) => info!("run complete, surveyed position saved"),
            Err(e) => error!("aborting remaining stages: {}", e),
        }

        result
    }

    async fn run_to_saved(&mut self) -> Result<(), RunError> {
        let text = self.obtain_report().await?;

        self.enter(Stage::Parsed);
        let position = report::parse(&text).map_err(|e| self.fail(e))?;
        info!(
            "surveyed position: lat {} lon {} alt {} m",
            position.latitude, position.longitude, position.altitude
        );

        self.write_back(&position).await
    }

    /// Produces the solution report text, re-entering a partial run where
    /// possible: an existing report skips capture and hand-off entirely,
    /// an existing capture log skips only the capture window.
    async fn obtain_report(&mut self) -> Result<String, RunError> {
        if let Some(path) = self.config.report_path.clone() {
            if path.exists() {
                info!("using existing solution report {}", path.display());
                self.enter(Stage::AwaitingExternalReport);
                return std::fs::read_to_string(&path)
                    .map_err(|source| self.fail(StageError::ReportFile { path, source }));
            }
        }

        let capture = self.obtain_capture().await?;

        self.enter(Stage::AwaitingExternalReport);
        let handle = self.service.submit(&capture).map_err(|e| self.fail(e))?;

        let text = self.service.await_report(&handle).await;
        text.map_err(|e| self.fail(e))
    }

    async fn obtain_capture(&mut self) -> Result<CaptureLog, RunError> {
        if let Some(path) = &self.config.capture_path {
            if path.exists() {
                info!("using existing capture log {}", path.display());
                return Ok(CaptureLog {
                    path: path.clone(),
                    records: 0,
                });
            }
        }

        self.open_session().await?;

        self.enter(Stage::Capturing);
        let sink = Sink::create(self.config.prefix.as_deref(), self.config.gzip)
            .map_err(|e| self.fail(CaptureError::SinkFailure(e)))?;

        let session = self
            .session
            .as_ref()
            .expect("session opened for this stage");

        let result = recorder::record(
            session,
            sink,
            self.config.capture_duration,
            &mut self.shutdown,
        )
        .await;

        result.map_err(|e| self.fail(e))
    }

    async fn open_session(&mut self) -> Result<(), RunError> {
        if self.session.is_some() {
            return Ok(());
        }

        self.enter(Stage::SessionOpen);
        let session = Session::open(&self.config.host, self.config.port)
            .await
            .map_err(|e| self.fail(e))?;
        self.session = Some(session);

        Ok(())
    }

    /// Settings write-verify-save. Never skipped once a position exists.
    async fn write_back(&mut self, position: &GeodeticPosition) -> Result<(), RunError> {
        self.open_session().await?;
        self.enter(Stage::WritingSettings);

        let timeout = self.config.request_timeout;
        let retries = self.config.retries;

        let mut entries = vec![
            SettingsEntry::new("surveyed_position", "broadcast", "True"),
            SettingsEntry::new("surveyed_position", "surveyed_lat", &position.latitude),
            SettingsEntry::new("surveyed_position", "surveyed_lon", &position.longitude),
            SettingsEntry::new("surveyed_position", "surveyed_alt", &position.altitude),
        ];

        {
            let session = self
                .session
                .as_mut()
                .expect("session opened for this stage");
            let mut client = SettingsClient::new(session, timeout, retries);

            for entry in entries.iter_mut() {
                client
                    .write_verified(entry)
                    .await
                    .map_err(|source| RunError {
                        stage: Stage::WritingSettings,
                        source: source.into(),
                    })?;
            }
        }

        self.enter(Stage::Verified);

        {
            let session = self
                .session
                .as_mut()
                .expect("session opened for this stage");
            let mut client = SettingsClient::new(session, timeout, retries);

            client.save().await.map_err(|source| RunError {
                stage: Stage::Verified,
                source: source.into(),
            })?;
        }

        for entry in entries.iter_mut() {
            entry.status = EntryStatus::Saved;
        }

        self.enter(Stage::Saved);
        Ok(())
    }

    fn enter(&mut self, stage: Stage) {
        debug!("stage {} -> {}", self.stage, stage);
        self.stage = stage;
    }

    fn fail<E: Into<StageError>>(&self, source: E) -> RunError {
        RunError {
            stage: self.stage,
            source: source.into(),
        }
    }
}
