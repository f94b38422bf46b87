use std::{
    io,
    path::PathBuf,
    process::Command,
    time::{Duration, Instant},
};

use log::{info, warn};
use thiserror::Error;

use crate::{config::Config, recorder::CaptureLog};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to launch sbp2rinex: {0}")]
    ConversionLaunch(#[source] io::Error),

    #[error("sbp2rinex conversion failed with status {status}")]
    ConversionFailed { status: i32 },

    #[error("no solution report appeared at {path} within {waited:?}")]
    ReportTimeout { path: String, waited: Duration },

    #[error("failed to read solution report {path}: {source}")]
    ReportRead {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Ticket for a submitted capture: where the report will materialize.
#[derive(Debug, Clone)]
pub struct ReportHandle {
    pub drop_path: PathBuf,
}

/// The external post-processing boundary. The survey workflow only ever
/// talks through this trait, so driving a browser, polling an inbox or a
/// future direct API are all drop-in replacements.
pub trait ProcessingService {
    /// Converts and hands off a capture, returning where to look for the
    /// eventual report.
    fn submit(&self, capture: &CaptureLog) -> Result<ReportHandle, ServiceError>;

    /// Blocks (with polling) until the report exists, and returns its
    /// text.
    async fn await_report(&self, handle: &ReportHandle) -> Result<String, ServiceError>;
}

/// OPUS via operator hand-off: converts the capture with the `sbp2rinex`
/// command-line tool, prints the upload recipe, and waits for the e-mailed
/// solution report to be dropped at a known path.
pub struct OpusDropBox {
    drop_path: PathBuf,
    deadline: Duration,
    poll: Duration,
    antenna_height: f64,
    email: Option<String>,
}

impl OpusDropBox {
    pub fn new(config: &Config) -> Self {
        Self {
            drop_path: config.report_drop_path(),
            deadline: config.report_deadline,
            poll: Duration::from_secs(2),
            antenna_height: config.antenna_height,
            email: config.email.clone(),
        }
    }
}

impl ProcessingService for OpusDropBox {
    fn submit(&self, capture: &CaptureLog) -> Result<ReportHandle, ServiceError> {
        let status = Command::new("sbp2rinex")
            .arg("-v")
            .arg("2.11")
            .arg(&capture.path)
            .status()
            .map_err(ServiceError::ConversionLaunch)?;

        if !status.success() {
            return Err(ServiceError::ConversionFailed {
                status: status.code().unwrap_or(-1),
            });
        }

        // sbp2rinex appends its own extension
        let observation_file = format!("{}.obs", capture.path.display());

        info!(
            "upload {} to https://www.ngs.noaa.gov/OPUS/ as a static solution, antenna height {} m",
            observation_file, self.antenna_height
        );
        match &self.email {
            Some(email) => info!("the solution report will be mailed to {}", email),
            None => warn!("no notification address configured; watch the OPUS page"),
        }
        info!(
            "drop the e-mailed solution report at {}",
            self.drop_path.display()
        );

        Ok(ReportHandle {
            drop_path: self.drop_path.clone(),
        })
    }

    async fn await_report(&self, handle: &ReportHandle) -> Result<String, ServiceError> {
        let started = Instant::now();

        loop {
            if handle.drop_path.exists() {
                return std::fs::read_to_string(&handle.drop_path).map_err(|source| {
                    ServiceError::ReportRead {
                        path: handle.drop_path.display().to_string(),
                        source,
                    }
                });
            }

            if started.elapsed() >= self.deadline {
                return Err(ServiceError::ReportTimeout {
                    path: handle.drop_path.display().to_string(),
                    waited: started.elapsed(),
                });
            }

            tokio::time::sleep(self.poll).await;
        }
    }
}
