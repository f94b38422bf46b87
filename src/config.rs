use std::{path::PathBuf, time::Duration};

/// Everything a run needs, resolved once by the CLI layer and handed to
/// the runtime by value. No process-wide mutable state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base station address.
    pub host: String,
    pub port: u16,

    /// Capture window length.
    pub capture_duration: Duration,

    /// Per-request settings protocol timeout.
    pub request_timeout: Duration,

    /// Attempts per settings request (timeouts and verification
    /// mismatches share this budget).
    pub retries: usize,

    /// Antenna height above the mark, meters. Forwarded to the
    /// post-processing submission.
    pub antenna_height: f64,

    /// Address the processing service mails the report to.
    pub email: Option<String>,

    /// Directory for the capture log and report drop box.
    pub prefix: Option<PathBuf>,

    /// Gzip the capture log.
    pub gzip: bool,

    /// Re-entrancy: an existing capture log to reuse instead of opening a
    /// fresh window.
    pub capture_path: Option<PathBuf>,

    /// Where the solution report is (or will be) dropped. If the file
    /// already exists the run skips straight to parsing.
    pub report_path: Option<PathBuf>,

    /// How long to wait for the external service's report.
    pub report_deadline: Duration,
}

impl Config {
    pub fn report_drop_path(&self) -> PathBuf {
        match &self.report_path {
            Some(path) => path.clone(),
            None => match &self.prefix {
                Some(dir) => dir.join("opus-report.txt"),
                None => PathBuf::from("opus-report.txt"),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "192.168.0.222".to_string(),
            port: 55555,
            capture_duration: Duration::from_secs(7200),
            request_timeout: Duration::from_millis(500),
            retries: 3,
            antenna_height: 1.35,
            email: None,
            prefix: None,
            gzip: false,
            capture_path: None,
            report_path: None,
            report_deadline: Duration::from_secs(3600),
        }
    }
}
