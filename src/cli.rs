use clap::{value_parser, Arg, ArgAction, ArgMatches, ColorChoice, Command};

use std::{path::PathBuf, time::Duration};

use crate::config::Config;

pub struct Cli {
    /// Arguments passed by user
    matches: ArgMatches,
}

fn command() -> Command {
    Command::new("sbp-survey")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Automated survey-in for an SBP GNSS base station")
        .color(ColorChoice::Always)
        .next_help_heading("Base station (TCP)")
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .default_value("192.168.0.222")
                .help("Base station address."),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .default_value("55555")
                .help("Base station TCP port."),
        )
        .next_help_heading("Capture window")
        .arg(
            Arg::new("duration")
                .long("duration")
                .short('d')
                .value_name("SECONDS")
                .value_parser(value_parser!(u64))
                .default_value("7200")
                .help("Capture window length. OPUS static solutions want at least two hours."),
        )
        .arg(
            Arg::new("prefix")
                .long("prefix")
                .value_name("DIR")
                .help("Directory for the capture log and the report drop box. Default is the working directory."),
        )
        .arg(
            Arg::new("gzip")
                .long("gzip")
                .action(ArgAction::SetTrue)
                .help("Gzip-compress the capture log."),
        )
        .next_help_heading("Post processing (OPUS)")
        .arg(
            Arg::new("height")
                .long("height")
                .value_name("METERS")
                .value_parser(value_parser!(f64))
                .default_value("1.35")
                .help("Antenna height above the mark, forwarded with the upload."),
        )
        .arg(
            Arg::new("email")
                .long("email")
                .value_name("ADDRESS")
                .help("Address OPUS mails the solution report to."),
        )
        .arg(
            Arg::new("report")
                .long("report")
                .value_name("FILE")
                .help("Where the solution report will be dropped. If the file
already exists, capture and upload are skipped and the run resumes from parsing."),
        )
        .arg(
            Arg::new("report-deadline")
                .long("report-deadline")
                .value_name("SECONDS")
                .value_parser(value_parser!(u64))
                .default_value("3600")
                .help("How long to wait for the solution report."),
        )
        .arg(
            Arg::new("capture-log")
                .long("capture-log")
                .value_name("FILE")
                .help("Reuse an existing capture log instead of opening a fresh window."),
        )
        .next_help_heading("Settings protocol")
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("MILLISECONDS")
                .value_parser(value_parser!(u64))
                .default_value("500")
                .help("Per-request response timeout."),
        )
        .arg(
            Arg::new("retries")
                .long("retries")
                .value_name("N")
                .value_parser(value_parser!(usize))
                .default_value("3")
                .help("Attempts per settings request before giving up."),
        )
}

impl Cli {
    /// Build new command line interface
    pub fn new() -> Self {
        Self {
            matches: command().get_matches(),
        }
    }

    pub fn config(&self) -> Config {
        let m = &self.matches;

        Config {
            host: m.get_one::<String>("host").cloned().unwrap_or_default(),
            port: m.get_one::<u16>("port").copied().unwrap_or_default(),
            capture_duration: Duration::from_secs(
                m.get_one::<u64>("duration").copied().unwrap_or_default(),
            ),
            request_timeout: Duration::from_millis(
                m.get_one::<u64>("timeout").copied().unwrap_or_default(),
            ),
            retries: m.get_one::<usize>("retries").copied().unwrap_or_default(),
            antenna_height: m.get_one::<f64>("height").copied().unwrap_or_default(),
            email: m.get_one::<String>("email").cloned(),
            prefix: m.get_one::<String>("prefix").map(PathBuf::from),
            gzip: m.get_flag("gzip"),
            capture_path: m.get_one::<String>("capture-log").map(PathBuf::from),
            report_path: m.get_one::<String>("report").map(PathBuf::from),
            report_deadline: Duration::from_secs(
                m.get_one::<u64>("report-deadline")
                    .copied()
                    .unwrap_or_default(),
            ),
        }
    }
}
