use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The report scanned clean but never produced this field. A position
    /// is never returned partially populated.
    #[error("required field \"{0}\" missing from solution report")]
    MissingField(&'static str),

    /// A line opened with a recognized marker but did not carry the
    /// expected fields.
    #[error("malformed report line: {0:?}")]
    Malformed(String),
}

/// Absolute position extracted from a solution report, as the
/// receiver-ready setting strings. The report's native field layout is
/// preserved end to end (receiver settings are string-typed); west
/// longitudes carry a leading minus sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeodeticPosition {
    pub latitude: String,
    pub longitude: String,
    pub altitude: String,
}

/// Parses the post-processing service's text report.
///
/// Recognized lines:
/// - `LAT:  <deg> <min> <sec.frac> ...`
/// - `W LON: <deg> <min> <sec.frac> ...` (west longitude, negated)
/// - `EL HGT: <value><unit> ...` (3-character unit suffix stripped)
///
/// Everything else is ignored. Fails closed: a short recognized line is
/// [ParseError::Malformed], a field never seen is
/// [ParseError::MissingField].
pub fn parse(report: &str) -> Result<GeodeticPosition, ParseError> {
    let mut latitude = None;
    let mut longitude = None;
    let mut altitude = None;

    for line in report.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();

        // a recognized marker with too few tokens must fail closed, so the
        // arms never index past the line
        match tokens.first().copied() {
            Some("LAT:") => latitude = Some(compose_angle(rest(&tokens, 1), line)?),
            Some("W") => longitude = Some(format!("-{}", compose_angle(rest(&tokens, 2), line)?)),
            Some("EL") => altitude = Some(strip_unit(rest(&tokens, 1), line)?),
            _ => {},
        }
    }

    Ok(GeodeticPosition {
        latitude: latitude.ok_or(ParseError::MissingField("latitude"))?,
        longitude: longitude.ok_or(ParseError::MissingField("longitude"))?,
        altitude: altitude.ok_or(ParseError::MissingField("altitude"))?,
    })
}

fn rest<'a, 'b>(tokens: &'a [&'b str], from: usize) -> &'a [&'b str] {
    tokens.get(from..).unwrap_or(&[])
}

/// Joins `<deg> <min> <sec.frac>` into the report's packed representation:
/// degrees, minutes, then the seconds value with its decimal point removed.
fn compose_angle(tokens: &[&str], line: &str) -> Result<String, ParseError> {
    let malformed = || ParseError::Malformed(line.to_string());

    let &[degrees, minutes, seconds] = tokens.get(..3).ok_or_else(malformed)? else {
        return Err(malformed());
    };

    let (whole, fraction) = seconds.split_once('.').ok_or_else(malformed)?;

    Ok(format!("{}{}{}{}", degrees, minutes, whole, fraction))
}

/// Height token with its 3-character unit suffix removed.
fn strip_unit(tokens: &[&str], line: &str) -> Result<String, ParseError> {
    let malformed = || ParseError::Malformed(line.to_string());

    let value = *tokens.get(1).ok_or_else(malformed)?;
    let cut = value.len().saturating_sub(3);
    if cut == 0 || !value.is_char_boundary(cut) {
        return Err(malformed());
    }

    Ok(value[..cut].to_string())
}
