use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Magnitude above which an integer timestamp is read as milliseconds.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Legacy Twitter API format, e.g. `Wed Aug 01 14:30:00 +0000 2025`.
const LEGACY_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// Naive patterns tried last; all are assumed to be UTC.
const FALLBACK_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

const FALLBACK_DATE_FORMATS: &[&str] = &["%Y-%m-%d"];

/// Zone that normalized timestamps are rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayZone {
    #[default]
    Local,
    Named(Tz),
}

impl DisplayZone {
    /// `None` means the system zone; otherwise an IANA name such as `Asia/Shanghai`.
    pub fn from_name(name: Option<&str>) -> Result<Self, String> {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            None => Ok(DisplayZone::Local),
            Some(name) => name
                .parse::<Tz>()
                .map(DisplayZone::Named)
                .map_err(|e| format!("unknown timezone {:?}: {}", name, e)),
        }
    }

    pub fn render<Z: TimeZone>(&self, time: &DateTime<Z>) -> String {
        match self {
            DisplayZone::Local => time.with_timezone(&Local).format(DISPLAY_FORMAT).to_string(),
            DisplayZone::Named(tz) => time.with_timezone(tz).format(DISPLAY_FORMAT).to_string(),
        }
    }
}

fn parse_unix(raw: &str) -> Option<DateTime<Utc>> {
    let value: i64 = raw.parse().ok()?;
    if value > MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

fn parse_iso8601(raw: &str) -> Option<DateTime<Utc>> {
    if !raw.contains('T') {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_legacy(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, LEGACY_FORMAT)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_fallback(raw: &str) -> Option<DateTime<Utc>> {
    let datetime = FALLBACK_DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok());
    let naive = datetime.or_else(|| {
        FALLBACK_DATE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
            .and_then(|date| date.and_hms_opt(0, 0, 0))
    })?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Parse a publish timestamp in any of the accepted shapes.
///
/// Attempts run in order: Unix seconds/milliseconds, ISO-8601 with `Z` or
/// an explicit offset, the legacy textual format, then the naive fallbacks.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let parsers: [fn(&str) -> Option<DateTime<Utc>>; 4] =
        [parse_unix, parse_iso8601, parse_legacy, parse_fallback];
    parsers.iter().find_map(|parse| parse(raw))
}

/// Parse and render in `zone`, or hand back the raw text untouched.
pub fn normalize(raw: &str, zone: &DisplayZone) -> (Option<DateTime<Utc>>, String) {
    match parse_timestamp(raw) {
        Some(utc) => (Some(utc), zone.render(&utc)),
        None => (None, raw.to_string()),
    }
}
