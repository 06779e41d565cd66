use chrono::{SecondsFormat, Utc};

/// Current wall-clock time as an RFC 3339 UTC string with millisecond precision.
pub fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
