use openssl::asn1::{Asn1Time, Asn1TimeRef, TimeDiff};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use time::OffsetDateTime;

/// Joins the messages of `err` and all of its sources, as in `"error: source: root error"`.
///
/// Used where an error is rendered as plain text, such as the readiness probe responses.
pub fn error_full_message(err: &dyn std::error::Error) -> String {
    std::iter::successors(Some(err), |err| err.source())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Asn1TimeParseError {
    #[snafu(display("unix epoch is not a valid Asn1Time"))]
    Epoch { source: openssl::error::ErrorStack },

    #[snafu(display("unable to diff Asn1Time"))]
    Diff { source: openssl::error::ErrorStack },

    #[snafu(display("unable to parse as OffsetDateTime"))]
    Parse { source: time::error::ComponentRange },

    #[snafu(display("time overflowed"))]
    Overflow,
}

/// Converts a certificate timestamp into an [`OffsetDateTime`], by measuring its distance from
/// the unix epoch.
pub fn asn1time_to_offsetdatetime(asn: &Asn1TimeRef) -> Result<OffsetDateTime, Asn1TimeParseError> {
    use asn1_time_parse_error::*;
    let epoch = Asn1Time::from_unix(0).context(EpochSnafu)?;
    let TimeDiff { days, secs } = epoch.diff(asn).context(DiffSnafu)?;
    let unix_timestamp = i64::from(days)
        .checked_mul(time::Duration::DAY.whole_seconds())
        .and_then(|day_secs| day_secs.checked_add(i64::from(secs)))
        .context(OverflowSnafu)?;
    OffsetDateTime::from_unix_timestamp(unix_timestamp).context(ParseSnafu)
}

#[cfg(test)]
mod tests {
    use openssl::asn1::Asn1Time;
    use snafu::Snafu;
    use time::macros::datetime;

    use super::{asn1time_to_offsetdatetime, error_full_message};

    #[derive(Debug, Snafu)]
    #[snafu(display("leaf"))]
    struct Leaf {
        source: Middleware,
    }

    #[derive(Debug, Snafu)]
    #[snafu(display("middleware"))]
    struct Middleware {
        source: std::io::Error,
    }

    #[test]
    fn error_messages() {
        let root = std::io::Error::other("root error");
        assert_eq!(error_full_message(&root), "root error");
        let nested = Leaf {
            source: Middleware {
                source: std::io::Error::other("root error"),
            },
        };
        assert_eq!(error_full_message(&nested), "leaf: middleware: root error");
    }

    #[test]
    fn certificate_timestamps_are_converted() {
        // GeneralizedTime, without separators
        let asn = Asn1Time::from_str("20240102020304Z").unwrap();
        assert_eq!(
            asn1time_to_offsetdatetime(&asn).unwrap(),
            datetime!(2024-01-02 02:03:04 UTC)
        );
        let before_epoch = Asn1Time::from_str("19691231235959Z").unwrap();
        assert_eq!(
            asn1time_to_offsetdatetime(&before_epoch).unwrap(),
            datetime!(1969-12-31 23:59:59 UTC)
        );
    }
}
