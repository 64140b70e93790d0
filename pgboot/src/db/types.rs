//! Column types shared by application schemas

use std::str::FromStr;
use std::time::Duration;

use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};
use sqlx::{Decode, Encode, Postgres, Type, TypeInfo, ValueRef};

use crate::error::Error;

const NANOS_PER_MICRO: u128 = 1_000;
const NANOS_PER_MILLI: u128 = 1_000_000;
const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// A [`Duration`] stored as a BIGINT count of nanoseconds.
///
/// Text columns are also accepted on read, in the `1h15m30.5s` form
/// (units `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PgDuration(pub Duration);

impl PgDuration {
    /// Nanoseconds, saturating at `i64::MAX`.
    pub fn as_nanos_i64(&self) -> i64 {
        i64::try_from(self.0.as_nanos()).unwrap_or(i64::MAX)
    }

    pub fn from_nanos(nanos: i64) -> Result<Self, Error> {
        u64::try_from(nanos)
            .map(|nanos| PgDuration(Duration::from_nanos(nanos)))
            .map_err(|_| Error::Serialization(format!("negative duration: {}ns", nanos)))
    }
}

impl From<Duration> for PgDuration {
    fn from(duration: Duration) -> Self {
        PgDuration(duration)
    }
}

impl From<PgDuration> for Duration {
    fn from(duration: PgDuration) -> Self {
        duration.0
    }
}

fn unit_nanos(unit: &str) -> Option<u128> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" | "μs" => Some(NANOS_PER_MICRO),
        "ms" => Some(NANOS_PER_MILLI),
        "s" => Some(NANOS_PER_SECOND),
        "m" => Some(60 * NANOS_PER_SECOND),
        "h" => Some(3600 * NANOS_PER_SECOND),
        _ => None,
    }
}

impl FromStr for PgDuration {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Error> {
        let invalid = || Error::Serialization(format!("invalid duration {:?}", input));

        let (negative, mut rest) = match input.as_bytes().first() {
            Some(b'-') => (true, &input[1..]),
            Some(b'+') => (false, &input[1..]),
            _ => (false, input),
        };
        if rest == "0" {
            return Ok(PgDuration::default());
        }
        if rest.is_empty() {
            return Err(invalid());
        }

        let mut total: u128 = 0;
        while !rest.is_empty() {
            let whole_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
            let (whole, tail) = rest.split_at(whole_len);

            let (fraction, tail) = match tail.strip_prefix('.') {
                Some(tail) => {
                    let len = tail.find(|c: char| !c.is_ascii_digit()).unwrap_or(tail.len());
                    tail.split_at(len)
                }
                None => ("", tail),
            };
            if whole.is_empty() && fraction.is_empty() {
                return Err(invalid());
            }

            let unit_len = tail
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(tail.len());
            let (unit, tail) = tail.split_at(unit_len);
            let scale = unit_nanos(unit).ok_or_else(invalid)?;

            let whole: u128 = if whole.is_empty() {
                0
            } else {
                whole.parse().map_err(|_| invalid())?
            };
            let mut nanos = whole.checked_mul(scale).ok_or_else(invalid)?;

            // Digits past the 18th cannot change a nanosecond count.
            let fraction = &fraction[..fraction.len().min(18)];
            if !fraction.is_empty() {
                let digits: u128 = fraction.parse().map_err(|_| invalid())?;
                nanos += digits * scale / 10u128.pow(fraction.len() as u32);
            }

            total = total.checked_add(nanos).ok_or_else(invalid)?;
            rest = tail;
        }

        if total > i64::MAX as u128 {
            return Err(invalid());
        }
        if negative && total > 0 {
            return Err(Error::Serialization(format!("negative duration {:?}", input)));
        }
        Ok(PgDuration(Duration::from_nanos(total as u64)))
    }
}

impl Type<Postgres> for PgDuration {
    fn type_info() -> PgTypeInfo {
        <i64 as Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <i64 as Type<Postgres>>::compatible(ty) || <&str as Type<Postgres>>::compatible(ty)
    }
}

impl Encode<'_, Postgres> for PgDuration {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> IsNull {
        <i64 as Encode<'_, Postgres>>::encode_by_ref(&self.as_nanos_i64(), buf)
    }
}

impl<'r> Decode<'r, Postgres> for PgDuration {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let textual = matches!(
            value.type_info().name(),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "UNKNOWN"
        );

        if textual {
            let text = <&str as Decode<'r, Postgres>>::decode(value)?;
            Ok(text.trim().parse()?)
        } else {
            let nanos = <i64 as Decode<'r, Postgres>>::decode(value)?;
            Ok(PgDuration::from_nanos(nanos)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("0", Duration::ZERO)]
    #[case("-0", Duration::ZERO)]
    #[case("300ms", Duration::from_millis(300))]
    #[case("1.5s", Duration::from_millis(1500))]
    #[case(".5h", Duration::from_secs(1800))]
    #[case("1h15m30s", Duration::from_secs(4530))]
    #[case("2µs", Duration::from_micros(2))]
    #[case("+10ns", Duration::from_nanos(10))]
    #[case("1m0.000000001s", Duration::new(60, 1))]
    fn parses_text_durations(#[case] input: &str, #[case] expected: Duration) {
        assert_eq!(input.parse::<PgDuration>().unwrap(), PgDuration(expected));
    }

    #[rstest]
    #[case("")]
    #[case("10")]
    #[case("3 days")]
    #[case("1d")]
    #[case(".s")]
    #[case("-5s")]
    #[case("9999999999h")]
    fn rejects_invalid_text(#[case] input: &str) {
        assert!(input.parse::<PgDuration>().is_err());
    }

    #[test]
    fn stored_as_bigint_nanoseconds() {
        assert_eq!(<PgDuration as Type<Postgres>>::type_info().name(), "INT8");

        let duration = PgDuration(Duration::from_secs(90));
        let mut buf = PgArgumentBuffer::default();
        let _ = duration.encode_by_ref(&mut buf);
        assert_eq!(&buf[..], &90_000_000_000i64.to_be_bytes()[..]);

        assert_eq!(PgDuration::from_nanos(duration.as_nanos_i64()).unwrap(), duration);
        assert!(PgDuration::from_nanos(-1).is_err());
    }

    #[test]
    fn huge_durations_saturate() {
        assert_eq!(PgDuration(Duration::MAX).as_nanos_i64(), i64::MAX);
    }
}
