use std::fmt;

const MILLIS_PER_DAY: u64 = 86_400_000;

/// Milliseconds since the Unix epoch, displayed as UTC RFC 3339, e.g.
/// `2009-01-03T18:15:05.000Z`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Timestamp(pub(crate) u64);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days = self.0 / MILLIS_PER_DAY;
        let mut rem = self.0 % MILLIS_PER_DAY;
        let millis = rem % 1000;
        rem /= 1000;
        let (hour, minute, second) = (rem / 3600, rem / 60 % 60, rem % 60);
        let (year, month, day) = date_from_epoch_days(days);
        write!(
            f,
            "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millis:03}Z"
        )
    }
}

/// Proleptic Gregorian date for a day count since 1970-01-01, using a calendar whose years start
/// on March 1 so leap days fall at the end.
fn date_from_epoch_days(days: u64) -> (u64, u64, u64) {
    const DAYS_PER_400Y: u64 = 146_097;
    // 0000-03-01 to 1970-01-01.
    let shifted = days + 719_468;
    let era = shifted / DAYS_PER_400Y;
    let day_of_era = shifted % DAYS_PER_400Y;
    let year_of_era =
        (day_of_era - day_of_era / 1460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let march_month = (5 * day_of_year + 2) / 153;
    let day = day_of_year - (153 * march_month + 2) / 5 + 1;
    let month = if march_month < 10 {
        march_month + 3
    } else {
        march_month - 9
    };
    let year = era * 400 + year_of_era + u64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_known_instants() {
        assert_eq!(Timestamp(0).to_string(), "1970-01-01T00:00:00.000Z");
        assert_eq!(
            Timestamp(1_231_006_505_007).to_string(),
            "2009-01-03T18:15:05.007Z"
        );
        assert_eq!(
            Timestamp(951_782_400_999).to_string(),
            "2000-02-29T00:00:00.999Z"
        );
        assert_eq!(
            Timestamp(4_107_542_399_000).to_string(),
            "2100-02-28T23:59:59.000Z"
        );
    }
}
