use chrono::{DateTime, TimeZone, Utc};

/// Unix timestamp of the network genesis block.
const GENESIS_UNIX: i64 = 1_598_306_400;

/// Seconds per chain epoch.
const EPOCH_DURATION_SECONDS: i64 = 30;

/// Converts a chain epoch to wall-clock time. Negative epochs mean
/// "unset" and map to the Unix epoch zero value.
pub fn epoch_to_time(epoch: i32) -> DateTime<Utc> {
    if epoch < 0 {
        return Utc.timestamp_opt(0, 0).unwrap();
    }

    Utc.timestamp_opt(GENESIS_UNIX + i64::from(epoch) * EPOCH_DURATION_SECONDS, 0)
        .unwrap()
}

pub fn time_to_epoch(time: DateTime<Utc>) -> i32 {
    ((time.timestamp() - GENESIS_UNIX) / EPOCH_DURATION_SECONDS) as i32
}

pub fn current_epoch() -> i32 {
    time_to_epoch(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_for_non_negative_epochs() {
        for epoch in [0, 1, 12345, 3_000_000, i32::MAX / 30] {
            assert_eq!(time_to_epoch(epoch_to_time(epoch)), epoch);
        }
    }

    #[test]
    fn genesis_is_epoch_zero() {
        assert_eq!(epoch_to_time(0).timestamp(), 1_598_306_400);
        assert_eq!(epoch_to_time(2).timestamp(), 1_598_306_460);
    }

    #[test]
    fn negative_epoch_means_unset() {
        assert_eq!(epoch_to_time(-1).timestamp(), 0);
    }
}
