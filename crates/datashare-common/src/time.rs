use std::time::Duration;

use chrono::{DateTime, Utc};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Time elapsed since `since`, zero for timestamps in the future.
pub fn elapsed_since(since: &DateTime<Utc>) -> Duration {
    (now() - *since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;

    use super::{elapsed_since, now};

    #[test]
    fn elapsed_keeps_sub_second_precision() {
        let elapsed = elapsed_since(&(now() - TimeDelta::milliseconds(1500)));

        assert!(elapsed >= Duration::from_millis(1500));
        assert!(elapsed < Duration::from_secs(60));
    }

    #[test]
    fn future_timestamps_read_as_zero() {
        assert_eq!(
            elapsed_since(&(now() + TimeDelta::seconds(30))),
            Duration::ZERO
        );
    }
}
