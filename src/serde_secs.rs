//! Serde helpers for `Duration` as fractional seconds.
//!
//! Use with `#[serde(with = "crate::serde_secs")]`.

use serde::{Deserialize, Deserializer, Serializer, de::Error};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Timed {
        #[serde(with = "super")]
        took: Duration,
    }

    #[test]
    fn seconds_round_trip_and_reject_negative() {
        let json = serde_json::to_string(&Timed {
            took: Duration::from_millis(1500),
        })
        .unwrap();
        assert_eq!(json, r#"{"took":1.5}"#);
        let back: Timed = serde_json::from_str(&json).unwrap();
        assert_eq!(back.took, Duration::from_millis(1500));
        assert!(serde_json::from_str::<Timed>(r#"{"took":-1.0}"#).is_err());
    }
}
