//! Serde support for `Duration` as milliseconds
//!
//! Dashboards and config files speak milliseconds, so every duration that
//! crosses a serde boundary goes through one of these modules.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    (duration.as_millis() as u64).serialize(serializer)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// Serde support for `Option<Duration>` as milliseconds
pub mod option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "super")]
        delay: Duration,
        #[serde(with = "super::option", default)]
        timeout: Option<Duration>,
    }

    #[test]
    fn test_writes_plain_millis() {
        let sample = Sample {
            delay: Duration::from_millis(1500),
            timeout: None,
        };
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["delay"], 1500);
        assert!(json["timeout"].is_null());
    }

    #[test]
    fn test_reads_missing_option_as_none() {
        let parsed: Sample = serde_json::from_str(r#"{"delay": 250}"#).unwrap();
        assert_eq!(parsed.delay, Duration::from_millis(250));
        assert_eq!(parsed.timeout, None);
    }
}
