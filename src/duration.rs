//! Serde helpers for durations written as (possibly fractional) seconds in configuration.

pub(crate) mod secs {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(|_| {
            de::Error::invalid_value(
                de::Unexpected::Float(seconds),
                &"a non-negative number of seconds",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Wrapper {
        #[serde(with = "super::secs")]
        delay: Duration,
    }

    #[test]
    fn whole_and_fractional_seconds() {
        let whole: Wrapper = serde_json::from_str(r#"{"delay": 2}"#).unwrap();
        assert_eq!(whole.delay, Duration::from_secs(2));

        let fraction: Wrapper = serde_json::from_str(r#"{"delay": 0.25}"#).unwrap();
        assert_eq!(fraction.delay, Duration::from_millis(250));
    }

    #[test]
    fn negative_is_rejected() {
        assert!(serde_json::from_str::<Wrapper>(r#"{"delay": -1}"#).is_err());
    }
}
