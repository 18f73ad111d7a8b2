use serde::{de::Error as _, Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LagTransport {
    PubSub,
    Rest,
}

impl LagTransport {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PubSub => "pubsub",
            Self::Rest => "rest",
        }
    }
}

/// Latest value of a sensor as stored by the telemetry service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteSample {
    #[serde(rename = "v", deserialize_with = "number_or_string")]
    pub value: f64,
    #[serde(rename = "ts")]
    pub timestamp: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub device_type: String,
}

/// What was last sent on a transport, kept to compare against its echo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendRecord {
    pub value: f64,
    pub wallclock_secs: i64,
    pub monotonic_ms: Option<u64>,
}

/// One outbound value on a numbered channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryValue {
    #[serde(skip)]
    pub channel: u8,
    pub value: f64,
    pub unit: &'static str,
    #[serde(rename = "ts")]
    pub timestamp: i64,
}

impl TelemetryValue {
    pub fn new(channel: u8, value: f64, unit: &'static str, timestamp: i64) -> Self {
        Self {
            channel,
            value,
            unit,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    pub channel: u8,
    pub payload: String,
}

impl InboundCommand {
    pub fn new(channel: u8, payload: impl Into<String>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.payload
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
    }

    pub fn as_bool(&self) -> Option<bool> {
        let payload = self.payload.trim();
        if payload == "1"
            || payload.eq_ignore_ascii_case("true")
            || payload.eq_ignore_ascii_case("on")
        {
            Some(true)
        } else if payload == "0"
            || payload.eq_ignore_ascii_case("false")
            || payload.eq_ignore_ascii_case("off")
        {
            Some(false)
        } else {
            None
        }
    }
}

fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    let value = match Raw::deserialize(deserializer)? {
        Raw::Number(value) => value,
        Raw::Text(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|err| D::Error::custom(format!("sample value {text:?}: {err}")))?,
    };

    if value.is_finite() {
        Ok(value)
    } else {
        Err(D::Error::custom("sample value is not finite"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_value_accepts_number_or_string() {
        let numeric: RemoteSample =
            serde_json::from_str(r#"{"ts":"2024-01-01T00:00:00Z","v":12.5}"#).unwrap();
        let text: RemoteSample = serde_json::from_str(
            r#"{"device_type":"esp32","unit":"s","v":" 12.5 ","ts":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        assert_eq!(numeric.value, 12.5);
        assert_eq!(text.value, 12.5);
        assert_eq!(text.device_type, "esp32");
        assert!(serde_json::from_str::<RemoteSample>(r#"{"v":"abc","ts":"x"}"#).is_err());
    }

    #[test]
    fn telemetry_payload_omits_channel() {
        let value = TelemetryValue::new(6, -1.5, "s", 1_700_000_000);
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#"{"value":-1.5,"unit":"s","ts":1700000000}"#
        );
    }

    #[test]
    fn command_payload_parsing() {
        assert_eq!(InboundCommand::new(20, "ON").as_bool(), Some(true));
        assert_eq!(InboundCommand::new(20, " 0\n").as_bool(), Some(false));
        assert_eq!(InboundCommand::new(20, "maybe").as_bool(), None);
        assert_eq!(InboundCommand::new(21, "4").as_f64(), Some(4.0));
        assert_eq!(InboundCommand::new(21, "NaN").as_f64(), None);
    }
}
