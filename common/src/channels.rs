use thiserror::Error;

use crate::types::InboundCommand;

/// Larger command payloads are dropped before decoding.
pub const MAX_COMMAND_PAYLOAD_BYTES: usize = 512;

pub const CH_PUBSUB_TIME: u8 = 1;
pub const CH_REST_TIME: u8 = 2;
pub const CH_DOWNTIME: u8 = 3;
pub const CH_REBOOT_COUNT: u8 = 4;
pub const CH_REST_LAG: u8 = 5;
pub const CH_PUBSUB_LAG: u8 = 6;
pub const CH_REST_ROUNDTRIP: u8 = 7;
pub const CH_SIGNAL_A: u8 = 8;
pub const CH_SIGNAL_B: u8 = 9;
pub const CH_BUILD_MARKER: u8 = 10;
pub const CH_TOKEN_REFRESHED: u8 = 11;
pub const CH_MACHINE_STATE: u8 = 12;

pub const CMD_MACHINE_ENABLE: u8 = 20;
pub const CMD_CYCLE_RATE: u8 = 21;
pub const CMD_REFRESH_TOKEN: u8 = 22;
pub const CMD_REBOOT: u8 = 23;
/// The service echoes REST time writes back on the same channel.
pub const CMD_REST_ECHO: u8 = CH_REST_TIME;

pub fn telemetry_topic(prefix: &str, device_id: &str, channel: u8) -> String {
    format!("{prefix}/{device_id}/telemetry/{channel}")
}

pub fn command_filter(prefix: &str, device_id: &str) -> String {
    format!("{prefix}/{device_id}/cmd/+")
}

/// Extracts the channel number from a command topic addressed to this device.
pub fn parse_command_topic(prefix: &str, device_id: &str, topic: &str) -> Option<u8> {
    let channel = topic
        .strip_prefix(prefix)?
        .strip_prefix('/')?
        .strip_prefix(device_id)?
        .strip_prefix("/cmd/")?;
    channel.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("payload of {0} bytes exceeds the command limit")]
    Oversized(usize),
    #[error("payload is not valid utf-8")]
    NotUtf8,
}

/// Turns a raw broker message into a command. `Ok(None)` means the topic is
/// not a command for this device and the message should be ignored.
pub fn decode_command(
    prefix: &str,
    device_id: &str,
    topic: &str,
    payload: &[u8],
) -> Result<Option<InboundCommand>, CommandError> {
    let Some(channel) = parse_command_topic(prefix, device_id, topic) else {
        return Ok(None);
    };
    if payload.len() > MAX_COMMAND_PAYLOAD_BYTES {
        return Err(CommandError::Oversized(payload.len()));
    }
    let text = std::str::from_utf8(payload).map_err(|_| CommandError::NotUtf8)?;
    Ok(Some(InboundCommand::new(channel, text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_topics_map_to_channels() {
        assert_eq!(command_filter("lagwatch", "dev1"), "lagwatch/dev1/cmd/+");
        assert_eq!(
            parse_command_topic("lagwatch", "dev1", "lagwatch/dev1/cmd/23"),
            Some(CMD_REBOOT)
        );
        assert_eq!(
            parse_command_topic("lagwatch", "dev1", "lagwatch/dev2/cmd/23"),
            None
        );
        assert_eq!(
            parse_command_topic("lagwatch", "dev1", "lagwatch/dev1/cmd/x"),
            None
        );
        assert_eq!(
            telemetry_topic("lagwatch", "dev1", CH_PUBSUB_LAG),
            "lagwatch/dev1/telemetry/6"
        );
    }

    #[test]
    fn decodes_only_sane_commands_for_this_device() {
        assert_eq!(
            decode_command("lagwatch", "dev1", "lagwatch/dev1/cmd/21", b" 3 "),
            Ok(Some(InboundCommand::new(CMD_CYCLE_RATE, " 3 ")))
        );
        assert_eq!(
            decode_command("lagwatch", "dev1", "other/dev1/cmd/21", b"3"),
            Ok(None)
        );
        assert_eq!(
            decode_command("lagwatch", "dev1", "lagwatch/dev1/cmd/21", &[0xff, 0xfe]),
            Err(CommandError::NotUtf8)
        );

        let big = vec![b'1'; MAX_COMMAND_PAYLOAD_BYTES + 1];
        assert_eq!(
            decode_command("lagwatch", "dev1", "lagwatch/dev1/cmd/21", &big),
            Err(CommandError::Oversized(MAX_COMMAND_PAYLOAD_BYTES + 1))
        );
    }
}
