//! # mqtt_api
//!
//! Models the MQTT control-plane collaborator named at its interface
//! boundary (spec §1, §6): "a message source producing queued command
//! strings and cancellation notifications". `hes-server::mqtt` implements
//! `MqttSource` over a real broker client; everything here — the grammar,
//! validation and queue-class uniqueness tracking — is plain, broker-free
//! logic so it is unit-testable on its own.

use async_trait::async_trait;

/// Topic suffix every gateway subscribes its ODM/FUOTA inbox to.
pub const ONDEMAND_TOPIC_SUFFIX: &str = "ONDEMAND_REQUEST";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueClass {
    Odm,
    /// download-type 13 or 14
    Special,
    /// download-type 27
    Fuota,
}

impl QueueClass {
    pub fn of(download_type: u8) -> Self {
        match download_type {
            13 | 14 => QueueClass::Special,
            27 => QueueClass::Fuota,
            _ => QueueClass::Odm,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OdmCommand {
    pub request_id: u64,
    pub gateway_id: String,
    pub hop_count: u8,
    pub dest_path: Vec<u8>,
    pub download_type: u8,
    pub command_hex: Vec<u8>,
    pub ping_count: Option<u32>,
    pub ping_interval: Option<u32>,
    /// FUOTA (download-type 27) parts 5/6: firmware path and filename,
    /// carried as plain strings rather than hex-decoded into `command_hex`.
    pub firmware_path: Option<String>,
    pub firmware_filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    Odm(OdmCommand),
    Cancel(Vec<u64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandParseError {
    Empty,
    BadRequestId,
    GatewayIdMismatch,
    BadPathLength,
    DownloadTypeOutOfRange,
    BadCommandHex,
    BadHopCount,
    WrongOpcodeForType,
}

/// Per download-type expected leading opcode byte(s), from the frame/command
/// dispatch table of spec §4.1/§4.4. Not exhaustive of every DLMS object,
/// just the finite set the engine issues.
fn expected_opcode_prefix(download_type: u8) -> Option<&'static [u8]> {
    match download_type {
        0 => Some(&[0x0E, 0x00]), // nameplate
        1 => Some(&[0x0E, 0x01]), // instantaneous
        2 => Some(&[0x0E, 0x02]), // billing
        3 => Some(&[0x0E, 0x03]), // daily-load
        4 => Some(&[0x0E, 0x04]), // block-load
        8 => Some(&[0x0E, 0x08]), // events
        10 => Some(&[0x0A]),      // OBIS scalar list
        15 => Some(&[0x0F]),      // single-OBIS read/write (RTC, capture period, ...)
        // download-type 27 (FUOTA) never reaches this check — parse_command
        // returns its own OdmCommand shape for that class before here.
        _ => None,
    }
}

/// Parses one `:`-separated record (already split out of the `-`-joined
/// multi-command topic payload).
pub fn parse_command(gateway_id: &str, record: &str) -> Result<ParsedCommand, CommandParseError> {
    if record.is_empty() {
        return Err(CommandParseError::Empty);
    }

    if let Some(rest) = record.strip_prefix("CANCEL:") {
        let ids: Result<Vec<u64>, _> = rest.split(':').map(|s| s.parse::<u64>()).collect();
        return ids
            .map(ParsedCommand::Cancel)
            .map_err(|_| CommandParseError::BadRequestId);
    }

    let parts: Vec<&str> = record.split(':').collect();
    if parts.len() < 6 {
        return Err(CommandParseError::Empty);
    }

    let request_id: u64 = parts[0].parse().map_err(|_| CommandParseError::BadRequestId)?;
    let record_gateway_id = parts[1];
    if record_gateway_id != gateway_id {
        return Err(CommandParseError::GatewayIdMismatch);
    }
    let hop_count: u8 = parts[2].parse().map_err(|_| CommandParseError::BadHopCount)?;
    let dest_path_hex = parts[3];
    if dest_path_hex.len() != 16 * (hop_count as usize + 1) {
        return Err(CommandParseError::BadPathLength);
    }
    let dest_path = hex_decode(dest_path_hex).ok_or(CommandParseError::BadPathLength)?;

    let download_type: u8 = parts[4].parse().map_err(|_| CommandParseError::DownloadTypeOutOfRange)?;
    if download_type > 31 {
        return Err(CommandParseError::DownloadTypeOutOfRange);
    }

    // FUOTA commands supply firmware-path and firmware-filename in parts 5/6
    // as plain strings rather than a hex-encoded command plus ping fields.
    if QueueClass::of(download_type) == QueueClass::Fuota {
        let firmware_path = parts.get(5).filter(|s| !s.is_empty()).ok_or(CommandParseError::BadCommandHex)?;
        let firmware_filename = parts.get(6).filter(|s| !s.is_empty()).ok_or(CommandParseError::BadCommandHex)?;
        return Ok(ParsedCommand::Odm(OdmCommand {
            request_id,
            gateway_id: record_gateway_id.to_string(),
            hop_count,
            dest_path,
            download_type,
            command_hex: Vec::new(),
            ping_count: None,
            ping_interval: None,
            firmware_path: Some(firmware_path.to_string()),
            firmware_filename: Some(firmware_filename.to_string()),
        }));
    }

    let command_hex = hex_decode(parts[5]).ok_or(CommandParseError::BadCommandHex)?;
    if let Some(prefix) = expected_opcode_prefix(download_type) {
        if !command_hex.starts_with(prefix) {
            return Err(CommandParseError::WrongOpcodeForType);
        }
    }

    let ping_count = parts.get(6).and_then(|s| s.parse().ok());
    let ping_interval = parts.get(7).and_then(|s| s.parse().ok());

    Ok(ParsedCommand::Odm(OdmCommand {
        request_id,
        gateway_id: record_gateway_id.to_string(),
        hop_count,
        dest_path,
        download_type,
        command_hex,
        ping_count,
        ping_interval,
        firmware_path: None,
        firmware_filename: None,
    }))
}

/// Splits a full topic payload (`-`-joined commands) and parses each.
pub fn parse_topic_payload(gateway_id: &str, payload: &str) -> Vec<Result<ParsedCommand, CommandParseError>> {
    payload.split('-').map(|rec| parse_command(gateway_id, rec)).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Tracks the last two seen request ids per queue class, enforcing the
/// uniqueness rule of spec §6.
#[derive(Debug, Default)]
pub struct RequestIdTracker {
    seen: std::collections::HashMap<QueueClass, [Option<u64>; 2]>,
}

impl RequestIdTracker {
    /// Returns `true` if `id` is new for `class` (and records it), `false`
    /// if it duplicates one of the last two seen ids for that class.
    pub fn accept(&mut self, class: QueueClass, id: u64) -> bool {
        let slot = self.seen.entry(class).or_insert([None, None]);
        if slot[0] == Some(id) || slot[1] == Some(id) {
            return false;
        }
        slot[1] = slot[0];
        slot[0] = Some(id);
        true
    }
}

/// The MQTT control-plane source: a queue of command strings plus a
/// cancellation notification channel, per gateway.
#[async_trait]
pub trait MqttSource: Send + Sync {
    /// Blocks (cooperatively) until the next command string arrives for
    /// `gateway_id`, or returns `None` if the source has shut down.
    async fn next_command(&self, gateway_id: &str) -> Option<String>;

    /// Drains and returns the current cancel-set for `gateway_id`.
    async fn drain_cancelled(&self, gateway_id: &str) -> Vec<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_grammar_and_validates_path_length() {
        let path = "11".repeat(16); // 32 hex chars = 16 bytes = 4 hops worth? (hop_count+1)*16
        // hop_count=1 needs (1+1)*16 = 32 hex chars.
        let record = format!("1001:GW0000000000001:1:{path}:0:0E00");
        let parsed = parse_command("GW0000000000001", &record).unwrap();
        match parsed {
            ParsedCommand::Odm(cmd) => {
                assert_eq!(cmd.request_id, 1001);
                assert_eq!(cmd.hop_count, 1);
                assert_eq!(cmd.download_type, 0);
            }
            _ => panic!("expected Odm"),
        }
    }

    #[test]
    fn rejects_gateway_mismatch_and_bad_path_length() {
        let record = "1:OTHERGW:0:AABBCCDD:0:0E00";
        assert_eq!(
            parse_command("GW1", record),
            Err(CommandParseError::GatewayIdMismatch)
        );

        let short_path_record = "1:GW1:0:AABB:0:0E00";
        assert_eq!(
            parse_command("GW1", short_path_record),
            Err(CommandParseError::BadPathLength)
        );
    }

    #[test]
    fn parses_cancel_command() {
        let parsed = parse_command("GW1", "CANCEL:10:11:12").unwrap();
        assert_eq!(parsed, ParsedCommand::Cancel(vec![10, 11, 12]));
    }

    #[test]
    fn request_id_tracker_enforces_last_two_uniqueness() {
        let mut tracker = RequestIdTracker::default();
        assert!(tracker.accept(QueueClass::Odm, 1));
        assert!(tracker.accept(QueueClass::Odm, 2));
        assert!(!tracker.accept(QueueClass::Odm, 1)); // still in last-two window
        assert!(tracker.accept(QueueClass::Odm, 3));
        assert!(tracker.accept(QueueClass::Odm, 1)); // 1 aged out of the window
        // Different class tracks independently.
        assert!(tracker.accept(QueueClass::Fuota, 1));
    }

    #[test]
    fn fuota_commands_carry_firmware_path_and_filename_not_command_hex() {
        let path = "11".repeat(16);
        let record = format!("2001:GW0000000000001:1:{path}:27:/fw/RF/GW1:meter_v3.bin");
        let parsed = parse_command("GW0000000000001", &record).unwrap();
        match parsed {
            ParsedCommand::Odm(cmd) => {
                assert_eq!(cmd.download_type, 27);
                assert_eq!(cmd.firmware_path.as_deref(), Some("/fw/RF/GW1"));
                assert_eq!(cmd.firmware_filename.as_deref(), Some("meter_v3.bin"));
                assert!(cmd.command_hex.is_empty());
            }
            _ => panic!("expected Odm"),
        }
    }

    #[test]
    fn queue_class_mapping() {
        assert_eq!(QueueClass::of(13), QueueClass::Special);
        assert_eq!(QueueClass::of(14), QueueClass::Special);
        assert_eq!(QueueClass::of(27), QueueClass::Fuota);
        assert_eq!(QueueClass::of(1), QueueClass::Odm);
    }
}
