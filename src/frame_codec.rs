//! Line-oriented wire format spoken by the serial CAN bridge.
//!
//! Outbound, the host writes one command per line:
//!
//! ```text
//! SEND_<id hex>_<byte hex>_..._<byte hex>
//! MODE_NORMAL | MODE_LOOPBACK
//! AUTO_ON | AUTO_OFF
//! ```
//!
//! Inbound, every received frame is announced as
//! `CAN_RX_<id hex>_<len decimal>_<byte hex>_...`. Anything else the bridge
//! prints is opaque text that is shown to the operator but carries no
//! structure. Decoding is permissive: a token that does not parse is
//! skipped, and a line that cannot be made into a frame falls back to text.

use crate::error::ValidationError;

use nom::{
    bytes::complete::tag,
    character::complete::{digit1, hex_digit1},
    combinator::{all_consuming, map_res},
    Finish, IResult,
};

use std::{fmt, str::FromStr};

/// Largest standard (11 bit) CAN identifier.
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Classic CAN payload limit.
pub const MAX_DATA_LEN: usize = 8;

const RX_PREFIX: &str = "CAN_RX_";
const TX_OK_PREFIX: &str = "CAN_TX_OK_";

/// An outbound CAN frame. Construction validates the identifier and the
/// payload length, so every `CanFrame` in existence can be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: u16,
    data: Vec<u8>,
}

impl CanFrame {
    /// Builds a frame, rejecting ids above `0x7FF` and payloads over 8 bytes.
    pub fn new(id: u32, data: &[u8]) -> Result<Self, ValidationError> {
        if id > MAX_STANDARD_ID {
            return Err(ValidationError::InvalidId(id));
        }
        if data.len() > MAX_DATA_LEN {
            return Err(ValidationError::InvalidLength(data.len()));
        }
        Ok(Self {
            id: id as u16,
            data: data.to_vec(),
        })
    }

    /// Standard 11-bit identifier.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Payload, at most 8 bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Operating mode of the bridge's CAN controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanMode {
    /// Frames go out on the bus
    Normal,
    /// Frames are looped back to the receiver without touching the bus
    Loopback,
}

impl fmt::Display for CanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanMode::Normal => write!(f, "NORMAL"),
            CanMode::Loopback => write!(f, "LOOPBACK"),
        }
    }
}

impl FromStr for CanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => Ok(CanMode::Normal),
            "LOOPBACK" => Ok(CanMode::Loopback),
            other => Err(format!("unknown CAN mode {other:?}")),
        }
    }
}

/// Every command the bridge firmware understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Put a frame on the bus
    Send(CanFrame),
    /// Switch the controller mode
    Mode(CanMode),
    /// Toggle the firmware's own periodic sender
    AutoSend(bool),
}

impl Command {
    /// The wire line for this command, without the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            Command::Send(frame) => {
                let mut line = format!("SEND_{:x}", frame.id);
                for byte in &frame.data {
                    line.push_str(&format!("_{byte:02x}"));
                }
                line
            }
            Command::Mode(mode) => format!("MODE_{mode}"),
            Command::AutoSend(true) => "AUTO_ON".to_owned(),
            Command::AutoSend(false) => "AUTO_OFF".to_owned(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Encodes a `SEND_` command after validating `id` and `bytes`.
pub fn encode_send(id: u32, bytes: &[u8]) -> Result<String, ValidationError> {
    Ok(Command::Send(CanFrame::new(id, bytes)?).encode())
}

/// Encodes a `MODE_` command.
pub fn encode_mode(mode: CanMode) -> String {
    Command::Mode(mode).encode()
}

/// A frame announced by the bridge with a `CAN_RX_` line. The payload tokens
/// are kept verbatim so that higher layers can apply their own parsing
/// policy to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    id: u32,
    declared_len: Option<u8>,
    tokens: Vec<String>,
}

impl RawFrame {
    /// Identifier as printed by the bridge.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The length token printed by the bridge. Informational only, it is
    /// never checked against the payload.
    pub fn declared_len(&self) -> Option<u8> {
        self.declared_len
    }

    /// Every token after the length slot, exactly as received.
    pub fn payload_tokens(&self) -> &[String] {
        &self.tokens
    }

    /// The payload tokens that parse as hex bytes. Anything else is skipped.
    pub fn data(&self) -> Vec<u8> {
        self.tokens.iter().filter_map(|t| parse_hex_byte(t)).collect()
    }
}

/// One decoded line from the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// A `CAN_RX_` frame notification
    Frame(RawFrame),
    /// Anything else, kept for display
    PlainText(String),
}

fn hex_u32(s: &str) -> IResult<&str, u32> {
    map_res(hex_digit1, |h: &str| u32::from_str_radix(h, 16))(s)
}

fn decimal_u8(s: &str) -> IResult<&str, u8> {
    map_res(digit1, |d: &str| d.parse::<u8>())(s)
}

fn rx_prefix(s: &str) -> IResult<&str, &str> {
    tag(RX_PREFIX)(s)
}

/// Parses a whole token as a hex number.
pub(crate) fn parse_hex_u32(token: &str) -> Option<u32> {
    all_consuming(hex_u32)(token.trim())
        .finish()
        .ok()
        .map(|(_, v)| v)
}

/// Parses a whole token as a single hex byte.
pub(crate) fn parse_hex_byte(token: &str) -> Option<u8> {
    parse_hex_u32(token).and_then(|v| u8::try_from(v).ok())
}

fn parse_decimal_u8(token: &str) -> Option<u8> {
    all_consuming(decimal_u8)(token.trim())
        .finish()
        .ok()
        .map(|(_, v)| v)
}

fn tokens_of(rest: &str) -> impl Iterator<Item = &str> {
    rest.split('_').map(str::trim).filter(|t| !t.is_empty())
}

/// Decodes one line from the bridge. Never fails: lines that are not a
/// well-formed `CAN_RX_` notification come back as [`Line::PlainText`].
pub fn decode_line(line: &str) -> Line {
    let line = line.trim();
    match rx_frame(line) {
        Some(frame) => Line::Frame(frame),
        None => Line::PlainText(line.to_owned()),
    }
}

fn rx_frame(line: &str) -> Option<RawFrame> {
    let (rest, _) = rx_prefix(line).ok()?;
    let mut parts = rest.split('_');
    let id = parse_hex_u32(parts.next()?)?;
    let declared_len = parts.next().and_then(parse_decimal_u8);
    let tokens = parts
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect();

    Some(RawFrame {
        id,
        declared_len,
        tokens,
    })
}

/// The fixed replies printed by the bridge firmware. These still travel as
/// [`Line::PlainText`]; classifying them only helps diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeStatus {
    /// Controller initialised
    InitOk,
    /// Controller failed to initialise
    InitFailed,
    /// Firmware finished start-up
    Ready,
    /// Acknowledges a `MODE_` command
    ModeSet(CanMode),
    /// Acknowledges `AUTO_ON` / `AUTO_OFF`
    AutoSend(bool),
    /// A `SEND_` command went out on the bus
    TxOk {
        /// Frame id echoed by the firmware
        id: u32,
        /// Payload echoed by the firmware
        data: Vec<u8>,
    },
    /// A `SEND_` command could not be sent
    TxFailed,
    /// The firmware did not recognise the last command
    UnknownCommand,
}

impl BridgeStatus {
    /// Recognises a firmware reply, if `text` is one.
    pub fn classify(text: &str) -> Option<Self> {
        let text = text.trim();
        let status = match text {
            "CAN_INIT_OK" => Self::InitOk,
            "CAN_INIT_FAIL" => Self::InitFailed,
            "TP2_CAN_MONITOR_READY" => Self::Ready,
            "MODE_SET_NORMAL" => Self::ModeSet(CanMode::Normal),
            "MODE_SET_LOOPBACK" => Self::ModeSet(CanMode::Loopback),
            "AUTO_SEND_ON" => Self::AutoSend(true),
            "AUTO_SEND_OFF" => Self::AutoSend(false),
            "CAN_TX_FAIL" => Self::TxFailed,
            "UNKNOWN_COMMAND" => Self::UnknownCommand,
            other => {
                let rest = other.strip_prefix(TX_OK_PREFIX)?;
                let mut tokens = tokens_of(rest);
                let id = parse_hex_u32(tokens.next()?)?;
                let data = tokens.filter_map(parse_hex_byte).collect();
                Self::TxOk { id, data }
            }
        };
        Some(status)
    }
}

/// Validates the operator's manual frame input: a hex id (optionally
/// prefixed with `0x`) and a hex data string such as `522D3334`,
/// `52 2D 33 34` or `52_2D_33_34`.
pub fn parse_operator_frame(id_text: &str, data_text: &str) -> Result<CanFrame, ValidationError> {
    let id_text = id_text.trim();
    let id_digits = id_text
        .strip_prefix("0x")
        .or_else(|| id_text.strip_prefix("0X"))
        .unwrap_or(id_text);
    let id = parse_hex_u32(id_digits).ok_or_else(|| ValidationError::InvalidHex(id_text.to_owned()))?;
    if id > MAX_STANDARD_ID {
        return Err(ValidationError::InvalidId(id));
    }

    let digits: String = data_text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect();
    if digits.is_empty() {
        return Err(ValidationError::EmptyData);
    }
    if digits.len() % 2 != 0 || !digits.is_ascii() {
        return Err(ValidationError::InvalidHex(data_text.to_owned()));
    }

    let data = (0..digits.len())
        .step_by(2)
        .map(|i| {
            let pair = &digits[i..i + 2];
            parse_hex_byte(pair).ok_or_else(|| ValidationError::InvalidHex(pair.to_owned()))
        })
        .collect::<Result<Vec<u8>, ValidationError>>()?;

    CanFrame::new(id, &data)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rewrites a `SEND_` line the way the bridge would announce the same
    /// frame after looping it back.
    fn as_received(send_line: &str, len: usize) -> String {
        let body = send_line.strip_prefix("SEND_").unwrap();
        let mut parts = body.splitn(2, '_');
        let id = parts.next().unwrap();
        match parts.next() {
            Some(bytes) => format!("CAN_RX_{id}_{len}_{bytes}"),
            None => format!("CAN_RX_{id}_{len}"),
        }
    }

    #[test]
    fn encode_send_formats_lowercase_padded_bytes() {
        let line = encode_send(0x100, &[0x52, 0x2D, 0x33, 0x34]).unwrap();
        assert_eq!(line, "SEND_100_52_2d_33_34");

        let line = encode_send(0x7, &[0x0a]).unwrap();
        assert_eq!(line, "SEND_7_0a");

        assert_eq!(encode_send(0x7FF, &[]).unwrap(), "SEND_7ff");
    }

    #[test]
    fn encode_send_rejects_bad_frames() {
        assert_eq!(encode_send(0x800, &[1]), Err(ValidationError::InvalidId(0x800)));
        assert_eq!(
            encode_send(0x100, &[0; 9]),
            Err(ValidationError::InvalidLength(9))
        );
    }

    #[test]
    fn other_commands() {
        assert_eq!(encode_mode(CanMode::Normal), "MODE_NORMAL");
        assert_eq!(encode_mode(CanMode::Loopback), "MODE_LOOPBACK");
        assert_eq!(Command::AutoSend(true).encode(), "AUTO_ON");
        assert_eq!(Command::AutoSend(false).to_string(), "AUTO_OFF");
        assert_eq!("loopback".parse::<CanMode>(), Ok(CanMode::Loopback));
        assert!("fast".parse::<CanMode>().is_err());
    }

    #[test]
    fn send_line_survives_the_receive_path() {
        let cases: [(u32, &[u8]); 5] = [
            (0x000, &[]),
            (0x100, &[0x52, 0x2D, 0x33, 0x34]),
            (0x123, &[0x00, 0xFF]),
            (0x7FF, &[1, 2, 3, 4, 5, 6, 7, 8]),
            (0x0A, &[0x0A]),
        ];
        for (id, bytes) in cases {
            let line = as_received(&encode_send(id, bytes).unwrap(), bytes.len());
            match decode_line(&line) {
                Line::Frame(frame) => {
                    assert_eq!(frame.id(), id);
                    assert_eq!(frame.data(), bytes.to_vec());
                    assert_eq!(frame.declared_len(), Some(bytes.len() as u8));
                }
                other => panic!("{line} decoded as {other:?}"),
            }
        }
    }

    #[test]
    fn decode_firmware_style_line() {
        let Line::Frame(frame) = decode_line("CAN_RX_100_4_52_2D_33_34\r\n") else {
            panic!("expected a frame");
        };
        assert_eq!(frame.id(), 0x100);
        assert_eq!(frame.declared_len(), Some(4));
        assert_eq!(frame.payload_tokens(), ["52", "2D", "33", "34"]);
        assert_eq!(frame.data(), vec![0x52, 0x2D, 0x33, 0x34]);
    }

    #[test]
    fn decode_skips_junk_tokens() {
        let Line::Frame(frame) = decode_line("CAN_RX_101_3_52_zz_31_") else {
            panic!("expected a frame");
        };
        assert_eq!(frame.data(), vec![0x52, 0x31]);
        assert_eq!(frame.payload_tokens().len(), 3);
    }

    #[test]
    fn decode_falls_back_to_text() {
        assert_eq!(
            decode_line("GARBAGE_NOT_A_FRAME"),
            Line::PlainText("GARBAGE_NOT_A_FRAME".to_owned())
        );
        assert_eq!(
            decode_line("CAN_RX_nothex_2_01"),
            Line::PlainText("CAN_RX_nothex_2_01".to_owned())
        );
        assert_eq!(decode_line("CAN_RX_"), Line::PlainText("CAN_RX_".to_owned()));
    }

    #[test]
    fn decode_frame_without_payload() {
        let Line::Frame(frame) = decode_line("CAN_RX_7FF") else {
            panic!("expected a frame");
        };
        assert_eq!(frame.id(), 0x7FF);
        assert_eq!(frame.declared_len(), None);
        assert!(frame.data().is_empty());
    }

    #[test]
    fn classify_bridge_replies() {
        assert_eq!(BridgeStatus::classify("CAN_INIT_OK"), Some(BridgeStatus::InitOk));
        assert_eq!(
            BridgeStatus::classify("MODE_SET_LOOPBACK\r"),
            Some(BridgeStatus::ModeSet(CanMode::Loopback))
        );
        assert_eq!(
            BridgeStatus::classify("CAN_TX_OK_100_52_2D_33_34"),
            Some(BridgeStatus::TxOk {
                id: 0x100,
                data: vec![0x52, 0x2D, 0x33, 0x34]
            })
        );
        assert_eq!(BridgeStatus::classify("CAN BaudRate: 125kbps"), None);
    }

    #[test]
    fn operator_frame_input() {
        let frame = parse_operator_frame("100", "52 2D 33 34").unwrap();
        assert_eq!(frame.id(), 0x100);
        assert_eq!(frame.data(), [0x52u8, 0x2D, 0x33, 0x34]);

        let frame = parse_operator_frame("0x7ff", "00_ff").unwrap();
        assert_eq!(frame.id(), 0x7FF);

        assert_eq!(
            parse_operator_frame("800", "00"),
            Err(ValidationError::InvalidId(0x800))
        );
        assert_eq!(
            parse_operator_frame("xyz", "00"),
            Err(ValidationError::InvalidHex("xyz".to_owned()))
        );
        assert_eq!(parse_operator_frame("100", "  "), Err(ValidationError::EmptyData));
        assert!(parse_operator_frame("100", "123").is_err());
        assert!(parse_operator_frame("100", "GG").is_err());
        assert_eq!(
            parse_operator_frame("100", "000102030405060708"),
            Err(ValidationError::InvalidLength(9))
        );
    }
}
