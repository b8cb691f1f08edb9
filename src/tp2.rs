//! TP2 is a small telemetry convention layered on CAN ids `0x100..=0x107`.
//! Each id belongs to one group, and each frame carries one angle report:
//! the first payload byte is the ASCII tag of the magnitude (`R`oll,
//! pitch `C`, `O`rientation) and the following bytes are the ASCII
//! characters of the signed decimal value. Roll -34 on group 0 is
//!
//! ```text
//! SEND_100_52_2d_33_34
//! ```
//!
//! Two decoding strategies are tried in order. The tagged form looks for a
//! literal `TP2` token followed by tag and value, which is what older bridge
//! firmware appended to its `CAN_RX_` lines. The positional form reads the
//! payload bytes themselves, and is what this crate's own transmitter
//! produces.

use crate::error::ValidationError;
use crate::frame_codec::{parse_hex_byte, CanFrame, RawFrame};

use nom::{
    character::complete::{digit1, one_of},
    combinator::{all_consuming, opt},
    sequence::tuple,
    Finish, IResult,
};
use serde::{Deserialize, Serialize};

use std::{fmt, str::FromStr, time::Instant};

/// CAN id of group 0.
pub const TP2_BASE_ID: u32 = 0x100;

/// Number of TP2 groups.
pub const GROUP_COUNT: usize = 8;

/// Smallest angle accepted for transmission.
pub const MIN_ANGLE: i32 = -179;

/// Largest angle accepted for transmission.
pub const MAX_ANGLE: i32 = 180;

const TAGGED_MARKER: &str = "TP2";

/// One of the three angle channels tracked per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AngleMagnitude {
    /// Wire tag `R`
    Roll,
    /// Wire tag `C`
    Pitch,
    /// Wire tag `O`
    Orientation,
}

impl AngleMagnitude {
    /// All magnitudes, in wire order.
    pub const ALL: [AngleMagnitude; 3] = [
        AngleMagnitude::Roll,
        AngleMagnitude::Pitch,
        AngleMagnitude::Orientation,
    ];

    /// The ASCII tag used on the wire.
    pub fn tag(self) -> char {
        match self {
            AngleMagnitude::Roll => 'R',
            AngleMagnitude::Pitch => 'C',
            AngleMagnitude::Orientation => 'O',
        }
    }

    /// Inverse of [AngleMagnitude::tag], case-sensitive.
    pub fn from_tag(tag: char) -> Option<Self> {
        match tag {
            'R' => Some(AngleMagnitude::Roll),
            'C' => Some(AngleMagnitude::Pitch),
            'O' => Some(AngleMagnitude::Orientation),
            _ => None,
        }
    }

    /// Position in [`AngleMagnitude::ALL`].
    pub fn index(self) -> usize {
        match self {
            AngleMagnitude::Roll => 0,
            AngleMagnitude::Pitch => 1,
            AngleMagnitude::Orientation => 2,
        }
    }
}

impl fmt::Display for AngleMagnitude {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AngleMagnitude::Roll => "Roll",
            AngleMagnitude::Pitch => "Pitch",
            AngleMagnitude::Orientation => "Orientation",
        };
        f.write_str(name)
    }
}

impl FromStr for AngleMagnitude {
    type Err = String;

    /// Accepts either the wire tag or the name, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "r" | "roll" => Ok(AngleMagnitude::Roll),
            "c" | "p" | "pitch" => Ok(AngleMagnitude::Pitch),
            "o" | "orientation" => Ok(AngleMagnitude::Orientation),
            other => Err(format!("unknown angle magnitude {other:?}")),
        }
    }
}

/// A TP2 group, `0..=7`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct GroupId(u8);

impl GroupId {
    /// Checks that `group` is below [GROUP_COUNT].
    pub fn new(group: u8) -> Result<Self, ValidationError> {
        if (group as usize) < GROUP_COUNT {
            Ok(Self(group))
        } else {
            Err(ValidationError::InvalidGroup(group))
        }
    }

    /// Every group, in ascending order.
    pub fn all() -> impl Iterator<Item = GroupId> {
        (0..GROUP_COUNT as u8).map(GroupId)
    }

    /// Position in tables indexed by group.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// The CAN id this group transmits on.
    pub fn can_id(self) -> u32 {
        TP2_BASE_ID + self.0 as u32
    }

    /// The group owning `id`, if `id` is TP2 traffic at all.
    pub fn from_can_id(id: u32) -> Option<Self> {
        let offset = id.checked_sub(TP2_BASE_ID)?;
        u8::try_from(offset).ok().and_then(|g| Self::new(g).ok())
    }
}

impl TryFrom<u8> for GroupId {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<GroupId> for u8 {
    fn from(value: GroupId) -> Self {
        value.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single decoded angle report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AngleUpdate {
    /// Source group
    pub group: GroupId,
    /// Which angle
    pub magnitude: AngleMagnitude,
    /// The decoded text, verbatim. A partially decoded payload may not be
    /// a number, see [`AngleUpdate::degrees`].
    pub value: String,
    /// When the report was received
    pub observed_at: Instant,
}

impl AngleUpdate {
    /// The value as an integer, if it is one.
    pub fn degrees(&self) -> Option<i32> {
        self.value.parse().ok()
    }
}

/// Recovers an angle report from a received frame. Returns `None` for
/// traffic outside the TP2 id range and for frames whose payload does not
/// yield a tag and a non-empty value. Never fails.
pub fn try_extract(frame: &RawFrame, observed_at: Instant) -> Option<AngleUpdate> {
    let group = GroupId::from_can_id(frame.id())?;
    let tokens = frame.payload_tokens();
    let (magnitude, value) = tagged(tokens).or_else(|| positional(tokens))?;
    if value.is_empty() {
        return None;
    }

    Some(AngleUpdate {
        group,
        magnitude,
        value,
        observed_at,
    })
}

fn tagged(tokens: &[String]) -> Option<(AngleMagnitude, String)> {
    let marker = tokens.iter().position(|t| t == TAGGED_MARKER)?;
    let tag = tokens.get(marker + 1)?;
    let value = tokens.get(marker + 2)?;

    let mut chars = tag.chars();
    let magnitude = match (chars.next(), chars.next()) {
        (Some(c), None) => AngleMagnitude::from_tag(c)?,
        _ => return None,
    };
    Some((magnitude, value.clone()))
}

// Decodes as much of the value as parses and stops silently at the first
// token that is not a printable ASCII byte.
fn positional(tokens: &[String]) -> Option<(AngleMagnitude, String)> {
    let (first, rest) = tokens.split_first()?;
    let magnitude = AngleMagnitude::from_tag(char::from(parse_hex_byte(first)?))?;
    let value = rest
        .iter()
        .map_while(|t| parse_hex_byte(t).filter(|b| (32..=126).contains(b)))
        .map(char::from)
        .collect();
    Some((magnitude, value))
}

/// TP2 payload for `value` on `magnitude`: the tag byte followed by the
/// ASCII decimal digits.
pub fn encode_angle_payload(magnitude: AngleMagnitude, value: i32) -> Vec<u8> {
    let mut payload = vec![magnitude.tag() as u8];
    payload.extend(value.to_string().bytes());
    payload
}

/// A ready-to-send TP2 frame for a numeric angle.
pub fn angle_frame(
    group: GroupId,
    magnitude: AngleMagnitude,
    value: i32,
) -> Result<CanFrame, ValidationError> {
    if !(MIN_ANGLE..=MAX_ANGLE).contains(&value) {
        return Err(ValidationError::AngleOutOfRange(value));
    }
    CanFrame::new(group.can_id(), &encode_angle_payload(magnitude, value))
}

/// An operator-typed angle such as `R-34`, `C0` or `O+138`, already
/// validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AngleString {
    magnitude: AngleMagnitude,
    value: String,
}

impl AngleString {
    /// Roll, pitch or orientation.
    pub fn magnitude(&self) -> AngleMagnitude {
        self.magnitude
    }

    /// The signed digits after the tag, verbatim.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Encodes the string byte for byte, tag first.
    pub fn frame(&self, group: GroupId) -> Result<CanFrame, ValidationError> {
        let mut payload = vec![self.magnitude.tag() as u8];
        payload.extend(self.value.bytes());
        CanFrame::new(group.can_id(), &payload)
    }
}

fn angle_string(s: &str) -> IResult<&str, (char, Option<char>, &str)> {
    all_consuming(tuple((one_of("RCO"), opt(one_of("+-")), digit1)))(s)
}

/// Accepts exactly `^[RCO][+-]?\d{1,4}$` with a total length of 2 to 5.
pub fn validate_angle_string(text: &str) -> Result<AngleString, ValidationError> {
    let malformed = || ValidationError::MalformedAngle(text.to_owned());
    if !(2..=5).contains(&text.len()) {
        return Err(malformed());
    }

    let (_, (tag, sign, digits)) = angle_string(text).finish().map_err(|_| malformed())?;
    if digits.len() > 4 {
        return Err(malformed());
    }
    let magnitude = AngleMagnitude::from_tag(tag).ok_or_else(malformed)?;

    let mut value = String::new();
    if let Some(sign) = sign {
        value.push(sign);
    }
    value.push_str(digits);
    Ok(AngleString { magnitude, value })
}

/// Validates an operator angle string and encodes it for `group`.
pub fn angle_string_frame(group: GroupId, text: &str) -> Result<CanFrame, ValidationError> {
    validate_angle_string(text)?.frame(group)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_codec::{decode_line, Line};

    fn frame(line: &str) -> RawFrame {
        match decode_line(line) {
            Line::Frame(f) => f,
            Line::PlainText(t) => panic!("{t} is not a frame"),
        }
    }

    fn received(group: GroupId, payload: &[u8]) -> RawFrame {
        let mut line = format!("CAN_RX_{:X}_{}", group.can_id(), payload.len());
        for b in payload {
            line.push_str(&format!("_{b:X}"));
        }
        frame(&line)
    }

    #[test]
    fn positional_form() {
        let now = Instant::now();
        let update = try_extract(&frame("CAN_RX_100_4_52_2D_33_34"), now).unwrap();
        assert_eq!(update.group, GroupId::new(0).unwrap());
        assert_eq!(update.magnitude, AngleMagnitude::Roll);
        assert_eq!(update.value, "-34");
        assert_eq!(update.degrees(), Some(-34));
        assert_eq!(update.observed_at, now);
    }

    #[test]
    fn tagged_form() {
        let update = try_extract(&frame("CAN_RX_103_2_1_2_TP2_O_77"), Instant::now()).unwrap();
        assert_eq!(update.group.index(), 3);
        assert_eq!(update.magnitude, AngleMagnitude::Orientation);
        assert_eq!(update.value, "77");
    }

    #[test]
    fn firmware_line_with_both_forms() {
        let update = try_extract(
            &frame("CAN_RX_107_4_43_31_32_33_TP2_C_123"),
            Instant::now(),
        )
        .unwrap();
        assert_eq!(update.group.index(), 7);
        assert_eq!(update.magnitude, AngleMagnitude::Pitch);
        assert_eq!(update.value, "123");
    }

    #[test]
    fn bad_tagged_form_falls_back_to_positional() {
        let update = try_extract(&frame("CAN_RX_100_3_4F_35_35_TP2_X"), Instant::now()).unwrap();
        assert_eq!(update.magnitude, AngleMagnitude::Orientation);
        assert_eq!(update.value, "55");
    }

    #[test]
    fn partial_decode_keeps_prefix() {
        // 0x01 is not printable, decoding stops there
        let update = try_extract(&frame("CAN_RX_101_5_52_31_32_01_33"), Instant::now()).unwrap();
        assert_eq!(update.value, "12");

        let update = try_extract(&frame("CAN_RX_101_4_52_2D_zz_33"), Instant::now()).unwrap();
        assert_eq!(update.value, "-");
    }

    #[test]
    fn nothing_recovered() {
        let now = Instant::now();
        // outside the TP2 id range
        assert!(try_extract(&frame("CAN_RX_108_2_52_31"), now).is_none());
        assert!(try_extract(&frame("CAN_RX_FF_2_52_31"), now).is_none());
        // unknown tag
        assert!(try_extract(&frame("CAN_RX_100_2_58_31"), now).is_none());
        // tag without value
        assert!(try_extract(&frame("CAN_RX_100_1_52"), now).is_none());
        assert!(try_extract(&frame("CAN_RX_100_2_52_01"), now).is_none());
        // empty payload
        assert!(try_extract(&frame("CAN_RX_100_0"), now).is_none());
    }

    #[test]
    fn every_angle_survives_positional_decoding() {
        let group = GroupId::new(5).unwrap();
        for magnitude in AngleMagnitude::ALL {
            for value in MIN_ANGLE..=MAX_ANGLE {
                let payload = encode_angle_payload(magnitude, value);
                let update = try_extract(&received(group, &payload), Instant::now()).unwrap();
                assert_eq!(update.group, group);
                assert_eq!(update.magnitude, magnitude);
                assert_eq!(update.value, value.to_string());
            }
        }
    }

    #[test]
    fn angle_frame_checks_range() {
        let group = GroupId::new(2).unwrap();
        let frame = angle_frame(group, AngleMagnitude::Roll, -34).unwrap();
        assert_eq!(frame.id(), 0x102);
        assert_eq!(frame.data(), b"R-34");
        assert_eq!(
            angle_frame(group, AngleMagnitude::Roll, 181),
            Err(ValidationError::AngleOutOfRange(181))
        );
        assert_eq!(
            angle_frame(group, AngleMagnitude::Pitch, -180),
            Err(ValidationError::AngleOutOfRange(-180))
        );
    }

    #[test]
    fn group_ids() {
        assert!(GroupId::new(7).is_ok());
        assert_eq!(GroupId::new(8), Err(ValidationError::InvalidGroup(8)));
        assert_eq!(GroupId::from_can_id(0x104), GroupId::new(4).ok());
        assert_eq!(GroupId::from_can_id(0x0FF), None);
        assert_eq!(GroupId::from_can_id(0x1_0100), None);
        assert_eq!(GroupId::all().count(), GROUP_COUNT);
    }

    #[test]
    fn accepted_angle_strings() {
        for s in ["R-34", "C0", "O67", "R+138", "O9999", "C-180"] {
            assert!(validate_angle_string(s).is_ok(), "{s} should be accepted");
        }

        let parsed = validate_angle_string("R+138").unwrap();
        assert_eq!(parsed.magnitude(), AngleMagnitude::Roll);
        assert_eq!(parsed.value(), "+138");
        let frame = parsed.frame(GroupId::new(1).unwrap()).unwrap();
        assert_eq!(frame.id(), 0x101);
        assert_eq!(frame.data(), b"R+138");
    }

    #[test]
    fn rejected_angle_strings() {
        for s in [
            "", "R", "R--34", "X12", "R12345", "R+1234", "r12", "R 12", "R1a", "R+", "-R12", "R12-",
        ] {
            assert_eq!(
                validate_angle_string(s),
                Err(ValidationError::MalformedAngle(s.to_owned())),
                "{s:?} should be rejected"
            );
        }
    }

    #[test]
    fn magnitude_parsing() {
        assert_eq!("R".parse(), Ok(AngleMagnitude::Roll));
        assert_eq!("pitch".parse(), Ok(AngleMagnitude::Pitch));
        assert_eq!("O".parse(), Ok(AngleMagnitude::Orientation));
        assert!("yaw".parse::<AngleMagnitude>().is_err());
        for m in AngleMagnitude::ALL {
            assert_eq!(AngleMagnitude::from_tag(m.tag()), Some(m));
            assert_eq!(AngleMagnitude::ALL[m.index()], m);
        }
    }

    #[test]
    fn angle_string_frames_are_verbatim() {
        let g7 = GroupId::new(7).unwrap();
        let frame = angle_string_frame(g7, "O+138").unwrap();
        assert_eq!(frame.id(), 0x107);
        assert_eq!(frame.data(), b"O+138");
        assert!(angle_string_frame(g7, "X12").is_err());
    }
}
