//! ESP300 ASCII command grammar.
//!
//! Commands are `{axis}{verb}{argument}`, for example `1PA10.5` (axis 1,
//! position absolute, 10.5 units) or `*IDN?` (no axis). Responses end in
//! `\r\n`.
//!
//! The two transports disagree on where the command terminator is applied:
//! the serial path sends it as part of every message, while the bus path
//! configures it once on the resource at connect time. [`Framing`] hides that
//! difference so that everything above the transport issues the same command
//! text regardless of the link in use.

use crate::error::{CommsError, CommsResult, InvalidAxisId};
use std::fmt;
use std::num::NonZeroU8;

/// Terminator appended to every command on the serial path.
pub const COMMAND_TERMINATOR: &str = "\r";

/// Terminator the controller appends to every response.
pub const RESPONSE_TERMINATOR: &str = "\r\n";

/// A physical axis number, starting at 1.
///
/// Not checked against the number of axes fitted to the controller; the
/// hardware rejects ids it does not have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AxisId(NonZeroU8);

impl AxisId {
    /// Create an axis id, returning `None` for zero.
    pub const fn new(id: u8) -> Option<Self> {
        match NonZeroU8::new(id) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    /// The numeric id as sent on the wire.
    pub const fn get(self) -> u8 {
        self.0.get()
    }
}

impl TryFrom<u8> for AxisId {
    type Error = InvalidAxisId;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Self::new(id).ok_or(InvalidAxisId(id))
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command mnemonics understood by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// `PA`: move to an absolute position.
    MoveAbsolute,
    /// `PR`: move by a relative distance.
    MoveRelative,
    /// `WS`: hold further command processing until the motor stops.
    WaitForStop,
    /// `TP?`: report the current position.
    TellPosition,
    /// `MD?`: report motion-done state (`1` = stopped).
    MotionDone,
    /// `VA`: set velocity.
    SetVelocity,
    /// `VA?`: report velocity.
    QueryVelocity,
    /// `AC`: set acceleration.
    SetAcceleration,
    /// `AC?`: report acceleration.
    QueryAcceleration,
    /// `AG`: set deceleration.
    SetDeceleration,
    /// `AG?`: report deceleration.
    QueryDeceleration,
    /// `MO`: motor on.
    MotorOn,
    /// `MF`: motor off.
    MotorOff,
    /// `DH`: define home (with argument `0`, zero the current position).
    DefineHome,
    /// `ST`: stop motion.
    Stop,
    /// `*IDN?`: identify the controller.
    Identify,
}

impl Verb {
    /// Every verb, in no particular order.
    pub const ALL: [Verb; 16] = [
        Verb::MoveAbsolute,
        Verb::MoveRelative,
        Verb::WaitForStop,
        Verb::TellPosition,
        Verb::MotionDone,
        Verb::SetVelocity,
        Verb::QueryVelocity,
        Verb::SetAcceleration,
        Verb::QueryAcceleration,
        Verb::SetDeceleration,
        Verb::QueryDeceleration,
        Verb::MotorOn,
        Verb::MotorOff,
        Verb::DefineHome,
        Verb::Stop,
        Verb::Identify,
    ];

    /// The mnemonic as it appears on the wire.
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Verb::MoveAbsolute => "PA",
            Verb::MoveRelative => "PR",
            Verb::WaitForStop => "WS",
            Verb::TellPosition => "TP?",
            Verb::MotionDone => "MD?",
            Verb::SetVelocity => "VA",
            Verb::QueryVelocity => "VA?",
            Verb::SetAcceleration => "AC",
            Verb::QueryAcceleration => "AC?",
            Verb::SetDeceleration => "AG",
            Verb::QueryDeceleration => "AG?",
            Verb::MotorOn => "MO",
            Verb::MotorOff => "MF",
            Verb::DefineHome => "DH",
            Verb::Stop => "ST",
            Verb::Identify => "*IDN?",
        }
    }

    /// Whether the controller answers this verb.
    pub fn is_query(self) -> bool {
        self.mnemonic().ends_with('?')
    }

    /// Find the verb at the start of `text`, preferring the longest mnemonic
    /// so that `VA?` is not mistaken for `VA` with argument `?`.
    fn match_prefix(text: &str) -> Option<Verb> {
        Verb::ALL
            .iter()
            .copied()
            .filter(|verb| text.starts_with(verb.mnemonic()))
            .max_by_key(|verb| verb.mnemonic().len())
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// A single controller command, rendered as `{axis}{verb}{argument}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Target axis, absent for controller-wide commands.
    pub axis: Option<AxisId>,
    /// Command mnemonic.
    pub verb: Verb,
    /// Argument text, passed through verbatim.
    pub argument: Option<String>,
}

impl Command {
    /// A command addressed to one axis.
    pub fn for_axis(axis: AxisId, verb: Verb) -> Self {
        Self {
            axis: Some(axis),
            verb,
            argument: None,
        }
    }

    /// A controller-wide command.
    pub fn global(verb: Verb) -> Self {
        Self {
            axis: None,
            verb,
            argument: None,
        }
    }

    /// Attach an argument. Numbers keep whatever formatting the caller gave them.
    pub fn with_argument(mut self, argument: impl fmt::Display) -> Self {
        self.argument = Some(argument.to_string());
        self
    }

    /// Parse command text (terminator optional) back into its parts.
    ///
    /// # Errors
    /// `CommsError::Protocol` if the text has an axis of `0` or no known verb.
    pub fn parse(text: &str) -> CommsResult<Self> {
        let body = text.trim_end_matches(['\r', '\n']);
        let digits = body.len() - body.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        let (axis_text, rest) = body.split_at(digits);

        let axis = if axis_text.is_empty() {
            None
        } else {
            let id: u8 = axis_text
                .parse()
                .map_err(|_| CommsError::Protocol(format!("Axis out of range in '{}'", body)))?;
            Some(AxisId::try_from(id).map_err(|e| CommsError::Protocol(e.to_string()))?)
        };

        let verb = Verb::match_prefix(rest)
            .ok_or_else(|| CommsError::Protocol(format!("Unknown command '{}'", body)))?;
        let argument = &rest[verb.mnemonic().len()..];

        Ok(Self {
            axis,
            verb,
            argument: (!argument.is_empty()).then(|| argument.to_string()),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(axis) = self.axis {
            write!(f, "{}", axis)?;
        }
        f.write_str(self.verb.mnemonic())?;
        if let Some(argument) = &self.argument {
            f.write_str(argument)?;
        }
        Ok(())
    }
}

/// Where message termination is applied for a given transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Terminator travels inside every command string.
    Serial,
    /// Terminators are configured on the bus resource once, at connect time.
    Bus,
}

impl Framing {
    /// Write terminator to configure on the resource (bus) or append (serial).
    pub const fn write_terminator(self) -> &'static str {
        COMMAND_TERMINATOR
    }

    /// Sequence that ends every controller response.
    pub const fn read_terminator(self) -> &'static str {
        RESPONSE_TERMINATOR
    }

    /// Render command text into wire bytes.
    ///
    /// On the serial path a carriage return is appended unless the text
    /// already ends with one. On the bus path the text is sent unchanged.
    pub fn encode(self, command: &str) -> Vec<u8> {
        match self {
            Framing::Serial if !command.ends_with(COMMAND_TERMINATOR) => {
                format!("{}{}", command, COMMAND_TERMINATOR).into_bytes()
            }
            Framing::Serial | Framing::Bus => command.as_bytes().to_vec(),
        }
    }

    /// Turn response bytes into text with the terminator and surrounding
    /// whitespace removed. An empty result is a valid, empty response.
    ///
    /// # Errors
    /// `CommsError::Protocol` if the bytes are not valid UTF-8.
    pub fn decode(self, bytes: &[u8]) -> CommsResult<String> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| CommsError::Protocol(format!("Response is not valid UTF-8: {}", e)))?;
        let text = text.strip_suffix(self.read_terminator()).unwrap_or(text);
        Ok(text.trim().to_string())
    }
}

/// Render command text for `framing`. See [`Framing::encode`].
pub fn encode(command: &str, framing: Framing) -> Vec<u8> {
    framing.encode(command)
}

/// Decode a response for `framing`. See [`Framing::decode`].
pub fn decode(bytes: &[u8], framing: Framing) -> CommsResult<String> {
    framing.decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis(id: u8) -> AxisId {
        AxisId::new(id).unwrap()
    }

    #[test]
    fn test_move_absolute_wire_bytes() {
        let cmd = Command::for_axis(axis(1), Verb::MoveAbsolute).with_argument("10");
        let wire = encode(&cmd.to_string(), Framing::Serial);
        assert_eq!(wire, b"1PA10\r");
    }

    #[test]
    fn test_serial_terminator_not_doubled() {
        assert_eq!(encode("1TP?\r", Framing::Serial), b"1TP?\r");
    }

    #[test]
    fn test_bus_framing_leaves_text_alone() {
        assert_eq!(encode("2VA?", Framing::Bus), b"2VA?");
    }

    #[test]
    fn test_global_command() {
        assert_eq!(Command::global(Verb::Identify).to_string(), "*IDN?");
    }

    #[test]
    fn test_zero_position_renders_dh0() {
        let cmd = Command::for_axis(axis(3), Verb::DefineHome).with_argument(0);
        assert_eq!(cmd.to_string(), "3DH0");
    }

    #[test]
    fn test_decode_strips_terminator_and_whitespace() {
        assert_eq!(decode(b" 10.0000\r\n", Framing::Serial).unwrap(), "10.0000");
        assert_eq!(decode(b"1\r\n", Framing::Bus).unwrap(), "1");
    }

    #[test]
    fn test_decode_empty_is_valid() {
        assert_eq!(decode(b"\r\n", Framing::Serial).unwrap(), "");
        assert_eq!(decode(b"", Framing::Bus).unwrap(), "");
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        let err = decode(&[0xff, 0xfe, b'\r', b'\n'], Framing::Serial).unwrap_err();
        assert!(matches!(err, CommsError::Protocol(_)));
    }

    #[test]
    fn test_parse_prefers_longest_mnemonic() {
        let cmd = Command::parse("1VA?").unwrap();
        assert_eq!(cmd.verb, Verb::QueryVelocity);
        assert_eq!(cmd.argument, None);

        let cmd = Command::parse("1VA2.5").unwrap();
        assert_eq!(cmd.verb, Verb::SetVelocity);
        assert_eq!(cmd.argument.as_deref(), Some("2.5"));
    }

    #[test]
    fn test_parse_rejects_axis_zero_and_unknown_verbs() {
        assert!(matches!(
            Command::parse("0PA1"),
            Err(CommsError::Protocol(_))
        ));
        assert!(matches!(
            Command::parse("1XX"),
            Err(CommsError::Protocol(_))
        ));
    }

    #[test]
    fn test_encoded_commands_parse_back() {
        for id in [1u8, 2, 3, 12] {
            for verb in Verb::ALL {
                let argument = (!verb.is_query()).then(|| "-4.25".to_string());
                let cmd = Command {
                    axis: (verb != Verb::Identify).then(|| axis(id)),
                    verb,
                    argument,
                };

                for framing in [Framing::Serial, Framing::Bus] {
                    let wire = encode(&cmd.to_string(), framing);
                    let text = String::from_utf8(wire).unwrap();
                    let parsed = Command::parse(&text).unwrap();
                    assert_eq!(parsed.verb, cmd.verb, "verb mismatch for {}", text.trim());
                    assert_eq!(parsed.argument, cmd.argument);
                    assert_eq!(parsed.axis, cmd.axis);
                }
            }
        }
    }

    #[test]
    fn test_axis_id_bounds() {
        assert!(AxisId::new(0).is_none());
        assert_eq!(AxisId::try_from(0), Err(InvalidAxisId(0)));
        assert_eq!(AxisId::try_from(2).map(AxisId::get), Ok(2));
    }
}
