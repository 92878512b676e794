//! SCPI command construction and reply decoding.
//!
//! Commands are plain ASCII lines terminated with [`TERMINATOR`]. A command whose
//! header ends in `?` is a query and blocks for exactly one reply line; every other
//! command is fire-and-forget.
//!
//! Replies follow one of a few small grammars, each with its own decoder:
//!
//! | Decoder            | Accepted                                   | Example        |
//! |--------------------|--------------------------------------------|----------------|
//! | [`decode_numeric`] | optional sign, digits, point, exponent     | `+3.162E+00`   |
//! | [`decode_bitfield`]| unsigned decimal integer, optional `+`     | `2`            |
//! | [`decode_on_off`]  | `1`, `ON`, `0`, `OFF` (any case)           | `ON`           |
//! | [`decode_text`]    | any non-empty line                         | `B&K,XLN30052` |

use crate::error::DecodeError;
use std::fmt;

/// Line terminator appended to every command.
pub const TERMINATOR: &str = "\r\n";

/// An immutable instrument command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpiCommand {
    text: String,
    expects_reply: bool,
}

impl ScpiCommand {
    /// Build a command; queries are recognised by a trailing `?` on the header.
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let expects_reply = text
            .split_whitespace()
            .next()
            .is_some_and(|header| header.ends_with('?'));
        Self {
            text,
            expects_reply,
        }
    }

    /// Command text without terminator.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether the instrument answers this command.
    pub fn expects_reply(&self) -> bool {
        self.expects_reply
    }

    /// Bytes put on the wire.
    pub fn framed(&self) -> String {
        format!("{}{}", self.text, TERMINATOR)
    }

    /// `VOLT <v>` with a fixed number of decimals.
    pub fn set_voltage(volts: f64, decimals: usize) -> Self {
        Self::new(format!("VOLT {:.*}", decimals, volts))
    }

    /// `CURR <i>` with a fixed number of decimals.
    pub fn set_current(amps: f64, decimals: usize) -> Self {
        Self::new(format!("CURR {:.*}", decimals, amps))
    }

    /// Voltage setpoint readback.
    pub fn voltage_setpoint() -> Self {
        Self::new("VOLT?")
    }

    /// Current setpoint readback.
    pub fn current_setpoint() -> Self {
        Self::new("CURR?")
    }

    /// Measured output voltage.
    pub fn measure_voltage() -> Self {
        Self::new("MEAS:VOLT?")
    }

    /// Measured output current.
    pub fn measure_current() -> Self {
        Self::new("MEAS:CURR?")
    }

    /// `OUTP ON` / `OUTP OFF`.
    pub fn output(enabled: bool) -> Self {
        Self::new(if enabled { "OUTP ON" } else { "OUTP OFF" })
    }

    /// Output state query.
    pub fn output_state() -> Self {
        Self::new("OUTP?")
    }

    /// Questionable status condition register (protection bits).
    pub fn protection_status() -> Self {
        Self::new("STAT:QUES:COND?")
    }

    /// Clear status, which also clears latched protections.
    pub fn clear_status() -> Self {
        Self::new("*CLS")
    }

    /// Identification query.
    pub fn identify() -> Self {
        Self::new("*IDN?")
    }
}

impl fmt::Display for ScpiCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Decode a numeric reply.
pub fn decode_numeric(reply: &str) -> Result<f64, DecodeError> {
    let token = non_empty(reply)?;
    let well_formed = token
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
        && token.chars().any(|c| c.is_ascii_digit());
    if !well_formed {
        return Err(DecodeError::NotNumeric(token.to_string()));
    }
    match token.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(DecodeError::NotNumeric(token.to_string())),
    }
}

/// Decode a register value.
pub fn decode_bitfield(reply: &str) -> Result<u32, DecodeError> {
    let token = non_empty(reply)?;
    let digits = token.strip_prefix('+').unwrap_or(token);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(DecodeError::NotBitfield(token.to_string()));
    }
    digits
        .parse::<u32>()
        .map_err(|_| DecodeError::NotBitfield(token.to_string()))
}

/// Decode an output-state reply.
pub fn decode_on_off(reply: &str) -> Result<bool, DecodeError> {
    let token = non_empty(reply)?;
    match token.to_ascii_uppercase().as_str() {
        "1" | "ON" => Ok(true),
        "0" | "OFF" => Ok(false),
        _ => Err(DecodeError::NotOnOff(token.to_string())),
    }
}

/// Decode a free-text reply such as `*IDN?`.
pub fn decode_text(reply: &str) -> Result<String, DecodeError> {
    non_empty(reply).map(str::to_string)
}

fn non_empty(reply: &str) -> Result<&str, DecodeError> {
    let token = reply.trim();
    if token.is_empty() {
        Err(DecodeError::Empty)
    } else {
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_detection() {
        assert!(ScpiCommand::new("VOLT?").expects_reply());
        assert!(ScpiCommand::new("MEAS:CURR?").expects_reply());
        assert!(ScpiCommand::identify().expects_reply());
        assert!(!ScpiCommand::new("VOLT 3.16").expects_reply());
        assert!(!ScpiCommand::clear_status().expects_reply());
        assert!(!ScpiCommand::output(true).expects_reply());
    }

    #[test]
    fn setpoints_use_fixed_precision() {
        assert_eq!(ScpiCommand::set_voltage(3.16227766, 2).text(), "VOLT 3.16");
        assert_eq!(ScpiCommand::set_current(0.34785, 3).text(), "CURR 0.348");
        assert_eq!(ScpiCommand::set_voltage(0.0, 2).framed(), "VOLT 0.00\r\n");
    }

    #[test]
    fn numeric_grammar() {
        assert_eq!(decode_numeric("3.16\r\n"), Ok(3.16));
        assert_eq!(decode_numeric("+3.162E+00"), Ok(3.162));
        assert_eq!(decode_numeric("-0.5"), Ok(-0.5));
        assert_eq!(decode_numeric("  "), Err(DecodeError::Empty));
        assert!(matches!(decode_numeric("ERR"), Err(DecodeError::NotNumeric(_))));
        assert!(matches!(decode_numeric("nan"), Err(DecodeError::NotNumeric(_))));
        assert!(matches!(decode_numeric("1e999"), Err(DecodeError::NotNumeric(_))));
        assert!(matches!(decode_numeric("--"), Err(DecodeError::NotNumeric(_))));
    }

    #[test]
    fn bitfield_grammar() {
        assert_eq!(decode_bitfield("0"), Ok(0));
        assert_eq!(decode_bitfield("+5\n"), Ok(5));
        assert!(matches!(decode_bitfield("-1"), Err(DecodeError::NotBitfield(_))));
        assert!(matches!(decode_bitfield("2.0"), Err(DecodeError::NotBitfield(_))));
        assert!(matches!(decode_bitfield("+"), Err(DecodeError::NotBitfield(_))));
    }

    #[test]
    fn on_off_grammar() {
        assert_eq!(decode_on_off("1"), Ok(true));
        assert_eq!(decode_on_off("on"), Ok(true));
        assert_eq!(decode_on_off("OFF\r\n"), Ok(false));
        assert!(matches!(decode_on_off("2"), Err(DecodeError::NotOnOff(_))));
        assert_eq!(decode_text(""), Err(DecodeError::Empty));
    }
}
