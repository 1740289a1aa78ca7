//! Decodes a single line of the tracking sensor's ASCII output into a [Frame].
//!
//! A data line looks like `FT, 1234, ...` with at least 24 comma-space
//! separated tokens. Only three tokens matter to us and they are picked by
//! position: the frame count (1), the integrated heading (17) and the sensor
//! timestamp (22).

use nom::{
    branch::alt,
    bytes::complete::{tag, take_until},
    character::complete::u64 as parse_u64,
    combinator::{all_consuming, rest},
    multi::separated_list1,
    number::complete::double,
    IResult,
};

use std::{fmt, str::FromStr};

/// Marker in token 0 of every data line.
pub const FRAME_MARKER: &str = "FT";
/// Lines with fewer tokens than this are not data lines.
pub const MIN_TOKENS: usize = 24;

const FRAME_COUNT_INDEX: usize = 1;
const HEADING_INDEX: usize = 17;
const TIMESTAMP_INDEX: usize = 22;

/// One decoded sensor sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    /// Sensor assigned, monotonically increasing
    pub frame_count: u64,
    /// Integrated heading in the sensor's unit (radians)
    pub heading: f64,
    /// Sensor clock
    pub timestamp: f64,
}

/// Why a line did not decode. None of these are fatal, the caller is
/// expected to drop the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than [MIN_TOKENS] tokens.
    TooShort(usize),
    /// Token 0 is not [FRAME_MARKER].
    NotAFrame,
    /// A positional field did not parse as a number.
    BadField(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::TooShort(n) => write!(f, "only {} tokens", n),
            FrameError::NotAFrame => write!(f, "missing {} marker", FRAME_MARKER),
            FrameError::BadField(i) => write!(f, "token {} is not a number", i),
        }
    }
}

impl std::error::Error for FrameError {}

fn parse_token(s: &str) -> IResult<&str, &str> {
    alt((take_until(", "), rest))(s)
}

fn parse_tokens(s: &str) -> IResult<&str, Vec<&str>> {
    separated_list1(tag(", "), parse_token)(s)
}

fn parse_field<'a, O>(
    tokens: &[&'a str],
    index: usize,
    parser: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> Result<O, FrameError> {
    all_consuming(parser)(tokens[index].trim())
        .map(|(_, value)| value)
        .map_err(|_| FrameError::BadField(index))
}

impl FromStr for Frame {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim_end_matches(['\r', '\n']);
        let tokens = match parse_tokens(line) {
            Ok((_, tokens)) => tokens,
            Err(_) => return Err(FrameError::TooShort(0)),
        };

        if tokens.len() < MIN_TOKENS {
            return Err(FrameError::TooShort(tokens.len()));
        }
        if tokens[0] != FRAME_MARKER {
            return Err(FrameError::NotAFrame);
        }

        Ok(Frame {
            frame_count: parse_field(&tokens, FRAME_COUNT_INDEX, parse_u64)?,
            heading: parse_field(&tokens, HEADING_INDEX, double)?,
            timestamp: parse_field(&tokens, TIMESTAMP_INDEX, double)?,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a well formed data line with the given positional fields and
    /// filler everywhere else.
    pub(crate) fn frame_line(count: u64, heading: f64, timestamp: f64) -> String {
        let mut tokens: Vec<String> = (0..25).map(|i| format!("{}.5", i)).collect();
        tokens[0] = FRAME_MARKER.to_owned();
        tokens[1] = count.to_string();
        tokens[17] = heading.to_string();
        tokens[22] = timestamp.to_string();
        tokens.join(", ")
    }

    #[test]
    fn tokens_split_on_comma_space() {
        let (leftover, toks) = parse_tokens("FT, 1, -0.5, , x").unwrap();
        assert_eq!(leftover, "");
        assert_eq!(toks, vec!["FT", "1", "-0.5", "", "x"]);
    }

    #[test]
    fn decodes_positional_fields() {
        let s = frame_line(15869, 1.25, 1614000000123.0);
        let frame: Frame = s.parse().unwrap();
        assert_eq!(
            frame,
            Frame {
                frame_count: 15869,
                heading: 1.25,
                timestamp: 1614000000123.0,
            }
        );
    }

    #[test]
    fn decodes_real_sensor_line() {
        let s = "FT, 23, 0.0012, -0.0034, 0.0005, 0.0011, -0.0030, 0.0004, 0.89, \
                 -0.01, 0.35, 0.0001, -0.0021, 3.1, 0.4, 0.09, -0.12, 2.5133, \
                 0.0021, 0.0015, 0.0002, 17, 1614000000.456, 0.016, 1\r\n";
        let frame: Frame = s.parse().unwrap();
        assert_eq!(frame.frame_count, 23);
        assert_eq!(frame.heading, 2.5133);
        assert_eq!(frame.timestamp, 1614000000.456);
    }

    #[test]
    fn exactly_min_tokens_is_enough() {
        let mut tokens: Vec<String> = vec!["0".to_owned(); MIN_TOKENS];
        tokens[0] = "FT".to_owned();
        let frame: Frame = tokens.join(", ").parse().unwrap();
        assert_eq!(frame.frame_count, 0);
    }

    #[test]
    fn rejects_short_lines() {
        let s = "FT, 1, 2, 3";
        assert_eq!(s.parse::<Frame>(), Err(FrameError::TooShort(4)));
        assert!("".parse::<Frame>().is_err());
    }

    #[test]
    fn rejects_wrong_marker() {
        let s = frame_line(1, 0.0, 0.0).replacen("FT", "XX", 1);
        assert_eq!(s.parse::<Frame>(), Err(FrameError::NotAFrame));
    }

    #[test]
    fn rejects_non_numeric_fields() {
        let mut tokens: Vec<String> = vec!["0".to_owned(); MIN_TOKENS];
        tokens[0] = "FT".to_owned();
        tokens[17] = "north".to_owned();
        assert_eq!(
            tokens.join(", ").parse::<Frame>(),
            Err(FrameError::BadField(17))
        );
    }

    #[test]
    fn truncated_line_is_rejected() {
        let s = frame_line(7, 0.1, 2.0);
        let truncated = &s[..s.len() / 2];
        assert!(truncated.parse::<Frame>().is_err());
    }
}
