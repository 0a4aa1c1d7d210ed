//! implements a parser for the beanstalkd TCP protocol.
use std::fmt;

use crate::types::protocol::BeanstalkCommand;
use crate::types::serialisable::BeanstalkSerialisable;

/// Longest tube name accepted, in bytes.
pub const MAX_TUBE_NAME_LEN: usize = 200;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsingError {
    BadFormat,
    UnknownCommand,
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::BadFormat => "bad format",
            Self::UnknownCommand => "unknown command",
        })
    }
}

impl std::error::Error for ParsingError {}

impl BeanstalkSerialisable for ParsingError {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        match self {
            ParsingError::BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            ParsingError::UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
        }
    }
}

/// Provides a custom, minimal, zero-copy parser of byte slices. Fields are
/// separated by runs of ASCII whitespace.
struct ParseState<'a> {
    from: &'a [u8],
}

impl ParseState<'_> {
    /// Asserts there's no more input to take other than whitespace, returning
    /// `result` if so, and a `BadFormat` error otherwise.
    fn expect_done_and<R>(&mut self, result: R) -> Result<R, ParsingError> {
        self.skip_spaces();

        if self.from.is_empty() {
            Ok(result)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    /// Consumes from the input, expecting a token of non-zero length.
    fn expect_next_token(&mut self) -> Result<&[u8], ParsingError> {
        let token = self.next_token().ok_or(ParsingError::BadFormat)?;

        if token.is_empty() {
            Err(ParsingError::BadFormat)
        } else {
            Ok(token)
        }
    }

    /// Consumes from the input, expecting whitespace then a u32.
    fn expect_next_u32(&mut self) -> Result<u32, ParsingError> {
        self.expect_next_u64()?
            .try_into()
            .map_err(|_| ParsingError::BadFormat)
    }

    /// Consumes from the input, expecting whitespace then a u64.
    fn expect_next_u64(&mut self) -> Result<u64, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        digits_to_u64(token)
    }

    /// Consumes from the input, expecting whitespace then an optionally
    /// negative i64.
    fn expect_next_i64(&mut self) -> Result<i64, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        match token.split_first() {
            Some((b'-', rest)) if !rest.is_empty() => {
                let magnitude = digits_to_u64(rest)?;
                0i64.checked_sub_unsigned(magnitude)
                    .ok_or(ParsingError::BadFormat)
            },
            _ => digits_to_u64(token)?
                .try_into()
                .map_err(|_| ParsingError::BadFormat),
        }
    }

    /// Consumes from the input, expecting whitespace then a tube name.
    fn expect_next_name(&mut self) -> Result<String, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        if token.len() > MAX_TUBE_NAME_LEN {
            return Err(ParsingError::BadFormat);
        }

        String::from_utf8(token.to_vec()).map_err(|_| ParsingError::BadFormat)
    }

    /// Consumes at least one whitespace byte.
    fn expect_space(&mut self) -> Result<(), ParsingError> {
        match self.skip_spaces() {
            0 => Err(ParsingError::BadFormat),
            _ => Ok(()),
        }
    }

    /// Consumes any leading whitespace, returning how many bytes were skipped.
    fn skip_spaces(&mut self) -> usize {
        let n = self
            .from
            .iter()
            .position(|c| !c.is_ascii_whitespace())
            .unwrap_or(self.from.len());

        self.from = &self.from[n..];

        n
    }

    /// Consumes from this ParseState until reaching a whitespace byte or the
    /// end of the input. It returns None at the end of the input. If the input
    /// starts with whitespace, it returns a zero-length slice.
    fn next_token(&mut self) -> Option<&[u8]> {
        if self.from.is_empty() {
            return None;
        }

        let idx = self
            .from
            .iter()
            .position(|c| c.is_ascii_whitespace())
            .unwrap_or(self.from.len());

        let token = &self.from[..idx];
        self.from = &self.from[idx..];

        Some(token)
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(from: &'a [u8]) -> Self {
        ParseState { from }
    }
}

/// Parses a non-empty run of ASCII digits, rejecting overflow.
fn digits_to_u64(token: &[u8]) -> Result<u64, ParsingError> {
    let mut r = 0u64;
    for v in token {
        match v {
            b'0'..=b'9' => {
                r = r
                    .checked_mul(10)
                    .ok_or(ParsingError::BadFormat)?
                    .checked_add((*v - b'0') as u64)
                    .ok_or(ParsingError::BadFormat)?
            },
            _ => return Err(ParsingError::BadFormat),
        };
    }

    Ok(r)
}

// Parsing is implemented to fulfil the TryFrom trait.
impl TryFrom<&[u8]> for BeanstalkCommand {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        use BeanstalkCommand::*;

        let mut ps: ParseState = value.into();
        ps.skip_spaces();

        // Command names are matched case-insensitively.
        let name = ps.expect_next_token()?.to_ascii_lowercase();

        let cmd = match name.as_slice() {
            // <cmd>
            b"quit" => Quit,
            b"reserve" => Reserve,

            // <cmd> <id>
            b"delete" => Delete {
                id: ps.expect_next_u64()?,
            },
            b"reserve-job" => ReserveJob {
                id: ps.expect_next_u64()?,
            },
            b"touch" => Touch {
                id: ps.expect_next_u64()?,
            },

            // <cmd> <timeout>
            b"reserve-with-timeout" => ReserveWithTimeout {
                timeout: ps.expect_next_i64()?,
            },

            // <cmd> <tube>
            b"use" => Use {
                tube: ps.expect_next_name()?,
            },
            b"watch" => Watch {
                tube: ps.expect_next_name()?,
            },
            b"ignore" => Ignore {
                tube: ps.expect_next_name()?,
            },

            // <cmd> <id> <pri>
            b"bury" => Bury {
                id: ps.expect_next_u64()?,
                pri: ps.expect_next_u32()?,
            },

            // <cmd> <id> <pri> <delay>
            b"release" => Release {
                id: ps.expect_next_u64()?,
                pri: ps.expect_next_u32()?,
                delay: ps.expect_next_u32()?,
            },

            // <cmd> <pri> <delay> <ttr> <n_bytes>
            b"put" => Put {
                pri: ps.expect_next_u32()?,
                delay: ps.expect_next_u32()?,
                ttr: ps.expect_next_u32()?,
                n_bytes: ps.expect_next_u32()?,
            },

            _ => return Err(ParsingError::UnknownCommand),
        };

        ps.expect_done_and(cmd)
    }
}
