// SPDX-License-Identifier: MIT
//! Line-oriented text protocol spoken over WebSocket text frames.
//!
//! RFC-1459-style framing: space-separated fields, with an optional final
//! "trailing" field introduced by `:` that consumes the rest of the line
//! verbatim (spaces included). The WebSocket layer provides message
//! boundaries, so there is no CR/LF framing. Chosen for ease of parsing
//! and ease of eyeballing on the wire.

use thiserror::Error;

/// Reasons a frame is rejected before it reaches a handler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("message too long")]
    TooLong,
    #[error("too many fields")]
    TooManyFields,
    #[error("illegal byte in message")]
    IllegalByte,
}

/// A parsed frame: a verb, plain arguments, and an optional trailing.
///
/// The trailing keeps its identity rather than being folded into `args`:
/// the reply grammar is bit-exact (`R 7 :Full` carries the `:` even though
/// "Full" has no space), so whether the final field was a trailing must
/// survive a parse/encode round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub verb: String,
    pub args: Vec<String>,
    pub trailing: Option<String>,
}

impl Message {
    pub fn new(verb: &str, args: &[&str]) -> Self {
        Self {
            verb: verb.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            trailing: None,
        }
    }

    pub fn with_trailing(verb: &str, args: &[&str], trailing: &str) -> Self {
        Self {
            verb: verb.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            trailing: Some(trailing.to_string()),
        }
    }

    /// Parse a raw line. `args_cap` bounds the field count (verb and
    /// trailing included) and `bytes_cap` bounds the line length; both come
    /// from `[perf]`.
    pub fn parse(line: &str, args_cap: usize, bytes_cap: usize) -> Result<Self, ProtocolError> {
        if line.len() > bytes_cap {
            return Err(ProtocolError::TooLong);
        }
        if line.bytes().any(|b| b == 0 || b == b'\r' || b == b'\n') {
            return Err(ProtocolError::IllegalByte);
        }

        let mut fields: Vec<String> = Vec::new();
        let mut trailing: Option<String> = None;
        let mut rest = line;
        loop {
            if let Some(t) = rest.strip_prefix(':') {
                // A leading ':' is only the trailing marker after the verb;
                // a line starting with ':' has no verb and is malformed.
                if fields.is_empty() {
                    return Err(ProtocolError::Empty);
                }
                trailing = Some(t.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((field, tail)) => {
                    // Consecutive spaces produce an empty field — not allowed
                    // outside the trailing position.
                    if field.is_empty() {
                        return Err(ProtocolError::IllegalByte);
                    }
                    fields.push(field.to_string());
                    rest = tail;
                }
                None => {
                    if !rest.is_empty() {
                        fields.push(rest.to_string());
                    }
                    break;
                }
            }
            if fields.len() > args_cap {
                return Err(ProtocolError::TooManyFields);
            }
        }

        if fields.len() + trailing.is_some() as usize > args_cap {
            return Err(ProtocolError::TooManyFields);
        }
        let mut fields = fields.into_iter();
        let verb = fields.next().ok_or(ProtocolError::Empty)?;
        Ok(Self {
            verb,
            args: fields.collect(),
            trailing,
        })
    }

    /// Encode to the wire form.
    pub fn encode(&self) -> String {
        let mut out = self.verb.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        if let Some(t) = &self.trailing {
            out.push_str(" :");
            out.push_str(t);
        }
        out
    }
}

// ─── Server reply constructors ───────────────────────────────────────────────
//
// The bit-exact reply forms are a contract with automated clients; build
// them in one place.

/// `Y <courseid>` — hold confirmed (or re-confirmed).
pub fn confirmed(course_id: i64) -> Message {
    Message::new("Y", &[&course_id.to_string()])
}

/// `N <courseid>` — released.
pub fn released(course_id: i64) -> Message {
    Message::new("N", &[&course_id.to_string()])
}

/// `R <courseid> :<reason>` — rejected.
pub fn rejected(course_id: i64, reason: &str) -> Message {
    Message::with_trailing("R", &[&course_id.to_string()], reason)
}

/// `M <courseid> <selected>` — current seat count.
pub fn seat_count(course_id: i64, selected: u32) -> Message {
    Message::new("M", &[&course_id.to_string(), &selected.to_string()])
}

/// `E :<reason>` — error.
pub fn error(reason: &str) -> Message {
    Message::with_trailing("E", &[], reason)
}

/// `HI :<csv of held courseids>` — welcome with current selections.
pub fn welcome(held: &[i64]) -> Message {
    let csv = held
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    Message::with_trailing("HI", &[], &csv)
}

/// `U` — unauthenticated.
pub fn unauthenticated() -> Message {
    Message::new("U", &[])
}

/// `START` — mode transitioned to open.
pub fn start() -> Message {
    Message::new("START", &[])
}

/// `STOP` — mode transitioned to frozen.
pub fn stop() -> Message {
    Message::new("STOP", &[])
}
