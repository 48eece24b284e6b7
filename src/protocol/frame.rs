// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Reader command frame parsing and response building.
//!
//! Frames follow the ISO-7816 shape: class/instruction header, a length
//! field, a payload. Exactly two status words exist; every response is a
//! complete frame ending in one of them.
//!
//! ## Recognized commands
//!
//! - SELECT: `00 A4 04 00 ...` (application select by identifier)
//! - CHALLENGE: `80 84 xx xx Lc <challenge>` (keyed challenge-response)
//! - DEDUCT-FARE: `80 10 xx xx 04 <fare BE u32>`

/// Success status word.
pub const SW_SUCCESS: [u8; 2] = [0x90, 0x00];

/// Failure status word. The only other defined status.
pub const SW_FAILURE: [u8; 2] = [0x69, 0x85];

/// Fixed acknowledgement body returned to SELECT.
pub const SELECT_ACK: &[u8] = b"FARE_OK";

/// Offset of the length field in a command frame.
const LC_OFFSET: usize = 4;

/// Payload starts right after the length field.
const PAYLOAD_OFFSET: usize = 5;

/// A parsed logical command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// Application select; the body is answered with a fixed ack.
    Select,
    /// Keyed challenge-response over the presented random bytes.
    Challenge(&'a [u8]),
    /// Fare deduction request, amount in minor units.
    DeductFare(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short")]
    TooShort,

    #[error("unknown command class/instruction")]
    UnknownCommand,

    #[error("length field inconsistent with frame size")]
    BadLength,
}

/// Parse a raw frame into a logical command.
///
/// Rejects short frames, unknown class/instruction pairs, and length fields
/// that disagree with the actual frame size. Never panics.
pub fn parse(frame: &[u8]) -> Result<Command<'_>, FrameError> {
    if frame.len() < 4 {
        return Err(FrameError::TooShort);
    }

    // SELECT by application identifier
    if frame[0] == 0x00 && frame[1] == 0xA4 && frame[2] == 0x04 && frame[3] == 0x00 {
        return Ok(Command::Select);
    }

    match (frame[0], frame[1]) {
        (0x80, 0x84) => {
            if frame.len() < PAYLOAD_OFFSET + 1 {
                return Err(FrameError::TooShort);
            }
            let lc = frame[LC_OFFSET] as usize;
            if lc == 0 || frame.len() < PAYLOAD_OFFSET + lc {
                return Err(FrameError::BadLength);
            }
            Ok(Command::Challenge(&frame[PAYLOAD_OFFSET..PAYLOAD_OFFSET + lc]))
        }
        (0x80, 0x10) => {
            if frame.len() < PAYLOAD_OFFSET + 4 {
                return Err(FrameError::TooShort);
            }
            let lc = frame[LC_OFFSET] as usize;
            if lc != 4 || frame.len() < PAYLOAD_OFFSET + lc {
                return Err(FrameError::BadLength);
            }
            let fare = u32::from_be_bytes([
                frame[PAYLOAD_OFFSET],
                frame[PAYLOAD_OFFSET + 1],
                frame[PAYLOAD_OFFSET + 2],
                frame[PAYLOAD_OFFSET + 3],
            ]);
            Ok(Command::DeductFare(fare))
        }
        _ => Err(FrameError::UnknownCommand),
    }
}

/// Build a success response: body bytes followed by `SW_SUCCESS`.
pub fn success(body: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(body.len() + 2);
    response.extend_from_slice(body);
    response.extend_from_slice(&SW_SUCCESS);
    response
}

/// Build the fixed failure response (`SW_FAILURE` only).
pub fn failure() -> Vec<u8> {
    SW_FAILURE.to_vec()
}
