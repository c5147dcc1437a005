//! The SIP codec ("Short Intellector Position"), the deterministic compact
//! serialization of a position.
//!
//! Two versions exist on the wire. Version 1 has no version prefix: the side
//! letter followed by the white pieces, a `!`, then the black pieces, every piece
//! a scalar character (ASCII 64 + scalar) and a piece letter. Version 2 carries a
//! `2!` prefix and packs scalars into the alphabet: 0-25 as `A`-`Z`, 26-51 as
//! `a`-`z`, 52 and up as `0`-`9`. The parser sniffs the version, the serializer
//! always emits version 2.

use crate::coords::Coord;
use crate::piece::{Color, Piece};
use crate::piece::PieceKind;
use crate::position::Position;
use itertools::Itertools;
use thiserror::Error;

/// Everything that can go wrong while parsing a SIP string.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SipError {
    #[error("unsupported sip version {0}")]
    UnsupportedVersion(String),
    #[error("sip string has a wrong part count")]
    WrongPartCount,
    #[error("missing or unknown side letter")]
    BadSideLetter,
    #[error("piece entry is truncated")]
    TruncatedPiece,
    #[error("unknown piece letter {0}")]
    BadPieceLetter(char),
    #[error("scalar character {0} addresses no hex")]
    BadScalar(char),
    #[error("hex occupied twice")]
    DuplicateHex,
}

/// Serializes a position as a version 2 SIP string.
pub fn serialize_sip(position: &Position) -> String {
    let mut out = String::from("2!");
    out.push(position.to_move.sip_letter());
    out.push_str(&color_part_v2(position, Color::White));
    out.push('!');
    out.push_str(&color_part_v2(position, Color::Black));
    out
}

/// Serializes the pieces of one color in scalar coordinate order.
fn color_part_v2(position: &Position, color: Color) -> String {
    position
        .pieces()
        .filter(|(_, piece)| piece.color == color)
        .sorted_by_key(|(coord, _)| coord.scalar())
        .map(|(coord, piece)| {
            let mut entry = String::new();
            entry.push(scalar_to_char_v2(coord.scalar()));
            entry.push(piece.kind.sip_letter());
            entry
        })
        .collect()
}

fn scalar_to_char_v2(scalar: u8) -> char {
    match scalar {
        0..=25 => (b'A' + scalar) as char,
        26..=51 => (b'a' + scalar - 26) as char,
        _ => (b'0' + scalar - 52) as char,
    }
}

fn char_to_scalar_v2(symbol: char) -> Option<u8> {
    match symbol {
        'A'..='Z' => Some(symbol as u8 - b'A'),
        'a'..='z' => Some(symbol as u8 - b'a' + 26),
        '0'..='9' => Some(symbol as u8 - b'0' + 52),
        _ => None,
    }
}

fn char_to_scalar_v1(symbol: char) -> Option<u8> {
    let raw = symbol as u32;
    if (64..64 + 59).contains(&raw) {
        Some((raw - 64) as u8)
    } else {
        None
    }
}

/// Parses a SIP string of either version.
pub fn parse_sip(sip: &str) -> Result<Position, SipError> {
    let parts: Vec<&str> = sip.split('!').collect();
    if parts.len() == 2 {
        // No version prefix: version 1. The side letter leads the first part.
        return parse_body(parts[0], parts[1], char_to_scalar_v1);
    }
    match parts.first().copied() {
        Some("2") if parts.len() == 3 => parse_body(parts[1], parts[2], char_to_scalar_v2),
        Some(version) => Err(SipError::UnsupportedVersion(version.to_string())),
        None => Err(SipError::WrongPartCount),
    }
}

/// Parses the side letter plus both piece arrangements with the version specific
/// scalar decoding.
fn parse_body(
    side_and_white: &str,
    black: &str,
    to_scalar: fn(char) -> Option<u8>,
) -> Result<Position, SipError> {
    let mut chars = side_and_white.chars();
    let side = chars
        .next()
        .and_then(Color::from_sip_letter)
        .ok_or(SipError::BadSideLetter)?;
    let mut position = Position::empty(side);
    parse_color_part(&mut position, chars.as_str(), Color::White, to_scalar)?;
    parse_color_part(&mut position, black, Color::Black, to_scalar)?;
    Ok(position)
}

fn parse_color_part(
    position: &mut Position,
    part: &str,
    color: Color,
    to_scalar: fn(char) -> Option<u8>,
) -> Result<(), SipError> {
    let mut chars = part.chars();
    while let Some(scalar_char) = chars.next() {
        let piece_char = chars.next().ok_or(SipError::TruncatedPiece)?;
        let scalar = to_scalar(scalar_char).ok_or(SipError::BadScalar(scalar_char))?;
        let coord = Coord::from_scalar(scalar).ok_or(SipError::BadScalar(scalar_char))?;
        let kind =
            PieceKind::from_sip_letter(piece_char).ok_or(SipError::BadPieceLetter(piece_char))?;
        if position.piece_at(&coord).is_some() {
            return Err(SipError::DuplicateHex);
        }
        position.put(coord, Piece::new(kind, color));
    }
    Ok(())
}

/// Only reads the side to move out of a SIP string, without building the position.
pub fn side_to_move(sip: &str) -> Result<Color, SipError> {
    let parts: Vec<&str> = sip.split('!').collect();
    let lead = if parts.len() == 2 {
        parts[0]
    } else if parts.len() == 3 && parts[0] == "2" {
        parts[1]
    } else {
        return Err(SipError::WrongPartCount);
    };
    lead.chars()
        .next()
        .and_then(Color::from_sip_letter)
        .ok_or(SipError::BadSideLetter)
}
