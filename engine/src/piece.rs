//! The piece model. Pieces are plain values without identity, a position maps
//! hexes to pieces.

use serde::{Deserialize, Serialize};

/// The two sides of the game.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    White,
    Black,
}

impl Color {
    /// The other side.
    pub fn opposite(&self) -> Color {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }

    /// The single letter used by the SIP codec.
    pub fn sip_letter(&self) -> char {
        match self {
            Color::White => 'w',
            Color::Black => 'b',
        }
    }

    /// Parses the SIP side letter.
    pub fn from_sip_letter(letter: char) -> Option<Color> {
        match letter {
            'w' => Some(Color::White),
            'b' => Some(Color::Black),
            _ => None,
        }
    }
}

/// The six piece kinds of Intellector.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PieceKind {
    Progressor,
    Aggressor,
    Defensor,
    Liberator,
    Dominator,
    Intellector,
}

/// The four kinds a progressor may promote into on the final row.
pub const PROMOTION_KINDS: [PieceKind; 4] = [
    PieceKind::Aggressor,
    PieceKind::Defensor,
    PieceKind::Liberator,
    PieceKind::Dominator,
];

impl PieceKind {
    /// The single letter used by the SIP codec.
    pub fn sip_letter(&self) -> char {
        match self {
            PieceKind::Progressor => 'r',
            PieceKind::Aggressor => 'g',
            PieceKind::Defensor => 'e',
            PieceKind::Liberator => 'i',
            PieceKind::Dominator => 'o',
            PieceKind::Intellector => 'n',
        }
    }

    /// Parses the SIP piece letter.
    pub fn from_sip_letter(letter: char) -> Option<PieceKind> {
        match letter {
            'r' => Some(PieceKind::Progressor),
            'g' => Some(PieceKind::Aggressor),
            'e' => Some(PieceKind::Defensor),
            'i' => Some(PieceKind::Liberator),
            'o' => Some(PieceKind::Dominator),
            'n' => Some(PieceKind::Intellector),
            _ => None,
        }
    }
}

/// A piece as it stands on a hex.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Piece {
    /// What the piece is.
    pub kind: PieceKind,
    /// Which side owns it.
    pub color: Color,
}

impl Piece {
    pub fn new(kind: PieceKind, color: Color) -> Piece {
        Piece { kind, color }
    }
}
