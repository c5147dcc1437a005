//! The position model: a mapping from hexes to pieces plus the side to move,
//! the default starting arrangement and the finality classification.

use crate::coords::Coord;
use crate::piece::{Color, Piece, PieceKind};
use std::collections::HashMap;

/// A full board position. Keys are unique hexes, values the pieces standing on them.
#[derive(PartialEq, Debug, Clone)]
pub struct Position {
    cells: HashMap<Coord, Piece>,
    /// The side that makes the next ply.
    pub to_move: Color,
}

/// The classification of a position after a ply was executed.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Finality {
    /// An ordinary position, the game goes on.
    ValidNonFinal,
    /// Only one intellector is left on the board, the other one was just captured.
    Fatum { winner: Color },
    /// Both intellectors are present but one reached its own final row.
    Breakthrough { winner: Color },
    /// The position breaks an invariant: wrong intellector count or two
    /// simultaneous breakthroughs.
    Invalid,
}

impl Position {
    /// An empty board with the given side to move.
    pub fn empty(to_move: Color) -> Position {
        Position {
            cells: HashMap::new(),
            to_move,
        }
    }

    /// The default starting arrangement, white to move.
    ///
    /// Each side has one intellector in the middle of its back edge, flanked by the
    /// defensors, aggressors, liberators and dominators, with five progressors one
    /// row in front on the even columns.
    pub fn initial() -> Position {
        use PieceKind::*;
        let mut position = Position::empty(Color::White);
        let back_rank: [(u8, PieceKind); 9] = [
            (0, Dominator),
            (1, Liberator),
            (2, Aggressor),
            (3, Defensor),
            (4, Intellector),
            (5, Defensor),
            (6, Aggressor),
            (7, Liberator),
            (8, Dominator),
        ];
        for (i, kind) in back_rank {
            // White back edge is row 0 everywhere, the black one is row 6 in the
            // even columns and row 5 in the odd ones.
            position.put(Coord { i, j: 0 }, Piece::new(kind, Color::White));
            let j = if i % 2 == 0 { 6 } else { 5 };
            position.put(Coord { i, j }, Piece::new(kind, Color::Black));
        }
        for i in [0, 2, 4, 6, 8] {
            position.put(Coord { i, j: 1 }, Piece::new(Progressor, Color::White));
            position.put(Coord { i, j: 5 }, Piece::new(Progressor, Color::Black));
        }
        position
    }

    /// The piece standing on the hex, if any.
    pub fn piece_at(&self, coord: &Coord) -> Option<Piece> {
        self.cells.get(coord).copied()
    }

    /// Puts a piece on a hex, replacing whatever stood there.
    pub fn put(&mut self, coord: Coord, piece: Piece) {
        self.cells.insert(coord, piece);
    }

    /// Clears a hex and returns what stood there.
    pub fn take(&mut self, coord: &Coord) -> Option<Piece> {
        self.cells.remove(coord)
    }

    /// All occupied hexes with their pieces, in no particular order.
    pub fn pieces(&self) -> impl Iterator<Item = (&Coord, &Piece)> {
        self.cells.iter()
    }

    /// The amount of pieces on the board.
    pub fn piece_count(&self) -> usize {
        self.cells.len()
    }

    /// Checks if the hex lies on the final row of the given color. That is the
    /// opposite back edge, the one the progressors promote on and the intellector
    /// wins on by breakthrough.
    pub fn is_final_row(color: Color, coord: &Coord) -> bool {
        match color {
            Color::White => coord.j == if coord.i % 2 == 0 { 6 } else { 5 },
            Color::Black => coord.j == 0,
        }
    }

    /// Where the intellector of the given color stands, if it is on the board.
    pub fn intellector_position(&self, color: Color) -> Option<Coord> {
        self.cells
            .iter()
            .find(|(_, piece)| piece.kind == PieceKind::Intellector && piece.color == color)
            .map(|(coord, _)| *coord)
    }

    /// Checks if a hex lies in the aura of the given color, which means lateral
    /// adjacent to the intellector of that color.
    pub fn under_aura(&self, coord: &Coord, color: Color) -> bool {
        self.intellector_position(color)
            .is_some_and(|intellector| intellector.is_lateral_neighbour(coord))
    }

    /// Classifies the position, see [`Finality`].
    pub fn finality(&self) -> Finality {
        let intellectors: Vec<(Coord, Color)> = self
            .cells
            .iter()
            .filter(|(_, piece)| piece.kind == PieceKind::Intellector)
            .map(|(coord, piece)| (*coord, piece.color))
            .collect();

        match intellectors[..] {
            [(_, survivor)] => Finality::Fatum { winner: survivor },
            [(first_coord, first), (second_coord, second)] => {
                if first == second {
                    return Finality::Invalid;
                }
                let first_through = Position::is_final_row(first, &first_coord);
                let second_through = Position::is_final_row(second, &second_coord);
                match (first_through, second_through) {
                    (false, false) => Finality::ValidNonFinal,
                    (true, false) => Finality::Breakthrough { winner: first },
                    (false, true) => Finality::Breakthrough { winner: second },
                    (true, true) => Finality::Invalid,
                }
            }
            _ => Finality::Invalid,
        }
    }
}
