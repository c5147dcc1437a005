//! Contains the hex coordinates of the board and the twelve movement directions.
//! The board has 9 columns and 7 rows, the top row only exists for the even columns,
//! which gives 59 valid hexes. Odd columns sit half a hex higher than even ones, so
//! every step formula is parity sensitive in the column index.

use crate::piece::Color;
use serde::{Deserialize, Serialize};

/// The amount of columns the board has.
pub const BOARD_COLS: u8 = 9;
/// The amount of rows the board has in the even columns.
pub const BOARD_ROWS: u8 = 7;
/// The total amount of valid hexes on the board.
pub const HEX_COUNT: u8 = 59;

/// A single hex of the board addressed by column and row.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Coord {
    /// The column from left to right, 0 to 8.
    pub i: u8,
    /// The row from bottom to top, 0 to 6. Row 6 exists only in even columns.
    pub j: u8,
}

impl Coord {
    /// Builds a coordinate when it lies on the board.
    pub fn new(i: u8, j: u8) -> Option<Coord> {
        let candidate = Coord { i, j };
        candidate.is_valid().then_some(candidate)
    }

    /// Checks if the coordinate addresses one of the 59 hexes.
    pub fn is_valid(&self) -> bool {
        self.i < BOARD_COLS && self.j < BOARD_ROWS && !(self.j == 6 && self.i % 2 == 1)
    }

    /// The canonical scalar index that linearizes the board, used by the SIP codec.
    pub fn scalar(&self) -> u8 {
        9 * self.j + self.i / 2 + if self.i % 2 == 1 { 5 } else { 0 }
    }

    /// The inverse of [`Coord::scalar`].
    pub fn from_scalar(scalar: u8) -> Option<Coord> {
        let j = scalar / 9;
        let rest = scalar % 9;
        let i = if rest < 5 { 2 * rest } else { 2 * (rest - 5) + 1 };
        Coord::new(i, j)
    }

    /// Checks if the two hexes are reachable from each other with one lateral step.
    pub fn is_lateral_neighbour(&self, other: &Coord) -> bool {
        LATERAL_DIRECTIONS
            .iter()
            .any(|dir| step(*self, *dir, Color::White, 1) == Some(*other))
    }
}

/// The twelve movement directions. Three forward lateral, three backward lateral and
/// six radial ("avalanche") directions. Forward means towards the higher rows for white.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    ForwardLeft,
    ForwardRight,
    Back,
    BackLeft,
    BackRight,
    RadialEast,
    RadialWest,
    RadialNorthEast,
    RadialNorthWest,
    RadialSouthEast,
    RadialSouthWest,
}

/// All six lateral directions.
pub const LATERAL_DIRECTIONS: [Direction; 6] = [
    Direction::Forward,
    Direction::ForwardLeft,
    Direction::ForwardRight,
    Direction::Back,
    Direction::BackLeft,
    Direction::BackRight,
];

/// The three forward lateral directions.
pub const FORWARD_DIRECTIONS: [Direction; 3] = [
    Direction::Forward,
    Direction::ForwardLeft,
    Direction::ForwardRight,
];

/// All six radial directions for the avalanche sliders.
pub const RADIAL_DIRECTIONS: [Direction; 6] = [
    Direction::RadialEast,
    Direction::RadialWest,
    Direction::RadialNorthEast,
    Direction::RadialNorthWest,
    Direction::RadialSouthEast,
    Direction::RadialSouthWest,
];

impl Direction {
    /// Mirrors the direction along the forward axis. Black sees the board upside down,
    /// so its forward directions are the backward ones of white.
    fn mirrored(&self) -> Direction {
        use Direction::*;
        match self {
            Forward => Back,
            ForwardLeft => BackLeft,
            ForwardRight => BackRight,
            Back => Forward,
            BackLeft => ForwardLeft,
            BackRight => ForwardRight,
            RadialEast => RadialEast,
            RadialWest => RadialWest,
            RadialNorthEast => RadialSouthEast,
            RadialNorthWest => RadialSouthWest,
            RadialSouthEast => RadialNorthEast,
            RadialSouthWest => RadialNorthWest,
        }
    }

    /// The column and row deltas of a single step, from the white point of view.
    /// The row delta depends on the column parity because odd columns are shifted.
    fn deltas(&self, odd_column: bool) -> (i8, i8) {
        use Direction::*;
        match (self, odd_column) {
            (Forward, _) => (0, 1),
            (Back, _) => (0, -1),
            (ForwardLeft, false) => (-1, 0),
            (ForwardLeft, true) => (-1, 1),
            (ForwardRight, false) => (1, 0),
            (ForwardRight, true) => (1, 1),
            (BackLeft, false) => (-1, -1),
            (BackLeft, true) => (-1, 0),
            (BackRight, false) => (1, -1),
            (BackRight, true) => (1, 0),
            (RadialEast, _) => (2, 0),
            (RadialWest, _) => (-2, 0),
            (RadialNorthEast, false) => (1, 1),
            (RadialNorthEast, true) => (1, 2),
            (RadialNorthWest, false) => (-1, 1),
            (RadialNorthWest, true) => (-1, 2),
            (RadialSouthEast, false) => (1, -2),
            (RadialSouthEast, true) => (1, -1),
            (RadialSouthWest, false) => (-1, -2),
            (RadialSouthWest, true) => (-1, -1),
        }
    }
}

/// Walks `distance` single steps into the given direction for the given color.
/// Returns None as soon as the walk leaves the board.
pub fn step(from: Coord, direction: Direction, color: Color, distance: u8) -> Option<Coord> {
    let oriented = match color {
        Color::White => direction,
        Color::Black => direction.mirrored(),
    };
    let mut current = from;
    for _ in 0..distance {
        let (di, dj) = oriented.deltas(current.i % 2 == 1);
        let i = current.i as i8 + di;
        let j = current.j as i8 + dj;
        if i < 0 || j < 0 {
            return None;
        }
        current = Coord::new(i as u8, j as u8)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trips_over_all_hexes() {
        let mut seen = 0;
        for s in 0..HEX_COUNT {
            let coord = Coord::from_scalar(s).expect("scalar in range must map to a hex");
            assert_eq!(coord.scalar(), s);
            seen += 1;
        }
        assert_eq!(seen, 59);
        assert_eq!(Coord::from_scalar(HEX_COUNT), None);
    }

    #[test]
    fn top_row_only_exists_for_even_columns() {
        assert!(Coord::new(4, 6).is_some());
        assert!(Coord::new(5, 6).is_none());
        assert!(Coord::new(5, 5).is_some());
    }

    #[test]
    fn black_forward_is_white_back() {
        let from = Coord::new(4, 3).unwrap();
        let up = step(from, Direction::Forward, Color::White, 1).unwrap();
        let down = step(from, Direction::Forward, Color::Black, 1).unwrap();
        assert_eq!(up, Coord::new(4, 4).unwrap());
        assert_eq!(down, Coord::new(4, 2).unwrap());
    }

    #[test]
    fn lateral_steps_respect_column_parity() {
        // Even column: the upper left neighbour shares the row index.
        let even = Coord::new(4, 3).unwrap();
        assert_eq!(
            step(even, Direction::ForwardLeft, Color::White, 1),
            Coord::new(3, 3)
        );
        // Odd column: the upper left neighbour is one row up.
        let odd = Coord::new(3, 3).unwrap();
        assert_eq!(
            step(odd, Direction::ForwardLeft, Color::White, 1),
            Coord::new(2, 4)
        );
    }

    #[test]
    fn radial_steps_skip_over_the_lateral_ring() {
        let from = Coord::new(4, 3).unwrap();
        assert_eq!(
            step(from, Direction::RadialEast, Color::White, 1),
            Coord::new(6, 3)
        );
        assert_eq!(
            step(from, Direction::RadialNorthEast, Color::White, 1),
            Coord::new(5, 4)
        );
        assert_eq!(
            step(from, Direction::RadialSouthEast, Color::White, 1),
            Coord::new(5, 1)
        );
    }

    #[test]
    fn walking_off_the_board_yields_none() {
        let corner = Coord::new(0, 0).unwrap();
        assert_eq!(step(corner, Direction::Back, Color::White, 1), None);
        assert_eq!(step(corner, Direction::RadialWest, Color::White, 1), None);
        assert_eq!(step(corner, Direction::Forward, Color::White, 7), None);
    }

    #[test]
    fn lateral_neighbours_are_symmetric() {
        let a = Coord::new(4, 3).unwrap();
        let b = Coord::new(5, 3).unwrap();
        assert!(a.is_lateral_neighbour(&b));
        assert!(b.is_lateral_neighbour(&a));
        let far = Coord::new(6, 3).unwrap();
        assert!(!a.is_lateral_neighbour(&far));
    }
}
