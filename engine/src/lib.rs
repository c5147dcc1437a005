//! The complete rule set of the Intellector board game. This crate is pure game logic:
//! the hex board and its coordinates, the pieces, the compact position serialization ("SIP"),
//! legal move enumeration, single ply validation and ply execution.
//! Nothing here suspends or does I/O, the server crate drives it.

pub mod coords;
pub mod piece;
pub mod position;
pub mod rules;
pub mod sip;

pub use coords::{Coord, Direction};
pub use piece::{Color, Piece, PieceKind};
pub use position::{Finality, Position};
pub use rules::{Ply, PlyEffect, PlyKind};
pub use sip::{SipError, parse_sip, serialize_sip};
