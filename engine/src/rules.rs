//! Legal move enumeration, single ply validation and ply execution.
//!
//! The validator is the source of truth for every edge case: direction and
//! distance per piece kind, empty intermediate hexes for the sliders, promotion
//! versus fatum for the progressor and the aura preconditions for the coercing
//! captures. An invalid ply never mutates anything.

use crate::coords::{
    Coord, Direction, FORWARD_DIRECTIONS, LATERAL_DIRECTIONS, RADIAL_DIRECTIONS, step,
};
use crate::piece::{Color, PROMOTION_KINDS, Piece, PieceKind};
use crate::position::Position;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A half move: departure, destination and the optional morph kind.
///
/// The morph is present for progressor promotions and for aura enabled captures
/// where the captor takes over the kind of the captured piece.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ply {
    pub from: Coord,
    pub to: Coord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub morph: Option<PieceKind>,
}

/// How a ply changed the board.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlyKind {
    Normal,
    Capture,
    Swap,
}

/// The result of executing a ply.
#[derive(Debug, Clone)]
pub struct PlyEffect {
    /// The position after the ply, with the side to move flipped.
    pub position: Position,
    /// The piece that made the ply, as it stood on the departure hex.
    pub moving_piece: Piece,
    /// The piece that stood on the destination, for captures and swaps.
    pub target_piece: Option<Piece>,
    /// The classification of the ply.
    pub kind: PlyKind,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RuleError {
    #[error("no piece stands on the departure hex")]
    EmptyDeparture,
}

/// Finds the lateral direction that reaches `to` from `from` with a single step.
fn single_lateral_step(from: &Coord, to: &Coord, color: Color) -> Option<Direction> {
    LATERAL_DIRECTIONS
        .into_iter()
        .find(|dir| step(*from, *dir, color, 1) == Some(*to))
}

/// Checks if `to` is one forward lateral step away from `from`.
fn single_forward_step(from: &Coord, to: &Coord, color: Color) -> bool {
    FORWARD_DIRECTIONS
        .into_iter()
        .any(|dir| step(*from, dir, color, 1) == Some(*to))
}

/// Checks if `to` is a liberator jump away from `from`: two lateral steps into the
/// same direction. The intermediate hex does not matter.
fn lateral_jump(from: &Coord, to: &Coord, color: Color) -> bool {
    LATERAL_DIRECTIONS
        .into_iter()
        .any(|dir| step(*from, dir, color, 2) == Some(*to))
}

/// Checks if a slider on `from` reaches `to` along one of the given directions
/// with all intermediate hexes empty. The destination itself may be occupied,
/// the caller decides if that occupation is legal.
fn slide_reaches(
    position: &Position,
    from: &Coord,
    to: &Coord,
    color: Color,
    directions: &[Direction],
) -> bool {
    for dir in directions {
        let mut current = *from;
        while let Some(next) = step(current, *dir, color, 1) {
            if next == *to {
                return true;
            }
            if position.piece_at(&next).is_some() {
                break;
            }
            current = next;
        }
    }
    false
}

/// Checks the aura coerce precondition: the captor stands in the aura of its own
/// intellector and takes over the kind of the captured piece, which must be
/// neither an intellector nor the kind the captor already has.
fn aura_morph_allowed(
    position: &Position,
    captor: Piece,
    from: &Coord,
    target: Piece,
    morph: PieceKind,
) -> bool {
    morph == target.kind
        && target.kind != PieceKind::Intellector
        && target.kind != captor.kind
        && position.under_aura(from, captor.color)
}

/// Validates a single ply against the position. Returns false for every failing
/// case, the position is never touched.
pub fn is_ply_possible(position: &Position, ply: &Ply) -> bool {
    let Some(piece) = position.piece_at(&ply.from) else {
        return false;
    };
    if piece.color != position.to_move || ply.from == ply.to || !ply.to.is_valid() {
        return false;
    }
    let target = position.piece_at(&ply.to);

    if let Some(partner) = target
        && partner.color == piece.color
    {
        // A friendly destination is only legal for the defensor/intellector swap.
        let swap_pair = matches!(
            (piece.kind, partner.kind),
            (PieceKind::Defensor, PieceKind::Intellector)
                | (PieceKind::Intellector, PieceKind::Defensor)
        );
        return swap_pair
            && ply.morph.is_none()
            && single_lateral_step(&ply.from, &ply.to, piece.color).is_some();
    }

    match piece.kind {
        PieceKind::Progressor => {
            if !single_forward_step(&ply.from, &ply.to, piece.color) {
                return false;
            }
            match target {
                // Walking onto the enemy intellector is the fatum, a morph is
                // forbidden even on the final row.
                Some(t) if t.kind == PieceKind::Intellector => ply.morph.is_none(),
                _ => {
                    if Position::is_final_row(piece.color, &ply.to) {
                        matches!(ply.morph, Some(kind) if PROMOTION_KINDS.contains(&kind))
                    } else {
                        ply.morph.is_none()
                    }
                }
            }
        }
        PieceKind::Defensor => {
            if single_lateral_step(&ply.from, &ply.to, piece.color).is_none() {
                return false;
            }
            match (target, ply.morph) {
                (_, None) => true,
                (Some(t), Some(morph)) => aura_morph_allowed(position, piece, &ply.from, t, morph),
                (None, Some(_)) => false,
            }
        }
        PieceKind::Intellector => {
            // Cannot capture, the swap case was handled above.
            target.is_none()
                && ply.morph.is_none()
                && single_lateral_step(&ply.from, &ply.to, piece.color).is_some()
        }
        PieceKind::Liberator => {
            if single_lateral_step(&ply.from, &ply.to, piece.color).is_some() {
                // The short move never captures.
                return target.is_none() && ply.morph.is_none();
            }
            if !lateral_jump(&ply.from, &ply.to, piece.color) {
                return false;
            }
            match (target, ply.morph) {
                (_, None) => true,
                (Some(t), Some(morph)) => aura_morph_allowed(position, piece, &ply.from, t, morph),
                (None, Some(_)) => false,
            }
        }
        PieceKind::Aggressor => {
            if !slide_reaches(position, &ply.from, &ply.to, piece.color, &RADIAL_DIRECTIONS) {
                return false;
            }
            match (target, ply.morph) {
                (_, None) => true,
                (Some(t), Some(morph)) => aura_morph_allowed(position, piece, &ply.from, t, morph),
                (None, Some(_)) => false,
            }
        }
        PieceKind::Dominator => {
            if !slide_reaches(
                position,
                &ply.from,
                &ply.to,
                piece.color,
                &LATERAL_DIRECTIONS,
            ) {
                return false;
            }
            match (target, ply.morph) {
                (_, None) => true,
                (Some(t), Some(morph)) => aura_morph_allowed(position, piece, &ply.from, t, morph),
                (None, Some(_)) => false,
            }
        }
    }
}

/// Executes a ply. The ply is assumed to be validated, only the departure hex is
/// checked. Swaps exchange the two pieces, captures and normal moves clear the
/// departure and place the mover (or its morph kind) on the destination. The side
/// to move flips.
pub fn perform_ply(position: &Position, ply: &Ply) -> Result<PlyEffect, RuleError> {
    let moving_piece = position.piece_at(&ply.from).ok_or(RuleError::EmptyDeparture)?;
    let target_piece = position.piece_at(&ply.to);
    let mut next = position.clone();

    let kind = match target_piece {
        Some(partner) if partner.color == moving_piece.color => {
            next.put(ply.from, partner);
            next.put(ply.to, moving_piece);
            PlyKind::Swap
        }
        Some(_) => {
            next.take(&ply.from);
            let kind = ply.morph.unwrap_or(moving_piece.kind);
            next.put(ply.to, Piece::new(kind, moving_piece.color));
            PlyKind::Capture
        }
        None => {
            next.take(&ply.from);
            let kind = ply.morph.unwrap_or(moving_piece.kind);
            next.put(ply.to, Piece::new(kind, moving_piece.color));
            PlyKind::Normal
        }
    };
    next.to_move = position.to_move.opposite();

    Ok(PlyEffect {
        position: next,
        moving_piece,
        target_piece,
        kind,
    })
}

/// Enumerates every legal ply for the side to move.
pub fn available_plies(position: &Position) -> Vec<Ply> {
    let mut plies = Vec::new();
    let movers: Vec<(Coord, Piece)> = position
        .pieces()
        .filter(|(_, piece)| piece.color == position.to_move)
        .map(|(coord, piece)| (*coord, *piece))
        .collect();

    for (from, piece) in movers {
        for to in candidate_destinations(position, &from, piece) {
            for morph in candidate_morphs(position, piece, &to) {
                let ply = Ply { from, to, morph };
                if is_ply_possible(position, &ply) {
                    plies.push(ply);
                }
            }
        }
    }
    plies
}

/// The geometric destination candidates of a piece, occupancy not yet judged.
fn candidate_destinations(position: &Position, from: &Coord, piece: Piece) -> Vec<Coord> {
    let mut out = Vec::new();
    match piece.kind {
        PieceKind::Progressor => {
            for dir in FORWARD_DIRECTIONS {
                out.extend(step(*from, dir, piece.color, 1));
            }
        }
        PieceKind::Defensor | PieceKind::Intellector => {
            for dir in LATERAL_DIRECTIONS {
                out.extend(step(*from, dir, piece.color, 1));
            }
        }
        PieceKind::Liberator => {
            for dir in LATERAL_DIRECTIONS {
                out.extend(step(*from, dir, piece.color, 1));
                out.extend(step(*from, dir, piece.color, 2));
            }
        }
        PieceKind::Aggressor => ray_destinations(position, from, piece.color, &RADIAL_DIRECTIONS, &mut out),
        PieceKind::Dominator => {
            ray_destinations(position, from, piece.color, &LATERAL_DIRECTIONS, &mut out)
        }
    }
    out
}

/// Walks every ray until the first occupied hex, which is included as a candidate.
fn ray_destinations(
    position: &Position,
    from: &Coord,
    color: Color,
    directions: &[Direction],
    out: &mut Vec<Coord>,
) {
    for dir in directions {
        let mut current = *from;
        while let Some(next) = step(current, *dir, color, 1) {
            out.push(next);
            if position.piece_at(&next).is_some() {
                break;
            }
            current = next;
        }
    }
}

/// The morph candidates for a destination: no morph, the four promotion kinds for
/// a progressor and the coerce kind when an enemy piece stands on the hex.
fn candidate_morphs(position: &Position, piece: Piece, to: &Coord) -> Vec<Option<PieceKind>> {
    let mut out = vec![None];
    if piece.kind == PieceKind::Progressor && Position::is_final_row(piece.color, to) {
        out.extend(PROMOTION_KINDS.map(Some));
    }
    if let Some(target) = position.piece_at(to)
        && target.color != piece.color
        && target.kind != PieceKind::Intellector
        && target.kind != piece.kind
    {
        let coerce = Some(target.kind);
        // On a final row capture the coerce kind may already be listed as a
        // promotion, one candidate is enough.
        if !out.contains(&coerce) {
            out.push(coerce);
        }
    }
    out
}
