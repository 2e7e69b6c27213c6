//! Decision rules of the ring election.
//!
//! A peasant that notices the king is gone sends its own candidate id
//! around the ring. Every hop forwards the larger of the carried id and its
//! own, so the node whose id returns to it unchanged is the maximum and
//! promotes itself. The rules here are pure: the node feeds them its view
//! of the ring and applies the outcome.

/// Which neighbor link to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The left neighbor.
    Left,
    /// The right neighbor.
    Right,
}

/// The names of a peasant's neighbors and of the king it knows.
#[derive(Debug, Clone, Copy)]
pub struct RingView<'a> {
    /// Left neighbor name.
    pub left: &'a str,
    /// Right neighbor name.
    pub right: &'a str,
    /// King name.
    pub king: &'a str,
}

impl<'a> RingView<'a> {
    /// Name of the neighbor on `side`.
    #[must_use]
    pub const fn name(&self, side: Side) -> &'a str {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
        }
    }

    /// The neighbor a message arriving from `previous` continues to: the
    /// right neighbor if it came from the left one, otherwise the left.
    #[must_use]
    pub fn next_side(&self, previous: &str) -> Side {
        if previous == self.left {
            Side::Right
        } else {
            Side::Left
        }
    }

    /// Like [`next_side`](Self::next_side), but never routes into the king:
    /// when that hop would be the king, the neighbor opposite it is used.
    /// With the king on both sides the result is still the king.
    #[must_use]
    pub fn election_side(&self, previous: &str) -> Side {
        let side = self.next_side(previous);
        if self.name(side) == self.king {
            self.next_side(self.king)
        } else {
            side
        }
    }
}

/// What a node does with an election message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Pass this candidate to the next hop and become a participant.
    Forward(u64),
    /// This node won; it becomes the king.
    Promote,
    /// Already participating with a larger id; swallow the message.
    Drop,
}

/// One election step.
///
/// `candidate` is the carried id, `own` this node's id. A message counts as
/// started locally when this node initiated it or when it came straight
/// from the king; such a message carrying the node's own id only promotes
/// when the ring offers no other route than back into the king.
#[must_use]
pub const fn decide(
    candidate: u64,
    own: u64,
    started_locally: bool,
    next_hop_is_king: bool,
    participant: bool,
) -> Decision {
    if candidate > own {
        Decision::Forward(candidate)
    } else if candidate == own && (!started_locally || next_hop_is_king) {
        Decision::Promote
    } else if participant {
        Decision::Drop
    } else {
        Decision::Forward(own)
    }
}
