use serde::{Deserialize, Serialize};

/// Permission level of a player. Ordered: `Visitor < Builder < Admin`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    #[default]
    Visitor = 0,
    Builder = 1,
    Admin = 2,
}

impl Rank {
    pub fn from_level(level: u8) -> Option<Rank> {
        match level {
            0 => Some(Rank::Visitor),
            1 => Some(Rank::Builder),
            2 => Some(Rank::Admin),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        self as u8
    }

    /// Rank used for permission checks. Worlds flagged public treat every
    /// player as at least a builder.
    pub fn effective(self, public_world: bool) -> Rank {
        if public_world {
            self.max(Rank::Builder)
        } else {
            self
        }
    }

    pub fn is_builder(self) -> bool {
        self >= Rank::Builder
    }

    pub fn is_admin(self) -> bool {
        self >= Rank::Admin
    }

    /// Moderation only flows downwards: the actor must strictly outrank the target.
    pub fn outranks(self, target: Rank) -> bool {
        self > target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_ordering() {
        assert!(Rank::Visitor < Rank::Builder);
        assert!(Rank::Builder < Rank::Admin);
        assert_eq!(Rank::Admin.level(), 2);
        assert_eq!(Rank::from_level(1), Some(Rank::Builder));
        assert_eq!(Rank::from_level(7), None);
    }

    #[test]
    fn test_public_world_promotes_visitors() {
        assert_eq!(Rank::Visitor.effective(true), Rank::Builder);
        assert_eq!(Rank::Admin.effective(true), Rank::Admin);
        assert_eq!(Rank::Visitor.effective(false), Rank::Visitor);
    }

    #[test]
    fn test_outranks_is_strict() {
        assert!(Rank::Admin.outranks(Rank::Builder));
        assert!(!Rank::Builder.outranks(Rank::Builder));
        assert!(!Rank::Visitor.outranks(Rank::Admin));
    }
}
