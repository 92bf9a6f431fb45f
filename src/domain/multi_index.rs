// Bijective three-way index over the player identity triple.

use crate::domain::battle::PlayerIdentity;
use std::collections::HashMap;

/// Errors returned by [`PlayerIndex`] mutations.
#[derive(Debug, PartialEq, Eq)]
pub enum IndexError {
    /// Part of the triple is already mapped to a different identity.
    PartialCollision,
}

/// Bijective mapping across {userId, name, playerNumber} for one battle.
///
/// Inserting an identity whose triple is already present in full is a no-op;
/// inserting one that collides on only some fields is an error.
#[derive(Debug, Default)]
pub struct PlayerIndex {
    by_user_id: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
    by_number: HashMap<u8, usize>,
    entries: Vec<PlayerIdentity>,
}

impl PlayerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identity: PlayerIdentity) -> Result<(), IndexError> {
        let slots = [
            self.by_user_id.get(&identity.user_id).copied(),
            self.by_name.get(&identity.name).copied(),
            self.by_number.get(&identity.player_number).copied(),
        ];

        if slots.iter().all(Option::is_none) {
            let slot = self.entries.len();
            self.by_user_id.insert(identity.user_id.clone(), slot);
            self.by_name.insert(identity.name.clone(), slot);
            self.by_number.insert(identity.player_number, slot);
            self.entries.push(identity);
            return Ok(());
        }

        // Re-inserting the exact same triple is allowed; anything else is a
        // collision on a subset of the fields.
        match slots {
            [Some(a), Some(b), Some(c)] if a == b && b == c => Ok(()),
            _ => Err(IndexError::PartialCollision),
        }
    }

    pub fn get_by_user_id(&self, user_id: &str) -> Option<&PlayerIdentity> {
        self.by_user_id.get(user_id).map(|&slot| &self.entries[slot])
    }

    pub fn get_by_name(&self, name: &str) -> Option<&PlayerIdentity> {
        self.by_name.get(name).map(|&slot| &self.entries[slot])
    }

    pub fn get_by_number(&self, player_number: u8) -> Option<&PlayerIdentity> {
        self.by_number
            .get(&player_number)
            .map(|&slot| &self.entries[slot])
    }

    pub fn has_user_id(&self, user_id: &str) -> bool {
        self.by_user_id.contains_key(user_id)
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn remove_by_user_id(&mut self, user_id: &str) -> Option<PlayerIdentity> {
        let slot = self.by_user_id.get(user_id).copied()?;
        let identity = self.entries[slot].clone();
        self.by_user_id.remove(&identity.user_id);
        self.by_name.remove(&identity.name);
        self.by_number.remove(&identity.player_number);

        // Swap-remove and patch the indexes of the entry that moved.
        self.entries.swap_remove(slot);
        if slot < self.entries.len() {
            let moved = self.entries[slot].clone();
            self.by_user_id.insert(moved.user_id, slot);
            self.by_name.insert(moved.name, slot);
            self.by_number.insert(moved.player_number, slot);
        }
        Some(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(user_id: &str, name: &str, player_number: u8) -> PlayerIdentity {
        PlayerIdentity {
            user_id: user_id.to_string(),
            name: name.to_string(),
            player_number,
        }
    }

    #[test]
    fn insert_and_lookup_all_three_ways() {
        let mut index = PlayerIndex::new();
        index.insert(identity("u1", "Alice", 0)).unwrap();
        index.insert(identity("u2", "Bob", 1)).unwrap();

        assert_eq!(index.get_by_user_id("u2").unwrap().name, "Bob");
        assert_eq!(index.get_by_name("Alice").unwrap().player_number, 0);
        assert_eq!(index.get_by_number(1).unwrap().user_id, "u2");
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn reinserting_whole_triple_is_a_noop() {
        let mut index = PlayerIndex::new();
        index.insert(identity("u1", "Alice", 0)).unwrap();
        index.insert(identity("u1", "Alice", 0)).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn partial_collision_is_rejected() {
        let mut index = PlayerIndex::new();
        index.insert(identity("u1", "Alice", 0)).unwrap();

        assert_eq!(
            index.insert(identity("u1", "Eve", 1)),
            Err(IndexError::PartialCollision)
        );
        assert_eq!(
            index.insert(identity("u2", "Alice", 1)),
            Err(IndexError::PartialCollision)
        );
        assert_eq!(
            index.insert(identity("u2", "Eve", 0)),
            Err(IndexError::PartialCollision)
        );
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn remove_keeps_remaining_lookups_consistent() {
        let mut index = PlayerIndex::new();
        index.insert(identity("u1", "Alice", 0)).unwrap();
        index.insert(identity("u2", "Bob", 1)).unwrap();
        index.insert(identity("u3", "Carol", 2)).unwrap();

        let removed = index.remove_by_user_id("u1").unwrap();
        assert_eq!(removed.name, "Alice");
        assert!(!index.has_name("Alice"));
        assert_eq!(index.get_by_number(2).unwrap().user_id, "u3");
        assert_eq!(index.get_by_name("Bob").unwrap().player_number, 1);
        assert_eq!(index.len(), 2);
    }
}
