//! Group membership table.
//!
//! Design:
//! - Groups live in a Vec sorted lexicographically by name.
//! - join/leave: O(log N) search + O(N) insert/remove shift (group counts
//!   are small in practice).
//! - Member sets are `SmallVec`s, inline up to 4 members (common fanout).
//! - A group exists iff it has at least one member: empty groups are
//!   removed eagerly, so `names()` is exactly the `devices` answer.

use smallvec::SmallVec;

/// Compact integer ID for connected clients.
/// Unique for the lifetime of the broker process.
pub type ClientId = u64;

#[derive(Debug, Clone)]
struct Group {
    name: String,
    /// Inline up to 4 members without heap allocation.
    members: SmallVec<[ClientId; 4]>,
}

#[derive(Debug, Default)]
pub struct GroupTable {
    groups: Vec<Group>,
}

impl GroupTable {
    #[must_use]
    pub const fn new() -> Self {
        Self { groups: Vec::new() }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Add `client` to `name`, creating the group on first join.
    ///
    /// Re-joining is idempotent.
    pub fn join(&mut self, name: &str, client: ClientId) {
        match self.groups.binary_search_by(|g| g.name.as_str().cmp(name)) {
            Ok(idx) => {
                let members = &mut self.groups[idx].members;
                if !members.contains(&client) {
                    members.push(client);
                }
            }
            Err(idx) => {
                let mut members = SmallVec::<[ClientId; 4]>::new();
                members.push(client);
                self.groups.insert(
                    idx,
                    Group {
                        name: name.to_string(),
                        members,
                    },
                );
            }
        }
    }

    /// Remove `client` from `name`; the group is destroyed when its last
    /// member leaves. Leaving a group one is not in is silently ignored.
    pub fn leave(&mut self, name: &str, client: ClientId) {
        if let Ok(idx) = self.groups.binary_search_by(|g| g.name.as_str().cmp(name)) {
            let members = &mut self.groups[idx].members;
            if let Some(pos) = members.iter().position(|m| *m == client) {
                members.swap_remove(pos);
            }
            if members.is_empty() {
                self.groups.remove(idx);
            }
        }
    }

    /// True if `client` is currently a member of `name`.
    #[must_use]
    pub fn is_member(&self, name: &str, client: ClientId) -> bool {
        self.groups
            .binary_search_by(|g| g.name.as_str().cmp(name))
            .map(|idx| self.groups[idx].members.contains(&client))
            .unwrap_or(false)
    }

    /// Snapshot of the members of `name`; empty when the group does not
    /// exist.
    #[must_use]
    pub fn members_of(&self, name: &str) -> SmallVec<[ClientId; 4]> {
        match self.groups.binary_search_by(|g| g.name.as_str().cmp(name)) {
            Ok(idx) => self.groups[idx].members.clone(),
            Err(_) => SmallVec::new(),
        }
    }

    /// Names of all (necessarily non-empty) groups, lexicographically
    /// sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.name.clone()).collect()
    }
}
