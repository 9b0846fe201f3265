//! Per-user profile: the data a node manager keeps *about* a user rather than
//! *for* a service, mirroring the original firmware's per-user flash header
//! (starting addresses, CTR bound, nonce, favorites, change numbers, category
//! strings). No direct teacher counterpart exists (the teacher's PDDB has no
//! notion of a bound user profile); the field list is lifted straight from
//! spec §3 "User profile".

use mp_store::NodeAddr;

/// Number of display categories a node's `category_id` can take. Fixed at 4
/// (see SPEC_FULL.md §9 resolved open question): category id 0 doubles as the
/// `ALL` filter value but is also a real, assignable category.
pub const NB_MAX_CATEGORIES: u8 = 4;

/// `CategoryFilter::All` is category id 0 reinterpreted as "no filter".
pub const CATEGORY_ALL: u8 = 0;

/// Number of favorite slots per category. Not given a concrete number by the
/// spec ("a small array"); fixed here to match the per-category favorite grid
/// the original firmware's `logic_database.h` favorites table uses.
pub const NB_MAX_FAVORITES_PER_CATEGORY: usize = 4;

pub const CATEGORY_STRING_MAX_LEN: usize = 24;
pub type CategoryString = mp_store::node::FixedU16String<CATEGORY_STRING_MAX_LEN>;

pub const MAX_USERS: usize = 112;

/// A 24-bit user id, as carried on the wire.
pub type UserId = u32;

/// One favorite slot: a `(service, credential)` address pair. Both `NULL`
/// means the slot is cleared (spec §3 invariant 3, §4.4 favorites).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Favorite {
    pub service: NodeAddr,
    pub login: NodeAddr,
}

impl Favorite {
    pub const EMPTY: Favorite = Favorite { service: NodeAddr::NULL, login: NodeAddr::NULL };

    pub fn is_empty(&self) -> bool {
        self.service.is_null() && self.login.is_null()
    }
}

impl Default for Favorite {
    fn default() -> Self {
        Favorite::EMPTY
    }
}

/// Persisted per-user state (spec §3 "User profile"). The physical layout the
/// real firmware reserves in the first page of each user's node-flash region
/// is out of scope here: this struct is the in-RAM shape the node manager
/// reads and mutates, which is all C4's contract (§4.4) specifies.
#[derive(Clone)]
pub struct UserProfile {
    pub user_id: UserId,
    /// Head of the credential-parent sibling list, one per category.
    pub credential_start_parent: [NodeAddr; NB_MAX_CATEGORIES as usize],
    /// Head of the data-parent (file/note) sibling list, one per category.
    pub data_start_parent: [NodeAddr; NB_MAX_CATEGORIES as usize],
    /// Monotonic CTR upper bound (spec §3 invariant 4); kept here as a raw
    /// 24-bit big-endian value rather than `crypto::aes_ctr::Ctr` so this
    /// crate does not need to depend on `crypto` for a value type. `core`
    /// bridges the two via the `crypto::aes_ctr::CtrBound` trait.
    pub ctr_bound: [u8; 3],
    /// Per-user 128-bit nonce (spec §3).
    pub nonce: [u8; 16],
    pub favorites: [[Favorite; NB_MAX_FAVORITES_PER_CATEGORY]; NB_MAX_CATEGORIES as usize],
    pub credential_change_number: u32,
    pub data_change_number: u32,
    /// `CATEGORY_ALL` (0) means unfiltered; any other value in
    /// `[1, NB_MAX_CATEGORIES)` restricts subsequent queries to that category.
    pub category_filter: u8,
    pub category_strings: [CategoryString; NB_MAX_CATEGORIES as usize],
    /// Every raw slot this user's nodes occupy, tagged with the kind of node
    /// that slot belongs to (a child's second slot is tagged the same as its
    /// first). `check_user_permission` consults this map. Stands in for the
    /// original firmware's page-metadata ownership check, which this crate's
    /// single shared `FlashMedium` has no other way to express (see
    /// DESIGN.md).
    pub owned: std::collections::HashMap<u16, NodeKind>,
}

/// What kind of node a given owned address resolves to, returned by
/// `check_user_permission` (spec §4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Parent,
    Credential,
    Data,
}

impl UserProfile {
    /// A freshly-formatted profile, as produced by the "new user" operation
    /// (spec §3 "Lifecycles"). `nonce` must come from the caller's RNG
    /// collaborator; this constructor never reaches for randomness itself.
    pub fn new(user_id: UserId, nonce: [u8; 16]) -> UserProfile {
        UserProfile {
            user_id,
            credential_start_parent: [NodeAddr::NULL; NB_MAX_CATEGORIES as usize],
            data_start_parent: [NodeAddr::NULL; NB_MAX_CATEGORIES as usize],
            ctr_bound: [0u8; 3],
            nonce,
            favorites: Default::default(),
            credential_change_number: 0,
            data_change_number: 0,
            category_filter: CATEGORY_ALL,
            category_strings: Default::default(),
            owned: std::collections::HashMap::new(),
        }
    }

    pub fn owns(&self, addr: NodeAddr) -> bool {
        !addr.is_null() && self.owned.contains_key(&addr.raw())
    }

    pub fn kind_of(&self, addr: NodeAddr) -> Option<NodeKind> {
        self.owned.get(&addr.raw()).copied()
    }

    pub(crate) fn mark_owned(&mut self, addr: NodeAddr, slots: u8, kind: NodeKind) {
        for i in 0..slots as u16 {
            self.owned.insert(addr.raw() + i, kind);
        }
    }

    pub(crate) fn unmark_owned(&mut self, addr: NodeAddr, slots: u8) {
        for i in 0..slots as u16 {
            self.owned.remove(&(addr.raw() + i));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_profile_has_no_favorites_and_is_unfiltered() {
        let p = UserProfile::new(1, [0u8; 16]);
        assert_eq!(p.category_filter, CATEGORY_ALL);
        assert!(p.favorites[0][0].is_empty());
    }

    #[test]
    fn ownership_tracks_marked_addresses() {
        let mut p = UserProfile::new(1, [0u8; 16]);
        let addr = NodeAddr::new(0, 4);
        assert!(!p.owns(addr));
        p.mark_owned(addr, 2, NodeKind::Credential);
        assert!(p.owns(addr));
        assert!(p.owns(NodeAddr::new(0, 5)));
        assert_eq!(p.kind_of(addr), Some(NodeKind::Credential));
        p.unmark_owned(addr, 2);
        assert!(!p.owns(addr));
    }
}
