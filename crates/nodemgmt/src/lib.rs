//! Node manager (C4): typed graph operations over [`mp_store`]'s flash node
//! store — parent/child creation and deletion with sibling-list maintenance,
//! favorites, categories, change numbers, free-slot allocation, and the
//! per-user ownership check. Grounded on spec §4.4 plus the original
//! firmware's `logic_database.h`/`logic_device.h` constants; styled after
//! `mp_store`'s `Result`/`Error` conventions (no teacher file implements this
//! directly — the teacher's PDDB store has no node-graph concept).

pub mod profile;
pub mod search;

use mp_store::node::{
    ChildNode, CredentialChild, CredentialTypeId, DataCategory, DataChild, DescriptionString,
    LoginString, ParentKind, ParentNode, ServiceName, ThirdFieldString, MAX_PASSWORD_LEN,
};
use mp_store::{FlashMedium, FlashStore, NodeAddr};

pub use profile::{
    CategoryString, Favorite, NodeKind, UserId, UserProfile, CATEGORY_ALL, NB_MAX_CATEGORIES,
    NB_MAX_FAVORITES_PER_CATEGORY,
};
pub use search::SearchMode;

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Store(mp_store::Error),
    UnknownUser,
    /// Address did not resolve to a node owned by the calling user (spec
    /// §4.4 `check_user_permission`).
    PermissionDenied,
    /// A sibling or child list's `prev`/`next` pointers form a cycle.
    MalformedGraph,
    CategoryInvalid,
    /// `SET_CUR_CATEGORY` rejected: a category is already selected (spec
    /// §9 resolved open question — one-shot latch).
    CategoryAlreadySelected,
    FavoriteSlotInvalid,
    /// Free-slot allocation could not satisfy the request (spec §7 `StorageFull`).
    StorageFull,
    NotFound,
    MaxUsersReached,
}

impl From<mp_store::Error> for Error {
    fn from(e: mp_store::Error) -> Self {
        Error::Store(e)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Store(e) => write!(f, "store error: {:?}", e),
            Error::UnknownUser => write!(f, "unknown user id"),
            Error::PermissionDenied => write!(f, "address not owned by calling user"),
            Error::MalformedGraph => write!(f, "malformed node graph (cycle detected)"),
            Error::CategoryInvalid => write!(f, "category id out of range"),
            Error::CategoryAlreadySelected => write!(f, "a category is already selected"),
            Error::FavoriteSlotInvalid => write!(f, "favorite category/slot out of range"),
            Error::StorageFull => write!(f, "no free node slots available"),
            Error::NotFound => write!(f, "node not found"),
            Error::MaxUsersReached => write!(f, "no free user id slots"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

pub struct NodeManager<M: FlashMedium> {
    store: FlashStore<M>,
    profiles: HashMap<UserId, UserProfile>,
    next_user_id: UserId,
}

impl<M: FlashMedium> NodeManager<M> {
    pub fn new(medium: M) -> NodeManager<M> {
        NodeManager { store: FlashStore::new(medium), profiles: HashMap::new(), next_user_id: 0 }
    }

    pub fn store(&self) -> &FlashStore<M> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut FlashStore<M> {
        &mut self.store
    }

    pub fn profile(&self, uid: UserId) -> Result<&UserProfile> {
        self.profiles.get(&uid).ok_or(Error::UnknownUser)
    }

    pub fn profile_mut(&mut self, uid: UserId) -> Result<&mut UserProfile> {
        self.profiles.get_mut(&uid).ok_or(Error::UnknownUser)
    }

    /// Format and bind a new user profile (spec §3 "Lifecycles"). Returns the
    /// freshly allocated 24-bit user id.
    pub fn new_user(&mut self, nonce: [u8; 16]) -> Result<UserId> {
        if self.profiles.len() >= profile::MAX_USERS {
            return Err(Error::MaxUsersReached);
        }
        let uid = self.next_user_id;
        self.next_user_id += 1;
        self.profiles.insert(uid, UserProfile::new(uid, nonce));
        Ok(uid)
    }

    /// Tear down a user entirely: every node it owns becomes unreachable and
    /// its flash slots are erased (spec §8 I6). The CPZ-LUT entry removal is
    /// `core`'s responsibility (C8), not this crate's.
    pub fn erase_user(&mut self, uid: UserId) -> Result<()> {
        let owned: Vec<(u16, NodeKind)> = {
            let profile = self.profile(uid)?;
            profile.owned.iter().map(|(&addr, &kind)| (addr, kind)).collect()
        };
        // Erase only the primary slot of each node once (children occupy two
        // raw slots but both are tagged the same kind in `owned`); re-erasing
        // an already-erased slot is harmless so no special-casing is needed
        // beyond avoiding a second `erase_node` call per address pair.
        let mut erased = std::collections::HashSet::new();
        for (raw, _) in owned {
            if erased.insert(raw) {
                let _ = self.store.erase_node(NodeAddr::from_raw(raw), 1);
            }
        }
        self.profiles.remove(&uid);
        Ok(())
    }

    pub fn check_user_permission(&self, uid: UserId, addr: NodeAddr) -> Result<NodeKind> {
        let profile = self.profile(uid)?;
        profile.kind_of(addr).ok_or(Error::PermissionDenied)
    }

    pub fn scan_node_usage(&self) -> mp_store::NodeUsage {
        self.store.scan_node_usage()
    }

    pub fn allocate_free_slots(&self, want: u8, exclude: Option<NodeAddr>) -> Result<Vec<NodeAddr>> {
        let mut out = Vec::with_capacity(want as usize);
        for _ in 0..want {
            match self.store.allocate_free_slots(1, exclude) {
                Some(addr) => out.push(addr),
                None => return Err(Error::StorageFull),
            }
        }
        Ok(out)
    }

    // ---- favorites ----------------------------------------------------

    pub fn get_favorite(&self, uid: UserId, category: u8, slot: usize) -> Result<Favorite> {
        let profile = self.profile(uid)?;
        profile
            .favorites
            .get(category as usize)
            .and_then(|row| row.get(slot))
            .copied()
            .ok_or(Error::FavoriteSlotInvalid)
    }

    /// Set a favorite slot. `(NULL, NULL)` clears it (spec §3 invariant 3);
    /// any non-null pair must resolve to nodes this user owns.
    pub fn set_favorite(&mut self, uid: UserId, category: u8, slot: usize, fav: Favorite) -> Result<()> {
        if !fav.is_empty() {
            let profile = self.profile(uid)?;
            if !fav.service.is_null() && !profile.owns(fav.service) {
                return Err(Error::PermissionDenied);
            }
            if !fav.login.is_null() && !profile.owns(fav.login) {
                return Err(Error::PermissionDenied);
            }
        }
        let profile = self.profile_mut(uid)?;
        let row = profile.favorites.get_mut(category as usize).ok_or(Error::FavoriteSlotInvalid)?;
        let cell = row.get_mut(slot).ok_or(Error::FavoriteSlotInvalid)?;
        *cell = fav;
        Ok(())
    }

    /// All non-empty favorites, each already verified against
    /// `check_user_permission` (spec §8 I5).
    pub fn get_favorites(&self, uid: UserId) -> Result<Vec<(u8, usize, Favorite)>> {
        let profile = self.profile(uid)?;
        let mut out = Vec::new();
        for (cat, row) in profile.favorites.iter().enumerate() {
            for (slot, fav) in row.iter().enumerate() {
                if fav.is_empty() {
                    continue;
                }
                if !fav.service.is_null() && !profile.owns(fav.service) {
                    continue;
                }
                if !fav.login.is_null() && !profile.owns(fav.login) {
                    continue;
                }
                out.push((cat as u8, slot, *fav));
            }
        }
        Ok(out)
    }

    // ---- change numbers -------------------------------------------------

    pub fn credential_change_number(&self, uid: UserId) -> Result<u32> {
        Ok(self.profile(uid)?.credential_change_number)
    }

    pub fn set_credential_change_number(&mut self, uid: UserId, value: u32) -> Result<()> {
        self.profile_mut(uid)?.credential_change_number = value;
        Ok(())
    }

    pub fn data_change_number(&self, uid: UserId) -> Result<u32> {
        Ok(self.profile(uid)?.data_change_number)
    }

    pub fn set_data_change_number(&mut self, uid: UserId, value: u32) -> Result<()> {
        self.profile_mut(uid)?.data_change_number = value;
        Ok(())
    }

    fn bump_credential_change_number(&mut self, uid: UserId) -> Result<()> {
        let profile = self.profile_mut(uid)?;
        profile.credential_change_number = profile.credential_change_number.wrapping_add(1);
        Ok(())
    }

    fn bump_data_change_number(&mut self, uid: UserId) -> Result<()> {
        let profile = self.profile_mut(uid)?;
        profile.data_change_number = profile.data_change_number.wrapping_add(1);
        Ok(())
    }

    // ---- categories -------------------------------------------------

    pub fn category_string(&self, uid: UserId, category: u8) -> Result<CategoryString> {
        let profile = self.profile(uid)?;
        profile
            .category_strings
            .get(category as usize)
            .copied()
            .ok_or(Error::CategoryInvalid)
    }

    pub fn set_category_string(&mut self, uid: UserId, category: u8, value: CategoryString) -> Result<()> {
        let profile = self.profile_mut(uid)?;
        let cell = profile.category_strings.get_mut(category as usize).ok_or(Error::CategoryInvalid)?;
        *cell = value;
        Ok(())
    }

    pub fn current_category(&self, uid: UserId) -> Result<u8> {
        Ok(self.profile(uid)?.category_filter)
    }

    /// `SET_CUR_CATEGORY`: a one-shot latch (spec §9 resolved open question).
    /// Clearing back to `CATEGORY_ALL` is always allowed; selecting a
    /// specific category is only allowed when none is currently selected.
    pub fn set_current_category(&mut self, uid: UserId, category: u8) -> Result<()> {
        if category != CATEGORY_ALL && category >= NB_MAX_CATEGORIES {
            return Err(Error::CategoryInvalid);
        }
        let profile = self.profile_mut(uid)?;
        if category != CATEGORY_ALL && profile.category_filter != CATEGORY_ALL {
            return Err(Error::CategoryAlreadySelected);
        }
        profile.category_filter = category;
        Ok(())
    }

    // ---- credential / data mutation -------------------------------------

    /// Find or create the service parent for `service` under `category`
    /// (spec §4.5 "create the service parent if absent"), then create or
    /// update the `login` child under it. `desc`/`third`/`password_ciphertext
    /// = None` means "do not modify this field" on an existing child.
    pub fn store_credential(
        &mut self,
        uid: UserId,
        service: &ServiceName,
        login: &LoginString,
        desc: Option<DescriptionString>,
        third: Option<ThirdFieldString>,
        password_ciphertext: Option<[u8; MAX_PASSWORD_LEN]>,
    ) -> Result<NodeAddr> {
        self.store_credential_in_category(uid, service, login, desc, third, password_ciphertext, CATEGORY_ALL)
    }

    pub fn store_credential_in_category(
        &mut self,
        uid: UserId,
        service: &ServiceName,
        login: &LoginString,
        desc: Option<DescriptionString>,
        third: Option<ThirdFieldString>,
        password_ciphertext: Option<[u8; MAX_PASSWORD_LEN]>,
        category: u8,
    ) -> Result<NodeAddr> {
        let category = if category == CATEGORY_ALL { 0 } else { category };
        let parent_addr =
            self.find_or_create_parent(uid, ParentKind::Credential, service, category)?;

        if let Some(existing) =
            search::find_login(&self.store, self.profile(uid)?, parent_addr, login, false)?
        {
            let mut child = self.store.read_child(existing)?;
            if let Some(cred) = child.as_credential_mut() {
                if let Some(d) = desc {
                    cred.description = d;
                }
                if let Some(t) = third {
                    cred.third_field = t;
                }
                if let Some(pw) = password_ciphertext {
                    cred.password_ciphertext = pw;
                }
            }
            self.store.write_child(existing, &child, password_ciphertext.is_none())?;
            self.bump_credential_change_number(uid)?;
            return Ok(existing);
        }

        let child_addr = self.allocate_owned(uid, 2, NodeKind::Credential)?;
        let cred = CredentialChild {
            parent: parent_addr,
            prev: NodeAddr::NULL,
            next: NodeAddr::NULL,
            login: *login,
            description: desc.unwrap_or_default(),
            third_field: third.unwrap_or_default(),
            password_ciphertext: password_ciphertext.unwrap_or([0u8; MAX_PASSWORD_LEN]),
            ctr: [0u8; 3],
            prev_gen: false,
            totp: None,
            cred_type: CredentialTypeId::Standard,
            webauthn: None,
        };
        self.push_child(parent_addr, child_addr, ChildNode::Credential(cred))?;
        self.bump_credential_change_number(uid)?;
        Ok(child_addr)
    }

    /// Attach TOTP material to an existing credential child (spec §4.5
    /// `store_totp`). Validation of `digits`/`time_step`/`sha_ver` ranges is
    /// the caller's (C5's) responsibility; this just writes the node.
    pub fn store_totp(
        &mut self,
        uid: UserId,
        child_addr: NodeAddr,
        totp: mp_store::node::TotpMaterial,
    ) -> Result<()> {
        if self.check_user_permission(uid, child_addr)? != NodeKind::Credential {
            return Err(Error::PermissionDenied);
        }
        let mut child = self.store.read_child(child_addr)?;
        match child.as_credential_mut() {
            Some(cred) => cred.totp = Some(totp),
            None => return Err(Error::NotFound),
        }
        self.store.write_child(child_addr, &child, true)?;
        self.bump_credential_change_number(uid)?;
        Ok(())
    }

    /// Create a new data (file/note) parent for `service`, empty of chunks.
    pub fn add_data(&mut self, uid: UserId, service: &ServiceName, data_category: DataCategory) -> Result<NodeAddr> {
        let category = 0;
        self.find_or_create_parent(uid, ParentKind::Data(data_category), service, category)
    }

    /// Append one ciphertext chunk to `parent_addr`'s data chain.
    pub fn add_data_chunk(&mut self, uid: UserId, parent_addr: NodeAddr, chunk: [u8; mp_store::node::DATA_CHUNK_LEN], chunk_len: u8) -> Result<NodeAddr> {
        if self.check_user_permission(uid, parent_addr)? != NodeKind::Parent {
            return Err(Error::PermissionDenied);
        }
        let child_addr = self.allocate_owned(uid, 2, NodeKind::Data)?;
        let data = DataChild { parent: parent_addr, next: NodeAddr::NULL, chunk, chunk_len };
        self.push_child(parent_addr, child_addr, ChildNode::Data(data))?;
        self.bump_data_change_number(uid)?;
        Ok(child_addr)
    }

    /// Read every chunk belonging to `parent_addr` in list order.
    pub fn get_data(&self, uid: UserId, parent_addr: NodeAddr) -> Result<Vec<(Vec<u8>, u8)>> {
        if self.check_user_permission(uid, parent_addr)? != NodeKind::Parent {
            return Err(Error::PermissionDenied);
        }
        let parent = self.store.read_parent(parent_addr)?;
        let mut out = Vec::new();
        let mut cursor = parent.first_child;
        let mut visited = std::collections::HashSet::new();
        while !cursor.is_null() {
            if !visited.insert(cursor) {
                return Err(Error::MalformedGraph);
            }
            let child = self.store.read_child(cursor)?;
            match &child {
                ChildNode::Data(d) => {
                    out.push((d.chunk.to_vec(), d.chunk_len));
                    cursor = d.next;
                }
                ChildNode::Credential(_) => return Err(Error::NotFound),
            }
        }
        Ok(out)
    }

    /// Remove every chunk under `parent_addr` but keep the parent itself
    /// (spec §4.5 `empty_data`).
    pub fn empty_data(&mut self, uid: UserId, parent_addr: NodeAddr) -> Result<()> {
        if self.check_user_permission(uid, parent_addr)? != NodeKind::Parent {
            return Err(Error::PermissionDenied);
        }
        let mut parent = self.store.read_parent(parent_addr)?;
        let mut cursor = parent.first_child;
        let mut visited = std::collections::HashSet::new();
        while !cursor.is_null() {
            if !visited.insert(cursor) {
                return Err(Error::MalformedGraph);
            }
            let child = self.store.read_child(cursor)?;
            let next = match &child {
                ChildNode::Data(d) => d.next,
                ChildNode::Credential(c) => c.next,
            };
            self.store.erase_node(cursor, 2)?;
            self.profile_mut(uid)?.unmark_owned(cursor, 2);
            cursor = next;
        }
        parent.first_child = NodeAddr::NULL;
        self.store.write_parent(parent_addr, &parent)?;
        self.bump_data_change_number(uid)?;
        Ok(())
    }

    /// Remove a data parent entirely, including its chunks (spec §4.5
    /// `delete_data`).
    pub fn delete_data(&mut self, uid: UserId, parent_addr: NodeAddr) -> Result<()> {
        self.empty_data(uid, parent_addr)?;
        self.unlink_parent(uid, parent_addr)?;
        self.store.erase_node(parent_addr, 1)?;
        self.profile_mut(uid)?.unmark_owned(parent_addr, 1);
        self.bump_data_change_number(uid)?;
        Ok(())
    }

    /// Delete a single credential child; if it was the last child of its
    /// parent, the parent is removed too (spec §3 "Lifecycles").
    pub fn delete_credential(&mut self, uid: UserId, child_addr: NodeAddr) -> Result<()> {
        if self.check_user_permission(uid, child_addr)? != NodeKind::Credential {
            return Err(Error::PermissionDenied);
        }
        let child = self.store.read_child(child_addr)?;
        let cred = child.as_credential().ok_or(Error::NotFound)?;
        let parent_addr = cred.parent;
        let (prev, next) = (cred.prev, cred.next);

        if prev.is_null() {
            let mut parent = self.store.read_parent(parent_addr)?;
            parent.first_child = next;
            self.store.write_parent(parent_addr, &parent)?;
        } else {
            let mut prev_child = self.store.read_child(prev)?;
            if let Some(c) = prev_child.as_credential_mut() {
                c.next = next;
            }
            self.store.write_child(prev, &prev_child, true)?;
        }
        if !next.is_null() {
            let mut next_child = self.store.read_child(next)?;
            if let Some(c) = next_child.as_credential_mut() {
                c.prev = prev;
            }
            self.store.write_child(next, &next_child, true)?;
        }

        self.store.erase_node(child_addr, 2)?;
        self.profile_mut(uid)?.unmark_owned(child_addr, 2);
        self.bump_credential_change_number(uid)?;

        let parent = self.store.read_parent(parent_addr)?;
        if parent.first_child.is_null() {
            self.unlink_parent(uid, parent_addr)?;
            self.store.erase_node(parent_addr, 1)?;
            self.profile_mut(uid)?.unmark_owned(parent_addr, 1);
        }
        Ok(())
    }

    // ---- internal helpers -------------------------------------------------

    fn allocate_owned(&mut self, uid: UserId, slots: u8, kind: NodeKind) -> Result<NodeAddr> {
        let addr = self.store.allocate_free_slots(slots, None).ok_or(Error::StorageFull)?;
        self.profile_mut(uid)?.mark_owned(addr, slots, kind);
        Ok(addr)
    }

    fn find_or_create_parent(
        &mut self,
        uid: UserId,
        kind: ParentKind,
        service: &ServiceName,
        category: u8,
    ) -> Result<NodeAddr> {
        if let Some(addr) =
            search::find_service(&self.store, self.profile(uid)?, service, SearchMode::Match, kind, category)?
        {
            return Ok(addr);
        }
        let addr = self.allocate_owned(uid, 1, NodeKind::Parent)?;
        let mut node = ParentNode::new(kind, *service);
        node.category_id = category;
        self.insert_parent_sorted(uid, kind, category, addr, node)?;
        Ok(addr)
    }

    fn start_addr(&self, uid: UserId, kind: ParentKind, category: u8) -> Result<NodeAddr> {
        let profile = self.profile(uid)?;
        Ok(match kind {
            ParentKind::Credential => profile.credential_start_parent[category as usize],
            ParentKind::Data(_) => profile.data_start_parent[category as usize],
        })
    }

    fn set_start_addr(&mut self, uid: UserId, kind: ParentKind, category: u8, addr: NodeAddr) -> Result<()> {
        let profile = self.profile_mut(uid)?;
        match kind {
            ParentKind::Credential => profile.credential_start_parent[category as usize] = addr,
            ParentKind::Data(_) => profile.data_start_parent[category as usize] = addr,
        }
        Ok(())
    }

    fn insert_parent_sorted(
        &mut self,
        uid: UserId,
        kind: ParentKind,
        category: u8,
        addr: NodeAddr,
        mut node: ParentNode,
    ) -> Result<()> {
        let mut prev = NodeAddr::NULL;
        let mut cursor = self.start_addr(uid, kind, category)?;
        let mut visited = std::collections::HashSet::new();
        while !cursor.is_null() {
            if !visited.insert(cursor) {
                return Err(Error::MalformedGraph);
            }
            let cur = self.store.read_parent(cursor)?;
            if cur.service_name > node.service_name {
                break;
            }
            prev = cursor;
            cursor = cur.next;
        }

        node.prev = prev;
        node.next = cursor;

        if prev.is_null() {
            self.set_start_addr(uid, kind, category, addr)?;
        } else {
            let mut prev_node = self.store.read_parent(prev)?;
            prev_node.next = addr;
            self.store.write_parent(prev, &prev_node)?;
        }
        if !cursor.is_null() {
            let mut next_node = self.store.read_parent(cursor)?;
            next_node.prev = addr;
            self.store.write_parent(cursor, &next_node)?;
        }
        self.store.write_parent(addr, &node)?;
        Ok(())
    }

    /// Splice a parent out of its category sibling list (used when its last
    /// child is removed). Does not erase the parent's own slot; the caller
    /// does that.
    fn unlink_parent(&mut self, uid: UserId, addr: NodeAddr) -> Result<()> {
        let parent = self.store.read_parent(addr)?;
        let category = parent.category_id;
        let (prev, next) = (parent.prev, parent.next);

        if prev.is_null() {
            self.set_start_addr(uid, parent.kind, category, next)?;
        } else {
            let mut prev_node = self.store.read_parent(prev)?;
            prev_node.next = next;
            self.store.write_parent(prev, &prev_node)?;
        }
        if !next.is_null() {
            let mut next_node = self.store.read_parent(next)?;
            next_node.prev = prev;
            self.store.write_parent(next, &next_node)?;
        }
        Ok(())
    }

    fn push_child(&mut self, parent_addr: NodeAddr, child_addr: NodeAddr, mut child: ChildNode) -> Result<()> {
        let mut parent = self.store.read_parent(parent_addr)?;
        match &mut child {
            ChildNode::Credential(c) => {
                c.prev = NodeAddr::NULL;
                c.next = parent.first_child;
                c.parent = parent_addr;
            }
            ChildNode::Data(d) => {
                d.next = parent.first_child;
                d.parent = parent_addr;
            }
        }
        if !parent.first_child.is_null() {
            let mut head = self.store.read_child(parent.first_child)?;
            if let ChildNode::Credential(c) = &mut head {
                c.prev = child_addr;
                self.store.write_child(parent.first_child, &head, true)?;
            }
        }
        parent.first_child = child_addr;
        self.store.write_parent(parent_addr, &parent)?;
        self.store.write_child(child_addr, &child, false)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp_store::InMemoryMedium;

    fn name(s: &str) -> ServiceName {
        ServiceName::from_units(&s.encode_utf16().collect::<Vec<u16>>()).unwrap()
    }

    fn login(s: &str) -> LoginString {
        LoginString::from_units(&s.encode_utf16().collect::<Vec<u16>>()).unwrap()
    }

    fn manager() -> NodeManager<InMemoryMedium> {
        NodeManager::new(InMemoryMedium::new(256))
    }

    #[test]
    fn store_then_fetch_round_trips_via_find_service_and_find_login() {
        let mut mgr = manager();
        let uid = mgr.new_user([1u8; 16]).unwrap();
        let pw = {
            let mut p = [0u8; MAX_PASSWORD_LEN];
            p[0] = 0xAB;
            p
        };
        mgr.store_credential(uid, &name("example.com"), &login("alice"), None, None, Some(pw)).unwrap();

        let parent = search::find_service(
            mgr.store(),
            mgr.profile(uid).unwrap(),
            &name("example.com"),
            SearchMode::Match,
            ParentKind::Credential,
            CATEGORY_ALL,
        )
        .unwrap()
        .unwrap();
        let child_addr = search::find_login(mgr.store(), mgr.profile(uid).unwrap(), parent, &login("alice"), false)
            .unwrap()
            .unwrap();
        let child = mgr.store().read_child(child_addr).unwrap();
        assert_eq!(child.as_credential().unwrap().password_ciphertext[0], 0xAB);
        assert_eq!(mgr.credential_change_number(uid).unwrap(), 1);
    }

    #[test]
    fn sibling_list_stays_sorted_across_inserts_and_deletes() {
        let mut mgr = manager();
        let uid = mgr.new_user([0u8; 16]).unwrap();
        for svc in ["mmm.com", "aaa.com", "zzz.com", "ccc.com"] {
            mgr.store_credential(uid, &name(svc), &login("u"), None, None, None).unwrap();
        }

        let mut order = Vec::new();
        let mut cursor = NodeAddr::NULL;
        loop {
            match search::scan_for_next_parent_after(mgr.store(), mgr.profile(uid).unwrap(), cursor, ParentKind::Credential)
                .unwrap()
            {
                Some((addr, name)) => {
                    order.push(name);
                    cursor = addr;
                }
                None => break,
            }
        }
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);

        // delete the middle one and confirm the list is still consistent.
        let target = search::find_service(mgr.store(), mgr.profile(uid).unwrap(), &name("ccc.com"), SearchMode::Match, ParentKind::Credential, CATEGORY_ALL)
            .unwrap()
            .unwrap();
        let child = {
            let parent = mgr.store().read_parent(target).unwrap();
            parent.first_child
        };
        mgr.delete_credential(uid, child).unwrap();

        assert!(search::find_service(mgr.store(), mgr.profile(uid).unwrap(), &name("ccc.com"), SearchMode::Match, ParentKind::Credential, CATEGORY_ALL)
            .unwrap()
            .is_none());
    }

    #[test]
    fn erase_user_makes_all_its_nodes_unreachable() {
        let mut mgr = manager();
        let uid = mgr.new_user([0u8; 16]).unwrap();
        mgr.store_credential(uid, &name("svc.com"), &login("u"), None, None, None).unwrap();
        mgr.erase_user(uid).unwrap();
        assert!(mgr.profile(uid).is_err());
    }

    #[test]
    fn favorite_clear_then_get_favorites_skips_it() {
        let mut mgr = manager();
        let uid = mgr.new_user([0u8; 16]).unwrap();
        let addr = mgr.store_credential(uid, &name("svc.com"), &login("u"), None, None, None).unwrap();
        let parent = search::find_service(mgr.store(), mgr.profile(uid).unwrap(), &name("svc.com"), SearchMode::Match, ParentKind::Credential, CATEGORY_ALL)
            .unwrap()
            .unwrap();
        mgr.set_favorite(uid, 0, 0, Favorite { service: parent, login: addr }).unwrap();
        assert_eq!(mgr.get_favorites(uid).unwrap().len(), 1);

        mgr.set_favorite(uid, 0, 0, Favorite::EMPTY).unwrap();
        assert_eq!(mgr.get_favorites(uid).unwrap().len(), 0);
    }

    #[test]
    fn set_favorite_rejects_addresses_not_owned_by_caller() {
        let mut mgr = manager();
        let uid = mgr.new_user([0u8; 16]).unwrap();
        let other = mgr.new_user([1u8; 16]).unwrap();
        let addr = mgr.store_credential(other, &name("svc.com"), &login("u"), None, None, None).unwrap();
        let err = mgr.set_favorite(uid, 0, 0, Favorite { service: addr, login: addr }).unwrap_err();
        assert_eq!(err, Error::PermissionDenied);
    }

    #[test]
    fn category_latch_rejects_second_selection() {
        let mut mgr = manager();
        let uid = mgr.new_user([0u8; 16]).unwrap();
        mgr.set_current_category(uid, 2).unwrap();
        assert_eq!(mgr.set_current_category(uid, 3), Err(Error::CategoryAlreadySelected));
        mgr.set_current_category(uid, CATEGORY_ALL).unwrap();
        mgr.set_current_category(uid, 3).unwrap();
    }

    #[test]
    fn allocate_free_slots_reports_storage_full() {
        let mgr = manager();
        assert_eq!(mgr.allocate_free_slots(255, None), Err(Error::StorageFull));
    }

    #[test]
    fn data_chunks_round_trip_and_empty_clears_them() {
        let mut mgr = manager();
        let uid = mgr.new_user([0u8; 16]).unwrap();
        let parent = mgr.add_data(uid, &name("notes"), DataCategory::Notes).unwrap();
        let mut chunk = [0u8; mp_store::node::DATA_CHUNK_LEN];
        chunk[0] = 7;
        mgr.add_data_chunk(uid, parent, chunk, 1).unwrap();
        assert_eq!(mgr.get_data(uid, parent).unwrap().len(), 1);
        mgr.empty_data(uid, parent).unwrap();
        assert_eq!(mgr.get_data(uid, parent).unwrap().len(), 0);
    }
}
