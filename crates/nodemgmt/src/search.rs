//! Sibling-list and child-list search (spec §4.4 "Service search" / "Login
//! search" / "WebAuthn searches" / "Scanning"). Grounded on spec §8 I3/I4: a
//! sorted traversal that proves absence as soon as it can, with a
//! visited-address loop detector guarding against a malformed graph.

use std::collections::HashSet;

use mp_store::node::{ChildNode, CredentialTypeId, DataCategory, ParentKind, ServiceName};
use mp_store::{FlashMedium, FlashStore, NodeAddr};

use crate::profile::{UserProfile, CATEGORY_ALL, NB_MAX_CATEGORIES};
use crate::{Error, Result};

/// `MATCH` returns only an exact hit; `COMPARE` returns the lexicographically
/// nearest service at or after `name`, for autocompletion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchMode {
    Match,
    Compare,
}

/// Which per-category sibling lists a search walks. `category_id ==
/// CATEGORY_ALL` (0) means "every category's list"; any other value in
/// `[1, NB_MAX_CATEGORIES)` restricts the walk to that one list.
fn categories_to_scan(category_id: u8) -> Vec<u8> {
    if category_id == CATEGORY_ALL {
        (0..NB_MAX_CATEGORIES).collect()
    } else {
        vec![category_id]
    }
}

fn start_addr_for(profile: &UserProfile, kind: ParentKind, category: u8) -> NodeAddr {
    match kind {
        ParentKind::Credential => profile.credential_start_parent[category as usize],
        ParentKind::Data(_) => profile.data_start_parent[category as usize],
    }
}

/// Walk one category's sibling list in lexicographic order. Stops and
/// returns `Ok(None)` as soon as a node's name proves no exact match can
/// follow (sorted-list early-exit, spec §4.4). Guards against a cyclic graph
/// with a visited-address set rather than trusting the sibling pointers.
fn walk_category<M: FlashMedium>(
    store: &FlashStore<M>,
    start: NodeAddr,
    name: &ServiceName,
    mode: SearchMode,
) -> Result<Option<(NodeAddr, ServiceName)>> {
    let mut visited = HashSet::new();
    let mut cursor = start;
    let mut nearest: Option<(NodeAddr, ServiceName)> = None;

    while !cursor.is_null() {
        if !visited.insert(cursor) {
            log::error!("nodemgmt: cyclic sibling list detected at {:?}", cursor);
            return Err(Error::MalformedGraph);
        }
        let parent = store.read_parent(cursor)?;
        match parent.service_name.cmp(name) {
            std::cmp::Ordering::Equal => return Ok(Some((cursor, parent.service_name))),
            std::cmp::Ordering::Greater => {
                // Sorted list: nothing after this point can equal `name`.
                if mode == SearchMode::Compare {
                    nearest = Some((cursor, parent.service_name));
                }
                break;
            }
            std::cmp::Ordering::Less => {}
        }
        cursor = parent.next;
    }

    match mode {
        SearchMode::Match => Ok(None),
        SearchMode::Compare => Ok(nearest),
    }
}

/// `find_service(name, match_or_compare, type, category_id) -> parent_addr | NULL`.
pub fn find_service<M: FlashMedium>(
    store: &FlashStore<M>,
    profile: &UserProfile,
    name: &ServiceName,
    mode: SearchMode,
    kind: ParentKind,
    category_id: u8,
) -> Result<Option<NodeAddr>> {
    let mut best: Option<(NodeAddr, ServiceName)> = None;
    for category in categories_to_scan(category_id) {
        let start = start_addr_for(profile, kind, category);
        if let Some(hit) = walk_category(store, start, name, mode)? {
            if mode == SearchMode::Match {
                return Ok(Some(hit.0));
            }
            best = Some(match best {
                Some(current) if current.1 <= hit.1 => current,
                _ => hit,
            });
        }
    }
    Ok(best.map(|(addr, _)| addr))
}

/// `find_login(parent_addr, login, honour_category_filter) -> child_addr | NULL`.
pub fn find_login<M: FlashMedium>(
    store: &FlashStore<M>,
    profile: &UserProfile,
    parent_addr: NodeAddr,
    login: &mp_store::node::LoginString,
    honour_category_filter: bool,
) -> Result<Option<NodeAddr>> {
    let parent = store.read_parent(parent_addr)?;
    if honour_category_filter
        && profile.category_filter != CATEGORY_ALL
        && parent.category_id != profile.category_filter
    {
        return Ok(None);
    }

    let mut visited = HashSet::new();
    let mut cursor = parent.first_child;
    while !cursor.is_null() {
        if !visited.insert(cursor) {
            log::error!("nodemgmt: cyclic child list detected at {:?}", cursor);
            return Err(Error::MalformedGraph);
        }
        let child = store.read_child(cursor)?;
        if let Some(cred) = child.as_credential() {
            if &cred.login == login {
                return Ok(Some(cursor));
            }
        }
        cursor = child_next(&child);
    }
    Ok(None)
}

fn child_next(child: &ChildNode) -> NodeAddr {
    match child {
        ChildNode::Credential(c) => c.next,
        ChildNode::Data(d) => d.next,
    }
}

/// Brute-force WebAuthn lookups: no secondary index exists, so both walk
/// every credential parent/child the profile owns. Acceptable for the
/// device's small node counts (spec §2's scale); a real implementation could
/// add a `user_handle`/`credential_id` index if profiling ever showed this as
/// a bottleneck, but nothing here calls for that complexity yet.
pub fn find_webauthn_by_user_handle<M: FlashMedium>(
    store: &FlashStore<M>,
    profile: &UserProfile,
    user_handle: &[u8],
) -> Result<Option<NodeAddr>> {
    find_webauthn_where(store, profile, |wa| {
        wa.user_handle_len as usize == user_handle.len()
            && &wa.user_handle[..user_handle.len()] == user_handle
    })
}

pub fn find_webauthn_by_credential_id<M: FlashMedium>(
    store: &FlashStore<M>,
    profile: &UserProfile,
    credential_id: &[u8; mp_store::node::WEBAUTHN_CREDENTIAL_ID_LEN],
) -> Result<Option<NodeAddr>> {
    find_webauthn_where(store, profile, |wa| &wa.credential_id == credential_id)
}

fn find_webauthn_where<M: FlashMedium>(
    store: &FlashStore<M>,
    profile: &UserProfile,
    pred: impl Fn(&mp_store::node::WebAuthnData) -> bool,
) -> Result<Option<NodeAddr>> {
    for category in 0..NB_MAX_CATEGORIES {
        let mut cursor = profile.credential_start_parent[category as usize];
        let mut visited = HashSet::new();
        while !cursor.is_null() {
            if !visited.insert(cursor) {
                return Err(Error::MalformedGraph);
            }
            let parent = store.read_parent(cursor)?;
            let mut child_cursor = parent.first_child;
            let mut child_visited = HashSet::new();
            while !child_cursor.is_null() {
                if !child_visited.insert(child_cursor) {
                    return Err(Error::MalformedGraph);
                }
                let child = store.read_child(child_cursor)?;
                if let Some(cred) = child.as_credential() {
                    if cred.cred_type == CredentialTypeId::WebAuthn {
                        if let Some(wa) = &cred.webauthn {
                            if pred(wa) {
                                return Ok(Some(child_cursor));
                            }
                        }
                    }
                }
                child_cursor = child_next(&child);
            }
            cursor = parent.next;
        }
    }
    Ok(None)
}

/// `scan_for_next_parent_after(addr, type) -> (next_addr, service_name)`,
/// used by hosts to enumerate. Category lists are walked in category order
/// (0..NB_MAX_CATEGORIES) to produce one flat enumeration sequence; `addr ==
/// NULL` starts from the beginning.
pub fn scan_for_next_parent_after<M: FlashMedium>(
    store: &FlashStore<M>,
    profile: &UserProfile,
    after: NodeAddr,
    kind: ParentKind,
) -> Result<Option<(NodeAddr, ServiceName)>> {
    let mut found_after = after.is_null();
    for category in 0..NB_MAX_CATEGORIES {
        let mut cursor = start_addr_for(profile, kind, category);
        let mut visited = HashSet::new();
        while !cursor.is_null() {
            if !visited.insert(cursor) {
                return Err(Error::MalformedGraph);
            }
            let parent = store.read_parent(cursor)?;
            if found_after {
                return Ok(Some((cursor, parent.service_name)));
            }
            if cursor == after {
                found_after = true;
            }
            cursor = parent.next;
        }
    }
    Ok(None)
}

/// Parent-kind tag used when matching a data parent irrespective of its
/// `DataCategory` (notes vs. files share one scan per spec §11).
pub fn any_data_kind() -> ParentKind {
    ParentKind::Data(DataCategory::Standard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeManager;
    use mp_store::node::LoginString;
    use mp_store::InMemoryMedium;

    fn manager() -> NodeManager<InMemoryMedium> {
        NodeManager::new(InMemoryMedium::new(64))
    }

    fn name(s: &str) -> ServiceName {
        ServiceName::from_units(&s.encode_utf16().collect::<Vec<u16>>()).unwrap()
    }

    fn login(s: &str) -> LoginString {
        LoginString::from_units(&s.encode_utf16().collect::<Vec<u16>>()).unwrap()
    }

    #[test]
    fn find_service_match_returns_exact_hit_and_null_otherwise() {
        let mut mgr = manager();
        let uid = mgr.new_user([0u8; 16]).unwrap();
        mgr.store_credential(uid, &name("alpha.com"), &login("a"), None, None, None).unwrap();
        mgr.store_credential(uid, &name("zeta.com"), &login("z"), None, None, None).unwrap();

        let profile = mgr.profile(uid).unwrap();
        let found = find_service(
            mgr.store(),
            profile,
            &name("alpha.com"),
            SearchMode::Match,
            ParentKind::Credential,
            CATEGORY_ALL,
        )
        .unwrap();
        assert!(found.is_some());

        let missing = find_service(
            mgr.store(),
            profile,
            &name("missing.com"),
            SearchMode::Match,
            ParentKind::Credential,
            CATEGORY_ALL,
        )
        .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn find_service_compare_returns_nearest() {
        let mut mgr = manager();
        let uid = mgr.new_user([0u8; 16]).unwrap();
        mgr.store_credential(uid, &name("bbb.com"), &login("u"), None, None, None).unwrap();
        mgr.store_credential(uid, &name("ddd.com"), &login("u"), None, None, None).unwrap();

        let profile = mgr.profile(uid).unwrap();
        let nearest = find_service(
            mgr.store(),
            profile,
            &name("ccc.com"),
            SearchMode::Compare,
            ParentKind::Credential,
            CATEGORY_ALL,
        )
        .unwrap()
        .unwrap();
        let parent = mgr.store().read_parent(nearest).unwrap();
        assert_eq!(parent.service_name, name("ddd.com"));
    }

    #[test]
    fn find_login_honours_category_filter() {
        let mut mgr = manager();
        let uid = mgr.new_user([0u8; 16]).unwrap();
        mgr.store_credential(uid, &name("svc.com"), &login("alice"), None, None, None).unwrap();
        let profile_mut = mgr.profile_mut(uid).unwrap();
        profile_mut.category_filter = 2;

        let parent_addr =
            find_service(mgr.store(), mgr.profile(uid).unwrap(), &name("svc.com"), SearchMode::Match, ParentKind::Credential, CATEGORY_ALL)
                .unwrap()
                .unwrap();

        let hit = find_login(mgr.store(), mgr.profile(uid).unwrap(), parent_addr, &login("alice"), true).unwrap();
        assert!(hit.is_none(), "category filter set to 2 should hide a category-0 service");

        let hit_unfiltered =
            find_login(mgr.store(), mgr.profile(uid).unwrap(), parent_addr, &login("alice"), false).unwrap();
        assert!(hit_unfiltered.is_some());
    }
}
