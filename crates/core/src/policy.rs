//! Credential access policy (C5): the only layer that emits user prompts,
//! sitting between the dispatcher and the node manager / crypto engine.
//! Grounded on spec §4.5; the password-generation policy is lifted from
//! `apps/vault/src/actions.rs`'s `PasswordGenerator{length: 20, ...}`
//! construction, and TOTP generation delegates to `mp_crypto::totp`, the
//! same split `apps/vault/src/totp.rs` keeps between UI and HMAC-SHA1 math.

use std::collections::HashMap;

use mp_crypto::aes_ctr::{AesCtrEngine, Ctr, CtrBound};
use mp_crypto::totp::{self, ShaVersion};
use mp_nodemgmt::{
    NodeManager, UserId,
};
use mp_store::node::{
    ChildNode, DataCategory, DescriptionString, LoginString, ServiceName, TotpMaterial,
    ThirdFieldString, MAX_PASSWORD_LEN,
};
use mp_store::{FlashMedium, NodeAddr};
use passwords::PasswordGenerator;
use subtle::ConstantTimeEq;

use crate::device::{CheckPasswordThrottle, UserSecurityFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    NodeMgmt(mp_nodemgmt::Error),
    Crypto(mp_crypto::Error),
    /// A user prompt was required and the user declined, cancelled, or timed out.
    UserDenied,
    /// `check_credential` was called while the rate-limit timer was still armed.
    RateLimited,
    /// `change_node_password` was attempted outside simple mode, or on a non-credential node.
    AdvancedModeRequired,
    NotFound,
    InvalidTotpParameter,
    /// TOTP was requested but no `SET_DATE` calibration has ever been
    /// received: the device has no RTC (spec §6), so there is no wall clock
    /// to derive a time step from.
    ClockNotSet,
}

impl From<mp_nodemgmt::Error> for Error {
    fn from(e: mp_nodemgmt::Error) -> Self {
        Error::NodeMgmt(e)
    }
}

impl From<mp_crypto::Error> for Error {
    fn from(e: mp_crypto::Error) -> Self {
        Error::Crypto(e)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::NodeMgmt(e) => write!(f, "node manager error: {:?}", e),
            Error::Crypto(e) => write!(f, "crypto error: {}", e),
            Error::UserDenied => write!(f, "user declined, cancelled, or the prompt timed out"),
            Error::RateLimited => write!(f, "check_password is rate limited"),
            Error::AdvancedModeRequired => write!(f, "operation requires simple mode and a credential node"),
            Error::NotFound => write!(f, "service or login not found"),
            Error::InvalidTotpParameter => write!(f, "totp parameter out of range"),
            Error::ClockNotSet => write!(f, "no SET_DATE calibration received yet, clock unknown"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Ok,
    Mismatch,
    RateLimited,
}

pub struct CredentialReply {
    pub child_addr: NodeAddr,
    pub login: LoginString,
    /// Either the decrypted password or a freshly generated TOTP code,
    /// depending on `want_totp` (spec §4.5 `get_credential`).
    pub secret: SecretReply,
}

pub enum SecretReply {
    Password(Vec<u8>),
    Totp { code: String, remaining_secs: u8 },
}

/// Policy used by `store_credential` when the host supplies no password
/// (spec §4.5: "the device generates one on-board... with a policy
/// (length/charset in settings)"). Mirrors the teacher's own fixed policy
/// rather than exposing every `passwords::PasswordGenerator` knob on the wire.
#[derive(Debug, Clone, Copy)]
pub struct GeneratedPasswordPolicy {
    pub length: usize,
}

impl Default for GeneratedPasswordPolicy {
    fn default() -> Self {
        GeneratedPasswordPolicy { length: 20 }
    }
}

impl GeneratedPasswordPolicy {
    fn generate(&self) -> Vec<u8> {
        let pg = PasswordGenerator {
            length: self.length,
            numbers: true,
            lowercase_letters: true,
            uppercase_letters: true,
            symbols: true,
            spaces: false,
            exclude_similar_characters: true,
            strict: true,
        };
        pg.generate_one().expect("fixed policy always satisfies its own constraints").into_bytes()
    }
}

/// The per-service "most recently used credential" hint (spec §4.5
/// "Preferred starting child"). Keyed by service name since the device may
/// remember more than one service's last-used login across a session; RAM
/// only, never persisted.
#[derive(Default)]
pub struct PreferredStartingChild {
    hints: HashMap<ServiceName, NodeAddr>,
}

impl PreferredStartingChild {
    pub fn set(&mut self, service: ServiceName, child: NodeAddr) {
        self.hints.insert(service, child);
    }

    pub fn get(&self, service: &ServiceName) -> Option<NodeAddr> {
        self.hints.get(service).copied()
    }
}

pub struct CredentialPolicy {
    pub preferred: PreferredStartingChild,
    pub password_policy: GeneratedPasswordPolicy,
}

impl CredentialPolicy {
    pub fn new() -> CredentialPolicy {
        CredentialPolicy { preferred: PreferredStartingChild::default(), password_policy: GeneratedPasswordPolicy::default() }
    }

    fn decrypt_password(&self, engine: &AesCtrEngine, child: &ChildNode) -> Vec<u8> {
        let cred = child.as_credential().expect("caller already matched Credential kind");
        let mut buf = cred.password_ciphertext.to_vec();
        engine.decrypt(&mut buf, Ctr(cred.ctr), cred.prev_gen);
        buf
    }

    /// `get_credential(service, login_or_NULL, want_totp)`. `login == None`
    /// selects the preferred starting child if one is recorded for
    /// `service`, else the parent's first child. `now_unix` is the caller's
    /// best current unix time (derived from the `SET_DATE` calibration
    /// basis); required only when `want_totp` is set, since there is no
    /// other source of wall-clock time (spec §6).
    pub fn get_credential<M: FlashMedium>(
        &mut self,
        nodes: &NodeManager<M>,
        uid: UserId,
        engine: &AesCtrEngine,
        service: &ServiceName,
        login: Option<&LoginString>,
        want_totp: bool,
        now_unix: Option<u64>,
    ) -> Result<CredentialReply> {
        let parent_addr = mp_nodemgmt::search::find_service(
            nodes.store(),
            nodes.profile(uid)?,
            service,
            mp_nodemgmt::SearchMode::Match,
            mp_store::node::ParentKind::Credential,
            mp_nodemgmt::CATEGORY_ALL,
        )?
        .ok_or(Error::NotFound)?;

        let child_addr = match login {
            Some(login) => {
                mp_nodemgmt::search::find_login(nodes.store(), nodes.profile(uid)?, parent_addr, login, true)?
                    .ok_or(Error::NotFound)?
            }
            None => self.preferred.get(service).unwrap_or_else(|| {
                nodes.store().read_parent(parent_addr).map(|p| p.first_child).unwrap_or(NodeAddr::NULL)
            }),
        };
        if child_addr.is_null() {
            return Err(Error::NotFound);
        }

        let child = nodes.store().read_child(child_addr).map_err(mp_nodemgmt::Error::Store)?;
        let cred = child.as_credential().ok_or(Error::NotFound)?;

        self.preferred.set(*service, child_addr);

        let secret = if want_totp {
            let totp_material = cred.totp.as_ref().ok_or(Error::NotFound)?;
            let sha_ver = ShaVersion::from_u8(totp_material.sha_ver).ok_or(Error::InvalidTotpParameter)?;
            let mut secret_buf = totp_material.secret[..totp_material.secret_len as usize].to_vec();
            engine.decrypt(&mut secret_buf, Ctr(totp_material.ctr), false);
            let now_unix = now_unix.ok_or(Error::ClockNotSet)?;
            let out = totp::generate(&secret_buf, totp_material.digits, totp_material.time_step, sha_ver, now_unix)?;
            secret_buf.iter_mut().for_each(|b| *b = 0);
            SecretReply::Totp { code: out.code, remaining_secs: out.remaining_secs }
        } else {
            SecretReply::Password(self.decrypt_password(engine, &child))
        };

        Ok(CredentialReply { child_addr, login: cred.login, secret })
    }

    /// `store_credential(service, login, desc|NULL, third|NULL, password|NULL)`.
    /// Encrypts the password (supplied or freshly generated) before handing
    /// it to the node manager; `desc`/`third`/`password = None` means "do not
    /// modify this field" on an existing child.
    #[allow(clippy::too_many_arguments)]
    pub fn store_credential<M: FlashMedium>(
        &mut self,
        nodes: &mut NodeManager<M>,
        uid: UserId,
        engine: &mut AesCtrEngine,
        bound: &mut dyn CtrBound,
        service: &ServiceName,
        login: &LoginString,
        desc: Option<DescriptionString>,
        third: Option<ThirdFieldString>,
        password: Option<&[u8]>,
    ) -> Result<NodeAddr> {
        let cleartext: Vec<u8> = match password {
            Some(p) => p.to_vec(),
            None => self.password_policy.generate(),
        };
        let mut padded = [0u8; MAX_PASSWORD_LEN];
        let take = cleartext.len().min(MAX_PASSWORD_LEN);
        padded[..take].copy_from_slice(&cleartext[..take]);
        engine.encrypt(&mut padded, bound);

        let child_addr = nodes.store_credential(uid, service, login, desc, third, Some(padded))?;
        self.preferred.set(*service, child_addr);
        Ok(child_addr)
    }

    /// `check_credential(service, login, password)`: constant-time compare,
    /// rate-limited by `throttle` (spec §8 I8, §9 resolved open question: the
    /// throttle rearms on every attempt, matched or not).
    pub fn check_credential<M: FlashMedium>(
        &self,
        nodes: &NodeManager<M>,
        uid: UserId,
        engine: &AesCtrEngine,
        throttle: &mut CheckPasswordThrottle,
        now_ms: u64,
        service: &ServiceName,
        login: &LoginString,
        candidate: &[u8],
    ) -> Result<CheckResult> {
        if !throttle.is_allowed(now_ms) {
            return Ok(CheckResult::RateLimited);
        }
        throttle.rearm(now_ms);

        let parent_addr = mp_nodemgmt::search::find_service(
            nodes.store(),
            nodes.profile(uid)?,
            service,
            mp_nodemgmt::SearchMode::Match,
            mp_store::node::ParentKind::Credential,
            mp_nodemgmt::CATEGORY_ALL,
        )?
        .ok_or(Error::NotFound)?;
        let child_addr = mp_nodemgmt::search::find_login(nodes.store(), nodes.profile(uid)?, parent_addr, login, true)?
            .ok_or(Error::NotFound)?;
        let child = nodes.store().read_child(child_addr).map_err(mp_nodemgmt::Error::Store)?;
        let stored = self.decrypt_password(engine, &child);

        let mut padded_candidate = vec![0u8; stored.len()];
        let take = candidate.len().min(stored.len());
        padded_candidate[..take].copy_from_slice(&candidate[..take]);

        if stored.ct_eq(&padded_candidate).unwrap_u8() == 1 && candidate.len() == stored.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1) {
            Ok(CheckResult::Ok)
        } else {
            Ok(CheckResult::Mismatch)
        }
    }

    /// Only in simple mode (`advanced_menu` flag clear) and only on a
    /// credential node (spec §4.5 `change_node_password`).
    pub fn change_node_password<M: FlashMedium>(
        &mut self,
        nodes: &mut NodeManager<M>,
        uid: UserId,
        engine: &mut AesCtrEngine,
        bound: &mut dyn CtrBound,
        security: UserSecurityFlags,
        child_addr: NodeAddr,
        new_password: &[u8],
    ) -> Result<()> {
        if security.advanced_menu {
            return Err(Error::AdvancedModeRequired);
        }
        if nodes.check_user_permission(uid, child_addr)? != mp_nodemgmt::NodeKind::Credential {
            return Err(Error::AdvancedModeRequired);
        }
        let mut padded = [0u8; MAX_PASSWORD_LEN];
        let take = new_password.len().min(MAX_PASSWORD_LEN);
        padded[..take].copy_from_slice(&new_password[..take]);
        engine.encrypt(&mut padded, bound);

        let mut child = nodes.store().read_child(child_addr).map_err(mp_nodemgmt::Error::Store)?;
        if let Some(cred) = child.as_credential_mut() {
            cred.password_ciphertext = padded;
        }
        nodes.store_mut().write_child(child_addr, &child, false).map_err(mp_nodemgmt::Error::Store)?;
        Ok(())
    }

    /// Validates TOTP parameters (spec §4.5: `digits ∈ [6,8]`, `sha_ver ∈
    /// [0,2]`) then encrypts the secret and stores it via the node manager.
    pub fn store_totp<M: FlashMedium>(
        &mut self,
        nodes: &mut NodeManager<M>,
        uid: UserId,
        engine: &mut AesCtrEngine,
        bound: &mut dyn CtrBound,
        child_addr: NodeAddr,
        secret: &[u8],
        digits: u8,
        time_step: u8,
        sha_ver: u8,
    ) -> Result<()> {
        if !(totp::MIN_DIGITS..=totp::MAX_DIGITS).contains(&digits) {
            return Err(Error::InvalidTotpParameter);
        }
        if ShaVersion::from_u8(sha_ver).is_none() {
            return Err(Error::InvalidTotpParameter);
        }
        if secret.len() > mp_store::node::TOTP_SECRET_MAX_LEN {
            return Err(Error::InvalidTotpParameter);
        }

        let mut padded = [0u8; mp_store::node::TOTP_SECRET_MAX_LEN];
        padded[..secret.len()].copy_from_slice(secret);
        let ctr = engine.encrypt(&mut padded[..secret.len()], bound);

        let material = TotpMaterial {
            secret: padded,
            secret_len: secret.len() as u8,
            digits,
            time_step,
            sha_ver,
            ctr: ctr.0,
        };
        nodes.store_totp(uid, child_addr, material)?;
        Ok(())
    }

    /// `inform_current_service`: best-effort set of the preferred starting
    /// child. The fixed 100 ms timing budget spec §4.5 calls for (so a host
    /// cannot distinguish "known service" from "unknown" by response
    /// latency) is enforced by the dispatcher's response scheduling, not by
    /// this function — it does the same bounded lookup either way.
    pub fn inform_current_service<M: FlashMedium>(
        &mut self,
        nodes: &NodeManager<M>,
        uid: UserId,
        service: &ServiceName,
    ) -> Result<()> {
        if let Some(parent_addr) = mp_nodemgmt::search::find_service(
            nodes.store(),
            nodes.profile(uid)?,
            service,
            mp_nodemgmt::SearchMode::Match,
            mp_store::node::ParentKind::Credential,
            mp_nodemgmt::CATEGORY_ALL,
        )? {
            let parent = nodes.store().read_parent(parent_addr).map_err(mp_nodemgmt::Error::Store)?;
            if !parent.first_child.is_null() {
                self.preferred.set(*service, parent.first_child);
            }
        }
        Ok(())
    }

    // ---- data / notes -----------------------------------------------------

    pub fn add_data<M: FlashMedium>(&self, nodes: &mut NodeManager<M>, uid: UserId, service: &ServiceName, category: DataCategory) -> Result<NodeAddr> {
        Ok(nodes.add_data(uid, service, category)?)
    }

    pub fn check_data<M: FlashMedium>(&self, nodes: &NodeManager<M>, uid: UserId, service: &ServiceName, category: DataCategory) -> Result<bool> {
        let kind = mp_store::node::ParentKind::Data(category);
        Ok(mp_nodemgmt::search::find_service(nodes.store(), nodes.profile(uid)?, service, mp_nodemgmt::SearchMode::Match, kind, mp_nodemgmt::CATEGORY_ALL)?.is_some())
    }
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp_crypto::aes_ctr::TestCtrBound;
    use mp_nodemgmt::NodeManager;
    use mp_store::InMemoryMedium;

    fn name(s: &str) -> ServiceName {
        ServiceName::from_units(&s.encode_utf16().collect::<Vec<u16>>()).unwrap()
    }
    fn login(s: &str) -> LoginString {
        LoginString::from_units(&s.encode_utf16().collect::<Vec<u16>>()).unwrap()
    }

    fn fixture() -> (NodeManager<InMemoryMedium>, UserId, AesCtrEngine, TestCtrBound) {
        let mut nodes = NodeManager::new(InMemoryMedium::new(64));
        let uid = nodes.new_user([0u8; 16]).unwrap();
        let engine = AesCtrEngine::from_card_key(&[0x42u8; 32], [0x11u8; 16], Ctr::from_u32(0));
        let bound = TestCtrBound(Ctr::from_u32(1000));
        (nodes, uid, engine, bound)
    }

    #[test]
    fn store_then_get_round_trips_cleartext_password() {
        let (mut nodes, uid, mut engine, mut bound) = fixture();
        let mut policy = CredentialPolicy::new();
        policy
            .store_credential(&mut nodes, uid, &mut engine, &mut bound, &name("example.com"), &login("alice"), None, None, Some(b"p@ss"))
            .unwrap();

        let reply = policy.get_credential(&nodes, uid, &engine, &name("example.com"), Some(&login("alice")), false, None).unwrap();
        match reply.secret {
            SecretReply::Password(p) => assert_eq!(&p[..4], b"p@ss"),
            _ => panic!("expected a password reply"),
        }
    }

    #[test]
    fn store_credential_generates_a_password_when_none_supplied() {
        let (mut nodes, uid, mut engine, mut bound) = fixture();
        let mut policy = CredentialPolicy::new();
        policy.store_credential(&mut nodes, uid, &mut engine, &mut bound, &name("svc.com"), &login("bob"), None, None, None).unwrap();

        let reply = policy.get_credential(&nodes, uid, &engine, &name("svc.com"), Some(&login("bob")), false, None).unwrap();
        match reply.secret {
            SecretReply::Password(p) => assert_eq!(p.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1), 20),
            _ => panic!("expected a password reply"),
        }
    }

    #[test]
    fn check_credential_rate_limits_rapid_attempts() {
        let (mut nodes, uid, mut engine, mut bound) = fixture();
        let mut policy = CredentialPolicy::new();
        policy.store_credential(&mut nodes, uid, &mut engine, &mut bound, &name("svc.com"), &login("u"), None, None, Some(b"secret")).unwrap();

        let mut throttle = CheckPasswordThrottle::default();
        assert_eq!(
            policy.check_credential(&nodes, uid, &engine, &mut throttle, 0, &name("svc.com"), &login("u"), b"wrong").unwrap(),
            CheckResult::Mismatch
        );
        assert_eq!(
            policy.check_credential(&nodes, uid, &engine, &mut throttle, 500, &name("svc.com"), &login("u"), b"secret").unwrap(),
            CheckResult::RateLimited
        );
        assert_eq!(
            policy.check_credential(&nodes, uid, &engine, &mut throttle, 2000, &name("svc.com"), &login("u"), b"secret").unwrap(),
            CheckResult::Ok
        );
    }

    #[test]
    fn change_node_password_rejected_in_advanced_mode() {
        let (mut nodes, uid, mut engine, mut bound) = fixture();
        let mut policy = CredentialPolicy::new();
        let addr = policy.store_credential(&mut nodes, uid, &mut engine, &mut bound, &name("svc.com"), &login("u"), None, None, Some(b"old")).unwrap();

        let advanced = UserSecurityFlags { advanced_menu: true, ..Default::default() };
        assert_eq!(
            policy.change_node_password(&mut nodes, uid, &mut engine, &mut bound, advanced, addr, b"new").unwrap_err(),
            Error::AdvancedModeRequired
        );

        let simple = UserSecurityFlags::default();
        policy.change_node_password(&mut nodes, uid, &mut engine, &mut bound, simple, addr, b"new").unwrap();
        let reply = policy.get_credential(&nodes, uid, &engine, &name("svc.com"), Some(&login("u")), false, None).unwrap();
        match reply.secret {
            SecretReply::Password(p) => assert_eq!(&p[..3], b"new"),
            _ => panic!("expected a password reply"),
        }
    }

    #[test]
    fn get_credential_totp_uses_the_supplied_unix_time() {
        let (mut nodes, uid, mut engine, mut bound) = fixture();
        let mut policy = CredentialPolicy::new();
        let addr = policy
            .store_credential(&mut nodes, uid, &mut engine, &mut bound, &name("svc.com"), &login("u"), None, None, Some(b"pw"))
            .unwrap();
        policy.store_totp(&mut nodes, uid, &mut engine, &mut bound, addr, b"12345678901234567890", 8, 30, 0).unwrap();

        let reply = policy.get_credential(&nodes, uid, &engine, &name("svc.com"), Some(&login("u")), true, Some(59)).unwrap();
        match reply.secret {
            SecretReply::Totp { code, .. } => assert_eq!(code, "94287082"),
            _ => panic!("expected a totp reply"),
        }
    }

    #[test]
    fn get_credential_totp_without_a_clock_is_rejected() {
        let (mut nodes, uid, mut engine, mut bound) = fixture();
        let mut policy = CredentialPolicy::new();
        let addr = policy
            .store_credential(&mut nodes, uid, &mut engine, &mut bound, &name("svc.com"), &login("u"), None, None, Some(b"pw"))
            .unwrap();
        policy.store_totp(&mut nodes, uid, &mut engine, &mut bound, addr, b"12345678901234567890", 8, 30, 0).unwrap();

        assert_eq!(
            policy.get_credential(&nodes, uid, &engine, &name("svc.com"), Some(&login("u")), true, None).unwrap_err(),
            Error::ClockNotSet
        );
    }
}
