//! Node types held in the flash store. `ServiceName`, `LoginString` et al.
//! model the fixed-length array-of-16-bit-code-units encoding the on-flash
//! nodes use; the dispatcher layer (in `core`) owns the host's UTF-16LE +
//! NUL-terminator wire encoding, these are the in-memory fixed-capacity forms.

use crate::addr::NodeAddr;

pub const MAX_SERVICE_LEN: usize = 32;
pub const MAX_LOGIN_LEN: usize = 24;
pub const MAX_DESCRIPTION_LEN: usize = 16;
pub const MAX_THIRD_FIELD_LEN: usize = 16;
/// Fixed max length of the encrypted password ciphertext (two AES blocks).
pub const MAX_PASSWORD_LEN: usize = 32;
pub const TOTP_SECRET_MAX_LEN: usize = 64;
pub const WEBAUTHN_USER_HANDLE_MAX_LEN: usize = 64;
pub const WEBAUTHN_CREDENTIAL_ID_LEN: usize = 16;
/// Size of one opaque ciphertext chunk in a data (file/note) child node.
pub const DATA_CHUNK_LEN: usize = 32;

/// A fixed-capacity, NUL-padded run of UTF-16 code units, as stored on flash.
/// `len()` is the number of code units before the first `0x0000`.
#[derive(Clone, Copy, Debug)]
pub struct FixedU16String<const N: usize> {
    units: [u16; N],
}

impl<const N: usize> FixedU16String<N> {
    pub fn empty() -> Self {
        FixedU16String { units: [0u16; N] }
    }

    /// Build from code units, truncating (and always NUL-terminating) at
    /// capacity. Returns `None` if `units` doesn't fit even with truncation
    /// room for the terminator.
    pub fn from_units(units: &[u16]) -> Option<Self> {
        if units.len() >= N {
            return None;
        }
        let mut buf = [0u16; N];
        buf[..units.len()].copy_from_slice(units);
        Some(FixedU16String { units: buf })
    }

    pub fn len(&self) -> usize {
        self.units.iter().position(|&u| u == 0).unwrap_or(N)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_units(&self) -> &[u16] {
        &self.units[..self.len()]
    }

    pub fn raw(&self) -> &[u16; N] {
        &self.units
    }
}

impl<const N: usize> Default for FixedU16String<N> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const N: usize> PartialEq for FixedU16String<N> {
    fn eq(&self, other: &Self) -> bool {
        self.as_units() == other.as_units()
    }
}
impl<const N: usize> Eq for FixedU16String<N> {}

impl<const N: usize> PartialOrd for FixedU16String<N> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<const N: usize> Ord for FixedU16String<N> {
    /// Lexicographic order over code units, the ordering sibling lists use.
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.as_units().cmp(other.as_units())
    }
}

impl<const N: usize> core::hash::Hash for FixedU16String<N> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.as_units().hash(state);
    }
}

pub type ServiceName = FixedU16String<MAX_SERVICE_LEN>;
pub type LoginString = FixedU16String<MAX_LOGIN_LEN>;
pub type DescriptionString = FixedU16String<MAX_DESCRIPTION_LEN>;
pub type ThirdFieldString = FixedU16String<MAX_THIRD_FIELD_LEN>;

/// What kind of children a parent's sibling-list entry owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParentKind {
    /// Service parent owning credential children (`NODE_TYPE_PARENT`).
    Credential,
    /// Service parent owning data (file/note) children (`NODE_TYPE_PARENT_DATA`).
    Data(DataCategory),
}

/// Data-child parents come in two flavors (notes vs. files) that share one
/// handler parameterized by data category.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataCategory {
    Standard,
    Notes,
}

#[derive(Clone)]
pub struct ParentNode {
    pub prev: NodeAddr,
    pub next: NodeAddr,
    pub first_child: NodeAddr,
    pub category_id: u8,
    pub kind: ParentKind,
    pub service_name: ServiceName,
}

impl ParentNode {
    pub fn new(kind: ParentKind, service_name: ServiceName) -> ParentNode {
        ParentNode {
            prev: NodeAddr::NULL,
            next: NodeAddr::NULL,
            first_child: NodeAddr::NULL,
            category_id: 0,
            kind,
            service_name,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialTypeId {
    Standard,
    WebAuthn,
}

#[derive(Clone)]
pub struct WebAuthnData {
    pub user_handle: [u8; WEBAUTHN_USER_HANDLE_MAX_LEN],
    pub user_handle_len: u8,
    pub credential_id: [u8; WEBAUTHN_CREDENTIAL_ID_LEN],
    pub key_type: u8,
    pub signature_counter: u32,
}

#[derive(Clone)]
pub struct TotpMaterial {
    pub secret: [u8; TOTP_SECRET_MAX_LEN],
    pub secret_len: u8,
    pub digits: u8,
    pub time_step: u8,
    pub sha_ver: u8,
    pub ctr: [u8; 3],
}

#[derive(Clone)]
pub struct CredentialChild {
    pub parent: NodeAddr,
    pub prev: NodeAddr,
    pub next: NodeAddr,
    pub login: LoginString,
    pub description: DescriptionString,
    pub third_field: ThirdFieldString,
    /// Encrypted password ciphertext; cleartext never lives here.
    pub password_ciphertext: [u8; MAX_PASSWORD_LEN],
    pub ctr: [u8; 3],
    /// Set for legacy-imported data; selects the XOR-CTR decrypt variant.
    /// No new write ever sets this.
    pub prev_gen: bool,
    pub totp: Option<TotpMaterial>,
    pub cred_type: CredentialTypeId,
    pub webauthn: Option<WebAuthnData>,
}

#[derive(Clone)]
pub struct DataChild {
    pub parent: NodeAddr,
    pub next: NodeAddr,
    pub chunk: [u8; DATA_CHUNK_LEN],
    pub chunk_len: u8,
}

#[derive(Clone)]
pub enum ChildNode {
    Credential(CredentialChild),
    Data(DataChild),
}

impl ChildNode {
    pub fn parent(&self) -> NodeAddr {
        match self {
            ChildNode::Credential(c) => c.parent,
            ChildNode::Data(d) => d.parent,
        }
    }

    pub fn as_credential(&self) -> Option<&CredentialChild> {
        match self {
            ChildNode::Credential(c) => Some(c),
            ChildNode::Data(_) => None,
        }
    }

    pub fn as_credential_mut(&mut self) -> Option<&mut CredentialChild> {
        match self {
            ChildNode::Credential(c) => Some(c),
            ChildNode::Data(_) => None,
        }
    }

    pub fn as_data(&self) -> Option<&DataChild> {
        match self {
            ChildNode::Data(d) => Some(d),
            ChildNode::Credential(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeDecodeError {
    Truncated,
    UnknownKind(u8),
    UnknownCredType(u8),
}

struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    fn new() -> ByteWriter {
        ByteWriter { buf: Vec::new() }
    }
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn addr(&mut self, a: NodeAddr) {
        self.u16(a.raw());
    }
    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }
    fn fixed_string<const N: usize>(&mut self, s: &FixedU16String<N>) {
        for unit in s.raw() {
            self.u16(*unit);
        }
    }
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> ByteReader<'a> {
        ByteReader { buf, pos: 0 }
    }
    fn u8(&mut self) -> Result<u8, NodeDecodeError> {
        let v = *self.buf.get(self.pos).ok_or(NodeDecodeError::Truncated)?;
        self.pos += 1;
        Ok(v)
    }
    fn u16(&mut self) -> Result<u16, NodeDecodeError> {
        let bytes = self.buf.get(self.pos..self.pos + 2).ok_or(NodeDecodeError::Truncated)?;
        self.pos += 2;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
    fn u32(&mut self) -> Result<u32, NodeDecodeError> {
        let bytes = self.buf.get(self.pos..self.pos + 4).ok_or(NodeDecodeError::Truncated)?;
        self.pos += 4;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
    fn addr(&mut self) -> Result<NodeAddr, NodeDecodeError> {
        Ok(NodeAddr::from_raw(self.u16()?))
    }
    fn array<const N: usize>(&mut self) -> Result<[u8; N], NodeDecodeError> {
        let bytes = self.buf.get(self.pos..self.pos + N).ok_or(NodeDecodeError::Truncated)?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }
    fn fixed_string<const N: usize>(&mut self) -> Result<FixedU16String<N>, NodeDecodeError> {
        let mut units = [0u16; N];
        for u in units.iter_mut() {
            *u = self.u16()?;
        }
        Ok(FixedU16String { units })
    }
}

const PARENT_KIND_CREDENTIAL: u8 = 0;
const PARENT_KIND_DATA_STANDARD: u8 = 1;
const PARENT_KIND_DATA_NOTES: u8 = 2;

impl ParentNode {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.addr(self.prev);
        w.addr(self.next);
        w.addr(self.first_child);
        w.u8(self.category_id);
        w.u8(match self.kind {
            ParentKind::Credential => PARENT_KIND_CREDENTIAL,
            ParentKind::Data(DataCategory::Standard) => PARENT_KIND_DATA_STANDARD,
            ParentKind::Data(DataCategory::Notes) => PARENT_KIND_DATA_NOTES,
        });
        w.fixed_string(&self.service_name);
        w.buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<ParentNode, NodeDecodeError> {
        let mut r = ByteReader::new(buf);
        let prev = r.addr()?;
        let next = r.addr()?;
        let first_child = r.addr()?;
        let category_id = r.u8()?;
        let kind = match r.u8()? {
            PARENT_KIND_CREDENTIAL => ParentKind::Credential,
            PARENT_KIND_DATA_STANDARD => ParentKind::Data(DataCategory::Standard),
            PARENT_KIND_DATA_NOTES => ParentKind::Data(DataCategory::Notes),
            other => return Err(NodeDecodeError::UnknownKind(other)),
        };
        let service_name = r.fixed_string()?;
        Ok(ParentNode { prev, next, first_child, category_id, kind, service_name })
    }
}

const CRED_TYPE_STANDARD: u8 = 0;
const CRED_TYPE_WEBAUTHN: u8 = 1;
const CHILD_TAG_CREDENTIAL: u8 = 0;
const CHILD_TAG_DATA: u8 = 1;

impl ChildNode {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        match self {
            ChildNode::Credential(c) => {
                w.u8(CHILD_TAG_CREDENTIAL);
                w.addr(c.parent);
                w.addr(c.prev);
                w.addr(c.next);
                w.fixed_string(&c.login);
                w.fixed_string(&c.description);
                w.fixed_string(&c.third_field);
                w.bytes(&c.password_ciphertext);
                w.bytes(&c.ctr);
                w.u8(c.prev_gen as u8);
                w.u8(match c.cred_type {
                    CredentialTypeId::Standard => CRED_TYPE_STANDARD,
                    CredentialTypeId::WebAuthn => CRED_TYPE_WEBAUTHN,
                });
                match &c.totp {
                    Some(t) => {
                        w.u8(1);
                        w.bytes(&t.secret);
                        w.u8(t.secret_len);
                        w.u8(t.digits);
                        w.u8(t.time_step);
                        w.u8(t.sha_ver);
                        w.bytes(&t.ctr);
                    }
                    None => w.u8(0),
                }
                match &c.webauthn {
                    Some(wa) => {
                        w.u8(1);
                        w.bytes(&wa.user_handle);
                        w.u8(wa.user_handle_len);
                        w.bytes(&wa.credential_id);
                        w.u8(wa.key_type);
                        w.u32(wa.signature_counter);
                    }
                    None => w.u8(0),
                }
            }
            ChildNode::Data(d) => {
                w.u8(CHILD_TAG_DATA);
                w.addr(d.parent);
                w.addr(d.next);
                w.u8(d.chunk_len);
                w.bytes(&d.chunk);
            }
        }
        w.buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<ChildNode, NodeDecodeError> {
        let mut r = ByteReader::new(buf);
        match r.u8()? {
            CHILD_TAG_CREDENTIAL => {
                let parent = r.addr()?;
                let prev = r.addr()?;
                let next = r.addr()?;
                let login = r.fixed_string()?;
                let description = r.fixed_string()?;
                let third_field = r.fixed_string()?;
                let password_ciphertext = r.array()?;
                let ctr = r.array()?;
                let prev_gen = r.u8()? != 0;
                let cred_type = match r.u8()? {
                    CRED_TYPE_STANDARD => CredentialTypeId::Standard,
                    CRED_TYPE_WEBAUTHN => CredentialTypeId::WebAuthn,
                    other => return Err(NodeDecodeError::UnknownCredType(other)),
                };
                let totp = if r.u8()? != 0 {
                    Some(TotpMaterial {
                        secret: r.array()?,
                        secret_len: r.u8()?,
                        digits: r.u8()?,
                        time_step: r.u8()?,
                        sha_ver: r.u8()?,
                        ctr: r.array()?,
                    })
                } else {
                    None
                };
                let webauthn = if r.u8()? != 0 {
                    Some(WebAuthnData {
                        user_handle: r.array()?,
                        user_handle_len: r.u8()?,
                        credential_id: r.array()?,
                        key_type: r.u8()?,
                        signature_counter: r.u32()?,
                    })
                } else {
                    None
                };
                Ok(ChildNode::Credential(CredentialChild {
                    parent,
                    prev,
                    next,
                    login,
                    description,
                    third_field,
                    password_ciphertext,
                    ctr,
                    prev_gen,
                    totp,
                    cred_type,
                    webauthn,
                }))
            }
            CHILD_TAG_DATA => {
                let parent = r.addr()?;
                let next = r.addr()?;
                let chunk_len = r.u8()?;
                let chunk = r.array()?;
                Ok(ChildNode::Data(DataChild { parent, next, chunk, chunk_len }))
            }
            other => Err(NodeDecodeError::UnknownKind(other)),
        }
    }
}
