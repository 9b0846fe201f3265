//! Command dispatcher (C7): the host-facing front door. `parse()` runs the
//! five-step pipeline spec §4.7 describes — frame-length check, GCM
//! bitmask/payload-budget adjustment, restriction filter, mode gate,
//! table-driven handler lookup — and every handler below emits exactly one
//! response message except `PLAT_INFO`, which spec §6 calls out as a
//! two-message reply.
//!
//! Grounded on the original firmware's `comms_hid_msgs_parse` for the overall
//! pipeline shape (silent drop on a length mismatch, restriction filter
//! before the mode gate, mode gate before the opcode switch), reworked per
//! spec §9's redesign flag into an explicit per-opcode descriptor
//! (`Opcode::requires_management_mode`/`requires_unlock`) instead of the
//! original's contiguous numeric range and repeated inline checks.

use rand_core::RngCore;

use mp_crypto::aes_ctr::{AesCtrEngine, Ctr, CtrBound};
use mp_crypto::device_auth;
use mp_nodemgmt::{NodeManager, UserId};
use mp_store::node::{DataCategory, DescriptionString, LoginString, ServiceName, ThirdFieldString};
use mp_store::{FlashMedium, NodeAddr, SLOT_LEN};

use crate::collaborators::{AuxMcu, HostPrompt, RandomSource};
use crate::device::{DeviceState, UserSecurityFlags};
use crate::message::{ack_nack, empty_response, na, retry, Message, GCM_TAG_LEN, MAX_PAYLOAD_LEN};
use crate::opcode::{Opcode, Restriction, GCM_FLAG};
use crate::policy::{CheckResult, CredentialPolicy, SecretReply};
use crate::settings::{CpzLutEntry, SettingsStore};

/// Bridges `mp_crypto::aes_ctr::CtrBound` to a user profile's persisted bound
/// without holding a `NodeManager` borrow across the encrypt call itself:
/// the caller copies the value in, lets the engine advance it in RAM, then
/// copies it back out. A wrapper borrowing `NodeManager` directly would
/// collide with the `&mut NodeManager` the same call also needs to store the
/// resulting node (see DESIGN.md).
struct LocalCtrBound {
    value: Ctr,
}

impl CtrBound for LocalCtrBound {
    fn read_bound(&self) -> Ctr {
        self.value
    }

    fn write_bound(&mut self, bound: Ctr) {
        self.value = bound;
    }
}

/// Encodes a fixed list of optional UTF-16LE, NUL-terminated strings as an
/// offset table followed by their concatenated bytes (spec §6). Offsets are
/// assigned in list order with no gaps, so they come out strictly increasing
/// by the previous string's length + 1, as the wire invariant requires.
fn encode_string_list(strings: &[Option<&[u16]>]) -> Vec<u8> {
    let mut offsets = Vec::with_capacity(strings.len());
    let mut body = Vec::new();
    for s in strings {
        match s {
            Some(units) => {
                offsets.push(body.len() as u16);
                for u in *units {
                    body.extend_from_slice(&u.to_le_bytes());
                }
                body.extend_from_slice(&0u16.to_le_bytes());
            }
            None => offsets.push(0xFFFFu16),
        }
    }
    let mut out = Vec::with_capacity(offsets.len() * 2 + body.len());
    for o in offsets {
        out.extend_from_slice(&o.to_le_bytes());
    }
    out.extend_from_slice(&body);
    out
}

/// Inverse of `encode_string_list`. Returns the decoded strings plus the
/// total number of payload bytes consumed (header + body), so the caller can
/// locate any trailing raw fields that follow the string region.
fn decode_string_list(payload: &[u8], count: usize) -> Option<(Vec<Option<Vec<u16>>>, usize)> {
    if payload.len() < count * 2 {
        return None;
    }
    let mut offsets = Vec::with_capacity(count);
    for i in 0..count {
        offsets.push(u16::from_le_bytes([payload[i * 2], payload[i * 2 + 1]]));
    }
    let body = &payload[count * 2..];
    let mut out = Vec::with_capacity(count);
    let mut max_end = 0usize;
    for o in offsets {
        if o == 0xFFFF {
            out.push(None);
            continue;
        }
        let start = o as usize;
        if start > body.len() {
            return None;
        }
        let mut units = Vec::new();
        let mut pos = start;
        loop {
            if pos + 2 > body.len() {
                return None;
            }
            let u = u16::from_le_bytes([body[pos], body[pos + 1]]);
            pos += 2;
            if u == 0 {
                break;
            }
            units.push(u);
        }
        max_end = max_end.max(pos);
        out.push(Some(units));
    }
    Some((out, count * 2 + max_end))
}

fn fixed_string<const N: usize>(units: &[u16]) -> Option<mp_store::node::FixedU16String<N>> {
    mp_store::node::FixedU16String::<N>::from_units(units)
}

/// Days since the civil epoch (1970-01-01) for a given proleptic-Gregorian
/// date, per Howard Hinnant's public-domain `days_from_civil` algorithm.
/// `month` is 1-12. No external date crate is pulled in for this: the
/// workspace has none, and `SET_DATE` is the only call site that needs it.
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = (month as i64 + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

/// Converts the six `SET_DATE` fields (spec.md:198) to a unix timestamp.
/// Returns `None` for an out-of-range month/day/hour/minute/second.
fn unix_time_from_fields(year: u16, month: u16, day: u16, hour: u16, minute: u16, second: u16) -> Option<u64> {
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) || hour > 23 || minute > 59 || second > 59 {
        return None;
    }
    let days = days_from_civil(year as i64, month as u32, day as u32);
    let secs = days * 86_400 + hour as i64 * 3600 + minute as i64 * 60 + second as i64;
    u64::try_from(secs).ok()
}

/// The host-facing command processor. Generic over the four collaborator
/// seams spec §9 names: flash medium, user-prompt surface, auxiliary MCU,
/// and randomness source.
pub struct Dispatcher<M: FlashMedium, H: HostPrompt, A: AuxMcu, R: RandomSource> {
    pub device: DeviceState,
    pub settings: SettingsStore,
    pub nodes: NodeManager<M>,
    pub policy: CredentialPolicy,
    pub host_prompt: H,
    pub aux: A,
    pub rng: R,
    pub current_user: Option<UserId>,
    pub engine: Option<AesCtrEngine>,
    pub device_ops_key: [u8; 32],
    pub platform_serial: u32,
}

impl<M: FlashMedium, H: HostPrompt, A: AuxMcu, R: RandomSource> Dispatcher<M, H, A, R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        medium: M,
        host_prompt: H,
        aux: A,
        rng: R,
        device_ops_key: [u8; 32],
        platform_serial: u32,
    ) -> Dispatcher<M, H, A, R> {
        Dispatcher {
            device: DeviceState::new(),
            settings: SettingsStore::new(),
            nodes: NodeManager::new(medium),
            policy: CredentialPolicy::new(),
            host_prompt,
            aux,
            rng,
            current_user: None,
            engine: None,
            device_ops_key,
            platform_serial,
        }
    }

    /// The five-step pipeline (spec §4.7). `None` means the frame was
    /// silently dropped; `Some` carries the one (or, for `PLAT_INFO`, two)
    /// response messages to send back.
    pub fn parse(
        &mut self,
        request: &Message,
        declared_payload_length: u16,
        restriction: Restriction,
        now_ms: u64,
    ) -> Option<Vec<Message>> {
        if declared_payload_length as usize != request.payload.len() {
            log::warn!("core: declared payload length mismatch, dropping frame silently");
            return None;
        }

        let gcm_tagged = request.message_type & GCM_FLAG != 0;
        let max_payload = if gcm_tagged { MAX_PAYLOAD_LEN - GCM_TAG_LEN } else { MAX_PAYLOAD_LEN };
        if request.payload.len() > max_payload {
            log::warn!("core: payload exceeds the gcm-adjusted budget, dropping frame silently");
            return None;
        }

        let op = match Opcode::from_wire_value(request.message_type) {
            Some(op) => op,
            None => {
                log::warn!("core: unknown opcode 0x{:04x}, dropping frame silently", request.message_type);
                return None;
            }
        };

        if !restriction.allows(op) {
            return Some(vec![retry(request.message_type)]);
        }

        if op.requires_management_mode() && !self.device.management_mode {
            return Some(vec![ack_nack(request.message_type, false)]);
        }

        if op.requires_unlock() && self.device.require_unlocked().is_err() {
            return Some(vec![ack_nack(request.message_type, false)]);
        }

        Some(self.dispatch(op, &request.payload, now_ms))
    }

    fn nack(&self, message_type: u16) -> Vec<Message> {
        vec![ack_nack(message_type, false)]
    }

    fn ack(&self, message_type: u16) -> Vec<Message> {
        vec![ack_nack(message_type, true)]
    }

    fn dispatch(&mut self, op: Opcode, payload: &[u8], now_ms: u64) -> Vec<Message> {
        let t = op.wire_value();
        use Opcode::*;
        match op {
            Ping => self.ack(t),
            GetDeviceStatus => self.handle_get_device_status(t),
            PlatInfo => self.handle_plat_info(t),
            GetDeviceIntSn => {
                let serial = self.aux.plat_info().internal_serial;
                vec![Message::new(t, serial.to_le_bytes().to_vec())]
            }
            GetDiagData => vec![empty_response(t, 16)],

            // Host computer lock-screen presence, not the device's own
            // session (spec §4.6: `computer_locked_state` / `IM_LOCKED`,
            // `IM_UNLOCKED` / "NO_PWD_PROMPT optimisation"); distinct from
            // `LOCK_DEVICE`, which ends the smartcard session below.
            ImLocked => {
                self.device.computer_locked_state = true;
                self.ack(t)
            }
            ImUnlocked => {
                self.device.computer_locked_state = false;
                self.ack(t)
            }
            WakeUpDevice => self.ack(t),
            SetCurSvc => self.handle_set_cur_svc(t, payload),
            CancelReq => self.ack(t),

            GetDeviceSettings => self.handle_get_device_setting(t, payload),
            SetDeviceSettings => self.handle_set_device_setting(t, payload),
            GetUserSettings => self.handle_get_user_settings(t),
            GetCategoriesStr => self.handle_get_category_string(t, payload),
            SetCategoriesStr => self.handle_set_category_string(t, payload),
            GetUserKeybId => self.handle_get_cpz_byte(t, |e| e.usb_keyboard_layout_id),
            SetUserKeybId => self.handle_set_cpz_byte(t, payload, |e, v| e.usb_keyboard_layout_id = v),
            GetUserLangId => self.handle_get_cpz_byte(t, |e| e.language_id),
            SetUserLangId => self.handle_set_cpz_byte(t, payload, |e, v| e.language_id = v),
            GetDeviceLangId => self.handle_get_device_setting(t, &[DEVICE_LANG_SETTING_ID]),
            SetDeviceLangId => {
                let mut buf = vec![DEVICE_LANG_SETTING_ID];
                buf.extend_from_slice(payload);
                self.handle_set_device_setting(t, &buf)
            }
            SetCurCategory => self.handle_set_cur_category(t, payload),

            AddUnknownCardId => self.handle_add_unknown_card(t, payload),
            LockDevice => {
                self.device.lock();
                self.ack(t)
            }
            ResetUnknownCard => self.ack(t),
            GetNbFreeUsers => vec![Message::new(t, (self.settings.count_free() as u16).to_le_bytes().to_vec())],
            GetCurCardCpz => self.handle_get_cur_card_cpz(t),
            EraseUser => self.handle_erase_user(t),

            InformCurSvc => self.handle_set_cur_svc(t, payload),
            GetCred => self.handle_get_cred(t, payload, now_ms, false),
            GetTotpCode => self.handle_get_cred(t, payload, now_ms, true),
            StoreCred => self.handle_store_cred(t, payload),
            StoreTotpCred => self.handle_store_totp_cred(t, payload),
            CheckPassword => self.handle_check_password(t, payload, now_ms),
            ChangeNodePwd => self.handle_change_node_password(t, payload),

            TestFileId => self.handle_test_data(t, payload, DataCategory::Standard),
            CreateFileId => self.handle_create_data(t, payload, DataCategory::Standard),
            AddNoteId => self.handle_create_data(t, payload, DataCategory::Notes),
            AddFileDataId => self.handle_add_data_chunk(t, payload),
            AddNoteDataId => self.handle_add_data_chunk(t, payload),
            GetFileDataId => self.handle_get_data(t, payload),
            AccessNoteId => self.handle_get_data(t, payload),
            DeleteFileId => self.handle_delete_data(t, payload),
            DeleteNoteId => self.handle_delete_data(t, payload),
            ScanFileId => self.handle_scan_data(t, payload, DataCategory::Standard),
            ScanNoteId => self.handle_scan_data(t, payload, DataCategory::Notes),

            StartMmm => {
                let _ = self.device.enter_management_mode();
                self.ack(t)
            }
            EndMmm => {
                self.device.exit_management_mode();
                self.ack(t)
            }
            ReadNode => self.handle_read_node(t, payload),
            WriteNode => self.handle_write_node(t, payload),
            GetFreeNodes => {
                let usage = self.nodes.scan_node_usage();
                let mut buf = Vec::with_capacity(6);
                buf.extend_from_slice(&usage.total_slots.to_le_bytes());
                buf.extend_from_slice(&usage.used_slots.to_le_bytes());
                buf.extend_from_slice(&usage.free_slots.to_le_bytes());
                vec![Message::new(t, buf)]
            }
            GetStartParents => self.handle_get_start_parents(t),
            SetCredStartParent => self.handle_set_start_parent(t, payload, true),
            SetDataStartParent => self.handle_set_start_parent(t, payload, false),
            SetStartParents => self.handle_set_start_parents(t, payload),
            GetCredChangeNb => self.handle_get_change_number(t, |n, uid| n.credential_change_number(uid)),
            SetCredChangeNb => self.handle_set_change_number(t, payload, |n, uid, v| n.set_credential_change_number(uid, v)),
            GetDataChangeNb => self.handle_get_change_number(t, |n, uid| n.data_change_number(uid)),
            SetDataChangeNb => self.handle_set_change_number(t, payload, |n, uid, v| n.set_data_change_number(uid, v)),
            GetCtrValue => self.handle_get_ctr_value(t),
            SetCtrValue => self.handle_set_ctr_value(t, payload),
            GetFavorite => self.handle_get_favorite(t, payload),
            SetFavorite => self.handle_set_favorite(t, payload),
            GetFavorites => self.handle_get_favorites(t),
            GetCpzLutEntry => self.handle_get_cpz_lut_entry(t),

            PrepareSnFlash => self.ack(t),
            SetDeviceSn => self.ack(t),
            SwitchOffNxtDsc => self.ack(t),

            DevAuthChallenge => self.handle_dev_auth_challenge(t, payload),

            Get32bRng => {
                let v = self.rng.next_u32();
                vec![Message::new(t, v.to_le_bytes().to_vec())]
            }
            SetDate => self.handle_set_date(t, payload, now_ms),

            StartBundleUl => {
                self.device.start_bundle_upload();
                self.ack(t)
            }
            BundleWrite256b => {
                if self.device.require_bundle_upload().is_err() {
                    return self.nack(t);
                }
                self.ack(t)
            }
            BundleUlDone => {
                self.device.finish_bundle_upload();
                self.ack(t)
            }

            GetCustBleName => {
                let units: Vec<u16> = self.aux.ble_name().encode_utf16().collect();
                vec![Message::new(t, encode_string_list(&[Some(&units)]))]
            }
            SetCustBleName => {
                match decode_string_list(payload, 1) {
                    Some((strings, _)) => match &strings[0] {
                        Some(units) => {
                            let name = String::from_utf16_lossy(units);
                            self.aux.set_ble_name(&name);
                            self.ack(t)
                        }
                        None => self.nack(t),
                    },
                    None => self.nack(t),
                }
            }
            NimhRecondition => self.ack(t),
            DisableNoPrompt => self.ack(t),
        }
    }

    // ---- status / identity ------------------------------------------------

    /// Spec §6 fixed 5-byte layout: byte 0 status bits, byte 1 battery
    /// (charging folded into bit 7), bytes 2-3 user security flags (zero if
    /// locked), byte 4 the settings-changed latch, cleared by this read.
    fn handle_get_device_status(&mut self, t: u16) -> Vec<Message> {
        let mut flags = 0u8;
        flags |= (self.device.card_absent as u8) << 0;
        flags |= (self.device.smartcard_unlocked as u8) << 2;
        flags |= (self.device.unknown_card as u8) << 3;
        flags |= (self.device.management_mode as u8) << 4;
        flags |= (self.device.bundle_upload_allowed as u8) << 5;

        let security_bits = if self.device.smartcard_unlocked {
            self.current_user.and_then(|uid| self.settings.find_by_user_id(uid)).map(|e| e.flags).unwrap_or(0)
        } else {
            0
        };

        let battery = self.aux.battery_status();
        let battery_byte = if battery.charging {
            ((battery.percent as u16 * 10).min(0x7F) as u8) | 0x80
        } else {
            battery.percent & 0x7F
        };

        let settings_changed = self.settings.settings_changed;
        self.settings.settings_changed = false;

        let mut buf = Vec::with_capacity(5);
        buf.push(flags);
        buf.push(battery_byte);
        buf.extend_from_slice(&security_bits.to_le_bytes());
        buf.push(settings_changed as u8);
        vec![Message::new(t, buf)]
    }

    /// Two response messages, per spec §6: the platform/memory identity
    /// fields, then the serial numbers.
    fn handle_plat_info(&mut self, t: u16) -> Vec<Message> {
        let info = self.aux.plat_info();
        let mut first = Vec::with_capacity(11);
        first.extend_from_slice(&info.main_fw_major.to_le_bytes());
        first.extend_from_slice(&info.main_fw_minor.to_le_bytes());
        first.extend_from_slice(&info.aux_fw_major.to_le_bytes());
        first.extend_from_slice(&info.aux_fw_minor.to_le_bytes());
        first.push(info.memory_size_code);
        first.extend_from_slice(&info.bundle_version.to_le_bytes());

        let mut second = Vec::with_capacity(8);
        second.extend_from_slice(&info.platform_serial.to_le_bytes());
        second.extend_from_slice(&info.internal_serial.to_le_bytes());

        vec![Message::new(t, first), Message::new(t, second)]
    }

    // ---- presence / settings -----------------------------------------------

    fn handle_set_cur_svc(&mut self, t: u16, payload: &[u8]) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        let (strings, _) = match decode_string_list(payload, 1) {
            Some(v) => v,
            None => return self.nack(t),
        };
        let service: ServiceName = match &strings[0] {
            Some(units) => match fixed_string(units) {
                Some(s) => s,
                None => return self.nack(t),
            },
            None => return self.nack(t),
        };
        match self.policy.inform_current_service(&self.nodes, uid, &service) {
            Ok(()) => self.ack(t),
            Err(_) => self.nack(t),
        }
    }

    fn handle_get_device_setting(&self, t: u16, payload: &[u8]) -> Vec<Message> {
        let id = match payload.first() {
            Some(&id) => id,
            None => return self.nack(t),
        };
        match self.settings.get_setting(id) {
            Ok(v) => vec![Message::new(t, v.to_vec())],
            Err(_) => self.nack(t),
        }
    }

    fn handle_set_device_setting(&mut self, t: u16, payload: &[u8]) -> Vec<Message> {
        if payload.len() < 5 {
            return self.nack(t);
        }
        let id = payload[0];
        let mut value = [0u8; 4];
        value.copy_from_slice(&payload[1..5]);
        match self.settings.set_setting(id, value) {
            Ok(()) => self.ack(t),
            Err(_) => self.nack(t),
        }
    }

    fn handle_get_user_settings(&self, t: u16) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        match self.settings.find_by_user_id(uid) {
            Some(e) => vec![Message::new(t, e.flags.to_le_bytes().to_vec())],
            None => self.nack(t),
        }
    }

    fn handle_get_category_string(&self, t: u16, payload: &[u8]) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        let cat = match payload.first() {
            Some(&c) => c,
            None => return self.nack(t),
        };
        match self.nodes.category_string(uid, cat) {
            Ok(s) => vec![Message::new(t, encode_string_list(&[Some(s.as_units())]))],
            Err(_) => self.nack(t),
        }
    }

    fn handle_set_category_string(&mut self, t: u16, payload: &[u8]) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        if payload.is_empty() {
            return self.nack(t);
        }
        let cat = payload[0];
        let (strings, _) = match decode_string_list(&payload[1..], 1) {
            Some(v) => v,
            None => return self.nack(t),
        };
        let value = match &strings[0] {
            Some(units) => match fixed_string(units) {
                Some(s) => s,
                None => return self.nack(t),
            },
            None => return self.nack(t),
        };
        match self.nodes.set_category_string(uid, cat, value) {
            Ok(()) => self.ack(t),
            Err(_) => self.nack(t),
        }
    }

    fn handle_get_cpz_byte(&self, t: u16, field: impl FnOnce(&CpzLutEntry) -> u8) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        match self.settings.find_by_user_id(uid) {
            Some(e) => vec![Message::new(t, vec![field(e)])],
            None => self.nack(t),
        }
    }

    fn handle_set_cpz_byte(&mut self, t: u16, payload: &[u8], set: impl FnOnce(&mut CpzLutEntry, u8)) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        let value = match payload.first() {
            Some(&v) => v,
            None => return self.nack(t),
        };
        let mut entry = match self.settings.find_by_user_id(uid) {
            Some(e) => *e,
            None => return self.nack(t),
        };
        set(&mut entry, value);
        match self.settings.update(entry) {
            Ok(()) => self.ack(t),
            Err(_) => self.nack(t),
        }
    }

    fn handle_set_cur_category(&mut self, t: u16, payload: &[u8]) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        let cat = match payload.first() {
            Some(&c) => c,
            None => return self.nack(t),
        };
        match self.nodes.set_current_category(uid, cat) {
            Ok(()) => self.ack(t),
            Err(_) => self.nack(t),
        }
    }

    // ---- user lifecycle -----------------------------------------------------

    fn handle_add_unknown_card(&mut self, t: u16, payload: &[u8]) -> Vec<Message> {
        if payload.len() < 16 {
            return self.nack(t);
        }
        let mut cpz = [0u8; 16];
        cpz.copy_from_slice(&payload[..16]);

        let mut nonce = [0u8; 16];
        self.rng.fill_bytes(&mut nonce);

        let uid = match self.nodes.new_user(nonce) {
            Ok(uid) => uid,
            Err(_) => return self.nack(t),
        };
        let entry = CpzLutEntry {
            cpz,
            user_id: uid,
            nonce,
            flags: 0,
            provisioned_key: None,
            language_id: 0,
            usb_keyboard_layout_id: 0,
            ble_keyboard_layout_id: 0,
        };
        match self.settings.store(entry) {
            Ok(()) => {
                // spec §4.9: `CARD_UNKNOWN --erase_and_pair--> UNLOCKED (MMM set)`.
                self.device.card_inserted_known();
                self.device.unlock();
                let _ = self.device.enter_management_mode();
                vec![Message::new(t, uid.to_le_bytes().to_vec())]
            }
            Err(_) => self.nack(t),
        }
    }

    fn handle_get_cur_card_cpz(&self, t: u16) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        match self.settings.find_by_user_id(uid) {
            Some(e) => vec![Message::new(t, e.cpz.to_vec())],
            None => self.nack(t),
        }
    }

    fn handle_erase_user(&mut self, t: u16) -> Vec<Message> {
        let uid = match self.current_user.take() {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        let node_result = self.nodes.erase_user(uid);
        let settings_result = self.settings.erase_by_user_id(uid);
        self.engine = None;
        self.device.lock();
        match (node_result, settings_result) {
            (Ok(()), Ok(())) => self.ack(t),
            _ => self.nack(t),
        }
    }

    // ---- credential flow ----------------------------------------------------

    fn handle_get_cred(&mut self, t: u16, payload: &[u8], now_ms: u64, force_totp: bool) -> Vec<Message> {
        let now_unix = self.settings.current_unix_time(now_ms);
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        let engine = match self.engine.as_ref() {
            Some(e) => e,
            None => return self.nack(t),
        };

        let (want_totp, strings) = if force_totp {
            match decode_string_list(payload, 2) {
                Some((s, _)) => (true, s),
                None => return self.nack(t),
            }
        } else {
            if payload.is_empty() {
                return self.nack(t);
            }
            match decode_string_list(&payload[1..], 2) {
                Some((s, _)) => (payload[0] != 0, s),
                None => return self.nack(t),
            }
        };

        let service: ServiceName = match strings[0].as_ref().and_then(|u| fixed_string(u)) {
            Some(s) => s,
            None => return self.nack(t),
        };
        let login: Option<LoginString> = match &strings[1] {
            Some(units) => match fixed_string::<{ mp_store::node::MAX_LOGIN_LEN }>(units) {
                Some(l) => Some(l),
                None => return self.nack(t),
            },
            None => None,
        };

        match self.policy.get_credential(&self.nodes, uid, engine, &service, login.as_ref(), want_totp, now_unix) {
            Ok(reply) => {
                let (kind, remaining, secret_units): (u8, u8, Vec<u16>) = match reply.secret {
                    SecretReply::Password(p) => (0, 0, p.iter().take_while(|&&b| b != 0).map(|&b| b as u16).collect()),
                    SecretReply::Totp { code, remaining_secs } => (1, remaining_secs, code.encode_utf16().collect()),
                };
                let mut buf = Vec::new();
                buf.push(kind);
                buf.push(remaining);
                buf.extend_from_slice(&reply.child_addr.raw().to_le_bytes());
                buf.extend_from_slice(&encode_string_list(&[Some(reply.login.as_units()), Some(&secret_units)]));
                vec![Message::new(t, buf)]
            }
            Err(_) => self.nack(t),
        }
    }

    fn handle_store_cred(&mut self, t: u16, payload: &[u8]) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        if payload.is_empty() {
            return self.nack(t);
        }
        let password_present = payload[0] != 0;
        let (strings, consumed) = match decode_string_list(&payload[1..], 4) {
            Some(v) => v,
            None => return self.nack(t),
        };

        let service: ServiceName = match strings[0].as_ref().and_then(|u| fixed_string(u)) {
            Some(s) => s,
            None => return self.nack(t),
        };
        let login: LoginString = match strings[1].as_ref().and_then(|u| fixed_string(u)) {
            Some(l) => l,
            None => return self.nack(t),
        };
        let desc: Option<DescriptionString> = strings[2].as_ref().and_then(|u| fixed_string(u));
        let third: Option<ThirdFieldString> = strings[3].as_ref().and_then(|u| fixed_string(u));

        let rest = &payload[1 + consumed..];
        let password: Option<Vec<u8>> = if password_present {
            match rest.first() {
                Some(&len) if rest.len() >= 1 + len as usize => Some(rest[1..1 + len as usize].to_vec()),
                _ => return self.nack(t),
            }
        } else {
            None
        };

        let mut bound = LocalCtrBound {
            value: match self.nodes.profile(uid) {
                Ok(p) => Ctr(p.ctr_bound),
                Err(_) => return self.nack(t),
            },
        };
        let result = match self.engine.as_mut() {
            Some(engine) => self.policy.store_credential(
                &mut self.nodes,
                uid,
                engine,
                &mut bound,
                &service,
                &login,
                desc,
                third,
                password.as_deref(),
            ),
            None => return self.nack(t),
        };
        if let Ok(p) = self.nodes.profile_mut(uid) {
            p.ctr_bound = bound.value.0;
        }

        match result {
            Ok(_addr) => self.ack(t),
            Err(_) => self.nack(t),
        }
    }

    fn handle_store_totp_cred(&mut self, t: u16, payload: &[u8]) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        if payload.len() < 6 {
            return self.nack(t);
        }
        let child_addr = NodeAddr::from_raw(u16::from_le_bytes([payload[0], payload[1]]));
        let digits = payload[2];
        let time_step = payload[3];
        let sha_ver = payload[4];
        let secret_len = payload[5] as usize;
        if payload.len() < 6 + secret_len {
            return self.nack(t);
        }
        let secret = &payload[6..6 + secret_len];

        let mut bound = LocalCtrBound {
            value: match self.nodes.profile(uid) {
                Ok(p) => Ctr(p.ctr_bound),
                Err(_) => return self.nack(t),
            },
        };
        let result = match self.engine.as_mut() {
            Some(engine) => self.policy.store_totp(&mut self.nodes, uid, engine, &mut bound, child_addr, secret, digits, time_step, sha_ver),
            None => return self.nack(t),
        };
        if let Ok(p) = self.nodes.profile_mut(uid) {
            p.ctr_bound = bound.value.0;
        }

        match result {
            Ok(()) => self.ack(t),
            Err(_) => self.nack(t),
        }
    }

    fn handle_check_password(&mut self, t: u16, payload: &[u8], now_ms: u64) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        let (strings, consumed) = match decode_string_list(payload, 2) {
            Some(v) => v,
            None => return self.nack(t),
        };
        let service: ServiceName = match strings[0].as_ref().and_then(|u| fixed_string(u)) {
            Some(s) => s,
            None => return self.nack(t),
        };
        let login: LoginString = match strings[1].as_ref().and_then(|u| fixed_string(u)) {
            Some(l) => l,
            None => return self.nack(t),
        };
        let rest = &payload[consumed..];
        let candidate = match rest.first() {
            Some(&len) if rest.len() >= 1 + len as usize => &rest[1..1 + len as usize],
            _ => return self.nack(t),
        };

        let engine = match self.engine.as_ref() {
            Some(e) => e,
            None => return self.nack(t),
        };

        match self.policy.check_credential(&self.nodes, uid, engine, &mut self.device.check_password_throttle, now_ms, &service, &login, candidate) {
            Ok(CheckResult::Ok) => self.ack(t),
            Ok(CheckResult::Mismatch) => self.nack(t),
            Ok(CheckResult::RateLimited) => vec![na(t)],
            Err(_) => self.nack(t),
        }
    }

    fn handle_change_node_password(&mut self, t: u16, payload: &[u8]) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        if payload.len() < 3 {
            return self.nack(t);
        }
        let child_addr = NodeAddr::from_raw(u16::from_le_bytes([payload[0], payload[1]]));
        let pwlen = payload[2] as usize;
        if payload.len() < 3 + pwlen {
            return self.nack(t);
        }
        let new_password = &payload[3..3 + pwlen];

        let security = self
            .settings
            .find_by_user_id(uid)
            .map(|e| UserSecurityFlags::from_bits(e.flags))
            .unwrap_or_default();

        let mut bound = LocalCtrBound {
            value: match self.nodes.profile(uid) {
                Ok(p) => Ctr(p.ctr_bound),
                Err(_) => return self.nack(t),
            },
        };
        let result = match self.engine.as_mut() {
            Some(engine) => self.policy.change_node_password(&mut self.nodes, uid, engine, &mut bound, security, child_addr, new_password),
            None => return self.nack(t),
        };
        if let Ok(p) = self.nodes.profile_mut(uid) {
            p.ctr_bound = bound.value.0;
        }

        match result {
            Ok(()) => self.ack(t),
            Err(_) => self.nack(t),
        }
    }

    // ---- data / notes ---------------------------------------------------

    fn handle_test_data(&self, t: u16, payload: &[u8], category: DataCategory) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        let (strings, _) = match decode_string_list(payload, 1) {
            Some(v) => v,
            None => return self.nack(t),
        };
        let service: ServiceName = match strings[0].as_ref().and_then(|u| fixed_string(u)) {
            Some(s) => s,
            None => return self.nack(t),
        };
        match self.policy.check_data(&self.nodes, uid, &service, category) {
            Ok(true) => self.ack(t),
            _ => self.nack(t),
        }
    }

    fn handle_create_data(&mut self, t: u16, payload: &[u8], category: DataCategory) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        let (strings, _) = match decode_string_list(payload, 1) {
            Some(v) => v,
            None => return self.nack(t),
        };
        let service: ServiceName = match strings[0].as_ref().and_then(|u| fixed_string(u)) {
            Some(s) => s,
            None => return self.nack(t),
        };
        match self.nodes.add_data(uid, &service, category) {
            Ok(addr) => vec![Message::new(t, addr.raw().to_le_bytes().to_vec())],
            Err(_) => self.nack(t),
        }
    }

    fn handle_add_data_chunk(&mut self, t: u16, payload: &[u8]) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        if payload.len() < 3 {
            return self.nack(t);
        }
        let parent_addr = NodeAddr::from_raw(u16::from_le_bytes([payload[0], payload[1]]));
        let chunk_len = payload[2];
        if chunk_len as usize > mp_store::node::DATA_CHUNK_LEN || payload.len() < 3 + chunk_len as usize {
            return self.nack(t);
        }
        let mut chunk = [0u8; mp_store::node::DATA_CHUNK_LEN];
        chunk[..chunk_len as usize].copy_from_slice(&payload[3..3 + chunk_len as usize]);
        match self.nodes.add_data_chunk(uid, parent_addr, chunk, chunk_len) {
            Ok(addr) => vec![Message::new(t, addr.raw().to_le_bytes().to_vec())],
            Err(_) => self.nack(t),
        }
    }

    fn handle_get_data(&self, t: u16, payload: &[u8]) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        if payload.len() < 2 {
            return self.nack(t);
        }
        let parent_addr = NodeAddr::from_raw(u16::from_le_bytes([payload[0], payload[1]]));
        match self.nodes.get_data(uid, parent_addr) {
            Ok(chunks) => {
                let mut buf = Vec::new();
                buf.push(chunks.len() as u8);
                for (chunk, len) in chunks {
                    buf.push(len);
                    buf.extend_from_slice(&chunk[..len as usize]);
                }
                vec![Message::new(t, buf)]
            }
            Err(_) => self.nack(t),
        }
    }

    fn handle_delete_data(&mut self, t: u16, payload: &[u8]) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        if payload.len() < 2 {
            return self.nack(t);
        }
        let parent_addr = NodeAddr::from_raw(u16::from_le_bytes([payload[0], payload[1]]));
        match self.nodes.delete_data(uid, parent_addr) {
            Ok(()) => self.ack(t),
            Err(_) => self.nack(t),
        }
    }

    fn handle_scan_data(&self, t: u16, payload: &[u8], category: DataCategory) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        if payload.len() < 2 {
            return self.nack(t);
        }
        let cursor = NodeAddr::from_raw(u16::from_le_bytes([payload[0], payload[1]]));
        let profile = match self.nodes.profile(uid) {
            Ok(p) => p,
            Err(_) => return self.nack(t),
        };
        let kind = mp_store::node::ParentKind::Data(category);
        match mp_nodemgmt::search::scan_for_next_parent_after(self.nodes.store(), profile, cursor, kind) {
            Ok(Some((addr, name))) => {
                let mut buf = addr.raw().to_le_bytes().to_vec();
                buf.extend_from_slice(&encode_string_list(&[Some(name.as_units())]));
                vec![Message::new(t, buf)]
            }
            _ => self.nack(t),
        }
    }

    // ---- management mode --------------------------------------------------

    fn handle_read_node(&self, t: u16, payload: &[u8]) -> Vec<Message> {
        if payload.len() < 2 {
            return self.nack(t);
        }
        let raw = u16::from_le_bytes([payload[0], payload[1]]);
        match self.nodes.store().read_raw_slot(raw) {
            Ok(slot) => vec![Message::new(t, slot.to_vec())],
            Err(_) => self.nack(t),
        }
    }

    fn handle_write_node(&mut self, t: u16, payload: &[u8]) -> Vec<Message> {
        if payload.len() < 2 + SLOT_LEN {
            return self.nack(t);
        }
        let raw = u16::from_le_bytes([payload[0], payload[1]]);
        let mut slot = [0u8; SLOT_LEN];
        slot.copy_from_slice(&payload[2..2 + SLOT_LEN]);
        match self.nodes.store_mut().write_raw_slot(raw, &slot) {
            Ok(()) => self.ack(t),
            Err(_) => self.nack(t),
        }
    }

    fn handle_get_start_parents(&self, t: u16) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        let profile = match self.nodes.profile(uid) {
            Ok(p) => p,
            Err(_) => return self.nack(t),
        };
        let mut buf = Vec::with_capacity(16);
        for addr in profile.credential_start_parent.iter().chain(profile.data_start_parent.iter()) {
            buf.extend_from_slice(&addr.raw().to_le_bytes());
        }
        vec![Message::new(t, buf)]
    }

    fn handle_set_start_parent(&mut self, t: u16, payload: &[u8], credential: bool) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        if payload.len() < 3 {
            return self.nack(t);
        }
        let cat = payload[0] as usize;
        let addr = NodeAddr::from_raw(u16::from_le_bytes([payload[1], payload[2]]));
        let profile = match self.nodes.profile_mut(uid) {
            Ok(p) => p,
            Err(_) => return self.nack(t),
        };
        let slot = if credential { profile.credential_start_parent.get_mut(cat) } else { profile.data_start_parent.get_mut(cat) };
        match slot {
            Some(s) => {
                *s = addr;
                self.ack(t)
            }
            None => self.nack(t),
        }
    }

    fn handle_set_start_parents(&mut self, t: u16, payload: &[u8]) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        if payload.len() < 16 {
            return self.nack(t);
        }
        let profile = match self.nodes.profile_mut(uid) {
            Ok(p) => p,
            Err(_) => return self.nack(t),
        };
        for (i, slot) in profile.credential_start_parent.iter_mut().enumerate() {
            *slot = NodeAddr::from_raw(u16::from_le_bytes([payload[i * 2], payload[i * 2 + 1]]));
        }
        for (i, slot) in profile.data_start_parent.iter_mut().enumerate() {
            let o = 8 + i * 2;
            *slot = NodeAddr::from_raw(u16::from_le_bytes([payload[o], payload[o + 1]]));
        }
        self.ack(t)
    }

    fn handle_get_change_number(&self, t: u16, get: impl FnOnce(&NodeManager<M>, UserId) -> mp_nodemgmt::Result<u32>) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        match get(&self.nodes, uid) {
            Ok(v) => vec![Message::new(t, v.to_le_bytes().to_vec())],
            Err(_) => self.nack(t),
        }
    }

    fn handle_set_change_number(&mut self, t: u16, payload: &[u8], set: impl FnOnce(&mut NodeManager<M>, UserId, u32) -> mp_nodemgmt::Result<()>) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        if payload.len() < 4 {
            return self.nack(t);
        }
        let value = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        match set(&mut self.nodes, uid, value) {
            Ok(()) => self.ack(t),
            Err(_) => self.nack(t),
        }
    }

    fn handle_get_ctr_value(&self, t: u16) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        match self.nodes.profile(uid) {
            Ok(p) => vec![Message::new(t, p.ctr_bound.to_vec())],
            Err(_) => self.nack(t),
        }
    }

    fn handle_set_ctr_value(&mut self, t: u16, payload: &[u8]) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        if payload.len() < 3 {
            return self.nack(t);
        }
        match self.nodes.profile_mut(uid) {
            Ok(p) => {
                p.ctr_bound.copy_from_slice(&payload[..3]);
                self.ack(t)
            }
            Err(_) => self.nack(t),
        }
    }

    fn handle_get_favorite(&self, t: u16, payload: &[u8]) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        if payload.len() < 2 {
            return self.nack(t);
        }
        match self.nodes.get_favorite(uid, payload[0], payload[1] as usize) {
            Ok(fav) => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&fav.service.raw().to_le_bytes());
                buf.extend_from_slice(&fav.login.raw().to_le_bytes());
                vec![Message::new(t, buf)]
            }
            Err(_) => self.nack(t),
        }
    }

    fn handle_set_favorite(&mut self, t: u16, payload: &[u8]) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        if payload.len() < 6 {
            return self.nack(t);
        }
        let category = payload[0];
        let slot = payload[1] as usize;
        let service = NodeAddr::from_raw(u16::from_le_bytes([payload[2], payload[3]]));
        let login = NodeAddr::from_raw(u16::from_le_bytes([payload[4], payload[5]]));
        match self.nodes.set_favorite(uid, category, slot, mp_nodemgmt::Favorite { service, login }) {
            Ok(()) => self.ack(t),
            Err(_) => self.nack(t),
        }
    }

    fn handle_get_favorites(&self, t: u16) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        match self.nodes.get_favorites(uid) {
            Ok(favs) => {
                let mut buf = Vec::new();
                buf.push(favs.len() as u8);
                for (cat, slot, fav) in favs {
                    buf.push(cat);
                    buf.push(slot as u8);
                    buf.extend_from_slice(&fav.service.raw().to_le_bytes());
                    buf.extend_from_slice(&fav.login.raw().to_le_bytes());
                }
                vec![Message::new(t, buf)]
            }
            Err(_) => self.nack(t),
        }
    }

    fn handle_get_cpz_lut_entry(&self, t: u16) -> Vec<Message> {
        let uid = match self.current_user {
            Some(uid) => uid,
            None => return self.nack(t),
        };
        match self.settings.find_by_user_id(uid) {
            Some(e) => {
                let mut buf = Vec::new();
                buf.extend_from_slice(&e.cpz);
                buf.extend_from_slice(&e.user_id.to_le_bytes());
                buf.extend_from_slice(&e.nonce);
                buf.extend_from_slice(&e.flags.to_le_bytes());
                buf.push(e.provisioned_key.is_some() as u8);
                buf.extend_from_slice(&e.provisioned_key.unwrap_or([0u8; 32]));
                buf.push(e.language_id);
                buf.push(e.usb_keyboard_layout_id);
                buf.push(e.ble_keyboard_layout_id);
                vec![Message::new(t, buf)]
            }
            None => self.nack(t),
        }
    }

    // ---- security -----------------------------------------------------------

    fn handle_dev_auth_challenge(&mut self, t: u16, payload: &[u8]) -> Vec<Message> {
        if payload.len() < 20 {
            return self.nack(t);
        }

        // Mandatory bruteforce delay (spec §4.3/§7): 2 seconds plus random
        // jitter, applied unconditionally before the counter is even read,
        // mirroring the original firmware's `timer_delay_ms(2000 +
        // rng_get_random_uint8_t())`.
        let jitter_ms = (self.rng.next_u32() & 0xFF) as u32;
        self.aux.delay_ms(2000 + jitter_ms);

        let suggested_counter = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let mut ciphertext = [0u8; device_auth::CIPHERTEXT_LEN];
        ciphertext.copy_from_slice(&payload[4..20]);

        match device_auth::respond(&self.device_ops_key, self.platform_serial, self.device.auth_counter, suggested_counter, &ciphertext) {
            Ok((response, new_counter)) => {
                self.device.auth_counter = new_counter;
                vec![Message::new(t, response.to_vec())]
            }
            Err(_) => self.nack(t),
        }
    }

    /// `SET_DATE`: six little-endian `u16` fields, year/month/day/hour/
    /// minute/second (spec.md:198), grounded on the original firmware's
    /// `HID_CMD_ID_SET_DATE` case (`comms_hid_msgs.c`), which NACKs on a
    /// payload length other than `6 * sizeof(uint16_t)`. There is no RTC
    /// (spec §6), so a valid payload becomes the device's wall-clock
    /// calibration basis rather than being handed to a clock driver.
    fn handle_set_date(&mut self, t: u16, payload: &[u8], now_ms: u64) -> Vec<Message> {
        if payload.len() != 12 {
            return self.nack(t);
        }
        let field = |i: usize| u16::from_le_bytes([payload[i * 2], payload[i * 2 + 1]]);
        let (year, month, day, hour, minute, second) = (field(0), field(1), field(2), field(3), field(4), field(5));

        match unix_time_from_fields(year, month, day, hour, minute, second) {
            Some(unix_time) => {
                self.settings.set_time_calibration(unix_time, now_ms);
                self.ack(t)
            }
            None => self.nack(t),
        }
    }
}

/// Setting id reserved for the device-wide UI language (spec §4.7
/// `GET_DEVICE_LANG_ID`/`SET_DEVICE_LANG_ID`); only the low byte of the
/// fixed 4-byte setting slot is meaningful.
const DEVICE_LANG_SETTING_ID: u8 = 31;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::FixedCollaborators;
    use mp_crypto::aes_ctr::AesCtrEngine;
    use mp_store::InMemoryMedium;
    use rand_core::OsRng;

    fn dispatcher() -> Dispatcher<InMemoryMedium, FixedCollaborators, FixedCollaborators, OsRng> {
        Dispatcher::new(InMemoryMedium::new(256), FixedCollaborators::default(), FixedCollaborators::default(), OsRng, [0x5au8; 32], 0xdead_beef)
    }

    fn login_user(d: &mut Dispatcher<InMemoryMedium, FixedCollaborators, FixedCollaborators, OsRng>) -> UserId {
        let uid = d.nodes.new_user([0x11u8; 16]).unwrap();
        d.current_user = Some(uid);
        d.engine = Some(AesCtrEngine::from_card_key(&[0x42u8; 32], [0x11u8; 16], Ctr::from_u32(0)));
        d.device.unlock();
        uid
    }

    fn svc_login_strings(service: &str, login: &str) -> Vec<u8> {
        let s: Vec<u16> = service.encode_utf16().collect();
        let l: Vec<u16> = login.encode_utf16().collect();
        encode_string_list(&[Some(&s), Some(&l)])
    }

    #[test]
    fn unlock_required_ops_are_nacked_before_login() {
        let mut d = dispatcher();
        let req = Message::new(Opcode::GetCred.wire_value(), vec![0u8; 4]);
        let resp = d.parse(&req, 4, Restriction::None, 0).unwrap();
        assert_eq!(resp[0].payload, vec![crate::message::NACK_BYTE]);
    }

    #[test]
    fn ping_always_acks() {
        let mut d = dispatcher();
        let req = Message::empty(Opcode::Ping.wire_value());
        let resp = d.parse(&req, 0, Restriction::None, 0).unwrap();
        assert_eq!(resp[0].payload, vec![crate::message::ACK_BYTE]);
    }

    #[test]
    fn store_then_get_credential_round_trips_through_the_dispatcher() {
        let mut d = dispatcher();
        login_user(&mut d);

        let mut store_payload = vec![1u8]; // password present
        store_payload.extend_from_slice(&encode_string_list(&[
            Some(&"example.com".encode_utf16().collect::<Vec<u16>>()),
            Some(&"alice".encode_utf16().collect::<Vec<u16>>()),
            None,
            None,
        ]));
        store_payload.push(4);
        store_payload.extend_from_slice(b"pass");
        let req = Message::new(Opcode::StoreCred.wire_value(), store_payload.clone());
        let resp = d.parse(&req, store_payload.len() as u16, Restriction::None, 0).unwrap();
        assert_eq!(resp[0].payload, vec![crate::message::ACK_BYTE]);

        let mut get_payload = vec![0u8]; // want_totp = false
        get_payload.extend_from_slice(&svc_login_strings("example.com", "alice"));
        let req = Message::new(Opcode::GetCred.wire_value(), get_payload.clone());
        let resp = d.parse(&req, get_payload.len() as u16, Restriction::None, 0).unwrap();
        assert_eq!(resp[0].payload[0], 0); // password kind
    }

    #[test]
    fn check_password_rate_limits_then_na_then_acks() {
        let mut d = dispatcher();
        login_user(&mut d);

        let mut store_payload = vec![1u8];
        store_payload.extend_from_slice(&encode_string_list(&[
            Some(&"svc.com".encode_utf16().collect::<Vec<u16>>()),
            Some(&"u".encode_utf16().collect::<Vec<u16>>()),
            None,
            None,
        ]));
        store_payload.push(6);
        store_payload.extend_from_slice(b"secret");
        let req = Message::new(Opcode::StoreCred.wire_value(), store_payload.clone());
        d.parse(&req, store_payload.len() as u16, Restriction::None, 0).unwrap();

        let mut check_payload = svc_login_strings("svc.com", "u");
        check_payload.push(5);
        check_payload.extend_from_slice(b"wrong");
        let req = Message::new(Opcode::CheckPassword.wire_value(), check_payload.clone());
        let resp = d.parse(&req, check_payload.len() as u16, Restriction::None, 0).unwrap();
        assert_eq!(resp[0].payload, vec![crate::message::NACK_BYTE]);

        let mut check_payload2 = svc_login_strings("svc.com", "u");
        check_payload2.push(6);
        check_payload2.extend_from_slice(b"secret");
        let req = Message::new(Opcode::CheckPassword.wire_value(), check_payload2.clone());
        let resp = d.parse(&req, check_payload2.len() as u16, Restriction::None, 500).unwrap();
        assert_eq!(resp[0].payload, vec![crate::message::NA_BYTE], "expected NA byte while rate limited");

        let req = Message::new(Opcode::CheckPassword.wire_value(), check_payload2.clone());
        let resp = d.parse(&req, check_payload2.len() as u16, Restriction::None, 2000).unwrap();
        assert_eq!(resp[0].payload, vec![crate::message::ACK_BYTE]);
    }

    #[test]
    fn management_mode_gate_blocks_then_allows_after_start_mmm() {
        let mut d = dispatcher();
        login_user(&mut d);

        let req = Message::new(Opcode::GetFreeNodes.wire_value(), Vec::new());
        let resp = d.parse(&req, 0, Restriction::None, 0).unwrap();
        assert_eq!(resp[0].payload, vec![crate::message::NACK_BYTE]);

        let req = Message::new(Opcode::StartMmm.wire_value(), Vec::new());
        d.parse(&req, 0, Restriction::None, 0).unwrap();

        let req = Message::new(Opcode::GetFreeNodes.wire_value(), Vec::new());
        let resp = d.parse(&req, 0, Restriction::None, 0).unwrap();
        assert_eq!(resp[0].payload.len(), 6);
    }

    #[test]
    fn restriction_filter_retries_disallowed_opcodes() {
        let mut d = dispatcher();
        let req = Message::empty(Opcode::StoreCred.wire_value());
        let resp = d.parse(&req, 0, Restriction::AllbutSn, 0).unwrap();
        assert_eq!(resp[0].payload, Vec::<u8>::new());
        assert_eq!(resp[0].message_type, Opcode::StoreCred.wire_value());
    }

    #[test]
    fn malformed_frame_length_is_silently_dropped() {
        let mut d = dispatcher();
        let req = Message::new(Opcode::Ping.wire_value(), vec![1, 2, 3]);
        assert_eq!(d.parse(&req, 0, Restriction::None, 0), None);
    }

    #[test]
    fn unknown_opcode_is_silently_dropped() {
        let mut d = dispatcher();
        let req = Message::empty(0xFFFE);
        assert_eq!(d.parse(&req, 0, Restriction::None, 0), None);
    }

    #[test]
    fn gcm_flagged_request_unmasks_and_dispatches_normally() {
        let mut d = dispatcher();
        let req = Message::empty(Opcode::Ping.wire_value() | crate::opcode::GCM_FLAG);
        let resp = d.parse(&req, 0, Restriction::None, 0).unwrap();
        assert_eq!(resp[0].payload, vec![crate::message::ACK_BYTE]);
    }

    #[test]
    fn gcm_flagged_request_over_the_shrunk_budget_is_dropped() {
        let mut d = dispatcher();
        let payload = vec![0u8; crate::message::MAX_PAYLOAD_LEN - crate::message::GCM_TAG_LEN + 1];
        let req = Message::new(Opcode::Ping.wire_value() | crate::opcode::GCM_FLAG, payload.clone());
        assert_eq!(d.parse(&req, payload.len() as u16, Restriction::None, 0), None);
    }

    #[test]
    fn non_gcm_request_allows_the_full_payload_budget() {
        let mut d = dispatcher();
        let payload = vec![0u8; crate::message::MAX_PAYLOAD_LEN];
        let req = Message::new(Opcode::GetDiagData.wire_value(), payload.clone());
        assert!(d.parse(&req, payload.len() as u16, Restriction::None, 0).is_some());
    }

    #[test]
    fn set_date_decodes_fields_and_calibrates_the_clock() {
        let mut d = dispatcher();
        let mut payload = Vec::new();
        for field in [2024u16, 1, 1, 0, 0, 0] {
            payload.extend_from_slice(&field.to_le_bytes());
        }
        let req = Message::new(Opcode::SetDate.wire_value(), payload.clone());
        let resp = d.parse(&req, payload.len() as u16, Restriction::None, 5_000).unwrap();
        assert_eq!(resp[0].payload, vec![crate::message::ACK_BYTE]);
        assert_eq!(d.settings.current_unix_time(5_000), Some(1_704_067_200));
    }

    #[test]
    fn set_date_rejects_a_malformed_payload() {
        let mut d = dispatcher();
        let req = Message::new(Opcode::SetDate.wire_value(), vec![0u8; 11]);
        let resp = d.parse(&req, 11, Restriction::None, 0).unwrap();
        assert_eq!(resp[0].payload, vec![crate::message::NACK_BYTE]);
        assert_eq!(d.settings.current_unix_time(0), None);
    }

    #[test]
    fn set_date_rejects_an_out_of_range_month() {
        let mut d = dispatcher();
        let mut payload = Vec::new();
        for field in [2024u16, 13, 1, 0, 0, 0] {
            payload.extend_from_slice(&field.to_le_bytes());
        }
        let req = Message::new(Opcode::SetDate.wire_value(), payload.clone());
        let resp = d.parse(&req, payload.len() as u16, Restriction::None, 0).unwrap();
        assert_eq!(resp[0].payload, vec![crate::message::NACK_BYTE]);
    }

    #[test]
    fn get_totp_code_uses_the_calibrated_clock() {
        let mut d = dispatcher();
        login_user(&mut d);

        let mut store_payload = vec![1u8];
        store_payload.extend_from_slice(&encode_string_list(&[
            Some(&"example.com".encode_utf16().collect::<Vec<u16>>()),
            Some(&"alice".encode_utf16().collect::<Vec<u16>>()),
            None,
            None,
        ]));
        store_payload.push(4);
        store_payload.extend_from_slice(b"pass");
        let req = Message::new(Opcode::StoreCred.wire_value(), store_payload.clone());
        d.parse(&req, store_payload.len() as u16, Restriction::None, 0).unwrap();

        let get_payload = svc_login_strings("example.com", "alice");
        let req = Message::new(Opcode::GetCred.wire_value(), vec![0u8].into_iter().chain(get_payload.clone()).collect::<Vec<u8>>());
        let resp = d
            .parse(&req, (get_payload.len() + 1) as u16, Restriction::None, 0)
            .unwrap();
        let child_addr = u16::from_le_bytes([resp[0].payload[2], resp[0].payload[3]]);

        let secret = b"12345678901234567890";
        let mut totp_payload = child_addr.to_le_bytes().to_vec();
        totp_payload.extend_from_slice(&[8, 30, 0, secret.len() as u8]);
        totp_payload.extend_from_slice(secret);
        let req = Message::new(Opcode::StoreTotpCred.wire_value(), totp_payload.clone());
        let resp = d.parse(&req, totp_payload.len() as u16, Restriction::None, 0).unwrap();
        assert_eq!(resp[0].payload, vec![crate::message::ACK_BYTE]);

        // GET_TOTP_CODE before any SET_DATE: no clock, nacked.
        let req = Message::new(Opcode::GetTotpCode.wire_value(), get_payload.clone());
        let resp = d.parse(&req, get_payload.len() as u16, Restriction::None, 59_000).unwrap();
        assert_eq!(resp[0].payload, vec![crate::message::NACK_BYTE]);

        // RFC 6238 Appendix B's t=59 vector: 1970-01-01T00:00:59Z.
        let mut date_payload = Vec::new();
        for field in [1970u16, 1, 1, 0, 0, 59] {
            date_payload.extend_from_slice(&field.to_le_bytes());
        }
        let req = Message::new(Opcode::SetDate.wire_value(), date_payload.clone());
        d.parse(&req, date_payload.len() as u16, Restriction::None, 10_000).unwrap();

        let req = Message::new(Opcode::GetTotpCode.wire_value(), get_payload.clone());
        let resp = d.parse(&req, get_payload.len() as u16, Restriction::None, 10_000).unwrap();
        assert_eq!(resp[0].payload[0], 1, "totp kind byte");
        let (strings, _) = decode_string_list(&resp[0].payload[4..], 2).unwrap();
        let code = String::from_utf16(strings[1].as_ref().unwrap()).unwrap();
        assert_eq!(code, "94287082");
    }

    #[test]
    fn device_status_reports_unlock_bit_and_clears_settings_changed_on_read() {
        let mut d = dispatcher();
        login_user(&mut d);
        d.settings.settings_changed = true;

        let req = Message::empty(Opcode::GetDeviceStatus.wire_value());
        let resp = d.parse(&req, 0, Restriction::None, 0).unwrap();
        let payload = &resp[0].payload;
        assert_eq!(payload.len(), 5);
        assert_ne!(payload[0] & 0x04, 0, "smartcard_unlocked bit should be set");
        assert_eq!(payload[4], 1, "settings_changed should read as 1 the first time");
        assert!(!d.settings.settings_changed, "reading status clears the latch");

        let req = Message::empty(Opcode::GetDeviceStatus.wire_value());
        let resp = d.parse(&req, 0, Restriction::None, 0).unwrap();
        assert_eq!(resp[0].payload[4], 0, "latch stays clear until the next settings write");
    }

    #[test]
    fn dev_auth_challenge_applies_bruteforce_delay_even_on_a_rejected_attempt() {
        let mut d = dispatcher();
        let mut payload = 5u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0u8; 16]);
        let req = Message::new(Opcode::DevAuthChallenge.wire_value(), payload.clone());
        let resp = d.parse(&req, payload.len() as u16, Restriction::None, 0).unwrap();
        assert_eq!(resp[0].payload, vec![crate::message::NACK_BYTE]);
        assert!(d.aux.delayed_ms >= 2000, "bruteforce delay must run unconditionally, got {}", d.aux.delayed_ms);
    }

    #[test]
    fn im_locked_sets_computer_locked_state_without_ending_the_smartcard_session() {
        let mut d = dispatcher();
        login_user(&mut d);

        let req = Message::empty(Opcode::ImLocked.wire_value());
        d.parse(&req, 0, Restriction::None, 0).unwrap();
        assert!(d.device.computer_locked_state);
        assert!(d.device.smartcard_unlocked, "IM_LOCKED must not clear the device's own unlock state");

        let req = Message::empty(Opcode::ImUnlocked.wire_value());
        d.parse(&req, 0, Restriction::None, 0).unwrap();
        assert!(!d.device.computer_locked_state);
    }
}
