//! Settings & CPZ table (C8): a small key/value store for per-device settings
//! and flags, plus the CPZ-LUT mapping a smartcard's code-protected zone to a
//! user id (spec §3 "CPZ-LUT entry", §4.8). Persisted in a custom storage
//! area distinct from the node flash (§6); this crate models that area as a
//! plain in-memory table behind the same narrow-trait-over-hardware pattern
//! `mp_store::FlashMedium` uses, since no teacher file implements a second,
//! differently-shaped flash region either.

use mp_nodemgmt::UserId;

pub const SETTING_VALUE_LEN: usize = 4;
pub const MAX_SETTINGS: usize = 32;
pub const MAX_FLAGS: usize = 16;
pub const CPZ_LEN: usize = 16;
pub const NONCE_LEN: usize = 16;
pub const PROVISIONED_KEY_LEN: usize = 32;
pub const MAX_CPZ_ENTRIES: usize = 112;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    UnknownSetting,
    UnknownFlag,
    /// `dump_all`/`restore_all` buffer did not match the expected fixed size.
    BufferSizeMismatch,
    CpzAlreadyBound,
    CpzNotFound,
    UserIdAlreadyBound,
    TableFull,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::UnknownSetting => write!(f, "unknown setting id"),
            Error::UnknownFlag => write!(f, "unknown flag id"),
            Error::BufferSizeMismatch => write!(f, "dump/restore buffer size mismatch"),
            Error::CpzAlreadyBound => write!(f, "cpz value already has a user bound"),
            Error::CpzNotFound => write!(f, "no cpz-lut entry for that card"),
            Error::UserIdAlreadyBound => write!(f, "user id already has a cpz-lut entry"),
            Error::TableFull => write!(f, "cpz-lut table is full"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// One CPZ-LUT row (spec §3 "CPZ-LUT entry").
#[derive(Clone, Copy)]
pub struct CpzLutEntry {
    pub cpz: [u8; CPZ_LEN],
    pub user_id: UserId,
    pub nonce: [u8; NONCE_LEN],
    pub flags: u16,
    pub provisioned_key: Option<[u8; PROVISIONED_KEY_LEN]>,
    pub language_id: u8,
    pub usb_keyboard_layout_id: u8,
    pub ble_keyboard_layout_id: u8,
}

/// Wall-clock calibration basis set by `SET_DATE` (spec.md:198/206): the
/// device has no RTC, so "now" is always derived from a unix time recorded
/// at some past monotonic tick plus the elapsed ticks since. Persisted in the
/// same custom-storage area the original firmware's `time_calibration_data_t`
/// occupies (`custom_fs.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeCalibration {
    pub unix_time_at_set: u64,
    pub monotonic_ms_at_set: u64,
}

/// Per-device settings table plus the CPZ-LUT (spec §4.8). Each setting id is
/// a fixed-width 4-byte value; flags are individually addressable bits.
pub struct SettingsStore {
    settings: [Option<[u8; SETTING_VALUE_LEN]>; MAX_SETTINGS],
    flags: [bool; MAX_FLAGS],
    cpz_lut: Vec<CpzLutEntry>,
    /// Set by any setting write; cleared by `GET_DEVICE_STATUS` (spec §4.6).
    pub settings_changed: bool,
    time_calibration: Option<TimeCalibration>,
}

impl SettingsStore {
    pub fn new() -> SettingsStore {
        SettingsStore {
            settings: [None; MAX_SETTINGS],
            flags: [false; MAX_FLAGS],
            cpz_lut: Vec::new(),
            settings_changed: false,
            time_calibration: None,
        }
    }

    /// Records a fresh calibration basis from a `SET_DATE` request (spec
    /// §4.7/§6): `unix_time_at_set` is the wall-clock time the host supplied,
    /// `monotonic_ms_at_set` the device's own tick at that same instant.
    pub fn set_time_calibration(&mut self, unix_time_at_set: u64, monotonic_ms_at_set: u64) {
        self.time_calibration = Some(TimeCalibration { unix_time_at_set, monotonic_ms_at_set });
        self.settings_changed = true;
    }

    /// Derives the current unix time from the calibration basis and the
    /// monotonic tick `now_ms`, or `None` if `SET_DATE` has never been
    /// received.
    pub fn current_unix_time(&self, now_ms: u64) -> Option<u64> {
        let cal = self.time_calibration?;
        let elapsed_ms = now_ms.saturating_sub(cal.monotonic_ms_at_set);
        Some(cal.unix_time_at_set + elapsed_ms / 1000)
    }

    pub fn get_setting(&self, id: u8) -> Result<[u8; SETTING_VALUE_LEN]> {
        self.settings
            .get(id as usize)
            .and_then(|slot| *slot)
            .ok_or(Error::UnknownSetting)
    }

    pub fn set_setting(&mut self, id: u8, value: [u8; SETTING_VALUE_LEN]) -> Result<()> {
        let slot = self.settings.get_mut(id as usize).ok_or(Error::UnknownSetting)?;
        *slot = Some(value);
        self.settings_changed = true;
        log::trace!("core: setting {} updated", id);
        Ok(())
    }

    pub fn get_flag(&self, id: u8) -> Result<bool> {
        self.flags.get(id as usize).copied().ok_or(Error::UnknownFlag)
    }

    pub fn set_flag(&mut self, id: u8, value: bool) -> Result<()> {
        let slot = self.flags.get_mut(id as usize).ok_or(Error::UnknownFlag)?;
        *slot = value;
        self.settings_changed = true;
        Ok(())
    }

    /// Serialize every settings slot and flag into one fixed-size buffer for
    /// a management-mode bulk read.
    pub fn dump_all(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_SETTINGS * (1 + SETTING_VALUE_LEN) + MAX_FLAGS);
        for slot in &self.settings {
            match slot {
                Some(v) => {
                    out.push(1);
                    out.extend_from_slice(v);
                }
                None => {
                    out.push(0);
                    out.extend_from_slice(&[0u8; SETTING_VALUE_LEN]);
                }
            }
        }
        for flag in &self.flags {
            out.push(*flag as u8);
        }
        out
    }

    pub fn restore_all(&mut self, buf: &[u8]) -> Result<()> {
        let expected_len = MAX_SETTINGS * (1 + SETTING_VALUE_LEN) + MAX_FLAGS;
        if buf.len() != expected_len {
            return Err(Error::BufferSizeMismatch);
        }
        let mut pos = 0;
        for slot in self.settings.iter_mut() {
            let present = buf[pos] != 0;
            pos += 1;
            let mut value = [0u8; SETTING_VALUE_LEN];
            value.copy_from_slice(&buf[pos..pos + SETTING_VALUE_LEN]);
            pos += SETTING_VALUE_LEN;
            *slot = if present { Some(value) } else { None };
        }
        for flag in self.flags.iter_mut() {
            *flag = buf[pos] != 0;
            pos += 1;
        }
        self.settings_changed = true;
        Ok(())
    }

    // ---- CPZ-LUT --------------------------------------------------------

    pub fn find_by_cpz(&self, cpz: &[u8; CPZ_LEN]) -> Option<&CpzLutEntry> {
        self.cpz_lut.iter().find(|e| &e.cpz == cpz)
    }

    pub fn find_by_user_id(&self, user_id: UserId) -> Option<&CpzLutEntry> {
        self.cpz_lut.iter().find(|e| e.user_id == user_id)
    }

    /// Insert a fresh CPZ-LUT row (spec invariant 6: at most one entry per
    /// user id, at most one per CPZ value).
    pub fn store(&mut self, entry: CpzLutEntry) -> Result<()> {
        if self.cpz_lut.len() >= MAX_CPZ_ENTRIES {
            return Err(Error::TableFull);
        }
        if self.find_by_cpz(&entry.cpz).is_some() {
            return Err(Error::CpzAlreadyBound);
        }
        if self.find_by_user_id(entry.user_id).is_some() {
            return Err(Error::UserIdAlreadyBound);
        }
        self.cpz_lut.push(entry);
        Ok(())
    }

    pub fn update(&mut self, entry: CpzLutEntry) -> Result<()> {
        let row = self.cpz_lut.iter_mut().find(|e| e.user_id == entry.user_id).ok_or(Error::CpzNotFound)?;
        *row = entry;
        Ok(())
    }

    /// Remove the CPZ-LUT row for `user_id` (spec §8 I6: absent after erase).
    pub fn erase_by_user_id(&mut self, user_id: UserId) -> Result<()> {
        let before = self.cpz_lut.len();
        self.cpz_lut.retain(|e| e.user_id != user_id);
        if self.cpz_lut.len() == before {
            return Err(Error::CpzNotFound);
        }
        Ok(())
    }

    pub fn count_free(&self) -> usize {
        MAX_CPZ_ENTRIES - self.cpz_lut.len()
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cpz: u8, uid: UserId) -> CpzLutEntry {
        CpzLutEntry {
            cpz: [cpz; CPZ_LEN],
            user_id: uid,
            nonce: [0u8; NONCE_LEN],
            flags: 0,
            provisioned_key: None,
            language_id: 0,
            usb_keyboard_layout_id: 0,
            ble_keyboard_layout_id: 0,
        }
    }

    #[test]
    fn setting_round_trips_and_flags_settings_changed() {
        let mut s = SettingsStore::new();
        assert!(!s.settings_changed);
        s.set_setting(3, [1, 2, 3, 4]).unwrap();
        assert_eq!(s.get_setting(3).unwrap(), [1, 2, 3, 4]);
        assert!(s.settings_changed);
    }

    #[test]
    fn dump_then_restore_round_trips() {
        let mut s = SettingsStore::new();
        s.set_setting(0, [9, 9, 9, 9]).unwrap();
        s.set_flag(2, true).unwrap();
        let dumped = s.dump_all();

        let mut restored = SettingsStore::new();
        restored.restore_all(&dumped).unwrap();
        assert_eq!(restored.get_setting(0).unwrap(), [9, 9, 9, 9]);
        assert!(restored.get_flag(2).unwrap());
    }

    #[test]
    fn cpz_lut_enforces_one_entry_per_cpz_and_per_user() {
        let mut s = SettingsStore::new();
        s.store(entry(1, 100)).unwrap();
        assert_eq!(s.store(entry(1, 200)), Err(Error::CpzAlreadyBound));
        assert_eq!(s.store(entry(2, 100)), Err(Error::UserIdAlreadyBound));
        assert!(s.find_by_cpz(&[1; CPZ_LEN]).is_some());
        assert!(s.find_by_user_id(100).is_some());
    }

    #[test]
    fn erase_by_user_id_removes_the_row() {
        let mut s = SettingsStore::new();
        s.store(entry(1, 100)).unwrap();
        s.erase_by_user_id(100).unwrap();
        assert!(s.find_by_user_id(100).is_none());
        assert_eq!(s.erase_by_user_id(100), Err(Error::CpzNotFound));
    }

    #[test]
    fn current_unix_time_is_none_until_calibrated() {
        let s = SettingsStore::new();
        assert_eq!(s.current_unix_time(1_000), None);
    }

    #[test]
    fn current_unix_time_advances_with_the_monotonic_clock() {
        let mut s = SettingsStore::new();
        s.set_time_calibration(1_700_000_000, 10_000);
        assert!(s.settings_changed);
        assert_eq!(s.current_unix_time(10_000), Some(1_700_000_000));
        assert_eq!(s.current_unix_time(15_500), Some(1_700_000_005));
    }

    #[test]
    fn count_free_tracks_occupancy() {
        let mut s = SettingsStore::new();
        assert_eq!(s.count_free(), MAX_CPZ_ENTRIES);
        s.store(entry(1, 1)).unwrap();
        assert_eq!(s.count_free(), MAX_CPZ_ENTRIES - 1);
    }
}
