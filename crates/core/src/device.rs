//! Device/user state (C6): the tracked booleans gating every other
//! operation, plus per-user security flags and the `CHECK_PASSWORD`
//! rate-limit timer. Grounded on spec §4.6's state table and §9's resolved
//! open question on timer rearm semantics; no teacher file tracks this shape
//! of state directly (the teacher's `VaultMode`/PDDB-basis-unlock state is
//! the nearest analogue in spirit, not in field layout).

/// Milliseconds between `CHECK_PASSWORD` attempts before the next one is
/// throttled (spec §8 I8, concrete scenario 2: "within 2 seconds").
pub const CHECK_PASSWORD_TIMER_VAL_MS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A gated operation was attempted while its required flag was unset.
    ModeViolation,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::ModeViolation => write!(f, "operation not permitted in the current device mode"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// Per-user security flags (spec §4.6), surfaced via `GET_USER_SETTINGS` and
/// mutated only in management mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserSecurityFlags {
    pub advanced_menu: bool,
    pub login_conf: bool,
    pub pin_for_mmm: bool,
    pub ble_enabled: bool,
    pub cred_save_prompt_mmm: bool,
    pub knock_det_disabled: bool,
}

impl UserSecurityFlags {
    /// Pack into the 16-bit field the status response carries (spec §6).
    pub fn to_bits(self) -> u16 {
        (self.advanced_menu as u16)
            | (self.login_conf as u16) << 1
            | (self.pin_for_mmm as u16) << 2
            | (self.ble_enabled as u16) << 3
            | (self.cred_save_prompt_mmm as u16) << 4
            | (self.knock_det_disabled as u16) << 5
    }

    pub fn from_bits(bits: u16) -> UserSecurityFlags {
        UserSecurityFlags {
            advanced_menu: bits & 0x01 != 0,
            login_conf: bits & 0x02 != 0,
            pin_for_mmm: bits & 0x04 != 0,
            ble_enabled: bits & 0x08 != 0,
            cred_save_prompt_mmm: bits & 0x10 != 0,
            knock_det_disabled: bits & 0x20 != 0,
        }
    }
}

/// Rearms on every call that reaches the comparison, match or mismatch alike
/// (spec §9 resolved open question) — a correct guess does not get a free
/// immediate re-check.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckPasswordThrottle {
    last_attempt_ms: Option<u64>,
}

impl CheckPasswordThrottle {
    /// `now_ms` is a monotonic millisecond tick supplied by the caller's main
    /// loop; this module has no clock of its own (spec §6: "none at the core
    /// layer, embedded device").
    pub fn is_allowed(&self, now_ms: u64) -> bool {
        match self.last_attempt_ms {
            Some(last) => now_ms.saturating_sub(last) >= CHECK_PASSWORD_TIMER_VAL_MS,
            None => true,
        }
    }

    pub fn rearm(&mut self, now_ms: u64) {
        self.last_attempt_ms = Some(now_ms);
    }
}

/// The device-wide tracked state (spec §4.6 table). Owned by the main loop
/// and passed by mutable handle into dispatch functions (spec §9 "Global
/// mutable state").
#[derive(Debug, Clone, Copy)]
pub struct DeviceState {
    /// No card physically present; set on boot and on card removal, cleared
    /// once the (out-of-scope) smartcard driver reports an insertion (spec
    /// §4.9 `NO_CARD` state, §6 status response bit 0).
    pub card_absent: bool,
    /// The inserted card's CPZ has no CPZ-LUT entry (spec §4.9 `CARD_UNKNOWN`,
    /// §6 status response bit 3).
    pub unknown_card: bool,
    pub smartcard_unlocked: bool,
    pub management_mode: bool,
    pub bundle_upload_allowed: bool,
    pub user_to_be_logged_off: bool,
    pub computer_locked_state: bool,
    pub check_password_throttle: CheckPasswordThrottle,
    /// Strictly monotonic device-authentication counter; `u32::MAX` is the
    /// lockout sentinel that always accepts the next challenge (spec §4.3).
    pub auth_counter: u32,
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState {
            card_absent: true,
            unknown_card: false,
            smartcard_unlocked: false,
            management_mode: false,
            bundle_upload_allowed: false,
            user_to_be_logged_off: false,
            computer_locked_state: false,
            check_password_throttle: CheckPasswordThrottle::default(),
            auth_counter: 0,
        }
    }
}

impl DeviceState {
    pub fn new() -> DeviceState {
        DeviceState::default()
    }

    /// A known card (one with a CPZ-LUT entry) was inserted (spec §4.9
    /// `NO_CARD --insert--> CARD_KNOWN_LOCKED`).
    pub fn card_inserted_known(&mut self) {
        self.card_absent = false;
        self.unknown_card = false;
    }

    /// A card with no CPZ-LUT entry was inserted (spec §4.9 `CARD_UNKNOWN`).
    pub fn card_inserted_unknown(&mut self) {
        self.card_absent = false;
        self.unknown_card = true;
    }

    /// Card physically removed: back to `NO_CARD`, and every session flag
    /// this module tracks drops with it.
    pub fn card_removed(&mut self) {
        self.card_absent = true;
        self.unknown_card = false;
        self.lock();
    }

    pub fn require_unlocked(&self) -> Result<()> {
        if self.smartcard_unlocked {
            Ok(())
        } else {
            Err(Error::ModeViolation)
        }
    }

    pub fn require_management_mode(&self) -> Result<()> {
        if self.smartcard_unlocked && self.management_mode {
            Ok(())
        } else {
            Err(Error::ModeViolation)
        }
    }

    pub fn require_bundle_upload(&self) -> Result<()> {
        if self.bundle_upload_allowed {
            Ok(())
        } else {
            Err(Error::ModeViolation)
        }
    }

    /// `Card removed | timeout | explicit lock` (spec §4.6): clears every
    /// session-scoped flag. Settings and the auth counter persist.
    pub fn lock(&mut self) {
        self.smartcard_unlocked = false;
        self.management_mode = false;
        self.bundle_upload_allowed = false;
        self.user_to_be_logged_off = false;
    }

    pub fn unlock(&mut self) {
        self.smartcard_unlocked = true;
    }

    /// `START_MMM` + user approval (spec §4.6); only reachable once unlocked.
    pub fn enter_management_mode(&mut self) -> Result<()> {
        self.require_unlocked()?;
        self.management_mode = true;
        Ok(())
    }

    pub fn exit_management_mode(&mut self) {
        self.management_mode = false;
    }

    pub fn start_bundle_upload(&mut self) {
        self.bundle_upload_allowed = true;
    }

    pub fn finish_bundle_upload(&mut self) {
        self.bundle_upload_allowed = false;
    }
}
