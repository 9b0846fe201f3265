//! Stub traits standing in for the hardware/GUI collaborators named out of
//! scope in §1: OLED/GUI, accelerometer RNG-feeding, battery/ADC, BLE link
//! management, ISO7816 smartcard signalling, bootloader/flash-transport, and
//! debug surfaces. No real hardware logic lives here; they exist so the
//! dispatcher's opcode table is total and testable against a fake.

use rand_core::RngCore;

/// GUI/user-approval collaborator for credential prompting and management-mode
/// approval. The real device re-enters the communications pump while a prompt
/// is outstanding (spec §9 "coroutines for user prompts"); `poll()` models
/// that as an explicit state machine instead of a blocking call.
pub trait HostPrompt {
    fn poll(&mut self) -> PromptPoll;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptPoll {
    Pending,
    Approved,
    Denied,
    Cancelled,
    TimedOut,
}

/// Accelerometer/TRNG collaborator. The teacher's own `rand_core::RngCore`
/// bound is reused directly rather than inventing a parallel trait, since
/// it's already what the crypto/password-generation crates in this workspace
/// expect.
pub trait RandomSource: RngCore {}
impl<T: RngCore> RandomSource for T {}

/// Auxiliary-MCU / BLE / battery collaborator backing `PLAT_INFO`,
/// `GET_CUST_BLE_NAME`/`SET_CUST_BLE_NAME`, and the battery byte of
/// `GET_DEVICE_STATUS`.
pub trait AuxMcu {
    fn plat_info(&mut self) -> PlatformInfo;
    fn ble_name(&self) -> &str;
    fn set_ble_name(&mut self, name: &str);
    fn battery_status(&self) -> BatteryStatus;

    /// Busy-waits (re-entering the communications pump per spec §5) for
    /// `ms` milliseconds. Used by `DEV_AUTH_CHALLENGE`'s mandatory
    /// bruteforce delay, mirroring the original firmware's `timer_delay_ms`.
    fn delay_ms(&mut self, ms: u32);
}

#[derive(Debug, Clone, Copy)]
pub struct PlatformInfo {
    pub main_fw_major: u16,
    pub main_fw_minor: u16,
    pub aux_fw_major: u16,
    pub aux_fw_minor: u16,
    pub platform_serial: u32,
    pub memory_size_code: u8,
    pub bundle_version: u16,
    pub internal_serial: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct BatteryStatus {
    pub percent: u8,
    pub charging: bool,
}

/// A fixed-answer `HostPrompt`/`AuxMcu` pair for tests: never pends, always
/// approves, and reports canned platform/battery data.
pub struct FixedCollaborators {
    pub prompt_answer: PromptPoll,
    pub ble_name: String,
    pub plat_info: PlatformInfo,
    pub battery: BatteryStatus,
    /// Total milliseconds handed to `delay_ms` so far; tests assert against
    /// this instead of actually sleeping.
    pub delayed_ms: u32,
}

impl Default for FixedCollaborators {
    fn default() -> Self {
        FixedCollaborators {
            prompt_answer: PromptPoll::Approved,
            ble_name: String::new(),
            plat_info: PlatformInfo {
                main_fw_major: 1,
                main_fw_minor: 0,
                aux_fw_major: 1,
                aux_fw_minor: 0,
                platform_serial: 0,
                memory_size_code: 0,
                bundle_version: 0,
                internal_serial: 0,
            },
            battery: BatteryStatus { percent: 100, charging: false },
            delayed_ms: 0,
        }
    }
}

impl HostPrompt for FixedCollaborators {
    fn poll(&mut self) -> PromptPoll {
        self.prompt_answer
    }
}

impl AuxMcu for FixedCollaborators {
    fn plat_info(&mut self) -> PlatformInfo {
        self.plat_info
    }

    fn ble_name(&self) -> &str {
        &self.ble_name
    }

    fn set_ble_name(&mut self, name: &str) {
        self.ble_name = name.to_string();
    }

    fn battery_status(&self) -> BatteryStatus {
        self.battery
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delayed_ms += ms;
    }
}
