//! The host-facing command processor (C6/C7/C8): device/user state, the
//! settings and CPZ-LUT table, credential access policy, and the opcode
//! dispatcher that ties them together with the flash-backed node manager
//! (`mp_nodemgmt`) and the crypto engine (`mp_crypto`). Grounded on spec
//! §4.6-§4.9, styled after the original firmware's `comms.c`/`logic_security.c`
//! split into one module per concern rather than one large translation unit.

pub mod collaborators;
pub mod device;
pub mod dispatch;
pub mod message;
pub mod opcode;
pub mod policy;
pub mod settings;

pub use collaborators::{AuxMcu, BatteryStatus, HostPrompt, PlatformInfo, PromptPoll, RandomSource};
pub use device::{CheckPasswordThrottle, DeviceState, UserSecurityFlags};
pub use dispatch::Dispatcher;
pub use message::Message;
pub use opcode::{Opcode, Restriction};
pub use policy::{CheckResult, CredentialPolicy, SecretReply};
pub use settings::{CpzLutEntry, SettingsStore};
