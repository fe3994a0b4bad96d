//! MASH device-side session lifecycle: commissioning, certificate exchange,
//! zone management, and the operational Read/Write/Subscribe/Invoke protocol
//! for peer-to-peer energy devices and controllers.
//!
//! The [`service`] module ties every other component together: frame
//! transport ([`transport`]), PASE ([`pase`]), certificate helpers
//! ([`cert`]), the connection tracker/reaper ([`tracker`]), PASE backoff
//! ([`backoff`]), the commissioning gate ([`gate`]), certificate renewal
//! ([`renewal`]), the operational protocol handler ([`protocol`]), the
//! per-zone session loop ([`session`]), and the real TLS accept loop
//! ([`tls`]) behind the transport-agnostic core the rest of this crate is
//! tested against.

pub mod backoff;
pub mod cert;
pub mod collaborators;
pub mod config;
pub mod device_model;
pub mod error;
pub mod gate;
pub mod model;
pub mod pase;
pub mod protocol;
pub mod renewal;
pub mod service;
pub mod session;
pub mod tls;
pub mod tracker;
pub mod transport;

pub use config::DeviceConfig;
pub use error::{MashError, MashResult};
pub use model::{OperationalCertificate, Zone, ZoneType};
pub use service::{DeviceService, ServiceState};
