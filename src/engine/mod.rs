//! Sync Engine - mirrored device and authority roles
//!
//! ```text
//! ┌──────────────── device ────────────────┐      ┌────────── authority ──────────┐
//! │ UI → Outbox ─ drain loop ─┐            │      │                               │
//! │                           ├─ push ────────────► RecordStore.apply             │
//! │ Replica ◄─ fold ── pull ──┘            │      │      │                        │
//! │    ▲                                   │      │      └─ acceptance log        │
//! │    └────────── broadcast pushes ◄─────────────┴─ change hub (all devices)     │
//! └────────────────────────────────────────┘      └───────────────────────────────┘
//! ```
//!
//! The device side is push-heavy (draining its outbox), the authority side
//! broadcast-heavy (fanning accepted changes out to every subscribed
//! replica). Conflict resolution happens on the device, against the
//! authoritative entity returned with the conflict.

pub mod authority;
pub mod device;

pub use authority::{AuthorityConfig, AuthorityNode};
pub use device::DeviceEngine;
