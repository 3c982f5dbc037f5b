//! Control-plane core of a virtio-net front-end driver: feature
//! negotiation, the device-status state machine, and virtqueue lifecycle,
//! written once against the [`VirtioOps`] transport boundary so the same
//! logic drives legacy PCI, modern PCI and MMIO backends.
//!
//! Bring-up order: [`VirtioHw::attach`] binds the transport,
//! [`VirtioHw::init`] resets, handshakes and negotiates, then the caller
//! sets up queues and calls [`VirtioHw::start`].

pub mod hw;
pub mod negotiate;
pub mod queue;
pub mod registry;
pub mod spec;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use hw::{DeviceState, RingLayout, VirtioHw};
pub use queue::Virtqueue;
pub use spec::{DeviceStatusFlags, Features, IsrStatus};
pub use transport::{Error, MsixStatus, VirtioOps};
