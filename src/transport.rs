//! The operation set every virtio transport has to provide.
//!
//! Negotiation and lifecycle logic is written once against [`VirtioOps`];
//! legacy PCI, modern PCI, MMIO, and test doubles each implement it. An
//! implementation is bound to a port exactly once (see [`crate::registry`])
//! and dispatch is resolved at attach time, not per call.

use crate::hw::DeviceState;
use crate::queue::Virtqueue;
use crate::spec::{DeviceStatusFlags, Features, IsrStatus};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The requested config-space access falls outside the device config
    /// region. A caller bug, reported before the backend is touched.
    #[error("config space access out of range (offset={offset}, len={len})")]
    ConfigAccessOutOfRange { offset: usize, len: usize },

    /// The backend cleared FEATURES_OK after we set it. Fatal for this
    /// attach attempt; the handle must be reset before retrying.
    #[error("device rejected the negotiated feature set")]
    NegotiationRejected,

    /// The backend advertises zero depth for this queue despite the
    /// negotiated capability. The caller may proceed with fewer queues.
    #[error("queue {0} is not present on this device")]
    QueueNotPresent(u16),

    /// A queue id was set up twice without an intervening teardown.
    #[error("queue {0} is already set up")]
    QueueBusy(u16),

    /// The port identity already has a bound transport.
    #[error("port {0} is already bound to a transport")]
    AlreadyBound(u16),

    /// The port identity exceeds the registry capacity.
    #[error("port {0} is out of range")]
    PortOutOfRange(u16),

    /// The transport could not honor the interrupt-vector request; the
    /// caller falls back to polling.
    #[error("no interrupt vector available")]
    VectorUnavailable,

    /// An operation was invoked in the wrong lifecycle state. A caller
    /// bug, reported before the backend is touched.
    #[error("invalid device state: expected {expected:?}, found {found:?}")]
    InvalidState {
        expected: DeviceState,
        found: DeviceState,
    },

    /// The queue id exceeds the backend's advertised queue count.
    #[error("queue id {id} out of range (max {max})")]
    QueueOutOfRange { id: u16, max: u16 },

    /// The backend stopped responding consistently; only a full reset can
    /// recover the handle.
    #[error("device needs reset")]
    DeviceNeedsReset,
}

/// Interrupt delivery mode the transport detected. Advisory only.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MsixStatus {
    /// The transport has no MSI-X capability.
    None,
    /// MSI-X is present but disabled.
    Disabled,
    /// MSI-X is present and enabled.
    Enabled,
}

/// Backend operations of one virtio device instance.
///
/// Contracts the lifecycle core relies on:
///
/// * `set_status` is monotonic-or-reset: bits are only added until a full
///   reset (a single write of 0) clears them all.
/// * `set_features` is written at most once per attach cycle, before
///   FEATURES_OK.
/// * `features_ok` sets the FEATURES_OK status bit and reports whether the
///   device kept it on the first read-back.
/// * `notify_queue` must be callable from the packet path without blocking
///   and without touching shared device-status state.
/// * `dev_close` is idempotent.
pub trait VirtioOps: Send + Sync {
    /// Raw config-space read. The caller has already validated the range.
    fn read_dev_cfg(&self, offset: usize, buf: &mut [u8]);

    /// Raw config-space write. The caller has already validated the range.
    fn write_dev_cfg(&self, offset: usize, src: &[u8]);

    fn get_status(&self) -> DeviceStatusFlags;
    fn set_status(&self, status: DeviceStatusFlags);

    /// The 64-bit feature mask the device offers.
    fn get_features(&self) -> Features;

    /// Write the driver's accepted feature mask.
    fn set_features(&self, features: Features);

    /// Finalize negotiation on the backend. Returns `false` if the device
    /// refused the accepted mask.
    fn features_ok(&self) -> bool;

    /// Read and implicitly clear the interrupt-status register.
    fn get_isr(&self) -> IsrStatus;

    /// Bind the config-change interrupt. Returns the vector actually
    /// assigned, or [`crate::spec::MSI_NO_VECTOR`].
    fn set_config_irq(&self, vector: u16) -> u16;

    /// Bind a queue interrupt. Returns the vector actually assigned, or
    /// [`crate::spec::MSI_NO_VECTOR`].
    fn set_queue_irq(&self, queue: &Virtqueue, vector: u16) -> u16;

    /// The backend-advertised depth for a queue id; zero means the queue
    /// does not exist on this backend.
    fn get_queue_num(&self, queue_id: u16) -> u16;

    /// Allocate backend-side resources for one virtqueue.
    fn setup_queue(&self, queue: &Virtqueue) -> Result<(), Error>;

    /// Release backend-side resources for one virtqueue.
    fn del_queue(&self, queue: &Virtqueue);

    /// Signal the backend that new descriptors are available. Hot path;
    /// must not block.
    fn notify_queue(&self, queue_id: u16);

    /// Probe which interrupt delivery mode the transport supports.
    fn intr_detect(&self) -> MsixStatus;

    /// Release all backend resources. Calling twice is a no-op.
    fn dev_close(&self);
}
