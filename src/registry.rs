//! Process-wide transport bindings, one per port.
//!
//! Each slot is written exactly once during attach and is read-only
//! afterwards, so lookups after initialization need no synchronization.
//! Concurrent attach of the same port is resolved by the slot itself: the
//! loser gets [`Error::AlreadyBound`].

use std::sync::{Arc, OnceLock};

use crate::transport::{Error, VirtioOps};

/// Upper bound on port identities in one process.
pub const MAX_PORTS: usize = 32;

#[allow(clippy::declare_interior_mutable_const)]
const UNBOUND: OnceLock<Arc<dyn VirtioOps>> = OnceLock::new();

static PORTS: [OnceLock<Arc<dyn VirtioOps>>; MAX_PORTS] = [UNBOUND; MAX_PORTS];

/// Bind a transport to a port identity. Write-once: a second bind of the
/// same port fails and leaves the first binding in place.
pub fn bind(port_id: u16, ops: Arc<dyn VirtioOps>) -> Result<(), Error> {
    let slot = PORTS
        .get(port_id as usize)
        .ok_or(Error::PortOutOfRange(port_id))?;

    slot.set(ops).map_err(|_| Error::AlreadyBound(port_id))?;
    log::info!("virtio-net: port {port_id}: transport bound");
    Ok(())
}

/// Look up the transport bound to a port, if any.
pub fn get(port_id: u16) -> Option<Arc<dyn VirtioOps>> {
    PORTS.get(port_id as usize)?.get().cloned()
}
