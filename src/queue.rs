//! Virtqueue lifecycle: one queue at a time, only after the negotiated
//! feature set is final.

use crate::hw::VirtioHw;
use crate::spec::{Features, MSI_NO_VECTOR};
use crate::transport::Error;

/// Driver-side record of one backend virtqueue. Owned exclusively by the
/// handle that set it up and destroyed with it; never shared between
/// handles.
#[derive(Debug, Clone)]
pub struct Virtqueue {
    /// Queue id on the backend.
    pub id: u16,
    /// Depth the backend advertised for this queue.
    pub size: u16,
    /// Interrupt vector bound to the queue, or
    /// [`MSI_NO_VECTOR`](crate::spec::MSI_NO_VECTOR).
    pub vector: u16,
}

impl VirtioHw {
    /// Set up one virtqueue. The device must have reached FEATURES_OK and
    /// the queue id must be below the advertised queue count; both are
    /// checked before the backend is touched. A backend that advertises
    /// zero depth for the queue despite the negotiated capability yields
    /// [`Error::QueueNotPresent`], which callers may treat as "proceed
    /// with fewer queues".
    pub fn setup_queue(&self, queue_id: u16) -> Result<u16, Error> {
        let mut st = self.state.lock().unwrap();

        if !st.device_state.queues_allowed() {
            return Err(Error::InvalidState {
                expected: crate::hw::DeviceState::FeaturesOk,
                found: st.device_state,
            });
        }
        if queue_id >= st.max_queue_pairs {
            return Err(Error::QueueOutOfRange {
                id: queue_id,
                max: st.max_queue_pairs,
            });
        }
        if st.queues[queue_id as usize].is_some() {
            return Err(Error::QueueBusy(queue_id));
        }

        let depth = self.ops().get_queue_num(queue_id);
        if depth == 0 {
            log::warn!(
                "virtio-net: port {}: queue {queue_id} negotiated but absent",
                self.port_id()
            );
            return Err(Error::QueueNotPresent(queue_id));
        }

        let vq = Virtqueue {
            id: queue_id,
            size: depth,
            vector: MSI_NO_VECTOR,
        };
        self.ops().setup_queue(&vq)?;

        log::info!(
            "virtio-net: port {}: queue {queue_id} up (depth={depth})",
            self.port_id()
        );
        st.queues[queue_id as usize] = Some(vq);
        Ok(depth)
    }

    /// Release one virtqueue. Idempotent: tearing down a queue that was
    /// never set up (or was already torn down) is a no-op.
    pub fn del_queue(&self, queue_id: u16) {
        let mut st = self.state.lock().unwrap();

        let Some(vq) = st
            .queues
            .get_mut(queue_id as usize)
            .and_then(Option::take)
        else {
            return;
        };

        if st.cvq == Some(queue_id) {
            st.cvq = None;
        }
        self.ops().del_queue(&vq);
        log::info!(
            "virtio-net: port {}: queue {queue_id} down",
            self.port_id()
        );
    }

    /// Kick the backend for a queue. Deliberately outside the state lock:
    /// this is the hot path and only touches queue-local signaling.
    #[inline]
    pub fn notify_queue(&self, queue_id: u16) {
        self.ops().notify_queue(queue_id);
    }

    /// Bind a queue interrupt and record the vector the transport actually
    /// assigned.
    pub fn set_queue_irq(&self, queue_id: u16, vector: u16) -> Result<u16, Error> {
        let mut st = self.state.lock().unwrap();

        let vq = st
            .queues
            .get_mut(queue_id as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::QueueNotPresent(queue_id))?;

        let assigned = self.ops().set_queue_irq(vq, vector);
        if assigned == MSI_NO_VECTOR {
            return Err(Error::VectorUnavailable);
        }
        vq.vector = assigned;
        Ok(assigned)
    }

    /// Designate an already set-up queue as the control queue. Requires
    /// the control-channel feature; the reference does not own the queue.
    pub fn bind_control_queue(&self, queue_id: u16) -> Result<(), Error> {
        if !self.with_feature(Features::CTRL_VQ) {
            return Err(Error::QueueNotPresent(queue_id));
        }

        let mut st = self.state.lock().unwrap();
        if st
            .queues
            .get(queue_id as usize)
            .and_then(Option::as_ref)
            .is_none()
        {
            return Err(Error::QueueNotPresent(queue_id));
        }

        st.cvq = Some(queue_id);
        Ok(())
    }

    /// The designated control queue, if any.
    pub fn control_queue(&self) -> Option<u16> {
        self.state.lock().unwrap().cvq
    }
}
