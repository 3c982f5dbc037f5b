//! Feature negotiation.
//!
//! The candidate mask is the intersection of what the host offers and what
//! the driver asked for. Dependent bits whose prerequisite did not make the
//! candidate are dropped rather than failing the whole negotiation, so a
//! backend with a partial offer still brings up. Transport-window bits are
//! carried through independently of the device bits.

use crate::hw::{DeviceState, HwState, VirtioHw};
use crate::spec::{DeviceStatusFlags, Features};
use crate::transport::Error;

/// Prerequisite table, `(bit, any_of)`: the bit is dropped from the
/// candidate unless at least one bit of `any_of` is also present. Kept as
/// data so a transport or product variant can be audited against it.
///
/// Entries never cross the transport window in either direction; that is
/// what keeps transport negotiation independent of device negotiation.
pub const FEATURE_PREREQS: &[(Features, Features)] = &[
    (Features::GUEST_TSO4, Features::GUEST_CSUM),
    (Features::GUEST_TSO6, Features::GUEST_CSUM),
    (Features::GUEST_UFO, Features::GUEST_CSUM),
    (
        Features::GUEST_ECN,
        Features::GUEST_TSO4.union(Features::GUEST_TSO6),
    ),
    (Features::HOST_TSO4, Features::CSUM),
    (Features::HOST_TSO6, Features::CSUM),
    (Features::HOST_UFO, Features::CSUM),
    (
        Features::HOST_ECN,
        Features::HOST_TSO4.union(Features::HOST_TSO6),
    ),
    (Features::CTRL_RX, Features::CTRL_VQ),
    (Features::CTRL_VLAN, Features::CTRL_VQ),
    (Features::CTRL_RX_EXTRA, Features::CTRL_VQ),
    (Features::GUEST_ANNOUNCE, Features::CTRL_VQ),
    (Features::MQ, Features::CTRL_VQ),
    (Features::CTRL_MAC_ADDR, Features::CTRL_VQ),
];

/// Pure candidate selection: intersect, then drop dependent bits until the
/// mask is self-consistent. The result is a subset of both inputs.
pub fn select_features(host_offered: Features, requested: Features) -> Features {
    apply_prereqs(host_offered & requested)
}

fn apply_prereqs(candidate: Features) -> Features {
    let mut mask = candidate;

    // Dropping a bit can invalidate another bit's prerequisite, so iterate
    // to a fixpoint. The table is short; this converges in a few rounds.
    loop {
        let mut dropped = Features::empty();

        for &(bit, any_of) in FEATURE_PREREQS {
            if mask.contains(bit) && !mask.intersects(any_of) {
                dropped |= bit;
            }
        }

        if dropped.is_empty() {
            return mask;
        }

        log::debug!(
            "virtio-net: dropping {:#x}: prerequisite not negotiated",
            dropped.bits()
        );
        mask &= !dropped;
    }
}

/// One re-read normally suffices; the bound covers backends that latch the
/// status a write later.
const FEATURES_OK_POLL: usize = 3;

/// Write the selected mask to the backend and confirm it was accepted.
///
/// Called with the handle's state lock held. On rejection the handle moves
/// to FAILED and must be reset before another attempt; no reduced-mask
/// retry happens here.
pub(crate) fn run(
    hw: &VirtioHw,
    st: &mut HwState,
    host_offered: Features,
) -> Result<Features, Error> {
    if st.device_state != DeviceState::Driver {
        return Err(Error::InvalidState {
            expected: DeviceState::Driver,
            found: st.device_state,
        });
    }
    if st.features_written {
        return Err(Error::InvalidState {
            expected: DeviceState::Driver,
            found: st.device_state,
        });
    }

    let negotiated = select_features(host_offered, hw.requested_features());
    log::info!(
        "virtio-net: port {}: negotiated {:#x} (host {:#x}, requested {:#x})",
        hw.port_id(),
        negotiated.bits(),
        host_offered.bits(),
        hw.requested_features().bits()
    );

    hw.ops().set_features(negotiated);
    st.features_written = true;

    if !hw.ops().features_ok() {
        st.device_state = DeviceState::Failed;
        return Err(Error::NegotiationRejected);
    }

    // The backend may clear FEATURES_OK after reporting initial success;
    // only the re-read is authoritative.
    let mut retained = false;
    for _ in 0..FEATURES_OK_POLL {
        if hw
            .ops()
            .get_status()
            .contains(DeviceStatusFlags::FEATURES_OK)
        {
            retained = true;
            break;
        }
    }

    if !retained {
        log::warn!(
            "virtio-net: port {}: device cleared FEATURES_OK",
            hw.port_id()
        );
        st.device_state = DeviceState::Failed;
        return Err(Error::NegotiationRejected);
    }

    st.adopt_negotiated(negotiated);
    Ok(negotiated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_is_subset_of_both_masks() {
        let host = Features::CSUM
            | Features::GUEST_CSUM
            | Features::MRG_RXBUF
            | Features::VERSION_1
            | Features::RING_PACKED;
        let requested =
            Features::CSUM | Features::MRG_RXBUF | Features::STATUS | Features::VERSION_1;

        let result = select_features(host, requested);
        assert!(host.contains(result));
        assert!(requested.contains(result));
    }

    #[test]
    fn bit_not_offered_by_host_is_dropped() {
        // MQ is requested but not offered; everything else survives. MQ's
        // own prerequisite (CTRL_VQ) never enters the candidate either.
        let host = Features::CSUM
            | Features::GUEST_CSUM
            | Features::MRG_RXBUF
            | Features::STATUS
            | Features::VERSION_1;
        let requested = Features::CSUM
            | Features::MRG_RXBUF
            | Features::STATUS
            | Features::VERSION_1
            | Features::MQ;

        assert_eq!(
            select_features(host, requested),
            Features::CSUM | Features::MRG_RXBUF | Features::STATUS | Features::VERSION_1
        );
    }

    #[test]
    fn dependent_bits_drop_transitively() {
        // Without GUEST_CSUM, the TSO bits fall, and GUEST_ECN falls with
        // them on the next round.
        let offered = Features::GUEST_TSO4 | Features::GUEST_TSO6 | Features::GUEST_ECN;
        assert_eq!(select_features(offered, offered), Features::empty());

        // With the prerequisite present the chain survives intact.
        let full = offered | Features::GUEST_CSUM;
        assert_eq!(select_features(full, full), full);
    }

    #[test]
    fn control_channel_gates_its_sub_capabilities() {
        let requested = Features::CTRL_RX | Features::CTRL_VLAN | Features::MQ;
        assert_eq!(select_features(requested, requested), Features::empty());

        let with_cvq = requested | Features::CTRL_VQ;
        assert_eq!(select_features(with_cvq, with_cvq), with_cvq);
    }

    #[test]
    fn transport_bits_negotiate_independently() {
        let host = Features::CSUM
            | Features::GUEST_CSUM
            | Features::MQ
            | Features::CTRL_VQ
            | Features::SPEED_DUPLEX
            | Features::RING_INDIRECT_DESC
            | Features::RING_EVENT_IDX
            | Features::VERSION_1
            | Features::RING_PACKED;

        let device_bits = Features::CSUM
            | Features::GUEST_CSUM
            | Features::MQ
            | Features::CTRL_VQ
            | Features::SPEED_DUPLEX;

        let with_device = select_features(host, host);
        let without_device = select_features(host, host.difference(device_bits));

        assert_eq!(with_device.transport_bits(), without_device.transport_bits());
    }

    #[test]
    fn prereq_table_never_crosses_the_transport_window() {
        for &(bit, any_of) in FEATURE_PREREQS {
            let bit_is_transport = Features::TRANSPORT_WINDOW.contains(bit);
            let prereq_is_transport = Features::TRANSPORT_WINDOW.contains(any_of);
            assert_eq!(
                bit_is_transport, prereq_is_transport,
                "entry ({:#x}, {:#x}) crosses the transport window",
                bit.bits(),
                any_of.bits()
            );
        }
    }

    #[test]
    fn unknown_future_bits_pass_through() {
        let future = Features::from_bit(45);
        let both = future | Features::CSUM;
        assert_eq!(select_features(both, both), both);
        assert_eq!(select_features(both, Features::CSUM), Features::CSUM);
    }
}
