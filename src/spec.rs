//! Wire-stable constants shared with the backend.
//!
//! Bit positions and register values here are part of the virtio protocol;
//! a mismatch corrupts the negotiation silently. Everything is guarded with
//! const assertions where the layout allows it.

use static_assertions::const_assert_eq;

bitflags::bitflags! {
    /// Device-status register bits.
    ///
    /// Status writes are monotonic: bits are only ever added on top of the
    /// current value, until a full reset (a single write of 0) clears them
    /// all at once.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct DeviceStatusFlags: u8 {
        /// The guest OS has found the device and recognized it as valid.
        const ACKNOWLEDGE = 1;
        /// The guest OS knows how to drive the device.
        const DRIVER = 2;
        /// The driver is set up and ready to drive the device.
        const DRIVER_OK = 4;
        /// Feature negotiation is complete. The device may clear this bit
        /// again to reject the negotiated set; the driver must re-read the
        /// status to confirm it stuck.
        const FEATURES_OK = 8;
        /// The device has experienced an error it cannot recover from.
        const DEVICE_NEEDS_RESET = 64;
        /// The guest has given up on the device.
        const FAILED = 128;
    }
}

bitflags::bitflags! {
    /// ISR status byte. Reading the register clears it on the backend.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct IsrStatus: u8 {
        /// A virtqueue has pending used buffers.
        const QUEUE = 1;
        /// The device configuration has changed.
        const CONFIG = 2;
    }
}

bitflags::bitflags! {
    /// The negotiable feature space of a virtio-net device, one bit per
    /// capability. The numeric positions are fixed by the virtio
    /// specification and must match the backend exactly.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct Features: u64 {
        /// Host handles packets with partial checksum.
        const CSUM = 1 << 0;
        /// Guest handles packets with partial checksum.
        const GUEST_CSUM = 1 << 1;
        /// Initial MTU advice in config space.
        const MTU = 1 << 3;
        /// Host has given a MAC address.
        const MAC = 1 << 5;
        /// Guest can receive TSOv4.
        const GUEST_TSO4 = 1 << 7;
        /// Guest can receive TSOv6.
        const GUEST_TSO6 = 1 << 8;
        /// Guest can receive TSO with ECN.
        const GUEST_ECN = 1 << 9;
        /// Guest can receive UFO.
        const GUEST_UFO = 1 << 10;
        /// Host can receive TSOv4.
        const HOST_TSO4 = 1 << 11;
        /// Host can receive TSOv6.
        const HOST_TSO6 = 1 << 12;
        /// Host can receive TSO with ECN.
        const HOST_ECN = 1 << 13;
        /// Host can receive UFO.
        const HOST_UFO = 1 << 14;
        /// Host can merge receive buffers.
        const MRG_RXBUF = 1 << 15;
        /// Link status is available in config space.
        const STATUS = 1 << 16;
        /// A control channel virtqueue is available.
        const CTRL_VQ = 1 << 17;
        /// Control channel RX mode support.
        const CTRL_RX = 1 << 18;
        /// Control channel VLAN filtering.
        const CTRL_VLAN = 1 << 19;
        /// Extra RX mode control support.
        const CTRL_RX_EXTRA = 1 << 20;
        /// Guest can announce the device on the network.
        const GUEST_ANNOUNCE = 1 << 21;
        /// Device supports receive flow steering.
        const MQ = 1 << 22;
        /// MAC address can be set through the control channel.
        const CTRL_MAC_ADDR = 1 << 23;
        /// Device notifies even when notifications are suppressed and the
        /// ring is completely used.
        const NOTIFY_ON_EMPTY = 1 << 24;
        /// Device can handle any descriptor layout.
        const ANY_LAYOUT = 1 << 27;
        /// Driver can use indirect buffer descriptors.
        const RING_INDIRECT_DESC = 1 << 28;
        /// Enables the used_event and avail_event notification suppression
        /// fields.
        const RING_EVENT_IDX = 1 << 29;
        /// Compliance with the version 1 specification; a simple way to
        /// detect legacy devices.
        const VERSION_1 = 1 << 32;
        /// Device access to memory is limited and/or translated, e.g. by an
        /// IOMMU.
        const IOMMU_PLATFORM = 1 << 33;
        /// Support for the packed virtqueue layout.
        const RING_PACKED = 1 << 34;
        /// All buffers are used by the device in the order in which they
        /// were made available.
        const IN_ORDER = 1 << 35;
        /// Memory accesses by driver and device are ordered as described by
        /// the platform; requires stronger barriers than a software backend.
        const ORDER_PLATFORM = 1 << 36;
        /// Driver passes extra data in its device notifications.
        const NOTIFICATION_DATA = 1 << 38;
        /// Device reports link speed and duplex in config space.
        const SPEED_DUPLEX = 1 << 63;

        // Unknown bits pass through mask arithmetic unchanged so future
        // feature bits survive negotiation.
        const _ = !0;
    }
}

/// First bit of the window reserved for the transport (ring format,
/// ordering guarantees) rather than the device class.
pub const TRANSPORT_F_START: u32 = 28;
/// Last bit of the transport window, inclusive.
pub const TRANSPORT_F_END: u32 = 34;

impl Features {
    /// Bits 28 through 34 inclusive: negotiated by the transport, never by
    /// device-class logic.
    pub const TRANSPORT_WINDOW: Features = Features::from_bits_retain(0x7f << TRANSPORT_F_START);

    /// The feature at a raw bit position.
    pub const fn from_bit(bit: u32) -> Features {
        Features::from_bits_retain(1 << bit)
    }

    /// Whether a raw bit position falls inside the transport window.
    pub const fn is_transport_bit(bit: u32) -> bool {
        bit >= TRANSPORT_F_START && bit <= TRANSPORT_F_END
    }

    /// The transport-window part of this set.
    pub fn transport_bits(self) -> Features {
        self & Features::TRANSPORT_WINDOW
    }

    /// The device part of this set, i.e. everything outside the transport
    /// window.
    pub fn device_bits(self) -> Features {
        self.difference(Features::TRANSPORT_WINDOW)
    }
}

const_assert_eq!(Features::TRANSPORT_WINDOW.bits(), 0x7f0000000);
const_assert_eq!(Features::VERSION_1.bits(), 1 << 32);
const_assert_eq!(Features::SPEED_DUPLEX.bits(), 1 << 63);

/// Link is up.
pub const VIRTIO_NET_S_LINK_UP: u16 = 1;
/// The device wants the guest to announce itself on the network.
pub const VIRTIO_NET_S_ANNOUNCE: u16 = 2;

/// Sentinel returned by the interrupt-binding operations when the transport
/// cannot honor the request.
pub const MSI_NO_VECTOR: u16 = 0xffff;

/// Size of the virtio-net header with the mergeable-rxbuf `num_buffers`
/// field, also mandated by version 1 devices and packed rings.
pub const NET_HDR_MRG_SIZE: u16 = 12;
/// Size of the legacy virtio-net header.
pub const NET_HDR_SIZE: u16 = 10;

/// Byte layout of the device-specific (`virtio_net_config`) region.
pub mod net_cfg {
    /// MAC address, 6 bytes.
    pub const MAC: usize = 0;
    /// Link status word; only valid with the STATUS feature.
    pub const STATUS: usize = 6;
    /// Advertised receive/transmit queue pair count; only valid with MQ.
    pub const MAX_VIRTQUEUE_PAIRS: usize = 8;
    /// MTU advice; only valid with the MTU feature.
    pub const MTU: usize = 10;
    /// Link speed in megabits; only valid with SPEED_DUPLEX.
    pub const SPEED: usize = 12;
    /// Duplex mode; only valid with SPEED_DUPLEX.
    pub const DUPLEX: usize = 16;
    /// Total size of the config region this core will access.
    pub const SIZE: usize = 17;
}

const_assert_eq!(net_cfg::SIZE, net_cfg::DUPLEX + 1);

/// Reported when the device does not advertise a link speed.
pub const SPEED_UNKNOWN: u32 = u32::MAX;
/// Reported when the device does not advertise a duplex mode.
pub const DUPLEX_UNKNOWN: u8 = u8::MAX;
/// Assumed when the device gives no MTU advice.
pub const DEFAULT_MTU: u16 = 1500;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_window_classification() {
        assert!(Features::is_transport_bit(28));
        assert!(Features::is_transport_bit(34));
        assert!(!Features::is_transport_bit(27));
        assert!(!Features::is_transport_bit(35));

        assert!(Features::TRANSPORT_WINDOW.contains(Features::RING_PACKED));
        assert!(Features::TRANSPORT_WINDOW.contains(Features::VERSION_1));
        assert!(!Features::TRANSPORT_WINDOW.intersects(Features::IN_ORDER));
    }

    #[test]
    fn device_transport_partition_is_lossless() {
        let set = Features::CSUM | Features::VERSION_1 | Features::IN_ORDER | Features::MQ;
        assert_eq!(set.device_bits() | set.transport_bits(), set);
        assert!(set.device_bits().intersection(set.transport_bits()).is_empty());
    }

    #[test]
    fn unknown_bits_are_retained() {
        // Bit 45 is unassigned today; it must survive mask arithmetic.
        let future = Features::from_bit(45);
        let set = future | Features::CSUM;
        assert!(set.contains(future));
        assert_eq!((set & !Features::CSUM).bits(), future.bits());
    }
}
