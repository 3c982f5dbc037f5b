//! Per-device state and the device-status state machine.
//!
//! A [`VirtioHw`] is shared between a management/control thread and the
//! interrupt path. Everything both of them touch lives behind one mutex
//! with short critical sections; the queue notification path never takes
//! it (see [`VirtioHw::notify_queue`]).

use std::sync::{Arc, Mutex};

use crate::negotiate;
use crate::queue::Virtqueue;
use crate::registry;
use crate::spec::{
    net_cfg, DeviceStatusFlags, Features, IsrStatus, DEFAULT_MTU, DUPLEX_UNKNOWN, MSI_NO_VECTOR,
    NET_HDR_MRG_SIZE, NET_HDR_SIZE, SPEED_UNKNOWN, VIRTIO_NET_S_ANNOUNCE, VIRTIO_NET_S_LINK_UP,
};
use crate::transport::{Error, MsixStatus, VirtioOps};

/// Position in the mandatory bring-up sequence.
///
/// Transitions are strictly forward; the only way back is a full reset.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum DeviceState {
    /// Status register is zero; nothing negotiated.
    #[default]
    Reset,
    /// The device has been recognized.
    Acknowledge,
    /// We know how to drive the device.
    Driver,
    /// The device accepted the negotiated feature set and kept the
    /// FEATURES_OK bit on re-read.
    FeaturesOk,
    /// Terminal success; queues are live.
    DriverOk,
    /// Terminal failure for this attach cycle.
    Failed,
    /// The backend reported an inconsistency; only a reset recovers.
    NeedsReset,
}

impl DeviceState {
    /// Queue setup requires the negotiated features to be final.
    pub fn queues_allowed(self) -> bool {
        matches!(self, DeviceState::FeaturesOk | DeviceState::DriverOk)
    }
}

/// Ring-format decisions derived from the negotiated features, fixed for
/// the lifetime of the handle before any queue is set up.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingLayout {
    pub packed: bool,
    pub in_order: bool,
    pub vec_rx: bool,
    pub vec_tx: bool,
}

impl RingLayout {
    pub fn from_features(f: Features) -> Self {
        let packed = f.contains(Features::RING_PACKED);
        let in_order = f.contains(Features::IN_ORDER);

        // The vectorized split-ring paths cannot handle packed rings,
        // in-order completion, mergeable buffers or offloads.
        let rx_offloads = Features::GUEST_CSUM
            | Features::GUEST_TSO4
            | Features::GUEST_TSO6
            | Features::GUEST_UFO
            | Features::MRG_RXBUF;
        let tx_offloads =
            Features::CSUM | Features::HOST_TSO4 | Features::HOST_TSO6 | Features::HOST_UFO;

        RingLayout {
            packed,
            in_order,
            vec_rx: !packed && !in_order && !f.intersects(rx_offloads),
            vec_tx: !packed && !in_order && !f.intersects(tx_offloads),
        }
    }
}

/// Mutable per-device state, guarded by the handle's state lock.
#[derive(Debug)]
pub(crate) struct HwState {
    pub(crate) device_state: DeviceState,
    pub(crate) negotiated: Features,
    pub(crate) features_written: bool,
    pub(crate) started: bool,
    pub(crate) opened: bool,
    pub(crate) link: u16,
    pub(crate) mac: Option<[u8; 6]>,
    pub(crate) max_queue_pairs: u16,
    pub(crate) max_mtu: u16,
    pub(crate) speed: u32,
    pub(crate) duplex: u8,
    pub(crate) vtnet_hdr_size: u16,
    pub(crate) weak_barriers: bool,
    pub(crate) vlan_strip: bool,
    pub(crate) has_rx_offload: bool,
    pub(crate) has_tx_offload: bool,
    pub(crate) msix: MsixStatus,
    pub(crate) ring: Option<RingLayout>,
    pub(crate) queues: Vec<Option<Virtqueue>>,
    pub(crate) cvq: Option<u16>,
}

impl Default for HwState {
    fn default() -> Self {
        HwState {
            device_state: DeviceState::Reset,
            negotiated: Features::empty(),
            features_written: false,
            started: false,
            opened: false,
            link: 0,
            mac: None,
            max_queue_pairs: 1,
            max_mtu: DEFAULT_MTU,
            speed: SPEED_UNKNOWN,
            duplex: DUPLEX_UNKNOWN,
            vtnet_hdr_size: NET_HDR_SIZE,
            weak_barriers: true,
            vlan_strip: false,
            has_rx_offload: false,
            has_tx_offload: false,
            msix: MsixStatus::None,
            ring: None,
            queues: Vec::new(),
            cvq: None,
        }
    }
}

impl HwState {
    /// Fix the negotiated set and everything derived from it. The set is
    /// immutable from here until the next reset.
    pub(crate) fn adopt_negotiated(&mut self, f: Features) {
        self.negotiated = f;
        self.ring = Some(RingLayout::from_features(f));

        self.vtnet_hdr_size = if f
            .intersects(Features::MRG_RXBUF | Features::VERSION_1 | Features::RING_PACKED)
        {
            NET_HDR_MRG_SIZE
        } else {
            NET_HDR_SIZE
        };

        self.has_rx_offload = f.intersects(
            Features::GUEST_CSUM | Features::GUEST_TSO4 | Features::GUEST_TSO6 | Features::GUEST_UFO,
        );
        self.has_tx_offload = f.intersects(
            Features::CSUM | Features::HOST_TSO4 | Features::HOST_TSO6 | Features::HOST_UFO,
        );
        self.weak_barriers = !f.contains(Features::ORDER_PLATFORM);

        self.device_state = DeviceState::FeaturesOk;
    }
}

/// Bound on status-register polls after a write; register-backed devices
/// normally acknowledge on the first re-read.
const RESET_POLL: usize = 3;

/// One virtio-net device instance, bound to a transport at attach time.
pub struct VirtioHw {
    port_id: u16,
    requested_features: Features,
    ops: Arc<dyn VirtioOps>,
    pub(crate) state: Mutex<HwState>,
}

impl VirtioHw {
    /// Bind `ops` to `port_id` in the process-wide registry and create the
    /// handle. A port can be attached exactly once per process lifetime.
    pub fn attach(
        port_id: u16,
        ops: Arc<dyn VirtioOps>,
        requested_features: Features,
    ) -> Result<Arc<VirtioHw>, Error> {
        registry::bind(port_id, ops.clone())?;

        Ok(Arc::new(VirtioHw {
            port_id,
            requested_features,
            ops,
            state: Mutex::new(HwState {
                opened: true,
                ..HwState::default()
            }),
        }))
    }

    pub fn port_id(&self) -> u16 {
        self.port_id
    }

    /// The mask the driver asked for before negotiation.
    pub fn requested_features(&self) -> Features {
        self.requested_features
    }

    pub(crate) fn ops(&self) -> &dyn VirtioOps {
        &*self.ops
    }

    pub fn device_state(&self) -> DeviceState {
        self.state.lock().unwrap().device_state
    }

    /// The negotiated feature set; empty until negotiation succeeds.
    pub fn negotiated_features(&self) -> Features {
        self.state.lock().unwrap().negotiated
    }

    pub fn with_feature(&self, feature: Features) -> bool {
        self.negotiated_features().contains(feature)
    }

    // ---- status state machine ----

    /// Full device reset: one status write of zero, then confirm the
    /// backend cleared it. Discards negotiated features, ring-format
    /// selection and all queue handles.
    pub fn reset(&self) -> Result<(), Error> {
        let mut st = self.state.lock().unwrap();
        self.reset_locked(&mut st)
    }

    fn reset_locked(&self, st: &mut HwState) -> Result<(), Error> {
        self.ops.set_status(DeviceStatusFlags::empty());

        let mut cleared = false;
        for _ in 0..RESET_POLL {
            if self.ops.get_status().is_empty() {
                cleared = true;
                break;
            }
        }

        if !cleared {
            log::warn!(
                "virtio-net: port {}: device did not acknowledge reset",
                self.port_id
            );
            st.device_state = DeviceState::NeedsReset;
            return Err(Error::DeviceNeedsReset);
        }

        st.device_state = DeviceState::Reset;
        st.negotiated = Features::empty();
        st.features_written = false;
        st.started = false;
        st.ring = None;
        // A reset invalidates backend queue state wholesale; the per-queue
        // teardown path does not apply.
        st.queues.clear();
        st.cvq = None;

        log::info!("virtio-net: port {}: device reset", self.port_id);
        Ok(())
    }

    fn step_locked(
        &self,
        st: &mut HwState,
        from: DeviceState,
        to: DeviceState,
        flag: DeviceStatusFlags,
    ) -> Result<(), Error> {
        if st.device_state != from {
            return Err(Error::InvalidState {
                expected: from,
                found: st.device_state,
            });
        }

        // Monotonic write: add the new bit on top of the current value.
        let current = self.ops.get_status();
        self.ops.set_status(current | flag);
        st.device_state = to;
        Ok(())
    }

    /// RESET -> ACKNOWLEDGE.
    pub fn acknowledge(&self) -> Result<(), Error> {
        let mut st = self.state.lock().unwrap();
        self.step_locked(
            &mut st,
            DeviceState::Reset,
            DeviceState::Acknowledge,
            DeviceStatusFlags::ACKNOWLEDGE,
        )
    }

    /// ACKNOWLEDGE -> DRIVER.
    pub fn declare_driver(&self) -> Result<(), Error> {
        let mut st = self.state.lock().unwrap();
        self.step_locked(
            &mut st,
            DeviceState::Acknowledge,
            DeviceState::Driver,
            DeviceStatusFlags::DRIVER,
        )
    }

    /// Run feature negotiation against an explicit host offer and, on
    /// success, refresh the config-space fields the negotiated set unlocks.
    pub fn negotiate(&self, host_offered: Features) -> Result<Features, Error> {
        let mut st = self.state.lock().unwrap();
        let negotiated = negotiate::run(self, &mut st, host_offered)?;
        self.refresh_config_locked(&mut st);
        Ok(negotiated)
    }

    /// Drive the device from reset through negotiation: reset, status
    /// handshake, interrupt-mode probe, then [`VirtioHw::negotiate`] with
    /// the backend's own offer. Queue setup and start remain the caller's.
    pub fn init(&self) -> Result<Features, Error> {
        self.reset()?;
        self.acknowledge()?;
        self.declare_driver()?;

        let msix = self.ops.intr_detect();
        self.state.lock().unwrap().msix = msix;
        log::debug!("virtio-net: port {}: interrupt mode {:?}", self.port_id, msix);

        let offered = self.ops.get_features();
        self.negotiate(offered)
    }

    /// FEATURES_OK -> DRIVER_OK; also re-arms a stopped device without a
    /// second status write.
    pub fn start(&self) -> Result<(), Error> {
        let mut st = self.state.lock().unwrap();

        match st.device_state {
            DeviceState::FeaturesOk => {
                let current = self.ops.get_status();
                self.ops.set_status(current | DeviceStatusFlags::DRIVER_OK);
                st.device_state = DeviceState::DriverOk;
                log::info!("virtio-net: port {}: driver ok", self.port_id);
            }
            DeviceState::DriverOk => {}
            found => {
                return Err(Error::InvalidState {
                    expected: DeviceState::FeaturesOk,
                    found,
                })
            }
        }

        st.started = true;
        Ok(())
    }

    /// Stop serving traffic without touching the status register; the
    /// negotiated state stays intact and [`VirtioHw::start`] re-arms.
    pub fn stop(&self) {
        self.state.lock().unwrap().started = false;
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().started
    }

    /// Tear down every queue and release the backend. Safe to call twice;
    /// the second call is a no-op.
    pub fn close(&self) {
        let mut st = self.state.lock().unwrap();
        if !st.opened {
            return;
        }

        st.started = false;
        for slot in st.queues.iter_mut() {
            if let Some(vq) = slot.take() {
                self.ops.del_queue(&vq);
            }
        }
        st.cvq = None;

        self.ops.dev_close();
        st.opened = false;
        log::info!("virtio-net: port {}: closed", self.port_id);
    }

    // ---- device config space ----

    fn check_cfg_range(offset: usize, len: usize) -> Result<(), Error> {
        match offset.checked_add(len) {
            Some(end) if end <= net_cfg::SIZE => Ok(()),
            _ => Err(Error::ConfigAccessOutOfRange { offset, len }),
        }
    }

    /// Validated raw config read.
    pub fn read_dev_cfg(&self, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        Self::check_cfg_range(offset, buf.len())?;
        self.ops.read_dev_cfg(offset, buf);
        Ok(())
    }

    /// Validated raw config write.
    pub fn write_dev_cfg(&self, offset: usize, src: &[u8]) -> Result<(), Error> {
        Self::check_cfg_range(offset, src.len())?;
        self.ops.write_dev_cfg(offset, src);
        Ok(())
    }

    fn cfg_u16(&self, offset: usize) -> u16 {
        let mut buf = [0u8; 2];
        self.ops.read_dev_cfg(offset, &mut buf);
        u16::from_le_bytes(buf)
    }

    fn cfg_u32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        self.ops.read_dev_cfg(offset, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn refresh_config_locked(&self, st: &mut HwState) {
        let f = st.negotiated;

        st.max_queue_pairs = if f.contains(Features::MQ) {
            self.cfg_u16(net_cfg::MAX_VIRTQUEUE_PAIRS).max(1)
        } else {
            1
        };
        st.queues = std::iter::repeat_with(|| None)
            .take(st.max_queue_pairs as usize)
            .collect();

        st.max_mtu = if f.contains(Features::MTU) {
            self.cfg_u16(net_cfg::MTU)
        } else {
            DEFAULT_MTU
        };

        if f.contains(Features::MAC) {
            let mut mac = [0u8; 6];
            self.ops.read_dev_cfg(net_cfg::MAC, &mut mac);
            st.mac = Some(mac);
        }

        st.link = if f.contains(Features::STATUS) {
            self.cfg_u16(net_cfg::STATUS)
        } else {
            VIRTIO_NET_S_LINK_UP
        };

        if f.contains(Features::SPEED_DUPLEX) {
            st.speed = self.cfg_u32(net_cfg::SPEED);
            let mut duplex = [0u8; 1];
            self.ops.read_dev_cfg(net_cfg::DUPLEX, &mut duplex);
            st.duplex = duplex[0];
        }

        log::debug!(
            "virtio-net: port {}: {} queue pair(s), mtu {}, link {:#x}",
            self.port_id,
            st.max_queue_pairs,
            st.max_mtu,
            st.link
        );
    }

    /// The device MAC, if the MAC feature was negotiated.
    pub fn mac(&self) -> Option<[u8; 6]> {
        self.state.lock().unwrap().mac
    }

    /// Program the device MAC through config space. Devices with
    /// CTRL_MAC_ADDR take the address through the control channel instead;
    /// that path lives with the packet-path collaborator.
    pub fn set_mac(&self, mac: &[u8; 6]) -> Result<(), Error> {
        self.write_dev_cfg(net_cfg::MAC, mac)?;
        self.state.lock().unwrap().mac = Some(*mac);
        Ok(())
    }

    pub fn max_queue_pairs(&self) -> u16 {
        self.state.lock().unwrap().max_queue_pairs
    }

    pub fn max_mtu(&self) -> u16 {
        self.state.lock().unwrap().max_mtu
    }

    /// Link speed in megabits, or [`SPEED_UNKNOWN`].
    pub fn speed(&self) -> u32 {
        self.state.lock().unwrap().speed
    }

    pub fn duplex(&self) -> u8 {
        self.state.lock().unwrap().duplex
    }

    /// Size of the net header the negotiated features imply.
    pub fn vtnet_hdr_size(&self) -> u16 {
        self.state.lock().unwrap().vtnet_hdr_size
    }

    /// Ring-format selection; `None` until negotiation succeeds.
    pub fn ring_layout(&self) -> Option<RingLayout> {
        self.state.lock().unwrap().ring
    }

    pub fn msix_status(&self) -> MsixStatus {
        self.state.lock().unwrap().msix
    }

    pub fn weak_barriers(&self) -> bool {
        self.state.lock().unwrap().weak_barriers
    }

    /// VLAN stripping toggle; a receive-mode preference the ethdev layer
    /// sets, consumed by the packet path.
    pub fn set_vlan_strip(&self, on: bool) {
        self.state.lock().unwrap().vlan_strip = on;
    }

    pub fn vlan_strip(&self) -> bool {
        self.state.lock().unwrap().vlan_strip
    }

    pub fn has_rx_offload(&self) -> bool {
        self.state.lock().unwrap().has_rx_offload
    }

    pub fn has_tx_offload(&self) -> bool {
        self.state.lock().unwrap().has_tx_offload
    }

    /// Current link-status word as an opaque value: LINK_UP and ANNOUNCE
    /// bits. Reads fresh from config space when STATUS was negotiated,
    /// otherwise the link is reported up by convention.
    pub fn link_status(&self) -> u16 {
        let f = self.negotiated_features();
        let link = if f.contains(Features::STATUS) {
            self.cfg_u16(net_cfg::STATUS)
        } else {
            VIRTIO_NET_S_LINK_UP
        };

        self.state.lock().unwrap().link = link;
        link
    }

    // ---- interrupt path ----

    /// Read-and-clear the ISR. Lock-free; the register is queue-local on
    /// the backend.
    pub fn isr(&self) -> IsrStatus {
        self.ops.get_isr()
    }

    /// Interrupt-path handler for a config-change notification: refresh
    /// the link word and pick up a backend NEEDS_RESET report. Returns the
    /// new link word.
    pub fn process_config_change(&self) -> u16 {
        let status = self.ops.get_status();
        let link = self.link_status();

        let mut st = self.state.lock().unwrap();

        if status.contains(DeviceStatusFlags::DEVICE_NEEDS_RESET)
            && st.device_state != DeviceState::NeedsReset
        {
            log::warn!("virtio-net: port {}: device needs reset", self.port_id);
            st.device_state = DeviceState::NeedsReset;
        }

        if link & VIRTIO_NET_S_ANNOUNCE != 0 && st.negotiated.contains(Features::GUEST_ANNOUNCE) {
            log::info!("virtio-net: port {}: link announcement requested", self.port_id);
        }

        link
    }

    /// Bind the config-change interrupt to a vector.
    pub fn set_config_irq(&self, vector: u16) -> Result<u16, Error> {
        let assigned = self.ops.set_config_irq(vector);
        if assigned == MSI_NO_VECTOR {
            return Err(Error::VectorUnavailable);
        }
        Ok(assigned)
    }
}
