//! In-process backend double for lifecycle and negotiation tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::queue::Virtqueue;
use crate::spec::{
    net_cfg, DeviceStatusFlags, Features, IsrStatus, MSI_NO_VECTOR, VIRTIO_NET_S_LINK_UP,
};
use crate::transport::{Error, MsixStatus, VirtioOps};

/// A backend that behaves like a well-mannered modern device, with knobs
/// for the misbehaviors the core must survive.
pub(crate) struct FakePort {
    pub host_features: Features,
    /// `features_ok` reports failure outright.
    pub reject_features: bool,
    /// `features_ok` reports success but the FEATURES_OK bit is gone on
    /// the next status read.
    pub clear_features_ok: bool,
    /// Depth advertised for every existing queue.
    pub queue_depth: u16,
    /// Queue ids that report zero depth.
    pub missing_queues: Vec<u16>,
    /// When false, every vector request returns the no-vector sentinel.
    pub vectors_available: bool,
    pub mac: [u8; 6],
    pub max_queue_pairs: u16,
    pub mtu: u16,

    pub status: Mutex<DeviceStatusFlags>,
    pub driver_features: Mutex<Features>,
    pub isr: Mutex<IsrStatus>,
    pub closes: AtomicUsize,
    /// Every backend operation invoked, in order.
    pub calls: Mutex<Vec<&'static str>>,
}

impl Default for FakePort {
    fn default() -> Self {
        FakePort {
            host_features: Features::CSUM
                | Features::GUEST_CSUM
                | Features::MAC
                | Features::MTU
                | Features::MRG_RXBUF
                | Features::STATUS
                | Features::CTRL_VQ
                | Features::MQ
                | Features::VERSION_1,
            reject_features: false,
            clear_features_ok: false,
            queue_depth: 256,
            missing_queues: Vec::new(),
            vectors_available: true,
            mac: [0x52, 0x54, 0x00, 0xcb, 0x0e, 0x01],
            max_queue_pairs: 2,
            mtu: 1500,
            status: Mutex::new(DeviceStatusFlags::empty()),
            driver_features: Mutex::new(Features::empty()),
            isr: Mutex::new(IsrStatus::empty()),
            closes: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakePort {
    fn record(&self, op: &'static str) {
        self.calls.lock().unwrap().push(op);
    }

    fn config_bytes(&self) -> [u8; net_cfg::SIZE] {
        let mut cfg = [0u8; net_cfg::SIZE];
        cfg[net_cfg::MAC..net_cfg::MAC + 6].copy_from_slice(&self.mac);
        cfg[net_cfg::STATUS..net_cfg::STATUS + 2]
            .copy_from_slice(&VIRTIO_NET_S_LINK_UP.to_le_bytes());
        cfg[net_cfg::MAX_VIRTQUEUE_PAIRS..net_cfg::MAX_VIRTQUEUE_PAIRS + 2]
            .copy_from_slice(&self.max_queue_pairs.to_le_bytes());
        cfg[net_cfg::MTU..net_cfg::MTU + 2].copy_from_slice(&self.mtu.to_le_bytes());
        cfg
    }
}

impl VirtioOps for FakePort {
    fn read_dev_cfg(&self, offset: usize, buf: &mut [u8]) {
        self.record("read_dev_cfg");
        let cfg = self.config_bytes();
        buf.copy_from_slice(&cfg[offset..offset + buf.len()]);
    }

    fn write_dev_cfg(&self, _offset: usize, _src: &[u8]) {
        self.record("write_dev_cfg");
    }

    fn get_status(&self) -> DeviceStatusFlags {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, status: DeviceStatusFlags) {
        self.record("set_status");
        let mut current = self.status.lock().unwrap();
        if status.is_empty() {
            // Full reset also forgets the written driver features.
            *self.driver_features.lock().unwrap() = Features::empty();
        }
        *current = status;
    }

    fn get_features(&self) -> Features {
        self.record("get_features");
        self.host_features
    }

    fn set_features(&self, features: Features) {
        self.record("set_features");
        *self.driver_features.lock().unwrap() = features;
    }

    fn features_ok(&self) -> bool {
        self.record("features_ok");
        if self.reject_features {
            return false;
        }

        let mut status = self.status.lock().unwrap();
        *status |= DeviceStatusFlags::FEATURES_OK;
        if self.clear_features_ok {
            *status -= DeviceStatusFlags::FEATURES_OK;
        }
        true
    }

    fn get_isr(&self) -> IsrStatus {
        let mut isr = self.isr.lock().unwrap();
        std::mem::replace(&mut *isr, IsrStatus::empty())
    }

    fn set_config_irq(&self, vector: u16) -> u16 {
        self.record("set_config_irq");
        if self.vectors_available {
            vector
        } else {
            MSI_NO_VECTOR
        }
    }

    fn set_queue_irq(&self, _queue: &Virtqueue, vector: u16) -> u16 {
        self.record("set_queue_irq");
        if self.vectors_available {
            vector
        } else {
            MSI_NO_VECTOR
        }
    }

    fn get_queue_num(&self, queue_id: u16) -> u16 {
        self.record("get_queue_num");
        if self.missing_queues.contains(&queue_id) {
            0
        } else {
            self.queue_depth
        }
    }

    fn setup_queue(&self, _queue: &Virtqueue) -> Result<(), Error> {
        self.record("setup_queue");
        Ok(())
    }

    fn del_queue(&self, _queue: &Virtqueue) {
        self.record("del_queue");
    }

    fn notify_queue(&self, _queue_id: u16) {
        self.record("notify_queue");
    }

    fn intr_detect(&self) -> MsixStatus {
        self.record("intr_detect");
        MsixStatus::Enabled
    }

    fn dev_close(&self) {
        self.record("dev_close");
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
