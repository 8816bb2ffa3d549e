//! An in-memory [`UsbBackend`] for deterministic tests (Design Note in §9:
//! "tests inject a deterministic in-memory implementation"). Not behind a
//! feature flag: unlike the real `rusb` backend, this one has no external
//! dependency and is cheap to keep always available for the crate's own
//! test suite and for downstream crates' tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::backend::{BulkBuf, DeviceDescriptor, HotplugRegistration, SetupPacket, UsbBackend};
use crate::error::TransportError;

/// One scripted reply to a bulk-in read on a given endpoint: the bytes to
/// hand back, split into `chunk_size`-sized pieces across successive reads
/// so tests can exercise multi-read reassembly (§4.5 data-in phase).
#[derive(Debug, Clone)]
pub struct ScriptedRead {
    pub remaining: VecDeque<Vec<u8>>,
}

impl ScriptedRead {
    pub fn chunked(bytes: &[u8], chunk_size: usize) -> Self {
        let mut remaining = VecDeque::new();
        if bytes.is_empty() {
            remaining.push_back(Vec::new());
        } else {
            for chunk in bytes.chunks(chunk_size.max(1)) {
                remaining.push_back(chunk.to_vec());
            }
        }
        ScriptedRead { remaining }
    }

    pub fn whole(bytes: &[u8]) -> Self {
        Self::chunked(bytes, bytes.len().max(1))
    }
}

#[derive(Default)]
struct Inner {
    halted: std::collections::HashSet<u8>,
    reads: std::collections::HashMap<u8, VecDeque<ScriptedRead>>,
    writes: Vec<(u8, Vec<u8>)>,
    reset_count: u32,
    claimed: std::collections::HashSet<u8>,
    configuration: u8,
    /// If set, the next N bulk reads on any endpoint return `Timeout`.
    force_timeouts: u32,
    /// If set, `bulk_transfer` on this endpoint returns `Stall` once.
    stall_once: Option<u8>,
    device_status_word: u16,
}

/// A single mock device/handle pair. `UsbBackend::Device` and `::Handle`
/// are both this shared handle, mirroring `nusb::Device`'s
/// `Arc<platform::Device>`-wrapped backend pattern.
#[derive(Clone)]
pub struct MockHandle {
    inner: Arc<Mutex<Inner>>,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus: u8,
    pub address: u8,
    config_descriptor: Arc<Vec<u8>>,
}

impl MockHandle {
    pub fn new(vendor_id: u16, product_id: u16, config_descriptor: Vec<u8>) -> Self {
        MockHandle {
            inner: Arc::new(Mutex::new(Inner {
                configuration: 1,
                device_status_word: 0x2001,
                ..Default::default()
            })),
            vendor_id,
            product_id,
            bus: 1,
            address: 1,
            config_descriptor: Arc::new(config_descriptor),
        }
    }

    /// Queues bytes to be returned from future bulk-in reads on `endpoint`.
    pub fn queue_read(&self, endpoint: u8, scripted: ScriptedRead) {
        self.inner
            .lock()
            .unwrap()
            .reads
            .entry(endpoint)
            .or_default()
            .push_back(scripted);
    }

    /// Returns every `(endpoint, bytes)` pair written via bulk-out, in order.
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.inner.lock().unwrap().writes.clone()
    }

    pub fn is_halted(&self, endpoint: u8) -> bool {
        self.inner.lock().unwrap().halted.contains(&endpoint)
    }

    pub fn force_halt(&self, endpoint: u8) {
        self.inner.lock().unwrap().halted.insert(endpoint);
    }

    pub fn force_timeouts(&self, n: u32) {
        self.inner.lock().unwrap().force_timeouts = n;
    }

    pub fn stall_once(&self, endpoint: u8) {
        self.inner.lock().unwrap().stall_once = Some(endpoint);
    }

    pub fn reset_count(&self) -> u32 {
        self.inner.lock().unwrap().reset_count
    }

    pub fn set_device_status_word(&self, word: u16) {
        self.inner.lock().unwrap().device_status_word = word;
    }
}

/// The backend itself; holds the set of devices `list_devices` enumerates.
#[derive(Default, Clone)]
pub struct MockBackend {
    devices: Arc<Mutex<Vec<MockHandle>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, handle: MockHandle) {
        self.devices.lock().unwrap().push(handle);
    }
}

struct NoopHotplugRegistration;
impl HotplugRegistration for NoopHotplugRegistration {
    fn deregister(self: Box<Self>) {}
}

impl UsbBackend for MockBackend {
    type Device = MockHandle;
    type Handle = MockHandle;

    fn list_devices(&self) -> Result<Vec<Self::Device>, TransportError> {
        Ok(self.devices.lock().unwrap().clone())
    }

    fn device_descriptor(&self, device: &Self::Device) -> Result<DeviceDescriptor, TransportError> {
        Ok(DeviceDescriptor {
            bLength: 18,
            bDescriptorType: 1,
            bcdUSB: [0x00, 0x02],
            bDeviceClass: 0,
            bDeviceSubClass: 0,
            bDeviceProtocol: 0,
            bMaxPacketSize0: 64,
            idVendor: device.vendor_id.to_le_bytes(),
            idProduct: device.product_id.to_le_bytes(),
            bcdDevice: [0, 1],
            iManufacturer: 1,
            iProduct: 2,
            iSerialNumber: 3,
            bNumConfigurations: 1,
        })
    }

    fn active_config_descriptor(&self, device: &Self::Device) -> Result<Vec<u8>, TransportError> {
        Ok((*device.config_descriptor).clone())
    }

    fn get_bus_number(&self, device: &Self::Device) -> u8 {
        device.bus
    }

    fn get_device_address(&self, device: &Self::Device) -> u8 {
        device.address
    }

    fn open(&self, device: &Self::Device) -> Result<Self::Handle, TransportError> {
        Ok(device.clone())
    }

    fn close(&self, _handle: Self::Handle) {}

    fn claim_interface(&self, handle: &Self::Handle, iface: u8) -> Result<(), TransportError> {
        handle.inner.lock().unwrap().claimed.insert(iface);
        Ok(())
    }

    fn release_interface(&self, handle: &Self::Handle, iface: u8) -> Result<(), TransportError> {
        handle.inner.lock().unwrap().claimed.remove(&iface);
        Ok(())
    }

    fn set_interface_alt_setting(
        &self,
        _handle: &Self::Handle,
        _iface: u8,
        _alt: u8,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_configuration(&self, handle: &Self::Handle, config: u8) -> Result<(), TransportError> {
        handle.inner.lock().unwrap().configuration = config;
        Ok(())
    }

    fn get_configuration(&self, handle: &Self::Handle) -> Result<u8, TransportError> {
        Ok(handle.inner.lock().unwrap().configuration)
    }

    fn detach_kernel_driver(&self, _handle: &Self::Handle, _iface: u8) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_auto_detach_kernel_driver(
        &self,
        _handle: &Self::Handle,
        _enable: bool,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    fn clear_halt(&self, handle: &Self::Handle, endpoint: u8) -> Result<(), TransportError> {
        handle.inner.lock().unwrap().halted.remove(&endpoint);
        Ok(())
    }

    fn reset_device(&self, handle: &Self::Handle) -> Result<(), TransportError> {
        handle.inner.lock().unwrap().reset_count += 1;
        Ok(())
    }

    fn bulk_transfer(
        &self,
        handle: &Self::Handle,
        endpoint: u8,
        buf: BulkBuf<'_>,
        _timeout_ms: u32,
    ) -> Result<usize, TransportError> {
        let mut inner = handle.inner.lock().unwrap();
        if inner.halted.contains(&endpoint) {
            return Err(TransportError::Stall);
        }
        if inner.stall_once == Some(endpoint) {
            inner.stall_once = None;
            inner.halted.insert(endpoint);
            return Err(TransportError::Stall);
        }
        if inner.force_timeouts > 0 {
            inner.force_timeouts -= 1;
            return Err(TransportError::Timeout);
        }
        match buf {
            BulkBuf::Out(data) => {
                inner.writes.push((endpoint, data.to_vec()));
                Ok(data.len())
            }
            BulkBuf::In(dest) => {
                let queue = inner.reads.entry(endpoint).or_default();
                let Some(script) = queue.front_mut() else {
                    return Err(TransportError::Timeout);
                };
                let Some(chunk) = script.remaining.pop_front() else {
                    queue.pop_front();
                    return Err(TransportError::Timeout);
                };
                if script.remaining.is_empty() {
                    queue.pop_front();
                }
                let n = chunk.len().min(dest.len());
                dest[..n].copy_from_slice(&chunk[..n]);
                Ok(n)
            }
        }
    }

    fn control_transfer(
        &self,
        handle: &Self::Handle,
        setup: SetupPacket,
        data: Option<&mut [u8]>,
        _timeout_ms: u32,
    ) -> Result<usize, TransportError> {
        if setup.bRequest == crate::backend::GET_DEVICE_STATUS_REQUEST {
            let word = handle.inner.lock().unwrap().device_status_word;
            if let Some(buf) = data {
                if buf.len() >= 4 {
                    buf[2..4].copy_from_slice(&word.to_le_bytes());
                }
                return Ok(buf.len());
            }
        }
        Ok(0)
    }

    fn get_string_descriptor_ascii(
        &self,
        _handle: &Self::Handle,
        _index: u8,
    ) -> Result<String, TransportError> {
        Ok(String::new())
    }

    fn get_max_packet_size(&self, handle: &Self::Handle, endpoint: u8) -> Result<u16, TransportError> {
        for parsed in crate::backend::parse_configuration(&handle.config_descriptor) {
            for ep in &parsed.endpoints {
                if ep.bEndpointAddress == endpoint {
                    return Ok(u16::from_le_bytes(ep.wMaxPacketSize));
                }
            }
        }
        Err(TransportError::Io {
            message: format!("endpoint {endpoint:#04x} not found in mock configuration descriptor"),
        })
    }

    fn get_configuration_descriptor_by_index(
        &self,
        device: &Self::Device,
        _index: u8,
    ) -> Result<Vec<u8>, TransportError> {
        Ok((*device.config_descriptor).clone())
    }

    fn register_hotplug(
        &self,
        _callback: Box<dyn FnMut(crate::backend::HotplugEvent) + Send>,
    ) -> Result<Box<dyn HotplugRegistration>, TransportError> {
        Ok(Box::new(NoopHotplugRegistration))
    }
}
