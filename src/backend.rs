//! The minimal USB host capability the core requires (C2, §4.2).
//!
//! `UsbBackend` is the seam between this crate and whatever host USB stack
//! is available (libusb/rusb, a platform-native stack, or — in tests — a
//! deterministic in-memory device). The core never assumes a concrete
//! backend; [`mock`] supplies the one tests inject (Design Note in §9:
//! "tests inject a deterministic in-memory implementation").

pub mod mock;
#[cfg(feature = "rusb-backend")]
pub mod rusb_backend;

use crate::error::TransportError;

/// USB descriptor structs, bit-exact with USB 2.0 tables 9-8/9-10/9-12/9-13,
/// used by the probe (C3) to score interface candidates. Grounded on the
/// same `#[repr(C)]` + `bytemuck::Pod` pattern used for descriptor parsing
/// elsewhere in the ecosystem.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[allow(non_snake_case)]
pub struct DeviceDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bcdUSB: [u8; 2],
    pub bDeviceClass: u8,
    pub bDeviceSubClass: u8,
    pub bDeviceProtocol: u8,
    pub bMaxPacketSize0: u8,
    pub idVendor: [u8; 2],
    pub idProduct: [u8; 2],
    pub bcdDevice: [u8; 2],
    pub iManufacturer: u8,
    pub iProduct: u8,
    pub iSerialNumber: u8,
    pub bNumConfigurations: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[allow(non_snake_case)]
pub struct ConfigurationDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub wTotalLength: [u8; 2],
    pub bNumInterfaces: u8,
    pub bConfigurationValue: u8,
    pub iConfiguration: u8,
    pub bmAttributes: u8,
    pub bMaxPower: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[allow(non_snake_case)]
pub struct InterfaceDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bInterfaceNumber: u8,
    pub bAlternateSetting: u8,
    pub bNumEndpoints: u8,
    pub bInterfaceClass: u8,
    pub bInterfaceSubClass: u8,
    pub bInterfaceProtocol: u8,
    pub iInterface: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[allow(non_snake_case)]
pub struct EndpointDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bEndpointAddress: u8,
    pub bmAttributes: u8,
    pub wMaxPacketSize: [u8; 2],
    pub bInterval: u8,
}

pub const CONFIGURATION_DESCRIPTOR_TYPE: u8 = 2;
pub const INTERFACE_DESCRIPTOR_TYPE: u8 = 4;
pub const ENDPOINT_DESCRIPTOR_TYPE: u8 = 5;

/// Endpoint-transfer direction bit (USB 2.0 table 9-13): set for IN.
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// A parsed interface found while walking a configuration descriptor: the
/// interface/alt-setting pair plus every endpoint declared under it.
#[derive(Debug, Clone, Default)]
pub struct ParsedInterface {
    pub interface: Option<InterfaceDescriptor>,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Walks a raw configuration descriptor (as returned by
/// [`UsbBackend::active_config_descriptor`]) and groups endpoints under
/// their owning interface/alt-setting. Never panics on truncated or
/// malformed descriptor data — unrecognised or short entries are skipped.
pub fn parse_configuration(buf: &[u8]) -> Vec<ParsedInterface> {
    let mut out = Vec::new();
    let mut current: Option<ParsedInterface> = None;
    let mut index = 0usize;

    while buf.len() > index + 2 {
        let dlen = buf[index] as usize;
        let dtype = buf[index + 1];
        if dlen < 2 || buf.len() < index + dlen {
            break;
        }
        let body = &buf[index..index + dlen];
        match dtype {
            INTERFACE_DESCRIPTOR_TYPE => {
                if let Some(prev) = current.take() {
                    out.push(prev);
                }
                let parsed: Option<&InterfaceDescriptor> = bytemuck::try_from_bytes(body).ok();
                current = Some(ParsedInterface {
                    interface: parsed.copied(),
                    endpoints: Vec::new(),
                });
            }
            ENDPOINT_DESCRIPTOR_TYPE => {
                if let Some(ep) = bytemuck::try_from_bytes::<EndpointDescriptor>(body)
                    .ok()
                    .copied()
                {
                    if let Some(cur) = current.as_mut() {
                        cur.endpoints.push(ep);
                    }
                }
            }
            _ => {}
        }
        index += dlen;
    }
    if let Some(prev) = current.take() {
        out.push(prev);
    }
    out
}

/// Direction-tagged buffer for [`UsbBackend::bulk_transfer`], grounded on
/// `cotton-usb-host`'s `DataPhase`.
pub enum BulkBuf<'a> {
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

/// A USB control-transfer setup packet, bit-exact with USB 2.0 table 9-2.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[allow(non_snake_case)]
pub struct SetupPacket {
    pub bmRequestType: u8,
    pub bRequest: u8,
    pub wValue: u16,
    pub wIndex: u16,
    pub wLength: u16,
}

pub mod request_type {
    pub const DEVICE_TO_HOST: u8 = 0x80;
    pub const HOST_TO_DEVICE: u8 = 0x00;
    pub const CLASS: u8 = 0x20;
    pub const RECIPIENT_INTERFACE: u8 = 0x01;
}

/// `GetDeviceStatus` class-specific request (§6.3).
pub const GET_DEVICE_STATUS_REQUEST: u8 = 0x67;

/// A thin summary of a device's bus-level identity, used for hotplug events
/// so callers don't need the backend's associated `Device` type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus: u8,
    pub address: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    Arrived(DeviceSummary),
    Left(DeviceSummary),
}

/// An opaque handle returned by [`UsbBackend::register_hotplug`]; dropping
/// or explicitly deregistering it stops delivery.
pub trait HotplugRegistration: Send {
    fn deregister(self: Box<Self>);
}

/// The capability contract a host USB stack must satisfy (§4.2). All
/// fallible operations return [`TransportError`]; the core never inspects
/// backend-specific error detail beyond what's mapped here.
pub trait UsbBackend: Send + Sync {
    /// Opaque device reference, cheap to clone (e.g. an `Arc` or bus/address pair).
    type Device: Clone + Send + Sync;
    /// Opaque open-handle reference. `Clone` so a cancelled bulk transfer's
    /// worker thread (§9 Design Note "Cancellation of FFI calls") can hold
    /// its own reference independent of the caller.
    type Handle: Send + Sync + Clone;

    fn list_devices(&self) -> Result<Vec<Self::Device>, TransportError>;

    fn device_descriptor(&self, device: &Self::Device) -> Result<DeviceDescriptor, TransportError>;
    fn active_config_descriptor(&self, device: &Self::Device) -> Result<Vec<u8>, TransportError>;
    fn get_bus_number(&self, device: &Self::Device) -> u8;
    fn get_device_address(&self, device: &Self::Device) -> u8;

    fn open(&self, device: &Self::Device) -> Result<Self::Handle, TransportError>;
    fn close(&self, handle: Self::Handle);

    fn claim_interface(&self, handle: &Self::Handle, iface: u8) -> Result<(), TransportError>;
    fn release_interface(&self, handle: &Self::Handle, iface: u8) -> Result<(), TransportError>;
    fn set_interface_alt_setting(
        &self,
        handle: &Self::Handle,
        iface: u8,
        alt: u8,
    ) -> Result<(), TransportError>;

    fn set_configuration(&self, handle: &Self::Handle, config: u8) -> Result<(), TransportError>;
    fn get_configuration(&self, handle: &Self::Handle) -> Result<u8, TransportError>;

    /// Detaches a kernel driver from `iface`. Backends must treat "no
    /// driver attached" as success (§4.3 step 2: "ignore NOT_FOUND").
    fn detach_kernel_driver(&self, handle: &Self::Handle, iface: u8) -> Result<(), TransportError>;
    fn set_auto_detach_kernel_driver(
        &self,
        handle: &Self::Handle,
        enable: bool,
    ) -> Result<(), TransportError>;

    fn clear_halt(&self, handle: &Self::Handle, endpoint: u8) -> Result<(), TransportError>;
    fn reset_device(&self, handle: &Self::Handle) -> Result<(), TransportError>;

    /// The only transport primitive the engine uses for data exchange.
    /// May return `Ok(n)` with `n < buf.len()`; the engine loops to
    /// complete the request (§4.2).
    fn bulk_transfer(
        &self,
        handle: &Self::Handle,
        endpoint: u8,
        buf: BulkBuf<'_>,
        timeout_ms: u32,
    ) -> Result<usize, TransportError>;

    fn control_transfer(
        &self,
        handle: &Self::Handle,
        setup: SetupPacket,
        data: Option<&mut [u8]>,
        timeout_ms: u32,
    ) -> Result<usize, TransportError>;

    fn get_string_descriptor_ascii(
        &self,
        handle: &Self::Handle,
        index: u8,
    ) -> Result<String, TransportError>;

    fn get_max_packet_size(&self, handle: &Self::Handle, endpoint: u8) -> Result<u16, TransportError>;

    fn get_configuration_descriptor_by_index(
        &self,
        device: &Self::Device,
        index: u8,
    ) -> Result<Vec<u8>, TransportError>;

    /// Registers for hot-plug notifications. The default implementation
    /// reports the capability as unsupported; backends for platforms
    /// without libusb-style hotplug (or the mock) can leave it unimplemented.
    fn register_hotplug(
        &self,
        _callback: Box<dyn FnMut(HotplugEvent) + Send>,
    ) -> Result<Box<dyn HotplugRegistration>, TransportError> {
        Err(TransportError::Io {
            message: "hotplug not supported by this backend".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_configuration_groups_endpoints_under_interface() {
        let mut buf = Vec::new();
        // interface descriptor, 9 bytes
        buf.extend_from_slice(&[9, INTERFACE_DESCRIPTOR_TYPE, 0, 0, 2, 0x06, 0x01, 0x01, 0]);
        // two endpoint descriptors, 7 bytes each
        buf.extend_from_slice(&[7, ENDPOINT_DESCRIPTOR_TYPE, 0x81, 2, 0x00, 0x02, 0]);
        buf.extend_from_slice(&[7, ENDPOINT_DESCRIPTOR_TYPE, 0x01, 2, 0x00, 0x02, 0]);

        let parsed = parse_configuration(&buf);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].endpoints.len(), 2);
        assert_eq!(parsed[0].interface.unwrap().bInterfaceClass, 0x06);
    }

    #[test]
    fn parse_configuration_never_panics_on_garbage() {
        for len in 0..40 {
            let buf = vec![0xAAu8; len];
            let _ = parse_configuration(&buf);
        }
        // A descriptor claiming to be longer than the buffer must stop, not overread.
        let buf = [0xFFu8, INTERFACE_DESCRIPTOR_TYPE];
        assert!(parse_configuration(&buf).is_empty());
    }
}
