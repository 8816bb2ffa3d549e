//! A real [`UsbBackend`] over the `rusb` crate, grounded directly on
//! `CUAir-rust-ptp`'s `Device<C: rusb::UsbContext>` and `a1ien-libptp`'s
//! `PtpCamera`. Feature-gated (`rusb-backend`) since the core itself must
//! stay backend-agnostic (§4.2).

use std::time::Duration;

use log::{debug, warn};
use rusb::UsbContext;

use crate::backend::{BulkBuf, DeviceDescriptor, SetupPacket, UsbBackend};
use crate::error::TransportError;

fn map_rusb_error(e: rusb::Error) -> TransportError {
    match e {
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::Busy => TransportError::Busy,
        rusb::Error::Access => TransportError::AccessDenied,
        rusb::Error::NoDevice | rusb::Error::NotFound => TransportError::NoDevice,
        rusb::Error::Pipe => TransportError::Stall,
        other => TransportError::Io {
            message: other.to_string(),
        },
    }
}

/// A real device/handle pair, wrapping `rusb`'s context-generic handle the
/// same way `CUAir-rust-ptp::Device<C>` does.
pub struct RusbHandle<T: UsbContext> {
    pub device: rusb::Device<T>,
    pub handle: std::sync::Mutex<rusb::DeviceHandle<T>>,
}

/// The backend itself. One instance per `rusb::Context`.
pub struct RusbBackend<T: UsbContext> {
    context: T,
}

impl<T: UsbContext> RusbBackend<T> {
    pub fn new(context: T) -> Self {
        RusbBackend { context }
    }
}

impl UsbBackend for RusbBackend<rusb::Context> {
    type Device = rusb::Device<rusb::Context>;
    type Handle = std::sync::Arc<RusbHandle<rusb::Context>>;

    fn list_devices(&self) -> Result<Vec<Self::Device>, TransportError> {
        self.context
            .devices()
            .map(|list| list.iter().collect())
            .map_err(map_rusb_error)
    }

    fn device_descriptor(&self, device: &Self::Device) -> Result<DeviceDescriptor, TransportError> {
        let d = device.device_descriptor().map_err(map_rusb_error)?;
        Ok(DeviceDescriptor {
            bLength: 18,
            bDescriptorType: 1,
            bcdUSB: d.usb_version().major().to_le_bytes(),
            bDeviceClass: d.class_code(),
            bDeviceSubClass: d.sub_class_code(),
            bDeviceProtocol: d.protocol_code(),
            bMaxPacketSize0: d.max_packet_size(),
            idVendor: d.vendor_id().to_le_bytes(),
            idProduct: d.product_id().to_le_bytes(),
            bcdDevice: d.device_version().major().to_le_bytes(),
            iManufacturer: d.manufacturer_string_index().unwrap_or(0),
            iProduct: d.product_string_index().unwrap_or(0),
            iSerialNumber: d.serial_number_string_index().unwrap_or(0),
            bNumConfigurations: d.num_configurations(),
        })
    }

    fn active_config_descriptor(&self, device: &Self::Device) -> Result<Vec<u8>, TransportError> {
        let cfg = device.active_config_descriptor().map_err(map_rusb_error)?;
        Ok(cfg.extra().to_vec())
    }

    fn get_bus_number(&self, device: &Self::Device) -> u8 {
        device.bus_number()
    }

    fn get_device_address(&self, device: &Self::Device) -> u8 {
        device.address()
    }

    fn open(&self, device: &Self::Device) -> Result<Self::Handle, TransportError> {
        let handle = device.open().map_err(map_rusb_error)?;
        Ok(std::sync::Arc::new(RusbHandle {
            device: device.clone(),
            handle: std::sync::Mutex::new(handle),
        }))
    }

    fn close(&self, _handle: Self::Handle) {
        // Dropping the Arc releases the rusb::DeviceHandle.
    }

    fn claim_interface(&self, handle: &Self::Handle, iface: u8) -> Result<(), TransportError> {
        handle
            .handle
            .lock()
            .unwrap()
            .claim_interface(iface)
            .map_err(map_rusb_error)
    }

    fn release_interface(&self, handle: &Self::Handle, iface: u8) -> Result<(), TransportError> {
        handle
            .handle
            .lock()
            .unwrap()
            .release_interface(iface)
            .map_err(map_rusb_error)
    }

    fn set_interface_alt_setting(
        &self,
        handle: &Self::Handle,
        iface: u8,
        alt: u8,
    ) -> Result<(), TransportError> {
        handle
            .handle
            .lock()
            .unwrap()
            .set_alternate_setting(iface, alt)
            .map_err(map_rusb_error)
    }

    fn set_configuration(&self, handle: &Self::Handle, config: u8) -> Result<(), TransportError> {
        handle
            .handle
            .lock()
            .unwrap()
            .set_active_configuration(config)
            .map_err(map_rusb_error)
    }

    fn get_configuration(&self, handle: &Self::Handle) -> Result<u8, TransportError> {
        handle
            .handle
            .lock()
            .unwrap()
            .active_configuration()
            .map_err(map_rusb_error)
    }

    fn detach_kernel_driver(&self, handle: &Self::Handle, iface: u8) -> Result<(), TransportError> {
        match handle.handle.lock().unwrap().detach_kernel_driver(iface) {
            Ok(()) => Ok(()),
            Err(rusb::Error::NotFound) => Ok(()),
            Err(e) => {
                warn!("detach_kernel_driver({iface}) failed: {e}");
                Err(map_rusb_error(e))
            }
        }
    }

    fn set_auto_detach_kernel_driver(
        &self,
        handle: &Self::Handle,
        enable: bool,
    ) -> Result<(), TransportError> {
        handle
            .handle
            .lock()
            .unwrap()
            .set_auto_detach_kernel_driver(enable)
            .map_err(map_rusb_error)
    }

    fn clear_halt(&self, handle: &Self::Handle, endpoint: u8) -> Result<(), TransportError> {
        handle
            .handle
            .lock()
            .unwrap()
            .clear_halt(endpoint)
            .map_err(map_rusb_error)
    }

    fn reset_device(&self, handle: &Self::Handle) -> Result<(), TransportError> {
        handle.handle.lock().unwrap().reset().map_err(map_rusb_error)
    }

    fn bulk_transfer(
        &self,
        handle: &Self::Handle,
        endpoint: u8,
        buf: BulkBuf<'_>,
        timeout_ms: u32,
    ) -> Result<usize, TransportError> {
        let timeout = Duration::from_millis(timeout_ms as u64);
        let guard = handle.handle.lock().unwrap();
        match buf {
            BulkBuf::Out(data) => {
                debug!("bulk write ep={endpoint:#04x} len={}", data.len());
                guard.write_bulk(endpoint, data, timeout).map_err(map_rusb_error)
            }
            BulkBuf::In(dest) => guard.read_bulk(endpoint, dest, timeout).map_err(map_rusb_error),
        }
    }

    fn control_transfer(
        &self,
        handle: &Self::Handle,
        setup: SetupPacket,
        data: Option<&mut [u8]>,
        timeout_ms: u32,
    ) -> Result<usize, TransportError> {
        let timeout = Duration::from_millis(timeout_ms as u64);
        let guard = handle.handle.lock().unwrap();
        let buf = data.map(|d| &mut d[..]).unwrap_or(&mut []);
        if setup.bmRequestType & 0x80 != 0 {
            guard
                .read_control(setup.bmRequestType, setup.bRequest, setup.wValue, setup.wIndex, buf, timeout)
                .map_err(map_rusb_error)
        } else {
            guard
                .write_control(setup.bmRequestType, setup.bRequest, setup.wValue, setup.wIndex, buf, timeout)
                .map_err(map_rusb_error)
        }
    }

    fn get_string_descriptor_ascii(
        &self,
        handle: &Self::Handle,
        index: u8,
    ) -> Result<String, TransportError> {
        handle
            .handle
            .lock()
            .unwrap()
            .read_string_descriptor_ascii(index)
            .map_err(map_rusb_error)
    }

    fn get_max_packet_size(&self, handle: &Self::Handle, endpoint: u8) -> Result<u16, TransportError> {
        let config = handle.device.active_config_descriptor().map_err(map_rusb_error)?;
        for interface in config.interfaces() {
            for descriptor in interface.descriptors() {
                for ep in descriptor.endpoint_descriptors() {
                    if ep.address() == endpoint {
                        return Ok(ep.max_packet_size());
                    }
                }
            }
        }
        Err(TransportError::Io {
            message: format!("endpoint {endpoint:#04x} not found in active configuration"),
        })
    }

    fn get_configuration_descriptor_by_index(
        &self,
        device: &Self::Device,
        index: u8,
    ) -> Result<Vec<u8>, TransportError> {
        let cfg = device.config_descriptor(index).map_err(map_rusb_error)?;
        Ok(cfg.extra().to_vec())
    }
}
