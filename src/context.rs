//! Backend-context arena (§9 Design Note: resolving the `Link` ↔ owner
//! cyclic reference). A [`Context`] owns the process-wide backend handle
//! (the "shared resource" in §5), the static quirk database, and a table of
//! live [`Link`]s. Callers hold a plain [`LinkId`] — not a pointer back into
//! the context — so there is no weak/cyclic reference to manage at all: the
//! arena is the only thing that owns a `Link` strongly.

use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::backend::{HotplugRegistration, UsbBackend};
use crate::config::UserOverrides;
use crate::dataset::DeviceInfo;
use crate::error::MtpError;
use crate::events::{EventSink, LoggingSink, SharedSink};
use crate::link::{Link, LinkEndpoints};
use crate::policy::{build_policy, DeviceIdentity, ProbedCapabilities, QuirkEntry};
use crate::probe::{enumerate_candidates, probe_interfaces};

/// The configuration value a claimed interface is left in (§4.3). Almost
/// every MTP/PTP device exposes exactly one configuration with value `1`;
/// picking it unconditionally avoids a dependency on `bNumConfigurations`
/// semantics the spec leaves unspecified.
const TARGET_CONFIGURATION: u8 = 1;

/// An opaque, `Copy` reference to a [`Link`] held by a [`Context`]'s arena.
/// Deliberately not a pointer: resolving it always goes back through the
/// `Context` that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkId(usize);

/// Owns the backend, the quirk database, and every [`Link`] attached
/// through it. One `Context` per process is the common case, matching a
/// single `rusb::Context`/libusb session (§5 "Shared resources").
pub struct Context<B: UsbBackend + 'static> {
    backend: Arc<B>,
    quirk_db: Vec<QuirkEntry>,
    events: SharedSink,
    links: Mutex<Vec<Option<Arc<Link<B>>>>>,
    _hotplug: Mutex<Option<Box<dyn HotplugRegistration>>>,
}

impl<B: UsbBackend + 'static> Context<B> {
    pub fn new(backend: Arc<B>, quirk_db: Vec<QuirkEntry>) -> Self {
        Self::with_event_sink(backend, quirk_db, Arc::new(LoggingSink))
    }

    pub fn with_event_sink(backend: Arc<B>, quirk_db: Vec<QuirkEntry>, events: SharedSink) -> Self {
        // Hotplug arrivals/departures aren't modeled as `Event` variants
        // (§6.6 only defines transaction/pump/policy events); logged only.
        let hotplug = backend
            .register_hotplug(Box::new(move |event| info!("hotplug: {event:?}")))
            .ok();
        Context {
            backend,
            quirk_db,
            events,
            links: Mutex::new(Vec::new()),
            _hotplug: Mutex::new(hotplug),
        }
    }

    /// Probes `device`, resolves its policy, claims the winning interface,
    /// and returns a [`LinkId`] for the resulting [`Link`] (§4.3 + §4.4
    /// composed end to end).
    pub fn attach(&self, device: &B::Device, overrides: &UserOverrides) -> Result<LinkId, MtpError> {
        let descriptor = self.backend.device_descriptor(device).map_err(MtpError::Transport)?;
        let config_bytes = self.backend.active_config_descriptor(device).map_err(MtpError::Transport)?;
        let handle = self.backend.open(device).map_err(MtpError::Transport)?;

        let candidates = enumerate_candidates(&config_bytes, |index| {
            self.backend.get_string_descriptor_ascii(&handle, index).ok()
        });
        if candidates.is_empty() {
            return Err(MtpError::NotSupported { message: "no PTP/MTP-capable interface found".into() });
        }

        let probed = probe_interfaces(&*self.backend, &handle, &candidates, TARGET_CONFIGURATION, 5_000, 100)
            .ok_or(MtpError::NotSupported { message: "no candidate interface responded to GetDeviceInfo".into() })?;
        let (candidate, device_info_bytes) = probed;
        let device_info_text = DeviceInfo::decode(&device_info_bytes)
            .ok()
            .map(|info| format!("{} {}", info.manufacturer, info.model));

        let identity = DeviceIdentity {
            vendor_id: u16::from_le_bytes(descriptor.idVendor),
            product_id: u16::from_le_bytes(descriptor.idProduct),
            bcd_device: u16::from_le_bytes(descriptor.bcdDevice),
            bus: self.backend.get_bus_number(device),
            address: self.backend.get_device_address(device),
            manufacturer: self.backend.get_string_descriptor_ascii(&handle, descriptor.iManufacturer).ok(),
            product: self.backend.get_string_descriptor_ascii(&handle, descriptor.iProduct).ok(),
            serial: self.backend.get_string_descriptor_ascii(&handle, descriptor.iSerialNumber).ok(),
        };

        let policy = build_policy(
            &identity,
            candidate.iface_class,
            candidate.iface_subclass,
            candidate.iface_protocol,
            &self.quirk_db,
            device_info_text.as_deref(),
            None,
            ProbedCapabilities { supports_events: candidate.event_in.is_some() },
            overrides,
        );
        self.events.emit(crate::events::Event::PolicyResolved { sources: (&policy.sources).into() });

        let endpoints = LinkEndpoints {
            bulk_in: candidate.bulk_in,
            bulk_out: candidate.bulk_out,
            bulk_out_max_packet_size: candidate.bulk_out_max_packet_size,
            event_in: candidate.event_in,
        };
        let link = Arc::new(Link::new(self.backend.clone(), handle, candidate.iface_num, endpoints, policy, self.events.clone()));

        let mut links = self.links.lock().unwrap();
        links.push(Some(link));
        Ok(LinkId(links.len() - 1))
    }

    /// Resolves a [`LinkId`] back to its [`Link`]. `None` once [`detach`]
    /// has been called for that id.
    pub fn link(&self, id: LinkId) -> Option<Arc<Link<B>>> {
        self.links.lock().unwrap().get(id.0).and_then(|slot| slot.clone())
    }

    /// Closes and forgets the `Link` behind `id`. Idempotent: `Link::close`
    /// itself is idempotent, and a second `detach` of the same id is a
    /// no-op.
    pub fn detach(&self, id: LinkId) {
        let mut links = self.links.lock().unwrap();
        if let Some(slot) = links.get_mut(id.0) {
            if let Some(link) = slot.take() {
                link.close();
            }
        } else {
            warn!("detach called with out-of-range link id");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockHandle, ScriptedRead};
    use crate::wire::HEADER_SIZE;

    fn ptp_config_descriptor() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[9, 4, 0, 0, 2, 0x06, 0x01, 0x01, 0]);
        buf.extend_from_slice(&[7, 5, 0x81, 2, 0x00, 0x02, 0]);
        buf.extend_from_slice(&[7, 5, 0x01, 2, 0x00, 0x02, 0]);
        buf
    }

    fn device_info_payload() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u16.to_le_bytes());
        buf.extend_from_slice(&6u32.to_le_bytes());
        buf.extend_from_slice(&100u16.to_le_bytes());
        buf.extend_from_slice(&crate::wire::encode_string(""));
        buf.extend_from_slice(&0u16.to_le_bytes());
        for _ in 0..5 {
            buf.extend_from_slice(&0u32.to_le_bytes());
        }
        buf.extend_from_slice(&crate::wire::encode_string("Google"));
        buf.extend_from_slice(&crate::wire::encode_string("Pixel 7"));
        buf.extend_from_slice(&crate::wire::encode_string("1.0"));
        buf.extend_from_slice(&crate::wire::encode_string("ABC123"));
        buf
    }

    #[test]
    fn attach_claims_best_candidate_and_returns_usable_link() {
        let backend = Arc::new(MockBackend::new());
        let handle = MockHandle::new(0x18d1, 0x4ee1, ptp_config_descriptor());
        backend.add_device(handle.clone());

        let data_payload = device_info_payload();
        let mut data_container = Vec::new();
        data_container.extend_from_slice(&((HEADER_SIZE + data_payload.len()) as u32).to_le_bytes());
        data_container.extend_from_slice(&2u16.to_le_bytes());
        data_container.extend_from_slice(&0x1001u16.to_le_bytes());
        data_container.extend_from_slice(&1u32.to_le_bytes());
        data_container.extend_from_slice(&data_payload);
        let mut response = Vec::new();
        response.extend_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        response.extend_from_slice(&3u16.to_le_bytes());
        response.extend_from_slice(&0x2001u16.to_le_bytes());
        response.extend_from_slice(&1u32.to_le_bytes());

        handle.queue_read(0x81, ScriptedRead::whole(&data_container));
        handle.queue_read(0x81, ScriptedRead::whole(&response));

        let context = Context::new(backend, Vec::new());
        let id = context.attach(&handle, &UserOverrides::default()).unwrap();
        let link = context.link(id).unwrap();
        assert!(link.device_policy().flags.supports_get_object_prop_list);

        context.detach(id);
        assert!(context.link(id).is_none());
    }
}
