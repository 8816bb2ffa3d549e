//! The link object (C6, §4.6): the caller-facing handle to one claimed MTP
//! interface. Owns the serialization mutex, the transaction-id counter, and
//! the optional event pump; exposes every high-level operation the
//! transaction engine (C5) and fallback ladder (C7) compose underneath.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::backend::{request_type, SetupPacket, UsbBackend, GET_DEVICE_STATUS_REQUEST};
use crate::dataset::{decode_object_handles, decode_prop_list, decode_storage_ids, ObjectInfo, PropListEntry};
use crate::engine::{self, CancelToken, DataPhase, Endpoints, ExecuteOutcome, PendingBulkJoin, PtpResponseResult};
use crate::error::{map_response_code, response_code, CodecError, MtpError, TransportError};
use crate::events::{Event, SharedSink, TransactionOutcome};
use crate::policy::DevicePolicy;

const OP_GET_DEVICE_INFO: u16 = 0x1001;
const OP_OPEN_SESSION: u16 = 0x1002;
const OP_CLOSE_SESSION: u16 = 0x1003;
const OP_GET_STORAGE_IDS: u16 = 0x1004;
const OP_GET_STORAGE_INFO: u16 = 0x1005;
const OP_GET_OBJECT_HANDLES: u16 = 0x1007;
const OP_GET_OBJECT_INFO: u16 = 0x1008;
const OP_GET_OBJECT: u16 = 0x1009;
const OP_DELETE_OBJECT: u16 = 0x100B;
const OP_SEND_OBJECT_INFO: u16 = 0x100C;
const OP_SEND_OBJECT: u16 = 0x100D;
const OP_GET_OBJECT_PROP_LIST: u16 = 0x9805;
/// Vendor (Android MTP) extension for 64-bit partial reads, per §4.6.
const OP_GET_PARTIAL_OBJECT_64: u16 = 0x95C1;

/// Property codes used to pull filenames/parents/format out of a
/// `GetObjectPropList` response (§4.6 enumeration ladder, rung 1/2).
mod object_prop {
    pub const OBJECT_FORMAT: u16 = 0xDC02;
    pub const PARENT_OBJECT: u16 = 0xDC0B;
    pub const OBJECT_FILE_NAME: u16 = 0xDC07;
}

/// The bulk/event endpoint triple a claimed interface exposes.
#[derive(Debug, Clone, Copy)]
pub struct LinkEndpoints {
    pub bulk_in: u8,
    pub bulk_out: u8,
    /// `wMaxPacketSize` of `bulk_out`, resolved by the probe at claim time
    /// (§4.3) and handed to the engine for ZLP decisions (§4.5 rule 2).
    pub bulk_out_max_packet_size: u16,
    pub event_in: Option<u8>,
}

impl LinkEndpoints {
    fn bulk(&self) -> Endpoints {
        Endpoints {
            bulk_in: self.bulk_in,
            bulk_out: self.bulk_out,
            bulk_out_max_packet_size: self.bulk_out_max_packet_size,
        }
    }
}

/// One summarized directory entry, assembled from whichever enumeration
/// rung succeeded (§4.6 `enumerate`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub handle: u32,
    pub parent: u32,
    pub object_format: u16,
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Open,
    Closing,
    Closed,
}

/// Background interrupt-in reader for the event endpoint (§6.6 "event
/// pump"). Delivers raw event-container bytes into a bounded, lossy-newest
/// buffer the caller drains with [`Link::poll_events`].
struct EventPump {
    stop: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

const EVENT_BUFFER_CAPACITY: usize = 16;

fn spawn_event_pump<B: UsbBackend + 'static>(
    backend: Arc<B>,
    handle: B::Handle,
    endpoint: u8,
    buffer: Arc<Mutex<VecDeque<Vec<u8>>>>,
    events: SharedSink,
) -> EventPump {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();
    let join = std::thread::spawn(move || {
        let mut scratch = [0u8; 64];
        while !thread_stop.load(Ordering::SeqCst) {
            match backend.bulk_transfer(&handle, endpoint, crate::backend::BulkBuf::In(&mut scratch), 1_000) {
                Ok(0) => continue,
                Ok(n) => {
                    let mut buf = buffer.lock().unwrap();
                    if buf.len() >= EVENT_BUFFER_CAPACITY {
                        buf.pop_front();
                    }
                    buf.push_back(scratch[..n].to_vec());
                    events.emit(Event::PumpEvent { bytes: n });
                }
                Err(crate::error::TransportError::Timeout) => continue,
                Err(e) => {
                    warn!("event pump stopping: {e}");
                    events.emit(Event::PumpStopped);
                    break;
                }
            }
        }
    });
    EventPump { stop, join: Some(join) }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Monotonic transaction-id allocator, wrapping `0xFFFFFFFF` back to `1`
/// (never `0`, which is reserved for the `OpenSession` exception) (§4.1).
struct TxidCounter(AtomicU32);

impl TxidCounter {
    fn new() -> Self {
        TxidCounter(AtomicU32::new(1))
    }

    fn next(&self) -> u32 {
        loop {
            let cur = self.0.load(Ordering::SeqCst);
            let after = if cur == u32::MAX { 1 } else { cur + 1 };
            if self
                .0
                .compare_exchange(cur, after, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return cur;
            }
        }
    }
}

/// The caller-facing handle to one claimed MTP interface (§3 `Link`, §4.6).
/// Not `Clone`; share it behind an `Arc` if multiple callers need it — every
/// operation already serializes internally.
pub struct Link<B: UsbBackend + 'static> {
    backend: Arc<B>,
    handle: B::Handle,
    iface: u8,
    endpoints: LinkEndpoints,
    policy: DevicePolicy,
    state: Mutex<LinkState>,
    txid: TxidCounter,
    /// Holds the whole transaction lock: only one transaction in flight at
    /// a time, callers served FIFO (§4.6 "serialization").
    serialize: Mutex<()>,
    /// Set by a cancelled `execute()`; the *next* call blocks here until the
    /// abandoned worker rejoins and the recovery drain completes (§9 Design
    /// Note: "not reusable until the worker has rejoined").
    pending_worker: Mutex<Option<PendingBulkJoin<B>>>,
    cancel: Mutex<CancelToken>,
    events: SharedSink,
    prop_list_disabled: AtomicBool,
    event_buffer: Arc<Mutex<VecDeque<Vec<u8>>>>,
    event_pump: Mutex<Option<EventPump>>,
}

impl<B: UsbBackend + 'static> Link<B> {
    /// Constructs a `Link` over an already-claimed interface (normally
    /// called by [`crate::context`] once probe + policy resolution finish).
    pub fn new(
        backend: Arc<B>,
        handle: B::Handle,
        iface: u8,
        endpoints: LinkEndpoints,
        policy: DevicePolicy,
        events: SharedSink,
    ) -> Self {
        let event_buffer = Arc::new(Mutex::new(VecDeque::with_capacity(EVENT_BUFFER_CAPACITY)));
        let event_pump = if !policy.flags.disable_event_pump {
            endpoints.event_in.map(|ep| {
                spawn_event_pump(backend.clone(), handle.clone(), ep, event_buffer.clone(), events.clone())
            })
        } else {
            None
        };
        let prop_list_disabled = !policy_supports_prop_list(&policy);
        Link {
            backend,
            handle,
            iface,
            endpoints,
            policy,
            state: Mutex::new(LinkState::Open),
            txid: TxidCounter::new(),
            serialize: Mutex::new(()),
            pending_worker: Mutex::new(None),
            cancel: Mutex::new(CancelToken::new()),
            events,
            prop_list_disabled: AtomicBool::new(prop_list_disabled),
            event_buffer,
            event_pump: Mutex::new(event_pump),
        }
    }

    pub fn device_policy(&self) -> &DevicePolicy {
        &self.policy
    }

    /// Drains whatever event-container bytes the pump has buffered since
    /// the last call. Never blocks.
    pub fn poll_events(&self) -> Vec<Vec<u8>> {
        self.event_buffer.lock().unwrap().drain(..).collect()
    }

    /// Requests cancellation of whatever transaction is currently in
    /// flight. A no-op if nothing is running; idempotent.
    pub fn cancel_current(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    /// Idempotent close (§8 property 9): the first call tears everything
    /// down, later calls are no-ops.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != LinkState::Open {
            return;
        }
        *state = LinkState::Closing;
        drop(state);

        let _guard = self.serialize.lock().unwrap();
        self.join_pending_worker();
        *self.event_pump.lock().unwrap() = None; // Drop joins the pump thread.
        let _ = self.backend.release_interface(&self.handle, self.iface);
        *self.state.lock().unwrap() = LinkState::Closed;
    }

    fn join_pending_worker(&self) {
        if let Some(pending) = self.pending_worker.lock().unwrap().take() {
            pending.join_and_recover(self.endpoints.bulk());
        }
    }

    /// §4.6 "Lifecycle invariants": `Closing` rejects new operations with
    /// `Cancelled`, `Closed` rejects with `NoDevice`.
    fn ensure_open(&self) -> Result<(), MtpError> {
        match *self.state.lock().unwrap() {
            LinkState::Open => Ok(()),
            LinkState::Closing => Err(MtpError::Cancelled),
            LinkState::Closed => Err(MtpError::Transport(TransportError::NoDevice)),
        }
    }

    /// Runs one transaction and returns its raw response (no response-code
    /// mapping) — callers decide which codes mean success for their op
    /// (§4.6's `OpenSession` idempotency being the motivating example).
    fn run(&self, opcode: u16, txid: u32, params: &[u32], data_phase: DataPhase) -> Result<PtpResponseResult, MtpError> {
        self.ensure_open()?;
        let _guard = self.serialize.lock().unwrap();
        self.join_pending_worker();

        let cancel = CancelToken::new();
        *self.cancel.lock().unwrap() = cancel.clone();

        self.events.emit(Event::TransactionBegin { opcode, txid });
        let started = std::time::Instant::now();

        let outcome = engine::execute(
            &self.backend,
            &self.handle,
            self.endpoints.bulk(),
            &self.policy.tuning,
            opcode,
            txid,
            params,
            data_phase,
            &cancel,
        );

        match outcome {
            ExecuteOutcome::Done(result, counters) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.events.emit(Event::TransactionEnd {
                    txid,
                    outcome: if result.is_ok() { TransactionOutcome::Ok } else { TransactionOutcome::Error },
                    duration_ms,
                    bytes_in: counters.bytes_in,
                    bytes_out: counters.bytes_out,
                });
                result
            }
            ExecuteOutcome::Cancelled(pending) => {
                *self.pending_worker.lock().unwrap() = Some(pending);
                self.events.emit(Event::TransactionEnd {
                    txid,
                    outcome: TransactionOutcome::Cancelled,
                    duration_ms: started.elapsed().as_millis() as u64,
                    bytes_in: 0,
                    bytes_out: 0,
                });
                Err(MtpError::Cancelled)
            }
        }
    }

    /// `run` plus standard response-code mapping: anything other than
    /// `OK` becomes the corresponding [`MtpError`] (§7).
    fn call(&self, opcode: u16, params: &[u32], data_phase: DataPhase) -> Result<PtpResponseResult, MtpError> {
        let txid = self.txid.next();
        let resp = self.run(opcode, txid, params, data_phase)?;
        match map_response_code(resp.code) {
            None => Ok(resp),
            Some(err) => Err(err),
        }
    }

    fn call_collecting(&self, opcode: u16, params: &[u32]) -> Result<Vec<u8>, MtpError> {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = collected.clone();
        self.call(
            opcode,
            params,
            DataPhase::In {
                consumer: Box::new(move |chunk| sink.lock().unwrap().extend_from_slice(chunk)),
            },
        )?;
        Ok(Arc::try_unwrap(collected).map(|m| m.into_inner().unwrap()).unwrap_or_default())
    }

    /// Opens a session (§4.6). Treats response code `0x201E` ("session
    /// already open") as success, matching real-device idempotency (§7).
    pub fn open_session(&self, session_id: u32) -> Result<(), MtpError> {
        let resp = self.run(OP_OPEN_SESSION, 0, &[session_id], DataPhase::None)?;
        match resp.code {
            response_code::OK | response_code::SESSION_ALREADY_OPEN => Ok(()),
            other => Err(map_response_code(other).unwrap_or(MtpError::ProtocolError { code: other, message: None })),
        }
    }

    pub fn close_session(&self) -> Result<(), MtpError> {
        self.call(OP_CLOSE_SESSION, &[], DataPhase::None).map(|_| ())
    }

    pub fn get_device_info(&self) -> Result<DeviceInfo, MtpError> {
        let bytes = self.call_collecting(OP_GET_DEVICE_INFO, &[])?;
        Ok(DeviceInfo::decode(&bytes)?)
    }

    pub fn get_storage_ids(&self) -> Result<Vec<u32>, MtpError> {
        let bytes = self.call_collecting(OP_GET_STORAGE_IDS, &[])?;
        Ok(decode_storage_ids(&bytes)?)
    }

    pub fn get_storage_info(&self, storage_id: u32) -> Result<StorageInfo, MtpError> {
        let bytes = self.call_collecting(OP_GET_STORAGE_INFO, &[storage_id])?;
        Ok(StorageInfo::decode(&bytes)?)
    }

    pub fn get_object_handles(&self, storage_id: u32, parent: u32) -> Result<Vec<u32>, MtpError> {
        let bytes = self.call_collecting(OP_GET_OBJECT_HANDLES, &[storage_id, 0, parent])?;
        Ok(decode_object_handles(&bytes)?)
    }

    pub fn get_object_info(&self, handle: u32) -> Result<ObjectInfo, MtpError> {
        let bytes = self.call_collecting(OP_GET_OBJECT_INFO, &[handle])?;
        Ok(ObjectInfo::decode(&bytes)?)
    }

    /// Lists the children of `parent` in `storage_id`, trying
    /// `GetObjectPropList` (5-param, then 3-param) before falling back to
    /// `GetObjectHandles` + per-handle `GetObjectInfo` (§4.6, §4.7).
    /// `0x2005`/`0x201D` on a prop-list rung sticks for the rest of the
    /// session (§4.4 "learned" style short-circuit, not persisted).
    pub fn enumerate(&self, storage_id: u32, parent: u32) -> Result<Vec<ObjectSummary>, crate::ladder::AllFailed> {
        let mut rungs = Vec::new();
        if !self.prop_list_disabled.load(Ordering::SeqCst) {
            rungs.push(crate::ladder::Rung::new("proplist_5param", || {
                self.enumerate_via_prop_list(storage_id, parent, true)
            }));
            rungs.push(crate::ladder::Rung::new("proplist_3param", || {
                self.enumerate_via_prop_list(storage_id, parent, false)
            }));
        }
        rungs.push(crate::ladder::Rung::new("handles_then_info", || {
            self.enumerate_via_handles(storage_id, parent)
        }));
        let result = crate::ladder::execute_ladder(rungs);
        if let Err(failed) = &result {
            for (name, err) in &failed.attempts {
                if name.starts_with("proplist") && matches!(err, MtpError::NotSupported { .. }) {
                    self.prop_list_disabled.store(true, Ordering::SeqCst);
                }
                self.events.emit(Event::FallbackRungFailed { name: *name, error: err.to_string() });
            }
        }
        result
    }

    fn enumerate_via_prop_list(&self, storage_id: u32, parent: u32, five_param: bool) -> Result<Vec<ObjectSummary>, MtpError> {
        const ALL_PROPS: u32 = 0xFFFF_FFFF;
        let params: &[u32] = if five_param {
            &[storage_id, ALL_PROPS, 0, 0, 0]
        } else {
            &[storage_id, ALL_PROPS, 0]
        };
        let bytes = self.call_collecting(OP_GET_OBJECT_PROP_LIST, params)?;
        let entries = decode_prop_list(&bytes)?;
        Ok(summarize_prop_list(entries, parent))
    }

    fn enumerate_via_handles(&self, storage_id: u32, parent: u32) -> Result<Vec<ObjectSummary>, MtpError> {
        let handles = self.get_object_handles(storage_id, parent)?;
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let info = self.get_object_info(handle)?;
            out.push(ObjectSummary {
                handle,
                parent: info.parent_object,
                object_format: info.object_format,
                filename: info.filename,
            });
        }
        Ok(out)
    }

    /// Streams an object's full contents to `sink`, one bulk chunk at a
    /// time (§4.6 `get_object`).
    pub fn get_object(&self, handle: u32, mut sink: impl FnMut(&[u8])) -> Result<(), MtpError> {
        self.call(
            OP_GET_OBJECT,
            &[handle],
            DataPhase::In { consumer: Box::new(move |chunk| sink(chunk)) },
        )
        .map(|_| ())
    }

    /// Reads `length` bytes starting at `offset` via the 64-bit partial-read
    /// extension (§4.6).
    pub fn get_partial_object_64(&self, handle: u32, offset: u64, length: u32, mut sink: impl FnMut(&[u8])) -> Result<u32, MtpError> {
        let params = [handle, offset as u32, (offset >> 32) as u32, length];
        let resp = self.call(
            OP_GET_PARTIAL_OBJECT_64,
            &params,
            DataPhase::In { consumer: Box::new(move |chunk| sink(chunk)) },
        )?;
        Ok(resp.params.first().copied().unwrap_or(0))
    }

    /// Announces a new object before `send_object` (§4.6). Returns the
    /// device-assigned `(storage_id, parent, handle)`.
    pub fn send_object_info(&self, storage_id: u32, parent: u32, info: &ObjectInfo) -> Result<(u32, u32, u32), MtpError> {
        let payload = info.encode();
        let resp = self.call(
            OP_SEND_OBJECT_INFO,
            &[storage_id, parent],
            DataPhase::Out {
                total_length: (crate::wire::HEADER_SIZE + payload.len()) as u32,
                producer: single_shot_producer(payload),
            },
        )?;
        let mut p = resp.params.into_iter();
        Ok((p.next().unwrap_or(storage_id), p.next().unwrap_or(parent), p.next().unwrap_or(0)))
    }

    /// Sends object bytes following a prior `send_object_info` (§4.6).
    /// `total_length` must match what was declared there.
    pub fn send_object(&self, total_length: u32, producer: impl FnMut(&mut [u8]) -> usize + 'static) -> Result<(), MtpError> {
        self.call(
            OP_SEND_OBJECT,
            &[],
            DataPhase::Out { total_length, producer: Box::new(producer) },
        )
        .map(|_| ())
    }

    pub fn delete_object(&self, handle: u32) -> Result<(), MtpError> {
        self.call(OP_DELETE_OBJECT, &[handle, 0], DataPhase::None).map(|_| ())
    }

    /// Issues a USB port reset and waits for the device to report ready
    /// again (§4.6, reusing the probe's readiness poll).
    pub fn reset_device(&self) -> Result<(), MtpError> {
        self.backend.reset_device(&self.handle).map_err(MtpError::Transport)?;
        crate::probe::wait_for_mtp_ready(&*self.backend, &self.handle, self.iface, self.policy.tuning.handshake_timeout_ms)
    }

    /// Reads the class-specific device status word directly (§6.3), bypassing
    /// the transaction engine since this is a control transfer, not bulk.
    pub fn device_status(&self) -> Result<u16, MtpError> {
        let setup = SetupPacket {
            bmRequestType: request_type::DEVICE_TO_HOST | request_type::CLASS | request_type::RECIPIENT_INTERFACE,
            bRequest: GET_DEVICE_STATUS_REQUEST,
            wValue: 0,
            wIndex: self.iface as u16,
            wLength: 4,
        };
        let mut buf = [0u8; 4];
        let n = self
            .backend
            .control_transfer(&self.handle, setup, Some(&mut buf), self.policy.tuning.io_timeout_ms)
            .map_err(MtpError::Transport)?;
        if n < 4 {
            return Err(CodecError::Truncated { at: n }.into());
        }
        Ok(u16::from_le_bytes([buf[2], buf[3]]))
    }
}

impl<B: UsbBackend + 'static> Drop for Link<B> {
    fn drop(&mut self) {
        self.close();
    }
}

fn policy_supports_prop_list(policy: &DevicePolicy) -> bool {
    policy.flags.supports_get_object_prop_list
}

fn summarize_prop_list(entries: Vec<PropListEntry>, requested_parent: u32) -> Vec<ObjectSummary> {
    use std::collections::HashMap;
    let mut by_handle: HashMap<u32, (Option<u16>, Option<u32>, Option<String>)> = HashMap::new();
    for entry in entries {
        let slot = by_handle.entry(entry.object_handle).or_insert((None, None, None));
        match entry.property_code {
            object_prop::OBJECT_FORMAT => {
                if let crate::wire::PtpValue::UInt16(v) = entry.value {
                    slot.0 = Some(v);
                }
            }
            object_prop::PARENT_OBJECT => {
                if let crate::wire::PtpValue::UInt32(v) = entry.value {
                    slot.1 = Some(v);
                }
            }
            object_prop::OBJECT_FILE_NAME => {
                if let crate::wire::PtpValue::String(s) = entry.value {
                    slot.2 = Some(s);
                }
            }
            _ => {}
        }
    }
    by_handle
        .into_iter()
        .map(|(handle, (format, parent, name))| ObjectSummary {
            handle,
            parent: parent.unwrap_or(requested_parent),
            object_format: format.unwrap_or(0),
            filename: name.unwrap_or_default(),
        })
        .collect()
}

fn single_shot_producer(mut payload: Vec<u8>) -> Box<dyn FnMut(&mut [u8]) -> usize> {
    Box::new(move |buf| {
        if payload.is_empty() {
            return 0;
        }
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        payload.drain(..n);
        n
    })
}

pub use crate::dataset::{DeviceInfo, StorageInfo};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockHandle, ScriptedRead};
    use crate::config::UserOverrides;
    use crate::events::LoggingSink;
    use crate::policy::{build_policy, DeviceIdentity, ProbedCapabilities};
    use crate::wire::HEADER_SIZE;

    fn make_link() -> (Link<MockBackend>, MockHandle) {
        let backend = Arc::new(MockBackend::new());
        let handle = MockHandle::new(0x18d1, 0x4ee1, Vec::new());
        backend.add_device(handle.clone());
        let identity = DeviceIdentity {
            vendor_id: 0x18d1,
            product_id: 0x4ee1,
            bcd_device: 0x0100,
            bus: 1,
            address: 2,
            manufacturer: None,
            product: None,
            serial: None,
        };
        let policy = build_policy(
            &identity, 0x06, 0x01, 0x01, &[], None, None,
            ProbedCapabilities { supports_events: false },
            &UserOverrides::default(),
        );
        let endpoints = LinkEndpoints { bulk_in: 0x81, bulk_out: 0x01, bulk_out_max_packet_size: 512, event_in: None };
        let link = Link::new(backend, handle.clone(), 0, endpoints, policy, Arc::new(LoggingSink));
        (link, handle)
    }

    fn response(code: u16, txid: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        buf.extend_from_slice(&3u16.to_le_bytes());
        buf.extend_from_slice(&code.to_le_bytes());
        buf.extend_from_slice(&txid.to_le_bytes());
        buf
    }

    #[test]
    fn open_session_accepts_already_open() {
        let (link, handle) = make_link();
        handle.queue_read(0x81, ScriptedRead::whole(&response(response_code::SESSION_ALREADY_OPEN, 0)));
        assert!(link.open_session(1).is_ok());
    }

    #[test]
    fn close_is_idempotent() {
        let (link, _handle) = make_link();
        link.close();
        link.close();
        let err = link.open_session(1).unwrap_err();
        assert!(matches!(err, MtpError::Transport(TransportError::NoDevice)));
    }

    #[test]
    fn closing_rejects_with_cancelled_closed_rejects_with_no_device() {
        let (link, _handle) = make_link();

        *link.state.lock().unwrap() = LinkState::Closing;
        let err = link.open_session(1).unwrap_err();
        assert!(matches!(err, MtpError::Cancelled));

        *link.state.lock().unwrap() = LinkState::Closed;
        let err = link.open_session(1).unwrap_err();
        assert!(matches!(err, MtpError::Transport(TransportError::NoDevice)));
    }

    #[test]
    fn delete_object_maps_read_only_response() {
        let (link, handle) = make_link();
        handle.queue_read(0x81, ScriptedRead::whole(&response(response_code::STORE_READ_ONLY, 1)));
        let err = link.delete_object(7).unwrap_err();
        assert!(matches!(err, MtpError::ReadOnly));
    }

    #[test]
    fn s3_enumerate_falls_back_when_prop_list_unsupported() {
        let (link, handle) = make_link();
        // proplist_5param: NotSupported.
        handle.queue_read(0x81, ScriptedRead::whole(&response(response_code::OPERATION_NOT_SUPPORTED, 1)));
        // proplist_3param: NotSupported too.
        handle.queue_read(0x81, ScriptedRead::whole(&response(response_code::OPERATION_NOT_SUPPORTED, 2)));
        // handles_then_info: GetObjectHandles returns one handle, then GetObjectInfo succeeds.
        let handles_payload = {
            let mut b = Vec::new();
            b.extend_from_slice(&1u32.to_le_bytes());
            b.extend_from_slice(&42u32.to_le_bytes());
            b
        };
        let mut data = Vec::new();
        data.extend_from_slice(&((HEADER_SIZE + handles_payload.len()) as u32).to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&OP_GET_OBJECT_HANDLES.to_le_bytes());
        data.extend_from_slice(&3u32.to_le_bytes());
        data.extend_from_slice(&handles_payload);
        handle.queue_read(0x81, ScriptedRead::whole(&data));
        handle.queue_read(0x81, ScriptedRead::whole(&response(response_code::OK, 3)));

        let info = ObjectInfo {
            storage_id: 1,
            object_format: 0x3801,
            protection_status: 0,
            object_compressed_size: 10,
            thumb_format: 0,
            thumb_compressed_size: 0,
            thumb_pix_width: 0,
            thumb_pix_height: 0,
            image_pix_width: 0,
            image_pix_height: 0,
            image_bit_depth: 0,
            parent_object: 0,
            association_type: 0,
            association_desc: 0,
            sequence_number: 0,
            filename: "a.jpg".into(),
            capture_date: "".into(),
            modification_date: "".into(),
            keywords: "".into(),
        };
        let info_bytes = info.encode();
        let mut info_data = Vec::new();
        info_data.extend_from_slice(&((HEADER_SIZE + info_bytes.len()) as u32).to_le_bytes());
        info_data.extend_from_slice(&2u16.to_le_bytes());
        info_data.extend_from_slice(&OP_GET_OBJECT_INFO.to_le_bytes());
        info_data.extend_from_slice(&4u32.to_le_bytes());
        info_data.extend_from_slice(&info_bytes);
        handle.queue_read(0x81, ScriptedRead::whole(&info_data));
        handle.queue_read(0x81, ScriptedRead::whole(&response(response_code::OK, 4)));

        let summaries = link.enumerate(1, 0).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].handle, 42);
        assert_eq!(summaries[0].filename, "a.jpg");
    }
}
