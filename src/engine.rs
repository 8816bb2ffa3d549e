//! Transaction engine (C5, §4.5): executes one PTP transaction end-to-end
//! over a claimed link. Stateless logic, parameterised by the endpoints and
//! tuning a [`crate::link::Link`] hands it for each call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::backend::{BulkBuf, UsbBackend};
use crate::error::{CodecError, MtpError, TransportError};
use crate::policy::TuningProfile;
use crate::wire::{decode_header, encode_command, encode_data_header, ContainerKind, HEADER_SIZE};

/// Cooperative cancellation signal shared between a caller and an in-flight
/// `execute()` (§5 "Cancellation semantics").
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The bulk endpoint pair a transaction runs over.
#[derive(Debug, Clone, Copy)]
pub struct Endpoints {
    pub bulk_in: u8,
    pub bulk_out: u8,
    /// `wMaxPacketSize` of `bulk_out`, resolved once at claim time (§4.3)
    /// and carried here instead of re-queried per write (§4.5 rule 2).
    pub bulk_out_max_packet_size: u16,
}

/// Caller-supplied data-phase behaviour (§4.5 steps 2–3).
pub enum DataPhase<'a> {
    None,
    /// Producer is invoked repeatedly; returning `0` signals end-of-stream.
    Out {
        total_length: u32,
        producer: Box<dyn FnMut(&mut [u8]) -> usize + 'a>,
    },
    /// Consumer receives each chunk as it streams in.
    In { consumer: Box<dyn FnMut(&[u8]) + 'a> },
}

/// `(code, txid, params)` returned by the Response phase (§4.5 step 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtpResponseResult {
    pub code: u16,
    pub txid: u32,
    pub params: Vec<u32>,
}

/// Byte counters for the `transaction_end` event (§6.6).
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferCounters {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

enum BulkWork {
    Write(Vec<u8>),
    Read(usize),
}

enum BulkResult {
    Written(usize),
    Read(Vec<u8>, usize),
}

enum BulkOutcome<B: UsbBackend> {
    Completed(Result<BulkResult, TransportError>),
    Cancelled(PendingBulkJoin<B>),
}

/// A worker thread still running a bulk transfer after `execute()` gave up
/// waiting for it because cancellation was requested (§9 Design Note
/// "Cancellation of FFI calls"). The owning [`crate::link::Link`] must join
/// this (and run the drain recovery) before issuing another transaction.
pub struct PendingBulkJoin<B: UsbBackend> {
    join: std::thread::JoinHandle<()>,
    backend: Arc<B>,
    handle: B::Handle,
}

impl<B: UsbBackend + 'static> PendingBulkJoin<B> {
    /// Blocks until the abandoned worker finishes, then runs the
    /// ClearHalt + drain recovery on both bulk endpoints (§4.5
    /// "Cancellation").
    pub fn join_and_recover(self, endpoints: Endpoints) {
        let _ = self.join.join();
        let _ = self.backend.clear_halt(&self.handle, endpoints.bulk_in);
        let _ = self.backend.clear_halt(&self.handle, endpoints.bulk_out);
        let mut scratch = [0u8; 64];
        for _ in 0..3 {
            match self
                .backend
                .bulk_transfer(&self.handle, endpoints.bulk_in, BulkBuf::In(&mut scratch), 50)
            {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }
}

/// Runs one bulk transfer on a worker thread so `execute()` can return
/// promptly on cancellation instead of blocking for up to `timeout_ms`
/// (§9 Design Note). If the transfer completes before cancellation is
/// observed, behaves exactly like a synchronous call.
fn cancellable_bulk<B: UsbBackend + 'static>(
    backend: &Arc<B>,
    handle: &B::Handle,
    endpoint: u8,
    work: BulkWork,
    timeout_ms: u32,
    cancel: &CancelToken,
) -> BulkOutcome<B> {
    let (tx, rx) = mpsc::channel();
    let thread_backend = backend.clone();
    let thread_handle = handle.clone();
    let join = std::thread::spawn(move || {
        let result = match work {
            BulkWork::Write(data) => thread_backend
                .bulk_transfer(&thread_handle, endpoint, BulkBuf::Out(&data), timeout_ms)
                .map(BulkResult::Written),
            BulkWork::Read(len) => {
                let mut buf = vec![0u8; len];
                thread_backend
                    .bulk_transfer(&thread_handle, endpoint, BulkBuf::In(&mut buf), timeout_ms)
                    .map(|n| BulkResult::Read(buf, n))
            }
        };
        let _ = tx.send(result);
    });

    const POLL_INTERVAL: Duration = Duration::from_millis(20);
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(result) => {
                let _ = join.join();
                return BulkOutcome::Completed(result);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if cancel.is_cancelled() {
                    return BulkOutcome::Cancelled(PendingBulkJoin {
                        join,
                        backend: backend.clone(),
                        handle: handle.clone(),
                    });
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                let _ = join.join();
                return BulkOutcome::Completed(Err(TransportError::Io {
                    message: "bulk transfer worker thread terminated without a result".into(),
                }));
            }
        }
    }
}

/// Outcome of `execute()`: either a parsed response, or a cancellation that
/// left a worker still finishing up in the background.
pub enum ExecuteOutcome<B: UsbBackend> {
    Done(Result<PtpResponseResult, MtpError>, TransferCounters),
    Cancelled(PendingBulkJoin<B>),
}

/// Executes one PTP transaction (§4.5). `opcode`/`txid`/`params` form the
/// Command phase; `data_phase` drives the optional Data phase; the Response
/// phase is always read. Checks `cancel` between phases and after each
/// completed bulk transfer.
#[allow(clippy::too_many_arguments)]
pub fn execute<B: UsbBackend + 'static>(
    backend: &Arc<B>,
    handle: &B::Handle,
    endpoints: Endpoints,
    tuning: &TuningProfile,
    opcode: u16,
    txid: u32,
    params: &[u32],
    mut data_phase: DataPhase,
    cancel: &CancelToken,
) -> ExecuteOutcome<B> {
    let mut counters = TransferCounters::default();

    // --- Command phase ---
    let command = encode_command(opcode, txid, params);
    match write_all_cancellable(backend, handle, endpoints.bulk_out, command, tuning.io_timeout_ms, cancel) {
        Ok(Ok(n)) => counters.bytes_out += n as u64,
        Ok(Err(e)) => return ExecuteOutcome::Done(Err(e.into()), counters),
        Err(pending) => return ExecuteOutcome::Cancelled(pending),
    }

    if cancel.is_cancelled() {
        return ExecuteOutcome::Cancelled(spawn_noop_pending(backend, handle));
    }

    // --- Data-out phase ---
    if let DataPhase::Out { total_length, ref mut producer } = data_phase {
        let header = encode_data_header(total_length, opcode, txid);
        match write_all_cancellable(backend, handle, endpoints.bulk_out, header.to_vec(), tuning.io_timeout_ms, cancel) {
            Ok(Ok(n)) => counters.bytes_out += n as u64,
            Ok(Err(e)) => return ExecuteOutcome::Done(Err(e.into()), counters),
            Err(pending) => return ExecuteOutcome::Cancelled(pending),
        }

        let chunk_size = (tuning.max_chunk_bytes as usize).min(64 * 1024);
        let mut scratch = vec![0u8; chunk_size];
        let mut total_written: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return ExecuteOutcome::Cancelled(spawn_noop_pending(backend, handle));
            }
            let n = producer(&mut scratch);
            if n == 0 {
                break;
            }
            match write_all_cancellable(
                backend,
                handle,
                endpoints.bulk_out,
                scratch[..n].to_vec(),
                tuning.io_timeout_ms,
                cancel,
            ) {
                Ok(Ok(written)) => {
                    counters.bytes_out += written as u64;
                    total_written += written as u64;
                }
                Ok(Err(e)) => return ExecuteOutcome::Done(Err(e.into()), counters),
                Err(pending) => return ExecuteOutcome::Cancelled(pending),
            }
        }

        let max_packet_size = endpoints.bulk_out_max_packet_size as u64;
        if max_packet_size > 0 && total_written > 0 && total_written % max_packet_size == 0 {
            trace!("emitting ZLP after {total_written} bytes (multiple of MPS {max_packet_size})");
            match cancellable_bulk(backend, handle, endpoints.bulk_out, BulkWork::Write(Vec::new()), tuning.io_timeout_ms, cancel) {
                BulkOutcome::Completed(Ok(BulkResult::Written(_))) => {}
                BulkOutcome::Completed(Ok(BulkResult::Read(..))) => unreachable!("write work never yields Read"),
                BulkOutcome::Completed(Err(e)) => return ExecuteOutcome::Done(Err(e.into()), counters),
                BulkOutcome::Cancelled(pending) => return ExecuteOutcome::Cancelled(pending),
            }
        }
    }

    // --- Data-in phase ---
    let mut stashed_response_header: Option<(crate::wire::PtpHeader, Vec<u8>)> = None;
    if let DataPhase::In { ref mut consumer } = data_phase {
        if cancel.is_cancelled() {
            return ExecuteOutcome::Cancelled(spawn_noop_pending(backend, handle));
        }
        let deadline = Instant::now() + Duration::from_millis(tuning.handshake_timeout_ms as u64);
        let first = loop {
            match cancellable_bulk(backend, handle, endpoints.bulk_in, BulkWork::Read(64 * 1024), tuning.io_timeout_ms, cancel) {
                BulkOutcome::Completed(Ok(BulkResult::Read(buf, n))) => {
                    if n > 0 {
                        break (buf, n);
                    }
                    if Instant::now() >= deadline {
                        return ExecuteOutcome::Done(
                            Err(TransportError::TimeoutInPhase(crate::error::TransferPhase::BulkIn).into()),
                            counters,
                        );
                    }
                }
                BulkOutcome::Completed(Ok(BulkResult::Written(_))) => unreachable!("read work never yields Written"),
                BulkOutcome::Completed(Err(e)) => return ExecuteOutcome::Done(Err(e.into()), counters),
                BulkOutcome::Cancelled(pending) => return ExecuteOutcome::Cancelled(pending),
            }
        };
        let (buf, n) = first;
        counters.bytes_in += n as u64;
        let Some(header) = decode_header(&buf[..n]) else {
            return ExecuteOutcome::Done(Err(CodecError::Truncated { at: 0 }.into()), counters);
        };

        if header.kind == ContainerKind::Response {
            // No Data phase after all: stash for the Response phase below.
            stashed_response_header = Some((header, buf[HEADER_SIZE..n].to_vec()));
        } else {
            let mut in_header = buf[HEADER_SIZE..n].to_vec();
            let declared_total = header.length as usize;
            let mut received = in_header.len();
            consumer(&in_header);
            in_header.clear();
            let mut remaining = declared_total.saturating_sub(HEADER_SIZE + received);
            while remaining > 0 {
                if cancel.is_cancelled() {
                    return ExecuteOutcome::Cancelled(spawn_noop_pending(backend, handle));
                }
                let want = remaining.min(1024 * 1024);
                match cancellable_bulk(backend, handle, endpoints.bulk_in, BulkWork::Read(want), tuning.io_timeout_ms, cancel) {
                    BulkOutcome::Completed(Ok(BulkResult::Read(chunk, n))) => {
                        if n == 0 {
                            return ExecuteOutcome::Done(Err(TransportError::Timeout.into()), counters);
                        }
                        counters.bytes_in += n as u64;
                        received += n;
                        remaining = remaining.saturating_sub(n);
                        consumer(&chunk[..n]);
                    }
                    BulkOutcome::Completed(Ok(BulkResult::Written(_))) => unreachable!(),
                    BulkOutcome::Completed(Err(e)) => return ExecuteOutcome::Done(Err(e.into()), counters),
                    BulkOutcome::Cancelled(pending) => return ExecuteOutcome::Cancelled(pending),
                }
            }
        }
    }

    // --- Response phase ---
    if cancel.is_cancelled() {
        return ExecuteOutcome::Cancelled(spawn_noop_pending(backend, handle));
    }
    let (resp_header, trailing) = match stashed_response_header {
        Some(v) => v,
        None => {
            let mut collected = Vec::with_capacity(HEADER_SIZE);
            while collected.len() < HEADER_SIZE {
                match cancellable_bulk(
                    backend,
                    handle,
                    endpoints.bulk_in,
                    BulkWork::Read(HEADER_SIZE - collected.len()),
                    tuning.io_timeout_ms,
                    cancel,
                ) {
                    BulkOutcome::Completed(Ok(BulkResult::Read(buf, n))) => {
                        if n == 0 {
                            return ExecuteOutcome::Done(
                                Err(TransportError::TimeoutInPhase(crate::error::TransferPhase::ResponseWait).into()),
                                counters,
                            );
                        }
                        counters.bytes_in += n as u64;
                        collected.extend_from_slice(&buf[..n]);
                    }
                    BulkOutcome::Completed(Ok(BulkResult::Written(_))) => unreachable!(),
                    BulkOutcome::Completed(Err(e)) => return ExecuteOutcome::Done(Err(e.into()), counters),
                    BulkOutcome::Cancelled(pending) => return ExecuteOutcome::Cancelled(pending),
                }
            }
            let Some(header) = decode_header(&collected) else {
                return ExecuteOutcome::Done(Err(CodecError::Truncated { at: 0 }.into()), counters);
            };
            (header, Vec::new())
        }
    };

    if resp_header.kind != ContainerKind::Response {
        return ExecuteOutcome::Done(
            Err(MtpError::ProtocolError {
                code: resp_header.code,
                message: Some("expected Response container".into()),
            }),
            counters,
        );
    }

    // §9 Open Question: `OpenSession` may echo txid=0 even though it was
    // sent with txid=0 on purpose; some devices echo the sent txid, others
    // always echo 0. Both are accepted without "fixing" the ambiguity.
    let txid_matches = resp_header.txid == txid || (opcode == 0x1002 && resp_header.txid == 0);
    if !txid_matches {
        warn!(
            "response txid {} does not match sent txid {} for opcode {opcode:#06x}",
            resp_header.txid, txid
        );
    }

    let param_bytes_needed = (resp_header.length as usize).saturating_sub(HEADER_SIZE);
    let mut param_bytes = trailing;
    while param_bytes.len() < param_bytes_needed {
        match cancellable_bulk(
            backend,
            handle,
            endpoints.bulk_in,
            BulkWork::Read(param_bytes_needed - param_bytes.len()),
            tuning.io_timeout_ms,
            cancel,
        ) {
            BulkOutcome::Completed(Ok(BulkResult::Read(buf, n))) => {
                if n == 0 {
                    break;
                }
                counters.bytes_in += n as u64;
                param_bytes.extend_from_slice(&buf[..n]);
            }
            BulkOutcome::Completed(Ok(BulkResult::Written(_))) => unreachable!(),
            BulkOutcome::Completed(Err(e)) => return ExecuteOutcome::Done(Err(e.into()), counters),
            BulkOutcome::Cancelled(pending) => return ExecuteOutcome::Cancelled(pending),
        }
    }
    let mut resp_params = Vec::new();
    for chunk in param_bytes.chunks_exact(4).take(5) {
        resp_params.push(u32::from_le_bytes(chunk.try_into().unwrap()));
    }

    ExecuteOutcome::Done(
        Ok(PtpResponseResult {
            code: resp_header.code,
            txid: resp_header.txid,
            params: resp_params,
        }),
        counters,
    )
}

/// Writes all of `data`, looping over partial bulk writes. Retries once on
/// a timeout that made no progress at all (§7 "Propagation" (a)).
fn write_all_cancellable<B: UsbBackend + 'static>(
    backend: &Arc<B>,
    handle: &B::Handle,
    endpoint: u8,
    data: Vec<u8>,
    timeout_ms: u32,
    cancel: &CancelToken,
) -> Result<Result<usize, TransportError>, PendingBulkJoin<B>> {
    let mut sent = 0usize;
    let mut retried_no_progress = false;
    loop {
        if cancel.is_cancelled() {
            return Err(spawn_noop_pending(backend, handle));
        }
        match cancellable_bulk(backend, handle, endpoint, BulkWork::Write(data[sent..].to_vec()), timeout_ms, cancel) {
            BulkOutcome::Completed(Ok(BulkResult::Written(n))) => {
                sent += n;
                if sent >= data.len() {
                    return Ok(Ok(sent));
                }
            }
            BulkOutcome::Completed(Ok(BulkResult::Read(..))) => unreachable!("write work never yields Read"),
            BulkOutcome::Completed(Err(TransportError::Timeout)) if sent == 0 && !retried_no_progress => {
                retried_no_progress = true;
                continue;
            }
            BulkOutcome::Completed(Err(e)) => return Ok(Err(e)),
            BulkOutcome::Cancelled(pending) => return Err(pending),
        }
    }
}

/// A cancellation observed before any bulk transfer is in flight still
/// needs to produce a `PendingBulkJoin` so the Link's recovery path is
/// uniform; this spawns an already-finished no-op thread for that case.
fn spawn_noop_pending<B: UsbBackend + 'static>(backend: &Arc<B>, handle: &B::Handle) -> PendingBulkJoin<B> {
    PendingBulkJoin {
        join: std::thread::spawn(|| {}),
        backend: backend.clone(),
        handle: handle.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockHandle, ScriptedRead};
    use crate::policy::TuningProfile;

    fn setup() -> (Arc<MockBackend>, MockHandle, Endpoints, TuningProfile) {
        let backend = Arc::new(MockBackend::new());
        let handle = MockHandle::new(0x18d1, 0x4ee1, Vec::new());
        backend.add_device(handle.clone());
        let endpoints = Endpoints { bulk_in: 0x81, bulk_out: 0x01, bulk_out_max_packet_size: 512 };
        (backend, handle, endpoints, TuningProfile::default())
    }

    fn response_container(code: u16, txid: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        buf.extend_from_slice(&3u16.to_le_bytes());
        buf.extend_from_slice(&code.to_le_bytes());
        buf.extend_from_slice(&txid.to_le_bytes());
        buf
    }

    #[test]
    fn s1_get_device_info_handshake() {
        let (backend, handle, endpoints, tuning) = setup();
        let payload = b"device-info-bytes".to_vec();
        let mut data = Vec::new();
        data.extend_from_slice(&((HEADER_SIZE + payload.len()) as u32).to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&0x1001u16.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&payload);

        handle.queue_read(0x81, ScriptedRead::whole(&data));
        handle.queue_read(0x81, ScriptedRead::whole(&response_container(0x2001, 1)));

        let mut received = Vec::new();
        let cancel = CancelToken::new();
        let outcome = execute(
            &backend,
            &handle,
            endpoints,
            &tuning,
            0x1001,
            1,
            &[],
            DataPhase::In {
                consumer: Box::new(|chunk| received.extend_from_slice(chunk)),
            },
            &cancel,
        );
        match outcome {
            ExecuteOutcome::Done(Ok(resp), _) => assert_eq!(resp.code, 0x2001),
            other => panic!("unexpected outcome"),
        }
        assert_eq!(received, payload);
    }

    #[test]
    fn s2_zlp_termination_at_exact_multiple_of_mps() {
        let (backend, handle, endpoints, mut tuning) = setup();
        tuning.max_chunk_bytes = 4096;
        handle.queue_read(0x81, ScriptedRead::whole(&response_container(0x2001, 2)));

        let mut remaining = 512usize;
        let cancel = CancelToken::new();
        let outcome = execute(
            &backend,
            &handle,
            endpoints,
            &tuning,
            0x100D,
            2,
            &[],
            DataPhase::Out {
                total_length: 512,
                producer: Box::new(move |buf| {
                    let n = remaining.min(buf.len());
                    for b in buf[..n].iter_mut() {
                        *b = 0xAB;
                    }
                    remaining -= n;
                    n
                }),
            },
            &cancel,
        );
        assert!(matches!(outcome, ExecuteOutcome::Done(Ok(_), _)));

        let writes = handle.writes();
        // header, one 512-byte payload write, and a trailing ZLP.
        let zlp_count = writes.iter().filter(|(ep, data)| *ep == 0x01 && data.is_empty()).count();
        assert_eq!(zlp_count, 1, "exactly one ZLP expected: {writes:?}");
    }

    #[test]
    fn s5_cancellation_drains_and_link_stays_usable() {
        let (backend, handle, endpoints, tuning) = setup();
        handle.force_timeouts(1000); // make the data-in read block-ish/fail repeatedly
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcome = execute(
            &backend,
            &handle,
            endpoints,
            &tuning,
            0x1009,
            3,
            &[],
            DataPhase::In {
                consumer: Box::new(|_| {}),
            },
            &cancel,
        );
        match outcome {
            ExecuteOutcome::Cancelled(pending) => {
                pending.join_and_recover(endpoints);
            }
            ExecuteOutcome::Done(..) => panic!("expected cancellation"),
        }
        // A subsequent GetDeviceInfo-style call succeeds: the endpoint was
        // un-halted by the recovery and the mock is otherwise idle.
        assert!(!handle.is_halted(endpoints.bulk_in));
    }

    #[test]
    fn no_progress_write_timeout_retried_once() {
        let (backend, handle, endpoints, tuning) = setup();
        handle.force_timeouts(1); // first write attempt times out with 0 bytes
        handle.queue_read(0x81, ScriptedRead::whole(&response_container(0x2001, 9)));
        let cancel = CancelToken::new();
        let outcome = execute(
            &backend, &handle, endpoints, &tuning, 0x1003, 9, &[], DataPhase::None, &cancel,
        );
        assert!(matches!(outcome, ExecuteOutcome::Done(Ok(_), _)));
    }
}
