// In-process capture backend.
//
// Packets enter through `inject` (the "network") and are queued on every open
// handle that would see them, highest priority first. A handle opened
// without SNIFF diverts the packet, so lower-priority handles never see it;
// DROP handles swallow it. Packets a handle sends are handed to handles of
// strictly lower priority, tagged as impostors, and kept in a bounded log of
// the most recent sends.
//
// Filter expressions are not evaluated: any non-empty filter matches every
// packet except the literal "false", which matches nothing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{
    CaptureDriver, ERROR_INVALID_HANDLE, ERROR_INVALID_PARAMETER, ERROR_NO_DATA,
    ERROR_OPERATION_ABORTED, NativeError, NativeHandle,
};
use crate::config::{Layer, OpenFlags, PRIORITY_MAX, PRIORITY_MIN, Param};
use crate::header;
use crate::metadata::Metadata;

struct Queued {
    raw: Vec<u8>,
    meta: Metadata,
    at: Instant,
}

struct HandleState {
    filter: String,
    priority: i16,
    flags: OpenFlags,
    shut_down: bool,
    queue: VecDeque<Queued>,
    queued_bytes: usize,
    params: [u64; 3],
}

impl HandleState {
    fn matches(&self, meta: &Metadata) -> bool {
        if self.shut_down || self.filter == "false" || self.flags.contains(OpenFlags::SEND_ONLY) {
            return false;
        }
        // Without FRAGMENTS only reassembled inbound packets are visible.
        !(meta.is_inbound() && meta.is_fragment() && !self.flags.contains(OpenFlags::FRAGMENTS))
    }

    fn param(&self, param: Param) -> u64 {
        self.params[param.as_raw() as usize]
    }

    /// Drop packets that sat in the queue longer than the queue time.
    fn expire(&mut self, now: Instant) {
        let limit = Duration::from_millis(self.param(Param::QueueTime));
        while let Some(front) = self.queue.front() {
            if now.duration_since(front.at) <= limit {
                break;
            }
            if let Some(old) = self.queue.pop_front() {
                self.queued_bytes -= old.raw.len();
                log::debug!("memory: expired queued packet ({} bytes)", old.raw.len());
            }
        }
    }

    fn enqueue(&mut self, raw: &[u8], meta: Metadata) -> bool {
        let full = self.queue.len() as u64 >= self.param(Param::QueueLength)
            || (self.queued_bytes + raw.len()) as u64 > self.param(Param::QueueSize);
        if full {
            log::debug!("memory: queue full, dropping {} bytes", raw.len());
            return false;
        }
        self.queued_bytes += raw.len();
        self.queue.push_back(Queued {
            raw: raw.to_vec(),
            meta,
            at: Instant::now(),
        });
        true
    }
}

/// Sends kept for `sent`/`take_sent`; older entries are discarded.
pub const SENT_LOG_LEN: usize = 4096;

#[derive(Default)]
struct State {
    next_handle: usize,
    handles: HashMap<usize, HandleState>,
    sent: VecDeque<(Vec<u8>, Metadata)>,
    fail_next_open: Option<NativeError>,
}

impl State {
    fn handle(&mut self, handle: NativeHandle) -> Result<&mut HandleState, NativeError> {
        self.handles
            .get_mut(&handle.0)
            .ok_or_else(|| NativeError::from_code(ERROR_INVALID_HANDLE))
    }

    /// Queue `raw` on matching handles in priority order, highest first.
    /// `below` limits delivery to handles of strictly lower priority.
    fn record_sent(&mut self, raw: &[u8], meta: Metadata) {
        if self.sent.len() == SENT_LOG_LEN {
            self.sent.pop_front();
        }
        self.sent.push_back((raw.to_vec(), meta));
    }

    fn deliver(&mut self, raw: &[u8], meta: Metadata, below: Option<i16>) -> usize {
        let mut targets: Vec<(i16, usize)> = self
            .handles
            .iter()
            .filter(|(_, h)| below.is_none_or(|p| h.priority < p))
            .map(|(id, h)| (h.priority, *id))
            .collect();
        targets.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut delivered = 0;
        for (_, id) in targets {
            let Some(h) = self.handles.get_mut(&id) else {
                continue;
            };
            if !h.matches(&meta) {
                continue;
            }
            if h.flags.contains(OpenFlags::DROP) {
                break;
            }
            if h.enqueue(raw, meta) {
                delivered += 1;
            }
            if !h.flags.contains(OpenFlags::SNIFF) {
                break;
            }
        }
        delivered
    }
}

/// Capture backend that lives entirely in process memory.
///
/// Useful for replaying recorded traffic through a Session and for
/// exercising Session behaviour without the kernel driver.
#[derive(Default)]
pub struct MemoryDriver {
    state: Mutex<State>,
    ready: Condvar,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed a packet into the simulated network. Returns how many handles
    /// queued it.
    pub fn inject(&self, raw: &[u8], meta: Metadata) -> usize {
        let meta = meta.with_fragment(meta.is_fragment() || header::is_fragment(raw));
        let delivered = self.lock().deliver(raw, meta, None);
        if delivered > 0 {
            self.ready.notify_all();
        }
        delivered
    }

    /// The last [`SENT_LOG_LEN`] packets sent through any handle, oldest
    /// first.
    pub fn sent(&self) -> Vec<(Vec<u8>, Metadata)> {
        self.lock().sent.iter().cloned().collect()
    }

    /// Drain the log of sent packets.
    pub fn take_sent(&self) -> Vec<(Vec<u8>, Metadata)> {
        Vec::from(std::mem::take(&mut self.lock().sent))
    }

    pub fn open_handles(&self) -> usize {
        self.lock().handles.len()
    }

    /// Packets waiting on `handle`.
    pub fn pending(&self, handle: NativeHandle) -> usize {
        self.lock()
            .handles
            .get(&handle.0)
            .map_or(0, |h| h.queue.len())
    }

    /// Make the next `open` fail with `err`.
    pub fn fail_next_open(&self, err: NativeError) {
        self.lock().fail_next_open = Some(err);
    }
}

impl CaptureDriver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn open(
        &self,
        filter: &str,
        _layer: Layer,
        priority: i16,
        flags: OpenFlags,
    ) -> Result<NativeHandle, NativeError> {
        let mut state = self.lock();
        if let Some(err) = state.fail_next_open.take() {
            return Err(err);
        }
        if filter.trim().is_empty() {
            return Err(NativeError::new(ERROR_INVALID_PARAMETER, "empty filter"));
        }
        if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&priority) {
            return Err(NativeError::new(
                ERROR_INVALID_PARAMETER,
                format!("priority {priority} out of range"),
            ));
        }
        if flags.contains(OpenFlags::RECV_ONLY | OpenFlags::SEND_ONLY) {
            return Err(NativeError::new(
                ERROR_INVALID_PARAMETER,
                "RECV_ONLY and SEND_ONLY are exclusive",
            ));
        }

        state.next_handle += 1;
        let id = state.next_handle;
        state.handles.insert(
            id,
            HandleState {
                filter: filter.trim().to_string(),
                priority,
                flags,
                shut_down: false,
                queue: VecDeque::new(),
                queued_bytes: 0,
                params: Param::ALL.map(Param::default_value),
            },
        );
        log::debug!("memory: opened handle {id} filter={filter:?} priority={priority}");
        Ok(NativeHandle(id))
    }

    fn shutdown(&self, handle: NativeHandle) -> Result<(), NativeError> {
        self.lock().handle(handle)?.shut_down = true;
        self.ready.notify_all();
        log::debug!("memory: shut down handle {}", handle.0);
        Ok(())
    }

    fn close(&self, handle: NativeHandle) -> Result<(), NativeError> {
        let mut state = self.lock();
        if state.handles.remove(&handle.0).is_none() {
            return Err(NativeError::from_code(ERROR_INVALID_HANDLE));
        }
        drop(state);
        self.ready.notify_all();
        log::debug!("memory: closed handle {}", handle.0);
        Ok(())
    }

    fn recv(&self, handle: NativeHandle, buf: &mut [u8]) -> Result<(usize, Metadata), NativeError> {
        let mut state = self.lock();
        let h = state.handle(handle)?;
        if h.flags.contains(OpenFlags::SEND_ONLY) {
            return Err(NativeError::new(
                ERROR_INVALID_PARAMETER,
                "handle was opened send-only",
            ));
        }
        if h.flags.contains(OpenFlags::DROP) {
            return Err(NativeError::from_code(ERROR_NO_DATA));
        }

        loop {
            // Closed while waiting.
            let Some(h) = state.handles.get_mut(&handle.0) else {
                return Err(NativeError::from_code(ERROR_OPERATION_ABORTED));
            };
            h.expire(Instant::now());
            if let Some(item) = h.queue.pop_front() {
                h.queued_bytes -= item.raw.len();
                let n = item.raw.len().min(buf.len());
                buf[..n].copy_from_slice(&item.raw[..n]);
                return Ok((n, item.meta));
            }
            // Shut down and drained.
            if h.shut_down {
                return Err(NativeError::from_code(ERROR_NO_DATA));
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn send(
        &self,
        handle: NativeHandle,
        packet: &[u8],
        meta: &Metadata,
    ) -> Result<usize, NativeError> {
        let mut state = self.lock();
        let h = state.handle(handle)?;
        if h.flags.contains(OpenFlags::RECV_ONLY) {
            return Err(NativeError::new(
                ERROR_INVALID_PARAMETER,
                "handle was opened receive-only",
            ));
        }
        if h.shut_down {
            return Err(NativeError::from_code(ERROR_NO_DATA));
        }
        let priority = h.priority;
        let meta = meta.with_impostor(true);
        state.record_sent(packet, meta);
        if state.deliver(packet, meta, Some(priority)) > 0 {
            self.ready.notify_all();
        }
        Ok(packet.len())
    }

    fn get_param(&self, handle: NativeHandle, param: Param) -> Result<u64, NativeError> {
        Ok(self.lock().handle(handle)?.param(param))
    }

    fn set_param(&self, handle: NativeHandle, param: Param, value: u64) -> Result<(), NativeError> {
        let mut state = self.lock();
        let h = state.handle(handle)?;
        if !param.valid_range().contains(&value) {
            return Err(NativeError::new(
                ERROR_INVALID_PARAMETER,
                format!("{param}={value} outside {:?}", param.valid_range()),
            ));
        }
        h.params[param.as_raw() as usize] = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    const PKT: &[u8] = &[0x45, 0, 0, 20, 0, 0, 0x40, 0, 64, 6, 0, 0, 127, 0, 0, 1, 127, 0, 0, 1];

    fn open(d: &MemoryDriver, filter: &str, priority: i16, flags: OpenFlags) -> NativeHandle {
        d.open(filter, Layer::Network, priority, flags).unwrap()
    }

    #[test]
    fn inject_then_recv() {
        let d = MemoryDriver::new();
        let h = open(&d, "true", 0, OpenFlags::NONE);
        assert_eq!(d.inject(PKT, Metadata::inbound().with_interface(3, 0)), 1);
        assert_eq!(d.pending(h), 1);

        let mut buf = [0u8; 64];
        let (n, meta) = d.recv(h, &mut buf).unwrap();
        assert_eq!(&buf[..n], PKT);
        assert!(meta.is_inbound());
        assert_eq!(meta.if_idx(), 3);
    }

    #[test]
    fn recv_truncates_to_buffer() {
        let d = MemoryDriver::new();
        let h = open(&d, "true", 0, OpenFlags::NONE);
        d.inject(PKT, Metadata::outbound());
        let mut buf = [0u8; 8];
        let (n, _) = d.recv(h, &mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(buf, PKT[..8]);
    }

    #[test]
    fn false_filter_matches_nothing() {
        let d = MemoryDriver::new();
        let h = open(&d, "false", 0, OpenFlags::NONE);
        assert_eq!(d.inject(PKT, Metadata::outbound()), 0);
        assert_eq!(d.pending(h), 0);
    }

    #[test]
    fn open_validates_arguments() {
        let d = MemoryDriver::new();
        let err = d.open("  ", Layer::Network, 0, OpenFlags::NONE).unwrap_err();
        assert_eq!(err.code, ERROR_INVALID_PARAMETER);
        let err = d
            .open("true", Layer::Network, 30001, OpenFlags::NONE)
            .unwrap_err();
        assert_eq!(err.code, ERROR_INVALID_PARAMETER);
        let err = d
            .open(
                "true",
                Layer::Network,
                0,
                OpenFlags::RECV_ONLY | OpenFlags::SEND_ONLY,
            )
            .unwrap_err();
        assert_eq!(err.code, ERROR_INVALID_PARAMETER);
        assert_eq!(d.open_handles(), 0);
    }

    #[test]
    fn divert_stops_at_highest_priority() {
        let d = MemoryDriver::new();
        let low = open(&d, "true", -5, OpenFlags::NONE);
        let high = open(&d, "true", 10, OpenFlags::NONE);
        assert_eq!(d.inject(PKT, Metadata::outbound()), 1);
        assert_eq!(d.pending(high), 1);
        assert_eq!(d.pending(low), 0);
    }

    #[test]
    fn sniff_lets_packet_continue() {
        let d = MemoryDriver::new();
        let low = open(&d, "true", 0, OpenFlags::NONE);
        let sniffer = open(&d, "true", 100, OpenFlags::SNIFF);
        assert_eq!(d.inject(PKT, Metadata::outbound()), 2);
        assert_eq!(d.pending(sniffer), 1);
        assert_eq!(d.pending(low), 1);
    }

    #[test]
    fn drop_handle_swallows_packets() {
        let d = MemoryDriver::new();
        let low = open(&d, "true", 0, OpenFlags::NONE);
        let dropper = open(&d, "true", 100, OpenFlags::DROP);
        assert_eq!(d.inject(PKT, Metadata::outbound()), 0);
        assert_eq!(d.pending(low), 0);
        let err = d.recv(dropper, &mut [0u8; 64]).unwrap_err();
        assert_eq!(err.code, ERROR_NO_DATA);
    }

    #[test]
    fn inbound_fragments_need_the_fragments_flag() {
        let d = MemoryDriver::new();
        let plain = open(&d, "true", 10, OpenFlags::SNIFF);
        let frags = open(&d, "true", 0, OpenFlags::SNIFF | OpenFlags::FRAGMENTS);
        let mut frag = PKT.to_vec();
        frag[6] = 0x20; // MF
        assert_eq!(d.inject(&frag, Metadata::inbound()), 1);
        assert_eq!(d.pending(plain), 0);
        assert_eq!(d.pending(frags), 1);

        let (_, meta) = d.recv(frags, &mut [0u8; 64]).unwrap();
        assert!(meta.is_fragment());
    }

    #[test]
    fn send_records_impostor_and_reaches_lower_priority() {
        let d = MemoryDriver::new();
        let upper = open(&d, "true", 10, OpenFlags::NONE);
        let lower = open(&d, "true", 0, OpenFlags::NONE);
        assert_eq!(d.send(upper, PKT, &Metadata::outbound()).unwrap(), PKT.len());

        let sent = d.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.is_impostor());
        assert!(d.sent().is_empty());
        assert_eq!(d.pending(upper), 0);
        assert_eq!(d.pending(lower), 1);
    }

    #[test]
    fn direction_restricted_handles() {
        let d = MemoryDriver::new();
        let recv_only = open(&d, "true", 0, OpenFlags::RECV_ONLY);
        let send_only = open(&d, "true", 1, OpenFlags::SEND_ONLY);
        let err = d.send(recv_only, PKT, &Metadata::outbound()).unwrap_err();
        assert_eq!(err.code, ERROR_INVALID_PARAMETER);
        let err = d.recv(send_only, &mut [0u8; 64]).unwrap_err();
        assert_eq!(err.code, ERROR_INVALID_PARAMETER);
        // The send-only handle never diverts traffic away from the other one.
        assert_eq!(d.inject(PKT, Metadata::outbound()), 1);
        assert_eq!(d.pending(recv_only), 1);
    }

    #[test]
    fn params_default_and_validate() {
        let d = MemoryDriver::new();
        let h = open(&d, "true", 0, OpenFlags::NONE);
        for p in Param::ALL {
            assert_eq!(d.get_param(h, p).unwrap(), p.default_value());
        }
        d.set_param(h, Param::QueueLength, 100).unwrap();
        assert_eq!(d.get_param(h, Param::QueueLength).unwrap(), 100);
        let err = d.set_param(h, Param::QueueTime, 5).unwrap_err();
        assert_eq!(err.code, ERROR_INVALID_PARAMETER);
    }

    #[test]
    fn queue_length_bounds_the_queue() {
        let d = MemoryDriver::new();
        let h = open(&d, "true", 0, OpenFlags::NONE);
        d.set_param(h, Param::QueueLength, 32).unwrap();
        for _ in 0..40 {
            d.inject(PKT, Metadata::outbound());
        }
        assert_eq!(d.pending(h), 32);
    }

    #[test]
    fn closed_handle_is_invalid() {
        let d = MemoryDriver::new();
        let h = open(&d, "true", 0, OpenFlags::NONE);
        d.inject(PKT, Metadata::outbound());
        d.close(h).unwrap();
        assert_eq!(d.open_handles(), 0);
        assert_eq!(d.pending(h), 0);
        assert_eq!(d.close(h).unwrap_err().code, ERROR_INVALID_HANDLE);
        assert_eq!(
            d.recv(h, &mut [0u8; 64]).unwrap_err().code,
            ERROR_INVALID_HANDLE
        );
        assert_eq!(
            d.get_param(h, Param::QueueTime).unwrap_err().code,
            ERROR_INVALID_HANDLE
        );
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let d = Arc::new(MemoryDriver::new());
        let h = open(&d, "true", 0, OpenFlags::NONE);
        let worker = {
            let d = Arc::clone(&d);
            thread::spawn(move || d.recv(h, &mut [0u8; 64]))
        };
        thread::sleep(Duration::from_millis(50));
        d.close(h).unwrap();
        let err = worker.join().unwrap().unwrap_err();
        // Aborted if the receive was already waiting, invalid handle otherwise.
        assert!(
            err.code == ERROR_OPERATION_ABORTED || err.code == ERROR_INVALID_HANDLE,
            "{err}"
        );
    }

    #[test]
    fn shutdown_wakes_receiver_and_keeps_handle() {
        let d = Arc::new(MemoryDriver::new());
        let h = open(&d, "true", 0, OpenFlags::NONE);
        let worker = {
            let d = Arc::clone(&d);
            thread::spawn(move || d.recv(h, &mut [0u8; 64]))
        };
        thread::sleep(Duration::from_millis(50));
        d.shutdown(h).unwrap();
        assert_eq!(worker.join().unwrap().unwrap_err().code, ERROR_NO_DATA);

        // No new traffic, no sends, but the handle is still open.
        assert_eq!(d.inject(PKT, Metadata::outbound()), 0);
        let err = d.send(h, PKT, &Metadata::outbound()).unwrap_err();
        assert_eq!(err.code, ERROR_NO_DATA);
        assert_eq!(d.get_param(h, Param::QueueLength).unwrap(), 4096);
        assert_eq!(d.open_handles(), 1);
        d.close(h).unwrap();
        assert_eq!(d.open_handles(), 0);
    }

    #[test]
    fn shutdown_drains_queued_packets_first() {
        let d = MemoryDriver::new();
        let h = open(&d, "true", 0, OpenFlags::NONE);
        d.inject(PKT, Metadata::outbound());
        d.shutdown(h).unwrap();
        assert!(d.recv(h, &mut [0u8; 64]).is_ok());
        assert_eq!(d.recv(h, &mut [0u8; 64]).unwrap_err().code, ERROR_NO_DATA);
    }

    #[test]
    fn sent_log_is_bounded() {
        let d = MemoryDriver::new();
        let h = open(&d, "true", 0, OpenFlags::NONE);
        for i in 0..SENT_LOG_LEN + 10 {
            let mut pkt = PKT.to_vec();
            pkt[4..6].copy_from_slice(&(i as u16).to_be_bytes());
            d.send(h, &pkt, &Metadata::outbound()).unwrap();
        }
        let sent = d.take_sent();
        assert_eq!(sent.len(), SENT_LOG_LEN);
        assert_eq!(&sent[0].0[4..6], &10u16.to_be_bytes());
        assert!(d.sent().is_empty());
    }

    #[test]
    fn injected_packet_wakes_blocked_receiver() {
        let d = Arc::new(MemoryDriver::new());
        let h = open(&d, "true", 0, OpenFlags::NONE);
        let worker = {
            let d = Arc::clone(&d);
            thread::spawn(move || {
                let mut buf = [0u8; 64];
                d.recv(h, &mut buf).map(|(n, _)| buf[..n].to_vec())
            })
        };
        thread::sleep(Duration::from_millis(20));
        d.inject(PKT, Metadata::outbound());
        assert_eq!(worker.join().unwrap().unwrap(), PKT);
    }

    #[test]
    fn fail_next_open_is_one_shot() {
        let d = MemoryDriver::new();
        d.fail_next_open(NativeError::from_code(5));
        let err = d.open("true", Layer::Network, 0, OpenFlags::NONE).unwrap_err();
        assert_eq!(err.code, 5);
        assert!(d.open("true", Layer::Network, 0, OpenFlags::NONE).is_ok());
    }
}
