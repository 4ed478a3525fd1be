//! Session lifecycle and packet I/O against the in-process backend.
//!
//! Run with:
//!   cargo test --test session_integration

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use netdivert::driver::{ERROR_NO_DATA, MemoryDriver};
use netdivert::error::ERROR_INVALID_HANDLE;
use netdivert::rewrite::PortRedirect;
use netdivert::{
    Divert, DivertError, Metadata, OpenFlags, PACKET_BUFFER_SIZE, Packet, Param, Session,
    SessionConfig,
};

/// Builder for IPv4 TCP test packets.
struct PacketBuilder {
    src: [u8; 4],
    dst: [u8; 4],
    src_port: u16,
    dst_port: u16,
    payload: Vec<u8>,
}

impl PacketBuilder {
    fn tcp() -> Self {
        Self {
            src: [10, 0, 0, 2],
            dst: [10, 0, 0, 1],
            src_port: 50000,
            dst_port: 80,
            payload: Vec::new(),
        }
    }

    fn ports(mut self, src: u16, dst: u16) -> Self {
        self.src_port = src;
        self.dst_port = dst;
        self
    }

    fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    fn build(self) -> Vec<u8> {
        let total = 40 + self.payload.len();
        let mut pkt = vec![0u8; 40];
        pkt[0] = 0x45;
        pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        pkt[8] = 64;
        pkt[9] = 6;
        pkt[12..16].copy_from_slice(&self.src);
        pkt[16..20].copy_from_slice(&self.dst);
        pkt[20..22].copy_from_slice(&self.src_port.to_be_bytes());
        pkt[22..24].copy_from_slice(&self.dst_port.to_be_bytes());
        pkt[32] = 0x50;
        pkt[33] = 0x18;
        pkt.extend_from_slice(&self.payload);
        netdivert::calc_checksums(&pkt).unwrap()
    }
}

fn open(filter: &str) -> (Divert, Arc<MemoryDriver>, Session) {
    let (divert, driver) = Divert::memory();
    let session = divert.open_session(SessionConfig::new(filter)).unwrap();
    (divert, driver, session)
}

// =========================================================================
// Lifecycle
// =========================================================================

/// TC-SES-1: every operation on a never-opened session is a resource error.
#[test]
fn tc_ses_1_closed_session_rejects_operations() {
    let (divert, _) = Divert::memory();
    let session = divert.session(SessionConfig::default());
    let results = [
        session.receive().map(|_| ()),
        session.send(&PacketBuilder::tcp().build(), &Metadata::outbound()).map(|_| ()),
        session.get_param(Param::QueueLength).map(|_| ()),
        session.close(),
    ];
    for r in results {
        let err = r.unwrap_err();
        assert!(err.is_resource(), "{err}");
        assert_eq!(err.native_code(), Some(ERROR_INVALID_HANDLE));
    }
}

/// TC-SES-2: close twice fails the second time; the session can reopen.
#[test]
fn tc_ses_2_double_close_and_reopen() {
    let (_divert, driver, session) = open("true");
    session.close().unwrap();
    assert!(session.close().unwrap_err().is_resource());

    session.open().unwrap();
    assert_eq!(driver.open_handles(), 1);
    session.close().unwrap();
    assert_eq!(driver.open_handles(), 0);
}

/// TC-SES-3: leaving scope on an error path still releases the handle.
#[test]
fn tc_ses_3_scope_exit_closes() {
    let (divert, driver) = Divert::memory();

    fn use_session(divert: &Divert) -> Result<(), DivertError> {
        let session = divert.open_session(SessionConfig::new("true"))?;
        session.send(&[], &Metadata::outbound())?;
        Ok(())
    }

    assert!(use_session(&divert).is_err());
    assert_eq!(driver.open_handles(), 0);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _session = divert.open_session(SessionConfig::new("true")).unwrap();
        panic!("boom");
    }));
    assert!(result.is_err());
    assert_eq!(driver.open_handles(), 0);
}

/// TC-SES-4: a rejected filter leaves the session closed.
#[test]
fn tc_ses_4_bad_filter() {
    let (divert, _) = Divert::memory();
    let session = divert.session(SessionConfig::new(""));
    let err = session.open().unwrap_err();
    assert!(matches!(err, DivertError::Resource { op: "open", code: 87, .. }));
    assert!(!session.is_open());
}

// =========================================================================
// Receive / send
// =========================================================================

/// TC-SES-5: the three send shapes reach the backend identically.
#[test]
fn tc_ses_5_send_argument_equivalence() {
    let (_divert, driver, session) = open("true");
    let raw = PacketBuilder::tcp().payload(b"GET /").build();
    let meta = Metadata::outbound().with_interface(9, 1);

    let parts = (raw.clone(), meta);
    session.send(&parts.0, &parts.1).unwrap();
    session.send(&raw, &meta).unwrap();
    let packet = Packet::parse_with_meta(raw.clone(), Some(meta)).unwrap();
    session.send_packet(&packet).unwrap();

    let sent = driver.take_sent();
    assert_eq!(sent.len(), 3);
    assert!(sent.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(sent[0].0, raw);
    assert_eq!(sent[0].1.if_idx(), 9);
}

/// TC-SES-6: receive attaches metadata and hands back a parsed packet.
#[test]
fn tc_ses_6_receive_attaches_metadata() {
    let (_divert, driver, session) = open("true");
    let raw = PacketBuilder::tcp().ports(40000, 23).build();
    driver.inject(&raw, Metadata::inbound().with_interface(5, 0));

    let pkt = session.receive().unwrap();
    assert!(pkt.is_inbound());
    assert_eq!(pkt.meta().unwrap().if_idx(), 5);
    assert_eq!(pkt.dst_port().unwrap(), 23);
    assert_eq!(pkt.raw(), &raw[..]);
}

/// TC-SES-7: receive truncates at the buffer ceiling.
#[test]
fn tc_ses_7_receive_truncates_oversized_packets() {
    let (_divert, driver, session) = open("true");
    let big = vec![0x45u8; PACKET_BUFFER_SIZE + 100];
    driver.inject(&big, Metadata::outbound());
    let (raw, _) = session.receive_raw().unwrap();
    assert_eq!(raw.len(), PACKET_BUFFER_SIZE);
}

/// TC-SES-8: closing from another thread ends a blocked receive.
#[test]
fn tc_ses_8_close_unblocks_receive() {
    let (_divert, _driver, session) = open("true");
    let session = Arc::new(session);
    let worker = {
        let session = Arc::clone(&session);
        thread::spawn(move || session.receive_raw())
    };
    thread::sleep(Duration::from_millis(50));
    session.close().unwrap();

    let err = worker.join().unwrap().unwrap_err();
    assert!(matches!(err, DivertError::Resource { op: "recv", .. }));
    // Shut down if the receive was already pending, invalid handle otherwise.
    let code = err.native_code();
    assert!(
        code == Some(ERROR_NO_DATA) || code == Some(ERROR_INVALID_HANDLE),
        "{err}"
    );
}

/// TC-SES-9: a send proceeds while another thread is blocked receiving.
#[test]
fn tc_ses_9_send_while_receiving() {
    let (_divert, driver, session) = open("true");
    let session = Arc::new(session);
    let worker = {
        let session = Arc::clone(&session);
        thread::spawn(move || session.receive())
    };
    thread::sleep(Duration::from_millis(20));
    let raw = PacketBuilder::tcp().build();
    session.send(&raw, &Metadata::outbound()).unwrap();
    assert_eq!(driver.sent().len(), 1);

    driver.inject(&raw, Metadata::outbound());
    let pkt = worker.join().unwrap().unwrap();
    assert_eq!(pkt.raw(), &raw[..]);
}

/// TC-SES-10: receive, redirect, recompute, reinject.
#[test]
fn tc_ses_10_redirect_round_trip() {
    let (_divert, driver, session) = open("tcp.DstPort == 23");
    let raw = PacketBuilder::tcp().ports(54321, 23).payload(b"login").build();
    driver.inject(&raw, Metadata::outbound().with_loopback(true));

    let mut pkt = session.receive().unwrap();
    assert!(PortRedirect::new(23, 5888).apply(&mut pkt).unwrap());
    pkt.update_checksums();
    session.send_packet(&pkt).unwrap();

    let (sent, meta) = driver.take_sent().remove(0);
    let expected = PacketBuilder::tcp().ports(54321, 5888).payload(b"login").build();
    assert_eq!(sent, expected);
    assert!(meta.is_loopback());
    assert!(meta.is_impostor());
}

/// TC-SES-11: a sniffing session and a diverting one both see the packet.
#[test]
fn tc_ses_11_sniff_and_divert() {
    let (divert, driver) = Divert::memory();
    let sniffer = divert
        .open_session(
            SessionConfig::new("true")
                .with_priority(100)
                .with_flags(OpenFlags::SNIFF),
        )
        .unwrap();
    let diverter = divert.open_session(SessionConfig::new("true")).unwrap();

    let raw = PacketBuilder::tcp().build();
    assert_eq!(driver.inject(&raw, Metadata::outbound()), 2);
    assert_eq!(sniffer.receive().unwrap().raw(), &raw[..]);
    assert_eq!(diverter.receive().unwrap().raw(), &raw[..]);
}

// =========================================================================
// Parameters
// =========================================================================

/// TC-SES-12: parameters by enum and by name.
#[test]
fn tc_ses_12_params() {
    let (_divert, _driver, session) = open("true");
    for p in Param::ALL {
        assert_eq!(session.get_param(p).unwrap(), p.default_value());
    }
    let param: Param = "queue_len".parse().unwrap();
    session.set_param(param, 2048).unwrap();
    assert_eq!(session.get_param(Param::QueueLength).unwrap(), 2048);

    let err = "queue_depth".parse::<Param>().unwrap_err();
    assert!(err.is_resource());

    let err = session.set_param(Param::QueueLength, 1).unwrap_err();
    assert!(matches!(err, DivertError::Resource { op: "set_param", .. }));
    assert_eq!(session.get_param(Param::QueueLength).unwrap(), 2048);
}
