//! Test support: a scriptable in-memory driver, a hand-cranked clock, and
//! packet builders. Used by the module tests and by the integration tests
//! under `tests/`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, IpProtocol, Ipv4Address, Ipv4Packet,
};

use crate::buffer::{PacketBuffer, Zone};
use crate::device::{Driver, LinkOutput, NetDevice, ProtocolHandler, Receive, WriteOutcome};
use crate::time::Clock;

/// Clock that only moves when a test says so.
#[derive(Default)]
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, us: u64) {
        self.now_us.fetch_add(us, Ordering::SeqCst);
    }

    pub fn set(&self, us: u64) {
        self.now_us.store(us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct MemDriverShared {
    rx: VecDeque<(Vec<u8>, u16)>,
    tx: Vec<Vec<u8>>,
    outcomes: VecDeque<WriteOutcome>,
    attempts: usize,
}

/// In-memory driver; clones share one frame store, so a test keeps a
/// handle while the device owns the boxed copy.
#[derive(Clone, Default)]
pub struct MemDriver {
    shared: Arc<Mutex<MemDriverShared>>,
}

impl MemDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a received frame with the protocol it should demux to.
    pub fn push_rx(&self, frame: Vec<u8>, protocol: u16) {
        self.shared.lock().unwrap().rx.push_back((frame, protocol));
    }

    pub fn rx_pending(&self) -> usize {
        self.shared.lock().unwrap().rx.len()
    }

    /// Frames written so far; clears the record.
    pub fn take_tx(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.shared.lock().unwrap().tx)
    }

    /// Number of `write` calls observed, successful or not.
    pub fn write_attempts(&self) -> usize {
        self.shared.lock().unwrap().attempts
    }

    /// Make the next write return [`WriteOutcome::Retry`].
    pub fn defer_next_write(&self) {
        self.shared
            .lock()
            .unwrap()
            .outcomes
            .push_back(WriteOutcome::Retry);
    }

    /// Make the next write return [`WriteOutcome::Failed`].
    pub fn fail_next_write(&self) {
        self.shared
            .lock()
            .unwrap()
            .outcomes
            .push_back(WriteOutcome::Failed);
    }
}

impl Driver for MemDriver {
    fn available(&mut self) -> usize {
        self.shared.lock().unwrap().rx.len()
    }

    fn read(&mut self, dev: &Arc<NetDevice>, max: usize) -> usize {
        let mut pushed = 0;
        for _ in 0..max {
            let frame = self.shared.lock().unwrap().rx.pop_front();
            let Some((frame, protocol)) = frame else { break };
            let Ok(mut nb) = PacketBuffer::from_frame(&frame, protocol) else {
                continue;
            };
            nb.set_owner(dev);
            dev.add_backlog(nb);
            pushed += 1;
        }
        pushed
    }

    fn write(&mut self, frame: &[u8]) -> WriteOutcome {
        let mut shared = self.shared.lock().unwrap();
        shared.attempts += 1;
        match shared.outcomes.pop_front() {
            Some(WriteOutcome::Sent) | None => {
                shared.tx.push(frame.to_vec());
                WriteOutcome::Sent
            }
            Some(outcome) => outcome,
        }
    }
}

/// Counts invocations; usable as a dispatch-table handler or a receive
/// entry point.
#[derive(Default)]
pub struct CountingHandler {
    hits: AtomicUsize,
}

impl CountingHandler {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl ProtocolHandler for CountingHandler {
    fn handle(&self, _dev: &Arc<NetDevice>, _nb: &mut PacketBuffer) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

impl Receive for CountingHandler {
    fn receive(&self, _dev: &Arc<NetDevice>, nb: &mut PacketBuffer) {
        self.hits.fetch_add(1, Ordering::SeqCst);
        nb.set_flag(crate::buffer::BufferFlags::ARRIVED);
    }
}

/// Link output that records instead of framing.
#[derive(Default)]
pub struct CaptureLink {
    sent: Mutex<Vec<(Vec<u8>, PacketBuffer)>>,
}

impl CaptureLink {
    /// `(link_addr, buffer)` pairs in transmission order; clears the
    /// record.
    pub fn take(&self) -> Vec<(Vec<u8>, PacketBuffer)> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

impl LinkOutput for CaptureLink {
    fn transmit(&self, _dev: &Arc<NetDevice>, nb: PacketBuffer, link_addr: &[u8]) {
        self.sent.lock().unwrap().push((link_addr.to_vec(), nb));
    }
}

/// Encode an Ethernet II frame on the wire.
pub fn ethernet_frame(dst: [u8; 6], src: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; 14 + payload.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut bytes);
    frame.set_dst_addr(EthernetAddress::from_bytes(&dst));
    frame.set_src_addr(EthernetAddress::from_bytes(&src));
    frame.set_ethertype(EthernetProtocol::from(ethertype));
    frame.payload_mut().copy_from_slice(payload);
    bytes
}

/// Build a buffer shaped like the IPv4 input path leaves it: a 20-byte
/// header in the network zone, the fragment payload in the transport zone.
/// `offset` is the payload offset in bytes and must be a multiple of 8.
pub fn ipv4_fragment(
    src: [u8; 4],
    dst: [u8; 4],
    ident: u16,
    protocol: u8,
    offset: u16,
    more: bool,
    payload: &[u8],
) -> PacketBuffer {
    let mut nb = PacketBuffer::alloc(Zone::Network, 20).unwrap();
    {
        let mut packet = Ipv4Packet::new_unchecked(nb.zone_mut(Zone::Network));
        packet.set_version(4);
        packet.set_header_len(20);
        packet.set_dscp(0);
        packet.set_ecn(0);
        packet.set_total_len(20 + payload.len() as u16);
        packet.set_ident(ident);
        packet.set_dont_frag(false);
        packet.set_more_frags(more);
        packet.set_frag_offset(offset);
        packet.set_hop_limit(64);
        packet.set_next_header(IpProtocol::from(protocol));
        packet.set_src_addr(Ipv4Address::from(src));
        packet.set_dst_addr(Ipv4Address::from(dst));
        packet.fill_checksum();
    }
    nb.resize(Zone::Transport, payload.len()).unwrap();
    nb.copy_into(Zone::Transport, payload).unwrap();
    nb
}
