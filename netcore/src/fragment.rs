//! IPv4 fragmentation and reassembly.
//!
//! Inbound fragments are parked in per-flow buckets keyed by
//! `(src, dst, ident, protocol)` until the flow is contiguous from offset
//! zero through a final fragment, then merged into one buffer. Buckets
//! that stay incomplete past the idle timeout are swept on the next call
//! into the store. Outbound, [`fragment_for_output`] splits a buffer that
//! exceeds the device MTU into independently routable fragments.
//!
//! The store expects the convention the input path establishes: the
//! network zone holds the IPv4 header, the transport zone the fragment
//! payload.

use std::sync::{Arc, Mutex};

use smoltcp::wire::{Ipv4Address, Ipv4Packet};
use tracing::{debug, trace};

use crate::buffer::{BufferFlags, PacketBuffer, Zone};
use crate::error::{Error, Result};
use crate::time::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FlowKey {
    src: Ipv4Address,
    dst: Ipv4Address,
    ident: u16,
    protocol: u8,
}

struct Fragment {
    /// Payload offset in bytes.
    offset: usize,
    len: usize,
    more: bool,
    nb: PacketBuffer,
}

struct Bucket {
    key: FlowKey,
    /// Fragments ordered by payload offset; ranges never overlap.
    fragments: Vec<Fragment>,
    /// Whether the final (more-fragments clear) piece has arrived.
    last_seen: bool,
    /// Clock time of the last activity on this flow.
    stamp: u64,
}

impl Bucket {
    /// Total payload size, valid only when the flow is complete.
    fn payload_len(&self) -> usize {
        self.fragments.iter().map(|f| f.len).sum()
    }

    fn is_complete(&self) -> bool {
        if !self.last_seen {
            return false;
        }
        let mut expected = 0;
        for frag in &self.fragments {
            if frag.offset != expected {
                return false;
            }
            expected += frag.len;
        }
        true
    }

    fn overlaps(&self, offset: usize, len: usize) -> bool {
        self.fragments
            .iter()
            .any(|f| offset < f.offset + f.len && f.offset < offset + len)
    }
}

/// Stack-wide reassembly state.
pub struct FragmentStore {
    buckets: Mutex<Vec<Bucket>>,
    clock: Arc<dyn Clock>,
    timeout_us: u64,
}

impl FragmentStore {
    pub fn new(clock: Arc<dyn Clock>, timeout_us: u64) -> Self {
        FragmentStore {
            buckets: Mutex::new(Vec::new()),
            clock,
            timeout_us,
        }
    }

    /// Take in one received fragment.
    ///
    /// The fragment's payload is copied into the matching bucket and `nb`
    /// is marked `ARRIVED` so the scheduler accounts it; duplicates and
    /// overlaps mark it `DROPPED` instead and leave the bucket untouched.
    /// When the fragment completes its flow the reassembled buffer is
    /// returned, carrying the full payload in its transport zone and the
    /// `NO_CHECKSUM` bit set (each piece was verified on arrival).
    pub fn accept(&self, nb: &mut PacketBuffer) -> Option<PacketBuffer> {
        let now = self.clock.now_us();

        let (key, offset, more) = match parse_fragment(nb.zone(Zone::Network)) {
            Ok(parsed) => parsed,
            Err(_) => {
                nb.set_flag(BufferFlags::DROPPED);
                return None;
            }
        };
        let len = nb.zone_len(Zone::Transport);
        if len == 0 {
            nb.set_flag(BufferFlags::DROPPED);
            return None;
        }

        let mut buckets = self.buckets.lock().unwrap();
        self.sweep_locked(&mut buckets, now);

        let idx = match buckets.iter().position(|b| b.key == key) {
            Some(idx) => idx,
            None => {
                buckets.push(Bucket {
                    key,
                    fragments: Vec::new(),
                    last_seen: false,
                    stamp: now,
                });
                buckets.len() - 1
            }
        };
        let bucket = &mut buckets[idx];
        bucket.stamp = now;

        if bucket.overlaps(offset, len) {
            debug!(ident = key.ident, offset, len, "overlapping fragment rejected");
            nb.set_flag(BufferFlags::DROPPED);
            return None;
        }

        // Park a copy; the original continues through the scheduler.
        let clone = nb.clone_zones(&[Zone::Network, Zone::Transport]);
        let pos = bucket
            .fragments
            .iter()
            .position(|f| f.offset > offset)
            .unwrap_or(bucket.fragments.len());
        bucket.fragments.insert(
            pos,
            Fragment {
                offset,
                len,
                more,
                nb: clone,
            },
        );
        if !more {
            bucket.last_seen = true;
        }
        nb.set_flag(BufferFlags::ARRIVED);
        trace!(ident = key.ident, offset, len, more, "fragment parked");

        if !bucket.is_complete() {
            return None;
        }
        let bucket = buckets.swap_remove(idx);
        drop(buckets);
        Some(reassemble(bucket))
    }

    /// Drop every bucket idle past the timeout, charging the parked
    /// fragments to their owning devices.
    pub fn expire(&self) {
        let now = self.clock.now_us();
        let mut buckets = self.buckets.lock().unwrap();
        self.sweep_locked(&mut buckets, now);
    }

    /// Incomplete flows currently parked.
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }

    fn sweep_locked(&self, buckets: &mut Vec<Bucket>, now: u64) {
        let timeout = self.timeout_us;
        buckets.retain(|bucket| {
            if now <= bucket.stamp + timeout {
                return true;
            }
            debug!(
                ident = bucket.key.ident,
                fragments = bucket.fragments.len(),
                "reassembly timed out"
            );
            for frag in &bucket.fragments {
                if let Some(dev) = frag.nb.owner() {
                    dev.count_dropped(1);
                }
            }
            false
        });
    }
}

/// Sanity-check a header-only network zone. `new_checked` is not usable
/// here: it validates `total_len` against the buffer, and the zone holds
/// just the header while `total_len` covers the whole datagram.
fn parse_header(header: &[u8]) -> Result<Ipv4Packet<&[u8]>> {
    let packet = Ipv4Packet::new_unchecked(header);
    if header.len() < 20
        || packet.version() != 4
        || (packet.header_len() as usize) < 20
        || (packet.header_len() as usize) > header.len()
    {
        return Err(Error::InvalidArgument("bad ipv4 header"));
    }
    Ok(packet)
}

fn parse_fragment(header: &[u8]) -> Result<(FlowKey, usize, bool)> {
    let packet = parse_header(header)?;
    let key = FlowKey {
        src: packet.src_addr(),
        dst: packet.dst_addr(),
        ident: packet.ident(),
        protocol: packet.next_header().into(),
    };
    Ok((key, packet.frag_offset() as usize, packet.more_frags()))
}

/// Merge a complete bucket into the first fragment's buffer.
fn reassemble(mut bucket: Bucket) -> PacketBuffer {
    let total = bucket.payload_len();
    let mut fragments = std::mem::take(&mut bucket.fragments);
    let first = fragments.remove(0);
    let mut nb = first.nb;

    // Growing the transport zone preserves the first fragment's payload.
    if nb.resize(Zone::Transport, total).is_err() {
        nb.set_flag(BufferFlags::DROPPED);
        return nb;
    }
    for frag in &fragments {
        let _ = nb.copy_into_at(Zone::Transport, frag.offset, frag.nb.zone(Zone::Transport));
    }

    {
        let mut packet = Ipv4Packet::new_unchecked(nb.zone_mut(Zone::Network));
        let header_len = packet.header_len() as usize;
        packet.set_total_len((header_len + total) as u16);
        packet.set_more_frags(false);
        packet.set_frag_offset(0);
        packet.fill_checksum();
    }

    nb.set_flag(BufferFlags::NO_CHECKSUM);
    nb.refresh_total();
    debug!(
        ident = bucket.key.ident,
        total, "reassembled fragmented datagram"
    );
    nb
}

/// Split `nb` into MTU-sized fragments, handing each to `emit` in offset
/// order. The payload is the transport and application zones back to back;
/// each fragment carries a patched copy of the original IPv4 header in its
/// network zone and its payload slice in its transport zone. Consumes the
/// original.
pub fn fragment_for_output(
    nb: PacketBuffer,
    mtu: usize,
    ident: u16,
    mut emit: impl FnMut(PacketBuffer),
) -> Result<()> {
    let header = nb.zone(Zone::Network);
    let packet = parse_header(header)?;
    let header_len = packet.header_len() as usize;
    if mtu <= header_len {
        return Err(Error::InvalidArgument("mtu below header size"));
    }
    // Fragment offsets are expressed in 8-byte units on the wire.
    let per = (mtu - header_len) & !7;
    if per == 0 {
        return Err(Error::InvalidArgument("mtu leaves no payload room"));
    }
    let header: Vec<u8> = header[..header_len].to_vec();

    let transport = nb.zone(Zone::Transport);
    let application = nb.zone(Zone::Application);
    let payload_len = transport.len() + application.len();
    if payload_len == 0 {
        return Err(Error::InvalidArgument("nothing to fragment"));
    }
    let count = payload_len.div_ceil(per);

    for i in 0..count {
        let offset = i * per;
        let size = per.min(payload_len - offset);

        // Template buffer: inherits protocol id and owning device.
        let mut frag = nb.clone_zones(&[]);
        frag.resize(Zone::Network, header_len)?;
        frag.copy_into(Zone::Network, &header)?;
        frag.resize(Zone::Transport, size)?;
        copy_span(&mut frag, transport, application, offset, size)?;

        {
            let mut packet = Ipv4Packet::new_unchecked(frag.zone_mut(Zone::Network));
            packet.set_ident(ident);
            packet.set_frag_offset(offset as u16);
            packet.set_more_frags(i + 1 < count);
            packet.set_total_len((header_len + size) as u16);
            packet.fill_checksum();
        }
        frag.refresh_total();
        emit(frag);
    }
    trace!(ident, count, payload_len, "fragmented outbound datagram");
    Ok(())
}

/// Copy `size` payload bytes starting at `offset` out of the logical
/// transport+application span into the fragment's transport zone.
fn copy_span(
    frag: &mut PacketBuffer,
    transport: &[u8],
    application: &[u8],
    offset: usize,
    size: usize,
) -> Result<()> {
    let mut written = 0;
    if offset < transport.len() {
        let take = size.min(transport.len() - offset);
        frag.copy_into(Zone::Transport, &transport[offset..offset + take])?;
        written = take;
    }
    if written < size {
        let app_off = (offset + written) - transport.len();
        frag.copy_into_at(
            Zone::Transport,
            written,
            &application[app_off..app_off + (size - written)],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{ipv4_fragment, ManualClock};

    const SRC: [u8; 4] = [10, 0, 0, 1];
    const DST: [u8; 4] = [10, 0, 0, 2];

    fn store(clock: &Arc<ManualClock>) -> FragmentStore {
        FragmentStore::new(clock.clone(), 5_000_000)
    }

    fn pieces() -> Vec<PacketBuffer> {
        vec![
            ipv4_fragment(SRC, DST, 99, 17, 0, true, &[1u8; 8]),
            ipv4_fragment(SRC, DST, 99, 17, 8, true, &[2u8; 8]),
            ipv4_fragment(SRC, DST, 99, 17, 16, false, &[3u8; 4]),
        ]
    }

    fn feed(store: &FragmentStore, mut parts: Vec<PacketBuffer>) -> Option<PacketBuffer> {
        let mut done = None;
        for nb in &mut parts {
            if let Some(out) = store.accept(nb) {
                done = Some(out);
            }
            assert!(nb.has_flag(BufferFlags::ARRIVED));
        }
        done
    }

    fn expected_payload() -> Vec<u8> {
        let mut want = vec![1u8; 8];
        want.extend_from_slice(&[2u8; 8]);
        want.extend_from_slice(&[3u8; 4]);
        want
    }

    #[test]
    fn test_reassembles_in_order() {
        let clock = Arc::new(ManualClock::new());
        let store = store(&clock);
        let out = feed(&store, pieces()).expect("complete");

        assert_eq!(out.zone(Zone::Transport), &expected_payload()[..]);
        assert!(out.has_flag(BufferFlags::NO_CHECKSUM));
        let packet = Ipv4Packet::new_unchecked(out.zone(Zone::Network));
        assert!(!packet.more_frags());
        assert_eq!(packet.total_len(), 20 + 20);
        assert_eq!(store.bucket_count(), 0);
    }

    #[test]
    fn test_reassembles_any_arrival_order() {
        // All six permutations of three fragments produce the same
        // datagram.
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let clock = Arc::new(ManualClock::new());
            let store = store(&clock);
            let mut parts = pieces();
            let mut done = None;
            for &i in &order {
                if let Some(out) = store.accept(&mut parts[i]) {
                    done = Some(out);
                }
            }
            let out = done.expect("complete");
            assert_eq!(out.zone(Zone::Transport), &expected_payload()[..]);
        }
    }

    #[test]
    fn test_incomplete_flow_stays_parked() {
        let clock = Arc::new(ManualClock::new());
        let store = store(&clock);
        let mut parts = pieces();
        assert!(store.accept(&mut parts[0]).is_none());
        assert!(store.accept(&mut parts[2]).is_none());
        assert_eq!(store.bucket_count(), 1);
    }

    #[test]
    fn test_duplicate_fragment_dropped() {
        let clock = Arc::new(ManualClock::new());
        let store = store(&clock);
        let mut first = ipv4_fragment(SRC, DST, 7, 17, 0, true, &[1u8; 8]);
        let mut dup = ipv4_fragment(SRC, DST, 7, 17, 0, true, &[9u8; 8]);

        assert!(store.accept(&mut first).is_none());
        assert!(store.accept(&mut dup).is_none());
        assert!(dup.has_flag(BufferFlags::DROPPED));
        assert!(!dup.has_flag(BufferFlags::ARRIVED));

        // The rest of the flow still completes with the first copy's data.
        let mut last = ipv4_fragment(SRC, DST, 7, 17, 8, false, &[2u8; 4]);
        let out = store.accept(&mut last).expect("complete");
        assert_eq!(&out.zone(Zone::Transport)[..8], &[1u8; 8]);
    }

    #[test]
    fn test_overlapping_fragment_dropped() {
        let clock = Arc::new(ManualClock::new());
        let store = store(&clock);
        let mut a = ipv4_fragment(SRC, DST, 8, 17, 0, true, &[1u8; 16]);
        let mut overlap = ipv4_fragment(SRC, DST, 8, 17, 8, false, &[9u8; 8]);

        store.accept(&mut a);
        assert!(store.accept(&mut overlap).is_none());
        assert!(overlap.has_flag(BufferFlags::DROPPED));
    }

    #[test]
    fn test_distinct_flows_do_not_mix() {
        let clock = Arc::new(ManualClock::new());
        let store = store(&clock);
        let mut a = ipv4_fragment(SRC, DST, 1, 17, 0, true, &[1u8; 8]);
        let mut b = ipv4_fragment(SRC, DST, 2, 17, 0, true, &[2u8; 8]);

        store.accept(&mut a);
        store.accept(&mut b);
        assert_eq!(store.bucket_count(), 2);
    }

    #[test]
    fn test_idle_bucket_swept() {
        let clock = Arc::new(ManualClock::new());
        let store = store(&clock);
        let mut a = ipv4_fragment(SRC, DST, 3, 17, 0, true, &[1u8; 8]);
        store.accept(&mut a);

        clock.advance(5_000_001);
        store.expire();
        assert_eq!(store.bucket_count(), 0);

        // A late sibling starts a fresh flow instead of completing the
        // swept one.
        let mut late = ipv4_fragment(SRC, DST, 3, 17, 8, false, &[2u8; 4]);
        assert!(store.accept(&mut late).is_none());
        assert_eq!(store.bucket_count(), 1);
    }

    #[test]
    fn test_fragment_for_output_round_trip() {
        let clock = Arc::new(ManualClock::new());
        let store = store(&clock);

        // 100-byte payload split across transport and application zones.
        let mut nb = PacketBuffer::alloc(Zone::Network, 20).unwrap();
        {
            let header = ipv4_fragment(SRC, DST, 0, 17, 0, false, &[0u8; 1]);
            nb.copy_into(Zone::Network, header.zone(Zone::Network)).unwrap();
        }
        nb.resize(Zone::Transport, 40).unwrap();
        let body: Vec<u8> = (0u8..100).collect();
        nb.copy_into(Zone::Transport, &body[..40]).unwrap();
        nb.resize(Zone::Application, 60).unwrap();
        nb.copy_into(Zone::Application, &body[40..]).unwrap();

        // MTU 60 leaves 40 payload bytes per fragment.
        let mut frags = Vec::new();
        fragment_for_output(nb, 60, 42, |f| frags.push(f)).unwrap();
        assert_eq!(frags.len(), 3);

        for (i, frag) in frags.iter().enumerate() {
            let packet = Ipv4Packet::new_unchecked(frag.zone(Zone::Network));
            assert_eq!(packet.ident(), 42);
            assert_eq!(packet.frag_offset() as usize, i * 40);
            assert_eq!(packet.more_frags(), i < 2);
        }
        assert_eq!(frags[2].zone_len(Zone::Transport), 20);

        // Feeding the fragments back reassembles the original payload.
        let mut done = None;
        for frag in &mut frags {
            if let Some(out) = store.accept(frag) {
                done = Some(out);
            }
        }
        assert_eq!(done.expect("complete").zone(Zone::Transport), &body[..]);
    }

    #[test]
    fn test_fragment_for_output_rejects_tiny_mtu() {
        let header = ipv4_fragment(SRC, DST, 0, 17, 0, false, &[5u8; 8]);
        assert!(fragment_for_output(header, 20, 1, |_| {}).is_err());
    }
}
