//! Address resolution cache.
//!
//! Maps protocol addresses (e.g. IPv4) to link-layer addresses per device.
//! Output for an unresolved destination is parked on the cache entry while
//! a [`Resolver`] (e.g. ARP) asks the network; once the answer lands, every
//! parked buffer is flushed through the device's link output in arrival
//! order. Entries that stay unresolved past their deadline or run out of
//! retries are dropped together with their parked traffic.
//!
//! The cache itself is plain data guarded by the device state lock.
//! Resolver callbacks and flushes always run with that lock released.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::buffer::{BufferQueue, PacketBuffer};
use crate::device::NetDevice;

/// Protocol that can obtain the link-layer address for a protocol address,
/// typically by putting a request frame on the wire. Called without any
/// device lock held; completion arrives later via
/// [`NetDevice::resolution_completed`].
pub trait Resolver: Send + Sync {
    fn resolve(&self, dev: &Arc<NetDevice>, protocol_addr: &[u8]);
}

enum ResolveState {
    /// The link address is known.
    Resolved,
    /// A resolver is working on this entry.
    Unfinished {
        resolver: Arc<dyn Resolver>,
        retries_left: u32,
        /// Clock time of the last resolver invocation; `None` until the
        /// first maintenance pass, which therefore fires immediately.
        last_attempt: Option<u64>,
        /// Absolute deadline after which the entry and its parked buffers
        /// are dropped.
        expires_at: u64,
    },
}

struct CacheEntry {
    protocol_addr: Vec<u8>,
    link_addr: Vec<u8>,
    pending: BufferQueue,
    state: ResolveState,
}

/// Per-device resolution table. All methods run under the device state
/// lock; none of them call out.
pub(crate) struct ResolutionCache {
    entries: Vec<CacheEntry>,
}

impl ResolutionCache {
    pub(crate) fn new() -> Self {
        ResolutionCache {
            entries: Vec::new(),
        }
    }

    fn find(&mut self, protocol_addr: &[u8]) -> Option<&mut CacheEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.protocol_addr == protocol_addr)
    }

    /// Insert or refresh a resolved mapping.
    fn put_resolved(&mut self, protocol_addr: &[u8], link_addr: &[u8]) {
        match self.find(protocol_addr) {
            Some(entry) => {
                entry.link_addr = link_addr.to_vec();
                entry.state = ResolveState::Resolved;
            }
            None => self.entries.push(CacheEntry {
                protocol_addr: protocol_addr.to_vec(),
                link_addr: link_addr.to_vec(),
                pending: BufferQueue::new(),
                state: ResolveState::Resolved,
            }),
        }
    }

    fn remove(&mut self, protocol_addr: &[u8]) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.protocol_addr != protocol_addr);
        self.entries.len() != before
    }

    fn lookup(&self, protocol_addr: &[u8]) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|e| e.protocol_addr == protocol_addr)
            .filter(|e| matches!(e.state, ResolveState::Resolved))
            .map(|e| e.link_addr.as_slice())
    }
}

/// Work collected under the lock, executed after it is released.
struct MaintenanceWork {
    requests: Vec<(Arc<dyn Resolver>, Vec<u8>)>,
    flushes: Vec<(Vec<u8>, BufferQueue)>,
    dropped: u64,
}

impl NetDevice {
    /// Record a resolved mapping, e.g. from a gratuitous announcement.
    pub fn add_resolution(&self, protocol_addr: &[u8], link_addr: &[u8]) {
        let mut st = self.state.lock().unwrap();
        st.cache.put_resolved(protocol_addr, link_addr);
    }

    /// Complete an in-flight resolution. Parked buffers are not flushed
    /// here; the next maintenance pass sends them, keeping this safe to
    /// call from a protocol handler. Returns whether an entry existed.
    pub fn resolution_completed(self: &Arc<Self>, protocol_addr: &[u8], link_addr: &[u8]) -> bool {
        let hit = {
            let mut st = self.state.lock().unwrap();
            match st.cache.find(protocol_addr) {
                Some(entry) => {
                    entry.link_addr = link_addr.to_vec();
                    entry.state = ResolveState::Resolved;
                    true
                }
                None => {
                    st.cache.put_resolved(protocol_addr, link_addr);
                    false
                }
            }
        };
        trace!(device = %self.name(), updated = hit, "resolution completed");
        hit
    }

    /// Drop a cache entry and everything parked on it.
    pub fn remove_resolution(&self, protocol_addr: &[u8]) -> bool {
        let mut st = self.state.lock().unwrap();
        match st.cache.find(protocol_addr) {
            Some(entry) => {
                let parked = entry.pending.len() as u64;
                st.cache.remove(protocol_addr);
                st.count_dropped(parked);
                true
            }
            None => false,
        }
    }

    /// Resolved link address for a protocol address, if known.
    pub fn lookup_resolution(&self, protocol_addr: &[u8]) -> Option<Vec<u8>> {
        let st = self.state.lock().unwrap();
        st.cache.lookup(protocol_addr).map(<[u8]>::to_vec)
    }

    /// Send `nb` to `protocol_addr`, resolving the link address first if
    /// necessary.
    ///
    /// With a resolved entry the buffer is framed and queued immediately
    /// and the call returns `true`. Otherwise the buffer is parked on the
    /// (possibly fresh) entry, `resolver` is charged with answering, and
    /// the call returns `false`; the buffer goes out when the answer
    /// arrives or is dropped when the entry expires.
    pub fn resolve_output(
        self: &Arc<Self>,
        nb: PacketBuffer,
        protocol_addr: &[u8],
        resolver: &Arc<dyn Resolver>,
    ) -> bool {
        let now = self.clock().now_us();
        let mut st = self.state.lock().unwrap();
        let timeout = st.tunables.resolve_timeout_us;
        let retries = st.tunables.resolve_retries;

        if let Some(entry) = st.cache.find(protocol_addr) {
            match entry.state {
                ResolveState::Resolved => {
                    let link_addr = entry.link_addr.clone();
                    drop(st);
                    self.transmit_link(nb, &link_addr);
                    return true;
                }
                ResolveState::Unfinished {
                    ref mut expires_at, ..
                } => {
                    // New traffic extends the entry's lease.
                    *expires_at = now + timeout;
                    entry.pending.push_back(nb);
                    return false;
                }
            }
        }

        let mut pending = BufferQueue::new();
        pending.push_back(nb);
        st.cache.entries.push(CacheEntry {
            protocol_addr: protocol_addr.to_vec(),
            link_addr: Vec::new(),
            pending,
            state: ResolveState::Unfinished {
                resolver: resolver.clone(),
                retries_left: retries,
                last_attempt: None,
                expires_at: now + timeout,
            },
        });
        debug!(device = %self.name(), "destination unresolved, parking buffer");
        false
    }

    /// One pass over the resolution cache: expire dead entries, fire due
    /// retries, flush traffic parked on freshly resolved entries. Runs on
    /// every device poll.
    pub(crate) fn maintain_cache(self: &Arc<Self>) {
        let now = self.clock().now_us();
        let work = {
            let mut st = self.state.lock().unwrap();
            let retry_us = st.tunables.resolve_retry_us;
            let mut work = MaintenanceWork {
                requests: Vec::new(),
                flushes: Vec::new(),
                dropped: 0,
            };

            st.cache.entries.retain_mut(|entry| match entry.state {
                ResolveState::Unfinished {
                    ref resolver,
                    ref mut retries_left,
                    ref mut last_attempt,
                    expires_at,
                } => {
                    if now > expires_at || *retries_left == 0 {
                        work.dropped += entry.pending.len() as u64;
                        return false;
                    }
                    let due = match *last_attempt {
                        None => true,
                        Some(t) => now >= t + retry_us,
                    };
                    if due {
                        work.requests
                            .push((resolver.clone(), entry.protocol_addr.clone()));
                        *retries_left -= 1;
                        *last_attempt = Some(now);
                    }
                    true
                }
                ResolveState::Resolved => {
                    if !entry.pending.is_empty() {
                        work.flushes.push((
                            entry.link_addr.clone(),
                            std::mem::take(&mut entry.pending),
                        ));
                    }
                    true
                }
            });
            st.count_dropped(work.dropped);
            work
        };

        if work.dropped > 0 {
            debug!(device = %self.name(), count = work.dropped, "dropped unresolvable buffers");
        }
        for (resolver, addr) in work.requests {
            resolver.resolve(self, &addr);
        }
        for (link_addr, mut pending) in work.flushes {
            while let Some(nb) = pending.pop_front() {
                self.transmit_link(nb, &link_addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::buffer::Zone;
    use crate::device::{buffer_for_payload, NetDeviceBuilder};
    use crate::test_util::{CaptureLink, ManualClock, MemDriver};

    #[derive(Default)]
    struct RecordingResolver {
        asked: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingResolver {
        fn asked(&self) -> Vec<Vec<u8>> {
            self.asked.lock().unwrap().clone()
        }
    }

    impl Resolver for RecordingResolver {
        fn resolve(&self, _dev: &Arc<NetDevice>, protocol_addr: &[u8]) {
            self.asked.lock().unwrap().push(protocol_addr.to_vec());
        }
    }

    const IP: [u8; 4] = [10, 0, 0, 2];
    const MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x22];

    fn device() -> (Arc<NetDevice>, Arc<ManualClock>, Arc<CaptureLink>) {
        let clock = Arc::new(ManualClock::new());
        let link = Arc::new(CaptureLink::default());
        let dev = NetDeviceBuilder::new("res0", Box::new(MemDriver::new()))
            .clock(clock.clone())
            .link_output(link.clone())
            .build();
        (dev, clock, link)
    }

    #[test]
    fn test_resolved_entry_transmits_immediately() {
        let (dev, _clock, link) = device();
        dev.add_resolution(&IP, &MAC);

        let resolver: Arc<dyn Resolver> = Arc::new(RecordingResolver::default());
        let sent = dev.resolve_output(
            buffer_for_payload(&[1, 2, 3], 0x0800).unwrap(),
            &IP,
            &resolver,
        );

        assert!(sent);
        let out = link.take();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, MAC.to_vec());
    }

    #[test]
    fn test_unresolved_parks_and_requests_once() {
        let (dev, clock, link) = device();
        let resolver = Arc::new(RecordingResolver::default());
        let dyn_resolver: Arc<dyn Resolver> = resolver.clone();

        let sent = dev.resolve_output(
            buffer_for_payload(&[1], 0x0800).unwrap(),
            &IP,
            &dyn_resolver,
        );
        assert!(!sent);
        assert!(link.take().is_empty());

        // First maintenance pass fires the request immediately.
        dev.maintain_cache();
        assert_eq!(resolver.asked(), vec![IP.to_vec()]);

        // A second pass inside the retry window does not.
        clock.advance(500_000);
        dev.maintain_cache();
        assert_eq!(resolver.asked().len(), 1);

        // Past the retry spacing it fires again.
        clock.advance(600_000);
        dev.maintain_cache();
        assert_eq!(resolver.asked().len(), 2);
    }

    #[test]
    fn test_completion_flushes_pending_in_order() {
        let (dev, _clock, link) = device();
        let resolver: Arc<dyn Resolver> = Arc::new(RecordingResolver::default());

        for byte in [1u8, 2, 3] {
            dev.resolve_output(
                buffer_for_payload(&[byte], 0x0800).unwrap(),
                &IP,
                &resolver,
            );
        }
        assert!(dev.resolution_completed(&IP, &MAC));

        dev.maintain_cache();
        let out = link.take();
        assert_eq!(out.len(), 3);
        for (i, (addr, nb)) in out.iter().enumerate() {
            assert_eq!(addr, &MAC.to_vec());
            assert_eq!(nb.zone(Zone::Transport), &[i as u8 + 1]);
        }

        // The entry persists; later output goes straight out.
        assert!(dev.resolve_output(
            buffer_for_payload(&[9], 0x0800).unwrap(),
            &IP,
            &resolver,
        ));
        assert_eq!(link.take().len(), 1);
    }

    #[test]
    fn test_timeout_drops_entry_and_pending() {
        let (dev, clock, link) = device();
        let resolver = Arc::new(RecordingResolver::default());
        let dyn_resolver: Arc<dyn Resolver> = resolver.clone();

        dev.resolve_output(
            buffer_for_payload(&[1], 0x0800).unwrap(),
            &IP,
            &dyn_resolver,
        );
        clock.advance(4_500_001);
        dev.maintain_cache();

        assert_eq!(dev.dropped(), 1);
        assert!(dev.lookup_resolution(&IP).is_none());
        assert!(link.take().is_empty());

        // The entry is gone; a late answer creates a fresh resolved one.
        dev.resolution_completed(&IP, &MAC);
        assert_eq!(dev.lookup_resolution(&IP), Some(MAC.to_vec()));
    }

    #[test]
    fn test_retry_budget_exhaustion_drops_entry() {
        let (dev, clock, _link) = device();
        let resolver = Arc::new(RecordingResolver::default());
        let dyn_resolver: Arc<dyn Resolver> = resolver.clone();

        dev.resolve_output(
            buffer_for_payload(&[1], 0x0800).unwrap(),
            &IP,
            &dyn_resolver,
        );
        // Four attempts are allowed; the fifth pass finds the budget empty
        // and evicts the entry before the deadline.
        for _ in 0..4 {
            dev.maintain_cache();
            clock.advance(1_000_001);
        }
        assert_eq!(resolver.asked().len(), 4);

        dev.maintain_cache();
        assert_eq!(dev.dropped(), 1);
        assert!(resolver.asked().len() == 4);
    }

    #[test]
    fn test_zero_retry_budget_drops_on_first_pass() {
        let clock = Arc::new(ManualClock::new());
        let link = Arc::new(CaptureLink::default());
        let dev = NetDeviceBuilder::new("res1", Box::new(MemDriver::new()))
            .clock(clock.clone())
            .link_output(link.clone())
            .core_config(&crate::config::CoreConfig {
                resolve_retries: 0,
                ..crate::config::CoreConfig::default()
            })
            .build();
        let resolver = Arc::new(RecordingResolver::default());
        let dyn_resolver: Arc<dyn Resolver> = resolver.clone();

        for byte in [1u8, 2] {
            dev.resolve_output(
                buffer_for_payload(&[byte], 0x0800).unwrap(),
                &IP,
                &dyn_resolver,
            );
        }
        dev.maintain_cache();

        // No attempt is ever made and every parked buffer is dropped.
        assert!(resolver.asked().is_empty());
        assert_eq!(dev.dropped(), 2);
        assert!(dev.lookup_resolution(&IP).is_none());
    }

    #[test]
    fn test_remove_resolution_counts_parked() {
        let (dev, _clock, _link) = device();
        let resolver: Arc<dyn Resolver> = Arc::new(RecordingResolver::default());
        dev.resolve_output(
            buffer_for_payload(&[1], 0x0800).unwrap(),
            &IP,
            &resolver,
        );
        dev.resolve_output(
            buffer_for_payload(&[2], 0x0800).unwrap(),
            &IP,
            &resolver,
        );

        assert!(dev.remove_resolution(&IP));
        assert_eq!(dev.dropped(), 2);
        assert!(!dev.remove_resolution(&IP));
    }
}
