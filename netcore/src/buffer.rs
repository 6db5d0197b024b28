//! Layered packet buffer.
//!
//! A [`PacketBuffer`] carries one frame through the stack as four named
//! zones (link, network, transport, application). Each protocol layer
//! resizes and fills its own zone in place; nothing is re-parented between
//! layers. A zone either owns a heap allocation or is a view into the link
//! zone's allocation (the layout produced by [`PacketBuffer::linearize`]),
//! so a borrowed zone can never be freed on its own.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use bitflags::bitflags;

use crate::device::NetDevice;
use crate::error::{Error, Result};

bitflags! {
    /// Buffer status bits. All bits are independent; the scheduler reads
    /// them after each handler call to classify the buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferFlags: u32 {
        /// Processing completed; the buffer reached its destination layer.
        const ARRIVED = 1 << 0;
        /// The buffer was discarded; counted in the device drop statistics.
        const DROPPED = 1 << 1;
        /// Processing is incomplete; requeue at the backlog tail.
        const RETRY = 1 << 2;
        /// The buffer is on the receive path.
        const RX = 1 << 3;
        /// The buffer was received at some point (survives the RX bit).
        const WAS_RX = 1 << 4;
        /// An upper layer is recycling the buffer; the scheduler must not
        /// drop it.
        const REUSE = 1 << 5;
        /// A layer retains the buffer for retransmission; the scheduler
        /// must not drop it.
        const KEEP = 1 << 6;
        /// All four zones are views into one contiguous link allocation.
        const LINEAR = 1 << 7;
        /// Destination classification.
        const UNICAST = 1 << 8;
        const MULTICAST = 1 << 9;
        const BROADCAST = 1 << 10;
        /// Checksum validation already happened (e.g. per-fragment); the
        /// transport layer must not verify it again.
        const NO_CHECKSUM = 1 << 11;
    }
}

/// Largest zone the buffer layer will allocate; the IPv4 total-length
/// ceiling, so no reassembled datagram can exceed it either.
pub const MAX_ZONE_SIZE: usize = 65_535;

/// One of the four named buffer regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Zone {
    Link,
    Network,
    Transport,
    Application,
}

impl Zone {
    /// All zones in wire order.
    pub const ALL: [Zone; 4] = [Zone::Link, Zone::Network, Zone::Transport, Zone::Application];
}

/// Backing storage of one zone.
///
/// `View` regions reference the link zone's `Owned` allocation and are the
/// only aliasing form; they carry no allocation of their own and are
/// silently detached (never freed) on release.
#[derive(Debug, Clone, Default)]
enum Region {
    #[default]
    Empty,
    /// Heap allocation owned by this zone. `len <= data.len()`; shrinking
    /// only moves `len` so the allocation identity is stable.
    Owned { data: Vec<u8>, len: usize },
    /// Sub-slice of the link zone's allocation.
    View { offset: usize, len: usize },
}

impl Region {
    fn len(&self) -> usize {
        match self {
            Region::Empty => 0,
            Region::Owned { len, .. } => *len,
            Region::View { len, .. } => *len,
        }
    }
}

/// Shape of a region, copied out to sidestep aliasing borrows.
enum Slot {
    Empty,
    Owned,
    View(usize, usize),
}

/// A mutable, region-addressed packet container.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    link: Region,
    network: Region,
    transport: Region,
    application: Region,

    flags: BufferFlags,
    /// Upper-layer protocol identifier; `0` means no external listener is
    /// interested and the demultiplexer skips the buffer.
    protocol: u16,
    /// Device that received this buffer or must transmit it. Lifetime is
    /// independent of the device.
    owner: Option<Weak<NetDevice>>,
    /// Cached total byte count, refreshed by the scheduler.
    total: usize,
    /// Highest TCP sequence number covered by this buffer.
    sequence_end: u32,
    /// Receive timestamp in clock microseconds.
    timestamp: Option<u64>,
}

impl PacketBuffer {
    /// Allocate a buffer with one sized zone; the others stay empty.
    pub fn alloc(zone: Zone, size: usize) -> Result<Self> {
        let mut nb = PacketBuffer::default();
        nb.resize(zone, size)?;
        Ok(nb)
    }

    /// Wrap a received wire frame: the link zone is sized to the frame
    /// and the buffer is marked as being on the receive path.
    pub fn from_frame(frame: &[u8], protocol: u16) -> Result<Self> {
        let mut nb = Self::alloc(Zone::Link, frame.len())?;
        nb.copy_into(Zone::Link, frame)?;
        nb.protocol = protocol;
        nb.flags |= BufferFlags::RX;
        Ok(nb)
    }

    fn region(&self, zone: Zone) -> &Region {
        match zone {
            Zone::Link => &self.link,
            Zone::Network => &self.network,
            Zone::Transport => &self.transport,
            Zone::Application => &self.application,
        }
    }

    fn region_mut(&mut self, zone: Zone) -> &mut Region {
        match zone {
            Zone::Link => &mut self.link,
            Zone::Network => &mut self.network,
            Zone::Transport => &mut self.transport,
            Zone::Application => &mut self.application,
        }
    }

    fn slot(&self, zone: Zone) -> Slot {
        match self.region(zone) {
            Region::Empty => Slot::Empty,
            Region::Owned { .. } => Slot::Owned,
            Region::View { offset, len } => Slot::View(*offset, *len),
        }
    }

    /// Logical length of a zone in bytes.
    pub fn zone_len(&self, zone: Zone) -> usize {
        self.region(zone).len()
    }

    /// Whether a zone currently owns its allocation.
    pub fn zone_owned(&self, zone: Zone) -> bool {
        matches!(self.region(zone), Region::Owned { .. })
    }

    /// Read access to a zone's bytes.
    pub fn zone(&self, zone: Zone) -> &[u8] {
        match self.slot(zone) {
            Slot::Empty => &[],
            Slot::Owned => match self.region(zone) {
                Region::Owned { data, len } => &data[..*len],
                _ => unreachable!(),
            },
            Slot::View(offset, len) => match &self.link {
                Region::Owned { data, .. } => &data[offset..offset + len],
                _ => &[],
            },
        }
    }

    /// Write access to a zone's bytes.
    pub fn zone_mut(&mut self, zone: Zone) -> &mut [u8] {
        match self.slot(zone) {
            Slot::Empty => &mut [],
            Slot::Owned => match self.region_mut(zone) {
                Region::Owned { data, len } => &mut data[..*len],
                _ => unreachable!(),
            },
            Slot::View(offset, len) => match &mut self.link {
                Region::Owned { data, .. } => &mut data[offset..offset + len],
                _ => &mut [],
            },
        }
    }

    /// Resize a zone.
    ///
    /// If the zone's current capacity already covers `size` only the
    /// logical length moves; no reallocation happens on the hot datapath.
    /// Growth beyond capacity (re)allocates the zone to exactly `size`,
    /// making it owned. Grown bytes start out zeroed, and growing the link
    /// zone of a linearized buffer first detaches the zones aliasing it so
    /// the new header bytes cannot overlap their data.
    pub fn resize(&mut self, zone: Zone, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-sized zone resize"));
        }
        if size > MAX_ZONE_SIZE {
            return Err(Error::ResourceExhausted);
        }

        if zone == Zone::Link
            && self.flags.contains(BufferFlags::LINEAR)
            && size > self.link.len()
        {
            self.detach_views();
        }

        match self.slot(zone) {
            Slot::Owned => {
                if let Region::Owned { data, len } = self.region_mut(zone) {
                    if data.len() >= size {
                        if *len < size {
                            data[*len..size].fill(0);
                        }
                        *len = size;
                        return Ok(());
                    }
                    data.resize(size, 0);
                    *len = size;
                }
            }
            Slot::Empty => {
                *self.region_mut(zone) = Region::Owned {
                    data: vec![0; size],
                    len: size,
                };
            }
            Slot::View(offset, len) => {
                if size <= len {
                    *self.region_mut(zone) = Region::View { offset, len: size };
                    return Ok(());
                }
                // Growing an aliased zone detaches it from the link
                // allocation, so the buffer is no longer linear.
                *self.region_mut(zone) = Region::Owned {
                    data: vec![0; size],
                    len: size,
                };
                if zone != Zone::Link {
                    self.flags.remove(BufferFlags::LINEAR);
                }
            }
        }
        Ok(())
    }

    /// Copy every view zone out of the link allocation into its own
    /// storage and drop the linear layout.
    fn detach_views(&mut self) {
        for zone in [Zone::Network, Zone::Transport, Zone::Application] {
            if let Slot::View(..) = self.slot(zone) {
                let bytes = self.zone(zone).to_vec();
                *self.region_mut(zone) = if bytes.is_empty() {
                    Region::Empty
                } else {
                    let len = bytes.len();
                    Region::Owned { data: bytes, len }
                };
            }
        }
        self.flags.remove(BufferFlags::LINEAR);
    }

    /// Copy `src` into the start of an already-sized zone.
    pub fn copy_into(&mut self, zone: Zone, src: &[u8]) -> Result<()> {
        self.copy_into_at(zone, 0, src)
    }

    /// Copy `src` into an already-sized zone at `offset`.
    pub fn copy_into_at(&mut self, zone: Zone, offset: usize, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Err(Error::InvalidArgument("empty copy source"));
        }
        let dst = self.zone_mut(zone);
        if dst.len() < offset + src.len() {
            return Err(Error::InvalidArgument("copy exceeds zone length"));
        }
        dst[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Duplicate the selected zones' bytes into an independent buffer.
    ///
    /// The clone owns every copied zone outright; protocol id and owning
    /// device carry over, status flags do not.
    pub fn clone_zones(&self, zones: &[Zone]) -> Self {
        let mut nb = PacketBuffer {
            protocol: self.protocol,
            owner: self.owner.clone(),
            ..Default::default()
        };
        for &zone in zones {
            let bytes = self.zone(zone);
            if bytes.is_empty() {
                continue;
            }
            *nb.region_mut(zone) = Region::Owned {
                data: bytes.to_vec(),
                len: bytes.len(),
            };
        }
        nb.total = nb.compute_total();
        nb
    }

    /// Collapse all four zones into one contiguous link-owned allocation.
    ///
    /// Idempotent. Physical drivers accept a single contiguous span, so
    /// every buffer passes through here before `write`. Afterwards the
    /// link zone owns the full frame and the other zones are views in
    /// `link,network,transport,application` order.
    pub fn linearize(&mut self) {
        if self.flags.contains(BufferFlags::LINEAR) {
            return;
        }

        let link_len = self.link.len();
        let net_len = self.network.len();
        let trans_len = self.transport.len();
        let app_len = self.application.len();
        let total = link_len + net_len + trans_len + app_len;

        let mut whole = Vec::with_capacity(total);
        for zone in Zone::ALL {
            whole.extend_from_slice(self.zone(zone));
        }

        self.link = Region::Owned {
            data: whole,
            len: link_len,
        };
        self.network = Region::View {
            offset: link_len,
            len: net_len,
        };
        self.transport = Region::View {
            offset: link_len + net_len,
            len: trans_len,
        };
        self.application = Region::View {
            offset: link_len + net_len + trans_len,
            len: app_len,
        };
        self.flags |= BufferFlags::LINEAR;
    }

    /// Split an owned link zone in place: the first `header_len` bytes
    /// stay the link zone, the rest becomes the network zone as a view
    /// into the same allocation. The input path uses this to peel the
    /// frame header off a received buffer without copying.
    pub fn split_link(&mut self, header_len: usize) -> Result<()> {
        let link_len = self.link.len();
        if header_len == 0 || header_len > link_len {
            return Err(Error::InvalidArgument("header exceeds link zone"));
        }
        let Region::Owned { len, .. } = &mut self.link else {
            return Err(Error::InvalidArgument("link zone not owned"));
        };
        *len = header_len;
        self.network = Region::View {
            offset: header_len,
            len: link_len - header_len,
        };
        self.transport = Region::Empty;
        self.application = Region::Empty;
        self.flags |= BufferFlags::LINEAR;
        Ok(())
    }

    /// The full contiguous frame of a linearized buffer.
    pub fn frame_bytes(&self) -> Option<&[u8]> {
        if !self.flags.contains(BufferFlags::LINEAR) {
            return None;
        }
        match &self.link {
            Region::Owned { data, .. } => Some(&data[..]),
            _ => None,
        }
    }

    /// Release one zone. Owned allocations are freed; views are merely
    /// detached. Releasing the link zone of a linearized buffer also
    /// detaches the zones aliasing it.
    pub fn release_zone(&mut self, zone: Zone) {
        if zone == Zone::Link && matches!(self.link, Region::Owned { .. }) {
            for z in [Zone::Network, Zone::Transport, Zone::Application] {
                if matches!(self.region(z), Region::View { .. }) {
                    *self.region_mut(z) = Region::Empty;
                }
            }
            self.flags.remove(BufferFlags::LINEAR);
        }
        *self.region_mut(zone) = Region::Empty;
    }

    /// Release every zone. Safe to call repeatedly; zones that do not own
    /// an allocation are never freed.
    pub fn release(&mut self) {
        self.release_zone(Zone::Link);
        self.release_zone(Zone::Network);
        self.release_zone(Zone::Transport);
        self.release_zone(Zone::Application);
        self.total = 0;
    }

    fn compute_total(&self) -> usize {
        Zone::ALL.iter().map(|&z| self.zone_len(z)).sum()
    }

    /// Sum of the four zone lengths.
    pub fn total_len(&self) -> usize {
        self.compute_total()
    }

    /// Recompute and cache the total byte count.
    pub fn refresh_total(&mut self) -> usize {
        self.total = self.compute_total();
        self.total
    }

    /// The cached total byte count (see [`Self::refresh_total`]).
    pub fn cached_total(&self) -> usize {
        self.total
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn has_flag(&self, flag: BufferFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn set_flag(&mut self, flag: BufferFlags) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: BufferFlags) {
        self.flags.remove(flag);
    }

    /// Clear the RX bit, remembering the buffer was received. Returns the
    /// previous state; the scheduler uses this to pick the RX or TX path
    /// exactly once per backlog pass.
    pub fn take_rx(&mut self) -> bool {
        if self.flags.contains(BufferFlags::RX) {
            self.flags.remove(BufferFlags::RX);
            self.flags |= BufferFlags::WAS_RX;
            true
        } else {
            false
        }
    }

    /// Replace the unicast/multicast/broadcast classification.
    pub fn classify(&mut self, class: BufferFlags) {
        self.flags
            .remove(BufferFlags::UNICAST | BufferFlags::MULTICAST | BufferFlags::BROADCAST);
        self.flags |= class
            & (BufferFlags::UNICAST | BufferFlags::MULTICAST | BufferFlags::BROADCAST);
    }

    pub fn protocol(&self) -> u16 {
        self.protocol
    }

    pub fn set_protocol(&mut self, protocol: u16) {
        self.protocol = protocol;
    }

    /// Attach the device that received this buffer or must transmit it.
    pub fn set_owner(&mut self, dev: &Arc<NetDevice>) {
        self.owner = Some(Arc::downgrade(dev));
    }

    /// The owning device, if it is still registered.
    pub fn owner(&self) -> Option<Arc<NetDevice>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    pub fn stamp(&mut self, now_us: u64) {
        self.timestamp = Some(now_us);
    }

    pub fn sequence_end(&self) -> u32 {
        self.sequence_end
    }

    pub fn set_sequence_end(&mut self, seq: u32) {
        self.sequence_end = seq;
    }
}

/// FIFO of packet buffers; used for backlogs and pending-resolution queues.
pub type BufferQueue = VecDeque<PacketBuffer>;
