//! Ethernet framing.
//!
//! Input side peels the Ethernet header off a received buffer in place and
//! classifies the destination; output side prepends a header addressed to
//! a resolved link address. Both directions speak through the generic
//! device layer, so any protocol above (IPv4, ARP) stays link-agnostic.

use std::sync::Arc;

use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol};
use tracing::{debug, trace};

use crate::buffer::{BufferFlags, PacketBuffer, Zone};
use crate::device::{LinkOutput, NetDevice, Receive};
use crate::error::{Error, Result};

/// Bytes in an Ethernet II header.
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Peel the Ethernet header off a received frame.
///
/// Sets the buffer's protocol to the ethertype, classifies the destination
/// (unicast, multicast or broadcast) and leaves the payload aliased in the
/// network zone. Returns the ethertype.
pub fn strip_ethernet(nb: &mut PacketBuffer) -> Result<u16> {
    let frame = EthernetFrame::new_checked(nb.zone(Zone::Link))
        .map_err(|_| Error::InvalidArgument("truncated ethernet frame"))?;
    let dst = frame.dst_addr();
    let ethertype: u16 = frame.ethertype().into();

    nb.split_link(ETHERNET_HEADER_LEN)?;
    nb.set_protocol(ethertype);
    nb.classify(if dst.is_broadcast() {
        BufferFlags::BROADCAST
    } else if dst.is_multicast() {
        BufferFlags::MULTICAST
    } else {
        BufferFlags::UNICAST
    });
    Ok(ethertype)
}

/// Receive entry point for Ethernet devices: strip the frame header, then
/// demultiplex on the ethertype.
pub struct EthernetReceiver;

impl Receive for EthernetReceiver {
    fn receive(&self, dev: &Arc<NetDevice>, nb: &mut PacketBuffer) {
        match strip_ethernet(nb) {
            Ok(ethertype) => {
                trace!(device = %dev.name(), ethertype, "ethernet frame in");
                dev.demux(nb);
                nb.set_flag(BufferFlags::ARRIVED);
            }
            Err(_) => {
                debug!(device = %dev.name(), len = nb.cached_total(), "malformed ethernet frame");
                nb.set_flag(BufferFlags::DROPPED);
            }
        }
    }
}

/// Link output that frames buffers as Ethernet II.
pub struct EthernetOutput {
    /// Ethertype used when the buffer carries none (protocol `0`).
    default_ethertype: u16,
}

impl EthernetOutput {
    pub fn new(default_ethertype: u16) -> Self {
        EthernetOutput { default_ethertype }
    }
}

impl Default for EthernetOutput {
    fn default() -> Self {
        // IPv4
        Self::new(0x0800)
    }
}

impl LinkOutput for EthernetOutput {
    fn transmit(&self, dev: &Arc<NetDevice>, mut nb: PacketBuffer, link_addr: &[u8]) {
        if link_addr.len() != 6 || dev.hwaddr().len() != 6 {
            debug!(device = %dev.name(), "bad link address, dropping frame");
            dev.count_dropped(1);
            return;
        }
        if nb.resize(Zone::Link, ETHERNET_HEADER_LEN).is_err() {
            dev.count_dropped(1);
            return;
        }

        let ethertype = match nb.protocol() {
            0 => self.default_ethertype,
            proto => proto,
        };
        let mut frame = EthernetFrame::new_unchecked(nb.zone_mut(Zone::Link));
        frame.set_dst_addr(EthernetAddress::from_bytes(link_addr));
        frame.set_src_addr(EthernetAddress::from_bytes(dev.hwaddr()));
        frame.set_ethertype(EthernetProtocol::from(ethertype));

        dev.submit_tx(nb);
    }
}
