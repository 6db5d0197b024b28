//! Embedded-style network device core.
//!
//! The crate provides the plumbing every protocol above the wire needs:
//! zoned packet buffers, a fair per-device backlog scheduler, an address
//! resolution cache with parked-output flushing, IPv4 fragmentation and
//! reassembly, and a single dispatcher thread driving it all off a
//! bounded wake event. Protocols plug in at three seams: [`Driver`] below,
//! [`Receive`]/[`ProtocolHandler`] above, and [`Resolver`] beside the
//! output path.
//!
//! ```no_run
//! use netcore::{CoreConfig, Stack};
//!
//! let stack = Stack::new(CoreConfig::default());
//! // register devices, then:
//! stack.spawn_dispatcher();
//! ```

pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod ether;
pub mod fragment;
pub mod resolve;
pub mod stack;
pub mod time;

pub mod test_util;

pub use buffer::{BufferFlags, BufferQueue, PacketBuffer, Zone, MAX_ZONE_SIZE};
pub use config::{CoreConfig, DeviceConfig};
pub use device::{
    buffer_for_payload, DemuxReceiver, DeviceStats, Driver, LinkOutput, NetDevice,
    NetDeviceBuilder, ProtocolHandler, Receive, WriteOutcome,
};
pub use error::{Error, Result};
pub use ether::{strip_ethernet, EthernetOutput, EthernetReceiver, ETHERNET_HEADER_LEN};
pub use fragment::{fragment_for_output, FragmentStore};
pub use resolve::Resolver;
pub use stack::{Stack, WakeHandle};
pub use time::{Clock, SystemClock};
