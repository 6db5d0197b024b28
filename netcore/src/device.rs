//! Network device core: backlog scheduling, protocol demultiplexing and
//! per-device statistics.
//!
//! This layer sits between the datalink protocols and the physical
//! drivers. It is purely administrative: drivers append received buffers
//! to the backlog, upper layers append outbound buffers, and [`NetDevice::poll`]
//! converts device readiness into a bounded, fair amount of work. Protocol
//! handling itself happens in external handlers invoked from here.

use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, trace};

use crate::buffer::{BufferFlags, BufferQueue, PacketBuffer, Zone};
use crate::config::{CoreConfig, DeviceConfig};
use crate::resolve::ResolutionCache;
use crate::stack::WakeHandle;
use crate::time::{Clock, SystemClock};

/// Result of handing one frame to a physical driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The frame left the device.
    Sent,
    /// The driver cannot take the frame right now; requeue it.
    Retry,
    /// The frame is unsendable; drop it.
    Failed,
}

/// Contract a physical driver provides to the core.
///
/// The scheduler never holds the device state lock across these calls, so
/// a driver may re-enter the device (e.g. `read` pushes buffers onto the
/// backlog).
pub trait Driver: Send {
    /// Bytes pending in the device's internal receive buffers.
    fn available(&mut self) -> usize;

    /// Pull up to `max` received frames, appending each to the backlog of
    /// `dev` as an RX-marked buffer. Returns the number of frames pushed.
    fn read(&mut self, dev: &Arc<NetDevice>, max: usize) -> usize;

    /// Write one contiguous frame to the wire.
    fn write(&mut self, frame: &[u8]) -> WriteOutcome;
}

/// Per-device receive entry point; runs the full input decode chain.
pub trait Receive: Send + Sync {
    fn receive(&self, dev: &Arc<NetDevice>, nb: &mut PacketBuffer);
}

/// External listener keyed by protocol id in the dispatch table.
pub trait ProtocolHandler: Send + Sync {
    fn handle(&self, dev: &Arc<NetDevice>, nb: &mut PacketBuffer);
}

/// Link-layer output seam: frames a buffer for a resolved link address and
/// submits it for transmission.
pub trait LinkOutput: Send + Sync {
    fn transmit(&self, dev: &Arc<NetDevice>, nb: PacketBuffer, link_addr: &[u8]);
}

/// Default receive entry point: demultiplex to the dispatch table and mark
/// the buffer arrived.
pub struct DemuxReceiver;

impl Receive for DemuxReceiver {
    fn receive(&self, dev: &Arc<NetDevice>, nb: &mut PacketBuffer) {
        dev.demux(nb);
        nb.set_flag(BufferFlags::ARRIVED);
    }
}

/// Running counters for one device. The only externally observable error
/// signal from the core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub dropped: u64,
}

/// Resolution tunables a device inherits from the stack configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResolveTunables {
    pub resolve_timeout_us: u64,
    pub resolve_retry_us: u64,
    pub resolve_retries: u32,
}

impl From<&CoreConfig> for ResolveTunables {
    fn from(cfg: &CoreConfig) -> Self {
        ResolveTunables {
            resolve_timeout_us: cfg.resolve_timeout_us,
            resolve_retry_us: cfg.resolve_retry_us,
            resolve_retries: cfg.resolve_retries,
        }
    }
}

struct ProtocolEntry {
    protocol: u16,
    handler: Arc<dyn ProtocolHandler>,
}

/// Mutable device state guarded by the per-device mutex.
pub(crate) struct DeviceState {
    backlog: BufferQueue,
    protocols: Vec<ProtocolEntry>,
    stats: DeviceStats,
    pub(crate) cache: ResolutionCache,
    pub(crate) tunables: ResolveTunables,
    rx_max: usize,
    processing_weight: usize,
    /// Buffers the scheduler was told to keep (KEEP / REUSE); reclaimed
    /// by the owning layer via [`NetDevice::take_retained`].
    retained: Vec<PacketBuffer>,
}

impl DeviceState {
    pub(crate) fn count_dropped(&mut self, n: u64) {
        self.stats.dropped += n;
    }
}

/// A layer-2 network device.
///
/// Many devices live in one process-wide [`crate::stack::Stack`]; each is
/// independently lockable. The state lock is never held across calls into
/// the driver or into handler callbacks.
pub struct NetDevice {
    name: String,
    mtu: u16,
    hwaddr: Vec<u8>,
    clock: Arc<dyn Clock>,
    driver: Mutex<Box<dyn Driver>>,
    rx: Arc<dyn Receive>,
    link_out: Arc<dyn LinkOutput>,
    pub(crate) state: Mutex<DeviceState>,
    wake: OnceLock<WakeHandle>,
}

/// Builder for [`NetDevice`].
pub struct NetDeviceBuilder {
    name: String,
    mtu: u16,
    hwaddr: Vec<u8>,
    clock: Option<Arc<dyn Clock>>,
    driver: Box<dyn Driver>,
    rx: Option<Arc<dyn Receive>>,
    link_out: Option<Arc<dyn LinkOutput>>,
    config: DeviceConfig,
    tunables: ResolveTunables,
}

impl NetDeviceBuilder {
    pub fn new(name: impl Into<String>, driver: Box<dyn Driver>) -> Self {
        NetDeviceBuilder {
            name: name.into(),
            mtu: 1500,
            hwaddr: Vec::new(),
            clock: None,
            driver,
            rx: None,
            link_out: None,
            config: DeviceConfig::default(),
            tunables: ResolveTunables::from(&CoreConfig::default()),
        }
    }

    pub fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn hwaddr(mut self, hwaddr: &[u8]) -> Self {
        self.hwaddr = hwaddr.to_vec();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn receive(mut self, rx: Arc<dyn Receive>) -> Self {
        self.rx = Some(rx);
        self
    }

    pub fn link_output(mut self, link: Arc<dyn LinkOutput>) -> Self {
        self.link_out = Some(link);
        self
    }

    pub fn config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn core_config(mut self, config: &CoreConfig) -> Self {
        self.tunables = ResolveTunables::from(config);
        self
    }

    pub fn build(self) -> Arc<NetDevice> {
        Arc::new(NetDevice {
            name: self.name,
            mtu: self.mtu,
            hwaddr: self.hwaddr,
            clock: self.clock.unwrap_or_else(SystemClock::shared),
            driver: Mutex::new(self.driver),
            rx: self.rx.unwrap_or_else(|| Arc::new(DemuxReceiver)),
            link_out: self
                .link_out
                .unwrap_or_else(|| Arc::new(crate::ether::EthernetOutput::default())),
            state: Mutex::new(DeviceState {
                backlog: BufferQueue::new(),
                protocols: Vec::new(),
                stats: DeviceStats::default(),
                cache: ResolutionCache::new(),
                tunables: self.tunables,
                rx_max: self.config.rx_max,
                processing_weight: self.config.processing_weight,
                retained: Vec::new(),
            }),
            wake: OnceLock::new(),
        })
    }
}

impl NetDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn hwaddr(&self) -> &[u8] {
        &self.hwaddr
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Attach the dispatcher wake handle; called once at registration.
    pub(crate) fn attach_wake(&self, wake: WakeHandle) {
        let _ = self.wake.set(wake);
    }

    /// Inherit the stack-wide resolution tunables; called at registration.
    pub(crate) fn apply_core_config(&self, cfg: &CoreConfig) {
        let mut st = self.state.lock().unwrap();
        st.tunables = ResolveTunables::from(cfg);
    }

    fn wake_dispatcher(&self) {
        if let Some(wake) = self.wake.get() {
            wake.wake();
        }
    }

    /// What the driver reports pending, without admitting anything.
    pub fn rx_available(&self) -> usize {
        self.driver.lock().unwrap().available()
    }

    /// Update the per-device scheduling limits.
    pub fn set_params(&self, rx_max: usize, processing_weight: usize) {
        let mut st = self.state.lock().unwrap();
        st.rx_max = rx_max;
        st.processing_weight = processing_weight;
    }

    /// Register an external protocol listener. Refuses duplicates for the
    /// same protocol id.
    pub fn add_protocol(
        &self,
        protocol: u16,
        handler: Arc<dyn ProtocolHandler>,
    ) -> crate::error::Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.protocols.iter().any(|p| p.protocol == protocol) {
            return Err(crate::error::Error::AlreadyInProgress);
        }
        st.protocols.push(ProtocolEntry { protocol, handler });
        Ok(())
    }

    /// Remove a protocol listener.
    pub fn remove_protocol(&self, protocol: u16) -> crate::error::Result<()> {
        let mut st = self.state.lock().unwrap();
        let before = st.protocols.len();
        st.protocols.retain(|p| p.protocol != protocol);
        if st.protocols.len() == before {
            return Err(crate::error::Error::NotFound);
        }
        Ok(())
    }

    /// Invoke every dispatch-table handler registered for the buffer's
    /// protocol. Protocol `0` is the "no listener" sentinel and is never
    /// dispatched.
    pub fn demux(self: &Arc<Self>, nb: &mut PacketBuffer) -> bool {
        if nb.protocol() == 0 {
            return false;
        }
        let handlers: Vec<Arc<dyn ProtocolHandler>> = {
            let st = self.state.lock().unwrap();
            st.protocols
                .iter()
                .filter(|p| p.protocol == nb.protocol())
                .map(|p| p.handler.clone())
                .collect()
        };
        let hit = !handlers.is_empty();
        for handler in handlers {
            handler.handle(self, nb);
        }
        hit
    }

    /// Append a buffer to the backlog without signalling the dispatcher.
    pub fn add_backlog(&self, nb: PacketBuffer) {
        let mut st = self.state.lock().unwrap();
        st.backlog.push_back(nb);
    }

    /// Wrap raw received bytes into an RX buffer, append it to the backlog
    /// and wake the dispatcher.
    pub fn enqueue_rx(self: &Arc<Self>, frame: &[u8], protocol: u16) -> crate::error::Result<()> {
        let mut nb = PacketBuffer::from_frame(frame, protocol)?;
        nb.set_owner(self);
        self.add_backlog(nb);
        self.wake_dispatcher();
        Ok(())
    }

    /// Append an outbound buffer to the backlog and wake the dispatcher.
    pub fn submit_tx(self: &Arc<Self>, mut nb: PacketBuffer) {
        nb.clear_flag(BufferFlags::RX);
        nb.set_owner(self);
        self.add_backlog(nb);
        self.wake_dispatcher();
    }

    /// Current backlog depth.
    pub fn backlog_len(&self) -> usize {
        self.state.lock().unwrap().backlog.len()
    }

    /// Reclaim buffers the scheduler retained on behalf of upper layers
    /// (KEEP / REUSE). The REUSE bit is cleared on the way out; ownership
    /// passes to the caller.
    pub fn take_retained(&self) -> Vec<PacketBuffer> {
        let mut st = self.state.lock().unwrap();
        let mut out = std::mem::take(&mut st.retained);
        drop(st);
        for nb in &mut out {
            nb.clear_flag(BufferFlags::REUSE);
        }
        out
    }

    /// Frame a buffer for `link_addr` through the device's link output and
    /// queue it for transmission.
    pub fn transmit_link(self: &Arc<Self>, nb: PacketBuffer, link_addr: &[u8]) {
        let link = self.link_out.clone();
        link.transmit(self, nb, link_addr);
    }

    pub(crate) fn count_dropped(&self, n: u64) {
        let mut st = self.state.lock().unwrap();
        st.stats.dropped += n;
    }

    /// Poll the device once.
    ///
    /// Admits up to `rx_max` new frames from the driver, runs one pass of
    /// resolution-cache maintenance, then drains the backlog within the
    /// byte budget. Returns the remaining backlog depth.
    pub fn poll(self: &Arc<Self>) -> usize {
        let available = self.rx_available();
        let rx_max = self.state.lock().unwrap().rx_max;
        let admit = available.min(rx_max);
        if admit > 0 {
            let pushed = self.driver.lock().unwrap().read(self, admit);
            trace!(device = %self.name, pushed, "admitted rx frames");
        }

        self.maintain_cache();
        self.process_backlog();
        self.backlog_len()
    }

    /// Drain the backlog while the byte budget remains.
    ///
    /// One call handles at most the entries that were queued when it
    /// started. The budget is charged only for buffers that leave the
    /// backlog; a write the driver deferred is requeued without charge and
    /// waits for the next pass.
    fn process_backlog(self: &Arc<Self>) {
        let (mut budget, mut slots) = {
            let st = self.state.lock().unwrap();
            (st.processing_weight as i64, st.backlog.len())
        };

        while budget > 0 && slots > 0 {
            slots -= 1;
            let nb = {
                let mut st = self.state.lock().unwrap();
                st.backlog.pop_front()
            };
            let Some(mut nb) = nb else { break };

            let was_rx = nb.take_rx();
            if was_rx {
                self.process_rx(&mut nb);
            } else {
                self.process_tx(&mut nb);
            }

            if nb.has_flag(BufferFlags::RETRY) {
                // Deferred work goes back to the tail with its path bit
                // restored and costs no budget.
                nb.clear_flag(BufferFlags::RETRY);
                nb.clear_flag(BufferFlags::ARRIVED);
                if was_rx {
                    nb.set_flag(BufferFlags::RX);
                }
                let mut st = self.state.lock().unwrap();
                st.backlog.push_back(nb);
                continue;
            }

            budget -= nb.cached_total() as i64;
            self.retire(nb);
        }
    }

    /// RX path: attach metadata, hand the buffer to the receive chain and
    /// classify the outcome.
    fn process_rx(self: &Arc<Self>, nb: &mut PacketBuffer) {
        nb.set_owner(self);
        // A freshly read frame lives entirely in the link zone.
        nb.set_flag(BufferFlags::LINEAR);
        nb.stamp(self.clock.now_us());
        nb.refresh_total();

        let rx = self.rx.clone();
        rx.receive(self, nb);
        nb.refresh_total();

        let mut st = self.state.lock().unwrap();
        if nb.has_flag(BufferFlags::DROPPED) {
            st.stats.dropped += 1;
            debug!(device = %self.name, len = nb.cached_total(), "rx buffer dropped");
        }
        if nb.has_flag(BufferFlags::ARRIVED) {
            st.stats.rx_packets += 1;
            st.stats.rx_bytes += nb.cached_total() as u64;
        }
    }

    /// TX path: linearize and hand the frame to the driver.
    fn process_tx(self: &Arc<Self>, nb: &mut PacketBuffer) {
        nb.refresh_total();
        nb.linearize();

        let outcome = {
            let mut driver = self.driver.lock().unwrap();
            match nb.frame_bytes() {
                Some(frame) => driver.write(frame),
                None => WriteOutcome::Failed,
            }
        };

        match outcome {
            WriteOutcome::Sent => {
                let mut st = self.state.lock().unwrap();
                st.stats.tx_packets += 1;
                st.stats.tx_bytes += nb.cached_total() as u64;
            }
            WriteOutcome::Retry => {
                nb.set_flag(BufferFlags::RETRY);
            }
            WriteOutcome::Failed => {
                nb.set_flag(BufferFlags::DROPPED);
                let mut st = self.state.lock().unwrap();
                st.stats.dropped += 1;
                debug!(device = %self.name, len = nb.cached_total(), "tx write failed");
            }
        }
    }

    /// Drop a finished buffer, or park it when an upper layer retains it.
    fn retire(&self, nb: PacketBuffer) {
        if nb.has_flag(BufferFlags::KEEP) || nb.has_flag(BufferFlags::REUSE) {
            let mut st = self.state.lock().unwrap();
            st.retained.push(nb);
        }
        // Otherwise the buffer drops here; owned zones free themselves.
    }

    /// Snapshot of the running counters.
    pub fn stats(&self) -> DeviceStats {
        self.state.lock().unwrap().stats
    }

    pub fn dropped(&self) -> u64 {
        self.stats().dropped
    }

    pub fn rx_bytes(&self) -> u64 {
        self.stats().rx_bytes
    }

    pub fn rx_packets(&self) -> u64 {
        self.stats().rx_packets
    }

    pub fn tx_bytes(&self) -> u64 {
        self.stats().tx_bytes
    }

    pub fn tx_packets(&self) -> u64 {
        self.stats().tx_packets
    }

    /// Human-readable statistics dump.
    pub fn format_stats(&self) -> String {
        let stats = self.stats();
        format!(
            "Stats for: {}\n\
             \tReceived: {} bytes in {} packets\n\
             \tTransmit: {} bytes in {} packets\n\
             \t{} packets have been dropped\n\
             \tBacklog size {}",
            self.name,
            stats.rx_bytes,
            stats.rx_packets,
            stats.tx_bytes,
            stats.tx_packets,
            stats.dropped,
            self.backlog_len(),
        )
    }
}

/// Build an outbound buffer holding `payload` in its transport zone; a
/// convenience for layers that submit raw data.
pub fn buffer_for_payload(payload: &[u8], protocol: u16) -> crate::error::Result<PacketBuffer> {
    let mut nb = PacketBuffer::alloc(Zone::Transport, payload.len())?;
    nb.copy_into(Zone::Transport, payload)?;
    nb.set_protocol(protocol);
    Ok(nb)
}
