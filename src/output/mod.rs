//! Output Engine (§4.1): owns the per-universe canonical byte arrays and
//! drives the adaptive-rate Art-Net transmit loop.

pub mod artnet;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{ChangeBus, Event};
use crate::config::Config;
use crate::error::OutputError;
use crate::model::{Channel, UniverseId, DMX_UNIVERSE_SIZE};

use artnet::{encode_art_dmx, next_sequence};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateMode {
    Idle,
    High,
}

#[derive(Debug, Clone, Default)]
pub struct UniverseStats {
    pub packets_sent: u64,
    pub send_errors: u64,
    pub last_error: Option<String>,
    pub rate_mode: Option<RateMode>,
}

struct UniverseState {
    base: [u8; DMX_UNIVERSE_SIZE],
    overrides: HashMap<u16, u8>,
    dirty: bool,
    last_dirty_at: Instant,
    last_sent: Option<[u8; DMX_UNIVERSE_SIZE]>,
    sequence: u8,
}

impl UniverseState {
    fn new() -> Self {
        UniverseState {
            base: [0; DMX_UNIVERSE_SIZE],
            overrides: HashMap::new(),
            dirty: false,
            // Far enough in the past that a freshly-created universe starts idle.
            last_dirty_at: Instant::now()
                .checked_sub(Duration::from_secs(3600))
                .unwrap_or_else(Instant::now),
            last_sent: None,
            sequence: 0,
        }
    }

    fn effective(&self) -> [u8; DMX_UNIVERSE_SIZE] {
        let mut out = self.base;
        for (&ch, &v) in &self.overrides {
            if let Some(idx) = channel_index(ch) {
                out[idx] = v;
            }
        }
        out
    }
}

fn channel_index(channel: u16) -> Option<usize> {
    if (1..=DMX_UNIVERSE_SIZE as u16).contains(&channel) {
        Some(channel as usize - 1)
    } else {
        None
    }
}

pub struct OutputEngine {
    universes: Vec<Mutex<UniverseState>>,
    stats: Vec<Mutex<UniverseStats>>,
    config: Config,
    bus: ChangeBus,
    socket: Arc<UdpSocket>,
    dest_addr: SocketAddr,
    transmit_enabled: AtomicBool,
    shutdown_token: CancellationToken,
    last_drift_warn: Mutex<Option<Instant>>,
}

impl OutputEngine {
    /// Binds a UDP socket and constructs the engine. Socket bind failure is
    /// fatal per §7 (`FATAL_IO`) and propagates to the caller.
    pub async fn new(config: Config, bus: ChangeBus) -> Result<Arc<Self>, OutputError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(OutputError::BindFailed)?;
        socket
            .set_broadcast(true)
            .map_err(OutputError::BindFailed)?;

        let dest_ip = config.artnet_broadcast.unwrap_or(Ipv4Addr::BROADCAST);
        let dest_addr = SocketAddr::new(dest_ip.into(), config.artnet_port);

        let universe_count = config.universe_count as usize;
        let mut universes = Vec::with_capacity(universe_count);
        let mut stats = Vec::with_capacity(universe_count);
        for _ in 0..universe_count {
            universes.push(Mutex::new(UniverseState::new()));
            stats.push(Mutex::new(UniverseStats::default()));
        }

        Ok(Arc::new(OutputEngine {
            universes,
            stats,
            config,
            bus,
            socket: Arc::new(socket),
            dest_addr,
            transmit_enabled: AtomicBool::new(true),
            shutdown_token: CancellationToken::new(),
            last_drift_warn: Mutex::new(None),
        }))
    }

    pub fn universe_count(&self) -> usize {
        self.universes.len()
    }

    fn universe_index(&self, universe: UniverseId) -> Option<usize> {
        let idx = universe.checked_sub(1)? as usize;
        if idx < self.universes.len() {
            Some(idx)
        } else {
            None
        }
    }

    /// Clamps `value`, stores it in the base layer, and marks the universe
    /// dirty iff the effective value actually changed. Out-of-range
    /// universe/channel are silently ignored (§4.1, §7).
    pub fn set_base(&self, universe: UniverseId, channel: Channel, value: i32) {
        let Some(uidx) = self.universe_index(universe) else {
            return;
        };
        let Some(cidx) = channel_index(channel) else {
            return;
        };
        let clamped = value.clamp(0, 255) as u8;
        let mut st = self.universes[uidx].lock().unwrap();
        if st.base[cidx] != clamped {
            st.base[cidx] = clamped;
            st.dirty = true;
            st.last_dirty_at = Instant::now();
        }
    }

    pub fn set_override(&self, universe: UniverseId, channel: Channel, value: i32) {
        let Some(uidx) = self.universe_index(universe) else {
            return;
        };
        let Some(_) = channel_index(channel) else {
            return;
        };
        let clamped = value.clamp(0, 255) as u8;
        let mut st = self.universes[uidx].lock().unwrap();
        let changed = st.overrides.get(&channel).copied() != Some(clamped);
        if changed {
            st.overrides.insert(channel, clamped);
            st.dirty = true;
            st.last_dirty_at = Instant::now();
        }
    }

    pub fn clear_override(&self, universe: UniverseId, channel: Channel) {
        let Some(uidx) = self.universe_index(universe) else {
            return;
        };
        let mut st = self.universes[uidx].lock().unwrap();
        if st.overrides.remove(&channel).is_some() {
            st.dirty = true;
            st.last_dirty_at = Instant::now();
        }
    }

    pub fn clear_all_overrides(&self, universe: UniverseId) {
        let Some(uidx) = self.universe_index(universe) else {
            return;
        };
        let mut st = self.universes[uidx].lock().unwrap();
        if !st.overrides.is_empty() {
            st.overrides.clear();
            st.dirty = true;
            st.last_dirty_at = Instant::now();
        }
    }

    pub fn read_effective(&self, universe: UniverseId) -> Result<[u8; DMX_UNIVERSE_SIZE], OutputError> {
        let uidx = self
            .universe_index(universe)
            .ok_or(OutputError::UnknownUniverse(universe))?;
        let st = self.universes[uidx].lock().unwrap();
        Ok(st.effective())
    }

    /// Reads the raw base-layer value for a channel, ignoring overrides.
    /// Used by the Fade Engine to determine an implicit fade start value.
    pub fn base_value(&self, universe: UniverseId, channel: Channel) -> Option<u8> {
        let uidx = self.universe_index(universe)?;
        let cidx = channel_index(channel)?;
        Some(self.universes[uidx].lock().unwrap().base[cidx])
    }

    pub fn trigger_high_rate(&self, universe: UniverseId) {
        if let Some(uidx) = self.universe_index(universe) {
            self.universes[uidx].lock().unwrap().last_dirty_at = Instant::now();
        }
    }

    pub fn set_transmit_enabled(&self, enabled: bool) {
        self.transmit_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn stats(&self, universe: UniverseId) -> Option<UniverseStats> {
        let uidx = self.universe_index(universe)?;
        Some(self.stats[uidx].lock().unwrap().clone())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Runs the output loop until the engine's cancellation token fires.
    /// Intended to be spawned as a single long-lived task.
    pub async fn run(self: Arc<Self>) {
        let mut next_tick = tokio::time::Instant::now();

        loop {
            if self.shutdown_token.is_cancelled() {
                break;
            }

            let now = Instant::now();
            let high_mode = self.is_high_mode(now);
            let period = self.period_for_mode(high_mode);

            for i in 0..self.universes.len() {
                self.service_universe(i, high_mode).await;
            }

            next_tick += period;
            let now2 = tokio::time::Instant::now();
            if next_tick > now2 {
                tokio::select! {
                    _ = tokio::time::sleep_until(next_tick) => {},
                    _ = self.shutdown_token.cancelled() => break,
                }
            } else {
                let drift = now2.into_std().saturating_duration_since(next_tick.into_std());
                self.maybe_warn_drift(drift);
                next_tick = now2;
            }
        }
    }

    fn is_high_mode(&self, now: Instant) -> bool {
        for u in &self.universes {
            let st = u.lock().unwrap();
            if st.dirty || now.saturating_duration_since(st.last_dirty_at) < self.config.high_rate_window {
                return true;
            }
        }
        false
    }

    fn period_for_mode(&self, high_mode: bool) -> Duration {
        let hz = if high_mode {
            self.config.refresh_rate_hz
        } else {
            self.config.idle_rate_hz
        };
        Duration::from_secs_f64(1.0 / hz.max(0.001))
    }

    async fn service_universe(&self, idx: usize, high_mode: bool) {
        let universe_id = (idx + 1) as u16;

        let (effective, should_process, sequence) = {
            let mut st = self.universes[idx].lock().unwrap();
            let eff = st.effective();
            let changed = st.last_sent != Some(eff);
            let should_process = if high_mode { changed } else { true };
            let sequence = if should_process {
                st.sequence = next_sequence(st.sequence);
                st.sequence
            } else {
                st.sequence
            };
            (eff, should_process, sequence)
        };

        if !should_process {
            return;
        }

        // Transmission suppressed entirely: the loop still advances dirty
        // flags and fires events (§4.1 failure semantics), there's just
        // nothing to retransmit.
        if !self.transmit_enabled.load(Ordering::Relaxed) || !self.config.artnet_enabled {
            self.mark_sent(idx, effective);
            if high_mode {
                self.publish_output_changed(universe_id, effective).await;
            }
            return;
        }

        let packet = encode_art_dmx(universe_id, sequence, &effective);
        match self.socket.send_to(&packet, self.dest_addr).await {
            Ok(_) => {
                {
                    let mut stats = self.stats[idx].lock().unwrap();
                    stats.packets_sent += 1;
                    stats.rate_mode = Some(if high_mode { RateMode::High } else { RateMode::Idle });
                }
                self.mark_sent(idx, effective);
                if high_mode {
                    self.publish_output_changed(universe_id, effective).await;
                }
            }
            Err(e) => {
                // Leave `last_sent`/`dirty` untouched so the next tick
                // retries this frame instead of treating it as delivered.
                warn!(universe = universe_id, error = %e, "art-net send failed");
                let mut stats = self.stats[idx].lock().unwrap();
                stats.send_errors += 1;
                stats.last_error = Some(e.to_string());
            }
        }
    }

    fn mark_sent(&self, idx: usize, effective: [u8; DMX_UNIVERSE_SIZE]) {
        let mut st = self.universes[idx].lock().unwrap();
        st.last_sent = Some(effective);
        st.dirty = false;
    }

    async fn publish_output_changed(&self, universe_id: UniverseId, effective: [u8; DMX_UNIVERSE_SIZE]) {
        self.bus
            .publish(Event::DmxOutputChanged {
                universe: universe_id,
                channels: Box::new(effective),
            })
            .await;
    }

    fn maybe_warn_drift(&self, drift: Duration) {
        let Some(threshold) = self.config.drift_threshold else {
            return;
        };
        if drift <= threshold {
            return;
        }
        let mut last = self.last_drift_warn.lock().unwrap();
        let now = Instant::now();
        let should_log = match *last {
            Some(t) => now.duration_since(t) >= self.config.drift_warning_throttle,
            None => true,
        };
        if should_log {
            warn!(drift_ms = drift.as_millis() as u64, "output loop scheduling drift");
            *last = Some(now);
        }
    }

    /// Stops accepting new transmit work and sends one final all-zero
    /// packet per universe (§4.1, §5 shutdown ordering).
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        if !self.config.artnet_enabled {
            debug!("art-net disabled, skipping final zero frame");
            return;
        }
        let zero = [0u8; DMX_UNIVERSE_SIZE];
        for idx in 0..self.universes.len() {
            let universe_id = (idx + 1) as u16;
            let sequence = {
                let mut st = self.universes[idx].lock().unwrap();
                st.sequence = next_sequence(st.sequence);
                st.sequence
            };
            if self.transmit_enabled.load(Ordering::Relaxed) {
                let packet = encode_art_dmx(universe_id, sequence, &zero);
                if let Err(e) = self.socket.send_to(&packet, self.dest_addr).await {
                    warn!(universe = universe_id, error = %e, "final zero frame send failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::TopicKind;

    async fn engine() -> Arc<OutputEngine> {
        let mut config = Config::default();
        config.universe_count = 2;
        config.artnet_broadcast = Some("127.0.0.1".parse().unwrap());
        config.artnet_port = 0;
        OutputEngine::new(config, ChangeBus::new()).await.unwrap()
    }

    #[tokio::test]
    async fn clamping_property() {
        let oe = engine().await;
        oe.set_base(1, 5, 999);
        assert_eq!(oe.read_effective(1).unwrap()[4], 255);
        oe.set_base(1, 5, -10);
        assert_eq!(oe.read_effective(1).unwrap()[4], 0);
    }

    #[tokio::test]
    async fn override_precedence_and_clear() {
        let oe = engine().await;
        oe.set_base(1, 1, 100);
        oe.set_override(1, 1, 200);
        assert_eq!(oe.read_effective(1).unwrap()[0], 200);
        oe.clear_override(1, 1);
        assert_eq!(oe.read_effective(1).unwrap()[0], 100);
    }

    #[tokio::test]
    async fn out_of_range_is_silently_ignored() {
        let oe = engine().await;
        oe.set_base(99, 1, 100); // bad universe
        oe.set_base(1, 0, 100); // bad channel
        oe.set_base(1, 513, 100); // bad channel
        assert_eq!(oe.read_effective(1).unwrap(), [0u8; DMX_UNIVERSE_SIZE]);
    }

    #[tokio::test]
    async fn idempotent_write_does_not_redirty() {
        let oe = engine().await;
        oe.set_base(1, 1, 50);
        {
            let st = oe.universes[0].lock().unwrap();
            assert!(st.dirty);
        }
        // Drain dirty via a service pass, then write the same value again.
        oe.service_universe(0, true).await;
        oe.set_base(1, 1, 50);
        let st = oe.universes[0].lock().unwrap();
        assert!(!st.dirty);
    }

    #[tokio::test]
    async fn dmx_output_changed_fires_only_in_high_mode() {
        let oe = engine().await;
        let sub = oe.bus.subscribe(TopicKind::DmxOutputChanged, None).await;
        oe.set_base(1, 1, 128);
        oe.service_universe(0, true).await;
        let ev = sub.recv().await.unwrap();
        match ev {
            Event::DmxOutputChanged { universe, channels } => {
                assert_eq!(universe, 1);
                assert_eq!(channels[0], 128);
            }
            _ => panic!("wrong event"),
        }
    }

    /// Property 8 (adaptive rate): a write flips the universe into high mode
    /// for at least `high_rate_window`; once `last_dirty_at` falls outside
    /// that window (and the universe is clean), it reports idle again.
    #[tokio::test]
    async fn adaptive_rate_switches_high_then_idle() {
        let oe = engine().await;
        assert!(!oe.is_high_mode(Instant::now()), "fresh universe should start idle");

        oe.set_base(1, 1, 10);
        assert!(oe.is_high_mode(Instant::now()));

        // Clearing dirty alone doesn't drop out of high mode: we're still
        // inside the high_rate_window since the last change.
        oe.service_universe(0, true).await;
        assert!(oe.is_high_mode(Instant::now()));

        // Once last_dirty_at falls outside the window, mode reverts to idle.
        {
            let mut st = oe.universes[0].lock().unwrap();
            st.last_dirty_at = Instant::now()
                .checked_sub(oe.config.high_rate_window + Duration::from_millis(50))
                .unwrap();
        }
        assert!(!oe.is_high_mode(Instant::now()));
    }

    /// Property 10 (shutdown zeroing): after `shutdown()`, one all-zero
    /// datagram has been transmitted per universe.
    #[tokio::test]
    async fn shutdown_sends_all_zero_frame_per_universe() {
        let recv_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let recv_addr = recv_sock.local_addr().unwrap();
        let std::net::IpAddr::V4(recv_ip) = recv_addr.ip() else {
            unreachable!("loopback bind is always v4 here")
        };

        let mut config = Config::default();
        config.universe_count = 2;
        config.artnet_broadcast = Some(recv_ip);
        config.artnet_port = recv_addr.port();
        let oe = OutputEngine::new(config, ChangeBus::new()).await.unwrap();
        oe.set_base(1, 1, 200);
        oe.set_base(2, 1, 55);

        oe.shutdown().await;

        let mut buf = [0u8; artnet::PACKET_LEN + 16];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..2 {
            let (n, _) = tokio::time::timeout(Duration::from_secs(1), recv_sock.recv_from(&mut buf))
                .await
                .expect("final zero frame should arrive")
                .unwrap();
            assert_eq!(n, artnet::PACKET_LEN);
            assert!(buf[18..18 + DMX_UNIVERSE_SIZE].iter().all(|&b| b == 0));
            seen.insert(u16::from_le_bytes([buf[14], buf[15]]));
        }
        assert_eq!(seen.len(), 2, "expected one zero frame per universe");
    }
}
