//! On/off traffic sources and packet sinks.

use netlab_abstract::{DataRate, OnOffConfig, Protocol, RandomVariable, SimTime, SinkConfig, TransportProtocol};
use rand::Rng;
use rand::rngs::StdRng;
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::debug;

use crate::engine::{EndpointRef, Simulator};
use crate::node::NodeId;
use crate::scheduler::EventHandle;

/// Draw a duration from `variable`.
pub fn sample(variable: &RandomVariable, rng: &mut StdRng) -> SimTime {
    let secs = match *variable {
        RandomVariable::Constant { value } => value,
        RandomVariable::Uniform { min, max } => min + (max - min) * rng.random::<f64>(),
        RandomVariable::Exponential { mean } => {
            // Inverse CDF; 1 - u keeps the argument of ln in (0, 1]
            let u: f64 = rng.random();
            -mean * (1.0 - u).ln()
        }
    };
    SimTime::from_secs_f64(secs.max(0.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Idle,
    On,
    Off,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AppStats {
    pub packets_generated: u64,
    pub bytes_generated: u64,
    /// Writes the transport refused because its send buffer was full.
    pub writes_refused: u64,
}

/// Alternates between sending at a constant rate and staying silent.
pub struct OnOffApplication {
    pub node: NodeId,
    pub local_port: u16,
    pub remote_address: Ipv4Addr,
    pub remote_port: u16,
    pub protocol: Protocol,
    pub payload_size: u32,
    pub data_rate: DataRate,
    pub on_time: RandomVariable,
    pub off_time: RandomVariable,
    pub start: SimTime,
    pub stop: Option<SimTime>,
    pub transport: Box<dyn TransportProtocol>,
    pub stats: AppStats,
    state: AppState,
    next_send: Option<EventHandle>,
    next_phase: Option<EventHandle>,
}

impl OnOffApplication {
    pub fn new(
        node: NodeId,
        local_port: u16,
        config: &OnOffConfig,
        transport: Box<dyn TransportProtocol>,
    ) -> Self {
        Self {
            node,
            local_port,
            remote_address: config.remote_address,
            remote_port: config.remote_port,
            protocol: config.protocol,
            payload_size: config.payload_size,
            data_rate: config.data_rate,
            on_time: config.on_time.clone(),
            off_time: config.off_time.clone(),
            start: config.start,
            stop: config.stop,
            transport,
            stats: AppStats::default(),
            state: AppState::Idle,
            next_send: None,
            next_phase: None,
        }
    }

    pub fn state(&self) -> AppState {
        self.state
    }

    /// Gap between packets while on: one payload at the configured rate.
    pub fn send_interval(&self) -> SimTime {
        self.data_rate.transmission_time(self.payload_size)
    }
}

/// Counts packets and bytes arriving on a bound port during its active window.
pub struct PacketSink {
    pub node: NodeId,
    pub port: u16,
    pub protocol: Protocol,
    pub start: SimTime,
    pub stop: Option<SimTime>,
    pub stats: SinkStats,
    /// One receiving transport per remote (address, port).
    pub(crate) peers: HashMap<(Ipv4Addr, u16), Box<dyn TransportProtocol>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub rx_packets: u64,
    /// Payload handed up by the transport (in order, for streams).
    pub rx_bytes: u64,
    pub last_rx: Option<SimTime>,
}

impl PacketSink {
    pub fn new(node: NodeId, config: &SinkConfig) -> Self {
        Self {
            node,
            port: config.port,
            protocol: config.protocol,
            start: config.start,
            stop: config.stop,
            stats: SinkStats::default(),
            peers: HashMap::new(),
        }
    }

    pub fn is_active(&self, now: SimTime) -> bool {
        now >= self.start && self.stop.is_none_or(|stop| now <= stop)
    }
}

impl Simulator {
    /// Queue start and stop events for every application.
    pub(crate) fn schedule_applications(&mut self) {
        for index in 0..self.applications.len() {
            let (start, stop) = (self.applications[index].start, self.applications[index].stop);
            self.scheduler
                .schedule_at(start, move |sim: &mut Simulator| sim.start_application(index));
            if let Some(stop) = stop {
                self.scheduler
                    .schedule_at(stop, move |sim: &mut Simulator| sim.stop_application(index));
            }
        }
    }

    fn start_application(&mut self, index: usize) {
        if self.applications[index].state != AppState::Idle {
            return;
        }
        debug!(app = index, now = %self.now(), "application started");
        self.begin_on_phase(index);
    }

    fn stop_application(&mut self, index: usize) {
        let app = &mut self.applications[index];
        app.state = AppState::Stopped;
        let pending = [app.next_send.take(), app.next_phase.take()];
        for handle in pending.into_iter().flatten() {
            self.scheduler.cancel(handle);
        }
        debug!(app = index, now = %self.now(), "application stopped");
    }

    fn begin_on_phase(&mut self, index: usize) {
        let on_time = self.applications[index].on_time.clone();
        let duration = sample(&on_time, &mut self.rng);
        let interval = self.applications[index].send_interval();

        let phase_end = self
            .scheduler
            .schedule(duration, move |sim: &mut Simulator| sim.end_on_phase(index));
        let send = self
            .scheduler
            .schedule(interval, move |sim: &mut Simulator| sim.application_send(index));

        let app = &mut self.applications[index];
        app.state = AppState::On;
        app.next_phase = Some(phase_end);
        app.next_send = Some(send);
    }

    fn end_on_phase(&mut self, index: usize) {
        if let Some(send) = self.applications[index].next_send.take() {
            self.scheduler.cancel(send);
        }
        let off_time = self.applications[index].off_time.clone();
        let duration = sample(&off_time, &mut self.rng);
        let next = self
            .scheduler
            .schedule(duration, move |sim: &mut Simulator| sim.begin_on_phase(index));

        let app = &mut self.applications[index];
        app.state = AppState::Off;
        app.next_phase = Some(next);
    }

    fn application_send(&mut self, index: usize) {
        let payload = self.applications[index].payload_size;
        let accepted = self
            .dispatch(EndpointRef::Application(index), |transport, ctx| {
                transport.on_app_data(ctx, payload)
            })
            .unwrap_or(false);

        let interval = self.applications[index].send_interval();
        let next = self
            .scheduler
            .schedule(interval, move |sim: &mut Simulator| sim.application_send(index));

        let app = &mut self.applications[index];
        if accepted {
            app.stats.packets_generated += 1;
            app.stats.bytes_generated += payload as u64;
        } else {
            app.stats.writes_refused += 1;
        }
        app.next_send = Some(next);
    }
}
