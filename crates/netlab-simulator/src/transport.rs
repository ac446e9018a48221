//! Built-in transport endpoints.
//!
//! Connectionless endpoints map every application write to one datagram.
//! Connection-oriented endpoints segment a byte stream, keep a congestion
//! window and retransmit what the network lost.

use netlab_abstract::{Protocol, Segment, SimTime, SystemContext, TcpConfig, TransportProtocol};

pub const RTO_TIMER: u32 = 1;
const DUP_ACK_THRESHOLD: u32 = 3;

#[derive(Debug, Default)]
pub struct DatagramSender;

impl TransportProtocol for DatagramSender {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn on_app_data(&mut self, ctx: &mut dyn SystemContext, bytes: u32) -> bool {
        ctx.send_segment(Segment::Datagram { len: bytes });
        true
    }

    fn on_segment(&mut self, _ctx: &mut dyn SystemContext, _segment: Segment) {}
}

#[derive(Debug, Default)]
pub struct DatagramReceiver;

impl TransportProtocol for DatagramReceiver {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn on_app_data(&mut self, _ctx: &mut dyn SystemContext, _bytes: u32) -> bool {
        false
    }

    fn on_segment(&mut self, ctx: &mut dyn SystemContext, segment: Segment) {
        if let Segment::Datagram { len } = segment {
            ctx.deliver_data(len);
        }
    }
}

/// Sending half of a connection-oriented stream.
#[derive(Debug)]
pub struct StreamSender {
    mss: u32,
    rto: SimTime,
    send_buffer: u64,
    /// Oldest unacknowledged byte.
    snd_una: u64,
    /// Next byte to transmit.
    snd_nxt: u64,
    /// End of the data the application has written.
    snd_end: u64,
    /// Congestion window in segments.
    cwnd: f64,
    ssthresh: f64,
    dup_acks: u32,
    timer_running: bool,
}

impl StreamSender {
    pub fn new(config: &TcpConfig) -> Self {
        Self {
            mss: config.segment_size,
            rto: config.rto,
            send_buffer: config.send_buffer as u64,
            snd_una: 0,
            snd_nxt: 0,
            snd_end: 0,
            cwnd: config.initial_cwnd.max(1) as f64,
            ssthresh: f64::INFINITY,
            dup_acks: 0,
            timer_running: false,
        }
    }

    pub fn cwnd(&self) -> f64 {
        self.cwnd
    }

    /// Bytes written by the application and acknowledged by the peer.
    pub fn acked_bytes(&self) -> u64 {
        self.snd_una
    }

    fn in_flight(&self) -> u64 {
        self.snd_nxt - self.snd_una
    }

    fn window_bytes(&self) -> u64 {
        (self.cwnd.floor() as u64).max(1) * self.mss as u64
    }

    fn arm_timer(&mut self, ctx: &mut dyn SystemContext) {
        ctx.start_timer(self.rto, RTO_TIMER);
        self.timer_running = true;
    }

    fn try_send(&mut self, ctx: &mut dyn SystemContext) {
        while self.snd_nxt < self.snd_end && self.in_flight() < self.window_bytes() {
            let len = (self.snd_end - self.snd_nxt).min(self.mss as u64) as u32;
            ctx.send_segment(Segment::Data {
                seq: self.snd_nxt,
                len,
            });
            self.snd_nxt += len as u64;
            if !self.timer_running {
                self.arm_timer(ctx);
            }
        }
    }

    fn retransmit_head(&mut self, ctx: &mut dyn SystemContext) {
        let len = (self.snd_nxt - self.snd_una).min(self.mss as u64) as u32;
        ctx.send_segment(Segment::Data {
            seq: self.snd_una,
            len,
        });
        self.arm_timer(ctx);
    }

    fn handle_ack(&mut self, ctx: &mut dyn SystemContext, ack: u64) {
        if ack > self.snd_una {
            self.snd_una = ack.min(self.snd_end);
            // A go-back-N rewind may have left snd_nxt behind old acknowledgements
            self.snd_nxt = self.snd_nxt.max(self.snd_una);
            self.dup_acks = 0;
            if self.cwnd < self.ssthresh {
                self.cwnd += 1.0;
            } else {
                self.cwnd += 1.0 / self.cwnd;
            }
            ctx.record_metric("cwnd", self.cwnd);

            ctx.cancel_timer(RTO_TIMER);
            self.timer_running = false;
            if self.snd_una < self.snd_nxt {
                self.arm_timer(ctx);
            }
            self.try_send(ctx);
        } else if ack == self.snd_una && self.snd_nxt > self.snd_una {
            self.dup_acks += 1;
            if self.dup_acks == DUP_ACK_THRESHOLD {
                let flight = self.in_flight() as f64 / self.mss as f64;
                self.ssthresh = (flight / 2.0).max(2.0);
                self.cwnd = self.ssthresh;
                ctx.log(&format!("fast retransmit seq={}", self.snd_una));
                ctx.record_metric("cwnd", self.cwnd);
                self.retransmit_head(ctx);
            }
        }
    }
}

impl TransportProtocol for StreamSender {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn on_app_data(&mut self, ctx: &mut dyn SystemContext, bytes: u32) -> bool {
        let buffered = self.snd_end - self.snd_una;
        if buffered + bytes as u64 > self.send_buffer {
            return false;
        }
        self.snd_end += bytes as u64;
        self.try_send(ctx);
        true
    }

    fn on_segment(&mut self, ctx: &mut dyn SystemContext, segment: Segment) {
        if let Segment::Ack { ack } = segment {
            self.handle_ack(ctx, ack);
        }
    }

    fn on_timer(&mut self, ctx: &mut dyn SystemContext, timer_id: u32) {
        if timer_id != RTO_TIMER {
            return;
        }
        self.timer_running = false;
        if self.snd_una >= self.snd_nxt {
            return;
        }
        ctx.log(&format!(
            "retransmission timeout, going back to seq={}",
            self.snd_una
        ));
        self.ssthresh = (self.cwnd / 2.0).max(2.0);
        self.cwnd = 1.0;
        self.dup_acks = 0;
        self.snd_nxt = self.snd_una;
        ctx.record_metric("cwnd", self.cwnd);
        self.try_send(ctx);
    }
}

/// Receiving half of a connection-oriented stream: cumulative ACKs, in-order delivery.
#[derive(Debug, Default)]
pub struct StreamReceiver {
    expected: u64,
}

impl StreamReceiver {
    pub fn delivered_bytes(&self) -> u64 {
        self.expected
    }
}

impl TransportProtocol for StreamReceiver {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn on_app_data(&mut self, _ctx: &mut dyn SystemContext, _bytes: u32) -> bool {
        false
    }

    fn on_segment(&mut self, ctx: &mut dyn SystemContext, segment: Segment) {
        let Segment::Data { seq, len } = segment else {
            return;
        };
        let end = seq + len as u64;
        if seq <= self.expected && end > self.expected {
            let fresh = end - self.expected;
            self.expected = end;
            ctx.deliver_data(fresh as u32);
        } else if seq > self.expected {
            ctx.log(&format!(
                "out-of-order seq={} (expect {}), discarded",
                seq, self.expected
            ));
        }
        ctx.send_segment(Segment::Ack { ack: self.expected });
    }
}

/// Sending endpoint for `protocol`.
pub fn sender(protocol: Protocol, tcp: &TcpConfig) -> Box<dyn TransportProtocol> {
    match protocol {
        Protocol::Udp => Box::new(DatagramSender),
        Protocol::Tcp => Box::new(StreamSender::new(tcp)),
    }
}

/// Receiving endpoint for `protocol`, one per remote peer.
pub fn receiver(protocol: Protocol) -> Box<dyn TransportProtocol> {
    match protocol {
        Protocol::Udp => Box::new(DatagramReceiver),
        Protocol::Tcp => Box::new(StreamReceiver::default()),
    }
}
