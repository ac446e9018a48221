use crate::packet::{Protocol, Segment};
use crate::units::SimTime;

/// The capability the simulator hands to a transport endpoint.
///
/// Every call is buffered and applied by the simulator once the endpoint
/// returns, so an endpoint never observes its own side effects mid-call.
pub trait SystemContext {
    /// Send a segment to this endpoint's peer through the network layer.
    fn send_segment(&mut self, segment: Segment);

    /// Start (or restart) the timer identified by `timer_id`.
    fn start_timer(&mut self, delay: SimTime, timer_id: u32);

    /// Cancel a running timer. Unknown ids are ignored.
    fn cancel_timer(&mut self, timer_id: u32);

    /// Hand `bytes` of in-order payload up to the application.
    fn deliver_data(&mut self, bytes: u32);

    /// Log a message to the simulator's debug output.
    fn log(&mut self, message: &str);

    /// Current simulation time.
    fn now(&self) -> SimTime;

    /// Record a numeric time-series sample (e.g. congestion window).
    fn record_metric(&mut self, _name: &str, _value: f64) {}
}

/// One side of a transport conversation.
///
/// Senders receive application writes and acknowledgements; receivers receive
/// data segments and answer with acknowledgements where the protocol needs them.
pub trait TransportProtocol {
    fn protocol(&self) -> Protocol;

    /// The application wants to send `bytes`. Returns `false` if the write was refused.
    fn on_app_data(&mut self, ctx: &mut dyn SystemContext, bytes: u32) -> bool;

    /// A segment addressed to this endpoint arrived.
    fn on_segment(&mut self, ctx: &mut dyn SystemContext, segment: Segment);

    /// A timer started through [`SystemContext::start_timer`] expired.
    fn on_timer(&mut self, _ctx: &mut dyn SystemContext, _timer_id: u32) {}
}
