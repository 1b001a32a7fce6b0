//! Outbound flow control.
//!
//! An AGWPE TNC buffers whatever it is fed, and the slow radio channel
//! means that buffer can grow without bound. The TNC reports how many
//! data frames it still holds for a port ('y') or a connection ('Y'), and
//! the throttle uses those reports to keep at most `max_in_flight` frames
//! outstanding.
//!
//! Two throttles stack per connection: the connection tier paces one
//! AX.25 conversation (and owns the disconnect tail sequence), the port
//! tier paces the whole radio. Only the data-bearing kinds 'D', 'K', 'M'
//! and 'V' count; control traffic flows through uncounted.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::call::Addr;
use crate::frame::{DataKind, Frame};
use crate::timer::Timer;

pub const MAX_IN_FLIGHT: u32 = 8;

/// How often to re-ask the TNC for its queue depth while blocked.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Where drained frames go: the encoder queue for the port tier, the port
/// throttle for the connection tier.
pub trait Sink {
    fn is_full(&self) -> bool;
    fn push(&mut self, frame: Frame);
}

/// One queue entry: a frame, or a directive that runs when it reaches the
/// head of the queue. Directives are what makes the disconnect sequence
/// work: they reconfigure the throttle between the frames around them.
#[derive(Debug)]
pub enum Item {
    Frame(Frame),
    /// `max_in_flight := min_in_flight + 1`: hold the next frame until the
    /// TNC has nearly drained.
    ClampToMin,
    /// `max_in_flight := n`.
    SetMax(u32),
    StopPoll,
    /// Tell the owner to drop this throttle and its connection record.
    Destroy,
}

/// What a drain pass wants the owner to do.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Drain {
    pub destroy: bool,
}

#[derive(Debug)]
pub struct Throttle {
    /// Prebuilt 'y' or 'Y' query for this scope.
    query: Frame,
    buf: VecDeque<Item>,
    in_flight: u32,
    /// Smallest in-flight value the TNC has reported; the watermark the
    /// disconnect sequence drains down to.
    min_in_flight: u32,
    max_in_flight: u32,
    waiting_not_full: bool,
    poll: Timer,
}

impl Throttle {
    /// Port tier. Pacing state starts empty; the owner sends one 'y'
    /// query right after creation to learn the real queue depth.
    #[must_use]
    pub fn for_port(port: u8) -> Self {
        Self::new(Frame::new(DataKind::PortInFlight, port), 0)
    }

    /// Connection tier.
    ///
    /// Starts at in-flight 1, not 0: Direwolf reports Y=1 for a brand-new
    /// connection, and starting lower would make the disconnect watermark
    /// wait for a drain report that never comes.
    #[must_use]
    pub fn for_connection(port: u8, local: &Addr, remote: &Addr) -> Self {
        let mut query = Frame::new(DataKind::ConnInFlight, port);
        query.call_from = local.call();
        query.call_to = remote.call();
        Self::new(query, 1)
    }

    fn new(query: Frame, initial: u32) -> Self {
        Self {
            query,
            buf: VecDeque::new(),
            in_flight: initial,
            min_in_flight: initial,
            max_in_flight: MAX_IN_FLIGHT,
            waiting_not_full: false,
            poll: Timer::default(),
        }
    }

    /// Queue an item and drain as far as possible.
    pub fn write(&mut self, item: Item, sink: &mut dyn Sink) -> Drain {
        self.buf.push_back(item);
        self.try_drain(sink)
    }

    /// A 'y'/'Y' reply arrived.
    pub fn update_in_flight(&mut self, n: u32, sink: &mut dyn Sink) -> Drain {
        trace!("in-flight {} -> {n}", self.in_flight);
        self.in_flight = n;
        self.min_in_flight = self.min_in_flight.min(n);
        self.try_drain(sink)
    }

    /// The sink below us has room again.
    pub fn notify_not_full(&mut self, sink: &mut dyn Sink) -> Drain {
        self.waiting_not_full = false;
        self.try_drain(sink)
    }

    /// Re-query the TNC if the poll timer fired.
    pub fn tick(&mut self, sink: &mut dyn Sink) {
        if self.poll.expired() {
            if !sink.is_full() {
                sink.push(self.query.clone());
            }
            self.poll.start(POLL_INTERVAL);
        }
    }

    /// Drop queued 'D' frames. Used when the link disconnects under us:
    /// data can no longer be sent, but directives and the ID tail can.
    pub fn purge_data(&mut self) {
        let before = self.buf.len();
        self.buf
            .retain(|i| !matches!(i, Item::Frame(f) if f.kind == DataKind::Data));
        if self.buf.len() != before {
            debug!("purged {} queued data frames", before - self.buf.len());
        }
    }

    #[must_use]
    pub fn waiting_not_full(&self) -> bool {
        self.waiting_not_full
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.poll.deadline()
    }

    fn try_drain(&mut self, sink: &mut dyn Sink) -> Drain {
        loop {
            match self.buf.front() {
                None => {
                    self.poll.stop();
                    return Drain::default();
                }
                Some(Item::Frame(_)) => {
                    if sink.is_full() {
                        self.waiting_not_full = true;
                        return Drain::default();
                    }
                    if self.in_flight >= self.max_in_flight {
                        self.start_poll(sink);
                        return Drain::default();
                    }
                    if let Some(Item::Frame(frame)) = self.buf.pop_front() {
                        let data = frame.kind.is_data_bearing();
                        sink.push(frame);
                        if data {
                            self.in_flight += 1;
                            // Half way to the limit: ask for the queue
                            // depth now so the reply arrives before we
                            // have to stop.
                            if !sink.is_full() && self.in_flight == self.max_in_flight / 2 {
                                sink.push(self.query.clone());
                            }
                        }
                        self.poll.stop();
                    }
                }
                Some(_) => {
                    match self.buf.pop_front() {
                        Some(Item::ClampToMin) => {
                            self.max_in_flight = self.min_in_flight + 1;
                            trace!("clamped max in-flight to {}", self.max_in_flight);
                        }
                        Some(Item::SetMax(n)) => self.max_in_flight = n,
                        Some(Item::StopPoll) => self.poll.stop(),
                        Some(Item::Destroy) => return Drain { destroy: true },
                        Some(Item::Frame(_)) | None => {}
                    }
                }
            }
        }
    }

    fn start_poll(&mut self, sink: &mut dyn Sink) {
        if !self.poll.running() {
            if !sink.is_full() {
                sink.push(self.query.clone());
            }
            self.poll.start(POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::frame::NO_PID;

    #[derive(Default)]
    struct VecSink {
        frames: Vec<Frame>,
        full: bool,
    }

    impl Sink for VecSink {
        fn is_full(&self) -> bool {
            self.full
        }
        fn push(&mut self, frame: Frame) {
            self.frames.push(frame);
        }
    }

    fn data_frame(n: u8) -> Frame {
        Frame {
            port: 0,
            kind: DataKind::Data,
            pid: NO_PID,
            call_from: "N0CALL".into(),
            call_to: "W1AW".into(),
            user: 0,
            payload: vec![n],
        }
    }

    fn data_kinds(sink: &VecSink) -> Vec<u8> {
        sink.frames
            .iter()
            .filter(|f| f.kind == DataKind::Data)
            .filter_map(|f| f.payload.first().copied())
            .collect()
    }

    #[test]
    fn port_tier_caps_in_flight() {
        let mut t = Throttle::for_port(0);
        let mut sink = VecSink::default();
        for n in 0..20 {
            t.write(Item::Frame(data_frame(n)), &mut sink);
        }
        // Exactly the limit went through, in order, plus a look-ahead
        // query at the half-way mark.
        assert_eq!(data_kinds(&sink), (0..8).collect::<Vec<_>>());
        assert_eq!(t.in_flight(), 8);
        assert_eq!(t.queue_len(), 12);
        assert!(sink
            .frames
            .iter()
            .any(|f| f.kind == DataKind::PortInFlight));

        // A drain report releases the next window.
        sink.frames.clear();
        t.update_in_flight(0, &mut sink);
        assert_eq!(data_kinds(&sink), (8..16).collect::<Vec<_>>());
    }

    #[test]
    fn connection_tier_starts_at_one() -> Result<()> {
        let t = Throttle::for_connection(0, &Addr::new("N0CALL")?, &Addr::new("W1AW")?);
        assert_eq!(t.in_flight(), 1);
        Ok(())
    }

    #[test]
    fn control_frames_do_not_count() {
        let mut t = Throttle::for_port(0);
        let mut sink = VecSink::default();
        for _ in 0..5 {
            t.write(Item::Frame(Frame::new(DataKind::Connect, 0)), &mut sink);
        }
        assert_eq!(t.in_flight(), 0);
        assert_eq!(sink.frames.len(), 5);
    }

    #[test]
    fn full_sink_suspends_until_notified() {
        let mut t = Throttle::for_port(0);
        let mut sink = VecSink {
            full: true,
            ..Default::default()
        };
        t.write(Item::Frame(data_frame(0)), &mut sink);
        assert!(t.waiting_not_full());
        assert!(sink.frames.is_empty());

        sink.full = false;
        t.notify_not_full(&mut sink);
        assert!(!t.waiting_not_full());
        assert_eq!(sink.frames.len(), 1);
    }

    #[test]
    fn poll_query_sent_when_blocked() {
        let mut t = Throttle::for_port(0);
        let mut sink = VecSink::default();
        for n in 0..9 {
            t.write(Item::Frame(data_frame(n)), &mut sink);
        }
        // Blocked at 8: one look-ahead query at 4 and one on blocking.
        let queries = sink
            .frames
            .iter()
            .filter(|f| f.kind == DataKind::PortInFlight)
            .count();
        assert_eq!(queries, 2);
        assert!(t.deadline().is_some());
    }

    #[test]
    fn disconnect_tail_waits_for_drain() -> Result<()> {
        // The 'd' must not pass the throttle while earlier data is still
        // in the TNC; the ID tail follows the 'd'.
        let local = Addr::new("N0CALL")?;
        let remote = Addr::new("W1AW")?;
        let mut t = Throttle::for_connection(0, &local, &remote);
        let mut sink = VecSink::default();

        for n in 0..3 {
            t.write(Item::Frame(data_frame(n)), &mut sink);
        }
        assert_eq!(t.in_flight(), 4); // 1 initial + 3 data

        let mut d = Frame::new(DataKind::Disconnect, 0);
        d.call_from = local.call();
        d.call_to = remote.call();
        let mut id = Frame::new(DataKind::Unproto, 0);
        id.call_from = local.call();
        id.call_to = "ID".into();
        id.payload = b"K1AA".to_vec();

        t.write(Item::ClampToMin, &mut sink);
        t.write(Item::Frame(d), &mut sink);
        t.write(Item::SetMax(MAX_IN_FLIGHT), &mut sink);
        t.write(Item::Frame(id), &mut sink);

        // min_in_flight is 1, so the clamp is 2 and nothing moves while
        // the TNC still reports more than one frame queued.
        let held = sink.frames.len();
        assert!(!sink
            .frames
            .iter()
            .any(|f| f.kind == DataKind::Disconnect));
        t.update_in_flight(3, &mut sink);
        assert_eq!(
            sink.frames
                .iter()
                .skip(held)
                .filter(|f| f.kind != DataKind::ConnInFlight)
                .count(),
            0
        );

        // Drained: 'd' goes out, then the ID frame.
        t.update_in_flight(0, &mut sink);
        let tail: Vec<DataKind> = sink
            .frames
            .iter()
            .filter(|f| f.kind == DataKind::Disconnect || f.kind == DataKind::Unproto)
            .map(|f| f.kind)
            .collect();
        assert_eq!(tail, vec![DataKind::Disconnect, DataKind::Unproto]);

        // And every data frame came before the 'd'.
        let d_pos = sink
            .frames
            .iter()
            .position(|f| f.kind == DataKind::Disconnect)
            .expect("disconnect sent");
        let last_data = sink
            .frames
            .iter()
            .rposition(|f| f.kind == DataKind::Data)
            .expect("data sent");
        assert!(last_data < d_pos);
        Ok(())
    }

    #[test]
    fn purge_drops_only_data() {
        let mut t = Throttle::for_port(0);
        let mut sink = VecSink {
            full: true,
            ..Default::default()
        };
        t.write(Item::Frame(data_frame(0)), &mut sink);
        t.write(Item::Frame(Frame::new(DataKind::Disconnect, 0)), &mut sink);
        t.write(Item::Frame(Frame::new(DataKind::Unproto, 0)), &mut sink);
        assert_eq!(t.queue_len(), 3);
        t.purge_data();
        assert_eq!(t.queue_len(), 2);
    }

    #[test]
    fn destroy_directive_reaches_owner() {
        let mut t = Throttle::for_port(0);
        let mut sink = VecSink::default();
        assert_eq!(t.write(Item::Destroy, &mut sink), Drain { destroy: true });
    }

    #[test]
    fn window_respected_between_updates() {
        // Between two consecutive queue-depth reports, no more than
        // max_in_flight data frames pass.
        let mut t = Throttle::for_port(0);
        let mut sink = VecSink::default();
        for n in 0..40 {
            t.write(Item::Frame(data_frame(n)), &mut sink);
        }
        let mut seen = data_kinds(&sink).len();
        assert!(seen <= MAX_IN_FLIGHT as usize);
        for round in 1..4 {
            sink.frames.clear();
            t.update_in_flight(0, &mut sink);
            let burst = data_kinds(&sink).len();
            assert!(burst <= MAX_IN_FLIGHT as usize, "round {round}");
            seen += burst;
        }
        assert_eq!(seen, 32);
    }
}
