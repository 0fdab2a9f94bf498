//! Event ring consumption.
//!
//! One run copies every event the controller has produced into a staging
//! buffer, hands the ring space back through ERDP, and only then looks at the
//! events. Handlers may therefore submit new commands or transfers without
//! racing the controller for event ring space.

use alloc::vec::Vec;

use log::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::hal::Mmio;
use crate::regs::{rt, Registers, ERDP_EHB};
use crate::ring::EventRing;
use crate::trb::{Trb, TrbType};

const INITIAL_STAGING: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    CommandCompletion,
    PortStatusChange,
    TransferEvent,
    Unknown(u8),
}

impl EventKind {
    pub fn of(trb: &Trb) -> Self {
        match trb.trb_type() {
            Some(TrbType::CommandCompletionEvent) => EventKind::CommandCompletion,
            Some(TrbType::PortStatusChangeEvent) => EventKind::PortStatusChange,
            Some(TrbType::TransferEvent) => EventKind::TransferEvent,
            _ => EventKind::Unknown(trb.raw_type()),
        }
    }
}

/// Receivers for the event kinds the driver understands.
pub trait EventSink {
    fn command_completion(&mut self, event: &Trb) -> Result<()>;
    fn port_status_change(&mut self, event: &Trb) -> Result<()>;
    fn transfer_event(&mut self, event: &Trb) -> Result<()>;
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EventRunReport {
    pub drained: usize,
    pub handled: usize,
    pub failed: usize,
}

/// Copy out everything the consumer owns. If the staging buffer cannot grow,
/// the rest stays in the ring for the next run.
pub fn drain(ring: &mut EventRing) -> Vec<Trb> {
    let mut events = Vec::new();
    if events.try_reserve_exact(INITIAL_STAGING).is_err() {
        error!("not enough memory to run the event ring");
        return events;
    }

    loop {
        if events.len() == events.capacity() && events.try_reserve_exact(events.capacity()).is_err() {
            warn!("event staging full at {} entries, leaving the rest", events.len());
            break;
        }
        let Some(trb) = ring.dequeue() else { break };
        trace!("dequeued {:?}", EventKind::of(&trb));
        events.push(trb);
    }
    events
}

/// Tell the controller how far we got and clear Event Handler Busy.
pub fn acknowledge<M: Mmio>(ring: &EventRing, regs: &Registers<M>) {
    regs.write_intr64(rt::ERDP_LO, rt::ERDP_HI, ring.dequeue_ptr() | ERDP_EHB);
}

pub fn dispatch<S: EventSink>(sink: &mut S, events: &[Trb]) -> EventRunReport {
    let mut report = EventRunReport {
        drained: events.len(),
        ..Default::default()
    };

    for event in events {
        let result = match EventKind::of(event) {
            EventKind::CommandCompletion => sink.command_completion(event),
            EventKind::PortStatusChange => sink.port_status_change(event),
            EventKind::TransferEvent => sink.transfer_event(event),
            EventKind::Unknown(ty) => Err(Error::UnknownEvent(ty)),
        };
        match result {
            Ok(()) => report.handled += 1,
            Err(err) => {
                error!("failed to handle event {:?}: {}", event, err);
                report.failed += 1;
            }
        }
    }
    report
}

/// One full run: drain, ERDP handshake, dispatch.
pub fn run<M: Mmio, S: EventSink>(ring: &mut EventRing, regs: &Registers<M>, sink: &mut S) -> EventRunReport {
    let events = drain(ring);
    acknowledge(ring, regs);

    if events.is_empty() {
        warn!("no events to be handled");
        return EventRunReport::default();
    }
    let report = dispatch(sink, &events);
    debug!("event ring run: {:?}", report);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostHal;
    use crate::regs::Capabilities;
    use crate::trb::CompletionCode;
    use alloc::vec;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<EventKind>,
        fail_transfers: bool,
    }

    impl EventSink for Recorder {
        fn command_completion(&mut self, _: &Trb) -> Result<()> {
            self.seen.push(EventKind::CommandCompletion);
            Ok(())
        }

        fn port_status_change(&mut self, _: &Trb) -> Result<()> {
            self.seen.push(EventKind::PortStatusChange);
            Ok(())
        }

        fn transfer_event(&mut self, _: &Trb) -> Result<()> {
            self.seen.push(EventKind::TransferEvent);
            if self.fail_transfers {
                Err(Error::Transfer(CompletionCode::Stall))
            } else {
                Ok(())
            }
        }
    }

    fn event(ty: u8) -> Trb {
        Trb::new(0, 0, (ty as u32) << 10)
    }

    #[test]
    fn classification() {
        assert_eq!(EventKind::of(&event(33)), EventKind::CommandCompletion);
        assert_eq!(EventKind::of(&event(34)), EventKind::PortStatusChange);
        assert_eq!(EventKind::of(&event(32)), EventKind::TransferEvent);
        assert_eq!(EventKind::of(&event(37)), EventKind::Unknown(37));
        assert_eq!(EventKind::of(&event(50)), EventKind::Unknown(50));
    }

    #[test]
    fn failures_do_not_stop_the_run() {
        let events = vec![event(32), event(39), event(33), event(34)];
        let mut sink = Recorder {
            fail_transfers: true,
            ..Default::default()
        };
        let report = dispatch(&mut sink, &events);

        assert_eq!(
            sink.seen,
            [
                EventKind::TransferEvent,
                EventKind::CommandCompletion,
                EventKind::PortStatusChange
            ]
        );
        assert_eq!(
            report,
            EventRunReport {
                drained: 4,
                handled: 2,
                failed: 2
            }
        );
    }

    #[test]
    fn run_drains_past_initial_staging_and_acks() {
        let (mut hal, sim) = HostHal::new();
        let mmio = sim.mmio();
        let caps = Capabilities::read(&mmio);
        let regs = Registers::new(mmio, &caps);
        let mut ring = EventRing::new(&mut hal, 1, 64, true).unwrap();
        sim.attach_event_ring(ring.erst_phys(), 1);

        for _ in 0..40 {
            sim.post_event(event(34));
        }
        let mut sink = Recorder::default();
        let report = run(&mut ring, &regs, &mut sink);
        assert_eq!(report.drained, 40);
        assert_eq!(report.handled, 40);

        let erdp = sim.erdp();
        assert_eq!(erdp & !0xF, ring.dequeue_ptr());
        assert_eq!(erdp & ERDP_EHB, 0, "EHB is write-1-to-clear");

        // Nothing new: reported, not an error.
        assert_eq!(run(&mut ring, &regs, &mut sink), EventRunReport::default());

        ring.release(&mut hal);
    }
}
