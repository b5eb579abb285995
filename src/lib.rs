//! Firmware core for a USB-attached DMX512 (ANSI E1.11) / RDM (ANSI E1.20)
//! interface: an RS485 bus on one side, a host transport on the other. The
//! crate is no-std and no-alloc; platform crates supply the hardware behind
//! the capability traits in [hal].
//!
//! Please refer to the [official specifications](https://tsp.esta.org/)
//! published by the ESTA.
//!
//! Two subsystems do the heavy lifting:
//!
//! * [transceiver] frames DMX/RDM at the line level: break and mark
//!   generation, slot transmission, break/mark measurement on receive,
//!   discovery-response windows, direction control and the timing rules of
//!   both standards. Interrupt handlers call its `on_*` methods; the main
//!   loop calls `tasks()` and drains completion events.
//! * [rdm_responder] implements the responder model: PID dispatch over a
//!   declarative responder definition, discovery (mute / un-mute / unique
//!   branch), sensors, personalities and the identify/mute indicator lamps.
//!
//! The typical responder glue looks like this:
//!
//! ```ignore
//! loop {
//!     transceiver.tasks();
//!     responder.tasks(&clock, &mut lamps);
//!
//!     while let Some(event) = transceiver.poll_event() {
//!         if event.op != Operation::Rx {
//!             continue;
//!         }
//!         let mut ctx = DispatchContext {
//!             clock: &clock,
//!             counters: &mut counters,
//!             lamps: &mut lamps,
//!             reply: &mut reply,
//!         };
//!         match responder.handle_frame(&event.data, &mut ctx) {
//!             DispatchOutcome::Reply(len) => {
//!                 transceiver.queue_rdm_response(true, &reply.as_slice()[..len]);
//!             }
//!             DispatchOutcome::DubReply(len) => {
//!                 transceiver.queue_rdm_response(false, &reply.as_slice()[..len]);
//!             }
//!             DispatchOutcome::NoResponse => {}
//!         }
//!     }
//! }
//! ```
//!
//! In controller mode the host queues frames (`queue_dmx`,
//! `queue_rdm_request`, `queue_rdm_dub`, ...) and receives the captured
//! response bytes in the completion events; classifying RDM responses is the
//! host's job.

#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docsrs, feature(doc_cfg))]

/// The 100µs-resolution time source behind timeouts, backoff and lamps.
pub mod coarse_timer;
pub mod command_class;
pub mod consts;
/// Hardware capability traits the core is written against.
pub mod hal;
mod layouts;
pub mod pids;
/// Frame staging, serialization helpers, checksums and validation.
pub mod rdm_frame;
/// The RDM responder model and PID dispatch.
pub mod rdm_responder;
pub mod receiver_counters;
/// Timing constants from the standards and the runtime timing settings.
pub mod timing;
/// The line-level state machine driving the RS485 bus.
pub mod transceiver;
pub mod types;
pub mod unique_identifier;
