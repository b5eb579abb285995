//! The line-level DMX/RDM engine.
//!
//! One state machine frames outgoing traffic (break, mark-after-break,
//! slots) and times inbound responses when acting as a controller; a second
//! receives frames and drives timed replies when acting as a responder. The
//! hardware-event edges of both live in the `on_*` methods, which the
//! platform calls from its timer / input-capture / UART interrupt handlers;
//! everything that can wait runs in [Transceiver::tasks] from the
//! cooperative main loop.
//!
//! The platform must serialize the `on_*` calls against `tasks()` (mask the
//! relevant interrupts while `tasks()` touches the engine, which is the
//! natural state of affairs on a single-core part). Completed operations are
//! reported as [TransceiverEvent]s drained through
//! [Transceiver::poll_event]; the host glue is expected to drain events and
//! queue any RDM reply before calling `tasks()` again.

use heapless::Deque;
use log::{debug, error, info, warn};

use crate::coarse_timer::{CoarseTimer, TimerValue};
use crate::consts::{DMX_MAX_FRAME_SIZE, DMX_MAX_SLOT_COUNT, NULL_START_CODE, SC_RDM, SC_SUB_MESSAGE};
use crate::hal::TransceiverHal;
use crate::timing::{
    TimingSettings, CONTROLLER_BROADCAST_BACKOFF, CONTROLLER_DUB_BACKOFF,
    CONTROLLER_MIN_BREAK_TO_BREAK, CONTROLLER_MISSING_RESPONSE_BACKOFF,
    CONTROLLER_NON_RDM_BACKOFF, CONTROLLER_RDM_INTERSLOT_TIMEOUT, CONTROLLER_RX_BREAK_MAX,
    CONTROLLER_RX_BREAK_MIN, CONTROLLER_RX_MARK_MAX, RESPONDER_DMX_INTERSLOT_TIMEOUT,
    RESPONDER_RDM_INTERSLOT_TIMEOUT, RESPONDER_REPLY_GRACE, RESPONDER_RX_BREAK_MAX,
    RESPONDER_RX_BREAK_MIN, RESPONDER_RX_MARK_MAX, RESPONDER_RX_MARK_MIN,
};

/// start code + 512 slots
const BUFFER_SIZE: usize = DMX_MAX_FRAME_SIZE;
const NUMBER_OF_BUFFERS: usize = 2;
const EVENT_QUEUE_SIZE: usize = 8;

/// Token value for operations that don't want a completion notification.
pub const NO_NOTIFICATION: i16 = -1;

const SELF_TEST_VALUE: u8 = 0xA5;
/// 10ms, in coarse ticks.
const SELF_TEST_TIMEOUT: u32 = 100;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransceiverMode {
    Controller,
    Responder,
    SelfTest,
}

/// The operation class reported in a completion event.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Operation {
    TxOnly,
    RdmDub,
    RdmBroadcast,
    RdmWithResponse,
    Rx,
    SelfTest,
    ModeChange,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OperationResult {
    Ok,
    /// The operation was flushed by a reset or mode change; re-queue to
    /// retry, nothing was retried internally.
    Cancelled,
    /// No response arrived within the response timeout.
    RxTimeout,
    /// Response data was captured.
    RxData,
    /// The response violated the break/mark timing tolerances.
    RxInvalid,
    /// An inbound frame ended on the inter-slot timeout.
    RxFrameTimeout,
    SelfTestFailed,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DubTiming {
    /// Fine-timer tick of the first falling edge after the request.
    pub start: u32,
    /// Fine-timer tick of the last observed edge.
    pub end: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ResponseTiming {
    pub break_start: u32,
    pub mark_start: u32,
    pub mark_end: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RequestTiming {
    /// Measured break duration, in 0.1µs ticks.
    pub break_ticks: u32,
    /// Measured mark-after-break duration, in 0.1µs ticks.
    pub mark_ticks: u32,
}

/// Line timing captured alongside a frame, when the operation has any.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameTiming {
    None,
    DubResponse(DubTiming),
    Response(ResponseTiming),
    Request(RequestTiming),
}

/// A completion or received-frame notification.
#[derive(Debug)]
pub struct TransceiverEvent {
    pub token: i16,
    pub op: Operation,
    pub result: OperationResult,
    pub timing: FrameTiming,
    pub data: heapless::Vec<u8, BUFFER_SIZE>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum InternalOp {
    TxOnly,
    RdmDub,
    RdmBroadcast,
    RdmWithResponse,
    Rx,
    SelfTest,
    /// Responder reply with a break.
    RdmResponse,
    /// Responder reply without a break (DUB).
    RdmDubResponse,
}

impl InternalOp {
    fn operation(self) -> Operation {
        match self {
            InternalOp::TxOnly => Operation::TxOnly,
            InternalOp::RdmDub => Operation::RdmDub,
            InternalOp::RdmBroadcast => Operation::RdmBroadcast,
            InternalOp::RdmWithResponse => Operation::RdmWithResponse,
            InternalOp::Rx | InternalOp::RdmResponse | InternalOp::RdmDubResponse => Operation::Rx,
            InternalOp::SelfTest => Operation::SelfTest,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum State {
    // Controller
    CtrlInitialize,
    CtrlTxReady,
    CtrlInBreak,
    CtrlInMark,
    CtrlTxData,
    CtrlTxDrain,
    CtrlRxWaitForBreak,
    CtrlRxInBreak,
    CtrlRxInMark,
    CtrlRxData,
    CtrlRxWaitForDub,
    CtrlRxInDub,
    CtrlRxTimeout,
    CtrlComplete,
    CtrlBackoff,

    // Responder
    RespInitialize,
    RespRxPrepare,
    RespRxMarkBeforeBreak,
    RespRxBreak,
    RespRxMark,
    RespRxData,
    /// A complete frame has been handed up; waiting for the dispatch layer
    /// to queue a reply (or for the grace period to run out).
    RespFrameComplete,
    RespTxWaiting,
    RespTxBreak,
    RespTxMark,
    RespTxData,
    RespTxDrain,
    RespTxComplete,

    // Self test
    TestInitialize,
    TestTxReady,
    TestRxWait,
    TestVerify,

    Reset,
    Error,
}

struct Buffer {
    size: usize,
    op: InternalOp,
    token: i16,
    data: [u8; BUFFER_SIZE],
}

impl Buffer {
    const fn new() -> Self {
        Self {
            size: 0,
            op: InternalOp::Rx,
            token: NO_NOTIFICATION,
            data: [0u8; BUFFER_SIZE],
        }
    }
}

/// Small xorshift generator feeding the optional responder jitter.
struct JitterRng {
    state: u16,
}

impl JitterRng {
    const fn new() -> Self {
        Self { state: 0xACE1 }
    }

    fn reseed(&mut self, entropy: u32) {
        let mixed = (entropy ^ (entropy >> 16)) as u16;
        if mixed != 0 {
            self.state = mixed;
        }
    }

    fn next(&mut self) -> u16 {
        let mut x = self.state;
        x ^= x << 7;
        x ^= x >> 9;
        x ^= x << 8;
        self.state = x;
        x
    }
}

/// The transceiver engine. `H` is the board's line-level capability object.
pub struct Transceiver<'a, H: TransceiverHal> {
    hal: H,
    clock: &'a CoarseTimer,

    state: State,
    logged_state: State,
    mode: TransceiverMode,
    desired_mode: TransceiverMode,
    mode_change_token: i16,

    settings: TimingSettings,

    buffers: [Buffer; NUMBER_OF_BUFFERS],
    active: Option<usize>,
    next: Option<usize>,
    free: heapless::Vec<usize, NUMBER_OF_BUFFERS>,

    data_index: usize,
    expected_length: usize,
    found_expected_length: bool,
    result: OperationResult,

    tx_frame_start: TimerValue,
    tx_frame_end: TimerValue,
    /// Coarse-tick wait for the current response window.
    rdm_response_timeout: u32,
    /// Fine-timer tick of the last level change (responder RX).
    last_change: u32,
    /// Fine-timer tick of the last received byte.
    last_byte_fine: u32,
    last_byte_coarse: TimerValue,

    dub_timing: DubTiming,
    response_timing: ResponseTiming,
    request_timing: RequestTiming,

    jitter_rng: JitterRng,
    events: Deque<TransceiverEvent, EVENT_QUEUE_SIZE>,
}

impl<'a, H: TransceiverHal> Transceiver<'a, H> {
    /// Build the engine around its capability object. Starts in responder
    /// mode, listening.
    pub fn new(hal: H, clock: &'a CoarseTimer) -> Self {
        let mut transceiver = Self {
            hal,
            clock,
            state: State::RespInitialize,
            logged_state: State::Reset,
            mode: TransceiverMode::Responder,
            desired_mode: TransceiverMode::Responder,
            mode_change_token: NO_NOTIFICATION,
            settings: TimingSettings::new(),
            buffers: [Buffer::new(), Buffer::new()],
            active: None,
            next: None,
            free: heapless::Vec::new(),
            data_index: 0,
            expected_length: 0,
            found_expected_length: false,
            result: OperationResult::Ok,
            tx_frame_start: 0,
            tx_frame_end: 0,
            rdm_response_timeout: 0,
            last_change: 0,
            last_byte_fine: 0,
            last_byte_coarse: 0,
            dub_timing: DubTiming::default(),
            response_timing: ResponseTiming::default(),
            request_timing: RequestTiming::default(),
            jitter_rng: JitterRng::new(),
            events: Deque::new(),
        };
        transceiver.initialize_buffers();
        transceiver
    }

    pub fn mode(&self) -> TransceiverMode {
        self.mode
    }

    /// Direct access to the capability object.
    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    /// Request a role change. The switch happens at the next safe point in
    /// `tasks()`; `token` is echoed in the completion event. Returns false
    /// if a change is already pending or the mode is unchanged.
    pub fn set_mode(&mut self, mode: TransceiverMode, token: i16) -> bool {
        if self.mode != self.desired_mode {
            warn!("mode change already pending");
            return false;
        }
        if self.mode == mode {
            return false;
        }
        info!("switching to {:?} mode", mode);
        self.desired_mode = mode;
        self.mode_change_token = token;
        true
    }

    /// Drain the next completion / received-frame notification.
    pub fn poll_event(&mut self) -> Option<TransceiverEvent> {
        self.events.pop_front()
    }

    /// The number of free frame buffers. Exposed for testing.
    pub fn free_buffer_count(&self) -> usize {
        self.free.len()
    }

    // Timing configuration pass-through.
    // ------------------------------------------------------------------

    pub fn set_break_time(&mut self, micros: u16) -> bool {
        let ok = self.settings.set_break_time(micros);
        if ok {
            debug!("break time set to {}us", micros);
        }
        ok
    }

    pub fn break_time(&self) -> u16 {
        self.settings.break_time()
    }

    pub fn set_mark_time(&mut self, micros: u16) -> bool {
        let ok = self.settings.set_mark_time(micros);
        if ok {
            debug!("mark time set to {}us", micros);
        }
        ok
    }

    pub fn mark_time(&self) -> u16 {
        self.settings.mark_time()
    }

    pub fn set_rdm_broadcast_timeout(&mut self, ticks: u16) -> bool {
        self.settings.set_rdm_broadcast_timeout(ticks)
    }

    pub fn rdm_broadcast_timeout(&self) -> u16 {
        self.settings.rdm_broadcast_timeout()
    }

    pub fn set_rdm_response_timeout(&mut self, ticks: u16) -> bool {
        self.settings.set_rdm_response_timeout(ticks)
    }

    pub fn rdm_response_timeout(&self) -> u16 {
        self.settings.rdm_response_timeout()
    }

    pub fn set_rdm_dub_response_limit(&mut self, ticks: u16) -> bool {
        self.settings.set_rdm_dub_response_limit(ticks)
    }

    pub fn rdm_dub_response_limit(&self) -> u16 {
        self.settings.rdm_dub_response_limit()
    }

    pub fn set_rdm_responder_delay(&mut self, ticks: u16) -> bool {
        self.settings.set_rdm_responder_delay(ticks)
    }

    pub fn rdm_responder_delay(&self) -> u16 {
        self.settings.rdm_responder_delay()
    }

    pub fn set_rdm_responder_jitter(&mut self, ticks: u16) -> bool {
        self.settings.set_rdm_responder_jitter(ticks)
    }

    pub fn rdm_responder_jitter(&self) -> u16 {
        self.settings.rdm_responder_jitter()
    }

    // Queueing.
    // ------------------------------------------------------------------

    pub fn queue_dmx(&mut self, token: i16, slots: &[u8]) -> bool {
        self.queue_frame(token, NULL_START_CODE, InternalOp::TxOnly, slots)
    }

    pub fn queue_asc(&mut self, token: i16, start_code: u8, slots: &[u8]) -> bool {
        self.queue_frame(token, start_code, InternalOp::TxOnly, slots)
    }

    pub fn queue_rdm_dub(&mut self, token: i16, frame: &[u8]) -> bool {
        self.queue_frame(token, SC_RDM, InternalOp::RdmDub, frame)
    }

    pub fn queue_rdm_request(&mut self, token: i16, frame: &[u8], is_broadcast: bool) -> bool {
        let op = if is_broadcast {
            InternalOp::RdmBroadcast
        } else {
            InternalOp::RdmWithResponse
        };
        self.queue_frame(token, SC_RDM, op, frame)
    }

    pub fn queue_self_test(&mut self, token: i16) -> bool {
        self.queue_frame(token, 0, InternalOp::SelfTest, &[])
    }

    /// Queue the reply to the frame most recently handed up. Only valid
    /// between the frame notification and the next reception re-arm.
    pub fn queue_rdm_response(&mut self, include_break: bool, frame: &[u8]) -> bool {
        if self.mode != TransceiverMode::Responder || self.state != State::RespFrameComplete {
            return false;
        }
        if self.next.is_some() {
            return false;
        }
        let Some(index) = self.free.pop() else {
            return false;
        };

        let buffer = &mut self.buffers[index];
        let length = if frame.len() > BUFFER_SIZE {
            error!("truncated rdm response");
            BUFFER_SIZE
        } else {
            frame.len()
        };
        buffer.data[..length].copy_from_slice(&frame[..length]);
        buffer.size = length;
        buffer.token = NO_NOTIFICATION;
        buffer.op = if include_break {
            InternalOp::RdmResponse
        } else {
            InternalOp::RdmDubResponse
        };
        self.next = Some(index);
        true
    }

    fn queue_frame(&mut self, token: i16, start_code: u8, op: InternalOp, slots: &[u8]) -> bool {
        if op == InternalOp::SelfTest {
            if self.mode != TransceiverMode::SelfTest {
                return false;
            }
        } else if self.mode != TransceiverMode::Controller {
            return false;
        }
        if self.next.is_some() {
            return false;
        }
        let Some(index) = self.free.pop() else {
            return false;
        };

        let buffer = &mut self.buffers[index];
        let size = slots.len().min(DMX_MAX_SLOT_COUNT);
        buffer.data[0] = start_code;
        buffer.data[1..1 + size].copy_from_slice(&slots[..size]);
        buffer.size = size + 1;
        buffer.op = op;
        buffer.token = token;
        self.next = Some(index);
        true
    }

    /// Abort everything: cancels the active and queued operations (their
    /// tokens come back as [OperationResult::Cancelled]), restores default
    /// timing settings and puts the line back into receive.
    pub fn reset(&mut self) {
        info!("transceiver reset");
        self.hal.uart_tx_irq_enable(false);
        self.hal.uart_rx_irq_enable(false);
        self.hal.timer_irq_enable(false);
        self.hal.timer_stop();
        self.hal.capture_disable();
        self.hal.uart_rx_enable(false);
        self.hal.uart_tx_enable(false);
        self.hal.uart_disable();

        if let Some(index) = self.active.take() {
            self.emit_cancelled(index);
        }
        if let Some(index) = self.next.take() {
            self.emit_cancelled(index);
        }
        self.initialize_buffers();
        self.settings = TimingSettings::new();

        self.hal.set_mark();
        self.hal.enable_rx();
        self.state = State::Reset;
    }

    // Foreground.
    // ------------------------------------------------------------------

    /// One cooperative scheduling slice. Never blocks.
    pub fn tasks(&mut self) {
        loop {
            if self.state != self.logged_state {
                debug!("state {:?}", self.state);
                self.logged_state = self.state;
            }
            if !self.tasks_step() {
                return;
            }
        }
    }

    /// Runs one state transition. Returns true when the new state wants to
    /// be serviced immediately (the fall-through chains).
    fn tasks_step(&mut self) -> bool {
        match self.state {
            State::CtrlInitialize => {
                self.hal.timer_irq_enable(false);
                self.hal.timer_stop();
                self.hal.uart_rx_enable(false);
                self.hal.uart_tx_enable(false);
                self.hal.uart_disable();
                self.hal.capture_disable();
                self.reset_to_mark();
                self.state = State::CtrlTxReady;
                true
            }
            State::CtrlTxReady => {
                if self.desired_mode != TransceiverMode::Controller {
                    self.switch_mode();
                    return true;
                }
                if self.next.is_none() {
                    return false;
                }
                self.take_next_buffer();

                self.found_expected_length = false;
                self.expected_length = 0;
                self.result = OperationResult::Ok;
                self.dub_timing = DubTiming::default();
                self.response_timing = ResponseTiming::default();

                self.hal.uart_tx_irq_on_space(true);

                self.state = State::CtrlInBreak;
                self.tx_frame_start = self.clock.now();
                self.hal.set_timer_counter(0);
                self.hal.set_timer_period(self.settings.break_ticks());
                self.hal.timer_irq_enable(true);
                self.hal.set_break();
                self.hal.timer_start();
                false
            }
            State::CtrlInBreak
            | State::CtrlInMark
            | State::CtrlTxData
            | State::CtrlTxDrain => false,

            State::CtrlRxWaitForBreak => {
                if self
                    .clock
                    .has_elapsed(self.tx_frame_end, self.rdm_response_timeout)
                {
                    self.hal.capture_disable();
                    self.hal.uart_rx_irq_enable(false);
                    self.hal.timer_stop();
                    self.hal.uart_rx_enable(false);
                    self.reset_to_mark();
                    self.state = State::CtrlRxTimeout;
                    return true;
                }
                false
            }
            State::CtrlRxInBreak => {
                let elapsed = self
                    .hal
                    .timer_counter()
                    .wrapping_sub(self.response_timing.break_start);
                if elapsed > CONTROLLER_RX_BREAK_MAX {
                    self.result = OperationResult::RxInvalid;
                    self.hal.capture_disable();
                    self.hal.timer_stop();
                    self.reset_to_mark();
                    self.state = State::CtrlComplete;
                    return true;
                }
                false
            }
            State::CtrlRxInMark => {
                let elapsed = self
                    .hal
                    .timer_counter()
                    .wrapping_sub(self.response_timing.mark_start);
                if elapsed > CONTROLLER_RX_MARK_MAX {
                    self.result = OperationResult::RxInvalid;
                    self.hal.capture_disable();
                    self.hal.timer_stop();
                    self.reset_to_mark();
                    self.state = State::CtrlComplete;
                    return true;
                }
                false
            }
            State::CtrlRxData => {
                // There is no hard ceiling on RDM response length in time;
                // bounding the inter-slot gap together with the fixed buffer
                // bounds how long a bad responder can hold the line.
                if self.data_index > 0
                    && self
                        .clock
                        .has_elapsed(self.last_byte_coarse, CONTROLLER_RDM_INTERSLOT_TIMEOUT)
                {
                    self.hal.timer_stop();
                    self.hal.uart_rx_irq_enable(false);
                    self.hal.uart_rx_enable(false);
                    self.reset_to_mark();
                    self.state = State::CtrlComplete;
                    return true;
                }
                false
            }
            State::CtrlRxWaitForDub => {
                if self
                    .clock
                    .has_elapsed(self.tx_frame_end, self.rdm_response_timeout)
                {
                    self.hal.capture_disable();
                    self.hal.uart_rx_irq_enable(false);
                    self.hal.uart_rx_enable(false);
                    self.hal.timer_stop();
                    self.reset_to_mark();
                    self.state = State::CtrlRxTimeout;
                    return true;
                }
                false
            }
            State::CtrlRxInDub => {
                let elapsed = self.hal.timer_counter().wrapping_sub(self.dub_timing.start);
                if elapsed > self.settings.rdm_dub_response_limit() as u32 {
                    // At least one falling edge arrived, so the window
                    // closes as data, not as a timeout.
                    self.hal.capture_disable();
                    self.hal.uart_rx_irq_enable(false);
                    self.hal.uart_rx_enable(false);
                    self.hal.timer_stop();
                    self.reset_to_mark();
                    self.state = State::CtrlComplete;
                    return true;
                }
                false
            }
            State::CtrlRxTimeout => {
                debug!("rx timeout");
                self.result = OperationResult::RxTimeout;
                self.state = State::CtrlComplete;
                true
            }
            State::CtrlComplete => {
                self.frame_complete();
                self.state = State::CtrlBackoff;
                true
            }
            State::CtrlBackoff => {
                let mut ok = self
                    .clock
                    .has_elapsed(self.tx_frame_start, CONTROLLER_MIN_BREAK_TO_BREAK);
                let op = self.active.map(|index| self.buffers[index].op);
                match op {
                    Some(InternalOp::TxOnly) => {
                        ok &= self
                            .clock
                            .has_elapsed(self.tx_frame_end, CONTROLLER_NON_RDM_BACKOFF);
                    }
                    Some(InternalOp::RdmDub) => {
                        ok &= self
                            .clock
                            .has_elapsed(self.tx_frame_end, CONTROLLER_DUB_BACKOFF);
                    }
                    Some(InternalOp::RdmBroadcast) => {
                        ok &= self
                            .clock
                            .has_elapsed(self.tx_frame_end, CONTROLLER_BROADCAST_BACKOFF);
                    }
                    Some(InternalOp::RdmWithResponse) => {
                        ok &= self
                            .clock
                            .has_elapsed(self.tx_frame_end, CONTROLLER_MISSING_RESPONSE_BACKOFF);
                    }
                    _ => {}
                }
                if ok {
                    self.free_active_buffer();
                    self.state = State::CtrlTxReady;
                    return true;
                }
                false
            }

            State::RespInitialize => {
                self.hal.uart_rx_enable(false);
                self.hal.uart_tx_enable(false);
                self.hal.uart_enable();
                self.hal.uart_flush_rx();
                self.hal.enable_rx();

                // Free-running for break / mark measurement.
                self.hal.timer_irq_enable(false);
                self.hal.set_timer_counter(0);
                self.hal.set_timer_period(u32::MAX);
                self.hal.timer_start();

                self.state = State::RespRxPrepare;
                true
            }
            State::RespRxPrepare => {
                if self.active.is_none() {
                    match self.free.pop() {
                        Some(index) => self.active = Some(index),
                        None => {
                            error!("lost buffers");
                            self.state = State::Error;
                            return false;
                        }
                    }
                }

                self.request_timing = RequestTiming::default();
                self.data_index = 0;
                self.found_expected_length = false;
                self.expected_length = 0;
                if let Some(index) = self.active {
                    self.buffers[index].op = InternalOp::Rx;
                }

                self.state = State::RespRxMarkBeforeBreak;
                self.hal.capture_disable();
                self.hal.capture_enable(true);
                true
            }
            State::RespRxMarkBeforeBreak => {
                if self.desired_mode != TransceiverMode::Responder {
                    self.hal.capture_disable();
                    self.hal.timer_stop();
                    self.free_active_buffer();
                    self.switch_mode();
                    return true;
                }
                false
            }
            State::RespRxBreak | State::RespRxMark => false,
            State::RespRxData => {
                if self.data_index != 0 {
                    let is_rdm = self
                        .active
                        .map(|index| self.buffers[index].data[0] == SC_RDM)
                        .unwrap_or(false);
                    let timed_out = (is_rdm
                        && self
                            .clock
                            .has_elapsed(self.last_byte_coarse, RESPONDER_RDM_INTERSLOT_TIMEOUT))
                        || self
                            .clock
                            .has_elapsed(self.last_byte_coarse, RESPONDER_DMX_INTERSLOT_TIMEOUT);
                    if timed_out {
                        self.hal.uart_rx_irq_enable(false);
                        self.hal.uart_rx_enable(false);
                        self.emit_rx_frame(OperationResult::RxFrameTimeout);
                        self.state = State::RespRxPrepare;
                        return true;
                    }
                }
                false
            }
            State::RespFrameComplete => {
                if self.next.is_some() {
                    self.prepare_rdm_response();
                    return false;
                }
                // Nobody wants to reply; re-arm once the turnaround window
                // a reply would have used has passed.
                if self
                    .clock
                    .has_elapsed(self.last_byte_coarse, RESPONDER_REPLY_GRACE)
                {
                    self.state = State::RespRxPrepare;
                    return true;
                }
                false
            }
            State::RespTxWaiting | State::RespTxBreak | State::RespTxMark | State::RespTxData => {
                false
            }
            State::RespTxDrain => {
                self.free_active_buffer();
                false
            }
            State::RespTxComplete => {
                self.free_active_buffer();
                self.hal.timer_stop();
                self.hal.set_timer_counter(0);
                self.hal.set_timer_period(u32::MAX);
                self.hal.timer_start();
                self.data_index = 0;
                self.state = State::RespRxPrepare;
                true
            }

            State::TestInitialize => {
                self.hal.uart_tx_enable(false);
                self.hal.uart_flush_rx();
                self.hal.uart_tx_irq_enable(false);
                self.hal.uart_rx_irq_enable(false);
                self.hal.uart_tx_irq_on_space(true);
                self.hal.uart_enable();
                self.hal.enable_loopback();
                self.state = State::TestTxReady;
                true
            }
            State::TestTxReady => {
                if self.desired_mode != TransceiverMode::SelfTest {
                    self.switch_mode();
                    return true;
                }
                if self.next.is_none() {
                    return false;
                }
                self.take_next_buffer();
                self.tx_frame_start = self.clock.now();
                self.state = State::TestRxWait;

                self.hal.uart_rx_irq_enable(true);
                self.hal.uart_rx_enable(true);
                self.hal.uart_tx_enable(true);
                self.hal.uart_write(SELF_TEST_VALUE);
                true
            }
            State::TestRxWait => {
                if self.clock.has_elapsed(self.tx_frame_start, SELF_TEST_TIMEOUT) {
                    self.hal.uart_rx_irq_enable(false);
                    self.state = State::TestVerify;
                    return true;
                }
                false
            }
            State::TestVerify => {
                self.hal.uart_rx_irq_enable(false);
                self.hal.uart_rx_enable(false);
                self.hal.uart_tx_enable(false);

                self.result = OperationResult::SelfTestFailed;
                if let Some(index) = self.active {
                    if self.data_index > 0 && self.buffers[index].data[0] == SELF_TEST_VALUE {
                        self.result = OperationResult::Ok;
                    }
                }
                self.data_index = 0;
                self.frame_complete();
                self.free_active_buffer();
                self.state = State::TestTxReady;
                false
            }

            State::Reset => {
                self.switch_mode();
                true
            }
            State::Error => false,
        }
    }

    // Interrupt-context mutators.
    // ------------------------------------------------------------------

    /// Fine-timer period expiry: ends breaks, marks and the responder
    /// turnaround delay.
    pub fn on_timer_event(&mut self) {
        match self.state {
            State::CtrlInBreak | State::RespTxBreak => {
                self.hal.set_mark();
                self.state = if self.state == State::CtrlInBreak {
                    State::CtrlInMark
                } else {
                    State::RespTxMark
                };
                self.hal.set_timer_counter(0);
                self.hal.set_timer_period(self.settings.mark_ticks());
            }
            State::CtrlInMark => {
                self.hal.timer_irq_enable(false);
                self.hal.timer_stop();

                // Push a single byte to start with; the budget between the
                // end of the mark and the first start bit is tight.
                self.hal.uart_enable();
                self.feed_one_byte();
                self.hal.uart_tx_enable(true);
                self.state = State::CtrlTxData;
                self.hal.uart_tx_irq_enable(true);
            }
            State::RespTxWaiting => {
                self.hal.enable_tx();
                let with_break = self
                    .active
                    .map(|index| self.buffers[index].op == InternalOp::RdmResponse)
                    .unwrap_or(false);
                if with_break {
                    self.hal.set_break();
                    self.hal.timer_stop();
                    self.hal.set_timer_counter(0);
                    self.hal.set_timer_period(self.settings.break_ticks());
                    self.hal.timer_start();
                    self.state = State::RespTxBreak;
                } else {
                    self.hal.timer_irq_enable(false);
                    self.start_sending_response();
                }
            }
            State::RespTxMark => {
                self.hal.timer_irq_enable(false);
                self.hal.timer_stop();
                self.hal.set_timer_counter(0);
                self.hal.set_timer_period(u32::MAX);
                self.hal.timer_start();
                self.start_sending_response();
            }
            _ => {}
        }
    }

    /// Input-capture event; `ticks` is the fine-timer value at the edge.
    pub fn on_edge_capture(&mut self, ticks: u32) {
        match self.state {
            State::CtrlRxWaitForDub => {
                self.dub_timing.start = ticks;
                self.dub_timing.end = ticks;
                self.state = State::CtrlRxInDub;
            }
            State::CtrlRxInDub => {
                self.dub_timing.end = ticks;
            }
            State::CtrlRxWaitForBreak => {
                self.response_timing.break_start = ticks;
                self.state = State::CtrlRxInBreak;
            }
            State::CtrlRxInBreak => {
                if ticks.wrapping_sub(self.response_timing.break_start) < CONTROLLER_RX_BREAK_MIN {
                    // Too short to be a break; keep hunting.
                    self.response_timing.break_start = ticks;
                    self.state = State::CtrlRxWaitForBreak;
                } else {
                    self.response_timing.mark_start = ticks;
                    self.hal.uart_rx_irq_enable(true);
                    self.hal.uart_rx_enable(true);
                    self.state = State::CtrlRxInMark;
                }
            }
            State::CtrlRxInMark => {
                self.response_timing.mark_end = ticks;
                self.hal.capture_disable();
                self.state = State::CtrlRxData;
            }

            State::RespRxMarkBeforeBreak => {
                // Rebase the timer so 0 lines up with the falling edge; the
                // next capture then reads as the break duration. The frame
                // is timed after the fact because nothing is a break until
                // it has been low long enough.
                let now = self.hal.timer_counter();
                self.hal.set_timer_counter(now.wrapping_sub(ticks));
                self.state = State::RespRxBreak;
            }
            State::RespRxBreak => {
                if (RESPONDER_RX_BREAK_MIN..=RESPONDER_RX_BREAK_MAX).contains(&ticks) {
                    self.request_timing.break_ticks = ticks;
                    self.hal.uart_rx_irq_enable(true);
                    self.hal.uart_rx_enable(true);
                    self.state = State::RespRxMark;
                } else {
                    self.state = State::RespRxMarkBeforeBreak;
                }
                self.last_change = ticks;
            }
            State::RespRxMark => {
                let mark = ticks.wrapping_sub(self.request_timing.break_ticks);
                if !(RESPONDER_RX_MARK_MIN..=RESPONDER_RX_MARK_MAX).contains(&mark) {
                    // Mark out of range; treat the edge as a new falling
                    // edge and hunt for the break again.
                    let now = self.hal.timer_counter();
                    self.hal.set_timer_counter(now.wrapping_sub(ticks));
                    self.hal.uart_rx_enable(false);
                    self.hal.uart_rx_irq_enable(false);
                    self.state = State::RespRxBreak;
                } else {
                    self.request_timing.mark_ticks = mark;
                    self.state = State::RespRxData;
                }
                self.last_change = ticks;
            }
            State::RespRxData => {
                self.last_change = ticks;
            }
            _ => {}
        }
    }

    /// UART transmit interrupt: FIFO has space while feeding, transmitter
    /// idle while draining.
    pub fn on_uart_tx_ready(&mut self) {
        match self.state {
            State::CtrlTxData => {
                self.feed_fifo();
                if self.tx_buffer_done() {
                    self.hal.uart_tx_irq_on_space(false);
                    self.state = State::CtrlTxDrain;
                }
            }
            State::CtrlTxDrain => {
                // The last stop bit has left the shift register. Re-purpose
                // the timer for response measurement and turn the line
                // around if the operation expects anything back.
                self.hal.set_timer_counter(0);
                self.hal.set_timer_period(u32::MAX);
                self.hal.timer_start();

                self.tx_frame_end = self.clock.now();
                self.hal.uart_tx_irq_enable(false);
                self.hal.uart_tx_enable(false);

                let op = match self.active {
                    Some(index) => self.buffers[index].op,
                    None => return,
                };
                match op {
                    InternalOp::TxOnly => {
                        self.hal.uart_disable();
                        self.hal.set_mark();
                        self.hal.timer_stop();
                        self.state = State::CtrlComplete;
                    }
                    InternalOp::RdmDub => {
                        self.rdm_response_timeout = self.settings.rdm_response_timeout() as u32;
                        self.state = State::CtrlRxWaitForDub;
                        self.data_index = 0;

                        self.hal.enable_rx();
                        self.hal.uart_flush_rx();
                        self.hal.capture_enable(true);
                        self.hal.uart_rx_enable(true);
                        self.hal.uart_rx_irq_enable(true);
                    }
                    InternalOp::RdmBroadcast
                        if self.settings.rdm_broadcast_timeout() == 0 =>
                    {
                        self.hal.timer_stop();
                        self.data_index = 0;
                        self.state = State::CtrlComplete;
                    }
                    InternalOp::RdmBroadcast | InternalOp::RdmWithResponse => {
                        self.rdm_response_timeout = if op == InternalOp::RdmBroadcast {
                            self.settings.rdm_broadcast_timeout() as u32
                        } else {
                            self.settings.rdm_response_timeout() as u32
                        };
                        self.state = State::CtrlRxWaitForBreak;
                        self.data_index = 0;

                        self.hal.enable_rx();
                        self.hal.uart_flush_rx();
                        self.hal.capture_enable(true);
                    }
                    _ => {}
                }
            }
            State::RespTxData => {
                self.feed_fifo();
                if self.tx_buffer_done() {
                    self.hal.uart_tx_irq_on_space(false);
                    self.state = State::RespTxDrain;
                }
            }
            State::RespTxDrain => {
                self.hal.enable_rx();
                self.hal.uart_tx_irq_enable(false);
                self.hal.uart_tx_enable(false);
                self.state = State::RespTxComplete;
            }
            State::TestRxWait => {
                self.hal.uart_tx_enable(false);
            }
            _ => {}
        }
    }

    /// UART receive interrupt: bytes are waiting in the FIFO.
    pub fn on_uart_rx_ready(&mut self) {
        match self.state {
            State::CtrlRxInDub | State::CtrlRxData => {
                if self.drain_controller_rx() {
                    // A responder pushed more than the buffer holds; the
                    // largest legal RDM frame is 257 bytes, so cut it off.
                    self.hal.timer_stop();
                    self.hal.uart_rx_irq_enable(false);
                    self.hal.uart_rx_enable(false);
                    self.reset_to_mark();
                    self.state = State::CtrlComplete;
                }
            }
            State::RespRxData => {
                self.drain_responder_rx();
            }
            State::TestRxWait => {
                if let Some(byte) = self.hal.uart_read() {
                    if let Some(index) = self.active {
                        self.buffers[index].data[0] = byte;
                        self.data_index = 1;
                    }
                }
                self.state = State::TestVerify;
            }
            _ => {}
        }
    }

    /// UART framing / parity / overrun error.
    pub fn on_uart_error(&mut self, framing: bool) {
        match self.state {
            State::CtrlRxInDub | State::CtrlRxData => {
                if self.state == State::CtrlRxInDub {
                    self.hal.capture_disable();
                }
                self.hal.timer_stop();
                self.hal.uart_rx_irq_enable(false);
                self.hal.uart_rx_enable(false);
                self.reset_to_mark();
                self.state = State::CtrlComplete;
            }
            State::RespRxData => {
                // A framing error usually means the next break started.
                self.hal.uart_rx_irq_enable(false);
                self.hal.uart_flush_rx();
                self.hal.uart_rx_enable(false);
                let now = self.hal.timer_counter();
                self.hal.set_timer_counter(now.wrapping_sub(self.last_change));
                self.data_index = 0;
                self.state = if framing {
                    State::RespRxBreak
                } else {
                    State::RespRxMarkBeforeBreak
                };
            }
            _ => {}
        }
    }

    // Internals.
    // ------------------------------------------------------------------

    fn initialize_buffers(&mut self) {
        self.active = None;
        self.next = None;
        self.free.clear();
        for index in 0..NUMBER_OF_BUFFERS {
            let _ = self.free.push(index);
        }
    }

    fn take_next_buffer(&mut self) {
        if let Some(index) = self.active.take() {
            let _ = self.free.push(index);
        }
        self.active = self.next.take();
        self.data_index = 0;
    }

    fn free_active_buffer(&mut self) {
        if let Some(index) = self.active.take() {
            let _ = self.free.push(index);
        }
    }

    fn reset_to_mark(&mut self) {
        self.hal.set_mark();
        self.hal.enable_tx();
    }

    fn feed_one_byte(&mut self) {
        if let Some(index) = self.active {
            if !self.hal.uart_tx_full() && self.data_index != self.buffers[index].size {
                self.hal.uart_write(self.buffers[index].data[self.data_index]);
                self.data_index += 1;
            }
        }
    }

    fn feed_fifo(&mut self) {
        if let Some(index) = self.active {
            while !self.hal.uart_tx_full() && self.data_index != self.buffers[index].size {
                self.hal.uart_write(self.buffers[index].data[self.data_index]);
                self.data_index += 1;
            }
        }
    }

    fn tx_buffer_done(&self) -> bool {
        match self.active {
            Some(index) => self.data_index == self.buffers[index].size,
            None => true,
        }
    }

    /// Drain RX bytes in controller mode. Returns true when the buffer is
    /// full.
    fn drain_controller_rx(&mut self) -> bool {
        let Some(index) = self.active else {
            return false;
        };

        while self.data_index != BUFFER_SIZE {
            match self.hal.uart_read() {
                Some(byte) => {
                    self.buffers[index].data[self.data_index] = byte;
                    self.data_index += 1;
                }
                None => break,
            }
        }

        let op = self.buffers[index].op;
        if op == InternalOp::RdmWithResponse || op == InternalOp::RdmBroadcast {
            if !self.found_expected_length
                && self.data_index >= 3
                && self.buffers[index].data[0] == SC_RDM
                && self.buffers[index].data[1] == SC_SUB_MESSAGE
            {
                self.found_expected_length = true;
                // Two checksum slots follow the declared length.
                self.expected_length = self.buffers[index].data[2] as usize + 2;
            }
            if self.found_expected_length && self.data_index >= self.expected_length {
                self.hal.uart_rx_enable(false);
                self.hal.uart_rx_irq_enable(false);
                self.hal.timer_stop();
                self.reset_to_mark();
                self.state = State::CtrlComplete;
            }
        }

        self.last_byte_fine = self.hal.timer_counter();
        self.last_byte_coarse = self.clock.now();
        self.data_index >= BUFFER_SIZE
    }

    /// Drain RX bytes in responder mode, terminating RDM frames as soon as
    /// the declared length has arrived.
    fn drain_responder_rx(&mut self) {
        let Some(index) = self.active else {
            return;
        };

        while self.data_index != BUFFER_SIZE {
            match self.hal.uart_read() {
                Some(byte) => {
                    self.buffers[index].data[self.data_index] = byte;
                    self.data_index += 1;
                }
                None => break,
            }
        }
        self.last_byte_fine = self.hal.timer_counter();
        self.last_byte_coarse = self.clock.now();

        let is_rdm = self.buffers[index].data[0] == SC_RDM;
        if is_rdm && !self.found_expected_length && self.data_index >= 3 {
            if self.buffers[index].data[1] == SC_SUB_MESSAGE {
                self.found_expected_length = true;
                self.expected_length = self.buffers[index].data[2] as usize + 2;
            }
        }

        if is_rdm && self.found_expected_length && self.data_index >= self.expected_length {
            self.hal.uart_rx_irq_enable(false);
            self.hal.uart_rx_enable(false);
            self.emit_rx_frame(OperationResult::RxData);
            self.state = State::RespFrameComplete;
        } else if self.data_index >= BUFFER_SIZE {
            self.hal.uart_rx_irq_enable(false);
            self.hal.uart_rx_enable(false);
            self.emit_rx_frame(OperationResult::RxData);
            self.state = if is_rdm {
                State::RespFrameComplete
            } else {
                State::RespRxPrepare
            };
        }
    }

    /// Arm the turnaround delay for a queued reply. The timer is rebased to
    /// the last received byte so the delay is measured from the end of the
    /// request, not from whenever the foreground got around to us.
    fn prepare_rdm_response(&mut self) {
        let now = self.hal.timer_counter();
        self.hal
            .set_timer_counter(now.wrapping_sub(self.last_byte_fine));

        self.state = State::RespTxWaiting;
        self.hal.uart_rx_enable(false);
        self.hal.uart_tx_irq_on_space(true);

        self.take_next_buffer();

        self.jitter_rng.reseed(self.clock.now());
        let jitter = match self.settings.rdm_responder_jitter() {
            0 => 0,
            max => self.jitter_rng.next() % max,
        };

        self.hal.timer_stop();
        self.hal
            .set_timer_period(self.settings.rdm_responder_delay() as u32 + jitter as u32);
        self.hal.timer_irq_enable(true);
        self.hal.timer_start();
    }

    fn start_sending_response(&mut self) {
        self.hal.uart_tx_enable(true);
        self.feed_one_byte();
        self.state = State::RespTxData;
        self.hal.uart_tx_irq_enable(true);
    }

    fn switch_mode(&mut self) {
        self.mode = self.desired_mode;
        match self.mode {
            TransceiverMode::Controller => {
                info!("changed to controller mode");
                self.state = State::CtrlInitialize;
            }
            TransceiverMode::Responder => {
                info!("changed to responder mode");
                self.state = State::RespInitialize;
            }
            TransceiverMode::SelfTest => {
                info!("changed to self-test mode");
                self.state = State::TestInitialize;
            }
        }

        // Flush anything still pending from the old role.
        if let Some(index) = self.next.take() {
            self.emit_cancelled(index);
        }
        self.initialize_buffers();

        if self.mode_change_token != NO_NOTIFICATION {
            self.emit_event(
                self.mode_change_token,
                Operation::ModeChange,
                OperationResult::Ok,
                FrameTiming::None,
                &[],
            );
            self.mode_change_token = NO_NOTIFICATION;
        }
    }

    fn emit_cancelled(&mut self, index: usize) {
        let token = self.buffers[index].token;
        let op = self.buffers[index].op.operation();
        if token >= 0 {
            self.emit_event(token, op, OperationResult::Cancelled, FrameTiming::None, &[]);
        }
    }

    /// Build the completion event for the active controller / self-test
    /// operation.
    fn frame_complete(&mut self) {
        let Some(index) = self.active else {
            return;
        };
        let op = self.buffers[index].op;

        let mut data_length = 0;
        if op != InternalOp::TxOnly && self.data_index != 0 {
            data_length = self.data_index;
            self.result = OperationResult::RxData;
        }

        let timing = match op {
            InternalOp::RdmDub => {
                debug!(
                    "dub window {} to {}",
                    self.dub_timing.start, self.dub_timing.end
                );
                FrameTiming::DubResponse(self.dub_timing)
            }
            InternalOp::RdmWithResponse | InternalOp::RdmBroadcast => {
                debug!(
                    "response break {} mark {}",
                    self.response_timing
                        .mark_start
                        .wrapping_sub(self.response_timing.break_start),
                    self.response_timing
                        .mark_end
                        .wrapping_sub(self.response_timing.mark_start)
                );
                FrameTiming::Response(self.response_timing)
            }
            _ => FrameTiming::None,
        };

        let token = self.buffers[index].token;
        if token >= 0 {
            let data: heapless::Vec<u8, BUFFER_SIZE> =
                heapless::Vec::from_slice(&self.buffers[index].data[..data_length])
                    .unwrap_or_default();
            self.push_event(TransceiverEvent {
                token,
                op: op.operation(),
                result: self.result,
                timing,
                data,
            });
        }
    }

    /// Hand a received frame up (responder mode).
    fn emit_rx_frame(&mut self, result: OperationResult) {
        let Some(index) = self.active else {
            return;
        };
        let data: heapless::Vec<u8, BUFFER_SIZE> =
            heapless::Vec::from_slice(&self.buffers[index].data[..self.data_index])
                .unwrap_or_default();
        self.push_event(TransceiverEvent {
            token: 0,
            op: Operation::Rx,
            result,
            timing: FrameTiming::Request(self.request_timing),
            data,
        });
    }

    fn emit_event(
        &mut self,
        token: i16,
        op: Operation,
        result: OperationResult,
        timing: FrameTiming,
        data: &[u8],
    ) {
        let data: heapless::Vec<u8, BUFFER_SIZE> =
            heapless::Vec::from_slice(data).unwrap_or_default();
        self.push_event(TransceiverEvent {
            token,
            op,
            result,
            timing,
            data,
        });
    }

    fn push_event(&mut self, event: TransceiverEvent) {
        if self.events.is_full() {
            warn!("event queue overflow, dropping oldest");
            self.events.pop_front();
        }
        let _ = self.events.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::vec::Vec;

    struct MockLine {
        tx_enabled: bool,
        loopback: bool,
        line_is_break: bool,
        breaks_driven: usize,
        timer_running: bool,
        timer_counter: u32,
        timer_period: u32,
        timer_irq: bool,
        uart_enabled: bool,
        uart_tx_on: bool,
        uart_rx_on: bool,
        tx_irq: bool,
        rx_irq: bool,
        tx_irq_on_space: bool,
        capture: Option<bool>,
        sent: Vec<u8>,
        rx_fifo: VecDeque<u8>,
    }

    impl MockLine {
        fn new() -> Self {
            Self {
                tx_enabled: false,
                loopback: false,
                line_is_break: false,
                breaks_driven: 0,
                timer_running: false,
                timer_counter: 0,
                timer_period: 0,
                timer_irq: false,
                uart_enabled: false,
                uart_tx_on: false,
                uart_rx_on: false,
                tx_irq: false,
                rx_irq: false,
                tx_irq_on_space: true,
                capture: None,
                sent: Vec::new(),
                rx_fifo: VecDeque::new(),
            }
        }
    }

    impl TransceiverHal for MockLine {
        fn enable_tx(&mut self) {
            self.tx_enabled = true;
        }
        fn enable_rx(&mut self) {
            self.tx_enabled = false;
        }
        fn enable_loopback(&mut self) {
            self.loopback = true;
        }
        fn set_break(&mut self) {
            self.line_is_break = true;
            self.breaks_driven += 1;
        }
        fn set_mark(&mut self) {
            self.line_is_break = false;
        }
        fn timer_start(&mut self) {
            self.timer_running = true;
        }
        fn timer_stop(&mut self) {
            self.timer_running = false;
        }
        fn timer_counter(&mut self) -> u32 {
            self.timer_counter
        }
        fn set_timer_counter(&mut self, ticks: u32) {
            self.timer_counter = ticks;
        }
        fn set_timer_period(&mut self, ticks: u32) {
            self.timer_period = ticks;
        }
        fn timer_irq_enable(&mut self, enabled: bool) {
            self.timer_irq = enabled;
        }
        fn uart_enable(&mut self) {
            self.uart_enabled = true;
        }
        fn uart_disable(&mut self) {
            self.uart_enabled = false;
        }
        fn uart_tx_enable(&mut self, enabled: bool) {
            self.uart_tx_on = enabled;
        }
        fn uart_rx_enable(&mut self, enabled: bool) {
            self.uart_rx_on = enabled;
        }
        fn uart_tx_full(&mut self) -> bool {
            false
        }
        fn uart_write(&mut self, byte: u8) {
            self.sent.push(byte);
        }
        fn uart_read(&mut self) -> Option<u8> {
            self.rx_fifo.pop_front()
        }
        fn uart_flush_rx(&mut self) {
            self.rx_fifo.clear();
        }
        fn uart_tx_irq_on_space(&mut self, on_space: bool) {
            self.tx_irq_on_space = on_space;
        }
        fn uart_tx_irq_enable(&mut self, enabled: bool) {
            self.tx_irq = enabled;
        }
        fn uart_rx_irq_enable(&mut self, enabled: bool) {
            self.rx_irq = enabled;
        }
        fn capture_enable(&mut self, falling_first: bool) {
            self.capture = Some(falling_first);
        }
        fn capture_disable(&mut self) {
            self.capture = None;
        }
    }

    fn controller<'a>(clock: &'a CoarseTimer) -> Transceiver<'a, MockLine> {
        let mut transceiver = Transceiver::new(MockLine::new(), clock);
        assert!(transceiver.set_mode(TransceiverMode::Controller, 1));
        transceiver.tasks();
        let event = transceiver.poll_event().unwrap();
        assert_eq!(event.op, Operation::ModeChange);
        assert_eq!(event.result, OperationResult::Ok);
        assert_eq!(event.token, 1);
        transceiver
    }

    /// Run a queued frame through break, mark and slot transmission.
    fn run_tx(transceiver: &mut Transceiver<'_, MockLine>) {
        transceiver.tasks();
        assert!(transceiver.hal_mut().line_is_break);
        transceiver.on_timer_event(); // break -> mark
        assert!(!transceiver.hal_mut().line_is_break);
        transceiver.on_timer_event(); // mark -> slots
        transceiver.on_uart_tx_ready(); // fifo fed
        transceiver.on_uart_tx_ready(); // drained
    }

    #[test]
    fn controller_transmits_a_dmx_frame() {
        let clock = CoarseTimer::new();
        let mut transceiver = controller(&clock);

        assert!(transceiver.queue_dmx(7, &[10, 20, 30]));
        transceiver.tasks();
        assert!(transceiver.hal_mut().line_is_break);
        assert!(transceiver.hal_mut().timer_running);
        assert!(transceiver.hal_mut().timer_irq);
        assert_eq!(transceiver.hal_mut().timer_period, 1_760); // 176us default

        transceiver.on_timer_event();
        assert!(!transceiver.hal_mut().line_is_break);
        assert_eq!(transceiver.hal_mut().timer_period, 120); // 12us default

        transceiver.on_timer_event();
        assert!(transceiver.hal_mut().uart_enabled);
        assert!(transceiver.hal_mut().uart_tx_on);
        assert!(transceiver.hal_mut().tx_irq);
        assert!(transceiver.hal_mut().tx_irq_on_space);
        transceiver.on_uart_tx_ready();
        assert!(!transceiver.hal_mut().tx_irq_on_space); // waiting for drain
        transceiver.on_uart_tx_ready();
        assert_eq!(transceiver.hal_mut().sent, vec![NULL_START_CODE, 10, 20, 30]);

        transceiver.tasks();
        let event = transceiver.poll_event().unwrap();
        assert_eq!(event.token, 7);
        assert_eq!(event.op, Operation::TxOnly);
        assert_eq!(event.result, OperationResult::Ok);
        assert!(event.data.is_empty());

        // The buffer is held until the backoff has run out.
        assert_eq!(transceiver.free_buffer_count(), 1);
        clock.set_counter(14);
        transceiver.tasks();
        assert_eq!(transceiver.free_buffer_count(), 2);
    }

    #[test]
    fn dub_backoff_gates_the_next_frame() {
        let clock = CoarseTimer::new();
        let mut transceiver = controller(&clock);

        let request = [0u8; 37];
        assert!(transceiver.queue_rdm_dub(2, &request));
        run_tx(&mut transceiver);

        // No responder answers; the response window lapses.
        clock.set_counter(29);
        transceiver.tasks();
        let event = transceiver.poll_event().unwrap();
        assert_eq!(event.token, 2);
        assert_eq!(event.op, Operation::RdmDub);
        assert_eq!(event.result, OperationResult::RxTimeout);

        // Queue the next request during the backoff.
        transceiver.hal_mut().sent.clear();
        assert!(transceiver.queue_rdm_request(3, &request, false));

        clock.set_counter(57); // 5.7ms after the frame end
        transceiver.tasks();
        assert!(!transceiver.hal_mut().line_is_break);

        clock.set_counter(58); // exactly the backoff; strictly-greater applies
        transceiver.tasks();
        assert!(!transceiver.hal_mut().line_is_break);

        clock.set_counter(59); // 5.9ms: break generation starts
        transceiver.tasks();
        assert!(transceiver.hal_mut().line_is_break);
    }

    #[test]
    fn broadcast_completes_without_listening_by_default() {
        let clock = CoarseTimer::new();
        let mut transceiver = controller(&clock);

        assert!(transceiver.queue_rdm_request(4, &[0u8; 26], true));
        run_tx(&mut transceiver);
        transceiver.tasks();

        let event = transceiver.poll_event().unwrap();
        assert_eq!(event.token, 4);
        assert_eq!(event.op, Operation::RdmBroadcast);
        assert_eq!(event.result, OperationResult::Ok);
        assert!(event.data.is_empty());
    }

    #[test]
    fn unicast_request_captures_the_response() {
        let clock = CoarseTimer::new();
        let mut transceiver = controller(&clock);

        assert!(transceiver.queue_rdm_request(5, &[0u8; 26], false));
        run_tx(&mut transceiver);
        assert_eq!(transceiver.hal_mut().capture, Some(true));

        // Break, then mark, then two response bytes arrive.
        transceiver.hal_mut().timer_counter = 100;
        transceiver.on_edge_capture(100);
        transceiver.hal_mut().timer_counter = 1_100;
        transceiver.on_edge_capture(1_100); // 100us break
        assert!(transceiver.hal_mut().uart_rx_on);
        assert!(transceiver.hal_mut().rx_irq);
        transceiver.hal_mut().timer_counter = 1_300;
        transceiver.on_edge_capture(1_300); // 20us mark
        assert_eq!(transceiver.hal_mut().capture, None);

        transceiver.hal_mut().rx_fifo.extend([0xCC, 0x01]);
        transceiver.on_uart_rx_ready();

        // The responder stops mid-frame; the inter-slot timeout fires.
        clock.set_counter(30);
        transceiver.tasks();
        let event = transceiver.poll_event().unwrap();
        assert_eq!(event.token, 5);
        assert_eq!(event.result, OperationResult::RxData);
        assert_eq!(event.data.as_slice(), &[0xCC, 0x01]);
        match event.timing {
            FrameTiming::Response(timing) => {
                assert_eq!(timing.break_start, 100);
                assert_eq!(timing.mark_start, 1_100);
                assert_eq!(timing.mark_end, 1_300);
            }
            other => panic!("unexpected timing {:?}", other),
        }
    }

    #[test]
    fn too_short_response_break_restarts_the_hunt() {
        let clock = CoarseTimer::new();
        let mut transceiver = controller(&clock);

        assert!(transceiver.queue_rdm_request(5, &[0u8; 26], false));
        run_tx(&mut transceiver);

        transceiver.hal_mut().timer_counter = 100;
        transceiver.on_edge_capture(100);
        // A 50us low pulse is not a break.
        transceiver.hal_mut().timer_counter = 600;
        transceiver.on_edge_capture(600);
        assert!(!transceiver.hal_mut().uart_rx_on);
    }

    #[test]
    fn controller_rx_expected_length_ends_the_frame() {
        let clock = CoarseTimer::new();
        let mut transceiver = controller(&clock);

        assert!(transceiver.queue_rdm_request(6, &[0u8; 26], false));
        run_tx(&mut transceiver);

        transceiver.hal_mut().timer_counter = 100;
        transceiver.on_edge_capture(100);
        transceiver.hal_mut().timer_counter = 1_100;
        transceiver.on_edge_capture(1_100);
        transceiver.hal_mut().timer_counter = 1_300;
        transceiver.on_edge_capture(1_300);

        // A 26-byte response: header declares message length 24.
        let mut response = vec![0xCC, 0x01, 24];
        response.extend(std::iter::repeat(0u8).take(21));
        response.extend([0x01, 0x02]); // checksum slots, content unchecked here
        transceiver.hal_mut().rx_fifo.extend(response.iter().copied());
        transceiver.on_uart_rx_ready();

        transceiver.tasks();
        let event = transceiver.poll_event().unwrap();
        assert_eq!(event.result, OperationResult::RxData);
        assert_eq!(event.data.len(), 26);
    }

    #[test]
    fn responder_receives_a_frame_and_replies() {
        let clock = CoarseTimer::new();
        let mut transceiver = Transceiver::new(MockLine::new(), &clock);
        transceiver.tasks();
        assert_eq!(transceiver.hal_mut().capture, Some(true));

        // Falling edge: rebase so the break is timed from zero.
        transceiver.hal_mut().timer_counter = 5_000;
        transceiver.on_edge_capture(5_000);
        assert_eq!(transceiver.hal_mut().timer_counter, 0);

        // Rising edge after a 100us break.
        transceiver.hal_mut().timer_counter = 1_000;
        transceiver.on_edge_capture(1_000);
        assert!(transceiver.hal_mut().uart_rx_on);

        // First start bit after a 12us mark.
        transceiver.hal_mut().timer_counter = 1_120;
        transceiver.on_edge_capture(1_120);

        let mut request = vec![0xCC, 0x01, 24];
        request.extend(std::iter::repeat(0u8).take(21));
        request.extend([0x03, 0x04]);
        transceiver.hal_mut().rx_fifo.extend(request.iter().copied());
        transceiver.on_uart_rx_ready();

        let event = transceiver.poll_event().unwrap();
        assert_eq!(event.op, Operation::Rx);
        assert_eq!(event.result, OperationResult::RxData);
        assert_eq!(event.data.len(), 26);
        assert_eq!(
            event.timing,
            FrameTiming::Request(RequestTiming {
                break_ticks: 1_000,
                mark_ticks: 120,
            })
        );

        // The dispatch layer queues a reply with a break.
        let reply = [0xABu8; 28];
        assert!(transceiver.queue_rdm_response(true, &reply));
        transceiver.tasks();
        assert_eq!(transceiver.hal_mut().timer_period, 1_760); // turnaround delay
        assert_eq!(transceiver.hal_mut().timer_counter, 0); // rebased to last byte

        transceiver.on_timer_event(); // delay over: drive the break
        assert!(transceiver.hal_mut().tx_enabled);
        assert!(transceiver.hal_mut().line_is_break);
        transceiver.on_timer_event(); // break over: mark
        assert!(!transceiver.hal_mut().line_is_break);
        transceiver.on_timer_event(); // mark over: slots
        transceiver.on_uart_tx_ready();
        transceiver.on_uart_tx_ready();
        assert_eq!(transceiver.hal_mut().sent, reply.to_vec());
        assert!(!transceiver.hal_mut().tx_enabled); // line turned around

        transceiver.tasks();
        assert_eq!(transceiver.hal_mut().capture, Some(true)); // listening again
    }

    #[test]
    fn responder_rejects_out_of_range_breaks() {
        let clock = CoarseTimer::new();
        let mut transceiver = Transceiver::new(MockLine::new(), &clock);
        transceiver.tasks();

        // Falling edge, then a rising edge after only 50us: too short.
        transceiver.hal_mut().timer_counter = 500;
        transceiver.on_edge_capture(500);
        transceiver.hal_mut().timer_counter = 500;
        transceiver.on_edge_capture(500);
        assert!(!transceiver.hal_mut().uart_rx_on);

        // Falling edge, then a rising edge after more than a second: too
        // long to be a break.
        transceiver.hal_mut().timer_counter = 1_000;
        transceiver.on_edge_capture(1_000);
        transceiver.hal_mut().timer_counter = 10_000_001;
        transceiver.on_edge_capture(10_000_001);
        assert!(!transceiver.hal_mut().uart_rx_on);
    }

    #[test]
    fn dub_reply_goes_out_without_a_break() {
        let clock = CoarseTimer::new();
        let mut transceiver = Transceiver::new(MockLine::new(), &clock);
        transceiver.tasks();

        transceiver.hal_mut().timer_counter = 1_000;
        transceiver.on_edge_capture(1_000);
        transceiver.hal_mut().timer_counter = 1_000;
        transceiver.on_edge_capture(1_000);
        transceiver.hal_mut().timer_counter = 1_120;
        transceiver.on_edge_capture(1_120);

        let mut request = vec![0xCC, 0x01, 36];
        request.extend(std::iter::repeat(0u8).take(33));
        request.extend([0x05, 0x06]);
        transceiver.hal_mut().rx_fifo.extend(request.iter().copied());
        transceiver.on_uart_rx_ready();
        transceiver.poll_event().unwrap();

        let breaks_before = transceiver.hal_mut().breaks_driven;
        let dub_reply = [0xFEu8; 24];
        assert!(transceiver.queue_rdm_response(false, &dub_reply));
        transceiver.tasks();
        transceiver.on_timer_event(); // delay over: straight into data
        transceiver.on_uart_tx_ready();
        transceiver.on_uart_tx_ready();

        assert_eq!(transceiver.hal_mut().sent, dub_reply.to_vec());
        assert_eq!(transceiver.hal_mut().breaks_driven, breaks_before);
    }

    #[test]
    fn unanswered_frame_rearms_after_the_grace_period() {
        let clock = CoarseTimer::new();
        let mut transceiver = Transceiver::new(MockLine::new(), &clock);
        transceiver.tasks();

        transceiver.hal_mut().timer_counter = 1_000;
        transceiver.on_edge_capture(1_000);
        transceiver.hal_mut().timer_counter = 1_000;
        transceiver.on_edge_capture(1_000);
        transceiver.hal_mut().timer_counter = 1_120;
        transceiver.on_edge_capture(1_120);

        let mut request = vec![0xCC, 0x01, 24];
        request.extend(std::iter::repeat(0u8).take(21));
        request.extend([0x00, 0x00]);
        transceiver.hal_mut().rx_fifo.extend(request.iter().copied());
        transceiver.on_uart_rx_ready();
        transceiver.poll_event().unwrap();

        // Nobody replies; reception stays parked through the grace window.
        transceiver.tasks();
        assert!(!transceiver.hal_mut().uart_rx_on);

        clock.set_counter(21);
        transceiver.tasks();
        assert_eq!(transceiver.hal_mut().capture, Some(true));
        // Too late to reply now.
        assert!(!transceiver.queue_rdm_response(true, &[0u8; 26]));
    }

    #[test]
    fn dmx_frame_ends_on_the_interslot_timeout() {
        let clock = CoarseTimer::new();
        let mut transceiver = Transceiver::new(MockLine::new(), &clock);
        transceiver.tasks();

        transceiver.hal_mut().timer_counter = 1_000;
        transceiver.on_edge_capture(1_000);
        transceiver.hal_mut().timer_counter = 1_000;
        transceiver.on_edge_capture(1_000);
        transceiver.hal_mut().timer_counter = 1_120;
        transceiver.on_edge_capture(1_120);

        transceiver.hal_mut().rx_fifo.extend([0x00, 1, 2, 3]);
        transceiver.on_uart_rx_ready();
        assert!(transceiver.poll_event().is_none());

        // 2.1ms of silence is fine for DMX...
        clock.set_counter(22);
        transceiver.tasks();
        assert!(transceiver.poll_event().is_none());

        // ...a second is not.
        clock.set_counter(10_001);
        transceiver.tasks();
        let event = transceiver.poll_event().unwrap();
        assert_eq!(event.result, OperationResult::RxFrameTimeout);
        assert_eq!(event.data.as_slice(), &[0x00, 1, 2, 3]);
    }

    #[test]
    fn framing_error_mid_frame_restarts_reception() {
        let clock = CoarseTimer::new();
        let mut transceiver = Transceiver::new(MockLine::new(), &clock);
        transceiver.tasks();

        transceiver.hal_mut().timer_counter = 1_000;
        transceiver.on_edge_capture(1_000);
        transceiver.hal_mut().timer_counter = 1_000;
        transceiver.on_edge_capture(1_000);
        transceiver.hal_mut().timer_counter = 1_120;
        transceiver.on_edge_capture(1_120);

        transceiver.hal_mut().rx_fifo.extend([0xCC, 0x01]);
        transceiver.on_uart_rx_ready();

        transceiver.on_uart_error(true);
        // The partial frame was discarded, nothing reached the host.
        assert!(transceiver.poll_event().is_none());
        assert!(!transceiver.hal_mut().uart_rx_on);
    }

    #[test]
    fn reset_cancels_pending_operations() {
        let clock = CoarseTimer::new();
        let mut transceiver = controller(&clock);
        assert!(transceiver.set_break_time(300));

        assert!(transceiver.queue_dmx(9, &[1, 2, 3]));
        transceiver.reset();

        let event = transceiver.poll_event().unwrap();
        assert_eq!(event.token, 9);
        assert_eq!(event.result, OperationResult::Cancelled);
        assert_eq!(transceiver.free_buffer_count(), 2);

        // Timing settings are back at their defaults.
        assert_eq!(transceiver.break_time(), 176);

        // The engine comes back up in the mode it was in.
        transceiver.tasks();
        assert_eq!(transceiver.mode(), TransceiverMode::Controller);
        assert!(transceiver.queue_dmx(10, &[1]));
    }

    #[test]
    fn mode_change_rules() {
        let clock = CoarseTimer::new();
        let mut transceiver = Transceiver::new(MockLine::new(), &clock);

        // Same mode is a no-op.
        assert!(!transceiver.set_mode(TransceiverMode::Responder, 1));
        assert!(transceiver.set_mode(TransceiverMode::Controller, 2));
        // Only one change can be in flight.
        assert!(!transceiver.set_mode(TransceiverMode::SelfTest, 3));

        transceiver.tasks();
        assert_eq!(transceiver.mode(), TransceiverMode::Controller);
        let event = transceiver.poll_event().unwrap();
        assert_eq!(event.token, 2);
        assert_eq!(event.op, Operation::ModeChange);
    }

    #[test]
    fn queueing_respects_the_mode() {
        let clock = CoarseTimer::new();
        let mut transceiver = Transceiver::new(MockLine::new(), &clock);
        // Responder mode rejects controller work.
        assert!(!transceiver.queue_dmx(1, &[1, 2]));
        assert!(!transceiver.queue_self_test(2));
        // And replies can only follow a received frame.
        assert!(!transceiver.queue_rdm_response(true, &[0u8; 26]));
    }

    #[test]
    fn self_test_round_trip() {
        let clock = CoarseTimer::new();
        let mut transceiver = Transceiver::new(MockLine::new(), &clock);
        assert!(transceiver.set_mode(TransceiverMode::SelfTest, 8));
        transceiver.tasks();
        transceiver.poll_event().unwrap();
        assert!(transceiver.hal_mut().loopback);

        assert!(transceiver.queue_self_test(3));
        transceiver.tasks();
        assert_eq!(transceiver.hal_mut().sent, vec![SELF_TEST_VALUE]);

        transceiver.hal_mut().rx_fifo.push_back(SELF_TEST_VALUE);
        transceiver.on_uart_rx_ready();
        transceiver.tasks();
        let event = transceiver.poll_event().unwrap();
        assert_eq!(event.token, 3);
        assert_eq!(event.op, Operation::SelfTest);
        assert_eq!(event.result, OperationResult::Ok);

        // No echo this time: the test fails after the timeout.
        assert!(transceiver.queue_self_test(4));
        transceiver.tasks();
        clock.set_counter(clock.now() + 101);
        transceiver.tasks();
        let event = transceiver.poll_event().unwrap();
        assert_eq!(event.token, 4);
        assert_eq!(event.result, OperationResult::SelfTestFailed);
    }

    #[test]
    fn second_queue_while_one_is_pending_is_rejected() {
        let clock = CoarseTimer::new();
        let mut transceiver = controller(&clock);
        assert!(transceiver.queue_dmx(1, &[1]));
        assert!(!transceiver.queue_dmx(2, &[2]));
    }
}
