//! Hardware capability traits.
//!
//! The core never touches pins, timers or the UART directly; everything goes
//! through a capability object handed over at construction. Platform crates
//! implement these traits over their peripheral access layer; the tests
//! implement them over plain structs.

/// Line-level access for the transceiver engine: RS485 direction control,
/// the break/mark drive pin, the fine timer and the UART FIFOs.
///
/// The fine timer counts 0.1µs ticks, fires an interrupt when it reaches the
/// programmed period, and keeps running until stopped. Input capture
/// timestamps line edges against the same counter. How the platform wires
/// interrupts back into the engine's `on_*` methods is its own business; the
/// contract is only that each hardware event produces exactly one call.
pub trait TransceiverHal {
    /// Drive the bus: direction pins to transmit.
    fn enable_tx(&mut self);
    /// Listen to the bus: direction pins to receive.
    fn enable_rx(&mut self);
    /// Loop the transmitter back into our own receiver (self test).
    fn enable_loopback(&mut self);

    /// Pull the line low for a break.
    fn set_break(&mut self);
    /// Release the line high for a mark.
    fn set_mark(&mut self);

    fn timer_start(&mut self);
    fn timer_stop(&mut self);
    /// The free-running counter value, in 0.1µs ticks.
    fn timer_counter(&mut self) -> u32;
    fn set_timer_counter(&mut self, ticks: u32);
    /// Program the period after which the timer interrupt fires.
    fn set_timer_period(&mut self, ticks: u32);
    fn timer_irq_enable(&mut self, enabled: bool);

    fn uart_enable(&mut self);
    fn uart_disable(&mut self);
    fn uart_tx_enable(&mut self, enabled: bool);
    fn uart_rx_enable(&mut self, enabled: bool);
    /// True when no more bytes fit the transmit FIFO.
    fn uart_tx_full(&mut self) -> bool;
    fn uart_write(&mut self, byte: u8);
    /// Pop one received byte, if any.
    fn uart_read(&mut self) -> Option<u8>;
    fn uart_flush_rx(&mut self);
    /// Select when the TX interrupt fires: `true` for FIFO-has-space (used
    /// while feeding slots), `false` for transmitter-idle (used to detect
    /// the last stop bit leaving the shift register).
    fn uart_tx_irq_on_space(&mut self, on_space: bool);
    fn uart_tx_irq_enable(&mut self, enabled: bool);
    fn uart_rx_irq_enable(&mut self, enabled: bool);

    /// Arm input capture; the first captured edge is falling when
    /// `falling_first`, rising otherwise, then every edge thereafter.
    fn capture_enable(&mut self, falling_first: bool);
    fn capture_disable(&mut self);
}

/// The responder's two indicator lamps.
pub trait StatusLamps {
    fn set_identify_lamp(&mut self, on: bool);
    fn toggle_identify_lamp(&mut self);
    fn set_mute_lamp(&mut self, on: bool);
    fn toggle_mute_lamp(&mut self);
}
