//! SENDME flow control
//!
//! Two kinds of window, each kept at hop level and at stream level:
//!
//! - **Package window:** DATA cells we may still send. Each DATA cell we send
//!   takes one; each SENDME from the far end gives back one increment.
//! - **Deliver window:** DATA cells we will still accept. Each DATA cell
//!   received takes one; whenever a full increment has been consumed we owe
//!   the far end a SENDME and the window grows by that increment again.
//!
//! | level   | start | increment |
//! |---------|-------|-----------|
//! | circuit | 1000  | 100       |
//! | stream  | 500   | 50        |

use crate::error::{Result, TorError};

/// Hop-level window start
pub const CIRCUIT_WINDOW_START: u16 = 1000;

/// Hop-level SENDME increment
pub const CIRCUIT_WINDOW_INCREMENT: u16 = 100;

/// Stream-level window start
pub const STREAM_WINDOW_START: u16 = 500;

/// Stream-level SENDME increment
pub const STREAM_WINDOW_INCREMENT: u16 = 50;

/// Package (send) window
#[derive(Debug, Clone)]
pub struct SendWindow {
    window: u16,
    start: u16,
    increment: u16,
}

impl SendWindow {
    pub fn new(start: u16, increment: u16) -> Self {
        Self {
            window: start,
            start,
            increment,
        }
    }

    /// Hop-level package window (1000 / +100)
    pub fn circuit() -> Self {
        Self::new(CIRCUIT_WINDOW_START, CIRCUIT_WINDOW_INCREMENT)
    }

    /// Stream-level package window (500 / +50)
    pub fn stream() -> Self {
        Self::new(STREAM_WINDOW_START, STREAM_WINDOW_INCREMENT)
    }

    pub fn window(&self) -> u16 {
        self.window
    }

    /// Check if we can send a cell
    pub fn can_send(&self) -> bool {
        self.window > 0
    }

    /// Take one cell's worth of window
    ///
    /// Returns `false` (and takes nothing) when the window is exhausted.
    pub fn take(&mut self) -> bool {
        if self.window == 0 {
            return false;
        }
        self.window -= 1;
        true
    }

    /// Apply a SENDME from the far end
    ///
    /// A SENDME that would lift the window above its start value means the
    /// peer is acknowledging cells we never sent.
    pub fn credit(&mut self) -> Result<()> {
        let next = self.window.saturating_add(self.increment);
        if next > self.start {
            return Err(TorError::protocol(format!(
                "unexpected SENDME: window {} + {} exceeds {}",
                self.window, self.increment, self.start
            )));
        }
        self.window = next;
        log::trace!("Send window: {} (+{})", self.window, self.increment);
        Ok(())
    }
}

/// Deliver (receive) window
#[derive(Debug, Clone)]
pub struct DeliverWindow {
    window: u16,
    start: u16,
    increment: u16,
}

impl DeliverWindow {
    pub fn new(start: u16, increment: u16) -> Self {
        Self {
            window: start,
            start,
            increment,
        }
    }

    pub fn circuit() -> Self {
        Self::new(CIRCUIT_WINDOW_START, CIRCUIT_WINDOW_INCREMENT)
    }

    pub fn stream() -> Self {
        Self::new(STREAM_WINDOW_START, STREAM_WINDOW_INCREMENT)
    }

    pub fn window(&self) -> u16 {
        self.window
    }

    /// Account for one DATA cell
    ///
    /// Returns `true` when a SENDME is now owed; the window has already been
    /// replenished by one increment in that case. A peer that sends past a
    /// zero window is violating the protocol.
    pub fn on_deliver(&mut self) -> Result<bool> {
        if self.window == 0 {
            return Err(TorError::protocol("peer sent DATA past the deliver window"));
        }
        self.window -= 1;
        if self.window <= self.start - self.increment {
            self.window += self.increment;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_window_exhaustion() {
        let mut window = SendWindow::stream();
        for _ in 0..STREAM_WINDOW_START {
            assert!(window.take());
        }
        assert!(!window.can_send());
        assert!(!window.take());
        assert_eq!(window.window(), 0);

        window.credit().unwrap();
        assert_eq!(window.window(), STREAM_WINDOW_INCREMENT);
    }

    #[test]
    fn test_send_window_rejects_excess_credit() {
        let mut window = SendWindow::circuit();
        assert!(window.credit().is_err());
        assert_eq!(window.window(), CIRCUIT_WINDOW_START);

        for _ in 0..99 {
            window.take();
        }
        // 901 + 100 > 1000
        assert!(window.credit().is_err());
        window.take();
        assert!(window.credit().is_ok());
        assert_eq!(window.window(), CIRCUIT_WINDOW_START);
    }

    #[test]
    fn test_deliver_window_sendme_cadence() {
        let mut window = DeliverWindow::circuit();
        let mut owed = 0;
        for i in 1..=250 {
            if window.on_deliver().unwrap() {
                owed += 1;
                assert_eq!(i % 100, 0);
            }
        }
        assert_eq!(owed, 2);
        assert_eq!(window.window(), 950);

        let mut stream = DeliverWindow::stream();
        let sendmes = (0..120).filter(|_| stream.on_deliver().unwrap()).count();
        assert_eq!(sendmes, 2);
    }

    #[test]
    fn test_deliver_window_overrun() {
        let mut window = DeliverWindow::new(2, 2);
        assert!(!window.on_deliver().unwrap());
        // reaching start - increment replenishes
        assert!(window.on_deliver().unwrap());
        assert_eq!(window.window(), 2);

        let mut stuck = DeliverWindow::new(1, 0);
        let _ = stuck.on_deliver();
        assert!(stuck.on_deliver().is_err());
    }
}
