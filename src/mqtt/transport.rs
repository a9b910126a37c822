// Broker socket shared between the MQTT client and the session loop
//
// The client's receive path is not cancel-safe: dropping it mid-packet loses
// the packet boundary. The session loop therefore never races the client
// itself. It races `Lookahead::wait_readable`, which reads a single byte
// into a lookahead slot, and only then runs the client's receive to
// completion. The lookahead byte is handed back on the client's first read.
//
// Cancelling `wait_readable` consumes nothing as long as a single read on
// the wrapped socket is cancel-safe (embassy-net's `TcpSocket` is).

use core::cell::{Cell, RefCell};

use embedded_io_async::{ErrorType, Read, Write};

/// Socket failures seen while waiting for inbound data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// Peer closed the connection
    Closed,
    /// Socket read failed
    Io,
}

pub struct Lookahead<T> {
    inner: RefCell<T>,
    peeked: Cell<Option<u8>>,
}

impl<T: Read + Write> Lookahead<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            inner: RefCell::new(inner),
            peeked: Cell::new(None),
        }
    }

    /// Transport handle for the MQTT client
    pub fn io(&self) -> LookaheadIo<'_, T> {
        LookaheadIo { link: self }
    }

    /// Whether a byte is waiting for the client
    pub fn has_pending(&self) -> bool {
        self.peeked.get().is_some()
    }

    /// Wait until at least one inbound byte is available
    pub async fn wait_readable(&self) -> Result<(), TransportError> {
        if self.has_pending() {
            return Ok(());
        }

        let mut byte = [0u8; 1];
        let n = self
            .inner
            .borrow_mut()
            .read(&mut byte)
            .await
            .map_err(|_| TransportError::Io)?;
        if n == 0 {
            return Err(TransportError::Closed);
        }

        self.peeked.set(Some(byte[0]));
        Ok(())
    }
}

pub struct LookaheadIo<'a, T> {
    link: &'a Lookahead<T>,
}

impl<T: ErrorType> ErrorType for LookaheadIo<'_, T> {
    type Error = T::Error;
}

impl<T: Read + Write> Read for LookaheadIo<'_, T> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(byte) = self.link.peeked.take() {
            buf[0] = byte;
            return Ok(1);
        }
        self.link.inner.borrow_mut().read(buf).await
    }
}

impl<T: Read + Write> Write for LookaheadIo<'_, T> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.link.inner.borrow_mut().write(buf).await
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.link.inner.borrow_mut().flush().await
    }
}
