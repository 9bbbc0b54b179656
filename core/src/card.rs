//! TCP transport to the TLV interface of a card simulator.
//!
//! ## Usage
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use cardsim::SimulatorCard;
//!
//! let card = SimulatorCard::new("127.0.0.1", 12350);
//! let mut channel = card.open_basic_channel().unwrap();
//! let response = channel
//!     .transmit_apdu(&[0x00, 0xA4, 0x04, 0x00], Duration::ZERO, Duration::from_secs(5))
//!     .unwrap();
//!
//! assert_eq!((0x90, 0x00), response.status());
//! ```

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use tracing::{debug, warn};

use crate::simulation::SimulationRunner;
use crate::{tlv, Error, Result};

/// Default limit of command and response APDUs.
pub const DEFAULT_MAX_LENGTH: usize = 4096;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A connection shared by a channel and the card that opened it.
struct Link {
    stream: TcpStream,
    closed: AtomicBool,
}

impl Link {
    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A card simulated behind a TCP port.
pub struct SimulatorCard {
    host: String,
    port: u16,
    connect_timeout: Duration,
    max_message_length: usize,
    max_response_length: usize,
    runner: Option<SimulationRunner>,
    basic: Mutex<Option<Arc<Link>>>,
}

impl SimulatorCard {
    /// Creates a card reachable at the address, without opening a connection yet.
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_message_length: DEFAULT_MAX_LENGTH,
            max_response_length: DEFAULT_MAX_LENGTH,
            runner: None,
            basic: Mutex::new(None),
        }
    }

    /// Binds the card to a simulation; channels refuse to transmit unless it is running.
    pub fn bound_to(mut self, runner: SimulationRunner) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn max_message_length(mut self, length: usize) -> Self {
        self.max_message_length = length;
        self
    }

    pub fn max_response_length(mut self, length: usize) -> Self {
        self.max_response_length = length;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Opens a connection to the simulator. A previously opened basic channel is closed.
    pub fn open_basic_channel(&self) -> Result<SimulatorCardChannel> {
        let stream = self.connect()?;
        stream.set_nodelay(true)?;

        let link = Arc::new(Link {
            stream,
            closed: AtomicBool::new(false),
        });
        if let Some(previous) = lock(&self.basic).replace(Arc::clone(&link)) {
            previous.close()?;
        }

        Ok(SimulatorCardChannel {
            link,
            runner: self.runner.clone(),
            max_message_length: self.max_message_length,
            max_response_length: self.max_response_length,
        })
    }

    pub fn open_logical_channel(&self) -> Result<SimulatorCardChannel> {
        Err(Error::Unsupported("logical channels"))
    }

    /// Closes the basic channel.
    pub fn disconnect(&self) -> Result<()> {
        match lock(&self.basic).take() {
            Some(link) => link.close(),
            None => Ok(()),
        }
    }

    fn connect(&self) -> Result<TcpStream> {
        debug!("Connecting to {}:{}", self.host, self.port);

        let mut last = None;
        for address in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&address, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last = Some(e),
            }
        }

        Err(last
            .unwrap_or_else(|| io::Error::new(ErrorKind::NotFound, "no address resolved"))
            .into())
    }
}

impl Drop for SimulatorCard {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!("Error while closing the basic channel: {}", e);
        }
    }
}

/// A response APDU: payload followed by the status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseApdu {
    bytes: Vec<u8>,
}

impl ResponseApdu {
    pub fn payload(&self) -> &[u8] {
        &self.bytes[..self.bytes.len() - 2]
    }

    /// SW1 and SW2.
    pub fn status(&self) -> (u8, u8) {
        let n = self.bytes.len();
        (self.bytes[n - 2], self.bytes[n - 1])
    }

    pub fn is_success(&self) -> bool {
        self.status() == (0x90, 0x00)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl TryFrom<Vec<u8>> for ResponseApdu {
    type Error = Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::InvalidResponse);
        }

        Ok(Self { bytes })
    }
}

impl From<ResponseApdu> for Vec<u8> {
    fn from(response: ResponseApdu) -> Self {
        response.bytes
    }
}

/// The basic channel to a [`SimulatorCard`], exchanging one APDU at a time.
pub struct SimulatorCardChannel {
    link: Arc<Link>,
    runner: Option<SimulationRunner>,
    max_message_length: usize,
    max_response_length: usize,
}

impl SimulatorCardChannel {
    pub fn channel_number(&self) -> u8 {
        0
    }

    pub fn extended_length_supported(&self) -> bool {
        true
    }

    pub fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    pub fn max_response_length(&self) -> usize {
        self.max_response_length
    }

    /// Sends a command APDU and returns the response bytes.
    ///
    /// Reading stops once a complete TLV frame arrived. A zero timeout waits forever.
    /// When the exchange fails before a complete frame was read, the channel is closed
    /// and later calls fail with [`Error::ChannelClosed`].
    pub fn transmit(
        &mut self,
        command: &[u8],
        write_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Vec<u8>> {
        if self.link.is_closed() {
            return Err(Error::ChannelClosed);
        }
        if let Some(runner) = &self.runner {
            if !runner.mode().is_running() {
                return Err(Error::NotRunning);
            }
        }
        if command.len() > self.max_message_length {
            return Err(Error::CommandTooLarge {
                max: self.max_message_length,
                length: command.len(),
            });
        }

        let frame = tlv::encode(command);
        debug!("TX: {}", hex::encode(&frame));

        let response = match self
            .send(&frame, write_timeout)
            .and_then(|_| self.receive(read_timeout))
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Closing the channel after a failed exchange: {}", e);
                let _ = self.link.close();
                return Err(e);
            }
        };
        debug!("RX: {}", hex::encode(&response));

        let data = tlv::decode(&response)?;
        if data.len() > self.max_response_length {
            return Err(Error::ResponseTooLarge {
                max: self.max_response_length,
                length: data.len(),
            });
        }

        Ok(data)
    }

    /// Like [`transmit`](Self::transmit), splitting the status word from the payload.
    pub fn transmit_apdu(
        &mut self,
        command: &[u8],
        write_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<ResponseApdu> {
        self.transmit(command, write_timeout, read_timeout)?
            .try_into()
    }

    fn send(&self, frame: &[u8], timeout: Duration) -> Result<()> {
        let mut stream = &self.link.stream;
        stream.set_write_timeout(non_zero(timeout))?;

        stream.write_all(frame).map_err(timed_out)?;
        stream.flush()?;

        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Vec<u8>> {
        let mut stream = &self.link.stream;
        let deadline = non_zero(timeout).map(|timeout| Instant::now() + timeout);
        let mut response = Vec::new();
        let mut buffer = [0u8; 1024];

        loop {
            match tlv::header(&response) {
                Ok((header, length)) => {
                    if length > self.max_response_length {
                        return Err(Error::ResponseTooLarge {
                            max: self.max_response_length,
                            length,
                        });
                    }
                    if response.len() >= header + length {
                        response.truncate(header + length);
                        return Ok(response);
                    }
                }
                Err(tlv::Error::Incomplete { .. }) => {}
                Err(e) => return Err(e.into()),
            }

            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) if !remaining.is_zero() => Some(remaining),
                    _ => return Err(Error::Timeout),
                },
                None => None,
            };
            stream.set_read_timeout(remaining)?;

            match stream.read(&mut buffer) {
                Ok(0) => {
                    warn!("The simulator closed the connection");
                    return Err(Error::NoResponse);
                }
                Ok(n) => response.extend_from_slice(&buffer[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Closes the connection. Closing twice has no effect.
    pub fn close(&mut self) -> Result<()> {
        self.link.close()
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }
}

impl Drop for SimulatorCardChannel {
    fn drop(&mut self) {
        let _ = self.link.close();
    }
}

fn non_zero(timeout: Duration) -> Option<Duration> {
    (!timeout.is_zero()).then_some(timeout)
}

fn timed_out(e: io::Error) -> Error {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => Error::Timeout,
        _ => e.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    /// Accepts one connection and answers every frame with the given handler.
    fn simulator<F>(handler: F) -> (u16, thread::JoinHandle<()>)
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            handler(stream);
        });

        (port, handle)
    }

    fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut frame = vec![0u8; 2];
        stream.read_exact(&mut frame).unwrap();
        let size = tlv::frame_size(&frame).unwrap();
        frame.resize(size, 0);
        stream.read_exact(&mut frame[2..]).unwrap();

        tlv::decode(&frame).unwrap()
    }

    #[test]
    fn test_transmit() {
        let (port, handle) = simulator(|mut stream| {
            let command = read_frame(&mut stream);
            assert_eq!(vec![0x00, 0xA4, 0x04, 0x00], command);
            stream.write_all(&tlv::encode(&[0x90, 0x00])).unwrap();
        });
        let card = SimulatorCard::new("127.0.0.1", port);
        let mut channel = card.open_basic_channel().unwrap();

        let response = channel
            .transmit_apdu(&[0x00, 0xA4, 0x04, 0x00], Duration::ZERO, Duration::from_secs(5))
            .unwrap();

        assert_eq!((0x90, 0x00), response.status());
        assert!(response.payload().is_empty());
        assert!(response.is_success());
        handle.join().unwrap();
    }

    #[test]
    fn test_transmit_tolerates_partial_reads() {
        let (port, handle) = simulator(|mut stream| {
            read_frame(&mut stream);
            let mut payload = vec![0x42; 300];
            payload.extend_from_slice(&[0x90, 0x00]);
            let response = tlv::encode(&payload);

            for chunk in response.chunks(100) {
                stream.write_all(chunk).unwrap();
                stream.flush().unwrap();
                thread::sleep(Duration::from_millis(20));
            }
        });
        let card = SimulatorCard::new("127.0.0.1", port);
        let mut channel = card.open_basic_channel().unwrap();

        let response = channel
            .transmit_apdu(&[0x00, 0xB0, 0x00, 0x00, 0x00], Duration::ZERO, Duration::ZERO)
            .unwrap();

        assert_eq!(vec![0x42; 300], response.payload());
        handle.join().unwrap();
    }

    #[test]
    fn test_transmit_times_out() {
        let (port, handle) = simulator(|mut stream| {
            read_frame(&mut stream);
            thread::sleep(Duration::from_millis(500));
        });
        let card = SimulatorCard::new("127.0.0.1", port);
        let mut channel = card.open_basic_channel().unwrap();

        let result = channel.transmit(&[0x00, 0xA4, 0x04, 0x00], Duration::ZERO, Duration::from_millis(100));

        assert!(matches!(result, Err(Error::Timeout)));
        handle.join().unwrap();
    }

    #[test]
    fn test_peer_close_is_no_response() {
        let (port, handle) = simulator(|mut stream| {
            read_frame(&mut stream);
        });
        let card = SimulatorCard::new("127.0.0.1", port);
        let mut channel = card.open_basic_channel().unwrap();

        let result = channel.transmit(&[0x00, 0xA4, 0x04, 0x00], Duration::ZERO, Duration::from_secs(5));

        assert!(matches!(result, Err(Error::NoResponse)));
        handle.join().unwrap();
    }

    #[test]
    fn test_malformed_response() {
        let (port, handle) = simulator(|mut stream| {
            read_frame(&mut stream);
            stream.write_all(&[0xA0, 0x02, 0x90, 0x00]).unwrap();
        });
        let card = SimulatorCard::new("127.0.0.1", port);
        let mut channel = card.open_basic_channel().unwrap();

        let result = channel.transmit(&[0x00], Duration::ZERO, Duration::from_secs(5));

        assert!(matches!(result, Err(Error::Codec(tlv::Error::NotPrimitive))));
        handle.join().unwrap();
    }

    #[test]
    fn test_length_limits() {
        let (port, handle) = simulator(|mut stream| {
            read_frame(&mut stream);
            stream.write_all(&tlv::encode(&[0x01, 0x02, 0x90, 0x00])).unwrap();
        });
        let card = SimulatorCard::new("127.0.0.1", port)
            .max_message_length(4)
            .max_response_length(2);
        let mut channel = card.open_basic_channel().unwrap();

        assert!(matches!(
            channel.transmit(&[0x00; 5], Duration::ZERO, Duration::ZERO),
            Err(Error::CommandTooLarge { max: 4, length: 5 })
        ));
        assert!(matches!(
            channel.transmit(&[0x00; 4], Duration::ZERO, Duration::from_secs(5)),
            Err(Error::ResponseTooLarge { max: 2, length: 4 })
        ));
        assert!(channel.is_closed());
        handle.join().unwrap();
    }

    #[test]
    fn test_late_response_is_not_paired_with_next_command() {
        let (port, handle) = simulator(|mut stream| {
            read_frame(&mut stream);
            thread::sleep(Duration::from_millis(300));
            let _ = stream.write_all(&tlv::encode(&[0x6A, 0x82]));
            let _ = stream.write_all(&tlv::encode(&[0x90, 0x00]));
        });
        let card = SimulatorCard::new("127.0.0.1", port);
        let mut channel = card.open_basic_channel().unwrap();

        assert!(matches!(
            channel.transmit(&[0x00, 0xA4, 0x04, 0x00], Duration::ZERO, Duration::from_millis(100)),
            Err(Error::Timeout)
        ));
        assert!(channel.is_closed());
        assert!(matches!(
            channel.transmit(&[0x00, 0xB0, 0x00, 0x00], Duration::ZERO, Duration::from_secs(5)),
            Err(Error::ChannelClosed)
        ));
        handle.join().unwrap();
    }

    #[test]
    fn test_close_is_idempotent() {
        let (port, handle) = simulator(|_| {});
        let card = SimulatorCard::new("127.0.0.1", port);
        let mut channel = card.open_basic_channel().unwrap();

        channel.close().unwrap();
        channel.close().unwrap();

        assert!(channel.is_closed());
        assert!(matches!(
            channel.transmit(&[0x00], Duration::ZERO, Duration::ZERO),
            Err(Error::ChannelClosed)
        ));
        handle.join().unwrap();
    }

    #[test]
    fn test_disconnect_closes_basic_channel() {
        let (port, handle) = simulator(|_| {});
        let card = SimulatorCard::new("127.0.0.1", port);
        let channel = card.open_basic_channel().unwrap();

        card.disconnect().unwrap();

        assert!(channel.is_closed());
        handle.join().unwrap();
    }

    #[test]
    fn test_logical_channel_is_unsupported() {
        let card = SimulatorCard::new("127.0.0.1", 1);

        assert!(matches!(
            card.open_logical_channel(),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_response_apdu() {
        let response = ResponseApdu::try_from(vec![0x01, 0x02, 0x6A, 0x82]).unwrap();

        assert_eq!(&[0x01, 0x02], response.payload());
        assert_eq!((0x6A, 0x82), response.status());
        assert!(!response.is_success());
        assert!(matches!(
            ResponseApdu::try_from(vec![0x90]),
            Err(Error::InvalidResponse)
        ));
    }
}
