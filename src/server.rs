//! TCP server for the line echo protocol.
//!
//! Binds the listener, accepts connections in a loop and spawns one
//! handler task per connection.

use crate::backoff::AcceptBackoff;
use crate::config::Config;
use crate::protocols::echo;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to bind to address.
    Bind(SocketAddr, io::Error),
    /// Failed to accept connection.
    Accept(io::Error),
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
            ListenerError::Accept(e) => write!(f, "Failed to accept: {}", e),
        }
    }
}

impl std::error::Error for ListenerError {}

/// Source of accepted connections for the accept loop.
pub(crate) trait Accept {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;
}

/// The bound listening socket.
///
/// Created once at startup and handed by value to [`Server::run`].
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Bind with SO_REUSEADDR and the given backlog.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(addr: SocketAddr, backlog: i32) -> Result<Self, ListenerError> {
        let listener =
            create_listener(addr, backlog).map_err(|e| ListenerError::Bind(addr, e))?;
        let inner =
            TcpListener::from_std(listener).map_err(|e| ListenerError::Bind(addr, e))?;
        let local_addr = inner
            .local_addr()
            .map_err(|e| ListenerError::Bind(addr, e))?;

        info!(address = %local_addr, backlog, "Listening on {}", local_addr);

        Ok(Self { inner })
    }

    /// Get the bound address for testing
    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr().unwrap()
    }
}

impl Accept for Listener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }
}

/// Server instance
pub struct Server {
    max_line_length: usize,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: &Config) -> Self {
        Server {
            max_line_length: config.max_line_length,
            backoff_base_ms: config.accept_backoff_base_ms,
            backoff_max_ms: config.accept_backoff_max_ms,
        }
    }

    /// Accept connections forever.
    ///
    /// Accept errors are logged and retried after a backoff; they never
    /// end the loop.
    pub(crate) async fn run<A: Accept>(&self, mut listener: A) {
        let mut backoff = AcceptBackoff::new(self.backoff_base_ms, self.backoff_max_ms);

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    backoff.reset();

                    let max_line_length = self.max_line_length;
                    // The handler logs its own close reason
                    tokio::spawn(async move {
                        let _ = echo::handle_connection(stream, peer, max_line_length).await;
                    });
                }
                Err(e) => {
                    let fd_exhausted = is_fd_exhaustion(&e);
                    let delay = backoff.next_delay();
                    error!(
                        fd_exhausted,
                        failures = backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "{}",
                        ListenerError::Accept(e)
                    );

                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

/// Whether an accept error means the process or system ran out of descriptors.
fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            workers: None,
            backlog: 128,
            max_line_length: 1024,
            accept_backoff_base_ms: 1,
            accept_backoff_max_ms: 4,
            log_level: "info".to_string(),
        }
    }

    /// Spawn the accept loop on a loopback listener and return its address.
    fn spawn_server(config: Config) -> SocketAddr {
        let listener = Listener::bind(config.listen, config.backlog).unwrap();
        let addr = listener.local_addr();
        tokio::spawn(async move {
            Server::new(&config).run(listener).await;
        });
        addr
    }

    async fn send_line(reader: &mut BufReader<TcpStream>, line: &str) -> String {
        reader.get_mut().write_all(line.as_bytes()).await.unwrap();
        reader.get_mut().write_all(b"\n").await.unwrap();

        let mut response = String::new();
        reader.read_line(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_hello_echo() {
        let addr = spawn_server(test_config());
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut reader = BufReader::new(stream);

        assert_eq!(send_line(&mut reader, "hello").await, "Echo: hello\n");
    }

    #[tokio::test]
    async fn test_lines_echoed_in_order() {
        let addr = spawn_server(test_config());
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream.write_all(b"first\nsecond\nthird\n").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut received = String::new();
        stream.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "Echo: first\nEcho: second\nEcho: third\n");
    }

    #[tokio::test]
    async fn test_clients_are_independent() {
        let addr = spawn_server(test_config());

        let mut a = BufReader::new(TcpStream::connect(addr).await.unwrap());
        let mut b = BufReader::new(TcpStream::connect(addr).await.unwrap());

        assert_eq!(send_line(&mut a, "from a").await, "Echo: from a\n");
        assert_eq!(send_line(&mut b, "from b").await, "Echo: from b\n");

        // Closing one client leaves the other usable
        drop(a);
        assert_eq!(send_line(&mut b, "still here").await, "Echo: still here\n");
    }

    #[tokio::test]
    async fn test_over_long_line_closes_connection() {
        let mut config = test_config();
        config.max_line_length = 16;
        let addr = spawn_server(config);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[b'x'; 64]).await.unwrap();

        // Unread input turns the close into a reset; nothing is echoed either way
        let mut received = Vec::new();
        let _ = stream.read_to_end(&mut received).await;
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_close_reason_logged_once() {
        let (logs, _guard) = crate::test_support::capture_logs();
        let mut config = test_config();
        config.max_line_length = 16;
        let addr = spawn_server(config);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[b'x'; 16]).await.unwrap();

        let mut received = Vec::new();
        let _ = stream.read_to_end(&mut received).await;

        let contents = logs.contents().to_lowercase();
        assert_eq!(contents.matches("line too long").count(), 1, "logs: {}", contents);
        assert_eq!(contents.matches("disconnected: ").count(), 1, "logs: {}", contents);
    }

    #[tokio::test]
    async fn test_bind_logs_listening_address() {
        let (logs, _guard) = crate::test_support::capture_logs();
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();

        let expected = format!("Listening on {}", listener.local_addr());
        assert_eq!(
            logs.contents().matches("Listening on").count(),
            1,
            "logs: {}",
            logs.contents()
        );
        assert!(logs.contents().contains(&expected), "logs: {}", logs.contents());
    }

    #[tokio::test]
    async fn test_bind_in_use_fails() {
        let first = Listener::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();

        match Listener::bind(first.local_addr(), 16) {
            Err(ListenerError::Bind(addr, _)) => assert_eq!(addr, first.local_addr()),
            Ok(_) => panic!("second bind on the same port succeeded"),
            Err(other) => panic!("unexpected: {}", other),
        }
    }

    /// Acceptor that fails a few times before handing out in-memory streams.
    struct FlakyAcceptor {
        failures: usize,
        streams: VecDeque<DuplexStream>,
    }

    impl Accept for FlakyAcceptor {
        type Stream = DuplexStream;

        async fn accept(&mut self) -> io::Result<(DuplexStream, SocketAddr)> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::from_raw_os_error(libc::EMFILE));
            }
            match self.streams.pop_front() {
                Some(stream) => Ok((stream, "127.0.0.1:40000".parse().unwrap())),
                None => std::future::pending().await,
            }
        }
    }

    #[tokio::test]
    async fn test_accept_errors_do_not_stop_loop() {
        let (mut client, server_side) = tokio::io::duplex(64);
        let acceptor = FlakyAcceptor {
            failures: 5,
            streams: VecDeque::from([server_side]),
        };
        let server = Server::new(&test_config());

        let exchange = async {
            client.write_all(b"after errors\n").await.unwrap();
            let mut reader = BufReader::new(&mut client);
            let mut response = String::new();
            reader.read_line(&mut response).await.unwrap();
            response
        };

        let response = tokio::select! {
            _ = server.run(acceptor) => unreachable!("accept loop returned"),
            response = exchange => response,
            _ = tokio::time::sleep(Duration::from_secs(5)) => panic!("no echo received"),
        };
        assert_eq!(response, "Echo: after errors\n");
    }

    #[test]
    fn test_fd_exhaustion_detection() {
        assert!(is_fd_exhaustion(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(is_fd_exhaustion(&io::Error::from_raw_os_error(libc::ENFILE)));
        assert!(!is_fd_exhaustion(&io::Error::from_raw_os_error(
            libc::ECONNABORTED
        )));
        assert!(!is_fd_exhaustion(&io::Error::new(io::ErrorKind::Other, "x")));
    }

    #[test]
    fn test_accept_error_message() {
        let err = ListenerError::Accept(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.to_string(), "Failed to accept: boom");
    }
}
