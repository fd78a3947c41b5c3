/// The multiplexed transport from `spec.md` §4.5/§9: one listening socket
/// shared between consensus RPCs and application RPCs, demultiplexed by a
/// single leading byte per connection.
///
/// "Rather than a dynamic-typed 'stream layer' with type assertions, define
/// a concrete component with two bounded-queue accept channels (or
/// equivalents) and a dedicated demux thread that peeks one byte."
/// (`spec.md` §9). Here the "thread" is a `tokio` task and the "queues" are
/// bounded `tokio::sync::mpsc` channels, one per logical listener.
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, warn};

/// First byte written on every outbound consensus connection; anything
/// else is routed to the application listener (`spec.md` §6: "Wire
/// protocol... prefixed by a single `0x01` byte per connection").
const RAFT_RPC_BYTE: u8 = 1;

const ACCEPT_QUEUE_DEPTH: usize = 64;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub struct BoxedStream(Pin<Box<dyn AsyncStream>>);

impl BoxedStream {
  fn new(inner: impl AsyncStream + 'static) -> Self {
    Self(Box::pin(inner))
  }
}

impl AsyncRead for BoxedStream {
  fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
    self.0.as_mut().poll_read(cx, buf)
  }
}

impl AsyncWrite for BoxedStream {
  fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    self.0.as_mut().poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.0.as_mut().poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.0.as_mut().poll_shutdown(cx)
  }
}

impl tonic::transport::server::Connected for BoxedStream {
  type ConnectInfo = ();

  fn connect_info(&self) -> Self::ConnectInfo {}
}

#[derive(Clone, Default)]
pub struct TlsConfig {
  /// Wraps the post-demux stream server-side on accept, for both the raft
  /// and application listeners.
  pub server: Option<Arc<ServerConfig>>,
  /// Wraps dialed streams client-side.
  pub peer: Option<Arc<ClientConfig>>,
}

pub struct StreamLayer {
  local_addr: SocketAddr,
  tls: TlsConfig,
  raft_rx: Mutex<Option<mpsc::Receiver<io::Result<BoxedStream>>>>,
  app_rx: Mutex<Option<mpsc::Receiver<io::Result<BoxedStream>>>>,
}

impl StreamLayer {
  pub async fn bind(addr: SocketAddr, tls: TlsConfig) -> io::Result<Self> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let (raft_tx, raft_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
    let (app_tx, app_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);

    let demux_tls = tls.clone();
    tokio::spawn(Self::demux_loop(listener, raft_tx, app_tx, demux_tls));

    Ok(Self {
      local_addr,
      tls,
      raft_rx: Mutex::new(Some(raft_rx)),
      app_rx: Mutex::new(Some(app_rx)),
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Per connection: `accept -> peek_one_byte -> (byte == 1 ?
  /// raft_accept_queue : app_accept_queue) -> optional_tls_handshake ->
  /// user_stream` (`spec.md` §4.5's "State machine of the stream layer").
  async fn demux_loop(
    listener: TcpListener,
    raft_tx: mpsc::Sender<io::Result<BoxedStream>>,
    app_tx: mpsc::Sender<io::Result<BoxedStream>>,
    tls: TlsConfig,
  ) {
    loop {
      let (mut stream, peer) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(e) => {
          warn!(error = %e, "stream layer accept failed");
          continue;
        }
      };

      let raft_tx = raft_tx.clone();
      let app_tx = app_tx.clone();
      let tls = tls.clone();

      tokio::spawn(async move {
        let mut marker = [0u8; 1];
        if let Err(e) = stream.read_exact(&mut marker).await {
          debug!(%peer, error = %e, "stream layer demux read failed");
          return;
        }

        let is_raft = marker[0] == RAFT_RPC_BYTE;
        let wrapped = Self::server_handshake(stream, &tls).await;

        let (sender, channel) = if is_raft { (raft_tx, "raft") } else { (app_tx, "app") };
        debug!(%peer, channel, "stream layer routed connection");

        let _ = sender.send(wrapped).await;
      });
    }
  }

  async fn server_handshake(stream: TcpStream, tls: &TlsConfig) -> io::Result<BoxedStream> {
    match &tls.server {
      Some(config) => {
        let acceptor = TlsAcceptor::from(Arc::clone(config));
        let tls_stream = acceptor.accept(stream).await?;
        Ok(BoxedStream::new(tls_stream))
      }
      None => Ok(BoxedStream::new(stream)),
    }
  }

  /// Dials `addr`, writes the `0x01` demux byte, and optionally performs a
  /// client-side TLS handshake. Used by the consensus network layer to
  /// open outbound RPC connections that land in the peer's raft accept
  /// queue.
  #[instrument(skip(self))]
  pub async fn dial(&self, addr: SocketAddr, domain: &str) -> io::Result<BoxedStream> {
    use tokio::io::AsyncWriteExt;

    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&[RAFT_RPC_BYTE]).await?;

    match &self.tls.peer {
      Some(config) => {
        let connector = TlsConnector::from(Arc::clone(config));
        let server_name = tokio_rustls::rustls::ServerName::try_from(domain)
          .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tls_stream = connector.connect(server_name, stream).await?;
        Ok(BoxedStream::new(tls_stream))
      }
      None => Ok(BoxedStream::new(stream)),
    }
  }

  /// Takes the raft accept queue as a stream, for `tonic::transport::Server
  /// ::serve_with_incoming`. May only be called once.
  pub async fn raft_incoming(&self) -> ReceiverStream<io::Result<BoxedStream>> {
    let receiver = self
      .raft_rx
      .lock()
      .await
      .take()
      .expect("raft_incoming called more than once");
    ReceiverStream::new(receiver)
  }

  /// Takes the application accept queue as a stream. May only be called
  /// once.
  pub async fn app_incoming(&self) -> ReceiverStream<io::Result<BoxedStream>> {
    let receiver = self
      .app_rx
      .lock()
      .await
      .take()
      .expect("app_incoming called more than once");
    ReceiverStream::new(receiver)
  }
}
