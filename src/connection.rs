use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Byte-stream abstraction consumed by the engine (§6): "one writer, one
/// reader", no multiplexing, no framing of its own — framing is the
/// [`crate::wire::FrameCodec`]'s job once wrapped in a
/// `tokio_util::codec::Framed`.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {
    fn description(&self) -> &str;
}

/// Real transport: a TCP stream to the VM.
pub struct TcpConnection {
    stream: TcpStream,
    description: String,
}

impl TcpConnection {
    pub async fn connect(addr: impl tokio::net::ToSocketAddrs + std::fmt::Display) -> std::io::Result<TcpConnection> {
        let description = format!("tcp:{addr}");
        let stream = TcpStream::connect(addr).await?;
        Ok(TcpConnection { stream, description })
    }
}

impl Connection for TcpConnection {
    fn description(&self) -> &str {
        &self.description
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// In-memory transport used exclusively by the test harness (§4.11) to
/// script a fake VM without an actual socket.
pub struct DuplexConnection {
    stream: tokio::io::DuplexStream,
    description: String,
}

impl DuplexConnection {
    pub fn new(stream: tokio::io::DuplexStream, description: impl Into<String>) -> DuplexConnection {
        DuplexConnection {
            stream,
            description: description.into(),
        }
    }
}

impl Connection for DuplexConnection {
    fn description(&self) -> &str {
        &self.description
    }
}

impl AsyncRead for DuplexConnection {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for DuplexConnection {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
