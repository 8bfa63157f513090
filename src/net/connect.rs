//! Upstream dialing.
//!
//! # Responsibilities
//! - Open a TCP connection to an origin within the connect deadline
//! - Wrap it in TLS for `https` origins, offering the requested ALPN
//! - Expose the negotiated ALPN protocol for support probing

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::net::tls::{Alpn, UpstreamTls};
use crate::pool::Origin;

/// A plain or TLS upstream byte stream.
pub enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl UpstreamIo {
    /// ALPN protocol chosen by the server, if any.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            UpstreamIo::Plain(_) => None,
            UpstreamIo::Tls(stream) => stream.get_ref().1.alpn_protocol(),
        }
    }
}

/// Connect to `origin`, negotiating TLS when its scheme requires it.
pub async fn dial(
    origin: &Origin,
    tls: &UpstreamTls,
    secure: bool,
    alpn: Alpn,
    deadline: Duration,
) -> io::Result<UpstreamIo> {
    let connect = async {
        let tcp = TcpStream::connect((origin.host(), origin.port())).await?;
        tcp.set_nodelay(true)?;

        if !origin.is_tls() {
            return Ok(UpstreamIo::Plain(tcp));
        }

        let server_name = ServerName::try_from(origin.host().to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let stream = tls.connector(secure, alpn).connect(server_name, tcp).await?;
        Ok(UpstreamIo::Tls(Box::new(stream)))
    };

    match tokio::time::timeout(deadline, connect).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {} timed out after {:?}", origin, deadline),
        )),
    }
}

impl AsyncRead for UpstreamIo {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamIo::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamIo::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamIo::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamIo::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dials_plain_origin() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let origin = Origin::parse(&format!("http://{}", addr)).unwrap();
        let tls = UpstreamTls::new().unwrap();

        let io = dial(&origin, &tls, true, Alpn::H2, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(io, UpstreamIo::Plain(_)));
        assert!(io.alpn_protocol().is_none());
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let origin = Origin::parse(&format!("http://{}", addr)).unwrap();
        let tls = UpstreamTls::new().unwrap();

        assert!(dial(&origin, &tls, true, Alpn::Http1, Duration::from_secs(1))
            .await
            .is_err());
    }
}
