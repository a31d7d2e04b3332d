use std::cell::Cell;
use std::io;
use std::marker::PhantomData;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};
use tracing::Level;

use crate::framing::frame::Frame;
use crate::framing::frame_decoder::{DecodeResult, FrameDecoder};
use crate::proxy::proxy_config::ProxyConfig;

/// a config bound to localhost, with timeouts short enough for tests to shut down quickly
pub fn test_config(min_local_port: u16) -> ProxyConfig {
    let mut config = ProxyConfig::new();
    config.bind_addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.min_local_port = min_local_port;
    config.serial_read_timeout = Duration::from_millis(20);
    config.multiplexer_timeout = Duration::from_millis(50);
    config.idle_sleep = Duration::from_millis(5);
    config.shutdown_grace_period = Duration::from_millis(100);
    config
}

/// reads from the device side of a serial link until a complete frame arrived, panicking on
///  checksum errors or if nothing arrives within a few seconds
pub async fn read_frame(device: &mut (impl AsyncRead + Unpin)) -> Frame {
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::new();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match decoder.decode(&mut buf) {
                DecodeResult::Frame(frame) => return frame,
                DecodeResult::Incomplete => {
                    let num_read = device.read_buf(&mut buf).await.unwrap();
                    assert!(num_read > 0, "serial link was closed");
                }
                other => panic!("unexpected decode result {:?}", other),
            }
        }
    }).await
        .expect("timeout waiting for a frame on the serial link")
}

/// A serial link that can be sent to another thread but not shared between threads, like
///  some native serial port handles
pub struct UnsyncStream {
    inner: DuplexStream,
    _not_sync: PhantomData<Cell<()>>,
}

impl UnsyncStream {
    pub fn new(inner: DuplexStream) -> UnsyncStream {
        UnsyncStream {
            inner,
            _not_sync: PhantomData,
        }
    }
}

impl AsyncRead for UnsyncStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for UnsyncStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Collects formatted log output, for tests that check what gets logged. Install
///  [LogCapture::subscriber] with `tracing::subscriber::set_default` in a single threaded test.
#[derive(Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + 'static {
        let capture = self.clone();
        tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_ansi(false)
            .with_writer(move || capture.clone())
            .finish()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
