use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, trace, warn};

use crate::framing::frame::Frame;
use crate::framing::frame_decoder::{DecodeResult, FrameDecoder};
use crate::proxy::diagnostics::DiagnosticBuffer;
use crate::proxy::proxy_config::ProxyConfig;
use crate::session::session_table::SessionTable;
use crate::stats::metrics::Metrics;
use crate::util::safe_converter::PrecheckedCast;

/// Serial link -> UDP: decodes frames from the serial link and sends their payload to the
///  application port, from the session socket for the frame's remote endpoint.
///
/// This is the only place where sessions are created.
pub struct InboundBridge<R> {
    config: Arc<ProxyConfig>,
    reader: R,
    decoder: FrameDecoder,
    sessions: Arc<SessionTable>,
    metrics: Arc<Metrics>,
    diagnostics: Arc<DiagnosticBuffer>,
    running: Arc<AtomicBool>,
}

impl<R: AsyncRead + Unpin + Send + 'static> InboundBridge<R> {
    pub fn new(
        config: Arc<ProxyConfig>,
        reader: R,
        sessions: Arc<SessionTable>,
        metrics: Arc<Metrics>,
        diagnostics: Arc<DiagnosticBuffer>,
        running: Arc<AtomicBool>,
    ) -> InboundBridge<R> {
        InboundBridge {
            config,
            reader,
            decoder: FrameDecoder::new(),
            sessions,
            metrics,
            diagnostics,
            running,
        }
    }

    /// Runs until the running flag is cleared, or until the serial link fails or is closed
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("starting inbound loop");

        let mut buf = BytesMut::with_capacity(self.config.serial_read_buffer_size);
        while self.running.load(Ordering::Acquire) {
            self.metrics.on_loop_iteration();

            buf.reserve(self.config.serial_read_buffer_size);
            match tokio::time::timeout(self.config.serial_read_timeout, self.reader.read_buf(&mut buf)).await {
                Err(_) => continue, // nothing arrived, check the running flag again
                Ok(Ok(0)) => {
                    return Err(anyhow!("serial link was closed"));
                }
                Ok(Ok(num_read)) => {
                    trace!("read {} bytes from serial link", num_read);
                }
                Ok(Err(e)) => {
                    return Err(e).context("error reading from serial link");
                }
            }

            self.process(&mut buf).await;
        }

        info!("inbound loop stopped");
        Ok(())
    }

    /// Decodes and forwards all complete frames in `buf`. Trailing bytes of an incomplete frame
    ///  are consumed as well - the decoder keeps track of them.
    async fn process(&mut self, buf: &mut BytesMut) {
        loop {
            let result = self.decoder.decode(buf);
            self.flush_noise();

            match result {
                DecodeResult::Incomplete => return,
                DecodeResult::ChecksumMismatch { expected, received } => {
                    debug!("checksum error: expected {:04X}, got {:04X} - dropping frame", expected, received);
                    self.metrics.on_checksum_failure();
                }
                DecodeResult::Frame(frame) => {
                    let payload_len = frame.payload_len();
                    self.forward(frame).await;
                    self.metrics.on_frame(payload_len.prechecked_cast());
                }
            }
        }
    }

    fn flush_noise(&mut self) {
        if self.decoder.has_noise() {
            self.diagnostics.append(&self.decoder.take_noise());
        }
    }

    async fn forward(&mut self, frame: Frame) {
        let session = match self.sessions.resolve_or_create(frame.address_id(), frame.port_b(), frame.port_a()).await {
            Ok(session) => session,
            Err(e) => {
                warn!("dropping {:?}: {}", frame, e);
                return;
            }
        };

        let to = SocketAddr::new(self.config.target_addr, frame.port_a());
        trace!("forwarding {:?} from {:?} to {:?}", frame, session, to);

        if let Err(e) = session.socket.send_to(frame.payload(), to).await {
            warn!("error sending datagram from local port {} to {:?}: {}", session.local_port, to, e);
        }
    }
}
