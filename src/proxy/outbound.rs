use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

use crate::framing::frame::Frame;
use crate::proxy::proxy_config::ProxyConfig;
use crate::session::multiplexer::{DatagramReceiver, ReceivedDatagram};
use crate::session::session_table::SessionTable;

/// UDP -> serial link: takes datagrams that arrived on any session socket, frames them with the
///  session's remote endpoint and writes them to the serial link.
pub struct OutboundBridge<W> {
    config: Arc<ProxyConfig>,
    writer: W,
    datagrams: DatagramReceiver,
    sessions: Arc<SessionTable>,
    running: Arc<AtomicBool>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> OutboundBridge<W> {
    pub fn new(
        config: Arc<ProxyConfig>,
        writer: W,
        datagrams: DatagramReceiver,
        sessions: Arc<SessionTable>,
        running: Arc<AtomicBool>,
    ) -> OutboundBridge<W> {
        OutboundBridge {
            config,
            writer,
            datagrams,
            sessions,
            running,
        }
    }

    /// Runs until the running flag is cleared, or until writing to the serial link fails
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("starting outbound loop");

        while self.running.load(Ordering::Acquire) {
            if self.sessions.is_empty().await {
                tokio::time::sleep(self.config.idle_sleep).await;
                continue;
            }

            if let Some(datagram) = self.datagrams.next(self.config.multiplexer_timeout).await {
                self.forward(datagram).await?;
            }
        }

        info!("outbound loop stopped");
        Ok(())
    }

    async fn forward(&mut self, datagram: ReceivedDatagram) -> anyhow::Result<()> {
        let Some(key) = self.sessions.lookup_by_local_port(datagram.local_port).await else {
            debug!("dropping {:?}: no session for local port {}", datagram, datagram.local_port);
            return Ok(());
        };

        // the reply's sender port is the application port for the peer
        let frame = match Frame::new(key.address_id, datagram.from.port(), key.port_b, datagram.payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping datagram for {:?}: {}", key, e);
                return Ok(());
            }
        };
        trace!("writing {:?} to serial link", frame);

        let mut buf = BytesMut::with_capacity(frame.serialized_len());
        frame.ser(&mut buf);

        self.writer.write_all(&buf).await
            .context("error writing to serial link")?;
        self.writer.flush().await
            .context("error flushing serial link")?;
        Ok(())
    }
}
