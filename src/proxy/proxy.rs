use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

use crate::proxy::diagnostics::DiagnosticBuffer;
use crate::proxy::inbound::InboundBridge;
use crate::proxy::outbound::OutboundBridge;
use crate::proxy::proxy_config::ProxyConfig;
use crate::session::multiplexer::Multiplexer;
use crate::session::session_table::SessionTable;
use crate::stats::metrics::{Metrics, MetricsSnapshot};

/// Bridges a serial link to local UDP sockets. It runs two tasks: one for each direction.
///
/// The inbound task (serial -> UDP) is the only one creating sessions; the outbound task
///  (UDP -> serial) only looks them up. The serial link is split into independent read and
///  write halves, so both directions can make progress at the same time.
pub struct SerialProxy {
    config: Arc<ProxyConfig>,
    running: Arc<AtomicBool>,
    sessions: Arc<SessionTable>,
    metrics: Arc<Metrics>,
    diagnostics: Arc<DiagnosticBuffer>,
    inbound: JoinHandle<anyhow::Result<()>>,
    outbound: JoinHandle<anyhow::Result<()>>,
}

impl SerialProxy {
    /// Starts forwarding in both directions.
    ///
    /// NB: must be called from inside a Tokio runtime
    pub fn start<S>(config: ProxyConfig, serial: S) -> anyhow::Result<SerialProxy>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;
        let config = Arc::new(config);

        let (multiplexer, datagrams) = Multiplexer::new(config.datagram_queue_capacity, config.max_datagram_size);
        let sessions = Arc::new(SessionTable::new(config.bind_addr, config.local_port_range(), Arc::new(multiplexer)));
        let metrics = Arc::new(Metrics::new());
        let diagnostics = Arc::new(DiagnosticBuffer::default());
        let running = Arc::new(AtomicBool::new(true));

        let (reader, writer) = tokio::io::split(serial);

        let inbound = InboundBridge::new(config.clone(), reader, sessions.clone(), metrics.clone(), diagnostics.clone(), running.clone());
        let outbound = OutboundBridge::new(config.clone(), writer, datagrams, sessions.clone(), running.clone());

        let inbound = tokio::spawn(inbound.run().instrument(info_span!("inbound")));
        let outbound = tokio::spawn(outbound.run().instrument(info_span!("outbound")));
        info!("proxy started");

        Ok(SerialProxy {
            config,
            running,
            sessions,
            metrics,
            diagnostics,
            inbound,
            outbound,
        })
    }

    /// Returns the bytes from the serial link that were not part of a frame since the previous
    ///  call
    pub fn take_diagnostics(&self) -> Bytes {
        self.diagnostics.drain()
    }

    /// Rates since the previous call.
    ///
    /// NB: This resets the counters, see [Metrics::snapshot]
    pub fn stats(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn num_sessions(&self) -> usize {
        self.sessions.len().await
    }

    /// `false` once shutdown started or either direction stopped on its own (e.g. because the
    ///  serial link was closed)
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.inbound.is_finished() && !self.outbound.is_finished()
    }

    /// Stops both directions, closes all session sockets and waits for both tasks to finish.
    ///  Returns the first error that terminated either of the tasks.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!("shutting down");
        self.running.store(false, Ordering::Release);

        self.sessions.teardown(self.config.shutdown_grace_period).await;
        info!("Closed proxy");

        let inbound_result = Self::join("inbound", self.inbound).await;
        let outbound_result = Self::join("outbound", self.outbound).await;
        info!("Threads joined");

        inbound_result.and(outbound_result)
    }

    async fn join(name: &str, handle: JoinHandle<anyhow::Result<()>>) -> anyhow::Result<()> {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow!("{} task panicked or was cancelled: {}", name, e)),
        };
        if let Err(e) = &result {
            error!("{} loop terminated with error: {:#}", name, e);
        }
        result
    }
}
