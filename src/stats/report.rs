use bytes::BytesMut;

use crate::stats::metrics::MetricsSnapshot;

/// Reassembles the device's diagnostic output into lines. Diagnostic bytes arrive in arbitrary
///  chunks, so a line may be split across several drains.
#[derive(Default)]
pub struct LineAssembler {
    pending: BytesMut,
}

impl LineAssembler {
    /// Adds `data`, returning all lines it completes (without the trailing `\n`). Non-printable
    ///  bytes are escaped.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(idx) = self.pending.iter().position(|&b| b == b'\n') {
            let line = self.pending.split_to(idx + 1);
            lines.push(line[..idx].escape_ascii().to_string());
        }
        lines
    }

    /// number of bytes of an incomplete line that are waiting for their `\n`
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

pub fn format_stats(open_sessions: usize, snapshot: &MetricsSnapshot) -> String {
    format!(
        "Open connections: {}; Inbound bytes/sec: {:.1}; Inbound loop time: {:.6}; Inbound checksum fails/sec: {:.2}; Inbound packets/sec: {:.2}",
        open_sessions,
        snapshot.bytes_per_sec,
        snapshot.avg_loop_time_secs,
        snapshot.checksum_failures_per_sec,
        snapshot.frames_per_sec,
    )
}
