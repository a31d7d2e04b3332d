use std::net::{IpAddr, Ipv4Addr};
use std::ops::Range;
use std::time::Duration;

use anyhow::bail;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// The address that session sockets are bound to
    pub bind_addr: IpAddr,
    /// Payloads arriving over the serial link are sent to this address, at the port from the frame
    pub target_addr: IpAddr,

    /// Local ports for sessions are allocated at or above `max(port_b, min_local_port)`
    pub min_local_port: u16,
    /// exclusive upper bound for local session ports
    pub max_local_port: u16,

    /// Receive buffer size for datagrams going to the serial link. Longer datagrams are truncated.
    pub max_datagram_size: usize,
    /// Number of received datagrams that can be queued for the serial link before session
    ///  sockets stop being read
    pub datagram_queue_capacity: usize,

    pub serial_read_buffer_size: usize,
    /// upper bound for a single read from the serial link, so the inbound loop notices shutdown
    pub serial_read_timeout: Duration,

    /// upper bound for a single wait for datagrams, so the outbound loop notices shutdown
    pub multiplexer_timeout: Duration,
    /// how long the outbound loop sleeps while there are no sessions
    pub idle_sleep: Duration,

    /// time between stopping the loops and closing the sockets on shutdown
    pub shutdown_grace_period: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyConfig {
    pub fn new() -> ProxyConfig {
        ProxyConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            target_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            min_local_port: 10000,
            max_local_port: 65535,
            max_datagram_size: 1024,
            datagram_queue_capacity: 256,
            serial_read_buffer_size: 4096,
            serial_read_timeout: Duration::from_millis(100),
            multiplexer_timeout: Duration::from_secs(1),
            idle_sleep: Duration::from_millis(10),
            shutdown_grace_period: Duration::from_millis(1500),
        }
    }

    pub fn local_port_range(&self) -> Range<u16> {
        self.min_local_port..self.max_local_port
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_local_port >= self.max_local_port {
            bail!("local port range {}..{} is empty", self.min_local_port, self.max_local_port);
        }
        if self.max_datagram_size == 0 || self.max_datagram_size > u16::MAX as usize {
            bail!("max datagram size must be between 1 and {}, was {}", u16::MAX, self.max_datagram_size);
        }
        if self.datagram_queue_capacity == 0 {
            bail!("datagram queue capacity must not be 0");
        }
        if self.serial_read_buffer_size == 0 {
            bail!("serial read buffer size must not be 0");
        }
        if self.shutdown_grace_period <= self.serial_read_timeout.max(self.multiplexer_timeout) {
            bail!("shutdown grace period must be longer than both the serial read timeout and the multiplexer timeout");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        let config = ProxyConfig::new();
        config.validate().unwrap();
        assert_eq!(config.local_port_range(), 10000..65535);
    }

    #[rstest]
    #[case::empty_port_range(|c: &mut ProxyConfig| c.min_local_port = c.max_local_port)]
    #[case::zero_datagram_size(|c: &mut ProxyConfig| c.max_datagram_size = 0)]
    #[case::huge_datagram_size(|c: &mut ProxyConfig| c.max_datagram_size = 70_000)]
    #[case::zero_queue(|c: &mut ProxyConfig| c.datagram_queue_capacity = 0)]
    #[case::zero_read_buffer(|c: &mut ProxyConfig| c.serial_read_buffer_size = 0)]
    #[case::short_grace_period(|c: &mut ProxyConfig| c.shutdown_grace_period = Duration::from_millis(500))]
    fn test_invalid(#[case] modify: fn(&mut ProxyConfig)) {
        let mut config = ProxyConfig::new();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
