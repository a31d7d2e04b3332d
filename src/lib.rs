//! Bridges a serial link to local UDP sockets.
//!
//! A device on the serial link exchanges application datagrams with processes on this host.
//!  Each datagram travels over the serial link in a frame that names its remote endpoint
//!  (address id and port) and the local application port. The proxy allocates one local UDP
//!  socket per remote endpoint ('session'), delivers the frame's payload from that socket to
//!  the application port on localhost, and frames replies to that socket back onto the serial
//!  link.
//!
//! ## Frame format
//!
//! All numbers are little endian:
//! ```ascii
//!  0: preamble CF EB 01 81
//!  4: payload length (u16)
//!  6: address id (u8)
//!  7: port a (u16) - application port on this host
//!  9: port b (u16) - port of the remote endpoint
//! 11: payload
//!  *: CRC-16 (poly 0x5935) over everything from offset 4 through the end of the payload (u16)
//!  *: terminator 0x0A - not validated
//! ```
//!
//! Bytes between frames are collected as diagnostic output of the device.

pub mod framing;
pub mod proxy;
pub mod session;
pub mod stats;
pub mod util;

#[cfg(test)]
pub mod test_util;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
