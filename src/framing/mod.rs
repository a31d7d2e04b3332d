pub mod crc;
pub mod frame;
pub mod frame_decoder;
