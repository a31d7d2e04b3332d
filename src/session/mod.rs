pub mod multiplexer;
pub mod port_allocation;
pub mod session_table;
