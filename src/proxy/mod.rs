pub mod diagnostics;
pub mod inbound;
pub mod outbound;
pub mod proxy;
pub mod proxy_config;
