//! Outbound socket establishment / 出站套接字建立
pub mod dialer;
pub mod socket;

pub use dialer::{race, RacingDialer, ATTEMPTS, DEFAULT_CONNECT_TIMEOUT, RETRIES};
pub use socket::{SocketConfig, SocketKind, SocketOption};
