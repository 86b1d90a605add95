//! Local port reservation for engines that listen on a socket.
//!
//! A port counts as free when it can be bound on the loopback interface right
//! now. There is an unavoidable race with other processes between the check
//! and the engine binding it; factories should surface that as a launch
//! failure so the slot is retried on a different port.

use crate::error::PoolError;
use std::net::{Ipv4Addr, TcpListener};

/// First port tried when a pool reserves ports without an explicit start.
pub const DEFAULT_PORT: u16 = 50052;

/// Returns `true` if `port` cannot currently be bound on localhost.
pub fn port_in_use(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_err()
}

/// Returns the first `count` free ports at or above `start`.
///
/// # Errors
///
/// Returns [`PoolError::NoAvailablePorts`] if fewer than `count` free ports
/// exist between `start` and 65535.
pub fn available_ports(count: usize, start: u16) -> Result<Vec<u16>, PoolError> {
    let ports: Vec<u16> = (start..=u16::MAX)
        .filter(|port| !port_in_use(*port))
        .take(count)
        .collect();

    if ports.len() < count {
        return Err(PoolError::NoAvailablePorts {
            requested: count,
            start,
        });
    }

    Ok(ports)
}

/// Returns the first free port strictly above `after`.
pub fn next_available_port(after: u16) -> Option<u16> {
    let start = after.checked_add(1)?;
    (start..=u16::MAX).find(|port| !port_in_use(*port))
}
