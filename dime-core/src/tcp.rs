//! TCP socket tuning.
//!
//! # Safety
//!
//! Configuring an accepted stream means borrowing its raw descriptor as
//! a `socket2::Socket` for one setsockopt call. The borrow is wrapped in
//! `ManuallyDrop` so the descriptor is never closed here; no raw handle
//! escapes this module.

#![allow(unsafe_code)]

use std::io;
use std::mem::ManuallyDrop;

/// Enable `TCP_NODELAY` on a compio `TcpStream`.
///
/// DiME is a request-reply protocol with small reply frames; leaving
/// Nagle's algorithm on would stall every client round-trip behind the
/// delayed-ACK timer.
///
/// # Errors
///
/// Returns an error if the socket option cannot be set.
#[inline]
pub fn enable_tcp_nodelay(stream: &compio::net::TcpStream) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};

        let borrowed =
            ManuallyDrop::new(unsafe { socket2::Socket::from_raw_fd(stream.as_raw_fd()) });
        borrowed.set_nodelay(true)
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::{AsRawSocket, FromRawSocket};

        let borrowed =
            ManuallyDrop::new(unsafe { socket2::Socket::from_raw_socket(stream.as_raw_socket()) });
        borrowed.set_nodelay(true)
    }

    #[cfg(not(any(unix, windows)))]
    {
        // No way to reach the handle here; the broker still works, just
        // with Nagle's algorithm left on.
        let _ = stream;
        Ok(())
    }
}
