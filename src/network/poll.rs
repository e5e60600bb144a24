// src/network/poll.rs
//! Readiness multiplexer
//!
//! The supervisor loop sleeps in exactly one place: a bounded `poll(2)` wait
//! over every endpoint that wants I/O. Pools and web clients enqueue their
//! descriptors each tick, the loop blocks here, then both subsystems are
//! refreshed with the readiness results.

use crate::utils::error::MinerError;
use std::io;
use std::os::unix::io::RawFd;

/// A list of descriptors interested in one I/O direction
///
/// Filled before each wait, queried after it. Entries keep their readiness
/// flag until the next [`ReadinessSet::clear`].
#[derive(Default)]
pub struct ReadinessSet {
    entries: Vec<(RawFd, bool)>,
}

impl ReadinessSet {
    pub fn new() -> Self {
        ReadinessSet {
            entries: Vec::new(),
        }
    }

    /// Drops all entries; called at the top of every tick
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Registers a descriptor for the wait
    pub fn push(&mut self, fd: RawFd) {
        self.entries.push((fd, false));
    }

    /// Whether the descriptor saw an I/O-relevant transition in the last wait
    pub fn is_ready(&self, fd: RawFd) -> bool {
        self.entries
            .iter()
            .any(|&(entry, ready)| entry == fd && ready)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Blocks until any registered endpoint is readable/writable or the timeout
/// elapses
///
/// # Arguments
/// * `read` - Endpoints waiting for inbound bytes (or accepts)
/// * `write` - Endpoints with queued bytes or connects in progress
/// * `timeout_ms` - Upper bound on the wait; the loop needs to tick
///   non-I/O-driven logic periodically, so this must stay bounded
///
/// # Returns
/// The count of endpoints with an I/O-relevant transition. Hangups and
/// errors count as transitions so dead endpoints wake the loop and get
/// torn down instead of lingering.
pub fn wait(
    read: &mut ReadinessSet,
    write: &mut ReadinessSet,
    timeout_ms: u32,
) -> Result<usize, MinerError> {
    let mut fds: Vec<libc::pollfd> = Vec::with_capacity(read.len() + write.len());
    for &(fd, _) in &read.entries {
        fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
    }
    for &(fd, _) in &write.entries {
        fds.push(libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        });
    }

    let res = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms as i32) };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(MinerError::IoError(err));
    }

    let mut updated = 0;
    let wake = libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
    let reads = read.entries.len();
    for (index, pfd) in fds.iter().enumerate() {
        let interesting = if index < reads {
            libc::POLLIN | wake
        } else {
            libc::POLLOUT | wake
        };
        if pfd.revents & interesting == 0 {
            continue;
        }
        updated += 1;
        if index < reads {
            read.entries[index].1 = true;
        } else {
            write.entries[index - reads].1 = true;
        }
    }
    Ok(updated)
}
