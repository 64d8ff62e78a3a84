//! FIFO-backed wakeup channel
//!
//! Each peer of a session sleeps on its own named FIFO and pokes the
//! other's. The FIFOs carry no payload, only one-byte wakeup tokens; the
//! ring indices in shared memory are the source of truth, so extra tokens
//! are harmless and every waiter re-checks the indices after waking.
//!
//! # FD discipline
//!
//! - A peer opens its **own** FIFO read+write non-blocking. Holding write
//!   capability means the open never blocks and reads never see EOF, so
//!   the fd can sit in an external readiness multiplexer indefinitely.
//! - A peer opens the **peer's** FIFO write-only non-blocking. That open
//!   fails with `ENXIO` until the peer holds its read end, so it is retried
//!   lazily at the next notify; until then notifying is a no-op, which is
//!   safe because a peer with no read end open has never slept.
//!
//! Once paired, the peer is the sole reader of its own FIFO. Its death
//! therefore surfaces as `EPIPE` on our writes and `POLLERR` on our write
//! fd, both reported as `BrokenPipe`.

use crate::error::{Result, ShmPipeError};
use rustix::event::{poll, PollFd, PollFlags};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::{open, unlinkat, AtFlags, FileType, Mode, OFlags, CWD};
use rustix::io::Errno;
use std::path::{Path, PathBuf};
use tracing::warn;

/// How many queued wakeup tokens one wait discards at most.
const DRAIN_BATCH: usize = 8;

/// Create a wakeup FIFO with 0600 permissions.
pub fn create_fifo(path: &Path) -> Result<()> {
    rustix::fs::mknodat(CWD, path, FileType::Fifo, Mode::RUSR | Mode::WUSR, 0)
        .map_err(|e| ShmPipeError::from_os("mkfifo", &path.to_string_lossy(), e))
}

/// Best-effort removal of a wakeup FIFO.
pub fn unlink_fifo(path: &Path) {
    let _ = unlinkat(CWD, path, AtFlags::empty());
}

/// One peer's half of the wakeup plumbing.
pub struct WakeupChannel {
    /// Own FIFO, read+write non-blocking. We sleep on this.
    wait_fd: OwnedFd,
    /// The peer's FIFO path, for lazy pairing.
    peer_path: PathBuf,
    /// The peer's FIFO, write-only non-blocking, once the peer exists.
    peer_fd: Option<OwnedFd>,
}

impl WakeupChannel {
    /// Open the wakeup channel over an existing FIFO pair.
    ///
    /// `own` is the FIFO this peer sleeps on, `peer` the one it notifies.
    pub fn open(own: &Path, peer: &Path) -> Result<Self> {
        let wait_fd = open(
            own,
            OFlags::RDWR | OFlags::NONBLOCK | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| ShmPipeError::from_os("open fifo", &own.to_string_lossy(), e))?;

        let peer_fd = Self::open_peer(peer)?;

        Ok(Self {
            wait_fd,
            peer_path: peer.to_path_buf(),
            peer_fd,
        })
    }

    fn open_peer(path: &Path) -> Result<Option<OwnedFd>> {
        match open(
            path,
            OFlags::WRONLY | OFlags::NONBLOCK | OFlags::CLOEXEC,
            Mode::empty(),
        ) {
            Ok(fd) => Ok(Some(fd)),
            // The peer has not opened its read end yet.
            Err(Errno::NXIO) => Ok(None),
            // The FIFO is gone: the session was torn down under us.
            Err(Errno::NOENT) => Err(ShmPipeError::BrokenPipe),
            Err(e) => Err(ShmPipeError::from_os(
                "open fifo",
                &path.to_string_lossy(),
                e,
            )),
        }
    }

    fn peer_fd(&mut self) -> Result<Option<&OwnedFd>> {
        if self.peer_fd.is_none() {
            self.peer_fd = Self::open_peer(&self.peer_path)?;
        }
        Ok(self.peer_fd.as_ref())
    }

    /// Wake the peer by queueing one token.
    ///
    /// If a token is already pending the write fails with `EAGAIN` and is
    /// swallowed: the peer will observe the pending token. Never blocks.
    pub fn notify(&mut self) -> Result<()> {
        let Some(fd) = self.peer_fd()? else {
            // Not paired yet; the peer cannot be asleep.
            return Ok(());
        };

        loop {
            match rustix::io::write(fd, &[1u8]) {
                Ok(_) => return Ok(()),
                Err(Errno::AGAIN) => return Ok(()),
                Err(Errno::INTR) => continue,
                Err(Errno::PIPE) => return Err(ShmPipeError::BrokenPipe),
                Err(e) => {
                    warn!(error = %e, "wakeup notify failed");
                    return Err(ShmPipeError::Io {
                        op: "fifo write",
                        source: e.into(),
                    });
                }
            }
        }
    }

    /// Sleep until the peer queues a token, then drain a small batch.
    ///
    /// Also watches the peer's fd: if the peer's read end disappears while
    /// we sleep, returns `BrokenPipe` instead of sleeping forever. A signal
    /// surfaces as `Interrupted`. A return says nothing about ring state;
    /// callers re-check the indices.
    pub fn wait(&mut self) -> Result<()> {
        loop {
            let (own_events, peer_events) = {
                let own = PollFd::new(&self.wait_fd, PollFlags::IN);
                match &self.peer_fd {
                    Some(peer) => {
                        let mut fds = [own, PollFd::new(peer, PollFlags::empty())];
                        match poll(&mut fds, -1) {
                            Ok(_) => (fds[0].revents(), fds[1].revents()),
                            Err(Errno::INTR) => return Err(ShmPipeError::Interrupted),
                            Err(e) => {
                                return Err(ShmPipeError::Io {
                                    op: "poll",
                                    source: e.into(),
                                })
                            }
                        }
                    }
                    None => {
                        let mut fds = [own];
                        match poll(&mut fds, -1) {
                            Ok(_) => (fds[0].revents(), PollFlags::empty()),
                            Err(Errno::INTR) => return Err(ShmPipeError::Interrupted),
                            Err(e) => {
                                return Err(ShmPipeError::Io {
                                    op: "poll",
                                    source: e.into(),
                                })
                            }
                        }
                    }
                }
            };

            if peer_events.contains(PollFlags::ERR) {
                return Err(ShmPipeError::BrokenPipe);
            }
            if own_events.contains(PollFlags::IN) {
                self.drain();
                return Ok(());
            }
            // Spurious wakeup; poll again.
        }
    }

    /// Discard pending tokens without blocking.
    pub fn drain(&self) {
        let mut buf = [0u8; DRAIN_BATCH];
        let _ = rustix::io::read(&self.wait_fd, &mut buf);
    }

    /// The fd an external readiness multiplexer should watch for this peer.
    ///
    /// Level-style with respect to the caller's subsequent operations:
    /// readable whenever a wakeup is pending. Spurious readiness is
    /// possible; callers verify by attempting the operation.
    pub fn readable_fd(&self) -> BorrowedFd<'_> {
        self.wait_fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FifoPair {
        a: PathBuf,
        b: PathBuf,
    }

    impl FifoPair {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir();
            let a = dir.join(format!("shmpipe_test_{}_{}_a", tag, std::process::id()));
            let b = dir.join(format!("shmpipe_test_{}_{}_b", tag, std::process::id()));
            create_fifo(&a).unwrap();
            create_fifo(&b).unwrap();
            Self { a, b }
        }
    }

    impl Drop for FifoPair {
        fn drop(&mut self) {
            unlink_fifo(&self.a);
            unlink_fifo(&self.b);
        }
    }

    fn readable_within(fd: BorrowedFd<'_>, millis: i32) -> bool {
        let mut fds = [PollFd::new(&fd, PollFlags::IN)];
        poll(&mut fds, millis).unwrap() > 0
    }

    #[test]
    fn test_notify_then_wait() {
        let fifos = FifoPair::new("notify");
        let mut alice = WakeupChannel::open(&fifos.a, &fifos.b).unwrap();
        let mut bob = WakeupChannel::open(&fifos.b, &fifos.a).unwrap();

        alice.notify().unwrap();
        bob.wait().unwrap();

        bob.notify().unwrap();
        alice.wait().unwrap();
    }

    #[test]
    fn test_single_wait_drains_burst() {
        let fifos = FifoPair::new("burst");
        let mut alice = WakeupChannel::open(&fifos.a, &fifos.b).unwrap();
        let mut bob = WakeupChannel::open(&fifos.b, &fifos.a).unwrap();

        alice.notify().unwrap();
        alice.notify().unwrap();
        alice.notify().unwrap();

        bob.wait().unwrap();
        assert!(!readable_within(bob.readable_fd(), 0));
    }

    #[test]
    fn test_unpaired_notify_is_noop() {
        let fifos = FifoPair::new("unpaired");
        let mut alice = WakeupChannel::open(&fifos.a, &fifos.b).unwrap();

        // Nobody holds b's read end yet; the notify must neither block
        // nor error.
        alice.notify().unwrap();
    }

    #[test]
    fn test_readable_fd_reports_pending_token() {
        let fifos = FifoPair::new("level");
        let mut alice = WakeupChannel::open(&fifos.a, &fifos.b).unwrap();
        let bob = WakeupChannel::open(&fifos.b, &fifos.a).unwrap();

        assert!(!readable_within(bob.readable_fd(), 0));
        alice.notify().unwrap();
        assert!(readable_within(bob.readable_fd(), 1000));

        bob.drain();
        assert!(!readable_within(bob.readable_fd(), 0));
    }

    #[test]
    fn test_wait_blocks_until_notified() {
        let fifos = FifoPair::new("block");
        let mut alice = WakeupChannel::open(&fifos.a, &fifos.b).unwrap();
        let mut bob = WakeupChannel::open(&fifos.b, &fifos.a).unwrap();

        let waiter = std::thread::spawn(move || {
            bob.wait().unwrap();
            bob
        });

        std::thread::sleep(Duration::from_millis(50));
        alice.notify().unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_peer_death_breaks_pipe() {
        let fifos = FifoPair::new("death");
        let mut alice = WakeupChannel::open(&fifos.a, &fifos.b).unwrap();
        let bob = WakeupChannel::open(&fifos.b, &fifos.a).unwrap();

        // Pair alice's write end while bob is alive.
        alice.notify().unwrap();

        drop(bob);
        match alice.notify() {
            Err(ShmPipeError::BrokenPipe) => {}
            other => panic!("expected BrokenPipe, got {:?}", other),
        }
    }
}
