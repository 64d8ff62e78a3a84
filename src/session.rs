//! Session API
//!
//! A [`Session`] is one end of a named, bidirectional byte-stream connection
//! between exactly two processes. The [`Role::Creator`] provisions the
//! backing OS objects (one shared-memory segment holding two SPSC rings,
//! plus one wakeup FIFO per peer) and is the only role allowed to unlink
//! them; the [`Role::Attacher`] maps what the creator built.
//!
//! Reads and writes have stream-socket semantics: writes in blocking mode
//! transfer the whole buffer, reads return as soon as at least one byte is
//! available, and non-blocking mode surfaces `WouldBlock` instead of
//! sleeping. [`Session::event_fd`] exposes a descriptor for external
//! readiness multiplexing.
//!
//! A session must be externally serialized per process: using one `Session`
//! from several threads at once is not supported (the rings are strictly
//! single-producer single-consumer).

use crate::error::{Result, ShmPipeError};
use crate::layout::{RingHeader, SegmentLayout, HEADER_SIZE};
use crate::ring::{RingConsumer, RingProducer};
use crate::shm::ShmSegment;
use crate::wakeup::{create_fifo, unlink_fifo, WakeupChannel};
use rustix::fd::BorrowedFd;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{fence, Ordering};
use tracing::{debug, warn};

/// Longest accepted session name.
pub const MAX_NAME_LEN: usize = 63;

/// Which end of the session this process holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Provisions and owns the OS resources.
    Creator,
    /// Maps an existing session.
    Attacher,
}

/// What `close` does with the named OS objects.
///
/// Only the creator ever unlinks; an attacher's close with `Unlink` is
/// equivalent to `Retain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlinkPolicy {
    /// Remove the segment and FIFOs from their namespaces.
    Unlink,
    /// Leave them for the peer.
    Retain,
}

/// Everything that dies when the session closes.
struct Endpoints {
    shm: ShmSegment,
    tx: RingProducer,
    rx: RingConsumer,
    wakeup: WakeupChannel,
    broken: bool,
}

impl Endpoints {
    fn notify_peer(&mut self) -> Result<()> {
        match self.wakeup.notify() {
            Err(ShmPipeError::BrokenPipe) => {
                self.broken = true;
                Err(ShmPipeError::BrokenPipe)
            }
            other => other,
        }
    }

    fn wait_for_peer(&mut self) -> Result<()> {
        match self.wakeup.wait() {
            Err(ShmPipeError::BrokenPipe) => {
                self.broken = true;
                Err(ShmPipeError::BrokenPipe)
            }
            other => other,
        }
    }
}

/// One end of a shared-memory byte-stream session.
pub struct Session {
    name: String,
    role: Role,
    capacity: u32,
    s2c_path: PathBuf,
    c2s_path: PathBuf,
    nonblocking: bool,
    ep: Option<Endpoints>,
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ShmPipeError::InvalidName {
            got: name.to_string(),
            reason: "name is empty",
        });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ShmPipeError::InvalidName {
            got: name.to_string(),
            reason: "name exceeds 63 bytes",
        });
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        return Err(ShmPipeError::InvalidName {
            got: name.to_string(),
            reason: "only ASCII alphanumerics, '-', '_' and '.' are allowed",
        });
    }
    Ok(())
}

/// FIFO paths derived from the session name.
///
/// `s2c` carries wakeups from creator to attacher (the attacher sleeps on
/// it), `c2s` the reverse.
fn fifo_paths(name: &str) -> (PathBuf, PathBuf) {
    let dir = std::env::temp_dir();
    (
        dir.join(format!("shmpipe_{}_s2c", name)),
        dir.join(format!("shmpipe_{}_c2s", name)),
    )
}

impl Session {
    /// Create a new session and take the creator end.
    ///
    /// `capacity` is the per-direction ring size in bytes and must be a
    /// power of two in `[2, 1 GiB]`. Fails with `AlreadyExists` if a
    /// session of this name is already provisioned; of two racing creators
    /// exactly one wins.
    ///
    /// The session starts in blocking mode.
    pub fn create(name: &str, capacity: u32) -> Result<Self> {
        validate_name(name)?;
        let layout = SegmentLayout::for_capacity(capacity)?;

        let shm = ShmSegment::create(name, layout.total_size)?;
        let (s2c_path, c2s_path) = fifo_paths(name);

        // Winning the exclusive segment create makes us the owner of the
        // derived FIFO paths too; anything left there is stale debris from
        // a crashed predecessor.
        unlink_fifo(&s2c_path);
        unlink_fifo(&c2s_path);
        create_fifo(&s2c_path)?;
        if let Err(e) = create_fifo(&c2s_path) {
            unlink_fifo(&s2c_path);
            return Err(e);
        }

        let wakeup = match WakeupChannel::open(&c2s_path, &s2c_path) {
            Ok(w) => w,
            Err(e) => {
                unlink_fifo(&s2c_path);
                unlink_fifo(&c2s_path);
                return Err(e);
            }
        };

        let base = shm.as_ptr();
        let (tx, rx) = unsafe {
            let c2a = base.add(layout.c2a_header) as *mut RingHeader;
            let a2c = base.add(layout.a2c_header) as *mut RingHeader;
            RingHeader::init(c2a, capacity, layout.c2a_data as u32);
            RingHeader::init(a2c, capacity, layout.a2c_data as u32);
            // Publish the headers before the attacher can observe them.
            fence(Ordering::SeqCst);
            (
                RingProducer::from_raw(c2a, base.add(layout.c2a_data)),
                RingConsumer::from_raw(a2c, base.add(layout.a2c_data)),
            )
        };

        debug!(name, capacity, "session created");
        Ok(Self {
            name: name.to_string(),
            role: Role::Creator,
            capacity,
            s2c_path,
            c2s_path,
            nonblocking: false,
            ep: Some(Endpoints {
                shm,
                tx,
                rx,
                wakeup,
                broken: false,
            }),
        })
    }

    /// Attach to an existing session as the client end.
    ///
    /// Adopts the ring capacity from the segment header. Fails with
    /// `NotFound` if no creator provisioned this name, and with a
    /// `Malformed`-class error if the segment does not carry a valid
    /// header pair.
    pub fn attach(name: &str) -> Result<Self> {
        validate_name(name)?;

        let shm = ShmSegment::open(name)?;
        if shm.size() < 2 * HEADER_SIZE {
            return Err(ShmPipeError::Malformed {
                reason: "segment too small for two ring headers",
            });
        }

        let base = shm.as_ptr();
        let c2a = unsafe { &*(base as *const RingHeader) };
        c2a.validate()?;
        let capacity = c2a.capacity();

        let layout = SegmentLayout::for_capacity(capacity)?;
        if shm.size() < layout.total_size {
            return Err(ShmPipeError::Malformed {
                reason: "segment smaller than its declared layout",
            });
        }
        if c2a.data_offset() as usize != layout.c2a_data {
            return Err(ShmPipeError::Malformed {
                reason: "unexpected data offset in first ring header",
            });
        }

        let a2c = unsafe { &*(base.add(layout.a2c_header) as *const RingHeader) };
        a2c.validate()?;
        if a2c.capacity() != capacity {
            return Err(ShmPipeError::Malformed {
                reason: "ring capacities disagree",
            });
        }
        if a2c.data_offset() as usize != layout.a2c_data {
            return Err(ShmPipeError::Malformed {
                reason: "unexpected data offset in second ring header",
            });
        }

        let (s2c_path, c2s_path) = fifo_paths(name);
        let wakeup = WakeupChannel::open(&s2c_path, &c2s_path)?;

        let (tx, rx) = unsafe {
            (
                RingProducer::from_raw(a2c as *const RingHeader, base.add(layout.a2c_data)),
                RingConsumer::from_raw(c2a as *const RingHeader, base.add(layout.c2a_data)),
            )
        };

        debug!(name, capacity, "session attached");
        Ok(Self {
            name: name.to_string(),
            role: Role::Attacher,
            capacity,
            s2c_path,
            c2s_path,
            nonblocking: false,
            ep: Some(Endpoints {
                shm,
                tx,
                rx,
                wakeup,
                broken: false,
            }),
        })
    }

    fn endpoints(&mut self) -> Result<&mut Endpoints> {
        match self.ep.as_mut() {
            None => Err(ShmPipeError::Closed),
            Some(ep) if ep.broken => Err(ShmPipeError::BrokenPipe),
            Some(ep) => Ok(ep),
        }
    }

    /// Send bytes to the peer.
    ///
    /// Blocking mode transfers the whole buffer, sleeping whenever the ring
    /// is full, and only returns short if a signal interrupts the wait
    /// after partial progress. Non-blocking mode queues what fits and
    /// returns `WouldBlock` if nothing does. Zero-length writes return 0
    /// without touching the ring or the peer.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let nonblocking = self.nonblocking;
        let ep = self.endpoints()?;
        if buf.is_empty() {
            return Ok(0);
        }

        if nonblocking {
            let n = ep.tx.push(buf);
            if n == 0 {
                return Err(ShmPipeError::WouldBlock);
            }
            ep.notify_peer()?;
            return Ok(n);
        }

        let mut total = 0;
        while total < buf.len() {
            let n = ep.tx.push(&buf[total..]);
            if n > 0 {
                total += n;
                ep.notify_peer()?;
            } else {
                match ep.wait_for_peer() {
                    Ok(()) => {}
                    Err(ShmPipeError::Interrupted) if total > 0 => return Ok(total),
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(total)
    }

    /// Receive bytes from the peer.
    ///
    /// Blocking mode returns as soon as at least one byte is available;
    /// non-blocking mode returns `WouldBlock` on an empty ring. Zero-length
    /// reads return 0 with no side effect.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let nonblocking = self.nonblocking;
        let ep = self.endpoints()?;
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let n = ep.rx.pop(buf);
            if n > 0 {
                // The bytes are already the caller's; a dead peer only
                // matters for the next operation.
                if let Err(e) = ep.notify_peer() {
                    warn!(error = %e, "space-available wakeup not delivered");
                }
                return Ok(n);
            }
            if nonblocking {
                return Err(ShmPipeError::WouldBlock);
            }
            ep.wait_for_peer()?;
        }
    }

    /// Bytes currently readable. A snapshot; stale as soon as the peer
    /// runs. Returns 0 on a closed session.
    pub fn readable_bytes(&self) -> usize {
        self.ep.as_ref().map_or(0, |ep| ep.rx.available_bytes())
    }

    /// Bytes currently writable without blocking. Same caveats as
    /// [`Session::readable_bytes`].
    pub fn writable_bytes(&self) -> usize {
        self.ep.as_ref().map_or(0, |ep| ep.tx.free_bytes())
    }

    /// Switch between blocking and non-blocking operation.
    ///
    /// Takes effect on the next `read`/`write`; it does not interrupt an
    /// operation already blocked on the peer.
    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.nonblocking = nonblocking;
    }

    /// The descriptor to register with an external readiness multiplexer.
    ///
    /// It polls readable whenever this end may have been unblocked (data
    /// arrived or space freed). Spurious readiness is permitted; verify
    /// with [`Session::readable_bytes`]/[`Session::writable_bytes`] or by
    /// attempting the operation.
    pub fn event_fd(&self) -> Result<BorrowedFd<'_>> {
        match self.ep.as_ref() {
            None => Err(ShmPipeError::Closed),
            Some(ep) => Ok(ep.wakeup.readable_fd()),
        }
    }

    /// Tear down this end of the session.
    ///
    /// Always unmaps the segment and closes all descriptors. With
    /// [`UnlinkPolicy::Unlink`] a creator also removes the segment and
    /// FIFO names so no further attach can find them. Closing twice
    /// returns `Closed`.
    pub fn close(&mut self, policy: UnlinkPolicy) -> Result<()> {
        let mut ep = self.ep.take().ok_or(ShmPipeError::Closed)?;

        let unlink = self.role == Role::Creator && policy == UnlinkPolicy::Unlink;
        ep.shm.set_unlink_on_drop(unlink);
        drop(ep);
        if unlink {
            unlink_fifo(&self.s2c_path);
            unlink_fifo(&self.c2s_path);
        }

        debug!(name = %self.name, role = ?self.role, unlink, "session closed");
        Ok(())
    }

    /// The session name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Which end this is.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Per-direction ring capacity in bytes.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Whether operations currently return `WouldBlock` instead of
    /// sleeping.
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.ep.is_some() {
            let _ = self.close(UnlinkPolicy::Unlink);
        }
    }
}

impl io::Read for Session {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Session::read(self, buf).map_err(Into::into)
    }
}

impl io::Write for Session {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Session::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        // Writes land in the shared ring immediately.
        Ok(())
    }
}
