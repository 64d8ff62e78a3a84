//! shmpipe - socket-like IPC byte streams over POSIX shared memory
//!
//! This library provides a bidirectional, full-duplex byte-stream
//! connection between exactly two local processes, with stream-socket
//! semantics: partial reads and writes, blocking and non-blocking modes,
//! and a file descriptor usable with poll/epoll/kqueue.
//!
//! # Architecture
//!
//! - **Creator**: provisions one shared-memory segment and two named FIFOs,
//!   owns them, and is the only role that unlinks them
//! - **Attacher**: maps the existing session
//!
//! Each direction of a session is a lock-free single-producer
//! single-consumer byte ring in the shared segment; the FIFOs carry no
//! payload, only one-byte wakeup tokens that let a peer sleep in the kernel
//! instead of spinning.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  RingHeader + ring data   creator → attacher │
//! ├─────────────────────────────────────────────┤
//! │  RingHeader + ring data   attacher → creator │
//! └─────────────────────────────────────────────┘
//!        shared memory segment  /dev/shm
//!
//!   s2c FIFO: creator wakes attacher
//!   c2s FIFO: attacher wakes creator
//! ```
//!
//! # Example
//!
//! ```no_run
//! use shmpipe::Session;
//!
//! // Server process
//! let mut server = Session::create("demo", 65536)?;
//!
//! // Client process
//! let mut client = Session::attach("demo")?;
//! client.write(b"hello")?;
//!
//! let mut buf = [0u8; 16];
//! let n = server.read(&mut buf)?;
//! assert_eq!(&buf[..n], b"hello");
//! # Ok::<(), shmpipe::ShmPipeError>(())
//! ```

pub mod bindings;
pub mod error;
pub mod layout;
pub mod ring;
pub mod session;
pub mod shm;
pub mod wakeup;

pub use error::{Result, ShmPipeError};
pub use session::{Role, Session, UnlinkPolicy, MAX_NAME_LEN};
