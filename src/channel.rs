//! Packet channel between the engine and the application.
//!
//! A `SOCK_SEQPACKET` socketpair: every `send` on one end is exactly one
//! `recv` on the other, so IP packets are never split or merged and no
//! framing layer is needed. The engine end is always non-blocking; the
//! application end follows [`BlockingMode`].

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

#[cfg(any(target_os = "linux", target_os = "android"))]
const SOCK_FLAGS: libc::c_int = libc::SOCK_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SOCK_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// How the application end of the channel behaves on an empty read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockingMode {
    /// `read()` waits for the next full packet.
    #[default]
    Blocking,
    /// `read()` returns `EAGAIN`; the descriptor is meant for a poller.
    NonBlocking,
}

impl BlockingMode {
    pub fn from_blocking(blocking: bool) -> Self {
        if blocking {
            Self::Blocking
        } else {
            Self::NonBlocking
        }
    }
}

/// One end of a packet channel. The descriptor is closed on drop.
#[derive(Debug)]
pub struct ChannelEnd {
    fd: OwnedFd,
}

impl ChannelEnd {
    fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Send one packet. Returns the number of bytes written.
    pub fn send(&self, packet: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
                SEND_FLAGS,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Receive one packet into `buf`.
    ///
    /// A packet larger than `buf` is consumed and reported as
    /// `InvalidData` instead of being handed over in pieces.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_TRUNC,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("packet of {} bytes truncated to {}", n, buf.len()),
            ));
        }
        Ok(n)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let fd = self.fd.as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn is_nonblocking(&self) -> io::Result<bool> {
        let flags = unsafe { libc::fcntl(self.fd.as_raw_fd(), libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(flags & libc::O_NONBLOCK != 0)
    }

    /// True once the other end has been closed.
    pub fn peer_closed(&self) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        rc > 0 && pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0
    }

    /// Duplicate the descriptor for a caller that wants to own it.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }
}

impl AsRawFd for ChannelEnd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for ChannelEnd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// The two ends of one tunnel's packet channel.
#[derive(Debug)]
pub struct PacketChannel {
    ends: Mutex<Option<(Arc<ChannelEnd>, Arc<ChannelEnd>)>>,
}

impl PacketChannel {
    /// Create the socketpair. The engine end is non-blocking.
    pub fn create(app_mode: BlockingMode) -> Result<Self> {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | SOCK_FLAGS,
                0,
                fds.as_mut_ptr(),
            )
        };
        if rc < 0 {
            return Err(Error::ChannelCreation(io::Error::last_os_error()));
        }
        // SAFETY: socketpair succeeded, both descriptors are fresh and owned here.
        let (engine_fd, app_fd) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let engine = ChannelEnd::new(engine_fd);
        let app = ChannelEnd::new(app_fd);
        engine.set_nonblocking(true).map_err(Error::ChannelCreation)?;
        app.set_nonblocking(app_mode == BlockingMode::NonBlocking)
            .map_err(Error::ChannelCreation)?;

        debug!(
            engine_fd = engine.as_raw_fd(),
            app_fd = app.as_raw_fd(),
            ?app_mode,
            "Packet channel created"
        );
        Ok(Self {
            ends: Mutex::new(Some((Arc::new(engine), Arc::new(app)))),
        })
    }

    pub fn engine_end(&self) -> Result<Arc<ChannelEnd>> {
        self.ends
            .lock()
            .as_ref()
            .map(|(engine, _)| engine.clone())
            .ok_or(Error::ChannelClosed)
    }

    pub fn app_end(&self) -> Result<Arc<ChannelEnd>> {
        self.ends
            .lock()
            .as_ref()
            .map(|(_, app)| app.clone())
            .ok_or(Error::ChannelClosed)
    }

    /// Raw application descriptor, still owned by the channel.
    pub fn app_fd(&self) -> Result<RawFd> {
        Ok(self.app_end()?.as_raw_fd())
    }

    /// Duplicate of the application descriptor, owned by the caller.
    pub fn take_app_fd(&self) -> Result<OwnedFd> {
        Ok(self.app_end()?.try_clone_fd()?)
    }

    pub fn is_closed(&self) -> bool {
        self.ends.lock().is_none()
    }

    /// Release both ends. Safe to call any number of times.
    ///
    /// A descriptor still borrowed by an in-flight reader is closed when
    /// that reader drops its handle.
    pub fn close(&self) {
        if let Some((engine, app)) = self.ends.lock().take() {
            debug!(
                engine_fd = engine.as_raw_fd(),
                app_fd = app.as_raw_fd(),
                "Packet channel closed"
            );
        }
    }
}

impl Drop for PacketChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_boundaries_preserved() {
        let channel = PacketChannel::create(BlockingMode::Blocking).unwrap();
        let app = channel.app_end().unwrap();
        let engine = channel.engine_end().unwrap();

        app.send(&[1]).unwrap();
        app.send(&[2, 2]).unwrap();
        app.send(&[3, 3, 3]).unwrap();

        let mut buf = [0u8; 2048];
        let n = engine.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1]);
        let n = engine.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[2, 2]);
        let n = engine.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[3, 3, 3]);

        let err = engine.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_both_directions_mtu_sized() {
        let channel = PacketChannel::create(BlockingMode::Blocking).unwrap();
        let app = channel.app_end().unwrap();
        let engine = channel.engine_end().unwrap();

        let big = vec![0x45u8; 1500];
        let small = vec![0x60u8; 40];
        assert_eq!(engine.send(&big).unwrap(), 1500);
        assert_eq!(engine.send(&small).unwrap(), 40);

        let mut buf = [0u8; 1500];
        assert_eq!(app.recv(&mut buf).unwrap(), 1500);
        assert_eq!(&buf[..], &big[..]);
        assert_eq!(app.recv(&mut buf).unwrap(), 40);
    }

    #[test]
    fn test_engine_end_never_blocks() {
        let channel = PacketChannel::create(BlockingMode::Blocking).unwrap();
        let engine = channel.engine_end().unwrap();
        assert!(engine.is_nonblocking().unwrap());
        assert!(!channel.app_end().unwrap().is_nonblocking().unwrap());

        let mut buf = [0u8; 64];
        let err = engine.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_nonblocking_app_end() {
        let channel = PacketChannel::create(BlockingMode::NonBlocking).unwrap();
        let app = channel.app_end().unwrap();
        assert!(app.is_nonblocking().unwrap());
        let mut buf = [0u8; 64];
        assert_eq!(
            app.recv(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn test_oversized_packet_is_not_split() {
        let channel = PacketChannel::create(BlockingMode::Blocking).unwrap();
        let app = channel.app_end().unwrap();
        let engine = channel.engine_end().unwrap();

        app.send(&[7u8; 100]).unwrap();
        app.send(&[8u8; 4]).unwrap();

        let mut small = [0u8; 10];
        let err = engine.recv(&mut small).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        // The rest of the oversized packet is gone; the next read is the next packet.
        let n = engine.recv(&mut small).unwrap();
        assert_eq!(&small[..n], &[8u8; 4]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let channel = PacketChannel::create(BlockingMode::Blocking).unwrap();
        let engine = channel.engine_end().unwrap();
        channel.close();
        channel.close();
        assert!(channel.is_closed());
        assert!(matches!(channel.app_end(), Err(Error::ChannelClosed)));
        assert!(matches!(channel.engine_end(), Err(Error::ChannelClosed)));
        // The engine handle we still hold sees the peer gone.
        assert!(engine.peer_closed());
    }

    #[test]
    fn test_take_app_fd_outlives_close() {
        let channel = PacketChannel::create(BlockingMode::Blocking).unwrap();
        let engine = channel.engine_end().unwrap();
        let owned = channel.take_app_fd().unwrap();
        assert_ne!(owned.as_raw_fd(), channel.app_fd().unwrap());

        engine.send(&[1, 2, 3]).unwrap();
        let app = ChannelEnd::new(owned);
        let mut buf = [0u8; 8];
        assert_eq!(app.recv(&mut buf).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_engine_end_polls_readable() {
        use tokio::io::unix::AsyncFd;
        use tokio::io::Interest;

        let channel = PacketChannel::create(BlockingMode::Blocking).unwrap();
        let app = channel.app_end().unwrap();
        let fd = AsyncFd::with_interest(channel.engine_end().unwrap(), Interest::READABLE).unwrap();

        app.send(&[0x45, 0, 0, 20]).unwrap();
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                let mut guard = fd.readable().await.unwrap();
                if let Ok(res) = guard.try_io(|inner| inner.get_ref().recv(&mut buf)) {
                    break res.unwrap();
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(&buf[..n], &[0x45, 0, 0, 20]);
    }
}
