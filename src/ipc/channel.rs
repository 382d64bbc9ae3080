//! Framed IPC transport
//!
//! One message is one CRLF-terminated protocol line, optionally carrying
//! exactly one open file descriptor as ancillary data. Framing works by
//! peeking the socket buffer without consuming it: only once a full CRLF
//! line is visible is that exact byte count read, so ancillary descriptors
//! stay attached to the message they were sent with and partial lines are
//! simply left in the kernel buffer.

use std::io::{self, IoSlice, IoSliceMut, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::cmsg_space;
use nix::sys::socket::{
    recv, recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, SockFlag, SockType, UnixAddr,
};

use crate::line;

/// Result of one nonblocking read attempt
#[derive(Debug)]
pub enum ReadOutcome {
    Message {
        argv: Vec<String>,
        fd: Option<OwnedFd>,
    },
    /// No complete line buffered yet
    Again,
    /// Peer closed, or the peer overflowed the frame limit
    Closed,
}

pub struct IpcChannel {
    stream: UnixStream,
    /// Bytes a full socket buffer would not take; always whole frames
    /// or the tail of one, never the head of a split frame
    outbuf: Vec<u8>,
}

impl IpcChannel {
    /// Connected channel pair, both ends nonblocking
    pub fn pair() -> io::Result<(IpcChannel, IpcChannel)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(io::Error::from)?;
        Ok((
            IpcChannel::from_stream(UnixStream::from(a))?,
            IpcChannel::from_stream(UnixStream::from(b))?,
        ))
    }

    pub fn from_stream(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            outbuf: Vec::new(),
        })
    }

    /// Rebuild a channel around a descriptor inherited across exec
    pub fn from_owned_fd(fd: OwnedFd) -> io::Result<Self> {
        Self::from_stream(UnixStream::from(fd))
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Queue one message and push as much buffered output as the socket
    /// will take. A full socket buffer is not an error; the remainder
    /// stays queued for the next [`flush`](Self::flush).
    pub fn send<S: AsRef<str>>(&mut self, argv: &[S]) -> io::Result<()> {
        self.outbuf.extend_from_slice(line::build(argv).as_bytes());
        self.flush()
    }

    /// Retry buffered output. Returns `Ok` on a still-full socket buffer;
    /// call again once the descriptor polls writable.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.outbuf.is_empty() {
            match self.stream.write(&self.outbuf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbuf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn has_output(&self) -> bool {
        !self.outbuf.is_empty()
    }

    /// Send a message with one descriptor attached. The descriptor is
    /// consumed; after a successful send only the receiver owns it.
    ///
    /// The descriptor rides the first byte of its own frame, so any
    /// backlog from earlier frames must drain first.
    pub fn send_with_fd<S: AsRef<str>>(&mut self, argv: &[S], fd: OwnedFd) -> io::Result<()> {
        self.flush()?;
        if !self.outbuf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "output backlog ahead of a descriptor-carrying message",
            ));
        }
        let wire = line::build(argv);
        let fds = [fd.as_raw_fd()];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        let iov = [IoSlice::new(wire.as_bytes())];
        let sent = sendmsg::<UnixAddr>(
            self.stream.as_raw_fd(),
            &iov,
            &cmsg,
            MsgFlags::empty(),
            None,
        )
        .map_err(io::Error::from)?;
        if sent < wire.len() {
            // The descriptor went with the first byte; queue the rest.
            self.outbuf.extend_from_slice(&wire.as_bytes()[sent..]);
            self.flush()?;
        }
        Ok(())
    }

    /// Try to read one complete message without consuming partial lines
    pub fn read_message(&mut self) -> io::Result<ReadOutcome> {
        let fd = self.stream.as_raw_fd();
        let mut peek = [0u8; line::MAX_LINE];
        let peeked = match recv(fd, &mut peek, MsgFlags::MSG_PEEK) {
            Ok(0) => return Ok(ReadOutcome::Closed),
            Ok(n) => n,
            Err(nix::errno::Errno::EAGAIN) => return Ok(ReadOutcome::Again),
            Err(nix::errno::Errno::EINTR) => return Ok(ReadOutcome::Again),
            Err(e) => return Err(io::Error::from(e)),
        };

        let Some(end) = peek[..peeked].windows(2).position(|w| w == b"\r\n") else {
            if peeked >= line::MAX_LINE {
                // A peer that never terminates its line is broken.
                return Ok(ReadOutcome::Closed);
            }
            return Ok(ReadOutcome::Again);
        };
        let frame_len = end + 2;

        let mut buf = vec![0u8; frame_len];
        let mut received_fd = None;
        // `msg` keeps `buf` borrowed through the iovec; take what we need
        // and let the borrow end before reading the bytes back.
        let bytes = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let mut cmsg_buf = cmsg_space!([RawFd; 1]);
            let msg = recvmsg::<UnixAddr>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())
                .map_err(io::Error::from)?;
            for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    for raw in fds {
                        // Safety: the kernel just installed this descriptor
                        // in our table for us; nothing else owns it.
                        received_fd = Some(unsafe { OwnedFd::from_raw_fd(raw) });
                    }
                }
            }
            msg.bytes
        };
        if bytes == 0 {
            return Ok(ReadOutcome::Closed);
        }

        let text = String::from_utf8_lossy(&buf[..bytes]);
        match line::parse(&text) {
            Some(argv) => Ok(ReadOutcome::Message {
                argv,
                fd: received_fd,
            }),
            None => Ok(ReadOutcome::Again),
        }
    }

    #[cfg(test)]
    pub fn stream_mut(&mut self) -> &mut UnixStream {
        &mut self.stream
    }
}
