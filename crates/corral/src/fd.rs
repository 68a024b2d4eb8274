//! Passing an open file descriptor over a unix socket, e.g. the pty master created inside
//! the container. The file name travels as the message payload and the descriptor as a
//! single `SCM_RIGHTS` control message.
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::{AsRawFd, RawFd};

use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr};

/// Longest accepted name, exclusive.
pub const MAX_NAME_LEN: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("sendfd: filename too long: {0}")]
    NameTooLong(String),
    #[error("recvfd: incorrect number of bytes read (n={bytes}, truncated={truncated})")]
    IncorrectBytes { bytes: usize, truncated: bool },
    #[error("recvfd: number of SCMs is not 1: {0}")]
    ControlMessageCount(usize),
    #[error("recvfd: number of fds is not 1: {0}")]
    FdCount(usize),
    #[error("fd passing syscall failed")]
    Socket(#[from] nix::Error),
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// A descriptor received from the other end together with its file name.
#[derive(Debug)]
pub struct NamedFd {
    pub name: String,
    pub fd: OwnedFd,
}

/// Sends `fd` over `socket`, blocking until the message is accepted.
pub fn send_fd<S: AsRawFd>(socket: &S, name: &str, fd: RawFd) -> Result<()> {
    if name.len() >= MAX_NAME_LEN {
        return Err(ProtocolError::NameTooLong(name.to_owned()));
    }

    let iov = [IoSlice::new(name.as_bytes())];
    let fds = [fd];
    socket::sendmsg::<UnixAddr>(
        socket.as_raw_fd(),
        &iov,
        &[ControlMessage::ScmRights(&fds)],
        MsgFlags::empty(),
        None,
    )?;

    Ok(())
}

/// Waits for exactly one descriptor on `socket`. Any descriptor that came with a rejected
/// message is closed.
pub fn recv_fd<S: AsRawFd>(socket: &S) -> Result<NamedFd> {
    let mut name = vec![0u8; MAX_NAME_LEN];
    // room for a second fd, so that an extra one is seen and closed instead of cut off
    let mut cmsg_space = nix::cmsg_space!([RawFd; 2]);

    let (bytes, truncated, control_messages, mut fds) = {
        let mut iov = [IoSliceMut::new(&mut name)];
        let msg = socket::recvmsg::<UnixAddr>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )?;

        let mut control_messages = 0;
        let mut fds = Vec::new();
        for cmsg in msg.cmsgs() {
            control_messages += 1;
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                // SAFETY: the kernel just installed these descriptors in our table and
                // nothing else owns them.
                fds.extend(
                    received
                        .into_iter()
                        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
                );
            }
        }

        let truncated = msg
            .flags
            .intersects(MsgFlags::MSG_TRUNC | MsgFlags::MSG_CTRUNC);
        (msg.bytes, truncated, control_messages, fds)
    };

    if bytes >= MAX_NAME_LEN || truncated {
        return Err(ProtocolError::IncorrectBytes { bytes, truncated });
    }
    if control_messages != 1 {
        return Err(ProtocolError::ControlMessageCount(control_messages));
    }
    if fds.len() != 1 {
        return Err(ProtocolError::FdCount(fds.len()));
    }

    name.truncate(bytes);
    let name = String::from_utf8_lossy(&name).into_owned();
    let fd = fds.remove(0);
    tracing::debug!(%name, fd = fd.as_raw_fd(), "received fd");
    Ok(NamedFd { name, fd })
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::{Read, Write};

    use anyhow::Result;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::unistd::pipe;

    use super::*;

    fn socket_pair() -> Result<(OwnedFd, OwnedFd)> {
        Ok(socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?)
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let (sender, receiver) = socket_pair()?;
        let (read_end, write_end) = pipe()?;

        send_fd(&sender, "console", write_end.as_raw_fd())?;
        drop(write_end);

        let received = recv_fd(&receiver)?;
        assert_eq!(received.name, "console");

        let mut writer = File::from(received.fd);
        writer.write_all(b"hello")?;
        drop(writer);

        let mut out = String::new();
        File::from(read_end).read_to_string(&mut out)?;
        assert_eq!(out, "hello");
        Ok(())
    }

    #[test]
    fn test_two_fds_rejected() -> Result<()> {
        let (sender, receiver) = socket_pair()?;
        let (a, b) = pipe()?;

        let fds = [a.as_raw_fd(), b.as_raw_fd()];
        socket::sendmsg::<UnixAddr>(
            sender.as_raw_fd(),
            &[IoSlice::new(b"console")],
            &[ControlMessage::ScmRights(&fds)],
            MsgFlags::empty(),
            None,
        )?;

        let err = recv_fd(&receiver).unwrap_err();
        assert!(matches!(err, ProtocolError::FdCount(2)));
        Ok(())
    }

    #[test]
    fn test_missing_fd_rejected() -> Result<()> {
        let (sender, receiver) = socket_pair()?;
        socket::sendmsg::<UnixAddr>(
            sender.as_raw_fd(),
            &[IoSlice::new(b"console")],
            &[],
            MsgFlags::empty(),
            None,
        )?;

        let err = recv_fd(&receiver).unwrap_err();
        assert!(matches!(err, ProtocolError::ControlMessageCount(0)));
        Ok(())
    }

    #[test]
    fn test_name_too_long() -> Result<()> {
        let (sender, _receiver) = socket_pair()?;
        let (a, _b) = pipe()?;
        let name = "x".repeat(MAX_NAME_LEN);
        let err = send_fd(&sender, &name, a.as_raw_fd()).unwrap_err();
        assert!(matches!(err, ProtocolError::NameTooLong(_)));

        let name = "x".repeat(MAX_NAME_LEN - 1);
        send_fd(&sender, &name, a.as_raw_fd())?;
        Ok(())
    }
}
