// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! File descriptor passing over the control socket, and the winsize probe
//! used to size a requested PTY.
//!
//! The OpenSSH mux client hands the server its stdin, stdout, and stderr
//! as three separate SCM_RIGHTS messages; each recvmsg here picks up one.

use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use std::io::{self, IoSliceMut};
use std::os::unix::io::{AsRawFd, RawFd};
use tokio::io::Interest;
use tokio::net::UnixStream;

/// Receive a single descriptor from the peer. The descriptor arrives with
/// one data byte alongside it (OpenSSH sends one), which is read and
/// discarded.
pub async fn recv_fd(stream: &UnixStream) -> io::Result<RawFd> {
    loop {
        stream.readable().await?;
        let attempt = stream.try_io(Interest::READABLE, || {
            let mut data = [0u8; 1];
            let mut iov = [IoSliceMut::new(&mut data)];
            let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
            let msg = recvmsg::<()>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            )
            .map_err(errno_to_io)?;
            let cmsgs = msg.cmsgs().map_err(errno_to_io)?;
            for cmsg in cmsgs {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    if let Some(fd) = fds.first() {
                        return Ok(*fd);
                    }
                }
            }
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message carried no SCM_RIGHTS descriptor",
            ))
        });
        match attempt {
            Ok(fd) => return Ok(fd),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Keep a received descriptor from leaking into anything we exec.
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(errno_to_io)?;
    Ok(())
}

nix::ioctl_read_bad!(tiocgwinsz, nix::libc::TIOCGWINSZ, nix::pty::Winsize);

/// Ask the terminal behind `fd` for its dimensions. Fails for pipes and
/// other non-TTYs, in which case the caller falls back to 80x24.
pub fn win_size(fd: RawFd) -> io::Result<(u16, u16)> {
    let mut ws = nix::pty::Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe { tiocgwinsz(fd, &mut ws) }.map_err(errno_to_io)?;
    Ok((ws.ws_row, ws.ws_col))
}

fn errno_to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}
