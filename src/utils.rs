use std::os::fd::{AsRawFd, RawFd};
use std::{io, ptr};

use nix::libc;
use nix::sys::epoll::{Epoll, EpollEvent};

/// `epoll_ctl` on a raw descriptor the backend does not own.
pub fn epoll_ctl(epfd: &Epoll, op: i32, fd: RawFd, mut event: Option<EpollEvent>) -> io::Result<()> {
    let event = match &mut event {
        Some(ev) => ev as *mut EpollEvent as *mut libc::epoll_event,
        None => ptr::null_mut(),
    };
    let ret = unsafe { libc::epoll_ctl(epfd.0.as_raw_fd(), op, fd, event) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Whether a failed `epoll_ctl` only means the descriptor is already gone
/// from the interest list, e.g. because it was closed.
pub fn is_gone(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EBADF) | Some(libc::ENOENT))
}
