use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Waker backed by a unix pipe.
///
/// Waker controls both the sending and receiving ends and empties the pipe
/// if writing to it (waking) fails.
#[derive(Debug)]
pub(crate) struct Waker {
    sender: File,
    receiver: File,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let [receiver, sender] = new_raw_pipe()?;
        let sender = unsafe { File::from_raw_fd(sender) };
        let receiver = unsafe { File::from_raw_fd(receiver) };
        Ok(Waker { sender, receiver })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        match (&self.sender).write(&[1]) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // The reading end is full so we'll empty the buffer and try
                // again.
                self.ack();
                self.wake()
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.wake(),
            Err(err) => Err(err),
        }
    }

    /// Empties the pipe's buffer after the selector reported the read end
    /// readable. This ignores any errors.
    pub(crate) fn ack(&self) {
        let mut buf = [0; 4096];
        loop {
            match (&self.receiver).read(&mut buf) {
                Ok(n) if n > 0 => continue,
                _ => return,
            }
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.receiver.as_raw_fd()
    }
}

/// Creates a new non-blocking, close-on-exec pipe; returns
/// `[read end, write end]`.
fn new_raw_pipe() -> io::Result<[RawFd; 2]> {
    let mut fds: [RawFd; 2] = [-1, -1];

    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;

    // Darwin doesn't have `pipe2(2)`; set the flags with `fcntl`.
    #[cfg(any(target_os = "ios", target_os = "macos"))]
    {
        syscall!(pipe(fds.as_mut_ptr()))?;
        for fd in &fds {
            if let Err(err) = syscall!(fcntl(*fd, libc::F_SETFL, libc::O_NONBLOCK))
                .and_then(|_| syscall!(fcntl(*fd, libc::F_SETFD, libc::FD_CLOEXEC)))
            {
                let _ = syscall!(close(fds[0]));
                let _ = syscall!(close(fds[1]));
                return Err(err);
            }
        }
    }

    Ok(fds)
}
