use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use tracing::debug;

use super::{Transport, INDEX_NONE};

const BTPROTO_HCI: libc::c_int = 1;
const HCI_CHANNEL_CONTROL: u16 = 3;

/// How long one `read_event` call polls before reporting an empty read. The
/// reader thread uses this window to observe shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// `struct sockaddr_hci` from `<bluetooth/hci.h>`.
#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

/// Raw management-channel socket.
///
/// Binds the HCI control channel, which carries mgmt frames for all
/// controllers; commands address a specific controller through the index
/// field in the frame header. Opening the channel requires the
/// `CAP_NET_ADMIN` capability.
#[derive(Debug)]
pub struct MgmtSocket {
    fd: OwnedFd,
}

impl MgmtSocket {
    /// Opens and binds the control channel.
    pub fn open() -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_BLUETOOTH,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is a freshly created, owned socket
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let sa = SockaddrHci {
            hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: INDEX_NONE,
            hci_channel: HCI_CHANNEL_CONTROL,
        };
        let r = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::addr_of!(sa).cast(),
                mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        debug!("Opened mgmt control channel");
        Ok(Self { fd })
    }

    /// Waits for the socket to become readable. Returns false on timeout.
    fn poll_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        #[allow(clippy::cast_possible_truncation)]
        let r = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
        match r {
            0 => Ok(false),
            r if r < 0 => {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
            _ => Ok(true),
        }
    }
}

impl Transport for MgmtSocket {
    fn write_cmd(&self, b: &[u8]) -> io::Result<()> {
        // mgmt frames are written whole; a short write is a protocol break.
        let n = unsafe { libc::write(self.fd.as_raw_fd(), b.as_ptr().cast(), b.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        #[allow(clippy::cast_sign_loss)]
        if n as usize != b.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short mgmt command write",
            ));
        }
        Ok(())
    }

    fn read_event(&self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.poll_readable(POLL_INTERVAL)? {
            return Ok(0);
        }
        let n = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let e = io::Error::last_os_error();
            return if e.kind() == io::ErrorKind::WouldBlock {
                Ok(0)
            } else {
                Err(e)
            };
        }
        #[allow(clippy::cast_sign_loss)]
        Ok(n as usize)
    }
}
