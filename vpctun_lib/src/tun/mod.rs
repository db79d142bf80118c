//! The point-to-point layer-3 virtual interface.
//!
//! On macOS the handle is a `PF_SYSTEM` control socket connected to the
//! `utun` driver; the kernel auto-assigns the unit number and prepends a
//! 4-byte address-family tag to every datagram, which reads strip and
//! writes reinject. Interface configuration goes through `ifconfig`.

use std::io;
use std::io::ErrorKind;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::{debug, warn};

use crate::common::cidr::Cidr;

/// Minimum bytes a well-formed read can carry: the framing tag plus an
/// IPv4 header.
const MIN_FRAME: usize = 4 + 20;

/// Where synthesized datagrams are emitted. The production implementation
/// is the device itself; tests substitute a collector.
pub trait DatagramSink: Send + Sync {
    fn send_datagram(&self, datagram: &[u8]) -> io::Result<()>;
}

pub struct TunDevice {
    name: String,
    fd: libc::c_int,
    closed: AtomicBool,
    // interface created by us and configured via ifconfig (not a test pair)
    managed: bool,
    write_lock: Mutex<()>,
}

impl TunDevice {
    /// Opens a new utun device, letting the kernel pick the unit number.
    /// Requires elevated privileges.
    #[cfg(target_os = "macos")]
    pub fn create() -> io::Result<TunDevice> {
        use std::mem;

        const UTUN_CONTROL_NAME: &[u8] = b"com.apple.net.utun_control";
        const SYSPROTO_CONTROL: libc::c_int = 2;
        const AF_SYS_CONTROL: u16 = 2;
        const UTUN_OPT_IFNAME: libc::c_int = 2;
        // _IOWR('N', 3, struct ctl_info)
        const CTLIOCGINFO: libc::c_ulong = 0xc0644e03;

        #[repr(C)]
        struct CtlInfo {
            ctl_id: u32,
            ctl_name: [libc::c_char; 96],
        }

        #[repr(C)]
        struct SockaddrCtl {
            sc_len: u8,
            sc_family: u8,
            ss_sysaddr: u16,
            sc_id: u32,
            sc_unit: u32,
            sc_reserved: [u32; 5],
        }

        let fd = unsafe { libc::socket(libc::PF_SYSTEM, libc::SOCK_DGRAM, SYSPROTO_CONTROL) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut info: CtlInfo = unsafe { mem::zeroed() };
        for (i, b) in UTUN_CONTROL_NAME.iter().enumerate() {
            info.ctl_name[i] = *b as libc::c_char;
        }
        if unsafe { libc::ioctl(fd, CTLIOCGINFO, &mut info) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let addr = SockaddrCtl {
            sc_len: mem::size_of::<SockaddrCtl>() as u8,
            sc_family: libc::AF_SYSTEM as u8,
            ss_sysaddr: AF_SYS_CONTROL,
            sc_id: info.ctl_id,
            sc_unit: 0, // 0 = next available unit
            sc_reserved: [0; 5],
        };
        let rc = unsafe {
            libc::connect(
                fd,
                &addr as *const SockaddrCtl as *const libc::sockaddr,
                mem::size_of::<SockaddrCtl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let mut name_buf = [0u8; libc::IFNAMSIZ];
        let mut name_len = name_buf.len() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                SYSPROTO_CONTROL,
                UTUN_OPT_IFNAME,
                name_buf.as_mut_ptr() as *mut libc::c_void,
                &mut name_len,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let name = String::from_utf8_lossy(&name_buf[..name_len as usize])
            .trim_end_matches('\0')
            .to_string();

        debug!("opened virtual interface {}", name);
        Ok(TunDevice {
            name,
            fd,
            closed: AtomicBool::new(false),
            managed: true,
            write_lock: Mutex::new(()),
        })
    }

    #[cfg(not(target_os = "macos"))]
    pub fn create() -> io::Result<TunDevice> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "virtual interface support requires the utun driver",
        ))
    }

    /// Applies the local address, mtu, and up state via `ifconfig`.
    pub fn configure(&self, local_ip: &Cidr, mtu: u32) -> io::Result<()> {
        let address = local_ip.network.to_string();
        // point-to-point: local and destination are the same address
        run_ifconfig(&[&self.name, &address, &address])?;
        run_ifconfig(&[&self.name, "mtu", &mtu.to_string()])?;
        run_ifconfig(&[&self.name, "up"])?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reads one IP datagram, stripping the address-family tag. Blocks in
    /// the kernel until a datagram arrives or the handle is closed.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::new(ErrorKind::Other, "interface closed"));
        }
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n == 0 {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "interface closed"));
        }
        if n < MIN_FRAME {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("short frame: {} bytes", n),
            ));
        }
        buf.copy_within(4..n, 0);
        Ok(n - 4)
    }

    /// Writes one IP datagram, prepending the address-family tag chosen
    /// from the version nibble. Concurrent writers are serialized.
    pub fn write(&self, datagram: &[u8]) -> io::Result<usize> {
        if datagram.is_empty() {
            return Err(io::Error::new(ErrorKind::InvalidInput, "empty datagram"));
        }
        if self.is_closed() {
            return Err(io::Error::new(ErrorKind::Other, "interface closed"));
        }
        let family: u32 = if datagram[0] >> 4 == 6 {
            libc::AF_INET6 as u32
        } else {
            libc::AF_INET as u32
        };
        let mut frame = Vec::with_capacity(4 + datagram.len());
        frame.extend_from_slice(&family.to_be_bytes());
        frame.extend_from_slice(datagram);

        let _guard = self.write_lock.lock().unwrap();
        let n = unsafe { libc::write(self.fd, frame.as_ptr() as *const libc::c_void, frame.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((n as usize).saturating_sub(4))
    }

    /// Closes the handle. The shutdown call wakes any reader blocked in the
    /// kernel, which is what the teardown ordering relies on; double close
    /// is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RDWR);
        }
        if self.managed {
            if let Err(e) = run_ifconfig(&[&self.name, "down"]) {
                warn!("failed to bring {} down: {}", self.name, e);
            }
        }
        unsafe {
            libc::close(self.fd);
        }
        debug!("closed virtual interface {}", self.name);
    }

    /// A connected pair of datagram endpoints standing in for the utun
    /// handle; both ends speak the same tagged framing.
    #[cfg(test)]
    pub(crate) fn pair() -> io::Result<(TunDevice, TunDevice)> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr())
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        let make = |fd: libc::c_int, name: &str| TunDevice {
            name: name.to_string(),
            fd,
            closed: AtomicBool::new(false),
            managed: false,
            write_lock: Mutex::new(()),
        };
        Ok((make(fds[0], "utun-test0"), make(fds[1], "utun-test1")))
    }
}

impl DatagramSink for TunDevice {
    fn send_datagram(&self, datagram: &[u8]) -> io::Result<()> {
        self.write(datagram).map(|_| ())
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_ifconfig(args: &[&str]) -> io::Result<()> {
    let output = Command::new("ifconfig").args(args).output()?;
    if !output.status.success() {
        return Err(io::Error::new(
            ErrorKind::Other,
            format!(
                "ifconfig {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn pair_round_trips_datagrams() {
        let (a, b) = TunDevice::pair().unwrap();
        let datagram = crate::packet::build_udp(
            "10.0.0.1".parse().unwrap(),
            53,
            "10.0.0.2".parse().unwrap(),
            4000,
            b"payload",
        );
        a.write(&datagram).unwrap();

        let mut buf = [0u8; 2048];
        let n = b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &datagram[..]);
    }

    #[test]
    fn close_unblocks_pending_read() {
        let (a, _b) = TunDevice::pair().unwrap();
        let a = std::sync::Arc::new(a);
        let reader = {
            let a = a.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 2048];
                a.read(&mut buf)
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        a.close();
        let result = reader.join().unwrap();
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn double_close_is_noop() {
        let (a, _b) = TunDevice::pair().unwrap();
        a.close();
        a.close();
        assert!(a.is_closed());
    }

    #[test]
    fn read_after_close_errors() {
        let (a, _b) = TunDevice::pair().unwrap();
        a.close();
        let mut buf = [0u8; 64];
        assert!(a.read(&mut buf).is_err());
        assert!(a.write(&[0x45u8; 40]).is_err());
    }
}
