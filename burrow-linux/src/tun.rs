//! Linux TUN virtual interface. The daemon reads outbound IP packets from it
//! and writes decrypted inbound payloads back; the engine never touches it.

use std::io;
use std::os::unix::io::RawFd;

// TUNSETIFF = _IOW('T', 202, c_int); PowerPC encodes the ioctl direction
// bits differently from x86/ARM.
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
const TUNSETIFF: libc::c_ulong = 0x800454ca;
#[cfg(not(any(target_arch = "powerpc", target_arch = "powerpc64")))]
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct Ifreq {
    ifr_name: [u8; 16],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

pub struct TunDevice {
    fd: RawFd,
    name: String,
}

impl TunDevice {
    /// Open /dev/net/tun and attach a TUN interface. The fd stays blocking:
    /// reads run on a dedicated thread.
    pub fn create(name: &str) -> io::Result<Self> {
        let fd = unsafe { libc::open(b"/dev/net/tun\0".as_ptr() as *const _, libc::O_RDWR) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut req = Ifreq {
            ifr_name: [0u8; 16],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        let name_bytes = name.as_bytes();
        let copy_len = name_bytes.len().min(15);
        req.ifr_name[..copy_len].copy_from_slice(&name_bytes[..copy_len]);

        let ret = unsafe { libc::ioctl(fd, TUNSETIFF as _, &mut req as *mut _) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let actual_name = std::str::from_utf8(&req.ifr_name)
            .unwrap_or(name)
            .trim_end_matches('\0')
            .to_string();
        Ok(Self { fd, name: actual_name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Assign the leased overlay address and bring the interface up.
    pub fn configure(&self, address: &str, prefix: u8, mtu: u16) -> io::Result<()> {
        run_ip(&["addr", "add", &format!("{}/{}", address, prefix), "dev", &self.name])?;
        run_ip(&["link", "set", "dev", &self.name, "mtu", &mtu.to_string()])?;
        run_ip(&["link", "set", "dev", &self.name, "up"])
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const _, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn run_ip(args: &[&str]) -> io::Result<()> {
    let status = std::process::Command::new("ip").args(args).status()?;
    if !status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("ip {} failed with {}", args.join(" "), status),
        ));
    }
    Ok(())
}
