use std::{
    io,
    net::{IpAddr, SocketAddr},
    os::unix::io::{AsRawFd, RawFd},
    sync::Arc,
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;

/// Largest datagram we expect to read off an ICMP socket.
const RECV_BUFFER_SIZE: usize = 1500;

/// Minimum length of an IPv4 header (no options).
const IPV4_HEADER_MIN: usize = 20;

/// Address family of a ping target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: IpAddr) -> Family {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// How the ICMP endpoint is opened. `Raw` needs elevated privileges and
/// delivers the IPv4 header in-band; `Dgram` works for unprivileged
/// processes but the kernel rewrites the echo identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Raw,
    Dgram,
}

/// One received ICMP message with its out-of-band hop count. For raw IPv4
/// sockets the IP header has already been stripped.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub hop_limit: u8,
}

// Strong type for the ICMP endpoint, keeping the family/mode around so the
// receive path knows how to interpret the bytes.
pub struct IcmpSocket {
    socket: Socket,
    family: Family,
    mode: Mode,
}

impl IcmpSocket {
    pub fn new(
        family: Family,
        mode: Mode,
        source: Option<IpAddr>,
        bind_interface: Option<&str>,
    ) -> io::Result<IcmpSocket> {
        let (domain, protocol) = match family {
            Family::V4 => (Domain::IPV4, Protocol::ICMPV4),
            Family::V6 => (Domain::IPV6, Protocol::ICMPV6),
        };
        let ty = match mode {
            Mode::Raw => Type::RAW,
            Mode::Dgram => Type::DGRAM,
        };
        let socket = Socket::new(domain, ty, Some(protocol))?;
        socket.set_nonblocking(true)?;

        // Ask the kernel for the hop count of every received packet.
        enable_recv_hoplimit(&socket, family)?;

        let socket = match bind_interface {
            Some(bi) => bind_to_device(socket, bi)?,
            None => socket,
        };
        if let Some(src) = source {
            socket.bind(&SocketAddr::new(src, 0).into())?;
        }

        Ok(IcmpSocket {
            socket,
            family,
            mode,
        })
    }

    pub fn get_ref(&self) -> &Socket {
        &self.socket
    }

    fn send_to(&self, packet: &[u8], dst: &SockAddr) -> io::Result<usize> {
        self.socket.send_to(packet, dst)
    }

    // Single non-blocking read, hop count extracted from the control
    // messages requested in `new`.
    fn recv_datagram(&self) -> io::Result<Datagram> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let mut cmsg_buf = [0u8; 64];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len() as _;

        let read =
            unsafe { libc::recvmsg(self.socket.as_raw_fd(), &mut msg, 0) };
        if read < 0 {
            return Err(io::Error::last_os_error());
        }
        let nbytes = read as usize;

        let mut cmsg_hop = 0u8;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let level = (*cmsg).cmsg_level;
                let ty = (*cmsg).cmsg_type;
                if (level == libc::IPPROTO_IP && ty == libc::IP_TTL)
                    || (level == libc::IPPROTO_IPV6
                        && ty == libc::IPV6_HOPLIMIT)
                {
                    let mut value: libc::c_int = 0;
                    std::ptr::copy_nonoverlapping(
                        libc::CMSG_DATA(cmsg),
                        &mut value as *mut libc::c_int as *mut u8,
                        std::mem::size_of::<libc::c_int>(),
                    );
                    cmsg_hop = value as u8;
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        let mut hop_limit = cmsg_hop;
        let bytes = match (self.family, self.mode) {
            (Family::V4, Mode::Raw) => {
                // Raw IPv4 sockets deliver the IP header in-band; strip it
                // and prefer its TTL over the control message.
                let ihl = ((buf[0] & 0x0f) as usize) * 4;
                if nbytes >= IPV4_HEADER_MIN
                    && ihl >= IPV4_HEADER_MIN
                    && nbytes >= ihl
                {
                    hop_limit = buf[8];
                    buf[ihl..nbytes].to_vec()
                } else {
                    // Too short to carry an IP header; hand it through and
                    // let the codec reject it.
                    buf[..nbytes].to_vec()
                }
            }
            _ => buf[..nbytes].to_vec(),
        };

        Ok(Datagram { bytes, hop_limit })
    }
}

impl AsRawFd for IcmpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

pub struct AsyncIcmpSocket {
    inner: AsyncFd<IcmpSocket>,
}

impl AsyncIcmpSocket {
    pub fn new(socket: IcmpSocket) -> io::Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(socket)?,
        })
    }

    /// Splits the endpoint into independently owned send and receive halves
    /// that share the underlying descriptor.
    pub fn split(self) -> (IcmpSender, IcmpReceiver) {
        let shared = Arc::new(self);
        (IcmpSender(Arc::clone(&shared)), IcmpReceiver(shared))
    }

    pub async fn send_to(
        &self,
        packet: &[u8],
        addr: IpAddr,
    ) -> io::Result<usize> {
        let dst = SockAddr::from(SocketAddr::new(addr, 0));
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(packet, &dst)) {
                Ok(res) => return res,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn recv(&self) -> io::Result<Datagram> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| inner.get_ref().recv_datagram()) {
                Ok(res) => return res,
                Err(_would_block) => continue,
            }
        }
    }
}

/// Owned send half of an [`AsyncIcmpSocket`].
pub struct IcmpSender(Arc<AsyncIcmpSocket>);

impl IcmpSender {
    pub async fn send_to(
        &self,
        packet: &[u8],
        addr: IpAddr,
    ) -> io::Result<usize> {
        self.0.send_to(packet, addr).await
    }
}

/// Owned receive half of an [`AsyncIcmpSocket`].
pub struct IcmpReceiver(Arc<AsyncIcmpSocket>);

impl IcmpReceiver {
    pub async fn recv(&self) -> io::Result<Datagram> {
        self.0.recv().await
    }
}

// Socket2 has no wrapper for IP_RECVTTL/IPV6_RECVHOPLIMIT, so set them
// through libc directly.
fn enable_recv_hoplimit(socket: &Socket, family: Family) -> io::Result<()> {
    let on: libc::c_int = 1;
    let (level, option) = match family {
        Family::V4 => (libc::IPPROTO_IP, libc::IP_RECVTTL),
        Family::V6 => (libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT),
    };
    let res = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            option,
            &on as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if res == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn bind_to_device(
    socket: Socket,
    bind_interface: &str,
) -> Result<Socket, std::io::Error> {
    // Socket2 bind_device does not have nice error types, so we have to
    // handle the libc errors. In case, we get an error when binding, map it
    // into a more friendly std::io::Error
    if let Err(err) = socket.bind_device(Some(bind_interface.as_bytes())) {
        return if matches!(err.raw_os_error(), Some(libc::ENODEV)) {
            let error_msg = format!(
                "error binding to device (`{}`): {}",
                bind_interface, err
            );
            Err(std::io::Error::new(std::io::ErrorKind::Other, error_msg))
        } else {
            let error_msg = format!("unexpected error binding device: {}", err);
            Err(std::io::Error::new(std::io::ErrorKind::Other, error_msg))
        };
    }

    Ok(socket)
}

// Get the IP address of the interface in case a source address is not
// specified but a bind interface is.
pub fn interface_to_ipaddr(
    interface: &str,
    family: Family,
) -> io::Result<IpAddr> {
    let interfaces = pnet_datalink::interfaces();
    let interface = interfaces
        .into_iter()
        .find(|iface| iface.name == interface)
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "interface not found")
        })?;

    let ipaddr = interface
        .ips
        .into_iter()
        .find(|ip| match family {
            Family::V4 => ip.is_ipv4(),
            Family::V6 => ip.is_ipv6(),
        })
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "interface has no address for the requested family",
            )
        })?;

    Ok(ipaddr.ip())
}
