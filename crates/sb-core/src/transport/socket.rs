//! Outbound socket construction / 出站套接字构建
//!
//! Options are applied in a fixed order before the first connect or send:
//! interface binding, routing mark, per-family local address, TCP fast open,
//! multipath TCP, then UDP don't-fragment. Multipath TCP is a protocol choice,
//! so it is decided when the socket is created and its step is a no-op.

use sb_config::DialerOptions;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::{TcpSocket, UdpSocket};

#[cfg(target_os = "linux")]
const IPPROTO_MPTCP: i32 = 262;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Tcp,
    Udp,
}

/// One configuration step, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketOption {
    BindInterface(String),
    RoutingMark(u32),
    BindAddress(IpAddr),
    TcpFastOpen,
    MultipathTcp,
    DisableUdpFragment,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketConfig {
    pub bind_interface: String,
    pub routing_mark: u32,
    pub inet4_bind_address: Option<Ipv4Addr>,
    pub inet6_bind_address: Option<Ipv6Addr>,
    pub tcp_fast_open: bool,
    pub tcp_multi_path: bool,
    /// IP fragmentation stays enabled on UDP sockets.
    pub udp_fragment: bool,
}

impl From<&DialerOptions> for SocketConfig {
    fn from(o: &DialerOptions) -> Self {
        Self {
            bind_interface: o.bind_interface.clone(),
            routing_mark: o.routing_mark,
            inet4_bind_address: o.inet4_bind_address,
            inet6_bind_address: o.inet6_bind_address,
            tcp_fast_open: o.tcp_fast_open,
            tcp_multi_path: o.tcp_multi_path,
            udp_fragment: o.udp_fragment.unwrap_or(false),
        }
    }
}

impl SocketConfig {
    /// Ordered steps for a socket of `kind` in the family of `ipv6`.
    pub fn plan(&self, kind: SocketKind, ipv6: bool) -> Vec<SocketOption> {
        let mut steps = Vec::new();
        if !self.bind_interface.is_empty() {
            steps.push(SocketOption::BindInterface(self.bind_interface.clone()));
        }
        if self.routing_mark != 0 {
            steps.push(SocketOption::RoutingMark(self.routing_mark));
        }
        let local = if ipv6 {
            self.inet6_bind_address.map(IpAddr::V6)
        } else {
            self.inet4_bind_address.map(IpAddr::V4)
        };
        if let Some(ip) = local {
            steps.push(SocketOption::BindAddress(ip));
        }
        match kind {
            SocketKind::Tcp => {
                if self.tcp_fast_open {
                    steps.push(SocketOption::TcpFastOpen);
                }
                if self.tcp_multi_path {
                    steps.push(SocketOption::MultipathTcp);
                }
            }
            SocketKind::Udp => {
                if !self.udp_fragment {
                    steps.push(SocketOption::DisableUdpFragment);
                }
            }
        }
        steps
    }
}

fn new_socket(config: &SocketConfig, kind: SocketKind, ipv6: bool) -> io::Result<Socket> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    match kind {
        SocketKind::Udp => Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)),
        #[cfg(target_os = "linux")]
        SocketKind::Tcp if config.tcp_multi_path => {
            Socket::new(domain, Type::STREAM, Some(Protocol::from(IPPROTO_MPTCP))).or_else(|e| {
                tracing::warn!(target: "sb_core::transport", error = %e, "multipath tcp unavailable");
                Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            })
        }
        SocketKind::Tcp => {
            let _ = config;
            Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        }
    }
}

fn apply(socket: &Socket, option: &SocketOption, ipv6: bool) -> io::Result<()> {
    match option {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        SocketOption::BindInterface(name) => socket.bind_device(Some(name.as_bytes())),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        SocketOption::RoutingMark(mark) => socket.set_mark(*mark),
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        SocketOption::BindInterface(_) | SocketOption::RoutingMark(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "interface binding and routing mark require linux",
        )),
        SocketOption::BindAddress(ip) => socket.bind(&SocketAddr::new(*ip, 0).into()),
        #[cfg(target_os = "linux")]
        SocketOption::TcpFastOpen => setsockopt_int(socket, libc::IPPROTO_TCP, libc::TCP_FASTOPEN_CONNECT, 1),
        #[cfg(target_os = "linux")]
        SocketOption::DisableUdpFragment if ipv6 => setsockopt_int(
            socket,
            libc::IPPROTO_IPV6,
            libc::IPV6_MTU_DISCOVER,
            libc::IPV6_PMTUDISC_DO,
        ),
        #[cfg(target_os = "linux")]
        SocketOption::DisableUdpFragment => {
            setsockopt_int(socket, libc::IPPROTO_IP, libc::IP_MTU_DISCOVER, libc::IP_PMTUDISC_DO)
        }
        #[cfg(not(target_os = "linux"))]
        SocketOption::TcpFastOpen | SocketOption::DisableUdpFragment => {
            let _ = ipv6;
            tracing::debug!(target: "sb_core::transport", ?option, "socket option ignored on this platform");
            Ok(())
        }
        SocketOption::MultipathTcp => Ok(()),
    }
}

#[cfg(target_os = "linux")]
fn setsockopt_int(socket: &Socket, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    // SAFETY:
    // - 不变量：fd 在 socket 生命周期内有效
    // - FFI/平台契约：value 指针与长度描述同一个 c_int
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn build(config: &SocketConfig, kind: SocketKind, ipv6: bool) -> io::Result<Socket> {
    let socket = new_socket(config, kind, ipv6)?;
    for option in config.plan(kind, ipv6) {
        apply(&socket, &option, ipv6)?;
    }
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Unconnected TCP socket configured for reaching `target`.
pub fn tcp_socket(config: &SocketConfig, target: SocketAddr) -> io::Result<TcpSocket> {
    let socket = build(config, SocketKind::Tcp, target.is_ipv6())?;
    Ok(TcpSocket::from_std_stream(socket.into()))
}

/// Bound UDP socket of the given family.
pub fn udp_socket(config: &SocketConfig, ipv6: bool) -> io::Result<UdpSocket> {
    let socket = build(config, SocketKind::Udp, ipv6)?;
    let bound = if ipv6 {
        config.inet6_bind_address.is_some()
    } else {
        config.inet4_bind_address.is_some()
    };
    if !bound {
        let any = if ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        socket.bind(&SocketAddr::new(any, 0).into())?;
    }
    UdpSocket::from_std(socket.into())
}
