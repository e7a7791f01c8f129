//! Process-wide UDP port-pair allocator.
//!
//! Ports are handed out in even/odd RTP/RTCP pairs from a configured range,
//! using a wrap-around cursor so repeated allocations spread load across the
//! whole range instead of piling up at the bottom.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;

use rtpbridge_protocol::{BridgeConfig, Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// The address family the whole process binds media sockets in. Exactly one
/// family is active at a time — no dual-stack listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    fn wildcard(self) -> IpAddr {
        match self {
            AddressFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    fn domain(self) -> Domain {
        match self {
            AddressFamily::V4 => Domain::IPV4,
            AddressFamily::V6 => Domain::IPV6,
        }
    }
}

/// Resolve the process-wide bind address/family from configuration: an
/// explicit `local_ip` pins the family, otherwise IPv6 is preferred when the
/// kernel supports it.
pub fn resolve_family(config: &BridgeConfig) -> (AddressFamily, IpAddr) {
    if let Some(ip) = config.local_ip.as_deref()
        && let Ok(addr) = ip.parse::<IpAddr>()
    {
        let family = if addr.is_ipv6() {
            AddressFamily::V6
        } else {
            AddressFamily::V4
        };
        return (family, addr);
    }

    // No explicit bind address: prefer IPv6 with the v6-only socket option
    // cleared (so mapped IPv4 peers still work), falling back to IPv4 if
    // the kernel has no IPv6 support at all.
    match Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)) {
        Ok(_) => (AddressFamily::V6, AddressFamily::V6.wildcard()),
        Err(_) => (AddressFamily::V4, AddressFamily::V4.wildcard()),
    }
}

struct Cursor {
    next: u16,
    low: u16,
    high: u16,
}

impl Cursor {
    fn new(low: u16, high: u16) -> Self {
        Self { next: low, low, high }
    }

    /// Returns the rtp port to try next and advances the cursor, wrapping
    /// to `low` once the range is exhausted.
    fn advance(&mut self) -> u16 {
        let candidate = self.next;
        self.next = if self.next.saturating_add(2) > self.high.saturating_sub(1) {
            self.low
        } else {
            self.next + 2
        };
        candidate
    }
}

/// A bound RTP/RTCP socket pair ready for late-binding to the remote peer.
pub struct AllocatedPorts {
    pub rtp_socket: UdpSocket,
    pub rtcp_socket: UdpSocket,
    pub rtp_port: u16,
    pub rtcp_port: u16,
}

struct State {
    cursor: Cursor,
    /// Sockets that bound successfully but whose partner port was busy.
    /// Kept so a later allocation landing on the same port again doesn't
    /// have to repeat the bind syscall against a range with a few
    /// permanently busy ports.
    spare: HashMap<u16, std::net::UdpSocket>,
}

pub struct PortAllocator {
    state: Mutex<State>,
    family: AddressFamily,
    bind_ip: IpAddr,
}

impl PortAllocator {
    pub fn new(family: AddressFamily, bind_ip: IpAddr, low: u16, high: u16) -> Self {
        Self {
            state: Mutex::new(State {
                cursor: Cursor::new(low, high),
                spare: HashMap::new(),
            }),
            family,
            bind_ip,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        let (family, bind_ip) = resolve_family(config);
        let (range, issues) = config.port_range();
        for issue in issues {
            warn!("{issue}");
        }
        Self::new(family, bind_ip, range.low, range.high)
    }

    /// Allocate a bound RTP/RTCP socket pair. `dscp` is applied as
    /// `dscp << 2` to IP_TOS on the RTP socket only.
    pub async fn allocate_pair(&self, dscp: Option<u8>) -> Result<AllocatedPorts> {
        let low = {
            let guard = self.state.lock().unwrap();
            guard.cursor.low
        };
        let mut scanned = 0u32;
        let span = {
            let guard = self.state.lock().unwrap();
            (guard.cursor.high - guard.cursor.low) as u32 / 2 + 1
        };

        loop {
            let rtp_port = {
                let mut guard = self.state.lock().unwrap();
                guard.cursor.advance()
            };
            let rtcp_port = rtp_port + 1;
            scanned += 1;

            match self.try_bind_pair(rtp_port, rtcp_port, dscp).await {
                Ok(pair) => return Ok(pair),
                Err(PartialBind::Neither) => {}
                Err(PartialBind::RtpOnly(sock)) => {
                    let mut guard = self.state.lock().unwrap();
                    guard.spare.insert(rtp_port, sock);
                }
            }

            if scanned >= span && rtp_port == low {
                return Err(Error::IoError(
                    "udp port range exhausted for rtp/rtcp pair".into(),
                ));
            }
            if scanned > span {
                return Err(Error::IoError(
                    "udp port range exhausted for rtp/rtcp pair".into(),
                ));
            }
        }
    }

    async fn try_bind_pair(
        &self,
        rtp_port: u16,
        rtcp_port: u16,
        dscp: Option<u8>,
    ) -> std::result::Result<AllocatedPorts, PartialBind> {
        let rtp_std = {
            let spare = self.state.lock().unwrap().spare.remove(&rtp_port);
            match spare {
                Some(sock) => Ok(sock),
                None => self.bind_one(rtp_port),
            }
        };
        let rtp_std = match rtp_std {
            Ok(sock) => sock,
            Err(_) => return Err(PartialBind::Neither),
        };

        if let Some(dscp) = dscp {
            apply_dscp(&rtp_std, self.family, dscp);
        }

        let rtcp_std = {
            let spare = self.state.lock().unwrap().spare.remove(&rtcp_port);
            match spare {
                Some(sock) => Ok(sock),
                None => self.bind_one(rtcp_port),
            }
        };
        let rtcp_std = match rtcp_std {
            Ok(sock) => sock,
            Err(_) => return Err(PartialBind::RtpOnly(rtp_std)),
        };

        let rtp_socket = match tokio_from_std(rtp_std) {
            Ok(s) => s,
            Err(_) => return Err(PartialBind::Neither),
        };
        let rtcp_socket = match tokio_from_std(rtcp_std) {
            Ok(s) => s,
            Err(_) => return Err(PartialBind::Neither),
        };

        debug!(rtp_port, rtcp_port, "allocated rtp/rtcp port pair");
        Ok(AllocatedPorts {
            rtp_socket,
            rtcp_socket,
            rtp_port,
            rtcp_port,
        })
    }

    fn bind_one(&self, port: u16) -> std::io::Result<std::net::UdpSocket> {
        let socket = Socket::new(self.family.domain(), Type::DGRAM, Some(Protocol::UDP))?;
        if self.family == AddressFamily::V6 {
            let _ = socket.set_only_v6(false);
        }
        socket.set_reuse_address(true)?;
        let addr: SocketAddr = SocketAddr::new(self.bind_ip, port);
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }
}

fn tokio_from_std(sock: std::net::UdpSocket) -> std::io::Result<UdpSocket> {
    UdpSocket::from_std(sock)
}

fn apply_dscp(sock: &std::net::UdpSocket, family: AddressFamily, dscp: u8) {
    let socket = socket2::SockRef::from(sock);
    let tos = (dscp as u32) << 2;
    let result = match family {
        AddressFamily::V4 => socket.set_tos(tos),
        AddressFamily::V6 => socket.set_tclass_v6(tos),
    };
    if let Err(e) = result {
        warn!("failed to set DSCP {dscp} on rtp socket: {e}");
    }
}

enum PartialBind {
    Neither,
    RtpOnly(std::net::UdpSocket),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_never_yields_an_odd_rtp_port() {
        let mut cursor = Cursor::new(10000, 10010);
        for _ in 0..20 {
            let port = cursor.advance();
            assert_eq!(port % 2, 0);
        }
    }

    #[test]
    fn cursor_wraps_to_low_after_exhausting_the_range() {
        let mut cursor = Cursor::new(10000, 10006);
        let first = cursor.advance();
        let second = cursor.advance();
        let third = cursor.advance();
        assert_eq!(first, 10000);
        assert_eq!(second, 10002);
        assert_eq!(third, 10000, "cursor should wrap once it runs past high-1");
    }

    #[tokio::test]
    async fn allocate_pair_binds_consecutive_even_odd_ports() {
        let allocator = PortAllocator::new(
            AddressFamily::V4,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            20100,
            20200,
        );
        let pair = allocator.allocate_pair(None).await.unwrap();
        assert_eq!(pair.rtp_port % 2, 0);
        assert_eq!(pair.rtcp_port, pair.rtp_port + 1);
    }

    #[tokio::test]
    async fn allocate_pair_does_not_reuse_a_port_already_bound() {
        let allocator = PortAllocator::new(
            AddressFamily::V4,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            20300,
            20400,
        );
        let first = allocator.allocate_pair(None).await.unwrap();
        let second = allocator.allocate_pair(None).await.unwrap();
        assert_ne!(first.rtp_port, second.rtp_port);
    }

    #[tokio::test]
    async fn exhausted_range_reports_io_error() {
        let allocator = PortAllocator::new(
            AddressFamily::V4,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            20500,
            20504,
        );
        // Consume every pair in the tiny range.
        let _a = allocator.allocate_pair(None).await.unwrap();
        let _b = allocator.allocate_pair(None).await.unwrap();
        let err = allocator.allocate_pair(None).await.unwrap_err();
        assert_eq!(err.code(), 448);
    }
}
