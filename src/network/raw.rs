//! Raw `AF_PACKET` socket bound to one Ethernet interface

use nix::libc;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use super::{FrameSink, FrameSource};
use crate::avtp::builder::MIN_FRAME_LEN;
use crate::avtp::ETH_HEADER_LEN;
use crate::constants::DEFAULT_RECV_TIMEOUT;
use crate::error::NetworkError;

/// Receive every protocol on the interface
const ETH_P_ALL: u16 = 0x0003;

/// Link-layer socket for sending and capturing whole Ethernet frames
pub struct RawChannel {
    socket: Socket,
    interface: String,
    ifindex: u32,
    /// Cached interface MAC
    hardware_addr: Option<[u8; 6]>,
}

impl RawChannel {
    /// Open with the default receive timeout
    pub fn open(interface: &str) -> Result<Self, NetworkError> {
        Self::open_with_timeout(interface, DEFAULT_RECV_TIMEOUT)
    }

    /// Create the socket, bind it to `interface`, join promiscuous mode and
    /// set the receive timeout.
    pub fn open_with_timeout(interface: &str, timeout: Duration) -> Result<Self, NetworkError> {
        let open_failed = |source: io::Error| NetworkError::SocketOpenFailed {
            interface: interface.to_string(),
            source,
        };

        let ifindex = nix::net::if_::if_nametoindex(interface)
            .map_err(|_| NetworkError::InterfaceNotFound(interface.to_string()))?;

        let socket = Socket::new(
            Domain::PACKET,
            Type::RAW,
            Some(Protocol::from(ETH_P_ALL.to_be() as i32)),
        )
        .map_err(open_failed)?;

        let address = link_addr(ifindex, None).map_err(open_failed)?;
        socket.bind(&address).map_err(open_failed)?;
        join_promiscuous(socket.as_raw_fd(), ifindex).map_err(open_failed)?;
        socket.set_read_timeout(Some(timeout)).map_err(open_failed)?;

        tracing::info!(
            "Opened raw socket on {} (index {}, timeout {:?})",
            interface,
            ifindex,
            timeout
        );

        Ok(Self {
            socket,
            interface: interface.to_string(),
            ifindex,
            hardware_addr: None,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    /// Block until a frame arrives or the timeout elapses
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, NetworkError> {
        match (&self.socket).read(buf) {
            Ok(n) if n < ETH_HEADER_LEN => Err(NetworkError::ShortRead(n)),
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Err(NetworkError::Timeout)
            }
            Err(e) => Err(NetworkError::ReceiveFailed(e.to_string())),
        }
    }

    /// Transmit one frame to `dest`. Frames below the Ethernet minimum are
    /// zero-padded.
    pub fn send(&self, frame: &[u8], dest: [u8; 6]) -> Result<usize, NetworkError> {
        let address =
            link_addr(self.ifindex, Some(dest)).map_err(|e| NetworkError::SendFailed(e.to_string()))?;

        let mut padded = [0u8; MIN_FRAME_LEN];
        let frame = if frame.len() < MIN_FRAME_LEN {
            padded[..frame.len()].copy_from_slice(frame);
            &padded[..]
        } else {
            frame
        };

        self.socket
            .send_to(frame, &address)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))
    }

    /// MAC address of the bound interface
    pub fn query_hardware_addr(&self) -> Result<[u8; 6], NetworkError> {
        let addrs = nix::ifaddrs::getifaddrs()
            .map_err(|_| NetworkError::InterfaceNotFound(self.interface.clone()))?;
        addrs
            .filter(|ifaddr| ifaddr.interface_name == self.interface)
            .filter_map(|ifaddr| ifaddr.address)
            .find_map(|address| address.as_link_addr().and_then(|link| link.addr()))
            .ok_or_else(|| NetworkError::InterfaceNotFound(self.interface.clone()))
    }

    /// Close the socket
    pub fn close(self) {
        tracing::debug!("Closing raw socket on {}", self.interface);
    }
}

impl AsRawFd for RawChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl FrameSource for RawChannel {
    fn recv_frame(&mut self, buf: &mut [u8]) -> Result<usize, NetworkError> {
        self.recv(buf)
    }
}

impl FrameSink for RawChannel {
    fn send_frame(&mut self, frame: &[u8]) -> Result<usize, NetworkError> {
        if frame.len() < ETH_HEADER_LEN {
            return Err(NetworkError::SendFailed(format!(
                "frame of {} bytes has no Ethernet header",
                frame.len()
            )));
        }
        let mut dest = [0u8; 6];
        dest.copy_from_slice(&frame[..6]);
        self.send(frame, dest)
    }

    fn hardware_addr(&mut self) -> Result<[u8; 6], NetworkError> {
        if let Some(mac) = self.hardware_addr {
            return Ok(mac);
        }
        let mac = self.query_hardware_addr()?;
        self.hardware_addr = Some(mac);
        Ok(mac)
    }
}

/// Build a `sockaddr_ll` for the interface, optionally addressed to `dest`
fn link_addr(ifindex: u32, dest: Option<[u8; 6]>) -> io::Result<SockAddr> {
    // SAFETY: the storage handed to the closure is zeroed and large enough
    // for a sockaddr_ll.
    let ((), address) = unsafe {
        SockAddr::try_init(|storage, len| {
            let sll = storage.cast::<libc::sockaddr_ll>();
            (*sll).sll_family = libc::AF_PACKET as libc::c_ushort;
            (*sll).sll_protocol = ETH_P_ALL.to_be();
            (*sll).sll_ifindex = ifindex as libc::c_int;
            if let Some(mac) = dest {
                let mut addr = [0u8; 8];
                addr[..6].copy_from_slice(&mac);
                (*sll).sll_halen = 6;
                (*sll).sll_addr = addr;
            }
            *len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
            Ok(())
        })?
    };
    Ok(address)
}

fn join_promiscuous(fd: RawFd, ifindex: u32) -> io::Result<()> {
    let request = libc::packet_mreq {
        mr_ifindex: ifindex as libc::c_int,
        mr_type: libc::PACKET_MR_PROMISC as libc::c_ushort,
        mr_alen: 0,
        mr_address: [0; 8],
    };
    // SAFETY: `request` outlives the call and the length matches its type.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_PACKET,
            libc::PACKET_ADD_MEMBERSHIP,
            &request as *const libc::packet_mreq as *const libc::c_void,
            mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
