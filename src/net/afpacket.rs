//! AF_PACKET reference device (Linux).
//!
//! A raw packet socket per port, software timestamps, no rate limiter:
//! Auto pacing on this device always degrades to TSC. The 1588 register
//! is modelled as the system realtime clock plus the disciplined offset,
//! which is what a kernel path without hardware timesync can offer.

use std::{
    collections::VecDeque,
    io,
    mem,
    net::Ipv4Addr,
    os::fd::AsRawFd,
    sync::atomic::{AtomicI64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use codec::net::MacAddr;
use parking_lot::Mutex;
use service::Error;
use socket2::{Domain, Protocol, Socket, Type};

use super::{FlowFilter, Packet, PortDevice, RxQueue, loopback};

const ETH_P_ALL: u16 = 0x0003;

/// A port bound to a network interface through an AF_PACKET socket.
pub struct PacketSocket {
    name: String,
    ifindex: i32,
    mac: MacAddr,
    ip: Ipv4Addr,
    socket: Socket,
    time_offset: AtomicI64,
    tx_timestamp: Mutex<Option<u64>>,
}

fn sockaddr_ll(ifindex: i32) -> (libc::sockaddr_ll, libc::socklen_t) {
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = (ETH_P_ALL).to_be();
    addr.sll_ifindex = ifindex;
    (addr, mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t)
}

impl PacketSocket {
    /// Open `interface` (by index) for raw frame I/O.
    pub fn open(
        name: &str,
        ifindex: i32,
        mac: MacAddr,
        ip: Ipv4Addr,
    ) -> Result<Self, io::Error> {
        let socket = Socket::new(
            Domain::PACKET,
            Type::RAW,
            Some(Protocol::from(i32::from(ETH_P_ALL.to_be()))),
        )?;
        socket.set_nonblocking(true)?;

        let (addr, len) = sockaddr_ll(ifindex);
        let ret = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            name: name.to_string(),
            ifindex,
            mac,
            ip,
            socket,
            time_offset: AtomicI64::new(0),
            tx_timestamp: Mutex::new(None),
        })
    }
}

impl PortDevice for PacketSocket {
    fn name(&self) -> &str {
        &self.name
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    fn tx_burst(&self, _queue: usize, pkts: &mut VecDeque<Packet>) -> usize {
        let (addr, len) = sockaddr_ll(self.ifindex);
        let mut sent = 0;

        while let Some(pkt) = pkts.front() {
            let frame = pkt.contiguous();
            let ret = unsafe {
                libc::sendto(
                    self.socket.as_raw_fd(),
                    frame.as_ptr() as *const libc::c_void,
                    frame.len(),
                    libc::MSG_DONTWAIT,
                    &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                    len,
                )
            };

            if ret < 0 {
                // descriptor ring full, leave the rest queued
                break;
            }

            // software timestamp for PTP event frames
            if frame.len() >= 14 {
                let ether_type = u16::from_be_bytes([frame[12], frame[13]]);
                if ether_type == codec::net::ETHER_TYPE_PTP {
                    *self.tx_timestamp.lock() = Some(self.read_time());
                }
            }

            pkts.pop_front();
            sent += 1;
        }

        sent
    }

    fn open_rx_queue(&self, flow: &FlowFilter) -> Result<Box<dyn RxQueue>, Error> {
        // one socket per queue; software classification reuses the
        // loopback matcher
        let socket = Socket::new(
            Domain::PACKET,
            Type::RAW,
            Some(Protocol::from(i32::from(ETH_P_ALL.to_be()))),
        )
        .map_err(|_| Error::HardwareError)?;
        socket
            .set_nonblocking(true)
            .map_err(|_| Error::HardwareError)?;

        let (addr, len) = sockaddr_ll(self.ifindex);
        let ret = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                len,
            )
        };
        if ret < 0 {
            return Err(Error::HardwareError);
        }

        Ok(Box::new(PacketRxQueue {
            socket,
            filter: *flow,
            time_offset: self.time_offset.load(Ordering::Acquire),
        }))
    }

    fn read_time(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i128)
            .unwrap_or(0);
        (now + self.time_offset.load(Ordering::Acquire) as i128) as u64
    }

    fn adjust_time(&self, delta_ns: i64) {
        self.time_offset.fetch_add(delta_ns, Ordering::AcqRel);
    }

    fn tx_timestamp(&self, _queue: usize) -> Option<u64> {
        self.tx_timestamp.lock().take()
    }
}

struct PacketRxQueue {
    socket: Socket,
    filter: FlowFilter,
    time_offset: i64,
}

impl RxQueue for PacketRxQueue {
    fn rx_burst(&mut self, pkts: &mut Vec<Packet>, max: usize) -> usize {
        let mut buf = [0u8; 2048];
        let mut got = 0;

        while got < max {
            let ret = unsafe {
                libc::recv(
                    self.socket.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if ret <= 0 {
                break;
            }

            let frame = &buf[..ret as usize];
            if !loopback::frame_matches(&self.filter, frame) {
                continue;
            }

            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as i128)
                .unwrap_or(0);

            let mut pkt = Packet::new(BytesMut::from(frame));
            pkt.rx_timestamp = (now + self.time_offset as i128) as u64;
            pkts.push(pkt);
            got += 1;
        }

        got
    }
}
