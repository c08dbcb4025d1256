//! NFLOG capture channel.
//!
//! The kernel side is an iptables rule that copies ICMP
//! fragmentation-needed packets into an NFLOG group. This module speaks
//! the nfnetlink_log protocol directly over a `NETLINK_NETFILTER`
//! socket: bind the protocol family, bind the group, ask for full
//! packet copies, then drain packet notifications as they arrive.
//!
//! Netlink headers and attributes use host byte order; the few
//! big-endian fields are called out where they are written.

use std::collections::VecDeque;
use std::io;
use std::mem::{self, MaybeUninit};
use std::os::fd::{AsRawFd, RawFd};

use tokio::io::unix::AsyncFd;

const NFNL_SUBSYS_ULOG: u16 = 4;
const NFULNL_MSG_PACKET: u16 = 0;
const NFULNL_MSG_CONFIG: u16 = 1;
const NLMSG_ERROR: u16 = 2;

const NFULA_PAYLOAD: u16 = 9;
const NFULA_CFG_CMD: u16 = 1;
const NFULA_CFG_MODE: u16 = 2;

const NFULNL_CFG_CMD_BIND: u8 = 1;
const NFULNL_CFG_CMD_PF_BIND: u8 = 3;
const NFULNL_CFG_CMD_PF_UNBIND: u8 = 4;

const NFULNL_COPY_PACKET: u8 = 2;
const COPY_RANGE: u32 = 0xffff;

const NFNETLINK_V0: u8 = 0;

const NLMSG_HDR_LEN: usize = 16;
const NFGENMSG_LEN: usize = 4;
const NLA_HDR_LEN: usize = 4;

// Captures arrive in bursts when a path MTU collapses; a large kernel
// buffer rides them out.
const SOCKET_BUFSIZE: libc::c_int = 2 * 1024 * 1024;
const RECV_BUFSIZE: usize = 64 * 1024;

const CONFIG_ACK_TIMEOUT_MS: libc::c_int = 1000;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to open netlink socket: {0}")]
    Open(#[source] io::Error),
    #[error("failed to configure NFLOG group {0}: {1}")]
    Configure(u16, #[source] io::Error),
    #[error("capture read failed: {0}")]
    Read(#[source] io::Error),
}

struct NetlinkFd {
    fd: RawFd,
}

impl AsRawFd for NetlinkFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for NetlinkFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// A bound NFLOG group delivering raw packet payloads.
pub struct NflogSocket {
    fd: AsyncFd<NetlinkFd>,
    // One datagram can carry several packet messages; extras queue here.
    queue: VecDeque<Vec<u8>>,
    buf: Vec<u8>,
}

impl NflogSocket {
    /// Opens the netlink channel and binds `group` with full packet
    /// copy mode. Requires `CAP_NET_ADMIN`.
    pub fn open(group: u16) -> Result<Self, CaptureError> {
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                libc::NETLINK_NETFILTER,
            )
        };
        if raw < 0 {
            return Err(CaptureError::Open(io::Error::last_os_error()));
        }
        let fd = NetlinkFd { fd: raw };

        // Zeroed nl_pid lets the kernel pick our port id.
        let mut addr: libc::sockaddr_nl = unsafe { MaybeUninit::zeroed().assume_init() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let rc = unsafe {
            libc::bind(
                fd.fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(CaptureError::Open(io::Error::last_os_error()));
        }

        let rc = unsafe {
            libc::setsockopt(
                fd.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &SOCKET_BUFSIZE as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(CaptureError::Open(io::Error::last_os_error()));
        }

        // Rebinding the family clears any stale binding left behind by
        // a previous instance.
        let mut seq = 1u32;
        for (family, res_id, attrs) in [
            (
                libc::AF_INET as u8,
                0u16,
                vec![(NFULA_CFG_CMD, vec![NFULNL_CFG_CMD_PF_UNBIND])],
            ),
            (
                libc::AF_INET as u8,
                0u16,
                vec![(NFULA_CFG_CMD, vec![NFULNL_CFG_CMD_PF_BIND])],
            ),
            (
                libc::AF_UNSPEC as u8,
                group,
                vec![(NFULA_CFG_CMD, vec![NFULNL_CFG_CMD_BIND])],
            ),
            (
                libc::AF_UNSPEC as u8,
                group,
                vec![(NFULA_CFG_MODE, copy_mode_attr())],
            ),
        ] {
            let msg = config_request(seq, family, res_id, &attrs);
            transact(fd.fd, &msg, seq).map_err(|e| CaptureError::Configure(group, e))?;
            seq += 1;
        }

        let fd = AsyncFd::new(fd).map_err(CaptureError::Open)?;
        Ok(Self {
            fd,
            queue: VecDeque::new(),
            buf: vec![0u8; RECV_BUFSIZE],
        })
    }

    /// Next captured payload, the bytes of one IPv4 packet starting at
    /// its outer header.
    pub async fn next_packet(&mut self) -> Result<Vec<u8>, CaptureError> {
        let Self { fd, queue, buf } = self;
        loop {
            if let Some(payload) = queue.pop_front() {
                return Ok(payload);
            }
            let mut guard = fd.readable().await.map_err(CaptureError::Read)?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::recv(
                        inner.get_ref().fd,
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                    )
                };
                if n < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(n as usize)
            }) {
                Ok(Ok(n)) => parse_datagram(&buf[..n], queue),
                // An overrun kernel buffer surfaces as ENOBUFS; the
                // captures it covered are gone, keep reading.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                    tracing::warn!("NFLOG receive buffer overran, captures lost");
                }
                Ok(Err(e)) => return Err(CaptureError::Read(e)),
                Err(_would_block) => {}
            }
        }
    }
}

/// One nfnetlink_log config request: nlmsghdr, nfgenmsg, then the given
/// attributes, each padded to 4 bytes.
fn config_request(seq: u32, family: u8, res_id: u16, attrs: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let msg_type: u16 = (NFNL_SUBSYS_ULOG << 8) | NFULNL_MSG_CONFIG;
    let flags = (libc::NLM_F_REQUEST | libc::NLM_F_ACK) as u16;

    let mut buf = vec![0u8; NLMSG_HDR_LEN];
    buf.push(family);
    buf.push(NFNETLINK_V0);
    // res_id is the one big-endian field in nfgenmsg.
    buf.extend_from_slice(&res_id.to_be_bytes());
    for (ty, data) in attrs {
        let len = (NLA_HDR_LEN + data.len()) as u16;
        buf.extend_from_slice(&len.to_ne_bytes());
        buf.extend_from_slice(&ty.to_ne_bytes());
        buf.extend_from_slice(data);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
    }
    let total = buf.len() as u32;
    buf[0..4].copy_from_slice(&total.to_ne_bytes());
    buf[4..6].copy_from_slice(&msg_type.to_ne_bytes());
    buf[6..8].copy_from_slice(&flags.to_ne_bytes());
    buf[8..12].copy_from_slice(&seq.to_ne_bytes());
    // nlmsg_pid stays zero for kernel-directed requests.
    buf
}

// nfulnl_msg_config_mode: be32 copy_range, u8 copy_mode, u8 pad.
fn copy_mode_attr() -> Vec<u8> {
    let mut data = Vec::with_capacity(6);
    data.extend_from_slice(&COPY_RANGE.to_be_bytes());
    data.push(NFULNL_COPY_PACKET);
    data.push(0);
    data
}

/// Sends one config request and waits for its ack.
fn transact(fd: RawFd, msg: &[u8], seq: u32) -> io::Result<()> {
    let n = unsafe { libc::send(fd, msg.as_ptr() as *const libc::c_void, msg.len(), 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let mut buf = [0u8; 4096];
    loop {
        let rc = unsafe { libc::poll(&mut pollfd, 1, CONFIG_ACK_TIMEOUT_MS) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        if rc == 0 {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "no netlink ack within deadline",
            ));
        }
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        match find_ack(&buf[..n as usize], seq) {
            Some(0) => return Ok(()),
            Some(code) => return Err(io::Error::from_raw_os_error(code)),
            None => {}
        }
    }
}

/// Scans a datagram for the `NLMSG_ERROR` acking `seq` and returns its
/// (negated) error code.
fn find_ack(data: &[u8], seq: u32) -> Option<i32> {
    let mut offset = 0;
    while let Some(header) = message_at(data, offset) {
        if header.msg_type == NLMSG_ERROR && header.seq == seq {
            let body = &data[offset + NLMSG_HDR_LEN..offset + header.len];
            let code = i32::from_ne_bytes(body.get(0..4)?.try_into().ok()?);
            return Some(-code);
        }
        offset += align4(header.len);
    }
    None
}

struct MsgHeader {
    len: usize,
    msg_type: u16,
    seq: u32,
}

fn message_at(data: &[u8], offset: usize) -> Option<MsgHeader> {
    let header = data.get(offset..offset + NLMSG_HDR_LEN)?;
    let len = u32::from_ne_bytes(header[0..4].try_into().ok()?) as usize;
    if len < NLMSG_HDR_LEN || offset + len > data.len() {
        return None;
    }
    Some(MsgHeader {
        len,
        msg_type: u16::from_ne_bytes(header[4..6].try_into().ok()?),
        seq: u32::from_ne_bytes(header[8..12].try_into().ok()?),
    })
}

/// Extracts every packet payload from one received datagram.
fn parse_datagram(data: &[u8], out: &mut VecDeque<Vec<u8>>) {
    let packet_type = (NFNL_SUBSYS_ULOG << 8) | NFULNL_MSG_PACKET;
    let mut offset = 0;
    while let Some(header) = message_at(data, offset) {
        if header.msg_type == packet_type {
            let body = &data[offset + NLMSG_HDR_LEN..offset + header.len];
            if let Some(payload) = payload_attr(body) {
                out.push_back(payload);
            }
        }
        offset += align4(header.len);
    }
}

/// Walks the attribute list after nfgenmsg for `NFULA_PAYLOAD`.
fn payload_attr(body: &[u8]) -> Option<Vec<u8>> {
    let mut offset = NFGENMSG_LEN;
    while offset + NLA_HDR_LEN <= body.len() {
        let len = u16::from_ne_bytes(body.get(offset..offset + 2)?.try_into().ok()?) as usize;
        let ty = u16::from_ne_bytes(body.get(offset + 2..offset + 4)?.try_into().ok()?) & 0x7fff;
        if len < NLA_HDR_LEN || offset + len > body.len() {
            return None;
        }
        if ty == NFULA_PAYLOAD {
            return Some(body[offset + NLA_HDR_LEN..offset + len].to_vec());
        }
        offset += align4(len);
    }
    None
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}
