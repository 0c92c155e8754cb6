use std::fmt;
use std::io::{IoSlice, Read};
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::str;

use anyhow::{bail, Context, Result};
use log::warn;
use nix::errno::Errno;
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use vm_memory::ByteValued;

/// Width of a fixed-size device name (PCI `bus:device.function` plus padding).
pub const BDF_SIZE: usize = 16;
/// Width of a stored vhost-user socket path (the unix `sun_path` bound).
pub const VHOST_SOCK_PATH_SIZE: usize = 108;
/// Width of a stored VM UUID string.
pub const UUID_SIZE: usize = 40;
/// Width of the version string in a [`VersionInfo`] reply.
pub const VERSION_SIZE: usize = 64;
/// Width of the build-timestamp string in a [`VersionInfo`] reply.
pub const TIME_SIZE: usize = 32;
/// Maximum number of DMA memory regions a VF record can hold.
pub const MAX_MEM_REGIONS: usize = 128;
/// Maximum number of descriptors that ride on a single frame.
pub const MAX_FDS: usize = 3;
/// Upper bound on a frame payload; anything larger is malformed.
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Control-protocol message types.
///
/// The first twenty are worker-to-custodian requests; the `PrioChnl*`
/// values travel the other way, over the priority channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    /// Report daemon version and build time.
    QueryVersion = 0,
    /// Install the priority notification channel.
    SetPrioChnl,
    /// Tear down the priority notification channel.
    RemovePrioChnl,
    /// List stored PF names.
    QueryPfList,
    /// List a PF's VFs with their device arguments.
    QueryVfList,
    /// Fetch a PF's VFIO descriptors.
    QueryPfCtx,
    /// Fetch a VF's VFIO descriptors and DMA memory table.
    QueryVfCtx,
    /// Store a PF context (group + device descriptors).
    PfStoreCtx,
    /// Remove a PF context and everything under it.
    PfRemoveCtx,
    /// Store a VF's device arguments and VFIO descriptors.
    VfStoreDevargVfioFds,
    /// Store (or replace) a VF's vhost descriptor.
    VfStoreVhostFd,
    /// Store a VF's DMA memory table.
    VfStoreDmaTbl,
    /// Remove a VF, closing its descriptors.
    VfRemoveDevargVfioFds,
    /// Close and forget a VF's vhost descriptor.
    VfRemoveVhostFd,
    /// Clear a VF's DMA memory table.
    VfRemoveDmaTbl,
    /// Store the global VFIO container descriptor.
    GlobalStoreContainer,
    /// Fetch the global VFIO container descriptor.
    GlobalQueryContainer,
    /// Record a global DMA aperture mapping.
    GlobalStoreDmaMap,
    /// Forget a global DMA aperture mapping.
    GlobalRemoveDmaMap,
    /// Worker finished global init; log marker only.
    GlobalInitFinish,
    /// Priority channel: a VF's vhost peer went quiet.
    PrioChnlAddVf,
    /// Priority channel: a VF no longer needs attention.
    PrioChnlRemoveVf,
}

impl TryFrom<u32> for Opcode {
    type Error = anyhow::Error;

    fn try_from(v: u32) -> Result<Self> {
        use Opcode::*;
        let op = match v {
            0 => QueryVersion,
            1 => SetPrioChnl,
            2 => RemovePrioChnl,
            3 => QueryPfList,
            4 => QueryVfList,
            5 => QueryPfCtx,
            6 => QueryVfCtx,
            7 => PfStoreCtx,
            8 => PfRemoveCtx,
            9 => VfStoreDevargVfioFds,
            10 => VfStoreVhostFd,
            11 => VfStoreDmaTbl,
            12 => VfRemoveDevargVfioFds,
            13 => VfRemoveVhostFd,
            14 => VfRemoveDmaTbl,
            15 => GlobalStoreContainer,
            16 => GlobalQueryContainer,
            17 => GlobalStoreDmaMap,
            18 => GlobalRemoveDmaMap,
            19 => GlobalInitFinish,
            20 => PrioChnlAddVf,
            21 => PrioChnlRemoveVf,
            _ => bail!("unknown opcode {}", v),
        };
        Ok(op)
    }
}

/// Fixed-size frame header: opcode, target device and payload length.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct MsgHdr {
    /// Message type; one of [`Opcode`] on the wire.
    pub opcode: u32,
    /// Target device BDF, nul padded. Empty when the opcode has no target.
    pub bdf: [u8; BDF_SIZE],
    /// Payload length in bytes.
    pub size: u32,
}

// SAFETY: plain old data, no padding between fields (u32 / [u8; 16] / u32).
unsafe impl ByteValued for MsgHdr {}

/// Fixed-width device identity (PCI BDF string, nul padded).
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceName {
    /// The BDF bytes.
    pub bdf: [u8; BDF_SIZE],
}

// SAFETY: a byte array has no invalid representations.
unsafe impl ByteValued for DeviceName {}

impl DeviceName {
    /// Build a name from a BDF string, truncating to the fixed width.
    pub fn new(bdf: &str) -> Self {
        let mut name = Self::default();
        let len = bdf.len().min(BDF_SIZE - 1);
        name.bdf[..len].copy_from_slice(&bdf.as_bytes()[..len]);
        name
    }

    /// The BDF as a string slice, up to the first nul.
    pub fn as_str(&self) -> &str {
        let end = self.bdf.iter().position(|&b| b == 0).unwrap_or(BDF_SIZE);
        str::from_utf8(&self.bdf[..end]).unwrap_or("")
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceName({})", self.as_str())
    }
}

/// Per-VF device arguments as stored and echoed back to the worker.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct VfDevArgs {
    /// The VF's own BDF.
    pub vf_name: DeviceName,
    /// Path of the vhost-user socket serving this VF.
    pub vhost_sock_addr: [u8; VHOST_SOCK_PATH_SIZE],
    /// UUID of the VM the VF is attached to.
    pub vm_uuid: [u8; UUID_SIZE],
    /// Non-zero while the VF's DMA table or vhost channel is live.
    pub mem_tbl_in_use: u8,
}

// SAFETY: plain old data with align 1; every bit pattern is valid.
unsafe impl ByteValued for VfDevArgs {}

impl Default for VfDevArgs {
    fn default() -> Self {
        Self {
            vf_name: DeviceName::default(),
            vhost_sock_addr: [0; VHOST_SOCK_PATH_SIZE],
            vm_uuid: [0; UUID_SIZE],
            mem_tbl_in_use: 0,
        }
    }
}

/// One guest DMA memory region.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct MemRegion {
    /// Guest physical address.
    pub guest_phys_addr: u64,
    /// Userspace (QEMU) virtual address.
    pub guest_user_addr: u64,
    /// Region length in bytes.
    pub size: u64,
}

// SAFETY: three u64s, no padding.
unsafe impl ByteValued for MemRegion {}

/// Header of an inline DMA memory table (followed by `nregions` regions).
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct MemTblHdr {
    /// Number of regions that follow.
    pub nregions: u32,
    _pad: u32,
}

// SAFETY: plain old data, explicit padding field.
unsafe impl ByteValued for MemTblHdr {}

impl MemTblHdr {
    /// Header for a table of `nregions` regions.
    pub fn new(nregions: u32) -> Self {
        Self { nregions, _pad: 0 }
    }
}

/// Leading record of a QUERY_VF_CTX reply (regions follow inline).
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct VfCtxReply {
    /// Non-zero when the custodian holds a vhost descriptor for the VF.
    pub vhost_fd_saved: u32,
    /// Number of regions that follow.
    pub nregions: u32,
}

// SAFETY: two u32s, no padding.
unsafe impl ByteValued for VfCtxReply {}

/// A global DMA aperture entry.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct DmaMap {
    /// IO virtual address; unique within the aperture table.
    pub iova: u64,
    /// Mapping length in bytes.
    pub size: u64,
}

// SAFETY: two u64s, no padding.
unsafe impl ByteValued for DmaMap {}

/// Reply payload of QUERY_VERSION.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct VersionInfo {
    /// Daemon name and version, nul padded.
    pub version: [u8; VERSION_SIZE],
    /// Build timestamp, nul padded.
    pub time: [u8; TIME_SIZE],
}

// SAFETY: byte arrays only.
unsafe impl ByteValued for VersionInfo {}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            version: [0; VERSION_SIZE],
            time: [0; TIME_SIZE],
        }
    }
}

/// Copy a fixed-size record out of a payload buffer.
///
/// The copy tolerates any source alignment, which `ByteValued::from_slice`
/// does not.
pub fn read_obj<T: ByteValued + Default>(buf: &[u8]) -> Option<T> {
    if buf.len() < size_of::<T>() {
        return None;
    }
    let mut obj = T::default();
    obj.as_mut_slice().copy_from_slice(&buf[..size_of::<T>()]);
    Some(obj)
}

/// Copy a nul-padded string into a fixed-width buffer, truncating if needed.
pub fn put_str(dst: &mut [u8], src: &str) {
    let len = src.len().min(dst.len() - 1);
    dst[..len].copy_from_slice(&src.as_bytes()[..len]);
}

/// A received control frame: header, payload bytes, and any descriptors
/// that rode along as `SCM_RIGHTS`.
pub struct Message {
    /// The frame header.
    pub hdr: MsgHdr,
    /// Payload bytes (`hdr.size` of them).
    pub payload: Vec<u8>,
    /// Descriptors received with the frame. The custodian owns these copies.
    pub fds: Vec<OwnedFd>,
}

impl Message {
    /// Decode the header's opcode, rejecting unknown values.
    pub fn opcode(&self) -> Result<Opcode> {
        Opcode::try_from(self.hdr.opcode)
    }

    /// Receive one frame from the worker connection.
    ///
    /// Returns `Ok(None)` on clean EOF, or when the stream can no longer
    /// be framed (a partial header); the caller treats both as a
    /// disconnect. A frame rejected for carrying too much is drained off
    /// the stream before the error returns, so the next `recv` starts at
    /// a fresh header and the peer is retained.
    ///
    /// The header and its descriptors arrive in a single `recvmsg`; the
    /// payload is read off the stream afterwards.
    pub fn recv(sock: &UnixStream) -> Result<Option<Message>> {
        let mut hdr = MsgHdr::default();
        let mut fds = Vec::new();

        let mut iov = libc::iovec {
            iov_base: hdr.as_mut_slice().as_mut_ptr() as *mut libc::c_void,
            iov_len: size_of::<MsgHdr>(),
        };
        // Room for up to MAX_FDS descriptors plus the cmsg header.
        let mut cmsg_buf = [0u8; 64];
        // SAFETY: zeroed msghdr is valid; pointers stay alive across the call.
        let (n, flags) = unsafe {
            let mut msg: libc::msghdr = std::mem::zeroed();
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = cmsg_buf.len() as _;

            let n = libc::recvmsg(sock.as_raw_fd(), &mut msg, 0);
            if n > 0 {
                collect_fds(&msg, &mut fds);
            }
            (n, msg.msg_flags)
        };

        if n < 0 {
            return Err(std::io::Error::last_os_error()).context("recvmsg");
        }
        if n == 0 {
            return Ok(None);
        }
        if (n as usize) < size_of::<MsgHdr>() {
            // Without a full header the payload length is unknown and
            // re-framing is impossible.
            warn!(
                "short header ({} of {} bytes), dropping connection",
                n,
                size_of::<MsgHdr>()
            );
            return Ok(None);
        }

        let size = hdr.size as usize;
        if flags & libc::MSG_CTRUNC != 0 {
            drain_payload(sock, size)?;
            bail!("control message truncated");
        }
        if fds.len() > MAX_FDS {
            drain_payload(sock, size)?;
            bail!("too many descriptors: {}", fds.len());
        }
        if size > MAX_PAYLOAD {
            drain_payload(sock, size)?;
            bail!("payload of {} bytes exceeds limit", size);
        }

        let mut payload = vec![0u8; size];
        if size > 0 {
            let mut reader = sock;
            reader
                .read_exact(&mut payload)
                .context("Failed to read frame payload")?;
        }

        Ok(Some(Message {
            hdr,
            payload,
            fds,
        }))
    }
}

/// Read and discard a rejected frame's declared payload so the stream
/// stays framed for the request behind it.
fn drain_payload(sock: &UnixStream, size: usize) -> Result<()> {
    let mut scratch = [0u8; 4096];
    let mut reader = sock;
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(scratch.len());
        reader
            .read_exact(&mut scratch[..want])
            .context("Failed to drain rejected payload")?;
        remaining -= want;
    }
    Ok(())
}

/// Walk the control messages of a received `msghdr`, taking ownership of
/// every descriptor found.
///
/// # Safety
///
/// `msg` must come from a successful `recvmsg` on `cmsg_buf` still in scope.
unsafe fn collect_fds(msg: &libc::msghdr, fds: &mut Vec<OwnedFd>) {
    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
            let data = libc::CMSG_DATA(cmsg) as *const RawFd;
            let nfds = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                / size_of::<RawFd>();
            for i in 0..nfds {
                fds.push(OwnedFd::from_raw_fd(*data.add(i)));
            }
        }
        cmsg = libc::CMSG_NXTHDR(msg, cmsg);
    }
}

/// Send one frame: header (with descriptors attached) then payload.
///
/// `hdr.size` is overwritten with the payload length before sending.
/// Descriptor passing duplicates; the caller keeps ownership of `fds`.
pub fn send_msg(sock: RawFd, hdr: &MsgHdr, payload: &[u8], fds: &[RawFd]) -> Result<()> {
    let mut hdr = *hdr;
    hdr.size = payload.len() as u32;

    let iov = [IoSlice::new(hdr.as_slice())];
    let cmsg = [ControlMessage::ScmRights(fds)];
    let cmsgs = if fds.is_empty() { &cmsg[..0] } else { &cmsg[..] };

    let sent = sendmsg::<()>(sock, &iov, cmsgs, MsgFlags::empty(), None).context("sendmsg")?;
    if sent != size_of::<MsgHdr>() {
        bail!("short header send: {} of {} bytes", sent, size_of::<MsgHdr>());
    }

    write_all(sock, payload)
}

fn write_all(fd: RawFd, mut buf: &[u8]) -> Result<()> {
    use std::os::fd::BorrowedFd;

    while !buf.is_empty() {
        // SAFETY: fd is open for the duration of the call.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match nix::unistd::write(borrowed, buf) {
            Ok(0) => bail!("connection closed mid-payload"),
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("write payload"),
        }
    }
    Ok(())
}
