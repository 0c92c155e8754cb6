use std::fs;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use nix::sys::socket::{recv, MsgFlags};
use vm_memory::ByteValued;
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};

use crate::message::{
    self, put_str, read_obj, DeviceName, DmaMap, MemRegion, MemTblHdr, Message, Opcode,
    VersionInfo, VfCtxReply, VfDevArgs,
};
use crate::monitor::{Monitor, SharedPrio};
use crate::registry::Registry;
use crate::reset;

/// Well-known control-socket path the worker connects to.
pub const UDS_PATH: &str = "/tmp/vdpa_custodian.sock";

const LISTENER_TOKEN: u64 = 0;
const WORKER_TOKEN: u64 = 1;

/// A handler's reply: payload plus descriptors, sent back under the
/// request's opcode and BDF. Descriptors are borrowed from the registry;
/// sending duplicates them, so no ownership moves.
struct Reply {
    payload: Vec<u8>,
    fds: Vec<RawFd>,
}

impl Reply {
    fn empty() -> Self {
        Reply {
            payload: Vec::new(),
            fds: Vec::new(),
        }
    }

    fn with_payload(payload: Vec<u8>) -> Self {
        Reply {
            payload,
            fds: Vec::new(),
        }
    }
}

/// The custodian's single-reactor control server.
///
/// Owns the listener, the (at most one) worker connection and the device
/// registry; drives the monitor thread and the PF reset fallback on
/// worker disconnect.
pub struct Server {
    listener: UnixListener,
    epoll: Epoll,
    registry: Registry,
    prio: SharedPrio,
    monitor: Option<Monitor>,
    worker: Option<UnixStream>,
}

impl Server {
    /// Bind the control socket, replacing any stale one at `path`.
    pub fn bind(path: &Path) -> Result<Self> {
        // A crashed instance leaves the socket file behind.
        let _ = fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind {}", path.display()))?;

        let epoll = Epoll::new().context("Failed to create epoll")?;
        epoll
            .ctl(
                ControlOperation::Add,
                listener.as_raw_fd(),
                EpollEvent::new(
                    EventSet::IN | EventSet::HANG_UP | EventSet::ERROR,
                    LISTENER_TOKEN,
                ),
            )
            .context("Failed to register listener")?;

        info!("Control server listening on {}", path.display());

        Ok(Server {
            listener,
            epoll,
            registry: Registry::default(),
            prio: Arc::new(Mutex::new(Default::default())),
            monitor: None,
            worker: None,
        })
    }

    /// Run the reactor forever.
    pub fn run(&mut self) -> Result<()> {
        let mut events = vec![EpollEvent::default(); 2];
        loop {
            let nev = match self.epoll.wait(-1, &mut events) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("epoll_wait"),
            };

            for ev in &events[..nev] {
                let set = ev.event_set();
                match ev.data() {
                    WORKER_TOKEN if set.intersects(EventSet::HANG_UP | EventSet::ERROR) => {
                        self.worker_disconnected();
                    }
                    WORKER_TOKEN => self.handle_request(),
                    LISTENER_TOKEN if set.intersects(EventSet::HANG_UP | EventSet::ERROR) => {
                        bail!("listener socket failed");
                    }
                    LISTENER_TOKEN => self.accept_worker(),
                    other => warn!("Spurious epoll token {}", other),
                }
            }
        }
    }

    fn accept_worker(&mut self) {
        let conn = match self.listener.accept() {
            Ok((conn, _)) => conn,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                return;
            }
        };

        // One worker at a time; a newcomer replaces a leftover peer.
        if let Some(old) = self.worker.take() {
            warn!("New worker connection replaces the current one");
            self.deregister_worker(&old);
        }

        if let Err(e) = self.epoll.ctl(
            ControlOperation::Add,
            conn.as_raw_fd(),
            EpollEvent::new(
                EventSet::IN | EventSet::HANG_UP | EventSet::ERROR,
                WORKER_TOKEN,
            ),
        ) {
            error!("Failed to register worker connection: {}", e);
            return;
        }

        info!("Worker connected");
        self.worker = Some(conn);
    }

    fn deregister_worker(&self, conn: &UnixStream) {
        if let Err(e) = self.epoll.ctl(
            ControlOperation::Delete,
            conn.as_raw_fd(),
            EpollEvent::default(),
        ) {
            error!("Failed to deregister worker connection: {}", e);
        }
    }

    /// Read and dispatch one request frame off the worker connection.
    ///
    /// Handler errors are logged; the connection stays up. The reply (if
    /// any) reuses the request header's opcode and BDF.
    fn handle_request(&mut self) {
        let Some(worker) = &self.worker else { return };

        let msg = match Message::recv(worker) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                // EOF without a hangup event (half-close); the socket
                // would stay readable forever, so recover now.
                info!("Worker closed the connection");
                self.worker_disconnected();
                return;
            }
            Err(e) => {
                error!("Failed to recv control msg: {:#}", e);
                return;
            }
        };

        let hdr = msg.hdr;
        match self.dispatch(msg) {
            Ok(None) => {}
            Ok(Some(reply)) => {
                if let Some(worker) = &self.worker {
                    if let Err(e) =
                        message::send_msg(worker.as_raw_fd(), &hdr, &reply.payload, &reply.fds)
                    {
                        error!("Failed to send reply: {:#}", e);
                    }
                }
                // reply and its payload drop here on every path.
            }
            Err(e) => error!("Request (opcode {}) failed: {:#}", hdr.opcode, e),
        }
    }

    fn dispatch(&mut self, msg: Message) -> Result<Option<Reply>> {
        use Opcode::*;

        match msg.opcode()? {
            QueryVersion => self.query_version(msg),
            SetPrioChnl => self.set_prio_chnl(msg),
            RemovePrioChnl => self.remove_prio_chnl(msg),
            QueryPfList => self.query_pf_list(msg),
            QueryVfList => self.query_vf_list(msg),
            QueryPfCtx => self.query_pf_ctx(msg),
            QueryVfCtx => self.query_vf_ctx(msg),
            PfStoreCtx => self.pf_store_ctx(msg),
            PfRemoveCtx => self.pf_remove_ctx(msg),
            VfStoreDevargVfioFds => self.vf_store_devarg_vfio_fds(msg),
            VfStoreVhostFd => self.vf_store_vhost_fd(msg),
            VfStoreDmaTbl => self.vf_store_dma_tbl(msg),
            VfRemoveDevargVfioFds => self.vf_remove_devarg_vfio_fds(msg),
            VfRemoveVhostFd => self.vf_remove_vhost_fd(msg),
            VfRemoveDmaTbl => self.vf_remove_dma_tbl(msg),
            GlobalStoreContainer => self.global_store_container(msg),
            GlobalQueryContainer => self.global_query_container(msg),
            GlobalStoreDmaMap => self.global_store_dma_map(msg),
            GlobalRemoveDmaMap => self.global_remove_dma_map(msg),
            GlobalInitFinish => self.global_init_finish(msg),
            op @ (PrioChnlAddVf | PrioChnlRemoveVf) => {
                bail!("{:?} is not a request opcode", op)
            }
        }
    }

    fn query_version(&mut self, _msg: Message) -> Result<Option<Reply>> {
        let mut ver = VersionInfo::default();
        put_str(
            &mut ver.version,
            &format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        );
        put_str(
            &mut ver.time,
            &format!("build epoch {}", env!("BUILD_EPOCH_SECS")),
        );
        info!("Got version query");
        Ok(Some(Reply::with_payload(ver.as_slice().to_vec())))
    }

    fn set_prio_chnl(&mut self, mut msg: Message) -> Result<Option<Reply>> {
        expect_fds(&msg, 1)?;
        let fd = msg.fds.remove(0);
        info!("Set up priority channel");

        let drained = self.prio.lock().unwrap().set_chnl(fd);

        if self.monitor.is_none() {
            match Monitor::spawn(self.monitor_snapshot(), self.prio.clone()) {
                Ok(monitor) => self.monitor = Some(monitor),
                Err(e) => error!("Failed to start vhost monitor: {:#}", e),
            }
        }

        drained.map(|()| None)
    }

    fn remove_prio_chnl(&mut self, _msg: Message) -> Result<Option<Reply>> {
        self.prio.lock().unwrap().clear();
        if let Some(monitor) = self.monitor.take() {
            monitor.cancel();
        }
        info!("Removed priority channel");
        Ok(None)
    }

    fn query_pf_list(&mut self, _msg: Message) -> Result<Option<Reply>> {
        let mut payload = Vec::new();
        for pf in self.registry.pfs() {
            payload.extend_from_slice(pf.name.as_slice());
        }
        info!(
            "Got pf list query and reply with {} pf",
            self.registry.nr_pf()
        );
        Ok(Some(Reply::with_payload(payload)))
    }

    fn query_vf_list(&mut self, msg: Message) -> Result<Option<Reply>> {
        let pf_name = DeviceName { bdf: msg.hdr.bdf };
        let Some(pf) = self.registry.pf_mut(&pf_name) else {
            return Ok(Some(Reply::empty()));
        };

        let mut payload = Vec::new();
        let mut nr_vf = 0;
        for vf in pf.vfs_mut() {
            // The stored flag may be stale: peek at the vhost socket to
            // see whether the peer is still there.
            vf.devargs.mem_tbl_in_use = u8::from(match &vf.vhost {
                Some(fd) => vhost_peer_live(fd),
                None => false,
            });
            payload.extend_from_slice(vf.devargs.as_slice());
            nr_vf += 1;
        }

        info!(
            "Got vf list query of pf {} and reply with {} vf",
            pf_name, nr_vf
        );
        Ok(Some(Reply::with_payload(payload)))
    }

    fn query_pf_ctx(&mut self, msg: Message) -> Result<Option<Reply>> {
        let pf_name = DeviceName { bdf: msg.hdr.bdf };
        let Some(pf) = self.registry.pf(&pf_name) else {
            return Ok(Some(Reply::empty()));
        };

        info!("Got pf {} ctx query, replying with group and device fd", pf_name);
        Ok(Some(Reply {
            payload: Vec::new(),
            fds: vec![pf.vfio_group.as_raw_fd(), pf.vfio_device.as_raw_fd()],
        }))
    }

    fn query_vf_ctx(&mut self, msg: Message) -> Result<Option<Reply>> {
        let pf_name = DeviceName { bdf: msg.hdr.bdf };
        // Copy the name out before the payload buffer is reused for the
        // reply.
        let Some(vf_name) = read_obj::<DeviceName>(&msg.payload) else {
            bail!("Wrong msg (sz {}), should be a vf name", msg.payload.len());
        };

        let Some(pf) = self.registry.pf(&pf_name) else {
            return Ok(Some(Reply::empty()));
        };
        let Some(vf) = pf.vf(&vf_name) else {
            return Ok(Some(Reply::empty()));
        };

        let ctx = VfCtxReply {
            vhost_fd_saved: u32::from(vf.vhost.is_some()),
            nregions: vf.mem_table().len() as u32,
        };
        let mut payload = ctx.as_slice().to_vec();
        for region in vf.mem_table() {
            payload.extend_from_slice(region.as_slice());
        }

        info!(
            "Got vf {} ctx query, replying with container, group and device fd",
            vf_name
        );
        Ok(Some(Reply {
            payload,
            fds: vec![
                vf.vfio_container.as_raw_fd(),
                vf.vfio_group.as_raw_fd(),
                vf.vfio_device.as_raw_fd(),
            ],
        }))
    }

    fn pf_store_ctx(&mut self, mut msg: Message) -> Result<Option<Reply>> {
        expect_fds(&msg, 2)?;
        let pf_name = DeviceName { bdf: msg.hdr.bdf };
        let device = msg.fds.pop().expect("two descriptors");
        let group = msg.fds.pop().expect("two descriptors");

        info!("Stored pf {} ctx: group and device fd", pf_name);
        self.registry.insert_pf(pf_name, group, device);
        Ok(None)
    }

    fn pf_remove_ctx(&mut self, msg: Message) -> Result<Option<Reply>> {
        let pf_name = DeviceName { bdf: msg.hdr.bdf };
        // Removing an unknown PF is success; removes are idempotent.
        self.registry.remove_pf(&pf_name);
        Ok(None)
    }

    fn vf_store_devarg_vfio_fds(&mut self, mut msg: Message) -> Result<Option<Reply>> {
        expect_fds(&msg, 3)?;
        expect_payload(&msg, std::mem::size_of::<VfDevArgs>())?;
        let pf_name = DeviceName { bdf: msg.hdr.bdf };
        let devargs: VfDevArgs = read_obj(&msg.payload).expect("size checked");

        let device = msg.fds.pop().expect("three descriptors");
        let group = msg.fds.pop().expect("three descriptors");
        let container = msg.fds.pop().expect("three descriptors");

        info!(
            "Stored vf {}: sock {}, vm_uuid {}",
            devargs.vf_name,
            String::from_utf8_lossy(trim_nul(&devargs.vhost_sock_addr)),
            String::from_utf8_lossy(trim_nul(&devargs.vm_uuid)),
        );
        self.registry
            .insert_vf(&pf_name, devargs, container, group, device)?;
        Ok(None)
    }

    fn vf_store_vhost_fd(&mut self, mut msg: Message) -> Result<Option<Reply>> {
        expect_fds(&msg, 1)?;
        expect_payload(&msg, std::mem::size_of::<DeviceName>())?;
        let pf_name = DeviceName { bdf: msg.hdr.bdf };
        let vf_name: DeviceName = read_obj(&msg.payload).expect("size checked");

        if self.registry.pf(&pf_name).is_none() {
            bail!("pf {} not stored", pf_name);
        }
        if let Some(vf) = self.registry.vf_mut(&pf_name, &vf_name) {
            vf.set_vhost(msg.fds.remove(0));
            info!("Stored vf {} vhost fd", vf_name);
        }
        Ok(None)
    }

    fn vf_store_dma_tbl(&mut self, msg: Message) -> Result<Option<Reply>> {
        let name_len = std::mem::size_of::<DeviceName>();
        let hdr_len = std::mem::size_of::<MemTblHdr>();
        if msg.payload.len() < name_len + hdr_len {
            bail!(
                "Wrong msg (sz {}), should be at least {}",
                msg.payload.len(),
                name_len + hdr_len
            );
        }

        let pf_name = DeviceName { bdf: msg.hdr.bdf };
        let vf_name: DeviceName = read_obj(&msg.payload).expect("size checked");
        if self.registry.pf(&pf_name).is_none() {
            bail!("pf {} not stored", pf_name);
        }

        let tbl: MemTblHdr = read_obj(&msg.payload[name_len..]).expect("size checked");
        let nregions = tbl.nregions as usize;
        let region_bytes = msg.payload.len() - name_len - hdr_len;
        if region_bytes != nregions * std::mem::size_of::<MemRegion>() {
            bail!(
                "Wrong mem table size ({} instead of {})",
                region_bytes,
                nregions * std::mem::size_of::<MemRegion>()
            );
        }

        let mut regions = Vec::with_capacity(nregions);
        let mut off = name_len + hdr_len;
        for _ in 0..nregions {
            let region: MemRegion = read_obj(&msg.payload[off..]).expect("size checked");
            regions.push(region);
            off += std::mem::size_of::<MemRegion>();
        }

        if let Some(vf) = self.registry.vf_mut(&pf_name, &vf_name) {
            vf.store_mem_table(&regions)?;
            info!("Stored vf {} DMA memory table:", vf_name);
            for (i, region) in regions.iter().enumerate() {
                info!(
                    "Region {}: GPA {:#x} QEMU_VA {:#x} Size {:#x}",
                    i, region.guest_phys_addr, region.guest_user_addr, region.size
                );
            }
        }
        Ok(None)
    }

    fn vf_remove_devarg_vfio_fds(&mut self, msg: Message) -> Result<Option<Reply>> {
        expect_payload(&msg, std::mem::size_of::<DeviceName>())?;
        let pf_name = DeviceName { bdf: msg.hdr.bdf };
        let vf_name: DeviceName = read_obj(&msg.payload).expect("size checked");

        if self.registry.remove_vf(&pf_name, &vf_name) {
            info!("Removed vf {} ctx", vf_name);
        }
        Ok(None)
    }

    fn vf_remove_vhost_fd(&mut self, msg: Message) -> Result<Option<Reply>> {
        expect_payload(&msg, std::mem::size_of::<DeviceName>())?;
        let pf_name = DeviceName { bdf: msg.hdr.bdf };
        let vf_name: DeviceName = read_obj(&msg.payload).expect("size checked");

        if let Some(vf) = self.registry.vf_mut(&pf_name, &vf_name) {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            info!(
                "Closing vhost fd of vf {} at {}.{:06}",
                vf_name,
                now.as_secs(),
                now.subsec_micros()
            );
            vf.clear_vhost();
        }
        Ok(None)
    }

    fn vf_remove_dma_tbl(&mut self, msg: Message) -> Result<Option<Reply>> {
        expect_payload(&msg, std::mem::size_of::<DeviceName>())?;
        let pf_name = DeviceName { bdf: msg.hdr.bdf };
        let vf_name: DeviceName = read_obj(&msg.payload).expect("size checked");

        if let Some(vf) = self.registry.vf_mut(&pf_name, &vf_name) {
            vf.clear_mem_table();
            info!("Removed vf {} DMA memory table", vf_name);
        }
        Ok(None)
    }

    fn global_store_container(&mut self, mut msg: Message) -> Result<Option<Reply>> {
        expect_fds(&msg, 1)?;
        self.registry.set_global_container(msg.fds.remove(0));
        info!("Saved global container fd");
        Ok(None)
    }

    fn global_query_container(&mut self, _msg: Message) -> Result<Option<Reply>> {
        let fds = match self.registry.global_container() {
            Some(fd) => {
                info!("Got query and replied with global container fd");
                vec![fd.as_raw_fd()]
            }
            None => Vec::new(),
        };
        Ok(Some(Reply {
            payload: Vec::new(),
            fds,
        }))
    }

    fn global_store_dma_map(&mut self, msg: Message) -> Result<Option<Reply>> {
        expect_payload(&msg, std::mem::size_of::<DmaMap>())?;
        let map: DmaMap = read_obj(&msg.payload).expect("size checked");
        self.registry.store_dma_map(map);
        info!(
            "Saved global dma map: iova({:#x}) len({:#x})",
            map.iova, map.size
        );
        Ok(None)
    }

    fn global_remove_dma_map(&mut self, msg: Message) -> Result<Option<Reply>> {
        expect_payload(&msg, std::mem::size_of::<DmaMap>())?;
        let map: DmaMap = read_obj(&msg.payload).expect("size checked");
        self.registry.remove_dma_map(map.iova);
        info!(
            "Removed global dma map: iova({:#x}) len({:#x})",
            map.iova, map.size
        );
        Ok(None)
    }

    fn global_init_finish(&mut self, _msg: Message) -> Result<Option<Reply>> {
        info!(
            "Worker init finish (custodian {})",
            env!("CARGO_PKG_VERSION")
        );
        Ok(None)
    }

    /// Worker went away: enter the recovery path.
    ///
    /// Order matters: sentinel up, priority channel down, monitor
    /// generation restarted, PFs reset, aperture flushed, sentinel gone.
    fn worker_disconnected(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.deregister_worker(&worker);
        }
        info!("Worker disconnected, starting recovery");

        let sentinel = reset::create_sentinel();
        if let Err(e) = &sentinel {
            error!("{:#}", e);
        }

        // The supervising agent is gone with the worker; drop its channel
        // but keep anything already queued for the next one.
        self.prio.lock().unwrap().close_chnl();

        if let Some(monitor) = self.monitor.take() {
            monitor.cancel();
        }
        match Monitor::spawn(self.monitor_snapshot(), self.prio.clone()) {
            Ok(monitor) => self.monitor = Some(monitor),
            Err(e) => error!("Failed to start vhost monitor: {:#}", e),
        }

        if sentinel.is_ok() {
            reset::reset_all_pfs(&mut self.registry);
            reset::remove_sentinel();
        }
    }

    /// Duplicate every stored vhost descriptor for a monitor generation.
    fn monitor_snapshot(&self) -> Vec<(DeviceName, OwnedFd)> {
        let mut watch = Vec::new();
        for pf in self.registry.pfs() {
            for vf in pf.vfs() {
                let Some(vhost) = &vf.vhost else { continue };
                match vhost.try_clone() {
                    Ok(dup) => watch.push((vf.name(), dup)),
                    Err(e) => error!("Failed to dup vhost fd of vf {}: {}", vf.name(), e),
                }
            }
        }
        watch
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.cancel();
        }
    }
}

fn expect_fds(msg: &Message, want: usize) -> Result<()> {
    if msg.fds.len() != want {
        bail!(
            "Wrong msg (nr_fds {}), should be nr_fds {}",
            msg.fds.len(),
            want
        );
    }
    Ok(())
}

fn expect_payload(msg: &Message, want: usize) -> Result<()> {
    if msg.payload.len() != want {
        bail!(
            "Wrong msg (sz {}), should be sz {}",
            msg.payload.len(),
            want
        );
    }
    Ok(())
}

fn trim_nul(buf: &[u8]) -> &[u8] {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..end]
}

/// Peek at a vhost socket without consuming anything: zero bytes means
/// the peer hung up; data, would-block or any error counts as live.
fn vhost_peer_live(fd: &OwnedFd) -> bool {
    // SAFETY: plain F_SETFL on a descriptor the registry owns.
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK) };
    if ret < 0 {
        error!(
            "Failed to set vhost fd non-blocking: {}",
            std::io::Error::last_os_error()
        );
        return true;
    }
    let mut byte = [0u8; 1];
    !matches!(recv(fd.as_raw_fd(), &mut byte, MsgFlags::MSG_PEEK), Ok(0))
}
