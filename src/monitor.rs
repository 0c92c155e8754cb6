//! Vhost-liveness monitor: a worker-lifetime background thread that
//! watches every stored vhost descriptor and announces VFs whose peer
//! has gone quiet over the priority channel, deferring the announcement
//! while no channel is installed.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use log::{error, info, warn};
use vm_memory::ByteValued;
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::EventFd;

use crate::message::{self, DeviceName, MsgHdr, Opcode};

/// Priority-channel state: the channel descriptor and the queue of VF
/// names waiting for one. One mutex guards both; the queue is non-empty
/// only while the channel is absent.
#[derive(Default)]
pub struct PrioState {
    chnl: Option<OwnedFd>,
    pending: VecDeque<DeviceName>,
}

/// Shared handle to the priority-channel state.
pub type SharedPrio = Arc<Mutex<PrioState>>;

impl PrioState {
    /// Install the priority channel, then drain the pending queue over it
    /// in FIFO order. Drained names are delivered at most once.
    ///
    /// The channel stays installed even when a drain send fails.
    pub fn set_chnl(&mut self, fd: OwnedFd) -> Result<()> {
        self.chnl = Some(fd);
        while let Some(name) = self.pending.pop_front() {
            self.send_add_vf(&name)
                .with_context(|| format!("Failed to drain deferred event for vf {}", name))?;
        }
        Ok(())
    }

    /// Close and forget the priority channel, leaving the pending queue
    /// alone. Used on worker disconnect.
    pub fn close_chnl(&mut self) {
        self.chnl = None;
    }

    /// Close the channel and drop everything queued. Used on
    /// REMOVE_PRIO_CHNL.
    pub fn clear(&mut self) {
        self.chnl = None;
        self.pending.clear();
    }

    /// Announce a quiet VF now if the channel is up, otherwise queue the
    /// name for the next SET_PRIO_CHNL.
    pub fn notify_or_defer(&mut self, name: &DeviceName) -> Result<()> {
        match self.chnl {
            Some(_) => self.send_add_vf(name),
            None => {
                self.pending.push_back(*name);
                Ok(())
            }
        }
    }

    /// Names queued while no channel was installed, oldest first.
    #[cfg(test)]
    pub fn pending(&self) -> impl Iterator<Item = &DeviceName> {
        self.pending.iter()
    }

    fn send_add_vf(&self, name: &DeviceName) -> Result<()> {
        let chnl = self.chnl.as_ref().context("no priority channel")?;
        let hdr = MsgHdr {
            opcode: Opcode::PrioChnlAddVf as u32,
            ..Default::default()
        };
        message::send_msg(chnl.as_raw_fd(), &hdr, name.as_slice(), &[])
            .with_context(|| format!("Failed to send priority msg for vf {}", name))?;
        info!("Sent priority msg for vf {}", name);
        Ok(())
    }
}

/// Epoll token for the cancellation eventfd; descriptor tokens are their
/// index into the watch list.
const STOP_TOKEN: u64 = u64::MAX;

/// A running monitor generation.
pub struct Monitor {
    thread: JoinHandle<()>,
    stop: EventFd,
}

impl Monitor {
    /// Spawn a monitor generation over a snapshot of vhost descriptors.
    ///
    /// The handles are duplicates of the registry's descriptors: they
    /// share the open file descriptions (so peer hangup is observed
    /// identically) but closing them on thread exit leaves the
    /// registry's copies untouched.
    pub fn spawn(watch: Vec<(DeviceName, OwnedFd)>, prio: SharedPrio) -> Result<Monitor> {
        let stop = EventFd::new(0).context("Failed to create monitor stop eventfd")?;
        let stop_clone = stop.try_clone().context("Failed to clone stop eventfd")?;
        let thread = thread::Builder::new()
            .name("vhost-monitor".into())
            .spawn(move || monitor_thread(watch, prio, stop_clone))
            .context("Failed to spawn monitor thread")?;
        Ok(Monitor { thread, stop })
    }

    /// Cancel the generation and wait for the thread to finish.
    pub fn cancel(self) {
        if let Err(e) = self.stop.write(1) {
            error!("Failed to signal monitor stop: {}", e);
        }
        if self.thread.join().is_err() {
            error!("Monitor thread panicked");
        }
    }
}

fn monitor_thread(watch: Vec<(DeviceName, OwnedFd)>, prio: SharedPrio, stop: EventFd) {
    if let Err(e) = monitor_loop(&watch, &prio, &stop) {
        error!("Monitor stopped: {:#}", e);
    }
    // watch and its duplicated descriptors drop here.
}

fn monitor_loop(
    watch: &[(DeviceName, OwnedFd)],
    prio: &SharedPrio,
    stop: &EventFd,
) -> Result<()> {
    let epoll = Epoll::new().context("Failed to create monitor epoll")?;
    epoll
        .ctl(
            ControlOperation::Add,
            stop.as_raw_fd(),
            EpollEvent::new(EventSet::IN, STOP_TOKEN),
        )
        .context("Failed to register stop eventfd")?;

    for (i, (name, fd)) in watch.iter().enumerate() {
        epoll
            .ctl(
                ControlOperation::Add,
                fd.as_raw_fd(),
                EpollEvent::new(EventSet::IN, i as u64),
            )
            .with_context(|| format!("Failed to register vhost fd of vf {}", name))?;
    }

    info!("Monitoring {} vhost sockets", watch.len());

    let mut events = vec![EpollEvent::default(); watch.len() + 1];
    loop {
        let nev = match epoll.wait(-1, &mut events) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("monitor epoll_wait"),
        };

        for ev in &events[..nev] {
            if ev.data() == STOP_TOKEN {
                return Ok(());
            }
            let (name, fd) = &watch[ev.data() as usize];
            info!("Vhost socket of vf {} is quiet", name);

            {
                let mut prio = prio.lock().unwrap();
                // A failed priority send ends this generation; the
                // reactor respawns one on the next disconnect.
                prio.notify_or_defer(name)?;
            }

            // Each VF is announced at most once per generation.
            if let Err(e) = epoll.ctl(
                ControlOperation::Delete,
                fd.as_raw_fd(),
                EpollEvent::default(),
            ) {
                warn!("Failed to drop vhost fd of vf {} from epoll: {}", name, e);
            }
        }
    }
}
