use std::io::{ErrorKind, Read, Write};
use std::mem::size_of;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use test_log::test;
use vm_memory::ByteValued;

use vdpa_custodian::message::{
    read_obj, DeviceName, DmaMap, MemRegion, MemTblHdr, Message, MsgHdr, Opcode, VersionInfo,
    VfCtxReply, VfDevArgs, BDF_SIZE, MAX_PAYLOAD,
};

mod helpers;
use helpers::*;

const PF: &str = "0000:01:00.0";

fn devargs(vf: &str) -> VfDevArgs {
    VfDevArgs {
        vf_name: DeviceName::new(vf),
        ..Default::default()
    }
}

/// Store a PF and one of its VFs, returning the peers of the descriptors
/// handed over (container, group, device for the VF last).
fn store_pf_and_vf(sock: &UnixStream, vf: &str) -> Vec<UnixStream> {
    let (pf_g, pf_g_peer) = fd_pair();
    let (pf_d, pf_d_peer) = fd_pair();
    request(
        sock,
        Opcode::PfStoreCtx,
        PF,
        &[],
        &[pf_g.as_raw_fd(), pf_d.as_raw_fd()],
    );

    let (c, c_peer) = fd_pair();
    let (g, g_peer) = fd_pair();
    let (d, d_peer) = fd_pair();
    request(
        sock,
        Opcode::VfStoreDevargVfioFds,
        PF,
        devargs(vf).as_slice(),
        &[c.as_raw_fd(), g.as_raw_fd(), d.as_raw_fd()],
    );

    vec![pf_g_peer, pf_d_peer, c_peer, g_peer, d_peer]
}

// S1: a stored PF comes back from both list and ctx queries, and the ctx
// descriptors refer to the same open file descriptions that went in.
#[test]
fn test_round_trip_query() {
    let (_dir, path) = start_server();
    let sock = connect(&path);

    let (group, mut group_peer) = fd_pair();
    let (device, _device_peer) = fd_pair();
    request(
        &sock,
        Opcode::PfStoreCtx,
        PF,
        &[],
        &[group.as_raw_fd(), device.as_raw_fd()],
    );

    request(&sock, Opcode::QueryPfList, "", &[], &[]);
    let list = reply(&sock);
    assert_eq!(list.opcode().unwrap(), Opcode::QueryPfList);
    assert_eq!(list.payload.len(), BDF_SIZE);
    let name: DeviceName = read_obj(&list.payload).unwrap();
    assert_eq!(name.as_str(), PF);

    request(&sock, Opcode::QueryPfCtx, PF, &[], &[]);
    let mut ctx = reply(&sock);
    assert_eq!(ctx.fds.len(), 2);

    // Writing through the returned group fd must surface at our peer.
    let mut returned_group: UnixStream = ctx.fds.remove(0).into();
    returned_group.write_all(b"g").unwrap();
    let mut byte = [0u8; 1];
    group_peer.read_exact(&mut byte).unwrap();
    assert_eq!(&byte, b"g");
}

#[test]
fn test_query_version() {
    let (_dir, path) = start_server();
    let sock = connect(&path);

    request(&sock, Opcode::QueryVersion, "", &[], &[]);
    let msg = reply(&sock);
    assert_eq!(msg.payload.len(), size_of::<VersionInfo>());
    let ver: VersionInfo = read_obj(&msg.payload).unwrap();
    let version = String::from_utf8_lossy(&ver.version);
    assert!(version.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_query_pf_list_empty() {
    let (_dir, path) = start_server();
    let sock = connect(&path);

    request(&sock, Opcode::QueryPfList, "", &[], &[]);
    let msg = reply(&sock);
    assert!(msg.payload.is_empty());
    assert!(msg.fds.is_empty());
}

// S2: a VF whose vhost peer hung up reports mem_tbl_in_use = false.
#[test]
fn test_vhost_liveness() {
    let (_dir, path) = start_server();
    let sock = connect(&path);
    let vf = "0000:01:00.2";
    let _peers = store_pf_and_vf(&sock, vf);

    let (vhost, vhost_peer) = fd_pair();
    request(
        &sock,
        Opcode::VfStoreVhostFd,
        PF,
        DeviceName::new(vf).as_slice(),
        &[vhost.as_raw_fd()],
    );

    // Peer still attached: the VF counts as live.
    request(&sock, Opcode::QueryVfList, PF, &[], &[]);
    let msg = reply(&sock);
    let args: VfDevArgs = read_obj(&msg.payload).unwrap();
    assert_eq!(args.mem_tbl_in_use, 1);

    drop(vhost_peer);
    request(&sock, Opcode::QueryVfList, PF, &[], &[]);
    let msg = reply(&sock);
    let args: VfDevArgs = read_obj(&msg.payload).unwrap();
    assert_eq!(args.vf_name.as_str(), vf);
    assert_eq!(args.mem_tbl_in_use, 0);
}

// S3: vhost peers that go quiet while no priority channel is up are
// announced, in hangup order, as soon as one is installed.
#[test]
fn test_priority_deferral() {
    let (_dir, path) = start_server();
    let sock = connect(&path);

    let (pf_g, _pf_g_peer) = fd_pair();
    let (pf_d, _pf_d_peer) = fd_pair();
    request(
        &sock,
        Opcode::PfStoreCtx,
        PF,
        &[],
        &[pf_g.as_raw_fd(), pf_d.as_raw_fd()],
    );

    let mut vhost_peers = Vec::new();
    let mut vfio_peers = Vec::new();
    for i in 2..5 {
        let vf = format!("0000:01:00.{}", i);
        let (c, cp) = fd_pair();
        let (g, gp) = fd_pair();
        let (d, dp) = fd_pair();
        request(
            &sock,
            Opcode::VfStoreDevargVfioFds,
            PF,
            devargs(&vf).as_slice(),
            &[c.as_raw_fd(), g.as_raw_fd(), d.as_raw_fd()],
        );
        vfio_peers.extend([cp, gp, dp]);

        let (vhost, vhost_peer) = fd_pair();
        request(
            &sock,
            Opcode::VfStoreVhostFd,
            PF,
            DeviceName::new(&vf).as_slice(),
            &[vhost.as_raw_fd()],
        );
        vhost_peers.push(vhost_peer);
    }

    // Make sure everything above has been processed, then drop the
    // worker connection; the recovery path spawns the monitor.
    request(&sock, Opcode::QueryPfList, "", &[], &[]);
    reply(&sock);
    drop(sock);
    thread::sleep(Duration::from_millis(300));

    // Quiesce the three vhost peers one at a time, oldest VF first.
    for peer in vhost_peers {
        drop(peer);
        thread::sleep(Duration::from_millis(100));
    }

    // Reconnect and install a priority channel; the deferred events must
    // drain over it in hangup order, once each.
    let sock = connect(&path);
    let (chnl, agent) = fd_pair();
    request(&sock, Opcode::SetPrioChnl, "", &[], &[chnl.as_raw_fd()]);

    for i in 2..5 {
        let msg = Message::recv(&agent)
            .expect("Failed to recv priority msg")
            .expect("priority channel closed");
        assert_eq!(msg.opcode().unwrap(), Opcode::PrioChnlAddVf);
        let name: DeviceName = read_obj(&msg.payload).unwrap();
        assert_eq!(name.as_str(), format!("0000:01:00.{}", i));
    }

    // No duplicates: the channel stays quiet afterwards.
    agent
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut reader = &agent;
    let mut buf = [0u8; 1];
    match reader.read(&mut buf) {
        Ok(0) => {}
        Ok(_) => panic!("unexpected extra priority traffic"),
        Err(e) => assert!(matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)),
    }
}

// S5: disconnect triggers the recovery path; the sentinel is gone once a
// new worker can talk to the custodian again, and the held state
// survives.
#[test]
fn test_disconnect_recovery() {
    let (_dir, path) = start_server();
    let sock = connect(&path);

    let _peers_a = store_pf_and_vf(&sock, "0000:01:00.2");
    let (second_pf_g, _g_peer) = fd_pair();
    let (second_pf_d, _d_peer) = fd_pair();
    request(
        &sock,
        Opcode::PfStoreCtx,
        "0000:02:00.0",
        &[],
        &[second_pf_g.as_raw_fd(), second_pf_d.as_raw_fd()],
    );

    let (container, mut container_peer) = fd_pair();
    request(
        &sock,
        Opcode::GlobalStoreContainer,
        "",
        &[],
        &[container.as_raw_fd()],
    );
    for (iova, size) in [(0x1000u64, 0x2000u64), (0x8000, 0x1000)] {
        request(
            &sock,
            Opcode::GlobalStoreDmaMap,
            "",
            DmaMap { iova, size }.as_slice(),
            &[],
        );
    }

    request(&sock, Opcode::QueryPfList, "", &[], &[]);
    reply(&sock);
    drop(sock);

    // Reconnect; the reactor only gets back to accepting once the reset
    // fallback has finished and removed the sentinel.
    let sock = connect(&path);
    request(&sock, Opcode::QueryPfList, "", &[], &[]);
    let msg = reply(&sock);
    assert_eq!(msg.payload.len(), 2 * BDF_SIZE);
    // Another test's recovery may hold the sentinel open for a moment.
    let gone = (0..100).any(|_| {
        if std::path::Path::new("/tmp/pf_resetting").exists() {
            thread::sleep(Duration::from_millis(10));
            false
        } else {
            true
        }
    });
    assert!(gone, "reset sentinel was not removed");

    // The global container is still held.
    request(&sock, Opcode::GlobalQueryContainer, "", &[], &[]);
    let mut msg = reply(&sock);
    assert_eq!(msg.fds.len(), 1);
    let mut returned: UnixStream = msg.fds.remove(0).into();
    returned.write_all(b"c").unwrap();
    let mut byte = [0u8; 1];
    container_peer.read_exact(&mut byte).unwrap();
    assert_eq!(&byte, b"c");
}

#[test]
fn test_query_vf_ctx_carries_table_and_fds() {
    let (_dir, path) = start_server();
    let sock = connect(&path);
    let vf = "0000:01:00.2";
    let _peers = store_pf_and_vf(&sock, vf);

    let regions = [
        MemRegion {
            guest_phys_addr: 0x0,
            guest_user_addr: 0x7f00_0000_0000,
            size: 0x8000_0000,
        },
        MemRegion {
            guest_phys_addr: 0x1_0000_0000,
            guest_user_addr: 0x7f80_0000_0000,
            size: 0x8000_0000,
        },
    ];
    let mut payload = DeviceName::new(vf).as_slice().to_vec();
    payload.extend_from_slice(MemTblHdr::new(2).as_slice());
    for region in &regions {
        payload.extend_from_slice(region.as_slice());
    }
    request(&sock, Opcode::VfStoreDmaTbl, PF, &payload, &[]);

    request(
        &sock,
        Opcode::QueryVfCtx,
        PF,
        DeviceName::new(vf).as_slice(),
        &[],
    );
    let msg = reply(&sock);
    assert_eq!(msg.fds.len(), 3);
    let ctx: VfCtxReply = read_obj(&msg.payload).unwrap();
    assert_eq!(ctx.vhost_fd_saved, 0);
    assert_eq!(ctx.nregions, 2);
    for (i, want) in regions.iter().enumerate() {
        let off = size_of::<VfCtxReply>() + i * size_of::<MemRegion>();
        let got: MemRegion = read_obj(&msg.payload[off..]).unwrap();
        assert_eq!(&got, want);
    }

    // Clearing the table empties the reply but keeps the descriptors.
    request(
        &sock,
        Opcode::VfRemoveDmaTbl,
        PF,
        DeviceName::new(vf).as_slice(),
        &[],
    );
    request(
        &sock,
        Opcode::QueryVfCtx,
        PF,
        DeviceName::new(vf).as_slice(),
        &[],
    );
    let msg = reply(&sock);
    assert_eq!(msg.fds.len(), 3);
    let ctx: VfCtxReply = read_obj(&msg.payload).unwrap();
    assert_eq!(ctx.nregions, 0);
}

// Re-storing a BDF shadows the older entry: queries and removal target
// the newest store, and removing it closes that store's descriptors
// while the older entry becomes visible again.
#[test]
fn test_pf_restore_shadows_older_entry() {
    let (_dir, path) = start_server();
    let sock = connect(&path);

    let (g1, mut g1_peer) = fd_pair();
    let (d1, _d1_peer) = fd_pair();
    request(
        &sock,
        Opcode::PfStoreCtx,
        PF,
        &[],
        &[g1.as_raw_fd(), d1.as_raw_fd()],
    );
    let (g2, mut g2_peer) = fd_pair();
    let (d2, _d2_peer) = fd_pair();
    request(
        &sock,
        Opcode::PfStoreCtx,
        PF,
        &[],
        &[g2.as_raw_fd(), d2.as_raw_fd()],
    );

    // The ctx query resolves the newest store.
    request(&sock, Opcode::QueryPfCtx, PF, &[], &[]);
    let mut ctx = reply(&sock);
    assert_eq!(ctx.fds.len(), 2);
    let mut returned: UnixStream = ctx.fds.remove(0).into();
    returned.write_all(b"2").unwrap();
    let mut byte = [0u8; 1];
    g2_peer.read_exact(&mut byte).unwrap();
    assert_eq!(&byte, b"2");

    // Removal targets the newest store too; the older one resurfaces.
    request(&sock, Opcode::PfRemoveCtx, PF, &[], &[]);
    request(&sock, Opcode::QueryPfCtx, PF, &[], &[]);
    let mut ctx = reply(&sock);
    assert_eq!(ctx.fds.len(), 2);
    let mut older: UnixStream = ctx.fds.remove(0).into();
    older.write_all(b"1").unwrap();
    g1_peer.read_exact(&mut byte).unwrap();
    assert_eq!(&byte, b"1");

    // With the custodian's copy gone, dropping our remaining handles
    // shows the removed store's group fd was really closed.
    drop(returned);
    drop(g2);
    let mut reader = &g2_peer;
    assert_eq!(reader.read(&mut byte).unwrap(), 0);
}

// An oversized frame is logged and dropped server-side, but the worker
// is retained: the stream stays framed and later requests still work.
#[test]
fn test_oversized_frame_keeps_connection_framed() {
    let (_dir, path) = start_server();
    let sock = connect(&path);

    let hdr = MsgHdr {
        opcode: Opcode::GlobalInitFinish as u32,
        bdf: [0; BDF_SIZE],
        size: (MAX_PAYLOAD + 1) as u32,
    };
    let mut writer = &sock;
    writer.write_all(hdr.as_slice()).unwrap();
    writer.write_all(&vec![0u8; MAX_PAYLOAD + 1]).unwrap();

    request(&sock, Opcode::QueryPfList, "", &[], &[]);
    assert!(reply(&sock).payload.is_empty());
}

// Property 5: replacing a stored vhost descriptor closes the old one,
// exactly once, and leaves the new one open.
#[test]
fn test_vhost_replacement_closes_previous() {
    let (_dir, path) = start_server();
    let sock = connect(&path);
    let vf = "0000:01:00.2";
    let _peers = store_pf_and_vf(&sock, vf);

    let (first, first_peer) = fd_pair();
    request(
        &sock,
        Opcode::VfStoreVhostFd,
        PF,
        DeviceName::new(vf).as_slice(),
        &[first.as_raw_fd()],
    );
    drop(first);
    let (second, second_peer) = fd_pair();
    request(
        &sock,
        Opcode::VfStoreVhostFd,
        PF,
        DeviceName::new(vf).as_slice(),
        &[second.as_raw_fd()],
    );
    drop(second);

    // Force the requests through before observing.
    request(&sock, Opcode::QueryPfList, "", &[], &[]);
    reply(&sock);

    let mut buf = [0u8; 1];
    let mut reader = &first_peer;
    assert_eq!(reader.read(&mut buf).unwrap(), 0);

    second_peer
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut reader = &second_peer;
    match reader.read(&mut buf) {
        Ok(0) => panic!("replacement vhost fd closed unexpectedly"),
        Ok(_) => panic!("unexpected data on vhost socket"),
        Err(e) => assert!(matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)),
    }
}

// Property 4: removes of things that are not there succeed and change
// nothing, and a malformed request does not cost the connection.
#[test]
fn test_idempotent_removes_and_malformed_requests() {
    let (_dir, path) = start_server();
    let sock = connect(&path);

    request(&sock, Opcode::PfRemoveCtx, "0000:0a:00.0", &[], &[]);
    request(
        &sock,
        Opcode::VfRemoveDevargVfioFds,
        "0000:0a:00.0",
        DeviceName::new("0000:0a:00.2").as_slice(),
        &[],
    );
    request(
        &sock,
        Opcode::VfRemoveVhostFd,
        "0000:0a:00.0",
        DeviceName::new("0000:0a:00.2").as_slice(),
        &[],
    );

    // Descriptor-count violation: logged and dropped server-side.
    request(&sock, Opcode::PfStoreCtx, PF, &[], &[]);
    // Unknown opcode: same.
    request(&sock, Opcode::PrioChnlAddVf, "", &[], &[]);

    request(&sock, Opcode::QueryPfList, "", &[], &[]);
    let msg = reply(&sock);
    assert!(msg.payload.is_empty());
}

// S4 at the protocol level: the first-stored size survives a duplicate
// iova, observable through the recovery flush only via unit tests, so
// here we just pin that both stores are accepted quietly.
#[test]
fn test_duplicate_dma_map_store_is_quiet() {
    let (_dir, path) = start_server();
    let sock = connect(&path);

    for size in [0x2000u64, 0x4000] {
        request(
            &sock,
            Opcode::GlobalStoreDmaMap,
            "",
            DmaMap { iova: 0x1000, size }.as_slice(),
            &[],
        );
    }
    request(&sock, Opcode::GlobalRemoveDmaMap, "", DmaMap { iova: 0x1000, size: 0 }.as_slice(), &[]);

    request(&sock, Opcode::QueryPfList, "", &[], &[]);
    assert!(reply(&sock).payload.is_empty());
}
