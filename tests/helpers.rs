use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use vdpa_custodian::message::{self, DeviceName, Message, MsgHdr, Opcode};
use vdpa_custodian::Server;

/// Spin up a custodian on a socket of its own. The server thread runs
/// until the test process exits.
pub fn start_server() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("custodian.sock");
    let mut server = Server::bind(&path).expect("Failed to bind server");
    thread::spawn(move || {
        let _ = server.run();
    });
    (dir, path)
}

/// Connect to the custodian, retrying while it comes up.
pub fn connect(path: &Path) -> UnixStream {
    let now = Instant::now();
    while now.elapsed() < Duration::from_secs(5) {
        if let Ok(stream) = UnixStream::connect(path) {
            return stream;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("custodian socket did not appear in time");
}

/// Send one request frame.
pub fn request(sock: &UnixStream, opcode: Opcode, bdf: &str, payload: &[u8], fds: &[RawFd]) {
    let hdr = MsgHdr {
        opcode: opcode as u32,
        bdf: DeviceName::new(bdf).bdf,
        size: 0,
    };
    message::send_msg(sock.as_raw_fd(), &hdr, payload, fds).expect("Failed to send request");
}

/// Receive one reply frame.
pub fn reply(sock: &UnixStream) -> Message {
    Message::recv(sock)
        .expect("Failed to recv reply")
        .expect("custodian closed the connection")
}

/// A descriptor to store in the custodian plus the peer end to observe
/// it with: EOF on the peer means every copy of the stored end is gone.
pub fn fd_pair() -> (OwnedFd, UnixStream) {
    let (ours, peer) = UnixStream::pair().expect("Failed to create socketpair");
    (OwnedFd::from(ours), peer)
}
