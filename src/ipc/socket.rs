//! The TCP command transport: one listener, at most one connection,
//! newline/whitespace-terminated ASCII commands.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::ipc::{COMMAND_TERMINATE, CommandRequest, parse_command};
use crate::{CinderError, Result};

const COMMAND_BUFFER: usize = 512;

pub struct CommandSocket {
    listener: TcpListener,
    conn: Option<TcpStream>,
    // A dead connection is only marked here; the owner closes it once the
    // event loop has dropped the registration for its fd.
    conn_dead: bool,
}

impl CommandSocket {
    pub fn new(port: u16) -> Result<CommandSocket> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .map_err(|err| CinderError::Ipc(format!("bind port {port}: {err}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| CinderError::Ipc(err.to_string()))?;
        info!("command socket on port {port}");
        Ok(CommandSocket {
            listener,
            conn: None,
            conn_dead: false,
        })
    }

    pub fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn conn_fd(&self) -> Option<RawFd> {
        self.conn.as_ref().map(|c| c.as_raw_fd())
    }

    pub fn conn_dead(&self) -> bool {
        self.conn_dead
    }

    pub fn close_conn(&mut self) {
        self.conn = None;
        self.conn_dead = false;
    }

    /// Accept a waiting client without installing it yet; the caller
    /// unregisters the previous connection first.
    pub fn accept_pending(&mut self) -> Option<TcpStream> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                debug!("command connection from {peer}");
                stream.set_nonblocking(true).ok()?;
                Some(stream)
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => None,
            Err(err) => {
                warn!("accept: {err}");
                None
            }
        }
    }

    pub fn install_conn(&mut self, stream: TcpStream) {
        self.conn = Some(stream);
        self.conn_dead = false;
    }

    /// Read one command from the connection. `None` when nothing complete
    /// arrived; a closed or broken peer marks the connection dead.
    pub fn read_command(&mut self) -> Option<CommandRequest> {
        if self.conn_dead {
            return None;
        }
        let conn = self.conn.as_mut()?;
        let mut buf = [0u8; COMMAND_BUFFER];
        match conn.read(&mut buf) {
            Ok(0) => {
                self.conn_dead = true;
                None
            }
            Ok(n) => {
                let line = String::from_utf8_lossy(&buf[..n]);
                match parse_command(line.trim()) {
                    Ok(request) => Some(request),
                    Err(err) => {
                        // Bad requests are logged and get no reply.
                        warn!("bad command: {err}");
                        None
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => None,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => None,
            Err(err) => {
                debug!("command connection lost: {err}");
                self.conn_dead = true;
                None
            }
        }
    }

    pub fn reply(&mut self, payload: &str) {
        if let Some(conn) = self.conn.as_mut()
            && let Err(err) = conn.write_all(payload.as_bytes())
        {
            debug!("reply: {err}");
            self.conn_dead = true;
        }
    }
}

/// Ask a previously started instance (initramfs leftovers) to exit before
/// we take over the port.
pub fn displace_stale_instance(port: u16) {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let Ok(mut stream) = TcpStream::connect_timeout(&addr, Duration::from_millis(250)) else {
        return;
    };
    info!("displacing running instance on port {port}");
    let _ = stream.write_all(COMMAND_TERMINATE.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_client(socket: &mut CommandSocket) {
        for _ in 0..200 {
            if let Some(stream) = socket.accept_pending() {
                socket.install_conn(stream);
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("no client connected");
    }

    #[test]
    fn accept_read_reply_cycle() {
        let mut socket = CommandSocket::new(0).unwrap();
        let port = socket.listener.local_addr().unwrap().port();

        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        client.write_all(b"MakeVT 3\n").unwrap();

        accept_client(&mut socket);
        let mut request = None;
        for _ in 0..100 {
            request = socket.read_command();
            if request.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(request, Some(CommandRequest::MakeVt(3)));

        socket.reply("/dev/pts/7");
        let mut reply = [0u8; 32];
        let n = client.read(&mut reply).unwrap();
        assert_eq!(&reply[..n], b"/dev/pts/7");
    }

    #[test]
    fn closed_peer_marks_connection_dead() {
        let mut socket = CommandSocket::new(0).unwrap();
        let port = socket.listener.local_addr().unwrap().port();

        let client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        accept_client(&mut socket);
        drop(client);

        for _ in 0..100 {
            socket.read_command();
            if socket.conn_dead() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(socket.conn_dead());
        // The fd stays open until the owner closes it explicitly.
        assert!(socket.conn_fd().is_some());
        socket.close_conn();
        assert_eq!(socket.conn_fd(), None);
    }

    #[test]
    fn garbage_gets_no_reply_and_keeps_connection() {
        let mut socket = CommandSocket::new(0).unwrap();
        let port = socket.listener.local_addr().unwrap().port();

        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        client.write_all(b"FlipTable 9\n").unwrap();
        accept_client(&mut socket);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(socket.read_command(), None);
        assert!(!socket.conn_dead());
        assert!(socket.conn.is_some());
    }
}
