// SPDX-FileCopyrightText: Copyright © 2024-2026 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Control channel between a running scriptlet and the engine.
//!
//! Scriptlets connect to a unix socket published via the
//! [`SOCKET_ENV`] environment variable and exchange one JSON request per
//! connection round: `{"function": …, "args": […]}` answered by an
//! `OK [value]` or `ERR message` line.

use std::{
    io::{self, Read, Write},
    os::fd::{AsFd, BorrowedFd},
    os::unix::net::{UnixListener, UnixStream},
    path::Path,
};

use crate::errors::Error;

/// Environment variable carrying the socket path into the scriptlet.
pub const SOCKET_ENV: &str = "PARTS_CTL_SOCKET";

/// Requests are read in chunks of this size.
const READ_CHUNK: usize = 1024;

/// Upper bound for one request from the untrusted client. A request still
/// incomplete at this size is handed over as-is and fails as malformed.
const MAX_REQUEST: usize = 64 * 1024;

/// Outcome of a control call that did not succeed.
pub enum Fault {
    /// Control-API misuse: reply `ERR …` and keep serving.
    Recoverable(Error),
    /// Engine failure: unwind through the runner and abort the scriptlet.
    Fatal(Error),
}

/// Receives decoded control messages while the scriptlet runs.
pub trait Handler {
    fn call(&mut self, message: &str) -> Result<Option<String>, Fault>;
}

/// Byte-stream server multiplexed alongside the scriptlet child process.
pub struct Server {
    listener: UnixListener,
    connections: Vec<Connection>,
}

struct Connection {
    stream: UnixStream,
    buffer: Vec<u8>,
    closed: bool,
}

impl Server {
    pub fn bind(path: &Path) -> io::Result<Self> {
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;

        Ok(Self {
            listener,
            connections: vec![],
        })
    }

    pub fn listener_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }

    pub fn connection_fds(&self) -> Vec<BorrowedFd<'_>> {
        self.connections.iter().map(|conn| conn.stream.as_fd()).collect()
    }

    /// Drop connections that finished in a previous pump round.
    pub fn reap(&mut self) {
        self.connections.retain(|conn| !conn.closed);
    }

    pub fn accept_pending(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    self.connections.push(Connection {
                        stream,
                        buffer: vec![],
                        closed: false,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Service one readable connection.
    ///
    /// Reads a chunk, dispatches once a complete request has accumulated,
    /// and writes the reply before anything else is read from this
    /// connection. A fatal fault is returned to the caller untouched.
    pub fn service(&mut self, index: usize, handler: &mut dyn Handler) -> Result<(), Error> {
        let conn = &mut self.connections[index];

        let mut chunk = [0u8; READ_CHUNK];
        let read = match conn.stream.read(&mut chunk) {
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(_) => {
                conn.closed = true;
                return Ok(());
            }
        };

        if read == 0 {
            conn.closed = true;
            return Ok(());
        }

        conn.buffer.extend_from_slice(&chunk[..read]);
        log::debug!("control server received {} bytes", conn.buffer.len());

        // A short read may be a partial request; wait for the rest
        if conn.buffer.len() <= MAX_REQUEST {
            if let Err(err) = serde_json::from_slice::<serde_json::Value>(&conn.buffer) {
                if err.classify() == serde_json::error::Category::Eof {
                    return Ok(());
                }
            }
        }

        let message = String::from_utf8_lossy(&conn.buffer).to_string();
        conn.buffer.clear();

        let reply = match handler.call(&message) {
            Ok(Some(value)) => format!("OK {value}\n"),
            Ok(None) => "OK\n".to_owned(),
            Err(Fault::Recoverable(error)) => format!("ERR {error}\n"),
            Err(Fault::Fatal(error)) => return Err(error),
        };

        let conn = &mut self.connections[index];
        if conn.stream.write_all(reply.as_bytes()).is_err() {
            conn.closed = true;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::{Fault, Handler, Server};
    use crate::errors::Error;

    struct Echo;

    impl Handler for Echo {
        fn call(&mut self, message: &str) -> Result<Option<String>, Fault> {
            match message {
                "boom" => Err(Fault::Fatal(Error::PluginBuild {
                    part_name: "foo".into(),
                    plugin_name: "nil".into(),
                    stderr: vec![],
                })),
                "bad" => Err(Fault::Recoverable(Error::InvalidAction {
                    message: "nope".into(),
                })),
                other => Ok(Some(other.to_owned())),
            }
        }
    }

    fn roundtrip(server: &mut Server, request: &[u8]) -> Result<String, Error> {
        let addr = server.listener.local_addr().unwrap();
        let path = addr.as_pathname().unwrap().to_path_buf();

        let request = request.to_vec();
        let writer = thread::spawn(move || {
            let mut stream = UnixStream::connect(path).unwrap();
            stream.write_all(&request).unwrap();
            stream
        });
        let mut stream = writer.join().unwrap();

        server.accept_pending().unwrap();
        server.service(0, &mut Echo)?;

        let mut reply = String::new();
        let mut byte = [0u8; 1];
        while stream.read(&mut byte).unwrap() == 1 {
            reply.push(byte[0] as char);
            if byte[0] == b'\n' {
                break;
            }
        }
        Ok(reply)
    }

    #[test]
    fn replies_ok_with_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Server::bind(&dir.path().join("ctl.socket")).unwrap();

        assert_eq!(roundtrip(&mut server, b"{\"function\":\"get\"}").unwrap(), "OK {\"function\":\"get\"}\n");
    }

    #[test]
    fn recoverable_fault_replies_err() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Server::bind(&dir.path().join("ctl.socket")).unwrap();

        let reply = roundtrip(&mut server, b"bad").unwrap();
        assert!(reply.starts_with("ERR "), "unexpected reply: {reply}");
    }

    #[test]
    fn fatal_fault_unwinds() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Server::bind(&dir.path().join("ctl.socket")).unwrap();

        assert!(matches!(
            roundtrip(&mut server, b"boom"),
            Err(Error::PluginBuild { .. })
        ));
    }
}
