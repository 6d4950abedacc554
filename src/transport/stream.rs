use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

use rustls::{ClientConnection, ServerConnection, StreamOwned};

/// One side of a proxied exchange: a plain socket, a server-side TLS stream
/// (client connections) or a client-side TLS stream (backend connections).
/// All I/O is blocking; deadlines ride on the socket timeouts.
pub enum Conn {
	Plain(TcpStream),
	Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
	ClientTls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Conn {
	pub fn tcp(&self) -> &TcpStream {
		match self {
			Conn::Plain(s) => s,
			Conn::Tls(s) => &s.sock,
			Conn::ClientTls(s) => &s.sock,
		}
	}

	pub fn is_tls(&self) -> bool {
		!matches!(self, Conn::Plain(_))
	}

	pub fn server_tls(&self) -> Option<&ServerConnection> {
		match self {
			Conn::Tls(s) => Some(&s.conn),
			_ => None,
		}
	}

	pub fn peer_addr(&self) -> io::Result<SocketAddr> {
		self.tcp().peer_addr()
	}

	/// Apply one deadline to both directions.
	pub fn set_io_timeout(&self, to: Option<Duration>) -> io::Result<()> {
		self.tcp().set_read_timeout(to)?;
		self.tcp().set_write_timeout(to)
	}

	pub fn shutdown(&self) {
		let _ = self.tcp().shutdown(Shutdown::Both);
	}

	/// Whether the TLS layer holds decrypted bytes a socket poll cannot see.
	pub fn tls_buffered(&mut self) -> bool {
		match self {
			Conn::Plain(_) => false,
			Conn::Tls(s) => s
				.conn
				.process_new_packets()
				.map(|st| st.plaintext_bytes_to_read() > 0)
				.unwrap_or(false),
			Conn::ClientTls(s) => s
				.conn
				.process_new_packets()
				.map(|st| st.plaintext_bytes_to_read() > 0)
				.unwrap_or(false),
		}
	}

	/// Whether a read would make progress right now. Used to detect a pooled
	/// backend connection that went away (a readable idle connection is at
	/// EOF or has sent something unsolicited; either way it is stale).
	pub fn readable_now(&mut self) -> bool {
		if let Conn::ClientTls(s) = self
			&& s
				.conn
				.process_new_packets()
				.map(|st| st.plaintext_bytes_to_read() > 0)
				.unwrap_or(true)
		{
			return true;
		}
		matches!(poll_in(self.tcp(), 0), Ok(true) | Err(_))
	}
}

impl Read for Conn {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		match self {
			Conn::Plain(s) => s.read(buf),
			Conn::Tls(s) => s.read(buf),
			Conn::ClientTls(s) => s.read(buf),
		}
	}
}

impl Write for Conn {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self {
			Conn::Plain(s) => s.write(buf),
			Conn::Tls(s) => s.write(buf),
			Conn::ClientTls(s) => s.write(buf),
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match self {
			Conn::Plain(s) => s.flush(),
			Conn::Tls(s) => s.flush(),
			Conn::ClientTls(s) => s.flush(),
		}
	}
}

fn poll_raw(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<i32> {
	loop {
		let r = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
		if r < 0 {
			let err = io::Error::last_os_error();
			if err.kind() == io::ErrorKind::Interrupted {
				continue;
			}
			return Err(err);
		}
		return Ok(r);
	}
}

fn poll_in(sock: &TcpStream, timeout_ms: i32) -> io::Result<bool> {
	let mut fds = [libc::pollfd {
		fd: sock.as_raw_fd(),
		events: libc::POLLIN,
		revents: 0,
	}];
	let n = poll_raw(&mut fds, timeout_ms)?;
	Ok(n > 0 && fds[0].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
}

/// Wait for either side of a tunnel to become readable. `Ok(None)` means
/// the idle timeout elapsed.
pub fn wait_either(
	a: &Conn,
	b: &Conn,
	timeout: Duration,
) -> io::Result<Option<(bool, bool)>> {
	let mut fds = [
		libc::pollfd {
			fd: a.tcp().as_raw_fd(),
			events: libc::POLLIN,
			revents: 0,
		},
		libc::pollfd {
			fd: b.tcp().as_raw_fd(),
			events: libc::POLLIN,
			revents: 0,
		},
	];
	let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
	let n = poll_raw(&mut fds, ms)?;
	if n == 0 {
		return Ok(None);
	}
	let ready = |r: libc::pollfd| r.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0;
	Ok(Some((ready(fds[0]), ready(fds[1]))))
}

/// Also poll a wake pipe alongside a listening socket so the acceptor can
/// be interrupted for shutdown. Returns true when the listener is ready,
/// false when the pipe fired (or poll was cut short).
pub fn wait_accept(listener_fd: i32, wake_fd: i32, timeout: Duration) -> io::Result<AcceptWait> {
	let mut fds = [
		libc::pollfd {
			fd: listener_fd,
			events: libc::POLLIN,
			revents: 0,
		},
		libc::pollfd {
			fd: wake_fd,
			events: libc::POLLIN,
			revents: 0,
		},
	];
	let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
	let n = poll_raw(&mut fds, ms)?;
	if n == 0 {
		return Ok(AcceptWait::Timeout);
	}
	if fds[1].revents & (libc::POLLIN | libc::POLLHUP) != 0 {
		return Ok(AcceptWait::Wake);
	}
	if fds[0].revents & libc::POLLIN != 0 {
		return Ok(AcceptWait::Incoming);
	}
	Ok(AcceptWait::Timeout)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptWait {
	Incoming,
	Wake,
	Timeout,
}
