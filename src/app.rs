use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::client::dns::{Matrix, Resolve, SystemResolver, spawn_refresh_loops};
use crate::mgmt;
use crate::proxy::driver::{self, WorkItem};
use crate::proxy::pool::WorkerPool;
use crate::route::{Listener, Runtime};
use crate::transport::stream::{AcceptWait, wait_accept};

static SIGNALLED: AtomicBool = AtomicBool::new(false);
static SIGNAL_WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(_sig: libc::c_int) {
	SIGNALLED.store(true, Ordering::SeqCst);
	let fd = SIGNAL_WAKE_FD.load(Ordering::SeqCst);
	if fd >= 0 {
		unsafe {
			libc::write(fd, b"x".as_ptr() as *const libc::c_void, 1);
		}
	}
}

struct BoundListener {
	config: Arc<Listener>,
	socket: TcpListener,
}

/// A bound but not yet accepting server. Tests drive `start`/`stop`
/// directly; the binary goes through `run`, which also wires up signals.
pub struct Server {
	rt: Arc<Runtime>,
	pool: Arc<WorkerPool<WorkItem>>,
	bound: Vec<BoundListener>,
	matrices: Vec<Arc<Matrix>>,
	resolver: Option<Arc<dyn Resolve>>,
	wake_rx: OwnedFd,
	wake_tx: OwnedFd,
	stopping: Arc<AtomicBool>,
	threads: Vec<JoinHandle<()>>,
}

impl Server {
	pub fn bind(
		rt: Arc<Runtime>,
		matrices: Vec<Arc<Matrix>>,
		resolver: Option<Arc<dyn Resolve>>,
	) -> anyhow::Result<Server> {
		let mut bound = Vec::new();
		for listener in &rt.listeners {
			let socket = bind_listener(listener.addr)
				.with_context(|| format!("listener {:?} on {}", listener.name, listener.addr))?;
			bound.push(BoundListener {
				config: listener.clone(),
				socket,
			});
		}

		let (wake_rx, wake_tx) = make_pipe()?;
		let pool_rt = rt.clone();
		let pool = Arc::new(WorkerPool::new(rt.worker.clone(), move |item: WorkItem| {
			driver::handle(&pool_rt, item)
		}));
		Ok(Server {
			rt,
			pool,
			bound,
			matrices,
			resolver,
			wake_rx,
			wake_tx,
			stopping: Arc::new(AtomicBool::new(false)),
			threads: Vec::new(),
		})
	}

	/// Addresses actually bound, in listener order. Useful with port 0.
	pub fn local_addrs(&self) -> Vec<SocketAddr> {
		self
			.bound
			.iter()
			.filter_map(|b| b.socket.local_addr().ok())
			.collect()
	}

	/// Spawn acceptors, resolver loops, and the session sweeper.
	pub fn start(&mut self) -> anyhow::Result<()> {
		if !self.matrices.is_empty() {
			let resolver: Arc<dyn Resolve> = match self.resolver.take() {
				Some(r) => r,
				None => Arc::new(SystemResolver::new().context("initializing resolver")?),
			};
			let handles = spawn_refresh_loops(
				std::mem::take(&mut self.matrices),
				resolver,
				self.stopping.clone(),
			);
			self.threads.extend(handles);
		}

		{
			let rt = self.rt.clone();
			let stopping = self.stopping.clone();
			let sweeper = std::thread::Builder::new()
				.name("session-sweep".to_string())
				.spawn(move || session_sweeper(rt, stopping))
				.context("spawning sweeper")?;
			self.threads.push(sweeper);
		}

		for b in self.bound.drain(..) {
			let pool = self.pool.clone();
			let stopping = self.stopping.clone();
			let wake_fd = self.wake_rx.as_raw_fd();
			let name = b.config.name.clone();
			let handle = std::thread::Builder::new()
				.name(format!("accept-{name}"))
				.spawn(move || accept_loop(b, pool, stopping, wake_fd))
				.with_context(|| format!("spawning acceptor for {name}"))?;
			self.threads.push(handle);
		}
		Ok(())
	}

	/// Signal every thread, drain the pool within the grace window, join.
	pub fn stop(mut self) {
		self.stopping.store(true, Ordering::SeqCst);
		unsafe {
			libc::write(
				self.wake_tx.as_raw_fd(),
				b"x".as_ptr() as *const libc::c_void,
				1,
			);
		}
		for t in self.threads.drain(..) {
			let _ = t.join();
		}
		self.pool.shutdown(self.rt.grace);
		info!("shutdown complete");
	}

	/// Run until SIGINT/SIGTERM.
	pub fn run(mut self) -> anyhow::Result<()> {
		SIGNAL_WAKE_FD.store(self.wake_tx.as_raw_fd(), Ordering::SeqCst);
		let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
		unsafe {
			libc::signal(libc::SIGINT, handler);
			libc::signal(libc::SIGTERM, handler);
		}
		self.start()?;
		let n_listeners = self.rt.listeners.len();
		info!(listeners = n_listeners, "accepting connections");
		while !SIGNALLED.load(Ordering::SeqCst) {
			std::thread::sleep(Duration::from_millis(200));
		}
		info!("signal received, draining");
		self.stop();
		Ok(())
	}

	/// Direct access for embedding and tests.
	pub fn runtime(&self) -> &Arc<Runtime> {
		&self.rt
	}
}

fn bind_listener(addr: SocketAddr) -> anyhow::Result<TcpListener> {
	let domain = Domain::for_address(addr);
	let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
	socket.set_reuse_address(true)?;
	socket.bind(&addr.into())?;
	socket.listen(256)?;
	socket.set_nonblocking(true)?;
	Ok(socket.into())
}

fn accept_loop(
	bound: BoundListener,
	pool: Arc<WorkerPool<WorkItem>>,
	stopping: Arc<AtomicBool>,
	wake_fd: i32,
) {
	let listener_fd = bound.socket.as_raw_fd();
	loop {
		if stopping.load(Ordering::SeqCst) {
			return;
		}
		match wait_accept(listener_fd, wake_fd, Duration::from_secs(1)) {
			Ok(AcceptWait::Incoming) => loop {
				match bound.socket.accept() {
					Ok((stream, peer)) => {
						if stream.set_nonblocking(false).is_err() {
							continue;
						}
						debug!(listener = %bound.config.name, %peer, "accepted");
						if !pool.submit(WorkItem {
							stream,
							peer,
							listener: bound.config.clone(),
						}) {
							return;
						}
					},
					Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
					Err(e) => {
						warn!(listener = %bound.config.name, "accept failed: {e}");
						break;
					},
				}
			},
			Ok(AcceptWait::Wake) => return,
			Ok(AcceptWait::Timeout) => {},
			Err(e) => {
				warn!(listener = %bound.config.name, "poll failed: {e}");
				return;
			},
		}
	}
}

fn session_sweeper(rt: Arc<Runtime>, stopping: Arc<AtomicBool>) {
	let mut last = Instant::now();
	loop {
		if stopping.load(Ordering::SeqCst) {
			return;
		}
		std::thread::sleep(Duration::from_millis(500));
		if last.elapsed() < Duration::from_secs(10) {
			continue;
		}
		last = Instant::now();
		let now = Instant::now();
		mgmt::foreach_service(&rt, |svc| svc.sweep_sessions(now));
	}
}

fn make_pipe() -> anyhow::Result<(OwnedFd, OwnedFd)> {
	let mut fds = [0i32; 2];
	let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
	if rc != 0 {
		return Err(std::io::Error::last_os_error()).context("creating wake pipe");
	}
	unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}
