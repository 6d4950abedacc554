use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hickory_resolver::Resolver;
use hickory_resolver::error::ResolveError;
use tracing::{debug, warn};

use crate::route::{Backend, BackendTls, RegularTarget, Service};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddrFamily {
	#[default]
	Any,
	V4,
	V6,
}

impl AddrFamily {
	fn keeps(&self, ip: &IpAddr) -> bool {
		match self {
			AddrFamily::Any => true,
			AddrFamily::V4 => ip.is_ipv4(),
			AddrFamily::V6 => ip.is_ipv6(),
		}
	}
}

/// How a matrix backend turns its hostname into concrete backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveMode {
	/// Resolve once at startup; every address becomes a backend.
	Immediate,
	/// Periodically re-resolve, keeping only the first address.
	First,
	/// Periodically re-resolve, keeping every address.
	#[default]
	All,
	/// Periodically re-resolve SRV records; port and weight come from the
	/// records.
	Srv,
}

#[derive(Debug, Clone)]
pub struct SrvRecord {
	pub target: String,
	pub port: u16,
	pub weight: u16,
}

/// The `resolve(name, family)` contract. The system implementation wraps
/// the blocking hickory resolver; tests substitute a table.
pub trait Resolve: Send + Sync {
	fn lookup(&self, name: &str) -> Result<Vec<IpAddr>, ResolveError>;
	fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, ResolveError>;
}

pub struct SystemResolver {
	inner: Resolver,
}

impl SystemResolver {
	pub fn new() -> Result<SystemResolver, ResolveError> {
		Ok(SystemResolver {
			inner: Resolver::from_system_conf()?,
		})
	}
}

impl Resolve for SystemResolver {
	fn lookup(&self, name: &str) -> Result<Vec<IpAddr>, ResolveError> {
		Ok(self.inner.lookup_ip(name)?.iter().collect())
	}

	fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, ResolveError> {
		Ok(
			self
				.inner
				.srv_lookup(name)?
				.iter()
				.map(|srv| SrvRecord {
					target: srv.target().to_utf8(),
					port: srv.port(),
					weight: srv.weight(),
				})
				.collect(),
		)
	}
}

/// Per-backend TLS settings carried by the template until expansion time.
#[derive(Debug, Clone)]
pub struct MatrixTls {
	pub sni: Option<String>,
}

/// A matrix backend: a hostname that expands into one or more regular
/// backends through the resolver. Each refresh diffs the resolved address
/// set against the backends created by the previous cycle.
pub struct Matrix {
	pub service: Arc<Service>,
	pub emergency: bool,
	pub hostname: String,
	pub port: u16,
	pub family: AddrFamily,
	pub mode: ResolveMode,
	pub interval: Duration,
	pub weight: u32,
	pub conn_to: Duration,
	pub io_to: Duration,
	pub ws_to: Duration,
	pub tls: Option<MatrixTls>,
	created: Mutex<Vec<Arc<Backend>>>,
}

impl Matrix {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		service: Arc<Service>,
		emergency: bool,
		hostname: String,
		port: u16,
		family: AddrFamily,
		mode: ResolveMode,
		interval: Duration,
		weight: u32,
		conn_to: Duration,
		io_to: Duration,
		ws_to: Duration,
		tls: Option<MatrixTls>,
	) -> Matrix {
		Matrix {
			service,
			emergency,
			hostname,
			port,
			family,
			mode,
			interval,
			weight,
			conn_to,
			io_to,
			ws_to,
			tls,
			created: Mutex::new(Vec::new()),
		}
	}

	fn desired(&self, resolver: &dyn Resolve) -> Result<Vec<(SocketAddr, u32)>, ResolveError> {
		match self.mode {
			ResolveMode::Srv => {
				let mut out = Vec::new();
				for srv in resolver.lookup_srv(&self.hostname)? {
					for ip in resolver.lookup(&srv.target)? {
						if self.family.keeps(&ip) {
							out.push((SocketAddr::new(ip, srv.port), srv.weight.max(1) as u32));
						}
					}
				}
				Ok(out)
			},
			mode => {
				let mut addrs: Vec<IpAddr> = resolver
					.lookup(&self.hostname)?
					.into_iter()
					.filter(|ip| self.family.keeps(ip))
					.collect();
				if mode == ResolveMode::First {
					addrs.truncate(1);
				}
				Ok(
					addrs
						.into_iter()
						.map(|ip| (SocketAddr::new(ip, self.port), self.weight))
						.collect(),
				)
			},
		}
	}

	/// One resolve cycle: create backends for new addresses, retire the
	/// ones that disappeared, and restore the balancer-list invariant.
	pub fn refresh(&self, resolver: &dyn Resolve) -> Result<(), ResolveError> {
		let desired = self.desired(resolver)?;
		let mut created = self.created.lock().expect("matrix state poisoned");
		let mut st = self.service.state();
		let list = if self.emergency {
			&mut st.emergency
		} else {
			&mut st.normal
		};

		// retire what the resolver no longer returns
		let (keep, gone): (Vec<_>, Vec<_>) = created
			.drain(..)
			.partition(|be| desired.iter().any(|(a, _)| Some(*a) == be.addr()));
		for be in &gone {
			debug!(host = %self.hostname, addr = ?be.addr(), "retiring resolved backend");
			be.retired.store(true, Ordering::Relaxed);
			list.backends.retain(|b| !Arc::ptr_eq(b, be));
		}
		*created = keep;

		// add what is new
		for (addr, weight) in desired {
			if created.iter().any(|be| be.addr() == Some(addr)) {
				continue;
			}
			let tls = match &self.tls {
				Some(t) => {
					match crate::transport::tls::build_backend_client(t.sni.is_some()) {
						Ok(config) => Some(BackendTls {
							config,
							sni: t.sni.clone(),
						}),
						Err(e) => {
							warn!(host = %self.hostname, "backend tls config: {e}");
							None
						},
					}
				},
				None => None,
			};
			let be = Arc::new(Backend::proxy(
				Some(format!("{}:{}", self.hostname, addr)),
				weight,
				RegularTarget {
					addr,
					host: Some(self.hostname.clone()),
					conn_to: self.conn_to,
					io_to: self.io_to,
					ws_to: self.ws_to,
					tls,
					alive: AtomicBool::new(true),
				},
			));
			debug!(host = %self.hostname, %addr, "adding resolved backend");
			list.backends.push(be.clone());
			created.push(be);
		}
		list.rebuild();
		Ok(())
	}
}

/// Run each matrix's resolve loop on its own thread. Immediate-mode
/// matrices resolve once and the thread exits; the rest re-resolve every
/// `interval` until shutdown.
pub fn spawn_refresh_loops(
	matrices: Vec<Arc<Matrix>>,
	resolver: Arc<dyn Resolve>,
	shutdown: Arc<AtomicBool>,
) -> Vec<std::thread::JoinHandle<()>> {
	matrices
		.into_iter()
		.map(|matrix| {
			let resolver = resolver.clone();
			let shutdown = shutdown.clone();
			std::thread::Builder::new()
				.name(format!("resolve-{}", matrix.hostname))
				.spawn(move || {
					loop {
						if let Err(e) = matrix.refresh(resolver.as_ref()) {
							warn!(host = %matrix.hostname, "resolve failed: {e}");
						}
						if matrix.mode == ResolveMode::Immediate {
							return;
						}
						let mut slept = Duration::ZERO;
						while slept < matrix.interval {
							if shutdown.load(Ordering::Relaxed) {
								return;
							}
							let step = Duration::from_millis(500).min(matrix.interval - slept);
							std::thread::sleep(step);
							slept += step;
						}
						if shutdown.load(Ordering::Relaxed) {
							return;
						}
					}
				})
				.expect("spawning resolver thread")
		})
		.collect()
}
