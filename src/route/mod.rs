pub mod acl;
pub mod auth;
pub mod matcher;
pub mod rewrite;
pub mod select;
pub mod session;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::route::acl::Acl;
use crate::route::matcher::{Condition, MatchCtx, Pattern, Submatches};
use crate::route::rewrite::{RewriteRule, Template};
use crate::route::session::{SessionConfig, SessionTable};
use crate::telemetry::log::LogFormat;
use crate::telemetry::metrics::Metrics;

/// Client-side TLS material for one backend.
#[derive(Clone)]
pub struct BackendTls {
	pub config: Arc<rustls::ClientConfig>,
	pub sni: Option<String>,
}

impl std::fmt::Debug for BackendTls {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BackendTls").field("sni", &self.sni).finish()
	}
}

/// A dialable upstream address with its timeouts and liveness bit.
#[derive(Debug)]
pub struct RegularTarget {
	pub addr: SocketAddr,
	/// Configured hostname, when the address came from a name. Used for
	/// Location rewriting.
	pub host: Option<String>,
	pub conn_to: Duration,
	pub io_to: Duration,
	pub ws_to: Duration,
	pub tls: Option<BackendTls>,
	pub alive: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct Redirect {
	pub status: u16,
	pub template: Template,
	/// Whether the target already carries a path; if not, the request path
	/// is appended.
	pub has_uri: bool,
}

#[derive(Debug)]
pub enum BackendKind {
	Proxy(RegularTarget),
	Redirect(Redirect),
	Acme { root: PathBuf },
	Error { status: u16, body: String },
	Control,
	Metrics,
}

#[derive(Debug)]
pub struct Backend {
	pub name: Option<String>,
	/// Balancing weight; zero keeps the backend out of rotation.
	pub priority: u32,
	pub disabled: AtomicBool,
	/// Set when a resolver refresh removes a dynamic backend; sessions and
	/// in-flight holders observe it and let the Arc drop.
	pub retired: AtomicBool,
	pub kind: BackendKind,
}

impl Backend {
	pub fn proxy(name: Option<String>, priority: u32, target: RegularTarget) -> Backend {
		Backend {
			name,
			priority,
			disabled: AtomicBool::new(false),
			retired: AtomicBool::new(false),
			kind: BackendKind::Proxy(target),
		}
	}

	pub fn terminal(name: Option<String>, priority: u32, kind: BackendKind) -> Backend {
		Backend {
			name,
			priority,
			disabled: AtomicBool::new(false),
			retired: AtomicBool::new(false),
			kind,
		}
	}

	pub fn target(&self) -> Option<&RegularTarget> {
		match &self.kind {
			BackendKind::Proxy(t) => Some(t),
			_ => None,
		}
	}

	pub fn addr(&self) -> Option<SocketAddr> {
		self.target().map(|t| t.addr)
	}

	pub fn alive(&self) -> bool {
		match &self.kind {
			BackendKind::Proxy(t) => t.alive.load(Ordering::Relaxed),
			_ => true,
		}
	}

	pub fn set_alive(&self, alive: bool) {
		if let BackendKind::Proxy(t) = &self.kind {
			t.alive.store(alive, Ordering::Relaxed);
		}
	}

	pub fn usable(&self) -> bool {
		!self.disabled.load(Ordering::Relaxed)
			&& !self.retired.load(Ordering::Relaxed)
			&& self.alive()
	}

	pub fn is_terminal(&self) -> bool {
		!matches!(self.kind, BackendKind::Proxy(_))
	}

	/// Short form for logs and the control plane.
	pub fn label(&self) -> String {
		if let Some(n) = &self.name {
			return n.clone();
		}
		match &self.kind {
			BackendKind::Proxy(t) => t.addr.to_string(),
			BackendKind::Redirect(r) => format!("redirect:{}", r.template.raw),
			BackendKind::Acme { .. } => "acme".to_string(),
			BackendKind::Error { status, .. } => format!("error:{status}"),
			BackendKind::Control => "control".to_string(),
			BackendKind::Metrics => "metrics".to_string(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalanceAlgo {
	#[default]
	Random,
	Iwrr,
}

/// An ordered bag of backends with cached aggregate weights. The caches are
/// rebuilt whenever membership or liveness changes; between rebuilds they
/// equal the aggregates over enabled, live backends.
#[derive(Debug, Default)]
pub struct BalancerList {
	pub backends: Vec<Arc<Backend>>,
	pub tot_pri: u64,
	pub max_pri: u32,
	pub(crate) cur_pri: u32,
	pub(crate) rr_pos: usize,
}

impl BalancerList {
	pub fn new(backends: Vec<Arc<Backend>>) -> BalancerList {
		let mut list = BalancerList {
			backends,
			..Default::default()
		};
		list.rebuild();
		list
	}

	pub fn rebuild(&mut self) {
		self.tot_pri = 0;
		self.max_pri = 0;
		for be in &self.backends {
			if be.usable() {
				self.tot_pri += be.priority as u64;
				self.max_pri = self.max_pri.max(be.priority);
			}
		}
		self.cur_pri = self.max_pri;
		if self.rr_pos >= self.backends.len() {
			self.rr_pos = 0;
		}
	}
}

pub struct ServiceState {
	pub normal: BalancerList,
	pub emergency: BalancerList,
	pub sessions: SessionTable,
}

pub struct Service {
	pub name: String,
	pub disabled: AtomicBool,
	/// Root condition list; an empty list matches everything (implicit AND).
	pub conds: Vec<Condition>,
	pub rewrite: Vec<RewriteRule>,
	pub resp_rewrite: Vec<RewriteRule>,
	pub session: SessionConfig,
	pub algo: BalanceAlgo,
	/// Header name carrying the client address upstream.
	pub forwarded_for: String,
	/// Clients whose forwarded-for chain is kept rather than replaced.
	pub trusted_ips: Option<Acl>,
	/// Bitmask of suppressed status classes: bit `class - 1`.
	pub log_suppress: u8,
	pub state: Mutex<ServiceState>,
}

impl Service {
	pub fn matches(&self, req: &crate::http::Request, peer: IpAddr, subs: &mut Submatches) -> bool {
		if self.disabled.load(Ordering::Relaxed) {
			return false;
		}
		let mut ctx = MatchCtx { req, peer, subs };
		self.conds.iter().all(|c| c.matches(&mut ctx))
	}

	pub fn state(&self) -> MutexGuard<'_, ServiceState> {
		self.state.lock().expect("service state poisoned")
	}

	/// Connect failure path: atomically clear the liveness bit and restore
	/// the aggregate-weight invariant.
	pub fn kill_backend(&self, be: &Backend) {
		let mut st = self.state();
		be.set_alive(false);
		st.normal.rebuild();
		st.emergency.rebuild();
	}

	pub fn revive_backend(&self, be: &Backend) {
		let mut st = self.state();
		be.set_alive(true);
		st.normal.rebuild();
		st.emergency.rebuild();
	}

	pub fn set_backend_enabled(&self, be: &Backend, enabled: bool) {
		let mut st = self.state();
		be.disabled.store(!enabled, Ordering::Relaxed);
		st.normal.rebuild();
		st.emergency.rebuild();
	}

	pub fn suppresses(&self, status: u16) -> bool {
		let class = (status / 100).clamp(1, 5) as u8;
		self.log_suppress & (1 << (class - 1)) != 0
	}

	pub fn sweep_sessions(&self, now: std::time::Instant) {
		if !self.session.active() {
			return;
		}
		let ttl = self.session.ttl;
		self.state().sessions.sweep(ttl, now);
	}
}

/// How generated `Location` values are rewritten: 0 off, 1 backend
/// addresses, 2 also the listener's own address.
pub type RewriteLocationMode = u8;

pub struct Listener {
	pub name: String,
	pub addr: SocketAddr,
	pub tls: Option<Arc<crate::transport::tls::TlsServer>>,
	pub client_to: Duration,
	pub ws_to: Duration,
	/// Requests whose URL does not match are answered 501.
	pub url_pattern: Option<Pattern>,
	/// Maximum request body size; zero = unlimited.
	pub max_req: u64,
	/// Highest allowed method group.
	pub xhttp: u8,
	pub rewr_loc: RewriteLocationMode,
	pub rewr_dest: bool,
	/// Disable HTTP/1.1 keep-alive for TLS clients.
	pub no_https11: bool,
	/// Literal `Name: value` lines appended to every forwarded request.
	pub extra_headers: Vec<String>,
	pub rewrite: Vec<RewriteRule>,
	pub resp_rewrite: Vec<RewriteRule>,
	pub err_bodies: HashMap<u16, String>,
	pub services: Vec<Arc<Service>>,
	pub log_format: Arc<LogFormat>,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
	pub min: usize,
	pub max: usize,
	pub idle_timeout: Duration,
	pub queue: usize,
}

impl Default for WorkerSettings {
	fn default() -> Self {
		WorkerSettings {
			min: 5,
			max: 128,
			idle_timeout: Duration::from_secs(300),
			queue: 256,
		}
	}
}

/// The read-only configuration snapshot handed to workers. Everything
/// mutable inside it is behind atomics or the per-service mutex.
pub struct Runtime {
	pub listeners: Vec<Arc<Listener>>,
	/// Services consulted after a listener's own list.
	pub global_services: Vec<Arc<Service>>,
	pub worker: WorkerSettings,
	pub anonymise: bool,
	pub grace: Duration,
	pub metrics: Arc<Metrics>,
}

impl Runtime {
	pub fn services_for<'a>(
		&'a self,
		listener: &'a Listener,
	) -> impl Iterator<Item = &'a Arc<Service>> {
		listener.services.iter().chain(self.global_services.iter())
	}

	/// Whether host:port names a proxy backend reachable through this
	/// listener (or, in mode 2, the listener itself). Drives Location
	/// rewriting.
	pub fn known_authority(&self, listener: &Listener, host: &str, port: u16) -> bool {
		let as_ip: Option<IpAddr> = host.parse().ok();
		if listener.rewr_loc >= 2
			&& listener.addr.port() == port
			&& as_ip.is_some_and(|ip| ip == listener.addr.ip())
		{
			return true;
		}
		for svc in self.services_for(listener) {
			let st = svc.state();
			for be in st.normal.backends.iter().chain(st.emergency.backends.iter()) {
				let Some(target) = be.target() else { continue };
				if target.addr.port() != port {
					continue;
				}
				let ip_match = as_ip.is_some_and(|ip| ip == target.addr.ip());
				let name_match = target
					.host
					.as_deref()
					.is_some_and(|h| h.eq_ignore_ascii_case(host));
				if ip_match || name_match {
					return true;
				}
			}
		}
		false
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn target(port: u16) -> RegularTarget {
		RegularTarget {
			addr: SocketAddr::from(([127, 0, 0, 1], port)),
			host: None,
			conn_to: Duration::from_secs(1),
			io_to: Duration::from_secs(1),
			ws_to: Duration::from_secs(1),
			tls: None,
			alive: AtomicBool::new(true),
		}
	}

	#[test]
	fn balancer_caches_track_liveness() {
		let a = Arc::new(Backend::proxy(None, 1, target(9001)));
		let b = Arc::new(Backend::proxy(None, 3, target(9002)));
		let mut list = BalancerList::new(vec![a.clone(), b.clone()]);
		assert_eq!(list.tot_pri, 4);
		assert_eq!(list.max_pri, 3);

		b.set_alive(false);
		list.rebuild();
		assert_eq!(list.tot_pri, 1);
		assert_eq!(list.max_pri, 1);

		b.set_alive(true);
		a.disabled.store(true, Ordering::Relaxed);
		list.rebuild();
		assert_eq!(list.tot_pri, 3);
		assert_eq!(list.max_pri, 3);
	}

	#[test]
	fn log_suppression_mask() {
		let svc = Service {
			name: "s".into(),
			disabled: AtomicBool::new(false),
			conds: vec![],
			rewrite: vec![],
			resp_rewrite: vec![],
			session: SessionConfig::default(),
			algo: BalanceAlgo::Random,
			forwarded_for: "X-Forwarded-For".into(),
			trusted_ips: None,
			log_suppress: 0b10010, // 2xx and 5xx
			state: Mutex::new(ServiceState {
				normal: BalancerList::default(),
				emergency: BalancerList::default(),
				sessions: SessionTable::default(),
			}),
		};
		assert!(svc.suppresses(200));
		assert!(svc.suppresses(503));
		assert!(!svc.suppresses(404));
	}
}
