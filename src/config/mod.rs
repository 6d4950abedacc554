use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use crate::client::dns::{AddrFamily, Matrix, MatrixTls, ResolveMode};
use crate::route::acl::Acl;
use crate::route::auth::PasswdFile;
use crate::route::matcher::{
	BoolOp, Condition, MatchKind, Pattern, Submatches, load_pattern_file,
};
use crate::route::rewrite::{RewriteOp, RewriteRule, Template};
use crate::route::session::{SessionConfig, SessionKind};
use crate::route::{
	Backend, BackendKind, BackendTls, BalanceAlgo, BalancerList, Listener, Redirect,
	RegularTarget, Runtime, Service, ServiceState, WorkerSettings,
};
use crate::route::session::SessionTable;
use crate::telemetry::log::LogFormat;
use crate::telemetry::metrics::Metrics;
use crate::transport::tls::{ClientVerify, build_backend_client, build_server};

// defaults, in seconds
const DEFAULT_CLIENT_TO: u64 = 10;
const DEFAULT_BACKEND_TO: u64 = 15;
const DEFAULT_WS_TO: u64 = 600;
const DEFAULT_GRACE: u64 = 30;
const DEFAULT_SESSION_TTL: u64 = 300;
const DEFAULT_MATRIX_INTERVAL: u64 = 30;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct RawConfig {
	#[serde(default)]
	pub anonymise: bool,
	pub grace: Option<u64>,
	#[serde(default)]
	pub workers: RawWorkers,
	#[serde(default)]
	pub acls: HashMap<String, Vec<String>>,
	/// Named backend templates, resolvable with `use:`.
	#[serde(default)]
	pub backends: HashMap<String, RawBackend>,
	#[serde(default)]
	pub listeners: Vec<RawListener>,
	/// Services consulted after every listener's own list.
	#[serde(default)]
	pub services: Vec<RawService>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct RawWorkers {
	pub min: usize,
	pub max: usize,
	pub idle_timeout: u64,
	pub queue: usize,
}

impl Default for RawWorkers {
	fn default() -> Self {
		let d = WorkerSettings::default();
		RawWorkers {
			min: d.min,
			max: d.max,
			idle_timeout: d.idle_timeout.as_secs(),
			queue: d.queue,
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct RawListener {
	pub name: Option<String>,
	pub address: SocketAddr,
	pub tls: Option<RawListenerTls>,
	pub client_timeout: Option<u64>,
	pub websocket_timeout: Option<u64>,
	pub url_pattern: Option<RawPattern>,
	#[serde(default)]
	pub max_request_size: u64,
	#[serde(default)]
	pub xhttp: u8,
	#[serde(default)]
	pub rewrite_location: Option<u8>,
	#[serde(default)]
	pub rewrite_destination: bool,
	#[serde(default)]
	pub no_https11: bool,
	#[serde(default)]
	pub add_headers: Vec<String>,
	pub log_format: Option<String>,
	#[serde(default)]
	pub error_bodies: HashMap<u16, String>,
	#[serde(default)]
	pub rewrite: Vec<RawRewriteRule>,
	#[serde(default)]
	pub response_rewrite: Vec<RawRewriteRule>,
	#[serde(default)]
	pub services: Vec<RawService>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct RawListenerTls {
	pub certificates: Vec<RawCertPair>,
	#[serde(default)]
	pub client_verify: RawClientVerify,
	pub ca: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct RawCertPair {
	pub cert: PathBuf,
	pub key: PathBuf,
}

#[derive(Debug, Default, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RawClientVerify {
	#[default]
	None,
	Optional,
	Required,
	Request,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct RawService {
	pub name: Option<String>,
	#[serde(default)]
	pub disabled: bool,
	#[serde(default, rename = "match")]
	pub conditions: Vec<RawCondition>,
	pub session: Option<RawSession>,
	#[serde(default)]
	pub balancer: RawBalancer,
	pub forwarded_for: Option<String>,
	#[serde(default)]
	pub trusted_ips: Vec<String>,
	/// Status classes (1-5) whose log lines are dropped.
	#[serde(default)]
	pub log_suppress: Vec<u8>,
	#[serde(default)]
	pub rewrite: Vec<RawRewriteRule>,
	#[serde(default)]
	pub response_rewrite: Vec<RawRewriteRule>,
	#[serde(default)]
	pub backends: Vec<RawBackend>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawBalancer {
	#[default]
	Random,
	Iwrr,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct RawSession {
	#[serde(rename = "type")]
	pub kind: RawSessionKind,
	#[serde(default)]
	pub id: String,
	pub ttl: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawSessionKind {
	None,
	Ip,
	Cookie,
	Url,
	Param,
	Basic,
	Header,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct RawBackend {
	pub name: Option<String>,
	// regular
	pub address: Option<SocketAddr>,
	// matrix
	pub host: Option<String>,
	pub port: Option<u16>,
	pub family: Option<RawFamily>,
	pub resolve: Option<RawResolveMode>,
	pub interval: Option<u64>,
	// reference to a named template
	#[serde(rename = "use")]
	pub use_named: Option<String>,
	// terminals
	pub redirect: Option<RawRedirect>,
	pub error: Option<RawErrorBackend>,
	pub acme: Option<PathBuf>,
	#[serde(default)]
	pub control: bool,
	#[serde(default)]
	pub metrics: bool,
	// common
	pub weight: Option<u32>,
	#[serde(default)]
	pub emergency: bool,
	#[serde(default)]
	pub disabled: bool,
	pub timeouts: Option<RawTimeouts>,
	pub tls: Option<RawBackendTls>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawFamily {
	Any,
	V4,
	V6,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawResolveMode {
	Immediate,
	First,
	All,
	Srv,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct RawRedirect {
	pub status: Option<u16>,
	pub to: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct RawErrorBackend {
	pub status: u16,
	#[serde(default)]
	pub body: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct RawTimeouts {
	pub connect: Option<u64>,
	pub io: Option<u64>,
	pub websocket: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct RawBackendTls {
	#[serde(default)]
	pub sni: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct RawCondition {
	pub all: Option<Vec<RawCondition>>,
	pub any: Option<Vec<RawCondition>>,
	pub not: Option<Box<RawCondition>>,
	pub acl: Option<RawAclRef>,
	pub url: Option<RawPattern>,
	pub path: Option<RawPattern>,
	pub query: Option<RawPattern>,
	pub query_param: Option<RawNamedPattern>,
	pub header: Option<RawPattern>,
	pub host: Option<RawPattern>,
	pub basic_auth: Option<PathBuf>,
	pub string_match: Option<RawStringMatch>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawAclRef {
	Named(String),
	Inline(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawPattern {
	Simple(String),
	Detailed {
		#[serde(default)]
		pattern: Option<String>,
		#[serde(default)]
		file: Option<PathBuf>,
		#[serde(default, rename = "type")]
		kind: RawMatchKind,
		#[serde(default = "default_true")]
		ignore_case: bool,
	},
}

fn default_true() -> bool {
	true
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawMatchKind {
	#[default]
	Posix,
	Pcre,
	Regex,
	Exact,
	Prefix,
	Suffix,
	Contain,
}

impl RawMatchKind {
	fn kind(self) -> MatchKind {
		match self {
			RawMatchKind::Posix | RawMatchKind::Pcre | RawMatchKind::Regex => MatchKind::Regex,
			RawMatchKind::Exact => MatchKind::Exact,
			RawMatchKind::Prefix => MatchKind::Prefix,
			RawMatchKind::Suffix => MatchKind::Suffix,
			RawMatchKind::Contain => MatchKind::Contain,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct RawNamedPattern {
	pub name: String,
	pub pattern: RawPattern,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct RawStringMatch {
	pub value: String,
	pub pattern: RawPattern,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct RawRewriteRule {
	#[serde(rename = "if")]
	pub cond: Option<RawCondition>,
	#[serde(default)]
	pub ops: Vec<RawRewriteOp>,
	#[serde(default, rename = "else")]
	pub else_ops: Vec<RawRewriteOp>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawRewriteOp {
	SetHeader(String),
	DeleteHeader(String),
	SetUrl(String),
	SetPath(String),
	SetQuery(String),
	SetQueryParam { name: String, value: String },
	Rules(RawRewriteRule),
}

pub fn load(path: &Path) -> anyhow::Result<RawConfig> {
	let contents = std::fs::read_to_string(path)
		.with_context(|| format!("reading {}", path.display()))?;
	parse(&contents).with_context(|| format!("in {}", path.display()))
}

pub fn parse(contents: &str) -> anyhow::Result<RawConfig> {
	Ok(serde_yaml::from_str(contents)?)
}

/// Compile the raw tree into the runtime snapshot plus the matrix backends
/// whose resolve loops the application must spawn.
pub fn build(raw: RawConfig) -> anyhow::Result<(Arc<Runtime>, Vec<Arc<Matrix>>)> {
	let mut acls: HashMap<String, Arc<Acl>> = HashMap::new();
	for (name, cidrs) in &raw.acls {
		let acl = Acl::parse(Some(name.clone()), cidrs)
			.with_context(|| format!("acl {name:?}"))?;
		acls.insert(name.clone(), Arc::new(acl));
	}

	let mut matrices = Vec::new();
	let mut global_services = Vec::new();
	for (i, rs) in raw.services.iter().enumerate() {
		let svc = build_service(rs, i, "service", &acls, &raw.backends, &mut matrices)?;
		global_services.push(svc);
	}

	let mut listeners = Vec::new();
	for (i, rl) in raw.listeners.iter().enumerate() {
		listeners.push(build_listener(rl, i, &acls, &raw.backends, &mut matrices)?);
	}
	if listeners.is_empty() {
		bail!("configuration defines no listeners");
	}

	let runtime = Arc::new(Runtime {
		listeners,
		global_services,
		worker: WorkerSettings {
			min: raw.workers.min.max(1),
			max: raw.workers.max.max(raw.workers.min.max(1)),
			idle_timeout: Duration::from_secs(raw.workers.idle_timeout),
			queue: raw.workers.queue.max(1),
		},
		anonymise: raw.anonymise,
		grace: Duration::from_secs(raw.grace.unwrap_or(DEFAULT_GRACE)),
		metrics: Arc::new(Metrics::new()),
	});
	Ok((runtime, matrices))
}

fn build_listener(
	rl: &RawListener,
	index: usize,
	acls: &HashMap<String, Arc<Acl>>,
	named: &HashMap<String, RawBackend>,
	matrices: &mut Vec<Arc<Matrix>>,
) -> anyhow::Result<Arc<Listener>> {
	let name = rl
		.name
		.clone()
		.unwrap_or_else(|| format!("listener-{index}"));
	let scope = format!("listener {name:?}");

	let tls = match &rl.tls {
		Some(t) => {
			let mut pairs = Vec::new();
			for pair in &t.certificates {
				let cert = std::fs::read(&pair.cert)
					.with_context(|| format!("{scope}: reading {}", pair.cert.display()))?;
				let key = std::fs::read(&pair.key)
					.with_context(|| format!("{scope}: reading {}", pair.key.display()))?;
				pairs.push((cert, key));
			}
			let verify = match t.client_verify {
				RawClientVerify::None => ClientVerify::None,
				RawClientVerify::Optional => ClientVerify::Optional,
				RawClientVerify::Required => ClientVerify::Required,
				RawClientVerify::Request => ClientVerify::Request,
			};
			let ca = match &t.ca {
				Some(p) => Some(
					std::fs::read(p).with_context(|| format!("{scope}: reading {}", p.display()))?,
				),
				None => None,
			};
			Some(Arc::new(
				build_server(&pairs, verify, ca.as_deref()).context(scope.clone())?,
			))
		},
		None => None,
	};

	let url_pattern = match &rl.url_pattern {
		Some(p) => Some(build_pattern(p, false).context(scope.clone())?),
		None => None,
	};

	let mut services = Vec::new();
	for (i, rs) in rl.services.iter().enumerate() {
		services.push(build_service(rs, i, &name, acls, named, matrices)?);
	}

	let log_format = LogFormat::resolve(rl.log_format.as_deref().unwrap_or("regular"))
		.map_err(|e| anyhow::anyhow!("{scope}: {e}"))?;

	Ok(Arc::new(Listener {
		name,
		addr: rl.address,
		tls,
		client_to: Duration::from_secs(rl.client_timeout.unwrap_or(DEFAULT_CLIENT_TO)),
		ws_to: Duration::from_secs(rl.websocket_timeout.unwrap_or(DEFAULT_WS_TO)),
		url_pattern,
		max_req: rl.max_request_size,
		xhttp: rl.xhttp.min(4),
		rewr_loc: rl.rewrite_location.unwrap_or(1).min(2),
		rewr_dest: rl.rewrite_destination,
		no_https11: rl.no_https11,
		extra_headers: rl.add_headers.clone(),
		rewrite: build_rules(&rl.rewrite, acls)?,
		resp_rewrite: build_rules(&rl.response_rewrite, acls)?,
		err_bodies: rl.error_bodies.clone(),
		services,
		log_format: Arc::new(log_format),
	}))
}

fn build_service(
	rs: &RawService,
	index: usize,
	scope: &str,
	acls: &HashMap<String, Arc<Acl>>,
	named: &HashMap<String, RawBackend>,
	matrices: &mut Vec<Arc<Matrix>>,
) -> anyhow::Result<Arc<Service>> {
	let name = rs
		.name
		.clone()
		.unwrap_or_else(|| format!("{scope}-svc-{index}"));
	let ctx = format!("service {name:?}");

	let mut conds = Vec::new();
	for rc in &rs.conditions {
		conds.push(build_condition(rc, acls).context(ctx.clone())?);
	}

	let session = match &rs.session {
		Some(s) => SessionConfig {
			kind: match s.kind {
				RawSessionKind::None => SessionKind::None,
				RawSessionKind::Ip => SessionKind::Ip,
				RawSessionKind::Cookie => SessionKind::Cookie,
				RawSessionKind::Url => SessionKind::Url,
				RawSessionKind::Param => SessionKind::Param,
				RawSessionKind::Basic => SessionKind::Basic,
				RawSessionKind::Header => SessionKind::Header,
			},
			id: s.id.clone(),
			ttl: Duration::from_secs(s.ttl.unwrap_or(DEFAULT_SESSION_TTL)),
		},
		None => SessionConfig::default(),
	};
	if matches!(
		session.kind,
		SessionKind::Cookie | SessionKind::Url | SessionKind::Param | SessionKind::Header
	) && session.id.is_empty()
	{
		bail!("{ctx}: session type requires an id");
	}

	let trusted_ips = if rs.trusted_ips.is_empty() {
		None
	} else {
		Some(Acl::parse(None, &rs.trusted_ips).with_context(|| format!("{ctx}: trusted_ips"))?)
	};

	let mut log_suppress = 0u8;
	for class in &rs.log_suppress {
		if !(1..=5).contains(class) {
			bail!("{ctx}: log_suppress classes are 1-5");
		}
		log_suppress |= 1 << (class - 1);
	}

	let svc = Arc::new(Service {
		name,
		disabled: AtomicBool::new(rs.disabled),
		conds,
		rewrite: build_rules(&rs.rewrite, acls)?,
		resp_rewrite: build_rules(&rs.response_rewrite, acls)?,
		session,
		algo: match rs.balancer {
			RawBalancer::Random => BalanceAlgo::Random,
			RawBalancer::Iwrr => BalanceAlgo::Iwrr,
		},
		forwarded_for: rs
			.forwarded_for
			.clone()
			.unwrap_or_else(|| "X-Forwarded-For".to_string()),
		trusted_ips,
		log_suppress,
		state: Mutex::new(ServiceState {
			normal: BalancerList::default(),
			emergency: BalancerList::default(),
			sessions: SessionTable::default(),
		}),
	});

	let mut normal = Vec::new();
	let mut emergency = Vec::new();
	for (i, rb) in rs.backends.iter().enumerate() {
		let rb = resolve_named(rb, named, &ctx)?;
		match build_backend(&rb, i, &ctx, &svc, matrices)? {
			Some(be) => {
				if rb.emergency {
					emergency.push(be);
				} else {
					normal.push(be);
				}
			},
			// matrix backends materialize through the resolver
			None => {},
		}
	}
	{
		let mut st = svc.state();
		st.normal = BalancerList::new(normal);
		st.emergency = BalancerList::new(emergency);
	}
	Ok(svc)
}

/// Resolve a `use:` reference against the named templates, keeping local
/// overrides for weight/emergency/disabled.
fn resolve_named(
	rb: &RawBackend,
	named: &HashMap<String, RawBackend>,
	ctx: &str,
) -> anyhow::Result<RawBackend> {
	let Some(name) = &rb.use_named else {
		return Ok(rb.clone());
	};
	let template = named
		.get(name)
		.with_context(|| format!("{ctx}: unknown backend template {name:?}"))?;
	let mut merged = template.clone();
	merged.name = merged.name.or_else(|| Some(name.clone()));
	if rb.weight.is_some() {
		merged.weight = rb.weight;
	}
	merged.emergency = rb.emergency;
	merged.disabled = merged.disabled || rb.disabled;
	Ok(merged)
}

/// Build one backend. Matrix backends return None here; they register a
/// resolver entry instead.
fn build_backend(
	rb: &RawBackend,
	index: usize,
	ctx: &str,
	svc: &Arc<Service>,
	matrices: &mut Vec<Arc<Matrix>>,
) -> anyhow::Result<Option<Arc<Backend>>> {
	let weight = rb.weight.unwrap_or(5);
	let timeouts = rb.timeouts.unwrap_or(RawTimeouts {
		connect: None,
		io: None,
		websocket: None,
	});
	let conn_to = Duration::from_secs(timeouts.connect.unwrap_or(DEFAULT_BACKEND_TO));
	let io_to = Duration::from_secs(timeouts.io.unwrap_or(DEFAULT_BACKEND_TO));
	let ws_to = Duration::from_secs(timeouts.websocket.unwrap_or(DEFAULT_WS_TO));

	let variants = [
		rb.address.is_some(),
		rb.host.is_some(),
		rb.redirect.is_some(),
		rb.error.is_some(),
		rb.acme.is_some(),
		rb.control,
		rb.metrics,
	];
	if variants.iter().filter(|v| **v).count() != 1 {
		bail!("{ctx}: backend {index} must be exactly one of address/host/redirect/error/acme/control/metrics");
	}

	let backend = if let Some(addr) = rb.address {
		let tls = match &rb.tls {
			Some(t) => Some(BackendTls {
				config: build_backend_client(t.sni.is_some())?,
				sni: t.sni.clone(),
			}),
			None => None,
		};
		Backend::proxy(
			rb.name.clone(),
			weight,
			RegularTarget {
				addr,
				host: None,
				conn_to,
				io_to,
				ws_to,
				tls,
				alive: AtomicBool::new(true),
			},
		)
	} else if let Some(host) = &rb.host {
		let port = rb
			.port
			.with_context(|| format!("{ctx}: backend {index}: host requires port"))?;
		matrices.push(Arc::new(Matrix::new(
			svc.clone(),
			rb.emergency,
			host.clone(),
			port,
			match rb.family.unwrap_or(RawFamily::Any) {
				RawFamily::Any => AddrFamily::Any,
				RawFamily::V4 => AddrFamily::V4,
				RawFamily::V6 => AddrFamily::V6,
			},
			match rb.resolve.unwrap_or(RawResolveMode::All) {
				RawResolveMode::Immediate => ResolveMode::Immediate,
				RawResolveMode::First => ResolveMode::First,
				RawResolveMode::All => ResolveMode::All,
				RawResolveMode::Srv => ResolveMode::Srv,
			},
			Duration::from_secs(rb.interval.unwrap_or(DEFAULT_MATRIX_INTERVAL)),
			weight,
			conn_to,
			io_to,
			ws_to,
			rb.tls.as_ref().map(|t| MatrixTls { sni: t.sni.clone() }),
		)));
		return Ok(None);
	} else if let Some(r) = &rb.redirect {
		let status = r.status.unwrap_or(302);
		if !matches!(status, 301 | 302 | 303 | 307 | 308) {
			bail!("{ctx}: backend {index}: redirect status must be 301/302/303/307/308");
		}
		Backend::terminal(
			rb.name.clone(),
			weight,
			BackendKind::Redirect(Redirect {
				status,
				template: Template::compile(&r.to),
				has_uri: redirect_has_uri(&r.to),
			}),
		)
	} else if let Some(e) = &rb.error {
		Backend::terminal(
			rb.name.clone(),
			weight,
			BackendKind::Error {
				status: e.status,
				body: e.body.clone(),
			},
		)
	} else if let Some(dir) = &rb.acme {
		if !dir.is_dir() {
			bail!("{ctx}: backend {index}: acme path {} is not a directory", dir.display());
		}
		Backend::terminal(rb.name.clone(), weight, BackendKind::Acme { root: dir.clone() })
	} else if rb.control {
		Backend::terminal(rb.name.clone(), weight, BackendKind::Control)
	} else {
		Backend::terminal(rb.name.clone(), weight, BackendKind::Metrics)
	};
	if rb.disabled {
		backend
			.disabled
			.store(true, std::sync::atomic::Ordering::Relaxed);
	}
	Ok(Some(Arc::new(backend)))
}

/// Whether a redirect target carries its own path (nothing gets appended).
fn redirect_has_uri(target: &str) -> bool {
	match target.split_once("://") {
		Some((_, rest)) => rest.contains('/'),
		None => true,
	}
}

fn build_rules(
	raw: &[RawRewriteRule],
	acls: &HashMap<String, Arc<Acl>>,
) -> anyhow::Result<Vec<RewriteRule>> {
	raw.iter().map(|r| build_rule(r, acls)).collect()
}

fn build_rule(
	raw: &RawRewriteRule,
	acls: &HashMap<String, Arc<Acl>>,
) -> anyhow::Result<RewriteRule> {
	let cond = match &raw.cond {
		Some(c) => Some(build_condition(c, acls)?),
		None => None,
	};
	Ok(RewriteRule {
		cond,
		ops: build_ops(&raw.ops, acls)?,
		else_ops: build_ops(&raw.else_ops, acls)?,
	})
}

fn build_ops(
	raw: &[RawRewriteOp],
	acls: &HashMap<String, Arc<Acl>>,
) -> anyhow::Result<Vec<RewriteOp>> {
	raw
		.iter()
		.map(|op| {
			Ok(match op {
				RawRewriteOp::SetHeader(t) => RewriteOp::SetHeader(Template::compile(t)),
				RawRewriteOp::DeleteHeader(p) => {
					RewriteOp::DelHeader(Pattern::compile(MatchKind::Regex, p, true)?)
				},
				RawRewriteOp::SetUrl(t) => RewriteOp::SetUrl(Template::compile(t)),
				RawRewriteOp::SetPath(t) => RewriteOp::SetPath(Template::compile(t)),
				RawRewriteOp::SetQuery(t) => RewriteOp::SetQuery(Template::compile(t)),
				RawRewriteOp::SetQueryParam { name, value } => RewriteOp::SetQueryParam {
					name: name.clone(),
					value: Template::compile(value),
				},
				RawRewriteOp::Rules(r) => RewriteOp::SubRule(build_rule(r, acls)?),
			})
		})
		.collect()
}

fn build_pattern(raw: &RawPattern, host: bool) -> anyhow::Result<Pattern> {
	match raw {
		RawPattern::Simple(p) => Ok(if host {
			Pattern::compile_host(MatchKind::Regex, p, true)?
		} else {
			Pattern::compile(MatchKind::Regex, p, true)?
		}),
		RawPattern::Detailed {
			pattern: Some(p),
			file: None,
			kind,
			ignore_case,
		} => Ok(if host {
			Pattern::compile_host(kind.kind(), p, *ignore_case)?
		} else {
			Pattern::compile(kind.kind(), p, *ignore_case)?
		}),
		RawPattern::Detailed { .. } => {
			bail!("pattern needs exactly one of pattern/file (file expands to an OR condition)")
		},
	}
}

/// A pattern that may be a file of patterns; those become OR nodes.
fn build_pattern_cond(
	raw: &RawPattern,
	host: bool,
	leaf: impl Fn(Pattern) -> Condition,
) -> anyhow::Result<Condition> {
	if let RawPattern::Detailed {
		pattern: None,
		file: Some(path),
		kind,
		ignore_case,
	} = raw
	{
		let pats = load_pattern_file(path, kind.kind(), *ignore_case, host)
			.with_context(|| format!("pattern file {}", path.display()))?;
		if pats.is_empty() {
			bail!("pattern file {} contains no patterns", path.display());
		}
		return Ok(Condition::Bool {
			op: BoolOp::Or,
			children: pats.into_iter().map(&leaf).collect(),
		});
	}
	Ok(leaf(build_pattern(raw, host)?))
}

fn build_condition(
	raw: &RawCondition,
	acls: &HashMap<String, Arc<Acl>>,
) -> anyhow::Result<Condition> {
	let mut out: Vec<Condition> = Vec::new();
	if let Some(children) = &raw.all {
		out.push(Condition::Bool {
			op: BoolOp::And,
			children: children
				.iter()
				.map(|c| build_condition(c, acls))
				.collect::<anyhow::Result<_>>()?,
		});
	}
	if let Some(children) = &raw.any {
		out.push(Condition::Bool {
			op: BoolOp::Or,
			children: children
				.iter()
				.map(|c| build_condition(c, acls))
				.collect::<anyhow::Result<_>>()?,
		});
	}
	if let Some(child) = &raw.not {
		out.push(Condition::Bool {
			op: BoolOp::Not,
			children: vec![build_condition(child, acls)?],
		});
	}
	if let Some(aref) = &raw.acl {
		let acl = match aref {
			RawAclRef::Named(name) => acls
				.get(name)
				.with_context(|| format!("unknown acl {name:?}"))?
				.clone(),
			RawAclRef::Inline(cidrs) => Arc::new(Acl::parse(None, cidrs)?),
		};
		out.push(Condition::Acl(acl));
	}
	if let Some(p) = &raw.url {
		out.push(build_pattern_cond(p, false, Condition::Url)?);
	}
	if let Some(p) = &raw.path {
		out.push(build_pattern_cond(p, false, Condition::Path)?);
	}
	if let Some(p) = &raw.query {
		out.push(build_pattern_cond(p, false, Condition::Query)?);
	}
	if let Some(np) = &raw.query_param {
		let pat = build_pattern(&np.pattern, false)?;
		out.push(Condition::QueryParam {
			name: np.name.clone(),
			pat,
		});
	}
	if let Some(p) = &raw.header {
		out.push(build_pattern_cond(p, false, Condition::Header)?);
	}
	if let Some(p) = &raw.host {
		out.push(build_pattern_cond(p, true, Condition::Host)?);
	}
	if let Some(path) = &raw.basic_auth {
		let pf = PasswdFile::load(path)
			.with_context(|| format!("password file {}", path.display()))?;
		out.push(Condition::BasicAuth(Arc::new(pf)));
	}
	if let Some(sm) = &raw.string_match {
		let pat = build_pattern(&sm.pattern, false)?;
		out.push(Condition::StringMatch {
			template: Template::compile(&sm.value),
			pat,
		});
	}
	match out.len() {
		0 => bail!("empty condition"),
		1 => Ok(out.pop().expect("len checked")),
		_ => Ok(Condition::Bool {
			op: BoolOp::And,
			children: out,
		}),
	}
}

/// Sanity helper for `--validate-only`: evaluate every service condition
/// against a probe request so obviously broken regexes surface at startup.
pub fn validate(runtime: &Runtime) -> anyhow::Result<()> {
	let probe = crate::http::Request {
		method: crate::http::Method::Get,
		method_token: "GET".into(),
		version_minor: 1,
		url: "/".into(),
		decoded: "/".into(),
		headers: vec![],
		basic_user: None,
		basic_pass: None,
	};
	let mut subs = Submatches::new();
	for listener in &runtime.listeners {
		for svc in &listener.services {
			let _ = svc.matches(&probe, listener.addr.ip(), &mut subs);
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &str = r#"
anonymise: true
workers: { min: 2, max: 8, idle_timeout: 60, queue: 16 }
acls:
  office: ["192.0.2.0/24"]
backends:
  shared:
    address: "10.0.0.9:8080"
    weight: 2
listeners:
  - name: web
    address: "0.0.0.0:8080"
    xhttp: 2
    log_format: combined
    add_headers: ["X-Edge: front"]
    error_bodies:
      503: "<html>down</html>"
    services:
      - name: app
        match:
          - host: "example.org"
          - path: { pattern: "/api", type: prefix }
        balancer: iwrr
        session: { type: cookie, id: JSESSIONID, ttl: 120 }
        log_suppress: [2]
        backends:
          - address: "10.0.0.1:8080"
            weight: 1
          - address: "10.0.0.2:8080"
            weight: 3
            emergency: true
          - use: shared
      - name: redirector
        match:
          - url: "^/foo/(.*)"
        backends:
          - redirect: { status: 302, to: "https://example.com/$1" }
services:
  - name: fallback
    backends:
      - error: { status: 503, body: "everything is on fire" }
      - control: true
        emergency: true
"#;

	#[test]
	fn sample_config_builds() {
		let raw = parse(SAMPLE).unwrap();
		let (rt, matrices) = build(raw).unwrap();
		assert!(matrices.is_empty());
		assert_eq!(rt.listeners.len(), 1);
		let l = &rt.listeners[0];
		assert_eq!(l.name, "web");
		assert_eq!(l.xhttp, 2);
		assert_eq!(l.err_bodies[&503], "<html>down</html>");
		assert_eq!(l.services.len(), 2);

		let app = &l.services[0];
		assert_eq!(app.session.id, "JSESSIONID");
		assert!(app.suppresses(204));
		{
			let st = app.state();
			assert_eq!(st.normal.backends.len(), 2);
			assert_eq!(st.emergency.backends.len(), 1);
			// named template carried its weight
			assert_eq!(st.normal.backends[1].priority, 2);
			assert_eq!(st.normal.tot_pri, 3);
		}

		assert_eq!(rt.global_services.len(), 1);
		assert!(rt.worker.min == 2 && rt.worker.max == 8);
		assert!(rt.anonymise);
		validate(&rt).unwrap();
	}

	#[test]
	fn matrix_backend_registers_resolver() {
		let yaml = r#"
listeners:
  - address: "127.0.0.1:8080"
    services:
      - backends:
          - host: app.internal
            port: 9000
            resolve: srv
            interval: 10
"#;
		let (rt, matrices) = build(parse(yaml).unwrap()).unwrap();
		assert_eq!(matrices.len(), 1);
		assert_eq!(matrices[0].hostname, "app.internal");
		assert_eq!(matrices[0].port, 9000);
		assert_eq!(rt.listeners[0].services[0].state().normal.backends.len(), 0);
	}

	#[test]
	fn conflicting_backend_variants_rejected() {
		let yaml = r#"
listeners:
  - address: "127.0.0.1:8080"
    services:
      - backends:
          - address: "10.0.0.1:80"
            control: true
"#;
		assert!(build(parse(yaml).unwrap()).is_err());
	}

	#[test]
	fn session_id_required() {
		let yaml = r#"
listeners:
  - address: "127.0.0.1:8080"
    services:
      - session: { type: cookie }
        backends:
          - address: "10.0.0.1:80"
"#;
		assert!(build(parse(yaml).unwrap()).is_err());
	}

	#[test]
	fn redirect_has_uri_detection() {
		assert!(redirect_has_uri("https://example.com/path"));
		assert!(redirect_has_uri("https://example.com/$1"));
		assert!(!redirect_has_uri("https://example.com"));
		assert!(redirect_has_uri("/local/path"));
	}

	#[test]
	fn rewrite_rules_parse() {
		let yaml = r#"
listeners:
  - address: "127.0.0.1:8080"
    rewrite:
      - if: { path: { pattern: "^/old/(.*)", type: regex } }
        ops:
          - set_path: "/new/$1"
          - set_header: "X-Rewritten: 1"
        else:
          - delete_header: "^X-Legacy"
    services:
      - backends:
          - address: "10.0.0.1:80"
"#;
		let (rt, _) = build(parse(yaml).unwrap()).unwrap();
		assert_eq!(rt.listeners[0].rewrite.len(), 1);
		let rule = &rt.listeners[0].rewrite[0];
		assert!(rule.cond.is_some());
		assert_eq!(rule.ops.len(), 2);
		assert_eq!(rule.else_ops.len(), 1);
	}
}
