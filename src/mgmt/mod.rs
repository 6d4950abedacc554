use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::http::Method;
use crate::route::{Backend, Listener, Runtime, Service};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
	Control,
	Metrics,
}

pub struct ControlReply {
	pub status: u16,
	pub content_type: &'static str,
	pub body: String,
}

impl ControlReply {
	fn ok(body: String, content_type: &'static str) -> ControlReply {
		ControlReply {
			status: 200,
			content_type,
			body,
		}
	}

	fn plain(status: u16, body: &str) -> ControlReply {
		ControlReply {
			status,
			content_type: "text/plain",
			body: body.to_string(),
		}
	}
}

pub fn foreach_listener(rt: &Runtime, mut f: impl FnMut(&Arc<Listener>)) {
	for l in &rt.listeners {
		f(l);
	}
}

/// Visit every service exactly once, listeners first, then the globals.
pub fn foreach_service(rt: &Runtime, mut f: impl FnMut(&Arc<Service>)) {
	let mut seen: Vec<*const Service> = Vec::new();
	for l in &rt.listeners {
		for s in &l.services {
			if !seen.contains(&Arc::as_ptr(s)) {
				seen.push(Arc::as_ptr(s));
				f(s);
			}
		}
	}
	for s in &rt.global_services {
		if !seen.contains(&Arc::as_ptr(s)) {
			seen.push(Arc::as_ptr(s));
			f(s);
		}
	}
}

/// Visit a service's backends: normal list, then the emergency list.
pub fn foreach_backend(svc: &Service, mut f: impl FnMut(&Arc<Backend>, bool)) {
	let st = svc.state();
	for be in &st.normal.backends {
		f(be, false);
	}
	for be in &st.emergency.backends {
		f(be, true);
	}
}

/// The admin protocol spoken by CONTROL and METRICS terminal backends.
pub fn handle(rt: &Runtime, method: Method, path: &str, kind: ControlKind) -> ControlReply {
	if kind == ControlKind::Metrics {
		return match method {
			Method::Get | Method::Head => {
				ControlReply::ok(rt.metrics.encode(), "text/plain; version=0.0.4")
			},
			_ => ControlReply::plain(405, "method not allowed\n"),
		};
	}
	let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
	match (method, segments.as_slice()) {
		(Method::Get, []) | (Method::Get, ["config"]) => {
			ControlReply::ok(dump(rt).to_string(), "application/json")
		},
		(Method::Post, ["service", name, action]) => toggle_service(rt, name, action),
		(Method::Post, ["service", name, "backend", idx, action]) => {
			toggle_backend(rt, name, idx, action)
		},
		(Method::Get, _) => ControlReply::plain(404, "not found\n"),
		_ => ControlReply::plain(405, "method not allowed\n"),
	}
}

fn find_service(rt: &Runtime, name: &str) -> Option<Arc<Service>> {
	let mut found = None;
	foreach_service(rt, |s| {
		if found.is_none() && s.name == name {
			found = Some(s.clone());
		}
	});
	found
}

fn toggle_service(rt: &Runtime, name: &str, action: &str) -> ControlReply {
	let enable = match action {
		"enable" => true,
		"disable" => false,
		_ => return ControlReply::plain(404, "not found\n"),
	};
	let Some(svc) = find_service(rt, name) else {
		return ControlReply::plain(404, "no such service\n");
	};
	svc
		.disabled
		.store(!enable, std::sync::atomic::Ordering::Relaxed);
	info!(service = %svc.name, enable, "service toggled");
	ControlReply::plain(200, "ok\n")
}

fn toggle_backend(rt: &Runtime, name: &str, idx: &str, action: &str) -> ControlReply {
	let enable = match action {
		"enable" => true,
		"disable" => false,
		_ => return ControlReply::plain(404, "not found\n"),
	};
	let Ok(idx) = idx.parse::<usize>() else {
		return ControlReply::plain(404, "bad backend index\n");
	};
	let Some(svc) = find_service(rt, name) else {
		return ControlReply::plain(404, "no such service\n");
	};
	let mut backends = Vec::new();
	foreach_backend(&svc, |be, _| backends.push(be.clone()));
	let Some(be) = backends.get(idx) else {
		return ControlReply::plain(404, "no such backend\n");
	};
	svc.set_backend_enabled(be, enable);
	info!(service = %svc.name, backend = %be.label(), enable, "backend toggled");
	ControlReply::plain(200, "ok\n")
}

fn dump(rt: &Runtime) -> serde_json::Value {
	let svc_json = |svc: &Arc<Service>| {
		let mut backends = Vec::new();
		foreach_backend(svc, |be, emergency| {
			backends.push(json!({
				"backend": be.label(),
				"priority": be.priority,
				"emergency": emergency,
				"alive": be.alive(),
				"disabled": be.disabled.load(std::sync::atomic::Ordering::Relaxed),
			}));
		});
		let sessions = svc.state().sessions.len();
		json!({
			"service": svc.name,
			"disabled": svc.disabled.load(std::sync::atomic::Ordering::Relaxed),
			"sessions": sessions,
			"backends": backends,
		})
	};
	json!({
		"listeners": rt.listeners.iter().map(|l| {
			json!({
				"listener": l.name,
				"address": l.addr.to_string(),
				"tls": l.tls.is_some(),
				"services": l.services.iter().map(svc_json).collect::<Vec<_>>(),
			})
		}).collect::<Vec<_>>(),
		"services": rt.global_services.iter().map(svc_json).collect::<Vec<_>>(),
	})
}
