use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;

use crate::http::{Request, Response};
use crate::route::session::session_key;
use crate::route::{Backend, BalanceAlgo, BalancerList, Service};

/// Pick a backend for the request: session pin first, then the normal
/// balancer list, then the emergency list. A successful pick through the
/// balancer upserts the session table when affinity is active.
pub fn select_backend(
	svc: &Service,
	req: &Request,
	peer: IpAddr,
	form_body: Option<&str>,
) -> Option<Arc<Backend>> {
	let now = Instant::now();
	let key = session_key(&svc.session, req, peer, form_body);
	let algo = svc.algo;
	let mut st = svc.state();
	if let Some(k) = &key
		&& let Some(be) = st.sessions.lookup(k, svc.session.ttl, now)
	{
		return Some(be);
	}
	let be = {
		let list = if st.normal.tot_pri > 0 {
			&mut st.normal
		} else {
			&mut st.emergency
		};
		match algo {
			BalanceAlgo::Random => random_pick(list),
			BalanceAlgo::Iwrr => iwrr_pick(list),
		}
	}?;
	if let Some(k) = key {
		st.sessions.insert(k, be.clone(), now);
	}
	Some(be)
}

/// Cookie-type affinity also learns from responses: a `Set-Cookie` for the
/// session cookie pins that value to the backend that issued it.
pub fn record_response_session(svc: &Service, resp: &Response, be: &Arc<Backend>) {
	if svc.session.kind != crate::route::session::SessionKind::Cookie || svc.session.id.is_empty() {
		return;
	}
	let value = resp
		.headers
		.iter()
		.filter(|h| h.is("Set-Cookie"))
		.filter_map(|h| h.value().split(';').next())
		.filter_map(|kv| kv.trim().split_once('='))
		.find(|(k, _)| *k == svc.session.id)
		.map(|(_, v)| v.to_string());
	if let Some(v) = value {
		svc.state().sessions.insert(v, be.clone(), Instant::now());
	}
}

/// Uniform pick in `[0, tot_pri)`, walked off against the weights in list
/// order.
fn random_pick(list: &BalancerList) -> Option<Arc<Backend>> {
	if list.tot_pri == 0 {
		return None;
	}
	let mut pick = rand::rng().random_range(0..list.tot_pri);
	for be in &list.backends {
		if !be.usable() || be.priority == 0 {
			continue;
		}
		let p = be.priority as u64;
		if pick < p {
			return Some(be.clone());
		}
		pick -= p;
	}
	None
}

/// Interleaved weighted round-robin. `cur_pri` descends from `max_pri`; a
/// backend is eligible in the current round iff its priority reaches
/// `cur_pri`. The rotating position spreads consecutive picks across the
/// round's eligible backends.
fn iwrr_pick(list: &mut BalancerList) -> Option<Arc<Backend>> {
	if list.tot_pri == 0 || list.max_pri == 0 {
		return None;
	}
	let n = list.backends.len();
	// bounded by one full descent over the rounds plus the wrap
	for _ in 0..=(n * (list.max_pri as usize + 1)) {
		while list.rr_pos < n {
			let i = list.rr_pos;
			list.rr_pos += 1;
			let be = &list.backends[i];
			if be.usable() && be.priority >= list.cur_pri {
				return Some(be.clone());
			}
		}
		list.rr_pos = 0;
		list.cur_pri = if list.cur_pri <= 1 {
			list.max_pri
		} else {
			list.cur_pri - 1
		};
	}
	None
}
