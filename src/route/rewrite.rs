use std::net::IpAddr;

use tracing::debug;
use url::Url;

use crate::http::parse::encode_url;
use crate::http::{Header, Request, Response};
use crate::route::matcher::{Condition, MatchCtx, Pattern, Submatches};

/// A compiled rewrite/logging template. Recognizes `$N` (capture group of
/// the most recent successful match in scope), `$$` (literal dollar),
/// `%{name}i` (request header) and `%{name}o` (response header).
#[derive(Debug, Clone)]
pub struct Template {
	frags: Vec<Frag>,
	pub raw: String,
}

#[derive(Debug, Clone)]
enum Frag {
	Lit(String),
	Submatch(usize),
	ReqHeader(String),
	RespHeader(String),
}

impl Template {
	pub fn compile(raw: &str) -> Template {
		let mut frags = Vec::new();
		let mut lit = String::new();
		let mut chars = raw.chars().peekable();
		while let Some(c) = chars.next() {
			match c {
				'$' => match chars.peek() {
					Some('$') => {
						chars.next();
						lit.push('$');
					},
					Some(d) if d.is_ascii_digit() => {
						let n = chars.next().unwrap().to_digit(10).unwrap() as usize;
						if !lit.is_empty() {
							frags.push(Frag::Lit(std::mem::take(&mut lit)));
						}
						frags.push(Frag::Submatch(n));
					},
					_ => lit.push('$'),
				},
				'%' if chars.peek() == Some(&'{') => {
					chars.next();
					let name: String = chars.by_ref().take_while(|c| *c != '}').collect();
					match chars.next() {
						Some('i') => {
							if !lit.is_empty() {
								frags.push(Frag::Lit(std::mem::take(&mut lit)));
							}
							frags.push(Frag::ReqHeader(name));
						},
						Some('o') => {
							if !lit.is_empty() {
								frags.push(Frag::Lit(std::mem::take(&mut lit)));
							}
							frags.push(Frag::RespHeader(name));
						},
						// unknown selector: emit literally
						other => {
							lit.push_str("%{");
							lit.push_str(&name);
							lit.push('}');
							if let Some(o) = other {
								lit.push(o);
							}
						},
					}
				},
				c => lit.push(c),
			}
		}
		if !lit.is_empty() {
			frags.push(Frag::Lit(lit));
		}
		Template {
			frags,
			raw: raw.to_string(),
		}
	}

	pub fn expand(&self, req: &Request, resp: Option<&Response>, subs: &Submatches) -> String {
		let mut out = String::new();
		for frag in &self.frags {
			match frag {
				Frag::Lit(s) => out.push_str(s),
				Frag::Submatch(n) => {
					if let Some(m) = subs.get(*n) {
						out.push_str(m);
					}
				},
				Frag::ReqHeader(name) => {
					if let Some(v) = req.named_header_value(name) {
						out.push_str(v);
					}
				},
				Frag::RespHeader(name) => {
					if let Some(v) = resp.and_then(|r| r.named_header_value(name)) {
						out.push_str(v);
					}
				},
			}
		}
		out
	}

	/// Expansion for URL positions: anything a submatch or header smuggled
	/// in that is outside the safe set gets percent-encoded.
	pub fn expand_url(&self, req: &Request, resp: Option<&Response>, subs: &Submatches) -> String {
		encode_url(&self.expand(req, resp, subs))
	}
}

#[derive(Debug, Clone)]
pub enum RewriteOp {
	SetHeader(Template),
	DelHeader(Pattern),
	SetUrl(Template),
	SetPath(Template),
	SetQuery(Template),
	SetQueryParam { name: String, value: Template },
	SubRule(RewriteRule),
}

/// `if cond { ops } else { else_ops }`, where a missing condition always
/// runs `ops`.
#[derive(Debug, Clone, Default)]
pub struct RewriteRule {
	pub cond: Option<Condition>,
	pub ops: Vec<RewriteOp>,
	pub else_ops: Vec<RewriteOp>,
}

/// Run a rewrite pipeline against the request.
pub fn apply_request(
	rules: &[RewriteRule],
	req: &mut Request,
	peer: IpAddr,
	subs: &mut Submatches,
) {
	for rule in rules {
		apply_rule(rule, req, None, peer, subs, true);
	}
}

/// Run a rewrite pipeline against the response. Conditions are still
/// evaluated against the request; URL operations have no meaning here and
/// are ignored.
pub fn apply_response(
	rules: &[RewriteRule],
	req: &Request,
	resp: &mut Response,
	peer: IpAddr,
	subs: &mut Submatches,
) {
	for rule in rules {
		apply_rule_response(rule, req, resp, peer, subs);
	}
}

fn rule_applies(
	cond: &Option<Condition>,
	req: &Request,
	peer: IpAddr,
	subs: &mut Submatches,
) -> bool {
	match cond {
		None => true,
		Some(c) => {
			let mut ctx = MatchCtx { req, peer, subs };
			c.matches(&mut ctx)
		},
	}
}

fn apply_rule(
	rule: &RewriteRule,
	req: &mut Request,
	resp: Option<&Response>,
	peer: IpAddr,
	subs: &mut Submatches,
	_request_side: bool,
) {
	let ops = if rule_applies(&rule.cond, req, peer, subs) {
		&rule.ops
	} else {
		&rule.else_ops
	};
	for op in ops {
		match op {
			RewriteOp::SetHeader(t) => {
				let line = t.expand(req, resp, subs);
				set_header_line(&mut req.headers, line);
			},
			RewriteOp::DelHeader(p) => {
				req.headers.retain(|h| !p.is_match(&h.line));
			},
			RewriteOp::SetUrl(t) => {
				let url = t.expand_url(req, resp, subs);
				req.set_url(url);
			},
			RewriteOp::SetPath(t) => {
				let path = t.expand_url(req, resp, subs);
				let new = match req.url.split_once('?') {
					Some((_, q)) => format!("{path}?{q}"),
					None => path,
				};
				req.set_url(new);
			},
			RewriteOp::SetQuery(t) => {
				let query = t.expand_url(req, resp, subs);
				let path = req.raw_path().to_string();
				let new = if query.is_empty() {
					path
				} else {
					format!("{path}?{query}")
				};
				req.set_url(new);
			},
			RewriteOp::SetQueryParam { name, value } => {
				let value = t_expand_param(value, req, resp, subs);
				set_query_param(req, name, &value);
			},
			RewriteOp::SubRule(sub) => {
				subs.push_scope();
				apply_rule(sub, req, resp, peer, subs, _request_side);
				subs.pop_scope();
			},
		}
	}
}

fn t_expand_param(
	t: &Template,
	req: &Request,
	resp: Option<&Response>,
	subs: &Submatches,
) -> String {
	encode_url(&t.expand(req, resp, subs)).replace('&', "%26")
}

fn apply_rule_response(
	rule: &RewriteRule,
	req: &Request,
	resp: &mut Response,
	peer: IpAddr,
	subs: &mut Submatches,
) {
	let ops = if rule_applies(&rule.cond, req, peer, subs) {
		&rule.ops
	} else {
		&rule.else_ops
	};
	for op in ops {
		match op {
			RewriteOp::SetHeader(t) => {
				let line = t.expand(req, Some(resp), subs);
				set_header_line(&mut resp.headers, line);
			},
			RewriteOp::DelHeader(p) => {
				resp.headers.retain(|h| !p.is_match(&h.line));
			},
			RewriteOp::SubRule(sub) => {
				subs.push_scope();
				apply_rule_response(sub, req, resp, peer, subs);
				subs.pop_scope();
			},
			_ => {
				debug!("URL rewrite op ignored on response side");
			},
		}
	}
}

/// Parse an expanded `Name: value` line; replace an existing header of the
/// same name or append.
fn set_header_line(headers: &mut Vec<Header>, line: String) {
	let h = Header::new(line);
	if h.kind == crate::http::HeaderKind::Illegal {
		debug!(line = %h.line, "rewrite produced an illegal header, skipping");
		return;
	}
	let name = h.name().to_string();
	match headers.iter_mut().find(|e| e.is(&name)) {
		Some(existing) => *existing = h,
		None => headers.push(h),
	}
}

/// Set (or add) a parameter in the raw query string. Existing occurrences
/// of the name are replaced in place.
fn set_query_param(req: &mut Request, name: &str, value: &str) {
	let path = req.raw_path().to_string();
	let raw_q = req.raw_query();
	let mut parts: Vec<String> = Vec::new();
	let mut replaced = false;
	for kv in raw_q.split('&').filter(|s| !s.is_empty()) {
		let key = kv.split('=').next().unwrap_or("");
		if key == name {
			if !replaced {
				parts.push(format!("{name}={value}"));
				replaced = true;
			}
		} else {
			parts.push(kv.to_string());
		}
	}
	if !replaced {
		parts.push(format!("{name}={value}"));
	}
	req.set_url(format!("{path}?{}", parts.join("&")));
}

/// Rewrite an absolute `Location`/`Content-Location` URL back under the
/// original virtual host. `known_authority` reports whether host:port is
/// one of ours (a backend address, or the listener itself in mode 2).
pub fn rewrite_location_value(
	value: &str,
	request_host: &str,
	inbound_tls: bool,
	known_authority: &dyn Fn(&str, u16) -> bool,
) -> Option<String> {
	if request_host.is_empty() {
		return None;
	}
	let parsed = Url::parse(value).ok()?;
	let default_port = match parsed.scheme() {
		"http" => 80,
		"https" => 443,
		_ => return None,
	};
	let host = parsed.host_str()?;
	let port = parsed.port().unwrap_or(default_port);
	if !known_authority(host, port) {
		return None;
	}
	let scheme = if inbound_tls { "https" } else { "http" };
	let mut out = format!("{scheme}://{request_host}{}", parsed.path());
	if let Some(q) = parsed.query() {
		out.push('?');
		out.push_str(q);
	}
	Some(out)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::{Header, Method};
	use crate::route::matcher::MatchKind;

	fn request(url: &str, headers: &[&str]) -> Request {
		Request {
			method: Method::Get,
			method_token: "GET".into(),
			version_minor: 1,
			url: url.into(),
			decoded: crate::http::parse::percent_decode(url).unwrap(),
			headers: headers.iter().map(|l| Header::new(l.to_string())).collect(),
			basic_user: None,
			basic_pass: None,
		}
	}

	fn peer() -> IpAddr {
		"127.0.0.1".parse().unwrap()
	}

	#[test]
	fn template_expansion() {
		let req = request("/", &["X-Tag: blue"]);
		let mut subs = Submatches::new();
		let re = regex::Regex::new("^/(f.o)/(.*)$").unwrap();
		subs.record(&re.captures("/foo/bar").unwrap());
		let t = Template::compile("pre-$1-$2-$$-%{X-Tag}i-%{Missing}i-post");
		assert_eq!(t.expand(&req, None, &subs), "pre-foo-bar-$-blue--post");
	}

	#[test]
	fn template_unknown_selector_literal() {
		let req = request("/", &[]);
		let subs = Submatches::new();
		let t = Template::compile("a%{x}zb");
		assert_eq!(t.expand(&req, None, &subs), "a%{x}zb");
	}

	#[test]
	fn set_header_replaces_or_appends() {
		let mut req = request("/", &["X-A: old"]);
		let mut subs = Submatches::new();
		let rule = RewriteRule {
			cond: None,
			ops: vec![
				RewriteOp::SetHeader(Template::compile("X-A: new")),
				RewriteOp::SetHeader(Template::compile("X-B: fresh")),
			],
			else_ops: vec![],
		};
		apply_request(&[rule], &mut req, peer(), &mut subs);
		assert_eq!(req.named_header_value("X-A"), Some("new"));
		assert_eq!(req.named_header_value("X-B"), Some("fresh"));
		assert_eq!(req.headers.len(), 2);
	}

	#[test]
	fn del_header_by_line_regex() {
		let mut req = request("/", &["X-Secret: 1", "X-Keep: 2", "X-Secret-2: 3"]);
		let mut subs = Submatches::new();
		let rule = RewriteRule {
			cond: None,
			ops: vec![RewriteOp::DelHeader(
				Pattern::compile(MatchKind::Regex, "^X-Secret", true).unwrap(),
			)],
			else_ops: vec![],
		};
		apply_request(&[rule], &mut req, peer(), &mut subs);
		let names: Vec<_> = req.headers.iter().map(|h| h.name().to_string()).collect();
		assert_eq!(names, vec!["X-Keep"]);
	}

	#[test]
	fn set_path_keeps_query() {
		let mut req = request("/old/path?q=1", &[]);
		let mut subs = Submatches::new();
		let rule = RewriteRule {
			cond: None,
			ops: vec![RewriteOp::SetPath(Template::compile("/new"))],
			else_ops: vec![],
		};
		apply_request(&[rule], &mut req, peer(), &mut subs);
		assert_eq!(req.url, "/new?q=1");
	}

	#[test]
	fn set_query_param_replaces_in_place() {
		let mut req = request("/p?a=1&b=2&a=3", &[]);
		let mut subs = Submatches::new();
		let rule = RewriteRule {
			cond: None,
			ops: vec![RewriteOp::SetQueryParam {
				name: "a".into(),
				value: Template::compile("9"),
			}],
			else_ops: vec![],
		};
		apply_request(&[rule], &mut req, peer(), &mut subs);
		assert_eq!(req.url, "/p?a=9&b=2");

		let rule = RewriteRule {
			cond: None,
			ops: vec![RewriteOp::SetQueryParam {
				name: "c".into(),
				value: Template::compile("x y"),
			}],
			else_ops: vec![],
		};
		apply_request(&[rule], &mut req, peer(), &mut subs);
		assert_eq!(req.url, "/p?a=9&b=2&c=x%20y");
	}

	#[test]
	fn conditional_rule_takes_else_branch() {
		let mut req = request("/other", &[]);
		let mut subs = Submatches::new();
		let rule = RewriteRule {
			cond: Some(Condition::Path(
				Pattern::compile(MatchKind::Prefix, "/api", true).unwrap(),
			)),
			ops: vec![RewriteOp::SetHeader(Template::compile("X-Api: 1"))],
			else_ops: vec![RewriteOp::SetHeader(Template::compile("X-Api: 0"))],
		};
		apply_request(&[rule], &mut req, peer(), &mut subs);
		assert_eq!(req.named_header_value("X-Api"), Some("0"));
	}

	#[test]
	fn url_template_encodes_unsafe_submatches() {
		let mut req = request("/redir", &[]);
		let mut subs = Submatches::new();
		let re = regex::Regex::new("(.+)").unwrap();
		subs.record(&re.captures("a b\"c").unwrap());
		let rule = RewriteRule {
			cond: None,
			ops: vec![RewriteOp::SetUrl(Template::compile("/go/$1"))],
			else_ops: vec![],
		};
		apply_request(&[rule], &mut req, peer(), &mut subs);
		assert_eq!(req.url, "/go/a%20b%22c");
	}

	#[test]
	fn location_rewrite_tracks_host_and_scheme() {
		let known = |h: &str, p: u16| h == "10.0.0.5" && p == 8080;
		let out = rewrite_location_value(
			"http://10.0.0.5:8080/deep/link?x=1",
			"www.example.org",
			true,
			&known,
		);
		assert_eq!(
			out.as_deref(),
			Some("https://www.example.org/deep/link?x=1")
		);
		// unknown authority untouched
		assert_eq!(
			rewrite_location_value("http://elsewhere.example/x", "www.example.org", true, &known),
			None
		);
		// relative URLs untouched
		assert_eq!(
			rewrite_location_value("/relative", "www.example.org", false, &known),
			None
		);
	}

	#[test]
	fn sub_rule_scopes_submatches() {
		let mut req = request("/foo/bar", &[]);
		let mut subs = Submatches::new();
		let outer_cond = Condition::Path(
			Pattern::compile(MatchKind::Regex, "^/foo/(.*)$", true).unwrap(),
		);
		let inner = RewriteRule {
			cond: Some(Condition::Header(
				Pattern::compile(MatchKind::Regex, "^X-None: (.*)$", true).unwrap(),
			)),
			ops: vec![RewriteOp::SetHeader(Template::compile("X-In: $1"))],
			else_ops: vec![RewriteOp::SetHeader(Template::compile("X-Out: $1"))],
		};
		let rule = RewriteRule {
			cond: Some(outer_cond),
			ops: vec![RewriteOp::SubRule(inner)],
			else_ops: vec![],
		};
		apply_request(&[rule], &mut req, peer(), &mut subs);
		// inner condition failed; $1 falls back to the outer match
		assert_eq!(req.named_header_value("X-Out"), Some("bar"));
	}
}
