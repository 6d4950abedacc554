use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};

use crate::http::Request;
use crate::http::parse::query_pairs;
use crate::route::acl::Acl;
use crate::route::auth::PasswdFile;
use crate::route::rewrite::Template;

/// How a configured pattern is interpreted. POSIX and PCRE both compile
/// through the `regex` crate; the literal kinds become escaped, anchored
/// patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchKind {
	#[default]
	Regex,
	Exact,
	Prefix,
	Suffix,
	Contain,
}

#[derive(Debug, Clone)]
pub struct Pattern {
	re: Regex,
	pub raw: String,
}

#[derive(thiserror::Error, Debug)]
pub enum PatternError {
	#[error("bad pattern {raw:?}: {err}")]
	Compile { raw: String, err: regex::Error },
	#[error("reading pattern file: {0}")]
	Io(#[from] std::io::Error),
}

impl Pattern {
	pub fn compile(kind: MatchKind, pat: &str, icase: bool) -> Result<Pattern, PatternError> {
		let expr = match kind {
			MatchKind::Regex => pat.to_string(),
			MatchKind::Exact => format!("^{}$", regex::escape(pat)),
			MatchKind::Prefix => format!("^{}", regex::escape(pat)),
			MatchKind::Suffix => format!("{}$", regex::escape(pat)),
			MatchKind::Contain => regex::escape(pat),
		};
		Self::build(expr, pat, icase)
	}

	/// Host patterns are anchored at the end (whitespace-tolerant), so
	/// `example.org` cannot be satisfied by `example.org.evil.com`, while a
	/// bare domain still matches its own subdomain hosts. Exact pins both
	/// ends; prefix keeps only its start anchor.
	pub fn compile_host(kind: MatchKind, pat: &str, icase: bool) -> Result<Pattern, PatternError> {
		let expr = match kind {
			MatchKind::Regex => format!("(?:{pat})[ \t]*$"),
			MatchKind::Exact => format!("^{}[ \t]*$", regex::escape(pat)),
			MatchKind::Prefix => format!("^{}", regex::escape(pat)),
			MatchKind::Suffix => format!("{}[ \t]*$", regex::escape(pat)),
			MatchKind::Contain => regex::escape(pat),
		};
		Self::build(expr, pat, icase)
	}

	fn build(expr: String, raw: &str, icase: bool) -> Result<Pattern, PatternError> {
		let re = RegexBuilder::new(&expr)
			.case_insensitive(icase)
			.build()
			.map_err(|err| PatternError::Compile {
				raw: raw.to_string(),
				err,
			})?;
		Ok(Pattern {
			re,
			raw: raw.to_string(),
		})
	}

	pub fn is_match(&self, s: &str) -> bool {
		self.re.is_match(s)
	}

	/// Match and, on success, record capture groups for later `$N`
	/// substitution.
	pub fn match_and_record(&self, s: &str, subs: &mut Submatches) -> bool {
		match self.re.captures(s) {
			Some(caps) => {
				subs.record(&caps);
				true
			},
			None => false,
		}
	}
}

/// Capture groups of the most recent successful match, scoped as a stack so
/// nested rewrite rules see their own matches and fall back to the
/// enclosing scope.
#[derive(Debug, Default)]
pub struct Submatches {
	stack: Vec<Vec<Option<String>>>,
}

impl Submatches {
	pub fn new() -> Submatches {
		Submatches {
			stack: vec![Vec::new()],
		}
	}

	pub fn push_scope(&mut self) {
		self.stack.push(Vec::new());
	}

	pub fn pop_scope(&mut self) {
		if self.stack.len() > 1 {
			self.stack.pop();
		}
	}

	pub fn record(&mut self, caps: &regex::Captures) {
		let frame: Vec<Option<String>> = (0..caps.len())
			.map(|i| caps.get(i).map(|m| m.as_str().to_string()))
			.collect();
		if let Some(top) = self.stack.last_mut() {
			*top = frame;
		}
	}

	pub fn get(&self, n: usize) -> Option<&str> {
		for frame in self.stack.iter().rev() {
			if !frame.is_empty() {
				return frame.get(n).and_then(|g| g.as_deref());
			}
		}
		None
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
	And,
	Or,
	Not,
}

/// One node of a service's (or rewrite rule's) condition tree.
#[derive(Debug, Clone)]
pub enum Condition {
	Bool { op: BoolOp, children: Vec<Condition> },
	Acl(Arc<Acl>),
	Url(Pattern),
	Path(Pattern),
	Query(Pattern),
	QueryParam { name: String, pat: Pattern },
	Header(Pattern),
	Host(Pattern),
	BasicAuth(Arc<PasswdFile>),
	StringMatch { template: Template, pat: Pattern },
}

pub struct MatchCtx<'a> {
	pub req: &'a Request,
	pub peer: IpAddr,
	pub subs: &'a mut Submatches,
}

impl Condition {
	/// Short-circuit evaluation. Every successful leaf regex records its
	/// submatches in the context.
	pub fn matches(&self, ctx: &mut MatchCtx) -> bool {
		match self {
			Condition::Bool { op: BoolOp::And, children } => {
				children.iter().all(|c| c.matches(ctx))
			},
			Condition::Bool { op: BoolOp::Or, children } => {
				children.iter().any(|c| c.matches(ctx))
			},
			Condition::Bool { op: BoolOp::Not, children } => {
				!children.iter().all(|c| c.matches(ctx))
			},
			Condition::Acl(acl) => acl.matches(ctx.peer),
			Condition::Url(p) => p.match_and_record(&ctx.req.decoded, ctx.subs),
			Condition::Path(p) => {
				let path = ctx.req.path().to_string();
				p.match_and_record(&path, ctx.subs)
			},
			Condition::Query(p) => {
				let q = ctx.req.query().to_string();
				p.match_and_record(&q, ctx.subs)
			},
			Condition::QueryParam { name, pat } => {
				let value = query_pairs(ctx.req.query())
					.into_iter()
					.find(|(k, _)| k == name)
					.map(|(_, v)| v);
				match value {
					Some(v) => pat.match_and_record(&v, ctx.subs),
					None => false,
				}
			},
			Condition::Header(p) => {
				let lines: Vec<String> = ctx.req.headers.iter().map(|h| h.line.clone()).collect();
				lines.iter().any(|l| p.match_and_record(l, ctx.subs))
			},
			Condition::Host(p) => {
				let host = ctx.req.host().to_string();
				p.match_and_record(&host, ctx.subs)
			},
			Condition::BasicAuth(pf) => match (&ctx.req.basic_user, &ctx.req.basic_pass) {
				(Some(user), Some(pass)) => pf.verify(user, pass),
				_ => false,
			},
			Condition::StringMatch { template, pat } => {
				let expanded = template.expand(ctx.req, None, ctx.subs);
				pat.match_and_record(&expanded, ctx.subs)
			},
		}
	}
}

/// Load one pattern per line; blank lines and `#` comments are skipped. The
/// caller wraps the result in an OR node.
pub fn load_pattern_file(
	path: &Path,
	kind: MatchKind,
	icase: bool,
	host: bool,
) -> Result<Vec<Pattern>, PatternError> {
	let contents = fs::read_to_string(path)?;
	contents
		.lines()
		.map(str::trim)
		.filter(|l| !l.is_empty() && !l.starts_with('#'))
		.map(|l| {
			if host {
				Pattern::compile_host(kind, l, icase)
			} else {
				Pattern::compile(kind, l, icase)
			}
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::{Header, Method};

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

	fn eval(cond: &Condition, req: &Request) -> bool {
		let mut subs = Submatches::new();
		let mut ctx = MatchCtx {
			req,
			peer: "127.0.0.1".parse().unwrap(),
			subs: &mut subs,
		};
		cond.matches(&mut ctx)
	}

	#[test]
	fn url_match_records_submatches() {
		let req = request("/foo/bar", &[]);
		let pat = Pattern::compile(MatchKind::Regex, "^/foo/(.*)", true).unwrap();
		let mut subs = Submatches::new();
		let mut ctx = MatchCtx {
			req: &req,
			peer: "127.0.0.1".parse().unwrap(),
			subs: &mut subs,
		};
		assert!(Condition::Url(pat).matches(&mut ctx));
		assert_eq!(subs.get(1), Some("bar"));
	}

	#[test]
	fn url_match_sees_decoded_form() {
		let req = request("/a%20b", &[]);
		let pat = Pattern::compile(MatchKind::Exact, "/a b", true).unwrap();
		assert!(eval(&Condition::Url(pat), &req));
	}

	#[test]
	fn host_anchoring() {
		let exact = Pattern::compile_host(MatchKind::Exact, "example.org", true).unwrap();
		assert!(exact.is_match("example.org"));
		assert!(exact.is_match("EXAMPLE.ORG"));
		assert!(!exact.is_match("example.org.evil.com"));
		assert!(!exact.is_match("www.example.org"));

		// regex hosts are end-anchored only: subdomains match, suffix
		// spoofing does not
		let re = Pattern::compile_host(MatchKind::Regex, "example.org", true).unwrap();
		assert!(re.is_match("example.org"));
		assert!(re.is_match("www.example.org"));
		assert!(!re.is_match("example.org.evil.com"));

		let beg = Pattern::compile_host(MatchKind::Prefix, "www.", true).unwrap();
		assert!(beg.is_match("www.example.org"));
		assert!(!beg.is_match("example.org"));
	}

	#[test]
	fn header_matches_any_line() {
		let req = request("/", &["X-One: 1", "X-Two: um"]);
		let pat = Pattern::compile(MatchKind::Regex, "^X-Two: *(.+)", true).unwrap();
		let mut subs = Submatches::new();
		let mut ctx = MatchCtx {
			req: &req,
			peer: "127.0.0.1".parse().unwrap(),
			subs: &mut subs,
		};
		assert!(Condition::Header(pat).matches(&mut ctx));
		assert_eq!(subs.get(1), Some("um"));
	}

	#[test]
	fn query_param_first_name_wins() {
		let req = request("/p?x=first&x=second&y=3", &[]);
		let pat = Pattern::compile(MatchKind::Exact, "first", true).unwrap();
		assert!(eval(
			&Condition::QueryParam {
				name: "x".into(),
				pat
			},
			&req
		));
		let pat = Pattern::compile(MatchKind::Exact, "second", true).unwrap();
		assert!(!eval(
			&Condition::QueryParam {
				name: "x".into(),
				pat
			},
			&req
		));
	}

	#[test]
	fn bool_tree_short_circuit() {
		let req = request("/abc", &["Host: h"]);
		let yes = || Condition::Path(Pattern::compile(MatchKind::Prefix, "/a", true).unwrap());
		let no = || Condition::Path(Pattern::compile(MatchKind::Prefix, "/z", true).unwrap());
		let and = Condition::Bool {
			op: BoolOp::And,
			children: vec![yes(), no()],
		};
		assert!(!eval(&and, &req));
		let or = Condition::Bool {
			op: BoolOp::Or,
			children: vec![no(), yes()],
		};
		assert!(eval(&or, &req));
		let not = Condition::Bool {
			op: BoolOp::Not,
			children: vec![no()],
		};
		assert!(eval(&not, &req));
	}

	#[test]
	fn acl_condition() {
		let acl = Arc::new(Acl::parse(None, &["127.0.0.0/8".into()]).unwrap());
		let req = request("/", &[]);
		assert!(eval(&Condition::Acl(acl.clone()), &req));
	}

	#[test]
	fn basic_auth_condition() {
		let pf = Arc::new(PasswdFile::parse("u:pw\n", "test"));
		let mut req = request("/", &[]);
		assert!(!eval(&Condition::BasicAuth(pf.clone()), &req));
		req.basic_user = Some("u".into());
		req.basic_pass = Some("pw".into());
		assert!(eval(&Condition::BasicAuth(pf), &req));
	}

	#[test]
	fn submatch_scopes_nest() {
		let mut subs = Submatches::new();
		let re = Regex::new("(a)(b)").unwrap();
		subs.record(&re.captures("ab").unwrap());
		assert_eq!(subs.get(2), Some("b"));
		subs.push_scope();
		// inner scope empty: falls through to outer
		assert_eq!(subs.get(1), Some("a"));
		let re2 = Regex::new("(x)").unwrap();
		subs.record(&re2.captures("x").unwrap());
		assert_eq!(subs.get(1), Some("x"));
		subs.pop_scope();
		assert_eq!(subs.get(1), Some("a"));
	}
}
