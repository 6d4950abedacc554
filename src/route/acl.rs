use std::net::IpAddr;

use ipnet::IpNet;

/// A named set of CIDR ranges. Matching ORs across the ranges; IPv4-mapped
/// IPv6 peers are canonicalized so a v4 range matches them.
#[derive(Debug, Clone)]
pub struct Acl {
	pub name: Option<String>,
	nets: Vec<IpNet>,
}

impl Acl {
	pub fn parse(name: Option<String>, cidrs: &[String]) -> Result<Acl, ipnet::AddrParseError> {
		let nets = cidrs
			.iter()
			.map(|c| {
				if c.contains('/') {
					c.parse::<IpNet>()
				} else {
					// bare address: exact-host range
					let ip = c.parse::<IpAddr>().map_err(|_| "".parse::<IpNet>().unwrap_err())?;
					Ok(IpNet::from(ip))
				}
			})
			.collect::<Result<Vec<_>, _>>()?;
		Ok(Acl { name, nets })
	}

	pub fn matches(&self, ip: IpAddr) -> bool {
		let ip = ip.to_canonical();
		self.nets.iter().any(|n| n.contains(&ip))
	}

	pub fn is_empty(&self) -> bool {
		self.nets.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cidr_match() {
		let acl =
			Acl::parse(None, &["10.0.0.0/8".into(), "192.168.1.0/24".into()]).unwrap();
		assert!(acl.matches("10.1.2.3".parse().unwrap()));
		assert!(acl.matches("192.168.1.77".parse().unwrap()));
		assert!(!acl.matches("192.168.2.1".parse().unwrap()));
		assert!(!acl.matches("2001:db8::1".parse().unwrap()));
	}

	#[test]
	fn bare_address_and_v6() {
		let acl = Acl::parse(None, &["127.0.0.1".into(), "2001:db8::/32".into()]).unwrap();
		assert!(acl.matches("127.0.0.1".parse().unwrap()));
		assert!(!acl.matches("127.0.0.2".parse().unwrap()));
		assert!(acl.matches("2001:db8:1::9".parse().unwrap()));
	}

	#[test]
	fn v4_mapped_peer_matches_v4_range() {
		let acl = Acl::parse(None, &["10.0.0.0/8".into()]).unwrap();
		assert!(acl.matches("::ffff:10.9.8.7".parse().unwrap()));
	}
}
