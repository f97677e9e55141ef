//! Pushed option parsing and the per-tunnel configuration snapshot.
//!
//! The engine hands the adapter the options pushed by the server during
//! setup (`ifconfig`, `route`, `dhcp-option`, ...). This module turns
//! them into the typed [`ConfigSnapshot`] the application cares about.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::{debug, warn};

/// Default tunnel MTU when the server does not push `tun-mtu`.
pub const DEFAULT_MTU: u16 = 1500;

/// One directive: name followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionLine {
    args: Vec<String>,
}

impl OptionLine {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("")
    }

    /// Argument `i`, where 0 is the directive name.
    pub fn arg(&self, i: usize) -> Option<&str> {
        self.args.get(i).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// Ordered list of directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionList {
    lines: Vec<OptionLine>,
}

impl OptionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse newline-separated directives (profile or pulled options).
    pub fn parse_lines(text: &str) -> Self {
        let lines = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with(';'))
            .map(|l| OptionLine::new(tokenize(l)))
            .filter(|o| !o.is_empty())
            .collect();
        Self { lines }
    }

    /// Parse a comma-separated `PUSH_REPLY,...` message.
    pub fn parse_push_reply(text: &str) -> Self {
        let body = text.trim().strip_prefix("PUSH_REPLY").unwrap_or(text.trim());
        let lines = body
            .split(',')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| OptionLine::new(tokenize(l)))
            .filter(|o| !o.is_empty())
            .collect();
        Self { lines }
    }

    pub fn push(&mut self, line: OptionLine) {
        self.lines.push(line);
    }

    /// First directive with this name.
    pub fn get(&self, name: &str) -> Option<&OptionLine> {
        self.lines.iter().find(|o| o.name() == name)
    }

    /// All directives with this name, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a OptionLine> + 'a {
        self.lines.iter().filter(move |o| o.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OptionLine> {
        self.lines.iter()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

fn tokenize(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    let mut in_token = false;
    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    out.push(std::mem::take(&mut cur));
                    in_token = false;
                }
            }
            c => {
                cur.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        out.push(cur);
    }
    out
}

/// Address plus prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpAssignment {
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl fmt::Display for IpAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// A pushed route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl Route {
    pub fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    pub fn default_v4() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            prefix_len: 0,
        }
    }

    pub fn default_v6() -> Self {
        Self {
            address: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            prefix_len: 0,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Interface configuration pushed by the server for one tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub ipv4: Option<IpAssignment>,
    pub ipv6: Option<IpAssignment>,
    pub dns_servers: Vec<IpAddr>,
    pub routes: Vec<Route>,
    pub mtu: u16,
    pub redirect_gateway: bool,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            ipv4: None,
            ipv6: None,
            dns_servers: Vec::new(),
            routes: Vec::new(),
            mtu: DEFAULT_MTU,
            redirect_gateway: false,
        }
    }
}

impl ConfigSnapshot {
    /// Extract the snapshot from pushed options.
    ///
    /// Malformed entries are skipped with a warning; they never abort
    /// tunnel setup.
    pub fn from_options(opts: &OptionList) -> Self {
        let mut snap = Self::default();

        if let Some(o) = opts.get("ifconfig") {
            snap.ipv4 = parse_ifconfig(o);
        }
        if let Some(o) = opts.get("ifconfig-ipv6") {
            snap.ipv6 = o.arg(1).and_then(parse_v6_cidr).map(|(a, p)| IpAssignment {
                address: IpAddr::V6(a),
                prefix_len: p,
            });
        }

        for o in opts.iter() {
            match o.name() {
                "route" => match parse_route_v4(o) {
                    Some(r) => snap.add_route(r),
                    None => warn!(line = ?o, "Ignoring malformed route"),
                },
                "route-ipv6" => match o.arg(1).and_then(parse_v6_cidr) {
                    Some((a, p)) => snap.add_route(Route {
                        address: IpAddr::V6(a),
                        prefix_len: p,
                    }),
                    None => warn!(line = ?o, "Ignoring malformed route-ipv6"),
                },
                "dhcp-option" => {
                    if matches!(o.arg(1), Some("DNS") | Some("DNS6")) {
                        if let Some(ip) = o.arg(2).and_then(|s| s.parse::<IpAddr>().ok()) {
                            snap.add_dns(ip);
                        }
                    }
                }
                // dns server <n> address <a> [<b> ...]
                "dns" if o.arg(1) == Some("server") && o.arg(3) == Some("address") => {
                    for i in 4..o.len() {
                        if let Some(ip) = o.arg(i).and_then(parse_dns_address) {
                            snap.add_dns(ip);
                        }
                    }
                }
                "tun-mtu" => match o.arg(1).and_then(|s| s.parse::<u16>().ok()) {
                    Some(mtu) if mtu >= 576 => snap.mtu = mtu,
                    _ => warn!(line = ?o, mtu = snap.mtu, "Bad tun-mtu, keeping current"),
                },
                "redirect-gateway" => {
                    let flags: Vec<&str> = (1..o.len()).filter_map(|i| o.arg(i)).collect();
                    if !flags.contains(&"!ipv4") {
                        snap.add_route(Route::default_v4());
                    }
                    if flags.contains(&"ipv6") {
                        snap.add_route(Route::default_v6());
                    }
                    snap.redirect_gateway = true;
                }
                _ => {}
            }
        }

        debug!(?snap, "Extracted tunnel configuration");
        snap
    }

    fn add_route(&mut self, route: Route) {
        if !self.routes.contains(&route) {
            self.routes.push(route);
        }
    }

    fn add_dns(&mut self, ip: IpAddr) {
        if !self.dns_servers.contains(&ip) {
            self.dns_servers.push(ip);
        }
    }
}

/// Prefix length of a contiguous IPv4 netmask.
pub fn netmask_to_prefix(mask: Ipv4Addr) -> Option<u8> {
    let m = u32::from(mask);
    let ones = m.leading_ones();
    if ones + m.trailing_zeros() == 32 {
        Some(ones as u8)
    } else {
        None
    }
}

fn mask_or_host(arg: Option<&str>, what: &str) -> Option<u8> {
    let Some(s) = arg else {
        return Some(32);
    };
    let mask: Ipv4Addr = s.parse().ok()?;
    match netmask_to_prefix(mask) {
        Some(p) => Some(p),
        None => {
            warn!(netmask = %mask, what, "Non-contiguous netmask, using /32");
            Some(32)
        }
    }
}

fn parse_ifconfig(o: &OptionLine) -> Option<IpAssignment> {
    let address: Ipv4Addr = o.arg(1)?.parse().ok()?;
    let prefix_len = mask_or_host(o.arg(2), "ifconfig")?;
    Some(IpAssignment {
        address: IpAddr::V4(address),
        prefix_len,
    })
}

fn parse_route_v4(o: &OptionLine) -> Option<Route> {
    let network = o.arg(1)?;
    // "vpn_gateway" / "net_gateway" keywords are not addresses
    let address: Ipv4Addr = network.parse().ok()?;
    let prefix_len = mask_or_host(o.arg(2), "route")?;
    Some(Route {
        address: IpAddr::V4(address),
        prefix_len,
    })
}

fn parse_v6_cidr(s: &str) -> Option<(Ipv6Addr, u8)> {
    let (addr, prefix) = match s.split_once('/') {
        Some((a, p)) => (a, p.parse::<u8>().ok()?),
        None => (s, 128),
    };
    let addr: Ipv6Addr = addr.parse().ok()?;
    if prefix > 128 {
        warn!(address = %addr, prefix, "Invalid IPv6 prefix, using /128");
        return Some((addr, 128));
    }
    Some((addr, prefix))
}

fn parse_dns_address(s: &str) -> Option<IpAddr> {
    // Accepts "10.0.0.1", "[fd00::1]:53" and "10.0.0.1:53"
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Some(ip);
    }
    s.parse::<std::net::SocketAddr>().ok().map(|sa| sa.ip())
}
