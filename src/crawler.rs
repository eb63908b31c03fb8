// Discovery of hosts on the local networks. Interfaces come from
// getifaddrs(3), the ping sweep is done by nmap.

use std::net::{Ipv4Addr, SocketAddrV4};

use itertools::Itertools;
use nix::{ifaddrs::getifaddrs, net::if_::InterfaceFlags};

use crate::{
    error::Error,
    settings::Settings,
    utils::{syscommand_timeout, SyscommandSettings},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedHost {
    pub ip: Ipv4Addr,
    pub hostname: Option<String>,
    pub up: bool,
}

impl std::fmt::Display for ScannedHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.up { "up" } else { "down" };
        match &self.hostname {
            Some(name) => write!(f, "{} ({name}) {status}", self.ip),
            None => write!(f, "{} {status}", self.ip),
        }
    }
}

/// Names of the interfaces that are up, running, broadcast and multicast.
pub fn interfaces() -> Result<Vec<String>, Error> {
    let wanted = InterfaceFlags::IFF_UP
        | InterfaceFlags::IFF_RUNNING
        | InterfaceFlags::IFF_BROADCAST
        | InterfaceFlags::IFF_MULTICAST;
    let addrs = getifaddrs().map_err(|e| Error::from(format!("getifaddrs failed: {e}")))?;
    Ok(addrs
        .filter(|it| it.flags.contains(wanted))
        .map(|it| it.interface_name)
        .sorted()
        .dedup()
        .collect())
}

/// IPv4 addresses of the interface with their prefix length.
pub fn ipv4_networks(name: &str) -> Result<Vec<(Ipv4Addr, u8)>, Error> {
    let addrs = getifaddrs().map_err(|e| Error::from(format!("getifaddrs failed: {e}")))?;
    let mut networks = Vec::new();
    for it in addrs.filter(|it| it.interface_name == name) {
        let ip = it
            .address
            .as_ref()
            .and_then(|a| a.as_sockaddr_in())
            .map(|a| *SocketAddrV4::from(*a).ip());
        let mask = it
            .netmask
            .as_ref()
            .and_then(|a| a.as_sockaddr_in())
            .map(|a| *SocketAddrV4::from(*a).ip());
        if let (Some(ip), Some(mask)) = (ip, mask) {
            networks.push((ip, netmask_to_prefix(mask)?));
        }
    }
    Ok(networks)
}

/// Number of leading one bits of a netmask.
pub fn netmask_to_prefix(mask: Ipv4Addr) -> Result<u8, Error> {
    let bits = u32::from(mask);
    let ones = bits.leading_ones();
    if bits.checked_shl(ones).unwrap_or(0) != 0 {
        return Error::err_string(format!("bad netmask {mask}"));
    }
    Ok(ones as u8)
}

/// Parses `nmap -oG` output. Lines other than host lines are ignored.
///
/// ```
/// let hosts = axis::crawler::parse_grepable(
///     "# Nmap 7.94 scan\nHost: 10.0.0.1 (gw.lan)\tStatus: Up\n",
/// );
/// assert_eq!(hosts.len(), 1);
/// assert_eq!(hosts[0].hostname.as_deref(), Some("gw.lan"));
/// ```
pub fn parse_grepable(output: &str) -> Vec<ScannedHost> {
    let mut hosts = Vec::new();
    for line in output.lines() {
        let Some(rest) = line.strip_prefix("Host: ") else {
            continue;
        };
        let mut fields = rest.split('\t');
        let Some(head) = fields.next() else {
            continue;
        };
        let Some(status) = fields.find_map(|f| f.strip_prefix("Status: ")) else {
            continue;
        };

        let mut head = head.splitn(2, ' ');
        let Some(Ok(ip)) = head.next().map(|s| s.parse::<Ipv4Addr>()) else {
            log::warn!("unexpected nmap line: {line}");
            continue;
        };
        let hostname = head
            .next()
            .map(|s| s.trim().trim_start_matches('(').trim_end_matches(')'))
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        hosts.push(ScannedHost {
            ip,
            hostname,
            up: status.trim().eq_ignore_ascii_case("up"),
        });
    }
    hosts
}

/// Ping sweep of `ip/prefix`.
pub fn scan(settings: &Settings, ip: Ipv4Addr, prefix: u8) -> Result<Vec<ScannedHost>, Error> {
    let target = format!("{ip}/{prefix}");
    log::info!("scan {target}");
    let out = syscommand_timeout(
        ["nmap", "-sn", "-oG", "-", target.as_str()],
        SyscommandSettings {
            expected_code: Some(0),
            ..SyscommandSettings::from_shell(&settings.shell)
        },
    )
    .inspect_err(|e| log::error!("nmap on {target} failed: {e}"))?;
    Ok(parse_grepable(&out.stdout))
}

/// Scans every network of every usable interface.
pub fn run(settings: &Settings) -> Result<Vec<ScannedHost>, Error> {
    let mut found = Vec::new();
    for name in interfaces()? {
        for (ip, prefix) in ipv4_networks(&name)? {
            log::info!("found interface {name} {ip}/{prefix}");
            for host in scan(settings, ip, prefix)? {
                log::info!("{host}");
                found.push(host);
            }
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use asserting::prelude::*;

    const NMAP_OUTPUT: &str = "# Nmap 7.94 scan initiated as: nmap -sn -oG - 192.168.1.0/24
Host: 192.168.1.1 (router.lan)\tStatus: Up
Host: 192.168.1.20 ()\tStatus: Up
Host: 192.168.1.31 ()\tStatus: Down
# Nmap done at Sat Oct 18 12:00:00 2025 -- 256 IP addresses (2 hosts up) scanned in 2.31 seconds
";

    #[test]
    fn test_netmask_to_prefix() {
        assert_that!(netmask_to_prefix(Ipv4Addr::new(255, 255, 255, 0))).has_value(24);
        assert_that!(netmask_to_prefix(Ipv4Addr::new(255, 255, 240, 0))).has_value(20);
        assert_that!(netmask_to_prefix(Ipv4Addr::new(255, 255, 255, 255))).has_value(32);
        assert_that!(netmask_to_prefix(Ipv4Addr::new(0, 0, 0, 0))).has_value(0);
        assert_that!(netmask_to_prefix(Ipv4Addr::new(255, 0, 255, 0))).is_err();
    }

    #[test]
    fn test_parse_grepable() {
        let hosts = parse_grepable(NMAP_OUTPUT);
        assert_that!(hosts.len()).is_equal_to(3);
        assert_that!(&hosts[0]).is_equal_to(&ScannedHost {
            ip: Ipv4Addr::new(192, 168, 1, 1),
            hostname: Some("router.lan".to_string()),
            up: true,
        });
        assert_that!(hosts[1].hostname.is_none()).is_true();
        assert_that!(hosts[2].up).is_false();
        assert_that!(hosts[0].to_string()).is_equal_to("192.168.1.1 (router.lan) up");
    }

    #[test]
    fn test_parse_garbage() {
        assert_that!(parse_grepable("Host: nonsense\tStatus: Up\nrandom").len()).is_equal_to(0);
    }

    #[test]
    fn test_interfaces_sorted() {
        let names = interfaces().unwrap();
        let mut sorted = names.clone();
        sorted.sort();
        sorted.dedup();
        assert_that!(names).is_equal_to(sorted);
    }
}
