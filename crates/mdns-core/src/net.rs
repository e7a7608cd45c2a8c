use std::io::Error;
use std::net::IpAddr;

use crate::model::InterfaceIp;

pub fn list_interface_ips_result() -> Result<Vec<InterfaceIp>, Error> {
    let ifs = if_addrs::get_if_addrs()?;

    let mut out: Vec<InterfaceIp> = ifs
        .into_iter()
        .map(|ifa| {
            let ip = ifa.ip();
            let is_loopback = ip.is_loopback();

            InterfaceIp {
                name: ifa.name,
                ip,
                is_loopback,
            }
        })
        .collect();

    out.sort_by(|a, b| (&a.name, &a.ip).cmp(&(&b.name, &b.ip)));
    out.dedup_by(|a, b| a.name == b.name && a.ip == b.ip);
    Ok(out)
}

/// Addresses worth putting in an A/AAAA record for a socket bound to
/// `bound`: no loopback, no unspecified, no IPv6 link-local (those need a
/// scope id to be dialed), and only the family the socket can answer on. A
/// socket bound to one address is only reachable there.
pub fn advertisable(ips: &[InterfaceIp], bound: IpAddr) -> Vec<IpAddr> {
    let mut out: Vec<IpAddr> = ips
        .iter()
        .filter(|i| !i.is_loopback && !i.ip.is_unspecified())
        .filter(|i| i.ip.is_ipv4() == bound.is_ipv4())
        .filter(|i| bound.is_unspecified() || i.ip == bound)
        .filter(|i| match i.ip {
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80,
            IpAddr::V4(_) => true,
        })
        .map(|i| i.ip)
        .collect();
    out.dedup();
    out
}
