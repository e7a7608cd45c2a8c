use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const SERVICE_TYPE: &str = "_gns3util-share._udp.local.";

/// Value of the `ver` TXT key this build speaks.
pub const PROTOCOL_VERSION: &str = "1";

pub const TXT_FP: &str = "fp";
pub const TXT_VER: &str = "ver";
pub const TXT_USER: &str = "user";
pub const TXT_HOST: &str = "host";

/// TXT key/value map. Keys are case-insensitive and stored lower-cased; the
/// first occurrence of a key wins (RFC 6763 section 6.4), which is also what
/// the mdns-sd decoder hands us.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxtRecord(pub BTreeMap<String, String>);

impl TxtRecord {
    /// Parse raw `key=value` entries, splitting on the first `=` only.
    /// An entry without `=` is a key with an empty value.
    pub fn parse<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self::from_pairs(
            entries
                .into_iter()
                .map(|entry| entry.split_once('=').unwrap_or((entry, ""))),
        )
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut map = BTreeMap::new();
        for (k, v) in pairs {
            let key = k.into().to_ascii_lowercase();
            if key.is_empty() {
                continue;
            }
            map.entry(key).or_insert_with(|| v.into());
        }
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_string(), value.to_string());
    }

    pub fn to_pairs(&self) -> Vec<(String, String)> {
        self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAnnouncement {
    /// e.g. "_gns3util-share._udp.local."
    pub service_type: String,
    /// e.g. "alice@lab-1"
    pub instance_name: String,
    /// e.g. "lab-1.local."
    pub host_name: String,
    /// Empty means "let the daemon pick interface addresses".
    pub ip_addrs: Vec<IpAddr>,
    pub port: u16,
    pub txt: TxtRecord,
}

/// One resolved peer from a browse window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAdvertisement {
    pub fullname: String,
    pub instance_name: String,
    pub host_name: String,
    pub port: u16,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub txt: TxtRecord,
}

impl PeerAdvertisement {
    pub fn fingerprint(&self) -> Option<&str> {
        self.txt.get(TXT_FP).filter(|fp| !fp.is_empty())
    }

    pub fn version(&self) -> Option<&str> {
        self.txt.get(TXT_VER)
    }

    /// Why this record must not be dialed, if anything.
    pub fn refusal(&self) -> Option<&'static str> {
        if self.fingerprint().is_none() {
            return Some("advertisement has no fingerprint");
        }
        match self.version() {
            Some(PROTOCOL_VERSION) => None,
            Some(_) => Some("unsupported protocol version"),
            None => Some("advertisement has no protocol version"),
        }
    }

    pub fn is_dialable(&self) -> bool {
        self.refusal().is_none()
    }

    /// Preferred dial address, IPv4 first.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ipv4
            .map(IpAddr::V4)
            .or(self.ipv6.map(IpAddr::V6))
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// `user@host` from the TXT record when both are present, else the
    /// instance name.
    pub fn display_label(&self) -> String {
        match (self.txt.get(TXT_USER), self.txt.get(TXT_HOST)) {
            (Some(u), Some(h)) if !u.is_empty() && !h.is_empty() => format!("{u}@{h}"),
            _ => self.instance_name.clone(),
        }
    }
}

/// Strip `.<service_type>` from a full instance name.
pub fn instance_from_fullname(fullname: &str, service_type: &str) -> String {
    let suffix = format!(".{}", service_type.trim_end_matches('.'));
    let trimmed = fullname.trim_end_matches('.');
    trimmed
        .strip_suffix(&suffix)
        .unwrap_or(trimmed)
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceIp {
    pub name: String,
    pub ip: IpAddr,
    pub is_loopback: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adv(txt: TxtRecord) -> PeerAdvertisement {
        PeerAdvertisement {
            fullname: "alice@lab._gns3util-share._udp.local.".into(),
            instance_name: "alice@lab".into(),
            host_name: "lab.local.".into(),
            port: 4433,
            ipv4: None,
            ipv6: Some(Ipv6Addr::LOCALHOST),
            txt,
        }
    }

    #[test]
    fn parse_splits_on_first_equals() {
        let txt = TxtRecord::parse(["fp=AB=CD", "ver=1", "flag"]);
        assert_eq!(txt.get("fp"), Some("AB=CD"));
        assert_eq!(txt.get("ver"), Some("1"));
        assert_eq!(txt.get("flag"), Some(""));
    }

    #[test]
    fn first_duplicate_wins_regardless_of_case() {
        let txt = TxtRecord::parse(["user=a", "USER=b", "user=c", "=ignored"]);
        assert_eq!(txt.get("user"), Some("a"));
        assert_eq!(txt.0.len(), 1);

        let txt = TxtRecord::from_pairs([("FP", "AAAA"), ("fp", "BBBB"), ("Ver", "1")]);
        assert_eq!(txt.get("fp"), Some("AAAA"));
        assert_eq!(txt.get("ver"), Some("1"));
    }

    #[test]
    fn refusal_reasons() {
        let ok = adv(TxtRecord::parse(["fp=XYZ", "ver=1"]));
        assert!(ok.is_dialable());

        let no_fp = adv(TxtRecord::parse(["ver=1"]));
        assert_eq!(no_fp.refusal(), Some("advertisement has no fingerprint"));

        let wrong_ver = adv(TxtRecord::parse(["fp=XYZ", "ver=2"]));
        assert_eq!(wrong_ver.refusal(), Some("unsupported protocol version"));
    }

    #[test]
    fn socket_addr_prefers_ipv4() {
        let mut a = adv(TxtRecord::default());
        assert_eq!(a.socket_addr(), Some("[::1]:4433".parse().unwrap()));
        a.ipv4 = Some(Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(a.socket_addr(), Some("10.0.0.7:4433".parse().unwrap()));
    }

    #[test]
    fn display_label_falls_back_to_instance() {
        let a = adv(TxtRecord::parse(["user=bob", "host=box"]));
        assert_eq!(a.display_label(), "bob@box");
        let b = adv(TxtRecord::parse(["user=bob"]));
        assert_eq!(b.display_label(), "alice@lab");
    }

    #[test]
    fn instance_name_from_fullname() {
        assert_eq!(
            instance_from_fullname("alice@lab._gns3util-share._udp.local.", SERVICE_TYPE),
            "alice@lab"
        );
        assert_eq!(instance_from_fullname("odd", SERVICE_TYPE), "odd");
    }

    #[test]
    fn advertisement_serializes_for_json_output() {
        let a = adv(TxtRecord::parse(["fp=XYZ", "ver=1"]));
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["txt"]["fp"], "XYZ");
        assert_eq!(json["port"], 4433);
    }
}
