use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::net::SocketAddr;

use crate::model::{ServiceAnnouncement, TxtRecord};
use crate::net::{advertisable, list_interface_ips_result};
use crate::DiscoveryError;

/// Handle so the service stays registered while this is alive.
///
/// [`Announcer::stop`] withdraws the record; dropping the handle does the
/// same on a best-effort basis.
pub struct Announcer {
    daemon: Option<ServiceDaemon>,
    fullname: String,
}

impl Announcer {
    pub fn register(ann: ServiceAnnouncement) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new()?;

        let txt_kv = ann.txt.to_pairs();

        // Ensure trailing dots as mdns-sd expects FQDNs.
        let service_type = ensure_dot(&ann.service_type);
        let host_name = ensure_dot(&ann.host_name);

        let mut info = ServiceInfo::new(
            &service_type,
            &ann.instance_name,
            &host_name,
            &ann.ip_addrs[..],
            ann.port,
            &*txt_kv,
        )?;
        if ann.ip_addrs.is_empty() {
            info = info.enable_addr_auto();
        }

        let fullname = info.get_fullname().to_string();
        daemon.register(info)?;
        tracing::info!(service = %fullname, port = ann.port, "advertising");

        Ok(Self {
            daemon: Some(daemon),
            fullname,
        })
    }

    /// Withdraw the record and shut the daemon down.
    pub fn stop(mut self) {
        self.withdraw();
    }

    fn withdraw(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            if let Err(e) = daemon.unregister(&self.fullname) {
                tracing::debug!("unregister {} failed: {}", self.fullname, e);
            }
            if let Err(e) = daemon.shutdown() {
                tracing::debug!("mdns daemon shutdown failed: {}", e);
            }
            tracing::debug!(service = %self.fullname, "advertisement withdrawn");
        }
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.withdraw();
    }
}

/// Advertise `instance_name` on every interface address the socket bound to
/// `bound` can be reached at.
pub fn advertise(
    service_type: &str,
    instance_name: &str,
    host_name: &str,
    bound: SocketAddr,
    txt: TxtRecord,
) -> Result<Announcer, DiscoveryError> {
    let ip_addrs = advertisable(&list_interface_ips_result()?, bound.ip());
    // An empty list would switch mdns-sd to publishing every address.
    if ip_addrs.is_empty() {
        return Err(DiscoveryError::NoAddress(bound));
    }
    let host_name = if host_name.ends_with(".local.") || host_name.ends_with(".local") {
        host_name.to_string()
    } else {
        format!("{}.local.", host_name)
    };

    Announcer::register(ServiceAnnouncement {
        service_type: service_type.to_string(),
        instance_name: instance_name.to_string(),
        host_name,
        ip_addrs,
        port: bound.port(),
        txt,
    })
}

fn ensure_dot(s: &str) -> String {
    if s.ends_with('.') {
        s.to_string()
    } else {
        format!("{}.", s)
    }
}
