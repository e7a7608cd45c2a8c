use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::model::{instance_from_fullname, PeerAdvertisement, TxtRecord};
use crate::DiscoveryError;

/// Collect resolved services of `service_type` for `window`, then return them.
///
/// An empty list is a normal result. Cancelling `cancel` ends the window
/// early with whatever has been resolved so far. The order of the returned
/// list is unspecified.
pub async fn browse(
    service_type: &str,
    window: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<PeerAdvertisement>, DiscoveryError> {
    let daemon = ServiceDaemon::new()?;
    let service_type = if service_type.ends_with('.') {
        service_type.to_string()
    } else {
        format!("{}.", service_type)
    };

    let receiver = daemon.browse(&service_type)?;
    let mut found: HashMap<String, PeerAdvertisement> = HashMap::new();

    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = cancel.cancelled() => {
                tracing::debug!("browse cancelled");
                break;
            }
            event = receiver.recv_async() => match event {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    let adv = to_advertisement(&info, &service_type);
                    tracing::debug!(instance = %adv.instance_name, port = adv.port, "resolved peer");
                    found.insert(adv.fullname.clone(), adv);
                }
                Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                    found.remove(&fullname);
                }
                Ok(_) => {}
                Err(_) => break,
            },
        }
    }

    if let Err(e) = daemon.stop_browse(&service_type) {
        tracing::debug!("stop_browse failed: {}", e);
    }
    if let Err(e) = daemon.shutdown() {
        tracing::debug!("mdns daemon shutdown failed: {}", e);
    }

    Ok(found.into_values().collect())
}

fn to_advertisement(info: &ServiceInfo, service_type: &str) -> PeerAdvertisement {
    let txt = TxtRecord::from_pairs(
        info.get_properties()
            .iter()
            .map(|prop| (prop.key().to_string(), prop.val_str().to_string())),
    );

    let mut ipv4 = None;
    let mut ipv6 = None;
    let mut addrs: Vec<&IpAddr> = info.get_addresses().iter().collect();
    addrs.sort();
    for addr in addrs {
        match addr {
            IpAddr::V4(v4) if ipv4.is_none() => ipv4 = Some(*v4),
            IpAddr::V6(v6) if ipv6.is_none() => ipv6 = Some(*v6),
            _ => {}
        }
    }

    PeerAdvertisement {
        fullname: info.get_fullname().to_string(),
        instance_name: instance_from_fullname(info.get_fullname(), service_type),
        host_name: info.get_hostname().to_string(),
        port: info.get_port(),
        ipv4,
        ipv6,
        txt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SERVICE_TYPE;

    #[test]
    fn resolved_info_maps_to_advertisement() {
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            "bob@box",
            "box.local.",
            "192.168.1.9",
            40000,
            &[("fp", "ABCD"), ("ver", "1"), ("user", "bob"), ("host", "box")][..],
        )
        .unwrap();

        let adv = to_advertisement(&info, SERVICE_TYPE);
        assert_eq!(adv.instance_name, "bob@box");
        assert_eq!(adv.port, 40000);
        assert_eq!(adv.ipv4, Some("192.168.1.9".parse().unwrap()));
        assert_eq!(adv.fingerprint(), Some("ABCD"));
        assert!(adv.is_dialable());
    }

    #[tokio::test]
    async fn short_window_returns_promptly() {
        let start = std::time::Instant::now();
        let cancel = CancellationToken::new();
        // Sandboxes without multicast may refuse the daemon socket; only the
        // timing of a successful browse is asserted.
        if let Ok(peers) = browse(SERVICE_TYPE, Duration::from_millis(100), &cancel).await {
            assert!(start.elapsed() < Duration::from_secs(2));
            assert!(peers.iter().all(|p| !p.fullname.is_empty()));
        }
    }

    #[tokio::test]
    async fn cancellation_ends_window_early() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = std::time::Instant::now();
        let _ = browse(SERVICE_TYPE, Duration::from_secs(30), &cancel).await;
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
