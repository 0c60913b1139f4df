use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::config::NetworkConfig;

/// Reachability check run before asking the remote for new revisions. A host
/// without uplink skips the cycle instead of reporting a check failure.
#[derive(Debug, Clone)]
pub struct ConnectivityProbe {
    addr: String,
    timeout: Duration,
}

impl ConnectivityProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    pub fn is_online(&self) -> bool {
        let addrs = match self.addr.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!(addr = %self.addr, error = %e, "probe address did not resolve");
                return false;
            }
        };
        for addr in addrs {
            if TcpStream::connect_timeout(&addr, self.timeout).is_ok() {
                return true;
            }
        }
        debug!(addr = %self.addr, "connectivity probe failed");
        false
    }
}

impl From<&NetworkConfig> for ConnectivityProbe {
    fn from(cfg: &NetworkConfig) -> Self {
        Self::new(cfg.probe.clone(), Duration::from_millis(cfg.timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn listening_port_is_online() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let probe = ConnectivityProbe::new(addr.to_string(), Duration::from_millis(500));
        assert!(probe.is_online());
    }

    #[test]
    fn closed_port_is_offline() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let probe = ConnectivityProbe::new(addr.to_string(), Duration::from_millis(200));
        assert!(!probe.is_online());
    }

    #[test]
    fn unresolvable_address_is_offline() {
        let probe = ConnectivityProbe::new("not an address", Duration::from_millis(50));
        assert!(!probe.is_online());
    }
}
