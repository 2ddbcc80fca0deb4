//! Discovery boundary.
//!
//! The multicast-DNS transport lives outside this crate; it feeds the peer
//! registry typed announcement values built from the service TXT metadata.
//! An announcement is only considered valid when it declares a real service
//! type and carries a hostname.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Service type value for a live announcement
pub const SERVICE_TYPE_REAL: &str = "real";

/// Service type value for the transient flush placeholder some peers publish
/// while re-registering
pub const SERVICE_TYPE_FLUSH: &str = "flush";

/// One peer announcement as consumed from the discovery collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAnnouncement {
    /// Stable instance identifier of the announcing peer
    pub instance_id: String,

    /// Transfer port the peer listens on
    pub port: u16,

    /// Announced IPv4 address, if any
    pub ipv4: Option<Ipv4Addr>,

    /// Announced IPv6 address, if any
    pub ipv6: Option<Ipv6Addr>,

    /// `hostname` TXT field
    pub hostname: Option<String>,

    /// `type` TXT field (`real` or `flush`)
    pub kind: Option<String>,

    /// `os` TXT field
    pub os: Option<String>,

    /// `api-version` TXT field, clamped to the supported range on use
    pub api_version: Option<String>,

    /// `auth-port` TXT field
    pub auth_port: Option<u16>,
}

impl ServiceAnnouncement {
    /// True when the announcement represents a connectable peer
    #[must_use]
    pub fn is_real(&self) -> bool {
        self.kind.as_deref() == Some(SERVICE_TYPE_REAL)
            && self.hostname.as_deref().is_some_and(|h| !h.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement() -> ServiceAnnouncement {
        ServiceAnnouncement {
            instance_id: "peer-1".into(),
            port: 42000,
            ipv4: Some(Ipv4Addr::new(192, 168, 1, 20)),
            ipv6: None,
            hostname: Some("workbench".into()),
            kind: Some(SERVICE_TYPE_REAL.into()),
            os: Some("Linux".into()),
            api_version: Some("2".into()),
            auth_port: Some(42001),
        }
    }

    #[test]
    fn real_announcement_accepted() {
        assert!(announcement().is_real());
    }

    #[test]
    fn flush_placeholder_rejected() {
        let mut ann = announcement();
        ann.kind = Some(SERVICE_TYPE_FLUSH.into());
        assert!(!ann.is_real());
    }

    #[test]
    fn missing_hostname_rejected() {
        let mut ann = announcement();
        ann.hostname = None;
        assert!(!ann.is_real());
        ann.hostname = Some(String::new());
        assert!(!ann.is_real());
    }

    #[test]
    fn missing_kind_rejected() {
        let mut ann = announcement();
        ann.kind = None;
        assert!(!ann.is_real());
    }
}
