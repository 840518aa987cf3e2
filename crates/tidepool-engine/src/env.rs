//! Fabric environment configuration.
//!
//! Variable names are part of the compatibility surface. `OFI_INTERFACE`
//! and `OFI_DOMAIN` are deprecated aliases kept for old deployments; using
//! one logs a deprecation warning and the preferred name wins when both
//! are set.

use tidepool_error::{Result, StoreError};
use tracing::warn;

/// `CRT_TIMEOUT`: fabric operation timeout in seconds.
pub const ENV_TIMEOUT: &str = "CRT_TIMEOUT";
/// `D_INTERFACE`: network interface, preferred name.
pub const ENV_INTERFACE: &str = "D_INTERFACE";
/// `OFI_INTERFACE`: deprecated alias of [`ENV_INTERFACE`].
pub const ENV_INTERFACE_OLD: &str = "OFI_INTERFACE";
/// `D_DOMAIN`: fabric domain, preferred name.
pub const ENV_DOMAIN: &str = "D_DOMAIN";
/// `OFI_DOMAIN`: deprecated alias of [`ENV_DOMAIN`].
pub const ENV_DOMAIN_OLD: &str = "OFI_DOMAIN";
/// `D_PROVIDER`: fabric provider string.
pub const ENV_PROVIDER: &str = "D_PROVIDER";
/// `FI_OFI_RXM_USE_SRX`: shared-receive-context mode; must match the
/// server.
pub const ENV_SRX: &str = "FI_OFI_RXM_USE_SRX";
/// `CRT_SECONDARY_PROVIDER`: numeric secondary-provider index.
pub const ENV_SECONDARY_PROVIDER: &str = "CRT_SECONDARY_PROVIDER";

/// Parsed fabric settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FabricConfig {
    pub timeout_secs: Option<u64>,
    pub interface: Option<String>,
    pub domain: Option<String>,
    pub provider: Option<String>,
    pub use_srx: Option<bool>,
    pub secondary_provider: Option<u32>,
}

impl FabricConfig {
    /// Read from the process environment.
    pub fn from_env() -> Result<FabricConfig> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read through a caller-supplied lookup, for tests and embedding.
    pub fn from_lookup<F>(lookup: F) -> Result<FabricConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_u64 = |name: &str, value: String| -> Result<u64> {
            value.parse().map_err(|_| {
                StoreError::invalid(format!("{name} wants an integer, got {value:?}"))
            })
        };

        let timeout_secs = match lookup(ENV_TIMEOUT) {
            Some(value) => Some(parse_u64(ENV_TIMEOUT, value)?),
            None => None,
        };

        let interface = resolve_alias(&lookup, ENV_INTERFACE, ENV_INTERFACE_OLD);
        let domain = resolve_alias(&lookup, ENV_DOMAIN, ENV_DOMAIN_OLD);
        let provider = lookup(ENV_PROVIDER);

        let use_srx = match lookup(ENV_SRX) {
            Some(value) => match value.as_str() {
                "0" => Some(false),
                "1" => Some(true),
                other => {
                    return Err(StoreError::invalid(format!(
                        "{ENV_SRX} wants 0 or 1, got {other:?}"
                    )))
                }
            },
            None => None,
        };

        let secondary_provider = match lookup(ENV_SECONDARY_PROVIDER) {
            Some(value) => Some(parse_u64(ENV_SECONDARY_PROVIDER, value)? as u32),
            None => None,
        };

        Ok(FabricConfig {
            timeout_secs,
            interface,
            domain,
            provider,
            use_srx,
            secondary_provider,
        })
    }

    /// Reject startup when the client's SRX mode disagrees with the
    /// server's.
    pub fn check_srx_match(&self, server_srx: bool) -> Result<()> {
        match self.use_srx {
            Some(client) if client != server_srx => Err(StoreError::AgentIncompat {
                detail: format!(
                    "{ENV_SRX} mismatch: client {client}, server {server_srx}"
                ),
            }),
            _ => Ok(()),
        }
    }
}

fn resolve_alias<F>(lookup: &F, preferred: &str, deprecated: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let new = lookup(preferred);
    let old = lookup(deprecated);
    if old.is_some() {
        warn!(
            name = deprecated,
            replacement = preferred,
            "deprecated environment variable in use"
        );
    }
    new.or(old)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(map: &'a HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| map.get(name).map(|v| (*v).to_string())
    }

    #[test]
    fn parses_the_full_set() {
        let map = HashMap::from([
            (ENV_TIMEOUT, "60"),
            (ENV_INTERFACE, "eth0"),
            (ENV_DOMAIN, "mlx5_0"),
            (ENV_PROVIDER, "ofi+verbs"),
            (ENV_SRX, "1"),
            (ENV_SECONDARY_PROVIDER, "2"),
        ]);
        let cfg = FabricConfig::from_lookup(lookup_from(&map)).unwrap();
        assert_eq!(cfg.timeout_secs, Some(60));
        assert_eq!(cfg.interface.as_deref(), Some("eth0"));
        assert_eq!(cfg.domain.as_deref(), Some("mlx5_0"));
        assert_eq!(cfg.provider.as_deref(), Some("ofi+verbs"));
        assert_eq!(cfg.use_srx, Some(true));
        assert_eq!(cfg.secondary_provider, Some(2));
    }

    #[test]
    fn deprecated_alias_applies_when_preferred_is_unset() {
        let map = HashMap::from([(ENV_INTERFACE_OLD, "ib0")]);
        let cfg = FabricConfig::from_lookup(lookup_from(&map)).unwrap();
        assert_eq!(cfg.interface.as_deref(), Some("ib0"));
    }

    #[test]
    fn preferred_name_wins_over_alias() {
        let map = HashMap::from([(ENV_INTERFACE, "eth0"), (ENV_INTERFACE_OLD, "ib0")]);
        let cfg = FabricConfig::from_lookup(lookup_from(&map)).unwrap();
        assert_eq!(cfg.interface.as_deref(), Some("eth0"));
    }

    #[test]
    fn srx_mismatch_rejects_startup() {
        let map = HashMap::from([(ENV_SRX, "0")]);
        let cfg = FabricConfig::from_lookup(lookup_from(&map)).unwrap();
        assert!(matches!(
            cfg.check_srx_match(true),
            Err(StoreError::AgentIncompat { .. })
        ));
        cfg.check_srx_match(false).unwrap();
        // Unset on the client side matches anything.
        let cfg = FabricConfig::default();
        cfg.check_srx_match(true).unwrap();
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let map = HashMap::from([(ENV_TIMEOUT, "soon")]);
        assert!(FabricConfig::from_lookup(lookup_from(&map)).is_err());
        let map = HashMap::from([(ENV_SRX, "yes")]);
        assert!(FabricConfig::from_lookup(lookup_from(&map)).is_err());
    }
}
