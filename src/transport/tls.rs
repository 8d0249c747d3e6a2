//! Broker addresses and TLS material for the MQTT transports.
//!
//! An address is `host:port` or `[v6]:port`, optionally behind a scheme:
//! `mqtt://` / `tcp://` for plain TCP, `mqtts://` / `ssl://` for TLS.

use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl MqttEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls: false,
        }
    }
}

impl std::fmt::Display for MqttEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.use_tls { "mqtts" } else { "mqtt" };
        match self.host.contains(':') {
            true => write!(f, "{}://[{}]:{}", scheme, self.host, self.port),
            false => write!(f, "{}://{}:{}", scheme, self.host, self.port),
        }
    }
}

impl FromStr for MqttEndpoint {
    type Err = anyhow::Error;

    fn from_str(addr: &str) -> Result<Self> {
        let addr = addr.trim();
        let (use_tls, authority) = match addr.split_once("://") {
            Some((scheme, rest)) => (scheme_uses_tls(scheme)?, rest),
            None => (false, addr),
        };

        let (host, port) = match authority.strip_prefix('[') {
            Some(bracketed) => {
                let (host, tail) = bracketed
                    .split_once(']')
                    .ok_or_else(|| anyhow!("broker address '{}' has an unclosed '['", addr))?;
                (host, tail.strip_prefix(':'))
            }
            None => match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            },
        };

        let port = port.ok_or_else(|| anyhow!("broker address '{}' has no port", addr))?;
        let port = port
            .parse::<u16>()
            .with_context(|| format!("broker address '{}' has a bad port '{}'", addr, port))?;
        if host.is_empty() {
            bail!("broker address '{}' has no host", addr);
        }
        Ok(Self {
            host: host.to_string(),
            port,
            use_tls,
        })
    }
}

fn scheme_uses_tls(scheme: &str) -> Result<bool> {
    match scheme.to_ascii_lowercase().as_str() {
        "mqtt" | "tcp" => Ok(false),
        "mqtts" | "ssl" => Ok(true),
        other => bail!("broker scheme '{}' is not MQTT", other),
    }
}

/// Parse a broker address. `force_tls` turns TLS on even for plain schemes.
pub fn parse_mqtt_endpoint(addr: &str, force_tls: bool) -> Result<MqttEndpoint> {
    let mut endpoint: MqttEndpoint = addr.parse()?;
    endpoint.use_tls |= force_tls;
    Ok(endpoint)
}

/// PEM bytes for broker TLS.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// `None` trusts the default root store.
    pub ca: Option<Vec<u8>>,
    /// Client certificate and key.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert), Some(key)) => Some((
                read_pem("client certificate", cert)?,
                read_pem("client key", key)?,
            )),
            (None, None) => None,
            _ => bail!("broker client certificate and key must be given together"),
        };
        let ca = ca_path.map(|path| read_pem("CA bundle", path)).transpose()?;
        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }

    pub fn build_transport(&self, endpoint: &MqttEndpoint) -> Result<rumqttc::Transport> {
        match (endpoint.use_tls, self.is_configured()) {
            (false, false) => Ok(rumqttc::Transport::tcp()),
            (false, true) => bail!(
                "TLS material is set for {} but TLS is off (use mqtts:// or DS_MQTT_USE_TLS=1)",
                endpoint
            ),
            (true, false) => Ok(rumqttc::Transport::tls_with_default_config()),
            (true, true) => {
                let ca = self.ca.clone().ok_or_else(|| {
                    anyhow!("client certificate for {} needs a CA bundle", endpoint)
                })?;
                Ok(rumqttc::Transport::tls(ca, self.client_auth.clone(), None))
            }
        }
    }
}

fn read_pem(what: &str, path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .with_context(|| format!("cannot read broker {} at {}", what, path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_host_port() {
        let ep = parse_mqtt_endpoint("127.0.0.1:1883", false).unwrap();
        assert_eq!(ep, MqttEndpoint::new("127.0.0.1", 1883));
    }

    #[test]
    fn tls_schemes_and_override() {
        let ep = parse_mqtt_endpoint("mqtts://broker.local:8883", false).unwrap();
        assert_eq!(ep.host, "broker.local");
        assert!(ep.use_tls);
        assert!(parse_mqtt_endpoint("SSL://broker.local:8883", false).unwrap().use_tls);
        assert!(!parse_mqtt_endpoint("tcp://broker.local:1883", false).unwrap().use_tls);
        assert!(parse_mqtt_endpoint("tcp://broker.local:1883", true).unwrap().use_tls);
    }

    #[test]
    fn bracketed_ipv6() {
        let ep: MqttEndpoint = "[::1]:1883".parse().unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 1883);
        assert_eq!(ep.to_string(), "mqtt://[::1]:1883");
    }

    #[test]
    fn rejects_bad_addresses() {
        for addr in [
            "ws://host:80",
            "host-without-port",
            "host:notaport",
            ":1883",
            "[::1:1883",
            "[::1]",
        ] {
            assert!(parse_mqtt_endpoint(addr, false).is_err(), "{addr} should fail");
        }
    }

    #[test]
    fn client_cert_needs_key() {
        let err = TlsMaterials::load(None, Some(Path::new("/nonexistent/cert.pem")), None)
            .unwrap_err();
        assert!(err.to_string().contains("given together"));
    }

    #[test]
    fn material_without_tls_is_rejected() {
        let materials = TlsMaterials {
            ca: Some(b"pem".to_vec()),
            client_auth: None,
        };
        let err = match materials.build_transport(&MqttEndpoint::new("127.0.0.1", 1883)) {
            Err(e) => e,
            Ok(_) => panic!("expected an error for TLS material on a plain endpoint"),
        };
        assert!(err.to_string().contains("TLS is off"));
    }

    #[test]
    fn plain_endpoint_without_material_builds() {
        let built = TlsMaterials::default().build_transport(&MqttEndpoint::new("localhost", 1883));
        assert!(built.is_ok());
    }
}
