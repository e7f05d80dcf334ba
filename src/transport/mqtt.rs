//! MQTT connection plumbing for alert delivery.
//!
//! Endpoint parsing and TLS transport selection for the `rumqttc` client:
//! - CA verification: custom CA path or system roots
//! - Plain TCP for `mqtt://`/`tcp://`, TLS for `mqtts://`/`ssl://` or `use_tls`

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport;
use std::path::Path;

/// TLS certificate materials for MQTT connections.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// PEM-encoded CA certificate bytes. `None` uses the webpki roots.
    pub ca: Option<Vec<u8>>,
}

impl TlsMaterials {
    pub fn load(ca_path: Option<&Path>) -> Result<Self> {
        let ca = match ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT TLS CA '{}'", path.display()))?,
            ),
            None => None,
        };
        Ok(Self { ca })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl MqttEndpoint {
    /// Build a rumqttc Transport for this endpoint.
    pub fn build_transport(&self, tls: &TlsMaterials) -> Result<Transport> {
        if !self.use_tls {
            if tls.is_configured() {
                return Err(anyhow!(
                    "MQTT TLS CA provided but TLS is disabled (set use_tls or use mqtts://)"
                ));
            }
            return Ok(Transport::tcp());
        }
        match &tls.ca {
            None => Ok(Transport::tls_with_default_config()),
            Some(ca) => Ok(Transport::tls(ca.clone(), None, None)),
        }
    }
}

/// Parse an MQTT broker address.
///
/// Supports formats:
/// - `host:port` (plain TCP or TLS based on tls_override)
/// - `host` (default port 1883, or 8883 with TLS)
/// - `mqtt://host:port`, `tcp://host:port` (plain TCP)
/// - `mqtts://host:port`, `ssl://host:port` (TLS)
/// - `[ipv6]:port`
pub fn parse_mqtt_endpoint(addr: &str, tls_override: bool) -> Result<MqttEndpoint> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }
    if remainder.is_empty() {
        return Err(anyhow!("MQTT broker address is empty"));
    }

    let default_port = if use_tls { 8883 } else { 1883 };
    let (host, port) = split_host_port(remainder, default_port)?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16)> {
    // [::1]:1883
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port
                .parse()
                .with_context(|| format!("invalid MQTT port in {}", addr))?,
            None if rest.is_empty() => default_port,
            None => return Err(anyhow!("invalid MQTT address: {}", addr)),
        };
        return Ok((host.to_string(), port));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid MQTT port in {}", addr))?;
            Ok((host.to_string(), port))
        }
        None => Ok((addr.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_endpoint_plain() -> Result<()> {
        let endpoint = parse_mqtt_endpoint("broker.local:1884", false)?;
        assert_eq!(endpoint.host, "broker.local");
        assert_eq!(endpoint.port, 1884);
        assert!(!endpoint.use_tls);
        Ok(())
    }

    #[test]
    fn parse_endpoint_mqtts_scheme_defaults_port() -> Result<()> {
        let endpoint = parse_mqtt_endpoint("mqtts://broker.local", false)?;
        assert_eq!(endpoint.port, 8883);
        assert!(endpoint.use_tls);
        Ok(())
    }

    #[test]
    fn parse_endpoint_ipv6() -> Result<()> {
        let endpoint = parse_mqtt_endpoint("[::1]:1883", false)?;
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.port, 1883);
        Ok(())
    }

    #[test]
    fn parse_endpoint_rejects_bad_input() {
        assert!(parse_mqtt_endpoint("http://broker:1883", false).is_err());
        assert!(parse_mqtt_endpoint("broker:notaport", false).is_err());
        assert!(parse_mqtt_endpoint("mqtt://", false).is_err());
    }

    #[test]
    fn ca_without_tls_is_rejected() {
        let endpoint = MqttEndpoint {
            host: "broker".into(),
            port: 1883,
            use_tls: false,
        };
        let tls = TlsMaterials {
            ca: Some(b"pem".to_vec()),
        };
        assert!(endpoint.build_transport(&tls).is_err());
        assert!(endpoint.build_transport(&TlsMaterials::default()).is_ok());
    }
}
