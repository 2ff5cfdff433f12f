//! Broker endpoint parsing and TLS transport selection.
//!
//! `mqtts://` (or `ssl://`) enables TLS. Without a CA the system/webpki roots are
//! used; a client certificate and key enable mutual TLS and must come together.

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport;
use std::path::Path;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTTS_PORT: u16 = 8883;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse `[scheme://]host[:port]`. IPv6 hosts go in brackets.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }
    let remainder = remainder.trim_end_matches('/');
    if remainder.is_empty() {
        return Err(anyhow!("missing MQTT host in '{}'", addr));
    }

    let default_port = if use_tls {
        DEFAULT_MQTTS_PORT
    } else {
        DEFAULT_MQTT_PORT
    };
    let (host, port) = split_host_port(remainder, default_port)?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port.parse().context("invalid MQTT port")?,
            None if rest.is_empty() => default_port,
            None => return Err(anyhow!("invalid MQTT address: {}", addr)),
        };
        return Ok((host.to_string(), port));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().context("invalid MQTT port")?;
            Ok((host.to_string(), port))
        }
        None => Ok((addr.to_string(), default_port)),
    }
}

/// PEM material for TLS connections.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    pub ca: Option<Vec<u8>>,
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let ca = match ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT TLS CA '{}'", path.display()))?,
            ),
            None => None,
        };

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!("failed to read MQTT TLS client cert '{}'", cert_path.display())
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!("failed to read MQTT TLS client key '{}'", key_path.display())
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            _ => {
                return Err(anyhow!(
                    "MQTT TLS client cert and key must be provided together"
                ))
            }
        };

        Ok(Self { ca, client_auth })
    }

    pub fn is_empty(&self) -> bool {
        self.ca.is_none() && self.client_auth.is_none()
    }

    pub fn build_transport(&self, endpoint: &MqttEndpoint) -> Result<Transport> {
        if !endpoint.use_tls {
            if !self.is_empty() {
                return Err(anyhow!(
                    "MQTT TLS materials provided but the broker URL is not mqtts://"
                ));
            }
            return Ok(Transport::tcp());
        }

        if self.is_empty() {
            return Ok(Transport::tls_with_default_config());
        }

        let ca = self.ca.clone().ok_or_else(|| {
            anyhow!("MQTT TLS CA certificate is required when providing client certificates")
        })?;
        Ok(Transport::tls(ca, self.client_auth.clone(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_endpoints() -> Result<()> {
        assert_eq!(
            parse_mqtt_endpoint("mqtt://broker.local:1884")?,
            MqttEndpoint {
                host: "broker.local".into(),
                port: 1884,
                use_tls: false
            }
        );
        let tls = parse_mqtt_endpoint("mqtts://broker.local")?;
        assert!(tls.use_tls);
        assert_eq!(tls.port, DEFAULT_MQTTS_PORT);
        assert_eq!(parse_mqtt_endpoint("10.0.0.5")?.port, DEFAULT_MQTT_PORT);
        let v6 = parse_mqtt_endpoint("[::1]:1883")?;
        assert_eq!(v6.host, "::1");
        Ok(())
    }

    #[test]
    fn rejects_bad_endpoints() {
        assert!(parse_mqtt_endpoint("http://broker").is_err());
        assert!(parse_mqtt_endpoint("mqtt://").is_err());
        assert!(parse_mqtt_endpoint("broker:notaport").is_err());
    }

    #[test]
    fn tls_materials_require_tls_endpoint() -> Result<()> {
        let plain = parse_mqtt_endpoint("mqtt://broker")?;
        let materials = TlsMaterials {
            ca: Some(b"pem".to_vec()),
            client_auth: None,
        };
        assert!(materials.build_transport(&plain).is_err());
        assert!(TlsMaterials::default().build_transport(&plain).is_ok());
        Ok(())
    }

    #[test]
    fn client_cert_without_key_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cert = dir.path().join("client.pem");
        std::fs::write(&cert, b"cert")?;
        assert!(TlsMaterials::load(None, Some(&cert), None).is_err());
        Ok(())
    }
}
