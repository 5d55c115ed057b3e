use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::utils::parse_headers_with_escapes;

/// Configuration for building the HTTP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-request timeout; a timed-out request becomes a failure sample
    pub request_timeout: Duration,
    pub skip_tls_verify: bool,
    pub resolve_target_addr: Option<String>,
    pub custom_headers: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            skip_tls_verify: false,
            resolve_target_addr: None,
            custom_headers: None,
        }
    }
}

/// Result of building the client, includes parsed headers for logging.
pub struct ClientBuildResult {
    pub client: reqwest::Client,
    pub parsed_headers: HeaderMap,
}

/// Builds a reqwest HTTP client with the specified configuration.
pub fn build_client(
    config: &ClientConfig,
) -> Result<ClientBuildResult, Box<dyn std::error::Error + Send + Sync>> {
    let mut client_builder = reqwest::Client::builder().timeout(config.request_timeout);

    // DNS Override Configuration
    if let Some(ref resolve_str) = config.resolve_target_addr {
        if !resolve_str.is_empty() {
            client_builder = configure_dns_override(client_builder, resolve_str)?;
        } else {
            warn!("RESOLVE_TARGET_ADDR is set but empty, no DNS override will be applied");
        }
    }

    // Custom Headers Configuration
    let parsed_headers = configure_custom_headers(config.custom_headers.as_deref())?;
    if !parsed_headers.is_empty() {
        client_builder = client_builder.default_headers(parsed_headers.clone());
        info!(count = parsed_headers.len(), "Configured custom default headers");
    }

    let client = if config.skip_tls_verify {
        warn!("Skipping TLS certificate verification");
        client_builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?
    } else {
        client_builder.build()?
    };

    Ok(ClientBuildResult {
        client,
        parsed_headers,
    })
}

fn configure_dns_override(
    client_builder: reqwest::ClientBuilder,
    resolve_str: &str,
) -> Result<reqwest::ClientBuilder, Box<dyn std::error::Error + Send + Sync>> {
    let parts: Vec<&str> = resolve_str.split(':').collect();
    if parts.len() != 3 {
        return Err(format!(
            "RESOLVE_TARGET_ADDR ('{}') is not in the expected format 'hostname:ip:port'",
            resolve_str
        )
        .into());
    }

    let hostname = parts[0].trim();
    let ip = parts[1].trim();
    let port_str = parts[2].trim();

    if hostname.is_empty() || ip.is_empty() || port_str.is_empty() {
        return Err(format!(
            "RESOLVE_TARGET_ADDR ('{}') has an empty part. Format: 'hostname:ip:port'",
            resolve_str
        )
        .into());
    }

    let port: u16 = port_str.parse().map_err(|e| {
        format!(
            "Failed to parse port '{}' in RESOLVE_TARGET_ADDR: {}",
            port_str, e
        )
    })?;

    let socket_addr: SocketAddr = format!("{}:{}", ip, port).parse().map_err(|e| {
        format!(
            "Failed to parse '{}:{}' as a socket address for RESOLVE_TARGET_ADDR: {}",
            ip, port, e
        )
    })?;

    info!(hostname = hostname, addr = %socket_addr, "Configured DNS override");
    Ok(client_builder.resolve(hostname, socket_addr))
}

fn configure_custom_headers(
    custom_headers_str: Option<&str>,
) -> Result<HeaderMap, Box<dyn std::error::Error + Send + Sync>> {
    let mut parsed_headers = HeaderMap::new();

    let headers_str = match custom_headers_str {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(parsed_headers),
    };

    for header_pair_str in parse_headers_with_escapes(headers_str) {
        let header_pair_str_trimmed = header_pair_str.trim();
        if header_pair_str_trimmed.is_empty() {
            continue;
        }

        let (name_str, value_str) = header_pair_str_trimmed.split_once(':').ok_or_else(|| {
            format!(
                "Invalid header format in CUSTOM_HEADERS: '{}'. Expected 'Name:Value'.",
                header_pair_str_trimmed
            )
        })?;
        let name_str = name_str.trim();
        let value_str = value_str.trim();

        if name_str.is_empty() {
            return Err(format!(
                "Invalid header format: Header name cannot be empty in '{}'.",
                header_pair_str_trimmed
            )
            .into());
        }

        let header_name = HeaderName::from_str(name_str)
            .map_err(|e| format!("Invalid header name: {}. Name: '{}'", e, name_str))?;
        let header_value = HeaderValue::from_str(value_str).map_err(|e| {
            format!(
                "Invalid header value for '{}': {}. Value: '{}'",
                name_str, e, value_str
            )
        })?;

        parsed_headers.insert(header_name, header_value);
    }

    Ok(parsed_headers)
}
