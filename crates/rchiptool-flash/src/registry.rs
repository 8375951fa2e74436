//! Transport registry
//!
//! Opens a device link from a connection string. The scheme selects the
//! transport:
//!
//! - `serial:<device>[:baud]` or a bare device path - serial port
//! - `tcp:<host>:<port>` - TCP serial bridge
//! - `mock:<family>[,key=value...]` - in-memory emulated device

use std::collections::HashMap;

use rchiptool_core::family::Registry;

use crate::handle::DeviceHandle;

/// Parsed connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    /// Scheme (`serial`, `tcp`, `mock`)
    pub scheme: String,
    /// Everything after the scheme
    pub target: String,
    /// Key-value parameters (only used by `mock:`)
    pub params: HashMap<String, String>,
}

/// Split a connection string into scheme, target and parameters
///
/// Format: `scheme:target` or `scheme:target,key1=value1,key2=value2`.
/// Strings without a known scheme are treated as serial device paths.
pub fn parse_transport_params(s: &str) -> Result<TransportParams, Box<dyn std::error::Error>> {
    let (scheme, rest) = match s.split_once(':') {
        Some((scheme, rest)) if matches!(scheme, "serial" | "tcp" | "mock") => (scheme, rest),
        _ => ("serial", s),
    };

    // Serial and TCP targets carry their own syntax
    if scheme != "mock" {
        return Ok(TransportParams {
            scheme: scheme.to_string(),
            target: rest.to_string(),
            params: HashMap::new(),
        });
    }

    let mut parts = rest.split(',');
    let target = parts.next().unwrap_or_default().to_string();
    let mut params = HashMap::new();
    for opt in parts {
        if let Some((key, value)) = opt.split_once('=') {
            params.insert(key.to_string(), value.to_string());
        } else {
            return Err(format!("Invalid parameter format: '{}' (expected key=value)", opt).into());
        }
    }

    Ok(TransportParams {
        scheme: scheme.to_string(),
        target,
        params,
    })
}

/// Open a device link from a connection string
///
/// The registry resolves the family named by `mock:` strings.
///
/// # Example
/// ```ignore
/// let registry = Registry::builtin()?;
/// let handle = open_transport("serial:/dev/ttyUSB0:115200", &registry)?;
/// ```
pub fn open_transport(
    spec: &str,
    #[cfg_attr(not(feature = "mock"), allow(unused_variables))] registry: &Registry,
) -> Result<DeviceHandle, Box<dyn std::error::Error>> {
    let params = parse_transport_params(spec)?;

    match params.scheme.as_str() {
        #[cfg(feature = "serial")]
        "serial" | "tcp" => open_serial(spec),

        #[cfg(feature = "mock")]
        "mock" => open_mock(spec, &params, registry),

        other => Err(format!(
            "Unsupported transport: {} (available: {})",
            other,
            transport_names_short()
        )
        .into()),
    }
}

#[cfg(feature = "serial")]
fn open_serial(spec: &str) -> Result<DeviceHandle, Box<dyn std::error::Error>> {
    let conn = rchiptool_serial::Connection::parse(spec)?;
    log::info!("Opening {}", conn);
    let transport = conn
        .open()
        .map_err(|e| format!("Failed to open {}: {}", conn, e))?;
    Ok(DeviceHandle::new(conn.to_string(), transport))
}

#[cfg(feature = "mock")]
fn open_mock(
    spec: &str,
    params: &TransportParams,
    registry: &Registry,
) -> Result<DeviceHandle, Box<dyn std::error::Error>> {
    use rchiptool_mock::{MockConfig, MockDevice};

    if params.target.is_empty() {
        return Err("mock requires a family.\nUsage: mock:<family>[,verify=off,max_chunk=N]".into());
    }
    let family = registry
        .resolve(&params.target)
        .ok_or_else(|| format!("Unknown family for mock device: {}", params.target))?;

    let mut config = MockConfig::for_family(family);
    for (key, value) in &params.params {
        match key.as_str() {
            "verify" => config.verify = parse_switch(value)?,
            "max_chunk" => {
                config.max_chunk = value
                    .parse()
                    .map_err(|_| format!("Invalid max_chunk: {}", value))?
            }
            "max_write_len" => {
                config.max_write_len = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid max_write_len: {}", value))?,
                )
            }
            _ => log::warn!("mock: ignoring unknown parameter {}", key),
        }
    }

    log::info!(
        "Emulating a {} bootloader ({})",
        family.name,
        family.protocol.name()
    );
    Ok(DeviceHandle::new(spec, Box::new(MockDevice::new(config))).with_family_hint(family.code))
}

#[cfg(feature = "mock")]
fn parse_switch(value: &str) -> Result<bool, String> {
    match value {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(format!("Invalid switch value: {}", value)),
    }
}

/// Information about a transport
#[derive(Debug, Clone)]
pub struct TransportInfo {
    /// Scheme used in connection strings
    pub scheme: &'static str,
    /// Short description
    pub description: &'static str,
}

/// Get information about all available transports (enabled at compile time)
#[allow(unused_mut, clippy::vec_init_then_push)]
pub fn available_transports() -> Vec<TransportInfo> {
    let mut transports = Vec::new();

    #[cfg(feature = "serial")]
    transports.push(TransportInfo {
        scheme: "serial",
        description: "Serial port (serial:<device>[:baud], default 115200)",
    });

    #[cfg(feature = "serial")]
    transports.push(TransportInfo {
        scheme: "tcp",
        description: "TCP serial bridge such as ser2net (tcp:<host>:<port>)",
    });

    #[cfg(feature = "mock")]
    transports.push(TransportInfo {
        scheme: "mock",
        description: "In-memory emulated bootloader (mock:<family>[,verify=off,max_chunk=N])",
    });

    transports
}

/// Generate a short list of transport schemes for CLI help
pub fn transport_names_short() -> String {
    let transports = available_transports();
    if transports.is_empty() {
        return "none (recompile with features)".to_string();
    }
    let names: Vec<&str> = transports.iter().map(|t| t.scheme).collect();
    names.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params() {
        let p = parse_transport_params("mock:bk7231n,verify=off,max_chunk=256").unwrap();
        assert_eq!(p.scheme, "mock");
        assert_eq!(p.target, "bk7231n");
        assert_eq!(p.params.get("verify").map(String::as_str), Some("off"));
        assert_eq!(p.params.get("max_chunk").map(String::as_str), Some("256"));

        let p = parse_transport_params("serial:/dev/ttyUSB0:921600").unwrap();
        assert_eq!(p.scheme, "serial");
        assert_eq!(p.target, "/dev/ttyUSB0:921600");

        let p = parse_transport_params("/dev/ttyACM0").unwrap();
        assert_eq!(p.scheme, "serial");

        assert!(parse_transport_params("mock:bk7231n,verify").is_err());
    }

    #[cfg(feature = "mock")]
    #[test]
    fn test_open_mock() {
        let registry = Registry::builtin().unwrap();
        let handle = open_transport("mock:bk7231n", &registry).unwrap();
        assert_eq!(handle.family_hint(), Some(0x7B3E_F230));
        assert_eq!(handle.name(), "mock:bk7231n");
        handle.close().unwrap();

        let handle = open_transport("mock:0x22E0D6FC,max_write_len=300", &registry).unwrap();
        assert_eq!(handle.family_hint(), Some(0x22E0_D6FC));

        assert!(open_transport("mock:", &registry).is_err());
        assert!(open_transport("mock:esp32", &registry).is_err());
        assert!(open_transport("mock:ln882h,verify=maybe", &registry).is_err());
    }

    #[test]
    fn test_available_transports() {
        let names = transport_names_short();
        #[cfg(feature = "mock")]
        assert!(names.contains("mock"));
        #[cfg(feature = "serial")]
        assert!(names.contains("tcp"));
        assert!(!names.is_empty());
    }
}
