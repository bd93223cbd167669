// src/config.rs
//
// Declarative configuration schemas for devices, protocols and sessions.
// Validation only: these records describe a setup, they do not open anything.

use crate::codec::CodecRegistry;
use crate::io::{AdapterOpenOptions, DeviceType, EthProtocol, SimulatorConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised by config validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown-protocol: {0}")]
    UnknownProtocol(String),

    #[error("invalid-hex-preset '{name}': {reason}")]
    InvalidHexPreset { name: String, reason: String },

    #[error("device-path-missing: {0} device needs a locator")]
    DevicePathMissing(&'static str),

    #[error("invalid option {option}: {reason}")]
    InvalidOption { option: &'static str, reason: String },
}

// ============================================================================
// Device Config
// ============================================================================

/// Describes one endpoint to open.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    /// OS locator; not needed when `simulate` is set
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub path: Option<String>,
    #[serde(default)]
    pub simulate: bool,
    #[serde(default)]
    pub options: AdapterOpenOptions,
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let options = &self.options;

        if let Some(bits) = options.data_bits {
            if !(5..=8).contains(&bits) {
                return Err(ConfigError::InvalidOption {
                    option: "dataBits",
                    reason: format!("{} not in 5..=8", bits),
                });
            }
        }
        if let Some(mode) = options.spi_mode {
            if mode > 3 {
                return Err(ConfigError::InvalidOption {
                    option: "spiMode",
                    reason: format!("{} not in 0..=3", mode),
                });
            }
        }
        if let Some(speed) = options.i2c_bus_speed {
            if !crate::io::i2c::BUS_SPEEDS.contains(&speed) {
                return Err(ConfigError::InvalidOption {
                    option: "i2cBusSpeed",
                    reason: format!("{} Hz is not a standard bus speed", speed),
                });
            }
        }
        if let Some(mode) = options.i2c_address_mode {
            if mode != 7 && mode != 10 {
                return Err(ConfigError::InvalidOption {
                    option: "i2cAddressMode",
                    reason: format!("{} not 7 or 10", mode),
                });
            }
        }

        if self.simulate {
            return Ok(());
        }

        // Real devices need their locator
        match self.device_type {
            DeviceType::Uart if self.path.is_none() => {
                Err(ConfigError::DevicePathMissing("uart"))
            }
            DeviceType::Can if self.path.is_none() => Err(ConfigError::DevicePathMissing("can")),
            DeviceType::Ethernet => {
                if options.eth_port.is_none() {
                    return Err(ConfigError::InvalidOption {
                        option: "ethPort",
                        reason: "required for ethernet devices".to_string(),
                    });
                }
                if options.eth_protocol == Some(EthProtocol::Udp) {
                    if let Some(groups) = &options.eth_multicast {
                        for group in groups {
                            if group.parse::<std::net::Ipv4Addr>().is_err() {
                                return Err(ConfigError::InvalidOption {
                                    option: "ethMulticast",
                                    reason: format!("'{}' is not an IPv4 address", group),
                                });
                            }
                        }
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Protocol Config
// ============================================================================

/// A named byte sequence given as hex text.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HexPreset {
    pub name: String,
    pub hex: String,
}

impl HexPreset {
    /// Parse the preset into bytes (whitespace ignored, even length required).
    pub fn bytes(&self) -> Result<Vec<u8>, ConfigError> {
        let stripped: String = self.hex.chars().filter(|c| !c.is_whitespace()).collect();
        if stripped.len() % 2 != 0 {
            return Err(ConfigError::InvalidHexPreset {
                name: self.name.clone(),
                reason: format!("odd number of hex digits ({})", stripped.len()),
            });
        }
        hex::decode(&stripped).map_err(|e| ConfigError::InvalidHexPreset {
            name: self.name.clone(),
            reason: e.to_string(),
        })
    }
}

/// Protocol selection plus optional transmit presets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub presets: Vec<HexPreset>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            protocol: "efuse".to_string(),
            presets: Vec::new(),
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let registry = CodecRegistry::with_defaults();
        if registry.get(&self.protocol).is_none() {
            return Err(ConfigError::UnknownProtocol(self.protocol.clone()));
        }
        for preset in &self.presets {
            preset.bytes()?;
        }
        Ok(())
    }
}

// ============================================================================
// Session Config
// ============================================================================

/// Complete description of one capture session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub device: DeviceConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub simulator: Option<SimulatorConfig>,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device.validate()?;
        self.protocol.validate()?;
        if let Some(sim) = &self.simulator {
            if !(0.0..=1.0).contains(&sim.error_rate) {
                return Err(ConfigError::InvalidOption {
                    option: "errorRate",
                    reason: format!("{} not in [0, 1]", sim.error_rate),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sim_device(device_type: DeviceType) -> DeviceConfig {
        DeviceConfig {
            device_type,
            path: None,
            simulate: true,
            options: AdapterOpenOptions::default(),
        }
    }

    #[test]
    fn test_uart_requires_path_unless_simulated() {
        let mut config = sim_device(DeviceType::Uart);
        assert!(config.validate().is_ok());

        config.simulate = false;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DevicePathMissing("uart"))
        ));

        config.path = Some("/dev/ttyUSB0".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ethernet_requires_port() {
        let mut config = sim_device(DeviceType::Ethernet);
        config.simulate = false;
        assert!(config.validate().is_err());

        config.options.eth_port = Some(5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_multicast_groups_checked() {
        let mut config = sim_device(DeviceType::Ethernet);
        config.simulate = false;
        config.options.eth_protocol = Some(EthProtocol::Udp);
        config.options.eth_port = Some(5000);
        config.options.eth_multicast = Some(vec!["239.0.0.1".to_string()]);
        assert!(config.validate().is_ok());

        config.options.eth_multicast = Some(vec!["not-an-ip".to_string()]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidOption { option: "ethMulticast", .. })
        ));
    }

    #[test]
    fn test_option_range_checks() {
        let mut config = sim_device(DeviceType::Spi);
        config.options.spi_mode = Some(4);
        assert!(config.validate().is_err());

        let mut config = sim_device(DeviceType::I2c);
        config.options.i2c_bus_speed = Some(200_000);
        assert!(config.validate().is_err());
        config.options.i2c_bus_speed = Some(400_000);
        assert!(config.validate().is_ok());

        let mut config = sim_device(DeviceType::Uart);
        config.options.data_bits = Some(9);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_protocol_must_be_registered() {
        let config = ProtocolConfig {
            protocol: "modbus".to_string(),
            presets: Vec::new(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownProtocol(p)) if p == "modbus"
        ));
        assert!(ProtocolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_hex_presets_validated() {
        let config = ProtocolConfig {
            protocol: "hex".to_string(),
            presets: vec![HexPreset {
                name: "ping".to_string(),
                hex: "AA 01 00 00".to_string(),
            }],
        };
        assert!(config.validate().is_ok());

        let config = ProtocolConfig {
            protocol: "hex".to_string(),
            presets: vec![HexPreset {
                name: "bad".to_string(),
                hex: "abc".to_string(),
            }],
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidHexPreset { .. })
        ));
    }

    #[test]
    fn test_session_config_error_rate_bounds() {
        let mut config = SessionConfig {
            device: sim_device(DeviceType::Uart),
            protocol: ProtocolConfig::default(),
            simulator: Some(SimulatorConfig {
                error_rate: 0.5,
                ..SimulatorConfig::default()
            }),
        };
        assert!(config.validate().is_ok());

        config.simulator.as_mut().unwrap().error_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_config_deserializes_from_json() {
        let json = r#"{
            "device": {
                "type": "can",
                "path": "can0",
                "options": {"canBitrate": 500000, "canFilters": [{"id": 1792, "mask": 1792}]}
            },
            "protocol": {"protocol": "hex"},
            "simulator": {"mode": "burst", "burstSize": 2, "burstIntervalMs": 100}
        }"#;
        let config: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.device.device_type, DeviceType::Can);
        assert_eq!(config.protocol.protocol, "hex");
        assert!(config.validate().is_ok());
    }
}
