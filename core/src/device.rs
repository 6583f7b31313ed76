//! Device-wide settings: identity, network interfaces, and management access.

use serde::{Deserialize, Serialize};

pub const NET_NUM: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Version { major, minor, patch }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub ip: u32,
    pub mask: u32,
    pub gateway: u32,
    pub dhcp: bool,
}

impl Default for NetworkInterface {
    fn default() -> Self {
        NetworkInterface {
            ip: u32::from_be_bytes([192, 168, 127, 254]),
            mask: u32::from_be_bytes([255, 255, 255, 0]),
            gateway: 0,
            dhcp: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AutoReport {
    pub enabled: bool,
    pub ip: u32,
    pub udp_port: u16,
    pub period_secs: u16,
}

// Field order matters for `toml`'s serializer, which requires every scalar
// (or scalar-array) field in a table to precede any nested-table field —
// hence all the plain settings up front and `firmware_version`/
// `hardware_version`/`interfaces`/`auto_report` (all nested structs/arrays
// of structs) last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub model_name: String,
    pub mac: MacAddress,
    pub serial_no: u16,
    pub server_name: String,
    pub username: String,
    pub password: String,
    pub time_zone: i8,
    pub time_server: String,
    pub dns1: u32,
    pub dns2: u32,
    pub snmp_enabled: bool,
    pub web_enabled: bool,
    pub telnet_enabled: bool,
    pub lcm_protected: bool,
    pub reset_protected: bool,
    pub firmware_version: Version,
    pub hardware_version: Version,
    pub interfaces: [NetworkInterface; NET_NUM],
    pub auto_report: AutoReport,
}

impl DeviceSettings {
    pub fn load_defaults() -> Self {
        DeviceSettings {
            model_name: "NPort-5650-16".to_string(),
            mac: MacAddress([0x00, 0x90, 0xE8, 0x00, 0x00, 0x01]),
            serial_no: 1,
            firmware_version: Version::new(2, 0, 0),
            hardware_version: Version::new(1, 0, 0),
            server_name: "NPort".to_string(),
            username: "admin".to_string(),
            password: "moxa".to_string(),
            time_zone: 0,
            time_server: String::new(),
            interfaces: [NetworkInterface::default(), NetworkInterface::default()],
            dns1: 0,
            dns2: 0,
            snmp_enabled: false,
            auto_report: AutoReport::default(),
            web_enabled: true,
            telnet_enabled: true,
            lcm_protected: false,
            reset_protected: false,
        }
    }
}
