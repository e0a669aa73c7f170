//! Per-application rule records and their enums.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Anonymizing network an application's traffic is forced into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Transport {
    Onion,
    Overlay,
}

/// Kernel-level redirection mechanism applied to an application.
///
/// `Trans` is transparent NAT redirection of every TCP flow, `Tcp` lets the
/// application reach its configured local proxy and nothing else, `Udp`
/// redirects datagrams to the overlay network's datagram proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProtocolClass {
    Tcp,
    Udp,
    Trans,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Onion => "ONION",
            Transport::Overlay => "OVERLAY",
        }
    }
}

impl ProtocolClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolClass::Tcp => "TCP",
            ProtocolClass::Udp => "UDP",
            ProtocolClass::Trans => "TRANS",
        }
    }

    /// Whether this redirection mechanism can be paired with `transport`.
    pub fn supports(&self, transport: Transport) -> bool {
        matches!(
            (transport, self),
            (Transport::Onion, ProtocolClass::Tcp)
                | (Transport::Onion, ProtocolClass::Trans)
                | (Transport::Overlay, ProtocolClass::Tcp)
                | (Transport::Overlay, ProtocolClass::Udp)
        )
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ProtocolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ONION" | "TOR" => Ok(Transport::Onion),
            "OVERLAY" | "I2P" => Ok(Transport::Overlay),
            other => Err(AppError::InvalidInput(format!("unknown transport '{other}'"))),
        }
    }
}

impl FromStr for ProtocolClass {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(ProtocolClass::Tcp),
            "UDP" => Ok(ProtocolClass::Udp),
            "TRANS" => Ok(ProtocolClass::Trans),
            other => Err(AppError::InvalidInput(format!(
                "unknown protocol class '{other}'"
            ))),
        }
    }
}

// Enums are stored as their upper-case names in the `transport` and
// `protocol_class` text columns.

impl ToSql for Transport {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Transport {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: AppError| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for ProtocolClass {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ProtocolClass {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: AppError| FromSqlError::Other(Box::new(e)))
    }
}

/// One application under policy, keyed by its OS-assigned uid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRule {
    pub uid: u32,
    pub package_name: String,
    pub transport: Transport,
    pub target_port: u16,
    pub protocol_class: ProtocolClass,
}

impl AppRule {
    pub fn new(
        uid: u32,
        package_name: impl Into<String>,
        transport: Transport,
        target_port: u16,
        protocol_class: ProtocolClass,
    ) -> Self {
        Self {
            uid,
            package_name: package_name.into(),
            transport,
            target_port,
            protocol_class,
        }
    }

    /// Reject rules the engine cannot express as packet-filter commands.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.target_port == 0 {
            return Err(AppError::InvalidInput(format!(
                "uid {}: target port must be positive",
                self.uid
            )));
        }
        if !self.protocol_class.supports(self.transport) {
            return Err(AppError::InvalidInput(format!(
                "uid {}: {} redirection is not available for the {} transport",
                self.uid, self.protocol_class, self.transport
            )));
        }
        Ok(())
    }
}
