//! Worker process handshake and setup errors.
//!
//! The agent starts a worker with a magic cookie in its environment. A worker refuses to
//! serve without it, which keeps the binary from being mistaken for a normal command.
//! The worker's first line on stdout announces the protocol it speaks:
//!
//! ```text
//! <core version>|<app version>|<transport>|<plugin kind>
//! ```

use core::fmt;

/// Environment variable carrying the cookie.
pub const COOKIE_KEY: &str = "EXPORT_AGENT_PLUGIN";

pub const COOKIE_VALUE: &str = "5c2b7e0a9d4f4b63a1e8f06d2c7a91b4";

/// Version of the framing protocol.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Version of the integration contract.
pub const APP_PROTOCOL_VERSION: u32 = 1;

pub const TRANSPORT: &str = "jsonl";

pub const PLUGIN_KIND: &str = "integration";

/// Reasons a worker could not be brought up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupError {
    /// Creating or truncating the worker's log file failed.
    Log(String),

    /// The worker process could not be started.
    Spawn(String),

    /// The worker did not produce a usable handshake line.
    Handshake(String),

    /// The worker speaks a different protocol version.
    Incompatible { what: &'static str, expected: String, found: String },

    /// The worker serves something other than an integration.
    ContractMismatch(String),

    /// The worker rejected or failed `init`.
    Init(String),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log(msg) => write!(f, "could not set up integration log: {msg}"),
            Self::Spawn(msg) => write!(f, "could not start integration process: {msg}"),
            Self::Handshake(msg) => write!(f, "integration handshake failed: {msg}"),
            Self::Incompatible { what, expected, found } => {
                write!(f, "incompatible integration {what}: expected {expected}, found {found}")
            }
            Self::ContractMismatch(kind) => write!(f, "worker serves '{kind}', expected '{PLUGIN_KIND}'"),
            Self::Init(msg) => write!(f, "integration init failed: {msg}"),
        }
    }
}

impl core::error::Error for SetupError {}

/// The line a worker prints before serving.
#[must_use]
pub fn handshake_line() -> String {
    format!("{CORE_PROTOCOL_VERSION}|{APP_PROTOCOL_VERSION}|{TRANSPORT}|{PLUGIN_KIND}")
}

/// Check a worker's handshake line.
pub fn verify(line: &str) -> Result<(), SetupError> {
    let parts: Vec<&str> = line.trim().split('|').collect();
    let [core, app, transport, kind] = parts.as_slice() else {
        return Err(SetupError::Handshake(format!("malformed handshake line '{}'", line.trim())));
    };

    check("core protocol version", &CORE_PROTOCOL_VERSION.to_string(), core)?;
    check("protocol version", &APP_PROTOCOL_VERSION.to_string(), app)?;
    check("transport", TRANSPORT, transport)?;

    if *kind != PLUGIN_KIND {
        return Err(SetupError::ContractMismatch((*kind).to_string()));
    }

    Ok(())
}

fn check(what: &'static str, expected: &str, found: &str) -> Result<(), SetupError> {
    if expected == found {
        Ok(())
    } else {
        Err(SetupError::Incompatible {
            what,
            expected: expected.to_string(),
            found: found.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_line_verifies() {
        verify(&handshake_line()).unwrap();
        verify(&format!("{}\n", handshake_line())).unwrap();
    }

    #[test]
    fn test_rejects_other_versions() {
        let err = verify("2|1|jsonl|integration").unwrap_err();
        assert!(matches!(err, SetupError::Incompatible { what: "core protocol version", .. }));

        let err = verify("1|1|grpc|integration").unwrap_err();
        assert!(err.to_string().contains("transport"));
    }

    #[test]
    fn test_rejects_other_contracts() {
        assert_eq!(
            verify("1|1|jsonl|exporter").unwrap_err(),
            SetupError::ContractMismatch("exporter".into())
        );
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(verify("hello world").unwrap_err(), SetupError::Handshake(_)));
    }
}
