use super::Host;
use super::common::GlobalArgs;
use crate::Result;
use crate::config::AgentConfig;
use std::io::Write;

/// Check that the agent configuration loads and holds usable values
pub fn validate_config<H: Host>(host: &mut H, global: &GlobalArgs) -> Result<()> {
    let loaded = global.locations().and_then(|locations| {
        let config = global.load_config(&locations)?;
        Ok((locations, config))
    });

    match loaded {
        Ok((locations, config)) => {
            let _ = writeln!(host.output(), "Configuration is valid");
            match &global.config {
                Some(path) => {
                    let _ = writeln!(host.output(), "Config file: {path}");
                }
                None if locations.config_file().exists() => {
                    let _ = writeln!(host.output(), "Config file: {}", locations.config_file());
                }
                None => {
                    let _ = writeln!(host.output(), "Using default configuration (no config file found)");
                }
            }
            if config == AgentConfig::default() {
                let _ = writeln!(host.output(), "All settings are at their defaults");
            }
            Ok(())
        }
        Err(e) => {
            let _ = writeln!(host.error(), "❌ Configuration validation failed: {e:#}");
            host.exit(1);
            Err(e)
        }
    }
}
