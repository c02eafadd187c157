use crate::Result;
use crate::plugin::{builtin, serve_stdio};
use clap::Parser;
use ohno::bail;

#[derive(Parser, Debug)]
pub struct IntegrationArgs {
    /// Name of the built-in integration to serve
    #[arg(value_name = "NAME")]
    pub name: String,
}

/// Serve a built-in integration to the agent that started this process
pub async fn serve_integration(args: &IntegrationArgs) -> Result<()> {
    let Some(integration) = builtin(&args.name) else {
        bail!("unknown integration '{}'", args.name);
    };
    serve_stdio(integration).await
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_integration() {
        let args = IntegrationArgs { name: "nope".into() };
        let err = serve_integration(&args).await.unwrap_err();
        assert!(err.to_string().contains("unknown integration 'nope'"));
    }

    #[tokio::test]
    async fn test_refuses_to_run_outside_the_agent() {
        let args = IntegrationArgs { name: "mock".into() };
        let err = serve_integration(&args).await.unwrap_err();
        assert!(err.to_string().contains("not meant to be run directly"));
    }
}
