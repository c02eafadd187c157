use super::Host;
use super::common::{Agent, GlobalArgs};
use crate::Result;
use crate::service::{EventBus, ExportRequest, InMemoryBus, IntegrationOutcome, IntegrationRequest};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use ohno::IntoAppError;
use std::fs;
use std::io::Write;
use std::sync::Arc;

#[derive(Parser, Debug)]
pub struct ExportArgs {
    /// JSON file listing the integrations to export, each with a `name` and its `config`
    #[arg(long, value_name = "PATH")]
    pub integrations_file: Utf8PathBuf,

    /// Ignore incremental state and export everything again
    #[arg(long)]
    pub reprocess_historical: bool,

    /// Upload the finished export to this URL with an HTTP PUT
    #[arg(long, value_name = "URL")]
    pub upload_url: Option<String>,

    /// Identifier recorded for this export
    #[arg(long, value_name = "ID", default_value = "manual")]
    pub job_id: String,
}

/// Read the integrations of a job from a JSON file
pub fn read_integrations_file(path: &Utf8Path) -> Result<Vec<IntegrationRequest>> {
    let text = fs::read_to_string(path).into_app_err_with(|| format!("reading integrations file '{path}'"))?;
    serde_json::from_str(&text).into_app_err_with(|| format!("parsing integrations file '{path}'"))
}

/// Run one export job in the foreground
pub async fn export<H: Host>(host: &mut H, global: &GlobalArgs, args: &ExportArgs) -> Result<()> {
    let integrations = read_integrations_file(&args.integrations_file)?;
    let agent = Agent::start(global, InMemoryBus::new() as Arc<dyn EventBus>).await?;

    let request = ExportRequest {
        job_id: args.job_id.clone(),
        upload_url: args.upload_url.clone(),
        reprocess_historical: args.reprocess_historical,
        integrations,
    };

    match agent.exporter.export(request).await {
        Ok(outcomes) => {
            report(host, &outcomes);
            if args.upload_url.is_none() {
                let _ = writeln!(host.output(), "Export written to {}", agent.locations.uploads_dir());
            }
            Ok(())
        }
        Err(e) => {
            let _ = writeln!(host.error(), "❌ Export failed: {e:#}");
            host.exit(1);
            Err(e)
        }
    }
}

fn report<H: Host>(host: &mut H, outcomes: &[IntegrationOutcome]) {
    let mut out = host.output();
    for outcome in outcomes {
        let _ = writeln!(out, "{}: {} projects", outcome.name, outcome.projects.len());
        for project in &outcome.projects {
            match &project.error {
                Some(error) => {
                    let _ = writeln!(out, "  {} failed: {error}", project.readable_id);
                }
                None => {
                    let _ = writeln!(out, "  {}", project.readable_id);
                }
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::commands::host::TestHost;
    use crate::plugin::ExportProject;

    #[test]
    #[cfg_attr(miri, ignore = "Miri cannot call GetTempPathW")]
    fn test_read_integrations_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(tmp.path().join("integrations.json")).unwrap();
        fs::write(&path, r#"[{"name":"mock","config":{"pull_requests":4}},{"name":"gh","ref_type":"github"}]"#).unwrap();

        let integrations = read_integrations_file(&path).unwrap();
        assert_eq!(integrations.len(), 2);
        assert_eq!(integrations[0].config["pull_requests"], 4);
        assert_eq!(integrations[1].ref_type(), "github");
    }

    #[test]
    #[cfg_attr(miri, ignore = "Miri cannot call GetTempPathW")]
    fn test_read_invalid_integrations_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(tmp.path().join("integrations.json")).unwrap();
        fs::write(&path, "{").unwrap();
        let _ = read_integrations_file(&path).unwrap_err();
        let _ = read_integrations_file(&path.with_file_name("missing.json")).unwrap_err();
    }

    #[test]
    fn test_report_lists_projects() {
        let mut host = TestHost::new();
        let outcomes = vec![IntegrationOutcome {
            name: "mock".into(),
            projects: vec![
                ExportProject {
                    readable_id: "acme/widgets".into(),
                    ..ExportProject::default()
                },
                ExportProject {
                    readable_id: "acme/gadgets".into(),
                    error: Some("commits unavailable".into()),
                    ..ExportProject::default()
                },
            ],
            error: None,
        }];

        report(&mut host, &outcomes);
        assert_eq!(
            host.output_text(),
            "mock: 2 projects\n  acme/widgets\n  acme/gadgets failed: commits unavailable\n"
        );
    }
}
