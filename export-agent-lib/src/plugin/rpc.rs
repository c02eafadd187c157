//! Typed stubs mapping the [`Integration`] and [`AgentDelegate`] contracts onto a [`Peer`].

use super::contract::{
    AgentDelegate, ExportConfig, ExportResult, GitRepoFetch, Integration, MutateResult, OnboardExportResult, OnboardObjectType,
};
use super::peer::{Handler, Peer, decode_params, encode_result};
use crate::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use ohno::bail;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};

const INIT: &str = "init";
const EXPORT: &str = "export";
const MUTATE: &str = "mutate";
const ONBOARD_EXPORT: &str = "onboard_export";
const EXPORT_GIT_REPO: &str = "export_git_repo";
const SEND_PAUSE_EVENT: &str = "send_pause_event";
const SEND_RESUME_EVENT: &str = "send_resume_event";

#[derive(Debug, Serialize, Deserialize)]
struct MutateParams {
    action: String,
    data: String,
    config: ExportConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct OnboardParams {
    object_type: OnboardObjectType,
    config: ExportConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct PauseParams {
    id: String,
    resume_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResumeParams {
    id: String,
}

/// Agent-side view of a remote integration.
///
/// Calling [`Integration::init`] installs the delegate that serves the worker's calls
/// back into the agent.
#[derive(Debug, Clone)]
pub struct IntegrationClient {
    peer: Peer,
    delegate: Arc<DelegateServer>,
}

impl IntegrationClient {
    #[must_use]
    pub const fn new(peer: Peer, delegate: Arc<DelegateServer>) -> Self {
        Self { peer, delegate }
    }

    #[must_use]
    pub const fn peer(&self) -> &Peer {
        &self.peer
    }
}

impl Integration for IntegrationClient {
    fn init(&self, agent: Arc<dyn AgentDelegate>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.delegate.install(agent)?;
            self.peer.call(INIT, ()).await
        })
    }

    fn export(&self, config: ExportConfig) -> BoxFuture<'_, Result<ExportResult>> {
        Box::pin(self.peer.call(EXPORT, config))
    }

    fn mutate(&self, action: String, data: String, config: ExportConfig) -> BoxFuture<'_, Result<MutateResult>> {
        Box::pin(self.peer.call(MUTATE, MutateParams { action, data, config }))
    }

    fn onboard_export(&self, object_type: OnboardObjectType, config: ExportConfig) -> BoxFuture<'_, Result<OnboardExportResult>> {
        Box::pin(self.peer.call(ONBOARD_EXPORT, OnboardParams { object_type, config }))
    }
}

/// Serves a worker's delegate calls on the agent side.
#[derive(Default)]
pub struct DelegateServer {
    delegate: OnceLock<Arc<dyn AgentDelegate>>,
}

impl core::fmt::Debug for DelegateServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DelegateServer")
            .field("installed", &self.delegate.get().is_some())
            .finish()
    }
}

impl DelegateServer {
    fn install(&self, delegate: Arc<dyn AgentDelegate>) -> Result<()> {
        if self.delegate.set(delegate).is_err() {
            bail!("integration was already initialized");
        }
        Ok(())
    }
}

impl Handler for DelegateServer {
    fn handle(&self, method: String, params: Value) -> BoxFuture<'static, Result<Value>> {
        let delegate = self.delegate.get().cloned();
        Box::pin(async move {
            let Some(delegate) = delegate else {
                bail!("'{method}' called before the integration was initialized");
            };

            match method.as_str() {
                EXPORT_GIT_REPO => {
                    delegate.export_git_repo(decode_params(&method, params)?).await?;
                }
                SEND_PAUSE_EVENT => {
                    let p: PauseParams = decode_params(&method, params)?;
                    delegate.send_pause_event(p.id, p.resume_at).await?;
                }
                SEND_RESUME_EVENT => {
                    let p: ResumeParams = decode_params(&method, params)?;
                    delegate.send_resume_event(p.id).await?;
                }
                _ => bail!("unknown agent method '{method}'"),
            }
            Ok(Value::Null)
        })
    }
}

/// Worker-side view of the agent.
#[derive(Debug, Clone)]
pub struct DelegateClient {
    peer: Peer,
}

impl DelegateClient {
    #[must_use]
    pub const fn new(peer: Peer) -> Self {
        Self { peer }
    }
}

impl AgentDelegate for DelegateClient {
    fn export_git_repo(&self, fetch: GitRepoFetch) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.peer.call(EXPORT_GIT_REPO, fetch))
    }

    fn send_pause_event(&self, id: String, resume_at: DateTime<Utc>) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.peer.call(SEND_PAUSE_EVENT, PauseParams { id, resume_at }))
    }

    fn send_resume_event(&self, id: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.peer.call(SEND_RESUME_EVENT, ResumeParams { id }))
    }
}

/// Serves the agent's calls on the worker side.
pub struct IntegrationServer {
    integration: Arc<dyn Integration>,
    peer: Peer,
}

impl core::fmt::Debug for IntegrationServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IntegrationServer").field("peer", &self.peer).finish_non_exhaustive()
    }
}

impl IntegrationServer {
    /// `peer` is the connection the server answers on; `init` hands the integration a
    /// delegate calling back over it.
    #[must_use]
    pub fn new(integration: Arc<dyn Integration>, peer: Peer) -> Self {
        Self { integration, peer }
    }
}

impl Handler for IntegrationServer {
    fn handle(&self, method: String, params: Value) -> BoxFuture<'static, Result<Value>> {
        let integration = Arc::clone(&self.integration);
        let peer = self.peer.clone();
        Box::pin(async move {
            match method.as_str() {
                INIT => {
                    integration.init(Arc::new(DelegateClient::new(peer))).await?;
                    Ok(Value::Null)
                }
                EXPORT => {
                    let result = integration.export(decode_params(&method, params)?).await?;
                    encode_result(&method, &result)
                }
                MUTATE => {
                    let p: MutateParams = decode_params(&method, params)?;
                    let result = integration.mutate(p.action, p.data, p.config).await?;
                    encode_result(&method, &result)
                }
                ONBOARD_EXPORT => {
                    let p: OnboardParams = decode_params(&method, params)?;
                    let result = integration.onboard_export(p.object_type, p.config).await?;
                    encode_result(&method, &result)
                }
                _ => bail!("unknown integration method '{method}'"),
            }
        })
    }
}
