use crate::camera::CameraManager;
use crate::config::AgentConfig;
use crate::controller::{Controller, Moonraker};
use crate::files::{FileManager, GcodeStore};
use crate::gate::CommandGate;
use crate::hub::HubClient;
use crate::state::StateStore;
use crate::transport::{HttpBackend, ReqwestBackend, RetryPolicy, RetryingTransport};
use std::path::Path;
use std::sync::Arc;

/// Everything one agent run owns. Built once at startup and handed to the
/// scheduler, which is its only user.
pub struct AgentContext {
    pub config: AgentConfig,
    pub state: StateStore,
    pub controller: Arc<dyn Controller>,
    pub files: Arc<dyn GcodeStore>,
    pub hub: HubClient,
    pub camera: CameraManager,
    pub gate: CommandGate,
}

impl AgentContext {
    pub fn new(config: AgentConfig, state_path: &Path) -> anyhow::Result<Self> {
        let backend: Arc<dyn HttpBackend> = Arc::new(ReqwestBackend::new()?);
        Self::with_backend(config, StateStore::open(state_path), backend)
    }

    pub fn with_backend(
        config: AgentConfig,
        state: StateStore,
        backend: Arc<dyn HttpBackend>,
    ) -> anyhow::Result<Self> {
        let policy = RetryPolicy::from_config(&config.retries);
        let transport = Arc::new(RetryingTransport::new(backend.clone(), policy));
        let controller: Arc<dyn Controller> = Arc::new(Moonraker::new(
            &config.moonraker_url,
            transport,
            config.timeouts.moonraker(),
        ));
        let files: Arc<dyn GcodeStore> = Arc::new(FileManager::new(
            &config.file_management,
            backend.clone(),
            policy,
            config.timeouts.file_download(),
        )?);
        Ok(Self::from_parts(config, state, backend, controller, files))
    }

    pub fn from_parts(
        config: AgentConfig,
        state: StateStore,
        backend: Arc<dyn HttpBackend>,
        controller: Arc<dyn Controller>,
        files: Arc<dyn GcodeStore>,
    ) -> Self {
        let transport = Arc::new(RetryingTransport::new(
            backend,
            RetryPolicy::from_config(&config.retries),
        ));
        let hub = HubClient::new(
            &config.server_url,
            &config.printer_token,
            transport.clone(),
            config.timeouts.server(),
        );
        let camera = CameraManager::new(&config.camera, transport, config.timeouts.camera());
        let gate = CommandGate::new(&config.security);
        Self {
            config,
            state,
            controller,
            files,
            hub,
            camera,
            gate,
        }
    }
}
