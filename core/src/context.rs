use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::CoreResult;
use crate::net::{NetClient, ReqwestNetClient};
use crate::snapshot::{FileSnapshotStore, SnapshotStore};
use crate::volume::{SystemVolume, VolumeProbe};

/// Collaborators shared by the registry and every mission it owns.
pub struct MissionContext {
    pub config: EngineConfig,
    pub net: Arc<dyn NetClient>,
    pub store: Arc<dyn SnapshotStore>,
    pub volume: Arc<dyn VolumeProbe>,
}

impl MissionContext {
    pub fn new(config: EngineConfig) -> CoreResult<Self> {
        let net = ReqwestNetClient::new(&config)?;
        let store = FileSnapshotStore::new(&config.task_dir)?;
        Ok(Self {
            config,
            net: Arc::new(net),
            store: Arc::new(store),
            volume: Arc::new(SystemVolume),
        })
    }

    /// Context with caller-supplied collaborators; nothing touches the network
    /// or the task directory until a mission does.
    pub fn with_parts(
        config: EngineConfig,
        net: Arc<dyn NetClient>,
        store: Arc<dyn SnapshotStore>,
        volume: Arc<dyn VolumeProbe>,
    ) -> Self {
        Self {
            config,
            net,
            store,
            volume,
        }
    }

    pub fn with_net_client(mut self, net: Arc<dyn NetClient>) -> Self {
        self.net = net;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_volume(mut self, volume: Arc<dyn VolumeProbe>) -> Self {
        self.volume = volume;
        self
    }
}
