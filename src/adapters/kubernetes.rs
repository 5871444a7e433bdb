//! Kubernetes State Backend Adapter
//!
//! Implements the `StateBackend` port by storing the volume store in a
//! ConfigMap, written with server-side apply.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::{debug, instrument};

use crate::domain::ports::{PersistedState, StateBackend};
use crate::error::{Error, Result};

/// Field manager used for server-side apply.
const FIELD_MANAGER: &str = "couchestor-control-plane";

/// Data key holding the serialized state.
pub const STATE_KEY: &str = "state.json";

/// ConfigMap-based state backend.
#[derive(Clone)]
pub struct ConfigMapBackend {
    client: Client,
    namespace: String,
    name: String,
}

impl ConfigMapBackend {
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Build the ConfigMap carrying `state`.
    pub fn to_config_map(&self, state: &PersistedState) -> Result<ConfigMap> {
        let json = serde_json::to_string(state)?;
        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(
                    [(
                        "app.kubernetes.io/managed-by".to_string(),
                        FIELD_MANAGER.to_string(),
                    )]
                    .into(),
                ),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(STATE_KEY.to_string(), json)])),
            ..Default::default()
        })
    }

    /// Extract the state from a ConfigMap, `None` when the key is absent.
    pub fn from_config_map(cm: &ConfigMap) -> Result<Option<PersistedState>> {
        cm.data
            .as_ref()
            .and_then(|d| d.get(STATE_KEY))
            .map(|json| serde_json::from_str(json).map_err(Error::from))
            .transpose()
    }
}

impl std::fmt::Debug for ConfigMapBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigMapBackend")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl StateBackend for ConfigMapBackend {
    #[instrument(skip(self), fields(namespace = %self.namespace, name = %self.name))]
    async fn load(&self) -> Result<Option<PersistedState>> {
        match self.api().get_opt(&self.name).await? {
            Some(cm) => Self::from_config_map(&cm),
            None => {
                debug!("State ConfigMap does not exist yet");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, state), fields(namespace = %self.namespace, name = %self.name, revision = state.revision))]
    async fn save(&self, state: &PersistedState) -> Result<()> {
        let cm = self.to_config_map(state)?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api()
            .patch(&self.name, &params, &Patch::Apply(&cm))
            .await?;
        debug!("Saved state ConfigMap");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "configmap"
    }
}
