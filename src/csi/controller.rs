//! CSI Controller service.
//!
//! Request validation happens here; every lifecycle decision is delegated
//! to the [`Scheduler`](crate::scheduler::Scheduler). Each call is counted
//! in the `csi_requests_total` metric by method and gRPC result code.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tonic::{Code, Request, Response, Status};
use tracing::{debug, instrument};

use super::proto::controller_server::Controller;
use super::proto::{
    controller_service_capability, list_volumes_response, validate_volume_capabilities_response,
    volume_capability, CapacityRange, ControllerGetCapabilitiesRequest,
    ControllerGetCapabilitiesResponse, ControllerPublishVolumeRequest,
    ControllerPublishVolumeResponse, ControllerServiceCapability, ControllerUnpublishVolumeRequest,
    ControllerUnpublishVolumeResponse, CreateVolumeRequest, CreateVolumeResponse,
    DeleteVolumeRequest, DeleteVolumeResponse, GetCapacityRequest, GetCapacityResponse,
    Int64Value, ListVolumesRequest, ListVolumesResponse, ValidateVolumeCapabilitiesRequest,
    ValidateVolumeCapabilitiesResponse, VolumeCapability, VolumeCondition,
};
use super::{PUBLISH_URI_KEY, REPLICA_COUNT_PARAM};
use crate::controller::ControlPlane;
use crate::domain::model::{Volume, VolumeId, VolumeSpec, VolumeState};
use crate::error::Error;
use crate::metrics;

/// Size used when the request carries no capacity range.
pub const DEFAULT_VOLUME_SIZE: u64 = 1 << 30;

const SUPPORTED_ACCESS_MODES: &[volume_capability::access_mode::Mode] = &[
    volume_capability::access_mode::Mode::SingleNodeWriter,
    volume_capability::access_mode::Mode::SingleNodeReaderOnly,
    volume_capability::access_mode::Mode::SingleNodeSingleWriter,
    volume_capability::access_mode::Mode::SingleNodeMultiWriter,
];

const CONTROLLER_CAPABILITIES: &[controller_service_capability::rpc::Type] = &[
    controller_service_capability::rpc::Type::CreateDeleteVolume,
    controller_service_capability::rpc::Type::PublishUnpublishVolume,
    controller_service_capability::rpc::Type::ListVolumes,
    controller_service_capability::rpc::Type::GetCapacity,
    controller_service_capability::rpc::Type::ListVolumesPublishedNodes,
    controller_service_capability::rpc::Type::VolumeCondition,
];

#[derive(Clone)]
pub struct CsiController {
    control_plane: Arc<ControlPlane>,
}

impl CsiController {
    pub fn new(control_plane: Arc<ControlPlane>) -> Self {
        Self { control_plane }
    }

    fn replica_count(&self, parameters: &HashMap<String, String>) -> Result<usize, Status> {
        match parameters.get(REPLICA_COUNT_PARAM) {
            None => Ok(self.control_plane.config().default_replicas),
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(count) if count > 0 => Ok(count),
                _ => Err(Status::invalid_argument(format!(
                    "parameter '{}' must be a positive integer, got '{}'",
                    REPLICA_COUNT_PARAM, raw
                ))),
            },
        }
    }

    async fn do_create_volume(
        &self,
        req: CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, Status> {
        if req.name.is_empty() {
            return Err(Status::invalid_argument("volume name is required"));
        }
        check_capabilities(&req.volume_capabilities).map_err(Status::invalid_argument)?;
        let size = requested_size(req.capacity_range.as_ref())?;
        let replicas = self.replica_count(&req.parameters)?;

        let volume = self
            .control_plane
            .scheduler()
            .create_volume(VolumeSpec::new(req.name, size, replicas))
            .await?;

        Ok(CreateVolumeResponse {
            volume: Some(csi_volume(&volume)),
        })
    }

    async fn do_delete_volume(
        &self,
        req: DeleteVolumeRequest,
    ) -> Result<DeleteVolumeResponse, Status> {
        let id = volume_id(&req.volume_id)?;
        self.control_plane.scheduler().delete_volume(&id).await?;
        Ok(DeleteVolumeResponse {})
    }

    async fn do_publish(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse, Status> {
        let id = volume_id(&req.volume_id)?;
        if req.node_id.is_empty() {
            return Err(Status::invalid_argument("node id is required"));
        }
        let capability = req
            .volume_capability
            .ok_or_else(|| Status::invalid_argument("volume capability is required"))?;
        check_capability(&capability).map_err(Status::invalid_argument)?;

        let uri = self
            .control_plane
            .scheduler()
            .publish_volume(&id, &req.node_id)
            .await?;

        Ok(ControllerPublishVolumeResponse {
            publish_context: HashMap::from([(PUBLISH_URI_KEY.to_string(), uri)]),
        })
    }

    async fn do_unpublish(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<ControllerUnpublishVolumeResponse, Status> {
        let id = volume_id(&req.volume_id)?;
        self.control_plane
            .scheduler()
            .unpublish_volume(&id, &req.node_id)
            .await?;
        Ok(ControllerUnpublishVolumeResponse {})
    }

    async fn do_validate(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, Status> {
        let id = volume_id(&req.volume_id)?;
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("volume capabilities are required"));
        }
        if self.control_plane.store().snapshot().volume(&id).is_none() {
            return Err(Error::not_found("volume", &id).into());
        }

        let response = match check_capabilities(&req.volume_capabilities) {
            Ok(()) => ValidateVolumeCapabilitiesResponse {
                confirmed: Some(validate_volume_capabilities_response::Confirmed {
                    volume_context: req.volume_context,
                    volume_capabilities: req.volume_capabilities,
                    parameters: req.parameters,
                }),
                message: String::new(),
            },
            Err(message) => ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message,
            },
        };
        Ok(response)
    }

    fn do_list_volumes(&self, req: ListVolumesRequest) -> Result<ListVolumesResponse, Status> {
        if req.max_entries < 0 {
            return Err(Status::invalid_argument("max_entries must not be negative"));
        }
        let snapshot = self.control_plane.store().snapshot();
        // Deleted from the CO's point of view, even while cleanup is pending
        let volumes: Vec<&Volume> = snapshot
            .volumes()
            .filter(|v| v.state != VolumeState::Destroying)
            .collect();

        let start = if req.starting_token.is_empty() {
            0
        } else {
            match req.starting_token.parse::<usize>() {
                Ok(offset) if offset <= volumes.len() => offset,
                _ => {
                    return Err(Status::aborted(format!(
                        "invalid starting token '{}'",
                        req.starting_token
                    )))
                }
            }
        };
        let limit = match req.max_entries {
            0 => volumes.len(),
            n => n as usize,
        };
        let end = start.saturating_add(limit).min(volumes.len());

        let entries = volumes[start..end]
            .iter()
            .map(|volume| list_volumes_response::Entry {
                volume: Some(csi_volume(volume)),
                status: Some(list_volumes_response::VolumeStatus {
                    published_node_ids: volume
                        .publication
                        .iter()
                        .map(|p| p.node.clone())
                        .collect(),
                    volume_condition: Some(volume_condition(volume.state)),
                }),
            })
            .collect();
        let next_token = if end < volumes.len() {
            end.to_string()
        } else {
            String::new()
        };

        Ok(ListVolumesResponse {
            entries,
            next_token,
        })
    }

    fn do_get_capacity(&self, req: GetCapacityRequest) -> Result<GetCapacityResponse, Status> {
        if !req.volume_capabilities.is_empty()
            && check_capabilities(&req.volume_capabilities).is_err()
        {
            return Ok(GetCapacityResponse {
                available_capacity: 0,
                maximum_volume_size: None,
                minimum_volume_size: None,
            });
        }
        let scheduler = self.control_plane.scheduler();
        Ok(GetCapacityResponse {
            available_capacity: to_i64(scheduler.available_capacity()),
            maximum_volume_size: Some(Int64Value {
                value: to_i64(scheduler.max_volume_size()),
            }),
            minimum_volume_size: None,
        })
    }
}

#[tonic::async_trait]
impl Controller for CsiController {
    #[instrument(skip(self, request), fields(name = %request.get_ref().name))]
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        observed("CreateVolume", self.do_create_volume(request.into_inner())).await
    }

    #[instrument(skip(self, request), fields(volume = %request.get_ref().volume_id))]
    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        observed("DeleteVolume", self.do_delete_volume(request.into_inner())).await
    }

    #[instrument(
        skip(self, request),
        fields(volume = %request.get_ref().volume_id, node = %request.get_ref().node_id)
    )]
    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        observed("ControllerPublishVolume", self.do_publish(request.into_inner())).await
    }

    #[instrument(
        skip(self, request),
        fields(volume = %request.get_ref().volume_id, node = %request.get_ref().node_id)
    )]
    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        observed(
            "ControllerUnpublishVolume",
            self.do_unpublish(request.into_inner()),
        )
        .await
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        observed(
            "ValidateVolumeCapabilities",
            self.do_validate(request.into_inner()),
        )
        .await
    }

    async fn list_volumes(
        &self,
        request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        let req = request.into_inner();
        observed("ListVolumes", async { self.do_list_volumes(req) }).await
    }

    async fn get_capacity(
        &self,
        request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        let req = request.into_inner();
        observed("GetCapacity", async { self.do_get_capacity(req) }).await
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        let capabilities = CONTROLLER_CAPABILITIES
            .iter()
            .map(|rpc| ControllerServiceCapability {
                r#type: Some(controller_service_capability::Type::Rpc(
                    controller_service_capability::Rpc {
                        r#type: *rpc as i32,
                    },
                )),
            })
            .collect();
        observed("ControllerGetCapabilities", async {
            Ok(ControllerGetCapabilitiesResponse { capabilities })
        })
        .await
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Run a handler, record its metrics and wrap the reply.
async fn observed<T, F>(method: &'static str, handler: F) -> Result<Response<T>, Status>
where
    F: Future<Output = Result<T, Status>>,
{
    let started = Instant::now();
    let result = handler.await;
    let code = match &result {
        Ok(_) => Code::Ok,
        Err(status) => status.code(),
    };
    if code != Code::Ok {
        debug!(method, code = ?code, "CSI request failed");
    }
    metrics::record_csi_request(method, &format!("{:?}", code), started.elapsed());
    result.map(Response::new)
}

fn volume_id(raw: &str) -> Result<VolumeId, Status> {
    if raw.is_empty() {
        return Err(Status::invalid_argument("volume id is required"));
    }
    Ok(VolumeId::new(raw))
}

/// Resolve the capacity range to a size in bytes.
fn requested_size(range: Option<&CapacityRange>) -> Result<u64, Status> {
    let Some(range) = range else {
        return Ok(DEFAULT_VOLUME_SIZE);
    };
    if range.required_bytes < 0 || range.limit_bytes < 0 {
        return Err(Status::invalid_argument("capacity must not be negative"));
    }
    if range.limit_bytes > 0 && range.required_bytes > range.limit_bytes {
        return Err(Status::invalid_argument(format!(
            "required bytes {} exceed limit bytes {}",
            range.required_bytes, range.limit_bytes
        )));
    }
    let size = match (range.required_bytes, range.limit_bytes) {
        (0, 0) => DEFAULT_VOLUME_SIZE,
        (0, limit) => (limit as u64).min(DEFAULT_VOLUME_SIZE),
        (required, _) => required as u64,
    };
    Ok(size)
}

fn check_capabilities(capabilities: &[VolumeCapability]) -> Result<(), String> {
    if capabilities.is_empty() {
        return Err("volume capabilities are required".to_string());
    }
    capabilities.iter().try_for_each(check_capability)
}

fn check_capability(capability: &VolumeCapability) -> Result<(), String> {
    if capability.access_type.is_none() {
        return Err("access type (block or mount) is required".to_string());
    }
    let mode = capability
        .access_mode
        .as_ref()
        .map(|m| m.mode())
        .unwrap_or(volume_capability::access_mode::Mode::Unknown);
    if SUPPORTED_ACCESS_MODES.contains(&mode) {
        Ok(())
    } else {
        Err(format!("unsupported access mode {:?}", mode))
    }
}

fn csi_volume(volume: &Volume) -> super::proto::Volume {
    super::proto::Volume {
        capacity_bytes: to_i64(volume.size),
        volume_id: volume.id.to_string(),
        volume_context: HashMap::from([(
            REPLICA_COUNT_PARAM.to_string(),
            volume.replica_count.to_string(),
        )]),
        accessible_topology: Vec::new(),
    }
}

fn volume_condition(state: VolumeState) -> VolumeCondition {
    VolumeCondition {
        abnormal: state != VolumeState::Online,
        message: state.to_string(),
    }
}

fn to_i64(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}
