//! Request handlers for relay endpoints.

use crate::auth::TokenValidator;
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::notify::NotificationHub;
use crate::store::ItemTable;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use vaultsync_protocol::{
    decode_body, status, AuthRequest, AuthResponse, CreateItemRequest, CreateItemResponse,
    DeleteItemRequest, DeviceId, Endpoint, HttpRequest, HttpResponse, ItemId, ItemNotice,
    ManifestResponse, Method, RemoteItem, UpdateItemRequest, UpdateItemResponse, VaultId,
};

/// Context for request handling.
pub struct HandlerContext {
    /// Relay configuration.
    pub config: RelayConfig,
    /// Item table (shared across all handlers).
    pub items: ItemTable,
    /// Notification fan-out.
    pub hub: NotificationHub,
    validator: TokenValidator,
    revoked: RwLock<HashSet<DeviceId>>,
    available: AtomicBool,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: RelayConfig) -> Self {
        let validator = TokenValidator::new(config.auth_secret.clone(), config.token_expiry);
        let hub = NotificationHub::new(config.notification_buffer);
        Self {
            config,
            items: ItemTable::new(),
            hub,
            validator,
            revoked: RwLock::new(HashSet::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Returns the token validator.
    pub fn validator(&self) -> &TokenValidator {
        &self.validator
    }

    /// Makes the relay accept or refuse (503) all traffic.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Returns true while the relay accepts traffic.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Rejects every further token of a device.
    pub fn revoke(&self, device_id: DeviceId) {
        self.revoked.write().insert(device_id);
    }

    /// Checks a handshake: the token must be valid and belong to the device.
    pub fn authenticate(&self, request: &AuthRequest) -> RelayResult<AuthResponse> {
        self.ensure_available()?;
        let expires_at = self
            .validator
            .validate_for(&request.token, &request.device_id)?;
        self.ensure_not_revoked(&request.device_id)?;
        Ok(AuthResponse {
            device_id: request.device_id,
            expires_at,
        })
    }

    /// Resolves a bearer token to its device.
    pub fn device_for(&self, bearer: Option<&str>) -> RelayResult<DeviceId> {
        let token =
            bearer.ok_or_else(|| RelayError::NotAuthorized("missing bearer token".into()))?;
        let device_id = self.validator.validate(token)?;
        self.ensure_not_revoked(&device_id)?;
        Ok(device_id)
    }

    fn ensure_available(&self) -> RelayResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(RelayError::Unavailable)
        }
    }

    fn ensure_not_revoked(&self, device_id: &DeviceId) -> RelayResult<()> {
        if self.revoked.read().contains(device_id) {
            Err(RelayError::NotAuthorized("device revoked".into()))
        } else {
            Ok(())
        }
    }
}

/// Handler for relay requests.
pub struct RequestHandler<'a> {
    context: &'a HandlerContext,
}

impl<'a> RequestHandler<'a> {
    /// Creates a new request handler.
    pub fn new(context: &'a HandlerContext) -> Self {
        Self { context }
    }

    /// Routes a request and renders the response.
    pub fn handle(&self, request: &HttpRequest) -> HttpResponse {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    RelayError::VersionConflict { .. } => {
                        debug!(path = %request.path, error = %err, "rejected stale write")
                    }
                    err if err.is_server_error() => {
                        warn!(path = %request.path, error = %err, "request failed")
                    }
                    err => debug!(path = %request.path, error = %err, "request rejected"),
                }
                err.into_response()
            }
        }
    }

    fn dispatch(&self, request: &HttpRequest) -> RelayResult<HttpResponse> {
        self.context.ensure_available()?;
        let endpoint = Endpoint::parse(&request.path)?;

        if let (Method::Post, Endpoint::Authenticate) = (request.method, &endpoint) {
            let auth: AuthRequest = decode_body(&request.body)?;
            let response = self.context.authenticate(&auth)?;
            info!(device_id = %auth.device_id, "device authenticated");
            return Ok(HttpResponse::json(status::OK, &response));
        }

        let device_id = self.context.device_for(request.bearer.as_deref())?;
        match (request.method, endpoint) {
            (Method::Get, Endpoint::Manifest(vault_id)) => {
                Ok(HttpResponse::json(status::OK, &self.handle_manifest(vault_id)))
            }
            (Method::Post, Endpoint::Items) => {
                let create = decode_body(&request.body)?;
                let response = self.handle_create(device_id, create)?;
                Ok(HttpResponse::json(status::CREATED, &response))
            }
            (Method::Get, Endpoint::Item(item_id)) => {
                Ok(HttpResponse::json(status::OK, &self.handle_get(&item_id)?))
            }
            (Method::Put, Endpoint::Item(item_id)) => {
                let update = decode_body(&request.body)?;
                let response = self.handle_update(device_id, &item_id, update)?;
                Ok(HttpResponse::json(status::OK, &response))
            }
            (Method::Delete, Endpoint::Item(item_id)) => {
                let delete = decode_body(&request.body)?;
                self.handle_delete(device_id, &item_id, delete)?;
                Ok(HttpResponse::empty(status::NO_CONTENT))
            }
            (method, endpoint) => Err(RelayError::InvalidRequest(format!(
                "{method:?} not allowed on {}",
                endpoint.path()
            ))),
        }
    }

    /// Handles a manifest request.
    pub fn handle_manifest(&self, vault_id: VaultId) -> ManifestResponse {
        let entries = self.context.items.manifest(&vault_id);
        ManifestResponse { vault_id, entries }
    }

    /// Handles a create request.
    pub fn handle_create(
        &self,
        origin: DeviceId,
        request: CreateItemRequest,
    ) -> RelayResult<CreateItemResponse> {
        self.check_payload(&request.encrypted_payload)?;
        request.vault_id.validate()?;

        let item = self.context.items.create(request);
        debug!(item_id = %item.id, vault_id = %item.vault_id, %origin, "item created");
        self.publish(&item, origin, false);
        Ok(CreateItemResponse {
            id: item.id,
            version: item.version,
            updated_at: item.updated_at,
        })
    }

    /// Handles a get request.
    pub fn handle_get(&self, item_id: &ItemId) -> RelayResult<RemoteItem> {
        self.context
            .items
            .get(item_id)
            .ok_or_else(|| RelayError::NotFound(item_id.to_string()))
    }

    /// Handles an update request.
    pub fn handle_update(
        &self,
        origin: DeviceId,
        item_id: &ItemId,
        request: UpdateItemRequest,
    ) -> RelayResult<UpdateItemResponse> {
        self.check_payload(&request.encrypted_payload)?;

        let item = self.context.items.update(item_id, request)?;
        debug!(%item_id, version = item.version, %origin, "item updated");
        self.publish(&item, origin, false);
        Ok(UpdateItemResponse {
            id: item.id,
            version: item.version,
            updated_at: item.updated_at,
        })
    }

    /// Handles a delete request.
    pub fn handle_delete(
        &self,
        origin: DeviceId,
        item_id: &ItemId,
        request: DeleteItemRequest,
    ) -> RelayResult<()> {
        let item = self
            .context
            .items
            .delete(item_id, request.expected_previous_version)?;
        debug!(%item_id, version = item.version, %origin, "item deleted");
        self.publish(&item, origin, true);
        Ok(())
    }

    fn check_payload(&self, payload: &[u8]) -> RelayResult<()> {
        let max = self.context.config.max_payload_bytes;
        if payload.len() > max {
            return Err(RelayError::InvalidRequest(format!(
                "payload too large: {} > {max}",
                payload.len()
            )));
        }
        Ok(())
    }

    fn publish(&self, item: &RemoteItem, origin: DeviceId, deleted: bool) {
        self.context.hub.publish(&ItemNotice {
            id: item.id.clone(),
            vault_id: item.vault_id.clone(),
            version: item.version,
            updated_at: item.updated_at,
            deleted,
            origin,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vaultsync_protocol::{ClearMetadata, ErrorBody, ItemType};

    fn context() -> HandlerContext {
        HandlerContext::new(RelayConfig::new(b"handler-test-secret".to_vec()).with_max_payload_bytes(8))
    }

    fn bearer(context: &HandlerContext, device: DeviceId) -> String {
        context.validator().create_token(&device).unwrap()
    }

    fn create_request(payload: Vec<u8>) -> CreateItemRequest {
        CreateItemRequest {
            vault_id: VaultId::new("home"),
            item_type: ItemType::Login,
            encrypted_payload: payload,
            clear_metadata: ClearMetadata::named("GitHub"),
        }
    }

    #[test]
    fn handshake() {
        let context = context();
        let handler = RequestHandler::new(&context);
        let device = DeviceId::generate();
        let request = HttpRequest::new(Method::Post, &Endpoint::Authenticate)
            .with_json(&AuthRequest {
                device_id: device,
                token: bearer(&context, device),
            })
            .unwrap();

        let response = handler.handle(&request);
        assert_eq!(response.status, status::OK);
        let body: AuthResponse = decode_body(&response.body).unwrap();
        assert_eq!(body.device_id, device);

        let stolen = HttpRequest::new(Method::Post, &Endpoint::Authenticate)
            .with_json(&AuthRequest {
                device_id: DeviceId::generate(),
                token: bearer(&context, device),
            })
            .unwrap();
        assert_eq!(handler.handle(&stolen).status, status::UNAUTHORIZED);
    }

    #[test]
    fn requests_need_a_bearer() {
        let context = context();
        let handler = RequestHandler::new(&context);
        let request = HttpRequest::new(Method::Get, &Endpoint::Manifest(VaultId::new("home")));
        assert_eq!(handler.handle(&request).status, status::UNAUTHORIZED);

        context.revoke(DeviceId::from_bytes([4; 16]));
        let revoked = request.with_bearer(bearer(&context, DeviceId::from_bytes([4; 16])));
        assert_eq!(handler.handle(&revoked).status, status::UNAUTHORIZED);
    }

    #[test]
    fn create_update_conflict_delete() {
        let context = context();
        let handler = RequestHandler::new(&context);
        let device = DeviceId::generate();
        let token = bearer(&context, device);

        let created = HttpRequest::new(Method::Post, &Endpoint::Items)
            .with_bearer(&token)
            .with_json(&create_request(vec![1]))
            .unwrap();
        let response = handler.handle(&created);
        assert_eq!(response.status, status::CREATED);
        let created: CreateItemResponse = decode_body(&response.body).unwrap();
        assert_eq!(created.version, 1);

        let stale = HttpRequest::new(Method::Put, &Endpoint::Item(created.id.clone()))
            .with_bearer(&token)
            .with_json(&UpdateItemRequest {
                encrypted_payload: vec![2],
                clear_metadata: ClearMetadata::named("GitHub"),
                expected_previous_version: 0,
            })
            .unwrap();
        let response = handler.handle(&stale);
        assert_eq!(response.status, status::CONFLICT);
        assert_eq!(response.error_body(), ErrorBody::version_conflict(0, 1));

        let delete = HttpRequest::new(Method::Delete, &Endpoint::Item(created.id.clone()))
            .with_bearer(&token)
            .with_json(&DeleteItemRequest {
                expected_previous_version: 1,
            })
            .unwrap();
        assert_eq!(handler.handle(&delete).status, status::NO_CONTENT);

        let get = HttpRequest::new(Method::Get, &Endpoint::Item(created.id)).with_bearer(&token);
        assert_eq!(handler.handle(&get).status, status::NOT_FOUND);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let context = context();
        let handler = RequestHandler::new(&context);
        let request = HttpRequest::new(Method::Post, &Endpoint::Items)
            .with_bearer(bearer(&context, DeviceId::generate()))
            .with_json(&create_request(vec![0; 64]))
            .unwrap();
        assert_eq!(handler.handle(&request).status, status::BAD_REQUEST);
        assert!(context.items.is_empty());
    }

    #[test]
    fn unavailable_relay() {
        let context = context();
        context.set_available(false);
        let handler = RequestHandler::new(&context);
        let request = HttpRequest::new(Method::Get, &Endpoint::Manifest(VaultId::new("home")));
        assert_eq!(handler.handle(&request).status, status::UNAVAILABLE);
    }

    #[test]
    fn wrong_method() {
        let context = context();
        let handler = RequestHandler::new(&context);
        let request = HttpRequest::new(Method::Delete, &Endpoint::Items)
            .with_bearer(bearer(&context, DeviceId::generate()));
        assert_eq!(handler.handle(&request).status, status::BAD_REQUEST);
    }
}
