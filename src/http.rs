//! HTTP API for custody operations
//!
//! Every request except `/health` names its caller with `X-Actor-Id` and
//! may pick one of the caller's role assignments with
//! `X-Role-Assignment-Id`. Without that header the caller's active
//! assignment governs the request.
//!
//! ## Equipment
//! - `GET /equipment`, `POST /equipment`
//! - `GET /equipment/{id}`, `GET /equipment/{id}/history`
//! - `POST /equipment/{id}/assign` - `{ "user", "notes"? }` (201)
//! - `POST /equipment/{id}/unassign` - `{ "user", "notes"? }`
//! - `POST /equipment/{id}/reassign` - `{ "from_user", "to_user", "notes"? }`
//! - `POST /equipment/{id}/status` - `{ "status", "notes"? }`
//!
//! ## Accessories
//! - `GET /accessories`, `POST /accessories`
//! - `GET /accessories/{id}`, `GET /accessories/{id}/history`
//! - `POST /accessories/{id}/assign` - `{ "user", "quantity" }` (201)
//! - `POST /accessories/{id}/condemn`, `POST /accessories/{id}/restock` - `{ "quantity" }`
//! - `POST /accessory-assignments/{id}/return` - `{ "quantity" }`
//!
//! ## Consumables
//! - `GET /consumables`, `POST /consumables`
//! - `GET /consumables/{id}`, `GET /consumables/{id}/history`
//! - `POST /consumables/{id}/issue` - `{ "user", "quantity", "purpose"? }` (201)
//! - `POST /consumables/{id}/use` - `{ "quantity" }` (own issue)
//! - `POST /consumables/{id}/loss` - `{ "quantity", "event_type" }` (own issue)
//! - `POST /consumables/{id}/restock` - `{ "quantity" }`
//! - `POST /consumable-issues/{id}/return` - `{ "quantity" }`
//! - `POST /consumable-issues/{id}/loss` - `{ "quantity", "event_type" }`
//!
//! ## Caller, roles and scope tree
//! - `GET /me/custody`, `GET /me/roles`
//! - `POST /roles`, `POST /roles/{id}/activate`, `DELETE /roles/{id}`
//! - `POST /admin/{departments|locations|rooms|users}` (SITE_ADMIN)
//! - `POST /admin/rooms/{id}/relocate`, `POST /admin/locations/{id}/relocate`
//! - `POST /admin/users/{id}/room`, `DELETE /admin/{departments|locations|rooms}/{id}`
//!
//! ## Example Usage
//!
//! ```bash
//! curl -X POST -H "X-Actor-Id: clerk-1" -H "Content-Type: application/json" \
//!      -d '{"user": "u-17"}' \
//!      http://localhost:8095/equipment/E101/assign
//! ```

use crate::auth::{AuthContext, Role};
use crate::db::accessories::CreateAccessoryInput;
use crate::db::consumables::CreateConsumableInput;
use crate::db::equipment::{CreateEquipmentInput, EquipmentStatus};
use crate::db::scope_tree::{CreateNodeInput, ScopeLocator};
use crate::db::users::CreateUserInput;
use crate::error::CustodyError;
use crate::services::consumable_service::LossKind;
use crate::services::role_service::GrantRoleInput;
use crate::services::{
    created, error_response, from_create_result, from_delete_result, from_result, not_found, ok, HandlerResult,
    Services,
};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub const ACTOR_HEADER: &str = "x-actor-id";
pub const ASSIGNMENT_HEADER: &str = "x-role-assignment-id";

#[derive(Debug, Deserialize)]
struct HolderBody {
    user: String,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReassignBody {
    from_user: String,
    to_user: String,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: EquipmentStatus,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuantityBody {
    quantity: i64,
}

#[derive(Debug, Deserialize)]
struct AssignQuantityBody {
    user: String,
    quantity: i64,
}

#[derive(Debug, Deserialize)]
struct IssueBody {
    user: String,
    quantity: i64,
    #[serde(default)]
    purpose: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LossBody {
    quantity: i64,
    event_type: LossKind,
}

#[derive(Debug, Deserialize)]
struct RelocateBody {
    parent: String,
}

#[derive(Debug, Deserialize)]
struct MoveUserBody {
    #[serde(default)]
    room: Option<String>,
}

/// HTTP server state
pub struct HttpServer {
    services: Arc<Services>,
    bind_addr: SocketAddr,
}

/// Read a JSON request body
async fn read_json<T, B>(req: Request<B>) -> Result<T, CustodyError>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: std::fmt::Display,
{
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| CustodyError::Internal(format!("Failed to read body: {}", e)))?;
    Ok(serde_json::from_slice(&body.to_bytes())?)
}

fn header<'a, B>(req: &'a Request<B>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Scope tree administration stays with SITE_ADMIN on the HTTP surface
fn require_site_admin(ctx: &AuthContext) -> Result<(), CustodyError> {
    match ctx.binding() {
        Some(binding) if binding.role() == Role::SiteAdmin => Ok(()),
        _ => Err(CustodyError::Forbidden {
            required: Role::SiteAdmin,
            target: "scope tree".to_string(),
        }),
    }
}

fn locator(tier: &str, id: &str) -> Option<ScopeLocator> {
    match tier {
        "departments" => Some(ScopeLocator::Department(id.to_string())),
        "locations" => Some(ScopeLocator::Location(id.to_string())),
        "rooms" => Some(ScopeLocator::Room(id.to_string())),
        _ => None,
    }
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(services: Arc<Services>, bind_addr: SocketAddr) -> Self {
        Self { services, bind_addr }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), CustodyError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route a request, rendering every failure as JSON
    pub async fn handle_request<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, Infallible>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        debug!(method = %req.method(), path = %req.uri().path(), "Incoming request");
        match self.route(req).await {
            Ok(response) => Ok(response),
            Err(e) => Ok(error_response(e)),
        }
    }

    fn context<B>(&self, req: &Request<B>) -> Result<AuthContext, CustodyError> {
        let actor = header(req, ACTOR_HEADER)
            .ok_or_else(|| CustodyError::Auth("missing X-Actor-Id header".to_string()))?;
        self.services.context(actor, header(req, ASSIGNMENT_HEADER))
    }

    async fn route<B>(&self, req: Request<B>) -> HandlerResult
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let path = req.uri().path().to_string();
        let method = req.method().clone();
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        if method == Method::GET && segments.as_slice() == ["health"] {
            return Ok(ok(&serde_json::json!({ "status": "ok" })));
        }

        let ctx = self.context(&req)?;
        let s = &self.services;

        let response = match (method, segments.as_slice()) {
            // Caller
            (Method::GET, ["me", "custody"]) => from_result(s.my_custody(&ctx)),
            (Method::GET, ["me", "roles"]) => from_result(s.roles.assignments(&ctx)),

            // Roles
            (Method::POST, ["roles"]) => {
                let input: GrantRoleInput = read_json(req).await?;
                from_create_result(s.roles.grant(&ctx, input))
            }
            (Method::POST, ["roles", id, "activate"]) => from_result(s.roles.activate(&ctx, id)),
            (Method::DELETE, ["roles", id]) => from_delete_result(s.roles.revoke(&ctx, id)),

            // Equipment
            (Method::GET, ["equipment"]) => from_result(s.equipment.list(&ctx)),
            (Method::POST, ["equipment"]) => {
                let input: CreateEquipmentInput = read_json(req).await?;
                from_create_result(s.equipment.register(&ctx, input))
            }
            (Method::GET, ["equipment", id]) => from_result(s.equipment.get(&ctx, id)),
            (Method::GET, ["equipment", id, "history"]) => from_result(s.equipment.history(&ctx, id)),
            (Method::POST, ["equipment", id, "assign"]) => {
                let body: HolderBody = read_json(req).await?;
                from_create_result(s.equipment.assign(&ctx, id, &body.user, body.notes.as_deref()))
            }
            (Method::POST, ["equipment", id, "unassign"]) => {
                let body: HolderBody = read_json(req).await?;
                from_result(s.equipment.unassign(&ctx, id, &body.user, body.notes.as_deref()))
            }
            (Method::POST, ["equipment", id, "reassign"]) => {
                let body: ReassignBody = read_json(req).await?;
                from_result(s.equipment.reassign(&ctx, id, &body.from_user, &body.to_user, body.notes.as_deref()))
            }
            (Method::POST, ["equipment", id, "status"]) => {
                let body: StatusBody = read_json(req).await?;
                from_result(s.equipment.change_status(&ctx, id, body.status, body.notes.as_deref()))
            }

            // Accessories
            (Method::GET, ["accessories"]) => from_result(s.accessories.list(&ctx)),
            (Method::POST, ["accessories"]) => {
                let input: CreateAccessoryInput = read_json(req).await?;
                from_create_result(s.accessories.register(&ctx, input))
            }
            (Method::GET, ["accessories", id]) => from_result(s.accessories.get(&ctx, id)),
            (Method::GET, ["accessories", id, "history"]) => from_result(s.accessories.history(&ctx, id)),
            (Method::POST, ["accessories", id, "assign"]) => {
                let body: AssignQuantityBody = read_json(req).await?;
                from_create_result(s.accessories.assign(&ctx, id, &body.user, body.quantity))
            }
            (Method::POST, ["accessories", id, "condemn"]) => {
                let body: QuantityBody = read_json(req).await?;
                from_result(s.accessories.condemn(&ctx, id, body.quantity))
            }
            (Method::POST, ["accessories", id, "restock"]) => {
                let body: QuantityBody = read_json(req).await?;
                from_result(s.accessories.restock(&ctx, id, body.quantity))
            }
            (Method::POST, ["accessory-assignments", id, "return"]) => {
                let body: QuantityBody = read_json(req).await?;
                from_result(s.accessories.admin_return(&ctx, id, body.quantity))
            }

            // Consumables
            (Method::GET, ["consumables"]) => from_result(s.consumables.list(&ctx)),
            (Method::POST, ["consumables"]) => {
                let input: CreateConsumableInput = read_json(req).await?;
                from_create_result(s.consumables.register(&ctx, input))
            }
            (Method::GET, ["consumables", id]) => from_result(s.consumables.get(&ctx, id)),
            (Method::GET, ["consumables", id, "history"]) => from_result(s.consumables.history(&ctx, id)),
            (Method::POST, ["consumables", id, "issue"]) => {
                let body: IssueBody = read_json(req).await?;
                from_create_result(s.consumables.issue(&ctx, id, &body.user, body.quantity, body.purpose.as_deref()))
            }
            (Method::POST, ["consumables", id, "use"]) => {
                let body: QuantityBody = read_json(req).await?;
                from_result(s.consumables.use_own(&ctx, id, body.quantity))
            }
            (Method::POST, ["consumables", id, "loss"]) => {
                let body: LossBody = read_json(req).await?;
                from_result(s.consumables.report_loss_self(&ctx, id, body.quantity, body.event_type))
            }
            (Method::POST, ["consumables", id, "restock"]) => {
                let body: QuantityBody = read_json(req).await?;
                from_result(s.consumables.restock(&ctx, id, body.quantity))
            }
            (Method::POST, ["consumable-issues", id, "return"]) => {
                let body: QuantityBody = read_json(req).await?;
                from_result(s.consumables.admin_return(&ctx, id, body.quantity))
            }
            (Method::POST, ["consumable-issues", id, "loss"]) => {
                let body: LossBody = read_json(req).await?;
                from_result(s.consumables.report_loss_admin(&ctx, id, body.quantity, body.event_type))
            }

            // Scope tree and users
            (method, ["admin", ..]) => {
                require_site_admin(&ctx)?;
                self.route_admin(method, &segments[1..], req).await?
            }

            _ => not_found("Not Found"),
        };
        Ok(response)
    }

    async fn route_admin<B>(&self, method: Method, segments: &[&str], req: Request<B>) -> HandlerResult
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let directory = &self.services.directory;
        let response = match (method, segments) {
            (Method::POST, ["departments"]) => {
                let input: CreateNodeInput = read_json(req).await?;
                created(&directory.create_department(input)?)
            }
            (Method::POST, ["locations"]) => {
                let input: CreateNodeInput = read_json(req).await?;
                created(&directory.create_location(input)?)
            }
            (Method::POST, ["rooms"]) => {
                let input: CreateNodeInput = read_json(req).await?;
                created(&directory.create_room(input)?)
            }
            (Method::POST, ["users"]) => {
                let input: CreateUserInput = read_json(req).await?;
                created(&directory.create_user(input)?)
            }
            (Method::POST, ["rooms", id, "relocate"]) => {
                let body: RelocateBody = read_json(req).await?;
                ok(&directory.relocate_room(id, &body.parent)?)
            }
            (Method::POST, ["locations", id, "relocate"]) => {
                let body: RelocateBody = read_json(req).await?;
                ok(&directory.relocate_location(id, &body.parent)?)
            }
            (Method::POST, ["users", id, "room"]) => {
                let body: MoveUserBody = read_json(req).await?;
                ok(&directory.move_user(id, body.room.as_deref())?)
            }
            (Method::DELETE, [tier, id]) => match locator(tier, id) {
                Some(locator) => from_delete_result(directory.delete_node(&locator)),
                None => not_found("Not Found"),
            },
            _ => not_found("Not Found"),
        };
        Ok(response)
    }
}
