//! The built-in core plugin: core API routes, sidebar categories and the
//! `core` socket endpoint.

use axum::Router;
use serde_json::{json, Value};

use crate::api;
use crate::plugins::registry::{HttpPlugin, SocketEndpoint};
use crate::plugins::sidebar::{SidebarItem, SidebarProvider};
use crate::worker::runtime::{WorkerContext, WorkerState};

pub const CORE_PLUGIN: &str = "core";

pub struct CorePlugin;

impl HttpPlugin for CorePlugin {
    fn id(&self) -> &'static str {
        CORE_PLUGIN
    }

    fn routes(&self) -> Router<WorkerState> {
        api::core::routes()
    }
}

impl SidebarProvider for CorePlugin {
    fn items(&self) -> Vec<SidebarItem> {
        vec![
            SidebarItem::category("category:general", "General", 0),
            SidebarItem::category("category:tools", "Tools", 10),
            SidebarItem::category("category:software", "Software", 20),
            SidebarItem::category("category:system", "System", 30),
            SidebarItem::category("category:other", "Other", 40),
        ]
    }
}

impl SocketEndpoint for CorePlugin {
    fn plugin(&self) -> &str {
        CORE_PLUGIN
    }

    fn on_message(&self, ctx: &WorkerContext, data: Value) -> Vec<Value> {
        match data.get("type").and_then(Value::as_str) {
            Some("ping") => vec![json!({"type": "pong"})],
            Some("identity") => vec![json!({
                "type": "identity",
                "user": ctx.identity.as_ref().map(|i| i.user.as_str()),
            })],
            other => {
                tracing::debug!(kind = ?other, "Ignoring core socket message");
                Vec::new()
            }
        }
    }
}
