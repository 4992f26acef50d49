// src/mcp_server.rs

use std::sync::Arc;

use anyhow::Context as _;

use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    schemars,
    service::RequestContext,
    tool, tool_handler, tool_router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::client::MetabaseClient;
use crate::config::Config;
use crate::error::{self, ErrorKind, MetabaseError};
use crate::format::{format_entity, format_list, format_query_result, list_items};
use crate::link::{self, DecodedLink};
use crate::validation;

const SERVER_INSTRUCTIONS: &str = "Access a Metabase instance: browse dashboards, questions (cards), \
databases, tables, fields, collections, segments, metrics and users, run saved questions or native SQL, \
and decode shareable question links (the base64 part after '#').\n\n\
WRITE OPERATIONS: create_card, update_card, create_dashboard, update_dashboard, add_card_to_dashboard, \
create_collection and create_database change the Metabase instance and run immediately when called. \
Before calling any of them, describe the exact change to the user and wait for their explicit confirmation. \
Never chain several write operations without confirming each one.";

const DEFAULT_CARD_DISPLAY: &str = "table";
const DEFAULT_COLLECTION_COLOR: &str = "#509EE3";

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct DashboardIdRequest {
    /// Numeric id of the dashboard
    pub dashboard_id: i64,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CardIdRequest {
    /// Numeric id of the card (saved question)
    pub card_id: i64,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ListCardsRequest {
    /// Metabase card filter: all, mine, bookmarked, archived, ... (default: all)
    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ExecuteCardRequest {
    /// Numeric id of the card to run
    pub card_id: i64,
    /// Optional Metabase parameter values (array of {type, target, value})
    #[serde(default)]
    pub parameters: Option<Value>,
    /// Maximum rows to show (default: server limit)
    #[serde(default)]
    pub max_rows: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct DatabaseIdRequest {
    /// Numeric id of the database
    pub database_id: i64,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct TableIdRequest {
    /// Numeric id of the table
    pub table_id: i64,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct FieldIdRequest {
    /// Numeric id of the field
    pub field_id: i64,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ExecuteQueryRequest {
    /// Database to run the query against
    pub database_id: i64,
    /// Native SQL text
    pub query: String,
    /// Optional native query parameters
    #[serde(default)]
    pub native_parameters: Option<Value>,
    /// Maximum rows to show (default: server limit)
    #[serde(default)]
    pub max_rows: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct UrlRequest {
    /// Shareable Metabase link whose fragment (after '#') holds the base64 question definition
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ExecuteUrlRequest {
    /// Shareable Metabase link whose fragment (after '#') holds the base64 question definition
    pub url: String,
    /// Maximum rows to show (default: server limit)
    #[serde(default)]
    pub max_rows: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CreateCardRequest {
    pub name: String,
    /// Database the native query runs against
    pub database_id: i64,
    /// Native SQL text
    pub query: String,
    /// Visualization type (default: table)
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default)]
    pub collection_id: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct UpdateCardRequest {
    pub card_id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Replacement native SQL text; requires database_id
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub database_id: Option<i64>,
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default)]
    pub collection_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CreateDashboardRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub collection_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct UpdateDashboardRequest {
    pub dashboard_id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub collection_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct AddCardToDashboardRequest {
    pub dashboard_id: i64,
    pub card_id: i64,
    /// Grid row (default: 0)
    #[serde(default)]
    pub row: u32,
    /// Grid column (default: 0)
    #[serde(default)]
    pub col: u32,
    /// Width in grid units (default: 4)
    #[serde(default = "default_card_size_x")]
    pub size_x: u32,
    /// Height in grid units (default: 4)
    #[serde(default = "default_card_size_y")]
    pub size_y: u32,
}

fn default_card_size_x() -> u32 {
    4
}

fn default_card_size_y() -> u32 {
    4
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CreateCollectionRequest {
    pub name: String,
    /// Hex color (default: #509EE3)
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CreateDatabaseRequest {
    /// Database engine, e.g. postgres, mysql, h2
    pub engine: String,
    pub name: String,
    /// Engine-specific connection details object
    pub details: Value,
}

#[derive(Debug, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct NoArgs {}

#[derive(Clone)]
pub struct MetabaseServer {
    client: MetabaseClient,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl MetabaseServer {
    pub fn new(client: MetabaseClient) -> Self {
        Self {
            client,
            tool_router: Self::tool_router(),
        }
    }

    // ----- dashboards -----

    #[tool(description = "List all dashboards with their ids, names and collections.")]
    async fn list_dashboards(
        &self,
        Parameters(_args): Parameters<NoArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self
            .client
            .get("/api/dashboard")
            .await
            .map(|v| format_list("Dashboards", &v, &["collection_id", "description"]));
        respond("list_dashboards", result)
    }

    #[tool(description = "Get a dashboard's full definition by id.")]
    async fn get_dashboard(
        &self,
        Parameters(args): Parameters<DashboardIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result: error::Result<String> = async {
            let id = validation::positive_id("dashboard_id", args.dashboard_id)?;
            let dashboard = self.client.get(&format!("/api/dashboard/{}", id)).await?;
            Ok(format_entity("Dashboard", &dashboard))
        }
        .await;
        respond("get_dashboard", result)
    }

    #[tool(description = "List the cards placed on a dashboard, with their grid positions.")]
    async fn get_dashboard_cards(
        &self,
        Parameters(args): Parameters<DashboardIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result: error::Result<String> = async {
            let id = validation::positive_id("dashboard_id", args.dashboard_id)?;
            let dashboard = self.client.get(&format!("/api/dashboard/{}", id)).await?;
            Ok(format_dashboard_cards(&dashboard))
        }
        .await;
        respond("get_dashboard_cards", result)
    }

    // ----- cards -----

    #[tool(description = "List cards (saved questions). Optional filter: all, mine, bookmarked, archived.")]
    async fn list_cards(
        &self,
        Parameters(args): Parameters<ListCardsRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result: error::Result<String> = async {
            let filter = card_filter(args.filter.as_deref())?;
            let cards = self.client.get(&format!("/api/card/?f={}", filter)).await?;
            Ok(format_list("Cards", &cards, &["display", "database_id", "collection_id"]))
        }
        .await;
        respond("list_cards", result)
    }

    #[tool(description = "Get a card (saved question) by id, including its query definition.")]
    async fn get_card(
        &self,
        Parameters(args): Parameters<CardIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result: error::Result<String> = async {
            let card = self.fetch_card(args.card_id).await?;
            Ok(format_entity("Card", &card))
        }
        .await;
        respond("get_card", result)
    }

    #[tool(description = "Run a saved card's query and return the result rows.")]
    async fn execute_card(
        &self,
        Parameters(args): Parameters<ExecuteCardRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result: error::Result<String> = async {
            let max_rows = self.max_rows(args.max_rows)?;
            let card = self.fetch_card(args.card_id).await?;
            let mut query = card_dataset_query(&card, args.card_id)?;
            if let (Some(parameters), Value::Object(map)) = (args.parameters, &mut query) {
                map.insert("parameters".to_string(), parameters);
            }
            let rows = self.client.post("/api/dataset", query).await?;
            Ok(format_query_result(&rows, max_rows))
        }
        .await;
        respond("execute_card", result)
    }

    // ----- databases, tables, fields -----

    #[tool(description = "List all connected databases with their engines.")]
    async fn list_databases(
        &self,
        Parameters(_args): Parameters<NoArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self
            .client
            .get("/api/database/")
            .await
            .map(|v| format_list("Databases", &v, &["engine"]));
        respond("list_databases", result)
    }

    #[tool(description = "Get a database's details by id.")]
    async fn get_database(
        &self,
        Parameters(args): Parameters<DatabaseIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result: error::Result<String> = async {
            let id = validation::positive_id("database_id", args.database_id)?;
            let database = self.client.get(&format!("/api/database/{}", id)).await?;
            Ok(format_entity("Database", &database))
        }
        .await;
        respond("get_database", result)
    }

    #[tool(description = "Get a table's query metadata: its fields, types and foreign keys.")]
    async fn get_table_metadata(
        &self,
        Parameters(args): Parameters<TableIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result: error::Result<String> = async {
            let id = validation::positive_id("table_id", args.table_id)?;
            let table = self
                .client
                .get(&format!("/api/table/{}/query_metadata", id))
                .await?;
            Ok(format_table_metadata(&table))
        }
        .await;
        respond("get_table_metadata", result)
    }

    #[tool(description = "Get a field's metadata by id.")]
    async fn get_field(
        &self,
        Parameters(args): Parameters<FieldIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result: error::Result<String> = async {
            let id = validation::positive_id("field_id", args.field_id)?;
            let field = self.client.get(&format!("/api/field/{}", id)).await?;
            Ok(format_entity("Field", &field))
        }
        .await;
        respond("get_field", result)
    }

    #[tool(description = "Run a native SQL query against a database and return the result rows.")]
    async fn execute_query(
        &self,
        Parameters(args): Parameters<ExecuteQueryRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result: error::Result<String> = async {
            let database_id = validation::positive_id("database_id", args.database_id)?;
            let sql = validation::sql_query(&args.query)?;
            let max_rows = self.max_rows(args.max_rows)?;
            let mut body = native_query(database_id, sql);
            if let Some(parameters) = args.native_parameters {
                body["parameters"] = parameters;
            }
            let rows = self.client.post("/api/dataset", body).await?;
            Ok(format_query_result(&rows, max_rows))
        }
        .await;
        respond("execute_query", result)
    }

    // ----- collections, segments, metrics, users -----

    #[tool(description = "List all collections.")]
    async fn list_collections(
        &self,
        Parameters(_args): Parameters<NoArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self
            .client
            .get("/api/collection/")
            .await
            .map(|v| format_list("Collections", &v, &["location", "description"]));
        respond("list_collections", result)
    }

    #[tool(description = "List segments (saved filters). Returns an empty list on versions without segments.")]
    async fn list_segments(
        &self,
        Parameters(_args): Parameters<NoArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self
            .get_optional("/api/segment")
            .await
            .map(|v| format_list("Segments", &v, &["table_id", "description"]));
        respond("list_segments", result)
    }

    #[tool(description = "List metrics. Returns an empty list on versions without the metric endpoint.")]
    async fn list_metrics(
        &self,
        Parameters(_args): Parameters<NoArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self
            .get_optional("/api/metric")
            .await
            .map(|v| format_list("Metrics", &v, &["table_id", "description"]));
        respond("list_metrics", result)
    }

    #[tool(description = "List users with their emails.")]
    async fn list_users(
        &self,
        Parameters(_args): Parameters<NoArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self
            .client
            .get("/api/user/")
            .await
            .map(|v| format_list("Users", &v, &["email", "is_superuser"]));
        respond("list_users", result)
    }

    #[tool(description = "List recently viewed items of the API key's user.")]
    async fn get_recent_activity(
        &self,
        Parameters(_args): Parameters<NoArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self
            .get_optional("/api/activity/recent_views")
            .await
            .map(|v| format_recent_views(&v));
        respond("get_recent_activity", result)
    }

    // ----- shareable links -----

    #[tool(description = "Decode a shareable Metabase question link (the base64 part after '#') into its card id, query, parameters and visualization. Makes no request to Metabase.")]
    async fn decode_dashboard_url(
        &self,
        Parameters(args): Parameters<UrlRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result = link::decode_dashboard_url(&args.url).and_then(|d| format_decoded(&d));
        respond("decode_dashboard_url", result)
    }

    #[tool(description = "Decode a shareable question link and fetch the saved card it was derived from, together with the link's query parameters.")]
    async fn get_card_from_url(
        &self,
        Parameters(args): Parameters<UrlRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result: error::Result<String> = async {
            let decoded = link::decode_dashboard_url(&args.url)?;
            let card_id = linked_card_id(&decoded, &args.url)?;
            let card = self.fetch_card(card_id).await?;
            let params = if decoded.parameters.is_empty() {
                "none".to_string()
            } else {
                serde_json::to_string_pretty(&decoded.parameters)
                    .unwrap_or_else(|_| "{}".to_string())
            };
            Ok(format!(
                "{}\n\nLink query type: {}, display: {}\nLink parameters: {}",
                format_entity("Card", &card),
                decoded.query_type().unwrap_or("none"),
                decoded.display.as_deref().unwrap_or("unspecified"),
                params
            ))
        }
        .await;
        respond("get_card_from_url", result)
    }

    #[tool(description = "Decode a shareable question link and run the query it describes. Falls back to the original saved card's query when the link carries none.")]
    async fn execute_url_query(
        &self,
        Parameters(args): Parameters<ExecuteUrlRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result: error::Result<String> = async {
            let max_rows = self.max_rows(args.max_rows)?;
            let decoded = link::decode_dashboard_url(&args.url)?;
            let query = match decoded.dataset_query.as_ref().filter(|q| q.is_object()) {
                Some(query) => query.clone(),
                None => {
                    let card_id = linked_card_id(&decoded, &args.url)?;
                    let card = self.fetch_card(card_id).await?;
                    card_dataset_query(&card, card_id)?
                }
            };
            let rows = self.client.post("/api/dataset", query).await?;
            Ok(format_query_result(&rows, max_rows))
        }
        .await;
        respond("execute_url_query", result)
    }

    // ----- writes -----

    #[tool(description = "WRITE: create a native SQL card (saved question). Ask the user to confirm the name, database and SQL before calling.")]
    async fn create_card(
        &self,
        Parameters(args): Parameters<CreateCardRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result: error::Result<String> = async {
            let name = validation::non_empty("name", &args.name)?;
            let database_id = validation::positive_id("database_id", args.database_id)?;
            let sql = validation::sql_query(&args.query)?;
            let mut body = json!({
                "name": name,
                "dataset_query": native_query(database_id, sql),
                "display": args.display.as_deref().unwrap_or(DEFAULT_CARD_DISPLAY),
                "visualization_settings": {},
            });
            insert_opt(&mut body, "collection_id", args.collection_id);
            insert_opt(&mut body, "description", args.description);
            let card = self.client.post("/api/card", body).await?;
            Ok(format!("Created {}", format_entity("card", &card)))
        }
        .await;
        respond("create_card", result)
    }

    #[tool(description = "WRITE: update a card's name, description, SQL, display or collection. Ask the user to confirm the change before calling.")]
    async fn update_card(
        &self,
        Parameters(args): Parameters<UpdateCardRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result: error::Result<String> = async {
            let card_id = validation::positive_id("card_id", args.card_id)?;
            let mut body = json!({});
            if let Some(name) = &args.name {
                insert_opt(&mut body, "name", Some(validation::non_empty("name", name)?));
            }
            insert_opt(&mut body, "description", args.description);
            insert_opt(&mut body, "display", args.display);
            insert_opt(&mut body, "collection_id", args.collection_id);
            if let Some(query) = &args.query {
                let database_id = args.database_id.ok_or_else(|| {
                    MetabaseError::validation(
                        "database_id",
                        Value::Null,
                        "is required when replacing the query",
                    )
                })?;
                let database_id = validation::positive_id("database_id", database_id)?;
                let sql = validation::sql_query(query)?;
                body["dataset_query"] = native_query(database_id, sql);
            }
            if body.as_object().is_some_and(Map::is_empty) {
                return Err(MetabaseError::validation(
                    "fields",
                    Value::Null,
                    "at least one field to update is required",
                ));
            }
            let card = self.client.put(&format!("/api/card/{}", card_id), body).await?;
            Ok(format!("Updated {}", format_entity("card", &card)))
        }
        .await;
        respond("update_card", result)
    }

    #[tool(description = "WRITE: create an empty dashboard. Ask the user to confirm before calling.")]
    async fn create_dashboard(
        &self,
        Parameters(args): Parameters<CreateDashboardRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result: error::Result<String> = async {
            let name = validation::non_empty("name", &args.name)?;
            let mut body = json!({ "name": name, "parameters": [] });
            insert_opt(&mut body, "description", args.description);
            insert_opt(&mut body, "collection_id", args.collection_id);
            let dashboard = self.client.post("/api/dashboard", body).await?;
            Ok(format!("Created {}", format_entity("dashboard", &dashboard)))
        }
        .await;
        respond("create_dashboard", result)
    }

    #[tool(description = "WRITE: update a dashboard's name, description or collection. Ask the user to confirm before calling.")]
    async fn update_dashboard(
        &self,
        Parameters(args): Parameters<UpdateDashboardRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result: error::Result<String> = async {
            let id = validation::positive_id("dashboard_id", args.dashboard_id)?;
            let mut body = json!({});
            if let Some(name) = &args.name {
                insert_opt(&mut body, "name", Some(validation::non_empty("name", name)?));
            }
            insert_opt(&mut body, "description", args.description);
            insert_opt(&mut body, "collection_id", args.collection_id);
            if body.as_object().is_some_and(Map::is_empty) {
                return Err(MetabaseError::validation(
                    "fields",
                    Value::Null,
                    "at least one field to update is required",
                ));
            }
            let dashboard = self.client.put(&format!("/api/dashboard/{}", id), body).await?;
            Ok(format!("Updated {}", format_entity("dashboard", &dashboard)))
        }
        .await;
        respond("update_dashboard", result)
    }

    #[tool(description = "WRITE: place a card on a dashboard at the given grid position. Ask the user to confirm before calling.")]
    async fn add_card_to_dashboard(
        &self,
        Parameters(args): Parameters<AddCardToDashboardRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result: error::Result<String> = async {
            let dashboard_id = validation::positive_id("dashboard_id", args.dashboard_id)?;
            let card_id = validation::positive_id("card_id", args.card_id)?;
            let body = json!({
                "cardId": card_id,
                "row": args.row,
                "col": args.col,
                "size_x": args.size_x,
                "size_y": args.size_y,
            });
            let dashcard = self
                .client
                .post(&format!("/api/dashboard/{}/cards", dashboard_id), body)
                .await?;
            Ok(format!(
                "Added card {} to dashboard {}.\n\n{}",
                card_id,
                dashboard_id,
                serde_json::to_string_pretty(&dashcard).unwrap_or_else(|_| dashcard.to_string())
            ))
        }
        .await;
        respond("add_card_to_dashboard", result)
    }

    #[tool(description = "WRITE: create a collection, optionally inside a parent collection. Ask the user to confirm before calling.")]
    async fn create_collection(
        &self,
        Parameters(args): Parameters<CreateCollectionRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result: error::Result<String> = async {
            let name = validation::non_empty("name", &args.name)?;
            let mut body = json!({
                "name": name,
                "color": args.color.as_deref().unwrap_or(DEFAULT_COLLECTION_COLOR),
            });
            if let Some(parent_id) = args.parent_id {
                insert_opt(
                    &mut body,
                    "parent_id",
                    Some(validation::positive_id("parent_id", parent_id)?),
                );
            }
            insert_opt(&mut body, "description", args.description);
            let collection = self.client.post("/api/collection", body).await?;
            Ok(format!("Created {}", format_entity("collection", &collection)))
        }
        .await;
        respond("create_collection", result)
    }

    #[tool(description = "WRITE: connect a new database. Ask the user to confirm the engine, name and connection details before calling.")]
    async fn create_database(
        &self,
        Parameters(args): Parameters<CreateDatabaseRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result: error::Result<String> = async {
            let engine = validation::non_empty("engine", &args.engine)?;
            let name = validation::non_empty("name", &args.name)?;
            let details = validation::json_object("details", &args.details)?;
            let body = json!({ "engine": engine, "name": name, "details": details });
            let database = self.client.post("/api/database", body).await?;
            Ok(format!("Created {}", format_entity("database", &database)))
        }
        .await;
        respond("create_database", result)
    }
}

impl MetabaseServer {
    async fn fetch_card(&self, card_id: i64) -> error::Result<Value> {
        let id = validation::positive_id("card_id", card_id)?;
        self.client.get(&format!("/api/card/{}", id)).await
    }

    /// GET an endpoint that older or newer Metabase versions may not have;
    /// a 404 reads as an empty list.
    async fn get_optional(&self, endpoint: &str) -> error::Result<Value> {
        match self.client.get(endpoint).await {
            Err(e) if e.is_not_found() => {
                tracing::debug!("{} not available on this Metabase version", endpoint);
                Ok(json!([]))
            }
            other => other,
        }
    }

    fn max_rows(&self, requested: Option<u32>) -> error::Result<usize> {
        let limit = self.client.config().max_rows;
        let rows = match requested {
            Some(n) => validation::row_limit("max_rows", n, limit)?,
            None => limit,
        };
        Ok(rows as usize)
    }
}

#[tool_handler]
impl ServerHandler for MetabaseServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(SERVER_INSTRUCTIONS.to_string()),
        }
    }

    async fn initialize(
        &self,
        _request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        tracing::info!("Client initialized MCP server");
        Ok(self.get_info())
    }
}

/// Platform failures become error results for the model, never protocol errors.
fn respond(tool: &str, result: error::Result<String>) -> Result<CallToolResult, McpError> {
    match result {
        Ok(text) => {
            tracing::debug!("Tool {} succeeded", tool);
            Ok(CallToolResult::success(vec![Content::text(text)]))
        }
        Err(e) => {
            let details = Value::Object(e.details());
            let at = e.timestamp().to_rfc3339();
            match e.kind() {
                // Caller mistakes log at debug
                ErrorKind::Validation { .. } => {
                    tracing::debug!("Tool {} rejected [{}] at {}: {} {}", tool, e.code(), at, e, details)
                }
                _ => tracing::warn!("Tool {} failed [{}] at {}: {} {}", tool, e.code(), at, e, details),
            }
            Ok(CallToolResult::error(vec![Content::text(
                e.format_for_display(),
            )]))
        }
    }
}

fn card_filter(filter: Option<&str>) -> error::Result<&str> {
    let filter = filter.map(str::trim).unwrap_or("all");
    let valid = !filter.is_empty()
        && filter
            .chars()
            .all(|c| c.is_ascii_lowercase() || c == '_');
    if !valid {
        return Err(MetabaseError::validation(
            "filter",
            filter,
            "must be a Metabase card filter such as all, mine, bookmarked or archived",
        ));
    }
    Ok(filter)
}

fn native_query(database_id: i64, sql: &str) -> Value {
    json!({
        "database": database_id,
        "type": "native",
        "native": { "query": sql, "template-tags": {} },
    })
}

fn card_dataset_query(card: &Value, card_id: i64) -> error::Result<Value> {
    card.get("dataset_query")
        .filter(|q| q.is_object())
        .cloned()
        .ok_or_else(|| {
            MetabaseError::validation("card_id", card_id, "card has no runnable dataset_query")
        })
}

fn linked_card_id(decoded: &DecodedLink, url: &str) -> error::Result<i64> {
    decoded
        .original_card_id
        .ok_or_else(|| MetabaseError::validation("url", url, "link has no original_card_id"))
}

fn insert_opt<T: Into<Value>>(body: &mut Value, key: &str, value: Option<T>) {
    if let (Some(value), Value::Object(map)) = (value, body) {
        map.insert(key.to_string(), value.into());
    }
}

fn format_decoded(decoded: &DecodedLink) -> error::Result<String> {
    serde_json::to_string_pretty(decoded).map_err(|e| {
        MetabaseError::validation("url", Value::Null, format!("Failed to render payload: {}", e))
    })
}

fn format_dashboard_cards(dashboard: &Value) -> String {
    let name = dashboard
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("(unnamed)");
    let dashcards = dashboard
        .get("dashcards")
        .or_else(|| dashboard.get("ordered_cards"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    if dashcards.is_empty() {
        return format!("Dashboard '{}' has no cards.", name);
    }

    let mut out = format!("Dashboard '{}' cards ({}):\n", name, dashcards.len());
    for dashcard in dashcards {
        let card = dashcard.get("card");
        let card_name = card
            .and_then(|c| c.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("(text or virtual card)");
        let card_id = dashcard
            .get("card_id")
            .filter(|v| !v.is_null())
            .map(Value::to_string)
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "- [{}] {} at row {}, col {} ({}x{})\n",
            card_id,
            card_name,
            dashcard.get("row").unwrap_or(&Value::Null),
            dashcard.get("col").unwrap_or(&Value::Null),
            dashcard.get("size_x").unwrap_or(&Value::Null),
            dashcard.get("size_y").unwrap_or(&Value::Null),
        ));
    }
    out
}

fn format_table_metadata(table: &Value) -> String {
    let name = table
        .get("display_name")
        .or_else(|| table.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("(unnamed)");
    let fields = table
        .get("fields")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut out = format!("Table '{}' ({} fields):\n", name, fields.len());
    for field in fields {
        let field_name = field.get("name").and_then(Value::as_str).unwrap_or("?");
        let base_type = field.get("base_type").and_then(Value::as_str).unwrap_or("?");
        out.push_str(&format!(
            "- [{}] {}: {}",
            field.get("id").unwrap_or(&Value::Null),
            field_name,
            base_type
        ));
        if let Some(semantic) = field.get("semantic_type").and_then(Value::as_str) {
            out.push_str(&format!(" ({})", semantic));
        }
        if let Some(target) = field.get("fk_target_field_id").filter(|v| !v.is_null()) {
            out.push_str(&format!(" -> field {}", target));
        }
        out.push('\n');
    }
    out
}

fn format_recent_views(value: &Value) -> String {
    let items = match value.get("recent_views") {
        Some(views) => list_items(views),
        None => list_items(value),
    };
    if items.is_empty() {
        return "No recent activity found.".to_string();
    }

    let mut out = format!("Recently viewed ({}):\n", items.len());
    for item in items {
        let model = item.get("model").and_then(Value::as_str).unwrap_or("item");
        let id = item
            .get("model_id")
            .or_else(|| item.get("id"))
            .map(Value::to_string)
            .unwrap_or_else(|| "?".to_string());
        let name = item
            .get("name")
            .or_else(|| item.get("model_object").and_then(|o| o.get("name")))
            .and_then(Value::as_str)
            .unwrap_or("(unnamed)");
        out.push_str(&format!("- {} {}: {}\n", model, id, name));
    }
    out
}

/// Start the MCP server with stdio transport
pub async fn start_mcp(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        "Starting Metabase MCP server for {} (timeout {}ms)",
        config.base_url,
        config.timeout_ms()
    );

    let client =
        MetabaseClient::new(Arc::new(config)).context("Failed to build HTTP client")?;
    let server = MetabaseServer::new(client);

    // Use stdio transport (stdin/stdout)
    let service = server
        .serve(rmcp::transport::stdio())
        .await
        .inspect_err(|e| {
            tracing::error!("Serving error: {:?}", e);
        })?;

    tracing::info!("MCP server running on stdio transport");

    // Wait for shutdown
    service.waiting().await?;

    tracing::info!("MCP server shutdown");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_server(base_url: String) -> MetabaseServer {
        let config = Config::new(base_url, "mb_test_key", Duration::from_secs(5), 50)
            .expect("test config must build");
        let client = MetabaseClient::new(Arc::new(config)).expect("test client must build");
        MetabaseServer::new(client)
    }

    fn result_text(result: &CallToolResult) -> String {
        let value = serde_json::to_value(result).expect("result serializes");
        value["content"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default()
    }

    fn is_error(result: &CallToolResult) -> bool {
        let value = serde_json::to_value(result).expect("result serializes");
        value["isError"].as_bool().unwrap_or(false)
    }

    fn link_for(document: Value) -> String {
        format!(
            "https://metabase.example.com/question#{}",
            STANDARD.encode(document.to_string())
        )
    }

    #[test]
    fn instructions_ask_for_confirmation() {
        let server = test_server("http://127.0.0.1".to_string());
        let instructions = server.get_info().instructions.expect("instructions set");
        assert!(instructions.contains("explicit confirmation"));
        assert!(instructions.contains("create_card"));
    }

    #[test]
    fn failures_become_error_results_with_details() {
        let result = respond(
            "get_card",
            Err(MetabaseError::timeout("GET /api/card/1", 250)),
        )
        .expect("respond never raises");
        assert!(is_error(&result));
        assert!(result_text(&result).starts_with("Error [TIMEOUT_ERROR]"));

        let result = respond("get_card", Err(MetabaseError::validation("card_id", 0, "bad")))
            .expect("respond never raises");
        assert!(is_error(&result));
        assert!(result_text(&result).contains("Received: 0"));
    }

    #[test]
    fn card_filter_defaults_to_all() {
        assert_eq!(card_filter(None).unwrap(), "all");
        assert_eq!(card_filter(Some("archived")).unwrap(), "archived");
        assert!(card_filter(Some("all&f=mine")).is_err());
    }

    #[tokio::test]
    async fn get_card_formats_entity() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/card/7"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": 7, "name": "Revenue"})),
            )
            .mount(&mock_server)
            .await;

        let server = test_server(mock_server.uri());
        let result = server
            .get_card(Parameters(CardIdRequest { card_id: 7 }))
            .await
            .expect("tool call must not raise");

        assert!(!is_error(&result));
        assert!(result_text(&result).starts_with("Card 7 - Revenue"));
    }

    #[tokio::test]
    async fn api_failure_becomes_error_result() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/card/999999"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not found."))
            .mount(&mock_server)
            .await;

        let server = test_server(mock_server.uri());
        let result = server
            .get_card(Parameters(CardIdRequest { card_id: 999_999 }))
            .await
            .expect("tool call must not raise");

        assert!(is_error(&result));
        let text = result_text(&result);
        assert!(text.contains("API_ERROR"));
        assert!(text.contains("404"));
        assert!(text.contains("Not found."));
    }

    #[tokio::test]
    async fn invalid_id_is_rejected_without_request() {
        let server = test_server("http://127.0.0.1:9".to_string());
        let result = server
            .get_dashboard(Parameters(DashboardIdRequest { dashboard_id: 0 }))
            .await
            .expect("tool call must not raise");

        assert!(is_error(&result));
        assert!(result_text(&result).contains("VALIDATION_ERROR"));
    }

    #[tokio::test]
    async fn missing_segment_endpoint_reads_as_empty() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/segment"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not found."))
            .mount(&mock_server)
            .await;

        let server = test_server(mock_server.uri());
        let result = server
            .list_segments(Parameters(NoArgs::default()))
            .await
            .expect("tool call must not raise");

        assert!(!is_error(&result));
        assert_eq!(result_text(&result), "No segments found.");
    }

    #[tokio::test]
    async fn list_cards_passes_filter() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/card/"))
            .and(query_param("f", "mine"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1, "name": "Orders", "display": "table"}
            ])))
            .mount(&mock_server)
            .await;

        let server = test_server(mock_server.uri());
        let result = server
            .list_cards(Parameters(ListCardsRequest {
                filter: Some("mine".to_string()),
            }))
            .await
            .expect("tool call must not raise");

        assert!(result_text(&result).contains("- [1] Orders (display: table)"));
    }

    #[tokio::test]
    async fn execute_query_posts_native_dataset_query() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/dataset"))
            .and(body_json(json!({
                "database": 2,
                "type": "native",
                "native": {"query": "SELECT 1 AS one", "template-tags": {}}
            })))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "status": "completed",
                "row_count": 1,
                "data": {"cols": [{"name": "one"}], "rows": [[1]]}
            })))
            .mount(&mock_server)
            .await;

        let server = test_server(mock_server.uri());
        let result = server
            .execute_query(Parameters(ExecuteQueryRequest {
                database_id: 2,
                query: "SELECT 1 AS one".to_string(),
                native_parameters: None,
                max_rows: None,
            }))
            .await
            .expect("tool call must not raise");

        assert!(!is_error(&result));
        assert!(result_text(&result).contains("Showing 1 of 1 rows."));
    }

    #[tokio::test]
    async fn decode_tool_makes_no_request() {
        let server = test_server("http://127.0.0.1:9".to_string());
        let url = link_for(json!({
            "original_card_id": 42,
            "dataset_query": {"type": "query", "query": {"limit": 10}},
            "display": "table"
        }));

        let result = server
            .decode_dashboard_url(Parameters(UrlRequest { url }))
            .await
            .expect("tool call must not raise");

        assert!(!is_error(&result));
        let payload: Value =
            serde_json::from_str(&result_text(&result)).expect("payload is JSON");
        assert_eq!(payload["originalCardId"], json!(42));
        assert_eq!(payload["parameters"], json!({"limit": 10}));
    }

    #[tokio::test]
    async fn get_card_from_url_fetches_original_card() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/card/42"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": 42, "name": "Orders"})),
            )
            .mount(&mock_server)
            .await;

        let server = test_server(mock_server.uri());
        let url = link_for(json!({
            "original_card_id": 42,
            "dataset_query": {"type": "query", "query": {"breakout": [["field", 3, null]]}},
            "display": "bar"
        }));
        let result = server
            .get_card_from_url(Parameters(UrlRequest { url }))
            .await
            .expect("tool call must not raise");

        let text = result_text(&result);
        assert!(text.starts_with("Card 42 - Orders"));
        assert!(text.contains("display: bar"));
        assert!(text.contains("\"breakouts\""));
    }

    #[tokio::test]
    async fn execute_url_query_runs_decoded_query() {
        let dataset_query = json!({"type": "query", "database": 1, "query": {"source-table": 2}});
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/dataset"))
            .and(body_json(dataset_query.clone()))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "row_count": 0,
                "data": {"cols": [], "rows": []}
            })))
            .mount(&mock_server)
            .await;

        let server = test_server(mock_server.uri());
        let url = link_for(json!({"original_card_id": 3, "dataset_query": dataset_query}));
        let result = server
            .execute_url_query(Parameters(ExecuteUrlRequest { url, max_rows: None }))
            .await
            .expect("tool call must not raise");

        assert!(!is_error(&result));
        assert_eq!(result_text(&result), "Query returned no rows.");
    }

    #[tokio::test]
    async fn bad_link_is_validation_error_result() {
        let server = test_server("http://127.0.0.1:9".to_string());
        let result = server
            .get_card_from_url(Parameters(UrlRequest {
                url: "no-hash-here".to_string(),
            }))
            .await
            .expect("tool call must not raise");

        assert!(is_error(&result));
        let text = result_text(&result);
        assert!(text.contains("VALIDATION_ERROR"));
        assert!(text.contains("'url'"));
    }

    #[tokio::test]
    async fn create_card_posts_native_card() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/card"))
            .and(body_json(json!({
                "name": "Daily orders",
                "dataset_query": {
                    "database": 1,
                    "type": "native",
                    "native": {"query": "SELECT * FROM orders", "template-tags": {}}
                },
                "display": "table",
                "visualization_settings": {},
                "collection_id": 5
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": 77, "name": "Daily orders"})),
            )
            .mount(&mock_server)
            .await;

        let server = test_server(mock_server.uri());
        let result = server
            .create_card(Parameters(CreateCardRequest {
                name: "Daily orders".to_string(),
                database_id: 1,
                query: "SELECT * FROM orders".to_string(),
                display: None,
                collection_id: Some(5),
                description: None,
            }))
            .await
            .expect("tool call must not raise");

        assert!(!is_error(&result));
        assert!(result_text(&result).starts_with("Created card 77 - Daily orders"));
    }

    #[tokio::test]
    async fn update_card_requires_a_field() {
        let server = test_server("http://127.0.0.1:9".to_string());
        let result = server
            .update_card(Parameters(UpdateCardRequest {
                card_id: 3,
                name: None,
                description: None,
                query: None,
                database_id: None,
                display: None,
                collection_id: None,
            }))
            .await
            .expect("tool call must not raise");

        assert!(is_error(&result));
        assert!(result_text(&result).contains("'fields'"));
    }

    #[tokio::test]
    async fn dashboard_cards_are_listed_with_positions() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/dashboard/4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 4,
                "name": "Sales",
                "dashcards": [
                    {"card_id": 9, "card": {"name": "Revenue"}, "row": 0, "col": 4, "size_x": 6, "size_y": 3}
                ]
            })))
            .mount(&mock_server)
            .await;

        let server = test_server(mock_server.uri());
        let result = server
            .get_dashboard_cards(Parameters(DashboardIdRequest { dashboard_id: 4 }))
            .await
            .expect("tool call must not raise");

        assert!(result_text(&result).contains("- [9] Revenue at row 0, col 4 (6x3)"));
    }
}
