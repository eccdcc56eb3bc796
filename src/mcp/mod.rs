//! MCP server implementation for vaultgraph.
//!
//! Exposes the search modes of an opened [`Vault`] as MCP tools for AI editors.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::{
    ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult, Content, ErrorCode, ErrorData as McpError, ServerCapabilities, ServerInfo,
    },
    schemars, tool, tool_handler, tool_router,
    transport::stdio,
};
use serde::Deserialize;
use tracing::info;

use crate::commands::{self, Vault};
use crate::corpus::ContentType;
use crate::search::{SearchError, SearchOptions, SearchResponse};
use crate::storage::{SearchFilters, TagMatch};

/// Filters accepted by every search tool.
#[derive(Debug, Default, Deserialize, schemars::JsonSchema)]
pub struct FilterParams {
    #[schemars(description = "Content type: note, moc, conversation or reference")]
    pub content_type: Option<String>,
    #[schemars(description = "Only chunks under this folder (e.g., 'projects')")]
    pub folder: Option<String>,
    #[schemars(description = "Comma-separated tags")]
    pub tags: Option<String>,
    #[schemars(description = "Require every tag instead of any (default: false)")]
    pub match_all_tags: Option<bool>,
    #[schemars(description = "Only chunks with (true) or without (false) wikilinks")]
    pub has_wikilinks: Option<bool>,
    #[schemars(description = "Drop hits scoring below this similarity (-1 to 1)")]
    pub min_similarity: Option<f32>,
}

/// Parameters for `search_vault` and `search_conversations`.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SearchParams {
    #[schemars(description = "The search query")]
    pub query: String,
    #[schemars(description = "Maximum number of results (default from config)")]
    pub limit: Option<usize>,
    #[serde(flatten)]
    pub filters: FilterParams,
}

/// Parameters for `search_by_tag`.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct TagParams {
    #[schemars(description = "Tag to look up, with or without '#'")]
    pub tag: String,
    #[schemars(description = "Maximum number of results (default from config)")]
    pub limit: Option<usize>,
    #[serde(flatten)]
    pub filters: FilterParams,
}

/// Parameters for `search_mocs`.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct MocParams {
    #[schemars(description = "Optional query; without one MOCs are ranked by inbound links")]
    pub query: Option<String>,
    #[schemars(description = "Maximum number of results (default from config)")]
    pub limit: Option<usize>,
    #[serde(flatten)]
    pub filters: FilterParams,
}

/// Parameters for `find_related_notes` and `get_file_chunks`.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct FileParams {
    #[schemars(description = "Vault-relative file path (e.g., 'notes/acme.md')")]
    pub file: String,
    #[schemars(description = "Maximum number of results (default from config)")]
    pub limit: Option<usize>,
    #[serde(flatten)]
    pub filters: FilterParams,
}

/// Parameters for `explore_knowledge_cluster`.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ExploreParams {
    #[schemars(description = "Concept or entity name to explore")]
    pub concept: String,
    #[schemars(description = "Maximum number of results (default from config)")]
    pub limit: Option<usize>,
    #[serde(flatten)]
    pub filters: FilterParams,
}

/// Parameters for `vault_stats`.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct StatsParams {
    #[schemars(description = "Return JSON instead of text (default: false)")]
    pub json: Option<bool>,
}

impl FilterParams {
    fn into_options(self, limit: Option<usize>) -> Result<SearchOptions, McpError> {
        let content_type = self
            .content_type
            .as_deref()
            .map(str::parse::<ContentType>)
            .transpose()
            .map_err(|e| invalid_params(e.to_string()))?;
        let tag_match = if self.match_all_tags.unwrap_or(false) {
            TagMatch::All
        } else {
            TagMatch::Any
        };

        Ok(SearchOptions {
            limit,
            filters: SearchFilters {
                content_type,
                folder_prefix: self.folder,
                tags: commands::parse_tags(self.tags),
                tag_match,
                has_wikilinks: self.has_wikilinks,
                min_similarity: self.min_similarity,
                ..SearchFilters::default()
            },
            ..SearchOptions::default()
        })
    }
}

fn invalid_params(message: String) -> McpError {
    McpError {
        code: ErrorCode::INVALID_PARAMS,
        message: Cow::from(message),
        data: None,
    }
}

fn search_failed(err: &SearchError) -> McpError {
    match err {
        SearchError::InvalidInput(message) => invalid_params(message.clone()),
        other => McpError {
            code: ErrorCode::INTERNAL_ERROR,
            message: Cow::from(format!("Search failed: {other}")),
            data: None,
        },
    }
}

fn reply(subject: &str, result: Result<SearchResponse, SearchError>) -> Result<CallToolResult, McpError> {
    let response = result.map_err(|e| search_failed(&e))?;
    Ok(CallToolResult::success(vec![Content::text(
        commands::format_response(subject, &response),
    )]))
}

/// MCP server exposing vaultgraph tools.
#[derive(Clone)]
pub struct VaultgraphServer {
    vault: Arc<Vault>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl VaultgraphServer {
    #[must_use]
    pub fn new(vault: Arc<Vault>) -> Self {
        Self {
            vault,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Semantic search across the vault, with highlights, related notes and graph context")]
    async fn search_vault(
        &self,
        Parameters(params): Parameters<SearchParams>,
    ) -> Result<CallToolResult, McpError> {
        commands::validate_query(&params.query).map_err(|e| invalid_params(e.to_string()))?;
        let options = params.filters.into_options(params.limit)?;
        reply(
            &params.query,
            self.vault.search().search(&params.query, &options).await,
        )
    }

    #[tool(description = "List chunks carrying a tag, most recently modified first")]
    async fn search_by_tag(
        &self,
        Parameters(params): Parameters<TagParams>,
    ) -> Result<CallToolResult, McpError> {
        let options = params.filters.into_options(params.limit)?;
        reply(
            &params.tag,
            self.vault.search().search_by_tag(&params.tag, &options).await,
        )
    }

    #[tool(description = "Find maps of content, optionally ranked against a query")]
    async fn search_mocs(
        &self,
        Parameters(params): Parameters<MocParams>,
    ) -> Result<CallToolResult, McpError> {
        let options = params.filters.into_options(params.limit)?;
        let query = params.query.as_deref();
        reply(
            query.unwrap_or("maps of content"),
            self.vault.search().search_mocs(query, &options).await,
        )
    }

    #[tool(description = "Semantic search restricted to conversation logs")]
    async fn search_conversations(
        &self,
        Parameters(params): Parameters<SearchParams>,
    ) -> Result<CallToolResult, McpError> {
        commands::validate_query(&params.query).map_err(|e| invalid_params(e.to_string()))?;
        let options = params.filters.into_options(params.limit)?;
        reply(
            &params.query,
            self.vault
                .search()
                .search_conversations(&params.query, &options)
                .await,
        )
    }

    #[tool(description = "Find notes related to a file by shared links and similarity")]
    async fn find_related_notes(
        &self,
        Parameters(params): Parameters<FileParams>,
    ) -> Result<CallToolResult, McpError> {
        let options = params.filters.into_options(params.limit)?;
        reply(
            &params.file,
            self.vault
                .search()
                .find_related_notes(&params.file, &options)
                .await,
        )
    }

    #[tool(description = "Explore the knowledge cluster around a concept or entity")]
    async fn explore_knowledge_cluster(
        &self,
        Parameters(params): Parameters<ExploreParams>,
    ) -> Result<CallToolResult, McpError> {
        let options = params.filters.into_options(params.limit)?;
        reply(
            &params.concept,
            self.vault
                .search()
                .explore_knowledge_cluster(&params.concept, &options)
                .await,
        )
    }

    #[tool(description = "Get every chunk of a file in order")]
    async fn get_file_chunks(
        &self,
        Parameters(params): Parameters<FileParams>,
    ) -> Result<CallToolResult, McpError> {
        let options = params.filters.into_options(params.limit)?;
        reply(
            &params.file,
            self.vault
                .search()
                .get_file_chunks(&params.file, &options)
                .await,
        )
    }

    #[tool(description = "Counts of chunks, files, content types, folders and tags")]
    async fn vault_stats(
        &self,
        Parameters(params): Parameters<StatsParams>,
    ) -> Result<CallToolResult, McpError> {
        let stats = self
            .vault
            .search()
            .stats()
            .await
            .map_err(|e| search_failed(&e))?;

        let output = if params.json.unwrap_or(false) {
            commands::to_json(&stats).map_err(|e| McpError {
                code: ErrorCode::INTERNAL_ERROR,
                message: Cow::from(e.to_string()),
                data: None,
            })?
        } else {
            commands::format_stats(&stats)
        };
        Ok(CallToolResult::success(vec![Content::text(output)]))
    }
}

#[tool_handler]
impl ServerHandler for VaultgraphServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "vaultgraph provides semantic search over a note vault. \
                Use search_vault for general questions, search_by_tag, search_mocs and \
                search_conversations for specific note kinds, find_related_notes and \
                get_file_chunks for a known file, explore_knowledge_cluster to walk the \
                knowledge graph around a concept, and vault_stats for an overview."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

/// Start the MCP server with stdio transport.
///
/// # Errors
///
/// Returns an error if the server fails to start or encounters a fatal error.
pub async fn serve(vault: Vault) -> anyhow::Result<()> {
    let server = VaultgraphServer::new(Arc::new(vault));
    info!("Serving MCP over stdio");
    let service = server.serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}
