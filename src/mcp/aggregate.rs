//! Multi-server client with deterministic catalog merging and routing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use tokio::sync::RwLock;

use super::channel::{MCPChannel, ToolCallResult, ToolChannel};
use super::schema::ToolDescriptor;
use crate::config::{ClientSettings, RejectedServer, ServerConfig, ToolMeshConfig};
use crate::error::{Result, ToolMeshError};
use crate::util::timeout::{with_deadline, Deadline};

/// Tool naming policy used while merging catalogs across servers.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CollisionPolicy {
    /// Unique names as-is; colliding names become `<server>__<tool>` for every owner.
    #[default]
    PrefixOnCollision,
    /// Always expose `<server>__<tool>`.
    Namespace,
    /// The first server in configuration order keeps the bare name.
    FirstWins,
    /// Any collision fails the merge.
    Reject,
}

/// One exposed tool and the descriptor it routes to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub exposed_name: String,
    pub descriptor: ToolDescriptor,
}

impl CatalogEntry {
    pub fn server_id(&self) -> &str {
        &self.descriptor.server_id
    }

    /// Name the owning server knows the tool by.
    pub fn upstream_name(&self) -> &str {
        &self.descriptor.name
    }
}

/// A tool left out of the catalog because another server owns its name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShadowedTool {
    pub server_id: String,
    pub tool_name: String,
    /// Server that owns the exposed name instead.
    pub owner: String,
}

/// Immutable merged catalog snapshot. Every exposed name has exactly one owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergedCatalog {
    entries: BTreeMap<String, CatalogEntry>,
    shadowed: Vec<ShadowedTool>,
}

impl MergedCatalog {
    pub fn get(&self, exposed_name: &str) -> Option<&CatalogEntry> {
        self.entries.get(exposed_name)
    }

    pub fn owner(&self, exposed_name: &str) -> Option<&str> {
        self.get(exposed_name).map(CatalogEntry::server_id)
    }

    /// Entries ordered by exposed name.
    pub fn tools(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn shadowed(&self) -> &[ShadowedTool] {
        &self.shadowed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn namespaced(server_id: &str, tool_name: &str) -> String {
    format!("{server_id}__{tool_name}")
}

/// Merge per-server catalogs, given in configuration order.
pub fn merge_catalogs(
    catalogs: Vec<(String, Vec<ToolDescriptor>)>,
    policy: CollisionPolicy,
) -> Result<MergedCatalog> {
    let mut owners: HashMap<String, Vec<String>> = HashMap::new();
    for (server_id, tools) in &catalogs {
        for tool in tools {
            owners
                .entry(tool.name.clone())
                .or_default()
                .push(server_id.clone());
        }
    }

    if policy == CollisionPolicy::Reject {
        let mut collisions: Vec<String> = owners
            .iter()
            .filter(|(_, servers)| servers.len() > 1)
            .map(|(name, servers)| format!("'{name}' ({})", servers.join(", ")))
            .collect();
        if !collisions.is_empty() {
            collisions.sort();
            return Err(ToolMeshError::Aggregation(format!(
                "tool name collision: {}",
                collisions.join("; ")
            )));
        }
    }

    let mut merged = MergedCatalog::default();
    for (server_id, tools) in catalogs {
        for descriptor in tools {
            let collides = owners.get(&descriptor.name).is_some_and(|servers| servers.len() > 1);
            let exposed_name = match policy {
                CollisionPolicy::Namespace => namespaced(&server_id, &descriptor.name),
                CollisionPolicy::PrefixOnCollision if collides => {
                    namespaced(&server_id, &descriptor.name)
                }
                _ => descriptor.name.clone(),
            };

            if let Some(existing) = merged.entries.get(&exposed_name) {
                if policy == CollisionPolicy::Reject {
                    return Err(ToolMeshError::Aggregation(format!(
                        "exposed name '{exposed_name}' is claimed by '{}' and '{server_id}'",
                        existing.server_id()
                    )));
                }
                tracing::warn!(
                    server = %server_id,
                    tool = %descriptor.name,
                    owner = %existing.server_id(),
                    "tool shadowed by another server"
                );
                merged.shadowed.push(ShadowedTool {
                    server_id: server_id.clone(),
                    tool_name: descriptor.name,
                    owner: existing.server_id().to_owned(),
                });
                continue;
            }

            merged.entries.insert(
                exposed_name.clone(),
                CatalogEntry {
                    exposed_name,
                    descriptor,
                },
            );
        }
    }
    Ok(merged)
}

/// Per-server health as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ServerStatus {
    Live,
    Degraded { reason: String },
    Closed,
}

/// Opens channels for server entries.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open(&self, config: ServerConfig, deadline: Deadline) -> Result<Arc<dyn ToolChannel>>;
}

/// Opens the transport selected by each entry's configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportOpener;

#[async_trait]
impl ChannelOpener for TransportOpener {
    async fn open(&self, config: ServerConfig, deadline: Deadline) -> Result<Arc<dyn ToolChannel>> {
        let channel = MCPChannel::open(config, deadline).await?;
        Ok(Arc::new(channel))
    }
}

struct ServerSlot {
    id: String,
    required: bool,
    channel: Option<Arc<dyn ToolChannel>>,
    status: StdMutex<ServerStatus>,
}

impl ServerSlot {
    fn status(&self) -> ServerStatus {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_status(&self, status: ServerStatus) {
        *self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = status;
    }
}

/// Owns every channel and routes calls by exposed tool name.
pub struct MultiServerClient {
    slots: Vec<ServerSlot>,
    index: HashMap<String, usize>,
    settings: ClientSettings,
    catalog: RwLock<Arc<MergedCatalog>>,
    stale: AtomicBool,
    shut_down: AtomicBool,
}

impl MultiServerClient {
    /// Open every configured server through its transport.
    pub async fn initialize(config: &ToolMeshConfig) -> Result<Self> {
        Self::initialize_with(
            config.servers.clone(),
            config.rejected.clone(),
            config.client.clone(),
            &TransportOpener,
        )
        .await
    }

    /// Open `servers` concurrently, bounded by the init deadline.
    ///
    /// Optional servers that fail (or were `rejected` while parsing) are kept
    /// as degraded; a failing required server fails the whole call.
    pub async fn initialize_with(
        servers: Vec<ServerConfig>,
        rejected: Vec<RejectedServer>,
        settings: ClientSettings,
        opener: &dyn ChannelOpener,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for id in servers.iter().map(|s| &s.id).chain(rejected.iter().map(|r| &r.id)) {
            if !seen.insert(id.clone()) {
                return Err(ToolMeshError::Configuration(format!(
                    "duplicate server id '{id}'"
                )));
            }
        }
        if let Some(bad) = rejected.iter().find(|r| r.required) {
            return Err(ToolMeshError::Configuration(format!(
                "required server '{}' is misconfigured: {}",
                bad.id, bad.reason
            )));
        }

        let deadline = Deadline::after(settings.init_timeout());
        let opens = servers.into_iter().map(|config| async move {
            let id = config.id.clone();
            let required = config.required;
            let result = with_deadline(deadline, opener.open(config, deadline)).await;
            (id, required, result)
        });
        let results = join_all(opens).await;

        let mut slots = Vec::with_capacity(results.len() + rejected.len());
        let mut required_failure = None;
        for (id, required, result) in results {
            match result {
                Ok(channel) => slots.push(ServerSlot {
                    id,
                    required,
                    channel: Some(channel),
                    status: StdMutex::new(ServerStatus::Live),
                }),
                Err(error) if required => {
                    tracing::error!(server = %id, error = %error, "required server failed to initialize");
                    required_failure.get_or_insert(error);
                }
                Err(error) => {
                    tracing::warn!(server = %id, error = %error, "server degraded during initialize");
                    slots.push(ServerSlot {
                        id,
                        required,
                        channel: None,
                        status: StdMutex::new(ServerStatus::Degraded {
                            reason: error.to_string(),
                        }),
                    });
                }
            }
        }

        if let Some(error) = required_failure {
            close_all(&slots, Deadline::after(settings.shutdown_timeout())).await;
            return Err(error);
        }

        for entry in rejected {
            tracing::warn!(server = %entry.id, reason = %entry.reason, "server rejected by configuration");
            slots.push(ServerSlot {
                id: entry.id,
                required: false,
                channel: None,
                status: StdMutex::new(ServerStatus::Degraded {
                    reason: entry.reason,
                }),
            });
        }

        if !slots.iter().any(|slot| slot.channel.is_some()) {
            let causes: Vec<String> = slots
                .iter()
                .map(|slot| match slot.status() {
                    ServerStatus::Degraded { reason } => format!("{}: {reason}", slot.id),
                    _ => slot.id.clone(),
                })
                .collect();
            return Err(ToolMeshError::Aggregation(if causes.is_empty() {
                "no tool servers configured".to_owned()
            } else {
                format!("no tool server could be initialized ({})", causes.join("; "))
            }));
        }

        tracing::info!(
            live = slots.iter().filter(|slot| slot.channel.is_some()).count(),
            degraded = slots.iter().filter(|slot| slot.channel.is_none()).count(),
            "multi-server client initialized"
        );
        Ok(Self::from_slots(slots, settings))
    }

    /// Build a client over already-open channels.
    pub fn from_channels(channels: Vec<Arc<dyn ToolChannel>>, settings: ClientSettings) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut slots = Vec::with_capacity(channels.len());
        for channel in channels {
            let id = channel.server_id().to_owned();
            if !seen.insert(id.clone()) {
                return Err(ToolMeshError::Configuration(format!(
                    "duplicate server id '{id}'"
                )));
            }
            slots.push(ServerSlot {
                id,
                required: false,
                channel: Some(channel),
                status: StdMutex::new(ServerStatus::Live),
            });
        }
        Ok(Self::from_slots(slots, settings))
    }

    fn from_slots(slots: Vec<ServerSlot>, settings: ClientSettings) -> Self {
        let index = slots
            .iter()
            .enumerate()
            .map(|(position, slot)| (slot.id.clone(), position))
            .collect();
        Self {
            slots,
            index,
            settings,
            catalog: RwLock::new(Arc::new(MergedCatalog::default())),
            stale: AtomicBool::new(true),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Deadline for a call made without an explicit one.
    pub fn default_call_deadline(&self) -> Deadline {
        Deadline::after(self.settings.call_timeout())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ToolMeshError::InvalidState("client has been shut down".into()));
        }
        Ok(())
    }

    /// Refresh every live channel's catalog and swap in the merged snapshot.
    pub async fn get_tools(&self) -> Result<Arc<MergedCatalog>> {
        self.ensure_running()?;
        let deadline = Deadline::after(self.settings.catalog_timeout());

        let fetches = self.slots.iter().filter_map(|slot| {
            let channel = slot.channel.as_ref()?;
            if slot.status() == ServerStatus::Closed {
                return None;
            }
            Some(async move {
                let result = with_deadline(deadline, channel.list_tools(deadline)).await;
                (slot, result)
            })
        });
        let results = join_all(fetches).await;

        let mut catalogs = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (slot, result) in results {
            match result {
                Ok(tools) => {
                    if slot.status() != ServerStatus::Live {
                        tracing::info!(server = %slot.id, "server recovered");
                    }
                    slot.set_status(ServerStatus::Live);
                    catalogs.push((slot.id.clone(), tools));
                }
                Err(error) => {
                    tracing::warn!(server = %slot.id, error = %error, "catalog fetch failed, server degraded");
                    failures.push(format!("{}: {error}", slot.id));
                    slot.set_status(ServerStatus::Degraded {
                        reason: error.to_string(),
                    });
                }
            }
        }

        if catalogs.is_empty() {
            return Err(ToolMeshError::Aggregation(if failures.is_empty() {
                "no live tool servers".to_owned()
            } else {
                format!("no server yielded a usable catalog ({})", failures.join("; "))
            }));
        }

        let servers = catalogs.len();
        let merged = Arc::new(merge_catalogs(catalogs, self.settings.collision_policy)?);
        *self.catalog.write().await = Arc::clone(&merged);
        self.stale.store(false, Ordering::SeqCst);

        tracing::info!(
            tools = merged.len(),
            servers,
            shadowed = merged.shadowed().len(),
            "catalog refreshed"
        );
        Ok(merged)
    }

    /// The current snapshot, refreshing first if it is stale.
    pub async fn catalog(&self) -> Result<Arc<MergedCatalog>> {
        if self.stale.load(Ordering::SeqCst) {
            return self.get_tools().await;
        }
        Ok(self.current_catalog().await)
    }

    /// Last stored snapshot, without I/O.
    pub async fn current_catalog(&self) -> Arc<MergedCatalog> {
        Arc::clone(&*self.catalog.read().await)
    }

    /// Mark the snapshot stale so the next [`catalog`](Self::catalog) re-fetches.
    pub fn invalidate_catalog(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    /// Route a call by exposed name through the most recent catalog.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        deadline: Deadline,
    ) -> Result<ToolCallResult> {
        self.ensure_running()?;
        let catalog = self.current_catalog().await;
        let entry = catalog
            .get(name)
            .ok_or_else(|| ToolMeshError::UnknownTool(name.to_owned()))?;

        let channel = self
            .index
            .get(entry.server_id())
            .and_then(|&position| self.slots[position].channel.as_ref())
            .ok_or_else(|| {
                ToolMeshError::InvalidState(format!(
                    "catalog routes '{name}' to missing server '{}'",
                    entry.server_id()
                ))
            })?;

        let mut result = channel.call(entry.upstream_name(), arguments, deadline).await;
        result.tool_name = name.to_owned();
        Ok(result)
    }

    /// Close every channel concurrently, returning the failures.
    ///
    /// Bounded by the shutdown timeout; a channel that does not close in time
    /// is reported as a [`ToolMeshError::Timeout`] failure.
    pub async fn shutdown(&self) -> Vec<(String, ToolMeshError)> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        let deadline = Deadline::after(self.settings.shutdown_timeout());
        let failures = close_all(&self.slots, deadline).await;
        tracing::info!(failures = failures.len(), "multi-server client shut down");
        failures
    }

    /// Status of every known server, in configuration order.
    pub fn server_statuses(&self) -> Vec<(String, ServerStatus)> {
        self.slots
            .iter()
            .map(|slot| (slot.id.clone(), slot.status()))
            .collect()
    }

    pub fn is_required(&self, server_id: &str) -> bool {
        self.index
            .get(server_id)
            .is_some_and(|&position| self.slots[position].required)
    }
}

async fn close_all(slots: &[ServerSlot], deadline: Deadline) -> Vec<(String, ToolMeshError)> {
    let closes = slots.iter().filter_map(|slot| {
        let channel = slot.channel.as_ref()?;
        Some(async move {
            let result = with_deadline(deadline, channel.close(deadline)).await;
            slot.set_status(ServerStatus::Closed);
            (slot.id.clone(), result)
        })
    });
    join_all(closes)
        .await
        .into_iter()
        .filter_map(|(id, result)| {
            result.err().map(|error| {
                tracing::warn!(server = %id, error = %error, "channel close failed");
                (id, error)
            })
        })
        .collect()
}
