use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::grpc::ResourceClient;
use crate::tool::Tool;

/// `Pending -> Running -> {Paused, Quit}`, `Paused -> Running`. A `Quit`
/// resource is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceStatus {
    Pending,
    Running,
    Paused,
    Quit,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceStatus::Pending => write!(f, "pending"),
            ResourceStatus::Running => write!(f, "running"),
            ResourceStatus::Paused => write!(f, "paused"),
            ResourceStatus::Quit => write!(f, "quit"),
        }
    }
}

/// One worker as seen by the queue.
#[derive(Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    /// System name of the manager that owns this resource.
    pub manager: String,
    /// Manager-specific settings.
    pub parameters: BTreeMap<String, String>,
    pub status: ResourceStatus,
    /// Hardware tag -> slot free.
    pub hardware: BTreeMap<String, bool>,
    /// Canonical tool id -> tool carrying the id local to this resource.
    pub tools: BTreeMap<Uuid, Tool>,
    #[serde(skip)]
    client: Option<Arc<dyn ResourceClient>>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("status", &self.status)
            .field("hardware", &self.hardware)
            .field("tools", &self.tools.len())
            .field("connected", &self.client.is_some())
            .finish()
    }
}

impl Resource {
    pub fn new(name: impl Into<String>, manager: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            address: String::new(),
            manager: manager.into(),
            parameters: BTreeMap::new(),
            status: ResourceStatus::Pending,
            hardware: BTreeMap::new(),
            tools: BTreeMap::new(),
            client: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub(crate) fn client(&self) -> Result<Arc<dyn ResourceClient>> {
        self.client.clone().ok_or(QueueError::Disconnected(self.id))
    }

    pub(crate) fn set_client(&mut self, client: Arc<dyn ResourceClient>) {
        self.client = Some(client);
    }

    /// Drop the connection. The channel closes once in-flight calls finish.
    pub(crate) fn disconnect(&mut self) {
        self.client = None;
    }

    /// Find a tool by canonical id or by the id local to this resource.
    pub fn tool_for(&self, tool_id: &Uuid) -> Option<&Tool> {
        self.tools
            .get(tool_id)
            .or_else(|| self.tools.values().find(|t| t.id == *tool_id))
    }

    pub fn has_free(&self, requirement: &str) -> bool {
        self.hardware.get(requirement).copied().unwrap_or(false)
    }

    pub(crate) fn occupy(&mut self, requirement: &str) {
        if let Some(slot) = self.hardware.get_mut(requirement) {
            *slot = false;
        }
    }

    pub(crate) fn release(&mut self, requirement: &str) {
        if let Some(slot) = self.hardware.get_mut(requirement) {
            *slot = true;
        }
    }

    /// Free the slot used by `tool_id`, if the tool is still known.
    pub(crate) fn release_for_tool(&mut self, tool_id: &Uuid) {
        if let Some(requirement) = self.tool_for(tool_id).map(|t| t.requirement.clone()) {
            self.release(&requirement);
        }
    }

    /// Mark the resource gone for good: no client, no tools, no free hardware.
    pub(crate) fn retire(&mut self) {
        self.client = None;
        self.address = "closed".to_string();
        self.status = ResourceStatus::Quit;
        self.tools.clear();
        for slot in self.hardware.values_mut() {
            *slot = false;
        }
    }
}

/// Pick the id a newly reported tool is filed under.
///
/// A tool equal to one already known elsewhere (ignoring ids) joins that
/// tool's canonical id; otherwise its own id becomes canonical.
pub fn canonicalize<'a>(
    tool: &Tool,
    known: impl IntoIterator<Item = (&'a Uuid, &'a Tool)>,
) -> Uuid {
    known
        .into_iter()
        .find(|(_, existing)| existing.same_capability(tool))
        .map(|(canonical, _)| *canonical)
        .unwrap_or(tool.id)
}

/// All resources known to the queue, including retired ones.
#[derive(Debug, Clone, Default)]
pub struct ResourcePool {
    resources: BTreeMap<Uuid, Resource>,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_resources(resources: BTreeMap<Uuid, Resource>) -> Self {
        Self { resources }
    }

    pub fn insert(&mut self, resource: Resource) {
        self.resources.insert(resource.id, resource);
    }

    pub fn get(&self, id: &Uuid) -> Option<&Resource> {
        self.resources.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Resource> {
        self.resources.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Resource> {
        self.resources.values_mut()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.resources.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.resources.clear();
    }

    pub fn name_in_use(&self, name: &str) -> bool {
        self.resources
            .values()
            .any(|r| r.name == name && r.status != ResourceStatus::Quit)
    }

    /// Store the tools reported by `resource_id`, filing each under its
    /// canonical id.
    pub fn load_tools(&mut self, resource_id: &Uuid, reported: Vec<Tool>) -> Result<()> {
        let mut filed: BTreeMap<Uuid, Tool> = BTreeMap::new();
        for tool in reported {
            let canonical = {
                let others = self
                    .resources
                    .values()
                    .filter(|r| r.id != *resource_id)
                    .flat_map(|r| r.tools.iter());
                canonicalize(&tool, others)
            };
            if canonical != tool.id {
                tracing::debug!(
                    resource_id = %resource_id,
                    local_id = %tool.id,
                    canonical_id = %canonical,
                    name = %tool.name,
                    "Tool matched an existing capability"
                );
            }
            filed.insert(canonical, tool);
        }

        let resource = self
            .resources
            .get_mut(resource_id)
            .ok_or(QueueError::ResourceNotFound(*resource_id))?;
        resource.tools = filed;
        Ok(())
    }

    /// Store reported hardware with every slot free.
    pub fn load_hardware(
        &mut self,
        resource_id: &Uuid,
        reported: BTreeMap<String, bool>,
    ) -> Result<()> {
        let resource = self
            .resources
            .get_mut(resource_id)
            .ok_or(QueueError::ResourceNotFound(*resource_id))?;
        resource.hardware = reported.into_keys().map(|tag| (tag, true)).collect();
        Ok(())
    }

    /// First running resource offering `tool_id` with its slot free.
    pub fn find_free_for(&self, tool_id: &Uuid) -> Option<Uuid> {
        self.resources
            .values()
            .filter(|r| r.status == ResourceStatus::Running)
            .find(|r| {
                r.tool_for(tool_id)
                    .is_some_and(|tool| r.has_free(&tool.requirement))
            })
            .map(|r| r.id)
    }

    /// Tools offered by resources that are not retired, keyed and
    /// identified by canonical id.
    pub fn active_tools(&self) -> BTreeMap<Uuid, Tool> {
        self.collect_tools(|r| r.status != ResourceStatus::Quit)
    }

    pub fn all_tools(&self) -> BTreeMap<Uuid, Tool> {
        self.collect_tools(|_| true)
    }

    fn collect_tools(&self, keep: impl Fn(&Resource) -> bool) -> BTreeMap<Uuid, Tool> {
        let mut out = BTreeMap::new();
        for resource in self.resources.values().filter(|r| keep(r)) {
            for (canonical, tool) in &resource.tools {
                out.entry(*canonical).or_insert_with(|| Tool {
                    id: *canonical,
                    ..tool.clone()
                });
            }
        }
        out
    }

    /// Hardware tags offered by resources that are not retired.
    pub fn hardware_types(&self) -> BTreeSet<String> {
        self.resources
            .values()
            .filter(|r| r.status != ResourceStatus::Quit)
            .flat_map(|r| r.hardware.keys().cloned())
            .collect()
    }

    pub fn to_map(&self) -> BTreeMap<Uuid, Resource> {
        self.resources.clone()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
