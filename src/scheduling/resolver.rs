//! Placement resolution
//!
//! Decides the {node, pool} of a new volume in three tiers: both known
//! from the request, one known and the other asked of the scheduler, or
//! both asked of the scheduler.

use crate::domain::ports::SchedulerRef;
use crate::domain::volume::{
    attribute, keys, required_attribute, CreateVolumeRequest, PlacementDecision,
    PlacementStrategy, ScheduleQuery, TopologyRequirement, VolumeKind, DEFAULT_PMEM_REGION,
};
use crate::error::{Error, Result};
use tracing::info;

/// Node named unambiguously by topology hints
///
/// A single preferred node wins; several preferred nodes leave the node
/// open. With no preferred nodes a single requisite node is used.
pub fn pick_node(topology: &TopologyRequirement) -> Option<String> {
    match topology.preferred.as_slice() {
        [node] => Some(node.clone()),
        [] => match topology.requisite.as_slice() {
            [node] => Some(node.clone()),
            _ => None,
        },
        _ => None,
    }
}

/// Three-tier placement resolver
pub struct SchedulingResolver {
    scheduler: SchedulerRef,
}

impl SchedulingResolver {
    pub fn new(scheduler: SchedulerRef) -> Self {
        Self { scheduler }
    }

    /// Resolve the placement of `request`
    pub async fn resolve(
        &self,
        request: &CreateVolumeRequest,
        kind: &VolumeKind,
    ) -> Result<PlacementDecision> {
        let params = &request.parameters;

        let known_node = attribute(params, keys::SELECTED_NODE)
            .map(String::from)
            .or_else(|| pick_node(&request.topology));
        let known_pool = kind
            .class_pool(params)
            .or_else(|| attribute(params, keys::SELECTED_STORAGE))
            .map(String::from)
            .or_else(|| match kind {
                VolumeKind::PersistentMemory { .. } => Some(DEFAULT_PMEM_REGION.to_string()),
                _ => None,
            });

        if let (Some(node), Some(pool)) = (&known_node, &known_pool) {
            info!(
                "Volume {} pre-scheduled to node {} pool {}",
                request.name, node, pool
            );
            return Ok(PlacementDecision {
                node: node.clone(),
                pool: pool.clone(),
                strategy: PlacementStrategy::PreScheduled,
            });
        }

        let strategy = if known_node.is_some() || known_pool.is_some() {
            PlacementStrategy::PartiallyScheduled
        } else {
            PlacementStrategy::Unscheduled
        };

        let claim = required_attribute(params, keys::CLAIM_NAME)?;
        let namespace = required_attribute(params, keys::CLAIM_NAMESPACE)?;
        let query = ScheduleQuery {
            namespace: namespace.to_string(),
            claim: claim.to_string(),
            volume_type: kind.type_name().to_string(),
            node: known_node.clone(),
            pool: known_pool.clone(),
        };

        let binding = self
            .scheduler
            .schedule(&query)
            .await
            .map_err(|e| e.context("schedule", format!("{}/{}", namespace, claim)))?;

        let node = known_node
            .or_else(|| Some(binding.node.clone()).filter(|n| !n.is_empty()))
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "scheduler returned no node for {}/{}",
                    namespace, claim
                ))
            })?;
        let pool = known_pool
            .or_else(|| binding.pool_for(kind))
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "scheduler returned no {} for {}/{}",
                    kind.pool_key(),
                    namespace,
                    claim
                ))
            })?;

        info!(
            "Volume {} scheduled ({:?}) to node {} pool {}",
            request.name, strategy, node, pool
        );
        Ok(PlacementDecision {
            node,
            pool,
            strategy,
        })
    }
}

// =============================================================================
// Test Support
// =============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use crate::domain::ports::Scheduler;
    use crate::domain::volume::{BindingInfo, ScheduleQuery};
    use crate::error::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Scheduler answering with a fixed binding and recording queries
    pub struct ScriptedScheduler {
        binding: Mutex<BindingInfo>,
        queries: Mutex<Vec<ScheduleQuery>>,
    }

    impl ScriptedScheduler {
        pub fn new(node: &str, pool: &str) -> Arc<Self> {
            Arc::new(Self {
                binding: Mutex::new(BindingInfo {
                    node: node.into(),
                    pool: Some(pool.into()),
                    disk: Some(pool.into()),
                    device: Some(pool.into()),
                }),
                queries: Mutex::new(Vec::new()),
            })
        }

        /// Change the answer for later queries
        pub fn answer(&self, node: &str, pool: &str) {
            *self.binding.lock() = BindingInfo {
                node: node.into(),
                pool: Some(pool.into()),
                disk: Some(pool.into()),
                device: Some(pool.into()),
            };
        }

        pub fn queries(&self) -> Vec<ScheduleQuery> {
            self.queries.lock().clone()
        }
    }

    #[async_trait]
    impl Scheduler for ScriptedScheduler {
        async fn schedule(&self, query: &ScheduleQuery) -> Result<BindingInfo> {
            self.queries.lock().push(query.clone());
            let mut binding = self.binding.lock().clone();
            if let Some(node) = &query.node {
                binding.node = node.clone();
            }
            Ok(binding)
        }
    }
}
