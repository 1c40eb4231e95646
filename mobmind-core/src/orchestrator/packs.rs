//! Pack grouping and coordinated inference.
//!
//! A request joins the pack of its leader when the graph reports one. Packs
//! need at least two members in the same batch; everything else, including
//! requests whose membership lookup failed, takes the solo path.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::{debug, warn};

use super::{BatchOrchestrator, with_timeout};
use crate::engine::PackMonster;
use crate::error::{Error, Result};
use crate::fallback::FallbackLevel;
use crate::graph::{PackRole, TeamMembership};
use crate::types::{
    ActionType, COORDINATED_CONFIDENCE, InferenceRequest, InferenceResponse, UNCOORDINATED_CONFIDENCE,
};

/// Hops searched when counting threats against a pack leader
const THREAT_RADIUS: u32 = 2;

/// Where one request of a batch is processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackAssignment {
    Solo,
    Pack { pack_id: i64 },
}

impl PackAssignment {
    /// Assignment implied by a membership lookup. The leader id names the
    /// pack; a pack member without one keys the pack on its own id.
    pub fn from_membership(monster_id: i64, membership: Option<&TeamMembership>) -> Self {
        match membership {
            None => PackAssignment::Solo,
            Some(m) if m.role == PackRole::Independent => PackAssignment::Solo,
            Some(m) => PackAssignment::Pack {
                pack_id: m.leader_id.unwrap_or(monster_id),
            },
        }
    }
}

/// Turn packs with fewer than two members in this batch into solo requests
pub(crate) fn dissolve_small_packs(assignments: &mut [PackAssignment]) {
    let mut sizes: HashMap<i64, usize> = HashMap::new();
    for assignment in assignments.iter() {
        if let PackAssignment::Pack { pack_id } = assignment {
            *sizes.entry(*pack_id).or_default() += 1;
        }
    }

    for assignment in assignments.iter_mut() {
        if let PackAssignment::Pack { pack_id } = *assignment
            && sizes.get(&pack_id).copied().unwrap_or(0) < 2
        {
            *assignment = PackAssignment::Solo;
        }
    }
}

impl BatchOrchestrator {
    /// One assignment per request, in input order
    pub async fn group_by_pack(&self, requests: &[InferenceRequest]) -> Vec<PackAssignment> {
        let Some(graph) = &self.graph else {
            return vec![PackAssignment::Solo; requests.len()];
        };

        let mut assignments = Vec::with_capacity(requests.len());
        for request in requests {
            let assignment = match with_timeout(
                self.timeout,
                "graph.team_membership",
                graph.team_membership(request.monster_id),
            )
            .await
            {
                Ok(membership) => PackAssignment::from_membership(request.monster_id, membership.as_ref()),
                Err(e) => {
                    warn!(monster_id = request.monster_id, error = %e, "Membership lookup failed, processing solo");
                    PackAssignment::Solo
                }
            };
            assignments.push(assignment);
        }

        dissolve_small_packs(&mut assignments);
        assignments
    }

    /// Answer a batch, coordinating packs where possible.
    ///
    /// Degrades to [`process_batch`](Self::process_batch) when the engine
    /// cannot coordinate, graph coordination is off, or the fallback level
    /// skips model inference. A failed pack is retried on the solo path.
    pub async fn process_batch_with_coordination(
        &self,
        requests: &[InferenceRequest],
    ) -> Vec<InferenceResponse> {
        if !self.engine.supports_coordination()
            || !self.config.graph.coordination_enabled()
            || self.graph.is_none()
            || self.fallback.should_use_fallback_action()
        {
            debug!(count = requests.len(), "Coordination unavailable, processing batch solo");
            return self.process_batch(requests).await;
        }

        let start = Instant::now();
        let level = self.fallback.current_level();
        let assignments = self.group_by_pack(requests).await;

        let mut packs: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        let mut solo: Vec<usize> = Vec::new();
        for (idx, assignment) in assignments.iter().enumerate() {
            match assignment {
                PackAssignment::Pack { pack_id } => packs.entry(*pack_id).or_default().push(idx),
                PackAssignment::Solo => solo.push(idx),
            }
        }

        let mut responses: Vec<Option<InferenceResponse>> = vec![None; requests.len()];
        for (pack_id, indices) in &packs {
            let members: Vec<&InferenceRequest> = indices.iter().map(|&i| &requests[i]).collect();
            match self.coordinate_pack(*pack_id, &members, level).await {
                Ok(pack_responses) => {
                    for (idx, response) in indices.iter().zip(pack_responses) {
                        responses[*idx] = Some(response);
                    }
                }
                Err(e) => {
                    warn!(pack_id, size = indices.len(), error = %e, "Pack inference failed, processing members solo");
                    self.fallback.handle_error(&e, "pack inference");
                    solo.extend(indices);
                }
            }
        }

        if !solo.is_empty() {
            solo.sort_unstable();
            let batch: Vec<&InferenceRequest> = solo.iter().map(|&i| &requests[i]).collect();
            for (idx, response) in solo.iter().zip(self.solo_responses(&batch).await) {
                responses[*idx] = Some(response);
            }
        }

        let per_request_ms = start.elapsed().as_secs_f64() * 1000.0 / requests.len().max(1) as f64;
        debug!(
            packs = packs.len(),
            solo = solo.len(),
            per_request_ms,
            "Coordinated batch processed"
        );

        responses
            .into_iter()
            .flatten()
            .map(|mut response| {
                response.inference_latency_ms.get_or_insert(per_request_ms);
                response
            })
            .collect()
    }

    async fn coordinate_pack(
        &self,
        pack_id: i64,
        members: &[&InferenceRequest],
        level: FallbackLevel,
    ) -> Result<Vec<InferenceResponse>> {
        let monsters: Vec<PackMonster> = members.iter().map(|r| PackMonster::from(*r)).collect();
        let start = Instant::now();
        let actions = with_timeout(
            self.timeout,
            "engine.infer_pack",
            self.engine.infer_pack(
                pack_id,
                &monsters,
                self.config.pack_coordination.coordination_threshold,
            ),
        )
        .await?;

        if actions.len() != members.len() {
            return Err(Error::Inference(format!(
                "engine returned {} actions for pack of {}",
                actions.len(),
                members.len()
            )));
        }
        self.report_latency(start.elapsed().as_secs_f64() * 1000.0 / members.len() as f64);

        let threat_count = self.threat_count(pack_id).await;
        self.push_spatial(members).await;

        let pack_size = members.len();
        let responses = members
            .iter()
            .zip(actions)
            .map(|(request, action)| {
                let (action_type, confidence) = if action.coordinated {
                    (ActionType::Coordinated, COORDINATED_CONFIDENCE)
                } else {
                    (ActionType::Combat, UNCOORDINATED_CONFIDENCE)
                };

                let mut response = InferenceResponse::for_request(
                    request,
                    action_type,
                    action.action_id,
                    confidence,
                    level.value(),
                )
                .with_output("pack_role", action.pack_role.as_str())
                .with_output("coordinated", action.coordinated);
                if let Some(count) = threat_count {
                    response
                        .model_outputs
                        .insert("threat_count".to_string(), Value::from(count));
                }
                response.pack_id = Some(pack_id);
                response.pack_size = Some(pack_size);
                response.coordination_bonus = Some(action.coordination_bonus);
                response.coordination_action = action.coordination_action;
                response
            })
            .collect();

        Ok(responses)
    }

    async fn threat_count(&self, pack_id: i64) -> Option<usize> {
        if !self.config.graph.threat_tracking_enabled() {
            return None;
        }
        let graph = self.graph.as_ref()?;
        match with_timeout(
            self.timeout,
            "graph.threat_network",
            graph.threat_network(pack_id, THREAT_RADIUS),
        )
        .await
        {
            Ok(edges) => Some(edges.len()),
            Err(e) => {
                debug!(pack_id, error = %e, "Threat lookup failed");
                None
            }
        }
    }
}
