//! Ring formation registry, active on the master node only. Collects
//! joining node descriptors until the configured cluster size is reached,
//! then freezes the sorted ring view for the lifetime of the process.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::ring::{NodeDesc, NodeId, RingView};
use crate::utils::LeaseKvError;

/// Registration outcome returned to a joining node.
#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) enum RegisterOutcome {
    /// Not all nodes have joined yet; the caller should retry later.
    NotReady,

    /// The ring is complete; here is the frozen view.
    Complete(RingView),
}

/// Collects registrations and publishes the immutable ring view.
pub(crate) struct RingRegistry {
    /// My node ID (logging prefix).
    me: NodeId,

    /// Expected cluster size, including the master itself.
    expected: usize,

    /// Mutable formation state; replaced by the frozen view when full.
    state: Mutex<FormationState>,
}

#[derive(Debug)]
enum FormationState {
    /// Still collecting; sorted by node ID as registrations arrive.
    Forming(BTreeMap<NodeId, NodeDesc>),

    /// Frozen forever.
    Published(RingView),
}

impl RingRegistry {
    /// Creates a registry expecting `expected` members in total.
    pub(crate) fn new(
        me: NodeId,
        expected: usize,
    ) -> Result<Self, LeaseKvError> {
        if expected == 0 {
            return logged_err!(me; "invalid expected cluster size 0");
        }
        Ok(RingRegistry {
            me,
            expected,
            state: Mutex::new(FormationState::Forming(BTreeMap::new())),
        })
    }

    /// Records a registration. Re-registration by the same ID is
    /// idempotent; a registration that completes the set freezes and
    /// publishes the view.
    pub(crate) fn register(
        &self,
        node: NodeDesc,
    ) -> Result<RegisterOutcome, LeaseKvError> {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            FormationState::Published(view) => {
                // late or repeated registration after publication; the
                // view is immutable, so just hand it back
                pl_debug!(self.me; "re-registration of {} after publish",
                                   node);
                Ok(RegisterOutcome::Complete(view.clone()))
            }
            FormationState::Forming(joined) => {
                if let Some(existing) = joined.get(&node.id) {
                    if existing.addr != node.addr {
                        pl_warn!(self.me;
                            "node {} re-registered with new addr {}",
                            node.id, node.addr);
                    }
                }
                joined.insert(node.id, node);
                pl_info!(self.me; "registered {} ({}/{})", node,
                                  joined.len(), self.expected);

                if joined.len() < self.expected {
                    return Ok(RegisterOutcome::NotReady);
                }
                let view = RingView::assemble(
                    joined.values().copied().collect(),
                )?;
                pl_info!(self.me; "ring complete with {} node(s)",
                                  view.len());
                *state = FormationState::Published(view.clone());
                Ok(RegisterOutcome::Complete(view))
            }
        }
    }

    /// The published view, if formation has completed.
    pub(crate) fn published(&self) -> Option<RingView> {
        match &*self.state.lock().unwrap() {
            FormationState::Published(view) => Some(view.clone()),
            FormationState::Forming(_) => None,
        }
    }
}
