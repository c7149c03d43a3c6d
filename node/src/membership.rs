//! Role state machine for a node: MASTER, DEPUTY, NORMAL or VIEWER.
//!
//! [`Membership::apply`] is a pure transition function. It updates the
//! local role and the master/deputy pointers and returns the side effects
//! the event loop must carry out, which keeps every failover path testable
//! without sockets.

use crate::error::SessionEnd;
use shared::NodeRole;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq)]
pub enum RoleEvent {
    /// The master acknowledged our join request.
    Joined { master: SocketAddr },
    /// A snapshot or role change names a different master.
    MasterAnnounced { master: SocketAddr },
    /// The master stopped acknowledging. `known_deputy` is the deputy from
    /// the latest roster, if any.
    MasterLost { known_deputy: Option<SocketAddr> },
    DeputyLost,
    /// Someone told us our new role.
    AssignedRole(NodeRole),
    DemotionRequested { exit: bool },
    DemotionConfirmed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoleAction {
    BecomeMaster,
    FollowMaster(SocketAddr),
    SelectDeputy,
    RequestDemotion { to: SocketAddr },
    FinalizeDemotion,
    ReplaySteersLocally,
    Terminate(SessionEnd),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PendingDemotion {
    exit: bool,
}

#[derive(Debug, Clone)]
pub struct Membership {
    role: NodeRole,
    /// Remote master; `None` while this node is master itself.
    master: Option<SocketAddr>,
    deputy: Option<SocketAddr>,
    pending: Option<PendingDemotion>,
}

impl Membership {
    pub fn master_node() -> Self {
        Self {
            role: NodeRole::Master,
            master: None,
            deputy: None,
            pending: None,
        }
    }

    pub fn joining(master: SocketAddr, only_view: bool) -> Self {
        Self {
            role: if only_view {
                NodeRole::Viewer
            } else {
                NodeRole::Normal
            },
            master: Some(master),
            deputy: None,
            pending: None,
        }
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }

    pub fn master(&self) -> Option<SocketAddr> {
        self.master
    }

    pub fn deputy(&self) -> Option<SocketAddr> {
        self.deputy
    }

    pub fn set_deputy(&mut self, deputy: Option<SocketAddr>) {
        self.deputy = deputy;
    }

    #[cfg(test)]
    pub fn demotion_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn apply(&mut self, event: RoleEvent) -> Vec<RoleAction> {
        match event {
            RoleEvent::Joined { master } => {
                self.master = Some(master);
                Vec::new()
            }

            RoleEvent::MasterAnnounced { master } => {
                if self.is_master() || self.master == Some(master) {
                    return Vec::new();
                }
                self.master = Some(master);
                if self.deputy == Some(master) {
                    self.deputy = None;
                }
                vec![RoleAction::FollowMaster(master)]
            }

            RoleEvent::MasterLost { known_deputy } => match self.role {
                NodeRole::Master => Vec::new(),
                NodeRole::Deputy => {
                    self.role = NodeRole::Master;
                    self.master = None;
                    self.deputy = None;
                    vec![RoleAction::BecomeMaster]
                }
                NodeRole::Normal | NodeRole::Viewer => {
                    self.deputy = None;
                    match known_deputy {
                        Some(deputy) => {
                            self.master = Some(deputy);
                            vec![RoleAction::FollowMaster(deputy)]
                        }
                        None => {
                            self.master = None;
                            let mut actions = Vec::new();
                            if self.role == NodeRole::Normal {
                                actions.push(RoleAction::ReplaySteersLocally);
                            }
                            actions.push(RoleAction::Terminate(SessionEnd::MasterUnreachable));
                            actions
                        }
                    }
                }
            },

            RoleEvent::DeputyLost => {
                self.deputy = None;
                if self.is_master() {
                    vec![RoleAction::SelectDeputy]
                } else {
                    Vec::new()
                }
            }

            RoleEvent::AssignedRole(role) => {
                if role == self.role {
                    return Vec::new();
                }
                match role {
                    NodeRole::Master => {
                        self.role = NodeRole::Master;
                        self.master = None;
                        self.deputy = None;
                        vec![RoleAction::BecomeMaster]
                    }
                    // A master is only replaced through its own demotion.
                    _ if self.is_master() => Vec::new(),
                    _ => {
                        self.role = role;
                        Vec::new()
                    }
                }
            }

            RoleEvent::DemotionRequested { exit } => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.exit |= exit;
                    return Vec::new();
                }

                match self.role {
                    NodeRole::Viewer => {
                        if exit {
                            vec![RoleAction::Terminate(SessionEnd::Exited)]
                        } else {
                            Vec::new()
                        }
                    }
                    NodeRole::Master => match self.deputy {
                        Some(deputy) => {
                            self.pending = Some(PendingDemotion { exit });
                            vec![RoleAction::RequestDemotion { to: deputy }]
                        }
                        None => vec![RoleAction::Terminate(if exit {
                            SessionEnd::Exited
                        } else {
                            SessionEnd::NoHandoffTarget
                        })],
                    },
                    NodeRole::Normal | NodeRole::Deputy => match self.master {
                        Some(master) => {
                            self.pending = Some(PendingDemotion { exit });
                            vec![RoleAction::RequestDemotion { to: master }]
                        }
                        None => vec![RoleAction::Terminate(SessionEnd::MasterUnreachable)],
                    },
                }
            }

            RoleEvent::DemotionConfirmed => {
                let Some(pending) = self.pending.take() else {
                    return Vec::new();
                };

                let was_master = self.is_master();
                self.role = NodeRole::Viewer;
                let mut actions = vec![RoleAction::FinalizeDemotion];

                if was_master {
                    if let Some(deputy) = self.deputy.take() {
                        self.master = Some(deputy);
                        actions.push(RoleAction::FollowMaster(deputy));
                    }
                }
                if pending.exit {
                    actions.push(RoleAction::Terminate(SessionEnd::Exited));
                }
                actions
            }
        }
    }
}

/// First peer that may serve as deputy: anyone still playing who is not
/// the master. `candidates` should be in a stable order (by player id).
pub fn pick_deputy<I>(candidates: I) -> Option<SocketAddr>
where
    I: IntoIterator<Item = (SocketAddr, NodeRole)>,
{
    candidates
        .into_iter()
        .find(|(_, role)| matches!(role, NodeRole::Normal | NodeRole::Deputy))
        .map(|(addr, _)| addr)
}
