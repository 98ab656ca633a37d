//! Per-device dependency reconciliation.
//!
//! Each tagged device runs a small state machine over the supervisor
//! bridge: load `device@<key>`, attach it to (or detach it from) the
//! anchor, then bring the set of `waits-for` edges from the pseudo-service
//! to the user services in line with the most recent observation. At most
//! one reconciliation per device is in flight; observations arriving in
//! the meantime coalesce into `next_deps` and only the latest state is
//! reconciled next.
//!
//! Completions arrive as FIFO replies on the bridge; the `OpCtx` queued
//! with each request says which step of which device's machine it
//! belongs to.

use crate::monitor::{Monitor, publish_presence};
use crate::sup::{DepType, Reply, Request, ServiceHandle, ServiceState, SupError, SupEvent};

/// Completion context for one in-flight supervisor request.
#[derive(Debug)]
pub(crate) enum OpCtx {
    /// `device@<key>` load.
    DevLoad { key: String },
    /// Anchor edge add/remove.
    DevDep { key: String },
    /// User service load; one chain of the current reconciliation.
    SubLoad {
        key: String,
        name: String,
        removal: bool,
    },
    /// User service edge add/remove.
    SubDep {
        key: String,
        handle: ServiceHandle,
        /// No wake follows; close the handle and end the chain.
        finish: bool,
    },
    /// User service wake; the chain continues at its start event.
    SubWake { key: String },
    /// User service handle release.
    SubClose { key: String, terminal: bool },
    /// Device pseudo-service handle release; fire and forget.
    DevClose,
}

impl Monitor {
    /// Drive the bridge until it has nothing more to deliver. Called
    /// unconditionally once per event-loop iteration so queued requests
    /// always leave the write buffer.
    pub fn pump_supervisor(&mut self) -> Result<(), SupError> {
        loop {
            let events = self.bridge.conn.dispatch()?;
            if events.is_empty() {
                return Ok(());
            }
            for event in events {
                self.handle_sup_event(event)?;
            }
        }
    }

    fn handle_sup_event(&mut self, event: SupEvent<OpCtx>) -> Result<(), SupError> {
        match event {
            SupEvent::ServiceEvent(handle, state) => self.on_service_event(handle, state),
            SupEvent::Reply(ctx, reply) => match ctx {
                OpCtx::DevLoad { key } => self.on_dev_load(key, reply),
                OpCtx::DevDep { key } => self.on_dev_dep(key, reply),
                OpCtx::SubLoad { key, name, removal } => {
                    self.on_sub_load(key, name, removal, reply)
                }
                OpCtx::SubDep {
                    key,
                    handle,
                    finish,
                } => self.on_sub_dep(key, handle, finish, reply),
                // the chain continues when the woken service reports a
                // state change
                OpCtx::SubWake { .. } => expect_ack(reply),
                OpCtx::SubClose { key, terminal } => {
                    expect_ack(reply)?;
                    if terminal {
                        self.chain_done(&key)?;
                    }
                    Ok(())
                }
                OpCtx::DevClose => expect_ack(reply),
            },
        }
    }

    /// Begin reconciling the most recent observation for `key`.
    ///
    /// The desired set is captured out of `next_deps` here, at the start:
    /// anything observed while this round is in flight lands in
    /// `next_deps` again and is picked up by the next round, so only
    /// whole observations are ever applied.
    pub(crate) fn start_reconciliation(&mut self, key: &str) -> Result<(), SupError> {
        let dev = self.table.get_mut(key).expect("reconciling device exists");
        dev.pending = false;
        dev.removal_in_flight = dev.removed;
        dev.processing = true;
        dev.pending_deps = std::mem::take(&mut dev.next_deps);
        let reload = dev.removal_in_flight;
        tracing::debug!("reconcile '{key}' (removal: {reload})");
        self.bridge.conn.send(
            &Request::Load {
                name: format!("device@{key}"),
                reload,
            },
            OpCtx::DevLoad {
                key: key.to_string(),
            },
        )
    }

    fn on_dev_load(&mut self, key: String, reply: Reply) -> Result<(), SupError> {
        match reply {
            Reply::Handle(handle, _) => {
                let anchor = self.bridge.anchor;
                let dev = self.table.get_mut(&key).expect("reconciling device exists");
                dev.device_handle = Some(handle);
                let request = if dev.removal_in_flight {
                    Request::RmDep {
                        from: anchor,
                        to: handle,
                        dep: DepType::WaitsFor,
                    }
                } else {
                    Request::AddDep {
                        from: anchor,
                        to: handle,
                        dep: DepType::WaitsFor,
                        enable: true,
                    }
                };
                self.bridge.conn.send(&request, OpCtx::DevDep { key })
            }
            Reply::NotFound => {
                // no pseudo-service definition; there is nothing to hang
                // dependencies off, so settle immediately
                tracing::warn!("service 'device@{key}' not found");
                self.finish_reconciliation(&key)
            }
            _ => Err(SupError::ReplyMismatch),
        }
    }

    fn on_dev_dep(&mut self, key: String, reply: Reply) -> Result<(), SupError> {
        expect_ack(reply)?;
        let dev = self.table.get_mut(&key).expect("reconciling device exists");
        let to_remove: Vec<String> = dev
            .current_deps
            .difference(&dev.pending_deps)
            .cloned()
            .collect();
        let to_add: Vec<String> = dev
            .pending_deps
            .difference(&dev.current_deps)
            .cloned()
            .collect();
        dev.pending_ops = to_remove.len() + to_add.len();
        if dev.pending_ops == 0 {
            return self.finish_reconciliation(&key);
        }
        for name in to_remove {
            self.bridge.conn.send(
                &Request::Load {
                    name: name.clone(),
                    reload: true,
                },
                OpCtx::SubLoad {
                    key: key.clone(),
                    name,
                    removal: true,
                },
            )?;
        }
        for name in to_add {
            self.bridge.conn.send(
                &Request::Load {
                    name: name.clone(),
                    reload: false,
                },
                OpCtx::SubLoad {
                    key: key.clone(),
                    name,
                    removal: false,
                },
            )?;
        }
        Ok(())
    }

    fn on_sub_load(
        &mut self,
        key: String,
        name: String,
        removal: bool,
        reply: Reply,
    ) -> Result<(), SupError> {
        match reply {
            Reply::NotFound => {
                // the user named a service that does not exist; skip it
                // and keep reconciling the rest
                tracing::warn!("service '{name}' not found, skipping");
                self.chain_done(&key)
            }
            Reply::Handle(handle, state) => {
                let dev = self.table.get(&key).expect("reconciling device exists");
                let Some(from) = dev.device_handle else {
                    debug_assert!(false, "service chain without a device handle");
                    return self.chain_done(&key);
                };
                // an already-started service needs no wake; neither does
                // an edge removal
                let finish = removal || state == ServiceState::Started;
                let request = if removal {
                    Request::RmDep {
                        from,
                        to: handle,
                        dep: DepType::WaitsFor,
                    }
                } else {
                    Request::AddDep {
                        from,
                        to: handle,
                        dep: DepType::WaitsFor,
                        enable: true,
                    }
                };
                self.bridge.conn.send(
                    &request,
                    OpCtx::SubDep {
                        key,
                        handle,
                        finish,
                    },
                )
            }
            _ => Err(SupError::ReplyMismatch),
        }
    }

    fn on_sub_dep(
        &mut self,
        key: String,
        handle: ServiceHandle,
        finish: bool,
        reply: Reply,
    ) -> Result<(), SupError> {
        expect_ack(reply)?;
        if finish {
            self.bridge.conn.send(
                &Request::Close(handle),
                OpCtx::SubClose {
                    key,
                    terminal: true,
                },
            )
        } else {
            // wake it so it starts even if the edge already existed, and
            // hold the handle until its state change comes back
            self.bridge.start_waits.insert(handle, key.clone());
            self.bridge
                .conn
                .send(&Request::Wake(handle), OpCtx::SubWake { key })
        }
    }

    fn on_service_event(
        &mut self,
        handle: ServiceHandle,
        _state: ServiceState,
    ) -> Result<(), SupError> {
        // only handles we are deliberately holding matter; anything else
        // is traffic for services we no longer track
        let Some(key) = self.bridge.start_waits.remove(&handle) else {
            return Ok(());
        };
        self.bridge.conn.send(
            &Request::Close(handle),
            OpCtx::SubClose {
                key,
                terminal: true,
            },
        )
    }

    fn chain_done(&mut self, key: &str) -> Result<(), SupError> {
        let dev = self.table.get_mut(key).expect("reconciling device exists");
        dev.pending_ops = dev.pending_ops.saturating_sub(1);
        if dev.pending_ops == 0 {
            return self.finish_reconciliation(key);
        }
        Ok(())
    }

    /// All chains settled: release the pseudo-service handle, announce
    /// the transition, promote the applied set, and immediately re-enter
    /// if observations queued up meanwhile.
    fn finish_reconciliation(&mut self, key: &str) -> Result<(), SupError> {
        let close_handle;
        let present;
        {
            let dev = self.table.get_mut(key).expect("reconciling device exists");
            close_handle = dev.device_handle.take();
            present = !dev.removal_in_flight;
            dev.current_deps = std::mem::take(&mut dev.pending_deps);
            dev.processing = false;
        }
        if let Some(handle) = close_handle {
            self.bridge
                .conn
                .send(&Request::Close(handle), OpCtx::DevClose)?;
        }
        publish_presence(&self.table, &mut self.subscribers, key, present);
        if self.table.get(key).is_some_and(|dev| dev.pending) {
            self.start_reconciliation(key)?;
        }
        Ok(())
    }
}

fn expect_ack(reply: Reply) -> Result<(), SupError> {
    match reply {
        Reply::Ack => Ok(()),
        _ => Err(SupError::ReplyMismatch),
    }
}
