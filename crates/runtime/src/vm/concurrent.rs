//! Structured concurrency: `SCOPE` and `SELECT`
//!
//! A `scope` spawns each task on its own OS thread running a fresh VM.
//! The child sees a transfer-cloned snapshot of the parent's globals and
//! shares only the channel table (and module registry); fluid state never
//! crosses the boundary. The scope joins every spawn before the sync
//! body runs on the parent, so the sync result is ordered after all
//! spawned effects.
//!
//! `select` evaluates each arm's channel/timeout expression once, then
//! polls the channel arms in order with a short park between rounds
//! until one is ready, a timeout fires, or the default arm applies.

use super::Vm;
use crate::phase_ops::deep_clone_for_transfer;
use lattice_core::chunk::Chunk;
use lattice_core::error::LatError;
use lattice_core::opcode::{SELECT_ARM_CHANNEL, SELECT_ARM_DEFAULT, SELECT_ARM_TIMEOUT};
use lattice_core::value::{ChannelData, LatValue, ValueKind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Pause between select polling rounds.
const SELECT_POLL_INTERVAL: Duration = Duration::from_millis(1);

impl Vm {
    pub(super) fn op_scope(&mut self, chunk: &Chunk) -> Result<(), LatError> {
        let spawn_count = self.read_u8(chunk) as usize;
        let _sync_const = self.read_u16(chunk);
        for _ in 0..spawn_count {
            // Prototype indexes for tooling; the closures (with their
            // captures) are on the stack.
            let _ = self.read_u16(chunk);
        }
        let spawns = self.stack.split_off(self.stack.len() - spawn_count);
        let sync = self.pop()?;
        trace!(spawn_count, "entering scope");

        let mut handles = Vec::with_capacity(spawns.len());
        for (index, spawn) in spawns.into_iter().enumerate() {
            self.close_open_captures(&spawn);
            let task = deep_clone_for_transfer(&spawn);
            let globals = self.snapshot_globals();
            let modules = self.modules.clone();
            let handle = std::thread::Builder::new()
                .name(format!("lattice-spawn-{}", index))
                .spawn(move || -> Result<(), LatValue> {
                    let mut vm = Vm::new().with_modules(modules);
                    for (name, value) in globals {
                        vm.globals.define(&name, value);
                    }
                    match vm.call_value_with(&task, Vec::new()) {
                        Ok(_) => Ok(()),
                        Err(err) => Err(deep_clone_for_transfer(&err.payload())),
                    }
                })
                .map_err(|e| LatError::internal(format!("failed to spawn task: {}", e)))?;
            handles.push(handle);
        }

        // Join everything before surfacing the first failure: a failed
        // spawn cancels the scope, but never leaves threads behind.
        let mut first_err: Option<LatError> = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => {
                    if first_err.is_none() {
                        first_err = Some(LatError::thrown(payload));
                    }
                }
                Err(_) => {
                    if first_err.is_none() {
                        first_err = Some(LatError::internal("spawned task panicked"));
                    }
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        let result = self.call_value_with(&sync, Vec::new())?;
        self.stack.push(result);
        Ok(())
    }

    /// Transfer-cloned snapshot of the globals frame for a child VM.
    fn snapshot_globals(&mut self) -> Vec<(String, LatValue)> {
        let names = self.globals.local_names();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Some(value) = self.globals.lookup(&name) {
                self.close_open_captures(&value);
                out.push((name, deep_clone_for_transfer(&value)));
            }
        }
        out
    }

    pub(super) fn op_select(&mut self, chunk: &Chunk) -> Result<(), LatError> {
        let arm_count = self.read_u8(chunk) as usize;
        let mut metas = Vec::with_capacity(arm_count);
        for _ in 0..arm_count {
            let kind = self.read_u8(chunk);
            let has_binding = self.read_u8(chunk) != 0;
            let _expr_const = self.read_u16(chunk);
            let _body_const = self.read_u16(chunk);
            metas.push((kind, has_binding));
        }
        let mut flat = self.stack.split_off(self.stack.len() - arm_count * 2);

        enum ArmReady {
            Channel(Arc<ChannelData>),
            Timeout(Instant),
            Default,
        }
        struct Arm {
            ready: ArmReady,
            has_binding: bool,
            body: LatValue,
            closed: bool,
        }

        let mut arms = Vec::with_capacity(arm_count);
        for (kind, has_binding) in metas {
            let body = flat.remove(1);
            let expr = flat.remove(0);
            let ready = match kind {
                SELECT_ARM_CHANNEL => {
                    let value = self.call_value_with(&expr, Vec::new())?;
                    match &value.kind {
                        ValueKind::Channel(chan) => ArmReady::Channel(chan.clone()),
                        other => {
                            return Err(LatError::type_error(format!(
                                "select arm expects a channel, got {}",
                                other_name(other)
                            )))
                        }
                    }
                }
                SELECT_ARM_TIMEOUT => {
                    let value = self.call_value_with(&expr, Vec::new())?;
                    let ms = match value.kind {
                        ValueKind::Int(n) if n >= 0 => n as u64,
                        _ => {
                            return Err(LatError::type_error(
                                "select timeout expects a non-negative int of milliseconds",
                            ))
                        }
                    };
                    ArmReady::Timeout(Instant::now() + Duration::from_millis(ms))
                }
                SELECT_ARM_DEFAULT => ArmReady::Default,
                other => {
                    return Err(LatError::internal(format!("bad select arm kind {}", other)))
                }
            };
            arms.push(Arm {
                ready,
                has_binding,
                body,
                closed: false,
            });
        }

        let mut first_round = true;
        loop {
            // Channel arms, in declaration order.
            for i in 0..arms.len() {
                let (received, closed) = match &arms[i].ready {
                    ArmReady::Channel(chan) => match chan.try_recv() {
                        Ok(Some(v)) => (Some(v), false),
                        Ok(None) => (None, false),
                        Err(_) => (None, true),
                    },
                    _ => (None, false),
                };
                if closed {
                    arms[i].closed = true;
                }
                if let Some(value) = received {
                    let args = if arms[i].has_binding {
                        vec![value]
                    } else {
                        Vec::new()
                    };
                    let body = arms[i].body.clone();
                    let result = self.call_value_with(&body, args)?;
                    self.stack.push(result);
                    return Ok(());
                }
            }

            if first_round {
                if let Some(arm) = arms
                    .iter()
                    .find(|a| matches!(a.ready, ArmReady::Default))
                {
                    let body = arm.body.clone();
                    let result = self.call_value_with(&body, Vec::new())?;
                    self.stack.push(result);
                    return Ok(());
                }
                first_round = false;
            }

            let now = Instant::now();
            if let Some(arm) = arms.iter().find(
                |a| matches!(a.ready, ArmReady::Timeout(deadline) if now >= deadline),
            ) {
                let body = arm.body.clone();
                let result = self.call_value_with(&body, Vec::new())?;
                self.stack.push(result);
                return Ok(());
            }

            let has_live_channel = arms.iter().any(|a| {
                matches!(a.ready, ArmReady::Channel(_)) && !a.closed
            });
            let has_timeout = arms
                .iter()
                .any(|a| matches!(a.ready, ArmReady::Timeout(_)));
            if !has_live_channel && !has_timeout {
                return Err(LatError::channel(
                    "select would block forever: all channels closed",
                ));
            }

            std::thread::sleep(SELECT_POLL_INTERVAL);
        }
    }
}

fn other_name(kind: &ValueKind) -> &'static str {
    LatValue::new(kind.clone()).type_name()
}
