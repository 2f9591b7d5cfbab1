//! Tracking of programmed hardware configuration.
//!
//! Each configuration item remembers the value last programmed on the engine. A flush asks for
//! the values it needs; only items whose requested value differs from the programmed one (or
//! that were never programmed, or were explicitly dirtied) produce commands. The new values are
//! committed only once the submission carrying those commands succeeds, so a failed flush
//! leaves the items dirty for the next attempt.

use serde::Serialize;

use crate::command::{
    BaseAddresses, Command, ComputeModeConfig, FrontEndConfig, PipeControlFlags,
    PipelineSelectMode, PreemptionMode,
};

/// Last programmed value of a configuration item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProperty<T> {
    programmed: Option<T>,
    dirty: bool,
}

impl<T> Default for StreamProperty<T> {
    fn default() -> Self {
        Self {
            programmed: None,
            dirty: true,
        }
    }
}

impl<T: Copy + PartialEq> StreamProperty<T> {
    pub fn needs_emit(&self, value: T) -> bool {
        self.dirty || self.programmed != Some(value)
    }

    pub fn commit(&mut self, value: T) {
        self.programmed = Some(value);
        self.dirty = false;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn programmed(&self) -> Option<T> {
        self.programmed
    }
}

/// One-time setup pointing the engine at a resource. Re-armed when the resource moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OneShot {
    #[default]
    NotSent,
    Sent { address: u64 },
}

impl OneShot {
    pub fn needs_emit(&self, address: u64) -> bool {
        !matches!(self, OneShot::Sent { address: sent } if *sent == address)
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, OneShot::Sent { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateItem {
    PipelineSelect,
    ComputeMode,
    FrontEnd,
    StateBaseAddress,
    BindingTablePool,
    Preemption,
    Sip,
    SystemMemFence,
    RayTracing,
    WorkPartition,
}

/// Configuration a flush needs programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequiredState {
    pub pipeline_select: (PipelineSelectMode, bool),
    pub compute_mode: ComputeModeConfig,
    pub front_end: FrontEndConfig,
    /// `None` in heapless mode.
    pub state_base_address: Option<BaseAddresses>,
    pub binding_table_pool: Option<(u64, u32)>,
    pub preemption: PreemptionMode,
    pub sip_address: Option<u64>,
    pub system_mem_fence: Option<u64>,
    pub ray_tracing: Option<(u64, u32)>,
    pub work_partition: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateUpdate {
    PipelineSelect((PipelineSelectMode, bool)),
    ComputeMode(ComputeModeConfig),
    FrontEnd(FrontEndConfig),
    StateBaseAddress(BaseAddresses),
    BindingTablePool((u64, u32)),
    Preemption(PreemptionMode),
    Sip(u64),
    SystemMemFence(u64),
    RayTracing(u64),
    WorkPartition(u64),
}

impl StateUpdate {
    fn item(&self) -> StateItem {
        match self {
            StateUpdate::PipelineSelect(_) => StateItem::PipelineSelect,
            StateUpdate::ComputeMode(_) => StateItem::ComputeMode,
            StateUpdate::FrontEnd(_) => StateItem::FrontEnd,
            StateUpdate::StateBaseAddress(_) => StateItem::StateBaseAddress,
            StateUpdate::BindingTablePool(_) => StateItem::BindingTablePool,
            StateUpdate::Preemption(_) => StateItem::Preemption,
            StateUpdate::Sip(_) => StateItem::Sip,
            StateUpdate::SystemMemFence(_) => StateItem::SystemMemFence,
            StateUpdate::RayTracing(_) => StateItem::RayTracing,
            StateUpdate::WorkPartition(_) => StateItem::WorkPartition,
        }
    }
}

/// Commands to emit ahead of a payload, plus the state they establish once submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatePlan {
    pub commands: Vec<Command>,
    updates: Vec<StateUpdate>,
}

impl StatePlan {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn items(&self) -> impl Iterator<Item = StateItem> + '_ {
        self.updates.iter().map(StateUpdate::item)
    }

    pub fn byte_len(&self) -> usize {
        self.commands.iter().map(Command::byte_len).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HardwareState {
    pub pipeline_select: StreamProperty<(PipelineSelectMode, bool)>,
    pub compute_mode: StreamProperty<ComputeModeConfig>,
    pub front_end: StreamProperty<FrontEndConfig>,
    pub state_base_address: StreamProperty<BaseAddresses>,
    pub binding_table_pool: StreamProperty<(u64, u32)>,
    pub preemption: StreamProperty<PreemptionMode>,
    pub sip: OneShot,
    pub system_mem_fence: OneShot,
    pub ray_tracing: OneShot,
    pub work_partition: OneShot,
}

impl HardwareState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything must be reprogrammed, e.g. after the engine lost its context.
    pub fn mark_all_dirty(&mut self) {
        self.pipeline_select.mark_dirty();
        self.compute_mode.mark_dirty();
        self.front_end.mark_dirty();
        self.state_base_address.mark_dirty();
        self.binding_table_pool.mark_dirty();
        self.preemption.mark_dirty();
        self.sip = OneShot::NotSent;
        self.system_mem_fence = OneShot::NotSent;
        self.ray_tracing = OneShot::NotSent;
        self.work_partition = OneShot::NotSent;
    }

    pub fn plan(&self, required: &RequiredState) -> StatePlan {
        let mut plan = StatePlan::default();
        let push = |plan: &mut StatePlan, command: Command, update: StateUpdate| {
            tracing::trace!(item = ?update.item(), "programming hardware state");
            plan.commands.push(command);
            plan.updates.push(update);
        };

        if self.pipeline_select.needs_emit(required.pipeline_select) {
            let (mode, systolic) = required.pipeline_select;
            push(
                &mut plan,
                Command::PipelineSelect { mode, systolic },
                StateUpdate::PipelineSelect(required.pipeline_select),
            );
        }
        if self.compute_mode.needs_emit(required.compute_mode) {
            push(
                &mut plan,
                Command::StateComputeMode(required.compute_mode),
                StateUpdate::ComputeMode(required.compute_mode),
            );
        }
        if self.front_end.needs_emit(required.front_end) {
            push(
                &mut plan,
                Command::FrontEndState(required.front_end),
                StateUpdate::FrontEnd(required.front_end),
            );
        }
        if let Some(bases) = required.state_base_address {
            if self.state_base_address.needs_emit(bases) {
                if self.state_base_address.programmed().is_some() {
                    // Caches may hold state fetched through the old bases.
                    plan.commands.push(Command::PipeControl {
                        flags: PipeControlFlags::CS_STALL
                            | PipeControlFlags::DC_FLUSH
                            | PipeControlFlags::TEXTURE_CACHE_INVALIDATE,
                        post_sync: None,
                    });
                }
                push(
                    &mut plan,
                    Command::StateBaseAddress(bases),
                    StateUpdate::StateBaseAddress(bases),
                );
            }
        }
        if let Some(pool) = required.binding_table_pool {
            if self.binding_table_pool.needs_emit(pool) {
                push(
                    &mut plan,
                    Command::BindingTablePoolAlloc {
                        base: pool.0,
                        size: pool.1,
                    },
                    StateUpdate::BindingTablePool(pool),
                );
            }
        }
        if self.preemption.needs_emit(required.preemption) {
            push(
                &mut plan,
                Command::PreemptionControl {
                    mode: required.preemption,
                },
                StateUpdate::Preemption(required.preemption),
            );
        }
        if let Some(address) = required.sip_address {
            if self.sip.needs_emit(address) {
                push(&mut plan, Command::StateSip { address }, StateUpdate::Sip(address));
            }
        }
        if let Some(address) = required.system_mem_fence {
            if self.system_mem_fence.needs_emit(address) {
                push(
                    &mut plan,
                    Command::StateSystemMemFenceAddress { address },
                    StateUpdate::SystemMemFence(address),
                );
            }
        }
        if let Some((address, size)) = required.ray_tracing {
            if self.ray_tracing.needs_emit(address) {
                push(
                    &mut plan,
                    Command::RayTracingBuffer { address, size },
                    StateUpdate::RayTracing(address),
                );
            }
        }
        if let Some(address) = required.work_partition {
            if self.work_partition.needs_emit(address) {
                push(
                    &mut plan,
                    Command::WorkPartitionRegister { address },
                    StateUpdate::WorkPartition(address),
                );
            }
        }
        plan
    }

    /// Record the state established by a successfully submitted `plan`.
    pub fn commit(&mut self, plan: &StatePlan) {
        for update in &plan.updates {
            match *update {
                StateUpdate::PipelineSelect(v) => self.pipeline_select.commit(v),
                StateUpdate::ComputeMode(v) => self.compute_mode.commit(v),
                StateUpdate::FrontEnd(v) => self.front_end.commit(v),
                StateUpdate::StateBaseAddress(v) => self.state_base_address.commit(v),
                StateUpdate::BindingTablePool(v) => self.binding_table_pool.commit(v),
                StateUpdate::Preemption(v) => self.preemption.commit(v),
                StateUpdate::Sip(address) => self.sip = OneShot::Sent { address },
                StateUpdate::SystemMemFence(address) => {
                    self.system_mem_fence = OneShot::Sent { address }
                }
                StateUpdate::RayTracing(address) => self.ray_tracing = OneShot::Sent { address },
                StateUpdate::WorkPartition(address) => {
                    self.work_partition = OneShot::Sent { address }
                }
            }
        }
    }
}
