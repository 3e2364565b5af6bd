//! Shared test fixtures: a tiny statically-configured RTOS model.
//!
//! Real front ends recover syscall arguments from the compiled program; the
//! fixtures configure them per block name instead. `MiniKernel` registers
//! the create and comm syscalls of a generic queue/mutex RTOS and builds
//! instances straight from its configuration tables.

// Not every suite uses every fixture helper.
#![allow(dead_code)]

use fnv::FnvHashMap;
use sendero::cfg::{AbbId, Cfg};
use sendero::error::Result;
use sendero::instance::{CpuId, Instance, InstanceKind};
use sendero::os::{
    advance_past, CategorySet, OsModel, SyscallCategory, SyscallRegistry,
};
use sendero::state::State;
use tracing_subscriber::EnvFilter;

/// Route engine logs through the test harness; filter with `RUST_LOG`.
/// Safe to call from every test, only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What a create-syscall block produces.
#[derive(Debug, Clone)]
pub enum CreateSpec {
    Task {
        label: &'static str,
        entry: &'static str,
        priority: u32,
        autostart: bool,
        cpu: CpuId,
    },
    Isr {
        label: &'static str,
        entry: &'static str,
        priority: u32,
        cpu: CpuId,
    },
    Queue {
        label: &'static str,
    },
    Mutex {
        label: &'static str,
    },
    Alarm {
        label: &'static str,
        period: u64,
    },
}

pub struct MiniKernel {
    registry: SyscallRegistry<MiniKernel>,
    /// Block name -> what its create syscall produces.
    creations: FnvHashMap<String, CreateSpec>,
    /// Block name -> label of the instance its comm syscall targets.
    comm_targets: FnvHashMap<String, &'static str>,
}

impl MiniKernel {
    pub fn new() -> Self {
        let mut registry = SyscallRegistry::new();
        for name in [
            "sys_create_task",
            "sys_create_isr",
            "sys_create_queue",
            "sys_create_mutex",
            "sys_create_alarm",
        ] {
            registry.register(name, CategorySet::CREATE, Self::handle_create);
        }
        for name in [
            "sys_queue_send",
            "sys_queue_recv",
            "sys_mutex_lock",
            "sys_mutex_unlock",
        ] {
            registry.register(name, CategorySet::COMM, Self::handle_comm);
        }
        // Scheduler start must be observed by every analysis flavor.
        registry.register("sys_start_scheduler", CategorySet::EVERY, Self::handle_start);
        Self {
            registry,
            creations: FnvHashMap::default(),
            comm_targets: FnvHashMap::default(),
        }
    }

    pub fn creating(mut self, block: &str, spec: CreateSpec) -> Self {
        self.creations.insert(block.to_string(), spec);
        self
    }

    pub fn talking_to(mut self, block: &str, target: &'static str) -> Self {
        self.comm_targets.insert(block.to_string(), target);
        self
    }

    fn handle_create(
        model: &mut MiniKernel,
        cfg: &Cfg,
        block: AbbId,
        mut state: State,
    ) -> Result<Vec<State>> {
        let syscall = cfg.syscall_name(block).unwrap_or_default().to_string();
        if let Some(spec) = model.creations.get(cfg.block_name(block)) {
            let (label, kind, entry, cpu) = match spec {
                CreateSpec::Task {
                    label,
                    entry,
                    priority,
                    autostart,
                    cpu,
                } => (
                    *label,
                    InstanceKind::Task {
                        priority: *priority,
                        autostart: *autostart,
                        regular: true,
                    },
                    Some(*entry),
                    *cpu,
                ),
                CreateSpec::Isr {
                    label,
                    entry,
                    priority,
                    cpu,
                } => (
                    *label,
                    InstanceKind::Isr {
                        priority: *priority,
                    },
                    Some(*entry),
                    *cpu,
                ),
                CreateSpec::Queue { label } => {
                    (*label, InstanceKind::Queue { capacity: Some(8) }, None, 0)
                }
                CreateSpec::Mutex { label } => (*label, InstanceKind::Mutex, None, 0),
                CreateSpec::Alarm { label, period } => {
                    (*label, InstanceKind::Alarm { period: *period }, None, 0)
                }
            };
            // A later walk over a site already recorded in the shared graph
            // reuses the existing object.
            let existing = state
                .instances
                .iter()
                .find(|(_, inst)| inst.created_at == Some(block) && inst.label == label)
                .map(|(id, _)| id);
            let id = match existing {
                Some(id) => id,
                None => state.instances.add_instance(Instance {
                    label: label.to_string(),
                    kind,
                    cpu,
                    entry: entry.and_then(|e| cfg.function_by_name(e)),
                    created_at: Some(block),
                    source: cfg.block(block).source.clone(),
                    in_branch: state.branch,
                    in_loop: state.in_loop,
                    after_scheduler: state.scheduler_on,
                    unique: !(state.branch || state.in_loop),
                }),
            };
            if let Some(creator) = state.running {
                state
                    .instances
                    .add_edge(creator, id, &syscall, SyscallCategory::Create);
            }
        }
        Ok(advance_past(cfg, block, &state))
    }

    fn handle_comm(
        model: &mut MiniKernel,
        cfg: &Cfg,
        block: AbbId,
        mut state: State,
    ) -> Result<Vec<State>> {
        let syscall = cfg.syscall_name(block).unwrap_or_default().to_string();
        if let (Some(source), Some(&target_label)) = (
            state.running,
            model.comm_targets.get(cfg.block_name(block)),
        ) {
            if let Some(target) = state.instances.find_by_label(target_label) {
                state
                    .instances
                    .add_edge(source, target, &syscall, SyscallCategory::Comm);
            }
        }
        Ok(advance_past(cfg, block, &state))
    }

    fn handle_start(
        _model: &mut MiniKernel,
        cfg: &Cfg,
        block: AbbId,
        mut state: State,
    ) -> Result<Vec<State>> {
        state.scheduler_on = true;
        Ok(advance_past(cfg, block, &state))
    }
}

impl OsModel for MiniKernel {
    fn interpret(
        &mut self,
        cfg: &Cfg,
        block: AbbId,
        state: State,
        filter: CategorySet,
    ) -> Result<Vec<State>> {
        let registry = std::mem::take(&mut self.registry);
        let out = registry.dispatch(self, cfg, block, state, filter);
        self.registry = registry;
        out
    }

    fn syscall_categories(&self, name: &str) -> CategorySet {
        self.registry
            .categories_of(name)
            .unwrap_or(CategorySet::NONE)
    }
}
