//! Integration tests for the instance-graph and interaction builders
//!
//! # Test Coverage
//!
//! - Startup code creating tasks and a queue yields the full instance set
//! - Dynamically discovered task entry points get explored to a fixpoint
//! - Comm syscalls add labeled interaction edges between known instances
//! - Creation in branches, loops and duplicated entry symbols breaks
//!   uniqueness, transitively over create edges
//! - A creation site re-reached via a second call path breaks uniqueness
//! - The interaction pass adds nothing when nothing communicates, and
//!   refuses to run without an instance graph

mod common;

use common::{CreateSpec, MiniKernel};
use sendero::cfg::{AbbKind, Cfg};
use sendero::error::ExplorationError;
use sendero::instance::InstanceGraph;
use sendero::os::SyscallCategory;
use sendero::sse::{InstanceGraphBuilder, InteractionBuilder};

/// Startup code creating a queue and two tasks, then starting the
/// scheduler; the tasks talk through the queue.
fn producer_consumer_cfg() -> Cfg {
    let mut cfg = Cfg::new();
    let main = cfg.add_function("main");
    let cq = cfg.add_syscall_block(main, "main.0", "sys_create_queue");
    let ct1 = cfg.add_syscall_block(main, "main.1", "sys_create_task");
    let ct2 = cfg.add_syscall_block(main, "main.2", "sys_create_task");
    let go = cfg.add_syscall_block(main, "main.3", "sys_start_scheduler");
    let end = cfg.add_block(main, "main.4", AbbKind::Computation);
    cfg.mark_exit(end);
    cfg.add_local_edge(cq, ct1);
    cfg.add_local_edge(ct1, ct2);
    cfg.add_local_edge(ct2, go);
    cfg.add_local_edge(go, end);

    let producer = cfg.add_function("producer");
    let p0 = cfg.add_syscall_block(producer, "producer.0", "sys_queue_send");
    let p1 = cfg.add_block(producer, "producer.1", AbbKind::Computation);
    cfg.mark_exit(p1);
    cfg.add_local_edge(p0, p1);

    let consumer = cfg.add_function("consumer");
    let c0 = cfg.add_syscall_block(consumer, "consumer.0", "sys_queue_recv");
    let c1 = cfg.add_block(consumer, "consumer.1", AbbKind::Computation);
    cfg.mark_exit(c1);
    cfg.add_local_edge(c0, c1);

    cfg
}

fn producer_consumer_kernel() -> MiniKernel {
    MiniKernel::new()
        .creating("main.0", CreateSpec::Queue { label: "q" })
        .creating(
            "main.1",
            CreateSpec::Task {
                label: "producer",
                entry: "producer",
                priority: 2,
                autostart: true,
                cpu: 0,
            },
        )
        .creating(
            "main.2",
            CreateSpec::Task {
                label: "consumer",
                entry: "consumer",
                priority: 1,
                autostart: true,
                cpu: 0,
            },
        )
        .talking_to("producer.0", "q")
        .talking_to("consumer.0", "q")
}

#[test]
fn test_startup_code_yields_full_instance_set() {
    common::init_tracing();
    let cfg = producer_consumer_cfg();
    let mut os = producer_consumer_kernel();

    let mut builder = InstanceGraphBuilder::new(&cfg, &mut os);
    let runs = builder.run("main").unwrap();
    let instances = builder.into_instances();

    // main plus the two discovered task entry points.
    assert_eq!(runs.len(), 3);
    assert_eq!(instances.len(), 3);
    assert!(instances.find_by_label("q").is_some());
    let producer = instances.find_by_label("producer").unwrap();
    let consumer = instances.find_by_label("consumer").unwrap();
    // Unconditional creation before the scheduler: all unique.
    for (_, inst) in instances.iter() {
        assert!(inst.unique, "{} must be unique", inst.label);
        assert!(!inst.after_scheduler);
    }
    assert!(instances.get(producer).is_autostart());
    assert!(instances.get(consumer).is_autostart());
}

#[test]
fn test_interaction_pass_adds_comm_edges() {
    common::init_tracing();
    let cfg = producer_consumer_cfg();
    let mut os = producer_consumer_kernel();

    let mut builder = InstanceGraphBuilder::new(&cfg, &mut os);
    builder.run("main").unwrap();
    let instances = builder.into_instances();

    let mut interaction = InteractionBuilder::new(&cfg, &mut os, instances);
    interaction.run().unwrap();
    let instances = interaction.into_instances();

    let queue = instances.find_by_label("q").unwrap();
    let producer = instances.find_by_label("producer").unwrap();
    let consumer = instances.find_by_label("consumer").unwrap();

    let comm: Vec<_> = instances
        .edges()
        .iter()
        .filter(|e| e.category == SyscallCategory::Comm)
        .collect();
    assert_eq!(comm.len(), 2);
    assert!(comm
        .iter()
        .any(|e| e.source == producer && e.target == queue && e.label == "sys_queue_send"));
    assert!(comm
        .iter()
        .any(|e| e.source == consumer && e.target == queue && e.label == "sys_queue_recv"));
}

#[test]
fn test_creation_in_branch_is_not_unique() {
    common::init_tracing();
    // entry -> (create | skip) -> exit: the creation does not dominate the
    // exit, so the object may not exist at run time.
    let mut cfg = Cfg::new();
    let main = cfg.add_function("main");
    let entry = cfg.add_block(main, "main.0", AbbKind::Computation);
    let create = cfg.add_syscall_block(main, "main.1", "sys_create_mutex");
    let skip = cfg.add_block(main, "main.2", AbbKind::Computation);
    let exit = cfg.add_block(main, "main.3", AbbKind::Computation);
    cfg.mark_exit(exit);
    cfg.add_local_edge(entry, create);
    cfg.add_local_edge(entry, skip);
    cfg.add_local_edge(create, exit);
    cfg.add_local_edge(skip, exit);

    let mut os = MiniKernel::new().creating("main.1", CreateSpec::Mutex { label: "m" });
    let mut builder = InstanceGraphBuilder::new(&cfg, &mut os);
    builder.run("main").unwrap();
    let instances = builder.into_instances();

    let m = instances.find_by_label("m").unwrap();
    assert!(instances.get(m).in_branch);
    assert!(!instances.get(m).unique);
}

#[test]
fn test_creation_in_loop_is_not_unique() {
    common::init_tracing();
    let mut cfg = Cfg::new();
    let main = cfg.add_function("main");
    let entry = cfg.add_block(main, "main.0", AbbKind::Computation);
    let create = cfg.add_syscall_block(main, "main.1", "sys_create_queue");
    let exit = cfg.add_block(main, "main.2", AbbKind::Computation);
    cfg.mark_exit(exit);
    cfg.add_local_edge(entry, create);
    cfg.add_local_edge(create, exit);
    cfg.mark_loop(create);

    let mut os = MiniKernel::new().creating("main.1", CreateSpec::Queue { label: "q" });
    let mut builder = InstanceGraphBuilder::new(&cfg, &mut os);
    builder.run("main").unwrap();
    let instances = builder.into_instances();

    let q = instances.find_by_label("q").unwrap();
    assert!(instances.get(q).in_loop);
    assert!(!instances.get(q).unique);
}

#[test]
fn test_duplicate_entry_symbol_retags_both_tasks() {
    common::init_tracing();
    // Two tasks sharing one entry function: neither runs exactly once.
    let mut cfg = Cfg::new();
    let main = cfg.add_function("main");
    let c1 = cfg.add_syscall_block(main, "main.0", "sys_create_task");
    let c2 = cfg.add_syscall_block(main, "main.1", "sys_create_task");
    let end = cfg.add_block(main, "main.2", AbbKind::Computation);
    cfg.mark_exit(end);
    cfg.add_local_edge(c1, c2);
    cfg.add_local_edge(c2, end);

    let worker = cfg.add_function("worker");
    let w0 = cfg.add_block(worker, "worker.0", AbbKind::Computation);
    cfg.mark_exit(w0);

    let mut os = MiniKernel::new()
        .creating(
            "main.0",
            CreateSpec::Task {
                label: "worker_a",
                entry: "worker",
                priority: 1,
                autostart: true,
                cpu: 0,
            },
        )
        .creating(
            "main.1",
            CreateSpec::Task {
                label: "worker_b",
                entry: "worker",
                priority: 1,
                autostart: true,
                cpu: 0,
            },
        );
    let mut builder = InstanceGraphBuilder::new(&cfg, &mut os);
    builder.run("main").unwrap();
    let instances = builder.into_instances();

    let a = instances.find_by_label("worker_a").unwrap();
    let b = instances.find_by_label("worker_b").unwrap();
    assert!(!instances.get(a).unique);
    assert!(!instances.get(b).unique);
}

#[test]
fn test_transitive_retag_through_create_edges() {
    common::init_tracing();
    // A task created in a branch creates a queue from its own body: the
    // queue inherits the broken uniqueness through the create edge.
    let mut cfg = Cfg::new();
    let main = cfg.add_function("main");
    let entry = cfg.add_block(main, "main.0", AbbKind::Computation);
    let create = cfg.add_syscall_block(main, "main.1", "sys_create_task");
    let skip = cfg.add_block(main, "main.2", AbbKind::Computation);
    let end = cfg.add_block(main, "main.3", AbbKind::Computation);
    cfg.mark_exit(end);
    cfg.add_local_edge(entry, create);
    cfg.add_local_edge(entry, skip);
    cfg.add_local_edge(create, end);
    cfg.add_local_edge(skip, end);

    let spawner = cfg.add_function("spawner");
    let s0 = cfg.add_syscall_block(spawner, "spawner.0", "sys_create_queue");
    let s1 = cfg.add_block(spawner, "spawner.1", AbbKind::Computation);
    cfg.mark_exit(s1);
    cfg.add_local_edge(s0, s1);

    let mut os = MiniKernel::new()
        .creating(
            "main.1",
            CreateSpec::Task {
                label: "spawner",
                entry: "spawner",
                priority: 1,
                autostart: true,
                cpu: 0,
            },
        )
        .creating("spawner.0", CreateSpec::Queue { label: "inner_q" });
    let mut builder = InstanceGraphBuilder::new(&cfg, &mut os);
    builder.run("main").unwrap();
    let instances = builder.into_instances();

    let task = instances.find_by_label("spawner").unwrap();
    let q = instances.find_by_label("inner_q").unwrap();
    assert!(!instances.get(task).unique);
    // The queue creation itself is unconditional inside the task body; the
    // non-uniqueness comes from its creator.
    assert!(!instances.get(q).unique);
    assert!(instances
        .edges()
        .iter()
        .any(|e| e.source == task && e.target == q && e.category == SyscallCategory::Create));
}

#[test]
fn test_creation_site_reached_twice_is_not_unique() {
    common::init_tracing();
    // helper creates the worker task, and the worker body calls helper
    // again: the one creation site executes under two call paths, so the
    // task comes into being twice at run time.
    let mut cfg = Cfg::new();
    let main = cfg.add_function("main");
    let m0 = cfg.add_block(main, "main.0", AbbKind::Call);
    let m1 = cfg.add_block(main, "main.1", AbbKind::Computation);
    cfg.mark_exit(m1);
    cfg.add_local_edge(m0, m1);

    let helper = cfg.add_function("helper");
    let h0 = cfg.add_syscall_block(helper, "helper.0", "sys_create_task");
    let h1 = cfg.add_block(helper, "helper.1", AbbKind::Computation);
    cfg.mark_exit(h1);
    cfg.add_local_edge(h0, h1);

    let worker = cfg.add_function("worker");
    let w0 = cfg.add_block(worker, "worker.0", AbbKind::Call);
    let w1 = cfg.add_block(worker, "worker.1", AbbKind::Computation);
    cfg.mark_exit(w1);
    cfg.add_local_edge(w0, w1);

    cfg.add_call_edge(m0, helper);
    cfg.add_call_edge(w0, helper);

    let mut os = MiniKernel::new().creating(
        "helper.0",
        CreateSpec::Task {
            label: "w",
            entry: "worker",
            priority: 1,
            autostart: true,
            cpu: 0,
        },
    );
    let mut builder = InstanceGraphBuilder::new(&cfg, &mut os);
    builder.run("main").unwrap();
    let instances = builder.into_instances();

    // One instance: the model deduplicates the re-reached site.
    assert_eq!(instances.len(), 1);
    let w = instances.find_by_label("w").unwrap();
    assert!(!instances.get(w).unique);
}

#[test]
fn test_interaction_pass_without_comm_calls_adds_nothing() {
    common::init_tracing();
    // Startup creates a task but nothing communicates: the interaction
    // pass must leave the edge set untouched.
    let mut cfg = Cfg::new();
    let main = cfg.add_function("main");
    let ct = cfg.add_syscall_block(main, "main.0", "sys_create_task");
    let end = cfg.add_block(main, "main.1", AbbKind::Computation);
    cfg.mark_exit(end);
    cfg.add_local_edge(ct, end);

    let worker = cfg.add_function("worker");
    let w0 = cfg.add_block(worker, "worker.0", AbbKind::Computation);
    cfg.mark_exit(w0);

    let mut os = MiniKernel::new().creating(
        "main.0",
        CreateSpec::Task {
            label: "w",
            entry: "worker",
            priority: 1,
            autostart: true,
            cpu: 0,
        },
    );
    let mut builder = InstanceGraphBuilder::new(&cfg, &mut os);
    builder.run("main").unwrap();
    let instances = builder.into_instances();
    let edges_before = instances.edges().len();

    let mut interaction = InteractionBuilder::new(&cfg, &mut os, instances);
    interaction.run().unwrap();
    let instances = interaction.into_instances();

    assert_eq!(instances.edges().len(), edges_before);
    assert!(instances
        .edges()
        .iter()
        .all(|e| e.category != SyscallCategory::Comm));
}

#[test]
fn test_interaction_pass_requires_instances() {
    common::init_tracing();
    let cfg = producer_consumer_cfg();
    let mut os = producer_consumer_kernel();
    let mut interaction = InteractionBuilder::new(&cfg, &mut os, InstanceGraph::new());
    let err = interaction.run().unwrap_err();
    assert!(matches!(err, ExplorationError::MissingInstanceGraph));
}
