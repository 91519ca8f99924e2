// CLASSIFICATION: COMMUNITY
// Filename: test_fork_inherit.rs v0.3
// Author: Lukas Bower
// Date Modified: 2027-03-07

use cohperf::context::{self, PmcEntry, PmdEntry, ReadEntry, PMC_PLM_TASK};
use cohperf::types::{ContextFlags, InheritMode, PerfmonError, RegFlags};
use cohperf::{hw, ownership, sessions, tasks};
use serial_test::serial;

fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
    context::reset();
    tasks::reset();
    ownership::reset();
    hw::reset_all();
    let _ = sessions::reset();
}

fn read_one(ctx: &context::PfmContext, cpu: u32, index: usize) -> u64 {
    let mut r = [ReadEntry {
        index,
        ..ReadEntry::default()
    }];
    context::read_pmds(ctx, cpu, &mut r).unwrap();
    r[0].value
}

#[test]
#[serial]
fn no_inheritance_by_default() {
    setup();
    tasks::register(1, 0).unwrap();
    tasks::register(2, 0).unwrap();
    context::create(1, ContextFlags::empty(), None, 0, None).unwrap();
    assert_eq!(context::fork_inherit(1, 2).unwrap(), None);
    setup();
}

#[test]
#[serial]
fn inherit_once_stops_at_the_first_generation() {
    setup();
    tasks::register(1, 0).unwrap();
    tasks::register(2, 0).unwrap();
    tasks::register(3, 0).unwrap();
    context::create(1, ContextFlags::INHERIT_ONCE, None, 0, None).unwrap();

    let child = context::fork_inherit(1, 2).unwrap().expect("child context");
    let cctx = context::get(child).unwrap();
    assert_eq!(cctx.inherit_mode(), InheritMode::None);
    // the grandchild gets nothing
    assert_eq!(context::fork_inherit(2, 3).unwrap(), None);
    setup();
}

#[test]
#[serial]
fn inherit_all_spans_generations() {
    setup();
    tasks::register(1, 0).unwrap();
    tasks::register(2, 0).unwrap();
    tasks::register(3, 0).unwrap();
    context::create(1, ContextFlags::INHERIT_ALL, None, 0, None).unwrap();

    let child = context::fork_inherit(1, 2).unwrap().expect("child context");
    assert_eq!(
        context::get(child).unwrap().inherit_mode(),
        InheritMode::All
    );
    assert!(context::fork_inherit(2, 3).unwrap().is_some());
    assert_eq!(sessions::counts().unwrap(), (3, 0));
    setup();
}

#[test]
#[serial]
fn system_wide_contexts_stay_with_the_cpu() {
    setup();
    tasks::register(1, 0).unwrap();
    tasks::register(2, 0).unwrap();
    context::create(
        1,
        ContextFlags::SYSTEM_WIDE | ContextFlags::INHERIT_ALL,
        None,
        0b1,
        None,
    )
    .unwrap();
    assert_eq!(context::fork_inherit(1, 2).unwrap(), None);
    assert_eq!(sessions::counts().unwrap(), (0, 1));
    setup();
}

#[test]
#[serial]
fn unregistered_child_is_rejected() {
    setup();
    tasks::register(1, 0).unwrap();
    context::create(1, ContextFlags::INHERIT_ALL, None, 0, None).unwrap();
    assert_eq!(context::fork_inherit(1, 77), Err(PerfmonError::NotFound));
    setup();
}

#[test]
#[serial]
fn child_counters_restart_from_initial_values() {
    setup();
    tasks::register(1, 0).unwrap();
    tasks::register(2, 0).unwrap();
    let (h, _) =
        context::create(1, ContextFlags::INHERIT_ONCE, None, 0, None).unwrap();
    let pctx = context::get(h).unwrap();
    context::enable(&pctx, 0).unwrap();
    let mut pmcs = [PmcEntry {
        index: 4,
        value: PMC_PLM_TASK,
        flags: RegFlags::empty(),
    }];
    context::write_pmcs(&pctx, 0, &mut pmcs).unwrap();
    let mut pmds = [PmdEntry {
        index: 4,
        value: 100,
        long_reset: 0,
        short_reset: 0,
        reset_pmds: 0,
        flags: RegFlags::empty(),
    }];
    context::write_pmds(&pctx, 0, &mut pmds).unwrap();
    context::start(&pctx, 0).unwrap();
    assert!(!hw::tick(0, 4, 50).unwrap());

    let child = context::fork_inherit(1, 2).unwrap().expect("child context");
    let cctx = context::get(child).unwrap();

    // the parent keeps its accumulated count, the child starts over
    assert_eq!(read_one(&pctx, 0, 4), 150);
    assert_eq!(read_one(&cctx, 0, 4), 100);
    setup();
}

#[test]
#[serial]
fn sampling_storage_outlives_either_side() {
    setup();
    tasks::register(1, 0).unwrap();
    tasks::register(2, 0).unwrap();
    let spec = context::SamplingSpec {
        entries: 4,
        pmd_mask: 1 << 4,
    };
    let (h, addr) =
        context::create(1, ContextFlags::INHERIT_ONCE, None, 0, Some(spec)).unwrap();
    assert!(addr.is_some());
    let pctx = context::get(h).unwrap();
    let buf = pctx.sampling_buffer().unwrap().clone();

    let child = context::fork_inherit(1, 2).unwrap().expect("child context");
    let cctx = context::get(child).unwrap();

    // the child's teardown drops one reference but not the storage
    context::destroy(&cctx, 0).unwrap();
    assert!(!buf.storage_freed());

    // the parent's teardown takes the mapping and the last reference
    context::destroy(&pctx, 0).unwrap();
    assert!(buf.storage_freed());
    setup();
}

#[test]
#[serial]
fn notify_link_carries_over_and_dies_with_the_target() {
    setup();
    tasks::register(1, 0).unwrap();
    tasks::register(2, 0).unwrap();
    tasks::register(3, 0).unwrap();
    context::create(1, ContextFlags::INHERIT_ONCE, Some(3), 0, None).unwrap();

    let child = context::fork_inherit(1, 2).unwrap().expect("child context");
    let cctx = context::get(child).unwrap();
    assert_eq!(cctx.notify_task().unwrap(), Some(3));

    // the notify target exiting severs both links
    context::task_exit(3, 0).unwrap();
    assert_eq!(cctx.notify_task().unwrap(), None);
    let pctx = context::context_of(1).unwrap();
    assert_eq!(pctx.notify_task().unwrap(), None);
    assert!(!tasks::exists(3));
    setup();
}

#[test]
#[serial]
fn task_exit_tears_down_the_context() {
    setup();
    tasks::register(1, 0).unwrap();
    let (h, _) = context::create(1, ContextFlags::empty(), None, 0, None).unwrap();
    let ctx = context::get(h).unwrap();
    context::enable(&ctx, 0).unwrap();

    context::task_exit(1, 0).unwrap();
    assert!(context::get(h).is_none());
    assert!(!tasks::exists(1));
    assert_eq!(ownership::current_owner(0), None);
    assert_eq!(sessions::counts().unwrap(), (0, 0));
    setup();
}
