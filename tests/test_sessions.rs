// CLASSIFICATION: COMMUNITY
// Filename: test_sessions.rs v0.2
// Author: Lukas Bower
// Date Modified: 2027-03-07

use cohperf::context::{self, BrkEntry};
use cohperf::types::{ContextFlags, PerfmonError, RegFlags};
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

fn assert_classes_exclusive() {
    let (task, sys) = sessions::counts().unwrap();
    assert!(
        !(task > 0 && sys > 0),
        "per-task ({task}) and system-wide ({sys}) sessions coexist"
    );
}

#[test]
#[serial]
fn interleaved_lifecycles_never_mix_classes() {
    setup();
    for t in 1..=6 {
        tasks::register(t, 0).unwrap();
    }

    // a batch of per-task sessions
    let mut handles = Vec::new();
    for t in 1..=3 {
        let (h, _) = context::create(t, ContextFlags::empty(), None, 0, None).unwrap();
        handles.push(h);
        assert_classes_exclusive();
    }

    // system-wide is refused while any per-task session lives
    assert_eq!(
        context::create(4, ContextFlags::SYSTEM_WIDE, None, 0b1, None),
        Err(PerfmonError::Busy)
    );
    assert_classes_exclusive();

    // tear the per-task batch down one by one, retrying in between
    for h in handles {
        assert_eq!(
            context::create(4, ContextFlags::SYSTEM_WIDE, None, 0b1, None),
            Err(PerfmonError::Busy)
        );
        let ctx = context::get(h).unwrap();
        context::destroy(&ctx, 0).unwrap();
        assert_classes_exclusive();
    }

    // now the system-wide class gets in, one session per CPU
    let (h4, _) = context::create(4, ContextFlags::SYSTEM_WIDE, None, 0b1, None).unwrap();
    let (h5, _) = context::create(5, ContextFlags::SYSTEM_WIDE, None, 0b10, None).unwrap();
    assert_classes_exclusive();
    assert_eq!(
        context::create(6, ContextFlags::SYSTEM_WIDE, None, 0b10, None),
        Err(PerfmonError::Busy)
    );
    assert_eq!(
        context::create(6, ContextFlags::empty(), None, 0, None),
        Err(PerfmonError::Busy)
    );

    for h in [h4, h5] {
        let ctx = context::get(h).unwrap();
        context::destroy(&ctx, 0).unwrap();
        assert_classes_exclusive();
    }
    assert_eq!(sessions::counts().unwrap(), (0, 0));

    // the slate is clean for per-task again
    let (h, _) = context::create(6, ContextFlags::empty(), None, 0, None).unwrap();
    context::destroy(&context::get(h).unwrap(), 0).unwrap();
    setup();
}

#[test]
#[serial]
fn failed_create_rolls_the_slot_back() {
    setup();
    tasks::register(1, 0).unwrap();
    // sampling request too large for the memlock quota
    let spec = context::SamplingSpec {
        entries: u64::MAX / 2,
        pmd_mask: 1 << 4,
    };
    assert!(context::create(1, ContextFlags::empty(), None, 0, Some(spec)).is_err());
    assert_eq!(sessions::counts().unwrap(), (0, 0));
    // nothing left over: a fresh create works
    context::create(1, ContextFlags::empty(), None, 0, None).unwrap();
    setup();
}

#[test]
#[serial]
fn breakpoints_yield_to_an_external_debugger() {
    setup();
    tasks::register(1, 0).unwrap();
    let (h, _) = context::create(1, ContextFlags::empty(), None, 0, None).unwrap();
    let ctx = context::get(h).unwrap();
    context::enable(&ctx, 0).unwrap();

    sessions::note_external_debugger_attach().unwrap();
    let mut brks = [BrkEntry {
        index: 0,
        value: 0x4000_0000,
        flags: RegFlags::empty(),
    }];
    assert_eq!(
        context::write_breakpoints(&ctx, 0, true, &mut brks),
        Err(PerfmonError::Busy)
    );
    sessions::note_external_debugger_detach().unwrap();

    context::write_breakpoints(&ctx, 0, true, &mut brks).unwrap();
    // and the claim now blocks a debugger from attaching
    assert_eq!(
        sessions::note_external_debugger_attach(),
        Err(PerfmonError::Busy)
    );
    context::destroy(&ctx, 0).unwrap();
    sessions::note_external_debugger_attach().unwrap();
    setup();
}
