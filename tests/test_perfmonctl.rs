// CLASSIFICATION: COMMUNITY
// Filename: test_perfmonctl.rs v0.4
// Author: Lukas Bower
// Date Modified: 2027-03-07

#![cfg(feature = "perfmon")]

use cohperf::context::{self, PmcEntry, PmdEntry, ReadEntry, PMC_PLM_TASK};
use cohperf::dispatch::{self, perfmonctl, Reply, Request};
use cohperf::types::{PerfmonError, RegFlags};
use cohperf::{config, hw, ownership, sessions, tasks};
use serial_test::serial;

fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
    context::reset();
    tasks::reset();
    ownership::reset();
    hw::reset_all();
    let _ = sessions::reset();
}

fn create_for(caller: u32) -> cohperf::ContextHandle {
    let reply = perfmonctl(
        caller,
        0,
        None,
        Request::CreateContext {
            flags: 0,
            notify_task: 0,
            cpu_mask: 0,
            sampling_entries: 0,
            sampling_pmd_mask: 0,
        },
    )
    .unwrap();
    match reply {
        Reply::Context { handle, sampling_addr } => {
            assert!(sampling_addr.is_none());
            handle
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

#[test]
#[serial]
fn get_features_reports_versions() {
    setup();
    match perfmonctl(1, 0, None, Request::GetFeatures).unwrap() {
        Reply::Features {
            protocol_version,
            sampling_version,
        } => {
            assert_eq!(protocol_version, config::PFM_VERSION);
            assert_eq!(sampling_version, config::PFM_SMPL_VERSION);
        }
        other => panic!("unexpected reply {other:?}"),
    }
    setup();
}

#[test]
#[serial]
fn set_debug_mode_round_trips() {
    setup();
    assert!(!dispatch::debug_mode());
    perfmonctl(1, 0, None, Request::SetDebugMode(true)).unwrap();
    assert!(dispatch::debug_mode());
    perfmonctl(1, 0, None, Request::SetDebugMode(false)).unwrap();
    assert!(!dispatch::debug_mode());
    setup();
}

#[test]
#[serial]
fn empty_batches_are_rejected() {
    setup();
    tasks::register(1, 0).unwrap();
    create_for(1);
    assert_eq!(
        perfmonctl(1, 0, None, Request::WriteDataRegisters(Vec::new())),
        Err(PerfmonError::InvalidArgument)
    );
    assert_eq!(
        perfmonctl(1, 0, None, Request::ReadDataRegisters(Vec::new())),
        Err(PerfmonError::InvalidArgument)
    );
    setup();
}

#[test]
#[serial]
fn full_command_sequence_round_trips() {
    setup();
    tasks::register(1, 0).unwrap();
    create_for(1);
    perfmonctl(1, 0, None, Request::Enable).unwrap();
    perfmonctl(
        1,
        0,
        None,
        Request::WriteControlRegisters(vec![PmcEntry {
            index: 4,
            value: PMC_PLM_TASK,
            flags: RegFlags::empty(),
        }]),
    )
    .unwrap();
    perfmonctl(
        1,
        0,
        None,
        Request::WriteDataRegisters(vec![PmdEntry {
            index: 4,
            value: 31337,
            long_reset: 0,
            short_reset: 0,
            reset_pmds: 0,
            flags: RegFlags::empty(),
        }]),
    )
    .unwrap();
    perfmonctl(1, 0, None, Request::Start).unwrap();
    assert!(hw::counting(0));
    perfmonctl(1, 0, None, Request::Stop).unwrap();
    assert!(!hw::counting(0));

    let reply = perfmonctl(
        1,
        0,
        None,
        Request::ReadDataRegisters(vec![ReadEntry {
            index: 4,
            ..ReadEntry::default()
        }]),
    )
    .unwrap();
    match reply {
        Reply::ReadRegisters(v) => assert_eq!(v[0].value, 31337),
        other => panic!("unexpected reply {other:?}"),
    }

    perfmonctl(1, 0, None, Request::DestroyContext).unwrap();
    assert_eq!(
        perfmonctl(1, 0, None, Request::Start),
        Err(PerfmonError::NotFound)
    );
    setup();
}

#[test]
#[serial]
fn partial_batch_reports_per_entry_errors() {
    setup();
    tasks::register(1, 0).unwrap();
    create_for(1);
    perfmonctl(1, 0, None, Request::Enable).unwrap();
    perfmonctl(
        1,
        0,
        None,
        Request::WriteControlRegisters(vec![PmcEntry {
            index: 4,
            value: PMC_PLM_TASK,
            flags: RegFlags::empty(),
        }]),
    )
    .unwrap();

    // pmd0 is reserved: the batch fails there and flags the rest
    let reply = perfmonctl(
        1,
        0,
        None,
        Request::WriteDataRegisters(vec![
            PmdEntry {
                index: 4,
                value: 11,
                long_reset: 0,
                short_reset: 0,
                reset_pmds: 0,
                flags: RegFlags::empty(),
            },
            PmdEntry {
                index: 0,
                value: 22,
                long_reset: 0,
                short_reset: 0,
                reset_pmds: 0,
                flags: RegFlags::empty(),
            },
            PmdEntry {
                index: 5,
                value: 33,
                long_reset: 0,
                short_reset: 0,
                reset_pmds: 0,
                flags: RegFlags::empty(),
            },
        ]),
    )
    .unwrap();
    match reply {
        Reply::DataRegisters(v) => {
            assert!(!v[0].flags.contains(RegFlags::ERROR));
            assert!(v[1].flags.contains(RegFlags::ERROR));
            assert!(v[2].flags.contains(RegFlags::ERROR));
        }
        other => panic!("unexpected reply {other:?}"),
    }
    // the prefix before the failure stayed applied
    assert_eq!(hw::read_pmd(0, 4).unwrap(), 11);
    setup();
}

#[test]
#[serial]
fn cross_task_target_must_be_quiescent() {
    setup();
    tasks::register(1, 0).unwrap();
    tasks::register(2, 0).unwrap();
    create_for(2);
    assert_eq!(
        perfmonctl(1, 0, Some(2), Request::Enable),
        Err(PerfmonError::Busy)
    );
    tasks::set_state(2, tasks::TaskState::Stopped).unwrap();
    perfmonctl(1, 0, Some(2), Request::Enable).unwrap();
    setup();
}

#[test]
#[serial]
fn cross_task_permission_checks() {
    setup();
    // caller uid 7 cannot signal a uid-9 task
    tasks::register(1, 7).unwrap();
    tasks::register(2, 9).unwrap();
    tasks::set_state(2, tasks::TaskState::Stopped).unwrap();
    create_for(2);
    assert_eq!(
        perfmonctl(1, 0, Some(2), Request::Enable),
        Err(PerfmonError::PermissionDenied)
    );
    // unknown target
    assert_eq!(
        perfmonctl(1, 0, Some(99), Request::Enable),
        Err(PerfmonError::NotFound)
    );
    setup();
}

#[test]
#[serial]
fn protected_context_rejects_outsiders() {
    setup();
    tasks::register(1, 0).unwrap();
    tasks::register(2, 0).unwrap();
    create_for(1);
    perfmonctl(1, 0, None, Request::Protect).unwrap();
    tasks::set_state(1, tasks::TaskState::Stopped).unwrap();
    assert_eq!(
        perfmonctl(2, 0, Some(1), Request::ReadDataRegisters(vec![ReadEntry::default()])),
        Err(PerfmonError::PermissionDenied)
    );
    // the creator itself is unaffected
    perfmonctl(1, 0, None, Request::Unprotect).unwrap();
    setup();
}

#[test]
#[serial]
fn target_without_context_is_not_found() {
    setup();
    tasks::register(1, 0).unwrap();
    tasks::register(2, 0).unwrap();
    tasks::set_state(2, tasks::TaskState::Stopped).unwrap();
    assert_eq!(
        perfmonctl(1, 0, Some(2), Request::Start),
        Err(PerfmonError::NotFound)
    );
    setup();
}

#[test]
#[serial]
fn create_rejects_unknown_flag_bits() {
    setup();
    tasks::register(1, 0).unwrap();
    assert_eq!(
        perfmonctl(
            1,
            0,
            None,
            Request::CreateContext {
                flags: 1 << 30,
                notify_task: 0,
                cpu_mask: 0,
                sampling_entries: 0,
                sampling_pmd_mask: 0,
            },
        ),
        Err(PerfmonError::InvalidArgument)
    );
    setup();
}
