// CLASSIFICATION: COMMUNITY
// Filename: test_feature_gate.rs v0.1
// Author: Lukas Bower
// Date Modified: 2027-03-09

//! Run with `--no-default-features` to exercise the compiled-out path.

#![cfg(not(feature = "perfmon"))]

use cohperf::dispatch::{perfmonctl, Request};
use cohperf::types::PerfmonError;

#[test]
fn every_request_is_not_supported_when_compiled_out() {
    let requests = vec![
        Request::CreateContext {
            flags: 0,
            notify_task: 0,
            cpu_mask: 0,
            sampling_entries: 0,
            sampling_pmd_mask: 0,
        },
        Request::GetFeatures,
        Request::Start,
        Request::Restart,
        Request::DestroyContext,
        Request::SetDebugMode(true),
    ];
    for req in requests {
        assert_eq!(
            perfmonctl(1, 0, None, req),
            Err(PerfmonError::NotSupported)
        );
    }
}
