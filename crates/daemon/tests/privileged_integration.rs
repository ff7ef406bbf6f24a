// SPDX-License-Identifier: MIT

//! Integration tests that require a real kernel, root privileges, and (for
//! the second test) a real network interface — spec.md §8 scenarios 5
//! (classifier drop) and 6 (interface setup idempotency). These never run
//! under ordinary `cargo test`; they're left `#[ignore]`d for a privileged
//! CI lane, gated on a real daemon subprocess rather than run by default.

use traffic_limitd::ebpf_loader::LoadedClassifier;
use traffic_limitd::netlink;

/// spec.md §8 scenario 5: with `byte_rate=1` and a burst of 10 kB, packets
/// whose computed `next_avail_ts` lands beyond the 2-second drop horizon
/// must be dropped, and the rest spaced exactly 1e9 ns apart. The pacing
/// arithmetic itself is covered host-side by `traffic_limitd_ebpf_common`'s
/// unit tests; this test exercises the *loaded, attached* program against
/// real traffic, which needs a privileged host.
#[tokio::test]
#[ignore = "requires root and a loaded eBPF classifier"]
async fn classifier_drops_packets_beyond_the_drop_horizon() {
    let mut classifier = LoadedClassifier::load().expect("load classifier object");
    let _prog_fd = classifier.program_fd().expect("load classify_egress program");
    // Attaching to a veth pair, generating a 10kB burst, and inspecting
    // per-packet send timestamps requires a privileged harness outside this
    // crate's test process; left as a placeholder for that lane.
}

/// spec.md §8 scenario 6: running `configure_interfaces` twice in a row
/// against the same interface must leave the qdisc tree and filter list
/// identical (install-or-replace semantics).
#[tokio::test]
#[ignore = "requires root and a real network interface"]
async fn interface_setup_is_idempotent() {
    let (connection, handle, _) = rtnetlink::new_connection().expect("open netlink connection");
    tokio::spawn(connection);

    let ifaces = vec!["lo".to_string()];
    let classifier = LoadedClassifier::load().expect("load classifier object");
    let mut classifier = classifier;
    let prog_fd = classifier.program_fd().expect("load classify_egress program");

    netlink::configure_interfaces(&handle, &ifaces, prog_fd).await.expect("first configure");
    netlink::configure_interfaces(&handle, &ifaces, prog_fd).await.expect("second configure is a no-op");
}
